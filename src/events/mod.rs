// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The polymorphic event hierarchy.
//!
//! Every event is backed by its full JSON payload; typed accessors read out
//! of that payload, so serializing an event back to JSON is lossless even
//! for fields the library doesn't know about. Dispatch from a Matrix type
//! string to the right event type goes through the metatype registry in
//! [`registry`].

use serde_json::{json, Map, Value};

pub mod account_data;
pub mod call;
pub mod key_verification;
pub mod registry;
pub mod room;

pub use account_data::{DirectChatEvent, IgnoredUsersEvent, TagEvent, FAVOURITE_TAG, LOW_PRIORITY_TAG};
pub use call::{CallAnswerEvent, CallCandidatesEvent, CallHangupEvent, CallInviteEvent};
pub use key_verification::{
    KeyVerificationAcceptEvent, KeyVerificationCancelEvent, KeyVerificationDoneEvent,
    KeyVerificationKeyEvent, KeyVerificationMacEvent, KeyVerificationReadyEvent,
    KeyVerificationRequestEvent, KeyVerificationStartEvent,
};
pub use registry::{register_event_type, EventMetaType, TypeMatcher};
pub use room::{
    EncryptedEvent, MessageContent, RedactionEvent, RoomCanonicalAliasEvent, RoomCreateEvent,
    RoomEncryptionEvent, RoomHistoryVisibilityEvent, RoomKeyEvent, RoomMemberEvent,
    RoomMessageEvent, RoomNameEvent, RoomTombstoneEvent, RoomTopicEvent,
};

/// The base of the event hierarchy: a Matrix type string plus the full JSON
/// payload it arrived with.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    json: Value,
}

static EMPTY_OBJECT: once_cell::sync::Lazy<Map<String, Value>> =
    once_cell::sync::Lazy::new(Map::new);

impl Event {
    /// Wraps a full event JSON payload.
    pub fn from_json(json: Value) -> Event {
        Event { json }
    }

    /// Builds the minimal `{"type": …, "content": …}` payload.
    pub fn basic_json(event_type: &str, content: Value) -> Value {
        json!({ "type": event_type, "content": content })
    }

    /// Constructs an event of the given type with the given content.
    pub fn new(event_type: &str, content: Value) -> Event {
        Event { json: Event::basic_json(event_type, content) }
    }

    /// The Matrix type string of this event.
    pub fn matrix_type(&self) -> &str {
        self.json.get("type").and_then(Value::as_str).unwrap_or("")
    }

    /// The `content` object of this event.
    pub fn content(&self) -> &Map<String, Value> {
        self.json.get("content").and_then(Value::as_object).unwrap_or(&EMPTY_OBJECT)
    }

    /// The `content` object as a JSON value.
    pub fn content_json(&self) -> Value {
        self.json.get("content").cloned().unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// A string field of the content, if present.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content().get(key).and_then(Value::as_str)
    }

    /// The `unsigned` metadata object, if any.
    pub fn unsigned(&self) -> Option<&Map<String, Value>> {
        self.json.get("unsigned").and_then(Value::as_object)
    }

    /// The full event payload.
    pub fn full_json(&self) -> &Value {
        &self.json
    }

    /// Consumes the event, returning the payload.
    pub fn into_json(self) -> Value {
        self.json
    }
}

macro_rules! base_accessors {
    ($ty:ty) => {
        impl $ty {
            /// The underlying generic event.
            pub fn event(&self) -> &Event {
                &self.0
            }

            /// The Matrix type string.
            pub fn matrix_type(&self) -> &str {
                self.0.matrix_type()
            }

            /// The `content` object.
            pub fn content(&self) -> &Map<String, Value> {
                self.0.content()
            }

            /// The full event payload.
            pub fn full_json(&self) -> &Value {
                self.0.full_json()
            }
        }
    };
}

macro_rules! room_accessors {
    ($ty:ty) => {
        impl $ty {
            /// The event id, if the event came from a room timeline.
            pub fn event_id(&self) -> Option<&str> {
                self.event().full_json().get("event_id").and_then(Value::as_str)
            }

            /// The sender's user identifier.
            pub fn sender(&self) -> Option<&str> {
                self.event().full_json().get("sender").and_then(Value::as_str)
            }

            /// The origin server timestamp in milliseconds.
            pub fn origin_server_ts(&self) -> Option<u64> {
                self.event().full_json().get("origin_server_ts").and_then(Value::as_u64)
            }

            /// The room this event belongs to, where the server included it.
            pub fn room_id(&self) -> Option<&str> {
                self.event().full_json().get("room_id").and_then(Value::as_str)
            }

            /// The client-generated transaction id, echoed back in
            /// `unsigned` for our own events.
            pub fn transaction_id(&self) -> Option<&str> {
                self.event()
                    .unsigned()
                    .and_then(|u| u.get("transaction_id"))
                    .and_then(Value::as_str)
            }

            /// The redaction that removed this event, if any.
            pub fn redacted_because(&self) -> Option<&Value> {
                self.event().unsigned().and_then(|u| u.get("redacted_because"))
            }
        }
    };
}

pub(crate) use base_accessors;
pub(crate) use room_accessors;

/// A generic room event of a type the library has no specific class for.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomEvent(pub(crate) Event);
base_accessors!(RoomEvent);
room_accessors!(RoomEvent);

/// A generic state event of a type the library has no specific class for.
#[derive(Clone, Debug, PartialEq)]
pub struct StateEvent(pub(crate) Event);
base_accessors!(StateEvent);
room_accessors!(StateEvent);

impl StateEvent {
    /// Events with a `state_key` are state events; this is the validator
    /// the registry applies before treating a payload as one.
    pub(crate) fn is_valid(json: &Value) -> bool {
        json.get("state_key").is_some()
    }

    /// The state key of this event.
    pub fn state_key(&self) -> &str {
        self.0.full_json().get("state_key").and_then(Value::as_str).unwrap_or("")
    }
}

/// A generic `m.call.*` event of a concrete type the library doesn't model.
#[derive(Clone, Debug, PartialEq)]
pub struct CallEvent(pub(crate) Event);
base_accessors!(CallEvent);
room_accessors!(CallEvent);

impl CallEvent {
    pub(crate) fn is_valid(json: &Value) -> bool {
        json.get("content").and_then(|c| c.get("call_id")).is_some()
    }

    /// The identifier tying the events of one call together.
    pub fn call_id(&self) -> &str {
        self.0.content_str("call_id").unwrap_or("")
    }
}

/// A generic `m.key.verification.*` event.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyVerificationEvent(pub(crate) Event);
base_accessors!(KeyVerificationEvent);

impl KeyVerificationEvent {
    /// The transaction id of the verification flow this event belongs to.
    pub fn transaction_id(&self) -> &str {
        self.0.content_str("transaction_id").unwrap_or("")
    }
}

/// Any event the registry can produce, as a closed sum.
///
/// Events the registry has no specific entry for come out as the generic
/// [`StateEvent`], [`RoomEvent`] or [`Event`] variants, preserving their
/// JSON payload byte for byte.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyEvent {
    RoomMessage(RoomMessageEvent),
    RoomMember(RoomMemberEvent),
    RoomName(RoomNameEvent),
    RoomTopic(RoomTopicEvent),
    RoomCanonicalAlias(RoomCanonicalAliasEvent),
    RoomCreate(RoomCreateEvent),
    RoomTombstone(RoomTombstoneEvent),
    RoomEncryption(RoomEncryptionEvent),
    RoomHistoryVisibility(RoomHistoryVisibilityEvent),
    Encrypted(EncryptedEvent),
    Redaction(RedactionEvent),
    CallInvite(CallInviteEvent),
    CallCandidates(CallCandidatesEvent),
    CallAnswer(CallAnswerEvent),
    CallHangup(CallHangupEvent),
    Call(CallEvent),
    KeyVerificationRequest(KeyVerificationRequestEvent),
    KeyVerificationReady(KeyVerificationReadyEvent),
    KeyVerificationStart(KeyVerificationStartEvent),
    KeyVerificationAccept(KeyVerificationAcceptEvent),
    KeyVerificationKey(KeyVerificationKeyEvent),
    KeyVerificationMac(KeyVerificationMacEvent),
    KeyVerificationCancel(KeyVerificationCancelEvent),
    KeyVerificationDone(KeyVerificationDoneEvent),
    KeyVerification(KeyVerificationEvent),
    RoomKey(RoomKeyEvent),
    DirectChat(DirectChatEvent),
    IgnoredUsers(IgnoredUsersEvent),
    Tag(TagEvent),
    State(StateEvent),
    Room(RoomEvent),
    Basic(Event),
}

macro_rules! for_all_variants {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            AnyEvent::RoomMessage($inner) => $body,
            AnyEvent::RoomMember($inner) => $body,
            AnyEvent::RoomName($inner) => $body,
            AnyEvent::RoomTopic($inner) => $body,
            AnyEvent::RoomCanonicalAlias($inner) => $body,
            AnyEvent::RoomCreate($inner) => $body,
            AnyEvent::RoomTombstone($inner) => $body,
            AnyEvent::RoomEncryption($inner) => $body,
            AnyEvent::RoomHistoryVisibility($inner) => $body,
            AnyEvent::Encrypted($inner) => $body,
            AnyEvent::Redaction($inner) => $body,
            AnyEvent::CallInvite($inner) => $body,
            AnyEvent::CallCandidates($inner) => $body,
            AnyEvent::CallAnswer($inner) => $body,
            AnyEvent::CallHangup($inner) => $body,
            AnyEvent::Call($inner) => $body,
            AnyEvent::KeyVerificationRequest($inner) => $body,
            AnyEvent::KeyVerificationReady($inner) => $body,
            AnyEvent::KeyVerificationStart($inner) => $body,
            AnyEvent::KeyVerificationAccept($inner) => $body,
            AnyEvent::KeyVerificationKey($inner) => $body,
            AnyEvent::KeyVerificationMac($inner) => $body,
            AnyEvent::KeyVerificationCancel($inner) => $body,
            AnyEvent::KeyVerificationDone($inner) => $body,
            AnyEvent::KeyVerification($inner) => $body,
            AnyEvent::RoomKey($inner) => $body,
            AnyEvent::DirectChat($inner) => $body,
            AnyEvent::IgnoredUsers($inner) => $body,
            AnyEvent::Tag($inner) => $body,
            AnyEvent::State($inner) => $body,
            AnyEvent::Room($inner) => $body,
            AnyEvent::Basic($inner) => $body,
        }
    };
}

impl AnyEvent {
    /// The underlying generic event, whatever the concrete type.
    pub fn event(&self) -> &Event {
        for_all_variants!(self, inner => inner.inner())
    }

    /// The Matrix type string of this event.
    pub fn matrix_type(&self) -> &str {
        self.event().matrix_type()
    }

    /// The full JSON payload of this event.
    pub fn full_json(&self) -> &Value {
        self.event().full_json()
    }

    /// The `content` object of this event.
    pub fn content_json(&self) -> Value {
        self.event().content_json()
    }

    /// The sender of this event, where the payload carries one.
    pub fn sender(&self) -> Option<&str> {
        self.full_json().get("sender").and_then(Value::as_str)
    }

    /// The state key, if this is a state event.
    pub fn state_key(&self) -> Option<&str> {
        self.full_json().get("state_key").and_then(Value::as_str)
    }

    /// The event id, if this event came from a room timeline.
    pub fn event_id(&self) -> Option<&str> {
        self.full_json().get("event_id").and_then(Value::as_str)
    }
}

// A tiny helper trait so the macro above can reach field 0 of every
// concrete wrapper uniformly.
trait InnerEvent {
    fn inner(&self) -> &Event;
}

macro_rules! impl_inner_event {
    ($($ty:ty),* $(,)?) => {
        $(impl InnerEvent for $ty {
            fn inner(&self) -> &Event {
                &self.0
            }
        })*
    };
}

impl_inner_event!(
    RoomMessageEvent,
    RoomMemberEvent,
    RoomNameEvent,
    RoomTopicEvent,
    RoomCanonicalAliasEvent,
    RoomCreateEvent,
    RoomTombstoneEvent,
    RoomEncryptionEvent,
    RoomHistoryVisibilityEvent,
    EncryptedEvent,
    RedactionEvent,
    CallInviteEvent,
    CallCandidatesEvent,
    CallAnswerEvent,
    CallHangupEvent,
    CallEvent,
    KeyVerificationRequestEvent,
    KeyVerificationReadyEvent,
    KeyVerificationStartEvent,
    KeyVerificationAcceptEvent,
    KeyVerificationKeyEvent,
    KeyVerificationMacEvent,
    KeyVerificationCancelEvent,
    KeyVerificationDoneEvent,
    KeyVerificationEvent,
    RoomKeyEvent,
    DirectChatEvent,
    IgnoredUsersEvent,
    TagEvent,
    StateEvent,
    RoomEvent,
);

impl InnerEvent for Event {
    fn inner(&self) -> &Event {
        self
    }
}

/// Matching of [`AnyEvent`] values against an event class, the counterpart
/// of a dynamic `is<T>()` check. A value matches a class if it was loaded
/// through that class's metatype or through one derived from it.
pub trait EventClass {
    /// Whether the event belongs to this class.
    fn matches(event: &AnyEvent) -> bool;
}

/// Whether `event` was loaded as `T` or as a type derived from `T`.
pub fn is<T: EventClass>(event: &AnyEvent) -> bool {
    T::matches(event)
}

macro_rules! leaf_class {
    ($ty:ty, $variant:ident) => {
        impl EventClass for $ty {
            fn matches(event: &AnyEvent) -> bool {
                matches!(event, AnyEvent::$variant(_))
            }
        }
    };
}

leaf_class!(RoomMessageEvent, RoomMessage);
leaf_class!(RoomMemberEvent, RoomMember);
leaf_class!(RoomNameEvent, RoomName);
leaf_class!(RoomTopicEvent, RoomTopic);
leaf_class!(RoomCanonicalAliasEvent, RoomCanonicalAlias);
leaf_class!(RoomCreateEvent, RoomCreate);
leaf_class!(RoomTombstoneEvent, RoomTombstone);
leaf_class!(RoomEncryptionEvent, RoomEncryption);
leaf_class!(RoomHistoryVisibilityEvent, RoomHistoryVisibility);
leaf_class!(EncryptedEvent, Encrypted);
leaf_class!(RedactionEvent, Redaction);
leaf_class!(CallInviteEvent, CallInvite);
leaf_class!(CallCandidatesEvent, CallCandidates);
leaf_class!(CallAnswerEvent, CallAnswer);
leaf_class!(CallHangupEvent, CallHangup);
leaf_class!(KeyVerificationRequestEvent, KeyVerificationRequest);
leaf_class!(KeyVerificationReadyEvent, KeyVerificationReady);
leaf_class!(KeyVerificationStartEvent, KeyVerificationStart);
leaf_class!(KeyVerificationAcceptEvent, KeyVerificationAccept);
leaf_class!(KeyVerificationKeyEvent, KeyVerificationKey);
leaf_class!(KeyVerificationMacEvent, KeyVerificationMac);
leaf_class!(KeyVerificationCancelEvent, KeyVerificationCancel);
leaf_class!(KeyVerificationDoneEvent, KeyVerificationDone);
leaf_class!(RoomKeyEvent, RoomKey);
leaf_class!(DirectChatEvent, DirectChat);
leaf_class!(IgnoredUsersEvent, IgnoredUsers);
leaf_class!(TagEvent, Tag);

impl EventClass for StateEvent {
    fn matches(event: &AnyEvent) -> bool {
        matches!(
            event,
            AnyEvent::RoomMember(_)
                | AnyEvent::RoomName(_)
                | AnyEvent::RoomTopic(_)
                | AnyEvent::RoomCanonicalAlias(_)
                | AnyEvent::RoomCreate(_)
                | AnyEvent::RoomTombstone(_)
                | AnyEvent::RoomEncryption(_)
                | AnyEvent::RoomHistoryVisibility(_)
                | AnyEvent::State(_)
        )
    }
}

impl EventClass for CallEvent {
    fn matches(event: &AnyEvent) -> bool {
        matches!(
            event,
            AnyEvent::CallInvite(_)
                | AnyEvent::CallCandidates(_)
                | AnyEvent::CallAnswer(_)
                | AnyEvent::CallHangup(_)
                | AnyEvent::Call(_)
        )
    }
}

impl EventClass for KeyVerificationEvent {
    fn matches(event: &AnyEvent) -> bool {
        matches!(
            event,
            AnyEvent::KeyVerificationRequest(_)
                | AnyEvent::KeyVerificationReady(_)
                | AnyEvent::KeyVerificationStart(_)
                | AnyEvent::KeyVerificationAccept(_)
                | AnyEvent::KeyVerificationKey(_)
                | AnyEvent::KeyVerificationMac(_)
                | AnyEvent::KeyVerificationCancel(_)
                | AnyEvent::KeyVerificationDone(_)
                | AnyEvent::KeyVerification(_)
        )
    }
}

impl EventClass for RoomEvent {
    fn matches(event: &AnyEvent) -> bool {
        StateEvent::matches(event)
            || CallEvent::matches(event)
            || matches!(
                event,
                AnyEvent::RoomMessage(_)
                    | AnyEvent::Encrypted(_)
                    | AnyEvent::Redaction(_)
                    | AnyEvent::Room(_)
            )
    }
}

impl EventClass for Event {
    fn matches(_event: &AnyEvent) -> bool {
        true
    }
}

/// Loads any event from its JSON payload, dispatching through the registry.
///
/// Unknown but well-formed types come out as a generic event preserving the
/// original JSON.
pub fn load_event(json: Value) -> AnyEvent {
    registry::load(json, registry::BaseType::Event, None)
}

/// Loads a room (timeline) event from its JSON payload.
///
/// Like [`load_event`], but the fallback for unknown types is a generic
/// [`RoomEvent`], and only types derived from it are considered.
pub fn load_room_event(json: Value, room_version: Option<&str>) -> AnyEvent {
    registry::load(json, registry::BaseType::RoomEvent, room_version)
}

/// Loads a state event from its JSON payload.
pub fn load_state_event(json: Value) -> AnyEvent {
    registry::load(json, registry::BaseType::StateEvent, None)
}
