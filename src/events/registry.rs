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

//! The metatype registry: maps a Matrix type string plus a JSON payload to
//! the right event type.
//!
//! The registry has two layers. Base metatypes ([`BaseType`]) describe the
//! abstract classes of the hierarchy and carry an optional validator (state
//! events require a `state_key`, call events a `call_id`). Leaf metatypes
//! ([`EventMetaType`]) pin a Matrix type pattern to a constructor. Loading
//! walks the leaves under the requested base, picks the most specific match
//! whose validators hold, and falls back to a generic event of the deepest
//! validating base otherwise.

use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde_json::Value;

use super::{
    AnyEvent, CallAnswerEvent, CallCandidatesEvent, CallEvent, CallHangupEvent, CallInviteEvent,
    DirectChatEvent, EncryptedEvent, Event, IgnoredUsersEvent, KeyVerificationAcceptEvent,
    KeyVerificationCancelEvent, KeyVerificationDoneEvent, KeyVerificationEvent,
    KeyVerificationKeyEvent, KeyVerificationMacEvent, KeyVerificationReadyEvent,
    KeyVerificationRequestEvent, KeyVerificationStartEvent, RedactionEvent,
    RoomCanonicalAliasEvent, RoomCreateEvent, RoomEncryptionEvent, RoomEvent,
    RoomHistoryVisibilityEvent, RoomKeyEvent, RoomMemberEvent, RoomMessageEvent, RoomNameEvent,
    RoomTombstoneEvent, RoomTopicEvent, StateEvent, TagEvent,
};

/// The abstract bases of the event hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaseType {
    Event,
    RoomEvent,
    StateEvent,
    CallEvent,
    KeyVerificationEvent,
}

impl BaseType {
    /// The inheritance chain from the root down to (and including) this
    /// base.
    pub fn chain(self) -> &'static [BaseType] {
        match self {
            BaseType::Event => &[BaseType::Event],
            BaseType::RoomEvent => &[BaseType::Event, BaseType::RoomEvent],
            BaseType::StateEvent => {
                &[BaseType::Event, BaseType::RoomEvent, BaseType::StateEvent]
            }
            BaseType::CallEvent => &[BaseType::Event, BaseType::RoomEvent, BaseType::CallEvent],
            BaseType::KeyVerificationEvent => {
                &[BaseType::Event, BaseType::KeyVerificationEvent]
            }
        }
    }

    fn validator(self) -> Option<fn(&Value) -> bool> {
        match self {
            BaseType::StateEvent => Some(StateEvent::is_valid),
            BaseType::CallEvent => Some(call_event_is_valid),
            BaseType::KeyVerificationEvent => Some(key_verification_is_valid),
            BaseType::Event | BaseType::RoomEvent => None,
        }
    }

    fn generic(self, event: Event) -> AnyEvent {
        match self {
            BaseType::Event => AnyEvent::Basic(event),
            BaseType::RoomEvent => AnyEvent::Room(RoomEvent(event)),
            BaseType::StateEvent => AnyEvent::State(StateEvent(event)),
            BaseType::CallEvent => AnyEvent::Call(CallEvent(event)),
            BaseType::KeyVerificationEvent => {
                AnyEvent::KeyVerification(KeyVerificationEvent(event))
            }
        }
    }
}

fn call_event_is_valid(json: &Value) -> bool {
    json.get("type").and_then(Value::as_str).is_some_and(|t| t.starts_with("m.call."))
        && CallEvent::is_valid(json)
}

fn key_verification_is_valid(json: &Value) -> bool {
    json.get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.starts_with("m.key.verification."))
}

/// How a leaf metatype matches Matrix type strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeMatcher {
    /// An exact Matrix type id, e.g. `m.room.message`.
    Exact(&'static str),
    /// A wildcard prefix, e.g. `m.call.`.
    Prefix(&'static str),
}

impl TypeMatcher {
    fn matches(self, event_type: &str) -> bool {
        match self {
            TypeMatcher::Exact(id) => event_type == id,
            TypeMatcher::Prefix(prefix) => event_type.starts_with(prefix),
        }
    }

    // Exact ids beat prefixes; among prefixes, the longest wins.
    fn specificity(self) -> usize {
        match self {
            TypeMatcher::Exact(_) => usize::MAX,
            TypeMatcher::Prefix(prefix) => prefix.len(),
        }
    }
}

/// A leaf metatype: a concrete event class and how to recognise and build
/// it from JSON.
#[derive(Clone)]
pub struct EventMetaType {
    /// The class name, unique across the registry.
    pub class_name: &'static str,
    /// The nearest abstract base of the class.
    pub base: BaseType,
    /// The Matrix type pattern the class is loaded from.
    pub matcher: TypeMatcher,
    /// An optional stricter payload predicate.
    pub is_valid: Option<fn(&Value) -> bool>,
    /// Room versions the class applies to; `None` means all.
    pub room_versions: Option<&'static [&'static str]>,
    /// Constructor from the raw event.
    pub construct: fn(Event) -> AnyEvent,
}

impl EventMetaType {
    fn same_as(&self, other: &EventMetaType) -> bool {
        self.class_name == other.class_name
            && self.base == other.base
            && self.matcher == other.matcher
            && self.is_valid.map(|f| f as usize) == other.is_valid.map(|f| f as usize)
            && self.room_versions == other.room_versions
            && self.construct as usize == other.construct as usize
    }
}

pub(crate) struct Registry {
    types: Vec<EventMetaType>,
}

impl Registry {
    fn with_defaults() -> Registry {
        let mut registry = Registry { types: Vec::new() };
        for meta in default_metatypes() {
            registry.register(meta);
        }
        registry
    }

    /// Registers a leaf metatype.
    ///
    /// Re-registering the exact same metatype is idempotent; registering a
    /// different metatype under an already-taken class name, or a second
    /// exact matcher for an already-claimed Matrix type, is a programming
    /// error and fatal.
    fn register(&mut self, meta: EventMetaType) {
        if let Some(existing) = self.types.iter().find(|t| t.class_name == meta.class_name) {
            assert!(
                existing.same_as(&meta),
                "duplicate registration of event class {} with a different metatype",
                meta.class_name
            );
            return;
        }
        if let TypeMatcher::Exact(id) = meta.matcher {
            assert!(
                !self.types.iter().any(
                    |t| t.matcher == TypeMatcher::Exact(id) && t.base.chain() == meta.base.chain()
                ),
                "Matrix type {id} is already registered to another event class"
            );
        }
        self.types.push(meta);
    }

    fn load(&self, json: Value, root: BaseType, room_version: Option<&str>) -> AnyEvent {
        let event_type = json.get("type").and_then(Value::as_str).unwrap_or("").to_owned();

        let mut best: Option<&EventMetaType> = None;
        'candidates: for meta in &self.types {
            if !meta.base.chain().contains(&root) || !meta.matcher.matches(&event_type) {
                continue;
            }
            if let (Some(versions), Some(v)) = (meta.room_versions, room_version) {
                if !versions.contains(&v) {
                    continue;
                }
            }
            for base in meta.base.chain() {
                if let Some(validator) = base.validator() {
                    if !validator(&json) {
                        continue 'candidates;
                    }
                }
            }
            if let Some(validator) = meta.is_valid {
                if !validator(&json) {
                    continue;
                }
            }
            if best.is_none_or(|b| meta.matcher.specificity() > b.matcher.specificity()) {
                best = Some(meta);
            }
        }
        if let Some(meta) = best {
            return (meta.construct)(Event::from_json(json));
        }

        // No leaf matched; produce a generic event of the deepest base under
        // the requested root whose validator accepts the payload, or of the
        // root itself.
        for base in
            [BaseType::StateEvent, BaseType::CallEvent, BaseType::KeyVerificationEvent]
        {
            if base != root
                && base.chain().contains(&root)
                && base.validator().is_some_and(|v| v(&json))
            {
                return base.generic(Event::from_json(json));
            }
        }
        root.generic(Event::from_json(json))
    }
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::with_defaults()));

/// Registers an additional leaf metatype with the global registry.
///
/// # Panics
///
/// Panics if a different metatype is already registered under the same
/// class name or the same exact Matrix type.
pub fn register_event_type(meta: EventMetaType) {
    REGISTRY.write().unwrap_or_else(|e| e.into_inner()).register(meta);
}

pub(crate) fn load(json: Value, root: BaseType, room_version: Option<&str>) -> AnyEvent {
    REGISTRY.read().unwrap_or_else(|e| e.into_inner()).load(json, root, room_version)
}

fn default_metatypes() -> Vec<EventMetaType> {
    vec![
        EventMetaType {
            class_name: "RoomMessageEvent",
            base: BaseType::RoomEvent,
            matcher: TypeMatcher::Exact(RoomMessageEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomMessage(RoomMessageEvent(e)),
        },
        EventMetaType {
            class_name: "EncryptedEvent",
            base: BaseType::RoomEvent,
            matcher: TypeMatcher::Exact(EncryptedEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::Encrypted(EncryptedEvent(e)),
        },
        EventMetaType {
            class_name: "RedactionEvent",
            base: BaseType::RoomEvent,
            matcher: TypeMatcher::Exact(RedactionEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::Redaction(RedactionEvent(e)),
        },
        EventMetaType {
            class_name: "RoomMemberEvent",
            base: BaseType::StateEvent,
            matcher: TypeMatcher::Exact(RoomMemberEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomMember(RoomMemberEvent(e)),
        },
        EventMetaType {
            class_name: "RoomNameEvent",
            base: BaseType::StateEvent,
            matcher: TypeMatcher::Exact(RoomNameEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomName(RoomNameEvent(e)),
        },
        EventMetaType {
            class_name: "RoomTopicEvent",
            base: BaseType::StateEvent,
            matcher: TypeMatcher::Exact(RoomTopicEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomTopic(RoomTopicEvent(e)),
        },
        EventMetaType {
            class_name: "RoomCanonicalAliasEvent",
            base: BaseType::StateEvent,
            matcher: TypeMatcher::Exact(RoomCanonicalAliasEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomCanonicalAlias(RoomCanonicalAliasEvent(e)),
        },
        EventMetaType {
            class_name: "RoomCreateEvent",
            base: BaseType::StateEvent,
            matcher: TypeMatcher::Exact(RoomCreateEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomCreate(RoomCreateEvent(e)),
        },
        EventMetaType {
            class_name: "RoomTombstoneEvent",
            base: BaseType::StateEvent,
            matcher: TypeMatcher::Exact(RoomTombstoneEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomTombstone(RoomTombstoneEvent(e)),
        },
        EventMetaType {
            class_name: "RoomEncryptionEvent",
            base: BaseType::StateEvent,
            matcher: TypeMatcher::Exact(RoomEncryptionEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomEncryption(RoomEncryptionEvent(e)),
        },
        EventMetaType {
            class_name: "RoomHistoryVisibilityEvent",
            base: BaseType::StateEvent,
            matcher: TypeMatcher::Exact(RoomHistoryVisibilityEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomHistoryVisibility(RoomHistoryVisibilityEvent(e)),
        },
        EventMetaType {
            class_name: "CallInviteEvent",
            base: BaseType::CallEvent,
            matcher: TypeMatcher::Exact(CallInviteEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::CallInvite(CallInviteEvent(e)),
        },
        EventMetaType {
            class_name: "CallCandidatesEvent",
            base: BaseType::CallEvent,
            matcher: TypeMatcher::Exact(CallCandidatesEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::CallCandidates(CallCandidatesEvent(e)),
        },
        EventMetaType {
            class_name: "CallAnswerEvent",
            base: BaseType::CallEvent,
            matcher: TypeMatcher::Exact(CallAnswerEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::CallAnswer(CallAnswerEvent(e)),
        },
        EventMetaType {
            class_name: "CallHangupEvent",
            base: BaseType::CallEvent,
            matcher: TypeMatcher::Exact(CallHangupEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::CallHangup(CallHangupEvent(e)),
        },
        EventMetaType {
            class_name: "KeyVerificationRequestEvent",
            base: BaseType::KeyVerificationEvent,
            matcher: TypeMatcher::Exact(KeyVerificationRequestEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::KeyVerificationRequest(KeyVerificationRequestEvent(e)),
        },
        EventMetaType {
            class_name: "KeyVerificationReadyEvent",
            base: BaseType::KeyVerificationEvent,
            matcher: TypeMatcher::Exact(KeyVerificationReadyEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::KeyVerificationReady(KeyVerificationReadyEvent(e)),
        },
        EventMetaType {
            class_name: "KeyVerificationStartEvent",
            base: BaseType::KeyVerificationEvent,
            matcher: TypeMatcher::Exact(KeyVerificationStartEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::KeyVerificationStart(KeyVerificationStartEvent(e)),
        },
        EventMetaType {
            class_name: "KeyVerificationAcceptEvent",
            base: BaseType::KeyVerificationEvent,
            matcher: TypeMatcher::Exact(KeyVerificationAcceptEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::KeyVerificationAccept(KeyVerificationAcceptEvent(e)),
        },
        EventMetaType {
            class_name: "KeyVerificationKeyEvent",
            base: BaseType::KeyVerificationEvent,
            matcher: TypeMatcher::Exact(KeyVerificationKeyEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::KeyVerificationKey(KeyVerificationKeyEvent(e)),
        },
        EventMetaType {
            class_name: "KeyVerificationMacEvent",
            base: BaseType::KeyVerificationEvent,
            matcher: TypeMatcher::Exact(KeyVerificationMacEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::KeyVerificationMac(KeyVerificationMacEvent(e)),
        },
        EventMetaType {
            class_name: "KeyVerificationCancelEvent",
            base: BaseType::KeyVerificationEvent,
            matcher: TypeMatcher::Exact(KeyVerificationCancelEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::KeyVerificationCancel(KeyVerificationCancelEvent(e)),
        },
        EventMetaType {
            class_name: "KeyVerificationDoneEvent",
            base: BaseType::KeyVerificationEvent,
            matcher: TypeMatcher::Exact(KeyVerificationDoneEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::KeyVerificationDone(KeyVerificationDoneEvent(e)),
        },
        EventMetaType {
            class_name: "RoomKeyEvent",
            base: BaseType::Event,
            matcher: TypeMatcher::Exact(RoomKeyEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::RoomKey(RoomKeyEvent(e)),
        },
        EventMetaType {
            class_name: "DirectChatEvent",
            base: BaseType::Event,
            matcher: TypeMatcher::Exact(DirectChatEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::DirectChat(DirectChatEvent(e)),
        },
        EventMetaType {
            class_name: "IgnoredUsersEvent",
            base: BaseType::Event,
            matcher: TypeMatcher::Exact(IgnoredUsersEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::IgnoredUsers(IgnoredUsersEvent(e)),
        },
        EventMetaType {
            class_name: "TagEvent",
            base: BaseType::Event,
            matcher: TypeMatcher::Exact(TagEvent::TYPE_ID),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::Tag(TagEvent(e)),
        },
    ]
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::{is, load_event, load_room_event};

    #[test]
    fn exact_type_dispatch() {
        let event = load_room_event(
            json!({
                "type": "m.room.message",
                "event_id": "$1",
                "sender": "@alice:example.org",
                "origin_server_ts": 1_432_735u64,
                "content": { "msgtype": "m.text", "body": "hi" }
            }),
            None,
        );
        assert!(is::<RoomMessageEvent>(&event));
        assert!(is::<RoomEvent>(&event));
        assert!(!is::<StateEvent>(&event));
    }

    #[test]
    fn state_events_need_a_state_key() {
        let with_key = load_room_event(
            json!({
                "type": "m.room.member",
                "event_id": "$1",
                "sender": "@alice:example.org",
                "state_key": "@alice:example.org",
                "content": { "membership": "join" }
            }),
            None,
        );
        assert!(is::<RoomMemberEvent>(&with_key));
        assert!(is::<StateEvent>(&with_key));

        // Without the state key the payload can't be a member event; it
        // degrades to a plain room event of the same Matrix type.
        let without_key = load_room_event(
            json!({
                "type": "m.room.member",
                "event_id": "$1",
                "sender": "@alice:example.org",
                "content": { "membership": "join" }
            }),
            None,
        );
        assert!(!is::<RoomMemberEvent>(&without_key));
        assert!(is::<RoomEvent>(&without_key));
        assert_eq!(without_key.matrix_type(), "m.room.member");
    }

    #[test]
    fn unknown_call_types_stay_call_events() {
        let event = load_room_event(
            json!({
                "type": "m.call.select_answer",
                "event_id": "$1",
                "sender": "@alice:example.org",
                "content": { "call_id": "c1", "selected_party_id": "p1" }
            }),
            None,
        );
        assert!(is::<CallEvent>(&event));
        assert!(matches!(event, AnyEvent::Call(_)));
    }

    #[test]
    fn unknown_types_load_as_generic_and_round_trip() {
        let json = json!({
            "type": "org.example.custom",
            "content": { "anything": [1, 2, 3], "nested": { "deep": true } }
        });
        let event = load_event(json.clone());
        assert!(matches!(event, AnyEvent::Basic(_)));
        assert_eq!(event.full_json(), &json);

        let reloaded = load_event(event.full_json().clone());
        assert_eq!(reloaded, event);
    }

    #[test]
    fn round_trip_is_stable_for_known_types() {
        let json = json!({
            "type": "m.room.message",
            "event_id": "$1",
            "sender": "@alice:example.org",
            "content": { "msgtype": "m.text", "body": "hi", "x-custom": "survives" }
        });
        let event = load_room_event(json, None);
        let reloaded = load_room_event(event.full_json().clone(), None);
        assert_eq!(reloaded, event);
        assert_eq!(reloaded.full_json()["content"]["x-custom"], "survives");
    }

    #[test]
    fn re_registering_the_same_metatype_is_idempotent() {
        let mut registry = Registry::with_defaults();
        let count = registry.types.len();
        for meta in default_metatypes() {
            registry.register(meta);
        }
        assert_eq!(registry.types.len(), count);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn conflicting_registration_is_fatal() {
        let mut registry = Registry::with_defaults();
        registry.register(EventMetaType {
            class_name: "ImpostorMessageEvent",
            base: BaseType::RoomEvent,
            matcher: TypeMatcher::Exact("m.room.message"),
            is_valid: None,
            room_versions: None,
            construct: |e| AnyEvent::Room(RoomEvent(e)),
        });
    }
}
