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

//! Room timeline and state event types.

use serde_json::{Map, Value};

use super::{base_accessors, room_accessors, Event};

/// An `m.room.message` event.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomMessageEvent(pub(crate) Event);
base_accessors!(RoomMessageEvent);
room_accessors!(RoomMessageEvent);

/// The typed content block of an `m.room.message`, selected by `msgtype`.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageContent {
    Text { body: String, formatted_body: Option<String> },
    Emote { body: String },
    Notice { body: String },
    Image { body: String, url: Option<String> },
    File { body: String, url: Option<String> },
    Audio { body: String, url: Option<String> },
    Video { body: String, url: Option<String> },
    Location { body: String, geo_uri: String },
    /// A message with a `msgtype` the library has no specific block for.
    Unknown { msgtype: String, body: String },
}

impl RoomMessageEvent {
    pub const TYPE_ID: &'static str = "m.room.message";

    /// Builds a plain text message event payload.
    pub fn plain_text(body: &str) -> Event {
        Event::new(Self::TYPE_ID, serde_json::json!({ "msgtype": "m.text", "body": body }))
    }

    /// The `msgtype` of this message.
    pub fn msgtype(&self) -> &str {
        self.0.content_str("msgtype").unwrap_or("")
    }

    /// The fallback body of this message.
    pub fn body(&self) -> &str {
        self.0.content_str("body").unwrap_or("")
    }

    /// The typed content block of this message.
    pub fn message_content(&self) -> MessageContent {
        let body = self.body().to_owned();
        let url = self.0.content_str("url").map(ToOwned::to_owned);
        match self.msgtype() {
            "m.text" => MessageContent::Text {
                body,
                formatted_body: self.0.content_str("formatted_body").map(ToOwned::to_owned),
            },
            "m.emote" => MessageContent::Emote { body },
            "m.notice" => MessageContent::Notice { body },
            "m.image" => MessageContent::Image { body, url },
            "m.file" => MessageContent::File { body, url },
            "m.audio" => MessageContent::Audio { body, url },
            "m.video" => MessageContent::Video { body, url },
            "m.location" => MessageContent::Location {
                body,
                geo_uri: self.0.content_str("geo_uri").unwrap_or("").to_owned(),
            },
            other => MessageContent::Unknown { msgtype: other.to_owned(), body },
        }
    }
}

/// An `m.room.member` state event.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomMemberEvent(pub(crate) Event);
base_accessors!(RoomMemberEvent);
room_accessors!(RoomMemberEvent);

impl RoomMemberEvent {
    pub const TYPE_ID: &'static str = "m.room.member";

    /// The user this membership change applies to.
    pub fn user_id(&self) -> &str {
        self.0.full_json().get("state_key").and_then(Value::as_str).unwrap_or("")
    }

    /// The membership value: `join`, `invite`, `leave`, `ban` or `knock`.
    pub fn membership(&self) -> &str {
        self.0.content_str("membership").unwrap_or("")
    }

    /// The display name set with this membership, if any.
    pub fn display_name(&self) -> Option<&str> {
        self.0.content_str("displayname")
    }

    /// The avatar set with this membership, if any.
    pub fn avatar_url(&self) -> Option<&str> {
        self.0.content_str("avatar_url")
    }
}

macro_rules! simple_state_event {
    ($(#[$meta:meta])* $name:ident, $type_id:literal, $accessor:ident, $key:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name(pub(crate) Event);
        base_accessors!($name);
        room_accessors!($name);

        impl $name {
            pub const TYPE_ID: &'static str = $type_id;

            pub fn $accessor(&self) -> &str {
                self.0.content_str($key).unwrap_or("")
            }
        }
    };
}

simple_state_event!(
    /// An `m.room.name` state event.
    RoomNameEvent, "m.room.name", name, "name"
);
simple_state_event!(
    /// An `m.room.topic` state event.
    RoomTopicEvent, "m.room.topic", topic, "topic"
);
simple_state_event!(
    /// An `m.room.history_visibility` state event.
    RoomHistoryVisibilityEvent, "m.room.history_visibility",
    history_visibility, "history_visibility"
);

/// An `m.room.canonical_alias` state event.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomCanonicalAliasEvent(pub(crate) Event);
base_accessors!(RoomCanonicalAliasEvent);
room_accessors!(RoomCanonicalAliasEvent);

impl RoomCanonicalAliasEvent {
    pub const TYPE_ID: &'static str = "m.room.canonical_alias";

    /// The canonical alias, if one is set.
    pub fn alias(&self) -> Option<&str> {
        self.0.content_str("alias").filter(|a| !a.is_empty())
    }

    /// The published alternative aliases.
    pub fn alt_aliases(&self) -> Vec<String> {
        self.0
            .content()
            .get("alt_aliases")
            .and_then(Value::as_array)
            .map(|aliases| {
                aliases.iter().filter_map(Value::as_str).map(ToOwned::to_owned).collect()
            })
            .unwrap_or_default()
    }
}

/// An `m.room.create` state event; the first event of any room.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomCreateEvent(pub(crate) Event);
base_accessors!(RoomCreateEvent);
room_accessors!(RoomCreateEvent);

impl RoomCreateEvent {
    pub const TYPE_ID: &'static str = "m.room.create";

    /// The room version; `"1"` when the field is missing, per the spec.
    pub fn room_version(&self) -> &str {
        self.0.content_str("room_version").unwrap_or("1")
    }

    /// The room this one upgrades, for rooms created through an upgrade.
    pub fn predecessor_room_id(&self) -> Option<&str> {
        self.0
            .content()
            .get("predecessor")
            .and_then(|p| p.get("room_id"))
            .and_then(Value::as_str)
    }
}

/// An `m.room.tombstone` state event, closing a room in favour of its
/// successor.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomTombstoneEvent(pub(crate) Event);
base_accessors!(RoomTombstoneEvent);
room_accessors!(RoomTombstoneEvent);

impl RoomTombstoneEvent {
    pub const TYPE_ID: &'static str = "m.room.tombstone";

    /// The room replacing this one.
    pub fn successor_room_id(&self) -> &str {
        self.0.content_str("replacement_room").unwrap_or("")
    }

    /// The server-provided explanation.
    pub fn server_message(&self) -> &str {
        self.0.content_str("body").unwrap_or("")
    }
}

/// An `m.room.encryption` state event, switching a room to encrypted
/// operation. Once present, the switch is one-way.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomEncryptionEvent(pub(crate) Event);
base_accessors!(RoomEncryptionEvent);
room_accessors!(RoomEncryptionEvent);

impl RoomEncryptionEvent {
    pub const TYPE_ID: &'static str = "m.room.encryption";

    pub fn algorithm(&self) -> &str {
        self.0.content_str("algorithm").unwrap_or("")
    }

    /// How long an outbound megolm session may be used, in milliseconds.
    pub fn rotation_period_ms(&self) -> u64 {
        self.0.content().get("rotation_period_ms").and_then(Value::as_u64).unwrap_or(604_800_000)
    }

    /// How many messages an outbound megolm session may encrypt.
    pub fn rotation_period_msgs(&self) -> u64 {
        self.0.content().get("rotation_period_msgs").and_then(Value::as_u64).unwrap_or(100)
    }
}

/// An `m.room.encrypted` event, either in a room timeline (megolm) or as a
/// to-device message (olm).
#[derive(Clone, Debug, PartialEq)]
pub struct EncryptedEvent(pub(crate) Event);
base_accessors!(EncryptedEvent);
room_accessors!(EncryptedEvent);

impl EncryptedEvent {
    pub const TYPE_ID: &'static str = "m.room.encrypted";

    pub fn algorithm(&self) -> &str {
        self.0.content_str("algorithm").unwrap_or("")
    }

    /// The curve25519 key of the sending device.
    pub fn sender_key(&self) -> &str {
        self.0.content_str("sender_key").unwrap_or("")
    }

    /// The megolm session id, for megolm-encrypted events.
    pub fn session_id(&self) -> &str {
        self.0.content_str("session_id").unwrap_or("")
    }

    /// The megolm ciphertext, for megolm-encrypted events.
    pub fn ciphertext(&self) -> &str {
        self.0.content_str("ciphertext").unwrap_or("")
    }

    /// The per-recipient ciphertext map, for olm-encrypted events.
    pub fn ciphertext_for(&self, recipient_curve_key: &str) -> Option<&Map<String, Value>> {
        self.0
            .content()
            .get("ciphertext")
            .and_then(Value::as_object)?
            .get(recipient_curve_key)
            .and_then(Value::as_object)
    }
}

/// An `m.room.redaction` event.
#[derive(Clone, Debug, PartialEq)]
pub struct RedactionEvent(pub(crate) Event);
base_accessors!(RedactionEvent);
room_accessors!(RedactionEvent);

impl RedactionEvent {
    pub const TYPE_ID: &'static str = "m.room.redaction";

    /// The event being redacted.
    pub fn redacts(&self) -> &str {
        // Room v11 moved the field into content; check both places.
        self.0
            .full_json()
            .get("redacts")
            .and_then(Value::as_str)
            .or_else(|| self.0.content_str("redacts"))
            .unwrap_or("")
    }

    /// The optional reason for the redaction.
    pub fn reason(&self) -> Option<&str> {
        self.0.content_str("reason")
    }
}

/// An `m.room_key` to-device event, carrying a megolm session key. Only
/// ever received inside an olm-encrypted envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomKeyEvent(pub(crate) Event);
base_accessors!(RoomKeyEvent);

impl RoomKeyEvent {
    pub const TYPE_ID: &'static str = "m.room_key";

    pub fn algorithm(&self) -> &str {
        self.0.content_str("algorithm").unwrap_or("")
    }

    pub fn room_id(&self) -> &str {
        self.0.content_str("room_id").unwrap_or("")
    }

    pub fn session_id(&self) -> &str {
        self.0.content_str("session_id").unwrap_or("")
    }

    pub fn session_key(&self) -> &str {
        self.0.content_str("session_key").unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::{load_room_event, AnyEvent};

    #[test]
    fn message_content_dispatches_on_msgtype() {
        let event = load_room_event(
            json!({
                "type": "m.room.message",
                "event_id": "$1",
                "sender": "@alice:example.org",
                "content": { "msgtype": "m.image", "body": "cat.png", "url": "mxc://ex/123" }
            }),
            None,
        );
        let AnyEvent::RoomMessage(message) = event else { panic!("not a message event") };
        assert_eq!(
            message.message_content(),
            MessageContent::Image {
                body: "cat.png".to_owned(),
                url: Some("mxc://ex/123".to_owned())
            }
        );
    }

    #[test]
    fn tombstone_and_create_chain_fields() {
        let tombstone = RoomTombstoneEvent(Event::from_json(json!({
            "type": "m.room.tombstone",
            "state_key": "",
            "content": { "body": "upgraded", "replacement_room": "!new:ex" }
        })));
        assert_eq!(tombstone.successor_room_id(), "!new:ex");

        let create = RoomCreateEvent(Event::from_json(json!({
            "type": "m.room.create",
            "state_key": "",
            "content": { "room_version": "9", "predecessor": { "room_id": "!old:ex" } }
        })));
        assert_eq!(create.room_version(), "9");
        assert_eq!(create.predecessor_room_id(), Some("!old:ex"));
    }

    #[test]
    fn redacts_is_found_in_either_place() {
        let classic = RedactionEvent(Event::from_json(json!({
            "type": "m.room.redaction", "redacts": "$a", "content": {}
        })));
        assert_eq!(classic.redacts(), "$a");

        let v11 = RedactionEvent(Event::from_json(json!({
            "type": "m.room.redaction", "content": { "redacts": "$b" }
        })));
        assert_eq!(v11.redacts(), "$b");
    }
}
