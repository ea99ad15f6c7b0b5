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

//! The model of a `/sync` response and the demultiplexing order its
//! consumers see.
//!
//! Within one iteration the consumers run in a fixed order: the encryption
//! subcomponent sees the whole response first, then to-device events, room
//! updates, account-data events and presence events, and finally the
//! encryption subcomponent gets to refresh outdated device lists.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::identifiers::{RoomId, UserId};

/// A list of raw events, as the server nests them under `events`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<Value>,
}

/// The `rooms` section of a sync response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: HashMap<RoomId, JoinedRoomUpdate>,
    #[serde(default)]
    pub invite: HashMap<RoomId, InvitedRoomUpdate>,
    #[serde(default)]
    pub leave: HashMap<RoomId, JoinedRoomUpdate>,
    #[serde(default)]
    pub knock: HashMap<RoomId, InvitedRoomUpdate>,
}

/// The payload for one joined (or left) room.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JoinedRoomUpdate {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub account_data: EventList,
    #[serde(default)]
    pub ephemeral: EventList,
    #[serde(default)]
    pub summary: RoomSummary,
    #[serde(default)]
    pub unread_notifications: UnreadNotifications,
}

/// The payload for one invited (or knocked-on) room; only stripped state.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InvitedRoomUpdate {
    #[serde(default)]
    pub invite_state: EventList,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub limited: bool,
    pub prev_batch: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoomSummary {
    #[serde(rename = "m.heroes", default)]
    pub heroes: Vec<UserId>,
    #[serde(rename = "m.joined_member_count")]
    pub joined_member_count: Option<u64>,
    #[serde(rename = "m.invited_member_count")]
    pub invited_member_count: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct UnreadNotifications {
    #[serde(default)]
    pub highlight_count: u64,
    #[serde(default)]
    pub notification_count: u64,
}

/// The users whose device lists changed since the last sync.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<UserId>,
    #[serde(default)]
    pub left: Vec<UserId>,
}

/// A complete response to a `/sync` request.
#[derive(Clone, Debug, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Rooms,
    #[serde(default)]
    pub presence: EventList,
    #[serde(default)]
    pub account_data: EventList,
    #[serde(default)]
    pub to_device: EventList,
    #[serde(default)]
    pub device_lists: DeviceLists,
    #[serde(default)]
    pub device_one_time_keys_count: HashMap<String, u64>,
}

impl SyncResponse {
    /// An empty response carrying only a sync token. Used when replaying
    /// the state cache.
    pub fn empty(next_batch: String) -> SyncResponse {
        SyncResponse {
            next_batch,
            rooms: Rooms::default(),
            presence: EventList::default(),
            account_data: EventList::default(),
            to_device: EventList::default(),
            device_lists: DeviceLists::default(),
            device_one_time_keys_count: HashMap::new(),
        }
    }
}

/// Settings of the sync loop.
#[derive(Clone, Copy, Debug)]
pub struct SyncSettings {
    /// The long-poll timeout passed to the server.
    pub timeout: std::time::Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings { timeout: std::time::Duration::from_secs(30) }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn minimal_response_parses() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s72595_4483_1934"
        }))
        .unwrap();
        assert_eq!(response.next_batch, "s72595_4483_1934");
        assert!(response.rooms.join.is_empty());
        assert!(response.to_device.events.is_empty());
    }

    #[test]
    fn full_response_sections_parse() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s1",
            "rooms": {
                "join": {
                    "!r:ex": {
                        "state": { "events": [{ "type": "m.room.name", "state_key": "",
                                                 "content": { "name": "A room" } }] },
                        "timeline": { "events": [], "limited": true, "prev_batch": "p1" },
                        "summary": { "m.heroes": ["@bob:ex"], "m.joined_member_count": 2 }
                    }
                },
                "invite": {
                    "!i:ex": { "invite_state": { "events": [] } }
                }
            },
            "device_lists": { "changed": ["@bob:ex"] },
            "device_one_time_keys_count": { "signed_curve25519": 49 }
        }))
        .unwrap();

        let joined = &response.rooms.join["!r:ex"];
        assert!(joined.timeline.limited);
        assert_eq!(joined.summary.joined_member_count, Some(2));
        assert!(response.rooms.invite.contains_key("!i:ex"));
        assert_eq!(response.device_lists.changed, vec!["@bob:ex"]);
        assert_eq!(response.device_one_time_keys_count["signed_curve25519"], 49);
    }
}
