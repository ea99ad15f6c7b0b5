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

//! Account-data event types.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};

use super::{base_accessors, Event};
use crate::identifiers::{RoomId, UserId};

/// The `m.direct` account-data event: which rooms are 1:1 chats with which
/// users.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectChatEvent(pub(crate) Event);
base_accessors!(DirectChatEvent);

impl DirectChatEvent {
    pub const TYPE_ID: &'static str = "m.direct";

    /// Builds the event from a user → rooms mapping.
    pub fn from_map(users_to_rooms: &BTreeMap<UserId, BTreeSet<RoomId>>) -> Event {
        let content: Map<String, Value> = users_to_rooms
            .iter()
            .map(|(user, rooms)| {
                (user.clone(), Value::Array(rooms.iter().map(|r| json!(r)).collect()))
            })
            .collect();
        Event::new(Self::TYPE_ID, Value::Object(content))
    }

    /// The user → direct-chat rooms mapping carried by this event.
    pub fn users_to_direct_chats(&self) -> BTreeMap<UserId, BTreeSet<RoomId>> {
        self.0
            .content()
            .iter()
            .map(|(user, rooms)| {
                let rooms = rooms
                    .as_array()
                    .map(|list| {
                        list.iter().filter_map(Value::as_str).map(ToOwned::to_owned).collect()
                    })
                    .unwrap_or_default();
                (user.clone(), rooms)
            })
            .collect()
    }
}

/// The `m.ignored_user_list` account-data event.
#[derive(Clone, Debug, PartialEq)]
pub struct IgnoredUsersEvent(pub(crate) Event);
base_accessors!(IgnoredUsersEvent);

impl IgnoredUsersEvent {
    pub const TYPE_ID: &'static str = "m.ignored_user_list";

    /// Builds the event from a set of ignored users.
    pub fn from_set(ignored: &BTreeSet<UserId>) -> Event {
        let users: Map<String, Value> =
            ignored.iter().map(|u| (u.clone(), json!({}))).collect();
        Event::new(Self::TYPE_ID, json!({ "ignored_users": users }))
    }

    /// The users ignored by this account.
    pub fn ignored_users(&self) -> BTreeSet<UserId> {
        self.0
            .content()
            .get("ignored_users")
            .and_then(Value::as_object)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// The per-room `m.tag` account-data event: tag name → ordering hint.
#[derive(Clone, Debug, PartialEq)]
pub struct TagEvent(pub(crate) Event);
base_accessors!(TagEvent);

/// The tag pinned first in tag-grouped room lists.
pub const FAVOURITE_TAG: &str = "m.favourite";
/// The tag pinned last in tag-grouped room lists.
pub const LOW_PRIORITY_TAG: &str = "m.lowpriority";

impl TagEvent {
    pub const TYPE_ID: &'static str = "m.tag";

    /// The tags applied to the room, with their user-specified order.
    pub fn tags(&self) -> BTreeMap<String, Option<f64>> {
        self.0
            .content()
            .get("tags")
            .and_then(Value::as_object)
            .map(|tags| {
                tags.iter()
                    .map(|(name, info)| {
                        (name.clone(), info.get("order").and_then(Value::as_f64))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::{load_event, AnyEvent};

    #[test]
    fn direct_chat_event_round_trips_its_map() {
        let mut map = BTreeMap::new();
        map.insert(
            "@bob:example.org".to_owned(),
            BTreeSet::from(["!r1:example.org".to_owned(), "!r2:example.org".to_owned()]),
        );
        let event = DirectChatEvent::from_map(&map);
        let AnyEvent::DirectChat(loaded) = load_event(event.into_json()) else {
            panic!("not a direct chat event")
        };
        assert_eq!(loaded.users_to_direct_chats(), map);
    }

    #[test]
    fn ignored_users_parse() {
        let event = load_event(json!({
            "type": "m.ignored_user_list",
            "content": { "ignored_users": { "@spam:example.org": {} } }
        }));
        let AnyEvent::IgnoredUsers(loaded) = event else { panic!("not an ignore list") };
        assert_eq!(loaded.ignored_users(), BTreeSet::from(["@spam:example.org".to_owned()]));
    }

    #[test]
    fn tags_carry_order() {
        let event = load_event(json!({
            "type": "m.tag",
            "content": { "tags": { "m.favourite": { "order": 0.25 }, "work": {} } }
        }));
        let AnyEvent::Tag(loaded) = event else { panic!("not a tag event") };
        let tags = loaded.tags();
        assert_eq!(tags.get("m.favourite"), Some(&Some(0.25)));
        assert_eq!(tags.get("work"), Some(&None));
    }
}
