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

//! The room handle.
//!
//! A room is identified by its id *and* whether it is the Invite-state
//! entry: a room can exist in Invite state and in Join/Leave state at the
//! same time, as two separate objects. The registry in
//! [`Connection`](crate::Connection) owns both.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::RwLock,
};

use serde_json::{json, Value};
use tracing::debug;

use crate::{
    api::session::Capabilities,
    events::{load_room_event, load_state_event, AnyEvent, TagEvent},
    identifiers::{JoinState, RoomId, UserId},
    sync::{InvitedRoomUpdate, JoinedRoomUpdate, RoomSummary},
};

/// Megolm session rotation limits, read from the room's
/// `m.room.encryption` state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncryptionSettings {
    pub rotation_period_ms: u64,
    pub rotation_period_msgs: u64,
}

/// The membership of one user in a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    fn parse(s: &str) -> Option<Membership> {
        match s {
            "join" => Some(Membership::Join),
            "invite" => Some(Membership::Invite),
            "leave" => Some(Membership::Leave),
            "ban" => Some(Membership::Ban),
            "knock" => Some(Membership::Knock),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct RoomState {
    join_state: Option<JoinState>,
    // Raw state events, keyed by (type, state key). Kept verbatim so the
    // state cache can replay them.
    state_events: BTreeMap<(String, String), Value>,
    members: BTreeMap<UserId, Membership>,
    tags: BTreeMap<String, Option<f64>>,
    summary: RoomSummary,
    timeline: Vec<Value>,
    prev_batch: Option<String>,
    highlight_count: u64,
    notification_count: u64,
    upgrade_recommended: bool,
}

/// A room handle; shared, internally synchronized.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    invite_entry: bool,
    state: RwLock<RoomState>,
}

impl Room {
    pub(crate) fn new(id: RoomId, join_state: JoinState) -> Room {
        let invite_entry = join_state == JoinState::Invite;
        Room {
            id,
            invite_entry,
            state: RwLock::new(RoomState { join_state: Some(join_state), ..Default::default() }),
        }
    }

    /// The room identifier.
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Whether this object is the Invite-state registry entry for its id.
    pub fn is_invite_entry(&self) -> bool {
        self.invite_entry
    }

    /// The current join state.
    pub fn join_state(&self) -> JoinState {
        self.state.read().unwrap().join_state.unwrap_or(JoinState::Leave)
    }

    pub(crate) fn set_join_state(&self, join_state: JoinState) {
        self.state.write().unwrap().join_state = Some(join_state);
    }

    /// The canonical alias, if one is set.
    pub fn canonical_alias(&self) -> Option<String> {
        self.state_content_str("m.room.canonical_alias", "alias")
    }

    /// All published aliases: the canonical one plus alternatives.
    pub fn aliases(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        let mut aliases = Vec::new();
        if let Some(event) = state.state_events.get(&("m.room.canonical_alias".to_owned(), String::new()))
        {
            let content = &event["content"];
            if let Some(alias) = content.get("alias").and_then(Value::as_str) {
                if !alias.is_empty() {
                    aliases.push(alias.to_owned());
                }
            }
            if let Some(alts) = content.get("alt_aliases").and_then(Value::as_array) {
                aliases.extend(alts.iter().filter_map(Value::as_str).map(ToOwned::to_owned));
            }
        }
        aliases
    }

    /// The room's name, if one is set.
    pub fn name(&self) -> Option<String> {
        self.state_content_str("m.room.name", "name")
    }

    /// The room's topic, if one is set.
    pub fn topic(&self) -> Option<String> {
        self.state_content_str("m.room.topic", "topic")
    }

    /// The room version, from the creation event.
    pub fn version(&self) -> Option<String> {
        self.state_content_str("m.room.create", "room_version")
    }

    /// The room this one was upgraded from, if any.
    pub fn predecessor_id(&self) -> Option<RoomId> {
        let state = self.state.read().unwrap();
        state
            .state_events
            .get(&("m.room.create".to_owned(), String::new()))?
            .get("content")?
            .get("predecessor")?
            .get("room_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    }

    /// The room this one was upgraded to, if any.
    pub fn successor_id(&self) -> Option<RoomId> {
        self.state_content_str("m.room.tombstone", "replacement_room")
    }

    /// Whether the room state declares encryption. Once true, never false
    /// again.
    pub fn uses_encryption(&self) -> bool {
        self.state
            .read()
            .unwrap()
            .state_events
            .contains_key(&("m.room.encryption".to_owned(), String::new()))
    }

    /// The megolm rotation limits declared by the room state, for
    /// encrypted rooms.
    pub fn encryption_settings(&self) -> Option<EncryptionSettings> {
        let state = self.state.read().unwrap();
        let event = state.state_events.get(&("m.room.encryption".to_owned(), String::new()))?;
        let content = event.get("content")?;
        Some(EncryptionSettings {
            rotation_period_ms: content
                .get("rotation_period_ms")
                .and_then(Value::as_u64)
                .unwrap_or(604_800_000),
            rotation_period_msgs: content
                .get("rotation_period_msgs")
                .and_then(Value::as_u64)
                .unwrap_or(100),
        })
    }

    /// The room's history visibility setting.
    pub fn history_visibility(&self) -> Option<String> {
        self.state_content_str("m.room.history_visibility", "history_visibility")
    }

    /// The identifiers of all members in Join state.
    pub fn joined_member_ids(&self) -> Vec<UserId> {
        self.member_ids(Membership::Join)
    }

    /// The identifiers of all members in Invite state.
    pub fn invited_member_ids(&self) -> Vec<UserId> {
        self.member_ids(Membership::Invite)
    }

    fn member_ids(&self, membership: Membership) -> Vec<UserId> {
        self.state
            .read()
            .unwrap()
            .members
            .iter()
            .filter(|(_, m)| **m == membership)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// A total member count: the server summary when available, the local
    /// member list otherwise.
    pub fn total_member_count(&self) -> u64 {
        let state = self.state.read().unwrap();
        state
            .summary
            .joined_member_count
            .unwrap_or_else(|| state.members.values().filter(|m| **m == Membership::Join).count() as u64)
    }

    /// The tags applied to this room, with their ordering hints.
    pub fn tags(&self) -> BTreeMap<String, Option<f64>> {
        self.state.read().unwrap().tags.clone()
    }

    /// The names of the tags applied to this room.
    pub fn tag_names(&self) -> BTreeSet<String> {
        self.state.read().unwrap().tags.keys().cloned().collect()
    }

    /// The order hint of one tag, if the room carries it.
    pub fn tag_order(&self, tag: &str) -> Option<Option<f64>> {
        self.state.read().unwrap().tags.get(tag).copied()
    }

    /// The timeline events received so far, newest last. Timeline
    /// reconciliation is not this layer's business; events are kept in
    /// arrival order.
    pub fn timeline_events(&self) -> Vec<Value> {
        self.state.read().unwrap().timeline.clone()
    }

    pub(crate) fn add_timeline_event(&self, event: Value) {
        self.state.write().unwrap().timeline.push(event);
    }

    /// Unread counts from the last sync.
    pub fn unread_counts(&self) -> (u64, u64) {
        let state = self.state.read().unwrap();
        (state.notification_count, state.highlight_count)
    }

    /// Whether the server's capability snapshot makes this room's version
    /// look outdated.
    pub fn upgrade_recommended(&self) -> bool {
        self.state.read().unwrap().upgrade_recommended
    }

    /// Re-evaluates the upgrade recommendation against a fresh capability
    /// snapshot.
    pub(crate) fn check_version(&self, capabilities: &Capabilities) {
        let Some(versions) = &capabilities.room_versions else { return };
        let version = self.version().unwrap_or_else(|| "1".to_owned());
        let stable = versions.available.get(&version).map(String::as_str) == Some("stable");
        let mut state = self.state.write().unwrap();
        state.upgrade_recommended = !stable;
        if !stable {
            debug!(room_id = %self.id, version, "room version is unstable, recommending upgrade");
        }
    }

    fn state_content_str(&self, event_type: &str, key: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        state
            .state_events
            .get(&(event_type.to_owned(), String::new()))?
            .get("content")?
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
    }

    fn apply_state_event(state: &mut RoomState, json: &Value) {
        let loaded = load_state_event(json.clone());
        let (Some(event_type), Some(state_key)) = (
            json.get("type").and_then(Value::as_str),
            json.get("state_key").and_then(Value::as_str),
        ) else {
            return;
        };
        if let AnyEvent::RoomMember(member) = &loaded {
            if let Some(membership) = Membership::parse(member.membership()) {
                state.members.insert(member.user_id().to_owned(), membership);
            }
        }
        state.state_events.insert((event_type.to_owned(), state_key.to_owned()), json.clone());
    }

    /// Applies a joined/left room payload from sync. Returns the room's
    /// aliases before and after, so the registry can keep its alias map
    /// current.
    pub(crate) fn update_joined(&self, update: &JoinedRoomUpdate) -> (Vec<String>, Vec<String>) {
        let previous_aliases = self.aliases();
        {
            let mut state = self.state.write().unwrap();
            for event in &update.state.events {
                Self::apply_state_event(&mut state, event);
            }
            for event in &update.timeline.events {
                // State events can arrive through the timeline as well.
                if event.get("state_key").is_some() {
                    Self::apply_state_event(&mut state, event);
                }
                // Unknown event types are kept as generic room events.
                let loaded = load_room_event(event.clone(), None);
                state.timeline.push(loaded.full_json().clone());
            }
            if update.timeline.limited {
                state.prev_batch = update.timeline.prev_batch.clone();
            }
            for event in &update.account_data.events {
                if event.get("type").and_then(Value::as_str) == Some(TagEvent::TYPE_ID) {
                    if let AnyEvent::Tag(tags) = crate::events::load_event(event.clone()) {
                        state.tags = tags.tags();
                    }
                }
            }
            if update.summary.joined_member_count.is_some()
                || update.summary.invited_member_count.is_some()
                || !update.summary.heroes.is_empty()
            {
                state.summary = update.summary.clone();
            }
            state.highlight_count = update.unread_notifications.highlight_count;
            state.notification_count = update.unread_notifications.notification_count;
        }
        (previous_aliases, self.aliases())
    }

    /// Applies an invited room payload (stripped state only).
    pub(crate) fn update_invited(&self, update: &InvitedRoomUpdate) {
        let mut state = self.state.write().unwrap();
        for event in &update.invite_state.events {
            Self::apply_state_event(&mut state, event);
        }
    }

    /// Serializes the room to the shape of a sync payload, for the state
    /// cache.
    pub(crate) fn to_cache_json(&self) -> Value {
        let state = self.state.read().unwrap();
        let state_events: Vec<Value> = state.state_events.values().cloned().collect();
        let mut account_data = Vec::new();
        if !state.tags.is_empty() {
            let tags: serde_json::Map<String, Value> = state
                .tags
                .iter()
                .map(|(name, order)| {
                    let info = match order {
                        Some(order) => json!({ "order": order }),
                        None => json!({}),
                    };
                    (name.clone(), info)
                })
                .collect();
            account_data.push(json!({ "type": TagEvent::TYPE_ID, "content": { "tags": tags } }));
        }
        if self.invite_entry {
            json!({ "invite_state": { "events": state_events } })
        } else {
            json!({
                "state": { "events": state_events },
                "timeline": {
                    "events": state.timeline,
                    "limited": false,
                    "prev_batch": state.prev_batch,
                },
                "account_data": { "events": account_data },
                "summary": {
                    "m.heroes": state.summary.heroes,
                    "m.joined_member_count": state.summary.joined_member_count,
                    "m.invited_member_count": state.summary.invited_member_count,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn joined_update(value: Value) -> JoinedRoomUpdate {
        serde_json::from_value(value).unwrap()
    }

    fn member_event(user: &str, membership: &str) -> Value {
        json!({
            "type": "m.room.member",
            "event_id": format!("$m-{user}"),
            "sender": user,
            "state_key": user,
            "content": { "membership": membership }
        })
    }

    #[test]
    fn state_events_update_the_room() {
        let room = Room::new("!r:example.org".to_owned(), JoinState::Join);
        let (_, aliases) = room.update_joined(&joined_update(json!({
            "state": { "events": [
                { "type": "m.room.name", "state_key": "", "content": { "name": "Ops" } },
                { "type": "m.room.canonical_alias", "state_key": "",
                  "content": { "alias": "#ops:example.org", "alt_aliases": ["#ops2:example.org"] } },
                member_event("@alice:example.org", "join"),
                member_event("@bob:example.org", "invite"),
            ] }
        })));

        assert_eq!(room.name().as_deref(), Some("Ops"));
        assert_eq!(room.canonical_alias().as_deref(), Some("#ops:example.org"));
        assert_eq!(aliases, vec!["#ops:example.org", "#ops2:example.org"]);
        assert_eq!(room.joined_member_ids(), vec!["@alice:example.org"]);
        assert_eq!(room.invited_member_ids(), vec!["@bob:example.org"]);
    }

    #[test]
    fn encryption_state_is_one_way_and_carries_rotation() {
        let room = Room::new("!r:example.org".to_owned(), JoinState::Join);
        assert!(!room.uses_encryption());

        room.update_joined(&joined_update(json!({
            "state": { "events": [{
                "type": "m.room.encryption",
                "state_key": "",
                "content": {
                    "algorithm": "m.megolm.v1.aes-sha2",
                    "rotation_period_ms": 60_000u64,
                    "rotation_period_msgs": 10u64,
                }
            }] }
        })));

        assert!(room.uses_encryption());
        assert_eq!(
            room.encryption_settings(),
            Some(EncryptionSettings { rotation_period_ms: 60_000, rotation_period_msgs: 10 })
        );
    }

    #[test]
    fn upgrade_chain_fields_come_from_create_and_tombstone() {
        let room = Room::new("!new:example.org".to_owned(), JoinState::Join);
        room.update_joined(&joined_update(json!({
            "state": { "events": [
                { "type": "m.room.create", "state_key": "",
                  "content": { "room_version": "9",
                               "predecessor": { "room_id": "!old:example.org" } } },
                { "type": "m.room.tombstone", "state_key": "",
                  "content": { "body": "gone", "replacement_room": "!newer:example.org" } },
            ] }
        })));
        assert_eq!(room.predecessor_id().as_deref(), Some("!old:example.org"));
        assert_eq!(room.successor_id().as_deref(), Some("!newer:example.org"));
        assert_eq!(room.version().as_deref(), Some("9"));
    }

    #[test]
    fn cache_json_round_trips_through_a_sync_update() {
        let room = Room::new("!r:example.org".to_owned(), JoinState::Join);
        room.update_joined(&joined_update(json!({
            "state": { "events": [
                { "type": "m.room.name", "state_key": "", "content": { "name": "Ops" } },
                member_event("@alice:example.org", "join"),
            ] },
            "account_data": { "events": [
                { "type": "m.tag", "content": { "tags": { "m.favourite": { "order": 0.5 } } } }
            ] }
        })));

        let cached = room.to_cache_json();
        let restored = Room::new("!r:example.org".to_owned(), JoinState::Join);
        restored.update_joined(&serde_json::from_value(cached).unwrap());

        assert_eq!(restored.name(), room.name());
        assert_eq!(restored.joined_member_ids(), room.joined_member_ids());
        assert_eq!(restored.tags(), room.tags());
    }
}
