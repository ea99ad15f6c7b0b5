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

//! Direct-chat bookkeeping: three mutually consistent indices plus the
//! local deltas that haven't been acknowledged by the server yet.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::Connection;
use crate::{
    api::account::SetAccountDataRequest,
    error::{Error, Result},
    event_emitter::DirectChatsMap,
    events::DirectChatEvent,
    identifiers::{JoinState, JoinStates, RoomId, UserId},
    room::Room,
    user::User,
};

/// The direct-chats state of one connection. Invariant: an entry in any
/// of the three indices implies the matching entries in the other two.
#[derive(Default)]
pub(super) struct DirectChats {
    /// user id → rooms marked as direct chats with that user.
    user_to_rooms: BTreeMap<UserId, BTreeSet<RoomId>>,
    /// room id → user objects; the user-facing view.
    room_to_users: BTreeMap<RoomId, Vec<Arc<User>>>,
    /// room id → user ids; the id-level view.
    room_to_user_ids: BTreeMap<RoomId, BTreeSet<UserId>>,
    /// Local additions not yet acknowledged by the server.
    local_additions: BTreeSet<(UserId, RoomId)>,
    /// Local removals not yet acknowledged by the server.
    local_removals: BTreeSet<(UserId, RoomId)>,
}

impl DirectChats {
    fn contains(&self, user_id: &str, room_id: &str) -> bool {
        self.user_to_rooms.get(user_id).is_some_and(|rooms| rooms.contains(room_id))
    }

    fn insert(&mut self, user: &Arc<User>, room_id: &str) {
        self.user_to_rooms
            .entry(user.id().clone())
            .or_default()
            .insert(room_id.to_owned());
        let users = self.room_to_users.entry(room_id.to_owned()).or_default();
        if !users.iter().any(|u| u.id() == user.id()) {
            users.push(user.clone());
        }
        self.room_to_user_ids
            .entry(room_id.to_owned())
            .or_default()
            .insert(user.id().clone());
    }

    fn remove(&mut self, user_id: &str, room_id: &str) {
        if let Some(rooms) = self.user_to_rooms.get_mut(user_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                self.user_to_rooms.remove(user_id);
            }
        }
        if let Some(users) = self.room_to_users.get_mut(room_id) {
            users.retain(|u| u.id() != user_id);
            if users.is_empty() {
                self.room_to_users.remove(room_id);
            }
        }
        if let Some(ids) = self.room_to_user_ids.get_mut(room_id) {
            ids.remove(user_id);
            if ids.is_empty() {
                self.room_to_user_ids.remove(room_id);
            }
        }
    }

    fn as_map(&self) -> DirectChatsMap {
        self.user_to_rooms.clone()
    }
}

impl Connection {
    /// The direct-chats mapping: user → rooms flagged as 1:1 chats with
    /// that user.
    pub fn direct_chats(&self) -> DirectChatsMap {
        self.direct_chats.read().unwrap().as_map()
    }

    /// Whether the room is flagged as a direct chat with anyone.
    pub fn is_direct_chat(&self, room_id: &str) -> bool {
        self.direct_chats.read().unwrap().room_to_user_ids.contains_key(room_id)
    }

    /// The users a room is a direct chat with.
    pub fn direct_chat_users(&self, room: &Room) -> Vec<Arc<User>> {
        self.direct_chats
            .read()
            .unwrap()
            .room_to_users
            .get(room.id())
            .cloned()
            .unwrap_or_default()
    }

    /// The user ids a room is a direct chat with.
    pub fn direct_chat_member_ids(&self, room: &Room) -> Vec<UserId> {
        self.direct_chats
            .read()
            .unwrap()
            .room_to_user_ids
            .get(room.id())
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flags a room as a direct chat with a user; the change is queued
    /// for publication with the next account-data flush.
    pub async fn add_to_direct_chats(&self, room_id: &str, user_id: &str) {
        let Some(user) = self.user(user_id) else {
            warn!(user_id, "couldn't get a user object");
            return;
        };
        {
            let mut chats = self.direct_chats.write().unwrap();
            if chats.contains(user_id, room_id) {
                return;
            }
            chats.insert(&user, room_id);
            chats.local_additions.insert((user_id.to_owned(), room_id.to_owned()));
            debug!(room_id, user_id, "marked the room as a direct chat");
        }
        let additions: DirectChatsMap =
            BTreeMap::from([(user_id.to_owned(), BTreeSet::from([room_id.to_owned()]))]);
        self.events().on_direct_chats_changed(&additions, &Default::default()).await;
    }

    /// Unflags a room as a direct chat; with `user_id` unset, every user
    /// the room was flagged for.
    pub async fn remove_from_direct_chats(&self, room_id: &str, user_id: Option<&str>) {
        let removals: DirectChatsMap = {
            let mut chats = self.direct_chats.write().unwrap();
            let affected: Vec<UserId> = match user_id {
                Some(user_id) => {
                    if !chats.contains(user_id, room_id) {
                        return;
                    }
                    vec![user_id.to_owned()]
                }
                None => chats
                    .room_to_user_ids
                    .get(room_id)
                    .map(|ids| ids.iter().cloned().collect())
                    .unwrap_or_default(),
            };
            if affected.is_empty() {
                return;
            }
            let mut removals: DirectChatsMap = BTreeMap::new();
            for user in affected {
                chats.remove(&user, room_id);
                chats.local_removals.insert((user.clone(), room_id.to_owned()));
                removals.entry(user).or_default().insert(room_id.to_owned());
            }
            removals
        };
        self.events().on_direct_chats_changed(&Default::default(), &removals).await;
    }

    /// Reconciles the server's `m.direct` event with the local indices,
    /// preserving unacknowledged local changes.
    pub(super) async fn reconcile_direct_chats(
        &self,
        users_to_chats: &BTreeMap<UserId, BTreeSet<RoomId>>,
    ) {
        let (remote_additions, remote_removals) = {
            let mut chats = self.direct_chats.write().unwrap();

            // Entries the server dropped, unless we added them locally and
            // the server just hasn't seen that yet.
            let mut remote_removals: DirectChatsMap = BTreeMap::new();
            let current: Vec<(UserId, RoomId)> = chats
                .user_to_rooms
                .iter()
                .flat_map(|(user, rooms)| {
                    rooms.iter().map(move |room| (user.clone(), room.clone()))
                })
                .collect();
            for (user, room) in current {
                let on_server =
                    users_to_chats.get(&user).is_some_and(|rooms| rooms.contains(&room));
                let locally_added = chats.local_additions.contains(&(user.clone(), room.clone()));
                if !on_server && !locally_added {
                    chats.remove(&user, &room);
                    remote_removals.entry(user.clone()).or_default().insert(room.clone());
                    debug!(room_id = %room, user_id = %user, "no more a direct chat");
                }
            }
            // The server already performed these removals.
            chats.local_removals.retain(|(user, room)| {
                !remote_removals.get(user).is_some_and(|rooms| rooms.contains(room))
            });

            // Entries the server added, unless we removed them locally.
            let mut remote_additions: DirectChatsMap = BTreeMap::new();
            for (user_id, rooms) in users_to_chats {
                for room in rooms {
                    if chats.contains(user_id, room)
                        || chats.local_removals.contains(&(user_id.clone(), room.clone()))
                    {
                        continue;
                    }
                    let Some(user) = self.user(user_id) else {
                        warn!(user_id, "couldn't get a user object");
                        continue;
                    };
                    chats.insert(&user, room);
                    remote_additions.entry(user_id.clone()).or_default().insert(room.clone());
                    debug!(room_id = %room, user_id, "marked as a direct chat");
                }
            }
            // The server already has these additions.
            chats.local_additions.retain(|(user, room)| {
                !remote_additions.get(user).is_some_and(|rooms| rooms.contains(room))
            });

            (remote_additions, remote_removals)
        };

        if !remote_additions.is_empty() || !remote_removals.is_empty() {
            self.events()
                .on_direct_chats_changed(&remote_additions, &remote_removals)
                .await;
        }
    }

    /// Publishes the direct-chats map when local deltas are pending.
    pub(super) async fn flush_direct_chat_updates(&self) {
        let (pending, map) = {
            let mut chats = self.direct_chats.write().unwrap();
            let pending = !chats.local_additions.is_empty() || !chats.local_removals.is_empty();
            if pending {
                debug!(
                    removals = chats.local_removals.len(),
                    additions = chats.local_additions.len(),
                    "sending updated direct chats to the server"
                );
                chats.local_additions.clear();
                chats.local_removals.clear();
            }
            (pending, chats.as_map())
        };
        if !pending {
            return;
        }
        let Some(user_id) = self.user_id() else { return };

        let content: serde_json::Map<String, Value> = map
            .iter()
            .map(|(user, rooms)| {
                (user.clone(), Value::Array(rooms.iter().map(|r| json!(r)).collect()))
            })
            .collect();
        let result = self
            .http
            .send(
                SetAccountDataRequest {
                    user_id,
                    event_type: DirectChatEvent::TYPE_ID.to_owned(),
                    content: Value::Object(content),
                },
                None,
            )
            .await;
        if let Err(e) = result {
            warn!("couldn't publish the direct-chats update: {e}");
        }
    }

    /// Finds (or joins, or creates) a direct chat with the user and
    /// reports it through `on_direct_chat_available`.
    pub async fn request_direct_chat(self: &Arc<Self>, user_id: &str) -> Result<Arc<Room>> {
        let room = self.do_in_direct_chat(user_id).await?;
        self.events().on_direct_chat_available(room.clone()).await;
        Ok(room)
    }

    /// The first still-valid direct chat with the user: a joined room is
    /// used as is; an invite is auto-joined; forgotten rooms are cleaned
    /// out of the indices; with nothing left, a fresh direct chat is
    /// created.
    pub async fn do_in_direct_chat(self: &Arc<Self>, other_user_id: &str) -> Result<Arc<Room>> {
        let own_id = self.user_id();
        let candidate_rooms: Vec<RoomId> = self
            .direct_chats
            .read()
            .unwrap()
            .user_to_rooms
            .get(other_user_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();

        let mut removals: Vec<RoomId> = Vec::new();
        let mut result: Option<Arc<Room>> = None;
        for room_id in candidate_rooms {
            if let Some(room) = self.room(&room_id, JoinStates::from(JoinState::Join)) {
                // A direct chat with yourself should only involve
                // yourself.
                if Some(other_user_id.to_owned()) == own_id && room.total_member_count() > 1 {
                    continue;
                }
                debug!(
                    user_id = other_user_id, room_id = %room.id(),
                    "direct chat is already available"
                );
                result = Some(room);
                break;
            }
            if self.invitation(&room_id).is_some() {
                let joined = self.join_room(&room_id, &[]).await?;
                debug!(
                    user_id = other_user_id, room_id = %joined.id(),
                    "joined the already invited direct chat"
                );
                result = Some(joined);
                break;
            }
            // Avoid reusing previously left chats but don't remove them
            // from the direct chat maps, either.
            if self.room(&room_id, JoinStates::from(JoinState::Leave)).is_some() {
                continue;
            }
            warn!(
                user_id = other_user_id, room_id,
                "direct chat is not valid and will be discarded"
            );
            removals.push(room_id);
        }

        if !removals.is_empty() {
            let mut removal_map: DirectChatsMap = BTreeMap::new();
            {
                let mut chats = self.direct_chats.write().unwrap();
                for room_id in &removals {
                    chats.remove(other_user_id, room_id);
                    chats
                        .local_removals
                        .insert((other_user_id.to_owned(), room_id.clone()));
                    removal_map
                        .entry(other_user_id.to_owned())
                        .or_default()
                        .insert(room_id.clone());
                }
            }
            self.events().on_direct_chats_changed(&Default::default(), &removal_map).await;
        }

        match result {
            Some(room) => Ok(room),
            None => {
                let room = self.create_direct_chat(other_user_id, None, None).await?;
                debug!(user_id = other_user_id, room_id = %room.id(), "direct chat created");
                Ok(room)
            }
        }
    }

    /// Creates a new direct chat with the user: an unpublished room with
    /// the `trusted_private_chat` preset, flagged as direct.
    pub async fn create_direct_chat(
        self: &Arc<Self>,
        user_id: &str,
        topic: Option<&str>,
        name: Option<&str>,
    ) -> Result<Arc<Room>> {
        if !crate::identifiers::is_valid_user_id(user_id) {
            return Err(Error::IncorrectRequest(format!("malformed user id {user_id}")));
        }
        self.create_room(
            super::RoomVisibility::Unpublish,
            None,
            name,
            topic,
            &[user_id.to_owned()],
            Some("trusted_private_chat"),
            None,
            true,
            Vec::new(),
            Vec::new(),
            None,
        )
        .await
    }

    /// Consistency check used by tests: every entry present in one index
    /// is present in all three.
    #[cfg(test)]
    pub(crate) fn direct_chats_consistent(&self) -> bool {
        let chats = self.direct_chats.read().unwrap();
        for (user, rooms) in &chats.user_to_rooms {
            for room in rooms {
                let in_users = chats
                    .room_to_users
                    .get(room)
                    .is_some_and(|users| users.iter().any(|u| u.id() == user));
                let in_ids =
                    chats.room_to_user_ids.get(room).is_some_and(|ids| ids.contains(user));
                if !in_users || !in_ids {
                    return false;
                }
            }
        }
        for (room, ids) in &chats.room_to_user_ids {
            for user in ids {
                if !chats.user_to_rooms.get(user).is_some_and(|rooms| rooms.contains(room)) {
                    return false;
                }
            }
        }
        true
    }
}
