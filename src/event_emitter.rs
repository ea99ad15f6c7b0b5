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

//! The observer interface a connection reports through.

use std::{collections::BTreeMap, collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use url::Url;

use crate::{
    connection::ConnectionState,
    events::Event,
    identifiers::{RoomId, UserId},
    room::Room,
    user::User,
};

/// The direct-chat (user → rooms) mapping reported with change
/// notifications.
pub type DirectChatsMap = BTreeMap<UserId, BTreeSet<RoomId>>;

/// Implementors of `ConnectionEvents` receive the connection's
/// notifications; all methods default to doing nothing, so an embedder
/// only overrides what it cares about.
///
/// Room transition notifications follow the transition table documented on
/// [`Connection::provide_room`](crate::Connection::provide_room).
#[allow(unused_variables)]
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// The homeserver base URL changed, usually as a result of server
    /// resolution.
    async fn on_homeserver_changed(&self, url: &Url) {}

    /// The list of login flows advertised by the homeserver was updated.
    async fn on_login_flows_changed(&self) {}

    /// The connection's lifecycle state changed.
    async fn on_state_changed(&self, state: ConnectionState) {}

    /// Login (or token validation) completed and the connection is usable.
    async fn on_connected(&self) {}

    /// A room object was created in the registry.
    async fn on_new_room(&self, room: Arc<Room>) {}

    /// A room entered Invite state; `prev` is the Leave-state object for
    /// the same room id, if one exists.
    async fn on_invited_room(&self, room: Arc<Room>, prev: Option<Arc<Room>>) {}

    /// A room entered Join state; `prev_invite` is the Invite-state object
    /// that is about to be dropped, if there was one.
    async fn on_joined_room(&self, room: Arc<Room>, prev_invite: Option<Arc<Room>>) {}

    /// A room entered Leave state; `prev_invite` as for
    /// [`on_joined_room`](Self::on_joined_room).
    async fn on_left_room(&self, room: Arc<Room>, prev_invite: Option<Arc<Room>>) {}

    /// The room object is about to be dropped from the registry.
    async fn on_about_to_delete_room(&self, room: Arc<Room>) {}

    /// A room created by us through `create_room` is ready.
    async fn on_created_room(&self, room: Arc<Room>) {}

    /// A user object was created in the registry.
    async fn on_new_user(&self, user: Arc<User>) {}

    /// The direct-chats index changed.
    async fn on_direct_chats_changed(
        &self,
        additions: &DirectChatsMap,
        removals: &DirectChatsMap,
    ) {
    }

    /// A direct chat requested through `request_direct_chat` is available.
    async fn on_direct_chat_available(&self, room: Arc<Room>) {}

    /// An account-data event of the given type was created or updated.
    async fn on_account_data_changed(&self, event_type: &str) {}

    /// The ignored-users list changed.
    async fn on_ignored_users_changed(
        &self,
        added: &BTreeSet<UserId>,
        removed: &BTreeSet<UserId>,
    ) {
    }

    /// A presence event arrived; presence is passed through unprocessed.
    async fn on_presence_event(&self, event: &Event) {}

    /// The capability snapshot was (re)loaded.
    async fn on_capabilities_loaded(&self) {}

    /// One sync iteration completed successfully.
    async fn on_sync_done(&self) {}

    /// A transient network failure occurred; the request will be retried
    /// after `next_retry`.
    async fn on_network_error(&self, message: &str, retries_taken: u32, next_retry: Duration) {}

    /// The homeserver couldn't be resolved.
    async fn on_resolve_error(&self, message: &str) {}

    /// Login failed, or the access token was found to be invalid.
    async fn on_login_error(&self, message: &str, details: &str) {}

    /// The sync loop stopped on a non-transient error.
    async fn on_sync_error(&self, message: &str) {}

    /// Logout completed and the connection is defunct.
    async fn on_logged_out(&self) {}

    /// A key verification session was created, locally or by a remote
    /// request.
    #[cfg(feature = "encryption")]
    async fn on_new_key_verification_session(
        &self,
        session: Arc<crate::crypto::KeyVerificationSession>,
    ) {
    }
}

/// A no-op observer, used when the embedder doesn't install one.
pub(crate) struct NullEvents;

#[async_trait]
impl ConnectionEvents for NullEvents {}
