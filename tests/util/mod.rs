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

//! Shared helpers for the integration tests.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use matrix_client::{ConnectionEvents, DirectChatsMap, Room};
use serde_json::json;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// Records every notification as a compact string, so tests can assert
/// exact emission sequences.
#[derive(Default)]
pub struct Recorder {
    log: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    /// Takes the log recorded so far, clearing it.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut self.log.lock().unwrap())
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.log.lock().unwrap().iter().any(|e| e == entry)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

fn room_tag(room: &Arc<Room>) -> String {
    if room.is_invite_entry() {
        format!("{}#invite", room.id())
    } else {
        room.id().clone()
    }
}

fn opt_room_tag(room: &Option<Arc<Room>>) -> String {
    room.as_ref().map(room_tag).unwrap_or_else(|| "none".to_owned())
}

#[async_trait]
impl ConnectionEvents for Recorder {
    async fn on_new_room(&self, room: Arc<Room>) {
        self.push(format!("newRoom({})", room_tag(&room)));
    }

    async fn on_invited_room(&self, room: Arc<Room>, prev: Option<Arc<Room>>) {
        self.push(format!("invitedRoom({}, {})", room_tag(&room), opt_room_tag(&prev)));
    }

    async fn on_joined_room(&self, room: Arc<Room>, prev_invite: Option<Arc<Room>>) {
        self.push(format!("joinedRoom({}, {})", room_tag(&room), opt_room_tag(&prev_invite)));
    }

    async fn on_left_room(&self, room: Arc<Room>, prev_invite: Option<Arc<Room>>) {
        self.push(format!("leftRoom({}, {})", room_tag(&room), opt_room_tag(&prev_invite)));
    }

    async fn on_about_to_delete_room(&self, room: Arc<Room>) {
        self.push(format!("aboutToDeleteRoom({})", room_tag(&room)));
    }

    async fn on_created_room(&self, room: Arc<Room>) {
        self.push(format!("createdRoom({})", room_tag(&room)));
    }

    async fn on_direct_chat_available(&self, room: Arc<Room>) {
        self.push(format!("directChatAvailable({})", room_tag(&room)));
    }

    async fn on_direct_chats_changed(
        &self,
        additions: &DirectChatsMap,
        removals: &DirectChatsMap,
    ) {
        self.push(format!(
            "directChatsChanged(+{}, -{})",
            additions.values().map(|r| r.len()).sum::<usize>(),
            removals.values().map(|r| r.len()).sum::<usize>()
        ));
    }

    async fn on_account_data_changed(&self, event_type: &str) {
        self.push(format!("accountDataChanged({event_type})"));
    }

    async fn on_sync_done(&self) {
        self.push("syncDone".to_owned());
    }

    async fn on_network_error(&self, _message: &str, retries_taken: u32, _next: Duration) {
        self.push(format!("networkError({retries_taken})"));
    }

    async fn on_resolve_error(&self, _message: &str) {
        self.push("resolveError".to_owned());
    }

    async fn on_login_error(&self, _message: &str, _details: &str) {
        self.push("loginError".to_owned());
    }

    async fn on_sync_error(&self, _message: &str) {
        self.push("syncError".to_owned());
    }

    async fn on_logged_out(&self) {
        self.push("loggedOut".to_owned());
    }
}

/// Mounts the endpoints every logged-in connection touches during setup.
pub async fn mount_session_endpoints(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/account/whoami"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user_id": "@alice:example.org",
            "device_id": "ALICEDEV",
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/capabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "capabilities": {
                "m.room_versions": {
                    "default": "10",
                    "available": { "10": "stable", "org.example.unstable": "unstable" }
                }
            }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/profile/@alice:example.org"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "displayname": "Alice"
        })))
        .mount(server)
        .await;
}

/// A sync response body with just a token.
pub fn empty_sync(next_batch: &str) -> serde_json::Value {
    json!({ "next_batch": next_batch })
}
