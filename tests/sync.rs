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

//! The sync pipeline: room-state reconciliation, forget cycles, direct
//! chats and the state cache.

mod util;

use std::{sync::Arc, time::Duration};

use matrix_client::{
    ClientConfig, Connection, JoinState, JoinStates, RequestConfig,
};
use serde_json::json;
use url::Url;
use util::{empty_sync, mount_session_endpoints, Recorder};
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn quick_retries() -> ClientConfig {
    ClientConfig::new().request_config(
        RequestConfig::default().retry_timeout(Duration::from_secs(5)).retry_limit(2),
    )
}

async fn logged_in_connection(server: &MockServer) -> (Arc<Connection>, Arc<Recorder>) {
    mount_session_endpoints(server).await;
    let recorder = Recorder::new();
    let connection = Connection::builder()
        .homeserver(Url::parse(&server.uri()).unwrap())
        .client_config(quick_retries())
        .events(recorder.clone())
        .build()
        .unwrap();
    connection.assume_identity("@alice:example.org", "secret-token").await.unwrap();
    recorder.drain();
    (connection, recorder)
}

async fn mount_one_sync(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn invite_then_join_emits_in_table_order() {
    let server = MockServer::start().await;
    let (connection, recorder) = logged_in_connection(&server).await;

    mount_one_sync(
        &server,
        json!({
            "next_batch": "s1",
            "rooms": { "invite": { "!r:ex": { "invite_state": { "events": [] } } } }
        }),
    )
    .await;
    connection.sync(Duration::from_secs(0)).await.unwrap();

    assert_eq!(
        recorder.drain(),
        vec![
            "newRoom(!r:ex#invite)",
            "invitedRoom(!r:ex#invite, none)",
            "syncDone",
        ]
    );

    // The embedder joins; the registry is updated from the join response
    // even before the next sync confirms it.
    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/join/!r:ex"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "room_id": "!r:ex" })))
        .expect(1)
        .mount(&server)
        .await;
    let room = connection.join_room("!r:ex", &[]).await.unwrap();
    assert_eq!(room.join_state(), JoinState::Join);

    assert_eq!(
        recorder.drain(),
        vec![
            "newRoom(!r:ex)",
            "joinedRoom(!r:ex, !r:ex#invite)",
            "aboutToDeleteRoom(!r:ex#invite)",
        ]
    );
    assert!(connection.invitation("!r:ex").is_none());
}

#[tokio::test]
async fn forget_cycle_leaves_then_forgets_then_ignores_sync() {
    let server = MockServer::start().await;
    let (connection, recorder) = logged_in_connection(&server).await;

    mount_one_sync(
        &server,
        json!({
            "next_batch": "s1",
            "rooms": { "join": { "!r:ex": {} } }
        }),
    )
    .await;
    connection.sync(Duration::from_secs(0)).await.unwrap();
    recorder.drain();

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/rooms/!r:ex/leave"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/rooms/!r:ex/forget"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    connection.forget_room("!r:ex").await.unwrap();
    assert!(recorder.contains("aboutToDeleteRoom(!r:ex)"));
    assert!(connection.room("!r:ex", JoinStates::ALL).is_none());

    // A sync response mentioning the room in Leave state arrives between
    // forgetting and the server catching up: it is ignored.
    mount_one_sync(
        &server,
        json!({
            "next_batch": "s2",
            "rooms": { "leave": { "!r:ex": {} } }
        }),
    )
    .await;
    connection.sync(Duration::from_secs(0)).await.unwrap();
    assert!(connection.room("!r:ex", JoinStates::ALL).is_none());
}

#[tokio::test]
async fn concurrent_syncs_short_circuit() {
    let server = MockServer::start().await;
    let (connection, _) = logged_in_connection(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(empty_sync("s1"))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let first = connection.sync(Duration::from_secs(0));
    let second = connection.sync(Duration::from_secs(0));
    let (first, second) = tokio::join!(first, second);
    // Exactly one of the two performed the request.
    let performed = [first.unwrap(), second.unwrap()];
    assert_eq!(performed.iter().filter(|p| **p).count(), 1);
    let sync_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/_matrix/client/v3/sync")
        .count();
    assert_eq!(sync_requests, 1);
}

#[tokio::test]
async fn stop_sync_then_sync_leaves_one_job_in_flight() {
    let server = MockServer::start().await;
    let (connection, _) = logged_in_connection(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(empty_sync("s1"))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    connection.sync_loop(Duration::from_secs(0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(connection.is_syncing());

    connection.stop_sync();
    assert!(!connection.is_syncing());

    // An immediate new sync starts cleanly.
    assert!(connection.sync(Duration::from_secs(0)).await.unwrap());
    assert!(!connection.is_syncing());
}

#[tokio::test]
async fn direct_chat_reuse_cleans_stale_entries_and_joins_the_invite() {
    let server = MockServer::start().await;
    let (connection, recorder) = logged_in_connection(&server).await;

    // The server says @bob has two direct chats: !r1 (long forgotten,
    // no local object) and !r2 (a pending invite).
    mount_one_sync(
        &server,
        json!({
            "next_batch": "s1",
            "rooms": { "invite": { "!r2:ex": { "invite_state": { "events": [] } } } },
            "account_data": { "events": [
                { "type": "m.direct",
                  "content": { "@bob:example.org": ["!r1:ex", "!r2:ex"] } }
            ] }
        }),
    )
    .await;
    connection.sync(Duration::from_secs(0)).await.unwrap();
    recorder.drain();

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/join/!r2:ex"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "room_id": "!r2:ex" })))
        .expect(1)
        .mount(&server)
        .await;
    // The cleaned-up direct-chat map goes back to the server.
    Mock::given(method("PUT"))
        .and(path("/_matrix/client/v3/user/@alice:example.org/account_data/m.direct"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let room = connection.request_direct_chat("@bob:example.org").await.unwrap();
    assert_eq!(room.id(), "!r2:ex");
    assert!(recorder.contains("directChatAvailable(!r2:ex)"));

    // !r1 was discarded from the index; !r2 stays.
    let chats = connection.direct_chats();
    let bob_rooms = chats.get("@bob:example.org").unwrap();
    assert!(bob_rooms.contains("!r2:ex"));
    assert!(!bob_rooms.contains("!r1:ex"));
}

#[tokio::test]
async fn state_cache_round_trips_through_a_fresh_connection() {
    let server = MockServer::start().await;
    let cache_dir = tempfile::tempdir().unwrap();
    mount_session_endpoints(&server).await;

    let connection = Connection::builder()
        .homeserver(Url::parse(&server.uri()).unwrap())
        .client_config(quick_retries())
        .cache_dir(cache_dir.path().to_path_buf())
        .build()
        .unwrap();
    connection.assume_identity("@alice:example.org", "secret-token").await.unwrap();

    mount_one_sync(
        &server,
        json!({
            "next_batch": "s1",
            "rooms": {
                "join": {
                    "!r:ex": { "state": { "events": [
                        { "type": "m.room.name", "state_key": "",
                          "content": { "name": "Ops" } }
                    ] } }
                },
                "invite": { "!i:ex": { "invite_state": { "events": [] } } }
            },
            "account_data": { "events": [
                { "type": "org.example.pref", "content": { "colour": "teal" } }
            ] }
        }),
    )
    .await;
    connection.sync(Duration::from_secs(0)).await.unwrap();
    connection.save_state().await.unwrap();
    drop(connection);

    // A fresh connection over the same cache comes back with the same
    // rooms, account data and sync position.
    let restored = Connection::builder()
        .homeserver(Url::parse(&server.uri()).unwrap())
        .client_config(quick_retries())
        .cache_dir(cache_dir.path().to_path_buf())
        .build()
        .unwrap();
    restored.assume_identity("@alice:example.org", "secret-token").await.unwrap();
    assert!(restored.load_state().await.unwrap());

    let room = restored.room("!r:ex", JoinStates::ALL).unwrap();
    assert_eq!(room.join_state(), JoinState::Join);
    assert_eq!(room.name().as_deref(), Some("Ops"));
    assert!(restored.invitation("!i:ex").is_some());
    assert_eq!(restored.account_data_json("org.example.pref")["colour"], "teal");
    assert_eq!(restored.next_batch_token().as_deref(), Some("s1"));

    // Driving one further sync resumes from the cached token.
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .and(query_param("since", "s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_sync("s2")))
        .expect(1)
        .mount(&server)
        .await;
    restored.sync(Duration::from_secs(0)).await.unwrap();
    assert_eq!(restored.next_batch_token().as_deref(), Some("s2"));
}

#[tokio::test]
async fn tags_group_and_order_rooms() {
    let server = MockServer::start().await;
    let (connection, _) = logged_in_connection(&server).await;

    mount_one_sync(
        &server,
        json!({
            "next_batch": "s1",
            "rooms": { "join": {
                "!a:ex": { "account_data": { "events": [
                    { "type": "m.tag", "content": { "tags": { "work": { "order": 0.7 } } } }
                ] } },
                "!b:ex": { "account_data": { "events": [
                    { "type": "m.tag", "content": { "tags": { "work": { "order": 0.2 } } } }
                ] } }
            } }
        }),
    )
    .await;
    connection.sync(Duration::from_secs(0)).await.unwrap();

    let tagged = connection.tags_to_rooms();
    let work: Vec<String> = tagged["work"].iter().map(|r| r.id().clone()).collect();
    assert_eq!(work, vec!["!b:ex", "!a:ex"]);

    let names = connection.tag_names();
    assert_eq!(names.first().map(String::as_str), Some("m.favourite"));
    assert_eq!(names.last().map(String::as_str), Some("m.lowpriority"));
}
