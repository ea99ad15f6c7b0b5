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

//! The room registry transition table and the direct-chats indices,
//! exercised without a server.

mod util;

use std::collections::HashSet;

use matrix_client::{Connection, JoinState, JoinStates};
use util::Recorder;

#[tokio::test]
async fn provide_room_follows_the_transition_table() {
    let connection = Connection::make_mock_connection("@alice:example.org", false).await.unwrap();
    let recorder = Recorder::new();
    connection.set_events(recorder.clone());

    // none → Invite
    connection.provide_room("!r:ex", Some(JoinState::Invite)).await.unwrap();
    assert_eq!(
        recorder.drain(),
        vec!["newRoom(!r:ex#invite)", "invitedRoom(!r:ex#invite, none)"]
    );

    // Invite → Join: the Invite object collapses.
    connection.provide_room("!r:ex", Some(JoinState::Join)).await.unwrap();
    assert_eq!(
        recorder.drain(),
        vec![
            "newRoom(!r:ex)",
            "joinedRoom(!r:ex, !r:ex#invite)",
            "aboutToDeleteRoom(!r:ex#invite)",
        ]
    );
    assert!(connection.invitation("!r:ex").is_none());

    // Join → Join is a no-op.
    connection.provide_room("!r:ex", Some(JoinState::Join)).await.unwrap();
    assert_eq!(recorder.drain(), Vec::<String>::new());

    // Join → Leave
    connection.provide_room("!r:ex", Some(JoinState::Leave)).await.unwrap();
    assert_eq!(recorder.drain(), vec!["leftRoom(!r:ex, none)"]);

    // Leave → Invite: both objects coexist.
    connection.provide_room("!r:ex", Some(JoinState::Invite)).await.unwrap();
    assert_eq!(
        recorder.drain(),
        vec!["newRoom(!r:ex#invite)", "invitedRoom(!r:ex#invite, !r:ex)"]
    );
    assert!(connection.invitation("!r:ex").is_some());
    assert!(connection
        .room("!r:ex", JoinStates::from(JoinState::Leave))
        .is_some());

    // Invite + Leave → Join: no new object, the Leave one flips.
    connection.provide_room("!r:ex", Some(JoinState::Join)).await.unwrap();
    assert_eq!(
        recorder.drain(),
        vec!["joinedRoom(!r:ex, !r:ex#invite)", "aboutToDeleteRoom(!r:ex#invite)"]
    );

    // none → Join and none → Leave for fresh rooms.
    connection.provide_room("!j:ex", Some(JoinState::Join)).await.unwrap();
    assert_eq!(recorder.drain(), vec!["newRoom(!j:ex)", "joinedRoom(!j:ex, none)"]);
    connection.provide_room("!l:ex", Some(JoinState::Leave)).await.unwrap();
    assert_eq!(recorder.drain(), vec!["newRoom(!l:ex)", "leftRoom(!l:ex, none)"]);

    // The registry never holds duplicates per (id, is_invite) key.
    let ids: Vec<(String, bool)> = connection
        .all_rooms()
        .iter()
        .map(|r| (r.id().clone(), r.is_invite_entry()))
        .collect();
    let unique: HashSet<_> = ids.iter().cloned().collect();
    assert_eq!(ids.len(), unique.len());
}

#[tokio::test]
async fn room_lookup_respects_the_state_mask() {
    let connection = Connection::make_mock_connection("@alice:example.org", false).await.unwrap();

    connection.provide_room("!r:ex", Some(JoinState::Leave)).await.unwrap();
    connection.provide_room("!r:ex", Some(JoinState::Invite)).await.unwrap();

    assert!(connection.room("!r:ex", JoinStates::from(JoinState::Join)).is_none());
    let invite = connection.room("!r:ex", JoinStates::from(JoinState::Invite)).unwrap();
    assert!(invite.is_invite_entry());
    let left = connection.room("!r:ex", JoinStates::from(JoinState::Leave)).unwrap();
    assert!(!left.is_invite_entry());
    // With both acceptable, the Join/Leave object has no priority over
    // the invite unless actually joined.
    assert!(connection.room("!r:ex", JoinState::Join | JoinState::Invite).unwrap().is_invite_entry());
}

#[tokio::test]
async fn direct_chat_indices_stay_mutually_consistent() {
    let connection = Connection::make_mock_connection("@alice:example.org", false).await.unwrap();
    let room = connection.provide_room("!dc:ex", Some(JoinState::Join)).await.unwrap();

    connection.add_to_direct_chats("!dc:ex", "@bob:example.org").await;
    connection.add_to_direct_chats("!dc:ex", "@carol:example.org").await;

    let chats = connection.direct_chats();
    assert!(chats["@bob:example.org"].contains("!dc:ex"));
    assert!(chats["@carol:example.org"].contains("!dc:ex"));
    let ids = connection.direct_chat_member_ids(&room);
    assert!(ids.contains(&"@bob:example.org".to_owned()));
    assert!(ids.contains(&"@carol:example.org".to_owned()));
    let users: Vec<String> = connection
        .direct_chat_users(&room)
        .iter()
        .map(|u| u.id().clone())
        .collect();
    assert_eq!(ids.len(), users.len());
    assert!(connection.is_direct_chat("!dc:ex"));

    // Adding the same pair twice changes nothing.
    connection.add_to_direct_chats("!dc:ex", "@bob:example.org").await;
    assert_eq!(connection.direct_chat_member_ids(&room).len(), 2);

    // Removing one user keeps the other; no orphans on any side.
    connection.remove_from_direct_chats("!dc:ex", Some("@bob:example.org")).await;
    assert!(connection.direct_chats().get("@bob:example.org").is_none());
    assert!(connection.direct_chats()["@carol:example.org"].contains("!dc:ex"));
    assert_eq!(connection.direct_chat_member_ids(&room), vec!["@carol:example.org"]);

    // Removing without a user clears the room from all indices.
    connection.remove_from_direct_chats("!dc:ex", None).await;
    assert!(connection.direct_chats().is_empty());
    assert!(!connection.is_direct_chat("!dc:ex"));
    assert!(connection.direct_chat_member_ids(&room).is_empty());
    assert!(connection.direct_chat_users(&room).is_empty());
}

#[tokio::test]
async fn txn_ids_are_strictly_unique() {
    let connection = Connection::make_mock_connection("@alice:example.org", false).await.unwrap();
    let mut seen = HashSet::new();
    for _ in 0..10_000 {
        assert!(seen.insert(connection.generate_txn_id()));
    }
}
