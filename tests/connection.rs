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

//! Discovery, login, retries and logout against a mocked homeserver.

mod util;

use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use matrix_client::{
    store::{Keychain, MemoryKeychain, MemorySettings, SettingsStore},
    ClientConfig, Connection, ConnectionState, Error, RequestConfig,
};
use serde_json::json;
use url::Url;
use util::{empty_sync, mount_session_endpoints, Recorder};
use wiremock::{
    matchers::{body_partial_json, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn quick_retries() -> ClientConfig {
    ClientConfig::new().request_config(
        RequestConfig::default().retry_timeout(Duration::from_secs(5)).retry_limit(3),
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
    (connection, recorder)
}

#[tokio::test]
async fn discovery_flows_login_and_first_sync() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/.well-known/matrix/client"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "m.homeserver": { "base_url": server.uri() }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "flows": [ { "type": "m.login.password" }, { "type": "m.login.sso" } ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/login"))
        .and(body_partial_json(json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": "@alice:example.org" },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user_id": "@alice:example.org",
            "access_token": "syt_secret",
            "device_id": "ALICEDEV",
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_session_endpoints(&server).await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_sync("s1")))
        .expect(1)
        .mount(&server)
        .await;

    let keychain = Arc::new(MemoryKeychain::new());
    let connection = Connection::builder()
        .client_config(quick_retries())
        .keychain(keychain.clone())
        .build()
        .unwrap();

    connection.resolve_server(&server.uri()).await.unwrap();
    assert!(connection.supports_password_auth());
    assert!(connection.supports_sso());

    connection
        .login_with_password("@alice:example.org", "wordpass", Some("A test device"), None)
        .await
        .unwrap();
    assert_eq!(connection.user_id().as_deref(), Some("@alice:example.org"));
    assert_eq!(connection.device_id().as_deref(), Some("ALICEDEV"));
    assert_eq!(connection.access_token().as_deref(), Some("syt_secret"));
    assert_eq!(connection.state(), ConnectionState::LoggedIn);
    // The capability probe ran as part of the setup.
    assert_eq!(connection.default_room_version().as_deref(), Some("10"));
    assert_eq!(connection.stable_room_versions(), vec!["10".to_owned()]);
    // The token landed in the keychain under the user id.
    assert_eq!(keychain.read("@alice:example.org").unwrap(), b"syt_secret");

    assert!(connection.sync(Duration::from_secs(0)).await.unwrap());
    assert_eq!(connection.next_batch_token().as_deref(), Some("s1"));
}

#[tokio::test]
async fn unsupported_login_flow_is_a_login_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "flows": [ { "type": "m.login.password" } ]
        })))
        .mount(&server)
        .await;

    let recorder = Recorder::new();
    let connection = Connection::builder()
        .homeserver(Url::parse(&server.uri()).unwrap())
        .client_config(quick_retries())
        .events(recorder.clone())
        .build()
        .unwrap();
    connection.set_homeserver(Url::parse(&server.uri()).unwrap()).await.unwrap();

    let result = connection.login_with_token("abc", None, None).await;
    assert_matches!(result, Err(Error::Login(_)));
    assert!(recorder.contains("loginError"));
}

#[tokio::test]
async fn malformed_user_id_surfaces_a_resolve_error() {
    let recorder = Recorder::new();
    let connection = Connection::builder().events(recorder.clone()).build().unwrap();

    let result = connection.login_with_password("alice", "pw", None, None).await;
    assert_matches!(result, Err(Error::Resolve(_)));
    assert!(recorder.contains("resolveError"));
}

#[tokio::test]
async fn transient_failures_are_retried_with_notifications() {
    let server = MockServer::start().await;
    let (connection, recorder) = logged_in_connection(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_sync("s1")))
        .mount(&server)
        .await;

    assert!(connection.sync(Duration::from_secs(0)).await.unwrap());
    // Retry notifications are dispatched asynchronously; let them land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count("networkError"), 2);
    assert!(recorder.contains("syncDone"));
}

#[tokio::test]
async fn revoked_token_stops_sync_with_a_login_error() {
    let server = MockServer::start().await;
    let (connection, recorder) = logged_in_connection(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "errcode": "M_UNKNOWN_TOKEN", "error": "Invalid macaroon"
        })))
        .mount(&server)
        .await;

    let result = connection.sync(Duration::from_secs(0)).await;
    assert_matches!(result, Err(Error::Unauthorised));
    assert!(recorder.contains("loginError"));
    assert!(!recorder.contains("syncError"));
}

#[tokio::test]
async fn logout_tears_the_session_down() {
    let server = MockServer::start().await;
    let keychain = Arc::new(MemoryKeychain::new());
    let settings = Arc::new(MemorySettings::new());
    mount_session_endpoints(&server).await;
    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/logout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let recorder = Recorder::new();
    let connection = Connection::builder()
        .homeserver(Url::parse(&server.uri()).unwrap())
        .client_config(quick_retries())
        .keychain(keychain.clone())
        .settings(settings.clone())
        .events(recorder.clone())
        .build()
        .unwrap();
    connection.assume_identity("@alice:example.org", "secret-token").await.unwrap();
    keychain.write("@alice:example.org", b"secret-token").unwrap();

    connection.logout().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::LoggedOut);
    assert!(!connection.is_logged_in());
    assert!(recorder.contains("loggedOut"));
    assert!(settings.get("Accounts/@alice:example.org/DeviceId").is_none());
    assert!(keychain.read("@alice:example.org").is_err());
}

#[tokio::test]
async fn failed_logout_restores_the_session() {
    let server = MockServer::start().await;
    let (connection, recorder) = logged_in_connection(&server).await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/logout"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errcode": "M_UNKNOWN", "error": "nope"
        })))
        .mount(&server)
        .await;

    let result = connection.logout().await;
    assert!(result.is_err());
    // The session state is restored, token and all.
    assert!(connection.is_logged_in());
    assert_eq!(connection.access_token().as_deref(), Some("secret-token"));
    assert!(!recorder.contains("loggedOut"));
}

#[tokio::test]
async fn rate_limits_honour_the_server_hint() {
    let server = MockServer::start().await;
    let (connection, _recorder) = logged_in_connection(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "errcode": "M_LIMIT_EXCEEDED", "error": "Too Many Requests",
            "retry_after_ms": 100,
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_sync("s1")))
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    assert!(connection.sync(Duration::from_secs(0)).await.unwrap());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn media_urls_carry_the_user_id() {
    let server = MockServer::start().await;
    let (connection, _) = logged_in_connection(&server).await;

    let mxc = matrix_client::MxcUri::parse("mxc://example.org/abcdef").unwrap();
    let url = connection.make_media_url(&mxc).unwrap();
    assert!(url.path().ends_with("/_matrix/media/v3/download/example.org/abcdef"));
    assert_eq!(
        url.query_pairs().find(|(k, _)| k == "user_id").map(|(_, v)| v.into_owned()),
        Some("@alice:example.org".to_owned())
    );
}

#[tokio::test]
async fn sync_appears_in_query_with_since_token() {
    let server = MockServer::start().await;
    let (connection, _) = logged_in_connection(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_sync("s1")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    connection.sync(Duration::from_secs(0)).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .and(query_param("since", "s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_sync("s2")))
        .expect(1)
        .mount(&server)
        .await;
    connection.sync(Duration::from_secs(0)).await.unwrap();
    assert_eq!(connection.next_batch_token().as_deref(), Some("s2"));
}
