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

//! Server discovery, login and session management endpoints.

use http::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    http_client::{MatrixRequest, RequestBody},
    identifiers::{DeviceId, UserId},
};

/// `GET /.well-known/matrix/client` — server discovery.
pub struct GetWellKnownRequest;

#[derive(Clone, Debug, Deserialize)]
pub struct DiscoveryInfo {
    #[serde(rename = "m.homeserver")]
    pub homeserver: HomeserverInfo,
    #[serde(rename = "m.identity_server")]
    pub identity_server: Option<IdentityServerInfo>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HomeserverInfo {
    pub base_url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IdentityServerInfo {
    pub base_url: String,
}

impl MatrixRequest for GetWellKnownRequest {
    type Response = DiscoveryInfo;

    const AUTHENTICATION: bool = false;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        "/.well-known/matrix/client".to_owned()
    }
}

/// `GET /_matrix/client/v3/login` — the flows the server supports.
pub struct GetLoginFlowsRequest;

/// A single supported login flow.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoginFlow {
    #[serde(rename = "type")]
    pub flow_type: String,
}

impl LoginFlow {
    /// The `m.login.password` flow.
    pub const PASSWORD: &'static str = "m.login.password";
    /// The `m.login.sso` flow.
    pub const SSO: &'static str = "m.login.sso";
    /// The `m.login.token` flow.
    pub const TOKEN: &'static str = "m.login.token";
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoginFlowsResponse {
    #[serde(default)]
    pub flows: Vec<LoginFlow>,
}

impl MatrixRequest for GetLoginFlowsRequest {
    type Response = LoginFlowsResponse;

    const AUTHENTICATION: bool = false;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/login".to_owned()
    }
}

/// `POST /_matrix/client/v3/login` — the actual login.
pub struct LoginRequest {
    pub login_type: String,
    pub identifier: Option<Value>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub device_id: Option<DeviceId>,
    pub initial_device_display_name: Option<String>,
}

impl LoginRequest {
    /// The identifier object for a plain Matrix user id.
    pub fn user_identifier(user_id: &str) -> Value {
        json!({ "type": "m.id.user", "user": user_id })
    }

    /// The identifier object for a third-party identifier.
    pub fn third_party_identifier(medium: &str, address: &str) -> Value {
        json!({ "type": "m.id.thirdparty", "medium": medium, "address": address })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
    pub access_token: String,
    pub device_id: DeviceId,
    pub well_known: Option<Value>,
}

impl MatrixRequest for LoginRequest {
    type Response = LoginResponse;

    const AUTHENTICATION: bool = false;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/login".to_owned()
    }

    fn body(&self) -> RequestBody {
        let mut body = Map::new();
        body.insert("type".to_owned(), json!(self.login_type));
        if let Some(identifier) = &self.identifier {
            body.insert("identifier".to_owned(), identifier.clone());
        }
        if let Some(password) = &self.password {
            body.insert("password".to_owned(), json!(password));
        }
        if let Some(token) = &self.token {
            body.insert("token".to_owned(), json!(token));
        }
        if let Some(device_id) = &self.device_id {
            body.insert("device_id".to_owned(), json!(device_id));
        }
        if let Some(name) = &self.initial_device_display_name {
            body.insert("initial_device_display_name".to_owned(), json!(name));
        }
        RequestBody::Json(Value::Object(body))
    }
}

/// `POST /_matrix/client/v3/logout` — revoke the access token.
pub struct LogoutRequest;

#[derive(Clone, Debug, Deserialize)]
pub struct Empty {}

impl MatrixRequest for LogoutRequest {
    type Response = Empty;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/logout".to_owned()
    }
}

/// `GET /_matrix/client/v3/account/whoami` — validate an access token.
pub struct WhoamiRequest;

#[derive(Clone, Debug, Deserialize)]
pub struct WhoamiResponse {
    pub user_id: UserId,
    pub device_id: Option<DeviceId>,
}

impl MatrixRequest for WhoamiRequest {
    type Response = WhoamiResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/account/whoami".to_owned()
    }
}

/// `GET /_matrix/client/v3/capabilities` — the server's feature set.
pub struct GetCapabilitiesRequest;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CapabilitiesResponse {
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// The capability snapshot cached on the connection.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Capabilities {
    #[serde(rename = "m.room_versions")]
    pub room_versions: Option<RoomVersionsCapability>,
    #[serde(rename = "m.change_password")]
    pub change_password: Option<ChangePasswordCapability>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RoomVersionsCapability {
    pub default: String,
    #[serde(default)]
    pub available: std::collections::BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChangePasswordCapability {
    pub enabled: bool,
}

impl MatrixRequest for GetCapabilitiesRequest {
    type Response = CapabilitiesResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/capabilities".to_owned()
    }
}
