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

//! Device-key endpoints: upload, query and one-time-key claims.

use std::collections::{BTreeMap, HashMap};

use http::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    http_client::{MatrixRequest, RequestBody},
    identifiers::{DeviceId, UserId},
};

/// `POST /_matrix/client/v3/keys/upload`.
pub struct UploadKeysRequest {
    /// The signed identity keys of this device, uploaded once.
    pub device_keys: Option<Value>,
    /// Signed one-time keys, keyed by `signed_curve25519:<key_id>`.
    pub one_time_keys: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UploadKeysResponse {
    #[serde(default)]
    pub one_time_key_counts: HashMap<String, u64>,
}

impl MatrixRequest for UploadKeysRequest {
    type Response = UploadKeysResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/keys/upload".to_owned()
    }

    fn body(&self) -> RequestBody {
        let mut body = Map::new();
        if let Some(device_keys) = &self.device_keys {
            body.insert("device_keys".to_owned(), device_keys.clone());
        }
        if let Some(one_time_keys) = &self.one_time_keys {
            body.insert("one_time_keys".to_owned(), Value::Object(one_time_keys.clone()));
        }
        RequestBody::Json(Value::Object(body))
    }
}

/// `POST /_matrix/client/v3/keys/query`.
pub struct QueryKeysRequest {
    /// Users to query; an empty device list means all devices.
    pub device_keys: BTreeMap<UserId, Vec<DeviceId>>,
    pub token: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct QueryKeysResponse {
    #[serde(default)]
    pub device_keys: BTreeMap<UserId, BTreeMap<DeviceId, Value>>,
    #[serde(default)]
    pub master_keys: BTreeMap<UserId, Value>,
    #[serde(default)]
    pub self_signing_keys: BTreeMap<UserId, Value>,
    #[serde(default)]
    pub user_signing_keys: BTreeMap<UserId, Value>,
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

impl MatrixRequest for QueryKeysRequest {
    type Response = QueryKeysResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/keys/query".to_owned()
    }

    fn body(&self) -> RequestBody {
        let mut body = Map::new();
        body.insert("device_keys".to_owned(), json!(self.device_keys));
        if let Some(token) = &self.token {
            body.insert("token".to_owned(), json!(token));
        }
        RequestBody::Json(Value::Object(body))
    }
}

/// `POST /_matrix/client/v3/keys/claim`.
pub struct ClaimKeysRequest {
    /// user id → device id → key algorithm (`signed_curve25519`).
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClaimKeysResponse {
    #[serde(default)]
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, Value>>,
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

impl MatrixRequest for ClaimKeysRequest {
    type Response = ClaimKeysResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/keys/claim".to_owned()
    }

    fn body(&self) -> RequestBody {
        RequestBody::Json(json!({ "one_time_keys": self.one_time_keys }))
    }
}
