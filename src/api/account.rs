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

//! Account-data endpoints.

use http::Method;
use serde_json::Value;

use super::encode;
use crate::{
    http_client::{MatrixRequest, RequestBody},
    identifiers::UserId,
};

/// `PUT /_matrix/client/v3/user/{userId}/account_data/{type}`.
pub struct SetAccountDataRequest {
    pub user_id: UserId,
    pub event_type: String,
    pub content: Value,
}

impl MatrixRequest for SetAccountDataRequest {
    type Response = super::session::Empty;

    fn method(&self) -> Method {
        Method::PUT
    }

    fn path(&self) -> String {
        format!(
            "/_matrix/client/v3/user/{}/account_data/{}",
            encode(&self.user_id),
            encode(&self.event_type)
        )
    }

    fn body(&self) -> RequestBody {
        RequestBody::Json(self.content.clone())
    }
}

/// `GET /_matrix/client/v3/user/{userId}/account_data/{type}`.
pub struct GetAccountDataRequest {
    pub user_id: UserId,
    pub event_type: String,
}

impl MatrixRequest for GetAccountDataRequest {
    type Response = Value;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!(
            "/_matrix/client/v3/user/{}/account_data/{}",
            encode(&self.user_id),
            encode(&self.event_type)
        )
    }
}

/// `GET /_matrix/client/v3/profile/{userId}`.
pub struct GetProfileRequest {
    pub user_id: UserId,
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct ProfileResponse {
    pub displayname: Option<String>,
    pub avatar_url: Option<String>,
}

impl MatrixRequest for GetProfileRequest {
    type Response = ProfileResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!("/_matrix/client/v3/profile/{}", encode(&self.user_id))
    }
}
