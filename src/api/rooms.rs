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

//! Room membership and messaging endpoints.

use http::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::encode;
use crate::{
    http_client::{MatrixRequest, RequestBody},
    identifiers::{RoomId, UserId},
};

/// `POST /_matrix/client/v3/join/{roomIdOrAlias}`.
pub struct JoinRoomRequest {
    pub room_id_or_alias: String,
    pub via_servers: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct JoinRoomResponse {
    pub room_id: RoomId,
}

impl MatrixRequest for JoinRoomRequest {
    type Response = JoinRoomResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("/_matrix/client/v3/join/{}", encode(&self.room_id_or_alias))
    }

    fn query(&self) -> Vec<(String, String)> {
        self.via_servers.iter().map(|s| ("server_name".to_owned(), s.clone())).collect()
    }
}

/// `POST /_matrix/client/v3/rooms/{roomId}/leave`.
pub struct LeaveRoomRequest {
    pub room_id: RoomId,
}

impl MatrixRequest for LeaveRoomRequest {
    type Response = super::session::Empty;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("/_matrix/client/v3/rooms/{}/leave", encode(&self.room_id))
    }
}

/// `POST /_matrix/client/v3/rooms/{roomId}/forget`.
pub struct ForgetRoomRequest {
    pub room_id: RoomId,
}

impl MatrixRequest for ForgetRoomRequest {
    type Response = super::session::Empty;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("/_matrix/client/v3/rooms/{}/forget", encode(&self.room_id))
    }
}

/// `POST /_matrix/client/v3/rooms/{roomId}/invite`.
pub struct InviteUserRequest {
    pub room_id: RoomId,
    pub user_id: UserId,
}

impl MatrixRequest for InviteUserRequest {
    type Response = super::session::Empty;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("/_matrix/client/v3/rooms/{}/invite", encode(&self.room_id))
    }

    fn body(&self) -> RequestBody {
        RequestBody::Json(json!({ "user_id": self.user_id }))
    }
}

/// A third-party invite attached to room creation.
#[derive(Clone, Debug)]
pub struct Invite3pid {
    pub id_server: String,
    pub id_access_token: String,
    pub medium: String,
    pub address: String,
}

/// An initial state event attached to room creation.
#[derive(Clone, Debug)]
pub struct InitialStateEvent {
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

/// The visibility of a newly created room in the public directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomVisibility {
    Publish,
    Unpublish,
}

/// `POST /_matrix/client/v3/createRoom`.
pub struct CreateRoomRequest {
    pub visibility: RoomVisibility,
    pub alias: Option<String>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub invites: Vec<UserId>,
    pub invite_3pids: Vec<Invite3pid>,
    pub room_version: Option<String>,
    pub creation_content: Option<Value>,
    pub initial_state: Vec<InitialStateEvent>,
    pub preset: Option<String>,
    pub is_direct: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
}

impl MatrixRequest for CreateRoomRequest {
    type Response = CreateRoomResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/createRoom".to_owned()
    }

    fn body(&self) -> RequestBody {
        let mut body = Map::new();
        body.insert(
            "visibility".to_owned(),
            json!(match self.visibility {
                RoomVisibility::Publish => "public",
                RoomVisibility::Unpublish => "private",
            }),
        );
        if let Some(alias) = &self.alias {
            body.insert("room_alias_name".to_owned(), json!(alias));
        }
        if let Some(name) = &self.name {
            body.insert("name".to_owned(), json!(name));
        }
        if let Some(topic) = &self.topic {
            body.insert("topic".to_owned(), json!(topic));
        }
        if !self.invites.is_empty() {
            body.insert("invite".to_owned(), json!(self.invites));
        }
        if !self.invite_3pids.is_empty() {
            let threepids: Vec<Value> = self
                .invite_3pids
                .iter()
                .map(|i| {
                    json!({
                        "id_server": i.id_server,
                        "id_access_token": i.id_access_token,
                        "medium": i.medium,
                        "address": i.address,
                    })
                })
                .collect();
            body.insert("invite_3pid".to_owned(), json!(threepids));
        }
        if let Some(version) = &self.room_version {
            body.insert("room_version".to_owned(), json!(version));
        }
        if let Some(content) = &self.creation_content {
            body.insert("creation_content".to_owned(), content.clone());
        }
        if !self.initial_state.is_empty() {
            let state: Vec<Value> = self
                .initial_state
                .iter()
                .map(|e| {
                    json!({
                        "type": e.event_type,
                        "state_key": e.state_key,
                        "content": e.content,
                    })
                })
                .collect();
            body.insert("initial_state".to_owned(), json!(state));
        }
        if let Some(preset) = &self.preset {
            body.insert("preset".to_owned(), json!(preset));
        }
        if self.is_direct {
            body.insert("is_direct".to_owned(), json!(true));
        }
        RequestBody::Json(Value::Object(body))
    }
}

/// `PUT /_matrix/client/v3/rooms/{roomId}/send/{eventType}/{txnId}`.
pub struct SendMessageRequest {
    pub room_id: RoomId,
    pub event_type: String,
    pub txn_id: String,
    pub content: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SendMessageResponse {
    pub event_id: String,
}

impl MatrixRequest for SendMessageRequest {
    type Response = SendMessageResponse;

    fn method(&self) -> Method {
        Method::PUT
    }

    fn path(&self) -> String {
        format!(
            "/_matrix/client/v3/rooms/{}/send/{}/{}",
            encode(&self.room_id),
            encode(&self.event_type),
            encode(&self.txn_id)
        )
    }

    fn body(&self) -> RequestBody {
        RequestBody::Json(self.content.clone())
    }
}

/// `PUT /_matrix/client/v3/sendToDevice/{eventType}/{txnId}`.
pub struct SendToDeviceRequest {
    pub event_type: String,
    pub txn_id: String,
    /// user id → device id (or `*`) → event content.
    pub messages: Value,
}

impl MatrixRequest for SendToDeviceRequest {
    type Response = super::session::Empty;

    fn method(&self) -> Method {
        Method::PUT
    }

    fn path(&self) -> String {
        format!(
            "/_matrix/client/v3/sendToDevice/{}/{}",
            encode(&self.event_type),
            encode(&self.txn_id)
        )
    }

    fn body(&self) -> RequestBody {
        RequestBody::Json(json!({ "messages": self.messages }))
    }
}
