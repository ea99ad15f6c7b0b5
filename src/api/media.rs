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

//! Media repository endpoints.

use http::Method;
use serde::Deserialize;
use serde_json::Value;

use super::encode;
use crate::http_client::{MatrixRequest, RequestBody};

/// `POST /_matrix/media/v3/upload`.
pub struct UploadContentRequest {
    pub data: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UploadContentResponse {
    pub content_uri: String,
}

impl MatrixRequest for UploadContentRequest {
    type Response = UploadContentResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        "/_matrix/media/v3/upload".to_owned()
    }

    fn query(&self) -> Vec<(String, String)> {
        self.filename.iter().map(|f| ("filename".to_owned(), f.clone())).collect()
    }

    fn body(&self) -> RequestBody {
        RequestBody::Bytes { data: self.data.clone(), content_type: self.content_type.clone() }
    }
}

/// `GET /_matrix/media/v3/download/{serverName}/{mediaId}`.
///
/// The response body is the raw content; this request goes through
/// `send_raw`, the JSON response type is never used.
pub struct GetContentRequest {
    pub server_name: String,
    pub media_id: String,
}

impl MatrixRequest for GetContentRequest {
    type Response = Value;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!(
            "/_matrix/media/v3/download/{}/{}",
            encode(&self.server_name),
            encode(&self.media_id)
        )
    }
}

/// `GET /_matrix/media/v3/thumbnail/{serverName}/{mediaId}`.
pub struct GetThumbnailRequest {
    pub server_name: String,
    pub media_id: String,
    pub width: u32,
    pub height: u32,
}

impl MatrixRequest for GetThumbnailRequest {
    type Response = Value;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!(
            "/_matrix/media/v3/thumbnail/{}/{}",
            encode(&self.server_name),
            encode(&self.media_id)
        )
    }

    fn query(&self) -> Vec<(String, String)> {
        vec![
            ("width".to_owned(), self.width.to_string()),
            ("height".to_owned(), self.height.to_string()),
            ("method".to_owned(), "scale".to_owned()),
        ]
    }
}
