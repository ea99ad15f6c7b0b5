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

//! The `/sync` endpoint.

use std::time::Duration;

use http::Method;
use serde_json::json;

use crate::{http_client::MatrixRequest, sync::SyncResponse};

/// The event filter attached to every sync request.
#[derive(Clone, Debug)]
pub struct Filter {
    /// Cap on the number of timeline events per room per response.
    pub timeline_limit: u32,
    /// Ask the server to defer membership events to when they're needed.
    pub lazy_load_members: bool,
}

impl Default for Filter {
    fn default() -> Self {
        Filter { timeline_limit: 100, lazy_load_members: false }
    }
}

impl Filter {
    fn to_json(&self) -> String {
        json!({
            "room": {
                "timeline": { "limit": self.timeline_limit },
                "state": { "lazy_load_members": self.lazy_load_members },
            }
        })
        .to_string()
    }
}

/// `GET /_matrix/client/v3/sync` — the long-polling sync stream.
pub struct SyncRequest {
    pub since: Option<String>,
    pub filter: Filter,
    pub timeout: Duration,
}

impl MatrixRequest for SyncRequest {
    type Response = SyncResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        "/_matrix/client/v3/sync".to_owned()
    }

    fn query(&self) -> Vec<(String, String)> {
        let mut query = vec![
            ("filter".to_owned(), self.filter.to_json()),
            ("timeout".to_owned(), self.timeout.as_millis().to_string()),
        ];
        if let Some(since) = &self.since {
            query.push(("since".to_owned(), since.clone()));
        }
        query
    }
}
