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

//! Call lifecycle events (`m.call.*`).

use serde_json::{Map, Value};

use super::{base_accessors, room_accessors, Event};

macro_rules! call_event {
    ($(#[$meta:meta])* $name:ident, $type_id:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name(pub(crate) Event);
        base_accessors!($name);
        room_accessors!($name);

        impl $name {
            pub const TYPE_ID: &'static str = $type_id;

            /// The identifier tying the events of one call together.
            pub fn call_id(&self) -> &str {
                self.0.content_str("call_id").unwrap_or("")
            }
        }
    };
}

call_event!(
    /// An `m.call.invite` event, opening a call.
    CallInviteEvent, "m.call.invite"
);
call_event!(
    /// An `m.call.candidates` event, carrying ICE candidates.
    CallCandidatesEvent, "m.call.candidates"
);
call_event!(
    /// An `m.call.answer` event, accepting a call.
    CallAnswerEvent, "m.call.answer"
);
call_event!(
    /// An `m.call.hangup` event, ending a call.
    CallHangupEvent, "m.call.hangup"
);

impl CallInviteEvent {
    /// The caller's session description offer.
    pub fn sdp(&self) -> Option<&str> {
        self.0.content().get("offer")?.get("sdp").and_then(Value::as_str)
    }

    /// How long the invite stays valid, in milliseconds.
    pub fn lifetime(&self) -> Option<u64> {
        self.0.content().get("lifetime").and_then(Value::as_u64)
    }
}

impl CallAnswerEvent {
    /// The callee's session description answer.
    pub fn sdp(&self) -> Option<&str> {
        self.0.content().get("answer")?.get("sdp").and_then(Value::as_str)
    }
}
