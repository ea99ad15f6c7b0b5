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

//! The `m.key.verification.*` event family driving the SAS verification
//! protocol.

use serde_json::{Map, Value};

use super::{base_accessors, Event};

macro_rules! verification_event {
    ($(#[$meta:meta])* $name:ident, $type_id:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name(pub(crate) Event);
        base_accessors!($name);

        impl $name {
            pub const TYPE_ID: &'static str = $type_id;

            /// The transaction id of the verification flow.
            pub fn transaction_id(&self) -> &str {
                self.0.content_str("transaction_id").unwrap_or("")
            }

            /// The sender of this event, where the payload carries one.
            pub fn sender(&self) -> Option<&str> {
                self.0.full_json().get("sender").and_then(Value::as_str)
            }
        }
    };
}

verification_event!(
    /// Opens a verification flow with another device.
    KeyVerificationRequestEvent, "m.key.verification.request"
);
verification_event!(
    /// Signals readiness to proceed with one of the requested methods.
    KeyVerificationReadyEvent, "m.key.verification.ready"
);
verification_event!(
    /// Starts a concrete verification method.
    KeyVerificationStartEvent, "m.key.verification.start"
);
verification_event!(
    /// Accepts a started verification, committing to the chosen protocols.
    KeyVerificationAcceptEvent, "m.key.verification.accept"
);
verification_event!(
    /// Carries an ephemeral public key.
    KeyVerificationKeyEvent, "m.key.verification.key"
);
verification_event!(
    /// Carries the key MACs confirming the short auth string matched.
    KeyVerificationMacEvent, "m.key.verification.mac"
);
verification_event!(
    /// Cancels the verification flow.
    KeyVerificationCancelEvent, "m.key.verification.cancel"
);
verification_event!(
    /// Concludes a successful verification flow.
    KeyVerificationDoneEvent, "m.key.verification.done"
);

impl KeyVerificationRequestEvent {
    /// The device that sent the request.
    pub fn from_device(&self) -> &str {
        self.0.content_str("from_device").unwrap_or("")
    }

    /// The verification methods the requester supports.
    pub fn methods(&self) -> Vec<String> {
        string_list(self.0.content().get("methods"))
    }
}

impl KeyVerificationReadyEvent {
    pub fn from_device(&self) -> &str {
        self.0.content_str("from_device").unwrap_or("")
    }

    pub fn methods(&self) -> Vec<String> {
        string_list(self.0.content().get("methods"))
    }
}

impl KeyVerificationStartEvent {
    pub fn from_device(&self) -> &str {
        self.0.content_str("from_device").unwrap_or("")
    }

    /// The chosen verification method, `m.sas.v1` being the only one the
    /// library speaks.
    pub fn method(&self) -> &str {
        self.0.content_str("method").unwrap_or("")
    }

    pub fn key_agreement_protocols(&self) -> Vec<String> {
        string_list(self.0.content().get("key_agreement_protocols"))
    }

    pub fn hashes(&self) -> Vec<String> {
        string_list(self.0.content().get("hashes"))
    }

    pub fn message_authentication_codes(&self) -> Vec<String> {
        string_list(self.0.content().get("message_authentication_codes"))
    }

    pub fn short_authentication_strings(&self) -> Vec<String> {
        string_list(self.0.content().get("short_authentication_string"))
    }
}

impl KeyVerificationAcceptEvent {
    pub fn key_agreement_protocol(&self) -> &str {
        self.0.content_str("key_agreement_protocol").unwrap_or("")
    }

    pub fn message_authentication_code(&self) -> &str {
        self.0.content_str("message_authentication_code").unwrap_or("")
    }

    /// The hash commitment to the accepter's ephemeral key.
    pub fn commitment(&self) -> &str {
        self.0.content_str("commitment").unwrap_or("")
    }
}

impl KeyVerificationKeyEvent {
    /// The sender's ephemeral curve25519 key, unpadded base64.
    pub fn key(&self) -> &str {
        self.0.content_str("key").unwrap_or("")
    }
}

impl KeyVerificationMacEvent {
    /// The MAC of the comma-separated, sorted list of MAC'd key ids.
    pub fn keys_mac(&self) -> &str {
        self.0.content_str("keys").unwrap_or("")
    }

    /// The MACs of the sender's keys, by key id.
    pub fn mac(&self) -> Vec<(String, String)> {
        self.0
            .content()
            .get("mac")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl KeyVerificationCancelEvent {
    /// The machine-readable cancellation code, e.g. `m.mismatched_sas`.
    pub fn code(&self) -> &str {
        self.0.content_str("code").unwrap_or("")
    }

    pub fn reason(&self) -> &str {
        self.0.content_str("reason").unwrap_or("")
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).map(ToOwned::to_owned).collect())
        .unwrap_or_default()
}
