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

//! End-to-end encryption: the olm account lifetime, device-list tracking,
//! megolm session management and interactive key verification.

use thiserror::Error;

mod device;
mod group_sessions;
mod machine;
mod store;
pub(crate) mod verification;

pub use device::{CrossSigningKeys, Device};
pub use group_sessions::{InboundSessionRecord, OutboundSessionRecord};
pub use machine::{OlmMachine, ToDeviceOutcome};
pub use store::{CryptoStore, MemoryCryptoStore};
pub use verification::{
    EmojiEntry, KeyVerificationSession, SasState, VerificationState, SAS_EMOJI,
    SUPPORTED_MACS, SUPPORTED_SAS_METHODS,
};

/// The algorithm names this library speaks.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// An error inside the end-to-end encryption machinery.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// No megolm session is known for an inbound encrypted event; the
    /// event stays pending until the key arrives.
    #[error("no matching megolm session for room {room_id}, session {session_id}")]
    NoMatchingSession { room_id: String, session_id: String },
    /// A device referenced by an operation is not in the device-key table.
    #[error("unknown device {user_id} {device_id}")]
    UnknownDevice { user_id: String, device_id: String },
    /// A signature on a key payload did not verify.
    #[error("signature verification failed")]
    SignatureMismatch,
    /// An encrypted payload was malformed or failed to decrypt.
    #[error("bad encrypted message: {0}")]
    BadEncryptedMessage(String),
    /// The event declares an algorithm this library doesn't implement.
    #[error("unsupported encryption algorithm {0}")]
    UnsupportedAlgorithm(String),
    /// Pickling or unpickling the olm account failed.
    #[error("olm pickle error: {0}")]
    Pickle(String),
    /// The keychain holding the pickle key failed.
    #[error(transparent)]
    Keychain(#[from] crate::store::KeychainError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub(crate) type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Matrix canonical JSON: sorted keys, no insignificant whitespace, with
/// `signatures` and `unsigned` removed. serde_json maps are ordered, so
/// serializing the stripped object is canonical already.
pub(crate) fn canonical_json(value: &serde_json::Value) -> String {
    let mut stripped = value.clone();
    if let Some(object) = stripped.as_object_mut() {
        object.remove("signatures");
        object.remove("unsigned");
    }
    stripped.to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::canonical_json;

    #[test]
    fn canonical_json_strips_and_sorts() {
        let value = json!({
            "user_id": "@alice:example.org",
            "signatures": { "@alice:example.org": {} },
            "unsigned": { "age": 5 },
            "algorithms": ["m.megolm.v1.aes-sha2"],
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"algorithms":["m.megolm.v1.aes-sha2"],"user_id":"@alice:example.org"}"#
        );
    }
}
