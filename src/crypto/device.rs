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

//! Device keys and cross-signing keys, as tracked per user.

use std::collections::BTreeMap;

use serde_json::Value;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use super::{canonical_json, CryptoError, CryptoResult};
use crate::identifiers::{DeviceId, UserId};

/// One device of a tracked user, as learnt from `/keys/query`.
#[derive(Clone, Debug)]
pub struct Device {
    user_id: UserId,
    device_id: DeviceId,
    /// Key id (`curve25519:<device>`, `ed25519:<device>`) → base64 key.
    keys: BTreeMap<String, String>,
    algorithms: Vec<String>,
    display_name: Option<String>,
    verified: bool,
    /// Verified transitively through the user's own cross-signing keys.
    self_verified: bool,
}

impl Device {
    /// Builds a device from a `device_keys` payload, verifying its
    /// self-signature first.
    pub fn from_keys_payload(
        user_id: &str,
        device_id: &str,
        payload: &Value,
    ) -> CryptoResult<Device> {
        let claimed_user = payload.get("user_id").and_then(Value::as_str).unwrap_or("");
        let claimed_device = payload.get("device_id").and_then(Value::as_str).unwrap_or("");
        if claimed_user != user_id || claimed_device != device_id {
            return Err(CryptoError::BadEncryptedMessage(
                "mismatching ids in device keys payload".to_owned(),
            ));
        }

        let keys: BTreeMap<String, String> = payload
            .get("keys")
            .and_then(Value::as_object)
            .map(|keys| {
                keys.iter()
                    .filter_map(|(id, key)| key.as_str().map(|k| (id.clone(), k.to_owned())))
                    .collect()
            })
            .unwrap_or_default();

        let device = Device {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            keys,
            algorithms: payload
                .get("algorithms")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(ToOwned::to_owned).collect())
                .unwrap_or_default(),
            display_name: payload
                .get("unsigned")
                .and_then(|u| u.get("device_display_name"))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            verified: false,
            self_verified: false,
        };

        let signing_key = device.ed25519_key().ok_or(CryptoError::SignatureMismatch)?;
        verify_signature(payload, user_id, &format!("ed25519:{device_id}"), &signing_key)?;
        Ok(device)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn algorithms(&self) -> &[String] {
        &self.algorithms
    }

    /// The device's curve25519 (identity) key.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        let key = self.keys.get(&format!("curve25519:{}", self.device_id))?;
        Curve25519PublicKey::from_base64(key).ok()
    }

    /// The device's curve25519 key in base64, as used for map keys.
    pub fn curve25519_key_base64(&self) -> Option<&str> {
        self.keys.get(&format!("curve25519:{}", self.device_id)).map(String::as_str)
    }

    /// The device's ed25519 (signing) key.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        let key = self.keys.get(&format!("ed25519:{}", self.device_id))?;
        Ed25519PublicKey::from_base64(key).ok()
    }

    pub fn ed25519_key_base64(&self) -> Option<&str> {
        self.keys.get(&format!("ed25519:{}", self.device_id)).map(String::as_str)
    }

    /// Whether this device was verified interactively (SAS).
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub(crate) fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }

    /// Whether this device is signed by its owner's self-signing key.
    pub fn is_self_verified(&self) -> bool {
        self.self_verified
    }

    pub(crate) fn set_self_verified(&mut self, verified: bool) {
        self.self_verified = verified;
    }
}

/// The cross-signing key set of one user.
#[derive(Clone, Debug, Default)]
pub struct CrossSigningKeys {
    pub master_key: Option<String>,
    pub self_signing_key: Option<String>,
    pub user_signing_key: Option<String>,
    /// Whether we verified the master key (e.g. through user verification).
    pub verified: bool,
}

/// Extracts the base64 key out of a cross-signing key payload.
pub(crate) fn cross_signing_key(payload: &Value) -> Option<String> {
    payload
        .get("keys")
        .and_then(Value::as_object)?
        .values()
        .next()
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

/// Verifies the signature `signatures[user_id][key_id]` over the
/// canonical form of `payload`.
pub(crate) fn verify_signature(
    payload: &Value,
    user_id: &str,
    key_id: &str,
    signing_key: &Ed25519PublicKey,
) -> CryptoResult<()> {
    let signature = payload
        .get("signatures")
        .and_then(|s| s.get(user_id))
        .and_then(|s| s.get(key_id))
        .and_then(Value::as_str)
        .ok_or(CryptoError::SignatureMismatch)?;
    let signature =
        Ed25519Signature::from_base64(signature).map_err(|_| CryptoError::SignatureMismatch)?;

    let canonical = canonical_json(payload);
    signing_key
        .verify(canonical.as_bytes(), &signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use vodozemac::olm::Account;

    use super::*;

    fn signed_device_payload(account: &Account, user_id: &str, device_id: &str) -> Value {
        let mut payload = json!({
            "user_id": user_id,
            "device_id": device_id,
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "keys": {
                format!("curve25519:{device_id}"): account.curve25519_key().to_base64(),
                format!("ed25519:{device_id}"): account.ed25519_key().to_base64(),
            },
        });
        let signature = account.sign(&canonical_json(&payload));
        payload["signatures"] =
            json!({ user_id: { format!("ed25519:{device_id}"): signature.to_base64() } });
        payload
    }

    #[test]
    fn valid_self_signature_is_accepted() {
        let account = Account::new();
        let payload = signed_device_payload(&account, "@alice:example.org", "ALICEDEV");
        let device =
            Device::from_keys_payload("@alice:example.org", "ALICEDEV", &payload).unwrap();
        assert_eq!(device.curve25519_key().unwrap(), account.curve25519_key());
        assert!(!device.is_verified());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let account = Account::new();
        let mut payload = signed_device_payload(&account, "@alice:example.org", "ALICEDEV");
        payload["algorithms"] = json!(["m.fake.algorithm"]);
        let result = Device::from_keys_payload("@alice:example.org", "ALICEDEV", &payload);
        assert!(matches!(result, Err(CryptoError::SignatureMismatch)));
    }

    #[test]
    fn mismatching_ids_are_rejected() {
        let account = Account::new();
        let payload = signed_device_payload(&account, "@alice:example.org", "ALICEDEV");
        let result = Device::from_keys_payload("@mallory:example.org", "ALICEDEV", &payload);
        assert!(result.is_err());
    }
}
