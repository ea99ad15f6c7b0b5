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

//! Interactive key verification with short authentication strings.
//!
//! One session covers one `(remote user, remote device, transaction id)`
//! flow. The session is a pure state machine: every input either mutates
//! the state or additionally produces to-device messages for the caller to
//! dispatch, so two sessions can be driven against each other directly in
//! tests.

use std::{
    sync::{Mutex, RwLock},
    time::{Duration, Instant},
};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use vodozemac::{
    sas::{EstablishedSas, Mac, Sas},
    Curve25519PublicKey,
};

use super::{canonical_json, CryptoError, CryptoResult};
use crate::identifiers::{DeviceId, UserId};

/// The message authentication codes offered in a `start` event, preferred
/// last.
pub const SUPPORTED_MACS: [&str; 2] = ["hkdf-hmac-sha256", "hkdf-hmac-sha256.v2"];
/// The short-auth-string renderings both sides can use.
pub const SUPPORTED_SAS_METHODS: [&str; 2] = ["decimal", "emoji"];
/// The single key agreement protocol.
const KEY_AGREEMENT_PROTOCOL: &str = "curve25519-hkdf-sha256";
const SAS_METHOD: &str = "m.sas.v1";
const HASH: &str = "sha256";

/// Sessions that saw no progress for this long get cancelled.
const VERIFICATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The lifecycle of a verification flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationState {
    /// The request has been newly created by us.
    Created,
    /// The request was sent, or received from the other party.
    Requested,
    /// Both sides are ready to start a verification method.
    Ready,
    /// A concrete method (SAS) has taken over.
    Transitioned,
    /// The flow finished successfully.
    Done,
    /// The flow was cancelled by either side or timed out.
    Cancelled,
}

/// The sub-states of the SAS method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SasState {
    /// No SAS flow has started yet.
    NotStarted,
    /// A `start` event was sent or received.
    Started,
    /// The protocols were agreed on.
    Accepted,
    /// Public keys are exchanged; the short auth string can be shown.
    KeysExchanged,
    /// We confirmed; waiting for the other side's MAC.
    Confirmed,
    /// Both MACs verified.
    SasDone,
    /// The SAS flow was cancelled.
    SasCancelled,
}

/// One entry of the emoji short-auth-string table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmojiEntry {
    pub emoji: &'static str,
    pub description: &'static str,
}

/// The identity of the local account, as the verification layer needs it.
#[derive(Clone, Debug)]
pub(crate) struct OwnIdentity {
    pub user_id: UserId,
    pub device_id: DeviceId,
    /// Our ed25519 device key, base64.
    pub ed25519: String,
}

/// A to-device message a verification session wants sent to its remote
/// device.
#[derive(Clone, Debug)]
pub(crate) struct OutgoingVerificationMessage {
    pub event_type: String,
    pub content: Value,
}

enum SasPhase {
    Fresh(Sas),
    Established(EstablishedSas),
    Gone,
}

struct Inner {
    phase: SasPhase,
    our_public_key: String,
    their_public_key: Option<String>,
    /// The content of the `start` event, the commitment's hash input.
    start_content: Option<Value>,
    we_sent_start: bool,
    commitment: Option<String>,
    mac_method: &'static str,
    we_confirmed: bool,
    their_mac_verified: bool,
    done_sent: bool,
}

/// A key verification session.
///
/// Created through
/// [`Connection::start_key_verification_session`](crate::Connection::start_key_verification_session)
/// or delivered through
/// [`ConnectionEvents::on_new_key_verification_session`](crate::ConnectionEvents::on_new_key_verification_session)
/// for incoming requests.
pub struct KeyVerificationSession {
    own: OwnIdentity,
    remote_user_id: UserId,
    remote_device_id: RwLock<DeviceId>,
    their_ed25519: RwLock<Option<String>>,
    transaction_id: String,
    we_started: bool,
    state: Mutex<VerificationState>,
    sas_state: Mutex<SasState>,
    inner: Mutex<Inner>,
    created: Instant,
}

impl std::fmt::Debug for KeyVerificationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVerificationSession")
            .field("remote_user_id", &self.remote_user_id)
            .field("transaction_id", &self.transaction_id)
            .field("state", &self.state())
            .field("sas_state", &self.sas_state())
            .finish()
    }
}

impl KeyVerificationSession {
    fn new(
        own: OwnIdentity,
        remote_user_id: UserId,
        remote_device_id: DeviceId,
        transaction_id: String,
        we_started: bool,
    ) -> KeyVerificationSession {
        let sas = Sas::new();
        let our_public_key = sas.public_key().to_base64();
        KeyVerificationSession {
            own,
            remote_user_id,
            remote_device_id: RwLock::new(remote_device_id),
            their_ed25519: RwLock::new(None),
            transaction_id,
            we_started,
            state: Mutex::new(if we_started {
                VerificationState::Created
            } else {
                VerificationState::Requested
            }),
            sas_state: Mutex::new(SasState::NotStarted),
            inner: Mutex::new(Inner {
                phase: SasPhase::Fresh(sas),
                our_public_key,
                their_public_key: None,
                start_content: None,
                we_sent_start: false,
                commitment: None,
                mac_method: "hkdf-hmac-sha256.v2",
                we_confirmed: false,
                their_mac_verified: false,
                done_sent: false,
            }),
            created: Instant::now(),
        }
    }

    /// A session we initiate towards a remote device.
    pub(crate) fn outgoing(
        own: OwnIdentity,
        remote_user_id: &str,
        remote_device_id: &str,
        transaction_id: String,
    ) -> KeyVerificationSession {
        Self::new(own, remote_user_id.to_owned(), remote_device_id.to_owned(), transaction_id, true)
    }

    /// A session created for an incoming `m.key.verification.request`.
    pub(crate) fn incoming(
        own: OwnIdentity,
        remote_user_id: &str,
        remote_device_id: &str,
        transaction_id: String,
    ) -> KeyVerificationSession {
        Self::new(
            own,
            remote_user_id.to_owned(),
            remote_device_id.to_owned(),
            transaction_id,
            false,
        )
    }

    /// The Matrix id of the user being verified.
    pub fn remote_user_id(&self) -> &UserId {
        &self.remote_user_id
    }

    /// The device being verified.
    pub fn remote_device_id(&self) -> DeviceId {
        self.remote_device_id.read().unwrap().clone()
    }

    /// The transaction id tying the flow's events together.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> VerificationState {
        *self.state.lock().unwrap()
    }

    /// The current SAS sub-state.
    pub fn sas_state(&self) -> SasState {
        *self.sas_state.lock().unwrap()
    }

    pub fn is_done(&self) -> bool {
        self.state() == VerificationState::Done
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == VerificationState::Cancelled
    }

    pub(crate) fn set_their_ed25519(&self, key: String) {
        *self.their_ed25519.write().unwrap() = Some(key);
    }

    fn set_state(&self, state: VerificationState) {
        let mut current = self.state.lock().unwrap();
        if *current != state {
            info!(transaction_id = %self.transaction_id, ?state, "verification state");
            *current = state;
        }
    }

    fn set_sas_state(&self, state: SasState) {
        let mut current = self.sas_state.lock().unwrap();
        if *current != state {
            info!(transaction_id = %self.transaction_id, ?state, "SAS state");
            *current = state;
        }
    }

    /// The opening request message; moves the session to Requested.
    pub(crate) fn initial_request(&self, timestamp_ms: u64) -> OutgoingVerificationMessage {
        self.set_state(VerificationState::Requested);
        OutgoingVerificationMessage {
            event_type: "m.key.verification.request".to_owned(),
            content: json!({
                "from_device": self.own.device_id,
                "transaction_id": self.transaction_id,
                "methods": [SAS_METHOD],
                "timestamp": timestamp_ms,
            }),
        }
    }

    /// Accepts an incoming request, signalling readiness.
    pub fn accept(&self) -> Option<OutgoingVerificationMessage> {
        if self.we_started || self.state() != VerificationState::Requested {
            return None;
        }
        self.set_state(VerificationState::Ready);
        Some(OutgoingVerificationMessage {
            event_type: "m.key.verification.ready".to_owned(),
            content: json!({
                "from_device": self.own.device_id,
                "transaction_id": self.transaction_id,
                "methods": [SAS_METHOD],
            }),
        })
    }

    pub(crate) fn receive_ready(&self, content: &Value) {
        if let Some(device) = content.get("from_device").and_then(Value::as_str) {
            *self.remote_device_id.write().unwrap() = device.to_owned();
        }
        self.set_state(VerificationState::Ready);
    }

    /// Starts the SAS flow; valid once both sides are Ready.
    pub fn start_sas(&self) -> Option<OutgoingVerificationMessage> {
        if self.state() != VerificationState::Ready {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let content = json!({
            "from_device": self.own.device_id,
            "transaction_id": self.transaction_id,
            "method": SAS_METHOD,
            "key_agreement_protocols": [KEY_AGREEMENT_PROTOCOL],
            "hashes": [HASH],
            "message_authentication_codes": SUPPORTED_MACS,
            "short_authentication_string": SUPPORTED_SAS_METHODS,
        });
        inner.start_content = Some(content.clone());
        inner.we_sent_start = true;
        drop(inner);

        self.set_state(VerificationState::Transitioned);
        self.set_sas_state(SasState::Started);
        Some(OutgoingVerificationMessage {
            event_type: "m.key.verification.start".to_owned(),
            content,
        })
    }

    pub(crate) fn receive_start(
        &self,
        content: &Value,
    ) -> CryptoResult<Vec<OutgoingVerificationMessage>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.we_sent_start {
            // Start glare: the lexicographically smaller user id wins; if
            // that's us, the remote start is dropped on the floor.
            if self.own.user_id < self.remote_user_id {
                return Ok(Vec::new());
            }
            inner.we_sent_start = false;
        }

        let offered_macs: Vec<&str> = content
            .get("message_authentication_codes")
            .and_then(Value::as_array)
            .map(|l| l.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let protocols: Vec<&str> = content
            .get("key_agreement_protocols")
            .and_then(Value::as_array)
            .map(|l| l.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if !protocols.contains(&KEY_AGREEMENT_PROTOCOL) {
            drop(inner);
            return Ok(vec![self.cancel_internal("m.unknown_method", "unsupported protocols")]);
        }
        inner.mac_method = if offered_macs.contains(&"hkdf-hmac-sha256.v2") {
            "hkdf-hmac-sha256.v2"
        } else {
            "hkdf-hmac-sha256"
        };
        inner.start_content = Some(content.clone());

        // Commit to our ephemeral key before seeing theirs.
        let commitment =
            commitment_hash(&inner.our_public_key, &canonical_json(content));
        let accept = OutgoingVerificationMessage {
            event_type: "m.key.verification.accept".to_owned(),
            content: json!({
                "transaction_id": self.transaction_id,
                "method": SAS_METHOD,
                "key_agreement_protocol": KEY_AGREEMENT_PROTOCOL,
                "hash": HASH,
                "message_authentication_code": inner.mac_method,
                "short_authentication_string": SUPPORTED_SAS_METHODS,
                "commitment": commitment,
            }),
        };
        drop(inner);

        self.set_state(VerificationState::Transitioned);
        self.set_sas_state(SasState::Accepted);
        Ok(vec![accept])
    }

    pub(crate) fn receive_accept(&self, content: &Value) -> Vec<OutgoingVerificationMessage> {
        let mut inner = self.inner.lock().unwrap();
        inner.commitment =
            content.get("commitment").and_then(Value::as_str).map(ToOwned::to_owned);
        if content.get("message_authentication_code").and_then(Value::as_str)
            == Some("hkdf-hmac-sha256")
        {
            inner.mac_method = "hkdf-hmac-sha256";
        }
        let key = OutgoingVerificationMessage {
            event_type: "m.key.verification.key".to_owned(),
            content: json!({
                "transaction_id": self.transaction_id,
                "key": inner.our_public_key,
            }),
        };
        drop(inner);
        self.set_sas_state(SasState::Accepted);
        vec![key]
    }

    pub(crate) fn receive_key(
        &self,
        content: &Value,
    ) -> CryptoResult<Vec<OutgoingVerificationMessage>> {
        let their_key = content
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| CryptoError::BadEncryptedMessage("key event without key".to_owned()))?
            .to_owned();

        let mut inner = self.inner.lock().unwrap();
        let mut messages = Vec::new();

        if inner.we_sent_start {
            // We started, so the accepter committed to this key; check the
            // commitment before the string is ever shown.
            let start_content = inner.start_content.clone().unwrap_or_default();
            let expected = commitment_hash(&their_key, &canonical_json(&start_content));
            if inner.commitment.as_deref() != Some(expected.as_str()) {
                drop(inner);
                warn!(transaction_id = %self.transaction_id, "SAS commitment mismatch");
                return Ok(vec![
                    self.cancel_internal("m.mismatched_commitment", "commitment mismatch")
                ]);
            }
        } else {
            messages.push(OutgoingVerificationMessage {
                event_type: "m.key.verification.key".to_owned(),
                content: json!({
                    "transaction_id": self.transaction_id,
                    "key": inner.our_public_key,
                }),
            });
        }

        let public_key = Curve25519PublicKey::from_base64(&their_key)
            .map_err(|e| CryptoError::BadEncryptedMessage(format!("bad SAS key: {e}")))?;
        match std::mem::replace(&mut inner.phase, SasPhase::Gone) {
            SasPhase::Fresh(sas) => {
                let established = sas.diffie_hellman(public_key).map_err(|e| {
                    CryptoError::BadEncryptedMessage(format!("SAS key agreement failed: {e}"))
                })?;
                inner.phase = SasPhase::Established(established);
            }
            other => inner.phase = other,
        }
        inner.their_public_key = Some(their_key);
        drop(inner);

        self.set_sas_state(SasState::KeysExchanged);
        Ok(messages)
    }

    // The info string both sides feed into the SAS KDF; the starter's
    // identity comes first.
    fn sas_info(&self, inner: &Inner) -> String {
        let our = (
            self.own.user_id.as_str(),
            self.own.device_id.as_str(),
            inner.our_public_key.as_str(),
        );
        let remote_device = self.remote_device_id.read().unwrap();
        let their_key = inner.their_public_key.as_deref().unwrap_or("");
        let their = (self.remote_user_id.as_str(), remote_device.as_str(), their_key);
        let (first, second) = if inner.we_sent_start { (our, their) } else { (their, our) };
        format!(
            "MATRIX_KEY_VERIFICATION_SAS|{}|{}|{}|{}|{}|{}|{}",
            first.0, first.1, first.2, second.0, second.1, second.2, self.transaction_id
        )
    }

    /// The emoji rendering of the short auth string, once keys are
    /// exchanged.
    pub fn emoji(&self) -> Option<Vec<EmojiEntry>> {
        let inner = self.inner.lock().unwrap();
        let SasPhase::Established(established) = &inner.phase else { return None };
        let bytes = established.bytes(&self.sas_info(&inner));
        Some(bytes.emoji_indices().iter().map(|i| SAS_EMOJI[*i as usize]).collect())
    }

    /// The decimal rendering of the short auth string.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        let inner = self.inner.lock().unwrap();
        let SasPhase::Established(established) = &inner.phase else { return None };
        Some(established.bytes(&self.sas_info(&inner)).decimals())
    }

    fn mac_info(&self, sender_is_us: bool) -> String {
        let remote_device = self.remote_device_id.read().unwrap();
        let (sender, sender_device, recipient, recipient_device) = if sender_is_us {
            (
                self.own.user_id.as_str(),
                self.own.device_id.as_str(),
                self.remote_user_id.as_str(),
                remote_device.as_str(),
            )
        } else {
            (
                self.remote_user_id.as_str(),
                remote_device.as_str(),
                self.own.user_id.as_str(),
                self.own.device_id.as_str(),
            )
        };
        format!(
            "MATRIX_KEY_VERIFICATION_MAC{sender}{sender_device}{recipient}{recipient_device}{}",
            self.transaction_id
        )
    }

    /// Confirms that the short auth strings match; sends our MACs.
    pub fn confirm(&self) -> Vec<OutgoingVerificationMessage> {
        let mut inner = self.inner.lock().unwrap();
        if inner.we_confirmed {
            return Vec::new();
        }
        let SasPhase::Established(established) = &inner.phase else { return Vec::new() };

        let info = self.mac_info(true);
        let our_key_id = format!("ed25519:{}", self.own.device_id);
        let key_mac = compute_mac(
            established,
            inner.mac_method,
            &self.own.ed25519,
            &format!("{info}{our_key_id}"),
        );
        let keys_mac =
            compute_mac(established, inner.mac_method, &our_key_id, &format!("{info}KEY_IDS"));

        inner.we_confirmed = true;
        let mac_message = OutgoingVerificationMessage {
            event_type: "m.key.verification.mac".to_owned(),
            content: json!({
                "transaction_id": self.transaction_id,
                "mac": { our_key_id: key_mac },
                "keys": keys_mac,
            }),
        };
        drop(inner);

        self.set_sas_state(SasState::Confirmed);
        let mut messages = vec![mac_message];
        messages.extend(self.maybe_complete());
        messages
    }

    pub(crate) fn receive_mac(
        &self,
        content: &Value,
    ) -> CryptoResult<Vec<OutgoingVerificationMessage>> {
        {
            let mut inner = self.inner.lock().unwrap();

            let SasPhase::Established(established) = &inner.phase else {
                return Err(CryptoError::BadEncryptedMessage(
                    "MAC received before key exchange".to_owned(),
                ));
            };
            let their_ed25519 = self.their_ed25519.read().unwrap().clone().ok_or_else(|| {
                CryptoError::BadEncryptedMessage("remote signing key unknown".to_owned())
            })?;

            let info = self.mac_info(false);
            let their_key_id = format!("ed25519:{}", self.remote_device_id.read().unwrap());

            let mac_ok = content
                .get("mac")
                .and_then(|m| m.get(&their_key_id))
                .and_then(Value::as_str)
                .is_some_and(|mac| {
                    verify_mac(
                        established,
                        inner.mac_method,
                        &their_ed25519,
                        &format!("{info}{their_key_id}"),
                        mac,
                    )
                });

            let mut key_ids: Vec<String> = content
                .get("mac")
                .and_then(Value::as_object)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            key_ids.sort();
            let keys_ok = content.get("keys").and_then(Value::as_str).is_some_and(|mac| {
                verify_mac(
                    established,
                    inner.mac_method,
                    &key_ids.join(","),
                    &format!("{info}KEY_IDS"),
                    mac,
                )
            });

            if !mac_ok || !keys_ok {
                drop(inner);
                warn!(transaction_id = %self.transaction_id, "SAS MAC verification failed");
                return Ok(vec![self.cancel_internal("m.key_mismatch", "MAC mismatch")]);
            }
            inner.their_mac_verified = true;
        }
        Ok(self.maybe_complete())
    }

    fn maybe_complete(&self) -> Vec<OutgoingVerificationMessage> {
        let mut inner = self.inner.lock().unwrap();
        if !(inner.we_confirmed && inner.their_mac_verified) || inner.done_sent {
            return Vec::new();
        }
        inner.done_sent = true;
        drop(inner);

        self.set_sas_state(SasState::SasDone);
        self.set_state(VerificationState::Done);
        vec![OutgoingVerificationMessage {
            event_type: "m.key.verification.done".to_owned(),
            content: json!({ "transaction_id": self.transaction_id }),
        }]
    }

    pub(crate) fn receive_done(&self) {
        // Our own Done transition happens when both MACs check out; the
        // remote's done needs no further action.
    }

    fn cancel_internal(&self, code: &str, reason: &str) -> OutgoingVerificationMessage {
        self.set_state(VerificationState::Cancelled);
        self.set_sas_state(SasState::SasCancelled);
        OutgoingVerificationMessage {
            event_type: "m.key.verification.cancel".to_owned(),
            content: json!({
                "transaction_id": self.transaction_id,
                "code": code,
                "reason": reason,
            }),
        }
    }

    /// Cancels the flow from our side.
    pub fn cancel(&self) -> OutgoingVerificationMessage {
        self.cancel_internal("m.user", "Cancelled by user")
    }

    pub(crate) fn receive_cancel(&self) {
        self.set_state(VerificationState::Cancelled);
        self.set_sas_state(SasState::SasCancelled);
    }

    pub(crate) fn timed_out(&self) -> bool {
        !self.is_done() && !self.is_cancelled() && self.created.elapsed() > VERIFICATION_TIMEOUT
    }

    /// Produces a timeout cancellation when the session has gone stale.
    pub(crate) fn cancel_if_timed_out(&self) -> Option<OutgoingVerificationMessage> {
        self.timed_out().then(|| self.cancel_internal("m.timeout", "Verification timed out"))
    }
}

fn commitment_hash(public_key: &str, canonical_start: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key.as_bytes());
    hasher.update(canonical_start.as_bytes());
    vodozemac::base64_encode(hasher.finalize())
}

fn compute_mac(established: &EstablishedSas, method: &str, input: &str, info: &str) -> String {
    match method {
        "hkdf-hmac-sha256.v2" => established.calculate_mac(input, info).to_base64(),
        _ => established.calculate_mac_invalid_base64(input, info),
    }
}

fn verify_mac(
    established: &EstablishedSas,
    method: &str,
    input: &str,
    info: &str,
    their_mac: &str,
) -> bool {
    match method {
        "hkdf-hmac-sha256.v2" => Mac::from_base64(their_mac)
            .is_ok_and(|mac| established.verify_mac(input, info, &mac).is_ok()),
        _ => established.calculate_mac_invalid_base64(input, info) == their_mac,
    }
}

/// The emoji table of the SAS protocol: 64 entries indexed by 6-bit
/// groups of the shared secret.
pub const SAS_EMOJI: [EmojiEntry; 64] = [
    EmojiEntry { emoji: "🐶", description: "Dog" },
    EmojiEntry { emoji: "🐱", description: "Cat" },
    EmojiEntry { emoji: "🦁", description: "Lion" },
    EmojiEntry { emoji: "🐎", description: "Horse" },
    EmojiEntry { emoji: "🦄", description: "Unicorn" },
    EmojiEntry { emoji: "🐷", description: "Pig" },
    EmojiEntry { emoji: "🐘", description: "Elephant" },
    EmojiEntry { emoji: "🐰", description: "Rabbit" },
    EmojiEntry { emoji: "🐼", description: "Panda" },
    EmojiEntry { emoji: "🐓", description: "Rooster" },
    EmojiEntry { emoji: "🐧", description: "Penguin" },
    EmojiEntry { emoji: "🐢", description: "Turtle" },
    EmojiEntry { emoji: "🐟", description: "Fish" },
    EmojiEntry { emoji: "🐙", description: "Octopus" },
    EmojiEntry { emoji: "🦋", description: "Butterfly" },
    EmojiEntry { emoji: "🌷", description: "Flower" },
    EmojiEntry { emoji: "🌳", description: "Tree" },
    EmojiEntry { emoji: "🌵", description: "Cactus" },
    EmojiEntry { emoji: "🍄", description: "Mushroom" },
    EmojiEntry { emoji: "🌏", description: "Globe" },
    EmojiEntry { emoji: "🌙", description: "Moon" },
    EmojiEntry { emoji: "☁️", description: "Cloud" },
    EmojiEntry { emoji: "🔥", description: "Fire" },
    EmojiEntry { emoji: "🍌", description: "Banana" },
    EmojiEntry { emoji: "🍎", description: "Apple" },
    EmojiEntry { emoji: "🍓", description: "Strawberry" },
    EmojiEntry { emoji: "🌽", description: "Corn" },
    EmojiEntry { emoji: "🍕", description: "Pizza" },
    EmojiEntry { emoji: "🎂", description: "Cake" },
    EmojiEntry { emoji: "❤️", description: "Heart" },
    EmojiEntry { emoji: "😀", description: "Smiley" },
    EmojiEntry { emoji: "🤖", description: "Robot" },
    EmojiEntry { emoji: "🎩", description: "Hat" },
    EmojiEntry { emoji: "👓", description: "Glasses" },
    EmojiEntry { emoji: "🔧", description: "Spanner" },
    EmojiEntry { emoji: "🎅", description: "Santa" },
    EmojiEntry { emoji: "👍", description: "Thumbs Up" },
    EmojiEntry { emoji: "☂️", description: "Umbrella" },
    EmojiEntry { emoji: "⌛", description: "Hourglass" },
    EmojiEntry { emoji: "⏰", description: "Clock" },
    EmojiEntry { emoji: "🎁", description: "Gift" },
    EmojiEntry { emoji: "💡", description: "Light Bulb" },
    EmojiEntry { emoji: "📕", description: "Book" },
    EmojiEntry { emoji: "✏️", description: "Pencil" },
    EmojiEntry { emoji: "📎", description: "Paperclip" },
    EmojiEntry { emoji: "✂️", description: "Scissors" },
    EmojiEntry { emoji: "🔒", description: "Lock" },
    EmojiEntry { emoji: "🔑", description: "Key" },
    EmojiEntry { emoji: "🔨", description: "Hammer" },
    EmojiEntry { emoji: "☎️", description: "Telephone" },
    EmojiEntry { emoji: "🏁", description: "Flag" },
    EmojiEntry { emoji: "🚂", description: "Train" },
    EmojiEntry { emoji: "🚲", description: "Bicycle" },
    EmojiEntry { emoji: "✈️", description: "Aeroplane" },
    EmojiEntry { emoji: "🚀", description: "Rocket" },
    EmojiEntry { emoji: "🏆", description: "Trophy" },
    EmojiEntry { emoji: "⚽", description: "Ball" },
    EmojiEntry { emoji: "🎸", description: "Guitar" },
    EmojiEntry { emoji: "🎺", description: "Trumpet" },
    EmojiEntry { emoji: "🔔", description: "Bell" },
    EmojiEntry { emoji: "⚓", description: "Anchor" },
    EmojiEntry { emoji: "🎧", description: "Headphones" },
    EmojiEntry { emoji: "📁", description: "Folder" },
    EmojiEntry { emoji: "📌", description: "Pin" },
];

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> OwnIdentity {
        OwnIdentity {
            user_id: "@alice:example.org".to_owned(),
            device_id: "ALICEDEV".to_owned(),
            ed25519: "alice+ed25519+key+base64+AAAAAAAAAAAAAAAAAAA".to_owned(),
        }
    }

    fn bob() -> OwnIdentity {
        OwnIdentity {
            user_id: "@bob:example.org".to_owned(),
            device_id: "BOBDEV".to_owned(),
            ed25519: "bob+ed25519+key+base64+AAAAAAAAAAAAAAAAAAAAA".to_owned(),
        }
    }

    /// Runs a full verification between two in-process sessions, pumping
    /// the to-device messages by hand.
    fn run_flow() -> (KeyVerificationSession, KeyVerificationSession) {
        let alice_id = alice();
        let bob_id = bob();
        let alice_session = KeyVerificationSession::outgoing(
            alice_id.clone(),
            &bob_id.user_id,
            &bob_id.device_id,
            "txn-1".to_owned(),
        );
        let bob_session = KeyVerificationSession::incoming(
            bob_id.clone(),
            &alice_id.user_id,
            &alice_id.device_id,
            "txn-1".to_owned(),
        );
        alice_session.set_their_ed25519(bob_id.ed25519.clone());
        bob_session.set_their_ed25519(alice_id.ed25519.clone());

        let _request = alice_session.initial_request(1_700_000_000_000);
        assert_eq!(alice_session.state(), VerificationState::Requested);
        assert_eq!(bob_session.state(), VerificationState::Requested);

        let ready = bob_session.accept().unwrap();
        alice_session.receive_ready(&ready.content);
        assert_eq!(alice_session.state(), VerificationState::Ready);
        assert_eq!(bob_session.state(), VerificationState::Ready);

        let start = alice_session.start_sas().unwrap();
        let mut to_alice = bob_session.receive_start(&start.content).unwrap();
        assert_eq!(alice_session.state(), VerificationState::Transitioned);
        assert_eq!(bob_session.state(), VerificationState::Transitioned);

        // accept → key → key
        let accept = to_alice.remove(0);
        let mut to_bob = alice_session.receive_accept(&accept.content);
        let alice_key = to_bob.remove(0);
        let mut to_alice = bob_session.receive_key(&alice_key.content).unwrap();
        let bob_key = to_alice.remove(0);
        let none = alice_session.receive_key(&bob_key.content).unwrap();
        assert!(none.is_empty());

        assert_eq!(alice_session.sas_state(), SasState::KeysExchanged);
        assert_eq!(bob_session.sas_state(), SasState::KeysExchanged);
        (alice_session, bob_session)
    }

    #[test]
    fn emojis_match_on_both_ends() {
        let (alice_session, bob_session) = run_flow();
        let alice_emoji = alice_session.emoji().unwrap();
        let bob_emoji = bob_session.emoji().unwrap();
        assert_eq!(alice_emoji.len(), 7);
        assert_eq!(alice_emoji, bob_emoji);
        assert_eq!(alice_session.decimals(), bob_session.decimals());
    }

    #[test]
    fn full_flow_reaches_done_on_both_sides() {
        let (alice_session, bob_session) = run_flow();

        let mut from_alice = alice_session.confirm();
        assert_eq!(alice_session.sas_state(), SasState::Confirmed);
        let alice_mac = from_alice.remove(0);
        let after_mac = bob_session.receive_mac(&alice_mac.content).unwrap();
        // Bob hasn't confirmed yet, nothing to send back.
        assert!(after_mac.is_empty());

        let mut from_bob = bob_session.confirm();
        let bob_mac = from_bob.remove(0);
        // Bob saw both MACs now and finished.
        let bob_done = from_bob.remove(0);
        assert_eq!(bob_done.event_type, "m.key.verification.done");
        assert_eq!(bob_session.sas_state(), SasState::SasDone);
        assert!(bob_session.is_done());

        let mut from_alice = alice_session.receive_mac(&bob_mac.content).unwrap();
        let alice_done = from_alice.remove(0);
        assert_eq!(alice_done.event_type, "m.key.verification.done");
        bob_session.receive_done();
        alice_session.receive_done();
        assert!(alice_session.is_done());
    }

    #[test]
    fn cancel_propagates_to_both_state_machines() {
        let (alice_session, bob_session) = run_flow();
        let cancel = alice_session.cancel();
        assert_eq!(cancel.event_type, "m.key.verification.cancel");
        assert!(alice_session.is_cancelled());
        assert_eq!(alice_session.sas_state(), SasState::SasCancelled);

        bob_session.receive_cancel();
        assert!(bob_session.is_cancelled());
        assert_eq!(bob_session.sas_state(), SasState::SasCancelled);
    }

    #[test]
    fn tampered_mac_cancels_the_flow() {
        let (alice_session, bob_session) = run_flow();
        let mut from_alice = alice_session.confirm();
        let mut mac = from_alice.remove(0);
        mac.content["keys"] = serde_json::json!("dGFtcGVyZWQ");
        let reply = bob_session.receive_mac(&mac.content).unwrap();
        assert_eq!(reply[0].event_type, "m.key.verification.cancel");
        assert!(bob_session.is_cancelled());
    }
}
