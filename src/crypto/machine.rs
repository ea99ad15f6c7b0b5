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

//! The olm machine: the per-connection cryptographic state and every
//! operation that mutates it.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;
use zeroize::Zeroizing;
use vodozemac::{
    megolm::{InboundGroupSession, MegolmMessage, SessionConfig as MegolmSessionConfig},
    olm::{
        Account, AccountPickle, Message, OlmMessage, PreKeyMessage, Session,
        SessionConfig as OlmSessionConfig,
    },
    Curve25519PublicKey,
};

use super::{
    device::{cross_signing_key, verify_signature, CrossSigningKeys, Device},
    group_sessions::{parse_session_key, InboundSessionRecord, OutboundSession},
    verification::{OutgoingVerificationMessage, OwnIdentity},
    CryptoError, CryptoResult, CryptoStore, KeyVerificationSession, MEGOLM_ALGORITHM,
    OLM_ALGORITHM,
};
use crate::{
    api::{
        keys::{ClaimKeysRequest, QueryKeysRequest, UploadKeysRequest},
        rooms::SendToDeviceRequest,
    },
    error::Result,
    events::{load_event, load_room_event, AnyEvent, Event},
    http_client::HttpClient,
    identifiers::{DeviceId, RoomId, UserId},
    room::{EncryptionSettings, Room},
    store::{keychain::pickle_key_entry, Keychain, KeychainError},
};

const MAX_TO_DEVICE_MESSAGES: usize = 20;
const ONE_TIME_KEY_ALGORITHM: &str = "signed_curve25519";

struct PendingEncryptedEvent {
    room_id: RoomId,
    json: Value,
}

/// What one batch of to-device events produced: events that became
/// decryptable, and verification sessions created by remote requests.
#[derive(Default)]
pub struct ToDeviceOutcome {
    /// Buffered room events that newly arrived keys unlocked, ready for
    /// their rooms' timelines.
    pub decrypted_events: Vec<(RoomId, AnyEvent)>,
    /// Verification sessions freshly created by incoming requests.
    pub new_verification_sessions: Vec<Arc<KeyVerificationSession>>,
}

/// The cryptographic identity and session state of one connection.
pub struct OlmMachine {
    user_id: UserId,
    device_id: DeviceId,
    account: Mutex<Account>,
    pickle_key: Zeroizing<[u8; 32]>,
    store: Arc<dyn CryptoStore>,
    http: HttpClient,
    /// Live olm sessions by the remote device's curve25519 key.
    olm_sessions: Mutex<HashMap<String, Vec<Session>>>,
    /// Live inbound megolm sessions by `(room id, session id)`.
    inbound_sessions: Mutex<HashMap<(RoomId, String), InboundGroupSession>>,
    /// The current outbound megolm session per room.
    outbound_sessions: Mutex<HashMap<RoomId, OutboundSession>>,
    outdated_users: StdMutex<HashSet<UserId>>,
    one_time_keys_count: StdMutex<HashMap<String, u64>>,
    query_in_flight: AtomicBool,
    pending_events: StdMutex<Vec<PendingEncryptedEvent>>,
    verifications: DashMap<String, Arc<KeyVerificationSession>>,
}

impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl OlmMachine {
    /// Restores (or creates) the olm account. The pickle key lives in the
    /// keychain under `<user id>-Pickle`; a missing account pickle means a
    /// fresh account whose keys still need uploading — the bool in the
    /// return value says so.
    pub(crate) async fn new(
        user_id: UserId,
        device_id: DeviceId,
        keychain: &dyn Keychain,
        store: Arc<dyn CryptoStore>,
        http: HttpClient,
    ) -> CryptoResult<(OlmMachine, bool)> {
        let pickle_entry = pickle_key_entry(&user_id);
        let pickle_key: Zeroizing<[u8; 32]> = match keychain.read(&pickle_entry) {
            Ok(bytes) => Zeroizing::new(bytes.try_into().map_err(|_| {
                CryptoError::Pickle("stored pickle key has a bad size".to_owned())
            })?),
            Err(KeychainError::NotFound) => {
                let key: [u8; 32] = rand::random();
                keychain.write(&pickle_entry, &key)?;
                Zeroizing::new(key)
            }
            Err(e) => return Err(e.into()),
        };

        let (account, is_new) = match store.load_account().await? {
            Some(encrypted) => {
                let pickle = AccountPickle::from_encrypted(&encrypted, &pickle_key)
                    .map_err(|e| CryptoError::Pickle(e.to_string()))?;
                debug!("restored the olm account");
                (Account::from_pickle(pickle), false)
            }
            None => {
                debug!("creating a new olm account");
                (Account::new(), true)
            }
        };

        let machine = OlmMachine {
            user_id,
            device_id,
            account: Mutex::new(account),
            pickle_key,
            store,
            http,
            olm_sessions: Mutex::new(HashMap::new()),
            inbound_sessions: Mutex::new(HashMap::new()),
            outbound_sessions: Mutex::new(HashMap::new()),
            outdated_users: StdMutex::new(HashSet::new()),
            one_time_keys_count: StdMutex::new(HashMap::new()),
            query_in_flight: AtomicBool::new(false),
            pending_events: StdMutex::new(Vec::new()),
            verifications: DashMap::new(),
        };
        if is_new {
            machine.save_account().await?;
        }
        Ok((machine, is_new))
    }

    /// Our identity keys as `(curve25519, ed25519)`, base64.
    pub async fn identity_keys(&self) -> (String, String) {
        let account = self.account.lock().await;
        (account.curve25519_key().to_base64(), account.ed25519_key().to_base64())
    }

    async fn own_identity(&self) -> OwnIdentity {
        let (_, ed25519) = self.identity_keys().await;
        OwnIdentity { user_id: self.user_id.clone(), device_id: self.device_id.clone(), ed25519 }
    }

    async fn save_account(&self) -> CryptoResult<()> {
        let account = self.account.lock().await;
        let encrypted = account.pickle().encrypt(&self.pickle_key);
        self.store.save_account(encrypted).await
    }

    fn sign_with(account: &Account, value: &Value) -> String {
        account.sign(&super::canonical_json(value)).to_base64()
    }

    /// The signed `device_keys` payload for `/keys/upload`.
    async fn device_keys(&self) -> Value {
        let account = self.account.lock().await;
        let mut payload = json!({
            "user_id": self.user_id,
            "device_id": self.device_id,
            "algorithms": [OLM_ALGORITHM, MEGOLM_ALGORITHM],
            "keys": {
                format!("curve25519:{}", self.device_id): account.curve25519_key().to_base64(),
                format!("ed25519:{}", self.device_id): account.ed25519_key().to_base64(),
            },
        });
        let signature = Self::sign_with(&account, &payload);
        payload["signatures"] = json!({
            &self.user_id: { format!("ed25519:{}", self.device_id): signature }
        });
        payload
    }

    /// Generates, signs and uploads one-time keys until the server holds
    /// half of the account's maximum again. Uploads the identity keys too
    /// for a fresh account.
    pub(crate) async fn upload_keys(&self, include_device_keys: bool) -> Result<()> {
        let one_time_keys = {
            let mut account = self.account.lock().await;
            let max_on_server = (account.max_number_of_one_time_keys() / 2) as u64;
            let current = self
                .one_time_keys_count
                .lock()
                .unwrap()
                .get(ONE_TIME_KEY_ALGORITHM)
                .copied()
                .unwrap_or(0);
            if !include_device_keys && current >= max_on_server {
                return Ok(());
            }
            account.generate_one_time_keys((max_on_server - current) as usize);

            let mut signed = Map::new();
            for (key_id, key) in account.one_time_keys() {
                let mut key_payload = json!({ "key": key.to_base64() });
                let signature = Self::sign_with(&account, &key_payload);
                key_payload["signatures"] = json!({
                    &self.user_id: { format!("ed25519:{}", self.device_id): signature }
                });
                signed.insert(
                    format!("{ONE_TIME_KEY_ALGORITHM}:{}", key_id.to_base64()),
                    key_payload,
                );
            }
            signed
        };

        let device_keys = if include_device_keys { Some(self.device_keys().await) } else { None };
        let key_count = one_time_keys.len();
        if device_keys.is_none() && key_count == 0 {
            return Ok(());
        }

        let response = self
            .http
            .send(UploadKeysRequest { device_keys, one_time_keys: Some(one_time_keys) }, None)
            .await?;

        self.account.lock().await.mark_keys_as_published();
        *self.one_time_keys_count.lock().unwrap() = response.one_time_key_counts.clone();
        self.save_account().await.map_err(crate::error::Error::from)?;
        debug!(uploaded = key_count, "one-time keys published");
        Ok(())
    }

    /// First pass over a sync response: record the one-time-key counts
    /// and mark users with changed device lists as outdated.
    pub(crate) async fn on_sync_response(&self, response: &crate::sync::SyncResponse) {
        if !response.device_one_time_keys_count.is_empty() {
            *self.one_time_keys_count.lock().unwrap() =
                response.device_one_time_keys_count.clone();
        }

        if response.device_lists.changed.is_empty() {
            return;
        }
        let tracked = self.store.tracked_users().await.unwrap_or_default();
        let mut outdated = self.outdated_users.lock().unwrap();
        for user in &response.device_lists.changed {
            if tracked.contains(user) {
                outdated.insert(user.clone());
            }
        }
    }

    /// Whether the sync follow-up needs to query device keys.
    pub(crate) fn has_outdated_users(&self) -> bool {
        !self.outdated_users.lock().unwrap().is_empty()
    }

    /// Whether the uploaded one-time-key count fell below half the
    /// account's maximum.
    pub(crate) async fn should_upload_one_time_keys(&self) -> bool {
        let max = self.account.lock().await.max_number_of_one_time_keys() as u64;
        let current = self
            .one_time_keys_count
            .lock()
            .unwrap()
            .get(ONE_TIME_KEY_ALGORITHM)
            .copied()
            .unwrap_or(0);
        current < max / 2
    }

    /// Whether a `/keys/query` request is currently in flight.
    pub fn is_querying_keys(&self) -> bool {
        self.query_in_flight.load(Ordering::Relaxed)
    }

    /// The last known per-algorithm counts of our published one-time
    /// keys.
    pub fn one_time_key_counts(&self) -> HashMap<String, u64> {
        self.one_time_keys_count.lock().unwrap().clone()
    }

    /// Starts tracking the given users for device-list changes; new users
    /// become outdated immediately.
    pub(crate) async fn update_tracked_users<'a, I>(&self, users: I)
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        for user in users {
            match self.store.add_tracked_user(user).await {
                Ok(true) => {
                    self.outdated_users.lock().unwrap().insert(user.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("error storing a user for tracking: {e}");
                    self.outdated_users.lock().unwrap().insert(user.clone());
                }
            }
        }
    }

    /// Queries the keys of all outdated users and ingests the response:
    /// signature checks, device table updates, cross-signing keys.
    #[instrument(skip(self))]
    pub(crate) async fn load_outdated_user_devices(&self) -> Result<()> {
        let users: Vec<UserId> = self.outdated_users.lock().unwrap().iter().cloned().collect();
        if users.is_empty() || self.query_in_flight.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let request = QueryKeysRequest {
            device_keys: users.iter().map(|u| (u.clone(), Vec::new())).collect(),
            token: None,
        };
        let result = self.http.send(request, None).await;
        self.query_in_flight.store(false, Ordering::SeqCst);
        let response = result?;

        for (user_id, devices) in &response.device_keys {
            let known: HashSet<DeviceId> = self
                .store
                .user_devices(user_id)
                .await
                .map_err(crate::error::Error::from)?
                .into_iter()
                .map(|d| d.device_id().clone())
                .collect();
            let mut seen = HashSet::new();

            let self_signing_key = response
                .self_signing_keys
                .get(user_id)
                .and_then(cross_signing_key)
                .and_then(|k| {
                    vodozemac::Ed25519PublicKey::from_base64(&k).ok().map(|key| (k, key))
                });

            for (device_id, payload) in devices {
                if user_id == &self.user_id && device_id == &self.device_id {
                    continue;
                }
                match Device::from_keys_payload(user_id, device_id, payload) {
                    Ok(mut device) => {
                        if let Some((key_b64, ssk)) = &self_signing_key {
                            let self_signed = verify_signature(
                                payload,
                                user_id,
                                &format!("ed25519:{key_b64}"),
                                ssk,
                            )
                            .is_ok();
                            device.set_self_verified(self_signed);
                        }
                        seen.insert(device_id.clone());
                        self.store.save_device(device).await.map_err(crate::error::Error::from)?;
                    }
                    Err(e) => {
                        warn!(%user_id, %device_id, "rejecting device keys: {e}");
                    }
                }
            }

            // Devices the server no longer lists are gone.
            for stale in known.difference(&seen) {
                self.store.delete_device(user_id, stale).await.map_err(crate::error::Error::from)?;
            }

            if let Some(master) = response.master_keys.get(user_id) {
                let previous = self
                    .store
                    .cross_signing_keys(user_id)
                    .await
                    .map_err(crate::error::Error::from)?;
                let keys = CrossSigningKeys {
                    master_key: cross_signing_key(master),
                    self_signing_key: response
                        .self_signing_keys
                        .get(user_id)
                        .and_then(cross_signing_key),
                    user_signing_key: response
                        .user_signing_keys
                        .get(user_id)
                        .and_then(cross_signing_key),
                    verified: previous.map(|p| p.verified).unwrap_or(false),
                };
                self.store
                    .save_cross_signing_keys(user_id, keys)
                    .await
                    .map_err(crate::error::Error::from)?;
            }

            self.outdated_users.lock().unwrap().remove(user_id);
        }

        info!(users = users.len(), "device list refresh finished");
        Ok(())
    }

    // ── To-device processing ────────────────────────────────────────────

    /// Consumes the to-device section of a sync response; the first
    /// consumer of every iteration.
    pub(crate) async fn consume_to_device_events(&self, events: &[Value]) -> ToDeviceOutcome {
        let mut outcome = ToDeviceOutcome::default();
        for raw in events {
            let event = load_event(raw.clone());
            trace!(event_type = event.matrix_type(), "received a to-device event");
            match &event {
                AnyEvent::Encrypted(e) => {
                    let sender_key = e.sender_key().to_owned();
                    match self.decrypt_to_device_event(raw).await {
                        Ok(inner) => {
                            self.handle_decrypted_to_device(&sender_key, inner, &mut outcome)
                                .await;
                        }
                        Err(err) => {
                            warn!(
                                sender = ?event.sender(),
                                "failed to decrypt a to-device event: {err}"
                            );
                        }
                    }
                }
                _ if event.matrix_type().starts_with("m.key.verification.") => {
                    if let Err(e) = self.handle_verification_event(&event, &mut outcome).await {
                        warn!("failed to process a verification event: {e}");
                    }
                }
                _ => {}
            }
        }

        self.garbage_collect_verifications().await;
        outcome
    }

    async fn handle_decrypted_to_device(
        &self,
        sender_key: &str,
        inner: Value,
        outcome: &mut ToDeviceOutcome,
    ) {
        let event = load_event(inner);
        match &event {
            AnyEvent::RoomKey(e) => {
                if e.algorithm() != MEGOLM_ALGORITHM {
                    warn!(algorithm = e.algorithm(), "room key with an unsupported algorithm");
                    return;
                }
                match self
                    .add_room_key(sender_key, e.room_id(), e.session_id(), e.session_key())
                    .await
                {
                    Ok(unlocked) => outcome.decrypted_events.extend(unlocked),
                    Err(err) => warn!("failed to store a room key: {err}"),
                }
            }
            _ if event.matrix_type().starts_with("m.key.verification.") => {
                if let Err(e) = self.handle_verification_event(&event, outcome).await {
                    warn!("failed to process a verification event: {e}");
                }
            }
            other => {
                debug!(event_type = other.matrix_type(), "unhandled decrypted to-device event");
            }
        }
    }

    /// Stores an inbound megolm session and decrypts everything that was
    /// waiting for it. The session is persisted before any buffered event
    /// is decrypted.
    async fn add_room_key(
        &self,
        sender_key: &str,
        room_id: &str,
        session_id: &str,
        session_key: &str,
    ) -> CryptoResult<Vec<(RoomId, AnyEvent)>> {
        let key = parse_session_key(session_key)?;
        let session = InboundGroupSession::new(&key, MegolmSessionConfig::default());

        self.store
            .save_inbound_session(InboundSessionRecord {
                room_id: room_id.to_owned(),
                sender_key: sender_key.to_owned(),
                session_id: session_id.to_owned(),
                session_key: session_key.to_owned(),
            })
            .await?;
        self.inbound_sessions
            .lock()
            .await
            .insert((room_id.to_owned(), session_id.to_owned()), session);
        info!(room_id, session_id, "stored a new inbound megolm session");

        // Drain the events this key unlocks; each decrypts exactly once.
        let waiting: Vec<PendingEncryptedEvent> = {
            let mut pending = self.pending_events.lock().unwrap();
            let drained: Vec<PendingEncryptedEvent> = pending.drain(..).collect();
            let (unlocked, kept) = drained.into_iter().partition(|p| {
                p.room_id == room_id
                    && p.json
                        .get("content")
                        .and_then(|c| c.get("session_id"))
                        .and_then(Value::as_str)
                        == Some(session_id)
            });
            *pending = kept;
            unlocked
        };

        let mut decrypted = Vec::new();
        for pending in waiting {
            match self.decrypt_room_event(&pending.room_id, &pending.json).await {
                Ok(event) => decrypted.push((pending.room_id, event)),
                Err(e) => warn!("a pending event still fails to decrypt: {e}"),
            }
        }
        Ok(decrypted)
    }

    /// Decrypts an olm-encrypted to-device event, creating a new inbound
    /// session from a pre-key message if no existing session matches.
    async fn decrypt_to_device_event(&self, raw: &Value) -> CryptoResult<Value> {
        let content = raw
            .get("content")
            .ok_or_else(|| CryptoError::BadEncryptedMessage("event without content".to_owned()))?;
        let algorithm = content.get("algorithm").and_then(Value::as_str).unwrap_or("");
        if algorithm != OLM_ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm.to_owned()));
        }
        let sender_key = content
            .get("sender_key")
            .and_then(Value::as_str)
            .ok_or_else(|| CryptoError::BadEncryptedMessage("missing sender_key".to_owned()))?;

        let own_curve = self.account.lock().await.curve25519_key().to_base64();
        let ciphertext =
            content.get("ciphertext").and_then(|c| c.get(&own_curve)).ok_or_else(|| {
                CryptoError::BadEncryptedMessage("no ciphertext for our key".to_owned())
            })?;
        let message_type = ciphertext.get("type").and_then(Value::as_u64).unwrap_or(0);
        let body = ciphertext.get("body").and_then(Value::as_str).unwrap_or("");
        let message = match message_type {
            0 => OlmMessage::PreKey(PreKeyMessage::from_base64(body).map_err(|e| {
                CryptoError::BadEncryptedMessage(format!("bad pre-key message: {e}"))
            })?),
            _ => OlmMessage::Normal(Message::from_base64(body).map_err(|e| {
                CryptoError::BadEncryptedMessage(format!("bad olm message: {e}"))
            })?),
        };

        let plaintext = self.olm_decrypt(sender_key, &message).await?;
        let mut inner: Value = serde_json::from_slice(&plaintext)?;

        // The envelope binds the plaintext to us; a mismatch means the
        // message was re-routed.
        let recipient = inner.get("recipient").and_then(Value::as_str);
        if recipient.is_some_and(|r| r != self.user_id) {
            return Err(CryptoError::BadEncryptedMessage(
                "decrypted event intended for another user".to_owned(),
            ));
        }
        trace!("successfully decrypted an olm message");

        if let (Some(object), Some(sender)) = (inner.as_object_mut(), raw.get("sender").cloned())
        {
            object.insert("sender".to_owned(), sender);
        }
        Ok(inner)
    }

    async fn olm_decrypt(&self, sender_key: &str, message: &OlmMessage) -> CryptoResult<Vec<u8>> {
        let mut sessions = self.olm_sessions.lock().await;
        if !sessions.contains_key(sender_key) {
            let loaded = self.load_olm_sessions(sender_key).await?;
            sessions.insert(sender_key.to_owned(), loaded);
        }
        let list = sessions.get_mut(sender_key).expect("Session list was just ensured");

        for session in list.iter_mut() {
            if let Ok(plaintext) = session.decrypt(message) {
                let pickle = serde_json::to_value(session.pickle())?;
                self.store.save_olm_session(sender_key, &session.session_id(), pickle).await?;
                return Ok(plaintext);
            }
        }

        let OlmMessage::PreKey(pre_key) = message else {
            return Err(CryptoError::BadEncryptedMessage(
                "no olm session can decrypt this message".to_owned(),
            ));
        };

        let identity_key = Curve25519PublicKey::from_base64(sender_key)
            .map_err(|e| CryptoError::BadEncryptedMessage(format!("bad sender key: {e}")))?;
        let result = {
            let mut account = self.account.lock().await;
            account.create_inbound_session(identity_key, pre_key).map_err(|e| {
                CryptoError::BadEncryptedMessage(format!("inbound session creation failed: {e}"))
            })?
        };
        self.save_account().await?;

        let pickle = serde_json::to_value(result.session.pickle())?;
        self.store.save_olm_session(sender_key, &result.session.session_id(), pickle).await?;
        list.push(result.session);
        info!(sender_key, "created a new inbound olm session");
        Ok(result.plaintext)
    }

    async fn load_olm_sessions(&self, sender_key: &str) -> CryptoResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for (_, pickle) in self.store.olm_sessions(sender_key).await? {
            match serde_json::from_value(pickle) {
                Ok(pickle) => sessions.push(Session::from_pickle(pickle)),
                Err(e) => warn!("dropping an unreadable olm session pickle: {e}"),
            }
        }
        Ok(sessions)
    }

    // ── Room message encryption ─────────────────────────────────────────

    /// Encrypts a room event, rotating and distributing the outbound
    /// megolm session as needed. Returns the `m.room.encrypted` content.
    pub(crate) async fn encrypt_room_event(
        &self,
        room: &Room,
        event_type: &str,
        content: &Value,
    ) -> Result<Value> {
        let settings = room.encryption_settings().unwrap_or(EncryptionSettings {
            rotation_period_ms: 604_800_000,
            rotation_period_msgs: 100,
        });

        let mut outbound = self.outbound_sessions.lock().await;
        let rotate = match outbound.get(room.id()) {
            Some(session) => session.expired(&settings),
            None => match self.store.outbound_session(room.id()).await.ok().flatten() {
                Some(record) => match OutboundSession::from_record(&record) {
                    Ok(session) => {
                        let expired = session.expired(&settings);
                        outbound.insert(room.id().clone(), session);
                        expired
                    }
                    Err(e) => {
                        warn!("couldn't restore the outbound session: {e}");
                        true
                    }
                },
                None => true,
            },
        };

        if rotate {
            let session = OutboundSession::new();
            // Keep our own inbound copy so we can decrypt what we send.
            let own_curve = self.account.lock().await.curve25519_key().to_base64();
            self.store
                .save_inbound_session(InboundSessionRecord {
                    room_id: room.id().clone(),
                    sender_key: own_curve,
                    session_id: session.session_id(),
                    session_key: session.session_key().to_base64(),
                })
                .await
                .map_err(crate::error::Error::from)?;
            self.inbound_sessions.lock().await.insert(
                (room.id().clone(), session.session_id()),
                InboundGroupSession::new(&session.session_key(), MegolmSessionConfig::default()),
            );
            info!(room_id = %room.id(), "rotated the outbound megolm session");
            outbound.insert(room.id().clone(), session);
        }

        let session = outbound.get_mut(room.id()).expect("Session was just ensured");
        self.share_session(room, session).await?;

        let plaintext = json!({
            "type": event_type,
            "content": content,
            "room_id": room.id(),
        })
        .to_string();
        let ciphertext = session.encrypt(&plaintext);
        let session_id = session.session_id();
        let record = session.to_record(room.id()).map_err(crate::error::Error::from)?;
        self.store.save_outbound_session(record).await.map_err(crate::error::Error::from)?;
        drop(outbound);

        let sender_key = self.account.lock().await.curve25519_key().to_base64();
        Ok(json!({
            "algorithm": MEGOLM_ALGORITHM,
            "sender_key": sender_key,
            "ciphertext": ciphertext,
            "session_id": session_id,
            "device_id": self.device_id,
        }))
    }

    /// The devices a room key must reach: every device of every joined
    /// member, plus invited members' devices when history visibility
    /// permits.
    async fn collect_target_devices(&self, room: &Room) -> CryptoResult<Vec<Device>> {
        let mut members = room.joined_member_ids();
        let visibility = room.history_visibility().unwrap_or_else(|| "shared".to_owned());
        if visibility != "joined" {
            members.extend(room.invited_member_ids());
        }

        let mut devices = Vec::new();
        for member in &members {
            for device in self.store.user_devices(member).await? {
                if device.user_id() == &self.user_id && device.device_id() == &self.device_id {
                    continue;
                }
                devices.push(device);
            }
        }
        Ok(devices)
    }

    async fn share_session(&self, room: &Room, session: &mut OutboundSession) -> Result<()> {
        let devices =
            self.collect_target_devices(room).await.map_err(crate::error::Error::from)?;
        let targets: Vec<&Device> = devices
            .iter()
            .filter(|d| !session.is_shared_with(d.user_id(), d.device_id()))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        self.ensure_olm_sessions(&targets).await?;

        let key_content = json!({
            "algorithm": MEGOLM_ALGORITHM,
            "room_id": room.id(),
            "session_id": session.session_id(),
            "session_key": session.session_key().to_base64(),
            "chain_index": session.message_index(),
        });

        for chunk in targets.chunks(MAX_TO_DEVICE_MESSAGES) {
            let mut messages: BTreeMap<UserId, BTreeMap<DeviceId, Value>> = BTreeMap::new();
            for device in chunk {
                match self.olm_encrypt_for(device, "m.room_key", &key_content).await {
                    Ok(encrypted) => {
                        messages
                            .entry(device.user_id().clone())
                            .or_default()
                            .insert(device.device_id().clone(), encrypted);
                        session.mark_shared_with(device.user_id(), device.device_id());
                    }
                    Err(e) => {
                        warn!(
                            user_id = %device.user_id(),
                            device_id = %device.device_id(),
                            "couldn't encrypt the room key for a device: {e}"
                        );
                    }
                }
            }
            if messages.is_empty() {
                continue;
            }
            self.http
                .send(
                    SendToDeviceRequest {
                        event_type: "m.room.encrypted".to_owned(),
                        txn_id: Uuid::new_v4().to_string(),
                        messages: serde_json::to_value(&messages)
                            .map_err(crate::error::Error::from)?,
                    },
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// Claims one-time keys and creates outbound olm sessions for every
    /// target device we don't share a session with yet.
    async fn ensure_olm_sessions(&self, devices: &[&Device]) -> Result<()> {
        let mut missing: BTreeMap<UserId, BTreeMap<DeviceId, String>> = BTreeMap::new();
        {
            let mut sessions = self.olm_sessions.lock().await;
            for device in devices {
                let Some(curve_key) = device.curve25519_key_base64() else { continue };
                if sessions.get(curve_key).is_some_and(|l| !l.is_empty()) {
                    continue;
                }
                let stored = self
                    .load_olm_sessions(curve_key)
                    .await
                    .map_err(crate::error::Error::from)?;
                if !stored.is_empty() {
                    sessions.insert(curve_key.to_owned(), stored);
                    continue;
                }
                missing
                    .entry(device.user_id().clone())
                    .or_default()
                    .insert(device.device_id().clone(), ONE_TIME_KEY_ALGORITHM.to_owned());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let response = self.http.send(ClaimKeysRequest { one_time_keys: missing }, None).await?;

        for (user_id, device_keys) in &response.one_time_keys {
            for (device_id, key_map) in device_keys {
                let Some(device) = self
                    .store
                    .device(user_id, device_id)
                    .await
                    .map_err(crate::error::Error::from)?
                else {
                    warn!(%user_id, %device_id, "claimed a key for an unknown device");
                    continue;
                };
                let Some(key_payload) = key_map.as_object().and_then(|m| m.values().next())
                else {
                    warn!(%user_id, %device_id, "the claimed one-time key is missing");
                    continue;
                };
                if let Err(e) = self.create_outbound_olm_session(&device, key_payload).await {
                    warn!(%user_id, %device_id, "couldn't create an olm session: {e}");
                }
            }
        }
        Ok(())
    }

    async fn create_outbound_olm_session(
        &self,
        device: &Device,
        one_time_key: &Value,
    ) -> CryptoResult<()> {
        let signing_key = device.ed25519_key().ok_or(CryptoError::SignatureMismatch)?;
        verify_signature(
            one_time_key,
            device.user_id(),
            &format!("ed25519:{}", device.device_id()),
            &signing_key,
        )?;

        let key = one_time_key
            .get("key")
            .and_then(Value::as_str)
            .and_then(|k| Curve25519PublicKey::from_base64(k).ok())
            .ok_or_else(|| {
                CryptoError::BadEncryptedMessage("unparsable one-time key".to_owned())
            })?;
        let identity_key = device.curve25519_key().ok_or_else(|| {
            CryptoError::BadEncryptedMessage("device has no curve25519 key".to_owned())
        })?;

        let session = self
            .account
            .lock()
            .await
            .create_outbound_session(OlmSessionConfig::default(), identity_key, key);
        info!(
            user_id = %device.user_id(),
            device_id = %device.device_id(),
            "creating an outbound olm session"
        );

        let sender_key = identity_key.to_base64();
        let pickle = serde_json::to_value(session.pickle())?;
        self.store.save_olm_session(&sender_key, &session.session_id(), pickle).await?;
        self.olm_sessions.lock().await.entry(sender_key).or_default().push(session);
        Ok(())
    }

    /// Olm-encrypts a payload for one device, producing the
    /// `m.room.encrypted` to-device content.
    async fn olm_encrypt_for(
        &self,
        device: &Device,
        event_type: &str,
        content: &Value,
    ) -> CryptoResult<Value> {
        let their_curve = device
            .curve25519_key_base64()
            .ok_or_else(|| {
                CryptoError::BadEncryptedMessage("device has no curve25519 key".to_owned())
            })?
            .to_owned();
        let their_ed25519 = device.ed25519_key_base64().unwrap_or("").to_owned();
        let (own_curve, own_ed25519) = self.identity_keys().await;

        let payload = json!({
            "sender": self.user_id,
            "sender_device": self.device_id,
            "keys": { "ed25519": own_ed25519 },
            "recipient": device.user_id(),
            "recipient_keys": { "ed25519": their_ed25519 },
            "type": event_type,
            "content": content,
        })
        .to_string();

        let mut sessions = self.olm_sessions.lock().await;
        let session = sessions
            .get_mut(&their_curve)
            .and_then(|list| list.first_mut())
            .ok_or_else(|| CryptoError::UnknownDevice {
                user_id: device.user_id().clone(),
                device_id: device.device_id().clone(),
            })?;

        let message = session.encrypt(payload.as_bytes());
        let pickle = serde_json::to_value(session.pickle())?;
        self.store.save_olm_session(&their_curve, &session.session_id(), pickle).await?;

        let (message_type, body) = match &message {
            OlmMessage::PreKey(m) => (0, m.to_base64()),
            OlmMessage::Normal(m) => (1, m.to_base64()),
        };
        Ok(json!({
            "algorithm": OLM_ALGORITHM,
            "sender_key": own_curve,
            "ciphertext": {
                their_curve: { "type": message_type, "body": body }
            },
        }))
    }

    // ── Room message decryption ─────────────────────────────────────────

    /// Decrypts an `m.room.encrypted` room event. Events whose megolm
    /// session hasn't arrived yet are buffered and surface through
    /// [`ToDeviceOutcome::decrypted_events`] once it does.
    pub(crate) async fn decrypt_room_event(
        &self,
        room_id: &str,
        raw: &Value,
    ) -> CryptoResult<AnyEvent> {
        let content = raw.get("content").cloned().unwrap_or_default();
        let algorithm = content.get("algorithm").and_then(Value::as_str).unwrap_or("");
        if algorithm != MEGOLM_ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm.to_owned()));
        }
        let session_id =
            content.get("session_id").and_then(Value::as_str).unwrap_or("").to_owned();
        let ciphertext = content.get("ciphertext").and_then(Value::as_str).unwrap_or("");

        let mut sessions = self.inbound_sessions.lock().await;
        let key = (room_id.to_owned(), session_id.clone());
        if !sessions.contains_key(&key) {
            match self.store.inbound_session(room_id, &session_id).await? {
                Some(record) => {
                    let session_key = parse_session_key(&record.session_key)?;
                    sessions.insert(
                        key.clone(),
                        InboundGroupSession::new(&session_key, MegolmSessionConfig::default()),
                    );
                }
                None => {
                    self.pending_events.lock().unwrap().push(PendingEncryptedEvent {
                        room_id: room_id.to_owned(),
                        json: raw.clone(),
                    });
                    debug!(room_id, session_id, "event pending until its room key arrives");
                    return Err(CryptoError::NoMatchingSession {
                        room_id: room_id.to_owned(),
                        session_id,
                    });
                }
            }
        }
        let session = sessions.get_mut(&key).expect("Session was just ensured");

        let message = MegolmMessage::from_base64(ciphertext)
            .map_err(|e| CryptoError::BadEncryptedMessage(format!("bad megolm message: {e}")))?;
        let decrypted = session
            .decrypt(&message)
            .map_err(|e| CryptoError::BadEncryptedMessage(format!("megolm decrypt: {e}")))?;
        drop(sessions);

        let mut plaintext: Value = serde_json::from_slice(&decrypted.plaintext)?;
        let object = plaintext.as_object_mut().ok_or_else(|| {
            CryptoError::BadEncryptedMessage("plaintext not an object".to_owned())
        })?;
        for field in ["sender", "event_id", "origin_server_ts", "unsigned"] {
            if let Some(value) = raw.get(field) {
                object.insert(field.to_owned(), value.clone());
            }
        }
        trace!(room_id, "successfully decrypted a megolm event");
        Ok(load_room_event(plaintext, None))
    }

    /// Whether the device that encrypted the given megolm session is
    /// verified. Answered through the session's sender key.
    pub async fn is_verified_session(&self, room_id: &str, session_id: &str) -> bool {
        let Ok(Some(record)) = self.store.inbound_session(room_id, session_id).await else {
            return false;
        };
        let Ok(Some(device)) = self.store.device_by_curve_key(&record.sender_key).await else {
            return false;
        };
        device.is_verified()
    }

    /// Whether the given device was interactively verified.
    pub async fn is_verified_device(&self, user_id: &str, device_id: &str) -> bool {
        matches!(self.store.device(user_id, device_id).await, Ok(Some(d)) if d.is_verified())
    }

    /// Whether the device is known to be end-to-end capable at all.
    pub async fn is_known_device(&self, user_id: &str, device_id: &str) -> bool {
        matches!(self.store.device(user_id, device_id).await, Ok(Some(_)))
    }

    // ── Key verification ────────────────────────────────────────────────

    /// Starts a device verification with the given remote device.
    pub(crate) async fn start_verification(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Arc<KeyVerificationSession>> {
        let device = self
            .store
            .device(user_id, device_id)
            .await
            .map_err(crate::error::Error::from)?
            .ok_or_else(|| {
                crate::error::Error::from(CryptoError::UnknownDevice {
                    user_id: user_id.to_owned(),
                    device_id: device_id.to_owned(),
                })
            })?;

        let session = Arc::new(KeyVerificationSession::outgoing(
            self.own_identity().await,
            user_id,
            device_id,
            Uuid::new_v4().to_string(),
        ));
        if let Some(key) = device.ed25519_key_base64() {
            session.set_their_ed25519(key.to_owned());
        }
        self.verifications.insert(session.transaction_id().to_owned(), session.clone());

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let request = session.initial_request(timestamp);
        self.send_verification_messages(&session, vec![request]).await?;
        Ok(session)
    }

    /// The live verification session for a transaction id, if any.
    pub fn verification_session(
        &self,
        transaction_id: &str,
    ) -> Option<Arc<KeyVerificationSession>> {
        self.verifications.get(transaction_id).map(|s| s.clone())
    }

    /// Sends the messages a session produced to its remote device.
    pub(crate) async fn send_verification_messages(
        &self,
        session: &KeyVerificationSession,
        messages: Vec<OutgoingVerificationMessage>,
    ) -> Result<()> {
        for message in messages {
            let mut device_map = Map::new();
            device_map.insert(session.remote_device_id(), message.content);
            let mut user_map = Map::new();
            user_map.insert(session.remote_user_id().clone(), Value::Object(device_map));
            self.http
                .send(
                    SendToDeviceRequest {
                        event_type: message.event_type,
                        txn_id: Uuid::new_v4().to_string(),
                        messages: Value::Object(user_map),
                    },
                    None,
                )
                .await?;
        }
        Ok(())
    }

    // Marks the session's remote device as verified once the flow is
    // done; called after every dispatch into a session.
    async fn after_verification_dispatch(&self, session: &KeyVerificationSession) {
        if session.is_done() {
            let user_id = session.remote_user_id().clone();
            let device_id = session.remote_device_id();
            if let Err(e) = self.store.set_device_verified(&user_id, &device_id, true).await {
                warn!(%user_id, %device_id, "couldn't persist the verified flag: {e}");
            } else {
                info!(%user_id, %device_id, "device verified");
            }
        }
    }

    async fn handle_verification_event(
        &self,
        event: &AnyEvent,
        outcome: &mut ToDeviceOutcome,
    ) -> CryptoResult<()> {
        let sender = event.sender().unwrap_or("").to_owned();
        let content = event.content_json();
        let transaction_id =
            content.get("transaction_id").and_then(Value::as_str).unwrap_or("").to_owned();

        match event {
            AnyEvent::KeyVerificationRequest(e) => {
                let from_device = e.from_device().to_owned();
                if !e.methods().iter().any(|m| m == "m.sas.v1") {
                    debug!(sender, "verification request without SAS support, ignoring");
                    return Ok(());
                }
                let session = Arc::new(KeyVerificationSession::incoming(
                    self.own_identity().await,
                    &sender,
                    &from_device,
                    transaction_id.clone(),
                ));
                if let Some(device) = self.store.device(&sender, &from_device).await? {
                    if let Some(key) = device.ed25519_key_base64() {
                        session.set_their_ed25519(key.to_owned());
                    }
                }
                info!(sender, from_device, "new incoming key verification request");
                self.verifications.insert(transaction_id, session.clone());
                outcome.new_verification_sessions.push(session);
            }
            AnyEvent::KeyVerificationReady(_) => {
                if let Some(session) = self.verification_session(&transaction_id) {
                    session.receive_ready(&content);
                }
            }
            AnyEvent::KeyVerificationStart(e) => {
                let session = match self.verification_session(&transaction_id) {
                    Some(session) => session,
                    None => {
                        // Direct starts without a preceding request are
                        // legal for legacy peers; treat them as a request.
                        let from_device = e.from_device().to_owned();
                        let session = Arc::new(KeyVerificationSession::incoming(
                            self.own_identity().await,
                            &sender,
                            &from_device,
                            transaction_id.clone(),
                        ));
                        if let Some(device) = self.store.device(&sender, &from_device).await? {
                            if let Some(key) = device.ed25519_key_base64() {
                                session.set_their_ed25519(key.to_owned());
                            }
                        }
                        // The legacy path has no request/ready round trip;
                        // the session goes straight to the SAS stage.
                        let _ = session.accept();
                        self.verifications.insert(transaction_id, session.clone());
                        outcome.new_verification_sessions.push(session.clone());
                        session
                    }
                };
                let replies = session.receive_start(&content)?;
                self.send_verification_messages(&session, replies).await.ok();
            }
            AnyEvent::KeyVerificationAccept(_) => {
                if let Some(session) = self.verification_session(&transaction_id) {
                    let replies = session.receive_accept(&content);
                    self.send_verification_messages(&session, replies).await.ok();
                }
            }
            AnyEvent::KeyVerificationKey(_) => {
                if let Some(session) = self.verification_session(&transaction_id) {
                    let replies = session.receive_key(&content)?;
                    self.send_verification_messages(&session, replies).await.ok();
                }
            }
            AnyEvent::KeyVerificationMac(_) => {
                if let Some(session) = self.verification_session(&transaction_id) {
                    let replies = session.receive_mac(&content)?;
                    self.send_verification_messages(&session, replies).await.ok();
                    self.after_verification_dispatch(&session).await;
                }
            }
            AnyEvent::KeyVerificationCancel(_) => {
                if let Some(session) = self.verification_session(&transaction_id) {
                    session.receive_cancel();
                }
            }
            AnyEvent::KeyVerificationDone(_) => {
                if let Some(session) = self.verification_session(&transaction_id) {
                    session.receive_done();
                    self.after_verification_dispatch(&session).await;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Cancels timed-out verification sessions and drops finished ones.
    async fn garbage_collect_verifications(&self) {
        let mut cancellations = Vec::new();
        self.verifications.retain(|_, session| {
            if let Some(message) = session.cancel_if_timed_out() {
                cancellations.push((session.clone(), message));
            }
            !(session.is_done() || session.is_cancelled())
        });
        for (session, message) in cancellations {
            self.send_verification_messages(&session, vec![message]).await.ok();
        }
    }

    /// Assembles olm-encrypted to-device content for one target device;
    /// the transport for encrypted to-device payloads.
    pub(crate) async fn assemble_encrypted_content(
        &self,
        payload: &Event,
        target_user_id: &str,
        target_device_id: &str,
    ) -> CryptoResult<Value> {
        let device =
            self.store.device(target_user_id, target_device_id).await?.ok_or_else(|| {
                CryptoError::UnknownDevice {
                    user_id: target_user_id.to_owned(),
                    device_id: target_device_id.to_owned(),
                }
            })?;
        self.olm_encrypt_for(&device, payload.matrix_type(), &payload.content_json()).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        http_client::{HttpClient, RequestConfig},
        store::MemoryKeychain,
    };

    fn http_client() -> HttpClient {
        HttpClient::new(
            Arc::new(reqwest::Client::new()),
            Some(url::Url::parse("http://localhost:1").unwrap()),
            RequestConfig::default().disable_retry(),
        )
    }

    async fn machine(user_id: &str, device_id: &str) -> OlmMachine {
        OlmMachine::new(
            user_id.to_owned(),
            device_id.to_owned(),
            &MemoryKeychain::new(),
            Arc::new(crate::crypto::MemoryCryptoStore::new()),
            http_client(),
        )
        .await
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn fresh_account_wants_a_key_upload() {
        let keychain = MemoryKeychain::new();
        let store = Arc::new(crate::crypto::MemoryCryptoStore::new());
        let (machine, is_new) = OlmMachine::new(
            "@alice:example.org".to_owned(),
            "ALICEDEV".to_owned(),
            &keychain,
            store,
            http_client(),
        )
        .await
        .unwrap();
        assert!(is_new);
        assert!(machine.should_upload_one_time_keys().await);
    }

    #[tokio::test]
    async fn account_restores_from_the_store() {
        let keychain = MemoryKeychain::new();
        let store = Arc::new(crate::crypto::MemoryCryptoStore::new());

        let (first, is_new) = OlmMachine::new(
            "@alice:example.org".to_owned(),
            "ALICEDEV".to_owned(),
            &keychain,
            store.clone(),
            http_client(),
        )
        .await
        .unwrap();
        assert!(is_new);
        let keys = first.identity_keys().await;

        let (second, is_new) = OlmMachine::new(
            "@alice:example.org".to_owned(),
            "ALICEDEV".to_owned(),
            &keychain,
            store,
            http_client(),
        )
        .await
        .unwrap();
        assert!(!is_new);
        assert_eq!(second.identity_keys().await, keys);
    }

    #[tokio::test]
    async fn device_list_changes_mark_tracked_users_outdated() {
        let machine = machine("@alice:example.org", "ALICEDEV").await;
        machine.update_tracked_users([&"@bob:example.org".to_owned()]).await;
        // New users are outdated right away.
        assert!(machine.has_outdated_users());
        machine.outdated_users.lock().unwrap().clear();

        let response: crate::sync::SyncResponse = serde_json::from_value(json!({
            "next_batch": "s1",
            "device_lists": { "changed": ["@bob:example.org", "@stranger:example.org"] }
        }))
        .unwrap();
        machine.on_sync_response(&response).await;

        let outdated = machine.outdated_users.lock().unwrap().clone();
        assert!(outdated.contains("@bob:example.org"));
        // Untracked users don't get queried.
        assert!(!outdated.contains("@stranger:example.org"));
    }

    #[tokio::test]
    async fn missing_megolm_session_buffers_the_event() {
        let machine = machine("@alice:example.org", "ALICEDEV").await;
        let event = json!({
            "type": "m.room.encrypted",
            "event_id": "$1",
            "sender": "@bob:example.org",
            "origin_server_ts": 1u64,
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": "bobcurve",
                "session_id": "unknown-session",
                "ciphertext": "AwgAE",
                "device_id": "BOBDEV",
            }
        });

        let result = machine.decrypt_room_event("!r:example.org", &event).await;
        assert!(matches!(result, Err(CryptoError::NoMatchingSession { .. })));
        assert_eq!(machine.pending_events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn late_room_key_unlocks_the_pending_event_exactly_once() {
        let alice = machine("@alice:example.org", "ALICEDEV").await;
        let bob = machine("@bob:example.org", "BOBDEV").await;

        // Bob encrypts with an outbound session whose key alice doesn't
        // have yet; the olm channel is exercised separately.
        let mut outbound = OutboundSession::new();
        let session_id = outbound.session_id();
        let session_key = outbound.session_key().to_base64();
        let plaintext = json!({
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "late but intact" },
            "room_id": "!r:example.org",
        })
        .to_string();
        let ciphertext = outbound.encrypt(&plaintext);
        let (bob_curve, _) = bob.identity_keys().await;

        let event = json!({
            "type": "m.room.encrypted",
            "event_id": "$1",
            "sender": "@bob:example.org",
            "origin_server_ts": 1u64,
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": bob_curve,
                "session_id": session_id,
                "ciphertext": ciphertext,
                "device_id": "BOBDEV",
            }
        });

        // The event arrives before the key: buffered.
        let result = alice.decrypt_room_event("!r:example.org", &event).await;
        assert!(matches!(result, Err(CryptoError::NoMatchingSession { .. })));

        // The key arrives: the buffered event decrypts exactly once.
        let unlocked = alice
            .add_room_key(&bob_curve, "!r:example.org", &session_id, &session_key)
            .await
            .unwrap();
        assert_eq!(unlocked.len(), 1);
        let AnyEvent::RoomMessage(message) = &unlocked[0].1 else { panic!("not a message") };
        assert_eq!(message.body(), "late but intact");
        assert_eq!(message.sender(), Some("@bob:example.org"));
        assert!(alice.pending_events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn olm_channel_between_two_machines() {
        let alice = machine("@alice:example.org", "ALICEDEV").await;
        let bob = machine("@bob:example.org", "BOBDEV").await;

        let (bob_curve, bob_ed) = bob.identity_keys().await;

        // Hand-craft bob's signed device record for alice's store, plus a
        // one-time key claimed out of band.
        let bob_device_payload = {
            let account = bob.account.lock().await;
            let mut payload = json!({
                "user_id": "@bob:example.org",
                "device_id": "BOBDEV",
                "algorithms": [OLM_ALGORITHM, MEGOLM_ALGORITHM],
                "keys": {
                    "curve25519:BOBDEV": bob_curve,
                    "ed25519:BOBDEV": bob_ed,
                },
            });
            let signature = OlmMachine::sign_with(&account, &payload);
            payload["signatures"] = json!({ "@bob:example.org": { "ed25519:BOBDEV": signature } });
            payload
        };
        let bob_device =
            Device::from_keys_payload("@bob:example.org", "BOBDEV", &bob_device_payload).unwrap();
        alice.store.save_device(bob_device.clone()).await.unwrap();

        let one_time_key = {
            let mut account = bob.account.lock().await;
            account.generate_one_time_keys(1);
            let (_, key) = account.one_time_keys().into_iter().next().unwrap();
            let mut payload = json!({ "key": key.to_base64() });
            let signature = OlmMachine::sign_with(&account, &payload);
            payload["signatures"] = json!({ "@bob:example.org": { "ed25519:BOBDEV": signature } });
            account.mark_keys_as_published();
            payload
        };

        alice.create_outbound_olm_session(&bob_device, &one_time_key).await.unwrap();
        let encrypted = alice
            .olm_encrypt_for(&bob_device, "m.room_key", &json!({ "hello": "bob" }))
            .await
            .unwrap();

        // Bob decrypts the to-device event through the machine path.
        let raw = json!({
            "type": "m.room.encrypted",
            "sender": "@alice:example.org",
            "content": encrypted,
        });
        let inner = bob.decrypt_to_device_event(&raw).await.unwrap();
        assert_eq!(inner["type"], "m.room_key");
        assert_eq!(inner["content"]["hello"], "bob");
        assert_eq!(inner["sender"], "@alice:example.org");
        assert_eq!(inner["keys"]["ed25519"], alice.identity_keys().await.1);
    }
}
