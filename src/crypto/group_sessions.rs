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

//! Megolm session wrappers: the per-room outbound session with its
//! rotation bookkeeping, and the persisted records of both directions.

use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use serde_json::Value;
use vodozemac::megolm::{GroupSession, SessionConfig, SessionKey};

use super::{CryptoError, CryptoResult};
use crate::{
    identifiers::{DeviceId, RoomId, UserId},
    room::EncryptionSettings,
};

/// A persisted inbound megolm session. The session key is kept as
/// received, so the session can always be rebuilt from its first known
/// index.
#[derive(Clone, Debug)]
pub struct InboundSessionRecord {
    pub room_id: RoomId,
    /// The curve25519 key of the device that sent the session.
    pub sender_key: String,
    pub session_id: String,
    /// The exported session key, base64.
    pub session_key: String,
}

/// A persisted outbound megolm session.
#[derive(Clone, Debug)]
pub struct OutboundSessionRecord {
    pub room_id: RoomId,
    /// The vodozemac pickle, as JSON.
    pub pickle: Value,
    /// Milliseconds since the epoch at creation, for rotation across
    /// restarts.
    pub created_at_ms: u64,
    pub message_count: u64,
}

/// The current outbound megolm session of one room.
pub(crate) struct OutboundSession {
    session: GroupSession,
    created: Instant,
    message_count: u64,
    /// Devices the session key has been sent to.
    shared_with: HashSet<(UserId, DeviceId)>,
}

impl OutboundSession {
    pub(crate) fn new() -> OutboundSession {
        OutboundSession {
            session: GroupSession::new(SessionConfig::default()),
            created: Instant::now(),
            message_count: 0,
            shared_with: HashSet::new(),
        }
    }

    pub(crate) fn session_id(&self) -> String {
        self.session.session_id()
    }

    pub(crate) fn session_key(&self) -> SessionKey {
        self.session.session_key()
    }

    /// Whether the room's rotation limits force a fresh session.
    pub(crate) fn expired(&self, settings: &EncryptionSettings) -> bool {
        self.message_count >= settings.rotation_period_msgs
            || self.created.elapsed() >= Duration::from_millis(settings.rotation_period_ms)
    }

    pub(crate) fn encrypt(&mut self, plaintext: &str) -> String {
        self.message_count += 1;
        self.session.encrypt(plaintext).to_base64()
    }

    pub(crate) fn message_index(&self) -> u32 {
        self.session.message_index()
    }

    pub(crate) fn is_shared_with(&self, user_id: &str, device_id: &str) -> bool {
        self.shared_with.contains(&(user_id.to_owned(), device_id.to_owned()))
    }

    pub(crate) fn mark_shared_with(&mut self, user_id: &str, device_id: &str) {
        self.shared_with.insert((user_id.to_owned(), device_id.to_owned()));
    }

    pub(crate) fn to_record(&self, room_id: &str) -> CryptoResult<OutboundSessionRecord> {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let age_ms = self.created.elapsed().as_millis() as u64;
        Ok(OutboundSessionRecord {
            room_id: room_id.to_owned(),
            pickle: serde_json::to_value(self.session.pickle())?,
            created_at_ms: now_ms.saturating_sub(age_ms),
            message_count: self.message_count,
        })
    }

    pub(crate) fn from_record(record: &OutboundSessionRecord) -> CryptoResult<OutboundSession> {
        let pickle = serde_json::from_value(record.pickle.clone())?;
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let age = Duration::from_millis(now_ms.saturating_sub(record.created_at_ms));
        Ok(OutboundSession {
            session: GroupSession::from_pickle(pickle),
            created: Instant::now().checked_sub(age).unwrap_or_else(Instant::now),
            message_count: record.message_count,
            // Restored sessions are re-shared; sending a key twice is
            // harmless, failing to send it is not.
            shared_with: HashSet::new(),
        })
    }
}

/// Parses a session key from its base64 form.
pub(crate) fn parse_session_key(key: &str) -> CryptoResult<SessionKey> {
    SessionKey::from_base64(key)
        .map_err(|e| CryptoError::BadEncryptedMessage(format!("invalid session key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(period_ms: u64, period_msgs: u64) -> EncryptionSettings {
        EncryptionSettings { rotation_period_ms: period_ms, rotation_period_msgs: period_msgs }
    }

    #[test]
    fn sessions_expire_by_message_count() {
        let mut session = OutboundSession::new();
        assert!(!session.expired(&settings(3_600_000, 2)));
        session.encrypt("one");
        session.encrypt("two");
        assert!(session.expired(&settings(3_600_000, 2)));
    }

    #[test]
    fn record_round_trip_keeps_the_ratchet() {
        let mut session = OutboundSession::new();
        session.encrypt("advance the ratchet");
        let record = session.to_record("!r:example.org").unwrap();

        let restored = OutboundSession::from_record(&record).unwrap();
        assert_eq!(restored.session_id(), session.session_id());
        assert_eq!(restored.message_index(), session.message_index());
        assert_eq!(restored.message_count, 1);
    }

    #[test]
    fn inbound_can_decrypt_outbound() {
        use vodozemac::megolm::{InboundGroupSession, MegolmMessage, SessionConfig};

        let mut outbound = OutboundSession::new();
        let mut inbound =
            InboundGroupSession::new(&outbound.session_key(), SessionConfig::default());

        let ciphertext = outbound.encrypt("it works");
        let message = MegolmMessage::from_base64(&ciphertext).unwrap();
        let decrypted = inbound.decrypt(&message).unwrap();
        assert_eq!(decrypted.plaintext, b"it works");
    }
}
