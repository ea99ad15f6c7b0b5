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

//! Persistence of the encryption keys.
//!
//! The interface a real (SQL or equivalent) backend implements; the
//! bundled [`MemoryCryptoStore`] keeps everything in memory and is the
//! default, losing the keys when the connection goes away.

use std::{collections::HashMap, fmt::Debug, sync::Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;

use super::{
    group_sessions::{InboundSessionRecord, OutboundSessionRecord},
    CrossSigningKeys, CryptoResult, Device,
};
use crate::identifiers::{DeviceId, RoomId, UserId};

/// Storage for the encryption state: the olm account pickle, olm and
/// megolm sessions, tracked devices and cross-signing keys.
#[async_trait]
pub trait CryptoStore: Debug + Send + Sync {
    /// The encrypted olm account pickle, if one was stored.
    async fn load_account(&self) -> CryptoResult<Option<String>>;
    async fn save_account(&self, encrypted_pickle: String) -> CryptoResult<()>;

    async fn save_olm_session(
        &self,
        sender_key: &str,
        session_id: &str,
        pickle: Value,
    ) -> CryptoResult<()>;
    /// All olm sessions established with the given curve25519 key, as
    /// `(session id, pickle)` pairs.
    async fn olm_sessions(&self, sender_key: &str) -> CryptoResult<Vec<(String, Value)>>;
    /// The sender curve25519 key an olm session belongs to; the backward
    /// link used to answer megolm-session verification queries.
    async fn olm_session_sender(&self, session_id: &str) -> CryptoResult<Option<String>>;

    /// Stores an inbound megolm session; returns whether a session under
    /// the same `(room id, session id)` was already present.
    async fn save_inbound_session(&self, record: InboundSessionRecord) -> CryptoResult<bool>;
    async fn inbound_session(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> CryptoResult<Option<InboundSessionRecord>>;
    /// All inbound megolm sessions of one room.
    async fn inbound_sessions_for_room(
        &self,
        room_id: &str,
    ) -> CryptoResult<Vec<InboundSessionRecord>>;

    async fn save_outbound_session(&self, record: OutboundSessionRecord) -> CryptoResult<()>;
    async fn outbound_session(
        &self,
        room_id: &str,
    ) -> CryptoResult<Option<OutboundSessionRecord>>;

    async fn tracked_users(&self) -> CryptoResult<HashSet<UserId>>;
    /// Adds a user to the tracked set; returns true if newly added.
    async fn add_tracked_user(&self, user_id: &str) -> CryptoResult<bool>;

    async fn save_device(&self, device: Device) -> CryptoResult<()>;
    async fn delete_device(&self, user_id: &str, device_id: &str) -> CryptoResult<()>;
    async fn device(&self, user_id: &str, device_id: &str) -> CryptoResult<Option<Device>>;
    async fn user_devices(&self, user_id: &str) -> CryptoResult<Vec<Device>>;
    /// Looks a device up by its curve25519 identity key.
    async fn device_by_curve_key(&self, curve_key: &str) -> CryptoResult<Option<Device>>;
    async fn set_device_verified(
        &self,
        user_id: &str,
        device_id: &str,
        verified: bool,
    ) -> CryptoResult<bool>;

    async fn save_cross_signing_keys(
        &self,
        user_id: &str,
        keys: CrossSigningKeys,
    ) -> CryptoResult<()>;
    async fn cross_signing_keys(&self, user_id: &str) -> CryptoResult<Option<CrossSigningKeys>>;
}

/// The in-memory crypto store.
#[derive(Debug, Default)]
pub struct MemoryCryptoStore {
    account: Mutex<Option<String>>,
    olm_sessions: Mutex<HashMap<String, Vec<(String, Value)>>>,
    olm_session_senders: Mutex<HashMap<String, String>>,
    inbound_sessions: Mutex<HashMap<(RoomId, String), InboundSessionRecord>>,
    outbound_sessions: Mutex<HashMap<RoomId, OutboundSessionRecord>>,
    tracked_users: Mutex<HashSet<UserId>>,
    devices: DashMap<UserId, DashMap<DeviceId, Device>>,
    cross_signing: Mutex<HashMap<UserId, CrossSigningKeys>>,
}

impl MemoryCryptoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryCryptoStore {
    async fn load_account(&self) -> CryptoResult<Option<String>> {
        Ok(self.account.lock().unwrap().clone())
    }

    async fn save_account(&self, encrypted_pickle: String) -> CryptoResult<()> {
        *self.account.lock().unwrap() = Some(encrypted_pickle);
        Ok(())
    }

    async fn save_olm_session(
        &self,
        sender_key: &str,
        session_id: &str,
        pickle: Value,
    ) -> CryptoResult<()> {
        let mut sessions = self.olm_sessions.lock().unwrap();
        let list = sessions.entry(sender_key.to_owned()).or_default();
        if let Some(existing) = list.iter_mut().find(|(id, _)| id == session_id) {
            existing.1 = pickle;
        } else {
            list.push((session_id.to_owned(), pickle));
        }
        self.olm_session_senders
            .lock()
            .unwrap()
            .insert(session_id.to_owned(), sender_key.to_owned());
        Ok(())
    }

    async fn olm_sessions(&self, sender_key: &str) -> CryptoResult<Vec<(String, Value)>> {
        Ok(self.olm_sessions.lock().unwrap().get(sender_key).cloned().unwrap_or_default())
    }

    async fn olm_session_sender(&self, session_id: &str) -> CryptoResult<Option<String>> {
        Ok(self.olm_session_senders.lock().unwrap().get(session_id).cloned())
    }

    async fn save_inbound_session(&self, record: InboundSessionRecord) -> CryptoResult<bool> {
        let key = (record.room_id.clone(), record.session_id.clone());
        Ok(self.inbound_sessions.lock().unwrap().insert(key, record).is_some())
    }

    async fn inbound_session(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> CryptoResult<Option<InboundSessionRecord>> {
        let key = (room_id.to_owned(), session_id.to_owned());
        Ok(self.inbound_sessions.lock().unwrap().get(&key).cloned())
    }

    async fn inbound_sessions_for_room(
        &self,
        room_id: &str,
    ) -> CryptoResult<Vec<InboundSessionRecord>> {
        Ok(self
            .inbound_sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|((room, _), _)| room == room_id)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn save_outbound_session(&self, record: OutboundSessionRecord) -> CryptoResult<()> {
        self.outbound_sessions.lock().unwrap().insert(record.room_id.clone(), record);
        Ok(())
    }

    async fn outbound_session(
        &self,
        room_id: &str,
    ) -> CryptoResult<Option<OutboundSessionRecord>> {
        Ok(self.outbound_sessions.lock().unwrap().get(room_id).cloned())
    }

    async fn tracked_users(&self) -> CryptoResult<HashSet<UserId>> {
        Ok(self.tracked_users.lock().unwrap().clone())
    }

    async fn add_tracked_user(&self, user_id: &str) -> CryptoResult<bool> {
        Ok(self.tracked_users.lock().unwrap().insert(user_id.to_owned()))
    }

    async fn save_device(&self, device: Device) -> CryptoResult<()> {
        self.devices
            .entry(device.user_id().clone())
            .or_default()
            .insert(device.device_id().clone(), device);
        Ok(())
    }

    async fn delete_device(&self, user_id: &str, device_id: &str) -> CryptoResult<()> {
        if let Some(devices) = self.devices.get(user_id) {
            devices.remove(device_id);
        }
        Ok(())
    }

    async fn device(&self, user_id: &str, device_id: &str) -> CryptoResult<Option<Device>> {
        Ok(self
            .devices
            .get(user_id)
            .and_then(|devices| devices.get(device_id).map(|d| d.value().clone())))
    }

    async fn user_devices(&self, user_id: &str) -> CryptoResult<Vec<Device>> {
        Ok(self
            .devices
            .get(user_id)
            .map(|devices| devices.iter().map(|d| d.value().clone()).collect())
            .unwrap_or_default())
    }

    async fn device_by_curve_key(&self, curve_key: &str) -> CryptoResult<Option<Device>> {
        for user_devices in self.devices.iter() {
            for device in user_devices.value().iter() {
                if device.value().curve25519_key_base64() == Some(curve_key) {
                    return Ok(Some(device.value().clone()));
                }
            }
        }
        Ok(None)
    }

    async fn set_device_verified(
        &self,
        user_id: &str,
        device_id: &str,
        verified: bool,
    ) -> CryptoResult<bool> {
        if let Some(devices) = self.devices.get(user_id) {
            if let Some(mut device) = devices.get_mut(device_id) {
                device.set_verified(verified);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn save_cross_signing_keys(
        &self,
        user_id: &str,
        keys: CrossSigningKeys,
    ) -> CryptoResult<()> {
        self.cross_signing.lock().unwrap().insert(user_id.to_owned(), keys);
        Ok(())
    }

    async fn cross_signing_keys(&self, user_id: &str) -> CryptoResult<Option<CrossSigningKeys>> {
        Ok(self.cross_signing.lock().unwrap().get(user_id).cloned())
    }
}
