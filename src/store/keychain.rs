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

//! The OS keychain, seen as an external collaborator.
//!
//! Two entries exist per account: the access token under the bare user id,
//! and the olm pickling key under `<user id>-Pickle`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;

/// An error from the platform's secret storage.
#[derive(Error, Debug)]
pub enum KeychainError {
    /// There is no entry under the requested key. Non-fatal for deletes.
    #[error("no keychain entry under that key")]
    NotFound,
    /// Access to the keychain was denied or the backend failed.
    #[error("keychain access failed: {0}")]
    Access(String),
}

/// Platform secret storage with three operations. The embedder provides
/// the real implementation; [`MemoryKeychain`] backs tests and setups
/// without an OS keychain.
pub trait Keychain: Send + Sync + std::fmt::Debug {
    fn read(&self, key: &str) -> Result<Vec<u8>, KeychainError>;
    fn write(&self, key: &str, value: &[u8]) -> Result<(), KeychainError>;
    fn delete(&self, key: &str) -> Result<(), KeychainError>;
}

/// The keychain key holding the olm pickling key of an account.
pub fn pickle_key_entry(user_id: &str) -> String {
    format!("{user_id}-Pickle")
}

/// An in-memory keychain.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeychain {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keychain for MemoryKeychain {
    fn read(&self, key: &str) -> Result<Vec<u8>, KeychainError> {
        self.entries.lock().unwrap().get(key).cloned().ok_or(KeychainError::NotFound)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), KeychainError> {
        self.entries.lock().unwrap().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KeychainError> {
        self.entries.lock().unwrap().remove(key).map(|_| ()).ok_or(KeychainError::NotFound)
    }
}
