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

//! Persisted settings, readable and writable by other processes.
//!
//! Keys are slash-separated paths; the ones the core recognises:
//!
//! - `Network/proxyHostName`, `Network/proxyPort`, `Network/proxyType`
//! - `cache_type` — `"json"` or `"binary"`
//! - `Accounts/<user id>/keep_logged_in`
//! - `Accounts/<user id>/homeserver`
//! - `Accounts/<user id>/device_id`

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tracing::warn;

/// A flat key/value store for settings. Reads happen at startup; writes on
/// explicit save requests and on the embedder's about-to-quit signal.
pub trait SettingsStore: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    /// Removes every key under `prefix/`.
    fn remove_group(&self, prefix: &str);
}

/// The per-account settings group prefix.
pub fn account_group(user_id: &str) -> String {
    format!("Accounts/{user_id}")
}

/// An in-memory settings store.
#[derive(Clone, Debug, Default)]
pub struct MemorySettings {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.lock().unwrap().insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn remove_group(&self, prefix: &str) {
        let prefix = format!("{prefix}/");
        self.entries.lock().unwrap().retain(|key, _| !key.starts_with(&prefix));
    }
}

/// A settings store backed by a JSON file, written through on every
/// mutation so concurrent processes see a consistent view.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileSettings {
    pub fn open(path: PathBuf) -> Self {
        let entries = std::fs::read(&path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default();
        FileSettings { path, entries: Mutex::new(entries) }
    }

    fn flush(&self, entries: &BTreeMap<String, String>) {
        match serde_json::to_vec_pretty(entries) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.path, data) {
                    warn!(path = %self.path.display(), "couldn't write settings: {e}");
                }
            }
            Err(e) => warn!("couldn't serialize settings: {e}"),
        }
    }
}

impl SettingsStore for FileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_owned(), value.to_owned());
        self.flush(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        self.flush(&entries);
    }

    fn remove_group(&self, prefix: &str) {
        let prefix = format!("{prefix}/");
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|key, _| !key.starts_with(&prefix));
        self.flush(&entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_are_removed_wholesale() {
        let settings = MemorySettings::new();
        settings.set("Accounts/@a:ex/device_id", "DEV");
        settings.set("Accounts/@a:ex/keep_logged_in", "true");
        settings.set("Accounts/@b:ex/device_id", "OTHER");

        settings.remove_group("Accounts/@a:ex");
        assert!(settings.get("Accounts/@a:ex/device_id").is_none());
        assert_eq!(settings.get("Accounts/@b:ex/device_id").as_deref(), Some("OTHER"));
    }

    #[test]
    fn file_settings_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        {
            let settings = FileSettings::open(path.clone());
            settings.set("cache_type", "binary");
        }
        let settings = FileSettings::open(path);
        assert_eq!(settings.get("cache_type").as_deref(), Some("binary"));
    }
}
