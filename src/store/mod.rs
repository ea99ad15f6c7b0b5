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

//! Durable state between process runs: the state cache on disk, the OS
//! keychain for secrets, and per-account settings.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub mod keychain;
pub mod settings;

pub use keychain::{Keychain, KeychainError, MemoryKeychain};
pub use settings::{FileSettings, MemorySettings, SettingsStore};

/// The version of the state cache format; caches with a different major
/// version are discarded.
pub const CACHE_VERSION: (u32, u32) = (1, 0);

/// An error from the local cache or settings storage.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("can't read or write the store: {0}")]
    Io(#[from] std::io::Error),
    #[error("error serializing data for the store: {0}")]
    Json(#[from] serde_json::Error),
    #[error("error en/decoding the binary store format: {0}")]
    Cbor(String),
    #[error(transparent)]
    Keychain(#[from] KeychainError),
}

/// The on-disk format of the state cache; the choice is persisted in
/// settings as `cache_type`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheFormat {
    #[default]
    Json,
    /// CBOR, selected by the `"binary"` cache type.
    Cbor,
}

impl CacheFormat {
    /// Parses the `cache_type` settings value.
    pub fn from_setting(value: &str) -> CacheFormat {
        match value {
            "binary" => CacheFormat::Cbor,
            _ => CacheFormat::Json,
        }
    }

    /// The `cache_type` settings value for this format.
    pub fn as_setting(self) -> &'static str {
        match self {
            CacheFormat::Json => "json",
            CacheFormat::Cbor => "binary",
        }
    }
}

/// Reads and writes the state cache of one account: a top-level blob with
/// the sync token and the room roster, plus one file per room.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    format: CacheFormat,
}

impl StateStore {
    /// Opens (and creates, if needed) the cache directory of one account
    /// under `base_dir`. The per-account directory is the user id with
    /// `:` replaced by `_`.
    pub fn open(base_dir: &Path, user_id: &str, format: CacheFormat) -> Result<Self, StoreError> {
        let safe_user_id = user_id.replace(':', "_");
        let dir = base_dir.join(safe_user_id);
        std::fs::create_dir_all(&dir)?;
        Ok(StateStore { dir, format })
    }

    fn top_level_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    fn room_path(&self, room_id: &str) -> PathBuf {
        let escaped: String = room_id
            .chars()
            .map(|c| if matches!(c, ':' | '/' | '\\') { '_' } else { c })
            .collect();
        self.dir.join(format!("{escaped}.json"))
    }

    fn write_blob(&self, path: &Path, value: &Value) -> Result<(), StoreError> {
        let data = match self.format {
            CacheFormat::Json => serde_json::to_vec(value)?,
            CacheFormat::Cbor => {
                minicbor_serde::to_vec(value).map_err(|e| StoreError::Cbor(e.to_string()))?
            }
        };
        let mut file = std::fs::File::create(path)?;
        file.write_all(&data)?;
        debug!(path = %path.display(), bytes = data.len(), "state cache blob written");
        Ok(())
    }

    fn read_blob(&self, path: &Path) -> Result<Option<Value>, StoreError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = match self.format {
            CacheFormat::Json => serde_json::from_slice(&data)?,
            CacheFormat::Cbor => {
                minicbor_serde::from_slice(&data).map_err(|e| StoreError::Cbor(e.to_string()))?
            }
        };
        Ok(Some(value))
    }

    /// Writes the top-level state blob.
    pub fn save(&self, root: &Value) -> Result<(), StoreError> {
        self.write_blob(&self.top_level_path(), root)
    }

    /// Reads the top-level state blob; `None` when there is no cache, or
    /// when it was written by an incompatible library version.
    pub fn load(&self) -> Result<Option<Value>, StoreError> {
        let Some(root) = self.read_blob(&self.top_level_path())? else { return Ok(None) };
        let major = root
            .get("cache_version")
            .and_then(|v| v.get("major"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if major != u64::from(CACHE_VERSION.0) {
            warn!(major, "state cache has an incompatible version, discarding");
            return Ok(None);
        }
        Ok(Some(root))
    }

    /// Writes the per-room cache file.
    pub fn save_room(&self, room_id: &str, payload: &Value) -> Result<(), StoreError> {
        self.write_blob(&self.room_path(room_id), payload)
    }

    /// Reads the per-room cache file.
    pub fn load_room(&self, room_id: &str) -> Result<Option<Value>, StoreError> {
        self.read_blob(&self.room_path(room_id))
    }

    /// Drops the whole cache of this account.
    pub fn clear(&self) -> Result<(), StoreError> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            StateStore::open(dir.path(), "@alice:example.org", CacheFormat::Json).unwrap();
        let root = json!({
            "cache_version": { "major": CACHE_VERSION.0, "minor": CACHE_VERSION.1 },
            "next_batch": "s1",
            "rooms": { "join": { "!r:ex": null } }
        });
        store.save(&root).unwrap();
        assert_eq!(store.load().unwrap(), Some(root));
        assert!(dir.path().join("@alice_example.org").exists());
    }

    #[test]
    fn cbor_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            StateStore::open(dir.path(), "@alice:example.org", CacheFormat::Cbor).unwrap();
        let root = json!({
            "cache_version": { "major": CACHE_VERSION.0, "minor": CACHE_VERSION.1 },
            "next_batch": "s2",
        });
        store.save(&root).unwrap();
        assert_eq!(store.load().unwrap(), Some(root));
    }

    #[test]
    fn incompatible_major_version_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            StateStore::open(dir.path(), "@alice:example.org", CacheFormat::Json).unwrap();
        store
            .save(&json!({ "cache_version": { "major": 999, "minor": 0 }, "next_batch": "s" }))
            .unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn room_files_escape_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            StateStore::open(dir.path(), "@alice:example.org", CacheFormat::Json).unwrap();
        store.save_room("!room:example.org", &json!({ "state": {} })).unwrap();
        assert!(dir
            .path()
            .join("@alice_example.org")
            .join("!room_example.org.json")
            .exists());
        assert_eq!(
            store.load_room("!room:example.org").unwrap(),
            Some(json!({ "state": {} }))
        );
    }
}
