// Copyright (C) 2024 Nicola Dardanis <nicdard@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// The key under which the server address is persisted.
pub const SERVER_PREFERENCE_KEY: &str = "copyparty_server_url";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A string key-value store whose operations may fail at any time
/// (no permissions, full disk, private mode).
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory store. Can be built unavailable to exercise the failure mode.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    unavailable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that fails every operation.
    pub fn unavailable() -> Self {
        MemoryStore {
            entries: Mutex::default(),
            unavailable: true,
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        if self.unavailable {
            return Err(StorageError::Unavailable("memory store disabled".to_string()));
        }
        self.entries
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries()?.remove(key);
        Ok(())
    }
}

/// A store persisted as a flat JSON object in a single file.
/// A missing file reads as an empty store.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| StorageError::Unavailable(format!("`{}`: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StorageError::Unavailable(format!(
                "`{}`: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn store(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let unavailable = |e: &dyn std::fmt::Display| {
            StorageError::Unavailable(format!("`{}`: {}", self.path.display(), e))
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(&e))?;
        }
        let content = serde_json::to_string_pretty(entries).map_err(|e| unavailable(&e))?;
        std::fs::write(&self.path, content).map_err(|e| unavailable(&e))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        self.store(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.store(&entries)?;
        }
        Ok(())
    }
}

/// Remembers which upstream server the user works with.
/// This is plain, non-secret data: it never holds the credential.
/// Storage failures are logged and read as "no preference".
#[derive(Debug)]
pub struct ServerPreference<S> {
    store: S,
}

impl<S: KeyValueStore> ServerPreference<S> {
    pub fn new(store: S) -> Self {
        ServerPreference { store }
    }

    pub fn save(&self, server_url: &str) {
        if let Err(e) = self.store.set(SERVER_PREFERENCE_KEY, server_url) {
            log::warn!("Couldn't save the server preference: `{}`", e);
        }
    }

    pub fn get(&self) -> Option<String> {
        self.store
            .get(SERVER_PREFERENCE_KEY)
            .inspect_err(|e| log::warn!("Couldn't read the server preference: `{}`", e))
            .ok()
            .flatten()
            .filter(|url| !url.is_empty())
    }

    pub fn clear(&self) {
        if let Err(e) = self.store.remove(SERVER_PREFERENCE_KEY) {
            log::warn!("Couldn't clear the server preference: `{}`", e);
        }
    }
}
