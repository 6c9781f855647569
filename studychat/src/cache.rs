//! File-backed JSON cache for client state that should survive restarts.
//!
//! Entries are JSON values stamped with the wall-clock time they were
//! written and expire after a fixed TTL. The whole cache lives in one
//! `cache.json` file under the cache directory; every write rewrites it
//! through a temporary file and a rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use studychat_proto::ids::{RoomId, Timestamp};

const CACHE_FILE: &str = "cache.json";

/// Errors from reading or writing the cache file.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cache directory could not be created.
    #[error("failed to create cache directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The cache file could not be read or written.
    #[error("cache file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A value could not be (de)serialized.
    #[error("cache serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    stored_at_ms: u64,
    value: serde_json::Value,
}

/// Key under which a room's last-known message page is stored.
#[must_use]
pub fn messages_key(room: &RoomId) -> String {
    format!("rooms/{room}/messages")
}

/// A small persistent key-value cache with time-based expiry.
#[derive(Debug)]
pub struct JsonCache {
    path: PathBuf,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl JsonCache {
    /// Open (or create) the cache in `dir`.
    ///
    /// A corrupt cache file is discarded rather than treated as an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CreateDir`] if `dir` cannot be created, or
    /// [`CacheError::Io`] if an existing cache file cannot be read.
    pub fn open(dir: &Path, ttl: Duration) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir).map_err(|source| CacheError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(CACHE_FILE);
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "discarding corrupt cache file");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        tracing::debug!(path = %path.display(), "cache opened");
        Ok(Self {
            path,
            ttl,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read an unexpired value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serde`] if the stored value is not a `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        self.get_at(key, Timestamp::now())
    }

    /// Read a value as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serde`] if the stored value is not a `T`.
    pub fn get_at<T: DeserializeOwned>(
        &self,
        key: &str,
        now: Timestamp,
    ) -> Result<Option<T>, CacheError> {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        if self.is_expired(entry, now) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(entry.value.clone())?))
    }

    /// Store `value` under `key` and persist the cache.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the value cannot be serialized or the file
    /// cannot be written.
    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.put_at(key, value, Timestamp::now())
    }

    /// Store `value` stamped with `now`.
    ///
    /// # Errors
    ///
    /// See [`JsonCache::put`].
    pub fn put_at<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        now: Timestamp,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(value)?;
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            CacheEntry {
                stored_at_ms: now.as_millis(),
                value,
            },
        );
        self.persist(&entries)
    }

    /// Remove `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the file cannot be rewritten.
    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    /// Drop every entry expired as of `now`. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the file cannot be rewritten.
    pub fn clear_expired(&self, now: Timestamp) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        let dropped = before - entries.len();
        if dropped > 0 {
            self.persist(&entries)?;
        }
        Ok(dropped)
    }

    fn is_expired(&self, entry: &CacheEntry, now: Timestamp) -> bool {
        let age = now.as_millis().saturating_sub(entry.stored_at_ms);
        u128::from(age) > self.ttl.as_millis()
    }

    fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), CacheError> {
        let content = serde_json::to_string(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|source| CacheError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| CacheError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
