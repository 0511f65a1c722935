//! A thread-safe in-memory cache for currently active flag configurations. [`FlagConfigCache`]
//! provides concurrent access for readers (flag evaluation) and writers (the sync cycle).
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::flag::FlagConfig;

/// Pluggable external store for flag configurations.
///
/// When supplied, the cache writes through on every mutation, so an application can persist flag
/// configurations across restarts (e.g. in Redis or on disk). Reads are always served from
/// memory.
pub trait FlagConfigStorage: Send + Sync {
    /// Load all stored flag configurations. Called once to warm the in-memory cache.
    fn load(&self) -> HashMap<String, FlagConfig>;
    /// Store one flag configuration.
    fn put(&self, flag: &FlagConfig);
    /// Remove the flag configuration for `key`.
    fn remove(&self, key: &str);
}

/// In-memory mapping from flag key to flag configuration.
///
/// Individual flag configurations are immutable and shared via `Arc`; readers receive a snapshot
/// unaffected by later writes. Cycle commits replace the map wholesale via
/// [`FlagConfigCache::replace_all`]; incremental `get`/`put`/`remove` support direct manipulation.
#[derive(Default)]
pub struct FlagConfigCache {
    flags: RwLock<HashMap<String, Arc<FlagConfig>>>,
    updated_at: RwLock<Option<DateTime<Utc>>>,
    storage: Option<Arc<dyn FlagConfigStorage>>,
}

impl FlagConfigCache {
    /// Create an empty cache.
    pub fn new() -> FlagConfigCache {
        FlagConfigCache::default()
    }

    /// Create a cache that writes through to `storage`, warmed with its stored contents.
    pub fn with_storage(storage: Arc<dyn FlagConfigStorage>) -> FlagConfigCache {
        let flags = storage
            .load()
            .into_iter()
            .map(|(key, flag)| (key, Arc::new(flag)))
            .collect();
        FlagConfigCache {
            flags: RwLock::new(flags),
            updated_at: RwLock::new(None),
            storage: Some(storage),
        }
    }

    /// Get the flag configuration for `key`.
    pub fn get(&self, key: &str) -> Option<Arc<FlagConfig>> {
        self.read().get(key).cloned()
    }

    /// Snapshot of all stored flag configurations.
    pub fn snapshot(&self) -> HashMap<String, Arc<FlagConfig>> {
        self.read().clone()
    }

    /// Keys of all stored flag configurations.
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Insert or replace one flag configuration.
    pub fn put(&self, flag: FlagConfig) {
        if let Some(storage) = &self.storage {
            storage.put(&flag);
        }
        self.write().insert(flag.key.clone(), Arc::new(flag));
    }

    /// Insert or replace multiple flag configurations.
    pub fn put_all(&self, flags: HashMap<String, FlagConfig>) {
        let mut stored = self.write();
        for (key, flag) in flags {
            if let Some(storage) = &self.storage {
                storage.put(&flag);
            }
            stored.insert(key, Arc::new(flag));
        }
    }

    /// Remove the flag configuration for `key`.
    pub fn remove(&self, key: &str) {
        if let Some(storage) = &self.storage {
            storage.remove(key);
        }
        self.write().remove(key);
    }

    /// Remove all flag configurations.
    pub fn clear(&self) {
        let mut stored = self.write();
        if let Some(storage) = &self.storage {
            for key in stored.keys() {
                storage.remove(key);
            }
        }
        stored.clear();
    }

    /// Replace the whole cache contents with `flags` (clear + put-all, as one commit). Flags
    /// absent from `flags` are deleted. Returns whether the resulting map differs from the
    /// previous one.
    pub fn replace_all(&self, flags: HashMap<String, FlagConfig>) -> bool {
        let mut stored = self.write();

        let changed = stored.len() != flags.len()
            || flags
                .iter()
                .any(|(key, flag)| stored.get(key).map(|existing| existing.as_ref()) != Some(flag));

        if let Some(storage) = &self.storage {
            for key in stored.keys() {
                if !flags.contains_key(key) {
                    storage.remove(key);
                }
            }
            for flag in flags.values() {
                storage.put(flag);
            }
        }

        *stored = flags
            .into_iter()
            .map(|(key, flag)| (key, Arc::new(flag)))
            .collect();
        *self
            .updated_at
            .write()
            .expect("thread holding flag cache lock should not panic") = Some(Utc::now());

        changed
    }

    /// When the cache last committed a full configuration, or `None` if no commit happened yet.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        *self
            .updated_at
            .read()
            .expect("thread holding flag cache lock should not panic")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<FlagConfig>>> {
        // Err() is possible only if the lock is poisoned (a writer panicked while holding it),
        // which should never happen.
        self.flags
            .read()
            .expect("thread holding flag cache lock should not panic")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<FlagConfig>>> {
        self.flags
            .write()
            .expect("thread holding flag cache lock should not panic")
    }
}
