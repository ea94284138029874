//! Registry store capability.
//!
//! The registry needs three things from its backing store:
//! - hash-map-like per-key fields (identity records)
//! - values with a time-to-live (link codes)
//! - an atomic get-and-delete (single-use link-code resolution)
//!
//! Any key-value server offering these primitives can back the registry.
//! [`MemoryRegistryStore`] is the in-process implementation.

use crate::error::{RegistryError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Backing store for the registry
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Set a field of the hash stored at `key`, creating the hash if needed.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Read a field of the hash stored at `key`.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Store a plain value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Atomically read and delete a plain value.
    ///
    /// Across any number of concurrent callers at most one observes the value.
    async fn get_del(&self, key: &str) -> Result<Option<String>>;
}

/// Value slot in the in-memory store
#[derive(Debug, Clone)]
enum Slot {
    Hash(HashMap<String, String>),
    Value { value: String, expires_at: Instant },
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Slot::Value { expires_at, .. } if *expires_at <= now)
    }
}

/// In-memory registry store with lazy TTL expiry
///
/// Every operation touches exactly one shard-locked entry, so `get_del` is a
/// single `DashMap::remove_if` and inherits its atomicity.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    entries: DashMap<String, Slot>,
}

impl MemoryRegistryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired value, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            tracing::debug!("Purged {} expired registry values", purged);
        }
        purged
    }

    /// Number of live keys (expired values may still be counted until purged)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let now = Instant::now();
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::Hash(HashMap::new()));

        if slot.is_expired(now) {
            *slot = Slot::Hash(HashMap::new());
        }

        match &mut *slot {
            Slot::Hash(fields) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Slot::Value { .. } => Err(RegistryError::WrongType(key.to_string())),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.entries.get(key).as_deref() {
            None => Ok(None),
            Some(Slot::Hash(fields)) => Ok(fields.get(field).cloned()),
            Some(slot) if slot.is_expired(Instant::now()) => Ok(None),
            Some(Slot::Value { .. }) => Err(RegistryError::WrongType(key.to_string())),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let slot = Slot::Value {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_string(), slot);
        Ok(())
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>> {
        let removed = self
            .entries
            .remove_if(key, |_, slot| matches!(slot, Slot::Value { .. }));

        match removed {
            Some((_, Slot::Value { value, expires_at })) => {
                Ok((expires_at > Instant::now()).then_some(value))
            }
            Some((_, Slot::Hash(_))) => unreachable!("remove_if only removes values"),
            None if self.entries.contains_key(key) => {
                Err(RegistryError::WrongType(key.to_string()))
            }
            None => Ok(None),
        }
    }
}
