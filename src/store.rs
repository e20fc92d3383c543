//! Persistence seams: key-value cache and cost-record storage.
//!
//! The crate never assumes a concrete backend. Fallback caching goes through
//! [`KeyValueStore`] and cost accounting through [`CostRecordStore`]; both are
//! async traits with in-memory implementations for tests and single-process
//! deployments.

use crate::clock::{Clock, MonotonicClock};
use crate::cost::CostRecord;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Errors surfaced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Opaque key-value cache with per-entry TTL.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Fetch a value; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;
    /// Remove a value; removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Filter for querying stored cost records. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct CostQuery {
    pub user_id: Option<String>,
    pub service: Option<String>,
    /// Inclusive lower bound, epoch millis.
    pub since_millis: Option<u64>,
    /// Exclusive upper bound, epoch millis.
    pub until_millis: Option<u64>,
}

impl CostQuery {
    fn matches(&self, record: &CostRecord) -> bool {
        if let Some(user) = &self.user_id {
            if record.user_id.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if let Some(service) = &self.service {
            if &record.service != service {
                return false;
            }
        }
        if let Some(since) = self.since_millis {
            if record.timestamp_millis < since {
                return false;
            }
        }
        if let Some(until) = self.until_millis {
            if record.timestamp_millis >= until {
                return false;
            }
        }
        true
    }
}

/// Append-only store of billable-call records.
#[async_trait]
pub trait CostRecordStore: Send + Sync + std::fmt::Debug {
    async fn insert(&self, record: CostRecord) -> Result<(), StoreError>;
    /// Records matching `filter`, oldest first.
    async fn query(&self, filter: &CostQuery) -> Result<Vec<CostRecord>, StoreError>;
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    /// Clock millis past which the entry is dead; `None` means no expiry.
    expires_at_millis: Option<u64>,
}

/// In-memory [`KeyValueStore`]. Expired entries are evicted lazily on read.
#[derive(Debug)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock: Arc::new(MonotonicClock::default()) }
    }

    /// Override the clock (deterministic TTL tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .expect("kv store poisoned")
            .values()
            .filter(|e| match e.expires_at_millis {
                Some(at) => now < at,
                None => true,
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().expect("kv store poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at_millis.is_some_and(|at| now >= at) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at_millis = ttl.map(|ttl| {
            let ttl_millis: u64 = ttl.as_millis().try_into().unwrap_or(u64::MAX);
            self.clock.now_millis().saturating_add(ttl_millis)
        });
        self.entries
            .lock()
            .expect("kv store poisoned")
            .insert(key.to_string(), CacheEntry { value, expires_at_millis });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().expect("kv store poisoned").remove(key);
        Ok(())
    }
}

/// In-memory [`CostRecordStore`], insertion-ordered.
#[derive(Debug, Default)]
pub struct MemoryCostRecordStore {
    records: Mutex<Vec<CostRecord>>,
}

impl MemoryCostRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("cost store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CostRecordStore for MemoryCostRecordStore {
    async fn insert(&self, record: CostRecord) -> Result<(), StoreError> {
        self.records.lock().expect("cost store poisoned").push(record);
        Ok(())
    }

    async fn query(&self, filter: &CostQuery) -> Result<Vec<CostRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .expect("cost store poisoned")
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}
