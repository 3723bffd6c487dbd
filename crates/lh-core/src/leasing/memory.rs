//! In-memory implementation of the [`LeaseStore`] contract.
//!
//! `MemoryLeaseStore` keeps every key in a shared map and judges expiry with
//! an injected [`Clock`]. Clones share state, so several leasers built on
//! clones behave like separate nodes talking to one coordination service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::types::add_duration;
use super::{Clock, LeaseError, LeaseGrant, LeaseStore, LeaseToken, StoredValue, SystemClock};

/// State for one key.
#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    token: LeaseToken,
    renewed_at: DateTime<Utc>,
    ttl: Duration,
}

impl Entry {
    fn expires_at(&self) -> DateTime<Utc> {
        add_duration(self.renewed_at, self.ttl)
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    fn grant(&self) -> LeaseGrant {
        LeaseGrant {
            token: self.token,
            renewed_at: self.renewed_at,
            ttl: self.ttl,
        }
    }

    fn stored_value(&self) -> StoredValue {
        StoredValue {
            value: self.value.clone(),
            token: self.token,
            renewed_at: self.renewed_at,
            expires_at: self.expires_at(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, Entry>,
    /// Last fencing number issued per key. Survives release and expiry.
    fencing: HashMap<String, u64>,
}

/// An in-process coordination store.
///
/// # Example
///
/// ```rust
/// use lh_core::leasing::{LeaseStore, MemoryLeaseStore};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), lh_core::leasing::LeaseError> {
/// let store = MemoryLeaseStore::new();
/// let grant = store
///     .try_acquire("primary", b"node-a".to_vec(), Duration::from_secs(10))
///     .await?
///     .expect("key is free");
///
/// // A second acquisition fails while the first grant is live.
/// assert!(store
///     .try_acquire("primary", b"node-b".to_vec(), Duration::from_secs(10))
///     .await?
///     .is_none());
///
/// store.release("primary", &grant.token).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryLeaseStore {
    state: Arc<RwLock<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLeaseStore {
    /// Creates an empty store that uses the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store that judges expiry with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            clock,
        }
    }

    /// The clock this store judges expiry with.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Removes `key` regardless of owner, as an operator or another tool might.
    ///
    /// Returns `true` if a live or expired entry was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.state.write().await.entries.remove(key).is_some();
        if removed {
            debug!(key = %key, "Deleted lease key externally");
        }
        removed
    }

    /// Returns a snapshot of every live entry.
    pub async fn entries(&self) -> HashMap<String, StoredValue> {
        let now = self.clock.now();
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.stored_value()))
            .collect()
    }

    /// Removes every entry. Fencing counters are kept.
    pub async fn clear_all(&self) {
        self.state.write().await.entries.clear();
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<Option<LeaseGrant>, LeaseError> {
        let mut state = self.state.write().await;
        let now = self.clock.now();

        if let Some(entry) = state.entries.get(key) {
            if entry.is_live(now) {
                return Ok(None);
            }
            debug!(key = %key, fencing = entry.token.fencing, "Replacing expired lease");
        }

        let counter = state.fencing.entry(key.to_string()).or_insert(0);
        *counter += 1;
        let token = LeaseToken {
            session: Uuid::new_v4(),
            fencing: *counter,
        };
        let entry = Entry {
            value,
            token,
            renewed_at: now,
            ttl,
        };
        let grant = entry.grant();
        state.entries.insert(key.to_string(), entry);

        Ok(Some(grant))
    }

    async fn renew(&self, key: &str, token: &LeaseToken) -> Result<LeaseGrant, LeaseError> {
        let mut state = self.state.write().await;
        let now = self.clock.now();

        match state.entries.get_mut(key) {
            Some(entry) if entry.token == *token && entry.is_live(now) => {
                entry.renewed_at = now;
                return Ok(entry.grant());
            }
            Some(entry) if entry.token == *token => {
                debug!(key = %key, fencing = token.fencing, "Renewal found lease expired");
            }
            _ => return Err(LeaseError::LeaseExpired),
        }

        state.entries.remove(key);
        Err(LeaseError::LeaseExpired)
    }

    async fn read(&self, key: &str) -> Result<Option<StoredValue>, LeaseError> {
        let now = self.clock.now();
        let state = self.state.read().await;
        Ok(state
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(Entry::stored_value))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LeaseError> {
        let mut state = self.state.write().await;
        match state.entries.get(key) {
            Some(entry) if entry.token == *token => {
                state.entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
