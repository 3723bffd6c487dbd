//! Contract for the external coordination store.
//!
//! A store provides four capabilities keyed by a cluster-wide name:
//!
//! 1. atomic "acquire if absent, else fail" ([`LeaseStore::try_acquire`])
//! 2. a renewable TTL on the key ([`LeaseStore::renew`])
//! 3. an opaque value stored alongside the key ([`LeaseStore::read`])
//! 4. observable deletion and expiry (`read` returns `None`, `renew` fails
//!    with [`LeaseError::LeaseExpired`])
//!
//! Expiry is judged by the store's own clock. Implementations must not retry
//! internally; callers bound each call with a [`Context`](super::Context).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::time::Duration;

use super::{LeaseError, LeaseGrant, LeaseToken};

/// The value currently stored under a held key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    /// Opaque payload written by the holder.
    pub value: Vec<u8>,
    /// Token of the grant that owns the key.
    pub token: LeaseToken,
    /// When the store last acquired or renewed the grant.
    pub renewed_at: DateTime<Utc>,
    /// When the grant lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

/// A coordination service offering exclusive, TTL-bounded keys.
#[async_trait]
pub trait LeaseStore: Debug + Send + Sync + 'static {
    /// Atomically takes `key` if it is absent or expired.
    ///
    /// Returns `Ok(None)` if another grant is live. A successful call stores
    /// `value` and issues a fresh token whose fencing number is higher than
    /// any previous token for `key`.
    async fn try_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<Option<LeaseGrant>, LeaseError>;

    /// Restarts the TTL of the grant identified by `token`.
    ///
    /// Returns [`LeaseError::LeaseExpired`] if the grant expired, was
    /// deleted, or was replaced. An expired grant is never revived.
    async fn renew(&self, key: &str, token: &LeaseToken) -> Result<LeaseGrant, LeaseError>;

    /// Reads the live value under `key`, or `None` if absent or expired.
    async fn read(&self, key: &str) -> Result<Option<StoredValue>, LeaseError>;

    /// Deletes `key` if `token` still owns it.
    ///
    /// Returns `Ok(false)` if the grant was already gone or owned by another
    /// token; that is not an error.
    async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LeaseError>;
}
