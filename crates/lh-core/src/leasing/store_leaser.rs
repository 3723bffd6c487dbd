//! Leaser backed by a [`LeaseStore`].
//!
//! The primary's [`PrimaryInfo`] is stored as the value of one well-known
//! key. Acquiring the key makes a node primary; reading it tells replicas
//! where the primary is.
//!
//! # How it works
//!
//! - `acquire` calls [`LeaseStore::try_acquire`] with the node's JSON-encoded
//!   identity and fails with [`LeaseError::PrimaryExists`] if the key is live
//! - `primary_info` reads the key on every call; there is no local cache, so
//!   answers are exactly as fresh as the store
//! - `StoreLease::renew` refuses locally once its own expiry has passed and
//!   otherwise defers to the store, which is the only source of extensions
//! - `StoreLease::close` releases the key only if this lease still owns it

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::add_duration;
use super::{
    Clock, Context, Lease, LeaseError, LeaseGrant, LeaseStore, LeaseToken, Leaser, PrimaryInfo,
    SystemClock,
};

/// Key the primary lease is stored under unless configured otherwise.
pub const DEFAULT_PRIMARY_KEY: &str = "leasehold/primary";

/// Default validity window of a freshly acquired or renewed lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

/// How long `StoreLease::close` waits for the store before giving up.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity and lease settings for a [`StoreLeaser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLeaserConfig {
    /// Store key shared by every node in the cluster.
    pub key: String,
    /// This node's hostname.
    pub hostname: String,
    /// This node's advertise URL.
    pub advertise_url: String,
    /// TTL requested on acquisition.
    pub ttl: Duration,
    /// Whether this node may become primary.
    pub candidate: bool,
}

impl StoreLeaserConfig {
    /// Creates a candidate configuration with the default key and TTL.
    pub fn new(hostname: impl Into<String>, advertise_url: impl Into<String>) -> Self {
        Self {
            key: DEFAULT_PRIMARY_KEY.to_string(),
            hostname: hostname.into(),
            advertise_url: advertise_url.into(),
            ttl: DEFAULT_LEASE_TTL,
            candidate: true,
        }
    }

    /// Sets the store key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the lease TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets whether this node may become primary.
    pub fn with_candidate(mut self, candidate: bool) -> Self {
        self.candidate = candidate;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LeaseError> {
        if self.key.is_empty() {
            return Err(LeaseError::config("lease key cannot be empty"));
        }
        if self.hostname.is_empty() {
            return Err(LeaseError::config("hostname cannot be empty"));
        }
        if self.candidate && self.advertise_url.is_empty() {
            return Err(LeaseError::config(
                "advertise_url is required for a primary candidate",
            ));
        }
        if self.ttl.is_zero() {
            return Err(LeaseError::config("ttl must be greater than zero"));
        }
        Ok(())
    }
}

/// A leaser that coordinates through a [`LeaseStore`].
///
/// Cheap to share: wrap it in an `Arc` and call it from any task.
#[derive(Debug)]
pub struct StoreLeaser {
    store: Arc<dyn LeaseStore>,
    config: StoreLeaserConfig,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl StoreLeaser {
    /// Creates a leaser that judges local lease validity with the system clock.
    pub fn new(store: Arc<dyn LeaseStore>, config: StoreLeaserConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Creates a leaser that judges local lease validity with `clock`.
    ///
    /// Use the store's own clock where one is available so that local and
    /// store-side expiry agree.
    pub fn with_clock(
        store: Arc<dyn LeaseStore>,
        config: StoreLeaserConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the configuration for this leaser.
    pub fn config(&self) -> &StoreLeaserConfig {
        &self.config
    }

    /// The identity this node publishes when it becomes primary.
    pub fn own_info(&self) -> PrimaryInfo {
        PrimaryInfo::new(&self.config.hostname, &self.config.advertise_url)
    }

    fn ensure_open(&self) -> Result<(), LeaseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LeaseError::closed("leaser"));
        }
        Ok(())
    }
}

#[async_trait]
impl Leaser for StoreLeaser {
    fn advertise_url(&self) -> Option<&str> {
        self.config
            .candidate
            .then_some(self.config.advertise_url.as_str())
    }

    async fn acquire(&self, ctx: &Context) -> Result<Box<dyn Lease>, LeaseError> {
        self.ensure_open()?;
        if !self.config.candidate {
            return Err(LeaseError::not_candidate(&self.config.hostname));
        }

        let key = &self.config.key;
        let value = self.own_info().to_json()?;
        let grant = ctx
            .run(self.store.try_acquire(key, value, self.config.ttl))
            .await?;

        let Some(grant) = grant else {
            debug!(
                hostname = %self.config.hostname,
                key = %key,
                "Primary lease held by another node"
            );
            return Err(LeaseError::PrimaryExists);
        };

        // The grant may have landed as the context fired; give it back.
        if let Some(err) = ctx.err() {
            let release = Context::background().with_timeout(RELEASE_TIMEOUT);
            if let Err(e) = release.run(self.store.release(key, &grant.token)).await {
                warn!(key = %key, error = %e, "Failed to release lease after cancellation");
            }
            return Err(err);
        }

        info!(
            hostname = %self.config.hostname,
            key = %key,
            fencing = grant.token.fencing,
            expires_at = %grant.expires_at(),
            "Acquired primary lease"
        );

        Ok(Box::new(StoreLease::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            key.clone(),
            grant,
        )))
    }

    async fn primary_info(&self, ctx: &Context) -> Result<PrimaryInfo, LeaseError> {
        self.ensure_open()?;

        match ctx.run(self.store.read(&self.config.key)).await? {
            Some(stored) => PrimaryInfo::from_json(&stored.value),
            None => Err(LeaseError::NoPrimary),
        }
    }

    async fn close(&self) -> Result<(), LeaseError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(hostname = %self.config.hostname, "Closed leaser");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct LeaseTiming {
    renewed_at: DateTime<Utc>,
    ttl: Duration,
    lost: bool,
    closed: bool,
}

/// A lease issued by a [`StoreLeaser`].
#[derive(Debug)]
pub struct StoreLease {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    key: String,
    token: LeaseToken,
    timing: RwLock<LeaseTiming>,
}

impl StoreLease {
    fn new(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        key: String,
        grant: LeaseGrant,
    ) -> Self {
        Self {
            store,
            clock,
            key,
            token: grant.token,
            timing: RwLock::new(LeaseTiming {
                renewed_at: grant.renewed_at,
                ttl: grant.ttl,
                lost: false,
                closed: false,
            }),
        }
    }

    /// The store token identifying this grant.
    pub fn token(&self) -> LeaseToken {
        self.token
    }

    /// The store key this lease holds.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `true` once a renewal has found the lease gone.
    pub fn is_lost(&self) -> bool {
        self.timing.read().lost
    }

    /// Returns `true` once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.timing.read().closed
    }

    fn mark_lost(&self) {
        self.timing.write().lost = true;
    }
}

#[async_trait]
impl Lease for StoreLease {
    fn renewed_at(&self) -> DateTime<Utc> {
        self.timing.read().renewed_at
    }

    fn ttl(&self) -> Duration {
        self.timing.read().ttl
    }

    async fn renew(&self, ctx: &Context) -> Result<(), LeaseError> {
        let timing = *self.timing.read();
        if timing.closed {
            return Err(LeaseError::closed("lease"));
        }
        if timing.lost {
            return Err(LeaseError::LeaseExpired);
        }
        if self.clock.now() >= add_duration(timing.renewed_at, timing.ttl) {
            self.mark_lost();
            warn!(key = %self.key, fencing = self.token.fencing, "Lease expired before renewal");
            return Err(LeaseError::LeaseExpired);
        }

        match ctx.run(self.store.renew(&self.key, &self.token)).await {
            Ok(grant) => {
                let mut timing = self.timing.write();
                if grant.expires_at() > add_duration(timing.renewed_at, timing.ttl) {
                    timing.renewed_at = grant.renewed_at;
                    timing.ttl = grant.ttl;
                }
                debug!(
                    key = %self.key,
                    fencing = self.token.fencing,
                    expires_at = %grant.expires_at(),
                    "Renewed lease"
                );
                Ok(())
            }
            Err(LeaseError::LeaseExpired) => {
                self.mark_lost();
                warn!(key = %self.key, fencing = self.token.fencing, "Lease lost in store");
                Err(LeaseError::LeaseExpired)
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<(), LeaseError> {
        let already_closed = std::mem::replace(&mut self.timing.write().closed, true);
        if already_closed {
            return Ok(());
        }

        let ctx = Context::background().with_timeout(RELEASE_TIMEOUT);
        let released = ctx
            .run(self.store.release(&self.key, &self.token))
            .await?;

        if released {
            info!(key = %self.key, fencing = self.token.fencing, "Released primary lease");
        } else {
            debug!(key = %self.key, fencing = self.token.fencing, "Lease already gone at close");
        }
        Ok(())
    }
}
