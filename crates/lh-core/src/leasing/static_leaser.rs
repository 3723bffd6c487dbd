//! A leaser with a fixed primary chosen by configuration.
//!
//! Useful for single-node deployments and tests. The designated primary
//! always acquires and its lease never lapses; every other node always sees
//! the lease as held and reads the configured primary's identity.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tracing::debug;

use super::{Context, Lease, LeaseError, Leaser, PrimaryInfo};

/// Always returns a lease to a statically configured primary.
#[derive(Debug, Clone)]
pub struct StaticLeaser {
    is_primary: bool,
    hostname: String,
    advertise_url: String,
}

impl StaticLeaser {
    /// Creates a new static leaser.
    ///
    /// `hostname` and `advertise_url` identify the designated primary. When
    /// `is_primary` is true they are this node's own identity.
    pub fn new(
        is_primary: bool,
        hostname: impl Into<String>,
        advertise_url: impl Into<String>,
    ) -> Self {
        Self {
            is_primary,
            hostname: hostname.into(),
            advertise_url: advertise_url.into(),
        }
    }

    /// Returns `true` if this node is the designated primary.
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }
}

#[async_trait]
impl Leaser for StaticLeaser {
    fn advertise_url(&self) -> Option<&str> {
        self.is_primary.then_some(self.advertise_url.as_str())
    }

    /// Returns a lease if this node is the static primary, otherwise
    /// [`LeaseError::PrimaryExists`].
    async fn acquire(&self, _ctx: &Context) -> Result<Box<dyn Lease>, LeaseError> {
        if !self.is_primary {
            debug!(primary = %self.hostname, "Static primary holds the lease");
            return Err(LeaseError::PrimaryExists);
        }
        Ok(Box::new(StaticLease))
    }

    /// Returns the configured primary, or [`LeaseError::NoPrimary`] on the
    /// primary itself.
    async fn primary_info(&self, _ctx: &Context) -> Result<PrimaryInfo, LeaseError> {
        if self.is_primary {
            return Err(LeaseError::NoPrimary);
        }
        Ok(PrimaryInfo::new(&self.hostname, &self.advertise_url))
    }

    async fn close(&self) -> Result<(), LeaseError> {
        Ok(())
    }
}

/// A lease for a fixed primary. Never expires.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLease;

impl StaticLease {
    /// Year 3000, far enough out to never be reached.
    fn expires_at_fixed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(3000, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl Lease for StaticLease {
    /// The Unix epoch in UTC.
    fn renewed_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    fn ttl(&self) -> Duration {
        (Self::expires_at_fixed() - self.renewed_at())
            .to_std()
            .unwrap_or(Duration::MAX)
    }

    async fn renew(&self, _ctx: &Context) -> Result<(), LeaseError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), LeaseError> {
        Ok(())
    }
}
