//! Primary election through time-bounded leases.
//!
//! A node uses a [`Leaser`] to find out whether it is the single writable
//! primary or a read-only replica. Mutual exclusion itself is delegated to a
//! coordination store; this module defines the contracts layered on top of it.
//!
//! # Overview
//!
//! 1. At startup a node calls [`Leaser::acquire`]
//! 2. On success it holds a [`Lease`] and must [`Lease::renew`] it on a period
//!    strictly shorter than its TTL
//! 3. On [`LeaseError::PrimaryExists`] it runs as a replica and polls
//!    [`Leaser::primary_info`] to learn where to stream changes from
//! 4. A renewal that returns [`LeaseError::LeaseExpired`] means the node must
//!    demote immediately; only a fresh `acquire` can make it primary again
//!
//! # Example
//!
//! ```rust,no_run
//! use lh_core::leasing::{Context, Lease, LeaseError, Leaser, StaticLeaser};
//!
//! # async fn example() -> Result<(), LeaseError> {
//! let leaser = StaticLeaser::new(false, "a", "https://a:20202");
//! let ctx = Context::background();
//!
//! match leaser.acquire(&ctx).await {
//!     Ok(lease) => println!("primary until {}", lease.expires_at()),
//!     Err(LeaseError::PrimaryExists) => {
//!         let info = leaser.primary_info(&ctx).await?;
//!         println!("replicating from {}", info.advertise_url);
//!     }
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Implementations
//!
//! - [`StaticLeaser`]: a fixed primary chosen by configuration
//! - [`StoreLeaser`]: leases backed by any [`LeaseStore`], such as the
//!   in-process [`MemoryLeaseStore`]

mod clock;
mod context;
mod error;
mod memory;
mod static_leaser;
mod store;
mod store_leaser;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Context;
pub use error::LeaseError;
pub use memory::MemoryLeaseStore;
pub use static_leaser::{StaticLease, StaticLeaser};
pub use store::{LeaseStore, StoredValue};
pub use store_leaser::{
    StoreLease, StoreLeaser, StoreLeaserConfig, DEFAULT_LEASE_TTL, DEFAULT_PRIMARY_KEY,
};
pub use types::{LeaseGrant, LeaseToken, PrimaryInfo};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::time::Duration;

/// Gateway to the coordination service for one node.
///
/// A leaser is bound to a single node identity at construction and may be
/// shared across tasks: a renewal loop, a discovery poller, and a shutdown
/// handler can all call it concurrently.
///
/// ```text
///               acquire() ok
///   ┌─────────┐ ───────────────▶ ┌─────────┐  renew() ok
///   │ Replica │                  │ Primary │ ◀──────────┐
///   └─────────┘ ◀─────────────── └─────────┘ ───────────┘
///     │    ▲     renew() → LeaseExpired
///     │    │     or close()
///     └────┘
///   primary_info()
/// ```
#[async_trait]
pub trait Leaser: Debug + Send + Sync + 'static {
    /// Returns this node's advertise URL if it is primary-eligible by
    /// construction, otherwise `None`.
    ///
    /// This is a local hint. It says nothing about whether a lease is held.
    fn advertise_url(&self) -> Option<&str>;

    /// Attempts to become the primary.
    ///
    /// Fails fast with [`LeaseError::PrimaryExists`] when another node holds
    /// a live lease. If `ctx` fires first, returns a context error and leaves
    /// no grant behind.
    async fn acquire(&self, ctx: &Context) -> Result<Box<dyn Lease>, LeaseError>;

    /// Reads the published primary without attempting acquisition.
    ///
    /// Returns [`LeaseError::NoPrimary`] when no holder is known, whether the
    /// lease was never taken or expired without being replaced.
    async fn primary_info(&self, ctx: &Context) -> Result<PrimaryInfo, LeaseError>;

    /// Releases resources held by the leaser itself. Idempotent.
    async fn close(&self) -> Result<(), LeaseError>;
}

/// A live, time-bounded grant of primary status.
///
/// Valid if and only if `now < renewed_at() + ttl()`. An invalid lease never
/// grants primary status again, even if the object is still around.
#[async_trait]
pub trait Lease: Debug + Send + Sync + 'static {
    /// When the lease was acquired or last renewed.
    fn renewed_at(&self) -> DateTime<Utc>;

    /// Validity window measured from [`renewed_at`](Lease::renewed_at).
    fn ttl(&self) -> Duration;

    /// Extends the lease with the store's agreement.
    ///
    /// Returns [`LeaseError::LeaseExpired`] if the store already considers the
    /// lease gone. That is final for this lease: demote and acquire again.
    async fn renew(&self, ctx: &Context) -> Result<(), LeaseError>;

    /// Voluntarily releases the lease so another node can acquire it without
    /// waiting out the TTL. Best-effort and idempotent.
    async fn close(&self) -> Result<(), LeaseError>;

    /// The absolute instant the lease lapses.
    fn expires_at(&self) -> DateTime<Utc> {
        types::add_duration(self.renewed_at(), self.ttl())
    }

    /// Returns `true` if the lease is still valid at `now`.
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    /// Remaining validity at `now`, or `None` once expired.
    fn time_remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at() - now)
            .to_std()
            .ok()
            .filter(|remaining| !remaining.is_zero())
    }
}
