//! Background loop that keeps a node's role in sync with its leaser.
//!
//! [`Election::spawn`] drives the acquire / renew / discover cycle on a tokio
//! task and publishes the node's [`Role`] on a watch channel. Callers gate
//! writes on [`Role::Primary`] and point replication at the
//! [`PrimaryInfo`] carried by [`Role::Replica`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{default_hostname, ElectionConfig};
use crate::leasing::{Clock, Context, Lease, LeaseError, Leaser, PrimaryInfo, SystemClock};

/// The role a node currently plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Not yet elected, or just demoted.
    Candidate,
    /// Holds the lease until `expires_at` unless renewed.
    Primary {
        /// Expiry of the held lease as of the last renewal.
        expires_at: DateTime<Utc>,
    },
    /// Another node is primary, or none is known yet.
    Replica {
        /// The primary to replicate from, if one is published.
        primary: Option<PrimaryInfo>,
    },
}

impl Role {
    /// Returns `true` if the election currently publishes this node as primary.
    ///
    /// Use [`holds_lease_at`](Role::holds_lease_at) before accepting a write.
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary { .. })
    }

    /// Returns `true` if this node is primary and its lease is still valid at
    /// `now`, i.e. it may accept writes.
    pub fn holds_lease_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Self::Primary { expires_at } if now < *expires_at)
    }

    /// Returns the known primary when running as a replica.
    pub fn primary(&self) -> Option<&PrimaryInfo> {
        match self {
            Self::Replica { primary } => primary.as_ref(),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Primary { .. } => "primary",
            Self::Replica { .. } => "replica",
        }
    }
}

/// Counters describing the election loop's history.
#[derive(Debug, Clone, Default)]
pub struct ElectionStats {
    /// Number of times a lease was acquired.
    pub elections_won: u64,
    /// Number of times a held lease was lost.
    pub demotions: u64,
    /// Number of successful lease renewals.
    pub renewals_successful: u64,
    /// Number of failed lease renewals.
    pub renewals_failed: u64,
    /// Number of `primary_info` polls.
    pub discovery_polls: u64,
    /// When the current lease was acquired, if primary.
    pub leadership_acquired_at: Option<DateTime<Utc>>,
    /// Total seconds spent as primary across completed terms.
    pub total_leadership_seconds: u64,
}

/// Exponential retry delay, capped at a maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff that doubles from `initial` up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            attempt: 0,
        }
    }

    /// Returns the next delay and advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.initial.as_millis() as f64 * self.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.max.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(capped as u64)
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Cap on how far ahead the expiry timer is armed, for leases that never lapse.
const MAX_EXPIRY_HORIZON: Duration = Duration::from_secs(86400 * 365 * 30);

/// Configures and starts the election loop for one node.
#[derive(Debug)]
pub struct Election {
    leaser: Arc<dyn Leaser>,
    config: ElectionConfig,
    clock: Arc<dyn Clock>,
    hostname: String,
}

impl Election {
    /// Creates an election over `leaser`.
    ///
    /// Fails with [`LeaseError::Config`] if any period in `config` is zero.
    pub fn new(leaser: Arc<dyn Leaser>, config: ElectionConfig) -> Result<Self, LeaseError> {
        config.validate_periods()?;
        Ok(Self {
            leaser,
            config,
            clock: Arc::new(SystemClock),
            hostname: default_hostname(),
        })
    }

    /// Uses `clock` to judge local lease validity.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the hostname attached to log events.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Starts the loop on the current tokio runtime.
    pub fn spawn(self) -> ElectionHandle {
        let root = Context::background();
        let (role_tx, role_rx) = watch::channel(Role::Candidate);
        let stats = Arc::new(RwLock::new(ElectionStats::default()));
        let backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        let runner = Runner {
            leaser: self.leaser,
            config: self.config,
            clock: self.clock,
            hostname: self.hostname,
            root: root.clone(),
            role_tx,
            stats: Arc::clone(&stats),
            backoff,
            candidate: true,
        };

        ElectionHandle {
            root,
            role_rx,
            stats,
            task: Some(tokio::spawn(runner.run())),
        }
    }
}

/// Handle to a running election.
///
/// Dropping the handle stops the loop without waiting for it; call
/// [`shutdown`](ElectionHandle::shutdown) to release a held lease first.
#[derive(Debug)]
pub struct ElectionHandle {
    root: Context,
    role_rx: watch::Receiver<Role>,
    stats: Arc<RwLock<ElectionStats>>,
    task: Option<JoinHandle<Result<(), LeaseError>>>,
}

impl ElectionHandle {
    /// Returns the current role.
    pub fn role(&self) -> Role {
        self.role_rx.borrow().clone()
    }

    /// Returns a receiver notified on every role change.
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_rx.clone()
    }

    /// Returns a snapshot of the election counters.
    pub async fn stats(&self) -> ElectionStats {
        self.stats.read().await.clone()
    }

    /// Stops the loop, closes any held lease and waits for the task to exit.
    ///
    /// Returns the error from closing the lease, if any.
    pub async fn shutdown(mut self) -> Result<(), LeaseError> {
        self.root.cancel();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| LeaseError::unknown(format!("election task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for ElectionHandle {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

struct Runner {
    leaser: Arc<dyn Leaser>,
    config: ElectionConfig,
    clock: Arc<dyn Clock>,
    hostname: String,
    root: Context,
    role_tx: watch::Sender<Role>,
    stats: Arc<RwLock<ElectionStats>>,
    backoff: Backoff,
    candidate: bool,
}

impl Runner {
    async fn run(mut self) -> Result<(), LeaseError> {
        info!(
            hostname = %self.hostname,
            renew_interval_ms = self.config.renew_interval.as_millis() as u64,
            "Starting election"
        );

        let mut result = Ok(());
        while !self.root.is_cancelled() {
            if !self.candidate {
                let wait = self.discover().await;
                if !self.pause(wait).await {
                    break;
                }
                continue;
            }

            let attempt = self.root.with_timeout(self.config.acquire_timeout);
            match self.leaser.acquire(&attempt).await {
                Ok(lease) => {
                    self.backoff.reset();
                    if let Some(closed) = self.lead(Arc::from(lease)).await {
                        result = closed;
                        break;
                    }
                }
                Err(LeaseError::NotCandidate { .. }) => {
                    info!(hostname = %self.hostname, "Not a primary candidate, following only");
                    self.candidate = false;
                }
                Err(LeaseError::PrimaryExists) => {
                    let wait = self.discover().await;
                    if !self.pause(wait).await {
                        break;
                    }
                }
                Err(_) if self.root.is_cancelled() => break,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    if e.is_retryable() {
                        warn!(
                            hostname = %self.hostname,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Failed to acquire lease"
                        );
                    } else {
                        error!(
                            hostname = %self.hostname,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Acquire failed with a non-transient error"
                        );
                    }
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }

        self.publish(Role::Candidate);
        info!(hostname = %self.hostname, "Election stopped");
        result
    }

    /// Holds `lease` until it is lost or the election is cancelled.
    ///
    /// Returns `Some` with the close result on cancellation, `None` after a
    /// demotion. The node stops publishing `Primary` no later than the
    /// lease's expiry, even while a renewal is still in flight.
    async fn lead(&mut self, lease: Arc<dyn Lease>) -> Option<Result<(), LeaseError>> {
        let interval_period = self.config.renew_interval;
        {
            let mut stats = self.stats.write().await;
            stats.elections_won += 1;
            stats.leadership_acquired_at = Some(self.clock.now());
        }
        let mut expiry = self.expiry_instant(lease.as_ref());
        self.publish(Role::Primary {
            expires_at: lease.expires_at(),
        });

        let mut interval = tokio::time::interval_at(Instant::now() + interval_period, interval_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.root.done() => {
                    info!(hostname = %self.hostname, "Releasing primary lease on shutdown");
                    self.end_term().await;
                    self.publish(Role::Candidate);
                    let closed = lease.close().await;
                    if let Err(e) = &closed {
                        error!(hostname = %self.hostname, error = %e, "Failed to release lease");
                    }
                    return Some(closed);
                }
                _ = tokio::time::sleep_until(expiry) => {
                    warn!(hostname = %self.hostname, "Lease expired before it could be renewed");
                    break;
                }
                _ = interval.tick() => {}
            }

            let deadline = expiry.min(Instant::now() + interval_period);
            let ctx = self.root.with_deadline(deadline);
            match lease.renew(&ctx).await {
                Ok(()) => {
                    self.stats.write().await.renewals_successful += 1;
                    expiry = self.expiry_instant(lease.as_ref());
                    debug!(
                        hostname = %self.hostname,
                        expires_at = %lease.expires_at(),
                        "Lease renewed"
                    );
                    self.publish(Role::Primary {
                        expires_at: lease.expires_at(),
                    });
                }
                Err(_) if self.root.is_cancelled() => {}
                Err(e) if e.is_lease_expired() || matches!(e, LeaseError::Closed { .. }) => {
                    self.stats.write().await.renewals_failed += 1;
                    warn!(hostname = %self.hostname, error = %e, "Lost primary lease");
                    break;
                }
                Err(e) => {
                    self.stats.write().await.renewals_failed += 1;
                    if Instant::now() >= expiry || !lease.is_valid_at(self.clock.now()) {
                        warn!(
                            hostname = %self.hostname,
                            error = %e,
                            "Lease expired locally while renewal was failing"
                        );
                        break;
                    }
                    error!(hostname = %self.hostname, error = %e, "Failed to renew lease");
                }
            }
        }

        self.stats.write().await.demotions += 1;
        self.end_term().await;
        self.publish(Role::Candidate);
        if let Err(e) = lease.close().await {
            debug!(hostname = %self.hostname, error = %e, "Failed to close lost lease");
        }
        None
    }

    /// The runtime instant at which `lease` lapses by this node's clock.
    fn expiry_instant(&self, lease: &dyn Lease) -> Instant {
        let remaining = lease
            .time_remaining_at(self.clock.now())
            .unwrap_or(Duration::ZERO);
        Instant::now() + remaining.min(MAX_EXPIRY_HORIZON)
    }

    /// Polls the published primary once and returns how long to wait before
    /// the next cycle.
    async fn discover(&mut self) -> Duration {
        self.stats.write().await.discovery_polls += 1;

        let ctx = self.root.with_timeout(self.config.acquire_timeout);
        match self.leaser.primary_info(&ctx).await {
            Ok(info) => {
                self.backoff.reset();
                self.publish(Role::Replica {
                    primary: Some(info),
                });
                self.config.discovery_interval
            }
            Err(LeaseError::NoPrimary) => {
                self.publish(Role::Replica { primary: None });
                let delay = self.backoff.next_delay();
                debug!(
                    hostname = %self.hostname,
                    retry_in_ms = delay.as_millis() as u64,
                    "No primary published"
                );
                delay
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                if !self.root.is_cancelled() {
                    warn!(hostname = %self.hostname, error = %e, "Failed to read primary");
                }
                delay
            }
        }
    }

    /// Sleeps for `wait`. Returns `false` if the election was cancelled.
    async fn pause(&self, wait: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.root.done() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    async fn end_term(&self) {
        let now = self.clock.now();
        let mut stats = self.stats.write().await;
        if let Some(acquired_at) = stats.leadership_acquired_at.take() {
            let held = (now - acquired_at).num_seconds().max(0) as u64;
            stats.total_leadership_seconds += held;
        }
    }

    fn publish(&self, role: Role) {
        let previous = self.role_tx.send_replace(role.clone());
        if previous == role {
            return;
        }

        if previous.name() != role.name() || previous.primary() != role.primary() {
            info!(
                hostname = %self.hostname,
                from = previous.name(),
                to = role.name(),
                primary = role.primary().map(|p| p.hostname.as_str()),
                "Role changed"
            );
        }
    }
}
