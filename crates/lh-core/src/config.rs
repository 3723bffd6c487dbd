//! Node configuration for primary election.
//!
//! A node picks its leaser once at startup from a [`LeaserConfig`]:
//!
//! ```yaml
//! hostname: node-a
//! advertise_url: http://node-a:20202
//! ttl: 10s
//! mode:
//!   type: store
//!   key: leasehold/primary
//!   candidate: true
//! election:
//!   renew_interval: 3s
//!   discovery_interval: 1s
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::leasing::{
    LeaseError, LeaseStore, Leaser, StaticLeaser, StoreLeaser, StoreLeaserConfig,
    DEFAULT_LEASE_TTL, DEFAULT_PRIMARY_KEY,
};

/// How a node decides who is primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaserMode {
    /// A fixed primary, no coordination service.
    Static {
        /// Whether this node is the designated primary.
        is_primary: bool,
        /// Hostname of the designated primary. Required on replicas.
        #[serde(default)]
        primary_hostname: Option<String>,
        /// Advertise URL of the designated primary. Required on replicas.
        #[serde(default)]
        primary_advertise_url: Option<String>,
    },
    /// Leases held in a coordination store.
    Store {
        /// Store key shared by the cluster.
        #[serde(default = "default_key")]
        key: String,
        /// Whether this node may become primary.
        #[serde(default = "default_true")]
        candidate: bool,
    },
}

fn default_key() -> String {
    DEFAULT_PRIMARY_KEY.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LeaserMode {
    fn default() -> Self {
        Self::Store {
            key: default_key(),
            candidate: true,
        }
    }
}

/// Timing policy for the election loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// How often the primary renews its lease. At most TTL/2.
    #[serde(with = "humantime_serde")]
    pub renew_interval: Duration,

    /// Upper bound on a single acquisition attempt.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// How often a replica polls for the primary and retries acquisition.
    #[serde(with = "humantime_serde")]
    pub discovery_interval: Duration,

    /// First retry delay after `NoPrimary` or a store error.
    #[serde(with = "humantime_serde")]
    pub backoff_initial: Duration,

    /// Cap on the retry delay.
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            renew_interval: Duration::from_secs(3),
            acquire_timeout: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(1),
            backoff_initial: Duration::from_millis(250),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl ElectionConfig {
    /// Sets the renewal interval.
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    /// Sets the per-attempt acquisition timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the replica discovery interval.
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Sets the retry backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Validates the periods the election loop runs on, independent of any
    /// lease TTL. Every period must be non-zero.
    pub fn validate_periods(&self) -> Result<(), LeaseError> {
        if self.renew_interval.is_zero() {
            return Err(LeaseError::config("renew_interval must be greater than zero"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(LeaseError::config("acquire_timeout must be greater than zero"));
        }
        if self.discovery_interval.is_zero() {
            return Err(LeaseError::config(
                "discovery_interval must be greater than zero",
            ));
        }
        if self.backoff_initial.is_zero() || self.backoff_initial > self.backoff_max {
            return Err(LeaseError::config(format!(
                "backoff_initial ({:?}) must be non-zero and at most backoff_max ({:?})",
                self.backoff_initial, self.backoff_max
            )));
        }
        Ok(())
    }

    /// Validates the timing against the lease TTL.
    ///
    /// The renewal interval must leave room for at least one missed renewal
    /// before the lease lapses, so it may be no more than half the TTL.
    pub fn validate(&self, ttl: Duration) -> Result<(), LeaseError> {
        self.validate_periods()?;
        if self.renew_interval > ttl / 2 {
            return Err(LeaseError::config(format!(
                "renew_interval ({:?}) must be at most ttl/2 ({:?})",
                self.renew_interval,
                ttl / 2
            )));
        }
        Ok(())
    }
}

/// Configuration for a node's leaser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaserConfig {
    /// This node's identifier. Defaults to the machine hostname.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Address other nodes use to reach this node.
    #[serde(default)]
    pub advertise_url: String,

    /// Leaser selection.
    #[serde(default)]
    pub mode: LeaserMode,

    /// Lease TTL in store mode.
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Election loop timing.
    #[serde(default)]
    pub election: ElectionConfig,
}

fn default_ttl() -> Duration {
    DEFAULT_LEASE_TTL
}

impl LeaserConfig {
    /// Creates a store-mode configuration for a primary candidate.
    pub fn new(hostname: impl Into<String>, advertise_url: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            advertise_url: advertise_url.into(),
            mode: LeaserMode::default(),
            ttl: default_ttl(),
            election: ElectionConfig::default(),
        }
    }

    /// Sets the leaser mode.
    pub fn with_mode(mut self, mode: LeaserMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the lease TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the election timing.
    pub fn with_election(mut self, election: ElectionConfig) -> Self {
        self.election = election;
        self
    }

    /// Parses a configuration from YAML.
    pub fn from_yaml_str(contents: &str) -> Result<Self, LeaseError> {
        serde_yaml::from_str(contents)
            .map_err(|e| LeaseError::config(format!("failed to parse config: {e}")))
    }

    /// Loads a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, LeaseError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LeaseError::config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LeaseError> {
        if self.hostname.is_empty() {
            return Err(LeaseError::config("hostname cannot be empty"));
        }
        self.election.validate_periods()?;

        match &self.mode {
            LeaserMode::Static {
                is_primary: true, ..
            } => {
                if self.advertise_url.is_empty() {
                    return Err(LeaseError::config(
                        "advertise_url is required on the static primary",
                    ));
                }
            }
            LeaserMode::Static {
                is_primary: false,
                primary_hostname,
                primary_advertise_url,
            } => {
                let missing = |value: &Option<String>| value.as_deref().unwrap_or("").is_empty();
                if missing(primary_hostname) || missing(primary_advertise_url) {
                    return Err(LeaseError::config(
                        "primary_hostname and primary_advertise_url are required on static replicas",
                    ));
                }
            }
            LeaserMode::Store { .. } => {
                self.store_config().validate()?;
                self.election.validate(self.ttl)?;
            }
        }

        Ok(())
    }

    fn store_config(&self) -> StoreLeaserConfig {
        let (key, candidate) = match &self.mode {
            LeaserMode::Store { key, candidate } => (key.clone(), *candidate),
            LeaserMode::Static { .. } => (default_key(), false),
        };
        StoreLeaserConfig::new(&self.hostname, &self.advertise_url)
            .with_key(key)
            .with_ttl(self.ttl)
            .with_candidate(candidate)
    }

    /// Validates the configuration and builds the leaser it selects.
    ///
    /// Store mode needs `store`; static mode ignores it.
    pub fn build(&self, store: Option<Arc<dyn LeaseStore>>) -> Result<Arc<dyn Leaser>, LeaseError> {
        self.validate()?;

        match &self.mode {
            LeaserMode::Static {
                is_primary: true, ..
            } => Ok(Arc::new(StaticLeaser::new(
                true,
                &self.hostname,
                &self.advertise_url,
            ))),
            LeaserMode::Static {
                is_primary: false,
                primary_hostname,
                primary_advertise_url,
            } => Ok(Arc::new(StaticLeaser::new(
                false,
                primary_hostname.clone().unwrap_or_default(),
                primary_advertise_url.clone().unwrap_or_default(),
            ))),
            LeaserMode::Store { .. } => {
                let store = store.ok_or_else(|| {
                    LeaseError::config("store mode requires a coordination store")
                })?;
                Ok(Arc::new(StoreLeaser::new(store, self.store_config())))
            }
        }
    }
}

/// Returns the machine hostname, or `"localhost"` if it cannot be read.
pub fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}
