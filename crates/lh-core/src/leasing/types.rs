//! Types shared by every leaser implementation.
//!
//! - `PrimaryInfo`: identity of the current primary, as stored in the lease value
//! - `LeaseToken`: store-issued identity of a single grant
//! - `LeaseGrant`: the timing a store reports on acquisition or renewal

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::LeaseError;

/// Identity of the current primary.
///
/// This is the JSON object stored alongside the primary lease. Field names are
/// part of the wire format shared by independently deployed nodes; unknown
/// fields are ignored on read so newer writers remain readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryInfo {
    /// Opaque node identifier, unique per cluster member.
    pub hostname: String,

    /// Address replicas dial to stream changes from the primary.
    #[serde(rename = "advertise-url")]
    pub advertise_url: String,
}

impl PrimaryInfo {
    /// Creates a new `PrimaryInfo`.
    pub fn new(hostname: impl Into<String>, advertise_url: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            advertise_url: advertise_url.into(),
        }
    }

    /// Encodes the info as the JSON document stored in the lease value.
    pub fn to_json(&self) -> Result<Vec<u8>, LeaseError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes the info from a stored lease value.
    pub fn from_json(bytes: &[u8]) -> Result<Self, LeaseError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Identity of one grant issued by a [`LeaseStore`](super::LeaseStore).
///
/// `fencing` increases every time the key changes hands, so a holder whose
/// grant was replaced can never renew or release its successor's grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken {
    /// Session identifier issued on acquisition.
    pub session: Uuid,
    /// Per-key fencing number, monotonically increasing across holders.
    pub fencing: u64,
}

/// Timing of a grant, as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Token identifying the grant.
    pub token: LeaseToken,
    /// When the store last acquired or renewed the grant.
    pub renewed_at: DateTime<Utc>,
    /// Validity window from `renewed_at`.
    pub ttl: Duration,
}

impl LeaseGrant {
    /// The absolute instant at which the grant lapses.
    pub fn expires_at(&self) -> DateTime<Utc> {
        add_duration(self.renewed_at, self.ttl)
    }
}

/// Adds a std `Duration` to a timestamp, saturating at the maximum instant.
pub(crate) fn add_duration(at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
