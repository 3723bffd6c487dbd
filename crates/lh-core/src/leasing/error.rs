//! Error types for primary leasing.
//!
//! Callers branch on the variant, never on the message. The three domain
//! outcomes (`PrimaryExists`, `NoPrimary`, `LeaseExpired`) are expected in
//! steady state; the context variants tell "lost the race" apart from
//! "could not reach the store in time".

use thiserror::Error;

/// Errors that can occur while acquiring, renewing, or discovering a primary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// Another node currently holds the primary lease.
    #[error("primary lease is already held")]
    PrimaryExists,

    /// No node currently holds the primary lease.
    #[error("no primary currently holds the lease")]
    NoPrimary,

    /// The lease expired or was removed from the store.
    #[error("lease expired")]
    LeaseExpired,

    /// The operation's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's context deadline passed.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// The leaser or lease was already closed.
    #[error("{what} is closed")]
    Closed {
        /// Which handle was closed ("leaser" or "lease").
        what: &'static str,
    },

    /// This node is not eligible to become primary.
    #[error("node '{hostname}' is not a primary candidate")]
    NotCandidate {
        /// The node that attempted acquisition.
        hostname: String,
    },

    /// The coordination store could not be reached.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
    },

    /// The leaser configuration is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// An unknown or internal error occurred.
    #[error("unknown error: {message}")]
    Unknown {
        /// Description of the error.
        message: String,
    },
}

impl LeaseError {
    /// Creates a `Closed` error for the named handle.
    pub fn closed(what: &'static str) -> Self {
        Self::Closed { what }
    }

    /// Creates a `NotCandidate` error.
    pub fn not_candidate(hostname: impl Into<String>) -> Self {
        Self::NotCandidate {
            hostname: hostname.into(),
        }
    }

    /// Creates a `Connection` error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a `Serialization` error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a `Config` error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an `Unknown` error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Returns `true` if acquisition lost to another holder.
    pub fn is_primary_exists(&self) -> bool {
        matches!(self, Self::PrimaryExists)
    }

    /// Returns `true` if no primary is currently known.
    pub fn is_no_primary(&self) -> bool {
        matches!(self, Self::NoPrimary)
    }

    /// Returns `true` if a held lease is gone and the holder must demote.
    pub fn is_lease_expired(&self) -> bool {
        matches!(self, Self::LeaseExpired)
    }

    /// Returns `true` for cancellation or deadline errors.
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Returns `true` for the three leasing outcomes callers branch on.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Self::PrimaryExists | Self::NoPrimary | Self::LeaseExpired
        )
    }

    /// Returns `true` if retrying the same call later may succeed.
    ///
    /// `LeaseExpired` is excluded: a lost lease needs a fresh acquisition,
    /// not another renewal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoPrimary
                | Self::PrimaryExists
                | Self::Cancelled
                | Self::DeadlineExceeded
                | Self::Connection { .. }
        )
    }
}

impl From<serde_json::Error> for LeaseError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
