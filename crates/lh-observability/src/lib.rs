//! # lh-observability
//!
//! Logging setup for leasehold nodes.
//!
//! `lh-core` only emits `tracing` events; binaries and tests call
//! [`init_logging`] or [`init_logging_with_config`] once at startup to
//! install a subscriber.

pub mod logging;

pub use logging::{
    init_logging, init_logging_with_config, try_init_logging_with_config, LoggingConfig,
};
