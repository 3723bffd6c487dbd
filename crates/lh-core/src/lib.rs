//! # lh-core
//!
//! Lease-based primary election for replicated storage nodes.
//!
//! This crate provides the [`Leaser`]/[`Lease`] contracts, a static leaser
//! for fixed topologies, a store-backed leaser with an in-memory store, node
//! configuration, and the background election loop that turns lease
//! outcomes into a published [`Role`].

pub mod config;
pub mod election;
pub mod leasing;

pub use config::{ElectionConfig, LeaserConfig, LeaserMode};
pub use election::{Backoff, Election, ElectionHandle, ElectionStats, Role};
pub use leasing::{
    Context, Lease, LeaseError, LeaseStore, Leaser, MemoryLeaseStore, PrimaryInfo, StaticLease,
    StaticLeaser, StoreLease, StoreLeaser, StoreLeaserConfig,
};
