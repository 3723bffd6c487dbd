//! Integration tests for primary election across multiple nodes.
//!
//! These tests simulate a cluster of nodes sharing one coordination store,
//! including:
//! - Mutual exclusion (only one node becomes primary)
//! - Replica discovery of the primary's identity
//! - Failover when the primary releases its lease
//! - Failover when the primary's lease expires
//! - Fixed-topology clusters using static leasers
//! - The background election loop handing over primary status
//!
//! # Running these tests
//!
//! ```bash
//! cargo test --package lh-core --test multi_node_integration_tests
//! ```
//!
//! These tests use the in-memory store and do not require external services.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::Instant;

use lh_core::config::{ElectionConfig, LeaserConfig, LeaserMode};
use lh_core::election::{Election, ElectionHandle, Role};
use lh_core::leasing::{
    Clock, Context, Lease, LeaseError, LeaseGrant, LeaseStore, LeaseToken, Leaser, ManualClock,
    MemoryLeaseStore, PrimaryInfo, StaticLeaser, StoreLeaser, StoreLeaserConfig, StoredValue,
    DEFAULT_PRIMARY_KEY,
};
use lh_observability::LoggingConfig;

// ============================================================================
// Test Harness: Simulated Cluster
// ============================================================================

/// A simulated node with its own leaser over the shared store.
struct NodeContext {
    hostname: String,
    leaser: Arc<StoreLeaser>,
}

/// Test harness for simulating a cluster of nodes.
struct ClusterHarness {
    /// Shared coordination store.
    store: MemoryLeaseStore,
    /// Clock the store and every leaser judge expiry by.
    clock: Arc<ManualClock>,
    /// Lease TTL used by every node.
    ttl: Duration,
    /// Created nodes.
    nodes: Vec<NodeContext>,
}

impl ClusterHarness {
    fn new(ttl: Duration) -> Self {
        init_logging();
        let clock = Arc::new(ManualClock::new());
        let store = MemoryLeaseStore::with_clock(clock.clone());

        Self {
            store,
            clock,
            ttl,
            nodes: Vec::new(),
        }
    }

    fn leaser_for(&self, hostname: &str, candidate: bool) -> Arc<StoreLeaser> {
        let config = StoreLeaserConfig::new(hostname, advertise_url(hostname))
            .with_ttl(self.ttl)
            .with_candidate(candidate);

        Arc::new(StoreLeaser::with_clock(
            Arc::new(self.store.clone()),
            config,
            self.clock.clone(),
        ))
    }

    fn create_node(&mut self, hostname: &str) -> Arc<StoreLeaser> {
        let leaser = self.leaser_for(hostname, true);
        self.nodes.push(NodeContext {
            hostname: hostname.to_string(),
            leaser: Arc::clone(&leaser),
        });
        leaser
    }

    fn node(&self, hostname: &str) -> Arc<StoreLeaser> {
        self.nodes
            .iter()
            .find(|n| n.hostname == hostname)
            .map(|n| Arc::clone(&n.leaser))
            .expect("node should exist")
    }

    async fn fencing(&self) -> Option<u64> {
        self.store
            .read(DEFAULT_PRIMARY_KEY)
            .await
            .unwrap()
            .map(|stored| stored.token.fencing)
    }
}

/// A clock that follows the runtime's (possibly paused) time.
#[derive(Debug)]
struct RuntimeClock {
    base: DateTime<Utc>,
    start: Instant,
}

impl RuntimeClock {
    fn new() -> Self {
        Self {
            base: DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_000),
            start: Instant::now(),
        }
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap()
    }
}

/// A store whose renewals never complete, as when the primary is cut off
/// from the coordination service.
#[derive(Debug)]
struct StalledRenewStore {
    inner: MemoryLeaseStore,
}

#[async_trait]
impl LeaseStore for StalledRenewStore {
    async fn try_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<Option<LeaseGrant>, LeaseError> {
        self.inner.try_acquire(key, value, ttl).await
    }

    async fn renew(&self, _key: &str, _token: &LeaseToken) -> Result<LeaseGrant, LeaseError> {
        std::future::pending().await
    }

    async fn read(&self, key: &str) -> Result<Option<StoredValue>, LeaseError> {
        self.inner.read(key).await
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LeaseError> {
        self.inner.release(key, token).await
    }
}

fn init_logging() {
    // Several tests share the process; only the first install wins.
    let _ = lh_observability::try_init_logging_with_config(LoggingConfig::development());
}

fn advertise_url(hostname: &str) -> String {
    format!("http://{hostname}:20202")
}

fn fast_election() -> ElectionConfig {
    ElectionConfig::default()
        .with_renew_interval(Duration::from_secs(1))
        .with_discovery_interval(Duration::from_millis(500))
        .with_backoff(Duration::from_millis(100), Duration::from_secs(1))
}

async fn wait_for_role(handle: &ElectionHandle, f: impl FnMut(&Role) -> bool) -> Role {
    let mut rx = handle.subscribe();
    let role = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(f))
        .await
        .expect("timed out waiting for role")
        .expect("election stopped");
    role.clone()
}

// ============================================================================
// TEST: Mutual Exclusion
// ============================================================================

/// Tests that only one node can become primary.
#[tokio::test]
async fn test_only_one_primary() {
    let mut harness = ClusterHarness::new(Duration::from_secs(10));

    let mut tasks = JoinSet::new();
    for i in 0..5 {
        let leaser = harness.create_node(&format!("node-{i}"));
        tasks.spawn(async move { leaser.acquire(&Context::background()).await });
    }

    let mut leases = Vec::new();
    let mut replicas = 0;
    while let Some(result) = tasks.join_next().await {
        match result.expect("task should complete") {
            Ok(lease) => leases.push(lease),
            Err(LeaseError::PrimaryExists) => replicas += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(leases.len(), 1, "exactly one node should become primary");
    assert_eq!(replicas, 4);
    assert_eq!(harness.fencing().await, Some(1));
}

/// Tests that every replica reads the same primary.
#[tokio::test]
async fn test_replicas_agree_on_primary() {
    let mut harness = ClusterHarness::new(Duration::from_secs(10));
    let primary = harness.create_node("primary");
    for i in 0..3 {
        harness.create_node(&format!("replica-{i}"));
    }

    let ctx = Context::background();
    let _lease = primary.acquire(&ctx).await.unwrap();

    for i in 0..3 {
        let replica = harness.node(&format!("replica-{i}"));
        assert_eq!(replica.acquire(&ctx).await.unwrap_err(), LeaseError::PrimaryExists);
        assert_eq!(
            replica.primary_info(&ctx).await.unwrap(),
            PrimaryInfo::new("primary", advertise_url("primary"))
        );
    }
}

// ============================================================================
// TEST: Failover
// ============================================================================

/// Tests that a replica takes over once the primary closes its lease.
#[tokio::test]
async fn test_failover_on_close() {
    let mut harness = ClusterHarness::new(Duration::from_secs(10));
    let a = harness.create_node("a");
    let b = harness.create_node("b");
    let ctx = Context::background();

    let lease_a = a.acquire(&ctx).await.unwrap();
    assert!(b.acquire(&ctx).await.unwrap_err().is_primary_exists());

    lease_a.close().await.unwrap();
    assert!(b.primary_info(&ctx).await.unwrap_err().is_no_primary());

    let _lease_b = b.acquire(&ctx).await.unwrap();
    assert_eq!(harness.fencing().await, Some(2));
    assert_eq!(a.primary_info(&ctx).await.unwrap().hostname, "b");

    // The closed lease can never be renewed back into validity.
    assert!(lease_a.renew(&ctx).await.is_err());
}

/// Tests that an expired primary is replaced and its stale lease is fenced off.
#[tokio::test]
async fn test_failover_on_expiry() {
    let mut harness = ClusterHarness::new(Duration::from_secs(10));
    let a = harness.create_node("a");
    let b = harness.create_node("b");
    let ctx = Context::background();

    let lease_a = a.acquire(&ctx).await.unwrap();
    harness.clock.advance(Duration::from_secs(5));
    lease_a.renew(&ctx).await.unwrap();

    // Renewal moved the expiry out; b still cannot acquire.
    harness.clock.advance(Duration::from_secs(8));
    assert!(lease_a.is_valid_at(harness.clock.now()));
    assert!(b.acquire(&ctx).await.is_err());

    harness.clock.advance(Duration::from_secs(3));
    assert!(!lease_a.is_valid_at(harness.clock.now()));
    assert!(a.primary_info(&ctx).await.unwrap_err().is_no_primary());

    let lease_b = b.acquire(&ctx).await.unwrap();
    assert_eq!(harness.fencing().await, Some(2));
    assert_eq!(lease_a.renew(&ctx).await.unwrap_err(), LeaseError::LeaseExpired);
    assert!(lease_b.is_valid_at(harness.clock.now()));

    // Closing the stale lease must not release b's grant.
    lease_a.close().await.unwrap();
    assert_eq!(a.primary_info(&ctx).await.unwrap().hostname, "b");
}

/// Tests that a cancelled acquisition leaves no primary behind.
#[tokio::test]
async fn test_cancelled_acquire_leaves_no_grant() {
    let mut harness = ClusterHarness::new(Duration::from_secs(10));
    let a = harness.create_node("a");

    let ctx = Context::background();
    ctx.cancel();

    assert_eq!(a.acquire(&ctx).await.unwrap_err(), LeaseError::Cancelled);
    assert!(harness.store.entries().await.is_empty());
}

// ============================================================================
// TEST: Static Topology
// ============================================================================

/// Tests a two-node cluster with a fixed primary.
#[tokio::test]
async fn test_static_topology() {
    let ctx = Context::background();
    let node_a = StaticLeaser::new(true, "a", "https://a:20202");
    let node_b = StaticLeaser::new(false, "a", "https://a:20202");

    let lease = node_a.acquire(&ctx).await.unwrap();
    assert!(lease.is_valid_at(chrono::Utc::now()));
    assert_eq!(node_a.primary_info(&ctx).await.unwrap_err(), LeaseError::NoPrimary);

    assert_eq!(node_b.acquire(&ctx).await.unwrap_err(), LeaseError::PrimaryExists);
    let info = node_b.primary_info(&ctx).await.unwrap();
    assert_eq!(info.hostname, "a");
    assert_eq!(info.advertise_url, "https://a:20202");
}

/// Tests building a static cluster from YAML configuration.
#[tokio::test]
async fn test_static_topology_from_config() {
    let primary = LeaserConfig::from_yaml_str(
        r#"
hostname: a
advertise_url: https://a:20202
mode:
  type: static
  is_primary: true
"#,
    )
    .unwrap();
    let replica = LeaserConfig::new("b", "https://b:20202").with_mode(LeaserMode::Static {
        is_primary: false,
        primary_hostname: Some("a".to_string()),
        primary_advertise_url: Some("https://a:20202".to_string()),
    });

    let ctx = Context::background();
    let a: Arc<dyn Leaser> = primary.build(None).unwrap();
    let b: Arc<dyn Leaser> = replica.build(None).unwrap();

    assert!(a.acquire(&ctx).await.is_ok());
    assert_eq!(b.primary_info(&ctx).await.unwrap().hostname, "a");
}

// ============================================================================
// TEST: Election Loop
// ============================================================================

/// Tests that the election loop hands primary status over on shutdown.
#[tokio::test(start_paused = true)]
async fn test_election_handover() {
    let harness = ClusterHarness::new(Duration::from_secs(10));

    let a = Election::new(harness.leaser_for("a", true), fast_election())
        .unwrap()
        .with_hostname("a")
        .spawn();
    wait_for_role(&a, Role::is_primary).await;

    let b = Election::new(harness.leaser_for("b", true), fast_election())
        .unwrap()
        .with_hostname("b")
        .spawn();
    let c = Election::new(harness.leaser_for("c", false), fast_election())
        .unwrap()
        .with_hostname("c")
        .spawn();

    for replica in [&b, &c] {
        let role = wait_for_role(replica, |r| r.primary().is_some()).await;
        assert_eq!(role.primary().unwrap().hostname, "a");
    }

    a.shutdown().await.unwrap();

    wait_for_role(&b, Role::is_primary).await;
    let role = wait_for_role(&c, |r| r.primary().map(|p| p.hostname.as_str()) == Some("b")).await;
    assert_eq!(role.primary().unwrap().advertise_url, advertise_url("b"));

    assert_eq!(harness.fencing().await, Some(2));
    assert_eq!(c.stats().await.elections_won, 0);

    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

/// Tests that a primary whose lease expires while it is partitioned demotes.
#[tokio::test(start_paused = true)]
async fn test_election_demotes_after_expiry() {
    let harness = ClusterHarness::new(Duration::from_secs(10));

    let a = Election::new(harness.leaser_for("a", true), fast_election())
        .unwrap()
        .with_clock(harness.clock.clone())
        .with_hostname("a")
        .spawn();
    wait_for_role(&a, Role::is_primary).await;

    // The store expires a's grant before its next renewal lands.
    harness.clock.advance(Duration::from_secs(11));
    assert!(!a.role().holds_lease_at(harness.clock.now()));
    let b = harness.leaser_for("b", true);
    let _lease_b = b.acquire(&Context::background()).await.unwrap();

    let role = wait_for_role(&a, |r| r.primary().is_some()).await;
    assert_eq!(role.primary().unwrap().hostname, "b");
    assert_eq!(a.stats().await.demotions, 1);

    a.shutdown().await.unwrap();
    assert_eq!(
        harness.store.read(DEFAULT_PRIMARY_KEY).await.unwrap().map(|s| s.token.fencing),
        Some(2)
    );
}

/// Tests that a primary cut off from the store never reports itself primary
/// past its lease's expiry, and that no other node acquires while it does.
#[tokio::test(start_paused = true)]
async fn test_role_never_outlives_lease() {
    init_logging();
    let clock = Arc::new(RuntimeClock::new());
    let store = MemoryLeaseStore::with_clock(clock.clone());
    let ttl = Duration::from_secs(10);

    let a_leaser = Arc::new(StoreLeaser::with_clock(
        Arc::new(StalledRenewStore {
            inner: store.clone(),
        }),
        StoreLeaserConfig::new("a", advertise_url("a")).with_ttl(ttl),
        clock.clone(),
    ));
    let b = StoreLeaser::with_clock(
        Arc::new(store.clone()),
        StoreLeaserConfig::new("b", advertise_url("b")).with_ttl(ttl),
        clock.clone(),
    );

    let a = Election::new(a_leaser, ElectionConfig::default())
        .unwrap()
        .with_clock(clock.clone())
        .with_hostname("a")
        .spawn();
    wait_for_role(&a, Role::is_primary).await;

    let ctx = Context::background();
    let mut held = Vec::new();
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(300)).await;

        let now = clock.now();
        let role = a.role();
        if let Role::Primary { expires_at } = &role {
            assert!(now < *expires_at, "primary at {now} past expiry {expires_at}");
        }
        assert!(!role.is_primary() || role.holds_lease_at(now));

        if let Ok(lease) = b.acquire(&ctx).await {
            assert!(!a.role().is_primary(), "two primaries at {now}");
            held.push(lease);
        }
    }

    assert!(a.stats().await.demotions >= 1);

    a.shutdown().await.unwrap();
    for lease in held {
        lease.close().await.unwrap();
    }
}
