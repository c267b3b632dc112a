//! Status snapshots and the pluggable metrics surface.
//!
//! The registry publishes gauge updates on every structural transition
//! (borrow, release, pool added, repair, idle reap) through a
//! [MetricsSink]; the shipped default discards them. Point-in-time
//! snapshots come from [crate::registry::Registry::fetch_pool_status] and
//! serialize cleanly for exporters.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-node gauge values, computed under the node's lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeGauges {
    pub total_pools: usize,
    pub healthy_pools: usize,
    pub unhealthy_pools: usize,
    /// Summed active borrows across the node's pools.
    pub in_flight: usize,
    /// Pools idle past the policy threshold.
    pub idle_pools: usize,
}

/// Receives pool telemetry.
///
/// Implementations are called from inside pool-state critical sections and
/// must return quickly; in particular they must not call back into the
/// registry. All methods default to no-ops so a sink only implements what
/// its backend can represent.
pub trait MetricsSink: Send + Sync + 'static {
    /// Gauge refresh for one node.
    fn pool_gauges(&self, _node: &str, _gauges: &NodeGauges) {}

    /// A pool's connection came up (initial population or expansion).
    fn connection_created(&self, _node: &str) {}

    /// A readiness wait gave up on a connection.
    fn connection_failed(&self, _node: &str) {}

    /// The cleanup loop closed an idle pool.
    fn idle_reaped(&self, _node: &str) {}

    /// Latency of one successful borrow acquisition.
    fn acquire_latency(&self, _node: &str, _latency: Duration) {}
}

/// The default sink: drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopSink;

impl MetricsSink for NopSink {}

/// Point-in-time state of one pool, as reported by
/// [crate::registry::Registry::fetch_pool_status].
#[derive(Clone, Debug, Serialize)]
pub struct PoolStatus {
    pub index: usize,
    pub in_flight: usize,
    pub healthy: bool,
    pub generation: u64,
}

/// Point-in-time state of one node's pool set.
#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub total_pools: usize,
    pub healthy_pools: usize,
    pub unhealthy_pools: usize,
    pub in_flight: usize,
    /// Summed borrow capacity across the node's pools.
    pub capacity: usize,
    pub idle_pools: usize,
    pub pools: Vec<PoolStatus>,
}

/// Point-in-time state of every node in a registry.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusReport {
    pub nodes: BTreeMap<String, NodeStatus>,
}
