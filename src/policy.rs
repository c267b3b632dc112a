//! Scheduling and sizing knobs for a [crate::registry::Registry].

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid policy: {0}")]
    Invalid(&'static str),
}

/// Policy which is applicable to a pool registry.
///
/// The registry takes its policy at construction; there is no process-wide
/// mutable configuration.
#[derive(Clone, Debug)]
pub struct Policy {
    /// Pools created for a node when it is first added.
    pub initial_pools_per_node: usize,

    /// Floor below which the cleanup loop never prunes a node.
    pub min_pools_per_node: usize,

    /// Ceiling on pools per node, counting pools still being created.
    pub max_pools_per_node: usize,

    /// Maximum concurrent borrows served by one pool's client handle.
    pub max_connection_size: usize,

    /// How long [crate::registry::Registry::get_client] waits when the
    /// caller passes no explicit budget.
    pub claim_timeout: Duration,

    /// Interval between health-loop ticks.
    pub health_check_interval: Duration,

    /// Interval between cleanup-loop ticks.
    pub cleanup_interval: Duration,

    /// Idle duration after which a pool becomes a candidate for pruning.
    pub max_idle_time: Duration,

    /// Overall budget for one readiness wait.
    pub readiness_timeout: Duration,

    /// Initial delay between readiness attempts; doubles per attempt.
    pub readiness_step: Duration,

    /// Attempt ceiling for one readiness wait.
    pub readiness_max_retries: u32,

    /// Whether targets address a cluster rather than a single node.
    pub use_cluster: bool,

    /// Seed endpoints handed to the underlying client in cluster mode.
    pub startup_nodes: Vec<String>,

    /// Pass-through options forwarded verbatim to the underlying client.
    pub pool_args: BTreeMap<String, String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            initial_pools_per_node: 1,
            min_pools_per_node: 1,
            max_pools_per_node: 16,
            max_connection_size: 50,
            claim_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(120),
            max_idle_time: Duration::from_secs(180),
            readiness_timeout: Duration::from_secs(10),
            readiness_step: Duration::from_millis(250),
            readiness_max_retries: 5,
            use_cluster: false,
            startup_nodes: Vec::new(),
            pool_args: BTreeMap::new(),
        }
    }
}

impl Policy {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.initial_pools_per_node == 0 {
            return Err(Error::Invalid("initial_pools_per_node must be at least 1"));
        }
        if self.min_pools_per_node > self.initial_pools_per_node {
            return Err(Error::Invalid(
                "min_pools_per_node must not exceed initial_pools_per_node",
            ));
        }
        if self.max_pools_per_node < self.initial_pools_per_node {
            return Err(Error::Invalid(
                "max_pools_per_node must be at least initial_pools_per_node",
            ));
        }
        if self.max_connection_size == 0 {
            return Err(Error::Invalid("max_connection_size must be at least 1"));
        }
        if self.readiness_max_retries == 0 {
            return Err(Error::Invalid("readiness_max_retries must be at least 1"));
        }
        if self.use_cluster && self.startup_nodes.is_empty() {
            return Err(Error::Invalid("cluster mode requires startup_nodes"));
        }
        Ok(())
    }

    /// The addressing mode targets built from this policy will carry.
    pub(crate) fn mode(&self) -> crate::backend::Mode {
        if self.use_cluster {
            crate::backend::Mode::Cluster {
                seeds: self.startup_nodes.clone(),
            }
        } else {
            crate::backend::Mode::Single
        }
    }
}
