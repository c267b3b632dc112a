//! redpool is a connection-pool manager for Redis-compatible key-value
//! servers.
//!
//! redpool keeps a set of healthy, reusable client connections available to
//! concurrent callers, for single-node and clustered deployments alike.
//!
//! It uses the following terminology:
//! * Nodes are server endpoints identified by a URL. In cluster mode a
//!   single URL stands for the whole cluster, reached through its seed
//!   endpoints.
//! * Pools are fixed-capacity reservoirs of concurrent borrows, each backed
//!   by one underlying client handle. A node carries one or more pools,
//!   growing under load and shrinking when idle.
//!
//! # Usage
//!
//! * The main interface for this crate is [registry::Registry].
//! * To construct a registry, you must supply a [backend::Connector], the
//!   interface specifying "how to create a client handle for a node", and
//!   a [policy::Policy] with the sizing and scheduling knobs.
//! * Register nodes with [registry::Registry::add_node], then borrow
//!   clients with [registry::Registry::get_client]. The borrow is a scoped
//!   [claim::Handle]; dropping it returns the capacity.
//! * Two background tasks keep the registry healthy:
//!   [registry::Registry::start_health_loop] probes every pool and rebuilds
//!   the ones that fail, and [registry::Registry::start_cleanup_loop]
//!   prunes pools that have sat idle.
//!
//! A connector for the `redis` client library ships behind the `"redis"`
//! feature; any client library with a ping-style liveness call can be
//! plugged in through [backend::Connector].

// Public API
pub mod backend;
pub mod claim;
pub mod connection;
pub mod policy;
pub mod registry;
pub mod stats;

// Necessary for implementation
mod backoff;
mod cleanup;
mod health;
mod node;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod connectors;
