//! The interface for constructing and probing underlying client handles.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How a node is addressed: directly, or through a set of cluster seeds.
///
/// In cluster mode the node URL names the cluster as a whole; the underlying
/// client performs its own topology discovery starting from `seeds`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Single,
    Cluster { seeds: Vec<String> },
}

/// Everything a [Connector] needs to bring up one client handle.
#[derive(Clone, Debug)]
pub struct Target {
    /// The node address, e.g. `redis://db0.example.com:6379`.
    pub url: Arc<str>,

    /// Maximum concurrent borrows the client handle may serve.
    pub capacity: usize,

    /// Single-node or cluster addressing.
    pub mode: Mode,

    /// Pass-through options forwarded verbatim to the underlying client.
    pub options: BTreeMap<String, String>,
}

/// A handle to the underlying client library.
///
/// The handle is expected to multiplex up to [Target::capacity] concurrent
/// callers internally; redpool only counts borrows against that capacity.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Issues a single lightweight liveness probe (a `PING`-equivalent).
    async fn ping(&self) -> Result<(), Error>;

    /// Releases the handle's resources. Must tolerate repeated calls.
    async fn close(&self) {}
}

/// Describes how a client handle for a [Target] should be constructed.
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: Client;

    /// Creates a client handle for a target.
    ///
    /// Construction alone does not imply the server is reachable; callers
    /// follow up with [Client::ping] before treating the handle as ready.
    async fn connect(&self, target: &Target) -> Result<Self::Client, Error>;
}

pub type SharedConnector<C> = Arc<dyn Connector<Client = C>>;
