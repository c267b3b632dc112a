//! The caller-facing surface: node management, borrow dispatch, and the
//! maintenance loops' lifecycle.

use crate::backend::{Client, SharedConnector};
use crate::claim;
use crate::cleanup;
use crate::health;
use crate::node::NodeEntry;
use crate::policy::{self, Policy};
use crate::stats::{MetricsSink, NopSink, StatusReport};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

#[derive(Error, Debug)]
pub enum Error {
    /// The URL was never added (or has already been removed).
    #[error("no node registered for {0}")]
    UnknownNode(String),

    /// Acquisition was attempted on a node being torn down.
    #[error("node {0} is closing")]
    NodeClosing(String),

    /// No borrow could be obtained within the claim budget.
    #[error("no healthy pools available for {0}")]
    NoHealthyPools(String),

    /// Not even one pool came up within the add-node budget.
    #[error("could not bring up a pool for {0}")]
    AddNodeTimeout(String),
}

pub(crate) struct RegistryInner<C: Client> {
    policy: Policy,
    connector: SharedConnector<C>,
    sink: Arc<dyn MetricsSink>,
    nodes: Mutex<NodeMap<C>>,
}

struct NodeMap<C: Client> {
    entries: BTreeMap<Arc<str>, Arc<NodeEntry<C>>>,

    /// URLs with an add in progress; treated as present for deduplication
    /// but invisible to dispatch until finalized.
    pending: BTreeSet<Arc<str>>,
}

impl<C: Client> RegistryInner<C> {
    pub(crate) fn policy(&self) -> &Policy {
        &self.policy
    }

    pub(crate) fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    pub(crate) fn entries(&self) -> Vec<Arc<NodeEntry<C>>> {
        self.nodes.lock().unwrap().entries.values().cloned().collect()
    }

    fn entry(&self, url: &str) -> Option<Arc<NodeEntry<C>>> {
        self.nodes.lock().unwrap().entries.get(url).cloned()
    }
}

/// Manages the pool sets for any number of nodes, plus the two maintenance
/// tasks that keep them healthy and prune idle capacity.
///
/// All configuration is injected at construction; the registry holds no
/// process-wide state. Dropping the registry aborts the maintenance tasks;
/// call [Registry::shutdown] first for an orderly teardown that also drains
/// and closes every pool.
pub struct Registry<C: Client> {
    pub(crate) inner: Arc<RegistryInner<C>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Client> Registry<C> {
    /// Creates a registry with no nodes and no telemetry.
    ///
    /// Neither maintenance loop is started; see
    /// [Registry::start_health_loop] and [Registry::start_cleanup_loop].
    pub fn new(connector: SharedConnector<C>, policy: Policy) -> Result<Self, policy::Error> {
        Self::with_sink(connector, policy, Arc::new(NopSink))
    }

    /// Creates a registry that publishes telemetry to `sink`.
    pub fn with_sink(
        connector: SharedConnector<C>,
        policy: Policy,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, policy::Error> {
        policy.validate()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                policy,
                connector,
                sink,
                nodes: Mutex::new(NodeMap {
                    entries: BTreeMap::new(),
                    pending: BTreeSet::new(),
                }),
            }),
            health_task: Mutex::new(None),
            cleanup_task: Mutex::new(None),
        })
    }

    /// Registers a node and brings up its initial pool set.
    ///
    /// A no-op if the URL is already registered or an addition for it is in
    /// flight. At least one pool must become ready within `timeout` (the
    /// policy's claim timeout if `None`); otherwise nothing is registered
    /// and the call fails with [Error::AddNodeTimeout]. Initial pools that
    /// missed the budget are still admitted and repaired by the health
    /// loop.
    pub async fn add_node(&self, url: &str, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = timeout.unwrap_or(self.inner.policy.claim_timeout);
        let url: Arc<str> = Arc::from(url);
        {
            let mut nodes = self.inner.nodes.lock().unwrap();
            if nodes.entries.contains_key(&url) || !nodes.pending.insert(url.clone()) {
                return Ok(());
            }
        }
        let mut pending = PendingGuard {
            inner: self.inner.as_ref(),
            url: url.clone(),
            armed: true,
        };

        let entry = Arc::new(NodeEntry::new(
            url.clone(),
            self.inner.connector.clone(),
            self.inner.policy.clone(),
            self.inner.sink.clone(),
        ));
        let ready = entry.populate_initial(timeout).await;

        let mut nodes = self.inner.nodes.lock().unwrap();
        pending.armed = false;
        nodes.pending.remove(&url);
        if ready == 0 {
            drop(nodes);
            tracing::warn!(url = %url, "no pool became ready, rolling back node");
            return Err(Error::AddNodeTimeout(url.to_string()));
        }
        nodes.entries.insert(url.clone(), entry);
        drop(nodes);
        tracing::info!(url = %url, ready_pools = ready, "node added");
        Ok(())
    }

    /// Obtains a scoped client borrow for a node.
    ///
    /// Returns within `timeout` (the policy's claim timeout if `None`)
    /// either a [claim::Handle] from a pool that was healthy at the moment
    /// of handoff, or [Error::NoHealthyPools]. Dropping the handle returns
    /// the borrow.
    pub async fn get_client(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<claim::Handle<C>, Error> {
        let start = Instant::now();
        let deadline = start + timeout.unwrap_or(self.inner.policy.claim_timeout);
        let entry = self
            .inner
            .entry(url)
            .ok_or_else(|| Error::UnknownNode(url.to_string()))?;
        let handle = entry.acquire(deadline).await?;
        self.inner.sink.acquire_latency(url, start.elapsed());
        Ok(handle)
    }

    /// Point-in-time report over every node; takes one lock per node.
    pub fn fetch_pool_status(&self) -> StatusReport {
        let mut nodes = BTreeMap::new();
        for entry in self.inner.entries() {
            nodes.insert(entry.url().to_string(), entry.status());
        }
        StatusReport { nodes }
    }

    /// Drains and closes every pool for a node, then forgets the URL.
    ///
    /// Waits for outstanding borrows to be returned; acquisitions started
    /// after the call fail with [Error::NodeClosing]. Idempotent, and a
    /// no-op for URLs that were never added.
    pub async fn close_node(&self, url: &str) {
        let Some(entry) = self.inner.entry(url) else {
            return;
        };
        entry.close().await;
        self.inner.nodes.lock().unwrap().entries.remove(entry.url());
    }

    /// [Registry::close_node] applied to every node. Idempotent.
    pub async fn close_all(&self) {
        let urls: Vec<Arc<str>> = {
            let nodes = self.inner.nodes.lock().unwrap();
            nodes.entries.keys().cloned().collect()
        };
        for url in urls {
            self.close_node(&url).await;
        }
    }

    /// Stops both maintenance loops, then drains and closes every node.
    pub async fn shutdown(&self) {
        self.stop_health_loop().await;
        self.stop_cleanup_loop().await;
        self.close_all().await;
    }

    /// Starts the periodic probe-and-repair task. At most one instance
    /// runs per registry; the first probe sweep happens immediately.
    pub fn start_health_loop(&self) {
        let mut task = self.health_task.lock().unwrap();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::task::spawn(health::run(inner)));
    }

    /// Starts the periodic idle-pool pruning task. At most one instance
    /// runs per registry; the first sweep happens one interval from now.
    pub fn start_cleanup_loop(&self) {
        let mut task = self.cleanup_task.lock().unwrap();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::task::spawn(cleanup::run(inner)));
    }

    /// Stops the health loop at the next safe point.
    pub async fn stop_health_loop(&self) {
        let task = self.health_task.lock().unwrap().take();
        join_stopped(task).await;
    }

    /// Stops the cleanup loop at the next safe point.
    pub async fn stop_cleanup_loop(&self) {
        let task = self.cleanup_task.lock().unwrap().take();
        join_stopped(task).await;
    }

    pub fn is_health_loop_running(&self) -> bool {
        self.health_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl<C: Client> Drop for Registry<C> {
    fn drop(&mut self) {
        for task in [&self.health_task, &self.cleanup_task] {
            if let Some(handle) = task.lock().unwrap().take() {
                handle.abort();
            }
        }
    }
}

// Aborts a loop task and reaps it, propagating panics but swallowing the
// expected cancellation.
async fn join_stopped(task: Option<JoinHandle<()>>) {
    let Some(handle) = task else {
        return;
    };
    handle.abort();
    match handle.await {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => {}
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("unexpected join error from maintenance loop: {err}"),
    }
}

// Un-reserves a URL if add_node is cancelled before finalizing.
struct PendingGuard<'a, C: Client> {
    inner: &'a RegistryInner<C>,
    url: Arc<str>,
    armed: bool,
}

impl<C: Client> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.nodes.lock().unwrap().pending.remove(&self.url);
        }
    }
}
