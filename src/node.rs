//! Per-node pool bookkeeping.
//!
//! A [NodeEntry] owns every pool for one node URL and the coordination
//! primitive callers and maintenance loops share: a mutex over the pool
//! list and a condition that is broadcast whenever a borrow is released, a
//! pool is added, or a pool flips back to healthy. The mutex is only ever
//! held for non-suspending sections; probes, readiness waits, and closes
//! all run with the lock released.

use crate::backend::{Client, SharedConnector, Target};
use crate::claim;
use crate::connection::Connection;
use crate::policy::Policy;
use crate::registry::Error;
use crate::stats::{MetricsSink, NodeGauges, NodeStatus, PoolStatus};

use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

pub(crate) type PoolId = usize;

/// One pool: a connection plus the counters the dispatcher and the
/// maintenance loops coordinate through.
///
/// Every field except `conn` is guarded by the owning entry's mutex.
pub(crate) struct PoolEntry<C: Client> {
    pub(crate) id: PoolId,
    pub(crate) conn: Arc<Connection<C>>,

    /// Active borrows against this pool.
    in_flight: usize,

    /// Most recent borrow release (or creation time).
    last_used: Instant,

    /// Outcome of the most recent probe. No new borrows while false.
    healthy: bool,

    /// Bumped on each successful repair.
    generation: u64,

    /// True while a maintenance task has the connection checked out for a
    /// probe or repair; such a pool must not be closed out from under it.
    probing: bool,
}

struct NodeState<C: Client> {
    pools: Vec<PoolEntry<C>>,
    next_pool_id: PoolId,

    /// Pools currently being constructed by callers; counted against
    /// `max_pools_per_node` so concurrent expansion cannot overshoot.
    creating: usize,

    /// Set once teardown starts; new acquisitions fail from then on.
    closing: bool,
}

impl<C: Client> NodeState<C> {
    fn pool_mut(&mut self, id: PoolId) -> Option<&mut PoolEntry<C>> {
        self.pools.iter_mut().find(|pool| pool.id == id)
    }

    fn push_pool(&mut self, conn: Arc<Connection<C>>, healthy: bool) -> PoolId {
        let id = self.next_pool_id;
        self.next_pool_id += 1;
        self.pools.push(PoolEntry {
            id,
            conn,
            in_flight: 0,
            last_used: Instant::now(),
            healthy,
            generation: 0,
            probing: false,
        });
        id
    }
}

/// All pools for one node URL.
pub(crate) struct NodeEntry<C: Client> {
    url: Arc<str>,
    connector: SharedConnector<C>,
    policy: Policy,
    sink: Arc<dyn MetricsSink>,
    cond: Notify,
    state: Mutex<NodeState<C>>,
}

impl<C: Client> NodeEntry<C> {
    pub(crate) fn new(
        url: Arc<str>,
        connector: SharedConnector<C>,
        policy: Policy,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            url,
            connector,
            policy,
            sink,
            cond: Notify::new(),
            state: Mutex::new(NodeState {
                pools: Vec::new(),
                next_pool_id: 0,
                creating: 0,
                closing: false,
            }),
        }
    }

    pub(crate) fn url(&self) -> &Arc<str> {
        &self.url
    }

    fn target(&self) -> Target {
        Target {
            url: self.url.clone(),
            capacity: self.policy.max_connection_size,
            mode: self.policy.mode(),
            options: self.policy.pool_args.clone(),
        }
    }

    /// Brings up the initial pool set for this node under one shared budget.
    ///
    /// Pools whose readiness wait does not finish in time are still admitted
    /// (unhealthy) and left to the health loop, as long as at least one pool
    /// came up. Returns the number of ready pools; zero means nothing was
    /// admitted and every partial connection has been closed.
    pub(crate) async fn populate_initial(&self, timeout: Duration) -> usize {
        let initial = self.policy.initial_pools_per_node;
        let conns: Vec<Arc<Connection<C>>> = (0..initial)
            .map(|_| Arc::new(Connection::new(self.target(), self.connector.clone())))
            .collect();

        let waits = conns.iter().map(|conn| {
            conn.wait_for_ready(
                self.policy.readiness_timeout,
                self.policy.readiness_step,
                self.policy.readiness_max_retries,
            )
        });
        let _ = tokio::time::timeout(timeout, futures::future::join_all(waits)).await;

        let ready = conns.iter().filter(|conn| conn.is_ready()).count();
        if ready == 0 {
            for conn in &conns {
                conn.close().await;
                self.sink.connection_failed(&self.url);
            }
            return 0;
        }

        {
            let mut state = self.state.lock().unwrap();
            for conn in conns {
                let healthy = conn.is_ready();
                if healthy {
                    self.sink.connection_created(&self.url);
                } else {
                    self.sink.connection_failed(&self.url);
                }
                state.push_pool(conn, healthy);
            }
            self.emit_gauges_locked(&state);
        }
        self.cond.notify_waiters();
        ready
    }

    /// Obtains a borrow, growing the pool set or waiting for capacity as
    /// needed, until `deadline`.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<claim::Handle<C>, Error> {
        // Cleared after a failed expansion so the next pass waits for a
        // release instead of immediately dialing again; a wakeup re-arms it.
        let mut allow_create = true;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::NoHealthyPools(self.url.to_string()));
            }

            let notified = self.cond.notified();
            tokio::pin!(notified);

            enum Step {
                Create,
                Wait,
            }

            let step = {
                let mut state = self.state.lock().unwrap();
                if state.closing {
                    return Err(Error::NodeClosing(self.url.to_string()));
                }
                if let Some(handle) = self.try_acquire_locked(&mut state) {
                    self.emit_gauges_locked(&state);
                    return Ok(handle);
                }
                if allow_create
                    && state.pools.len() + state.creating < self.policy.max_pools_per_node
                {
                    state.creating += 1;
                    Step::Create
                } else {
                    // Register for wakeups before releasing the lock so a
                    // broadcast between unlock and sleep is not lost.
                    notified.as_mut().enable();
                    Step::Wait
                }
            };

            match step {
                Step::Create => match self.create_pool_and_acquire(deadline).await? {
                    Some(handle) => return Ok(handle),
                    None => allow_create = false,
                },
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::NoHealthyPools(self.url.to_string()));
                    }
                    allow_create = true;
                }
            }
        }
    }

    // Selects the healthy pool with spare capacity and the fewest active
    // borrows; ties go to the earliest pool in the list.
    fn try_acquire_locked(
        self: &Arc<Self>,
        state: &mut NodeState<C>,
    ) -> Option<claim::Handle<C>> {
        let capacity = self.policy.max_connection_size;
        let mut best: Option<(usize, usize)> = None;
        for (index, pool) in state.pools.iter().enumerate() {
            if !pool.healthy || pool.in_flight >= capacity {
                continue;
            }
            if best.map_or(true, |(_, in_flight)| pool.in_flight < in_flight) {
                best = Some((index, pool.in_flight));
            }
        }
        let (index, _) = best?;
        let pool = &mut state.pools[index];
        // A healthy pool always has a client installed.
        let client = pool.conn.client().ok()?;
        pool.in_flight += 1;
        pool.last_used = Instant::now();
        Some(claim::Handle::new(
            self.clone(),
            pool.id,
            pool.generation,
            client,
        ))
    }

    // Grows the pool set by one and acquires from it. Returns Ok(None) when
    // the new connection could not be brought up (the caller falls back to
    // waiting); the reservation taken under `creating` is returned on every
    // path, including cancellation.
    async fn create_pool_and_acquire(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<Option<claim::Handle<C>>, Error> {
        let mut guard = CreateGuard {
            entry: self.as_ref(),
            armed: true,
        };
        let conn = Arc::new(Connection::new(self.target(), self.connector.clone()));
        let budget = std::cmp::min(
            self.policy.readiness_timeout,
            deadline.saturating_duration_since(Instant::now()),
        );

        let result = tokio::time::timeout_at(
            deadline,
            conn.wait_for_ready(
                budget,
                self.policy.readiness_step,
                self.policy.readiness_max_retries,
            ),
        )
        .await;

        match result {
            Err(_) => {
                // The claim budget itself elapsed mid-creation.
                drop(guard);
                conn.close().await;
                Err(Error::NoHealthyPools(self.url.to_string()))
            }
            Ok(Err(err)) => {
                tracing::warn!(url = %self.url, error = %err, "failed to grow pool set");
                self.sink.connection_failed(&self.url);
                drop(guard);
                Ok(None)
            }
            Ok(Ok(_elapsed)) => {
                let handle = {
                    let mut state = self.state.lock().unwrap();
                    guard.armed = false;
                    state.creating -= 1;
                    if state.closing {
                        None
                    } else {
                        state.push_pool(conn.clone(), true);
                        let handle = self
                            .try_acquire_locked(&mut state)
                            .expect("freshly added pool has spare capacity");
                        tracing::info!(
                            url = %self.url,
                            total_pools = state.pools.len(),
                            "added pool",
                        );
                        self.emit_gauges_locked(&state);
                        Some(handle)
                    }
                };
                self.cond.notify_waiters();
                match handle {
                    Some(handle) => {
                        self.sink.connection_created(&self.url);
                        Ok(Some(handle))
                    }
                    None => {
                        conn.close().await;
                        Err(Error::NodeClosing(self.url.to_string()))
                    }
                }
            }
        }
    }

    /// Returns a borrow's reservation. Called from [claim::Handle::drop].
    pub(crate) fn release(&self, id: PoolId, generation: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(pool) = state.pool_mut(id) {
            debug_assert!(pool.in_flight > 0, "release without a matching borrow");
            debug_assert_eq!(pool.generation, generation, "borrow outlived a repair");
            pool.in_flight = pool.in_flight.saturating_sub(1);
            pool.last_used = Instant::now();
        }
        self.emit_gauges_locked(&state);
        drop(state);
        self.cond.notify_waiters();
    }

    /// Wakes every waiter; used after structural changes made outside
    /// [NodeEntry]'s own methods.
    pub(crate) fn broadcast(&self) {
        self.cond.notify_waiters();
    }

    /// Marks every pool as checked out for probing and snapshots their
    /// connections. Empty if the node is closing.
    pub(crate) fn begin_probe_sweep(&self) -> Vec<(PoolId, Arc<Connection<C>>)> {
        let mut state = self.state.lock().unwrap();
        if state.closing {
            return Vec::new();
        }
        state
            .pools
            .iter_mut()
            .map(|pool| {
                pool.probing = true;
                (pool.id, pool.conn.clone())
            })
            .collect()
    }

    /// Applies probe outcomes and returns the pools to repair: unhealthy
    /// and, re-checked under the lock, with no borrows in flight. Repair
    /// candidates keep their connection checked out; everything else is
    /// handed back.
    pub(crate) fn record_probe_outcomes(
        &self,
        outcomes: Vec<(PoolId, bool)>,
    ) -> Vec<(PoolId, Arc<Connection<C>>)> {
        let mut repair = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let closing = state.closing;
            for (id, ok) in outcomes {
                let Some(pool) = state.pool_mut(id) else {
                    continue;
                };
                if ok && !pool.healthy {
                    tracing::info!(url = %self.url, pool = id, "pool passed probe again");
                } else if !ok && pool.healthy {
                    tracing::warn!(url = %self.url, pool = id, "pool failed probe");
                }
                pool.healthy = ok;
                if !ok && pool.in_flight == 0 && !closing {
                    repair.push((pool.id, pool.conn.clone()));
                } else {
                    pool.probing = false;
                }
            }
            self.emit_gauges_locked(&state);
        }
        // Probes may have flipped pools healthy, and teardown waits for
        // probing flags to clear; either way waiters must re-evaluate.
        self.cond.notify_waiters();
        repair
    }

    /// Records the outcome of a repair and hands the connection back.
    pub(crate) fn finish_repair(&self, id: PoolId, ok: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(pool) = state.pool_mut(id) {
                pool.probing = false;
                if ok {
                    pool.healthy = true;
                    pool.generation += 1;
                }
            }
            self.emit_gauges_locked(&state);
        }
        self.cond.notify_waiters();
    }

    /// Removes every pool that is idle past the policy threshold, keeping
    /// at least `min_pools_per_node`. The removed pools still need their
    /// connections closed, which the caller does without the lock held.
    pub(crate) fn reap_idle(&self) -> Vec<PoolEntry<C>> {
        let mut state = self.state.lock().unwrap();
        if state.closing {
            return Vec::new();
        }
        let now = Instant::now();
        let floor = self.policy.min_pools_per_node;
        let mut remaining = state.pools.len();
        let mut keep = Vec::with_capacity(remaining);
        let mut reaped = Vec::new();
        for pool in state.pools.drain(..) {
            let closable = remaining > floor
                && pool.in_flight == 0
                && !pool.probing
                && now.duration_since(pool.last_used) > self.policy.max_idle_time;
            if closable {
                remaining -= 1;
                reaped.push(pool);
            } else {
                keep.push(pool);
            }
        }
        state.pools = keep;
        if !reaped.is_empty() {
            self.emit_gauges_locked(&state);
        }
        reaped
    }

    /// Marks the node closing, waits for every borrow (and any in-progress
    /// creation or probe) to drain, then closes all pools.
    ///
    /// Idempotent, and resumable: if the wait is cancelled the node stays
    /// closing and a later call picks up the drain.
    pub(crate) async fn close(&self) {
        let became_closing = {
            let mut state = self.state.lock().unwrap();
            let was_closing = state.closing;
            state.closing = true;
            !was_closing
        };
        if became_closing {
            // Wake blocked acquirers so they observe the closing flag.
            self.cond.notify_waiters();
        }

        loop {
            let notified = self.cond.notified();
            tokio::pin!(notified);

            let drained = {
                let mut state = self.state.lock().unwrap();
                let busy = state.creating > 0
                    || state
                        .pools
                        .iter()
                        .any(|pool| pool.in_flight > 0 || pool.probing);
                if busy {
                    notified.as_mut().enable();
                    None
                } else {
                    Some(std::mem::take(&mut state.pools))
                }
            };

            match drained {
                Some(pools) => {
                    for pool in pools {
                        pool.conn.close().await;
                    }
                    tracing::info!(url = %self.url, "node closed");
                    return;
                }
                None => notified.await,
            }
        }
    }

    /// One-lock snapshot for status reporting.
    pub(crate) fn status(&self) -> NodeStatus {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        let capacity = self.policy.max_connection_size;
        let healthy = state.pools.iter().filter(|pool| pool.healthy).count();
        NodeStatus {
            total_pools: state.pools.len(),
            healthy_pools: healthy,
            unhealthy_pools: state.pools.len() - healthy,
            in_flight: state.pools.iter().map(|pool| pool.in_flight).sum(),
            capacity: state.pools.len() * capacity,
            idle_pools: state
                .pools
                .iter()
                .filter(|pool| {
                    pool.in_flight == 0
                        && now.duration_since(pool.last_used) >= self.policy.max_idle_time
                })
                .count(),
            pools: state
                .pools
                .iter()
                .enumerate()
                .map(|(index, pool)| PoolStatus {
                    index,
                    in_flight: pool.in_flight,
                    healthy: pool.healthy,
                    generation: pool.generation,
                })
                .collect(),
        }
    }

    fn emit_gauges_locked(&self, state: &NodeState<C>) {
        let now = Instant::now();
        let healthy = state.pools.iter().filter(|pool| pool.healthy).count();
        let gauges = NodeGauges {
            total_pools: state.pools.len(),
            healthy_pools: healthy,
            unhealthy_pools: state.pools.len() - healthy,
            in_flight: state.pools.iter().map(|pool| pool.in_flight).sum(),
            idle_pools: state
                .pools
                .iter()
                .filter(|pool| {
                    pool.in_flight == 0
                        && now.duration_since(pool.last_used) >= self.policy.max_idle_time
                })
                .count(),
        };
        self.sink.pool_gauges(&self.url, &gauges);
    }
}

// Returns a caller's expansion reservation if the attempt is cancelled or
// fails before the pool is installed.
struct CreateGuard<'a, C: Client> {
    entry: &'a NodeEntry<C>,
    armed: bool,
}

impl<C: Client> Drop for CreateGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.entry.state.lock().unwrap();
            state.creating -= 1;
            drop(state);
            self.entry.cond.notify_waiters();
        }
    }
}
