//! The periodic idle-pool pruning task.
//!
//! Pure capacity reclamation: pools that have sat unused past the policy
//! threshold are closed, never going below the per-node floor and never
//! touching a pool with borrows in flight or a probe outstanding. Skipping
//! a tick is always safe.

use crate::backend::Client;
use crate::registry::RegistryInner;

use std::sync::Arc;

pub(crate) async fn run<C: Client>(inner: Arc<RegistryInner<C>>) {
    loop {
        tokio::time::sleep(inner.policy().cleanup_interval).await;
        tick(&inner).await;
    }
}

/// One pruning sweep over every node.
pub(crate) async fn tick<C: Client>(inner: &RegistryInner<C>) {
    for entry in inner.entries() {
        let reaped = entry.reap_idle();
        if reaped.is_empty() {
            continue;
        }
        for pool in reaped {
            tracing::info!(url = %entry.url(), pool = pool.id, "closing idle pool");
            pool.conn.close().await;
            inner.sink().idle_reaped(entry.url());
        }
        entry.broadcast();
    }
}
