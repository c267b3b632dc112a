//! The periodic probe-and-repair task.
//!
//! Each tick probes every pool of every node with no pool-level lock held,
//! applies the outcomes, and rebuilds unhealthy pools that have no borrows
//! in flight. Failures here are routine: they are logged and retried on the
//! next tick, and the task only ever exits by being stopped.

use crate::backend::Client;
use crate::registry::RegistryInner;

use std::sync::Arc;

pub(crate) async fn run<C: Client>(inner: Arc<RegistryInner<C>>) {
    let mut interval = tokio::time::interval(inner.policy().health_check_interval);
    loop {
        interval.tick().await;
        tick(&inner).await;
    }
}

/// One full probe-and-repair sweep over every node.
pub(crate) async fn tick<C: Client>(inner: &RegistryInner<C>) {
    for entry in inner.entries() {
        let sweep = entry.begin_probe_sweep();
        if sweep.is_empty() {
            continue;
        }

        // Probes run without the node lock so callers keep borrowing while
        // the network is slow.
        let mut outcomes = Vec::with_capacity(sweep.len());
        for (id, conn) in sweep {
            outcomes.push((id, conn.health_check().await.is_ok()));
        }

        // Repair candidates re-checked `in_flight == 0` under the lock.
        let policy = inner.policy();
        for (id, conn) in entry.record_probe_outcomes(outcomes) {
            conn.close().await;
            let result = conn
                .wait_for_ready(
                    policy.readiness_timeout,
                    policy.readiness_step,
                    policy.readiness_max_retries,
                )
                .await;
            match &result {
                Ok(elapsed) => {
                    tracing::info!(
                        url = %entry.url(),
                        pool = id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "repaired pool",
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        url = %entry.url(),
                        pool = id,
                        error = %err,
                        "repair failed, will retry next tick",
                    );
                    inner.sink().connection_failed(entry.url());
                }
            }
            entry.finish_repair(id, result.is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use crate::registry::{Error, Registry};
    use crate::test_utils::{TestClient, TestConnector};
    use tokio::time::{self, Duration};

    const URL: &str = "redis://a";

    fn policy(max_pools: usize) -> Policy {
        Policy {
            initial_pools_per_node: 1,
            min_pools_per_node: 1,
            max_pools_per_node: max_pools,
            max_connection_size: 4,
            ..Policy::default()
        }
    }

    async fn registry(
        connector: &std::sync::Arc<TestConnector>,
        max_pools: usize,
    ) -> Registry<TestClient> {
        let registry = Registry::new(
            connector.clone() as crate::backend::SharedConnector<_>,
            policy(max_pools),
        )
        .unwrap();
        registry.add_node(URL, None).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn failed_probe_marks_unhealthy_and_repairs_in_place() {
        time::pause();
        let connector = TestConnector::new();
        let registry = registry(&connector, 1).await;

        // The probe fails once; the repair's own probe then succeeds.
        let pings_before = connector.ping_count();
        connector.fail_pings(1);
        tick(&registry.inner).await;

        // The failed sweep probe plus the repair's readiness probe.
        assert_eq!(connector.ping_count(), pings_before + 2);
        let node = &registry.fetch_pool_status().nodes[URL];
        assert_eq!(node.healthy_pools, 1);
        assert_eq!(node.pools[0].generation, 1);

        let borrow = registry.get_client(URL, None).await.unwrap();
        assert_eq!(borrow.generation(), 1);
    }

    #[tokio::test]
    async fn repair_failure_is_retried_on_a_later_tick() {
        time::pause();
        let connector = TestConnector::new();
        let registry = registry(&connector, 1).await;

        connector.fail_pings_forever(true);
        tick(&registry.inner).await;

        let node = &registry.fetch_pool_status().nodes[URL];
        assert_eq!(node.unhealthy_pools, 1);
        assert_eq!(node.pools[0].generation, 0);

        // No borrows are issued from an unhealthy pool.
        let err = registry
            .get_client(URL, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoHealthyPools(_)));

        // Server comes back; the next tick's repair goes through.
        connector.fail_pings_forever(false);
        tick(&registry.inner).await;

        let node = &registry.fetch_pool_status().nodes[URL];
        assert_eq!(node.healthy_pools, 1);
        assert_eq!(node.pools[0].generation, 1);
    }

    #[tokio::test]
    async fn pool_with_borrows_in_flight_is_not_repaired() {
        time::pause();
        let connector = TestConnector::new();
        let registry = registry(&connector, 1).await;

        let held = registry.get_client(URL, None).await.unwrap();
        let closes_before = connector.close_count();

        connector.fail_pings_forever(true);
        tick(&registry.inner).await;

        // Marked unhealthy, but the connection stays untouched while the
        // borrow is out.
        let node = &registry.fetch_pool_status().nodes[URL];
        assert_eq!(node.unhealthy_pools, 1);
        assert_eq!(node.pools[0].generation, 0);
        assert_eq!(connector.close_count(), closes_before);

        drop(held);
        connector.fail_pings(1);
        tick(&registry.inner).await;

        let node = &registry.fetch_pool_status().nodes[URL];
        assert_eq!(node.healthy_pools, 1);
        assert_eq!(node.pools[0].generation, 1);
    }

    #[tokio::test]
    async fn loop_repairs_without_manual_ticks() {
        time::pause();
        let connector = TestConnector::new();
        let registry = registry(&connector, 1).await;
        registry.start_health_loop();
        assert!(registry.is_health_loop_running());

        connector.fail_pings(1);
        time::sleep(Duration::from_secs(90)).await;

        let node = &registry.fetch_pool_status().nodes[URL];
        assert_eq!(node.healthy_pools, 1);
        assert_eq!(node.pools[0].generation, 1);

        registry.stop_health_loop().await;
        assert!(!registry.is_health_loop_running());

        // With the loop stopped nothing flips the flag back.
        connector.fail_pings_forever(true);
        tick(&registry.inner).await;
        connector.fail_pings_forever(false);
        time::sleep(Duration::from_secs(180)).await;
        let node = &registry.fetch_pool_status().nodes[URL];
        assert_eq!(node.unhealthy_pools, 1);
    }

    #[tokio::test]
    async fn starting_twice_keeps_a_single_loop() {
        let connector = TestConnector::new();
        let registry = registry(&connector, 1).await;
        registry.start_health_loop();
        registry.start_health_loop();
        assert!(registry.is_health_loop_running());
        registry.stop_health_loop().await;
        assert!(!registry.is_health_loop_running());
    }
}
