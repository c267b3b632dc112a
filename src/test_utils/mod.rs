//! Utilities to help with testing redpool

use crate::backend::{self, Client, Connector, Mode, Target};

use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Shared {
    connect_failures: AtomicU32,
    ping_failures: AtomicU32,
    delay_ms: AtomicU64,
    connects: AtomicU32,
    pings: AtomicU32,
    closes: AtomicU32,
}

impl Shared {
    // Consumes one scripted failure, if any remain. A u32::MAX budget is
    // treated as sticky.
    fn take_failure(&self, counter: &AtomicU32) -> bool {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining == 0 {
            return false;
        }
        if remaining != u32::MAX {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }

    async fn delay(&self) {
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
        }
    }
}

/// A scriptable connector: tests can make the next N connects or pings
/// fail, and slow every operation down to mimic a distant server.
pub(crate) struct TestConnector {
    shared: Arc<Shared>,
}

impl TestConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared::default()),
        })
    }

    /// A single-node target for driving a [crate::connection::Connection]
    /// directly, without a registry building targets from policy.
    pub(crate) fn target(url: &str) -> Target {
        Target {
            url: Arc::from(url),
            capacity: 8,
            mode: Mode::Single,
            options: BTreeMap::new(),
        }
    }

    /// Fails the next `n` connect attempts. `u32::MAX` fails all of them.
    pub(crate) fn fail_connects(&self, n: u32) {
        self.shared.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` probes. `u32::MAX` fails all of them.
    pub(crate) fn fail_pings(&self, n: u32) {
        self.shared.ping_failures.store(n, Ordering::SeqCst);
    }

    /// Convenience for flipping probes between always-fail and healthy.
    pub(crate) fn fail_pings_forever(&self, failing: bool) {
        self.fail_pings(if failing { u32::MAX } else { 0 });
    }

    /// Stalls all operations through the connector, forcing them to take an
    /// unrealistically long time.
    pub(crate) fn stall(&self) {
        self.shared.delay_ms.store(9_999_999, Ordering::SeqCst);
    }

    pub(crate) fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn ping_count(&self) -> u32 {
        self.shared.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> u32 {
        self.shared.closes.load(Ordering::SeqCst)
    }
}

pub(crate) struct TestClient {
    shared: Arc<Shared>,
}

#[async_trait]
impl Client for TestClient {
    async fn ping(&self) -> Result<(), backend::Error> {
        self.shared.delay().await;
        self.shared.pings.fetch_add(1, Ordering::SeqCst);
        if self.shared.take_failure(&self.shared.ping_failures) {
            return Err(anyhow!("scripted ping failure").into());
        }
        Ok(())
    }

    async fn close(&self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Client = TestClient;

    async fn connect(&self, _target: &Target) -> Result<Self::Client, backend::Error> {
        self.shared.delay().await;
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if self.shared.take_failure(&self.shared.connect_failures) {
            return Err(anyhow!("scripted connect failure").into());
        }
        Ok(TestClient {
            shared: self.shared.clone(),
        })
    }
}
