//! A single underlying client handle and its liveness state.

use crate::backend::{self, Client, SharedConnector, Target};
use crate::backoff::RetrySchedule;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::{Duration, Instant};

#[derive(Error, Debug)]
pub enum Error {
    /// The client could not be brought up within the readiness budget.
    #[error("connection to {url} not ready after {attempts} attempts ({elapsed:?})")]
    NotReady {
        url: Arc<str>,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Option<backend::Error>,
    },

    /// A single probe failed.
    #[error("probe failed for {url}")]
    Unhealthy {
        url: Arc<str>,
        #[source]
        source: Option<backend::Error>,
    },
}

/// Wraps one underlying client handle.
///
/// The handle is absent until [Connection::wait_for_ready] succeeds, and
/// `ready` tracks the outcome of the most recent probe. Constructing a
/// `Connection` performs no I/O.
///
/// All methods take `&self`: the handle slot is internally locked (briefly,
/// never across I/O) so the health loop can probe a connection without
/// holding any pool-level lock.
pub struct Connection<C: Client> {
    target: Target,
    connector: SharedConnector<C>,
    client: Mutex<Option<Arc<C>>>,
    ready: AtomicBool,
}

impl<C: Client> Connection<C> {
    pub fn new(target: Target, connector: SharedConnector<C>) -> Self {
        Self {
            target,
            connector,
            client: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &Arc<str> {
        &self.target.url
    }

    /// True iff the most recent probe succeeded.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Brings the underlying client up, retrying with backed-off delays.
    ///
    /// Each attempt constructs the client if absent and then probes it. On
    /// success the handle is retained, `ready` is set, and the elapsed time
    /// is returned. On exhaustion (attempt ceiling or overall budget) any
    /// partial client is discarded and `ready` remains false.
    pub async fn wait_for_ready(
        &self,
        timeout: Duration,
        step: Duration,
        max_retries: u32,
    ) -> Result<Duration, Error> {
        let start = Instant::now();
        let mut schedule = RetrySchedule::new(step);
        let mut attempts = 0;

        loop {
            match self.try_once().await {
                Ok(()) => {
                    let elapsed = start.elapsed();
                    tracing::info!(
                        url = %self.target.url,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "connection ready",
                    );
                    return Ok(elapsed);
                }
                Err(err) => {
                    attempts += 1;
                    self.discard().await;
                    tracing::debug!(
                        url = %self.target.url,
                        attempt = attempts,
                        error = %err,
                        "connection attempt failed",
                    );
                    if attempts >= max_retries || start.elapsed() > timeout {
                        return Err(Error::NotReady {
                            url: self.target.url.clone(),
                            attempts,
                            elapsed: start.elapsed(),
                            source: Some(err),
                        });
                    }
                    tokio::time::sleep(schedule.next_delay()).await;
                }
            }
        }
    }

    /// Issues a single probe on the current client.
    ///
    /// Never retries. Success sets `ready`; any failure (including an absent
    /// client) clears it and returns [Error::Unhealthy].
    pub async fn health_check(&self) -> Result<(), Error> {
        let client = self.client.lock().unwrap().clone();
        let Some(client) = client else {
            self.ready.store(false, Ordering::SeqCst);
            return Err(Error::Unhealthy {
                url: self.target.url.clone(),
                source: None,
            });
        };

        match client.ping().await {
            Ok(()) => {
                self.ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.ready.store(false, Ordering::SeqCst);
                Err(Error::Unhealthy {
                    url: self.target.url.clone(),
                    source: Some(err),
                })
            }
        }
    }

    /// Returns the current client handle.
    pub fn client(&self) -> Result<Arc<C>, Error> {
        self.client
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::NotReady {
                url: self.target.url.clone(),
                attempts: 0,
                elapsed: Duration::ZERO,
                source: None,
            })
    }

    /// Releases the underlying client. Safe to call repeatedly.
    pub async fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let client = self.client.lock().unwrap().take();
        if let Some(client) = client {
            client.close().await;
            tracing::debug!(url = %self.target.url, "connection closed");
        }
    }

    // One connect-then-probe attempt. The client is installed before the
    // probe so a concurrent `client()` observer sees it only if we keep it;
    // `discard` removes it on failure.
    async fn try_once(&self) -> Result<(), backend::Error> {
        let existing = self.client.lock().unwrap().clone();
        let client = match existing {
            Some(client) => client,
            None => {
                let client = Arc::new(self.connector.connect(&self.target).await?);
                *self.client.lock().unwrap() = Some(client.clone());
                client
            }
        };
        client.ping().await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn discard(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let client = self.client.lock().unwrap().take();
        if let Some(client) = client {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestConnector;
    use tokio::time;

    fn connection(connector: &Arc<TestConnector>) -> Connection<crate::test_utils::TestClient> {
        Connection::new(
            TestConnector::target("redis://unit"),
            connector.clone() as SharedConnector<_>,
        )
    }

    #[tokio::test]
    async fn ready_after_first_attempt() {
        let connector = TestConnector::new();
        let conn = connection(&connector);

        let elapsed = conn
            .wait_for_ready(Duration::from_secs(1), Duration::from_millis(10), 5)
            .await
            .unwrap();
        assert!(elapsed < Duration::from_secs(1));
        assert!(conn.is_ready());
        assert_eq!(connector.connect_count(), 1);
        conn.client().unwrap();
    }

    #[tokio::test]
    async fn retries_until_server_accepts() {
        time::pause();
        let connector = TestConnector::new();
        connector.fail_connects(2);
        let conn = connection(&connector);

        conn.wait_for_ready(Duration::from_secs(30), Duration::from_millis(10), 5)
            .await
            .unwrap();
        assert!(conn.is_ready());
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test]
    async fn exhausts_retries() {
        time::pause();
        let connector = TestConnector::new();
        connector.fail_connects(u32::MAX);
        let conn = connection(&connector);

        let err = conn
            .wait_for_ready(Duration::from_secs(30), Duration::from_millis(10), 3)
            .await
            .unwrap_err();
        let Error::NotReady { attempts, .. } = err else {
            panic!("expected NotReady, got {err}");
        };
        assert_eq!(attempts, 3);
        assert!(!conn.is_ready());
        assert!(conn.client().is_err());
    }

    #[tokio::test]
    async fn probe_failure_clears_ready() {
        let connector = TestConnector::new();
        let conn = connection(&connector);
        conn.wait_for_ready(Duration::from_secs(1), Duration::from_millis(10), 5)
            .await
            .unwrap();

        connector.fail_pings_forever(true);
        assert!(conn.health_check().await.is_err());
        assert!(!conn.is_ready());

        connector.fail_pings_forever(false);
        conn.health_check().await.unwrap();
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let connector = TestConnector::new();
        let conn = connection(&connector);
        conn.wait_for_ready(Duration::from_secs(1), Duration::from_millis(10), 5)
            .await
            .unwrap();

        conn.close().await;
        conn.close().await;
        assert!(!conn.is_ready());
        assert!(conn.client().is_err());
        assert_eq!(connector.close_count(), 1);
    }

    #[tokio::test]
    async fn probe_without_client_is_unhealthy() {
        let connector = TestConnector::new();
        let conn = connection(&connector);
        assert!(matches!(
            conn.health_check().await,
            Err(Error::Unhealthy { .. })
        ));
    }
}
