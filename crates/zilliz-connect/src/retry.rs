//! Connect-with-retry and the backoff scheduler.
//!
//! Both the [`Connector`](crate::Connector) and the [`Pool`](crate::Pool)
//! manufacture connections through the same [`Dialer`]: open a session,
//! probe it, and on failure wait out an exponential backoff before the next
//! attempt. Waiting goes through a [`BackoffTimer`] so the schedule can be
//! observed in tests or replaced entirely, and an optional
//! [`CancellationToken`] aborts the loop between attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetryPolicy};
use crate::connection::{Connection, ConnectionFactory, Endpoint, TransportError};
use crate::error::{Error, Result};

/// Waits out the delay between two connection attempts.
#[async_trait]
pub trait BackoffTimer: Send + Sync + 'static {
    /// Suspend the caller for `delay`.
    async fn wait(&self, delay: Duration);
}

/// [`BackoffTimer`] backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl BackoffTimer for TokioTimer {
    async fn wait(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Opens validated connections under a retry policy.
pub(crate) struct Dialer<F> {
    factory: F,
    endpoint: Endpoint,
    retry: RetryPolicy,
    timer: Arc<dyn BackoffTimer>,
    cancel: Option<CancellationToken>,
}

impl<F: ConnectionFactory> Dialer<F> {
    pub(crate) fn new(config: &Config, factory: F) -> Self {
        Self {
            factory,
            endpoint: Endpoint::from_config(config),
            retry: config.retry.clone(),
            timer: Arc::new(TokioTimer),
            cancel: None,
        }
    }

    pub(crate) fn set_timer(&mut self, timer: Arc<dyn BackoffTimer>) {
        self.timer = timer;
    }

    pub(crate) fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = Some(token);
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Open and probe a new connection, retrying with backoff.
    ///
    /// Makes at most `max_retries` attempts and never waits after the last
    /// one. The error carries the cause of the final attempt.
    pub(crate) async fn dial(&self) -> Result<F::Connection> {
        let attempts = self.retry.max_retries.max(1);
        let mut attempt = 0;

        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }

            tracing::info!(
                uri = %self.endpoint.display_uri(),
                attempt = attempt + 1,
                max_attempts = attempts,
                "connecting"
            );

            match self.try_open().await {
                Ok(conn) => {
                    tracing::info!(attempt = attempt + 1, max_attempts = attempts, "connected");
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "connection attempt failed"
                    );
                    if attempt + 1 >= attempts {
                        tracing::error!(attempts, error = %e, "all connection attempts failed");
                        return Err(Error::ConnectionExhausted {
                            attempts,
                            source: e,
                        });
                    }
                }
            }

            let delay = self.retry.backoff_for_attempt(attempt);
            tracing::debug!(delay = ?delay, "backing off before next attempt");
            self.pause(delay).await?;
            attempt += 1;
        }
    }

    async fn try_open(&self) -> Result<F::Connection, TransportError> {
        let attempt = async {
            let conn = self.factory.open(&self.endpoint).await?;
            let info = conn.probe().await?;
            tracing::debug!(resources = info.resource_count(), "connection validated");
            Ok::<_, TransportError>(conn)
        };

        match tokio::time::timeout(self.endpoint.timeout, attempt).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::info!("connection retry cancelled");
                        Err(Error::Cancelled)
                    }
                    () = self.timer.wait(delay) => Ok(()),
                }
            }
            None => {
                self.timer.wait(delay).await;
                Ok(())
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::connection::ProbeInfo;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Session;

    #[async_trait]
    impl Connection for Session {
        async fn probe(&self) -> Result<ProbeInfo, TransportError> {
            Ok(ProbeInfo::new(["items"]))
        }
    }

    /// Fails the first `failures` opens.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ConnectionFactory for Flaky {
        type Connection = Session;

        async fn open(&self, _endpoint: &Endpoint) -> Result<Session, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(format!("refused #{call}").into())
            } else {
                Ok(Session)
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Duration>>);

    #[async_trait]
    impl BackoffTimer for Arc<Recorder> {
        async fn wait(&self, delay: Duration) {
            self.0.lock().push(delay);
        }
    }

    fn dialer(failures: u32) -> (Dialer<Flaky>, Arc<Recorder>) {
        let config = Config::new().uri("https://x").token("t");
        let mut dialer = Dialer::new(
            &config,
            Flaky {
                failures,
                calls: AtomicU32::new(0),
            },
        );
        let recorder = Arc::new(Recorder::default());
        dialer.set_timer(Arc::new(Arc::clone(&recorder)));
        (dialer, recorder)
    }

    #[tokio::test]
    async fn test_dial_first_attempt() {
        let (dialer, recorder) = dialer(0);
        tokio_test::assert_ok!(dialer.dial().await);
        assert!(recorder.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dial_exhausts_and_keeps_last_cause() {
        let (dialer, recorder) = dialer(u32::MAX);
        let err = dialer.dial().await.unwrap_err();
        match err {
            Error::ConnectionExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "refused #2");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dialer.factory.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *recorder.0.lock(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_dial_cancelled_before_first_attempt() {
        let (mut dialer, _) = dialer(0);
        let token = CancellationToken::new();
        token.cancel();
        dialer.set_cancellation(token);
        assert!(matches!(dialer.dial().await, Err(Error::Cancelled)));
        assert_eq!(dialer.factory.calls.load(Ordering::SeqCst), 0);
    }
}
