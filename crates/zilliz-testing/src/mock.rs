//! Mock connection factory.
//!
//! [`MockFactory`] opens [`MockConnection`]s in memory. Failures are
//! scripted: the factory can refuse a number of opens or become unreachable,
//! and every connection it has opened can be broken or made to hang through
//! its [`MockHandle`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use zilliz_connect::{Connection, ConnectionFactory, Endpoint, ProbeInfo, TransportError};

/// Errors produced by mock connections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockError {
    /// The factory refused to open a connection.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The connection was broken from the outside.
    #[error("connection {0} is broken")]
    Broken(u64),
}

#[derive(Debug)]
struct HandleState {
    id: u64,
    healthy: AtomicBool,
    hanging: AtomicBool,
    probes: AtomicU32,
}

/// Remote control for one [`MockConnection`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<HandleState>,
}

impl MockHandle {
    fn new(id: u64, healthy: bool) -> Self {
        Self {
            state: Arc::new(HandleState {
                id,
                healthy: AtomicBool::new(healthy),
                hanging: AtomicBool::new(false),
                probes: AtomicU32::new(0),
            }),
        }
    }

    /// Identifier of the connection, in open order starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Make every later probe fail.
    pub fn break_connection(&self) {
        self.state.healthy.store(false, Ordering::SeqCst);
    }

    /// Make probes succeed again.
    pub fn restore(&self) {
        self.state.healthy.store(true, Ordering::SeqCst);
        self.state.hanging.store(false, Ordering::SeqCst);
    }

    /// Make every later probe wait forever.
    pub fn hang(&self) {
        self.state.hanging.store(true, Ordering::SeqCst);
    }

    /// Check whether probes currently succeed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }

    /// Number of probes issued against the connection.
    #[must_use]
    pub fn probe_count(&self) -> u32 {
        self.state.probes.load(Ordering::SeqCst)
    }
}

/// In-memory connection opened by [`MockFactory`].
#[derive(Debug)]
pub struct MockConnection {
    handle: MockHandle,
    resources: Arc<Vec<String>>,
}

impl MockConnection {
    /// Identifier of the connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Remote control for this connection.
    #[must_use]
    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn probe(&self) -> Result<ProbeInfo, TransportError> {
        let state = &self.handle.state;
        state.probes.fetch_add(1, Ordering::SeqCst);

        if state.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !state.healthy.load(Ordering::SeqCst) {
            return Err(MockError::Broken(state.id).into());
        }
        Ok(ProbeInfo::new(self.resources.iter()))
    }
}

#[derive(Debug)]
struct FactoryState {
    unreachable: AtomicBool,
    fail_next: AtomicU32,
    new_healthy: AtomicBool,
    open_calls: AtomicU32,
    next_id: AtomicU64,
    open_delay: Mutex<Option<Duration>>,
    resources: Arc<Vec<String>>,
    handles: Mutex<Vec<MockHandle>>,
}

/// Scriptable [`ConnectionFactory`].
///
/// Clones share state, so a test keeps one clone to steer the factory after
/// moving the other into a connector or pool.
#[derive(Debug, Clone)]
pub struct MockFactory {
    state: Arc<FactoryState>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFactory {
    /// Create a reachable factory whose connections list two collections.
    #[must_use]
    pub fn new() -> Self {
        Self::with_resources(["documents", "embeddings"])
    }

    /// Create a factory whose probes list `resources`.
    #[must_use]
    pub fn with_resources<I, S>(resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(FactoryState {
                unreachable: AtomicBool::new(false),
                fail_next: AtomicU32::new(0),
                new_healthy: AtomicBool::new(true),
                open_calls: AtomicU32::new(0),
                next_id: AtomicU64::new(1),
                open_delay: Mutex::new(None),
                resources: Arc::new(resources.into_iter().map(Into::into).collect()),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Refuse the next `n` opens.
    pub fn fail_next(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every open until set back to `false`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Whether newly opened connections pass their probe.
    pub fn set_new_connections_healthy(&self, healthy: bool) {
        self.state.new_healthy.store(healthy, Ordering::SeqCst);
    }

    /// Delay every open by `delay` on the tokio clock.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.state.open_delay.lock() = delay;
    }

    /// Number of open calls so far, failed ones included.
    #[must_use]
    pub fn open_calls(&self) -> u32 {
        self.state.open_calls.load(Ordering::SeqCst)
    }

    /// Handles of every connection opened so far, in open order.
    #[must_use]
    pub fn handles(&self) -> Vec<MockHandle> {
        self.state.handles.lock().clone()
    }

    /// Number of connections successfully opened.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.state.handles.lock().len()
    }

    /// Break every connection opened so far.
    pub fn break_all(&self) {
        for handle in self.state.handles.lock().iter() {
            handle.break_connection();
        }
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn open(&self, endpoint: &Endpoint) -> Result<MockConnection, TransportError> {
        let state = &self.state;
        state.open_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *state.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted_failure = state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if state.unreachable.load(Ordering::SeqCst) || scripted_failure {
            tracing::debug!(uri = %endpoint.display_uri(), "mock open refused");
            return Err(MockError::Unreachable(endpoint.display_uri()).into());
        }

        let id = state.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = MockHandle::new(id, state.new_healthy.load(Ordering::SeqCst));
        state.handles.lock().push(handle.clone());
        tracing::debug!(id, "mock connection opened");

        Ok(MockConnection {
            handle,
            resources: Arc::clone(&state.resources),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("https://mock", "token", Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_open_and_probe() {
        let factory = MockFactory::new();
        let conn = factory.open(&endpoint()).await.unwrap();

        assert_eq!(conn.id(), 1);
        let info = conn.probe().await.unwrap();
        assert_eq!(info.resource_count(), 2);
        assert_eq!(conn.handle().probe_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_counts_down() {
        let factory = MockFactory::new();
        factory.fail_next(2);

        assert!(factory.open(&endpoint()).await.is_err());
        assert!(factory.open(&endpoint()).await.is_err());
        assert!(factory.open(&endpoint()).await.is_ok());
        assert_eq!(factory.open_calls(), 3);
        assert_eq!(factory.opened(), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_fails_probe() {
        let factory = MockFactory::new();
        let conn = factory.open(&endpoint()).await.unwrap();

        factory.break_all();
        let err = conn.probe().await.unwrap_err();
        assert_eq!(err.to_string(), "connection 1 is broken");

        conn.handle().restore();
        assert!(conn.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_new_connections() {
        let factory = MockFactory::new();
        factory.set_new_connections_healthy(false);
        let conn = factory.open(&endpoint()).await.unwrap();
        assert!(!conn.handle().is_healthy());
        assert!(conn.probe().await.is_err());
    }
}
