//! Bounded connection pool.
//!
//! Idle connections wait in a bounded FIFO queue. Borrowers take one, the
//! pool probes it, and hands it out; on return it is probed again and
//! re-enqueued if there is room. Connections that fail a probe, or do not
//! answer within the endpoint timeout, are dropped and never re-enqueued.
//!
//! When no idle connection shows up within the acquisition timeout the
//! default [`OverflowPolicy::Create`] opens a fresh overflow connection
//! instead of failing, so the number of live connections can exceed the
//! capacity under sustained load. [`OverflowPolicy::Fail`] turns that into
//! [`Error::AcquisitionTimeout`].

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::borrow::PooledConnection;
use crate::config::{Config, OverflowPolicy};
use crate::connection::{Connection, ConnectionFactory, TransportError};
use crate::error::{Error, Result};
use crate::lifecycle::{ConnectionMetadata, ConnectionOrigin};
use crate::retry::{BackoffTimer, Dialer, TokioTimer};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A connection checked out of a [`Pool`].
///
/// Hand it back with [`Pool::return_connection`] on the pool it came from.
/// A lease that is simply dropped stays counted as in use; use
/// [`Pool::acquire`] for a guard that always hands the connection back.
#[must_use = "a dropped lease stays counted as in use; return it to its pool"]
pub struct Lease<C> {
    conn: C,
    meta: ConnectionMetadata,
    pool_id: u64,
}

impl<C> Lease<C> {
    fn new(conn: C, id: u64, origin: ConnectionOrigin, pool_id: u64) -> Self {
        Self {
            conn,
            meta: ConnectionMetadata::new(id, origin),
            pool_id,
        }
    }

    /// Metadata tracked by the pool for this connection.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.meta
    }

    /// Identifier of the connection within its pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.meta.id
    }
}

impl<C: Connection> Lease<C> {
    async fn validate(&mut self, timeout: Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(timeout, self.conn.probe()).await {
            Ok(result) => result?,
            Err(elapsed) => return Err(elapsed.into()),
        };
        self.meta.mark_health_check();
        Ok(())
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("meta", &self.meta).finish_non_exhaustive()
    }
}

/// Status information about the pool.
///
/// A snapshot: the fields are read one after another, not atomically.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatus {
    /// Configured number of idle connections.
    pub capacity: usize,
    /// Connections waiting in the idle queue.
    pub available: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// Connections ever created, including replacements and overflow.
    pub created: u64,
    /// Connections dropped after a failed probe, a full queue or close.
    pub discarded: u64,
    /// Connections created because no idle one showed up in time.
    pub overflow_created: u64,
    /// Creation attempts that exhausted their retries.
    pub creation_failures: u64,
    /// Whether [`Pool::close_all`] has been called.
    pub closed: bool,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// Bounded FIFO of idle items.
///
/// The semaphore holds one permit per queued item, so waiting for an item is
/// waiting for a permit. Closing the semaphore wakes every waiter.
pub(crate) struct IdleQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Semaphore,
    capacity: usize,
}

impl<T> IdleQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Semaphore::new(0),
            capacity,
        }
    }

    /// Enqueue `item`, handing it back if the queue is full or closed.
    pub(crate) fn push(&self, item: T) -> std::result::Result<(), T> {
        let mut items = self.items.lock();
        if self.ready.is_closed() || items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.ready.add_permits(1);
        Ok(())
    }

    /// Wait for an item. Returns `None` once the queue is closed.
    pub(crate) async fn pop(&self) -> Option<T> {
        loop {
            let permit = self.ready.acquire().await.ok()?;
            permit.forget();
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Close the queue and take everything still in it.
    pub(crate) fn close(&self) -> Vec<T> {
        self.ready.close();
        self.items.lock().drain(..).collect()
    }
}

/// A lease being probed between the idle queue and its next owner.
///
/// If the surrounding future is dropped mid-probe the lease is reclaimed
/// instead of lost: an idle connection goes back to the queue, a returned
/// one is discarded.
struct InFlight<'a, F: ConnectionFactory> {
    inner: &'a PoolInner<F>,
    lease: Option<Lease<F::Connection>>,
}

impl<'a, F: ConnectionFactory> InFlight<'a, F> {
    fn new(inner: &'a PoolInner<F>, lease: Lease<F::Connection>) -> Self {
        Self {
            inner,
            lease: Some(lease),
        }
    }

    /// Probe the lease, discarding it when the probe fails or times out.
    async fn validate(mut self) -> Option<Lease<F::Connection>> {
        let outcome = match self.lease.as_mut() {
            Some(lease) => lease.validate(self.inner.probe_timeout()).await,
            None => return None,
        };
        let lease = self.lease.take()?;
        match outcome {
            Ok(()) => Some(lease),
            Err(e) => {
                tracing::warn!(
                    id = lease.id(),
                    error = %Error::InvalidConnection(e),
                    "dropping connection"
                );
                self.inner.discard(lease);
                None
            }
        }
    }
}

impl<F: ConnectionFactory> Drop for InFlight<'_, F> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            tracing::debug!(id = lease.id(), "probe abandoned, reclaiming connection");
            self.inner.reclaim(lease);
        }
    }
}

struct PoolInner<F: ConnectionFactory> {
    id: u64,
    dialer: Dialer<F>,
    idle: IdleQueue<Lease<F::Connection>>,
    capacity: usize,
    overflow: OverflowPolicy,
    acquire_timeout: Duration,
    next_id: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
    overflow_created: AtomicU64,
    creation_failures: AtomicU64,
    in_use: AtomicUsize,
    closed: AtomicBool,
}

/// A pool of connections to the remote service.
///
/// `Pool` is a cheap handle; clones share the same connections.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder(config, factory)
///     .overflow_policy(OverflowPolicy::Fail)
///     .build()
///     .await?;
///
/// let conn = pool.acquire().await?;
/// conn.probe().await?;
/// conn.release().await;
/// ```
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool sized by `config` and warm it up.
    pub async fn new(config: Config, factory: F) -> Result<Self> {
        Self::builder(config, factory).build().await
    }

    /// Start building a pool.
    pub fn builder(config: Config, factory: F) -> PoolBuilder<F> {
        PoolBuilder::new(config, factory)
    }

    /// Check out a connection, waiting up to the configured acquire timeout.
    pub async fn get(&self) -> Result<Lease<F::Connection>> {
        self.get_connection(self.inner.acquire_timeout).await
    }

    /// Check out a connection, waiting up to `timeout` for an idle one.
    ///
    /// An idle connection that fails its probe is dropped and replaced by a
    /// freshly opened one. If nothing becomes idle in time the overflow
    /// policy decides between opening an extra connection and failing.
    pub async fn get_connection(&self, timeout: Duration) -> Result<Lease<F::Connection>> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::PoolClosed);
        }

        let mut lease = match tokio::time::timeout(timeout, inner.idle.pop()).await {
            Ok(Some(lease)) => match InFlight::new(inner, lease).validate().await {
                Some(lease) => lease,
                None => {
                    tracing::debug!("idle connection invalid, creating a replacement");
                    inner.create(ConnectionOrigin::Replacement).await?
                }
            },
            Ok(None) => return Err(Error::PoolClosed),
            Err(_) => match inner.overflow {
                OverflowPolicy::Create => {
                    tracing::warn!(
                        timeout = ?timeout,
                        capacity = inner.capacity,
                        "no idle connection available, creating an overflow connection"
                    );
                    inner.create(ConnectionOrigin::Overflow).await?
                }
                OverflowPolicy::Fail => {
                    tracing::warn!(timeout = ?timeout, "no idle connection available");
                    return Err(Error::AcquisitionTimeout(timeout));
                }
            },
        };

        lease.meta.mark_checkout();
        inner.in_use.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(id = lease.id(), "connection checked out");
        Ok(lease)
    }

    /// Hand a connection back to the pool.
    ///
    /// The connection is probed first. A healthy connection goes back into
    /// the idle queue if there is room and is dropped otherwise; an
    /// unhealthy one is always dropped. A lease checked out of another pool
    /// is dropped without touching this pool's counters.
    pub async fn return_connection(&self, lease: Lease<F::Connection>) {
        if lease.pool_id != self.inner.id {
            tracing::warn!(
                id = lease.id(),
                "connection returned to a pool it was not checked out of, dropping it"
            );
            return;
        }
        self.inner.release_slot();
        self.inner.check_in(lease).await;
    }

    /// Check out a connection wrapped in a guard that returns it on drop.
    pub async fn acquire(&self) -> Result<PooledConnection<F>> {
        self.acquire_timeout(self.inner.acquire_timeout).await
    }

    /// Like [`acquire`](Self::acquire) with an explicit wait.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<F>> {
        let lease = self.get_connection(timeout).await?;
        Ok(PooledConnection::new(self.clone(), lease))
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        PoolStatus {
            capacity: inner.capacity,
            available: inner.idle.len(),
            in_use: inner.in_use.load(Ordering::Acquire),
            created: inner.created.load(Ordering::Acquire),
            discarded: inner.discarded.load(Ordering::Acquire),
            overflow_created: inner.overflow_created.load(Ordering::Acquire),
            creation_failures: inner.creation_failures.load(Ordering::Acquire),
            closed: inner.is_closed(),
            timestamp: Utc::now(),
        }
    }

    /// Close the pool, dropping every idle connection.
    ///
    /// Returns the number of connections dropped. Borrowed connections are
    /// not reclaimed; they are dropped when they come back. Waiting
    /// borrowers and later calls fail with [`Error::PoolClosed`].
    pub fn close_all(&self) -> usize {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);
        let drained = inner.idle.close();
        let count = drained.len();
        for lease in drained {
            inner.discard(lease);
        }
        tracing::info!(closed = count, "connection pool closed");
        count
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Configured number of idle connections.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub(crate) fn release_slot(&self) {
        self.inner.release_slot();
    }

    pub(crate) async fn check_in(&self, lease: Lease<F::Connection>) {
        self.inner.check_in(lease).await;
    }

    pub(crate) fn discard(&self, lease: Lease<F::Connection>) {
        self.inner.discard(lease);
    }

    /// Fill the idle queue up to capacity.
    ///
    /// Failures are logged and counted, never returned.
    async fn initialize(&self) -> usize {
        let inner = &self.inner;
        tracing::info!(capacity = inner.capacity, "initializing connection pool");

        for n in 0..inner.capacity {
            match inner.create(ConnectionOrigin::Initial).await {
                Ok(mut lease) => {
                    lease.meta.mark_checkin();
                    if let Err(lease) = inner.idle.push(lease) {
                        inner.discard(lease);
                    }
                    tracing::debug!(created = n + 1, capacity = inner.capacity, "connection created");
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to create pooled connection");
                }
            }
        }

        let available = inner.idle.len();
        tracing::info!(
            available,
            capacity = inner.capacity,
            "connection pool initialized"
        );
        available
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn create(&self, origin: ConnectionOrigin) -> Result<Lease<F::Connection>> {
        match self.dialer.dial().await {
            Ok(conn) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.created.fetch_add(1, Ordering::AcqRel);
                if origin == ConnectionOrigin::Overflow {
                    self.overflow_created.fetch_add(1, Ordering::AcqRel);
                }
                Ok(Lease::new(conn, id, origin, self.id))
            }
            Err(e) => {
                self.creation_failures.fetch_add(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn probe_timeout(&self) -> Duration {
        self.dialer.endpoint().timeout
    }

    async fn check_in(&self, lease: Lease<F::Connection>) {
        if self.is_closed() {
            tracing::debug!(id = lease.id(), "pool closed, dropping returned connection");
            self.discard(lease);
            return;
        }

        let Some(mut lease) = InFlight::new(self, lease).validate().await else {
            return;
        };

        lease.meta.mark_checkin();
        match self.idle.push(lease) {
            Ok(()) => tracing::trace!("connection returned to pool"),
            Err(lease) => {
                tracing::debug!(
                    id = lease.id(),
                    overflow = lease.meta.is_overflow(),
                    "idle queue full, dropping returned connection"
                );
                self.discard(lease);
            }
        }
    }

    fn release_slot(&self) {
        let released = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            tracing::debug!("connection released with none in use, counters out of step");
        }
    }

    /// Take back a lease whose probe was abandoned.
    fn reclaim(&self, lease: Lease<F::Connection>) {
        if !lease.meta.state.is_available() {
            self.discard(lease);
            return;
        }
        if let Err(lease) = self.idle.push(lease) {
            self.discard(lease);
        }
    }

    fn discard(&self, mut lease: Lease<F::Connection>) {
        lease.meta.mark_discarded();
        self.discarded.fetch_add(1, Ordering::AcqRel);
        drop(lease);
    }
}

/// Builder for [`Pool`].
pub struct PoolBuilder<F> {
    config: Config,
    factory: F,
    timer: Arc<dyn BackoffTimer>,
    cancel: Option<CancellationToken>,
}

impl<F: ConnectionFactory> PoolBuilder<F> {
    fn new(config: Config, factory: F) -> Self {
        Self {
            config,
            factory,
            timer: Arc::new(TokioTimer),
            cancel: None,
        }
    }

    /// Set the number of idle connections to keep.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.pool_size = capacity;
        self
    }

    /// Set the overflow policy.
    #[must_use]
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.overflow = policy;
        self
    }

    /// Set the default wait used by [`Pool::get`] and [`Pool::acquire`].
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Use a custom timer for the backoff between connection attempts.
    #[must_use]
    pub fn timer(mut self, timer: impl BackoffTimer) -> Self {
        self.timer = Arc::new(timer);
        self
    }

    /// Abort connection attempts once `token` is cancelled.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validate the configuration, create the pool and warm it up.
    ///
    /// Only configuration errors fail the build; connections that cannot
    /// be created are counted and the pool starts with fewer idle ones.
    pub async fn build(self) -> Result<Pool<F>> {
        self.config.validate()?;

        let mut dialer = Dialer::new(&self.config, self.factory);
        dialer.set_timer(self.timer);
        if let Some(token) = self.cancel {
            dialer.set_cancellation(token);
        }

        let pool = Pool {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                dialer,
                idle: IdleQueue::new(self.config.pool_size),
                capacity: self.config.pool_size,
                overflow: self.config.overflow,
                acquire_timeout: self.config.acquire_timeout,
                next_id: AtomicU64::new(1),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                overflow_created: AtomicU64::new(0),
                creation_failures: AtomicU64::new(0),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        };

        pool.initialize().await;
        Ok(pool)
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("endpoint", self.inner.dialer.endpoint())
            .field("status", &self.status())
            .finish()
    }
}
