//! Scoped borrowing of pooled connections.

use std::ops::{Deref, DerefMut};

use crate::connection::ConnectionFactory;
use crate::lifecycle::ConnectionMetadata;
use crate::pool::{Lease, Pool};

/// A connection borrowed from a [`Pool`].
///
/// The connection goes back to the pool when the guard is dropped, on every
/// exit path including early returns, `?` and panics. Dropping can't await,
/// so the return probe runs on a spawned task; call
/// [`release`](Self::release) to wait for it instead.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Pool<F>,
    lease: Option<Lease<F::Connection>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(pool: Pool<F>, lease: Lease<F::Connection>) -> Self {
        Self {
            pool,
            lease: Some(lease),
        }
    }

    /// Metadata tracked by the pool for this connection.
    #[must_use]
    pub fn metadata(&self) -> Option<&ConnectionMetadata> {
        self.lease.as_ref().map(Lease::metadata)
    }

    /// Return the connection to the pool and wait until it is checked in.
    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.return_connection(lease).await;
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Self::Target {
        // Only `release` and `drop` take the lease, and both consume the guard.
        self.lease.as_ref().expect("connection already returned")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.lease.as_mut().expect("connection already returned")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        self.pool.release_slot();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    pool.check_in(lease).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    id = lease.id(),
                    "no async runtime to return connection on, dropping it"
                );
                self.pool.discard(lease);
            }
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}
