//! Single shared connection with retry, health checks and reconnects.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::{Connection, ConnectionFactory};
use crate::error::Result;
use crate::retry::{BackoffTimer, Dialer};
use crate::status::HealthStatus;

/// Owns one lazily created connection to the remote service.
///
/// The connection is shared: [`get_client`](Self::get_client) hands out
/// clones of the same `Arc`. `connect` and `reconnect` are serialized by an
/// async mutex, and the slot holding the connection is only written while
/// that mutex is held, so concurrent callers always see either the old or
/// the new connection.
///
/// # Example
///
/// ```rust,ignore
/// let connector = Connector::new(&Config::from_env()?, factory)?;
/// let client = connector.get_client().await?;
///
/// if !connector.health_check().await.is_healthy() {
///     connector.reconnect().await?;
/// }
/// ```
pub struct Connector<F: ConnectionFactory> {
    dialer: Dialer<F>,
    current: RwLock<Option<Arc<F::Connection>>>,
    connect_lock: Mutex<()>,
}

impl<F: ConnectionFactory> Connector<F> {
    /// Create a connector. No connection is opened yet.
    ///
    /// Fails with [`Error::Configuration`](crate::Error::Configuration) if
    /// the configuration is incomplete.
    pub fn new(config: &Config, factory: F) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dialer: Dialer::new(config, factory),
            current: RwLock::new(None),
            connect_lock: Mutex::new(()),
        })
    }

    /// Use a custom timer for the backoff between attempts.
    #[must_use]
    pub fn with_timer(mut self, timer: impl BackoffTimer) -> Self {
        self.dialer.set_timer(Arc::new(timer));
        self
    }

    /// Abort connect attempts once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.dialer.set_cancellation(token);
        self
    }

    /// Open a new connection and make it the current one.
    ///
    /// Retries with exponential backoff. If every attempt fails the current
    /// connection is left untouched and
    /// [`Error::ConnectionExhausted`](crate::Error::ConnectionExhausted) is
    /// returned.
    pub async fn connect(&self) -> Result<Arc<F::Connection>> {
        let _guard = self.connect_lock.lock().await;
        self.connect_locked().await
    }

    /// Return the current connection, connecting first if there is none.
    pub async fn get_client(&self) -> Result<Arc<F::Connection>> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let _guard = self.connect_lock.lock().await;
        // Another caller may have connected while we waited for the lock.
        if let Some(conn) = self.current() {
            return Ok(conn);
        }
        self.connect_locked().await
    }

    /// Probe the current connection.
    ///
    /// Never fails: probe errors, timeouts and a missing connection are all
    /// reported as an unhealthy status.
    pub async fn health_check(&self) -> HealthStatus {
        let uri = self.dialer.endpoint().display_uri();
        let Some(conn) = self.current() else {
            return HealthStatus::unhealthy(uri, std::time::Duration::ZERO, "not connected");
        };

        let started = Instant::now();
        let timeout = self.dialer.endpoint().timeout;
        match tokio::time::timeout(timeout, conn.probe()).await {
            Ok(Ok(info)) => HealthStatus::healthy(uri, started.elapsed(), info.resource_count()),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "health check failed");
                HealthStatus::unhealthy(uri, started.elapsed(), e.to_string())
            }
            Err(_) => {
                tracing::error!(timeout = ?timeout, "health check timed out");
                HealthStatus::unhealthy(
                    uri,
                    started.elapsed(),
                    format!("health probe timed out after {timeout:?}"),
                )
            }
        }
    }

    /// Drop the current connection and connect again.
    ///
    /// If the new connection cannot be established the connector is left
    /// without a connection.
    pub async fn reconnect(&self) -> Result<Arc<F::Connection>> {
        let _guard = self.connect_lock.lock().await;
        tracing::info!(uri = %self.dialer.endpoint().display_uri(), "reconnecting");
        self.current.write().take();
        self.connect_locked().await
    }

    /// Drop the current connection, if any.
    pub async fn close(&self) {
        let _guard = self.connect_lock.lock().await;
        if self.current.write().take().is_some() {
            tracing::info!("connector closed");
        }
    }

    /// Snapshot of the current connection without connecting.
    #[must_use]
    pub fn current(&self) -> Option<Arc<F::Connection>> {
        self.current.read().clone()
    }

    /// Check whether a connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current.read().is_some()
    }

    /// Endpoint address, shortened for display.
    #[must_use]
    pub fn uri(&self) -> String {
        self.dialer.endpoint().display_uri()
    }

    // Caller holds `connect_lock`.
    async fn connect_locked(&self) -> Result<Arc<F::Connection>> {
        let conn = Arc::new(self.dialer.dial().await?);
        *self.current.write() = Some(Arc::clone(&conn));
        Ok(conn)
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Connector<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("endpoint", self.dialer.endpoint())
            .field("connected", &self.is_connected())
            .finish()
    }
}
