//! Health and status snapshots for external monitoring.
//!
//! [`StatusReporter`] composes a [`Connector`]'s health check and a
//! [`Pool`]'s counters into one [`StatusReport`]. It keeps no state of its
//! own and never mutates what it observes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::connection::ConnectionFactory;
use crate::connector::Connector;
use crate::pool::{Pool, PoolStatus};

/// Coarse health of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// The liveness probe succeeded.
    Healthy,
    /// The probe failed or there was nothing to probe.
    Unhealthy,
}

/// Result of probing a connection.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall verdict.
    pub state: HealthState,
    /// When the probe finished.
    pub timestamp: DateTime<Utc>,
    /// Endpoint address, shortened for display.
    pub uri: String,
    /// Time spent probing.
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Duration,
    /// Number of resources the probe listed, when healthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_count: Option<usize>,
    /// Failure detail, when unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    /// Create a successful health status.
    pub fn healthy(uri: impl Into<String>, latency: Duration, resource_count: usize) -> Self {
        Self {
            state: HealthState::Healthy,
            timestamp: Utc::now(),
            uri: uri.into(),
            latency,
            resource_count: Some(resource_count),
            error: None,
        }
    }

    /// Create a failed health status.
    pub fn unhealthy(uri: impl Into<String>, latency: Duration, error: impl Into<String>) -> Self {
        Self {
            state: HealthState::Unhealthy,
            timestamp: Utc::now(),
            uri: uri.into(),
            latency,
            resource_count: None,
            error: Some(error.into()),
        }
    }

    /// Check if the probe succeeded.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

fn serialize_millis<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX))
}

/// Something that can report its connection health.
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Probe and report; never fails.
    async fn health(&self) -> HealthStatus;
}

#[async_trait]
impl<F: ConnectionFactory> HealthSource for Connector<F> {
    async fn health(&self) -> HealthStatus {
        self.health_check().await
    }
}

/// Something that can report pool counters.
pub trait PoolStatusSource: Send + Sync {
    /// Snapshot of the pool counters.
    fn pool_status(&self) -> PoolStatus;
}

impl<F: ConnectionFactory> PoolStatusSource for Pool<F> {
    fn pool_status(&self) -> PoolStatus {
        self.status()
    }
}

/// Combined snapshot of connector health and pool status.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Unhealthy if the connector is unhealthy or the pool is closed.
    pub state: HealthState,
    /// When the report was assembled.
    pub timestamp: DateTime<Utc>,
    /// Connector health, if a connector was attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector: Option<HealthStatus>,
    /// Pool status, if a pool was attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
}

impl StatusReport {
    /// Check if every attached component is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    /// Render the report as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Builds [`StatusReport`]s from borrowed components.
///
/// ```rust,ignore
/// let report = StatusReporter::new()
///     .with_connector(&connector)
///     .with_pool(&pool)
///     .report()
///     .await;
/// ```
#[derive(Default)]
pub struct StatusReporter<'a> {
    connector: Option<&'a dyn HealthSource>,
    pool: Option<&'a dyn PoolStatusSource>,
}

impl<'a> StatusReporter<'a> {
    /// Create a reporter with nothing attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Include connector health in the report.
    #[must_use]
    pub fn with_connector(mut self, connector: &'a dyn HealthSource) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Include pool status in the report.
    #[must_use]
    pub fn with_pool(mut self, pool: &'a dyn PoolStatusSource) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Assemble a report.
    pub async fn report(&self) -> StatusReport {
        let connector = match self.connector {
            Some(source) => Some(source.health().await),
            None => None,
        };
        let pool = self.pool.map(|source| source.pool_status());

        let connector_ok = connector.as_ref().is_none_or(HealthStatus::is_healthy);
        let pool_ok = pool.as_ref().is_none_or(|status| !status.closed);
        let state = if connector_ok && pool_ok {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };

        StatusReport {
            state,
            timestamp: Utc::now(),
            connector,
            pool,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_healthy() {
        let status = HealthStatus::healthy("https://x", Duration::from_millis(5), 3);
        assert!(status.is_healthy());
        assert_eq!(status.resource_count, Some(3));
        assert!(status.error.is_none());
    }

    #[test]
    fn test_health_status_unhealthy() {
        let status = HealthStatus::unhealthy("https://x", Duration::from_millis(1000), "timeout");
        assert!(!status.is_healthy());
        assert_eq!(status.error.as_deref(), Some("timeout"));
        assert!(status.resource_count.is_none());
    }

    #[test]
    fn test_health_status_serialization() {
        let status = HealthStatus::healthy("https://x", Duration::from_millis(42), 2);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "healthy");
        assert_eq!(value["latency_ms"], 42);
        assert_eq!(value["resource_count"], 2);
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_empty_reporter_is_healthy() {
        let report = StatusReporter::new().report().await;
        assert!(report.is_healthy());
        assert!(report.connector.is_none());
        assert!(report.pool.is_none());
    }
}
