//! Connection capability traits.
//!
//! The remote service is reached only through these two seams: a factory
//! that opens sessions and a liveness probe on each session. Nothing else
//! about the transport is assumed.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{Config, redact};

/// Error reported by a factory or a probe.
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Longest URI prefix shown in health reports and logs.
pub const URI_DISPLAY_LIMIT: usize = 50;

/// Outcome of a successful liveness probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeInfo {
    /// Names of the resources (collections) the server listed.
    pub resources: Vec<String>,
}

impl ProbeInfo {
    /// Create probe info from resource names.
    pub fn new<I, S>(resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of resources listed.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

/// A session with the remote service.
///
/// Implementations do not have to tolerate concurrent borrowers; the pool
/// hands each connection to at most one borrower at a time.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Cheap remote call confirming the session still works.
    ///
    /// Typically lists the collections visible to the token.
    async fn probe(&self) -> Result<ProbeInfo, TransportError>;
}

/// Opens sessions with the remote service.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connection type produced by this factory.
    type Connection: Connection;

    /// Open one logical session.
    async fn open(&self, endpoint: &Endpoint) -> Result<Self::Connection, TransportError>;
}

/// Parameters handed to [`ConnectionFactory::open`].
#[derive(Clone)]
pub struct Endpoint {
    /// Endpoint address.
    pub uri: String,
    /// Authentication token.
    pub token: String,
    /// Budget for one open-and-probe attempt.
    pub timeout: Duration,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(uri: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            token: token.into(),
            timeout,
        }
    }

    /// Build the endpoint described by a configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.uri.clone(), config.token.clone(), config.connection_timeout)
    }

    /// URI shortened for reports.
    #[must_use]
    pub fn display_uri(&self) -> String {
        truncate_uri(&self.uri)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("uri", &self.uri)
            .field("token", &redact(&self.token))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Shorten `uri` to [`URI_DISPLAY_LIMIT`] characters followed by `...`.
#[must_use]
pub fn truncate_uri(uri: &str) -> String {
    match uri.char_indices().nth(URI_DISPLAY_LIMIT) {
        Some((cut, _)) => format!("{}...", &uri[..cut]),
        None => uri.to_string(),
    }
}
