//! Connector and pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::connection::TransportError;

/// Errors that can occur while configuring, connecting or borrowing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Required configuration is missing or malformed.
    ///
    /// Raised before any network activity takes place.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Every connection attempt allowed by the retry policy failed.
    #[error("connection failed after {attempts} attempt(s): {source}")]
    ConnectionExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Cause reported by the last attempt.
        #[source]
        source: TransportError,
    },

    /// A connection failed its liveness probe.
    ///
    /// The pool recovers from this locally by discarding the connection.
    #[error("connection failed liveness probe: {0}")]
    InvalidConnection(#[source] TransportError),

    /// No idle connection became available and overflow is disabled.
    #[error("no idle connection available after {0:?}")]
    AcquisitionTimeout(Duration),

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// The connect loop was cancelled.
    #[error("connection attempt cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error may succeed when the operation is repeated later.
    ///
    /// Configuration errors and a closed pool never recover on their own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionExhausted { .. }
                | Self::InvalidConnection(_)
                | Self::AcquisitionTimeout(_)
                | Self::Cancelled
        )
    }
}

/// Result type for connector and pool operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
