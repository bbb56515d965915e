//! # zilliz-connect
//!
//! Resilient connection management for a remote Zilliz Cloud / Milvus
//! service.
//!
//! The crate does not speak any wire protocol itself. A
//! [`ConnectionFactory`] opens sessions and every [`Connection`] exposes a
//! cheap liveness probe; everything here is built on those two calls.
//!
//! ## Features
//!
//! - [`Connector`]: one lazily created, shared connection with
//!   connect-with-retry, health checks and forced reconnects
//! - [`Pool`]: a bounded idle queue of connections served to concurrent
//!   borrowers, validated on checkout and on return
//! - [`PooledConnection`]: scoped borrow that always hands the connection
//!   back, including on `?` and panics
//! - [`StatusReporter`]: health/status snapshot for external monitoring
//! - Exponential backoff through a swappable [`BackoffTimer`], with optional
//!   cancellation
//!
//! ## Example
//!
//! ```rust,ignore
//! use zilliz_connect::{Config, Pool, StatusReporter};
//!
//! let config = Config::from_env()?;
//! let pool = Pool::new(config, factory).await?;
//!
//! {
//!     let conn = pool.acquire().await?;
//!     conn.probe().await?;
//!     // Connection returned to the pool on drop
//! }
//!
//! let report = StatusReporter::new().with_pool(&pool).report().await;
//! println!("{}", report.to_json()?);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod borrow;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod retry;
pub mod status;

pub use borrow::PooledConnection;
pub use config::{Config, OverflowPolicy, RetryPolicy};
pub use connection::{Connection, ConnectionFactory, Endpoint, ProbeInfo, TransportError};
pub use connector::Connector;
pub use error::{Error, Result};
pub use lifecycle::{ConnectionMetadata, ConnectionOrigin, ConnectionState};
pub use pool::{Lease, Pool, PoolBuilder, PoolStatus};
pub use retry::{BackoffTimer, TokioTimer};
pub use status::{HealthSource, HealthState, HealthStatus, PoolStatusSource, StatusReport, StatusReporter};
pub use tokio_util::sync::CancellationToken;
