//! # zilliz-testing
//!
//! Test infrastructure for `zilliz-connect`.
//!
//! The connection manager never talks to a real service in tests. Instead a
//! [`MockFactory`] hands out [`MockConnection`]s whose health can be flipped
//! from the outside through a [`MockHandle`], and a [`RecordingTimer`]
//! captures the backoff schedule without sleeping.
//!
//! ## Example
//!
//! ```rust,ignore
//! use zilliz_testing::{MockFactory, test_config};
//! use zilliz_connect::Pool;
//!
//! #[tokio::test]
//! async fn test_with_mock_factory() {
//!     let factory = MockFactory::new();
//!     let pool = Pool::new(test_config().pool_size(2), factory.clone())
//!         .await
//!         .unwrap();
//!
//!     factory.break_all();
//!     // every idle connection now fails its probe
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;
pub mod timer;

use std::time::Duration;

use zilliz_connect::Config;

pub use mock::{MockConnection, MockError, MockFactory, MockHandle};
pub use timer::RecordingTimer;

/// Endpoint used by [`test_config`].
pub const TEST_URI: &str = "https://in01-0123456789abcdef.api.gcp-us-west1.zillizcloud.com";

/// Token used by [`test_config`].
pub const TEST_TOKEN: &str = "db_admin:test-token";

/// A complete configuration pointing at [`TEST_URI`].
///
/// Short timeouts keep paused-clock tests readable; the retry policy keeps
/// its defaults.
#[must_use]
pub fn test_config() -> Config {
    Config::new()
        .uri(TEST_URI)
        .token(TEST_TOKEN)
        .connection_timeout(Duration::from_secs(5))
        .acquire_timeout(Duration::from_secs(1))
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
