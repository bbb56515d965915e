//! Connector and pool configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default number of connections kept by a pool.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Default timeout for opening and probing a connection.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of connection attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default time to wait for an idle pooled connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variables read by [`Config::from_env`].
pub mod env {
    /// Endpoint address of the cluster.
    pub const URI: &str = "ZILLIZ_CLOUD_URI";
    /// API token used to authenticate.
    pub const TOKEN: &str = "ZILLIZ_CLOUD_TOKEN";
    /// Pool capacity.
    pub const POOL_SIZE: &str = "ZILLIZ_POOL_SIZE";
    /// Connection timeout in seconds.
    pub const CONNECTION_TIMEOUT: &str = "ZILLIZ_TIMEOUT";
    /// Number of connection attempts.
    pub const MAX_RETRIES: &str = "ZILLIZ_MAX_RETRIES";
    /// Idle connection wait in seconds.
    pub const ACQUIRE_TIMEOUT: &str = "ZILLIZ_ACQUIRE_TIMEOUT";
    /// `create` or `fail`.
    pub const OVERFLOW_POLICY: &str = "ZILLIZ_OVERFLOW_POLICY";
}

/// Retry policy for establishing connections.
///
/// Attempts are numbered from zero. After a failed attempt `i` that is not
/// the last one, the dialer waits [`backoff_for_attempt(i)`] before trying
/// again, so the default policy waits 1s then 2s across three attempts.
///
/// [`backoff_for_attempt(i)`]: RetryPolicy::backoff_for_attempt
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of connection attempts (default: 3).
    pub max_retries: u32,
    /// Backoff before the second attempt; the unit of the schedule (default: 1s).
    pub initial_backoff: Duration,
    /// Multiplier applied per attempt (default: 2.0).
    pub backoff_multiplier: f64,
    /// Upper bound for a single backoff (default: 60s).
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of connection attempts.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the backoff unit.
    #[must_use]
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the maximum backoff.
    #[must_use]
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    /// Calculate the wait that follows failed attempt `attempt`.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            // Near `Duration::MAX` the f64 round trip overshoots.
            Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
        } else {
            Duration::ZERO
        }
    }

    /// Check if another attempt follows failed attempt `attempt`.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_retries
    }
}

/// What the pool does when no idle connection shows up in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Create an unpooled overflow connection for the borrower.
    ///
    /// Under sustained contention the number of live connections can grow
    /// past the pool capacity.
    #[default]
    Create,
    /// Fail the acquisition with [`Error::AcquisitionTimeout`].
    Fail,
}

impl FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" | "overflow" => Ok(Self::Create),
            "fail" | "error" => Ok(Self::Fail),
            other => Err(Error::Configuration(format!(
                "invalid OVERFLOW_POLICY: {other} (expected create or fail)"
            ))),
        }
    }
}

/// Configuration for connecting to a Zilliz Cloud cluster.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// later. Use [`Config::default()`] with the builder methods, or one of the
/// loaders, to construct instances.
#[derive(Clone)]
#[non_exhaustive]
pub struct Config {
    /// Endpoint address (required).
    pub uri: String,

    /// Authentication token (required).
    pub token: String,

    /// Number of connections the pool keeps idle.
    pub pool_size: usize,

    /// Timeout for one open-and-probe attempt.
    pub connection_timeout: Duration,

    /// How connection attempts are retried.
    pub retry: RetryPolicy,

    /// Default wait for an idle pooled connection.
    pub acquire_timeout: Duration,

    /// Behavior when the wait for an idle connection expires.
    pub overflow: OverflowPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: String::new(),
            token: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            retry: RetryPolicy::default(),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("uri", &self.uri)
            .field("token", &redact(&self.token))
            .field("pool_size", &self.pool_size)
            .field("connection_timeout", &self.connection_timeout)
            .field("retry", &self.retry)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("overflow", &self.overflow)
            .finish()
    }
}

pub(crate) fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "********" }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint address.
    #[must_use]
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Set the authentication token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Set the pool capacity.
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the open-and-probe timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the number of connection attempts.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.retry.max_retries = max;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the default wait for an idle pooled connection.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the overflow policy.
    #[must_use]
    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    /// Load configuration from the process environment.
    ///
    /// See [`env`] for the variable names.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary provider.
    ///
    /// `lookup` is called with the names in [`env`]; unset keys keep their
    /// defaults. The result is validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(uri) = get(env::URI) {
            config.uri = uri.trim().to_string();
        }
        if let Some(token) = get(env::TOKEN) {
            config.token = token.trim().to_string();
        }
        if let Some(size) = get(env::POOL_SIZE) {
            config.pool_size = parse_number("POOL_SIZE", &size)?;
        }
        if let Some(secs) = get(env::CONNECTION_TIMEOUT) {
            config.connection_timeout = Duration::from_secs(parse_number("CONNECTION_TIMEOUT", &secs)?);
        }
        if let Some(retries) = get(env::MAX_RETRIES) {
            config.retry.max_retries = parse_number("MAX_RETRIES", &retries)?;
        }
        if let Some(secs) = get(env::ACQUIRE_TIMEOUT) {
            config.acquire_timeout = Duration::from_secs(parse_number("ACQUIRE_TIMEOUT", &secs)?);
        }
        if let Some(policy) = get(env::OVERFLOW_POLICY) {
            config.overflow = policy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a connection string into configuration.
    ///
    /// ```text
    /// uri=https://in03-xxxx.api.gcp-us-west1.zillizcloud.com;token=db_admin:secret;pool_size=5
    /// ```
    ///
    /// Keys are case-insensitive. Timeouts are in seconds.
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Configuration(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "uri" | "endpoint" | "url" => config.uri = value.to_string(),
                "token" | "api key" | "api_key" => config.token = value.to_string(),
                "pool_size" | "pool size" => {
                    config.pool_size = parse_number("POOL_SIZE", value)?;
                }
                "timeout" | "connection_timeout" | "connection timeout" => {
                    config.connection_timeout =
                        Duration::from_secs(parse_number("CONNECTION_TIMEOUT", value)?);
                }
                "max_retries" | "retries" | "max retries" => {
                    config.retry.max_retries = parse_number("MAX_RETRIES", value)?;
                }
                "acquire_timeout" | "acquire timeout" => {
                    config.acquire_timeout =
                        Duration::from_secs(parse_number("ACQUIRE_TIMEOUT", value)?);
                }
                "overflow" | "overflow_policy" => config.overflow = value.parse()?,
                _ => {
                    tracing::debug!(key = %key, "ignoring unknown connection string key");
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Every missing required field is named in the error.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.uri.trim().is_empty() {
            missing.push("URI");
        }
        if self.token.trim().is_empty() {
            missing.push("TOKEN");
        }
        if !missing.is_empty() {
            return Err(Error::Configuration(format!(
                "missing required field(s): {}",
                missing.join(", ")
            )));
        }
        if self.retry.max_retries == 0 {
            return Err(Error::Configuration(
                "MAX_RETRIES must be greater than 0".into(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::Configuration(
                "CONNECTION_TIMEOUT must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid {name}: {value}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.overflow, OverflowPolicy::Create);
    }

    #[test]
    fn test_config_builder_methods() {
        let config = Config::new()
            .uri("https://cluster.example.com")
            .token("secret")
            .pool_size(8)
            .connection_timeout(Duration::from_secs(5))
            .max_retries(4)
            .acquire_timeout(Duration::from_secs(2))
            .overflow(OverflowPolicy::Fail);

        assert_eq!(config.uri, "https://cluster.example.com");
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.overflow, OverflowPolicy::Fail);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_names_all_missing_fields() {
        let err = Config::new().validate().unwrap_err();
        assert!(err.to_string().contains("missing required field(s): URI, TOKEN"));

        let err = Config::new().uri("https://x").validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("TOKEN"));
        assert!(!msg.contains("URI,"));
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let err = Config::new()
            .uri("https://x")
            .token("t")
            .max_retries(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("MAX_RETRIES"));
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = Config::from_lookup(lookup(&[
            (env::URI, "https://cluster.example.com:19530"),
            (env::TOKEN, "db_admin:pw"),
            (env::POOL_SIZE, "7"),
            (env::CONNECTION_TIMEOUT, "12"),
            (env::MAX_RETRIES, "5"),
            (env::OVERFLOW_POLICY, "fail"),
        ]))
        .unwrap();

        assert_eq!(config.uri, "https://cluster.example.com:19530");
        assert_eq!(config.token, "db_admin:pw");
        assert_eq!(config.pool_size, 7);
        assert_eq!(config.connection_timeout, Duration::from_secs(12));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.overflow, OverflowPolicy::Fail);
    }

    #[test]
    fn test_from_lookup_empty_values_count_as_missing() {
        let err = Config::from_lookup(lookup(&[(env::URI, ""), (env::TOKEN, "  ")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("URI, TOKEN"));
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let err = Config::from_lookup(lookup(&[
            (env::URI, "https://x"),
            (env::TOKEN, "t"),
            (env::POOL_SIZE, "five"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("invalid POOL_SIZE: five"));
    }

    #[test]
    fn test_from_connection_string() {
        let config = Config::from_connection_string(
            "URI=https://cluster.example.com;Token=a=b;pool_size=3;timeout=10;retries=2;overflow=fail",
        )
        .unwrap();

        assert_eq!(config.uri, "https://cluster.example.com");
        assert_eq!(config.token, "a=b");
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.overflow, OverflowPolicy::Fail);
    }

    #[test]
    fn test_from_connection_string_malformed_pair() {
        let err = Config::from_connection_string("uri").unwrap_err();
        assert!(err.to_string().contains("invalid key-value"));
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = Config::new().uri("https://x").token("super-secret");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("********"));
    }

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!("Create".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Create);
        assert_eq!("fail".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Fail);
        assert!("sometimes".parse::<OverflowPolicy>().is_err());
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_policy_backoff_is_exponential() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_policy_backoff_capped() {
        let policy = RetryPolicy::new().max_backoff(Duration::from_secs(5));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.backoff_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_backoff_near_duration_max() {
        let policy = RetryPolicy::new().max_backoff(Duration::MAX);
        assert_eq!(policy.backoff_for_attempt(100), Duration::MAX);
        assert_eq!(policy.backoff_for_attempt(u32::MAX), Duration::MAX);
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::new().max_retries(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }
}
