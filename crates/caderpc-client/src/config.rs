//! Consumer configuration.

use std::time::Duration;

use caderpc_cluster::{BreakerConfig, LoadBalancerKind, RetryConfig, RetryPolicyKind};
use caderpc_common::codec::{WireCodec, DEFAULT_MAX_FRAME_LENGTH};
use caderpc_common::transport::HeartbeatConfig;
use caderpc_common::{CadeError, Result};

/// Settings for a [`Consumer`](crate::Consumer).
///
/// # Example
///
/// ```
/// use caderpc_client::ConsumerConfig;
/// use caderpc_cluster::RetryPolicyKind;
/// use std::time::Duration;
///
/// let config = ConsumerConfig::new()
///     .with_request_timeout(Duration::from_millis(500))
///     .with_retry_policy(RetryPolicyKind::Failover);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Bound on establishing a new connection
    pub connect_timeout: Duration,
    /// Bound on a single attempt, from send to response
    pub request_timeout: Duration,
    /// Bound on the whole call including retries
    pub function_timeout: Duration,
    pub load_balancer: LoadBalancerKind,
    pub retry_policy: RetryPolicyKind,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// Calls allowed in flight across all endpoints
    pub max_inflight: usize,
    /// Calls per second allowed to a single endpoint
    pub endpoint_rate: u64,
    pub serializer: String,
    pub compressor: String,
    pub heartbeat: HeartbeatConfig,
    pub max_frame_length: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            request_timeout: Duration::from_millis(3000),
            function_timeout: Duration::from_millis(10_000),
            load_balancer: LoadBalancerKind::Random,
            retry_policy: RetryPolicyKind::Same,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            max_inflight: 100_000,
            endpoint_rate: 1_000_000,
            serializer: "json".to_string(),
            compressor: "zstd".to_string(),
            heartbeat: HeartbeatConfig::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_function_timeout(mut self, timeout: Duration) -> Self {
        self.function_timeout = timeout;
        self
    }

    pub fn with_load_balancer(mut self, kind: LoadBalancerKind) -> Self {
        self.load_balancer = kind;
        self
    }

    pub fn with_retry_policy(mut self, kind: RetryPolicyKind) -> Self {
        self.retry_policy = kind;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    pub fn with_endpoint_rate(mut self, rate: u64) -> Self {
        self.endpoint_rate = rate;
        self
    }

    /// Sets the serializer and compressor by registered name.
    pub fn with_codec(mut self, serializer: impl Into<String>, compressor: impl Into<String>) -> Self {
        self.serializer = serializer.into();
        self.compressor = compressor.into();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CadeError::Config`] if:
    /// - any timeout is zero
    /// - the function timeout is shorter than the request timeout
    /// - the inflight cap or endpoint rate is zero
    /// - the breaker or retry settings are invalid
    /// - the serializer or compressor name is unknown
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(CadeError::Config("timeouts must be greater than zero".into()));
        }
        if self.function_timeout < self.request_timeout {
            return Err(CadeError::Config(format!(
                "function timeout ({:?}) must not be shorter than request timeout ({:?})",
                self.function_timeout, self.request_timeout
            )));
        }
        if self.max_inflight == 0 {
            return Err(CadeError::Config("max_inflight must be positive".into()));
        }
        if self.endpoint_rate == 0 {
            return Err(CadeError::Config("endpoint_rate must be positive".into()));
        }
        if self.heartbeat.interval.is_zero() || self.heartbeat.idle_timeout <= self.heartbeat.interval {
            return Err(CadeError::Config(
                "idle timeout must be longer than a non-zero heartbeat interval".into(),
            ));
        }
        self.breaker.validate()?;
        self.retry.validate()?;
        self.codec().map(|_| ())
    }

    pub(crate) fn codec(&self) -> Result<WireCodec> {
        Ok(WireCodec::with_defaults(&self.serializer, &self.compressor)?
            .with_max_frame_length(self.max_frame_length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_millis(3000));
        assert_eq!(config.request_timeout, Duration::from_millis(3000));
        assert_eq!(config.function_timeout, Duration::from_millis(10_000));
        assert_eq!(config.load_balancer, LoadBalancerKind::Random);
        assert_eq!(config.retry_policy, RetryPolicyKind::Same);
        assert_eq!(config.max_inflight, 100_000);
        assert_eq!(config.endpoint_rate, 1_000_000);
        assert_eq!(config.compressor, "zstd");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = ConsumerConfig::new()
            .with_request_timeout(Duration::from_millis(200))
            .with_function_timeout(Duration::from_millis(1000))
            .with_codec("msgpack", "gzip")
            .with_max_inflight(8);
        assert_eq!(config.request_timeout, Duration::from_millis(200));
        assert_eq!(config.serializer, "msgpack");
        assert_eq!(config.max_inflight, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let short_budget = ConsumerConfig::new().with_function_timeout(Duration::from_millis(10));
        assert!(short_budget.validate().is_err());

        assert!(ConsumerConfig::new().with_max_inflight(0).validate().is_err());
        assert!(ConsumerConfig::new().with_codec("xml", "none").validate().is_err());
        assert!(ConsumerConfig::new().with_codec("json", "lz4").validate().is_err());
    }
}
