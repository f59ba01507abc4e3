//! Provider configuration.

use std::time::Duration;

use caderpc_common::codec::{WireCodec, DEFAULT_MAX_FRAME_LENGTH};
use caderpc_common::transport::HeartbeatConfig;
use caderpc_common::{CadeError, Result};

/// Settings for a [`ProviderServer`](crate::ProviderServer).
///
/// # Example
///
/// ```
/// use caderpc_server::ProviderConfig;
///
/// let config = ProviderConfig::new().with_port(9100).with_workers(8, 256);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Address to listen on, also advertised in the registry
    pub host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    /// Tasks executing service methods
    pub workers: usize,
    /// Admitted requests allowed to wait for a worker
    pub worker_queue: usize,
    /// Requests admitted and not yet answered, across all connections
    pub max_requests: usize,
    /// Requests per second accepted from one connection
    pub connection_rate: u64,
    pub serializer: String,
    pub compressor: String,
    pub heartbeat: HeartbeatConfig,
    pub max_frame_length: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 4,
            worker_queue: 1024,
            max_requests: 1_000_000,
            connection_rate: 1_000_000,
            serializer: "json".to_string(),
            compressor: "gzip".to_string(),
            heartbeat: HeartbeatConfig::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_workers(mut self, workers: usize, queue: usize) -> Self {
        self.workers = workers;
        self.worker_queue = queue;
        self
    }

    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_connection_rate(mut self, rate: u64) -> Self {
        self.connection_rate = rate;
        self
    }

    pub fn with_codec(mut self, serializer: impl Into<String>, compressor: impl Into<String>) -> Self {
        self.serializer = serializer.into();
        self.compressor = compressor.into();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// `host:port` the listener binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(CadeError::Config("provider host must not be empty".into()));
        }
        if self.workers == 0 || self.worker_queue == 0 {
            return Err(CadeError::Config("worker count and queue size must be positive".into()));
        }
        if self.max_requests == 0 || self.connection_rate == 0 {
            return Err(CadeError::Config("request limits must be positive".into()));
        }
        if self.heartbeat.interval.is_zero() || self.heartbeat.idle_timeout <= self.heartbeat.interval {
            return Err(CadeError::Config(
                "idle timeout must be longer than a non-zero heartbeat interval".into(),
            ));
        }
        self.codec().map(|_| ())
    }

    pub(crate) fn codec(&self) -> Result<WireCodec> {
        Ok(WireCodec::with_defaults(&self.serializer, &self.compressor)?
            .with_max_frame_length(self.max_frame_length))
    }
}

/// How long [`ServerHandle::shutdown`](crate::ServerHandle::shutdown) waits
/// for the accept loop to stop.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
