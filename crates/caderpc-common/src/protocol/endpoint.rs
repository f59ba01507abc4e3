use serde::{Deserialize, Serialize};
use std::fmt;

/// A provider address plus the service it serves.
///
/// Endpoints compare by value and are used directly as map keys for
/// breakers and rate limiters. Connections are shared per [`address`](Self::address),
/// so two services on the same `host:port` use one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` key of the connection serving this endpoint.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.service_name, self.host, self.port)
    }
}
