use thiserror::Error;

#[derive(Error, Debug)]
pub enum CadeError {
    /// Bad magic, oversized or truncated frame. The connection must be dropped.
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unsupported {kind} code: {code}")]
    UnsupportedCodec { kind: &'static str, code: u8 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Request limited: {0}")]
    Limited(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Remote error (code {code}): {message}")]
    Application { code: i32, message: String },

    #[error("Provider rejected request (code {code}): {message}")]
    ProviderRejected { code: i32, message: String },

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("No service available: {0}")]
    NoService(String),

    /// The provider has the service but no method matching the call.
    #[error("No such method: {0}")]
    NoSuchMethod(String),

    #[error("No eligible provider for {0}")]
    NoEligibleProvider(String),

    #[error("All {attempts} retry attempts failed, last error: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Fallback failed: {0}")]
    Fallback(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadeError {
    /// Whether a retry policy may re-issue the call after this error.
    ///
    /// Admission rejections, application errors and framing problems are
    /// surfaced as-is; everything caused by the network or a busy provider
    /// can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CadeError::Timeout(_)
                | CadeError::Transport(_)
                | CadeError::Connection(_)
                | CadeError::ConnectionLost(_)
                | CadeError::ProviderRejected { .. }
                | CadeError::Io(_)
        )
    }

    /// Whether the connection that produced this error must be closed.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, CadeError::Framing(_))
    }

    /// Whether the local admission limiters rejected the call.
    pub fn is_admission(&self) -> bool {
        matches!(self, CadeError::Limited(_))
    }
}

impl From<rmp_serde::encode::Error> for CadeError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CadeError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CadeError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CadeError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CadeError::Timeout(100).is_retryable());
        assert!(CadeError::Transport("reset".into()).is_retryable());
        assert!(CadeError::ConnectionLost("closed".into()).is_retryable());
        assert!(CadeError::ProviderRejected { code: -3, message: "busy".into() }.is_retryable());

        assert!(!CadeError::Limited("global".into()).is_retryable());
        assert!(!CadeError::Application { code: -1, message: "boom".into() }.is_retryable());
        assert!(!CadeError::Framing("bad magic".into()).is_retryable());
        assert!(!CadeError::NoService("Add".into()).is_retryable());
    }

    #[test]
    fn test_only_framing_is_fatal() {
        assert!(CadeError::Framing("bad magic".into()).is_fatal_to_connection());
        assert!(!CadeError::UnknownMessageType(9).is_fatal_to_connection());
        assert!(!CadeError::UnsupportedCodec { kind: "serializer", code: 7 }.is_fatal_to_connection());
    }

    #[test]
    fn test_error_display() {
        let err = CadeError::Timeout(3000);
        assert_eq!(err.to_string(), "Request timeout after 3000ms");

        let err = CadeError::Application { code: -1, message: "divide by zero".into() };
        assert_eq!(err.to_string(), "Remote error (code -1): divide by zero");
    }
}
