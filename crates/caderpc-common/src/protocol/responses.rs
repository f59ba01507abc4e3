//! caderpc Response Types
//!
//! This module defines the RPC response structure and its status codes.

use serde::{Deserialize, Serialize};
use super::RequestId;
use super::error::CadeError;

/// RPC method result (JSON value)
pub type RpcResult = serde_json::Value;

/// Status codes carried in [`Response::code`].
pub mod codes {
    /// The method ran and returned a result.
    pub const OK: i32 = 0;
    /// The method raised an error.
    pub const ERROR: i32 = -1;
    /// The provider's admission limiters rejected the request.
    pub const LIMITED: i32 = -2;
    /// The provider's worker pool was full.
    pub const BUSY: i32 = -3;
    /// No service or method matched the request.
    pub const NO_SUCH_SERVICE: i32 = -4;
}

/// An RPC response returned from a provider to the consumer.
///
/// # Response Flow
///
/// 1. Provider receives and admits a `Request`
/// 2. A worker runs the method and builds a `Response` carrying the same id
/// 3. The response is framed with the connection's codec and written back
/// 4. The consumer's inflight table resolves the pending call by id
///
/// # Fields
///
/// - `request_id`: The request this response answers
/// - `code`: `0` on success, negative for framework or application failures
/// - `message`: Error description when `code != 0`
/// - `result`: The result value on success
/// - `trace_id`: Copied from the request
///
/// # Example
///
/// ```
/// use caderpc_common::protocol::responses::{codes, Response};
/// use serde_json::json;
///
/// let ok = Response::success(123, json!(3));
/// assert!(ok.is_success());
///
/// let failed = Response::error(123, codes::ERROR, "division by zero");
/// assert_eq!(failed.code, codes::ERROR);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub request_id: RequestId,
    pub code: i32,
    pub message: Option<String>,
    pub result: Option<RpcResult>,
    pub trace_id: Option<String>,
}

impl Response {
    /// Creates a successful response.
    ///
    /// # Example
    ///
    /// ```
    /// use caderpc_common::protocol::responses::Response;
    /// use serde_json::json;
    ///
    /// let response = Response::success(7, json!({"sum": 3}));
    /// assert_eq!(response.code, 0);
    /// assert_eq!(response.result, Some(json!({"sum": 3})));
    /// ```
    pub fn success(request_id: RequestId, result: RpcResult) -> Self {
        Response {
            request_id,
            code: codes::OK,
            message: None,
            result: Some(result),
            trace_id: None,
        }
    }

    /// Creates a failed response with the given status code.
    pub fn error(request_id: RequestId, code: i32, message: impl Into<String>) -> Self {
        Response {
            request_id,
            code,
            message: Some(message.into()),
            result: None,
            trace_id: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == codes::OK
    }

    /// Converts the response into the call result seen by the consumer.
    ///
    /// Provider-side rejections (limited, busy) become retryable
    /// [`CadeError::ProviderRejected`]; every other non-zero code is an
    /// application error.
    pub fn into_result(self) -> Result<RpcResult, CadeError> {
        let message = self.message.unwrap_or_default();
        match self.code {
            codes::OK => Ok(self.result.unwrap_or(RpcResult::Null)),
            codes::LIMITED | codes::BUSY => Err(CadeError::ProviderRejected {
                code: self.code,
                message,
            }),
            code => Err(CadeError::Application { code, message }),
        }
    }
}
