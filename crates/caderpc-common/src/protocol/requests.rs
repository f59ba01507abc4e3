use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type RequestId = u64;
pub type RpcArgs = Vec<serde_json::Value>;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// An outbound call: which method of which service, with what arguments.
///
/// `param_types` carries the declared parameter type names so the provider
/// can pick between overloads. `generic_invoke` marks calls made without a
/// compiled stub; the provider then also accepts a match on name and arity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub service_name: String,
    pub method_name: String,
    pub param_types: Vec<String>,
    pub params: RpcArgs,
    pub trace_id: Option<String>,
    pub generic_invoke: bool,
}

impl Request {
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        param_types: Vec<String>,
        params: RpcArgs,
    ) -> Self {
        Request {
            id: next_request_id(),
            service_name: service_name.into(),
            method_name: method_name.into(),
            param_types,
            params,
            trace_id: None,
            generic_invoke: false,
        }
    }

    pub fn generic(mut self) -> Self {
        self.generic_invoke = true;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Copies this request under a freshly allocated id.
    ///
    /// Retries use this so a late response to an earlier attempt can never
    /// resolve the new one.
    pub fn reissue(&self) -> Self {
        Request {
            id: next_request_id(),
            ..self.clone()
        }
    }

    /// `method(type,type)` key used for provider-side method lookup.
    pub fn signature(&self) -> String {
        format!("{}({})", self.method_name, self.param_types.join(","))
    }
}

/// Allocates the next request id. Ids are unique and increasing within the process.
pub fn next_request_id() -> RequestId {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}
