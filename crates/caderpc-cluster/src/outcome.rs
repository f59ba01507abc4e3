use std::time::{Duration, Instant};

use caderpc_common::{CadeError, Endpoint, RpcArgs, RpcResult};

/// Record of one call attempt, fed to the breaker and to fallback bookkeeping.
///
/// Created when the attempt starts and finished exactly once through
/// [`succeed`](Self::succeed) or [`fail`](Self::fail); later calls are ignored.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub endpoint: Option<Endpoint>,
    pub service: String,
    pub method: String,
    pub args: RpcArgs,
    pub started_at: Instant,
    pub duration: Duration,
    pub complete: bool,
    pub error: Option<String>,
    pub result: Option<RpcResult>,
    finished: bool,
}

impl CallOutcome {
    pub fn begin(
        endpoint: Option<Endpoint>,
        service: impl Into<String>,
        method: impl Into<String>,
        args: RpcArgs,
    ) -> Self {
        Self {
            endpoint,
            service: service.into(),
            method: method.into(),
            args,
            started_at: Instant::now(),
            duration: Duration::ZERO,
            complete: false,
            error: None,
            result: None,
            finished: false,
        }
    }

    pub fn succeed(&mut self, result: RpcResult) {
        if self.finish() {
            self.complete = true;
            self.result = Some(result);
        }
    }

    pub fn fail(&mut self, error: &CadeError) {
        if self.finish() {
            self.complete = true;
            self.error = Some(error.to_string());
        }
    }

    /// Marks the attempt as abandoned without an answer (for example on timeout).
    pub fn abandon(&mut self, error: &CadeError) {
        if self.finish() {
            self.error = Some(error.to_string());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_success(&self) -> bool {
        self.complete && self.error.is_none()
    }

    fn finish(&mut self) -> bool {
        if self.finished {
            tracing::debug!(method = %self.method, "call outcome already finished");
            return false;
        }
        self.finished = true;
        self.duration = self.started_at.elapsed();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome() -> CallOutcome {
        CallOutcome::begin(
            Some(Endpoint::new("Calculator", "127.0.0.1", 1)),
            "Calculator",
            "add",
            vec![json!(1), json!(2)],
        )
    }

    #[test]
    fn test_success() {
        let mut o = outcome();
        o.succeed(json!(3));
        assert!(o.is_finished());
        assert!(o.is_success());
        assert_eq!(o.result, Some(json!(3)));
    }

    #[test]
    fn test_failure_keeps_message() {
        let mut o = outcome();
        o.fail(&CadeError::Transport("reset".into()));
        assert!(o.complete);
        assert!(!o.is_success());
        assert_eq!(o.error.as_deref(), Some("Transport error: reset"));
    }

    #[test]
    fn test_abandoned_is_incomplete() {
        let mut o = outcome();
        o.abandon(&CadeError::Timeout(10));
        assert!(!o.complete);
        assert!(!o.is_success());
    }

    #[test]
    fn test_finishes_once() {
        let mut o = outcome();
        o.fail(&CadeError::Timeout(10));
        o.succeed(json!(1));
        assert!(!o.is_success());
        assert!(o.result.is_none());
    }
}
