//! Degraded results for calls that cannot succeed.

use caderpc_cluster::CallOutcome;
use caderpc_common::{CadeError, Result, RpcResult};

/// Last stop of a failed call.
///
/// [`fallback`](Fallback::fallback) runs once the initial attempt and the
/// retry policy have both failed, and decides what the caller sees: a
/// substitute result, or an error. [`record_metrics`](Fallback::record_metrics)
/// sees every attempt of every call, successful or not, so implementations
/// can keep the data a substitute result is built from (for example the
/// last good answer per method).
pub trait Fallback: Send + Sync {
    fn fallback(&self, outcome: &CallOutcome, error: CadeError) -> Result<RpcResult>;

    /// Best-effort bookkeeping; must not panic.
    fn record_metrics(&self, _outcome: &CallOutcome) {}
}

/// Re-raises the classified error.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFallback;

impl Fallback for NoFallback {
    fn fallback(&self, _outcome: &CallOutcome, error: CadeError) -> Result<RpcResult> {
        Err(error)
    }
}
