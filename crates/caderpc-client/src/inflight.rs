//! Inflight request tracking
//!
//! Every request sent by the consumer holds one global concurrency permit
//! and one token from its endpoint's rate limiter, and sits in the pending
//! table until it is resolved. Resolution happens exactly once, by whichever
//! comes first:
//!
//! - the matching response arriving ([`complete`](InflightManager::complete))
//! - a send failure ([`complete_exceptionally`](InflightManager::complete_exceptionally))
//! - the per-request timer firing
//! - the connection closing ([`clear_channel`](InflightManager::clear_channel))
//!
//! The winner removes the entry from the table, so every later attempt finds
//! nothing and is a logged no-op.

use std::sync::Arc;
use std::time::Duration;

use caderpc_common::limit::{ConcurrencyLimiter, Limiter, RateLimiter};
use caderpc_common::{CadeError, Endpoint, RequestId, Response, Result};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

struct PendingEntry {
    tx: oneshot::Sender<Result<Response>>,
    endpoint: Endpoint,
    timer: Option<AbortHandle>,
}

struct InflightInner {
    pending: DashMap<RequestId, PendingEntry>,
    global: ConcurrencyLimiter,
    endpoint_rate: u64,
    rate_limiters: DashMap<Endpoint, Arc<RateLimiter>>,
}

/// Table of outstanding requests plus the consumer's admission limiters.
#[derive(Clone)]
pub struct InflightManager {
    inner: Arc<InflightInner>,
}

/// Handle to the eventual result of one registered request.
#[derive(Debug)]
pub struct PendingCall {
    id: RequestId,
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingCall {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the request to be resolved.
    ///
    /// The registration timer guarantees this returns; there is no need to
    /// wrap it in another timeout.
    pub async fn wait(self) -> Result<Response> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CadeError::ConnectionLost(format!(
                "request {} was dropped without a result",
                self.id
            ))),
        }
    }
}

impl InflightManager {
    /// `max_inflight` global permits; each endpoint gets `endpoint_rate` calls per second.
    pub fn new(max_inflight: usize, endpoint_rate: u64) -> Self {
        Self {
            inner: Arc::new(InflightInner {
                pending: DashMap::new(),
                global: ConcurrencyLimiter::new(max_inflight),
                endpoint_rate,
                rate_limiters: DashMap::new(),
            }),
        }
    }

    /// Admits and registers a request about to be sent to `endpoint`.
    ///
    /// The request fails with a timeout `timeout` after registration unless
    /// something else resolves it first.
    ///
    /// # Errors
    ///
    /// [`CadeError::Limited`] if the global cap or the endpoint's rate
    /// limiter rejects. Nothing is held after a rejection.
    pub fn register(&self, id: RequestId, endpoint: &Endpoint, timeout: Duration) -> Result<PendingCall> {
        let inner = &self.inner;
        if !inner.global.try_acquire() {
            return Err(CadeError::Limited(format!(
                "{} requests already in flight",
                inner.global.capacity()
            )));
        }
        let limiter = self.rate_limiter(endpoint);
        if !limiter.try_acquire() {
            inner.global.release(1);
            return Err(CadeError::Limited(format!(
                "rate limit of {}/s reached for {}",
                limiter.capacity(),
                endpoint
            )));
        }

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            id,
            PendingEntry {
                tx,
                endpoint: endpoint.clone(),
                timer: None,
            },
        );

        let manager = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if manager.resolve(id, Err(CadeError::Timeout(timeout.as_millis() as u64))) {
                debug!(request_id = id, "request timed out");
            }
        });
        match inner.pending.get_mut(&id) {
            Some(mut entry) => entry.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }

        Ok(PendingCall { id, rx })
    }

    /// Resolves the request the response answers.
    pub fn complete(&self, response: Response) -> bool {
        self.resolve(response.request_id, Ok(response))
    }

    pub fn complete_exceptionally(&self, id: RequestId, error: CadeError) -> bool {
        self.resolve(id, Err(error))
    }

    /// Fails every request pending on the connection to `address` with
    /// [`CadeError::ConnectionLost`]. Returns how many were failed.
    pub fn clear_channel(&self, address: &str) -> usize {
        let ids: Vec<RequestId> = self
            .inner
            .pending
            .iter()
            .filter(|entry| entry.value().endpoint.address() == address)
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter()
            .filter(|id| {
                self.resolve(
                    *id,
                    Err(CadeError::ConnectionLost(format!("connection to {} closed", address))),
                )
            })
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Global permits currently free.
    pub fn available_permits(&self) -> usize {
        self.inner.global.available()
    }

    /// Tokens currently in `endpoint`'s rate limiter.
    pub fn endpoint_tokens(&self, endpoint: &Endpoint) -> u64 {
        self.rate_limiter(endpoint).available()
    }

    fn rate_limiter(&self, endpoint: &Endpoint) -> Arc<RateLimiter> {
        if let Some(limiter) = self.inner.rate_limiters.get(endpoint) {
            return limiter.value().clone();
        }
        self.inner
            .rate_limiters
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(RateLimiter::new(self.inner.endpoint_rate)))
            .value()
            .clone()
    }

    /// Single exit for every pending entry.
    fn resolve(&self, id: RequestId, result: Result<Response>) -> bool {
        let Some((_, entry)) = self.inner.pending.remove(&id) else {
            warn!(request_id = id, "no pending request for id, ignoring");
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        self.inner.global.release(1);
        self.rate_limiter(&entry.endpoint).release(1);

        // the caller may have stopped waiting
        let _ = entry.tx.send(result);
        true
    }
}
