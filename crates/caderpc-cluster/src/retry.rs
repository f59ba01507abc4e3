//! Retry policies
//!
//! A policy runs only after the first attempt of a call has failed and the
//! breaker has seen that failure. Every policy works inside the caller's
//! remaining function budget and asks the endpoint's breaker before each
//! attempt. The attempt itself is a closure supplied by the consumer, so
//! the outcome of every retried call still reaches the breaker registry.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caderpc_common::{CadeError, Endpoint, Result, RpcResult};
use futures::future::{self, BoxFuture, FutureExt};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::breaker::BreakerRegistry;
use crate::load_balancer::LoadBalancer;

/// Issues one call against an endpoint, bounded by the given timeout.
///
/// Implementations record the attempt's outcome against the endpoint's
/// breaker before resolving.
pub type AttemptFn =
    Arc<dyn Fn(Endpoint, Duration) -> BoxFuture<'static, Result<RpcResult>> + Send + Sync>;

/// Backoff configuration shared by all policies.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts after the initial failure
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every following attempt
    pub base_delay: Duration,
    /// Upper bound of the random jitter added to every delay
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::from_millis(50),
        }
    }
}

impl RetryConfig {
    /// `base * 2^(attempt-1) + random(0..=max_jitter)`, with `attempt` starting at 1.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.base_delay.saturating_mul(1u32 << exponent);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CadeError::Config("retry max_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Everything a policy needs to retry one failed call.
pub struct RetryContext {
    pub failed_endpoint: Endpoint,
    /// Every endpoint that was known for the service when the call started
    pub candidates: Vec<Endpoint>,
    /// What is left of the function-level timeout
    pub remaining_budget: Duration,
    pub request_timeout: Duration,
    pub load_balancer: Arc<dyn LoadBalancer>,
    pub breakers: Arc<BreakerRegistry>,
    pub attempt: AttemptFn,
    /// Error of the initial attempt
    pub cause: CadeError,
}

impl RetryContext {
    fn service(&self) -> &str {
        &self.failed_endpoint.service_name
    }

    fn alternates(&self) -> Vec<Endpoint> {
        self.candidates
            .iter()
            .filter(|e| **e != self.failed_endpoint)
            .cloned()
            .collect()
    }

    fn budget_exhausted(&self) -> CadeError {
        CadeError::Timeout(self.remaining_budget.as_millis() as u64)
    }

    fn attempt_timeout(&self, deadline: Instant) -> Duration {
        self.request_timeout.min(deadline.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
pub trait RetryPolicy: Send + Sync {
    /// Retries the call described by `ctx`, returning the first successful
    /// result or a single classified error.
    async fn retry(&self, ctx: RetryContext) -> Result<RpcResult>;

    fn name(&self) -> &'static str;
}

/// Sleeps for the backoff of `attempt` unless that would overrun `deadline`.
async fn backoff(config: &RetryConfig, attempt: u32, deadline: Instant) -> bool {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let delay = config.backoff_delay(attempt);
    if remaining.is_zero() || delay >= remaining {
        debug!(attempt, ?delay, ?remaining, "retry budget exhausted");
        return false;
    }
    tokio::time::sleep(delay).await;
    true
}

/// Retries against the endpoint that failed.
#[derive(Debug, Clone, Default)]
pub struct SameEndpointRetry {
    config: RetryConfig,
}

impl SameEndpointRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RetryPolicy for SameEndpointRetry {
    async fn retry(&self, ctx: RetryContext) -> Result<RpcResult> {
        if !ctx.cause.is_retryable() {
            return Err(ctx.cause);
        }
        let deadline = Instant::now() + ctx.remaining_budget;
        let endpoint = ctx.failed_endpoint.clone();
        let mut last = ctx.cause.to_string();

        for attempt in 1..=self.config.max_attempts {
            if !backoff(&self.config, attempt, deadline).await {
                return Err(ctx.budget_exhausted());
            }
            if !ctx.breakers.allow_request(&endpoint) {
                return Err(CadeError::CircuitOpen(endpoint.to_string()));
            }
            match (ctx.attempt)(endpoint.clone(), ctx.attempt_timeout(deadline)).await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(%endpoint, attempt, error = %e, "retry attempt failed");
                    last = e.to_string();
                }
            }
        }

        Err(CadeError::RetryExhausted {
            attempts: self.config.max_attempts,
            last,
        })
    }

    fn name(&self) -> &'static str {
        "same"
    }
}

/// Retries against other endpoints, dropping every endpoint that fails.
#[derive(Debug, Clone, Default)]
pub struct FailoverRetry {
    config: RetryConfig,
}

impl FailoverRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RetryPolicy for FailoverRetry {
    async fn retry(&self, ctx: RetryContext) -> Result<RpcResult> {
        if !ctx.cause.is_retryable() {
            return Err(ctx.cause);
        }
        let deadline = Instant::now() + ctx.remaining_budget;
        let mut pool = ctx.alternates();
        let mut last = ctx.cause.to_string();
        let mut attempt = 1;

        while attempt <= self.config.max_attempts {
            let Some(endpoint) = ctx.load_balancer.select(&pool).cloned() else {
                return Err(CadeError::NoService(ctx.service().to_string()));
            };
            if !backoff(&self.config, attempt, deadline).await {
                return Err(ctx.budget_exhausted());
            }
            if !ctx.breakers.allow_request(&endpoint) {
                debug!(%endpoint, "breaker rejected failover candidate");
                pool.retain(|e| *e != endpoint);
                continue;
            }
            match (ctx.attempt)(endpoint.clone(), ctx.attempt_timeout(deadline)).await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(%endpoint, attempt, error = %e, "failover attempt failed");
                    last = e.to_string();
                    pool.retain(|c| *c != endpoint);
                    if pool.is_empty() {
                        return Err(CadeError::NoService(ctx.service().to_string()));
                    }
                    attempt += 1;
                }
            }
        }

        Err(CadeError::RetryExhausted {
            attempts: self.config.max_attempts,
            last,
        })
    }

    fn name(&self) -> &'static str {
        "failover"
    }
}

/// Makes exactly one attempt against an alternate endpoint, without backoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailoverOnceRetry;

#[async_trait]
impl RetryPolicy for FailoverOnceRetry {
    async fn retry(&self, ctx: RetryContext) -> Result<RpcResult> {
        if !ctx.cause.is_retryable() {
            return Err(ctx.cause);
        }
        if ctx.remaining_budget.is_zero() {
            return Err(ctx.budget_exhausted());
        }
        let deadline = Instant::now() + ctx.remaining_budget;
        let mut pool = ctx.alternates();

        loop {
            let Some(endpoint) = ctx.load_balancer.select(&pool).cloned() else {
                return Err(CadeError::NoService(ctx.service().to_string()));
            };
            if ctx.breakers.allow_request(&endpoint) {
                return (ctx.attempt)(endpoint, ctx.attempt_timeout(deadline)).await;
            }
            pool.retain(|e| *e != endpoint);
        }
    }

    fn name(&self) -> &'static str {
        "failover_once"
    }
}

/// Calls every alternate endpoint at once and takes the first success.
///
/// Attempts run as spawned tasks, so the ones that lose the race still run
/// to completion and record their outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkingRetry;

#[async_trait]
impl RetryPolicy for ForkingRetry {
    async fn retry(&self, ctx: RetryContext) -> Result<RpcResult> {
        if !ctx.cause.is_retryable() {
            return Err(ctx.cause);
        }
        if ctx.remaining_budget.is_zero() {
            return Err(ctx.budget_exhausted());
        }
        let deadline = Instant::now() + ctx.remaining_budget;
        let allowed: Vec<Endpoint> = ctx
            .alternates()
            .into_iter()
            .filter(|e| ctx.breakers.allow_request(e))
            .collect();
        if allowed.is_empty() {
            return Err(CadeError::NoService(ctx.service().to_string()));
        }

        let timeout = ctx.attempt_timeout(deadline);
        let attempts = allowed.into_iter().map(|endpoint| {
            let task = tokio::spawn((ctx.attempt)(endpoint, timeout));
            async move {
                match task.await {
                    Ok(result) => result,
                    Err(e) => Err(CadeError::Transport(format!("forked attempt failed: {}", e))),
                }
            }
            .boxed()
        });

        match tokio::time::timeout_at(deadline, future::select_ok(attempts)).await {
            Ok(Ok((result, _pending))) => Ok(result),
            Ok(Err(last)) => Err(last),
            Err(_) => Err(ctx.budget_exhausted()),
        }
    }

    fn name(&self) -> &'static str {
        "forking"
    }
}

/// Retry policy choice in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicyKind {
    #[default]
    Same,
    Failover,
    FailoverOnce,
    Forking,
}

impl RetryPolicyKind {
    pub fn build(self, config: RetryConfig) -> Arc<dyn RetryPolicy> {
        match self {
            RetryPolicyKind::Same => Arc::new(SameEndpointRetry::new(config)),
            RetryPolicyKind::Failover => Arc::new(FailoverRetry::new(config)),
            RetryPolicyKind::FailoverOnce => Arc::new(FailoverOnceRetry),
            RetryPolicyKind::Forking => Arc::new(ForkingRetry),
        }
    }
}

impl FromStr for RetryPolicyKind {
    type Err = CadeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "same" => Ok(RetryPolicyKind::Same),
            "failover" => Ok(RetryPolicyKind::Failover),
            "failover_once" | "failoveronce" => Ok(RetryPolicyKind::FailoverOnce),
            "forking" => Ok(RetryPolicyKind::Forking),
            other => Err(CadeError::Config(format!("unknown retry policy '{}'", other))),
        }
    }
}

impl fmt::Display for RetryPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryPolicyKind::Same => "same",
            RetryPolicyKind::Failover => "failover",
            RetryPolicyKind::FailoverOnce => "failover_once",
            RetryPolicyKind::Forking => "forking",
        };
        f.write_str(name)
    }
}
