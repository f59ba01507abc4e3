//! Consumer dispatch pipeline
//!
//! A call goes through:
//!
//! 1. interceptor `before` hooks (may short-circuit)
//! 2. registry lookup of the service's providers
//! 3. load-balanced selection among providers whose breaker admits the call
//! 4. one attempt: connection, inflight registration, send, wait
//! 5. on a retryable failure, the configured retry policy inside what is
//!    left of the function timeout
//! 6. on final failure, the fallback collaborator
//! 7. interceptor `after` hooks
//!
//! Every attempt that reached the wire, including those made by retry
//! policies, is recorded against its endpoint's breaker and reported to the
//! fallback's metrics hook. Local admission rejections record nothing, skip
//! retry and fallback, and reach the caller directly.
//!
//! Registry lookups go through a [`CachingRegistry`], so providers already
//! discovered keep being used while the registry is unreachable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use caderpc_cluster::{
    AttemptFn, BreakerRegistry, CallOutcome, LoadBalancer, RetryContext, RetryPolicy,
};
use caderpc_common::registry::{CachingRegistry, ServiceRegistry};
use caderpc_common::{CadeError, Endpoint, Message, Request, Result, RpcArgs, RpcResult};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::ConsumerConfig;
use crate::connection::ConnectionManager;
use crate::fallback::{Fallback, NoFallback};
use crate::inflight::InflightManager;
use crate::interceptor::{Interceptor, InterceptorChain};

struct ConsumerInner {
    config: ConsumerConfig,
    registry: Arc<dyn ServiceRegistry>,
    connections: ConnectionManager,
    inflight: InflightManager,
    breakers: Arc<BreakerRegistry>,
    load_balancer: Arc<dyn LoadBalancer>,
    retry: Arc<dyn RetryPolicy>,
    fallback: Arc<dyn Fallback>,
    interceptors: InterceptorChain,
}

/// Entry point for calling remote services.
///
/// Cheap to clone; clones share connections, breakers and limiters.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

/// Assembles a [`Consumer`].
pub struct ConsumerBuilder {
    registry: Arc<dyn ServiceRegistry>,
    config: ConsumerConfig,
    fallback: Arc<dyn Fallback>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ConsumerBuilder {
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn Fallback>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// # Errors
    ///
    /// [`CadeError::Config`] if the configuration does not validate.
    pub fn build(self) -> Result<Consumer> {
        let config = self.config;
        config.validate()?;

        let inflight = InflightManager::new(config.max_inflight, config.endpoint_rate);
        let connections = ConnectionManager::new(
            config.codec()?,
            config.connect_timeout,
            config.heartbeat,
            inflight.clone(),
        );

        Ok(Consumer {
            inner: Arc::new(ConsumerInner {
                registry: Arc::new(CachingRegistry::new(self.registry)),
                connections,
                inflight,
                breakers: Arc::new(BreakerRegistry::new(config.breaker.clone())),
                load_balancer: config.load_balancer.build(),
                retry: config.retry_policy.build(config.retry.clone()),
                fallback: self.fallback,
                interceptors: InterceptorChain::new(self.interceptors),
                config,
            }),
        })
    }
}

impl Consumer {
    pub fn builder(registry: Arc<dyn ServiceRegistry>) -> ConsumerBuilder {
        ConsumerBuilder {
            registry,
            config: ConsumerConfig::default(),
            fallback: Arc::new(NoFallback),
            interceptors: Vec::new(),
        }
    }

    /// A consumer with `config`, no fallback and no interceptors.
    pub fn new(registry: Arc<dyn ServiceRegistry>, config: ConsumerConfig) -> Result<Self> {
        Self::builder(registry).config(config).build()
    }

    /// Calls `service.method` with declared parameter types.
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        param_types: Vec<String>,
        args: RpcArgs,
    ) -> Result<RpcResult> {
        self.call(Request::new(service, method, param_types, args)).await
    }

    /// Calls `service.method` without a compiled interface; the provider
    /// resolves the method by name and argument count when the types do
    /// not match exactly.
    pub async fn invoke_generic(
        &self,
        service: &str,
        method: &str,
        param_types: Vec<String>,
        args: RpcArgs,
    ) -> Result<RpcResult> {
        self.call(Request::new(service, method, param_types, args).generic())
            .await
    }

    /// Typed helper bound to one service.
    pub fn proxy(&self, service: impl Into<String>) -> ServiceProxy {
        ServiceProxy {
            consumer: self.clone(),
            service: service.into(),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.inner.breakers
    }

    pub fn inflight(&self) -> &InflightManager {
        &self.inner.inflight
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    /// Closes every pooled connection. Calls in flight fail with
    /// [`CadeError::ConnectionLost`]; later calls reconnect.
    pub fn close(&self) {
        self.inner.connections.close_all();
    }

    /// Runs `request` through the interceptors and the dispatch pipeline.
    pub async fn call(&self, request: Request) -> Result<RpcResult> {
        let interceptors = &self.inner.interceptors;
        let (entered, short_circuit) = interceptors.before(&request);
        let result = match short_circuit {
            Some(result) => {
                debug!(service = %request.service_name, method = %request.method_name, "call short-circuited");
                Ok(result)
            }
            None => self.dispatch(&request).await,
        };
        interceptors.after(entered, &request, &result);
        result
    }

    async fn dispatch(&self, request: &Request) -> Result<RpcResult> {
        let inner = &self.inner;
        let started = Instant::now();

        let candidates = match inner.registry.fetch_service_list(&request.service_name).await {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => return self.fall_back(request, None, CadeError::NoService(request.service_name.clone())),
            Err(e) => return self.fall_back(request, None, e),
        };
        let endpoint = match self.select_eligible(&request.service_name, &candidates) {
            Ok(endpoint) => endpoint,
            Err(e) => return self.fall_back(request, None, e),
        };
        debug!(%endpoint, method = %request.method_name, "selected provider");

        let cause = match attempt(inner.clone(), request.clone(), endpoint.clone(), inner.config.request_timeout).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_admission() => return Err(e),
            Err(e) => e,
        };

        let remaining = inner.config.function_timeout.saturating_sub(started.elapsed());
        warn!(
            %endpoint,
            method = %request.method_name,
            error = %cause,
            remaining_ms = remaining.as_millis() as u64,
            policy = inner.retry.name(),
            "call failed, retrying"
        );
        let ctx = RetryContext {
            failed_endpoint: endpoint.clone(),
            candidates,
            remaining_budget: remaining,
            request_timeout: inner.config.request_timeout,
            load_balancer: inner.load_balancer.clone(),
            breakers: inner.breakers.clone(),
            attempt: self.attempt_fn(request),
            cause,
        };

        match inner.retry.retry(ctx).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_admission() => Err(e),
            Err(e) => self.fall_back(request, Some(endpoint), e),
        }
    }

    /// Picks a provider whose breaker admits the call, evicting the ones
    /// that refuse.
    fn select_eligible(&self, service: &str, candidates: &[Endpoint]) -> Result<Endpoint> {
        let mut pool = candidates.to_vec();
        loop {
            let Some(endpoint) = self.inner.load_balancer.select(&pool).cloned() else {
                return Err(CadeError::NoEligibleProvider(service.to_string()));
            };
            if self.inner.breakers.allow_request(&endpoint) {
                return Ok(endpoint);
            }
            debug!(%endpoint, "breaker rejected provider");
            pool.retain(|e| *e != endpoint);
        }
    }

    /// Attempt closure for retry policies; every attempt gets a fresh request id.
    fn attempt_fn(&self, request: &Request) -> AttemptFn {
        let inner = self.inner.clone();
        let request = request.clone();
        Arc::new(move |endpoint: Endpoint, timeout: Duration| {
            attempt(inner.clone(), request.reissue(), endpoint, timeout).boxed()
        })
    }

    fn fall_back(&self, request: &Request, endpoint: Option<Endpoint>, error: CadeError) -> Result<RpcResult> {
        let mut outcome = CallOutcome::begin(
            endpoint,
            request.service_name.clone(),
            request.method_name.clone(),
            request.params.clone(),
        );
        outcome.fail(&error);
        debug!(method = %request.method_name, error = %error, "invoking fallback");
        self.inner.fallback.fallback(&outcome, error)
    }
}

/// One attempt against one endpoint, recorded against its breaker unless it
/// was refused locally.
async fn attempt(
    inner: Arc<ConsumerInner>,
    request: Request,
    endpoint: Endpoint,
    timeout: Duration,
) -> Result<RpcResult> {
    let mut outcome = CallOutcome::begin(
        Some(endpoint.clone()),
        request.service_name.clone(),
        request.method_name.clone(),
        request.params.clone(),
    );

    let result = send_and_wait(&inner, request, &endpoint, timeout).await;
    if matches!(&result, Err(e) if e.is_admission()) {
        // rejected before anything was sent; says nothing about the provider
        return result;
    }
    match &result {
        Ok(value) => outcome.succeed(value.clone()),
        Err(e @ CadeError::Timeout(_)) => outcome.abandon(e),
        Err(e) => outcome.fail(e),
    }
    inner.breakers.record(&outcome);
    inner.fallback.record_metrics(&outcome);
    result
}

async fn send_and_wait(
    inner: &ConsumerInner,
    request: Request,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<RpcResult> {
    let connection = inner.connections.get_channel(endpoint).await?;
    let pending = inner.inflight.register(request.id, endpoint, timeout)?;
    if let Err(e) = connection.send(Message::Request(request)).await {
        inner.inflight.complete_exceptionally(pending.id(), e);
    }
    pending.wait().await?.into_result()
}

/// Typed calls against one service.
///
/// Hand-written stubs wrap this:
///
/// ```no_run
/// use caderpc_client::ServiceProxy;
/// use caderpc_common::Result;
/// use serde_json::json;
///
/// struct Calculator(ServiceProxy);
///
/// impl Calculator {
///     async fn add(&self, a: i64, b: i64) -> Result<i64> {
///         self.0.call("add", &["long", "long"], vec![json!(a), json!(b)]).await
///     }
/// }
/// ```
#[derive(Clone)]
pub struct ServiceProxy {
    consumer: Consumer,
    service: String,
}

impl ServiceProxy {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        param_types: &[&str],
        args: RpcArgs,
    ) -> Result<R> {
        let types = param_types.iter().map(|t| t.to_string()).collect();
        let value = self.consumer.invoke(&self.service, method, types, args).await?;
        Ok(serde_json::from_value(value)?)
    }
}
