//! Client-side resilience for caderpc
//!
//! Per-endpoint circuit breakers, load balancers and the retry policy
//! family. All of them work on [`Endpoint`](caderpc_common::Endpoint)
//! values and know nothing about connections or the wire format.

pub mod breaker;
pub mod load_balancer;
pub mod outcome;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitBreakerState, SlidingWindowBreaker};
pub use load_balancer::{LoadBalancer, LoadBalancerKind, RandomLoadBalancer, RoundRobinLoadBalancer};
pub use outcome::CallOutcome;
pub use retry::{
    AttemptFn, FailoverOnceRetry, FailoverRetry, ForkingRetry, RetryConfig, RetryContext, RetryPolicy,
    RetryPolicyKind, SameEndpointRetry,
};
