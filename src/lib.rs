//! caderpc
//!
//! A resilient RPC framework. Consumers call methods of remote services by
//! name; the framework discovers providers, keeps one connection per
//! provider, frames and codes messages, and applies admission control,
//! circuit breaking, load balancing, retry and fallback to every call.
//!
//! This crate re-exports the workspace:
//!
//! - [`common`]: protocol types, wire codec, transport, limiters, registry
//! - [`cluster`]: call outcomes, circuit breakers, load balancers, retry policies
//! - [`client`]: the consumer pipeline
//! - [`server`]: the provider dispatch loop

pub use caderpc_client as client;
pub use caderpc_cluster as cluster;
pub use caderpc_common as common;
pub use caderpc_server as server;

pub use caderpc_client::{Consumer, ConsumerConfig, ServiceProxy};
pub use caderpc_common::{CadeError, Endpoint, Result};
pub use caderpc_server::{MethodTable, ProviderConfig, ProviderServer, Service};
