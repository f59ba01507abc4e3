//! caderpc Provider
//!
//! Serves [`Service`] implementations to caderpc consumers.
//!
//! # Overview
//!
//! - **[`ProviderServer`]**: binds a listener, registers one endpoint per
//!   service with the registry and runs the accept loop
//! - **Dispatch loop**: per connection, answers heartbeats and applies
//!   admission control (a global concurrency cap, then a per-connection
//!   rate limit) before handing requests to the worker pool
//! - **[`WorkerPool`]**: bounded pool running service methods off the I/O
//!   tasks; a full pool answers with a busy response
//! - **[`MethodTable`]**: closure-backed [`Service`] keyed by method signature
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use caderpc_common::registry::MemoryRegistry;
//! use caderpc_server::service::{arg, MethodTable};
//! use caderpc_server::{ProviderConfig, ProviderServer};
//! use serde_json::json;
//!
//! # async fn run() -> caderpc_common::Result<()> {
//! let calculator = MethodTable::new().method("add", &["int", "int"], |args| {
//!     Ok(json!(arg::<i64>(&args, 0)? + arg::<i64>(&args, 1)?))
//! });
//!
//! let server = ProviderServer::bind(ProviderConfig::new().with_port(9100), Arc::new(MemoryRegistry::new()))
//!     .await?
//!     .service("Calculator", Arc::new(calculator));
//! let handle = server.spawn().await?;
//! // ...
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod server;
pub mod service;
pub mod worker_pool;

pub use config::ProviderConfig;
pub use server::{ProviderServer, ServerHandle};
pub use service::{MethodTable, Service};
pub use worker_pool::WorkerPool;
