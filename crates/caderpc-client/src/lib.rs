//! caderpc Consumer
//!
//! The calling side of caderpc. A [`Consumer`] resolves providers through a
//! [`ServiceRegistry`](caderpc_common::registry::ServiceRegistry), keeps one
//! connection per provider address, tracks every request until it is
//! answered, times out or loses its connection, and applies breakers, load
//! balancing, retry and fallback around each call.
//!
//! # Example
//!
//! ```no_run
//! use caderpc_client::{Consumer, ConsumerConfig};
//! use caderpc_common::registry::MemoryRegistry;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(MemoryRegistry::new());
//! let consumer = Consumer::new(registry, ConsumerConfig::default())?;
//!
//! let sum = consumer
//!     .invoke("Calculator", "add", vec!["int".into(), "int".into()], vec![json!(1), json!(2)])
//!     .await?;
//! assert_eq!(sum, json!(3));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod fallback;
pub mod inflight;
pub mod interceptor;

pub use config::ConsumerConfig;
pub use connection::{Connection, ConnectionManager};
pub use consumer::{Consumer, ConsumerBuilder, ServiceProxy};
pub use fallback::{Fallback, NoFallback};
pub use inflight::{InflightManager, PendingCall};
pub use interceptor::{Interceptor, InterceptorChain};
