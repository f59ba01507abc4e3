//! caderpc Common Types and Transport
//!
//! This crate provides the pieces both sides of a caderpc connection share.
//!
//! # Overview
//!
//! caderpc is an RPC framework: consumers call methods of remote services by
//! name, and the framework discovers providers, pools connections, frames
//! and codes messages, and applies admission control, circuit breaking and
//! retry. This crate contains the shared foundation:
//!
//! - **Protocol Layer**: Endpoint, Request/Response, heartbeats and the error taxonomy
//! - **Codec Layer**: the binary frame format plus pluggable serializers and compressors
//! - **Transport Layer**: TCP framing, the per-connection writer loop, heartbeats and traffic counters
//! - **Limiters**: the concurrency and token-bucket admission primitives
//! - **Registry**: the service discovery contract
//!
//! # Architecture
//!
//! The wire protocol:
//! - **Transport**: TCP, one long-lived connection per provider address
//! - **Frame**: `[i32 length]["cade"][8-byte version][type][ser<<4 | compress][payload]`
//! - **Serialization**: JSON or MessagePack, chosen per connection
//! - **Compression**: gzip or zstd above a per-compressor size threshold
//! - **Max Frame Size**: 1 MiB by default
//!
//! # Example
//!
//! ```
//! use caderpc_common::codec::WireCodec;
//! use caderpc_common::{Message, Request};
//! use bytes::BytesMut;
//! use serde_json::json;
//!
//! let codec = WireCodec::with_defaults("json", "zstd").unwrap();
//! let request = Request::new("Calculator", "add", vec!["int".into(), "int".into()], vec![json!(1), json!(2)]);
//!
//! let mut buf = BytesMut::new();
//! codec.encode(&Message::Request(request.clone()), &mut buf).unwrap();
//! let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
//! assert_eq!(decoded, Message::Request(request));
//! ```

pub mod codec;
pub mod limit;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use protocol::*;
