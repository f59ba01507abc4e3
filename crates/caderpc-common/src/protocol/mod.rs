pub mod endpoint;
pub mod error;
pub mod message;
pub mod requests;
pub mod responses;

#[cfg(test)]
mod tests;

pub use endpoint::Endpoint;
pub use error::{CadeError, Result};
pub use message::{Heartbeat, Message, MessageType};
pub use requests::{next_request_id, Request, RequestId, RpcArgs};
pub use responses::{codes, Response, RpcResult};
