use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::CadeError;
use super::{Request, Response};

/// Message type byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    HeartbeatRequest = 3,
    HeartbeatResponse = 4,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CadeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::HeartbeatRequest),
            4 => Ok(MessageType::HeartbeatResponse),
            other => Err(CadeError::UnknownMessageType(other)),
        }
    }
}

/// Heartbeat payload. Responses echo the request's send time so the sender
/// can measure round trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub request_time_ms: u64,
}

impl Heartbeat {
    pub fn now() -> Self {
        Self {
            request_time_ms: unix_millis(),
        }
    }

    /// Milliseconds elapsed since `request_time_ms`.
    pub fn round_trip_ms(&self) -> u64 {
        unix_millis().saturating_sub(self.request_time_ms)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Everything that can travel inside a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    HeartbeatRequest(Heartbeat),
    HeartbeatResponse(Heartbeat),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Response(_) => MessageType::Response,
            Message::HeartbeatRequest(_) => MessageType::HeartbeatRequest,
            Message::HeartbeatResponse(_) => MessageType::HeartbeatResponse,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}
