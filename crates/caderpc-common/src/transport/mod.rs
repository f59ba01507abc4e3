//! caderpc Transport Layer
//!
//! TCP plumbing shared by consumers and providers.
//!
//! # Architecture
//!
//! Each connection is split into a read half and a write half:
//! - **Reader**: a [`FrameReader`] pulls frames off the socket and hands
//!   decoded messages to the side-specific dispatch code
//! - **Writer**: [`run_writer`] owns the write half and drains an mpsc queue
//!   of [`Outbound`] messages, so any task can send without locking the
//!   socket and per-connection order is preserved
//!
//! Both sides use the same keep-alive rules: a writer that has been quiet
//! for [`HeartbeatConfig::interval`] sends a heartbeat, and a reader that
//! has heard nothing for [`HeartbeatConfig::idle_timeout`] gives up on the
//! connection.

pub mod tcp;
pub mod traffic;

use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::protocol::error::{CadeError, Result};
use crate::protocol::{Heartbeat, Message};

pub use tcp::{connect, FrameReader, FrameWriter};
pub use traffic::{format_bytes, TrafficSnapshot, TrafficStats};

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Keep-alive timing for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Send a heartbeat after this long without writing anything.
    pub interval: Duration,
    /// Close the connection after this long without reading anything.
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

type WriteListener = Box<dyn FnOnce() + Send>;

/// A message queued for writing, with an optional completion listener.
pub struct Outbound {
    pub message: Message,
    on_written: Option<WriteListener>,
}

impl Outbound {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            on_written: None,
        }
    }

    /// Runs `listener` once the message has been flushed to the socket.
    ///
    /// The listener does not run if the write fails or the connection closes
    /// first.
    pub fn on_written(mut self, listener: impl FnOnce() + Send + 'static) -> Self {
        self.on_written = Some(Box::new(listener));
        self
    }
}

impl From<Message> for Outbound {
    fn from(message: Message) -> Self {
        Outbound::new(message)
    }
}

/// Drains `queue` onto `writer`, sending heartbeats when the queue is quiet.
///
/// Returns `Ok(())` once every sender is gone, or the first IO error.
/// Messages that fail to encode are logged and skipped.
pub async fn run_writer<W>(
    mut writer: FrameWriter<W>,
    mut queue: mpsc::Receiver<Outbound>,
    heartbeat_interval: Duration,
    peer: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let outbound = tokio::select! {
            next = queue.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
            _ = tokio::time::sleep(heartbeat_interval) => {
                tracing::trace!(peer = %peer, "writer idle, sending heartbeat");
                Outbound::new(Message::HeartbeatRequest(Heartbeat::now()))
            }
        };

        match writer.send(&outbound.message).await {
            Ok(()) => {
                if let Some(listener) = outbound.on_written {
                    listener();
                }
            }
            Err(e) if e.is_fatal_to_connection() || is_io_failure(&e) => {
                writer.shutdown().await;
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "dropping message that failed to encode");
            }
        }
    }

    writer.shutdown().await;
    Ok(())
}

fn is_io_failure(err: &CadeError) -> bool {
    matches!(
        err,
        CadeError::Transport(_) | CadeError::ConnectionLost(_) | CadeError::Io(_)
    )
}

/// Answers heartbeat frames and passes every other message through.
///
/// Replies are queued with `try_send`; a full queue already proves the
/// connection is busy, so dropping the reply is harmless.
pub fn handle_heartbeat(
    message: Message,
    outbound: &mpsc::Sender<Outbound>,
    peer: &str,
) -> Option<Message> {
    match message {
        Message::HeartbeatRequest(beat) => {
            let _ = outbound.try_send(Outbound::new(Message::HeartbeatResponse(beat)));
            None
        }
        Message::HeartbeatResponse(beat) => {
            tracing::debug!(peer = %peer, rtt_ms = beat.round_trip_ms(), "heartbeat response");
            None
        }
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireCodec;
    use crate::protocol::{Request, Response};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn codec() -> WireCodec {
        WireCodec::with_defaults("json", "none").unwrap()
    }

    #[tokio::test]
    async fn test_writer_preserves_order_and_runs_listeners() {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(16);
        let written = Arc::new(AtomicUsize::new(0));

        let writer = FrameWriter::new(client, codec(), Arc::new(TrafficStats::default()));
        let task = tokio::spawn(async move {
            run_writer(writer, rx, Duration::from_secs(60), "test").await
        });

        for i in 0..3 {
            let written = written.clone();
            let msg = Message::Response(Response::success(i, json!(i)));
            tx.send(Outbound::new(msg).on_written(move || {
                written.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        }
        drop(tx);
        task.await.unwrap().unwrap();

        let mut reader = FrameReader::new(server, codec(), Arc::new(TrafficStats::default()));
        for i in 0..3 {
            match reader.next().await.unwrap().unwrap().unwrap() {
                Message::Response(r) => assert_eq!(r.request_id, i),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(written.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_idle_writer_sends_heartbeat() {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel::<Outbound>(16);
        let writer = FrameWriter::new(client, codec(), Arc::new(TrafficStats::default()));
        tokio::spawn(async move { run_writer(writer, rx, Duration::from_millis(20), "test").await });

        let mut reader = FrameReader::new(server, codec(), Arc::new(TrafficStats::default()));
        let msg = reader.next().await.unwrap().unwrap().unwrap();
        assert!(matches!(msg, Message::HeartbeatRequest(_)));
        drop(tx);
    }

    #[tokio::test]
    async fn test_handle_heartbeat_replies() {
        let (tx, mut rx) = mpsc::channel(4);
        let beat = Heartbeat { request_time_ms: 99 };

        assert!(handle_heartbeat(Message::HeartbeatRequest(beat), &tx, "peer").is_none());
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.message, Message::HeartbeatResponse(beat));

        assert!(handle_heartbeat(Message::HeartbeatResponse(beat), &tx, "peer").is_none());
        assert!(rx.try_recv().is_err());

        let request = Message::Request(Request::new("S", "m", vec![], vec![]));
        assert_eq!(handle_heartbeat(request.clone(), &tx, "peer"), Some(request));
    }
}
