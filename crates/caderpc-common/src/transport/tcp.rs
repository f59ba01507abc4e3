use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

use super::traffic::TrafficStats;
use crate::codec::WireCodec;
use crate::protocol::error::{CadeError, Result};
use crate::protocol::Message;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Connects to `addr`, trying each resolved address in turn.
///
/// The whole attempt, resolution included, is bounded by `timeout`.
///
/// # Errors
///
/// - [`CadeError::Timeout`] if no address accepted within `timeout`
/// - [`CadeError::Connection`] if every resolved address refused
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    tokio::time::timeout(timeout, connect_any(addr))
        .await
        .map_err(|_| CadeError::Timeout(timeout.as_millis() as u64))?
}

async fn connect_any(addr: &str) -> Result<TcpStream> {
    let socket_addrs = lookup_host(addr)
        .await
        .map_err(|e| CadeError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(CadeError::Connection(format!(
        "Failed to connect to {}: {}",
        addr,
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses resolved".to_string())
    )))
}

/// Map IO errors to transport-level error variants.
pub(crate) fn map_io_error(err: std::io::Error, context: &str) -> CadeError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof => {
            CadeError::ConnectionLost(format!("{}: {}", context, err))
        }
        _ => CadeError::Transport(format!("{}: {}", context, err)),
    }
}

/// Reads frames off a byte stream.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    codec: WireCodec,
    traffic: Arc<TrafficStats>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, codec: WireCodec, traffic: Arc<TrafficStats>) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            codec,
            traffic,
        }
    }

    /// Waits for the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream. The inner result carries
    /// per-frame decode failures, which leave the stream usable; the outer
    /// error means the connection has to be closed.
    pub async fn next(&mut self) -> Result<Option<Result<Message>>> {
        loop {
            let before = self.buf.len();
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                self.traffic.record_read(before - self.buf.len());
                return Ok(Some(frame));
            }

            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| map_io_error(e, "reading frame"))?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(CadeError::ConnectionLost(format!(
                        "peer closed with {} bytes of a partial frame buffered",
                        self.buf.len()
                    )))
                };
            }
        }
    }

    /// Like [`next`](Self::next), but fails with [`CadeError::Timeout`] if
    /// nothing arrives within `idle`.
    pub async fn next_within(&mut self, idle: Duration) -> Result<Option<Result<Message>>> {
        match tokio::time::timeout(idle, self.next()).await {
            Ok(frame) => frame,
            Err(_) => Err(CadeError::Timeout(idle.as_millis() as u64)),
        }
    }
}

/// Writes frames onto a byte stream.
pub struct FrameWriter<W> {
    writer: W,
    buf: BytesMut,
    codec: WireCodec,
    traffic: Arc<TrafficStats>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, codec: WireCodec, traffic: Arc<TrafficStats>) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            codec,
            traffic,
        }
    }

    /// Encodes and flushes one message.
    ///
    /// An encode failure is returned without touching the stream, so the
    /// caller may keep using the writer. IO failures are final.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.buf.clear();
        self.codec.encode(message, &mut self.buf)?;
        self.writer
            .write_all(&self.buf)
            .await
            .map_err(|e| map_io_error(e, "writing frame"))?;
        self.writer
            .flush()
            .await
            .map_err(|e| map_io_error(e, "flushing stream"))?;
        self.traffic.record_written(self.buf.len());
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
