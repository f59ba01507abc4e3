//! Consumer-side connection management
//!
//! One long-lived TCP connection per provider address (`host:port`),
//! shared by every service that provider exposes. Connections are opened
//! lazily by [`ConnectionManager::get_channel`]; concurrent callers for the
//! same address wait on a single connect attempt.
//!
//! Each connection runs two tasks:
//! - a writer draining the outbound queue and sending heartbeats when idle
//! - a reader routing responses into the [`InflightManager`]
//!
//! When the reader stops for any reason (peer close, idle timeout, IO
//! error, [`Connection::close`]) the connection is marked inactive, removed
//! from the map, and every request still pending on that address fails
//! with [`CadeError::ConnectionLost`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use caderpc_common::codec::WireCodec;
use caderpc_common::transport::traffic::REPORT_INTERVAL;
use caderpc_common::transport::{
    self, handle_heartbeat, run_writer, FrameReader, FrameWriter, HeartbeatConfig, Outbound,
    TrafficSnapshot, TrafficStats, OUTBOUND_QUEUE_SIZE,
};
use caderpc_common::{CadeError, Endpoint, Message, Result};
use dashmap::DashMap;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::inflight::InflightManager;

/// A pooled connection to one provider address.
pub struct Connection {
    address: String,
    outbound: mpsc::Sender<Outbound>,
    active: AtomicBool,
    shutdown: Arc<Notify>,
    traffic: Arc<TrafficStats>,
    serializer: &'static str,
    compressor: &'static str,
}

impl Connection {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Serializer chosen for this connection's lifetime.
    pub fn serializer(&self) -> &'static str {
        self.serializer
    }

    pub fn compressor(&self) -> &'static str {
        self.compressor
    }

    pub fn traffic(&self) -> TrafficSnapshot {
        self.traffic.snapshot()
    }

    /// Queues `outbound` behind everything already sent on this connection.
    pub async fn send(&self, outbound: impl Into<Outbound>) -> Result<()> {
        if !self.is_active() {
            return Err(self.lost());
        }
        self.outbound.send(outbound.into()).await.map_err(|_| self.lost())
    }

    /// Closes the connection. Pending requests fail once the reader notices.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            debug!(peer = %self.address, "closing connection");
        }
        self.shutdown.notify_one();
    }

    fn lost(&self) -> CadeError {
        CadeError::ConnectionLost(format!("connection to {} closed", self.address))
    }
}

type ConnectionSlot = Arc<OnceCell<Arc<Connection>>>;

struct ManagerInner {
    connections: DashMap<String, ConnectionSlot>,
    codec: WireCodec,
    connect_timeout: Duration,
    heartbeat: HeartbeatConfig,
    inflight: InflightManager,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for slot in self.connections.iter() {
            if let Some(connection) = slot.value().get() {
                connection.close();
            }
        }
    }
}

/// Address → connection map.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        codec: WireCodec,
        connect_timeout: Duration,
        heartbeat: HeartbeatConfig,
        inflight: InflightManager,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connections: DashMap::new(),
                codec,
                connect_timeout,
                heartbeat,
                inflight,
            }),
        }
    }

    /// Returns the active connection to `endpoint`'s address, connecting
    /// first if there is none.
    ///
    /// # Errors
    ///
    /// - [`CadeError::Timeout`] / [`CadeError::Connection`] if connecting fails
    /// - [`CadeError::Connection`] if the pooled connection is no longer
    ///   active; it is evicted and the next call reconnects
    pub async fn get_channel(&self, endpoint: &Endpoint) -> Result<Arc<Connection>> {
        let address = endpoint.address();
        let slot: ConnectionSlot = self
            .inner
            .connections
            .entry(address.clone())
            .or_default()
            .value()
            .clone();

        match slot.get_or_try_init(|| self.open(address.clone())).await {
            Ok(connection) if connection.is_active() => Ok(connection.clone()),
            Ok(_) => {
                self.evict(&address, &slot);
                Err(CadeError::Connection(format!("no active connection to {}", address)))
            }
            Err(e) => {
                self.evict(&address, &slot);
                Err(e)
            }
        }
    }

    /// Number of addresses with a connection or a connect in progress.
    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Closes every pooled connection.
    pub fn close_all(&self) {
        let slots: Vec<ConnectionSlot> = self
            .inner
            .connections
            .iter()
            .map(|slot| slot.value().clone())
            .collect();
        for slot in slots {
            if let Some(connection) = slot.get() {
                connection.close();
            }
        }
    }

    fn evict(&self, address: &str, slot: &ConnectionSlot) {
        self.inner
            .connections
            .remove_if(address, |_, current| Arc::ptr_eq(current, slot));
    }

    async fn open(&self, address: String) -> Result<Arc<Connection>> {
        let inner = &self.inner;
        let stream = transport::connect(&address, inner.connect_timeout).await?;
        let (read_half, write_half) = stream.into_split();

        let traffic = Arc::new(TrafficStats::default());
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let shutdown = Arc::new(Notify::new());
        let connection = Arc::new(Connection {
            address: address.clone(),
            outbound: tx,
            active: AtomicBool::new(true),
            shutdown: shutdown.clone(),
            traffic: traffic.clone(),
            serializer: inner.codec.serializer_name(),
            compressor: inner.codec.compressor_name(),
        });

        let writer = FrameWriter::new(write_half, inner.codec.clone(), traffic.clone());
        let interval = inner.heartbeat.interval;
        let peer = address.clone();
        let writer_task = tokio::spawn(async move {
            if let Err(e) = run_writer(writer, rx, interval, &peer).await {
                warn!(peer = %peer, error = %e, "writer stopped");
            }
            shutdown.notify_one();
        });

        let reader = FrameReader::new(read_half, inner.codec.clone(), traffic.clone());
        let reporter = traffic.spawn_reporter(address.clone(), REPORT_INTERVAL);
        tokio::spawn(read_loop(
            connection.clone(),
            reader,
            writer_task,
            reporter,
            Arc::downgrade(inner),
            inner.heartbeat.idle_timeout,
        ));

        info!(
            peer = %address,
            serializer = connection.serializer,
            compressor = connection.compressor,
            "connected to provider"
        );
        Ok(connection)
    }
}

async fn read_loop(
    connection: Arc<Connection>,
    mut reader: FrameReader<OwnedReadHalf>,
    writer_task: JoinHandle<()>,
    reporter: JoinHandle<()>,
    manager: Weak<ManagerInner>,
    idle_timeout: Duration,
) {
    let peer = connection.address.clone();
    let inflight = match manager.upgrade() {
        Some(manager) => manager.inflight.clone(),
        None => return,
    };

    loop {
        let frame = tokio::select! {
            _ = connection.shutdown.notified() => break,
            frame = reader.next_within(idle_timeout) => frame,
        };

        match frame {
            Ok(Some(Ok(message))) => match handle_heartbeat(message, &connection.outbound, &peer) {
                Some(Message::Response(response)) => {
                    debug!(peer = %peer, request_id = response.request_id, code = response.code, "response");
                    inflight.complete(response);
                }
                Some(other) => {
                    warn!(peer = %peer, message_type = ?other.message_type(), "unexpected message from provider");
                }
                None => {}
            },
            Ok(Some(Err(e))) => {
                warn!(peer = %peer, error = %e, "dropping undecodable frame");
            }
            Ok(None) => {
                info!(peer = %peer, "provider closed the connection");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "connection failed");
                break;
            }
        }
    }

    connection.active.store(false, Ordering::Release);
    writer_task.abort();
    reporter.abort();

    if let Some(manager) = manager.upgrade() {
        manager.connections.remove_if(&peer, |_, slot| {
            slot.get().is_some_and(|current| Arc::ptr_eq(current, &connection))
        });
    }
    let failed = inflight.clear_channel(&peer);
    connection.traffic.log_final(&peer);
    info!(peer = %peer, failed_requests = failed, "connection removed from pool");
}

#[cfg(test)]
mod tests {
    use super::*;
    use caderpc_common::{Request, Response};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn codec() -> WireCodec {
        WireCodec::with_defaults("json", "none").unwrap()
    }

    fn manager(inflight: InflightManager) -> ConnectionManager {
        ConnectionManager::new(codec(), Duration::from_secs(1), HeartbeatConfig::default(), inflight)
    }

    /// Accepts connections and answers every request with its first argument.
    async fn echo_provider() -> (Endpoint, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (r, w) = stream.into_split();
                    let traffic = Arc::new(TrafficStats::default());
                    let mut reader = FrameReader::new(r, codec(), traffic.clone());
                    let mut writer = FrameWriter::new(w, codec(), traffic);
                    while let Ok(Some(Ok(Message::Request(req)))) = reader.next().await {
                        let result = req.params.first().cloned().unwrap_or(json!(null));
                        let response = Message::Response(Response::success(req.id, result));
                        if writer.send(&response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (Endpoint::new("Echo", "127.0.0.1", port), handle)
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let (endpoint, _server) = echo_provider().await;
        let connections = manager(InflightManager::new(16, 1000));

        let a = connections.get_channel(&endpoint).await.unwrap();
        let b = connections.get_channel(&endpoint).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connections.len(), 1);
        assert_eq!(a.serializer(), "json");
        assert_eq!(a.address(), endpoint.address());
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (endpoint, _server) = echo_provider().await;
        let inflight = InflightManager::new(16, 1000);
        let connections = manager(inflight.clone());

        let connection = connections.get_channel(&endpoint).await.unwrap();
        let request = Request::new("Echo", "echo", vec!["string".into()], vec![json!("hi")]);
        let pending = inflight
            .register(request.id, &endpoint, Duration::from_secs(2))
            .unwrap();
        connection.send(Message::Request(request)).await.unwrap();

        let response = pending.wait().await.unwrap();
        assert_eq!(response.result, Some(json!("hi")));
        assert!(connection.traffic().messages_written >= 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_cached() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connections = manager(InflightManager::new(16, 1000));
        let endpoint = Endpoint::new("Echo", "127.0.0.1", port);
        assert!(connections.get_channel(&endpoint).await.is_err());
        assert!(connections.is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let (endpoint, _server) = echo_provider().await;
        let connections = manager(InflightManager::new(16, 1000));

        let first = connections.get_channel(&endpoint).await.unwrap();
        first.close();
        assert!(!first.is_active());
        assert!(first.send(Message::Request(Request::new("Echo", "echo", vec![], vec![]))).await.is_err());

        // the stale entry is either evicted with an error or already gone
        let mut next = connections.get_channel(&endpoint).await;
        if next.is_err() {
            next = connections.get_channel(&endpoint).await;
        }
        let second = next.unwrap();
        assert!(second.is_active());
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
