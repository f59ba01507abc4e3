//! Provider bootstrap and per-connection dispatch loop.
//!
//! # Request Flow
//!
//! 1. The accept loop hands each TCP connection to its own task
//! 2. The connection task reads frames, answers heartbeats and admits requests:
//!    the global concurrency limiter first, then the connection's rate limiter
//! 3. Admitted requests are queued on the [`WorkerPool`]; a full pool is
//!    answered with a busy response
//! 4. A worker invokes the service method and queues the response on the
//!    connection's writer
//! 5. Once the response is flushed, the request's global permit is returned
//!
//! Each connection counts the permits it holds. A response write returns one;
//! closing the connection returns whatever is left, so a permit is released
//! exactly once whether or not its response ever reached the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use caderpc_common::codec::WireCodec;
use caderpc_common::limit::{ConcurrencyLimiter, Limiter, RateLimiter};
use caderpc_common::registry::ServiceRegistry;
use caderpc_common::transport::traffic::REPORT_INTERVAL;
use caderpc_common::transport::{
    handle_heartbeat, run_writer, FrameReader, FrameWriter, HeartbeatConfig, Outbound,
    TrafficSnapshot, TrafficStats, OUTBOUND_QUEUE_SIZE,
};
use caderpc_common::{codes, CadeError, Endpoint, Message, Request, Response, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ProviderConfig, SHUTDOWN_GRACE};
use crate::service::Service;
use crate::worker_pool::{Job, WorkerPool};

/// A bound provider that has not started serving yet.
pub struct ProviderServer {
    config: ProviderConfig,
    registry: Arc<dyn ServiceRegistry>,
    services: HashMap<String, Arc<dyn Service>>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProviderServer {
    /// Validates `config` and binds the listener.
    pub async fn bind(config: ProviderConfig, registry: Arc<dyn ServiceRegistry>) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_address())
            .await
            .map_err(|e| CadeError::Transport(format!("failed to bind {}: {}", config.bind_address(), e)))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            config,
            registry,
            services: HashMap::new(),
            listener,
            local_addr,
        })
    }

    /// Exposes `service` under `name`.
    pub fn service(mut self, name: impl Into<String>, service: Arc<dyn Service>) -> Self {
        self.services.insert(name.into(), service);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers an endpoint per service and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Registry failures. Endpoints registered before the failure are
    /// unregistered again.
    pub async fn spawn(self) -> Result<ServerHandle> {
        let codec = self.config.codec()?;
        let mut endpoints: Vec<Endpoint> = self
            .services
            .keys()
            .map(|name| Endpoint::new(name.clone(), self.config.host.clone(), self.local_addr.port()))
            .collect();
        endpoints.sort_by(|a, b| a.service_name.cmp(&b.service_name));

        for (registered, endpoint) in endpoints.iter().enumerate() {
            if let Err(e) = self.registry.register(endpoint).await {
                for done in &endpoints[..registered] {
                    let _ = self.registry.unregister(done).await;
                }
                return Err(e);
            }
            info!(%endpoint, "service registered");
        }

        let shared = Arc::new(Shared {
            services: self.services,
            codec,
            heartbeat: self.config.heartbeat,
            connection_rate: self.config.connection_rate,
            global: Arc::new(ConcurrencyLimiter::new(self.config.max_requests)),
            pool: WorkerPool::new(self.config.workers, self.config.worker_queue),
            connections: DashMap::new(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(self.listener, shared.clone(), shutdown_rx));
        info!(addr = %self.local_addr, services = endpoints.len(), "provider listening");

        Ok(ServerHandle {
            local_addr: self.local_addr,
            endpoints,
            registry: self.registry,
            shared,
            shutdown,
            accept_task,
        })
    }
}

/// A running provider.
pub struct ServerHandle {
    local_addr: SocketAddr,
    endpoints: Vec<Endpoint>,
    registry: Arc<dyn ServiceRegistry>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoints registered for this provider, one per service.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Open consumer connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Traffic counters of every open connection, keyed by peer address.
    pub fn traffic(&self) -> Vec<(SocketAddr, TrafficSnapshot)> {
        self.shared
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().snapshot()))
            .collect()
    }

    /// Global permits not held by an admitted request.
    pub fn available_permits(&self) -> usize {
        self.shared.global.available()
    }

    /// Unregisters every endpoint, closes all connections and stops the
    /// worker pool.
    pub async fn shutdown(self) {
        for endpoint in &self.endpoints {
            if let Err(e) = self.registry.unregister(endpoint).await {
                warn!(%endpoint, error = %e, "failed to unregister service");
            }
        }

        let _ = self.shutdown.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE, self.accept_task).await.is_err() {
            warn!(addr = %self.local_addr, "accept loop did not stop in time");
        }
        self.shared.pool.shutdown().await;
        info!(addr = %self.local_addr, "provider stopped");
    }
}

struct Shared {
    services: HashMap<String, Arc<dyn Service>>,
    codec: WireCodec,
    heartbeat: HeartbeatConfig,
    connection_rate: u64,
    global: Arc<ConcurrencyLimiter>,
    pool: WorkerPool,
    connections: DashMap<SocketAddr, Arc<TrafficStats>>,
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut connections = Vec::new();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                connections.retain(|task: &JoinHandle<()>| !task.is_finished());
                connections.push(tokio::spawn(serve_connection(
                    stream,
                    peer,
                    shared.clone(),
                    shutdown.clone(),
                )));
            }
            Err(e) => error!(error = %e, "failed to accept connection"),
        }
    }

    for task in connections {
        let _ = task.await;
    }
}

/// Permits held by one connection's admitted requests.
#[derive(Clone)]
struct HeldPermits {
    global: Arc<ConcurrencyLimiter>,
    outstanding: Arc<AtomicUsize>,
}

impl HeldPermits {
    fn acquire(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns one permit, unless the connection already returned them all.
    fn release_one(&self) {
        if self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            self.global.release(1);
        }
    }

    fn release_all(&self) -> usize {
        let held = self.outstanding.swap(0, Ordering::AcqRel);
        self.global.release(held);
        held
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let peer_name = peer.to_string();

    let traffic = Arc::new(TrafficStats::default());
    shared.connections.insert(peer, traffic.clone());
    let reporter = traffic.spawn_reporter(peer_name.clone(), REPORT_INTERVAL);

    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_SIZE);
    let writer = FrameWriter::new(write_half, shared.codec.clone(), traffic.clone());
    let interval = shared.heartbeat.interval;
    let writer_peer = peer_name.clone();
    let writer_task = tokio::spawn(async move {
        if let Err(e) = run_writer(writer, rx, interval, &writer_peer).await {
            debug!(peer = %writer_peer, error = %e, "writer stopped");
        }
    });

    let mut reader = FrameReader::new(read_half, shared.codec.clone(), traffic.clone());
    let rate = RateLimiter::new(shared.connection_rate);
    let permits = HeldPermits {
        global: shared.global.clone(),
        outstanding: Arc::new(AtomicUsize::new(0)),
    };

    loop {
        let next = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            next = reader.next_within(shared.heartbeat.idle_timeout) => next,
        };
        match next {
            Ok(Some(Ok(message))) => match handle_heartbeat(message, &tx, &peer_name) {
                Some(Message::Request(request)) => {
                    admit(&shared, request, &rate, &permits, &tx).await;
                }
                Some(other) => {
                    warn!(peer = %peer_name, kind = ?other.message_type(), "ignoring unexpected message");
                }
                None => {}
            },
            Ok(Some(Err(e))) => {
                warn!(peer = %peer_name, error = %e, "skipping undecodable frame");
            }
            Ok(None) => {
                debug!(peer = %peer_name, "consumer closed connection");
                break;
            }
            Err(CadeError::Timeout(ms)) => {
                info!(peer = %peer_name, idle_ms = ms, "closing idle connection");
                break;
            }
            Err(e) => {
                warn!(peer = %peer_name, error = %e, "closing connection");
                break;
            }
        }
    }

    let released = permits.release_all();
    drop(tx);
    writer_task.abort();
    reporter.abort();
    shared.connections.remove(&peer);
    traffic.log_final(&peer_name);
    info!(peer = %peer_name, released_permits = released, "connection closed");
}

async fn admit(
    shared: &Shared,
    request: Request,
    rate: &RateLimiter,
    permits: &HeldPermits,
    tx: &mpsc::Sender<Outbound>,
) {
    let id = request.id;
    debug!(request_id = id, service = %request.service_name, method = %request.method_name, "request received");

    if !shared.global.try_acquire() {
        reject(tx, &request, codes::LIMITED, "provider concurrency limit reached").await;
        return;
    }
    if !rate.try_acquire() {
        shared.global.release(1);
        reject(tx, &request, codes::LIMITED, "connection rate limit reached").await;
        return;
    }
    permits.acquire();

    let service = shared.services.get(&request.service_name).cloned();
    let job_permits = permits.clone();
    let job_tx = tx.clone();
    let job: Job = Box::new(move || {
        let response = execute(service.as_deref(), &request);
        let outbound = Outbound::new(Message::Response(response))
            .on_written(move || job_permits.release_one());
        if job_tx.blocking_send(outbound).is_err() {
            debug!(request_id = id, "connection closed before response was queued");
        }
    });

    if shared.pool.try_submit(job).is_err() {
        warn!(request_id = id, "worker pool full, answering busy");
        let busy = Response::error(id, codes::BUSY, "provider worker pool is full");
        let busy_permits = permits.clone();
        let outbound = Outbound::new(Message::Response(busy)).on_written(move || busy_permits.release_one());
        if tx.send(outbound).await.is_err() {
            debug!(request_id = id, "connection closed before busy response was queued");
        }
    }
}

async fn reject(tx: &mpsc::Sender<Outbound>, request: &Request, code: i32, message: &str) {
    debug!(request_id = request.id, code, reason = message, "request rejected");
    let response = Response::error(request.id, code, message).with_trace_id(request.trace_id.clone());
    let _ = tx.send(Outbound::new(Message::Response(response))).await;
}

/// Runs the method and turns every outcome, panics included, into a response.
fn execute(service: Option<&dyn Service>, request: &Request) -> Response {
    let id = request.id;
    let trace_id = request.trace_id.clone();
    let Some(service) = service else {
        return Response::error(
            id,
            codes::NO_SUCH_SERVICE,
            format!("no such service: {}", request.service_name),
        )
        .with_trace_id(trace_id);
    };

    let invoked = catch_unwind(AssertUnwindSafe(|| {
        let args = request.params.clone();
        if request.generic_invoke {
            service.invoke_generic(&request.method_name, &request.param_types, args)
        } else {
            service.invoke(&request.method_name, &request.param_types, args)
        }
    }));

    let response = match invoked {
        Ok(Ok(result)) => Response::success(id, result),
        Ok(Err(CadeError::NoSuchMethod(signature))) => Response::error(
            id,
            codes::NO_SUCH_SERVICE,
            format!("no such method: {}.{}", request.service_name, signature),
        ),
        Ok(Err(CadeError::Application { message, .. })) => Response::error(id, codes::ERROR, message),
        Ok(Err(e)) => Response::error(id, codes::ERROR, e.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "service method panicked".to_string());
            error!(request_id = id, method = %request.signature(), panic = %message, "service method panicked");
            Response::error(id, codes::ERROR, message)
        }
    };
    response.with_trace_id(trace_id)
}
