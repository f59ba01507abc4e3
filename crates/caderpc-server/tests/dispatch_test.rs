//! Provider dispatch tests over real TCP connections.
//!
//! The client side here is a bare frame reader/writer pair so each test can
//! pipeline requests and inspect every response code.

use std::sync::Arc;
use std::time::Duration;

use caderpc_common::codec::WireCodec;
use caderpc_common::registry::{MemoryRegistry, ServiceRegistry};
use caderpc_common::transport::{FrameReader, FrameWriter, TrafficStats};
use caderpc_common::{codes, CadeError, Heartbeat, Message, Request, Response};
use caderpc_server::service::{arg, MethodTable};
use caderpc_server::{ProviderConfig, ProviderServer, ServerHandle};
use serde_json::json;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}

fn calculator() -> MethodTable {
    MethodTable::new()
        .method("add", &["int", "int"], |args| {
            Ok(json!(arg::<i64>(&args, 0)? + arg::<i64>(&args, 1)?))
        })
        .method("sleep", &["long"], |args| {
            std::thread::sleep(Duration::from_millis(arg::<u64>(&args, 0)?));
            Ok(json!("slept"))
        })
        .method("fail", &[], |_| {
            Err(CadeError::Application {
                code: -1,
                message: "division by zero".into(),
            })
        })
        .method("panic", &[], |_| panic!("handler blew up"))
}

async fn start(config: ProviderConfig) -> (ServerHandle, Arc<MemoryRegistry>) {
    init_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    let handle = ProviderServer::bind(config, registry.clone())
        .await
        .unwrap()
        .service("Calculator", Arc::new(calculator()))
        .spawn()
        .await
        .unwrap();
    (handle, registry)
}

struct WireClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl WireClient {
    async fn connect(handle: &ServerHandle) -> Self {
        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (read, write) = stream.into_split();
        let codec = WireCodec::with_defaults("json", "none").unwrap();
        Self {
            reader: FrameReader::new(read, codec.clone(), Arc::new(TrafficStats::default())),
            writer: FrameWriter::new(write, codec, Arc::new(TrafficStats::default())),
        }
    }

    async fn send(&mut self, request: &Request) {
        self.writer.send(&Message::Request(request.clone())).await.unwrap();
    }

    async fn recv(&mut self) -> Response {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), self.reader.next())
                .await
                .expect("no response within 5s");
            match next.unwrap().unwrap().unwrap() {
                Message::Response(response) => return response,
                Message::HeartbeatRequest(_) => continue,
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    async fn call(&mut self, request: Request) -> Response {
        self.send(&request).await;
        let response = self.recv().await;
        assert_eq!(response.request_id, request.id);
        response
    }
}

fn request(method: &str, types: &[&str], args: Vec<serde_json::Value>) -> Request {
    Request::new(
        "Calculator",
        method,
        types.iter().map(|t| t.to_string()).collect(),
        args,
    )
}

async fn wait_for_permits(handle: &ServerHandle, expected: usize) {
    for _ in 0..100 {
        if handle.available_permits() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.available_permits(), expected);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_round_trip_copies_id_and_trace() {
    let (handle, _) = start(ProviderConfig::default()).await;
    let mut client = WireClient::connect(&handle).await;

    let req = request("add", &["int", "int"], vec![json!(20), json!(22)]).with_trace_id("t-42");
    let response = client.call(req).await;
    assert_eq!(response.code, codes::OK);
    assert_eq!(response.result, Some(json!(42)));
    assert_eq!(response.trace_id.as_deref(), Some("t-42"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_failures_become_responses() {
    let (handle, _) = start(ProviderConfig::default()).await;
    let mut client = WireClient::connect(&handle).await;

    let unknown = Request::new("Nope", "add", vec![], vec![]);
    assert_eq!(client.call(unknown).await.code, codes::NO_SUCH_SERVICE);

    let missing = request("sub", &["int", "int"], vec![json!(1), json!(2)]);
    assert_eq!(client.call(missing).await.code, codes::NO_SUCH_SERVICE);

    let failed = client.call(request("fail", &[], vec![])).await;
    assert_eq!(failed.code, codes::ERROR);
    assert_eq!(failed.message.as_deref(), Some("division by zero"));

    let panicked = client.call(request("panic", &[], vec![])).await;
    assert_eq!(panicked.code, codes::ERROR);

    // the connection survives all of the above
    let ok = client
        .call(request("add", &["int", "int"], vec![json!(1), json!(1)]))
        .await;
    assert_eq!(ok.result, Some(json!(2)));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_generic_invoke_matches_arity() {
    let (handle, _) = start(ProviderConfig::default()).await;
    let mut client = WireClient::connect(&handle).await;

    let generic = Request::new("Calculator", "add", vec![], vec![json!(3), json!(4)]).generic();
    let response = client.call(generic).await;
    assert_eq!(response.result, Some(json!(7)));

    let typed = Request::new("Calculator", "add", vec![], vec![json!(3), json!(4)]);
    assert_eq!(client.call(typed).await.code, codes::NO_SUCH_SERVICE);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_is_answered() {
    let (handle, _) = start(ProviderConfig::default()).await;
    let mut client = WireClient::connect(&handle).await;

    let beat = Heartbeat { request_time_ms: 1234 };
    client.writer.send(&Message::HeartbeatRequest(beat)).await.unwrap();
    let reply = client.reader.next().await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::HeartbeatResponse(beat));

    handle.shutdown().await;
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_connection_rate_limit() {
    let (handle, _) = start(ProviderConfig::default().with_connection_rate(2)).await;
    let mut client = WireClient::connect(&handle).await;

    let requests: Vec<Request> = (0..6)
        .map(|i| request("add", &["int", "int"], vec![json!(i), json!(0)]))
        .collect();
    for req in &requests {
        client.send(req).await;
    }

    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..requests.len() {
        match client.recv().await.code {
            codes::OK => ok += 1,
            codes::LIMITED => limited += 1,
            other => panic!("unexpected code {}", other),
        }
    }
    assert!(ok >= 2, "ok = {}", ok);
    assert!(limited >= 2, "limited = {}", limited);

    // rate rejections hand their global permit straight back
    wait_for_permits(&handle, 1_000_000).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_global_limit_and_release_on_write() {
    let config = ProviderConfig::default().with_max_requests(1);
    let (handle, _) = start(config).await;
    let mut client = WireClient::connect(&handle).await;

    let slow = request("sleep", &["long"], vec![json!(300)]);
    let second = request("add", &["int", "int"], vec![json!(1), json!(2)]);
    client.send(&slow).await;
    client.send(&second).await;

    let first = client.recv().await;
    assert_eq!(first.request_id, second.id);
    assert_eq!(first.code, codes::LIMITED);

    let finished = client.recv().await;
    assert_eq!(finished.request_id, slow.id);
    assert_eq!(finished.code, codes::OK);

    wait_for_permits(&handle, 1).await;
    let again = client
        .call(request("add", &["int", "int"], vec![json!(1), json!(2)]))
        .await;
    assert_eq!(again.code, codes::OK);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_full_pool_answers_busy() {
    let config = ProviderConfig::default().with_workers(1, 1).with_max_requests(100);
    let (handle, _) = start(config).await;
    let mut client = WireClient::connect(&handle).await;

    for _ in 0..5 {
        client.send(&request("sleep", &["long"], vec![json!(200)])).await;
    }

    let mut ok = 0;
    let mut busy = 0;
    for _ in 0..5 {
        match client.recv().await.code {
            codes::OK => ok += 1,
            codes::BUSY => busy += 1,
            other => panic!("unexpected code {}", other),
        }
    }
    assert!((1..=2).contains(&ok), "ok = {}", ok);
    assert_eq!(ok + busy, 5);

    // busy responses release their permits too
    wait_for_permits(&handle, 100).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_closed_connection_returns_permits() {
    let config = ProviderConfig::default().with_max_requests(4);
    let (handle, _) = start(config).await;

    let mut client = WireClient::connect(&handle).await;
    client.send(&request("sleep", &["long"], vec![json!(300)])).await;
    client.send(&request("sleep", &["long"], vec![json!(300)])).await;
    wait_for_permits(&handle, 2).await;
    drop(client);

    wait_for_permits(&handle, 4).await;
    for _ in 0..100 {
        if handle.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.connection_count(), 0);

    // the workers finishing later must not push the count past capacity
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(handle.available_permits(), 4);

    handle.shutdown().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_spawn_registers_and_shutdown_unregisters() {
    let (handle, registry) = start(ProviderConfig::default()).await;
    let port = handle.local_addr().port();

    let listed = registry.fetch_service_list("Calculator").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].port, port);
    assert_eq!(handle.endpoints(), listed.as_slice());

    let mut client = WireClient::connect(&handle).await;
    client
        .call(request("add", &["int", "int"], vec![json!(1), json!(1)]))
        .await;
    assert_eq!(handle.connection_count(), 1);
    assert_eq!(handle.traffic().len(), 1);

    handle.shutdown().await;
    assert!(registry.fetch_service_list("Calculator").await.unwrap().is_empty());

    // the provider side of the connection is gone
    let next = tokio::time::timeout(Duration::from_secs(2), client.reader.next()).await.unwrap();
    assert!(matches!(next, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_bind_rejects_invalid_config() {
    let registry = Arc::new(MemoryRegistry::new());
    let result = ProviderServer::bind(ProviderConfig::default().with_workers(0, 1), registry).await;
    assert!(matches!(result, Err(CadeError::Config(_))));
}
