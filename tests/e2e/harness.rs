//! In-process fake storage node and gateway launcher.
//!
//! Both run on `127.0.0.1:0`, so tests can run in parallel.

#![allow(clippy::expect_used)]

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use bytes::Bytes;
use parking_lot::Mutex;
use postage_gateway::gateway::{self, Gateway};
use postage_gateway::stamp::{StampManager, StampMetrics};
use postage_gateway::GatewayConfig;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Bucket depth of every stamp on the fake node.
const BUCKET_DEPTH: u8 = 16;

/// A content request received by the fake node.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    /// Path and query.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct NodeState {
    requests: Mutex<Vec<RecordedRequest>>,
    stamps: Mutex<BTreeMap<String, Value>>,
    health_status: Mutex<String>,
    topology_depth: AtomicU32,
    next_id: AtomicU64,
}

/// Spawn `router` on an ephemeral port.
async fn spawn(router: Router) -> (SocketAddr, watch::Sender<bool>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        gateway::serve(listener, router, shutdown_rx)
            .await
            .expect("serve");
    });
    (addr, shutdown_tx, task)
}

/// Storage node speaking just enough of the node API for the gateway.
pub struct FakeNode {
    addr: SocketAddr,
    state: Arc<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FakeNode {
    /// Start a healthy node without stamps.
    pub async fn start() -> Self {
        let state = Arc::new(NodeState {
            requests: Mutex::new(Vec::new()),
            stamps: Mutex::new(BTreeMap::new()),
            health_status: Mutex::new("ok".to_string()),
            topology_depth: AtomicU32::new(8),
            next_id: AtomicU64::new(0),
        });

        let router = Router::new()
            .route("/health", get(health))
            .route("/topology", get(topology))
            .route("/stamps", get(list_stamps))
            .route("/stamps/:key", get(get_stamp))
            .route("/stamps/:key/:depth", post(create_stamp))
            .route("/stamps/topup/:id/:amount", patch(top_up))
            .route("/stamps/dilute/:id/:depth", patch(dilute))
            .fallback(content)
            .with_state(Arc::clone(&state));

        let (addr, shutdown_tx, task) = spawn(router).await;
        Self {
            addr,
            state,
            shutdown_tx,
            task,
        }
    }

    /// Base URL of the node API.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Content requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Add a usable stamp.
    pub fn insert_stamp(&self, id: &str, depth: u8, utilization: u64, ttl: i64) {
        self.state
            .stamps
            .lock()
            .insert(id.to_string(), stamp_json(id, depth, "1000000", utilization, ttl));
    }

    /// Current JSON of a stamp.
    pub fn stamp(&self, id: &str) -> Option<Value> {
        self.state.stamps.lock().get(id).cloned()
    }

    /// Status reported by `/health`.
    pub fn set_health(&self, status: &str) {
        *self.state.health_status.lock() = status.to_string();
    }

    /// Depth reported by `/topology`.
    pub fn set_topology_depth(&self, depth: u32) {
        self.state.topology_depth.store(depth, Ordering::SeqCst);
    }

    /// Shut the node down and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.task.await.expect("fake node task");
    }
}

fn stamp_json(id: &str, depth: u8, amount: &str, utilization: u64, ttl: i64) -> Value {
    json!({
        "batchID": id,
        "utilization": utilization,
        "usable": true,
        "label": "",
        "depth": depth,
        "amount": amount,
        "bucketDepth": BUCKET_DEPTH,
        "blockNumber": 1,
        "immutableFlag": false,
        "exists": true,
        "batchTTL": ttl
    })
}

async fn health(State(state): State<Arc<NodeState>>) -> Json<Value> {
    Json(json!({
        "status": *state.health_status.lock(),
        "version": "2.0.0",
        "apiVersion": "7.0.0"
    }))
}

async fn topology(State(state): State<Arc<NodeState>>) -> Json<Value> {
    Json(json!({
        "baseAddr": "00",
        "population": 100,
        "connected": 10,
        "depth": state.topology_depth.load(Ordering::SeqCst)
    }))
}

async fn list_stamps(State(state): State<Arc<NodeState>>) -> Json<Value> {
    let stamps: Vec<Value> = state.stamps.lock().values().cloned().collect();
    Json(json!({ "stamps": stamps }))
}

async fn get_stamp(State(state): State<Arc<NodeState>>, Path(id): Path<String>) -> Response {
    match state.stamps.lock().get(&id) {
        Some(stamp) => Json(stamp.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"code": 404, "message": "issuer does not exist"})),
        )
            .into_response(),
    }
}

async fn create_stamp(
    State(state): State<Arc<NodeState>>,
    Path((amount, depth)): Path<(String, u8)>,
) -> Response {
    let Ok(ttl) = amount.parse::<i64>() else {
        return (StatusCode::BAD_REQUEST, "invalid amount").into_response();
    };
    let n = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let id = format!("{n:064x}");
    state
        .stamps
        .lock()
        .insert(id.clone(), stamp_json(&id, depth, &amount, 0, ttl));
    (StatusCode::CREATED, Json(json!({ "batchID": id }))).into_response()
}

async fn top_up(
    State(state): State<Arc<NodeState>>,
    Path((id, amount)): Path<(String, i64)>,
) -> Response {
    let mut stamps = state.stamps.lock();
    let Some(stamp) = stamps.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let current: i64 = stamp["amount"]
        .as_str()
        .and_then(|a| a.parse().ok())
        .unwrap_or_default();
    stamp["amount"] = json!((current + amount).to_string());
    stamp["batchTTL"] = json!(stamp["batchTTL"].as_i64().unwrap_or_default() + amount);
    (StatusCode::ACCEPTED, Json(json!({ "batchID": id }))).into_response()
}

async fn dilute(
    State(state): State<Arc<NodeState>>,
    Path((id, depth)): Path<(String, u8)>,
) -> Response {
    let mut stamps = state.stamps.lock();
    let Some(stamp) = stamps.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    stamp["depth"] = json!(depth);
    stamp["batchTTL"] = json!(stamp["batchTTL"].as_i64().unwrap_or_default() / 2);
    (StatusCode::ACCEPTED, Json(json!({ "batchID": id }))).into_response()
}

/// Content endpoints: records the request and answers like the node would.
async fn content(State(state): State<Arc<NodeState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("request body");
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);

    state.requests.lock().push(RecordedRequest {
        method: parts.method.clone(),
        path: path.clone(),
        headers: parts.headers,
        body,
    });

    if path.starts_with("/bzz/missing") {
        return (StatusCode::NOT_FOUND, Json(json!({"code": 404, "message": "Not Found"})))
            .into_response();
    }
    if path.starts_with("/bytes/broken") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "node failure").into_response();
    }
    if parts.method == Method::POST {
        return (
            StatusCode::CREATED,
            Json(json!({ "reference": "a".repeat(64) })),
        )
            .into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain"), (header::ETAG, "\"abc\"")],
        "hello swarm",
    )
        .into_response()
}

/// Gateway running in the background.
pub struct GatewayHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// Start a gateway for `config`, using `manager` for stamps if given.
    pub async fn start(config: &GatewayConfig, manager: Option<Arc<StampManager>>) -> Self {
        let metrics = manager
            .as_ref()
            .map_or_else(StampMetrics::new, |m| m.metrics().clone());
        let router = Gateway::new(config, manager, metrics)
            .expect("gateway")
            .router();

        let (addr, shutdown_tx, task) = spawn(router).await;
        Self {
            addr,
            shutdown_tx,
            task,
        }
    }

    /// URL of `path` on the gateway.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Shut the gateway down and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.task.await.expect("gateway task");
    }
}
