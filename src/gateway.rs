//! HTTP front of the gateway.
//!
//! Serves health, readiness and metrics, and forwards content requests to
//! the storage node. Writes get the current postage stamp attached; when no
//! stamp is usable they are answered `503 No postage stamp` without ever
//! reaching the node.

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::stamp::{BeeStampRepository, StampManager, StampMetrics};
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Header carrying the stamp a write is paid with.
pub const SWARM_STAMP_HEADER: HeaderName = HeaderName::from_static("swarm-postage-batch-id");

/// Header asking the node to pin uploaded content.
pub const SWARM_PIN_HEADER: HeaderName = HeaderName::from_static("swarm-pin");

const METRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Headers that describe a single connection and must not be relayed.
const HOP_BY_HOP: [HeaderName; 4] = [
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::HOST,
    header::TRANSFER_ENCODING,
];

/// Shared state of the HTTP front.
pub struct Gateway {
    bee_url: String,
    client: reqwest::Client,
    node: BeeStampRepository,
    manager: Option<Arc<StampManager>>,
    metrics: StampMetrics,
    auth_secret: Option<String>,
    remove_pin_header: bool,
    readiness_check: bool,
    max_body_bytes: usize,
}

impl Gateway {
    /// Build the gateway from configuration.
    ///
    /// `manager` is `None` when stamp management is disabled; writes are then
    /// forwarded with whatever stamp header the client sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the request timeout is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        config: &GatewayConfig,
        manager: Option<Arc<StampManager>>,
        metrics: StampMetrics,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("postage-gateway/", env!("CARGO_PKG_VERSION")))
            .timeout(config.bee.request_timeout()?)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            bee_url: config.bee.api_url.trim_end_matches('/').to_string(),
            client,
            node: BeeStampRepository::new(&config.bee.api_url)?,
            manager,
            metrics,
            auth_secret: config
                .server
                .auth_secret
                .clone()
                .filter(|secret| !secret.is_empty()),
            remove_pin_header: config.server.remove_pin_header,
            readiness_check: config.server.readiness_check,
            max_body_bytes: config.server.max_body_bytes,
        })
    }

    /// Routes of the gateway.
    pub fn router(self) -> Router {
        let state = Arc::new(self);

        Router::new()
            .route("/health", get(health))
            .route("/readiness", get(readiness))
            .route("/metrics", get(metrics))
            .route("/chunks", post(forward))
            .route("/chunks/*path", get(forward))
            .route("/bytes", post(forward))
            .route("/bytes/*path", get(forward))
            .route("/bzz", post(forward))
            .route("/bzz/*path", get(forward))
            .route("/soc/*path", post(forward))
            .route("/feeds/*path", get(forward).post(forward))
            .layer(middleware::from_fn_with_state(state.clone(), authorize))
            .with_state(state)
    }

    async fn forward(&self, request: Request) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);

        let limit = self.max_body_bytes;
        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        if declared.is_some_and(|length| length > u64::try_from(limit).unwrap_or(u64::MAX)) {
            return Err(Error::PayloadTooLarge { limit });
        }

        let mut headers = parts.headers;
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }
        if self.remove_pin_header {
            headers.remove(SWARM_PIN_HEADER);
        }

        if parts.method == Method::POST {
            if let Some(manager) = &self.manager {
                let stamp = manager.current_stamp()?;
                let value = HeaderValue::from_str(stamp.as_str())
                    .map_err(|e| Error::Gateway(format!("Invalid stamp id {stamp}: {e}")))?;
                headers.insert(SWARM_STAMP_HEADER, value);
            }
        }

        // bodies without a declared length are cut off at the same limit
        let body: Bytes = to_bytes(body, limit).await.map_err(|e| {
            debug!("Rejected request body: {e}");
            Error::PayloadTooLarge { limit }
        })?;

        debug!("Forwarding {} {}", parts.method, path);
        let response = self
            .client
            .request(parts.method.clone(), format!("{}{}", self.bee_url, path))
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("{} {} failed: {e}", parts.method, path)))?;

        let status = response.status();
        let headers = relayable(response.headers());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Gateway(format!("Failed to read node response: {e}")))?;

        let mut relayed = Response::new(Body::from(bytes));
        *relayed.status_mut() = status;
        *relayed.headers_mut() = headers;
        Ok(relayed)
    }
}

fn relayable(headers: &HeaderMap) -> HeaderMap {
    let mut headers = headers.clone();
    for name in &HOP_BY_HOP {
        if *name != header::CONTENT_LENGTH {
            headers.remove(name);
        }
    }
    headers
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NoStampAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            warn!("Request failed: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}

async fn authorize(State(gateway): State<Arc<Gateway>>, request: Request, next: Next) -> Response {
    if let Some(secret) = gateway.auth_secret.as_deref() {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if provided != Some(secret) {
            debug!("Rejected unauthorized request to {}", request.uri().path());
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    next.run(request).await
}

async fn health() -> &'static str {
    "OK"
}

async fn readiness(State(gateway): State<Arc<Gateway>>) -> Response {
    if !gateway.readiness_check || gateway.node.check_readiness().await {
        return "OK".into_response();
    }
    (StatusCode::SERVICE_UNAVAILABLE, "Not ready").into_response()
}

async fn metrics(State(gateway): State<Arc<Gateway>>) -> Response {
    match gateway.metrics.encode() {
        Ok(text) => ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], text).into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn forward(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    gateway
        .forward(request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// Serve `router` on `listener` until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Gateway listening on {}", addr);
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("Gateway stopped");
    Ok(())
}
