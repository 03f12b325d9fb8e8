//! Gateway forwarding tests against the fake node.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{FakeNode, GatewayHandle};
use postage_gateway::config::GatewayConfig;
use postage_gateway::stamp::{MemoryStampRepository, StampManager, StampMetrics};
use postage_gateway::{BatchId, ManagerMode};
use reqwest::StatusCode;
use std::sync::Arc;

const STAMP_ID: &str = "36b7efd913ca4cf880b8eeac5093fa27b0825906c600685b6abdd6566e6cfe8f";

fn config_for(node: &FakeNode) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.bee.api_url = node.url();
    config
}

async fn hardcoded_manager() -> Arc<StampManager> {
    let manager = Arc::new(StampManager::new(
        Arc::new(MemoryStampRepository::new()),
        StampMetrics::new(),
    ));
    manager
        .start(ManagerMode::Hardcoded(BatchId::new(STAMP_ID)))
        .await
        .expect("start");
    manager
}

#[tokio::test]
async fn test_health_and_metrics() {
    let node = FakeNode::start().await;
    let gateway = GatewayHandle::start(&config_for(&node), Some(hardcoded_manager().await)).await;
    let client = reqwest::Client::new();

    let health = client.get(gateway.url("/health")).send().await.expect("health");
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(health.text().await.expect("body"), "OK");

    let metrics = client
        .get(gateway.url("/metrics"))
        .send()
        .await
        .expect("metrics")
        .text()
        .await
        .expect("body");
    assert!(metrics.contains("stamp_get_total"));
    assert!(metrics.contains("stamp_usable_count"));

    gateway.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_upload_gets_stamp_header() {
    let node = FakeNode::start().await;
    let gateway = GatewayHandle::start(&config_for(&node), Some(hardcoded_manager().await)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(gateway.url("/bzz?name=hello.txt"))
        .header("content-type", "text/plain")
        .header("swarm-pin", "true")
        .body("hello swarm")
        .send()
        .await
        .expect("upload");
    assert_eq!(response.status(), StatusCode::CREATED);
    let reply: serde_json::Value = response.json().await.expect("json");
    assert_eq!(reply["reference"], "a".repeat(64));

    let requests = node.requests();
    assert_eq!(requests.len(), 1);
    let forwarded = &requests[0];
    assert_eq!(forwarded.path, "/bzz?name=hello.txt");
    assert_eq!(forwarded.body.as_ref(), b"hello swarm");
    assert_eq!(
        forwarded.headers.get("swarm-postage-batch-id").expect("stamp header"),
        STAMP_ID
    );
    assert!(forwarded.headers.get("swarm-pin").is_none());
    assert_eq!(
        forwarded.headers.get("content-type").expect("content type"),
        "text/plain"
    );

    gateway.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_pin_header_kept_when_configured() {
    let node = FakeNode::start().await;
    let mut config = config_for(&node);
    config.server.remove_pin_header = false;
    let gateway = GatewayHandle::start(&config, Some(hardcoded_manager().await)).await;

    reqwest::Client::new()
        .post(gateway.url("/bytes"))
        .header("swarm-pin", "true")
        .body(vec![1u8, 2, 3])
        .send()
        .await
        .expect("upload");

    let requests = node.requests();
    assert_eq!(requests[0].headers.get("swarm-pin").expect("pin"), "true");

    gateway.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_upload_without_stamp_is_rejected() {
    let node = FakeNode::start().await;
    // started but never refreshed: nothing usable
    let manager = Arc::new(StampManager::new(
        Arc::new(MemoryStampRepository::new()),
        StampMetrics::new(),
    ));
    let gateway = GatewayHandle::start(&config_for(&node), Some(Arc::clone(&manager))).await;

    let response = reqwest::Client::new()
        .post(gateway.url("/chunks"))
        .body("data")
        .send()
        .await
        .expect("upload");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text().await.expect("body"), "No postage stamp");
    assert!(node.requests().is_empty());
    assert_eq!(manager.metrics().get_errors(), 1);

    gateway.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_download_is_relayed_without_stamp() {
    let node = FakeNode::start().await;
    let gateway = GatewayHandle::start(&config_for(&node), Some(hardcoded_manager().await)).await;
    let client = reqwest::Client::new();

    let response = client
        .get(gateway.url(&format!("/bzz/{}/index.html", "a".repeat(64))))
        .send()
        .await
        .expect("download");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("etag").expect("etag"), "\"abc\"");
    assert_eq!(response.text().await.expect("body"), "hello swarm");

    let missing = client
        .get(gateway.url("/bzz/missing"))
        .send()
        .await
        .expect("download");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let broken = client
        .get(gateway.url("/bytes/broken"))
        .send()
        .await
        .expect("download");
    assert_eq!(broken.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(broken.text().await.expect("body"), "node failure");

    for request in node.requests() {
        assert_eq!(request.method, reqwest::Method::GET);
        assert!(request.headers.get("swarm-postage-batch-id").is_none());
    }

    gateway.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_writes_untouched_without_stamp_management() {
    let node = FakeNode::start().await;
    let gateway = GatewayHandle::start(&config_for(&node), None).await;

    let response = reqwest::Client::new()
        .post(gateway.url("/soc/owner/id?sig=00"))
        .header("swarm-postage-batch-id", "client-stamp")
        .body("soc")
        .send()
        .await
        .expect("upload");
    assert_eq!(response.status(), StatusCode::CREATED);

    let requests = node.requests();
    assert_eq!(
        requests[0]
            .headers
            .get("swarm-postage-batch-id")
            .expect("client stamp"),
        "client-stamp"
    );

    gateway.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_unknown_routes_not_forwarded() {
    let node = FakeNode::start().await;
    let gateway = GatewayHandle::start(&config_for(&node), None).await;
    let client = reqwest::Client::new();

    let stamps = client.get(gateway.url("/stamps")).send().await.expect("get");
    assert_eq!(stamps.status(), StatusCode::NOT_FOUND);
    let upload = client.get(gateway.url("/bzz")).send().await.expect("get");
    assert_eq!(upload.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert!(node.requests().is_empty());

    gateway.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_authorization_secret() {
    let node = FakeNode::start().await;
    let mut config = config_for(&node);
    config.server.auth_secret = Some("s3cret".to_string());
    let gateway = GatewayHandle::start(&config, None).await;
    let client = reqwest::Client::new();

    let anonymous = client.get(gateway.url("/health")).send().await.expect("get");
    assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

    let wrong = client
        .get(gateway.url("/bzz/abc"))
        .header("authorization", "nope")
        .send()
        .await
        .expect("get");
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);
    assert!(node.requests().is_empty());

    let authorized = client
        .get(gateway.url("/bzz/abc"))
        .header("authorization", "s3cret")
        .send()
        .await
        .expect("get");
    assert_eq!(authorized.status(), StatusCode::OK);
    assert_eq!(node.requests().len(), 1);

    gateway.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_readiness() {
    let node = FakeNode::start().await;
    let mut config = config_for(&node);
    config.server.readiness_check = true;
    let gateway = GatewayHandle::start(&config, None).await;
    let client = reqwest::Client::new();

    let ready = client.get(gateway.url("/readiness")).send().await.expect("get");
    assert_eq!(ready.status(), StatusCode::OK);

    node.set_topology_depth(0);
    let not_ready = client.get(gateway.url("/readiness")).send().await.expect("get");
    assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    gateway.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_node_down_is_bad_gateway() {
    let node = FakeNode::start().await;
    let config = config_for(&node);
    node.stop().await;

    let gateway = GatewayHandle::start(&config, Some(hardcoded_manager().await)).await;
    let client = reqwest::Client::new();

    let download = client.get(gateway.url("/bytes/abc")).send().await.expect("get");
    assert_eq!(download.status(), StatusCode::BAD_GATEWAY);

    let upload = client
        .post(gateway.url("/bytes"))
        .body("data")
        .send()
        .await
        .expect("post");
    assert_eq!(upload.status(), StatusCode::BAD_GATEWAY);

    // readiness checks are off by default
    let ready = client.get(gateway.url("/readiness")).send().await.expect("get");
    assert_eq!(ready.status(), StatusCode::OK);

    gateway.stop().await;
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let node = FakeNode::start().await;
    let mut config = config_for(&node);
    config.server.max_body_bytes = 8;
    let gateway = GatewayHandle::start(&config, Some(hardcoded_manager().await)).await;
    let client = reqwest::Client::new();

    let oversized = client
        .post(gateway.url("/bytes"))
        .body(vec![0u8; 16])
        .send()
        .await
        .expect("upload");
    assert_eq!(oversized.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(node.requests().is_empty());

    let fits = client
        .post(gateway.url("/bytes"))
        .body(vec![0u8; 8])
        .send()
        .await
        .expect("upload");
    assert_eq!(fits.status(), StatusCode::CREATED);
    assert_eq!(node.requests().len(), 1);

    gateway.stop().await;
    node.stop().await;
}
