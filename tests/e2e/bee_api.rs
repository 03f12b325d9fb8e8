//! Postage API client against the fake node.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::FakeNode;
use postage_gateway::stamp::{
    AutobuyMode, BeeStampRepository, ManagerMode, StampManager, StampMetrics,
};
use postage_gateway::{Amount, BatchId, Error, StampRepository};
use std::sync::Arc;
use std::time::Duration;

const STAMP_ID: &str = "6d32e6f1b724f8658830e51f8f57aa6029f82ee7a30e4fc0c1bfe23ab5632b27";

#[tokio::test]
async fn test_list_and_get_stamps() {
    let node = FakeNode::start().await;
    node.insert_stamp(STAMP_ID, 20, 14, 48_151);
    let repo = BeeStampRepository::new(&node.url()).expect("client");

    let stamps = repo.list_stamps().await.expect("list");
    assert_eq!(stamps.len(), 1);
    assert_eq!(stamps[0].id.as_str(), STAMP_ID);
    assert!((stamps[0].usage() - 0.875).abs() < f64::EPSILON);

    let stamp = repo.get_stamp(&BatchId::new(STAMP_ID)).await.expect("get");
    assert_eq!(stamp.ttl_seconds, 48_151);
    assert_eq!(stamp.amount, Amount::from_u64(1_000_000));

    node.stop().await;
}

#[tokio::test]
async fn test_unknown_stamp_is_repository_error() {
    let node = FakeNode::start().await;
    let repo = BeeStampRepository::new(&node.url()).expect("client");

    let err = repo
        .get_stamp(&BatchId::new("ff"))
        .await
        .expect_err("missing stamp");
    assert!(matches!(err, Error::Repository(_)));
    assert!(err.to_string().contains("404"));

    node.stop().await;
}

#[tokio::test]
async fn test_create_top_up_and_dilute() {
    let node = FakeNode::start().await;
    let repo = BeeStampRepository::new(&node.url()).expect("client");

    let id = repo
        .create_stamp(22, &Amount::from_u64(5000))
        .await
        .expect("create");
    let created = node.stamp(id.as_str()).expect("created on node");
    assert_eq!(created["depth"], 22);

    let topped = repo
        .top_up(&id, &Amount::from_u64(1000))
        .await
        .expect("top up");
    assert_eq!(topped.amount, Amount::from_u64(6000));
    assert_eq!(topped.ttl_seconds, 6000);

    repo.dilute(&id, 23).await.expect("dilute");
    let diluted = repo.get_stamp(&id).await.expect("get");
    assert_eq!(diluted.depth, 23);
    assert_eq!(diluted.ttl_seconds, 3000);

    node.stop().await;
}

#[tokio::test]
async fn test_readiness() {
    let node = FakeNode::start().await;
    let repo = BeeStampRepository::new(&node.url()).expect("client");
    assert!(repo.check_readiness().await);

    node.set_topology_depth(0);
    assert!(!repo.check_readiness().await);

    node.set_topology_depth(31);
    assert!(!repo.check_readiness().await);

    node.set_topology_depth(30);
    node.set_health("nok");
    assert!(!repo.check_readiness().await);

    node.stop().await;
}

#[tokio::test]
async fn test_unreachable_node() {
    let node = FakeNode::start().await;
    let url = node.url();
    node.stop().await;

    let repo = BeeStampRepository::new(&url).expect("client");
    assert!(matches!(
        repo.list_stamps().await,
        Err(Error::Repository(_))
    ));
    assert!(!repo.check_readiness().await);
}

#[tokio::test]
async fn test_autobuy_against_node() {
    let node = FakeNode::start().await;
    let repo = Arc::new(BeeStampRepository::new(&node.url()).expect("client"));
    let manager = Arc::new(StampManager::new(repo, StampMetrics::new()));

    manager
        .start(ManagerMode::Autobuy(AutobuyMode {
            depth: 20,
            amount: Amount::from_u64(1_000_000),
            usage_max: 0.9,
            usage_threshold: 0.7,
            ttl_min: Duration::from_secs(1000),
            refresh_period: Duration::from_secs(3600),
        }))
        .await
        .expect("start");

    let id = manager.current_stamp().expect("bought a stamp");
    assert!(node.stamp(id.as_str()).is_some());
    assert_eq!(manager.metrics().purchases(), 1);

    manager.stop();
    node.stop().await;
}
