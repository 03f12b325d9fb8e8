//! Postage API client for the storage node.
//!
//! Implements [`StampRepository`] over the node's HTTP API:
//! - `GET /stamps` and `GET /stamps/{id}` for snapshots
//! - `POST /stamps/{amount}/{depth}` to purchase
//! - `PATCH /stamps/topup/{id}/{amount}` and `PATCH /stamps/dilute/{id}/{depth}`
//!
//! It also answers the gateway's readiness probe.

use super::{Amount, BatchId, Stamp, StampRepository};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Timeout applied to every postage API call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout of the readiness probe calls.
const READINESS_TIMEOUT: Duration = Duration::from_secs(3);

/// Postage batch as serialized by the node.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostageBatch {
    /// Stamp id.
    #[serde(rename = "batchID")]
    pub batch_id: BatchId,
    /// Fill level of the fullest bucket.
    pub utilization: u64,
    /// Whether the stamp can be used.
    pub usable: bool,
    /// Label given at purchase.
    #[serde(default)]
    pub label: String,
    /// Stamp depth.
    pub depth: u8,
    /// Funded amount.
    pub amount: Amount,
    /// Bucket depth.
    pub bucket_depth: u8,
    /// Creation block.
    #[serde(default)]
    pub block_number: u64,
    /// Immutability flag.
    #[serde(default)]
    pub immutable_flag: bool,
    /// Whether the stamp still exists.
    #[serde(default = "default_exists")]
    pub exists: bool,
    /// Remaining funded seconds.
    #[serde(rename = "batchTTL")]
    pub batch_ttl: i64,
}

const fn default_exists() -> bool {
    true
}

impl From<PostageBatch> for Stamp {
    fn from(batch: PostageBatch) -> Self {
        Self {
            id: batch.batch_id,
            depth: batch.depth,
            bucket_depth: batch.bucket_depth,
            amount: batch.amount,
            utilization: batch.utilization,
            usable: batch.usable,
            ttl_seconds: batch.batch_ttl,
            label: batch.label,
            immutable: batch.immutable_flag,
            exists: batch.exists,
            block_number: batch.block_number,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StampsResponse {
    stamps: Vec<PostageBatch>,
}

#[derive(Debug, Deserialize)]
struct BatchIdResponse {
    #[serde(rename = "batchID")]
    batch_id: BatchId,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct TopologyResponse {
    depth: u32,
}

/// [`StampRepository`] backed by the node's HTTP API.
#[derive(Debug, Clone)]
pub struct BeeStampRepository {
    /// Base URL of the node API, without trailing slash.
    base_url: String,
    /// HTTP client shared by all calls.
    client: reqwest::Client,
}

impl BeeStampRepository {
    /// Create a client for the node at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("postage-gateway/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Base URL of the node API.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the node is healthy and connected to the network.
    ///
    /// Ready means `/health` reports `ok` and the topology depth is in `1..31`.
    pub async fn check_readiness(&self) -> bool {
        let health: Result<HealthResponse> = self
            .request(Method::GET, "/health", Some(READINESS_TIMEOUT))
            .await;
        let topology: Result<TopologyResponse> = self
            .request(Method::GET, "/topology", Some(READINESS_TIMEOUT))
            .await;

        match (health, topology) {
            (Ok(health), Ok(topology)) => {
                health.status == "ok" && (1..31).contains(&topology.depth)
            }
            (Err(e), _) | (_, Err(e)) => {
                debug!("Readiness check failed: {}", e);
                false
            }
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut builder = self.client.request(method.clone(), &url);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Repository(format!("{method} {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Repository(format!(
                "{method} {path} returned status {status}: {}",
                body.trim()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Repository(format!("Failed to parse {method} {path}: {e}")))
    }
}

#[async_trait]
impl StampRepository for BeeStampRepository {
    async fn list_stamps(&self) -> Result<Vec<Stamp>> {
        let response: StampsResponse = self.request(Method::GET, "/stamps", None).await?;
        Ok(response.stamps.into_iter().map(Stamp::from).collect())
    }

    async fn get_stamp(&self, id: &BatchId) -> Result<Stamp> {
        let batch: PostageBatch = self
            .request(Method::GET, &format!("/stamps/{id}"), None)
            .await?;
        Ok(batch.into())
    }

    async fn create_stamp(&self, depth: u8, amount: &Amount) -> Result<BatchId> {
        let response: BatchIdResponse = self
            .request(Method::POST, &format!("/stamps/{amount}/{depth}"), None)
            .await?;
        Ok(response.batch_id)
    }

    async fn top_up(&self, id: &BatchId, amount: &Amount) -> Result<Stamp> {
        let _: BatchIdResponse = self
            .request(Method::PATCH, &format!("/stamps/topup/{id}/{amount}"), None)
            .await?;
        self.get_stamp(id).await
    }

    async fn dilute(&self, id: &BatchId, depth: u8) -> Result<()> {
        let _: BatchIdResponse = self
            .request(Method::PATCH, &format!("/stamps/dilute/{id}/{depth}"), None)
            .await?;
        Ok(())
    }
}
