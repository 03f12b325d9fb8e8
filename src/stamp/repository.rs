//! Narrow interface over the node's postage API.

use super::{Amount, BatchId, Stamp};
use crate::error::Result;
use async_trait::async_trait;

/// Remote store of postage stamps.
///
/// Implementations are network bound and eventually consistent: a mutation
/// acknowledged by one call may not be visible to the next listing yet.
/// Failures are reported as [`crate::Error::Repository`].
#[async_trait]
pub trait StampRepository: Send + Sync {
    /// Snapshot of every stamp the node knows about.
    async fn list_stamps(&self) -> Result<Vec<Stamp>>;

    /// Current state of a single stamp.
    async fn get_stamp(&self, id: &BatchId) -> Result<Stamp>;

    /// Purchase a stamp. The returned id is typically not usable yet.
    async fn create_stamp(&self, depth: u8, amount: &Amount) -> Result<BatchId>;

    /// Add `amount` to a stamp and return its state afterwards.
    async fn top_up(&self, id: &BatchId, amount: &Amount) -> Result<Stamp>;

    /// Increase a stamp's depth to `depth`.
    async fn dilute(&self, id: &BatchId, depth: u8) -> Result<()>;
}
