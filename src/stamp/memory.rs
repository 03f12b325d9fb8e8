//! In-process postage API.
//!
//! Behaves like the node's postage API closely enough to drive the manager
//! without a node: purchased stamps become usable after a configurable number
//! of reads, top-ups extend TTL, dilutions raise depth and briefly make the
//! stamp unusable. Every operation is counted, and listings can be made to
//! fail, so tests can observe exactly what the manager did.

use super::{Amount, BatchId, Stamp, StampRepository};
use crate::error::{Error, Result};
use async_trait::async_trait;
use num_traits::ToPrimitive;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Bucket depth assigned to stamps created here.
const BUCKET_DEPTH: u8 = 16;

#[derive(Debug)]
struct Entry {
    stamp: Stamp,
    /// Reads left before a pending stamp turns usable.
    reads_until_usable: Option<u32>,
}

/// Count of each operation performed against the repository.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    /// `list_stamps` calls.
    pub list: u32,
    /// `get_stamp` calls.
    pub get: u32,
    /// `create_stamp` calls.
    pub create: u32,
    /// `top_up` calls.
    pub top_up: u32,
    /// `dilute` calls.
    pub dilute: u32,
}

/// [`StampRepository`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStampRepository {
    stamps: Mutex<BTreeMap<BatchId, Entry>>,
    calls: Mutex<CallCounts>,
    next_id: AtomicU64,
    /// Reads a freshly created or diluted stamp stays unusable for.
    usable_after_reads: AtomicU32,
    fail_listing: AtomicBool,
    fail_creation: AtomicBool,
    fail_top_up: AtomicBool,
    /// Stamps whose top-ups are rejected.
    fail_top_up_ids: Mutex<BTreeSet<BatchId>>,
    /// Stamps whose dilutions are rejected.
    fail_dilute_ids: Mutex<BTreeSet<BatchId>>,
    /// Artificial latency of `create_stamp`, in milliseconds.
    create_delay_ms: AtomicU64,
}

impl MemoryStampRepository {
    /// Empty repository; created stamps are usable on the first read.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the repository with an existing stamp.
    pub fn insert(&self, stamp: Stamp) {
        self.stamps.lock().insert(
            stamp.id.clone(),
            Entry {
                stamp,
                reads_until_usable: None,
            },
        );
    }

    /// Remove every stamp.
    pub fn clear(&self) {
        self.stamps.lock().clear();
    }

    /// Make created and diluted stamps stay unusable for `reads` reads.
    pub fn set_usable_after_reads(&self, reads: u32) {
        self.usable_after_reads.store(reads, Ordering::SeqCst);
    }

    /// Make `list_stamps` fail until reset.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make `create_stamp` fail until reset.
    pub fn set_fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Make `top_up` fail until reset.
    pub fn set_fail_top_up(&self, fail: bool) {
        self.fail_top_up.store(fail, Ordering::SeqCst);
    }

    /// Make `top_up` of `id` fail until reset, leaving other stamps alone.
    pub fn set_fail_top_up_for(&self, id: &BatchId, fail: bool) {
        let mut ids = self.fail_top_up_ids.lock();
        if fail {
            ids.insert(id.clone());
        } else {
            ids.remove(id);
        }
    }

    /// Make `dilute` of `id` fail until reset, leaving other stamps alone.
    pub fn set_fail_dilute_for(&self, id: &BatchId, fail: bool) {
        let mut ids = self.fail_dilute_ids.lock();
        if fail {
            ids.insert(id.clone());
        } else {
            ids.remove(id);
        }
    }

    /// Delay every `create_stamp` call.
    pub fn set_create_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.create_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Overwrite a stamp's utilization, simulating writes under it.
    pub fn set_utilization(&self, id: &BatchId, utilization: u64) {
        if let Some(entry) = self.stamps.lock().get_mut(id) {
            entry.stamp.utilization = utilization;
        }
    }

    /// Operations performed so far.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        *self.calls.lock()
    }

    /// Current state of a stamp without counting a read.
    #[must_use]
    pub fn peek(&self, id: &BatchId) -> Option<Stamp> {
        self.stamps.lock().get(id).map(|e| e.stamp.clone())
    }

    /// Count a read of `entry` and report its state.
    fn observe(entry: &mut Entry) -> Stamp {
        match entry.reads_until_usable {
            Some(0) => {
                entry.stamp.usable = true;
                entry.reads_until_usable = None;
            }
            Some(n) => entry.reads_until_usable = Some(n - 1),
            None => {}
        }
        entry.stamp.clone()
    }

    fn not_found(id: &BatchId) -> Error {
        Error::Repository(format!("stamp {id} not found"))
    }
}

#[async_trait]
impl StampRepository for MemoryStampRepository {
    async fn list_stamps(&self) -> Result<Vec<Stamp>> {
        self.calls.lock().list += 1;
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(Error::Repository("listing unavailable".to_string()));
        }

        let mut stamps = self.stamps.lock();
        Ok(stamps.values_mut().map(Self::observe).collect())
    }

    async fn get_stamp(&self, id: &BatchId) -> Result<Stamp> {
        self.calls.lock().get += 1;
        let mut stamps = self.stamps.lock();
        let entry = stamps.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        Ok(Self::observe(entry))
    }

    async fn create_stamp(&self, depth: u8, amount: &Amount) -> Result<BatchId> {
        self.calls.lock().create += 1;

        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(Error::Repository("insufficient funds".to_string()));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = BatchId::new(format!("{n:064x}"));
        // one unit of amount buys one second of TTL
        let ttl = amount.as_biguint().to_i64().unwrap_or(i64::MAX);
        let mut stamp = Stamp::new(id.clone(), depth, BUCKET_DEPTH, amount.clone(), ttl);
        stamp.usable = false;
        stamp.label = "memory".to_string();

        debug!("Created in-memory stamp {} (depth={}, amount={})", id, depth, amount);
        self.stamps.lock().insert(
            id.clone(),
            Entry {
                stamp,
                reads_until_usable: Some(self.usable_after_reads.load(Ordering::SeqCst)),
            },
        );
        Ok(id)
    }

    async fn top_up(&self, id: &BatchId, amount: &Amount) -> Result<Stamp> {
        self.calls.lock().top_up += 1;
        if self.fail_top_up.load(Ordering::SeqCst) || self.fail_top_up_ids.lock().contains(id) {
            return Err(Error::Repository(format!("top-up of {id} rejected")));
        }

        let mut stamps = self.stamps.lock();
        let entry = stamps.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        let extra = amount.as_biguint().to_i64().unwrap_or(i64::MAX);
        entry.stamp.amount = &entry.stamp.amount + amount;
        entry.stamp.ttl_seconds = entry.stamp.ttl_seconds.saturating_add(extra);
        Ok(entry.stamp.clone())
    }

    async fn dilute(&self, id: &BatchId, depth: u8) -> Result<()> {
        self.calls.lock().dilute += 1;
        if self.fail_dilute_ids.lock().contains(id) {
            return Err(Error::Repository(format!("dilution of {id} rejected")));
        }

        let mut stamps = self.stamps.lock();
        let entry = stamps.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if depth <= entry.stamp.depth {
            return Err(Error::Repository(format!(
                "depth {depth} does not increase depth {} of {id}",
                entry.stamp.depth
            )));
        }

        // capacity doubles per step while funds are shared, so TTL halves per step
        let steps = u32::from(depth - entry.stamp.depth);
        entry.stamp.ttl_seconds = entry.stamp.ttl_seconds.checked_shr(steps).unwrap_or(0);
        entry.stamp.depth = depth;
        entry.stamp.usable = false;
        entry.reads_until_usable = Some(self.usable_after_reads.load(Ordering::SeqCst));
        Ok(())
    }
}
