//! Postage stamp management.
//!
//! Every write forwarded to the node must carry a postage stamp: a prepaid
//! voucher bounded both in capacity and in funded time. This module keeps a
//! usable stamp available at all times.
//!
//! # Architecture
//!
//! ```text
//!  refresh tick
//!       │
//!       ▼
//! ┌──────────────────┐   list/create/topup/dilute   ┌──────────────────┐
//! │   StampManager   │ ───────────────────────────▶ │ StampRepository  │
//! └────────┬─────────┘                              └──────────────────┘
//!          │ select (policy) + usage (usage)
//!          ▼
//!   served snapshot (ArcSwap) ◀── current_stamp() from request handlers
//! ```

pub mod bee;
mod manager;
pub mod memory;
pub mod metrics;
pub mod policy;
mod repository;
pub mod usage;

pub use bee::BeeStampRepository;
pub use manager::{
    AutobuyMode, CycleSummary, ExtendMode, ManagerMode, ManagerTimings, RefreshOutcome,
    StampManager,
};
pub use memory::MemoryStampRepository;
pub use metrics::StampMetrics;
pub use repository::StampRepository;

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of a postage stamp, as assigned by the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Wrap an identifier reported by the node.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as sent in the stamp header.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Arbitrary-precision amount funding a stamp's lifetime.
///
/// The node reports amounts as decimal strings; they routinely exceed `u64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Amount(BigUint);

impl Amount {
    /// Build an amount from a machine integer.
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self(BigUint::from(value))
    }

    /// Returns true if the amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// The underlying big integer.
    #[must_use]
    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }
}

impl std::ops::Add<&Amount> for &Amount {
    type Output = Amount;

    fn add(self, rhs: &Amount) -> Amount {
        Amount(&self.0 + &rhs.0)
    }
}

impl From<BigUint> for Amount {
    fn from(value: BigUint) -> Self {
        Self(value)
    }
}

impl FromStr for Amount {
    type Err = num_bigint::ParseBigIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BigUint::from_str(s.trim()).map(Self)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Number(n) => Ok(Self::from_u64(n)),
        }
    }
}

/// Snapshot of a postage stamp as last reported by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    /// Stamp identifier.
    pub id: BatchId,
    /// log2 of the number of chunks the stamp can cover. Only grows (dilution).
    pub depth: u8,
    /// log2 of the bucket count used for utilization accounting.
    pub bucket_depth: u8,
    /// Funded amount per chunk. Only grows (top-up).
    pub amount: Amount,
    /// Fill level of the fullest bucket.
    pub utilization: u64,
    /// False right after creation or dilution until the node confirms it.
    pub usable: bool,
    /// Remaining funded seconds.
    pub ttl_seconds: i64,
    /// Free-form label set at purchase.
    pub label: String,
    /// Whether the stamp is immutable.
    pub immutable: bool,
    /// Whether the stamp still exists on chain.
    pub exists: bool,
    /// Block the stamp was created in.
    pub block_number: u64,
}

impl Stamp {
    /// A fresh, empty stamp with the given parameters.
    #[must_use]
    pub fn new(id: BatchId, depth: u8, bucket_depth: u8, amount: Amount, ttl_seconds: i64) -> Self {
        Self {
            id,
            depth,
            bucket_depth,
            amount,
            utilization: 0,
            usable: true,
            ttl_seconds,
            label: String::new(),
            immutable: false,
            exists: true,
            block_number: 0,
        }
    }

    /// Usage fraction in `[0, 1]`, see [`usage::usage`].
    #[must_use]
    pub fn usage(&self) -> f64 {
        usage::usage(self)
    }
}
