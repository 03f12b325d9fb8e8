//! Capacity arithmetic for postage stamps.

use super::Stamp;
use std::time::Duration;

/// Size of one chunk covered by a stamp slot, in bytes.
pub const CHUNK_SIZE_BYTES: u64 = 4096;

/// Usage fraction of a stamp: `utilization / 2^(depth - bucket_depth)`.
///
/// `1.0` means the fullest bucket cannot take another chunk. A stamp whose
/// `bucket_depth` exceeds its `depth` is malformed and reported as full.
#[must_use]
pub fn usage(stamp: &Stamp) -> f64 {
    match bucket_capacity(stamp) {
        Some(capacity) => stamp.utilization as f64 / capacity as f64,
        None => 1.0,
    }
}

/// Number of slots per bucket, `2^(depth - bucket_depth)`.
///
/// `None` for malformed stamps or exponents that do not fit in a `u64`.
#[must_use]
pub fn bucket_capacity(stamp: &Stamp) -> Option<u64> {
    let exponent = stamp.depth.checked_sub(stamp.bucket_depth)?;
    1u64.checked_shl(u32::from(exponent))
}

/// Upper bound of bytes a stamp of `depth` can cover if perfectly balanced.
#[must_use]
pub fn theoretical_capacity_bytes(depth: u8) -> u128 {
    (1u128 << u32::from(depth.min(100))) * u128::from(CHUNK_SIZE_BYTES)
}

/// Bytes still writable under the stamp, assuming buckets fill evenly.
#[must_use]
pub fn remaining_capacity_bytes(stamp: &Stamp) -> u128 {
    let total = theoretical_capacity_bytes(stamp.depth) as f64;
    let remaining = (1.0 - usage(stamp)).max(0.0);
    (total * remaining) as u128
}

/// Smallest TTL a stamp may have and still be acceptable at the next check.
///
/// A stamp above this now is still above `ttl_min` one refresh period later.
#[must_use]
pub fn min_acceptable_ttl(ttl_min: Duration, refresh_period: Duration) -> f64 {
    ttl_min.as_secs_f64() + refresh_period.as_secs_f64()
}
