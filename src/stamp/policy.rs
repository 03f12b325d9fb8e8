//! Stamp selection policy.
//!
//! Pure functions turning a snapshot of stamps into ordered candidate sets
//! and into the actions the manager should take. None of them fail; an empty
//! snapshot simply yields an empty selection.

use super::usage::{min_acceptable_ttl, usage};
use super::{Amount, Stamp};
use std::cmp::Ordering;
use std::time::Duration;

/// Stamps usable in autobuy mode, most used first.
///
/// Keeps stamps that are `usable`, match `depth` and `amount` exactly, have
/// `usage < usage_max` and more than `ttl_min` seconds to live. Packing writes
/// into the fullest stamp leaves emptier ones room to grow.
#[must_use]
pub fn select_for_autobuy(
    stamps: &[Stamp],
    depth: u8,
    amount: &Amount,
    usage_max: f64,
    ttl_min: Duration,
) -> Vec<Stamp> {
    let ttl_min = ttl_min.as_secs_f64();
    let mut selected: Vec<Stamp> = stamps
        .iter()
        .filter(|s| {
            s.usable
                && s.depth == depth
                && s.amount == *amount
                && usage(s) < usage_max
                && s.ttl_seconds as f64 > ttl_min
        })
        .cloned()
        .collect();
    selected.sort_by(by_usage_descending);
    selected
}

/// All usable stamps, soonest to expire first.
#[must_use]
pub fn select_for_ttl_extension(stamps: &[Stamp]) -> Vec<Stamp> {
    let mut selected: Vec<Stamp> = stamps.iter().filter(|s| s.usable).cloned().collect();
    selected.sort_by_key(|s| s.ttl_seconds);
    selected
}

/// Usable stamps filled beyond `usage_threshold`, most used first.
///
/// A threshold of zero or below disables capacity extension.
#[must_use]
pub fn select_for_capacity_extension(stamps: &[Stamp], usage_threshold: f64) -> Vec<Stamp> {
    if usage_threshold <= 0.0 {
        return Vec::new();
    }

    let mut selected: Vec<Stamp> = stamps
        .iter()
        .filter(|s| s.usable && usage(s) > usage_threshold)
        .cloned()
        .collect();
    selected.sort_by(by_usage_descending);
    selected
}

/// Whether autobuy has to purchase a stamp.
///
/// `selected` must be ordered as [`select_for_autobuy`] returns it; the last
/// element is the least used one. A purchase is due when nothing is selected
/// or when even the least used stamp is past `usage_threshold`.
#[must_use]
pub fn autobuy_needs_purchase(selected: &[Stamp], usage_threshold: f64) -> bool {
    selected
        .last()
        .map_or(true, |least_used| usage(least_used) > usage_threshold)
}

/// Whether extend mode has to purchase a stamp: nothing usable exists.
#[must_use]
pub fn extend_needs_purchase(selected_for_ttl: &[Stamp]) -> bool {
    selected_for_ttl.is_empty()
}

/// Whether a stamp's TTL must be topped up before the next check.
#[must_use]
pub fn needs_ttl_top_up(stamp: &Stamp, ttl_min: Duration, refresh_period: Duration) -> bool {
    !ttl_min.is_zero() && (stamp.ttl_seconds as f64) < min_acceptable_ttl(ttl_min, refresh_period)
}

/// Depth a stamp is diluted to. Always exactly one step, doubling capacity.
///
/// `None` when the depth cannot grow any further.
#[must_use]
pub fn dilution_target(stamp: &Stamp) -> Option<u8> {
    stamp.depth.checked_add(1)
}

/// Amount added to a stamp before dilution: its current amount, so funded
/// time survives the capacity doubling.
#[must_use]
pub fn capacity_top_up_amount(stamp: &Stamp) -> Amount {
    stamp.amount.clone()
}

/// Stamps served in extend mode.
///
/// Stamps still below the capacity threshold, in TTL order. If every stamp is
/// above it, all TTL-ordered stamps are served rather than none.
#[must_use]
pub fn served_in_extend_mode(selected_for_ttl: &[Stamp], usage_threshold: f64) -> Vec<Stamp> {
    if usage_threshold <= 0.0 {
        return selected_for_ttl.to_vec();
    }

    let below: Vec<Stamp> = selected_for_ttl
        .iter()
        .filter(|s| usage(s) <= usage_threshold)
        .cloned()
        .collect();

    if below.is_empty() {
        selected_for_ttl.to_vec()
    } else {
        below
    }
}

fn by_usage_descending(a: &Stamp, b: &Stamp) -> Ordering {
    usage(b).total_cmp(&usage(a))
}
