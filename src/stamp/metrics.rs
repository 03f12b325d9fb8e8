//! Stamp management metrics.
//!
//! Tracks what the manager does and what it currently serves:
//! - purchases attempted / failed, checks performed / failed
//! - `current_stamp()` calls and misses
//! - top-ups and dilutions
//! - TTL and usage of the served stamp, number of usable stamps

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

struct StampMetricsInner {
    registry: Registry,
    purchases: Counter,
    purchases_failed: Counter,
    checks: Counter,
    checks_failed: Counter,
    gets: Counter,
    get_errors: Counter,
    top_ups: Counter,
    dilutions: Counter,
    ttl: Gauge,
    usage: Gauge<f64, AtomicU64>,
    usable_count: Gauge,
}

/// Cloneable handle to the stamp metrics.
#[derive(Clone)]
pub struct StampMetrics {
    inner: Arc<StampMetricsInner>,
}

impl StampMetrics {
    /// Create the metrics and register them in a fresh registry.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let purchases = Counter::default();
        registry.register(
            "stamp_purchase",
            "How many stamp purchases were attempted",
            purchases.clone(),
        );
        let purchases_failed = Counter::default();
        registry.register(
            "stamp_purchase_failed",
            "How many stamps failed to be purchased",
            purchases_failed.clone(),
        );
        let checks = Counter::default();
        registry.register(
            "stamp_check",
            "How many times were stamps retrieved from the node",
            checks.clone(),
        );
        let checks_failed = Counter::default();
        registry.register(
            "stamp_check_failed",
            "How many stamp retrievals failed",
            checks_failed.clone(),
        );
        let gets = Counter::default();
        registry.register(
            "stamp_get",
            "How many times a stamp was requested for a write",
            gets.clone(),
        );
        let get_errors = Counter::default();
        registry.register(
            "stamp_get_error",
            "How many times a stamp was requested and none was usable",
            get_errors.clone(),
        );
        let top_ups = Counter::default();
        registry.register(
            "stamp_topup",
            "How many top-up operations were performed",
            top_ups.clone(),
        );
        let dilutions = Counter::default();
        registry.register(
            "stamp_dilute",
            "How many dilute operations were performed",
            dilutions.clone(),
        );
        let ttl = Gauge::default();
        registry.register("stamp_ttl", "TTL of the served stamp", ttl.clone());
        let usage = Gauge::<f64, AtomicU64>::default();
        registry.register("stamp_usage", "Usage of the served stamp", usage.clone());
        let usable_count = Gauge::default();
        registry.register(
            "stamp_usable_count",
            "How many stamps on the node can be used",
            usable_count.clone(),
        );

        Self {
            inner: Arc::new(StampMetricsInner {
                registry,
                purchases,
                purchases_failed,
                checks,
                checks_failed,
                gets,
                get_errors,
                top_ups,
                dilutions,
                ttl,
                usage,
                usable_count,
            }),
        }
    }

    /// Record a purchase attempt.
    pub fn record_purchase(&self) {
        self.inner.purchases.inc();
    }

    /// Record a failed purchase.
    pub fn record_purchase_failed(&self) {
        self.inner.purchases_failed.inc();
    }

    /// Record a refresh cycle that fetched a snapshot.
    pub fn record_check(&self) {
        self.inner.checks.inc();
    }

    /// Record a refresh cycle whose snapshot fetch failed.
    pub fn record_check_failed(&self) {
        self.inner.checks_failed.inc();
    }

    /// Record a `current_stamp()` call.
    pub fn record_get(&self) {
        self.inner.gets.inc();
    }

    /// Record a `current_stamp()` call that found nothing.
    pub fn record_get_error(&self) {
        self.inner.get_errors.inc();
    }

    /// Record a successful top-up.
    pub fn record_top_up(&self) {
        self.inner.top_ups.inc();
    }

    /// Record a successful dilution.
    pub fn record_dilution(&self) {
        self.inner.dilutions.inc();
    }

    /// Publish the state of the served stamp set.
    pub fn set_served(&self, best_ttl: i64, best_usage: f64, usable_count: usize) {
        self.inner.ttl.set(best_ttl);
        self.inner.usage.set(best_usage);
        self.inner
            .usable_count
            .set(i64::try_from(usable_count).unwrap_or(i64::MAX));
    }

    /// Number of purchase attempts so far.
    #[must_use]
    pub fn purchases(&self) -> u64 {
        self.inner.purchases.get()
    }

    /// Number of failed purchases so far.
    #[must_use]
    pub fn purchases_failed(&self) -> u64 {
        self.inner.purchases_failed.get()
    }

    /// Number of refresh cycles that fetched a snapshot.
    #[must_use]
    pub fn checks(&self) -> u64 {
        self.inner.checks.get()
    }

    /// Number of failed snapshot fetches.
    #[must_use]
    pub fn checks_failed(&self) -> u64 {
        self.inner.checks_failed.get()
    }

    /// Number of `current_stamp()` calls.
    #[must_use]
    pub fn gets(&self) -> u64 {
        self.inner.gets.get()
    }

    /// Number of `current_stamp()` misses.
    #[must_use]
    pub fn get_errors(&self) -> u64 {
        self.inner.get_errors.get()
    }

    /// Number of successful top-ups.
    #[must_use]
    pub fn top_ups(&self) -> u64 {
        self.inner.top_ups.get()
    }

    /// Number of successful dilutions.
    #[must_use]
    pub fn dilutions(&self) -> u64 {
        self.inner.dilutions.get()
    }

    /// Number of stamps currently served.
    #[must_use]
    pub fn usable_count(&self) -> i64 {
        self.inner.usable_count.get()
    }

    /// Render all metrics in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.inner.registry)?;
        Ok(buffer)
    }
}

impl Default for StampMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StampMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampMetrics")
            .field("purchases", &self.purchases())
            .field("checks", &self.checks())
            .field("gets", &self.gets())
            .finish_non_exhaustive()
    }
}
