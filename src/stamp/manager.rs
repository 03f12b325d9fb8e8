//! Postage stamp lifecycle manager.
//!
//! Keeps a usable stamp available for every write:
//! 1. Periodically fetch a snapshot of the node's stamps
//! 2. Select the stamps worth serving (see [`super::policy`])
//! 3. Buy, top up or dilute stamps under single-flight and debounce guards
//! 4. Publish the selection as an immutable snapshot
//!
//! Request handlers only ever read the latest published snapshot through
//! [`StampManager::current_stamp`], which never performs I/O.

use super::metrics::StampMetrics;
use super::{policy, Amount, BatchId, Stamp, StampRepository};
use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex as CycleLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Smallest `ttl_min` accepted when TTL extension is enabled.
pub const MIN_EXTEND_TTL: Duration = Duration::from_secs(60);

/// Autobuy mode: serve stamps of one configured shape, buying more as they fill.
#[derive(Debug, Clone, PartialEq)]
pub struct AutobuyMode {
    /// Depth of purchased (and served) stamps.
    pub depth: u8,
    /// Amount of purchased (and served) stamps.
    pub amount: Amount,
    /// Stamps at or above this usage are not served.
    pub usage_max: f64,
    /// Buy when even the least used served stamp is above this usage.
    pub usage_threshold: f64,
    /// Stamps with this TTL or less are not served.
    pub ttl_min: Duration,
    /// Time between refresh cycles.
    pub refresh_period: Duration,
}

/// Extend mode: keep existing stamps alive and roomy instead of buying new ones.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendMode {
    /// Top up stamps whose TTL runs low.
    pub enable_ttl: bool,
    /// Dilute stamps whose usage runs high.
    pub enable_capacity: bool,
    /// Depth of the stamp bought when none is usable.
    pub depth: u8,
    /// Amount of the stamp bought when none is usable.
    pub amount: Amount,
    /// Amount added on a TTL top-up. Zero disables TTL top-ups.
    pub topup_amount: Amount,
    /// TTL below which a stamp is topped up.
    pub ttl_min: Duration,
    /// Usage above which a stamp is diluted.
    pub usage_threshold: f64,
    /// Time between refresh cycles.
    pub refresh_period: Duration,
}

/// How the manager sources stamps. Fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerMode {
    /// Always serve this stamp; nothing is refreshed.
    Hardcoded(BatchId),
    /// See [`AutobuyMode`].
    Autobuy(AutobuyMode),
    /// See [`ExtendMode`].
    Extend(ExtendMode),
}

impl ManagerMode {
    /// Check the mode is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Hardcoded(id) => {
                if id.as_str().is_empty() {
                    return Err(Error::Config("hardcoded stamp id is empty".into()));
                }
            }
            Self::Autobuy(config) => {
                validate_purchase(config.depth, &config.amount, config.refresh_period)?;
                if !(config.usage_max > 0.0 && config.usage_max <= 1.0) {
                    return Err(Error::Config(format!(
                        "autobuy usage_max must be in (0, 1], got {}",
                        config.usage_max
                    )));
                }
                if !(0.0..=1.0).contains(&config.usage_threshold) {
                    return Err(Error::Config(format!(
                        "autobuy usage_threshold must be in [0, 1], got {}",
                        config.usage_threshold
                    )));
                }
            }
            Self::Extend(config) => {
                if !config.enable_ttl && !config.enable_capacity {
                    return Err(Error::Config(
                        "extend mode needs TTL or capacity extension enabled".into(),
                    ));
                }
                validate_purchase(config.depth, &config.amount, config.refresh_period)?;
                if config.enable_ttl && config.ttl_min < MIN_EXTEND_TTL {
                    return Err(Error::Config(format!(
                        "extend ttl_min must be at least {}s, got {}s",
                        MIN_EXTEND_TTL.as_secs(),
                        config.ttl_min.as_secs()
                    )));
                }
                if config.enable_capacity
                    && !(config.usage_threshold > 0.0 && config.usage_threshold <= 1.0)
                {
                    return Err(Error::Config(format!(
                        "extend usage_threshold must be in (0, 1], got {}",
                        config.usage_threshold
                    )));
                }
            }
        }
        Ok(())
    }

    /// Refresh period, or `None` for modes without a refresh loop.
    #[must_use]
    pub fn refresh_period(&self) -> Option<Duration> {
        match self {
            Self::Hardcoded(_) => None,
            Self::Autobuy(config) => Some(config.refresh_period),
            Self::Extend(config) => Some(config.refresh_period),
        }
    }
}

fn validate_purchase(depth: u8, amount: &Amount, refresh_period: Duration) -> Result<()> {
    if depth == 0 {
        return Err(Error::Config("stamp depth must be set".into()));
    }
    if amount.is_zero() {
        return Err(Error::Config("stamp amount must be positive".into()));
    }
    if refresh_period.is_zero() {
        return Err(Error::Config("refresh period must be positive".into()));
    }
    Ok(())
}

/// Waiting budgets of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerTimings {
    /// Pause between polls of a purchased stamp.
    pub purchase_poll_interval: Duration,
    /// Polls before a purchase counts as timed out.
    pub purchase_poll_attempts: u32,
    /// How long a stamp stays ineligible after a top-up or dilution.
    ///
    /// This is a debounce against stale reads, not a completion signal: the
    /// node does not report when a top-up has propagated.
    pub pending_cooldown: Duration,
}

impl Default for ManagerTimings {
    fn default() -> Self {
        Self {
            purchase_poll_interval: Duration::from_secs(1),
            purchase_poll_attempts: 120,
            pending_cooldown: Duration::from_secs(60),
        }
    }
}

/// Result of a single refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// No refreshing mode is active.
    Idle,
    /// Another cycle was still running.
    Skipped,
    /// The snapshot could not be fetched; served stamps are unchanged.
    FetchFailed,
    /// The cycle ran to completion.
    Completed(CycleSummary),
}

/// What a completed refresh cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Number of stamps served after the cycle.
    pub usable: usize,
    /// Stamp bought during the cycle.
    pub purchased: Option<BatchId>,
    /// Stamps whose TTL was topped up.
    pub topped_up: Vec<BatchId>,
    /// Stamps whose capacity was extended.
    pub diluted: Vec<BatchId>,
}

/// Immutable snapshot read by request handlers.
#[derive(Debug, Default)]
struct Served {
    /// Run the snapshot belongs to.
    generation: u64,
    hardcoded: Option<BatchId>,
    usable: Vec<Stamp>,
}

/// Handle to the refresh timer of the current run.
struct RunHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Clears an [`AtomicBool`] taken with [`FlagGuard::acquire`] when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the served stamp set and the loop keeping it fresh.
pub struct StampManager {
    repository: Arc<dyn StampRepository>,
    metrics: StampMetrics,
    timings: ManagerTimings,
    mode: RwLock<Option<ManagerMode>>,
    served: ArcSwap<Served>,
    /// Bumped by every `start` and `stop`; a run only installs itself or
    /// its timer while it still holds the latest value.
    generation: AtomicU64,
    /// Held for the whole duration of a refresh cycle.
    cycle: CycleLock<()>,
    /// Taken from stamp creation until it is usable or the purchase failed.
    buy_in_flight: AtomicBool,
    /// Stamps with a top-up or dilution in cool-down.
    pending: Arc<DashSet<BatchId>>,
    /// Stamps funded for a capacity extension whose dilution has not
    /// succeeded yet.
    awaiting_dilution: DashSet<BatchId>,
    run: Mutex<Option<RunHandle>>,
}

impl StampManager {
    /// Create a stopped manager.
    #[must_use]
    pub fn new(repository: Arc<dyn StampRepository>, metrics: StampMetrics) -> Self {
        Self {
            repository,
            metrics,
            timings: ManagerTimings::default(),
            mode: RwLock::new(None),
            served: ArcSwap::from_pointee(Served::default()),
            generation: AtomicU64::new(0),
            cycle: CycleLock::new(()),
            buy_in_flight: AtomicBool::new(false),
            pending: Arc::new(DashSet::new()),
            awaiting_dilution: DashSet::new(),
            run: Mutex::new(None),
        }
    }

    /// Override the waiting budgets.
    #[must_use]
    pub fn with_timings(mut self, timings: ManagerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Start managing stamps in `mode`, replacing any previous run.
    ///
    /// Hardcoded mode only records the stamp. Refreshing modes wait for a
    /// cycle of the previous run to finish, run one cycle before returning,
    /// so callers observe a populated state, then refresh every
    /// `refresh_period`. A failing first cycle does not fail the start; the
    /// next tick retries. A `stop` or another `start` issued meanwhile wins:
    /// this run then never schedules its timer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the mode is invalid. Nothing is changed then.
    pub async fn start(self: &Arc<Self>, mode: ManagerMode) -> Result<()> {
        mode.validate()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel_timer();

        let Some(period) = mode.refresh_period() else {
            if self.begin_run(generation, mode) {
                info!("Stamp manager started in hardcoded mode");
            }
            return Ok(());
        };

        let cycle = self.cycle.lock().await;
        if !self.begin_run(generation, mode) {
            debug!("Stamp manager start superseded before its first refresh");
            return Ok(());
        }
        info!(
            "Stamp manager started (refresh every {}s)",
            period.as_secs_f64()
        );
        self.run_cycle().await;
        drop(cycle);

        let mut run = self.run.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Stamp manager stopped or restarted during initial refresh");
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::run_timer(Arc::downgrade(self), period, shutdown_rx));
        *run = Some(RunHandle { shutdown_tx, task });
        Ok(())
    }

    /// Install `mode` as run `generation`, unless a later `start` or `stop`
    /// superseded it.
    fn begin_run(&self, generation: u64, mode: ManagerMode) -> bool {
        let _run = self.run.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }

        let hardcoded = match &mode {
            ManagerMode::Hardcoded(id) => Some(id.clone()),
            _ => None,
        };
        self.served.store(Arc::new(Served {
            generation,
            hardcoded,
            usable: Vec::new(),
        }));
        *self.mode.write() = Some(mode);
        true
    }

    /// Stop the refresh timer. Safe to call repeatedly, before `start` and
    /// while a `start` is still running its first cycle.
    ///
    /// A cycle already in progress runs to completion; the served snapshot is
    /// kept so writes continue with the last known stamps.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.cancel_timer() {
            info!("Stamp manager stopped");
        }
    }

    fn cancel_timer(&self) -> bool {
        let Some(run) = self.run.lock().take() else {
            return false;
        };

        if let Err(e) = run.shutdown_tx.send(true) {
            debug!("Refresh timer already gone: {e}");
        }
        drop(run.task);
        true
    }

    /// Whether a refresh timer is scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .is_some_and(|run| !run.task.is_finished())
    }

    /// Stamp to attach to a write right now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoStampAvailable`] if nothing usable is known. This is
    /// an expected state during cold start or exhaustion.
    pub fn current_stamp(&self) -> Result<BatchId> {
        self.metrics.record_get();
        let served = self.served.load();

        if let Some(id) = &served.hardcoded {
            debug!("Using hardcoded stamp {}", id);
            return Ok(id.clone());
        }

        if let Some(stamp) = served.usable.first() {
            debug!("Using managed stamp {}", stamp.id);
            return Ok(stamp.id.clone());
        }

        self.metrics.record_get_error();
        Err(Error::NoStampAvailable)
    }

    /// Stamps currently served, best first.
    #[must_use]
    pub fn usable_stamps(&self) -> Vec<Stamp> {
        self.served.load().usable.clone()
    }

    /// Whether `id` is in top-up/dilution cool-down.
    #[must_use]
    pub fn is_pending(&self, id: &BatchId) -> bool {
        self.pending.contains(id)
    }

    /// Whether a purchase is outstanding.
    #[must_use]
    pub fn is_buying(&self) -> bool {
        self.buy_in_flight.load(Ordering::Acquire)
    }

    /// Metrics the manager writes to.
    #[must_use]
    pub fn metrics(&self) -> &StampMetrics {
        &self.metrics
    }

    /// Run one refresh cycle now.
    ///
    /// Cycles never overlap: if one is already running this returns
    /// [`RefreshOutcome::Skipped`] immediately.
    pub async fn refresh(&self) -> RefreshOutcome {
        if !matches!(
            *self.mode.read(),
            Some(ManagerMode::Autobuy(_) | ManagerMode::Extend(_))
        ) {
            return RefreshOutcome::Idle;
        }

        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("Previous refresh cycle still running, skipping");
            return RefreshOutcome::Skipped;
        };
        self.run_cycle().await
    }

    /// One refresh cycle. The caller holds `cycle`.
    async fn run_cycle(&self) -> RefreshOutcome {
        let mode = self.mode.read().clone();
        let mode = match mode {
            Some(ManagerMode::Hardcoded(_)) | None => return RefreshOutcome::Idle,
            Some(mode) => mode,
        };

        // publishes land only while the snapshot this cycle started from is current
        let generation = self.served.load().generation;
        self.metrics.record_check();
        info!("Checking postage stamps");

        let stamps = match self.repository.list_stamps().await {
            Ok(stamps) => stamps,
            Err(e) => {
                self.metrics.record_check_failed();
                error!("Failed to refresh postage stamps: {}", e);
                return RefreshOutcome::FetchFailed;
            }
        };
        debug!("Retrieved {} stamps", stamps.len());

        let summary = match &mode {
            ManagerMode::Autobuy(config) => self.refresh_autobuy(config, &stamps, generation).await,
            ManagerMode::Extend(config) => self.refresh_extend(config, &stamps, generation).await,
            ManagerMode::Hardcoded(_) => CycleSummary::default(),
        };
        RefreshOutcome::Completed(summary)
    }

    async fn refresh_autobuy(
        &self,
        config: &AutobuyMode,
        stamps: &[Stamp],
        generation: u64,
    ) -> CycleSummary {
        let mut usable = policy::select_for_autobuy(
            stamps,
            config.depth,
            &config.amount,
            config.usage_max,
            config.ttl_min,
        );
        self.publish(generation, usable.clone());

        let mut summary = CycleSummary::default();
        if policy::autobuy_needs_purchase(&usable, config.usage_threshold) {
            if let Some(stamp) = self.purchase(config.depth, &config.amount).await {
                summary.purchased = Some(stamp.id.clone());
                usable.push(stamp);
                self.publish(generation, usable.clone());
            }
        }

        summary.usable = usable.len();
        summary
    }

    async fn refresh_extend(
        &self,
        config: &ExtendMode,
        stamps: &[Stamp],
        generation: u64,
    ) -> CycleSummary {
        let selected = policy::select_for_ttl_extension(stamps);
        let mut served = policy::served_in_extend_mode(&selected, config.usage_threshold);
        self.publish(generation, served.clone());

        let mut summary = CycleSummary::default();
        if config.enable_ttl {
            if policy::extend_needs_purchase(&selected) {
                if let Some(stamp) = self.purchase(config.depth, &config.amount).await {
                    summary.purchased = Some(stamp.id.clone());
                    served.push(stamp);
                    self.publish(generation, served.clone());
                }
            } else {
                summary.topped_up = self.extend_ttl(config, &selected).await;
            }
        }

        if config.enable_capacity {
            summary.diluted = self.extend_capacity(config, stamps).await;
        }

        summary.usable = served.len();
        summary
    }

    /// Top up every stamp whose TTL will not last until the next check.
    async fn extend_ttl(&self, config: &ExtendMode, candidates: &[Stamp]) -> Vec<BatchId> {
        let mut extended = Vec::new();
        if config.topup_amount.is_zero() {
            return extended;
        }

        for stamp in candidates {
            if !policy::needs_ttl_top_up(stamp, config.ttl_min, config.refresh_period) {
                continue;
            }
            if !self.pending.insert(stamp.id.clone()) {
                debug!("Stamp {} already being extended, skipping", stamp.id);
                continue;
            }

            info!(
                "Extending postage stamp TTL {} (ttl={}s)",
                stamp.id, stamp.ttl_seconds
            );
            match self.repository.top_up(&stamp.id, &config.topup_amount).await {
                Ok(updated) => {
                    self.metrics.record_top_up();
                    info!(
                        "Postage stamp {} TTL extended to {}s",
                        updated.id, updated.ttl_seconds
                    );
                    self.release_after_cooldown(stamp.id.clone());
                    extended.push(stamp.id.clone());
                }
                Err(e) => {
                    // usually a concurrent top-up of the same stamp
                    self.pending.remove(&stamp.id);
                    warn!("Failed to top up postage stamp {}: {}", stamp.id, e);
                }
            }
        }

        extended
    }

    /// Double funds then capacity of every stamp past the usage threshold.
    ///
    /// Funds go first: doubling capacity alone would halve the stamp's TTL.
    async fn extend_capacity(&self, config: &ExtendMode, stamps: &[Stamp]) -> Vec<BatchId> {
        let mut diluted = Vec::new();

        for stamp in policy::select_for_capacity_extension(stamps, config.usage_threshold) {
            let Some(depth) = policy::dilution_target(&stamp) else {
                warn!("Postage stamp {} cannot be diluted any further", stamp.id);
                continue;
            };
            if !self.pending.insert(stamp.id.clone()) {
                debug!("Stamp {} already being extended, skipping", stamp.id);
                continue;
            }

            info!(
                "Extending postage stamp capacity {} (usage={:.3})",
                stamp.id,
                stamp.usage()
            );
            if self.awaiting_dilution.contains(&stamp.id) {
                debug!(
                    "Stamp {} already funded for dilution, retrying dilution only",
                    stamp.id
                );
            } else {
                let amount = policy::capacity_top_up_amount(&stamp);
                if let Err(e) = self.repository.top_up(&stamp.id, &amount).await {
                    self.pending.remove(&stamp.id);
                    warn!("Failed to top up postage stamp {}: {}", stamp.id, e);
                    continue;
                }
                self.metrics.record_top_up();
                self.awaiting_dilution.insert(stamp.id.clone());
            }
            self.release_after_cooldown(stamp.id.clone());

            match self.repository.dilute(&stamp.id, depth).await {
                Ok(()) => {
                    self.awaiting_dilution.remove(&stamp.id);
                    self.metrics.record_dilution();
                    info!(
                        "Capacity extended for stamp {} (depth {} -> {})",
                        stamp.id, stamp.depth, depth
                    );
                    diluted.push(stamp.id.clone());
                }
                Err(e) => error!(
                    "Failed to dilute postage stamp {}, funds kept for the next attempt: {}",
                    stamp.id, e
                ),
            }
        }

        diluted
    }

    /// Buy a stamp and wait for it to become usable, unless a purchase is
    /// already outstanding.
    async fn purchase(&self, depth: u8, amount: &Amount) -> Option<Stamp> {
        let Some(_in_flight) = FlagGuard::acquire(&self.buy_in_flight) else {
            debug!("Stamp purchase already in flight, skipping");
            return None;
        };

        self.metrics.record_purchase();
        info!(
            "Buying new postage stamp with depth {} and amount {}",
            depth, amount
        );

        match self.buy_until_usable(depth, amount).await {
            Ok(stamp) => {
                info!(
                    "Bought new postage stamp {} with depth {} and amount {}",
                    stamp.id, depth, amount
                );
                Some(stamp)
            }
            Err(e) => {
                self.metrics.record_purchase_failed();
                if e.is_transient() {
                    warn!("Failed to buy postage stamp, retrying next cycle: {}", e);
                } else {
                    error!("Failed to buy postage stamp: {}", e);
                }
                None
            }
        }
    }

    async fn buy_until_usable(&self, depth: u8, amount: &Amount) -> Result<Stamp> {
        let id = self.repository.create_stamp(depth, amount).await?;
        let attempts = self.timings.purchase_poll_attempts;

        for attempt in 1..=attempts {
            match self.repository.get_stamp(&id).await {
                Ok(stamp) if stamp.usable => return Ok(stamp),
                Ok(_) => debug!("Stamp {} not usable yet ({}/{})", id, attempt, attempts),
                Err(e) => debug!("Polling stamp {} failed ({}/{}): {}", id, attempt, attempts, e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.timings.purchase_poll_interval).await;
            }
        }

        Err(Error::PurchaseTimeout {
            id: id.to_string(),
            attempts,
        })
    }

    /// Make `id` eligible again once the cool-down has elapsed.
    fn release_after_cooldown(&self, id: BatchId) {
        let pending = Arc::clone(&self.pending);
        let cooldown = self.timings.pending_cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            pending.remove(&id);
            debug!("Cool-down elapsed for stamp {}", id);
        });
    }

    /// Replace the served snapshot, unless a newer run has started since
    /// `generation`.
    fn publish(&self, generation: u64, usable: Vec<Stamp>) {
        let count = usable.len();
        let (best_ttl, best_usage) = usable
            .first()
            .map_or((0, 0.0), |best| (best.ttl_seconds, best.usage()));

        let next = Arc::new(Served {
            generation,
            hardcoded: None,
            usable,
        });
        let previous = self.served.rcu(|current| {
            if current.generation == generation {
                Arc::clone(&next)
            } else {
                Arc::clone(current)
            }
        });

        if previous.generation != generation {
            debug!(
                "Discarding stamps of stale run {} (current run {})",
                generation, previous.generation
            );
            return;
        }
        self.metrics.set_served(best_ttl, best_usage, count);
    }

    async fn run_timer(
        manager: Weak<Self>,
        period: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        // a cycle outliving its period swallows the missed ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.refresh().await;
                }
            }
        }
        debug!("Stamp refresh timer stopped");
    }
}

impl std::fmt::Debug for StampManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampManager")
            .field("mode", &*self.mode.read())
            .field("usable", &self.served.load().usable.len())
            .field("buying", &self.is_buying())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
