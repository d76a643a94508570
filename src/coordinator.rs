//! Session coordinator.
//!
//! The session state machine and the only writer of the simulated clock
//! during streaming. Runs on its own thread and drives everything else:
//! requirement-driven provisioning, prefetch seeding, the chronological
//! streaming loop, scanner scheduling, pause/resume, day rolls in multi-day
//! backtests, and shutdown.
//!
//! State machine:
//!
//! ```text
//! Stopped -> Initializing -> PreSessionScanning -> Streaming <-> Paused
//!                 ^                                    |
//!                 |            (backtest, more days)   v
//!                 +--- roll <------------------- SessionEnded -> Terminating -> Stopped
//! ```

use crate::config::{EngineTuning, SessionConfig, SessionMode};
use crate::error::{EngineError, ErrorKind, Phase};
use crate::models::{Interval, MarketItem, StreamId, StreamKind, Symbol};
use crate::prefetch::{PrefetchHandle, PrefetchWorker};
use crate::quality::DataQualityManager;
use crate::repository::{MarketDataRepository, RepositoryError};
use crate::requirements::{
    analyze, IntervalOp, LogicalAsk, ProvisionRequest, ProvisioningRequirements, SymbolOp,
};
use crate::scanner::{ScannerManager, ScannerRegistry, ScannerSnapshot};
use crate::session_data::{ProvisionSource, SessionData, SessionDataError};
use crate::status::{
    collect_symbols, LoopStatsSnapshot, PerformanceCounters, StatusDocument, SubscriptionStatus,
};
use crate::stream_coordinator::{MergeOutcome, MergeStats, StreamCoordinator};
use crate::subscription::{PauseGate, StreamSubscription, SubscriptionMode, WaitOutcome};
use crate::time_manager::{TimeError, TimeManager};
use chrono::{DateTime, NaiveDate, Utc};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Capacity of the adhoc provisioning queue.
const PROVISION_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// STATE
// =============================================================================

/// Coordinator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Initializing,
    PreSessionScanning,
    Streaming,
    Paused,
    SessionEnded,
    Terminating,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Initializing => write!(f, "initializing"),
            Self::PreSessionScanning => write!(f, "pre_session_scanning"),
            Self::Streaming => write!(f, "streaming"),
            Self::Paused => write!(f, "paused"),
            Self::SessionEnded => write!(f, "session_ended"),
            Self::Terminating => write!(f, "terminating"),
        }
    }
}

/// Why the streaming loop handed control back.
enum EndReason {
    /// Stop requested; terminate.
    Stopped,
    /// Session day complete (clock reached close or streams drained).
    DayComplete,
}

// =============================================================================
// DOWNSTREAM LINKS
// =============================================================================

/// One downstream processor connection: the coordinator signals `delivery`
/// after each append; the processor reads, resets `delivery`, and signals
/// `ack`. In data-driven mode the coordinator blocks on `ack` so at most one
/// unacknowledged delivery exists at any time.
pub struct DownstreamLink {
    pub name: String,
    pub delivery: Arc<StreamSubscription>,
    pub ack: Arc<StreamSubscription>,
}

// =============================================================================
// LOOP STATS
// =============================================================================

#[derive(Debug, Default)]
struct LoopStats {
    iterations: AtomicU64,
    items_processed: AtomicU64,
    items_filtered: AtomicU64,
    out_of_order_skipped: AtomicU64,
    days_completed: AtomicU64,
    provision_requests_handled: AtomicU64,
}

impl LoopStats {
    fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            iterations: self.iterations.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            items_filtered: self.items_filtered.load(Ordering::Relaxed),
            out_of_order_skipped: self.out_of_order_skipped.load(Ordering::Relaxed),
            days_completed: self.days_completed.load(Ordering::Relaxed),
            provision_requests_handled: self.provision_requests_handled.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Shared {
    config: SessionConfig,
    tuning: EngineTuning,
    session: Arc<SessionData>,
    time: Arc<TimeManager>,
    repository: Arc<dyn MarketDataRepository>,
    quality: Arc<DataQualityManager>,
    registry: ScannerRegistry,
    stop: Arc<AtomicBool>,
    state: Mutex<SessionState>,
    state_cond: Condvar,
    pause_gate: PauseGate,
    /// Distinguishes the public pause from internal catch-up pauses.
    user_paused: AtomicBool,
    downstreams: Mutex<Vec<Arc<DownstreamLink>>>,
    provision_tx: Sender<ProvisionRequest>,
    provision_rx: Receiver<ProvisionRequest>,
    loop_stats: LoopStats,
    merge_stats: Mutex<MergeStats>,
    scanner_snapshots: Mutex<Vec<ScannerSnapshot>>,
    last_error: Mutex<Option<EngineError>>,
    final_status: Mutex<Option<StatusDocument>>,
}

impl Shared {
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != next {
            info!(from = %*state, to = %next, "session state transition");
            *state = next;
            self.state_cond.notify_all();
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn record_error(&self, err: EngineError) {
        error!(error = %err, "session error");
        *self.last_error.lock() = Some(err);
    }
}

// =============================================================================
// PUBLIC HANDLE
// =============================================================================

/// Handle to a running session. Dropping it does not stop the session; call
/// `stop()` (and `join()`).
pub struct SessionHandle {
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish()
    }
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn session(&self) -> Arc<SessionData> {
        Arc::clone(&self.shared.session)
    }

    pub fn time(&self) -> Arc<TimeManager> {
        Arc::clone(&self.shared.time)
    }

    pub fn last_error(&self) -> Option<EngineError> {
        self.shared.last_error.lock().clone()
    }

    /// Request cooperative shutdown.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pause_gate.open();
    }

    /// Suspend streaming. Backtest only; entering from any state other than
    /// Streaming is a state violation.
    pub fn pause(&self) -> Result<(), EngineError> {
        if !self.shared.config.mode.is_backtest() {
            return Err(EngineError::new(
                ErrorKind::StateViolation,
                Phase::Streaming,
                "pause refused in live mode",
            ));
        }
        if self.shared.state() != SessionState::Streaming {
            return Err(EngineError::new(
                ErrorKind::StateViolation,
                Phase::Streaming,
                format!("pause refused in state {}", self.shared.state()),
            ));
        }
        self.shared.user_paused.store(true, Ordering::Release);
        self.shared.pause_gate.close();
        Ok(())
    }

    pub fn resume(&self) {
        self.shared.user_paused.store(false, Ordering::Release);
        self.shared.pause_gate.open();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.user_paused.load(Ordering::Acquire)
            || self.shared.state() == SessionState::Paused
    }

    /// Register a downstream processor. The returned link's `delivery` side
    /// is signalled after every appended item.
    pub fn subscribe(&self, name: &str, mode: SubscriptionMode) -> Arc<DownstreamLink> {
        let link = Arc::new(DownstreamLink {
            name: name.to_string(),
            delivery: Arc::new(StreamSubscription::new(
                format!("{}:delivery", name),
                mode,
                Arc::clone(&self.shared.stop),
            )),
            ack: Arc::new(StreamSubscription::new(
                format!("{}:ack", name),
                mode,
                Arc::clone(&self.shared.stop),
            )),
        });
        self.shared.downstreams.lock().push(Arc::clone(&link));
        info!(processor = name, ?mode, "downstream subscribed");
        link
    }

    /// Unified adhoc entry points. Validation errors surface when the
    /// coordinator drains the request; the ask itself is fire-and-forget.
    pub fn add_symbol_unified(&self, symbol: &str) -> Result<(), EngineError> {
        self.enqueue(LogicalAsk::symbol(symbol))
    }

    pub fn add_bar_unified(
        &self,
        symbol: &str,
        interval: Interval,
        historical_days: Option<u32>,
    ) -> Result<(), EngineError> {
        self.enqueue(match historical_days {
            Some(days) => LogicalAsk::historical(symbol, interval, days),
            None => LogicalAsk::bar_interval(symbol, interval),
        })
    }

    pub fn add_indicator_unified(
        &self,
        symbol: &str,
        config: crate::config::IndicatorConfig,
    ) -> Result<(), EngineError> {
        self.enqueue(LogicalAsk::indicator(symbol, config))
    }

    fn enqueue(&self, ask: LogicalAsk) -> Result<(), EngineError> {
        self.shared.provision_tx.try_send(ask).map_err(|_| {
            EngineError::new(
                ErrorKind::StateViolation,
                Phase::Streaming,
                "provisioning queue unavailable",
            )
        })
    }

    /// Block until `predicate` holds for the session state or `timeout`
    /// lapses.
    pub fn wait_for_state(
        &self,
        predicate: impl Fn(SessionState) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if predicate(*state) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.shared
                .state_cond
                .wait_for(&mut state, deadline - now);
        }
    }

    /// Join the coordinator thread.
    pub fn join(&self, timeout: Duration) -> bool {
        let handle = self.join.lock().take();
        let Some(handle) = handle else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                *self.join.lock() = Some(handle);
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        true
    }

    /// Current status document; after termination, the final document.
    pub fn status_document(&self) -> StatusDocument {
        if let Some(doc) = self.shared.final_status.lock().clone() {
            return doc;
        }
        build_status(&self.shared)
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

pub struct SessionCoordinator;

impl SessionCoordinator {
    /// Validate the configuration, resolve the first session day, and spawn
    /// the coordinator thread. Validation and calendar-at-boot failures
    /// surface synchronously.
    pub fn start(
        config: SessionConfig,
        repository: Arc<dyn MarketDataRepository>,
        registry: ScannerRegistry,
        tuning: EngineTuning,
    ) -> Result<SessionHandle, EngineError> {
        if let Err(errors) = config.validate() {
            return Err(EngineError::validation(
                Phase::Initialization,
                errors.join("; "),
            ));
        }

        let mode = config.mode;
        let (first_date, initial_time) = match (&config.backtest, mode) {
            (Some(bt), SessionMode::Backtest) => {
                let date = first_trading_date_at_boot(&repository, &config, bt.start_date)?;
                let info = repository
                    .get_trading_session(date, &config.exchange_group, &config.asset_class)
                    .map_err(|e| EngineError::fatal_init(e.to_string()))?;
                let start = match bt.start_time {
                    Some(t) => chrono::TimeZone::from_utc_datetime(&Utc, &date.and_time(t)),
                    None => info.regular_open,
                };
                (date, Some(start))
            }
            _ => (Utc::now().date_naive(), None),
        };

        let time = Arc::new(
            TimeManager::new(
                mode,
                Arc::clone(&repository),
                config.exchange_group.clone(),
                config.asset_class.clone(),
                initial_time,
            )
            .map_err(|e| EngineError::fatal_init(e.to_string()))?,
        );

        let session = Arc::new(SessionData::new(
            mode,
            first_date,
            tuning.interval_ring_capacity,
        ));
        let (provision_tx, provision_rx) = bounded(PROVISION_QUEUE_CAPACITY);
        session.install_provision_channel(provision_tx.clone());

        let stop = Arc::new(AtomicBool::new(false));
        let quality = Arc::new(DataQualityManager::new(
            Arc::clone(&session),
            Arc::clone(&time),
            Arc::clone(&repository),
            config.session_data.gap_filler.clone(),
            tuning.quality_wake,
            Arc::clone(&stop),
        ));

        let shared = Arc::new(Shared {
            config,
            tuning,
            session,
            time,
            repository,
            quality,
            registry,
            stop,
            state: Mutex::new(SessionState::Stopped),
            state_cond: Condvar::new(),
            pause_gate: PauseGate::new(),
            user_paused: AtomicBool::new(false),
            downstreams: Mutex::new(Vec::new()),
            provision_tx,
            provision_rx,
            loop_stats: LoopStats::default(),
            merge_stats: Mutex::new(MergeStats::default()),
            scanner_snapshots: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            final_status: Mutex::new(None),
        });

        let runner = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name("session-coordinator".to_string())
            .spawn(move || run(runner))
            .map_err(|e| EngineError::fatal_init(format!("cannot spawn coordinator: {}", e)))?;

        Ok(SessionHandle {
            shared,
            join: Mutex::new(Some(join)),
        })
    }
}

/// Resolve the first trading date at boot, straight off the repository
/// (the TimeManager does not exist yet).
fn first_trading_date_at_boot(
    repository: &Arc<dyn MarketDataRepository>,
    config: &SessionConfig,
    from: NaiveDate,
) -> Result<NaiveDate, EngineError> {
    let mut date = from;
    for _ in 0..366 {
        let info = repository
            .get_trading_session(date, &config.exchange_group, &config.asset_class)
            .map_err(|e| EngineError::fatal_init(e.to_string()))?;
        if info.is_trading_day {
            return Ok(date);
        }
        date = date
            .succ_opt()
            .ok_or_else(|| EngineError::fatal_init("date overflow"))?;
    }
    Err(EngineError::fatal_init(format!(
        "no trading day within a year of {}",
        from
    )))
}

// =============================================================================
// RUN THREAD
// =============================================================================

fn run(shared: Arc<Shared>) {
    info!(mode = %shared.config.mode, "session coordinator started");
    shared.set_state(SessionState::Initializing);

    let prefetch = PrefetchWorker::spawn(
        Arc::clone(&shared.repository),
        Arc::clone(&shared.stop),
    );
    let quality_join = Arc::clone(&shared.quality).spawn();

    if let Err(err) = run_days(&shared, &prefetch) {
        shared.record_error(err);
    }

    shared.set_state(SessionState::Terminating);
    shared.session.deactivate_session();
    shared.stop.store(true, Ordering::Release);

    let window = shared.tuning.shutdown_window;
    let deadline = Instant::now() + window;
    while !quality_join.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if quality_join.is_finished() {
        let _ = quality_join.join();
    } else {
        warn!("quality manager did not stop within the shutdown window");
    }
    prefetch.shutdown(window);

    shared.set_state(SessionState::Stopped);
    *shared.final_status.lock() = Some(build_status(&shared));
    shared.session.teardown();
    info!("session coordinator stopped");
}

fn run_days(shared: &Arc<Shared>, prefetch: &PrefetchWorker) -> Result<(), EngineError> {
    let backtest = shared.config.mode.is_backtest();
    let mut current_date = shared.session.current_session_date();
    let mut merge = StreamCoordinator::new(shared.tuning.stream_queue_capacity);
    let mut pending_handles: Vec<PrefetchHandle> = Vec::new();
    let mut first_day = true;

    loop {
        if shared.stop.load(Ordering::Acquire) {
            return Ok(());
        }
        shared.set_state(SessionState::Initializing);

        let info = shared
            .time
            .get_trading_session(current_date)
            .map_err(|e| EngineError::fatal_init(e.to_string()))?;
        let open = info.regular_open;
        let close = info.effective_close();
        shared.session.set_session_window(open, close);

        // Requirement-driven provisioning for every configured symbol. The
        // same path serves cold boot and the idempotent re-entry after a
        // roll.
        let asks: Vec<LogicalAsk> = shared
            .config
            .session_data
            .symbols
            .iter()
            .map(|symbol| LogicalAsk::symbol(symbol.as_str()))
            .collect();
        let reqs = analyze(
            &asks,
            &shared.session.analysis_snapshot(),
            &shared.config,
            ProvisionSource::Config,
        );
        if !reqs.can_proceed {
            return Err(EngineError::validation(
                Phase::Initialization,
                reqs.validation_errors.join("; "),
            ));
        }
        let outcome = execute_requirements(
            shared,
            &reqs,
            &mut merge,
            prefetch,
            current_date,
            open,
            close,
            Phase::Initialization,
            true,
        );
        pending_handles.extend(outcome.handles);
        if first_day
            && !shared.config.session_data.symbols.is_empty()
            && outcome.failed_symbols.len() >= shared.config.session_data.symbols.len()
        {
            return Err(EngineError::fatal_init("all configured symbols failed provisioning")
                .with_symbols(outcome.failed_symbols));
        }

        // Mid-session start: catch the store up to the clock through the
        // privileged repair path before streaming begins.
        let now = shared.time.now();
        if now > open {
            catch_up_symbols(shared, open, now.min(close));
        }

        // The first session day's prefetch is awaited synchronously;
        // subsequent days were fired asynchronously at the roll.
        if first_day {
            for handle in pending_handles.drain(..) {
                if handle.wait(shared.tuning.prefetch_wait).is_none() {
                    warn!("initial prefetch did not complete within the wait budget");
                }
            }
        } else {
            pending_handles.clear();
        }

        // Pre-session scanning; promotions drain through the unified path.
        shared.set_state(SessionState::PreSessionScanning);
        let scanners = ScannerManager::new(
            &shared.config.session_data.scanners,
            &shared.registry,
            Arc::clone(&shared.session),
            Arc::clone(&shared.time),
            shared.config.mode,
            current_date,
        );
        scanners.run_pre_session(shared.time.now());
        drain_provision_requests(shared, &mut merge, prefetch, current_date, open, close);
        *shared.scanner_snapshots.lock() = scanners.snapshots();

        shared.session.activate_session();
        shared.set_state(SessionState::Streaming);
        let reason = streaming_loop(
            shared,
            &mut merge,
            prefetch,
            &scanners,
            current_date,
            open,
            close,
        );

        // Settle the day deterministically: one synchronous upkeep pass so
        // derived bars and warmup promotions are complete before the day is
        // rolled or reported.
        shared.quality.run_cycle();

        shared.session.deactivate_session();
        scanners.finish(shared.time.now());
        *shared.scanner_snapshots.lock() = scanners.snapshots();
        *shared.merge_stats.lock() = merge.stats();

        match reason {
            EndReason::Stopped => return Ok(()),
            EndReason::DayComplete => {}
        }
        shared.set_state(SessionState::SessionEnded);
        shared.loop_stats.days_completed.fetch_add(1, Ordering::Relaxed);
        info!(date = %current_date, "session day ended");

        if !backtest {
            return Ok(());
        }
        let bt = shared.config.backtest.as_ref().expect("validated");
        let next = match shared.time.get_next_trading_date(current_date, 1) {
            Ok(next) => next,
            Err(TimeError::CalendarUnavailable(msg)) => {
                return Err(EngineError::new(
                    ErrorKind::TransientExternal,
                    Phase::Teardown,
                    msg,
                ))
            }
            Err(e) => {
                return Err(EngineError::new(
                    ErrorKind::StateViolation,
                    Phase::Teardown,
                    e.to_string(),
                ))
            }
        };
        if next > bt.end_date {
            return Ok(());
        }

        // Roll: promote today's bars to history, reset the clock to the next
        // open, and fire the next day's prefetches without waiting.
        let next_info = shared
            .time
            .get_trading_session(next)
            .map_err(|e| EngineError::fatal_init(e.to_string()))?;
        shared.session.roll_session(next);
        shared.quality.reset_day();
        shared
            .time
            .begin_new_session(next_info.regular_open)
            .map_err(|e| {
                EngineError::new(ErrorKind::StateViolation, Phase::Teardown, e.to_string())
            })?;

        merge.reset();
        pending_handles.clear();
        for stream in shared.session.active_streams() {
            match merge.register(stream.clone()) {
                Ok(sender) => {
                    pending_handles.push(prefetch.start_prefetch(
                        stream,
                        next_info.regular_open,
                        next_info.effective_close(),
                        sender,
                    ));
                }
                Err(err) => warn!(error = %err, "stream re-registration failed at roll"),
            }
        }
        current_date = next;
        first_day = false;
    }
}

// =============================================================================
// STREAMING LOOP
// =============================================================================

fn streaming_loop(
    shared: &Arc<Shared>,
    merge: &mut StreamCoordinator,
    prefetch: &PrefetchWorker,
    scanners: &ScannerManager,
    date: NaiveDate,
    open: DateTime<Utc>,
    close: DateTime<Utc>,
) -> EndReason {
    let backtest = shared.config.mode.is_backtest();
    let speed = shared
        .config
        .backtest
        .as_ref()
        .map(|bt| bt.speed_multiplier)
        .unwrap_or(0.0);

    loop {
        shared.loop_stats.iterations.fetch_add(1, Ordering::Relaxed);

        // 1. Cooperative stop.
        if shared.stop.load(Ordering::Acquire) {
            return EndReason::Stopped;
        }

        // 2. Pause gate. The current iteration always completes before the
        // loop parks here, so a half-appended item never exists.
        if shared.pause_gate.is_closed() {
            shared.set_state(SessionState::Paused);
            if !shared.pause_gate.wait_open(&shared.stop) {
                return EndReason::Stopped;
            }
            shared.set_state(SessionState::Streaming);
        }

        // 3. Dynamic provisioning requests queued since the last iteration.
        drain_provision_requests(shared, merge, prefetch, date, open, close);

        // 4. Session close by clock (backtest).
        if backtest && shared.time.now() >= close {
            return EndReason::DayComplete;
        }

        // 5. Next chronologically-oldest item.
        let item = match merge.next(shared.tuning.head_poll) {
            MergeOutcome::Item(item) => item,
            MergeOutcome::Pending => {
                if !backtest {
                    std::thread::sleep(shared.tuning.idle_poll);
                }
                continue;
            }
            MergeOutcome::Drained => {
                if backtest {
                    return EndReason::DayComplete;
                }
                std::thread::sleep(shared.tuning.idle_poll);
                continue;
            }
        };
        *shared.merge_stats.lock() = merge.stats();

        // 6. Filter: session window, then staleness (mid-session catch-up).
        let ts = item.timestamp();
        if ts < open || ts >= close {
            shared.loop_stats.items_filtered.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if let Some(threshold) = shared.tuning.stale_threshold {
            if ts < shared.time.now() - chrono::Duration::from_std(threshold).unwrap_or_default()
            {
                shared.loop_stats.items_filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        // 7. Append; out-of-order items are logged and skipped.
        match append_item(&shared.session, &item) {
            Ok(()) => {}
            Err(err @ SessionDataError::OutOfOrder { .. }) => {
                warn!(error = %err, "out-of-order item skipped");
                shared
                    .loop_stats
                    .out_of_order_skipped
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(err) => {
                warn!(error = %err, "append failed; item skipped");
                continue;
            }
        }
        shared.loop_stats.items_processed.fetch_add(1, Ordering::Relaxed);

        // 8. Advance the clock: the only forward movement during streaming.
        // A bar moves time to its interval end, so ticks and quotes inside
        // that interval leave the clock where it is.
        if backtest {
            let target = item.clock_advance_target();
            if target > shared.time.now() {
                if let Err(err) = shared.time.set_backtest_time(target) {
                    warn!(error = %err, "clock advance rejected");
                }
            }
        }

        // Scanner cadence rides the streaming loop.
        scanners.poll(shared.time.now());

        // 9. Notify downstream subscriptions and honor backpressure/pacing.
        notify_downstreams(shared, &item, speed);
    }
}

/// Pace for one item at a given backtest speed: the simulated span the item
/// covers, divided by the multiplier.
fn pacing_for(item: &MarketItem, speed: f64) -> Duration {
    if speed <= 0.0 {
        return Duration::ZERO;
    }
    let span = match item {
        MarketItem::Bar { interval, .. } => interval.total_seconds() as f64,
        _ => 1.0,
    };
    Duration::from_secs_f64((span / speed).min(60.0))
}

fn notify_downstreams(shared: &Arc<Shared>, item: &MarketItem, speed: f64) {
    let links: Vec<Arc<DownstreamLink>> = shared.downstreams.lock().clone();
    let backtest = shared.config.mode.is_backtest();
    let pace = if backtest { pacing_for(item, speed) } else { Duration::ZERO };
    let started = Instant::now();

    for link in &links {
        link.delivery.signal();
        match link.ack.mode() {
            SubscriptionMode::DataDriven => match link.ack.wait(None) {
                Ok(WaitOutcome::Signalled) => link.ack.reset(),
                Ok(WaitOutcome::Cancelled) | Err(_) => {}
                Ok(WaitOutcome::TimedOut) => unreachable!("data-driven waits do not time out"),
            },
            SubscriptionMode::ClockDriven => {
                // The processor gets half the pacing budget to acknowledge;
                // a timeout counts an overrun and streaming does not stall.
                let ack_budget = (pace / 2).max(Duration::from_millis(1));
                match link.ack.wait(Some(ack_budget)) {
                    Ok(_) | Err(_) => link.ack.reset(),
                }
            }
            SubscriptionMode::Live => {
                let budget = shared.tuning.live_ack_timeout;
                match link.ack.wait(Some(budget)) {
                    Ok(_) | Err(_) => link.ack.reset(),
                }
            }
        }
    }

    // Clock-driven pacing: keep the cadence at span/speed regardless of how
    // fast the downstream acknowledged.
    if pace > Duration::ZERO {
        let elapsed = started.elapsed();
        if elapsed < pace && !shared.stop.load(Ordering::Acquire) {
            std::thread::sleep(pace - elapsed);
        }
    }
}

fn append_item(session: &SessionData, item: &MarketItem) -> Result<(), SessionDataError> {
    match item {
        MarketItem::Bar {
            symbol,
            interval,
            bar,
        } => session.append_bar(symbol, *interval, bar.clone()),
        MarketItem::Tick { symbol, tick } => session.append_tick(symbol, tick.clone()),
        MarketItem::Quote { symbol, quote } => session.append_quote(symbol, quote.clone()),
    }
}

// =============================================================================
// PROVISIONING EXECUTOR
// =============================================================================

struct ExecOutcome {
    handles: Vec<PrefetchHandle>,
    failed_symbols: BTreeSet<Symbol>,
}

/// Enact a provisioning plan: symbols, interval containers, historical
/// loads, indicator registrations, stream queues (with catch-up when the
/// clock is already past the open), and initial quality. Failures are
/// per-symbol; healthy symbols proceed.
fn execute_requirements(
    shared: &Arc<Shared>,
    reqs: &ProvisioningRequirements,
    merge: &mut StreamCoordinator,
    prefetch: &PrefetchWorker,
    date: NaiveDate,
    open: DateTime<Utc>,
    close: DateTime<Utc>,
    phase: Phase,
    config_path: bool,
) -> ExecOutcome {
    let session = &shared.session;
    let mut handles = Vec::new();
    let mut failed: BTreeSet<Symbol> = BTreeSet::new();
    let source = if config_path {
        ProvisionSource::Config
    } else {
        ProvisionSource::Adhoc
    };

    for warning in &reqs.validation_warnings {
        debug!(warning = %warning, "provisioning warning");
    }

    for (symbol, op) in &reqs.symbol_ops {
        match op {
            SymbolOp::Create { full } => session.create_symbol(symbol, *full || config_path),
            SymbolOp::UpgradeFromAdhoc => session.create_symbol(symbol, true),
            SymbolOp::Noop => {}
        }
        if config_path {
            session.mark_config_symbol(symbol);
        }
    }

    for plan in &reqs.interval_ops {
        let result = match plan.op {
            IntervalOp::AddBase => {
                session.ensure_base_interval(&plan.symbol, plan.interval, !config_path)
            }
            IntervalOp::AddDerived { from } => {
                session.ensure_derived_interval(&plan.symbol, plan.interval, from, !config_path)
            }
            IntervalOp::Noop => Ok(()),
        };
        if let Err(err) = result {
            session.record_provisioning_error(&plan.symbol, err.to_string());
            failed.insert(plan.symbol.clone());
        }
    }

    for plan in &reqs.historical_ops {
        if failed.contains(&plan.symbol) {
            continue;
        }
        if let Err(err) = load_historical(shared, &plan.symbol, plan.interval, plan.days, date) {
            warn!(symbol = %plan.symbol, phase = %phase, error = %err, "historical load failed");
            session.record_provisioning_error(&plan.symbol, err.to_string());
            if err.kind != ErrorKind::TransientExternal {
                failed.insert(plan.symbol.clone());
            }
        }
    }

    for plan in &reqs.indicator_ops {
        if failed.contains(&plan.symbol) {
            continue;
        }
        match session.register_indicator(&plan.symbol, plan.config.clone(), plan.source) {
            Ok(true) => debug!(symbol = %plan.symbol, identity = %plan.identity, "indicator registered"),
            Ok(false) => debug!(symbol = %plan.symbol, identity = %plan.identity, "indicator already present"),
            Err(err) => {
                session.record_provisioning_error(&plan.symbol, err.to_string());
            }
        }
    }

    let now = shared.time.now();
    for plan in &reqs.session_queue_ops {
        if failed.contains(&plan.symbol) {
            continue;
        }
        let stream = StreamId {
            symbol: plan.symbol.clone(),
            kind: plan.kind,
            interval: plan.interval,
        };
        if session.is_stream_active(&stream) {
            // Two streams for one (symbol, kind, interval) never coexist.
            warn!(%stream, "duplicate stream attach refused");
            continue;
        }
        if let Err(err) = session.register_stream(stream.clone()) {
            session.record_provisioning_error(&plan.symbol, err.to_string());
            continue;
        }
        let sender = match merge.register(stream.clone()) {
            Ok(sender) => sender,
            Err(err) => {
                session.record_provisioning_error(&plan.symbol, err.to_string());
                continue;
            }
        };
        let window_start = now.clamp(open, close);
        // A stream attached after the open catches the store up through the
        // repair path, then streams from the clock forward.
        if plan.kind == StreamKind::Bar && window_start > open {
            if let Some(interval) = plan.interval {
                catch_up_bars(shared, &plan.symbol, interval, open, window_start);
            }
        }
        handles.push(prefetch.start_prefetch(stream, window_start, close, sender));
    }

    for plan in &reqs.quality_ops {
        if !plan.compute || failed.contains(&plan.symbol) {
            continue;
        }
        compute_initial_quality(shared, &plan.symbol);
    }

    ExecOutcome {
        handles,
        failed_symbols: failed,
    }
}

/// Load `days` trailing trading days of bars into the historical store.
fn load_historical(
    shared: &Arc<Shared>,
    symbol: &str,
    interval: Interval,
    days: u32,
    from: NaiveDate,
) -> Result<(), EngineError> {
    let dates = shared
        .time
        .get_prev_trading_dates(from, days)
        .map_err(|e| {
            EngineError::new(ErrorKind::TransientExternal, Phase::Initialization, e.to_string())
        })?;
    for day in dates.into_iter().rev() {
        let info = shared.time.get_trading_session(day).map_err(|e| {
            EngineError::new(ErrorKind::TransientExternal, Phase::Initialization, e.to_string())
        })?;
        match shared.repository.get_bars(
            symbol,
            interval,
            info.regular_open,
            info.effective_close(),
        ) {
            Ok(bars) => {
                shared
                    .session
                    .add_historical_day(symbol, interval, days as usize, day, bars)
                    .map_err(|e| {
                        EngineError::new(
                            ErrorKind::StateViolation,
                            Phase::Initialization,
                            e.to_string(),
                        )
                        .with_symbol(symbol)
                    })?;
            }
            Err(RepositoryError::NoData) => continue,
            Err(err @ RepositoryError::Transient(_)) => {
                return Err(EngineError::new(
                    ErrorKind::TransientExternal,
                    Phase::Initialization,
                    err.to_string(),
                )
                .with_symbol(symbol))
            }
            Err(err) => {
                return Err(EngineError::new(
                    ErrorKind::PermanentExternal,
                    Phase::Initialization,
                    err.to_string(),
                )
                .with_symbol(symbol))
            }
        }
    }
    Ok(())
}

/// Initial bar quality over loaded history: present bars vs the calendar's
/// expectation for each covered day.
fn compute_initial_quality(shared: &Arc<Shared>, symbol: &str) {
    let session = &shared.session;
    for (interval, derived) in session.held_intervals(symbol) {
        if derived {
            continue;
        }
        let Some((days, bars)) = session.historical_coverage(symbol, interval) else {
            continue;
        };
        if days == 0 {
            continue;
        }
        let per_day =
            (crate::models::TRADING_SECS_PER_DAY / interval.total_seconds()).max(1) as usize;
        let expected = per_day * days;
        let quality = crate::quality::bar_quality(bars, expected);
        let _ = session.set_quality(symbol, interval, quality, Vec::new());
    }
}

/// Bring bar streams up to `until` through the repair path (mid-session
/// starts and dynamic adds).
fn catch_up_symbols(shared: &Arc<Shared>, open: DateTime<Utc>, until: DateTime<Utc>) {
    for symbol in shared.session.get_active_symbols() {
        for (interval, derived) in shared.session.held_intervals(&symbol) {
            if !derived {
                catch_up_bars(shared, &symbol, interval, open, until);
            }
        }
    }
}

fn catch_up_bars(
    shared: &Arc<Shared>,
    symbol: &str,
    interval: Interval,
    open: DateTime<Utc>,
    until: DateTime<Utc>,
) {
    match shared.repository.get_bars(symbol, interval, open, until) {
        Ok(bars) => {
            let count = bars.len();
            for bar in bars {
                if let Err(err) = shared.session.insert_missing(symbol, interval, bar) {
                    warn!(%symbol, %interval, error = %err, "catch-up insert failed");
                }
            }
            debug!(%symbol, %interval, count, "catch-up complete");
        }
        Err(RepositoryError::NoData) => {}
        Err(err) => {
            warn!(%symbol, %interval, error = %err, "catch-up load failed");
            shared
                .session
                .record_provisioning_error(symbol, err.to_string());
        }
    }
}

/// Drain adhoc asks queued since the last iteration. Each ask runs through
/// the analyzer and executor; the pause gate closes around the work so
/// public pause state and internal catch-up share one mechanism.
fn drain_provision_requests(
    shared: &Arc<Shared>,
    merge: &mut StreamCoordinator,
    prefetch: &PrefetchWorker,
    date: NaiveDate,
    open: DateTime<Utc>,
    close: DateTime<Utc>,
) {
    let mut drained = false;
    while let Ok(request) = shared.provision_rx.try_recv() {
        if !drained {
            drained = true;
            shared.pause_gate.close();
        }
        shared
            .loop_stats
            .provision_requests_handled
            .fetch_add(1, Ordering::Relaxed);

        let symbol = request.symbol.clone();
        let reqs = analyze(
            &[request],
            &shared.session.analysis_snapshot(),
            &shared.config,
            ProvisionSource::Adhoc,
        );
        if !reqs.can_proceed {
            for err in &reqs.validation_errors {
                warn!(%symbol, error = %err, "adhoc provisioning rejected");
                shared.session.record_provisioning_error(&symbol, err.clone());
            }
            continue;
        }
        let outcome = execute_requirements(
            shared,
            &reqs,
            merge,
            prefetch,
            date,
            open,
            close,
            Phase::Streaming,
            false,
        );
        // Dynamic adds wait for their historical/prefetch seed so the first
        // streamed item lands at or after the clock.
        for handle in outcome.handles {
            let _ = handle.wait(shared.tuning.prefetch_wait);
        }
    }
    if drained && !shared.user_paused.load(Ordering::Acquire) {
        shared.pause_gate.open();
    }
}

// =============================================================================
// STATUS
// =============================================================================

fn build_status(shared: &Arc<Shared>) -> StatusDocument {
    let subscriptions = shared
        .downstreams
        .lock()
        .iter()
        .map(|link| SubscriptionStatus {
            name: link.name.clone(),
            mode: link.delivery.mode(),
            signals: link.delivery.signals(),
            overruns: link.ack.overruns(),
        })
        .collect();

    StatusDocument {
        generated_at: Utc::now(),
        mode: shared.config.mode.to_string(),
        state: shared.state().to_string(),
        session_date: shared.session.current_session_date(),
        config: shared.config.clone(),
        symbols: collect_symbols(&shared.session),
        scanners: shared.scanner_snapshots.lock().clone(),
        counters: PerformanceCounters {
            subscriptions,
            calendar_cache: shared.time.cache_stats(),
            store: shared.session.stats(),
            merge: *shared.merge_stats.lock(),
            quality: shared.quality.stats(),
            streaming_loop: shared.loop_stats.snapshot(),
        },
        last_error: shared.last_error.lock().clone(),
    }
}
