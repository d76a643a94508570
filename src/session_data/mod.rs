//! The shared session-data store.
//!
//! Single authoritative in-memory state consumed and written by every other
//! component: per-symbol bars by interval, trailing history, ticks/quotes,
//! indicator metadata, session metrics, membership and locks.
//!
//! Locking is tiered: a registry lock guards symbol-set membership (rare
//! writes), each symbol guards its own state with its own lock, and the
//! latest-bar pointer per (symbol, interval) is readable lock-free through
//! `ArcSwapOption`. Acquisition order is registry then per-symbol; the
//! registry lock is never held across an external call.
//!
//! Upward communication is events only: appends pulse the data-arrival
//! event, and adhoc provisioning asks are queued to the coordinator through
//! a channel installed at init. Nothing here calls back into an owner.

mod interval_data;
mod symbol_data;

pub use interval_data::{GapInfo, HistoricalIntervalData, IntervalData};
pub use symbol_data::{
    IndicatorSnapshot, IndicatorState, ProvisionSource, SessionMetrics, SymbolSessionData,
};

use crate::config::{IndicatorConfig, SessionMode};
use crate::models::{Bar, BarValidationError, Interval, Quote, StreamId, Symbol, Tick};
use crate::requirements::{ProvisionRequest, SessionSnapshot, SymbolSnapshot};
use crate::subscription::DataArrivalEvent;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, NaiveDate, Utc};
use crossbeam::channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SessionDataError {
    UnknownSymbol(Symbol),
    UnknownInterval { symbol: Symbol, interval: Interval },
    /// Bar timestamp not strictly greater than the current latest.
    OutOfOrder {
        symbol: Symbol,
        interval: Interval,
        last: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    /// Timestamp outside the session trading window.
    OutsideWindow {
        timestamp: DateTime<Utc>,
        open: DateTime<Utc>,
        close: DateTime<Utc>,
    },
    InvalidBar(BarValidationError),
    /// Symbol declared in the session config; protected from removal.
    SymbolProtected(Symbol),
    SymbolLocked { symbol: Symbol, reason: String },
    /// Adhoc request made before the coordinator installed its channel.
    NoProvisionChannel,
    /// Adhoc request dropped because the coordinator queue is full or gone.
    ProvisionQueueUnavailable,
    DuplicateStream(StreamId),
}

impl fmt::Display for SessionDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSymbol(sym) => write!(f, "unknown symbol {}", sym),
            Self::UnknownInterval { symbol, interval } => {
                write!(f, "no interval {} provisioned for {}", interval, symbol)
            }
            Self::OutOfOrder {
                symbol,
                interval,
                last,
                attempted,
            } => write!(
                f,
                "out-of-order bar for {}/{}: attempted {} <= last {}",
                symbol, interval, attempted, last
            ),
            Self::OutsideWindow {
                timestamp,
                open,
                close,
            } => write!(
                f,
                "timestamp {} outside session window [{}, {})",
                timestamp, open, close
            ),
            Self::InvalidBar(err) => write!(f, "invalid bar: {}", err),
            Self::SymbolProtected(sym) => {
                write!(f, "symbol {} is config-declared and protected", sym)
            }
            Self::SymbolLocked { symbol, reason } => {
                write!(f, "symbol {} is locked: {}", symbol, reason)
            }
            Self::NoProvisionChannel => write!(f, "no provisioning channel installed"),
            Self::ProvisionQueueUnavailable => write!(f, "provisioning queue unavailable"),
            Self::DuplicateStream(id) => write!(f, "stream {} already active", id),
        }
    }
}

impl std::error::Error for SessionDataError {}

// =============================================================================
// STATISTICS
// =============================================================================

/// Store-level counters, surfaced in the status document.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub bars_appended: AtomicU64,
    pub ticks_appended: AtomicU64,
    pub quotes_appended: AtomicU64,
    pub out_of_order_rejected: AtomicU64,
    pub window_rejected: AtomicU64,
    pub missing_inserted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreStatsSnapshot {
    pub bars_appended: u64,
    pub ticks_appended: u64,
    pub quotes_appended: u64,
    pub out_of_order_rejected: u64,
    pub window_rejected: u64,
    pub missing_inserted: u64,
}

impl StoreStats {
    fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            bars_appended: self.bars_appended.load(Ordering::Relaxed),
            ticks_appended: self.ticks_appended.load(Ordering::Relaxed),
            quotes_appended: self.quotes_appended.load(Ordering::Relaxed),
            out_of_order_rejected: self.out_of_order_rejected.load(Ordering::Relaxed),
            window_rejected: self.window_rejected.load(Ordering::Relaxed),
            missing_inserted: self.missing_inserted.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// SYMBOL SLOT
// =============================================================================

/// Registry entry for one symbol: its state lock plus the lock-free
/// latest-bar pointers.
struct SymbolSlot {
    symbol: Symbol,
    state: Mutex<SymbolSessionData>,
    /// Latest-bar pointer per interval. The map is write-rare (interval
    /// provisioning); the pointers themselves swap lock-free on every append.
    latest: RwLock<HashMap<Interval, Arc<ArcSwapOption<Bar>>>>,
}

impl SymbolSlot {
    fn new(symbol: Symbol, full: bool) -> Self {
        Self {
            symbol,
            state: Mutex::new(SymbolSessionData::new(full)),
            latest: RwLock::new(HashMap::new()),
        }
    }

    fn latest_pointer(&self, interval: Interval) -> Option<Arc<ArcSwapOption<Bar>>> {
        self.latest.read().get(&interval).cloned()
    }

    fn ensure_latest_pointer(&self, interval: Interval) -> Arc<ArcSwapOption<Bar>> {
        if let Some(ptr) = self.latest_pointer(interval) {
            return ptr;
        }
        let mut map = self.latest.write();
        map.entry(interval)
            .or_insert_with(|| Arc::new(ArcSwapOption::empty()))
            .clone()
    }
}

// =============================================================================
// SESSION DATA
// =============================================================================

/// Process-wide session store. Created once at system start and passed
/// explicitly; init and teardown are explicit and idempotent.
pub struct SessionData {
    mode: SessionMode,
    ring_capacity: usize,
    registry: RwLock<HashMap<Symbol, Arc<SymbolSlot>>>,
    session_active: AtomicBool,
    current_session_date: Mutex<NaiveDate>,
    config_symbols: RwLock<BTreeSet<Symbol>>,
    active_streams: RwLock<HashSet<StreamId>>,
    /// Trading window for the current day; appends outside it are rejected.
    session_window: RwLock<Option<(DateTime<Utc>, DateTime<Utc>)>>,
    data_arrival: Arc<DataArrivalEvent>,
    provision_tx: Mutex<Option<Sender<ProvisionRequest>>>,
    stats: StoreStats,
}

impl SessionData {
    pub fn new(mode: SessionMode, session_date: NaiveDate, ring_capacity: usize) -> Self {
        Self {
            mode,
            ring_capacity,
            registry: RwLock::new(HashMap::new()),
            session_active: AtomicBool::new(false),
            current_session_date: Mutex::new(session_date),
            config_symbols: RwLock::new(BTreeSet::new()),
            active_streams: RwLock::new(HashSet::new()),
            session_window: RwLock::new(None),
            data_arrival: Arc::new(DataArrivalEvent::new()),
            provision_tx: Mutex::new(None),
            stats: StoreStats::default(),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn data_arrival(&self) -> Arc<DataArrivalEvent> {
        Arc::clone(&self.data_arrival)
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Install the coordinator's provisioning channel. Idempotent; the last
    /// installation wins.
    pub fn install_provision_channel(&self, tx: Sender<ProvisionRequest>) {
        *self.provision_tx.lock() = Some(tx);
    }

    /// Tear down all per-symbol state. Idempotent.
    pub fn teardown(&self) {
        self.session_active.store(false, Ordering::Release);
        self.registry.write().clear();
        self.active_streams.write().clear();
        self.config_symbols.write().clear();
        *self.provision_tx.lock() = None;
        info!("session store torn down");
    }

    fn slot(&self, symbol: &str) -> Result<Arc<SymbolSlot>, SessionDataError> {
        self.registry
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| SessionDataError::UnknownSymbol(symbol.to_string()))
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    pub fn activate_session(&self) {
        self.session_active.store(true, Ordering::Release);
    }

    pub fn deactivate_session(&self) {
        self.session_active.store(false, Ordering::Release);
    }

    pub fn is_session_active(&self) -> bool {
        self.session_active.load(Ordering::Acquire)
    }

    pub fn current_session_date(&self) -> NaiveDate {
        *self.current_session_date.lock()
    }

    /// Trading window for the current day, installed by the coordinator.
    pub fn set_session_window(&self, open: DateTime<Utc>, close: DateTime<Utc>) {
        *self.session_window.write() = Some((open, close));
    }

    pub fn session_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        *self.session_window.read()
    }

    /// Reset current-session state for a fresh day without promoting
    /// anything to history.
    pub fn start_new_session(&self, date: NaiveDate) {
        let slots: Vec<Arc<SymbolSlot>> = self.registry.read().values().cloned().collect();
        for slot in slots {
            slot.state.lock().clear_session();
            for ptr in slot.latest.read().values() {
                ptr.store(None);
            }
        }
        *self.current_session_date.lock() = date;
        info!(%date, "session state reset");
    }

    /// Promote the current session's bars to history (capped to the trailing
    /// retention), clear current state, and move to `new_date`.
    pub fn roll_session(&self, new_date: NaiveDate) {
        let old_date = self.current_session_date();
        let slots: Vec<Arc<SymbolSlot>> = self.registry.read().values().cloned().collect();
        for slot in slots {
            let mut state = slot.state.lock();
            let intervals: Vec<Interval> = state.intervals.keys().copied().collect();
            for interval in intervals {
                let bars = state
                    .intervals
                    .get_mut(&interval)
                    .expect("interval listed above")
                    .drain_all();
                if bars.is_empty() {
                    continue;
                }
                let cap = state
                    .historical
                    .get(&interval)
                    .map(|h| h.cap_days())
                    .unwrap_or(1);
                state
                    .historical
                    .entry(interval)
                    .or_insert_with(|| HistoricalIntervalData::new(interval, cap))
                    .add_day(old_date, bars);
            }
            state.ticks.clear();
            state.quotes.clear();
            state.metrics.reset();
            for indicator in state.indicators.values_mut() {
                indicator.value = None;
                indicator.last_updated = None;
            }
            drop(state);
            for ptr in slot.latest.read().values() {
                ptr.store(None);
            }
        }
        *self.current_session_date.lock() = new_date;
        info!(%old_date, %new_date, "session rolled");
    }

    // =========================================================================
    // MEMBERSHIP (executor-facing)
    // =========================================================================

    /// Create a symbol slot. Idempotent; `full` upgrades but never
    /// downgrades.
    pub fn create_symbol(&self, symbol: &str, full: bool) {
        let symbol = symbol.to_uppercase();
        {
            let registry = self.registry.read();
            if let Some(slot) = registry.get(&symbol) {
                if full {
                    slot.state.lock().full = true;
                }
                return;
            }
        }
        let mut registry = self.registry.write();
        registry
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(SymbolSlot::new(symbol.clone(), full)));
        debug!(%symbol, full, "symbol created");
    }

    /// Record a symbol as config-declared (protected from adhoc removal).
    pub fn mark_config_symbol(&self, symbol: &str) {
        self.config_symbols.write().insert(symbol.to_uppercase());
    }

    pub fn is_config_symbol(&self, symbol: &str) -> bool {
        self.config_symbols.read().contains(&symbol.to_uppercase())
    }

    /// Remove an adhoc symbol and its streams. Config-declared or locked
    /// symbols refuse.
    pub fn remove_symbol_adhoc(&self, symbol: &str) -> Result<(), SessionDataError> {
        let symbol = symbol.to_uppercase();
        if self.is_config_symbol(&symbol) {
            return Err(SessionDataError::SymbolProtected(symbol));
        }
        let slot = self.slot(&symbol)?;
        if let Some(reason) = slot.state.lock().lock_reason.clone() {
            return Err(SessionDataError::SymbolLocked {
                symbol,
                reason,
            });
        }
        self.registry.write().remove(&symbol);
        self.active_streams
            .write()
            .retain(|stream| stream.symbol != symbol);
        info!(%symbol, "adhoc symbol removed");
        Ok(())
    }

    pub fn get_active_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.registry.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn is_symbol_known(&self, symbol: &str) -> bool {
        self.registry.read().contains_key(&symbol.to_uppercase())
    }

    pub fn is_symbol_full(&self, symbol: &str) -> bool {
        self.slot(&symbol.to_uppercase())
            .map(|slot| slot.state.lock().full)
            .unwrap_or(false)
    }

    // =========================================================================
    // LOCKS
    // =========================================================================

    pub fn lock_symbol(&self, symbol: &str, reason: &str) -> Result<(), SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        slot.state.lock().lock_reason = Some(reason.to_string());
        Ok(())
    }

    pub fn unlock_symbol(&self, symbol: &str) -> Result<(), SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        slot.state.lock().lock_reason = None;
        Ok(())
    }

    pub fn is_symbol_locked(&self, symbol: &str) -> bool {
        self.slot(&symbol.to_uppercase())
            .map(|slot| slot.state.lock().is_locked())
            .unwrap_or(false)
    }

    pub fn symbol_lock_reason(&self, symbol: &str) -> Option<String> {
        self.slot(&symbol.to_uppercase())
            .ok()
            .and_then(|slot| slot.state.lock().lock_reason.clone())
    }

    // =========================================================================
    // INTERVAL / INDICATOR PROVISIONING (executor-facing)
    // =========================================================================

    /// Create the IntervalData container for a streamed base interval.
    pub fn ensure_base_interval(
        &self,
        symbol: &str,
        interval: Interval,
        adhoc: bool,
    ) -> Result<(), SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        let mut state = slot.state.lock();
        state
            .intervals
            .entry(interval)
            .or_insert_with(|| IntervalData::streamed(interval, self.ring_capacity));
        state.streamed_intervals.insert(interval);
        if adhoc {
            state.adhoc_intervals.insert(interval);
        }
        drop(state);
        slot.ensure_latest_pointer(interval);
        Ok(())
    }

    /// Create the IntervalData container for an interval derived from
    /// `from`.
    pub fn ensure_derived_interval(
        &self,
        symbol: &str,
        interval: Interval,
        from: Interval,
        adhoc: bool,
    ) -> Result<(), SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        let mut state = slot.state.lock();
        if !state.intervals.contains_key(&from) {
            return Err(SessionDataError::UnknownInterval {
                symbol: symbol.to_uppercase(),
                interval: from,
            });
        }
        state
            .intervals
            .entry(interval)
            .or_insert_with(|| IntervalData::derived(interval, from, self.ring_capacity));
        if adhoc {
            state.adhoc_intervals.insert(interval);
        }
        drop(state);
        slot.ensure_latest_pointer(interval);
        Ok(())
    }

    /// Register an indicator. Returns false when the identity already
    /// existed (idempotent path).
    pub fn register_indicator(
        &self,
        symbol: &str,
        config: IndicatorConfig,
        source: ProvisionSource,
    ) -> Result<bool, SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        let mut state = slot.state.lock();
        let identity = config.identity();
        if state.indicators.contains_key(&identity) {
            return Ok(false);
        }
        if !state.intervals.contains_key(&config.interval) {
            return Err(SessionDataError::UnknownInterval {
                symbol: symbol.to_uppercase(),
                interval: config.interval,
            });
        }
        state
            .indicators
            .insert(identity, IndicatorState::new(config, source));
        Ok(true)
    }

    /// Store one trailing day's historical bars.
    pub fn add_historical_day(
        &self,
        symbol: &str,
        interval: Interval,
        cap_days: usize,
        date: NaiveDate,
        bars: Vec<Bar>,
    ) -> Result<(), SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        let mut state = slot.state.lock();
        let hist = state
            .historical
            .entry(interval)
            .or_insert_with(|| HistoricalIntervalData::new(interval, cap_days));
        hist.raise_cap(cap_days);
        hist.add_day(date, bars.into_iter().map(Arc::new).collect());
        Ok(())
    }

    /// Record the bar-quality measurement for an interval.
    pub fn set_quality(
        &self,
        symbol: &str,
        interval: Interval,
        quality: f64,
        gaps: Vec<GapInfo>,
    ) -> Result<(), SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        let mut state = slot.state.lock();
        let cap = state
            .historical
            .get(&interval)
            .map(|h| h.cap_days())
            .unwrap_or(1);
        state
            .historical
            .entry(interval)
            .or_insert_with(|| HistoricalIntervalData::new(interval, cap))
            .set_quality(quality, gaps);
        Ok(())
    }

    /// Trailing-day coverage per interval: (days held, total bars).
    pub fn historical_coverage(&self, symbol: &str, interval: Interval) -> Option<(usize, usize)> {
        self.slot(&symbol.to_uppercase()).ok().and_then(|slot| {
            slot.state
                .lock()
                .historical
                .get(&interval)
                .map(|hist| (hist.day_count(), hist.total_bars()))
        })
    }

    pub fn provisioning_errors(&self, symbol: &str) -> Vec<String> {
        self.slot(&symbol.to_uppercase())
            .map(|slot| slot.state.lock().provisioning_errors.clone())
            .unwrap_or_default()
    }

    /// Latest recorded bar quality for an interval, with its gaps.
    pub fn get_quality(&self, symbol: &str, interval: Interval) -> Option<(f64, Vec<GapInfo>)> {
        self.slot(&symbol.to_uppercase()).ok().and_then(|slot| {
            slot.state
                .lock()
                .historical
                .get(&interval)
                .map(|hist| (hist.quality(), hist.gaps().to_vec()))
        })
    }

    pub fn record_provisioning_error(&self, symbol: &str, error: String) {
        if let Ok(slot) = self.slot(&symbol.to_uppercase()) {
            slot.state.lock().provisioning_errors.push(error);
        }
    }

    // =========================================================================
    // STREAM BOOKKEEPING
    // =========================================================================

    pub fn register_stream(&self, stream: StreamId) -> Result<(), SessionDataError> {
        let mut streams = self.active_streams.write();
        if !streams.insert(stream.clone()) {
            return Err(SessionDataError::DuplicateStream(stream));
        }
        Ok(())
    }

    pub fn unregister_stream(&self, stream: &StreamId) {
        self.active_streams.write().remove(stream);
    }

    pub fn active_streams(&self) -> Vec<StreamId> {
        self.active_streams.read().iter().cloned().collect()
    }

    pub fn is_stream_active(&self, stream: &StreamId) -> bool {
        self.active_streams.read().contains(stream)
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// O(1), lock-free against writers of this and other symbols.
    pub fn get_latest_bar(&self, symbol: &str, interval: Interval) -> Option<Arc<Bar>> {
        let slot = self.slot(&symbol.to_uppercase()).ok()?;
        let ptr = slot.latest_pointer(interval)?;
        ptr.load_full()
    }

    pub fn get_last_n(&self, symbol: &str, interval: Interval, n: usize) -> Vec<Arc<Bar>> {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                slot.state
                    .lock()
                    .intervals
                    .get(&interval)
                    .map(|data| data.last_n(n))
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn get_bars_since(
        &self,
        symbol: &str,
        interval: Interval,
        since: DateTime<Utc>,
    ) -> Vec<Arc<Bar>> {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                slot.state
                    .lock()
                    .intervals
                    .get(&interval)
                    .map(|data| data.since(since))
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn session_bar_count(&self, symbol: &str, interval: Interval) -> usize {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                slot.state
                    .lock()
                    .intervals
                    .get(&interval)
                    .map(|data| data.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Historical bars from the most recent `days_back` trailing days.
    pub fn get_historical(
        &self,
        symbol: &str,
        interval: Interval,
        days_back: usize,
    ) -> Vec<Arc<Bar>> {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                slot.state
                    .lock()
                    .historical
                    .get(&interval)
                    .map(|hist| hist.last_days(days_back))
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// All history plus the current session, chronological.
    pub fn get_all_including_historical(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Vec<Arc<Bar>> {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                let state = slot.state.lock();
                let mut out = state
                    .historical
                    .get(&interval)
                    .map(|hist| hist.all())
                    .unwrap_or_default();
                if let Some(data) = state.intervals.get(&interval) {
                    out.extend(data.all());
                }
                out
            })
            .unwrap_or_default()
    }

    pub fn get_indicator(&self, symbol: &str, identity: &str) -> Option<IndicatorSnapshot> {
        self.slot(&symbol.to_uppercase()).ok().and_then(|slot| {
            slot.state
                .lock()
                .indicators
                .get(identity)
                .map(IndicatorSnapshot::from)
        })
    }

    pub fn get_indicators(&self, symbol: &str) -> Vec<IndicatorSnapshot> {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                slot.state
                    .lock()
                    .indicators
                    .values()
                    .map(IndicatorSnapshot::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_session_metrics(&self, symbol: &str) -> Option<SessionMetrics> {
        self.slot(&symbol.to_uppercase())
            .ok()
            .map(|slot| slot.state.lock().metrics.clone())
    }

    /// Intervals currently held for a symbol with their derived flag.
    pub fn held_intervals(&self, symbol: &str) -> Vec<(Interval, bool)> {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                slot.state
                    .lock()
                    .intervals
                    .values()
                    .map(|data| (data.interval(), data.is_derived()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Derived intervals and their feeding base, for the quality manager.
    pub fn derived_pairs(&self, symbol: &str) -> Vec<(Interval, Interval)> {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                slot.state
                    .lock()
                    .intervals
                    .values()
                    .filter_map(|data| data.derived_from().map(|from| (from, data.interval())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn base_interval(&self, symbol: &str) -> Option<Interval> {
        self.slot(&symbol.to_uppercase())
            .ok()
            .and_then(|slot| slot.state.lock().base_interval())
    }

    /// Present bar timestamps for gap detection.
    pub fn session_timestamps(&self, symbol: &str, interval: Interval) -> Vec<DateTime<Utc>> {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                slot.state
                    .lock()
                    .intervals
                    .get(&interval)
                    .map(|data| data.timestamps())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Historical plus current-session bar count for warmup coverage.
    pub fn coverage_bar_count(&self, symbol: &str, interval: Interval) -> u64 {
        self.slot(&symbol.to_uppercase())
            .map(|slot| {
                let state = slot.state.lock();
                let historical = state
                    .historical
                    .get(&interval)
                    .map(|hist| hist.total_bars())
                    .unwrap_or(0);
                let session = state
                    .intervals
                    .get(&interval)
                    .map(|data| data.len())
                    .unwrap_or(0);
                (historical + session) as u64
            })
            .unwrap_or(0)
    }

    /// Snapshot for the requirement analyzer.
    pub fn analysis_snapshot(&self) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::default();
        let slots: Vec<Arc<SymbolSlot>> = self.registry.read().values().cloned().collect();
        let streams = self.active_streams.read();
        for slot in slots {
            let state = slot.state.lock();
            let mut snap = SymbolSnapshot {
                full: state.full,
                held: state.intervals.keys().copied().collect(),
                streamed: state.streamed_intervals.clone(),
                indicators: state.indicators.keys().cloned().collect(),
                has_tick_stream: false,
                has_quote_stream: false,
            };
            for stream in streams.iter().filter(|s| s.symbol == slot.symbol) {
                match stream.kind {
                    crate::models::StreamKind::Tick => snap.has_tick_stream = true,
                    crate::models::StreamKind::Quote => snap.has_quote_stream = true,
                    crate::models::StreamKind::Bar => {}
                }
            }
            snapshot.symbols.insert(slot.symbol.clone(), snap);
        }
        snapshot
    }

    // =========================================================================
    // INGESTION WRITES
    // =========================================================================

    /// Append a streamed or derived bar. Rejects out-of-order timestamps and
    /// timestamps outside the session window; on success updates the
    /// latest-bar pointer, folds session metrics for the base interval, and
    /// pulses the data-arrival event.
    pub fn append_bar(
        &self,
        symbol: &str,
        interval: Interval,
        bar: Bar,
    ) -> Result<(), SessionDataError> {
        bar.validate().map_err(SessionDataError::InvalidBar)?;
        let symbol = symbol.to_uppercase();

        if let Some((open, close)) = self.session_window() {
            if bar.timestamp < open || bar.timestamp >= close {
                self.stats.window_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(SessionDataError::OutsideWindow {
                    timestamp: bar.timestamp,
                    open,
                    close,
                });
            }
        }

        let slot = self.slot(&symbol)?;
        let shared = Arc::new(bar);
        {
            let mut state = slot.state.lock();
            let is_base = state.base_interval() == Some(interval);
            let data = state.intervals.get_mut(&interval).ok_or(
                SessionDataError::UnknownInterval {
                    symbol: symbol.clone(),
                    interval,
                },
            )?;
            if let Err(last) = data.append(Arc::clone(&shared)) {
                self.stats
                    .out_of_order_rejected
                    .fetch_add(1, Ordering::Relaxed);
                return Err(SessionDataError::OutOfOrder {
                    symbol,
                    interval,
                    last,
                    attempted: shared.timestamp,
                });
            }
            if is_base {
                state.metrics.update_from_bar(&shared);
            }
        }

        slot.ensure_latest_pointer(interval).store(Some(shared));
        self.stats.bars_appended.fetch_add(1, Ordering::Relaxed);
        trace!(%symbol, %interval, "bar appended");
        self.data_arrival.notify();
        Ok(())
    }

    /// Privileged repair path for gap filling and mid-session catch-up.
    /// Inserts at the sorted position; the latest-bar pointer moves only
    /// when the inserted bar is the newest.
    pub fn insert_missing(
        &self,
        symbol: &str,
        interval: Interval,
        bar: Bar,
    ) -> Result<(), SessionDataError> {
        bar.validate().map_err(SessionDataError::InvalidBar)?;
        let symbol = symbol.to_uppercase();
        let slot = self.slot(&symbol)?;
        let shared = Arc::new(bar);
        let became_newest = {
            let mut state = slot.state.lock();
            let is_base = state.base_interval() == Some(interval);
            let data = state.intervals.get_mut(&interval).ok_or(
                SessionDataError::UnknownInterval {
                    symbol: symbol.clone(),
                    interval,
                },
            )?;
            let newest = data.insert_sorted(Arc::clone(&shared));
            if is_base {
                state.metrics.update_from_bar(&shared);
            }
            newest
        };
        if became_newest {
            slot.ensure_latest_pointer(interval).store(Some(shared));
        }
        self.stats.missing_inserted.fetch_add(1, Ordering::Relaxed);
        self.data_arrival.notify();
        Ok(())
    }

    pub fn append_tick(&self, symbol: &str, tick: Tick) -> Result<(), SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        {
            let mut state = slot.state.lock();
            state.metrics.update_from_tick(&tick);
            state.ticks.push(tick);
        }
        self.stats.ticks_appended.fetch_add(1, Ordering::Relaxed);
        self.data_arrival.notify();
        Ok(())
    }

    pub fn append_quote(&self, symbol: &str, quote: Quote) -> Result<(), SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        slot.state.lock().quotes.push(quote);
        self.stats.quotes_appended.fetch_add(1, Ordering::Relaxed);
        self.data_arrival.notify();
        Ok(())
    }

    /// Update an indicator value (downstream processor write path).
    pub fn update_indicator_value(
        &self,
        symbol: &str,
        identity: &str,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), SessionDataError> {
        let slot = self.slot(&symbol.to_uppercase())?;
        let mut state = slot.state.lock();
        if let Some(indicator) = state.indicators.get_mut(identity) {
            indicator.value = Some(value);
            indicator.last_updated = Some(at);
        }
        Ok(())
    }

    /// Mark indicators on `interval` valid once warmup coverage is reached.
    /// Returns the identities promoted this call.
    pub fn promote_indicator_validity(
        &self,
        symbol: &str,
        interval: Interval,
        covered_bars: u64,
    ) -> Vec<String> {
        let mut promoted = Vec::new();
        if let Ok(slot) = self.slot(&symbol.to_uppercase()) {
            let mut state = slot.state.lock();
            for indicator in state.indicators.values_mut() {
                if indicator.config.interval == interval
                    && !indicator.valid
                    && covered_bars >= indicator.warmup_bars as u64
                {
                    indicator.valid = true;
                    promoted.push(indicator.identity.clone());
                }
            }
        }
        promoted
    }

    // =========================================================================
    // ADHOC ENTRY POINTS (queued to the coordinator)
    // =========================================================================

    fn enqueue(&self, request: ProvisionRequest) -> Result<(), SessionDataError> {
        let tx = self.provision_tx.lock();
        let tx = tx.as_ref().ok_or(SessionDataError::NoProvisionChannel)?;
        match tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(req)) | Err(TrySendError::Disconnected(req)) => {
                warn!(?req, "provisioning request dropped");
                Err(SessionDataError::ProvisionQueueUnavailable)
            }
        }
    }

    /// Queue a full-symbol add (idempotent; adhoc-only symbols upgrade).
    pub fn add_symbol(&self, symbol: &str) -> Result<(), SessionDataError> {
        if self.is_symbol_full(symbol) {
            return Ok(());
        }
        self.enqueue(ProvisionRequest::symbol(symbol.to_uppercase()))
    }

    /// Queue a streamed-interval registration without historical load.
    pub fn add_session_bars(&self, symbol: &str, interval: Interval) -> Result<(), SessionDataError> {
        self.enqueue(ProvisionRequest::bar_interval(
            symbol.to_uppercase(),
            interval,
        ))
    }

    /// Queue a historical load for an interval.
    pub fn add_historical_bars(
        &self,
        symbol: &str,
        interval: Interval,
        days: u32,
    ) -> Result<(), SessionDataError> {
        self.enqueue(ProvisionRequest::historical(
            symbol.to_uppercase(),
            interval,
            days,
        ))
    }

    /// Queue an indicator registration; bar requirements are auto-added by
    /// the analyzer. Idempotent on identity.
    pub fn add_indicator(
        &self,
        symbol: &str,
        config: IndicatorConfig,
    ) -> Result<(), SessionDataError> {
        self.enqueue(ProvisionRequest::indicator(symbol.to_uppercase(), config))
    }
}
