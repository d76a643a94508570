//! Data-upkeep and quality manager.
//!
//! Runs as a co-thread that wakes on the data-arrival event (or a bounded
//! timeout) and, per active symbol: detects gaps on the base streaming
//! interval, maintains the bar-quality metric, fills gaps from the
//! repository (live/hybrid; backtest data is canonical unless filling is
//! explicitly forced), aggregates derived bars over closed windows, and
//! promotes indicator validity once warmup coverage is reached.

use crate::config::GapFillerConfig;
use crate::models::{Bar, Interval, Symbol};
use crate::repository::{MarketDataRepository, RepositoryError};
use crate::session_data::{GapInfo, SessionData};
use crate::time_manager::TimeManager;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

// =============================================================================
// PURE HELPERS
// =============================================================================

/// Expected bar timestamps for `interval` between session open and `until`
/// (exclusive of bars whose window has not fully elapsed), bounded by the
/// session close.
pub fn expected_timestamps(
    open: DateTime<Utc>,
    until: DateTime<Utc>,
    close: DateTime<Utc>,
    interval: Interval,
) -> Vec<DateTime<Utc>> {
    let step = interval.duration();
    let mut out = Vec::new();
    let mut ts = open;
    let effective = until.min(close);
    while ts + step <= effective {
        out.push(ts);
        ts += step;
    }
    out
}

/// Group missing timestamps into contiguous gap runs.
pub fn detect_gaps(
    expected: &[DateTime<Utc>],
    present: &[DateTime<Utc>],
    interval: Interval,
) -> Vec<GapInfo> {
    let present: std::collections::HashSet<&DateTime<Utc>> = present.iter().collect();
    let step = interval.duration();
    let mut gaps: Vec<GapInfo> = Vec::new();
    for ts in expected {
        if present.contains(ts) {
            continue;
        }
        match gaps.last_mut() {
            Some(gap) if gap.end + step == *ts => {
                gap.end = *ts;
                gap.count += 1;
            }
            _ => gaps.push(GapInfo {
                start: *ts,
                end: *ts,
                count: 1,
            }),
        }
    }
    gaps
}

/// Present/expected ratio as a percentage, clamped to [0, 100].
pub fn bar_quality(present: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 100.0;
    }
    (100.0 * present as f64 / expected as f64).clamp(0.0, 100.0)
}

/// OHLCV aggregation of one closed window of base bars: open of the first,
/// max high, min low, close of the last, summed volume.
pub fn aggregate_bars(window_start: DateTime<Utc>, bars: &[Arc<Bar>]) -> Option<Bar> {
    let first = bars.first()?;
    let last = bars.last()?;
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    for bar in bars {
        high = high.max(bar.high);
        low = low.min(bar.low);
        volume += bar.volume;
    }
    Some(Bar::new(
        window_start,
        first.open,
        high,
        low,
        last.close,
        volume,
    ))
}

// =============================================================================
// STATISTICS
// =============================================================================

#[derive(Debug, Default)]
pub struct QualityStats {
    pub cycles: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub bars_filled: AtomicU64,
    pub fill_failures: AtomicU64,
    pub derived_bars: AtomicU64,
    pub indicators_promoted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QualityStatsSnapshot {
    pub cycles: u64,
    pub gaps_detected: u64,
    pub bars_filled: u64,
    pub fill_failures: u64,
    pub derived_bars: u64,
    pub indicators_promoted: u64,
}

impl QualityStats {
    fn snapshot(&self) -> QualityStatsSnapshot {
        QualityStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            bars_filled: self.bars_filled.load(Ordering::Relaxed),
            fill_failures: self.fill_failures.load(Ordering::Relaxed),
            derived_bars: self.derived_bars.load(Ordering::Relaxed),
            indicators_promoted: self.indicators_promoted.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

struct RetryState {
    attempts: u32,
    next_attempt: Instant,
}

/// Background data-upkeep manager.
pub struct DataQualityManager {
    session: Arc<SessionData>,
    time: Arc<TimeManager>,
    repository: Arc<dyn MarketDataRepository>,
    gap_filler: GapFillerConfig,
    /// Filling is active in live mode, or when explicitly forced in backtest.
    gap_fill_enabled: bool,
    wake: Duration,
    stop: Arc<AtomicBool>,
    stats: QualityStats,
    /// Next unemitted window start per (symbol, derived interval).
    derive_cursors: Mutex<HashMap<(Symbol, Interval), DateTime<Utc>>>,
    /// Backoff state per gap start.
    retries: Mutex<HashMap<(Symbol, Interval, DateTime<Utc>), RetryState>>,
}

impl DataQualityManager {
    pub fn new(
        session: Arc<SessionData>,
        time: Arc<TimeManager>,
        repository: Arc<dyn MarketDataRepository>,
        gap_filler: GapFillerConfig,
        wake: Duration,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let gap_fill_enabled =
            !session.mode().is_backtest() || gap_filler.force_backtest_fill;
        Self {
            session,
            time,
            repository,
            gap_filler,
            gap_fill_enabled,
            wake,
            stop,
            stats: QualityStats::default(),
            derive_cursors: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> QualityStatsSnapshot {
        self.stats.snapshot()
    }

    /// Forget per-day state at a session boundary.
    pub fn reset_day(&self) {
        self.derive_cursors.lock().clear();
        self.retries.lock().clear();
    }

    /// Spawn the manager thread; it wakes on data arrival or the bounded
    /// timeout and runs one upkeep cycle per wake.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let manager = self;
        std::thread::Builder::new()
            .name("data-quality".to_string())
            .spawn(move || {
                info!("data-quality manager started");
                let arrival = manager.session.data_arrival();
                let mut seen = arrival.generation();
                loop {
                    if manager.stop.load(Ordering::Acquire) {
                        break;
                    }
                    let (generation, _fired) =
                        arrival.wait_newer(seen, manager.wake, &manager.stop);
                    seen = generation;
                    if manager.stop.load(Ordering::Acquire) {
                        break;
                    }
                    if manager.session.is_session_active() {
                        manager.run_cycle();
                    }
                }
                info!("data-quality manager stopped");
            })
            .expect("spawn data-quality manager")
    }

    /// One upkeep pass over every active symbol. Public so the coordinator
    /// (and tests) can run deterministic cycles.
    pub fn run_cycle(&self) {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        let Some((open, close)) = self.session.session_window() else {
            return;
        };
        let now = self.time.now();

        for symbol in self.session.get_active_symbols() {
            let Some(base) = self.session.base_interval(&symbol) else {
                continue;
            };

            // 1-2. Gap detection and bar quality on the base interval.
            let expected = expected_timestamps(open, now, close, base);
            let present = self.session.session_timestamps(&symbol, base);
            let gaps = detect_gaps(&expected, &present, base);
            if !gaps.is_empty() {
                self.stats
                    .gaps_detected
                    .fetch_add(gaps.len() as u64, Ordering::Relaxed);
            }
            let quality = bar_quality(
                expected.len() - gaps.iter().map(|g| g.count as usize).sum::<usize>(),
                expected.len(),
            );
            if self.gap_filler.enable_session_quality {
                let _ = self
                    .session
                    .set_quality(&symbol, base, quality, gaps.clone());
            }

            // 3. Gap filling.
            if self.gap_fill_enabled && !gaps.is_empty() {
                self.fill_gaps(&symbol, base, &gaps);
            }

            // 4. Derived-bar aggregation over closed windows.
            for (base_iv, derived_iv) in self.session.derived_pairs(&symbol) {
                self.aggregate_derived(&symbol, base_iv, derived_iv, open, close);
            }

            // Indicator warmup promotion per held interval.
            for (interval, _) in self.session.held_intervals(&symbol) {
                let covered = self.session.coverage_bar_count(&symbol, interval);
                let promoted = self
                    .session
                    .promote_indicator_validity(&symbol, interval, covered);
                if !promoted.is_empty() {
                    self.stats
                        .indicators_promoted
                        .fetch_add(promoted.len() as u64, Ordering::Relaxed);
                    debug!(%symbol, %interval, ?promoted, "indicators became valid");
                }
            }
        }
    }

    fn fill_gaps(&self, symbol: &str, interval: Interval, gaps: &[GapInfo]) {
        for gap in gaps {
            let key = (symbol.to_string(), interval, gap.start);
            {
                let mut retries = self.retries.lock();
                let state = retries.entry(key.clone()).or_insert(RetryState {
                    attempts: 0,
                    next_attempt: Instant::now(),
                });
                if state.attempts >= self.gap_filler.max_retries {
                    continue;
                }
                if Instant::now() < state.next_attempt {
                    continue;
                }
                state.attempts += 1;
                // Exponential backoff from the configured base interval.
                let backoff = self.gap_filler.retry_interval_seconds
                    * f64::from(1u32 << (state.attempts - 1).min(8));
                state.next_attempt = Instant::now() + Duration::from_secs_f64(backoff);
            }

            let end = gap.end + interval.duration();
            match self
                .repository
                .get_bars(symbol, interval, gap.start, end)
            {
                Ok(bars) => {
                    let mut filled = 0u64;
                    for bar in bars {
                        if self.session.insert_missing(symbol, interval, bar).is_ok() {
                            filled += 1;
                        }
                    }
                    self.stats.bars_filled.fetch_add(filled, Ordering::Relaxed);
                    self.retries.lock().remove(&key);
                    debug!(%symbol, %interval, filled, "gap filled");
                }
                Err(RepositoryError::NoData) => {
                    trace!(%symbol, %interval, gap_start = %gap.start, "gap fill found no data");
                }
                Err(err) => {
                    self.stats.fill_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%symbol, %interval, error = %err, "gap fill failed");
                }
            }
        }
    }

    fn aggregate_derived(
        &self,
        symbol: &str,
        base: Interval,
        derived: Interval,
        open: DateTime<Utc>,
        close: DateTime<Utc>,
    ) {
        // Window is closed once base data has progressed to or past its end.
        let Some(last_base) = self
            .session
            .session_timestamps(symbol, base)
            .last()
            .copied()
        else {
            return;
        };
        let progress = last_base + base.duration();

        let mut cursors = self.derive_cursors.lock();
        let cursor = cursors
            .entry((symbol.to_string(), derived))
            .or_insert(open);

        while *cursor + derived.duration() <= progress && *cursor < close {
            let window_start = *cursor;
            let window_end = window_start + derived.duration();
            let window_bars: Vec<Arc<Bar>> = self
                .session
                .get_bars_since(symbol, base, window_start)
                .into_iter()
                .filter(|bar| bar.timestamp < window_end)
                .collect();

            if let Some(bar) = aggregate_bars(window_start, &window_bars) {
                match self.session.append_bar(symbol, derived, bar) {
                    Ok(()) => {
                        self.stats.derived_bars.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        // Insufficient or inconsistent data defers to the
                        // next cycle.
                        warn!(%symbol, %derived, error = %err, "derived append failed");
                        break;
                    }
                }
            }
            *cursor = window_end;
        }
    }
}
