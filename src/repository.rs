//! Historical-data repository interface.
//!
//! The persistent repository is an external collaborator: the engine only
//! names its contract. `MemoryRepository` is the deterministic in-memory
//! implementation used by the test suite and the demo runner; it synthesizes
//! bars over a weekday calendar and can inject gaps, latencies, and failures
//! for quality-manager tests.

use crate::models::{Bar, Interval, Quote, Symbol, Tick};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

// =============================================================================
// ERRORS
// =============================================================================

/// Repository failure classes. Transient failures are retried with bounded
/// backoff by callers; permanent failures are surfaced per symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Empty range: not an error condition for most callers.
    NoData,
    /// Retryable failure (connection reset, timeout).
    Transient(String),
    /// Non-retryable failure (unknown symbol, corrupt range).
    Permanent(String),
}

impl RepositoryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoData => write!(f, "no data in range"),
            Self::Transient(msg) => write!(f, "transient repository error: {}", msg),
            Self::Permanent(msg) => write!(f, "permanent repository error: {}", msg),
        }
    }
}

impl std::error::Error for RepositoryError {}

// =============================================================================
// TRADING SESSION RECORD
// =============================================================================

/// One calendar row: the trading session for a (date, exchange) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradingSessionInfo {
    pub date: NaiveDate,
    pub regular_open: DateTime<Utc>,
    pub regular_close: DateTime<Utc>,
    pub early_close: Option<DateTime<Utc>>,
    pub is_trading_day: bool,
}

impl TradingSessionInfo {
    /// Effective close: the early close when one applies.
    pub fn effective_close(&self) -> DateTime<Utc> {
        self.early_close.unwrap_or(self.regular_close)
    }
}

// =============================================================================
// REPOSITORY TRAIT
// =============================================================================

/// Contract of the persistent historical-data repository.
///
/// All bar/tick/quote queries return items ordered ascending by timestamp
/// and use half-open ranges [start, end). Empty ranges return `NoData`.
pub trait MarketDataRepository: Send + Sync {
    fn get_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, RepositoryError>;

    fn get_ticks(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Tick>, RepositoryError>;

    fn get_quotes(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Quote>, RepositoryError>;

    fn get_trading_session(
        &self,
        date: NaiveDate,
        exchange_group: &str,
        asset_class: &str,
    ) -> Result<TradingSessionInfo, RepositoryError>;

    fn get_holidays(
        &self,
        exchange_group: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NaiveDate>, RepositoryError>;
}

// =============================================================================
// IN-MEMORY REPOSITORY
// =============================================================================

/// Deterministic synthetic repository.
///
/// Prices are a per-symbol deterministic walk, so repeated queries for the
/// same range return identical bars. Weekends and configured holidays are
/// non-trading days; sessions run 09:30-16:00 (UTC-naive for simplicity).
pub struct MemoryRepository {
    holidays: BTreeSet<NaiveDate>,
    early_closes: HashMap<NaiveDate, NaiveTime>,
    known_exchanges: HashSet<(String, String)>,
    /// (symbol, bar timestamp) pairs omitted from results, for gap tests.
    gaps: Mutex<HashSet<(Symbol, DateTime<Utc>)>>,
    /// Pending transient failures, decremented per call.
    fail_transient: Mutex<u32>,
    calls: Mutex<u64>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        let mut known_exchanges = HashSet::new();
        known_exchanges.insert(("us_equities".to_string(), "equity".to_string()));
        Self {
            holidays: BTreeSet::new(),
            early_closes: HashMap::new(),
            known_exchanges,
            gaps: Mutex::new(HashSet::new()),
            fail_transient: Mutex::new(0),
            calls: Mutex::new(0),
        }
    }

    pub fn with_holidays<I: IntoIterator<Item = NaiveDate>>(mut self, holidays: I) -> Self {
        self.holidays.extend(holidays);
        self
    }

    pub fn with_early_close(mut self, date: NaiveDate, close: NaiveTime) -> Self {
        self.early_closes.insert(date, close);
        self
    }

    pub fn with_exchange(mut self, exchange_group: &str, asset_class: &str) -> Self {
        self.known_exchanges
            .insert((exchange_group.to_string(), asset_class.to_string()));
        self
    }

    /// Omit the bar at `ts` for `symbol` from future query results.
    pub fn inject_gap(&self, symbol: &str, ts: DateTime<Utc>) {
        self.gaps.lock().insert((symbol.to_string(), ts));
    }

    /// Heal a previously injected gap, letting gap-fill queries find it.
    pub fn heal_gap(&self, symbol: &str, ts: DateTime<Utc>) {
        self.gaps.lock().remove(&(symbol.to_string(), ts));
    }

    /// Make the next `n` data queries fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        *self.fail_transient.lock() = n;
    }

    pub fn call_count(&self) -> u64 {
        *self.calls.lock()
    }

    fn on_call(&self) -> Result<(), RepositoryError> {
        *self.calls.lock() += 1;
        let mut remaining = self.fail_transient.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(RepositoryError::Transient("injected failure".to_string()));
        }
        Ok(())
    }

    fn session_for(&self, date: NaiveDate) -> TradingSessionInfo {
        use chrono::Datelike;
        let weekday = date.weekday().number_from_monday();
        let is_trading_day = weekday <= 5 && !self.holidays.contains(&date);
        let open = Utc.from_utc_datetime(&date.and_hms_opt(9, 30, 0).unwrap());
        let close = Utc.from_utc_datetime(&date.and_hms_opt(16, 0, 0).unwrap());
        let early_close = self
            .early_closes
            .get(&date)
            .map(|t| Utc.from_utc_datetime(&date.and_time(*t)));
        TradingSessionInfo {
            date,
            regular_open: open,
            regular_close: close,
            early_close,
            is_trading_day,
        }
    }

    /// Deterministic per-symbol base price.
    fn base_price(symbol: &str) -> f64 {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in symbol.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        40.0 + (h % 400) as f64
    }

    fn synth_bar(symbol: &str, interval: Interval, ts: DateTime<Utc>) -> Bar {
        let base = Self::base_price(symbol);
        let idx = ts.timestamp() / interval.total_seconds();
        // Small deterministic oscillation; amplitude keeps OHLC well-formed.
        let phase = (idx % 97) as f64 / 97.0 * std::f64::consts::TAU;
        let drift = phase.sin() * base * 0.01;
        let open = base + drift;
        let close = base + (phase + 0.3).sin() * base * 0.01;
        let high = open.max(close) + base * 0.002;
        let low = open.min(close) - base * 0.002;
        let volume = 1_000.0 + (idx % 13) as f64 * 150.0;
        Bar::new(ts, open, high, low, close, volume)
    }

    /// Trading-window timestamps for `interval` in [start, end).
    fn bar_times(
        &self,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        let step = interval.duration();
        let mut date = start.date_naive();
        while Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap()) < end {
            let session = self.session_for(date);
            if session.is_trading_day {
                let close = session.effective_close();
                let mut ts = session.regular_open;
                while ts < close {
                    if ts >= start && ts < end {
                        out.push(ts);
                    }
                    ts += step;
                }
            }
            date = date.succ_opt().expect("date overflow");
        }
        out
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDataRepository for MemoryRepository {
    fn get_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, RepositoryError> {
        self.on_call()?;
        let gaps = self.gaps.lock();
        let bars: Vec<Bar> = self
            .bar_times(interval, start, end)
            .into_iter()
            .filter(|ts| !gaps.contains(&(symbol.to_string(), *ts)))
            .map(|ts| Self::synth_bar(symbol, interval, ts))
            .collect();
        if bars.is_empty() {
            Err(RepositoryError::NoData)
        } else {
            Ok(bars)
        }
    }

    fn get_ticks(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Tick>, RepositoryError> {
        self.on_call()?;
        // One print every 15s derived from the minute bar path.
        let ticks: Vec<Tick> = self
            .bar_times(Interval::seconds(15), start, end)
            .into_iter()
            .map(|ts| {
                let bar = Self::synth_bar(symbol, Interval::minutes(1), ts);
                Tick {
                    timestamp: ts,
                    price: bar.close,
                    size: 100.0,
                }
            })
            .collect();
        if ticks.is_empty() {
            Err(RepositoryError::NoData)
        } else {
            Ok(ticks)
        }
    }

    fn get_quotes(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Quote>, RepositoryError> {
        self.on_call()?;
        let quotes: Vec<Quote> = self
            .bar_times(Interval::seconds(15), start, end)
            .into_iter()
            .map(|ts| {
                let bar = Self::synth_bar(symbol, Interval::minutes(1), ts);
                Quote {
                    timestamp: ts,
                    bid: bar.close - 0.01,
                    ask: bar.close + 0.01,
                    bid_size: 300.0,
                    ask_size: 300.0,
                }
            })
            .collect();
        if quotes.is_empty() {
            Err(RepositoryError::NoData)
        } else {
            Ok(quotes)
        }
    }

    fn get_trading_session(
        &self,
        date: NaiveDate,
        exchange_group: &str,
        asset_class: &str,
    ) -> Result<TradingSessionInfo, RepositoryError> {
        let key = (exchange_group.to_string(), asset_class.to_string());
        if !self.known_exchanges.contains(&key) {
            return Err(RepositoryError::Permanent(format!(
                "no calendar row for ({}, {})",
                exchange_group, asset_class
            )));
        }
        Ok(self.session_for(date))
    }

    fn get_holidays(
        &self,
        _exchange_group: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NaiveDate>, RepositoryError> {
        Ok(self
            .holidays
            .iter()
            .copied()
            .filter(|d| *d >= from && *d <= to)
            .collect())
    }
}
