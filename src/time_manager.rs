//! Time authority.
//!
//! The only source of "now" in the engine, and the only component that talks
//! to the trading calendar. In live mode `now()` is wall time; in backtest it
//! is the stored simulated time, advanced exclusively by the coordinator's
//! streaming loop.
//!
//! Calendar lookups are cached twice: a one-slot last-query cache (streaming
//! asks for the same date thousands of times in a row) and a bounded LRU
//! behind it. Both are cleared by `invalidate_cache()`.

use crate::config::SessionMode;
use crate::repository::{MarketDataRepository, RepositoryError, TradingSessionInfo};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Longest forward/backward calendar walk before giving up. Generous enough
/// for a decade of holidays.
const MAX_CALENDAR_WALK_DAYS: u32 = 3_660;

const LRU_CAPACITY: usize = 128;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    /// Operation not valid in the current mode (e.g. setting backtest time
    /// while live).
    IllegalState(String),
    /// Attempt to move the simulated clock backward outside the session
    /// boundary transition.
    NonMonotonic {
        current: DateTime<Utc>,
        requested: DateTime<Utc>,
    },
    /// Calendar backend unreachable or has no row for the request.
    CalendarUnavailable(String),
}

impl fmt::Display for TimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalState(msg) => write!(f, "illegal state: {}", msg),
            Self::NonMonotonic { current, requested } => write!(
                f,
                "clock cannot move backward: current {} requested {}",
                current, requested
            ),
            Self::CalendarUnavailable(msg) => write!(f, "calendar unavailable: {}", msg),
        }
    }
}

impl std::error::Error for TimeError {}

// =============================================================================
// CACHE STATISTICS
// =============================================================================

/// Calendar-cache counters, surfaced in the status document.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub one_slot_hits: AtomicU64,
    pub lru_hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub invalidations: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheStatsSnapshot {
    pub one_slot_hits: u64,
    pub lru_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            one_slot_hits: self.one_slot_hits.load(Ordering::Relaxed),
            lru_hits: self.lru_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.one_slot_hits + self.lru_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Bounded LRU over calendar rows. Hand-rolled; the working set is tiny and
/// the access pattern is one hot date plus occasional date arithmetic.
struct SessionLru {
    map: HashMap<NaiveDate, TradingSessionInfo>,
    order: VecDeque<NaiveDate>,
}

impl SessionLru {
    fn new() -> Self {
        Self {
            map: HashMap::with_capacity(LRU_CAPACITY),
            order: VecDeque::with_capacity(LRU_CAPACITY),
        }
    }

    fn get(&mut self, date: NaiveDate) -> Option<TradingSessionInfo> {
        let hit = self.map.get(&date).cloned();
        if hit.is_some() {
            self.order.retain(|d| *d != date);
            self.order.push_back(date);
        }
        hit
    }

    /// Insert, returning true when an eviction occurred.
    fn insert(&mut self, date: NaiveDate, info: TradingSessionInfo) -> bool {
        let mut evicted = false;
        if self.map.insert(date, info).is_none() {
            self.order.push_back(date);
            if self.order.len() > LRU_CAPACITY {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    evicted = true;
                }
            }
        } else {
            self.order.retain(|d| *d != date);
            self.order.push_back(date);
        }
        evicted
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

// =============================================================================
// TIME MANAGER
// =============================================================================

/// Single authority for "now", trading-session hours, and exchange-calendar
/// date arithmetic.
pub struct TimeManager {
    mode: SessionMode,
    exchange_group: String,
    asset_class: String,
    repository: Arc<dyn MarketDataRepository>,
    /// Simulated clock; None in live mode.
    sim_now: Mutex<Option<DateTime<Utc>>>,
    one_slot: Mutex<Option<(NaiveDate, TradingSessionInfo)>>,
    lru: Mutex<SessionLru>,
    stats: CacheStats,
}

impl TimeManager {
    pub fn new(
        mode: SessionMode,
        repository: Arc<dyn MarketDataRepository>,
        exchange_group: impl Into<String>,
        asset_class: impl Into<String>,
        initial_backtest_time: Option<DateTime<Utc>>,
    ) -> Result<Self, TimeError> {
        if mode.is_backtest() && initial_backtest_time.is_none() {
            return Err(TimeError::IllegalState(
                "backtest mode requires an initial simulated time".to_string(),
            ));
        }
        Ok(Self {
            mode,
            exchange_group: exchange_group.into(),
            asset_class: asset_class.into(),
            repository,
            sim_now: Mutex::new(initial_backtest_time),
            one_slot: Mutex::new(None),
            lru: Mutex::new(SessionLru::new()),
            stats: CacheStats::default(),
        })
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Current time: wall clock when live, simulated clock in backtest.
    pub fn now(&self) -> DateTime<Utc> {
        match self.mode {
            SessionMode::Live => Utc::now(),
            SessionMode::Backtest => self
                .sim_now
                .lock()
                .expect("backtest clock initialized at construction"),
        }
    }

    /// Advance the simulated clock. Monotonic non-decreasing within a
    /// session; the session-boundary transition uses `begin_new_session`.
    pub fn set_backtest_time(&self, t: DateTime<Utc>) -> Result<(), TimeError> {
        if !self.mode.is_backtest() {
            return Err(TimeError::IllegalState(
                "set_backtest_time called in live mode".to_string(),
            ));
        }
        let mut sim = self.sim_now.lock();
        let current = sim.expect("backtest clock initialized at construction");
        if t < current {
            return Err(TimeError::NonMonotonic {
                current,
                requested: t,
            });
        }
        *sim = Some(t);
        Ok(())
    }

    /// Session-boundary transition: reset the clock to the next session's
    /// open. The only path allowed to move the clock backward.
    pub fn begin_new_session(&self, open: DateTime<Utc>) -> Result<(), TimeError> {
        if !self.mode.is_backtest() {
            return Err(TimeError::IllegalState(
                "begin_new_session called in live mode".to_string(),
            ));
        }
        *self.sim_now.lock() = Some(open);
        Ok(())
    }

    /// Trading session for `date`, through the one-slot and LRU caches.
    pub fn get_trading_session(&self, date: NaiveDate) -> Result<TradingSessionInfo, TimeError> {
        {
            let slot = self.one_slot.lock();
            if let Some((cached_date, info)) = slot.as_ref() {
                if *cached_date == date {
                    self.stats.one_slot_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(info.clone());
                }
            }
        }

        if let Some(info) = self.lru.lock().get(date) {
            self.stats.lru_hits.fetch_add(1, Ordering::Relaxed);
            *self.one_slot.lock() = Some((date, info.clone()));
            return Ok(info);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let info = self
            .repository
            .get_trading_session(date, &self.exchange_group, &self.asset_class)
            .map_err(|e| match e {
                RepositoryError::Transient(msg) | RepositoryError::Permanent(msg) => {
                    TimeError::CalendarUnavailable(msg)
                }
                RepositoryError::NoData => {
                    TimeError::CalendarUnavailable(format!("no calendar row for {}", date))
                }
            })?;

        if self.lru.lock().insert(date, info.clone()) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        *self.one_slot.lock() = Some((date, info.clone()));
        Ok(info)
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> Result<bool, TimeError> {
        Ok(self.get_trading_session(date)?.is_trading_day)
    }

    pub fn is_holiday(&self, date: NaiveDate) -> Result<bool, TimeError> {
        use chrono::Datelike;
        let session = self.get_trading_session(date)?;
        let weekday = date.weekday().number_from_monday() <= 5;
        Ok(weekday && !session.is_trading_day)
    }

    /// N-th trading date strictly after `from`.
    pub fn get_next_trading_date(&self, from: NaiveDate, n: u32) -> Result<NaiveDate, TimeError> {
        debug_assert!(n >= 1);
        let mut date = from;
        let mut remaining = n;
        for _ in 0..MAX_CALENDAR_WALK_DAYS {
            date = date.succ_opt().ok_or_else(|| {
                TimeError::CalendarUnavailable("date overflow in calendar walk".to_string())
            })?;
            if self.is_trading_day(date)? {
                remaining -= 1;
                if remaining == 0 {
                    return Ok(date);
                }
            }
        }
        Err(TimeError::CalendarUnavailable(format!(
            "no trading date within {} days after {}",
            MAX_CALENDAR_WALK_DAYS, from
        )))
    }

    /// First trading date at or after `from`; returns `from` itself when it
    /// is a trading day.
    pub fn get_first_trading_date(&self, from: NaiveDate) -> Result<NaiveDate, TimeError> {
        if self.is_trading_day(from)? {
            return Ok(from);
        }
        self.get_next_trading_date(from, 1)
    }

    /// The `n` trading dates strictly before `from`, most recent first.
    pub fn get_prev_trading_dates(
        &self,
        from: NaiveDate,
        n: u32,
    ) -> Result<Vec<NaiveDate>, TimeError> {
        let mut out = Vec::with_capacity(n as usize);
        let mut date = from;
        for _ in 0..MAX_CALENDAR_WALK_DAYS {
            if out.len() == n as usize {
                return Ok(out);
            }
            date = date.pred_opt().ok_or_else(|| {
                TimeError::CalendarUnavailable("date underflow in calendar walk".to_string())
            })?;
            if self.is_trading_day(date)? {
                out.push(date);
            }
        }
        if out.len() == n as usize {
            Ok(out)
        } else {
            Err(TimeError::CalendarUnavailable(format!(
                "only {} trading dates found within {} days before {}",
                out.len(),
                MAX_CALENDAR_WALK_DAYS,
                from
            )))
        }
    }

    pub fn invalidate_cache(&self) {
        self.one_slot.lock().take();
        self.lru.lock().clear();
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        warn!(
            exchange_group = %self.exchange_group,
            "calendar cache invalidated"
        );
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
