//! Per-symbol session state.
//!
//! Everything here lives behind the symbol's own lock in the store; nothing
//! in this file is synchronized on its own.

use super::interval_data::{HistoricalIntervalData, IntervalData};
use crate::config::IndicatorConfig;
use crate::models::{Bar, Interval, Quote, Tick};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// SESSION METRICS
// =============================================================================

/// Running per-symbol metrics for the current session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub cumulative_volume: f64,
    /// VWAP accumulators: sum of price*volume and sum of volume.
    pub vwap_pv: f64,
    pub vwap_volume: f64,
    pub trade_count: u64,
}

impl SessionMetrics {
    /// Fold one base-interval bar into the running metrics.
    pub fn update_from_bar(&mut self, bar: &Bar) {
        if self.open.is_none() {
            self.open = Some(bar.open);
        }
        self.high = Some(self.high.map_or(bar.high, |h| h.max(bar.high)));
        self.low = Some(self.low.map_or(bar.low, |l| l.min(bar.low)));
        self.cumulative_volume += bar.volume;
        // Typical price proxies the bar's traded price for VWAP purposes.
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        self.vwap_pv += typical * bar.volume;
        self.vwap_volume += bar.volume;
    }

    pub fn update_from_tick(&mut self, tick: &Tick) {
        self.trade_count += 1;
        self.vwap_pv += tick.price * tick.size;
        self.vwap_volume += tick.size;
    }

    pub fn vwap(&self) -> Option<f64> {
        (self.vwap_volume > 0.0).then(|| self.vwap_pv / self.vwap_volume)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// =============================================================================
// INDICATOR STATE
// =============================================================================

/// Where a registration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionSource {
    Config,
    Adhoc,
}

/// One registered indicator on one symbol. The engine tracks registration,
/// warmup, and validity; the value itself is written by the downstream
/// processor through the store.
#[derive(Debug, Clone)]
pub struct IndicatorState {
    pub config: IndicatorConfig,
    pub identity: String,
    pub value: Option<f64>,
    pub valid: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub source: ProvisionSource,
    pub warmup_bars: u32,
}

impl IndicatorState {
    pub fn new(config: IndicatorConfig, source: ProvisionSource) -> Self {
        let identity = config.identity();
        let warmup_bars = config.warmup_bars();
        Self {
            config,
            identity,
            value: None,
            valid: false,
            last_updated: None,
            source,
            warmup_bars,
        }
    }
}

/// Read-only indicator view handed to callers outside the symbol lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub identity: String,
    pub name: String,
    pub interval: Interval,
    pub period: u32,
    pub value: Option<f64>,
    pub valid: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub source: ProvisionSource,
    pub warmup_bars: u32,
}

impl From<&IndicatorState> for IndicatorSnapshot {
    fn from(state: &IndicatorState) -> Self {
        Self {
            identity: state.identity.clone(),
            name: state.config.name.clone(),
            interval: state.config.interval,
            period: state.config.period,
            value: state.value,
            valid: state.valid,
            last_updated: state.last_updated,
            source: state.source,
            warmup_bars: state.warmup_bars,
        }
    }
}

// =============================================================================
// SYMBOL SESSION DATA
// =============================================================================

/// All mutable session state for one symbol.
#[derive(Debug)]
pub struct SymbolSessionData {
    /// Current-session bars per interval.
    pub intervals: BTreeMap<Interval, IntervalData>,
    /// Trailing-day history per interval.
    pub historical: BTreeMap<Interval, HistoricalIntervalData>,
    /// Ordered session ticks and quotes.
    pub ticks: Vec<Tick>,
    pub quotes: Vec<Quote>,
    /// Indicators keyed by identity.
    pub indicators: BTreeMap<String, IndicatorState>,
    pub metrics: SessionMetrics,
    /// Intervals that arrived through adhoc provisioning.
    pub adhoc_intervals: BTreeSet<Interval>,
    /// Intervals fed directly by a stream (vs. derived).
    pub streamed_intervals: BTreeSet<Interval>,
    /// Lock reason when the symbol may not be removed.
    pub lock_reason: Option<String>,
    /// Full (config-template) symbol vs adhoc-only.
    pub full: bool,
    /// Per-symbol provisioning failures, for the status document.
    pub provisioning_errors: Vec<String>,
}

impl SymbolSessionData {
    pub fn new(full: bool) -> Self {
        Self {
            intervals: BTreeMap::new(),
            historical: BTreeMap::new(),
            ticks: Vec::new(),
            quotes: Vec::new(),
            indicators: BTreeMap::new(),
            metrics: SessionMetrics::default(),
            adhoc_intervals: BTreeSet::new(),
            streamed_intervals: BTreeSet::new(),
            lock_reason: None,
            full,
            provisioning_errors: Vec::new(),
        }
    }

    /// Finest streamed interval; the one session metrics fold over.
    pub fn base_interval(&self) -> Option<Interval> {
        self.streamed_intervals.iter().next().copied()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_reason.is_some()
    }

    /// Clear current-session state, preserving containers, history, and
    /// indicator registrations.
    pub fn clear_session(&mut self) {
        for data in self.intervals.values_mut() {
            data.drain_all();
        }
        self.ticks.clear();
        self.quotes.clear();
        self.metrics.reset();
        for indicator in self.indicators.values_mut() {
            indicator.value = None;
            indicator.last_updated = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(secs: i64, volume: f64) -> Bar {
        Bar::new(
            Utc.timestamp_opt(secs, 0).unwrap(),
            10.0,
            12.0,
            9.0,
            11.0,
            volume,
        )
    }

    #[test]
    fn test_metrics_fold_bars() {
        let mut metrics = SessionMetrics::default();
        metrics.update_from_bar(&bar(60, 100.0));
        metrics.update_from_bar(&bar(120, 50.0));

        assert_eq!(metrics.open, Some(10.0));
        assert_eq!(metrics.high, Some(12.0));
        assert_eq!(metrics.low, Some(9.0));
        assert_eq!(metrics.cumulative_volume, 150.0);
        // Typical price is constant across both bars here.
        let typical = (12.0 + 9.0 + 11.0) / 3.0;
        assert!((metrics.vwap().unwrap() - typical).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_tick_trade_count() {
        let mut metrics = SessionMetrics::default();
        metrics.update_from_tick(&Tick {
            timestamp: Utc.timestamp_opt(60, 0).unwrap(),
            price: 10.0,
            size: 100.0,
        });
        assert_eq!(metrics.trade_count, 1);
        assert_eq!(metrics.vwap(), Some(10.0));
    }

    #[test]
    fn test_base_interval_is_finest_streamed() {
        let mut sym = SymbolSessionData::new(true);
        sym.streamed_intervals.insert(Interval::minutes(5));
        sym.streamed_intervals.insert(Interval::minutes(1));
        assert_eq!(sym.base_interval(), Some(Interval::minutes(1)));
    }

    #[test]
    fn test_clear_session_preserves_registrations() {
        let mut sym = SymbolSessionData::new(true);
        let iv = Interval::minutes(1);
        sym.intervals.insert(iv, IntervalData::streamed(iv, 10));
        sym.intervals
            .get_mut(&iv)
            .unwrap()
            .append(std::sync::Arc::new(bar(60, 1.0)))
            .unwrap();
        sym.metrics.update_from_bar(&bar(60, 1.0));
        let mut ind = IndicatorState::new(
            IndicatorConfig::new("sma", 3, iv),
            ProvisionSource::Config,
        );
        ind.value = Some(1.0);
        ind.valid = true;
        sym.indicators.insert(ind.identity.clone(), ind);

        sym.clear_session();

        assert_eq!(sym.intervals[&iv].len(), 0);
        assert_eq!(sym.metrics, SessionMetrics::default());
        let ind = sym.indicators.values().next().unwrap();
        assert_eq!(ind.value, None);
        // Validity reflects warmup over surviving history, not session bars.
        assert!(ind.valid);
    }
}
