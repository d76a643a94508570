//! Status document.
//!
//! JSON-serializable snapshot of the whole engine: mode and state, the
//! resolved session config exactly as received, per-symbol data snapshots,
//! and performance counters. Field naming and nesting are a stable contract:
//! fields may be added but never removed or renamed.

use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::models::Bar;
use crate::quality::QualityStatsSnapshot;
use crate::scanner::ScannerSnapshot;
use crate::session_data::{
    GapInfo, IndicatorSnapshot, SessionData, SessionMetrics, StoreStatsSnapshot,
};
use crate::stream_coordinator::MergeStats;
use crate::subscription::SubscriptionMode;
use crate::time_manager::CacheStatsSnapshot;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Latest bar plus coverage for one (symbol, interval).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalStatus {
    pub interval: String,
    pub derived: bool,
    pub session_bars: usize,
    pub latest_bar: Option<Bar>,
    pub bar_quality: Option<f64>,
    pub gaps: Vec<GapInfo>,
    pub historical_days: usize,
    pub historical_bars: usize,
}

/// One symbol's snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub full: bool,
    pub locked: Option<String>,
    pub intervals: Vec<IntervalStatus>,
    pub session_metrics: SessionMetrics,
    pub vwap: Option<f64>,
    pub indicators: Vec<IndicatorSnapshot>,
    pub provisioning_errors: Vec<String>,
}

/// Per-subscription delivery counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub name: String,
    pub mode: SubscriptionMode,
    pub signals: u64,
    pub overruns: u64,
}

/// Streaming-loop counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoopStatsSnapshot {
    pub iterations: u64,
    pub items_processed: u64,
    pub items_filtered: u64,
    pub out_of_order_skipped: u64,
    pub days_completed: u64,
    pub provision_requests_handled: u64,
}

/// Performance counter block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub subscriptions: Vec<SubscriptionStatus>,
    pub calendar_cache: CacheStatsSnapshot,
    pub store: StoreStatsSnapshot,
    pub merge: MergeStats,
    pub quality: QualityStatsSnapshot,
    pub streaming_loop: LoopStatsSnapshot,
}

/// The complete observable document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDocument {
    pub generated_at: DateTime<Utc>,
    pub mode: String,
    pub state: String,
    pub session_date: NaiveDate,
    /// The resolved configuration, echoed exactly as received.
    pub config: SessionConfig,
    pub symbols: BTreeMap<String, SymbolStatus>,
    pub scanners: Vec<ScannerSnapshot>,
    pub counters: PerformanceCounters,
    pub last_error: Option<EngineError>,
}

impl StatusDocument {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Collect per-symbol snapshots from the store.
pub fn collect_symbols(session: &SessionData) -> BTreeMap<String, SymbolStatus> {
    let mut out = BTreeMap::new();
    for symbol in session.get_active_symbols() {
        let metrics = session.get_session_metrics(&symbol).unwrap_or_default();
        let vwap = metrics.vwap();
        let mut intervals = Vec::new();
        for (interval, derived) in session.held_intervals(&symbol) {
            let (quality, gaps) = session
                .get_quality(&symbol, interval)
                .map(|(q, g)| (Some(q), g))
                .unwrap_or((None, Vec::new()));
            let (historical_days, historical_bars) = session
                .historical_coverage(&symbol, interval)
                .unwrap_or((0, 0));
            intervals.push(IntervalStatus {
                interval: interval.to_string(),
                derived,
                session_bars: session.session_bar_count(&symbol, interval),
                latest_bar: session
                    .get_latest_bar(&symbol, interval)
                    .map(|bar| (*bar).clone()),
                bar_quality: quality,
                gaps,
                historical_days,
                historical_bars,
            });
        }
        out.insert(
            symbol.clone(),
            SymbolStatus {
                symbol: symbol.clone(),
                full: session.is_symbol_full(&symbol),
                locked: session.symbol_lock_reason(&symbol),
                intervals,
                session_metrics: metrics,
                vwap,
                indicators: session.get_indicators(&symbol),
                provisioning_errors: session.provisioning_errors(&symbol),
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndicatorConfig, SessionMode};
    use crate::models::Interval;
    use crate::session_data::ProvisionSource;
    use chrono::TimeZone;

    #[test]
    fn test_collect_symbols_shape() {
        let session = SessionData::new(
            SessionMode::Backtest,
            NaiveDate::from_ymd_opt(2025, 7, 2).unwrap(),
            100,
        );
        session.create_symbol("AAPL", true);
        session
            .ensure_base_interval("AAPL", Interval::minutes(1), false)
            .unwrap();
        session
            .register_indicator(
                "AAPL",
                IndicatorConfig::new("sma", 20, Interval::minutes(1)),
                ProvisionSource::Config,
            )
            .unwrap();
        session
            .append_bar(
                "AAPL",
                Interval::minutes(1),
                Bar::new(Utc.timestamp_opt(60, 0).unwrap(), 1.0, 1.0, 1.0, 1.0, 10.0),
            )
            .unwrap();

        let symbols = collect_symbols(&session);
        let status = symbols.get("AAPL").unwrap();
        assert!(status.full);
        assert_eq!(status.intervals.len(), 1);
        assert_eq!(status.intervals[0].interval, "1m");
        assert_eq!(status.intervals[0].session_bars, 1);
        assert!(status.intervals[0].latest_bar.is_some());
        assert_eq!(status.indicators.len(), 1);
        assert_eq!(status.session_metrics.cumulative_volume, 10.0);
    }

    #[test]
    fn test_document_serializes_with_stable_names() {
        let session = SessionData::new(
            SessionMode::Backtest,
            NaiveDate::from_ymd_opt(2025, 7, 2).unwrap(),
            100,
        );
        let config_json = serde_json::json!({
            "mode": "backtest",
            "backtest": {"start_date": "2025-07-02", "end_date": "2025-07-02"},
            "session_data": {
                "symbols": ["AAPL"],
                "streams": [{"kind": "bar", "interval": "1m"}]
            }
        });
        let config: SessionConfig = serde_json::from_value(config_json).unwrap();
        let doc = StatusDocument {
            generated_at: Utc.timestamp_opt(0, 0).unwrap(),
            mode: "backtest".to_string(),
            state: "Stopped".to_string(),
            session_date: NaiveDate::from_ymd_opt(2025, 7, 2).unwrap(),
            config,
            symbols: collect_symbols(&session),
            scanners: Vec::new(),
            counters: PerformanceCounters {
                subscriptions: Vec::new(),
                calendar_cache: CacheStatsSnapshot {
                    one_slot_hits: 0,
                    lru_hits: 0,
                    misses: 0,
                    evictions: 0,
                    invalidations: 0,
                },
                store: StoreStatsSnapshot::default(),
                merge: MergeStats::default(),
                quality: QualityStatsSnapshot::default(),
                streaming_loop: LoopStatsSnapshot::default(),
            },
            last_error: None,
        };

        let json: serde_json::Value =
            serde_json::from_str(&doc.to_json().unwrap()).unwrap();
        // Contract: these field names are fixed.
        for field in [
            "generated_at",
            "mode",
            "state",
            "session_date",
            "config",
            "symbols",
            "scanners",
            "counters",
            "last_error",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert!(json["counters"].get("subscriptions").is_some());
        assert!(json["counters"].get("calendar_cache").is_some());
        assert!(json["counters"].get("streaming_loop").is_some());
        // The config echo preserves the indicator block as received.
        assert_eq!(json["config"]["mode"], "backtest");
    }
}
