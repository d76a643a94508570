//! Parsed session configuration.
//!
//! The engine consumes an already-parsed configuration record; JSON loading
//! lives at the binary boundary. `validate()` returns the full error list so
//! callers can surface every problem at once rather than the first hit.
//!
//! Operational knobs that do not change session semantics (queue sizes, poll
//! cadences, shutdown window) live in `EngineTuning`, defaulted and
//! overridable from the environment.

use crate::models::{Interval, StreamKind, Symbol};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

// =============================================================================
// MODE
// =============================================================================

/// Session execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Live,
    Backtest,
}

impl SessionMode {
    pub fn is_backtest(&self) -> bool {
        matches!(self, Self::Backtest)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Backtest => write!(f, "backtest"),
        }
    }
}

// =============================================================================
// SESSION CONFIG
// =============================================================================

/// Top-level session configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mode: SessionMode,
    #[serde(default)]
    pub backtest: Option<BacktestConfig>,
    pub session_data: SessionDataConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default = "default_exchange_group")]
    pub exchange_group: String,
    #[serde(default = "default_asset_class")]
    pub asset_class: String,
}

fn default_exchange_group() -> String {
    "us_equities".to_string()
}

fn default_asset_class() -> String {
    "equity".to_string()
}

/// Backtest-only parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// 0 = data-driven (no pacing, full backpressure); > 0 = clock-driven at
    /// that multiple of real time.
    #[serde(default)]
    pub speed_multiplier: f64,
    /// Days of raw data the prefetch worker stages ahead of the cursor.
    #[serde(default = "default_prefetch_days")]
    pub prefetch_days: u32,
    /// Optional intra-day start time for mid-session starts; defaults to the
    /// session open.
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
}

fn default_prefetch_days() -> u32 {
    1
}

/// Everything the session-data store is provisioned with at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDataConfig {
    pub symbols: Vec<Symbol>,
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub historical: HistoricalConfig,
    #[serde(default)]
    pub gap_filler: GapFillerConfig,
    #[serde(default)]
    pub scanners: Vec<ScannerConfig>,
}

/// One configured stream template, applied to every configured symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub kind: StreamKind,
    #[serde(default)]
    pub interval: Option<Interval>,
}

/// Historical data and indicator provisioning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalConfig {
    /// Compute the bar-quality metric at provisioning time.
    #[serde(default)]
    pub enable_quality: bool,
    #[serde(default)]
    pub data: Vec<HistoricalDataConfig>,
    /// Indicator registrations keyed by a config label. The engine treats
    /// indicator kinds as opaque; identity is (name, period, interval,
    /// params), not the label.
    #[serde(default)]
    pub indicators: BTreeMap<String, IndicatorConfig>,
}

/// One block of trailing-day history to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalDataConfig {
    pub trailing_days: u32,
    pub intervals: Vec<Interval>,
    #[serde(default)]
    pub apply_to: ApplyTo,
}

/// Which symbols a config block applies to: the literal "all" or an explicit
/// symbol list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ApplyTo {
    #[default]
    All,
    Symbols(Vec<Symbol>),
}

impl ApplyTo {
    pub fn includes(&self, symbol: &str) -> bool {
        match self {
            Self::All => true,
            Self::Symbols(list) => list.iter().any(|s| s == symbol),
        }
    }
}

impl Serialize for ApplyTo {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("all"),
            Self::Symbols(list) => list.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ApplyTo {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Keyword(String),
            Symbols(Vec<Symbol>),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Keyword(word) if word == "all" => Ok(Self::All),
            Repr::Keyword(word) => Err(serde::de::Error::custom(format!(
                "expected \"all\" or a symbol list, got \"{}\"",
                word
            ))),
            Repr::Symbols(list) => Ok(Self::Symbols(list)),
        }
    }
}

/// Opaque indicator registration. The engine orchestrates registration,
/// warmup, and update cadence; the math behind `name` lives downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub name: String,
    pub period: u32,
    pub interval: Interval,
    #[serde(default = "default_warmup_multiplier")]
    pub warmup_multiplier: f64,
    #[serde(default)]
    pub apply_to: ApplyTo,
    /// Pass-through parameters for the downstream indicator registry.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

fn default_warmup_multiplier() -> f64 {
    2.0
}

impl IndicatorConfig {
    pub fn new(name: impl Into<String>, period: u32, interval: Interval) -> Self {
        Self {
            name: name.into(),
            period,
            interval,
            warmup_multiplier: default_warmup_multiplier(),
            apply_to: ApplyTo::All,
            params: BTreeMap::new(),
        }
    }

    /// Stable identity: name + period + interval + params.
    pub fn identity(&self) -> String {
        if self.params.is_empty() {
            format!("{}:{}:{}", self.name, self.period, self.interval)
        } else {
            let params = serde_json::to_string(&self.params).unwrap_or_default();
            format!("{}:{}:{}:{}", self.name, self.period, self.interval, params)
        }
    }

    /// Bars required before the indicator value is considered valid.
    pub fn warmup_bars(&self) -> u32 {
        (self.period as f64 * self.warmup_multiplier).ceil() as u32
    }
}

/// Gap-filler behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapFillerConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: f64,
    #[serde(default)]
    pub enable_session_quality: bool,
    /// Backtest data is canonical; filling is skipped unless explicitly
    /// forced here.
    #[serde(default)]
    pub force_backtest_fill: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> f64 {
    5.0
}

impl Default for GapFillerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_seconds: default_retry_interval(),
            enable_session_quality: false,
            force_backtest_fill: false,
        }
    }
}

/// One scanner declaration. `module` selects a registered scanner; criteria
/// live in the scanner implementation, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub module: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pre_session: bool,
    #[serde(default)]
    pub regular_session: Vec<ScanWindowConfig>,
    /// Scanner-private config subtree, passed through untouched.
    #[serde(default)]
    pub config: Value,
}

fn default_true() -> bool {
    true
}

/// One scheduled scan window within the regular session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanWindowConfig {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    /// Re-scan cadence within the window.
    pub interval: Interval,
}

/// "HH:MM" wall-time serde helpers for scan windows.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Risk caps. Validated and echoed in the status document; enforcement is a
/// downstream concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub max_buying_power: f64,
    pub max_per_trade: f64,
    pub max_per_symbol: f64,
    pub max_open_positions: u32,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            max_buying_power: 100_000.0,
            max_per_trade: 10_000.0,
            max_per_symbol: 25_000.0,
            max_open_positions: 10,
        }
    }
}

impl SessionConfig {
    /// Validate the whole record, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.mode.is_backtest() {
            match &self.backtest {
                None => errors.push("backtest mode requires a backtest block".to_string()),
                Some(bt) => {
                    if bt.end_date < bt.start_date {
                        errors.push(format!(
                            "backtest end_date {} precedes start_date {}",
                            bt.end_date, bt.start_date
                        ));
                    }
                    if bt.speed_multiplier < 0.0 {
                        errors.push(format!(
                            "speed_multiplier must be >= 0, got {}",
                            bt.speed_multiplier
                        ));
                    }
                }
            }
        }

        if self.session_data.symbols.is_empty() {
            errors.push("session_data.symbols must be non-empty".to_string());
        }
        if self.session_data.streams.is_empty() {
            errors.push("session_data.streams must declare at least one stream".to_string());
        }
        for stream in &self.session_data.streams {
            if stream.kind == StreamKind::Bar && stream.interval.is_none() {
                errors.push("bar streams require an interval".to_string());
            }
        }

        for (label, ind) in &self.session_data.historical.indicators {
            if ind.period == 0 {
                errors.push(format!("indicator '{}' has period 0", label));
            }
            if ind.warmup_multiplier <= 0.0 {
                errors.push(format!(
                    "indicator '{}' has non-positive warmup_multiplier",
                    label
                ));
            }
        }

        for window in self
            .session_data
            .scanners
            .iter()
            .flat_map(|s| &s.regular_session)
        {
            if window.end <= window.start {
                errors.push(format!(
                    "scan window end {} not after start {}",
                    window.end.format("%H:%M"),
                    window.start.format("%H:%M")
                ));
            }
        }

        let t = &self.trading;
        if t.max_per_trade > t.max_buying_power {
            errors.push("max_per_trade exceeds max_buying_power".to_string());
        }
        if t.max_per_symbol > t.max_buying_power {
            errors.push("max_per_symbol exceeds max_buying_power".to_string());
        }
        if t.max_open_positions == 0 {
            errors.push("max_open_positions must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Configured bar-stream intervals, smallest first.
    pub fn bar_intervals(&self) -> Vec<Interval> {
        let mut out: Vec<Interval> = self
            .session_data
            .streams
            .iter()
            .filter(|s| s.kind == StreamKind::Bar)
            .filter_map(|s| s.interval)
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

// =============================================================================
// ENGINE TUNING
// =============================================================================

/// Operational knobs with environment overrides (`MARKET_SESSION_*`).
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// Per-stream queue capacity; full queues backpressure the prefetcher.
    pub stream_queue_capacity: usize,
    /// Ring-buffer capacity per (symbol, interval).
    pub interval_ring_capacity: usize,
    /// Idle sleep in live mode when no item is ready.
    pub idle_poll: Duration,
    /// Bounded wait for a lagging stream head before the merge reports
    /// pending.
    pub head_poll: Duration,
    /// Synchronous wait for the first prefetch of a session day.
    pub prefetch_wait: Duration,
    /// Shutdown window before remaining waiters are woken with Cancelled.
    pub shutdown_window: Duration,
    /// Items older than now minus this threshold are discarded during
    /// catch-up. None disables the filter.
    pub stale_threshold: Option<Duration>,
    /// Quality-manager wake interval (scaled by backtest speed).
    pub quality_wake: Duration,
    /// Ack timeout for live-mode downstream subscriptions.
    pub live_ack_timeout: Duration,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            stream_queue_capacity: 2048,
            interval_ring_capacity: 5000,
            idle_poll: Duration::from_millis(10),
            head_poll: Duration::from_millis(50),
            prefetch_wait: Duration::from_secs(30),
            shutdown_window: Duration::from_secs(5),
            stale_threshold: None,
            quality_wake: Duration::from_secs(1),
            live_ack_timeout: Duration::from_millis(250),
        }
    }
}

impl EngineTuning {
    /// Load defaults with environment overrides.
    pub fn from_env() -> Self {
        let mut tuning = Self::default();

        if let Ok(v) = std::env::var("MARKET_SESSION_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse() {
                tuning.stream_queue_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("MARKET_SESSION_RING_CAPACITY") {
            if let Ok(n) = v.parse() {
                tuning.interval_ring_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("MARKET_SESSION_PREFETCH_WAIT_SECS") {
            if let Ok(n) = v.parse() {
                tuning.prefetch_wait = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("MARKET_SESSION_SHUTDOWN_WINDOW_SECS") {
            if let Ok(n) = v.parse() {
                tuning.shutdown_window = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("MARKET_SESSION_STALE_THRESHOLD_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                tuning.stale_threshold = (n > 0).then(|| Duration::from_secs(n));
            }
        }

        tuning
    }
}
