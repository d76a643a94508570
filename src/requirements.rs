//! Requirement analysis: logical asks to physical provisioning steps.
//!
//! One pure function serves the config boot path, mid-session upgrades, and
//! every adhoc entry point (downstream engines, scanners). Callers pass the
//! asks, a snapshot of current store state for dedup/upgrade detection, and
//! the session config for full-symbol templates; they get back an ordered
//! plan plus the complete validation verdict. Nothing here touches the store.

use crate::config::{IndicatorConfig, SessionConfig};
use crate::models::{Interval, StreamKind, Symbol, TRADING_SECS_PER_DAY};
use crate::session_data::ProvisionSource;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// ASKS
// =============================================================================

/// What is being asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum AskKind {
    /// Full symbol per the config template (boot, scanner promotion,
    /// adhoc-to-full upgrade).
    Symbol,
    /// One bar interval, optionally with trailing history.
    BarInterval {
        interval: Interval,
        historical_days: Option<u32>,
    },
    /// One indicator registration.
    Indicator(IndicatorConfig),
}

/// One logical ask against one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalAsk {
    pub symbol: Symbol,
    pub kind: AskKind,
}

impl LogicalAsk {
    pub fn symbol(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: AskKind::Symbol,
        }
    }

    pub fn bar_interval(symbol: impl Into<Symbol>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            kind: AskKind::BarInterval {
                interval,
                historical_days: None,
            },
        }
    }

    pub fn historical(symbol: impl Into<Symbol>, interval: Interval, days: u32) -> Self {
        Self {
            symbol: symbol.into(),
            kind: AskKind::BarInterval {
                interval,
                historical_days: Some(days),
            },
        }
    }

    pub fn indicator(symbol: impl Into<Symbol>, config: IndicatorConfig) -> Self {
        Self {
            symbol: symbol.into(),
            kind: AskKind::Indicator(config),
        }
    }
}

/// Adhoc provisioning request queued from the store to the coordinator.
/// Same shape as a logical ask; the coordinator drains these between
/// streaming iterations and runs them through the analyzer.
pub type ProvisionRequest = LogicalAsk;

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Current state of one symbol, as the analyzer needs to see it.
#[derive(Debug, Clone, Default)]
pub struct SymbolSnapshot {
    pub full: bool,
    /// Intervals with an IntervalData container.
    pub held: BTreeSet<Interval>,
    /// Intervals fed directly by a stream.
    pub streamed: BTreeSet<Interval>,
    /// Registered indicator identities.
    pub indicators: BTreeSet<String>,
    pub has_tick_stream: bool,
    pub has_quote_stream: bool,
}

/// Store snapshot for dedup and upgrade detection.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub symbols: BTreeMap<Symbol, SymbolSnapshot>,
}

// =============================================================================
// PLAN
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolOp {
    Create { full: bool },
    UpgradeFromAdhoc,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalOp {
    AddBase,
    AddDerived { from: Interval },
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalPlan {
    pub symbol: Symbol,
    pub interval: Interval,
    pub op: IntervalOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalPlan {
    pub symbol: Symbol,
    pub interval: Interval,
    pub days: u32,
}

/// Attach a prefetch-fed stream queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePlan {
    pub symbol: Symbol,
    pub kind: StreamKind,
    pub interval: Option<Interval>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorPlan {
    pub symbol: Symbol,
    pub config: IndicatorConfig,
    pub identity: String,
    pub warmup_bars: u32,
    pub source: ProvisionSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityPlan {
    pub symbol: Symbol,
    pub compute: bool,
}

/// Output of the analyzer: the full provisioning plan plus validation.
#[derive(Debug, Clone, Default)]
pub struct ProvisioningRequirements {
    pub can_proceed: bool,
    pub validation_errors: Vec<String>,
    pub validation_warnings: Vec<String>,
    pub symbol_ops: BTreeMap<Symbol, SymbolOp>,
    pub interval_ops: Vec<IntervalPlan>,
    pub historical_ops: Vec<HistoricalPlan>,
    pub session_queue_ops: Vec<QueuePlan>,
    pub indicator_ops: Vec<IndicatorPlan>,
    pub quality_ops: Vec<QualityPlan>,
}

impl ProvisioningRequirements {
    fn error(&mut self, msg: String) {
        self.validation_errors.push(msg);
    }

    fn warn(&mut self, msg: String) {
        self.validation_warnings.push(msg);
    }
}

// =============================================================================
// ANALYZER
// =============================================================================

/// Trading days of history required to cover `bars` bars of `interval`.
pub fn bars_to_trading_days(bars: u32, interval: Interval) -> u32 {
    let secs = bars as i64 * interval.total_seconds();
    let days = (secs + TRADING_SECS_PER_DAY - 1) / TRADING_SECS_PER_DAY;
    (days.max(1)) as u32
}

/// Working copy of one symbol's state as the plan accumulates, so dedup
/// works within a single batch of asks.
#[derive(Debug, Clone, Default)]
struct WorkingSymbol {
    known: bool,
    full: bool,
    held: BTreeSet<Interval>,
    streamed: BTreeSet<Interval>,
    indicators: BTreeSet<String>,
    has_tick_stream: bool,
    has_quote_stream: bool,
}

impl WorkingSymbol {
    fn from_snapshot(snap: &SymbolSnapshot) -> Self {
        Self {
            known: true,
            full: snap.full,
            held: snap.held.clone(),
            streamed: snap.streamed.clone(),
            indicators: snap.indicators.clone(),
            has_tick_stream: snap.has_tick_stream,
            has_quote_stream: snap.has_quote_stream,
        }
    }

    /// Coarsest streamed interval that can feed `target`.
    fn feeder_for(&self, target: Interval) -> Option<Interval> {
        self.streamed
            .iter()
            .filter(|base| target.is_derivable_from(base))
            .max_by_key(|base| base.total_seconds())
            .copied()
    }
}

/// Translate logical asks into a deterministic provisioning plan.
///
/// `source` tags indicator registrations: `Config` on the boot path, `Adhoc`
/// everywhere else.
pub fn analyze(
    asks: &[LogicalAsk],
    snapshot: &SessionSnapshot,
    config: &SessionConfig,
    source: ProvisionSource,
) -> ProvisioningRequirements {
    let mut reqs = ProvisioningRequirements::default();
    let mut working: BTreeMap<Symbol, WorkingSymbol> = snapshot
        .symbols
        .iter()
        .map(|(sym, snap)| (sym.clone(), WorkingSymbol::from_snapshot(snap)))
        .collect();
    // Historical days resolve to the max over requesters per (symbol, interval).
    let mut historical_days: BTreeMap<(Symbol, Interval), u32> = BTreeMap::new();

    for ask in asks {
        let symbol = ask.symbol.to_uppercase();
        match &ask.kind {
            AskKind::Symbol => {
                plan_full_symbol(
                    &symbol,
                    &mut working,
                    config,
                    source,
                    &mut reqs,
                    &mut historical_days,
                );
            }
            AskKind::BarInterval {
                interval,
                historical_days: days,
            } => {
                ensure_symbol(&symbol, &mut working, &mut reqs, false);
                let sym = working.get_mut(&symbol).expect("ensured above");
                if sym.held.contains(interval) {
                    reqs.warn(format!("{}: interval {} already provisioned", symbol, interval));
                } else {
                    plan_interval(&symbol, *interval, sym, &mut reqs);
                }
                if let Some(days) = days {
                    let entry = historical_days.entry((symbol.clone(), *interval)).or_default();
                    *entry = (*entry).max(*days);
                }
            }
            AskKind::Indicator(ind_config) => {
                ensure_symbol(&symbol, &mut working, &mut reqs, false);
                plan_indicator(
                    &symbol,
                    ind_config,
                    source,
                    &mut working,
                    &mut reqs,
                    &mut historical_days,
                );
            }
        }
    }

    for ((symbol, interval), days) in historical_days {
        reqs.historical_ops.push(HistoricalPlan {
            symbol,
            interval,
            days,
        });
    }

    reqs.can_proceed = reqs.validation_errors.is_empty();
    reqs
}

/// Record the symbol op for a not-necessarily-full symbol reference.
fn ensure_symbol(
    symbol: &Symbol,
    working: &mut BTreeMap<Symbol, WorkingSymbol>,
    reqs: &mut ProvisioningRequirements,
    full: bool,
) {
    if !working.contains_key(symbol) {
        working.insert(
            symbol.clone(),
            WorkingSymbol {
                known: true,
                full,
                ..WorkingSymbol::default()
            },
        );
        reqs.symbol_ops
            .insert(symbol.clone(), SymbolOp::Create { full });
    } else if !reqs.symbol_ops.contains_key(symbol) {
        reqs.symbol_ops.insert(symbol.clone(), SymbolOp::Noop);
    }
}

/// Walk the full config template for one symbol: streams, historical blocks,
/// indicators, quality. The walk is unconditional so the same path handles
/// cold boot and mid-session upgrade; per-item dedup makes it idempotent.
fn plan_full_symbol(
    symbol: &Symbol,
    working: &mut BTreeMap<Symbol, WorkingSymbol>,
    config: &SessionConfig,
    source: ProvisionSource,
    reqs: &mut ProvisioningRequirements,
    historical_days: &mut BTreeMap<(Symbol, Interval), u32>,
) {
    let op = match working.get(symbol) {
        None => SymbolOp::Create { full: true },
        Some(sym) if sym.full => SymbolOp::Noop,
        Some(_) => SymbolOp::UpgradeFromAdhoc,
    };
    working
        .entry(symbol.clone())
        .or_default()
        .known = true;
    reqs.symbol_ops.insert(symbol.clone(), op);
    if op == SymbolOp::Noop {
        return;
    }
    working.get_mut(symbol).expect("inserted above").full = true;

    // Streams.
    for stream in &config.session_data.streams {
        let sym = working.get_mut(symbol).expect("present");
        match stream.kind {
            StreamKind::Bar => {
                let interval = match stream.interval {
                    Some(iv) => iv,
                    None => continue, // rejected by config validation
                };
                if !sym.held.contains(&interval) {
                    plan_interval(symbol, interval, sym, reqs);
                }
            }
            StreamKind::Tick => {
                if !sym.has_tick_stream {
                    sym.has_tick_stream = true;
                    reqs.session_queue_ops.push(QueuePlan {
                        symbol: symbol.clone(),
                        kind: StreamKind::Tick,
                        interval: None,
                    });
                }
            }
            StreamKind::Quote => {
                if !sym.has_quote_stream {
                    sym.has_quote_stream = true;
                    reqs.session_queue_ops.push(QueuePlan {
                        symbol: symbol.clone(),
                        kind: StreamKind::Quote,
                        interval: None,
                    });
                }
            }
        }
    }

    // Historical blocks.
    for block in &config.session_data.historical.data {
        if !block.apply_to.includes(symbol) {
            continue;
        }
        for interval in &block.intervals {
            let sym = working.get_mut(symbol).expect("present");
            if !sym.held.contains(interval) {
                plan_interval(symbol, *interval, sym, reqs);
            }
            let entry = historical_days.entry((symbol.clone(), *interval)).or_default();
            *entry = (*entry).max(block.trailing_days);
        }
    }

    // Indicators.
    for ind_config in config.session_data.historical.indicators.values() {
        if !ind_config.apply_to.includes(symbol) {
            continue;
        }
        plan_indicator(symbol, ind_config, source, working, reqs, historical_days);
    }

    reqs.quality_ops.push(QualityPlan {
        symbol: symbol.clone(),
        compute: config.session_data.historical.enable_quality,
    });
}

/// Provision one interval: derived from the coarsest streamed feeder when
/// possible, otherwise as a new base stream with its own queue.
fn plan_interval(
    symbol: &Symbol,
    interval: Interval,
    sym: &mut WorkingSymbol,
    reqs: &mut ProvisioningRequirements,
) {
    match sym.feeder_for(interval) {
        Some(from) => {
            sym.held.insert(interval);
            reqs.interval_ops.push(IntervalPlan {
                symbol: symbol.clone(),
                interval,
                op: IntervalOp::AddDerived { from },
            });
        }
        None => {
            sym.held.insert(interval);
            sym.streamed.insert(interval);
            reqs.interval_ops.push(IntervalPlan {
                symbol: symbol.clone(),
                interval,
                op: IntervalOp::AddBase,
            });
            reqs.session_queue_ops.push(QueuePlan {
                symbol: symbol.clone(),
                kind: StreamKind::Bar,
                interval: Some(interval),
            });
        }
    }
}

/// Register one indicator: identity dedup, target-interval resolution, and
/// warmup-driven history.
fn plan_indicator(
    symbol: &Symbol,
    config: &IndicatorConfig,
    source: ProvisionSource,
    working: &mut BTreeMap<Symbol, WorkingSymbol>,
    reqs: &mut ProvisioningRequirements,
    historical_days: &mut BTreeMap<(Symbol, Interval), u32>,
) {
    let identity = config.identity();
    let sym = working.get_mut(symbol).expect("caller ensured symbol");
    if sym.indicators.contains(&identity) {
        reqs.warn(format!(
            "{}: indicator {} already registered",
            symbol, identity
        ));
        return;
    }

    let target = config.interval;
    if !sym.held.contains(&target) {
        match sym.feeder_for(target) {
            Some(from) => {
                sym.held.insert(target);
                reqs.interval_ops.push(IntervalPlan {
                    symbol: symbol.clone(),
                    interval: target,
                    op: IntervalOp::AddDerived { from },
                });
            }
            None => {
                reqs.error(format!(
                    "{}: no derivation path to {} for indicator {} (streamed: {})",
                    symbol,
                    target,
                    identity,
                    sym.streamed
                        .iter()
                        .map(|iv| iv.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
                return;
            }
        }
    }

    let warmup_bars = config.warmup_bars();
    let days = bars_to_trading_days(warmup_bars, target);
    let entry = historical_days.entry((symbol.clone(), target)).or_default();
    *entry = (*entry).max(days);

    sym.indicators.insert(identity.clone());
    reqs.indicator_ops.push(IndicatorPlan {
        symbol: symbol.clone(),
        config: config.clone(),
        identity,
        warmup_bars,
        source,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BacktestConfig, GapFillerConfig, HistoricalConfig, HistoricalDataConfig, SessionDataConfig,
        SessionMode, StreamConfig, TradingConfig,
    };
    use chrono::NaiveDate;

    fn config_with(
        streams: Vec<StreamConfig>,
        historical: HistoricalConfig,
    ) -> SessionConfig {
        SessionConfig {
            mode: SessionMode::Backtest,
            backtest: Some(BacktestConfig {
                start_date: NaiveDate::from_ymd_opt(2025, 7, 2).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2025, 7, 2).unwrap(),
                speed_multiplier: 0.0,
                prefetch_days: 1,
                start_time: None,
            }),
            session_data: SessionDataConfig {
                symbols: vec!["AAPL".to_string()],
                streams,
                historical,
                gap_filler: GapFillerConfig::default(),
                scanners: Vec::new(),
            },
            trading: TradingConfig::default(),
            exchange_group: "us_equities".to_string(),
            asset_class: "equity".to_string(),
        }
    }

    fn one_minute_config() -> SessionConfig {
        let mut historical = HistoricalConfig {
            enable_quality: true,
            data: vec![HistoricalDataConfig {
                trailing_days: 3,
                intervals: vec![Interval::minutes(1)],
                apply_to: Default::default(),
            }],
            indicators: Default::default(),
        };
        historical.indicators.insert(
            "sma".to_string(),
            IndicatorConfig::new("sma", 20, Interval::minutes(5)),
        );
        config_with(
            vec![StreamConfig {
                kind: StreamKind::Bar,
                interval: Some(Interval::minutes(1)),
            }],
            historical,
        )
    }

    #[test]
    fn test_cold_boot_full_symbol() {
        let config = one_minute_config();
        let asks = vec![LogicalAsk::symbol("AAPL")];
        let reqs = analyze(&asks, &SessionSnapshot::default(), &config, ProvisionSource::Config);

        assert!(reqs.can_proceed);
        assert_eq!(
            reqs.symbol_ops.get("AAPL"),
            Some(&SymbolOp::Create { full: true })
        );
        // 1m base + 5m derived from 1m (for the sma).
        assert_eq!(reqs.interval_ops.len(), 2);
        assert_eq!(reqs.interval_ops[0].op, IntervalOp::AddBase);
        assert_eq!(
            reqs.interval_ops[1].op,
            IntervalOp::AddDerived {
                from: Interval::minutes(1)
            }
        );
        // Only the base interval gets a queue.
        assert_eq!(reqs.session_queue_ops.len(), 1);
        assert_eq!(reqs.session_queue_ops[0].interval, Some(Interval::minutes(1)));
        // 3 trailing days for 1m; warmup days for 5m (40 bars -> 1 day).
        assert_eq!(reqs.historical_ops.len(), 2);
        assert_eq!(reqs.indicator_ops.len(), 1);
        assert_eq!(reqs.indicator_ops[0].warmup_bars, 40);
        assert_eq!(reqs.quality_ops.len(), 1);
        assert!(reqs.quality_ops[0].compute);
    }

    #[test]
    fn test_full_symbol_noop_when_already_full() {
        let config = one_minute_config();
        let mut snapshot = SessionSnapshot::default();
        snapshot.symbols.insert(
            "AAPL".to_string(),
            SymbolSnapshot {
                full: true,
                ..Default::default()
            },
        );
        let reqs = analyze(
            &[LogicalAsk::symbol("AAPL")],
            &snapshot,
            &config,
            ProvisionSource::Config,
        );
        assert_eq!(reqs.symbol_ops.get("AAPL"), Some(&SymbolOp::Noop));
        assert!(reqs.interval_ops.is_empty());
        assert!(reqs.indicator_ops.is_empty());
    }

    #[test]
    fn test_adhoc_upgrade_preserves_existing() {
        let config = one_minute_config();
        let mut snapshot = SessionSnapshot::default();
        let mut snap = SymbolSnapshot::default();
        snap.held.insert(Interval::minutes(1));
        snap.streamed.insert(Interval::minutes(1));
        snap.indicators
            .insert(IndicatorConfig::new("sma", 20, Interval::minutes(5)).identity());
        snapshot.symbols.insert("TSLA".to_string(), snap);

        let reqs = analyze(
            &[LogicalAsk::symbol("TSLA")],
            &snapshot,
            &config,
            ProvisionSource::Config,
        );
        assert_eq!(
            reqs.symbol_ops.get("TSLA"),
            Some(&SymbolOp::UpgradeFromAdhoc)
        );
        // 1m already held and streamed: only the 5m derived add remains, and
        // the already-registered indicator identity dedups to a warning.
        assert_eq!(reqs.interval_ops.len(), 1);
        assert_eq!(
            reqs.interval_ops[0].op,
            IntervalOp::AddDerived {
                from: Interval::minutes(1)
            }
        );
        assert!(reqs.session_queue_ops.is_empty());
        assert!(reqs.indicator_ops.is_empty());
        assert_eq!(reqs.validation_warnings.len(), 1);
    }

    #[test]
    fn test_duplicate_indicator_noop_with_warning() {
        let config = one_minute_config();
        let ind = IndicatorConfig::new("sma", 20, Interval::minutes(5));
        let mut snapshot = SessionSnapshot::default();
        let mut snap = SymbolSnapshot::default();
        snap.held.insert(Interval::minutes(1));
        snap.held.insert(Interval::minutes(5));
        snap.streamed.insert(Interval::minutes(1));
        snap.indicators.insert(ind.identity());
        snapshot.symbols.insert("AAPL".to_string(), snap);

        let reqs = analyze(
            &[LogicalAsk::indicator("AAPL", ind)],
            &snapshot,
            &config,
            ProvisionSource::Adhoc,
        );
        assert!(reqs.can_proceed);
        assert!(reqs.indicator_ops.is_empty());
        assert_eq!(reqs.validation_warnings.len(), 1);
    }

    #[test]
    fn test_no_derivation_path_is_error() {
        let config = one_minute_config();
        let mut snapshot = SessionSnapshot::default();
        let mut snap = SymbolSnapshot::default();
        snap.held.insert(Interval::minutes(1));
        snap.streamed.insert(Interval::minutes(1));
        snapshot.symbols.insert("AAPL".to_string(), snap);

        // 30s cannot be derived from 1m.
        let ind = IndicatorConfig::new("sma", 10, Interval::seconds(30));
        let reqs = analyze(
            &[LogicalAsk::indicator("AAPL", ind)],
            &snapshot,
            &config,
            ProvisionSource::Adhoc,
        );
        assert!(!reqs.can_proceed);
        assert_eq!(reqs.validation_errors.len(), 1);
        assert!(reqs.validation_errors[0].contains("no derivation path"));
    }

    #[test]
    fn test_coarsest_feeder_chosen() {
        let config = one_minute_config();
        let mut snapshot = SessionSnapshot::default();
        let mut snap = SymbolSnapshot::default();
        for iv in [Interval::minutes(1), Interval::minutes(5)] {
            snap.held.insert(iv);
            snap.streamed.insert(iv);
        }
        snapshot.symbols.insert("AAPL".to_string(), snap);

        let ind = IndicatorConfig::new("sma", 10, Interval::minutes(15));
        let reqs = analyze(
            &[LogicalAsk::indicator("AAPL", ind)],
            &snapshot,
            &config,
            ProvisionSource::Adhoc,
        );
        assert!(reqs.can_proceed);
        assert_eq!(
            reqs.interval_ops[0].op,
            IntervalOp::AddDerived {
                from: Interval::minutes(5)
            }
        );
    }

    #[test]
    fn test_historical_days_max_over_requesters() {
        let config = one_minute_config();
        let asks = vec![
            LogicalAsk::historical("AAPL", Interval::minutes(1), 2),
            LogicalAsk::historical("AAPL", Interval::minutes(1), 7),
            LogicalAsk::historical("AAPL", Interval::minutes(1), 4),
        ];
        let reqs = analyze(&asks, &SessionSnapshot::default(), &config, ProvisionSource::Adhoc);
        assert_eq!(reqs.historical_ops.len(), 1);
        assert_eq!(reqs.historical_ops[0].days, 7);
        // Repeated interval asks after the first warn instead of re-adding.
        assert_eq!(reqs.validation_warnings.len(), 2);
        assert_eq!(reqs.interval_ops.len(), 1);
    }

    #[test]
    fn test_warmup_day_conversion() {
        // 40 five-minute bars = 12000s, under one trading day.
        assert_eq!(bars_to_trading_days(40, Interval::minutes(5)), 1);
        // 390 one-minute bars = exactly one trading day.
        assert_eq!(bars_to_trading_days(390, Interval::minutes(1)), 1);
        assert_eq!(bars_to_trading_days(391, Interval::minutes(1)), 2);
        // Daily bars: one per day.
        assert_eq!(bars_to_trading_days(10, Interval::days(1)), 10 * 86_400 as u32 / TRADING_SECS_PER_DAY as u32 + 1);
    }

    #[test]
    fn test_tick_and_quote_queue_plans() {
        let config = config_with(
            vec![
                StreamConfig {
                    kind: StreamKind::Bar,
                    interval: Some(Interval::minutes(1)),
                },
                StreamConfig {
                    kind: StreamKind::Tick,
                    interval: None,
                },
                StreamConfig {
                    kind: StreamKind::Quote,
                    interval: None,
                },
            ],
            HistoricalConfig::default(),
        );
        let reqs = analyze(
            &[LogicalAsk::symbol("AAPL")],
            &SessionSnapshot::default(),
            &config,
            ProvisionSource::Config,
        );
        assert!(reqs.can_proceed);
        assert_eq!(reqs.session_queue_ops.len(), 3);
        let kinds: Vec<StreamKind> = reqs.session_queue_ops.iter().map(|q| q.kind).collect();
        assert!(kinds.contains(&StreamKind::Tick));
        assert!(kinds.contains(&StreamKind::Quote));
    }
}
