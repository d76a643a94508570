//! End-to-end session scenarios against the synthetic repository.
//!
//! Each test drives a full coordinator lifecycle: provisioning, prefetch,
//! chronological streaming, quality upkeep, and termination, asserting the
//! observable contract through the status document and the store.

use market_session::coordinator::DownstreamLink;
use market_session::scanner::{
    default_registry, ScanResult, Scanner, ScannerContext, ScannerError, ScannerRegistry,
};
use market_session::{
    EngineTuning, IndicatorConfig, Interval, MemoryRepository, SessionCoordinator, SessionHandle,
    SessionState, SubscriptionMode, WaitOutcome,
};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

fn single_day_config() -> market_session::SessionConfig {
    serde_json::from_value(serde_json::json!({
        "mode": "backtest",
        "backtest": {
            "start_date": "2025-07-02",
            "end_date": "2025-07-02",
            "speed_multiplier": 0.0,
            "prefetch_days": 1
        },
        "session_data": {
            "symbols": ["AAPL"],
            "streams": [{"kind": "bar", "interval": "1m"}],
            "historical": {
                "enable_quality": true,
                "indicators": {
                    "sma_20_5m": {"name": "sma", "period": 20, "interval": "5m"}
                }
            },
            "gap_filler": {"enable_session_quality": true}
        }
    }))
    .expect("valid config")
}

/// Downstream processor contract: wait for delivery, read, reset, ack.
fn spawn_processor(
    link: Arc<DownstreamLink>,
    delay: Duration,
    processed: Arc<AtomicU64>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        let outcome = match link.delivery.mode() {
            SubscriptionMode::DataDriven => link.delivery.wait(None),
            _ => link.delivery.wait(Some(Duration::from_millis(500))),
        };
        match outcome {
            Ok(WaitOutcome::Signalled) => {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                processed.fetch_add(1, Ordering::Relaxed);
                link.delivery.reset();
                link.ack.signal();
            }
            Ok(WaitOutcome::TimedOut) => {
                link.delivery.reset();
            }
            Ok(WaitOutcome::Cancelled) | Err(_) => break,
        }
    })
}

fn run_to_completion(handle: &SessionHandle) {
    assert!(
        handle.join(Duration::from_secs(120)),
        "session did not terminate in time"
    );
}

#[test]
fn test_single_day_data_driven_backtest() {
    let handle = SessionCoordinator::start(
        single_day_config(),
        Arc::new(MemoryRepository::new()),
        default_registry(),
        EngineTuning::default(),
    )
    .unwrap();

    let processed = Arc::new(AtomicU64::new(0));
    let link = handle.subscribe("processor", SubscriptionMode::DataDriven);
    let processor = spawn_processor(link, Duration::ZERO, Arc::clone(&processed));

    run_to_completion(&handle);
    processor.join().unwrap();

    assert!(handle.last_error().is_none());
    assert_eq!(handle.state(), SessionState::Stopped);

    let status = handle.status_document();
    let aapl = status.symbols.get("AAPL").expect("AAPL present");

    let one_minute = aapl
        .intervals
        .iter()
        .find(|iv| iv.interval == "1m")
        .unwrap();
    assert_eq!(one_minute.session_bars, 390);
    assert!(!one_minute.derived);
    assert_eq!(one_minute.bar_quality, Some(100.0));
    assert!(one_minute.gaps.is_empty());

    let five_minute = aapl
        .intervals
        .iter()
        .find(|iv| iv.interval == "5m")
        .unwrap();
    assert_eq!(five_minute.session_bars, 78);
    assert!(five_minute.derived);

    // The opaque indicator registration warmed up and became valid.
    let sma = &aapl.indicators[0];
    assert_eq!(sma.name, "sma");
    assert_eq!(sma.warmup_bars, 40);
    assert!(sma.valid);

    // Data-driven run: every delivery acknowledged, zero overruns.
    let sub = &status.counters.subscriptions[0];
    assert_eq!(sub.overruns, 0);
    assert_eq!(sub.signals, 390);
    assert_eq!(processed.load(Ordering::Relaxed), 390);

    assert_eq!(status.counters.streaming_loop.days_completed, 1);
    assert_eq!(status.counters.streaming_loop.out_of_order_skipped, 0);
    assert_eq!(status.counters.merge.bars, 390);
}

#[test]
fn test_mid_day_start_catches_up_then_streams() {
    let mut config = single_day_config();
    config.backtest.as_mut().unwrap().start_time =
        Some(chrono::NaiveTime::from_hms_opt(12, 45, 0).unwrap());

    let handle = SessionCoordinator::start(
        config,
        Arc::new(MemoryRepository::new()),
        default_registry(),
        EngineTuning::default(),
    )
    .unwrap();
    run_to_completion(&handle);
    assert!(handle.last_error().is_none());

    let status = handle.status_document();
    let aapl = status.symbols.get("AAPL").unwrap();
    let one_minute = aapl
        .intervals
        .iter()
        .find(|iv| iv.interval == "1m")
        .unwrap();

    // 195 bars repaired in via the privileged path, 195 streamed.
    assert_eq!(one_minute.session_bars, 390);
    assert_eq!(status.counters.store.missing_inserted, 195);
    assert_eq!(status.counters.merge.bars, 195);
    assert_eq!(one_minute.bar_quality, Some(100.0));
}

#[test]
fn test_multi_day_backtest_skips_holiday() {
    let config: market_session::SessionConfig = serde_json::from_value(serde_json::json!({
        "mode": "backtest",
        "backtest": {
            "start_date": "2025-07-02",
            "end_date": "2025-07-07",
            "speed_multiplier": 0.0,
            "prefetch_days": 1
        },
        "session_data": {
            "symbols": ["AAPL"],
            "streams": [{"kind": "bar", "interval": "1m"}],
            "historical": {
                "enable_quality": true,
                "data": [{"trailing_days": 3, "intervals": ["1m"], "apply_to": "all"}]
            }
        }
    }))
    .unwrap();

    let repo = Arc::new(
        MemoryRepository::new().with_holidays([NaiveDate::from_ymd_opt(2025, 7, 4).unwrap()]),
    );
    let handle =
        SessionCoordinator::start(config, repo, default_registry(), EngineTuning::default())
            .unwrap();
    run_to_completion(&handle);
    assert!(handle.last_error().is_none());

    let status = handle.status_document();
    // July 2 and 3 ran, July 4 (holiday) and the weekend were skipped, and
    // the final session day is July 7.
    assert_eq!(status.counters.streaming_loop.days_completed, 3);
    assert_eq!(
        status.session_date,
        NaiveDate::from_ymd_opt(2025, 7, 7).unwrap()
    );

    let aapl = status.symbols.get("AAPL").unwrap();
    let one_minute = aapl
        .intervals
        .iter()
        .find(|iv| iv.interval == "1m")
        .unwrap();
    // Final day still in the session ring; the roll promoted July 2 and 3
    // into the trailing window (capped at 3 days).
    assert_eq!(one_minute.session_bars, 390);
    assert_eq!(one_minute.historical_days, 3);
    assert_eq!(one_minute.historical_bars, 3 * 390);
    assert_eq!(status.counters.merge.bars, 3 * 390);
}

/// Scanner double whose criteria fire at 09:35: promote TSLA once.
struct MiddayPromoter;

impl Scanner for MiddayPromoter {
    fn name(&self) -> &str {
        "midday_promoter"
    }

    fn setup(&mut self, _ctx: &ScannerContext) -> Result<bool, ScannerError> {
        Ok(true)
    }

    fn scan(&mut self, ctx: &ScannerContext) -> Result<ScanResult, ScannerError> {
        let fire_at = ctx.now.date_naive().and_hms_opt(9, 35, 0).unwrap();
        let mut result = ScanResult::default();
        if ctx.now.naive_utc() >= fire_at && !ctx.session.is_symbol_full("TSLA") {
            result.symbols.push("TSLA".to_string());
        }
        Ok(result)
    }

    fn teardown(&mut self, _ctx: &ScannerContext) {}
}

#[test]
fn test_mid_session_scanner_promotion() {
    let mut config = single_day_config();
    config.session_data.scanners = vec![serde_json::from_value(serde_json::json!({
        "module": "midday_promoter",
        "enabled": true,
        "pre_session": true,
        "regular_session": [
            {"start": "09:35", "end": "15:55", "interval": "5m"}
        ],
        "config": {}
    }))
    .unwrap()];

    let mut registry: ScannerRegistry = HashMap::new();
    registry.insert(
        "midday_promoter".to_string(),
        Box::new(|| Box::new(MiddayPromoter) as Box<dyn Scanner>),
    );

    let handle = SessionCoordinator::start(
        config,
        Arc::new(MemoryRepository::new()),
        registry,
        EngineTuning::default(),
    )
    .unwrap();
    run_to_completion(&handle);
    assert!(handle.last_error().is_none());

    let status = handle.status_document();
    let tsla = status.symbols.get("TSLA").expect("TSLA promoted");
    assert!(tsla.full);

    // The catch-up covered [09:30, promotion) through the repair path and
    // streaming covered the rest; the day is whole.
    let one_minute = tsla
        .intervals
        .iter()
        .find(|iv| iv.interval == "1m")
        .unwrap();
    assert_eq!(one_minute.session_bars, 390);
    assert!(status.counters.store.missing_inserted >= 5);

    // Promotion went through the full config template: indicator included.
    assert_eq!(tsla.indicators.len(), 1);
    assert_eq!(tsla.indicators[0].name, "sma");

    // AAPL is untouched by the promotion.
    let aapl = status.symbols.get("AAPL").unwrap();
    assert_eq!(
        aapl.intervals
            .iter()
            .find(|iv| iv.interval == "1m")
            .unwrap()
            .session_bars,
        390
    );
}

#[test]
fn test_clock_driven_overrun_with_slow_processor() {
    let mut config = single_day_config();
    config.backtest.as_mut().unwrap().speed_multiplier = 360.0;

    let handle = SessionCoordinator::start(
        config,
        Arc::new(MemoryRepository::new()),
        default_registry(),
        EngineTuning::default(),
    )
    .unwrap();

    // Throttled processor: 100ms per item against a ~166ms cadence whose
    // acknowledgment budget is half that.
    let processed = Arc::new(AtomicU64::new(0));
    let link = handle.subscribe("slow", SubscriptionMode::ClockDriven);
    let processor = spawn_processor(link, Duration::from_millis(100), Arc::clone(&processed));

    assert!(handle.wait_for_state(|s| s == SessionState::Streaming, Duration::from_secs(30)));
    std::thread::sleep(Duration::from_secs(3));

    let status = handle.status_document();
    let sub = &status.counters.subscriptions[0];
    assert!(sub.overruns >= 1, "expected at least one overrun");
    // Streaming never stalled on the slow processor.
    assert!(status.counters.streaming_loop.items_processed >= 5);

    handle.stop();
    run_to_completion(&handle);
    processor.join().unwrap();
}

#[test]
fn test_pause_resume_preserves_run() {
    let handle = SessionCoordinator::start(
        single_day_config(),
        Arc::new(MemoryRepository::new()),
        default_registry(),
        EngineTuning::default(),
    )
    .unwrap();

    // A mildly slow processor keeps the session streaming long enough to
    // exercise the gate deterministically.
    let processed = Arc::new(AtomicU64::new(0));
    let link = handle.subscribe("processor", SubscriptionMode::DataDriven);
    let processor = spawn_processor(link, Duration::from_millis(3), Arc::clone(&processed));

    assert!(handle.wait_for_state(|s| s == SessionState::Streaming, Duration::from_secs(30)));
    handle.pause().unwrap();
    assert!(handle.wait_for_state(|s| s == SessionState::Paused, Duration::from_secs(10)));
    assert!(handle.is_paused());

    // No items flow while paused.
    let before = handle.status_document().counters.streaming_loop.items_processed;
    std::thread::sleep(Duration::from_millis(300));
    let during = handle.status_document().counters.streaming_loop.items_processed;
    assert_eq!(before, during);

    handle.resume();
    run_to_completion(&handle);
    processor.join().unwrap();

    // The run completed exactly as an unpaused one would have.
    let status = handle.status_document();
    assert!(handle.last_error().is_none());
    assert_eq!(
        status
            .symbols
            .get("AAPL")
            .unwrap()
            .intervals
            .iter()
            .find(|iv| iv.interval == "1m")
            .unwrap()
            .session_bars,
        390
    );
    assert_eq!(status.counters.subscriptions[0].overruns, 0);
}

#[test]
fn test_adhoc_indicator_idempotent_through_unified_path() {
    let handle = SessionCoordinator::start(
        single_day_config(),
        Arc::new(MemoryRepository::new()),
        default_registry(),
        EngineTuning::default(),
    )
    .unwrap();

    // Queue the same adhoc identity twice; the analyzer dedups the second.
    let rsi = IndicatorConfig::new("rsi", 14, Interval::minutes(5));
    handle.add_indicator_unified("AAPL", rsi.clone()).unwrap();
    handle.add_indicator_unified("AAPL", rsi).unwrap();
    // A coarser adhoc interval derives from the streamed base instead of
    // attaching a second stream; a promoted symbol takes the full template.
    handle
        .add_bar_unified("AAPL", Interval::minutes(15), None)
        .unwrap();
    handle.add_symbol_unified("NVDA").unwrap();

    run_to_completion(&handle);
    assert!(handle.last_error().is_none());

    let status = handle.status_document();
    let aapl = status.symbols.get("AAPL").unwrap();
    // Config sma plus exactly one rsi.
    assert_eq!(aapl.indicators.len(), 2);
    let rsi_count = aapl
        .indicators
        .iter()
        .filter(|ind| ind.name == "rsi")
        .count();
    assert_eq!(rsi_count, 1);

    let fifteen = aapl
        .intervals
        .iter()
        .find(|iv| iv.interval == "15m")
        .expect("15m provisioned");
    assert!(fifteen.derived);
    assert_eq!(fifteen.session_bars, 26);

    let nvda = status.symbols.get("NVDA").expect("NVDA provisioned");
    assert!(nvda.full);
    assert_eq!(
        nvda.intervals
            .iter()
            .find(|iv| iv.interval == "1m")
            .unwrap()
            .session_bars,
        390
    );
}

#[test]
fn test_validation_errors_surface_synchronously() {
    let mut config = single_day_config();
    config.session_data.symbols.clear();

    let err = SessionCoordinator::start(
        config,
        Arc::new(MemoryRepository::new()),
        default_registry(),
        EngineTuning::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind, market_session::ErrorKind::Validation);
    assert!(err.detail.contains("symbols"));
}

#[test]
fn test_missing_calendar_row_is_fatal_at_boot() {
    let mut config = single_day_config();
    config.exchange_group = "lse".to_string();

    let err = SessionCoordinator::start(
        config,
        Arc::new(MemoryRepository::new()),
        default_registry(),
        EngineTuning::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind, market_session::ErrorKind::FatalInit);
}

#[test]
fn test_live_mode_refuses_pause() {
    let config: market_session::SessionConfig = serde_json::from_value(serde_json::json!({
        "mode": "live",
        "session_data": {
            "symbols": ["AAPL"],
            "streams": [{"kind": "bar", "interval": "1m"}]
        }
    }))
    .unwrap();

    let handle = SessionCoordinator::start(
        config,
        Arc::new(MemoryRepository::new()),
        default_registry(),
        EngineTuning::default(),
    )
    .unwrap();

    let err = handle.pause().unwrap_err();
    assert_eq!(err.kind, market_session::ErrorKind::StateViolation);
    assert!(!handle.is_paused());

    handle.stop();
    run_to_completion(&handle);
}

#[test]
fn test_tick_and_quote_streams_merge_chronologically() {
    let config: market_session::SessionConfig = serde_json::from_value(serde_json::json!({
        "mode": "backtest",
        "backtest": {
            "start_date": "2025-07-02",
            "end_date": "2025-07-02",
            "speed_multiplier": 0.0,
            "prefetch_days": 1
        },
        "session_data": {
            "symbols": ["AAPL"],
            "streams": [
                {"kind": "bar", "interval": "1m"},
                {"kind": "tick"},
                {"kind": "quote"}
            ]
        }
    }))
    .unwrap();

    let handle = SessionCoordinator::start(
        config,
        Arc::new(MemoryRepository::new()),
        default_registry(),
        EngineTuning::default(),
    )
    .unwrap();
    run_to_completion(&handle);
    assert!(handle.last_error().is_none());

    let status = handle.status_document();
    // 390 bars, one tick and one quote every 15s across the session. The
    // final 15:59 bar closes the day at 16:00, so the three prints after it
    // inside that minute are cut off with the session.
    assert_eq!(status.counters.merge.bars, 390);
    assert_eq!(status.counters.merge.ticks, 390 * 4 - 3);
    assert_eq!(status.counters.merge.quotes, 390 * 4 - 3);
    // Same-timestamp ties resolved deterministically throughout the day.
    assert!(status.counters.merge.tiebreaks > 0);

    let metrics = &status.symbols.get("AAPL").unwrap().session_metrics;
    assert_eq!(metrics.trade_count, (390 * 4 - 3) as u64);
}
