//! Scanner framework: dynamic symbol discovery.
//!
//! A scanner implements setup/scan/teardown hooks; the manager owns the
//! per-scanner state machine and schedules. Scanner lifetimes are per
//! session day: the coordinator rebuilds the manager at each Initializing
//! pass, so setup runs at most once per instance and teardown exactly once
//! after the last scheduled scan.
//!
//! Discovery criteria are hard-coded in scanner implementations; config only
//! selects which scanner runs and against which universe. Promoted symbols
//! go through the store's unified adhoc path (`SessionData::add_symbol`),
//! which queues provisioning to the coordinator.

use crate::config::{ScanWindowConfig, ScannerConfig, SessionMode};
use crate::models::Symbol;
use crate::session_data::SessionData;
use crate::time_manager::TimeManager;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// SCANNER CONTRACT
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ScannerError {
    Setup(String),
    Scan(String),
}

impl fmt::Display for ScannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(msg) => write!(f, "scanner setup failed: {}", msg),
            Self::Scan(msg) => write!(f, "scan failed: {}", msg),
        }
    }
}

impl std::error::Error for ScannerError {}

/// Everything a scanner hook may consult.
#[derive(Clone)]
pub struct ScannerContext {
    pub session: Arc<SessionData>,
    pub time: Arc<TimeManager>,
    pub mode: SessionMode,
    pub now: DateTime<Utc>,
    /// The scanner's private config subtree, passed through untouched.
    pub config: Value,
}

/// Output of one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    pub symbols: Vec<Symbol>,
    pub metadata: serde_json::Map<String, Value>,
}

/// User-defined discovery hook set.
pub trait Scanner: Send {
    fn name(&self) -> &str;

    /// One-time preparation. Returning false (or an error) parks the scanner
    /// in the Error state and it never scans.
    fn setup(&mut self, ctx: &ScannerContext) -> Result<bool, ScannerError>;

    fn scan(&mut self, ctx: &ScannerContext) -> Result<ScanResult, ScannerError>;

    fn teardown(&mut self, ctx: &ScannerContext);
}

/// Per-scanner lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    Initialized,
    SetupPending,
    SetupComplete,
    Scanning,
    ScanComplete,
    TeardownComplete,
    Error,
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "INITIALIZED"),
            Self::SetupPending => write!(f, "SETUP_PENDING"),
            Self::SetupComplete => write!(f, "SETUP_COMPLETE"),
            Self::Scanning => write!(f, "SCANNING"),
            Self::ScanComplete => write!(f, "SCAN_COMPLETE"),
            Self::TeardownComplete => write!(f, "TEARDOWN_COMPLETE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

// =============================================================================
// UNIVERSE FILES
// =============================================================================

/// Load a plain-text universe: one symbol per line, `#` comments and blank
/// lines ignored, symbols uppercased and deduplicated in file order.
pub fn load_universe(path: &Path) -> std::io::Result<Vec<Symbol>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let entry = line.split('#').next().unwrap_or("").trim();
        if entry.is_empty() {
            continue;
        }
        let symbol = entry.to_uppercase();
        if seen.insert(symbol.clone()) {
            out.push(symbol);
        }
    }
    Ok(out)
}

// =============================================================================
// BUILT-IN SCANNERS
// =============================================================================

/// Promotes symbols from a universe file that are not yet in the session.
///
/// Criteria (fixed here, not configurable): plausible listed tickers only
/// (1-5 alphanumeric characters), at most `MAX_PROMOTIONS` new symbols per
/// scan.
pub struct UniverseFileScanner {
    universe: Vec<Symbol>,
}

impl UniverseFileScanner {
    const MAX_PROMOTIONS: usize = 16;

    pub fn new() -> Self {
        Self {
            universe: Vec::new(),
        }
    }
}

impl Default for UniverseFileScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner for UniverseFileScanner {
    fn name(&self) -> &str {
        "universe_file"
    }

    fn setup(&mut self, ctx: &ScannerContext) -> Result<bool, ScannerError> {
        let path = ctx
            .config
            .get("universe_path")
            .and_then(Value::as_str)
            .ok_or_else(|| ScannerError::Setup("universe_path missing from config".into()))?;
        self.universe = load_universe(Path::new(path))
            .map_err(|e| ScannerError::Setup(format!("cannot read {}: {}", path, e)))?;
        info!(count = self.universe.len(), path, "universe loaded");
        Ok(!self.universe.is_empty())
    }

    fn scan(&mut self, ctx: &ScannerContext) -> Result<ScanResult, ScannerError> {
        let symbols: Vec<Symbol> = self
            .universe
            .iter()
            .filter(|s| s.len() <= 5 && s.chars().all(|c| c.is_ascii_alphanumeric()))
            .filter(|s| !ctx.session.is_symbol_full(s))
            .take(Self::MAX_PROMOTIONS)
            .cloned()
            .collect();
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "universe_size".to_string(),
            Value::from(self.universe.len()),
        );
        Ok(ScanResult { symbols, metadata })
    }

    fn teardown(&mut self, _ctx: &ScannerContext) {
        self.universe.clear();
    }
}

/// Constructors for config-selectable scanners.
pub type ScannerRegistry =
    HashMap<String, Box<dyn Fn() -> Box<dyn Scanner> + Send + Sync>>;

/// Registry with the built-in scanners.
pub fn default_registry() -> ScannerRegistry {
    let mut registry: ScannerRegistry = HashMap::new();
    registry.insert(
        "universe_file".to_string(),
        Box::new(|| Box::new(UniverseFileScanner::new()) as Box<dyn Scanner>),
    );
    registry
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Debug, Default)]
struct ScannerStats {
    scans_run: AtomicU64,
    scans_skipped: AtomicU64,
    symbols_promoted: AtomicU64,
}

struct ScannerSlot {
    name: String,
    scanner: Mutex<Box<dyn Scanner>>,
    config: ScannerConfig,
    state: Mutex<ScannerState>,
    /// Next scheduled regular-session scan; None once the schedule is spent.
    next_scan: Mutex<Option<DateTime<Utc>>>,
    /// At most one concurrent scan per scanner (live mode).
    in_flight: AtomicBool,
}

impl ScannerSlot {
    fn state(&self) -> ScannerState {
        *self.state.lock()
    }
}

/// Point-in-time view of one scanner for the status document.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScannerSnapshot {
    pub name: String,
    pub state: ScannerState,
    pub next_scan: Option<DateTime<Utc>>,
}

/// Owns scanner lifecycles and schedules for one session day.
pub struct ScannerManager {
    slots: Vec<Arc<ScannerSlot>>,
    session: Arc<SessionData>,
    time: Arc<TimeManager>,
    mode: SessionMode,
    session_date: NaiveDate,
    stats: Arc<ScannerStats>,
}

impl ScannerManager {
    pub fn new(
        configs: &[ScannerConfig],
        registry: &ScannerRegistry,
        session: Arc<SessionData>,
        time: Arc<TimeManager>,
        mode: SessionMode,
        session_date: NaiveDate,
    ) -> Self {
        let mut slots = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            let Some(build) = registry.get(&config.module) else {
                warn!(module = %config.module, "unknown scanner module; skipped");
                continue;
            };
            let scanner = build();
            let first = first_scheduled(&config.regular_session, session_date);
            slots.push(Arc::new(ScannerSlot {
                name: config.module.clone(),
                scanner: Mutex::new(scanner),
                config: config.clone(),
                state: Mutex::new(ScannerState::Initialized),
                next_scan: Mutex::new(first),
                in_flight: AtomicBool::new(false),
            }));
        }
        Self {
            slots,
            session,
            time,
            mode,
            session_date,
            stats: Arc::new(ScannerStats::default()),
        }
    }

    pub fn scanner_count(&self) -> usize {
        self.slots.len()
    }

    pub fn snapshots(&self) -> Vec<ScannerSnapshot> {
        self.slots
            .iter()
            .map(|slot| ScannerSnapshot {
                name: slot.name.clone(),
                state: slot.state(),
                next_scan: *slot.next_scan.lock(),
            })
            .collect()
    }

    pub fn symbols_promoted(&self) -> u64 {
        self.stats.symbols_promoted.load(Ordering::Relaxed)
    }

    fn context_for(&self, slot: &ScannerSlot, now: DateTime<Utc>) -> ScannerContext {
        ScannerContext {
            session: Arc::clone(&self.session),
            time: Arc::clone(&self.time),
            mode: self.mode,
            now,
            config: slot.config.config.clone(),
        }
    }

    /// Run setup for every scanner, then the pre-session scans. Called from
    /// the coordinator's PreSessionScanning phase.
    pub fn run_pre_session(&self, now: DateTime<Utc>) {
        for slot in &self.slots {
            self.ensure_setup(slot, now);
            if slot.config.pre_session && slot.state() == ScannerState::SetupComplete {
                self.run_scan(slot, now);
            }
            // A pre-session-only scanner has no further schedule: its last
            // scheduled scan has passed.
            if slot.next_scan.lock().is_none() {
                self.teardown_slot(slot, now);
            }
        }
    }

    /// Fire any due regular-session scans. Called on the coordinator's
    /// streaming cadence; hooks block the clock in backtest and run as
    /// skip-if-busy tasks in live mode.
    pub fn poll(&self, now: DateTime<Utc>) {
        for slot in &self.slots {
            let due = {
                let next = slot.next_scan.lock();
                matches!(*next, Some(at) if at <= now)
            };
            if !due {
                continue;
            }
            if !matches!(
                slot.state(),
                ScannerState::SetupComplete | ScannerState::ScanComplete
            ) {
                // Setup never completed; burn the slot's schedule.
                *slot.next_scan.lock() = None;
                continue;
            }

            match self.mode {
                SessionMode::Backtest => self.run_scan(slot, now),
                SessionMode::Live => self.run_scan_nonblocking(slot, now),
            }

            let next = next_scheduled(&slot.config.regular_session, self.session_date, now);
            *slot.next_scan.lock() = next;
            if next.is_none() {
                self.teardown_slot(slot, now);
            }
        }
    }

    /// Tear down anything still live (session end or termination).
    pub fn finish(&self, now: DateTime<Utc>) {
        for slot in &self.slots {
            self.teardown_slot(slot, now);
        }
    }

    fn ensure_setup(&self, slot: &Arc<ScannerSlot>, now: DateTime<Utc>) {
        if slot.state() != ScannerState::Initialized {
            return;
        }
        *slot.state.lock() = ScannerState::SetupPending;
        let ctx = self.context_for(slot, now);
        let outcome = slot.scanner.lock().setup(&ctx);
        let new_state = match outcome {
            Ok(true) => ScannerState::SetupComplete,
            Ok(false) => {
                warn!(scanner = %slot.name, "setup declined");
                ScannerState::Error
            }
            Err(err) => {
                warn!(scanner = %slot.name, error = %err, "setup failed");
                ScannerState::Error
            }
        };
        *slot.state.lock() = new_state;
        debug!(scanner = %slot.name, state = %new_state, "scanner setup finished");
    }

    /// Backtest: hooks block the clock (the streaming loop waits here).
    fn run_scan(&self, slot: &Arc<ScannerSlot>, now: DateTime<Utc>) {
        let ctx = self.context_for(slot, now);
        scan_once(slot, ctx, &self.session, &self.stats);
    }

    /// Live: at most one concurrent scan per scanner; a busy scanner skips
    /// this firing with a warning, and the scan itself runs as a detached
    /// task off the coordinator's cadence.
    fn run_scan_nonblocking(&self, slot: &Arc<ScannerSlot>, now: DateTime<Utc>) {
        if slot.in_flight.swap(true, Ordering::AcqRel) {
            self.stats.scans_skipped.fetch_add(1, Ordering::Relaxed);
            warn!(scanner = %slot.name, "previous scan still running; skipped");
            return;
        }
        let ctx = self.context_for(slot, now);
        let task_slot = Arc::clone(slot);
        let session = Arc::clone(&self.session);
        let stats = Arc::clone(&self.stats);
        let spawned = std::thread::Builder::new()
            .name(format!("scan-{}", slot.name))
            .spawn(move || {
                scan_once(&task_slot, ctx, &session, &stats);
                task_slot.in_flight.store(false, Ordering::Release);
            });
        if let Err(err) = spawned {
            warn!(scanner = %slot.name, error = %err, "scan task spawn failed");
            slot.in_flight.store(false, Ordering::Release);
        }
    }

    fn teardown_slot(&self, slot: &Arc<ScannerSlot>, now: DateTime<Utc>) {
        let mut state = slot.state.lock();
        match *state {
            ScannerState::TeardownComplete | ScannerState::Initialized | ScannerState::Error => {
                return;
            }
            _ => {}
        }
        *state = ScannerState::TeardownComplete;
        drop(state);
        let ctx = self.context_for(slot, now);
        slot.scanner.lock().teardown(&ctx);
        debug!(scanner = %slot.name, "scanner torn down");
    }
}

/// One scan invocation: state bookkeeping, the hook itself, and promotion of
/// discovered symbols through the store's unified adhoc path.
fn scan_once(
    slot: &Arc<ScannerSlot>,
    ctx: ScannerContext,
    session: &Arc<SessionData>,
    stats: &Arc<ScannerStats>,
) {
    *slot.state.lock() = ScannerState::Scanning;
    let outcome = slot.scanner.lock().scan(&ctx);
    stats.scans_run.fetch_add(1, Ordering::Relaxed);
    match outcome {
        Ok(result) => {
            for symbol in result.symbols {
                match session.add_symbol(&symbol) {
                    Ok(()) => {
                        stats.symbols_promoted.fetch_add(1, Ordering::Relaxed);
                        info!(scanner = %slot.name, %symbol, "symbol promoted");
                    }
                    Err(err) => {
                        warn!(scanner = %slot.name, %symbol, error = %err, "promotion failed");
                    }
                }
            }
        }
        Err(err) => {
            warn!(scanner = %slot.name, error = %err, "scan failed");
        }
    }
    *slot.state.lock() = ScannerState::ScanComplete;
}

/// Earliest schedule entry for the day.
fn first_scheduled(windows: &[ScanWindowConfig], date: NaiveDate) -> Option<DateTime<Utc>> {
    windows
        .iter()
        .map(|w| Utc.from_utc_datetime(&date.and_time(w.start)))
        .min()
}

/// Next scheduled time strictly after `now`: step by the window interval
/// inside each window, then fall to the next window's start.
fn next_scheduled(
    windows: &[ScanWindowConfig],
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut best: Option<DateTime<Utc>> = None;
    for window in windows {
        let start = Utc.from_utc_datetime(&date.and_time(window.start));
        let end = Utc.from_utc_datetime(&date.and_time(window.end));
        let candidate = if now < start {
            start
        } else {
            let step = window.interval.duration();
            let elapsed = (now - start).num_seconds();
            let steps = elapsed.div_euclid(step.num_seconds()) + 1;
            start + chrono::Duration::seconds(steps * step.num_seconds())
        };
        if candidate <= end {
            best = Some(best.map_or(candidate, |b: DateTime<Utc>| b.min(candidate)));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionMode;
    use crate::repository::MemoryRepository;
    use chrono::NaiveTime;
    use std::io::Write;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 2).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&date().and_hms_opt(h, m, 0).unwrap())
    }

    fn window(start: (u32, u32), end: (u32, u32), interval: crate::models::Interval) -> ScanWindowConfig {
        ScanWindowConfig {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            interval,
        }
    }

    fn fixture(configs: Vec<ScannerConfig>, registry: ScannerRegistry) -> ScannerManager {
        let repo = Arc::new(MemoryRepository::new());
        let session = Arc::new(SessionData::new(SessionMode::Backtest, date(), 100));
        let time = Arc::new(
            TimeManager::new(
                SessionMode::Backtest,
                repo,
                "us_equities",
                "equity",
                Some(at(9, 30)),
            )
            .unwrap(),
        );
        ScannerManager::new(&configs, &registry, session, time, SessionMode::Backtest, date())
    }

    /// Test double that records hook invocations.
    struct CountingScanner {
        setups: Arc<AtomicU64>,
        scans: Arc<AtomicU64>,
        teardowns: Arc<AtomicU64>,
        emit: Vec<Symbol>,
    }

    impl Scanner for CountingScanner {
        fn name(&self) -> &str {
            "counting"
        }

        fn setup(&mut self, _ctx: &ScannerContext) -> Result<bool, ScannerError> {
            self.setups.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        }

        fn scan(&mut self, _ctx: &ScannerContext) -> Result<ScanResult, ScannerError> {
            self.scans.fetch_add(1, Ordering::Relaxed);
            Ok(ScanResult {
                symbols: self.emit.clone(),
                metadata: Default::default(),
            })
        }

        fn teardown(&mut self, _ctx: &ScannerContext) {
            self.teardowns.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counting_registry(
        emit: Vec<Symbol>,
    ) -> (ScannerRegistry, Arc<AtomicU64>, Arc<AtomicU64>, Arc<AtomicU64>) {
        let setups = Arc::new(AtomicU64::new(0));
        let scans = Arc::new(AtomicU64::new(0));
        let teardowns = Arc::new(AtomicU64::new(0));
        let (s, c, t) = (setups.clone(), scans.clone(), teardowns.clone());
        let mut registry: ScannerRegistry = HashMap::new();
        registry.insert(
            "counting".to_string(),
            Box::new(move || {
                Box::new(CountingScanner {
                    setups: s.clone(),
                    scans: c.clone(),
                    teardowns: t.clone(),
                    emit: emit.clone(),
                }) as Box<dyn Scanner>
            }),
        );
        (registry, setups, scans, teardowns)
    }

    fn scanner_config(pre_session: bool, windows: Vec<ScanWindowConfig>) -> ScannerConfig {
        ScannerConfig {
            module: "counting".to_string(),
            enabled: true,
            pre_session,
            regular_session: windows,
            config: Value::Null,
        }
    }

    #[test]
    fn test_universe_file_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# momentum universe").unwrap();
        writeln!(file, "aapl").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "TSLA  # ev").unwrap();
        writeln!(file, "tsla").unwrap();
        writeln!(file, "msft").unwrap();
        file.flush().unwrap();

        let universe = load_universe(file.path()).unwrap();
        assert_eq!(universe, vec!["AAPL", "TSLA", "MSFT"]);
    }

    #[test]
    fn test_schedule_stepping() {
        let iv5 = crate::models::Interval::minutes(5);
        let windows = vec![window((9, 35), (15, 55), iv5)];

        assert_eq!(first_scheduled(&windows, date()), Some(at(9, 35)));
        assert_eq!(next_scheduled(&windows, date(), at(9, 35)), Some(at(9, 40)));
        assert_eq!(next_scheduled(&windows, date(), at(9, 37)), Some(at(9, 40)));
        assert_eq!(next_scheduled(&windows, date(), at(15, 55)), None);
        // Two windows: falls to the later window's start.
        let two = vec![
            window((9, 35), (10, 0), iv5),
            window((15, 0), (15, 55), iv5),
        ];
        assert_eq!(next_scheduled(&two, date(), at(10, 0)), Some(at(15, 0)));
    }

    #[test]
    fn test_pre_session_only_scanner_lifecycle() {
        let (registry, setups, scans, teardowns) = counting_registry(vec![]);
        let manager = fixture(vec![scanner_config(true, vec![])], registry);

        manager.run_pre_session(at(9, 0));

        assert_eq!(setups.load(Ordering::Relaxed), 1);
        assert_eq!(scans.load(Ordering::Relaxed), 1);
        // No regular windows: teardown fires right after the last scan.
        assert_eq!(teardowns.load(Ordering::Relaxed), 1);
        assert_eq!(
            manager.snapshots()[0].state,
            ScannerState::TeardownComplete
        );

        // finish() must not tear down twice.
        manager.finish(at(16, 0));
        assert_eq!(teardowns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_regular_schedule_scans_and_final_teardown() {
        let iv5 = crate::models::Interval::minutes(5);
        let (registry, setups, scans, teardowns) = counting_registry(vec![]);
        let manager = fixture(
            vec![scanner_config(false, vec![window((9, 35), (9, 45), iv5)])],
            registry,
        );
        manager.run_pre_session(at(9, 0));
        assert_eq!(setups.load(Ordering::Relaxed), 1);
        assert_eq!(scans.load(Ordering::Relaxed), 0);

        // Nothing due before the window.
        manager.poll(at(9, 34));
        assert_eq!(scans.load(Ordering::Relaxed), 0);

        manager.poll(at(9, 35));
        assert_eq!(scans.load(Ordering::Relaxed), 1);
        manager.poll(at(9, 40));
        assert_eq!(scans.load(Ordering::Relaxed), 2);
        assert_eq!(teardowns.load(Ordering::Relaxed), 0);

        // 9:45 is the last slot; after it the schedule is spent.
        manager.poll(at(9, 45));
        assert_eq!(scans.load(Ordering::Relaxed), 3);
        assert_eq!(teardowns.load(Ordering::Relaxed), 1);

        manager.poll(at(9, 50));
        assert_eq!(scans.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_promotion_queues_to_coordinator() {
        let (registry, _, _, _) = counting_registry(vec!["TSLA".to_string()]);
        let manager = fixture(vec![scanner_config(true, vec![])], registry);
        let (tx, rx) = crossbeam::channel::bounded(8);
        manager.session.install_provision_channel(tx);

        manager.run_pre_session(at(9, 0));

        assert_eq!(manager.symbols_promoted(), 1);
        let request = rx.try_recv().unwrap();
        assert_eq!(request.symbol, "TSLA");
    }

    #[test]
    fn test_missed_setup_burns_schedule() {
        // A registry whose scanner refuses setup.
        struct Refuser;
        impl Scanner for Refuser {
            fn name(&self) -> &str {
                "refuser"
            }
            fn setup(&mut self, _ctx: &ScannerContext) -> Result<bool, ScannerError> {
                Ok(false)
            }
            fn scan(&mut self, _ctx: &ScannerContext) -> Result<ScanResult, ScannerError> {
                panic!("must not scan after failed setup");
            }
            fn teardown(&mut self, _ctx: &ScannerContext) {}
        }
        let mut registry: ScannerRegistry = HashMap::new();
        registry.insert(
            "counting".to_string(),
            Box::new(|| Box::new(Refuser) as Box<dyn Scanner>),
        );
        let iv5 = crate::models::Interval::minutes(5);
        let manager = fixture(
            vec![scanner_config(true, vec![window((9, 35), (9, 45), iv5)])],
            registry,
        );
        manager.run_pre_session(at(9, 0));
        assert_eq!(manager.snapshots()[0].state, ScannerState::Error);
        manager.poll(at(9, 35));
        assert_eq!(manager.snapshots()[0].next_scan, None);
    }
}
