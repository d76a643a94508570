//! Cross-thread signalling primitives.
//!
//! `StreamSubscription` is the one-shot, mode-aware ready/wait primitive
//! between the coordinator and downstream processors. `PauseGate` is the
//! set/clear gate the streaming loop blocks on while paused. `DataArrivalEvent`
//! is the broadcast the quality manager sleeps on.
//!
//! Every blocking wait re-checks the engine stop flag on a short slice so
//! shutdown is prompt without dedicated wakeup plumbing.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Re-check cadence for stop-flag polling inside blocking waits.
const WAIT_SLICE: Duration = Duration::from_millis(50);

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Second `wait()` without an intervening `reset()`.
    IllegalState(String),
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalState(msg) => write!(f, "illegal subscription state: {}", msg),
        }
    }
}

impl std::error::Error for SubscriptionError {}

// =============================================================================
// STREAM SUBSCRIPTION
// =============================================================================

/// Delivery semantics of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// `wait()` blocks until signalled. Backtest backpressure: the producer
    /// must not outrun the consumer.
    DataDriven,
    /// `wait(timeout)` returns signalled or timed-out; a timeout counts an
    /// overrun and streaming does not stall.
    ClockDriven,
    /// Clock-driven semantics against real wall-clock delays.
    Live,
}

/// Outcome of a `wait()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signalled,
    /// Timed out (clock-driven/live); the overrun counter was incremented.
    TimedOut,
    /// Engine shutdown while waiting.
    Cancelled,
}

struct SubState {
    signalled: bool,
    waited_since_reset: bool,
}

/// One-shot, mode-aware ready/wait primitive.
///
/// Lifecycle per delivery: `signal()` (idempotent) -> `wait()` -> `reset()`.
/// A second `wait()` before `reset()` is a state violation.
pub struct StreamSubscription {
    name: String,
    mode: SubscriptionMode,
    state: Mutex<SubState>,
    cond: Condvar,
    overruns: AtomicU64,
    signals: AtomicU64,
    stop: Arc<AtomicBool>,
}

impl StreamSubscription {
    pub fn new(name: impl Into<String>, mode: SubscriptionMode, stop: Arc<AtomicBool>) -> Self {
        Self {
            name: name.into(),
            mode,
            state: Mutex::new(SubState {
                signalled: false,
                waited_since_reset: false,
            }),
            cond: Condvar::new(),
            overruns: AtomicU64::new(0),
            signals: AtomicU64::new(0),
            stop,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    /// Mark ready. Idempotent until the next `reset()`.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        if !state.signalled {
            state.signalled = true;
            self.signals.fetch_add(1, Ordering::Relaxed);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Re-arm for the next delivery.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.signalled = false;
        state.waited_since_reset = false;
    }

    /// Block per the subscription mode. `timeout` applies to clock-driven
    /// and live subscriptions only; data-driven waits ignore it.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, SubscriptionError> {
        let mut state = self.state.lock();
        if state.waited_since_reset {
            return Err(SubscriptionError::IllegalState(format!(
                "double wait on '{}' without reset",
                self.name
            )));
        }
        state.waited_since_reset = true;

        let deadline = match self.mode {
            SubscriptionMode::DataDriven => None,
            SubscriptionMode::ClockDriven | SubscriptionMode::Live => {
                Some(Instant::now() + timeout.unwrap_or(WAIT_SLICE))
            }
        };

        loop {
            if state.signalled {
                return Ok(WaitOutcome::Signalled);
            }
            if self.stop.load(Ordering::Acquire) {
                return Ok(WaitOutcome::Cancelled);
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                    return Ok(WaitOutcome::TimedOut);
                }
                let slice = WAIT_SLICE.min(deadline - now);
                self.cond.wait_for(&mut state, slice);
            } else {
                self.cond.wait_for(&mut state, WAIT_SLICE);
            }
        }
    }

    /// Total timed-out waits since creation.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Total distinct signals since creation.
    pub fn signals(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }
}

// =============================================================================
// PAUSE GATE
// =============================================================================

/// Set/clear gate for the streaming loop. Open = streaming allowed.
///
/// Shared by the public pause/resume API and internal pauses (dynamic
/// provisioning catch-up).
pub struct PauseGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    pub fn close(&self) {
        *self.open.lock() = false;
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        !*self.open.lock()
    }

    /// Block until the gate opens. Returns false when shutdown raced the
    /// wait.
    pub fn wait_open(&self, stop: &AtomicBool) -> bool {
        let mut open = self.open.lock();
        loop {
            if *open {
                return true;
            }
            if stop.load(Ordering::Acquire) {
                return false;
            }
            self.cond.wait_for(&mut open, WAIT_SLICE);
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// DATA ARRIVAL EVENT
// =============================================================================

/// Broadcast generation counter. Consumers remember the last generation they
/// handled and sleep until it moves or a timeout lapses.
pub struct DataArrivalEvent {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl DataArrivalEvent {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Wait until the generation advances past `seen` or `timeout` lapses.
    /// Returns the latest generation and whether it moved.
    pub fn wait_newer(&self, seen: u64, timeout: Duration, stop: &AtomicBool) -> (u64, bool) {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        loop {
            if *generation > seen {
                return (*generation, true);
            }
            if stop.load(Ordering::Acquire) {
                return (*generation, false);
            }
            let now = Instant::now();
            if now >= deadline {
                return (*generation, false);
            }
            let slice = WAIT_SLICE.min(deadline - now);
            self.cond.wait_for(&mut generation, slice);
        }
    }
}

impl Default for DataArrivalEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn stop_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_data_driven_wait_blocks_until_signal() {
        let sub = Arc::new(StreamSubscription::new(
            "proc",
            SubscriptionMode::DataDriven,
            stop_flag(),
        ));
        let waiter = Arc::clone(&sub);
        let handle = thread::spawn(move || waiter.wait(None).unwrap());
        thread::sleep(Duration::from_millis(20));
        sub.signal();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Signalled);
        assert_eq!(sub.overruns(), 0);
    }

    #[test]
    fn test_signal_idempotent_until_reset() {
        let sub = StreamSubscription::new("proc", SubscriptionMode::DataDriven, stop_flag());
        sub.signal();
        sub.signal();
        sub.signal();
        assert_eq!(sub.signals(), 1);
        sub.reset();
        sub.signal();
        assert_eq!(sub.signals(), 2);
    }

    #[test]
    fn test_clock_driven_timeout_counts_overrun() {
        let sub = StreamSubscription::new("proc", SubscriptionMode::ClockDriven, stop_flag());
        let outcome = sub.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(sub.overruns(), 1);
    }

    #[test]
    fn test_double_wait_is_illegal_state() {
        let sub = StreamSubscription::new("proc", SubscriptionMode::ClockDriven, stop_flag());
        sub.wait(Some(Duration::from_millis(1))).unwrap();
        assert!(matches!(
            sub.wait(Some(Duration::from_millis(1))),
            Err(SubscriptionError::IllegalState(_))
        ));
        sub.reset();
        assert!(sub.wait(Some(Duration::from_millis(1))).is_ok());
    }

    #[test]
    fn test_wait_cancelled_on_stop() {
        let stop = stop_flag();
        let sub = Arc::new(StreamSubscription::new(
            "proc",
            SubscriptionMode::DataDriven,
            Arc::clone(&stop),
        ));
        let waiter = Arc::clone(&sub);
        let handle = thread::spawn(move || waiter.wait(None).unwrap());
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
        assert_eq!(handle.join().unwrap(), WaitOutcome::Cancelled);
    }

    #[test]
    fn test_pause_gate_blocks_and_releases() {
        let gate = Arc::new(PauseGate::new());
        let stop = stop_flag();
        assert!(!gate.is_closed());

        gate.close();
        assert!(gate.is_closed());

        let g = Arc::clone(&gate);
        let s = Arc::clone(&stop);
        let handle = thread::spawn(move || g.wait_open(&s));
        thread::sleep(Duration::from_millis(20));
        gate.open();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_data_arrival_generation() {
        let event = Arc::new(DataArrivalEvent::new());
        let stop = stop_flag();

        // Timeout path: generation unchanged.
        let (generation, moved) = event.wait_newer(0, Duration::from_millis(10), &stop);
        assert_eq!(generation, 0);
        assert!(!moved);

        let e = Arc::clone(&event);
        let s = Arc::clone(&stop);
        let handle = thread::spawn(move || e.wait_newer(0, Duration::from_secs(5), &s));
        thread::sleep(Duration::from_millis(20));
        event.notify();
        let (generation, moved) = handle.join().unwrap();
        assert_eq!(generation, 1);
        assert!(moved);
    }
}
