//! Prefetch worker.
//!
//! Loads bounded windows of raw data from the repository into per-stream
//! queues without blocking the coordinator. One worker thread serves a queue
//! of requests; the bounded stream queue provides backpressure (a full queue
//! blocks the worker, never the coordinator).

use crate::models::{MarketItem, StreamId, StreamKind};
use crate::repository::{MarketDataRepository, RepositoryError};
use crate::stream_coordinator::StreamMessage;
use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cadence for stop-flag checks while the worker is idle or backpressured.
const WORKER_POLL: Duration = Duration::from_millis(100);

// =============================================================================
// LOAD RESULT + HANDLE
// =============================================================================

/// Outcome of one prefetch load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadResult {
    pub stream: StreamId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub loaded: usize,
    /// The repository reported an empty range; not an error.
    pub no_data: bool,
    pub error: Option<String>,
}

impl LoadResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

struct HandleShared {
    result: Mutex<Option<LoadResult>>,
    cond: Condvar,
}

/// Completion handle for a prefetch request.
#[derive(Clone)]
pub struct PrefetchHandle {
    shared: Arc<HandleShared>,
}

impl PrefetchHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(HandleShared {
                result: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    fn complete(&self, result: LoadResult) {
        *self.shared.result.lock() = Some(result);
        self.shared.cond.notify_all();
    }

    /// Block until the load completes or `timeout` lapses.
    pub fn wait(&self, timeout: Duration) -> Option<LoadResult> {
        let deadline = Instant::now() + timeout;
        let mut result = self.shared.result.lock();
        loop {
            if let Some(r) = result.as_ref() {
                return Some(r.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.shared.cond.wait_for(&mut result, deadline - now);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.shared.result.lock().is_some()
    }

    pub fn result(&self) -> Option<LoadResult> {
        self.shared.result.lock().clone()
    }
}

// =============================================================================
// WORKER
// =============================================================================

struct PrefetchRequest {
    stream: StreamId,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    sender: Sender<StreamMessage>,
    handle: PrefetchHandle,
}

/// Single background loader thread (pool size 1).
pub struct PrefetchWorker {
    tx: Option<Sender<PrefetchRequest>>,
    join: Option<JoinHandle<()>>,
}

impl PrefetchWorker {
    pub fn spawn(repository: Arc<dyn MarketDataRepository>, stop: Arc<AtomicBool>) -> Self {
        let (tx, rx) = unbounded::<PrefetchRequest>();
        let join = std::thread::Builder::new()
            .name("prefetch-worker".to_string())
            .spawn(move || worker_loop(rx, repository, stop))
            .expect("spawn prefetch worker");
        Self {
            tx: Some(tx),
            join: Some(join),
        }
    }

    /// Queue a load of [window_start, window_end) for one stream. Items land
    /// on `sender` followed by the `End` sentinel.
    pub fn start_prefetch(
        &self,
        stream: StreamId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        sender: Sender<StreamMessage>,
    ) -> PrefetchHandle {
        let handle = PrefetchHandle::new();
        let request = PrefetchRequest {
            stream: stream.clone(),
            window_start,
            window_end,
            sender,
            handle: handle.clone(),
        };
        if let Some(tx) = &self.tx {
            if tx.send(request).is_err() {
                handle.complete(LoadResult {
                    stream,
                    window_start,
                    window_end,
                    loaded: 0,
                    no_data: false,
                    error: Some("prefetch worker stopped".to_string()),
                });
            }
        }
        handle
    }

    /// Drop the request queue and join the worker.
    pub fn shutdown(mut self, window: Duration) {
        self.tx.take();
        if let Some(join) = self.join.take() {
            let deadline = Instant::now() + window;
            while !join.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if join.is_finished() {
                let _ = join.join();
            } else {
                warn!("prefetch worker did not stop within the shutdown window");
            }
        }
    }
}

impl Drop for PrefetchWorker {
    fn drop(&mut self) {
        self.tx.take();
    }
}

fn worker_loop(
    rx: Receiver<PrefetchRequest>,
    repository: Arc<dyn MarketDataRepository>,
    stop: Arc<AtomicBool>,
) {
    info!("prefetch worker started");
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let request = match rx.recv_timeout(WORKER_POLL) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        process_request(request, &repository, &stop);
    }
    info!("prefetch worker stopped");
}

fn process_request(
    request: PrefetchRequest,
    repository: &Arc<dyn MarketDataRepository>,
    stop: &Arc<AtomicBool>,
) {
    let PrefetchRequest {
        stream,
        window_start,
        window_end,
        sender,
        handle,
    } = request;

    debug!(%stream, %window_start, %window_end, "prefetch load starting");

    let error = match load_items(&stream, window_start, window_end, repository) {
        Ok(items) => {
            let total = items.len();
            let mut delivered = 0usize;
            for item in items {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                // Bounded queue: a full queue backpressures us here.
                match send_with_stop(&sender, StreamMessage::Item(item), stop) {
                    SendStatus::Sent => delivered += 1,
                    SendStatus::Aborted => break,
                }
            }
            if delivered == total {
                let _ = sender.send(StreamMessage::End);
            }
            handle.complete(LoadResult {
                stream,
                window_start,
                window_end,
                loaded: delivered,
                no_data: false,
                error: None,
            });
            return;
        }
        Err(RepositoryError::NoData) => {
            let _ = sender.send(StreamMessage::End);
            handle.complete(LoadResult {
                stream,
                window_start,
                window_end,
                loaded: 0,
                no_data: true,
                error: None,
            });
            return;
        }
        Err(err) => err,
    };

    warn!(%stream, %error, "prefetch load failed");
    let _ = sender.send(StreamMessage::End);
    handle.complete(LoadResult {
        stream,
        window_start,
        window_end,
        loaded: 0,
        no_data: false,
        error: Some(error.to_string()),
    });
}

fn load_items(
    stream: &StreamId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    repository: &Arc<dyn MarketDataRepository>,
) -> Result<Vec<MarketItem>, RepositoryError> {
    match stream.kind {
        StreamKind::Bar => {
            let interval = stream
                .interval
                .ok_or_else(|| RepositoryError::Permanent("bar stream without interval".into()))?;
            let bars = repository.get_bars(&stream.symbol, interval, start, end)?;
            Ok(bars
                .into_iter()
                .map(|bar| MarketItem::Bar {
                    symbol: stream.symbol.clone(),
                    interval,
                    bar,
                })
                .collect())
        }
        StreamKind::Tick => {
            let ticks = repository.get_ticks(&stream.symbol, start, end)?;
            Ok(ticks
                .into_iter()
                .map(|tick| MarketItem::Tick {
                    symbol: stream.symbol.clone(),
                    tick,
                })
                .collect())
        }
        StreamKind::Quote => {
            let quotes = repository.get_quotes(&stream.symbol, start, end)?;
            Ok(quotes
                .into_iter()
                .map(|quote| MarketItem::Quote {
                    symbol: stream.symbol.clone(),
                    quote,
                })
                .collect())
        }
    }
}

enum SendStatus {
    Sent,
    Aborted,
}

fn send_with_stop(
    sender: &Sender<StreamMessage>,
    mut message: StreamMessage,
    stop: &Arc<AtomicBool>,
) -> SendStatus {
    loop {
        match sender.send_timeout(message, WORKER_POLL) {
            Ok(()) => return SendStatus::Sent,
            Err(SendTimeoutError::Timeout(returned)) => {
                if stop.load(Ordering::Acquire) {
                    return SendStatus::Aborted;
                }
                message = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => return SendStatus::Aborted,
        }
    }
}
