//! Chronological k-way merge over per-stream queues.
//!
//! Every active stream owns a bounded queue fed by the prefetch worker. The
//! merge holds one pending head per stream and always hands out the oldest
//! head; ties break deterministically by (kind priority tick<quote<bar,
//! symbol lexicographic, interval seconds ascending), so identical inputs
//! produce identical output sequences across runs.
//!
//! Exhaustion is explicit: a stream finishes its day by sending the `End`
//! sentinel, after which it leaves the pending map. When every stream has
//! ended and drained, the merge reports `Drained`. Market-hours filtering is
//! the session coordinator's job; the window depends on the day's calendar
//! row, which this layer does not know.

use crate::models::{MarketItem, StreamId};
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// One message on a stream queue.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Item(MarketItem),
    /// Sentinel: no more data for this stream this session day.
    End,
}

/// Result of asking for the next oldest item.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Item(MarketItem),
    /// At least one live stream has an empty queue; strict chronology
    /// requires its head before anything can be handed out.
    Pending,
    /// All streams exhausted and queues empty.
    Drained,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamCoordinatorError {
    DuplicateStream(StreamId),
}

impl fmt::Display for StreamCoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateStream(id) => write!(f, "stream {} already registered", id),
        }
    }
}

impl std::error::Error for StreamCoordinatorError {}

/// Merge counters, surfaced in the status document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MergeStats {
    pub items_merged: u64,
    pub bars: u64,
    pub ticks: u64,
    pub quotes: u64,
    /// Ties resolved past the timestamp comparison.
    pub tiebreaks: u64,
    pub pending_returns: u64,
    pub max_queue_depth: usize,
    /// Producers that vanished without sending the End sentinel.
    pub disconnects: u64,
}

struct StreamSlot {
    id: StreamId,
    rx: Receiver<StreamMessage>,
    head: Option<MarketItem>,
    exhausted: bool,
}

impl StreamSlot {
    /// Pull the next head if one is available. Returns false when the queue
    /// is empty but the stream is still live.
    fn try_fill_head(&mut self, stats: &mut MergeStats) -> bool {
        if self.head.is_some() || self.exhausted {
            return true;
        }
        stats.max_queue_depth = stats.max_queue_depth.max(self.rx.len());
        match self.rx.try_recv() {
            Ok(StreamMessage::Item(item)) => {
                self.head = Some(item);
                true
            }
            Ok(StreamMessage::End) => {
                self.exhausted = true;
                trace!(stream = %self.id, "stream exhausted");
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                warn!(stream = %self.id, "stream producer disconnected without sentinel");
                self.exhausted = true;
                stats.disconnects += 1;
                true
            }
        }
    }
}

/// Deterministic chronological merge over all active streams.
pub struct StreamCoordinator {
    slots: Vec<StreamSlot>,
    queue_capacity: usize,
    last_timestamp: Option<DateTime<Utc>>,
    stats: MergeStats,
}

impl StreamCoordinator {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            queue_capacity,
            last_timestamp: None,
            stats: MergeStats::default(),
        }
    }

    /// Register a stream and hand back the producer side of its queue.
    pub fn register(
        &mut self,
        id: StreamId,
    ) -> Result<Sender<StreamMessage>, StreamCoordinatorError> {
        if self.slots.iter().any(|slot| slot.id == id) {
            return Err(StreamCoordinatorError::DuplicateStream(id));
        }
        let (tx, rx) = bounded(self.queue_capacity);
        debug!(stream = %id, "stream registered");
        self.slots.push(StreamSlot {
            id,
            rx,
            head: None,
            exhausted: false,
        });
        Ok(tx)
    }

    /// Drop all streams and reset the chronology watermark (new session day).
    pub fn reset(&mut self) {
        self.slots.clear();
        self.last_timestamp = None;
    }

    pub fn stream_count(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// True when every stream has ended and no head remains.
    pub fn is_drained(&mut self) -> bool {
        for slot in &mut self.slots {
            slot.try_fill_head(&mut self.stats);
        }
        self.slots
            .iter()
            .all(|slot| slot.exhausted && slot.head.is_none())
    }

    /// Next oldest item across all streams, waiting up to `head_wait` for
    /// lagging queues before reporting `Pending`.
    pub fn next(&mut self, head_wait: Duration) -> MergeOutcome {
        let deadline = Instant::now() + head_wait;
        loop {
            let mut all_ready = true;
            for slot in &mut self.slots {
                if !slot.try_fill_head(&mut self.stats) {
                    all_ready = false;
                }
            }
            if all_ready {
                break;
            }
            if Instant::now() >= deadline {
                self.stats.pending_returns += 1;
                return MergeOutcome::Pending;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // Drop exhausted streams with nothing pending.
        self.slots
            .retain(|slot| !(slot.exhausted && slot.head.is_none()));

        let chosen = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.head.as_ref().map(|item| (idx, item)))
            .min_by(|(_, a), (_, b)| {
                a.timestamp()
                    .cmp(&b.timestamp())
                    .then_with(|| a.kind().cmp(&b.kind()))
                    .then_with(|| a.symbol().cmp(b.symbol()))
                    .then_with(|| {
                        interval_seconds(a).cmp(&interval_seconds(b))
                    })
            })
            .map(|(idx, _)| idx);

        let Some(idx) = chosen else {
            return MergeOutcome::Drained;
        };

        // Count ties past the primary key for observability.
        let chosen_ts = self.slots[idx].head.as_ref().expect("chosen head").timestamp();
        let tied = self
            .slots
            .iter()
            .filter(|slot| slot.head.as_ref().map(|i| i.timestamp()) == Some(chosen_ts))
            .count();
        if tied > 1 {
            self.stats.tiebreaks += 1;
        }

        let item = self.slots[idx].head.take().expect("chosen head");
        debug_assert!(
            self.last_timestamp.map_or(true, |last| item.timestamp() >= last),
            "merge produced non-chronological output"
        );
        self.last_timestamp = Some(item.timestamp());

        self.stats.items_merged += 1;
        match item.kind() {
            crate::models::StreamKind::Bar => self.stats.bars += 1,
            crate::models::StreamKind::Tick => self.stats.ticks += 1,
            crate::models::StreamKind::Quote => self.stats.quotes += 1,
        }

        MergeOutcome::Item(item)
    }
}

fn interval_seconds(item: &MarketItem) -> i64 {
    match item {
        MarketItem::Bar { interval, .. } => interval.total_seconds(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bar, Interval, StreamKind, Tick};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn bar_item(symbol: &str, interval: Interval, secs: i64) -> MarketItem {
        MarketItem::Bar {
            symbol: symbol.to_string(),
            interval,
            bar: Bar::new(ts(secs), 1.0, 1.0, 1.0, 1.0, 1.0),
        }
    }

    fn tick_item(symbol: &str, secs: i64) -> MarketItem {
        MarketItem::Tick {
            symbol: symbol.to_string(),
            tick: Tick {
                timestamp: ts(secs),
                price: 1.0,
                size: 1.0,
            },
        }
    }

    fn drain(coordinator: &mut StreamCoordinator) -> Vec<MarketItem> {
        let mut out = Vec::new();
        loop {
            match coordinator.next(Duration::from_millis(10)) {
                MergeOutcome::Item(item) => out.push(item),
                MergeOutcome::Drained => return out,
                MergeOutcome::Pending => panic!("unexpected pending in drained test"),
            }
        }
    }

    #[test]
    fn test_chronological_merge_two_streams() {
        let mut merge = StreamCoordinator::new(16);
        let iv = Interval::minutes(1);
        let a = merge.register(StreamId::bar("AAPL", iv)).unwrap();
        let b = merge.register(StreamId::bar("MSFT", iv)).unwrap();

        a.send(StreamMessage::Item(bar_item("AAPL", iv, 60))).unwrap();
        a.send(StreamMessage::Item(bar_item("AAPL", iv, 180))).unwrap();
        a.send(StreamMessage::End).unwrap();
        b.send(StreamMessage::Item(bar_item("MSFT", iv, 120))).unwrap();
        b.send(StreamMessage::End).unwrap();

        let times: Vec<i64> = drain(&mut merge)
            .iter()
            .map(|i| i.timestamp().timestamp())
            .collect();
        assert_eq!(times, vec![60, 120, 180]);
        assert_eq!(merge.stats().items_merged, 3);
    }

    #[test]
    fn test_tie_break_kind_then_symbol_then_interval() {
        let mut merge = StreamCoordinator::new(16);
        let m1 = Interval::minutes(1);
        let m5 = Interval::minutes(5);

        let bars5 = merge.register(StreamId::bar("AAPL", m5)).unwrap();
        let bars1 = merge.register(StreamId::bar("AAPL", m1)).unwrap();
        let bars_msft = merge.register(StreamId::bar("MSFT", m1)).unwrap();
        let ticks = merge.register(StreamId::tick("ZZZZ")).unwrap();

        for (tx, item) in [
            (&bars5, bar_item("AAPL", m5, 300)),
            (&bars1, bar_item("AAPL", m1, 300)),
            (&bars_msft, bar_item("MSFT", m1, 300)),
            (&ticks, tick_item("ZZZZ", 300)),
        ] {
            tx.send(StreamMessage::Item(item)).unwrap();
            tx.send(StreamMessage::End).unwrap();
        }

        let items = drain(&mut merge);
        // Tick first despite the later-sorting symbol, then bars by symbol,
        // then by interval seconds.
        assert_eq!(items[0].kind(), StreamKind::Tick);
        assert_eq!(items[1], bar_item("AAPL", m1, 300));
        assert_eq!(items[2], bar_item("AAPL", m5, 300));
        assert_eq!(items[3], bar_item("MSFT", m1, 300));
        assert!(merge.stats().tiebreaks >= 1);
    }

    #[test]
    fn test_pending_until_lagging_stream_fills() {
        let mut merge = StreamCoordinator::new(16);
        let iv = Interval::minutes(1);
        let a = merge.register(StreamId::bar("AAPL", iv)).unwrap();
        let b = merge.register(StreamId::bar("MSFT", iv)).unwrap();

        a.send(StreamMessage::Item(bar_item("AAPL", iv, 120))).unwrap();
        // MSFT queue is empty and live: the merge must not emit AAPL yet,
        // because MSFT could still deliver an older item.
        assert_eq!(merge.next(Duration::from_millis(5)), MergeOutcome::Pending);

        b.send(StreamMessage::Item(bar_item("MSFT", iv, 60))).unwrap();
        assert_eq!(
            merge.next(Duration::from_millis(5)),
            MergeOutcome::Item(bar_item("MSFT", iv, 60))
        );
        assert_eq!(
            merge.next(Duration::from_millis(5)),
            MergeOutcome::Pending
        );
        assert!(merge.stats().pending_returns >= 2);
    }

    #[test]
    fn test_drained_after_all_sentinels() {
        let mut merge = StreamCoordinator::new(16);
        let iv = Interval::minutes(1);
        let a = merge.register(StreamId::bar("AAPL", iv)).unwrap();
        a.send(StreamMessage::Item(bar_item("AAPL", iv, 60))).unwrap();
        a.send(StreamMessage::End).unwrap();

        assert!(!merge.is_drained());
        assert!(matches!(
            merge.next(Duration::from_millis(5)),
            MergeOutcome::Item(_)
        ));
        assert_eq!(merge.next(Duration::from_millis(5)), MergeOutcome::Drained);
        assert!(merge.is_drained());
        // Exhausted stream left the pending map.
        assert_eq!(merge.stream_count(), 0);
    }

    #[test]
    fn test_disconnect_counts_as_exhaustion() {
        let mut merge = StreamCoordinator::new(16);
        let iv = Interval::minutes(1);
        let a = merge.register(StreamId::bar("AAPL", iv)).unwrap();
        a.send(StreamMessage::Item(bar_item("AAPL", iv, 60))).unwrap();
        drop(a);

        assert!(matches!(
            merge.next(Duration::from_millis(5)),
            MergeOutcome::Item(_)
        ));
        assert_eq!(merge.next(Duration::from_millis(5)), MergeOutcome::Drained);
        assert_eq!(merge.stats().disconnects, 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut merge = StreamCoordinator::new(16);
        let id = StreamId::bar("AAPL", Interval::minutes(1));
        merge.register(id.clone()).unwrap();
        assert!(matches!(
            merge.register(id),
            Err(StreamCoordinatorError::DuplicateStream(_))
        ));
    }

    #[test]
    fn test_deterministic_across_runs() {
        let run = || {
            let mut merge = StreamCoordinator::new(16);
            let m1 = Interval::minutes(1);
            let a = merge.register(StreamId::bar("AAPL", m1)).unwrap();
            let b = merge.register(StreamId::bar("MSFT", m1)).unwrap();
            let t = merge.register(StreamId::tick("AAPL")).unwrap();
            for secs in [60, 120, 180] {
                a.send(StreamMessage::Item(bar_item("AAPL", m1, secs))).unwrap();
                b.send(StreamMessage::Item(bar_item("MSFT", m1, secs))).unwrap();
                t.send(StreamMessage::Item(tick_item("AAPL", secs))).unwrap();
            }
            for tx in [a, b, t] {
                tx.send(StreamMessage::End).unwrap();
            }
            drain(&mut merge)
        };
        assert_eq!(run(), run());
    }
}
