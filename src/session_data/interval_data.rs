//! Per-interval bar containers.
//!
//! `IntervalData` is the bounded ring of current-session bars for one
//! (symbol, interval); `HistoricalIntervalData` holds the trailing days.
//! Bars are immutable once appended and shared behind `Arc`, so readers can
//! hold snapshots without copying while the ring rolls.

use crate::models::{Bar, Interval};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// One contiguous run of missing bars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapInfo {
    /// First missing bar timestamp.
    pub start: DateTime<Utc>,
    /// Last missing bar timestamp.
    pub end: DateTime<Utc>,
    pub count: u32,
}

// =============================================================================
// CURRENT-SESSION RING
// =============================================================================

/// Bounded ring of current-session bars for one interval.
#[derive(Debug, Clone)]
pub struct IntervalData {
    interval: Interval,
    bars: VecDeque<Arc<Bar>>,
    capacity: usize,
    /// Bars here were aggregated from a finer interval rather than streamed.
    derived: bool,
    /// The streamed interval feeding this one, when derived.
    derived_from: Option<Interval>,
    appended_total: u64,
}

impl IntervalData {
    pub fn streamed(interval: Interval, capacity: usize) -> Self {
        Self {
            interval,
            bars: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            derived: false,
            derived_from: None,
            appended_total: 0,
        }
    }

    pub fn derived(interval: Interval, from: Interval, capacity: usize) -> Self {
        Self {
            interval,
            bars: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            derived: true,
            derived_from: Some(from),
            appended_total: 0,
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn is_derived(&self) -> bool {
        self.derived
    }

    pub fn derived_from(&self) -> Option<Interval> {
        self.derived_from
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn appended_total(&self) -> u64 {
        self.appended_total
    }

    pub fn last(&self) -> Option<Arc<Bar>> {
        self.bars.back().cloned()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.back().map(|b| b.timestamp)
    }

    /// Append a strictly-newer bar. The caller has already verified ordering;
    /// this enforces it again as the container invariant.
    pub fn append(&mut self, bar: Arc<Bar>) -> Result<(), DateTime<Utc>> {
        if let Some(last) = self.last_timestamp() {
            if bar.timestamp <= last {
                return Err(last);
            }
        }
        if self.bars.len() == self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
        self.appended_total += 1;
        Ok(())
    }

    /// Insert an older bar at its sorted position (gap repair). Returns true
    /// when the bar became the newest element. Duplicate timestamps are
    /// replaced in place.
    pub fn insert_sorted(&mut self, bar: Arc<Bar>) -> bool {
        let ts = bar.timestamp;
        match self.bars.binary_search_by(|b| b.timestamp.cmp(&ts)) {
            Ok(pos) => {
                self.bars[pos] = bar;
                pos + 1 == self.bars.len()
            }
            Err(pos) => {
                if self.bars.len() == self.capacity {
                    self.bars.pop_front();
                    let pos = pos.saturating_sub(1);
                    self.bars.insert(pos, bar);
                    pos + 1 == self.bars.len()
                } else {
                    self.bars.insert(pos, bar);
                    pos + 1 == self.bars.len()
                }
            }
        }
    }

    pub fn last_n(&self, n: usize) -> Vec<Arc<Bar>> {
        let skip = self.bars.len().saturating_sub(n);
        self.bars.iter().skip(skip).cloned().collect()
    }

    /// Bars with timestamp >= `since`, chronological.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<Arc<Bar>> {
        let start = self
            .bars
            .partition_point(|b| b.timestamp < since);
        self.bars.iter().skip(start).cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<Bar>> {
        self.bars.iter().cloned().collect()
    }

    /// Timestamps currently present, chronological.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.bars.iter().map(|b| b.timestamp).collect()
    }

    /// Remove and return everything, e.g. when rolling a session day into
    /// history.
    pub fn drain_all(&mut self) -> Vec<Arc<Bar>> {
        self.bars.drain(..).collect()
    }
}

// =============================================================================
// HISTORICAL TRAILING DAYS
// =============================================================================

/// Trailing-day history for one (symbol, interval).
#[derive(Debug, Clone)]
pub struct HistoricalIntervalData {
    interval: Interval,
    days: BTreeMap<NaiveDate, Vec<Arc<Bar>>>,
    /// Trailing-day retention; rolling past it drops the oldest day.
    cap_days: usize,
    /// Bar quality over the covered range, percent.
    quality: f64,
    gaps: Vec<GapInfo>,
}

impl HistoricalIntervalData {
    pub fn new(interval: Interval, cap_days: usize) -> Self {
        Self {
            interval,
            days: BTreeMap::new(),
            cap_days: cap_days.max(1),
            quality: 100.0,
            gaps: Vec::new(),
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn cap_days(&self) -> usize {
        self.cap_days
    }

    pub fn raise_cap(&mut self, cap_days: usize) {
        self.cap_days = self.cap_days.max(cap_days);
    }

    pub fn quality(&self) -> f64 {
        self.quality
    }

    pub fn set_quality(&mut self, quality: f64, gaps: Vec<GapInfo>) {
        self.quality = quality.clamp(0.0, 100.0);
        self.gaps = gaps;
    }

    pub fn gaps(&self) -> &[GapInfo] {
        &self.gaps
    }

    pub fn day_count(&self) -> usize {
        self.days.len()
    }

    pub fn total_bars(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    /// Add (or replace) one day's bars and drop the oldest days over cap.
    pub fn add_day(&mut self, date: NaiveDate, bars: Vec<Arc<Bar>>) {
        self.days.insert(date, bars);
        while self.days.len() > self.cap_days {
            let oldest = *self.days.keys().next().expect("non-empty");
            self.days.remove(&oldest);
        }
    }

    /// Bars from the most recent `days_back` days, chronological.
    pub fn last_days(&self, days_back: usize) -> Vec<Arc<Bar>> {
        let skip = self.days.len().saturating_sub(days_back);
        self.days
            .values()
            .skip(skip)
            .flat_map(|bars| bars.iter().cloned())
            .collect()
    }

    /// All held bars, chronological.
    pub fn all(&self) -> Vec<Arc<Bar>> {
        self.days
            .values()
            .flat_map(|bars| bars.iter().cloned())
            .collect()
    }

    pub fn covered_dates(&self) -> Vec<NaiveDate> {
        self.days.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(secs: i64) -> Arc<Bar> {
        Arc::new(Bar::new(
            Utc.timestamp_opt(secs, 0).unwrap(),
            1.0,
            1.0,
            1.0,
            1.0,
            1.0,
        ))
    }

    #[test]
    fn test_append_strictly_increasing() {
        let mut data = IntervalData::streamed(Interval::minutes(1), 10);
        data.append(bar(60)).unwrap();
        data.append(bar(120)).unwrap();
        assert_eq!(data.append(bar(120)).unwrap_err(), bar(120).timestamp);
        assert_eq!(data.append(bar(60)).unwrap_err(), bar(120).timestamp);
        assert_eq!(data.len(), 2);
        assert_eq!(data.last_timestamp(), Some(bar(120).timestamp));
    }

    #[test]
    fn test_ring_caps_at_capacity() {
        let mut data = IntervalData::streamed(Interval::minutes(1), 3);
        for i in 1..=5 {
            data.append(bar(i * 60)).unwrap();
        }
        assert_eq!(data.len(), 3);
        assert_eq!(data.appended_total(), 5);
        assert_eq!(
            data.timestamps(),
            vec![bar(180).timestamp, bar(240).timestamp, bar(300).timestamp]
        );
    }

    #[test]
    fn test_insert_sorted_repair() {
        let mut data = IntervalData::streamed(Interval::minutes(1), 10);
        data.append(bar(60)).unwrap();
        data.append(bar(180)).unwrap();

        // Older repair: not newest.
        assert!(!data.insert_sorted(bar(120)));
        assert_eq!(
            data.timestamps(),
            vec![bar(60).timestamp, bar(120).timestamp, bar(180).timestamp]
        );

        // Append-position repair: newest.
        assert!(data.insert_sorted(bar(240)));
    }

    #[test]
    fn test_last_n_and_since() {
        let mut data = IntervalData::streamed(Interval::minutes(1), 10);
        for i in 1..=5 {
            data.append(bar(i * 60)).unwrap();
        }
        assert_eq!(data.last_n(2).len(), 2);
        assert_eq!(data.last_n(99).len(), 5);
        assert_eq!(data.since(bar(180).timestamp).len(), 3);
        assert_eq!(data.since(bar(301).timestamp).len(), 0);
    }

    #[test]
    fn test_historical_cap_drops_oldest() {
        let mut hist = HistoricalIntervalData::new(Interval::minutes(1), 2);
        let d1 = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2025, 7, 2).unwrap();
        let d3 = NaiveDate::from_ymd_opt(2025, 7, 3).unwrap();
        hist.add_day(d1, vec![bar(1)]);
        hist.add_day(d2, vec![bar(2), bar(3)]);
        hist.add_day(d3, vec![bar(4)]);
        assert_eq!(hist.day_count(), 2);
        assert_eq!(hist.covered_dates(), vec![d2, d3]);
        assert_eq!(hist.total_bars(), 3);
        assert_eq!(hist.last_days(1).len(), 1);
    }
}
