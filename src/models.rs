//! Core market-data types shared across the engine.
//!
//! Bars, ticks, and quotes are the three item kinds carried by streams.
//! `Interval` is the canonical bar-interval descriptor; derivability between
//! intervals drives the provisioning logic in the requirement analyzer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Ticker symbol. Uppercased on entry into the session store.
pub type Symbol = String;

/// Seconds in a regular US-equities trading day (09:30-16:00).
pub const TRADING_SECS_PER_DAY: i64 = 6 * 3600 + 1800;

// =============================================================================
// INTERVAL
// =============================================================================

/// Time unit for a bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl IntervalUnit {
    /// Seconds per single unit.
    pub fn seconds(&self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3600,
            Self::Day => 86_400,
        }
    }

    fn suffix(&self) -> char {
        match self {
            Self::Second => 's',
            Self::Minute => 'm',
            Self::Hour => 'h',
            Self::Day => 'd',
        }
    }
}

/// Canonical bar-interval descriptor: `count` multiples of `unit`.
///
/// Total order is by covered seconds, so `1m < 5m < 1h` regardless of unit.
/// Serializes as its compact string form ("1m", "30s", "1d").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub unit: IntervalUnit,
    pub count: u32,
}

impl Serialize for Interval {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Interval {
    pub fn new(unit: IntervalUnit, count: u32) -> Self {
        debug_assert!(count >= 1, "interval count must be >= 1");
        Self { unit, count }
    }

    pub fn seconds(count: u32) -> Self {
        Self::new(IntervalUnit::Second, count)
    }

    pub fn minutes(count: u32) -> Self {
        Self::new(IntervalUnit::Minute, count)
    }

    pub fn hours(count: u32) -> Self {
        Self::new(IntervalUnit::Hour, count)
    }

    pub fn days(count: u32) -> Self {
        Self::new(IntervalUnit::Day, count)
    }

    /// Total seconds covered by one bar of this interval.
    pub fn total_seconds(&self) -> i64 {
        self.unit.seconds() * self.count as i64
    }

    /// Duration covered by one bar of this interval.
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.total_seconds())
    }

    /// Whether this interval evenly tiles a day starting at midnight.
    pub fn is_day_aligned(&self) -> bool {
        let secs = self.total_seconds();
        secs > 0 && 86_400 % secs == 0
    }

    /// Whether bars of this interval can be aggregated from bars of `base`.
    ///
    /// True when both share a unit and the count is an exact multiple, or
    /// when the coarser seconds are an exact multiple of the finer seconds
    /// and both tile the day evenly.
    pub fn is_derivable_from(&self, base: &Interval) -> bool {
        if self == base {
            return false;
        }
        if self.unit == base.unit {
            return self.count > base.count && self.count % base.count == 0;
        }
        let (a, b) = (self.total_seconds(), base.total_seconds());
        a > b && a % b == 0 && self.is_day_aligned() && base.is_day_aligned()
    }

    /// Start of the aligned window containing `ts` for this interval.
    ///
    /// Alignment is relative to `anchor` (typically the session open) so a
    /// 5m interval anchored at 09:30 produces windows 09:30, 09:35, ...
    pub fn align(&self, ts: DateTime<Utc>, anchor: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.total_seconds();
        let offset = (ts - anchor).num_seconds();
        let floored = offset.div_euclid(secs) * secs;
        anchor + Duration::seconds(floored)
    }
}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Interval {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_seconds()
            .cmp(&other.total_seconds())
            .then_with(|| (self.unit as u8).cmp(&(other.unit as u8)))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

/// Parse failure for interval strings like "1m" or "30s".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIntervalError(pub String);

impl fmt::Display for ParseIntervalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid interval '{}'", self.0)
    }
}

impl std::error::Error for ParseIntervalError {}

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() < 2 {
            return Err(ParseIntervalError(s.to_string()));
        }
        let (digits, suffix) = s.split_at(s.len() - 1);
        let count: u32 = digits
            .parse()
            .map_err(|_| ParseIntervalError(s.to_string()))?;
        if count == 0 {
            return Err(ParseIntervalError(s.to_string()));
        }
        let unit = match suffix {
            "s" => IntervalUnit::Second,
            "m" => IntervalUnit::Minute,
            "h" => IntervalUnit::Hour,
            "d" => IntervalUnit::Day,
            _ => return Err(ParseIntervalError(s.to_string())),
        };
        Ok(Interval::new(unit, count))
    }
}

// =============================================================================
// MARKET DATA ITEMS
// =============================================================================

/// One OHLCV bar. `timestamp` is the interval start: a 1-minute bar with
/// timestamp T covers [T, T+60s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// OHLC sanity: low <= open,close <= high and volume >= 0.
    pub fn validate(&self) -> Result<(), BarValidationError> {
        if self.volume < 0.0 {
            return Err(BarValidationError::NegativeVolume {
                volume: self.volume,
            });
        }
        let in_range = |p: f64| p >= self.low && p <= self.high;
        if self.low > self.high || !in_range(self.open) || !in_range(self.close) {
            return Err(BarValidationError::PriceRange {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }
        Ok(())
    }
}

/// Bar-level validation failures.
#[derive(Debug, Clone, PartialEq)]
pub enum BarValidationError {
    PriceRange {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
    NegativeVolume {
        volume: f64,
    },
}

impl fmt::Display for BarValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PriceRange {
                open,
                high,
                low,
                close,
            } => write!(
                f,
                "OHLC out of range: o={} h={} l={} c={}",
                open, high, low, close
            ),
            Self::NegativeVolume { volume } => write!(f, "negative volume: {}", volume),
        }
    }
}

impl std::error::Error for BarValidationError {}

/// One trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
}

/// Top-of-book quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub timestamp: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
}

// =============================================================================
// STREAM IDENTIFICATION
// =============================================================================

/// Kind of data a stream carries.
///
/// Discriminant doubles as the merge tie-break priority: at the same
/// timestamp ticks order before quotes order before bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StreamKind {
    Tick = 0,
    Quote = 1,
    Bar = 2,
}

impl StreamKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tick => write!(f, "tick"),
            Self::Quote => write!(f, "quote"),
            Self::Bar => write!(f, "bar"),
        }
    }
}

/// Identity of one active stream: (symbol, kind, interval).
///
/// Tick and quote streams carry no interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub symbol: Symbol,
    pub kind: StreamKind,
    pub interval: Option<Interval>,
}

impl StreamId {
    pub fn bar(symbol: impl Into<Symbol>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            kind: StreamKind::Bar,
            interval: Some(interval),
        }
    }

    pub fn tick(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: StreamKind::Tick,
            interval: None,
        }
    }

    pub fn quote(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: StreamKind::Quote,
            interval: None,
        }
    }

    /// Interval seconds for tie-breaking; interval-less streams sort first.
    pub fn interval_seconds(&self) -> i64 {
        self.interval.map(|i| i.total_seconds()).unwrap_or(0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interval {
            Some(iv) => write!(f, "{}/{}/{}", self.symbol, self.kind, iv),
            None => write!(f, "{}/{}", self.symbol, self.kind),
        }
    }
}

// =============================================================================
// MERGED ITEM
// =============================================================================

/// One item flowing out of the stream coordinator's chronological merge.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketItem {
    Bar {
        symbol: Symbol,
        interval: Interval,
        bar: Bar,
    },
    Tick {
        symbol: Symbol,
        tick: Tick,
    },
    Quote {
        symbol: Symbol,
        quote: Quote,
    },
}

impl MarketItem {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Bar { bar, .. } => bar.timestamp,
            Self::Tick { tick, .. } => tick.timestamp,
            Self::Quote { quote, .. } => quote.timestamp,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Bar { symbol, .. } | Self::Tick { symbol, .. } | Self::Quote { symbol, .. } => {
                symbol
            }
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Bar { .. } => StreamKind::Bar,
            Self::Tick { .. } => StreamKind::Tick,
            Self::Quote { .. } => StreamKind::Quote,
        }
    }

    /// End of the span this item covers. Bars advance the clock to the end
    /// of their interval; ticks and quotes to their exact timestamp.
    pub fn clock_advance_target(&self) -> DateTime<Utc> {
        match self {
            Self::Bar { interval, bar, .. } => bar.timestamp + interval.duration(),
            Self::Tick { tick, .. } => tick.timestamp,
            Self::Quote { quote, .. } => quote.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_interval_ordering_by_seconds() {
        assert!(Interval::minutes(1) < Interval::minutes(5));
        assert!(Interval::minutes(60) <= Interval::hours(1));
        assert!(Interval::seconds(30) < Interval::minutes(1));
        assert!(Interval::hours(1) < Interval::days(1));
    }

    #[test]
    fn test_interval_parse_roundtrip() {
        for s in ["30s", "1m", "5m", "1h", "1d"] {
            let iv: Interval = s.parse().unwrap();
            assert_eq!(iv.to_string(), s);
        }
        assert!("0m".parse::<Interval>().is_err());
        assert!("5x".parse::<Interval>().is_err());
        assert!("m".parse::<Interval>().is_err());
    }

    #[test]
    fn test_derivable_same_unit_multiple() {
        assert!(Interval::minutes(5).is_derivable_from(&Interval::minutes(1)));
        assert!(Interval::minutes(15).is_derivable_from(&Interval::minutes(5)));
        assert!(!Interval::minutes(1).is_derivable_from(&Interval::minutes(5)));
        assert!(!Interval::minutes(7).is_derivable_from(&Interval::minutes(2)));
        // An interval never derives from itself.
        assert!(!Interval::minutes(5).is_derivable_from(&Interval::minutes(5)));
    }

    #[test]
    fn test_derivable_cross_unit_alignment() {
        assert!(Interval::hours(1).is_derivable_from(&Interval::minutes(1)));
        assert!(Interval::days(1).is_derivable_from(&Interval::hours(1)));
        assert!(Interval::minutes(1).is_derivable_from(&Interval::seconds(30)));
        // 7m does not tile the day, so cross-unit derivation is refused.
        assert!(!Interval::minutes(7).is_derivable_from(&Interval::seconds(60)));
    }

    #[test]
    fn test_interval_align_to_anchor() {
        let open = ts(34_200); // 09:30
        let iv = Interval::minutes(5);
        assert_eq!(iv.align(ts(34_200), open), ts(34_200));
        assert_eq!(iv.align(ts(34_499), open), ts(34_200));
        assert_eq!(iv.align(ts(34_500), open), ts(34_500));
    }

    #[test]
    fn test_bar_validation() {
        let good = Bar::new(ts(0), 10.0, 11.0, 9.0, 10.5, 100.0);
        assert!(good.validate().is_ok());

        let crossed = Bar::new(ts(0), 10.0, 9.0, 11.0, 10.5, 100.0);
        assert!(crossed.validate().is_err());

        let negative = Bar::new(ts(0), 10.0, 11.0, 9.0, 10.5, -1.0);
        assert!(matches!(
            negative.validate(),
            Err(BarValidationError::NegativeVolume { .. })
        ));
    }

    #[test]
    fn test_stream_kind_priority() {
        assert!(StreamKind::Tick < StreamKind::Quote);
        assert!(StreamKind::Quote < StreamKind::Bar);
    }

    #[test]
    fn test_item_clock_advance_target() {
        let bar = MarketItem::Bar {
            symbol: "AAPL".into(),
            interval: Interval::minutes(1),
            bar: Bar::new(ts(34_200), 1.0, 1.0, 1.0, 1.0, 1.0),
        };
        assert_eq!(bar.clock_advance_target(), ts(34_260));

        let tick = MarketItem::Tick {
            symbol: "AAPL".into(),
            tick: Tick {
                timestamp: ts(34_230),
                price: 1.0,
                size: 1.0,
            },
        };
        assert_eq!(tick.clock_advance_target(), ts(34_230));
    }
}
