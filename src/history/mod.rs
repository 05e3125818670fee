//! Historical bar window
//!
//! [`MarketHistory`] is the append-only store the data feeds write into;
//! strategies read it through a [`HistoryView`] scoped to the timestamp of
//! the event being dispatched. The view clamps every query to that
//! timestamp, so requesting data from the future is impossible by
//! construction.

use crate::error::{EngineError, Result};
use crate::types::Bar;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Append-only per-instrument bar store
pub struct MarketHistory {
    bars: RwLock<HashMap<String, Vec<Bar>>>,
}

impl MarketHistory {
    pub fn new() -> Self {
        Self {
            bars: RwLock::new(HashMap::new()),
        }
    }

    /// Append a bar. Fails with `MalformedInput` if the bar's timestamp is
    /// not strictly greater than the last recorded one for the instrument;
    /// feeds drop and log such records instead of publishing them.
    pub fn record(&self, bar: Bar) -> Result<()> {
        let mut bars = self.bars.write();
        let series = bars.entry(bar.instrument.clone()).or_default();
        if let Some(last) = series.last() {
            if bar.timestamp <= last.timestamp {
                return Err(EngineError::MalformedInput(format!(
                    "out-of-order bar for {}: {} is not after {}",
                    bar.instrument, bar.timestamp, last.timestamp
                )));
            }
        }
        series.push(bar);
        Ok(())
    }

    pub fn len(&self, instrument: &str) -> usize {
        self.bars.read().get(instrument).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.bars.read().values().all(Vec::is_empty)
    }

    /// A read-only view clamped to `now`, the timestamp of the event
    /// currently being dispatched.
    pub fn view_at(&self, now: DateTime<Utc>) -> HistoryView<'_> {
        HistoryView { history: self, now }
    }
}

impl Default for MarketHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only query capability handed to strategies
pub struct HistoryView<'a> {
    history: &'a MarketHistory,
    now: DateTime<Utc>,
}

impl HistoryView<'_> {
    /// Timestamp this view is clamped to
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Last `n` bars for the instrument, most recent last.
    ///
    /// Fails with `InsufficientHistory` when fewer than `n` bars exist at
    /// or before the view's timestamp.
    pub fn latest(&self, instrument: &str, n: usize) -> Result<Vec<Bar>> {
        let bars = self.history.bars.read();
        let visible: Vec<Bar> = bars
            .get(instrument)
            .map(|series| {
                series
                    .iter()
                    .filter(|b| b.timestamp <= self.now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if visible.len() < n {
            return Err(EngineError::InsufficientHistory {
                instrument: instrument.to_string(),
                requested: n,
                available: visible.len(),
            });
        }
        Ok(visible[visible.len() - n..].to_vec())
    }

    /// Up to `lookback` bars with timestamp <= `timestamp`, most recent
    /// last. The cutoff is clamped to the view's own timestamp, so asking
    /// "as of the future" degrades to "as of now".
    pub fn as_of(&self, instrument: &str, timestamp: DateTime<Utc>, lookback: usize) -> Vec<Bar> {
        let cutoff = timestamp.min(self.now);
        let bars = self.history.bars.read();
        let visible: Vec<Bar> = bars
            .get(instrument)
            .map(|series| {
                series
                    .iter()
                    .filter(|b| b.timestamp <= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let skip = visible.len().saturating_sub(lookback);
        visible[skip..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()
    }

    fn bar(minute: u32, close: rust_decimal::Decimal) -> Bar {
        Bar::flat("ACME", ts(minute), close, dec!(1000))
    }

    #[test]
    fn test_record_rejects_out_of_order_bars() {
        let history = MarketHistory::new();
        history.record(bar(1, dec!(10))).unwrap();
        history.record(bar(2, dec!(11))).unwrap();

        let err = history.record(bar(2, dec!(12))).unwrap_err();
        assert!(matches!(err, EngineError::MalformedInput(_)));
        let err = history.record(bar(1, dec!(12))).unwrap_err();
        assert!(matches!(err, EngineError::MalformedInput(_)));
        assert_eq!(history.len("ACME"), 2);
    }

    #[test]
    fn test_latest_returns_most_recent_last() {
        let history = MarketHistory::new();
        for (m, price) in [(1, dec!(10)), (2, dec!(11)), (3, dec!(12))] {
            history.record(bar(m, price)).unwrap();
        }

        let view = history.view_at(ts(3));
        let bars = view.latest("ACME", 2).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, dec!(11));
        assert_eq!(bars[1].close, dec!(12));
    }

    #[test]
    fn test_latest_fails_with_insufficient_history() {
        let history = MarketHistory::new();
        history.record(bar(1, dec!(10))).unwrap();

        let view = history.view_at(ts(1));
        let err = view.latest("ACME", 3).unwrap_err();
        match err {
            EngineError::InsufficientHistory {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 3);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_view_cannot_see_past_its_timestamp() {
        let history = MarketHistory::new();
        for (m, price) in [(1, dec!(10)), (2, dec!(11)), (3, dec!(12))] {
            history.record(bar(m, price)).unwrap();
        }

        // View clamped to minute 2: the minute-3 bar must be invisible,
        // even when asked for explicitly.
        let view = history.view_at(ts(2));
        let bars = view.latest("ACME", 2).unwrap();
        assert_eq!(bars[1].close, dec!(11));

        let as_of = view.as_of("ACME", ts(3), 10);
        assert_eq!(as_of.len(), 2);
        assert_eq!(as_of.last().unwrap().close, dec!(11));
    }

    #[test]
    fn test_as_of_respects_lookback() {
        let history = MarketHistory::new();
        for m in 1..=5 {
            history.record(bar(m, dec!(10) + rust_decimal::Decimal::from(m))).unwrap();
        }

        let view = history.view_at(ts(5));
        let bars = view.as_of("ACME", ts(4), 2);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, ts(3));
        assert_eq!(bars[1].timestamp, ts(4));
    }

    #[test]
    fn test_unknown_instrument() {
        let history = MarketHistory::new();
        let view = history.view_at(ts(1));
        assert!(view.latest("GHOST", 1).is_err());
        assert!(view.as_of("GHOST", ts(1), 5).is_empty());
    }
}
