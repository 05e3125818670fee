//! N-bar momentum strategy

use super::{Action, Strategy};
use crate::error::{EngineError, Result};
use crate::events::SignalPayload;
use crate::history::HistoryView;
use crate::types::{Bar, Direction};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::debug;

/// Goes long when price momentum over the window is positive, exits when
/// it flips. Emits signals only; position sizing is the portfolio's job.
pub struct MomentumStrategy {
    period: usize,
    /// Instruments we currently hold a long stance on
    in_market: HashSet<String>,
}

impl MomentumStrategy {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            in_market: HashSet::new(),
        }
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    fn on_market(&mut self, bar: &Bar, history: &HistoryView<'_>) -> Result<Vec<Action>> {
        let window = match history.latest(&bar.instrument, self.period + 1) {
            Ok(window) => window,
            // Not enough bars yet: expected during warm-up, no action.
            Err(EngineError::InsufficientHistory { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let momentum = window[self.period].close - window[0].close;
        let holding = self.in_market.contains(&bar.instrument);

        if momentum > Decimal::ZERO && !holding {
            debug!("momentum {} on {}: going long", momentum, bar.instrument);
            self.in_market.insert(bar.instrument.clone());
            return Ok(vec![Action::Signal(SignalPayload::new(
                &bar.instrument,
                Direction::Long,
                Decimal::ONE,
            ))]);
        }

        if momentum <= Decimal::ZERO && holding {
            debug!("momentum {} on {}: exiting", momentum, bar.instrument);
            self.in_market.remove(&bar.instrument);
            return Ok(vec![Action::Signal(SignalPayload::new(
                &bar.instrument,
                Direction::Exit,
                Decimal::ONE,
            ))]);
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MarketHistory;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn record(history: &MarketHistory, minute: u32, price: Decimal) -> Bar {
        let bar = Bar::flat(
            "ACME",
            Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
            price,
            dec!(1000),
        );
        history.record(bar.clone()).unwrap();
        bar
    }

    #[test]
    fn test_no_action_during_warmup() {
        let history = MarketHistory::new();
        let mut strategy = MomentumStrategy::new(3);

        let bar = record(&history, 1, dec!(10));
        let view = history.view_at(bar.timestamp);
        assert!(strategy.on_market(&bar, &view).unwrap().is_empty());
    }

    #[test]
    fn test_long_on_positive_momentum_then_exit() {
        let history = MarketHistory::new();
        let mut strategy = MomentumStrategy::new(2);

        record(&history, 1, dec!(10));
        record(&history, 2, dec!(10.5));
        let up = record(&history, 3, dec!(11));
        let view = history.view_at(up.timestamp);
        let actions = strategy.on_market(&up, &view).unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Signal(s) => assert_eq!(s.direction, Direction::Long),
            other => panic!("unexpected action: {other:?}"),
        }

        // Still long, momentum still positive: no duplicate signal.
        let flat = record(&history, 4, dec!(11.5));
        let view = history.view_at(flat.timestamp);
        assert!(strategy.on_market(&flat, &view).unwrap().is_empty());

        // Momentum flips negative: exit.
        let down = record(&history, 5, dec!(9));
        let view = history.view_at(down.timestamp);
        let actions = strategy.on_market(&down, &view).unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Signal(s) => assert_eq!(s.direction, Direction::Exit),
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
