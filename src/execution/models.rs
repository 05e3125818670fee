//! Pluggable fill-price, slippage, and commission models

use crate::types::{Bar, Side};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which bar price a simulated fill references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPriceRule {
    #[default]
    Open,
    Close,
}

impl FillPriceRule {
    pub fn price(&self, bar: &Bar) -> Decimal {
        match self {
            FillPriceRule::Open => bar.open,
            FillPriceRule::Close => bar.close,
        }
    }
}

/// Maps order characteristics to an execution-price deviation from the
/// reference price
pub trait SlippageModel: Send + Sync {
    fn adjusted_price(&self, price: Decimal, quantity: Decimal, side: Side) -> Decimal;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoSlippage;

impl SlippageModel for NoSlippage {
    fn adjusted_price(&self, price: Decimal, _quantity: Decimal, _side: Side) -> Decimal {
        price
    }
}

/// Fixed percentage against the trader
#[derive(Debug, Clone, Copy)]
pub struct PercentSlippage {
    pub rate: Decimal,
}

impl SlippageModel for PercentSlippage {
    fn adjusted_price(&self, price: Decimal, _quantity: Decimal, side: Side) -> Decimal {
        match side {
            Side::Buy => price * (Decimal::ONE + self.rate),
            Side::Sell => price * (Decimal::ONE - self.rate),
        }
    }
}

/// Uniform random percentage in [0, max_rate], always against the trader.
/// Seeded, so a backtest is reproducible.
pub struct RandomSlippage {
    max_rate: Decimal,
    rng: Mutex<StdRng>,
}

impl RandomSlippage {
    pub fn new(max_rate: Decimal, seed: u64) -> Self {
        Self {
            max_rate,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl SlippageModel for RandomSlippage {
    fn adjusted_price(&self, price: Decimal, _quantity: Decimal, side: Side) -> Decimal {
        let draw: f64 = self.rng.lock().random_range(0.0..=1.0);
        let rate = self.max_rate * Decimal::from_f64(draw).unwrap_or(Decimal::ZERO);
        match side {
            Side::Buy => price * (Decimal::ONE + rate),
            Side::Sell => price * (Decimal::ONE - rate),
        }
    }
}

/// Commission as a function of order size and price
pub trait CommissionModel: Send + Sync {
    fn commission(&self, quantity: Decimal, price: Decimal) -> Decimal;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCommission;

impl CommissionModel for NoCommission {
    fn commission(&self, _quantity: Decimal, _price: Decimal) -> Decimal {
        Decimal::ZERO
    }
}

/// Percentage of trade value
#[derive(Debug, Clone, Copy)]
pub struct PercentCommission {
    pub rate: Decimal,
}

impl CommissionModel for PercentCommission {
    fn commission(&self, quantity: Decimal, price: Decimal) -> Decimal {
        quantity * price * self.rate
    }
}

/// Per-share fee with a minimum charge
#[derive(Debug, Clone, Copy)]
pub struct PerShareCommission {
    pub per_share: Decimal,
    pub minimum: Decimal,
}

impl CommissionModel for PerShareCommission {
    fn commission(&self, quantity: Decimal, _price: Decimal) -> Decimal {
        (quantity * self.per_share).max(self.minimum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fill_price_rule() {
        let mut bar = Bar::flat("ACME", Utc::now(), dec!(10), dec!(100));
        bar.open = dec!(9.5);
        assert_eq!(FillPriceRule::Open.price(&bar), dec!(9.5));
        assert_eq!(FillPriceRule::Close.price(&bar), dec!(10));
    }

    #[test]
    fn test_percent_slippage_works_against_the_trader() {
        let model = PercentSlippage { rate: dec!(0.01) };
        assert_eq!(model.adjusted_price(dec!(100), dec!(1), Side::Buy), dec!(101));
        assert_eq!(model.adjusted_price(dec!(100), dec!(1), Side::Sell), dec!(99));
    }

    #[test]
    fn test_random_slippage_is_bounded_and_adverse() {
        let model = RandomSlippage::new(dec!(0.02), 7);
        for _ in 0..100 {
            let buy = model.adjusted_price(dec!(100), dec!(1), Side::Buy);
            assert!(buy >= dec!(100) && buy <= dec!(102));
            let sell = model.adjusted_price(dec!(100), dec!(1), Side::Sell);
            assert!(sell <= dec!(100) && sell >= dec!(98));
        }
    }

    #[test]
    fn test_random_slippage_reproducible_with_seed() {
        let a = RandomSlippage::new(dec!(0.02), 42);
        let b = RandomSlippage::new(dec!(0.02), 42);
        for _ in 0..10 {
            assert_eq!(
                a.adjusted_price(dec!(50), dec!(1), Side::Buy),
                b.adjusted_price(dec!(50), dec!(1), Side::Buy)
            );
        }
    }

    #[test]
    fn test_commission_models() {
        assert_eq!(NoCommission.commission(dec!(10), dec!(100)), Decimal::ZERO);
        assert_eq!(
            PercentCommission { rate: dec!(0.001) }.commission(dec!(10), dec!(100)),
            dec!(1)
        );
        let per_share = PerShareCommission {
            per_share: dec!(0.01),
            minimum: dec!(1),
        };
        assert_eq!(per_share.commission(dec!(10), dec!(100)), dec!(1)); // minimum kicks in
        assert_eq!(per_share.commission(dec!(500), dec!(100)), dec!(5));
    }
}
