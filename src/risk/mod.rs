//! Order risk gate
//!
//! A pure check sitting between the portfolio and execution. On `Reject`
//! the order never reaches the venue and the rejection is published as an
//! order update with its reason; there is no silent drop path.

use crate::events::OrderPayload;
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskVerdict {
    Pass,
    Reject(String),
}

pub trait RiskGate: Send + Sync {
    fn name(&self) -> &str;

    /// `mark` is the last known price for the order's instrument, when the
    /// execution handler has one; notional checks are skipped without it.
    fn check(&self, order: &OrderPayload, mark: Option<Decimal>) -> RiskVerdict;
}

/// Static per-order limits
#[derive(Debug, Clone, Default)]
pub struct LimitRiskGate {
    pub max_order_quantity: Option<Decimal>,
    pub max_order_notional: Option<Decimal>,
}

impl RiskGate for LimitRiskGate {
    fn name(&self) -> &str {
        "limit-risk-gate"
    }

    fn check(&self, order: &OrderPayload, mark: Option<Decimal>) -> RiskVerdict {
        if let Some(max_qty) = self.max_order_quantity {
            if order.quantity > max_qty {
                return RiskVerdict::Reject(format!(
                    "order quantity {} exceeds limit {}",
                    order.quantity, max_qty
                ));
            }
        }

        if let Some(max_notional) = self.max_order_notional {
            let reference = order.limit_price.or(mark);
            if let Some(price) = reference {
                let notional = order.quantity * price;
                if notional > max_notional {
                    return RiskVerdict::Reject(format!(
                        "order notional {} exceeds limit {}",
                        notional, max_notional
                    ));
                }
            }
        }

        RiskVerdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn test_passes_within_limits() {
        let gate = LimitRiskGate {
            max_order_quantity: Some(dec!(100)),
            max_order_notional: Some(dec!(10000)),
        };
        let order = OrderPayload::market("ACME", Side::Buy, dec!(50));
        assert_eq!(gate.check(&order, Some(dec!(20))), RiskVerdict::Pass);
    }

    #[test]
    fn test_rejects_oversized_quantity_with_reason() {
        let gate = LimitRiskGate {
            max_order_quantity: Some(dec!(10)),
            max_order_notional: None,
        };
        let order = OrderPayload::market("ACME", Side::Buy, dec!(11));
        match gate.check(&order, None) {
            RiskVerdict::Reject(reason) => assert!(reason.contains("quantity")),
            RiskVerdict::Pass => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_rejects_oversized_notional() {
        let gate = LimitRiskGate {
            max_order_quantity: None,
            max_order_notional: Some(dec!(100)),
        };
        let order = OrderPayload::market("ACME", Side::Buy, dec!(11));
        match gate.check(&order, Some(dec!(10))) {
            RiskVerdict::Reject(reason) => assert!(reason.contains("notional")),
            RiskVerdict::Pass => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_notional_check_uses_limit_price_when_present() {
        let gate = LimitRiskGate {
            max_order_quantity: None,
            max_order_notional: Some(dec!(100)),
        };
        let order = OrderPayload::limit("ACME", Side::Buy, dec!(5), dec!(30));
        assert!(matches!(
            gate.check(&order, Some(dec!(10))),
            RiskVerdict::Reject(_)
        ));
    }

    #[test]
    fn test_notional_check_skipped_without_price() {
        let gate = LimitRiskGate {
            max_order_quantity: None,
            max_order_notional: Some(dec!(1)),
        };
        let order = OrderPayload::market("ACME", Side::Buy, dec!(1000));
        assert_eq!(gate.check(&order, None), RiskVerdict::Pass);
    }
}
