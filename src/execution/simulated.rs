//! Simulated execution for backtests
//!
//! Orders are held pending and resolved against the *next* bar for their
//! instrument, never the bar whose processing produced them. That is the
//! structural half of the lookahead prohibition: the replay feed's pacing
//! guarantees no later bar exists in the system while an order is being
//! decided, and this matcher refuses to fill against any bar whose
//! timestamp is not strictly greater than the order's acceptance time.

use crate::bus::{BusHandle, EventHandler};
use crate::error::Result;
use crate::events::{
    Boundary, Event, EventPayload, FillPayload, OrderPayload, OrderUpdatePayload,
};
use crate::execution::models::{CommissionModel, FillPriceRule, SlippageModel};
use crate::risk::{RiskGate, RiskVerdict};
use crate::types::{Bar, OrderKind, OrderState, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;
use tracing::{debug, info, warn};

struct Pending {
    order: OrderPayload,
    accepted_at: DateTime<Utc>,
    remaining: Decimal,
    state: OrderState,
}

#[derive(Default)]
struct SimState {
    pending: Vec<Pending>,
    marks: HashMap<String, Decimal>,
    cancelled: usize,
}

/// Backtest matching engine
pub struct SimulatedExecution {
    state: Mutex<SimState>,
    fill_rule: FillPriceRule,
    slippage: Box<dyn SlippageModel>,
    commission: Box<dyn CommissionModel>,
    /// Fraction of a bar's volume fillable per bar; `None` = unlimited
    volume_limit: Option<Decimal>,
    risk_gate: Option<Box<dyn RiskGate>>,
}

impl SimulatedExecution {
    pub fn new(
        fill_rule: FillPriceRule,
        slippage: Box<dyn SlippageModel>,
        commission: Box<dyn CommissionModel>,
        volume_limit: Option<Decimal>,
        risk_gate: Option<Box<dyn RiskGate>>,
    ) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            fill_rule,
            slippage,
            commission,
            volume_limit,
            risk_gate,
        }
    }

    /// Orders resolved as Cancelled at stream end
    pub fn cancelled_orders(&self) -> usize {
        self.state.lock().cancelled
    }

    pub fn pending_orders(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn accept_order(
        &self,
        order: &OrderPayload,
        accepted_at: DateTime<Utc>,
        bus: &BusHandle,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(gate) = &self.risk_gate {
            let mark = state.marks.get(&order.instrument).copied();
            if let RiskVerdict::Reject(reason) = gate.check(order, mark) {
                warn!(
                    "risk gate '{}' rejected order {}: {}",
                    gate.name(),
                    order.order_id,
                    reason
                );
                bus.publish(
                    accepted_at,
                    EventPayload::OrderUpdate(OrderUpdatePayload {
                        order_id: order.order_id,
                        exchange_order_id: None,
                        status: OrderState::Rejected,
                        filled_quantity: Decimal::ZERO,
                        reason: Some(reason),
                    }),
                )?;
                return Ok(());
            }
        }

        state.pending.push(Pending {
            order: order.clone(),
            accepted_at,
            remaining: order.quantity,
            state: OrderState::Submitted,
        });
        debug!(
            "order {} accepted at {} ({} pending)",
            order.order_id,
            accepted_at,
            state.pending.len()
        );
        bus.publish(
            accepted_at,
            EventPayload::OrderUpdate(OrderUpdatePayload {
                order_id: order.order_id,
                exchange_order_id: None,
                status: OrderState::Submitted,
                filled_quantity: Decimal::ZERO,
                reason: None,
            }),
        )?;
        Ok(())
    }

    /// Price a pending order against a bar, or `None` if it cannot fill.
    ///
    /// Market orders fill at the configured bar price adjusted by the
    /// slippage model. Limit orders fill at the bar price if it already
    /// satisfies the limit, at the limit price if the bar traded through
    /// it, and carry no slippage (the limit is the protection).
    fn fill_price(&self, pending: &Pending, bar: &Bar) -> Option<(Decimal, Decimal)> {
        let base = self.fill_rule.price(bar);
        match pending.order.kind {
            OrderKind::Market => {
                let exec =
                    self.slippage
                        .adjusted_price(base, pending.remaining, pending.order.side);
                Some((exec, (exec - base).abs()))
            }
            OrderKind::Limit => {
                let limit = pending.order.limit_price?;
                let exec = match pending.order.side {
                    Side::Buy if base <= limit => base,
                    Side::Buy if bar.low <= limit => limit,
                    Side::Sell if base >= limit => base,
                    Side::Sell if bar.high >= limit => limit,
                    _ => return None,
                };
                Some((exec, Decimal::ZERO))
            }
        }
    }

    fn settle_against(&self, bar: &Bar, bus: &BusHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.marks.insert(bar.instrument.clone(), bar.close);

        for pending in &mut state.pending {
            if pending.order.instrument != bar.instrument {
                continue;
            }
            // Never fill against data from the order's own decision time.
            if pending.accepted_at >= bar.timestamp {
                continue;
            }

            let Some((exec_price, per_unit_slip)) = self.fill_price(pending, bar) else {
                continue;
            };

            let fill_qty = match self.volume_limit {
                Some(limit) => {
                    let cap = bar.volume * limit;
                    if cap <= Decimal::ZERO {
                        continue;
                    }
                    pending.remaining.min(cap)
                }
                None => pending.remaining,
            };

            pending.remaining -= fill_qty;
            pending.state = if pending.remaining.is_zero() {
                OrderState::Filled
            } else {
                OrderState::PartiallyFilled
            };

            let commission = self.commission.commission(fill_qty, exec_price);
            info!(
                "order {} {} {} {} @ {} (commission {})",
                pending.order.order_id,
                pending.state,
                fill_qty,
                bar.instrument,
                exec_price,
                commission
            );
            bus.publish(
                bar.timestamp,
                EventPayload::Fill(FillPayload {
                    fill_id: Uuid::new_v4(),
                    exchange_fill_id: None,
                    order_id: pending.order.order_id,
                    instrument: bar.instrument.clone(),
                    side: pending.order.side,
                    quantity: fill_qty,
                    price: exec_price,
                    commission,
                    slippage: per_unit_slip * fill_qty,
                    timestamp: bar.timestamp,
                }),
            )?;
            bus.publish(
                bar.timestamp,
                EventPayload::OrderUpdate(OrderUpdatePayload {
                    order_id: pending.order.order_id,
                    exchange_order_id: None,
                    status: pending.state,
                    filled_quantity: pending.order.quantity - pending.remaining,
                    reason: None,
                }),
            )?;
        }

        state.pending.retain(|p| p.state.is_active());
        Ok(())
    }

    /// Orders with no subsequent bar by stream end resolve as Cancelled,
    /// never silently dropped.
    fn cancel_remaining(&self, timestamp: DateTime<Utc>, bus: &BusHandle) -> Result<()> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        state.cancelled += pending.len();
        for p in pending {
            warn!(
                "order {} still pending at stream end, resolving as cancelled",
                p.order.order_id
            );
            bus.publish(
                timestamp,
                EventPayload::OrderUpdate(OrderUpdatePayload {
                    order_id: p.order.order_id,
                    exchange_order_id: None,
                    status: OrderState::Cancelled,
                    filled_quantity: p.order.quantity - p.remaining,
                    reason: Some("stream ended before fill".to_string()),
                }),
            )?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SimulatedExecution {
    fn name(&self) -> &str {
        "simulated-execution"
    }

    async fn handle(&self, event: &Event, bus: &BusHandle) -> Result<()> {
        match &event.payload {
            EventPayload::Order(order) => self.accept_order(order, event.timestamp, bus),
            EventPayload::Market(m) => self.settle_against(&m.bar, bus),
            EventPayload::StreamBoundary(Boundary::End) => {
                self.cancel_remaining(event.timestamp, bus)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::events::EventKind;
    use crate::execution::models::{NoCommission, NoSlippage};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()
    }

    fn bar(minute: u32, price: Decimal) -> Bar {
        Bar::flat("ACME", ts(minute), price, dec!(1000))
    }

    /// Collects fills and order updates dispatched by the bus
    struct Sink {
        fills: Arc<Mutex<Vec<FillPayload>>>,
        updates: Arc<Mutex<Vec<OrderUpdatePayload>>>,
    }

    #[async_trait]
    impl EventHandler for Sink {
        fn name(&self) -> &str {
            "sink"
        }
        async fn handle(&self, event: &Event, _bus: &BusHandle) -> Result<()> {
            match &event.payload {
                EventPayload::Fill(f) => self.fills.lock().push(f.clone()),
                EventPayload::OrderUpdate(u) => self.updates.lock().push(u.clone()),
                _ => {}
            }
            Ok(())
        }
    }

    type Collected = (
        Arc<Mutex<Vec<FillPayload>>>,
        Arc<Mutex<Vec<OrderUpdatePayload>>>,
    );

    /// Run a scripted event sequence through a bus with the execution
    /// handler under test and return what it emitted.
    async fn run_script(
        execution: SimulatedExecution,
        script: Vec<(DateTime<Utc>, EventPayload)>,
    ) -> (SimulatedExecution, Collected) {
        let execution = Arc::new(execution);
        let fills = Arc::new(Mutex::new(Vec::new()));
        let updates = Arc::new(Mutex::new(Vec::new()));

        let mut bus = EventBus::new();
        for kind in [EventKind::Order, EventKind::Market, EventKind::StreamBoundary] {
            bus.subscribe(kind, Arc::clone(&execution) as Arc<dyn EventHandler>)
                .unwrap();
        }
        let sink = Arc::new(Sink {
            fills: Arc::clone(&fills),
            updates: Arc::clone(&updates),
        });
        bus.subscribe(EventKind::Fill, Arc::clone(&sink) as Arc<dyn EventHandler>)
            .unwrap();
        bus.subscribe(EventKind::OrderUpdate, sink).unwrap();

        let handle = bus.handle();
        let bus_task = tokio::spawn(bus.run());
        for (timestamp, payload) in script {
            handle.publish(timestamp, payload).unwrap();
        }
        handle
            .publish(ts(59), EventPayload::StreamBoundary(Boundary::End))
            .unwrap();
        bus_task.await.unwrap().unwrap();

        let execution = Arc::try_unwrap(execution)
            .unwrap_or_else(|_| panic!("execution still shared"));
        (execution, (fills, updates))
    }

    fn zero_cost_execution() -> SimulatedExecution {
        SimulatedExecution::new(
            FillPriceRule::Open,
            Box::new(NoSlippage),
            Box::new(NoCommission),
            None,
            None,
        )
    }

    fn market_event(minute: u32, price: Decimal) -> (DateTime<Utc>, EventPayload) {
        (
            ts(minute),
            EventPayload::Market(crate::events::MarketPayload {
                bar: bar(minute, price),
            }),
        )
    }

    #[tokio::test]
    async fn test_order_fills_on_next_bar_never_its_own() {
        let order = OrderPayload::market("ACME", Side::Buy, dec!(1));
        let (_, (fills, _)) = run_script(
            zero_cost_execution(),
            vec![
                market_event(1, dec!(10)),
                // Decided while processing minute 1.
                (ts(1), EventPayload::Order(order)),
                market_event(2, dec!(11)),
            ],
        )
        .await;

        let fills = fills.lock();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(11), "must fill at the NEXT bar's price");
        assert_eq!(fills[0].timestamp, ts(2));
        assert!(fills[0].timestamp > ts(1), "lookahead prohibition");
    }

    #[tokio::test]
    async fn test_unfilled_order_cancelled_at_stream_end() {
        let order = OrderPayload::market("ACME", Side::Buy, dec!(1));
        let order_id = order.order_id;
        let (execution, (fills, updates)) = run_script(
            zero_cost_execution(),
            vec![
                market_event(1, dec!(10)),
                (ts(1), EventPayload::Order(order)),
                // No further bar: the order can never fill.
            ],
        )
        .await;

        assert!(fills.lock().is_empty());
        assert_eq!(execution.cancelled_orders(), 1);
        let updates = updates.lock();
        let last = updates.iter().filter(|u| u.order_id == order_id).last().unwrap();
        assert_eq!(last.status, OrderState::Cancelled);
        assert!(last.reason.as_deref().unwrap().contains("stream ended"));
    }

    #[tokio::test]
    async fn test_limit_buy_fills_only_when_crossed() {
        let order = OrderPayload::limit("ACME", Side::Buy, dec!(2), dec!(9.5));
        let (_, (fills, _)) = run_script(
            zero_cost_execution(),
            vec![
                market_event(1, dec!(10)),
                (ts(1), EventPayload::Order(order)),
                market_event(2, dec!(10.2)), // above limit: no fill
                market_event(3, dec!(9.4)),  // through the limit: fills
            ],
        )
        .await;

        let fills = fills.lock();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].timestamp, ts(3));
        assert_eq!(fills[0].price, dec!(9.4));
    }

    #[tokio::test]
    async fn test_volume_cap_produces_partial_fills() {
        let execution = SimulatedExecution::new(
            FillPriceRule::Open,
            Box::new(NoSlippage),
            Box::new(NoCommission),
            Some(dec!(0.003)), // 3 units per 1000-volume bar
            None,
        );
        let order = OrderPayload::market("ACME", Side::Buy, dec!(5));
        let order_id = order.order_id;
        let (_, (fills, updates)) = run_script(
            execution,
            vec![
                market_event(1, dec!(10)),
                (ts(1), EventPayload::Order(order)),
                market_event(2, dec!(11)),
                market_event(3, dec!(12)),
            ],
        )
        .await;

        let fills = fills.lock();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].quantity, dec!(3));
        assert_eq!(fills[1].quantity, dec!(2));

        let updates = updates.lock();
        let statuses: Vec<OrderState> = updates
            .iter()
            .filter(|u| u.order_id == order_id)
            .map(|u| u.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                OrderState::Submitted,
                OrderState::PartiallyFilled,
                OrderState::Filled
            ]
        );
    }

    #[tokio::test]
    async fn test_risk_gate_rejection_is_reported_not_dropped() {
        let execution = SimulatedExecution::new(
            FillPriceRule::Open,
            Box::new(NoSlippage),
            Box::new(NoCommission),
            None,
            Some(Box::new(crate::risk::LimitRiskGate {
                max_order_quantity: Some(dec!(1)),
                max_order_notional: None,
            })),
        );
        let order = OrderPayload::market("ACME", Side::Buy, dec!(100));
        let order_id = order.order_id;
        let (execution, (fills, updates)) = run_script(
            execution,
            vec![
                market_event(1, dec!(10)),
                (ts(1), EventPayload::Order(order)),
                market_event(2, dec!(11)),
            ],
        )
        .await;

        assert!(fills.lock().is_empty());
        assert_eq!(execution.pending_orders(), 0);
        let updates = updates.lock();
        let update = updates.iter().find(|u| u.order_id == order_id).unwrap();
        assert_eq!(update.status, OrderState::Rejected);
        assert!(update.reason.is_some());
    }

    #[tokio::test]
    async fn test_commission_and_slippage_applied() {
        let execution = SimulatedExecution::new(
            FillPriceRule::Open,
            Box::new(crate::execution::models::PercentSlippage { rate: dec!(0.01) }),
            Box::new(crate::execution::models::PercentCommission { rate: dec!(0.001) }),
            None,
            None,
        );
        let order = OrderPayload::market("ACME", Side::Buy, dec!(10));
        let (_, (fills, _)) = run_script(
            execution,
            vec![
                market_event(1, dec!(100)),
                (ts(1), EventPayload::Order(order)),
                market_event(2, dec!(100)),
            ],
        )
        .await;

        let fills = fills.lock();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(101)); // 100 * 1.01
        assert_eq!(fills[0].commission, dec!(1.010)); // 10 * 101 * 0.001
        assert_eq!(fills[0].slippage, dec!(10)); // 1 per unit * 10
    }
}
