//! Portfolio: the authoritative ledger of cash and positions
//!
//! Turns signals into concrete orders through a pluggable sizing policy,
//! applies fills, and marks positions to market. The ledger is the only
//! shared mutable state in the system; it lives behind one mutex and every
//! mutation happens inside a handler body on the dispatch loop, never in
//! off-loop work, so state transitions are serialized with the event
//! stream.


use crate::bus::{BusHandle, EventHandler};
use crate::error::{EngineError, Result};
use crate::events::{
    Event, EventPayload, FillPayload, OrderPayload, PortfolioUpdatePayload, PositionSnapshot,
    SignalPayload,
};
use crate::types::{Direction, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

/// One instrument's holding. Quantity is signed: negative means short.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Position {
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub realized_pnl: Decimal,
}

/// Read-only view of the ledger handed to sizing policies and reported by
/// the engine at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub cash: Decimal,
    pub equity: Decimal,
    pub realized_pnl: Decimal,
    pub positions: HashMap<String, Position>,
    pub marks: HashMap<String, Decimal>,
}

impl LedgerSummary {
    pub fn position_quantity(&self, instrument: &str) -> Decimal {
        self.positions
            .get(instrument)
            .map_or(Decimal::ZERO, |p| p.quantity)
    }

    pub fn mark(&self, instrument: &str) -> Option<Decimal> {
        self.marks.get(instrument).copied()
    }
}

/// Position-sizing policy: turns signal intent into side and quantity
pub trait SizingPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// `None` means no order (already at target, below lot size, flat on
    /// exit). Cash feasibility is checked by the portfolio afterwards.
    fn order_for(
        &self,
        signal: &SignalPayload,
        ledger: &LedgerSummary,
    ) -> Option<(Side, Decimal)>;
}

/// Fixed quantity per signal; exits close the whole position
pub struct FixedQuantity {
    pub quantity: Decimal,
}

impl SizingPolicy for FixedQuantity {
    fn name(&self) -> &str {
        "fixed-quantity"
    }

    fn order_for(&self, signal: &SignalPayload, ledger: &LedgerSummary) -> Option<(Side, Decimal)> {
        match signal.direction {
            Direction::Long => Some((Side::Buy, self.quantity)),
            Direction::Short => Some((Side::Sell, self.quantity)),
            Direction::Exit => close_position(ledger.position_quantity(&signal.instrument)),
        }
    }
}

/// Target a fraction of total equity, rounded down to whole lots
///
/// The signal's strength scales the weight. Exits close the exact held
/// quantity; lot rounding does not apply to closing.
pub struct TargetWeight {
    pub weight: Decimal,
    pub lot_size: Decimal,
}

impl SizingPolicy for TargetWeight {
    fn name(&self) -> &str {
        "target-weight"
    }

    fn order_for(&self, signal: &SignalPayload, ledger: &LedgerSummary) -> Option<(Side, Decimal)> {
        let mark = ledger.mark(&signal.instrument)?;
        if mark <= Decimal::ZERO {
            return None;
        }

        let target_qty = match signal.direction {
            Direction::Long => ledger.equity * self.weight * signal.strength / mark,
            Direction::Short => -(ledger.equity * self.weight * signal.strength / mark),
            Direction::Exit => {
                return close_position(ledger.position_quantity(&signal.instrument));
            }
        };

        let current = ledger.position_quantity(&signal.instrument);
        let diff = target_qty - current;

        // Round the difference down to a whole number of lots; below one
        // lot there is nothing to do.
        let lots = (diff.abs() / self.lot_size).floor();
        if lots.is_zero() {
            return None;
        }
        let quantity = lots * self.lot_size;
        let side = if diff > Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        };
        Some((side, quantity))
    }
}

fn close_position(held: Decimal) -> Option<(Side, Decimal)> {
    if held.is_zero() {
        return None;
    }
    let side = if held > Decimal::ZERO {
        Side::Sell
    } else {
        Side::Buy
    };
    Some((side, held.abs()))
}

struct Ledger {
    cash: Decimal,
    initial_cash: Decimal,
    positions: HashMap<String, Position>,
    marks: HashMap<String, Decimal>,
}

impl Ledger {
    fn equity(&self) -> Decimal {
        let mut total = self.cash;
        for (instrument, position) in &self.positions {
            if position.quantity.is_zero() {
                continue;
            }
            // Fall back to cost basis until a mark exists.
            let mark = self
                .marks
                .get(instrument)
                .copied()
                .unwrap_or(position.avg_cost);
            total += position.quantity * mark;
        }
        total
    }

    fn realized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            cash: self.cash,
            equity: self.equity(),
            realized_pnl: self.realized_pnl(),
            positions: self.positions.clone(),
            marks: self.marks.clone(),
        }
    }

    /// Apply one fill: cash, position quantity, average cost, realized P&L.
    fn apply_fill(&mut self, fill: &FillPayload) {
        let trade_value = fill.quantity * fill.price;
        match fill.side {
            Side::Buy => self.cash -= trade_value + fill.commission,
            Side::Sell => self.cash += trade_value - fill.commission,
        }

        let position = self.positions.entry(fill.instrument.clone()).or_default();
        let signed_fill = match fill.side {
            Side::Buy => fill.quantity,
            Side::Sell => -fill.quantity,
        };
        let old_qty = position.quantity;
        let new_qty = old_qty + signed_fill;

        if old_qty.is_zero() || (old_qty > Decimal::ZERO) == (signed_fill > Decimal::ZERO) {
            // Opening or extending: average the cost basis.
            let total_cost = old_qty.abs() * position.avg_cost + fill.quantity * fill.price;
            position.avg_cost = total_cost / new_qty.abs();
        } else {
            // Reducing (possibly through zero): realize P&L on the closed
            // portion at the old basis.
            let closed = signed_fill.abs().min(old_qty.abs());
            let per_unit = if old_qty > Decimal::ZERO {
                fill.price - position.avg_cost
            } else {
                position.avg_cost - fill.price
            };
            position.realized_pnl += per_unit * closed;
            if new_qty.is_zero() {
                position.avg_cost = Decimal::ZERO;
            } else if (new_qty > Decimal::ZERO) != (old_qty > Decimal::ZERO) {
                // Crossed through zero: the remainder opens at fill price.
                position.avg_cost = fill.price;
            }
        }
        position.quantity = new_qty;
    }
}

/// Portfolio component: signals in, orders out, fills applied
pub struct Portfolio {
    ledger: Mutex<Ledger>,
    sizing: Box<dyn SizingPolicy>,
    /// How far below zero cash may go before an order is rejected
    margin_tolerance: Decimal,
}

impl Portfolio {
    pub fn new(initial_cash: Decimal, sizing: Box<dyn SizingPolicy>, margin_tolerance: Decimal) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                cash: initial_cash,
                initial_cash,
                positions: HashMap::new(),
                marks: HashMap::new(),
            }),
            sizing,
            margin_tolerance,
        }
    }

    pub fn summary(&self) -> LedgerSummary {
        self.ledger.lock().summary()
    }

    pub fn initial_cash(&self) -> Decimal {
        self.ledger.lock().initial_cash
    }

    /// Mark-to-market update; no cash or position change.
    pub fn on_market(&self, instrument: &str, price: Decimal) {
        self.ledger
            .lock()
            .marks
            .insert(instrument.to_string(), price);
    }

    /// Size a signal into an order, or reject it.
    ///
    /// Rejects (never clamps) a buy whose estimated cost would push cash
    /// below the margin tolerance, with a typed `InsufficientFunds`; the
    /// ledger is untouched in that case.
    pub fn on_signal(&self, signal: &SignalPayload) -> Result<Option<OrderPayload>> {
        let summary = self.ledger.lock().summary();
        let Some((side, quantity)) = self.sizing.order_for(signal, &summary) else {
            return Ok(None);
        };
        if quantity <= Decimal::ZERO {
            return Ok(None);
        }

        if side == Side::Buy {
            let Some(mark) = summary.mark(&signal.instrument) else {
                warn!(
                    "no mark price for {}, cannot size buy order",
                    signal.instrument
                );
                return Ok(None);
            };
            let estimated_cost = quantity * mark;
            if estimated_cost > summary.cash + self.margin_tolerance {
                return Err(EngineError::InsufficientFunds {
                    required: estimated_cost,
                    available: summary.cash,
                });
            }
        }

        Ok(Some(OrderPayload::market(
            &signal.instrument,
            side,
            quantity,
        )))
    }

    /// Apply a fill and return the resulting snapshot.
    ///
    /// A breach of the cash invariant beyond the margin tolerance is a
    /// fatal `LedgerViolation`: continuing would produce silently wrong
    /// results.
    pub fn on_fill(&self, fill: &FillPayload) -> Result<PortfolioUpdatePayload> {
        let mut ledger = self.ledger.lock();
        ledger.apply_fill(fill);

        if ledger.cash < -self.margin_tolerance {
            return Err(EngineError::LedgerViolation(format!(
                "cash {} below margin tolerance after fill {}",
                ledger.cash, fill.fill_id
            )));
        }

        let positions = ledger
            .positions
            .iter()
            .map(|(instrument, p)| PositionSnapshot {
                instrument: instrument.clone(),
                quantity: p.quantity,
                avg_cost: p.avg_cost,
                mark: ledger.marks.get(instrument).copied(),
            })
            .collect();

        Ok(PortfolioUpdatePayload {
            timestamp: fill.timestamp,
            equity: ledger.equity(),
            cash: ledger.cash,
            realized_pnl: ledger.realized_pnl(),
            positions,
        })
    }

    fn publish_update(
        &self,
        update: PortfolioUpdatePayload,
        timestamp: DateTime<Utc>,
        bus: &BusHandle,
    ) -> Result<()> {
        bus.publish(timestamp, EventPayload::PortfolioUpdate(update))?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Portfolio {
    fn name(&self) -> &str {
        "portfolio"
    }

    async fn handle(&self, event: &Event, bus: &BusHandle) -> Result<()> {
        match &event.payload {
            EventPayload::Market(m) => {
                self.on_market(&m.bar.instrument, m.bar.close);
                Ok(())
            }
            EventPayload::Signal(signal) => match self.on_signal(signal) {
                Ok(Some(order)) => {
                    info!(
                        "signal {} {} sized to {} {} {}",
                        signal.direction,
                        signal.instrument,
                        order.side,
                        order.quantity,
                        order.instrument
                    );
                    bus.publish(event.timestamp, EventPayload::Order(order))?;
                    Ok(())
                }
                Ok(None) => Ok(()),
                // Recoverable: surface through the dispatch loop's warn
                // path, keep running.
                Err(e) => Err(e),
            },
            EventPayload::Fill(fill) => {
                let update = self.on_fill(fill)?;
                self.publish_update(update, event.timestamp, bus)
            }
            _ => Ok(()),
        }
    }
}
