//! Strategy contract and bus adapter
//!
//! A strategy is a pure decision function over the current market or timer
//! event and a read-only [`HistoryView`]. It never mutates portfolio or
//! execution state; every effect flows through published events.

mod momentum;

pub use momentum::MomentumStrategy;

use crate::bus::{BusHandle, EventHandler};
use crate::error::Result;
use crate::events::{Event, EventPayload, OrderPayload, SignalPayload};
use crate::history::{HistoryView, MarketHistory};
use crate::types::Bar;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// What a strategy may emit: intent for the portfolio to size, or a
/// concrete order published directly.
#[derive(Debug, Clone)]
pub enum Action {
    Signal(SignalPayload),
    Order(OrderPayload),
}

pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Called for every market bar. The view is clamped to the bar's
    /// timestamp; history queries cannot see the future.
    fn on_market(&mut self, bar: &Bar, history: &HistoryView<'_>) -> Result<Vec<Action>>;

    /// Called on timer ticks. Default: no action.
    fn on_timer(
        &mut self,
        _timestamp: DateTime<Utc>,
        _history: &HistoryView<'_>,
    ) -> Result<Vec<Action>> {
        Ok(Vec::new())
    }
}

/// Adapts a [`Strategy`] to the event bus
///
/// Subscribed to `Market` and `Timer`. Strategy errors are recoverable:
/// logged, no actions published, run continues.
pub struct StrategyHandler {
    strategy: Mutex<Box<dyn Strategy>>,
    history: Arc<MarketHistory>,
}

impl StrategyHandler {
    pub fn new(strategy: Box<dyn Strategy>, history: Arc<MarketHistory>) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            history,
        }
    }

    fn publish_actions(
        &self,
        actions: Vec<Action>,
        timestamp: DateTime<Utc>,
        bus: &BusHandle,
    ) -> Result<()> {
        for action in actions {
            match action {
                Action::Signal(signal) => {
                    bus.publish(timestamp, EventPayload::Signal(signal))?;
                }
                Action::Order(order) => {
                    bus.publish(timestamp, EventPayload::Order(order))?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for StrategyHandler {
    fn name(&self) -> &str {
        "strategy"
    }

    async fn handle(&self, event: &Event, bus: &BusHandle) -> Result<()> {
        let view = self.history.view_at(event.timestamp);
        let actions = match &event.payload {
            EventPayload::Market(m) => self.strategy.lock().on_market(&m.bar, &view),
            EventPayload::Timer(_) => self.strategy.lock().on_timer(event.timestamp, &view),
            _ => return Ok(()),
        };

        match actions {
            Ok(actions) => self.publish_actions(actions, event.timestamp, bus),
            Err(e) => {
                warn!("strategy error at {}: {}", event.timestamp, e);
                Ok(())
            }
        }
    }
}
