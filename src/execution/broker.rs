//! Broker execution adapter for live trading
//!
//! Forwards orders to an external venue through [`BrokerClient`] and
//! translates the venue's asynchronous callbacks into order updates and
//! fills. Callbacks may arrive duplicated or out of order; fill
//! application is idempotent by exchange fill id. The wire protocol is the
//! client implementation's concern.

use crate::bus::{BusHandle, EventHandler};
use crate::error::Result;
use crate::events::{
    Event, EventPayload, FillPayload, OrderPayload, OrderUpdatePayload,
};
use crate::risk::{RiskGate, RiskVerdict};
use crate::types::{OrderState, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;
use tracing::{debug, info, warn};

/// External venue boundary: submit and cancel, plus an update stream the
/// engine pumps through [`BrokerExecution::run_updates`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submit an order; returns the venue-assigned order id.
    async fn submit_order(&self, order: &OrderPayload) -> Result<String>;

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<()>;
}

/// Asynchronous status callback from the venue
#[derive(Debug, Clone)]
pub enum BrokerUpdate {
    Accepted {
        order_id: Uuid,
        exchange_order_id: String,
    },
    Fill {
        /// Venue-assigned fill id: the idempotency key
        exchange_fill_id: String,
        order_id: Uuid,
        quantity: Decimal,
        price: Decimal,
        commission: Decimal,
        timestamp: DateTime<Utc>,
    },
    Rejected {
        order_id: Uuid,
        reason: String,
    },
    Cancelled {
        order_id: Uuid,
    },
}

struct LiveOrder {
    order: OrderPayload,
    exchange_order_id: Option<String>,
    filled: Decimal,
    state: OrderState,
}

#[derive(Default)]
struct BrokerBook {
    orders: HashMap<Uuid, LiveOrder>,
    seen_fills: HashSet<String>,
}

struct BrokerInner {
    client: Arc<dyn BrokerClient>,
    book: Mutex<BrokerBook>,
}

/// Live execution handler
pub struct BrokerExecution {
    inner: Arc<BrokerInner>,
    risk_gate: Option<Box<dyn RiskGate>>,
    cancel_timeout: Duration,
}

impl BrokerExecution {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        risk_gate: Option<Box<dyn RiskGate>>,
        cancel_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                client,
                book: Mutex::new(BrokerBook::default()),
            }),
            risk_gate,
            cancel_timeout,
        }
    }

    /// Number of orders not yet in a terminal state
    pub fn open_orders(&self) -> usize {
        self.inner
            .book
            .lock()
            .orders
            .values()
            .filter(|o| o.state.is_active())
            .count()
    }

    /// Cumulative filled quantity for an order
    pub fn filled_quantity(&self, order_id: Uuid) -> Decimal {
        self.inner
            .book
            .lock()
            .orders
            .get(&order_id)
            .map_or(Decimal::ZERO, |o| o.filled)
    }

    /// Pump venue callbacks into the bus until the update stream closes.
    ///
    /// Spawned by the engine as its own task; it is not a bus handler, so
    /// out-of-order completions here are expected and tolerated.
    pub async fn run_updates(
        &self,
        mut updates: mpsc::UnboundedReceiver<BrokerUpdate>,
        bus: BusHandle,
    ) -> Result<()> {
        while let Some(update) = updates.recv().await {
            self.apply_update(update, &bus)?;
        }
        debug!("broker update stream closed");
        Ok(())
    }

    fn apply_update(&self, update: BrokerUpdate, bus: &BusHandle) -> Result<()> {
        match update {
            BrokerUpdate::Accepted {
                order_id,
                exchange_order_id,
            } => {
                let mut book = self.inner.book.lock();
                let Some(live) = book.orders.get_mut(&order_id) else {
                    warn!("acceptance for unknown order {}", order_id);
                    return Ok(());
                };
                live.exchange_order_id = Some(exchange_order_id.clone());
                bus.publish(
                    Utc::now(),
                    EventPayload::OrderUpdate(OrderUpdatePayload {
                        order_id,
                        exchange_order_id: Some(exchange_order_id),
                        status: OrderState::Submitted,
                        filled_quantity: live.filled,
                        reason: None,
                    }),
                )?;
            }
            BrokerUpdate::Fill {
                exchange_fill_id,
                order_id,
                quantity,
                price,
                commission,
                timestamp,
            } => {
                let mut book = self.inner.book.lock();
                // Idempotence: a fill id already applied must not change
                // state again, no matter how often the venue repeats it.
                if !book.seen_fills.insert(exchange_fill_id.clone()) {
                    debug!("duplicate fill {} ignored", exchange_fill_id);
                    return Ok(());
                }
                let Some(live) = book.orders.get_mut(&order_id) else {
                    warn!("fill {} for unknown order {}", exchange_fill_id, order_id);
                    return Ok(());
                };
                if live.state.is_terminal() {
                    warn!(
                        "fill {} for terminal order {} ignored",
                        exchange_fill_id, order_id
                    );
                    return Ok(());
                }

                live.filled += quantity;
                live.state = if live.filled >= live.order.quantity {
                    OrderState::Filled
                } else {
                    OrderState::PartiallyFilled
                };
                let (instrument, side, state, filled) = (
                    live.order.instrument.clone(),
                    live.order.side,
                    live.state,
                    live.filled,
                );
                let exchange_order_id = live.exchange_order_id.clone();
                drop(book);

                info!(
                    "fill {}: {} {} {} @ {}",
                    exchange_fill_id, side, quantity, instrument, price
                );
                bus.publish(
                    timestamp,
                    EventPayload::Fill(FillPayload {
                        fill_id: Uuid::new_v4(),
                        exchange_fill_id: Some(exchange_fill_id),
                        order_id,
                        instrument,
                        side,
                        quantity,
                        price,
                        commission,
                        slippage: Decimal::ZERO,
                        timestamp,
                    }),
                )?;
                bus.publish(
                    timestamp,
                    EventPayload::OrderUpdate(OrderUpdatePayload {
                        order_id,
                        exchange_order_id,
                        status: state,
                        filled_quantity: filled,
                        reason: None,
                    }),
                )?;
            }
            BrokerUpdate::Rejected { order_id, reason } => {
                self.transition(order_id, OrderState::Rejected, Some(reason), bus)?;
            }
            BrokerUpdate::Cancelled { order_id } => {
                self.transition(order_id, OrderState::Cancelled, None, bus)?;
            }
        }
        Ok(())
    }

    fn transition(
        &self,
        order_id: Uuid,
        status: OrderState,
        reason: Option<String>,
        bus: &BusHandle,
    ) -> Result<()> {
        let mut book = self.inner.book.lock();
        let Some(live) = book.orders.get_mut(&order_id) else {
            warn!("status update for unknown order {}", order_id);
            return Ok(());
        };
        if live.state.is_terminal() {
            debug!("ignoring {} for terminal order {}", status, order_id);
            return Ok(());
        }
        live.state = status;
        let payload = OrderUpdatePayload {
            order_id,
            exchange_order_id: live.exchange_order_id.clone(),
            status,
            filled_quantity: live.filled,
            reason,
        };
        drop(book);
        bus.publish(Utc::now(), EventPayload::OrderUpdate(payload))?;
        Ok(())
    }

    /// Attempt to cancel every open order at the venue, bounded by the
    /// configured timeout per order. Venue silence forces local
    /// bookkeeping closure: the order is marked Cancelled here and the
    /// discrepancy surfaced as a warning for reconciliation, never
    /// silently absorbed.
    pub async fn cancel_outstanding(&self) -> Vec<Uuid> {
        let open: Vec<(Uuid, Option<String>)> = {
            let book = self.inner.book.lock();
            book.orders
                .iter()
                .filter(|(_, o)| o.state.is_active())
                .map(|(id, o)| (*id, o.exchange_order_id.clone()))
                .collect()
        };

        let mut unconfirmed = Vec::new();
        for (order_id, exchange_order_id) in open {
            let confirmed = match &exchange_order_id {
                Some(xid) => {
                    match tokio::time::timeout(
                        self.cancel_timeout,
                        self.inner.client.cancel_order(xid),
                    )
                    .await
                    {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            warn!("cancel of order {} failed: {}", order_id, e);
                            false
                        }
                        Err(_) => {
                            warn!(
                                "cancel of order {} unconfirmed after {:?}, forcing local closure",
                                order_id, self.cancel_timeout
                            );
                            false
                        }
                    }
                }
                None => {
                    warn!(
                        "order {} has no exchange id yet, forcing local closure",
                        order_id
                    );
                    false
                }
            };

            let mut book = self.inner.book.lock();
            if let Some(live) = book.orders.get_mut(&order_id) {
                live.state = OrderState::Cancelled;
            }
            if !confirmed {
                unconfirmed.push(order_id);
            }
        }
        unconfirmed
    }

    fn submit(&self, order: &OrderPayload, bus: &BusHandle) {
        let inner = Arc::clone(&self.inner);
        let order = order.clone();
        let publisher = bus.clone();
        // Venue I/O happens off-loop; the dispatch loop moves on while the
        // submit is in flight.
        bus.offload("broker-submit", async move {
            match inner.client.submit_order(&order).await {
                Ok(exchange_order_id) => {
                    let mut book = inner.book.lock();
                    if let Some(live) = book.orders.get_mut(&order.order_id) {
                        live.exchange_order_id = Some(exchange_order_id.clone());
                    }
                    drop(book);
                    publisher.publish(
                        Utc::now(),
                        EventPayload::OrderUpdate(OrderUpdatePayload {
                            order_id: order.order_id,
                            exchange_order_id: Some(exchange_order_id),
                            status: OrderState::Submitted,
                            filled_quantity: Decimal::ZERO,
                            reason: None,
                        }),
                    )?;
                }
                Err(e) => {
                    warn!("submit of order {} failed: {}", order.order_id, e);
                    let mut book = inner.book.lock();
                    if let Some(live) = book.orders.get_mut(&order.order_id) {
                        live.state = OrderState::Rejected;
                    }
                    drop(book);
                    publisher.publish(
                        Utc::now(),
                        EventPayload::OrderUpdate(OrderUpdatePayload {
                            order_id: order.order_id,
                            exchange_order_id: None,
                            status: OrderState::Rejected,
                            filled_quantity: Decimal::ZERO,
                            reason: Some(e.to_string()),
                        }),
                    )?;
                }
            }
            Ok(())
        });
    }
}

#[async_trait]
impl EventHandler for BrokerExecution {
    fn name(&self) -> &str {
        "broker-execution"
    }

    async fn handle(&self, event: &Event, bus: &BusHandle) -> Result<()> {
        let EventPayload::Order(order) = &event.payload else {
            return Ok(());
        };

        if let Some(gate) = &self.risk_gate {
            if let RiskVerdict::Reject(reason) = gate.check(order, None) {
                warn!(
                    "risk gate '{}' rejected order {}: {}",
                    gate.name(),
                    order.order_id,
                    reason
                );
                bus.publish(
                    event.timestamp,
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

        self.inner.book.lock().orders.insert(
            order.order_id,
            LiveOrder {
                order: order.clone(),
                exchange_order_id: None,
                filled: Decimal::ZERO,
                state: OrderState::Submitted,
            },
        );
        self.submit(order, bus);
        Ok(())
    }
}
