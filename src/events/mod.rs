//! Event envelope and taxonomy
//!
//! Every message in the system is an [`Event`]: a closed tagged variant
//! ([`EventPayload`]) wrapped in an envelope carrying the logical timestamp
//! it represents and a sequence number assigned at publish time. Sequence
//! numbers are strictly increasing for the lifetime of one run and break
//! ties between events with equal timestamps.
//!
//! New event kinds are added by extending the sum type, never by ad hoc
//! payloads; the dispatch table is keyed by [`EventKind`], so a handler can
//! only ever be offered the payload shape it subscribed for.

use crate::types::{Bar, Direction, OrderKind, OrderState, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tag-only mirror of [`EventPayload`], used as the dispatch-table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Market,
    Signal,
    Order,
    OrderUpdate,
    Fill,
    PortfolioUpdate,
    Timer,
    StreamBoundary,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Market => "MARKET",
            EventKind::Signal => "SIGNAL",
            EventKind::Order => "ORDER",
            EventKind::OrderUpdate => "ORDER_UPDATE",
            EventKind::Fill => "FILL",
            EventKind::PortfolioUpdate => "PORTFOLIO_UPDATE",
            EventKind::Timer => "TIMER",
            EventKind::StreamBoundary => "STREAM_BOUNDARY",
        };
        write!(f, "{}", name)
    }
}

/// Event wrapper with publish-time metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Strictly increasing sequence number, assigned at publish time
    pub seq: u64,
    /// The simulated or wall-clock instant this event represents
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Closed set of event payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Market data update for one instrument
    Market(MarketPayload),
    /// Trading intent from a strategy
    Signal(SignalPayload),
    /// Concrete order from the portfolio (or a strategy directly)
    Order(OrderPayload),
    /// Order lifecycle transition
    OrderUpdate(OrderUpdatePayload),
    /// Trade execution
    Fill(FillPayload),
    /// Ledger snapshot after a fill
    PortfolioUpdate(PortfolioUpdatePayload),
    /// Logical clock tick
    Timer(TimerPayload),
    /// Start/end marker for the event stream
    StreamBoundary(Boundary),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Market(_) => EventKind::Market,
            EventPayload::Signal(_) => EventKind::Signal,
            EventPayload::Order(_) => EventKind::Order,
            EventPayload::OrderUpdate(_) => EventKind::OrderUpdate,
            EventPayload::Fill(_) => EventKind::Fill,
            EventPayload::PortfolioUpdate(_) => EventKind::PortfolioUpdate,
            EventPayload::Timer(_) => EventKind::Timer,
            EventPayload::StreamBoundary(_) => EventKind::StreamBoundary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPayload {
    pub bar: Bar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    pub instrument: String,
    pub direction: Direction,
    /// Signal strength in [0, 1]; sizing policies may scale by it
    pub strength: Decimal,
}

impl SignalPayload {
    pub fn new(instrument: &str, direction: Direction, strength: Decimal) -> Self {
        Self {
            instrument: instrument.to_string(),
            direction,
            strength,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayload {
    /// Internal order identifier
    pub order_id: Uuid,
    pub instrument: String,
    pub kind: OrderKind,
    pub side: Side,
    pub quantity: Decimal,
    /// Required for limit orders, ignored for market orders
    pub limit_price: Option<Decimal>,
}

impl OrderPayload {
    /// Create a market order
    pub fn market(instrument: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            kind: OrderKind::Market,
            side,
            quantity,
            limit_price: None,
        }
    }

    /// Create a limit order
    pub fn limit(instrument: &str, side: Side, quantity: Decimal, limit_price: Decimal) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            kind: OrderKind::Limit,
            side,
            quantity,
            limit_price: Some(limit_price),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdatePayload {
    pub order_id: Uuid,
    /// Venue-assigned identifier, once known (broker execution only)
    pub exchange_order_id: Option<String>,
    pub status: OrderState,
    pub filled_quantity: Decimal,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillPayload {
    pub fill_id: Uuid,
    /// Venue-assigned fill identifier; the idempotency key for broker fills
    pub exchange_fill_id: Option<String>,
    pub order_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    /// Total price deviation paid versus the reference price
    pub slippage: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub instrument: String,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub mark: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioUpdatePayload {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub cash: Decimal,
    pub realized_pnl: Decimal,
    pub positions: Vec<PositionSnapshot>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimerPayload {
    /// Number of ticks emitted so far in this run
    pub tick: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Boundary {
    Start,
    End,
}
