//! Execution handlers
//!
//! Two variants behind the same contract: orders in, order updates and
//! fills out, with the per-order state machine
//! `Submitted -> {PartiallyFilled ->} Filled | Rejected | Cancelled`.
//!
//! - [`SimulatedExecution`] matches pending orders against the next bar,
//!   never the bar they were decided on.
//! - [`BrokerExecution`] forwards orders to an external venue and
//!   translates its asynchronous callbacks, idempotently by exchange fill
//!   id.

mod broker;
mod models;
mod simulated;

pub use broker::{BrokerClient, BrokerExecution, BrokerUpdate};
pub use models::{
    CommissionModel, FillPriceRule, NoCommission, NoSlippage, PerShareCommission,
    PercentCommission, PercentSlippage, RandomSlippage, SlippageModel,
};
pub use simulated::SimulatedExecution;
