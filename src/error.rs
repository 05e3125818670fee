//! Error types for the trading engine

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("malformed input record: {0}")]
    MalformedInput(String),

    #[error("insufficient history for {instrument}: requested {requested}, have {available}")]
    InsufficientHistory {
        instrument: String,
        requested: usize,
        available: usize,
    },

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("order rejected by risk gate: {0}")]
    RiskRejected(String),

    #[error("execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("execution unconfirmed for order {0}")]
    ExecutionUnconfirmed(Uuid),

    #[error("data feed terminated: {0}")]
    FeedTerminated(String),

    #[error("sequence violation: event {seq} observed after {prev}")]
    SequenceViolation { prev: u64, seq: u64 },

    #[error("ledger invariant violated: {0}")]
    LedgerViolation(String),

    #[error("subscription after bus start: {0}")]
    LateSubscription(String),

    #[error("strategy error: {0}")]
    Strategy(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel closed: {0}")]
    Channel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EngineError {
    /// Structural violations abort the run; everything else is handled
    /// locally and logged.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::SequenceViolation { .. } | EngineError::LedgerViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::SequenceViolation { prev: 5, seq: 3 }.is_fatal());
        assert!(EngineError::LedgerViolation("cash went negative".into()).is_fatal());
        assert!(!EngineError::MalformedInput("bad row".into()).is_fatal());
        assert!(!EngineError::InsufficientFunds {
            required: Decimal::ONE_HUNDRED,
            available: Decimal::ONE,
        }
        .is_fatal());
        assert!(!EngineError::RiskRejected("too big".into()).is_fatal());
    }
}
