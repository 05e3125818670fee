//! Performance tracking
//!
//! A strict observer over the fill and portfolio-update streams: it
//! accumulates an append-only equity curve and trade list, and computes
//! derived statistics on demand. It never publishes events.

use crate::bus::{BusHandle, EventHandler};
use crate::error::Result;
use crate::events::{Event, EventPayload, FillPayload};
use crate::types::Side;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::{Decimal, MathematicalOps};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub fill_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub slippage: Decimal,
}

impl From<&FillPayload> for TradeRecord {
    fn from(fill: &FillPayload) -> Self {
        Self {
            fill_id: fill.fill_id,
            timestamp: fill.timestamp,
            instrument: fill.instrument.clone(),
            side: fill.side,
            quantity: fill.quantity,
            price: fill.price,
            commission: fill.commission,
            slippage: fill.slippage,
        }
    }
}

/// Summary statistics over one run
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub initial_equity: Option<Decimal>,
    pub final_equity: Option<Decimal>,
    /// Fractional total return (0.05 = +5%)
    pub total_return: Option<Decimal>,
    /// Largest peak-to-trough equity decline, as a fraction of the peak
    pub max_drawdown: Option<Decimal>,
    /// Per-period Sharpe ratio (no annualization)
    pub sharpe: Option<Decimal>,
    /// Fraction of non-flat periods with a positive return
    pub win_rate: Option<Decimal>,
    pub trade_count: usize,
    pub total_commission: Decimal,
    pub total_slippage: Decimal,
}

#[derive(Default)]
struct PerfState {
    equity_curve: Vec<EquityPoint>,
    trades: Vec<TradeRecord>,
}

/// Read-only accumulator; the engine queries it after (or during) a run
pub struct PerformanceTracker {
    state: Mutex<PerfState>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PerfState::default()),
        }
    }

    pub fn equity_curve(&self) -> Vec<EquityPoint> {
        self.state.lock().equity_curve.clone()
    }

    pub fn trades(&self) -> Vec<TradeRecord> {
        self.state.lock().trades.clone()
    }

    pub fn report(&self) -> PerformanceReport {
        let state = self.state.lock();
        let curve = &state.equity_curve;

        let initial_equity = curve.first().map(|p| p.equity);
        let final_equity = curve.last().map(|p| p.equity);
        let total_return = match (initial_equity, final_equity) {
            (Some(first), Some(last)) if !first.is_zero() => Some(last / first - Decimal::ONE),
            _ => None,
        };

        let returns: Vec<Decimal> = curve
            .windows(2)
            .filter(|w| !w[0].equity.is_zero())
            .map(|w| w[1].equity / w[0].equity - Decimal::ONE)
            .collect();

        PerformanceReport {
            initial_equity,
            final_equity,
            total_return,
            max_drawdown: max_drawdown(curve),
            sharpe: sharpe(&returns),
            win_rate: win_rate(&returns),
            trade_count: state.trades.len(),
            total_commission: state.trades.iter().map(|t| t.commission).sum(),
            total_slippage: state.trades.iter().map(|t| t.slippage).sum(),
        }
    }

    pub fn report_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.report())
            .map_err(|e| crate::error::EngineError::Config(format!("report serialization: {e}")))
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn max_drawdown(curve: &[EquityPoint]) -> Option<Decimal> {
    let first = curve.first()?;
    let mut peak = first.equity;
    let mut worst = Decimal::ZERO;
    for point in curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if !peak.is_zero() {
            let drawdown = (peak - point.equity) / peak;
            if drawdown > worst {
                worst = drawdown;
            }
        }
    }
    Some(worst)
}

fn sharpe(returns: &[Decimal]) -> Option<Decimal> {
    if returns.len() < 2 {
        return None;
    }
    let n = Decimal::from(returns.len());
    let mean: Decimal = returns.iter().copied().sum::<Decimal>() / n;
    let variance: Decimal = returns
        .iter()
        .map(|r| (*r - mean) * (*r - mean))
        .sum::<Decimal>()
        / (n - Decimal::ONE);
    let std_dev = variance.sqrt()?;
    if std_dev.is_zero() {
        return None;
    }
    Some(mean / std_dev)
}

fn win_rate(returns: &[Decimal]) -> Option<Decimal> {
    let active: Vec<Decimal> = returns.iter().copied().filter(|r| !r.is_zero()).collect();
    if active.is_empty() {
        return None;
    }
    let wins = active.iter().filter(|&&r| r > Decimal::ZERO).count();
    Some(Decimal::from(wins) / Decimal::from(active.len()))
}

#[async_trait]
impl EventHandler for PerformanceTracker {
    fn name(&self) -> &str {
        "performance"
    }

    async fn handle(&self, event: &Event, _bus: &BusHandle) -> Result<()> {
        match &event.payload {
            EventPayload::Fill(fill) => {
                self.state.lock().trades.push(fill.into());
            }
            EventPayload::PortfolioUpdate(update) => {
                self.state.lock().equity_curve.push(EquityPoint {
                    timestamp: update.timestamp,
                    equity: update.equity,
                });
            }
            _ => {}
        }
        Ok(())
    }
}
