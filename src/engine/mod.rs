//! Run orchestration
//!
//! Builds the component graph from a resolved [`Config`] and runs it to
//! completion. Backtest and live runs share the identical pipeline; only
//! the feed and the execution handler differ.

#[cfg(test)]
mod tests;

use crate::bus::{CancelHandle, EventBus, EventHandler};
use crate::config::{
    CommissionConfig, Config, RiskLimits, SizingConfig, SlippageConfig,
};
use crate::error::{EngineError, Result};
use crate::events::{EventKind, EventPayload, TimerPayload};
use crate::execution::{
    BrokerClient, BrokerExecution, BrokerUpdate, CommissionModel, NoCommission, NoSlippage,
    PerShareCommission, PercentCommission, PercentSlippage, RandomSlippage, SimulatedExecution,
    SlippageModel,
};
use crate::feed::{ReplayFeed, StreamFeed};
use crate::history::MarketHistory;
use crate::performance::{PerformanceReport, PerformanceTracker};
use crate::portfolio::{FixedQuantity, LedgerSummary, Portfolio, SizingPolicy, TargetWeight};
use crate::risk::{LimitRiskGate, RiskGate};
use crate::strategy::{Strategy, StrategyHandler};
use crate::types::Bar;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything a run leaves behind
#[derive(Debug, Clone, Serialize)]
pub struct EngineOutput {
    pub performance: PerformanceReport,
    pub ledger: LedgerSummary,
    /// Orders resolved as Cancelled instead of filling
    pub cancelled_orders: usize,
    /// Live orders whose venue cancellation was never confirmed; flagged
    /// for reconciliation
    pub unconfirmed_cancels: Vec<Uuid>,
}

pub struct Engine {
    config: Config,
    cancel: Mutex<Option<CancelHandle>>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: Mutex::new(None),
        }
    }

    /// Signal the current run to stop: the feed stops publishing, queued
    /// events drain, and live execution attempts venue cancellation.
    pub fn cancel(&self) {
        if let Some(handle) = &*self.cancel.lock() {
            handle.cancel();
        }
    }

    /// Replay a bar history through the pipeline with simulated execution.
    pub async fn run_backtest(
        &self,
        bars: Vec<Bar>,
        strategy: Box<dyn Strategy>,
    ) -> Result<EngineOutput> {
        let bars = self.filter_bars(bars);
        info!("backtest over {} bars", bars.len());

        let mut bus = EventBus::new();
        *self.cancel.lock() = Some(bus.cancel_handle());

        let history = Arc::new(MarketHistory::new());
        let portfolio = Arc::new(Portfolio::new(
            self.config.portfolio.initial_cash,
            build_sizing(&self.config.portfolio.sizing),
            self.config.portfolio.margin_tolerance,
        ));
        let execution = Arc::new(SimulatedExecution::new(
            self.config.execution.fill_price,
            build_slippage(&self.config.execution.slippage),
            build_commission(&self.config.execution.commission),
            self.config.execution.volume_limit,
            build_risk_gate(&self.config.risk),
        ));
        let performance = Arc::new(PerformanceTracker::new());
        let strategy_handler = Arc::new(StrategyHandler::new(strategy, Arc::clone(&history)));

        subscribe_pipeline(
            &mut bus,
            Arc::clone(&portfolio),
            Arc::clone(&execution) as Arc<dyn EventHandler>,
            strategy_handler,
            Arc::clone(&performance),
        )?;
        bus.subscribe(
            EventKind::StreamBoundary,
            Arc::clone(&execution) as Arc<dyn EventHandler>,
        )?;

        let handle = bus.handle();
        let cancel_watch = bus.cancel_watch();
        let feed = ReplayFeed::new(bars, Arc::clone(&history));
        let feed_task = tokio::spawn(feed.run(handle, cancel_watch));

        bus.run().await?;
        feed_task
            .await
            .map_err(|e| EngineError::Channel(format!("feed task failed: {e}")))??;

        Ok(EngineOutput {
            performance: performance.report(),
            ledger: portfolio.summary(),
            cancelled_orders: execution.cancelled_orders(),
            unconfirmed_cancels: Vec::new(),
        })
    }

    /// Run the same pipeline against a live source and an external venue.
    ///
    /// `source` closing ends the stream gracefully. On completion (or
    /// cancellation) outstanding venue orders are cancelled, with a
    /// bounded wait per order before local bookkeeping is force-closed.
    pub async fn run_live(
        &self,
        source: mpsc::UnboundedReceiver<Bar>,
        client: Arc<dyn BrokerClient>,
        updates: mpsc::UnboundedReceiver<BrokerUpdate>,
        strategy: Box<dyn Strategy>,
    ) -> Result<EngineOutput> {
        let mut bus = EventBus::new();
        *self.cancel.lock() = Some(bus.cancel_handle());

        let history = Arc::new(MarketHistory::new());
        let portfolio = Arc::new(Portfolio::new(
            self.config.portfolio.initial_cash,
            build_sizing(&self.config.portfolio.sizing),
            self.config.portfolio.margin_tolerance,
        ));
        let execution = Arc::new(BrokerExecution::new(
            client,
            build_risk_gate(&self.config.risk),
            Duration::from_secs(self.config.execution.cancel_timeout_secs),
        ));
        let performance = Arc::new(PerformanceTracker::new());
        let strategy_handler = Arc::new(StrategyHandler::new(strategy, Arc::clone(&history)));

        subscribe_pipeline(
            &mut bus,
            Arc::clone(&portfolio),
            Arc::clone(&execution) as Arc<dyn EventHandler>,
            strategy_handler,
            Arc::clone(&performance),
        )?;

        let handle = bus.handle();
        let pump = {
            let execution = Arc::clone(&execution);
            let handle = handle.clone();
            tokio::spawn(async move { execution.run_updates(updates, handle).await })
        };

        let timer_task = self.config.run.timer_interval_secs.map(|secs| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(secs));
                let mut tick = 0u64;
                loop {
                    interval.tick().await;
                    let payload = EventPayload::Timer(TimerPayload { tick });
                    if handle.publish(chrono::Utc::now(), payload).is_err() {
                        break;
                    }
                    tick += 1;
                }
            })
        });

        let feed = StreamFeed::new(source, Arc::clone(&history));
        let feed_task = tokio::spawn(feed.run(handle, bus.cancel_watch()));

        bus.run().await?;
        if let Some(timer) = timer_task {
            timer.abort();
            let _ = timer.await;
        }
        feed_task
            .await
            .map_err(|e| EngineError::Channel(format!("feed task failed: {e}")))??;

        // The loop is gone; stop translating venue callbacks.
        pump.abort();
        let _ = pump.await;

        let open_before = execution.open_orders();
        let unconfirmed = execution.cancel_outstanding().await;
        if !unconfirmed.is_empty() {
            warn!(
                "{} order(s) force-closed without venue confirmation",
                unconfirmed.len()
            );
        }

        Ok(EngineOutput {
            performance: performance.report(),
            ledger: portfolio.summary(),
            cancelled_orders: open_before,
            unconfirmed_cancels: unconfirmed,
        })
    }

    fn filter_bars(&self, bars: Vec<Bar>) -> Vec<Bar> {
        let run = &self.config.run;
        bars.into_iter()
            .filter(|b| run.start.map_or(true, |start| b.timestamp >= start))
            .filter(|b| run.end.map_or(true, |end| b.timestamp <= end))
            .filter(|b| {
                run.instruments.is_empty() || run.instruments.contains(&b.instrument)
            })
            .collect()
    }
}

/// Subscriptions common to both modes. Per-kind registration order is the
/// invocation order: marks update and settlement run before the strategy
/// sees the bar, and the portfolio applies a fill before performance
/// snapshots it.
fn subscribe_pipeline(
    bus: &mut EventBus,
    portfolio: Arc<Portfolio>,
    execution: Arc<dyn EventHandler>,
    strategy: Arc<StrategyHandler>,
    performance: Arc<PerformanceTracker>,
) -> Result<()> {
    bus.subscribe(
        EventKind::Market,
        Arc::clone(&portfolio) as Arc<dyn EventHandler>,
    )?;
    bus.subscribe(EventKind::Market, Arc::clone(&execution))?;
    bus.subscribe(
        EventKind::Market,
        Arc::clone(&strategy) as Arc<dyn EventHandler>,
    )?;
    bus.subscribe(EventKind::Timer, strategy)?;
    bus.subscribe(
        EventKind::Signal,
        Arc::clone(&portfolio) as Arc<dyn EventHandler>,
    )?;
    bus.subscribe(EventKind::Order, execution)?;
    bus.subscribe(EventKind::Fill, portfolio as Arc<dyn EventHandler>)?;
    bus.subscribe(
        EventKind::Fill,
        Arc::clone(&performance) as Arc<dyn EventHandler>,
    )?;
    bus.subscribe(EventKind::PortfolioUpdate, performance)?;
    Ok(())
}

fn build_sizing(config: &SizingConfig) -> Box<dyn SizingPolicy> {
    match config {
        SizingConfig::FixedQuantity { quantity } => Box::new(FixedQuantity {
            quantity: *quantity,
        }),
        SizingConfig::TargetWeight { weight, lot_size } => Box::new(TargetWeight {
            weight: *weight,
            lot_size: *lot_size,
        }),
    }
}

fn build_slippage(config: &SlippageConfig) -> Box<dyn SlippageModel> {
    match config {
        SlippageConfig::None => Box::new(NoSlippage),
        SlippageConfig::Percent { rate } => Box::new(PercentSlippage { rate: *rate }),
        SlippageConfig::Random { max_rate, seed } => {
            Box::new(RandomSlippage::new(*max_rate, *seed))
        }
    }
}

fn build_commission(config: &CommissionConfig) -> Box<dyn CommissionModel> {
    match config {
        CommissionConfig::None => Box::new(NoCommission),
        CommissionConfig::Percent { rate } => Box::new(PercentCommission { rate: *rate }),
        CommissionConfig::PerShare { per_share, minimum } => Box::new(PerShareCommission {
            per_share: *per_share,
            minimum: *minimum,
        }),
    }
}

fn build_risk_gate(limits: &RiskLimits) -> Option<Box<dyn RiskGate>> {
    if limits.is_unbounded() {
        return None;
    }
    Some(Box::new(LimitRiskGate {
        max_order_quantity: limits.max_order_quantity,
        max_order_notional: limits.max_order_notional,
    }))
}
