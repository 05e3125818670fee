//! Replay-paced historical feed

use crate::bus::BusHandle;
use crate::error::Result;
use crate::events::{Boundary, EventPayload, MarketPayload, TimerPayload};
use crate::history::MarketHistory;
use crate::types::Bar;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Backtest feed: replays a finite bar history in timestamp lock-step
pub struct ReplayFeed {
    bars: Vec<Bar>,
    history: Arc<MarketHistory>,
}

impl ReplayFeed {
    /// Bars may arrive in any order; they are sorted by timestamp (stable
    /// within a timestamp, preserving source order across instruments).
    pub fn new(mut bars: Vec<Bar>, history: Arc<MarketHistory>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        Self { bars, history }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Publish the whole history, one timestamp at a time.
    ///
    /// After each timestamp's bars (and its timer tick) the feed suspends
    /// on `drained()` until every handler and every piece of off-loop work
    /// for that timestamp has completed. An order decided while processing
    /// timestamp `t` can therefore only be resolved against `t+1` or later
    /// data, because no later data exists in the system until `t` has
    /// fully drained.
    pub async fn run(self, bus: BusHandle, cancel: watch::Receiver<bool>) -> Result<()> {
        let mut tick = 0u64;
        let mut last_published = None;

        let start_ts = self
            .bars
            .first()
            .map(|b| b.timestamp)
            .unwrap_or_else(chrono::Utc::now);
        bus.publish(start_ts, EventPayload::StreamBoundary(Boundary::Start))?;
        info!("replay feed starting: {} bars", self.bars.len());

        let mut idx = 0;
        while idx < self.bars.len() {
            if *cancel.borrow() {
                info!("replay feed cancelled at bar {}", idx);
                break;
            }

            let ts = self.bars[idx].timestamp;
            while idx < self.bars.len() && self.bars[idx].timestamp == ts {
                let bar = self.bars[idx].clone();
                idx += 1;
                // The history store enforces per-instrument monotonicity;
                // a record it refuses is dropped, never published.
                if let Err(e) = self.history.record(bar.clone()) {
                    warn!("dropping source record: {}", e);
                    continue;
                }
                bus.publish(ts, EventPayload::Market(MarketPayload { bar }))?;
            }

            bus.publish(ts, EventPayload::Timer(TimerPayload { tick }))?;
            tick += 1;
            last_published = Some(ts);

            // Lock-step pacing: do not advance the clock until everything
            // triggered by this timestamp has settled.
            bus.drained().await;
            debug!("timestamp {} fully drained", ts);
        }

        let end_ts = last_published.unwrap_or(start_ts);
        bus.publish(end_ts, EventPayload::StreamBoundary(Boundary::End))?;
        info!("replay feed finished");
        Ok(())
    }
}
