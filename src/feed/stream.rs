//! Stream-paced live feed

use crate::bus::BusHandle;
use crate::error::Result;
use crate::events::{Boundary, EventPayload, MarketPayload};
use crate::history::MarketHistory;
use crate::types::Bar;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Live feed: forwards bars from an external source channel as they arrive
///
/// The channel is unbounded, so a slow handler downstream can never block
/// the source connection; the bus queue is the buffer. Out-of-order and
/// malformed records are dropped and logged. When the source closes the
/// feed publishes `StreamBoundary(End)` and stops; a dead source is a
/// graceful end of stream, not a crash.
pub struct StreamFeed {
    source: mpsc::UnboundedReceiver<Bar>,
    history: Arc<MarketHistory>,
}

impl StreamFeed {
    pub fn new(source: mpsc::UnboundedReceiver<Bar>, history: Arc<MarketHistory>) -> Self {
        Self { source, history }
    }

    pub async fn run(mut self, bus: BusHandle, mut cancel: watch::Receiver<bool>) -> Result<()> {
        bus.publish(Utc::now(), EventPayload::StreamBoundary(Boundary::Start))?;
        info!("stream feed started");

        let mut last_published = None;
        loop {
            let bar = tokio::select! {
                maybe = self.source.recv() => match maybe {
                    Some(bar) => bar,
                    None => {
                        info!("market data source terminated, ending stream");
                        break;
                    }
                },
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("stream feed cancelled");
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = self.history.record(bar.clone()) {
                warn!("dropping source record: {}", e);
                continue;
            }
            let ts = bar.timestamp;
            last_published = Some(ts);
            bus.publish(ts, EventPayload::Market(MarketPayload { bar }))?;
        }

        let end_ts = last_published.unwrap_or_else(Utc::now);
        bus.publish(end_ts, EventPayload::StreamBoundary(Boundary::End))?;
        Ok(())
    }
}
