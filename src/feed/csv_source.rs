//! CSV bar source for backtests
//!
//! Storage of historical series is an external concern; this loader only
//! turns one common interchange format into [`Bar`]s for the replay feed.
//! Expected header: `instrument,timestamp,open,high,low,close,volume` with
//! RFC 3339 timestamps.

use crate::error::Result;
use crate::types::Bar;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct BarRecord {
    instrument: String,
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

impl From<BarRecord> for Bar {
    fn from(r: BarRecord) -> Self {
        Bar {
            instrument: r.instrument,
            timestamp: r.timestamp,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
        }
    }
}

pub struct CsvBarSource;

impl CsvBarSource {
    /// Load bars from a CSV file. Rows that fail to parse are dropped and
    /// logged, matching the feed's malformed-input policy; the run
    /// continues with whatever parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<Bar>> {
        let reader = csv::Reader::from_path(path.as_ref())?;
        Ok(Self::collect(reader))
    }

    /// Load bars from any reader (tests, in-memory data).
    pub fn from_reader<R: std::io::Read>(reader: R) -> Vec<Bar> {
        Self::collect(csv::Reader::from_reader(reader))
    }

    fn collect<R: std::io::Read>(mut reader: csv::Reader<R>) -> Vec<Bar> {
        let mut bars = Vec::new();
        for (i, row) in reader.deserialize::<BarRecord>().enumerate() {
            match row {
                Ok(record) => bars.push(record.into()),
                Err(e) => warn!("dropping malformed CSV row {}: {}", i + 1, e),
            }
        }
        bars
    }
}
