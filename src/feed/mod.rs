//! Market data feeds
//!
//! Two variants, one output contract: `Market` events per instrument with
//! strictly increasing timestamps, one `StreamBoundary(Start)` before the
//! first and one `StreamBoundary(End)` after the last.
//!
//! - [`ReplayFeed`] replays a finite history in lock-step with the bus:
//!   after publishing one timestamp's bars it waits for the queue and all
//!   off-loop work to drain before advancing. No handler can ever observe
//!   two timestamps' data at once, which is what makes the lookahead
//!   prohibition enforceable.
//! - [`StreamFeed`] forwards records from a live source as they arrive and
//!   never applies backpressure to the source connection.
//!
//! Malformed or out-of-order records are dropped and logged, never
//! published. A terminated live source ends the stream gracefully.

mod csv_source;
mod replay;
mod stream;

pub use csv_source::CsvBarSource;
pub use replay::ReplayFeed;
pub use stream::StreamFeed;
