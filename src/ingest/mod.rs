pub mod candles;
pub mod latest;

pub use candles::{BackfillReport, CandleIngestor, IngestOutcome, SkipReason};
pub use latest::{detect_changes, LatestIngestor, LatestReport};
