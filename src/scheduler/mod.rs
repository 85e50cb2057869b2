pub mod boundary;
pub mod cadence;
pub mod gate;
pub mod orchestrator;
pub mod retry;

pub use orchestrator::{BoundaryReport, FeedState, Orchestrator, SkipCause, StageReport};
