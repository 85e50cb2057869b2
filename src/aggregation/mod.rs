pub mod engine;
pub mod metrics;
pub mod trend;

pub use engine::{ReconcileReport, Reconciler, RECONCILE_LOCK};
