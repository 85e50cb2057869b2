use thiserror::Error;

/// Failures talking to the upstream price source. Every variant is treated
/// as transient: the source is eventually consistent and publishes late.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream served window {served:?}, requested {requested}")]
    WindowMismatch { requested: i64, served: Option<i64> },

    #[error("upstream returned an empty {0} snapshot")]
    EmptySnapshot(String),

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream responded with status {0}")]
    Status(u16),

    #[error("upstream payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures inside the relational store. The enclosing transaction has
/// already been rolled back when one of these surfaces.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store rejected write: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock directory I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock record for '{0}' could not be written")]
    Corrupt(String),
}

/// Outcome taxonomy for a single ingestion attempt.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("retryable fetch failure: {0}")]
    RetryableFetch(#[from] FetchError),

    #[error("no price changes detected in latest snapshot")]
    NoChangeDetected,

    #[error("store transaction failed: {0}")]
    StoreTransaction(#[from] StoreError),

    #[error("lock check failed: {0}")]
    Lock(#[from] LockError),
}

/// Failures of the downstream stages (reconcile, cleanup)
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl IngestError {
    /// Whether the scheduler should call the ingestor again within the same boundary
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::RetryableFetch(_) | IngestError::NoChangeDetected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fetch_and_no_change_are_retryable() {
        let mismatch = IngestError::from(FetchError::WindowMismatch {
            requested: 300,
            served: Some(0),
        });
        assert!(mismatch.is_retryable());
        assert!(IngestError::NoChangeDetected.is_retryable());
        assert!(!IngestError::from(StoreError::Rejected("boom".into())).is_retryable());
    }
}
