use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Instant;
use tracing::debug;

// Measure execution time of an async step and log it at debug level
pub async fn measure_time<F, T, E>(operation_name: &str, f: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let result = f.await;
    debug!(
        "{} {} in {:.2?}",
        operation_name,
        if result.is_ok() { "completed" } else { "failed" },
        start.elapsed()
    );
    result
}

// Format a timestamp for logging
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

// Format a unix-seconds window label for logging
pub fn format_unix(timestamp: i64) -> String {
    match DateTime::<Utc>::from_timestamp(timestamp, 0) {
        Some(dt) => format_time(&dt),
        None => format!("@{}", timestamp),
    }
}

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_window_labels() {
        assert_eq!(format_unix(1_700_000_100), "2023-11-14 22:15:00 UTC");
        assert_eq!(format_unix(i64::MAX), format!("@{}", i64::MAX));
    }

    #[tokio::test]
    async fn measure_time_passes_result_through() {
        let ok: Result<u8, String> = measure_time("step", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
        let err: Result<u8, String> = measure_time("step", async { Err("no".to_string()) }).await;
        assert!(err.is_err());
    }
}
