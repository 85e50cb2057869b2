use crate::config::AggregationConfig;
use std::time::Duration;

/// Maps dirty-queue depth to the delay before the next reconcile run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileCadence {
    relaxed: Duration,
    floor: Duration,
    backlog_step: usize,
}

impl ReconcileCadence {
    pub fn new(relaxed: Duration, floor: Duration, backlog_step: usize) -> Self {
        Self {
            relaxed,
            floor: floor.min(relaxed),
            backlog_step: backlog_step.max(1),
        }
    }

    pub fn from_config(config: &AggregationConfig) -> Self {
        Self::new(
            Duration::from_secs(config.relaxed_interval_secs),
            Duration::from_secs(config.floor_interval_secs),
            config.backlog_step,
        )
    }

    /// `relaxed / (1 + depth / backlog_step)`, never below the floor
    pub fn interval_for(&self, depth: usize) -> Duration {
        let divisor = (1 + depth / self.backlog_step).min(u32::MAX as usize) as u32;
        (self.relaxed / divisor).max(self.floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cadence() -> ReconcileCadence {
        ReconcileCadence::new(Duration::from_secs(60), Duration::from_secs(5), 500)
    }

    #[test]
    fn empty_queue_runs_relaxed() {
        assert_eq!(cadence().interval_for(0), Duration::from_secs(60));
        assert_eq!(cadence().interval_for(499), Duration::from_secs(60));
    }

    #[test]
    fn backlog_shortens_interval_down_to_floor() {
        assert_eq!(cadence().interval_for(500), Duration::from_secs(30));
        assert_eq!(cadence().interval_for(2_500), Duration::from_secs(10));
        assert_eq!(cadence().interval_for(1_000_000), Duration::from_secs(5));
        assert_eq!(cadence().interval_for(usize::MAX), Duration::from_secs(5));
    }

    #[test]
    fn interval_never_grows_with_depth() {
        let c = cadence();
        let mut previous = c.interval_for(0);
        for depth in (0..20_000).step_by(137) {
            let interval = c.interval_for(depth);
            assert!(interval <= previous);
            previous = interval;
        }
    }
}
