// In-process "stage is running" flags. A waiting stage parks on the watch
// channel and is woken when the flag drops, instead of sleeping and polling.
use crate::granularity::Granularity;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Clone)]
pub struct StageGate {
    name: &'static str,
    running: Arc<watch::Sender<bool>>,
}

impl StageGate {
    pub fn new(name: &'static str) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            name,
            running: Arc::new(running),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Mark the stage running unless it already is
    pub fn try_enter(&self) -> Option<StageGuard> {
        let entered = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        entered.then(|| {
            debug!("Stage '{}' entered", self.name);
            StageGuard { gate: self.clone() }
        })
    }

    /// Wait for the stage to go idle, then enter it
    pub async fn enter(&self) -> StageGuard {
        loop {
            if let Some(guard) = self.try_enter() {
                return guard;
            }
            self.wait_idle().await;
        }
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|running| !*running).await;
    }
}

/// Clears the running flag on drop, including on panic unwinding
pub struct StageGuard {
    gate: StageGate,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        self.gate.running.send_replace(false);
        debug!("Stage '{}' left", self.gate.name);
    }
}

/// Every gate the orchestrator coordinates on
#[derive(Clone)]
pub struct StageGates {
    pub latest: StageGate,
    feeds: [StageGate; 4],
    pub aggregation: StageGate,
    pub cleanup: StageGate,
}

impl Default for StageGates {
    fn default() -> Self {
        Self::new()
    }
}

impl StageGates {
    pub fn new() -> Self {
        Self {
            latest: StageGate::new("latest"),
            feeds: [
                StageGate::new("5m"),
                StageGate::new("1h"),
                StageGate::new("6h"),
                StageGate::new("24h"),
            ],
            aggregation: StageGate::new("aggregation"),
            cleanup: StageGate::new("cleanup"),
        }
    }

    pub fn feed(&self, granularity: Granularity) -> &StageGate {
        match granularity {
            Granularity::Latest => &self.latest,
            Granularity::FiveMinutes => &self.feeds[0],
            Granularity::OneHour => &self.feeds[1],
            Granularity::SixHours => &self.feeds[2],
            Granularity::TwentyFourHours => &self.feeds[3],
        }
    }

    /// Whether the latest feed or any candle feed is in flight
    pub fn any_feed_running(&self) -> bool {
        self.latest.is_running() || self.feeds.iter().any(StageGate::is_running)
    }

    pub async fn wait_feeds_idle(&self) {
        while self.any_feed_running() {
            self.latest.wait_idle().await;
            for feed in &self.feeds {
                feed.wait_idle().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn try_enter_is_exclusive() {
        let gate = StageGate::new("t");
        let guard = gate.try_enter().unwrap();
        assert!(gate.is_running());
        assert!(gate.try_enter().is_none());
        drop(guard);
        assert!(!gate.is_running());
        assert!(gate.try_enter().is_some());
    }

    #[tokio::test]
    async fn waiter_wakes_when_guard_drops() {
        let gate = StageGate::new("t");
        let guard = gate.try_enter().unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _entered = gate.enter().await;
                true
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn latest_maps_to_its_own_gate() {
        let gates = StageGates::new();
        let _g = gates.feed(Granularity::Latest).try_enter().unwrap();
        assert!(gates.latest.is_running());
        assert!(gates.any_feed_running());
        assert!(!gates.feed(Granularity::OneHour).is_running());
    }
}
