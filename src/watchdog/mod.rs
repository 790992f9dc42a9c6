//! Cache Watchdog (C8) — periodically sweeps the state cache, marking
//! devices whose last heartbeat is older than the configured timeout as
//! offline. Pure state transition only: this worker emits no events and
//! issues no commands, it just keeps `online` flags honest for readers
//! of the REST/WS surfaces.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::StateCache;

const DEFAULT_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(30);

pub struct Watchdog {
    cache: Arc<StateCache>,
    heartbeat_timeout: chrono::Duration,
    sweep_interval: StdDuration,
}

impl Watchdog {
    pub fn new(cache: Arc<StateCache>, heartbeat_timeout_ms: u64) -> Self {
        Self {
            cache,
            heartbeat_timeout: chrono::Duration::milliseconds(heartbeat_timeout_ms as i64),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_sweep_interval(mut self, interval: StdDuration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                _ = ticker.tick() => {
                    debug!("watchdog sweep");
                    self.cache.sweep_offline(self.heartbeat_timeout);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sweep_marks_stale_module_offline() {
        let cache = Arc::new(StateCache::new());
        cache.update_heartbeat("dev1", 0, "mod-0", 8);

        let watchdog = Watchdog::new(Arc::clone(&cache), 0).with_sweep_interval(Duration::from_millis(20));
        let (_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let handle = tokio::spawn(watchdog.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.abort();

        let snapshot = cache.snapshot_module("dev1", 0).unwrap();
        assert!(!snapshot.online);
    }
}
