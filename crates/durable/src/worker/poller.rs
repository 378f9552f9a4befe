//! Poll pacing with exponential backoff
//!
//! The dispatch loop polls as fast as `min_interval` while work keeps
//! arriving and backs off towards `max_interval` while the queue is idle or
//! the backend is failing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while tasks keep arriving
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling while idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier per empty or failed poll
    pub backoff_multiplier: f64,

    /// Maximum tasks to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Paces the dispatch loop and watches for shutdown
pub struct TaskPoller {
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(config: PollerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Record how many tasks the last poll produced
    pub fn observe(&mut self, found: usize) {
        if found == 0 {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "No tasks found, backing off"
            );
        } else {
            self.current_interval = self.config.min_interval;
        }
    }

    /// Record a failed poll
    pub fn observe_failure(&mut self) {
        self.increase_backoff();
    }

    /// Sleep for the current interval
    ///
    /// Returns `true` if shutdown was signalled while waiting.
    pub async fn wait(&mut self) -> bool {
        let interval = self.current_interval;
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = self.shutdown_requested() => {
                debug!("Shutdown signal received during wait");
                true
            }
        };
        interrupted || self.is_shutdown()
    }

    /// Resolves once shutdown is signalled or the signal sender is gone
    pub async fn shutdown_requested(&mut self) {
        let _ = self.shutdown_rx.wait_for(|stop| *stop).await;
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poller(config: PollerConfig) -> (watch::Sender<bool>, TaskPoller) {
        let (tx, rx) = watch::channel(false);
        (tx, TaskPoller::new(config, rx))
    }

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_config_builder_clamps() {
        let config = PollerConfig::new()
            .with_backoff_multiplier(0.5)
            .with_batch_size(0);

        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);
        let (_tx, mut poller) = poller(config);

        poller.observe(0);
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        poller.observe_failure();
        assert_eq!(poller.current_interval(), Duration::from_millis(300));

        poller.observe(3);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_returns_early_on_shutdown() {
        let config = PollerConfig::new().with_min_interval(Duration::from_secs(60));
        let (tx, mut poller) = poller(config);

        let waiter = tokio::spawn(async move { poller.wait().await });
        tx.send(true).unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut poller) = poller(PollerConfig::default());
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), poller.shutdown_requested())
            .await
            .expect("should resolve once the sender is gone");
    }
}
