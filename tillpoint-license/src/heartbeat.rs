//! Heartbeat scheduling.
//!
//! One recurring timer per activation, backing up the push stream with a
//! periodic re-validation. Starting a scheduler always cancels the prior
//! task first, so an interval change never double-fires a tick.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default cadence between heartbeats.
pub const BASE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Upper bound of the random jitter added to every tick, spreading
/// heartbeats across installs.
pub const MAX_JITTER: Duration = Duration::from_secs(5 * 60);

/// Consecutive failures before the advisory connectivity notification.
pub const FAILURE_NOTICE_THRESHOLD: u32 = 5;

/// A single recurring heartbeat timer.
///
/// Owned by the engine instance, never process-global, so engines in tests
/// do not interfere with each other.
pub struct HeartbeatScheduler {
    task: Option<JoinHandle<()>>,
    interval: Duration,
    max_jitter: Duration,
}

impl HeartbeatScheduler {
    #[must_use]
    pub fn new(max_jitter: Duration) -> Self {
        Self {
            task: None,
            interval: BASE_INTERVAL,
            max_jitter,
        }
    }

    /// The base interval of the currently configured timer.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Starts (or restarts) the timer at `interval`. Any prior timer is
    /// cancelled before the new one is spawned; the first tick of the new
    /// timer fires a full interval from now.
    pub fn start<F, Fut>(&mut self, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        self.interval = interval;
        let max_jitter = self.max_jitter;
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval + jitter(max_jitter)).await;
                tick().await;
            }
        }));
    }

    /// Cancels the timer. Safe to call when already stopped.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}
