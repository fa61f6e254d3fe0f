//! Reconnection backoff

use std::time::{Duration, Instant};
use tracing::debug;

/// Delay policy between dial attempts
#[cfg_attr(test, mockall::automock)]
pub trait Backoff: Send {
    /// Delay before the next attempt, or `None` to give up
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Start over after a successful connection
    fn reset(&mut self);
}

/// Exponential backoff capped per interval and in total elapsed time
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Give up once this much time has passed since the last reset;
    /// `None` retries forever
    pub max_elapsed: Option<Duration>,
    current: Duration,
    started: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
        max_elapsed: Option<Duration>,
    ) -> Self {
        Self {
            initial_interval,
            multiplier,
            max_interval,
            max_elapsed,
            current: initial_interval,
            started: None,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(500),
            1.5,
            Duration::from_secs(60),
            Some(Duration::from_secs(15 * 60)),
        )
    }
}

impl Backoff for ExponentialBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let started = *self.started.get_or_insert_with(Instant::now);

        if let Some(max_elapsed) = self.max_elapsed {
            if started.elapsed() + self.current > max_elapsed {
                debug!("Backoff exhausted after {:?}", started.elapsed());
                return None;
            }
        }

        let delay = self.current;
        let next = Duration::from_secs_f64(delay.as_secs_f64() * self.multiplier.max(1.0));
        self.current = next.min(self.max_interval);
        Some(delay)
    }

    fn reset(&mut self) {
        self.current = self.initial_interval;
        self.started = None;
    }
}
