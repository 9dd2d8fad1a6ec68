use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::errors::{LinkError, LinkResult};

/// Periodic waiter that carries timing error forward between ticks.
///
/// A tick that runs long shortens the next one, so the average period
/// converges on `interval`. Delays never go below zero; under sustained
/// overload the deficit keeps growing instead of firing a burst.
pub struct DriftTimer {
    interval: Duration,
    last: Instant,
    /// Seconds owed (positive) or overdue (negative).
    drift: f64,
}

impl DriftTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
            drift: 0.0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn drift(&self) -> f64 {
        self.drift
    }

    fn next_delay(&self) -> Duration {
        let interval = self.interval.as_secs_f64();
        let elapsed = self.last.elapsed().as_secs_f64();
        Duration::from_secs_f64((interval - elapsed + self.drift).max(0.0))
    }

    fn settle(&mut self) {
        self.drift += self.interval.as_secs_f64() - self.last.elapsed().as_secs_f64();
        self.last = Instant::now();
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.settle();
    }

    pub async fn wait_or_cancel(&mut self, cancel: &CancellationToken) -> LinkResult<()> {
        let delay = self.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        self.settle();
        Ok(())
    }
}
