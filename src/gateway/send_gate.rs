use std::{collections::VecDeque, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{
    cancel::{or_cancel, sleep_or_cancel},
    errors::LinkResult,
};

/// Sliding-window gate: at most `limit` sends in any rolling `window`.
pub struct SendGate {
    limit: usize,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl SendGate {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            sent: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Waits until one more send fits in the window and records it.
    pub async fn acquire(&self, cancel: &CancellationToken) -> LinkResult<()> {
        let mut sent = or_cancel(self.sent.lock(), cancel).await?;
        loop {
            let now = Instant::now();
            while sent
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                sent.pop_front();
            }
            if sent.len() < self.limit {
                sent.push_back(now);
                return Ok(());
            }
            let oldest = sent.front().copied().unwrap_or(now);
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            debug!("send gate full ({} in window), waiting {:?}", sent.len(), wait);
            sleep_or_cancel(wait, cancel).await?;
        }
    }
}
