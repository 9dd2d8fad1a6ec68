use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    common::errors::LinkError,
    gateway::{engine::GatewayEngine, types::Disconnect},
};

/// Ack bookkeeping shared by the heartbeat loop and the reader.
///
/// The reader marks acks synchronously as frames arrive, before any listener
/// fan-out, so the loop never races a dispatched handler.
#[derive(Default)]
pub(crate) struct HeartbeatState {
    acked: AtomicBool,
    notify: Notify,
    sent_at: Mutex<Option<Instant>>,
    latency: Mutex<Option<Duration>>,
}

impl HeartbeatState {
    pub(crate) fn begin(&self) {
        self.acked.store(false, Ordering::SeqCst);
        *self.sent_at.lock() = Some(Instant::now());
    }

    pub(crate) fn acknowledge(&self) {
        if let Some(sent) = self.sent_at.lock().take() {
            *self.latency.lock() = Some(sent.elapsed());
        }
        self.acked.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn latency(&self) -> Option<Duration> {
        *self.latency.lock()
    }

    async fn wait_ack(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.acked.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Beats every `interval` and demands an ack before the next beat is due.
/// A missing ack is reported to the supervisor as a dead connection.
pub(crate) async fn run(
    engine: Arc<GatewayEngine>,
    generation: u64,
    interval: Duration,
    cancel: CancellationToken,
) {
    let ack_timeout = engine.options().heartbeat_ack_timeout.min(interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match engine.send_heartbeat().await {
            Ok(()) => {}
            Err(LinkError::Cancelled) | Err(LinkError::Disposed(_)) => break,
            Err(e) => {
                warn!("[{}] Failed to send heartbeat: {}", engine.label(), e);
                continue;
            }
        }

        let acked = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(ack_timeout, engine.heartbeat().wait_ack()) => r.is_ok(),
        };

        if acked {
            debug!(
                "[{}] Heartbeat acked in {:?}",
                engine.label(),
                engine.heartbeat().latency().unwrap_or_default()
            );
        } else {
            warn!(
                "[{}] No heartbeat ack within {:?}, treating connection as lost",
                engine.label(),
                ack_timeout
            );
            engine.signal(generation, Disconnect::HeartbeatTimeout);
            break;
        }
    }
}
