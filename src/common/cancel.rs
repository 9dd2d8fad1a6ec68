use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::common::errors::{LinkError, LinkResult};

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> LinkResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LinkError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Runs `fut` to completion unless `cancel` fires first.
pub async fn or_cancel<F: Future>(fut: F, cancel: &CancellationToken) -> LinkResult<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LinkError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Bounds `fut` by `limit` and `cancel`, mapping each to its own error.
pub async fn within<F: Future>(
    fut: F,
    limit: Duration,
    cancel: &CancellationToken,
) -> LinkResult<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LinkError::Cancelled),
        out = tokio::time::timeout(limit, fut) => out.map_err(|_| LinkError::Timeout(limit)),
    }
}
