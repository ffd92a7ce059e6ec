//! Runs a closure immediately, then again every `interval`, swallowing
//! errors and panicking tasks alike so one bad tick never kills the loop.
//! Grounded on `original_source/service/src/scheduled.py`'s `scheduled`
//! decorator, reshaped around [`CancellationToken`] for graceful shutdown.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::error;

/// Drives `f` to completion once per tick until `token` is cancelled.
/// Cancellation is only observed between ticks and while sleeping, never
/// by aborting a tick in flight.
pub async fn every<F>(interval: Duration, token: CancellationToken, mut f: F)
where
    F: FnMut() -> Pin<Box<dyn Future<Output = ()> + Send>>,
{
    loop {
        f().await;

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Like [`every`], but logs and continues when `f` returns an error
/// instead of requiring the caller to swallow it inline.
pub async fn every_fallible<F>(interval: Duration, token: CancellationToken, mut f: F)
where
    F: FnMut() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>,
{
    loop {
        if let Err(e) = f().await {
            error!("scheduled task failed: {}", e);
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
