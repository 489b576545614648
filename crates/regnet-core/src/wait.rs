//! Retry-until-success polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::{Error, Result};

/// Invoke `probe` every `interval` until it succeeds.
///
/// The first probe fires immediately. Once a probe fails after more than
/// `timeout` has elapsed, the last failure is returned wrapped in
/// [`Error::Timeout`]. Only the calling task is suspended between probes.
pub async fn wait_for<T, F, Fut>(mut probe: F, interval: Duration, timeout: Duration) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match probe().await {
            Ok(value) => return Ok(value),
            Err(err) if started.elapsed() > timeout => {
                tracing::debug!(attempts, error = %err, "gave up waiting");
                return Err(Error::Timeout(Box::new(err)));
            }
            Err(err) => {
                tracing::trace!(attempts, error = %err, "probe failed, retrying");
                tokio::time::sleep(interval).await;
            }
        }
    }
}
