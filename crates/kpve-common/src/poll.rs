//! Bounded polling of long-running remote operations.
//!
//! Hypervisor tasks (image downloads, clones, template creation) finish
//! asynchronously. [`poll_until`] probes an operation on a jittered,
//! exponentially growing interval until it reports completion, the overall
//! deadline passes, or the caller cancels.
//!
//! # Example
//!
//! ```ignore
//! use kpve_common::poll::{poll_until, PollConfig};
//!
//! let status = poll_until(&PollConfig::default(), "clone", &cancel, || async {
//!     let status = client.task_status(&zone, &task).await?;
//!     Ok(status.is_finished().then_some(status))
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Configuration for waiting on a remote operation
#[derive(Clone, Debug)]
pub struct PollConfig {
    /// Give up after this long
    pub timeout: Duration,
    /// Delay before the second probe
    pub initial_interval: Duration,
    /// Upper bound for the delay between probes
    pub max_interval: Duration,
    /// Multiplier applied to the delay after every probe
    pub backoff_multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollConfig {
    /// Default intervals with a custom overall timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Probe `operation` until it yields `Some`, the timeout elapses, or `cancel` fires.
///
/// A probe error aborts the wait immediately; only "not finished yet" is retried.
pub async fn poll_until<F, Fut, T>(
    config: &PollConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut delay = config.initial_interval;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        if let Some(done) = operation().await? {
            debug!(operation = %operation_name, attempt, "operation finished");
            return Ok(done);
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(
                operation = %operation_name,
                attempt,
                timeout_secs = config.timeout.as_secs(),
                "operation did not finish in time"
            );
            return Err(Error::infrastructure(
                operation_name,
                format!("timed out after {}s", config.timeout.as_secs()),
            ));
        }

        // Add jitter: 0.5x to 1.5x of the delay, never past the deadline
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        let sleep_for = jittered.min(deadline - now);

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::infrastructure(operation_name, "cancelled while waiting"));
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_interval.as_secs_f64()),
        );
    }
}
