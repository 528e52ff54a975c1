//! Conflict retry
//!
//! Optimistic read-modify-write loop shared by every component that writes an
//! object the volume binder may touch concurrently.

use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounds for the conflict retry loop
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total write attempts before giving up
    pub max_attempts: u32,
    /// Delay after the first conflict
    pub initial_interval: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(10),
            multiplier: 2.0,
            max_interval: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_interval)
            .with_randomization_factor(0.1)
            .with_max_elapsed_time(None)
            .build()
    }
}

// =============================================================================
// Retry Loop
// =============================================================================

/// Fetch the latest version of an object, mutate it and write it back,
/// retrying from a fresh read whenever the write loses a version conflict.
///
/// `mutate` reports whether it changed anything; when it did not, no write is
/// issued and the fetched object is returned. A vanished object yields
/// `Ok(None)`. Errors other than [`Error::Conflict`] are returned unchanged.
pub async fn update_with_retry<T, F, FFut, M, W, WFut>(
    policy: &RetryPolicy,
    kind: &str,
    name: &str,
    mut fetch: F,
    mut mutate: M,
    mut write: W,
) -> Result<Option<T>>
where
    F: FnMut() -> FFut,
    FFut: Future<Output = Result<Option<T>>>,
    M: FnMut(&mut T) -> bool,
    W: FnMut(T) -> WFut,
    WFut: Future<Output = Result<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let Some(mut object) = fetch().await? else {
            debug!(kind = %kind, name = %name, "Object gone, nothing to update");
            return Ok(None);
        };

        if !mutate(&mut object) {
            return Ok(Some(object));
        }

        match write(object).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(err) if err.is_conflict() => {
                if attempt >= policy.max_attempts {
                    warn!(kind = %kind, name = %name, attempts = attempt, "Conflict retries exhausted");
                    return Err(Error::ConflictRetryExhausted {
                        kind: kind.into(),
                        name: name.into(),
                        attempts: attempt,
                    });
                }

                let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                debug!(
                    kind = %kind,
                    name = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Write conflict, retrying from a fresh read"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
