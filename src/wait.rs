//! Condition waiter
//!
//! Polls a predicate on a fixed interval until it holds, fails, or the
//! deadline passes. The array applies many changes asynchronously (LUN
//! formatting, pair synchronization, role switches); every such change is
//! observed through this one primitive.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Poll interval and deadline for one kind of wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Waiter {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Wait until `predicate` returns `Ok(true)`.
    ///
    /// The predicate is first evaluated one interval after the call. An
    /// error from the predicate ends the wait immediately.
    pub async fn until<F, Fut>(&self, what: &str, predicate: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        wait_for(what, predicate, self.interval, self.timeout).await
    }
}

/// Free-standing form of [`Waiter::until`]
pub async fn wait_for<F, Fut>(what: &str, mut predicate: F, interval: Duration, timeout: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let polling = async {
        let mut attempt = 0u32;
        loop {
            tokio::time::sleep(interval).await;
            attempt += 1;
            if predicate().await? {
                debug!("Condition '{}' met after {} polls", what, attempt);
                return Ok(());
            }
        }
    };

    match tokio::time::timeout_at(deadline, polling).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Timed out after {:?} waiting for {}", timeout, what);
            Err(Error::Timeout {
                what: what.to_string(),
                after: timeout,
            })
        }
    }
}
