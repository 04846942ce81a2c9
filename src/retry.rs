//! Shared retry policy for remote-facing calls.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Bounded attempts with a fixed inter-attempt delay.
///
/// Every collaborator that talks to the remote site (probe, unit fetcher,
/// session construction) is driven by one of these instead of carrying its
/// own sleep loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Builds a policy; zero attempts is clamped to one.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Total attempts allowed, including the first.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Fixed delay inserted between attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Sleeps for the inter-attempt delay.
    pub async fn pause(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }

    /// Drives `op` until it succeeds or attempts are exhausted, returning the
    /// last error. The 1-based attempt number is passed in for logging.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.attempts => return Err(err),
                Err(_) => self.pause().await,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}
