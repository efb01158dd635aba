use std::future::Future;

use tokio::time::Duration;
use tracing::warn;

/// Exponential backoff for calls to the ledger node.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    backoff: Duration,
    retries: u32,
    max_retries: u32,
}

impl RetryPolicy {
    /// Waits `backoff` before the first retry.
    pub fn new(backoff: Duration, max_retries: u32) -> Self {
        Self {
            backoff,
            retries: 0,
            max_retries,
        }
    }

    /// Waits before the next attempt and doubles the wait after it.
    /// Returns `false` once the attempts are used up.
    pub async fn backoff(&mut self) -> bool {
        if self.retries >= self.max_retries {
            return false;
        }
        tokio::time::sleep(self.backoff).await;
        self.backoff = self.backoff.saturating_mul(2);
        self.retries += 1;
        true
    }

    /// Runs `f` until it succeeds, fails with an error `retryable` refuses,
    /// or the attempts are used up.
    pub async fn retry<T, E, F, Fut>(
        mut self,
        mut f: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if retryable(&e) => {
                    warn!(retries = self.retries, "ledger call failed: {e}");
                    if !self.backoff().await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
