use std::future::Future;
use std::time::Duration;

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every re-attempt.
    Fixed(Duration),
    /// The delay doubles after each failed attempt, starting here.
    Exponential(Duration),
}

/// Bounded retry policy wrapped around producer sends. Injected by the
/// composition root — nothing in the pipeline hard-codes attempt counts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Backoff::Exponential(initial_delay),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay to sleep after the given 1-based failed attempt.
    fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            // Shift capped so a long retry ladder cannot overflow
            Backoff::Exponential(initial) => initial * (1u32 << attempt.saturating_sub(1).min(16)),
        }
    }

    /// Run `op` up to the configured number of attempts, sleeping the
    /// backoff delay between failures. Returns the final error once the
    /// attempts are exhausted.
    pub fn execute<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(_) => {
                    std::thread::sleep(self.delay_after(attempt));
                    attempt += 1;
                }
            }
        }
    }

    /// Async twin of [`execute`]: the same policy with `tokio` sleeps.
    ///
    /// [`execute`]: RetryPolicy::execute
    pub async fn execute_async<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(_) => {
                    tokio::time::sleep(self.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(50))
    }
}
