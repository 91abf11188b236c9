use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff used by the HTTP transport for transient errors.
///
/// Delay for attempt `n` is `initial * 2^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("maximum retry attempts exceeded")]
pub struct MaxRetriesExceeded;

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay the next `sleep` call would wait, or `None` once the budget is spent
    pub fn next_delay(&self) -> Option<Duration> {
        if self.current_attempt >= self.max_retries {
            return None;
        }

        let factor = 2_u32.saturating_pow(self.current_attempt);
        Some(std::cmp::min(
            self.initial_delay.saturating_mul(factor),
            self.max_delay,
        ))
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        let delay = self.next_delay().ok_or(MaxRetriesExceeded)?;

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_and_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350), 4);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));

        let mut backoff = backoff;
        backoff.current_attempt = 1;
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        backoff.current_attempt = 2;
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(350)));
        backoff.current_attempt = 4;
        assert_eq!(backoff.next_delay(), None);
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 2);
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.attempts(), 2);
    }
}
