use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            jitter_max: Some(Duration::from_millis(25)),
        }
    }
}

impl RetryConfig {
    /// Slot reservation: 3 tries, 100ms doubling, no jitter.
    pub fn assignment() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            jitter_max: None,
        }
    }

    /// Provider calls (embeddings, selection criteria) that are safe to repeat.
    pub fn provider() -> Self {
        Self {
            max_attempts: 2,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(2000),
            jitter_max: Some(Duration::from_millis(100)),
        }
    }

    /// Delay slept after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let backoff = self.base_backoff.saturating_mul(2u32.saturating_pow(exponent));
        let backoff = std::cmp::min(backoff, self.max_backoff);

        match self.jitter_max {
            Some(jitter_max) if !jitter_max.is_zero() => {
                let jitter_ms = jitter_max.as_millis() as u64;
                backoff + Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
            }
            _ => backoff,
        }
    }
}

/// Bounded retry loop; errors for which `should_retry` is false return immediately.
pub async fn retry_async_if<F, Fut, T, E, P>(
    config: RetryConfig,
    mut f: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                let wait = config.backoff_for(attempt);
                tracing::debug!(attempt, ?wait, "retrying after failure");
                tokio::time::sleep(wait).await;
            }
        }
    }
}
