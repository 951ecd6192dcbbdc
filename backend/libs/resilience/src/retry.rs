/// Retry with exponential backoff and jitter
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try)
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier applied after every failed attempt
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fixed-delay policy: the same pause after every failed attempt.
    ///
    /// Store writes use `fixed(3, 500ms)`: three extra attempts, half a
    /// second apart.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: delay,
            max_backoff: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Exponential policy starting at `initial` and growing by `multiplier`.
    pub fn exponential(max_retries: u32, initial: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_backoff: initial,
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: multiplier,
            jitter: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("{op}: max retries ({retries}) exceeded: {last}")]
    MaxRetriesExceeded {
        op: &'static str,
        retries: u32,
        last: E,
    },
}

impl<E: std::fmt::Display> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::MaxRetriesExceeded { last, .. } => last,
        }
    }
}

/// Execute a fallible future, retrying per `config`.
///
/// `op` labels the operation in retry logs so a busy cycle's warnings can
/// be traced back to the call that produced them.
pub async fn with_retry<F, Fut, T, E>(
    op: &'static str,
    config: RetryConfig,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    warn!(op, "max retries ({}) reached: {}", config.max_retries, e);
                    return Err(RetryError::MaxRetriesExceeded {
                        op,
                        retries: config.max_retries,
                        last: e,
                    });
                }

                let delay = apply_jitter(backoff, config.jitter);
                warn!(
                    op,
                    "attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    config.max_retries,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;

                backoff = Duration::from_millis(
                    ((backoff.as_millis() as f64 * config.backoff_multiplier)
                        .min(config.max_backoff.as_millis() as f64)) as u64,
                );
            }
        }
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let factor = 1.0 + rng.gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    } else {
        base
    }
}
