//! Retry policy for transient I/O failures and a per-chain circuit breaker.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

/// Lower-cased substrings that mark an error as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "connection refused",
    "connection reset",
    "eof",
    "temporary failure",
    "too many requests",
    "rate limit",
    "429",
    "502",
    "503",
    "504",
    "busy",
    "unavailable",
];

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

pub fn is_retryable(err: &impl Display) -> bool {
    let msg = err.to_string().to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| msg.contains(p))
}

/// Exponential backoff for `attempt` (0-based) with +-25% jitter.
pub fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = cfg
        .base_delay
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exp.min(cfg.max_delay);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    capped.mul_f64(jitter)
}

/// Run `op` with retries. Non-retryable errors and the final attempt's
/// error are returned unchanged.
pub async fn with_retries<T, E, F, Fut>(cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) || attempt + 1 >= cfg.max_attempts.max(1) {
                    return Err(err);
                }
                let delay = backoff_delay(cfg, attempt);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Opens after `threshold` consecutive failures and stays open for
/// `reset_after`; a success closes it immediately.
#[derive(Debug)]
pub struct CircuitBreaker {
    failures: u32,
    threshold: u32,
    reset_after: Duration,
    last_failure: Option<Instant>,
    open: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            failures: 0,
            threshold,
            reset_after,
            last_failure: None,
            open: false,
        }
    }

    pub fn allow(&mut self) -> bool {
        if !self.open {
            return true;
        }
        match self.last_failure {
            Some(at) if at.elapsed() > self.reset_after => {
                self.open = false;
                self.failures = 0;
                true
            }
            _ => false,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.open = false;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        if self.failures >= self.threshold {
            self.open = true;
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}
