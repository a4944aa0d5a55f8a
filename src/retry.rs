//! Retry engine: classify failures, back off with jitter, give up cleanly.
//!
//! Any fallible async operation can be wrapped; the engine switches on the
//! [`FailureClass`] tag of the error, never on concrete error types. Circuit
//! rejections pass straight through without consuming attempts so the
//! breaker's fast-fail stays fast.

use crate::metrics::SharedMetrics;
use crate::rate_limiter::RateLimiter;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Failure taxonomy shared by the fetch and extraction layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    TransientNetwork,
    Timeout,
    RateLimited,
    ServerError,
    ClientError,
    ParseError,
    CircuitOpen,
    Fatal,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureClass::TransientNetwork
                | FailureClass::Timeout
                | FailureClass::RateLimited
                | FailureClass::ServerError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::TransientNetwork => "transient_network",
            FailureClass::Timeout => "timeout",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::ServerError => "server_error",
            FailureClass::ClientError => "client_error",
            FailureClass::ParseError => "parse_error",
            FailureClass::CircuitOpen => "circuit_open",
            FailureClass::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Implemented by errors the retry engine can reason about
pub trait Classify {
    fn class(&self) -> FailureClass;

    /// Server-provided backoff hint (e.g. a Retry-After header)
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Named attempt/backoff presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    pub name: &'static str,
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryStrategy {
    pub const fn conservative() -> Self {
        Self {
            name: "conservative",
            max_attempts: 2,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
        }
    }

    pub const fn standard() -> Self {
        Self {
            name: "standard",
            max_attempts: 3,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }

    pub const fn aggressive() -> Self {
        Self {
            name: "aggressive",
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(60),
        }
    }

    pub const fn network_heavy() -> Self {
        Self {
            name: "network_heavy",
            max_attempts: 4,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(120),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "conservative" => Some(Self::conservative()),
            "standard" => Some(Self::standard()),
            "aggressive" => Some(Self::aggressive()),
            "network_heavy" => Some(Self::network_heavy()),
            _ => None,
        }
    }

    /// `min(cap, base * 2^(attempt-1)) * (1 + jitter)`, jitter in [-0.2, 0.2]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(20)));
        let capped = exp.min(self.cap);
        let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
        capped.mul_f64(1.0 + jitter)
    }
}

/// Terminal outcome of a wrapped operation
#[derive(Debug)]
pub enum RetryError<E> {
    /// Retryable class kept failing through every attempt
    Exhausted {
        class: FailureClass,
        attempts: u32,
        source: E,
    },
    /// Non-retryable class, or a circuit rejection passed through
    Aborted(E),
    /// Cooperative cancellation between attempts
    Cancelled,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Exhausted {
                class,
                attempts,
                source,
            } => write!(f, "{class} after {attempts} attempts: {source}"),
            RetryError::Aborted(source) => write!(f, "{source}"),
            RetryError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

/// Wraps fallible units of work with classification-aware retries
pub struct RetryEngine {
    metrics: SharedMetrics,
    limiter: Option<Arc<RateLimiter>>,
}

impl RetryEngine {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            metrics,
            limiter: None,
        }
    }

    /// Wire the adaptive rate limiter: 429/5xx slow it down, successes feed
    /// its recovery streak.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub async fn run<T, E, F, Fut>(
        &self,
        strategy: RetryStrategy,
        context: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => {
                    if let Some(limiter) = &self.limiter {
                        limiter.on_success();
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let class = error.class();

                    // Circuit rejections are not the operation failing; they
                    // must not burn attempts.
                    if class == FailureClass::CircuitOpen {
                        return Err(RetryError::Aborted(error));
                    }

                    if matches!(class, FailureClass::RateLimited | FailureClass::ServerError) {
                        if let Some(limiter) = &self.limiter {
                            limiter.on_failure();
                        }
                    }

                    if !class.is_retryable() {
                        return Err(RetryError::Aborted(error));
                    }
                    if attempt >= strategy.max_attempts {
                        return Err(RetryError::Exhausted {
                            class,
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let mut wait = strategy.backoff(attempt);
                    if let Some(hint) = error.retry_after() {
                        wait = wait.max(hint);
                    }

                    self.metrics.inc("retry.attempt");
                    tracing::warn!(
                        context,
                        attempt,
                        class = %class,
                        wait_ms = wait.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }
}
