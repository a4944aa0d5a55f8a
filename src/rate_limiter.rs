//! Token-bucket request pacing with adaptive slowdown.
//!
//! One limiter is shared per host. [`RateLimiter::acquire`] blocks until a
//! token is available. The retry engine calls [`RateLimiter::on_failure`]
//! when the server pushes back (HTTP 429 / 5xx), halving the effective rate
//! down to a floor of 10% of the configured baseline; a streak of 20
//! successes recovers the rate by 20% steps up to the baseline.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const RATE_FLOOR_FRACTION: f64 = 0.1;
const RECOVERY_STREAK: u32 = 20;
const RECOVERY_FACTOR: f64 = 1.2;
const SLOWDOWN_FACTOR: f64 = 0.5;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
    success_streak: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    base_rate: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            base_rate: rate_per_second,
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                rate: rate_per_second,
                last_refill: Instant::now(),
                success_streak: 0,
            }),
        }
    }

    /// Block until a token is available. No lock is held while sleeping.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * bucket.rate).min(self.burst);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a pushback from the server and halve the effective rate
    pub fn on_failure(&self) {
        let mut bucket = self.state.lock();
        let floor = self.base_rate * RATE_FLOOR_FRACTION;
        bucket.rate = (bucket.rate * SLOWDOWN_FACTOR).max(floor);
        bucket.success_streak = 0;
        tracing::debug!(rate = bucket.rate, "rate limiter slowed down");
    }

    /// Record a success; a sustained streak recovers toward the baseline
    pub fn on_success(&self) {
        let mut bucket = self.state.lock();
        bucket.success_streak += 1;
        if bucket.success_streak >= RECOVERY_STREAK && bucket.rate < self.base_rate {
            bucket.rate = (bucket.rate * RECOVERY_FACTOR).min(self.base_rate);
            bucket.success_streak = 0;
            tracing::debug!(rate = bucket.rate, "rate limiter recovering");
        }
    }

    pub fn effective_rate(&self) -> f64 {
        self.state.lock().rate
    }
}

/// One limiter per host, all sharing the configured baseline
pub struct RateLimiterRegistry {
    rate_per_second: f64,
    burst: u32,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            rate_per_second,
            burst,
            limiters: DashMap::new(),
        }
    }

    pub fn get(&self, host: &str) -> Arc<RateLimiter> {
        self.limiters
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(self.rate_per_second, self.burst)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_paced() {
        let limiter = RateLimiter::new(5.0, 2);
        let start = Instant::now();

        // Burst tokens are free
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The next one waits for a refill
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_bound_over_window() {
        let rate = 5.0;
        let burst = 3;
        let limiter = RateLimiter::new(rate, burst);
        let start = Instant::now();

        let mut acquired_in_window = 0u32;
        let window = Duration::from_secs(10);
        loop {
            limiter.acquire().await;
            if start.elapsed() > window {
                break;
            }
            acquired_in_window += 1;
        }
        assert!(
            acquired_in_window as f64 <= rate * 10.0 + burst as f64,
            "acquired {acquired_in_window} tokens in a 10s window"
        );
    }

    #[test]
    fn test_failure_halves_with_floor() {
        let limiter = RateLimiter::new(10.0, 1);
        limiter.on_failure();
        assert_eq!(limiter.effective_rate(), 5.0);
        for _ in 0..10 {
            limiter.on_failure();
        }
        assert_eq!(limiter.effective_rate(), 1.0); // 10% floor
    }

    #[test]
    fn test_success_streak_recovers() {
        let limiter = RateLimiter::new(10.0, 1);
        limiter.on_failure();
        limiter.on_failure();
        assert_eq!(limiter.effective_rate(), 2.5);

        for _ in 0..20 {
            limiter.on_success();
        }
        assert_eq!(limiter.effective_rate(), 3.0);

        // Recovery never exceeds the configured baseline
        for _ in 0..200 {
            limiter.on_success();
        }
        assert!(limiter.effective_rate() <= 10.0);
    }

    #[test]
    fn test_registry_is_per_host() {
        let registry = RateLimiterRegistry::new(10.0, 2);
        let a = registry.get("a.example.com");
        let b = registry.get("b.example.com");
        a.on_failure();
        assert_eq!(a.effective_rate(), 5.0);
        assert_eq!(b.effective_rate(), 10.0);
        // Same host returns the same limiter
        assert_eq!(registry.get("a.example.com").effective_rate(), 5.0);
    }

    #[test]
    fn test_failure_resets_streak() {
        let limiter = RateLimiter::new(10.0, 1);
        limiter.on_failure();
        for _ in 0..19 {
            limiter.on_success();
        }
        limiter.on_failure();
        for _ in 0..19 {
            limiter.on_success();
        }
        // Two interrupted streaks never recover
        assert_eq!(limiter.effective_rate(), 2.5);
    }
}
