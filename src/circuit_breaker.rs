//! Per-host circuit breaker with half-open probing.
//!
//! CLOSED keeps a sliding window of recent outcomes and trips to OPEN when
//! the failure ratio crosses the threshold over enough samples. OPEN fails
//! fast until the cool-off elapses, then HALF_OPEN admits a bounded number
//! of probes; all probes succeeding closes the circuit, any failure reopens
//! it with an exponentially increased cool-off.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Sliding window length in CLOSED
    pub window: usize,
    /// Minimum samples before the ratio is meaningful
    pub min_samples: usize,
    /// Failure ratio that trips the breaker
    pub trip_threshold: f64,
    pub cool_off: Duration,
    pub max_cool_off: Duration,
    /// Concurrent probes admitted in HALF_OPEN
    pub probe_count: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 20,
            trip_threshold: 0.5,
            cool_off: Duration::from_secs(30),
            max_cool_off: Duration::from_secs(300),
            probe_count: 1,
        }
    }
}

#[derive(Debug)]
enum State {
    Closed {
        outcomes: VecDeque<bool>,
    },
    Open {
        until: Instant,
        cool_off: Duration,
    },
    HalfOpen {
        in_flight: u32,
        successes: u32,
        cool_off: Duration,
    },
}

#[derive(Debug, Error)]
#[error("circuit open for {name}, retry in {retry_in:?}")]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_in: Duration,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed {
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// Gate a request. Callers must pair every successful acquire with one
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure) call.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { until, cool_off } => {
                let now = Instant::now();
                if now >= *until {
                    let cool_off = *cool_off;
                    tracing::info!(circuit = %self.name, "circuit half-open, probing");
                    *state = State::HalfOpen {
                        in_flight: 1,
                        successes: 0,
                        cool_off,
                    };
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        name: self.name.clone(),
                        retry_in: *until - now,
                    })
                }
            }
            State::HalfOpen { in_flight, .. } => {
                if *in_flight < self.config.probe_count {
                    *in_flight += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        name: self.name.clone(),
                        retry_in: Duration::ZERO,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { outcomes } => {
                push_outcome(outcomes, self.config.window, true);
            }
            State::HalfOpen {
                in_flight,
                successes,
                ..
            } => {
                *in_flight = in_flight.saturating_sub(1);
                *successes += 1;
                if *successes >= self.config.probe_count {
                    tracing::info!(circuit = %self.name, "circuit closed after probe success");
                    *state = State::Closed {
                        outcomes: VecDeque::new(),
                    };
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { outcomes } => {
                push_outcome(outcomes, self.config.window, false);
                if outcomes.len() >= self.config.min_samples {
                    let failures = outcomes.iter().filter(|ok| !**ok).count();
                    let ratio = failures as f64 / outcomes.len() as f64;
                    if ratio > self.config.trip_threshold {
                        tracing::warn!(
                            circuit = %self.name,
                            ratio,
                            samples = outcomes.len(),
                            "circuit tripped open"
                        );
                        *state = State::Open {
                            until: Instant::now() + self.config.cool_off,
                            cool_off: self.config.cool_off,
                        };
                    }
                }
            }
            State::HalfOpen { cool_off, .. } => {
                let escalated = (*cool_off * 2).min(self.config.max_cool_off);
                tracing::warn!(
                    circuit = %self.name,
                    cool_off_secs = escalated.as_secs(),
                    "probe failed, circuit reopened"
                );
                *state = State::Open {
                    until: Instant::now() + escalated,
                    cool_off: escalated,
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.state.lock(), State::Open { .. })
    }

    pub fn state_name(&self) -> &'static str {
        match &*self.state.lock() {
            State::Closed { .. } => "closed",
            State::Open { .. } => "open",
            State::HalfOpen { .. } => "half_open",
        }
    }
}

fn push_outcome(outcomes: &mut VecDeque<bool>, window: usize, ok: bool) {
    if outcomes.len() == window {
        outcomes.pop_front();
    }
    outcomes.push_back(ok);
}

/// Shared registry of breakers, one per host or logical operation name
#[derive(Default)]
pub struct CircuitRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn open_count(&self) -> usize {
        self.breakers.iter().filter(|e| e.value().is_open()).count()
    }

    /// Names of breakers currently open, for the run report
    pub fn tripped(&self) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|e| e.value().is_open())
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            window: 20,
            min_samples: 20,
            trip_threshold: 0.5,
            cool_off: Duration::from_secs(30),
            max_cool_off: Duration::from_secs(300),
            probe_count: 1,
        }
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..25 {
            if breaker.try_acquire().is_ok() {
                breaker.record_failure();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_min_samples() {
        let breaker = CircuitBreaker::new("jobs.example.com", quick_config());

        // 19 failures: not enough samples yet
        for _ in 0..19 {
            breaker.try_acquire().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state_name(), "closed");

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state_name(), "open");
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_outcomes_below_threshold_stay_closed() {
        let breaker = CircuitBreaker::new("jobs.example.com", quick_config());
        for i in 0..40 {
            breaker.try_acquire().unwrap();
            if i % 3 == 0 {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
        }
        assert_eq!(breaker.state_name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new("jobs.example.com", quick_config());
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(31)).await;
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state_name(), "half_open");
        breaker.record_success();
        assert_eq!(breaker.state_name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_at_most_probe_count() {
        let mut config = quick_config();
        config.probe_count = 2;
        let breaker = CircuitBreaker::new("jobs.example.com", config);
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(31)).await;
        breaker.try_acquire().unwrap();
        breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_err(), "third probe must be rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_escalates_cool_off() {
        let breaker = CircuitBreaker::new("jobs.example.com", quick_config());
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(31)).await;
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state_name(), "open");

        // The original 30s cool-off is not enough anymore
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_tracks_open_breakers() {
        let registry = CircuitRegistry::new(quick_config());
        let a = registry.get("a.example.com");
        let _b = registry.get("b.example.com");

        trip(&a);
        assert_eq!(registry.open_count(), 1);
        assert_eq!(registry.tripped(), vec!["a.example.com".to_string()]);
        // Same name returns the same breaker
        assert!(registry.get("a.example.com").is_open());
    }
}
