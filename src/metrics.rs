//! Thread-safe metrics for crawl progress and pipeline health.
//!
//! Three primitive types - counters, gauges, and latency histograms - are
//! kept in an in-memory registry and flushed to a JSON snapshot at the end
//! of a run. Publishing is pull-based via [`Metrics::snapshot`]; there is no
//! callback fan-out.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Latency histogram with fixed millisecond buckets
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<(u64, u64)>,
    sum_ms: u64,
    count: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: vec![
                (5, 0),
                (10, 0),
                (50, 0),
                (100, 0),
                (500, 0),
                (1_000, 0),
                (5_000, 0),
                (30_000, 0),
            ],
            sum_ms: 0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value_ms: u64) {
        self.sum_ms += value_ms;
        self.count += 1;
        for (threshold, count) in &mut self.buckets {
            if value_ms <= *threshold {
                *count += 1;
                break;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.count as f64
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: u64,
    pub mean_ms: f64,
    pub buckets: Vec<(u64, u64)>,
}

/// Health summary derived from the registry at snapshot time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// 0-100
    pub score: u32,
    pub success_ratio: f64,
    pub validation_quality: f64,
    pub open_circuits: u64,
}

/// Full registry snapshot, serialized to `metrics_<run_slug>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
    pub health: HealthReport,
}

/// Registry of named counters, gauges, and histograms
pub struct Metrics {
    counters: DashMap<String, Arc<AtomicU64>>,
    gauges: DashMap<String, Arc<Mutex<f64>>>,
    histograms: DashMap<String, Arc<Mutex<Histogram>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        *self
            .gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(0.0)))
            .lock() = value;
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|g| *g.lock())
    }

    pub fn observe(&self, name: &str, duration: Duration) {
        self.observe_ms(name, duration.as_millis() as u64);
    }

    pub fn observe_ms(&self, name: &str, value_ms: u64) {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Histogram::new())))
            .lock()
            .observe(value_ms);
    }

    /// Health score 0-100 from success ratio, mean validation quality, and
    /// the number of open circuits. Crossing a threshold logs a warning.
    pub fn health(&self) -> HealthReport {
        let success = self.counter("fetch.success") as f64;
        let failure = self.counter("fetch.failure") as f64;
        let success_ratio = if success + failure == 0.0 {
            1.0
        } else {
            success / (success + failure)
        };

        let validation_quality = self.gauge("validation.quality_score").unwrap_or(1.0);
        let open_circuits = self.gauge("circuit.open_count").unwrap_or(0.0).max(0.0) as u64;
        let circuit_factor = 1.0 / (1.0 + open_circuits as f64);

        let score = (100.0
            * (0.5 * success_ratio + 0.3 * validation_quality.clamp(0.0, 1.0) + 0.2 * circuit_factor))
            .round()
            .clamp(0.0, 100.0) as u32;

        if success_ratio < 0.5 {
            tracing::warn!(success_ratio, "fetch success ratio below 50%");
        }
        if validation_quality < 0.7 {
            tracing::warn!(validation_quality, "validation quality below 70%");
        }
        if open_circuits > 0 {
            tracing::warn!(open_circuits, "circuits currently open");
        }

        HealthReport {
            score,
            success_ratio,
            validation_quality,
            open_circuits,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), *e.value().lock()))
            .collect();
        let histograms = self
            .histograms
            .iter()
            .map(|e| {
                let h = e.value().lock();
                (
                    e.key().clone(),
                    HistogramSnapshot {
                        count: h.count,
                        sum_ms: h.sum_ms,
                        mean_ms: h.mean_ms(),
                        buckets: h.buckets.clone(),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            counters,
            gauges,
            histograms,
            health: self.health(),
        }
    }

    /// Serialize the snapshot to `<dir>/metrics_<run_slug>.json` via a temp
    /// file and atomic rename.
    pub fn flush(&self, dir: &Path, run_slug: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let snapshot = self.snapshot();
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let final_path = dir.join(format!("metrics_{run_slug}.json"));
        let tmp_path = dir.join(format!(".metrics_{run_slug}.json.tmp"));
        std::fs::write(&tmp_path, &body)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_counter_accumulates() {
        let metrics = Metrics::new();
        metrics.inc("retry.attempt");
        metrics.add("retry.attempt", 5);
        assert_eq!(metrics.counter("retry.attempt"), 6);
        assert_eq!(metrics.counter("missing"), 0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let metrics = Metrics::new();
        metrics.set_gauge("pool.size", 3.0);
        metrics.set_gauge("pool.size", 2.0);
        assert_eq!(metrics.gauge("pool.size"), Some(2.0));
    }

    #[test]
    fn test_histogram_mean() {
        let mut hist = Histogram::new();
        hist.observe(5);
        hist.observe(10);
        hist.observe(15);
        assert_eq!(hist.count(), 3);
        assert_eq!(hist.mean_ms(), 10.0);
    }

    #[test]
    fn test_health_perfect_run() {
        let metrics = Metrics::new();
        metrics.add("fetch.success", 30);
        metrics.set_gauge("validation.quality_score", 1.0);
        let health = metrics.health();
        assert_eq!(health.score, 100);
    }

    #[test]
    fn test_health_degrades_with_failures_and_open_circuits() {
        let metrics = Metrics::new();
        metrics.add("fetch.success", 10);
        metrics.add("fetch.failure", 10);
        metrics.set_gauge("validation.quality_score", 0.5);
        metrics.set_gauge("circuit.open_count", 1.0);
        let health = metrics.health();
        assert!(health.score < 60, "score was {}", health.score);
        assert_eq!(health.open_circuits, 1);
    }

    #[test]
    fn test_flush_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let metrics = Metrics::new();
        metrics.inc("fetch.success");
        metrics.observe_ms("fetch.latency", 42);

        let path = metrics.flush(dir.path(), "20250115_120000").unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        let parsed: MetricsSnapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.counters.get("fetch.success"), Some(&1));
        assert_eq!(parsed.histograms.get("fetch.latency").unwrap().count, 1);
    }
}
