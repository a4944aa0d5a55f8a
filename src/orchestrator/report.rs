//! Run accounting: counts by error kind, health, and emitted artifacts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One representative failure, attached to the report per class
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSample {
    pub class: String,
    pub detail: String,
    pub count: u64,
}

/// Summary of one orchestrator run, serialized at the end of `crawl`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_slug: String,
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub seeds: Vec<String>,
    pub pages_fetched: usize,
    pub jobs_ingested: usize,
    pub duplicates: usize,
    pub rejections: usize,
    pub known_skipped: usize,
    pub errors_by_class: BTreeMap<String, u64>,
    /// Top three error classes with one sample each
    pub top_errors: Vec<ErrorSample>,
    /// Hosts whose circuit was open at the end of the run. A warning, not a
    /// failure, as long as something was ingested.
    pub circuit_tripped: Vec<String>,
    pub health_score: u32,
    pub output_paths: Vec<PathBuf>,
}

/// Mutable accumulator the workers feed while the run progresses
#[derive(Debug, Default)]
pub struct RunTally {
    pub pages_fetched: usize,
    pub jobs_ingested: usize,
    pub duplicates: usize,
    pub rejections: usize,
    pub known_skipped: usize,
    errors_by_class: BTreeMap<String, u64>,
    first_sample: BTreeMap<String, String>,
}

impl RunTally {
    pub fn record_error(&mut self, class: &str, detail: String) {
        *self.errors_by_class.entry(class.to_string()).or_default() += 1;
        self.first_sample.entry(class.to_string()).or_insert(detail);
    }

    pub fn error_count(&self, class: &str) -> u64 {
        self.errors_by_class.get(class).copied().unwrap_or(0)
    }

    /// The three most frequent classes, each with its first recorded sample
    pub fn top_errors(&self) -> Vec<ErrorSample> {
        let mut classes: Vec<(&String, &u64)> = self.errors_by_class.iter().collect();
        classes.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        classes
            .into_iter()
            .take(3)
            .map(|(class, count)| ErrorSample {
                class: class.clone(),
                detail: self.first_sample.get(class).cloned().unwrap_or_default(),
                count: *count,
            })
            .collect()
    }

    pub fn into_report(
        self,
        run_slug: String,
        trace_id: String,
        started_at: DateTime<Utc>,
        seeds: Vec<String>,
        circuit_tripped: Vec<String>,
        health_score: u32,
        output_paths: Vec<PathBuf>,
    ) -> RunReport {
        let top_errors = self.top_errors();
        RunReport {
            run_slug,
            trace_id,
            started_at,
            ended_at: Utc::now(),
            seeds,
            pages_fetched: self.pages_fetched,
            jobs_ingested: self.jobs_ingested,
            duplicates: self.duplicates,
            rejections: self.rejections,
            known_skipped: self.known_skipped,
            errors_by_class: self.errors_by_class,
            top_errors,
            circuit_tripped,
            health_score,
            output_paths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_errors_ranked_with_samples() {
        let mut tally = RunTally::default();
        tally.record_error("timeout", "first timeout".to_string());
        tally.record_error("timeout", "second timeout".to_string());
        tally.record_error("server_error", "HTTP 502".to_string());
        tally.record_error("rate_limited", "HTTP 429".to_string());
        tally.record_error("rate_limited", "HTTP 429 again".to_string());
        tally.record_error("rate_limited", "HTTP 429 yet again".to_string());
        tally.record_error("client_error", "HTTP 404".to_string());

        let top = tally.top_errors();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].class, "rate_limited");
        assert_eq!(top[0].count, 3);
        assert_eq!(top[0].detail, "HTTP 429");
        assert_eq!(top[1].class, "timeout");
        assert_eq!(top[2].class, "client_error"); // lexical tie-break at count 1
    }

    #[test]
    fn test_report_assembly() {
        let mut tally = RunTally::default();
        tally.pages_fetched = 3;
        tally.jobs_ingested = 30;
        let report = tally.into_report(
            "20250115_120000".to_string(),
            "trace".to_string(),
            Utc::now(),
            vec!["https://jobs.example.com/vagas".to_string()],
            Vec::new(),
            97,
            Vec::new(),
        );
        assert_eq!(report.jobs_ingested, 30);
        assert!(report.circuit_tripped.is_empty());
        assert_eq!(report.health_score, 97);
    }
}
