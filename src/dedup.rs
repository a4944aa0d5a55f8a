//! Four-level duplicate detection over job records.
//!
//! Levels, evaluated in order with the first positive match winning:
//! 1. exact canonical URL
//! 2. content fingerprint
//! 3. case-folded (title, company) pair
//! 4. fuzzy title similarity against a bounded LRU of recent titles, gated
//!    by company token overlap
//!
//! Memory stays bounded: three hash sets plus the title LRU. `clean_file`
//! rewrites a JSON job file in place after creating a `.bak` sibling.

use crate::models::{fold_whitespace, Job};
use lru::LruCache;
use serde::Serialize;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use strsim::normalized_levenshtein;
use thiserror::Error;

const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;
const DEFAULT_RECENT_TITLES: usize = 500;
const COMPANY_TOKEN_OVERLAP: f64 = 0.5;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dedup file i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dedup file parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported file shape: expected a job array or {{\"jobs\": [...]}}")]
    UnsupportedShape,
}

/// Which level caught the duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DupReason {
    Url,
    Fingerprint,
    TitleCompany,
    FuzzyTitle,
}

impl DupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DupReason::Url => "url",
            DupReason::Fingerprint => "fingerprint",
            DupReason::TitleCompany => "title_company",
            DupReason::FuzzyTitle => "fuzzy_title",
        }
    }
}

/// Result of deduplicating one batch
#[derive(Debug)]
pub struct DedupOutcome {
    pub unique: Vec<Job>,
    pub duplicates: Vec<(Job, DupReason)>,
}

/// Summary returned by [`Deduplicator::clean_file`]
#[derive(Debug, Clone, Serialize)]
pub struct DedupReport {
    pub total: usize,
    pub unique: usize,
    pub removed: usize,
    pub by_url: usize,
    pub by_fingerprint: usize,
    pub by_title_company: usize,
    pub by_fuzzy_title: usize,
    pub backup_path: PathBuf,
}

pub struct Deduplicator {
    seen_urls: HashSet<String>,
    seen_fingerprints: HashSet<String>,
    seen_title_company: HashSet<String>,
    /// folded title -> folded company, most recent first
    recent_titles: LruCache<String, String>,
    similarity_threshold: f64,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_RECENT_TITLES)
    }
}

impl Deduplicator {
    pub fn new(similarity_threshold: f64, recent_titles: usize) -> Self {
        Self {
            seen_urls: HashSet::new(),
            seen_fingerprints: HashSet::new(),
            seen_title_company: HashSet::new(),
            recent_titles: LruCache::new(
                NonZeroUsize::new(recent_titles).unwrap_or(NonZeroUsize::MIN),
            ),
            similarity_threshold,
        }
    }

    /// Check a job against everything observed so far, without recording it
    pub fn check(&self, job: &Job) -> Option<DupReason> {
        if self.seen_urls.contains(&job.url) {
            return Some(DupReason::Url);
        }
        if self.seen_fingerprints.contains(&job.source_fingerprint) {
            return Some(DupReason::Fingerprint);
        }
        if self.seen_title_company.contains(&job.title_company_key()) {
            return Some(DupReason::TitleCompany);
        }

        let title = fold_title(&job.title);
        let company = fold_title(&job.company);
        for (seen_title, seen_company) in self.recent_titles.iter() {
            if normalized_levenshtein(&title, seen_title) > self.similarity_threshold
                && company_overlap(&company, seen_company) >= COMPANY_TOKEN_OVERLAP
            {
                return Some(DupReason::FuzzyTitle);
            }
        }
        None
    }

    /// Record a job as seen
    pub fn observe(&mut self, job: &Job) {
        self.seen_urls.insert(job.url.clone());
        self.seen_fingerprints
            .insert(job.source_fingerprint.clone());
        self.seen_title_company.insert(job.title_company_key());
        self.recent_titles
            .put(fold_title(&job.title), fold_title(&job.company));
    }

    /// Split a batch into unique records and tagged duplicates. Order of the
    /// unique records is preserved.
    pub fn dedupe(&mut self, jobs: Vec<Job>) -> DedupOutcome {
        let mut unique = Vec::new();
        let mut duplicates = Vec::new();
        for job in jobs {
            match self.check(&job) {
                Some(reason) => {
                    tracing::debug!(url = %job.url, reason = reason.as_str(), "duplicate dropped");
                    duplicates.push((job, reason));
                }
                None => {
                    self.observe(&job);
                    unique.push(job);
                }
            }
        }
        DedupOutcome { unique, duplicates }
    }

    /// Deduplicate a JSON job file in place. The original bytes are saved to
    /// a `.bak` sibling before the file is rewritten atomically.
    ///
    /// Accepts either a bare array of jobs or an object with a `jobs` array;
    /// the shape is preserved on rewrite.
    pub fn clean_file(&mut self, path: &Path) -> Result<DedupReport, DedupError> {
        let original = std::fs::read(path)?;
        let value: serde_json::Value = serde_json::from_slice(&original)?;

        let (jobs_value, wrapped) = match &value {
            serde_json::Value::Array(items) => (items.clone(), None),
            serde_json::Value::Object(map) => match map.get("jobs") {
                Some(serde_json::Value::Array(items)) => (items.clone(), Some(map.clone())),
                _ => return Err(DedupError::UnsupportedShape),
            },
            _ => return Err(DedupError::UnsupportedShape),
        };
        let jobs: Vec<Job> = jobs_value
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;

        let backup_path = {
            let mut os = path.to_path_buf().into_os_string();
            os.push(".bak");
            PathBuf::from(os)
        };
        std::fs::write(&backup_path, &original)?;

        let total = jobs.len();
        let outcome = self.dedupe(jobs);
        let mut report = DedupReport {
            total,
            unique: outcome.unique.len(),
            removed: outcome.duplicates.len(),
            by_url: 0,
            by_fingerprint: 0,
            by_title_company: 0,
            by_fuzzy_title: 0,
            backup_path,
        };
        for (_, reason) in &outcome.duplicates {
            match reason {
                DupReason::Url => report.by_url += 1,
                DupReason::Fingerprint => report.by_fingerprint += 1,
                DupReason::TitleCompany => report.by_title_company += 1,
                DupReason::FuzzyTitle => report.by_fuzzy_title += 1,
            }
        }

        let rewritten = match wrapped {
            Some(mut map) => {
                map.insert("jobs".to_string(), serde_json::to_value(&outcome.unique)?);
                serde_json::to_vec_pretty(&serde_json::Value::Object(map))?
            }
            None => serde_json::to_vec_pretty(&outcome.unique)?,
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &rewritten)?;
        std::fs::rename(&tmp, path)?;

        tracing::info!(
            path = %path.display(),
            total,
            unique = report.unique,
            removed = report.removed,
            "file deduplicated"
        );
        Ok(report)
    }
}

fn fold_title(text: &str) -> String {
    fold_whitespace(&text.to_lowercase())
}

/// Fraction of shared tokens relative to the smaller company name
fn company_overlap(a: &str, b: &str) -> f64 {
    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    let shared = tokens_a.intersection(&tokens_b).count();
    shared as f64 / tokens_a.len().min(tokens_b.len()) as f64
}
