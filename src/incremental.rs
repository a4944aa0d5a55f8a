//! Incremental processing: durable seen-sets, per-page classification, and
//! the early-stop policy that lets repeated runs finish on the first page.
//!
//! The checkpoint (`incremental_checkpoint.json`, schema 1) holds every URL
//! and fingerprint ever ingested plus a bounded session history. It is
//! written atomically at the end of each page batch and never shrinks
//! without an explicit reset.

use crate::models::Job;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CHECKPOINT_SCHEMA: u32 = 1;
const SESSION_HISTORY_LIMIT: usize = 100;
const DEFAULT_NEW_RATIO_THRESHOLD: f64 = 0.30;
const KNOWN_STREAK_TO_STOP: u32 = 2;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One run's contribution, kept in the checkpoint's session history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub new: usize,
    pub known: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDoc {
    schema: u32,
    seen_urls: Vec<String>,
    seen_fingerprints: Vec<String>,
    #[serde(default)]
    sessions: Vec<SessionRecord>,
}

/// Classification of one candidate against the seen-sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobClass {
    New,
    Known,
    /// URL already ingested but the content changed; carries the key of the
    /// prior record.
    Changed { prior_key: String },
}

/// Outcome of filtering one page of candidates
#[derive(Debug)]
pub struct PageDecision {
    /// New and changed records, in page order
    pub fresh: Vec<Job>,
    pub new_count: usize,
    pub known_count: usize,
    pub changed_count: usize,
    pub new_ratio: f64,
    /// False once the early-stop policy fires (never in forced mode)
    pub should_continue: bool,
}

pub struct IncrementalProcessor {
    path: PathBuf,
    seen_urls: HashSet<String>,
    seen_fingerprints: HashSet<String>,
    sessions: Vec<SessionRecord>,
    current: SessionRecord,
    /// Consecutive already-known jobs across page boundaries
    known_streak: u32,
    threshold: f64,
    forced: bool,
}

impl IncrementalProcessor {
    /// Load (or initialize) the checkpoint at `path` and start a session
    pub fn open(path: impl Into<PathBuf>, forced: bool) -> Result<Self, CheckpointError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let doc = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CheckpointDoc>(&content) {
                Ok(doc) if doc.schema == CHECKPOINT_SCHEMA => Some(doc),
                Ok(doc) => {
                    tracing::warn!(schema = doc.schema, "unsupported checkpoint schema, starting fresh");
                    None
                }
                Err(error) => {
                    tracing::warn!(%error, "unreadable checkpoint, starting fresh");
                    None
                }
            },
            Err(_) => None,
        };

        let (seen_urls, seen_fingerprints, sessions) = match doc {
            Some(doc) => (
                doc.seen_urls.into_iter().collect(),
                doc.seen_fingerprints.into_iter().collect(),
                doc.sessions,
            ),
            None => (HashSet::new(), HashSet::new(), Vec::new()),
        };

        tracing::info!(
            seen_urls = seen_urls.len(),
            path = %path.display(),
            "incremental checkpoint loaded"
        );

        Ok(Self {
            path,
            seen_urls,
            seen_fingerprints,
            sessions,
            current: SessionRecord {
                started_at: Utc::now(),
                ended_at: None,
                new: 0,
                known: 0,
            },
            known_streak: 0,
            threshold: DEFAULT_NEW_RATIO_THRESHOLD,
            forced,
        })
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn classify(&self, job: &Job) -> JobClass {
        if !self.seen_urls.contains(&job.url) {
            JobClass::New
        } else if self.seen_fingerprints.contains(&job.source_fingerprint) {
            JobClass::Known
        } else {
            JobClass::Changed {
                prior_key: job.url.clone(),
            }
        }
    }

    /// Filter one page of candidates, update the seen-sets, and decide
    /// whether the crawl should continue. The checkpoint is persisted before
    /// returning so a crash never re-ingests this page.
    pub fn process_page(&mut self, jobs: Vec<Job>) -> Result<PageDecision, CheckpointError> {
        let total = jobs.len();
        let mut fresh = Vec::new();
        let mut new_count = 0;
        let mut known_count = 0;
        let mut changed_count = 0;

        for job in jobs {
            match self.classify(&job) {
                JobClass::New => {
                    new_count += 1;
                    self.known_streak = 0;
                    self.seen_urls.insert(job.url.clone());
                    self.seen_fingerprints.insert(job.source_fingerprint.clone());
                    fresh.push(job);
                }
                JobClass::Changed { prior_key } => {
                    changed_count += 1;
                    self.known_streak = 0;
                    tracing::debug!(url = %job.url, prior_key = %prior_key, "listing content changed");
                    self.seen_fingerprints.insert(job.source_fingerprint.clone());
                    fresh.push(job);
                }
                JobClass::Known => {
                    known_count += 1;
                    self.known_streak += 1;
                }
            }
        }

        self.current.new += new_count + changed_count;
        self.current.known += known_count;

        let new_ratio = if total == 0 {
            1.0
        } else {
            new_count as f64 / total as f64
        };
        let stop = !self.forced
            && total > 0
            && new_ratio < self.threshold
            && self.known_streak >= KNOWN_STREAK_TO_STOP;
        if stop {
            tracing::info!(
                new_ratio,
                known_streak = self.known_streak,
                "early-stop policy triggered"
            );
        }

        self.checkpoint()?;

        Ok(PageDecision {
            fresh,
            new_count,
            known_count,
            changed_count,
            new_ratio,
            should_continue: !stop,
        })
    }

    /// Persist the checkpoint atomically (temp file + rename)
    pub fn checkpoint(&self) -> Result<(), CheckpointError> {
        let mut seen_urls: Vec<String> = self.seen_urls.iter().cloned().collect();
        seen_urls.sort();
        let mut seen_fingerprints: Vec<String> = self.seen_fingerprints.iter().cloned().collect();
        seen_fingerprints.sort();

        let mut sessions = self.sessions.clone();
        sessions.push(self.current.clone());
        if sessions.len() > SESSION_HISTORY_LIMIT {
            let drop = sessions.len() - SESSION_HISTORY_LIMIT;
            sessions.drain(..drop);
        }

        let doc = CheckpointDoc {
            schema: CHECKPOINT_SCHEMA,
            seen_urls,
            seen_fingerprints,
            sessions,
        };

        let body = serde_json::to_vec_pretty(&doc)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Close the current session and flush a final checkpoint
    pub fn end_session(&mut self) -> Result<(), CheckpointError> {
        self.current.ended_at = Some(Utc::now());
        self.checkpoint()?;
        self.sessions.push(self.current.clone());
        self.current = SessionRecord {
            started_at: Utc::now(),
            ended_at: None,
            new: 0,
            known: 0,
        };
        Ok(())
    }

    pub fn seen_url_count(&self) -> usize {
        self.seen_urls.len()
    }

    pub fn session(&self) -> &SessionRecord {
        &self.current
    }

    /// Truncate the checkpoint on disk; the next run re-ingests everything
    pub fn reset(path: &Path) -> Result<(), CheckpointError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
