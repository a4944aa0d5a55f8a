//! Output writers: emit the run's jobs as JSON, CSV, and plain text.
//!
//! Files land under `<dir>/json|csv|txt/<run_slug>.<ext>`, written to a
//! temp file and renamed atomically. Old artifacts beyond
//! `max_files_per_type` are removed, oldest first.

use crate::models::{Job, FIELD_ORDER};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("output serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("unknown output format: {0}")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Csv,
    Text,
}

impl OutputFormat {
    pub fn from_name(name: &str) -> Result<Self, OutputError> {
        match name {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "text" | "txt" => Ok(OutputFormat::Text),
            other => Err(OutputError::UnknownFormat(other.to_string())),
        }
    }

    fn subdir(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Text => "txt",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Text => "txt",
        }
    }
}

/// Timestamp slug shared by output files and the metrics snapshot
pub fn run_slug(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

pub struct OutputWriter {
    dir: PathBuf,
    max_files_per_type: usize,
}

impl OutputWriter {
    pub fn new(dir: impl Into<PathBuf>, max_files_per_type: usize) -> Self {
        Self {
            dir: dir.into(),
            max_files_per_type: max_files_per_type.max(1),
        }
    }

    /// Emit `jobs` in every requested format; returns the written paths
    pub fn write_all(
        &self,
        jobs: &[Job],
        formats: &[OutputFormat],
        slug: &str,
    ) -> Result<Vec<PathBuf>, OutputError> {
        let mut paths = Vec::new();
        for format in formats {
            paths.push(self.write_one(jobs, *format, slug)?);
        }
        Ok(paths)
    }

    fn write_one(
        &self,
        jobs: &[Job],
        format: OutputFormat,
        slug: &str,
    ) -> Result<PathBuf, OutputError> {
        let subdir = self.dir.join(format.subdir());
        std::fs::create_dir_all(&subdir)?;

        let body = match format {
            OutputFormat::Json => serde_json::to_vec_pretty(jobs)?,
            OutputFormat::Csv => render_csv(jobs)?,
            OutputFormat::Text => render_text(jobs).into_bytes(),
        };

        let final_path = subdir.join(format!("{slug}.{}", format.extension()));
        let tmp_path = subdir.join(format!(".{slug}.{}.tmp", format.extension()));
        std::fs::write(&tmp_path, &body)?;
        std::fs::rename(&tmp_path, &final_path)?;

        self.trim_old_files(&subdir, format.extension())?;
        tracing::info!(path = %final_path.display(), records = jobs.len(), "output written");
        Ok(final_path)
    }

    /// Keep only the newest `max_files_per_type` artifacts of one extension
    fn trim_old_files(&self, subdir: &Path, extension: &str) -> Result<(), OutputError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(subdir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|e| e == extension).unwrap_or(false))
            .collect();
        if files.len() <= self.max_files_per_type {
            return Ok(());
        }
        // Slug-named files sort chronologically
        files.sort();
        let excess = files.len() - self.max_files_per_type;
        for path in files.into_iter().take(excess) {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn timestamp(value: &Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn render_csv(jobs: &[Job]) -> Result<Vec<u8>, OutputError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(FIELD_ORDER)?;
    for job in jobs {
        writer.write_record(&[
            job.url.clone(),
            job.title.clone(),
            job.company.clone(),
            job.location.clone(),
            job.work_mode.as_str().to_string(),
            job.level.as_str().to_string(),
            job.salary_min.map(|v| v.to_string()).unwrap_or_default(),
            job.salary_max.map(|v| v.to_string()).unwrap_or_default(),
            job.description.clone(),
            job.technologies.join(";"),
            job.benefits.join(";"),
            timestamp(&job.posted_at),
            job.collected_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            job.source_fingerprint.clone(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| OutputError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

fn render_text(jobs: &[Job]) -> String {
    let mut out = String::new();
    for job in jobs {
        let fields = [
            ("url", job.url.clone()),
            ("title", job.title.clone()),
            ("company", job.company.clone()),
            ("location", job.location.clone()),
            ("work_mode", job.work_mode.as_str().to_string()),
            ("level", job.level.as_str().to_string()),
            (
                "salary_min",
                job.salary_min.map(|v| v.to_string()).unwrap_or_default(),
            ),
            (
                "salary_max",
                job.salary_max.map(|v| v.to_string()).unwrap_or_default(),
            ),
            ("description", job.description.clone()),
            ("technologies", job.technologies.join(";")),
            ("benefits", job.benefits.join(";")),
            ("posted_at", timestamp(&job.posted_at)),
            (
                "collected_at",
                job.collected_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("source_fingerprint", job.source_fingerprint.clone()),
        ];
        for (name, value) in fields {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&value);
            out.push('\n');
        }
        out.push_str(&"-".repeat(40));
        out.push('\n');
    }
    out
}
