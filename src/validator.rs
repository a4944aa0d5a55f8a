//! Per-field validation, normalization, and correction.
//!
//! The validator is the single place a [`Job`] is built. It normalizes raw
//! extracted strings (whitespace, HTML, salary shapes, technology tokens),
//! rejects records missing required fields with `schema_violation`, and
//! attaches non-fatal anomaly flags. A batch-level quality score feeds the
//! health report.

use crate::models::{fold_accents, fold_whitespace, Job, Level, WorkMode};
use crate::url_utils;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use scraper::Html;
use std::collections::HashSet;

/// Raw field values handed over by the selector fallback; everything is
/// optional until validation decides.
#[derive(Debug, Clone, Default)]
pub struct RawJob {
    pub url: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub salary: Option<String>,
    pub work_mode: Option<String>,
    pub level: Option<String>,
    pub technologies: Vec<String>,
    pub benefits: Vec<String>,
    pub posted_at: Option<String>,
}

/// A record the schema refused, with the field that sank it
#[derive(Debug, Clone)]
pub struct Rejection {
    pub field: &'static str,
    pub detail: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "schema_violation on {}: {}", self.field, self.detail)
    }
}

/// Result of validating one extracted page batch
#[derive(Debug)]
pub struct BatchOutcome {
    pub jobs: Vec<Job>,
    pub rejections: Vec<Rejection>,
    /// `1 - (rejections + anomaly_fraction * 0.5) / count`
    pub quality_score: f64,
}

pub struct Validator {
    min_salary: u32,
    max_salary: u32,
    salary_token: Regex,
    vocabulary: HashSet<&'static str>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self {
            min_salary: 1_000,
            max_salary: 100_000,
            salary_token: Regex::new(r"(\d+(?:[.,]\d+)*)\s*(mil|k)?").expect("invalid salary pattern"),
            vocabulary: TECH_VOCABULARY.iter().copied().collect(),
        }
    }

    /// Validate and normalize one raw record. `base_url` resolves relative
    /// listing links.
    pub fn validate(&self, raw: &RawJob, base_url: &str) -> Result<Job, Rejection> {
        let url = raw
            .url
            .as_deref()
            .and_then(|link| url_utils::to_absolute(link, base_url))
            .and_then(|abs| url_utils::canonicalize(&abs))
            .ok_or(Rejection {
                field: "url",
                detail: "missing or unparseable listing link".to_string(),
            })?;

        let title = raw
            .title
            .as_deref()
            .map(|t| fold_whitespace(&strip_html(t)))
            .filter(|t| !t.is_empty())
            .ok_or(Rejection {
                field: "title",
                detail: "missing title".to_string(),
            })?;

        let company = raw
            .company
            .as_deref()
            .map(|c| fold_whitespace(&strip_html(c)))
            .unwrap_or_default();
        let description = raw
            .description
            .as_deref()
            .map(|d| fold_whitespace(&strip_html(d)))
            .unwrap_or_default();
        if company.is_empty() && description.is_empty() {
            return Err(Rejection {
                field: "company",
                detail: "need at least one of company or description".to_string(),
            });
        }

        let location = raw
            .location
            .as_deref()
            .map(|l| fold_whitespace(&strip_html(l)))
            .unwrap_or_default();

        let (salary_min, salary_max) = match raw.salary.as_deref() {
            Some(text) => self.parse_salary(text),
            None => (None, None),
        };

        let mut work_mode = raw
            .work_mode
            .as_deref()
            .map(WorkMode::from_text)
            .unwrap_or_default();
        if work_mode == WorkMode::Unknown && !location.is_empty() {
            // Listings often carry the marker in the location slot
            work_mode = WorkMode::from_text(&location);
        }

        let level = raw
            .level
            .as_deref()
            .map(Level::from_text)
            .filter(|l| *l != Level::Unknown)
            .unwrap_or_else(|| Level::from_text(&title));

        let technologies = self.normalize_technologies(&raw.technologies);
        let benefits: Vec<String> = {
            let mut seen = HashSet::new();
            raw.benefits
                .iter()
                .map(|b| fold_whitespace(&strip_html(b)))
                .filter(|b| !b.is_empty() && seen.insert(b.to_lowercase()))
                .collect()
        };

        let posted_at = raw.posted_at.as_deref().and_then(|t| parse_posted_at(t, Utc::now()));

        let mut job = Job {
            url,
            title,
            company,
            location,
            work_mode,
            level,
            salary_min,
            salary_max,
            description,
            technologies,
            benefits,
            posted_at,
            collected_at: Utc::now(),
            source_fingerprint: String::new(),
            anomalies: Vec::new(),
        };
        job.source_fingerprint = job.compute_fingerprint();
        self.flag_record_anomalies(&mut job);
        Ok(job)
    }

    /// Validate a page's worth of records and compute batch-level anomaly
    /// fences and the quality score.
    pub fn validate_batch(&self, raws: &[RawJob], base_url: &str) -> BatchOutcome {
        let mut jobs = Vec::new();
        let mut rejections = Vec::new();
        for raw in raws {
            match self.validate(raw, base_url) {
                Ok(job) => jobs.push(job),
                Err(rejection) => {
                    tracing::debug!(%rejection, "record rejected");
                    rejections.push(rejection);
                }
            }
        }

        flag_salary_outliers(&mut jobs);

        let count = raws.len();
        let quality_score = if count == 0 {
            1.0
        } else {
            let anomalous = jobs.iter().filter(|j| !j.anomalies.is_empty()).count();
            let anomaly_fraction = anomalous as f64 / count as f64;
            (1.0 - (rejections.len() as f64 + anomaly_fraction * 0.5) / count as f64)
                .clamp(0.0, 1.0)
        };

        BatchOutcome {
            jobs,
            rejections,
            quality_score,
        }
    }

    /// Map a salary string to a monthly integer range.
    ///
    /// Extracts digit groups, honors "mil"/"k" suffixes, swaps an inverted
    /// range, and bounds the result to the configured window.
    pub fn parse_salary(&self, text: &str) -> (Option<u32>, Option<u32>) {
        let mut values: Vec<u32> = Vec::new();
        for capture in self.salary_token.captures_iter(text) {
            let digits = &capture[1];
            let mut number: f64 = {
                // "4.000,00" -> integral part with separators stripped
                let integral = digits.split(',').next().unwrap_or(digits).replace('.', "");
                match integral.parse::<f64>() {
                    Ok(v) => v,
                    Err(_) => continue,
                }
            };
            if capture.get(2).is_some() {
                number *= 1000.0;
            }
            if number > 0.0 {
                values.push(number as u32);
            }
            if values.len() == 2 {
                break;
            }
        }

        let (mut min, mut max) = match values.as_slice() {
            [] => return (None, None),
            [single] => (*single, *single),
            [a, b, ..] => (*a, *b),
        };
        if min > max {
            std::mem::swap(&mut min, &mut max);
        }
        (
            Some(min.clamp(self.min_salary, self.max_salary)),
            Some(max.clamp(self.min_salary, self.max_salary)),
        )
    }

    /// Split, fold, and filter technology tokens through the vocabulary
    /// allow-list plus the likely-technology heuristic.
    pub fn normalize_technologies(&self, raw: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut tokens = Vec::new();
        for entry in raw {
            for piece in entry.split(|c: char| matches!(c, ',' | ';' | '/' | '|' | '\n' | '•' | '·')) {
                let token = fold_accents(&fold_whitespace(piece).to_lowercase());
                if token.is_empty() {
                    continue;
                }
                let likely = token.len() >= 2
                    && token.len() <= 40
                    && !token.chars().all(|c| c.is_ascii_digit());
                if (self.vocabulary.contains(token.as_str()) || likely) && seen.insert(token.clone())
                {
                    tokens.push(token);
                }
            }
        }
        tokens
    }

    fn flag_record_anomalies(&self, job: &mut Job) {
        if !job.description.is_empty() && job.description.len() < 80 {
            job.anomalies.push("short_description".to_string());
        }
        if !job.company.is_empty()
            && fold_whitespace(&job.company.to_lowercase())
                == fold_whitespace(&job.title.to_lowercase())
        {
            job.anomalies.push("company_equals_title".to_string());
        }
        if let Some(posted) = job.posted_at {
            let now = Utc::now();
            if posted > now || posted < now - Duration::days(365 * 2) {
                job.anomalies.push("posted_at_out_of_range".to_string());
            }
        }
    }
}

/// Flag salaries outside the interquartile fences of the batch
fn flag_salary_outliers(jobs: &mut [Job]) {
    let mut midpoints: Vec<f64> = jobs
        .iter()
        .filter_map(|j| match (j.salary_min, j.salary_max) {
            (Some(min), Some(max)) => Some((min + max) as f64 / 2.0),
            _ => None,
        })
        .collect();
    if midpoints.len() < 4 {
        return;
    }
    midpoints.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q1 = midpoints[midpoints.len() / 4];
    let q3 = midpoints[(midpoints.len() * 3) / 4];
    let iqr = q3 - q1;
    let low = q1 - 1.5 * iqr;
    let high = q3 + 1.5 * iqr;

    for job in jobs.iter_mut() {
        if let (Some(min), Some(max)) = (job.salary_min, job.salary_max) {
            let mid = (min + max) as f64 / 2.0;
            if mid < low || mid > high {
                job.anomalies.push("salary_outlier".to_string());
            }
        }
    }
}

/// Drop markup from an extracted value, keeping the text content
pub fn strip_html(raw: &str) -> String {
    if !raw.contains('<') {
        return raw.to_string();
    }
    let fragment = Html::parse_fragment(raw);
    fragment.root_element().text().collect::<String>()
}

/// Parse absolute and relative posting dates ("2025-01-10", "10/01/2025",
/// "hoje", "ontem", "há 3 dias", "3 days ago").
pub fn parse_posted_at(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = fold_accents(&fold_whitespace(text).to_lowercase());

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed.trim()) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed.trim(), "%Y-%m-%d") {
        return Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?).into();
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed.trim(), "%d/%m/%Y") {
        return Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?).into();
    }

    if trimmed.contains("hoje") || trimmed.contains("today") {
        return Some(now);
    }
    if trimmed.contains("ontem") || trimmed.contains("yesterday") {
        return Some(now - Duration::days(1));
    }

    let amount: i64 = trimmed
        .split_whitespace()
        .find_map(|word| word.parse().ok())?;
    if trimmed.contains("hora") || trimmed.contains("hour") {
        Some(now - Duration::hours(amount))
    } else if trimmed.contains("dia") || trimmed.contains("day") {
        Some(now - Duration::days(amount))
    } else if trimmed.contains("semana") || trimmed.contains("week") {
        Some(now - Duration::weeks(amount))
    } else if trimmed.contains("mes") || trimmed.contains("month") {
        Some(now - Duration::days(amount * 30))
    } else {
        None
    }
}

/// Allow-list of technology tags seen across listing sites; tokens outside
/// the list still pass when the likely-technology heuristic accepts them.
const TECH_VOCABULARY: &[&str] = &[
    "rust", "python", "java", "javascript", "typescript", "go", "golang", "c", "c++", "c#",
    "php", "ruby", "scala", "kotlin", "swift", "elixir", "react", "angular", "vue", "svelte",
    "node", "node.js", "django", "flask", "rails", "spring", "laravel", ".net", "sql", "nosql",
    "postgres", "postgresql", "mysql", "mariadb", "mongodb", "redis", "kafka", "rabbitmq",
    "elasticsearch", "aws", "azure", "gcp", "docker", "kubernetes", "terraform", "ansible",
    "linux", "git", "ci/cd", "jenkins", "graphql", "rest", "grpc", "spark", "airflow", "dbt",
    "pandas", "pytorch", "tensorflow", "ml", "etl",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_job() -> RawJob {
        RawJob {
            url: Some("/vagas/rust-dev/99?utm_source=feed".to_string()),
            title: Some("  Desenvolvedor  Rust   Sênior ".to_string()),
            company: Some("Acme <b>Ltda</b>".to_string()),
            location: Some("Remoto".to_string()),
            description: Some(
                "Long-lived ingestion pipelines, strong typing, on-call rotation shared by the team."
                    .to_string(),
            ),
            salary: Some("R$ 9.000 - R$ 12.000".to_string()),
            work_mode: None,
            level: None,
            technologies: vec!["Rust, Tokio; PostgreSQL".to_string(), "Sênior".to_string()],
            benefits: vec!["Vale refeição".to_string(), "Vale refeição".to_string()],
            posted_at: Some("há 3 dias".to_string()),
        }
    }

    #[test]
    fn test_validate_normalizes_everything() {
        let validator = Validator::new();
        let job = validator
            .validate(&raw_job(), "https://jobs.example.com/vagas?page=1")
            .unwrap();

        assert_eq!(job.url, "https://jobs.example.com/vagas/rust-dev/99");
        assert_eq!(job.title, "Desenvolvedor Rust Sênior");
        assert_eq!(job.company, "Acme Ltda");
        assert_eq!(job.work_mode, WorkMode::Remote); // derived from location
        assert_eq!(job.level, Level::Senior); // derived from title
        assert_eq!(job.salary_min, Some(9_000));
        assert_eq!(job.salary_max, Some(12_000));
        assert_eq!(job.technologies, vec!["rust", "tokio", "postgresql", "senior"]);
        assert_eq!(job.benefits.len(), 1);
        assert!(job.posted_at.is_some());
        assert!(!job.source_fingerprint.is_empty());
    }

    #[test]
    fn test_missing_title_rejected() {
        let validator = Validator::new();
        let mut raw = raw_job();
        raw.title = None;
        let rejection = validator
            .validate(&raw, "https://jobs.example.com/")
            .unwrap_err();
        assert_eq!(rejection.field, "title");
    }

    #[test]
    fn test_company_or_description_required() {
        let validator = Validator::new();
        let mut raw = raw_job();
        raw.company = None;
        raw.description = None;
        assert!(validator.validate(&raw, "https://jobs.example.com/").is_err());

        // Either one alone is enough
        let mut raw = raw_job();
        raw.company = None;
        assert!(validator.validate(&raw, "https://jobs.example.com/").is_ok());
    }

    #[test]
    fn test_salary_shapes() {
        let validator = Validator::new();
        assert_eq!(
            validator.parse_salary("R$ 3.500 - R$ 5.000"),
            (Some(3_500), Some(5_000))
        );
        assert_eq!(validator.parse_salary("5 mil"), (Some(5_000), Some(5_000)));
        assert_eq!(validator.parse_salary("8k a 12k"), (Some(8_000), Some(12_000)));
        assert_eq!(validator.parse_salary("R$ 4.000,00"), (Some(4_000), Some(4_000)));
        assert_eq!(validator.parse_salary("a combinar"), (None, None));
    }

    #[test]
    fn test_inverted_salary_range_is_swapped() {
        let validator = Validator::new();
        assert_eq!(
            validator.parse_salary("R$ 12.000 - R$ 9.000"),
            (Some(9_000), Some(12_000))
        );
    }

    #[test]
    fn test_salary_bounded_to_window() {
        let validator = Validator::new();
        let (min, max) = validator.parse_salary("R$ 150 - R$ 900.000");
        assert_eq!(min, Some(1_000));
        assert_eq!(max, Some(100_000));
    }

    #[test]
    fn test_technology_tokens_filtered() {
        let validator = Validator::new();
        let tokens = validator.normalize_technologies(&[
            "Rust / Kafka / 12345".to_string(),
            "x".to_string(),
            "PostgreSQL".to_string(),
            "rust".to_string(),
        ]);
        // "12345" is purely numeric, "x" is too short, "rust" deduplicates
        assert_eq!(tokens, vec!["rust", "kafka", "postgresql"]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let validator = Validator::new();
        let once = validator.normalize_technologies(&["Sênior, Rust".to_string()]);
        let twice = validator.normalize_technologies(&once);
        assert_eq!(once, twice);

        let folded = fold_whitespace("  a   b  ");
        assert_eq!(fold_whitespace(&folded), folded);
    }

    #[test]
    fn test_posted_at_relative_forms() {
        let now = Utc::now();
        let three_days = parse_posted_at("há 3 dias", now).unwrap();
        assert_eq!((now - three_days).num_days(), 3);
        assert_eq!(parse_posted_at("hoje", now), Some(now));
        assert!(parse_posted_at("2025-01-10", now).is_some());
        assert!(parse_posted_at("10/01/2025", now).is_some());
        assert!(parse_posted_at("sometime", now).is_none());
    }

    #[test]
    fn test_short_description_flagged() {
        let validator = Validator::new();
        let mut raw = raw_job();
        raw.description = Some("Too short to be a real description.".to_string());
        let job = validator.validate(&raw, "https://jobs.example.com/").unwrap();
        assert!(job.anomalies.contains(&"short_description".to_string()));
    }

    #[test]
    fn test_batch_quality_score() {
        let validator = Validator::new();
        let mut raws = vec![raw_job(), raw_job(), raw_job(), raw_job()];
        raws[3].title = None; // one rejection

        let outcome = validator.validate_batch(&raws, "https://jobs.example.com/");
        assert_eq!(outcome.jobs.len(), 3);
        assert_eq!(outcome.rejections.len(), 1);
        assert!(outcome.quality_score < 1.0);
        assert!(outcome.quality_score >= 0.5);
    }

    #[test]
    fn test_salary_outlier_fences() {
        let validator = Validator::new();
        let mut raws: Vec<RawJob> = (0..8).map(|_| raw_job()).collect();
        raws[0].salary = Some("R$ 90.000".to_string());
        let outcome = validator.validate_batch(&raws, "https://jobs.example.com/");
        let flagged: Vec<&Job> = outcome
            .jobs
            .iter()
            .filter(|j| j.anomalies.contains(&"salary_outlier".to_string()))
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].salary_max, Some(90_000));
    }
}
