use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Work arrangement advertised by a posting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WorkMode {
    OnSite,
    Hybrid,
    Remote,
    #[default]
    Unknown,
}

impl WorkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkMode::OnSite => "on-site",
            WorkMode::Hybrid => "hybrid",
            WorkMode::Remote => "remote",
            WorkMode::Unknown => "unknown",
        }
    }

    /// Parse a free-form marker, accepting both English and Portuguese forms
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("remot") || lower.contains("home office") {
            WorkMode::Remote
        } else if lower.contains("híbrid") || lower.contains("hibrid") || lower.contains("hybrid") {
            WorkMode::Hybrid
        } else if lower.contains("presencial") || lower.contains("on-site") || lower.contains("onsite") {
            WorkMode::OnSite
        } else {
            WorkMode::Unknown
        }
    }
}

impl std::fmt::Display for WorkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Seniority level advertised by a posting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Intern,
    Junior,
    Mid,
    Senior,
    Lead,
    Director,
    #[default]
    Unknown,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Intern => "intern",
            Level::Junior => "junior",
            Level::Mid => "mid",
            Level::Senior => "senior",
            Level::Lead => "lead",
            Level::Director => "director",
            Level::Unknown => "unknown",
        }
    }

    /// Parse a free-form marker, accepting both English and Portuguese forms
    pub fn from_text(text: &str) -> Self {
        let lower = fold_accents(&text.to_lowercase());
        if lower.contains("estagi") || lower.contains("intern") || lower.contains("trainee") {
            Level::Intern
        } else if lower.contains("junior") || lower.contains("jr.") {
            Level::Junior
        } else if lower.contains("pleno") || lower.contains("mid-level") || lower.contains("mid ") {
            Level::Mid
        } else if lower.contains("diretor") || lower.contains("director") || lower.contains("head of") {
            Level::Director
        } else if lower.contains("lead") || lower.contains("lider") || lower.contains("principal") {
            Level::Lead
        } else if lower.contains("senior") || lower.contains("sr.") {
            Level::Senior
        } else {
            Level::Unknown
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Column order shared by the CSV and text output writers
pub const FIELD_ORDER: &[&str] = &[
    "url",
    "title",
    "company",
    "location",
    "work_mode",
    "level",
    "salary_min",
    "salary_max",
    "description",
    "technologies",
    "benefits",
    "posted_at",
    "collected_at",
    "source_fingerprint",
];

/// A single job posting after validation.
///
/// The validator is the only place a `Job` is constructed or corrected;
/// everything downstream treats it as frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Canonical URL, the unique business key
    pub url: String,
    pub title: String,
    pub company: String,
    pub location: String,
    #[serde(default)]
    pub work_mode: WorkMode,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub salary_min: Option<u32>,
    #[serde(default)]
    pub salary_max: Option<u32>,
    #[serde(default)]
    pub description: String,
    /// Lowercased, deduplicated tags in extraction order
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub benefits: Vec<String>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
    /// Content hash over normalized fields, excluding `collected_at`
    pub source_fingerprint: String,
    /// Non-fatal quality flags attached by the validator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<String>,
}

impl Job {
    /// Recompute the content fingerprint from the current field values.
    ///
    /// Stable under technology reordering, whitespace runs, and case changes
    /// in title/company/location/description.
    pub fn compute_fingerprint(&self) -> String {
        let mut tech: Vec<String> = self
            .technologies
            .iter()
            .map(|t| fold_whitespace(&t.to_lowercase()))
            .collect();
        tech.sort();
        tech.dedup();

        let mut hasher = Sha256::new();
        for part in [
            fold_whitespace(&self.title.to_lowercase()),
            fold_whitespace(&self.company.to_lowercase()),
            fold_whitespace(&self.location.to_lowercase()),
            tech.join(","),
            self.salary_min.map(|v| v.to_string()).unwrap_or_default(),
            self.salary_max.map(|v| v.to_string()).unwrap_or_default(),
            fold_whitespace(&self.description.to_lowercase()),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    /// Case-folded (title, company) key used by the deduplicator
    pub fn title_company_key(&self) -> String {
        format!(
            "{}|{}",
            fold_whitespace(&self.title.to_lowercase()),
            fold_whitespace(&self.company.to_lowercase())
        )
    }
}

/// Collapse interior whitespace runs into single spaces and trim the ends
pub fn fold_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip the Latin-1/Portuguese diacritics that show up in job listings
pub fn fold_accents(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'Ç' => 'C',
            'Ñ' => 'N',
            other => other,
        })
        .collect()
}

/// The decompressed payload of one cache blob: everything captured from a
/// single page fetch. Readers tolerate unknown extra fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCapture {
    pub url: String,
    pub page: u32,
    pub captured_at: DateTime<Utc>,
    pub jobs: Vec<Job>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job {
            url: "https://jobs.example.com/vagas/123".to_string(),
            title: "Senior Rust Engineer".to_string(),
            company: "Acme Corp".to_string(),
            location: "São Paulo".to_string(),
            work_mode: WorkMode::Remote,
            level: Level::Senior,
            salary_min: Some(9000),
            salary_max: Some(14000),
            description: "Build data pipelines in Rust".to_string(),
            technologies: vec!["rust".to_string(), "tokio".to_string(), "postgres".to_string()],
            benefits: vec!["health plan".to_string()],
            posted_at: None,
            collected_at: Utc::now(),
            source_fingerprint: String::new(),
            anomalies: Vec::new(),
        }
    }

    #[test]
    fn test_fingerprint_ignores_technology_order() {
        let mut a = sample_job();
        a.source_fingerprint = a.compute_fingerprint();

        let mut b = a.clone();
        b.technologies.reverse();
        assert_eq!(a.source_fingerprint, b.compute_fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_case_and_whitespace() {
        let a = sample_job();
        let mut b = a.clone();
        b.title = "  SENIOR   rust  ENGINEER ".to_string();
        b.company = "ACME  CORP".to_string();
        assert_eq!(a.compute_fingerprint(), b.compute_fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = sample_job();
        let mut b = a.clone();
        b.salary_max = Some(15000);
        assert_ne!(a.compute_fingerprint(), b.compute_fingerprint());
    }

    #[test]
    fn test_fingerprint_excludes_collected_at() {
        let a = sample_job();
        let mut b = a.clone();
        b.collected_at = b.collected_at + chrono::Duration::hours(5);
        assert_eq!(a.compute_fingerprint(), b.compute_fingerprint());
    }

    #[test]
    fn test_work_mode_markers() {
        assert_eq!(WorkMode::from_text("100% Remoto"), WorkMode::Remote);
        assert_eq!(WorkMode::from_text("Home Office"), WorkMode::Remote);
        assert_eq!(WorkMode::from_text("Híbrido - 2x semana"), WorkMode::Hybrid);
        assert_eq!(WorkMode::from_text("Presencial"), WorkMode::OnSite);
        assert_eq!(WorkMode::from_text("whatever"), WorkMode::Unknown);
    }

    #[test]
    fn test_level_markers() {
        assert_eq!(Level::from_text("Desenvolvedor Sênior"), Level::Senior);
        assert_eq!(Level::from_text("Pleno"), Level::Mid);
        assert_eq!(Level::from_text("Estágio em TI"), Level::Intern);
        assert_eq!(Level::from_text("Tech Lead"), Level::Lead);
    }

    #[test]
    fn test_capture_tolerates_unknown_fields() {
        let raw = r#"{
            "url": "https://jobs.example.com/vagas?page=1",
            "page": 1,
            "captured_at": "2025-01-15T12:00:00Z",
            "jobs": [],
            "extension_field": {"future": true}
        }"#;
        let capture: PageCapture = serde_json::from_str(raw).unwrap();
        assert_eq!(capture.page, 1);
        assert!(capture.jobs.is_empty());
    }
}
