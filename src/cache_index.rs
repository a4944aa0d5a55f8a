//! Searchable index over the compressed cache: per-blob metadata plus four
//! inverted indices (date, company, technology, location).
//!
//! The whole index lives in memory as an immutable snapshot behind an
//! `Arc`; writers take a single async mutex, mutate a copy, persist it to
//! `cache_index.json` with an atomic rename, and then swap the snapshot in.
//! Readers never block on writers and always see a consistent state: either
//! a blob together with its entry, or neither.

use crate::cache::{cache_key, BlobInfo, CacheError, CompressedCache, PruneReport};
use crate::models::{fold_whitespace, PageCapture};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

const INDEX_SCHEMA: u32 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("index i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Metadata record about one blob, the unit of search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub cache_key: String,
    pub file_path: PathBuf,
    pub source_url: String,
    pub captured_at: DateTime<Utc>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    pub job_count: usize,
    pub companies: BTreeSet<String>,
    pub technologies: BTreeSet<String>,
    pub locations: BTreeSet<String>,
    pub levels: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_blobs: usize,
    pub total_jobs: usize,
    pub total_compressed_bytes: u64,
    pub total_uncompressed_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexState {
    schema: u32,
    entries: BTreeMap<String, IndexEntry>,
    by_date: BTreeMap<String, BTreeSet<String>>,
    by_company: BTreeMap<String, BTreeSet<String>>,
    by_tech: BTreeMap<String, BTreeSet<String>>,
    by_location: BTreeMap<String, BTreeSet<String>>,
    stats: IndexStats,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            schema: INDEX_SCHEMA,
            entries: BTreeMap::new(),
            by_date: BTreeMap::new(),
            by_company: BTreeMap::new(),
            by_tech: BTreeMap::new(),
            by_location: BTreeMap::new(),
            stats: IndexStats::default(),
        }
    }
}

impl IndexState {
    fn insert(&mut self, entry: IndexEntry) {
        self.remove(&entry.cache_key.clone());

        let key = entry.cache_key.clone();
        let date = entry.captured_at.date_naive().to_string();
        self.by_date.entry(date).or_default().insert(key.clone());
        for company in &entry.companies {
            self.by_company
                .entry(company.clone())
                .or_default()
                .insert(key.clone());
        }
        for tech in &entry.technologies {
            self.by_tech
                .entry(tech.clone())
                .or_default()
                .insert(key.clone());
        }
        for location in &entry.locations {
            self.by_location
                .entry(location.clone())
                .or_default()
                .insert(key.clone());
        }

        self.stats.total_jobs += entry.job_count;
        self.stats.total_compressed_bytes += entry.compressed_size;
        self.stats.total_uncompressed_bytes += entry.uncompressed_size;
        self.entries.insert(key, entry);
        self.stats.total_blobs = self.entries.len();
    }

    fn remove(&mut self, key: &str) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        for sets in [
            &mut self.by_date,
            &mut self.by_company,
            &mut self.by_tech,
            &mut self.by_location,
        ] {
            sets.retain(|_, keys| {
                keys.remove(key);
                !keys.is_empty()
            });
        }
        self.stats.total_jobs = self.stats.total_jobs.saturating_sub(entry.job_count);
        self.stats.total_compressed_bytes = self
            .stats
            .total_compressed_bytes
            .saturating_sub(entry.compressed_size);
        self.stats.total_uncompressed_bytes = self
            .stats
            .total_uncompressed_bytes
            .saturating_sub(entry.uncompressed_size);
        self.stats.total_blobs = self.entries.len();
    }
}

/// Multi-facet filter. Within one facet list values combine with OR; across
/// facets with AND.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub companies: Vec<String>,
    pub technologies: Vec<String>,
    pub locations: Vec<String>,
    pub levels: Vec<String>,
    pub min_jobs: Option<usize>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

pub struct CacheIndex {
    cache: CompressedCache,
    path: PathBuf,
    snapshot: RwLock<Arc<IndexState>>,
    writer: Mutex<()>,
}

impl CacheIndex {
    /// Load the persisted index, rebuilding from blobs when it is missing,
    /// unreadable, or out of sync with the files on disk.
    pub async fn open(cache: CompressedCache, force_rebuild: bool) -> Result<Self, IndexError> {
        let path = cache.dir().join("cache_index.json");
        let index = Self {
            cache,
            path,
            snapshot: RwLock::new(Arc::new(IndexState::default())),
            writer: Mutex::new(()),
        };

        let loaded = if force_rebuild { None } else { index.load_state() };
        match loaded {
            Some(state) if state.entries.len() == index.cache.list_keys()?.len() => {
                *index.snapshot.write() = Arc::new(state);
            }
            _ => {
                let rebuilt = index.rebuild().await?;
                tracing::info!(entries = rebuilt, "cache index rebuilt from blobs");
            }
        }
        Ok(index)
    }

    fn load_state(&self) -> Option<IndexState> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<IndexState>(&content) {
            Ok(state) if state.schema == INDEX_SCHEMA => Some(state),
            Ok(state) => {
                tracing::warn!(schema = state.schema, "unsupported index schema, rebuilding");
                None
            }
            Err(error) => {
                tracing::warn!(%error, "unreadable cache index, rebuilding");
                None
            }
        }
    }

    /// Scan every blob on disk and rebuild the whole index. Idempotent.
    pub async fn rebuild(&self) -> Result<usize, IndexError> {
        let _writer = self.writer.lock().await;
        let mut state = IndexState::default();

        for key in self.cache.list_keys()? {
            match self.cache.get(&key).await {
                Ok(capture) => {
                    let info = self.blob_info_from_disk(&key, &capture)?;
                    state.insert(build_entry(&capture, &info));
                }
                Err(CacheError::Corrupt(_)) => continue, // quarantined by the cache
                Err(CacheError::Expired(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }

        let count = state.entries.len();
        self.persist(&state).await?;
        *self.snapshot.write() = Arc::new(state);
        Ok(count)
    }

    fn blob_info_from_disk(
        &self,
        key: &str,
        capture: &PageCapture,
    ) -> Result<BlobInfo, IndexError> {
        let file_path = self.cache.dir().join(format!("{key}.json.gz"));
        let compressed_size = std::fs::metadata(&file_path)?.len();
        let uncompressed_size = serde_json::to_vec(capture)?.len() as u64;
        Ok(BlobInfo {
            cache_key: key.to_string(),
            file_path,
            uncompressed_size,
            compressed_size,
            compression_ratio: if uncompressed_size == 0 {
                1.0
            } else {
                compressed_size as f64 / uncompressed_size as f64
            },
        })
    }

    /// Store a capture and index its facets in one atomic transition
    pub async fn put(&self, capture: &PageCapture) -> Result<IndexEntry, IndexError> {
        let key = cache_key(&capture.url, capture.page);
        let _writer = self.writer.lock().await;

        let info = self.cache.put(&key, capture).await?;
        let entry = build_entry(capture, &info);

        let mut state = (**self.snapshot.read()).clone();
        state.insert(entry.clone());
        self.persist(&state).await?;
        *self.snapshot.write() = Arc::new(state);
        Ok(entry)
    }

    /// Fetch the decompressed capture for a key
    pub async fn get(&self, key: &str) -> Result<PageCapture, IndexError> {
        match self.cache.get(key).await {
            Ok(capture) => Ok(capture),
            Err(CacheError::Corrupt(k)) => {
                // The blob is gone from disk; drop its entry too
                self.remove_entry(key).await?;
                Err(CacheError::Corrupt(k).into())
            }
            Err(other) => Err(other.into()),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), IndexError> {
        let _writer = self.writer.lock().await;
        self.cache.delete(key).await?;
        let mut state = (**self.snapshot.read()).clone();
        state.remove(key);
        self.persist(&state).await?;
        *self.snapshot.write() = Arc::new(state);
        Ok(())
    }

    async fn remove_entry(&self, key: &str) -> Result<(), IndexError> {
        let _writer = self.writer.lock().await;
        let mut state = (**self.snapshot.read()).clone();
        state.remove(key);
        self.persist(&state).await?;
        *self.snapshot.write() = Arc::new(state);
        Ok(())
    }

    /// Prune expired blobs and their entries
    pub async fn prune(&self, max_age: Duration) -> Result<PruneReport, IndexError> {
        let _writer = self.writer.lock().await;
        let report = self.cache.prune(max_age).await?;
        if !report.removed.is_empty() {
            let mut state = (**self.snapshot.read()).clone();
            for key in &report.removed {
                state.remove(key);
            }
            self.persist(&state).await?;
            *self.snapshot.write() = Arc::new(state);
        }
        Ok(report)
    }

    /// Search entries without touching blob files. Results are sorted by
    /// capture time, newest first.
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<IndexEntry> {
        let state = self.snapshot.read().clone();

        let mut candidates: Option<BTreeSet<String>> = None;
        let mut narrow = |index: &BTreeMap<String, BTreeSet<String>>, values: &[String]| {
            if values.is_empty() {
                return;
            }
            let mut union = BTreeSet::new();
            for value in values {
                let folded = fold_facet(value);
                if let Some(keys) = index.get(&folded) {
                    union.extend(keys.iter().cloned());
                }
            }
            candidates = Some(match candidates.take() {
                Some(existing) => existing.intersection(&union).cloned().collect(),
                None => union,
            });
        };

        narrow(&state.by_company, &criteria.companies);
        narrow(&state.by_tech, &criteria.technologies);
        narrow(&state.by_location, &criteria.locations);

        let mut results: Vec<IndexEntry> = match candidates {
            Some(keys) => keys
                .iter()
                .filter_map(|k| state.entries.get(k).cloned())
                .collect(),
            None => state.entries.values().cloned().collect(),
        };

        if !criteria.levels.is_empty() {
            let wanted: BTreeSet<String> =
                criteria.levels.iter().map(|l| fold_facet(l)).collect();
            results.retain(|entry| entry.levels.iter().any(|l| wanted.contains(l)));
        }
        if let Some(min_jobs) = criteria.min_jobs {
            results.retain(|entry| entry.job_count >= min_jobs);
        }
        if let Some(from) = criteria.date_from {
            results.retain(|entry| entry.captured_at.date_naive() >= from);
        }
        if let Some(to) = criteria.date_to {
            results.retain(|entry| entry.captured_at.date_naive() <= to);
        }

        results.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        results
    }

    /// Companies ranked by the number of blobs mentioning them; ties broken
    /// by lexical order.
    pub fn top_companies(&self, k: usize) -> Vec<(String, usize)> {
        self.top_of(|state| &state.by_company, k)
    }

    pub fn top_technologies(&self, k: usize) -> Vec<(String, usize)> {
        self.top_of(|state| &state.by_tech, k)
    }

    fn top_of<F>(&self, pick: F, k: usize) -> Vec<(String, usize)>
    where
        F: Fn(&IndexState) -> &BTreeMap<String, BTreeSet<String>>,
    {
        let state = self.snapshot.read().clone();
        let mut counts: Vec<(String, usize)> = pick(&state)
            .iter()
            .map(|(name, keys)| (name.clone(), keys.len()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(k);
        counts
    }

    pub fn entry_count(&self) -> usize {
        self.snapshot.read().entries.len()
    }

    pub fn stats(&self) -> IndexStats {
        self.snapshot.read().stats.clone()
    }

    async fn persist(&self, state: &IndexState) -> Result<(), IndexError> {
        let body = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            use tokio::io::AsyncWriteExt;
            file.write_all(&body).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn fold_facet(value: &str) -> String {
    fold_whitespace(&value.to_lowercase())
}

fn build_entry(capture: &PageCapture, info: &BlobInfo) -> IndexEntry {
    let mut companies = BTreeSet::new();
    let mut technologies = BTreeSet::new();
    let mut locations = BTreeSet::new();
    let mut levels = BTreeSet::new();
    for job in &capture.jobs {
        if !job.company.is_empty() {
            companies.insert(fold_facet(&job.company));
        }
        for tech in &job.technologies {
            technologies.insert(fold_facet(tech));
        }
        if !job.location.is_empty() {
            locations.insert(fold_facet(&job.location));
        }
        levels.insert(job.level.as_str().to_string());
    }

    IndexEntry {
        cache_key: info.cache_key.clone(),
        file_path: info.file_path.clone(),
        source_url: capture.url.clone(),
        captured_at: capture.captured_at,
        uncompressed_size: info.uncompressed_size,
        compressed_size: info.compressed_size,
        compression_ratio: info.compression_ratio,
        job_count: capture.jobs.len(),
        companies,
        technologies,
        locations,
        levels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, Level};
    use tempfile::TempDir;

    fn job(url: &str, company: &str, tech: &[&str], location: &str, level: Level) -> Job {
        Job {
            url: url.to_string(),
            title: format!("Role at {company}"),
            company: company.to_string(),
            location: location.to_string(),
            work_mode: Default::default(),
            level,
            salary_min: None,
            salary_max: None,
            description: "d".repeat(100),
            technologies: tech.iter().map(|t| t.to_string()).collect(),
            benefits: Vec::new(),
            posted_at: None,
            collected_at: Utc::now(),
            source_fingerprint: url.to_string(),
            anomalies: Vec::new(),
        }
    }

    fn capture(page: u32, jobs: Vec<Job>) -> PageCapture {
        PageCapture {
            url: "https://jobs.example.com/vagas".to_string(),
            page,
            captured_at: Utc::now(),
            jobs,
        }
    }

    async fn index(dir: &TempDir) -> CacheIndex {
        let cache = CompressedCache::open(dir.path(), 6, 24).unwrap();
        CacheIndex::open(cache, false).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_updates_inverted_indices() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;

        index
            .put(&capture(
                1,
                vec![
                    job("https://x/1", "Acme", &["rust", "kafka"], "Recife", Level::Senior),
                    job("https://x/2", "Umbrella", &["python"], "Remote", Level::Junior),
                ],
            ))
            .await
            .unwrap();

        let by_company = index.search(&SearchCriteria {
            companies: vec!["acme".to_string()],
            ..Default::default()
        });
        assert_eq!(by_company.len(), 1);
        assert_eq!(by_company[0].job_count, 2);

        let by_tech = index.search(&SearchCriteria {
            technologies: vec!["kafka".to_string()],
            ..Default::default()
        });
        assert_eq!(by_tech.len(), 1);
    }

    #[tokio::test]
    async fn test_search_or_within_and_across_facets() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;

        index
            .put(&capture(1, vec![job("https://x/1", "Acme", &["rust"], "Recife", Level::Mid)]))
            .await
            .unwrap();
        index
            .put(&capture(2, vec![job("https://x/2", "Umbrella", &["rust"], "Lisboa", Level::Mid)]))
            .await
            .unwrap();
        index
            .put(&capture(3, vec![job("https://x/3", "Initech", &["cobol"], "Recife", Level::Mid)]))
            .await
            .unwrap();

        // OR within the companies facet
        let either = index.search(&SearchCriteria {
            companies: vec!["acme".to_string(), "initech".to_string()],
            ..Default::default()
        });
        assert_eq!(either.len(), 2);

        // AND across facets
        let both = index.search(&SearchCriteria {
            companies: vec!["acme".to_string(), "initech".to_string()],
            technologies: vec!["rust".to_string()],
            ..Default::default()
        });
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].cache_key, cache_key("https://jobs.example.com/vagas", 1));
    }

    #[tokio::test]
    async fn test_search_sorted_newest_first_with_min_jobs() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;

        let mut old = capture(1, vec![job("https://x/1", "Acme", &[], "R", Level::Mid)]);
        old.captured_at = Utc::now() - chrono::Duration::days(3);
        index.put(&old).await.unwrap();

        index
            .put(&capture(
                2,
                vec![
                    job("https://x/2", "Acme", &[], "R", Level::Mid),
                    job("https://x/3", "Acme", &[], "R", Level::Mid),
                ],
            ))
            .await
            .unwrap();

        let all = index.search(&SearchCriteria::default());
        assert_eq!(all.len(), 2);
        assert!(all[0].captured_at > all[1].captured_at);

        let big = index.search(&SearchCriteria {
            min_jobs: Some(2),
            ..Default::default()
        });
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].job_count, 2);
    }

    #[tokio::test]
    async fn test_delete_keeps_index_and_disk_consistent() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;

        let entry = index
            .put(&capture(1, vec![job("https://x/1", "Acme", &["rust"], "R", Level::Mid)]))
            .await
            .unwrap();
        index.delete(&entry.cache_key).await.unwrap();

        assert_eq!(index.entry_count(), 0);
        assert!(index.search(&SearchCriteria::default()).is_empty());
        // No orphan sets remain in the inverted indices
        let by_tech = index.search(&SearchCriteria {
            technologies: vec!["rust".to_string()],
            ..Default::default()
        });
        assert!(by_tech.is_empty());
    }

    #[tokio::test]
    async fn test_startup_rebuild_after_index_loss() {
        let dir = TempDir::new().unwrap();
        {
            let index = index(&dir).await;
            index
                .put(&capture(1, vec![job("https://x/1", "Acme", &["rust"], "R", Level::Mid)]))
                .await
                .unwrap();
            index
                .put(&capture(2, vec![job("https://x/2", "Umbrella", &["go"], "R", Level::Mid)]))
                .await
                .unwrap();
        }

        // Lose the index document; reopen must rebuild from blobs
        std::fs::remove_file(dir.path().join("cache_index.json")).unwrap();
        let reopened = index(&dir).await;
        assert_eq!(reopened.entry_count(), 2);
        assert_eq!(
            reopened
                .search(&SearchCriteria {
                    companies: vec!["umbrella".to_string()],
                    ..Default::default()
                })
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_top_aggregates_with_lexical_ties() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;

        index
            .put(&capture(1, vec![job("https://x/1", "Beta", &["rust"], "R", Level::Mid)]))
            .await
            .unwrap();
        index
            .put(&capture(2, vec![job("https://x/2", "Alpha", &["rust"], "R", Level::Mid)]))
            .await
            .unwrap();
        index
            .put(&capture(3, vec![job("https://x/3", "Beta", &["go"], "R", Level::Mid)]))
            .await
            .unwrap();

        let companies = index.top_companies(2);
        assert_eq!(companies[0], ("beta".to_string(), 2));
        assert_eq!(companies[1], ("alpha".to_string(), 1));

        let techs = index.top_technologies(2);
        assert_eq!(techs[0], ("rust".to_string(), 2));
        assert_eq!(techs[1], ("go".to_string(), 1));
    }

    #[tokio::test]
    async fn test_index_cache_consistency_after_mixed_operations() {
        let dir = TempDir::new().unwrap();
        let idx = index(&dir).await;

        let e1 = idx
            .put(&capture(1, vec![job("https://x/1", "A", &[], "R", Level::Mid)]))
            .await
            .unwrap();
        let _e2 = idx
            .put(&capture(2, vec![job("https://x/2", "B", &[], "R", Level::Mid)]))
            .await
            .unwrap();
        idx.delete(&e1.cache_key).await.unwrap();
        idx.put(&capture(3, vec![job("https://x/3", "C", &[], "R", Level::Mid)]))
            .await
            .unwrap();

        let cache = CompressedCache::open(dir.path(), 6, 24).unwrap();
        let on_disk: BTreeSet<String> = cache.list_keys().unwrap().into_iter().collect();
        let in_index: BTreeSet<String> = idx
            .search(&SearchCriteria::default())
            .into_iter()
            .map(|e| e.cache_key)
            .collect();
        assert_eq!(on_disk, in_index);
    }
}
