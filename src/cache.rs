//! Content-addressed blob store: gzip-compressed page captures with atomic
//! writes and quarantine for corrupt files.
//!
//! Blobs live at `<dir>/<cache_key>.json.gz` and are immutable once written.
//! `put` serializes, compresses, writes a temp file, fsyncs, and renames, so
//! a crash leaves either the old blob or a valid new one. A blob that fails
//! to decompress or deserialize is renamed with a `.corrupt` suffix and
//! never partially returned.

use crate::models::PageCapture;
use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use async_compression::Level;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache miss: {0}")]
    Miss(String),

    #[error("blob expired: {0}")]
    Expired(String),

    #[error("corrupt blob quarantined: {0}")]
    Corrupt(String),
}

/// Identity of a stored blob: hash of the canonical URL and page number
pub fn cache_key(canonical_url: &str, page: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url.as_bytes());
    hasher.update([0x1f]);
    hasher.update(page.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Size accounting returned by [`CompressedCache::put`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub cache_key: String,
    pub file_path: PathBuf,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
}

/// Outcome of a prune pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub bytes_reclaimed: u64,
}

pub struct CompressedCache {
    dir: PathBuf,
    compression_level: u32,
    max_age: Duration,
}

impl CompressedCache {
    /// Open (and create) the cache directory, verifying it is writable
    pub fn open(
        dir: impl Into<PathBuf>,
        compression_level: u32,
        max_age_hours: u64,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let probe = dir.join(".write_probe");
        std::fs::write(&probe, b"ok")?;
        std::fs::remove_file(&probe)?;
        Ok(Self {
            dir,
            compression_level: compression_level.clamp(1, 9),
            max_age: Duration::from_secs(max_age_hours * 3600),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json.gz"))
    }

    /// Serialize, compress, and atomically persist a page capture.
    /// Re-putting the same key replaces the blob atomically.
    pub async fn put(&self, key: &str, capture: &PageCapture) -> Result<BlobInfo, CacheError> {
        let plain = serde_json::to_vec(capture)?;

        let mut encoder = GzipEncoder::with_quality(
            Vec::new(),
            Level::Precise(self.compression_level as i32),
        );
        encoder.write_all(&plain).await?;
        encoder.shutdown().await?;
        let compressed = encoder.into_inner();

        let final_path = self.blob_path(key);
        let tmp_path = self.dir.join(format!(".{key}.tmp"));
        {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&compressed).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &final_path).await?;

        Ok(BlobInfo {
            cache_key: key.to_string(),
            file_path: final_path,
            uncompressed_size: plain.len() as u64,
            compressed_size: compressed.len() as u64,
            compression_ratio: if plain.is_empty() {
                1.0
            } else {
                compressed.len() as f64 / plain.len() as f64
            },
        })
    }

    /// Read, decompress, and deserialize a blob. Corrupt blobs are
    /// quarantined; blobs older than the configured age fail as expired.
    pub async fn get(&self, key: &str) -> Result<PageCapture, CacheError> {
        let path = self.blob_path(key);
        if !path.exists() {
            return Err(CacheError::Miss(key.to_string()));
        }
        if self.age(key)? > self.max_age {
            return Err(CacheError::Expired(key.to_string()));
        }

        let compressed = tokio::fs::read(&path).await?;
        match Self::decode(&compressed).await {
            Ok(capture) => Ok(capture),
            Err(error) => {
                let quarantine = path.with_extension("gz.corrupt");
                tokio::fs::rename(&path, &quarantine).await?;
                tracing::warn!(
                    key,
                    quarantine = %quarantine.display(),
                    %error,
                    "quarantined corrupt blob"
                );
                Err(CacheError::Corrupt(key.to_string()))
            }
        }
    }

    async fn decode(compressed: &[u8]) -> Result<PageCapture, CacheError> {
        let mut decoder = GzipDecoder::new(compressed);
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain).await?;
        Ok(serde_json::from_slice(&plain)?)
    }

    /// Remove a blob; missing files are fine
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.blob_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Blob age derived from the file's mtime
    pub fn age(&self, key: &str) -> Result<Duration, CacheError> {
        let metadata = std::fs::metadata(self.blob_path(key))?;
        let modified = metadata.modified()?;
        Ok(modified.elapsed().unwrap_or(Duration::ZERO))
    }

    /// Keys of all non-corrupt blobs currently on disk
    pub fn list_keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(key) = name.strip_suffix(".json.gz") {
                if !key.starts_with('.') {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Delete every blob older than `max_age`
    pub async fn prune(&self, max_age: Duration) -> Result<PruneReport, CacheError> {
        let mut report = PruneReport::default();
        for key in self.list_keys()? {
            if self.age(&key)? > max_age {
                let path = self.blob_path(&key);
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                self.delete(&key).await?;
                report.bytes_reclaimed += size;
                report.removed.push(key);
            }
        }
        Ok(report)
    }
}
