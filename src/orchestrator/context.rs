//! Shared service context for one crawl run.
//!
//! Everything the orchestrator's workers need - settings, metrics, the rate
//! limiter, the circuit registry, the cache index, and the selector engine -
//! is built once in `main` and injected here. No component reaches for
//! process-global state.

use crate::cache::CompressedCache;
use crate::cache_index::CacheIndex;
use crate::circuit_breaker::{BreakerConfig, CircuitRegistry};
use crate::metrics::{Metrics, SharedMetrics};
use crate::rate_limiter::RateLimiterRegistry;
use crate::selector_fallback::SelectorEngine;
use crate::settings::Settings;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::CrawlError;

pub struct CoreContext {
    pub settings: Settings,
    pub metrics: SharedMetrics,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub circuits: Arc<CircuitRegistry>,
    pub index: Arc<CacheIndex>,
    pub selectors: Arc<SelectorEngine>,
    pub cancel: CancellationToken,
}

impl CoreContext {
    /// Wire up every shared service from validated settings. Fails with an
    /// I/O error when the cache directory cannot be used.
    pub async fn initialize(settings: Settings) -> Result<Self, CrawlError> {
        let metrics: SharedMetrics = Arc::new(Metrics::new());

        let cache = CompressedCache::open(
            &settings.cache.dir,
            settings.scraping.compression_level,
            settings.cache.max_age_hours,
        )
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let index = CacheIndex::open(cache, settings.cache.rebuild_on_startup)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let selectors = SelectorEngine::with_defaults(Arc::clone(&metrics))
            .with_score_store(settings.cache.dir.join("selector_scores.json"));

        let rate_limiters = Arc::new(RateLimiterRegistry::new(
            settings.scraping.rate_per_second,
            settings.scraping.burst,
        ));

        Ok(Self {
            metrics,
            rate_limiters,
            circuits: Arc::new(CircuitRegistry::new(BreakerConfig::default())),
            index: Arc::new(index),
            selectors: Arc::new(selectors),
            cancel: CancellationToken::new(),
            settings,
        })
    }
}
