//! Orchestrator: composes the fetcher, extractor, validator, incremental
//! processor, deduplicator, and stores into a single crawl run.
//!
//! One worker per seed URL walks pages in increasing order, gated by the
//! incremental processor's should-continue decision; seeds fan out across at
//! most `max_concurrent` workers. Per-page failures never abort the run, a
//! tripped circuit stops only its host, and every exit path closes the page
//! pool and flushes the checkpoint.

mod context;
mod pagination;
mod report;

pub use context::CoreContext;
pub use pagination::PaginationStyle;
pub use report::{ErrorSample, RunReport, RunTally};

use crate::cache_index::IndexError;
use crate::circuit_breaker::{CircuitBreaker, CircuitOpenError};
use crate::dedup::Deduplicator;
use crate::incremental::IncrementalProcessor;
use crate::logging;
use crate::models::{Job, PageCapture};
use crate::output::{run_slug, OutputFormat, OutputWriter};
use crate::page_pool::{FetchError, FetchedPage, PageLease, PagePool, PoolConfig};
use crate::retry::{Classify, FailureClass, RetryEngine, RetryError, RetryStrategy};
use crate::selector_fallback::SelectorEngine;
use crate::url_utils;
use crate::validator::{RawJob, Validator};
use chrono::Utc;
use scraper::Html;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("run cancelled")]
    Cancelled,
}

/// Failure of one gated fetch step: either the wrapped fetch failed or the
/// circuit rejected it before the fetch ran.
#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Circuit(#[from] CircuitOpenError),

    #[error("cancelled while waiting for rate limiter")]
    Cancelled,
}

impl Classify for StepError {
    fn class(&self) -> FailureClass {
        match self {
            StepError::Fetch(inner) => inner.class(),
            StepError::Circuit(_) => FailureClass::CircuitOpen,
            StepError::Cancelled => FailureClass::Fatal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            StepError::Fetch(inner) => inner.retry_after(),
            _ => None,
        }
    }
}

pub struct Crawler {
    ctx: Arc<CoreContext>,
}

impl Crawler {
    pub fn new(ctx: CoreContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Run one full crawl: every seed, pagination, validation, incremental
    /// filtering, dedup, persistence, and outputs.
    pub async fn run(&self) -> Result<RunReport, CrawlError> {
        let trace_id = logging::new_trace_id();
        let span = logging::run_span(&trace_id);
        self.run_inner(trace_id.clone()).instrument(span).await
    }

    async fn run_inner(&self, trace_id: String) -> Result<RunReport, CrawlError> {
        let ctx = &self.ctx;
        let settings = &ctx.settings;
        let started_at = Utc::now();
        let slug = run_slug(started_at);

        tracing::info!(
            seeds = settings.scraping.seed_urls.len(),
            max_pages = settings.scraping.max_pages,
            "crawl run starting"
        );

        let pool = Arc::new(PagePool::new(
            pool_config(settings),
            Arc::clone(&ctx.metrics),
        ));
        let strategy = RetryStrategy::from_name(&settings.performance.retry_strategy)
            .unwrap_or_else(RetryStrategy::standard);

        let incremental = if settings.scraping.incremental {
            let processor = IncrementalProcessor::open(
                settings.checkpoint_dir.join("incremental_checkpoint.json"),
                settings.scraping.forced,
            )
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
            Some(Arc::new(Mutex::new(processor)))
        } else {
            None
        };

        let shared = Arc::new(SharedRunState {
            dedup: Mutex::new(Deduplicator::new(
                settings.scraping.similarity_threshold,
                500,
            )),
            tally: Mutex::new(RunTally::default()),
            collected: Mutex::new(Vec::new()),
            quality: Mutex::new((0.0, 0)),
            validator: Validator::new(),
        });

        // Fan seeds out over a bounded worker count
        let worker_permits = Arc::new(Semaphore::new(settings.scraping.max_concurrent.max(1)));
        let mut workers: JoinSet<Result<(), CrawlError>> = JoinSet::new();
        for seed in settings.scraping.seed_urls.clone() {
            let worker = SeedWorker {
                ctx: Arc::clone(ctx),
                pool: Arc::clone(&pool),
                strategy,
                incremental: incremental.clone(),
                shared: Arc::clone(&shared),
            };
            let permits = Arc::clone(&worker_permits);
            workers.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Ok(());
                };
                worker.crawl_seed(seed).await
            });
        }

        let mut fatal: Option<CrawlError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(%error, "seed worker failed");
                    fatal.get_or_insert(error);
                    ctx.cancel.cancel();
                }
                Err(join_error) => {
                    tracing::error!(%join_error, "seed worker panicked");
                }
            }
        }

        // Cleanup that must happen on every path
        pool.close();
        if let Some(incremental) = &incremental {
            if let Err(error) = incremental.lock().await.end_session() {
                tracing::error!(%error, "failed to flush final checkpoint");
            }
        }
        if let Err(error) = ctx.selectors.save_scores() {
            tracing::warn!(%error, "failed to persist selector scores");
        }

        if let Some(error) = fatal {
            return Err(error);
        }
        if ctx.cancel.is_cancelled() {
            tracing::warn!("run cancelled; partial results remain valid");
            return Err(CrawlError::Cancelled);
        }

        // Cross-batch dedupe pass over everything the run accumulated
        let mut all_jobs = std::mem::take(&mut *shared.collected.lock().await);
        if settings.scraping.dedup {
            let mut final_pass = Deduplicator::new(settings.scraping.similarity_threshold, 500);
            let outcome = final_pass.dedupe(all_jobs);
            shared.tally.lock().await.duplicates += outcome.duplicates.len();
            all_jobs = outcome.unique;
        }

        let mut output_paths: Vec<PathBuf> = Vec::new();
        if !all_jobs.is_empty() {
            let formats: Vec<OutputFormat> = settings
                .output
                .formats
                .iter()
                .filter_map(|name| OutputFormat::from_name(name).ok())
                .collect();
            let writer = OutputWriter::new(&settings.output.dir, settings.output.max_files_per_type);
            output_paths = writer
                .write_all(&all_jobs, &formats, &slug)
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
        }

        ctx.metrics
            .set_gauge("circuit.open_count", ctx.circuits.open_count() as f64);
        let health = ctx.metrics.health();
        if let Err(error) = ctx.metrics.flush(&settings.metrics_dir, &slug) {
            tracing::warn!(%error, "failed to write metrics snapshot");
        }

        let tally = {
            let mut guard = shared.tally.lock().await;
            std::mem::take(&mut *guard)
        };
        let report = tally.into_report(
            slug,
            trace_id,
            started_at,
            settings.scraping.seed_urls.clone(),
            ctx.circuits.tripped(),
            health.score,
            output_paths,
        );

        tracing::info!(
            pages = report.pages_fetched,
            ingested = report.jobs_ingested,
            duplicates = report.duplicates,
            health = report.health_score,
            "crawl run finished"
        );
        Ok(report)
    }
}

/// State shared by every seed worker for the duration of one run
struct SharedRunState {
    dedup: Mutex<Deduplicator>,
    tally: Mutex<RunTally>,
    collected: Mutex<Vec<Job>>,
    /// (sum, count) of batch quality scores
    quality: Mutex<(f64, u64)>,
    validator: Validator,
}

struct SeedWorker {
    ctx: Arc<CoreContext>,
    pool: Arc<PagePool>,
    strategy: RetryStrategy,
    incremental: Option<Arc<Mutex<IncrementalProcessor>>>,
    shared: Arc<SharedRunState>,
}

impl SeedWorker {
    async fn crawl_seed(&self, seed: String) -> Result<(), CrawlError> {
        let host = url_utils::extract_host(&seed).unwrap_or_else(|| seed.clone());
        let breaker = self.ctx.circuits.get(&host);
        let rate_limiter = self.ctx.rate_limiters.get(&host);
        let retry = RetryEngine::new(Arc::clone(&self.ctx.metrics))
            .with_rate_limiter(Arc::clone(&rate_limiter));
        let max_pages = self.ctx.settings.scraping.max_pages;
        let mut page_url = seed.clone();

        for page in 1..=max_pages {
            if self.ctx.cancel.is_cancelled() {
                break;
            }

            let fetched = match self
                .fetch_page(&retry, &rate_limiter, &page_url, &breaker)
                .await
            {
                Ok(fetched) => fetched,
                Err(RetryError::Cancelled) => break,
                Err(RetryError::Aborted(StepError::Cancelled)) => break,
                Err(RetryError::Aborted(StepError::Circuit(error))) => {
                    tracing::warn!(%host, page, %error, "circuit open, stopping host");
                    self.shared
                        .tally
                        .lock()
                        .await
                        .record_error("circuit_open", error.to_string());
                    break;
                }
                Err(RetryError::Aborted(StepError::Fetch(error))) => {
                    // Non-retryable HTTP status; past the end of the listing
                    // or a page that simply is not there.
                    tracing::warn!(%host, page, %error, "fetch aborted, stopping host");
                    self.shared
                        .tally
                        .lock()
                        .await
                        .record_error(error.class().as_str(), error.to_string());
                    break;
                }
                Err(RetryError::Exhausted {
                    class,
                    attempts,
                    source,
                }) => {
                    let surfaced = exhausted_class(class);
                    tracing::warn!(%host, page, attempts, class = surfaced, %source, "page failed after retries");
                    self.shared
                        .tally
                        .lock()
                        .await
                        .record_error(surfaced, source.to_string());
                    // A failed page never aborts the run; move on to the
                    // next page number.
                    match url_utils::with_page(&seed, page + 1) {
                        Some(url) => {
                            page_url = url;
                            continue;
                        }
                        None => break,
                    }
                }
            };

            self.shared.tally.lock().await.pages_fetched += 1;

            let (raws, style) = extract_listing(&self.ctx.selectors, &fetched.body, &page_url);
            if raws.is_empty() {
                tracing::info!(%host, page, "no job cards found, stopping host");
                self.shared
                    .tally
                    .lock()
                    .await
                    .record_error(FailureClass::ParseError.as_str(), format!("{page_url}: no cards"));
                break;
            }

            let should_continue = self.process_batch(&raws, &page_url, page).await?;
            if !should_continue {
                break;
            }

            page_url = match style {
                PaginationStyle::NextLink(url) => url,
                PaginationStyle::Numeric => match url_utils::with_page(&seed, page + 1) {
                    Some(url) => url,
                    None => break,
                },
                PaginationStyle::InfiniteScroll | PaginationStyle::None => break,
            };
        }
        Ok(())
    }

    /// Validate, filter, dedupe, and persist one page batch. Returns the
    /// incremental processor's should-continue decision.
    async fn process_batch(
        &self,
        raws: &[RawJob],
        page_url: &str,
        page: u32,
    ) -> Result<bool, CrawlError> {
        let batch = self.shared.validator.validate_batch(raws, page_url);

        {
            let mut quality = self.shared.quality.lock().await;
            quality.0 += batch.quality_score;
            quality.1 += 1;
            self.ctx
                .metrics
                .set_gauge("validation.quality_score", quality.0 / quality.1 as f64);
        }
        {
            let mut tally = self.shared.tally.lock().await;
            tally.rejections += batch.rejections.len();
            for rejection in &batch.rejections {
                tally.record_error("schema_violation", rejection.to_string());
            }
        }

        let (fresh, should_continue) = match &self.incremental {
            Some(incremental) => {
                let decision = incremental
                    .lock()
                    .await
                    .process_page(batch.jobs)
                    .map_err(|e| CrawlError::Storage(e.to_string()))?;
                self.shared.tally.lock().await.known_skipped += decision.known_count;
                tracing::info!(
                    page,
                    new = decision.new_count,
                    known = decision.known_count,
                    changed = decision.changed_count,
                    "page classified"
                );
                (decision.fresh, decision.should_continue)
            }
            None => (batch.jobs, true),
        };

        let unique = if self.ctx.settings.scraping.dedup {
            let outcome = self.shared.dedup.lock().await.dedupe(fresh);
            self.shared.tally.lock().await.duplicates += outcome.duplicates.len();
            outcome.unique
        } else {
            fresh
        };

        if !unique.is_empty() {
            let capture = PageCapture {
                url: page_url.to_string(),
                page,
                captured_at: Utc::now(),
                jobs: unique.clone(),
            };
            self.ctx
                .index
                .put(&capture)
                .await
                .map_err(index_error_to_crawl)?;

            let mut tally = self.shared.tally.lock().await;
            tally.jobs_ingested += unique.len();
            drop(tally);
            self.shared.collected.lock().await.extend(unique);
        }

        Ok(should_continue)
    }

    /// One rate-limited, circuit-gated, retry-wrapped page fetch
    async fn fetch_page(
        &self,
        retry: &RetryEngine,
        rate_limiter: &Arc<crate::rate_limiter::RateLimiter>,
        url: &str,
        breaker: &Arc<CircuitBreaker>,
    ) -> Result<FetchedPage, RetryError<StepError>> {
        retry
            .run(self.strategy, url, &self.ctx.cancel, |_attempt| {
                let url = url.to_string();
                let pool = Arc::clone(&self.pool);
                let breaker = Arc::clone(breaker);
                let metrics = Arc::clone(&self.ctx.metrics);
                let rate_limiter = Arc::clone(rate_limiter);
                let cancel = self.ctx.cancel.clone();
                async move {
                    tokio::select! {
                        _ = rate_limiter.acquire() => {}
                        _ = cancel.cancelled() => return Err(StepError::Cancelled),
                    }
                    breaker.try_acquire()?;

                    let mut lease: PageLease = match pool.acquire().await {
                        Ok(lease) => lease,
                        Err(error) => {
                            breaker.record_success(); // pool trouble is not host trouble
                            return Err(StepError::Fetch(error));
                        }
                    };
                    let outcome = lease.fetch(&url).await;
                    match &outcome {
                        Ok(page) => {
                            breaker.record_success();
                            metrics.inc("fetch.success");
                            metrics.observe("fetch.latency", page.elapsed);
                        }
                        Err(error) => {
                            metrics.inc("fetch.failure");
                            // Host health only degrades on server-side trouble
                            if error.class().is_retryable() {
                                breaker.record_failure();
                            } else {
                                breaker.record_success();
                            }
                        }
                    }
                    outcome.map_err(StepError::Fetch)
                }
            })
            .await
    }
}

/// Surface name for a retryable class that kept failing through every attempt
fn exhausted_class(class: FailureClass) -> &'static str {
    match class {
        FailureClass::TransientNetwork => "network_exhausted",
        FailureClass::RateLimited => "rate_limited_persistent",
        FailureClass::Timeout => "timeout_exhausted",
        FailureClass::ServerError => "server_error_exhausted",
        other => other.as_str(),
    }
}

fn index_error_to_crawl(error: IndexError) -> CrawlError {
    CrawlError::Storage(error.to_string())
}

fn pool_config(settings: &crate::settings::Settings) -> PoolConfig {
    let perf = &settings.performance;
    PoolConfig {
        min_size: perf.pool_min_size,
        max_size: perf.pool_max_size,
        max_age: Duration::from_secs(perf.pool_max_age_secs),
        max_uses: perf.pool_max_uses,
        max_consecutive_errors: 3,
        cleanup_interval: Duration::from_secs(perf.pool_cleanup_interval_secs),
        navigation_timeout: Duration::from_secs(perf.navigation_timeout_secs),
        user_agent: settings
            .browser
            .user_agent
            .clone()
            .unwrap_or_else(|| concat!("jobgrid/", env!("CARGO_PKG_VERSION")).to_string()),
    }
}

/// Parse a fetched listing page into raw records plus its pagination style.
/// Synchronous on purpose: the parsed DOM never crosses an await point.
fn extract_listing(
    selectors: &SelectorEngine,
    body: &str,
    base_url: &str,
) -> (Vec<RawJob>, PaginationStyle) {
    let html = Html::parse_document(body);
    let mut raws = Vec::new();
    for card in selectors.select_cards(&html) {
        raws.push(RawJob {
            url: selectors.extract(card, "url"),
            title: selectors.extract(card, "title"),
            company: selectors.extract(card, "company"),
            location: selectors.extract(card, "location"),
            description: selectors.extract(card, "description"),
            salary: selectors.extract(card, "salary"),
            work_mode: selectors.extract(card, "work_mode"),
            level: selectors.extract(card, "level"),
            technologies: selectors.extract_all(card, "technologies"),
            benefits: selectors.extract_all(card, "benefits"),
            posted_at: selectors.extract(card, "posted_at"),
        });
    }
    let style = pagination::detect(selectors, &html, base_url);
    (raws, style)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    #[test]
    fn test_extract_listing_builds_raw_records() {
        let selectors = SelectorEngine::with_defaults(Arc::new(Metrics::new()));
        let body = r#"<html><body>
            <article class="job-card">
                <h2><a href="/vagas/dev/1">Rust Developer Pleno</a></h2>
                <span class="company-name">Acme</span>
                <div class="job-description">Build the ingestion pipeline end to end with us.</div>
            </article>
            <article class="job-card">
                <h2><a href="/vagas/dev/2">Data Engineer Senior</a></h2>
                <span class="company-name">Umbrella</span>
                <div class="job-description">Own the analytics warehouse and its loaders.</div>
            </article>
            <a rel="next" href="/vagas?page=2">next</a>
        </body></html>"#;

        let (raws, style) = extract_listing(&selectors, body, "https://jobs.example.com/vagas");
        assert_eq!(raws.len(), 2);
        assert_eq!(raws[0].title.as_deref(), Some("Rust Developer Pleno"));
        assert_eq!(raws[1].url.as_deref(), Some("/vagas/dev/2"));
        assert_eq!(
            style,
            PaginationStyle::NextLink("https://jobs.example.com/vagas?page=2".to_string())
        );
    }

    #[test]
    fn test_exhausted_class_surfacing() {
        assert_eq!(
            exhausted_class(FailureClass::TransientNetwork),
            "network_exhausted"
        );
        assert_eq!(
            exhausted_class(FailureClass::RateLimited),
            "rate_limited_persistent"
        );
    }
}
