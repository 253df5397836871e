//! Fixed-size browser worker pool.
//!
//! Capacity is enforced with a semaphore; idle workers sit in a vec behind an
//! async mutex. `acquire` waits up to the configured timeout and then fails
//! with [`PoolError::Exhausted`] — callers map that to `NO_BROWSER` rather
//! than queueing unbounded work behind a saturated pool.
//!
//! A worker handed back via [`BrowserPool::release`] is reset for reuse; a
//! worker reported broken (or whose reset fails) is shut down and a fresh one
//! is lazily launched on the next acquire. The pool is generic over
//! [`PoolWorker`] so scheduling behavior is testable without Chromium.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Browser, Page};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::manager;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no browser worker available within {0:?}")]
    Exhausted(Duration),
    #[error("browser pool is shut down")]
    Closed,
    #[error("failed to launch browser worker: {0}")]
    Launch(#[source] anyhow::Error),
}

/// One pooled unit of browser capacity.
#[async_trait]
pub trait PoolWorker: Send + Sized + 'static {
    /// Return the worker to a clean state between jobs.
    async fn reset(&mut self) -> anyhow::Result<()>;

    /// Tear the worker down for good.
    async fn shutdown(self);
}

/// Launches replacement workers when the idle list runs dry.
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: PoolWorker;

    async fn create(&self) -> anyhow::Result<Self::Worker>;
}

/// A checked-out worker. Holds the capacity permit; hand it back through
/// [`BrowserPool::release`]. Dropping it without releasing frees the permit
/// but discards the worker, so the pool lazily relaunches on next acquire.
pub struct Lease<W: PoolWorker> {
    worker: Option<W>,
    _permit: OwnedSemaphorePermit,
}

impl<W: PoolWorker> Lease<W> {
    pub fn worker(&self) -> &W {
        self.worker.as_ref().expect("lease already consumed")
    }

    pub fn worker_mut(&mut self) -> &mut W {
        self.worker.as_mut().expect("lease already consumed")
    }
}

pub struct BrowserPool<F: WorkerFactory> {
    factory: F,
    idle: Mutex<Vec<F::Worker>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
}

impl<F: WorkerFactory> BrowserPool<F> {
    pub fn new(factory: F, capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free. Health reporting only; racy by nature.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Pre-launch `n` workers so the first requests don't pay launch latency.
    /// Launch failures are logged and skipped; the pool stays usable.
    pub async fn warm_up(&self, n: usize) {
        let n = n.min(self.capacity);
        for i in 0..n {
            match self.factory.create().await {
                Ok(w) => self.idle.lock().await.push(w),
                Err(e) => warn!("browser_pool: warm-up launch {} failed: {}", i + 1, e),
            }
        }
        info!(
            "browser_pool: warmed up {}/{} workers",
            self.idle.lock().await.len(),
            n
        );
    }

    /// Check out a worker, waiting at most the configured acquire timeout.
    pub async fn acquire(&self) -> Result<Lease<F::Worker>, PoolError> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::Exhausted(self.acquire_timeout))?
        .map_err(|_| PoolError::Closed)?;

        let existing = self.idle.lock().await.pop();
        let worker = match existing {
            Some(w) => w,
            None => self.factory.create().await.map_err(PoolError::Launch)?,
        };

        Ok(Lease {
            worker: Some(worker),
            _permit: permit,
        })
    }

    /// Hand a worker back. `healthy == false` (or a failed reset) discards it;
    /// capacity is restored either way when the lease's permit drops.
    pub async fn release(&self, mut lease: Lease<F::Worker>, healthy: bool) {
        let Some(mut worker) = lease.worker.take() else {
            return;
        };
        if healthy {
            match worker.reset().await {
                Ok(()) => {
                    self.idle.lock().await.push(worker);
                    return;
                }
                Err(e) => warn!("browser_pool: worker reset failed, discarding: {}", e),
            }
        }
        worker.shutdown().await;
    }

    /// Shut down every idle worker and refuse further acquires.
    pub async fn shutdown(&self) {
        self.permits.close();
        let workers: Vec<F::Worker> = self.idle.lock().await.drain(..).collect();
        let n = workers.len();
        for w in workers {
            w.shutdown().await;
        }
        info!("browser_pool: shut down {} idle workers", n);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chromium-backed worker
// ─────────────────────────────────────────────────────────────────────────────

/// A headless Chromium instance with one persistent page.
pub struct ChromeWorker {
    pub browser: Browser,
    pub page: Page,
    handler: JoinHandle<()>,
}

#[async_trait]
impl PoolWorker for ChromeWorker {
    async fn reset(&mut self) -> anyhow::Result<()> {
        // Blank navigation drops page state; cookies are managed per-job via
        // storage-state injection so they are cleared here too.
        self.page.goto("about:blank").await?;
        self.page
            .execute(
                chromiumoxide::cdp::browser_protocol::network::ClearBrowserCookiesParams::default(),
            )
            .await?;
        Ok(())
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("browser_pool: error closing browser: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

pub struct ChromeWorkerFactory {
    exe: String,
    headless: bool,
}

impl ChromeWorkerFactory {
    pub fn new(exe: String, headless: bool) -> Self {
        Self { exe, headless }
    }
}

#[async_trait]
impl WorkerFactory for ChromeWorkerFactory {
    type Worker = ChromeWorker;

    async fn create(&self) -> anyhow::Result<ChromeWorker> {
        let (browser, handler) = manager::launch_worker(&self.exe, self.headless).await?;
        let page = browser.new_page("about:blank").await?;
        Ok(ChromeWorker {
            browser,
            page,
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubWorker {
        id: usize,
        resets: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_reset: bool,
    }

    #[async_trait]
    impl PoolWorker for StubWorker {
        async fn reset(&mut self) -> anyhow::Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.fail_reset {
                anyhow::bail!("reset failed");
            }
            Ok(())
        }

        async fn shutdown(self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct StubFactory {
        created: AtomicUsize,
        resets: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_reset: bool,
    }

    #[async_trait]
    impl WorkerFactory for StubFactory {
        type Worker = StubWorker;

        async fn create(&self) -> anyhow::Result<StubWorker> {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(StubWorker {
                id,
                resets: Arc::clone(&self.resets),
                shutdowns: Arc::clone(&self.shutdowns),
                fail_reset: self.fail_reset,
            })
        }
    }

    #[tokio::test]
    async fn acquire_blocks_when_capacity_exhausted() {
        let pool = BrowserPool::new(StubFactory::default(), 2, Duration::from_millis(50));

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        // Third acquire must time out, not hand out extra capacity.
        match pool.acquire().await {
            Err(PoolError::Exhausted(_)) => {}
            other => panic!("expected Exhausted, got {:?}", other.map(|_| ())),
        }

        // Releasing one frees capacity for the next caller.
        pool.release(a, true).await;
        let c = pool.acquire().await.unwrap();
        pool.release(c, true).await;
    }

    #[tokio::test]
    async fn release_resets_and_reuses_worker() {
        let pool = BrowserPool::new(StubFactory::default(), 1, Duration::from_millis(50));

        let lease = pool.acquire().await.unwrap();
        let first_id = lease.worker().id;
        pool.release(lease, true).await;

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.worker().id, first_id, "healthy worker must be reused");
        assert_eq!(pool.factory.resets.load(Ordering::SeqCst), 1);
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn broken_worker_is_replaced() {
        let pool = BrowserPool::new(StubFactory::default(), 1, Duration::from_millis(50));

        let lease = pool.acquire().await.unwrap();
        let first_id = lease.worker().id;
        pool.release(lease, false).await;
        assert_eq!(pool.factory.shutdowns.load(Ordering::SeqCst), 1);

        let lease = pool.acquire().await.unwrap();
        assert_ne!(lease.worker().id, first_id, "broken worker must not return");
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn failed_reset_discards_worker() {
        let factory = StubFactory {
            fail_reset: true,
            ..Default::default()
        };
        let pool = BrowserPool::new(factory, 1, Duration::from_millis(50));

        let lease = pool.acquire().await.unwrap();
        pool.release(lease, true).await;
        assert_eq!(pool.factory.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 1, "capacity restored after discard");
    }

    #[tokio::test]
    async fn shutdown_closes_idle_and_blocks_acquire() {
        let pool = BrowserPool::new(StubFactory::default(), 2, Duration::from_millis(50));
        pool.warm_up(2).await;
        pool.shutdown().await;
        assert_eq!(pool.factory.shutdowns.load(Ordering::SeqCst), 2);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }
}
