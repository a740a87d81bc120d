//! Bounded pool of browser sessions
//!
//! Checkout is exclusive: a session is moved out of the idle list into a
//! `SessionHandle`, and the handle's `Drop` puts it back (or closes it) no
//! matter how the caller exits.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};
use url::Url;

use super::{BrowserDriver, BrowserSession, PageSnapshot, SessionError};

struct IdleSession {
    session: Box<dyn BrowserSession>,
    created_at: Instant,
}

struct PoolInner {
    driver: Arc<dyn BrowserDriver>,
    idle: Mutex<Vec<IdleSession>>,
    ttl: Duration,
}

impl PoolInner {
    fn close_in_background(session: Box<dyn BrowserSession>, runtime: &Handle) {
        runtime.spawn(async move {
            session.close().await;
        });
    }
}

#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl SessionPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        info!("🌐 Session pool: driver={}, capacity={}, ttl={:?}", driver.name(), capacity, ttl);
        Self {
            inner: Arc::new(PoolInner {
                driver,
                idle: Mutex::new(Vec::new()),
                ttl,
            }),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wait up to `wait` for a free slot, then fail with `SessionExhausted`
    pub async fn acquire(&self, wait: Duration) -> Result<SessionHandle, SessionError> {
        let permit = match tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SessionError::PoolClosed),
            Err(_) => {
                return Err(SessionError::SessionExhausted {
                    waited_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };
        self.checkout(permit).await
    }

    /// Fail immediately with `SessionExhausted` when the pool is at capacity
    pub async fn try_acquire(&self) -> Result<SessionHandle, SessionError> {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(SessionError::SessionExhausted { waited_ms: 0 }),
            Err(TryAcquireError::Closed) => return Err(SessionError::PoolClosed),
        };
        self.checkout(permit).await
    }

    async fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<SessionHandle, SessionError> {
        let runtime = Handle::current();
        let reused = {
            let mut idle = self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let mut found = None;
            while let Some(candidate) = idle.pop() {
                if candidate.created_at.elapsed() < self.inner.ttl {
                    found = Some(candidate);
                    break;
                }
                debug!("Retiring browser session past its ttl");
                PoolInner::close_in_background(candidate.session, &runtime);
            }
            found
        };

        let (session, created_at) = match reused {
            Some(idle) => (idle.session, idle.created_at),
            None => {
                debug!("Launching new {} session", self.inner.driver.name());
                (self.inner.driver.launch().await?, Instant::now())
            }
        };

        Ok(SessionHandle {
            session: Some(session),
            created_at,
            healthy: true,
            inner: Arc::clone(&self.inner),
            runtime,
            _permit: permit,
        })
    }

    /// Stop handing out sessions and close the idle ones
    pub async fn shutdown(&self) {
        self.permits.close();
        let drained: Vec<IdleSession> = {
            let mut idle = self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.drain(..).collect()
        };
        let count = drained.len();
        for idle in drained {
            idle.session.close().await;
        }
        info!("Session pool shut down, closed {} idle sessions", count);
    }
}

/// Exclusive checkout of one session. Dropping it is the release.
pub struct SessionHandle {
    session: Option<Box<dyn BrowserSession>>,
    created_at: Instant,
    healthy: bool,
    inner: Arc<PoolInner>,
    runtime: Handle,
    _permit: OwnedSemaphorePermit,
}

impl SessionHandle {
    /// Load `url` within `timeout`. A timed-out session is discarded on release.
    pub async fn navigate(&mut self, url: &Url, timeout: Duration) -> Result<PageSnapshot, SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::PoolClosed);
        };
        // Stays unhealthy if this future is dropped mid-load
        self.healthy = false;
        match tokio::time::timeout(timeout, session.load(url)).await {
            Ok(result) => {
                self.healthy = true;
                result
            }
            Err(_) => {
                Err(SessionError::NavigationTimeout {
                    url: url.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Return the session to the pool
    pub fn release(self) {}

    /// Close instead of returning to the pool
    pub fn discard(mut self) {
        self.healthy = false;
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("healthy", &self.healthy)
            .field("age", &self.created_at.elapsed())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if self.healthy && self.created_at.elapsed() < self.inner.ttl {
            self.inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(IdleSession {
                    session,
                    created_at: self.created_at,
                });
        } else {
            warn!("Discarding browser session (healthy={})", self.healthy);
            PoolInner::close_in_background(session, &self.runtime);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::browser::static_pages::StaticPageDriver;

    fn pool(capacity: usize, ttl: Duration) -> (SessionPool, StaticPageDriver) {
        let driver = StaticPageDriver::new();
        driver.insert("https://shop.example/a", "<h1>A</h1>");
        (SessionPool::new(Arc::new(driver.clone()), capacity, ttl), driver)
    }

    #[tokio::test]
    async fn test_sessions_are_reused_after_release() {
        let (pool, driver) = pool(1, Duration::from_secs(60));
        let url = Url::parse("https://shop.example/a").unwrap();

        let mut handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
        handle.navigate(&url, Duration::from_secs(1)).await.unwrap();
        handle.release();

        let handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(driver.launch_count(), 1);
        assert_eq!(pool.in_use(), 1);
        drop(handle);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let (pool, _driver) = pool(1, Duration::from_secs(60));
        let _held = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let err = pool.acquire(Duration::from_millis(30)).await.unwrap_err();
        assert_eq!(err, SessionError::SessionExhausted { waited_ms: 30 });
        assert!(matches!(
            pool.try_acquire().await,
            Err(SessionError::SessionExhausted { waited_ms: 0 })
        ));
    }

    #[tokio::test]
    async fn test_waiting_caller_gets_released_session() {
        let (pool, _driver) = pool(1, Duration::from_secs(60));
        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_release_happens_on_navigation_error() {
        let (pool, _driver) = pool(1, Duration::from_secs(60));
        let missing = Url::parse("https://shop.example/missing").unwrap();
        {
            let mut handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
            assert!(handle.navigate(&missing, Duration::from_secs(1)).await.is_err());
        }
        assert_eq!(pool.in_use(), 0);
        assert!(pool.try_acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_timed_out_session_is_discarded() {
        let (pool, driver) = pool(1, Duration::from_secs(60));
        driver.set_delay(Duration::from_millis(200));
        let url = Url::parse("https://shop.example/a").unwrap();

        let mut handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let err = handle.navigate(&url, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, SessionError::NavigationTimeout { .. }));
        drop(handle);

        assert_eq!(pool.idle_count(), 0);
        let _fresh = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(driver.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_navigation_discards_session() {
        let (pool, driver) = pool(1, Duration::from_secs(60));
        driver.set_delay(Duration::from_secs(5));
        let url = Url::parse("https://shop.example/a").unwrap();

        let mut handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let abandoned = tokio::time::timeout(Duration::from_millis(20), handle.navigate(&url, Duration::from_secs(10))).await;
        assert!(abandoned.is_err());
        drop(handle);

        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_sessions_are_not_reused() {
        let (pool, driver) = pool(1, Duration::from_millis(10));
        drop(pool.acquire(Duration::from_millis(50)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(pool.acquire(Duration::from_millis(50)).await.unwrap());
        assert_eq!(driver.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let (pool, _driver) = pool(2, Duration::from_secs(60));
        drop(pool.acquire(Duration::from_millis(50)).await.unwrap());
        pool.shutdown().await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.acquire(Duration::from_millis(10)).await.err(), Some(SessionError::PoolClosed));
    }
}
