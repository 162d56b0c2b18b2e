//! TTL snapshot cache
//!
//! A read-through cache for one kind of remote-fetch result. Many metric
//! readers hit the same device set on every scrape; the cache coalesces
//! them so that at most one fetch runs per TTL window.
//!
//! Locking protocol:
//!
//! 1. Take the shared entry lock; a present value younger than the TTL is
//!    returned immediately.
//! 2. Otherwise take the exclusive refresh lock and re-check the entry. The
//!    re-check is mandatory: a concurrent caller may have refreshed the entry
//!    while this one was waiting, and skipping it would issue a duplicate
//!    fetch.
//! 3. Still stale: run the fetch with no entry lock held, then take the
//!    entry write lock only to publish the outcome. The timestamp is
//!    recorded unconditionally; the value is stored only on success, so a
//!    failed fetch leaves the entry absent and the next reader retries.

use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

/// TTL for hardware snapshots
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(15);

/// Deadline for a single control-plane call
pub const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// One cached value and the time it was fetched
#[derive(Debug)]
struct CacheEntry<T> {
    value: Option<Arc<T>>,
    fetched_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
    fn fresh_value(&self, ttl: Duration) -> Option<Arc<T>> {
        match (&self.value, self.fetched_at) {
            (Some(value), Some(at)) if at.elapsed() < ttl => Some(Arc::clone(value)),
            _ => None,
        }
    }
}

/// Read-through cache guarding one remote-fetch result
#[derive(Debug)]
pub struct SnapshotCache<T> {
    name: &'static str,
    ttl: Duration,
    fetch_timeout: Duration,
    entry: RwLock<CacheEntry<T>>,
    refresh: Mutex<()>,
}

impl<T> SnapshotCache<T> {
    /// Create a cache with the hardware snapshot TTL and call timeout
    pub fn new(name: &'static str) -> Self {
        Self::with_ttl(name, SNAPSHOT_TTL, REMOTE_CALL_TIMEOUT)
    }

    /// Create a cache with explicit TTL and fetch timeout
    pub fn with_ttl(name: &'static str, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            name,
            ttl,
            fetch_timeout,
            entry: RwLock::new(CacheEntry {
                value: None,
                fetched_at: None,
            }),
            refresh: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Return the cached value, fetching it when absent or expired.
    ///
    /// Failures are returned to the caller as-is; there are no retries here.
    pub async fn read<F, Fut>(&self, fetch: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.entry.read().await.fresh_value(self.ttl) {
            return Ok(value);
        }

        let _refresh = self.refresh.lock().await;

        if let Some(value) = self.entry.read().await.fresh_value(self.ttl) {
            debug!("{} cache refreshed by a concurrent reader", self.name);
            return Ok(value);
        }

        debug!("{} cache miss, fetching", self.name);
        let outcome = match tokio::time::timeout(self.fetch_timeout, fetch()).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "{} fetch exceeded {:?}",
                self.name, self.fetch_timeout
            ))),
        };

        let mut entry = self.entry.write().await;
        entry.fetched_at = Some(Instant::now());
        match outcome {
            Ok(value) => {
                let value = Arc::new(value);
                entry.value = Some(Arc::clone(&value));
                Ok(value)
            }
            Err(e) => {
                entry.value = None;
                Err(e)
            }
        }
    }

    /// Drop the cached value so the next read fetches
    pub async fn invalidate(&self) {
        let mut entry = self.entry.write().await;
        entry.value = None;
        entry.fetched_at = None;
    }

    /// Currently cached value, regardless of age
    pub async fn peek(&self) -> Option<Arc<T>> {
        self.entry.read().await.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn counted_fetch(counter: &AtomicUsize, value: u32) -> Result<u32> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_snapshot_fallback() {
        let cache = SnapshotCache::new("devices");
        let counter = AtomicUsize::new(0);
        let fetches = &counter;

        // t=0: populate
        let v = cache.read(move || counted_fetch(fetches, 1)).await.unwrap();
        assert_eq!(*v, 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        // t=10s: served from cache
        tokio::time::advance(Duration::from_secs(10)).await;
        let v = cache.read(move || counted_fetch(fetches, 2)).await.unwrap();
        assert_eq!(*v, 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        // t=16s: exactly one new fetch
        tokio::time::advance(Duration::from_secs(6)).await;
        let v = cache.read(move || counted_fetch(fetches, 3)).await.unwrap();
        assert_eq!(*v, 3);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_leaves_entry_absent() {
        let cache: SnapshotCache<u32> = SnapshotCache::new("events");
        let counter = AtomicUsize::new(0);
        let fetches = &counter;

        let err = cache
            .read(move || async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                Err(Error::transport("socket closed"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(cache.peek().await.is_none());

        // Next reader retries immediately instead of serving a poisoned value
        let v = cache.read(move || counted_fetch(fetches, 9)).await.unwrap();
        assert_eq!(*v, 9);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout() {
        let cache: SnapshotCache<u32> =
            SnapshotCache::with_ttl("slow", Duration::from_secs(15), Duration::from_secs(2));

        let err = cache
            .read(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_concurrent_readers_share_one_fetch() {
        let cache = Arc::new(SnapshotCache::new("devices"));
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            let fetches = Arc::clone(&fetches);
            handles.push(tokio::spawn(async move {
                cache
                    .read(move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(vec![1u32, 2, 3])
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap();
            assert_eq!(*value, vec![1, 2, 3]);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let cache = SnapshotCache::new("ports");
        let counter = AtomicUsize::new(0);
        let fetches = &counter;

        cache.read(move || counted_fetch(fetches, 1)).await.unwrap();
        cache.invalidate().await;
        let v = cache.read(move || counted_fetch(fetches, 2)).await.unwrap();
        assert_eq!(*v, 2);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }
}
