//! Per-root byte accounting.
//!
//! [`StorageManager`] keeps one cached "bytes used" total per volume root.
//! An entry moves through:
//!
//! ```text
//! absent -> initializing (total = None, first locker walks the tree)
//!        -> ready        (total = Some(n))
//!        -> evicted      (last_access = EVICTED, removed from the map)
//! ```
//!
//! The total is only read or written while the entry's mutex is held. A
//! task that acquires the mutex of an entry evicted meanwhile sees the
//! sentinel and retries against a fresh entry.

pub mod quota;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::StorageConfig;
use crate::Result;

pub use quota::{QuotaPolicy, VolumeQuota};

/// Sentinel last-access value of an evicted entry.
const EVICTED: i64 = i64::MIN;

/// Cached byte total of one root.
#[derive(Debug)]
pub struct DirectoryStorageCache {
    key: String,
    total: Arc<AsyncMutex<Option<i64>>>,
    last_access: AtomicI64,
}

impl DirectoryStorageCache {
    fn new(key: &str, now: i64) -> Self {
        Self {
            key: key.to_string(),
            total: Arc::new(AsyncMutex::new(None)),
            last_access: AtomicI64::new(now),
        }
    }

    /// Root key.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn is_evicted(&self) -> bool {
        self.last_access.load(Ordering::SeqCst) == EVICTED
    }

    fn touch(&self, now: i64) {
        // Never resurrect an evicted entry.
        let _ = self
            .last_access
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != EVICTED).then_some(now)
            });
    }
}

/// Exclusive hold on one root's total.
///
/// Dropping the lock releases the root.
#[derive(Debug)]
pub struct StorageLock {
    cache: Arc<DirectoryStorageCache>,
    guard: OwnedMutexGuard<Option<i64>>,
}

impl StorageLock {
    /// Root key.
    pub fn key(&self) -> &str {
        self.cache.key()
    }

    /// Current total in bytes.
    pub fn total(&self) -> i64 {
        self.guard.unwrap_or(0)
    }

    /// Adjust the total by `delta`, never below zero.
    pub fn apply(&mut self, delta: i64) {
        *self.guard = Some((self.total() + delta).max(0));
    }

    /// Replace the total.
    pub fn set(&mut self, total: i64) {
        *self.guard = Some(total.max(0));
    }
}

/// Cache of per-root byte totals with TTL and size-bound eviction.
#[derive(Debug)]
pub struct StorageManager {
    caches: Mutex<HashMap<String, Arc<DirectoryStorageCache>>>,
    ttl: Duration,
    poll_interval: Duration,
    max_entries: usize,
    epoch: Instant,
}

impl StorageManager {
    /// Create a manager from configuration.
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_limits(
            Duration::from_secs(config.cache_ttl_secs),
            Duration::from_secs(config.poll_interval_secs),
            config.max_entries,
        )
    }

    /// Create a manager with explicit limits.
    pub fn with_limits(ttl: Duration, poll_interval: Duration, max_entries: usize) -> Self {
        Self {
            caches: Mutex::new(HashMap::new()),
            ttl,
            poll_interval,
            max_entries: max_entries.max(1),
            epoch: Instant::now(),
        }
    }

    fn now(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn caches(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<DirectoryStorageCache>>> {
        self.caches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of cached roots.
    pub fn len(&self) -> usize {
        self.caches().len()
    }

    /// Whether no root is cached.
    pub fn is_empty(&self) -> bool {
        self.caches().is_empty()
    }

    /// Whether `key` currently has a cache entry.
    pub fn contains(&self, key: &str) -> bool {
        self.caches().contains_key(key)
    }

    fn get_or_insert(&self, key: &str) -> Arc<DirectoryStorageCache> {
        let now = self.now();
        let mut caches = self.caches();
        let cache = caches
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(DirectoryStorageCache::new(key, now)))
            .clone();
        cache.touch(now);

        if caches.len() > self.max_entries {
            Self::evict_oldest(&mut caches, self.max_entries, key);
        }
        cache
    }

    /// Evict least recently used entries beyond `max_entries`, skipping
    /// entries that are locked and the one being accessed.
    fn evict_oldest(
        caches: &mut HashMap<String, Arc<DirectoryStorageCache>>,
        max_entries: usize,
        keep: &str,
    ) {
        let mut candidates: Vec<(i64, String)> = caches
            .iter()
            .filter(|(k, _)| k.as_str() != keep)
            .map(|(k, c)| (c.last_access.load(Ordering::SeqCst), k.clone()))
            .collect();
        candidates.sort();

        for (_, key) in candidates {
            if caches.len() <= max_entries {
                break;
            }
            let Some(cache) = caches.get(&key).cloned() else {
                continue;
            };
            let Ok(_guard) = cache.total.try_lock() else {
                continue;
            };
            cache.last_access.store(EVICTED, Ordering::SeqCst);
            caches.remove(&key);
            debug!(key = %key, "Evicted storage cache entry (size bound)");
        }
    }

    /// Lock `key`'s total, computing it with `create` if this is the first use.
    ///
    /// Returns the lock and whether the total was just computed. A failing
    /// `create` evicts the entry so the next caller starts over.
    pub async fn lock<F, Fut>(&self, key: &str, create: F) -> Result<(StorageLock, bool)>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        loop {
            let cache = self.get_or_insert(key);
            let mut guard = Arc::clone(&cache.total).lock_owned().await;
            if cache.is_evicted() {
                drop(guard);
                continue;
            }
            cache.touch(self.now());

            let mut created = false;
            if guard.is_none() {
                match create().await {
                    Ok(total) => {
                        *guard = Some(total.max(0));
                        created = true;
                        debug!(key = %key, total, "Initialized storage total");
                    }
                    Err(e) => {
                        self.remove_locked(&cache);
                        return Err(e);
                    }
                }
            }
            return Ok((StorageLock { cache, guard }, created));
        }
    }

    /// Release a lock; `None` is a no-op.
    pub fn unlock(&self, lock: Option<StorageLock>) {
        if let Some(lock) = lock {
            lock.cache.touch(self.now());
        }
    }

    /// Mark an entry whose mutex the caller holds as evicted.
    fn remove_locked(&self, cache: &Arc<DirectoryStorageCache>) {
        cache.last_access.store(EVICTED, Ordering::SeqCst);
        let mut caches = self.caches();
        if caches
            .get(cache.key())
            .is_some_and(|current| Arc::ptr_eq(current, cache))
        {
            caches.remove(cache.key());
        }
    }

    /// Evict entries idle for longer than the TTL. Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = self.now() - self.ttl.as_millis() as i64;
        let mut caches = self.caches();
        let before = caches.len();
        caches.retain(|key, cache| {
            if cache.last_access.load(Ordering::SeqCst) > cutoff {
                return true;
            }
            let Ok(_guard) = cache.total.try_lock() else {
                return true;
            };
            cache.last_access.store(EVICTED, Ordering::SeqCst);
            debug!(key = %key, "Evicted idle storage cache entry");
            false
        });
        before - caches.len()
    }

    /// Start the background TTL sweep.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let evicted = manager.sweep_expired();
                if evicted > 0 {
                    debug!(evicted, remaining = manager.len(), "Storage cache sweep");
                }
            }
        })
    }

    /// Recompute `key`'s total from scratch in the background.
    ///
    /// Only cached roots are recounted. A failing walk evicts the entry.
    pub fn schedule_recount<F, Fut>(self: &Arc<Self>, key: String, walk: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<i64>> + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let Some(cache) = manager.caches().get(&key).cloned() else {
                return;
            };
            let mut guard = Arc::clone(&cache.total).lock_owned().await;
            if cache.is_evicted() {
                return;
            }

            match walk().await {
                Ok(total) => {
                    let cached = *guard;
                    if cached != Some(total) {
                        debug!(key = %key, ?cached, total, "Recount corrected storage total");
                    }
                    *guard = Some(total.max(0));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Recount failed, evicting storage total");
                    manager.remove_locked(&cache);
                }
            }
        })
    }

    /// Cached total for `key` without computing it. Waits for the root's lock.
    pub async fn cached_total(&self, key: &str) -> Option<i64> {
        let cache = self.caches().get(key).cloned()?;
        let guard = cache.total.lock().await;
        if cache.is_evicted() {
            return None;
        }
        *guard
    }
}

/// Total size in bytes of the regular files under `root`, skipping `exclude`.
pub fn directory_size(root: &Path, exclude: Option<&Path>) -> Result<i64> {
    let mut total: i64 = 0;
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| match exclude {
        Some(excluded) => !entry.path().starts_with(excluded),
        None => true,
    });
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len() as i64;
        }
    }
    Ok(total)
}

/// [`directory_size`] on the blocking pool.
pub async fn directory_size_async(root: PathBuf, exclude: Option<PathBuf>) -> Result<i64> {
    tokio::task::spawn_blocking(move || directory_size(&root, exclude.as_deref())).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn manager(ttl_ms: u64, max_entries: usize) -> Arc<StorageManager> {
        Arc::new(StorageManager::with_limits(
            Duration::from_millis(ttl_ms),
            Duration::from_millis(10),
            max_entries,
        ))
    }

    #[tokio::test]
    async fn test_lock_initializes_once() {
        let manager = manager(60_000, 10);
        let calls = Arc::new(AtomicUsize::new(0));

        for expected_created in [true, false] {
            let counter = Arc::clone(&calls);
            let (lock, created) = manager
                .lock("root", move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(100)
                    }
                })
                .await
                .unwrap();
            assert_eq!(created, expected_created);
            assert_eq!(lock.total(), 100);
            manager.unlock(Some(lock));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_apply_clamps_at_zero() {
        let manager = manager(60_000, 10);
        let (mut lock, _) = manager.lock("root", || async { Ok(10) }).await.unwrap();
        lock.apply(25);
        assert_eq!(lock.total(), 35);
        lock.apply(-100);
        assert_eq!(lock.total(), 0);
        manager.unlock(Some(lock));
        manager.unlock(None);
        assert_eq!(manager.cached_total("root").await, Some(0));
    }

    #[tokio::test]
    async fn test_failed_create_evicts() {
        let manager = manager(60_000, 10);
        let result = manager
            .lock("root", || async {
                Err(crate::ConnectorError::Task("walk failed".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(!manager.contains("root"));

        let (lock, created) = manager.lock("root", || async { Ok(5) }).await.unwrap();
        assert!(created);
        assert_eq!(lock.total(), 5);
    }

    #[tokio::test]
    async fn test_lock_excludes_second_locker() {
        let manager = manager(60_000, 10);
        let (lock, _) = manager.lock("root", || async { Ok(0) }).await.unwrap();

        let second = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let (mut lock, _) = manager.lock("root", || async { Ok(0) }).await.unwrap();
                lock.apply(1);
                lock.total()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(lock);
        assert_eq!(second.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_different_roots_do_not_block() {
        let manager = manager(60_000, 10);
        let (_a, _) = manager.lock("a", || async { Ok(0) }).await.unwrap();
        let b = tokio::time::timeout(
            Duration::from_millis(200),
            manager.lock("b", || async { Ok(0) }),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_ttl_eviction_recomputes() {
        let manager = manager(20, 10);
        let (lock, _) = manager.lock("root", || async { Ok(1) }).await.unwrap();
        drop(lock);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(manager.sweep_expired(), 1);
        assert!(!manager.contains("root"));

        let (lock, created) = manager.lock("root", || async { Ok(2) }).await.unwrap();
        assert!(created);
        assert_eq!(lock.total(), 2);
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_entries() {
        let manager = manager(1, 10);
        let (lock, _) = manager.lock("root", || async { Ok(1) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.sweep_expired(), 0);
        assert!(manager.contains("root"));
        drop(lock);
    }

    #[tokio::test]
    async fn test_background_sweeper_evicts() {
        let manager = manager(20, 10);
        let sweeper = manager.start_sweeper();
        let (lock, _) = manager.lock("root", || async { Ok(1) }).await.unwrap();
        drop(lock);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!manager.contains("root"));
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_size_bound_evicts_oldest() {
        let manager = manager(60_000, 2);
        for key in ["a", "b", "c"] {
            let (lock, _) = manager.lock(key, || async { Ok(0) }).await.unwrap();
            drop(lock);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.len(), 2);
        assert!(!manager.contains("a"));
        assert!(manager.contains("b"));
        assert!(manager.contains("c"));
    }

    #[tokio::test]
    async fn test_size_bound_skips_held_entry() {
        let manager = manager(60_000, 1);
        let (held, _) = manager.lock("a", || async { Ok(0) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (lock, _) = manager.lock("b", || async { Ok(0) }).await.unwrap();
        drop(lock);

        // "a" is oldest but locked, so the map stays over its bound.
        assert!(manager.contains("a"));
        assert!(manager.contains("b"));
        drop(held);
    }

    #[tokio::test]
    async fn test_waiter_retries_after_eviction() {
        let manager = manager(1, 10);
        let (lock, _) = manager.lock("root", || async { Ok(1) }).await.unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let (lock, created) = manager.lock("root", || async { Ok(9) }).await.unwrap();
                (lock.total(), created)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Evict while the waiter is queued on the old entry's mutex.
        let cache = manager.caches().get("root").cloned().unwrap();
        drop(lock);
        manager.remove_locked(&cache);

        assert_eq!(waiter.await.unwrap(), (9, true));
    }

    #[tokio::test]
    async fn test_recount_replaces_total() {
        let manager = manager(60_000, 10);
        let (mut lock, _) = manager.lock("root", || async { Ok(10) }).await.unwrap();
        lock.apply(5);
        drop(lock);

        manager
            .schedule_recount("root".to_string(), || async { Ok(12) })
            .await
            .unwrap();
        assert_eq!(manager.cached_total("root").await, Some(12));
    }

    #[tokio::test]
    async fn test_failed_recount_evicts() {
        let manager = manager(60_000, 10);
        let (lock, _) = manager.lock("root", || async { Ok(10) }).await.unwrap();
        drop(lock);

        manager
            .schedule_recount("root".to_string(), || async {
                Err(crate::ConnectorError::Task("gone".to_string()))
            })
            .await
            .unwrap();
        assert!(!manager.contains("root"));
        assert_eq!(manager.cached_total("root").await, None);
    }

    #[test]
    fn test_directory_size_excludes() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(temp_dir.path().join("sub")).unwrap();
        std::fs::write(temp_dir.path().join("sub").join("b"), vec![0u8; 50]).unwrap();
        std::fs::create_dir(temp_dir.path().join(".tmb")).unwrap();
        std::fs::write(temp_dir.path().join(".tmb").join("t.png"), vec![0u8; 7]).unwrap();

        let excluded = temp_dir.path().join(".tmb");
        assert_eq!(directory_size(temp_dir.path(), Some(&excluded)).unwrap(), 150);
        assert_eq!(directory_size(temp_dir.path(), None).unwrap(), 157);
    }
}
