//! Request cancellation registry and named-lock cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConnectorConfig;

#[derive(Debug)]
struct Registration {
    token: CancellationToken,
    created: Instant,
    generation: u64,
}

#[derive(Debug)]
struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    last_access: Instant,
}

/// Maps client request ids to cancellation tokens and hands out named locks.
#[derive(Debug)]
pub struct ConnectorManager {
    requests: Mutex<HashMap<String, Registration>>,
    locks: Mutex<HashMap<String, LockEntry>>,
    next_generation: AtomicU64,
    request_ttl: Duration,
    lock_ttl: Duration,
    max_requests: usize,
    max_locks: usize,
    sweep_interval: Duration,
}

impl Default for ConnectorManager {
    fn default() -> Self {
        Self::new(&ConnectorConfig::default())
    }
}

impl ConnectorManager {
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            request_ttl: Duration::from_secs(config.request_ttl_secs),
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            max_requests: config.max_requests.max(1),
            max_locks: config.max_locks.max(1),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    /// Override both lifetimes.
    pub fn with_ttl(mut self, request_ttl: Duration, lock_ttl: Duration) -> Self {
        self.request_ttl = request_ttl;
        self.lock_ttl = lock_ttl;
        self
    }

    /// Register a request id and return its registration.
    ///
    /// The id is unregistered when the returned value is dropped, unless a
    /// newer registration has taken the same id in the meantime.
    pub fn register(&self, request_id: &str) -> RequestRegistration<'_> {
        let token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.insert(
                request_id.to_string(),
                Registration {
                    token: token.clone(),
                    created: Instant::now(),
                    generation,
                },
            );
            if requests.len() > self.max_requests {
                let excess = requests.len() - self.max_requests;
                let mut oldest: Vec<(Instant, String)> = requests
                    .iter()
                    .map(|(id, r)| (r.created, id.clone()))
                    .collect();
                oldest.sort();
                for (_, id) in oldest.into_iter().take(excess) {
                    requests.remove(&id);
                }
            }
        }
        debug!(request_id, "Registered request");

        RequestRegistration {
            manager: self,
            request_id: request_id.to_string(),
            token,
            generation,
        }
    }

    /// Forget one registration of a request id. Does not cancel it.
    fn unregister(&self, request_id: &str, generation: u64) {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        if requests
            .get(request_id)
            .is_some_and(|r| r.generation == generation)
        {
            requests.remove(request_id);
        }
    }

    /// Cancel a registered request. Returns whether the id was known.
    pub fn abort(&self, request_id: &str) -> bool {
        let registration = self
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
        match registration {
            Some(registration) => {
                registration.token.cancel();
                debug!(request_id, "Aborted request");
                true
            }
            None => false,
        }
    }

    /// Whether a request id is registered.
    pub fn is_registered(&self, request_id: &str) -> bool {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(request_id)
    }

    /// Number of registered requests.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of cached named locks.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Acquire the lock named `key`, creating it on first use.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            let entry = locks.entry(key.to_string()).or_insert_with(|| LockEntry {
                lock: Arc::new(AsyncMutex::new(())),
                last_access: Instant::now(),
            });
            entry.last_access = Instant::now();
            let lock = Arc::clone(&entry.lock);

            if locks.len() > self.max_locks {
                Self::evict_idle_locks(&mut locks, None, key);
            }
            lock
        };
        lock.lock_owned().await
    }

    /// Drop idle locks. With `ttl = None` every unused lock but `keep` goes.
    fn evict_idle_locks(
        locks: &mut HashMap<String, LockEntry>,
        ttl: Option<Duration>,
        keep: &str,
    ) -> usize {
        let before = locks.len();
        locks.retain(|key, entry| {
            let idle = ttl.map_or(true, |ttl| entry.last_access.elapsed() > ttl);
            // Only the map holds an unused lock.
            key == keep || !idle || Arc::strong_count(&entry.lock) > 1
        });
        before - locks.len()
    }

    /// Drop expired registrations and idle locks.
    pub fn sweep(&self) -> (usize, usize) {
        let requests = {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            let before = requests.len();
            let ttl = self.request_ttl;
            requests.retain(|_, r| r.created.elapsed() <= ttl);
            before - requests.len()
        };
        let locks = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Self::evict_idle_locks(&mut locks, Some(self.lock_ttl), "")
        };
        (requests, locks)
    }

    /// Start the background sweep.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let sweep_interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let (requests, locks) = manager.sweep();
                if requests + locks > 0 {
                    debug!(requests, locks, "Connector manager sweep");
                }
            }
        })
    }
}

/// A registered request; unregisters itself on drop.
#[derive(Debug)]
pub struct RequestRegistration<'a> {
    manager: &'a ConnectorManager,
    request_id: String,
    token: CancellationToken,
    generation: u64,
}

impl RequestRegistration<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for RequestRegistration<'_> {
    fn drop(&mut self) {
        self.manager.unregister(&self.request_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectorManager {
        ConnectorManager::default()
    }

    #[test]
    fn test_register_and_abort() {
        let manager = manager();
        let registration = manager.register("req-1");
        let token = registration.token().clone();
        assert!(manager.is_registered("req-1"));
        assert!(!token.is_cancelled());

        assert!(manager.abort("req-1"));
        assert!(token.is_cancelled());
        assert!(!manager.is_registered("req-1"));
        assert!(!manager.abort("req-1"));
    }

    #[test]
    fn test_registration_drop_unregisters() {
        let manager = manager();
        {
            let _registration = manager.register("req-1");
            assert_eq!(manager.request_count(), 1);
        }
        assert_eq!(manager.request_count(), 0);
    }

    #[test]
    fn test_stale_registration_keeps_newer_one() {
        let manager = manager();
        let first = manager.register("req-1");
        let second = manager.register("req-1");
        drop(first);
        assert!(manager.is_registered("req-1"));

        assert!(manager.abort("req-1"));
        assert!(second.token().is_cancelled());
    }

    #[test]
    fn test_abort_unknown() {
        assert!(!manager().abort("missing"));
    }

    #[test]
    fn test_request_ttl_sweep() {
        let manager = manager().with_ttl(Duration::from_millis(10), Duration::from_secs(60));
        let registration = manager.register("req-1");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(manager.sweep().0, 1);
        assert!(!manager.is_registered("req-1"));
        // Sweeping does not cancel.
        assert!(!registration.token().is_cancelled());
    }

    #[test]
    fn test_request_max_size() {
        let config = ConnectorConfig {
            max_requests: 2,
            ..Default::default()
        };
        let manager = ConnectorManager::new(&config);
        let _a = manager.register("a");
        std::thread::sleep(Duration::from_millis(2));
        let _b = manager.register("b");
        std::thread::sleep(Duration::from_millis(2));
        let _c = manager.register("c");
        assert_eq!(manager.request_count(), 2);
        assert!(!manager.is_registered("a"));
    }

    #[tokio::test]
    async fn test_named_lock_serializes() {
        let manager = Arc::new(manager());
        let guard = manager.lock("chunk-1").await;

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let _guard = manager.lock("chunk-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let other = tokio::time::timeout(Duration::from_millis(100), manager.lock("chunk-2")).await;
        assert!(other.is_ok());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_locks_swept() {
        let manager = manager().with_ttl(Duration::from_secs(60), Duration::from_millis(10));
        let held = manager.lock("held").await;
        drop(manager.lock("idle").await);
        assert_eq!(manager.lock_count(), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        // "held" is still referenced by its guard.
        assert_eq!(manager.sweep().1, 1);
        assert_eq!(manager.lock_count(), 1);
        drop(held);
    }
}
