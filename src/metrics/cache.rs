use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{MetricsError, MetricsProvider, Usage};

/* ============================= ENTRIES ============================= */

#[derive(Debug, Clone)]
struct CacheEntry {
    usage: Usage,
    stored_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/* ============================= CACHE ============================= */

/// TTL cache in front of a metrics provider, keyed by `"ns/pod"`.
///
/// Hits are served while younger than `ttl`; fetch errors are never cached;
/// a background sweep evicts anything older than `2·ttl`. Safe under
/// concurrent readers and a single mutator.
pub struct CachedMetricsProvider {
    upstream: Arc<dyn MetricsProvider>,
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    counters: Arc<Mutex<(u64, u64)>>,
    ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CachedMetricsProvider {
    pub fn new(upstream: Arc<dyn MetricsProvider>, ttl: Duration) -> Self {
        let entries: Arc<Mutex<HashMap<String, CacheEntry>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let sweep_entries = entries.clone();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(ttl);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let hard_limit = ttl * 2;
                let mut map = sweep_entries.lock().expect("cache lock poisoned");
                let before = map.len();
                map.retain(|_, entry| entry.stored_at.elapsed() <= hard_limit);
                let evicted = before - map.len();
                if evicted > 0 {
                    debug!(evicted, "metrics_cache_swept");
                }
            }
        });

        Self {
            upstream,
            entries,
            counters: Arc::new(Mutex::new((0, 0))),
            ttl,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    fn key(namespace: &str, pod: &str) -> String {
        format!("{namespace}/{pod}")
    }

    pub fn invalidate(&self, namespace: &str, pod: &str) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .remove(&Self::key(namespace, pod));
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("cache lock poisoned").len();
        let (hits, misses) = *self.counters.lock().expect("cache lock poisoned");
        CacheStats {
            entries,
            hits,
            misses,
        }
    }

    /// Stop the background sweep. Entries stay readable.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().expect("cache lock poisoned").take() {
            handle.abort();
        }
    }

    fn lookup(&self, key: &str) -> Option<Usage> {
        let map = self.entries.lock().expect("cache lock poisoned");
        map.get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.usage)
    }

    fn store(&self, key: String, usage: Usage) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .insert(key, CacheEntry {
                usage,
                stored_at: Instant::now(),
            });
    }
}

impl Drop for CachedMetricsProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl MetricsProvider for CachedMetricsProvider {
    fn name(&self) -> &'static str {
        self.upstream.name()
    }

    async fn fetch_pod_usage(&self, namespace: &str, pod: &str) -> Result<Usage, MetricsError> {
        let key = Self::key(namespace, pod);

        if let Some(usage) = self.lookup(&key) {
            self.counters.lock().expect("cache lock poisoned").0 += 1;
            return Ok(usage);
        }
        self.counters.lock().expect("cache lock poisoned").1 += 1;

        let usage = self.upstream.fetch_pod_usage(namespace, pod).await?;
        self.store(key, usage);
        Ok(usage)
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Scripted upstream: counts calls, optionally fails.
    struct FakeProvider {
        calls: AtomicU64,
        fail: std::sync::Mutex<bool>,
    }

    impl FakeProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                fail: std::sync::Mutex::new(false),
            })
        }

        fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetricsProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn fetch_pod_usage(
            &self,
            _namespace: &str,
            _pod: &str,
        ) -> Result<Usage, MetricsError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock().unwrap() {
                return Err(MetricsError::Unavailable("scripted failure".into()));
            }
            Ok(Usage::new(100.0 + n as f64, 128.0))
        }
    }

    #[tokio::test]
    async fn test_hit_within_ttl_returns_cached() {
        let upstream = FakeProvider::new();
        let cache = CachedMetricsProvider::new(upstream.clone(), Duration::from_secs(30));

        let first = cache.fetch_pod_usage("app", "web-1").await.unwrap();
        let second = cache.fetch_pod_usage("app", "web-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let upstream = FakeProvider::new();
        let cache = CachedMetricsProvider::new(upstream.clone(), Duration::from_millis(20));

        let first = cache.fetch_pod_usage("app", "web-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = cache.fetch_pod_usage("app", "web-1").await.unwrap();

        assert_ne!(first.cpu_milli, second.cpu_milli);
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let upstream = FakeProvider::new();
        let cache = CachedMetricsProvider::new(upstream.clone(), Duration::from_secs(30));

        upstream.set_fail(true);
        assert!(cache.fetch_pod_usage("app", "web-1").await.is_err());
        assert_eq!(cache.stats().entries, 0);

        upstream.set_fail(false);
        assert!(cache.fetch_pod_usage("app", "web-1").await.is_ok());
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_keys_are_per_pod() {
        let upstream = FakeProvider::new();
        let cache = CachedMetricsProvider::new(upstream.clone(), Duration::from_secs(30));

        cache.fetch_pod_usage("app", "web-1").await.unwrap();
        cache.fetch_pod_usage("app", "web-2").await.unwrap();
        cache.fetch_pod_usage("other", "web-1").await.unwrap();

        assert_eq!(upstream.calls(), 3);
        assert_eq!(cache.stats().entries, 3);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let upstream = FakeProvider::new();
        let cache = CachedMetricsProvider::new(upstream.clone(), Duration::from_secs(30));

        cache.fetch_pod_usage("app", "web-1").await.unwrap();
        cache.invalidate("app", "web-1");
        cache.fetch_pod_usage("app", "web-1").await.unwrap();

        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_empties_cache() {
        let upstream = FakeProvider::new();
        let cache = CachedMetricsProvider::new(upstream.clone(), Duration::from_secs(30));

        cache.fetch_pod_usage("app", "web-1").await.unwrap();
        cache.fetch_pod_usage("app", "web-2").await.unwrap();
        cache.clear();

        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_background_sweep_hard_evicts() {
        let upstream = FakeProvider::new();
        let cache = CachedMetricsProvider::new(upstream.clone(), Duration::from_millis(20));

        cache.fetch_pod_usage("app", "web-1").await.unwrap();
        assert_eq!(cache.stats().entries, 1);

        // Past 2·ttl plus a sweep tick, the entry must be gone.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_stats_count_hits_and_misses() {
        let upstream = FakeProvider::new();
        let cache = CachedMetricsProvider::new(upstream, Duration::from_secs(30));

        cache.fetch_pod_usage("app", "web-1").await.unwrap();
        cache.fetch_pod_usage("app", "web-1").await.unwrap();
        cache.fetch_pod_usage("app", "web-1").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn test_name_passes_through() {
        let cache = CachedMetricsProvider::new(FakeProvider::new(), Duration::from_secs(30));
        assert_eq!(cache.name(), "fake");
    }
}
