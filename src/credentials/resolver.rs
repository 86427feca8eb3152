//! Deadline-aware credential cache, sitting in front of the configured
//! `CredentialStore`s.
//!
//! Bounded at 200 entries (§4.1): eviction picks the entry with the earliest
//! `expires_at` (entries with no expiry are treated as farthest-future and
//! evicted last). A background sweep removes expired entries every
//! `sweep_interval` (default 5 minutes).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{Credential, CredentialRef, CredentialStore};
use crate::error::CredentialError;

const DEFAULT_MAX_ENTRIES: usize = 200;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub max_entries: usize,
    pub sweep_interval: Duration,
    /// The configured `credentialResolutionTimeoutMs` (§4.1): the caller is
    /// expected to min this against `ctx.remaining()` before calling
    /// `resolve()`, via `CredentialResolver::resolution_timeout()`.
    pub resolution_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            resolution_timeout: DEFAULT_RESOLUTION_TIMEOUT,
        }
    }
}

struct CacheEntry {
    credential: Credential,
    expires_at: Option<SystemTime>,
    cached_at: Instant,
}

/// Resolves credential references through a registered store, caching the
/// result until its TTL (or the store's default TTL) lapses.
pub struct CredentialResolver {
    stores: HashMap<CredentialRef, Arc<dyn CredentialStore>>,
    cache: RwLock<HashMap<CredentialRef, CacheEntry>>,
    config: ResolverConfig,
}

impl CredentialResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            stores: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn register(&mut self, reference: CredentialRef, store: Arc<dyn CredentialStore>) {
        self.stores.insert(reference, store);
    }

    /// The configured `credentialResolutionTimeoutMs` (§4.1). Callers min
    /// this against `ctx.remaining()` before passing the result as `resolve`'s
    /// `budget`, so resolution is bounded by `min(credentialResolutionTimeoutMs,
    /// ctx.remaining)` rather than the context deadline alone.
    pub fn resolution_timeout(&self) -> Duration {
        self.config.resolution_timeout
    }

    /// Resolve a reference, honoring the caller's remaining deadline (§4.5):
    /// a resolution that would outlive `budget` must fail with
    /// `CredentialError::Timeout` rather than race the caller's own timeout.
    pub async fn resolve(
        &self,
        reference: &CredentialRef,
        budget: Duration,
    ) -> Result<Credential, CredentialError> {
        if let Some(cached) = self.cached(reference).await {
            return Ok(cached);
        }

        let store = self
            .stores
            .get(reference)
            .ok_or_else(|| CredentialError::NotFound(reference.to_string()))?;

        let fetch = store.fetch(reference);
        let resolved = match tokio::time::timeout(budget, fetch).await {
            Ok(result) => result?,
            Err(_) => return Err(CredentialError::Timeout(reference.to_string())),
        };

        let expires_at = resolved
            .expires_at()
            .or_else(|| Some(SystemTime::now() + store.default_ttl()));
        self.insert(reference.clone(), resolved.clone(), expires_at).await;
        Ok(resolved)
    }

    /// Resolve many references concurrently, for pool warm-up at startup.
    pub async fn prewarm(&self, references: &[CredentialRef], budget: Duration) {
        let mut futures = Vec::with_capacity(references.len());
        for reference in references {
            futures.push(async move {
                if let Err(e) = self.resolve(reference, budget).await {
                    warn!(reference = %reference, error = %e, "pre-warm credential resolution failed");
                }
            });
        }
        futures::future::join_all(futures).await;
    }

    async fn cached(&self, reference: &CredentialRef) -> Option<Credential> {
        let cache = self.cache.read().await;
        let entry = cache.get(reference)?;
        let now = SystemTime::now();
        if entry.credential.is_expired(now) {
            return None;
        }
        if let Some(expires_at) = entry.expires_at {
            if expires_at < now {
                return None;
            }
        }
        Some(entry.credential.clone())
    }

    async fn insert(&self, reference: CredentialRef, credential: Credential, expires_at: Option<SystemTime>) {
        let mut cache = self.cache.write().await;
        if cache.len() >= self.config.max_entries && !cache.contains_key(&reference) {
            self.evict_oldest(&mut cache);
        }
        cache.insert(
            reference,
            CacheEntry {
                credential,
                expires_at,
                cached_at: Instant::now(),
            },
        );
    }

    /// Evict the entry with the earliest `expires_at`; entries with no
    /// expiry are never the eviction target unless every entry lacks one, in
    /// which case the oldest by insertion time goes.
    fn evict_oldest(&self, cache: &mut HashMap<CredentialRef, CacheEntry>) {
        let victim = cache
            .iter()
            .min_by_key(|(_, entry)| {
                entry
                    .expires_at
                    .map(|t| t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default())
                    .unwrap_or(Duration::MAX)
            })
            .map(|(reference, _)| reference.clone());
        if let Some(victim) = victim {
            debug!(reference = %victim, "evicting credential cache entry to stay within bound");
            cache.remove(&victim);
        }
    }

    /// Remove every cache entry past its expiry. Intended to run on
    /// `config.sweep_interval` from a background task owned by the gateway.
    pub async fn sweep_expired(&self) {
        let now = SystemTime::now();
        let mut cache = self.cache.write().await;
        cache.retain(|_, entry| entry.expires_at.is_none_or(|exp| exp >= now));
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Spawn the periodic sweep task. The returned handle is owned by the
    /// caller (typically the gateway's top-level supervisor).
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep_expired().await;
            }
        })
    }

    #[cfg(test)]
    async fn cached_at(&self, reference: &CredentialRef) -> Option<Instant> {
        self.cache.read().await.get(reference).map(|e| e.cached_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        calls: AtomicUsize,
        expires_in: Option<Duration>,
    }

    #[async_trait]
    impl CredentialStore for CountingStore {
        async fn fetch(&self, _reference: &CredentialRef) -> Result<Credential, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::Simple {
                api_key: "secret".to_string(),
                expires_at: self.expires_in.map(|d| SystemTime::now() + d),
            })
        }

        fn validate(&self) -> Result<(), CredentialError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cache_hides_repeat_fetches() {
        let mut resolver = CredentialResolver::new(ResolverConfig::default());
        let store = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
            expires_in: None,
        });
        let reference: CredentialRef = "primary".into();
        resolver.register(reference.clone(), store.clone());

        resolver.resolve(&reference, Duration::from_secs(1)).await.unwrap();
        resolver.resolve(&reference, Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let mut resolver = CredentialResolver::new(ResolverConfig::default());
        let store = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
            expires_in: Some(Duration::from_millis(5)),
        });
        let reference: CredentialRef = "primary".into();
        resolver.register(reference.clone(), store.clone());

        resolver.resolve(&reference, Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.resolve(&reference, Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_reference_is_not_found() {
        let resolver = CredentialResolver::new(ResolverConfig::default());
        let err = resolver
            .resolve(&"missing".into(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, CredentialError::NotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn eviction_keeps_cache_within_bound() {
        let mut resolver = CredentialResolver::new(ResolverConfig {
            max_entries: 2,
            sweep_interval: Duration::from_secs(300),
            ..Default::default()
        });
        for i in 0..3 {
            let store = Arc::new(CountingStore {
                calls: AtomicUsize::new(0),
                expires_in: Some(Duration::from_secs(60 + i)),
            });
            let reference: CredentialRef = format!("ref-{i}").into();
            resolver.register(reference.clone(), store);
            resolver.resolve(&reference, Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(resolver.cache_len().await, 2);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let mut resolver = CredentialResolver::new(ResolverConfig::default());
        let short = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
            expires_in: Some(Duration::from_millis(5)),
        });
        let long = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
            expires_in: Some(Duration::from_secs(60)),
        });
        resolver.register("short".into(), short);
        resolver.register("long".into(), long);
        resolver.resolve(&"short".into(), Duration::from_secs(1)).await.unwrap();
        resolver.resolve(&"long".into(), Duration::from_secs(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.sweep_expired().await;

        assert_eq!(resolver.cache_len().await, 1);
    }

    #[tokio::test]
    async fn resolution_respects_caller_budget() {
        struct SlowStore;
        #[async_trait]
        impl CredentialStore for SlowStore {
            async fn fetch(&self, _reference: &CredentialRef) -> Result<Credential, CredentialError> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Credential::Simple {
                    api_key: "x".to_string(),
                    expires_at: None,
                })
            }
            fn validate(&self) -> Result<(), CredentialError> {
                Ok(())
            }
        }

        let mut resolver = CredentialResolver::new(ResolverConfig::default());
        resolver.register("slow".into(), Arc::new(SlowStore));
        let err = resolver
            .resolve(&"slow".into(), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert_eq!(err, CredentialError::Timeout("slow".to_string()));
    }
}
