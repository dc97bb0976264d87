//! Exchanged token cache with expiry-aware invalidation.
//!
//! Entries are keyed by (subject, resource) and treated as expired
//! `refresh_before_expiry_seconds` ahead of the provider's expiry. Each key
//! owns an async lock, so concurrent requests for the same caller and resource
//! wait for a single exchange instead of each starting their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use super::obo::ExchangedToken;
use crate::error::ExchangeError;

type Slot = Arc<tokio::sync::Mutex<Option<ExchangedToken>>>;

/// Cache key: who the token was exchanged for, and for which resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub subject: String,
    pub resource: String,
}

impl CacheKey {
    pub fn new(subject: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            resource: resource.into(),
        }
    }
}

/// Cache of exchanged tokens, shared across requests.
pub struct TokenCache {
    entries: Mutex<HashMap<CacheKey, Slot>>,
    refresh_margin: Duration,
}

impl TokenCache {
    /// Create a cache that drops tokens `refresh_before_expiry_seconds` early.
    pub fn new(refresh_before_expiry_seconds: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            refresh_margin: Duration::seconds(refresh_before_expiry_seconds as i64),
        }
    }

    fn slot(&self, key: &CacheKey) -> Slot {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(entries.entry(key.clone()).or_default())
    }

    /// Return the cached token for `key`, or run `exchange` and cache its result.
    ///
    /// Only one exchange per key runs at a time. Failed exchanges are not cached,
    /// and if the running exchange is dropped the next waiter performs its own.
    pub async fn get_or_exchange<F, Fut>(
        &self,
        key: CacheKey,
        exchange: F,
    ) -> Result<ExchangedToken, ExchangeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExchangedToken, ExchangeError>>,
    {
        let slot = self.slot(&key);
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref() {
            if !token.is_expired_at(Utc::now(), self.refresh_margin) {
                debug!(resource = %key.resource, "Exchanged token cache hit");
                return Ok(token.clone());
            }
        }

        let token = exchange().await?;
        *cached = if token.is_expired_at(Utc::now(), self.refresh_margin) {
            None
        } else {
            Some(token.clone())
        };

        Ok(token)
    }

    /// Drop the cached token for `key`.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Remove expired and empty entries. Entries with an exchange in flight are kept.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();

        entries.retain(|_, slot| match slot.try_lock() {
            Ok(cached) => cached
                .as_ref()
                .is_some_and(|t| !t.is_expired_at(now, self.refresh_margin)),
            Err(_) => true,
        });

        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically purge expired entries from `cache`.
pub fn spawn_purge_task(cache: Arc<TokenCache>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            interval.tick().await;
            let removed = cache.purge_expired();
            if removed > 0 {
                debug!(removed, remaining = cache.len(), "Purged expired tokens");
            }
        }
    })
}

// Caching is an addition over one-exchange-per-call; these tests cover that
// added behavior only.
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn token(name: &str, lifetime_secs: i64) -> ExchangedToken {
        ExchangedToken::new(name, "Bearer", Utc::now() + Duration::seconds(lifetime_secs))
    }

    fn key() -> CacheKey {
        CacheKey::new("oid-alice", "https://graph.microsoft.com")
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_second_exchange() {
        let cache = TokenCache::new(300);
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let result = cache
                .get_or_exchange(key(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(token("G1", 3600))
                })
                .await
                .unwrap();
            assert_eq!(result.authorization_value(), "Bearer G1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_inside_refresh_margin_is_exchanged_again() {
        let cache = TokenCache::new(300);
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            cache
                .get_or_exchange(key(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // Expires within the margin, never served from cache
                    Ok(token("short", 120))
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let cache = TokenCache::new(300);
        let calls = AtomicU32::new(0);

        for subject in ["oid-alice", "oid-bob"] {
            cache
                .get_or_exchange(CacheKey::new(subject, "https://graph.microsoft.com"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(token(subject, 3600))
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = TokenCache::new(300);

        let failed = cache
            .get_or_exchange(key(), || async {
                Err(ExchangeError::AssertionRejected {
                    error: "invalid_grant".into(),
                    description: None,
                })
            })
            .await;
        assert!(failed.is_err());

        let ok = cache
            .get_or_exchange(key(), || async { Ok(token("G2", 3600)) })
            .await
            .unwrap();
        assert_eq!(ok.access_token(), "G2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_exchange() {
        let cache = Arc::new(TokenCache::new(300));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_exchange(key(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        time::sleep(std::time::Duration::from_millis(50)).await;
                        Ok(token("G1", 3600))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().access_token(), "G1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_exchange_releases_key() {
        let cache = TokenCache::new(300);

        let cancelled = time::timeout(
            std::time::Duration::from_millis(10),
            cache.get_or_exchange(key(), || async {
                time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(token("never", 3600))
            }),
        )
        .await;
        assert!(cancelled.is_err());

        let next = cache
            .get_or_exchange(key(), || async { Ok(token("G3", 3600)) })
            .await
            .unwrap();
        assert_eq!(next.access_token(), "G3");
    }

    #[tokio::test]
    async fn test_invalidate_and_purge() {
        let cache = TokenCache::new(300);
        cache
            .get_or_exchange(key(), || async { Ok(token("G1", 3600)) })
            .await
            .unwrap();
        cache
            .get_or_exchange(CacheKey::new("oid-bob", "r"), || async { Ok(token("short", 60)) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        // bob's slot holds nothing usable
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);

        cache.invalidate(&key());
        assert!(cache.is_empty());
    }
}
