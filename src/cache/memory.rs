//! In-process cache store

use super::{CacheStore, ImageCacheEntry, Lease};
use crate::error::UvImageResult;
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Cache store that lives as long as the process
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<Fingerprint, ImageCacheEntry>>,
    /// Lease owner id and expiry per fingerprint
    leases: Arc<Mutex<HashMap<Fingerprint, (u64, Instant)>>>,
    next_owner: Mutex<u64>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lock a map; every critical section is a single insert or remove, so a
/// poisoned lock still guards consistent data
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, fingerprint: &Fingerprint) -> UvImageResult<Option<ImageCacheEntry>> {
        Ok(lock(&self.entries).get(fingerprint).cloned())
    }

    async fn put(&self, entry: &ImageCacheEntry) -> UvImageResult<()> {
        lock(&self.entries).insert(entry.fingerprint.clone(), entry.clone());
        Ok(())
    }

    async fn acquire_lease(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> UvImageResult<Option<Lease>> {
        let now = Instant::now();
        let owner = {
            let mut next = lock(&self.next_owner);
            *next += 1;
            *next
        };

        {
            let mut leases = lock(&self.leases);
            if let Some((_, expires)) = leases.get(fingerprint) {
                if *expires > now {
                    return Ok(None);
                }
            }
            leases.insert(fingerprint.clone(), (owner, now + ttl));
        }

        let leases = Arc::clone(&self.leases);
        let renewed = Arc::clone(&self.leases);
        let fingerprint = fingerprint.clone();
        let renew_fingerprint = fingerprint.clone();
        let lease = Lease::new(move || {
            let mut leases = lock(&leases);
            // A taken-over lease belongs to someone else now
            if leases.get(&fingerprint).is_some_and(|(o, _)| *o == owner) {
                leases.remove(&fingerprint);
            }
        })
        .with_renew(move |ttl| {
            let mut leases = lock(&renewed);
            match leases.get_mut(&renew_fingerprint) {
                Some((o, expires)) if *o == owner => {
                    *expires = Instant::now() + ttl;
                    true
                }
                _ => false,
            }
        });
        Ok(Some(lease))
    }

    async fn list(&self) -> UvImageResult<Vec<ImageCacheEntry>> {
        let mut entries: Vec<ImageCacheEntry> = lock(&self.entries).values().cloned().collect();
        entries.sort_by(|a, b| a.built_at.cmp(&b.built_at));
        Ok(entries)
    }

    fn store_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ImageReference;
    use chrono::Utc;

    fn fp(c: char) -> Fingerprint {
        Fingerprint::from_hex(c.to_string().repeat(64)).unwrap()
    }

    fn entry(fingerprint: Fingerprint) -> ImageCacheEntry {
        ImageCacheEntry {
            image: ImageReference::for_fingerprint("img", &fingerprint),
            fingerprint,
            built_at: Utc::now(),
            resolver_version: "uv 0.5.0".to_string(),
            builder_version: "docker 27.0.1".to_string(),
            platform: Default::default(),
        }
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryCacheStore::new();
        assert!(store.get(&fp('a')).await.unwrap().is_none());

        store.put(&entry(fp('a'))).await.unwrap();
        let found = store.get(&fp('a')).await.unwrap().unwrap();
        assert_eq!(found.fingerprint, fp('a'));
        assert!(store.get(&fp('b')).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_dropped() {
        let store = MemoryCacheStore::new();
        let ttl = Duration::from_secs(60);

        let lease = store.acquire_lease(&fp('a'), ttl).await.unwrap();
        assert!(lease.is_some());
        assert!(store.acquire_lease(&fp('a'), ttl).await.unwrap().is_none());
        // Other fingerprints are independent
        assert!(store.acquire_lease(&fp('b'), ttl).await.unwrap().is_some());

        drop(lease);
        assert!(store.acquire_lease(&fp('a'), ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = MemoryCacheStore::new();
        let stale = store
            .acquire_lease(&fp('a'), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let fresh = store
            .acquire_lease(&fp('a'), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(fresh.is_some());

        // Releasing the stale lease must not free the new owner's lease
        drop(stale);
        assert!(store
            .acquire_lease(&fp('a'), Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn renewed_lease_outlives_its_first_ttl() {
        let store = MemoryCacheStore::new();
        let short = Duration::from_millis(30);
        let lease = store.acquire_lease(&fp('a'), short).await.unwrap().unwrap();

        assert!(lease.renew(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.acquire_lease(&fp('a'), short).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn taken_over_lease_cannot_be_renewed() {
        let store = MemoryCacheStore::new();
        let stale = store
            .acquire_lease(&fp('a'), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let _fresh = store
            .acquire_lease(&fp('a'), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(!stale.renew(Duration::from_secs(60)));
    }
}
