//! The spoofed-certificate cache and the TTL-expiring lookaside caches.
//!
//! All of these are process-wide services under their own locks.  The
//! certificate cache additionally guarantees at-most-one concurrent
//! generation per origin fingerprint, which bounds CPU when a burst of new
//! SNIs arrives at once.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::OnceCell;
use tracing::debug;

//----------- SpoofedCert ------------------------------------------------------

/// A synthesized leaf bound to an origin certificate.
#[derive(Clone, Debug)]
pub struct SpoofedCert {
    /// The leaf certificate, PEM.
    pub cert_pem: String,

    /// The private key, PEM.
    pub key_pem: String,

    /// The common name the leaf was minted for.
    pub subject: String,
}

//----------- CertCache --------------------------------------------------------

/// Spoofed certificates keyed by origin-certificate fingerprint.
///
/// Bounded; least recently used entries are evicted once full.  Entries
/// whose generation is still in flight are never evicted.
#[derive(Debug)]
pub struct CertCache {
    inner: Mutex<CertCacheInner>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct CertCacheInner {
    map: foldhash::HashMap<String, Arc<OnceCell<Arc<SpoofedCert>>>>,
    order: VecDeque<String>,
}

impl CertCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CertCacheInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Fetch the spoofed pair for `fingerprint`, generating it at most once
    /// across all concurrent callers.
    ///
    /// Callers racing on the same fingerprint await the single in-flight
    /// generation and observe the same pair.  A failed generation leaves
    /// the slot empty so a later caller retries.
    pub async fn get_or_generate<F, Fut, E>(
        &self,
        fingerprint: &str,
        generate: F,
    ) -> Result<Arc<SpoofedCert>, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Arc<SpoofedCert>, E>>,
    {
        let slot = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(slot) = inner.map.get(fingerprint) {
                // Refresh recency.
                let slot = slot.clone();
                inner.order.retain(|k| k != fingerprint);
                inner.order.push_back(fingerprint.to_string());
                slot
            } else {
                let slot = Arc::new(OnceCell::new());
                inner
                    .map
                    .insert(fingerprint.to_string(), slot.clone());
                inner.order.push_back(fingerprint.to_string());

                // Evict the least recently used initialized entries.
                while inner.map.len() > self.capacity {
                    let Some(victim) = inner
                        .order
                        .iter()
                        .position(|k| {
                            inner
                                .map
                                .get(k)
                                .map(|s| s.initialized())
                                .unwrap_or(true)
                        })
                        .map(|i| inner.order.remove(i).unwrap())
                    else {
                        break;
                    };
                    debug!("cert cache: evicting '{victim}'");
                    inner.map.remove(&victim);
                }

                slot
            }
        };

        slot.get_or_try_init(generate).await.cloned()
    }

    /// A cached pair, if generation has completed.
    pub fn peek(&self, fingerprint: &str) -> Option<Arc<SpoofedCert>> {
        let inner = self.inner.lock().unwrap();
        inner.map.get(fingerprint).and_then(|s| s.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//----------- TtlCache ---------------------------------------------------------

/// A bounded map whose entries expire individually.
///
/// Upserts install a new expiry; lookups treat entries past their expiry as
/// absent and evict them lazily.  Backs the OCSP-result, CRL, override
/// whitelist and session-ticket caches.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    inner: Mutex<TtlCacheInner<K, V>>,
    capacity: usize,
}

#[derive(Debug)]
struct TtlCacheInner<K, V> {
    map: foldhash::HashMap<K, (V, Instant)>,
    order: VecDeque<K>,
}

impl<K, V> Default for TtlCacheInner<K, V> {
    fn default() -> Self {
        Self {
            map: Default::default(),
            order: Default::default(),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Default::default()),
            capacity: capacity.max(1),
        }
    }

    /// Insert or refresh an entry with a fresh expiry.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let expiry = Instant::now() + ttl;
        if inner.map.insert(key.clone(), (value, expiry)).is_none() {
            inner.order.push_back(key);
        }
        while inner.map.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.map.remove(&oldest);
        }
    }

    /// Fetch a non-expired entry.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        match inner.map.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() => Some(value.clone()),
            Some(_) => {
                inner.map.remove(key);
                inner.order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    /// Fetch a non-expired entry, pushing its expiry out by `ttl`.
    ///
    /// This is the idle-timeout flavor used by the certificate-check
    /// override whitelist.
    pub fn get_refresh(&self, key: &K, ttl: Duration) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        match inner.map.get_mut(key) {
            Some((value, expiry)) if *expiry > Instant::now() => {
                *expiry = Instant::now() + ttl;
                Some(value.clone())
            }
            Some(_) => {
                inner.map.remove(key);
                inner.order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        inner.order.retain(|k| k != key);
        inner.map.remove(key).map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair(subject: &str) -> Arc<SpoofedCert> {
        Arc::new(SpoofedCert {
            cert_pem: format!("cert of {subject}"),
            key_pem: "key".into(),
            subject: subject.into(),
        })
    }

    #[tokio::test]
    async fn generation_runs_at_most_once_per_fingerprint() {
        let cache = Arc::new(CertCache::new(16));
        let generations = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let generations = generations.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_generate("fp:1", || async move {
                        generations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, std::io::Error>(pair("example.com"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut subjects = Vec::new();
        for task in tasks {
            subjects.push(task.await.unwrap().subject.clone());
        }

        assert_eq!(generations.load(Ordering::SeqCst), 1);
        assert!(subjects.iter().all(|s| s == "example.com"));
    }

    #[tokio::test]
    async fn failed_generation_is_retried() {
        let cache = CertCache::new(16);

        let failed: Result<_, std::io::Error> = cache
            .get_or_generate("fp:2", || async {
                Err(std::io::Error::other("ca unavailable"))
            })
            .await;
        assert!(failed.is_err());

        let ok = cache
            .get_or_generate("fp:2", || async { Ok::<_, std::io::Error>(pair("x")) })
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn lru_eviction_keeps_recently_used() {
        let cache = CertCache::new(2);
        for fp in ["fp:a", "fp:b"] {
            cache
                .get_or_generate(fp, || async { Ok::<_, std::io::Error>(pair(fp)) })
                .await
                .unwrap();
        }
        // Touch fp:a so fp:b is the eviction victim.
        cache
            .get_or_generate("fp:a", || async { unreachable!() })
            .await
            .map_err(|_: std::io::Error| ())
            .unwrap();
        cache
            .get_or_generate("fp:c", || async { Ok::<_, std::io::Error>(pair("c")) })
            .await
            .unwrap();

        assert!(cache.peek("fp:a").is_some());
        assert!(cache.peek("fp:b").is_none());
        assert!(cache.peek("fp:c").is_some());
    }

    #[test]
    fn ttl_cache_expires_on_lookup() {
        let cache = TtlCache::new(8);
        cache.put("k", 1u32, Duration::from_millis(0));
        assert_eq!(cache.get(&"k"), None);
        assert_eq!(cache.len(), 0);

        cache.put("k", 2u32, Duration::from_secs(60));
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[test]
    fn ttl_cache_upsert_renews_expiry() {
        let cache = TtlCache::new(8);
        cache.put("k", 1u32, Duration::from_millis(0));
        cache.put("k", 1u32, Duration::from_secs(60));
        assert_eq!(cache.get(&"k"), Some(1));
    }

    #[test]
    fn ttl_cache_is_bounded() {
        let cache = TtlCache::new(2);
        cache.put("a", 1u32, Duration::from_secs(60));
        cache.put("b", 2u32, Duration::from_secs(60));
        cache.put("c", 3u32, Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"c"), Some(3));
    }
}
