//! The DNS cache and the observed-subdomain tree.
//!
//! Both are process-wide services owned by the center and guarded by their
//! own lock.  Callers that read an entry and may then overwrite it perform
//! the whole read/compute/write region under one lock acquisition, which is
//! why the mutating helpers live here rather than on the entry types.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;

use crate::dns::{split_fqdn_subdomain, unix_now, DnsResponse};

/// Default lifetime of an observed-subdomain entry.
pub const SUBDOMAIN_TTL: u64 = 28_000;

//----------- DnsCache ---------------------------------------------------------

/// The global answer cache, keyed `"<RTYPE>:<QNAME>"`.
///
/// Insertion overwrites; TTL is enforced on lookup and expired entries are
/// evicted lazily.  The cache is bounded and evicts in insertion order once
/// full.
#[derive(Debug)]
pub struct DnsCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: foldhash::HashMap<String, Arc<DnsResponse>>,
    order: VecDeque<String>,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Store a parsed response under its question key.
    ///
    /// Responses without a question are ignored.
    pub fn store(&self, response: DnsResponse) {
        let Some(key) = response.cache_key() else {
            return;
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.map.insert(key.clone(), Arc::new(response)).is_none() {
            inner.order.push_back(key);
        }
        while inner.map.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.map.remove(&oldest);
        }
    }

    /// Look up a fresh entry; expired entries are removed and reported as
    /// absent.
    pub fn lookup(&self, key: &str) -> Option<Arc<DnsResponse>> {
        self.lookup_at(key, unix_now())
    }

    fn lookup_at(&self, key: &str, now: u64) -> Option<Arc<DnsResponse>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.map.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.clone()),
            Some(_) => {
                debug!("dns cache: entry '{key}' expired");
                inner.map.remove(key);
                inner.order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    /// Whether a fresh cached answer for `fqdn` of the probed address
    /// family equals `ip`.
    ///
    /// Any one matching answer is sufficient.
    pub fn fqdn_matches(&self, fqdn: &str, ip: IpAddr) -> bool {
        let key = if ip.is_ipv6() {
            format!("AAAA:{fqdn}")
        } else {
            format!("A:{fqdn}")
        };
        self.lookup(&key)
            .map(|entry| entry.answers.iter().any(|a| a.ip == ip))
            .unwrap_or(false)
    }

    /// All fresh addresses of the requested family for `fqdn`.
    pub fn resolved(&self, fqdn: &str, want_v6: bool) -> Vec<IpAddr> {
        let key = if want_v6 {
            format!("AAAA:{fqdn}")
        } else {
            format!("A:{fqdn}")
        };
        self.lookup(&key)
            .map(|entry| entry.addresses(want_v6))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.order.clear();
    }
}

//----------- DomainTree -------------------------------------------------------

/// Observed subdomains per two-label parent domain.
///
/// When an address answer for `a.b.example.com` is stored, the tree records
/// that `a.b` exists under `example.com`.  The TLS bypass path expands an
/// SNI bypass entry into its observed subdomains for reverse matching
/// against a destination address.
#[derive(Debug)]
pub struct DomainTree {
    inner: Mutex<foldhash::HashMap<String, foldhash::HashMap<String, u64>>>,
    sub_ttl: u64,
}

impl DomainTree {
    pub fn new(sub_ttl: u64) -> Self {
        Self {
            inner: Mutex::new(Default::default()),
            sub_ttl,
        }
    }

    /// Record the subdomain part of `fqdn`, refreshing its expiry.
    pub fn record(&self, fqdn: &str) {
        let Some((parent, sub)) = split_fqdn_subdomain(fqdn) else {
            return;
        };
        let expires_at = unix_now() + self.sub_ttl;
        let mut inner = self.inner.lock().unwrap();
        inner.entry(parent).or_default().insert(sub, expires_at);
    }

    /// Non-expired subdomain labels recorded under `parent`.
    pub fn subdomains(&self, parent: &str) -> Vec<String> {
        let now = unix_now();
        let mut inner = self.inner.lock().unwrap();
        let Some(subs) = inner.get_mut(parent) else {
            return Vec::new();
        };
        subs.retain(|_, expires_at| *expires_at > now);
        subs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DomainTree {
    fn default() -> Self {
        Self::new(SUBDOMAIN_TTL)
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::a_response;

    fn cached(name: &str, ips: &[(&str, u32)], age: u64) -> DnsResponse {
        let raw = a_response(1, name, ips);
        let mut resp = DnsResponse::parse(&raw).unwrap();
        resp.loaded_at = unix_now() - age;
        resp
    }

    #[test]
    fn lookup_returns_fresh_entries() {
        let cache = DnsCache::new(16);
        cache.store(cached("foo.test.", &[("1.2.3.4", 300)], 100));

        let entry = cache.lookup("A:foo.test").unwrap();
        assert_eq!(entry.answers[0].ip, "1.2.3.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn expired_entries_are_absent_and_evicted() {
        let cache = DnsCache::new(16);
        cache.store(cached("foo.test.", &[("1.2.3.4", 300)], 301));

        assert!(cache.lookup("A:foo.test").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn insertion_overwrites() {
        let cache = DnsCache::new(16);
        cache.store(cached("foo.test.", &[("1.2.3.4", 300)], 0));
        cache.store(cached("foo.test.", &[("5.6.7.8", 300)], 0));

        assert_eq!(cache.len(), 1);
        let entry = cache.lookup("A:foo.test").unwrap();
        assert_eq!(entry.answers[0].ip, "5.6.7.8".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn capacity_is_enforced_in_insertion_order() {
        let cache = DnsCache::new(2);
        cache.store(cached("a.test.", &[("1.0.0.1", 300)], 0));
        cache.store(cached("b.test.", &[("1.0.0.2", 300)], 0));
        cache.store(cached("c.test.", &[("1.0.0.3", 300)], 0));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("A:a.test").is_none());
        assert!(cache.lookup("A:c.test").is_some());
    }

    #[test]
    fn fqdn_match_requires_family_and_address() {
        let cache = DnsCache::new(16);
        cache.store(cached("foo.test.", &[("1.2.3.4", 300)], 0));

        assert!(cache.fqdn_matches("foo.test", "1.2.3.4".parse().unwrap()));
        assert!(!cache.fqdn_matches("foo.test", "4.3.2.1".parse().unwrap()));
        assert!(!cache.fqdn_matches("foo.test", "2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn domain_tree_records_and_expires() {
        let tree = DomainTree::new(1_000);
        tree.record("www.example.com");
        tree.record("ecom.example.com");
        tree.record("example.com"); // no subdomain part, ignored

        let mut subs = tree.subdomains("example.com");
        subs.sort();
        assert_eq!(subs, ["ecom", "www"]);
        assert!(tree.subdomains("other.com").is_empty());

        let expired = DomainTree::new(0);
        expired.record("www.example.com");
        assert!(expired.subdomains("example.com").is_empty());
    }
}
