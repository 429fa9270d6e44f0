//! Domain name resolution with a TTL-bounded host cache.
//!
//! SOCKS5 requests that carry a domain name (ATYP 3) are resolved here
//! before the outbound connection is made. Results are cached per domain
//! so repeated requests within the TTL window cost one system lookup.
//!
//! # Cache policy
//!
//! - Lookup checks the cache first; a non-expired entry is returned
//!   immediately and counted as a hit.
//! - On miss, the system resolver runs (`tokio::net::lookup_host`) and the
//!   first IPv4 result is cached with `expiry = now + TTL`. A failed lookup
//!   caches nothing.
//! - Entries past their expiry are treated as absent on read; a removal
//!   task scheduled at insert time additionally drops them from the map
//!   once the TTL elapses, so the map does not grow with dead entries.
//! - Concurrent first requests for the same domain may each perform a
//!   lookup; the last insert wins. There is deliberately no request
//!   de-duplication.

use crate::{ProxyError, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// A cached resolution for one domain.
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    addr: Ipv4Addr,
    expires_at: Instant,
}

/// Cache of resolved host names.
///
/// Maps a domain name to its IPv4 address with an expiry timestamp.
/// Shared across all connection tasks; reads and writes may happen from
/// any of them concurrently.
pub struct HostCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl HostCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite the entry for a domain.
    pub fn insert(&self, domain: &str, addr: Ipv4Addr, expires_at: Instant) {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(domain.to_string(), CacheEntry { addr, expires_at });
    }

    /// Look up a domain. Entries past their expiry are treated as absent.
    pub fn lookup(&self, domain: &str) -> Option<Ipv4Addr> {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(domain).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.addr)
            } else {
                None
            }
        })
    }

    /// Remove the entry for a domain if (and only if) it has expired.
    ///
    /// Returns `true` if an entry was removed. An entry that was refreshed
    /// by a later resolution is left in place.
    pub fn remove_expired(&self, domain: &str) -> bool {
        let now = Instant::now();
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get(domain) {
            Some(entry) if entry.expires_at <= now => {
                entries.remove(domain);
                true
            }
            _ => false,
        }
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Returns the number of entries in the cache.
    pub fn len(&self) -> usize {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for HostCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Hit/miss counters for the host cache.
///
/// Purely diagnostic: surfaced in logs and tests, never consulted for
/// correctness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of lookups served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of lookups that went to the system resolver.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Domain resolver with TTL caching.
pub struct Resolver {
    /// Shared with scheduled eviction tasks.
    cache: Arc<HostCache>,

    /// Hit/miss counters.
    stats: CacheStats,

    /// How long a resolved address stays valid.
    ttl: Duration,
}

impl Resolver {
    /// Create a resolver whose cache entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(HostCache::new()),
            stats: CacheStats::default(),
            ttl,
        }
    }

    /// Resolve a domain name to an IPv4 address, consulting the cache first.
    ///
    /// # Errors
    /// * `ProxyError::DnsResolution` - The system lookup failed or returned
    ///   no IPv4 address. Nothing is cached in that case.
    pub async fn resolve(&self, domain: &str) -> Result<Ipv4Addr> {
        if let Some(addr) = self.cache.lookup(domain) {
            self.stats.hit();
            debug!(domain = %domain, addr = %addr, "host cache hit");
            return Ok(addr);
        }

        self.stats.miss();
        let addr = self.lookup(domain).await?;

        let expires_at = Instant::now() + self.ttl;
        self.cache.insert(domain, addr, expires_at);
        debug!(
            domain = %domain,
            addr = %addr,
            cache_len = self.cache.len(),
            "resolved and cached host"
        );
        self.schedule_eviction(domain.to_string(), expires_at);

        Ok(addr)
    }

    /// Access the underlying cache.
    pub fn cache(&self) -> &HostCache {
        &self.cache
    }

    /// Access the hit/miss counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Run the system resolver and pick the first IPv4 result.
    async fn lookup(&self, domain: &str) -> Result<Ipv4Addr> {
        let addrs = tokio::net::lookup_host((domain, 0u16))
            .await
            .map_err(|e| ProxyError::DnsResolution {
                domain: domain.to_string(),
                source: e,
            })?;

        addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| ProxyError::DnsResolution {
                domain: domain.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no IPv4 address for host",
                ),
            })
    }

    /// Spawn a task that drops the entry once its TTL elapses.
    ///
    /// The removal re-checks the expiry, so an entry refreshed by a later
    /// resolution survives the earlier deadline.
    fn schedule_eviction(&self, domain: String, expires_at: Instant) {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(expires_at)).await;
            if cache.remove_expired(&domain) {
                debug!(domain = %domain, "evicted expired host cache entry");
            }
        });
    }
}
