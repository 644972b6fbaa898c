//! Conditional response cache and request coalescing.
//!
//! Entries are keyed by [`RequestSignature`] and spread over independently
//! locked shards. An entry is never mutated in place: a store or a 304
//! revalidation swaps in a new `Arc<CacheEntry>`, so readers always see a
//! complete entry.
//!
//! Freshness (TTL) and validation (ETag) are independent. A fresh entry is
//! served without a request; a stale entry with an ETag is revalidated with
//! `If-None-Match` and, on 304, kept byte-for-byte.

mod coalesce;
mod signature;

pub use coalesce::{Coalesced, RequestCoalescer};
pub use signature::RequestSignature;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::observability::{Telemetry, TelemetryEvent};

/// A cached response.
#[derive(Debug)]
pub struct CacheEntry {
    etag: Option<String>,
    last_modified: Option<String>,
    link: Option<String>,
    status: u16,
    body: Bytes,
    stored_at: Instant,
    stored_at_utc: DateTime<Utc>,
    ttl: Duration,
    hit_count: AtomicU64,
}

impl CacheEntry {
    /// Creates an entry stored now.
    pub fn new(status: u16, body: Bytes, etag: Option<String>, ttl: Duration) -> Self {
        Self {
            etag,
            last_modified: None,
            link: None,
            status,
            body,
            stored_at: Instant::now(),
            stored_at_utc: Utc::now(),
            ttl,
            hit_count: AtomicU64::new(0),
        }
    }

    /// Sets the `Last-Modified` validator.
    pub fn with_last_modified(mut self, value: Option<String>) -> Self {
        self.last_modified = value;
        self
    }

    /// Keeps the `Link` header so cached list pages still paginate.
    pub fn with_link(mut self, value: Option<String>) -> Self {
        self.link = value;
        self
    }

    /// Stored `Link` header.
    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// ETag validator.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// `Last-Modified` validator.
    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    /// HTTP status of the stored response.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Stored body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// When the entry was stored or last revalidated.
    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at_utc
    }

    /// Time since store or last revalidation.
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    /// True while the entry may be served without asking GitHub.
    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }

    /// True if the entry can be revalidated.
    pub fn has_validator(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// Times the entry answered a request.
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// No entry.
    Miss,
    /// Entry younger than its TTL.
    Fresh(Arc<CacheEntry>),
    /// Entry past its TTL; usable for revalidation.
    Stale(Arc<CacheEntry>),
}

type Shard = RwLock<HashMap<RequestSignature, Arc<CacheEntry>>>;

/// Sharded ETag cache.
#[derive(Debug)]
pub struct ConditionalCache {
    shards: Vec<Shard>,
    max_entries_per_shard: usize,
    ttl: Duration,
    max_stale: Duration,
    enabled: bool,
    telemetry: Telemetry,
}

impl ConditionalCache {
    /// Creates an empty cache.
    pub fn new(config: &CacheConfig, telemetry: Telemetry) -> Self {
        Self {
            shards: (0..config.shards.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            max_entries_per_shard: config.max_entries_per_shard.max(1),
            ttl: config.ttl,
            max_stale: config.max_stale,
            enabled: config.enabled,
            telemetry,
        }
    }

    /// Whether responses are cached at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Default TTL of new entries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn shard(&self, signature: &RequestSignature) -> &Shard {
        &self.shards[signature.shard(self.shards.len())]
    }

    /// Entry stored for `signature`, fresh or not.
    pub fn get(&self, signature: &RequestSignature) -> Option<Arc<CacheEntry>> {
        if !self.enabled {
            return None;
        }
        self.shard(signature).read().get(signature).cloned()
    }

    /// Looks up `signature`, counting a hit on fresh entries.
    pub fn lookup(&self, signature: &RequestSignature) -> CacheLookup {
        match self.get(signature) {
            None => CacheLookup::Miss,
            Some(entry) if entry.is_fresh() => {
                entry.hit_count.fetch_add(1, Ordering::Relaxed);
                self.telemetry.emit(TelemetryEvent::CacheHit {
                    signature: signature.to_string(),
                });
                CacheLookup::Fresh(entry)
            }
            Some(entry) => CacheLookup::Stale(entry),
        }
    }

    /// Stores `entry`, replacing any previous one. A full shard drops its
    /// oldest entry.
    pub fn put(&self, signature: RequestSignature, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        if !self.enabled {
            return entry;
        }
        let label = signature.to_string();
        {
            let mut shard = self.shard(&signature).write();
            if !shard.contains_key(&signature) && shard.len() >= self.max_entries_per_shard {
                let oldest = shard
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at)
                    .map(|(k, _)| k.clone());
                if let Some(key) = oldest {
                    shard.remove(&key);
                }
            }
            shard.insert(signature, Arc::clone(&entry));
        }
        self.telemetry.emit(TelemetryEvent::CacheStored { signature: label });
        entry
    }

    /// Records a 304 for `signature`: a new entry with the same body and a
    /// fresh TTL replaces `previous`. A newer ETag from the 304 wins.
    pub fn revalidate(
        &self,
        signature: &RequestSignature,
        previous: &CacheEntry,
        etag: Option<String>,
    ) -> Arc<CacheEntry> {
        let refreshed = CacheEntry {
            etag: etag.or_else(|| previous.etag.clone()),
            last_modified: previous.last_modified.clone(),
            link: previous.link.clone(),
            status: previous.status,
            body: previous.body.clone(),
            stored_at: Instant::now(),
            stored_at_utc: Utc::now(),
            ttl: previous.ttl,
            hit_count: AtomicU64::new(previous.hit_count() + 1),
        };
        let entry = Arc::new(refreshed);
        if self.enabled {
            self.shard(signature)
                .write()
                .insert(signature.clone(), Arc::clone(&entry));
        }
        self.telemetry.emit(TelemetryEvent::CacheRevalidated {
            signature: signature.to_string(),
        });
        entry
    }

    /// Drops the entry for `signature`.
    pub fn remove(&self, signature: &RequestSignature) -> bool {
        self.shard(signature).write().remove(signature).is_some()
    }

    /// Evicts entries older than `max_stale`.
    ///
    /// Candidates are collected under a read lock; each removal takes the
    /// write lock for that single entry.
    pub fn evict_expired(&self) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let expired: Vec<RequestSignature> = shard
                .read()
                .iter()
                .filter(|(_, e)| e.age() > self.max_stale)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                let mut guard = shard.write();
                if guard.get(&key).map(|e| e.age() > self.max_stale).unwrap_or(false) {
                    guard.remove(&key);
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            self.telemetry
                .emit(TelemetryEvent::CacheEvicted { count: evicted });
        }
        evicted
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Returns true when the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use url::Url;

    fn signature(path: &str) -> RequestSignature {
        let url = Url::parse(&format!("https://api.github.com{}", path)).unwrap();
        RequestSignature::new(&Method::GET, &url, None)
    }

    fn cache(ttl: Duration, max_stale: Duration, per_shard: usize) -> ConditionalCache {
        ConditionalCache::new(
            &CacheConfig {
                ttl,
                max_stale,
                shards: 1,
                max_entries_per_shard: per_shard,
                enabled: true,
            },
            Telemetry::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_then_stale() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(3600), 10);
        let sig = signature("/repos/o/r");
        cache.put(
            sig.clone(),
            CacheEntry::new(200, Bytes::from_static(b"{}"), Some("\"v1\"".into()), cache.ttl()),
        );

        assert!(matches!(cache.lookup(&sig), CacheLookup::Fresh(_)));
        tokio::time::advance(Duration::from_secs(61)).await;
        match cache.lookup(&sig) {
            CacheLookup::Stale(entry) => assert_eq!(entry.etag(), Some("\"v1\"")),
            other => panic!("expected stale entry, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidation_keeps_body_and_renews_ttl() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(3600), 10);
        let sig = signature("/repos/o/r");
        let original = cache.put(
            sig.clone(),
            CacheEntry::new(
                200,
                Bytes::from_static(b"{\"id\":1}"),
                Some("\"v1\"".into()),
                cache.ttl(),
            ),
        );
        tokio::time::advance(Duration::from_secs(120)).await;

        let renewed = cache.revalidate(&sig, &original, None);
        assert_eq!(renewed.body(), original.body());
        assert_eq!(renewed.etag(), Some("\"v1\""));
        assert!(renewed.is_fresh());
        assert!(!original.is_fresh());
        assert!(Arc::ptr_eq(&cache.get(&sig).unwrap(), &renewed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_max_stale() {
        let cache = cache(Duration::from_secs(1), Duration::from_secs(10), 10);
        cache.put(
            signature("/old"),
            CacheEntry::new(200, Bytes::new(), None, cache.ttl()),
        );
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.put(
            signature("/new"),
            CacheEntry::new(200, Bytes::new(), None, cache.ttl()),
        );
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.get(&signature("/old")).is_none());
        assert!(cache.get(&signature("/new")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_shard_drops_oldest() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(3600), 2);
        for path in ["/a", "/b", "/c"] {
            cache.put(signature(path), CacheEntry::new(200, Bytes::new(), None, cache.ttl()));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&signature("/a")).is_none());
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = ConditionalCache::new(
            &CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
            Telemetry::default(),
        );
        cache.put(signature("/a"), CacheEntry::new(200, Bytes::new(), None, cache.ttl()));
        assert!(cache.is_empty());
        assert!(matches!(cache.lookup(&signature("/a")), CacheLookup::Miss));
    }
}
