//! Build-scoped resource caches
//!
//! Two caches back a discovery run:
//! - the content-address cache, keyed by sha256 digest, which prevents
//!   re-uploading identical content across snapshots;
//! - the response cache, keyed by normalized URL, which lets the
//!   interceptor replay a previously seen response without a network
//!   round trip.
//!
//! Neither cache evicts; their scope is one build's process lifetime.

use crate::resource::Resource;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Content-address cache entry: the resource plus how often identical
/// content was seen again.
#[derive(Debug)]
pub struct CacheEntry {
    pub resource: Arc<Resource>,
    refs: AtomicU64,
}

impl CacheEntry {
    fn new(resource: Arc<Resource>) -> Self {
        Self {
            resource,
            refs: AtomicU64::new(1),
        }
    }

    pub fn ref_count(&self) -> u64 {
        self.refs.load(Ordering::Relaxed)
    }
}

/// Sha-keyed cache of resources already seen in this build.
///
/// Writes are first-writer-wins: concurrent discovery tasks that compute
/// the same digest race on a single atomic map entry and the losers are
/// dropped, so the bytes a given sha refers to never change mid-build.
#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: DashMap<String, CacheEntry>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource keyed by its content hash. Returns the cached
    /// resource: the given one if this call won the insert, the original
    /// winner otherwise.
    pub fn put(&self, resource: Arc<Resource>) -> Arc<Resource> {
        let sha = resource.sha().to_string();
        let entry = self.entries.entry(sha).or_insert_with(|| CacheEntry::new(resource.clone()));

        if !Arc::ptr_eq(&entry.resource, &resource) {
            entry.refs.fetch_add(1, Ordering::Relaxed);
            debug!("Content {} already cached, dropping duplicate", entry.key());
        }

        entry.resource.clone()
    }

    pub fn get(&self, sha: &str) -> Option<Arc<Resource>> {
        self.entries.get(sha).map(|e| {
            e.refs.fetch_add(1, Ordering::Relaxed);
            e.resource.clone()
        })
    }

    pub fn has(&self, sha: &str) -> bool {
        self.entries.contains_key(sha)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Aggregate stats for the end-of-build summary line.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in self.entries.iter() {
            stats.unique_resources += 1;
            stats.total_bytes += entry.resource.size() as u64;
            stats.dedup_hits += entry.ref_count().saturating_sub(1);
        }
        stats
    }
}

/// Content-address cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub unique_resources: usize,
    pub total_bytes: u64,
    pub dedup_hits: u64,
}

/// A replayable response captured from the network, stored alongside the
/// resource it produced.
#[derive(Debug, Clone)]
pub struct CachedExchange {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub resource: Arc<Resource>,
}

/// URL-keyed cache of completed exchanges, shared by all discovery pages
/// in a build so repeat requests resolve without touching the network.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<String, Arc<CachedExchange>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<Arc<CachedExchange>> {
        self.entries.get(url).map(|e| e.value().clone())
    }

    pub fn put(&self, url: impl Into<String>, exchange: Arc<CachedExchange>) {
        self.entries.entry(url.into()).or_insert(exchange);
    }

    pub fn has(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
