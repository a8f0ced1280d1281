use crate::LinkIdentity;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Raw href -> identity mapping shared by every rewrite of one build.
///
/// Entries are never removed. Clones share the same underlying map, so one
/// cache handed to many concurrent rewrites ends up holding every distinct
/// link of the site.
#[derive(Debug, Clone, Default)]
pub struct LinkCache {
    links: Arc<DashMap<String, LinkIdentity>>,
    computed: Arc<AtomicUsize>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, url: &str) -> bool {
        self.links.contains_key(url)
    }

    pub fn get(&self, url: &str) -> Option<LinkIdentity> {
        self.links.get(url).map(|entry| *entry)
    }

    pub fn set(&self, url: impl Into<String>, identity: LinkIdentity) {
        self.links.insert(url.into(), identity);
    }

    /// Returns the cached identity for `url`, hashing and storing it on first sight.
    ///
    /// The check and the insert happen under the same shard lock, so two
    /// rewrites racing on a new href hash it exactly once.
    pub fn identify(&self, url: &str) -> LinkIdentity {
        if let Some(identity) = self.get(url) {
            return identity;
        }

        *self
            .links
            .entry(url.to_string())
            .or_insert_with(|| {
                self.computed.fetch_add(1, Ordering::Relaxed);
                LinkIdentity::of(url)
            })
    }

    /// Number of identities actually hashed (cache misses).
    pub fn computed_count(&self) -> usize {
        self.computed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Point-in-time copy of every discovered link, sorted by href.
    pub fn snapshot(&self) -> Vec<(String, LinkIdentity)> {
        let mut links: Vec<_> = self
            .links
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        links.sort();
        links
    }
}
