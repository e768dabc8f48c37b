// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Capability cache: a keyed store of serialised disco#info trees.
//!
//! The store maps XEP-0115 `node#ver` keys to the serialised XML of the
//! corresponding `<query/>` tree plus an access timestamp. Persistence
//! backends implement [`CapsStore`]; an in-memory backend with LRU
//! eviction between high/low watermarks is bundled.

use std::collections::HashMap;

use nodetree::{parse_document, NodeTree, Writer};

/// Persisted schema version. Backends that find a different version on
/// disk must delete and recreate their store.
pub const CAPS_CACHE_SCHEMA_VERSION: u32 = 1;

const DEFAULT_HIGH_WATERMARK: usize = 1000;
const DEFAULT_LOW_WATERMARK: usize = 950;

/// Storage contract for the cache: serialised tree + timestamp, keyed by
/// the caps node string.
pub trait CapsStore {
    fn get(&mut self, node_key: &str) -> Option<(String, u64)>;
    fn put(&mut self, node_key: &str, xml: String, stamp: u64);
    fn remove(&mut self, node_key: &str);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Keys of the `count` least recently used entries.
    fn oldest(&self, count: usize) -> Vec<String>;
}

/// The bundled in-memory backend.
#[derive(Default)]
pub struct MemoryCapsStore {
    entries: HashMap<String, (String, u64)>,
}

impl CapsStore for MemoryCapsStore {
    fn get(&mut self, node_key: &str) -> Option<(String, u64)> {
        self.entries.get(node_key).cloned()
    }

    fn put(&mut self, node_key: &str, xml: String, stamp: u64) {
        self.entries.insert(node_key.to_owned(), (xml, stamp));
    }

    fn remove(&mut self, node_key: &str) {
        self.entries.remove(node_key);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn oldest(&self, count: usize) -> Vec<String> {
        let mut by_stamp: Vec<(&String, u64)> = self
            .entries
            .iter()
            .map(|(k, (_, stamp))| (k, *stamp))
            .collect();
        by_stamp.sort_by_key(|(_, stamp)| *stamp);
        by_stamp
            .into_iter()
            .take(count)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// The cache proper: tree ⇄ XML conversion, access stamping, and LRU
/// eviction driven by the watermarks.
pub struct CapsCache<S: CapsStore> {
    store: S,
    writer: Writer,
    high: usize,
    low: usize,
    /// Logical access clock; every lookup or insert advances it.
    clock: u64,
}

impl Default for CapsCache<MemoryCapsStore> {
    fn default() -> Self {
        CapsCache::new(MemoryCapsStore::default())
    }
}

impl<S: CapsStore> CapsCache<S> {
    pub fn new(store: S) -> CapsCache<S> {
        CapsCache::with_watermarks(store, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)
    }

    pub fn with_watermarks(store: S, high: usize, low: usize) -> CapsCache<S> {
        debug_assert!(low <= high);
        CapsCache {
            store,
            writer: Writer::new_no_stream(),
            high,
            low,
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up a cached disco#info tree. Refreshes the entry's
    /// timestamp.
    pub fn lookup(&mut self, node_key: &str) -> Option<NodeTree> {
        let (xml, _) = self.store.get(node_key)?;
        let stamp = self.tick();
        match parse_document(xml.as_bytes()) {
            Ok(tree) => {
                self.store.put(node_key, xml, stamp);
                Some(tree)
            }
            Err(e) => {
                log::warn!("dropping unparseable cache entry {:?}: {}", node_key, e);
                self.store.remove(node_key);
                None
            }
        }
    }

    /// Insert (or replace) an entry, evicting down to the low watermark
    /// when the high watermark is exceeded.
    pub fn insert(&mut self, node_key: &str, tree: &NodeTree) {
        let xml = String::from_utf8_lossy(self.writer.write_node_tree(tree)).into_owned();
        let stamp = self.tick();
        self.store.put(node_key, xml, stamp);
        if self.store.len() > self.high {
            let excess = self.store.len() - self.low;
            for key in self.store.oldest(excess) {
                self.store.remove(&key);
            }
            log::debug!("evicted {} cache entries", excess);
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodetree::{ns, Node};

    fn query(marker: &str) -> NodeTree {
        let mut q = Node::new("query", ns::DISCO_INFO);
        q.add_child("feature").set_attribute("var", marker);
        NodeTree::new(q)
    }

    #[test]
    fn round_trips_trees() {
        let mut cache = CapsCache::default();
        let tree = query("urn:example:feature");
        cache.insert("client#ver1", &tree);
        let back = cache.lookup("client#ver1").unwrap();
        assert_eq!(back, tree);
        assert!(cache.lookup("client#other").is_none());
    }

    #[test]
    fn eviction_keeps_recently_used_entries() {
        let mut cache =
            CapsCache::with_watermarks(MemoryCapsStore::default(), 4, 2);
        for i in 0..4 {
            cache.insert(&format!("key{}", i), &query("urn:x"));
        }
        assert_eq!(cache.len(), 4);

        // Touch key0 so it is no longer the oldest.
        assert!(cache.lookup("key0").is_some());

        cache.insert("key4", &query("urn:x"));
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("key4").is_some());
        // key1 was the least recently used and is gone.
        assert!(cache.lookup("key1").is_none());
    }

    #[test]
    fn schema_version_is_exposed() {
        assert_eq!(CAPS_CACHE_SCHEMA_VERSION, 1);
    }
}
