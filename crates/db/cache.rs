//! Pinned LRU over loaded nodes for the read-only path.
//!
//! Entries are `Arc`s, so a reader that pulled a node out keeps it alive
//! past eviction; the cache only bounds what stays resident, never what a
//! cursor may still hold.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::node::Node;
use crate::offset::ChunkOffset;

fn key(offset: ChunkOffset) -> u64 {
    ((offset.chunk_id() as u64) << 44) | offset.offset()
}

struct Inner {
    map: FxHashMap<u64, Arc<Node>>,
    order: VecDeque<u64>,
}

pub struct NodeCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: FxHashMap::default(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, offset: ChunkOffset) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        let k = key(offset);
        let hit = inner.map.get(&k).cloned();
        if hit.is_some() {
            inner.order.push_back(k);
        }
        hit
    }

    pub fn insert(&self, offset: ChunkOffset, node: Arc<Node>) {
        let mut inner = self.inner.lock();
        let k = key(offset);
        inner.map.insert(k, node);
        inner.order.push_back(k);
        // second-chance eviction: a key re-pushed on access survives the
        // stale front entries left behind for it
        while inner.map.len() > self.capacity {
            let Some(victim) = inner.order.pop_front() else {
                break;
            };
            if inner.order.contains(&victim) {
                continue;
            }
            inner.map.remove(&victim);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything resident (readers holding `Arc`s are unaffected).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nibbles::Nibbles;
    use bytes::Bytes;

    fn node(tag: u8) -> Arc<Node> {
        Arc::new(Node::new_leaf(
            Nibbles::from_bytes(&[tag]),
            Bytes::copy_from_slice(&[tag]),
            0,
        ))
    }

    #[test]
    fn bounded_with_pinning() {
        let cache = NodeCache::new(2);
        let pinned = node(0);
        cache.insert(ChunkOffset::new(0, 0), pinned.clone());
        cache.insert(ChunkOffset::new(0, 64), node(1));
        cache.insert(ChunkOffset::new(0, 128), node(2));
        assert!(cache.len() <= 2);
        // evicted from the cache, but the Arc is still alive out here
        assert_eq!(pinned.value, Some(Bytes::copy_from_slice(&[0])));
    }

    #[test]
    fn recently_used_survives() {
        let cache = NodeCache::new(2);
        let a = ChunkOffset::new(0, 0);
        cache.insert(a, node(0));
        cache.insert(ChunkOffset::new(0, 64), node(1));
        cache.get(a);
        cache.insert(ChunkOffset::new(0, 128), node(2));
        assert!(cache.get(a).is_some(), "hot entry evicted");
    }
}
