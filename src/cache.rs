//! Sharded LRU cache of refcounted entries.
//!
//! Both the table-handle cache and the file+filter cache are instances of
//! this structure: a hash map for O(1) lookup plus an arena-backed doubly
//! linked list for O(1) recency updates, split into shards so concurrent
//! readers do not serialize on a single lock. Values are handed out as
//! `Arc` clones, so an entry evicted while handles are outstanding stays
//! alive until the last handle is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};

/// Fixed-width cache key: the big-endian encoding of a file number. The
/// encoding itself is arbitrary; inserts and lookups must agree on it.
pub type CacheKey = [u8; 8];

/// Encodes a file number as a cache key.
pub fn encode_key(file_number: u64) -> CacheKey {
    let mut key = [0u8; 8];
    BigEndian::write_u64(&mut key, file_number);
    key
}

const SHARD_COUNT: usize = 16;

/// Sentinel index for list links.
const NIL: usize = usize::MAX;

struct Node<V> {
    key: CacheKey,
    value: Option<Arc<V>>,
    prev: usize,
    next: usize,
}

struct Shard<V> {
    capacity: usize,
    /// key -> arena index of the node
    map: HashMap<CacheKey, usize>,
    nodes: Vec<Node<V>>,
    free: Vec<usize>,
    /// Most recently used node, or NIL.
    head: usize,
    /// Least recently used node, or NIL.
    tail: usize,
}

impl<V> Shard<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn lookup(&mut self, key: &CacheKey) -> Option<Arc<V>> {
        let idx = *self.map.get(key)?;
        self.detach(idx);
        self.push_front(idx);
        self.nodes[idx].value.clone()
    }

    /// Inserts the value, evicting from the cold end as needed. Returns the
    /// number of entries evicted.
    fn insert(&mut self, key: CacheKey, value: Arc<V>) -> u64 {
        if let Some(&idx) = self.map.get(&key) {
            self.nodes[idx].value = Some(value);
            self.detach(idx);
            self.push_front(idx);
            return 0;
        }

        let node = Node {
            key,
            value: Some(value),
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);

        let mut evicted = 0;
        while self.map.len() > self.capacity && self.tail != NIL {
            self.remove(self.tail);
            evicted += 1;
        }
        evicted
    }

    fn remove(&mut self, idx: usize) {
        self.detach(idx);
        let key = self.nodes[idx].key;
        self.map.remove(&key);
        // Drops the cache's reference; outstanding handles keep the value alive.
        self.nodes[idx].value = None;
        self.free.push(idx);
    }

    fn erase(&mut self, key: &CacheKey) -> bool {
        match self.map.get(key) {
            Some(&idx) => {
                self.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// A concurrent LRU cache with `SHARD_COUNT` independently locked shards.
/// Capacity is measured in entries and divided evenly across shards.
pub struct ShardedCache<V> {
    shards: Vec<Mutex<Shard<V>>>,
    stats: CacheStats,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> ShardedCache<V> {
    pub fn new(capacity: usize) -> Self {
        let per_shard = capacity.div_ceil(SHARD_COUNT).max(1);
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(Shard::new(per_shard)))
            .collect();
        Self {
            shards,
            stats: CacheStats::default(),
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<Shard<V>> {
        // Low byte of the file number; sequential file numbers spread evenly.
        &self.shards[key[7] as usize % SHARD_COUNT]
    }

    /// Returns an additional reference to the cached value, if resident.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<V>> {
        let found = self.shard(key).lock().unwrap().lookup(key);
        match &found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, key: CacheKey, value: Arc<V>) {
        let evicted = self.shard(&key).lock().unwrap().insert(key, value);
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Removes the entry if resident. Idempotent; outstanding references
    /// keep the underlying value alive until they are dropped.
    pub fn erase(&self, key: &CacheKey) -> bool {
        self.shard(key).lock().unwrap().erase(key)
    }

    /// Number of resident entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses, evictions) counters.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            self.stats.evictions.load(Ordering::Relaxed),
        )
    }
}
