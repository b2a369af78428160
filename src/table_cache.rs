//! Table-cache read path.
//!
//! Point lookups against immutable table files flow through here. Two LRU
//! caches keep open files behind refcounted handles: the handle cache holds
//! fully parsed tables for the conventional path, and a lighter file+filter
//! cache serves the learned path, which needs only raw reads and filter
//! probes. Each lookup is dispatched to the learned path when a trained
//! model covers the file, and to the table's block index otherwise.
//!
//! Handles are `Arc` clones, so every exit path releases its reference when
//! the handle goes out of scope, error and panic paths included, and an
//! entry evicted mid-read stays alive until its last reader finishes.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Condvar, Mutex};

use crate::cache::{encode_key, ShardedCache};
use crate::config::Config;
use crate::env::{legacy_file_path, table_file_path, Env, RandomAccessFile};
use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::learned::model::LearnedIndexRegistry;
use crate::learned::FileModel;
use crate::meta::FileMeta;
use crate::sstable::block::{decode_fixed_entry, BlockIterator};
use crate::sstable::filter::FilterBlockReader;
use crate::sstable::table::{read_filter, read_footer, LookupSink, Table};
use crate::stats::Stats;

/// One resident handle-cache entry: an open file and its parsed table.
/// Declaration order drops the table (which reads through the file) before
/// the file handle itself.
pub struct TableAndFile {
    pub table: Table,
    pub file: Arc<dyn RandomAccessFile>,
}

impl std::fmt::Debug for TableAndFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableAndFile").finish_non_exhaustive()
    }
}

/// One resident file-cache entry: an open file and, when filters are
/// enabled, the file's filter-block reader.
pub struct FilterAndFile {
    pub filter: Option<FilterBlockReader>,
    pub file: Arc<dyn RandomAccessFile>,
}

/// In-flight open marker. The losing side of a racing miss parks here until
/// the winner publishes its entry (or fails, leaving the loser to retry).
#[derive(Default)]
struct Flight {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Flight {
    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }

    fn complete(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

enum Role {
    Opener(Arc<Flight>),
    Waiter(Arc<Flight>),
}

fn claim(flights: &Mutex<HashMap<u64, Arc<Flight>>>, file_number: u64) -> Role {
    let mut flights = flights.lock().unwrap();
    match flights.entry(file_number) {
        MapEntry::Occupied(entry) => Role::Waiter(entry.get().clone()),
        MapEntry::Vacant(entry) => Role::Opener(entry.insert(Arc::new(Flight::default())).clone()),
    }
}

pub struct TableCache {
    config: Config,
    env: Arc<dyn Env>,
    registry: Arc<dyn LearnedIndexRegistry>,
    cache: ShardedCache<TableAndFile>,
    file_cache: ShardedCache<FilterAndFile>,
    table_flights: Mutex<HashMap<u64, Arc<Flight>>>,
    file_flights: Mutex<HashMap<u64, Arc<Flight>>>,
    stats: Stats,
}

impl TableCache {
    pub fn new(
        config: Config,
        env: Arc<dyn Env>,
        registry: Arc<dyn LearnedIndexRegistry>,
    ) -> Result<TableCache> {
        config.validate()?;
        Ok(TableCache {
            cache: ShardedCache::new(config.cache_entries),
            file_cache: ShardedCache::new(config.fd_limit),
            table_flights: Mutex::new(HashMap::new()),
            file_flights: Mutex::new(HashMap::new()),
            stats: Stats::new(),
            config,
            env,
            registry,
        })
    }

    /// Current read-path samples, with both caches' hit/miss/eviction
    /// counters folded in.
    pub fn stats(&self) -> &Stats {
        self.stats.record_table_cache(self.cache.stats());
        self.stats.record_file_cache(self.file_cache.stats());
        &self.stats
    }

    /// Resident entries in the handle cache.
    pub fn cached_tables(&self) -> usize {
        self.cache.len()
    }

    /// Resident entries in the file+filter cache.
    pub fn cached_files(&self) -> usize {
        self.file_cache.len()
    }

    /// Returns a handle to the open table for `file_number`, opening and
    /// caching it on miss. Concurrent misses for one file open it at most
    /// once: losers wait and attach to the winner's entry. Open errors are
    /// never cached, so a transient failure or a repaired file recovers on
    /// the next call.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<TableAndFile>> {
        let _timer = self.stats.time_handle_acquire();
        let key = encode_key(file_number);
        loop {
            if let Some(entry) = self.cache.lookup(&key) {
                return Ok(entry);
            }
            match claim(&self.table_flights, file_number) {
                Role::Waiter(flight) => {
                    flight.wait();
                    continue;
                }
                Role::Opener(flight) => {
                    // Open and parse with no shard lock held.
                    let result = self.open_table(file_number, file_size);
                    if let Ok(entry) = &result {
                        self.cache.insert(key, entry.clone());
                    }
                    self.table_flights.lock().unwrap().remove(&file_number);
                    flight.complete();
                    return result;
                }
            }
        }
    }

    fn open_table(&self, file_number: u64, file_size: u64) -> Result<Arc<TableAndFile>> {
        let name = table_file_path(&self.config.dir, file_number);
        let file: Arc<dyn RandomAccessFile> = match self.env.new_random_access_file(&name) {
            Ok(file) => Arc::from(file),
            Err(first) => {
                // Databases written before the extension change used a
                // different suffix; if that fails too, the canonical name's
                // error wins.
                let legacy = legacy_file_path(&self.config.dir, file_number);
                match self.env.new_random_access_file(&legacy) {
                    Ok(file) => Arc::from(file),
                    Err(_) => return Err(first),
                }
            }
        };
        let table = Table::open(&self.config, file.clone(), file_size)?;
        tracing::debug!(file_number, file_size, "opened table");
        Ok(Arc::new(TableAndFile { table, file }))
    }

    /// Removes `file_number` from the handle cache. Idempotent; readers
    /// holding the entry keep it alive until they finish.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&encode_key(file_number));
    }

    /// Point lookup. Dispatches to the learned path when the mode allows
    /// it and either the caller supplied position bounds or the registry
    /// has a model for this file at `version`; otherwise delegates to the
    /// table's block index. The sink is invoked at most once per candidate
    /// block, and at most once overall on the conventional path.
    pub fn get(
        &self,
        file_number: u64,
        file_size: u64,
        key: &[u8],
        meta: Option<&FileMeta>,
        version: u64,
        bounds: Option<(u64, u64)>,
        sink: &mut dyn LookupSink,
    ) -> Result<()> {
        if self.config.mode.uses_model() {
            if let Some(meta) = meta {
                if bounds.is_some() || self.registry.learned(version, meta) {
                    self.stats.learned_reads.fetch_add(1, Relaxed);
                    return self.level_read(file_number, file_size, key, meta, bounds, sink);
                }
            }
        }

        self.stats.conventional_reads.fetch_add(1, Relaxed);
        let entry = self.find_table(file_number, file_size)?;
        // The handle is released on return, success and error alike.
        entry.table.internal_get(key, sink)
    }

    /// Returns an iterator over every entry of the file. The handle-cache
    /// reference is held by the iterator and released when it is dropped.
    pub fn iter(&self, file_number: u64, file_size: u64) -> Result<TableIterator> {
        let entry = self.find_table(file_number, file_size)?;
        Ok(TableIterator::new(entry))
    }

    /// Returns a file+filter handle for the learned path, opening on miss
    /// with the readahead-skipping hint. With filters enabled, the filter
    /// block named by the metaindex must be present and match the
    /// configured policy exactly.
    pub fn find_file(&self, file_number: u64, file_size: u64) -> Result<Arc<FilterAndFile>> {
        let key = encode_key(file_number);
        loop {
            if let Some(entry) = self.file_cache.lookup(&key) {
                return Ok(entry);
            }
            match claim(&self.file_flights, file_number) {
                Role::Waiter(flight) => {
                    flight.wait();
                    continue;
                }
                Role::Opener(flight) => {
                    let result = self.open_filter_file(file_number, file_size);
                    if let Ok(entry) = &result {
                        self.file_cache.insert(key, entry.clone());
                    }
                    self.file_flights.lock().unwrap().remove(&file_number);
                    flight.complete();
                    return result;
                }
            }
        }
    }

    fn open_filter_file(&self, file_number: u64, file_size: u64) -> Result<Arc<FilterAndFile>> {
        let name = table_file_path(&self.config.dir, file_number);
        let file: Arc<dyn RandomAccessFile> =
            Arc::from(self.env.new_random_access_file_learned(&name)?);

        let mut filter = None;
        if self.config.use_filter {
            if let Some(policy) = &self.config.filter_policy {
                let footer = read_footer(file.as_ref(), file_size)?;
                filter = Some(read_filter(file.as_ref(), &footer, policy.clone())?);
            }
        }
        Ok(Arc::new(FilterAndFile { filter, file }))
    }

    /// Learned-path point lookup: predict a position range, probe the
    /// filter per candidate block, read each block's candidate byte range
    /// once, and binary search it in place. Stays correct for arbitrarily
    /// wrong predictions: the filter never false-negatives and the search
    /// examines every entry in the predicted range, so the only way to
    /// miss a present key is a model whose range excludes the true
    /// position.
    fn level_read(
        &self,
        file_number: u64,
        file_size: u64,
        key: &[u8],
        meta: &FileMeta,
        bounds: Option<(u64, u64)>,
        sink: &mut dyn LookupSink,
    ) -> Result<()> {
        let handle = {
            let _timer = self.stats.time_handle_acquire();
            self.find_file(file_number, file_size)?
        };

        let (lower, upper) = match bounds {
            Some(bounds) => bounds,
            None => {
                let _timer = self.stats.time_model_query();
                self.registry.get_position(key, file_number).ok_or_else(|| {
                    Error::ModelInvariant(format!("no position range for file {file_number}"))
                })?
            }
        };
        if lower > upper {
            return Err(Error::ModelInvariant(format!(
                "impossible position range [{lower}, {upper}]"
            )));
        }
        if meta.entry_count == 0 {
            return Ok(());
        }
        let upper = upper.min(meta.entry_count - 1);
        let lower = lower.min(upper);

        let block_entries = self.config.block_num_entries as u64;
        let entry_size = self.config.entry_size as u64;
        let index_lower = lower / block_entries;
        let index_upper = upper / block_entries;

        // Worst case is one full block of entries per read.
        let mut scratch = vec![0u8; self.config.block_num_entries * self.config.entry_size];

        for i in index_lower..=index_upper {
            let block_offset = i * self.config.block_size as u64;
            if let Some(filter) = &handle.filter {
                if !filter.key_may_match(block_offset, key) {
                    self.stats.filter_misses.fetch_add(1, Relaxed);
                    continue;
                }
            }

            let pos_lower = if i == index_lower { lower % block_entries } else { 0 };
            let pos_upper = if i == index_upper {
                upper % block_entries
            } else {
                block_entries - 1
            };

            let read_size = ((pos_upper - pos_lower + 1) * entry_size) as usize;
            let read_offset = block_offset + pos_lower * entry_size;
            {
                let _timer = self.stats.time_block_read();
                self.stats.blocks_read.fetch_add(1, Relaxed);
                let n = handle.file.read_at(read_offset, &mut scratch[..read_size])?;
                if n < read_size {
                    return errcorrupt!(
                        "short entry read at offset {read_offset}: {n} of {read_size} bytes"
                    );
                }
            }
            let entries = &scratch[..read_size];

            let (found_key, value) = {
                let _timer = self.stats.time_search();
                let mut left = pos_lower;
                let mut right = pos_upper;
                while left < right {
                    let mid = (left + right) / 2;
                    let offset = ((mid - pos_lower) * entry_size) as usize;
                    let (mid_key, _) = decode_fixed_entry(entries, offset)?;
                    if mid_key < key {
                        left = mid + 1;
                    } else {
                        right = mid;
                    }
                }
                decode_fixed_entry(entries, ((left - pos_lower) * entry_size) as usize)?
            };

            // The sink judges the match; a non-matching candidate just
            // means this block doesn't hold the key.
            sink.accept(found_key, value);
            if sink.is_found() {
                break;
            }
        }
        Ok(())
    }

    /// Reads every key of a table through the file cache and trains a
    /// model for it. Registering the model is the caller's business; a
    /// model serves reads only once it is in the registry.
    pub fn train_model(&self, meta: &FileMeta, version: u64) -> Result<FileModel> {
        let handle = self.find_file(meta.number, meta.size)?;
        let table = Table::open(&self.config, handle.file.clone(), meta.size)?;
        let entry = Arc::new(TableAndFile {
            table,
            file: handle.file.clone(),
        });

        let mut keys = Vec::with_capacity(meta.entry_count as usize);
        for item in TableIterator::new(entry) {
            let (key, _) = item?;
            keys.push(key);
        }
        FileModel::train(meta, version, self.config.gamma, keys)
    }
}

impl Drop for TableCache {
    fn drop(&mut self) {
        self.stats().report();
    }
}

/// Iterates a table's entries block by block, pinning the cache entry for
/// its own lifetime.
pub struct TableIterator {
    entry: Arc<TableAndFile>,
    next_block: usize,
    current: Option<BlockIterator>,
}

impl TableIterator {
    fn new(entry: Arc<TableAndFile>) -> Self {
        Self {
            entry,
            next_block: 0,
            current: None,
        }
    }
}

impl Iterator for TableIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if let Some(item) = iter.next() {
                    return Some(item);
                }
            }
            match self.entry.table.read_block_at(self.next_block) {
                Ok(Some(iter)) => {
                    self.current = Some(iter);
                    self.next_block += 1;
                }
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::path::Path;
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::SeqCst};

    use super::*;
    use crate::config::Mode;
    use crate::env::SystemEnv;
    use crate::learned::ModelRegistry;
    use crate::sstable::builder::TableBuilder;
    use crate::sstable::filter::BloomFilterPolicy;
    use crate::sstable::table::ValueSink;

    /// Wraps the real filesystem with open/close accounting.
    #[derive(Default)]
    struct CountingEnv {
        opens: AtomicU64,
        live: Arc<AtomicI64>,
    }

    struct CountingFile {
        inner: Box<dyn RandomAccessFile>,
        live: Arc<AtomicI64>,
    }

    impl RandomAccessFile for CountingFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            self.inner.read_at(offset, buf)
        }
    }

    impl Drop for CountingFile {
        fn drop(&mut self) {
            self.live.fetch_sub(1, SeqCst);
        }
    }

    impl Env for CountingEnv {
        fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
            let inner = SystemEnv.new_random_access_file(path)?;
            self.opens.fetch_add(1, SeqCst);
            self.live.fetch_add(1, SeqCst);
            Ok(Box::new(CountingFile {
                inner,
                live: self.live.clone(),
            }))
        }

        fn new_random_access_file_learned(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
            self.new_random_access_file(path)
        }
    }

    /// Geometry for single-letter keys with `"v" + key` values:
    /// 8 header + 1 key + 2 value = 11 bytes per entry.
    fn alpha_config(dir: &Path) -> Config {
        Config::new(dir)
            .block_geometry(8, 128, 11)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
            .gamma(1.0)
    }

    fn build_alpha_table(dir: &Path, file_number: u64, config: &Config) -> FileMeta {
        let path = table_file_path(dir, file_number);
        let file = File::create(&path).expect("Failed to create file");
        let mut builder =
            TableBuilder::new(file, file_number, config.clone()).expect("Failed to create builder");
        for c in b'a'..=b'z' {
            let key = [c];
            let value = [b'v', c];
            builder.add(&key, &value).expect("Failed to add entry");
        }
        builder.finish().expect("Failed to finish table")
    }

    /// Geometry for `k%04` keys with `v%02` values: 8 + 5 + 3 = 16 bytes.
    fn numeric_config(dir: &Path) -> Config {
        Config::new(dir)
            .block_geometry(8, 256, 16)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
            .gamma(1.0)
    }

    fn build_numeric_table(dir: &Path, file_number: u64, config: &Config, count: u32) -> FileMeta {
        let path = table_file_path(dir, file_number);
        let file = File::create(&path).expect("Failed to create file");
        let mut builder =
            TableBuilder::new(file, file_number, config.clone()).expect("Failed to create builder");
        for i in 0..count {
            builder
                .add(
                    format!("k{i:04}").as_bytes(),
                    format!("v{:02}", i % 100).as_bytes(),
                )
                .expect("Failed to add entry");
        }
        builder.finish().expect("Failed to finish table")
    }

    fn get_value(
        cache: &TableCache,
        meta: &FileMeta,
        version: u64,
        key: &[u8],
    ) -> Option<Vec<u8>> {
        let mut sink = ValueSink::new(key);
        cache
            .get(meta.number, meta.size, key, Some(meta), version, None, &mut sink)
            .expect("get failed");
        sink.into_value()
    }

    fn learned_cache(config: Config, registry: Arc<ModelRegistry>) -> TableCache {
        TableCache::new(config.mode(Mode::Learned), Arc::new(SystemEnv), registry)
            .expect("Failed to create cache")
    }

    #[test]
    fn test_conventional_and_learned_agree_on_every_key() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = alpha_config(dir.path());
        let meta = build_alpha_table(dir.path(), 1, &config);

        let registry = Arc::new(ModelRegistry::new());
        let cache = learned_cache(config, registry.clone());

        // Not yet trained: every lookup takes the conventional path.
        assert_eq!(get_value(&cache, &meta, 1, b"m"), Some(b"vm".to_vec()));
        assert_eq!(cache.stats().learned_reads.load(Relaxed), 0);

        let model = cache.train_model(&meta, 1).expect("Failed to train");
        registry.insert(model);

        // Trained: the learned path serves the same answers.
        for c in b'a'..=b'z' {
            let found = get_value(&cache, &meta, 1, &[c]);
            assert_eq!(found, Some(vec![b'v', c]), "wrong value for key {}", c as char);
        }
        assert_eq!(cache.stats().learned_reads.load(Relaxed), 26);

        // Absent keys agree too: below, between, and above the key range.
        for absent in [b"A".as_slice(), b"aa".as_slice(), b"~".as_slice()] {
            assert_eq!(get_value(&cache, &meta, 1, absent), None);
        }
    }

    #[test]
    fn test_get_with_caller_supplied_bounds() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = alpha_config(dir.path());
        let meta = build_alpha_table(dir.path(), 1, &config);

        // No model registered; the caller's bounds drive the learned path.
        let cache = learned_cache(config, Arc::new(ModelRegistry::new()));
        let mut sink = ValueSink::new(b"m");
        cache
            .get(meta.number, meta.size, b"m", Some(&meta), 1, Some((0, 25)), &mut sink)
            .expect("get failed");
        assert_eq!(sink.into_value(), Some(b"vm".to_vec()));
        assert_eq!(cache.stats().learned_reads.load(Relaxed), 1);
    }

    #[test]
    fn test_not_found_past_key_range() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = alpha_config(dir.path());
        let meta = build_alpha_table(dir.path(), 1, &config);

        let registry = Arc::new(ModelRegistry::new());
        let cache = learned_cache(config, registry.clone());
        registry.insert(cache.train_model(&meta, 1).expect("Failed to train"));

        // "~" sorts after every key; neither path may invoke the sink with
        // a match.
        assert_eq!(get_value(&cache, &meta, 1, b"~"), None);
        let mut sink = ValueSink::new(b"~");
        cache
            .get(meta.number, meta.size, b"~", None, 1, None, &mut sink)
            .expect("get failed");
        assert_eq!(sink.into_value(), None);
    }

    #[test]
    fn test_conventional_mode_ignores_models() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = alpha_config(dir.path());
        let meta = build_alpha_table(dir.path(), 1, &config);

        let registry = Arc::new(ModelRegistry::new());
        let cache = TableCache::new(config, Arc::new(SystemEnv), registry.clone())
            .expect("Failed to create cache");
        registry.insert(cache.train_model(&meta, 1).expect("Failed to train"));

        assert_eq!(get_value(&cache, &meta, 1, b"m"), Some(b"vm".to_vec()));
        assert_eq!(cache.stats().learned_reads.load(Relaxed), 0);
        assert!(cache.stats().conventional_reads.load(Relaxed) > 0);
    }

    #[test]
    fn test_cache_capacity_and_fd_accounting() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = numeric_config(dir.path()).cache_entries(64);

        let metas: Vec<FileMeta> = (1..=10_000u64)
            .map(|n| build_numeric_table(dir.path(), n, &config, 2))
            .collect();

        let env = Arc::new(CountingEnv::default());
        let cache = TableCache::new(config, env.clone(), Arc::new(ModelRegistry::new()))
            .expect("Failed to create cache");

        for meta in &metas {
            let mut sink = ValueSink::new(b"k0001");
            cache
                .get(meta.number, meta.size, b"k0001", None, 0, None, &mut sink)
                .expect("get failed");
            assert_eq!(sink.into_value(), Some(b"v01".to_vec()));
        }

        // Every file was distinct, so every lookup opened exactly one file;
        // only the capacity remains resident, and no handle leaks.
        assert_eq!(env.opens.load(SeqCst), 10_000);
        assert_eq!(cache.cached_tables(), 64);
        assert_eq!(env.live.load(SeqCst), 64);

        let stats = cache.stats();
        assert_eq!(stats.table_cache_hits.load(Relaxed), 0);
        assert_eq!(stats.table_cache_misses.load(Relaxed), 10_000);
        assert_eq!(stats.table_cache_evictions.load(Relaxed), 10_000 - 64);

        drop(cache);
        assert_eq!(env.live.load(SeqCst), 0);
    }

    #[test]
    fn test_handle_accounting_across_evict() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = numeric_config(dir.path());
        let meta = build_numeric_table(dir.path(), 1, &config, 20);

        let env = Arc::new(CountingEnv::default());
        let cache = TableCache::new(config, env.clone(), Arc::new(ModelRegistry::new()))
            .expect("Failed to create cache");

        let handle = cache
            .find_table(meta.number, meta.size)
            .expect("Failed to find table");
        assert_eq!(env.live.load(SeqCst), 1);

        // Eviction must not close the file under the outstanding handle.
        cache.evict(meta.number);
        cache.evict(meta.number); // idempotent
        assert_eq!(cache.cached_tables(), 0);
        assert_eq!(env.live.load(SeqCst), 1);

        let mut sink = ValueSink::new(b"k0007");
        handle
            .table
            .internal_get(b"k0007", &mut sink)
            .expect("get through evicted handle failed");
        assert_eq!(sink.into_value(), Some(b"v07".to_vec()));

        drop(handle);
        assert_eq!(env.live.load(SeqCst), 0);
    }

    #[test]
    fn test_cold_misses_open_at_most_once() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = numeric_config(dir.path());
        let meta = build_numeric_table(dir.path(), 1, &config, 20);

        let env = Arc::new(CountingEnv::default());
        let cache = Arc::new(
            TableCache::new(config, env.clone(), Arc::new(ModelRegistry::new()))
                .expect("Failed to create cache"),
        );

        let barrier = Arc::new(std::sync::Barrier::new(16));
        let mut threads = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let (number, size) = (meta.number, meta.size);
            threads.push(std::thread::spawn(move || {
                barrier.wait();
                cache.find_table(number, size).expect("Failed to find table");
            }));
        }
        for thread in threads {
            thread.join().expect("thread panicked");
        }
        assert_eq!(env.opens.load(SeqCst), 1);
    }

    #[test]
    fn test_corrupt_footer_fails_then_repair_recovers() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = numeric_config(dir.path());
        let meta = build_numeric_table(dir.path(), 1, &config, 20);

        let path = table_file_path(dir.path(), 1);
        let original = std::fs::read(&path).expect("Failed to read file");
        let footer_start = original.len() - crate::sstable::footer::FOOTER_SIZE;

        let mut corrupted = original.clone();
        corrupted[footer_start] ^= 0xff;
        std::fs::write(&path, &corrupted).expect("Failed to write file");

        let cache = TableCache::new(config, Arc::new(SystemEnv), Arc::new(ModelRegistry::new()))
            .expect("Failed to create cache");
        match cache.find_table(meta.number, meta.size) {
            Err(Error::Corruption(_)) => {}
            other => panic!("expected corruption error, got {other:?}"),
        }
        // The failure was not cached.
        assert_eq!(cache.cached_tables(), 0);

        std::fs::write(&path, &original).expect("Failed to repair file");
        cache
            .find_table(meta.number, meta.size)
            .expect("repaired file must open");
        assert_eq!(cache.cached_tables(), 1);
    }

    #[test]
    fn test_legacy_file_name_fallback() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = numeric_config(dir.path());
        let meta = build_numeric_table(dir.path(), 1, &config, 20);

        std::fs::rename(
            table_file_path(dir.path(), 1),
            legacy_file_path(dir.path(), 1),
        )
        .expect("Failed to rename");

        let cache = TableCache::new(config, Arc::new(SystemEnv), Arc::new(ModelRegistry::new()))
            .expect("Failed to create cache");
        cache
            .find_table(meta.number, meta.size)
            .expect("legacy name must open");

        // Neither name exists: the canonical open's error comes back.
        match cache.find_table(99, 1024) {
            Err(Error::IO(_)) => {}
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn test_filter_never_false_negatives_for_stored_keys() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = numeric_config(dir.path());
        let meta = build_numeric_table(dir.path(), 1, &config, 200);

        let cache = TableCache::new(
            config.clone(),
            Arc::new(SystemEnv),
            Arc::new(ModelRegistry::new()),
        )
        .expect("Failed to create cache");
        let handle = cache
            .find_file(meta.number, meta.size)
            .expect("Failed to find file");
        assert_eq!(cache.cached_files(), 1);

        // A second acquisition hits the file cache, and both outcomes show
        // up in the stats snapshot.
        cache
            .find_file(meta.number, meta.size)
            .expect("Failed to find file");
        let stats = cache.stats();
        assert_eq!(stats.file_cache_hits.load(Relaxed), 1);
        assert_eq!(stats.file_cache_misses.load(Relaxed), 1);

        let filter = handle.filter.as_ref().expect("filter must be loaded");

        for i in 0..200u64 {
            let key = format!("k{i:04}");
            let block_offset = (i / config.block_num_entries as u64) * config.block_size as u64;
            assert!(
                filter.key_may_match(block_offset, key.as_bytes()),
                "false negative for {key}"
            );
        }
    }

    #[test]
    fn test_iterator_scans_all_entries_and_releases_handle() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = numeric_config(dir.path());
        let meta = build_numeric_table(dir.path(), 1, &config, 100);

        let env = Arc::new(CountingEnv::default());
        let cache = TableCache::new(config, env.clone(), Arc::new(ModelRegistry::new()))
            .expect("Failed to create cache");

        let iter = cache.iter(meta.number, meta.size).expect("Failed to create iterator");
        cache.evict(meta.number);

        let entries: Vec<(Vec<u8>, Vec<u8>)> = iter
            .collect::<Result<Vec<_>>>()
            .expect("iteration must succeed");
        assert_eq!(entries.len(), 100);
        for (i, (key, value)) in entries.iter().enumerate() {
            assert_eq!(key, format!("k{i:04}").as_bytes());
            assert_eq!(value, format!("v{:02}", i % 100).as_bytes());
        }

        // The iterator held the last reference past the eviction.
        assert_eq!(env.live.load(SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_get_storm() {
        const FILES: u64 = 8;
        const TASKS: usize = 64;
        const GETS_PER_TASK: u32 = 100;

        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = numeric_config(dir.path());
        let metas: Arc<Vec<FileMeta>> = Arc::new(
            (1..=FILES)
                .map(|n| build_numeric_table(dir.path(), n, &config, 100))
                .collect(),
        );

        let registry = Arc::new(ModelRegistry::new());
        let cache = Arc::new(learned_cache(config, registry.clone()));
        for meta in metas.iter() {
            registry.insert(cache.train_model(meta, 1).expect("Failed to train"));
        }

        let mut tasks = Vec::new();
        for task_id in 0..TASKS {
            let cache = cache.clone();
            let metas = metas.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..GETS_PER_TASK {
                    let meta = &metas[(task_id as u32 + i) as usize % metas.len()];
                    let key_idx = (task_id as u32 * 7 + i) % 100;
                    let key = format!("k{key_idx:04}");

                    // Alternate learned and conventional dispatch; both must
                    // agree under concurrent eviction.
                    let meta_arg = if i % 2 == 0 { Some(meta) } else { None };
                    let mut sink = ValueSink::new(key.as_bytes());
                    cache
                        .get(meta.number, meta.size, key.as_bytes(), meta_arg, 1, None, &mut sink)
                        .expect("get failed");
                    assert_eq!(
                        sink.into_value(),
                        Some(format!("v{key_idx:02}").into_bytes()),
                        "task {task_id} got wrong value for {key}"
                    );

                    if i % 25 == 0 {
                        cache.evict(meta.number);
                    }
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.expect("task panicked");
        }

        let stats = cache.stats();
        assert!(stats.learned_reads.load(Relaxed) > 0);
        assert!(stats.conventional_reads.load(Relaxed) > 0);
    }

    #[test]
    fn test_learned_rejects_impossible_bounds() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = alpha_config(dir.path());
        let meta = build_alpha_table(dir.path(), 1, &config);

        let cache = learned_cache(config, Arc::new(ModelRegistry::new()));
        let mut sink = ValueSink::new(b"m");
        let result = cache.get(meta.number, meta.size, b"m", Some(&meta), 1, Some((20, 3)), &mut sink);
        assert!(matches!(result, Err(Error::ModelInvariant(_))));
    }

    #[test]
    fn test_learned_clamps_overshooting_bounds() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = alpha_config(dir.path());
        let meta = build_alpha_table(dir.path(), 1, &config);

        // Upper bound far past the end of the file still finds the key.
        let cache = learned_cache(config, Arc::new(ModelRegistry::new()));
        let mut sink = ValueSink::new(b"z");
        cache
            .get(meta.number, meta.size, b"z", Some(&meta), 1, Some((0, 10_000)), &mut sink)
            .expect("get failed");
        assert_eq!(sink.into_value(), Some(b"vz".to_vec()));
    }
}
