//! Read-path counters and timers.
//!
//! Every sample site is advisory: none of these values affect control flow,
//! and all updates are relaxed atomics so the hot path pays one
//! uncontended add per sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Aggregated samples for the table-cache read path.
#[derive(Debug, Default)]
pub struct Stats {
    /// Lookups dispatched to the learned path.
    pub learned_reads: AtomicU64,
    /// Lookups dispatched to the conventional path.
    pub conventional_reads: AtomicU64,
    /// Candidate blocks skipped by a filter probe.
    pub filter_misses: AtomicU64,
    /// Bounded entry-range reads issued by the learned path.
    pub blocks_read: AtomicU64,
    /// Handle-cache lookup hits.
    pub table_cache_hits: AtomicU64,
    /// Handle-cache lookup misses.
    pub table_cache_misses: AtomicU64,
    /// Handle-cache entries pushed out by capacity.
    pub table_cache_evictions: AtomicU64,
    /// File+filter-cache lookup hits.
    pub file_cache_hits: AtomicU64,
    /// File+filter-cache lookup misses.
    pub file_cache_misses: AtomicU64,
    /// File+filter-cache entries pushed out by capacity.
    pub file_cache_evictions: AtomicU64,
    /// Nanoseconds spent acquiring cache handles.
    pub handle_acquire_nanos: AtomicU64,
    /// Nanoseconds spent querying the model for position ranges.
    pub model_query_nanos: AtomicU64,
    /// Nanoseconds spent in entry-range reads.
    pub block_read_nanos: AtomicU64,
    /// Nanoseconds spent binary-searching entry ranges.
    pub search_nanos: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time_handle_acquire(&self) -> TimerGuard<'_> {
        TimerGuard::new(&self.handle_acquire_nanos)
    }

    pub fn time_model_query(&self) -> TimerGuard<'_> {
        TimerGuard::new(&self.model_query_nanos)
    }

    pub fn time_block_read(&self) -> TimerGuard<'_> {
        TimerGuard::new(&self.block_read_nanos)
    }

    pub fn time_search(&self) -> TimerGuard<'_> {
        TimerGuard::new(&self.search_nanos)
    }

    /// Records a cache's (hits, misses, evictions) counters. The caches
    /// track their own counts; this copies the current values into the
    /// snapshot so `report` covers them.
    pub fn record_table_cache(&self, (hits, misses, evictions): (u64, u64, u64)) {
        self.table_cache_hits.store(hits, Ordering::Relaxed);
        self.table_cache_misses.store(misses, Ordering::Relaxed);
        self.table_cache_evictions.store(evictions, Ordering::Relaxed);
    }

    pub fn record_file_cache(&self, (hits, misses, evictions): (u64, u64, u64)) {
        self.file_cache_hits.store(hits, Ordering::Relaxed);
        self.file_cache_misses.store(misses, Ordering::Relaxed);
        self.file_cache_evictions.store(evictions, Ordering::Relaxed);
    }

    /// Emits one structured event with the current samples.
    pub fn report(&self) {
        tracing::info!(
            learned_reads = self.learned_reads.load(Ordering::Relaxed),
            conventional_reads = self.conventional_reads.load(Ordering::Relaxed),
            filter_misses = self.filter_misses.load(Ordering::Relaxed),
            blocks_read = self.blocks_read.load(Ordering::Relaxed),
            table_cache_hits = self.table_cache_hits.load(Ordering::Relaxed),
            table_cache_misses = self.table_cache_misses.load(Ordering::Relaxed),
            table_cache_evictions = self.table_cache_evictions.load(Ordering::Relaxed),
            file_cache_hits = self.file_cache_hits.load(Ordering::Relaxed),
            file_cache_misses = self.file_cache_misses.load(Ordering::Relaxed),
            file_cache_evictions = self.file_cache_evictions.load(Ordering::Relaxed),
            handle_acquire_nanos = self.handle_acquire_nanos.load(Ordering::Relaxed),
            model_query_nanos = self.model_query_nanos.load(Ordering::Relaxed),
            block_read_nanos = self.block_read_nanos.load(Ordering::Relaxed),
            search_nanos = self.search_nanos.load(Ordering::Relaxed),
            "table cache stats"
        );
    }
}

/// Accumulates wall time into a counter when dropped.
pub struct TimerGuard<'a> {
    total: &'a AtomicU64,
    start: Instant,
}

impl<'a> TimerGuard<'a> {
    fn new(total: &'a AtomicU64) -> Self {
        Self {
            total,
            start: Instant::now(),
        }
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.total
            .fetch_add(self.start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_accumulates() {
        let stats = Stats::new();
        {
            let _guard = stats.time_block_read();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(stats.block_read_nanos.load(Ordering::Relaxed) >= 1_000_000);
    }

    #[test]
    fn test_counters_start_at_zero() {
        let stats = Stats::new();
        assert_eq!(stats.learned_reads.load(Ordering::Relaxed), 0);
        assert_eq!(stats.filter_misses.load(Ordering::Relaxed), 0);
    }
}
