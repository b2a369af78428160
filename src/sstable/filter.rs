//! Per-block filters.
//!
//! A table file carries one probabilistic membership filter per data block,
//! packed into a single filter block keyed by block offset. The read path's
//! only question is `key_may_match(block_offset, key)`; a false positive
//! costs one wasted block read, a false negative would lose data and is
//! forbidden.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::errcorrupt;
use crate::error::Result;

/// Produces and probes per-block filters. `name()` keys the table's
/// metaindex entry; a reader must use the same policy the writer used.
pub trait FilterPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds a filter over `keys`, appending it to `dst`.
    fn create_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>);

    /// Whether `key` may be in the set `filter` was built from. Must return
    /// true for every key that was in the set.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter policy using double hashing.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    num_hashes: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // Optimal hash count is bits_per_key * ln(2).
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as usize;
        Self {
            bits_per_key,
            num_hashes: num_hashes.clamp(1, 30),
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "cinderdb.bloom"
    }

    fn create_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>) {
        let num_bits = (keys.len() * self.bits_per_key).max(64);
        let num_bytes = num_bits.div_ceil(8);
        let num_bits = num_bytes * 8;

        let start = dst.len();
        dst.resize(start + num_bytes, 0);
        for key in keys {
            let (h1, h2) = hash_pair(key);
            for i in 0..self.num_hashes {
                let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits as u64) as usize;
                dst[start + bit / 8] |= 1 << (bit % 8);
            }
        }
        // Hash count travels with the filter so readers with a different
        // bits_per_key still probe correctly.
        dst.push(self.num_hashes as u8);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return true;
        }
        let num_hashes = filter[filter.len() - 1] as usize;
        if num_hashes > 30 {
            // Reserved for future encodings; err on the may-match side.
            return true;
        }
        let bits = &filter[..filter.len() - 1];
        let num_bits = bits.len() * 8;

        let (h1, h2) = hash_pair(key);
        for i in 0..num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits as u64) as usize;
            if bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let h1 = fnv64(key);
    let h2 = h1.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(31);
    (h1, h2)
}

fn fnv64(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter()
        .fold(OFFSET, |hash, byte| (hash ^ *byte as u64).wrapping_mul(PRIME))
}

/// Builds the filter block for one table: one filter per data block, found
/// by dividing the block's byte offset by the block stride.
///
/// Layout: `[filter bytes]* [u32 filter start offset]* [u32 offset-array
/// position] [u32 block stride]`.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    block_stride: u32,
    keys: Vec<Vec<u8>>,
    filters: Vec<u8>,
    offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>, block_stride: u32) -> Self {
        Self {
            policy,
            block_stride,
            keys: Vec::new(),
            filters: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Called when the writer starts the data block at `block_offset`.
    /// Flushes filters for every block before it.
    pub fn start_block(&mut self, block_offset: u64) {
        let index = (block_offset / self.block_stride as u64) as usize;
        while self.offsets.len() < index {
            self.emit_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    fn emit_filter(&mut self) {
        self.offsets.push(self.filters.len() as u32);
        if !self.keys.is_empty() {
            self.policy.create_filter(&self.keys, &mut self.filters);
            self.keys.clear();
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.emit_filter();
        let array_start = self.filters.len() as u32;
        let mut out = self.filters;
        for offset in &self.offsets {
            out.write_u32::<BigEndian>(*offset).unwrap();
        }
        out.write_u32::<BigEndian>(array_start).unwrap();
        out.write_u32::<BigEndian>(self.block_stride).unwrap();
        out
    }
}

/// Probes a loaded filter block.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    array_start: usize,
    num_filters: usize,
    block_stride: u32,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, contents: Vec<u8>) -> Result<Self> {
        if contents.len() < 8 {
            return errcorrupt!("filter block of {} bytes too short", contents.len());
        }
        let n = contents.len();
        let block_stride = BigEndian::read_u32(&contents[n - 4..]);
        let array_start = BigEndian::read_u32(&contents[n - 8..n - 4]) as usize;
        if block_stride == 0 || array_start > n - 8 || (n - 8 - array_start) % 4 != 0 {
            return errcorrupt!("malformed filter block trailer");
        }
        let num_filters = (n - 8 - array_start) / 4;
        Ok(Self {
            policy,
            data: contents,
            array_start,
            num_filters,
            block_stride,
        })
    }

    /// Whether `key` may be present in the data block at `block_offset`.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset / self.block_stride as u64) as usize;
        if index >= self.num_filters {
            return true;
        }
        let start = BigEndian::read_u32(&self.data[self.array_start + 4 * index..]) as usize;
        let end = if index + 1 < self.num_filters {
            BigEndian::read_u32(&self.data[self.array_start + 4 * (index + 1)..]) as usize
        } else {
            self.array_start
        };
        if end > self.array_start || start > end {
            // Malformed filter region; err on the may-match side.
            return true;
        }
        if start == end {
            // An empty filter means the block had no keys at all.
            return false;
        }
        self.policy.key_may_match(key, &self.data[start..end])
    }
}
