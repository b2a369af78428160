use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errcorrupt;
use crate::error::{Error, Result};

const RESTART_INTERVAL: usize = 16;

/// Per-entry header: u16 shared prefix length, u16 unshared key length,
/// u32 value length.
pub const ENTRY_HEADER_SIZE: usize = 8;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub(crate) fn crc32(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// Total encoded size of one entry.
pub fn encoded_entry_len(key: &[u8], value: &[u8]) -> usize {
    ENTRY_HEADER_SIZE + key.len() + value.len()
}

/// Builds the entry region of one block: prefix-compressed entries followed
/// by the restart offset array and its count. Checksums are appended by the
/// table writer, not here.
pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    restart_interval: usize,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::with_restart_interval(RESTART_INTERVAL)
    }

    /// A restart interval of 1 disables prefix compression entirely: every
    /// entry is a restart point with `shared == 0`. Fixed-geometry data
    /// blocks are built this way so the learned path can decode entries at
    /// a fixed byte stride.
    pub fn with_restart_interval(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            restart_interval: restart_interval.max(1),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let shared_prefix_len = if self.entry_count % self.restart_interval == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };

        let unshared_key_len = key.len() - shared_prefix_len;
        self.buffer
            .write_u16::<BigEndian>(shared_prefix_len as u16)
            .unwrap();
        self.buffer
            .write_u16::<BigEndian>(unshared_key_len as u16)
            .unwrap();
        self.buffer.write_u32::<BigEndian>(value.len() as u32).unwrap();
        self.buffer.extend_from_slice(&key[shared_prefix_len..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

/// Decodes one fixed-stride entry starting at `data[offset..]`, returning
/// borrowed `(key, value)` slices. Entries read over the learned path must
/// never carry a shared prefix; one that does means the file was not
/// written with fixed geometry.
pub fn decode_fixed_entry(data: &[u8], offset: usize) -> Result<(&[u8], &[u8])> {
    if offset + ENTRY_HEADER_SIZE > data.len() {
        return errcorrupt!("entry header at offset {offset} out of bounds");
    }
    let shared = BigEndian::read_u16(&data[offset..]) as usize;
    let unshared = BigEndian::read_u16(&data[offset + 2..]) as usize;
    let value_len = BigEndian::read_u32(&data[offset + 4..]) as usize;
    if shared != 0 {
        return Err(Error::ModelInvariant(format!(
            "fixed-stride entry at offset {offset} has shared prefix length {shared}"
        )));
    }
    let key_start = offset + ENTRY_HEADER_SIZE;
    let value_start = key_start + unshared;
    if value_start + value_len > data.len() {
        return errcorrupt!("entry at offset {offset} out of bounds");
    }
    Ok((
        &data[key_start..value_start],
        &data[value_start..value_start + value_len],
    ))
}

/// A parsed block: entry data plus restart offsets. Input is the builder's
/// output with any checksum trailer already stripped.
#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return errcorrupt!("block of {} bytes too short for restart count", data.len());
        }
        let num_restarts_offset = data.len() - 4;
        let num_restarts = BigEndian::read_u32(&data[num_restarts_offset..]) as usize;

        let restart_array_size = num_restarts
            .checked_mul(4)
            .filter(|&size| size <= num_restarts_offset)
            .ok_or_else(|| {
                Error::Corruption(format!("block restart count {num_restarts} out of bounds"))
            })?;

        let restart_array_offset = num_restarts_offset - restart_array_size;
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for i in 0..num_restarts {
            restart_positions.push(BigEndian::read_u32(&data[restart_array_offset + 4 * i..]));
        }

        Ok(Self {
            data: data[..restart_array_offset].to_vec(),
            restart_positions,
        })
    }

    /// Looks up an exact key match.
    pub fn get(self: &Arc<Self>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut iter = self.clone().iter();
        iter.seek(key)?;
        match iter.next() {
            Some(Ok((found_key, value))) if found_key == key => Ok(Some(value)),
            Some(Err(err)) => Err(err),
            _ => Ok(None),
        }
    }

    pub fn iter(self: Arc<Self>) -> BlockIterator {
        BlockIterator::new(self)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    current_offset: usize,
    last_key: Vec<u8>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            current_offset: 0,
            last_key: Vec::new(),
        }
    }

    /// Reads just the key at a restart offset for comparisons, without
    /// touching iterator state. Restart entries never share a prefix.
    fn read_key_at(&self, offset: usize) -> Result<Vec<u8>> {
        let data = &self.block.data;
        if offset + ENTRY_HEADER_SIZE > data.len() {
            return errcorrupt!("restart entry at offset {offset} out of bounds");
        }
        let shared = BigEndian::read_u16(&data[offset..]) as usize;
        let unshared = BigEndian::read_u16(&data[offset + 2..]) as usize;
        if shared != 0 {
            return errcorrupt!("restart entry at offset {offset} has a shared prefix");
        }
        let key_start = offset + ENTRY_HEADER_SIZE;
        if key_start + unshared > data.len() {
            return errcorrupt!("restart entry at offset {offset} out of bounds");
        }
        Ok(data[key_start..key_start + unshared].to_vec())
    }

    /// Positions the iterator so the next `next()` returns the first entry
    /// with key >= `target`, or nothing if no such entry exists.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Binary search restart points for the region containing the target.
        let mut left = 0;
        let mut right = self.block.restart_positions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let key = self.read_key_at(self.block.restart_positions[mid] as usize)?;
            match key.as_slice().cmp(target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart_index = left.saturating_sub(1);

        self.current_offset = self
            .block
            .restart_positions
            .get(restart_index)
            .map_or(0, |&pos| pos as usize);
        self.last_key.clear();

        // Scan forward until positioned just before the first key >= target.
        loop {
            let saved_offset = self.current_offset;
            let saved_key = self.last_key.clone();
            match self.next() {
                Some(Ok((key, _))) if key.as_slice() < target => continue,
                Some(Ok(_)) => {
                    self.current_offset = saved_offset;
                    self.last_key = saved_key;
                    return Ok(());
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            }
        }
    }
}

impl Iterator for BlockIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = &self.block.data;
        if self.current_offset >= data.len() {
            return None;
        }

        let pos = self.current_offset;
        if pos + ENTRY_HEADER_SIZE > data.len() {
            return Some(errcorrupt!("entry header at offset {pos} out of bounds"));
        }
        let shared = BigEndian::read_u16(&data[pos..]) as usize;
        let unshared = BigEndian::read_u16(&data[pos + 2..]) as usize;
        let value_len = BigEndian::read_u32(&data[pos + 4..]) as usize;

        let key_start = pos + ENTRY_HEADER_SIZE;
        if shared > self.last_key.len() || key_start + unshared + value_len > data.len() {
            return Some(errcorrupt!("block entry at offset {pos} out of bounds"));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&data[key_start..key_start + unshared]);

        let value_start = key_start + unshared;
        let value = data[value_start..value_start + value_len].to_vec();

        self.current_offset = value_start + value_len;
        self.last_key.clear();
        self.last_key.extend_from_slice(&key);

        Some(Ok((key, value)))
    }
}
