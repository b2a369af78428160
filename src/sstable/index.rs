//! Block index for the conventional read path.

use std::convert::TryFrom;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// An entry in the block index, describing a single data block.
#[derive(Debug)]
pub struct Entry<'a> {
    /// Position of the block in the file's block sequence.
    pub index: usize,
    /// First key of the block.
    pub key: &'a [u8],
    /// Byte offset of the block.
    pub offset: u64,
    /// Byte size of the block, checksum trailer included.
    pub size: u64,
}

/// The block index of a table: an ordered list of `(first_key, offset,
/// size)` triples, one per data block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
    entries: Vec<(Vec<u8>, u64, u64)>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: Vec<u8>, offset: u64, size: u64) {
        self.entries.push((key, offset, size));
    }

    /// Finds the data block that may contain the given key: the block whose
    /// first key is the greatest one not exceeding `key`. Returns None when
    /// the key sorts before every block.
    pub fn find(&self, key: &[u8]) -> Option<Entry> {
        let idx = self.entries.partition_point(|(first, _, _)| first.as_slice() <= key);
        if idx == 0 {
            return None;
        }
        let (first, offset, size) = &self.entries[idx - 1];
        Some(Entry {
            index: idx - 1,
            key: first,
            offset: *offset,
            size: *size,
        })
    }

    /// Offset and size of the block at `index`, if any.
    pub fn get(&self, index: usize) -> Option<(u64, u64)> {
        self.entries
            .get(index)
            .map(|(_, offset, size)| (*offset, *size))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        for (key, offset, size) in &self.entries {
            buf.write_u16::<BigEndian>(key.len() as u16).unwrap();
            buf.extend_from_slice(key);
            buf.write_u64::<BigEndian>(*offset).unwrap();
            buf.write_u64::<BigEndian>(*size).unwrap();
        }
    }
}

impl TryFrom<&[u8]> for Index {
    type Error = Error;

    fn try_from(buffer: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buffer);
        let mut entries = Vec::new();

        while (cursor.position() as usize) < buffer.len() {
            let key_len = cursor
                .read_u16::<BigEndian>()
                .map_err(|e| Error::Corruption(format!("key length in index block: {e}")))?
                as usize;

            let mut key = vec![0u8; key_len];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::Corruption(format!("key in index block: {e}")))?;

            let offset = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Corruption(format!("block offset in index block: {e}")))?;

            let size = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Corruption(format!("block size in index block: {e}")))?;

            entries.push((key, offset, size));
        }
        Ok(Self { entries })
    }
}
