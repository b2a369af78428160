//! Table file writer.
//!
//! Data blocks are laid out at a fixed byte stride so the learned path can
//! address block `k` at `k * block_size` without consulting the index:
//! every block holds at most `block_num_entries` entries of exactly
//! `entry_size` encoded bytes, written with prefix compression disabled,
//! and is zero-padded out to `block_size`. The index, metaindex, filter
//! block, and footer follow the last data block.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};

use crate::config::Config;
use crate::errinput;
use crate::error::Result;
use crate::meta::FileMeta;
use crate::sstable::block::{self, crc32, encoded_entry_len};
use crate::sstable::filter::FilterBlockBuilder;
use crate::sstable::footer::{BlockHandle, Footer, FOOTER_SIZE};
use crate::sstable::index::Index;

pub struct TableBuilder<W: Write> {
    writer: W,
    config: Config,
    file_number: u64,
    block: block::Builder,
    block_first_key: Option<Vec<u8>>,
    filter: Option<FilterBlockBuilder>,
    index: Index,
    last_key: Option<Vec<u8>>,
    min_key: Option<Vec<u8>>,
    entry_count: u64,
    num_blocks: u64,
    offset: u64,
}

impl<W: Write> TableBuilder<W> {
    pub fn new(writer: W, file_number: u64, config: Config) -> Result<Self> {
        config.validate()?;
        let filter = config
            .filter_policy
            .as_ref()
            .map(|policy| FilterBlockBuilder::new(policy.clone(), config.block_size as u32));
        Ok(Self {
            writer,
            config,
            file_number,
            block: block::Builder::with_restart_interval(1),
            block_first_key: None,
            filter,
            index: Index::new(),
            last_key: None,
            min_key: None,
            entry_count: 0,
            num_blocks: 0,
            offset: 0,
        })
    }

    /// Appends an entry. Keys must arrive in strictly ascending order and
    /// every entry must encode to exactly `entry_size` bytes.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return errinput!("keys must be added in strictly ascending order");
            }
        }
        let encoded = encoded_entry_len(key, value);
        if encoded != self.config.entry_size {
            return errinput!(
                "entry encodes to {encoded} bytes, geometry requires {}",
                self.config.entry_size
            );
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
            if let Some(filter) = &mut self.filter {
                filter.start_block(self.num_blocks * self.config.block_size as u64);
            }
        }
        if let Some(filter) = &mut self.filter {
            filter.add_key(key);
        }
        self.block.add_entry(key, value);

        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.last_key = Some(key.to_vec());
        self.entry_count += 1;

        if self.block.entry_count() == self.config.block_num_entries {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Writes the current data block at its fixed stride offset, padded to
    /// `block_size`. No-op when the block is empty.
    fn flush_block(&mut self) -> Result<()> {
        let Some(first_key) = self.block_first_key.take() else {
            return Ok(());
        };
        let block = std::mem::replace(&mut self.block, block::Builder::with_restart_interval(1));
        let mut data = block.finish();
        data.write_u32::<BigEndian>(crc32(&data)).unwrap();

        // Geometry validation guarantees a full block fits the stride.
        let block_offset = self.num_blocks * self.config.block_size as u64;
        self.index.push(first_key, block_offset, data.len() as u64);

        let pad = self.config.block_size - data.len();
        self.writer.write_all(&data)?;
        self.writer.write_all(&vec![0u8; pad])?;
        self.offset += self.config.block_size as u64;
        self.num_blocks += 1;
        Ok(())
    }

    /// Writes `contents` with a checksum trailer at the current offset.
    fn emit_block(&mut self, mut contents: Vec<u8>) -> Result<BlockHandle> {
        contents.write_u32::<BigEndian>(crc32(&contents)).unwrap();
        let handle = BlockHandle {
            offset: self.offset,
            size: contents.len() as u64,
        };
        self.writer.write_all(&contents)?;
        self.offset += contents.len() as u64;
        Ok(handle)
    }

    /// Writes the tail block, filter, metaindex, index, and footer, and
    /// returns the finished file's metadata.
    pub fn finish(mut self) -> Result<FileMeta> {
        self.flush_block()?;

        let mut metaindex = block::Builder::new();
        if let Some(filter) = self.filter.take() {
            let name = format!("filter.{}", filter.policy_name());
            let handle = self.emit_block(filter.finish())?;
            let mut encoded = Vec::new();
            handle.encode_into(&mut encoded);
            metaindex.add_entry(name.as_bytes(), &encoded);
        }
        let metaindex_handle = self.emit_block(metaindex.finish())?;

        let mut index_buf = Vec::new();
        self.index.encode_into(&mut index_buf);
        let index_handle = self.emit_block(index_buf)?;

        let footer = Footer {
            metaindex: metaindex_handle,
            index: index_handle,
        };
        self.writer.write_all(&footer.encode())?;
        self.offset += FOOTER_SIZE as u64;
        self.writer.flush()?;

        Ok(FileMeta {
            number: self.file_number,
            size: self.offset,
            entry_count: self.entry_count,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.last_key.unwrap_or_default(),
        })
    }
}
