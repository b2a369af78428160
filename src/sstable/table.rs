//! Table file reader.
//!
//! A table is opened from its tail inward: footer, then index block, then
//! (when a filter policy is configured) the metaindex and filter blocks.
//! Open failures close the file and cache nothing, so a transient error or
//! a repaired file recovers on the next attempt.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::config::Config;
use crate::env::RandomAccessFile;
use crate::errcorrupt;
use crate::error::Result;
use crate::sstable::block::{crc32, Block, BlockIterator};
use crate::sstable::filter::{FilterBlockReader, FilterPolicy};
use crate::sstable::footer::{BlockHandle, Footer, FOOTER_SIZE};
use crate::sstable::index::Index;

/// Receives the candidate entry of a point lookup.
///
/// The read paths hand each candidate entry to the sink exactly once; the
/// sink decides whether it matches and remembers the outcome. `is_found`
/// lets the learned path stop probing further blocks.
pub trait LookupSink {
    fn accept(&mut self, key: &[u8], value: &[u8]);
    fn is_found(&self) -> bool;
}

/// Standard sink: records the value of an exact key match.
pub struct ValueSink {
    target: Vec<u8>,
    value: Option<Vec<u8>>,
}

impl ValueSink {
    pub fn new(target: &[u8]) -> Self {
        Self {
            target: target.to_vec(),
            value: None,
        }
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        self.value
    }
}

impl LookupSink for ValueSink {
    fn accept(&mut self, key: &[u8], value: &[u8]) {
        if self.value.is_none() && key == self.target {
            self.value = Some(value.to_vec());
        }
    }

    fn is_found(&self) -> bool {
        self.value.is_some()
    }
}

/// Reads a block region and verifies its checksum trailer, returning the
/// contents with the trailer stripped.
pub(crate) fn read_block(file: &dyn RandomAccessFile, handle: BlockHandle) -> Result<Vec<u8>> {
    if handle.size < 4 {
        return errcorrupt!("block of {} bytes too short for a checksum", handle.size);
    }
    let mut buf = vec![0u8; handle.size as usize];
    let n = file.read_at(handle.offset, &mut buf)?;
    if n < buf.len() {
        return errcorrupt!(
            "truncated block read at offset {}: {n} of {} bytes",
            handle.offset,
            buf.len()
        );
    }
    let contents_len = buf.len() - 4;
    let expected = BigEndian::read_u32(&buf[contents_len..]);
    let actual = crc32(&buf[..contents_len]);
    if expected != actual {
        return errcorrupt!(
            "block checksum mismatch at offset {}: expected {expected:#x}, got {actual:#x}",
            handle.offset
        );
    }
    buf.truncate(contents_len);
    Ok(buf)
}

/// Reads the footer of a table file.
pub(crate) fn read_footer(file: &dyn RandomAccessFile, file_size: u64) -> Result<Footer> {
    if file_size < FOOTER_SIZE as u64 {
        return errcorrupt!("file of {file_size} bytes too short for a footer");
    }
    let mut buf = [0u8; FOOTER_SIZE];
    let n = file.read_at(file_size - FOOTER_SIZE as u64, &mut buf)?;
    if n < FOOTER_SIZE {
        return errcorrupt!("truncated footer read: {n} of {FOOTER_SIZE} bytes");
    }
    Footer::decode(&buf, file_size)
}

/// Loads the filter block named by the metaindex. The entry keyed
/// `"filter." + policy name` must be present and must match exactly.
pub(crate) fn read_filter(
    file: &dyn RandomAccessFile,
    footer: &Footer,
    policy: Arc<dyn FilterPolicy>,
) -> Result<FilterBlockReader> {
    let contents = read_block(file, footer.metaindex)?;
    let metaindex = Arc::new(Block::new(contents)?);
    let name = format!("filter.{}", policy.name());

    let mut iter = metaindex.iter();
    iter.seek(name.as_bytes())?;
    match iter.next().transpose()? {
        Some((key, value)) if key == name.as_bytes() => {
            let handle = BlockHandle::decode_from(&value)?;
            let filter_contents = read_block(file, handle)?;
            FilterBlockReader::new(policy, filter_contents)
        }
        _ => errcorrupt!("metaindex has no entry for {name:?}"),
    }
}

/// An open, parsed table file.
pub struct Table {
    file: Arc<dyn RandomAccessFile>,
    index: Index,
    filter: Option<FilterBlockReader>,
}

impl Table {
    /// Opens a table file. Decode failures propagate as `Corruption`; the
    /// caller drops the file handle and must not cache the result.
    pub fn open(config: &Config, file: Arc<dyn RandomAccessFile>, file_size: u64) -> Result<Table> {
        let footer = read_footer(file.as_ref(), file_size)?;

        let index_contents = read_block(file.as_ref(), footer.index)?;
        let index = Index::try_from(index_contents.as_slice())?;

        // A table written without filters stays readable on the conventional
        // path; only the learned file cache insists on the filter block.
        let mut filter = None;
        if config.use_filter {
            if let Some(policy) = &config.filter_policy {
                match read_filter(file.as_ref(), &footer, policy.clone()) {
                    Ok(reader) => filter = Some(reader),
                    Err(err) => {
                        tracing::debug!(%err, "table has no usable filter block");
                    }
                }
            }
        }

        Ok(Table {
            file,
            index,
            filter,
        })
    }

    /// Point lookup through the block index. Invokes the sink at most once,
    /// with the first entry at or after `key` in the candidate block; the
    /// sink judges the match. Returns Ok whether or not the key is present.
    pub fn internal_get(&self, key: &[u8], sink: &mut dyn LookupSink) -> Result<()> {
        let Some(entry) = self.index.find(key) else {
            return Ok(());
        };
        if let Some(filter) = &self.filter {
            if !filter.key_may_match(entry.offset, key) {
                return Ok(());
            }
        }
        let handle = BlockHandle {
            offset: entry.offset,
            size: entry.size,
        };
        let block = Arc::new(Block::new(read_block(self.file.as_ref(), handle)?)?);
        let mut iter = block.iter();
        iter.seek(key)?;
        if let Some((found_key, value)) = iter.next().transpose()? {
            sink.accept(&found_key, &value);
        }
        Ok(())
    }

    /// Loads the data block at `index` position `block_index`.
    pub fn read_block_at(&self, block_index: usize) -> Result<Option<BlockIterator>> {
        let Some((offset, size)) = self.index.get(block_index) else {
            return Ok(None);
        };
        let handle = BlockHandle { offset, size };
        let block = Arc::new(Block::new(read_block(self.file.as_ref(), handle)?)?);
        Ok(Some(block.iter()))
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn filter(&self) -> Option<&FilterBlockReader> {
        self.filter.as_ref()
    }
}
