use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::errcorrupt;
use crate::error::Result;

/// Location of a block within a table file. `size` includes the block's
/// checksum trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

pub const BLOCK_HANDLE_SIZE: usize = 16;

/// Fixed-size trailer at `file_size - FOOTER_SIZE`: the metaindex handle,
/// the index handle, and a magic number.
pub const FOOTER_SIZE: usize = 2 * BLOCK_HANDLE_SIZE + 8;

const TABLE_MAGIC: u64 = 0x8c3f_1db0_57ab_7e5d;

impl BlockHandle {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.offset).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
    }

    pub fn decode_from(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_HANDLE_SIZE {
            return errcorrupt!("block handle needs {BLOCK_HANDLE_SIZE} bytes, got {}", data.len());
        }
        Ok(Self {
            offset: BigEndian::read_u64(&data[0..8]),
            size: BigEndian::read_u64(&data[8..16]),
        })
    }

    /// Whether this handle lies entirely within the data region of a file
    /// of the given size (everything before the footer).
    fn fits_within(&self, file_size: u64) -> bool {
        let data_end = file_size.saturating_sub(FOOTER_SIZE as u64);
        self.offset
            .checked_add(self.size)
            .is_some_and(|end| end <= data_end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub metaindex: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex.encode_into(&mut buf);
        self.index.encode_into(&mut buf);
        buf.write_u64::<BigEndian>(TABLE_MAGIC).unwrap();
        buf
    }

    /// Decodes and sanity-checks a footer. `file_size` bounds both handles
    /// so a corrupt footer fails here rather than as a wild read later.
    pub fn decode(data: &[u8], file_size: u64) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return errcorrupt!("footer needs {FOOTER_SIZE} bytes, got {}", data.len());
        }
        let magic = BigEndian::read_u64(&data[2 * BLOCK_HANDLE_SIZE..]);
        if magic != TABLE_MAGIC {
            return errcorrupt!("bad table magic {magic:#x}");
        }
        let metaindex = BlockHandle::decode_from(&data[..BLOCK_HANDLE_SIZE])?;
        let index = BlockHandle::decode_from(&data[BLOCK_HANDLE_SIZE..2 * BLOCK_HANDLE_SIZE])?;
        for handle in [&metaindex, &index] {
            if !handle.fits_within(file_size) {
                return errcorrupt!(
                    "block handle ({}, {}) exceeds file of {file_size} bytes",
                    handle.offset,
                    handle.size
                );
            }
        }
        Ok(Self { metaindex, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            metaindex: BlockHandle { offset: 8192, size: 120 },
            index: BlockHandle { offset: 8312, size: 64 },
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);

        let decoded = Footer::decode(&encoded, 8376 + FOOTER_SIZE as u64).expect("Failed to decode");
        assert_eq!(decoded, footer);
    }

    #[test]
    fn test_footer_bad_magic() {
        let footer = Footer {
            metaindex: BlockHandle { offset: 0, size: 16 },
            index: BlockHandle { offset: 16, size: 16 },
        };
        let mut encoded = footer.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(Footer::decode(&encoded, 1024).is_err());
    }

    #[test]
    fn test_footer_rejects_out_of_bounds_handle() {
        let footer = Footer {
            metaindex: BlockHandle { offset: 1 << 40, size: 120 },
            index: BlockHandle { offset: 0, size: 64 },
        };
        let encoded = footer.encode();
        assert!(Footer::decode(&encoded, 4096).is_err());
    }
}
