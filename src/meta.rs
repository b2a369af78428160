use std::fmt;

/// Metadata for one immutable table file, supplied by the version set that
/// owns the file. The read path treats it as authoritative: `entry_count`
/// bounds learned-path positions, and a model whose entry count disagrees
/// with the metadata is never consulted.
#[derive(Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Monotonically assigned file number; never reused.
    pub number: u64,
    /// On-disk length in bytes.
    pub size: u64,
    /// Number of entries in the file.
    pub entry_count: u64,
    /// Smallest key in the file.
    pub min_key: Vec<u8>,
    /// Largest key in the file.
    pub max_key: Vec<u8>,
}

impl fmt::Debug for FileMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMeta")
            .field("number", &self.number)
            .field("size", &self.size)
            .field("entry_count", &self.entry_count)
            .field("min_key", &String::from_utf8_lossy(&self.min_key))
            .field("max_key", &String::from_utf8_lossy(&self.max_key))
            .finish()
    }
}
