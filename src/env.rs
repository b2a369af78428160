//! Filesystem abstraction consumed by the read path.
//!
//! Table files are immutable once written, so the only operation the read
//! path needs is a positional read against an open file. The `Env` trait
//! lets tests substitute instrumented filesystems; production code uses
//! `SystemEnv`.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A file opened for positional reads. Implementations must support
/// concurrent `read_at` calls from multiple threads against one handle.
pub trait RandomAccessFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset` and returns the
    /// number of bytes read. A short count means end of file was reached.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Opens table files for reading.
pub trait Env: Send + Sync {
    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;

    /// Same byte semantics as `new_random_access_file`. The hint tells the
    /// implementation the file will be probed at predicted offsets, so
    /// sequential readahead is wasted effort.
    fn new_random_access_file_learned(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;
}

/// Canonical table file name: `<number>.sst`.
pub fn table_file_path(dir: &Path, file_number: u64) -> PathBuf {
    dir.join(format!("{file_number:06}.sst"))
}

/// Legacy table file name: `<number>.tbl`. Databases written before the
/// extension change are still readable through this fallback.
pub fn legacy_file_path(dir: &Path, file_number: u64) -> PathBuf {
    dir.join(format!("{file_number:06}.tbl"))
}

/// The real filesystem.
pub struct SystemEnv;

impl Env for SystemEnv {
    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        Ok(Box::new(SystemFile { file }))
    }

    fn new_random_access_file_learned(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        // The standard library exposes no readahead control; the hint is a
        // no-op here but preserved for instrumented environments.
        self.new_random_access_file(path)
    }
}

struct SystemFile {
    file: File,
}

impl RandomAccessFile for SystemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            let n = positional_read(&self.file, offset + read as u64, &mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }
}

#[cfg(unix)]
fn positional_read(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    loop {
        match file.read_at(buf, offset) {
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(windows)]
fn positional_read(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_at() {
        let mut tmp = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        tmp.write_all(b"0123456789").expect("Failed to write");
        tmp.flush().expect("Failed to flush");

        let env = SystemEnv;
        let file = env
            .new_random_access_file(tmp.path())
            .expect("Failed to open");

        let mut buf = [0u8; 4];
        let n = file.read_at(3, &mut buf).expect("Failed to read");
        assert_eq!(n, 4);
        assert_eq!(&buf, b"3456");

        // Reads past the end are short, not errors.
        let n = file.read_at(8, &mut buf).expect("Failed to read");
        assert_eq!(n, 2);
        assert_eq!(&buf[..n], b"89");

        let n = file.read_at(100, &mut buf).expect("Failed to read");
        assert_eq!(n, 0);
    }

    #[test]
    fn test_missing_file() {
        let env = SystemEnv;
        assert!(env
            .new_random_access_file(Path::new("/nonexistent/000001.sst"))
            .is_err());
    }

    #[test]
    fn test_file_names() {
        let dir = Path::new("/data/db");
        assert_eq!(
            table_file_path(dir, 42),
            PathBuf::from("/data/db/000042.sst")
        );
        assert_eq!(
            legacy_file_path(dir, 42),
            PathBuf::from("/data/db/000042.tbl")
        );
    }
}
