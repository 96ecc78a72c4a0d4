#[allow(unused_imports)]
use super::*;

use std::any::Any;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Byte-addressed backing store of a simulated disk.
pub trait DiskDevice: Send + Sync + Any {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn path(&self) -> &Path;
}

/// A regular file standing in for a disk.
///
/// Every access opens the file, seeks, transfers once and closes the handle.
/// Nothing is cached between accesses.
pub struct DiskFile {
    path: PathBuf,
    // one writer at a time per image
    lock: Mutex<()>,
}

impl DiskFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("disk {} does not exist", path.display()),
            ));
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Create a zero-filled image of `size` bytes, parent directories included.
    pub fn create(path: impl AsRef<Path>, size: u64) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut file = File::create(path)?;
        let chunk = vec![0u8; 1024 * 1024];
        let mut left = size;
        while left > 0 {
            let n = left.min(chunk.len() as u64) as usize;
            file.write_all(&chunk[..n])?;
            left -= n as u64;
        }
        file.sync_all()?;
        Self::open(path)
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // guards (), so poisoning is harmless
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DiskDevice for DiskFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let _guard = self.guard();
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let _guard = self.guard();
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScratchDisk;

    #[test]
    fn create_zero_fills_and_round_trips_bytes() {
        let scratch = ScratchDisk::new();
        let disk = DiskFile::create(scratch.path(), 4096).unwrap();
        assert_eq!(disk.len().unwrap(), 4096);

        let mut buf = [0xffu8; 8];
        disk.read_at(4000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);

        disk.write_at(100, b"abc").unwrap();
        let mut back = [0u8; 3];
        disk.read_at(100, &mut back).unwrap();
        assert_eq!(&back, b"abc");
    }

    #[test]
    fn reading_past_the_end_fails() {
        let scratch = ScratchDisk::new();
        let disk = DiskFile::create(scratch.path(), 16).unwrap();
        let mut buf = [0u8; 8];
        assert!(disk.read_at(12, &mut buf).is_err());
    }

    #[test]
    fn open_missing_disk_fails() {
        let scratch = ScratchDisk::new();
        assert!(DiskFile::open(scratch.path()).is_err());
    }
}
