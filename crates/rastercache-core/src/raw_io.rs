//! Positional file access for raw raster data
//!
//! - plain files use positional reads and writes, so concurrent block
//!   decodes never share a file cursor
//! - gzip-compressed files are inflated into memory at open and are
//!   read-only
//! - reads past the end of the data return zeros

use flate2::read::GzDecoder;
use parking_lot::{Mutex, MutexGuard};
use rastercache_common::{Access, Error, Result};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

enum Backing {
    File(File),
    /// Inflated contents of a compressed file
    Memory(Vec<u8>),
}

/// Raw data file shared by the bands of one dataset
pub struct RawFile {
    path: PathBuf,
    backing: Backing,
    access: Access,
    size: AtomicU64,
    rmw: Mutex<()>,
}

impl RawFile {
    /// Open an existing data file
    ///
    /// Compressed files can only be opened read-only.
    pub fn open(path: impl AsRef<Path>, access: Access, compressed: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if compressed {
            if access == Access::Update {
                return Err(Error::configuration(format!(
                    "{} is compressed and cannot be opened for update",
                    path.display()
                )));
            }
            let file = File::open(&path)?;
            let mut data = Vec::new();
            GzDecoder::new(file).read_to_end(&mut data).map_err(|e| {
                Error::configuration(format!("failed to inflate {}: {e}", path.display()))
            })?;
            debug!(path = %path.display(), bytes = data.len(), "inflated compressed raw file");
            return Ok(Self {
                size: AtomicU64::new(data.len() as u64),
                path,
                backing: Backing::Memory(data),
                access,
                rmw: Mutex::new(()),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(access == Access::Update)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            backing: Backing::File(file),
            access,
            size: AtomicU64::new(size),
            rmw: Mutex::new(()),
        })
    }

    /// Create or truncate a data file of `size` bytes
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        Ok(Self {
            path,
            backing: Backing::File(file),
            access: Access::Update,
            size: AtomicU64::new(size),
            rmw: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.backing, Backing::Memory(_))
    }

    /// Fill `buf` from `offset`, zero-filling whatever lies past the end
    ///
    /// Returns the number of bytes that came from the file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let read = match &self.backing {
            Backing::Memory(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                n
            }
            Backing::File(file) => {
                let mut done = 0;
                while done < buf.len() {
                    let n = positional_read(file, &mut buf[done..], offset + done as u64)?;
                    if n == 0 {
                        break;
                    }
                    done += n;
                }
                done
            }
        };
        buf[read..].fill(0);
        Ok(read)
    }

    /// Write all of `buf` at `offset`, growing the file if needed
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let Backing::File(file) = &self.backing else {
            return Err(Error::invalid_argument(format!(
                "{} is compressed and read-only",
                self.path.display()
            )));
        };
        if self.access != Access::Update {
            return Err(Error::invalid_argument(format!(
                "{} is opened read-only",
                self.path.display()
            )));
        }
        let mut done = 0;
        while done < buf.len() {
            let n = positional_write(file, &buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::from(std::io::ErrorKind::WriteZero)));
            }
            done += n;
        }
        self.size
            .fetch_max(offset + buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Serialise read-modify-write cycles on shared byte ranges
    pub fn lock_rmw(&self) -> MutexGuard<'_, ()> {
        self.rmw.lock()
    }

    /// Flush file contents to disk
    pub fn sync(&self) -> Result<()> {
        if let Backing::File(file) = &self.backing
            && self.access == Access::Update
        {
            file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    file.seek_write(buf, offset)
}

impl std::fmt::Debug for RawFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFile")
            .field("path", &self.path)
            .field("size", &self.size())
            .field("compressed", &self.is_compressed())
            .field("access", &self.access)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_read_past_end_is_zero_filled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, [1u8, 2, 3, 4]).unwrap();

        let file = RawFile::open(&path, Access::ReadOnly, false).unwrap();
        let mut buf = [0xffu8; 6];
        assert_eq!(file.read_at(2, &mut buf).unwrap(), 2);
        assert_eq!(buf, [3, 4, 0, 0, 0, 0]);
        assert_eq!(file.read_at(100, &mut buf).unwrap(), 0);
        assert_eq!(buf, [0; 6]);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let file = RawFile::create(&path, 8).unwrap();
        file.write_at(6, &[7, 8, 9]).unwrap();
        assert_eq!(file.size(), 9);

        let mut buf = [0u8; 4];
        file.read_at(5, &mut buf).unwrap();
        assert_eq!(buf, [0, 7, 8, 9]);
        file.sync().unwrap();
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, [0u8; 4]).unwrap();
        let file = RawFile::open(&path, Access::ReadOnly, false).unwrap();
        assert!(file.write_at(0, &[1]).is_err());
    }

    #[test]
    fn test_compressed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[10, 20, 30]).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        assert!(matches!(
            RawFile::open(&path, Access::Update, true),
            Err(Error::Configuration(_))
        ));
        let file = RawFile::open(&path, Access::ReadOnly, true).unwrap();
        assert!(file.is_compressed());
        assert_eq!(file.size(), 3);
        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(1, &mut buf).unwrap(), 2);
        assert_eq!(buf, [20, 30, 0, 0]);
        assert!(file.write_at(0, &[1]).is_err());
    }
}
