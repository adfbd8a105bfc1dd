use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::errdata;
use crate::error::Result;

/// A positionally-addressed file shared between readers and the single
/// writer. All access goes through pread/pwrite so no seek state is shared.
#[derive(Debug)]
pub struct Fio {
    file: File,
    size: AtomicI64,
    path: PathBuf,
}

impl Fio {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let size = file.metadata()?.len() as i64;
        Ok(Self {
            file,
            size: AtomicI64::new(size),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn read_at(&self, buf: &mut [u8], off: i64) -> Result<()> {
        if off < 0 {
            return errdata!("read at negative offset {off}");
        }
        self.file.read_exact_at(buf, off as u64)?;
        Ok(())
    }

    /// Returns an owned copy of the bytes in `[start, end)`.
    pub fn slice(&self, start: i64, end: i64) -> Result<Vec<u8>> {
        if start < 0 || end < start {
            return errdata!("invalid slice range {start}..{end}");
        }
        let mut buf = vec![0u8; (end - start) as usize];
        self.read_at(&mut buf, start)?;
        Ok(buf)
    }

    /// Writes at the given offset, extending the tracked size when the write
    /// lands past the current end of file.
    pub fn write_at(&self, buf: &[u8], off: i64) -> Result<()> {
        if off < 0 {
            return errdata!("write at negative offset {off}");
        }
        self.file.write_all_at(buf, off as u64)?;
        self.size.fetch_max(off + buf.len() as i64, Ordering::AcqRel);
        Ok(())
    }

    /// Grows the file by `by` bytes and returns the previous end of file.
    pub fn extend(&self, by: i64) -> Result<i64> {
        let old = self.size.fetch_add(by, Ordering::AcqRel);
        self.file.set_len((old + by) as u64)?;
        Ok(old)
    }

    pub fn truncate(&self, len: i64) -> Result<()> {
        self.file.set_len(len as u64)?;
        self.size.store(len, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
