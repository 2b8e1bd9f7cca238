//! Append-only data log
//!
//! The data log is a single flat file of serialized records. It knows
//! nothing about records or keys — the engine supplies absolute offsets on
//! every call and owns the append cursor, seeded from the file length at
//! open. The only structural operations are truncation (during `clear`) and
//! descriptor replacement (after compaction's atomic rename).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{SiltError, SiltResult};
use crate::sync::sync_file;

/// Handle to the data log file.
pub struct DataLog {
    file: File,
    path: PathBuf,
}

impl DataLog {
    /// Open or create the data log. Returns the handle and the current file
    /// length, which the engine adopts as its append cursor.
    pub fn open<P: AsRef<Path>>(path: P) -> SiltResult<(Self, u64)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| SiltError::io_at(&path, "Failed to open data log", e))?;

        let len = file
            .metadata()
            .map_err(|e| SiltError::io_at(&path, "Failed to stat data log", e))?
            .len();

        Ok((Self { file, path }, len))
    }

    /// Create an empty log, truncating any file already at `path`. Used for
    /// the compaction scratch file.
    pub fn create<P: AsRef<Path>>(path: P) -> SiltResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SiltError::io_at(&path, "Failed to create data log", e))?;
        Ok(Self { file, path })
    }

    /// Write `bytes` at the given absolute offset and return that offset.
    ///
    /// The engine only ever appends at its cursor; the explicit offset keeps
    /// this layer stateless and makes torn-flush recovery reasoning local to
    /// the engine.
    pub fn append_at(&mut self, offset: u64, bytes: &[u8]) -> SiltResult<u64> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| SiltError::io_at(&self.path, "Failed to seek data log", e))?;
        self.file
            .write_all(bytes)
            .map_err(|e| SiltError::io_at(&self.path, "Data log write failed", e))?;
        Ok(offset)
    }

    /// Read exactly `size` bytes starting at `offset`.
    ///
    /// A record that runs past the end of the file is a short read, reported
    /// with the byte counts involved.
    pub fn read_exact_at(&mut self, offset: u64, size: u32) -> SiltResult<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| SiltError::io_at(&self.path, "Failed to seek data log", e))?;

        let mut buf = vec![0u8; size as usize];
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let len = self.len().unwrap_or(0);
                Err(SiltError::ShortRead {
                    path: self.path.clone(),
                    offset,
                    wanted: size,
                    available: len.saturating_sub(offset),
                })
            }
            Err(e) => Err(SiltError::io_at(&self.path, "Data log read failed", e)),
        }
    }

    /// Empty the file. Only `clear` calls this.
    pub fn truncate(&mut self) -> SiltResult<()> {
        self.file
            .set_len(0)
            .map_err(|e| SiltError::io_at(&self.path, "Failed to truncate data log", e))?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| SiltError::io_at(&self.path, "Failed to rewind data log", e))?;
        Ok(())
    }

    /// Swap the underlying descriptor for a fresh open of `path`. Called
    /// after compaction renames its scratch file over the log. Returns the
    /// new file length.
    pub fn reopen<P: AsRef<Path>>(&mut self, path: P) -> SiltResult<u64> {
        let (fresh, len) = Self::open(path)?;
        self.file = fresh.file;
        self.path = fresh.path;
        Ok(len)
    }

    /// Force written records to persistent storage.
    pub fn sync(&self) -> SiltResult<()> {
        sync_file(&self.file)
            .map_err(|e| SiltError::io_at(&self.path, "Data log sync failed", e))
    }

    /// Current on-disk length.
    pub fn len(&self) -> SiltResult<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| SiltError::io_at(&self.path, "Failed to stat data log", e))?
            .len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
