//! Write-ahead log for index mutations
//!
//! The WAL records what changed in the index, not the data itself — data
//! records are already in the data log by the time their WAL entry is
//! written. Each entry:
//!
//! ```text
//! [op:u8][key_len:u32 LE][key bytes]                      op = DELETE (2)
//! [op:u8][key_len:u32 LE][key bytes][meta_len:u32 LE][meta JSON]  op = SET (1)
//! ```
//!
//! Replay walks entries from offset 0 and stops at the first truncated or
//! malformed entry: everything before the stop point is applied, the tail is
//! discarded. A torn tail is the expected shape of a crash, not corruption
//! worth failing the open over.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{SiltError, SiltResult};
use crate::index::RecordMeta;
use crate::sync::sync_file;

/// Install-or-update entry
pub const OP_SET: u8 = 1;
/// Removal entry
pub const OP_DELETE: u8 = 2;

/// One decoded WAL entry.
#[derive(Debug, Clone, PartialEq)]
pub enum WalOp {
    Set { key: String, meta: RecordMeta },
    Delete { key: String },
}

/// Append a SET entry to `buf`.
pub fn encode_set(buf: &mut Vec<u8>, key: &str, meta: &RecordMeta) -> SiltResult<()> {
    let meta_json = serde_json::to_vec(meta).map_err(|e| SiltError::Serialization {
        message: format!("Failed to encode record metadata: {}", e),
    })?;
    buf.push(OP_SET);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
    buf.extend_from_slice(&meta_json);
    Ok(())
}

/// Append a DELETE entry to `buf`.
pub fn encode_delete(buf: &mut Vec<u8>, key: &str) {
    buf.push(OP_DELETE);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
}

/// Why replay stopped before the end of the buffer.
#[derive(Debug, Clone)]
pub struct ReplayHalt {
    /// Offset of the first entry that could not be applied
    pub offset: u64,
    /// What was wrong with it
    pub reason: String,
}

/// Outcome of scanning a WAL buffer.
#[derive(Debug)]
pub struct Replay {
    /// Entries decoded in order, each with the offset it started at
    pub ops: Vec<(u64, WalOp)>,
    /// Present when a truncated or malformed entry cut the scan short
    pub halt: Option<ReplayHalt>,
}

impl Replay {
    /// Offset of the last cleanly decoded entry boundary. The file is valid
    /// up to here; anything beyond is the discarded tail.
    pub fn good_len(&self, total: u64) -> u64 {
        match &self.halt {
            Some(halt) => halt.offset,
            None => total,
        }
    }
}

/// Decode every entry in `buf`, stopping at the first one that does not
/// parse. Never fails: a broken tail is reported, not raised.
pub fn replay(buf: &[u8]) -> Replay {
    let mut ops = Vec::new();
    let mut offset = 0usize;

    loop {
        if offset == buf.len() {
            return Replay { ops, halt: None };
        }
        let entry_start = offset as u64;

        let halt = |reason: String| Replay {
            ops: Vec::new(),
            halt: Some(ReplayHalt { offset: entry_start, reason }),
        };

        let op = buf[offset];
        if op != OP_SET && op != OP_DELETE {
            let mut out = halt(format!("unknown op byte {:#04x}", op));
            out.ops = ops;
            return out;
        }

        let (key, after_key) = match read_chunk(buf, offset + 1) {
            Some(chunk) => chunk,
            None => {
                let mut out = halt("truncated key".to_string());
                out.ops = ops;
                return out;
            }
        };
        let key = match std::str::from_utf8(key) {
            Ok(key) => key.to_string(),
            Err(_) => {
                let mut out = halt("key is not UTF-8".to_string());
                out.ops = ops;
                return out;
            }
        };

        if op == OP_DELETE {
            ops.push((entry_start, WalOp::Delete { key }));
            offset = after_key;
            continue;
        }

        let (meta_json, after_meta) = match read_chunk(buf, after_key) {
            Some(chunk) => chunk,
            None => {
                let mut out = halt("truncated metadata".to_string());
                out.ops = ops;
                return out;
            }
        };
        let meta: RecordMeta = match serde_json::from_slice(meta_json) {
            Ok(meta) => meta,
            Err(e) => {
                let mut out = halt(format!("metadata JSON is invalid: {}", e));
                out.ops = ops;
                return out;
            }
        };

        ops.push((entry_start, WalOp::Set { key, meta }));
        offset = after_meta;
    }
}

/// Read a `[len:u32 LE][bytes]` chunk. None if the buffer ends first.
fn read_chunk(buf: &[u8], at: usize) -> Option<(&[u8], usize)> {
    let len_end = at.checked_add(4)?;
    if len_end > buf.len() {
        return None;
    }
    let len = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize;
    let data_end = len_end.checked_add(len)?;
    if data_end > buf.len() {
        return None;
    }
    Some((&buf[len_end..data_end], data_end))
}

/// Handle to the WAL file.
pub struct WalFile {
    file: File,
    path: PathBuf,
}

impl WalFile {
    /// Open or create the WAL. Returns the handle and current length.
    pub fn open<P: AsRef<Path>>(path: P) -> SiltResult<(Self, u64)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| SiltError::io_at(&path, "Failed to open WAL", e))?;
        let len = file
            .metadata()
            .map_err(|e| SiltError::io_at(&path, "Failed to stat WAL", e))?
            .len();
        Ok((Self { file, path }, len))
    }

    /// Append a flushed batch at the end of the file.
    pub fn append(&mut self, bytes: &[u8]) -> SiltResult<()> {
        self.file
            .seek(SeekFrom::End(0))
            .map_err(|e| SiltError::io_at(&self.path, "Failed to seek WAL", e))?;
        self.file
            .write_all(bytes)
            .map_err(|e| SiltError::io_at(&self.path, "WAL write failed", e))
    }

    /// Read the whole file for replay.
    pub fn read_all(&mut self) -> SiltResult<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| SiltError::io_at(&self.path, "Failed to rewind WAL", e))?;
        let mut buf = Vec::new();
        self.file
            .read_to_end(&mut buf)
            .map_err(|e| SiltError::io_at(&self.path, "Failed to read WAL", e))?;
        Ok(buf)
    }

    /// Cut the file to `len` bytes. `0` after a checkpoint; a replay
    /// boundary after recovering past a torn tail.
    pub fn truncate_to(&mut self, len: u64) -> SiltResult<()> {
        self.file
            .set_len(len)
            .map_err(|e| SiltError::io_at(&self.path, "Failed to truncate WAL", e))
    }

    /// Force appended entries to persistent storage.
    pub fn sync(&self) -> SiltResult<()> {
        sync_file(&self.file).map_err(|e| SiltError::io_at(&self.path, "WAL sync failed", e))
    }

    /// On-disk length, consulted to resynchronize the in-memory size
    /// counter after a failed write.
    pub fn stat_len(&self) -> SiltResult<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| SiltError::io_at(&self.path, "Failed to stat WAL", e))?
            .len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeTag;
    use tempfile::TempDir;

    fn meta(offset: u64, size: u32, expiry: Option<u64>) -> RecordMeta {
        RecordMeta { offset, size, tag: TypeTag::String, expiry }
    }

    #[test]
    fn test_roundtrip_batch() {
        let mut buf = Vec::new();
        encode_set(&mut buf, "alpha", &meta(0, 11, None)).unwrap();
        encode_set(&mut buf, "beta", &meta(11, 6, Some(99_000))).unwrap();
        encode_delete(&mut buf, "alpha");

        let replay = replay(&buf);
        assert!(replay.halt.is_none());
        assert_eq!(replay.ops.len(), 3);
        assert_eq!(replay.ops[0].0, 0);
        assert_eq!(replay.ops[0].1, WalOp::Set { key: "alpha".into(), meta: meta(0, 11, None) });
        assert_eq!(
            replay.ops[1].1,
            WalOp::Set { key: "beta".into(), meta: meta(11, 6, Some(99_000)) }
        );
        assert_eq!(replay.ops[2].1, WalOp::Delete { key: "alpha".into() });
    }

    #[test]
    fn test_torn_tail_stops_at_boundary() {
        let mut buf = Vec::new();
        encode_set(&mut buf, "whole", &meta(0, 8, None)).unwrap();
        let boundary = buf.len() as u64;
        encode_set(&mut buf, "partial", &meta(8, 8, None)).unwrap();
        buf.truncate(boundary as usize + 7); // cut mid-entry

        let replay = replay(&buf);
        assert_eq!(replay.ops.len(), 1);
        let halt = replay.halt.as_ref().expect("tail should halt replay");
        assert_eq!(halt.offset, boundary);
        assert_eq!(replay.good_len(buf.len() as u64), boundary);
    }

    #[test]
    fn test_unknown_op_stops_at_boundary() {
        let mut buf = Vec::new();
        encode_delete(&mut buf, "fine");
        let boundary = buf.len() as u64;
        buf.push(0x77);
        buf.extend_from_slice(&[0, 0, 0, 0]);

        let replay = replay(&buf);
        assert_eq!(replay.ops.len(), 1);
        assert_eq!(replay.halt.as_ref().unwrap().offset, boundary);
    }

    #[test]
    fn test_garbled_metadata_stops_at_boundary() {
        let mut buf = Vec::new();
        encode_delete(&mut buf, "ok");
        let boundary = buf.len() as u64;
        buf.push(OP_SET);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(b'k');
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(b"{{{{");

        let replay = replay(&buf);
        assert_eq!(replay.ops.len(), 1);
        assert_eq!(replay.halt.as_ref().unwrap().offset, boundary);
    }

    #[test]
    fn test_empty_buffer() {
        let replay = replay(&[]);
        assert!(replay.ops.is_empty());
        assert!(replay.halt.is_none());
    }

    #[test]
    fn test_file_append_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.index.wal");

        let mut batch = Vec::new();
        encode_set(&mut batch, "k", &meta(0, 5, None)).unwrap();
        {
            let (mut wal, len) = WalFile::open(&path).unwrap();
            assert_eq!(len, 0);
            wal.append(&batch).unwrap();
            wal.sync().unwrap();
        }

        let (mut wal, len) = WalFile::open(&path).unwrap();
        assert_eq!(len, batch.len() as u64);
        let bytes = wal.read_all().unwrap();
        let replayed = replay(&bytes);
        assert_eq!(replayed.ops.len(), 1);
    }

    #[test]
    fn test_truncate_to_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.index.wal");
        let (mut wal, _) = WalFile::open(&path).unwrap();

        let mut batch = Vec::new();
        encode_delete(&mut batch, "keep");
        let boundary = batch.len() as u64;
        batch.extend_from_slice(&[OP_SET, 9, 9]); // torn garbage
        wal.append(&batch).unwrap();

        wal.truncate_to(boundary).unwrap();
        assert_eq!(wal.stat_len().unwrap(), boundary);
        let replayed = replay(&wal.read_all().unwrap());
        assert_eq!(replayed.ops.len(), 1);
        assert!(replayed.halt.is_none());
    }
}
