//! Base index snapshot
//!
//! A checkpoint serializes the whole index as one JSON document and commits
//! it with the atomic rename pattern:
//!
//! 1. Write the document to `<index_path>.tmp`
//! 2. Optionally durable-sync the temp file
//! 3. Rename the temp file over the base index (atomic on POSIX)
//!
//! If the process dies before the rename, the orphaned temp file is
//! harmless and the previous base index stays authoritative. Keys are
//! written in sorted order so identical indexes produce identical documents.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SiltError, SiltResult};
use crate::index::{Index, RecordMeta};
use crate::sync::sync_file;

/// Checkpoint counters carried inside the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_time: Option<u64>,
    #[serde(default)]
    pub checkpoints: u64,
}

/// The base index document.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub index: BTreeMap<String, RecordMeta>,
    pub stats: SnapshotStats,
    pub updated_at: u64,
}

/// Serialize the live index into a snapshot document.
pub fn serialize(index: &Index, stats: SnapshotStats, updated_at: u64) -> SiltResult<Vec<u8>> {
    let snapshot = IndexSnapshot {
        index: index.iter().map(|(k, m)| (k.clone(), *m)).collect(),
        stats,
        updated_at,
    };
    serde_json::to_vec(&snapshot).map_err(|e| SiltError::Serialization {
        message: format!("Failed to encode index snapshot: {}", e),
    })
}

/// Load the base index document if one exists.
///
/// A missing file means a fresh store. A file that exists but does not
/// parse is fatal: data log records carry no keys, so a lost index cannot
/// be rebuilt from data alone.
pub fn load(path: &Path) -> SiltResult<Option<IndexSnapshot>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SiltError::io_at(path, "Failed to read base index", e)),
    };
    let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
        SiltError::corrupt(format!("base index {} is malformed: {}", path.display(), e))
    })?;
    Ok(Some(snapshot))
}

/// The temp-file path a checkpoint writes before its rename.
pub fn tmp_path(index_path: &Path) -> PathBuf {
    let mut name = OsString::from(index_path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Commit a snapshot document: temp write, optional sync, atomic rename.
/// The temp file is removed on every failure path.
pub fn write_atomic(index_path: &Path, document: &[u8], force_sync: bool) -> SiltResult<()> {
    let tmp = tmp_path(index_path);

    let write_result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| SiltError::io_at(&tmp, "Failed to create snapshot temp file", e))?;
        file.write_all(document)
            .map_err(|e| SiltError::io_at(&tmp, "Snapshot write failed", e))?;
        if force_sync {
            sync_file(&file).map_err(|e| SiltError::io_at(&tmp, "Snapshot sync failed", e))?;
        }
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp, index_path) {
        let _ = fs::remove_file(&tmp);
        return Err(SiltError::io_at(index_path, "Failed to commit snapshot rename", e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeTag;
    use tempfile::TempDir;

    fn sample_index() -> Index {
        let mut index = Index::new();
        index.insert(
            "a".into(),
            RecordMeta { offset: 0, size: 6, tag: TypeTag::F64, expiry: None },
        );
        index.insert(
            "b".into(),
            RecordMeta { offset: 6, size: 9, tag: TypeTag::String, expiry: Some(123_456) },
        );
        index
    }

    #[test]
    fn test_write_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.index");

        let stats = SnapshotStats { last_checkpoint_time: Some(1_000), checkpoints: 3 };
        let doc = serialize(&sample_index(), stats, 2_000).unwrap();
        write_atomic(&path, &doc, true).unwrap();

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.index.len(), 2);
        assert_eq!(loaded.index["b"].expiry, Some(123_456));
        assert_eq!(loaded.stats.checkpoints, 3);
        assert_eq!(loaded.updated_at, 2_000);
        assert!(!path.with_extension("index.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_fresh_store() {
        let dir = TempDir::new().unwrap();
        assert!(load(&dir.path().join("absent.index")).unwrap().is_none());
    }

    #[test]
    fn test_malformed_document_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.index");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(load(&path), Err(SiltError::Corruption { .. })));
    }

    #[test]
    fn test_rename_replaces_previous() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.index");

        let first = serialize(&sample_index(), SnapshotStats::default(), 1).unwrap();
        write_atomic(&path, &first, false).unwrap();

        let second = serialize(&Index::new(), SnapshotStats::default(), 2).unwrap();
        write_atomic(&path, &second, false).unwrap();

        let loaded = load(&path).unwrap().unwrap();
        assert!(loaded.index.is_empty());
        assert_eq!(loaded.updated_at, 2);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_deterministic_document() {
        let a = serialize(&sample_index(), SnapshotStats::default(), 7).unwrap();
        let b = serialize(&sample_index(), SnapshotStats::default(), 7).unwrap();
        assert_eq!(a, b);
    }
}
