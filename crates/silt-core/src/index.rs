//! In-memory key index
//!
//! Pure mapping from key to record metadata. Persistence is the WAL and
//! checkpoint machinery's job, not this module's.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::value::TypeTag;

/// Where a key's live record sits in the data log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Byte position of the record start
    pub offset: u64,
    /// Total record bytes (header + payload)
    pub size: u32,
    /// Type tag of the stored value
    #[serde(rename = "type")]
    pub tag: TypeTag,
    /// Absolute expiry in milliseconds since the epoch, if the key has a TTL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

/// Key → metadata mapping.
#[derive(Debug, Default)]
pub struct Index {
    map: HashMap<String, RecordMeta>,
}

impl Index {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<&RecordMeta> {
        self.map.get(key)
    }

    /// Install metadata, returning the previous entry (its record is now
    /// dead space).
    pub fn insert(&mut self, key: String, meta: RecordMeta) -> Option<RecordMeta> {
        self.map.insert(key, meta)
    }

    pub fn remove(&mut self, key: &str) -> Option<RecordMeta> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RecordMeta)> {
        self.map.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Swap in a rebuilt mapping (compaction's new world).
    pub fn replace(&mut self, map: HashMap<String, RecordMeta>) {
        self.map = map;
    }

    /// Sum of live record sizes; the engine derives wasted space from this.
    pub fn live_bytes(&self) -> u64 {
        self.map.values().map(|meta| meta.size as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(offset: u64, size: u32) -> RecordMeta {
        RecordMeta { offset, size, tag: TypeTag::String, expiry: None }
    }

    #[test]
    fn test_insert_returns_displaced() {
        let mut index = Index::new();
        assert!(index.insert("k".into(), meta(0, 10)).is_none());
        let old = index.insert("k".into(), meta(10, 12)).unwrap();
        assert_eq!(old.offset, 0);
        assert_eq!(old.size, 10);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_live_bytes() {
        let mut index = Index::new();
        index.insert("a".into(), meta(0, 7));
        index.insert("b".into(), meta(7, 13));
        assert_eq!(index.live_bytes(), 20);
        index.remove("a");
        assert_eq!(index.live_bytes(), 13);
    }

    #[test]
    fn test_meta_json_shape() {
        let with_ttl = RecordMeta {
            offset: 64,
            size: 9,
            tag: TypeTag::F64,
            expiry: Some(1_700_000_000_000),
        };
        let json = serde_json::to_string(&with_ttl).unwrap();
        assert!(json.contains("\"type\":\"f64\""));
        assert!(json.contains("\"expiry\":1700000000000"));

        let without = meta(0, 9);
        let json = serde_json::to_string(&without).unwrap();
        assert!(!json.contains("expiry"));
        let back: RecordMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, without);
    }
}
