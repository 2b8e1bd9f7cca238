//! Typed value model and the on-disk record codec
//!
//! Every stored value is one of eight variants. Records are encoded as
//! `[type:u8][payload_len:u32 LE][payload]`; scalar variants use a fixed
//! binary payload, while Array and Map payloads are the serde_json document
//! of the tagged value (UTF-8). There is no record-level checksum and no key
//! embedded in the record — the index owns both.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{SiltError, SiltResult};

/// Record header: 1 tag byte + 4 length bytes
pub const RECORD_HEADER_SIZE: usize = 5;

/// Type tag stored in the record header and in index metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TypeTag {
    Null = 0,
    Undefined = 1,
    Bool = 2,
    F64 = 3,
    String = 4,
    Bytes = 5,
    Array = 6,
    Map = 7,
}

impl TypeTag {
    /// Parse a tag byte read from disk.
    pub fn from_u8(byte: u8) -> Option<TypeTag> {
        match byte {
            0 => Some(TypeTag::Null),
            1 => Some(TypeTag::Undefined),
            2 => Some(TypeTag::Bool),
            3 => Some(TypeTag::F64),
            4 => Some(TypeTag::String),
            5 => Some(TypeTag::Bytes),
            6 => Some(TypeTag::Array),
            7 => Some(TypeTag::Map),
            _ => None,
        }
    }
}

/// A stored value.
///
/// The enum is closed: a caller cannot hand the engine anything outside
/// these variants, and owned trees cannot contain cycles, so encoding can
/// only fail on the JSON path for nested structures.
///
/// Equality is derived: `F64` follows IEEE-754 (`NaN != NaN`), and `String`
/// and `Bytes` are distinct types that never compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Explicit null
    Null,
    /// Absent value, distinct from null
    Undefined,
    Bool(bool),
    /// IEEE-754 double
    F64(f64),
    /// UTF-8 text
    String(String),
    /// Opaque byte buffer
    Bytes(Vec<u8>),
    /// Ordered sequence of values
    Array(Vec<Value>),
    /// String-keyed map; BTreeMap keeps the JSON encoding canonical
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// The type tag this value encodes under.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Undefined => TypeTag::Undefined,
            Value::Bool(_) => TypeTag::Bool,
            Value::F64(_) => TypeTag::F64,
            Value::String(_) => TypeTag::String,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::Array(_) => TypeTag::Array,
            Value::Map(_) => TypeTag::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Size of the payload this value encodes to, measured before any I/O.
    ///
    /// Scalar and flat variants are O(1); Array and Map serialize their
    /// JSON document to measure it, so an oversize rejection happens at the
    /// write call rather than during a deferred flush.
    pub fn payload_size(&self) -> usize {
        match self {
            Value::Null | Value::Undefined => 0,
            Value::Bool(_) => 1,
            Value::F64(_) => 8,
            Value::String(s) => s.len(),
            Value::Bytes(b) => b.len(),
            Value::Array(_) | Value::Map(_) => {
                // An unencodable value can never fit any limit
                serde_json::to_vec(self).map_or(usize::MAX, |doc| doc.len())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::F64(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::F64(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Encode a value into a complete record: tag byte, little-endian payload
/// length, payload bytes.
pub fn encode(value: &Value) -> SiltResult<Vec<u8>> {
    let tag = value.type_tag();
    let payload: Vec<u8> = match value {
        Value::Null | Value::Undefined => Vec::new(),
        Value::Bool(b) => vec![*b as u8],
        Value::F64(n) => n.to_le_bytes().to_vec(),
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Bytes(b) => b.clone(),
        Value::Array(_) | Value::Map(_) => {
            serde_json::to_vec(value).map_err(|e| SiltError::Serialization {
                message: format!("Failed to encode nested value as JSON: {}", e),
            })?
        }
    };

    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    record.push(tag as u8);
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Decode a complete record produced by [`encode`].
///
/// The buffer must hold exactly one record: a declared length that does not
/// match the bytes on hand is corruption, not a prefix.
pub fn decode(record: &[u8]) -> SiltResult<Value> {
    if record.len() < RECORD_HEADER_SIZE {
        return Err(SiltError::corrupt(format!(
            "record of {} bytes is shorter than the {}-byte header",
            record.len(),
            RECORD_HEADER_SIZE
        )));
    }

    let tag = TypeTag::from_u8(record[0])
        .ok_or_else(|| SiltError::corrupt(format!("unknown type tag {:#04x}", record[0])))?;
    let declared =
        u32::from_le_bytes([record[1], record[2], record[3], record[4]]) as usize;

    if RECORD_HEADER_SIZE + declared != record.len() {
        return Err(SiltError::corrupt(format!(
            "declared payload of {} bytes but record holds {}",
            declared,
            record.len() - RECORD_HEADER_SIZE
        )));
    }
    let payload = &record[RECORD_HEADER_SIZE..];

    match tag {
        TypeTag::Null | TypeTag::Undefined => {
            if !payload.is_empty() {
                return Err(SiltError::corrupt(format!(
                    "{:?} record with a {}-byte payload",
                    tag,
                    payload.len()
                )));
            }
            Ok(if tag == TypeTag::Null { Value::Null } else { Value::Undefined })
        }
        TypeTag::Bool => match payload {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(SiltError::corrupt("bool record payload is not a single 0|1 byte")),
        },
        TypeTag::F64 => {
            let bytes: [u8; 8] = payload
                .try_into()
                .map_err(|_| SiltError::corrupt("f64 record payload is not 8 bytes"))?;
            Ok(Value::F64(f64::from_le_bytes(bytes)))
        }
        TypeTag::String => {
            let s = std::str::from_utf8(payload)
                .map_err(|e| SiltError::corrupt(format!("string record is not UTF-8: {}", e)))?;
            Ok(Value::String(s.to_string()))
        }
        TypeTag::Bytes => Ok(Value::Bytes(payload.to_vec())),
        TypeTag::Array | TypeTag::Map => {
            let value: Value = serde_json::from_slice(payload)
                .map_err(|e| SiltError::corrupt(format!("nested record JSON is invalid: {}", e)))?;
            if value.type_tag() != tag {
                return Err(SiltError::corrupt(format!(
                    "record tagged {:?} decoded as {:?}",
                    tag,
                    value.type_tag()
                )));
            }
            Ok(value)
        }
    }
}
