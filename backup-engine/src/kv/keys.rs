//! Key layout and key spans.
//!
//! Every table key starts with the big-endian table id followed by the
//! big-endian index id; the rest is the order-preserving column encoding
//! produced by `catalog::rowenc`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub type TableId = u32;
pub type IndexId = u32;

pub const PRIMARY_INDEX_ID: IndexId = 1;

const TABLE_PREFIX_LEN: usize = 4;
const INDEX_PREFIX_LEN: usize = 8;

/// An opaque, lexicographically ordered key.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(pub Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The smallest key strictly greater than `self`.
    pub fn next(&self) -> Key {
        let mut bytes = self.0.clone();
        bytes.push(0);
        Key(bytes)
    }

    /// The smallest key greater than every key prefixed by `self`.
    pub fn prefix_end(&self) -> Key {
        let mut bytes = self.0.clone();
        while let Some(last) = bytes.pop() {
            if last < u8::MAX {
                bytes.push(last + 1);
                return Key(bytes);
            }
        }
        // All 0xff: no finite successor; the empty key never appears as an end.
        Key(vec![u8::MAX; self.0.len() + 1])
    }

    pub fn table_id(&self) -> Option<TableId> {
        (self.0.len() >= TABLE_PREFIX_LEN).then(|| BigEndian::read_u32(&self.0[..TABLE_PREFIX_LEN]))
    }

    pub fn index_id(&self) -> Option<IndexId> {
        (self.0.len() >= INDEX_PREFIX_LEN)
            .then(|| BigEndian::read_u32(&self.0[TABLE_PREFIX_LEN..INDEX_PREFIX_LEN]))
    }

    /// Bytes following the table/index prefix.
    pub fn suffix(&self) -> &[u8] {
        if self.0.len() >= INDEX_PREFIX_LEN {
            &self.0[INDEX_PREFIX_LEN..]
        } else {
            &[]
        }
    }

    /// Same key with its table id replaced.
    pub fn with_table_id(&self, table_id: TableId) -> Key {
        let mut bytes = self.0.clone();
        if bytes.len() >= TABLE_PREFIX_LEN {
            BigEndian::write_u32(&mut bytes[..TABLE_PREFIX_LEN], table_id);
        }
        Key(bytes)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.table_id(), self.index_id()) {
            (Some(table), Some(index)) => {
                write!(f, "/Table/{}/{}", table, index)?;
                if !self.suffix().is_empty() {
                    write!(f, "/")?;
                    for b in self.suffix() {
                        write!(f, "{:02x}", b)?;
                    }
                }
                Ok(())
            }
            (Some(table), None) if self.0.len() == TABLE_PREFIX_LEN => write!(f, "/Table/{}", table),
            _ => {
                write!(f, "/Raw/")?;
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Key)
            .map_err(serde::de::Error::custom)
    }
}

pub fn table_prefix(table_id: TableId) -> Key {
    let mut bytes = vec![0u8; TABLE_PREFIX_LEN];
    BigEndian::write_u32(&mut bytes, table_id);
    Key(bytes)
}

pub fn index_prefix(table_id: TableId, index_id: IndexId) -> Key {
    let mut bytes = vec![0u8; INDEX_PREFIX_LEN];
    BigEndian::write_u32(&mut bytes[..TABLE_PREFIX_LEN], table_id);
    BigEndian::write_u32(&mut bytes[TABLE_PREFIX_LEN..], index_id);
    Key(bytes)
}

/// A half-open key interval `[key, end_key)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub key: Key,
    pub end_key: Key,
}

impl Span {
    pub fn new(key: Key, end_key: Key) -> Self {
        Self { key, end_key }
    }

    pub fn table(table_id: TableId) -> Self {
        Span::new(table_prefix(table_id), table_prefix(table_id).prefix_end())
    }

    pub fn index(table_id: TableId, index_id: IndexId) -> Self {
        let prefix = index_prefix(table_id, index_id);
        let end = prefix.prefix_end();
        Span::new(prefix, end)
    }

    pub fn is_empty(&self) -> bool {
        self.key >= self.end_key
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        &self.key <= key && key < &self.end_key
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.key <= other.key && other.end_key <= self.end_key
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.key < other.end_key && other.key < self.end_key
    }

    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let key = std::cmp::max(&self.key, &other.key).clone();
        let end_key = std::cmp::min(&self.end_key, &other.end_key).clone();
        (key < end_key).then(|| Span::new(key, end_key))
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.key, self.end_key)
    }
}

/// Sorts spans and coalesces overlapping or adjacent ones.
pub fn merge_spans(spans: &[Span]) -> Vec<Span> {
    let mut sorted: Vec<Span> = spans.iter().filter(|s| !s.is_empty()).cloned().collect();
    sorted.sort();
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        match merged.last_mut() {
            Some(last) if span.key <= last.end_key => {
                if span.end_key > last.end_key {
                    last.end_key = span.end_key;
                }
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// Parts of `spans` not covered by `covered`.
pub fn subtract_spans(spans: &[Span], covered: &[Span]) -> Vec<Span> {
    let covered = merge_spans(covered);
    let mut out = Vec::new();
    for span in merge_spans(spans) {
        let mut cursor = span.key.clone();
        for c in covered.iter().filter(|c| c.overlaps(&span)) {
            if c.key > cursor {
                out.push(Span::new(cursor.clone(), c.key.clone()));
            }
            if c.end_key > cursor {
                cursor = c.end_key.clone();
            }
        }
        if cursor < span.end_key {
            out.push(Span::new(cursor, span.end_key.clone()));
        }
    }
    out
}

/// True when `covered` contains every key of every span in `spans`.
pub fn spans_cover(covered: &[Span], spans: &[Span]) -> bool {
    subtract_spans(spans, covered).is_empty()
}
