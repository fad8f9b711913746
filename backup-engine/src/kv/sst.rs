//! Data file codec.
//!
//! Layout: a sequence of entries, then a 16-byte footer.
//!
//! ```text
//! entry  := key_len:u32 key wall_time:i64 logical:i32 flags:u8 [value_len:u32 value]
//! footer := entry_count:u32 crc32(entries):u32 magic:u64
//! ```
//!
//! Entries are sorted by key ascending, then timestamp descending. A set
//! tombstone flag marks a deletion and carries no value.

use super::keys::Key;
use super::timestamp::Timestamp;
use crate::utils::errors::{EngineError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

const MAGIC: u64 = 0x4244_4b50_5353_5431; // "BDKPSST1"
const FOOTER_LEN: usize = 16;
const FLAG_TOMBSTONE: u8 = 0x01;

/// One MVCC revision of a key. `value == None` is a deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccEntry {
    pub key: Key,
    pub timestamp: Timestamp,
    pub value: Option<Vec<u8>>,
}

impl MvccEntry {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Logical size used for entry accounting.
    pub fn size(&self) -> u64 {
        (self.key.len() + self.value.as_ref().map_or(0, |v| v.len())) as u64
    }
}

pub struct SstWriter {
    buf: Vec<u8>,
    hasher: crc32fast::Hasher,
    count: u32,
    last: Option<(Key, Timestamp)>,
}

impl SstWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            hasher: crc32fast::Hasher::new(),
            count: 0,
            last: None,
        }
    }

    /// Appends an entry; entries must arrive in file order.
    pub fn add(&mut self, entry: &MvccEntry) -> Result<()> {
        if let Some((last_key, last_ts)) = &self.last {
            let ordered = entry.key > *last_key
                || (entry.key == *last_key && entry.timestamp < *last_ts);
            if !ordered {
                return Err(EngineError::Internal(format!(
                    "data file entries out of order: {}@{} after {}@{}",
                    entry.key, entry.timestamp, last_key, last_ts
                )));
            }
        }

        let start = self.buf.len();
        self.buf.write_u32::<BigEndian>(entry.key.len() as u32)?;
        self.buf.extend_from_slice(entry.key.as_bytes());
        self.buf.write_i64::<BigEndian>(entry.timestamp.wall_time)?;
        self.buf.write_i32::<BigEndian>(entry.timestamp.logical)?;
        match &entry.value {
            None => self.buf.write_u8(FLAG_TOMBSTONE)?,
            Some(value) => {
                self.buf.write_u8(0)?;
                self.buf.write_u32::<BigEndian>(value.len() as u32)?;
                self.buf.extend_from_slice(value);
            }
        }
        self.hasher.update(&self.buf[start..]);
        self.count += 1;
        self.last = Some((entry.key.clone(), entry.timestamp));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        let crc = self.hasher.finalize();
        self.buf.write_u32::<BigEndian>(self.count)?;
        self.buf.write_u32::<BigEndian>(crc)?;
        self.buf.write_u64::<BigEndian>(MAGIC)?;
        Ok(self.buf)
    }
}

impl Default for SstWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a data file, validating its footer.
pub fn read_sst(data: &[u8]) -> Result<Vec<MvccEntry>> {
    if data.len() < FOOTER_LEN {
        return Err(EngineError::Corruption(format!(
            "data file too short ({} bytes)",
            data.len()
        )));
    }
    let (body, footer) = data.split_at(data.len() - FOOTER_LEN);
    let mut footer = Cursor::new(footer);
    let count = footer.read_u32::<BigEndian>()?;
    let crc = footer.read_u32::<BigEndian>()?;
    let magic = footer.read_u64::<BigEndian>()?;
    if magic != MAGIC {
        return Err(EngineError::Corruption(format!("bad magic {:016x}", magic)));
    }
    let actual = crc32fast::hash(body);
    if actual != crc {
        return Err(EngineError::Corruption(format!(
            "entry checksum {:08x} does not match footer {:08x}",
            actual, crc
        )));
    }

    let mut cursor = Cursor::new(body);
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;
        let wall_time = cursor.read_i64::<BigEndian>()?;
        let logical = cursor.read_i32::<BigEndian>()?;
        let flags = cursor.read_u8()?;
        let value = if flags & FLAG_TOMBSTONE != 0 {
            None
        } else {
            let len = cursor.read_u32::<BigEndian>()? as usize;
            let mut value = vec![0u8; len];
            cursor.read_exact(&mut value)?;
            Some(value)
        };
        entries.push(MvccEntry {
            key: Key(key),
            timestamp: Timestamp::new(wall_time, logical),
            value,
        });
    }
    if (cursor.position() as usize) != body.len() {
        return Err(EngineError::Corruption("trailing bytes after last entry".into()));
    }
    Ok(entries)
}

/// Whole-file checksum recorded in the manifest.
pub fn file_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
