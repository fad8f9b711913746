//! Row encoding into index keys and values.
//!
//! Key columns use an order-preserving encoding so that key order matches
//! datum order. Primary index values hold the JSON-encoded row; secondary
//! index entries carry the primary key columns in the key and an empty value.

use super::descriptor::{ColumnType, DescriptorId, IndexDescriptor, TableDescriptor};
use crate::kv::keys::{index_prefix, Key, PRIMARY_INDEX_ID};
use crate::utils::errors::{EngineError, Result};
use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

const TAG_NULL: u8 = 0x00;
const TAG_INT: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const STRING_ESCAPE: u8 = 0x00;
const STRING_ESCAPED_ZERO: u8 = 0xff;
const STRING_TERMINATOR: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Int(i64),
    String(String),
}

pub type Row = Vec<Datum>;

pub fn encode_datum(buf: &mut Vec<u8>, datum: &Datum) {
    match datum {
        Datum::Null => buf.push(TAG_NULL),
        Datum::Int(v) => {
            buf.push(TAG_INT);
            // Flipping the sign bit makes two's complement sort as unsigned.
            let _ = buf.write_u64::<BigEndian>((*v as u64) ^ (1 << 63));
        }
        Datum::String(s) => {
            buf.push(TAG_STRING);
            for b in s.as_bytes() {
                if *b == STRING_ESCAPE {
                    buf.push(STRING_ESCAPE);
                    buf.push(STRING_ESCAPED_ZERO);
                } else {
                    buf.push(*b);
                }
            }
            buf.push(STRING_ESCAPE);
            buf.push(STRING_TERMINATOR);
        }
    }
}

/// Primary key of a row in table `table_id` with the given key values.
pub fn primary_key_for(table_id: DescriptorId, values: &[Datum]) -> Key {
    let mut key = index_prefix(table_id, PRIMARY_INDEX_ID).0;
    for v in values {
        encode_datum(&mut key, v);
    }
    Key(key)
}

fn check_row(table: &TableDescriptor, row: &[Datum]) -> Result<()> {
    let invalid = |detail: String| EngineError::InvalidRow {
        table: table.name.clone(),
        detail,
    };
    if row.len() != table.columns.len() {
        return Err(invalid(format!(
            "expected {} columns, got {}",
            table.columns.len(),
            row.len()
        )));
    }
    for (col, datum) in table.columns.iter().zip(row) {
        match (col.kind, datum) {
            (_, Datum::Null) if !col.nullable => {
                return Err(invalid(format!("null value in column \"{}\"", col.name)))
            }
            (_, Datum::Null) | (ColumnType::Int, Datum::Int(_)) | (ColumnType::String, Datum::String(_)) => {}
            _ => {
                return Err(invalid(format!(
                    "value {:?} does not match type of column \"{}\"",
                    datum, col.name
                )))
            }
        }
    }
    Ok(())
}

fn index_values<'a>(
    table: &TableDescriptor,
    index: &IndexDescriptor,
    row: &'a [Datum],
) -> Result<Vec<&'a Datum>> {
    index
        .column_ids
        .iter()
        .map(|id| {
            table
                .column_position(*id)
                .and_then(|pos| row.get(pos))
                .ok_or_else(|| EngineError::InvalidRow {
                    table: table.name.clone(),
                    detail: format!("index \"{}\" references missing column {}", index.name, id),
                })
        })
        .collect()
}

pub fn primary_key(table: &TableDescriptor, row: &[Datum]) -> Result<Key> {
    let values = index_values(table, &table.primary_index, row)?;
    let mut key = index_prefix(table.id, PRIMARY_INDEX_ID).0;
    for v in values {
        encode_datum(&mut key, v);
    }
    Ok(Key(key))
}

/// Secondary index key: indexed columns followed by the primary key columns.
pub fn secondary_key(table: &TableDescriptor, index: &IndexDescriptor, row: &[Datum]) -> Result<Key> {
    let mut key = index_prefix(table.id, index.id).0;
    for v in index_values(table, index, row)? {
        encode_datum(&mut key, v);
    }
    for v in index_values(table, &table.primary_index, row)? {
        encode_datum(&mut key, v);
    }
    Ok(Key(key))
}

/// All key/values a row occupies across the table's indexes.
pub fn encode_row(table: &TableDescriptor, row: &[Datum]) -> Result<Vec<(Key, Vec<u8>)>> {
    check_row(table, row)?;
    let mut out = Vec::with_capacity(1 + table.indexes.len());
    out.push((primary_key(table, row)?, serde_json::to_vec(row)?));
    for index in &table.indexes {
        out.push((secondary_key(table, index, row)?, Vec::new()));
    }
    Ok(out)
}

/// Decodes a primary index value.
pub fn decode_row(table: &TableDescriptor, value: &[u8]) -> Result<Row> {
    let row: Row = serde_json::from_slice(value)?;
    if row.len() != table.columns.len() {
        return Err(EngineError::InvalidRow {
            table: table.name.clone(),
            detail: format!("stored row has {} columns", row.len()),
        });
    }
    Ok(row)
}
