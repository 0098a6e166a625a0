//! Typed binary row codec.
//!
//! Every row is persisted as one self-delimiting record:
//!
//! ```text
//! [length u32][seq u64][time i64][field_count u16][null_bitmap ⌈n/8⌉ B]
//! [tag u8][payload] … (one pair per non-null field, in schema order)
//! [crc32 u32]
//! ```
//!
//! `length` covers everything from the start of the header through the end
//! of the last payload — i.e. the whole record minus the trailing CRC32,
//! which is computed over exactly those bytes. The total on-disk size of a
//! record is therefore `length + 4`.
//!
//! Encoding is deterministic: fields are written in schema order, null
//! fields contribute only a bitmap bit, and the same row always yields
//! byte-identical output. Decoding verifies length, CRC, field count, and
//! per-field type tags before producing a [`Row`].

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::schema::{Schema, SchemaError, Value};

/// Fixed header size: length(4) + seq(8) + time(8) + field_count(2).
pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 8 + 2;

/// Size of the trailing CRC32.
pub const RECORD_CRC_SIZE: usize = 4;

/// Byte offset of the `seq` field within a record.
const SEQ_OFFSET: usize = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned while encoding or decoding records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Binary encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Schema-level failure surfaced during encode.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The record is shorter than its own length header claims.
    #[error("record truncated (need {needed} bytes, have {available})")]
    Truncated {
        /// Bytes the header requires.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The trailing CRC32 did not match the record contents.
    #[error("record checksum mismatch (seq {0})")]
    ChecksumMismatch(u64),

    /// Encoded field count disagrees with the schema.
    #[error("record field count {actual} does not match schema ({expected})")]
    FieldCountMismatch {
        /// Field count the schema declares.
        expected: usize,
        /// Field count found in the record.
        actual: usize,
    },

    /// A field carried a type tag unknown to the codec.
    #[error("unknown field type tag {0}")]
    UnknownTypeTag(u8),

    /// A field's tag did not match the schema's declared type.
    #[error("field `{field}` has tag {actual}, schema declares {expected}")]
    TypeTagMismatch {
        /// Field name.
        field: String,
        /// Tag the schema declares.
        expected: u8,
        /// Tag found in the record.
        actual: u8,
    },
}

// ------------------------------------------------------------------------------------------------
// Row
// ------------------------------------------------------------------------------------------------

/// A decoded row: primary sequence, insert time, and the field map.
///
/// Omitted nullable fields are materialized as [`Value::Null`] on decode,
/// so `values` always holds one entry per schema field.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Primary sequence number assigned by the engine.
    pub seq: u64,

    /// Insert time, nanoseconds since the UNIX epoch.
    pub time: i64,

    /// Field values keyed by field name.
    pub values: HashMap<String, Value>,
}

impl Row {
    /// Returns the value of a field, if present in the map.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Returns `true` when the field is absent or null.
    pub fn is_null(&self, name: &str) -> bool {
        self.values.get(name).is_none_or(Value::is_null)
    }
}

// ------------------------------------------------------------------------------------------------
// RowCodec
// ------------------------------------------------------------------------------------------------

/// Schema-bound encoder/decoder for [`Row`] values.
#[derive(Debug, Clone)]
pub struct RowCodec {
    schema: Arc<Schema>,
}

impl RowCodec {
    /// Creates a codec bound to the given schema.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    /// The schema this codec encodes against.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Encodes a row into its canonical record bytes.
    ///
    /// The caller is expected to have validated `row.values` against the
    /// schema; unknown names are simply ignored here, and absent fields
    /// are encoded as null.
    pub fn encode(&self, row: &Row) -> Result<Vec<u8>, RecordError> {
        let fields = self.schema.fields();
        let bitmap_len = fields.len().div_ceil(8);

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + bitmap_len + 16 * fields.len());

        // Length placeholder, patched below.
        0u32.encode_to(&mut buf)?;
        row.seq.encode_to(&mut buf)?;
        row.time.encode_to(&mut buf)?;
        (fields.len() as u16).encode_to(&mut buf)?;

        // Null bitmap: bit i set ⇔ field i is absent or null.
        let bitmap_start = buf.len();
        buf.resize(bitmap_start + bitmap_len, 0);
        for (i, field) in fields.iter().enumerate() {
            let is_null = row.values.get(&field.name).is_none_or(Value::is_null);
            if is_null {
                buf[bitmap_start + i / 8] |= 1 << (i % 8);
            }
        }

        // Non-null fields: (tag, payload) in schema order.
        for field in fields {
            if let Some(value) = row.values.get(&field.name)
                && !value.is_null()
            {
                field.field_type.tag().encode_to(&mut buf)?;
                value.encode_payload(&mut buf)?;
            }
        }

        let length = buf.len() as u32;
        buf[..4].copy_from_slice(&length.to_le_bytes());

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decodes one record from the front of `buf`.
    ///
    /// `buf` may extend past the record; exactly `length + 4` bytes are
    /// consumed. Fails on truncation, CRC mismatch, field-count mismatch,
    /// or a type tag that disagrees with the schema.
    pub fn decode(&self, buf: &[u8]) -> Result<Row, RecordError> {
        let total = Self::record_len(buf)?;
        if buf.len() < total {
            return Err(RecordError::Truncated {
                needed: total,
                available: buf.len(),
            });
        }
        let covered = total - RECORD_CRC_SIZE;

        let (seq, _) = u64::decode_from(&buf[SEQ_OFFSET..])?;

        let stored_crc = u32::from_le_bytes([
            buf[covered],
            buf[covered + 1],
            buf[covered + 2],
            buf[covered + 3],
        ]);
        let mut hasher = Crc32::new();
        hasher.update(&buf[..covered]);
        if hasher.finalize() != stored_crc {
            return Err(RecordError::ChecksumMismatch(seq));
        }

        let mut offset = SEQ_OFFSET + 8;
        let (time, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (field_count, n) = u16::decode_from(&buf[offset..])?;
        offset += n;

        let fields = self.schema.fields();
        if field_count as usize != fields.len() {
            return Err(RecordError::FieldCountMismatch {
                expected: fields.len(),
                actual: field_count as usize,
            });
        }

        let bitmap_len = fields.len().div_ceil(8);
        if covered < offset + bitmap_len {
            return Err(RecordError::Truncated {
                needed: offset + bitmap_len,
                available: covered,
            });
        }
        let bitmap = &buf[offset..offset + bitmap_len];
        offset += bitmap_len;

        let mut values = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            let is_null = bitmap[i / 8] & (1 << (i % 8)) != 0;
            if is_null {
                values.insert(field.name.clone(), Value::Null);
                continue;
            }

            let (tag, n) = u8::decode_from(&buf[offset..covered])?;
            offset += n;

            let expected = field.field_type.tag();
            if tag != expected {
                return Err(match crate::schema::FieldType::from_tag(tag) {
                    None => RecordError::UnknownTypeTag(tag),
                    Some(_) => RecordError::TypeTagMismatch {
                        field: field.name.clone(),
                        expected,
                        actual: tag,
                    },
                });
            }

            let (value, n) = Value::decode_payload(field.field_type, &buf[offset..covered])?;
            offset += n;
            values.insert(field.name.clone(), value);
        }

        Ok(Row { seq, time, values })
    }

    /// Total on-disk size of the record at the front of `buf`
    /// (`length + 4` CRC bytes). Only the length header is read.
    pub fn record_len(buf: &[u8]) -> Result<usize, RecordError> {
        let (length, _) = u32::decode_from(buf)?;
        let length = length as usize;
        if length < RECORD_HEADER_SIZE {
            return Err(RecordError::Truncated {
                needed: RECORD_HEADER_SIZE,
                available: length,
            });
        }
        Ok(length + RECORD_CRC_SIZE)
    }

    /// Reads just the `seq` of the record at the front of `buf`.
    pub fn record_seq(buf: &[u8]) -> Result<u64, RecordError> {
        let (seq, _) = u64::decode_from(&buf[SEQ_OFFSET.min(buf.len())..])?;
        Ok(seq)
    }
}
