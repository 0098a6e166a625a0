//! Schema definition — field types, dynamic values, and row validation.
//!
//! A [`Schema`] is an ordered list of [`Field`]s plus two implicit columns
//! managed by the engine: `_seq` (the primary sequence number, `u64`) and
//! `_time` (insert time in nanoseconds, `i64`). Schemas are immutable for
//! a table's lifetime; their canonical encoding carries a CRC32 checksum
//! and two schemas match iff their checksums match.
//!
//! [`FieldType`] is a closed enumeration of 19 primitive types, each with
//! a fixed wire tag and a canonical little-endian encoding. [`Value`] is
//! the tagged variant carried in rows; the record codec encodes values
//! according to the field's *static* type, so a mismatched variant is a
//! validation error, never silent coercion.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::encoding::{Decode, Encode, EncodingError};

/// Name of the schema file inside a table directory.
pub const SCHEMA_FILE: &str = "schema.json";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by schema construction, validation, and persistence.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A non-nullable field was missing (or explicitly null) at insert.
    #[error("field `{0}` is required")]
    FieldRequired(String),

    /// A field name was not declared in the schema.
    #[error("field `{0}` not found in schema")]
    FieldNotFound(String),

    /// A value's type did not match the field's declared type.
    #[error("field `{name}` expects {expected}, got {actual}")]
    FieldTypeMismatch {
        /// Field name.
        name: String,
        /// Declared field type.
        expected: &'static str,
        /// Name of the supplied value's type.
        actual: &'static str,
    },

    /// Two fields share the same name.
    #[error("field `{0}` declared twice")]
    FieldExists(String),

    /// Stored checksum does not match the recomputed one.
    #[error("schema checksum mismatch (stored {stored:08x}, computed {computed:08x})")]
    ChecksumMismatch {
        /// Checksum read from disk.
        stored: u32,
        /// Checksum recomputed from the field list.
        computed: u32,
    },

    /// Structural problem with the schema definition itself.
    #[error("invalid schema: {0}")]
    Invalid(String),

    /// Underlying I/O error while persisting or loading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("schema json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

// ------------------------------------------------------------------------------------------------
// FieldType — closed enumeration of 19 primitive types
// ------------------------------------------------------------------------------------------------

/// The closed set of primitive field types.
///
/// Each type has a fixed wire tag (see [`FieldType::tag`]) and a canonical
/// binary encoding. `Int` and `Uint` are native-width integers that always
/// encode as 8 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Native-width signed integer (8 bytes on the wire).
    Int,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Unsigned 64-bit integer.
    Uint64,
    /// Native-width unsigned integer (8 bytes on the wire).
    Uint,
    /// Single raw byte.
    Byte,
    /// 32-bit Unicode scalar value.
    Rune,
    /// IEEE-754 single-precision float.
    Float32,
    /// IEEE-754 double-precision float.
    Float64,
    /// UTF-8 string, length-prefixed.
    String,
    /// Boolean.
    Bool,
    /// Absolute time — nanoseconds since the UNIX epoch, signed 64-bit.
    Time,
    /// Duration — signed 64-bit nanoseconds.
    Duration,
    /// High-precision decimal, stored in canonical string form.
    Decimal,
}

impl FieldType {
    /// All field types in tag order.
    pub const ALL: [FieldType; 19] = [
        FieldType::Int8,
        FieldType::Int16,
        FieldType::Int32,
        FieldType::Int64,
        FieldType::Int,
        FieldType::Uint8,
        FieldType::Uint16,
        FieldType::Uint32,
        FieldType::Uint64,
        FieldType::Uint,
        FieldType::Byte,
        FieldType::Rune,
        FieldType::Float32,
        FieldType::Float64,
        FieldType::String,
        FieldType::Bool,
        FieldType::Time,
        FieldType::Duration,
        FieldType::Decimal,
    ];

    /// Returns the fixed wire tag of this type (1-based).
    pub const fn tag(self) -> u8 {
        match self {
            FieldType::Int8 => 1,
            FieldType::Int16 => 2,
            FieldType::Int32 => 3,
            FieldType::Int64 => 4,
            FieldType::Int => 5,
            FieldType::Uint8 => 6,
            FieldType::Uint16 => 7,
            FieldType::Uint32 => 8,
            FieldType::Uint64 => 9,
            FieldType::Uint => 10,
            FieldType::Byte => 11,
            FieldType::Rune => 12,
            FieldType::Float32 => 13,
            FieldType::Float64 => 14,
            FieldType::String => 15,
            FieldType::Bool => 16,
            FieldType::Time => 17,
            FieldType::Duration => 18,
            FieldType::Decimal => 19,
        }
    }

    /// Looks a type up by wire tag.
    pub fn from_tag(tag: u8) -> Option<FieldType> {
        match tag {
            0 => None,
            t if (t as usize) <= Self::ALL.len() => Some(Self::ALL[t as usize - 1]),
            _ => None,
        }
    }

    /// Human-readable type name.
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Int8 => "int8",
            FieldType::Int16 => "int16",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Int => "int",
            FieldType::Uint8 => "uint8",
            FieldType::Uint16 => "uint16",
            FieldType::Uint32 => "uint32",
            FieldType::Uint64 => "uint64",
            FieldType::Uint => "uint",
            FieldType::Byte => "byte",
            FieldType::Rune => "rune",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::String => "string",
            FieldType::Bool => "bool",
            FieldType::Time => "time",
            FieldType::Duration => "duration",
            FieldType::Decimal => "decimal",
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Value — tagged variant over the 19 types plus Null
// ------------------------------------------------------------------------------------------------

/// A dynamically-typed field value.
///
/// `Null` is only valid for nullable fields; it is represented in the
/// record encoding by a bit in the null bitmap, not by a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value (nullable fields only).
    Null,
    /// Signed 8-bit integer.
    Int8(i8),
    /// Signed 16-bit integer.
    Int16(i16),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// Native-width signed integer.
    Int(i64),
    /// Unsigned 8-bit integer.
    Uint8(u8),
    /// Unsigned 16-bit integer.
    Uint16(u16),
    /// Unsigned 32-bit integer.
    Uint32(u32),
    /// Unsigned 64-bit integer.
    Uint64(u64),
    /// Native-width unsigned integer.
    Uint(u64),
    /// Single raw byte.
    Byte(u8),
    /// Unicode scalar value.
    Rune(char),
    /// Single-precision float.
    Float32(f32),
    /// Double-precision float.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Boolean.
    Bool(bool),
    /// Nanoseconds since the UNIX epoch.
    Time(i64),
    /// Signed nanosecond duration.
    Duration(i64),
    /// Decimal in canonical string form.
    Decimal(String),
}

impl Value {
    /// Returns `true` if this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns `true` when the variant matches the given field type.
    ///
    /// `Null` matches no type; nullability is checked separately.
    pub fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (Value::Int8(_), FieldType::Int8)
                | (Value::Int16(_), FieldType::Int16)
                | (Value::Int32(_), FieldType::Int32)
                | (Value::Int64(_), FieldType::Int64)
                | (Value::Int(_), FieldType::Int)
                | (Value::Uint8(_), FieldType::Uint8)
                | (Value::Uint16(_), FieldType::Uint16)
                | (Value::Uint32(_), FieldType::Uint32)
                | (Value::Uint64(_), FieldType::Uint64)
                | (Value::Uint(_), FieldType::Uint)
                | (Value::Byte(_), FieldType::Byte)
                | (Value::Rune(_), FieldType::Rune)
                | (Value::Float32(_), FieldType::Float32)
                | (Value::Float64(_), FieldType::Float64)
                | (Value::String(_), FieldType::String)
                | (Value::Bool(_), FieldType::Bool)
                | (Value::Time(_), FieldType::Time)
                | (Value::Duration(_), FieldType::Duration)
                | (Value::Decimal(_), FieldType::Decimal)
        )
    }

    /// Name of this value's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int8(_) => "int8",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Int(_) => "int",
            Value::Uint8(_) => "uint8",
            Value::Uint16(_) => "uint16",
            Value::Uint32(_) => "uint32",
            Value::Uint64(_) => "uint64",
            Value::Uint(_) => "uint",
            Value::Byte(_) => "byte",
            Value::Rune(_) => "rune",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Bool(_) => "bool",
            Value::Time(_) => "time",
            Value::Duration(_) => "duration",
            Value::Decimal(_) => "decimal",
        }
    }

    /// Canonical string form used as the key in secondary indexes.
    ///
    /// Returns `None` for `Null` — null values are never indexed.
    pub fn index_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int8(v) => Some(v.to_string()),
            Value::Int16(v) => Some(v.to_string()),
            Value::Int32(v) => Some(v.to_string()),
            Value::Int64(v) | Value::Int(v) => Some(v.to_string()),
            Value::Uint8(v) => Some(v.to_string()),
            Value::Uint16(v) => Some(v.to_string()),
            Value::Uint32(v) => Some(v.to_string()),
            Value::Uint64(v) | Value::Uint(v) => Some(v.to_string()),
            Value::Byte(v) => Some(v.to_string()),
            Value::Rune(v) => Some(v.to_string()),
            Value::Float32(v) => Some(v.to_string()),
            Value::Float64(v) => Some(v.to_string()),
            Value::String(v) => Some(v.clone()),
            Value::Bool(v) => Some(v.to_string()),
            Value::Time(v) | Value::Duration(v) => Some(v.to_string()),
            Value::Decimal(v) => Some(v.clone()),
        }
    }

    /// Appends the canonical binary payload for this value.
    ///
    /// The payload is written without a type tag — the record codec writes
    /// the tag itself, driven by the field's static type.
    pub fn encode_payload(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Value::Null => Ok(()),
            Value::Int8(v) => v.encode_to(buf),
            Value::Int16(v) => v.encode_to(buf),
            Value::Int32(v) => v.encode_to(buf),
            Value::Int64(v) | Value::Int(v) => v.encode_to(buf),
            Value::Uint8(v) => v.encode_to(buf),
            Value::Uint16(v) => v.encode_to(buf),
            Value::Uint32(v) => v.encode_to(buf),
            Value::Uint64(v) | Value::Uint(v) => v.encode_to(buf),
            Value::Byte(v) => v.encode_to(buf),
            Value::Rune(v) => (*v as u32).encode_to(buf),
            Value::Float32(v) => v.encode_to(buf),
            Value::Float64(v) => v.encode_to(buf),
            Value::String(v) => v.encode_to(buf),
            Value::Bool(v) => v.encode_to(buf),
            Value::Time(v) | Value::Duration(v) => v.encode_to(buf),
            Value::Decimal(v) => v.encode_to(buf),
        }
    }

    /// Decodes a payload of the given type from the front of `buf`.
    ///
    /// Returns `(value, bytes_consumed)`.
    pub fn decode_payload(
        field_type: FieldType,
        buf: &[u8],
    ) -> Result<(Value, usize), EncodingError> {
        Ok(match field_type {
            FieldType::Int8 => {
                let (v, n) = i8::decode_from(buf)?;
                (Value::Int8(v), n)
            }
            FieldType::Int16 => {
                let (v, n) = i16::decode_from(buf)?;
                (Value::Int16(v), n)
            }
            FieldType::Int32 => {
                let (v, n) = i32::decode_from(buf)?;
                (Value::Int32(v), n)
            }
            FieldType::Int64 => {
                let (v, n) = i64::decode_from(buf)?;
                (Value::Int64(v), n)
            }
            FieldType::Int => {
                let (v, n) = i64::decode_from(buf)?;
                (Value::Int(v), n)
            }
            FieldType::Uint8 => {
                let (v, n) = u8::decode_from(buf)?;
                (Value::Uint8(v), n)
            }
            FieldType::Uint16 => {
                let (v, n) = u16::decode_from(buf)?;
                (Value::Uint16(v), n)
            }
            FieldType::Uint32 => {
                let (v, n) = u32::decode_from(buf)?;
                (Value::Uint32(v), n)
            }
            FieldType::Uint64 => {
                let (v, n) = u64::decode_from(buf)?;
                (Value::Uint64(v), n)
            }
            FieldType::Uint => {
                let (v, n) = u64::decode_from(buf)?;
                (Value::Uint(v), n)
            }
            FieldType::Byte => {
                let (v, n) = u8::decode_from(buf)?;
                (Value::Byte(v), n)
            }
            FieldType::Rune => {
                let (raw, n) = u32::decode_from(buf)?;
                let c = char::from_u32(raw).ok_or(EncodingError::InvalidTag {
                    tag: raw,
                    type_name: "rune",
                })?;
                (Value::Rune(c), n)
            }
            FieldType::Float32 => {
                let (v, n) = f32::decode_from(buf)?;
                (Value::Float32(v), n)
            }
            FieldType::Float64 => {
                let (v, n) = f64::decode_from(buf)?;
                (Value::Float64(v), n)
            }
            FieldType::String => {
                let (v, n) = String::decode_from(buf)?;
                (Value::String(v), n)
            }
            FieldType::Bool => {
                let (v, n) = bool::decode_from(buf)?;
                (Value::Bool(v), n)
            }
            FieldType::Time => {
                let (v, n) = i64::decode_from(buf)?;
                (Value::Time(v), n)
            }
            FieldType::Duration => {
                let (v, n) = i64::decode_from(buf)?;
                (Value::Duration(v), n)
            }
            FieldType::Decimal => {
                let (v, n) = String::decode_from(buf)?;
                (Value::Decimal(v), n)
            }
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Field
// ------------------------------------------------------------------------------------------------

/// A single column declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Field name, unique within the schema.
    pub name: String,

    /// Declared primitive type.
    pub field_type: FieldType,

    /// Whether a secondary index is maintained for this field.
    #[serde(default)]
    pub indexed: bool,

    /// Whether the field may be absent (null) at insert.
    #[serde(default)]
    pub nullable: bool,

    /// Free-form documentation; not part of the schema identity.
    #[serde(default)]
    pub comment: String,
}

impl Field {
    /// Creates a non-indexed, non-nullable field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            indexed: false,
            nullable: false,
            comment: String::new(),
        }
    }

    /// Marks the field as indexed.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Marks the field as nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Attaches a comment.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

// ------------------------------------------------------------------------------------------------
// Schema
// ------------------------------------------------------------------------------------------------

/// Name of the implicit primary-sequence column.
pub const SEQ_COLUMN: &str = "_seq";

/// Name of the implicit insert-time column.
pub const TIME_COLUMN: &str = "_time";

/// An immutable, checksummed table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
    checksum: u32,
}

impl Schema {
    /// Builds a schema from an ordered field list.
    ///
    /// Rejects empty field lists, duplicate names, and names starting with
    /// `_` (reserved for the implicit `_seq` / `_time` columns).
    pub fn new(fields: Vec<Field>) -> Result<Self, SchemaError> {
        if fields.is_empty() {
            return Err(SchemaError::Invalid("schema has no fields".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for field in &fields {
            if field.name.is_empty() {
                return Err(SchemaError::Invalid("empty field name".into()));
            }
            if field.name.starts_with('_') {
                return Err(SchemaError::Invalid(format!(
                    "field name `{}` uses the reserved `_` prefix",
                    field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::FieldExists(field.name.clone()));
            }
        }

        let checksum = Self::compute_checksum(&fields)?;
        Ok(Self { fields, checksum })
    }

    /// Ordered field list.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Looks a field up by name, returning its position and declaration.
    pub fn field(&self, name: &str) -> Option<(usize, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    /// Fields declared `indexed`.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.indexed)
    }

    /// Checksum over the canonical field encoding.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Two schemas match iff their checksums match.
    pub fn matches(&self, other: &Schema) -> bool {
        self.checksum == other.checksum
    }

    /// CRC32 over the canonical encoding of the field list.
    ///
    /// Comments are excluded: editing documentation must not change the
    /// schema identity.
    fn compute_checksum(fields: &[Field]) -> Result<u32, SchemaError> {
        let mut buf = Vec::new();
        for field in fields {
            field.name.as_str().encode_to(&mut buf)?;
            field.field_type.tag().encode_to(&mut buf)?;
            field.indexed.encode_to(&mut buf)?;
            field.nullable.encode_to(&mut buf)?;
        }
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        Ok(hasher.finalize())
    }

    /// Validates a row's field map against this schema.
    ///
    /// Checks: every supplied name exists, every supplied value matches
    /// its field's type, nulls only appear on nullable fields, and every
    /// non-nullable field is present and non-null.
    pub fn validate(&self, values: &HashMap<String, Value>) -> Result<(), SchemaError> {
        for (name, value) in values {
            let Some((_, field)) = self.field(name) else {
                return Err(SchemaError::FieldNotFound(name.clone()));
            };
            if value.is_null() {
                if !field.nullable {
                    return Err(SchemaError::FieldRequired(name.clone()));
                }
            } else if !value.matches(field.field_type) {
                return Err(SchemaError::FieldTypeMismatch {
                    name: name.clone(),
                    expected: field.field_type.name(),
                    actual: value.type_name(),
                });
            }
        }

        for field in &self.fields {
            if !field.nullable {
                match values.get(&field.name) {
                    Some(v) if !v.is_null() => {}
                    _ => return Err(SchemaError::FieldRequired(field.name.clone())),
                }
            }
        }

        Ok(())
    }

    /// Persists the schema as JSON, fsync'ed, at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SchemaError> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut file = fs::File::create(path.as_ref())?;
        file.write_all(&json)?;
        file.sync_all()?;
        debug!(path = %path.as_ref().display(), checksum = self.checksum, "schema saved");
        Ok(())
    }

    /// Loads a schema from JSON and verifies its checksum.
    pub fn load(path: impl AsRef<Path>) -> Result<Schema, SchemaError> {
        let bytes = fs::read(path.as_ref())?;
        let schema: Schema = serde_json::from_slice(&bytes)?;

        let computed = Self::compute_checksum(&schema.fields)?;
        if computed != schema.checksum {
            return Err(SchemaError::ChecksumMismatch {
                stored: schema.checksum,
                computed,
            });
        }
        Ok(schema)
    }
}
