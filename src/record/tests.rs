use std::collections::HashMap;
use std::sync::Arc;

use super::*;
use crate::schema::{Field, FieldType, Schema, Value};

fn codec() -> RowCodec {
    let schema = Schema::new(vec![
        Field::new("id", FieldType::Uint64),
        Field::new("name", FieldType::String),
        Field::new("email", FieldType::String).nullable(),
        Field::new("phone", FieldType::String).nullable(),
        Field::new("age", FieldType::Int32).nullable(),
    ])
    .unwrap();
    RowCodec::new(Arc::new(schema))
}

fn row(seq: u64, values: Vec<(&str, Value)>) -> Row {
    Row {
        seq,
        time: 1_700_000_000_000_000_000 + seq as i64,
        values: values
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    }
}

#[test]
fn test_encode_decode_identity() {
    let codec = codec();
    let original = row(
        7,
        vec![
            ("id", Value::Uint64(7)),
            ("name", Value::String("Alice".into())),
            ("email", Value::String("a@x".into())),
            ("phone", Value::String("p".into())),
            ("age", Value::Int32(25)),
        ],
    );

    let bytes = codec.encode(&original).unwrap();
    let decoded = codec.decode(&bytes).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn test_encode_is_deterministic() {
    let codec = codec();
    let r = row(
        1,
        vec![
            ("id", Value::Uint64(1)),
            ("name", Value::String("Bob".into())),
            ("phone", Value::String("p2".into())),
        ],
    );
    assert_eq!(codec.encode(&r).unwrap(), codec.encode(&r).unwrap());
}

#[test]
fn test_null_bitmap_for_omitted_fields() {
    let codec = codec();
    // "Charlie" supplies only the required fields.
    let r = row(
        3,
        vec![
            ("id", Value::Uint64(3)),
            ("name", Value::String("Charlie".into())),
        ],
    );
    let bytes = codec.encode(&r).unwrap();

    // Bitmap byte sits right after the fixed header; fields 2, 3, 4
    // (email, phone, age) must have their bits set.
    let bitmap = bytes[RECORD_HEADER_SIZE];
    assert_eq!(bitmap, 0b0001_1100);

    let decoded = codec.decode(&bytes).unwrap();
    assert_eq!(decoded.get("email"), Some(&Value::Null));
    assert_eq!(decoded.get("phone"), Some(&Value::Null));
    assert_eq!(decoded.get("age"), Some(&Value::Null));
    assert!(decoded.is_null("age"));
    assert_eq!(decoded.get("name"), Some(&Value::String("Charlie".into())));
}

#[test]
fn test_explicit_null_equals_omitted() {
    let codec = codec();
    let omitted = row(
        5,
        vec![
            ("id", Value::Uint64(5)),
            ("name", Value::String("D".into())),
        ],
    );
    let explicit = row(
        5,
        vec![
            ("id", Value::Uint64(5)),
            ("name", Value::String("D".into())),
            ("email", Value::Null),
            ("phone", Value::Null),
            ("age", Value::Null),
        ],
    );
    assert_eq!(
        codec.encode(&omitted).unwrap(),
        codec.encode(&explicit).unwrap()
    );
}

#[test]
fn test_record_len_and_seq_peek() {
    let codec = codec();
    let r = row(
        42,
        vec![
            ("id", Value::Uint64(42)),
            ("name", Value::String("x".into())),
        ],
    );
    let bytes = codec.encode(&r).unwrap();
    assert_eq!(RowCodec::record_len(&bytes).unwrap(), bytes.len());
    assert_eq!(RowCodec::record_seq(&bytes).unwrap(), 42);
}

#[test]
fn test_corrupted_payload_fails_checksum() {
    let codec = codec();
    let r = row(
        9,
        vec![
            ("id", Value::Uint64(9)),
            ("name", Value::String("Eve".into())),
        ],
    );
    let mut bytes = codec.encode(&r).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;

    assert!(matches!(
        codec.decode(&bytes).unwrap_err(),
        RecordError::ChecksumMismatch(_)
    ));
}

#[test]
fn test_truncated_record_fails() {
    let codec = codec();
    let r = row(
        9,
        vec![
            ("id", Value::Uint64(9)),
            ("name", Value::String("Eve".into())),
        ],
    );
    let bytes = codec.encode(&r).unwrap();
    assert!(matches!(
        codec.decode(&bytes[..bytes.len() - 3]).unwrap_err(),
        RecordError::Truncated { .. }
    ));
}

#[test]
fn test_field_count_mismatch_across_schemas() {
    let codec = codec();
    let r = row(
        1,
        vec![
            ("id", Value::Uint64(1)),
            ("name", Value::String("n".into())),
        ],
    );
    let bytes = codec.encode(&r).unwrap();

    let other = RowCodec::new(Arc::new(
        Schema::new(vec![Field::new("id", FieldType::Uint64)]).unwrap(),
    ));
    assert!(matches!(
        other.decode(&bytes).unwrap_err(),
        RecordError::FieldCountMismatch { .. }
    ));
}

#[test]
fn test_records_are_self_delimiting() {
    let codec = codec();
    let a = row(
        1,
        vec![
            ("id", Value::Uint64(1)),
            ("name", Value::String("a".into())),
        ],
    );
    let b = row(
        2,
        vec![
            ("id", Value::Uint64(2)),
            ("name", Value::String("bb".into())),
            ("age", Value::Int32(1)),
        ],
    );

    let mut stream = codec.encode(&a).unwrap();
    let b_bytes = codec.encode(&b).unwrap();
    stream.extend_from_slice(&b_bytes);

    let first_len = RowCodec::record_len(&stream).unwrap();
    let first = codec.decode(&stream[..first_len]).unwrap();
    assert_eq!(first.seq, 1);

    let second = codec.decode(&stream[first_len..]).unwrap();
    assert_eq!(second.seq, 2);
    assert_eq!(second.get("age"), Some(&Value::Int32(1)));
}
