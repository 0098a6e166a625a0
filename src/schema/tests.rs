use std::collections::HashMap;

use tempfile::TempDir;

use super::*;

fn sample_schema() -> Schema {
    Schema::new(vec![
        Field::new("id", FieldType::Uint64),
        Field::new("name", FieldType::String),
        Field::new("category", FieldType::String).indexed(),
        Field::new("price", FieldType::Float64).nullable(),
        Field::new("active", FieldType::Bool).nullable().comment("soft-delete flag"),
    ])
    .unwrap()
}

#[test]
fn test_tags_are_stable_and_unique() {
    let mut seen = std::collections::HashSet::new();
    for ft in FieldType::ALL {
        let tag = ft.tag();
        assert!(tag >= 1 && tag <= 19);
        assert!(seen.insert(tag), "duplicate tag {tag}");
        assert_eq!(FieldType::from_tag(tag), Some(ft));
    }
    assert_eq!(FieldType::from_tag(0), None);
    assert_eq!(FieldType::from_tag(20), None);
}

#[test]
fn test_value_payload_roundtrip_all_types() {
    let cases: Vec<(FieldType, Value)> = vec![
        (FieldType::Int8, Value::Int8(-8)),
        (FieldType::Int16, Value::Int16(-1600)),
        (FieldType::Int32, Value::Int32(i32::MIN)),
        (FieldType::Int64, Value::Int64(i64::MAX)),
        (FieldType::Int, Value::Int(-42)),
        (FieldType::Uint8, Value::Uint8(255)),
        (FieldType::Uint16, Value::Uint16(65535)),
        (FieldType::Uint32, Value::Uint32(u32::MAX)),
        (FieldType::Uint64, Value::Uint64(u64::MAX)),
        (FieldType::Uint, Value::Uint(7)),
        (FieldType::Byte, Value::Byte(0xAB)),
        (FieldType::Rune, Value::Rune('λ')),
        (FieldType::Float32, Value::Float32(1.5)),
        (FieldType::Float64, Value::Float64(-2.25)),
        (FieldType::String, Value::String("hello".into())),
        (FieldType::Bool, Value::Bool(true)),
        (FieldType::Time, Value::Time(1_700_000_000_000_000_000)),
        (FieldType::Duration, Value::Duration(-5_000)),
        (FieldType::Decimal, Value::Decimal("123.456789012345678901".into())),
    ];

    for (ft, value) in cases {
        let mut buf = Vec::new();
        value.encode_payload(&mut buf).unwrap();
        let (decoded, consumed) = Value::decode_payload(ft, &buf).unwrap();
        assert_eq!(decoded, value, "type {}", ft.name());
        assert_eq!(consumed, buf.len());
    }
}

#[test]
fn test_rune_rejects_invalid_scalar() {
    // 0xD800 is a surrogate, not a valid Unicode scalar value.
    let buf = 0xD800u32.to_le_bytes();
    assert!(Value::decode_payload(FieldType::Rune, &buf).is_err());
}

#[test]
fn test_schema_rejects_duplicates_and_reserved_names() {
    let err = Schema::new(vec![
        Field::new("a", FieldType::Int64),
        Field::new("a", FieldType::String),
    ])
    .unwrap_err();
    assert!(matches!(err, SchemaError::FieldExists(name) if name == "a"));

    assert!(Schema::new(vec![Field::new("_seq", FieldType::Uint64)]).is_err());
    assert!(Schema::new(vec![]).is_err());
}

#[test]
fn test_checksum_identity() {
    let a = sample_schema();
    let b = sample_schema();
    assert!(a.matches(&b));

    // Comments do not affect identity.
    let c = Schema::new(vec![
        Field::new("id", FieldType::Uint64).comment("primary business id"),
        Field::new("name", FieldType::String),
        Field::new("category", FieldType::String).indexed(),
        Field::new("price", FieldType::Float64).nullable(),
        Field::new("active", FieldType::Bool).nullable(),
    ])
    .unwrap();
    assert!(a.matches(&c));

    // Changing a type does.
    let d = Schema::new(vec![
        Field::new("id", FieldType::Int64),
        Field::new("name", FieldType::String),
        Field::new("category", FieldType::String).indexed(),
        Field::new("price", FieldType::Float64).nullable(),
        Field::new("active", FieldType::Bool).nullable(),
    ])
    .unwrap();
    assert!(!a.matches(&d));
}

#[test]
fn test_validate_happy_path() {
    let schema = sample_schema();
    let mut row = HashMap::new();
    row.insert("id".to_string(), Value::Uint64(1));
    row.insert("name".to_string(), Value::String("widget".into()));
    row.insert("category".to_string(), Value::String("tools".into()));
    row.insert("price".to_string(), Value::Float64(9.99));
    schema.validate(&row).unwrap();

    // Nullable fields may be omitted entirely or set to Null.
    row.insert("active".to_string(), Value::Null);
    schema.validate(&row).unwrap();
}

#[test]
fn test_validate_failures() {
    let schema = sample_schema();

    let mut missing_required = HashMap::new();
    missing_required.insert("id".to_string(), Value::Uint64(1));
    missing_required.insert("category".to_string(), Value::String("x".into()));
    let err = schema.validate(&missing_required).unwrap_err();
    assert!(matches!(err, SchemaError::FieldRequired(name) if name == "name"));

    let mut unknown = HashMap::new();
    unknown.insert("bogus".to_string(), Value::Bool(true));
    assert!(matches!(
        schema.validate(&unknown).unwrap_err(),
        SchemaError::FieldNotFound(_)
    ));

    let mut wrong_type = HashMap::new();
    wrong_type.insert("id".to_string(), Value::String("1".into()));
    wrong_type.insert("name".to_string(), Value::String("n".into()));
    wrong_type.insert("category".to_string(), Value::String("c".into()));
    assert!(matches!(
        schema.validate(&wrong_type).unwrap_err(),
        SchemaError::FieldTypeMismatch { .. }
    ));

    // Null on a non-nullable field is FieldRequired, not a type error.
    let mut null_required = HashMap::new();
    null_required.insert("id".to_string(), Value::Null);
    null_required.insert("name".to_string(), Value::String("n".into()));
    null_required.insert("category".to_string(), Value::String("c".into()));
    assert!(matches!(
        schema.validate(&null_required).unwrap_err(),
        SchemaError::FieldRequired(_)
    ));
}

#[test]
fn test_save_and_load_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(SCHEMA_FILE);

    let schema = sample_schema();
    schema.save(&path).unwrap();

    let loaded = Schema::load(&path).unwrap();
    assert!(schema.matches(&loaded));
    assert_eq!(loaded.fields().len(), 5);
    assert!(loaded.field("category").unwrap().1.indexed);
}

#[test]
fn test_load_detects_tampering() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(SCHEMA_FILE);
    sample_schema().save(&path).unwrap();

    // Flip a field type in the JSON without fixing the checksum.
    let text = std::fs::read_to_string(&path).unwrap();
    let tampered = text.replacen("uint64", "int64", 1);
    std::fs::write(&path, tampered).unwrap();

    assert!(matches!(
        Schema::load(&path).unwrap_err(),
        SchemaError::ChecksumMismatch { .. }
    ));
}

#[test]
fn test_index_keys() {
    assert_eq!(Value::Null.index_key(), None);
    assert_eq!(Value::Int64(-5).index_key().unwrap(), "-5");
    assert_eq!(Value::String("abc".into()).index_key().unwrap(), "abc");
    assert_eq!(Value::Bool(false).index_key().unwrap(), "false");
    assert_eq!(Value::Rune('x').index_key().unwrap(), "x");
}
