use std::collections::BTreeMap;
use std::ops::ControlFlow;

use tempfile::TempDir;

use crate::index::*;
use crate::schema::{FieldType, Value};

/// Writes a legacy-format JSON index file by hand.
fn write_legacy(dir: &std::path::Path, field: &str) {
    let mut entries: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    entries.insert("books".to_string(), vec![2, 5]);
    entries.insert("electronics".to_string(), vec![1, 3, 4]);

    let blob = serde_json::json!({
        "metadata": {
            "version": 1,
            "min_seq": 1,
            "max_seq": 5,
            "row_count": 5,
            "created_at": 1_700_000_000_000_000_000i64,
            "updated_at": 1_700_000_000_000_000_000i64,
        },
        "entries": entries,
    });
    std::fs::write(
        dir.join(index_file_name(field)),
        serde_json::to_vec(&blob).unwrap(),
    )
    .unwrap();
}

#[test]
fn test_legacy_load_serves_reads() {
    let tmp = TempDir::new().unwrap();
    write_legacy(tmp.path(), "category");

    let idx = SecondaryIndex::open(tmp.path(), "category", FieldType::String).unwrap();
    assert!(idx.is_legacy());
    assert_eq!(idx.metadata().max_seq, 5);
    assert_eq!(idx.metadata().row_count, 5);

    assert_eq!(
        idx.get(&Value::String("electronics".into())).unwrap(),
        vec![1, 3, 4]
    );
    assert_eq!(idx.get(&Value::String("books".into())).unwrap(), vec![2, 5]);

    // Iteration over legacy data works in both directions.
    let mut keys = Vec::new();
    idx.for_each(|key, _| {
        keys.push(key.to_string());
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(keys, vec!["books", "electronics"]);

    let mut desc = Vec::new();
    idx.for_each_desc(|key, _| {
        desc.push(key.to_string());
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(desc, vec!["electronics", "books"]);
}

#[test]
fn test_legacy_refuses_writes() {
    let tmp = TempDir::new().unwrap();
    write_legacy(tmp.path(), "category");

    let mut idx = SecondaryIndex::open(tmp.path(), "category", FieldType::String).unwrap();

    assert!(matches!(
        idx.add(&Value::String("toys".into()), 6).unwrap_err(),
        IndexError::LegacyFormat
    ));
    assert!(matches!(idx.build().unwrap_err(), IndexError::LegacyFormat));
    assert!(matches!(
        idx.incremental_update(10, |_| None).unwrap_err(),
        IndexError::LegacyFormat
    ));
}

#[test]
fn test_rebuild_migrates_off_legacy() {
    let tmp = TempDir::new().unwrap();
    write_legacy(tmp.path(), "category");

    let mut idx = SecondaryIndex::open(tmp.path(), "category", FieldType::String).unwrap();
    assert!(idx.is_legacy());

    // Rebuild from a row fetcher covering seqs 1..=6.
    let absorbed = idx
        .rebuild(6, |seq| {
            Some(Value::String(
                if seq % 2 == 0 { "books" } else { "electronics" }.into(),
            ))
        })
        .unwrap();
    assert_eq!(absorbed, 6);
    assert!(!idx.is_legacy());

    // Writes work again and the file is now tree-format.
    idx.add(&Value::String("toys".into()), 7).unwrap();
    idx.build().unwrap();

    let reopened = SecondaryIndex::open(tmp.path(), "category", FieldType::String).unwrap();
    assert!(!reopened.is_legacy());
    assert_eq!(
        reopened.get(&Value::String("books".into())).unwrap(),
        vec![2, 4, 6]
    );
    assert_eq!(reopened.get(&Value::String("toys".into())).unwrap(), vec![7]);
}
