use tempfile::TempDir;

use super::helpers::*;
use crate::engine::*;
use crate::schema::Value;

fn seeded_engine(tmp: &TempDir) -> Engine {
    let engine = open_engine(tmp.path());
    for id in 1..=60u64 {
        let category = match id % 3 {
            0 => "tools",
            1 => "books",
            _ => "games",
        };
        let mut values = row_values(id, category);
        if id % 2 == 0 {
            values.insert("age".to_string(), Value::Int32((id % 40) as i32));
        }
        engine.insert(values).unwrap();
    }
    engine
}

#[test]
fn test_filter_eq_uses_index_and_matches_scan() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp);

    // Indexed path.
    let indexed = engine
        .query()
        .filter_eq("category", Value::String("tools".into()))
        .seqs()
        .unwrap();
    assert_eq!(indexed.len(), 20);
    assert!(indexed.iter().all(|s| s % 3 == 0));

    // Scan path over a non-indexed field must agree with the index on
    // the same logical condition.
    let scanned = engine
        .query()
        .filter(|row| row.get("category") == Some(&Value::String("tools".into())))
        .seqs()
        .unwrap();
    assert_eq!(indexed, scanned);
    engine.close().unwrap();
}

#[test]
fn test_index_answers_across_flush() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp);
    engine.flush().unwrap();

    // After flushing, half the data is in an L0 table; the index must
    // see exactly the same seq set.
    let seqs = engine
        .query()
        .filter_eq("category", Value::String("books".into()))
        .seqs()
        .unwrap();
    assert_eq!(seqs.len(), 20);
    assert!(seqs.iter().all(|s| s % 3 == 1));
    engine.close().unwrap();
}

#[test]
fn test_index_invariant_exact_seq_set() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp);

    // For every category, the indexed answer equals the brute-force
    // answer by definition of the index invariant.
    for category in ["tools", "books", "games"] {
        let by_index = engine
            .query()
            .filter_eq("category", Value::String(category.into()))
            .seqs()
            .unwrap();
        let mut expected = Vec::new();
        for seq in 1..=60u64 {
            let row = engine.get(seq).unwrap();
            if row.get("category") == Some(&Value::String(category.into())) {
                expected.push(seq);
            }
        }
        assert_eq!(by_index, expected, "category {category}");
    }
    engine.close().unwrap();
}

#[test]
fn test_predicate_and_eq_combination() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp);

    let rows = engine
        .query()
        .filter_eq("category", Value::String("games".into()))
        .filter(|row| matches!(row.get("age"), Some(Value::Int32(a)) if *a >= 10))
        .collect()
        .unwrap();

    for row in &rows {
        assert_eq!(row.get("category"), Some(&Value::String("games".into())));
        assert!(matches!(row.get("age"), Some(Value::Int32(a)) if *a >= 10));
    }
    assert!(!rows.is_empty());
    engine.close().unwrap();
}

#[test]
fn test_limit_first_last_count() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp);

    let limited = engine
        .query()
        .filter_eq("category", Value::String("books".into()))
        .limit(5)
        .collect()
        .unwrap();
    assert_eq!(limited.len(), 5);

    let first = engine
        .query()
        .filter_eq("category", Value::String("books".into()))
        .first()
        .unwrap()
        .unwrap();
    assert_eq!(first.get("category"), Some(&Value::String("books".into())));

    let last = engine
        .query()
        .filter_eq("category", Value::String("books".into()))
        .last()
        .unwrap()
        .unwrap();
    assert_eq!(last.get("category"), Some(&Value::String("books".into())));
    assert_ne!(first.seq, last.seq);

    let count = engine.query().count().unwrap();
    assert_eq!(count, 60);

    let none = engine
        .query()
        .filter_eq("category", Value::String("nonexistent".into()))
        .first()
        .unwrap();
    assert!(none.is_none());
    engine.close().unwrap();
}

#[test]
fn test_multiple_eq_conditions_intersect() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path());

    for id in 1..=20u64 {
        let category = if id <= 10 { "a" } else { "b" };
        let mut values = row_values(id, category);
        values.insert("name".to_string(), Value::String(format!("n{}", id % 2)));
        engine.insert(values).unwrap();
    }

    // category indexed, name not: mixed conditions fall back to scan
    // but still intersect correctly.
    let seqs = engine
        .query()
        .filter_eq("category", Value::String("a".into()))
        .filter_eq("name", Value::String("n0".into()))
        .seqs()
        .unwrap();
    assert_eq!(seqs, vec![2, 4, 6, 8, 10]);
    engine.close().unwrap();
}

#[test]
fn test_merged_iter_lazy_then_cached() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(tmp.path());
    for id in 1..=10u64 {
        engine.insert(row_values(id, "m")).unwrap();
    }

    let mut iter = engine.merged_iter(None).unwrap();

    // Lazy: pulling one row does not materialize the rest.
    let first = iter.next_row().unwrap().unwrap();
    assert_eq!(first.seq, 1);

    // len() materializes the remainder...
    assert_eq!(iter.len().unwrap(), 9);
    // ...and last() peeks the cache without consuming it.
    assert_eq!(iter.last().unwrap().unwrap().seq, 10);
    assert_eq!(iter.len().unwrap(), 9);

    // Iteration now reads from the cache.
    assert_eq!(iter.next_row().unwrap().unwrap().seq, 2);
    let rest = iter.collect_rows().unwrap();
    assert_eq!(rest.len(), 8);
    assert_eq!(rest.last().unwrap().seq, 10);

    engine.close().unwrap();
}

#[test]
fn test_scan_covers_all_layers_without_duplicates() {
    let tmp = TempDir::new().unwrap();
    let config = TableConfig {
        memtable_max_bytes: 4 * 1024,
        ..quiet_config()
    };
    let engine = Engine::open(tmp.path(), test_schema(), config).unwrap();

    for id in 1..=300u64 {
        engine.insert(row_values(id, "layered")).unwrap();
    }

    // Rows now live across active memtable, immutables, and L0 tables.
    let mut seqs = engine.query().seqs().unwrap();
    seqs.dedup();
    assert_eq!(seqs, (1..=300).collect::<Vec<u64>>());
    engine.close().unwrap();
}
