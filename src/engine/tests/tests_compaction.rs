use tempfile::TempDir;

use super::helpers::*;
use crate::engine::*;
use crate::schema::Value;

/// Config that makes every flushed file "big" so compaction promotes
/// L0 files to L1 immediately.
fn upgrade_config() -> TableConfig {
    TableConfig {
        memtable_max_bytes: 8 * 1024,
        l0_small_threshold: 1,
        l1_target_file_size: 1024 * 1024,
        ..quiet_config()
    }
}

/// Config where every flushed file is "small" so stage 0 coalesces L0
/// runs first.
fn coalesce_config() -> TableConfig {
    TableConfig {
        memtable_max_bytes: 8 * 1024,
        l0_small_threshold: u64::MAX,
        l1_target_file_size: 1024 * 1024,
        ..quiet_config()
    }
}

#[test]
fn test_compact_upgrades_l0_to_l1() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_schema(), upgrade_config()).unwrap();

    for id in 1..=600u64 {
        engine.insert(row_values(id, "c")).unwrap();
    }
    engine.flush().unwrap();
    engine.compact().unwrap();

    let after = engine.stats().unwrap();
    assert_eq!(after.files_per_level[0], 0, "L0 drained");
    assert!(after.files_per_level[1] >= 1, "rows promoted to L1");
    assert_eq!(after.total_rows, 600);

    // Every row is still readable after the promotion.
    for seq in 1..=600u64 {
        assert_eq!(engine.get(seq).unwrap().seq, seq);
    }
    engine.close().unwrap();
}

#[test]
fn test_compact_coalesces_small_l0_runs() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_schema(), coalesce_config()).unwrap();

    for id in 1..=400u64 {
        engine.insert(row_values(id, "c")).unwrap();
    }
    engine.flush().unwrap();
    engine.compact().unwrap();

    // All files are "small", so repeated stage-0 passes converge to a
    // single L0 file holding everything.
    let after = engine.stats().unwrap();
    assert_eq!(after.files_per_level[0], 1);
    assert!(after.files_per_level[1..].iter().all(|&n| n == 0));
    assert_eq!(after.total_rows, 400);

    for seq in [1u64, 200, 400] {
        assert_eq!(engine.get(seq).unwrap().seq, seq);
    }
    engine.close().unwrap();
}

#[test]
fn test_seq_union_is_preserved_across_compaction() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_schema(), upgrade_config()).unwrap();

    for id in 1..=500u64 {
        engine.insert(row_values(id, "u")).unwrap();
    }
    engine.flush().unwrap();
    let before = engine.query().seqs().unwrap();

    engine.compact().unwrap();
    let after = engine.query().seqs().unwrap();
    assert_eq!(before, after);
    engine.close().unwrap();
}

#[test]
fn test_l1_ranges_disjoint_after_compaction() {
    let tmp = TempDir::new().unwrap();
    let config = TableConfig {
        // Small L1 target forces multiple L1 output files.
        l1_target_file_size: 16 * 1024,
        ..upgrade_config()
    };
    let engine = Engine::open(tmp.path(), test_schema(), config).unwrap();

    for id in 1..=800u64 {
        engine.insert(row_values(id, "d")).unwrap();
    }
    engine.flush().unwrap();
    engine.compact().unwrap();

    // Inspect the published version directly: L1+ files must have
    // pairwise disjoint seq ranges sorted by min_seq.
    let version = engine.inner_version_for_tests();
    for n in 1..crate::version::MAX_LEVEL {
        let files = version.level(n);
        for pair in files.windows(2) {
            assert!(
                pair[0].max_seq < pair[1].min_seq,
                "level {n} ranges overlap"
            );
        }
    }

    for seq in 1..=800u64 {
        assert_eq!(engine.get(seq).unwrap().seq, seq);
    }
    engine.close().unwrap();
}

#[test]
fn test_queries_agree_before_and_after_compaction() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_schema(), upgrade_config()).unwrap();

    for id in 1..=300u64 {
        let category = if id % 5 == 0 { "five" } else { "rest" };
        engine.insert(row_values(id, category)).unwrap();
    }
    engine.flush().unwrap();

    let before = engine
        .query()
        .filter_eq("category", Value::String("five".into()))
        .seqs()
        .unwrap();

    engine.compact().unwrap();

    let after = engine
        .query()
        .filter_eq("category", Value::String("five".into()))
        .seqs()
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(after.len(), 60);
    engine.close().unwrap();
}
