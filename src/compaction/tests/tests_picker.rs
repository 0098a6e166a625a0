use std::sync::Arc;

use crate::compaction::*;
use crate::version::{FileMetadata, Version, VersionEdit, VersionSet};

const MIB: u64 = 1024 * 1024;

fn picker() -> CompactionPicker {
    CompactionPicker {
        l0_small_threshold: 32 * MIB,
        l1_target_file_size: 256 * MIB,
        level_multiplier: 10,
    }
}

fn file(number: u64, level: u32, size_mib: u64, min_seq: u64, max_seq: u64) -> FileMetadata {
    FileMetadata {
        file_number: number,
        level,
        file_size: size_mib * MIB,
        min_seq,
        max_seq,
        row_count: max_seq - min_seq + 1,
    }
}

/// Builds a version snapshot through a real version set so the level
/// ordering matches what the engine publishes.
fn version_of(files: Vec<FileMetadata>) -> Arc<Version> {
    let tmp = tempfile::TempDir::new().unwrap();
    let set = VersionSet::open(tmp.path()).unwrap();
    let next = files.iter().map(|f| f.file_number).max().unwrap_or(0) + 1;
    set.log_and_apply(VersionEdit {
        added: files,
        deleted: vec![],
        next_file_number: Some(next),
    })
    .unwrap();
    set.current()
}

#[test]
fn test_stage0_merges_small_run_and_spares_lone_small() {
    // Sizes [29, 36, 8, 15] MiB over seq ranges [1-100, 101-200,
    // 201-300, 301-400]: the only run of ≥2 small files is 3+4.
    let v = version_of(vec![
        file(1, 0, 29, 1, 100),
        file(2, 0, 36, 101, 200),
        file(3, 0, 8, 201, 300),
        file(4, 0, 15, 301, 400),
    ]);

    let tasks = picker().pick(&v);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].output_level, 0);
    assert_eq!(tasks[0].input_numbers(), vec![3, 4]);

    // Seq continuity of the run: the task spans exactly [201, 400].
    let min = tasks[0].inputs.iter().map(|f| f.min_seq).min().unwrap();
    let max = tasks[0].inputs.iter().map(|f| f.max_seq).max().unwrap();
    assert_eq!((min, max), (201, 400));
}

#[test]
fn test_stage1_after_stage0_upgrades_everything() {
    // The same L0 after the stage-0 merge landed: [29, 36, 23] MiB.
    // No small run remains, so stage 1 runs: anchor = file 2 (36 MiB),
    // absorbs file 1 to the left and the merged file 5 to the right.
    // Combined 88 MiB ≤ 256 MiB.
    let v = version_of(vec![
        file(1, 0, 29, 1, 100),
        file(2, 0, 36, 101, 200),
        file(5, 0, 23, 201, 400),
    ]);

    let tasks = picker().pick(&v);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].output_level, 1);
    assert_eq!(tasks[0].input_numbers(), vec![1, 2, 5]);
    let total: u64 = tasks[0].inputs.iter().map(|f| f.file_size).sum();
    assert_eq!(total, 88 * MIB);
}

#[test]
fn test_stage1_anchor_expansion_covers_all_four() {
    // Sizes [40, 20, 50, 45] MiB — big/small/big/big. No small run, so
    // stage 1 fires immediately: the first anchor absorbs everything
    // (total 155 MiB ≤ 256 MiB), preserving natural order.
    let v = version_of(vec![
        file(1, 0, 40, 1, 100),
        file(2, 0, 20, 101, 200),
        file(3, 0, 50, 201, 300),
        file(4, 0, 45, 301, 400),
    ]);

    let tasks = picker().pick(&v);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].output_level, 1);
    assert_eq!(tasks[0].input_numbers(), vec![1, 2, 3, 4]);
    let total: u64 = tasks[0].inputs.iter().map(|f| f.file_size).sum();
    assert_eq!(total, 155 * MIB);
}

#[test]
fn test_stage1_respects_size_cap_and_claiming() {
    // Two anchors that cannot merge: 200 + 100 MiB > 256 MiB, so the
    // second anchor keeps only itself plus the small file next to it.
    let v = version_of(vec![
        file(1, 0, 200, 1, 100),
        file(2, 0, 100, 101, 200),
        file(3, 0, 20, 201, 300),
    ]);

    let tasks = picker().pick(&v);
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].input_numbers(), vec![1]);
    assert_eq!(tasks[0].output_level, 1);
    assert_eq!(tasks[1].input_numbers(), vec![2, 3]);
    assert_eq!(tasks[1].output_level, 1);
}

#[test]
fn test_stage1_left_expansion_precedes_right() {
    // Tight cap of 130 MiB. The anchor (file 2, 100 MiB) takes its left
    // neighbor first (total 120 MiB); the right neighbor would overflow
    // the cap and is left in L0. Had expansion gone right first, the
    // task would have been [2, 3] instead.
    let tight = CompactionPicker {
        l0_small_threshold: 32 * MIB,
        l1_target_file_size: 130 * MIB,
        level_multiplier: 10,
    };
    let v = version_of(vec![
        file(1, 0, 20, 1, 100),
        file(2, 0, 100, 101, 200),
        file(3, 0, 20, 201, 300),
    ]);

    let tasks = tight.pick(&v);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].input_numbers(), vec![1, 2]);
    assert_eq!(tasks[0].output_level, 1);
}

#[test]
fn test_lone_small_file_is_left_for_stage1() {
    // A single small file with no big neighbor: stage 0 ignores it and
    // stage 1 has no anchor, so nothing happens.
    let v = version_of(vec![file(1, 0, 8, 1, 100)]);
    assert!(picker().pick(&v).is_empty());
}

#[test]
fn test_two_small_files_do_merge() {
    let v = version_of(vec![file(1, 0, 8, 1, 100), file(2, 0, 9, 101, 180)]);
    let tasks = picker().pick(&v);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].input_numbers(), vec![1, 2]);
    assert_eq!(tasks[0].output_level, 0);
}

#[test]
fn test_stage0_multiple_runs() {
    // small small BIG small small small → two tasks: [1,2] and [4,5,6].
    let v = version_of(vec![
        file(1, 0, 5, 1, 10),
        file(2, 0, 6, 11, 20),
        file(3, 0, 64, 21, 30),
        file(4, 0, 7, 31, 40),
        file(5, 0, 8, 41, 50),
        file(6, 0, 9, 51, 60),
    ]);

    let tasks = picker().pick(&v);
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].input_numbers(), vec![1, 2]);
    assert_eq!(tasks[1].input_numbers(), vec![4, 5, 6]);
    assert!(tasks.iter().all(|t| t.output_level == 0));
}

#[test]
fn test_stage2_picks_smallest_min_seq_with_overlaps() {
    // L1 over budget (300 MiB > 256 MiB): the file with the smallest
    // min_seq goes down, dragging the overlapping L2 file with it.
    let v = version_of(vec![
        file(1, 1, 150, 1, 1000),
        file(2, 1, 150, 1001, 2000),
        file(3, 2, 100, 500, 800),
        file(4, 2, 100, 5000, 6000),
    ]);

    let tasks = picker().pick(&v);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].output_level, 2);
    assert_eq!(tasks[0].input_numbers(), vec![1, 3]);
}

#[test]
fn test_stage2_quiet_when_within_budget() {
    let v = version_of(vec![file(1, 1, 100, 1, 1000)]);
    assert!(picker().pick(&v).is_empty());
}

#[test]
fn test_level_budgets_are_geometric() {
    let p = picker();
    assert_eq!(p.level_max_bytes(1), 256 * MIB);
    assert_eq!(p.level_max_bytes(2), 2560 * MIB);
    assert_eq!(p.level_max_bytes(3), 25600 * MIB);
}

#[test]
fn test_stage_barrier_stage0_blocks_stage1() {
    // Both a small run and an eligible anchor exist; only the stage-0
    // task is returned this tick.
    let v = version_of(vec![
        file(1, 0, 40, 1, 100),
        file(2, 0, 8, 101, 200),
        file(3, 0, 9, 201, 300),
    ]);

    let tasks = picker().pick(&v);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].output_level, 0);
    assert_eq!(tasks[0].input_numbers(), vec![2, 3]);
}
