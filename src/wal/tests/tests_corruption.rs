use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use tempfile::TempDir;

use crate::wal::*;

fn fill_segment(tmp: &TempDir, count: u64) {
    let wal = WalManager::open(tmp.path(), WalFlushPolicy::Always).unwrap();
    for seq in 1..=count {
        wal.append(seq, format!("payload-{seq}").as_bytes()).unwrap();
    }
}

fn first_segment_path(tmp: &TempDir) -> std::path::PathBuf {
    tmp.path().join(WAL_DIR).join(segment_file_name(1))
}

#[test]
fn test_torn_tail_is_truncated() {
    let tmp = TempDir::new().unwrap();
    fill_segment(&tmp, 100);

    // Chop the last frame in half.
    let path = first_segment_path(&tmp);
    let len = fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 5).unwrap();

    let wal = WalManager::open(tmp.path(), WalFlushPolicy::Always).unwrap();
    let mut seqs = Vec::new();
    let report = wal.replay(0, |seq, _| seqs.push(seq)).unwrap();

    assert!(report.truncated);
    assert_eq!(report.last_seq, 99);
    assert_eq!(seqs.len(), 99);
    assert_eq!(*seqs.last().unwrap(), 99);

    // The segment was truncated at the last good frame: a second replay
    // sees a clean file.
    let wal2 = WalManager::open(tmp.path(), WalFlushPolicy::Always).unwrap();
    let report2 = wal2.replay(0, |_, _| {}).unwrap();
    assert!(!report2.truncated);
    assert_eq!(report2.last_seq, 99);
}

#[test]
fn test_bit_flip_stops_replay_at_corruption() {
    let tmp = TempDir::new().unwrap();
    fill_segment(&tmp, 50);

    // Flip a byte roughly in the middle of the file: every frame from
    // the damaged one onward is discarded.
    let path = first_segment_path(&tmp);
    let len = fs::metadata(&path).unwrap().len();
    let mut file = OpenOptions::new().write(true).read(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(len / 2)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    file.sync_all().unwrap();

    let wal = WalManager::open(tmp.path(), WalFlushPolicy::Always).unwrap();
    let mut seqs = Vec::new();
    let report = wal.replay(0, |seq, _| seqs.push(seq)).unwrap();

    assert!(report.truncated);
    assert!(report.last_seq < 50);
    assert!(!seqs.is_empty());
    // Delivered seqs are a contiguous prefix.
    for (i, seq) in seqs.iter().enumerate() {
        assert_eq!(*seq, i as u64 + 1);
    }
}

#[test]
fn test_later_segments_skipped_after_corrupt_tail() {
    let tmp = TempDir::new().unwrap();
    {
        let wal = WalManager::open(tmp.path(), WalFlushPolicy::Always).unwrap();
        for seq in 1..=10u64 {
            wal.append(seq, b"first").unwrap();
        }
        wal.rotate().unwrap();
        for seq in 11..=20u64 {
            wal.append(seq, b"second").unwrap();
        }
    }

    // Corrupt the *first* segment; the second must not be replayed, since
    // ordering across the corruption point can no longer be trusted.
    let path = first_segment_path(&tmp);
    let len = fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 3).unwrap();

    let wal = WalManager::open(tmp.path(), WalFlushPolicy::Always).unwrap();
    let mut seqs = Vec::new();
    let report = wal.replay(0, |seq, _| seqs.push(seq)).unwrap();

    assert!(report.truncated);
    assert_eq!(seqs.len(), 9);
    assert!(seqs.iter().all(|&s| s <= 9));
    assert_eq!(report.last_seq, 9);
}

#[test]
fn test_garbage_length_field() {
    let tmp = TempDir::new().unwrap();
    fill_segment(&tmp, 3);

    // Append a frame whose length field is absurd.
    let path = first_segment_path(&tmp);
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&u32::MAX.to_le_bytes()).unwrap();
    file.write_all(&[0u8; 12]).unwrap();
    file.sync_all().unwrap();

    let wal = WalManager::open(tmp.path(), WalFlushPolicy::Always).unwrap();
    let mut count = 0;
    let report = wal.replay(0, |_, _| count += 1).unwrap();
    assert!(report.truncated);
    assert_eq!(count, 3);
    assert_eq!(report.last_seq, 3);
}
