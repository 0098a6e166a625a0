//! B+-tree file format for secondary indexes.
//!
//! The tree maps canonical value strings to sorted seq lists. Leaves are
//! chained for ascending iteration; interior pages hold separator keys
//! where each separator is the first key of its right child.
//!
//! # File layout
//!
//! ```text
//! magic(4) = "SRIX" | version(u16) | field_type(u16)
//! metadata: version u32 | min_seq u64 | max_seq u64 | row_count u64
//!           | created_at i64 | updated_at i64
//! root_offset(u64)
//! leaf pages … interior pages … root page last
//! footer: crc32(u32) over everything before it
//! ```
//!
//! # Page layout (nominal 4 KiB)
//!
//! ```text
//! type(u8: 1=leaf, 2=interior) | page_len(u32) | entry_count(u16)
//! leaf:     next_leaf(u64) | (key, seq_count u32, seq u64 …) …
//! interior: leftmost_child(u64) | (separator_key, child_offset u64) …
//! ```
//!
//! Keys are `u32`-length-prefixed UTF-8. A page grows past 4 KiB only
//! when a single entry cannot fit — a low-cardinality value with a long
//! seq list — so no entry is ever split across pages.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use tracing::debug;

use super::{IndexError, IndexMetadata};
use crate::encoding::{Decode, Encode};
use crate::schema::FieldType;

pub(crate) const INDEX_MAGIC: [u8; 4] = *b"SRIX";
pub(crate) const INDEX_VERSION: u16 = 1;
/// Nominal page capacity.
const PAGE_SIZE: usize = 4096;
/// magic(4) + version(2) + field_type(2) + metadata(44) + root_offset(8).
const HEADER_SIZE: usize = 60;
const METADATA_OFFSET: usize = 8;
const METADATA_SIZE: usize = 44;
const ROOT_OFFSET_POS: usize = HEADER_SIZE - 8;
const FOOTER_SIZE: usize = 4;

const PAGE_LEAF: u8 = 1;
const PAGE_INTERIOR: u8 = 2;
/// type(1) + page_len(4) + entry_count(2) + first-pointer(8).
const PAGE_HEADER_SIZE: usize = 15;

// ------------------------------------------------------------------------------------------------
// Metadata block
// ------------------------------------------------------------------------------------------------

fn encode_metadata(meta: &IndexMetadata) -> [u8; METADATA_SIZE] {
    let mut buf = [0u8; METADATA_SIZE];
    buf[..4].copy_from_slice(&meta.version.to_le_bytes());
    buf[4..12].copy_from_slice(&meta.min_seq.to_le_bytes());
    buf[12..20].copy_from_slice(&meta.max_seq.to_le_bytes());
    buf[20..28].copy_from_slice(&meta.row_count.to_le_bytes());
    buf[28..36].copy_from_slice(&meta.created_at.to_le_bytes());
    buf[36..44].copy_from_slice(&meta.updated_at.to_le_bytes());
    buf
}

fn decode_metadata(buf: &[u8]) -> Result<IndexMetadata, IndexError> {
    if buf.len() < METADATA_SIZE {
        return Err(IndexError::Corrupted("short metadata block".into()));
    }
    let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
    let u64_at = |o: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[o..o + 8]);
        u64::from_le_bytes(b)
    };
    let i64_at = |o: usize| u64_at(o) as i64;
    Ok(IndexMetadata {
        version: u32_at(0),
        min_seq: u64_at(4),
        max_seq: u64_at(12),
        row_count: u64_at(20),
        created_at: i64_at(28),
        updated_at: i64_at(36),
    })
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Writes a complete index file from sorted `(key, seqs)` entries.
///
/// The entry iterator must be sorted ascending by key (a `BTreeMap`
/// iteration order). The file is assembled in memory — secondary indexes
/// are small relative to the row data — then written to a `.tmp` path,
/// fsync'ed, and renamed into place.
pub(crate) fn write_tree<'a>(
    path: &Path,
    field_type: FieldType,
    metadata: &IndexMetadata,
    entries: impl Iterator<Item = (&'a String, &'a Vec<u64>)>,
) -> Result<(), IndexError> {
    // 1. Build leaf payloads (without next-pointers yet).
    let mut leaves: Vec<LeafDraft> = Vec::new();
    let mut current = LeafDraft::default();

    for (key, seqs) in entries {
        let mut entry = Vec::new();
        key.as_str()
            .encode_to(&mut entry)
            .map_err(IndexError::Encoding)?;
        (seqs.len() as u32)
            .encode_to(&mut entry)
            .map_err(IndexError::Encoding)?;
        for seq in seqs {
            seq.encode_to(&mut entry).map_err(IndexError::Encoding)?;
        }

        let projected = PAGE_HEADER_SIZE + current.body.len() + entry.len();
        if current.count > 0 && projected > PAGE_SIZE {
            leaves.push(std::mem::take(&mut current));
        }
        if current.count == 0 {
            current.first_key = key.clone();
        }
        current.body.extend_from_slice(&entry);
        current.count += 1;
    }
    if current.count > 0 {
        leaves.push(current);
    }

    // 2. Lay the leaves out and patch the chain.
    let mut pages: Vec<Vec<u8>> = Vec::new();
    let mut offsets: Vec<u64> = Vec::new();
    let mut cursor = HEADER_SIZE as u64;
    for leaf in &leaves {
        offsets.push(cursor);
        cursor += (PAGE_HEADER_SIZE + leaf.body.len()) as u64;
    }
    for (i, leaf) in leaves.iter().enumerate() {
        let next = offsets.get(i + 1).copied().unwrap_or(0);
        let page_len = (PAGE_HEADER_SIZE + leaf.body.len()) as u32;
        let mut page = Vec::with_capacity(page_len as usize);
        page.push(PAGE_LEAF);
        page.extend_from_slice(&page_len.to_le_bytes());
        page.extend_from_slice(&(leaf.count as u16).to_le_bytes());
        page.extend_from_slice(&next.to_le_bytes());
        page.extend_from_slice(&leaf.body);
        pages.push(page);
    }

    // 3. Build interior levels bottom-up until a single root remains.
    let mut children: Vec<(String, u64)> = leaves
        .iter()
        .zip(&offsets)
        .map(|(leaf, &off)| (leaf.first_key.clone(), off))
        .collect();

    let mut root_offset = children.first().map(|&(_, off)| off).unwrap_or(0);

    while children.len() > 1 {
        let mut next_level: Vec<(String, u64)> = Vec::new();
        let mut idx = 0;

        while idx < children.len() {
            let level_first_key = children[idx].0.clone();
            let leftmost = children[idx].1;
            idx += 1;

            let mut body = Vec::new();
            let mut count: u16 = 0;
            while idx < children.len() {
                let (ref key, child) = children[idx];
                let mut entry = Vec::new();
                key.as_str()
                    .encode_to(&mut entry)
                    .map_err(IndexError::Encoding)?;
                child.encode_to(&mut entry).map_err(IndexError::Encoding)?;
                if count > 0 && PAGE_HEADER_SIZE + body.len() + entry.len() > PAGE_SIZE {
                    break;
                }
                body.extend_from_slice(&entry);
                count += 1;
                idx += 1;
            }

            let page_len = (PAGE_HEADER_SIZE + body.len()) as u32;
            let mut page = Vec::with_capacity(page_len as usize);
            page.push(PAGE_INTERIOR);
            page.extend_from_slice(&page_len.to_le_bytes());
            page.extend_from_slice(&count.to_le_bytes());
            page.extend_from_slice(&leftmost.to_le_bytes());
            page.extend_from_slice(&body);

            next_level.push((level_first_key, cursor));
            root_offset = cursor;
            cursor += page_len as u64;
            pages.push(page);
        }

        children = next_level;
    }

    // 4. Assemble the file.
    let mut file_bytes = Vec::with_capacity(cursor as usize + FOOTER_SIZE);
    file_bytes.extend_from_slice(&INDEX_MAGIC);
    file_bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    file_bytes.extend_from_slice(&(field_type.tag() as u16).to_le_bytes());
    file_bytes.extend_from_slice(&encode_metadata(metadata));
    file_bytes.extend_from_slice(&root_offset.to_le_bytes());
    for page in &pages {
        file_bytes.extend_from_slice(page);
    }

    let mut hasher = Crc32::new();
    hasher.update(&file_bytes);
    let crc = hasher.finalize();
    file_bytes.extend_from_slice(&crc.to_le_bytes());

    // 5. Atomic replace.
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(&file_bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    debug!(
        path = %path.display(),
        leaves = offsets.len(),
        pages = pages.len(),
        rows = metadata.row_count,
        "index tree written"
    );
    Ok(())
}

#[derive(Default)]
struct LeafDraft {
    first_key: String,
    body: Vec<u8>,
    count: usize,
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Read-only, memory-mapped view of an index tree.
pub(crate) struct TreeReader {
    mmap: Mmap,
    field_type_tag: u16,
    metadata: IndexMetadata,
    root_offset: u64,
}

impl std::fmt::Debug for TreeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeReader")
            .field("metadata", &self.metadata)
            .field("root_offset", &self.root_offset)
            .finish_non_exhaustive()
    }
}

enum Page {
    Leaf {
        entries: Vec<(String, Vec<u64>)>,
        next: u64,
    },
    Interior {
        leftmost: u64,
        entries: Vec<(String, u64)>,
    },
}

impl TreeReader {
    /// Opens and validates an index file.
    pub(crate) fn open(path: &Path) -> Result<Self, IndexError> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(IndexError::Corrupted("file too small".into()));
        }
        if mmap[..4] != INDEX_MAGIC {
            return Err(IndexError::InvalidMagicNumber);
        }
        let version = u16::from_le_bytes([mmap[4], mmap[5]]);
        if version != INDEX_VERSION {
            return Err(IndexError::UnsupportedVersion(version));
        }
        let field_type_tag = u16::from_le_bytes([mmap[6], mmap[7]]);

        let footer_start = mmap.len() - FOOTER_SIZE;
        let stored_crc = u32::from_le_bytes([
            mmap[footer_start],
            mmap[footer_start + 1],
            mmap[footer_start + 2],
            mmap[footer_start + 3],
        ]);
        let mut hasher = Crc32::new();
        hasher.update(&mmap[..footer_start]);
        if hasher.finalize() != stored_crc {
            return Err(IndexError::ChecksumMismatch);
        }

        let metadata = decode_metadata(&mmap[METADATA_OFFSET..METADATA_OFFSET + METADATA_SIZE])?;
        let mut root = [0u8; 8];
        root.copy_from_slice(&mmap[ROOT_OFFSET_POS..ROOT_OFFSET_POS + 8]);
        let root_offset = u64::from_le_bytes(root);

        Ok(Self {
            mmap,
            field_type_tag,
            metadata,
            root_offset,
        })
    }

    pub(crate) fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub(crate) fn field_type_tag(&self) -> u16 {
        self.field_type_tag
    }

    /// `true` when the tree holds no entries.
    pub(crate) fn is_empty(&self) -> bool {
        self.root_offset == 0
    }

    fn parse_page(&self, offset: u64) -> Result<Page, IndexError> {
        let start = offset as usize;
        let data_end = self.mmap.len() - FOOTER_SIZE;
        if start < HEADER_SIZE || start + PAGE_HEADER_SIZE > data_end {
            return Err(IndexError::Corrupted(format!(
                "page offset {offset} out of range"
            )));
        }

        let page_type = self.mmap[start];
        let page_len = u32::from_le_bytes([
            self.mmap[start + 1],
            self.mmap[start + 2],
            self.mmap[start + 3],
            self.mmap[start + 4],
        ]) as usize;
        let count = u16::from_le_bytes([self.mmap[start + 5], self.mmap[start + 6]]) as usize;
        if page_len < PAGE_HEADER_SIZE || start + page_len > data_end {
            return Err(IndexError::Corrupted("page overruns file".into()));
        }

        let mut pointer = [0u8; 8];
        pointer.copy_from_slice(&self.mmap[start + 7..start + 15]);
        let pointer = u64::from_le_bytes(pointer);

        let mut body = &self.mmap[start + PAGE_HEADER_SIZE..start + page_len];

        match page_type {
            PAGE_LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let (key, n) = String::decode_from(body)?;
                    body = &body[n..];
                    let (seq_count, n) = u32::decode_from(body)?;
                    body = &body[n..];
                    let mut seqs = Vec::with_capacity(seq_count as usize);
                    for _ in 0..seq_count {
                        let (seq, n) = u64::decode_from(body)?;
                        body = &body[n..];
                        seqs.push(seq);
                    }
                    entries.push((key, seqs));
                }
                Ok(Page::Leaf {
                    entries,
                    next: pointer,
                })
            }
            PAGE_INTERIOR => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let (key, n) = String::decode_from(body)?;
                    body = &body[n..];
                    let (child, n) = u64::decode_from(body)?;
                    body = &body[n..];
                    entries.push((key, child));
                }
                Ok(Page::Interior {
                    leftmost: pointer,
                    entries,
                })
            }
            other => Err(IndexError::Corrupted(format!("unknown page type {other}"))),
        }
    }

    /// Looks up the seq list stored for `key`, if any.
    pub(crate) fn get(&self, key: &str) -> Result<Option<Vec<u64>>, IndexError> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut offset = self.root_offset;
        loop {
            match self.parse_page(offset)? {
                Page::Interior { leftmost, entries } => {
                    let mut child = leftmost;
                    for (separator, candidate) in &entries {
                        if key >= separator.as_str() {
                            child = *candidate;
                        } else {
                            break;
                        }
                    }
                    offset = child;
                }
                Page::Leaf { entries, .. } => {
                    return Ok(entries
                        .into_iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, seqs)| seqs));
                }
            }
        }
    }

    fn first_leaf_offset(&self) -> Result<Option<u64>, IndexError> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut offset = self.root_offset;
        loop {
            match self.parse_page(offset)? {
                Page::Interior { leftmost, .. } => offset = leftmost,
                Page::Leaf { .. } => return Ok(Some(offset)),
            }
        }
    }

    /// All leaf offsets in ascending key order.
    fn leaf_offsets(&self) -> Result<Vec<u64>, IndexError> {
        let mut offsets = Vec::new();
        let mut next = self.first_leaf_offset()?;
        while let Some(offset) = next {
            offsets.push(offset);
            next = match self.parse_page(offset)? {
                Page::Leaf { next: 0, .. } => None,
                Page::Leaf { next, .. } => Some(next),
                Page::Interior { .. } => {
                    return Err(IndexError::Corrupted("interior page in leaf chain".into()));
                }
            };
        }
        Ok(offsets)
    }

    /// Visits `(key, seqs)` in ascending key order until the callback
    /// says stop.
    pub(crate) fn for_each(
        &self,
        mut f: impl FnMut(&str, &[u64]) -> std::ops::ControlFlow<()>,
    ) -> Result<(), IndexError> {
        let mut next = self.first_leaf_offset()?;
        while let Some(offset) = next {
            match self.parse_page(offset)? {
                Page::Leaf { entries, next: n } => {
                    for (key, seqs) in &entries {
                        if f(key, seqs).is_break() {
                            return Ok(());
                        }
                    }
                    next = if n == 0 { None } else { Some(n) };
                }
                Page::Interior { .. } => {
                    return Err(IndexError::Corrupted("interior page in leaf chain".into()));
                }
            }
        }
        Ok(())
    }

    /// Visits `(key, seqs)` in descending key order until the callback
    /// says stop.
    pub(crate) fn for_each_desc(
        &self,
        mut f: impl FnMut(&str, &[u64]) -> std::ops::ControlFlow<()>,
    ) -> Result<(), IndexError> {
        let offsets = self.leaf_offsets()?;
        for offset in offsets.into_iter().rev() {
            match self.parse_page(offset)? {
                Page::Leaf { entries, .. } => {
                    for (key, seqs) in entries.iter().rev() {
                        if f(key, seqs).is_break() {
                            return Ok(());
                        }
                    }
                }
                Page::Interior { .. } => {
                    return Err(IndexError::Corrupted("interior page in leaf chain".into()));
                }
            }
        }
        Ok(())
    }

    /// Folds every persisted entry into the given map, unioning seq
    /// lists. Used when rebuilding the in-memory view before a write.
    pub(crate) fn fold_into(
        &self,
        map: &mut std::collections::BTreeMap<String, Vec<u64>>,
    ) -> Result<(), IndexError> {
        self.for_each(|key, seqs| {
            let slot = map.entry(key.to_string()).or_default();
            slot.extend_from_slice(seqs);
            slot.sort_unstable();
            slot.dedup();
            std::ops::ControlFlow::Continue(())
        })
    }
}
