//! Output archive assembly.
//!
//! Output layout: header | root directory | metadata | leaf directories |
//! tile data. Directory offsets are relative to their sections, so the whole
//! layout is known as soon as the output entries are, before any tile byte
//! has been fetched.

use std::sync::Mutex;

use super::directory::encode_directory;
use super::structures::{Compression, Entry, Header};
use crate::error::{ExtractError, FormatError};

/// Readers fetch this much up front, so header and root must fit in it
pub const ROOT_BUDGET: usize = 16384;

/// Builds a sorted entry list, collapsing consecutive identical tiles into runs
#[derive(Debug, Default)]
pub struct EntryAccumulator {
    entries: Vec<Entry>,
}

impl EntryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Entries must arrive in increasing tile-id order.
    pub fn push(&mut self, entry: Entry) {
        debug_assert!(!entry.is_leaf());
        if let Some(last) = self.entries.last_mut() {
            debug_assert!(entry.tile_id >= last.end_id());
            let extends_run = last.end_id() == entry.tile_id
                && last.offset == entry.offset
                && last.length == entry.length;
            if extends_run {
                if let Some(run) = last.run_length.checked_add(entry.run_length) {
                    last.run_length = run;
                    return;
                }
            }
        }
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self) -> Vec<Entry> {
        self.entries
    }
}

/// Serialized directories and the section offsets derived from them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub root: Vec<u8>,
    pub leaves: Vec<u8>,
    pub leaf_count: usize,
    pub root_offset: u64,
    pub metadata_offset: u64,
    pub metadata_length: u64,
    pub leaf_directory_offset: u64,
    pub tile_data_offset: u64,
    pub tile_data_length: u64,
}

impl ArchiveLayout {
    /// Lay out an archive holding `entries`, a metadata blob of
    /// `metadata_length` bytes and `tile_data_length` bytes of tiles.
    pub fn build(
        entries: &[Entry],
        metadata_length: u64,
        tile_data_length: u64,
        compression: Compression,
    ) -> Result<Self, FormatError> {
        let (root, leaves, leaf_count) =
            optimize_directories(entries, ROOT_BUDGET - Header::SIZE, compression)?;

        let root_offset = Header::SIZE as u64;
        let metadata_offset = root_offset + root.len() as u64;
        let leaf_directory_offset = metadata_offset + metadata_length;
        let tile_data_offset = leaf_directory_offset + leaves.len() as u64;

        Ok(Self {
            root,
            leaves,
            leaf_count,
            root_offset,
            metadata_offset,
            metadata_length,
            leaf_directory_offset,
            tile_data_offset,
            tile_data_length,
        })
    }

    /// Size of the finished archive in bytes
    pub fn total_length(&self) -> u64 {
        self.tile_data_offset + self.tile_data_length
    }

    /// Copy section offsets and lengths into `header`
    pub fn fill_header(&self, header: &mut Header) {
        header.root_offset = self.root_offset;
        header.root_length = self.root.len() as u64;
        header.metadata_offset = self.metadata_offset;
        header.metadata_length = self.metadata_length;
        header.leaf_directory_offset = self.leaf_directory_offset;
        header.leaf_directory_length = self.leaves.len() as u64;
        header.tile_data_offset = self.tile_data_offset;
        header.tile_data_length = self.tile_data_length;
    }
}

/// Fit the directory into the root budget, spilling into leaves if needed.
///
/// Returns `(root, leaves, leaf_count)`.
fn optimize_directories(
    entries: &[Entry],
    target_root_len: usize,
    compression: Compression,
) -> Result<(Vec<u8>, Vec<u8>, usize), FormatError> {
    if entries.len() < 16384 {
        let root = encode_directory(entries, compression)?;
        if root.len() <= target_root_len {
            return Ok((root, Vec::new(), 0));
        }
    }

    let mut leaf_size = (entries.len() as f64 / 3500.0).max(4096.0);
    loop {
        let (root, leaves, count) = build_roots_leaves(entries, leaf_size as usize, compression)?;
        if root.len() <= target_root_len {
            return Ok((root, leaves, count));
        }
        leaf_size *= 1.2;
    }
}

fn build_roots_leaves(
    entries: &[Entry],
    leaf_size: usize,
    compression: Compression,
) -> Result<(Vec<u8>, Vec<u8>, usize), FormatError> {
    let mut root_entries = Vec::new();
    let mut leaves = Vec::new();

    for chunk in entries.chunks(leaf_size.max(1)) {
        let serialized = encode_directory(chunk, compression)?;
        root_entries.push(Entry {
            tile_id: chunk[0].tile_id,
            offset: leaves.len() as u64,
            length: serialized.len() as u32,
            run_length: 0,
        });
        leaves.extend_from_slice(&serialized);
    }

    let root = encode_directory(&root_entries, compression)?;
    Ok((root, leaves, root_entries.len()))
}

/// Log of tile copies completed by the fetch workers
#[derive(Debug, Default)]
pub struct WriteLog {
    records: Mutex<Vec<(u64, u64)>>,
}

impl WriteLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a copy of `length` bytes at tile-data offset `offset`
    pub fn record(&self, offset: u64, length: u64) {
        self.lock().push((offset, length));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that exactly the planned `(offset, length)` copies were written.
    ///
    /// Returns the number of tile bytes written.
    pub fn verify(&self, planned: &[(u64, u64)]) -> Result<u64, ExtractError> {
        let mut written = self.lock().clone();
        written.sort_unstable();
        let mut expected = planned.to_vec();
        expected.sort_unstable();

        if written != expected {
            let missing = expected
                .iter()
                .filter(|p| written.binary_search(p).is_err())
                .count();
            return Err(ExtractError::Inconsistent(format!(
                "{} tile copies written, {} planned, {} planned copies missing",
                written.len(),
                expected.len(),
                missing
            )));
        }

        Ok(written.iter().map(|(_, len)| len).sum())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, u64)>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}
