//! Archive index reader.
//!
//! ## Reading Strategy
//!
//! PMTiles keeps the header and root directory within the first 16 KiB, so a
//! single request recovers the top of the index:
//! 1. Fetch the first 16 KiB (or the whole archive when smaller)
//! 2. Parse and validate the 127-byte header
//! 3. Decode the root directory
//! 4. Descend only into leaf directories whose tile-id span is wanted,
//!    fetching each level in parallel with coalesced range requests
//!
//! This keeps remote extraction of a small area down to a handful of
//! requests no matter how large the archive is.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::directory::decode_directory;
use super::structures::{Entry, Header};
use super::writer::ROOT_BUDGET;
use crate::error::{ExtractError, FormatError};
use crate::extract::fetcher::{Fetcher, RangeHandler};
use crate::extract::filter::TileRanges;
use crate::extract::planner::{CopyPart, FetchRange, merge_ranges, select_entries};
use crate::io::ReadAt;

/// Leaf directories may nest at most this deep
pub const MAX_LEAF_DEPTH: usize = 4;

/// Parsed header and root directory of a source archive
pub struct ArchiveReader<R: ReadAt> {
    /// The underlying data source
    reader: Arc<R>,
    header: Header,
    root: Vec<Entry>,
}

impl<R: ReadAt + 'static> ArchiveReader<R> {
    /// Read and validate the header and root directory.
    pub async fn open(reader: Arc<R>) -> Result<Self, FormatError> {
        let size = reader.size();
        let initial_len = (ROOT_BUDGET as u64).min(size) as usize;
        let initial = reader.read_exact_at(0, initial_len).await?;

        let header = Header::from_bytes(&initial)?;
        for (what, offset, length) in [
            ("root directory", header.root_offset, header.root_length),
            ("metadata", header.metadata_offset, header.metadata_length),
            (
                "leaf directories",
                header.leaf_directory_offset,
                header.leaf_directory_length,
            ),
            ("tile data", header.tile_data_offset, header.tile_data_length),
        ] {
            check_section(what, offset, length, size)?;
        }

        let root_end = header.root_offset + header.root_length;
        let root_bytes = if root_end <= initial.len() as u64 {
            initial.slice(header.root_offset as usize..root_end as usize)
        } else {
            reader
                .read_exact_at(header.root_offset, header.root_length as usize)
                .await?
        };
        let root = decode_directory(&root_bytes, header.internal_compression)?;

        debug!(
            source = reader.identifier(),
            root_entries = root.len(),
            min_zoom = header.min_zoom,
            max_zoom = header.max_zoom,
            "parsed archive header"
        );

        Ok(Self {
            reader,
            header,
            root,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn root(&self) -> &[Entry] {
        &self.root
    }

    /// Get a reference to the underlying reader.
    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }

    /// Raw metadata blob, still in the archive's internal compression
    pub async fn read_metadata(&self) -> Result<Bytes, FormatError> {
        if self.header.metadata_length == 0 {
            return Ok(Bytes::new());
        }
        Ok(self
            .reader
            .read_exact_at(
                self.header.metadata_offset,
                self.header.metadata_length as usize,
            )
            .await?)
    }

    /// All tile entries intersecting `wanted`, sorted by tile id, runs clipped.
    ///
    /// Leaf directories outside `wanted` are never fetched.
    pub async fn relevant_entries(
        &self,
        wanted: &TileRanges,
        threads: usize,
        overfetch: f64,
    ) -> Result<Vec<Entry>, ExtractError> {
        let mut tiles = Vec::new();
        let mut leaves = Vec::new();
        select_entries(&self.root, u64::MAX, wanted, &mut tiles, &mut leaves);

        let mut depth = 0;
        while !leaves.is_empty() {
            depth += 1;
            if depth > MAX_LEAF_DEPTH {
                return Err(FormatError::LeafDepthExceeded(MAX_LEAF_DEPTH).into());
            }

            let entries: Vec<Entry> = leaves.iter().map(|(leaf, _)| *leaf).collect();
            let dirs = self.read_leaves(&entries, threads, overfetch).await?;
            debug!(depth, leaves = dirs.len(), "read leaf directories");

            let mut next = Vec::new();
            for ((_, upper), dir) in leaves.iter().zip(&dirs) {
                select_entries(dir, *upper, wanted, &mut tiles, &mut next);
            }
            leaves = next;
        }

        tiles.sort_unstable_by_key(|e| e.tile_id);
        if let Some(pair) = tiles.windows(2).find(|p| p[1].tile_id < p[0].end_id()) {
            return Err(FormatError::InvalidDirectory(format!(
                "entries overlap at tile id {}",
                pair[1].tile_id
            ))
            .into());
        }
        Ok(tiles)
    }

    /// Fetch and decode leaf directories, returned in the order given
    pub async fn read_leaves(
        &self,
        leaves: &[Entry],
        threads: usize,
        overfetch: f64,
    ) -> Result<Vec<Vec<Entry>>, ExtractError> {
        let base = self.header.leaf_directory_offset;
        let mut parts = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let end = leaf.offset.checked_add(u64::from(leaf.length));
            if end.is_none_or(|end| end > self.header.leaf_directory_length) {
                return Err(FormatError::InvalidDirectory(format!(
                    "leaf at {} (+{}) outside the leaf section",
                    leaf.offset, leaf.length
                ))
                .into());
            }
            parts.push(CopyPart {
                src_offset: base + leaf.offset,
                dst_offset: 0,
                length: u64::from(leaf.length),
            });
        }
        parts.sort_by_key(|p| (p.src_offset, p.length));
        parts.dedup();

        let collector = Arc::new(Collector::default());
        Fetcher::new(self.reader.clone(), threads)
            .run(merge_ranges(parts, overfetch), collector.clone())
            .await
            .map_err(|e| match e {
                ExtractError::Fetch { source, .. } => FormatError::Source(source).into(),
                other => other,
            })?;

        let buffers = collector.take();
        leaves
            .iter()
            .map(|leaf| -> Result<Vec<Entry>, ExtractError> {
                let key = (base + leaf.offset, u64::from(leaf.length));
                let bytes = buffers.get(&key).ok_or_else(|| {
                    ExtractError::Inconsistent(format!("leaf at {} was not fetched", key.0))
                })?;
                Ok(decode_directory(bytes, self.header.internal_compression)?)
            })
            .collect()
    }
}

fn check_section(what: &'static str, offset: u64, length: u64, size: u64) -> Result<(), FormatError> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(FormatError::Truncated {
            what,
            required: offset.saturating_add(length),
            actual: size,
        }),
    }
}

/// Keeps fetched slices in memory, keyed by `(source offset, length)`
#[derive(Default)]
struct Collector {
    buffers: Mutex<HashMap<(u64, u64), Bytes>>,
}

impl Collector {
    fn take(&self) -> HashMap<(u64, u64), Bytes> {
        std::mem::take(&mut *self.buffers.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl RangeHandler for Collector {
    async fn handle(&self, range: &FetchRange, data: Bytes) -> Result<(), ExtractError> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        for part in &range.parts {
            let start = (part.src_offset - range.offset) as usize;
            let slice = data.slice(start..start + part.length as usize);
            buffers.insert((part.src_offset, part.length), slice);
        }
        Ok(())
    }
}
