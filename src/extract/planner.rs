use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;

use super::filter::TileRanges;
use crate::pmtiles::{Entry, EntryAccumulator};

/// One unique tile payload to copy from the source into the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPart {
    /// Absolute offset in the source
    pub src_offset: u64,
    /// Offset relative to the output tile data section
    pub dst_offset: u64,
    pub length: u64,
}

/// A contiguous source byte range fetched with a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRange {
    pub offset: u64,
    pub length: u64,
    /// Copies satisfied by this range, sorted by source offset
    pub parts: Vec<CopyPart>,
}

impl FetchRange {
    /// Bytes fetched that no part uses
    pub fn wasted_bytes(&self) -> u64 {
        let mut used = 0;
        let mut covered_to = self.offset;
        for p in &self.parts {
            let end = p.src_offset + p.length;
            if end > covered_to {
                used += end - p.src_offset.max(covered_to);
                covered_to = end;
            }
        }
        self.length - used
    }
}

/// Result of mapping selected source entries onto the output layout
#[derive(Debug, Clone, Default)]
pub struct CopyPlan {
    /// Output directory entries, run-length collapsed
    pub entries: Vec<Entry>,
    /// Unique payloads in output order
    pub parts: Vec<CopyPart>,
    /// Size of the output tile data section
    pub tile_data_length: u64,
}

impl CopyPlan {
    pub fn addressed_tiles(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.run_length)).sum()
    }
}

/// Collect the parts of `dir` that fall inside `wanted`.
///
/// Tile entries are clipped to the wanted ids, splitting runs where needed.
/// Leaf entries whose span (up to the next entry, or `upper` for the last
/// one) intersects `wanted` are returned with their upper bound.
pub fn select_entries(
    dir: &[Entry],
    upper: u64,
    wanted: &TileRanges,
    tiles: &mut Vec<Entry>,
    leaves: &mut Vec<(Entry, u64)>,
) {
    for (i, entry) in dir.iter().enumerate() {
        if entry.is_leaf() {
            let hi = dir.get(i + 1).map_or(upper, |next| next.tile_id);
            if wanted.intersects(entry.tile_id, hi) {
                leaves.push((*entry, hi));
            }
            continue;
        }

        for r in wanted.clip(entry.tile_id, entry.end_id().min(upper)) {
            tiles.push(Entry {
                tile_id: r.start,
                offset: entry.offset,
                length: entry.length,
                run_length: (r.end - r.start) as u32,
            });
        }
    }
}

/// Assign output offsets to the selected entries.
///
/// `selected` must be sorted by tile id. Payloads are laid out in tile-id
/// order of first use; entries sharing a source payload share the output
/// copy. `source_tile_data` is the absolute offset of the source tile data
/// section.
pub fn plan_copies(selected: &[Entry], source_tile_data: u64) -> CopyPlan {
    let mut accumulator = EntryAccumulator::new();
    let mut seen: HashMap<(u64, u32), u64> = HashMap::new();
    let mut parts = Vec::new();
    let mut total = 0u64;

    for e in selected {
        let dst = match seen.entry((e.offset, e.length)) {
            MapEntry::Occupied(o) => *o.get(),
            MapEntry::Vacant(v) => {
                let dst = total;
                v.insert(dst);
                parts.push(CopyPart {
                    src_offset: source_tile_data + e.offset,
                    dst_offset: dst,
                    length: u64::from(e.length),
                });
                total += u64::from(e.length);
                dst
            }
        };
        accumulator.push(Entry {
            tile_id: e.tile_id,
            offset: dst,
            length: e.length,
            run_length: e.run_length,
        });
    }

    CopyPlan {
        entries: accumulator.finish(),
        parts,
        tile_data_length: total,
    }
}

/// Coalesce copies into fetch ranges.
///
/// Touching or overlapping copies always share a range. Remaining gaps are
/// bridged smallest first for as long as the total bridged bytes stay within
/// `overfetch` times the bytes actually needed.
pub fn merge_ranges(mut parts: Vec<CopyPart>, overfetch: f64) -> Vec<FetchRange> {
    if parts.is_empty() {
        return Vec::new();
    }
    parts.sort_by_key(|p| (p.src_offset, p.length, p.dst_offset));

    let needed: u64 = parts.iter().map(|p| p.length).sum();
    let budget = (overfetch.max(0.0) * needed as f64).floor() as u64;

    // gaps[i] separates parts[i - 1] (and everything before it) from parts[i]
    let mut gaps = vec![0u64; parts.len()];
    let mut end = parts[0].src_offset + parts[0].length;
    for i in 1..parts.len() {
        gaps[i] = parts[i].src_offset.saturating_sub(end);
        end = end.max(parts[i].src_offset + parts[i].length);
    }

    let mut join = vec![false; parts.len()];
    let mut candidates = Vec::new();
    for i in 1..parts.len() {
        if gaps[i] == 0 {
            join[i] = true;
        } else {
            candidates.push(i);
        }
    }
    candidates.sort_by_key(|&i| (gaps[i], i));

    let mut spent = 0u64;
    for i in candidates {
        if spent + gaps[i] > budget {
            break;
        }
        spent += gaps[i];
        join[i] = true;
    }

    let mut ranges: Vec<FetchRange> = Vec::new();
    for (i, part) in parts.into_iter().enumerate() {
        let part_end = part.src_offset + part.length;
        match ranges.last_mut() {
            Some(range) if join[i] => {
                let range_end = (range.offset + range.length).max(part_end);
                range.length = range_end - range.offset;
                range.parts.push(part);
            }
            _ => ranges.push(FetchRange {
                offset: part.src_offset,
                length: part.length,
                parts: vec![part],
            }),
        }
    }
    ranges
}
