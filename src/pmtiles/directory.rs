//! Directory encoding.
//!
//! A serialized directory is a varint entry count followed by four columns:
//! tile id deltas, run lengths, lengths and offsets. An offset of `0` after
//! the first entry means "directly after the previous entry", any other value
//! is `offset + 1`. The result is then compressed with the archive's internal
//! compression.

use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

use super::structures::{Compression, Entry};
use crate::error::FormatError;

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, FormatError> {
    let start = *pos;
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos).ok_or(FormatError::InvalidVarint(start))?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(FormatError::InvalidVarint(start));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(FormatError::InvalidVarint(start));
        }
    }
}

/// Serialize entries without compression
pub fn serialize_entries(entries: &[Entry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 6 + 4);
    write_varint(&mut out, entries.len() as u64);

    let mut last_id = 0;
    for e in entries {
        write_varint(&mut out, e.tile_id - last_id);
        last_id = e.tile_id;
    }
    for e in entries {
        write_varint(&mut out, u64::from(e.run_length));
    }
    for e in entries {
        write_varint(&mut out, u64::from(e.length));
    }
    for (i, e) in entries.iter().enumerate() {
        let contiguous =
            i > 0 && e.offset == entries[i - 1].offset + u64::from(entries[i - 1].length);
        if contiguous {
            write_varint(&mut out, 0);
        } else {
            write_varint(&mut out, e.offset + 1);
        }
    }
    out
}

/// Parse uncompressed directory bytes
pub fn deserialize_entries(data: &[u8]) -> Result<Vec<Entry>, FormatError> {
    let mut pos = 0;
    let count = read_varint(data, &mut pos)?;
    // Each entry needs at least four bytes, so a larger count is corrupt
    if count > data.len() as u64 {
        return Err(FormatError::InvalidDirectory(format!(
            "entry count {count} exceeds directory size {}",
            data.len()
        )));
    }
    let count = count as usize;

    let mut entries = vec![
        Entry {
            tile_id: 0,
            offset: 0,
            length: 0,
            run_length: 0,
        };
        count
    ];

    let mut last_id = 0u64;
    for entry in entries.iter_mut() {
        let delta = read_varint(data, &mut pos)?;
        last_id = last_id
            .checked_add(delta)
            .ok_or_else(|| FormatError::InvalidDirectory("tile id overflow".to_string()))?;
        entry.tile_id = last_id;
    }
    for entry in entries.iter_mut() {
        entry.run_length = read_u32(data, &mut pos, "run length")?;
    }
    for entry in entries.iter_mut() {
        entry.length = read_u32(data, &mut pos, "length")?;
    }
    for i in 0..count {
        let value = read_varint(data, &mut pos)?;
        entries[i].offset = if value == 0 {
            if i == 0 {
                return Err(FormatError::InvalidDirectory(
                    "first entry has a relative offset".to_string(),
                ));
            }
            entries[i - 1].offset + u64::from(entries[i - 1].length)
        } else {
            value - 1
        };
    }

    for pair in entries.windows(2) {
        if pair[1].tile_id <= pair[0].tile_id {
            return Err(FormatError::InvalidDirectory(format!(
                "tile ids not strictly increasing at {}",
                pair[1].tile_id
            )));
        }
    }

    Ok(entries)
}

fn read_u32(data: &[u8], pos: &mut usize, what: &str) -> Result<u32, FormatError> {
    let value = read_varint(data, pos)?;
    u32::try_from(value)
        .map_err(|_| FormatError::InvalidDirectory(format!("{what} {value} exceeds 32 bits")))
}

pub fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>, FormatError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
            encoder.write_all(data).map_err(FormatError::Decompress)?;
            encoder.finish().map_err(FormatError::Decompress)
        }
        other => Err(FormatError::UnsupportedCompression(other.to_string())),
    }
}

pub fn decompress(data: &[u8], compression: Compression) -> Result<Vec<u8>, FormatError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut out = Vec::with_capacity(data.len() * 4);
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(FormatError::Decompress)?;
            Ok(out)
        }
        other => Err(FormatError::UnsupportedCompression(other.to_string())),
    }
}

/// Serialize and compress a directory
pub fn encode_directory(
    entries: &[Entry],
    compression: Compression,
) -> Result<Vec<u8>, FormatError> {
    compress(&serialize_entries(entries), compression)
}

/// Decompress and parse a directory
pub fn decode_directory(data: &[u8], compression: Compression) -> Result<Vec<Entry>, FormatError> {
    deserialize_entries(&decompress(data, compression)?)
}

/// Locate the entry covering `tile_id` in a sorted directory.
///
/// Returns a tile entry whose run contains the id, or the leaf entry whose
/// span may contain it.
pub fn find_tile(entries: &[Entry], tile_id: u64) -> Option<&Entry> {
    let idx = entries.partition_point(|e| e.tile_id <= tile_id);
    let entry = entries.get(idx.checked_sub(1)?)?;
    if entry.is_leaf() || tile_id < entry.end_id() {
        Some(entry)
    } else {
        None
    }
}
