use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

use crate::error::FormatError;

/// Compression applied to directories, metadata or tile payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Unknown,
    None,
    Gzip,
    Brotli,
    Zstd,
    Other(u8),
}

impl Compression {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Compression::Unknown,
            1 => Compression::None,
            2 => Compression::Gzip,
            3 => Compression::Brotli,
            4 => Compression::Zstd,
            _ => Compression::Other(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Compression::Unknown => 0,
            Compression::None => 1,
            Compression::Gzip => 2,
            Compression::Brotli => 3,
            Compression::Zstd => 4,
            Compression::Other(v) => *v,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Unknown => f.write_str("unknown"),
            Compression::None => f.write_str("none"),
            Compression::Gzip => f.write_str("gzip"),
            Compression::Brotli => f.write_str("brotli"),
            Compression::Zstd => f.write_str("zstd"),
            Compression::Other(v) => write!(f, "other({v})"),
        }
    }
}

/// Content type of the tiles in an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileType {
    Unknown,
    Mvt,
    Png,
    Jpeg,
    Webp,
    Avif,
    Other(u8),
}

impl TileType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TileType::Unknown,
            1 => TileType::Mvt,
            2 => TileType::Png,
            3 => TileType::Jpeg,
            4 => TileType::Webp,
            5 => TileType::Avif,
            _ => TileType::Other(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            TileType::Unknown => 0,
            TileType::Mvt => 1,
            TileType::Png => 2,
            TileType::Jpeg => 3,
            TileType::Webp => 4,
            TileType::Avif => 5,
            TileType::Other(v) => *v,
        }
    }
}

/// Fixed-size archive header (PMTiles v3) - 127 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub root_offset: u64,
    pub root_length: u64,
    pub metadata_offset: u64,
    pub metadata_length: u64,
    pub leaf_directory_offset: u64,
    pub leaf_directory_length: u64,
    pub tile_data_offset: u64,
    pub tile_data_length: u64,
    pub addressed_tiles_count: u64,
    pub tile_entries_count: u64,
    pub tile_contents_count: u64,
    pub clustered: bool,
    pub internal_compression: Compression,
    pub tile_compression: Compression,
    pub tile_type: TileType,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub min_lon_e7: i32,
    pub min_lat_e7: i32,
    pub max_lon_e7: i32,
    pub max_lat_e7: i32,
    pub center_zoom: u8,
    pub center_lon_e7: i32,
    pub center_lat_e7: i32,
}

impl Header {
    pub const MAGIC: &'static [u8] = b"PMTiles";
    pub const VERSION: u8 = 3;
    pub const SIZE: usize = 127;

    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < Self::MAGIC.len() || &data[0..7] != Self::MAGIC {
            return Err(FormatError::InvalidMagic);
        }
        if data.len() < Self::SIZE {
            return Err(FormatError::Truncated {
                what: "header",
                required: Self::SIZE as u64,
                actual: data.len() as u64,
            });
        }
        if data[7] != Self::VERSION {
            return Err(FormatError::UnsupportedVersion(data[7]));
        }

        let mut cursor = Cursor::new(&data[8..Self::SIZE]);
        let truncated = |_| FormatError::Truncated {
            what: "header",
            required: Self::SIZE as u64,
            actual: data.len() as u64,
        };

        let header = Self {
            root_offset: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            root_length: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            metadata_offset: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            metadata_length: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            leaf_directory_offset: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            leaf_directory_length: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            tile_data_offset: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            tile_data_length: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            addressed_tiles_count: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            tile_entries_count: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            tile_contents_count: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            clustered: cursor.read_u8().map_err(truncated)? == 1,
            internal_compression: Compression::from_u8(cursor.read_u8().map_err(truncated)?),
            tile_compression: Compression::from_u8(cursor.read_u8().map_err(truncated)?),
            tile_type: TileType::from_u8(cursor.read_u8().map_err(truncated)?),
            min_zoom: cursor.read_u8().map_err(truncated)?,
            max_zoom: cursor.read_u8().map_err(truncated)?,
            min_lon_e7: cursor.read_i32::<LittleEndian>().map_err(truncated)?,
            min_lat_e7: cursor.read_i32::<LittleEndian>().map_err(truncated)?,
            max_lon_e7: cursor.read_i32::<LittleEndian>().map_err(truncated)?,
            max_lat_e7: cursor.read_i32::<LittleEndian>().map_err(truncated)?,
            center_zoom: cursor.read_u8().map_err(truncated)?,
            center_lon_e7: cursor.read_i32::<LittleEndian>().map_err(truncated)?,
            center_lat_e7: cursor.read_i32::<LittleEndian>().map_err(truncated)?,
        };

        if header.max_zoom > super::MAX_ZOOM {
            return Err(FormatError::ZoomOutOfRange(header.max_zoom));
        }
        if header.min_zoom > header.max_zoom {
            return Err(FormatError::InvalidDirectory(format!(
                "header min zoom {} exceeds max zoom {}",
                header.min_zoom, header.max_zoom
            )));
        }

        Ok(header)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(Self::MAGIC);
        out.push(Self::VERSION);

        // Writes into a Vec cannot fail
        let _ = self.write_fields(&mut out);
        out
    }

    fn write_fields(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        for v in [
            self.root_offset,
            self.root_length,
            self.metadata_offset,
            self.metadata_length,
            self.leaf_directory_offset,
            self.leaf_directory_length,
            self.tile_data_offset,
            self.tile_data_length,
            self.addressed_tiles_count,
            self.tile_entries_count,
            self.tile_contents_count,
        ] {
            out.write_u64::<LittleEndian>(v)?;
        }
        out.write_u8(u8::from(self.clustered))?;
        out.write_u8(self.internal_compression.as_u8())?;
        out.write_u8(self.tile_compression.as_u8())?;
        out.write_u8(self.tile_type.as_u8())?;
        out.write_u8(self.min_zoom)?;
        out.write_u8(self.max_zoom)?;
        out.write_i32::<LittleEndian>(self.min_lon_e7)?;
        out.write_i32::<LittleEndian>(self.min_lat_e7)?;
        out.write_i32::<LittleEndian>(self.max_lon_e7)?;
        out.write_i32::<LittleEndian>(self.max_lat_e7)?;
        out.write_u8(self.center_zoom)?;
        out.write_i32::<LittleEndian>(self.center_lon_e7)?;
        out.write_i32::<LittleEndian>(self.center_lat_e7)?;
        Ok(())
    }
}

/// One directory record.
///
/// `run_length > 0` addresses tiles `tile_id .. tile_id + run_length`, all
/// stored at the same `offset`/`length` in the tile data section.
/// `run_length == 0` points at a leaf directory inside the leaf section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub tile_id: u64,
    pub offset: u64,
    pub length: u32,
    pub run_length: u32,
}

impl Entry {
    pub fn is_leaf(&self) -> bool {
        self.run_length == 0
    }

    /// One past the last tile id covered by a tile entry
    pub fn end_id(&self) -> u64 {
        self.tile_id + u64::from(self.run_length)
    }
}
