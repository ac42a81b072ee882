//! PMTiles v3 archive format.
//!
//! ## Architecture
//!
//! - [`structures`]: header and directory entry types
//! - [`tile_id`]: Hilbert-curve tile numbering
//! - [`directory`]: varint directory codec and internal compression
//! - [`parser`]: reading the index of a source archive
//! - [`writer`]: run-length collapsing, directory layout and write tracking
//!
//! ## Format Overview
//!
//! An archive consists of:
//! 1. A 127-byte header with section offsets, counts, zooms and bounds
//! 2. A root directory, always within the first 16 KiB
//! 3. An optional metadata blob (JSON, internally compressed)
//! 4. Optional leaf directories for archives with many entries
//! 5. Tile data
//!
//! ## Limitations
//!
//! - Directories and metadata: only `none` and `gzip` internal compression
//! - Version 2 archives are not read

pub mod directory;
pub mod parser;
pub mod structures;
pub mod tile_id;
pub mod writer;

pub use parser::ArchiveReader;
pub use structures::{Compression, Entry, Header, TileType};
pub use tile_id::{
    MAX_ZOOM, hilbert_index, tile_id_to_zxy, tile_id_zoom, zoom_base, zoom_tile_count,
    zxy_to_tile_id,
};
pub use writer::{ArchiveLayout, EntryAccumulator, WriteLog};
