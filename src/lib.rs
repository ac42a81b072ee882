//! # pmextract
//!
//! Extract a bounding box and zoom range from a PMTiles archive into a new,
//! self-contained archive.
//!
//! The source can be a local file or an HTTP(S) URL. Remote archives are
//! read with HTTP Range requests: only the header, the needed directories and
//! the selected tiles are downloaded, with nearby byte ranges merged into
//! single requests according to an overfetch ratio.
//!
//! ## Features
//!
//! - Local files and HTTP/HTTPS sources through the [`ReadAt`] trait
//! - Hilbert tile-id range computation for bounding boxes at any zoom
//! - Leaf directories, deduplicated tiles and run-length entries preserved
//! - Parallel downloads with tiles written out of order via [`RandomAccessSink`]
//! - Dry runs reporting the exact output size
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use pmextract::{ExtractRequest, Extractor, HttpRangeReader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let reader = Arc::new(HttpRangeReader::new("https://example.com/world.pmtiles".to_string()).await?);
//!
//!     let request = ExtractRequest {
//!         bbox: Some("2.2,48.8,2.5,48.9".parse()?),
//!         max_zoom: Some(12),
//!         ..Default::default()
//!     };
//!
//!     let stats = Extractor::new(reader)
//!         .extract_to_path(&request, Path::new("paris.pmtiles"))
//!         .await?;
//!     println!("{} tiles, {} bytes", stats.addressed_tiles, stats.archive_bytes);
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod extract;
pub mod io;
pub mod pmtiles;

pub use cli::Cli;
pub use error::{ExtractError, FormatError, SourceError};
pub use extract::{BoundingBox, ExtractPlan, ExtractRequest, ExtractStats, Extractor, Stage};
pub use io::{FileSink, HttpRangeReader, LocalFileReader, MemorySink, RandomAccessSink, ReadAt};
pub use pmtiles::{ArchiveReader, Compression, Entry, Header, TileType};
