//! Test utilities for integration tests.
//!
//! Provides a request-tracking in-memory reader and a builder producing
//! small but complete PMTiles archives.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use pmextract::error::SourceError;
use pmextract::extract::{BoundingBox, TileRanges};
use pmextract::io::{FileSink, RandomAccessSink, ReadAt};
use pmextract::pmtiles::directory::{compress, encode_directory};
use pmextract::pmtiles::{
    ArchiveLayout, ArchiveReader, Compression, Entry, EntryAccumulator, Header, TileType,
    tile_id_to_zxy, zxy_to_tile_id,
};

// =============================================================================
// Mock Reader with Request Tracking
// =============================================================================

/// An in-memory reader that records every read and can be told to fail.
pub struct TrackingMockReader {
    data: Bytes,
    identifier: String,
    request_count: Arc<AtomicUsize>,
    requests: Arc<RwLock<Vec<(u64, usize)>>>,
    fail_from: Option<u64>,
}

impl TrackingMockReader {
    pub fn new(data: Vec<u8>, identifier: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(data),
            identifier: identifier.into(),
            request_count: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(RwLock::new(Vec::new())),
            fail_from: None,
        }
    }

    /// Fail every read that starts at or after `offset`
    pub fn failing_from(mut self, offset: u64) -> Self {
        self.fail_from = Some(offset);
        self
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub async fn get_requests(&self) -> Vec<(u64, usize)> {
        self.requests.read().await.clone()
    }
}

#[async_trait]
impl ReadAt for TrackingMockReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, SourceError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.requests.write().await.push((offset, len));

        if self.fail_from.is_some_and(|from| offset >= from) {
            return Err(SourceError::Status(500));
        }

        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(SourceError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// Failing Output
// =============================================================================

/// A file sink whose `fail_on`-th write (counting from 1) fails.
pub struct FailingFileSink {
    inner: FileSink,
    fail_on: usize,
    writes: AtomicUsize,
}

impl FailingFileSink {
    pub fn new(inner: FileSink, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RandomAccessSink for FailingFileSink {
    async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<usize> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(std::io::Error::other("no space left on device"));
        }
        self.inner.write_at(offset, data).await
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

// =============================================================================
// Archive Fixtures
// =============================================================================

pub const OCEAN: &[u8] = b"ocean";

/// Contents of the synthetic world used by most tests.
///
/// The southern quarter of every zoom from 2 on is a shared "ocean" tile,
/// and the easternmost column of zoom 3 is missing.
pub fn world_tile(z: u8, x: u64, y: u64) -> Option<Vec<u8>> {
    let n = 1u64 << z;
    if z == 3 && x == n - 1 {
        return None;
    }
    if z >= 2 && y >= n * 3 / 4 {
        return Some(OCEAN.to_vec());
    }
    Some(format!("tile {z}/{x}/{y}").into_bytes())
}

/// A built archive and the tiles it holds, by tile id
pub struct Fixture {
    pub bytes: Vec<u8>,
    pub tiles: BTreeMap<u64, Vec<u8>>,
}

impl Fixture {
    pub fn reader(&self) -> Arc<TrackingMockReader> {
        Arc::new(TrackingMockReader::new(self.bytes.clone(), "fixture"))
    }
}

pub struct ArchiveBuilder {
    min_zoom: u8,
    max_zoom: u8,
    leaf_size: Option<usize>,
    bounds: Option<BoundingBox>,
    metadata: Vec<u8>,
}

impl ArchiveBuilder {
    pub fn new(min_zoom: u8, max_zoom: u8) -> Self {
        Self {
            min_zoom,
            max_zoom,
            leaf_size: None,
            bounds: None,
            metadata: br#"{"name":"fixture","vector_layers":[]}"#.to_vec(),
        }
    }

    /// Split the directory into leaves of at most `size` entries
    pub fn with_leaves(mut self, size: usize) -> Self {
        self.leaf_size = Some(size);
        self
    }

    /// Only store tiles overlapping `bounds`, and advertise them in the header
    pub fn with_bounds(mut self, bounds: BoundingBox) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn build(self, tile: impl Fn(u8, u64, u64) -> Option<Vec<u8>>) -> Fixture {
        let mut tiles = BTreeMap::new();
        for z in self.min_zoom..=self.max_zoom {
            let n = 1u64 << z;
            for x in 0..n {
                for y in 0..n {
                    if self.bounds.is_some_and(|b| !tile_overlaps(&b, z, x, y)) {
                        continue;
                    }
                    if let Some(data) = tile(z, x, y) {
                        tiles.insert(zxy_to_tile_id(z, x, y).unwrap(), data);
                    }
                }
            }
        }

        let mut tile_data = Vec::new();
        let mut offsets: HashMap<Vec<u8>, u64> = HashMap::new();
        let mut entries = EntryAccumulator::new();
        for (&tile_id, data) in &tiles {
            let offset = *offsets.entry(data.clone()).or_insert_with(|| {
                let offset = tile_data.len() as u64;
                tile_data.extend_from_slice(data);
                offset
            });
            entries.push(Entry {
                tile_id,
                offset,
                length: data.len() as u32,
                run_length: 1,
            });
        }
        let entries = entries.finish();
        let metadata = compress(&self.metadata, Compression::Gzip).unwrap();

        let (root, leaves) = match self.leaf_size {
            Some(size) => split_leaves(&entries, size),
            None => {
                let layout = ArchiveLayout::build(
                    &entries,
                    metadata.len() as u64,
                    tile_data.len() as u64,
                    Compression::Gzip,
                )
                .unwrap();
                (layout.root, layout.leaves)
            }
        };

        let root_offset = Header::SIZE as u64;
        let metadata_offset = root_offset + root.len() as u64;
        let leaf_directory_offset = metadata_offset + metadata.len() as u64;
        let tile_data_offset = leaf_directory_offset + leaves.len() as u64;

        let world = BoundingBox {
            min_lon: -180.0,
            min_lat: -85.051_128_7,
            max_lon: 180.0,
            max_lat: 85.051_128_7,
        };
        let bounds = self.bounds.unwrap_or(world);
        let (min_lon_e7, min_lat_e7, max_lon_e7, max_lat_e7) = bounds.to_e7();
        let (center_lon, center_lat) = bounds.center();

        let header = Header {
            root_offset,
            root_length: root.len() as u64,
            metadata_offset,
            metadata_length: metadata.len() as u64,
            leaf_directory_offset,
            leaf_directory_length: leaves.len() as u64,
            tile_data_offset,
            tile_data_length: tile_data.len() as u64,
            addressed_tiles_count: tiles.len() as u64,
            tile_entries_count: entries.len() as u64,
            tile_contents_count: offsets.len() as u64,
            clustered: true,
            internal_compression: Compression::Gzip,
            tile_compression: Compression::None,
            tile_type: TileType::Png,
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            min_lon_e7,
            min_lat_e7,
            max_lon_e7,
            max_lat_e7,
            center_zoom: self.min_zoom,
            center_lon_e7: (center_lon * 1e7).round() as i32,
            center_lat_e7: (center_lat * 1e7).round() as i32,
        };

        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(&root);
        bytes.extend_from_slice(&metadata);
        bytes.extend_from_slice(&leaves);
        bytes.extend_from_slice(&tile_data);

        Fixture { bytes, tiles }
    }
}

fn split_leaves(entries: &[Entry], size: usize) -> (Vec<u8>, Vec<u8>) {
    let mut root_entries = Vec::new();
    let mut leaves = Vec::new();
    for chunk in entries.chunks(size) {
        let leaf = encode_directory(chunk, Compression::Gzip).unwrap();
        root_entries.push(Entry {
            tile_id: chunk[0].tile_id,
            offset: leaves.len() as u64,
            length: leaf.len() as u32,
            run_length: 0,
        });
        leaves.extend_from_slice(&leaf);
    }
    (encode_directory(&root_entries, Compression::Gzip).unwrap(), leaves)
}

// =============================================================================
// Expectations
// =============================================================================

/// Tiles of `source` whose footprint overlaps the interior of `bbox`,
/// computed tile by tile from the Web Mercator tile corners.
pub fn expected_tiles(
    source: &BTreeMap<u64, Vec<u8>>,
    bbox: &BoundingBox,
    min_zoom: u8,
    max_zoom: u8,
) -> BTreeMap<u64, Vec<u8>> {
    source
        .iter()
        .filter(|&(&id, _)| {
            let (z, x, y) = tile_id_to_zxy(id).unwrap();
            (min_zoom..=max_zoom).contains(&z) && tile_overlaps(bbox, z, x, y)
        })
        .map(|(&id, data)| (id, data.clone()))
        .collect()
}

/// Whether tile `z/x/y` overlaps the interior of `bbox`
pub fn tile_overlaps(bbox: &BoundingBox, z: u8, x: u64, y: u64) -> bool {
    let lat_limit = 85.051_128_78;
    let min_lat = bbox.min_lat.clamp(-lat_limit, lat_limit);
    let max_lat = bbox.max_lat.clamp(-lat_limit, lat_limit);

    let n = (1u64 << z) as f64;
    let west = x as f64 / n * 360.0 - 180.0;
    let east = (x + 1) as f64 / n * 360.0 - 180.0;
    let north = tile_lat(y as f64, n);
    let south = tile_lat((y + 1) as f64, n);
    west < bbox.max_lon && east > bbox.min_lon && south < max_lat && north > min_lat
}

fn tile_lat(y: f64, n: f64) -> f64 {
    (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees()
}

/// Every tile addressed by `archive`, with its bytes
pub async fn read_all_tiles(archive: &[u8]) -> BTreeMap<u64, Vec<u8>> {
    let reader = Arc::new(TrackingMockReader::new(archive.to_vec(), "output"));
    let parsed = ArchiveReader::open(reader.clone()).await.unwrap();
    let header = parsed.header().clone();
    let all = TileRanges::full(header.min_zoom, header.max_zoom);
    let entries = parsed.relevant_entries(&all, 1, 0.0).await.unwrap();

    let mut tiles = BTreeMap::new();
    for entry in entries {
        let data = reader
            .read_exact_at(header.tile_data_offset + entry.offset, entry.length as usize)
            .await
            .unwrap();
        for id in entry.tile_id..entry.end_id() {
            tiles.insert(id, data.to_vec());
        }
    }
    tiles
}

/// Fresh path in the system temp directory, unique per process and `name`
pub fn temp_output(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "pmextract-{}-{name}.pmtiles",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}
