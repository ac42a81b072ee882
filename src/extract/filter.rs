//! Spatial and zoom filtering.
//!
//! A bounding box is projected onto the Web Mercator tile grid at each
//! requested zoom, and the resulting tile rectangle is decomposed into
//! contiguous tile-id ranges by walking the quadtree: a cell entirely inside
//! the rectangle owns one contiguous id range (see [`crate::pmtiles::tile_id`]),
//! a cell outside contributes nothing, and a partial cell is split in four.

use std::f64::consts::PI;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::error::ExtractError;
use crate::pmtiles::{MAX_ZOOM, hilbert_index, zoom_base, zoom_tile_count};

/// Latitude limit of the Web Mercator projection
pub const MAX_LATITUDE: f64 = 85.051_128_78;

/// Geographic bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self, ExtractError> {
        let values = [min_lon, min_lat, max_lon, max_lat];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ExtractError::InvalidBbox(format!(
                "coordinates must be finite numbers, got {values:?}"
            )));
        }
        if !(-180.0..=180.0).contains(&min_lon) || !(-180.0..=180.0).contains(&max_lon) {
            return Err(ExtractError::InvalidBbox(format!(
                "longitude must be within -180..180, got {min_lon} and {max_lon}"
            )));
        }
        if !(-90.0..=90.0).contains(&min_lat) || !(-90.0..=90.0).contains(&max_lat) {
            return Err(ExtractError::InvalidBbox(format!(
                "latitude must be within -90..90, got {min_lat} and {max_lat}"
            )));
        }
        if min_lon > max_lon || min_lat > max_lat {
            return Err(ExtractError::InvalidBbox(format!(
                "minimum exceeds maximum in {min_lon},{min_lat},{max_lon},{max_lat}"
            )));
        }
        Ok(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    /// Whole projected world
    pub fn world() -> Self {
        Self {
            min_lon: -180.0,
            min_lat: -MAX_LATITUDE,
            max_lon: 180.0,
            max_lat: MAX_LATITUDE,
        }
    }

    /// Box stored in a header as fixed-point degrees
    pub fn from_e7(min_lon: i32, min_lat: i32, max_lon: i32, max_lat: i32) -> Self {
        Self {
            min_lon: f64::from(min_lon) / 1e7,
            min_lat: f64::from(min_lat) / 1e7,
            max_lon: f64::from(max_lon) / 1e7,
            max_lat: f64::from(max_lat) / 1e7,
        }
    }

    /// `(min_lon, min_lat, max_lon, max_lat)` in fixed-point degrees
    pub fn to_e7(&self) -> (i32, i32, i32, i32) {
        (
            to_e7(self.min_lon),
            to_e7(self.min_lat),
            to_e7(self.max_lon),
            to_e7(self.max_lat),
        )
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_lon = self.min_lon.max(other.min_lon);
        let min_lat = self.min_lat.max(other.min_lat);
        let max_lon = self.max_lon.min(other.max_lon);
        let max_lat = self.max_lat.min(other.max_lat);
        (min_lon <= max_lon && min_lat <= max_lat).then_some(BoundingBox {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        (self.min_lon..=self.max_lon).contains(&lon) && (self.min_lat..=self.max_lat).contains(&lat)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }
}

pub(crate) fn to_e7(degrees: f64) -> i32 {
    (degrees * 1e7).round() as i32
}

impl FromStr for BoundingBox {
    type Err = ExtractError;

    /// Parse `minlon,minlat,maxlon,maxlat`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(ExtractError::InvalidBbox(format!(
                "expected minlon,minlat,maxlon,maxlat, got '{s}'"
            )));
        }
        let mut values = [0f64; 4];
        for (value, part) in values.iter_mut().zip(&parts) {
            *value = part
                .parse()
                .map_err(|_| ExtractError::InvalidBbox(format!("'{part}' is not a number")))?;
        }
        BoundingBox::new(values[0], values[1], values[2], values[3])
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

/// Intersect the requested zoom bounds with the archive's own zoom range
pub fn effective_zoom_range(
    requested_min: Option<u8>,
    requested_max: Option<u8>,
    archive_min: u8,
    archive_max: u8,
) -> Result<(u8, u8), ExtractError> {
    let min = requested_min.map_or(archive_min, |z| z.max(archive_min));
    let max = requested_max.map_or(archive_max, |z| z.min(archive_max));
    if min > max || max > MAX_ZOOM {
        return Err(ExtractError::InvalidZoomRange {
            requested_min,
            requested_max,
            archive_min,
            archive_max,
        });
    }
    Ok((min, max))
}

/// Inclusive rectangle of tiles at one zoom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub z: u8,
    pub min_x: u64,
    pub min_y: u64,
    pub max_x: u64,
    pub max_y: u64,
}

impl TileRect {
    /// Tiles whose footprint overlaps `bbox` at zoom `z`.
    ///
    /// Tiles that only share an edge with the box are left out, but a box
    /// of zero width or height still selects the tile it lies in.
    pub fn covering(bbox: &BoundingBox, z: u8) -> Self {
        let n = 1u64 << z;
        let scale = n as f64;
        let fx = |lon: f64| (lon + 180.0) / 360.0 * scale;
        let fy = |lat: f64| {
            let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
            (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * scale
        };
        let clamp = |v: f64| {
            if v <= 0.0 {
                0
            } else {
                (v as u64).min(n - 1)
            }
        };

        let min_x = clamp(fx(bbox.min_lon).floor());
        let max_x = clamp(fx(bbox.max_lon).ceil() - 1.0).max(min_x);
        let min_y = clamp(fy(bbox.max_lat).floor());
        let max_y = clamp(fy(bbox.min_lat).ceil() - 1.0).max(min_y);

        Self {
            z,
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn tile_count(&self) -> u64 {
        (self.max_x - self.min_x + 1) * (self.max_y - self.min_y + 1)
    }

    pub fn contains(&self, x: u64, y: u64) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }

    /// Tile-id ranges covering exactly the tiles of this rectangle
    pub fn tile_id_ranges(&self) -> Vec<Range<u64>> {
        let mut out = Vec::new();
        self.descend(0, 0, 0, &mut out);
        out.sort_unstable_by_key(|r| r.start);
        coalesce(out)
    }

    fn descend(&self, level: u8, qx: u64, qy: u64, out: &mut Vec<Range<u64>>) {
        let shift = self.z - level;
        let (x0, x1) = (qx << shift, ((qx + 1) << shift) - 1);
        let (y0, y1) = (qy << shift, ((qy + 1) << shift) - 1);

        if x1 < self.min_x || x0 > self.max_x || y1 < self.min_y || y0 > self.max_y {
            return;
        }

        if self.contains(x0, y0) && self.contains(x1, y1) {
            let span = 1u64 << (2 * u32::from(shift));
            let start = zoom_base(self.z) + hilbert_index(level, qx, qy) * span;
            out.push(start..start + span);
            return;
        }

        for (dx, dy) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            self.descend(level + 1, qx * 2 + dx, qy * 2 + dy, out);
        }
    }
}

/// Merge sorted ranges that touch or overlap
fn coalesce(sorted: Vec<Range<u64>>) -> Vec<Range<u64>> {
    let mut merged: Vec<Range<u64>> = Vec::with_capacity(sorted.len());
    for r in sorted {
        if r.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
            _ => merged.push(r),
        }
    }
    merged
}

/// Sorted, disjoint set of wanted tile ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileRanges {
    ranges: Vec<Range<u64>>,
}

impl TileRanges {
    pub fn from_ranges(mut ranges: Vec<Range<u64>>) -> Self {
        ranges.sort_unstable_by_key(|r| r.start);
        Self {
            ranges: coalesce(ranges),
        }
    }

    /// Every tile from `min_zoom` to `max_zoom`
    pub fn full(min_zoom: u8, max_zoom: u8) -> Self {
        let start = zoom_base(min_zoom);
        let end = zoom_base(max_zoom) + zoom_tile_count(max_zoom);
        Self::from_ranges(vec![start..end])
    }

    /// Tiles touching `bbox` at every zoom from `min_zoom` to `max_zoom`
    pub fn covering(bbox: &BoundingBox, min_zoom: u8, max_zoom: u8) -> Self {
        let ranges = (min_zoom..=max_zoom)
            .flat_map(|z| TileRect::covering(bbox, z).tile_id_ranges())
            .collect();
        Self::from_ranges(ranges)
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn tile_count(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    pub fn contains(&self, id: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.end <= id);
        self.ranges.get(idx).is_some_and(|r| r.start <= id)
    }

    /// Parts of `lo..hi` that are wanted
    pub fn clip(&self, lo: u64, hi: u64) -> impl Iterator<Item = Range<u64>> + '_ {
        let idx = self.ranges.partition_point(|r| r.end <= lo);
        self.ranges[idx..]
            .iter()
            .take_while(move |r| r.start < hi)
            .map(move |r| r.start.max(lo)..r.end.min(hi))
    }

    pub fn intersects(&self, lo: u64, hi: u64) -> bool {
        self.clip(lo, hi).next().is_some()
    }
}
