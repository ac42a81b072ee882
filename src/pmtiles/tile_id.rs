//! Hilbert-curve tile identifiers.
//!
//! Tiles are numbered zoom by zoom: all `4^z` tiles of zoom `z` come before
//! any tile of zoom `z + 1`, and inside a zoom level the order follows a
//! Hilbert curve over `(x, y)`. A quadtree cell at a coarser level therefore
//! always owns one contiguous run of ids at any finer zoom.

use crate::error::FormatError;

/// Highest zoom whose ids fit in 64 bits
pub const MAX_ZOOM: u8 = 31;

/// First tile id of zoom `z`: the number of tiles in all coarser zooms
pub fn zoom_base(z: u8) -> u64 {
    ((1u64 << (2 * u32::from(z))) - 1) / 3
}

/// Number of tiles at zoom `z`
pub fn zoom_tile_count(z: u8) -> u64 {
    1u64 << (2 * u32::from(z))
}

/// Position of `(x, y)` along the Hilbert curve of order `z`
pub fn hilbert_index(z: u8, x: u64, y: u64) -> u64 {
    let n = 1u64 << z;
    let (mut x, mut y) = (x, y);
    let mut d = 0;
    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        rotate(n, &mut x, &mut y, rx, ry);
        s /= 2;
    }
    d
}

fn rotate(n: u64, x: &mut u64, y: &mut u64, rx: u64, ry: u64) {
    if ry == 0 {
        if rx == 1 {
            *x = n - 1 - *x;
            *y = n - 1 - *y;
        }
        std::mem::swap(x, y);
    }
}

/// Encode a tile coordinate into its tile id
pub fn zxy_to_tile_id(z: u8, x: u64, y: u64) -> Result<u64, FormatError> {
    if z > MAX_ZOOM {
        return Err(FormatError::ZoomOutOfRange(z));
    }
    let n = 1u64 << z;
    if x >= n || y >= n {
        return Err(FormatError::InvalidDirectory(format!(
            "tile {z}/{x}/{y} outside the zoom {z} grid"
        )));
    }
    Ok(zoom_base(z) + hilbert_index(z, x, y))
}

/// Decode a tile id back into `(z, x, y)`
pub fn tile_id_to_zxy(id: u64) -> Result<(u8, u64, u64), FormatError> {
    let mut base = 0u64;
    for z in 0..=MAX_ZOOM {
        let count = zoom_tile_count(z);
        if id < base + count {
            let (x, y) = hilbert_to_xy(z, id - base);
            return Ok((z, x, y));
        }
        base += count;
    }
    Err(FormatError::InvalidDirectory(format!(
        "tile id {id} exceeds the zoom {MAX_ZOOM} range"
    )))
}

fn hilbert_to_xy(z: u8, d: u64) -> (u64, u64) {
    let n = 1u64 << z;
    let (mut x, mut y) = (0u64, 0u64);
    let mut t = d;
    let mut s = 1u64;
    while s < n {
        let rx = 1 & (t / 2);
        let ry = 1 & (t ^ rx);
        rotate(s, &mut x, &mut y, rx, ry);
        x += s * rx;
        y += s * ry;
        t /= 4;
        s *= 2;
    }
    (x, y)
}

/// Zoom level of a tile id
pub fn tile_id_zoom(id: u64) -> Result<u8, FormatError> {
    tile_id_to_zxy(id).map(|(z, _, _)| z)
}
