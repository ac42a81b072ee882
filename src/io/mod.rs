mod http;
mod local;
mod sink;

pub use http::{DEFAULT_MAX_RETRY, DEFAULT_TIMEOUT_SECS, HttpRangeReader};
pub use local::LocalFileReader;
pub use sink::{FileSink, MemorySink};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SourceError;

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, SourceError>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Path or URL, used in log output
    fn identifier(&self) -> &str;
}

/// Output destination that accepts writes at arbitrary absolute offsets.
///
/// Writes carry no cursor: regions may be written in any order, and
/// concurrent calls on disjoint ranges need no external locking.
#[async_trait]
pub trait RandomAccessSink: Send + Sync {
    /// Write all of `data` starting at `offset`, returning the byte count
    async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<usize>;

    /// Make previously written data durable
    async fn flush(&self) -> std::io::Result<()>;
}

/// Check that `[offset, offset + len)` lies inside a source of `size` bytes.
pub(crate) fn check_bounds(offset: u64, len: usize, size: u64) -> Result<(), SourceError> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(SourceError::RangeOutOfBounds {
            offset,
            requested: len as u64,
            size,
        }),
    }
}
