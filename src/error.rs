use thiserror::Error;

/// Errors raised by a source reader (local file or HTTP Range requests)
#[derive(Debug, Error)]
pub enum SourceError {
    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with an unexpected status
    #[error("HTTP request failed with status: {0}")]
    Status(u16),

    /// Server does not honor byte ranges
    #[error("Remote server does not support Range requests")]
    RangeUnsupported,

    /// Server did not report the resource size
    #[error("Remote server did not return Content-Length")]
    MissingLength,

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Fewer bytes arrived than were requested
    #[error("Short read: expected {expected} bytes at offset {offset}, got {actual}")]
    ShortRead {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    /// Transient failures persisted past the retry budget
    #[error("Max retries exceeded ({attempts} attempts): {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Errors raised while decoding a PMTiles archive
#[derive(Debug, Error)]
pub enum FormatError {
    /// Reading the archive index from the source failed
    #[error("failed to read archive index: {0}")]
    Source(#[from] SourceError),

    /// The first bytes are not the PMTiles magic
    #[error("Not a PMTiles archive (missing magic)")]
    InvalidMagic,

    /// Only version 3 archives are understood
    #[error("Unsupported PMTiles version: {0} (only version 3 is supported)")]
    UnsupportedVersion(u8),

    /// A header or directory ended early
    #[error("Truncated {what}: need {required} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        required: u64,
        actual: u64,
    },

    /// Varint continues past 64 bits or past the buffer
    #[error("Malformed varint at byte {0}")]
    InvalidVarint(usize),

    /// Directory content violates the format rules
    #[error("Invalid directory: {0}")]
    InvalidDirectory(String),

    /// Directory compression codec is not available
    #[error("Unsupported internal compression: {0}")]
    UnsupportedCompression(String),

    /// Zoom levels above 31 cannot be addressed by a 64-bit tile id
    #[error("Zoom level {0} exceeds the maximum of 31")]
    ZoomOutOfRange(u8),

    /// Leaf directories are nested deeper than allowed
    #[error("Leaf directories nested deeper than {0} levels")]
    LeafDepthExceeded(usize),

    /// Decompressing a directory failed
    #[error("Directory decompression failed: {0}")]
    Decompress(std::io::Error),
}

/// Errors surfaced by an extraction
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Malformed or inverted bounding box
    #[error("Invalid bounding box: {0}")]
    InvalidBbox(String),

    /// Requested zooms do not intersect the source archive
    #[error(
        "Invalid zoom range: requested {requested_min:?}..={requested_max:?}, \
         archive has {archive_min}..={archive_max}"
    )]
    InvalidZoomRange {
        requested_min: Option<u8>,
        requested_max: Option<u8>,
        archive_min: u8,
        archive_max: u8,
    },

    /// Worker count or overfetch ratio out of range
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The source archive is missing, corrupt or unsupported
    #[error("Archive format error: {0}")]
    ArchiveFormat(#[from] FormatError),

    /// Retrieving a planned range from the source failed
    #[error("Failed to fetch {length} bytes at source offset {offset}: {source}")]
    Fetch {
        offset: u64,
        length: u64,
        #[source]
        source: SourceError,
    },

    /// Writing to the output sink failed
    #[error("Failed to write {length} bytes at output offset {offset}: {source}")]
    Write {
        offset: u64,
        length: u64,
        #[source]
        source: std::io::Error,
    },

    /// Written tile data does not match the planned layout
    #[error("Output is inconsistent with the plan: {0}")]
    Inconsistent(String),

    /// A worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl ExtractError {
    /// Validation errors are raised before any output I/O happens.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExtractError::InvalidBbox(_)
                | ExtractError::InvalidZoomRange { .. }
                | ExtractError::InvalidRequest(_)
                | ExtractError::ArchiveFormat(_)
        )
    }
}
