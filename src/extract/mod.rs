//! Bounded extraction of a source archive into a new one.
//!
//! ## Pipeline
//!
//! - [`filter`]: bounding box and zoom range to tile-id ranges
//! - [`planner`]: wanted ids to output entries and coalesced fetch ranges
//! - [`fetcher`]: worker pool reading ranges and writing tiles
//! - [`extractor`]: sequencing, dry runs and output finalization
//!
//! The output layout is fixed before the first tile is fetched, so tiles can
//! be written in whatever order the fetches complete while the result stays
//! byte-for-byte deterministic.

pub mod extractor;
pub mod fetcher;
pub mod filter;
pub mod planner;

pub use extractor::{
    DEFAULT_DOWNLOAD_THREADS, DEFAULT_OVERFETCH, ExtractPlan, ExtractRequest, ExtractStats,
    Extractor, Stage,
};
pub use fetcher::{FetchSummary, Fetcher, RangeHandler, TileWriter};
pub use filter::{BoundingBox, TileRanges, TileRect, effective_zoom_range};
pub use planner::{CopyPart, CopyPlan, FetchRange, merge_ranges, plan_copies, select_entries};
