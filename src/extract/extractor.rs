use bytes::Bytes;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::fetcher::{Fetcher, TileWriter};
use super::filter::{BoundingBox, TileRanges, effective_zoom_range, to_e7};
use super::planner::{CopyPlan, FetchRange, merge_ranges, plan_copies};
use crate::error::ExtractError;
use crate::io::{FileSink, RandomAccessSink, ReadAt};
use crate::pmtiles::{ArchiveLayout, ArchiveReader, Header};

/// Default size of the download worker pool
pub const DEFAULT_DOWNLOAD_THREADS: usize = 4;

/// Default overfetch ratio
pub const DEFAULT_OVERFETCH: f64 = 0.05;

/// What to extract
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractRequest {
    /// Lowest zoom to keep, `None` for the archive minimum
    pub min_zoom: Option<u8>,
    /// Highest zoom to keep, `None` for the archive maximum
    pub max_zoom: Option<u8>,
    /// Area to keep, `None` for everything
    pub bbox: Option<BoundingBox>,
    pub download_threads: usize,
    /// Extra bytes allowed per needed byte when coalescing fetches
    pub overfetch: f64,
    /// Plan only: report sizes without writing output
    pub dry_run: bool,
}

impl Default for ExtractRequest {
    fn default() -> Self {
        Self {
            min_zoom: None,
            max_zoom: None,
            bbox: None,
            download_threads: DEFAULT_DOWNLOAD_THREADS,
            overfetch: DEFAULT_OVERFETCH,
            dry_run: false,
        }
    }
}

impl ExtractRequest {
    /// Check the parts of the request that do not depend on the source.
    ///
    /// Zoom bounds are checked against the archive once its header is read,
    /// so an inverted range fails there as [`ExtractError::InvalidZoomRange`].
    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.download_threads == 0 {
            return Err(ExtractError::InvalidRequest(
                "download threads must be at least 1".to_string(),
            ));
        }
        if !self.overfetch.is_finite() || self.overfetch < 0.0 {
            return Err(ExtractError::InvalidRequest(format!(
                "overfetch must be a non-negative number, got {}",
                self.overfetch
            )));
        }
        if let Some(b) = &self.bbox {
            BoundingBox::new(b.min_lon, b.min_lat, b.max_lon, b.max_lat)?;
        }
        Ok(())
    }
}

/// Extraction stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    ReadSourceHeader,
    ComputeTileSet,
    DryRunReport,
    FetchAndWrite,
    BuildDirectory,
    WriteHeader,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::ReadSourceHeader => "read-source-header",
            Stage::ComputeTileSet => "compute-tile-set",
            Stage::DryRunReport => "dry-run-report",
            Stage::FetchAndWrite => "fetch-and-write",
            Stage::BuildDirectory => "build-directory",
            Stage::WriteHeader => "write-header",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Sizes of an extraction, identical for a dry run and a real run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// Tile ids addressed by the output directory
    pub addressed_tiles: u64,
    /// Directory entries after run-length collapsing
    pub tile_entries: u64,
    /// Distinct tile payloads
    pub tile_contents: u64,
    pub tile_data_bytes: u64,
    /// Size of the output archive
    pub archive_bytes: u64,
    pub fetch_ranges: u64,
    /// Bytes read from the source for tile data, overfetch included
    pub fetch_bytes: u64,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

/// Everything needed to write the output, computed without touching it
#[derive(Debug, Clone)]
pub struct ExtractPlan {
    pub header: Header,
    pub layout: ArchiveLayout,
    pub metadata: Bytes,
    pub copies: CopyPlan,
    pub ranges: Vec<FetchRange>,
    pub stats: ExtractStats,
}

/// Drives one extraction from a source archive.
///
/// Logging goes through the span given to [`Extractor::with_span`]; every
/// stage is recorded inside it.
pub struct Extractor<R: ReadAt> {
    reader: Arc<R>,
    span: Span,
}

impl<R: ReadAt + 'static> Extractor<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let span = info_span!("extract", source = %reader.identifier());
        Self { reader, span }
    }

    /// Log under `span` instead of the default `extract` span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Validate the request, read the source index and plan the output.
    pub async fn plan(&self, request: &ExtractRequest) -> Result<ExtractPlan, ExtractError> {
        self.plan_inner(request)
            .instrument(self.span.clone())
            .await
            .inspect_err(|e| self.fail(e))
    }

    /// Fetch tiles into `sink`, then write metadata, directories and header.
    pub async fn write<S: RandomAccessSink + 'static>(
        &self,
        plan: &ExtractPlan,
        sink: Arc<S>,
        download_threads: usize,
    ) -> Result<ExtractStats, ExtractError> {
        self.write_inner(plan, sink, download_threads)
            .instrument(self.span.clone())
            .await
            .inspect_err(|e| self.fail(e))
    }

    /// Plan and, unless `request.dry_run`, write into `sink`.
    pub async fn extract_to_sink<S: RandomAccessSink + 'static>(
        &self,
        request: &ExtractRequest,
        sink: Arc<S>,
    ) -> Result<ExtractStats, ExtractError> {
        let plan = self.plan(request).await?;
        if request.dry_run {
            return Ok(self.report_dry_run(&plan));
        }
        self.write(&plan, sink, request.download_threads).await
    }

    /// Plan and, unless `request.dry_run`, write a new archive at `path`.
    ///
    /// The output file is created only after planning succeeds and is
    /// removed again if writing fails.
    pub async fn extract_to_path(
        &self,
        request: &ExtractRequest,
        path: &Path,
    ) -> Result<ExtractStats, ExtractError> {
        self.extract_to_path_with(request, path, FileSink::create).await
    }

    /// Like [`Extractor::extract_to_path`], with `open` creating the sink
    /// for `path`.
    pub async fn extract_to_path_with<S, F>(
        &self,
        request: &ExtractRequest,
        path: &Path,
        open: F,
    ) -> Result<ExtractStats, ExtractError>
    where
        S: RandomAccessSink + 'static,
        F: FnOnce(&Path) -> std::io::Result<S>,
    {
        let plan = self.plan(request).await?;
        if request.dry_run {
            return Ok(self.report_dry_run(&plan));
        }

        let sink = open(path).map_err(|source| ExtractError::Write {
            offset: 0,
            length: 0,
            source,
        })?;
        let result = self
            .write(&plan, Arc::new(sink), request.download_threads)
            .await;

        if result.is_err() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => warn!(parent: &self.span, output = %path.display(), "removed partial output"),
                Err(e) => warn!(
                    parent: &self.span,
                    output = %path.display(),
                    "failed to remove partial output: {e}"
                ),
            }
        }
        result
    }

    async fn plan_inner(&self, request: &ExtractRequest) -> Result<ExtractPlan, ExtractError> {
        enter(Stage::Init);
        request.validate()?;
        info!(
            bbox = ?request.bbox.map(|b| b.to_string()),
            min_zoom = ?request.min_zoom,
            max_zoom = ?request.max_zoom,
            threads = request.download_threads,
            overfetch = request.overfetch,
            dry_run = request.dry_run,
            "starting extraction"
        );

        enter(Stage::ReadSourceHeader);
        let archive = ArchiveReader::open(self.reader.clone()).await?;
        let source = archive.header().clone();

        enter(Stage::ComputeTileSet);
        let (min_zoom, max_zoom) = effective_zoom_range(
            request.min_zoom,
            request.max_zoom,
            source.min_zoom,
            source.max_zoom,
        )?;
        let wanted = match &request.bbox {
            Some(bbox) => TileRanges::covering(bbox, min_zoom, max_zoom),
            None => TileRanges::full(min_zoom, max_zoom),
        };
        debug!(
            min_zoom,
            max_zoom,
            id_ranges = wanted.ranges().len(),
            candidate_tiles = wanted.tile_count(),
            "computed tile set"
        );

        let selected = archive
            .relevant_entries(&wanted, request.download_threads, request.overfetch)
            .await?;
        let metadata = archive.read_metadata().await?;

        let copies = plan_copies(&selected, source.tile_data_offset);
        let ranges = merge_ranges(copies.parts.clone(), request.overfetch);
        let layout = ArchiveLayout::build(
            &copies.entries,
            metadata.len() as u64,
            copies.tile_data_length,
            source.internal_compression,
        )?;

        let mut header = output_header(&source, request.bbox.as_ref(), min_zoom, max_zoom, &copies);
        layout.fill_header(&mut header);

        let stats = ExtractStats {
            addressed_tiles: copies.addressed_tiles(),
            tile_entries: copies.entries.len() as u64,
            tile_contents: copies.parts.len() as u64,
            tile_data_bytes: copies.tile_data_length,
            archive_bytes: layout.total_length(),
            fetch_ranges: ranges.len() as u64,
            fetch_bytes: ranges.iter().map(|r| r.length).sum(),
            min_zoom,
            max_zoom,
        };
        debug!(
            tiles = stats.addressed_tiles,
            contents = stats.tile_contents,
            ranges = stats.fetch_ranges,
            leaves = layout.leaf_count,
            "planned output"
        );

        Ok(ExtractPlan {
            header,
            layout,
            metadata,
            copies,
            ranges,
            stats,
        })
    }

    async fn write_inner<S: RandomAccessSink + 'static>(
        &self,
        plan: &ExtractPlan,
        sink: Arc<S>,
        download_threads: usize,
    ) -> Result<ExtractStats, ExtractError> {
        enter(Stage::FetchAndWrite);
        let writer = Arc::new(TileWriter::new(sink.clone(), plan.layout.tile_data_offset));
        let summary = Fetcher::new(self.reader.clone(), download_threads)
            .run(plan.ranges.clone(), writer.clone())
            .await?;

        enter(Stage::BuildDirectory);
        let planned: Vec<(u64, u64)> = plan
            .copies
            .parts
            .iter()
            .map(|p| (p.dst_offset, p.length))
            .collect();
        let tile_bytes = writer.log().verify(&planned)?;
        if tile_bytes != plan.layout.tile_data_length {
            return Err(ExtractError::Inconsistent(format!(
                "wrote {tile_bytes} tile bytes, layout expects {}",
                plan.layout.tile_data_length
            )));
        }

        enter(Stage::WriteHeader);
        let layout = &plan.layout;
        let header = plan.header.to_bytes();
        for (offset, data) in [
            (layout.metadata_offset, &plan.metadata[..]),
            (layout.leaf_directory_offset, &layout.leaves[..]),
            (layout.root_offset, &layout.root[..]),
            (0, &header[..]),
        ] {
            if data.is_empty() {
                continue;
            }
            sink.write_at(offset, data)
                .await
                .map_err(|source| ExtractError::Write {
                    offset,
                    length: data.len() as u64,
                    source,
                })?;
        }
        sink.flush().await.map_err(|source| ExtractError::Write {
            offset: 0,
            length: layout.total_length(),
            source,
        })?;

        enter(Stage::Done);
        info!(
            tiles = plan.stats.addressed_tiles,
            bytes = plan.stats.archive_bytes,
            fetched_ranges = summary.ranges,
            fetched_bytes = summary.bytes,
            "extraction complete"
        );
        Ok(plan.stats)
    }

    fn report_dry_run(&self, plan: &ExtractPlan) -> ExtractStats {
        let _g = self.span.enter();
        enter(Stage::DryRunReport);
        info!(
            tiles = plan.stats.addressed_tiles,
            bytes = plan.stats.archive_bytes,
            ranges = plan.stats.fetch_ranges,
            "dry run, nothing written"
        );
        plan.stats
    }

    fn fail(&self, e: &ExtractError) {
        error!(parent: &self.span, stage = %Stage::Failed, "extraction failed: {e}");
    }
}

fn enter(stage: Stage) {
    debug!(stage = %stage, "entering stage");
}

/// Header of the output archive, section offsets still unset
fn output_header(
    source: &Header,
    bbox: Option<&BoundingBox>,
    min_zoom: u8,
    max_zoom: u8,
    copies: &CopyPlan,
) -> Header {
    let source_bounds = BoundingBox::from_e7(
        source.min_lon_e7,
        source.min_lat_e7,
        source.max_lon_e7,
        source.max_lat_e7,
    );
    let bounds = match bbox {
        Some(requested) => requested.intersection(&source_bounds).unwrap_or(*requested),
        None => source_bounds,
    };
    let (min_lon_e7, min_lat_e7, max_lon_e7, max_lat_e7) = bounds.to_e7();

    let source_center = (
        f64::from(source.center_lon_e7) / 1e7,
        f64::from(source.center_lat_e7) / 1e7,
    );
    let (center_lon, center_lat) = if bounds.contains(source_center.0, source_center.1) {
        source_center
    } else {
        bounds.center()
    };

    Header {
        root_offset: 0,
        root_length: 0,
        metadata_offset: 0,
        metadata_length: 0,
        leaf_directory_offset: 0,
        leaf_directory_length: 0,
        tile_data_offset: 0,
        tile_data_length: 0,
        addressed_tiles_count: copies.addressed_tiles(),
        tile_entries_count: copies.entries.len() as u64,
        tile_contents_count: copies.parts.len() as u64,
        clustered: true,
        internal_compression: source.internal_compression,
        tile_compression: source.tile_compression,
        tile_type: source.tile_type,
        min_zoom,
        max_zoom,
        min_lon_e7,
        min_lat_e7,
        max_lon_e7,
        max_lat_e7,
        center_zoom: source.center_zoom.clamp(min_zoom, max_zoom),
        center_lon_e7: to_e7(center_lon),
        center_lat_e7: to_e7(center_lat),
    }
}
