//! End-to-end extraction tests against synthetic archives.

use std::collections::BTreeMap;
use std::sync::Arc;

use pmextract::extract::{BoundingBox, ExtractRequest, Extractor};
use pmextract::io::{FileSink, MemorySink};
use pmextract::pmtiles::{ArchiveReader, Header, zxy_to_tile_id};
use pmextract::{ExtractError, ExtractStats};

use super::test_utils::{
    ArchiveBuilder, FailingFileSink, Fixture, OCEAN, TrackingMockReader, expected_tiles, read_all_tiles,
    temp_output, world_tile,
};

fn world(max_zoom: u8) -> Fixture {
    ArchiveBuilder::new(0, max_zoom).build(world_tile)
}

fn bbox(s: &str) -> BoundingBox {
    s.parse().unwrap()
}

async fn extract_to_memory(
    fixture: &Fixture,
    request: &ExtractRequest,
) -> Result<(ExtractStats, Vec<u8>), ExtractError> {
    let sink = Arc::new(MemorySink::new());
    let stats = Extractor::new(fixture.reader())
        .extract_to_sink(request, sink.clone())
        .await?;
    Ok((stats, sink.contents()))
}

// =============================================================================
// Tile Selection
// =============================================================================

#[tokio::test]
async fn test_bbox_extract_keeps_exactly_the_overlapping_tiles() {
    let fixture = world(5);
    let area = bbox("-10.3,35.1,30.7,60.2");
    let request = ExtractRequest {
        bbox: Some(area),
        ..Default::default()
    };

    let (stats, output) = extract_to_memory(&fixture, &request).await.unwrap();
    let tiles = read_all_tiles(&output).await;
    let expected = expected_tiles(&fixture.tiles, &area, 0, 5);

    assert!(!expected.is_empty());
    assert_eq!(tiles, expected);
    assert_eq!(stats.addressed_tiles, expected.len() as u64);
    assert_eq!((stats.min_zoom, stats.max_zoom), (0, 5));
}

#[tokio::test]
async fn test_small_bbox_at_low_zooms() {
    // zooms 0-3 of a source covering two degrees square
    let source_bounds = bbox("0.5,0.5,2.5,2.5");
    let fixture = ArchiveBuilder::new(0, 3)
        .with_bounds(source_bounds)
        .build(world_tile);
    assert_eq!(fixture.tiles.len(), 4);

    let requested = bbox("0,0,1,1");
    let request = ExtractRequest {
        bbox: Some(requested),
        min_zoom: Some(0),
        max_zoom: Some(2),
        download_threads: 1,
        overfetch: 0.0,
        ..Default::default()
    };

    let (stats, output) = extract_to_memory(&fixture, &request).await.unwrap();
    let tiles = read_all_tiles(&output).await;

    let ids: Vec<u64> = tiles.keys().copied().collect();
    let expected = vec![
        zxy_to_tile_id(0, 0, 0).unwrap(),
        zxy_to_tile_id(1, 1, 0).unwrap(),
        zxy_to_tile_id(2, 2, 1).unwrap(),
    ];
    assert_eq!(ids, expected);
    assert_eq!(tiles, expected_tiles(&fixture.tiles, &requested, 0, 2));
    assert_eq!(tiles[&expected[2]], b"tile 2/2/1");
    assert_eq!(stats.addressed_tiles, 3);

    let header = Header::from_bytes(&output).unwrap();
    assert_eq!((header.min_zoom, header.max_zoom), (0, 2));
    assert_eq!(header.addressed_tiles_count, 3);
    assert_eq!(header.tile_entries_count, 3);
    // requested box clipped to the source bounds
    assert_eq!(
        (header.min_lon_e7, header.min_lat_e7, header.max_lon_e7, header.max_lat_e7),
        (5_000_000, 5_000_000, 10_000_000, 10_000_000)
    );
    // the source center lies outside, so the clipped box center is used
    assert_eq!((header.center_lon_e7, header.center_lat_e7), (7_500_000, 7_500_000));
    assert_eq!(header.center_zoom, 0);
}

#[tokio::test]
async fn test_zoom_only_extract() {
    let fixture = world(4);
    let request = ExtractRequest {
        min_zoom: Some(2),
        max_zoom: Some(3),
        ..Default::default()
    };

    let (_, output) = extract_to_memory(&fixture, &request).await.unwrap();
    let tiles = read_all_tiles(&output).await;
    let expected = expected_tiles(&fixture.tiles, &BoundingBox::world(), 2, 3);

    // zoom 2 has 16 tiles, zoom 3 is missing its last column
    assert_eq!(tiles.len(), 16 + 56);
    assert_eq!(tiles, expected);
}

#[tokio::test]
async fn test_full_extract_round_trips_every_tile() {
    let fixture = world(4);
    let (stats, output) = extract_to_memory(&fixture, &ExtractRequest::default())
        .await
        .unwrap();

    assert_eq!(read_all_tiles(&output).await, fixture.tiles);

    let source = Header::from_bytes(&fixture.bytes).unwrap();
    let header = Header::from_bytes(&output).unwrap();
    assert_eq!(header.addressed_tiles_count, source.addressed_tiles_count);
    assert_eq!(header.tile_contents_count, source.tile_contents_count);
    assert_eq!(header.tile_data_length, source.tile_data_length);
    assert_eq!(stats.tile_contents, source.tile_contents_count);
}

#[tokio::test]
async fn test_shared_tiles_are_stored_once() {
    let fixture = world(4);
    let request = ExtractRequest {
        bbox: Some(bbox("-170,-84,170,-70")),
        min_zoom: Some(2),
        ..Default::default()
    };

    let (stats, output) = extract_to_memory(&fixture, &request).await.unwrap();
    let tiles = read_all_tiles(&output).await;

    assert!(tiles.len() > 1);
    assert!(tiles.values().all(|t| t == OCEAN));
    assert_eq!(stats.tile_contents, 1);
    assert_eq!(stats.tile_data_bytes, OCEAN.len() as u64);
    // Hilbert neighbours sharing the tile collapse into runs
    assert!(stats.tile_entries < stats.addressed_tiles);
}

// =============================================================================
// Leaf Directories
// =============================================================================

#[tokio::test]
async fn test_source_with_leaf_directories() {
    let fixture = ArchiveBuilder::new(0, 6).with_leaves(64).build(world_tile);
    let source = Header::from_bytes(&fixture.bytes).unwrap();
    assert!(source.leaf_directory_length > 0);

    let area = bbox("5.5,45.2,15.9,55.1");
    let request = ExtractRequest {
        bbox: Some(area),
        overfetch: 0.0,
        ..Default::default()
    };

    let reader = fixture.reader();
    let sink = Arc::new(MemorySink::new());
    Extractor::new(reader.clone())
        .extract_to_sink(&request, sink.clone())
        .await
        .unwrap();

    let tiles = read_all_tiles(&sink.contents()).await;
    assert_eq!(tiles, expected_tiles(&fixture.tiles, &area, 0, 6));

    // only the leaves covering the area were read
    let leaf_start = source.leaf_directory_offset;
    let leaf_end = leaf_start + source.leaf_directory_length;
    let leaf_bytes: u64 = reader
        .get_requests()
        .await
        .iter()
        .filter(|(offset, _)| (leaf_start..leaf_end).contains(offset))
        .map(|(_, len)| *len as u64)
        .sum();
    assert!(leaf_bytes > 0);
    assert!(leaf_bytes < source.leaf_directory_length);
}

// =============================================================================
// Determinism and Overfetch
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_output_is_independent_of_threads_and_overfetch() {
    let fixture = world(5);
    let mut outputs = Vec::new();
    for (download_threads, overfetch) in [(1, 0.0), (4, 0.0), (4, 0.05), (8, 2.0)] {
        let request = ExtractRequest {
            bbox: Some(bbox("-40.5,-20.5,60.5,50.5")),
            download_threads,
            overfetch,
            ..Default::default()
        };
        let (_, output) = extract_to_memory(&fixture, &request).await.unwrap();
        outputs.push(output);
    }

    assert!(outputs.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_overfetch_trades_bytes_for_requests() {
    let fixture = world(5);
    let area = bbox("-40.5,-20.5,60.5,50.5");

    let plan = |overfetch: f64| {
        let reader = fixture.reader();
        let request = ExtractRequest {
            bbox: Some(area),
            overfetch,
            ..Default::default()
        };
        async move { Extractor::new(reader).plan(&request).await.unwrap().stats }
    };
    let exact = plan(0.0).await;
    let loose = plan(1.0).await;

    assert_eq!(exact.fetch_bytes, exact.tile_data_bytes);
    assert_eq!(loose.tile_data_bytes, exact.tile_data_bytes);
    assert_eq!(loose.addressed_tiles, exact.addressed_tiles);
    assert!(loose.fetch_ranges <= exact.fetch_ranges);
    assert!(loose.fetch_bytes >= exact.fetch_bytes);
    assert!(loose.fetch_bytes <= 2 * exact.tile_data_bytes);
}

// =============================================================================
// Dry Run
// =============================================================================

#[tokio::test]
async fn test_dry_run_reports_the_real_sizes() {
    let fixture = world(5);
    let area = bbox("-10.3,35.1,30.7,60.2");
    let real = ExtractRequest {
        bbox: Some(area),
        ..Default::default()
    };
    let dry = ExtractRequest {
        dry_run: true,
        ..real.clone()
    };

    let (dry_stats, dry_output) = extract_to_memory(&fixture, &dry).await.unwrap();
    let (stats, output) = extract_to_memory(&fixture, &real).await.unwrap();

    assert!(dry_output.is_empty());
    assert_eq!(dry_stats, stats);
    assert_eq!(stats.archive_bytes, output.len() as u64);
}

#[tokio::test]
async fn test_dry_run_creates_no_file() {
    let fixture = world(3);
    let path = temp_output("dry-run");
    let request = ExtractRequest {
        dry_run: true,
        ..Default::default()
    };

    let stats = Extractor::new(fixture.reader())
        .extract_to_path(&request, &path)
        .await
        .unwrap();

    assert_eq!(stats.addressed_tiles, fixture.tiles.len() as u64);
    assert!(!path.exists());
}

// =============================================================================
// Files and Failures
// =============================================================================

#[tokio::test]
async fn test_extract_to_file() {
    let fixture = world(4);
    let path = temp_output("to-file");
    let request = ExtractRequest {
        bbox: Some(bbox("-10.3,35.1,30.7,60.2")),
        ..Default::default()
    };

    let stats = Extractor::new(fixture.reader())
        .extract_to_path(&request, &path)
        .await
        .unwrap();

    let written = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(written.len() as u64, stats.archive_bytes);

    let source_metadata = ArchiveReader::open(fixture.reader())
        .await
        .unwrap()
        .read_metadata()
        .await
        .unwrap();
    let output = Arc::new(TrackingMockReader::new(written, "written"));
    let metadata = ArchiveReader::open(output).await.unwrap().read_metadata().await.unwrap();
    assert!(!metadata.is_empty());
    assert_eq!(metadata, source_metadata);
}

#[tokio::test]
async fn test_output_header_bounds_follow_the_bbox() {
    let fixture = world(3);
    let request = ExtractRequest {
        bbox: Some(bbox("-10.3,35.1,30.7,60.2")),
        ..Default::default()
    };

    let (_, output) = extract_to_memory(&fixture, &request).await.unwrap();
    let header = Header::from_bytes(&output).unwrap();

    assert_eq!(header.min_lon_e7, -103_000_000);
    assert_eq!(header.min_lat_e7, 351_000_000);
    assert_eq!(header.max_lon_e7, 307_000_000);
    assert_eq!(header.max_lat_e7, 602_000_000);
    assert!(header.clustered);
}

#[tokio::test]
async fn test_invalid_bbox_is_rejected_before_reading() {
    assert!(matches!(
        "10,10,5,5".parse::<BoundingBox>(),
        Err(ExtractError::InvalidBbox(_))
    ));

    let fixture = world(2);
    let reader = fixture.reader();
    let path = temp_output("invalid-bbox");
    let request = ExtractRequest {
        bbox: Some(BoundingBox {
            min_lon: 10.0,
            min_lat: 10.0,
            max_lon: 5.0,
            max_lat: 5.0,
        }),
        ..Default::default()
    };

    let err = Extractor::new(reader.clone())
        .extract_to_path(&request, &path)
        .await
        .unwrap_err();

    assert!(matches!(err, ExtractError::InvalidBbox(_)));
    assert!(err.is_validation());
    assert_eq!(reader.request_count(), 0);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_zoom_range_outside_archive() {
    let fixture = world(3);
    let request = ExtractRequest {
        min_zoom: Some(5),
        max_zoom: Some(8),
        ..Default::default()
    };

    let err = extract_to_memory(&fixture, &request).await.unwrap_err();
    assert!(matches!(
        err,
        ExtractError::InvalidZoomRange {
            archive_min: 0,
            archive_max: 3,
            ..
        }
    ));
}

#[tokio::test]
async fn test_fetch_failure_removes_partial_output() {
    let fixture = world(4);
    let source = Header::from_bytes(&fixture.bytes).unwrap();
    let reader = Arc::new(
        TrackingMockReader::new(fixture.bytes.clone(), "failing")
            .failing_from(source.tile_data_offset),
    );
    let path = temp_output("fetch-failure");
    let request = ExtractRequest {
        bbox: Some(bbox("-10.3,35.1,30.7,60.2")),
        ..Default::default()
    };

    let err = Extractor::new(reader)
        .extract_to_path(&request, &path)
        .await
        .unwrap_err();

    assert!(matches!(err, ExtractError::Fetch { .. }));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_rejects_non_archive_source() {
    let fixture = Fixture {
        bytes: b"definitely not a tile archive".repeat(10),
        tiles: BTreeMap::new(),
    };

    let err = extract_to_memory(&fixture, &ExtractRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::ArchiveFormat(_)));
}

#[tokio::test]
async fn test_write_failure_removes_partial_output() {
    let fixture = world(4);
    let path = temp_output("write-failure");
    let request = ExtractRequest {
        bbox: Some(bbox("-10.3,35.1,30.7,60.2")),
        download_threads: 2,
        ..Default::default()
    };

    let err = Extractor::new(fixture.reader())
        .extract_to_path_with(&request, &path, |p| {
            FileSink::create(p).map(|sink| FailingFileSink::new(sink, 2))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ExtractError::Write { .. }));
    assert!(!err.is_validation());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_inverted_zoom_range_is_rejected() {
    let fixture = world(3);
    let reader = fixture.reader();
    let path = temp_output("inverted-zoom");
    let request = ExtractRequest {
        min_zoom: Some(3),
        max_zoom: Some(1),
        ..Default::default()
    };

    let err = Extractor::new(reader.clone())
        .extract_to_path(&request, &path)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ExtractError::InvalidZoomRange {
            requested_min: Some(3),
            requested_max: Some(1),
            archive_min: 0,
            archive_max: 3,
        }
    ));
    assert!(err.is_validation());
    // only the header and root were read
    assert_eq!(reader.request_count(), 1);
    assert!(!path.exists());
}
