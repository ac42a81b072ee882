//! Main entry point for the pmextract CLI application.
//!
//! Extracts a bounding box and zoom range from a PMTiles archive read from
//! the local filesystem or over HTTP.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pmextract::cli::{Command, ExtractArgs};
use pmextract::{Cli, ExtractStats, Extractor, HttpRangeReader, LocalFileReader, ReadAt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Extract(args) => extract(&args).await,
    }
}

/// Open the source and run one extraction.
///
/// Validation happens before the source is opened, so a bad bounding box
/// never costs a network round trip.
async fn extract(args: &ExtractArgs) -> Result<()> {
    let request = args.to_request()?;

    if args.is_http_url() {
        // Remote archive via HTTP Range requests
        let timeout = Duration::from_secs(args.http_timeout);
        let reader = HttpRangeReader::with_timeout(args.input.clone(), timeout)
            .await?
            .with_max_retry(args.http_retries);
        let reader = Arc::new(reader);
        let stats = run_extract(reader.clone(), args, &request).await?;
        print_summary(&stats, args.dry_run);
        eprintln!(
            "Total bytes transferred: {}",
            format_size(reader.transferred_bytes())
        );
    } else {
        let reader = Arc::new(LocalFileReader::new(Path::new(&args.input))?);
        let stats = run_extract(reader, args, &request).await?;
        print_summary(&stats, args.dry_run);
    }

    Ok(())
}

async fn run_extract<R: ReadAt + 'static>(
    reader: Arc<R>,
    args: &ExtractArgs,
    request: &pmextract::ExtractRequest,
) -> Result<ExtractStats> {
    let stats = Extractor::new(reader)
        .extract_to_path(request, Path::new(&args.output))
        .await?;
    Ok(stats)
}

fn print_summary(stats: &ExtractStats, dry_run: bool) {
    let verb = if dry_run { "Would extract" } else { "Extracted" };
    println!(
        "{verb} {} tiles ({} entries, {} unique) at zooms {}-{}",
        stats.addressed_tiles,
        stats.tile_entries,
        stats.tile_contents,
        stats.min_zoom,
        stats.max_zoom
    );
    println!(
        "Archive size: {} ({} of tile data)",
        format_size(stats.archive_bytes),
        format_size(stats.tile_data_bytes)
    );
    println!(
        "Tile requests: {} ({})",
        stats.fetch_ranges,
        format_size(stats.fetch_bytes)
    );
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "pmextract=debug"
    } else {
        "pmextract=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Format a byte size into a human-readable string.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
