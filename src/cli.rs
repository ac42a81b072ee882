use clap::{Args, Parser, Subcommand};

use crate::error::ExtractError;
use crate::extract::{BoundingBox, DEFAULT_DOWNLOAD_THREADS, DEFAULT_OVERFETCH, ExtractRequest};
use crate::io::{DEFAULT_MAX_RETRY, DEFAULT_TIMEOUT_SECS};

#[derive(Parser, Debug)]
#[command(name = "pmextract")]
#[command(version)]
#[command(about = "Extract part of a PMTiles archive, locally or over HTTP", long_about = None)]
#[command(after_help = "Examples:\n  \
  pmextract extract world.pmtiles paris.pmtiles --bbox=2.2,48.8,2.5,48.9\n  \
  pmextract extract https://example.com/world.pmtiles low.pmtiles --maxzoom=4\n  \
  pmextract extract world.pmtiles out.pmtiles --minzoom=6 --dry-run")]
pub struct Cli {
    /// Log debug output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy the tiles inside a bounding box and zoom range into a new archive
    Extract(ExtractArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    /// Source archive path or HTTP URL
    #[arg(value_name = "INPUT")]
    pub input: String,

    /// Output archive path (created or truncated)
    #[arg(value_name = "OUTPUT")]
    pub output: String,

    /// Area to keep: minlon,minlat,maxlon,maxlat
    #[arg(long, value_name = "BBOX", allow_hyphen_values = true)]
    pub bbox: Option<String>,

    /// Lowest zoom to keep (default: archive minimum)
    #[arg(long, value_name = "N")]
    pub minzoom: Option<u8>,

    /// Highest zoom to keep (default: archive maximum)
    #[arg(long, value_name = "N")]
    pub maxzoom: Option<u8>,

    /// Number of parallel downloads
    #[arg(
        long,
        value_name = "N",
        default_value_t = DEFAULT_DOWNLOAD_THREADS,
        env = "PMEXTRACT_DOWNLOAD_THREADS"
    )]
    pub download_threads: usize,

    /// Ratio of extra bytes to fetch in exchange for fewer requests
    #[arg(
        long,
        value_name = "R",
        default_value_t = DEFAULT_OVERFETCH,
        env = "PMEXTRACT_OVERFETCH"
    )]
    pub overfetch: f64,

    /// Attempts per HTTP request on timeouts and connection failures
    #[arg(
        long,
        value_name = "N",
        default_value_t = DEFAULT_MAX_RETRY,
        env = "PMEXTRACT_HTTP_RETRIES"
    )]
    pub http_retries: u32,

    /// Seconds allowed for one HTTP request, body included
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = DEFAULT_TIMEOUT_SECS,
        env = "PMEXTRACT_HTTP_TIMEOUT"
    )]
    pub http_timeout: u64,

    /// Report tile count and output size without writing anything
    #[arg(long)]
    pub dry_run: bool,
}

impl ExtractArgs {
    pub fn is_http_url(&self) -> bool {
        self.input.starts_with("http://") || self.input.starts_with("https://")
    }

    /// Validate the arguments into a request
    pub fn to_request(&self) -> Result<ExtractRequest, ExtractError> {
        let bbox = self
            .bbox
            .as_deref()
            .map(str::parse::<BoundingBox>)
            .transpose()?;

        let request = ExtractRequest {
            min_zoom: self.minzoom,
            max_zoom: self.maxzoom,
            bbox,
            download_threads: self.download_threads,
            overfetch: self.overfetch,
            dry_run: self.dry_run,
        };
        request.validate()?;
        Ok(request)
    }
}
