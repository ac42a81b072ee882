//! Bounded worker pool retrieving planned ranges.
//!
//! Ranges are pushed through a bounded queue to a fixed set of worker tasks.
//! Each worker performs one read per range and hands the buffer to a
//! [`RangeHandler`]. The first failure stops scheduling; workers already
//! holding a range finish it, the pool is joined, and the first error is
//! returned.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error};

use super::planner::FetchRange;
use crate::error::ExtractError;
use crate::io::{RandomAccessSink, ReadAt};
use crate::pmtiles::WriteLog;

/// Consumer of fetched range buffers
#[async_trait]
pub trait RangeHandler: Send + Sync {
    /// `data` holds exactly `range.length` bytes starting at `range.offset`
    async fn handle(&self, range: &FetchRange, data: Bytes) -> Result<(), ExtractError>;
}

/// Totals of one pool run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub ranges: u64,
    pub bytes: u64,
}

pub struct Fetcher<R: ReadAt> {
    reader: Arc<R>,
    threads: usize,
}

impl<R: ReadAt + 'static> Fetcher<R> {
    pub fn new(reader: Arc<R>, threads: usize) -> Self {
        Self {
            reader,
            threads: threads.max(1),
        }
    }

    /// Fetch every range and pass it to `handler`.
    pub async fn run<H: RangeHandler + 'static>(
        &self,
        ranges: Vec<FetchRange>,
        handler: Arc<H>,
    ) -> Result<FetchSummary, ExtractError> {
        if ranges.is_empty() {
            return Ok(FetchSummary::default());
        }

        let workers_wanted = self.threads.min(ranges.len());
        let (tx, rx) = mpsc::channel::<FetchRange>(workers_wanted * 2);
        let queue = Arc::new(Mutex::new(rx));
        let cancelled = Arc::new(AtomicBool::new(false));
        let first_error: Arc<std::sync::Mutex<Option<ExtractError>>> = Arc::default();
        let fetched_ranges = Arc::new(AtomicU64::new(0));
        let fetched_bytes = Arc::new(AtomicU64::new(0));

        let mut workers = JoinSet::new();
        for worker in 0..workers_wanted {
            let reader = self.reader.clone();
            let handler = handler.clone();
            let queue = queue.clone();
            let cancelled = cancelled.clone();
            let first_error = first_error.clone();
            let fetched_ranges = fetched_ranges.clone();
            let fetched_bytes = fetched_bytes.clone();

            let task = async move {
                loop {
                    if cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    let next = queue.lock().await.recv().await;
                    let Some(range) = next else { break };

                    match fetch_one(reader.as_ref(), handler.as_ref(), &range).await {
                        Ok(()) => {
                            fetched_ranges.fetch_add(1, Ordering::Relaxed);
                            fetched_bytes.fetch_add(range.length, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!(
                                worker,
                                offset = range.offset,
                                length = range.length,
                                "range failed: {e}"
                            );
                            cancelled.store(true, Ordering::Release);
                            let mut slot = first_error.lock().unwrap_or_else(|e| e.into_inner());
                            slot.get_or_insert(e);
                            break;
                        }
                    }
                }
            };
            workers.spawn(task.instrument(tracing::Span::current()));
        }
        drop(queue);

        for range in ranges {
            if cancelled.load(Ordering::Acquire) {
                break;
            }
            // Fails only once every worker has exited
            if tx.send(range).await.is_err() {
                break;
            }
        }
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                let mut slot = first_error.lock().unwrap_or_else(|e| e.into_inner());
                slot.get_or_insert(ExtractError::Worker(e.to_string()));
            }
        }

        let failure = first_error.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(e) = failure {
            return Err(e);
        }

        let summary = FetchSummary {
            ranges: fetched_ranges.load(Ordering::Relaxed),
            bytes: fetched_bytes.load(Ordering::Relaxed),
        };
        debug!(ranges = summary.ranges, bytes = summary.bytes, "fetch pool drained");
        Ok(summary)
    }
}

async fn fetch_one<R: ReadAt, H: RangeHandler>(
    reader: &R,
    handler: &H,
    range: &FetchRange,
) -> Result<(), ExtractError> {
    let data = reader
        .read_exact_at(range.offset, range.length as usize)
        .await
        .map_err(|source| ExtractError::Fetch {
            offset: range.offset,
            length: range.length,
            source,
        })?;
    handler.handle(range, data).await
}

/// Slices fetched ranges into tiles and writes them at their output offsets
pub struct TileWriter<S: RandomAccessSink> {
    sink: Arc<S>,
    tile_data_offset: u64,
    log: WriteLog,
}

impl<S: RandomAccessSink> TileWriter<S> {
    pub fn new(sink: Arc<S>, tile_data_offset: u64) -> Self {
        Self {
            sink,
            tile_data_offset,
            log: WriteLog::new(),
        }
    }

    pub fn log(&self) -> &WriteLog {
        &self.log
    }
}

#[async_trait]
impl<S: RandomAccessSink> RangeHandler for TileWriter<S> {
    async fn handle(&self, range: &FetchRange, data: Bytes) -> Result<(), ExtractError> {
        for part in &range.parts {
            let start = (part.src_offset - range.offset) as usize;
            let tile = data.slice(start..start + part.length as usize);
            let offset = self.tile_data_offset + part.dst_offset;

            let written = self
                .sink
                .write_at(offset, &tile)
                .await
                .map_err(|source| ExtractError::Write {
                    offset,
                    length: part.length,
                    source,
                })?;
            if written as u64 != part.length {
                return Err(ExtractError::Write {
                    offset,
                    length: part.length,
                    source: std::io::ErrorKind::WriteZero.into(),
                });
            }
            self.log.record(part.dst_offset, part.length);
        }
        Ok(())
    }
}
