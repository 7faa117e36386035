//! Sender task for sparse sync.
//!
//! Receives TransferJobs from the Generator, reads source batches with
//! positioned reads, and encodes Data/Punch frames for the socket writer.
//! Batches the destination already holds become Skip frames so the server
//! keeps hearing from us during long runs of identical data.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::fs::File;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::observer::SyncObserver;
use crate::sparse::{hash_bytes, read_range, Interval};
use crate::streaming::channel::{JobReceiver, TransferJob};
use crate::streaming::protocol::{Data, Punch, Skip};

/// Sender configuration
pub struct SenderConfig {
    /// Batches read (and hashed) concurrently
    pub max_in_flight: usize,
}

/// What the sender did with its jobs
#[derive(Debug, Default, Clone, Copy)]
pub struct SenderSummary {
    pub batches_sent: u64,
    pub bytes_transferred: u64,
    pub batches_skipped: u64,
    pub bytes_skipped: u64,
    pub holes_punched: u64,
    pub bytes_punched: u64,
}

/// A job after the source has been read
enum Prepared {
    Data(Interval, Bytes),
    Skip(Interval),
    Punch(Interval),
}

/// Sender state
pub struct Sender {
    config: SenderConfig,
    source: Arc<File>,
    observer: Arc<dyn SyncObserver>,
}

impl Sender {
    pub fn new(config: SenderConfig, source: Arc<File>, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            config,
            source,
            observer,
        }
    }

    /// Run the sender, pushing encoded frames into `frames` until the job
    /// stream ends. Frames leave in completion order, not job order; every
    /// frame carries its absolute offset.
    pub async fn run(self, rx: JobReceiver, frames: mpsc::Sender<Bytes>) -> Result<SenderSummary> {
        let jobs = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|job| (job, rx)) });
        let mut prepared = Box::pin(
            jobs.map(|job| self.prepare(job))
                .buffer_unordered(self.config.max_in_flight.max(1)),
        );

        let mut summary = SenderSummary::default();
        while let Some(item) = prepared.next().await {
            match item? {
                Prepared::Data(interval, data) => {
                    let frame = Data {
                        offset: interval.begin,
                        data,
                    };
                    frames
                        .send(frame.encode())
                        .await
                        .map_err(|_| SyncError::Cancelled)?;
                    summary.batches_sent += 1;
                    summary.bytes_transferred += interval.len();
                    self.observer.on_batch_sent(&interval);
                }
                Prepared::Skip(interval) => {
                    frames
                        .send(Skip { interval }.encode())
                        .await
                        .map_err(|_| SyncError::Cancelled)?;
                    summary.batches_skipped += 1;
                    summary.bytes_skipped += interval.len();
                    self.observer.on_batch_skipped(&interval);
                }
                Prepared::Punch(interval) => {
                    frames
                        .send(Punch { interval }.encode())
                        .await
                        .map_err(|_| SyncError::Cancelled)?;
                    summary.holes_punched += 1;
                    summary.bytes_punched += interval.len();
                    self.observer.on_punch(&interval);
                }
            }
        }

        Ok(summary)
    }

    async fn prepare(&self, job: TransferJob) -> Result<Prepared> {
        match job {
            TransferJob::Punch { interval } => Ok(Prepared::Punch(interval)),
            TransferJob::Data { interval, expected } => {
                let source = Arc::clone(&self.source);
                tokio::task::spawn_blocking(move || {
                    let buf = read_range(&source, interval)?;
                    match expected {
                        Some(digest) if hash_bytes(&buf) == digest => Ok(Prepared::Skip(interval)),
                        _ => Ok(Prepared::Data(interval, Bytes::from(buf))),
                    }
                })
                .await?
            }
        }
    }
}
