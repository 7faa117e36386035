//! Generator task for sparse sync.
//!
//! Consumes the source layout as it is scanned, diffs each extent against
//! the destination layout received during the layout exchange, and streams
//! the resulting transfer plan to the Sender.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::observer::SyncObserver;
use crate::sparse::{Extent, Kind};
use crate::streaming::channel::{DestIndex, JobSender, TransferJob};

/// Generator configuration
pub struct GeneratorConfig {
    /// Batch size in bytes; batches are cut on multiples of this offset
    pub batch_size: u64,
}

/// Totals over the source layout the generator consumed
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanSummary {
    pub extents: u64,
    pub data_bytes: u64,
    pub jobs: u64,
}

/// Generator state
pub struct Generator {
    config: GeneratorConfig,
    dest: DestIndex,
    observer: Arc<dyn SyncObserver>,
}

impl Generator {
    pub fn new(config: GeneratorConfig, dest: DestIndex, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            config,
            dest,
            observer,
        }
    }

    /// Run the generator until the extent stream ends.
    pub async fn run(self, mut rx: mpsc::Receiver<Extent>, tx: JobSender) -> Result<PlanSummary> {
        let mut summary = PlanSummary::default();

        while let Some(extent) = rx.recv().await {
            self.observer.on_extent(&extent);
            summary.extents += 1;
            if extent.is_data() {
                summary.data_bytes += extent.len();
            }

            for job in self.plan_extent(&extent) {
                tx.send(job).await.map_err(|_| SyncError::Cancelled)?;
                summary.jobs += 1;
            }
        }

        Ok(summary)
    }

    /// Transfer jobs for one source extent.
    pub fn plan_extent(&self, extent: &Extent) -> Vec<TransferJob> {
        match extent.kind {
            Kind::Data => extent
                .interval
                .split_aligned(self.config.batch_size)
                .map(|interval| TransferJob::Data {
                    interval,
                    expected: self.dest.digest_for(interval),
                })
                .collect(),
            Kind::Hole if !self.dest.is_known() => {
                if extent.is_empty() {
                    vec![]
                } else {
                    vec![TransferJob::Punch {
                        interval: extent.interval,
                    }]
                }
            }
            Kind::Hole => {
                let mut punches: Vec<TransferJob> = Vec::new();
                let overlaps = self
                    .dest
                    .overlapping(extent.interval)
                    .filter(|d| d.is_data())
                    .filter_map(|d| d.interval.intersect(&extent.interval));
                for overlap in overlaps {
                    // Destination chunks of one data run merge into one punch
                    match punches.last_mut() {
                        Some(TransferJob::Punch { interval }) if interval.end == overlap.begin => {
                            interval.end = overlap.end;
                        }
                        _ => punches.push(TransferJob::Punch { interval: overlap }),
                    }
                }
                punches
            }
        }
    }
}

/// Compute the whole transfer plan for an in-memory layout.
pub fn plan(layout: &[Extent], dest: DestIndex, batch_size: u64) -> Vec<TransferJob> {
    let generator = Generator::new(
        GeneratorConfig { batch_size },
        dest,
        crate::observer::default_observer(),
    );
    layout
        .iter()
        .flat_map(|extent| generator.plan_extent(extent))
        .collect()
}
