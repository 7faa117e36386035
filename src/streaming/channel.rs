//! Channel types for the sparse sync pipeline.
//!
//! Scanner -> Generator -> Sender -> writer, with bounded channels for
//! backpressure between every stage.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, SyncError};
use crate::sparse::{Digest, Extent, Interval, Kind};
use crate::streaming::protocol::DestExtent;

/// Channel size for frames queued for the socket writer
pub const SENDER_CHANNEL_SIZE: usize = 64;

// =============================================================================
// TransferJob: Generator -> Sender
// =============================================================================

/// One unit of the transfer plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferJob {
    /// A grid-aligned batch of source data. `expected` is the digest the
    /// destination reported for exactly this range, if any.
    Data {
        interval: Interval,
        expected: Option<Digest>,
    },

    /// A source hole the destination may hold as data
    Punch { interval: Interval },
}

impl TransferJob {
    pub fn interval(&self) -> Interval {
        match self {
            TransferJob::Data { interval, .. } | TransferJob::Punch { interval } => *interval,
        }
    }
}

pub type JobSender = mpsc::Sender<TransferJob>;
pub type JobReceiver = mpsc::Receiver<TransferJob>;

pub fn job_channel(capacity: usize) -> (JobSender, JobReceiver) {
    mpsc::channel(capacity)
}

// =============================================================================
// Destination layout (from the layout exchange)
// =============================================================================

/// Destination layout as reported by the server.
#[derive(Debug, Default)]
pub struct DestIndex {
    /// `None` when the destination layout is unknown
    extents: Option<Vec<Extent>>,

    /// Chunk begin -> (chunk end, digest)
    digests: HashMap<u64, (u64, Digest)>,
}

impl DestIndex {
    /// An empty, known layout; extents are appended with [`DestIndex::insert`].
    pub fn new() -> Self {
        Self {
            extents: Some(Vec::new()),
            digests: HashMap::new(),
        }
    }

    /// Destination state unknown: every source range must be sent.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_known(&self) -> bool {
        self.extents.is_some()
    }

    /// Append the next destination extent. Extents must arrive in order and
    /// tile the file from offset zero.
    pub fn insert(&mut self, entry: DestExtent) -> Result<()> {
        let extents = self
            .extents
            .as_mut()
            .ok_or_else(|| SyncError::protocol("DestExtent for an unknown layout"))?;

        let expected_begin = extents.last().map_or(0, |e| e.end());
        if entry.extent.begin() != expected_begin || entry.extent.is_empty() {
            return Err(SyncError::protocol(format!(
                "DestExtent {} does not continue layout at {}",
                entry.extent, expected_begin
            )));
        }

        if let Some(digest) = entry.digest {
            if entry.extent.kind == Kind::Data {
                self.digests
                    .insert(entry.extent.begin(), (entry.extent.end(), digest));
            }
        }
        extents.push(entry.extent);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.extents.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_bytes(&self) -> u64 {
        self.extents
            .iter()
            .flatten()
            .filter(|e| e.is_data())
            .map(Extent::len)
            .sum()
    }

    /// Destination extents overlapping `interval`, in order.
    pub fn overlapping(&self, interval: Interval) -> impl Iterator<Item = &Extent> + '_ {
        let extents = self.extents.as_deref().unwrap_or(&[]);
        let start = extents.partition_point(|e| e.end() <= interval.begin);
        extents[start..]
            .iter()
            .take_while(move |e| e.begin() < interval.end)
    }

    /// Digest of a destination data chunk covering exactly `interval`.
    pub fn digest_for(&self, interval: Interval) -> Option<Digest> {
        match self.digests.get(&interval.begin) {
            Some((end, digest)) if *end == interval.end => Some(*digest),
            _ => None,
        }
    }
}

// =============================================================================
// Sync statistics
// =============================================================================

/// Statistics for a client sync session
#[derive(Debug, Default, Clone)]
pub struct SyncStats {
    /// Source file size
    pub file_size: u64,

    /// Extents reported by the source scan
    pub extents_scanned: u64,

    /// Bytes of source data (sum of Data extents)
    pub data_bytes: u64,

    /// Batches sent as Data frames
    pub batches_sent: u64,

    /// Payload bytes sent
    pub bytes_transferred: u64,

    /// Batches skipped because the destination already matched
    pub batches_skipped: u64,

    /// Bytes not sent thanks to digest matches
    pub bytes_skipped: u64,

    /// Punch requests sent
    pub holes_punched: u64,

    /// Bytes covered by punch requests
    pub bytes_punched: u64,

    /// Destination layout was unavailable; all data was sent
    pub degraded: bool,

    /// Layout digests were compared after the transfer
    pub verified: bool,

    pub duration: Duration,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Statistics for one session applied by the server
#[derive(Debug, Default, Clone)]
pub struct ApplyStats {
    pub batches_applied: u64,
    pub bytes_written: u64,
    pub holes_punched: u64,
    pub bytes_punched: u64,
    /// Punches that had to be zero-filled
    pub bytes_zero_filled: u64,
    /// Batches the client found identical and did not send
    pub batches_skipped: u64,
    pub bytes_skipped: u64,
}

// =============================================================================
// Fan-out
// =============================================================================

/// Broadcast every item of `rx` to `outputs` bounded queues, in order.
///
/// The task reads the source once and closes all outputs only after the
/// source is exhausted. A consumer that hangs up is dropped from the set;
/// the others keep receiving. If every consumer hangs up the task stops
/// reading. The join handle yields the number of items read.
pub fn fan_out<T>(
    rx: mpsc::Receiver<T>,
    outputs: usize,
    capacity: usize,
) -> (Vec<mpsc::Receiver<T>>, JoinHandle<u64>)
where
    T: Clone + Send + 'static,
{
    let (txs, rxs): (Vec<mpsc::Sender<T>>, Vec<mpsc::Receiver<T>>) =
        (0..outputs).map(|_| mpsc::channel(capacity)).unzip();
    (rxs, spawn_broadcast(rx, txs))
}

/// Two-way [`fan_out`].
pub fn tee<T>(
    rx: mpsc::Receiver<T>,
    capacity: usize,
) -> (mpsc::Receiver<T>, mpsc::Receiver<T>, JoinHandle<u64>)
where
    T: Clone + Send + 'static,
{
    let (tx1, rx1) = mpsc::channel(capacity);
    let (tx2, rx2) = mpsc::channel(capacity);
    (rx1, rx2, spawn_broadcast(rx, vec![tx1, tx2]))
}

fn spawn_broadcast<T>(mut rx: mpsc::Receiver<T>, mut txs: Vec<mpsc::Sender<T>>) -> JoinHandle<u64>
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut count = 0u64;
        while !txs.is_empty() {
            let Some(item) = rx.recv().await else {
                break;
            };
            let mut live = Vec::with_capacity(txs.len());
            for tx in txs.drain(..) {
                if tx.send(item.clone()).await.is_ok() {
                    live.push(tx);
                }
            }
            txs = live;
            count += 1;
        }
        count
    })
}

/// Drain a queue into a Vec.
pub async fn collect<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Some(item) = rx.recv().await {
        items.push(item);
    }
    items
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::hash_bytes;

    fn dest(extent: Extent, digest: Option<Digest>) -> DestExtent {
        DestExtent { extent, digest }
    }

    #[test]
    fn test_dest_index_lookup() {
        let mut index = DestIndex::new();
        let d = hash_bytes(b"chunk");
        index.insert(dest(Extent::hole(0, 100), None)).unwrap();
        index.insert(dest(Extent::data(100, 200), Some(d))).unwrap();
        index.insert(dest(Extent::data(200, 250), None)).unwrap();
        index.insert(dest(Extent::hole(250, 400), None)).unwrap();

        assert!(index.is_known());
        assert_eq!(index.len(), 4);
        assert_eq!(index.data_bytes(), 150);

        let hits: Vec<_> = index.overlapping(Interval::new(150, 260)).copied().collect();
        assert_eq!(
            hits,
            vec![Extent::data(100, 200), Extent::data(200, 250), Extent::hole(250, 400)]
        );
        assert_eq!(index.overlapping(Interval::new(400, 500)).count(), 0);

        assert_eq!(index.digest_for(Interval::new(100, 200)), Some(d));
        assert_eq!(index.digest_for(Interval::new(100, 150)), None);
        assert_eq!(index.digest_for(Interval::new(200, 250)), None);
    }

    #[test]
    fn test_dest_index_rejects_gaps() {
        let mut index = DestIndex::new();
        index.insert(dest(Extent::hole(0, 100), None)).unwrap();
        assert!(index.insert(dest(Extent::data(150, 200), None)).is_err());
        assert!(DestIndex::unknown()
            .insert(dest(Extent::hole(0, 1), None))
            .is_err());
    }

    #[tokio::test]
    async fn test_tee_delivers_everything_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let (a, b, handle) = tee(rx, 4);

        let producer = tokio::spawn(async move {
            for i in 0..1000u32 {
                tx.send(i).await.unwrap();
            }
        });

        let (left, right) = tokio::join!(collect(a), collect(b));
        producer.await.unwrap();

        let expected: Vec<u32> = (0..1000).collect();
        assert_eq!(left, expected);
        assert_eq!(right, expected);
        assert_eq!(handle.await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_fan_out_survives_dropped_consumer() {
        let (tx, rx) = mpsc::channel(2);
        let (mut rxs, handle) = fan_out(rx, 3, 2);
        drop(rxs.pop());

        tokio::spawn(async move {
            for i in 0..100u32 {
                tx.send(i).await.unwrap();
            }
        });

        let second = rxs.pop().unwrap();
        let first = rxs.pop().unwrap();
        let (x, y) = tokio::join!(collect(first), collect(second));
        assert_eq!(x.len(), 100);
        assert_eq!(x, y);
        assert_eq!(handle.await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_fan_out_closes_outputs_after_source() {
        let (tx, rx) = mpsc::channel::<u8>(1);
        let (mut a, mut b, handle) = tee(rx, 1);
        tx.send(7).await.unwrap();
        drop(tx);

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
        assert_eq!(handle.await.unwrap(), 1);
    }
}
