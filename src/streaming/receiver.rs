//! Receiver task for sparse sync.
//!
//! Runs the server side of one session: opens and locks the destination,
//! describes its layout to the client, then applies Data/Punch frames with
//! positioned writes until EndOfStream. Skip frames only count as activity.

use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::sparse::{
    hash_range, layout_digest, punch_hole, retrieve_layout, write_at, Extent, Interval, Punched,
};
use crate::streaming::channel::ApplyStats;
use crate::streaming::protocol::{
    self as wire, keep_alive, negotiate_version, read_frame, write_frame, Ack, Data, DestExtent,
    DestLayoutEnd, EndOfStream, Hello, HelloFlags, LayoutEndFlags, MessageType, Punch, Skip,
    VersionNegotiationResult, MAX_FRAME_SIZE,
};
use crate::transport::with_timeout;

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
pub fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(SyncError::InvalidPath("Empty path not allowed".into()));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(SyncError::InvalidPath(format!(
            "Absolute paths not allowed: {}",
            relative
        )));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(SyncError::InvalidPath(format!(
                    "Path traversal not allowed: {}",
                    relative
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(SyncError::InvalidPath(format!(
                    "Rooted paths not allowed: {}",
                    relative
                )));
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(SyncError::InvalidPath(format!(
            "Path escapes root directory: {}",
            relative
        )));
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Destination paths are resolved under this directory when set
    pub root: Option<PathBuf>,
    /// Idle bound for every frame read and write
    pub timeout: Duration,
    /// DestExtent frames queued between the layout scan and the socket
    pub queue_capacity: usize,
}

/// The destination file of a session, locked for its lifetime.
pub struct Destination {
    pub path: PathBuf,
    pub file: Arc<File>,
    /// Negotiated size
    pub size: u64,
    /// Size before the session started
    pub previous_size: u64,
}

impl Destination {
    /// Open or create `path`, take an exclusive lock and resize it to `size`.
    pub fn open(path: &Path, size: u64) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::io(format!("Failed to create {}", parent.display()), e)
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SyncError::io(format!("Failed to open {}", path.display()), e))?;

        if let Err(e) = fs2::FileExt::try_lock_exclusive(&file) {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(SyncError::Busy(path.to_path_buf()));
            }
            return Err(SyncError::io(format!("Failed to lock {}", path.display()), e));
        }

        let previous_size = file
            .metadata()
            .map_err(|e| SyncError::io(format!("Failed to stat {}", path.display()), e))?
            .len();
        file.set_len(size).map_err(|e| {
            SyncError::io(format!("Failed to resize {} to {}", path.display(), size), e)
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
            size,
            previous_size,
        })
    }

    fn check_range(&self, interval: Interval, what: &str) -> Result<()> {
        if interval.end > self.size {
            return Err(SyncError::protocol(format!(
                "{} {} beyond negotiated size {}",
                what, interval, self.size
            )));
        }
        Ok(())
    }
}

/// Describe the layout of `interval` as DestExtent messages.
///
/// With `checksums`, Data extents are cut on the `batch_size` grid and each
/// chunk carries its digest, so the client can match them against its own
/// batches. Blocking; returns the number of source bytes in Data extents.
pub fn describe_layout(
    file: &File,
    interval: Interval,
    batch_size: u64,
    checksums: bool,
    tx: &mpsc::Sender<DestExtent>,
) -> Result<u64> {
    let layout = retrieve_layout(file, interval)?;
    let mut data_bytes = 0u64;

    for extent in layout {
        if extent.is_hole() || !checksums {
            if extent.is_data() {
                data_bytes += extent.len();
            }
            tx.blocking_send(DestExtent {
                extent,
                digest: None,
            })
            .map_err(|_| SyncError::Cancelled)?;
            continue;
        }

        for chunk in extent.interval.split_aligned(batch_size) {
            let digest = hash_range(file, chunk)?;
            data_bytes += chunk.len();
            tx.blocking_send(DestExtent {
                extent: Extent::data(chunk.begin, chunk.end),
                digest: Some(digest),
            })
            .map_err(|_| SyncError::Cancelled)?;
        }
    }

    Ok(data_bytes)
}

/// How often a KeepAlive goes out while the server is busy before the Ack.
pub fn keep_alive_period(idle: Duration) -> Duration {
    (idle / 2).max(Duration::from_millis(1))
}

/// Receiver state
pub struct Receiver {
    config: ReceiverConfig,
    stats: ApplyStats,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            stats: ApplyStats::default(),
        }
    }

    /// Run one session. Failures are reported to the client with an Error
    /// frame before being returned.
    pub async fn run<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<ApplyStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self.session(reader, writer).await {
            Ok(()) => Ok(self.stats.clone()),
            Err(e) => {
                // Nothing to tell a peer that is gone or that aborted first
                if !matches!(e, SyncError::ConnectionClosed | SyncError::Remote { .. }) {
                    let frame = wire::Error::from_sync_error(&e).encode();
                    let sent = with_timeout(self.config.timeout, "sending Error", async {
                        write_frame(writer, &frame).await?;
                        writer
                            .flush()
                            .await
                            .map_err(|e| SyncError::io("Failed to flush", e))
                    })
                    .await;
                    if let Err(send_err) = sent {
                        tracing::debug!("could not report error to client: {}", send_err);
                    }
                }
                Err(e)
            }
        }
    }

    async fn session<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let idle = self.config.timeout;

        // 1. HELLO
        let (msg_type, payload) = with_timeout(idle, "waiting for Hello", read_frame(reader)).await?;
        if msg_type != MessageType::Hello {
            return Err(SyncError::protocol(format!(
                "Expected Hello, got {:?}",
                msg_type
            )));
        }
        let hello = Hello::decode(payload)?;
        match negotiate_version(hello.version) {
            VersionNegotiationResult::Supported(_) => {}
            VersionNegotiationResult::TooOld { client, min_supported } => {
                return Err(SyncError::Unsupported(format!(
                    "protocol version {} is older than {}",
                    client, min_supported
                )));
            }
            VersionNegotiationResult::TooNew { client, max_supported } => {
                return Err(SyncError::Unsupported(format!(
                    "protocol version {} is newer than {}",
                    client, max_supported
                )));
            }
        }
        let batch_size = u64::from(hello.batch_size);
        if batch_size == 0 || batch_size + 8 > u64::from(MAX_FRAME_SIZE) {
            return Err(SyncError::protocol(format!(
                "Invalid batch size {}",
                hello.batch_size
            )));
        }

        // 2. Open, lock and size the destination
        let path = self.resolve_path(&hello.path)?;
        let size = hello.file_size;
        let dest = tokio::task::spawn_blocking(move || Destination::open(&path, size)).await??;
        tracing::info!(
            "session for {} ({} bytes, was {})",
            dest.path.display(),
            dest.size,
            dest.previous_size
        );

        let accepted = hello.flags & (HelloFlags::CHECKSUMS | HelloFlags::VERIFY);
        let reply = Hello::new(accepted, hello.batch_size, dest.previous_size, "").encode()?;
        with_timeout(idle, "sending Hello", write_frame(writer, &reply)).await?;

        // 3. Destination layout
        self.send_layout(&dest, batch_size, accepted.contains(HelloFlags::CHECKSUMS), writer)
            .await?;

        // 4. Transfer
        loop {
            let (msg_type, payload) =
                with_timeout(idle, "waiting for transfer frames", read_frame(reader)).await?;
            if let Some(end) = self.handle_message(&dest, msg_type, payload).await? {
                return self
                    .finish(&dest, end, accepted.contains(HelloFlags::VERIFY), writer)
                    .await;
            }
        }
    }

    fn resolve_path(&self, requested: &str) -> Result<PathBuf> {
        match &self.config.root {
            Some(root) => validate_path(root, requested),
            None if requested.is_empty() => {
                Err(SyncError::InvalidPath("Empty path not allowed".into()))
            }
            None => Ok(PathBuf::from(requested)),
        }
    }

    async fn send_layout<W>(
        &self,
        dest: &Destination,
        batch_size: u64,
        checksums: bool,
        writer: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let idle = self.config.timeout;
        let (tx, mut rx) = mpsc::channel(self.config.queue_capacity);
        let file = Arc::clone(&dest.file);
        let range = Interval::new(0, dest.size);
        let scan = tokio::task::spawn_blocking(move || {
            describe_layout(&file, range, batch_size, checksums, &tx)
        });

        let mut extents = 0u64;
        while let Some(entry) = rx.recv().await {
            with_timeout(idle, "sending destination layout", write_frame(writer, &entry.encode()))
                .await?;
            extents += 1;
        }

        let end = match scan.await? {
            Ok(data_bytes) => DestLayoutEnd {
                flags: LayoutEndFlags::empty(),
                extents,
                data_bytes,
            },
            Err(SyncError::Layout(msg)) => {
                tracing::warn!(
                    "layout of {} unavailable: {}",
                    dest.path.display(),
                    msg
                );
                DestLayoutEnd::unavailable()
            }
            Err(e) => return Err(e),
        };
        tracing::debug!("sent {} destination extents", extents);

        with_timeout(idle, "sending layout end", async {
            write_frame(writer, &end.encode()).await?;
            writer
                .flush()
                .await
                .map_err(|e| SyncError::io("Failed to flush", e))
        })
        .await
    }

    /// Apply one transfer frame. Returns the EndOfStream message once the
    /// client has finished sending.
    pub async fn handle_message(
        &mut self,
        dest: &Destination,
        msg_type: MessageType,
        payload: Bytes,
    ) -> Result<Option<EndOfStream>> {
        match msg_type {
            MessageType::Data => {
                let data = Data::decode(payload)?;
                self.handle_data(dest, data).await?;
            }
            MessageType::Punch => {
                let punch = Punch::decode(payload)?;
                self.handle_punch(dest, punch).await?;
            }
            MessageType::Skip => {
                let skip = Skip::decode(payload)?;
                dest.check_range(skip.interval, "Skip")?;
                self.stats.batches_skipped += 1;
                self.stats.bytes_skipped += skip.interval.len();
            }
            MessageType::EndOfStream => {
                return Ok(Some(EndOfStream::decode(payload)?));
            }
            MessageType::Error => {
                return Err(wire::Error::decode(payload)?.into_sync_error());
            }
            other => {
                return Err(SyncError::protocol(format!(
                    "Unexpected {:?} during transfer",
                    other
                )));
            }
        }
        Ok(None)
    }

    async fn handle_data(&mut self, dest: &Destination, data: Data) -> Result<()> {
        let interval = data.interval();
        dest.check_range(interval, "Data")?;

        let file = Arc::clone(&dest.file);
        tokio::task::spawn_blocking(move || write_at(&file, data.offset, &data.data)).await??;

        self.stats.batches_applied += 1;
        self.stats.bytes_written += interval.len();
        Ok(())
    }

    async fn handle_punch(&mut self, dest: &Destination, punch: Punch) -> Result<()> {
        let interval = punch.interval;
        dest.check_range(interval, "Punch")?;

        let file = Arc::clone(&dest.file);
        let punched = tokio::task::spawn_blocking(move || punch_hole(&file, interval)).await??;

        self.stats.holes_punched += 1;
        self.stats.bytes_punched += interval.len();
        if punched == Punched::ZeroFilled {
            self.stats.bytes_zero_filled += interval.len();
        }
        Ok(())
    }

    async fn finish<W>(
        &mut self,
        dest: &Destination,
        end: EndOfStream,
        verify: bool,
        writer: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if end.batches != self.stats.batches_applied || end.bytes != self.stats.bytes_written {
            return Err(SyncError::protocol(format!(
                "client sent {} batches / {} bytes, applied {} / {}",
                end.batches, end.bytes, self.stats.batches_applied, self.stats.bytes_written
            )));
        }

        let file = Arc::clone(&dest.file);
        let size = dest.size;
        let mut work = tokio::task::spawn_blocking(move || {
            file.sync_all()
                .map_err(|e| SyncError::io("Failed to fsync destination", e))?;
            if !verify {
                return Ok(None);
            }
            let layout = retrieve_layout(&file, Interval::new(0, size))?;
            layout_digest(&file, &layout, size).map(Some)
        });

        // The client times its Ack wait from our last frame
        let idle = self.config.timeout;
        let mut ticker = tokio::time::interval(keep_alive_period(idle));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let digest = loop {
            tokio::select! {
                done = &mut work => break done??,
                _ = ticker.tick() => {
                    with_timeout(idle, "sending KeepAlive", async {
                        write_frame(writer, &keep_alive()).await?;
                        writer
                            .flush()
                            .await
                            .map_err(|e| SyncError::io("Failed to flush", e))
                    })
                    .await?;
                }
            }
        };

        let ack = Ack {
            bytes_written: self.stats.bytes_written,
            bytes_punched: self.stats.bytes_punched,
            digest,
        };
        with_timeout(self.config.timeout, "sending Ack", async {
            write_frame(writer, &ack.encode()).await?;
            writer
                .flush()
                .await
                .map_err(|e| SyncError::io("Failed to flush", e))
        })
        .await?;

        tracing::info!(
            "applied {} batches ({} bytes), {} punches, {} identical batches to {}",
            self.stats.batches_applied,
            self.stats.bytes_written,
            self.stats.holes_punched,
            self.stats.batches_skipped,
            dest.path.display()
        );
        Ok(())
    }

    pub fn stats(&self) -> &ApplyStats {
        &self.stats
    }
}
