//! Sparse sync pipeline.
//!
//! Orchestrates the client side of a session: handshake, destination layout
//! exchange, then Scanner -> Generator -> Sender -> writer running
//! concurrently while a reader task waits for the server's reply.

use bytes::Bytes;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::{Result, SyncError};
use crate::observer::{default_observer, SessionState, SyncObserver};
use crate::sparse::{layout_digest, layout_stream, Interval};
use crate::streaming::channel::{collect, job_channel, tee, DestIndex, SyncStats, SENDER_CHANNEL_SIZE};
use crate::streaming::generator::{Generator, GeneratorConfig};
use crate::streaming::protocol::{
    self as wire, read_frame, write_frame, Ack, DestExtent, DestLayoutEnd, EndOfStream, Hello,
    HelloFlags, MessageType, PROTOCOL_VERSION,
};
use crate::streaming::sender::{Sender, SenderConfig};
use crate::transport::{connect, with_timeout, Endpoint};

/// Client side of a sync session.
pub struct SyncOrchestrator {
    config: SessionConfig,
    observer: Arc<dyn SyncObserver>,
    state: SessionState,
}

impl SyncOrchestrator {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            observer: default_observer(),
            state: SessionState::Idle,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.observer.on_state(state);
    }

    /// Sync `source` to `dest_path` on the server at `endpoint`.
    ///
    /// The source is opened before connecting, so a missing source fails
    /// without touching the network.
    pub async fn sync(
        &mut self,
        source: &Path,
        endpoint: &Endpoint,
        dest_path: &str,
    ) -> Result<SyncStats> {
        let (file, stream) = match self.open_and_connect(source, endpoint).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!("sync to {} failed: {}", dest_path, e);
                self.set_state(SessionState::Failed);
                return Err(e);
            }
        };
        let (reader, writer) = stream.into_split();

        self.run(Arc::new(file), dest_path, reader, writer).await
    }

    async fn open_and_connect(
        &self,
        source: &Path,
        endpoint: &Endpoint,
    ) -> Result<(File, tokio::net::TcpStream)> {
        self.config.validate()?;
        let file = File::open(source)
            .map_err(|e| SyncError::io(format!("Failed to open {}", source.display()), e))?;
        let stream = connect(endpoint, self.config.timeout()).await?;
        Ok((file, stream))
    }

    /// Run a session over an established connection.
    pub async fn run<R, W>(
        &mut self,
        source: Arc<File>,
        dest_path: &str,
        reader: R,
        writer: W,
    ) -> Result<SyncStats>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.set_state(SessionState::Connected);
        let result = self.session(source, dest_path, reader, writer).await;
        match &result {
            Ok(stats) => {
                tracing::info!(
                    "sync to {} done: {} batches sent, {} skipped, {} punches in {:?}",
                    dest_path,
                    stats.batches_sent,
                    stats.batches_skipped,
                    stats.holes_punched,
                    stats.duration
                );
                self.set_state(SessionState::Done);
            }
            Err(e) => {
                tracing::warn!("sync to {} failed: {}", dest_path, e);
                self.set_state(SessionState::Failed);
            }
        }
        result
    }

    async fn session<R, W>(
        &mut self,
        source: Arc<File>,
        dest_path: &str,
        mut reader: R,
        mut writer: W,
    ) -> Result<SyncStats>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();
        let idle = self.config.timeout();
        let capacity = self.config.queue_capacity;
        let verify = self.config.verify;

        let size = source
            .metadata()
            .map_err(|e| SyncError::io("Failed to stat source", e))?
            .len();

        // 1. HELLO
        let mut flags = HelloFlags::empty();
        if self.config.checksums {
            flags |= HelloFlags::CHECKSUMS;
        }
        if verify {
            flags |= HelloFlags::VERIFY;
        }
        let batch_size = self.config.batch_size();
        let hello = Hello::new(flags, batch_size as u32, size, dest_path).encode()?;
        with_timeout(idle, "sending Hello", async {
            write_frame(&mut writer, &hello).await?;
            writer
                .flush()
                .await
                .map_err(|e| SyncError::io("Failed to flush", e))
        })
        .await?;

        // 2. HELLO response
        let (msg_type, payload) =
            with_timeout(idle, "waiting for Hello", read_frame(&mut reader)).await?;
        let reply = match msg_type {
            MessageType::Hello => Hello::decode(payload)?,
            MessageType::Error => return Err(wire::Error::decode(payload)?.into_sync_error()),
            other => {
                return Err(SyncError::protocol(format!(
                    "Expected Hello response, got {:?}",
                    other
                )))
            }
        };
        if reply.version != PROTOCOL_VERSION {
            return Err(SyncError::protocol(format!(
                "Server answered with protocol version {}",
                reply.version
            )));
        }
        if verify && !reply.flags.contains(HelloFlags::VERIFY) {
            return Err(SyncError::Unsupported("server declined verification".into()));
        }
        tracing::debug!("destination previously {} bytes", reply.file_size);
        self.set_state(SessionState::Negotiated);

        // 3. Destination layout
        let dest = self.receive_dest_layout(&mut reader, idle).await?;

        let mut stats = SyncStats {
            file_size: size,
            degraded: !dest.is_known(),
            ..SyncStats::new()
        };

        // 4. Transfer
        self.set_state(SessionState::Transferring);
        let token = CancellationToken::new();

        let (extents, scan) = layout_stream(Arc::clone(&source), Interval::new(0, size), capacity);
        let (extents, collector) = if verify {
            let (to_generator, to_collector, _tee) = tee(extents, capacity);
            (to_generator, Some(tokio::spawn(collect(to_collector))))
        } else {
            (extents, None)
        };

        let (job_tx, job_rx) = job_channel(capacity);
        let generator = Generator::new(GeneratorConfig { batch_size }, dest, Arc::clone(&self.observer));
        let generator = tokio::spawn(generator.run(extents, job_tx));

        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(SENDER_CHANNEL_SIZE);
        let end_tx = frame_tx.clone();
        let sender = Sender::new(
            SenderConfig {
                max_in_flight: self.config.max_in_flight,
            },
            Arc::clone(&source),
            Arc::clone(&self.observer),
        );
        let sender = tokio::spawn(sender.run(job_rx, frame_tx));

        let writer = tokio::spawn(write_frames(writer, frame_rx, idle, token.clone()));
        let (alive_tx, mut alive_rx) = watch::channel(());
        let mut reply = tokio::spawn(read_reply(reader, alive_tx, token.clone()));

        let send_side = async {
            let sent = flatten(sender.await);
            let planned = flatten(generator.await);
            let scanned = flatten(scan.await);

            let (sent, planned, scanned) = match (sent, planned, scanned) {
                (Ok(sent), Ok(planned), Ok(scanned)) => (sent, planned, scanned),
                (sent, planned, scanned) => {
                    token.cancel();
                    drop(end_tx);
                    let written = flatten(writer.await).err();
                    return Err(root_cause(
                        written
                            .into_iter()
                            .chain(scanned.err())
                            .chain(planned.err())
                            .chain(sent.err()),
                    ));
                }
            };

            let end = EndOfStream {
                batches: sent.batches_sent,
                bytes: sent.bytes_transferred,
            };
            let queued = end_tx.send(end.encode()).await;
            drop(end_tx);
            // Keep the write half open until the reply arrives
            let writer = flatten(writer.await)?;
            queued.map_err(|_| SyncError::Cancelled)?;
            Ok((sent, planned, scanned, writer))
        };
        tokio::pin!(send_side);

        let ((sent, planned, scanned, _writer), early_ack) = tokio::select! {
            result = &mut send_side => match result {
                Ok(done) => (done, None),
                Err(e) => {
                    // The server may have explained why it hung up
                    let err = match e {
                        SyncError::ConnectionClosed => {
                            match with_timeout(idle, "waiting for Error", flatten_ref(&mut reply)).await {
                                Err(remote @ SyncError::Remote { .. }) => remote,
                                _ => SyncError::ConnectionClosed,
                            }
                        }
                        other => other,
                    };
                    token.cancel();
                    return Err(err);
                }
            },
            result = &mut reply => match flatten(result) {
                // Both sides finished in the same poll
                Ok(ack) => (send_side.await?, Some(ack)),
                Err(e) => {
                    token.cancel();
                    // Let the pipeline wind down before returning
                    let _ = send_side.await;
                    return Err(e);
                }
            },
        };

        let ack = match early_ack {
            Some(ack) => ack,
            None => await_ack(&mut reply, &mut alive_rx, idle).await?,
        };
        if ack.bytes_written != sent.bytes_transferred {
            return Err(SyncError::protocol(format!(
                "server wrote {} bytes, {} were sent",
                ack.bytes_written, sent.bytes_transferred
            )));
        }

        stats.extents_scanned = scanned;
        stats.data_bytes = planned.data_bytes;
        stats.batches_sent = sent.batches_sent;
        stats.bytes_transferred = sent.bytes_transferred;
        stats.batches_skipped = sent.batches_skipped;
        stats.bytes_skipped = sent.bytes_skipped;
        stats.holes_punched = sent.holes_punched;
        stats.bytes_punched = sent.bytes_punched;

        // 5. Verification
        if let Some(collector) = collector {
            self.set_state(SessionState::Verifying);
            let layout = collector.await?;
            let expected = tokio::task::spawn_blocking(move || layout_digest(&source, &layout, size))
                .await??;
            let actual = ack
                .digest
                .ok_or_else(|| SyncError::protocol("Ack carries no layout digest"))?;
            if expected != actual {
                return Err(SyncError::Integrity {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
            stats.verified = true;
        }

        stats.duration = started.elapsed();
        Ok(stats)
    }

    async fn receive_dest_layout<R>(&self, reader: &mut R, idle: Duration) -> Result<DestIndex>
    where
        R: AsyncRead + Unpin,
    {
        let mut index = DestIndex::new();
        loop {
            let (msg_type, payload) =
                with_timeout(idle, "waiting for destination layout", read_frame(reader)).await?;
            match msg_type {
                MessageType::DestExtent => index.insert(DestExtent::decode(payload)?)?,
                MessageType::DestLayoutEnd => {
                    let end = DestLayoutEnd::decode(payload)?;
                    if end.is_unavailable() {
                        self.observer.on_dest_layout(None);
                        return Ok(DestIndex::unknown());
                    }
                    if end.extents != index.len() as u64 {
                        return Err(SyncError::protocol(format!(
                            "DestLayoutEnd counts {} extents, received {}",
                            end.extents,
                            index.len()
                        )));
                    }
                    self.observer.on_dest_layout(Some(index.len()));
                    return Ok(index);
                }
                MessageType::Error => return Err(wire::Error::decode(payload)?.into_sync_error()),
                other => {
                    return Err(SyncError::protocol(format!(
                        "Unexpected {:?} during layout exchange",
                        other
                    )))
                }
            }
        }
    }
}

/// Drain encoded frames into the socket. Returns the write half once the
/// queue is closed and flushed.
async fn write_frames<W>(
    mut writer: W,
    mut frames: mpsc::Receiver<Bytes>,
    idle: Duration,
    token: CancellationToken,
) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return Err(SyncError::Cancelled),
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        with_timeout(idle, "writing frame", write_frame(&mut writer, &frame)).await?;
    }

    with_timeout(idle, "flushing", async {
        writer
            .flush()
            .await
            .map_err(|e| SyncError::io("Failed to flush", e))
    })
    .await?;
    Ok(writer)
}

/// Wait for the server's single reply: Ack, or Error at any point.
/// KeepAlive frames before it are reported on `alive`.
async fn read_reply<R>(
    mut reader: R,
    alive: watch::Sender<()>,
    token: CancellationToken,
) -> Result<Ack>
where
    R: AsyncRead + Unpin,
{
    loop {
        let (msg_type, payload) = tokio::select! {
            _ = token.cancelled() => return Err(SyncError::Cancelled),
            frame = read_frame(&mut reader) => frame?,
        };
        match msg_type {
            MessageType::KeepAlive => alive.send_replace(()),
            MessageType::Ack => return Ack::decode(payload),
            MessageType::Error => return Err(wire::Error::decode(payload)?.into_sync_error()),
            other => {
                return Err(SyncError::protocol(format!(
                    "Expected Ack, got {:?}",
                    other
                )))
            }
        }
    }
}

/// Wait for the reply task after EndOfStream. The idle bound restarts on
/// every KeepAlive, so a server busy with fsync or digesting is not cut off.
async fn await_ack(
    reply: &mut tokio::task::JoinHandle<Result<Ack>>,
    alive: &mut watch::Receiver<()>,
    idle: Duration,
) -> Result<Ack> {
    loop {
        tokio::select! {
            result = &mut *reply => return flatten(result),
            changed = alive.changed() => {
                if changed.is_err() {
                    // Reader is done; its result is ready
                    return flatten_ref(reply).await;
                }
            }
            _ = tokio::time::sleep(idle) => {
                return Err(SyncError::Timeout(format!("waiting for Ack after {:?}", idle)));
            }
        }
    }
}

fn flatten<T>(joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    joined?
}

async fn flatten_ref<T>(handle: &mut tokio::task::JoinHandle<Result<T>>) -> Result<T> {
    flatten(handle.await)
}

/// Stages that fail because a neighbour went away report `Cancelled`; the
/// first other error is the real cause.
fn root_cause(errors: impl IntoIterator<Item = SyncError>) -> SyncError {
    let mut cancelled = None;
    for e in errors {
        match e {
            SyncError::Cancelled => cancelled = Some(e),
            other => return other,
        }
    }
    cancelled.unwrap_or(SyncError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::{hash_bytes, write_at};
    use crate::streaming::protocol::{keep_alive, Data, LayoutEndFlags};
    use tempfile::NamedTempFile;
    use tokio::io::DuplexStream;

    fn source_with_data(len: usize) -> (NamedTempFile, Arc<File>) {
        let tmp = NamedTempFile::new().unwrap();
        write_at(tmp.as_file(), 0, &vec![0x42u8; len]).unwrap();
        let file = Arc::new(tmp.reopen().unwrap());
        (tmp, file)
    }

    /// Answer the handshake like a server whose destination is new and empty.
    async fn accept_session(server: &mut DuplexStream) -> Hello {
        let (msg_type, payload) = read_frame(server).await.unwrap();
        assert_eq!(msg_type, MessageType::Hello);
        let hello = Hello::decode(payload).unwrap();

        let reply = Hello::new(hello.flags, hello.batch_size, 0, "").encode().unwrap();
        write_frame(server, &reply).await.unwrap();
        let end = DestLayoutEnd {
            flags: LayoutEndFlags::empty(),
            extents: 0,
            data_bytes: 0,
        };
        write_frame(server, &end.encode()).await.unwrap();
        hello
    }

    /// Read transfer frames up to EndOfStream; returns the Data bytes seen.
    async fn drain_transfer(server: &mut DuplexStream) -> u64 {
        let mut written = 0;
        loop {
            let (msg_type, payload) = read_frame(server).await.unwrap();
            match msg_type {
                MessageType::Data => written += Data::decode(payload).unwrap().data.len() as u64,
                MessageType::EndOfStream => return written,
                _ => {}
            }
        }
    }

    #[test]
    fn test_root_cause_skips_cancellations() {
        let err = root_cause(vec![
            SyncError::Cancelled,
            SyncError::Timeout("writing frame".into()),
            SyncError::Cancelled,
        ]);
        assert!(err.is_timeout());
        assert!(matches!(
            root_cause(std::iter::empty::<SyncError>()),
            SyncError::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_server_error_during_handshake() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client);

        let server_task = tokio::spawn(async move {
            let _ = read_frame(&mut server).await.unwrap();
            let err = wire::Error {
                code: wire::ErrorCode::Busy,
                message: "locked".into(),
            };
            write_frame(&mut server, &err.encode()).await.unwrap();
        });

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let source = Arc::new(tmp.reopen().unwrap());
        let mut orchestrator = SyncOrchestrator::new(SessionConfig::default());
        let err = orchestrator
            .run(source, "dest.img", reader, writer)
            .await
            .unwrap_err();

        server_task.await.unwrap();
        assert!(matches!(
            err,
            SyncError::Remote {
                code: wire::ErrorCode::Busy,
                ..
            }
        ));
        assert_eq!(orchestrator.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client);

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let source = Arc::new(tmp.reopen().unwrap());
        let mut orchestrator = SyncOrchestrator::new(SessionConfig::default().with_timeout_secs(1));

        let started = Instant::now();
        let err = orchestrator
            .run(source, "dest.img", reader, writer)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_digest_mismatch_is_integrity_error() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client);

        let server_task = tokio::spawn(async move {
            let hello = accept_session(&mut server).await;
            assert!(hello.flags.contains(HelloFlags::VERIFY));
            let written = drain_transfer(&mut server).await;
            let ack = Ack {
                bytes_written: written,
                bytes_punched: 0,
                digest: Some(hash_bytes(b"not the source layout")),
            };
            write_frame(&mut server, &ack.encode()).await.unwrap();
            server
        });

        let (_tmp, source) = source_with_data(300 * 1024);
        let config = SessionConfig {
            verify: true,
            ..SessionConfig::default()
        };
        let mut orchestrator = SyncOrchestrator::new(config);
        let err = orchestrator
            .run(source, "dest.img", reader, writer)
            .await
            .unwrap_err();

        let _server = server_task.await.unwrap();
        assert!(err.is_integrity(), "got {:?}", err);
        assert_eq!(orchestrator.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_connection_lost_mid_transfer() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client);

        tokio::spawn(async move {
            accept_session(&mut server).await;
            let _ = read_frame(&mut server).await.unwrap();
            drop(server);
        });

        let (_tmp, source) = source_with_data(4 * 1024 * 1024);
        let mut orchestrator = SyncOrchestrator::new(SessionConfig::default().with_timeout_secs(30));

        let started = Instant::now();
        let err = orchestrator
            .run(source, "dest.img", reader, writer)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectionClosed), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(orchestrator.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_keep_alive_extends_ack_wait() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client);

        let server_task = tokio::spawn(async move {
            accept_session(&mut server).await;
            let written = drain_transfer(&mut server).await;
            // Busy for longer than the idle bound, but never silent that long
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(300)).await;
                write_frame(&mut server, &keep_alive()).await.unwrap();
            }
            let ack = Ack {
                bytes_written: written,
                bytes_punched: 0,
                digest: None,
            };
            write_frame(&mut server, &ack.encode()).await.unwrap();
            server
        });

        let (_tmp, source) = source_with_data(256 * 1024);
        let mut orchestrator = SyncOrchestrator::new(SessionConfig::default().with_timeout_secs(1));
        let stats = orchestrator
            .run(source, "dest.img", reader, writer)
            .await
            .unwrap();

        let _server = server_task.await.unwrap();
        assert_eq!(stats.bytes_transferred, 256 * 1024);
        assert_eq!(orchestrator.state(), SessionState::Done);
    }

    #[tokio::test]
    async fn test_failure_before_connecting_marks_session_failed() {
        let endpoint = Endpoint::new("127.0.0.1", 1);

        let mut orchestrator = SyncOrchestrator::new(SessionConfig::default());
        let err = orchestrator
            .sync(Path::new("/nonexistent/source.img"), &endpoint, "dest.img")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }), "got {:?}", err);
        assert_eq!(orchestrator.state(), SessionState::Failed);

        let mut invalid = SyncOrchestrator::new(SessionConfig {
            timeout_secs: 0,
            ..SessionConfig::default()
        });
        let err = invalid
            .sync(Path::new("/nonexistent/source.img"), &endpoint, "dest.img")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)), "got {:?}", err);
        assert_eq!(invalid.state(), SessionState::Failed);
    }
}
