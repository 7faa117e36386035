//! Wire messages for sparse sync sessions.
//!
//! One session per TCP stream. The client streams Data/Punch/Skip frames
//! without waiting for per-batch acknowledgement; the server answers once,
//! with Ack or Error, after EndOfStream. Skip and KeepAlive carry no work for
//! the peer, they only keep the idle bound from expiring.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};
use crate::sparse::{Digest, Extent, Interval, Kind};

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    DestExtent = 0x02,
    DestLayoutEnd = 0x03,
    Data = 0x04,
    Punch = 0x05,
    EndOfStream = 0x06,
    Ack = 0x07,
    Error = 0x08,
    Skip = 0x09,
    KeepAlive = 0x0A,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::DestExtent),
            0x03 => Some(Self::DestLayoutEnd),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Punch),
            0x06 => Some(Self::EndOfStream),
            0x07 => Some(Self::Ack),
            0x08 => Some(Self::Error),
            0x09 => Some(Self::Skip),
            0x0A => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HelloFlags: u32 {
        /// Server digests destination data chunks during the layout exchange
        const CHECKSUMS = 1 << 0;
        /// Server returns a whole-file layout digest in the Ack
        const VERIFY = 1 << 1;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LayoutEndFlags: u8 {
        /// Destination layout could not be queried; extents sent so far are void
        const UNAVAILABLE = 1 << 0;
    }
}

// =============================================================================
// Error Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Io = 1,
    Protocol = 2,
    NotFound = 3,
    PermissionDenied = 4,
    Busy = 5,
    Unsupported = 6,
    Timeout = 7,
    Cancelled = 8,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Io),
            2 => Some(Self::Protocol),
            3 => Some(Self::NotFound),
            4 => Some(Self::PermissionDenied),
            5 => Some(Self::Busy),
            6 => Some(Self::Unsupported),
            7 => Some(Self::Timeout),
            8 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

fn put_header(buf: &mut BytesMut, payload_len: usize, msg_type: MessageType) {
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
}

fn ensure(payload: &Bytes, need: usize, what: &str) -> Result<()> {
    if payload.remaining() < need {
        return Err(SyncError::protocol(format!(
            "{} payload truncated: need {} bytes, got {}",
            what,
            need,
            payload.remaining()
        )));
    }
    Ok(())
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    ensure(payload, 2, what)?;
    let len = payload.get_u16() as usize;
    ensure(payload, len, what)?;
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::protocol(format!("Invalid UTF-8 in {}", what)))
}

fn get_digest(payload: &mut Bytes, what: &str) -> Result<Option<Digest>> {
    ensure(payload, 1, what)?;
    if payload.get_u8() == 0 {
        return Ok(None);
    }
    ensure(payload, Digest::LEN, what)?;
    let mut d = [0u8; Digest::LEN];
    payload.copy_to_slice(&mut d);
    Ok(Some(Digest(d)))
}

fn put_digest(buf: &mut BytesMut, digest: Option<&Digest>) {
    match digest {
        Some(d) => {
            buf.put_u8(1);
            buf.put_slice(d.as_bytes());
        }
        None => buf.put_u8(0),
    }
}

fn digest_len(digest: Option<&Digest>) -> usize {
    1 + digest.map_or(0, |_| Digest::LEN)
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

/// Opens a session (client) and confirms it (server).
///
/// In the client's Hello `file_size` is the size the destination must have;
/// in the server's reply it is the size the destination had before.
#[derive(Debug, Clone)]
pub struct Hello {
    pub version: u16,
    pub flags: HelloFlags,
    pub batch_size: u32,
    pub file_size: u64,
    pub path: String,
}

impl Hello {
    pub fn new(flags: HelloFlags, batch_size: u32, file_size: u64, path: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags,
            batch_size,
            file_size,
            path: path.into(),
        }
    }

    /// Fails if the path does not fit its u16 length prefix.
    pub fn encode(&self) -> Result<Bytes> {
        let path_bytes = self.path.as_bytes();
        if path_bytes.len() > u16::MAX as usize {
            return Err(SyncError::InvalidPath(format!(
                "path of {} bytes exceeds the {} byte limit",
                path_bytes.len(),
                u16::MAX
            )));
        }
        let payload_len = 2 + 4 + 4 + 8 + 2 + path_bytes.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);

        put_header(&mut buf, payload_len, MessageType::Hello);
        buf.put_u16(self.version);
        buf.put_u32(self.flags.bits());
        buf.put_u32(self.batch_size);
        buf.put_u64(self.file_size);
        buf.put_u16(path_bytes.len() as u16);
        buf.put_slice(path_bytes);

        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 18, "Hello")?;
        let version = payload.get_u16();
        let flags = HelloFlags::from_bits_truncate(payload.get_u32());
        let batch_size = payload.get_u32();
        let file_size = payload.get_u64();
        let path = get_string(&mut payload, "Hello path")?;

        Ok(Self {
            version,
            flags,
            batch_size,
            file_size,
            path,
        })
    }
}

// =============================================================================
// DEST_EXTENT (0x02)
// =============================================================================

/// One extent of the destination layout, with the chunk digest when the
/// client asked for checksums and the extent is a grid-aligned Data chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestExtent {
    pub extent: Extent,
    pub digest: Option<Digest>,
}

impl DestExtent {
    pub fn encode(&self) -> Bytes {
        let payload_len = 1 + 8 + 8 + digest_len(self.digest.as_ref());
        let mut buf = BytesMut::with_capacity(5 + payload_len);

        put_header(&mut buf, payload_len, MessageType::DestExtent);
        buf.put_u8(self.extent.kind as u8);
        buf.put_u64(self.extent.begin());
        buf.put_u64(self.extent.end());
        put_digest(&mut buf, self.digest.as_ref());

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 17, "DestExtent")?;
        let kind = Kind::from_u8(payload.get_u8())
            .ok_or_else(|| SyncError::protocol("Unknown extent kind in DestExtent"))?;
        let begin = payload.get_u64();
        let end = payload.get_u64();
        if begin > end {
            return Err(SyncError::protocol(format!(
                "DestExtent begin {} > end {}",
                begin, end
            )));
        }
        let digest = get_digest(&mut payload, "DestExtent digest")?;

        Ok(Self {
            extent: Extent::new(kind, begin, end),
            digest,
        })
    }
}

// =============================================================================
// DEST_LAYOUT_END (0x03)
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct DestLayoutEnd {
    pub flags: LayoutEndFlags,
    pub extents: u64,
    pub data_bytes: u64,
}

impl DestLayoutEnd {
    pub fn unavailable() -> Self {
        Self {
            flags: LayoutEndFlags::UNAVAILABLE,
            extents: 0,
            data_bytes: 0,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.flags.contains(LayoutEndFlags::UNAVAILABLE)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 17);
        put_header(&mut buf, 17, MessageType::DestLayoutEnd);
        buf.put_u8(self.flags.bits());
        buf.put_u64(self.extents);
        buf.put_u64(self.data_bytes);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 17, "DestLayoutEnd")?;
        Ok(Self {
            flags: LayoutEndFlags::from_bits_truncate(payload.get_u8()),
            extents: payload.get_u64(),
            data_bytes: payload.get_u64(),
        })
    }
}

// =============================================================================
// DATA (0x04)
// =============================================================================

/// Raw bytes to be written at an absolute offset. The length is implied by
/// the frame length.
#[derive(Debug, Clone)]
pub struct Data {
    pub offset: u64,
    pub data: Bytes,
}

impl Data {
    pub fn interval(&self) -> Interval {
        Interval::new(self.offset, self.offset + self.data.len() as u64)
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 8 + self.data.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);

        put_header(&mut buf, payload_len, MessageType::Data);
        buf.put_u64(self.offset);
        buf.put_slice(&self.data);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 8, "Data")?;
        let offset = payload.get_u64();
        if offset.checked_add(payload.len() as u64).is_none() {
            return Err(SyncError::protocol("Data range overflows u64"));
        }
        Ok(Self {
            offset,
            data: payload,
        })
    }
}

// =============================================================================
// PUNCH (0x05)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Punch {
    pub interval: Interval,
}

impl Punch {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 16);
        put_header(&mut buf, 16, MessageType::Punch);
        buf.put_u64(self.interval.begin);
        buf.put_u64(self.interval.len());
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 16, "Punch")?;
        let offset = payload.get_u64();
        let len = payload.get_u64();
        let end = offset
            .checked_add(len)
            .ok_or_else(|| SyncError::protocol("Punch range overflows u64"))?;
        Ok(Self {
            interval: Interval::new(offset, end),
        })
    }
}

// =============================================================================
// END_OF_STREAM (0x06)
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct EndOfStream {
    pub batches: u64,
    pub bytes: u64,
}

impl EndOfStream {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 16);
        put_header(&mut buf, 16, MessageType::EndOfStream);
        buf.put_u64(self.batches);
        buf.put_u64(self.bytes);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 16, "EndOfStream")?;
        Ok(Self {
            batches: payload.get_u64(),
            bytes: payload.get_u64(),
        })
    }
}

// =============================================================================
// ACK (0x07)
// =============================================================================

/// Sent by the server after the destination has been fsynced.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ack {
    pub bytes_written: u64,
    pub bytes_punched: u64,
    pub digest: Option<Digest>,
}

impl Ack {
    pub fn encode(&self) -> Bytes {
        let payload_len = 16 + digest_len(self.digest.as_ref());
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        put_header(&mut buf, payload_len, MessageType::Ack);
        buf.put_u64(self.bytes_written);
        buf.put_u64(self.bytes_punched);
        put_digest(&mut buf, self.digest.as_ref());
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 16, "Ack")?;
        let bytes_written = payload.get_u64();
        let bytes_punched = payload.get_u64();
        let digest = get_digest(&mut payload, "Ack digest")?;
        Ok(Self {
            bytes_written,
            bytes_punched,
            digest,
        })
    }
}

// =============================================================================
// ERROR (0x08)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
}

impl Error {
    pub fn from_sync_error(e: &SyncError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let msg_bytes = self.message.as_bytes();
        let msg_len = msg_bytes.len().min(u16::MAX as usize);
        let payload_len = 2 + 2 + msg_len;
        let mut buf = BytesMut::with_capacity(5 + payload_len);

        put_header(&mut buf, payload_len, MessageType::Error);
        buf.put_u16(self.code as u16);
        buf.put_u16(msg_len as u16);
        buf.put_slice(&msg_bytes[..msg_len]);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 2, "Error")?;
        let code = ErrorCode::from_u16(payload.get_u16()).unwrap_or(ErrorCode::Io);
        ensure(&payload, 2, "Error message")?;
        let len = payload.get_u16() as usize;
        ensure(&payload, len, "Error message")?;
        // encode() may cut a long message mid-character
        let message = String::from_utf8_lossy(&payload.copy_to_bytes(len)).into_owned();

        Ok(Self { code, message })
    }

    pub fn into_sync_error(self) -> SyncError {
        SyncError::Remote {
            code: self.code,
            message: self.message,
        }
    }
}

// =============================================================================
// SKIP (0x09)
// =============================================================================

/// A batch the destination already holds; nothing is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skip {
    pub interval: Interval,
}

impl Skip {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 16);
        put_header(&mut buf, 16, MessageType::Skip);
        buf.put_u64(self.interval.begin);
        buf.put_u64(self.interval.len());
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 16, "Skip")?;
        let offset = payload.get_u64();
        let len = payload.get_u64();
        let end = offset
            .checked_add(len)
            .ok_or_else(|| SyncError::protocol("Skip range overflows u64"))?;
        Ok(Self {
            interval: Interval::new(offset, end),
        })
    }
}

// =============================================================================
// KEEP_ALIVE (0x0A)
// =============================================================================

/// Empty frame sent by the server while it fsyncs and digests the
/// destination before the Ack.
pub fn keep_alive() -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    put_header(&mut buf, 0, MessageType::KeepAlive);
    buf.freeze()
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r
        .read_u32()
        .await
        .map_err(|e| SyncError::io("Failed to read frame length", e))?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::protocol(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let msg_type = r
        .read_u8()
        .await
        .map_err(|e| SyncError::io("Failed to read message type", e))?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| SyncError::protocol(format!("Unknown message type 0x{:02x}", msg_type)))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| SyncError::io("Failed to read frame payload", e))?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame)
        .await
        .map_err(|e| SyncError::io("Failed to write frame", e))
}

// =============================================================================
// Version Negotiation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    Supported(u16),
    TooOld { client: u16, min_supported: u16 },
    TooNew { client: u16, max_supported: u16 },
}

pub fn negotiate_version(client_version: u16) -> VersionNegotiationResult {
    if client_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            client: client_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if client_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            client: client_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(client_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::hash_bytes;

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello::new(
            HelloFlags::CHECKSUMS | HelloFlags::VERIFY,
            128 * 1024,
            10 << 30,
            "/var/lib/images/disk.img",
        );
        let encoded = hello.encode().unwrap();
        assert_eq!(encoded[4], MessageType::Hello as u8);

        let decoded = Hello::decode(encoded.slice(5..)).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.flags, HelloFlags::CHECKSUMS | HelloFlags::VERIFY);
        assert_eq!(decoded.batch_size, 128 * 1024);
        assert_eq!(decoded.file_size, 10 << 30);
        assert_eq!(decoded.path, "/var/lib/images/disk.img");
    }

    #[test]
    fn test_dest_extent_with_and_without_digest() {
        let with = DestExtent {
            extent: Extent::data(1 << 33, (1 << 33) + 4096),
            digest: Some(hash_bytes(b"chunk")),
        };
        let decoded = DestExtent::decode(with.encode().slice(5..)).unwrap();
        assert_eq!(decoded, with);

        let without = DestExtent {
            extent: Extent::hole(0, 4096),
            digest: None,
        };
        let encoded = without.encode();
        assert_eq!(encoded.len(), 5 + 18);
        assert_eq!(DestExtent::decode(encoded.slice(5..)).unwrap(), without);
    }

    #[test]
    fn test_data_length_comes_from_frame() {
        let data = Data {
            offset: 5 << 32,
            data: Bytes::from_static(b"payload bytes"),
        };
        let decoded = Data::decode(data.encode().slice(5..)).unwrap();
        assert_eq!(decoded.offset, 5 << 32);
        assert_eq!(&decoded.data[..], b"payload bytes");
        assert_eq!(decoded.interval(), Interval::new(5 << 32, (5 << 32) + 13));
    }

    #[test]
    fn test_hello_rejects_path_longer_than_prefix() {
        let long = "a".repeat(u16::MAX as usize + 10);
        let err = Hello::new(HelloFlags::empty(), 4096, 0, long).encode().unwrap_err();
        assert!(matches!(err, SyncError::InvalidPath(_)));

        let longest = "b".repeat(u16::MAX as usize);
        let encoded = Hello::new(HelloFlags::empty(), 4096, 0, longest.clone())
            .encode()
            .unwrap();
        assert_eq!(Hello::decode(encoded.slice(5..)).unwrap().path, longest);
    }

    #[tokio::test]
    async fn test_skip_and_keep_alive_frames() {
        let mut wire = Vec::new();
        let skip = Skip {
            interval: Interval::new(1 << 40, (1 << 40) + 131072),
        };
        write_frame(&mut wire, &skip.encode()).await.unwrap();
        write_frame(&mut wire, &keep_alive()).await.unwrap();

        let mut reader = &wire[..];
        let (t1, p1) = read_frame(&mut reader).await.unwrap();
        assert_eq!(t1, MessageType::Skip);
        assert_eq!(Skip::decode(p1).unwrap(), skip);

        let (t2, p2) = read_frame(&mut reader).await.unwrap();
        assert_eq!(t2, MessageType::KeepAlive);
        assert!(p2.is_empty());
    }

    #[test]
    fn test_punch_rejects_overflow() {
        let mut buf = BytesMut::new();
        buf.put_u64(u64::MAX - 1);
        buf.put_u64(10);
        assert!(Punch::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_truncated_payloads_are_protocol_errors() {
        let hello = Hello::new(HelloFlags::empty(), 4096, 0, "x").encode().unwrap();
        let err = Hello::decode(hello.slice(5..hello.len() - 1)).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));

        let ack = Ack {
            bytes_written: 1,
            bytes_punched: 2,
            digest: Some(hash_bytes(b"x")),
        }
        .encode();
        assert!(Ack::decode(ack.slice(5..ack.len() - 4)).is_err());

        let mut bad_kind = BytesMut::new();
        bad_kind.put_u8(9);
        bad_kind.put_u64(0);
        bad_kind.put_u64(1);
        bad_kind.put_u8(0);
        assert!(DestExtent::decode(bad_kind.freeze()).is_err());
    }

    #[test]
    fn test_error_frame_maps_to_remote_error() {
        let frame = Error {
            code: ErrorCode::Busy,
            message: "locked".to_string(),
        };
        let decoded = Error::decode(frame.encode().slice(5..)).unwrap();
        match decoded.into_sync_error() {
            SyncError::Remote { code, message } => {
                assert_eq!(code, ErrorCode::Busy);
                assert_eq!(message, "locked");
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frame_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Punch { interval: Interval::new(0, 8192) }.encode())
            .await
            .unwrap();
        write_frame(&mut wire, &EndOfStream { batches: 3, bytes: 9 }.encode())
            .await
            .unwrap();

        let mut reader = &wire[..];
        let (t1, p1) = read_frame(&mut reader).await.unwrap();
        assert_eq!(t1, MessageType::Punch);
        assert_eq!(Punch::decode(p1).unwrap().interval, Interval::new(0, 8192));

        let (t2, p2) = read_frame(&mut reader).await.unwrap();
        assert_eq!(t2, MessageType::EndOfStream);
        assert_eq!(EndOfStream::decode(p2).unwrap().batches, 3);

        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        wire.push(MessageType::Data as u8);
        let err = read_frame(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn test_version_negotiation() {
        assert_eq!(
            negotiate_version(PROTOCOL_VERSION),
            VersionNegotiationResult::Supported(PROTOCOL_VERSION)
        );
        assert!(matches!(
            negotiate_version(0),
            VersionNegotiationResult::TooOld { .. }
        ));
        assert!(matches!(
            negotiate_version(PROTOCOL_VERSION_MAX + 1),
            VersionNegotiationResult::TooNew { .. }
        ));
    }
}
