//! Streaming sparse sync.
//!
//! One-way streaming after a short exchange: the server describes the
//! destination layout once, then the client streams only what differs.
//!
//! # Architecture
//!
//! ```text
//! Client:
//! +-----------+     +-------------+     +----------+     +--------+
//! |  Scanner  | --> |  Generator  | --> |  Sender  | --> | writer | --> socket
//! | (layout)  |     | (diff plan) |     | (reads)  |     |        |
//! +-----------+     +-------------+     +----------+     +--------+
//!       |
//!       +--> collector (verify only)
//!
//! Server:
//! socket --> Receiver (positioned writes / hole punching) --> Ack
//! ```
//!
//! # Session
//!
//! 1. Hello exchange - path, size and options; server locks and resizes
//! 2. Layout exchange - server streams DestExtent (with chunk digests)
//! 3. Transfer - Data/Punch frames, no per-batch round trips
//! 4. EndOfStream / Ack - server fsyncs before acknowledging

pub mod channel;
pub mod generator;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use channel::{
    collect, fan_out, job_channel, tee, ApplyStats, DestIndex, JobReceiver, JobSender, SyncStats,
    TransferJob, SENDER_CHANNEL_SIZE,
};

pub use generator::{plan, Generator, GeneratorConfig, PlanSummary};
pub use pipeline::SyncOrchestrator;
pub use receiver::{describe_layout, validate_path, Destination, Receiver, ReceiverConfig};
pub use sender::{Sender, SenderConfig, SenderSummary};

pub use protocol::{
    negotiate_version, read_frame, write_frame, Ack, Data, DestExtent, DestLayoutEnd, EndOfStream,
    Error, ErrorCode, Hello, HelloFlags, LayoutEndFlags, MessageType, Punch,
    VersionNegotiationResult, MAX_FRAME_SIZE, PROTOCOL_VERSION, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN,
};
