//! ssync - sparse file synchronization over TCP.
//!
//! Copies a file's data extents to a remote copy and reproduces its holes,
//! streaming only the ranges that differ.

pub mod config;
pub mod error;
pub mod observer;
pub mod server;
pub mod sparse;
pub mod streaming;
pub mod sync;
pub mod transport;

pub use config::{Config, ServerConfig, SessionConfig};
pub use error::{Result, SyncError};
pub use observer::{SessionState, SyncObserver, TracingObserver};
pub use server::{serve_once, ApplyServer};
pub use sparse::{retrieve_layout, Extent, Interval, Kind, Layout};
pub use streaming::{ApplyStats, SyncOrchestrator, SyncStats};
pub use sync::{sync_file, sync_file_with};
pub use transport::Endpoint;
