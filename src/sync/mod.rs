//! Single-file sync entry points.
//!
//! Thin wrappers over [`SyncOrchestrator`] for callers that do not need to
//! hold on to the session.

use std::path::Path;
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::observer::SyncObserver;
use crate::streaming::{SyncOrchestrator, SyncStats};
use crate::transport::Endpoint;

/// Sync `source` to `dest_path` on the server at `endpoint` with default
/// settings. Returns the number of bytes transferred.
pub async fn sync_file(
    source: &Path,
    endpoint: &Endpoint,
    dest_path: &str,
    timeout_secs: u64,
) -> Result<u64> {
    let config = SessionConfig::default().with_timeout_secs(timeout_secs);
    let stats = SyncOrchestrator::new(config)
        .sync(source, endpoint, dest_path)
        .await?;
    Ok(stats.bytes_transferred)
}

/// Sync with explicit settings, reporting progress to `observer`.
pub async fn sync_file_with(
    source: &Path,
    endpoint: &Endpoint,
    dest_path: &str,
    config: SessionConfig,
    observer: Arc<dyn SyncObserver>,
) -> Result<SyncStats> {
    SyncOrchestrator::new(config)
        .with_observer(observer)
        .sync(source, endpoint, dest_path)
        .await
}
