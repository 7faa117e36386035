//! Session observer.
//!
//! The engine reports progress through this trait instead of logging from
//! deep inside the pipeline. [`TracingObserver`] is the default; the CLI
//! adds a progress bar on top.

use std::fmt;
use std::sync::Arc;

use crate::sparse::{Extent, Interval};

/// Client session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    Negotiated,
    Transferring,
    Verifying,
    Done,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::Negotiated => "negotiated",
            SessionState::Transferring => "transferring",
            SessionState::Verifying => "verifying",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Callbacks invoked from pipeline tasks; implementations must be cheap and
/// must not block.
pub trait SyncObserver: Send + Sync {
    fn on_state(&self, _state: SessionState) {}

    /// Source extent discovered by the scanner
    fn on_extent(&self, _extent: &Extent) {}

    /// Destination layout received; `None` when it was unavailable
    fn on_dest_layout(&self, _extents: Option<usize>) {}

    fn on_batch_sent(&self, _interval: &Interval) {}

    /// Batch skipped because the destination already holds identical bytes
    fn on_batch_skipped(&self, _interval: &Interval) {}

    fn on_punch(&self, _interval: &Interval) {}
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_state(&self, state: SessionState) {
        tracing::debug!("session state -> {}", state);
    }

    fn on_extent(&self, extent: &Extent) {
        tracing::trace!("source extent {}", extent);
    }

    fn on_dest_layout(&self, extents: Option<usize>) {
        match extents {
            Some(n) => tracing::debug!("destination layout: {} extents", n),
            None => tracing::info!("destination layout unavailable, sending all data"),
        }
    }

    fn on_batch_sent(&self, interval: &Interval) {
        tracing::trace!("sent batch {}", interval);
    }

    fn on_batch_skipped(&self, interval: &Interval) {
        tracing::trace!("skipped identical batch {}", interval);
    }

    fn on_punch(&self, interval: &Interval) {
        tracing::trace!("punch {}", interval);
    }
}

pub fn default_observer() -> Arc<dyn SyncObserver> {
    Arc::new(TracingObserver)
}
