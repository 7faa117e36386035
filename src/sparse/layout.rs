//! Sparse layout scanner.
//!
//! Walks a byte range with `lseek(SEEK_DATA)` / `lseek(SEEK_HOLE)` and
//! reports the Data/Hole extents the filesystem knows about. The scan moves
//! the descriptor's file offset; everything else in this crate uses
//! positioned I/O, so sharing the handle is fine.

use std::fs::File;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, SyncError};
use crate::sparse::interval::{Extent, Interval, Layout};

/// Retrieve the extent layout of `interval` within `file`.
///
/// The result tiles `interval` exactly, in order. Extents reported by the
/// filesystem are clipped to the requested boundaries.
pub fn retrieve_layout(file: &File, interval: Interval) -> Result<Layout> {
    let mut layout = Vec::new();
    scan(file, interval, |extent| {
        layout.push(extent);
        Ok(())
    })?;
    Ok(layout)
}

/// Scan `interval` and push each extent into `tx` as soon as it is found.
///
/// Blocking; run it on a blocking task. Returns the number of extents sent.
pub fn stream_layout(file: &File, interval: Interval, tx: &mpsc::Sender<Extent>) -> Result<u64> {
    let mut count = 0u64;
    scan(file, interval, |extent| {
        tx.blocking_send(extent).map_err(|_| SyncError::Cancelled)?;
        count += 1;
        Ok(())
    })?;
    Ok(count)
}

/// Spawn a blocking scan feeding a bounded queue of `capacity` extents.
///
/// The join handle yields the scan result once the queue has been closed.
pub fn layout_stream(
    file: Arc<File>,
    interval: Interval,
    capacity: usize,
) -> (mpsc::Receiver<Extent>, JoinHandle<Result<u64>>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::task::spawn_blocking(move || stream_layout(&file, interval, &tx));
    (rx, handle)
}

fn scan<F>(file: &File, interval: Interval, mut emit: F) -> Result<()>
where
    F: FnMut(Extent) -> Result<()>,
{
    if interval.is_empty() {
        return Ok(());
    }

    let size = file
        .metadata()
        .map_err(|e| SyncError::io("Failed to stat file for layout", e))?
        .len();
    if interval.end > size {
        return Err(SyncError::Layout(format!(
            "range {} is beyond end of file ({} bytes)",
            interval, size
        )));
    }

    let mut cursor = interval.begin;
    while cursor < interval.end {
        let extent = match seek::data(file, cursor)? {
            // Cursor sits in data: it runs until the next hole
            Some(data) if data <= cursor => {
                let hole = seek::hole(file, cursor)?.unwrap_or(size);
                Extent::data(cursor, hole.min(interval.end))
            }
            Some(data) => Extent::hole(cursor, data.min(interval.end)),
            // ENXIO: no data past the cursor
            None => Extent::hole(cursor, interval.end),
        };

        if extent.end() <= cursor {
            return Err(SyncError::Layout(format!(
                "no progress scanning at offset {} (file changed during scan?)",
                cursor
            )));
        }

        tracing::trace!("layout extent {}", extent);
        cursor = extent.end();
        emit(extent)?;
    }

    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
mod seek {
    use super::*;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn data(file: &File, offset: u64) -> Result<Option<u64>> {
        lseek(file, offset, libc::SEEK_DATA, "SEEK_DATA")
    }

    pub fn hole(file: &File, offset: u64) -> Result<Option<u64>> {
        lseek(file, offset, libc::SEEK_HOLE, "SEEK_HOLE")
    }

    fn lseek(file: &File, offset: u64, whence: libc::c_int, name: &str) -> Result<Option<u64>> {
        let off = libc::off_t::try_from(offset)
            .map_err(|_| SyncError::Layout(format!("offset {} exceeds off_t", offset)))?;

        // SAFETY: the descriptor is owned by `file`, which outlives the call
        let pos = unsafe { libc::lseek(file.as_raw_fd(), off, whence) };
        if pos < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Ok(None);
            }
            return Err(SyncError::Layout(format!(
                "lseek({}) at {} failed: {}",
                name, offset, err
            )));
        }
        Ok(Some(pos as u64))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
mod seek {
    use super::*;

    pub fn data(_file: &File, _offset: u64) -> Result<Option<u64>> {
        Err(SyncError::Layout(
            "hole detection is not supported on this platform".to_string(),
        ))
    }

    pub fn hole(_file: &File, _offset: u64) -> Result<Option<u64>> {
        data(_file, _offset)
    }
}
