//! Positioned file I/O.
//!
//! Nothing here touches the file cursor, so one handle can be shared by
//! concurrent readers or writers.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::{Result, SyncError};
use crate::sparse::interval::Interval;

/// Chunk size used when zero-filling a range that cannot be punched
const ZERO_FILL_CHUNK: usize = 1024 * 1024;

pub fn read_range(file: &File, interval: Interval) -> Result<Vec<u8>> {
    let len = usize::try_from(interval.len())
        .map_err(|_| SyncError::protocol(format!("range {} too large to buffer", interval)))?;
    let mut buf = vec![0u8; len];
    // Not SyncError::io: a short local read is not a closed connection
    file.read_exact_at(&mut buf, interval.begin)
        .map_err(|source| SyncError::Io {
            context: format!("Failed to read {}", interval),
            source,
        })?;
    Ok(buf)
}

pub fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    file.write_all_at(data, offset).map_err(|e| {
        SyncError::io(
            format!("Failed to write {} bytes at offset {}", data.len(), offset),
            e,
        )
    })
}

/// How a punch request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punched {
    /// Blocks were deallocated; the range is now a hole
    Deallocated,
    /// The filesystem cannot punch holes; the range was overwritten with zeros
    ZeroFilled,
}

/// Deallocate `interval`, keeping the file size unchanged.
pub fn punch_hole(file: &File, interval: Interval) -> Result<Punched> {
    if interval.is_empty() {
        return Ok(Punched::Deallocated);
    }
    match fallocate_punch(file, interval) {
        Ok(()) => Ok(Punched::Deallocated),
        Err(e) if is_unsupported(&e) => {
            tracing::warn!(
                "Hole punching unsupported ({}), zero-filling {}",
                e,
                interval
            );
            zero_fill(file, interval)?;
            Ok(Punched::ZeroFilled)
        }
        Err(e) => Err(SyncError::io(format!("Failed to punch hole {}", interval), e)),
    }
}

fn zero_fill(file: &File, interval: Interval) -> Result<()> {
    let zeros = vec![0u8; ZERO_FILL_CHUNK];
    for chunk in interval.split_aligned(ZERO_FILL_CHUNK as u64) {
        write_at(file, chunk.begin, &zeros[..chunk.len() as usize])?;
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fallocate_punch(file: &File, interval: Interval) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let too_large = || std::io::Error::new(std::io::ErrorKind::InvalidInput, "range exceeds off_t");
    let offset = libc::off_t::try_from(interval.begin).map_err(|_| too_large())?;
    let len = libc::off_t::try_from(interval.len()).map_err(|_| too_large())?;

    // SAFETY: the descriptor is owned by `file`, which outlives the call
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn fallocate_punch(_file: &File, _interval: Interval) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

fn is_unsupported(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::Unsupported
        || e.raw_os_error() == Some(libc::EOPNOTSUPP)
        || e.raw_os_error() == Some(libc::ENOSYS)
}
