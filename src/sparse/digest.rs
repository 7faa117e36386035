//! Content digests for batch comparison and post-transfer verification.

use std::fmt;
use std::fs::File;

use crate::error::Result;
use crate::sparse::interval::{coalesce, Extent, Interval};
use crate::sparse::io::read_range;

/// Read granularity when hashing large ranges
const HASH_CHUNK_SIZE: u64 = 1024 * 1024;

/// BLAKE3 digest of a byte range or a whole layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; Digest::LEN]);

impl Digest {
    pub const LEN: usize = 32;

    pub fn as_bytes(&self) -> &[u8; Digest::LEN] {
        &self.0
    }
}

impl From<blake3::Hash> for Digest {
    fn from(h: blake3::Hash) -> Self {
        Self(*h.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &hex::encode(self.0)[..16])
    }
}

pub fn hash_bytes(data: &[u8]) -> Digest {
    blake3::hash(data).into()
}

/// Hash the bytes of `interval` with positioned reads.
pub fn hash_range(file: &File, interval: Interval) -> Result<Digest> {
    let mut hasher = blake3::Hasher::new();
    for chunk in interval.split_aligned(HASH_CHUNK_SIZE) {
        hasher.update(&read_range(file, chunk)?);
    }
    Ok(hasher.finalize().into())
}

/// Digest of a file's size, hole structure and data content.
///
/// Adjacent extents are coalesced first, so two files with the same bytes
/// and the same holes hash identically however their extents are split.
pub fn layout_digest(file: &File, layout: &[Extent], size: u64) -> Result<Digest> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&size.to_be_bytes());
    for extent in coalesce(layout).iter().filter(|e| e.is_data()) {
        hasher.update(&extent.begin().to_be_bytes());
        hasher.update(&extent.end().to_be_bytes());
        for chunk in extent.interval.split_aligned(HASH_CHUNK_SIZE) {
            hasher.update(&read_range(file, chunk)?);
        }
    }
    Ok(hasher.finalize().into())
}
