//! Sparse file model and layout detection.
//!
//! A file's byte range decomposes into an ordered sequence of Data and Hole
//! extents. The scanner asks the filesystem where the holes are; nothing is
//! inferred from content, so a block of zeros that was written is Data.

pub mod digest;
pub mod interval;
pub mod io;
pub mod layout;

pub use digest::{hash_bytes, hash_range, layout_digest, Digest};
pub use interval::{coalesce, tiles, Extent, Interval, Kind, Layout, BLOCK_SIZE};
pub use io::{punch_hole, read_range, write_at, Punched};
pub use layout::{layout_stream, retrieve_layout, stream_layout};
