//! Byte ranges and their Data/Hole classification.

use std::fmt;

/// Filesystem block size that extents align to (except at end of file)
pub const BLOCK_SIZE: u64 = 4096;

/// Half-open byte range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Interval {
    pub begin: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end, "interval begin {} > end {}", begin, end);
        Self { begin, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.begin && offset < self.end
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Intersection of two ranges, `None` when they do not overlap.
    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        (begin < end).then(|| Interval::new(begin, end))
    }

    /// Split into pieces whose boundaries fall on absolute multiples of `step`.
    ///
    /// Both ends of a sync session split on the same grid, so a batch on the
    /// source and a chunk on the destination cover identical ranges whenever
    /// the underlying extents agree.
    pub fn split_aligned(&self, step: u64) -> SplitAligned {
        assert!(step > 0, "split step must be non-zero");
        SplitAligned {
            next: self.begin,
            end: self.end,
            step,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Iterator returned by [`Interval::split_aligned`].
#[derive(Debug, Clone)]
pub struct SplitAligned {
    next: u64,
    end: u64,
    step: u64,
}

impl Iterator for SplitAligned {
    type Item = Interval;

    fn next(&mut self) -> Option<Interval> {
        if self.next >= self.end {
            return None;
        }
        let boundary = (self.next / self.step + 1).saturating_mul(self.step);
        let piece = Interval::new(self.next, boundary.min(self.end));
        self.next = piece.end;
        Some(piece)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Hole = 0,
    Data = 1,
}

impl Kind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Hole),
            1 => Some(Self::Data),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Hole => f.pad("hole"),
            Kind::Data => f.pad("data"),
        }
    }
}

/// A byte range tagged Data or Hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub kind: Kind,
    pub interval: Interval,
}

impl Extent {
    pub fn new(kind: Kind, begin: u64, end: u64) -> Self {
        Self {
            kind,
            interval: Interval::new(begin, end),
        }
    }

    pub fn data(begin: u64, end: u64) -> Self {
        Self::new(Kind::Data, begin, end)
    }

    pub fn hole(begin: u64, end: u64) -> Self {
        Self::new(Kind::Hole, begin, end)
    }

    pub fn is_data(&self) -> bool {
        self.kind == Kind::Data
    }

    pub fn is_hole(&self) -> bool {
        self.kind == Kind::Hole
    }

    pub fn begin(&self) -> u64 {
        self.interval.begin
    }

    pub fn end(&self) -> u64 {
        self.interval.end
    }

    pub fn len(&self) -> u64 {
        self.interval.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interval.is_empty()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.interval)
    }
}

/// Ordered, exhaustive, non-overlapping extent decomposition of a range.
pub type Layout = Vec<Extent>;

/// Merge adjacent extents of the same kind.
pub fn coalesce(layout: &[Extent]) -> Layout {
    let mut merged: Layout = Vec::with_capacity(layout.len());
    for extent in layout.iter().filter(|e| !e.is_empty()) {
        match merged.last_mut() {
            Some(last) if last.kind == extent.kind && last.end() == extent.begin() => {
                last.interval.end = extent.end();
            }
            _ => merged.push(*extent),
        }
    }
    merged
}

/// Check that `layout` tiles `range` exactly once, in order.
pub fn tiles(layout: &[Extent], range: Interval) -> bool {
    let mut cursor = range.begin;
    for extent in layout {
        if extent.begin() != cursor || extent.is_empty() {
            return false;
        }
        cursor = extent.end();
    }
    cursor == range.end
}
