// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::ops::Range;

/// A half-open range of physical addresses.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MemoryRange {
    start: u64,
    end: u64,
}

impl MemoryRange {
    /// The empty range at address zero.
    pub const EMPTY: Self = Self { start: 0, end: 0 };

    /// Returns a new range.
    ///
    /// # Panics
    ///
    /// Panics if `range.start > range.end`.
    pub const fn new(range: Range<u64>) -> Self {
        assert!(range.start <= range.end);
        Self {
            start: range.start,
            end: range.end,
        }
    }

    /// Returns the range `base..base + len`, or `None` if it would wrap the
    /// 64-bit address space.
    pub const fn from_base_len(base: u64, len: u64) -> Option<Self> {
        match base.checked_add(len) {
            Some(end) => Some(Self { start: base, end }),
            None => None,
        }
    }

    /// The first address of the range.
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// One past the last address of the range.
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// The number of bytes covered.
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true if the range covers no bytes.
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns true if `addr` is inside the range.
    pub const fn contains_addr(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Returns true if `other` lies entirely within this range.
    pub const fn contains(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns true if the two ranges share at least one byte.
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns the overlapping part of the two ranges, if any.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        self.overlaps(other).then(|| Self {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

impl fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
