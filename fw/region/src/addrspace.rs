// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The addressable memory space that programs are loaded into.

use crate::check_access;
use crate::MemoryRange;
use crate::RegionDevice;
use crate::RegionError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Storage behind an [`AddressSpace`].
///
/// Writes must be visible to subsequent reads immediately.
pub trait MemoryBacking: Send + Sync {
    /// Reads `buf.len()` bytes at physical address `addr`.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), RegionError>;
    /// Writes `data` at physical address `addr`.
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), RegionError>;
    /// Sets `len` bytes at physical address `addr` to `val`.
    fn fill(&self, addr: u64, val: u8, len: u64) -> Result<(), RegionError>;
}

/// A handle to the physical address space.
///
/// Cloning the handle is cheap; all clones observe the same memory.
#[derive(Clone)]
pub struct AddressSpace {
    backing: Arc<dyn MemoryBacking>,
    limit: u64,
}

impl AddressSpace {
    /// Size of the 32-bit flat address space.
    pub const LIMIT_32BIT: u64 = 1 << 32;

    /// Creates an address space of `limit` bytes over `backing`.
    pub fn new(backing: Arc<dyn MemoryBacking>, limit: u64) -> Self {
        Self { backing, limit }
    }

    /// Creates the 32-bit flat address space over `backing`.
    pub fn flat_32bit(backing: Arc<dyn MemoryBacking>) -> Self {
        Self::new(backing, Self::LIMIT_32BIT)
    }

    /// The size of the addressable space.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Reads physical memory.
    pub fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), RegionError> {
        check_access(addr, buf.len() as u64, self.limit)?;
        self.backing.read(addr, buf)
    }

    /// Writes physical memory.
    pub fn write_at(&self, addr: u64, data: &[u8]) -> Result<(), RegionError> {
        check_access(addr, data.len() as u64, self.limit)?;
        self.backing.write(addr, data)
    }

    /// Fills physical memory with `val`.
    pub fn fill_at(&self, addr: u64, val: u8, len: u64) -> Result<(), RegionError> {
        check_access(addr, len, self.limit)?;
        self.backing.fill(addr, val, len)
    }

    /// Returns a window of `size` bytes starting at physical address `base`.
    ///
    /// The window must lie within the addressable space. This is the caller's
    /// responsibility and is only checked in debug builds.
    pub fn window(&self, base: u64, size: u64) -> MemWindow {
        debug_assert!(
            check_access(base, size, self.limit).is_ok(),
            "window {base:#x}+{size:#x} outside of address space"
        );
        MemWindow {
            space: self.clone(),
            range: MemoryRange::new(base..base.saturating_add(size)),
        }
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("limit", &format_args!("{:#x}", self.limit))
            .finish()
    }
}

/// A read-write window into an [`AddressSpace`].
#[derive(Clone)]
pub struct MemWindow {
    space: AddressSpace,
    range: MemoryRange,
}

impl MemWindow {
    /// The physical address range covered by the window.
    pub fn range(&self) -> MemoryRange {
        self.range
    }

    /// The physical address of the first byte of the window.
    pub fn base(&self) -> u64 {
        self.range.start()
    }

    /// Writes `data` at `offset` within the window.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), RegionError> {
        check_access(offset, data.len() as u64, self.range.len())?;
        self.space.write_at(self.range.start() + offset, data)
    }

    /// Fills `len` bytes at `offset` within the window with `val`.
    pub fn fill_at(&self, offset: u64, val: u8, len: u64) -> Result<(), RegionError> {
        check_access(offset, len, self.range.len())?;
        self.space.fill_at(self.range.start() + offset, val, len)
    }
}

impl RegionDevice for MemWindow {
    fn size(&self) -> u64 {
        self.range.len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), RegionError> {
        check_access(offset, buf.len() as u64, self.range.len())?;
        self.space.read_at(self.range.start() + offset, buf)
    }
}

impl fmt::Debug for MemWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MemWindow").field(&self.range).finish()
    }
}

/// Host-allocated RAM covering a set of disjoint physical ranges.
///
/// An access must fall entirely inside one of the ranges.
pub struct SparseRam {
    chunks: Vec<RamChunk>,
}

struct RamChunk {
    range: MemoryRange,
    data: Mutex<Vec<u8>>,
}

impl SparseRam {
    /// Allocates zeroed RAM for each of `ranges`.
    ///
    /// # Panics
    ///
    /// Panics if any two ranges overlap.
    pub fn new(ranges: impl IntoIterator<Item = MemoryRange>) -> Self {
        let mut ranges: Vec<_> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(
                !pair[0].overlaps(&pair[1]),
                "ram ranges {} and {} overlap",
                pair[0],
                pair[1]
            );
        }

        let chunks = ranges
            .into_iter()
            .map(|range| RamChunk {
                range,
                data: Mutex::new(vec![0; range.len() as usize]),
            })
            .collect();

        Self { chunks }
    }

    /// The ranges backed by this RAM, in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = MemoryRange> + '_ {
        self.chunks.iter().map(|c| c.range)
    }

    fn with_chunk<R>(
        &self,
        addr: u64,
        len: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, RegionError> {
        let access = MemoryRange::from_base_len(addr, len).ok_or(RegionError::OutOfBounds {
            offset: addr,
            size: len,
            limit: u64::MAX,
        })?;

        let Some(chunk) = self.chunks.iter().find(|c| c.range.contains(&access)) else {
            tracing::warn!(%access, "access to unbacked memory");
            return Err(RegionError::Unbacked(access));
        };

        let start = (addr - chunk.range.start()) as usize;
        let mut data = chunk.data.lock();
        Ok(f(&mut data[start..start + len as usize]))
    }
}

impl MemoryBacking for SparseRam {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), RegionError> {
        self.with_chunk(addr, buf.len() as u64, |mem| buf.copy_from_slice(mem))
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), RegionError> {
        self.with_chunk(addr, data.len() as u64, |mem| mem.copy_from_slice(data))
    }

    fn fill(&self, addr: u64, val: u8, len: u64) -> Result<(), RegionError> {
        self.with_chunk(addr, len, |mem| mem.fill(val))
    }
}
