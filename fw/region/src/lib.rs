// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Byte-range devices.
//!
//! Everything the program loader touches is a [`RegionDevice`]: the boot
//! media holding the stored images, windows into that media handed out by the
//! image store, and windows into the addressable memory space that programs
//! are loaded into.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod addrspace;
mod mem;
mod range;

pub use addrspace::AddressSpace;
pub use addrspace::MemWindow;
pub use addrspace::MemoryBacking;
pub use addrspace::SparseRam;
pub use mem::MemRegionDevice;
pub use range::MemoryRange;

use std::borrow::Cow;
use thiserror::Error;

/// Errors returned by region device accesses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// The access does not fit inside the device.
    #[error("access {offset:#x}+{size:#x} exceeds region of {limit:#x} bytes")]
    OutOfBounds {
        /// Offset of the access.
        offset: u64,
        /// Length of the access.
        size: u64,
        /// Size of the device.
        limit: u64,
    },
    /// No memory backs the given address range.
    #[error("address range {0} is not backed by memory")]
    Unbacked(MemoryRange),
    /// The device cannot be written.
    #[error("region is read-only")]
    ReadOnly,
}

/// A readable span of bytes.
pub trait RegionDevice {
    /// Length of the region in bytes.
    fn size(&self) -> u64;

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), RegionError>;

    /// Maps `size` bytes starting at `offset`.
    ///
    /// Devices backed by host memory return a borrowed view; everything else
    /// returns a copy.
    fn map(&self, offset: u64, size: u64) -> Result<Cow<'_, [u8]>, RegionError> {
        check_access(offset, size, self.size())?;
        let mut buf = vec![0; size as usize];
        self.read_at(offset, &mut buf)?;
        Ok(Cow::Owned(buf))
    }

    /// Maps the whole region.
    fn map_full(&self) -> Result<Cow<'_, [u8]>, RegionError> {
        self.map(0, self.size())
    }
}

/// Validates that `offset..offset + size` lies within `0..limit`.
pub fn check_access(offset: u64, size: u64, limit: u64) -> Result<(), RegionError> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(RegionError::OutOfBounds {
            offset,
            size,
            limit,
        }),
    }
}
