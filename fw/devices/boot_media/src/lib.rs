// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Boot media device.
//!
//! Owns the boot ROM and its x86 memory-mapped placement directly below
//! 4GB. Image stores are carved out of it as windows handed to the locator
//! backends.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use region::MemRegionDevice;
use region::MemoryRange;
use region::RegionDevice;
use region::RegionError;
use std::sync::Arc;
use thiserror::Error;

/// Largest ROM that can be decoded below 4GB.
pub const MAX_ROM_SIZE: u64 = 16 * 1024 * 1024;

const FOUR_GB: u64 = 0x1_0000_0000;

/// Boot media dependencies.
pub struct BootMediaDeps {
    /// The ROM contents.
    pub rom: Arc<[u8]>,
}

/// The boot ROM.
#[derive(Debug, Clone)]
pub struct BootMedia {
    rom: MemRegionDevice,
}

/// Errors which may occur during boot media initialization.
#[derive(Debug, Error)]
#[allow(missing_docs)] // self-explanatory variants
pub enum BootMediaInitError {
    #[error("invalid ROM size {0:#x} bytes, expected a power of two up to 16MB")]
    InvalidRomSize(u64),
}

impl BootMedia {
    /// Create the boot media over `deps.rom`.
    pub fn new(deps: BootMediaDeps) -> Result<BootMedia, BootMediaInitError> {
        let BootMediaDeps { rom } = deps;

        let rom_size = rom.len() as u64;
        if !rom_size.is_power_of_two() || rom_size > MAX_ROM_SIZE {
            return Err(BootMediaInitError::InvalidRomSize(rom_size));
        }

        let media = BootMedia {
            rom: MemRegionDevice::new(rom),
        };
        tracing::debug!(mmap = %media.mmap_range(), "boot media");
        Ok(media)
    }

    /// The whole ROM.
    pub fn region(&self) -> &MemRegionDevice {
        &self.rom
    }

    /// Physical address the ROM is decoded at.
    pub fn mmap_base(&self) -> u64 {
        FOUR_GB - self.rom.size()
    }

    /// Physical address range the ROM is decoded at.
    pub fn mmap_range(&self) -> MemoryRange {
        MemoryRange::new(self.mmap_base()..FOUR_GB)
    }

    /// Returns `size` bytes of the ROM at `offset`.
    pub fn window(&self, offset: u64, size: u64) -> Result<MemRegionDevice, RegionError> {
        self.rom.chain(offset, size)
    }

    /// Returns the part of the ROM decoded at physical address `addr`.
    pub fn window_at(&self, addr: u64, size: u64) -> Result<MemRegionDevice, RegionError> {
        let offset = addr.checked_sub(self.mmap_base()).ok_or(RegionError::OutOfBounds {
            offset: addr,
            size,
            limit: self.rom.size(),
        })?;
        self.window(offset, size)
    }
}
