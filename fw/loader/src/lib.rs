// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Locating, loading, and running firmware stages and payloads.
//!
//! A boot is a chain of programs (bootblock, romstage, ramstage, payload),
//! each of which finds the next one in the image store, places it in memory,
//! and hands control to it:
//!
//! 1. A [`Prog`] is created with a type and a name.
//! 2. [`locate::Locator::locate`] binds the stored image.
//! 3. [`selfload`] or [`stage`] places the program in memory through a
//!    [`Loader`], reporting each segment to a [`notify::SegmentNotifier`].
//! 4. [`run::StageRunner::run`] transfers control to the entry point.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bootmem;
pub mod locate;
pub mod notify;
pub mod prog;
pub mod run;
pub mod selfload;
pub mod stage;
pub mod x86;

pub use prog::CbfsType;
pub use prog::Prog;
pub use prog::ProgType;

use bootmem::BootMem;
use bootmem::BootMemType;
use notify::SegmentFlags;
use notify::SegmentNotifier;
use region::AddressSpace;
use region::MemoryRange;
use region::RegionError;

/// Architecture policy allowing loads outside of classified RAM.
pub trait UsableRamQuirk {
    /// Returns true if a payload may target `range` even though the boot
    /// memory map does not classify it as usable.
    fn usable_ram_quirk(&self, range: MemoryRange) -> bool;
}

/// Allows nothing beyond the boot memory map.
#[derive(Debug, Default)]
pub struct NoQuirk;

impl UsableRamQuirk for NoQuirk {
    fn usable_ram_quirk(&self, _range: MemoryRange) -> bool {
        false
    }
}

/// Shared state for placing programs into memory.
///
/// Only one program is loaded at a time; the loader is borrowed mutably for
/// the duration of a load.
pub struct Loader {
    space: AddressSpace,
    bootmem: BootMem,
    notifier: SegmentNotifier,
    quirk: Box<dyn UsableRamQuirk>,
}

impl Loader {
    /// Creates a loader writing into `space`, classified by `bootmem`.
    pub fn new(space: AddressSpace, bootmem: BootMem) -> Self {
        Self {
            space,
            bootmem,
            notifier: SegmentNotifier::new(),
            quirk: Box::new(NoQuirk),
        }
    }

    /// Replaces the segment notifier.
    pub fn with_notifier(mut self, notifier: SegmentNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replaces the architecture load quirk.
    pub fn with_ram_quirk(mut self, quirk: impl UsableRamQuirk + 'static) -> Self {
        self.quirk = Box::new(quirk);
        self
    }

    /// The address space programs are loaded into.
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// The boot memory map.
    pub fn bootmem(&self) -> &BootMem {
        &self.bootmem
    }

    /// The boot memory map, for updates between loads.
    pub fn bootmem_mut(&mut self) -> &mut BootMem {
        &mut self.bootmem
    }

    /// The segment notifier.
    pub fn notifier_mut(&mut self) -> &mut SegmentNotifier {
        &mut self.notifier
    }

    /// Returns true if a segment may occupy `range` when loading into memory
    /// of type `dest_type`.
    fn targets(&self, range: MemoryRange, dest_type: BootMemType) -> bool {
        self.bootmem.targets_type(range, dest_type) || self.quirk.usable_ram_quirk(range)
    }

    /// Copies `data` to the start of `dest`, zero-fills the remainder, then
    /// notifies the hook chain.
    fn place_segment(
        &mut self,
        dest: MemoryRange,
        data: &[u8],
        flags: SegmentFlags,
    ) -> Result<(), RegionError> {
        debug_assert!(data.len() as u64 <= dest.len());
        // An empty segment touches no memory, but is still reported.
        if !dest.is_empty() {
            self.space.write_at(dest.start(), data)?;
            let filled = data.len() as u64;
            if filled < dest.len() {
                self.space.fill_at(dest.start() + filled, 0, dest.len() - filled)?;
            }
        }
        self.notifier.notify(dest, flags);
        Ok(())
    }
}
