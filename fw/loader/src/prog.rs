// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The program descriptor.

use region::AddressSpace;
use region::MemRegionDevice;
use region::MemWindow;
use region::RegionDevice;
use std::fmt;

/// The kind of program a [`Prog`] describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)] // self-explanatory variants
pub enum ProgType {
    Unknown,
    Bootblock,
    Verstage,
    Romstage,
    Ramstage,
    Refcode,
    Payload,
    Bl31,
    Bl32,
    Postcar,
    Opensbi,
}

impl fmt::Display for ProgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgType::Unknown => "unknown",
            ProgType::Bootblock => "bootblock",
            ProgType::Verstage => "verstage",
            ProgType::Romstage => "romstage",
            ProgType::Ramstage => "ramstage",
            ProgType::Refcode => "refcode",
            ProgType::Payload => "payload",
            ProgType::Bl31 => "BL31",
            ProgType::Bl32 => "BL32",
            ProgType::Postcar => "postcar",
            ProgType::Opensbi => "OpenSBI",
        };
        f.pad(s)
    }
}

/// The container type of a file in the image store.
///
/// Unknown values are preserved as-is.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct CbfsType(pub u32);

#[allow(missing_docs)] // self-explanatory constants
impl CbfsType {
    pub const DELETED: Self = Self(0x0000_0000);
    pub const NULL: Self = Self(0xffff_ffff);
    pub const BOOTBLOCK: Self = Self(0x01);
    pub const CBFSHEADER: Self = Self(0x02);
    pub const LEGACY_STAGE: Self = Self(0x10);
    pub const STAGE: Self = Self(0x11);
    pub const SELF: Self = Self(0x20);
    pub const FIT_PAYLOAD: Self = Self(0x21);
    pub const OPTIONROM: Self = Self(0x30);
    pub const BOOTSPLASH: Self = Self(0x40);
    pub const RAW: Self = Self(0x50);
    pub const VSA: Self = Self(0x51);
    pub const MBI: Self = Self(0x52);
    pub const MICROCODE: Self = Self(0x53);
    pub const FSP: Self = Self(0x60);
    pub const MRC: Self = Self(0x61);
    pub const EFI: Self = Self(0x63);
    pub const STRUCT: Self = Self(0x70);
    pub const CMOS_DEFAULT: Self = Self(0xaa);
    pub const SPD: Self = Self(0xab);
    pub const MRC_CACHE: Self = Self(0xac);
    pub const CMOS_LAYOUT: Self = Self(0x01aa);
}

impl CbfsType {
    fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::DELETED => "deleted",
            Self::NULL => "null",
            Self::BOOTBLOCK => "bootblock",
            Self::CBFSHEADER => "cbfs header",
            Self::LEGACY_STAGE => "legacy stage",
            Self::STAGE => "stage",
            Self::SELF => "simple elf",
            Self::FIT_PAYLOAD => "fit",
            Self::OPTIONROM => "optionrom",
            Self::BOOTSPLASH => "bootsplash",
            Self::RAW => "raw",
            Self::VSA => "vsa",
            Self::MBI => "mbi",
            Self::MICROCODE => "microcode",
            Self::FSP => "fsp",
            Self::MRC => "mrc",
            Self::EFI => "efi",
            Self::STRUCT => "struct",
            Self::CMOS_DEFAULT => "cmos_default",
            Self::SPD => "spd",
            Self::MRC_CACHE => "mrc_cache",
            Self::CMOS_LAYOUT => "cmos_layout",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for CbfsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

impl fmt::Display for CbfsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The bytes backing a program.
#[derive(Debug, Clone, Default)]
pub enum ProgArea {
    /// Nothing has been bound yet.
    #[default]
    Unbound,
    /// The program as stored, bound by a locator backend.
    Source(MemRegionDevice),
    /// The program in memory, bound by a loader.
    Loaded(MemWindow),
}

/// A description of one loadable program: a stage or a payload.
///
/// A program is created with only its type and name. A locator then binds
/// the stored image ([`ProgArea::Source`]), and a loader replaces that with
/// the memory the program occupies once loaded ([`ProgArea::Loaded`]) and
/// records the entry point.
#[derive(Debug)]
pub struct Prog {
    ty: ProgType,
    cbfs_type: CbfsType,
    name: String,
    area: ProgArea,
    entry: Option<u64>,
    arg: u64,
}

impl Prog {
    /// Creates an unlocated program.
    pub fn new(ty: ProgType, name: impl Into<String>) -> Self {
        Self {
            ty,
            cbfs_type: CbfsType::default(),
            name: name.into(),
            area: ProgArea::Unbound,
            entry: None,
            arg: 0,
        }
    }

    /// The name the program is looked up by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The program type.
    pub fn ty(&self) -> ProgType {
        self.ty
    }

    /// The container type recorded when the program was located.
    pub fn cbfs_type(&self) -> CbfsType {
        self.cbfs_type
    }

    /// The currently bound bytes.
    pub fn area(&self) -> &ProgArea {
        &self.area
    }

    /// Length of the bound area. Only meaningful for loaded programs.
    pub fn size(&self) -> u64 {
        match &self.area {
            ProgArea::Unbound => 0,
            ProgArea::Source(rdev) => rdev.size(),
            ProgArea::Loaded(window) => window.size(),
        }
    }

    /// The stored image, if the program has been located but not loaded.
    pub fn source(&self) -> Option<&MemRegionDevice> {
        match &self.area {
            ProgArea::Source(rdev) => Some(rdev),
            _ => None,
        }
    }

    /// The memory occupied by the program, if it has been loaded.
    pub fn loaded(&self) -> Option<&MemWindow> {
        match &self.area {
            ProgArea::Loaded(window) => Some(window),
            _ => None,
        }
    }

    /// Physical address of the loaded program.
    pub fn start(&self) -> Option<u64> {
        self.loaded().map(MemWindow::base)
    }

    /// The entry point, set by the loader.
    pub fn entry(&self) -> Option<u64> {
        self.entry
    }

    /// The value handed to the entry point.
    pub fn entry_arg(&self) -> u64 {
        self.arg
    }

    /// Returns true if the program is in memory and has an entry point.
    pub fn is_loaded(&self) -> bool {
        matches!(self.area, ProgArea::Loaded(_)) && self.entry.is_some()
    }

    /// Binds the stored image of the program.
    pub fn set_source(&mut self, rdev: MemRegionDevice, cbfs_type: CbfsType) {
        self.area = ProgArea::Source(rdev);
        self.cbfs_type = cbfs_type;
    }

    /// Binds the program to `size` bytes of `space` at `base`.
    ///
    /// The window must lie within `space`; see [`AddressSpace::window`].
    pub fn memory_init(&mut self, space: &AddressSpace, base: u64, size: u64) {
        self.area = ProgArea::Loaded(space.window(base, size));
    }

    /// Records the entry point and the value passed to it.
    pub fn set_entry(&mut self, entry: u64, arg: u64) {
        self.entry = Some(entry);
        self.arg = arg;
    }

    /// Replaces the value passed to the entry point.
    pub fn set_arg(&mut self, arg: u64) {
        self.arg = arg;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use region::MemoryRange;
    use region::SparseRam;
    use std::sync::Arc;
    use test_with_tracing::test;

    #[test]
    fn lifecycle() {
        let mut prog = Prog::new(ProgType::Payload, "fallback/payload");
        assert_eq!(prog.name(), "fallback/payload");
        assert_eq!(prog.ty(), ProgType::Payload);
        assert_eq!(prog.size(), 0);
        assert!(!prog.is_loaded());

        prog.set_source(MemRegionDevice::new(vec![0u8; 0x30]), CbfsType::SELF);
        assert_eq!(prog.cbfs_type(), CbfsType::SELF);
        assert_eq!(prog.size(), 0x30);
        assert!(prog.source().is_some());
        // An entry point alone does not make a located program runnable.
        prog.set_entry(0x1000, 0);
        assert!(!prog.is_loaded());

        let space = AddressSpace::flat_32bit(Arc::new(SparseRam::new([MemoryRange::new(
            0x1000..0x2000,
        )])));
        prog.memory_init(&space, 0x1000, 0x800);
        assert!(prog.is_loaded());
        assert_eq!(prog.start(), Some(0x1000));
        assert_eq!(prog.size(), 0x800);
        assert!(prog.source().is_none());

        prog.set_arg(0xdead_0000);
        assert_eq!(prog.entry(), Some(0x1000));
        assert_eq!(prog.entry_arg(), 0xdead_0000);
    }

    #[test]
    fn cbfs_type_formatting() {
        assert_eq!(CbfsType::SELF.to_string(), "simple elf");
        assert_eq!(format!("{:?}", CbfsType(0x1234)), "0x1234");
        assert_eq!(ProgType::Ramstage.to_string(), "ramstage");
    }
}
