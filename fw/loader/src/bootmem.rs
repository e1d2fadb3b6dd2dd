// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Classification of the physical address space, used to decide where a
//! program is allowed to be loaded.

use region::MemoryRange;

/// The kind of memory a range holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BootMemType {
    /// Usable RAM.
    Ram,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI reclaimable tables.
    Acpi,
    /// ACPI non-volatile storage.
    Nvs,
    /// Unusable memory.
    Unusable,
    /// Reserved by the silicon vendor.
    VendorReserved,
    /// OpenSBI firmware.
    Opensbi,
    /// ARM trusted firmware BL31.
    Bl31,
    /// Firmware tables handed to the payload.
    Table,
    /// The running ramstage.
    Ramstage,
    /// The payload.
    Payload,
}

/// An ordered map from physical ranges to their [`BootMemType`].
///
/// Ranges never overlap, and touching ranges of the same type are merged.
#[derive(Debug, Clone, Default)]
pub struct BootMem {
    entries: Vec<(MemoryRange, BootMemType)>,
}

impl BootMem {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `range` as `ty`, replacing any previous classification of
    /// the bytes it covers.
    pub fn add_range(&mut self, range: MemoryRange, ty: BootMemType) {
        if range.is_empty() {
            return;
        }

        let mut entries = Vec::with_capacity(self.entries.len() + 2);
        for &(existing, existing_ty) in &self.entries {
            if !existing.overlaps(&range) {
                entries.push((existing, existing_ty));
                continue;
            }
            if existing.start() < range.start() {
                entries.push((MemoryRange::new(existing.start()..range.start()), existing_ty));
            }
            if range.end() < existing.end() {
                entries.push((MemoryRange::new(range.end()..existing.end()), existing_ty));
            }
        }
        entries.push((range, ty));
        entries.sort_by_key(|(r, _)| r.start());

        self.entries.clear();
        for (r, t) in entries {
            match self.entries.last_mut() {
                Some((last, last_ty)) if *last_ty == t && last.end() == r.start() => {
                    *last = MemoryRange::new(last.start()..r.end());
                }
                _ => self.entries.push((r, t)),
            }
        }
    }

    /// The classified ranges, in ascending address order.
    pub fn entries(&self) -> impl Iterator<Item = (MemoryRange, BootMemType)> + '_ {
        self.entries.iter().copied()
    }

    /// Returns true if `range` lies entirely inside one range of type `ty`.
    pub fn targets_type(&self, range: MemoryRange, ty: BootMemType) -> bool {
        self.entries
            .iter()
            .any(|&(r, t)| t == ty && r.contains(&range))
    }
}

#[cfg(test)]
mod tests {
    use super::BootMem;
    use super::BootMemType;
    use region::MemoryRange;
    use test_with_tracing::test;

    #[test]
    fn later_ranges_override() {
        let mut bootmem = BootMem::new();
        bootmem.add_range(MemoryRange::new(0..0x10_0000), BootMemType::Ram);
        bootmem.add_range(MemoryRange::new(0xa0000..0xc0000), BootMemType::Reserved);

        let entries: Vec<_> = bootmem.entries().collect();
        assert_eq!(
            entries,
            [
                (MemoryRange::new(0..0xa0000), BootMemType::Ram),
                (MemoryRange::new(0xa0000..0xc0000), BootMemType::Reserved),
                (MemoryRange::new(0xc0000..0x10_0000), BootMemType::Ram),
            ]
        );

        assert!(bootmem.targets_type(MemoryRange::new(0x1000..0x2000), BootMemType::Ram));
        assert!(!bootmem.targets_type(MemoryRange::new(0x9f000..0xa1000), BootMemType::Ram));
        assert!(bootmem.targets_type(
            MemoryRange::new(0xa0000..0xc0000),
            BootMemType::Reserved
        ));
    }

    #[test]
    fn adjacent_ranges_merge() {
        let mut bootmem = BootMem::new();
        bootmem.add_range(MemoryRange::new(0x1000..0x2000), BootMemType::Ram);
        bootmem.add_range(MemoryRange::new(0x2000..0x3000), BootMemType::Ram);
        bootmem.add_range(MemoryRange::new(0x3000..0x3000), BootMemType::Reserved);

        assert_eq!(bootmem.entries().count(), 1);
        assert!(bootmem.targets_type(MemoryRange::new(0x1800..0x2800), BootMemType::Ram));
    }

    #[test]
    fn punching_a_hole_and_refilling() {
        let mut bootmem = BootMem::new();
        bootmem.add_range(MemoryRange::new(0x0..0x4000), BootMemType::Ram);
        bootmem.add_range(MemoryRange::new(0x1000..0x2000), BootMemType::Table);
        bootmem.add_range(MemoryRange::new(0x1000..0x2000), BootMemType::Ram);

        let entries: Vec<_> = bootmem.entries().collect();
        assert_eq!(entries, [(MemoryRange::new(0..0x4000), BootMemType::Ram)]);
    }
}
