// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::check_access;
use crate::RegionDevice;
use crate::RegionError;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// A read-only region device over bytes held in host memory.
///
/// Clones share the underlying bytes. Sub-windows created with
/// [`MemRegionDevice::chain`] remember their offset from the root device, so
/// that log messages can report where in the boot media a file lives.
#[derive(Clone)]
pub struct MemRegionDevice {
    data: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl MemRegionDevice {
    /// Creates a device spanning all of `data`.
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        let len = data.len();
        Self {
            data,
            offset: 0,
            len,
        }
    }

    /// Returns a sub-window of `size` bytes at `offset` within this device.
    pub fn chain(&self, offset: u64, size: u64) -> Result<Self, RegionError> {
        check_access(offset, size, self.len as u64)?;
        Ok(Self {
            data: self.data.clone(),
            offset: self.offset + offset as usize,
            len: size as usize,
        })
    }

    /// Offset of this window from the start of the root device.
    pub fn root_offset(&self) -> u64 {
        self.offset as u64
    }

    /// The bytes covered by this window.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }
}

impl RegionDevice for MemRegionDevice {
    fn size(&self) -> u64 {
        self.len as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), RegionError> {
        let bytes = self.map(offset, buf.len() as u64)?;
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    fn map(&self, offset: u64, size: u64) -> Result<Cow<'_, [u8]>, RegionError> {
        check_access(offset, size, self.len as u64)?;
        let start = offset as usize;
        Ok(Cow::Borrowed(&self.as_bytes()[start..start + size as usize]))
    }
}

impl fmt::Debug for MemRegionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRegionDevice")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::MemRegionDevice;
    use crate::RegionDevice;
    use crate::RegionError;
    use test_with_tracing::test;

    #[test]
    fn chain_tracks_root_offset() {
        let rdev = MemRegionDevice::new((0..=255u8).collect::<Vec<_>>());
        let child = rdev.chain(0x10, 0x20).unwrap();
        let grandchild = child.chain(0x8, 0x4).unwrap();
        assert_eq!(grandchild.root_offset(), 0x18);
        assert_eq!(grandchild.as_bytes(), &[0x18, 0x19, 0x1a, 0x1b]);

        let mut buf = [0; 2];
        child.read_at(0x1e, &mut buf).unwrap();
        assert_eq!(buf, [0x2e, 0x2f]);
    }

    #[test]
    fn chain_outside_parent_fails() {
        let rdev = MemRegionDevice::new(vec![0u8; 0x40]);
        assert_eq!(
            rdev.chain(0x30, 0x20).unwrap_err(),
            RegionError::OutOfBounds {
                offset: 0x30,
                size: 0x20,
                limit: 0x40
            }
        );
        assert!(rdev.map(u64::MAX, 2).is_err());
    }
}
