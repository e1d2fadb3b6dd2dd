// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Exports [`Cbfs`]: a reader for the coreboot filesystem, the image store
//! that holds stages and payloads in the boot media.
//!
//! A store is a sequence of 64-byte aligned files, each a `LARCHIVE` header,
//! a NUL-terminated name, and the file data. Space between files is padding.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod spec;

pub use backend::CbfsBackend;

use loader::CbfsType;
use region::MemRegionDevice;
use region::RegionError;
use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

/// Longest file name accepted by [`CbfsBuilder`].
pub const MAX_NAME_LEN: usize = 255;

const HEADER_SIZE: u64 = size_of::<spec::FileHeader>() as u64;

/// Errors which may occur while reading or building a store.
#[derive(Debug, Error)]
#[allow(missing_docs)] // self-explanatory variants
pub enum Error {
    #[error("file '{0}' not found")]
    NotFound(String),
    #[error("file '{name}' has type {found}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: CbfsType,
        found: CbfsType,
    },
    #[error("malformed file header at offset {0:#x}")]
    BadHeader(u64),
    #[error("file data out of bounds")]
    DataOutOfBounds(#[source] RegionError),
    #[error("filename '{0}' is not ascii")]
    FilenameNotAscii(String),
    #[error("filename '{0}' is too long (max {MAX_NAME_LEN} ascii chars)")]
    FilenameTooLong(String),
    #[error("file with filename '{0}' is too large (len cannot exceed u32::MAX)")]
    FileTooBig(String),
    #[error("store of {len:#x} bytes does not fit in {size:#x}")]
    ImageTooLarge { len: usize, size: usize },
}

/// One file in the store.
#[derive(Debug, Clone)]
pub struct CbfsFile {
    name: String,
    ty: CbfsType,
    header_offset: u64,
    data: MemRegionDevice,
}

impl CbfsFile {
    /// The file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The file type.
    pub fn ty(&self) -> CbfsType {
        self.ty
    }

    /// Offset of the file header within the store.
    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }

    /// The file data.
    pub fn data(&self) -> &MemRegionDevice {
        &self.data
    }

    /// Consumes the file, returning its data.
    pub fn into_data(self) -> MemRegionDevice {
        self.data
    }
}

/// A read-only store.
#[derive(Debug, Clone)]
pub struct Cbfs {
    rdev: MemRegionDevice,
}

impl Cbfs {
    /// Opens the store held in `rdev`.
    pub fn new(rdev: MemRegionDevice) -> Self {
        Self { rdev }
    }

    /// The device holding the store.
    pub fn rdev(&self) -> &MemRegionDevice {
        &self.rdev
    }

    /// Iterates over the files in the store, in order.
    ///
    /// Iteration stops at the first malformed header.
    pub fn files(&self) -> Files<'_> {
        Files {
            cbfs: self,
            offset: Some(0),
        }
    }

    /// Finds the file named `name`.
    ///
    /// If `ty` is given, the file must also have that type.
    pub fn lookup(&self, name: &str, ty: Option<CbfsType>) -> Result<CbfsFile, Error> {
        let mut offset = 0;
        while let Some((file, next)) = self.file_at(offset)? {
            offset = next;
            let Some(file) = file else { continue };
            if file.ty == CbfsType::DELETED || file.ty == CbfsType::NULL {
                continue;
            }
            if file.name != name {
                continue;
            }
            if let Some(expected) = ty {
                if file.ty != expected {
                    return Err(Error::TypeMismatch {
                        name: file.name,
                        expected,
                        found: file.ty,
                    });
                }
            }
            tracing::debug!(
                name,
                ty = %file.ty,
                offset = file.data.root_offset(),
                size = file.data.as_bytes().len(),
                "found file"
            );
            return Ok(file);
        }
        Err(Error::NotFound(name.into()))
    }

    /// Parses the file whose header may start at `offset`.
    ///
    /// Returns `None` at the end of the store; otherwise the file (or `None`
    /// for padding) and the offset to continue from.
    #[allow(clippy::type_complexity)]
    fn file_at(&self, offset: u64) -> Result<Option<(Option<CbfsFile>, u64)>, Error> {
        let bytes = self.rdev.as_bytes();
        let size = bytes.len() as u64;
        if offset.saturating_add(HEADER_SIZE) > size {
            return Ok(None);
        }

        let rest = &bytes[offset as usize..];
        let header = spec::FileHeader::read_from_prefix(rest).ok_or(Error::BadHeader(offset))?;
        if header.magic != spec::FILE_MAGIC {
            return Ok(Some((None, offset + spec::FILE_ALIGN)));
        }

        let data_offset = u64::from(header.offset.get());
        if data_offset <= HEADER_SIZE || data_offset > rest.len() as u64 {
            return Err(Error::BadHeader(offset));
        }
        let name_field = &rest[HEADER_SIZE as usize..data_offset as usize];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::BadHeader(offset))?;
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| Error::BadHeader(offset))?
            .to_owned();

        let len = u64::from(header.len.get());
        let data = self
            .rdev
            .chain(offset + data_offset, len)
            .map_err(Error::DataOutOfBounds)?;

        let next = align_up(offset + data_offset + len, spec::FILE_ALIGN);
        let file = CbfsFile {
            name,
            ty: CbfsType(header.ty.get()),
            header_offset: offset,
            data,
        };
        Ok(Some((Some(file), next)))
    }
}

/// Iterator returned by [`Cbfs::files`].
pub struct Files<'a> {
    cbfs: &'a Cbfs,
    offset: Option<u64>,
}

impl Iterator for Files<'_> {
    type Item = CbfsFile;

    fn next(&mut self) -> Option<CbfsFile> {
        loop {
            let offset = self.offset?;
            match self.cbfs.file_at(offset) {
                Ok(Some((file, next))) => {
                    self.offset = Some(next);
                    if file.is_some() {
                        return file;
                    }
                }
                Ok(None) => {
                    self.offset = None;
                    return None;
                }
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "stopping store walk"
                    );
                    self.offset = None;
                    return None;
                }
            }
        }
    }
}

fn align_up(v: u64, align: u64) -> u64 {
    v.div_ceil(align) * align
}

/// Assembles a store image.
#[derive(Debug, Default)]
pub struct CbfsBuilder {
    image: Vec<u8>,
}

impl CbfsBuilder {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a file.
    pub fn add_file(&mut self, name: &str, ty: CbfsType, data: &[u8]) -> Result<(), Error> {
        if !name.is_ascii() {
            return Err(Error::FilenameNotAscii(name.into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::FilenameTooLong(name.into()));
        }
        let len: u32 = data
            .len()
            .try_into()
            .map_err(|_| Error::FileTooBig(name.into()))?;

        let data_offset = align_up(HEADER_SIZE + name.len() as u64 + 1, spec::DATA_ALIGN);
        let header = spec::FileHeader {
            magic: spec::FILE_MAGIC,
            len: len.into(),
            ty: ty.0.into(),
            attributes_offset: 0.into(),
            offset: (data_offset as u32).into(),
        };

        let start = self.image.len();
        self.image.extend_from_slice(header.as_bytes());
        self.image.extend_from_slice(name.as_bytes());
        self.image.resize(start + data_offset as usize, 0);
        self.image.extend_from_slice(data);
        let end = align_up(self.image.len() as u64, spec::FILE_ALIGN) as usize;
        self.image.resize(end, 0xff);
        Ok(())
    }

    /// Returns the store image.
    pub fn build(&self) -> Vec<u8> {
        self.image.clone()
    }

    /// Returns the store image padded with erased flash (`0xff`) to `size`.
    pub fn build_padded(&self, size: usize) -> Result<Vec<u8>, Error> {
        if self.image.len() > size {
            return Err(Error::ImageTooLarge {
                len: self.image.len(),
                size,
            });
        }
        let mut image = self.image.clone();
        image.resize(size, 0xff);
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use region::RegionDevice;
    use test_with_tracing::test;

    fn store() -> Cbfs {
        let mut builder = CbfsBuilder::new();
        builder
            .add_file("fallback/romstage", CbfsType::STAGE, &[1; 100])
            .unwrap();
        builder
            .add_file("fallback/payload", CbfsType::SELF, &[2; 7])
            .unwrap();
        builder.add_file("config", CbfsType::RAW, b"").unwrap();
        Cbfs::new(MemRegionDevice::new(builder.build_padded(0x1000).unwrap()))
    }

    #[test]
    fn walk_files() {
        let cbfs = store();
        let files: Vec<_> = cbfs
            .files()
            .map(|f| (f.name().to_owned(), f.ty(), f.data().size()))
            .collect();
        assert_eq!(
            files,
            [
                ("fallback/romstage".to_owned(), CbfsType::STAGE, 100),
                ("fallback/payload".to_owned(), CbfsType::SELF, 7),
                ("config".to_owned(), CbfsType::RAW, 0),
            ]
        );
        assert!(cbfs.files().all(|f| f.header_offset() % spec::FILE_ALIGN == 0));
    }

    #[test]
    fn lookup_by_name_and_type() {
        let cbfs = store();
        let file = cbfs
            .lookup("fallback/payload", Some(CbfsType::SELF))
            .unwrap();
        assert_eq!(file.data().as_bytes(), [2; 7]);
        assert_eq!(
            file.data().root_offset(),
            file.header_offset() + spec::DATA_ALIGN * 3
        );

        assert!(cbfs.lookup("config", None).is_ok());
        assert!(matches!(
            cbfs.lookup("fallback/romstage", Some(CbfsType::SELF)),
            Err(Error::TypeMismatch {
                expected: CbfsType::SELF,
                found: CbfsType::STAGE,
                ..
            })
        ));
        assert!(matches!(
            cbfs.lookup("fallback/ramstage", None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn deleted_files_are_skipped() {
        let mut builder = CbfsBuilder::new();
        builder.add_file("a", CbfsType::DELETED, &[0]).unwrap();
        builder.add_file("a", CbfsType::RAW, &[1]).unwrap();
        let cbfs = Cbfs::new(MemRegionDevice::new(builder.build()));
        assert_eq!(cbfs.lookup("a", None).unwrap().data().as_bytes(), [1]);
        assert_eq!(cbfs.files().count(), 2);
    }

    #[test]
    fn corrupt_header() {
        let mut image = CbfsBuilder::new();
        image.add_file("a", CbfsType::RAW, &[1; 4]).unwrap();
        let mut image = image.build();
        // data offset pointing into the header
        image[20..24].copy_from_slice(&4u32.to_be_bytes());
        let cbfs = Cbfs::new(MemRegionDevice::new(image.clone()));
        assert!(matches!(cbfs.lookup("a", None), Err(Error::BadHeader(0))));
        assert_eq!(cbfs.files().count(), 0);

        // length running past the store
        image[20..24].copy_from_slice(&32u32.to_be_bytes());
        image[8..12].copy_from_slice(&0x1000u32.to_be_bytes());
        let cbfs = Cbfs::new(MemRegionDevice::new(image));
        assert!(matches!(
            cbfs.lookup("a", None),
            Err(Error::DataOutOfBounds(RegionError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn builder_validation() {
        let mut builder = CbfsBuilder::new();
        assert!(matches!(
            builder.add_file("caf\u{e9}", CbfsType::RAW, &[]),
            Err(Error::FilenameNotAscii(_))
        ));
        assert!(matches!(
            builder.add_file(&"x".repeat(MAX_NAME_LEN + 1), CbfsType::RAW, &[]),
            Err(Error::FilenameTooLong(_))
        ));
        builder.add_file("big", CbfsType::RAW, &[0; 200]).unwrap();
        assert!(matches!(
            builder.build_padded(64),
            Err(Error::ImageTooLarge { size: 64, .. })
        ));
    }
}
