// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loader for self-describing segmented payloads (SELF).
//!
//! A SELF image starts with a table of segment descriptors terminated by an
//! entry descriptor. Each segment is copied to its load address and the tail
//! beyond its stored bytes is zeroed.

use crate::bootmem::BootMemType;
use crate::notify::SegmentFlags;
use crate::Loader;
use crate::Prog;
use region::MemoryRange;
use region::RegionDevice;
use region::RegionError;
use spec::Compression;
use spec::SegmentType;
use std::ops::Range;
use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

/// On-media definitions.
pub mod spec {
    use packed_nums::*;
    use static_assertions::const_assert_eq;
    use std::fmt;
    use zerocopy::AsBytes;
    use zerocopy::FromBytes;
    use zerocopy::FromZeroes;

    #[allow(non_camel_case_types)]
    mod packed_nums {
        pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
        pub type u64_be = zerocopy::U64<zerocopy::BigEndian>;
    }

    /// One entry of the segment table, 28 bytes, big-endian.
    #[derive(Clone, Debug, AsBytes, FromBytes, FromZeroes)]
    #[repr(C)]
    pub struct PayloadSegment {
        /// A [`SegmentType`].
        pub ty: u32_be,
        /// A [`Compression`].
        pub compression: u32_be,
        /// Offset of the stored bytes from the start of the image.
        pub offset: u32_be,
        /// Physical load address, or the entry point for [`SegmentType::ENTRY`].
        pub load_addr: u64_be,
        /// Number of stored bytes.
        pub len: u32_be,
        /// Number of bytes occupied in memory.
        pub mem_len: u32_be,
    }

    const_assert_eq!(size_of::<PayloadSegment>(), 28);

    /// Segment descriptor type, a big-endian FourCC.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct SegmentType(pub u32);

    #[allow(missing_docs)] // self-explanatory constants
    impl SegmentType {
        pub const CODE: Self = Self(u32::from_be_bytes(*b"CODE"));
        pub const DATA: Self = Self(u32::from_be_bytes(*b"DATA"));
        pub const BSS: Self = Self(u32::from_be_bytes(*b"BSS "));
        pub const PARAMS: Self = Self(u32::from_be_bytes(*b"PARA"));
        pub const ENTRY: Self = Self(u32::from_be_bytes(*b"ENTR"));
    }

    impl fmt::Debug for SegmentType {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let bytes = self.0.to_be_bytes();
            if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
                write!(f, "'{}'", String::from_utf8_lossy(&bytes))
            } else {
                write!(f, "{:#x}", self.0)
            }
        }
    }

    /// Segment compression algorithm.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Compression(pub u32);

    #[allow(missing_docs)] // self-explanatory constants
    impl Compression {
        pub const NONE: Self = Self(0);
        pub const LZMA: Self = Self(1);
        pub const LZ4: Self = Self(2);
    }
}

/// Errors which may occur while loading a SELF image.
#[derive(Debug, Error)]
#[allow(missing_docs)] // self-explanatory variants
pub enum Error {
    #[error("program has not been located")]
    NotLocated,
    #[error("failed to map the stored image")]
    Map(#[source] RegionError),
    #[error("segment table runs past the end of the image without an entry segment")]
    MissingEntry,
    #[error("segment {index} has unknown type {ty:?}")]
    UnknownSegmentType { index: usize, ty: SegmentType },
    #[error("segment {index} uses unsupported compression {compression:?}")]
    UnsupportedCompression {
        index: usize,
        compression: Compression,
    },
    #[error("segment {index} stored bytes lie outside of the image")]
    SegmentOutOfImage { index: usize },
    #[error("segment {index} stores {len:#x} bytes but occupies only {mem_len:#x}")]
    MemSizeTooSmall { index: usize, len: u32, mem_len: u32 },
    #[error("segment {index} load address overflows")]
    AddressOverflow { index: usize },
    #[error("image contains no loadable segments")]
    NoSegments,
    #[error("segment {index} at {range} does not target {dest_type:?} memory")]
    TargetsDisallowedMemory {
        index: usize,
        range: MemoryRange,
        dest_type: BootMemType,
    },
    #[error("failed to write segment {index}")]
    Memory {
        index: usize,
        #[source]
        err: RegionError,
    },
}

/// A segment ready to be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Planned {
    index: usize,
    dest: MemoryRange,
    src: Range<usize>,
}

/// The parsed and validated segment table.
#[derive(Debug)]
struct Plan {
    segments: Vec<Planned>,
    entry: u64,
}

fn parse(image: &[u8]) -> Result<Plan, Error> {
    let mut segments = Vec::new();
    let table = image.chunks_exact(size_of::<spec::PayloadSegment>());
    for (index, chunk) in table.enumerate() {
        let raw = spec::PayloadSegment::read_from(chunk).ok_or(Error::MissingEntry)?;

        let ty = SegmentType(raw.ty.get());
        let (len, mem_len) = match ty {
            SegmentType::ENTRY => {
                if segments.is_empty() {
                    return Err(Error::NoSegments);
                }
                return Ok(Plan {
                    segments,
                    entry: raw.load_addr.get(),
                });
            }
            SegmentType::PARAMS => {
                tracing::debug!(index, "skipping parameter segment");
                continue;
            }
            SegmentType::CODE | SegmentType::DATA => (raw.len.get(), raw.mem_len.get()),
            // Nothing is stored for BSS, whatever the descriptor claims.
            SegmentType::BSS => (0, raw.mem_len.get()),
            ty => return Err(Error::UnknownSegmentType { index, ty }),
        };

        let compression = Compression(raw.compression.get());
        if compression != Compression::NONE {
            return Err(Error::UnsupportedCompression { index, compression });
        }

        if len > mem_len {
            return Err(Error::MemSizeTooSmall {
                index,
                len,
                mem_len,
            });
        }

        let src_start = raw.offset.get() as usize;
        let src = src_start..src_start + len as usize;
        if src.end > image.len() {
            return Err(Error::SegmentOutOfImage { index });
        }

        let dest = MemoryRange::from_base_len(raw.load_addr.get(), mem_len.into())
            .ok_or(Error::AddressOverflow { index })?;

        segments.push(Planned { index, dest, src });
    }
    Err(Error::MissingEntry)
}

/// Loads the located program without checking where its segments land.
///
/// Segments may overwrite any memory in the address space, including the
/// running firmware. Use [`selfload_check`] unless the image is trusted to
/// target sane addresses.
pub fn selfload(loader: &mut Loader, prog: &mut Prog) -> Result<(), Error> {
    load_located(loader, prog, None)
}

/// Loads the located program after checking that every segment lies in
/// memory of type `dest_type`.
///
/// The check covers all segments before any is copied. Failures while
/// copying leave memory partially written.
pub fn selfload_check(
    loader: &mut Loader,
    prog: &mut Prog,
    dest_type: BootMemType,
) -> Result<(), Error> {
    load_located(loader, prog, Some(dest_type))
}

fn load_located(
    loader: &mut Loader,
    prog: &mut Prog,
    dest_type: Option<BootMemType>,
) -> Result<(), Error> {
    let source = prog.source().ok_or(Error::NotLocated)?.clone();
    let mapping = source.map_full().map_err(Error::Map)?;
    selfload_mapped(loader, prog, &mapping, dest_type)
}

/// Like [`selfload_check`], but with the image already mapped.
///
/// `dest_type` of `None` skips the destination check, as [`selfload`] does.
pub fn selfload_mapped(
    loader: &mut Loader,
    prog: &mut Prog,
    mapping: &[u8],
    dest_type: Option<BootMemType>,
) -> Result<(), Error> {
    let Plan { segments, entry } = parse(mapping)?;

    if let Some(dest_type) = dest_type {
        for seg in segments.iter().filter(|s| !s.dest.is_empty()) {
            if !loader.targets(seg.dest, dest_type) {
                tracing::error!(
                    name = prog.name(),
                    index = seg.index,
                    range = %seg.dest,
                    ?dest_type,
                    "segment does not target usable memory"
                );
                return Err(Error::TargetsDisallowedMemory {
                    index: seg.index,
                    range: seg.dest,
                    dest_type,
                });
            }
        }
    }

    let last = segments.len() - 1;
    for (i, seg) in segments.iter().enumerate() {
        tracing::debug!(
            index = seg.index,
            dest = %seg.dest,
            filesz = seg.src.len(),
            "loading segment"
        );
        let flags = SegmentFlags::new().with_final_segment(i == last);
        loader
            .place_segment(seg.dest, &mapping[seg.src.clone()], flags)
            .map_err(|err| Error::Memory {
                index: seg.index,
                err,
            })?;
    }

    // Empty segments occupy no memory and do not widen the footprint.
    let occupied = || segments.iter().map(|s| s.dest).filter(|r| !r.is_empty());
    let start = occupied().map(|r| r.start()).min();
    let end = occupied().map(|r| r.end()).max();
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        _ => (segments[0].dest.start(), segments[0].dest.start()),
    };
    prog.memory_init(loader.space(), start, end - start);
    prog.set_entry(entry, 0);

    tracing::info!(
        name = prog.name(),
        segments = segments.len(),
        entry,
        "loaded segments"
    );
    Ok(())
}

/// Assembles SELF images.
#[derive(Debug, Default)]
pub struct SelfBuilder {
    segments: Vec<(SegmentType, u64, Vec<u8>, u32)>,
}

impl SelfBuilder {
    /// Creates an empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a code segment.
    pub fn code(mut self, load_addr: u64, data: impl Into<Vec<u8>>, mem_len: u32) -> Self {
        self.segments
            .push((SegmentType::CODE, load_addr, data.into(), mem_len));
        self
    }

    /// Appends a data segment.
    pub fn data(mut self, load_addr: u64, data: impl Into<Vec<u8>>, mem_len: u32) -> Self {
        self.segments
            .push((SegmentType::DATA, load_addr, data.into(), mem_len));
        self
    }

    /// Appends a zero-initialized segment.
    pub fn bss(mut self, load_addr: u64, mem_len: u32) -> Self {
        self.segments
            .push((SegmentType::BSS, load_addr, Vec::new(), mem_len));
        self
    }

    /// Appends a parameter segment, which loaders skip.
    pub fn params(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.segments
            .push((SegmentType::PARAMS, 0, data.into(), 0));
        self
    }

    /// Terminates the table with `entry` and returns the image bytes.
    pub fn build(self, entry: u64) -> Vec<u8> {
        let table_len = (self.segments.len() + 1) * size_of::<spec::PayloadSegment>();
        let mut table = Vec::with_capacity(table_len);
        let mut payload = Vec::new();

        for (ty, load_addr, data, mem_len) in self.segments {
            let offset = table_len + payload.len();
            table.extend_from_slice(
                spec::PayloadSegment {
                    ty: ty.0.into(),
                    compression: Compression::NONE.0.into(),
                    offset: (offset as u32).into(),
                    load_addr: load_addr.into(),
                    len: (data.len() as u32).into(),
                    mem_len: mem_len.into(),
                }
                .as_bytes(),
            );
            payload.extend_from_slice(&data);
        }

        table.extend_from_slice(
            spec::PayloadSegment {
                ty: SegmentType::ENTRY.0.into(),
                compression: Compression::NONE.0.into(),
                offset: 0.into(),
                load_addr: entry.into(),
                len: 0.into(),
                mem_len: 0.into(),
            }
            .as_bytes(),
        );
        table.extend_from_slice(&payload);
        table
    }
}
