// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loader for firmware stages.
//!
//! A stage is a single segment: a small header followed by the bytes to copy
//! to the load address. This is the layout of [`crate::CbfsType::LEGACY_STAGE`]
//! files; [`crate::CbfsType::STAGE`] files, which describe the segment in
//! file attributes instead, are not handled here.

use crate::notify::SegmentFlags;
use crate::Loader;
use crate::Prog;
use region::MemoryRange;
use region::RegionDevice;
use region::RegionError;
use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

/// On-media definitions.
pub mod spec {
    use packed_nums::*;
    use static_assertions::const_assert_eq;
    use zerocopy::AsBytes;
    use zerocopy::FromBytes;
    use zerocopy::FromZeroes;

    #[allow(non_camel_case_types)]
    mod packed_nums {
        pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
        pub type u64_le = zerocopy::U64<zerocopy::LittleEndian>;
    }

    /// Stage header, 28 bytes, little-endian.
    #[derive(Clone, Debug, AsBytes, FromBytes, FromZeroes)]
    #[repr(C)]
    pub struct StageHeader {
        /// Compression of the stored bytes; only zero (none) is supported.
        pub compression: u32_le,
        /// Entry point.
        pub entry: u64_le,
        /// Load address.
        pub load: u64_le,
        /// Number of stored bytes following the header.
        pub len: u32_le,
        /// Number of bytes occupied in memory.
        pub memlen: u32_le,
    }

    const_assert_eq!(size_of::<StageHeader>(), 28);
}

/// Errors which may occur while loading a stage.
#[derive(Debug, Error)]
#[allow(missing_docs)] // self-explanatory variants
pub enum Error {
    #[error("program has not been located")]
    NotLocated,
    #[error("failed to map the stored stage")]
    Map(#[source] RegionError),
    #[error("stage header is truncated")]
    Truncated,
    #[error("unsupported stage compression {0}")]
    UnsupportedCompression(u32),
    #[error("stage stores {len:#x} bytes but occupies only {memlen:#x}")]
    MemSizeTooSmall { len: u32, memlen: u32 },
    #[error("stage data runs past the end of the file")]
    DataOutOfImage,
    #[error("stage load address overflows")]
    AddressOverflow,
    #[error("failed to write stage to memory")]
    Memory(#[source] RegionError),
}

/// Loads the located stage into memory and records its entry point.
pub fn load(loader: &mut Loader, prog: &mut Prog) -> Result<(), Error> {
    let source = prog.source().ok_or(Error::NotLocated)?.clone();
    let mapping = source.map_full().map_err(Error::Map)?;

    let header = spec::StageHeader::read_from_prefix(&mapping).ok_or(Error::Truncated)?;
    if header.compression.get() != 0 {
        return Err(Error::UnsupportedCompression(header.compression.get()));
    }

    let (len, memlen) = (header.len.get(), header.memlen.get());
    if len > memlen {
        return Err(Error::MemSizeTooSmall { len, memlen });
    }

    let data = mapping
        .get(size_of::<spec::StageHeader>()..)
        .and_then(|rest| rest.get(..len as usize))
        .ok_or(Error::DataOutOfImage)?;

    let dest = MemoryRange::from_base_len(header.load.get(), memlen.into())
        .ok_or(Error::AddressOverflow)?;

    tracing::debug!(name = prog.name(), %dest, len, "loading stage");
    loader
        .place_segment(dest, data, SegmentFlags::new().with_final_segment(true))
        .map_err(Error::Memory)?;

    prog.memory_init(loader.space(), dest.start(), dest.len());
    prog.set_entry(header.entry.get(), 0);

    tracing::info!(
        name = prog.name(),
        entry = header.entry.get(),
        "stage loaded"
    );
    Ok(())
}

/// Assembles stage files.
#[derive(Debug)]
pub struct StageBuilder {
    entry: u64,
    load: u64,
    memlen: Option<u32>,
}

impl StageBuilder {
    /// Creates a stage loaded at `load` and entered at `entry`.
    pub fn new(load: u64, entry: u64) -> Self {
        Self {
            entry,
            load,
            memlen: None,
        }
    }

    /// Sets the in-memory size, which defaults to the stored size.
    pub fn memlen(mut self, memlen: u32) -> Self {
        self.memlen = Some(memlen);
        self
    }

    /// Returns the stage file for `data`.
    pub fn build(self, data: &[u8]) -> Vec<u8> {
        let len = data.len() as u32;
        let mut file = spec::StageHeader {
            compression: 0.into(),
            entry: self.entry.into(),
            load: self.load.into(),
            len: len.into(),
            memlen: self.memlen.unwrap_or(len).into(),
        }
        .as_bytes()
        .to_vec();
        file.extend_from_slice(data);
        file
    }
}
