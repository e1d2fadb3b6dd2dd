// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! On-media definitions.

use packed_nums::*;
use static_assertions::const_assert_eq;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}

/// Start of every file header.
pub const FILE_MAGIC: [u8; 8] = *b"LARCHIVE";

/// Every file header starts on this boundary.
pub const FILE_ALIGN: u64 = 64;

/// File data starts on this boundary relative to its header.
pub const DATA_ALIGN: u64 = 16;

/// File header, followed by a NUL-terminated name and, at `offset`, the data.
#[derive(Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FileHeader {
    /// [`FILE_MAGIC`].
    pub magic: [u8; 8],
    /// Length of the file data.
    pub len: u32_be,
    /// [`loader::CbfsType`] of the file.
    pub ty: u32_be,
    /// Offset of the attribute list from the header, or zero.
    pub attributes_offset: u32_be,
    /// Offset of the data from the header.
    pub offset: u32_be,
}

const_assert_eq!(size_of::<FileHeader>(), 24);
