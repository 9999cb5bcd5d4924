//! Reader for the shared-memory WAL index (`-shm`) written by a live process.
//!
//! Only the index header and the checkpoint information are of interest: they say how many
//! frames are valid and how many have already been copied back into the database file.

use std::{
    fs::File,
    io::{ErrorKind, Read},
    path::Path,
};

use assert_layout::assert_layout;
use log::debug;
use zerocopy::{
    FromBytes, Immutable, KnownLayout,
    byteorder::{NativeEndian, U16, U32},
};

/// Size of one copy of the index header.
const INDEX_HEADER_SIZE: usize = 48;
/// Offset of the checkpoint information, after both copies of the index header.
const CHECKPOINT_INFO_OFFSET: usize = 2 * INDEX_HEADER_SIZE;
/// Bytes that must be present for the header to be read.
const SHM_HEADER_SIZE: usize = CHECKPOINT_INFO_OFFSET + 4;

/// WAL index header, in the byte order of the machine that wrote it.
#[derive(Clone, Debug, FromBytes, KnownLayout, Immutable)]
#[assert_layout(size = INDEX_HEADER_SIZE)]
#[repr(C)]
struct IndexHeader {
    #[assert_layout(offset = 0, size = 4)]
    version: U32<NativeEndian>,
    #[assert_layout(offset = 4, size = 4)]
    unused: U32<NativeEndian>,
    #[assert_layout(offset = 8, size = 4)]
    change: U32<NativeEndian>,
    /// Non-zero once the header has been initialised.
    #[assert_layout(offset = 12, size = 1)]
    is_init: u8,
    #[assert_layout(offset = 13, size = 1)]
    big_endian_checksum: u8,
    #[assert_layout(offset = 14, size = 2)]
    page_size: U16<NativeEndian>,
    /// Index of the last valid frame in the WAL.
    #[assert_layout(offset = 16, size = 4)]
    max_frame: U32<NativeEndian>,
    #[assert_layout(offset = 20, size = 4)]
    page_count: U32<NativeEndian>,
    #[assert_layout(offset = 24, size = 8)]
    frame_checksum: [u8; 8],
    /// Salt copied verbatim from the WAL header.
    #[assert_layout(offset = 32, size = 8)]
    salt: [u8; 8],
    #[assert_layout(offset = 40, size = 8)]
    checksum: [u8; 8],
}

/// Checkpoint progress published by the live process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmInfo {
    pub max_frame: u32,
    pub salt: (u32, u32),
    pub n_backfill: u32,
}

impl ShmInfo {
    /// Read the index next to the database at `db_path`. Will be [`None`] if there is no index,
    /// or if it is not in a consistent state.
    pub fn read(db_path: &Path) -> std::io::Result<Option<Self>> {
        let path = super::sibling_path(db_path, "-shm");

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut buf = [0u8; SHM_HEADER_SIZE];
        match file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        Ok(Self::parse(&buf))
    }

    fn parse(buf: &[u8; SHM_HEADER_SIZE]) -> Option<Self> {
        // Writers update the two copies in turn, they only agree when no update is in flight.
        if buf[..INDEX_HEADER_SIZE] != buf[INDEX_HEADER_SIZE..CHECKPOINT_INFO_OFFSET] {
            debug!("shm index header copies disagree, ignoring");
            return None;
        }

        let (header, _) = IndexHeader::read_from_prefix(buf).ok()?;
        if header.is_init == 0 {
            debug!("shm index header is not initialised, ignoring");
            return None;
        }

        let (n_backfill, _) =
            U32::<NativeEndian>::read_from_prefix(&buf[CHECKPOINT_INFO_OFFSET..]).ok()?;

        Some(Self {
            max_frame: header.max_frame.get(),
            salt: (
                u32::from_be_bytes(header.salt[..4].try_into().ok()?),
                u32::from_be_bytes(header.salt[4..].try_into().ok()?),
            ),
            n_backfill: n_backfill.get(),
        })
    }
}
