//! Reader for the write-ahead log (`-wal`) that overlays committed page images on top of the
//! database file.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{ErrorKind, Read, Seek, SeekFrom},
    path::Path,
};

use assert_layout::assert_layout;
use log::{debug, warn};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, KnownLayout, big_endian::U32};

use super::shm::ShmInfo;

/// Size of the WAL header in bytes.
pub const WAL_HEADER_SIZE: usize = 32;
/// Size of the header preceding every frame in bytes.
pub const FRAME_HEADER_SIZE: usize = 24;
/// Magic number, with the low bit selecting the checksum byte order.
const WAL_MAGIC: u32 = 0x377f0682;

/// Pair of 32-bit values identifying a WAL generation.
pub type Salt = (u32, u32);

#[derive(Clone, Debug, FromBytes, KnownLayout, Immutable)]
#[assert_layout(size = WAL_HEADER_SIZE)]
#[repr(C)]
struct WalHeader {
    #[assert_layout(offset = 0, size = 4)]
    magic: U32,
    #[assert_layout(offset = 4, size = 4)]
    version: U32,
    #[assert_layout(offset = 8, size = 4)]
    page_size: U32,
    #[assert_layout(offset = 12, size = 4)]
    checkpoint_sequence: U32,
    #[assert_layout(offset = 16, size = 4)]
    salt1: U32,
    #[assert_layout(offset = 20, size = 4)]
    salt2: U32,
    #[assert_layout(offset = 24, size = 4)]
    checksum1: U32,
    #[assert_layout(offset = 28, size = 4)]
    checksum2: U32,
}

#[derive(Clone, Debug, FromBytes, KnownLayout, Immutable)]
#[assert_layout(size = FRAME_HEADER_SIZE)]
#[repr(C)]
struct FrameHeader {
    #[assert_layout(offset = 0, size = 4)]
    page_number: U32,
    /// Database size in pages after a commit, zero for frames which are not the last of a
    /// transaction.
    #[assert_layout(offset = 4, size = 4)]
    commit_size: U32,
    #[assert_layout(offset = 8, size = 4)]
    salt1: U32,
    #[assert_layout(offset = 12, size = 4)]
    salt2: U32,
    #[assert_layout(offset = 16, size = 4)]
    checksum1: U32,
    #[assert_layout(offset = 20, size = 4)]
    checksum2: U32,
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("incorrect wal magic: {0:#x}")]
    Magic(u32),
    #[error("mismatched wal header checksum")]
    HeaderChecksum,
    #[error("mismatched checksum for frame {0}")]
    FrameChecksum(u32),
    #[error("frame {0} is truncated")]
    ShortFrame(u32),
    #[error("wal header is truncated to {0} bytes")]
    ShortHeader(usize),
}

/// Where to resume reading the log, as remembered from an earlier run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalPosition {
    pub salt: Salt,
    pub n_backfill: u32,
}

/// How the log should be interpreted.
#[derive(Clone, Copy, Debug)]
pub struct WalOptions {
    /// Expected position. A zero salt accepts any generation.
    pub position: WalPosition,
    /// Consult the `-shm` index. When the index is trusted, a checksum mismatch is corruption,
    /// otherwise it marks the end of the valid frames.
    pub use_shm: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            position: WalPosition::default(),
            use_shm: true,
        }
    }
}

/// Summary of a loaded log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalInfo {
    pub salt: Salt,
    pub n_backfill: u32,
    /// Last committed frame.
    pub max_frame: u32,
    /// Number of distinct pages overlaid by committed frames.
    pub frames: usize,
    /// Number of pages only present in uncommitted frames.
    pub disposed_pages: usize,
}

/// Checkpoint that starts a new generation increments the first salt and re-randomises the
/// second.
pub fn is_checkpoint_increased_salt(before: Salt, after: Salt) -> bool {
    before.0.wrapping_add(1) == after.0 && before.1 != after.1
}

/// Cumulative checksum over pairs of 32-bit words.
pub(crate) fn checksum(data: &[u8], big_endian: bool, mut sum: (u32, u32)) -> (u32, u32) {
    let word = |bytes: &[u8]| {
        let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    };

    for pair in data.chunks_exact(8) {
        sum.0 = sum.0.wrapping_add(word(&pair[..4])).wrapping_add(sum.1);
        sum.1 = sum.1.wrapping_add(word(&pair[4..])).wrapping_add(sum.0);
    }

    sum
}

pub struct Wal {
    file: Option<File>,
    page_size: usize,
    salt: Salt,
    n_backfill: u32,
    max_frame: u32,
    /// Latest committed frame for each page.
    pages_to_frames: BTreeMap<u32, u32>,
    disposed: BTreeSet<u32>,
}

impl Wal {
    /// An empty log that overlays nothing.
    pub fn empty(page_size: usize) -> Self {
        Self {
            file: None,
            page_size,
            salt: (0, 0),
            n_backfill: 0,
            max_frame: 0,
            pages_to_frames: BTreeMap::new(),
            disposed: BTreeSet::new(),
        }
    }

    /// Load the log next to the database at `db_path`. A missing or empty log produces an empty
    /// overlay.
    pub fn load(db_path: &Path, page_size: usize, options: WalOptions) -> Result<Self, WalError> {
        let mut wal = Self::empty(page_size);
        wal.salt = options.position.salt;
        wal.n_backfill = options.position.n_backfill;

        let mut max_frame = u32::MAX;
        let mut indexed = false;
        if options.use_shm {
            if let Some(shm) = ShmInfo::read(db_path)? {
                debug!("wal index reports {shm:?}");
                wal.n_backfill = shm.n_backfill;
                wal.salt = shm.salt;
                max_frame = shm.max_frame;
                indexed = true;
            }
        }

        let path = super::sibling_path(db_path, "-wal");
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(wal),
            Err(e) => return Err(e.into()),
        };
        let file_size = file.metadata()?.len() as usize;
        if file_size == 0 {
            return Ok(wal);
        }
        if file_size < WAL_HEADER_SIZE {
            return Err(WalError::ShortHeader(file_size));
        }

        let mut header_buf = [0u8; WAL_HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let (header, _) = WalHeader::read_from_prefix(&header_buf)
            .map_err(|_| WalError::ShortFrame(0))?;

        let magic = header.magic.get();
        if magic & 0xffff_fffe != WAL_MAGIC {
            return Err(WalError::Magic(magic));
        }
        let big_endian = magic & 1 == 1;

        let salt = (header.salt1.get(), header.salt2.get());
        if wal.salt != (0, 0)
            && wal.salt != salt
            && !(is_checkpoint_increased_salt(wal.salt, salt) && wal.n_backfill > 0)
        {
            debug!("wal salt changed from {:?} to {salt:?}, reading from the start", wal.salt);
            wal.n_backfill = 0;
            max_frame = u32::MAX;
            indexed = false;
        }
        wal.salt = salt;

        let frame_size = FRAME_HEADER_SIZE + page_size;
        let frames_in_file = ((file_size - WAL_HEADER_SIZE) / frame_size) as u32;
        let max_frame = max_frame.min(frames_in_file);

        if wal.n_backfill >= max_frame {
            debug!("all {max_frame} wal frames are already checkpointed");
            return Ok(wal);
        }

        let mut sum = checksum(&header_buf[..WAL_HEADER_SIZE - 8], big_endian, (0, 0));
        if sum != (header.checksum1.get(), header.checksum2.get()) {
            return Err(WalError::HeaderChecksum);
        }

        let mut frame = vec![0u8; frame_size];
        if wal.n_backfill > 0 {
            read_frame(&mut file, page_size, wal.n_backfill, &mut frame)?;
            let (header, _) = FrameHeader::read_from_prefix(&frame)
                .map_err(|_| WalError::ShortFrame(wal.n_backfill))?;
            sum = (header.checksum1.get(), header.checksum2.get());
        }

        let mut uncommitted = BTreeMap::new();
        for frame_no in wal.n_backfill + 1..=max_frame {
            read_frame(&mut file, page_size, frame_no, &mut frame)?;
            let (header, page) = FrameHeader::read_from_prefix(&frame)
                .map_err(|_| WalError::ShortFrame(frame_no))?;

            sum = checksum(&frame[..8], big_endian, sum);
            sum = checksum(page, big_endian, sum);

            let valid = sum == (header.checksum1.get(), header.checksum2.get())
                && (header.salt1.get(), header.salt2.get()) == salt;
            if !valid {
                if indexed {
                    return Err(WalError::FrameChecksum(frame_no));
                }

                // Without an index, the first invalid frame is where the valid log ends.
                debug!("wal ends at invalid frame {frame_no}");
                break;
            }

            uncommitted.insert(header.page_number.get(), frame_no);
            if header.commit_size.get() != 0 {
                wal.max_frame = frame_no;
                wal.pages_to_frames.append(&mut uncommitted);
            }
        }

        if !uncommitted.is_empty() {
            warn!("disposing {} pages of uncommitted wal frames", uncommitted.len());
            wal.disposed.extend(uncommitted.into_keys());
        }

        wal.file = Some(file);
        Ok(wal)
    }

    pub fn contains_page(&self, page_no: u32) -> bool {
        self.pages_to_frames.contains_key(&page_no)
    }

    /// Highest page number present in a committed frame.
    pub fn max_page_no(&self) -> u32 {
        self.pages_to_frames
            .last_key_value()
            .map(|(page_no, _)| *page_no)
            .unwrap_or(0)
    }

    /// Pages overlaid by the log, in ascending order.
    pub fn pages(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages_to_frames.keys().copied()
    }

    /// Read the latest committed image of `page_no` into `buf`, which must be exactly one page
    /// long. Produces the number of bytes read, which is short when the log was truncated.
    pub fn read_page(&mut self, page_no: u32, buf: &mut [u8]) -> std::io::Result<usize> {
        let (Some(file), Some(&frame_no)) = (self.file.as_mut(), self.pages_to_frames.get(&page_no))
        else {
            return Ok(0);
        };

        let offset = WAL_HEADER_SIZE
            + (frame_no as usize - 1) * (FRAME_HEADER_SIZE + self.page_size)
            + FRAME_HEADER_SIZE;
        file.seek(SeekFrom::Start(offset as u64))?;

        read_fully(file, buf)
    }

    /// Forget every overlaid page, as if the log was never loaded.
    pub fn dispose(&mut self) {
        self.disposed.extend(self.pages_to_frames.keys().copied());
        self.pages_to_frames.clear();
        self.file = None;
        self.max_frame = 0;
        self.salt = (0, 0);
    }

    pub fn info(&self) -> WalInfo {
        WalInfo {
            salt: self.salt,
            n_backfill: self.n_backfill,
            max_frame: self.max_frame,
            frames: self.pages_to_frames.len(),
            disposed_pages: self.disposed.len(),
        }
    }
}

fn read_frame(
    file: &mut File,
    page_size: usize,
    frame_no: u32,
    buf: &mut [u8],
) -> Result<(), WalError> {
    let offset = WAL_HEADER_SIZE + (frame_no as usize - 1) * (FRAME_HEADER_SIZE + page_size);
    file.seek(SeekFrom::Start(offset as u64))?;

    if read_fully(file, buf)? != buf.len() {
        return Err(WalError::ShortFrame(frame_no));
    }

    Ok(())
}

/// Fill as much of `buf` as the source allows, producing the number of bytes read.
pub(crate) fn read_fully(source: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}
