//! Page access layer: maps page numbers to decoded page bytes, overlaying committed WAL frames
//! on top of the database file.

mod cache;
pub mod shm;
pub mod wal;

use std::{
    cell::{Cell, RefCell},
    ffi::OsString,
    fmt::Debug,
    fs::File,
    io::{Seek, SeekFrom},
    ops::BitOr,
    path::{Path, PathBuf},
    rc::Rc,
};

use log::{debug, warn};

use self::{
    cache::PageCache,
    wal::{Wal, WalInfo, WalOptions, read_fully},
};
use crate::{
    cipher::{CIPHER_SALT_SIZE, CipherDelegate, PageCodec},
    error::{Error, Result},
    header::{HEADER_STRING, PageSize, SQLITE_HEADER_SIZE, SqliteHeader},
    page::Page,
};

/// Smallest usable space a page may have once reserved bytes are removed.
const MIN_USABLE_SIZE: u32 = 480;

/// Path of a file stored next to the database, such as its `-wal` or `-shm`.
pub(crate) fn sibling_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(db_path.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

/// Options used when opening a [`PageStore`].
#[derive(Clone, Debug)]
pub struct PageStoreConfig {
    /// Page size to use regardless of the header. Required for encrypted stores.
    pub page_size: Option<u32>,
    /// Reserved bytes to use regardless of the header.
    pub reserved_bytes: Option<u8>,
    /// Page size substituted when the header cannot be trusted.
    pub default_page_size: u32,
    /// Bytes of decoded pages kept in memory.
    pub cache_budget: usize,
    /// How to read the WAL. [`None`] skips it, exposing only the database file.
    pub wal: Option<WalOptions>,
    /// Fail to open when the WAL is corrupted, rather than ignoring it.
    pub wal_important: bool,
}

impl Default for PageStoreConfig {
    fn default() -> Self {
        Self {
            page_size: None,
            reserved_bytes: None,
            default_page_size: *PageSize::DEFAULT,
            cache_budget: 4 * 1024 * 1024,
            wal: Some(WalOptions::default()),
            wal_important: true,
        }
    }
}

/// Flags describing which parts of a store were found intact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Integrity(u8);

impl Integrity {
    /// The file header parsed cleanly.
    pub const HEADER: Self = Self(0b001);
    /// No damaged page or cell has been encountered.
    pub const DATA: Self = Self(0b010);
    /// A cipher salt was read from page 1.
    pub const KDF_SALT: Self = Self(0b100);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Integrity {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Shared handle to an opened database file. Cloning produces another handle to the same store.
#[derive(Clone)]
pub struct PageStore(Rc<PageStoreInner>);

struct PageStoreInner {
    path: PathBuf,
    file: RefCell<File>,
    codec: Option<Rc<dyn PageCodec>>,

    page_size: PageSize,
    reserved_bytes: u32,
    /// Pages covered by the database file, rounding a trailing partial page up.
    file_pages: u32,
    schema_cookie: u32,
    free_page_count: u32,

    integrity: Cell<Integrity>,
    wal: RefCell<Wal>,
    wal_important: bool,
    cache: RefCell<PageCache>,
}

impl Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("path", &self.0.path)
            .field("page_size", &self.0.page_size)
            .field("reserved_bytes", &self.0.reserved_bytes)
            .field("page_count", &self.page_count())
            .field("encrypted", &self.0.codec.is_some())
            .finish()
    }
}

impl PageStore {
    /// Open the database at `path`. Page size and reserved bytes are taken from the header unless
    /// forced by `config`. A header which cannot be trusted is reported through
    /// [`PageStore::integrity`] rather than failing, with defaults substituted.
    pub fn open(
        path: impl AsRef<Path>,
        config: PageStoreConfig,
        codec: Option<Rc<dyn PageCodec>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size == 0 {
            return Err(Error::corrupt("database file is empty"));
        }

        let forced = config
            .page_size
            .map(PageSize::try_from)
            .transpose()
            .map_err(|e| Error::Misuse(format!("forced {e}")))?;
        let default_page_size = PageSize::try_from(config.default_page_size)
            .map_err(|e| Error::Misuse(format!("default {e}")))?;

        let mut integrity = Integrity::DATA;

        // The header of an encrypted store is only readable once the whole of page 1 is decoded.
        let header_len = match (&codec, forced) {
            (None, _) => SQLITE_HEADER_SIZE,
            (Some(_), Some(page_size)) => usize::from(page_size),
            (Some(_), None) => {
                return Err(Error::Misuse(
                    "encrypted store requires the cipher page size".into(),
                ));
            }
        };
        let mut header_buf = vec![0u8; header_len];
        let read = read_fully(&mut file, &mut header_buf)?;
        header_buf.truncate(read);

        if let Some(codec) = &codec {
            if read >= CIPHER_SALT_SIZE {
                integrity.insert(Integrity::KDF_SALT);
            }
            if read == header_len {
                if let Err(e) = decode_page(codec.as_ref(), 1, &mut header_buf) {
                    warn!("unable to decode page 1 of {}: {e}", path.display());
                }
            }
        }

        let mut page_size = forced.unwrap_or(default_page_size);
        let mut reserved_bytes = 0;
        let mut schema_cookie = 0;
        let mut free_page_count = 0;
        match SqliteHeader::read(&header_buf).and_then(|h| Ok((h, h.validate()?))) {
            Ok((header, stored)) => {
                schema_cookie = header.schema_cookie();

                match forced {
                    // The rest of the header describes another geometry.
                    Some(forced) if forced != stored => {
                        warn!(
                            "header page size {} disagrees with forced page size {}",
                            *stored, *forced
                        );
                    }
                    _ => {
                        page_size = stored;
                        reserved_bytes = header.reserved_bytes() as u32;
                        free_page_count = header.freelist_page_count();
                        integrity.insert(Integrity::HEADER);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "header of {} is corrupted, assuming page size {}: {e}",
                    path.display(),
                    *page_size
                );
            }
        }

        if let Some(forced) = config.reserved_bytes {
            reserved_bytes = forced as u32;
        }
        if *page_size < reserved_bytes + MIN_USABLE_SIZE {
            return Err(Error::Misuse(format!(
                "{reserved_bytes} reserved bytes do not fit a page of {}",
                *page_size
            )));
        }

        let file_pages = file_size.div_ceil(*page_size as u64) as u32;
        if free_page_count > file_pages {
            warn!("free page count {free_page_count} exceeds page count {file_pages}");
            integrity.remove(Integrity::HEADER);
            free_page_count = 0;
        }

        let cache_budget = match codec {
            Some(_) => config.cache_budget * 2,
            None => config.cache_budget,
        };

        let store = Self(Rc::new(PageStoreInner {
            path,
            file: RefCell::new(file),
            codec,
            page_size,
            reserved_bytes,
            file_pages,
            schema_cookie,
            free_page_count,
            integrity: Cell::new(integrity),
            wal: RefCell::new(Wal::empty(usize::from(page_size))),
            wal_important: config.wal_important,
            cache: RefCell::new(PageCache::new(cache_budget)),
        }));

        if let Some(options) = config.wal {
            store.load_wal(options)?;
        }

        debug!("opened {store:?}");
        Ok(store)
    }

    /// Open the database at `path`, taking the page size and codec from `cipher` when the store
    /// is encrypted.
    pub fn open_with_cipher(
        path: impl AsRef<Path>,
        mut config: PageStoreConfig,
        cipher: Option<&dyn CipherDelegate>,
    ) -> Result<Self> {
        let codec = cipher.map(|cipher| {
            config.page_size = Some(cipher.cipher_page_size());
            cipher.cipher_context()
        });
        Self::open(path, config, codec)
    }

    /// Read and decode a page, preferring the committed WAL image over the database file.
    pub fn acquire_page(&self, number: u32) -> Result<Page> {
        if number == 0 || number > self.page_count() {
            return Err(Error::Misuse(format!(
                "page {number} is outside of 1..={}",
                self.page_count()
            )));
        }

        if let Some(data) = self.0.cache.borrow_mut().get(number) {
            return Ok(Page::new(number, data));
        }

        let page_size = self.page_size() as usize;
        let mut buf = Vec::new();
        buf.try_reserve_exact(page_size)?;
        buf.resize(page_size, 0);

        let mut wal = self.0.wal.borrow_mut();
        let read = if wal.contains_page(number) {
            wal.read_page(number, &mut buf)?
        } else if number > self.0.file_pages {
            return Err(Error::Misuse(format!(
                "page {number} exceeds the {} pages of the file",
                self.0.file_pages
            )));
        } else {
            let mut file = self.0.file.borrow_mut();
            file.seek(SeekFrom::Start((number as u64 - 1) * page_size as u64))?;
            read_fully(&mut *file, &mut buf)?
        };
        drop(wal);

        if read != page_size {
            return Err(Error::ShortRead {
                page: number,
                expected: page_size,
                found: read,
            });
        }

        if let Some(codec) = &self.0.codec {
            decode_page(codec.as_ref(), number, &mut buf)
                .map_err(|e| Error::damaged(number, format!("unable to decode page: {e}")))?;

            if buf.len() != page_size {
                return Err(Error::damaged(number, "decoded page changed size"));
            }
        }

        let data: Rc<[u8]> = buf.into();
        self.cache_page(number, data.clone());

        Ok(Page::new(number, data))
    }

    fn cache_page(&self, number: u32, data: Rc<[u8]>) {
        let mut cache = self.0.cache.borrow_mut();
        if !cache.insert(number, data) {
            return;
        }

        // Encrypted stores hold their budget twice over, and shed down to half of it.
        let target = match self.0.codec {
            Some(_) => cache.budget() / 2,
            None => cache.budget(),
        };
        let evicted = cache.purge(target);
        debug!("purged {evicted} pages from the page cache ({} bytes held)", cache.used());
    }

    /// Load the WAL, replacing any previously loaded overlay.
    pub fn load_wal(&self, options: WalOptions) -> Result<()> {
        let wal = match Wal::load(&self.0.path, self.page_size() as usize, options) {
            Ok(wal) => wal,
            Err(e) if !self.0.wal_important && !matches!(e, wal::WalError::Io(_)) => {
                warn!("ignoring corrupted wal of {}: {e}", self.0.path.display());
                Wal::empty(self.page_size() as usize)
            }
            Err(e) => return Err(e.into()),
        };

        debug!("loaded wal {:?}", wal.info());
        *self.0.wal.borrow_mut() = wal;
        self.0.cache.borrow_mut().clear();
        Ok(())
    }

    /// Drop the WAL overlay, so that pages are read from the database file only.
    pub fn dispose_wal(&self) {
        self.0.wal.borrow_mut().dispose();
        self.0.cache.borrow_mut().clear();
    }

    pub fn wal_info(&self) -> WalInfo {
        self.0.wal.borrow().info()
    }

    /// Pages overlaid by committed WAL frames.
    pub fn wal_pages(&self) -> Vec<u32> {
        self.0.wal.borrow().pages().collect()
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn page_size(&self) -> u32 {
        *self.0.page_size
    }

    pub fn reserved_bytes(&self) -> u32 {
        self.0.reserved_bytes
    }

    /// Page size less the bytes reserved at the end of each page.
    pub fn usable_size(&self) -> usize {
        (self.page_size() - self.reserved_bytes()) as usize
    }

    /// Number of addressable pages, including any the WAL appends beyond the file.
    pub fn page_count(&self) -> u32 {
        self.0.file_pages.max(self.0.wal.borrow().max_page_no())
    }

    /// Schema cookie of the latest committed image of page 1.
    pub fn schema_cookie(&self) -> u32 {
        if !self.0.wal.borrow().contains_page(1) {
            return self.0.schema_cookie;
        }
        self.acquire_page(1)
            .ok()
            .and_then(|page| SqliteHeader::read(&page).ok().map(|h| h.schema_cookie()))
            .unwrap_or(self.0.schema_cookie)
    }

    pub fn free_page_count(&self) -> u32 {
        self.0.free_page_count
    }

    pub fn is_encrypted(&self) -> bool {
        self.0.codec.is_some()
    }

    pub fn integrity(&self) -> Integrity {
        self.0.integrity.get()
    }

    /// Record that damaged content was found somewhere in the store.
    pub fn mark_data_damaged(&self) {
        let mut integrity = self.0.integrity.get();
        integrity.remove(Integrity::DATA);
        self.0.integrity.set(integrity);
    }

    #[cfg(test)]
    pub(crate) fn cached_bytes(&self) -> usize {
        self.0.cache.borrow().used()
    }
}

/// Decode a stored page in place. Page 1 keeps its salt in the clear, which is replaced with the
/// header string once the remainder is decoded.
pub(crate) fn decode_page(
    codec: &dyn PageCodec,
    number: u32,
    buf: &mut [u8],
) -> anyhow::Result<()> {
    if number == 1 {
        codec.decode(1, &mut buf[CIPHER_SALT_SIZE..])?;
        buf[..CIPHER_SALT_SIZE].copy_from_slice(&HEADER_STRING);
        return Ok(());
    }

    codec.decode(number, buf)
}

/// Encode a plain page in place, the inverse of [`decode_page`].
pub(crate) fn encode_page(
    codec: &dyn PageCodec,
    number: u32,
    salt: &[u8; CIPHER_SALT_SIZE],
    buf: &mut [u8],
) -> anyhow::Result<()> {
    if number == 1 {
        codec.encode(1, &mut buf[CIPHER_SALT_SIZE..])?;
        buf[..CIPHER_SALT_SIZE].copy_from_slice(salt);
        return Ok(());
    }

    codec.encode(number, buf)
}
