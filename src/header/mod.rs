//! The 100 byte file header found at the start of page 1.
//!
//! Unlike a regular reader, nothing in the header is trusted. [`SqliteHeader`] accepts any bytes,
//! and [`SqliteHeader::validate`] reports what is wrong so that the caller can fall back to
//! defaults and keep going.

mod page_size;

use assert_layout::assert_layout;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, big_endian::*};

pub use self::page_size::{PageSize, PageSizeError};

/// Expected size of the file header in bytes.
pub const SQLITE_HEADER_SIZE: usize = 100;

/// String expected to be present at the beginning of the header.
pub const HEADER_STRING: [u8; 16] = *b"SQLite format 3\0";

/// Header of a database file, as raw on-disk bytes.
#[derive(Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[assert_layout(size = SQLITE_HEADER_SIZE)]
#[repr(C)]
pub struct SqliteHeader {
    /// The header string.
    #[assert_layout(offset = 0, size = 16)]
    header_string: [u8; HEADER_STRING.len()],
    /// Size of each page.
    #[assert_layout(offset = 16, size = 2)]
    page_size: U16,
    /// File format write version.
    #[assert_layout(offset = 18, size = 1)]
    file_format_write_version: u8,
    /// File format read version.
    #[assert_layout(offset = 19, size = 1)]
    file_format_read_version: u8,
    /// Number of bytes for reserved space at the end of each page.
    #[assert_layout(offset = 20, size = 1)]
    reserved_bytes: u8,
    /// Maximum embedded payload fraction.
    #[assert_layout(offset = 21, size = 1)]
    max_payload_fraction: u8,
    /// Minimum embedded payload fraction.
    #[assert_layout(offset = 22, size = 1)]
    min_payload_fraction: u8,
    /// Leaf payload fraction.
    #[assert_layout(offset = 23, size = 1)]
    leaf_payload_fraction: u8,
    /// File change counter.
    #[assert_layout(offset = 24, size = 4)]
    file_change_counter: U32,
    /// Number of pages in the database.
    #[assert_layout(offset = 28, size = 4)]
    page_count: U32,
    /// Page number of the first freelist trunk page.
    #[assert_layout(offset = 32, size = 4)]
    freelist_trunk_page: U32,
    /// Total number of freelist pages.
    #[assert_layout(offset = 36, size = 4)]
    freelist_page_count: U32,
    /// Schema cookie.
    #[assert_layout(offset = 40, size = 4)]
    schema_cookie: U32,
    /// Schema format number.
    #[assert_layout(offset = 44, size = 4)]
    schema_format: U32,
    /// Default page cache size.
    #[assert_layout(offset = 48, size = 4)]
    default_page_cache_size: U32,
    /// Page number of the largest root b-tree page.
    #[assert_layout(offset = 52, size = 4)]
    largest_root_btree_page: U32,
    /// Text encoding.
    #[assert_layout(offset = 56, size = 4)]
    text_encoding: U32,
    /// User version as per `user_version_pragma`.
    #[assert_layout(offset = 60, size = 4)]
    user_version: U32,
    /// Non-zero for incremental-vacuum mode.
    #[assert_layout(offset = 64, size = 4)]
    incremental_vacuum_mode: U32,
    /// Application ID as per `PRAGMA application_id`.
    #[assert_layout(offset = 68, size = 4)]
    application_id: U32,
    /// Reserved for expansion.
    #[assert_layout(offset = 72, size = 20)]
    reserved: [u8; 20],
    /// `version-valid-for` number.
    #[assert_layout(offset = 92, size = 4)]
    version_valid_for: U32,
    /// SQLite version number.
    #[assert_layout(offset = 96, size = 4)]
    sqlite_version_number: U32,
}

impl SqliteHeader {
    /// Interpret the start of the provided buffer as a header. Only fails if the buffer is too
    /// short, use [`Self::validate`] to check the contents.
    pub fn read(buf: &[u8]) -> Result<&Self, HeaderError> {
        SqliteHeader::ref_from_prefix(buf)
            .map(|(header, _)| header)
            .map_err(|_| HeaderError::Size(buf.len()))
    }

    /// Check the fields required to locate and decode pages, producing the page size.
    pub fn validate(&self) -> Result<PageSize, HeaderError> {
        if self.header_string != HEADER_STRING {
            return Err(HeaderError::HeaderString(self.header_string));
        }

        let page_size = PageSize::from_stored(self.page_size.get())?;

        for (field, expected, found) in [
            ("max_payload_fraction", 64, self.max_payload_fraction),
            ("min_payload_fraction", 32, self.min_payload_fraction),
            ("leaf_payload_fraction", 32, self.leaf_payload_fraction),
        ] {
            if expected != found {
                return Err(HeaderError::PayloadFraction {
                    field,
                    expected,
                    found,
                });
            }
        }

        if *page_size < self.reserved_bytes as u32 + 480 {
            return Err(HeaderError::ReservedBytes(self.reserved_bytes));
        }

        Ok(page_size)
    }

    /// Raw page size field, before validation.
    pub fn stored_page_size(&self) -> u16 {
        self.page_size.get()
    }

    pub fn reserved_bytes(&self) -> u8 {
        self.reserved_bytes
    }

    pub fn file_change_counter(&self) -> u32 {
        self.file_change_counter.get()
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }

    pub fn freelist_trunk_page(&self) -> u32 {
        self.freelist_trunk_page.get()
    }

    pub fn freelist_page_count(&self) -> u32 {
        self.freelist_page_count.get()
    }

    pub fn schema_cookie(&self) -> u32 {
        self.schema_cookie.get()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("invalid header string (expected '{HEADER_STRING:?}', found '{0:?}')")]
    HeaderString([u8; 16]),
    #[error(transparent)]
    PageSize(#[from] PageSizeError),
    #[error("invalid const value for {field} (expected {expected}, found {found})")]
    PayloadFraction {
        field: &'static str,
        expected: u8,
        found: u8,
    },
    #[error("reserved bytes leave too little usable space (found {0})")]
    ReservedBytes(u8),
    #[error("header requires {SQLITE_HEADER_SIZE} bytes (found {0})")]
    Size(usize),
}
