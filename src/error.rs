use std::collections::TryReserveError;

use thiserror::Error;

use crate::{header::HeaderError, pager::wal::WalError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure raised while reading, crawling or snapshotting a database.
#[derive(Debug, Error)]
pub enum Error {
    /// A contract was violated by the caller, or a page was revisited while still being checked.
    #[error("misuse: {0}")]
    Misuse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Fewer bytes than a full page could be read for the requested page.
    #[error("short read of page {page} (expected {expected} bytes, found {found})")]
    ShortRead {
        page: u32,
        expected: usize,
        found: usize,
    },

    /// Structural violation localised to a single page or cell.
    #[error("page {page} is damaged: {reason}")]
    Damaged { page: u32, reason: String },

    /// Structural violation of a file level element, such as the header or a material.
    #[error("{element} is corrupted")]
    Corrupt { element: String },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("unable to allocate memory")]
    NoMemory,

    /// A backup lock could not be acquired or released.
    #[error("backup lock failed: {0}")]
    Lock(#[source] anyhow::Error),

    /// The caller supplied destination failed to execute a statement.
    #[error("destination failed: {0}")]
    Destination(#[source] anyhow::Error),
}

impl Error {
    pub fn damaged(page: u32, reason: impl Into<String>) -> Self {
        Self::Damaged {
            page,
            reason: reason.into(),
        }
    }

    pub fn corrupt(element: impl Into<String>) -> Self {
        Self::Corrupt {
            element: element.into(),
        }
    }

    /// Whether the error is confined to one page or row, so the surrounding crawl may carry on
    /// with sibling pages.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Damaged { .. } | Self::Corrupt { .. })
    }
}

impl From<HeaderError> for Error {
    fn from(error: HeaderError) -> Self {
        Self::corrupt(format!("header ({error})"))
    }
}

impl From<WalError> for Error {
    fn from(error: WalError) -> Self {
        match error {
            WalError::Io(e) => Self::Io(e),
            e => Self::corrupt(format!("wal ({e})")),
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::NoMemory
    }
}
