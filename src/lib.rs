//! Salvage of damaged SQLite databases.
//!
//! Two ways back to a usable database are offered. [`repair`] walks every table B-tree of the
//! source without trusting any of it, replaying the rows it can still decode into a fresh
//! [`Destination`]. [`Backup`] takes a [`Material`] of a healthy database ahead of time, recording
//! its schema and a hash of every table leaf, which [`restore`] later uses to recover rows that
//! are no longer reachable from the schema.

pub mod assembler;
pub mod backup;
pub mod cipher;
pub mod crawler;
pub mod error;
pub mod header;
pub mod material;
pub mod page;
pub mod pager;
pub mod repair;
pub mod restore;
pub mod varint;

pub use self::{
    assembler::{AssembleConfig, Assembler, Destination, SqliteDestination, TableReport},
    backup::{Backup, BackupConfig, BackupExclusiveDelegate, BackupSharedDelegate, NoopLock},
    cipher::{CipherDelegate, PageCodec},
    crawler::{
        CancelHandle, CrawlObserver, CrawlStats, Crawler, PageStatus,
        master::{MasterCrawlObserver, MasterEntry, SchemaCrawler},
        sequence::{SequenceCrawlObserver, SequenceCrawler, SequenceEntry},
    },
    error::{Error, Result},
    material::{
        Content, Material, MaterialInfo, VerifiedPage,
        incremental::{IncrementalInfo, IncrementalMaterial, IncrementalPage},
    },
    page::{
        Page, PageType,
        cell::{Cell, RecordDecoder, Value},
    },
    pager::{Integrity, PageStore, PageStoreConfig, wal::WalOptions},
    repair::{Repair, RepairConfig, RepairReport, TableFilter, repair},
    restore::{Restore, RestoreReport, restore},
};
