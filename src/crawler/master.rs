//! Discovery of the objects described by the master table on page 1.

use log::{debug, warn};

use super::{
    CrawlObserver, CrawlStats, Crawler, PageStatus,
    sequence::{SequenceCrawlObserver, SequenceCrawler},
};
use crate::{
    error::{Error, Result},
    page::{
        Page,
        cell::{Cell, Value},
    },
};

/// Root page of the master table.
pub const MASTER_ROOT: u32 = 1;
/// Table holding the last value handed out for every `AUTOINCREMENT` table.
pub const SEQUENCE_TABLE: &str = "sqlite_sequence";

/// Objects whose names start with this prefix belong to the engine itself.
const RESERVED_PREFIX: &[u8] = b"sqlite_";

pub fn is_reserved_name(name: &str) -> bool {
    name.as_bytes()
        .get(..RESERVED_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(RESERVED_PREFIX))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    Index,
    View,
    Trigger,
}

impl ObjectKind {
    fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "table" => Self::Table,
            "index" => Self::Index,
            "view" => Self::View,
            "trigger" => Self::Trigger,
            _ => return None,
        })
    }
}

/// One row of the master table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterEntry {
    pub kind: ObjectKind,
    pub name: String,
    /// Table the object belongs to, the object itself for tables.
    pub table_name: String,
    /// Zero for objects without a B-tree, such as views and triggers.
    pub root_page: u32,
    pub sql: String,
}

impl MasterEntry {
    /// Interpret a master table row. Rows without SQL, such as automatic indexes, produce
    /// [`None`].
    pub fn from_cell(cell: &Cell) -> Result<Option<Self>> {
        let damaged = |reason: &str| Error::damaged(cell.page, format!("master row {reason}"));

        if cell.values.len() < 5 {
            return Err(damaged("has too few columns"));
        }
        if cell.values[4].is_null() {
            return Ok(None);
        }

        let kind = cell
            .text(0)
            .and_then(ObjectKind::parse)
            .ok_or_else(|| damaged("has an unknown type"))?;
        let name = cell.text(1).ok_or_else(|| damaged("has no name"))?;
        let table_name = cell.text(2).ok_or_else(|| damaged("has no table name"))?;
        let root_page = match cell.values[3] {
            Value::Integer(root) => {
                u32::try_from(root).map_err(|_| damaged("has an invalid root page"))?
            }
            Value::Null => 0,
            _ => return Err(damaged("has an invalid root page")),
        };
        let sql = cell.text(4).ok_or_else(|| damaged("has no sql"))?;

        if name.is_empty() || table_name.is_empty() || sql.is_empty() {
            return Err(damaged("has an empty field"));
        }

        Ok(Some(Self {
            kind,
            name: name.to_string(),
            table_name: table_name.to_string(),
            root_page,
            sql: sql.to_string(),
        }))
    }

    pub fn is_table(&self) -> bool {
        self.kind == ObjectKind::Table && self.name == self.table_name
    }
}

pub trait MasterCrawlObserver {
    /// Every object of the schema other than the engine's own.
    fn on_master_entry(&mut self, entry: MasterEntry) -> Result<()>;

    /// Every page of the master table, as it is visited.
    fn on_master_page(&mut self, _page: &Page) {}

    /// Polled before every page of the master table.
    fn is_suspended(&self) -> bool {
        false
    }
}

/// Outcome of a schema crawl.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchemaSummary {
    /// Root of the sequence table, zero when the schema has none.
    pub sequence_root: u32,
    pub stats: CrawlStats,
}

/// Crawls the master table, followed by the sequence table when the schema has one.
pub struct SchemaCrawler<'a> {
    crawler: &'a mut Crawler,
}

impl<'a> SchemaCrawler<'a> {
    pub fn new(crawler: &'a mut Crawler) -> Self {
        Self { crawler }
    }

    /// Fails when page 1 cannot be read as a table page at all, as nothing of the schema can
    /// then be recovered.
    pub fn crawl<O>(&mut self, observer: &mut O) -> Result<SchemaSummary>
    where
        O: MasterCrawlObserver + SequenceCrawlObserver,
    {
        let mut adapter = MasterAdapter {
            observer: &mut *observer,
            sequence_root: None,
        };
        let stats = self.crawler.crawl(MASTER_ROOT, &mut adapter)?;
        let sequence_root = adapter.sequence_root;

        if self.crawler.status(MASTER_ROOT) == PageStatus::Damaged {
            return Err(Error::corrupt("schema"));
        }

        if let Some(root) = sequence_root {
            debug!("crawling sequence table at page {root}");
            SequenceCrawler::new(self.crawler).crawl(root, observer)?;
        }

        Ok(SchemaSummary {
            sequence_root: sequence_root.unwrap_or(0),
            stats,
        })
    }
}

struct MasterAdapter<'o, O> {
    observer: &'o mut O,
    sequence_root: Option<u32>,
}

impl<O: MasterCrawlObserver> CrawlObserver for MasterAdapter<'_, O> {
    fn will_crawl_page(&mut self, page: &Page, _height: u32) -> Result<bool> {
        self.observer.on_master_page(page);
        Ok(true)
    }

    fn on_cell_crawled(&mut self, cell: Cell) -> Result<()> {
        let entry = match MasterEntry::from_cell(&cell) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("skipping master row {}: {e}", cell.rowid);
                return Ok(());
            }
        };

        if entry.is_table() && entry.name == SEQUENCE_TABLE {
            self.sequence_root = Some(entry.root_page);
            return Ok(());
        }
        if is_reserved_name(&entry.name) || is_reserved_name(&entry.table_name) {
            debug!("skipping reserved object {}", entry.name);
            return Ok(());
        }

        self.observer.on_master_entry(entry)
    }

    fn is_suspended(&self) -> bool {
        MasterCrawlObserver::is_suspended(&*self.observer)
    }
}
