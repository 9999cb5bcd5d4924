//! Rebuilding a damaged database by replaying every row that can still be decoded into a fresh
//! destination.

use std::{fmt::Debug, path::Path, rc::Rc};

use log::{debug, info, warn};

use crate::{
    assembler::{AssembleConfig, Assembler, Destination, TableReport},
    cipher::CipherDelegate,
    crawler::{
        CancelHandle, CrawlObserver, CrawlStats, Crawler,
        master::{MasterCrawlObserver, MasterEntry, SchemaCrawler, is_reserved_name},
        sequence::{SequenceCrawlObserver, SequenceEntry},
    },
    error::{Error, Result},
    page::{Page, cell::Cell},
    pager::{Integrity, PageStore, PageStoreConfig},
};

/// Predicate deciding whether a table takes part, by name.
pub type TableFilter = Box<dyn Fn(&str) -> bool>;

#[derive(Default)]
pub struct RepairConfig {
    pub store: PageStoreConfig,
    pub assemble: AssembleConfig,
    /// Tables rejected by the filter are skipped, along with their indexes and triggers.
    pub filter: Option<TableFilter>,
    pub cipher: Option<Rc<dyn CipherDelegate>>,
}

impl Debug for RepairConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairConfig")
            .field("store", &self.store)
            .field("assemble", &self.assemble)
            .field("filter", &self.filter.is_some())
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

impl RepairConfig {
    pub(crate) fn open_store(&self, path: &Path) -> Result<PageStore> {
        PageStore::open_with_cipher(path, self.store.clone(), self.cipher.as_deref())
    }
}

pub(crate) fn accepts(filter: Option<&TableFilter>, table: &str) -> bool {
    filter.is_none_or(|filter| filter(table))
}

/// Outcome of a repair.
#[derive(Clone, Debug, PartialEq)]
pub struct RepairReport {
    pub tables: Vec<TableReport>,
    pub integrity: Integrity,
    pub pages_damaged: usize,
    pub cells_damaged: usize,
    /// Fraction of the rows found that made it into the destination.
    pub score: f64,
}

impl RepairReport {
    pub fn recovered(&self) -> usize {
        self.tables.iter().map(|t| t.recovered).sum()
    }

    pub fn failed(&self) -> usize {
        self.tables.iter().map(|t| t.failed).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Objects of the source schema that take part in a repair or a backup.
#[derive(Debug, Default)]
pub(crate) struct SchemaPlan {
    pub tables: Vec<MasterEntry>,
    /// Indexes, triggers and views of the planned tables.
    pub associated: Vec<MasterEntry>,
    pub sequences: Vec<SequenceEntry>,
    /// Root of the sequence table, zero when the schema has none.
    pub sequence_root: u32,
    /// Pages of the master and sequence tables.
    pub pages: Vec<u32>,
}

pub(crate) struct SchemaCollector<'c> {
    filter: Option<&'c TableFilter>,
    suspended: Option<&'c dyn Fn() -> bool>,
    plan: SchemaPlan,
}

impl<'c> SchemaCollector<'c> {
    pub fn new(filter: Option<&'c TableFilter>) -> Self {
        Self {
            filter,
            suspended: None,
            plan: SchemaPlan::default(),
        }
    }

    /// Stop the schema crawl with [`Error::Cancelled`] once `suspended` holds.
    pub fn with_suspension(mut self, suspended: &'c dyn Fn() -> bool) -> Self {
        self.suspended = Some(suspended);
        self
    }

    /// Crawl the schema of the store behind `crawler`.
    pub fn crawl(mut self, crawler: &mut Crawler) -> Result<SchemaPlan> {
        let summary = SchemaCrawler::new(crawler).crawl(&mut self)?;

        let mut plan = self.plan;
        plan.sequence_root = summary.sequence_root;
        info!(
            "discovered {} tables and {} associated objects",
            plan.tables.len(),
            plan.associated.len()
        );
        Ok(plan)
    }
}

impl MasterCrawlObserver for SchemaCollector<'_> {
    fn on_master_entry(&mut self, entry: MasterEntry) -> Result<()> {
        if !accepts(self.filter, &entry.table_name) {
            debug!("{} is filtered out", entry.name);
            return Ok(());
        }

        if entry.is_table() {
            self.plan.tables.push(entry);
        } else {
            self.plan.associated.push(entry);
        }
        Ok(())
    }

    fn on_master_page(&mut self, page: &Page) {
        self.plan.pages.push(page.number());
    }

    fn is_suspended(&self) -> bool {
        self.suspended.is_some_and(|suspended| suspended())
    }
}

impl SequenceCrawlObserver for SchemaCollector<'_> {
    fn on_sequence(&mut self, entry: SequenceEntry) -> Result<()> {
        if entry.seq > 0 && !is_reserved_name(&entry.name) && accepts(self.filter, &entry.name) {
            self.plan.sequences.push(entry);
        }
        Ok(())
    }

    fn on_sequence_page(&mut self, page: &Page) {
        self.plan.pages.push(page.number());
    }

    fn is_suspended(&self) -> bool {
        self.suspended.is_some_and(|suspended| suspended())
    }
}

/// Feeds every crawled row of one table into the assembler.
struct ReplayObserver<'a, D> {
    assembler: &'a mut Assembler<D>,
}

impl<D: Destination> CrawlObserver for ReplayObserver<'_, D> {
    fn on_cell_crawled(&mut self, cell: Cell) -> Result<()> {
        self.assembler.assemble_cell(&cell).map(|_| ())
    }

    fn on_cell_damaged(&mut self, _page_no: u32, _error: &Error) {
        self.assembler.mark_cell_failed();
    }

    fn on_page_damaged(&mut self, _page_no: u32, _error: &Error) {
        self.assembler.mark_cell_failed();
    }
}

/// Create every planned table in the destination and replay its rows, followed by the
/// associated objects and sequences.
pub(crate) fn replay_schema<D: Destination>(
    crawler: &mut Crawler,
    assembler: &mut Assembler<D>,
    plan: &SchemaPlan,
) -> Result<CrawlStats> {
    let mut totals = CrawlStats::default();

    for table in &plan.tables {
        if let Err(e) = assembler.assemble_table(&table.name, &table.sql) {
            match e {
                Error::Destination(e) => {
                    warn!("unable to create table {}: {e:#}", table.name);
                    continue;
                }
                e => return Err(e),
            }
        }

        if table.root_page == 0 {
            debug!("table {} has no b-tree", table.name);
            continue;
        }

        let mut observer = ReplayObserver {
            assembler: &mut *assembler,
        };
        let stats = match crawler.crawl(table.root_page, &mut observer) {
            Ok(stats) => stats,
            Err(Error::Cancelled) => {
                assembler.cancel()?;
                return Err(Error::Cancelled);
            }
            Err(e @ (Error::Misuse(_) | Error::ShortRead { .. })) => {
                warn!("abandoning table {}: {e}", table.name);
                assembler.mark_cell_failed();
                continue;
            }
            Err(e) => return Err(e),
        };

        totals.pages_checked += stats.pages_checked;
        totals.pages_damaged += stats.pages_damaged;
        totals.cells_crawled += stats.cells_crawled;
        totals.cells_damaged += stats.cells_damaged;
    }
    assembler.finish_table()?;

    for entry in &plan.associated {
        assembler.assemble_associated(&entry.sql);
    }

    for sequence in &plan.sequences {
        if !plan.tables.iter().any(|t| t.name == sequence.name) {
            continue;
        }
        if let Err(e) = assembler.assemble_sequence(&sequence.name, sequence.seq) {
            warn!("unable to restore sequence of {}: {e}", sequence.name);
        }
    }

    Ok(totals)
}

/// Repair of one source database.
#[derive(Debug)]
pub struct Repair {
    config: RepairConfig,
    cancel: CancelHandle,
}

impl Repair {
    pub fn new(config: RepairConfig) -> Self {
        Self {
            config,
            cancel: CancelHandle::default(),
        }
    }

    /// Handle stopping the repair at the next page boundary. Rows of the table being replayed are
    /// rolled back, tables already replayed are kept.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Replay every recoverable row of `source` into `destination`.
    ///
    /// Fails when the schema cannot be read, or when rows were found but none of them could be
    /// replayed.
    pub fn run<D: Destination>(
        &self,
        source: impl AsRef<Path>,
        destination: D,
    ) -> Result<(RepairReport, D)> {
        let source = source.as_ref();
        info!("repairing {}", source.display());

        let store = self.config.open_store(source)?;
        let mut crawler = Crawler::new(store.clone()).with_cancel_handle(self.cancel.clone());
        let plan = SchemaCollector::new(self.config.filter.as_ref()).crawl(&mut crawler)?;

        let mut assembler = Assembler::new(destination, self.config.assemble.clone());
        let stats = replay_schema(&mut crawler, &mut assembler, &plan)?;
        let (tables, destination) = assembler.finish()?;

        let recovered = tables.iter().map(|t| t.recovered).sum::<usize>();
        let failed = tables.iter().map(|t| t.failed).sum::<usize>();
        if recovered == 0 && failed > 0 {
            return Err(Error::corrupt("recoverable content"));
        }

        let report = RepairReport {
            tables,
            integrity: store.integrity(),
            pages_damaged: stats.pages_damaged,
            cells_damaged: stats.cells_damaged,
            score: match recovered + failed {
                0 => 1.0,
                total => recovered as f64 / total as f64,
            },
        };
        info!(
            "repaired {}: {recovered} rows recovered, {failed} failed, integrity {:#05b}",
            source.display(),
            report.integrity.bits()
        );
        Ok((report, destination))
    }
}

/// Replay every recoverable row of `source` into `destination`, see [`Repair::run`].
pub fn repair<D: Destination>(
    source: impl AsRef<Path>,
    destination: D,
    config: RepairConfig,
) -> Result<(RepairReport, D)> {
    Repair::new(config).run(source, destination)
}

#[cfg(test)]
mod test {
    use rusqlite::Connection;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        assembler::SqliteDestination,
        crawler::master::test::{first_page, master_cell, row_cell, store_with_schema},
        page::{Page, PageType, test::btree_page},
    };

    fn no_wal() -> RepairConfig {
        RepairConfig {
            store: PageStoreConfig {
                wal: None,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn destination() -> SqliteDestination {
        SqliteDestination::new(Connection::open_in_memory().unwrap())
    }

    /// `notes` on page 2, `tags` on page 3, and an index on `notes`.
    fn two_tables(dir: &TempDir, tags: Page) -> std::path::PathBuf {
        let master = first_page(&[
            master_cell(
                1,
                "table",
                "notes",
                "notes",
                2,
                Some("CREATE TABLE notes(id INTEGER PRIMARY KEY, body TEXT NOT NULL)"),
            ),
            master_cell(2, "table", "tags", "tags", 3, Some("CREATE TABLE tags(name TEXT)")),
            master_cell(
                3,
                "index",
                "notes_body",
                "notes",
                4,
                Some("CREATE INDEX notes_body ON notes(body)"),
            ),
        ]);
        let notes = btree_page(
            2,
            512,
            PageType::LeafTable,
            None,
            &[
                row_cell(1, &[None, Some("first")], &[]),
                row_cell(2, &[None, Some("second")], &[]),
                row_cell(3, &[None, None], &[]),
            ],
        );
        let index = btree_page(4, 512, PageType::LeafIndex, None, &[]);
        store_with_schema(dir, master, vec![notes, tags, index])
            .path()
            .to_path_buf()
    }

    #[test]
    fn replays_rows_and_indexes() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let tags = btree_page(
            3,
            512,
            PageType::LeafTable,
            None,
            &[row_cell(9, &[Some("red")], &[])],
        );
        let source = two_tables(&dir, tags);

        let (report, destination) = repair(&source, destination(), no_wal()).unwrap();

        let notes = report.table("notes").unwrap();
        assert_eq!((notes.recovered, notes.failed), (2, 1));
        assert_eq!(report.recovered(), 3);
        assert_eq!(report.score, 0.75);
        assert!(report.integrity.contains(Integrity::HEADER | Integrity::DATA));

        let connection = destination.into_inner();
        let bodies = connection
            .prepare("SELECT id, body FROM notes ORDER BY id")
            .unwrap()
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(bodies, vec![(1, "first".into()), (2, "second".into())]);

        let index: i64 = connection
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'notes_body'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn damaged_table_is_contained() {
        let dir = TempDir::new().unwrap();
        let source = two_tables(&dir, Page::new(3, vec![0; 512].into()));

        let (report, _) = repair(&source, destination(), no_wal()).unwrap();

        assert_eq!(report.table("notes").unwrap().recovered, 2);
        let tags = report.table("tags").unwrap();
        assert_eq!((tags.recovered, tags.failed), (0, 1));
        assert_eq!(report.pages_damaged, 1);
        assert!(!report.integrity.contains(Integrity::DATA));
    }

    #[test]
    fn filter_skips_tables() {
        let dir = TempDir::new().unwrap();
        let tags = btree_page(
            3,
            512,
            PageType::LeafTable,
            None,
            &[row_cell(9, &[Some("red")], &[])],
        );
        let source = two_tables(&dir, tags);

        let config = RepairConfig {
            filter: Some(Box::new(|table| table != "notes")),
            ..no_wal()
        };
        let (report, destination) = repair(&source, destination(), config).unwrap();

        assert_eq!(report.tables.len(), 1);
        assert_eq!(report.tables[0].name, "tags");
        let objects: i64 = destination
            .connection()
            .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))
            .unwrap();
        assert_eq!(objects, 1);
    }

    #[test]
    fn nothing_recovered_is_an_error() {
        let dir = TempDir::new().unwrap();
        let master = first_page(&[master_cell(
            1,
            "table",
            "t",
            "t",
            2,
            Some("CREATE TABLE t(a)"),
        )]);
        let path = store_with_schema(&dir, master, vec![Page::new(2, vec![0; 512].into())])
            .path()
            .to_path_buf();

        let result = repair(&path, destination(), no_wal());
        assert!(matches!(result, Err(Error::Corrupt { .. })));
    }

    #[test]
    fn cancelled_repair() {
        let dir = TempDir::new().unwrap();
        let tags = btree_page(3, 512, PageType::LeafTable, None, &[]);
        let source = two_tables(&dir, tags);

        let repair = Repair::new(no_wal());
        repair.cancel_handle().cancel();
        let result = repair.run(&source, destination());

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
