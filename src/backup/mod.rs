//! Snapshots of a live database, full or incremental.
//!
//! A full backup crawls every table and hashes every leaf page it reaches. An incremental backup
//! starts from the previous [`Material`] and only re-verifies the pages recorded as changed in an
//! [`IncrementalMaterial`], which is kept up to date by [`Backup::track_wal_changes`] while the
//! database is written to.
//!
//! Against a live database, the exclusive lock is only held while the WAL and its index are read,
//! the crawl itself runs under the shared lock.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    path::{Path, PathBuf},
    rc::Rc,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};

use crate::{
    cipher::CipherDelegate,
    crawler::{
        CrawlObserver, Crawler,
        master::MASTER_ROOT,
        sequence::{SequenceCrawlObserver, SequenceCrawler, SequenceEntry},
    },
    error::{Error, Result},
    material::{
        Material, UNKNOWN_PAGE_NO, VerifiedPage,
        incremental::{IncrementalMaterial, IncrementalPage},
    },
    page::{Page, PageType, cell::Cell},
    pager::{
        Integrity, PageStore, PageStoreConfig,
        wal::{WalOptions, WalPosition},
    },
    repair::{SchemaCollector, SchemaPlan, TableFilter, accepts},
};

/// Lock preventing checkpoints, and so truncation of the WAL, while pages are crawled.
pub trait BackupSharedDelegate {
    fn acquire_shared_lock(&self) -> anyhow::Result<()>;

    fn release_shared_lock(&self) -> anyhow::Result<()>;
}

/// Lock preventing any write, held while the WAL and its index are read.
pub trait BackupExclusiveDelegate {
    fn acquire_exclusive_lock(&self) -> anyhow::Result<()>;

    fn release_exclusive_lock(&self) -> anyhow::Result<()>;

    /// Polled at every page. Stops the backup with [`Error::Cancelled`] when set, for example
    /// because a writer is waiting.
    fn backup_suspended(&self) -> bool {
        false
    }
}

/// Locks for a database nothing else accesses.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLock;

impl BackupSharedDelegate for NoopLock {
    fn acquire_shared_lock(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn release_shared_lock(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl BackupExclusiveDelegate for NoopLock {
    fn acquire_exclusive_lock(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn release_exclusive_lock(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct BackupConfig {
    /// Incremental backups in a row before a full one is forced.
    pub max_incremental_times: i32,
    /// Options for the store. The WAL options are decided by the backup itself.
    pub store: PageStoreConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_incremental_times: 1000,
            store: PageStoreConfig::default(),
        }
    }
}

pub struct Backup {
    path: PathBuf,
    config: BackupConfig,
    cipher: Option<Rc<dyn CipherDelegate>>,
    shared: Rc<dyn BackupSharedDelegate>,
    exclusive: Rc<dyn BackupExclusiveDelegate>,
    filter: Option<TableFilter>,
}

impl Debug for Backup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backup")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("cipher", &self.cipher.is_some())
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl Backup {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: BackupConfig::default(),
            cipher: None,
            shared: Rc::new(NoopLock),
            exclusive: Rc::new(NoopLock),
            filter: None,
        }
    }

    pub fn with_config(mut self, config: BackupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cipher(mut self, cipher: Rc<dyn CipherDelegate>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_shared_delegate(mut self, delegate: Rc<dyn BackupSharedDelegate>) -> Self {
        self.shared = delegate;
        self
    }

    pub fn with_exclusive_delegate(mut self, delegate: Rc<dyn BackupExclusiveDelegate>) -> Self {
        self.exclusive = delegate;
        self
    }

    /// Only back up the tables accepted by `filter`.
    pub fn filter(&mut self, filter: impl Fn(&str) -> bool + 'static) {
        self.filter = Some(Box::new(filter));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_store(&self, wal: Option<WalOptions>) -> Result<PageStore> {
        let config = PageStoreConfig {
            wal,
            ..self.config.store.clone()
        };
        PageStore::open_with_cipher(&self.path, config, self.cipher.as_deref())
    }

    fn exclusively<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.exclusive
            .acquire_exclusive_lock()
            .map_err(Error::Lock)?;
        let result = f();
        let released = self
            .exclusive
            .release_exclusive_lock()
            .map_err(Error::Lock);

        let value = result?;
        released?;
        Ok(value)
    }

    fn shared<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.shared.acquire_shared_lock().map_err(Error::Lock)?;
        let result = f();
        let released = self.shared.release_shared_lock().map_err(Error::Lock);

        let value = result?;
        released?;
        Ok(value)
    }

    /// Snapshot the database.
    ///
    /// The snapshot is incremental when `previous` and `incremental` describe the same WAL
    /// position and the incremental limit has not been reached, otherwise it is a full one. The
    /// produced incremental material is reset to the position of the produced material.
    pub fn backup(
        &self,
        previous: Option<Material>,
        incremental: Option<&IncrementalMaterial>,
    ) -> Result<(Material, IncrementalMaterial)> {
        let base = match (previous, incremental) {
            (Some(material), Some(incremental))
                if incremental.info.incremental_backup_times
                    < self.config.max_incremental_times =>
            {
                if material.info.wal_salt == incremental.info.last_wal_salt
                    && material.info.n_backfill == incremental.info.last_n_backfill
                {
                    Some(material)
                } else {
                    warn!(
                        "material of {} at {:?}/{} does not match incremental material at {:?}/{}, \
                         falling back to a full backup",
                        self.path.display(),
                        material.info.wal_salt,
                        material.info.n_backfill,
                        incremental.info.last_wal_salt,
                        incremental.info.last_n_backfill
                    );
                    None
                }
            }
            _ => None,
        };

        match (base, incremental) {
            (Some(material), Some(incremental)) => {
                info!("incremental backup of {}", self.path.display());
                let (material, store) = self.incremental_backup(material, incremental)?;
                Ok(self.update_material(material, &store, Some(incremental)))
            }
            _ => {
                info!("full backup of {}", self.path.display());
                let (material, store) = self.full_backup()?;
                Ok(self.update_material(material, &store, None))
            }
        }
    }

    fn full_backup(&self) -> Result<(Material, PageStore)> {
        let store = self.exclusively(|| self.open_store(Some(WalOptions::default())))?;

        let material = self.shared(|| {
            let mut crawler = Crawler::new(store.clone());
            let suspended = || self.exclusive.backup_suspended();
            let plan = SchemaCollector::new(self.filter.as_ref())
                .with_suspension(&suspended)
                .crawl(&mut crawler)?;
            ensure_schema_intact(&store)?;

            let mut material = Material::default();
            material.info.seq_table_root_page = plan.sequence_root;
            apply_schema(&mut material, &plan);

            for content in &mut material.contents {
                if content.root_page == 0 {
                    continue;
                }
                let mut verifier = LeafVerifier::new(self.exclusive.as_ref(), None);
                verifier.crawl(&mut crawler, content.root_page)?;
                content.verified_pages = verifier.verified;
            }
            Ok(material)
        })?;

        Ok((material, store))
    }

    fn incremental_backup(
        &self,
        mut material: Material,
        incremental: &IncrementalMaterial,
    ) -> Result<(Material, PageStore)> {
        // Changes were tracked out of the WAL, so the file itself is what gets verified.
        let store = self.open_store(None)?;
        let mut verifying = incremental.pages.clone();

        self.shared(|| {
            let mut crawler = Crawler::new(store.clone());

            if store.schema_cookie() != incremental.info.last_schema_cookie
                || material.info.seq_table_root_page == UNKNOWN_PAGE_NO
            {
                debug!("schema changed since the last backup, crawling it again");
                let options = WalOptions {
                    position: WalPosition {
                        salt: incremental.info.current_wal_salt,
                        n_backfill: incremental.info.current_n_backfill,
                    },
                    use_shm: true,
                };
                self.exclusively(|| store.load_wal(options))?;

                let suspended = || self.exclusive.backup_suspended();
                let plan = SchemaCollector::new(self.filter.as_ref())
                    .with_suspension(&suspended)
                    .crawl(&mut crawler)?;
                store.dispose_wal();
                ensure_schema_intact(&store)?;

                for page_no in &plan.pages {
                    verifying.remove(page_no);
                }
                material.info.seq_table_root_page = plan.sequence_root;

                let before = material.contents.len();
                material
                    .contents
                    .retain(|content| plan.tables.iter().any(|t| t.name == content.table_name));
                if material.contents.len() != before {
                    debug!("dropped {} tables", before - material.contents.len());
                }
                apply_schema(&mut material, &plan);

                // Tables were crawled with the WAL applied, so pages may be visited again.
                crawler.reset();
            } else {
                verifying.remove(&MASTER_ROOT);

                let root = material.info.seq_table_root_page;
                if root != 0 {
                    let mut sequences = SequenceUpdater {
                        material: &mut material,
                        filter: self.filter.as_ref(),
                        pages: Vec::new(),
                    };
                    SequenceCrawler::new(&mut crawler).crawl(root, &mut sequences)?;
                    for page_no in &sequences.pages {
                        verifying.remove(page_no);
                    }
                }
            }

            self.verify_changed_pages(&store, &mut crawler, &mut material, &mut verifying)
        })?;

        Ok((material, store))
    }

    /// Re-verify the tables owning a changed page, keeping every unchanged leaf as is.
    fn verify_changed_pages(
        &self,
        store: &PageStore,
        crawler: &mut Crawler,
        material: &mut Material,
        verifying: &mut BTreeMap<u32, IncrementalPage>,
    ) -> Result<()> {
        if verifying.is_empty() {
            return Ok(());
        }

        let page_count = store.page_count() as usize;
        let mut unchanged = vec![false; page_count];
        for content in &mut material.contents {
            for page in &mut content.verified_pages {
                if verifying.contains_key(&page.number) {
                    page.number = 0;
                } else if page.number != 0 && page.number as usize <= page_count {
                    unchanged[page.number as usize - 1] = true;
                }
            }
            content.verified_pages.retain(|page| page.number != 0);
        }

        verifying.retain(|_, page| {
            matches!(page.page_type, PageType::LeafTable | PageType::InteriorTable)
        });
        debug!("{} changed table pages to verify", verifying.len());

        for content in &mut material.contents {
            if verifying.is_empty() {
                break;
            }
            if content.root_page == 0 || content.root_page == UNKNOWN_PAGE_NO {
                continue;
            }

            let mut verifier = LeafVerifier::new(
                self.exclusive.as_ref(),
                Some(IncrementalCrawl {
                    verifying: &mut *verifying,
                    unchanged: &mut unchanged,
                }),
            );
            verifier.crawl(crawler, content.root_page)?;
            let verified = verifier.verified;

            // Unchanged leaves the crawl did not reach no longer belong to the table.
            content
                .verified_pages
                .retain(|page| !is_marked(&unchanged, page.number));
            content.verified_pages.extend(verified);
        }

        Ok(())
    }

    fn update_material(
        &self,
        mut material: Material,
        store: &PageStore,
        incremental: Option<&IncrementalMaterial>,
    ) -> (Material, IncrementalMaterial) {
        let mut updated = IncrementalMaterial::default();
        match incremental {
            Some(incremental) => {
                updated.info = incremental.info.clone();
                material.info.wal_salt = incremental.info.current_wal_salt;
                material.info.n_backfill = incremental.info.current_n_backfill;
            }
            None => {
                let wal = store.wal_info();
                material.info.wal_salt = wal.salt;
                material.info.n_backfill = wal.n_backfill;
                updated.info.last_checkpoint_finish = wal.n_backfill == wal.max_frame;
            }
        }
        material.info.page_size = store.page_size();
        material.info.reserved_bytes = store.reserved_bytes();

        let info = &mut updated.info;
        info.last_wal_salt = material.info.wal_salt;
        info.last_n_backfill = material.info.n_backfill;
        info.current_wal_salt = material.info.wal_salt;
        info.current_n_backfill = material.info.n_backfill;
        info.last_schema_cookie = store.schema_cookie();
        info.last_backup_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as u32)
            .unwrap_or_default();
        info.incremental_backup_times = match incremental {
            Some(_) => info.incremental_backup_times + 1,
            None => 0,
        };

        info!(
            "backed up {} tables of {}, {} pages verified",
            material.contents.len(),
            self.path.display(),
            material
                .contents
                .iter()
                .map(|c| c.verified_pages.len())
                .sum::<usize>()
        );
        (material, updated)
    }

    /// Record the pages written to the WAL since changes were last tracked, so that the next
    /// incremental backup only has to verify those. Pages whose latest image hashes the same as
    /// the leaf verified by `material` are left out.
    ///
    /// Must run before any checkpoint which may restart the WAL, as frames overwritten by the
    /// restart cannot be tracked anymore. Produces the number of pages recorded.
    pub fn track_wal_changes(
        &self,
        incremental: &mut IncrementalMaterial,
        material: &Material,
    ) -> Result<usize> {
        // Every committed frame of the current generation is read: pages tracked before simply
        // get their latest image recorded again.
        let options = WalOptions {
            position: WalPosition::default(),
            use_shm: false,
        };
        let store = self.exclusively(|| self.open_store(Some(options)))?;

        let mut recorded = 0;
        for page_no in store.wal_pages() {
            let page = match store.acquire_page(page_no) {
                Ok(page) => IncrementalPage {
                    number: page_no,
                    page_type: page.page_type(),
                    hash: Some(page.hash()),
                },
                Err(e) if e.is_local() => {
                    warn!("unable to read changed page {page_no}: {e}");
                    IncrementalPage {
                        number: page_no,
                        page_type: PageType::Unknown,
                        hash: None,
                    }
                }
                Err(e) => return Err(e),
            };

            if page.hash.is_some() && page.hash == material.verified_hash(page_no) {
                incremental.pages.remove(&page_no);
                continue;
            }
            incremental.insert(page);
            recorded += 1;
        }

        let wal = store.wal_info();
        incremental.info.current_wal_salt = wal.salt;
        incremental.info.current_n_backfill = wal.max_frame;
        debug!("tracked {recorded} changed pages up to wal frame {}", wal.max_frame);

        Ok(recorded)
    }
}

/// A backup of a database whose schema cannot be fully read would silently lose tables.
fn ensure_schema_intact(store: &PageStore) -> Result<()> {
    if !store.integrity().contains(Integrity::DATA) {
        return Err(Error::corrupt("schema"));
    }
    Ok(())
}

/// Bring the contents of `material` in line with the tables of `plan`, keeping the verified pages
/// of tables already present.
fn apply_schema(material: &mut Material, plan: &SchemaPlan) {
    for table in &plan.tables {
        let content = material.content_or_insert(&table.name);
        content.sql = table.sql.clone();
        content.root_page = table.root_page;
        content.associated_sqls.clear();
        content.sequence = 0;
    }

    for entry in &plan.associated {
        match material.content_mut(&entry.table_name) {
            Some(content) => content.associated_sqls.push(entry.sql.clone()),
            None => debug!("{} belongs to no backed up table", entry.name),
        }
    }

    for sequence in &plan.sequences {
        if let Some(content) = material.content_mut(&sequence.name) {
            content.sequence = content.sequence.max(sequence.seq);
        }
    }
}

fn is_marked(unchanged: &[bool], page_no: u32) -> bool {
    (page_no as usize)
        .checked_sub(1)
        .and_then(|index| unchanged.get(index))
        .copied()
        .unwrap_or(false)
}

/// Refreshes sequences of a material whose schema is unchanged.
struct SequenceUpdater<'m> {
    material: &'m mut Material,
    filter: Option<&'m TableFilter>,
    pages: Vec<u32>,
}

impl SequenceCrawlObserver for SequenceUpdater<'_> {
    fn on_sequence(&mut self, entry: SequenceEntry) -> Result<()> {
        if entry.seq == 0 || !accepts(self.filter, &entry.name) {
            return Ok(());
        }
        if let Some(content) = self.material.content_mut(&entry.name) {
            content.sequence = content.sequence.max(entry.seq);
        }
        Ok(())
    }

    fn on_sequence_page(&mut self, page: &Page) {
        self.pages.push(page.number());
    }
}

struct IncrementalCrawl<'v> {
    verifying: &'v mut BTreeMap<u32, IncrementalPage>,
    /// Leaves verified by the previous material and not changed since, by page number less one.
    unchanged: &'v mut [bool],
}

/// Hashes every leaf of a table without decoding its cells.
struct LeafVerifier<'v> {
    exclusive: &'v dyn BackupExclusiveDelegate,
    incremental: Option<IncrementalCrawl<'v>>,
    verified: Vec<VerifiedPage>,
    damaged: Option<Error>,
}

impl<'v> LeafVerifier<'v> {
    fn new(
        exclusive: &'v dyn BackupExclusiveDelegate,
        incremental: Option<IncrementalCrawl<'v>>,
    ) -> Self {
        Self {
            exclusive,
            incremental,
            verified: Vec::new(),
            damaged: None,
        }
    }

    /// Crawl the table at `root`. A backup is refused on the first damaged page.
    fn crawl(&mut self, crawler: &mut Crawler, root: u32) -> Result<()> {
        let result = crawler.crawl(root, self);
        if let Some(e) = self.damaged.take() {
            return Err(e);
        }
        result.map(|_| ())
    }
}

impl CrawlObserver for LeafVerifier<'_> {
    fn can_crawl_page(&mut self, page_no: u32) -> bool {
        let Some(incremental) = self.incremental.as_mut() else {
            return true;
        };

        if is_marked(incremental.unchanged, page_no) {
            incremental.unchanged[page_no as usize - 1] = false;
            return false;
        }

        match incremental.verifying.remove(&page_no) {
            Some(IncrementalPage {
                page_type: PageType::LeafTable,
                hash: Some(hash),
                ..
            }) => {
                self.verified.push(VerifiedPage::new(page_no, hash));
                false
            }
            _ => true,
        }
    }

    fn will_crawl_page(&mut self, page: &Page, _height: u32) -> Result<bool> {
        match page.page_type() {
            PageType::LeafTable => {
                self.verified.push(VerifiedPage::new(page.number(), page.hash()));
                Ok(false)
            }
            page_type => Ok(page_type == PageType::InteriorTable),
        }
    }

    fn on_cell_crawled(&mut self, _cell: Cell) -> Result<()> {
        Ok(())
    }

    fn on_page_damaged(&mut self, page_no: u32, error: &Error) {
        if self.damaged.is_none() {
            self.damaged = Some(Error::damaged(page_no, error.to_string()));
        }
    }

    fn is_suspended(&self) -> bool {
        self.damaged.is_some() || self.exclusive.backup_suspended()
    }
}
