//! Rebuilding a database from the snapshot taken by a backup.
//!
//! Leaves whose content still hashes as recorded in the [`Material`] are replayed first, using
//! the schema of the material, which lets rows be recovered even when the master table or the
//! interior pages of a table are lost. The rest of the database is then repaired as usual with
//! `INSERT OR IGNORE`, so that rows replayed from the material are kept.

use std::path::Path;

use log::{debug, info, warn};

use crate::{
    assembler::{AssembleConfig, Assembler, Destination, TableReport},
    crawler::{CancelHandle, Crawler},
    error::{Error, Result},
    material::{Content, Material},
    page::{PageType, cell::RecordDecoder},
    pager::{Integrity, PageStore},
    repair::{RepairConfig, SchemaCollector, accepts, replay_schema},
};

/// Outcome of a restore.
#[derive(Clone, Debug, PartialEq)]
pub struct RestoreReport {
    /// Rows per table, the better of the material and the full crawl.
    pub tables: Vec<TableReport>,
    pub integrity: Integrity,
    /// Pages recorded by the material for the restored tables.
    pub pages_verified: usize,
    /// Recorded pages still holding the content they were snapshotted with.
    pub pages_matched: usize,
    /// Estimate of the fraction of the database that was restored, between 0 and 1.
    pub score: f64,
}

impl RestoreReport {
    pub fn recovered(&self) -> usize {
        self.tables.iter().map(|t| t.recovered).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Progress of the material driven pass.
#[derive(Default)]
struct MaterialScore {
    pages: usize,
    matched: usize,
    /// Sum over the verified pages of the fraction of their rows replayed.
    replayed: f64,
}

impl MaterialScore {
    fn value(&self) -> Option<f64> {
        (self.pages > 0).then(|| self.replayed / self.pages as f64)
    }
}

/// Restore of one source database.
#[derive(Debug)]
pub struct Restore {
    config: RepairConfig,
    cancel: CancelHandle,
}

impl Restore {
    pub fn new(config: RepairConfig) -> Self {
        Self {
            config,
            cancel: CancelHandle::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// The store is read with the geometry recorded by the material, unless configured otherwise,
    /// as the header of the source may be lost.
    fn open_store(&self, source: &Path, material: &Material) -> Result<PageStore> {
        let mut store = self.config.store.clone();
        if store.page_size.is_none() && material.info.page_size != 0 {
            store.page_size = Some(material.info.page_size);
        }
        if store.reserved_bytes.is_none() {
            store.reserved_bytes = u8::try_from(material.info.reserved_bytes).ok();
        }

        let config = RepairConfig {
            store,
            assemble: self.config.assemble.clone(),
            filter: None,
            cipher: self.config.cipher.clone(),
        };
        config.open_store(source)
    }

    /// Replay every row of `source` into `destination`, starting with the leaves recorded by
    /// `material`.
    pub fn run<D: Destination>(
        &self,
        source: impl AsRef<Path>,
        material: &Material,
        destination: D,
    ) -> Result<(RestoreReport, D)> {
        let source = source.as_ref();
        info!(
            "restoring {} from a material of {} tables",
            source.display(),
            material.contents.len()
        );

        let store = self.open_store(source, material)?;
        let config = AssembleConfig {
            insert_or_ignore: true,
            ..self.config.assemble.clone()
        };
        let mut assembler = Assembler::new(destination, config);

        let material_score = self.replay_material(&store, material, &mut assembler)?;
        let material_tables = assembler.table_count();

        let mut crawler = Crawler::new(store.clone()).with_cancel_handle(self.cancel.clone());
        let schema = SchemaCollector::new(self.config.filter.as_ref()).crawl(&mut crawler);
        let crawl_tables = match schema {
            Ok(plan) => {
                replay_schema(&mut crawler, &mut assembler, &plan)?;
                Some(plan.tables.len())
            }
            Err(e) if e.is_local() && material_score.pages > 0 => {
                warn!(
                    "schema of {} is unreadable, keeping the material rows: {e}",
                    source.display()
                );
                None
            }
            Err(e) => return Err(e),
        };

        let (reports, destination) = assembler.finish()?;
        let (from_material, from_crawl) = reports.split_at(material_tables.min(reports.len()));

        let crawl_score = crawl_tables.map(|tables| match tables {
            0 => 1.0,
            tables => {
                from_crawl.iter().filter(|t| t.recovered > 0).count() as f64 / tables as f64
            }
        });
        let score = match (material_score.value(), crawl_score) {
            (Some(a), Some(b)) => a.max(b),
            (Some(score), None) | (None, Some(score)) => score,
            (None, None) => 1.0,
        };

        let report = RestoreReport {
            tables: merge_reports(from_material, from_crawl),
            integrity: store.integrity(),
            pages_verified: material_score.pages,
            pages_matched: material_score.matched,
            score: score.clamp(0.0, 1.0),
        };
        info!(
            "restored {}: {} rows, {}/{} verified pages matched, score {:.3}",
            source.display(),
            report.recovered(),
            report.pages_matched,
            report.pages_verified,
            report.score
        );
        Ok((report, destination))
    }

    fn replay_material<D: Destination>(
        &self,
        store: &PageStore,
        material: &Material,
        assembler: &mut Assembler<D>,
    ) -> Result<MaterialScore> {
        let decoder = RecordDecoder::new(store.clone());
        let mut score = MaterialScore::default();
        let mut restored = Vec::new();

        for content in &material.contents {
            if !accepts(self.config.filter.as_ref(), &content.table_name) {
                continue;
            }
            if let Err(e) = assembler.assemble_table(&content.table_name, &content.sql) {
                match e {
                    Error::Destination(e) => {
                        warn!("unable to create table {}: {e:#}", content.table_name);
                        continue;
                    }
                    e => return Err(e),
                }
            }

            for page in &content.verified_pages {
                if self.cancel.is_cancelled() {
                    assembler.cancel()?;
                    return Err(Error::Cancelled);
                }

                score.pages += 1;
                if let Some(replayed) =
                    replay_page(store, &decoder, assembler, page.number, page.hash)?
                {
                    score.matched += 1;
                    score.replayed += replayed;
                }
            }
            restored.push(content);
        }
        assembler.finish_table()?;

        for content in &restored {
            for sql in &content.associated_sqls {
                assembler.assemble_associated(sql);
            }
        }
        for content in restored.iter().filter(|c| c.sequence > 0) {
            restore_sequence(assembler, content);
        }

        Ok(score)
    }
}

/// Replay the rows of a leaf if it still hashes to `hash`, producing the fraction of its rows
/// replayed.
fn replay_page<D: Destination>(
    store: &PageStore,
    decoder: &RecordDecoder,
    assembler: &mut Assembler<D>,
    page_no: u32,
    hash: u32,
) -> Result<Option<f64>> {
    let page = match store.acquire_page(page_no) {
        Ok(page) => page,
        Err(e) if e.is_local() || matches!(e, Error::ShortRead { .. } | Error::Misuse(_)) => {
            warn!("verified page {page_no} is unreadable: {e}");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    if page.hash() != hash || page.page_type() != PageType::LeafTable {
        debug!("page {page_no} changed since the backup");
        return Ok(None);
    }

    let pointers = match page.cell_pointers(store.usable_size()) {
        Ok(pointers) => pointers,
        Err(e) => {
            warn!("verified page {page_no} is damaged: {e}");
            return Ok(Some(0.0));
        }
    };
    if pointers.is_empty() {
        return Ok(Some(1.0));
    }

    let mut replayed = 0;
    for &offset in &pointers {
        match decoder.decode_cell(&page, offset) {
            Ok(cell) => {
                if assembler.assemble_cell(&cell)? {
                    replayed += 1;
                }
            }
            Err(e) if e.is_local() => {
                warn!("damaged cell on verified page {page_no}: {e}");
                assembler.mark_cell_failed();
            }
            Err(e) => return Err(e),
        }
    }

    Ok(Some(replayed as f64 / pointers.len() as f64))
}

fn restore_sequence<D: Destination>(assembler: &mut Assembler<D>, content: &Content) {
    if let Err(e) = assembler.assemble_sequence(&content.table_name, content.sequence) {
        warn!("unable to restore sequence of {}: {e}", content.table_name);
    }
}

/// Keep, for every table, the pass that recovered the most rows.
fn merge_reports(from_material: &[TableReport], from_crawl: &[TableReport]) -> Vec<TableReport> {
    let mut merged: Vec<TableReport> = Vec::new();
    for report in from_material.iter().chain(from_crawl) {
        match merged.iter_mut().find(|t| t.name == report.name) {
            Some(existing) if existing.recovered < report.recovered => *existing = report.clone(),
            Some(_) => {}
            None => merged.push(report.clone()),
        }
    }
    merged
}

/// Restore `source` into `destination` with the help of `material`, see [`Restore::run`].
pub fn restore<D: Destination>(
    source: impl AsRef<Path>,
    material: &Material,
    destination: D,
    config: RepairConfig,
) -> Result<(RestoreReport, D)> {
    Restore::new(config).run(source, material, destination)
}
