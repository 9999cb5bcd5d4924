//! Corruption tolerant walk of table B-trees.
//!
//! Every page visited moves through [`PageStatus`] once per [`Crawler`], the statuses outliving
//! a single [`Crawler::crawl`] so that a page shared between two trees is only visited once. Damage
//! is contained to the page or cell it was found on, and reported to the [`CrawlObserver`].

pub mod master;
pub mod sequence;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::{debug, warn};

use crate::{
    error::{Error, Result},
    page::{
        Page, PageType,
        cell::{Cell, RecordDecoder},
    },
    pager::PageStore,
};

/// Progress of a page through a crawl.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PageStatus {
    #[default]
    Unchecked,
    /// Acquired, with descendants still being visited.
    Checking,
    Checked,
    Damaged,
    /// Skipped at the request of the observer.
    Discarded,
    /// Referenced by a pointer outside of the store.
    Invalid,
}

/// Requests a crawl to stop at the next page boundary. May be shared with other threads.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Hooks driven by [`Crawler::crawl`].
pub trait CrawlObserver {
    /// Whether the page should be visited at all.
    fn can_crawl_page(&mut self, _page_no: u32) -> bool {
        true
    }

    /// Called once a page has been read and found to be a table page, before its cells or
    /// children are visited. Returning `false` discards the page.
    fn will_crawl_page(&mut self, _page: &Page, _height: u32) -> Result<bool> {
        Ok(true)
    }

    fn on_cell_crawled(&mut self, cell: Cell) -> Result<()>;

    fn on_cell_damaged(&mut self, _page_no: u32, _error: &Error) {}

    fn on_page_damaged(&mut self, _page_no: u32, _error: &Error) {}

    /// Polled before every page, stopping the crawl with [`Error::Cancelled`] when set.
    fn is_suspended(&self) -> bool {
        false
    }
}

/// Counters for one [`Crawler::crawl`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub pages_checked: usize,
    pub pages_damaged: usize,
    pub cells_crawled: usize,
    pub cells_damaged: usize,
}

enum Frame {
    Enter { page_no: u32, height: u32 },
    Exit { page_no: u32 },
}

pub struct Crawler {
    store: PageStore,
    decoder: RecordDecoder,
    statuses: Vec<PageStatus>,
    cancel: CancelHandle,
}

impl Crawler {
    pub fn new(store: PageStore) -> Self {
        Self {
            decoder: RecordDecoder::new(store.clone()),
            store,
            statuses: Vec::new(),
            cancel: CancelHandle::default(),
        }
    }

    /// Share `cancel` with this crawler, so that cancelling it stops every crawl.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn status(&self, page_no: u32) -> PageStatus {
        self.statuses
            .get(page_no as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Forget every visited page, so that they may be crawled again.
    pub fn reset(&mut self) {
        self.statuses.clear();
    }

    fn set_status(&mut self, page_no: u32, status: PageStatus) {
        let index = page_no as usize;
        if index >= self.statuses.len() {
            self.statuses.resize(index + 1, PageStatus::Unchecked);
        }
        self.statuses[index] = status;
    }

    /// Walk the table B-tree rooted at `root`, depth first and left to right.
    pub fn crawl(&mut self, root: u32, observer: &mut dyn CrawlObserver) -> Result<CrawlStats> {
        let mut stats = CrawlStats::default();
        let mut stack = vec![Frame::Enter {
            page_no: root,
            height: 1,
        }];

        while let Some(frame) = stack.pop() {
            let (page_no, height) = match frame {
                Frame::Exit { page_no } => {
                    self.set_status(page_no, PageStatus::Checked);
                    continue;
                }
                Frame::Enter { page_no, height } => (page_no, height),
            };

            if self.cancel.is_cancelled() || observer.is_suspended() {
                debug!("crawl of {root} cancelled before page {page_no}");
                return Err(Error::Cancelled);
            }

            if page_no == 0 || page_no > self.store.page_count() {
                let error = Error::damaged(page_no, "page number out of range");
                self.set_status(page_no, PageStatus::Invalid);
                self.page_damaged(page_no, &error, observer, &mut stats);
                continue;
            }

            match self.status(page_no) {
                PageStatus::Unchecked => {}
                PageStatus::Checking => {
                    return Err(Error::Misuse(format!(
                        "page {page_no} is already being checked"
                    )));
                }
                status => {
                    debug!("page {page_no} already {status:?}, skipping");
                    continue;
                }
            }

            if !observer.can_crawl_page(page_no) {
                self.set_status(page_no, PageStatus::Discarded);
                continue;
            }
            self.set_status(page_no, PageStatus::Checking);

            let page = match self.acquire_table_page(page_no) {
                Ok(page) => page,
                Err(e) if e.is_local() => {
                    self.set_status(page_no, PageStatus::Damaged);
                    self.page_damaged(page_no, &e, observer, &mut stats);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !observer.will_crawl_page(&page, height)? {
                self.set_status(page_no, PageStatus::Discarded);
                continue;
            }
            stats.pages_checked += 1;

            match page.page_type() {
                PageType::LeafTable => {
                    self.crawl_cells(&page, observer, &mut stats)?;
                    self.set_status(page_no, PageStatus::Checked);
                }
                _ => {
                    let children = match page.children(self.store.usable_size()) {
                        Ok(children) => children,
                        Err(e) => {
                            self.set_status(page_no, PageStatus::Damaged);
                            self.page_damaged(page_no, &e, observer, &mut stats);
                            continue;
                        }
                    };

                    stack.push(Frame::Exit { page_no });
                    stack.extend(children.into_iter().rev().map(|child| Frame::Enter {
                        page_no: child,
                        height: height + 1,
                    }));
                }
            }
        }

        Ok(stats)
    }

    /// Read a page which must belong to a table B-tree.
    fn acquire_table_page(&self, page_no: u32) -> Result<Page> {
        let page = self.store.acquire_page(page_no)?;

        match page.page_type() {
            PageType::LeafTable | PageType::InteriorTable => Ok(page),
            PageType::Unknown => Err(Error::damaged(page_no, "unknown page type")),
            page_type => Err(Error::damaged(
                page_no,
                format!("{page_type:?} page within a table"),
            )),
        }
    }

    fn crawl_cells(
        &mut self,
        page: &Page,
        observer: &mut dyn CrawlObserver,
        stats: &mut CrawlStats,
    ) -> Result<()> {
        let pointers = match page.cell_pointers(self.store.usable_size()) {
            Ok(pointers) => pointers,
            Err(e) => {
                // Pointers are all or nothing, so the page is treated as a damaged cell.
                self.cell_damaged(page.number(), &e, observer, stats);
                return Ok(());
            }
        };

        for offset in pointers {
            match self.decoder.decode_cell(page, offset) {
                Ok(cell) => {
                    stats.cells_crawled += 1;
                    observer.on_cell_crawled(cell)?;
                }
                Err(e) if e.is_local() => self.cell_damaged(page.number(), &e, observer, stats),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn cell_damaged(
        &self,
        page_no: u32,
        error: &Error,
        observer: &mut dyn CrawlObserver,
        stats: &mut CrawlStats,
    ) {
        warn!("damaged cell on page {page_no}: {error}");
        stats.cells_damaged += 1;
        self.store.mark_data_damaged();
        observer.on_cell_damaged(page_no, error);
    }

    fn page_damaged(
        &self,
        page_no: u32,
        error: &Error,
        observer: &mut dyn CrawlObserver,
        stats: &mut CrawlStats,
    ) {
        warn!("damaged page {page_no}: {error}");
        stats.pages_damaged += 1;
        self.store.mark_data_damaged();
        observer.on_page_damaged(page_no, error);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{fs::File, io::Write, path::Path};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        header::test::header_bytes,
        page::test::btree_page,
        pager::{Integrity, PageStoreConfig},
        varint::VarInt,
    };

    /// Table leaf cell holding a single integer column.
    pub fn int_cell(rowid: u64, value: u8) -> Vec<u8> {
        let mut cell = vec![3];
        VarInt::from(rowid).write(&mut cell);
        cell.extend([2, 1, value]);
        cell
    }

    pub fn interior_cell(child: u32, key: u64) -> Vec<u8> {
        let mut cell = child.to_be_bytes().to_vec();
        VarInt::from(key).write(&mut cell);
        cell
    }

    /// Write `pages` after an empty page 1, and open the result.
    pub fn open_pages(dir: &TempDir, pages: Vec<Page>) -> PageStore {
        let path = dir.path().join("db");
        write_pages(&path, pages);
        PageStore::open(
            &path,
            PageStoreConfig {
                wal: None,
                ..Default::default()
            },
            None,
        )
        .unwrap()
    }

    fn write_pages(path: &Path, pages: Vec<Page>) {
        let mut first = btree_page(1, 512, PageType::LeafTable, None, &[]).data().to_vec();
        first[..100].copy_from_slice(&header_bytes(512, 0));

        let mut bytes = first;
        for page in pages {
            bytes.extend_from_slice(page.data());
        }
        File::create(path).unwrap().write_all(&bytes).unwrap();
    }

    #[derive(Default)]
    struct Recorder {
        rows: Vec<i64>,
        pages: Vec<(u32, u32)>,
        damaged_pages: Vec<u32>,
        damaged_cells: Vec<u32>,
        skip: Vec<u32>,
        suspend_after: Option<usize>,
    }

    impl CrawlObserver for Recorder {
        fn can_crawl_page(&mut self, page_no: u32) -> bool {
            !self.skip.contains(&page_no)
        }

        fn will_crawl_page(&mut self, page: &Page, height: u32) -> Result<bool> {
            self.pages.push((page.number(), height));
            Ok(true)
        }

        fn on_cell_crawled(&mut self, cell: Cell) -> Result<()> {
            self.rows.push(cell.rowid);
            Ok(())
        }

        fn on_cell_damaged(&mut self, page_no: u32, _error: &Error) {
            self.damaged_cells.push(page_no);
        }

        fn on_page_damaged(&mut self, page_no: u32, _error: &Error) {
            self.damaged_pages.push(page_no);
        }

        fn is_suspended(&self) -> bool {
            self.suspend_after
                .is_some_and(|limit| self.pages.len() >= limit)
        }
    }

    /// Root 2 with children 3, 4 and 5.
    fn three_leaves(middle: Page) -> Vec<Page> {
        vec![
            btree_page(
                2,
                512,
                PageType::InteriorTable,
                Some(5),
                &[interior_cell(3, 2), interior_cell(4, 4)],
            ),
            btree_page(3, 512, PageType::LeafTable, None, &[int_cell(1, 1), int_cell(2, 2)]),
            middle,
            btree_page(5, 512, PageType::LeafTable, None, &[int_cell(5, 5)]),
        ]
    }

    #[test]
    fn walks_depth_first() {
        let dir = TempDir::new().unwrap();
        let store = open_pages(
            &dir,
            three_leaves(btree_page(
                4,
                512,
                PageType::LeafTable,
                None,
                &[int_cell(3, 3), int_cell(4, 4)],
            )),
        );
        let mut crawler = Crawler::new(store.clone());
        let mut recorder = Recorder::default();

        let stats = crawler.crawl(2, &mut recorder).unwrap();

        assert_eq!(recorder.rows, vec![1, 2, 3, 4, 5]);
        assert_eq!(recorder.pages, vec![(2, 1), (3, 2), (4, 2), (5, 2)]);
        assert_eq!(stats.pages_checked, 4);
        assert_eq!(stats.cells_crawled, 5);
        assert_eq!(crawler.status(2), PageStatus::Checked);
        assert!(store.integrity().contains(Integrity::DATA));
    }

    #[test]
    fn damaged_child_is_contained() {
        let dir = TempDir::new().unwrap();
        let store = open_pages(&dir, three_leaves(Page::new(4, vec![0; 512].into())));
        let mut crawler = Crawler::new(store.clone());
        let mut recorder = Recorder::default();

        let stats = crawler.crawl(2, &mut recorder).unwrap();

        assert_eq!(recorder.rows, vec![1, 2, 5]);
        assert_eq!(recorder.damaged_pages, vec![4]);
        assert_eq!(stats.pages_damaged, 1);
        assert_eq!(crawler.status(4), PageStatus::Damaged);
        assert!(!store.integrity().contains(Integrity::DATA));
    }

    #[test]
    fn out_of_range_child_is_invalid() {
        let dir = TempDir::new().unwrap();
        let mut pages = three_leaves(btree_page(4, 512, PageType::LeafTable, None, &[]));
        pages[0] = btree_page(
            2,
            512,
            PageType::InteriorTable,
            Some(5),
            &[interior_cell(3, 2), interior_cell(40, 4)],
        );
        let store = open_pages(&dir, pages);
        let mut crawler = Crawler::new(store);
        let mut recorder = Recorder::default();

        crawler.crawl(2, &mut recorder).unwrap();

        assert_eq!(recorder.rows, vec![1, 2, 5]);
        assert_eq!(crawler.status(40), PageStatus::Invalid);
    }

    #[test]
    fn cycle_is_misuse() {
        let dir = TempDir::new().unwrap();
        let store = open_pages(
            &dir,
            vec![
                btree_page(2, 512, PageType::InteriorTable, Some(3), &[]),
                btree_page(3, 512, PageType::InteriorTable, Some(2), &[]),
            ],
        );
        let mut crawler = Crawler::new(store);

        let result = crawler.crawl(2, &mut Recorder::default());

        assert!(matches!(result, Err(Error::Misuse(_))));
    }

    #[test]
    fn shared_page_is_visited_once() {
        let dir = TempDir::new().unwrap();
        let store = open_pages(
            &dir,
            vec![
                btree_page(2, 512, PageType::InteriorTable, Some(3), &[interior_cell(3, 1)]),
                btree_page(3, 512, PageType::LeafTable, None, &[int_cell(1, 1)]),
            ],
        );
        let mut crawler = Crawler::new(store);
        let mut recorder = Recorder::default();

        crawler.crawl(2, &mut recorder).unwrap();
        crawler.crawl(3, &mut recorder).unwrap();

        assert_eq!(recorder.rows, vec![1]);
    }

    #[test]
    fn skipped_pages_are_discarded() {
        let dir = TempDir::new().unwrap();
        let store = open_pages(
            &dir,
            three_leaves(btree_page(4, 512, PageType::LeafTable, None, &[int_cell(3, 3)])),
        );
        let mut crawler = Crawler::new(store);
        let mut recorder = Recorder {
            skip: vec![3],
            ..Default::default()
        };

        crawler.crawl(2, &mut recorder).unwrap();

        assert_eq!(recorder.rows, vec![3, 5]);
        assert_eq!(crawler.status(3), PageStatus::Discarded);
    }

    #[test]
    fn cancel_stops_at_page_boundary() {
        let dir = TempDir::new().unwrap();
        let store = open_pages(
            &dir,
            three_leaves(btree_page(4, 512, PageType::LeafTable, None, &[])),
        );
        let mut crawler = Crawler::new(store);

        crawler.cancel_handle().cancel();
        let result = crawler.crawl(2, &mut Recorder::default());
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn suspension_stops_crawl() {
        let dir = TempDir::new().unwrap();
        let store = open_pages(
            &dir,
            three_leaves(btree_page(4, 512, PageType::LeafTable, None, &[])),
        );
        let mut crawler = Crawler::new(store);
        let mut recorder = Recorder {
            suspend_after: Some(2),
            ..Default::default()
        };

        let result = crawler.crawl(2, &mut recorder);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(recorder.rows, vec![1, 2]);
    }

    #[test]
    fn index_page_in_table_is_damaged() {
        let dir = TempDir::new().unwrap();
        let store = open_pages(
            &dir,
            three_leaves(btree_page(4, 512, PageType::LeafIndex, None, &[])),
        );
        let mut crawler = Crawler::new(store);
        let mut recorder = Recorder::default();

        crawler.crawl(2, &mut recorder).unwrap();
        assert_eq!(recorder.damaged_pages, vec![4]);
    }
}
