//! Reading of the `sqlite_sequence` table.

use log::warn;

use super::{CrawlObserver, CrawlStats, Crawler};
use crate::{
    error::Result,
    page::{Page, cell::Cell},
};

/// Last value handed out by an `AUTOINCREMENT` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceEntry {
    pub name: String,
    pub seq: i64,
}

impl SequenceEntry {
    fn from_cell(cell: &Cell) -> Option<Self> {
        Some(Self {
            name: cell.text(0)?.to_string(),
            seq: cell.integer(1)?,
        })
    }
}

pub trait SequenceCrawlObserver {
    fn on_sequence(&mut self, entry: SequenceEntry) -> Result<()>;

    /// Every page of the sequence table, as it is visited.
    fn on_sequence_page(&mut self, _page: &Page) {}

    /// Polled before every page of the sequence table.
    fn is_suspended(&self) -> bool {
        false
    }
}

pub struct SequenceCrawler<'a> {
    crawler: &'a mut Crawler,
}

impl<'a> SequenceCrawler<'a> {
    pub fn new(crawler: &'a mut Crawler) -> Self {
        Self { crawler }
    }

    pub fn crawl(
        &mut self,
        root: u32,
        observer: &mut impl SequenceCrawlObserver,
    ) -> Result<CrawlStats> {
        self.crawler.crawl(root, &mut SequenceAdapter { observer })
    }
}

struct SequenceAdapter<'o, O> {
    observer: &'o mut O,
}

impl<O: SequenceCrawlObserver> CrawlObserver for SequenceAdapter<'_, O> {
    fn will_crawl_page(&mut self, page: &Page, _height: u32) -> Result<bool> {
        self.observer.on_sequence_page(page);
        Ok(true)
    }

    fn on_cell_crawled(&mut self, cell: Cell) -> Result<()> {
        match SequenceEntry::from_cell(&cell) {
            Some(entry) => self.observer.on_sequence(entry),
            None => {
                warn!("skipping malformed sequence row {}", cell.rowid);
                Ok(())
            }
        }
    }

    fn is_suspended(&self) -> bool {
        SequenceCrawlObserver::is_suspended(&*self.observer)
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        crawler::{master::test::row_cell, test::open_pages},
        page::{PageType, test::btree_page},
    };

    #[derive(Default)]
    struct Sequences(Vec<SequenceEntry>, Vec<u32>);

    impl SequenceCrawlObserver for Sequences {
        fn on_sequence(&mut self, entry: SequenceEntry) -> Result<()> {
            self.0.push(entry);
            Ok(())
        }

        fn on_sequence_page(&mut self, page: &Page) {
            self.1.push(page.number());
        }
    }

    #[test]
    fn reads_sequences() {
        let dir = TempDir::new().unwrap();
        let store = open_pages(
            &dir,
            vec![btree_page(
                2,
                512,
                PageType::LeafTable,
                None,
                &[
                    row_cell(1, &[Some("a"), None], &[(1, 7)]),
                    row_cell(2, &[Some("b"), Some("not a number")], &[]),
                    row_cell(3, &[Some("c"), None], &[(1, 0)]),
                ],
            )],
        );
        let mut crawler = Crawler::new(store);
        let mut sequences = Sequences::default();

        SequenceCrawler::new(&mut crawler)
            .crawl(2, &mut sequences)
            .unwrap();

        assert_eq!(
            sequences.0,
            vec![
                SequenceEntry {
                    name: "a".into(),
                    seq: 7
                },
                SequenceEntry {
                    name: "c".into(),
                    seq: 0
                },
            ]
        );
        assert_eq!(sequences.1, vec![2]);
    }
}
