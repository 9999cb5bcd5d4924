//! Least-recently-used cache of decoded pages, bounded by the number of bytes held rather than
//! the number of pages.
//!
//! Entries are linked by page number, with the head being the most recently used and the tail
//! the next to be evicted.

use std::{collections::HashMap, rc::Rc};

pub(crate) struct PageCache {
    /// Budget in bytes. A budget of zero disables the cache.
    budget: usize,
    /// Bytes currently held by all entries.
    used: usize,
    map: HashMap<u32, Entry>,
    head: Option<u32>,
    tail: Option<u32>,
}

struct Entry {
    data: Rc<[u8]>,
    prev: Option<u32>,
    next: Option<u32>,
}

impl PageCache {
    pub(crate) fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            map: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    /// Fetch a page, marking it as most recently used.
    pub(crate) fn get(&mut self, page_no: u32) -> Option<Rc<[u8]>> {
        let data = self.map.get(&page_no)?.data.clone();
        self.detach(page_no);
        self.attach_front(page_no);
        Some(data)
    }

    /// Insert a page as the most recently used entry. Returns `true` when the budget has been
    /// exceeded and the caller should [`PageCache::purge`].
    pub(crate) fn insert(&mut self, page_no: u32, data: Rc<[u8]>) -> bool {
        if self.budget == 0 {
            return false;
        }

        if let Some(entry) = self.map.get_mut(&page_no) {
            self.used = self.used - entry.data.len() + data.len();
            entry.data = data;
        } else {
            self.used += data.len();
            self.map.insert(
                page_no,
                Entry {
                    data,
                    prev: None,
                    next: None,
                },
            );
        }
        self.detach(page_no);
        self.attach_front(page_no);

        self.used > self.budget
    }

    /// Evict least recently used entries until no more than `target` bytes are held, producing
    /// the number of evicted pages.
    pub(crate) fn purge(&mut self, target: usize) -> usize {
        let mut evicted = 0;

        while self.used > target {
            let Some(victim) = self.tail else {
                break;
            };

            self.detach(victim);
            if let Some(entry) = self.map.remove(&victim) {
                self.used -= entry.data.len();
            }
            evicted += 1;
        }

        evicted
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
        self.used = 0;
        self.head = None;
        self.tail = None;
    }

    pub(crate) fn budget(&self) -> usize {
        self.budget
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    fn detach(&mut self, page_no: u32) {
        let (prev, next) = match self.map.get(&page_no) {
            Some(e) => (e.prev, e.next),
            None => return,
        };

        if self.head == Some(page_no) {
            self.head = next;
        }
        if self.tail == Some(page_no) {
            self.tail = prev;
        }

        if let Some(pe) = prev.and_then(|p| self.map.get_mut(&p)) {
            pe.next = next;
        }
        if let Some(ne) = next.and_then(|n| self.map.get_mut(&n)) {
            ne.prev = prev;
        }

        if let Some(e) = self.map.get_mut(&page_no) {
            e.prev = None;
            e.next = None;
        }
    }

    fn attach_front(&mut self, page_no: u32) {
        if self.head == Some(page_no) {
            return;
        }

        if let Some(e) = self.map.get_mut(&page_no) {
            e.prev = None;
            e.next = self.head;
        }

        if let Some(he) = self.head.and_then(|h| self.map.get_mut(&h)) {
            he.prev = Some(page_no);
        }

        self.head = Some(page_no);

        if self.tail.is_none() {
            self.tail = Some(page_no);
        }
    }
}
