//! B-tree pages as handed out by the [`PageStore`](crate::pager::PageStore). Nothing read from a
//! page is trusted, every offset and pointer is checked before use.

pub mod cell;

use std::rc::Rc;

use derive_more::Deref;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use static_assertions::const_assert_eq;
use zerocopy::{
    FromBytes,
    big_endian::{U16, U32},
};

use crate::{
    error::{Error, Result},
    header::SQLITE_HEADER_SIZE,
};

/// Kind of a page. Only the four B-tree kinds are read from the page itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PageType {
    Unknown = 0x00,
    Overflow = 0x01,
    InteriorIndex = 0x02,
    InteriorTable = 0x05,
    LeafIndex = 0x0a,
    LeafTable = 0x0d,
}

impl PageType {
    /// Interpret the flag byte at the start of a B-tree page header.
    pub fn from_flag(flag: u8) -> Self {
        match flag {
            0x02 => Self::InteriorIndex,
            0x05 => Self::InteriorTable,
            0x0a => Self::LeafIndex,
            0x0d => Self::LeafTable,
            _ => Self::Unknown,
        }
    }

    pub fn is_interior(&self) -> bool {
        matches!(self, Self::InteriorIndex | Self::InteriorTable)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::LeafIndex | Self::LeafTable)
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Self::InteriorTable | Self::LeafTable)
    }

    pub fn is_btree(&self) -> bool {
        self.is_interior() || self.is_leaf()
    }
}

/// Page header present at the start of every B-tree page, as stored on disk.
#[derive(Clone, Debug, FromBytes)]
#[repr(C)]
struct RawPageHeader {
    /// Flag indicating the type of the page.
    page_type: u8,
    /// Start of the first freeblock on the page.
    first_freeblock: U16,
    /// Number of cells in the page.
    cell_count: U16,
    /// Start of the cell content area.
    cell_content_offset: U16,
    /// Number of fragmented free bytes in the cell content area.
    fragmented_bytes: u8,
}
const_assert_eq!(size_of::<RawPageHeader>(), 8);

/// Size of the header of interior pages, which is followed by the right-most child pointer.
const INTERIOR_HEADER_SIZE: usize = 12;
const LEAF_HEADER_SIZE: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub cell_count: u16,
    /// Right-most child, only present for interior pages.
    pub right_child: Option<u32>,
}

/// Page bytes after decoding, shared with the page cache.
#[derive(Clone, Debug, Deref)]
pub struct Page {
    number: u32,
    #[deref(forward)]
    data: Rc<[u8]>,
}

impl Page {
    pub fn new(number: u32, data: Rc<[u8]>) -> Self {
        Self { number, data }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Offset of the B-tree header, which follows the file header on page 1.
    pub fn header_offset(&self) -> usize {
        if self.number == 1 {
            SQLITE_HEADER_SIZE
        } else {
            0
        }
    }

    /// Type according to the flag byte, [`PageType::Unknown`] if it is not a B-tree page.
    pub fn page_type(&self) -> PageType {
        self.data
            .get(self.header_offset())
            .map(|&flag| PageType::from_flag(flag))
            .unwrap_or(PageType::Unknown)
    }

    pub fn header(&self) -> Result<PageHeader> {
        let offset = self.header_offset();
        let (raw, rest) = RawPageHeader::read_from_prefix(&self.data[offset.min(self.data.len())..])
            .map_err(|_| Error::damaged(self.number, "page header exceeds page"))?;

        let page_type = PageType::from_flag(raw.page_type);
        if !page_type.is_btree() {
            return Err(Error::damaged(
                self.number,
                format!("unknown page type {:#04x}", raw.page_type),
            ));
        }

        let right_child = if page_type.is_interior() {
            let (right, _) = U32::read_from_prefix(rest)
                .map_err(|_| Error::damaged(self.number, "page header exceeds page"))?;
            Some(right.get())
        } else {
            None
        };

        Ok(PageHeader {
            page_type,
            cell_count: raw.cell_count.get(),
            right_child,
        })
    }

    /// Offsets of every cell, each checked to lie after the pointer array and within the usable
    /// area of the page.
    pub fn cell_pointers(&self, usable_size: usize) -> Result<Vec<usize>> {
        let header = self.header()?;
        let usable_size = usable_size.min(self.data.len());

        let start = self.header_offset()
            + if header.page_type.is_interior() {
                INTERIOR_HEADER_SIZE
            } else {
                LEAF_HEADER_SIZE
            };
        let end = start + header.cell_count as usize * 2;
        if end > usable_size {
            return Err(Error::damaged(
                self.number,
                format!("{} cell pointers exceed page", header.cell_count),
            ));
        }

        self.data[start..end]
            .chunks_exact(2)
            .map(|pointer| {
                let offset = u16::from_be_bytes([pointer[0], pointer[1]]) as usize;
                if offset < end || offset >= usable_size {
                    return Err(Error::damaged(
                        self.number,
                        format!("cell pointer {offset} out of range"),
                    ));
                }

                Ok(offset)
            })
            .collect()
    }

    /// Child pages of an interior page, left to right, ending with the right-most child.
    pub fn children(&self, usable_size: usize) -> Result<Vec<u32>> {
        let header = self.header()?;
        let Some(right_child) = header.right_child else {
            return Err(Error::Misuse(format!(
                "page {} is not an interior page",
                self.number
            )));
        };

        let usable_size = usable_size.min(self.data.len());
        let mut children = self
            .cell_pointers(usable_size)?
            .into_iter()
            .map(|offset| {
                let (child, _) = U32::read_from_prefix(&self.data[offset..usable_size])
                    .map_err(|_| Error::damaged(self.number, "child pointer exceeds page"))?;
                Ok(child.get())
            })
            .collect::<Result<Vec<_>>>()?;
        children.push(right_child);

        Ok(children)
    }

    /// Content hash of the whole page, the unit of change detection for backups.
    pub fn hash(&self) -> u32 {
        crc32fast::hash(&self.data)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use rstest::rstest;

    use super::*;

    /// Lay out a B-tree page with the provided cells packed at the end of the page.
    pub fn btree_page(
        number: u32,
        page_size: usize,
        page_type: PageType,
        right_child: Option<u32>,
        cells: &[Vec<u8>],
    ) -> Page {
        let mut data = vec![0u8; page_size];
        let offset = if number == 1 { SQLITE_HEADER_SIZE } else { 0 };

        data[offset] = page_type.into();
        data[offset + 3..offset + 5].copy_from_slice(&(cells.len() as u16).to_be_bytes());
        let mut pointer = offset + LEAF_HEADER_SIZE;
        if let Some(right_child) = right_child {
            data[offset + 8..offset + 12].copy_from_slice(&right_child.to_be_bytes());
            pointer = offset + INTERIOR_HEADER_SIZE;
        }

        let mut content = page_size;
        for cell in cells {
            content -= cell.len();
            data[content..content + cell.len()].copy_from_slice(cell);
            data[pointer..pointer + 2].copy_from_slice(&(content as u16).to_be_bytes());
            pointer += 2;
        }
        data[offset + 5..offset + 7].copy_from_slice(&(content as u16).to_be_bytes());

        Page::new(number, data.into())
    }

    #[rstest]
    #[case::interior_index(0x02, PageType::InteriorIndex)]
    #[case::interior_table(0x05, PageType::InteriorTable)]
    #[case::leaf_index(0x0a, PageType::LeafIndex)]
    #[case::leaf_table(0x0d, PageType::LeafTable)]
    #[case::zero(0x00, PageType::Unknown)]
    #[case::overflow_is_not_a_flag(0x01, PageType::Unknown)]
    fn flags(#[case] flag: u8, #[case] expected: PageType) {
        assert_eq!(PageType::from_flag(flag), expected);
    }

    #[test]
    fn interior_children() {
        let cells = [
            [0, 0, 0, 7, 0x01].to_vec(),
            [0, 0, 0, 9, 0x05].to_vec(),
        ];
        let page = btree_page(2, 512, PageType::InteriorTable, Some(11), &cells);

        assert_eq!(
            page.header().unwrap(),
            PageHeader {
                page_type: PageType::InteriorTable,
                cell_count: 2,
                right_child: Some(11),
            }
        );
        assert_eq!(page.children(512).unwrap(), vec![7, 9, 11]);
    }

    #[test]
    fn first_page_header_follows_file_header() {
        let page = btree_page(1, 512, PageType::LeafTable, None, &[vec![1, 1, 0x09]]);

        assert_eq!(page.page_type(), PageType::LeafTable);
        assert_eq!(page.cell_pointers(512).unwrap(), vec![509]);
    }

    #[test]
    fn unknown_type_is_damaged() {
        let page = Page::new(3, vec![0x07; 512].into());

        assert_eq!(page.page_type(), PageType::Unknown);
        assert!(matches!(page.header(), Err(Error::Damaged { page: 3, .. })));
    }

    #[test]
    fn pointer_outside_usable_area_is_damaged() {
        let page = btree_page(2, 512, PageType::LeafTable, None, &[vec![1, 1, 0x09]]);

        // The only cell lives in what a codec would reserve.
        assert!(matches!(page.cell_pointers(500), Err(Error::Damaged { page: 2, .. })));
    }

    #[test]
    fn too_many_cells_is_damaged() {
        let mut data = vec![0u8; 512];
        data[0] = 0x0d;
        data[3..5].copy_from_slice(&1000u16.to_be_bytes());
        let page = Page::new(2, data.into());

        assert!(matches!(page.cell_pointers(512), Err(Error::Damaged { page: 2, .. })));
    }

    #[test]
    fn hash_tracks_content() {
        let a = Page::new(2, vec![1u8; 512].into());
        let b = Page::new(9, vec![1u8; 512].into());
        let mut data = vec![1u8; 512];
        data[100] = 2;
        let c = Page::new(2, data.into());

        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}
