//! Snapshots of the recoverable content of a database: the schema of every table along with the
//! hashes of the leaf pages that were verified when the snapshot was taken.
//!
//! # Format
//!
//! All fixed width integers are big-endian.
//!
//! | Field        | Encoding                                                          |
//! |--------------|-------------------------------------------------------------------|
//! | magic        | `u32`                                                             |
//! | version      | `u32`                                                             |
//! | info         | `u32`s: page size, reserved bytes, salt (2), nBackFill, seq root  |
//! | checksum     | `u32`, CRC-32 of the body, zero when the body is empty            |
//! | body         | varint length, followed by one record per [`Content`]             |
//!
//! The legacy version has no sequence root, neither in the info nor in the contents, and stores
//! absolute page numbers in place of deltas.

mod encryption;
pub mod incremental;
mod serialization;

use std::{fs, path::Path};

use log::debug;

pub(crate) use self::serialization::{Deserializer, Serializer};
use crate::{
    cipher::CipherDelegate,
    error::{Error, Result},
    pager::wal::Salt,
};

pub const MATERIAL_MAGIC: u32 = u32::from_be_bytes(*b"SLVM");
pub const MATERIAL_VERSION: u32 = 0x0100_0001;
pub const LEGACY_MATERIAL_VERSION: u32 = 0x0100_0000;

/// Stands in for a root page which has not been discovered, or was not recorded.
pub const UNKNOWN_PAGE_NO: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterialInfo {
    pub page_size: u32,
    pub reserved_bytes: u32,
    /// Position of the WAL when the snapshot was taken.
    pub wal_salt: Salt,
    pub n_backfill: u32,
    /// Root of the sequence table, zero when the schema has none.
    pub seq_table_root_page: u32,
}

impl Default for MaterialInfo {
    fn default() -> Self {
        Self {
            page_size: 0,
            reserved_bytes: 0,
            wal_salt: (0, 0),
            n_backfill: 0,
            seq_table_root_page: UNKNOWN_PAGE_NO,
        }
    }
}

/// Leaf page verified during a snapshot, along with the hash of its content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VerifiedPage {
    pub number: u32,
    pub hash: u32,
}

impl VerifiedPage {
    pub fn new(number: u32, hash: u32) -> Self {
        Self { number, hash }
    }
}

/// Everything recorded about one table.
#[derive(Clone, Debug, Eq)]
pub struct Content {
    pub table_name: String,
    pub sql: String,
    pub root_page: u32,
    /// Last value handed out by `AUTOINCREMENT`, zero when unknown.
    pub sequence: i64,
    /// Indexes and triggers of the table.
    pub associated_sqls: Vec<String>,
    pub verified_pages: Vec<VerifiedPage>,
}

impl Content {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            sql: String::new(),
            root_page: UNKNOWN_PAGE_NO,
            sequence: 0,
            associated_sqls: Vec::new(),
            verified_pages: Vec::new(),
        }
    }

    pub fn verified_hash(&self, page_no: u32) -> Option<u32> {
        self.verified_pages
            .iter()
            .find(|page| page.number == page_no)
            .map(|page| page.hash)
    }

    fn sorted_pages(&self) -> Vec<VerifiedPage> {
        let mut pages = self
            .verified_pages
            .iter()
            .filter(|page| page.number != 0)
            .copied()
            .collect::<Vec<_>>();
        pages.sort_unstable();
        pages
    }

    fn serialize(&self, serializer: &mut Serializer) -> Result<()> {
        if self.table_name.is_empty() {
            return Err(Error::Misuse("material content has an empty TableName".into()));
        }
        if self.sql.is_empty() {
            return Err(Error::Misuse(format!(
                "material content {} has an empty SQL",
                self.table_name
            )));
        }

        serializer.put_sized(self.table_name.as_bytes());
        serializer.put_varint(self.root_page as u64);
        serializer.put_varint(self.sequence as u64);
        serializer.put_sized(self.sql.as_bytes());

        serializer.put_varint(self.associated_sqls.len() as u64);
        for sql in &self.associated_sqls {
            serializer.put_sized(sql.as_bytes());
        }

        let pages = self.sorted_pages();
        serializer.put_varint(pages.len() as u64);
        let mut previous = 0;
        for page in pages {
            serializer.put_varint((page.number - previous) as u64);
            serializer.put_u32(page.hash);
            previous = page.number;
        }

        Ok(())
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
        let current = deserializer.version() >= MATERIAL_VERSION;

        let mut content = Self::new(deserializer.string("TableName")?);
        if current {
            content.root_page = u32::try_from(deserializer.varint("RootPage")?)
                .map_err(|_| Error::corrupt("RootPage"))?;
        }
        content.sequence = deserializer.varint("Sequence")? as i64;
        content.sql = deserializer.string("SQL")?;

        let associated = deserializer.varint("SQLs")?;
        for _ in 0..associated {
            content.associated_sqls.push(deserializer.string("SQLs")?);
        }

        let count = deserializer.varint("NumberOfPages")?;
        let mut previous = 0u32;
        for _ in 0..count {
            let number = u32::try_from(deserializer.varint("Pageno")?)
                .map_err(|_| Error::corrupt("Pageno"))?;
            let hash = deserializer.u32("PageChecksum")?;

            let number = if current {
                previous
                    .checked_add(number)
                    .ok_or_else(|| Error::corrupt("Pageno"))?
            } else {
                number
            };
            content.verified_pages.push(VerifiedPage::new(number, hash));
            previous = number;
        }

        Ok(content)
    }
}

/// Pages compare regardless of order, which only matters to the encoding.
impl PartialEq for Content {
    fn eq(&self, other: &Self) -> bool {
        self.table_name == other.table_name
            && self.sql == other.sql
            && self.root_page == other.root_page
            && self.sequence == other.sequence
            && self.associated_sqls == other.associated_sqls
            && self.sorted_pages() == other.sorted_pages()
    }
}

#[derive(Clone, Debug, Default, Eq)]
pub struct Material {
    pub info: MaterialInfo,
    pub contents: Vec<Content>,
}

impl Material {
    pub fn content(&self, table_name: &str) -> Option<&Content> {
        self.contents.iter().find(|c| c.table_name == table_name)
    }

    pub fn content_mut(&mut self, table_name: &str) -> Option<&mut Content> {
        self.contents.iter_mut().find(|c| c.table_name == table_name)
    }

    /// Content of `table_name`, appended when the material has none yet.
    pub fn content_or_insert(&mut self, table_name: &str) -> &mut Content {
        let index = match self.contents.iter().position(|c| c.table_name == table_name) {
            Some(index) => index,
            None => {
                self.contents.push(Content::new(table_name));
                self.contents.len() - 1
            }
        };
        &mut self.contents[index]
    }

    /// Hash recorded for `page_no` by whichever table verified it.
    pub fn verified_hash(&self, page_no: u32) -> Option<u32> {
        self.contents.iter().find_map(|c| c.verified_hash(page_no))
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut body = Serializer::default();
        for content in &self.contents {
            content.serialize(&mut body)?;
        }

        let mut serializer = Serializer::default();
        serializer.put_u32(MATERIAL_MAGIC);
        serializer.put_u32(MATERIAL_VERSION);

        let info = &self.info;
        for word in [
            info.page_size,
            info.reserved_bytes,
            info.wal_salt.0,
            info.wal_salt.1,
            info.n_backfill,
            info.seq_table_root_page,
        ] {
            serializer.put_u32(word);
        }

        serializer.put_checksummed(&body.finish());
        Ok(serializer.finish())
    }

    /// Parse a material of either supported version. Trailing bytes, such as the padding left by
    /// decryption, are ignored.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut deserializer = Deserializer::new(bytes);
        let magic = deserializer.u32("Header")?;
        let version = deserializer.u32("Header")?;
        if magic != MATERIAL_MAGIC {
            return Err(Error::corrupt("Magic"));
        }
        if version != MATERIAL_VERSION && version != LEGACY_MATERIAL_VERSION {
            return Err(Error::corrupt("Version"));
        }
        deserializer.set_version(version);

        let mut info = MaterialInfo {
            page_size: deserializer.u32("Info")?,
            reserved_bytes: deserializer.u32("Info")?,
            wal_salt: (deserializer.u32("Info")?, deserializer.u32("Info")?),
            n_backfill: deserializer.u32("Info")?,
            seq_table_root_page: UNKNOWN_PAGE_NO,
        };
        if version >= MATERIAL_VERSION {
            info.seq_table_root_page = deserializer.u32("SeqTableRootPage")?;
        }

        let body = deserializer.checksummed()?;
        let mut decoder = Deserializer::with_version(body, version);
        let mut contents = Vec::new();
        while !decoder.is_empty() {
            contents.push(Content::deserialize(&mut decoder)?);
        }

        debug!("deserialized material of {} tables, version {version:#x}", contents.len());
        Ok(Self { info, contents })
    }

    /// Serialize, then encrypt with the cipher of the store the material describes.
    pub fn encrypt(&self, cipher: &dyn CipherDelegate) -> Result<Vec<u8>> {
        encryption::encrypt(&self.serialize()?, cipher)
    }

    pub fn decrypt(stored: &[u8], cipher: &dyn CipherDelegate) -> Result<Self> {
        Self::deserialize(&encryption::decrypt(stored, cipher)?)
    }

    /// Write the material to `path`, encrypted when a cipher is provided.
    pub fn save(&self, path: impl AsRef<Path>, cipher: Option<&dyn CipherDelegate>) -> Result<()> {
        let bytes = match cipher {
            Some(cipher) => self.encrypt(cipher)?,
            None => self.serialize()?,
        };
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, cipher: Option<&dyn CipherDelegate>) -> Result<Self> {
        let bytes = fs::read(path)?;
        match cipher {
            Some(cipher) => Self::decrypt(&bytes, cipher),
            None => Self::deserialize(&bytes),
        }
    }
}

/// Tables compare regardless of order.
impl PartialEq for Material {
    fn eq(&self, other: &Self) -> bool {
        fn sorted(material: &Material) -> Vec<&Content> {
            let mut contents = material.contents.iter().collect::<Vec<_>>();
            contents.sort_by(|a, b| a.table_name.cmp(&b.table_name));
            contents
        }

        self.info == other.info && sorted(self) == sorted(other)
    }
}
