//! Pages changed since the last snapshot, along with the WAL bookkeeping needed to tell whether
//! the changes can be applied on top of that snapshot.

use std::{collections::BTreeMap, fs, path::Path};

use log::debug;

use super::{Deserializer, Serializer, encryption};
use crate::{
    cipher::CipherDelegate,
    error::{Error, Result},
    page::PageType,
    pager::wal::Salt,
};

pub const INCREMENTAL_MATERIAL_MAGIC: u32 = u32::from_be_bytes(*b"SLVI");
pub const INCREMENTAL_MATERIAL_VERSION: u32 = 0x0100_0000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IncrementalInfo {
    /// WAL position recorded by the snapshot this material applies to.
    pub last_wal_salt: Salt,
    pub last_n_backfill: u32,
    /// WAL position the changes have been tracked up to.
    pub current_wal_salt: Salt,
    pub current_n_backfill: u32,
    pub last_schema_cookie: u32,
    /// Every frame was checkpointed when the last snapshot was taken.
    pub last_checkpoint_finish: bool,
    /// Unix time of the last snapshot, in seconds.
    pub last_backup_time: u32,
    /// Incremental snapshots taken since the last full one.
    pub incremental_backup_times: i32,
}

/// Latest image of a changed page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IncrementalPage {
    pub number: u32,
    pub page_type: PageType,
    pub hash: Option<u32>,
}

impl IncrementalPage {
    fn serialize(&self, serializer: &mut Serializer) -> Result<()> {
        if self.number == 0 {
            return Err(Error::Misuse("incremental material has an empty Page".into()));
        }

        let page_type = u64::from(u8::from(self.page_type));
        serializer.put_varint(self.number as u64);
        match self.hash {
            Some(hash) => {
                serializer.put_varint(2 * page_type + 1);
                serializer.put_u32(hash);
            }
            None => serializer.put_varint(2 * page_type),
        }
        Ok(())
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self> {
        let number = u32::try_from(deserializer.varint("PageNo")?)
            .ok()
            .filter(|&number| number != 0)
            .ok_or_else(|| Error::corrupt("PageNo"))?;
        let tag = deserializer.varint("PageType")?;
        let page_type = u8::try_from(tag / 2)
            .ok()
            .and_then(|flag| PageType::try_from(flag).ok())
            .ok_or_else(|| Error::corrupt("PageType"))?;
        let hash = match tag % 2 {
            1 => Some(deserializer.u32("PageHash")?),
            _ => None,
        };

        Ok(Self {
            number,
            page_type,
            hash,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IncrementalMaterial {
    pub info: IncrementalInfo,
    pub pages: BTreeMap<u32, IncrementalPage>,
}

impl IncrementalMaterial {
    /// Record the latest image of a page, replacing any earlier one.
    pub fn insert(&mut self, page: IncrementalPage) {
        self.pages.insert(page.number, page);
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut body = Serializer::default();
        for page in self.pages.values() {
            page.serialize(&mut body)?;
        }

        let info = &self.info;
        let mut serializer = Serializer::default();
        serializer.put_u32(INCREMENTAL_MATERIAL_MAGIC);
        serializer.put_u32(INCREMENTAL_MATERIAL_VERSION);
        serializer.put_u32(info.last_wal_salt.0);
        serializer.put_u32(info.last_wal_salt.1);
        serializer.put_u32(info.current_wal_salt.0);
        serializer.put_u32(info.current_wal_salt.1);
        serializer.put_varint(info.last_n_backfill as u64);
        serializer.put_varint(info.current_n_backfill as u64);
        serializer.put_u32(info.last_schema_cookie);
        serializer.put_varint(info.last_checkpoint_finish as u64);
        serializer.put_u32(info.last_backup_time);
        serializer.put_varint(info.incremental_backup_times as u64);
        serializer.put_checksummed(&body.finish());

        Ok(serializer.finish())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut deserializer = Deserializer::new(bytes);
        let magic = deserializer.u32("Header")?;
        let version = deserializer.u32("Header")?;
        if magic != INCREMENTAL_MATERIAL_MAGIC {
            return Err(Error::corrupt("Magic"));
        }
        if version != INCREMENTAL_MATERIAL_VERSION {
            return Err(Error::corrupt("Version"));
        }
        deserializer.set_version(version);

        let backfill = |deserializer: &mut Deserializer<'_>, element| {
            u32::try_from(deserializer.varint(element)?).map_err(|_| Error::corrupt(element))
        };
        let info = IncrementalInfo {
            last_wal_salt: (deserializer.u32("Salt")?, deserializer.u32("Salt")?),
            current_wal_salt: (deserializer.u32("Salt")?, deserializer.u32("Salt")?),
            last_n_backfill: backfill(&mut deserializer, "LastNBackfill")?,
            current_n_backfill: backfill(&mut deserializer, "CurrentNBackfill")?,
            last_schema_cookie: deserializer.u32("LastSchemaCookie")?,
            last_checkpoint_finish: deserializer.varint("LastCheckpointFinish")? != 0,
            last_backup_time: deserializer.u32("LastBackupTime")?,
            incremental_backup_times: deserializer.varint("BackupTimes")? as i32,
        };

        let body = deserializer.checksummed()?;
        let mut decoder = Deserializer::with_version(body, version);
        let mut pages = BTreeMap::new();
        while !decoder.is_empty() {
            let page = IncrementalPage::deserialize(&mut decoder)?;
            pages.insert(page.number, page);
        }

        debug!("deserialized incremental material of {} pages", pages.len());
        Ok(Self { info, pages })
    }

    pub fn encrypt(&self, cipher: &dyn CipherDelegate) -> Result<Vec<u8>> {
        encryption::encrypt(&self.serialize()?, cipher)
    }

    pub fn decrypt(stored: &[u8], cipher: &dyn CipherDelegate) -> Result<Self> {
        Self::deserialize(&encryption::decrypt(stored, cipher)?)
    }

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

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn incremental() -> IncrementalMaterial {
        let mut material = IncrementalMaterial {
            info: IncrementalInfo {
                last_wal_salt: (1, 2),
                last_n_backfill: 3,
                current_wal_salt: (2, 9),
                current_n_backfill: 200,
                last_schema_cookie: 17,
                last_checkpoint_finish: true,
                last_backup_time: 1_700_000_000,
                incremental_backup_times: 4,
            },
            pages: BTreeMap::new(),
        };
        material.insert(IncrementalPage {
            number: 12,
            page_type: PageType::LeafTable,
            hash: Some(0),
        });
        material.insert(IncrementalPage {
            number: 3,
            page_type: PageType::InteriorIndex,
            hash: None,
        });
        material
    }

    #[test]
    fn round_trip() {
        let material = incremental();
        let bytes = material.serialize().unwrap();
        assert_eq!(IncrementalMaterial::deserialize(&bytes).unwrap(), material);
    }

    #[rstest]
    #[case::leaf_with_hash(PageType::LeafTable, Some(5), &[7, 27, 0, 0, 0, 5])]
    #[case::interior_without_hash(PageType::InteriorTable, None, &[7, 10])]
    #[case::overflow(PageType::Overflow, Some(1), &[7, 3, 0, 0, 0, 1])]
    #[case::unknown(PageType::Unknown, None, &[7, 0])]
    fn page_encoding(
        #[case] page_type: PageType,
        #[case] hash: Option<u32>,
        #[case] expected: &[u8],
    ) {
        let page = IncrementalPage {
            number: 7,
            page_type,
            hash,
        };
        let mut serializer = Serializer::default();
        page.serialize(&mut serializer).unwrap();
        let bytes = serializer.finish();
        assert_eq!(bytes, expected);

        let decoded = IncrementalPage::deserialize(&mut Deserializer::new(&bytes)).unwrap();
        assert_eq!(decoded, page);
    }

    #[rstest]
    #[case::page_zero(&[0, 27, 0, 0, 0, 5], "PageNo")]
    #[case::unknown_type(&[7, 24], "PageType")]
    fn invalid_pages_are_corrupt(#[case] bytes: &[u8], #[case] expected: &str) {
        assert!(matches!(
            IncrementalPage::deserialize(&mut Deserializer::new(bytes)),
            Err(Error::Corrupt { element }) if element == expected
        ));
    }

    #[test]
    fn page_zero_is_rejected() {
        let mut material = incremental();
        material.pages.insert(
            0,
            IncrementalPage {
                number: 0,
                page_type: PageType::LeafTable,
                hash: None,
            },
        );
        assert!(matches!(material.serialize(), Err(Error::Misuse(_))));
    }

    #[test]
    fn rejects_other_versions() {
        let mut bytes = incremental().serialize().unwrap();
        bytes[7] = 1;
        assert!(matches!(
            IncrementalMaterial::deserialize(&bytes),
            Err(Error::Corrupt { element }) if element == "Version"
        ));
    }
}
