//! Primitives shared by the material formats: big-endian fixed width integers, varints and
//! length prefixed data.

use crate::{
    error::{Error, Result},
    varint::VarInt,
};

#[derive(Debug, Default)]
pub(crate) struct Serializer(Vec<u8>);

impl Serializer {
    pub fn put_u32(&mut self, value: u32) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_varint(&mut self, value: u64) {
        VarInt::from(value).write(&mut self.0);
    }

    pub fn put_sized(&mut self, data: &[u8]) {
        self.put_varint(data.len() as u64);
        self.0.extend_from_slice(data);
    }

    /// Checksum of `data` followed by `data` itself, length prefixed. Empty data has a zero
    /// checksum.
    pub fn put_checksummed(&mut self, data: &[u8]) {
        self.put_u32(checksum(data));
        self.put_sized(data);
    }

    pub fn finish(self) -> Vec<u8> {
        self.0
    }
}

fn checksum(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }
    crc32fast::hash(data)
}

/// Reader over serialized bytes. Every read names the element being read, which is reported as
/// [`Error::Corrupt`] when the bytes run out or are malformed.
#[derive(Debug)]
pub(crate) struct Deserializer<'a> {
    buf: &'a [u8],
    version: u32,
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, version: 0 }
    }

    pub fn with_version(buf: &'a [u8], version: u32) -> Self {
        Self { buf, version }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u32(&mut self, element: &str) -> Result<u32> {
        let Some((bytes, rest)) = self.buf.split_first_chunk::<4>() else {
            return Err(Error::corrupt(element));
        };
        self.buf = rest;
        Ok(u32::from_be_bytes(*bytes))
    }

    pub fn varint(&mut self, element: &str) -> Result<u64> {
        VarInt::advance(&mut self.buf)
            .map(|value| *value)
            .ok_or_else(|| Error::corrupt(element))
    }

    pub fn sized(&mut self, element: &str) -> Result<&'a [u8]> {
        let len = self.varint(element)?;
        let len = usize::try_from(len).map_err(|_| Error::corrupt(element))?;
        if len > self.buf.len() {
            return Err(Error::corrupt(element));
        }

        let (data, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(data)
    }

    /// Non-empty UTF-8 string.
    pub fn string(&mut self, element: &str) -> Result<String> {
        let data = self.sized(element)?;
        if data.is_empty() {
            return Err(Error::corrupt(element));
        }

        String::from_utf8(data.to_vec()).map_err(|_| Error::corrupt(element))
    }

    /// Data written by [`Serializer::put_checksummed`], verified against its checksum.
    pub fn checksummed(&mut self) -> Result<&'a [u8]> {
        let expected = self.u32("Checksum")?;
        let data = self.sized("Content")?;

        if checksum(data) != expected {
            return Err(Error::corrupt("Checksum"));
        }
        Ok(data)
    }
}
