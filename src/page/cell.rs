//! Decoding of table leaf cells into rows, following overflow chains where the payload spills
//! out of the page.

use std::{cmp::Ordering, collections::HashSet};

use crate::{
    error::{Error, Result},
    page::Page,
    pager::PageStore,
    varint::VarInt,
};

/// Size of the pointer to the next page at the start of every overflow page.
const OVERFLOW_POINTER_SIZE: usize = 4;

/// Typed column value decoded from a record.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(Vec<u8>),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A row recovered from a table leaf page.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    /// Page the cell was found on.
    pub page: u32,
    pub rowid: i64,
    pub values: Vec<Value>,
}

impl Cell {
    pub fn integer(&self, column: usize) -> Option<i64> {
        match self.values.get(column)? {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Text value of a column, if it is valid UTF-8.
    pub fn text(&self, column: usize) -> Option<&str> {
        match self.values.get(column)? {
            Value::Text(value) => std::str::from_utf8(value).ok(),
            _ => None,
        }
    }
}

/// Amount of a payload of `payload_size` bytes that is stored on a table leaf page with
/// `usable_size` bytes available. The remainder spills into an overflow chain.
pub fn local_payload_size(payload_size: usize, usable_size: usize) -> usize {
    // X: The maximum amount of payload that can be stored directly on the page.
    let max_local = usable_size - 35;

    // M: The minimum amount of payload that must be stored on the page before spilling.
    let min_local = ((usable_size - 12) * 32 / 255) - 23;

    if payload_size <= max_local {
        return payload_size;
    }

    let k = min_local + (payload_size - min_local) % (usable_size - OVERFLOW_POINTER_SIZE);
    match k.cmp(&max_local) {
        Ordering::Less | Ordering::Equal => k,
        Ordering::Greater => min_local,
    }
}

/// Decodes cells of table leaf pages read from one store.
#[derive(Clone, Debug)]
pub struct RecordDecoder {
    store: PageStore,
}

impl RecordDecoder {
    pub fn new(store: PageStore) -> Self {
        Self { store }
    }

    /// Decode the cell at `offset` of a table leaf page.
    pub fn decode_cell(&self, page: &Page, offset: usize) -> Result<Cell> {
        let usable_size = self.store.usable_size().min(page.len());
        let damaged = |reason: &str| Error::damaged(page.number(), reason);

        let mut cursor = page
            .get(offset..usable_size)
            .ok_or_else(|| damaged("cell offset exceeds page"))?;
        let payload_size =
            *VarInt::advance(&mut cursor).ok_or_else(|| damaged("truncated payload size"))?
                as usize;
        let rowid = VarInt::advance(&mut cursor)
            .ok_or_else(|| damaged("truncated rowid"))?
            .signed();

        // No payload can be larger than every page of the store put together.
        let max_payload = self.store.page_count() as usize * usable_size;
        if payload_size > max_payload {
            return Err(damaged("payload size exceeds store"));
        }

        let local_size = local_payload_size(payload_size, usable_size);
        let mut payload = Vec::new();
        payload.try_reserve_exact(payload_size)?;

        if local_size == payload_size {
            let local = cursor
                .get(..payload_size)
                .ok_or_else(|| damaged("payload exceeds page"))?;
            payload.extend_from_slice(local);
        } else {
            let local = cursor
                .get(..local_size + OVERFLOW_POINTER_SIZE)
                .ok_or_else(|| damaged("payload exceeds page"))?;
            payload.extend_from_slice(&local[..local_size]);

            let first = u32::from_be_bytes([
                local[local_size],
                local[local_size + 1],
                local[local_size + 2],
                local[local_size + 3],
            ]);
            self.read_overflow(page.number(), first, payload_size, usable_size, &mut payload)?;
        }

        let values = decode_record(&payload).map_err(damaged)?;

        Ok(Cell {
            page: page.number(),
            rowid,
            values,
        })
    }

    /// Append the rest of the payload from the overflow chain starting at `next`.
    fn read_overflow(
        &self,
        cell_page: u32,
        mut next: u32,
        payload_size: usize,
        usable_size: usize,
        payload: &mut Vec<u8>,
    ) -> Result<()> {
        let page_count = self.store.page_count();
        let mut visited = HashSet::new();

        while payload.len() < payload_size {
            if next == 0 || next > page_count {
                return Err(Error::damaged(
                    cell_page,
                    format!("overflow pointer {next} out of range"),
                ));
            }
            if !visited.insert(next) {
                return Err(Error::damaged(
                    cell_page,
                    format!("overflow chain revisits page {next}"),
                ));
            }

            let overflow = match self.store.acquire_page(next) {
                Ok(overflow) => overflow,
                Err(Error::ShortRead { page, .. }) => {
                    return Err(Error::damaged(page, "overflow page is truncated"));
                }
                Err(e) => return Err(e),
            };

            let chunk = (payload_size - payload.len()).min(usable_size - OVERFLOW_POINTER_SIZE);
            payload.extend_from_slice(
                &overflow[OVERFLOW_POINTER_SIZE..OVERFLOW_POINTER_SIZE + chunk],
            );
            next = u32::from_be_bytes([overflow[0], overflow[1], overflow[2], overflow[3]]);
        }

        if next != 0 {
            return Err(Error::damaged(
                cell_page,
                "overflow chain continues past the payload",
            ));
        }

        Ok(())
    }
}

/// Decode a record: a header of serial types followed by the column bodies, which must account
/// for every byte of the payload.
fn decode_record(payload: &[u8]) -> Result<Vec<Value>, &'static str> {
    let (header_size, consumed) = VarInt::read(payload).ok_or("truncated record header size")?;
    let header_size = *header_size as usize;
    if header_size < consumed || header_size > payload.len() {
        return Err("record header size out of range");
    }

    let mut header = &payload[consumed..header_size];
    let mut body = &payload[header_size..];
    let mut values = Vec::new();

    while !header.is_empty() {
        let serial_type = *VarInt::advance(&mut header).ok_or("truncated serial type")?;

        let value = match serial_type {
            0 => Value::Null,
            1 => Value::Integer(integer(take(&mut body, 1)?)),
            2 => Value::Integer(integer(take(&mut body, 2)?)),
            3 => Value::Integer(integer(take(&mut body, 3)?)),
            4 => Value::Integer(integer(take(&mut body, 4)?)),
            5 => Value::Integer(integer(take(&mut body, 6)?)),
            6 => Value::Integer(integer(take(&mut body, 8)?)),
            7 => Value::Real(f64::from_bits(integer(take(&mut body, 8)?) as u64)),
            8 => Value::Integer(0),
            9 => Value::Integer(1),
            10 | 11 => return Err("reserved serial type"),
            n if n % 2 == 0 => Value::Blob(take(&mut body, ((n - 12) / 2) as usize)?.to_vec()),
            n => Value::Text(take(&mut body, ((n - 13) / 2) as usize)?.to_vec()),
        };

        values.push(value);
    }

    if !body.is_empty() {
        return Err("payload size mismatches columns");
    }

    Ok(values)
}

fn take<'a>(body: &mut &'a [u8], n: usize) -> Result<&'a [u8], &'static str> {
    if n > body.len() {
        return Err("column exceeds payload");
    }

    let (bytes, rest) = body.split_at(n);
    *body = rest;
    Ok(bytes)
}

/// Big-endian two's complement integer of up to 8 bytes.
fn integer(bytes: &[u8]) -> i64 {
    let Some((&first, rest)) = bytes.split_first() else {
        return 0;
    };

    rest.iter()
        .fold(first as i8 as i64, |n, &b| (n << 8) | b as i64)
}
