#![allow(dead_code)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, types::Value};
use sqlite_salvage::{PageStore, PageStoreConfig};
use tempfile::TempDir;

pub const PAGE_SIZE: usize = 1024;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Create a rollback journal database of 1 KiB pages, prepared with `sql`.
pub fn database(dir: &TempDir, name: &str, sql: &str) -> PathBuf {
    let path = dir.path().join(name);
    let connection = Connection::open(&path).unwrap();
    connection
        .pragma_update(None, "page_size", PAGE_SIZE as i64)
        .unwrap();
    set_pragma(&connection, "journal_mode", "DELETE");
    connection.execute_batch(sql).unwrap();
    path
}

/// Set a pragma which reports its new value.
pub fn set_pragma(connection: &Connection, pragma: &str, value: &str) {
    connection
        .pragma_update_and_check(None, pragma, value, |row| row.get::<_, Value>(0))
        .unwrap();
}

/// Every row of `table`, ordered by rowid.
pub fn rows(connection: &Connection, table: &str) -> Vec<Vec<Value>> {
    let mut statement = connection
        .prepare(&format!("SELECT rowid, * FROM {table} ORDER BY rowid"))
        .unwrap();
    let columns = statement.column_count();
    statement
        .query_map([], |row| {
            (0..columns)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap()
}

pub fn count(connection: &Connection, table: &str) -> usize {
    connection
        .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap() as usize
}

pub fn root_page(path: &Path, table: &str) -> u32 {
    Connection::open(path)
        .unwrap()
        .query_row(
            "SELECT rootpage FROM sqlite_master WHERE name = ?1",
            [table],
            |row| row.get(0),
        )
        .unwrap()
}

pub fn open_store(path: &Path) -> PageStore {
    PageStore::open(
        path,
        PageStoreConfig {
            wal: None,
            ..Default::default()
        },
        None,
    )
    .unwrap()
}

/// Overwrite a whole page of the file with `fill`.
pub fn fill_page(path: &Path, page_no: u32, fill: u8) {
    let mut bytes = std::fs::read(path).unwrap();
    let start = (page_no as usize - 1) * PAGE_SIZE;
    bytes[start..start + PAGE_SIZE].fill(fill);
    std::fs::write(path, bytes).unwrap();
}
