mod common;

use rstest::rstest;
use rusqlite::Connection;
use sqlite_salvage::{Integrity, RepairConfig, SqliteDestination, repair};
use tempfile::TempDir;

use self::common::*;

fn destination() -> SqliteDestination {
    SqliteDestination::new(Connection::open_in_memory().unwrap())
}

/// `logs` spans many leaves below an interior root, `users` fits on a single page.
fn two_tables(dir: &TempDir) -> std::path::PathBuf {
    let path = database(
        dir,
        "source.db",
        "CREATE TABLE logs(id INTEGER PRIMARY KEY, message TEXT, level INTEGER);
         CREATE TABLE users(name TEXT NOT NULL, email TEXT);
         CREATE INDEX logs_level ON logs(level);",
    );
    let mut connection = Connection::open(&path).unwrap();
    let tx = connection.transaction().unwrap();
    for i in 0..400 {
        tx.execute(
            "INSERT INTO logs(message, level) VALUES(?1, ?2)",
            (format!("message number {i} {}", "x".repeat(60)), i % 5),
        )
        .unwrap();
    }
    for name in ["alice", "bob", "carol"] {
        tx.execute(
            "INSERT INTO users VALUES(?1, ?2)",
            (name, format!("{name}@example.com")),
        )
        .unwrap();
    }
    tx.commit().unwrap();
    path
}

#[test]
fn healthy_database_is_replayed_exactly() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let path = two_tables(&dir);

    let (report, destination) = repair(&path, destination(), RepairConfig::default()).unwrap();

    assert_eq!(report.score, 1.0);
    assert_eq!(report.failed(), 0);
    assert!(report.integrity.contains(Integrity::HEADER | Integrity::DATA));

    let source = Connection::open(&path).unwrap();
    let destination = destination.into_inner();
    for table in ["logs", "users"] {
        assert_eq!(rows(&destination, table), rows(&source, table), "{table}");
    }
    let index: i64 = destination
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE name = 'logs_level'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(index, 1);
}

#[test]
fn corruption_is_contained_to_one_leaf() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let path = two_tables(&dir);

    let store = open_store(&path);
    let root = store.acquire_page(root_page(&path, "logs")).unwrap();
    let children = root.children(store.usable_size()).unwrap();
    let victim = store.acquire_page(children[1]).unwrap();
    let lost = victim.header().unwrap().cell_count as usize;
    drop(store);
    fill_page(&path, victim.number(), 0xa5);

    let (report, destination) = repair(&path, destination(), RepairConfig::default()).unwrap();

    assert_eq!(report.pages_damaged, 1);
    assert!(!report.integrity.contains(Integrity::DATA));
    assert!(report.integrity.contains(Integrity::HEADER));
    let logs = report.table("logs").unwrap();
    assert_eq!(logs.recovered, 400 - lost);
    assert_eq!(report.table("users").unwrap().recovered, 3);
    assert!(report.score > 0.0 && report.score < 1.0);

    let destination = destination.into_inner();
    assert_eq!(count(&destination, "logs"), 400 - lost);
    assert_eq!(count(&destination, "users"), 3);
}

#[test]
fn truncated_overflow_chain_fails_only_its_row() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let path = database(
        &dir,
        "truncated.db",
        "CREATE TABLE files(name TEXT, content BLOB);
         INSERT INTO files VALUES('a', x'01'), ('b', x'02');
         INSERT INTO files VALUES('big', zeroblob(3000));",
    );

    // The overflow pages of the last row sit at the end of the file.
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - PAGE_SIZE as u64).unwrap();
    drop(file);

    let (report, destination) = repair(&path, destination(), RepairConfig::default()).unwrap();

    let files = report.table("files").unwrap();
    assert_eq!((files.recovered, files.failed), (2, 1));
    assert_eq!(report.cells_damaged, 1);
    assert!(report.integrity.contains(Integrity::HEADER));
    assert!(!report.integrity.contains(Integrity::DATA));
    assert_eq!(count(&destination.into_inner(), "files"), 2);
}

#[test]
fn repair_is_idempotent() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let path = two_tables(&dir);
    let store = open_store(&path);
    let root = store.acquire_page(root_page(&path, "logs")).unwrap();
    let leaf = root.children(store.usable_size()).unwrap()[0];
    drop(store);
    fill_page(&path, leaf, 0);

    let (first, first_destination) =
        repair(&path, destination(), RepairConfig::default()).unwrap();
    let (second, second_destination) =
        repair(&path, destination(), RepairConfig::default()).unwrap();

    assert_eq!(first, second);
    let (first_destination, second_destination) =
        (first_destination.into_inner(), second_destination.into_inner());
    for table in ["logs", "users"] {
        assert_eq!(rows(&first_destination, table), rows(&second_destination, table));
    }
}

#[rstest]
#[case::local_limit(1024 - 35 - 10)]
#[case::first_overflow(1024 - 35 - 5)]
#[case::just_over(1024)]
#[case::two_pages(2100)]
#[case::many_pages(10_000)]
fn overflow_boundaries_match_sqlite(#[case] size: usize) {
    init_logger();
    let dir = TempDir::new().unwrap();
    let path = database(
        &dir,
        "overflow.db",
        "CREATE TABLE blobs(id INTEGER PRIMARY KEY, content BLOB);",
    );
    let connection = Connection::open(&path).unwrap();
    for (i, size) in [size - 1, size, size + 1].into_iter().enumerate() {
        let blob = (0..size).map(|b| (b * 7 + i) as u8).collect::<Vec<_>>();
        connection
            .execute("INSERT INTO blobs(content) VALUES(?1)", [blob])
            .unwrap();
    }
    drop(connection);

    let (report, destination) = repair(&path, destination(), RepairConfig::default()).unwrap();

    assert_eq!(report.table("blobs").unwrap().recovered, 3);
    let source = Connection::open(&path).unwrap();
    assert_eq!(rows(&destination.into_inner(), "blobs"), rows(&source, "blobs"));
}

#[rstest]
#[case::numeric_default_in_text("TEXT DEFAULT 0")]
#[case::real_default_in_text("TEXT DEFAULT 2.5")]
#[case::text_not_null("TEXT NOT NULL DEFAULT 'none'")]
#[case::integer_not_null("INTEGER NOT NULL DEFAULT 7")]
#[case::real("REAL DEFAULT 1.5")]
#[case::blob("BLOB DEFAULT x'00ff'")]
#[case::no_default("TEXT")]
fn rows_predating_added_column(#[case] column: &str) {
    init_logger();
    let dir = TempDir::new().unwrap();
    let path = database(
        &dir,
        "drift.db",
        &format!(
            "CREATE TABLE t(a TEXT);
             INSERT INTO t VALUES('x'), ('y'), ('z');
             ALTER TABLE t ADD COLUMN b {column};
             INSERT INTO t(a) VALUES('after');"
        ),
    );

    let (report, destination) = repair(&path, destination(), RepairConfig::default()).unwrap();

    assert_eq!(report.recovered(), 4);
    assert_eq!(report.failed(), 0);
    let source = Connection::open(&path).unwrap();
    assert_eq!(rows(&destination.into_inner(), "t"), rows(&source, "t"));
}

#[test]
fn destination_file() {
    let dir = TempDir::new().unwrap();
    let path = two_tables(&dir);
    let target = dir.path().join("repaired.db");

    let (report, destination) = repair(
        &path,
        SqliteDestination::open(&target).unwrap(),
        RepairConfig::default(),
    )
    .unwrap();
    drop(destination);

    assert_eq!(report.recovered(), 403);
    let repaired = Connection::open(&target).unwrap();
    assert_eq!(count(&repaired, "logs"), 400);
    let check: String = repaired
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .unwrap();
    assert_eq!(check, "ok");
}
