//! Replays recovered rows into a destination database.
//!
//! The destination is reached through the [`Destination`] trait, which only ever receives the
//! schema statements of the source, parameterised inserts and the `sqlite_sequence` fixups.

mod sqlite;

use derive_where::derive_where;
use log::{debug, info, warn};

pub use self::sqlite::SqliteDestination;
use crate::{
    crawler::master::SEQUENCE_TABLE,
    error::{Error, Result},
    page::cell::{Cell, Value},
};

/// Statement execution interface of the destination database.
pub trait Destination {
    /// Execute one or more statements without parameters.
    fn execute(&mut self, sql: &str) -> anyhow::Result<()>;

    /// Execute a single statement with positional parameters, producing the number of changed
    /// rows.
    fn execute_with(&mut self, sql: &str, values: &[Value]) -> anyhow::Result<usize>;

    /// Columns of `table`, as reported by `PRAGMA table_info`.
    fn table_info(&mut self, table: &str) -> anyhow::Result<Vec<ColumnInfo>>;

    /// Value of a constant expression, as produced by `SELECT <expr>`.
    fn evaluate(&mut self, expr: &str) -> anyhow::Result<Value>;
}

/// One row of `PRAGMA table_info`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// Position within the primary key, zero when the column is not part of it.
    pub primary_key: u32,
}

/// Type affinity of a column, derived from its declared type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    pub fn of(declared_type: &str) -> Self {
        let declared_type = declared_type.to_ascii_uppercase();
        let contains = |pattern: &str| declared_type.contains(pattern);

        if contains("INT") {
            Self::Integer
        } else if contains("CHAR") || contains("CLOB") || contains("TEXT") {
            Self::Text
        } else if contains("BLOB") || declared_type.is_empty() {
            Self::Blob
        } else if contains("REAL") || contains("FLOA") || contains("DOUB") {
            Self::Real
        } else {
            Self::Numeric
        }
    }
}

#[derive(Clone, Debug)]
pub struct AssembleConfig {
    /// Run the stored `CREATE TABLE` of every table before its rows.
    pub create_tables: bool,
    /// Successful inserts per transaction.
    pub batch_size: usize,
    /// Use `INSERT OR IGNORE`, so rows already present are kept.
    pub insert_or_ignore: bool,
}

impl Default for AssembleConfig {
    fn default() -> Self {
        Self {
            create_tables: true,
            batch_size: 256,
            insert_or_ignore: false,
        }
    }
}

/// Rows replayed for one table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableReport {
    pub name: String,
    pub recovered: usize,
    pub failed: usize,
}

#[derive(Clone, Debug)]
struct Column {
    name: String,
    affinity: Affinity,
    not_null: bool,
    default: Value,
    /// The column aliases the rowid.
    integer_primary_key: bool,
}

struct TableState {
    name: String,
    /// Resolved on the first row, once the table exists in the destination.
    columns: Option<Vec<Column>>,
    insert_sql: String,
    report: TableReport,
}

#[derive_where(Debug)]
pub struct Assembler<D> {
    #[derive_where(skip)]
    destination: D,
    config: AssembleConfig,
    #[derive_where(skip)]
    table: Option<TableState>,
    /// Successful inserts since the last commit.
    pending: usize,
    in_transaction: bool,
    /// Index and trigger statements, run once every table is filled.
    deferred: Vec<String>,
    tables: Vec<TableReport>,
}

impl<D: Destination> Assembler<D> {
    pub fn new(destination: D, config: AssembleConfig) -> Self {
        Self {
            destination,
            config,
            table: None,
            pending: 0,
            in_transaction: false,
            deferred: Vec::new(),
            tables: Vec::new(),
        }
    }

    pub fn destination(&mut self) -> &mut D {
        &mut self.destination
    }

    /// Tables finished so far.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Start replaying rows of `table`, creating it from `sql` first unless configured not to.
    pub fn assemble_table(&mut self, table: &str, sql: &str) -> Result<()> {
        self.finish_table()?;

        if self.config.create_tables {
            let sql = if_not_exists(sql);
            debug!("creating table {table}: {sql}");
            self.destination.execute(&sql).map_err(Error::Destination)?;
        }

        self.table = Some(TableState {
            name: table.to_string(),
            columns: None,
            insert_sql: String::new(),
            report: TableReport {
                name: table.to_string(),
                ..Default::default()
            },
        });
        Ok(())
    }

    /// Statement of an index or trigger, run after every table has been filled.
    pub fn assemble_associated(&mut self, sql: &str) {
        self.deferred.push(if_not_exists(sql));
    }

    /// Replay one row into the current table. Produces whether the row was inserted, rows which
    /// cannot belong to the table are counted as failed.
    pub fn assemble_cell(&mut self, cell: &Cell) -> Result<bool> {
        let Some(table) = self.table.as_mut() else {
            return Err(Error::Misuse("no table is being assembled".into()));
        };

        if table.columns.is_none() {
            let columns = resolve_columns(&mut self.destination, &table.name)?;
            table.insert_sql = insert_sql(&table.name, &columns, self.config.insert_or_ignore);
            table.columns = Some(columns);
        }
        let columns = table.columns.as_deref().unwrap_or_default();

        let values = match bind_values(columns, cell) {
            Ok(values) => values,
            Err(reason) => {
                warn!(
                    "failed row {} of {} from page {}: {reason}",
                    cell.rowid, table.name, cell.page
                );
                table.report.failed += 1;
                return Ok(false);
            }
        };

        if !self.in_transaction {
            self.destination
                .execute("BEGIN")
                .map_err(Error::Destination)?;
            self.in_transaction = true;
        }

        match self.destination.execute_with(&table.insert_sql, &values) {
            Ok(_) => table.report.recovered += 1,
            Err(e) => {
                warn!("failed to insert row {} of {}: {e}", cell.rowid, table.name);
                table.report.failed += 1;
                return Ok(false);
            }
        }

        self.pending += 1;
        if self.pending >= self.config.batch_size {
            self.destination
                .execute("COMMIT; BEGIN;")
                .map_err(Error::Destination)?;
            self.pending = 0;
        }

        Ok(true)
    }

    /// Count a row of the current table that could not be decoded.
    pub fn mark_cell_failed(&mut self) {
        if let Some(table) = self.table.as_mut() {
            table.report.failed += 1;
        }
    }

    /// Raise the sequence of `table` to at least `seq`.
    pub fn assemble_sequence(&mut self, table: &str, seq: i64) -> Result<()> {
        self.commit()?;

        let updated = self
            .destination
            .execute_with(
                &format!("UPDATE {SEQUENCE_TABLE} SET seq = max(seq, ?1) WHERE name = ?2"),
                &[Value::Integer(seq), Value::Text(table.as_bytes().to_vec())],
            )
            .map_err(Error::Destination)?;

        if updated == 0 {
            self.destination
                .execute_with(
                    &format!("INSERT INTO {SEQUENCE_TABLE}(name, seq) VALUES(?1, ?2)"),
                    &[Value::Text(table.as_bytes().to_vec()), Value::Integer(seq)],
                )
                .map_err(Error::Destination)?;
        }

        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.destination
                .execute("COMMIT")
                .map_err(Error::Destination)?;
            self.in_transaction = false;
            self.pending = 0;
        }
        Ok(())
    }

    /// Commit the rows of the current table.
    pub fn finish_table(&mut self) -> Result<()> {
        self.commit()?;

        if let Some(table) = self.table.take() {
            debug!(
                "assembled {}: {} rows recovered, {} failed",
                table.name, table.report.recovered, table.report.failed
            );
            self.tables.push(table.report);
        }
        Ok(())
    }

    /// Abandon the uncommitted rows of the current table.
    pub fn cancel(&mut self) -> Result<()> {
        if self.in_transaction {
            self.destination
                .execute("ROLLBACK")
                .map_err(Error::Destination)?;
            self.in_transaction = false;
            self.pending = 0;
        }
        if let Some(table) = self.table.take() {
            self.tables.push(TableReport {
                recovered: 0,
                ..table.report
            });
        }
        Ok(())
    }

    /// Commit the current table and run deferred statements, producing the per table reports.
    pub fn finish(mut self) -> Result<(Vec<TableReport>, D)> {
        self.finish_table()?;

        for sql in std::mem::take(&mut self.deferred) {
            if let Err(e) = self.destination.execute(&sql) {
                warn!("failed to run deferred statement {sql}: {e}");
            }
        }

        let recovered = self.tables.iter().map(|t| t.recovered).sum::<usize>();
        info!(
            "assembled {} tables with {recovered} rows",
            self.tables.len()
        );
        Ok((self.tables, self.destination))
    }
}

fn resolve_columns<D: Destination>(destination: &mut D, table: &str) -> Result<Vec<Column>> {
    let info = destination.table_info(table).map_err(Error::Destination)?;
    if info.is_empty() {
        return Err(Error::Misuse(format!("table {table} does not exist in destination")));
    }

    let primary_keys = info.iter().filter(|c| c.primary_key > 0).count();

    info.into_iter()
        .map(|column| {
            let default = match &column.default {
                Some(expr) => destination.evaluate(expr).map_err(Error::Destination)?,
                None => Value::Null,
            };

            Ok(Column {
                affinity: Affinity::of(&column.declared_type),
                integer_primary_key: primary_keys == 1
                    && column.primary_key == 1
                    && column.declared_type.eq_ignore_ascii_case("INTEGER"),
                not_null: column.not_null,
                default,
                name: column.name,
            })
        })
        .collect()
}

/// Values to bind after the rowid, padded with defaults for columns the row predates.
fn bind_values(columns: &[Column], cell: &Cell) -> Result<Vec<Value>, &'static str> {
    if cell.values.len() > columns.len() {
        return Err("row has more columns than the table");
    }

    let mut values = Vec::with_capacity(columns.len() + 1);
    values.push(Value::Integer(cell.rowid));

    for (i, column) in columns.iter().enumerate() {
        // Defaults were evaluated by the destination, only decoded values are checked.
        let Some(value) = cell.values.get(i) else {
            values.push(match &column.default {
                Value::Null if column.integer_primary_key => Value::Integer(cell.rowid),
                Value::Null if column.not_null => return Err("null value in not null column"),
                default => default.clone(),
            });
            continue;
        };

        let value = match value {
            Value::Integer(_) | Value::Real(_) if column.affinity == Affinity::Text => {
                return Err("numeric value in text column");
            }
            Value::Null if column.integer_primary_key => Value::Integer(cell.rowid),
            Value::Null if column.not_null => return Err("null value in not null column"),
            value => value.clone(),
        };
        values.push(value);
    }

    Ok(values)
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn insert_sql(table: &str, columns: &[Column], or_ignore: bool) -> String {
    let names = columns
        .iter()
        .map(|c| format!(", {}", quote_identifier(&c.name)))
        .collect::<String>();
    let params = (2..=columns.len() + 1)
        .map(|i| format!(", ?{i}"))
        .collect::<String>();

    format!(
        "INSERT {}INTO {}(rowid{names}) VALUES(?1{params})",
        if or_ignore { "OR IGNORE " } else { "" },
        quote_identifier(table),
    )
}

/// Spans of the leading words of a statement.
fn words(sql: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut rest = 0;
    std::iter::from_fn(move || {
        let start = rest + sql[rest..].find(|c: char| !c.is_whitespace())?;
        let end = sql[start..]
            .find(|c: char| c.is_whitespace() || c == '(' || c == '"')
            .map(|len| start + len.max(1))
            .unwrap_or(sql.len());
        rest = end;
        Some((start, &sql[start..end]))
    })
}

/// Rewrite a `CREATE` statement so that it tolerates the object already existing.
fn if_not_exists(sql: &str) -> String {
    let mut words = words(sql).take(5);
    if !words
        .next()
        .is_some_and(|(_, w)| w.eq_ignore_ascii_case("CREATE"))
    {
        return sql.to_string();
    }

    let keywords = ["TABLE", "INDEX", "VIEW", "TRIGGER"];
    while let Some((start, word)) = words.next() {
        if keywords.iter().any(|k| word.eq_ignore_ascii_case(k)) {
            if words
                .next()
                .is_some_and(|(_, next)| next.eq_ignore_ascii_case("IF"))
            {
                return sql.to_string();
            }

            let end = start + word.len();
            return format!("{} IF NOT EXISTS{}", &sql[..end], &sql[end..]);
        }
    }

    sql.to_string()
}
