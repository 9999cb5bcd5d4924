use std::path::Path;

use anyhow::Context;
use rusqlite::{
    Connection, ToSql, params_from_iter,
    types::{ToSqlOutput, ValueRef},
};

use super::{ColumnInfo, Destination, quote_identifier};
use crate::page::cell::Value;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(value) => ToSqlOutput::Borrowed(ValueRef::Integer(*value)),
            Value::Real(value) => ToSqlOutput::Borrowed(ValueRef::Real(*value)),
            Value::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value)),
            Value::Blob(value) => ToSqlOutput::Borrowed(ValueRef::Blob(value)),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(value) => Self::Integer(value),
            ValueRef::Real(value) => Self::Real(value),
            ValueRef::Text(value) => Self::Text(value.to_vec()),
            ValueRef::Blob(value) => Self::Blob(value.to_vec()),
        }
    }
}

/// Destination backed by a [`rusqlite::Connection`].
#[derive(Debug)]
pub struct SqliteDestination(Connection);

impl SqliteDestination {
    pub fn new(connection: Connection) -> Self {
        Self(connection)
    }

    /// Open, or create, the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let connection = Connection::open(path)
            .with_context(|| format!("opening destination {}", path.display()))?;
        Ok(Self(connection))
    }

    pub fn connection(&self) -> &Connection {
        &self.0
    }

    pub fn into_inner(self) -> Connection {
        self.0
    }
}

impl Destination for SqliteDestination {
    fn execute(&mut self, sql: &str) -> anyhow::Result<()> {
        self.0
            .execute_batch(sql)
            .with_context(|| format!("executing {sql}"))
    }

    fn execute_with(&mut self, sql: &str, values: &[Value]) -> anyhow::Result<usize> {
        let mut statement = self
            .0
            .prepare_cached(sql)
            .with_context(|| format!("preparing {sql}"))?;
        Ok(statement.execute(params_from_iter(values))?)
    }

    fn table_info(&mut self, table: &str) -> anyhow::Result<Vec<ColumnInfo>> {
        let mut statement = self
            .0
            .prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
        let columns = statement
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get("name")?,
                    declared_type: row.get("type")?,
                    not_null: row.get("notnull")?,
                    default: row.get("dflt_value")?,
                    primary_key: row.get("pk")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn evaluate(&mut self, expr: &str) -> anyhow::Result<Value> {
        Ok(self
            .0
            .query_row(&format!("SELECT {expr}"), [], |row| {
                row.get_ref(0).map(Value::from)
            })?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn values_round_trip_through_sqlite() {
        let mut destination = SqliteDestination::new(Connection::open_in_memory().unwrap());
        destination
            .execute("CREATE TABLE t(a, b, c, d, e)")
            .unwrap();

        let values = vec![
            Value::Integer(1),
            Value::Null,
            Value::Integer(-7),
            Value::Real(2.5),
            Value::Text(b"text".to_vec()),
            Value::Blob(vec![0, 1, 2]),
        ];
        let changed = destination
            .execute_with(
                "INSERT INTO t(rowid, a, b, c, d, e) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                &values,
            )
            .unwrap();
        assert_eq!(changed, 1);

        let row = destination
            .connection()
            .query_row("SELECT rowid, a, b, c, d, e FROM t", [], |row| {
                (0..6)
                    .map(|i| row.get_ref(i).map(Value::from))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .unwrap();
        assert_eq!(row, values);
    }

    #[test]
    fn table_info_and_defaults() {
        let mut destination = SqliteDestination::new(Connection::open_in_memory().unwrap());
        destination
            .execute(
                "CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT NOT NULL DEFAULT ('x' || 'y'))",
            )
            .unwrap();

        let info = destination.table_info("t").unwrap();
        assert_eq!(
            info,
            vec![
                ColumnInfo {
                    name: "id".into(),
                    declared_type: "INTEGER".into(),
                    not_null: false,
                    default: None,
                    primary_key: 1,
                },
                ColumnInfo {
                    name: "name".into(),
                    declared_type: "TEXT".into(),
                    not_null: true,
                    default: Some("'x' || 'y'".into()),
                    primary_key: 0,
                },
            ]
        );

        let default = destination.evaluate(info[1].default.as_deref().unwrap()).unwrap();
        assert_eq!(default, Value::Text(b"xy".to_vec()));
        assert!(destination.table_info("missing").unwrap().is_empty());
    }
}
