// used for persistence
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::params_from_iter;
use std::path::PathBuf;
use tracing::debug;

use crate::assertion::Assertion;
use crate::config::Credentials;
use crate::datatype::BaseKind;
use crate::driver::{Connection, Connector, Dialect, DialectKind, text_width};
use crate::error::{NodecladError, Result};
use crate::value::{Row, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

impl Dialect for Sqlite {
    fn kind(&self) -> DialectKind {
        DialectKind::Sqlite
    }
    fn base_column_type(&self, assertion: &Assertion, _keyed: bool) -> String {
        match assertion.kind() {
            BaseKind::Str => text_width(assertion).map_or("TEXT".to_string(), |n| format!("VARCHAR({n})")),
            BaseKind::Int | BaseKind::Bool => "INTEGER".to_string(),
            BaseKind::Float | BaseKind::DateTime => "REAL".to_string(),
            // NUMERIC affinity would turn decimals into doubles
            BaseKind::Decimal => "TEXT".to_string(),
            BaseKind::Id | BaseKind::Ref | BaseKind::Array | BaseKind::Hash => "TEXT".to_string(),
        }
    }
    fn native_datetime_type(&self) -> &'static str {
        "DATETIME"
    }
    fn serial_primary_key(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }
    fn serial_reference_type(&self) -> &'static str {
        "INTEGER"
    }
    fn foreign_keys_by_default(&self) -> bool {
        false
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Decimal(d) => SqlValue::Text(d.to_string()),
        Value::Time(t) => SqlValue::Real(t.timestamp_millis() as f64 / 1000.0),
        Value::List(_) | Value::Map(_) => SqlValue::Text(value.to_json().to_string()),
    }
}

fn from_sql(value: ValueRef) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// A rusqlite connection speaking the engine's [`Value`]s.
pub struct SqliteConnection {
    connection: rusqlite::Connection,
}

impl SqliteConnection {
    pub fn new(connection: rusqlite::Connection) -> Self {
        Self { connection }
    }
}

impl Connection for SqliteConnection {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        debug!(sql = %sql, params = params.len(), "query");
        let mut statement = self.connection.prepare_cached(sql).map_err(|e| NodecladError::query(sql, e))?;
        let width = statement.column_count();
        let bound: Vec<SqlValue> = params.iter().map(to_sql).collect();
        let mut rows = statement.query(params_from_iter(bound.iter())).map_err(|e| NodecladError::query(sql, e))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(|e| NodecladError::query(sql, e))? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get_ref(i).map_err(|e| NodecladError::query(sql, e))?));
            }
            result.push(values);
        }
        Ok(result)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        debug!(sql = %sql, params = params.len(), "execute");
        let bound: Vec<SqlValue> = params.iter().map(to_sql).collect();
        self.connection
            .execute(sql, params_from_iter(bound.iter()))
            .map_err(|e| NodecladError::query(sql, e))
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        debug!(sql = %sql, "execute batch");
        self.connection.execute_batch(sql).map_err(|e| NodecladError::query(sql, e))
    }

    fn last_insert_id(&mut self) -> Result<Option<i64>> {
        Ok(Some(self.connection.last_insert_rowid()))
    }
}

/// Opens one SQLite database per entity database, either in memory or as
/// `<root>/<database>.sqlite`.
#[derive(Debug, Clone, Default)]
pub struct SqliteConnector {
    root: Option<PathBuf>,
}

impl SqliteConnector {
    pub fn in_memory() -> Self {
        Self { root: None }
    }
    pub fn on_disk(root: impl Into<PathBuf>) -> Self {
        Self { root: Some(root.into()) }
    }
}

impl Connector for SqliteConnector {
    fn dialect(&self) -> DialectKind {
        DialectKind::Sqlite
    }

    fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Connection>> {
        let failed = |message: String| NodecladError::DbConnectFailed {
            dialect: DialectKind::Sqlite.to_string(),
            database: credentials.database.clone(),
            message,
        };
        let connection = match &self.root {
            None => rusqlite::Connection::open_in_memory(),
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| NodecladError::file(root, e))?;
                rusqlite::Connection::open(root.join(format!("{}.sqlite", credentials.database)))
            }
        }
        .map_err(|e| failed(e.to_string()))?;
        connection.execute_batch("PRAGMA foreign_keys = ON;").map_err(|e| failed(e.to_string()))?;
        debug!(database = %credentials.database, on_disk = self.root.is_some(), "opened sqlite database");
        Ok(Box::new(SqliteConnection::new(connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_a_query() {
        let mut connection = SqliteConnector::in_memory()
            .connect(&Credentials { database: "scratch".into(), ..Default::default() })
            .unwrap();
        connection.execute_batch("CREATE TABLE t (a INTEGER, b REAL, c TEXT)").unwrap();
        let inserted = connection
            .execute("INSERT INTO t (a, b, c) VALUES (?, ?, ?)", &[Value::Int(7), Value::Float(1.5), Value::Null])
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(connection.last_insert_id().unwrap(), Some(1));
        let rows = connection.query("SELECT a, b, c FROM t WHERE a = ?", &[Value::Int(7)]).unwrap();
        assert_eq!(rows, vec![vec![Value::Int(7), Value::Float(1.5), Value::Null]]);
    }

    #[test]
    fn bad_sql_names_the_statement() {
        let mut connection = SqliteConnector::in_memory().connect(&Credentials::default()).unwrap();
        match connection.query("SELEKT 1", &[]) {
            Err(NodecladError::DbQueryFailed { sql, .. }) => assert_eq!(sql, "SELEKT 1"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
