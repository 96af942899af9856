//! Backing store drivers.
//!
//! A [`Dialect`] turns entities into SQL text for one database family. The
//! shared statement shapes live in default methods; each dialect overrides
//! the fragments where its database differs. [`Connector`] and
//! [`Connection`] are where network drivers plug in. SQLite ships in-tree.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::assertion::Assertion;
use crate::config::Credentials;
use crate::datatype::{self, BaseKind};
use crate::entity::{Attribute, Entity, Registry};
use crate::error::Result;
use crate::subtype::Unique;
use crate::value::{Row, Value};

pub mod flatfile;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use flatfile::{FlatfileFormat, FlatfileStore};
pub use mysql::MySql;
pub use postgres::Postgres;
pub use sqlite::{Sqlite, SqliteConnection, SqliteConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialectKind {
    MySql,
    Postgres,
    Sqlite,
}

static MYSQL: MySql = MySql;
static POSTGRES: Postgres = Postgres;
static SQLITE: Sqlite = Sqlite;

impl DialectKind {
    pub const ALL: [DialectKind; 3] = [Self::MySql, Self::Postgres, Self::Sqlite];

    pub const fn name(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            Self::MySql => &MYSQL,
            Self::Postgres => &POSTGRES,
            Self::Sqlite => &SQLITE,
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An open connection to one database.
pub trait Connection: Send {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize>;
    fn execute_batch(&mut self, sql: &str) -> Result<()>;
    /// Key generated by the last INSERT, when the driver reports it directly.
    /// Otherwise the engine asks the dialect for a query.
    fn last_insert_id(&mut self) -> Result<Option<i64>> {
        Ok(None)
    }
}

/// Opens connections for one dialect.
pub trait Connector: Send + Sync {
    fn dialect(&self) -> DialectKind;
    fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Connection>>;
}

/// SQL generation for one database family.
pub trait Dialect: Send + Sync {
    fn kind(&self) -> DialectKind;

    /// Column type for a base kind. `keyed` is set when the column takes
    /// part in a primary or unique key.
    fn base_column_type(&self, assertion: &Assertion, keyed: bool) -> String;
    /// The column type that makes a datetime attribute native instead of epoch.
    fn native_datetime_type(&self) -> &'static str;
    /// Full column definition, after the name, of a serial primary key.
    fn serial_primary_key(&self) -> &'static str;

    fn serial_reference_type(&self) -> &'static str {
        "BIGINT"
    }
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
    fn table_ref(&self, entity: &Entity) -> String {
        self.quote_ident(entity.table())
    }
    /// Bind placeholder for the 1-based parameter `index`.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }
    fn begin(&self) -> &'static str {
        "BEGIN"
    }
    fn commit(&self) -> &'static str {
        "COMMIT"
    }
    fn rollback(&self) -> &'static str {
        "ROLLBACK"
    }
    /// References inline on the column, or as table-level FOREIGN KEY clauses.
    fn inline_references(&self) -> bool {
        true
    }
    fn foreign_keys_by_default(&self) -> bool {
        true
    }
    fn table_options(&self) -> &'static str {
        ""
    }
    fn last_insert_id_sql(&self, _entity: &Entity) -> Option<String> {
        None
    }
    fn limit_clause(&self, limit: usize, offset: usize) -> String {
        format!("LIMIT {limit} OFFSET {offset}")
    }

    fn encode_datetime(&self, time: DateTime<Utc>) -> Value {
        Value::Text(time.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
    }
    fn decode_datetime(&self, raw: Value) -> std::result::Result<Value, String> {
        match raw {
            Value::Text(text) => datatype::parse_time(&text).map(Value::Time),
            other => BaseKind::DateTime.from_storage(other),
        }
    }
    fn quote_datetime(&self, time: DateTime<Utc>) -> String {
        format!("'{}'", time.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
    fn quote_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => i64::from(*b).to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Time(t) => self.quote_datetime(*t),
            other => format!("'{}'", other.to_string().replace('\'', "''")),
        }
    }

    fn uses_native_datetime(&self, assertion: &Assertion) -> bool {
        assertion.kind() == BaseKind::DateTime && assertion.column_type().is_some_and(is_datetime_type)
    }
    /// Typed value to bound parameter.
    fn encode(&self, assertion: &Assertion, value: &Value) -> Value {
        match value {
            Value::Time(t) if self.uses_native_datetime(assertion) => self.encode_datetime(*t),
            other => assertion.kind().to_storage(other),
        }
    }
    /// Column value to typed value.
    fn decode(&self, assertion: &Assertion, raw: Value) -> std::result::Result<Value, String> {
        if self.uses_native_datetime(assertion) && !raw.is_null() {
            self.decode_datetime(raw)
        } else {
            assertion.kind().from_storage(raw)
        }
    }

    fn column_type(&self, assertion: &Assertion, keyed: bool, registry: &Registry) -> String {
        if let Some(column_type) = assertion.column_type() {
            return column_type.to_string();
        }
        if assertion.kind() == BaseKind::Ref {
            if let Some(target) = assertion.member_class().and_then(|name| registry.resolve(name)) {
                let pk = target.pk_assertion();
                if pk.is_serial() {
                    return self.serial_reference_type().to_string();
                }
                if pk.kind() != BaseKind::Ref {
                    return self.column_type(pk, true, registry);
                }
            }
        }
        self.base_column_type(assertion, keyed)
    }

    fn references(&self, entity: &Entity, assertion: &Assertion, registry: &Registry) -> Option<String> {
        if assertion.kind() != BaseKind::Ref {
            return None;
        }
        let target = registry.resolve(assertion.member_class()?)?;
        if !target.uses_db() || target.database() != entity.database() {
            return None;
        }
        let mut clause = format!(
            "REFERENCES {} ({})",
            self.table_ref(&target),
            self.quote_ident(target.primary_key())
        );
        if let Some(action) = assertion.on_delete() {
            clause.push_str(&format!(" ON DELETE {}", action.sql()));
        }
        if let Some(action) = assertion.on_update() {
            clause.push_str(&format!(" ON UPDATE {}", action.sql()));
        }
        Some(clause)
    }

    fn column_definition(
        &self,
        entity: &Entity,
        attribute: &Attribute,
        registry: &Registry,
        foreign_keys: bool,
    ) -> String {
        let assertion = attribute.assertion();
        let is_pk = attribute.name() == entity.primary_key();
        let mut parts = vec![self.quote_ident(attribute.name())];
        if is_pk && assertion.is_serial() {
            parts.push(self.serial_primary_key().to_string());
            return parts.join(" ");
        }
        let keyed = is_pk || is_keyed(entity, attribute.name());
        parts.push(self.column_type(assertion, keyed, registry));
        if !assertion.is_optional() {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = assertion.default_value() {
            parts.push(format!("DEFAULT {}", self.quote_literal(&self.encode(assertion, default))));
        }
        if is_pk {
            parts.push("PRIMARY KEY".to_string());
        } else if *assertion.unique() == Unique::Single {
            parts.push("UNIQUE".to_string());
        }
        if foreign_keys && self.inline_references() {
            if let Some(reference) = self.references(entity, assertion, registry) {
                parts.push(reference);
            }
        }
        parts.join(" ")
    }

    /// `CREATE TABLE IF NOT EXISTS` for one entity. Collection attributes
    /// have no column; their element entities get tables of their own.
    fn schema_ddl(&self, entity: &Entity, registry: &Registry) -> String {
        let foreign_keys = entity.config().foreign_keys.unwrap_or(self.foreign_keys_by_default());
        let columns: Vec<&Attribute> =
            entity.attributes().iter().filter(|a| !a.assertion().is_collection()).collect();

        let mut lines: Vec<String> = columns
            .iter()
            .map(|a| self.column_definition(entity, a, registry, foreign_keys))
            .collect();
        if foreign_keys && !self.inline_references() {
            for attribute in &columns {
                if let Some(reference) = self.references(entity, attribute.assertion(), registry) {
                    lines.push(format!("FOREIGN KEY ({}) {reference}", self.quote_ident(attribute.name())));
                }
            }
        }
        for group in entity.unique_groups().iter().filter(|g| g.len() > 1) {
            let quoted: Vec<String> = group.iter().map(|c| self.quote_ident(c)).collect();
            lines.push(format!("UNIQUE ({})", quoted.join(", ")));
        }

        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.table_ref(entity),
            lines.join(",\n    ")
        );
        let options = self.table_options();
        if !options.is_empty() {
            sql.push(' ');
            sql.push_str(options);
        }
        sql
    }

    fn where_clause(&self, columns: &[&str], first: usize) -> String {
        if columns.is_empty() {
            return String::new();
        }
        let terms: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote_ident(c), self.placeholder(first + i)))
            .collect();
        format!(" WHERE {}", terms.join(" AND "))
    }

    fn select_sql(&self, entity: &Entity, key_columns: &[&str]) -> String {
        let columns: Vec<String> = entity.select_columns().iter().map(|c| self.quote_ident(c)).collect();
        format!(
            "SELECT {} FROM {}{}",
            columns.join(", "),
            self.table_ref(entity),
            self.where_clause(key_columns, 1)
        )
    }

    /// INSERT statement and the columns bound to it, in order. Columns with
    /// an insert expression take the expression instead of a parameter.
    fn insert_sql(&self, entity: &Entity) -> (String, Vec<String>) {
        let mut names = Vec::new();
        let mut values = Vec::new();
        let mut bound = Vec::new();
        for column in entity.insert_columns() {
            names.push(self.quote_ident(column));
            match entity.attribute(column).and_then(|a| a.sql_insert_value()) {
                Some(expression) => values.push(expression.to_string()),
                None => {
                    bound.push(column.to_string());
                    values.push(self.placeholder(bound.len()));
                }
            }
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table_ref(entity),
            names.join(", "),
            values.join(", ")
        );
        (sql, bound)
    }

    /// UPDATE by primary key; the key is the last bound column.
    fn update_sql(&self, entity: &Entity) -> (String, Vec<String>) {
        let mut assignments = Vec::new();
        let mut bound = Vec::new();
        for column in entity.update_columns() {
            match entity.attribute(column).and_then(|a| a.sql_update_value()) {
                Some(expression) => assignments.push(format!("{} = {expression}", self.quote_ident(column))),
                None => {
                    bound.push(column.to_string());
                    assignments.push(format!("{} = {}", self.quote_ident(column), self.placeholder(bound.len())));
                }
            }
        }
        let pk = entity.primary_key();
        let sql = format!(
            "UPDATE {} SET {}{}",
            self.table_ref(entity),
            assignments.join(", "),
            self.where_clause(&[pk], bound.len() + 1)
        );
        bound.push(pk.to_string());
        (sql, bound)
    }

    fn upsert_clause(&self, entity: &Entity) -> String {
        let assignments: Vec<String> = entity
            .update_columns()
            .iter()
            .map(|c| {
                let column = self.quote_ident(c);
                match entity.attribute(c).and_then(|a| a.sql_update_value()) {
                    Some(expression) => format!("{column} = {expression}"),
                    None => format!("{column} = excluded.{column}"),
                }
            })
            .collect();
        let pk = self.quote_ident(entity.primary_key());
        if assignments.is_empty() {
            format!("ON CONFLICT ({pk}) DO NOTHING")
        } else {
            format!("ON CONFLICT ({pk}) DO UPDATE SET {}", assignments.join(", "))
        }
    }

    fn upsert_sql(&self, entity: &Entity) -> (String, Vec<String>) {
        let (insert, bound) = self.insert_sql(entity);
        (format!("{insert} {}", self.upsert_clause(entity)), bound)
    }

    fn delete_sql(&self, entity: &Entity, key_column: &str) -> String {
        format!("DELETE FROM {}{}", self.table_ref(entity), self.where_clause(&[key_column], 1))
    }

    fn count_sql(&self, query: &str) -> String {
        format!("SELECT COUNT(*) FROM ({query}) stream_count")
    }
}

fn is_datetime_type(column_type: &str) -> bool {
    let upper = column_type.trim().to_ascii_uppercase();
    upper.starts_with("DATE") || upper.starts_with("TIMESTAMP") || upper.starts_with("TIME")
}

/// Whether `attribute` takes part in a unique key of `entity`.
fn is_keyed(entity: &Entity, attribute: &str) -> bool {
    entity.unique_groups().iter().any(|group| group.iter().any(|c| c == attribute))
}

/// Width of a bounded string column, when the bound is small enough for VARCHAR.
pub(crate) fn text_width(assertion: &Assertion) -> Option<usize> {
    assertion.size().or(assertion.max_size()).filter(|n| *n > 0 && *n <= 255)
}

/// Whether an integer column needs 64 bits for its declared bounds.
pub(crate) fn needs_bigint(assertion: &Assertion) -> bool {
    let limit = f64::from(i32::MAX);
    assertion.min().is_some_and(|m| m.abs() > limit) || assertion.max().is_some_and(|m| m.abs() > limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[test]
    fn statements_bind_in_column_order() {
        let registry = Registry::new();
        let person = registry
            .declare(
                Entity::builder("Shop::Person")
                    .attribute("age", Assertion::int().optional())
                    .attribute("seen", Assertion::datetime().optional().sql_update_value("CURRENT_TIMESTAMP")),
            )
            .unwrap();
        let dialect = DialectKind::Postgres.dialect();
        let (update, bound) = dialect.update_sql(&person);
        assert_eq!(
            update,
            r#"UPDATE "person" SET "name" = $1, "mtime" = $2, "age" = $3, "seen" = CURRENT_TIMESTAMP WHERE "id" = $4"#
        );
        assert_eq!(bound, vec!["name", "mtime", "age", "id"]);

        let (insert, bound) = DialectKind::Sqlite.dialect().insert_sql(&person);
        assert_eq!(
            insert,
            r#"INSERT INTO "person" ("id", "name", "ctime", "mtime", "age", "seen") VALUES (?, ?, ?, ?, ?, ?)"#
        );
        assert_eq!(bound.len(), 6);
    }

    #[test]
    fn native_datetime_columns_are_encoded_as_text() {
        let stamp = Assertion::datetime().column_type("DATETIME").build().unwrap();
        let epoch = Assertion::datetime().build().unwrap();
        let dialect = DialectKind::Sqlite.dialect();
        let now = datatype::now();
        assert!(matches!(dialect.encode(&stamp, &Value::Time(now)), Value::Text(_)));
        assert!(matches!(dialect.encode(&epoch, &Value::Time(now)), Value::Float(_)));
        let back = dialect.decode(&stamp, dialect.encode(&stamp, &Value::Time(now))).unwrap();
        assert_eq!(back, Value::Time(now));
    }

    #[test]
    fn literals_are_escaped() {
        let dialect = DialectKind::MySql.dialect();
        assert_eq!(dialect.quote_literal(&Value::from("O'Brien")), "'O''Brien'");
        assert_eq!(dialect.quote_literal(&Value::Bool(true)), "1");
        assert_eq!(dialect.quote_literal(&Value::Null), "NULL");
    }
}
