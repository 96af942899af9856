use chrono::{DateTime, Utc};

use crate::assertion::Assertion;
use crate::datatype::BaseKind;
use crate::driver::{Dialect, DialectKind, needs_bigint, text_width};
use crate::entity::Entity;

/// PostgreSQL. Connections come from an external [`crate::driver::Connector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }
    fn base_column_type(&self, assertion: &Assertion, _keyed: bool) -> String {
        match assertion.kind() {
            BaseKind::Str => text_width(assertion).map_or("TEXT".to_string(), |n| format!("VARCHAR({n})")),
            BaseKind::Int if needs_bigint(assertion) => "BIGINT".to_string(),
            BaseKind::Int => "INTEGER".to_string(),
            BaseKind::Bool => "SMALLINT".to_string(),
            BaseKind::Float | BaseKind::DateTime => "DOUBLE PRECISION".to_string(),
            BaseKind::Decimal => "NUMERIC(30,10)".to_string(),
            BaseKind::Id | BaseKind::Ref => "VARCHAR(64)".to_string(),
            BaseKind::Array | BaseKind::Hash => "TEXT".to_string(),
        }
    }
    fn native_datetime_type(&self) -> &'static str {
        "TIMESTAMP(3)"
    }
    fn serial_primary_key(&self) -> &'static str {
        "BIGSERIAL PRIMARY KEY"
    }
    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }
    fn quote_datetime(&self, time: DateTime<Utc>) -> String {
        format!("TIMESTAMP '{}'", time.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
    fn last_insert_id_sql(&self, entity: &Entity) -> Option<String> {
        Some(format!(
            "SELECT currval(pg_get_serial_sequence('{}', '{}'))",
            entity.table(),
            entity.primary_key()
        ))
    }
}
