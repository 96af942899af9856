use crate::assertion::Assertion;
use crate::datatype::BaseKind;
use crate::driver::{Dialect, DialectKind, needs_bigint, text_width};
use crate::entity::Entity;

/// MySQL / MariaDB. Connections come from an external [`crate::driver::Connector`],
/// which must report found rows rather than changed rows for UPDATE.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

impl Dialect for MySql {
    fn kind(&self) -> DialectKind {
        DialectKind::MySql
    }
    fn base_column_type(&self, assertion: &Assertion, keyed: bool) -> String {
        match assertion.kind() {
            BaseKind::Str => match text_width(assertion) {
                Some(n) => format!("VARCHAR({n})"),
                // TEXT columns cannot be keyed without a prefix length
                None if keyed || assertion.is_indexed() => "VARCHAR(255)".to_string(),
                None => "TEXT".to_string(),
            },
            BaseKind::Int if needs_bigint(assertion) => "BIGINT".to_string(),
            BaseKind::Int => "INTEGER".to_string(),
            BaseKind::Bool => "TINYINT(1)".to_string(),
            BaseKind::Float | BaseKind::DateTime => "DOUBLE".to_string(),
            BaseKind::Decimal => "DECIMAL(30,10)".to_string(),
            BaseKind::Id | BaseKind::Ref => "VARCHAR(64)".to_string(),
            BaseKind::Array | BaseKind::Hash => "TEXT".to_string(),
        }
    }
    fn native_datetime_type(&self) -> &'static str {
        "DATETIME(3)"
    }
    fn serial_primary_key(&self) -> &'static str {
        "BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY"
    }
    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }
    fn begin(&self) -> &'static str {
        "START TRANSACTION"
    }
    fn inline_references(&self) -> bool {
        false
    }
    fn table_options(&self) -> &'static str {
        "ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
    }
    fn last_insert_id_sql(&self, _entity: &Entity) -> Option<String> {
        Some("SELECT LAST_INSERT_ID()".to_string())
    }
    fn upsert_clause(&self, entity: &Entity) -> String {
        let mut assignments: Vec<String> = entity
            .update_columns()
            .iter()
            .map(|c| {
                let column = self.quote_ident(c);
                match entity.attribute(c).and_then(|a| a.sql_update_value()) {
                    Some(expression) => format!("{column} = {expression}"),
                    None => format!("{column} = VALUES({column})"),
                }
            })
            .collect();
        if assignments.is_empty() {
            // a no-op assignment keeps the statement valid
            let pk = self.quote_ident(entity.primary_key());
            assignments.push(format!("{pk} = {pk}"));
        }
        format!("ON DUPLICATE KEY UPDATE {}", assignments.join(", "))
    }
}
