//! Rows of collection attributes.
//!
//! Each member of an array or hash is one row of the element entity, keyed
//! by a fresh GUID and pointing at its owner through `parentId`. Members
//! that are collections themselves own rows one level further down.

use std::collections::BTreeMap;

use uuid::Uuid;

use super::Session;
use crate::entity::{ELEMENT_VALUE, ElementShape, Entity, ID, PARENT_ID};
use crate::error::{NodecladError, Result};
use crate::value::Value;

fn shape(element: &Entity) -> Result<ElementShape> {
    element
        .element_of()
        .map(|of| of.shape)
        .ok_or_else(|| NodecladError::InvalidArgument(format!("{} is not an element entity", element.name())))
}

fn parent_param(session: &Session, element: &Entity, parent: &Value) -> Value {
    match element.attribute(PARENT_ID) {
        Some(assertion) => session.dialect.encode(assertion, parent),
        None => parent.clone(),
    }
}

/// Replaces whatever is stored for `parent` with the members of `value`.
pub(crate) fn save(session: &Session, element: &Entity, parent: &Value, value: &Value) -> Result<()> {
    delete(session, element, parent)?;
    let shape = shape(element)?;
    let slots: Vec<(Value, &Value)> = match (shape, value) {
        (_, Value::Null) => Vec::new(),
        (ElementShape::Indexed, Value::List(items)) => {
            items.iter().enumerate().map(|(i, member)| (Value::from(i), member)).collect()
        }
        (ElementShape::Keyed, Value::Map(entries)) => {
            entries.iter().map(|(key, member)| (Value::from(key), member)).collect()
        }
        (_, other) => {
            return Err(NodecladError::DataConversionFailed(format!(
                "{} cannot hold a {}",
                element.name(),
                other.type_name()
            )));
        }
    };
    if slots.is_empty() {
        return Ok(());
    }

    let (sql, bound) = session.dialect.insert_sql(element);
    let nested = element.element(ELEMENT_VALUE);
    for (slot, member) in slots {
        let id = Value::Text(Uuid::new_v4().to_string());
        let mut row = BTreeMap::new();
        row.insert(ID.to_string(), id.clone());
        row.insert(PARENT_ID.to_string(), parent.clone());
        row.insert(shape.slot_column().to_string(), slot);
        if nested.is_none() {
            row.insert(ELEMENT_VALUE.to_string(), member.clone());
        }
        session.execute(&sql, &session.params(element, &bound, &row))?;
        if let Some(nested) = nested {
            save(session, nested, &id, member)?;
        }
    }
    Ok(())
}

/// Members stored for `parent`, as a list or a map. No rows read back as
/// an empty collection.
pub(crate) fn load(session: &Session, element: &Entity, parent: &Value) -> Result<Value> {
    let shape = shape(element)?;
    let dialect = session.dialect;
    let nested = element.element(ELEMENT_VALUE);
    let mut columns = vec![dialect.quote_ident(ID), dialect.quote_ident(shape.slot_column())];
    if nested.is_none() {
        columns.push(dialect.quote_ident(ELEMENT_VALUE));
    }
    let sql = format!(
        "SELECT {} FROM {}{} ORDER BY {}",
        columns.join(", "),
        dialect.table_ref(element),
        dialect.where_clause(&[PARENT_ID], 1),
        dialect.quote_ident(shape.slot_column())
    );
    let rows = session.query(&sql, &[parent_param(session, element, parent)])?;

    let mut list = Vec::new();
    let mut map = BTreeMap::new();
    for row in rows {
        let mut cells = row.into_iter();
        let id = cells.next().unwrap_or(Value::Null);
        let slot = cells.next().unwrap_or(Value::Null);
        let member = match (nested, element.attribute(ELEMENT_VALUE)) {
            (Some(nested), _) => load(session, nested, &id)?,
            (None, Some(assertion)) => dialect
                .decode(assertion, cells.next().unwrap_or(Value::Null))
                .map_err(|e| NodecladError::DataConversionFailed(format!("{}: {e}", element.name())))?,
            (None, None) => cells.next().unwrap_or(Value::Null),
        };
        match shape {
            ElementShape::Indexed => list.push(member),
            ElementShape::Keyed => {
                map.insert(slot.to_string(), member);
            }
        }
    }
    Ok(match shape {
        ElementShape::Indexed => Value::List(list),
        ElementShape::Keyed => Value::Map(map),
    })
}

/// Deletes the members stored for `parent`, nested members first.
pub(crate) fn delete(session: &Session, element: &Entity, parent: &Value) -> Result<usize> {
    let dialect = session.dialect;
    let param = parent_param(session, element, parent);
    if let Some(nested) = element.element(ELEMENT_VALUE) {
        let sql = format!(
            "SELECT {} FROM {}{}",
            dialect.quote_ident(ID),
            dialect.table_ref(element),
            dialect.where_clause(&[PARENT_ID], 1)
        );
        for row in session.query(&sql, std::slice::from_ref(&param))? {
            if let Some(id) = row.into_iter().next() {
                delete(session, nested, &id)?;
            }
        }
    }
    session.execute(&dialect.delete_sql(element, PARENT_ID), &[param])
}
