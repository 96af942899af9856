//! Persistent objects.
//!
//! A [`Node`] is one object of a declared [`Entity`]: a map from attribute
//! name to typed [`Value`]. Nodes are plain data; loading and saving goes
//! through a [`crate::persist::Handle`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as Json};

use crate::assertion::{Detached, Resolver};
use crate::entity::{CTIME, Entity, MTIME, NAME};
use crate::error::{NodecladError, Result};
use crate::value::Value;

static NULL: Value = Value::Null;

#[derive(Debug, Clone)]
pub struct Node {
    entity: Arc<Entity>,
    values: BTreeMap<String, Value>,
}

impl Node {
    /// A new, unsaved node with the declared defaults applied.
    pub fn new(entity: &Arc<Entity>) -> Self {
        let values = entity
            .attributes()
            .iter()
            .filter_map(|a| a.assertion().default_value().map(|d| (a.name().to_string(), d.clone())))
            .collect();
        Self { entity: entity.clone(), values }
    }

    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    /// Value of `attribute`; null when unset.
    pub fn get(&self, attribute: &str) -> &Value {
        self.values.get(attribute).unwrap_or(&NULL)
    }

    pub fn set(&mut self, attribute: &str, value: impl Into<Value>) -> Result<&mut Self> {
        if !self.entity.has_attribute(attribute) {
            return Err(NodecladError::InvalidArgument(format!(
                "{} has no attribute '{attribute}'",
                self.entity.name()
            )));
        }
        let value = value.into();
        if value.is_null() {
            self.values.remove(attribute);
        } else {
            self.values.insert(attribute.to_string(), value);
        }
        Ok(self)
    }

    /// Builder-style [`Node::set`].
    pub fn with(mut self, attribute: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(attribute, value)?;
        Ok(self)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// The primary key value, null until assigned.
    pub fn key(&self) -> &Value {
        self.get(self.entity.primary_key())
    }
    /// String form of the primary key.
    pub fn id(&self) -> Option<String> {
        let key = self.key();
        if key.is_null() { None } else { Some(key.to_string()) }
    }
    pub fn name(&self) -> Option<&str> {
        self.get(NAME).as_str()
    }
    pub fn ctime(&self) -> Option<DateTime<Utc>> {
        self.get(CTIME).as_time()
    }
    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        self.get(MTIME).as_time()
    }

    /// Validates every attribute outside of any store.
    pub fn validate(&self) -> Result<()> {
        self.validate_with(&Detached)
    }

    /// Validates attributes in declaration order and stops at the first
    /// failure. A serial primary key may still be unassigned.
    pub fn validate_with(&self, resolver: &dyn Resolver) -> Result<()> {
        for attribute in self.entity.attributes() {
            let value = self.get(attribute.name());
            if value.is_null() && attribute.name() == self.entity.primary_key() && attribute.assertion().is_serial() {
                continue;
            }
            attribute.assertion().validate_with(attribute.name(), value, resolver)?;
        }
        Ok(())
    }

    /// Every attribute, unset ones as null. Times are epoch seconds.
    pub fn to_document(&self) -> Json {
        let map: Map<String, Json> = self
            .entity
            .attributes()
            .iter()
            .map(|a| (a.name().to_string(), self.get(a.name()).to_json()))
            .collect();
        Json::Object(map)
    }

    /// Reads a document back through the assertions of `entity`. Keys the
    /// entity does not declare are ignored.
    pub fn from_document(entity: &Arc<Entity>, document: &Json) -> Result<Self> {
        let Json::Object(map) = document else {
            return Err(NodecladError::DataConversionFailed(format!(
                "a {} document must be a map",
                entity.name()
            )));
        };
        let mut values = BTreeMap::new();
        for attribute in entity.attributes() {
            if let Some(json) = map.get(attribute.name()) {
                let value = attribute.assertion().from_document(json).map_err(|e| {
                    NodecladError::DataConversionFailed(format!("{}.{}: {e}", entity.name(), attribute.name()))
                })?;
                if !value.is_null() {
                    values.insert(attribute.name().to_string(), value);
                }
            }
        }
        Ok(Self { entity: entity.clone(), values })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_document())?)
    }
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.to_document())?)
    }
    pub fn from_json(entity: &Arc<Entity>, text: &str) -> Result<Self> {
        Self::from_document(entity, &serde_json::from_str(text)?)
    }
    pub fn from_yaml(entity: &Arc<Entity>, text: &str) -> Result<Self> {
        Self::from_document(entity, &serde_yaml::from_str(text)?)
    }

    pub(crate) fn restore(&mut self, attribute: &str, value: Value) {
        if value.is_null() {
            self.values.remove(attribute);
        } else {
            self.values.insert(attribute.to_string(), value);
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.entity.name() == other.entity.name() && self.values == other.values
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}[{id}]", self.entity.name()),
            None => write!(f, "{}[new]", self.entity.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::Assertion;
    use crate::entity::{Entity, Registry};

    fn person() -> Arc<Entity> {
        Registry::new()
            .declare(
                Entity::builder("Shop::Person")
                    .attribute("age", Assertion::int().min(0).max(150).optional())
                    .attribute("country", Assertion::str().default("SE"))
                    .attribute("tags", Assertion::array(Assertion::str())),
            )
            .unwrap()
    }

    #[test]
    fn defaults_apply_to_new_nodes() {
        let node = Node::new(&person());
        assert_eq!(node.get("country"), &Value::from("SE"));
        assert!(node.get("age").is_null());
        assert!(node.id().is_none());
    }

    #[test]
    fn unknown_attributes_are_rejected() {
        let mut node = Node::new(&person());
        assert!(matches!(node.set("height", 180), Err(NodecladError::InvalidArgument(_))));
    }

    #[test]
    fn documents_round_trip_through_yaml() {
        let entity = person();
        let node = Node::new(&entity)
            .with("id", "p-1")
            .unwrap()
            .with("age", 42)
            .unwrap()
            .with("ctime", crate::datatype::now())
            .unwrap()
            .with("tags", vec!["a", "b"])
            .unwrap();
        let back = Node::from_yaml(&entity, &node.to_yaml().unwrap()).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn validation_stops_at_the_first_failure() {
        let entity = person();
        let node = Node::new(&entity).with("age", 200).unwrap();
        let err = node.validate().unwrap_err();
        // id is declared before age and is still missing
        assert_eq!(err.assert_failed().unwrap().attribute, "id");
    }
}
