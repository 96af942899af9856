// used to share declared entities between handles and nodes
use std::sync::{Arc, OnceLock, RwLock};

// entities are looked up by name a lot
use core::hash::BuildHasherDefault;
use std::collections::HashMap;
use seahash::SeaHasher;

// used to validate declared names
use lazy_static::lazy_static;
use regex::Regex;

// used to print out readable forms of an entity
use std::fmt;

// our own stuff that we need
use crate::assertion::{Assertion, AssertionBuilder};
use crate::config::ClassConfig;
use crate::datatype::BaseKind;
use crate::error::{NodecladError, Result};
use crate::subtype::{RefAction, Unique};

pub type NameHasher = BuildHasherDefault<SeaHasher>;

lazy_static! {
    static ref SEGMENT: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap();
    static ref ATTRIBUTE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

pub const ID: &str = "id";
pub const NAME: &str = "name";
pub const CTIME: &str = "ctime";
pub const MTIME: &str = "mtime";
pub const PARENT_ID: &str = "parentId";
pub const ELEMENT_INDEX: &str = "elementIndex";
pub const ELEMENT_KEY: &str = "elementKey";
pub const ELEMENT_VALUE: &str = "elementValue";

// ------------- Attribute -------------
#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    assertion: Arc<Assertion>,
}

impl Attribute {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn assertion(&self) -> &Arc<Assertion> {
        &self.assertion
    }
}

// ------------- Element -------------
/// How the rows of an element entity are keyed under their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementShape {
    /// Array members, ordered by `elementIndex`.
    Indexed,
    /// Hash members, keyed by `elementKey`.
    Keyed,
}

impl ElementShape {
    pub const fn slot_column(self) -> &'static str {
        match self {
            Self::Indexed => ELEMENT_INDEX,
            Self::Keyed => ELEMENT_KEY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElementOf {
    pub parent: String,
    pub attribute: String,
    pub shape: ElementShape,
}

// ------------- Entity -------------
/// A declared class of persistent objects: an ordered set of named
/// assertions plus the storage facts derived from its name and config.
#[derive(Debug)]
pub struct Entity {
    name: String,
    database: String,
    table: String,
    primary_key: String,
    attributes: Vec<Attribute>,
    positions: HashMap<String, usize, NameHasher>,
    config: ClassConfig,
    element_of: Option<ElementOf>,
    elements: OnceLock<Vec<(String, Arc<Entity>)>>,
}

impl Entity {
    pub fn builder(name: &str) -> EntityBuilder {
        EntityBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn database(&self) -> &str {
        &self.database
    }
    pub fn table(&self) -> &str {
        &self.table
    }
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }
    pub fn pk_assertion(&self) -> &Arc<Assertion> {
        // the primary key is checked to exist at declaration time
        &self.attributes[self.positions[&self.primary_key]].assertion
    }
    pub fn has_serial_key(&self) -> bool {
        self.pk_assertion().is_serial()
    }
    pub fn config(&self) -> &ClassConfig {
        &self.config
    }
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
    pub fn attribute(&self, name: &str) -> Option<&Arc<Assertion>> {
        self.positions.get(name).map(|i| &self.attributes[*i].assertion)
    }
    pub fn has_attribute(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }
    pub fn has_name(&self) -> bool {
        self.has_attribute(NAME)
    }
    pub fn element_of(&self) -> Option<&ElementOf> {
        self.element_of.as_ref()
    }
    pub fn uses_db(&self) -> bool {
        self.config.use_db
    }
    pub fn uses_flatfile(&self) -> bool {
        self.config.flatfile.is_some()
    }

    /// Columns read back by a load, in declaration order.
    pub fn select_columns(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| !a.assertion.is_collection())
            .map(|a| a.name.as_str())
            .collect()
    }
    /// Columns written by an INSERT; a serial primary key is left to the store.
    pub fn insert_columns(&self) -> Vec<&str> {
        self.select_columns()
            .into_iter()
            .filter(|c| !(*c == self.primary_key && self.has_serial_key()))
            .collect()
    }
    /// Columns written by an UPDATE.
    pub fn update_columns(&self) -> Vec<&str> {
        self.select_columns()
            .into_iter()
            .filter(|c| *c != self.primary_key && *c != CTIME)
            .collect()
    }
    pub fn collection_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.assertion.is_collection())
    }
    pub fn indexed_attributes(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| a.assertion.is_indexed())
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Column groups that must be unique across rows, apart from the primary key.
    pub fn unique_groups(&self) -> Vec<Vec<String>> {
        self.attributes
            .iter()
            .filter(|a| a.name != self.primary_key)
            .filter_map(|a| match a.assertion.unique() {
                Unique::No => None,
                Unique::Single => Some(vec![a.name.clone()]),
                Unique::With(co_keys) => {
                    let mut group = vec![a.name.clone()];
                    group.extend(co_keys.iter().cloned());
                    Some(group)
                }
            })
            .collect()
    }

    /// Element entities of every collection attribute, synthesized on first use.
    pub fn elements(&self) -> &[(String, Arc<Entity>)] {
        self.elements.get_or_init(|| {
            self.collection_attributes()
                .map(|a| (a.name.clone(), Arc::new(self.synthesize_element(a))))
                .collect()
        })
    }
    pub fn element(&self, attribute: &str) -> Option<&Arc<Entity>> {
        self.elements().iter().find(|(name, _)| name == attribute).map(|(_, e)| e)
    }

    fn synthesize_element(&self, attribute: &Attribute) -> Entity {
        let shape = if attribute.assertion.kind() == BaseKind::Hash {
            ElementShape::Keyed
        } else {
            ElementShape::Indexed
        };
        let slot = match shape {
            ElementShape::Indexed => Assertion::bare(BaseKind::Int),
            ElementShape::Keyed => Assertion::bare(BaseKind::Str),
        }
        .with_unique(Unique::With(vec![PARENT_ID.to_string()]));
        let value = attribute
            .assertion
            .member_type()
            .cloned()
            .unwrap_or_else(|| Arc::new(Assertion::optional_str()));

        let attributes = vec![
            Attribute { name: ID.to_string(), assertion: Arc::new(Assertion::bare(BaseKind::Id)) },
            Attribute {
                name: PARENT_ID.to_string(),
                assertion: Arc::new(Assertion::back_reference(&self.name, RefAction::Cascade)),
            },
            Attribute { name: shape.slot_column().to_string(), assertion: Arc::new(slot) },
            Attribute { name: ELEMENT_VALUE.to_string(), assertion: value },
        ];
        let config = ClassConfig {
            use_db: self.config.use_db,
            flatfile: None,
            use_archive: false,
            cache_ttl: None,
            primary_key: ID.to_string(),
            database: None,
            table: None,
            ..self.config.clone()
        };
        Entity {
            name: format!("{}::{}", self.name, capitalize(&attribute.name)),
            database: self.database.clone(),
            table: format!("{}_{}", self.table, attribute.name.to_lowercase()),
            primary_key: ID.to_string(),
            positions: index(&attributes),
            attributes,
            config,
            element_of: Some(ElementOf {
                parent: self.name.clone(),
                attribute: attribute.name.clone(),
                shape,
            }),
            elements: OnceLock::new(),
        }
    }

    /// Cache key of an object: the bare id for GUID keys, otherwise
    /// prefixed with the entity name.
    pub fn cache_key(&self, id: &str) -> String {
        if self.has_serial_key() || self.primary_key != ID {
            format!("{}:{}", self.name, id)
        } else {
            id.to_string()
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}.{})", self.name, self.database, self.table)
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn index(attributes: &[Attribute]) -> HashMap<String, usize, NameHasher> {
    attributes.iter().enumerate().map(|(i, a)| (a.name.clone(), i)).collect()
}

/// Database and table derived from a namespaced entity name:
/// `Shop::Order::Line` lives in database `shop`, table `order_line`.
pub fn storage_names(name: &str) -> (String, String) {
    let segments: Vec<String> = name.split("::").map(str::to_lowercase).collect();
    match segments.split_first() {
        Some((database, rest)) if !rest.is_empty() => (database.clone(), rest.join("_")),
        _ => (segments.join("_"), segments.join("_")),
    }
}

// ------------- Declaration -------------
/// Collects the declaration of an entity. Nothing is checked until
/// [`Registry::declare`].
pub struct EntityBuilder {
    name: String,
    extends: Option<Arc<Entity>>,
    attributes: Vec<(String, AssertionBuilder)>,
    config: ClassConfig,
}

impl EntityBuilder {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), extends: None, attributes: Vec::new(), config: ClassConfig::default() }
    }
    /// Inherits the attributes of `base`; own declarations override them.
    pub fn extends(mut self, base: &Arc<Entity>) -> Self {
        self.extends = Some(base.clone());
        self
    }
    pub fn attribute(mut self, name: &str, assertion: AssertionBuilder) -> Self {
        self.attributes.push((name.to_string(), assertion));
        self
    }
    pub fn config(mut self, config: ClassConfig) -> Self {
        self.config = config;
        self
    }

    fn build(self) -> Result<Entity> {
        let segments: Vec<&str> = self.name.split("::").collect();
        if segments.iter().any(|s| !SEGMENT.is_match(s)) {
            return Err(NodecladError::Declaration(format!("'{}' is not a valid entity name", self.name)));
        }

        let mut attributes = base_attributes();
        if let Some(base) = &self.extends {
            for inherited in base.attributes() {
                merge(&mut attributes, inherited.clone());
            }
        }
        for (name, builder) in self.attributes {
            if !ATTRIBUTE.is_match(&name) {
                return Err(NodecladError::Declaration(format!(
                    "'{name}' is not a valid attribute name of {}",
                    self.name
                )));
            }
            let assertion = builder.build().map_err(|e| match e {
                NodecladError::Declaration(message) => {
                    NodecladError::Declaration(format!("{}.{name}: {message}", self.name))
                }
                other => other,
            })?;
            merge(&mut attributes, Attribute { name, assertion: Arc::new(assertion) });
        }
        let positions = index(&attributes);

        let primary_key = self.config.primary_key.clone();
        let Some(pk) = positions.get(&primary_key).map(|i| &attributes[*i].assertion) else {
            return Err(NodecladError::Declaration(format!(
                "primary key '{primary_key}' is not an attribute of {}",
                self.name
            )));
        };
        if pk.is_collection() || pk.is_optional() {
            return Err(NodecladError::Declaration(format!(
                "primary key '{primary_key}' of {} must be a required scalar",
                self.name
            )));
        }
        for attribute in &attributes {
            if attribute.assertion.is_serial() && attribute.name != primary_key {
                return Err(NodecladError::Declaration(format!(
                    "only the primary key can be serial, not {}.{}",
                    self.name, attribute.name
                )));
            }
            if let Unique::With(co_keys) = attribute.assertion.unique() {
                if let Some(missing) = co_keys.iter().find(|k| !positions.contains_key(k.as_str())) {
                    return Err(NodecladError::Declaration(format!(
                        "co-key '{missing}' of {}.{} is not an attribute",
                        self.name, attribute.name
                    )));
                }
            }
        }
        if !self.config.use_db && self.config.flatfile.is_none() {
            return Err(NodecladError::Declaration(format!("{} has no backing store", self.name)));
        }

        let (database, table) = storage_names(&self.name);
        Ok(Entity {
            database: self.config.database.clone().unwrap_or(database),
            table: self.config.table.clone().unwrap_or(table),
            name: self.name,
            primary_key,
            attributes,
            positions,
            config: self.config,
            element_of: None,
            elements: OnceLock::new(),
        })
    }
}

fn base_attributes() -> Vec<Attribute> {
    let unique_name = Assertion::optional_str().with_unique(Unique::Single);
    vec![
        Attribute { name: ID.to_string(), assertion: Arc::new(Assertion::bare(BaseKind::Id)) },
        Attribute { name: NAME.to_string(), assertion: Arc::new(unique_name) },
        Attribute { name: CTIME.to_string(), assertion: Arc::new(Assertion::bare(BaseKind::DateTime)) },
        Attribute { name: MTIME.to_string(), assertion: Arc::new(Assertion::bare(BaseKind::DateTime)) },
    ]
}

fn merge(attributes: &mut Vec<Attribute>, attribute: Attribute) {
    match attributes.iter_mut().find(|a| a.name == attribute.name) {
        Some(existing) => *existing = attribute,
        None => attributes.push(attribute),
    }
}

// ------------- Registry -------------
/// Write-once catalog of declared entities.
#[derive(Debug, Default)]
pub struct Registry {
    entities: RwLock<HashMap<String, Arc<Entity>, NameHasher>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&self, builder: EntityBuilder) -> Result<Arc<Entity>> {
        let entity = Arc::new(builder.build()?);
        let mut entities = self.entities.write()?;
        if entities.contains_key(entity.name()) {
            return Err(NodecladError::Declaration(format!("{} is already declared", entity.name())));
        }
        for attribute in entity.attributes() {
            if let Some(target) = attribute.assertion.member_class() {
                if target != entity.name() && !entities.contains_key(target) {
                    return Err(NodecladError::Declaration(format!(
                        "{}.{} refers to undeclared {target}",
                        entity.name(),
                        attribute.name
                    )));
                }
            }
        }
        entities.insert(entity.name().to_string(), entity.clone());
        Ok(entity)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Entity>> {
        self.entities.read().ok().and_then(|entities| entities.get(name).cloned())
    }

    /// Finds a declared entity or one of the element entities synthesized
    /// beneath it.
    pub fn resolve(&self, name: &str) -> Option<Arc<Entity>> {
        if let Some(entity) = self.get(name) {
            return Some(entity);
        }
        let entities = self.entities.read().ok()?;
        entities
            .values()
            .filter(|e| name.starts_with(&format!("{}::", e.name())))
            .find_map(|e| find_element(e, name))
    }

    pub fn require(&self, name: &str) -> Result<Arc<Entity>> {
        self.resolve(name)
            .ok_or_else(|| NodecladError::InvalidArgument(format!("{name} is not a declared entity")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entities
            .read()
            .map(|entities| entities.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn find_element(entity: &Arc<Entity>, name: &str) -> Option<Arc<Entity>> {
    entity.elements().iter().find_map(|(_, element)| {
        if element.name() == name {
            Some(element.clone())
        } else if name.starts_with(&format!("{}::", element.name())) {
            find_element(element, name)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_names_follow_the_namespace() {
        assert_eq!(storage_names("Shop::Order::Line"), ("shop".to_string(), "order_line".to_string()));
        assert_eq!(storage_names("Shop::Person"), ("shop".to_string(), "person".to_string()));
        assert_eq!(storage_names("Person"), ("person".to_string(), "person".to_string()));
    }

    #[test]
    fn element_entities_hang_off_collections() {
        let registry = Registry::new();
        let person = registry
            .declare(
                Entity::builder("Shop::Person")
                    .attribute("tags", Assertion::array(Assertion::str()))
                    .attribute("scores", Assertion::hash(Assertion::array(Assertion::int()))),
            )
            .unwrap();
        let tags = person.element("tags").unwrap();
        assert_eq!(tags.name(), "Shop::Person::Tags");
        assert_eq!(tags.table(), "person_tags");
        assert_eq!(tags.select_columns(), vec![ID, PARENT_ID, ELEMENT_INDEX, ELEMENT_VALUE]);

        let scores = person.element("scores").unwrap();
        assert_eq!(scores.element_of().unwrap().shape, ElementShape::Keyed);
        let nested = scores.element(ELEMENT_VALUE).unwrap();
        assert_eq!(nested.table(), "person_scores_elementvalue");
        assert!(registry.resolve("Shop::Person::Scores::ElementValue").is_some());
    }

    #[test]
    fn redeclaring_is_rejected() {
        let registry = Registry::new();
        registry.declare(Entity::builder("Thing")).unwrap();
        assert!(matches!(registry.declare(Entity::builder("Thing")), Err(NodecladError::Declaration(_))));
    }
}
