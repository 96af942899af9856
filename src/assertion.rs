//! Assertions: the validation and schema rule bound to one attribute.
//!
//! An [`Assertion`] couples a [`BaseKind`] predicate with the subtype rules
//! parsed from its declaration. It is immutable once built and shared by
//! every node of the owning entity.
//!
//! ```
//! use nodeclad::assertion::Assertion;
//! let age = Assertion::int().min(0).max(150).build().unwrap();
//! assert!(age.validate("age", &30.into()).is_ok());
//! assert!(age.validate("age", &200.into()).is_err());
//! ```

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value as Json;

use crate::datatype::BaseKind;
use crate::error::{AssertFailed, AssertReason, NodecladError, Result};
use crate::subtype::{RefAction, Rule, Subtype, Unique};
use crate::value::Value;

pub type Predicate = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// The permitted values of an attribute.
#[derive(Clone)]
pub enum Allowed {
    /// Fixed list, compared by equality.
    Values(Vec<Value>),
    /// Pure predicate; an `Err` carries the reason for the refusal.
    Predicate(Predicate),
    /// SQL returning the permitted values, run on the owning entity's store.
    Query(String),
    /// The value must be the key of an existing object of the named entity.
    Exists(String),
}

impl fmt::Debug for Allowed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Values(values) => f.debug_tuple("Values").field(values).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
            Self::Query(sql) => f.debug_tuple("Query").field(sql).finish(),
            Self::Exists(entity) => f.debug_tuple("Exists").field(entity).finish(),
        }
    }
}

/// Answers the runtime questions an assertion cannot answer by itself.
pub trait Resolver {
    fn exists(&self, entity: &str, id: &Value) -> Result<bool>;
    fn allowed_values(&self, sql: &str) -> Result<Vec<Value>>;
}

/// Resolver for validation outside of any store.
pub struct Detached;

impl Resolver for Detached {
    fn exists(&self, entity: &str, _id: &Value) -> Result<bool> {
        Err(NodecladError::MethodNotApplicable {
            entity: entity.to_string(),
            method: "exists",
            reason: "validation is detached from any store".into(),
        })
    }
    fn allowed_values(&self, sql: &str) -> Result<Vec<Value>> {
        Err(NodecladError::MethodNotApplicable {
            entity: String::new(),
            method: "allowed_values",
            reason: format!("validation is detached from any store, cannot run '{sql}'"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Assertion {
    kind: BaseKind,
    allowed: Option<Allowed>,
    default: Option<Value>,
    optional: bool,
    min: Option<f64>,
    max: Option<f64>,
    size: Option<usize>,
    min_size: Option<usize>,
    max_size: Option<usize>,
    regex: Option<Regex>,
    column_type: Option<String>,
    unique: Unique,
    serial: bool,
    indexed: bool,
    member_type: Option<Arc<Assertion>>,
    member_class: Option<String>,
    sql_value: Option<String>,
    sql_insert_value: Option<String>,
    sql_update_value: Option<String>,
    delete_ref_opt: Option<RefAction>,
    update_ref_opt: Option<RefAction>,
    description: Option<String>,
}

impl Assertion {
    pub fn of(kind: BaseKind) -> AssertionBuilder {
        AssertionBuilder::new(kind)
    }
    pub fn str() -> AssertionBuilder {
        Self::of(BaseKind::Str)
    }
    pub fn int() -> AssertionBuilder {
        Self::of(BaseKind::Int)
    }
    pub fn float() -> AssertionBuilder {
        Self::of(BaseKind::Float)
    }
    pub fn bool() -> AssertionBuilder {
        Self::of(BaseKind::Bool)
    }
    pub fn decimal() -> AssertionBuilder {
        Self::of(BaseKind::Decimal)
    }
    pub fn datetime() -> AssertionBuilder {
        Self::of(BaseKind::DateTime)
    }
    pub fn id() -> AssertionBuilder {
        Self::of(BaseKind::Id)
    }
    /// A reference to another entity's primary key.
    pub fn ext_id(member_class: &str) -> AssertionBuilder {
        Self::of(BaseKind::Ref).member_class(member_class)
    }
    pub fn array(member: AssertionBuilder) -> AssertionBuilder {
        Self::of(BaseKind::Array).member(member)
    }
    pub fn hash(member: AssertionBuilder) -> AssertionBuilder {
        Self::of(BaseKind::Hash).member(member)
    }

    /// An assertion with no rules at all. Used for synthesized attributes
    /// whose shape is known to be valid.
    pub(crate) fn bare(kind: BaseKind) -> Self {
        Self {
            kind,
            allowed: None,
            default: None,
            optional: false,
            min: None,
            max: None,
            size: None,
            min_size: None,
            max_size: None,
            regex: None,
            column_type: None,
            unique: Unique::No,
            serial: false,
            indexed: false,
            member_type: None,
            member_class: None,
            sql_value: None,
            sql_insert_value: None,
            sql_update_value: None,
            delete_ref_opt: None,
            update_ref_opt: None,
            description: None,
        }
    }

    /// A key column pointing back at `entity`, without an existence check.
    pub(crate) fn back_reference(entity: &str, on_delete: RefAction) -> Self {
        let mut assertion = Self::bare(BaseKind::Ref);
        assertion.member_class = Some(entity.to_string());
        assertion.delete_ref_opt = Some(on_delete);
        assertion
    }

    pub(crate) fn with_unique(mut self, unique: Unique) -> Self {
        self.unique = unique;
        self
    }

    pub(crate) fn optional_str() -> Self {
        let mut assertion = Self::bare(BaseKind::Str);
        assertion.optional = true;
        assertion
    }

    pub fn kind(&self) -> BaseKind {
        self.kind
    }
    pub fn allowed(&self) -> Option<&Allowed> {
        self.allowed.as_ref()
    }
    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }
    pub fn is_optional(&self) -> bool {
        self.optional
    }
    pub fn min(&self) -> Option<f64> {
        self.min
    }
    pub fn max(&self) -> Option<f64> {
        self.max
    }
    pub fn size(&self) -> Option<usize> {
        self.size
    }
    pub fn min_size(&self) -> Option<usize> {
        self.min_size
    }
    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }
    pub fn column_type(&self) -> Option<&str> {
        self.column_type.as_deref()
    }
    pub fn unique(&self) -> &Unique {
        &self.unique
    }
    pub fn is_serial(&self) -> bool {
        self.serial
    }
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }
    pub fn member_type(&self) -> Option<&Arc<Assertion>> {
        self.member_type.as_ref()
    }
    /// The referenced entity, looking through a collection wrapper.
    pub fn member_class(&self) -> Option<&str> {
        self.member_class
            .as_deref()
            .or_else(|| self.member_type.as_ref().and_then(|m| m.member_class()))
    }
    pub fn is_collection(&self) -> bool {
        self.kind.is_collection()
    }
    pub fn sql_insert_value(&self) -> Option<&str> {
        self.sql_insert_value.as_deref().or(self.sql_value.as_deref())
    }
    pub fn sql_update_value(&self) -> Option<&str> {
        self.sql_update_value.as_deref().or(self.sql_value.as_deref())
    }
    pub fn on_delete(&self) -> Option<RefAction> {
        self.delete_ref_opt
    }
    pub fn on_update(&self) -> Option<RefAction> {
        self.update_ref_opt
    }
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Validates a value outside of any store. Existence checks and SQL
    /// allow-lists need [`Assertion::validate_with`].
    pub fn validate(&self, attribute: &str, value: &Value) -> Result<()> {
        self.validate_with(attribute, value, &Detached)
    }

    pub fn validate_with(&self, attribute: &str, value: &Value, resolver: &dyn Resolver) -> Result<()> {
        let fail = |reason| NodecladError::ValidationFailed(AssertFailed::new(attribute, value, reason));

        if value.is_null() {
            return if self.optional { Ok(()) } else { Err(fail(AssertReason::MissingRequiredValue)) };
        }
        if let Some(allowed) = &self.allowed {
            self.check_allowed(allowed, value, resolver)?.map_err(fail)?;
        }
        self.check_size(value).map_err(fail)?;
        self.check_range(value).map_err(fail)?;
        if let Some(regex) = &self.regex {
            if !regex.is_match(&value.to_string()) {
                return Err(fail(AssertReason::PatternMismatch { pattern: regex.as_str().to_string() }));
            }
        }
        self.kind.check(value).map_err(fail)?;
        if let Some(member) = &self.member_type {
            let failures = self.check_members(member, attribute, value, resolver)?;
            if !failures.is_empty() {
                return Err(fail(AssertReason::Members(failures)));
            }
        }
        Ok(())
    }

    /// The outer error is a failed lookup, the inner one a refused value.
    fn check_allowed(
        &self,
        allowed: &Allowed,
        value: &Value,
        resolver: &dyn Resolver,
    ) -> Result<std::result::Result<(), AssertReason>> {
        Ok(match allowed {
            Allowed::Values(values) => {
                if values.contains(value) {
                    Ok(())
                } else {
                    let listed: Vec<String> = values.iter().map(ToString::to_string).collect();
                    Err(AssertReason::NotAllowed { detail: format!("expected one of: {}", listed.join(", ")) })
                }
            }
            Allowed::Predicate(predicate) => predicate(value).map_err(|detail| AssertReason::NotAllowed { detail }),
            Allowed::Query(sql) => {
                let values = resolver.allowed_values(sql)?;
                if values.iter().any(|v| v == value || v.to_string() == value.to_string()) {
                    Ok(())
                } else {
                    Err(AssertReason::NotAllowed { detail: "not among the values of the allow-list query".into() })
                }
            }
            Allowed::Exists(entity) => {
                if resolver.exists(entity, value)? {
                    Ok(())
                } else {
                    Err(AssertReason::ForeignKeyNotFound { entity: entity.clone() })
                }
            }
        })
    }

    fn check_size(&self, value: &Value) -> std::result::Result<(), AssertReason> {
        if self.size.is_none() && self.min_size.is_none() && self.max_size.is_none() {
            return Ok(());
        }
        let actual = value.size();
        if let Some(expected) = self.size {
            if actual != expected {
                return Err(AssertReason::SizeMismatch { bound: "size", expected, actual });
            }
        }
        if let Some(expected) = self.min_size {
            if actual < expected {
                return Err(AssertReason::SizeMismatch { bound: "minSize", expected, actual });
            }
        }
        if let Some(expected) = self.max_size {
            if actual > expected {
                return Err(AssertReason::SizeMismatch { bound: "maxSize", expected, actual });
            }
        }
        Ok(())
    }

    fn check_range(&self, value: &Value) -> std::result::Result<(), AssertReason> {
        if self.min.is_none() && self.max.is_none() {
            return Ok(());
        }
        let actual = value.as_f64().ok_or(AssertReason::NotNumeric)?;
        if let Some(limit) = self.min {
            if actual < limit {
                return Err(AssertReason::OutOfRange { bound: "min", limit, actual });
            }
        }
        if let Some(limit) = self.max {
            if actual > limit {
                return Err(AssertReason::OutOfRange { bound: "max", limit, actual });
            }
        }
        Ok(())
    }

    fn check_members(
        &self,
        member: &Assertion,
        attribute: &str,
        value: &Value,
        resolver: &dyn Resolver,
    ) -> Result<Vec<(String, AssertFailed)>> {
        let slots: Vec<(String, &Value)> = match value {
            Value::List(items) => items.iter().enumerate().map(|(i, v)| (i.to_string(), v)).collect(),
            Value::Map(entries) => entries.iter().map(|(k, v)| (k.clone(), v)).collect(),
            _ => return Ok(Vec::new()),
        };
        let mut failures = Vec::new();
        for (slot, element) in slots {
            let name = format!("{attribute}[{slot}]");
            match member.validate_with(&name, element, resolver) {
                Ok(()) => {}
                Err(NodecladError::ValidationFailed(failure)) => failures.push((slot, failure)),
                Err(other) => return Err(other),
            }
        }
        Ok(failures)
    }

    /// Reads a document value back into its typed form, recursing into
    /// collections through the member type.
    pub fn from_document(&self, json: &Json) -> std::result::Result<Value, String> {
        match (self.kind, json) {
            (_, Json::Null) => Ok(Value::Null),
            (BaseKind::Array, Json::Array(items)) => items
                .iter()
                .map(|item| self.member_from_document(item))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::List),
            (BaseKind::Hash, Json::Object(entries)) => entries
                .iter()
                .map(|(k, v)| self.member_from_document(v).map(|v| (k.clone(), v)))
                .collect::<std::result::Result<_, _>>()
                .map(Value::Map),
            (BaseKind::Array | BaseKind::Hash, other) => {
                Err(format!("expected a {} document, found {other}", self.kind))
            }
            (kind, other) => kind.from_document(other),
        }
    }

    fn member_from_document(&self, json: &Json) -> std::result::Result<Value, String> {
        match &self.member_type {
            Some(member) => member.from_document(json),
            None => Ok(Value::from_json(json)),
        }
    }
}

/// Collects an assertion declaration. Rules are only parsed by
/// [`AssertionBuilder::build`], so an unknown rule name or a malformed
/// argument surfaces when the owning entity is declared.
#[derive(Debug, Clone)]
pub struct AssertionBuilder {
    kind: BaseKind,
    allowed: Option<Allowed>,
    member: Option<Box<AssertionBuilder>>,
    member_class: Option<String>,
    rules: Vec<(String, Value)>,
    description: Option<String>,
}

impl AssertionBuilder {
    pub fn new(kind: BaseKind) -> Self {
        Self { kind, allowed: None, member: None, member_class: None, rules: Vec::new(), description: None }
    }

    /// Adds a subtype rule by its catalog name, e.g. `rule("minSize", 3)`.
    pub fn rule(mut self, name: &str, argument: impl Into<Value>) -> Self {
        self.rules.push((name.to_string(), argument.into()));
        self
    }
    pub fn optional(self) -> Self {
        self.rule(Subtype::Optional.name(), true)
    }
    pub fn default(self, value: impl Into<Value>) -> Self {
        self.rule(Subtype::Default.name(), value)
    }
    pub fn min(self, bound: impl Into<Value>) -> Self {
        self.rule(Subtype::Min.name(), bound)
    }
    pub fn max(self, bound: impl Into<Value>) -> Self {
        self.rule(Subtype::Max.name(), bound)
    }
    pub fn size(self, size: usize) -> Self {
        self.rule(Subtype::Size.name(), size)
    }
    pub fn min_size(self, size: usize) -> Self {
        self.rule(Subtype::MinSize.name(), size)
    }
    pub fn max_size(self, size: usize) -> Self {
        self.rule(Subtype::MaxSize.name(), size)
    }
    pub fn regex(self, pattern: &str) -> Self {
        self.rule(Subtype::Regex.name(), pattern)
    }
    pub fn unique(self) -> Self {
        self.rule(Subtype::Unique.name(), true)
    }
    /// Unique together with the named co-key attributes.
    pub fn unique_with(self, co_keys: &[&str]) -> Self {
        let names: Vec<Value> = co_keys.iter().map(|k| Value::from(*k)).collect();
        self.rule(Subtype::Unique.name(), Value::List(names))
    }
    pub fn column_type(self, column_type: &str) -> Self {
        self.rule(Subtype::ColumnType.name(), column_type)
    }
    pub fn serial(self) -> Self {
        self.rule(Subtype::Serial.name(), true)
    }
    pub fn indexed(self) -> Self {
        self.rule(Subtype::Indexed.name(), true)
    }
    pub fn sql_value(self, expression: &str) -> Self {
        self.rule(Subtype::SqlValue.name(), expression)
    }
    pub fn sql_insert_value(self, expression: &str) -> Self {
        self.rule(Subtype::SqlInsertValue.name(), expression)
    }
    pub fn sql_update_value(self, expression: &str) -> Self {
        self.rule(Subtype::SqlUpdateValue.name(), expression)
    }
    pub fn on_delete(self, action: &str) -> Self {
        self.rule(Subtype::DeleteRefOpt.name(), action)
    }
    pub fn on_update(self, action: &str) -> Self {
        self.rule(Subtype::UpdateRefOpt.name(), action)
    }
    pub fn allowed<T: Into<Value>>(mut self, values: Vec<T>) -> Self {
        self.allowed = Some(Allowed::Values(values.into_iter().map(Into::into).collect()));
        self
    }
    pub fn allowed_by<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.allowed = Some(Allowed::Predicate(Arc::new(predicate)));
        self
    }
    pub fn allowed_query(mut self, sql: &str) -> Self {
        self.allowed = Some(Allowed::Query(sql.to_string()));
        self
    }
    pub fn member_class(mut self, entity: &str) -> Self {
        self.member_class = Some(entity.to_string());
        self
    }
    pub fn member(mut self, member: AssertionBuilder) -> Self {
        self.member = Some(Box::new(member));
        self
    }
    pub fn describe(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }

    pub fn kind(&self) -> BaseKind {
        self.kind
    }

    pub fn build(self) -> Result<Assertion> {
        let kind = self.kind;
        let mut assertion = Assertion::bare(kind);
        assertion.allowed = self.allowed;
        assertion.member_class = self.member_class;
        assertion.description = self.description;
        for (name, argument) in self.rules {
            match Subtype::from_name(&name)?.parse(argument)? {
                Rule::Optional(flag) => assertion.optional = flag,
                Rule::Default(value) => assertion.default = Some(value),
                Rule::Min(bound) => assertion.min = Some(bound),
                Rule::Max(bound) => assertion.max = Some(bound),
                Rule::Size(size) => assertion.size = Some(size),
                Rule::MinSize(size) => assertion.min_size = Some(size),
                Rule::MaxSize(size) => assertion.max_size = Some(size),
                Rule::Regex(regex) => assertion.regex = Some(regex),
                Rule::Unique(unique) => assertion.unique = unique,
                Rule::ColumnType(column_type) => assertion.column_type = Some(column_type),
                Rule::Serial(flag) => assertion.serial = flag,
                Rule::Indexed(flag) => assertion.indexed = flag,
                Rule::SqlValue(sql) => assertion.sql_value = Some(sql),
                Rule::SqlInsertValue(sql) => assertion.sql_insert_value = Some(sql),
                Rule::SqlUpdateValue(sql) => assertion.sql_update_value = Some(sql),
                Rule::DeleteRefOpt(action) => assertion.delete_ref_opt = Some(action),
                Rule::UpdateRefOpt(action) => assertion.update_ref_opt = Some(action),
            }
        }

        if let Some(member) = self.member {
            if !kind.is_collection() {
                return Err(NodecladError::Declaration(format!("{kind} cannot carry a member type")));
            }
            assertion.member_type = Some(Arc::new(member.build()?));
        } else if kind.is_collection() {
            assertion.member_type = Some(Arc::new(Assertion::optional_str()));
        }
        if assertion.serial && !matches!(kind, BaseKind::Int | BaseKind::Id) {
            return Err(NodecladError::Declaration(format!("{kind} cannot be serial")));
        }
        if kind.is_collection() && assertion.unique.is_unique() {
            return Err(NodecladError::Declaration(format!("{kind} attributes cannot be unique")));
        }
        if kind == BaseKind::Ref {
            let Some(target) = assertion.member_class.clone() else {
                return Err(NodecladError::Declaration("ExtID requires a member class".into()));
            };
            if assertion.allowed.is_none() {
                assertion.allowed = Some(Allowed::Exists(target));
            }
        }
        if let Some(default) = &assertion.default {
            if !assertion.optional {
                kind.check(default).map_err(|reason| {
                    NodecladError::Declaration(format!("default '{default}' does not satisfy {kind}: {reason}"))
                })?;
            }
        }
        Ok(assertion)
    }
}

