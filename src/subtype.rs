//! The closed catalog of subtype rules.
//!
//! A subtype is a named modifier that parameterizes an assertion, such as
//! `min`, `unique` or `columnType`. Every rule is parsed once, at declaration
//! time, from a raw [`Value`] argument into a typed [`Rule`]. Unknown rule
//! names and malformed arguments are declaration errors.

use std::fmt;

use regex::Regex;

use crate::error::{NodecladError, Result};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subtype {
    Optional,
    Default,
    Min,
    Max,
    Size,
    MinSize,
    MaxSize,
    Regex,
    Unique,
    ColumnType,
    Serial,
    Indexed,
    SqlValue,
    SqlInsertValue,
    SqlUpdateValue,
    DeleteRefOpt,
    UpdateRefOpt,
}

impl Subtype {
    pub const ALL: [Subtype; 17] = [
        Self::Optional,
        Self::Default,
        Self::Min,
        Self::Max,
        Self::Size,
        Self::MinSize,
        Self::MaxSize,
        Self::Regex,
        Self::Unique,
        Self::ColumnType,
        Self::Serial,
        Self::Indexed,
        Self::SqlValue,
        Self::SqlInsertValue,
        Self::SqlUpdateValue,
        Self::DeleteRefOpt,
        Self::UpdateRefOpt,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Optional => "optional",
            Self::Default => "default",
            Self::Min => "min",
            Self::Max => "max",
            Self::Size => "size",
            Self::MinSize => "minSize",
            Self::MaxSize => "maxSize",
            Self::Regex => "regex",
            Self::Unique => "unique",
            Self::ColumnType => "columnType",
            Self::Serial => "serial",
            Self::Indexed => "indexed",
            Self::SqlValue => "sqlValue",
            Self::SqlInsertValue => "sqlInsertValue",
            Self::SqlUpdateValue => "sqlUpdateValue",
            Self::DeleteRefOpt => "deleteRefOpt",
            Self::UpdateRefOpt => "updateRefOpt",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| NodecladError::Declaration(format!("unknown subtype rule '{name}'")))
    }

    /// Validates the raw argument of this rule.
    pub fn parse(self, raw: Value) -> Result<Rule> {
        let rule = match self {
            Self::Optional => Rule::Optional(flag(self, &raw)?),
            Self::Default => Rule::Default(raw),
            Self::Min => Rule::Min(number(self, &raw)?),
            Self::Max => Rule::Max(number(self, &raw)?),
            Self::Size => Rule::Size(count(self, &raw)?),
            Self::MinSize => Rule::MinSize(count(self, &raw)?),
            Self::MaxSize => Rule::MaxSize(count(self, &raw)?),
            Self::Regex => {
                let pattern = text(self, &raw)?;
                let regex = Regex::new(&pattern)
                    .map_err(|e| invalid(self, &raw, &format!("bad pattern: {e}")))?;
                Rule::Regex(regex)
            }
            Self::Unique => Rule::Unique(unique(self, &raw)?),
            Self::ColumnType => Rule::ColumnType(text(self, &raw)?),
            Self::Serial => Rule::Serial(flag(self, &raw)?),
            Self::Indexed => Rule::Indexed(flag(self, &raw)?),
            Self::SqlValue => Rule::SqlValue(text(self, &raw)?),
            Self::SqlInsertValue => Rule::SqlInsertValue(text(self, &raw)?),
            Self::SqlUpdateValue => Rule::SqlUpdateValue(text(self, &raw)?),
            Self::DeleteRefOpt => Rule::DeleteRefOpt(RefAction::parse(&text(self, &raw)?)?),
            Self::UpdateRefOpt => Rule::UpdateRefOpt(RefAction::parse(&text(self, &raw)?)?),
        };
        Ok(rule)
    }
}

impl fmt::Display for Subtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A parsed, validated subtype argument.
#[derive(Debug, Clone)]
pub enum Rule {
    Optional(bool),
    Default(Value),
    Min(f64),
    Max(f64),
    Size(usize),
    MinSize(usize),
    MaxSize(usize),
    Regex(Regex),
    Unique(Unique),
    ColumnType(String),
    Serial(bool),
    Indexed(bool),
    SqlValue(String),
    SqlInsertValue(String),
    SqlUpdateValue(String),
    DeleteRefOpt(RefAction),
    UpdateRefOpt(RefAction),
}

/// Uniqueness of an attribute: not unique, unique on its own, or unique
/// together with co-key attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Unique {
    #[default]
    No,
    Single,
    With(Vec<String>),
}

impl Unique {
    pub fn is_unique(&self) -> bool {
        !matches!(self, Self::No)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefAction {
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
    NoAction,
}

impl RefAction {
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "CASCADE" => Ok(Self::Cascade),
            "SET NULL" => Ok(Self::SetNull),
            "SET DEFAULT" => Ok(Self::SetDefault),
            "RESTRICT" => Ok(Self::Restrict),
            "NO ACTION" => Ok(Self::NoAction),
            other => Err(NodecladError::Declaration(format!("unknown referential action '{other}'"))),
        }
    }
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::Restrict => "RESTRICT",
            Self::NoAction => "NO ACTION",
        }
    }
}

fn invalid(rule: Subtype, raw: &Value, detail: &str) -> NodecladError {
    NodecladError::Declaration(format!("subtype '{rule}' cannot take '{raw}': {detail}"))
}

fn flag(rule: Subtype, raw: &Value) -> Result<bool> {
    match raw {
        Value::Null => Ok(true),
        Value::Bool(b) => Ok(*b),
        Value::Int(0) => Ok(false),
        Value::Int(1) => Ok(true),
        _ => Err(invalid(rule, raw, "expected a boolean")),
    }
}

fn number(rule: Subtype, raw: &Value) -> Result<f64> {
    match raw {
        Value::Int(_) | Value::Float(_) | Value::Decimal(_) | Value::Text(_) => raw
            .as_f64()
            .filter(|n| n.is_finite())
            .ok_or_else(|| invalid(rule, raw, "expected a number")),
        _ => Err(invalid(rule, raw, "expected a number")),
    }
}

fn count(rule: Subtype, raw: &Value) -> Result<usize> {
    match raw {
        Value::Int(i) if *i >= 0 => usize::try_from(*i).map_err(|e| invalid(rule, raw, &e.to_string())),
        _ => Err(invalid(rule, raw, "expected a non-negative integer")),
    }
}

fn text(rule: Subtype, raw: &Value) -> Result<String> {
    match raw {
        Value::Text(s) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(invalid(rule, raw, "expected non-empty text")),
    }
}

fn unique(rule: Subtype, raw: &Value) -> Result<Unique> {
    match raw {
        Value::Null | Value::Bool(true) | Value::Int(1) => Ok(Unique::Single),
        Value::Bool(false) | Value::Int(0) => Ok(Unique::No),
        Value::Text(name) if !name.is_empty() => Ok(Unique::With(vec![name.clone()])),
        Value::List(names) if !names.is_empty() => names
            .iter()
            .map(|n| match n {
                Value::Text(name) if !name.is_empty() => Ok(name.clone()),
                other => Err(invalid(rule, other, "co-key names must be text")),
            })
            .collect::<Result<Vec<_>>>()
            .map(Unique::With),
        _ => Err(invalid(rule, raw, "expected a boolean or co-key attribute names")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rule_round_trips_its_name() {
        for rule in Subtype::ALL {
            assert_eq!(Subtype::from_name(rule.name()).unwrap(), rule);
        }
    }

    #[test]
    fn unknown_rule_is_a_declaration_error() {
        let err = Subtype::from_name("maximum").unwrap_err();
        assert!(matches!(err, NodecladError::Declaration(_)));
    }

    #[test]
    fn unique_accepts_flags_and_co_keys() {
        assert!(matches!(Subtype::Unique.parse(Value::Bool(true)).unwrap(), Rule::Unique(Unique::Single)));
        assert!(matches!(Subtype::Unique.parse(Value::Bool(false)).unwrap(), Rule::Unique(Unique::No)));
        match Subtype::Unique.parse(Value::from(vec!["region", "year"])).unwrap() {
            Rule::Unique(Unique::With(keys)) => assert_eq!(keys, vec!["region", "year"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!(Subtype::Min.parse(Value::from("ten")).is_err());
        assert!(Subtype::Size.parse(Value::Int(-3)).is_err());
        assert!(Subtype::Regex.parse(Value::from("(")).is_err());
        assert!(Subtype::DeleteRefOpt.parse(Value::from("EXPLODE")).is_err());
    }
}
