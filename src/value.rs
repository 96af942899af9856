//! Attribute values.
//!
//! A [`Value`] is what a node holds for each attribute and what drivers bind
//! and return. Conversions to and from storage happen per base kind in
//! [`crate::datatype`], never through operator overloading.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value as Json};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Decimal(BigDecimal),
    Time(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::List(_) | Self::Map(_))
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
    /// Numeric coercion used by the `min`/`max` rules.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Decimal(d) => d.to_f64(),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
            Self::Time(t) => Some(t.timestamp_millis() as f64 / 1000.0),
            _ => None,
        }
    }
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }
    /// Polymorphic size: characters of the string form for scalars, element
    /// count for lists and key count for maps.
    pub fn size(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::List(items) => items.len(),
            Self::Map(entries) => entries.len(),
            other => other.to_string().chars().count(),
        }
    }
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Decimal(_) => "decimal",
            Self::Time(_) => "time",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Untyped document form, as written to flatfiles and the cache.
    /// Times become epoch seconds and decimals become strings; the owning
    /// assertion turns them back on the way in.
    pub fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Self::Text(s) => Json::String(s.clone()),
            Self::Decimal(d) => Json::String(d.to_string()),
            Self::Time(t) => Number::from_f64(t.timestamp_millis() as f64 / 1000.0)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Self::Map(entries) => Json::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<Map<_, _>>(),
            ),
        }
    }
    /// Best-effort untyped read of a document value.
    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Self::Text(s.clone()),
            Json::Array(items) => Self::List(items.iter().map(Value::from_json).collect()),
            Json::Object(entries) => Self::Map(
                entries.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect(),
            ),
        }
    }

    pub fn decimal(text: &str) -> Option<Self> {
        BigDecimal::from_str(text).ok().map(Self::Decimal)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Null => write!(f, ""),
            Self::Bool(b) => write!(f, "{}", i64::from(*b)),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Time(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S%.3f")),
            Self::List(_) | Self::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Self::Bool(b) }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self { Self::Int(i) }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self { Self::Int(i64::from(i)) }
}
impl From<u32> for Value {
    fn from(i: u32) -> Self { Self::Int(i64::from(i)) }
}
impl From<usize> for Value {
    fn from(i: usize) -> Self { Self::Int(i64::try_from(i).unwrap_or(i64::MAX)) }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self { Self::Float(f) }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self { Self::Text(s.to_string()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Self::Text(s) }
}
impl From<&String> for Value {
    fn from(s: &String) -> Self { Self::Text(s.clone()) }
}
impl From<BigDecimal> for Value {
    fn from(d: BigDecimal) -> Self { Self::Decimal(d) }
}
impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self { Self::Time(t) }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self { Self::List(items.into_iter().map(Into::into).collect()) }
}
impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(entries: BTreeMap<String, T>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self { v.map_or(Self::Null, Into::into) }
}
impl From<&Value> for Value {
    fn from(v: &Value) -> Self { v.clone() }
}
