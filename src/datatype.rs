// used to parse decimals and datetimes coming back from storage
use std::str::FromStr;
// used to print out readable forms of a base kind
use std::fmt;

use bigdecimal::{BigDecimal, FromPrimitive};
use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value as Json;

use crate::error::AssertReason;
use crate::value::Value;

lazy_static! {
    // Whole, non-negative numbers only. Negative integers are rejected on purpose.
    static ref INTEGER: Regex = Regex::new(r"^\d+$").unwrap();
}

/// The base predicate an assertion is built on, one per primitive kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseKind {
    Str,
    Int,
    Float,
    Bool,
    Decimal,
    DateTime,
    Id,
    Ref,
    Array,
    Hash,
}

impl BaseKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Str => "Str",
            Self::Int => "Int",
            Self::Float => "Float",
            Self::Bool => "Bool",
            Self::Decimal => "Decimal",
            Self::DateTime => "DateTime",
            Self::Id => "ID",
            Self::Ref => "ExtID",
            Self::Array => "Array",
            Self::Hash => "Hash",
        }
    }
    pub const fn is_collection(self) -> bool {
        matches!(self, Self::Array | Self::Hash)
    }
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::Decimal)
    }

    /// Runs the base predicate against a non-null value.
    pub fn check(self, value: &Value) -> Result<(), AssertReason> {
        let ok = match (self, value) {
            (Self::Str, v) => !v.is_collection() && !v.is_null(),
            (Self::Int, Value::Int(_)) => INTEGER.is_match(&value.to_string()),
            (Self::Float, Value::Int(_) | Value::Float(_)) => value.as_f64().is_some_and(f64::is_finite),
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Bool, Value::Int(i)) => *i == 0 || *i == 1,
            (Self::Decimal, Value::Decimal(_) | Value::Int(_) | Value::Float(_)) => true,
            (Self::DateTime, Value::Time(_)) => true,
            (Self::Id | Self::Ref, Value::Text(s)) => !s.is_empty(),
            (Self::Id | Self::Ref, Value::Int(_)) => true,
            (Self::Array, Value::List(_)) => true,
            (Self::Hash, Value::Map(_)) => true,
            _ => false,
        };
        if ok { Ok(()) } else { Err(AssertReason::InvalidType { expected: self.expected() }) }
    }

    fn expected(self) -> &'static str {
        match self {
            Self::Str => "a scalar string-coercible value",
            Self::Int => "a whole non-negative number",
            Self::Float => "a finite number",
            Self::Bool => "a boolean (0 or 1)",
            Self::Decimal => "a decimal number",
            Self::DateTime => "a timestamp",
            Self::Id => "a non-empty identifier",
            Self::Ref => "a non-empty foreign identifier",
            Self::Array => "a list",
            Self::Hash => "a map",
        }
    }

    /// Converts a value read back from a SQL row into its typed form.
    /// Datetimes stored in native columns are decoded by the dialect before
    /// they get here; this handles the numeric epoch form.
    pub fn from_storage(self, raw: Value) -> Result<Value, String> {
        match (self, raw) {
            (_, Value::Null) => Ok(Value::Null),
            (Self::Str, Value::Text(s)) => Ok(Value::Text(s)),
            (Self::Str, other) => Ok(Value::Text(other.to_string())),
            (Self::Int, Value::Text(s)) => s.trim().parse().map(Value::Int).map_err(|e| e.to_string()),
            (Self::Int, Value::Float(f)) if f.fract() == 0.0 => Ok(Value::Int(f as i64)),
            (Self::Int, v @ Value::Int(_)) => Ok(v),
            (Self::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (Self::Float, Value::Text(s)) => s.trim().parse().map(Value::Float).map_err(|e| e.to_string()),
            (Self::Float, v @ Value::Float(_)) => Ok(v),
            (Self::Bool, Value::Int(i)) => Ok(Value::Bool(i != 0)),
            (Self::Bool, Value::Text(s)) => Ok(Value::Bool(matches!(s.trim(), "1" | "t" | "true"))),
            (Self::Bool, v @ Value::Bool(_)) => Ok(v),
            (Self::Decimal, Value::Text(s)) => {
                BigDecimal::from_str(s.trim()).map(Value::Decimal).map_err(|e| e.to_string())
            }
            (Self::Decimal, Value::Int(i)) => Ok(Value::Decimal(BigDecimal::from(i))),
            (Self::Decimal, Value::Float(f)) => BigDecimal::from_f64(f)
                .map(Value::Decimal)
                .ok_or_else(|| format!("{f} is not a decimal")),
            (Self::Decimal, v @ Value::Decimal(_)) => Ok(v),
            (Self::DateTime, Value::Float(f)) => epoch_to_time(f).map(Value::Time),
            (Self::DateTime, Value::Int(i)) => epoch_to_time(i as f64).map(Value::Time),
            (Self::DateTime, Value::Text(s)) => parse_time(&s).map(Value::Time),
            (Self::DateTime, v @ Value::Time(_)) => Ok(v),
            (Self::Id | Self::Ref, v @ (Value::Text(_) | Value::Int(_))) => Ok(v),
            (kind, other) => Err(format!("cannot read {} as {}", other.type_name(), kind.name())),
        }
    }

    /// Converts a typed value into the form bound as a SQL parameter when the
    /// column is not a native datetime column.
    pub fn to_storage(self, value: &Value) -> Value {
        match (self, value) {
            (_, Value::Time(t)) => Value::Float(t.timestamp_millis() as f64 / 1000.0),
            (Self::Bool, Value::Bool(b)) => Value::Int(i64::from(*b)),
            (Self::Str, Value::Int(_) | Value::Float(_) | Value::Decimal(_) | Value::Bool(_)) => {
                Value::Text(value.to_string())
            }
            (_, Value::Decimal(d)) => Value::Text(d.to_string()),
            (_, other) => other.clone(),
        }
    }

    /// Reads a scalar out of a flatfile or cache document.
    pub fn from_document(self, json: &Json) -> Result<Value, String> {
        match (self, json) {
            (Self::Array | Self::Hash, _) => Ok(Value::from_json(json)),
            (kind, other) => kind.from_storage(Value::from_json(other)),
        }
    }
}

impl fmt::Display for BaseKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Epoch seconds (with millisecond fraction) to a UTC timestamp.
pub fn epoch_to_time(seconds: f64) -> Result<DateTime<Utc>, String> {
    if !seconds.is_finite() {
        return Err(format!("{seconds} is not a timestamp"));
    }
    let millis = (seconds * 1000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| format!("{seconds} is out of range"))
}

/// Parses the textual timestamp forms the dialects write, falling back to RFC 3339.
pub fn parse_time(text: &str) -> Result<DateTime<Utc>, String> {
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(t.and_utc());
        }
    }
    if let Ok(t) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(t.with_timezone(&Utc));
    }
    text.parse::<f64>().map_err(|_| format!("'{text}' is not a timestamp")).and_then(epoch_to_time)
}

/// Current time truncated to milliseconds, which is what survives a round trip
/// through an epoch column.
pub fn now() -> DateTime<Utc> {
    let millis = Utc::now().timestamp_millis();
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}
