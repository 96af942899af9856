use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodecladError {
    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] AssertFailed),
    #[error("Object not found: {entity} with key '{key}'")]
    ObjectNotFound { entity: String, key: String },
    #[error("Primary key missing for {entity}")]
    PrimaryKeyMissing { entity: String },
    #[error("Object of {entity} has no key and cannot be {action}")]
    ObjectIsAnonymous { entity: String, action: &'static str },
    #[error("Transaction failed for {entity} (rolled back): {cause}")]
    TransactionFailed { entity: String, cause: Box<NodecladError> },
    #[error("Transaction failed for {entity} and rollback failed too ({rollback}); data integrity is uncertain: {cause}")]
    RollbackFailed { entity: String, cause: Box<NodecladError>, rollback: Box<NodecladError> },
    #[error("Could not connect to {dialect} database '{database}': {message}")]
    DbConnectFailed { dialect: String, database: String, message: String },
    #[error("Query failed: {message} [{sql}]")]
    DbQueryFailed { sql: String, message: String },
    #[error("File access error on {}: {source}", path.display())]
    FileAccess { path: PathBuf, source: std::io::Error },
    #[error("Refusing flatfile write on host '{actual}', master host is '{expected}'")]
    WrongHost { expected: String, actual: String },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{method} is not applicable to {entity}: {reason}")]
    MethodNotApplicable { entity: String, method: &'static str, reason: String },
    #[error("Data conversion failed: {0}")]
    DataConversionFailed(String),
    #[error("Declaration error: {0}")]
    Declaration(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Search index error: {0}")]
    Search(String),
    #[error("Version archive error: {0}")]
    Archive(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, NodecladError>;

impl NodecladError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileAccess { path: path.into(), source }
    }
    pub(crate) fn query(sql: &str, message: impl fmt::Display) -> Self {
        Self::DbQueryFailed { sql: sql.to_string(), message: message.to_string() }
    }
    /// The assertion failure behind this error, looking through transaction wrappers.
    pub fn assert_failed(&self) -> Option<&AssertFailed> {
        match self {
            Self::ValidationFailed(failure) => Some(failure),
            Self::TransactionFailed { cause, .. } | Self::RollbackFailed { cause, .. } => {
                cause.assert_failed()
            }
            _ => None,
        }
    }
    /// Whether a driver error reads like a dropped connection that a fresh
    /// connection might get past.
    pub fn is_connection_lost(&self) -> bool {
        const PATTERNS: [&str; 8] = [
            "server closed the connection",
            "connection reset",
            "gone away",
            "lost connection",
            "no connection to the server",
            "broken pipe",
            "terminating connection",
            "connection refused",
        ];
        match self {
            Self::DbQueryFailed { message, .. } => {
                let message = message.to_lowercase();
                PATTERNS.iter().any(|p| message.contains(p))
            }
            _ => false,
        }
    }
}

// Helper conversions
impl From<rusqlite::Error> for NodecladError {
    fn from(e: rusqlite::Error) -> Self {
        Self::DbQueryFailed { sql: String::new(), message: e.to_string() }
    }
}
impl From<::config::ConfigError> for NodecladError {
    fn from(e: ::config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl From<serde_json::Error> for NodecladError {
    fn from(e: serde_json::Error) -> Self { Self::DataConversionFailed(e.to_string()) }
}
impl From<serde_yaml::Error> for NodecladError {
    fn from(e: serde_yaml::Error) -> Self { Self::DataConversionFailed(e.to_string()) }
}
impl<T> From<std::sync::PoisonError<T>> for NodecladError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}

/// A value that did not satisfy the assertion of the attribute it was bound for.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertFailed {
    pub attribute: String,
    pub value: String,
    pub reason: AssertReason,
}

impl AssertFailed {
    pub fn new(attribute: &str, value: impl fmt::Display, reason: AssertReason) -> Self {
        Self { attribute: attribute.to_string(), value: value.to_string(), reason }
    }
}

impl fmt::Display for AssertFailed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} = '{}': {}", self.attribute, self.value, self.reason)
    }
}

impl std::error::Error for AssertFailed {}

#[derive(Debug, Clone, PartialEq)]
pub enum AssertReason {
    MissingRequiredValue,
    NotAllowed { detail: String },
    ForeignKeyNotFound { entity: String },
    SizeMismatch { bound: &'static str, expected: usize, actual: usize },
    OutOfRange { bound: &'static str, limit: f64, actual: f64 },
    NotNumeric,
    PatternMismatch { pattern: String },
    InvalidType { expected: &'static str },
    NotUnique { columns: Vec<String> },
    Members(Vec<(String, AssertFailed)>),
}

impl fmt::Display for AssertReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MissingRequiredValue => write!(f, "a value is required"),
            Self::NotAllowed { detail } => write!(f, "value is not allowed ({detail})"),
            Self::ForeignKeyNotFound { entity } => write!(f, "no {entity} exists with this key"),
            Self::SizeMismatch { bound, expected, actual } => {
                write!(f, "size {actual} does not satisfy {bound} {expected}")
            }
            Self::OutOfRange { bound, limit, actual } => {
                write!(f, "{actual} is out of range ({bound} {limit})")
            }
            Self::NotNumeric => write!(f, "value has no numeric form"),
            Self::PatternMismatch { pattern } => write!(f, "value does not match /{pattern}/"),
            Self::InvalidType { expected } => write!(f, "expected {expected}"),
            Self::NotUnique { columns } => {
                write!(f, "another object already has the same {}", columns.join(", "))
            }
            Self::Members(failures) => {
                let parts: Vec<String> = failures
                    .iter()
                    .map(|(slot, failure)| format!("[{slot}] {}", failure.reason))
                    .collect();
                write!(f, "{} member(s) failed: {}", failures.len(), parts.join("; "))
            }
        }
    }
}
