//! Error types for persisto operations.

use std::fmt;

use crate::value::Value;

/// The primary error type for all persisto operations.
#[derive(Debug)]
pub enum Error {
    /// Configuration errors (data source options, metadata that cannot be ordered)
    Config(ConfigError),
    /// Metadata link errors (unresolved targets, inverse sides, embeddeds)
    Metadata(MetadataError),
    /// A statement failed; carries the SQL and its parameters
    QueryFailed(QueryFailedError),
    /// A versioned row changed underneath the caller
    OptimisticLock(OptimisticLockError),
    /// Query runner / transaction sequencing errors
    Transaction(TransactionError),
    /// A to-many relation was initialized with unsaved entities
    InitializedRelation(InitializedRelationError),
    /// Query builder errors raised before any statement is sent
    Builder(BuilderError),
    /// Connection-level errors reported by the driver
    Connection(ConnectionError),
    /// Type conversion errors
    Type(TypeError),
    /// Hydration errors (row shape does not match the metadata)
    Hydration(String),
    /// A listener or subscriber rejected the operation
    Listener(String),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// A required data source option is missing
    MissingOption,
    /// A primary column was declared nullable
    NullablePrimaryColumn,
    /// An entity has no primary column
    MissingPrimaryColumn,
    /// Two single-table siblings share a discriminator value
    AmbiguousDiscriminator,
    /// A foreign key cycle cannot be broken by nullable or deferrable edges
    CycleDetected,
    /// The same entity name was registered twice
    DuplicateEntity,
    /// A column or relation option is invalid
    InvalidOption,
    /// The data source was used before `initialize` or after `destroy`
    NotInitialized,
}

#[derive(Debug)]
pub struct MetadataError {
    pub kind: MetadataErrorKind,
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    /// Relation points at an entity that was never registered
    UnresolvedTarget,
    /// Relation names an inverse side that does not exist on the target
    UnresolvedInverseSide,
    /// Embedded group references an unknown embeddable
    UnresolvedEmbedded,
    /// A single-table child names an unknown parent
    UnresolvedParent,
    /// A property or relation path was looked up and not found
    UnknownProperty,
    /// An entity name was looked up and not found
    UnknownEntity,
}

/// A statement failed while executing.
///
/// The SQL text and bound parameters are kept for diagnostics; `Display`
/// prints the SQL and only the parameter count.
#[derive(Debug)]
pub struct QueryFailedError {
    pub sql: String,
    pub parameters: Vec<Value>,
    pub message: String,
    pub sqlstate: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct OptimisticLockError {
    pub entity: String,
    pub expected_version: Value,
    pub message: String,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The query runner was used after `release()`
    RunnerReleased,
    /// Commit or rollback without an active transaction
    NotStarted,
    /// The driver cannot nest transactions
    NestedUnsupported,
    /// The driver cannot run transactions at all
    Unsupported,
}

#[derive(Debug)]
pub struct InitializedRelationError {
    pub entity: String,
    pub relation: String,
}

#[derive(Debug)]
pub struct BuilderError {
    pub kind: BuilderErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderErrorKind {
    /// An alias was referenced that is not part of the query
    UnknownAlias,
    /// A relation path does not resolve on the aliased entity
    UnknownRelation,
    /// A property does not resolve on the aliased entity
    UnknownProperty,
    /// A named parameter has no bound value
    MissingParameter,
    /// Two joins used the same alias
    DuplicateAlias,
    /// The builder has nothing to render (no table, no values)
    Incomplete,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a metadata error.
    pub fn metadata(
        kind: MetadataErrorKind,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Metadata(MetadataError {
            kind,
            entity: entity.into(),
            message: message.into(),
        })
    }

    /// Shorthand for a query builder error.
    pub fn builder(kind: BuilderErrorKind, message: impl Into<String>) -> Self {
        Error::Builder(BuilderError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a transaction sequencing error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Wrap a driver failure with the statement that caused it.
    ///
    /// An error that is already a `QueryFailed` is returned unchanged so the
    /// innermost statement is reported.
    pub fn query_failed(self, sql: &str, parameters: &[Value]) -> Self {
        match self {
            Error::QueryFailed(_) => self,
            other => {
                let message = other.to_string();
                Error::QueryFailed(QueryFailedError {
                    sql: sql.to_string(),
                    parameters: parameters.to_vec(),
                    message,
                    sqlstate: None,
                    source: Some(Box::new(other)),
                })
            }
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::QueryFailed(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::QueryFailed(q) => Some(&q.sql),
            _ => None,
        }
    }

    /// Is this an optimistic version mismatch?
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Configuration error kind, if this is a configuration error.
    pub fn config_kind(&self) -> Option<ConfigErrorKind> {
        match self {
            Error::Config(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Metadata(e) => write!(f, "Metadata error in entity '{}': {}", e.entity, e.message),
            Error::QueryFailed(e) => write!(f, "Query failed: {e}"),
            Error::OptimisticLock(e) => write!(f, "{e}"),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::InitializedRelation(e) => write!(f, "{e}"),
            Error::Builder(e) => write!(f, "Query builder error: {}", e.message),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::Hydration(msg) => write!(f, "Hydration error: {}", msg),
            Error::Listener(msg) => write!(f, "Listener error: {}", msg),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::QueryFailed(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryFailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (sql: {}; {} parameter(s))",
            self.message,
            self.sql,
            self.parameters.len()
        )?;
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, " [SQLSTATE {}]", sqlstate)?;
        }
        Ok(())
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The optimistic lock on entity {} failed, version {} was expected: {}",
            self.entity, self.expected_version, self.message
        )
    }
}

impl fmt::Display for InitializedRelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Relation '{}' of entity '{}' was initialized with entities that have no identifier; \
             save them first, enable insert cascade, or disable persistence for the relation",
            self.relation, self.entity
        )
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<QueryFailedError> for Error {
    fn from(err: QueryFailedError) -> Self {
        Error::QueryFailed(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<InitializedRelationError> for Error {
    fn from(err: InitializedRelationError) -> Self {
        Error::InitializedRelation(err)
    }
}

impl From<BuilderError> for Error {
    fn from(err: BuilderError) -> Self {
        Error::Builder(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for persisto operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_failed_keeps_sql_and_parameters() {
        let driver = Error::Connection(ConnectionError {
            message: "duplicate key".to_string(),
            source: None,
        });
        let err = driver.query_failed("INSERT INTO t VALUES (?)", &[Value::Text("secret".into())]);

        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (?)"));
        let Error::QueryFailed(inner) = &err else {
            panic!("expected QueryFailed");
        };
        assert_eq!(inner.parameters, vec![Value::Text("secret".into())]);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_query_failed_display_hides_parameter_values() {
        let err = Error::Custom("boom".into())
            .query_failed("UPDATE t SET pw = ?", &[Value::Text("hunter2".into())]);
        let rendered = err.to_string();
        assert!(rendered.contains("UPDATE t SET pw = ?"));
        assert!(rendered.contains("1 parameter(s)"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_query_failed_is_not_double_wrapped() {
        let first = Error::Custom("boom".into()).query_failed("SELECT 1", &[]);
        let second = first.query_failed("SELECT 2", &[]);
        assert_eq!(second.sql(), Some("SELECT 1"));
    }

    #[test]
    fn test_config_kind_helper() {
        let err = Error::config(ConfigErrorKind::CycleDetected, "a -> b -> a");
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::CycleDetected));
        assert!(!err.is_version_mismatch());
    }
}
