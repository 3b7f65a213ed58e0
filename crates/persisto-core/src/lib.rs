//! Core types for persisto.
//!
//! This crate provides the foundations shared by the query builder and the
//! persistence engine:
//!
//! - `Value` and `Row` for dynamically-typed column data
//! - entity metadata (`EntitySchema` in, `MetadataRegistry` out)
//! - `EntityGraph`, the arena holding entity records and their relations
//! - `Driver` for dialect-specific SQL and capabilities
//! - `Connection` / `ConnectionProvider`, the contract a database driver implements
//! - `QueryRunner` for statements, transactions and savepoints
//! - `EntitySubscriber` for persistence events
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod connection;
pub mod driver;
pub mod entity;
pub mod error;
pub mod identifiers;
pub mod lazy;
pub mod metadata;
pub mod row;
pub mod runner;
pub mod subscriber;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod value;

pub use connection::{Connection, ConnectionProvider, IsolationLevel, QueryResult, ReplicationMode};
pub use driver::{Driver, DriverCapabilities, DriverKind, PlaceholderStyle, ReturningStyle, TransactionSupport};
pub use entity::{EntityGraph, EntityIdentifier, EntityRecord, EntityRef, RelationValue};
pub use error::{
    BuilderError, BuilderErrorKind, ConfigError, ConfigErrorKind, ConnectionError, Error,
    InitializedRelationError, MetadataError, MetadataErrorKind, OptimisticLockError,
    QueryFailedError, Result, TransactionError, TransactionErrorKind, TypeError,
};
pub use identifiers::{
    AliasOptions, build_alias, build_path_alias, hash_alias, quote_ident, quote_ident_mssql, quote_ident_mysql, shorten,
};
pub use lazy::{Lazy, LazyKey, LazyLoader};
pub use metadata::{EntityMetadata, EntitySchema, MetadataArgs, MetadataId, MetadataRegistry, build_metadata};
pub use row::Row;
pub use runner::QueryRunner;
pub use subscriber::{EntityEvent, EntitySubscriber, SubscriberSet, TransactionEvent, TransactionPhase};
pub use value::Value;

/// Unwrap an `Outcome`, returning early from the enclosing function on
/// anything but `Ok`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return $crate::Outcome::Err(e),
        }
    };
}
