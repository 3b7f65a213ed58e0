//! Driver-facing connection contract.
//!
//! This module defines what the persistence core consumes from a database
//! driver:
//!
//! - [`Connection`] - one physical connection able to run a statement
//! - [`ConnectionProvider`] - hands out connections (typically from a pool)
//! - [`QueryResult`] - rows, affected count and generated key of a statement
//! - [`IsolationLevel`] - SQL transaction isolation levels
//!
//! Transactions and savepoints are driven by [`QueryRunner`](crate::QueryRunner)
//! on top of `Connection::query`, so drivers only need to execute SQL text.

use crate::driver::Driver;
use crate::error::Error;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Read uncommitted: dirty reads possible.
    ReadUncommitted,

    /// Read committed: only committed changes are visible.
    #[default]
    ReadCommitted,

    /// Repeatable read: a consistent snapshot for the whole transaction.
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Which replica a query runner should be connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// The writable primary.
    #[default]
    Master,
    /// A read replica.
    Slave,
}

/// Outcome of a single statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Rows returned by the statement (SELECT or RETURNING).
    pub rows: Vec<Row>,
    /// Number of affected rows, when the driver reports it.
    pub affected: Option<u64>,
    /// Last generated key, for drivers without RETURNING support.
    pub insert_id: Option<Value>,
}

impl QueryResult {
    /// A result carrying only rows.
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// A result carrying only an affected-row count.
    pub fn with_affected(affected: u64) -> Self {
        Self {
            affected: Some(affected),
            ..Self::default()
        }
    }

    /// A result for an INSERT that produced a generated key.
    pub fn with_insert_id(insert_id: Value) -> Self {
        Self {
            affected: Some(1),
            insert_id: Some(insert_id),
            ..Self::default()
        }
    }

    /// First returned row, if any.
    pub fn first_row(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// A database connection capable of executing statements.
///
/// All operations are async and take a `Cx` context for cancellation/timeout
/// support. Implementations must be `Send + Sync` for use across async
/// boundaries.
pub trait Connection: Send + Sync {
    /// The driver (dialect and capabilities) this connection speaks.
    fn driver(&self) -> &Driver;

    /// Execute one statement with positional parameters.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<QueryResult, Error>> + Send;

    /// Check if the connection is alive.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            match self.query(cx, "SELECT 1", &[]).await {
                Outcome::Ok(_) => Outcome::Ok(()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }
}

/// Source of connections for query runners.
///
/// A provider typically wraps a pool. `acquire` checks a connection out and
/// `release` gives it back; the data source guarantees that every acquired
/// connection is released on all exit paths.
pub trait ConnectionProvider: Send + Sync {
    /// Connection type handed out by this provider.
    type Conn: Connection;

    /// Check out a connection for the given replication mode.
    fn acquire(
        &self,
        cx: &Cx,
        mode: ReplicationMode,
    ) -> impl Future<Output = Outcome<Self::Conn, Error>> + Send;

    /// Return a connection to the provider.
    fn release(&self, conn: Self::Conn);
}
