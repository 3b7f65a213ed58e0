//! Query runner: one connection plus transaction bookkeeping.
//!
//! A runner owns a single connection between acquire and release. It runs
//! statements, wraps driver failures into [`QueryFailedError`](crate::error::QueryFailedError)
//! with the statement and its parameters, and tracks transaction depth.
//! Depth 1 is a real transaction; every deeper level is a savepoint named
//! `typeorm_<depth>` where `<depth>` is the depth before the savepoint was
//! opened.

use std::time::{Duration, Instant};

use asupersync::{Cx, Outcome};
use tracing::{debug, info, warn};

use crate::connection::{Connection, IsolationLevel, QueryResult, ReplicationMode};
use crate::driver::Driver;
use crate::error::{Error, TransactionErrorKind};
use crate::subscriber::{SubscriberSet, TransactionEvent, TransactionPhase};
use crate::value::Value;
use crate::{try_outcome, try_result};

/// Executes statements on one connection.
pub struct QueryRunner<C: Connection> {
    connection: Option<C>,
    driver: Driver,
    subscribers: SubscriberSet,
    depth: usize,
    isolation: Option<IsolationLevel>,
    mode: ReplicationMode,
    max_query_execution_time: Option<Duration>,
}

impl<C: Connection> std::fmt::Debug for QueryRunner<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRunner")
            .field("driver", &self.driver.kind)
            .field("depth", &self.depth)
            .field("mode", &self.mode)
            .field("released", &self.connection.is_none())
            .finish()
    }
}

impl<C: Connection> QueryRunner<C> {
    pub fn new(connection: C, subscribers: SubscriberSet) -> Self {
        let driver = connection.driver().clone();
        Self {
            connection: Some(connection),
            driver,
            subscribers,
            depth: 0,
            isolation: None,
            mode: ReplicationMode::Master,
            max_query_execution_time: None,
        }
    }

    pub fn with_mode(mut self, mode: ReplicationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Log a warning for statements slower than `limit`.
    pub fn with_max_query_execution_time(mut self, limit: Option<Duration>) -> Self {
        self.max_query_execution_time = limit;
        self
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn subscribers(&self) -> &SubscriberSet {
        &self.subscribers
    }

    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    pub fn is_transaction_active(&self) -> bool {
        self.depth > 0
    }

    pub fn transaction_depth(&self) -> usize {
        self.depth
    }

    pub fn is_released(&self) -> bool {
        self.connection.is_none()
    }

    /// Execute one statement.
    #[tracing::instrument(level = "debug", skip(self, cx, params), fields(params = params.len()))]
    pub async fn query(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<QueryResult, Error> {
        let Some(connection) = &self.connection else {
            return Outcome::Err(released());
        };
        debug!(sql = %sql, "Executing statement");
        let started = Instant::now();
        let outcome = connection.query(cx, sql, params).await;
        let elapsed = started.elapsed();
        if let Some(limit) = self.max_query_execution_time {
            if elapsed > limit {
                warn!(
                    sql = %sql,
                    elapsed_ms = elapsed.as_millis() as u64,
                    limit_ms = limit.as_millis() as u64,
                    "Slow query"
                );
            }
        }
        match outcome {
            Outcome::Ok(result) => Outcome::Ok(result),
            Outcome::Err(e) => {
                warn!(sql = %sql, error = %e, "Statement failed");
                Outcome::Err(e.query_failed(sql, params))
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn run_all(&self, cx: &Cx, statements: &[String]) -> Outcome<(), Error> {
        for sql in statements {
            try_outcome!(self.query(cx, sql, &[]).await);
        }
        Outcome::Ok(())
    }

    fn notify(&self, phase: TransactionPhase) -> Result<(), Error> {
        let event = TransactionEvent {
            isolation: self.isolation,
        };
        self.subscribers.broadcast_transaction(phase, &event)
    }

    /// Begin a transaction, or open a savepoint inside an active one.
    ///
    /// Subscribers hear about the outermost transaction only.
    pub async fn start_transaction(&mut self, cx: &Cx, isolation: Option<IsolationLevel>) -> Outcome<(), Error> {
        if self.connection.is_none() {
            return Outcome::Err(released());
        }
        if self.depth == 0 {
            self.isolation = isolation;
            try_result!(self.notify(TransactionPhase::BeforeStart));
            let statements = try_result!(self.driver.begin_transaction_sql(isolation));
            try_outcome!(self.run_all(cx, &statements).await);
            self.depth = 1;
            info!(isolation = ?isolation, "Transaction started");
            try_result!(self.notify(TransactionPhase::AfterStart));
            return Outcome::Ok(());
        }

        if !self.driver.supports_nested_transactions() {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::NestedUnsupported,
                format!("{} does not support nested transactions", self.driver.kind.as_str()),
            ));
        }
        let sql = self.driver.savepoint_sql(self.depth);
        try_outcome!(self.query(cx, &sql, &[]).await);
        self.depth += 1;
        debug!(depth = self.depth, "Savepoint opened");
        Outcome::Ok(())
    }

    /// Commit the transaction, or release the innermost savepoint.
    ///
    /// A failed COMMIT leaves the depth unchanged so the caller can still
    /// roll back.
    pub async fn commit_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.connection.is_none() {
            return Outcome::Err(released());
        }
        match self.depth {
            0 => Outcome::Err(not_started("commit")),
            1 => {
                try_result!(self.notify(TransactionPhase::BeforeCommit));
                try_outcome!(self.query(cx, self.driver.commit_sql(), &[]).await);
                self.depth = 0;
                info!("Transaction committed");
                try_result!(self.notify(TransactionPhase::AfterCommit));
                Outcome::Ok(())
            }
            depth => {
                if let Some(sql) = self.driver.release_savepoint_sql(depth - 1) {
                    try_outcome!(self.query(cx, &sql, &[]).await);
                }
                self.depth -= 1;
                debug!(depth = self.depth, "Savepoint released");
                Outcome::Ok(())
            }
        }
    }

    /// Roll back the transaction, or back to the innermost savepoint.
    pub async fn rollback_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.connection.is_none() {
            return Outcome::Err(released());
        }
        match self.depth {
            0 => Outcome::Err(not_started("rollback")),
            1 => {
                try_result!(self.notify(TransactionPhase::BeforeRollback));
                try_outcome!(self.query(cx, self.driver.rollback_sql(), &[]).await);
                self.depth = 0;
                info!("Transaction rolled back");
                try_result!(self.notify(TransactionPhase::AfterRollback));
                Outcome::Ok(())
            }
            depth => {
                let sql = self.driver.rollback_to_savepoint_sql(depth - 1);
                try_outcome!(self.query(cx, &sql, &[]).await);
                self.depth -= 1;
                debug!(depth = self.depth, "Rolled back to savepoint");
                Outcome::Ok(())
            }
        }
    }

    /// Run `work` inside a transaction (or savepoint).
    ///
    /// Commits when `work` returns `Ok`; rolls back on error, cancellation or
    /// panic and returns the original outcome.
    pub async fn transaction<T, F>(&mut self, cx: &Cx, isolation: Option<IsolationLevel>, work: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Self) -> Outcome<T, Error>,
    {
        try_outcome!(self.start_transaction(cx, isolation).await);
        let outcome = work(self).await;
        match outcome {
            Outcome::Ok(value) => match self.commit_transaction(cx).await {
                Outcome::Ok(()) => Outcome::Ok(value),
                Outcome::Err(e) => {
                    if let Outcome::Err(rollback) = self.rollback_transaction(cx).await {
                        warn!(error = %rollback, "Rollback after failed commit also failed");
                    }
                    Outcome::Err(e)
                }
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            failed => {
                if let Outcome::Err(rollback) = self.rollback_transaction(cx).await {
                    warn!(error = %rollback, "Rollback failed");
                }
                failed
            }
        }
    }

    /// Give the connection back. The runner is unusable afterwards.
    pub fn release(&mut self) -> Result<C, Error> {
        if self.depth > 0 {
            warn!(depth = self.depth, "Releasing runner with an open transaction");
        }
        self.depth = 0;
        self.connection.take().ok_or_else(released)
    }
}

fn released() -> Error {
    Error::transaction(
        TransactionErrorKind::RunnerReleased,
        "query runner was already released",
    )
}

fn not_started(op: &str) -> Error {
    Error::transaction(
        TransactionErrorKind::NotStarted,
        format!("cannot {op}: no transaction is active"),
    )
}
