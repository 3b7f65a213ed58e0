//! Scriptable in-memory connection for tests.
//!
//! [`MockConnection`] records every statement with its parameters and answers
//! from a list of substring rules. Without a matching rule it behaves like a
//! permissive database: INSERTs report a fresh id (or a RETURNING row),
//! UPDATEs and DELETEs report one affected row and SELECTs return nothing.
//! Clones share the same state, so a test can keep one clone for assertions
//! after handing another to the code under test.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use asupersync::{Cx, Outcome};

use crate::connection::{Connection, ConnectionProvider, QueryResult, ReplicationMode};
use crate::driver::Driver;
use crate::error::{ConnectionError, Error};
use crate::row::Row;
use crate::value::Value;

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    result: QueryResult,
    once: bool,
}

#[derive(Debug, Default)]
struct MockState {
    executed: Vec<(String, Vec<Value>)>,
    rules: Vec<Rule>,
    failures: Vec<(String, String)>,
    returning_defaults: HashMap<String, Value>,
    next_insert_id: i64,
}

/// Recording connection used by unit and integration tests.
#[derive(Debug, Clone)]
pub struct MockConnection {
    driver: Driver,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            state: Arc::new(Mutex::new(MockState {
                next_insert_id: 1,
                ..MockState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer every statement containing `pattern` with `result`.
    pub fn on(&self, pattern: impl Into<String>, result: QueryResult) -> &Self {
        self.lock().rules.push(Rule {
            pattern: pattern.into(),
            result,
            once: false,
        });
        self
    }

    /// Answer the next statement containing `pattern` with `result`.
    pub fn on_once(&self, pattern: impl Into<String>, result: QueryResult) -> &Self {
        self.lock().rules.push(Rule {
            pattern: pattern.into(),
            result,
            once: true,
        });
        self
    }

    /// Fail every statement containing `pattern`.
    pub fn fail_on(&self, pattern: impl Into<String>, message: impl Into<String>) -> &Self {
        self.lock().failures.push((pattern.into(), message.into()));
        self
    }

    /// Value reported for a RETURNING column that is not the primary key.
    pub fn returning_default(&self, column: impl Into<String>, value: Value) -> &Self {
        self.lock().returning_defaults.insert(column.into(), value);
        self
    }

    /// First id handed out for INSERTs.
    pub fn set_next_insert_id(&self, id: i64) -> &Self {
        self.lock().next_insert_id = id;
        self
    }

    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().executed.clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.lock().executed.iter().map(|(sql, _)| sql.clone()).collect()
    }

    /// Executed statements starting with `prefix` (e.g. `"INSERT"`).
    pub fn statements_starting_with(&self, prefix: &str) -> Vec<(String, Vec<Value>)> {
        self.lock()
            .executed
            .iter()
            .filter(|(sql, _)| sql.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.lock().executed.clear();
    }

    fn respond(&self, sql: &str, params: &[Value]) -> Outcome<QueryResult, Error> {
        let mut state = self.lock();
        state.executed.push((sql.to_string(), params.to_vec()));

        if let Some((_, message)) = state.failures.iter().find(|(p, _)| sql.contains(p.as_str())) {
            return Outcome::Err(Error::Connection(ConnectionError {
                message: message.clone(),
                source: None,
            }));
        }

        if let Some(pos) = state.rules.iter().position(|r| sql.contains(r.pattern.as_str())) {
            let rule = if state.rules[pos].once {
                state.rules.remove(pos)
            } else {
                state.rules[pos].clone()
            };
            return Outcome::Ok(rule.result);
        }

        let verb = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        let result = match verb.as_str() {
            "INSERT" => {
                let id = state.next_insert_id;
                state.next_insert_id += 1;
                match returning_columns(sql) {
                    Some(columns) => {
                        let values = columns
                            .iter()
                            .enumerate()
                            .map(|(i, c)| {
                                state
                                    .returning_defaults
                                    .get(c)
                                    .cloned()
                                    .unwrap_or(if i == 0 { Value::BigInt(id) } else { Value::Null })
                            })
                            .collect();
                        QueryResult {
                            rows: vec![Row::new(columns, values)],
                            affected: Some(1),
                            insert_id: None,
                        }
                    }
                    None => QueryResult::with_insert_id(Value::BigInt(id)),
                }
            }
            "UPDATE" | "DELETE" => QueryResult::with_affected(1),
            _ => QueryResult::default(),
        };
        Outcome::Ok(result)
    }
}

fn returning_columns(sql: &str) -> Option<Vec<String>> {
    let (_, tail) = sql.split_once(" RETURNING ")?;
    Some(
        tail.split(',')
            .map(|c| {
                c.trim()
                    .trim_matches(|ch| ch == '"' || ch == '`' || ch == '[' || ch == ']')
                    .to_string()
            })
            .collect(),
    )
}

impl Connection for MockConnection {
    fn driver(&self) -> &Driver {
        &self.driver
    }

    fn query(&self, _cx: &Cx, sql: &str, params: &[Value]) -> impl Future<Output = Outcome<QueryResult, Error>> + Send {
        let outcome = self.respond(sql, params);
        async move { outcome }
    }
}

/// Provider handing out clones of one [`MockConnection`].
#[derive(Debug)]
pub struct MockProvider {
    connection: MockConnection,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MockProvider {
    pub fn new(connection: MockConnection) -> Self {
        Self {
            connection,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn connection(&self) -> &MockConnection {
        &self.connection
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl ConnectionProvider for MockProvider {
    type Conn = MockConnection;

    fn acquire(&self, _cx: &Cx, _mode: ReplicationMode) -> impl Future<Output = Outcome<MockConnection, Error>> + Send {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let conn = self.connection.clone();
        async move { Outcome::Ok(conn) }
    }

    fn release(&self, _conn: MockConnection) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
