//! SQL dialects and driver capabilities.
//!
//! The persistence engine never branches on a database name directly; it
//! asks the [`Driver`] for the SQL fragment or capability it needs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::connection::{IsolationLevel, QueryResult};
use crate::error::{Error, Result, TransactionErrorKind};
use crate::identifiers::{AliasOptions, quote_ident, quote_ident_mssql, quote_ident_mysql};
use crate::metadata::{ColumnMetadata, ColumnType, EntityMetadata, Generation};
use crate::value::Value;

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverKind {
    Postgres,
    Cockroach,
    MySql,
    MariaDb,
    Sqlite,
    Mssql,
    Oracle,
}

impl DriverKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Postgres => "postgres",
            DriverKind::Cockroach => "cockroachdb",
            DriverKind::MySql => "mysql",
            DriverKind::MariaDb => "mariadb",
            DriverKind::Sqlite => "sqlite",
            DriverKind::Mssql => "mssql",
            DriverKind::Oracle => "oracle",
        }
    }

    pub const fn is_mysql_family(&self) -> bool {
        matches!(self, DriverKind::MySql | DriverKind::MariaDb)
    }

    pub const fn is_postgres_family(&self) -> bool {
        matches!(self, DriverKind::Postgres | DriverKind::Cockroach)
    }
}

/// How much transaction nesting a driver supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionSupport {
    None,
    /// Top-level transactions only
    Simple,
    /// Nested transactions through savepoints
    Nested,
}

/// Positional parameter syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaceholderStyle {
    /// `$1, $2, ...`
    Dollar,
    /// `?`
    Question,
    /// `@0, @1, ...`
    AtIndex,
    /// `:1, :2, ...`
    Colon,
}

/// How generated values come back from an INSERT or UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturningStyle {
    /// Only the last insert id is reported
    None,
    /// `RETURNING col, ...`
    Returning,
    /// `OUTPUT INSERTED.col, ...`
    Output,
}

/// Feature flags of a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    pub returning: ReturningStyle,
    pub max_alias_length: Option<usize>,
    pub transaction_support: TransactionSupport,
    /// `(a, b) IN ((?, ?), ...)`
    pub supports_row_value_in: bool,
    pub supports_deferrable_constraints: bool,
    pub placeholder_style: PlaceholderStyle,
}

impl DriverCapabilities {
    pub const fn for_kind(kind: DriverKind) -> Self {
        match kind {
            DriverKind::Postgres | DriverKind::Cockroach => Self {
                returning: ReturningStyle::Returning,
                max_alias_length: Some(63),
                transaction_support: TransactionSupport::Nested,
                supports_row_value_in: true,
                supports_deferrable_constraints: matches!(kind, DriverKind::Postgres),
                placeholder_style: PlaceholderStyle::Dollar,
            },
            DriverKind::MySql => Self {
                returning: ReturningStyle::None,
                max_alias_length: Some(63),
                transaction_support: TransactionSupport::Nested,
                supports_row_value_in: true,
                supports_deferrable_constraints: false,
                placeholder_style: PlaceholderStyle::Question,
            },
            DriverKind::MariaDb => Self {
                returning: ReturningStyle::Returning,
                max_alias_length: Some(63),
                transaction_support: TransactionSupport::Nested,
                supports_row_value_in: true,
                supports_deferrable_constraints: false,
                placeholder_style: PlaceholderStyle::Question,
            },
            DriverKind::Sqlite => Self {
                returning: ReturningStyle::None,
                max_alias_length: None,
                transaction_support: TransactionSupport::Nested,
                supports_row_value_in: false,
                supports_deferrable_constraints: true,
                placeholder_style: PlaceholderStyle::Question,
            },
            DriverKind::Mssql => Self {
                returning: ReturningStyle::Output,
                max_alias_length: None,
                transaction_support: TransactionSupport::Nested,
                supports_row_value_in: false,
                supports_deferrable_constraints: false,
                placeholder_style: PlaceholderStyle::AtIndex,
            },
            DriverKind::Oracle => Self {
                returning: ReturningStyle::None,
                max_alias_length: Some(29),
                transaction_support: TransactionSupport::Nested,
                supports_row_value_in: false,
                supports_deferrable_constraints: true,
                placeholder_style: PlaceholderStyle::Colon,
            },
        }
    }
}

/// A dialect plus its capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub kind: DriverKind,
    pub capabilities: DriverCapabilities,
}

const SAVEPOINT_PREFIX: &str = "typeorm_";
const KEY_SEPARATOR: &str = "'|;|'";

impl Driver {
    pub const fn new(kind: DriverKind) -> Self {
        Self {
            kind,
            capabilities: DriverCapabilities::for_kind(kind),
        }
    }

    pub const fn postgres() -> Self {
        Self::new(DriverKind::Postgres)
    }

    pub const fn mysql() -> Self {
        Self::new(DriverKind::MySql)
    }

    pub const fn sqlite() -> Self {
        Self::new(DriverKind::Sqlite)
    }

    /// Override the identifier length limit.
    pub fn with_max_alias_length(mut self, max: Option<usize>) -> Self {
        self.capabilities.max_alias_length = max;
        self
    }

    pub fn with_transaction_support(mut self, support: TransactionSupport) -> Self {
        self.capabilities.transaction_support = support;
        self
    }

    /// Quote an identifier for this dialect.
    pub fn escape(&self, name: &str) -> String {
        match self.kind {
            DriverKind::MySql | DriverKind::MariaDb => quote_ident_mysql(name),
            DriverKind::Mssql => quote_ident_mssql(name),
            _ => quote_ident(name),
        }
    }

    /// Quoted, schema- or database-qualified table name of an entity.
    pub fn escape_table_path(&self, metadata: &EntityMetadata) -> String {
        self.escape_table(
            &metadata.table_name,
            metadata.schema.as_deref(),
            metadata.database.as_deref(),
        )
    }

    pub fn escape_table(&self, table: &str, schema: Option<&str>, database: Option<&str>) -> String {
        let mut parts = Vec::with_capacity(3);
        match self.kind {
            DriverKind::MySql | DriverKind::MariaDb => {
                if let Some(db) = database {
                    parts.push(self.escape(db));
                }
            }
            DriverKind::Mssql => {
                if let Some(db) = database {
                    parts.push(self.escape(db));
                    parts.push(schema.map(|s| self.escape(s)).unwrap_or_default());
                } else if let Some(s) = schema {
                    parts.push(self.escape(s));
                }
            }
            _ => {
                if let Some(s) = schema {
                    parts.push(self.escape(s));
                }
            }
        }
        parts.push(self.escape(table));
        parts.join(".")
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self.capabilities.placeholder_style {
            PlaceholderStyle::Dollar => format!("${index}"),
            PlaceholderStyle::Question => "?".to_string(),
            PlaceholderStyle::AtIndex => format!("@{}", index.saturating_sub(1)),
            PlaceholderStyle::Colon => format!(":{index}"),
        }
    }

    pub fn alias_options(&self) -> AliasOptions {
        AliasOptions {
            max_alias_length: self.capabilities.max_alias_length,
            shorten: true,
        }
    }

    pub fn supports_nested_transactions(&self) -> bool {
        self.capabilities.transaction_support == TransactionSupport::Nested
    }

    /// Convert a property value into what this dialect binds for `column`.
    pub fn prepare_persistent_value(&self, column: &ColumnMetadata, value: &Value) -> Value {
        let value = column.transform_to_database(value);
        match (column.column_type, value) {
            (_, Value::Null) => Value::Null,
            (ColumnType::Json, Value::Json(json)) if !self.has_native_json() => Value::Text(json.to_string()),
            (ColumnType::Bool, Value::Bool(b)) if !self.has_native_bool() => Value::Int(i32::from(b)),
            (ColumnType::Uuid, Value::Uuid(bytes)) if !self.has_native_uuid() => {
                Value::Text(uuid::Uuid::from_bytes(bytes).hyphenated().to_string())
            }
            (_, other) => other,
        }
    }

    /// Convert a value read from this dialect back into a property value.
    pub fn prepare_hydrated_value(&self, column: &ColumnMetadata, value: &Value) -> Value {
        let value = match (column.column_type, value) {
            (_, Value::Null) => Value::Null,
            (ColumnType::Json, Value::Text(text)) => serde_json::from_str(text)
                .map(Value::Json)
                .unwrap_or_else(|_| Value::Text(text.clone())),
            (ColumnType::Bool, Value::Int(_) | Value::BigInt(_)) => {
                Value::Bool(value.as_bool().unwrap_or_default())
            }
            (ColumnType::Uuid, Value::Text(text)) => uuid::Uuid::parse_str(text)
                .map(|u| Value::Uuid(*u.as_bytes()))
                .unwrap_or_else(|_| value.clone()),
            (ColumnType::BigInt, Value::Int(v)) => Value::BigInt(i64::from(*v)),
            (_, other) => other.clone(),
        };
        column.transform_from_database(&value)
    }

    fn has_native_json(&self) -> bool {
        self.kind.is_postgres_family() || self.kind.is_mysql_family()
    }

    fn has_native_bool(&self) -> bool {
        !matches!(self.kind, DriverKind::Sqlite | DriverKind::Oracle | DriverKind::Mssql)
    }

    fn has_native_uuid(&self) -> bool {
        matches!(
            self.kind,
            DriverKind::Postgres | DriverKind::Cockroach | DriverKind::Mssql
        )
    }

    /// Whether the database can generate a UUID and hand it back on insert.
    pub fn generates_uuid(&self) -> bool {
        self.kind.is_postgres_family() || self.kind == DriverKind::Mssql
    }

    /// Property values the database generated for a just-written row.
    ///
    /// Reads every column present in the first returned row and, for drivers
    /// without RETURNING, maps the reported insert id onto the incremented
    /// primary column.
    pub fn create_generated_map(&self, metadata: &EntityMetadata, result: &QueryResult) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        if let Some(row) = result.first_row() {
            for column in &metadata.columns {
                if let Some(value) = row.get_by_name(&column.database_name) {
                    map.insert(
                        column.property_path.clone(),
                        self.prepare_hydrated_value(column, value),
                    );
                }
            }
        }
        if let Some(insert_id) = &result.insert_id {
            let generated = metadata
                .primary_columns()
                .find(|c| matches!(c.generation, Generation::Increment | Generation::Rowid));
            if let Some(column) = generated {
                map.entry(column.property_path.clone())
                    .or_insert_with(|| self.prepare_hydrated_value(column, insert_id));
            }
        }
        map
    }

    /// Statements opening a top-level transaction.
    pub fn begin_transaction_sql(&self, isolation: Option<IsolationLevel>) -> Result<Vec<String>> {
        let Some(level) = isolation else {
            return Ok(vec![match self.kind {
                DriverKind::Sqlite => "BEGIN TRANSACTION".to_string(),
                DriverKind::Mssql => "BEGIN TRANSACTION".to_string(),
                DriverKind::Oracle => "SET TRANSACTION READ WRITE".to_string(),
                _ => "START TRANSACTION".to_string(),
            }]);
        };
        let set = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
        match self.kind {
            DriverKind::Postgres | DriverKind::Cockroach => Ok(vec!["START TRANSACTION".to_string(), set]),
            DriverKind::MySql | DriverKind::MariaDb => Ok(vec![set, "START TRANSACTION".to_string()]),
            DriverKind::Mssql => Ok(vec![set, "BEGIN TRANSACTION".to_string()]),
            DriverKind::Oracle => match level {
                IsolationLevel::ReadCommitted | IsolationLevel::Serializable => Ok(vec![set]),
                other => Err(Error::transaction(
                    TransactionErrorKind::Unsupported,
                    format!("oracle does not support isolation level {}", other.as_sql()),
                )),
            },
            DriverKind::Sqlite => match level {
                IsolationLevel::Serializable => Ok(vec![
                    "PRAGMA read_uncommitted = 0".to_string(),
                    "BEGIN TRANSACTION".to_string(),
                ]),
                IsolationLevel::ReadUncommitted => Ok(vec![
                    "PRAGMA read_uncommitted = 1".to_string(),
                    "BEGIN TRANSACTION".to_string(),
                ]),
                other => Err(Error::transaction(
                    TransactionErrorKind::Unsupported,
                    format!("sqlite does not support isolation level {}", other.as_sql()),
                )),
            },
        }
    }

    pub fn commit_sql(&self) -> &'static str {
        match self.kind {
            DriverKind::Mssql => "COMMIT TRANSACTION",
            _ => "COMMIT",
        }
    }

    pub fn rollback_sql(&self) -> &'static str {
        match self.kind {
            DriverKind::Mssql => "ROLLBACK TRANSACTION",
            _ => "ROLLBACK",
        }
    }

    /// Savepoint name for a nesting depth (`typeorm_1` for the first nested level).
    pub fn savepoint_name(depth: usize) -> String {
        format!("{SAVEPOINT_PREFIX}{depth}")
    }

    pub fn savepoint_sql(&self, depth: usize) -> String {
        match self.kind {
            DriverKind::Mssql => format!("SAVE TRANSACTION {}", Self::savepoint_name(depth)),
            _ => format!("SAVEPOINT {}", Self::savepoint_name(depth)),
        }
    }

    /// `None` where the dialect has no RELEASE SAVEPOINT.
    pub fn release_savepoint_sql(&self, depth: usize) -> Option<String> {
        match self.kind {
            DriverKind::Mssql | DriverKind::Oracle => None,
            _ => Some(format!("RELEASE SAVEPOINT {}", Self::savepoint_name(depth))),
        }
    }

    pub fn rollback_to_savepoint_sql(&self, depth: usize) -> String {
        match self.kind {
            DriverKind::Mssql => format!("ROLLBACK TRANSACTION {}", Self::savepoint_name(depth)),
            _ => format!("ROLLBACK TO SAVEPOINT {}", Self::savepoint_name(depth)),
        }
    }

    /// Trailing LIMIT/OFFSET clause, with a leading space, or empty.
    pub fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match self.kind {
            DriverKind::Mssql | DriverKind::Oracle => match (limit, offset) {
                (None, None) => String::new(),
                (Some(l), o) => format!(
                    " OFFSET {} ROWS FETCH NEXT {l} ROWS ONLY",
                    o.unwrap_or(0)
                ),
                (None, Some(o)) => format!(" OFFSET {o} ROWS"),
            },
            DriverKind::MySql | DriverKind::MariaDb => match (limit, offset) {
                (None, None) => String::new(),
                (Some(l), None) => format!(" LIMIT {l}"),
                (Some(l), Some(o)) => format!(" LIMIT {l} OFFSET {o}"),
                (None, Some(o)) => format!(" LIMIT 18446744073709551615 OFFSET {o}"),
            },
            DriverKind::Sqlite => match (limit, offset) {
                (None, None) => String::new(),
                (Some(l), None) => format!(" LIMIT {l}"),
                (Some(l), Some(o)) => format!(" LIMIT {l} OFFSET {o}"),
                (None, Some(o)) => format!(" LIMIT -1 OFFSET {o}"),
            },
            DriverKind::Postgres | DriverKind::Cockroach => {
                let mut sql = String::new();
                if let Some(l) = limit {
                    sql.push_str(&format!(" LIMIT {l}"));
                }
                if let Some(o) = offset {
                    sql.push_str(&format!(" OFFSET {o}"));
                }
                sql
            }
        }
    }

    /// Whether OFFSET/FETCH needs an ORDER BY to be valid.
    pub fn pagination_requires_order(&self) -> bool {
        matches!(self.kind, DriverKind::Mssql | DriverKind::Oracle)
    }

    pub fn current_timestamp(&self) -> &'static str {
        match self.kind {
            DriverKind::Sqlite => "datetime('now')",
            DriverKind::Mssql => "GETDATE()",
            _ => "CURRENT_TIMESTAMP",
        }
    }

    /// `COUNT(DISTINCT ...)` over one or more already-escaped columns.
    pub fn count_distinct_sql(&self, columns: &[String]) -> String {
        if let [single] = columns {
            return format!("COUNT(DISTINCT({single}))");
        }
        match self.kind {
            DriverKind::Postgres | DriverKind::Cockroach => {
                format!("COUNT(DISTINCT(({})))", columns.join(", "))
            }
            DriverKind::MySql | DriverKind::MariaDb => {
                format!("COUNT(DISTINCT {})", columns.join(", "))
            }
            DriverKind::Mssql => {
                format!("COUNT(DISTINCT(CONCAT({})))", columns.join(&format!(", {KEY_SEPARATOR}, ")))
            }
            DriverKind::Sqlite | DriverKind::Oracle => {
                format!("COUNT(DISTINCT({}))", columns.join(&format!(" || {KEY_SEPARATOR} || ")))
            }
        }
    }

    /// Statement inserting a row made only of defaults.
    pub fn default_values_insert(&self, table: &str) -> String {
        match self.kind {
            DriverKind::MySql | DriverKind::MariaDb => format!("INSERT INTO {table} VALUES ()"),
            _ => format!("INSERT INTO {table} DEFAULT VALUES"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ColumnOptions;
    use crate::row::Row;

    fn column(options: ColumnOptions) -> ColumnMetadata {
        ColumnMetadata::from_options(&options, "", "")
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Driver::postgres().placeholder(2), "$2");
        assert_eq!(Driver::mysql().placeholder(2), "?");
        assert_eq!(Driver::new(DriverKind::Mssql).placeholder(1), "@0");
        assert_eq!(Driver::new(DriverKind::Oracle).placeholder(3), ":3");
    }

    #[test]
    fn test_escape_per_dialect() {
        assert_eq!(Driver::postgres().escape("user"), "\"user\"");
        assert_eq!(Driver::mysql().escape("user"), "`user`");
        assert_eq!(Driver::new(DriverKind::Mssql).escape("user"), "[user]");
        assert_eq!(
            Driver::postgres().escape_table("post", Some("blog"), None),
            "\"blog\".\"post\""
        );
    }

    #[test]
    fn test_savepoint_sql() {
        let pg = Driver::postgres();
        assert_eq!(pg.savepoint_sql(1), "SAVEPOINT typeorm_1");
        assert_eq!(pg.release_savepoint_sql(1).as_deref(), Some("RELEASE SAVEPOINT typeorm_1"));
        assert_eq!(pg.rollback_to_savepoint_sql(2), "ROLLBACK TO SAVEPOINT typeorm_2");
        let mssql = Driver::new(DriverKind::Mssql);
        assert_eq!(mssql.savepoint_sql(1), "SAVE TRANSACTION typeorm_1");
        assert!(mssql.release_savepoint_sql(1).is_none());
    }

    #[test]
    fn test_begin_transaction_isolation() {
        let pg = Driver::postgres()
            .begin_transaction_sql(Some(IsolationLevel::Serializable))
            .unwrap();
        assert_eq!(pg[0], "START TRANSACTION");
        assert_eq!(pg[1], "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE");

        let my = Driver::mysql()
            .begin_transaction_sql(Some(IsolationLevel::RepeatableRead))
            .unwrap();
        assert_eq!(my[1], "START TRANSACTION");

        assert!(Driver::sqlite()
            .begin_transaction_sql(Some(IsolationLevel::RepeatableRead))
            .is_err());
    }

    #[test]
    fn test_limit_offset() {
        assert_eq!(Driver::postgres().limit_offset_sql(Some(10), Some(5)), " LIMIT 10 OFFSET 5");
        assert_eq!(Driver::sqlite().limit_offset_sql(None, Some(5)), " LIMIT -1 OFFSET 5");
        assert_eq!(
            Driver::mysql().limit_offset_sql(None, Some(5)),
            " LIMIT 18446744073709551615 OFFSET 5"
        );
        assert_eq!(
            Driver::new(DriverKind::Mssql).limit_offset_sql(Some(3), None),
            " OFFSET 0 ROWS FETCH NEXT 3 ROWS ONLY"
        );
    }

    #[test]
    fn test_count_distinct_composite() {
        let cols = vec!["\"a\".\"x\"".to_string(), "\"a\".\"y\"".to_string()];
        assert_eq!(
            Driver::postgres().count_distinct_sql(&cols),
            "COUNT(DISTINCT((\"a\".\"x\", \"a\".\"y\")))"
        );
        assert_eq!(
            Driver::sqlite().count_distinct_sql(&cols),
            "COUNT(DISTINCT(\"a\".\"x\" || '|;|' || \"a\".\"y\"))"
        );
        assert_eq!(
            Driver::mysql().count_distinct_sql(&cols),
            "COUNT(DISTINCT \"a\".\"x\", \"a\".\"y\")"
        );
        assert_eq!(
            Driver::new(DriverKind::Mssql).count_distinct_sql(&cols),
            "COUNT(DISTINCT(CONCAT(\"a\".\"x\", '|;|', \"a\".\"y\")))"
        );
        assert_eq!(
            Driver::postgres().count_distinct_sql(&cols[..1]),
            "COUNT(DISTINCT(\"a\".\"x\"))"
        );
    }

    #[test]
    fn test_value_preparation() {
        let sqlite = Driver::sqlite();
        let flag = column(ColumnOptions::new("flag", ColumnType::Bool));
        assert_eq!(sqlite.prepare_persistent_value(&flag, &Value::Bool(true)), Value::Int(1));
        assert_eq!(sqlite.prepare_hydrated_value(&flag, &Value::Int(0)), Value::Bool(false));

        let data = column(ColumnOptions::new("data", ColumnType::Json));
        let json = Value::Json(serde_json::json!({"a": 1}));
        let stored = sqlite.prepare_persistent_value(&data, &json);
        assert_eq!(stored, Value::Text("{\"a\":1}".to_string()));
        assert_eq!(sqlite.prepare_hydrated_value(&data, &stored), json);
        assert_eq!(Driver::postgres().prepare_persistent_value(&data, &json), json);
    }

    #[test]
    fn test_generated_map_from_insert_id() {
        use crate::metadata::{EntitySchema, MetadataArgs, build_metadata};

        let registry = build_metadata(&MetadataArgs::new().entity(
            EntitySchema::new("Item")
                .column(ColumnOptions::primary_generated("id"))
                .column(ColumnOptions::create_date("created")),
        ))
        .unwrap();
        let meta = registry.by_name("Item").unwrap();

        let map = Driver::mysql().create_generated_map(meta, &QueryResult::with_insert_id(Value::BigInt(9)));
        assert_eq!(map.get("id"), Some(&Value::BigInt(9)));

        let row = Row::from_pairs([("id", Value::Int(4)), ("created", Value::Timestamp(10))]);
        let map = Driver::postgres().create_generated_map(meta, &QueryResult::with_rows(vec![row]));
        assert_eq!(map.get("id"), Some(&Value::BigInt(4)));
        assert_eq!(map.get("created"), Some(&Value::Timestamp(10)));
    }
}
