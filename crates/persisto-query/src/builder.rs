//! INSERT, UPDATE and DELETE builders.
//!
//! Values are keyed by property path and written to the mapped database
//! columns. The builders render plain parameterized SQL; they never touch
//! version or date columns on their own.

use asupersync::{Cx, Outcome};
use persisto_core::{
    BuilderErrorKind, Connection, Driver, DriverKind, EntityIdentifier, EntityMetadata, Error,
    QueryResult, QueryRunner, Result, ReturningStyle, Value,
};

use crate::clause::{Condition, WhereClauses};
use crate::expr::{ColumnResolver, Expr, RenderContext};
use crate::params::{ParameterSink, Parameters};

/// Resolves property paths of one entity to bare escaped columns.
#[derive(Debug, Clone, Copy)]
pub struct MetadataResolver<'a> {
    pub driver: &'a Driver,
    pub metadata: &'a EntityMetadata,
}

impl MetadataResolver<'_> {
    fn database_name(&self, property: &str) -> Result<String> {
        self.metadata
            .find_column(property)
            .or_else(|| self.metadata.find_column_by_database_name(property))
            .map(|c| c.database_name.clone())
            .ok_or_else(|| {
                Error::builder(
                    BuilderErrorKind::UnknownProperty,
                    format!("{} has no column \"{property}\"", self.metadata.name),
                )
            })
    }
}

impl ColumnResolver for MetadataResolver<'_> {
    fn resolve_column(&self, alias: Option<&str>, property: &str) -> Result<String> {
        let column = self.driver.escape(&self.database_name(property)?);
        Ok(match alias {
            Some(alias) => format!("{}.{column}", self.driver.escape(alias)),
            None => column,
        })
    }

    fn rewrite_properties(&self, sql: &str) -> String {
        sql.to_string()
    }
}

/// Condition matching rows by identifier.
///
/// One column renders `col IN (...)`; composite keys render a row-value
/// `IN` when the dialect has one and an OR of ANDs otherwise. No ids
/// renders a condition that matches nothing.
pub fn ids_expr(columns: Vec<Expr>, ids: Vec<Vec<Value>>, row_values: bool) -> Expr {
    if ids.is_empty() || columns.is_empty() {
        return Expr::raw("1 = 0");
    }
    if columns.len() == 1 {
        let column = columns.into_iter().next().unwrap_or_else(|| Expr::raw("NULL"));
        return column.in_list(ids.into_iter().filter_map(|row| row.into_iter().next()));
    }
    if row_values {
        return Expr::Tuple(columns).in_list(
            ids.into_iter()
                .map(|row| Expr::Tuple(row.into_iter().map(Expr::Literal).collect())),
        );
    }
    let groups = ids.into_iter().filter_map(|row| {
        Expr::all(
            columns
                .iter()
                .cloned()
                .zip(row)
                .map(|(column, value)| column.eq(Expr::Literal(value))),
        )
        .map(Expr::paren)
    });
    Expr::any(groups).map_or_else(|| Expr::raw("1 = 0"), Expr::paren)
}

/// Identifier values ordered like the primary columns of `metadata`.
pub fn identifier_values(metadata: &EntityMetadata, id: &EntityIdentifier) -> Vec<Value> {
    metadata
        .primary_columns()
        .map(|c| id.get(&c.property_path).cloned().unwrap_or(Value::Null))
        .collect()
}

fn returning_clause(driver: &Driver, columns: &[String]) -> (String, String) {
    if columns.is_empty() {
        return (String::new(), String::new());
    }
    match driver.capabilities.returning {
        ReturningStyle::Returning => (
            String::new(),
            format!(
                " RETURNING {}",
                columns
                    .iter()
                    .map(|c| driver.escape(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ),
        ReturningStyle::Output => (
            format!(
                " OUTPUT {}",
                columns
                    .iter()
                    .map(|c| format!("INSERTED.{}", driver.escape(c)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            String::new(),
        ),
        ReturningStyle::None => (String::new(), String::new()),
    }
}

/// INSERT builder for one entity table.
#[derive(Debug, Clone)]
pub struct InsertQueryBuilder<'m> {
    driver: Driver,
    metadata: &'m EntityMetadata,
    rows: Vec<Vec<(String, Value)>>,
    returning: Vec<String>,
}

impl<'m> InsertQueryBuilder<'m> {
    pub fn new(driver: &Driver, metadata: &'m EntityMetadata) -> Self {
        Self {
            driver: driver.clone(),
            metadata,
            rows: Vec::new(),
            returning: Vec::new(),
        }
    }

    /// Add one row of `(property path, value)` pairs.
    pub fn values(mut self, row: Vec<(String, Value)>) -> Self {
        self.rows.push(row);
        self
    }

    /// Property paths to read back from the inserted row.
    pub fn returning(mut self, properties: &[&str]) -> Self {
        self.returning = properties.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Read back every column the database fills in.
    pub fn returning_generated(mut self) -> Self {
        self.returning = self
            .metadata
            .columns
            .iter()
            .filter(|c| c.is_database_generated() || c.is_version() || c.default.is_some())
            .map(|c| c.property_path.clone())
            .collect();
        self
    }

    pub fn build(&self) -> Result<(String, Vec<Value>)> {
        if self.rows.is_empty() {
            return Err(Error::builder(
                BuilderErrorKind::Incomplete,
                format!("insert into {} has no values", self.metadata.name),
            ));
        }
        let resolver = MetadataResolver {
            driver: &self.driver,
            metadata: self.metadata,
        };
        let table = self.driver.escape_table_path(self.metadata);

        // Columns in first-seen order; a column is dropped when no row sets
        // anything but DEFAULT for it.
        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<(String, &Value)>> = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut resolved = Vec::with_capacity(row.len());
            for (property, value) in row {
                let name = resolver.database_name(property)?;
                if !matches!(value, Value::Default) && !columns.contains(&name) {
                    columns.push(name.clone());
                }
                resolved.push((name, value));
            }
            rows.push(resolved);
        }

        let returning = self
            .returning
            .iter()
            .map(|p| resolver.database_name(p))
            .collect::<Result<Vec<_>>>()?;
        let (output, trailing) = returning_clause(&self.driver, &returning);

        if columns.is_empty() {
            let base = self.driver.default_values_insert(&table);
            let sql = if output.is_empty() {
                format!("{base}{trailing}")
            } else {
                base.replacen(&table, &format!("{table}{output}"), 1)
            };
            return Ok((sql, Vec::new()));
        }

        let mut sink = ParameterSink::new();
        let mut tuples = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut cells = Vec::with_capacity(columns.len());
            for column in &columns {
                let cell = match row.iter().find(|(name, _)| name == column) {
                    Some((_, Value::Default)) | None => self.default_keyword(),
                    Some((_, value)) => sink.push(&self.driver, (*value).clone()),
                };
                cells.push(cell);
            }
            tuples.push(format!("({})", cells.join(", ")));
        }
        let sql = format!(
            "INSERT INTO {table}({}){output} VALUES {}{trailing}",
            columns
                .iter()
                .map(|c| self.driver.escape(c))
                .collect::<Vec<_>>()
                .join(", "),
            tuples.join(", ")
        );
        Ok((sql, sink.into_values()))
    }

    fn default_keyword(&self) -> String {
        match self.driver.kind {
            DriverKind::Sqlite => "NULL".to_string(),
            _ => "DEFAULT".to_string(),
        }
    }

    pub async fn execute<C: Connection>(&self, cx: &Cx, runner: &QueryRunner<C>) -> Outcome<QueryResult, Error> {
        let (sql, params) = match self.build() {
            Ok(built) => built,
            Err(e) => return Outcome::Err(e),
        };
        runner.query(cx, &sql, &params).await
    }
}

#[derive(Debug, Clone)]
enum SetValue {
    Value(Value),
    Raw(String),
}

/// UPDATE builder for one entity table.
#[derive(Debug, Clone)]
pub struct UpdateQueryBuilder<'m> {
    driver: Driver,
    metadata: &'m EntityMetadata,
    sets: Vec<(String, SetValue)>,
    wheres: WhereClauses,
    parameters: Parameters,
    returning: Vec<String>,
}

impl<'m> UpdateQueryBuilder<'m> {
    pub fn new(driver: &Driver, metadata: &'m EntityMetadata) -> Self {
        Self {
            driver: driver.clone(),
            metadata,
            sets: Vec::new(),
            wheres: WhereClauses::new(),
            parameters: Parameters::new(),
            returning: Vec::new(),
        }
    }

    /// Assign a bound value to a property.
    pub fn set(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sets.push((property.into(), SetValue::Value(value.into())));
        self
    }

    /// Assign a raw SQL expression (`"version" + 1`, `CURRENT_TIMESTAMP`).
    pub fn set_raw(mut self, property: impl Into<String>, sql: impl Into<String>) -> Self {
        self.sets.push((property.into(), SetValue::Raw(sql.into())));
        self
    }

    pub fn has_sets(&self) -> bool {
        !self.sets.is_empty()
    }

    pub fn where_(mut self, condition: impl Into<Condition>) -> Self {
        self.wheres.where_(condition);
        self
    }

    pub fn and_where(mut self, condition: impl Into<Condition>) -> Self {
        self.wheres.and_where(condition);
        self
    }

    pub fn or_where(mut self, condition: impl Into<Condition>) -> Self {
        self.wheres.or_where(condition);
        self
    }

    /// Restrict to rows with the given identifiers.
    pub fn where_in_ids(self, ids: &[EntityIdentifier]) -> Self {
        let expr = entity_ids_expr(&self.driver, self.metadata, None, ids);
        self.and_where(expr)
    }

    pub fn set_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn returning(mut self, properties: &[&str]) -> Self {
        self.returning = properties.iter().map(|p| (*p).to_string()).collect();
        self
    }

    pub fn build(&self) -> Result<(String, Vec<Value>)> {
        if self.sets.is_empty() {
            return Err(Error::builder(
                BuilderErrorKind::Incomplete,
                format!("update of {} sets nothing", self.metadata.name),
            ));
        }
        let resolver = MetadataResolver {
            driver: &self.driver,
            metadata: self.metadata,
        };
        let mut sink = ParameterSink::new();
        let mut assignments = Vec::with_capacity(self.sets.len());
        for (property, value) in &self.sets {
            let column = self.driver.escape(&resolver.database_name(property)?);
            let rendered = match value {
                SetValue::Value(v) => sink.push(&self.driver, v.clone()),
                SetValue::Raw(sql) => sql.clone(),
            };
            assignments.push(format!("{column} = {rendered}"));
        }
        let returning = self
            .returning
            .iter()
            .map(|p| resolver.database_name(p))
            .collect::<Result<Vec<_>>>()?;
        let (output, trailing) = returning_clause(&self.driver, &returning);

        let mut sql = format!(
            "UPDATE {} SET {}{output}",
            self.driver.escape_table_path(self.metadata),
            assignments.join(", ")
        );
        let mut ctx = RenderContext {
            driver: &self.driver,
            parameters: &self.parameters,
            resolver: &resolver,
            sink: &mut sink,
        };
        let where_sql = self.wheres.render(&mut ctx)?;
        if !where_sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        sql.push_str(&trailing);
        Ok((sql, sink.into_values()))
    }

    pub async fn execute<C: Connection>(&self, cx: &Cx, runner: &QueryRunner<C>) -> Outcome<QueryResult, Error> {
        let (sql, params) = match self.build() {
            Ok(built) => built,
            Err(e) => return Outcome::Err(e),
        };
        runner.query(cx, &sql, &params).await
    }
}

/// DELETE builder for one entity table.
#[derive(Debug, Clone)]
pub struct DeleteQueryBuilder<'m> {
    driver: Driver,
    metadata: &'m EntityMetadata,
    wheres: WhereClauses,
    parameters: Parameters,
}

impl<'m> DeleteQueryBuilder<'m> {
    pub fn new(driver: &Driver, metadata: &'m EntityMetadata) -> Self {
        Self {
            driver: driver.clone(),
            metadata,
            wheres: WhereClauses::new(),
            parameters: Parameters::new(),
        }
    }

    pub fn where_(mut self, condition: impl Into<Condition>) -> Self {
        self.wheres.where_(condition);
        self
    }

    pub fn and_where(mut self, condition: impl Into<Condition>) -> Self {
        self.wheres.and_where(condition);
        self
    }

    pub fn or_where(mut self, condition: impl Into<Condition>) -> Self {
        self.wheres.or_where(condition);
        self
    }

    pub fn where_in_ids(self, ids: &[EntityIdentifier]) -> Self {
        let expr = entity_ids_expr(&self.driver, self.metadata, None, ids);
        self.and_where(expr)
    }

    pub fn set_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn build(&self) -> Result<(String, Vec<Value>)> {
        let resolver = MetadataResolver {
            driver: &self.driver,
            metadata: self.metadata,
        };
        let mut sink = ParameterSink::new();
        let mut sql = format!("DELETE FROM {}", self.driver.escape_table_path(self.metadata));
        let mut ctx = RenderContext {
            driver: &self.driver,
            parameters: &self.parameters,
            resolver: &resolver,
            sink: &mut sink,
        };
        let where_sql = self.wheres.render(&mut ctx)?;
        if !where_sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        Ok((sql, sink.into_values()))
    }

    pub async fn execute<C: Connection>(&self, cx: &Cx, runner: &QueryRunner<C>) -> Outcome<QueryResult, Error> {
        let (sql, params) = match self.build() {
            Ok(built) => built,
            Err(e) => return Outcome::Err(e),
        };
        runner.query(cx, &sql, &params).await
    }
}

/// Identifier condition over the primary columns of `metadata`.
pub(crate) fn entity_ids_expr(
    driver: &Driver,
    metadata: &EntityMetadata,
    alias: Option<&str>,
    ids: &[EntityIdentifier],
) -> Expr {
    let columns = metadata
        .primary_columns()
        .map(|c| match alias {
            Some(alias) => Expr::qualified(alias, c.property_path.clone()),
            None => Expr::col(c.property_path.clone()),
        })
        .collect();
    let values = ids
        .iter()
        .map(|id| {
            metadata
                .primary_columns()
                .map(|c| {
                    let value = id.get(&c.property_path).cloned().unwrap_or(Value::Null);
                    driver.prepare_persistent_value(c, &value)
                })
                .collect()
        })
        .collect();
    ids_expr(columns, values, driver.capabilities.supports_row_value_in)
}
