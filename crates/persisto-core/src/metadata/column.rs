//! Column definitions and resolved column metadata.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    BigInt,
    Double,
    Decimal,
    Text,
    Varchar(u32),
    Bool,
    Json,
    Date,
    Timestamp,
    Uuid,
    Bytes,
}

impl ColumnType {
    /// Whether values of this type are integers.
    pub const fn is_integer(&self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::BigInt)
    }
}

/// How a column value is generated on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Generation {
    /// The caller provides the value.
    #[default]
    None,
    /// Auto-increment / identity column filled by the database.
    Increment,
    /// UUID, generated by the database when it can return it, otherwise client-side.
    Uuid,
    /// SQLite-style rowid alias.
    Rowid,
}

/// Special role of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColumnMode {
    #[default]
    Regular,
    /// Optimistic lock counter, bumped on every update.
    Version,
    /// Set by the database on insert.
    CreateDate,
    /// Set on insert and refreshed on every update.
    UpdateDate,
    /// Soft-delete marker; NULL while the row is live.
    DeleteDate,
    /// Single-table inheritance discriminator.
    Discriminator,
}

/// Converts property values to and from their database representation.
pub trait ValueTransformer: Send + Sync {
    /// Called before a value is compared against the database or written.
    fn to_database(&self, value: &Value) -> Value;

    /// Called on every value read from the database.
    fn from_database(&self, value: &Value) -> Value;
}

/// Shared handle to a [`ValueTransformer`].
#[derive(Clone)]
pub struct Transformer(pub Arc<dyn ValueTransformer>);

impl Transformer {
    pub fn new(transformer: impl ValueTransformer + 'static) -> Self {
        Self(Arc::new(transformer))
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transformer(..)")
    }
}

/// Column definition passed to the metadata builder.
#[derive(Debug, Clone)]
pub struct ColumnOptions {
    pub property_name: String,
    pub database_name: Option<String>,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary: bool,
    pub generation: Generation,
    pub default: Option<Value>,
    pub mode: ColumnMode,
    pub transformer: Option<Transformer>,
}

impl ColumnOptions {
    /// A plain, non-nullable column.
    pub fn new(property_name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            property_name: property_name.into(),
            database_name: None,
            column_type,
            nullable: false,
            primary: false,
            generation: Generation::None,
            default: None,
            mode: ColumnMode::Regular,
            transformer: None,
        }
    }

    /// Auto-incremented `BIGINT` primary key.
    pub fn primary_generated(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::BigInt)
            .primary()
            .generated(Generation::Increment)
    }

    /// Generated UUID primary key.
    pub fn primary_uuid(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::Uuid)
            .primary()
            .generated(Generation::Uuid)
    }

    /// Optimistic version counter.
    pub fn version(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::Int).mode(ColumnMode::Version)
    }

    /// Creation timestamp filled by the database.
    pub fn create_date(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::Timestamp).mode(ColumnMode::CreateDate)
    }

    /// Timestamp refreshed on every update.
    pub fn update_date(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::Timestamp).mode(ColumnMode::UpdateDate)
    }

    /// Soft-delete timestamp.
    pub fn delete_date(property_name: impl Into<String>) -> Self {
        Self::new(property_name, ColumnType::Timestamp)
            .nullable()
            .mode(ColumnMode::DeleteDate)
    }

    /// Set the database column name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.database_name = Some(name.into());
        self
    }

    /// Allow NULL.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark as (part of) the primary key.
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Set the generation strategy.
    pub fn generated(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }

    /// Set a default value applied when the property is unset on insert.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the special role of the column.
    pub fn mode(mut self, mode: ColumnMode) -> Self {
        self.mode = mode;
        self
    }

    /// Attach a value transformer.
    pub fn transformer(mut self, transformer: impl ValueTransformer + 'static) -> Self {
        self.transformer = Some(Transformer::new(transformer));
        self
    }
}

/// A resolved column of an entity.
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    /// Property name within its embed (or entity)
    pub property_name: String,
    /// Dot path from the entity root, e.g. `address.city`
    pub property_path: String,
    /// Column name in the table, with embed prefixes applied
    pub database_name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub is_primary: bool,
    pub generation: Generation,
    pub default: Option<Value>,
    pub mode: ColumnMode,
    pub transformer: Option<Transformer>,
    /// Owning relation (index into the entity's relations) for join columns
    pub relation: Option<usize>,
    /// Property path of the referenced column on the relation target
    pub referenced_column: Option<String>,
}

impl ColumnMetadata {
    pub(crate) fn from_options(options: &ColumnOptions, path_prefix: &str, name_prefix: &str) -> Self {
        let database_name = options
            .database_name
            .clone()
            .unwrap_or_else(|| options.property_name.clone());
        Self {
            property_name: options.property_name.clone(),
            property_path: format!("{path_prefix}{}", options.property_name),
            database_name: format!("{name_prefix}{database_name}"),
            column_type: options.column_type,
            nullable: options.nullable,
            is_primary: options.primary,
            generation: options.generation,
            default: options.default.clone(),
            mode: options.mode,
            transformer: options.transformer.clone(),
            relation: None,
            referenced_column: None,
        }
    }

    /// Whether the database fills this column when it is omitted on insert.
    pub fn is_database_generated(&self) -> bool {
        !matches!(self.generation, Generation::None)
            || matches!(self.mode, ColumnMode::CreateDate | ColumnMode::UpdateDate)
    }

    /// Whether this is a join column of a relation.
    pub fn is_join_column(&self) -> bool {
        self.relation.is_some()
    }

    pub fn is_version(&self) -> bool {
        self.mode == ColumnMode::Version
    }

    pub fn is_delete_date(&self) -> bool {
        self.mode == ColumnMode::DeleteDate
    }

    pub fn is_update_date(&self) -> bool {
        self.mode == ColumnMode::UpdateDate
    }

    pub fn is_create_date(&self) -> bool {
        self.mode == ColumnMode::CreateDate
    }

    pub fn is_discriminator(&self) -> bool {
        self.mode == ColumnMode::Discriminator
    }

    /// Apply the transformer's `to_database` step, if any.
    pub fn transform_to_database(&self, value: &Value) -> Value {
        match &self.transformer {
            Some(t) => t.0.to_database(value),
            None => value.clone(),
        }
    }

    /// Apply the transformer's `from_database` step, if any.
    pub fn transform_from_database(&self, value: &Value) -> Value {
        match &self.transformer {
            Some(t) => t.0.from_database(value),
            None => value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl ValueTransformer for Upper {
        fn to_database(&self, value: &Value) -> Value {
            match value {
                Value::Text(s) => Value::Text(s.to_uppercase()),
                other => other.clone(),
            }
        }

        fn from_database(&self, value: &Value) -> Value {
            match value {
                Value::Text(s) => Value::Text(s.to_lowercase()),
                other => other.clone(),
            }
        }
    }

    #[test]
    fn test_from_options_applies_prefixes() {
        let opts = ColumnOptions::new("city", ColumnType::Text).name("city_name");
        let col = ColumnMetadata::from_options(&opts, "address.", "address_");
        assert_eq!(col.property_path, "address.city");
        assert_eq!(col.database_name, "address_city_name");
        assert!(!col.is_join_column());
    }

    #[test]
    fn test_transformer_round_trip() {
        let opts = ColumnOptions::new("code", ColumnType::Text).transformer(Upper);
        let col = ColumnMetadata::from_options(&opts, "", "");
        let stored = col.transform_to_database(&Value::from("abc"));
        assert_eq!(stored, Value::from("ABC"));
        assert_eq!(col.transform_from_database(&stored), Value::from("abc"));
    }

    #[test]
    fn test_database_generated_columns() {
        let id = ColumnMetadata::from_options(&ColumnOptions::primary_generated("id"), "", "");
        let created = ColumnMetadata::from_options(&ColumnOptions::create_date("created"), "", "");
        let name = ColumnMetadata::from_options(&ColumnOptions::new("name", ColumnType::Text), "", "");
        assert!(id.is_database_generated());
        assert!(created.is_database_generated());
        assert!(!name.is_database_generated());
    }
}
