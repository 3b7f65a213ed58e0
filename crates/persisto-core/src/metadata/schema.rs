//! Metadata args: the explicit registration API.
//!
//! Callers describe every mapped type with an [`EntitySchema`] (plus any
//! reusable [`EmbeddableSchema`] column groups), collect them into
//! [`MetadataArgs`] and hand them to [`build_metadata`](super::build_metadata).

use std::sync::Arc;

use super::column::ColumnOptions;
use super::entity::{EntityListener, ListenerKind};
use super::relation::RelationOptions;
use crate::entity::EntityRecord;
use crate::error::Result;

/// Use of an embeddable column group inside an entity or another embeddable.
#[derive(Debug, Clone)]
pub struct EmbeddedOptions {
    pub property_name: String,
    pub embeddable: String,
    /// Column name prefix; defaults to `<property_name>_`
    pub prefix: Option<String>,
}

/// Index or unique constraint over property paths.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub unique: bool,
    pub where_clause: Option<String>,
}

/// CHECK or EXCLUDE constraint expression.
#[derive(Debug, Clone)]
pub struct ConstraintOptions {
    pub name: Option<String>,
    pub expression: String,
}

/// A reusable group of columns.
#[derive(Debug, Clone)]
pub struct EmbeddableSchema {
    pub name: String,
    pub columns: Vec<ColumnOptions>,
    pub embeddeds: Vec<EmbeddedOptions>,
}

impl EmbeddableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            embeddeds: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnOptions) -> Self {
        self.columns.push(column);
        self
    }

    pub fn embedded(mut self, property_name: impl Into<String>, embeddable: impl Into<String>) -> Self {
        self.embeddeds.push(EmbeddedOptions {
            property_name: property_name.into(),
            embeddable: embeddable.into(),
            prefix: None,
        });
        self
    }
}

/// Description of one mapped entity type.
///
/// ```
/// use persisto_core::metadata::{ColumnOptions, ColumnType, EntitySchema, RelationOptions};
///
/// let post = EntitySchema::new("Post")
///     .column(ColumnOptions::primary_generated("id"))
///     .column(ColumnOptions::new("title", ColumnType::Text))
///     .relation(RelationOptions::many_to_one("author", "User").join_column("author_id"));
/// assert_eq!(post.name, "Post");
/// ```
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub name: String,
    pub table_name: Option<String>,
    pub schema: Option<String>,
    pub database: Option<String>,
    pub columns: Vec<ColumnOptions>,
    pub relations: Vec<RelationOptions>,
    pub embeddeds: Vec<EmbeddedOptions>,
    pub indices: Vec<IndexOptions>,
    pub checks: Vec<ConstraintOptions>,
    pub exclusions: Vec<ConstraintOptions>,
    /// Single-table inheritance parent entity
    pub parent: Option<String>,
    /// Discriminator column name (inheritance root only)
    pub discriminator_column: Option<String>,
    pub discriminator_value: Option<String>,
    pub listeners: Vec<EntityListener>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: None,
            schema: None,
            database: None,
            columns: Vec::new(),
            relations: Vec::new(),
            embeddeds: Vec::new(),
            indices: Vec::new(),
            checks: Vec::new(),
            exclusions: Vec::new(),
            parent: None,
            discriminator_column: None,
            discriminator_value: None,
            listeners: Vec::new(),
        }
    }

    /// Override the table name (defaults to the snake-cased entity name).
    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.table_name = Some(name.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn column(mut self, column: ColumnOptions) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relation(mut self, relation: RelationOptions) -> Self {
        self.relations.push(relation);
        self
    }

    /// Embed a column group with the default `<property>_` prefix.
    pub fn embedded(mut self, property_name: impl Into<String>, embeddable: impl Into<String>) -> Self {
        self.embeddeds.push(EmbeddedOptions {
            property_name: property_name.into(),
            embeddable: embeddable.into(),
            prefix: None,
        });
        self
    }

    /// Embed a column group with an explicit prefix (empty for none).
    pub fn embedded_with_prefix(
        mut self,
        property_name: impl Into<String>,
        embeddable: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        self.embeddeds.push(EmbeddedOptions {
            property_name: property_name.into(),
            embeddable: embeddable.into(),
            prefix: Some(prefix.into()),
        });
        self
    }

    pub fn index<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices.push(IndexOptions {
            name: None,
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            where_clause: None,
        });
        self
    }

    pub fn unique<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices.push(IndexOptions {
            name: None,
            columns: columns.into_iter().map(Into::into).collect(),
            unique: true,
            where_clause: None,
        });
        self
    }

    pub fn check(mut self, expression: impl Into<String>) -> Self {
        self.checks.push(ConstraintOptions {
            name: None,
            expression: expression.into(),
        });
        self
    }

    pub fn exclusion(mut self, expression: impl Into<String>) -> Self {
        self.exclusions.push(ConstraintOptions {
            name: None,
            expression: expression.into(),
        });
        self
    }

    /// Declare this entity a single-table child of `parent`.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declare the discriminator column on an inheritance root.
    pub fn discriminator_column(mut self, name: impl Into<String>) -> Self {
        self.discriminator_column = Some(name.into());
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<String>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    /// Register an entity listener.
    pub fn listener<F>(mut self, kind: ListenerKind, callback: F) -> Self
    where
        F: Fn(&mut EntityRecord) -> Result<()> + Send + Sync + 'static,
    {
        self.listeners.push(EntityListener {
            kind,
            callback: Arc::new(callback),
        });
        self
    }
}

/// Everything the metadata builder needs.
#[derive(Debug, Clone, Default)]
pub struct MetadataArgs {
    pub entities: Vec<EntitySchema>,
    pub embeddables: Vec<EmbeddableSchema>,
}

impl MetadataArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, schema: EntitySchema) -> Self {
        self.entities.push(schema);
        self
    }

    pub fn embeddable(mut self, schema: EmbeddableSchema) -> Self {
        self.embeddables.push(schema);
        self
    }
}
