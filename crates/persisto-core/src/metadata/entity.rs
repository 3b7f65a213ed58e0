//! Resolved entity metadata.

use std::fmt;
use std::sync::Arc;

use super::MetadataId;
use super::MetadataRegistry;
use super::column::ColumnMetadata;
use super::relation::RelationMetadata;
use crate::entity::{EntityGraph, EntityIdentifier, EntityRecord, RelationValue};
use crate::error::Result;
use crate::value::Value;

/// Lifecycle point an entity listener is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeRemove,
    AfterRemove,
    BeforeSoftRemove,
    AfterSoftRemove,
    BeforeRecover,
    AfterRecover,
    AfterLoad,
}

/// Listener callback; receives the record being persisted or loaded.
pub type ListenerFn = Arc<dyn Fn(&mut EntityRecord) -> Result<()> + Send + Sync>;

/// A listener registered on an entity schema.
#[derive(Clone)]
pub struct EntityListener {
    pub kind: ListenerKind,
    pub callback: ListenerFn,
}

impl fmt::Debug for EntityListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityListener")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// An embedded column group, resolved against its entity.
#[derive(Debug, Clone)]
pub struct EmbeddedMetadata {
    pub property_name: String,
    /// Dot path from the entity root
    pub property_path: String,
    pub embeddable: String,
    /// Full column name prefix, including parent embeds
    pub prefix: String,
}

/// Index or unique constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMetadata {
    pub name: String,
    pub column_names: Vec<String>,
    pub unique: bool,
    pub where_clause: Option<String>,
}

/// CHECK or EXCLUDE constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintMetadata {
    pub name: String,
    pub expression: String,
}

/// Single-table inheritance placement of an entity.
#[derive(Debug, Clone, Default)]
pub struct InheritanceMetadata {
    pub parent: Option<MetadataId>,
    pub root: Option<MetadataId>,
    /// Names of all parent entities, root first
    pub ancestors: Vec<String>,
    /// Discriminator value of this entity
    pub discriminator_value: Option<String>,
    /// Discriminator values of this entity and all of its descendants
    pub tree_discriminator_values: Vec<String>,
}

/// Everything known about one mapped entity.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub id: MetadataId,
    pub name: String,
    pub table_name: String,
    pub schema: Option<String>,
    pub database: Option<String>,
    pub columns: Vec<ColumnMetadata>,
    pub relations: Vec<RelationMetadata>,
    pub embeddeds: Vec<EmbeddedMetadata>,
    pub indices: Vec<IndexMetadata>,
    pub checks: Vec<ConstraintMetadata>,
    pub exclusions: Vec<ConstraintMetadata>,
    pub inheritance: InheritanceMetadata,
    pub listeners: Vec<EntityListener>,
}

impl EntityMetadata {
    pub fn primary_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.is_primary)
    }

    pub fn has_composite_primary_key(&self) -> bool {
        self.primary_columns().count() > 1
    }

    pub fn version_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.is_version())
    }

    pub fn delete_date_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.is_delete_date())
    }

    pub fn update_date_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.is_update_date())
    }

    pub fn create_date_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.is_create_date())
    }

    pub fn discriminator_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.is_discriminator())
    }

    /// Look up a column by property path (`address.city`).
    pub fn find_column(&self, property_path: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.property_path == property_path)
    }

    pub fn find_column_by_database_name(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.database_name == name)
    }

    pub fn find_relation(&self, property_name: &str) -> Option<&RelationMetadata> {
        self.relations.iter().find(|r| r.property_name == property_name)
    }

    pub fn relation_index(&self, property_name: &str) -> Option<usize> {
        self.relations
            .iter()
            .position(|r| r.property_name == property_name)
    }

    /// Join columns of a relation, in declaration order.
    pub fn join_columns_of<'a>(
        &'a self,
        relation: &'a RelationMetadata,
    ) -> impl Iterator<Item = &'a ColumnMetadata> {
        relation.join_columns.iter().map(|&i| &self.columns[i])
    }

    /// Whether rows of this entity live in a table shared with other entities.
    pub fn is_single_table_member(&self) -> bool {
        self.inheritance.root.is_some()
    }

    /// Listeners registered for `kind`, in registration order.
    pub fn listeners_for(&self, kind: ListenerKind) -> impl Iterator<Item = &EntityListener> {
        self.listeners.iter().filter(move |l| l.kind == kind)
    }

    /// Run every listener of `kind` against a record.
    pub fn run_listeners(&self, kind: ListenerKind, record: &mut EntityRecord) -> Result<()> {
        for listener in self.listeners_for(kind) {
            (listener.callback)(record)?;
        }
        Ok(())
    }

    /// Value of a column on a record.
    ///
    /// Join columns are read from the related record when the relation is
    /// set, so a freshly assigned parent wins over a stale raw key. A relation
    /// explicitly set to null yields `Value::Null`.
    pub fn column_value(
        &self,
        column: &ColumnMetadata,
        record: &EntityRecord,
        graph: &EntityGraph,
        registry: &MetadataRegistry,
    ) -> Option<Value> {
        if let (Some(rel_idx), Some(referenced)) = (column.relation, &column.referenced_column) {
            let relation = &self.relations[rel_idx];
            match record.relations.get(&relation.property_name) {
                Some(RelationValue::One(target)) => {
                    let target_meta = registry.get(relation.target_id);
                    let target_record = graph.get(*target)?;
                    let target_column = target_meta.find_column(referenced)?;
                    return target_meta
                        .column_value(target_column, target_record, graph, registry)
                        .filter(|v| !v.is_null());
                }
                Some(RelationValue::Null) => return Some(Value::Null),
                Some(RelationValue::Many(_)) | None => {}
            }
        }
        record.values.get(&column.property_path).cloned()
    }

    /// Primary key of a record, or `None` while any part is missing.
    pub fn identifier(
        &self,
        record: &EntityRecord,
        graph: &EntityGraph,
        registry: &MetadataRegistry,
    ) -> Option<EntityIdentifier> {
        let mut values = Vec::new();
        for column in self.primary_columns() {
            let value = self.column_value(column, record, graph, registry)?;
            if value.is_null() {
                return None;
            }
            values.push((column.property_path.clone(), value));
        }
        if values.is_empty() {
            None
        } else {
            Some(EntityIdentifier::new(values))
        }
    }

    /// Primary key read from plain record values only.
    pub fn identifier_from_values(&self, record: &EntityRecord) -> Option<EntityIdentifier> {
        let mut values = Vec::new();
        for column in self.primary_columns() {
            match record.values.get(&column.property_path) {
                Some(v) if !v.is_null() => values.push((column.property_path.clone(), v.clone())),
                _ => return None,
            }
        }
        if values.is_empty() {
            None
        } else {
            Some(EntityIdentifier::new(values))
        }
    }
}
