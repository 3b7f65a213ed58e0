//! Entity metadata: registration args, the builder and the resolved registry.
//!
//! Metadata is built once from [`MetadataArgs`] by [`build_metadata`] and is
//! immutable afterwards. Entities reference each other through
//! [`MetadataId`]s into the [`MetadataRegistry`], so relation cycles never
//! become ownership cycles.

mod builder;
pub mod column;
pub mod entity;
pub mod relation;
pub mod schema;

use std::collections::HashMap;

pub use builder::{build_metadata, snake_case};
pub use column::{ColumnMetadata, ColumnMode, ColumnOptions, ColumnType, Generation, Transformer, ValueTransformer};
pub use entity::{
    ConstraintMetadata, EmbeddedMetadata, EntityListener, EntityMetadata, IndexMetadata,
    InheritanceMetadata, ListenerFn, ListenerKind,
};
pub use relation::{
    Cascade, Deferrable, JoinTableOptions, JunctionColumn, JunctionMetadata, OrphanedRowAction,
    ReferentialAction, RelationMetadata, RelationOptions, RelationType,
};
pub use schema::{
    ConstraintOptions, EmbeddableSchema, EmbeddedOptions, EntitySchema, IndexOptions, MetadataArgs,
};

use crate::error::{Error, MetadataErrorKind, Result};

/// Index of an entity in its [`MetadataRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetadataId(pub usize);

/// All entity metadata of a data source.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: Vec<EntityMetadata>,
    names: HashMap<String, MetadataId>,
}

impl MetadataRegistry {
    pub(crate) fn from_entities(entities: Vec<EntityMetadata>) -> Self {
        let names = entities.iter().map(|e| (e.name.clone(), e.id)).collect();
        Self { entities, names }
    }

    /// Metadata by id. Ids are only handed out by this registry.
    pub fn get(&self, id: MetadataId) -> &EntityMetadata {
        &self.entities[id.0]
    }

    pub fn find(&self, name: &str) -> Option<&EntityMetadata> {
        self.names.get(name).map(|id| self.get(*id))
    }

    /// Metadata by entity name, failing with `UnknownEntity`.
    pub fn by_name(&self, name: &str) -> Result<&EntityMetadata> {
        self.find(name).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnknownEntity,
                name,
                format!("no metadata registered for entity \"{name}\""),
            )
        })
    }

    /// Target entity of a relation.
    pub fn target_of(&self, relation: &RelationMetadata) -> &EntityMetadata {
        self.get(relation.target_id)
    }

    /// Relation on the other side of `relation`, if one is declared.
    pub fn inverse_of(&self, relation: &RelationMetadata) -> Option<&RelationMetadata> {
        let index = relation.inverse_relation?;
        self.target_of(relation).relations.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
