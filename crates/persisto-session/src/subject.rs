//! Per-entity persistence state.
//!
//! A [`Subject`] is created for every distinct entity a `save` or `remove`
//! call touches. It records what the database currently holds, which columns
//! and relations changed, and which foreign keys and junction rows still have
//! to be written. Subjects refer to each other by index into the subject list
//! of the operation, so cycles between them need no shared ownership.

use std::collections::BTreeMap;

use persisto_core::{EntityIdentifier, EntityRecord, EntityRef, MetadataId, Value};
use serde::{Deserialize, Serialize};

/// Statement a subject needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectKind {
    Insert,
    Update,
    Remove,
    SoftRemove,
    Recover,
}

impl SubjectKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Insert => "insert",
            SubjectKind::Update => "update",
            SubjectKind::Remove => "remove",
            SubjectKind::SoftRemove => "soft-remove",
            SubjectKind::Recover => "recover",
        }
    }

    /// Whether the subject is written with an UPDATE statement.
    pub const fn is_update_like(&self) -> bool {
        matches!(self, SubjectKind::Update | SubjectKind::SoftRemove | SubjectKind::Recover)
    }
}

/// Where a subject is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjectState {
    #[default]
    Pending,
    Inserted,
    Updated,
    Removed,
    SoftRemoved,
    Recovered,
    Done,
}

/// What a pending foreign key or junction row points at.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeValue {
    /// Another subject of the same operation; its key is read when the
    /// statement is built.
    Subject(usize),
    /// A row outside the operation
    Identifier(EntityIdentifier),
    Null,
}

/// A foreign key of the subject's own row that must be (re)written.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMap {
    pub relation: String,
    pub value: ChangeValue,
}

/// A junction row to insert or delete for a many-to-many relation.
#[derive(Debug, Clone, PartialEq)]
pub struct JunctionChange {
    pub relation: String,
    pub related: ChangeValue,
}

/// One entity's pending persistence operation.
#[derive(Debug, Clone)]
pub struct Subject {
    /// Arena slot of the entity, absent for rows known only by identifier
    pub entity: Option<EntityRef>,
    pub metadata: MetadataId,
    pub identifier: Option<EntityIdentifier>,
    /// Row as currently stored, when it was loaded
    pub database_entity: Option<EntityRecord>,
    /// `None` for subjects that only carry foreign key changes
    pub kind: Option<SubjectKind>,
    pub state: SubjectState,
    /// Named directly by the caller rather than reached through a cascade
    pub explicit: bool,
    /// Removed by an `ON DELETE CASCADE` foreign key; no statement is sent
    pub database_cascaded: bool,
    pub diff_columns: Vec<String>,
    pub diff_relations: Vec<String>,
    pub change_maps: Vec<ChangeMap>,
    pub junction_inserts: Vec<JunctionChange>,
    pub junction_removals: Vec<JunctionChange>,
    pub generated_map: BTreeMap<String, Value>,
    /// Related identifiers per to-many relation as currently stored
    pub database_relation_ids: BTreeMap<String, Vec<EntityIdentifier>>,
    /// Subjects whose rows this subject's foreign keys point at; removals
    /// run this subject first
    pub references: Vec<usize>,
}

impl Subject {
    pub fn new(metadata: MetadataId, entity: Option<EntityRef>, identifier: Option<EntityIdentifier>) -> Self {
        Self {
            entity,
            metadata,
            identifier,
            database_entity: None,
            kind: None,
            state: SubjectState::Pending,
            explicit: false,
            database_cascaded: false,
            diff_columns: Vec::new(),
            diff_relations: Vec::new(),
            change_maps: Vec::new(),
            junction_inserts: Vec::new(),
            junction_removals: Vec::new(),
            generated_map: BTreeMap::new(),
            database_relation_ids: BTreeMap::new(),
            references: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: SubjectKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn is(&self, kind: SubjectKind) -> bool {
        self.kind == Some(kind)
    }

    /// Record a foreign key change, replacing an earlier one for the same relation.
    pub fn set_change_map(&mut self, relation: &str, value: ChangeValue) {
        match self.change_maps.iter_mut().find(|m| m.relation == relation) {
            Some(existing) => existing.value = value,
            None => self.change_maps.push(ChangeMap {
                relation: relation.to_string(),
                value,
            }),
        }
        if !self.diff_relations.iter().any(|r| r == relation) {
            self.diff_relations.push(relation.to_string());
        }
    }

    pub fn change_map(&self, relation: &str) -> Option<&ChangeValue> {
        self.change_maps
            .iter()
            .find(|m| m.relation == relation)
            .map(|m| &m.value)
    }

    pub fn push_junction_insert(&mut self, relation: &str, related: ChangeValue) {
        let change = JunctionChange {
            relation: relation.to_string(),
            related,
        };
        if !self.junction_inserts.contains(&change) {
            self.junction_inserts.push(change);
        }
    }

    pub fn push_junction_removal(&mut self, relation: &str, related: ChangeValue) {
        let change = JunctionChange {
            relation: relation.to_string(),
            related,
        };
        if !self.junction_removals.contains(&change) {
            self.junction_removals.push(change);
        }
    }

    /// Whether an UPDATE statement has anything to write.
    pub fn has_row_changes(&self) -> bool {
        !self.diff_columns.is_empty() || !self.change_maps.is_empty()
    }

    /// Whether the subject's own row takes part in the UPDATE phase.
    pub fn must_be_updated(&self) -> bool {
        match self.kind {
            Some(SubjectKind::Update) | None => self.has_row_changes(),
            Some(SubjectKind::SoftRemove | SubjectKind::Recover) => true,
            Some(SubjectKind::Insert | SubjectKind::Remove) => false,
        }
    }

    pub fn is_inserted(&self) -> bool {
        !self.is(SubjectKind::Insert) || self.state != SubjectState::Pending
    }

    /// Short description for log lines.
    pub fn describe(&self, entity_name: &str) -> String {
        let kind = self.kind.map_or("relation", |k| k.as_str());
        match &self.identifier {
            Some(id) => format!("{kind} {entity_name}#{}", id.key()),
            None => format!("{kind} {entity_name}#new"),
        }
    }
}
