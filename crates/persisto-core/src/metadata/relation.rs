//! Relation definitions and resolved relation metadata.

use serde::{Deserialize, Serialize};

use super::MetadataId;

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationType {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

impl RelationType {
    /// Relations holding a list of related entities.
    pub const fn is_to_many(&self) -> bool {
        matches!(self, RelationType::OneToMany | RelationType::ManyToMany)
    }
}

/// Referential action for foreign key constraints (ON DELETE / ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Get the SQL representation of this action.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// Which operations propagate across a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cascade {
    pub insert: bool,
    pub update: bool,
    pub remove: bool,
    pub soft_remove: bool,
    pub recover: bool,
}

impl Cascade {
    pub const NONE: Cascade = Cascade {
        insert: false,
        update: false,
        remove: false,
        soft_remove: false,
        recover: false,
    };

    pub const ALL: Cascade = Cascade {
        insert: true,
        update: true,
        remove: true,
        soft_remove: true,
        recover: true,
    };

    /// Insert and update only; the common "save the children" setting.
    pub const SAVE: Cascade = Cascade {
        insert: true,
        update: true,
        remove: false,
        soft_remove: false,
        recover: false,
    };

    pub const fn with_remove(mut self) -> Self {
        self.remove = true;
        self
    }

    pub const fn any(&self) -> bool {
        self.insert || self.update || self.remove || self.soft_remove || self.recover
    }
}

/// What happens to a child that disappears from a one-to-many collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrphanedRowAction {
    /// Set the child's foreign key to NULL.
    #[default]
    Nullify,
    /// Delete the child row.
    Delete,
    /// Soft-delete the child row.
    SoftDelete,
    /// Leave the child untouched.
    Disable,
}

/// Deferrable constraint mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Deferrable {
    InitiallyImmediate,
    InitiallyDeferred,
}

/// Explicit join-table naming for a many-to-many owner.
#[derive(Debug, Clone, Default)]
pub struct JoinTableOptions {
    pub name: Option<String>,
    pub join_column: Option<String>,
    pub inverse_join_column: Option<String>,
}

/// Relation definition passed to the metadata builder.
#[derive(Debug, Clone)]
pub struct RelationOptions {
    pub property_name: String,
    pub relation_type: RelationType,
    pub target: String,
    pub inverse_side: Option<String>,
    pub cascade: Cascade,
    pub on_delete: Option<ReferentialAction>,
    pub on_update: ReferentialAction,
    pub nullable: bool,
    pub eager: bool,
    pub lazy: bool,
    pub orphaned_row_action: OrphanedRowAction,
    pub persistence: bool,
    pub deferrable: Option<Deferrable>,
    /// Join column names; presence makes a one-to-one the owning side
    pub join_columns: Vec<String>,
    pub join_table: Option<JoinTableOptions>,
}

impl RelationOptions {
    fn new(property_name: impl Into<String>, relation_type: RelationType, target: impl Into<String>) -> Self {
        Self {
            property_name: property_name.into(),
            relation_type,
            target: target.into(),
            inverse_side: None,
            cascade: Cascade::NONE,
            on_delete: None,
            on_update: ReferentialAction::NoAction,
            nullable: true,
            eager: false,
            lazy: false,
            orphaned_row_action: OrphanedRowAction::Nullify,
            persistence: true,
            deferrable: None,
            join_columns: Vec::new(),
            join_table: None,
        }
    }

    /// Many-to-one: this side owns the join column.
    pub fn many_to_one(property_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(property_name, RelationType::ManyToOne, target)
    }

    /// One-to-many: the inverse of a many-to-one on `target`.
    pub fn one_to_many(
        property_name: impl Into<String>,
        target: impl Into<String>,
        inverse_side: impl Into<String>,
    ) -> Self {
        Self::new(property_name, RelationType::OneToMany, target).inverse_side(inverse_side)
    }

    /// One-to-one; call [`join_column`](Self::join_column) on the owning side.
    pub fn one_to_one(property_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(property_name, RelationType::OneToOne, target)
    }

    /// Many-to-many; call [`join_table`](Self::join_table) on the owning side.
    pub fn many_to_many(property_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(property_name, RelationType::ManyToMany, target)
    }

    pub fn inverse_side(mut self, property: impl Into<String>) -> Self {
        self.inverse_side = Some(property.into());
        self
    }

    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = Some(action);
        self
    }

    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }

    /// Make the join column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn orphaned_row_action(mut self, action: OrphanedRowAction) -> Self {
        self.orphaned_row_action = action;
        self
    }

    /// Disable relation persistence: saves never touch this relation.
    pub fn no_persistence(mut self) -> Self {
        self.persistence = false;
        self
    }

    pub fn deferrable(mut self, mode: Deferrable) -> Self {
        self.deferrable = Some(mode);
        self
    }

    /// Add a join column (the owning side of a many-to-one or one-to-one).
    pub fn join_column(mut self, name: impl Into<String>) -> Self {
        self.join_columns.push(name.into());
        self
    }

    /// Own the junction table of a many-to-many.
    pub fn join_table(mut self, options: JoinTableOptions) -> Self {
        self.join_table = Some(options);
        self
    }
}

/// A junction-table column and the column it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JunctionColumn {
    pub database_name: String,
    /// Property path of the referenced primary column
    pub referenced_column: String,
}

/// Resolved junction table of a many-to-many relation, seen from one side.
#[derive(Debug, Clone)]
pub struct JunctionMetadata {
    pub table_name: String,
    /// Columns pointing at the entity that owns this relation metadata
    pub owner_columns: Vec<JunctionColumn>,
    /// Columns pointing at the relation target
    pub inverse_columns: Vec<JunctionColumn>,
    pub on_delete: ReferentialAction,
}

/// A resolved relation of an entity.
#[derive(Debug, Clone)]
pub struct RelationMetadata {
    pub property_name: String,
    pub relation_type: RelationType,
    pub target: String,
    /// Filled in by the link phase
    pub target_id: MetadataId,
    pub inverse_side: Option<String>,
    /// Index of the inverse relation on the target, filled in by the link phase
    pub inverse_relation: Option<usize>,
    pub cascade: Cascade,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
    pub nullable: bool,
    pub eager: bool,
    pub lazy: bool,
    pub orphaned_row_action: OrphanedRowAction,
    pub persistence: bool,
    pub deferrable: Option<Deferrable>,
    /// Indices into the owning entity's columns
    pub join_columns: Vec<usize>,
    pub junction: Option<JunctionMetadata>,
}

impl RelationMetadata {
    /// Whether this side stores the foreign key.
    pub fn is_owning(&self) -> bool {
        !self.join_columns.is_empty()
    }

    /// Owning side of a many-to-one or one-to-one.
    pub fn is_join_column_owner(&self) -> bool {
        matches!(
            self.relation_type,
            RelationType::ManyToOne | RelationType::OneToOne
        ) && self.is_owning()
    }

    /// One-to-one without join columns; the target owns the foreign key.
    pub fn is_one_to_one_inverse(&self) -> bool {
        self.relation_type == RelationType::OneToOne && !self.is_owning()
    }

    pub fn is_many_to_many(&self) -> bool {
        self.relation_type == RelationType::ManyToMany
    }

    pub fn is_one_to_many(&self) -> bool {
        self.relation_type == RelationType::OneToMany
    }

    /// Whether the foreign key may be inserted as NULL and patched later.
    pub fn allows_deferred_patch(&self) -> bool {
        self.nullable
    }

    /// Whether the database deletes dependent rows itself (`ON DELETE CASCADE`).
    ///
    /// `SET NULL` keeps the dependents, so they still need their own subjects.
    pub fn database_cascades_delete(&self) -> bool {
        self.on_delete == ReferentialAction::Cascade
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_constants() {
        assert!(Cascade::ALL.any());
        assert!(!Cascade::NONE.any());
        let save = Cascade::SAVE;
        assert!(save.insert && save.update && !save.remove);
        assert!(save.with_remove().remove);
    }

    #[test]
    fn test_relation_options_builders() {
        let rel = RelationOptions::many_to_one("author", "User")
            .join_column("author_id")
            .not_null()
            .on_delete(ReferentialAction::Cascade);
        assert_eq!(rel.relation_type, RelationType::ManyToOne);
        assert_eq!(rel.join_columns, vec!["author_id".to_string()]);
        assert!(!rel.nullable);
        assert_eq!(rel.on_delete, Some(ReferentialAction::Cascade));

        let rel = RelationOptions::one_to_many("posts", "Post", "author");
        assert_eq!(rel.inverse_side.as_deref(), Some("author"));
        assert!(rel.relation_type.is_to_many());
    }

    #[test]
    fn test_referential_action_sql() {
        assert_eq!(ReferentialAction::SetNull.as_sql(), "SET NULL");
        assert_eq!(ReferentialAction::default(), ReferentialAction::NoAction);
    }
}
