//! Change-set computation.
//!
//! [`SubjectBuilder`] turns root entities into the [`Subject`] list of one
//! operation:
//!
//! 1. **Collect**: walk the roots and every relation whose cascade flags
//!    allow the operation. Each distinct entity (by arena slot, then by
//!    identifier) gets one subject.
//! 2. **Load**: read the stored rows and to-many relation ids of every
//!    subject that has an identifier.
//! 3. **Diff**: compare columns, join-column relations, one-to-many children
//!    and junction rows against the stored state.
//!
//! Nothing is written here. Validation failures are raised before the
//! executor sends a single statement.

use std::collections::HashMap;

use asupersync::{Cx, Outcome};
use persisto_core::metadata::{OrphanedRowAction, RelationMetadata};
use persisto_core::{
    Connection, Driver, EntityGraph, EntityIdentifier, EntityMetadata, EntityRecord, EntityRef, Error,
    InitializedRelationError, MetadataErrorKind, MetadataId, MetadataRegistry, QueryRunner, RelationValue, Result,
    Value, try_outcome, try_result,
};
use tracing::{debug, trace};

use crate::loader::DatabaseEntityLoader;
use crate::subject::{ChangeValue, Subject, SubjectKind};

/// Builds the subjects of one save, remove, soft-remove or recover call.
#[derive(Debug)]
pub struct SubjectBuilder<'a> {
    registry: &'a MetadataRegistry,
    driver: Driver,
    graph: &'a EntityGraph,
    subjects: Vec<Subject>,
    by_entity: HashMap<EntityRef, usize>,
    by_identity: HashMap<(MetadataId, String), usize>,
}

impl<'a> SubjectBuilder<'a> {
    pub fn new(registry: &'a MetadataRegistry, driver: &Driver, graph: &'a EntityGraph) -> Self {
        Self {
            registry,
            driver: driver.clone(),
            graph,
            subjects: Vec::new(),
            by_entity: HashMap::new(),
            by_identity: HashMap::new(),
        }
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn into_subjects(self) -> Vec<Subject> {
        self.subjects
    }

    /// Subjects for saving `roots` and everything their cascades reach.
    #[tracing::instrument(level = "debug", skip_all, fields(roots = roots.len()))]
    pub async fn build_for_insert_or_update<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        roots: &[EntityRef],
    ) -> Outcome<(), Error> {
        for &root in roots {
            try_result!(self.collect_save(root, true));
        }

        let loader = DatabaseEntityLoader::new(self.registry, &self.driver);
        try_outcome!(loader.load_entities(cx, runner, &mut self.subjects).await);
        for subject in &mut self.subjects {
            if subject.is(SubjectKind::Update) && subject.database_entity.is_none() {
                subject.kind = Some(SubjectKind::Insert);
            }
        }
        try_outcome!(loader.load_relation_ids(cx, runner, self.graph, &mut self.subjects).await);

        try_result!(self.compute_save_changes());
        self.log_summary();
        Outcome::Ok(())
    }

    pub async fn build_for_removal<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        roots: &[EntityRef],
    ) -> Outcome<(), Error> {
        self.build_for(cx, runner, roots, SubjectKind::Remove).await
    }

    pub async fn build_for_soft_removal<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        roots: &[EntityRef],
    ) -> Outcome<(), Error> {
        self.build_for(cx, runner, roots, SubjectKind::SoftRemove).await
    }

    pub async fn build_for_recovery<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        roots: &[EntityRef],
    ) -> Outcome<(), Error> {
        self.build_for(cx, runner, roots, SubjectKind::Recover).await
    }

    #[tracing::instrument(level = "debug", skip(self, cx, runner, roots), fields(roots = roots.len()))]
    async fn build_for<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        roots: &[EntityRef],
        kind: SubjectKind,
    ) -> Outcome<(), Error> {
        for &root in roots {
            try_result!(self.collect_removal(root, kind, true));
        }
        if kind != SubjectKind::Recover {
            self.keep_referenced(kind);
        }
        if kind != SubjectKind::Remove {
            try_result!(self.require_delete_date());
        }

        let loader = DatabaseEntityLoader::new(self.registry, &self.driver);
        try_outcome!(loader.load_entities(cx, runner, &mut self.subjects).await);
        for subject in &mut self.subjects {
            if subject.kind.is_some() && subject.database_entity.is_none() {
                trace!(entity = ?subject.entity, "row does not exist; skipped");
                subject.kind = None;
            }
        }
        self.log_summary();
        Outcome::Ok(())
    }

    fn record(&self, entity: EntityRef) -> Result<&'a EntityRecord> {
        self.graph
            .get(entity)
            .ok_or_else(|| Error::Custom(format!("entity slot {} is not in the graph", entity.0)))
    }

    fn metadata_of(&self, record: &EntityRecord) -> Result<&'a EntityMetadata> {
        self.registry.by_name(&record.entity)
    }

    fn identity_key(&self, metadata: MetadataId, identifier: &EntityIdentifier) -> (MetadataId, String) {
        let metadata = self.registry.get(metadata);
        (metadata.inheritance.root.unwrap_or(metadata.id), identifier.key())
    }

    fn find_subject(&self, entity: EntityRef) -> Option<usize> {
        if let Some(&index) = self.by_entity.get(&entity) {
            return Some(index);
        }
        let record = self.graph.get(entity)?;
        let metadata = self.registry.find(&record.entity)?;
        let identifier = metadata.identifier(record, self.graph, self.registry)?;
        self.by_identity
            .get(&self.identity_key(metadata.id, &identifier))
            .copied()
    }

    fn register(&mut self, subject: Subject) -> usize {
        let index = self.subjects.len();
        if let Some(entity) = subject.entity {
            self.by_entity.insert(entity, index);
        }
        if let Some(identifier) = &subject.identifier {
            let key = self.identity_key(subject.metadata, identifier);
            self.by_identity.insert(key, index);
        }
        self.subjects.push(subject);
        index
    }

    fn collect_save(&mut self, entity: EntityRef, explicit: bool) -> Result<usize> {
        if let Some(index) = self.find_subject(entity) {
            self.by_entity.insert(entity, index);
            if explicit {
                self.subjects[index].explicit = true;
            }
            return Ok(index);
        }

        let record = self.record(entity)?;
        let metadata = self.metadata_of(record)?;
        let identifier = metadata.identifier(record, self.graph, self.registry);
        let kind = if identifier.is_some() {
            SubjectKind::Update
        } else {
            SubjectKind::Insert
        };
        let mut subject = Subject::new(metadata.id, Some(entity), identifier).with_kind(kind);
        subject.explicit = explicit;
        let index = self.register(subject);
        trace!(entity = %metadata.name, slot = entity.0, kind = kind.as_str(), "collected");

        for relation in metadata.relations.iter().filter(|r| r.persistence) {
            let Some(value) = record.relation(&relation.property_name) else {
                continue;
            };
            for related in value.refs() {
                let related_record = self.record(related)?;
                let related_metadata = self.metadata_of(related_record)?;
                let has_identifier = related_metadata
                    .identifier(related_record, self.graph, self.registry)
                    .is_some();
                let allowed = if has_identifier {
                    relation.cascade.update || relation.cascade.insert
                } else {
                    relation.cascade.insert
                };
                if allowed {
                    self.collect_save(related, false)?;
                }
            }
        }
        Ok(index)
    }

    fn collect_removal(&mut self, entity: EntityRef, kind: SubjectKind, explicit: bool) -> Result<Option<usize>> {
        if let Some(index) = self.find_subject(entity) {
            self.by_entity.insert(entity, index);
            if explicit {
                let subject = &mut self.subjects[index];
                subject.explicit = true;
                subject.database_cascaded = false;
            }
            return Ok(Some(index));
        }

        let record = self.record(entity)?;
        let metadata = self.metadata_of(record)?;
        let Some(identifier) = metadata.identifier(record, self.graph, self.registry) else {
            trace!(entity = %metadata.name, slot = entity.0, "no identifier; nothing to {}", kind.as_str());
            return Ok(None);
        };
        let mut subject = Subject::new(metadata.id, Some(entity), Some(identifier)).with_kind(kind);
        subject.explicit = explicit;
        let index = self.register(subject);
        trace!(entity = %metadata.name, slot = entity.0, kind = kind.as_str(), "collected");

        for relation in &metadata.relations {
            let allowed = match kind {
                SubjectKind::Remove => relation.cascade.remove,
                SubjectKind::SoftRemove => relation.cascade.soft_remove,
                SubjectKind::Recover => relation.cascade.recover,
                SubjectKind::Insert | SubjectKind::Update => false,
            };
            if !allowed {
                continue;
            }
            let Some(value) = record.relation(&relation.property_name) else {
                continue;
            };
            for related in value.refs() {
                let Some(related_index) = self.collect_removal(related, kind, false)? else {
                    continue;
                };
                if relation.is_join_column_owner() {
                    push_unique(&mut self.subjects[index].references, related_index);
                } else if !relation.is_many_to_many() {
                    push_unique(&mut self.subjects[related_index].references, index);
                    let inverse = self.registry.inverse_of(relation).filter(|r| r.is_owning());
                    if let (SubjectKind::Remove, Some(inverse)) = (kind, inverse) {
                        let child = &mut self.subjects[related_index];
                        if !child.explicit
                            && inverse.database_cascades_delete()
                            && orphan_action(relation, inverse) != OrphanedRowAction::Delete
                        {
                            child.database_cascaded = true;
                        }
                    }
                }
            }
        }
        Ok(Some(index))
    }

    /// Unmark cascaded subjects that a live graph entity still points at.
    fn keep_referenced(&mut self, kind: SubjectKind) {
        loop {
            let mut changed = false;
            for index in 0..self.subjects.len() {
                let subject = &self.subjects[index];
                if subject.explicit || subject.kind != Some(kind) {
                    continue;
                }
                let Some(entity) = subject.entity else {
                    continue;
                };
                let kept_by = self.graph.referrers(entity).into_iter().find(|(referrer, _)| {
                    self.by_entity
                        .get(referrer)
                        .is_none_or(|&i| self.subjects[i].kind != Some(kind))
                });
                if let Some((referrer, relation)) = kept_by {
                    trace!(slot = entity.0, referrer = referrer.0, %relation, "still referenced; kept");
                    self.subjects[index].kind = None;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn require_delete_date(&self) -> Result<()> {
        for subject in &self.subjects {
            if !matches!(subject.kind, Some(SubjectKind::SoftRemove | SubjectKind::Recover)) {
                continue;
            }
            let metadata = self.registry.get(subject.metadata);
            if metadata.delete_date_column().is_none() {
                return Err(Error::metadata(
                    MetadataErrorKind::UnknownProperty,
                    metadata.name.clone(),
                    format!("{} has no delete date column", metadata.name),
                ));
            }
        }
        Ok(())
    }

    fn compute_save_changes(&mut self) -> Result<()> {
        let registry = self.registry;
        let graph = self.graph;
        let count = self.subjects.len();

        // Own columns and join columns first, so that assignments made from
        // the other side of a one-to-many below take precedence.
        for index in 0..count {
            let Some(entity) = self.saved_entity(index) else {
                continue;
            };
            let metadata = registry.get(self.subjects[index].metadata);
            let record = &graph[entity];
            let diff = diff_columns(&self.driver, metadata, record, self.subjects[index].database_entity.as_ref());
            self.subjects[index].diff_columns = diff;
            for relation in metadata.relations.iter().filter(|r| r.persistence && r.is_join_column_owner()) {
                if let Some(value) = record.relation(&relation.property_name) {
                    self.compute_join_column_change(index, metadata, relation, value)?;
                }
            }
        }

        for index in 0..count {
            let Some(entity) = self.saved_entity(index) else {
                continue;
            };
            let metadata = registry.get(self.subjects[index].metadata);
            let record = &graph[entity];
            for relation in metadata.relations.iter().filter(|r| r.persistence && !r.is_join_column_owner()) {
                let Some(value) = record.relation(&relation.property_name) else {
                    continue;
                };
                if relation.is_many_to_many() {
                    self.compute_junction_changes(index, metadata, relation, value)?;
                } else {
                    self.compute_inverse_changes(index, metadata, relation, value)?;
                }
            }
        }
        Ok(())
    }

    fn saved_entity(&self, index: usize) -> Option<EntityRef> {
        let subject = &self.subjects[index];
        match subject.kind {
            Some(SubjectKind::Insert | SubjectKind::Update) => subject.entity,
            _ => None,
        }
    }

    /// What a related entity resolves to, or `None` when it is unsaved and
    /// not part of the operation.
    fn related_change(&self, related: EntityRef) -> Result<(Option<ChangeValue>, Option<EntityIdentifier>)> {
        let record = self.record(related)?;
        let metadata = self.metadata_of(record)?;
        let identifier = metadata.identifier(record, self.graph, self.registry);
        let change = match self.find_subject(related) {
            Some(index) if self.subjects[index].is(SubjectKind::Insert) => Some(ChangeValue::Subject(index)),
            Some(index) if identifier.is_some() => Some(ChangeValue::Subject(index)),
            _ => identifier.clone().map(ChangeValue::Identifier),
        };
        Ok((change, identifier))
    }

    fn compute_join_column_change(
        &mut self,
        index: usize,
        metadata: &EntityMetadata,
        relation: &RelationMetadata,
        value: &RelationValue,
    ) -> Result<()> {
        let change = match value {
            RelationValue::Null => ChangeValue::Null,
            RelationValue::One(target) => match self.related_change(*target)? {
                (Some(change), _) => change,
                (None, _) => {
                    trace!(relation = %relation.property_name, "related entity is unsaved and not cascaded");
                    return Ok(());
                }
            },
            RelationValue::Many(_) => return Ok(()),
        };

        let changed = match &self.subjects[index].database_entity {
            None => !matches!(change, ChangeValue::Null),
            Some(stored) => match self.join_values(metadata, relation, &change) {
                None => true,
                Some(values) => metadata.join_columns_of(relation).zip(values).any(|(column, value)| {
                    let before = stored.values.get(&column.property_path).cloned().unwrap_or(Value::Null);
                    !value.loosely_equals(&before)
                }),
            },
        };
        if changed {
            trace!(relation = %relation.property_name, "foreign key changed");
            self.subjects[index].set_change_map(&relation.property_name, change);
        }
        Ok(())
    }

    /// Join column values a change resolves to, when already known.
    fn join_values(&self, metadata: &EntityMetadata, relation: &RelationMetadata, change: &ChangeValue) -> Option<Vec<Value>> {
        let identifier = match change {
            ChangeValue::Null => return Some(metadata.join_columns_of(relation).map(|_| Value::Null).collect()),
            ChangeValue::Identifier(id) => id,
            ChangeValue::Subject(index) => {
                let subject = &self.subjects[*index];
                if subject.is(SubjectKind::Insert) {
                    return None;
                }
                subject.identifier.as_ref()?
            }
        };
        metadata
            .join_columns_of(relation)
            .map(|column| {
                column
                    .referenced_column
                    .as_deref()
                    .and_then(|path| identifier.get(path))
                    .cloned()
            })
            .collect()
    }

    fn stored_relation_ids(&self, index: usize, relation: &RelationMetadata) -> Vec<EntityIdentifier> {
        let subject = &self.subjects[index];
        if subject.is(SubjectKind::Insert) {
            return Vec::new();
        }
        subject
            .database_relation_ids
            .get(&relation.property_name)
            .cloned()
            .unwrap_or_default()
    }

    fn check_initialized(&self, metadata: &EntityMetadata, relation: &RelationMetadata, stored_empty: bool) -> Result<()> {
        if relation.relation_type.is_to_many() && stored_empty {
            return Err(InitializedRelationError {
                entity: metadata.name.clone(),
                relation: relation.property_name.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn compute_inverse_changes(
        &mut self,
        index: usize,
        metadata: &EntityMetadata,
        relation: &RelationMetadata,
        value: &RelationValue,
    ) -> Result<()> {
        let Some(inverse) = self.registry.inverse_of(relation).filter(|r| r.is_owning()) else {
            return Ok(());
        };
        let parent_is_new = self.subjects[index].is(SubjectKind::Insert);
        let stored = self.stored_relation_ids(index, relation);
        let mut current = Vec::new();
        let mut unsaved = false;

        for child in value.refs() {
            let record = self.record(child)?;
            let child_metadata = self.metadata_of(record)?;
            let identifier = child_metadata.identifier(record, self.graph, self.registry);
            let linked = identifier
                .as_ref()
                .is_some_and(|id| stored.iter().any(|s| s.matches(id)));
            match (self.find_subject(child), &identifier) {
                (Some(child_index), _) => {
                    if !linked || self.subjects[child_index].is(SubjectKind::Insert) {
                        self.subjects[child_index].set_change_map(&inverse.property_name, ChangeValue::Subject(index));
                    }
                }
                (None, Some(id)) if !linked => {
                    let mut subject = Subject::new(child_metadata.id, Some(child), Some(id.clone()));
                    subject.set_change_map(&inverse.property_name, ChangeValue::Subject(index));
                    self.register(subject);
                }
                (None, Some(_)) => {}
                (None, None) => unsaved = true,
            }
            if let Some(id) = identifier {
                current.push(id);
            }
        }
        if unsaved {
            self.check_initialized(metadata, relation, stored.is_empty())?;
        }
        if parent_is_new {
            return Ok(());
        }

        let target = self.registry.target_of(relation);
        let action = orphan_action(relation, inverse);
        for orphan in stored.iter().filter(|s| !current.iter().any(|c| c.matches(s))) {
            let existing = self.by_identity.get(&self.identity_key(target.id, orphan)).copied();
            if let Some(existing) = existing {
                let subject = &self.subjects[existing];
                if subject.change_map(&inverse.property_name).is_some()
                    || matches!(subject.kind, Some(SubjectKind::Remove | SubjectKind::SoftRemove))
                {
                    continue;
                }
            }
            let orphan_index = match (action, existing) {
                (OrphanedRowAction::Disable, _) => continue,
                (_, Some(existing)) => existing,
                (_, None) => self.register(Subject::new(target.id, None, Some(orphan.clone()))),
            };
            match action {
                OrphanedRowAction::Nullify => {
                    self.subjects[orphan_index].set_change_map(&inverse.property_name, ChangeValue::Null);
                }
                OrphanedRowAction::Delete => self.subjects[orphan_index].kind = Some(SubjectKind::Remove),
                OrphanedRowAction::SoftDelete => {
                    if target.delete_date_column().is_none() {
                        return Err(Error::metadata(
                            MetadataErrorKind::UnknownProperty,
                            target.name.clone(),
                            format!("{} has no delete date column for soft-deleting orphans", target.name),
                        ));
                    }
                    self.subjects[orphan_index].kind = Some(SubjectKind::SoftRemove);
                }
                OrphanedRowAction::Disable => {}
            }
            trace!(entity = %target.name, id = %orphan.key(), ?action, "orphaned child");
        }
        Ok(())
    }

    fn compute_junction_changes(
        &mut self,
        index: usize,
        metadata: &EntityMetadata,
        relation: &RelationMetadata,
        value: &RelationValue,
    ) -> Result<()> {
        let stored = self.stored_relation_ids(index, relation);
        let mut current = Vec::new();
        let mut unsaved = false;
        let mut changed = false;

        for related in value.refs() {
            let (change, identifier) = self.related_change(related)?;
            let linked = identifier
                .as_ref()
                .is_some_and(|id| stored.iter().any(|s| s.matches(id)));
            match change {
                Some(change) if !linked => {
                    self.subjects[index].push_junction_insert(&relation.property_name, change);
                    changed = true;
                }
                Some(_) => {}
                None => unsaved = true,
            }
            if let Some(id) = identifier {
                current.push(id);
            }
        }
        if unsaved {
            self.check_initialized(metadata, relation, stored.is_empty())?;
        }
        for removed in stored.iter().filter(|s| !current.iter().any(|c| c.matches(s))) {
            self.subjects[index].push_junction_removal(&relation.property_name, ChangeValue::Identifier(removed.clone()));
            changed = true;
        }
        if changed {
            let subject = &mut self.subjects[index];
            if !subject.diff_relations.contains(&relation.property_name) {
                subject.diff_relations.push(relation.property_name.clone());
            }
        }
        Ok(())
    }

    fn log_summary(&self) {
        let count = |kind: SubjectKind| self.subjects.iter().filter(|s| s.is(kind)).count();
        debug!(
            subjects = self.subjects.len(),
            inserts = count(SubjectKind::Insert),
            updates = count(SubjectKind::Update),
            removes = count(SubjectKind::Remove),
            soft_removes = count(SubjectKind::SoftRemove),
            recovers = count(SubjectKind::Recover),
            "change set computed"
        );
    }
}

/// Property paths whose value differs from the stored row.
///
/// Keys, join columns and columns the engine maintains itself (version,
/// dates, discriminator) are never part of the diff. Without a stored row
/// every defined column counts as changed.
pub fn diff_columns(
    driver: &Driver,
    metadata: &EntityMetadata,
    record: &EntityRecord,
    stored: Option<&EntityRecord>,
) -> Vec<String> {
    metadata
        .columns
        .iter()
        .filter(|c| {
            !(c.is_primary
                || c.is_join_column()
                || c.is_version()
                || c.is_create_date()
                || c.is_update_date()
                || c.is_delete_date()
                || c.is_discriminator())
        })
        .filter(|column| {
            let Some(value) = record.values.get(&column.property_path) else {
                return false;
            };
            let Some(stored) = stored else {
                return true;
            };
            let after = driver.prepare_persistent_value(column, value);
            let before = stored
                .values
                .get(&column.property_path)
                .map_or(Value::Null, |v| driver.prepare_persistent_value(column, v));
            !after.loosely_equals(&before)
        })
        .map(|c| c.property_path.clone())
        .collect()
}

/// Orphan handling of a one-to-many; the owning side's setting wins.
fn orphan_action(relation: &RelationMetadata, inverse: &RelationMetadata) -> OrphanedRowAction {
    if inverse.orphaned_row_action == OrphanedRowAction::default() {
        relation.orphaned_row_action
    } else {
        inverse.orphaned_row_action
    }
}

fn push_unique(list: &mut Vec<usize>, index: usize) {
    if !list.contains(&index) {
        list.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use persisto_core::metadata::{Cascade, ColumnOptions, ColumnType, RelationOptions};
    use persisto_core::testing::MockConnection;
    use persisto_core::{EntitySchema, MetadataArgs, QueryResult, Row, SubscriberSet, build_metadata};

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn blog() -> MetadataRegistry {
        build_metadata(
            &MetadataArgs::new()
                .entity(
                    EntitySchema::new("User")
                        .column(ColumnOptions::primary_generated("id"))
                        .column(ColumnOptions::new("name", ColumnType::Text))
                        .relation(RelationOptions::one_to_many("posts", "Post", "author")),
                )
                .entity(
                    EntitySchema::new("Post")
                        .column(ColumnOptions::primary_generated("id"))
                        .column(ColumnOptions::new("title", ColumnType::Text))
                        .column(ColumnOptions::delete_date("deleted_at"))
                        .relation(
                            RelationOptions::many_to_one("author", "User")
                                .inverse_side("posts")
                                .cascade(Cascade::SAVE),
                        )
                        .relation(RelationOptions::many_to_many("tags", "Tag")),
                )
                .entity(
                    EntitySchema::new("Tag")
                        .column(ColumnOptions::primary_generated("id"))
                        .column(ColumnOptions::new("label", ColumnType::Text)),
                ),
        )
        .unwrap()
    }

    enum Build {
        Save,
        Remove,
        SoftRemove,
    }

    fn build(
        registry: &MetadataRegistry,
        conn: &MockConnection,
        graph: &EntityGraph,
        roots: &[EntityRef],
        operation: Build,
    ) -> Outcome<Vec<Subject>, Error> {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let runner = QueryRunner::new(conn.clone(), SubscriberSet::new());
        rt.block_on(async {
            let mut builder = SubjectBuilder::new(registry, &Driver::postgres(), graph);
            let outcome = match operation {
                Build::Save => builder.build_for_insert_or_update(&cx, &runner, roots).await,
                Build::Remove => builder.build_for_removal(&cx, &runner, roots).await,
                Build::SoftRemove => builder.build_for_soft_removal(&cx, &runner, roots).await,
            };
            match outcome {
                Outcome::Ok(()) => Outcome::Ok(builder.into_subjects()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        })
    }

    fn related_id(change: &ChangeValue) -> &EntityIdentifier {
        match change {
            ChangeValue::Identifier(id) => id,
            other => std::panic::panic_any(format!("expected an identifier, got {other:?}")),
        }
    }

    fn post_row(id: i64, title: &str, author: Option<i64>) -> Row {
        Row::new(
            vec![
                "post_id".to_string(),
                "post_title".to_string(),
                "post_deleted_at".to_string(),
                "post_author_id".to_string(),
            ],
            vec![
                Value::BigInt(id),
                Value::Text(title.to_string()),
                Value::Null,
                author.map_or(Value::Null, Value::BigInt),
            ],
        )
    }

    fn user_row(id: i64, name: &str) -> Row {
        Row::new(
            vec!["user_id".to_string(), "user_name".to_string()],
            vec![Value::BigInt(id), Value::Text(name.to_string())],
        )
    }

    #[test]
    fn test_new_graph_cascades_inserts_without_queries() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        let mut graph = EntityGraph::new();
        let author = graph.insert(EntityRecord::new("User").with("name", "ann"));
        let post = graph.insert(EntityRecord::new("Post").with("title", "hello"));
        graph.link(post, "author", author);

        let subjects = unwrap_outcome(build(&registry, &conn, &graph, &[post], Build::Save));
        assert!(conn.executed_sql().is_empty());
        assert_eq!(subjects.len(), 2);
        assert!(subjects.iter().all(|s| s.is(SubjectKind::Insert)));
        assert!(subjects[0].explicit);
        assert!(!subjects[1].explicit);
        assert_eq!(subjects[0].change_map("author"), Some(&ChangeValue::Subject(1)));
        assert_eq!(subjects[0].diff_columns, vec!["title".to_string()]);
    }

    #[test]
    fn test_shared_references_collapse_to_one_subject() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        let mut graph = EntityGraph::new();
        let author = graph.insert(EntityRecord::new("User").with("name", "ann"));
        let first = graph.insert(EntityRecord::new("Post").with("title", "a"));
        let second = graph.insert(EntityRecord::new("Post").with("title", "b"));
        graph.link(first, "author", author);
        graph.link(second, "author", author);

        let subjects = unwrap_outcome(build(&registry, &conn, &graph, &[first, second, first], Build::Save));
        assert_eq!(subjects.len(), 3);
    }

    #[test]
    fn test_unchanged_row_has_no_diff() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        conn.on("FROM \"post\"", QueryResult::with_rows(vec![post_row(1, "hello", None)]));
        let mut graph = EntityGraph::new();
        let post = graph.insert(EntityRecord::new("Post").with("id", 1_i64).with("title", "hello"));

        let subjects = unwrap_outcome(build(&registry, &conn, &graph, &[post], Build::Save));
        assert!(subjects[0].is(SubjectKind::Update));
        assert!(subjects[0].diff_columns.is_empty());
        assert!(!subjects[0].must_be_updated());
    }

    #[test]
    fn test_changed_column_and_foreign_key_are_detected() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        conn.on("FROM \"post\"", QueryResult::with_rows(vec![post_row(1, "hello", Some(5))]));
        conn.on("FROM \"user\"", QueryResult::with_rows(vec![user_row(6, "bob")]));
        let mut graph = EntityGraph::new();
        let post = graph.insert(EntityRecord::new("Post").with("id", 1_i64).with("title", "changed"));
        let author = graph.insert(EntityRecord::new("User").with("id", 6_i64).with("name", "bob"));
        graph.link(post, "author", author);

        let subjects = unwrap_outcome(build(&registry, &conn, &graph, &[post], Build::Save));
        assert_eq!(subjects[0].diff_columns, vec!["title".to_string()]);
        assert_eq!(subjects[0].change_map("author"), Some(&ChangeValue::Subject(1)));
        assert!(subjects[1].is(SubjectKind::Update));
        assert!(subjects[1].diff_columns.is_empty());
    }

    #[test]
    fn test_missing_row_becomes_insert() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        let mut graph = EntityGraph::new();
        let tag = graph.insert(EntityRecord::new("Tag").with("id", 3_i64).with("label", "rust"));

        let subjects = unwrap_outcome(build(&registry, &conn, &graph, &[tag], Build::Save));
        assert!(subjects[0].is(SubjectKind::Insert));
    }

    #[test]
    fn test_junction_rows_are_diffed_by_identifier() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        conn.on("FROM \"post\"", QueryResult::with_rows(vec![post_row(1, "hello", None)]));
        let names = vec!["post_id".to_string(), "tag_id".to_string()];
        conn.on(
            "FROM \"post_tags_tag\"",
            QueryResult::with_rows(vec![
                Row::new(names.clone(), vec![Value::BigInt(1), Value::BigInt(1)]),
                Row::new(names, vec![Value::BigInt(1), Value::BigInt(2)]),
            ]),
        );
        let mut graph = EntityGraph::new();
        let post = graph.insert(EntityRecord::new("Post").with("id", 1_i64).with("title", "hello"));
        let kept = graph.insert(EntityRecord::new("Tag").with("id", 1_i64));
        let added = graph.insert(EntityRecord::new("Tag").with("id", 3_i64));
        graph.push_related(post, "tags", kept);
        graph.push_related(post, "tags", added);

        let subjects = unwrap_outcome(build(&registry, &conn, &graph, &[post], Build::Save));
        assert_eq!(subjects.len(), 1);
        let post = &subjects[0];
        assert_eq!(post.junction_inserts.len(), 1);
        assert!(related_id(&post.junction_inserts[0].related).matches(&EntityIdentifier::single("id", 3_i64)));
        assert_eq!(post.junction_removals.len(), 1);
        assert!(related_id(&post.junction_removals[0].related).matches(&EntityIdentifier::single("id", 2_i64)));
        assert_eq!(post.diff_relations, vec!["tags".to_string()]);
    }

    #[test]
    fn test_unsaved_items_in_new_collection_are_rejected() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        let mut graph = EntityGraph::new();
        let user = graph.insert(EntityRecord::new("User").with("name", "ann"));
        let post = graph.insert(EntityRecord::new("Post").with("title", "draft"));
        graph.push_related(user, "posts", post);

        let outcome = build(&registry, &conn, &graph, &[user], Build::Save);
        match outcome {
            Outcome::Err(Error::InitializedRelation(e)) => {
                assert_eq!(e.entity, "User");
                assert_eq!(e.relation, "posts");
            }
            other => std::panic::panic_any(format!("expected initialized relation error, got {other:?}")),
        }
        assert!(conn.statements_starting_with("INSERT").is_empty());
    }

    #[test]
    fn test_removed_child_is_nullified() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        conn.on("FROM \"user\"", QueryResult::with_rows(vec![user_row(1, "ann")]));
        let names = vec!["author_id".to_string(), "id".to_string()];
        conn.on(
            "SELECT \"author_id\", \"id\" FROM \"post\"",
            QueryResult::with_rows(vec![
                Row::new(names.clone(), vec![Value::BigInt(1), Value::BigInt(10)]),
                Row::new(names, vec![Value::BigInt(1), Value::BigInt(11)]),
            ]),
        );
        let mut graph = EntityGraph::new();
        let user = graph.insert(EntityRecord::new("User").with("id", 1_i64).with("name", "ann"));
        let kept = graph.insert(EntityRecord::new("Post").with("id", 10_i64));
        let moved_in = graph.insert(EntityRecord::new("Post").with("id", 12_i64));
        graph.push_related(user, "posts", kept);
        graph.push_related(user, "posts", moved_in);

        let subjects = unwrap_outcome(build(&registry, &conn, &graph, &[user], Build::Save));
        assert_eq!(subjects.len(), 3);
        let moved = subjects.iter().find(|s| s.entity == Some(moved_in)).unwrap();
        assert_eq!(moved.kind, None);
        assert_eq!(moved.change_map("author"), Some(&ChangeValue::Subject(0)));
        let orphan = subjects.iter().find(|s| s.entity.is_none()).unwrap();
        assert!(orphan.identifier.as_ref().unwrap().matches(&EntityIdentifier::single("id", 11_i64)));
        assert_eq!(orphan.change_map("author"), Some(&ChangeValue::Null));
    }

    #[test]
    fn test_cascaded_removal_keeps_referenced_entities() {
        let registry = build_metadata(
            &MetadataArgs::new()
                .entity(
                    EntitySchema::new("User")
                        .column(ColumnOptions::primary_generated("id")),
                )
                .entity(
                    EntitySchema::new("Post")
                        .column(ColumnOptions::primary_generated("id"))
                        .relation(
                            RelationOptions::many_to_one("author", "User")
                                .cascade(Cascade::NONE.with_remove()),
                        ),
                ),
        )
        .unwrap();
        let conn = MockConnection::new(Driver::postgres());
        conn.on(
            "FROM \"post\"",
            QueryResult::with_rows(vec![Row::new(
                vec!["post_id".to_string(), "post_author_id".to_string()],
                vec![Value::BigInt(1), Value::BigInt(7)],
            )]),
        );
        conn.on("FROM \"user\"", QueryResult::with_rows(vec![Row::new(vec!["user_id".to_string()], vec![Value::BigInt(7)])]));
        let mut graph = EntityGraph::new();
        let author = graph.insert(EntityRecord::new("User").with("id", 7_i64));
        let removed = graph.insert(EntityRecord::new("Post").with("id", 1_i64));
        let other = graph.insert(EntityRecord::new("Post").with("id", 2_i64));
        graph.link(removed, "author", author);
        graph.link(other, "author", author);

        let subjects = unwrap_outcome(build(&registry, &conn, &graph, &[removed], Build::Remove));
        let user = subjects.iter().find(|s| s.entity == Some(author)).unwrap();
        assert_eq!(user.kind, None);
        assert!(subjects[0].is(SubjectKind::Remove));

        let subjects = unwrap_outcome(build(&registry, &conn, &graph, &[removed, other], Build::Remove));
        let user = subjects.iter().find(|s| s.entity == Some(author)).unwrap();
        assert!(user.is(SubjectKind::Remove));
    }

    #[test]
    fn test_soft_removal_requires_delete_date() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        let mut graph = EntityGraph::new();
        let user = graph.insert(EntityRecord::new("User").with("id", 1_i64));

        match build(&registry, &conn, &graph, &[user], Build::SoftRemove) {
            Outcome::Err(Error::Metadata(e)) => assert_eq!(e.kind, MetadataErrorKind::UnknownProperty),
            other => std::panic::panic_any(format!("expected metadata error, got {other:?}")),
        }
        assert!(conn.executed_sql().is_empty());
    }
}
