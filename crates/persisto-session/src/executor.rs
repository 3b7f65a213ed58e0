//! Statement execution for a computed change set.
//!
//! The executor runs the groups of an [`ExecutionPlan`] against one
//! [`QueryRunner`]: inserts (with deferred foreign key patches), junction
//! rows, updates and removals, followed by listeners. Values the database
//! generated are merged back into the entity graph.

use std::collections::{BTreeMap, HashSet};

use asupersync::{Cx, Outcome};
use persisto_core::metadata::{Generation, ListenerKind, ReferentialAction, RelationMetadata};
use persisto_core::{
    ConfigErrorKind, Connection, Driver, EntityEvent, EntityGraph, EntityIdentifier, EntityMetadata, Error,
    MetadataRegistry, OptimisticLockError, QueryRunner, Result, ReturningStyle, SubscriberSet, Value, try_outcome,
    try_result,
};
use persisto_query::{DeleteQueryBuilder, Expr, InsertQueryBuilder, ParameterSink, SelectQueryBuilder, UpdateQueryBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::orderer::ExecutionPlan;
use crate::subject::{ChangeValue, Subject, SubjectKind, SubjectState};
use crate::subject_builder::diff_columns;

/// Row counts of one executed change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub soft_removed: usize,
    pub recovered: usize,
}

impl PersistSummary {
    pub fn is_empty(&self) -> bool {
        *self == PersistSummary::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Before,
    After,
}

/// Values of one INSERT row.
struct InsertRow {
    values: Vec<(String, Value)>,
    /// Values the engine filled in and writes back to the record
    written: Vec<(String, Value)>,
    /// Relations inserted as NULL and patched once their target exists
    deferred: Vec<usize>,
}

/// Executes the subjects of one operation.
#[derive(Debug)]
pub struct SubjectExecutor<'a> {
    registry: &'a MetadataRegistry,
    driver: Driver,
    subjects: Vec<Subject>,
    plan: ExecutionPlan,
    listeners: bool,
    reload: bool,
    patches: Vec<(usize, usize)>,
}

impl<'a> SubjectExecutor<'a> {
    /// Order `subjects`; fails with `CycleDetected` before any statement.
    pub fn new(registry: &'a MetadataRegistry, driver: &Driver, subjects: Vec<Subject>) -> Result<Self> {
        let plan = ExecutionPlan::build(registry, &subjects)?;
        Ok(Self {
            registry,
            driver: driver.clone(),
            subjects,
            plan,
            listeners: true,
            reload: true,
            patches: Vec::new(),
        })
    }

    /// Run entity listeners and subscribers around the statements.
    pub fn with_listeners(mut self, enabled: bool) -> Self {
        self.listeners = enabled;
        self
    }

    /// Read database-generated values back into the graph.
    pub fn with_reload(mut self, enabled: bool) -> Self {
        self.reload = enabled;
        self
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Whether any subject needs a statement.
    pub fn has_work(&self) -> bool {
        self.subjects.iter().any(|s| {
            matches!(s.kind, Some(SubjectKind::Insert | SubjectKind::Remove))
                || s.must_be_updated()
                || !s.junction_inserts.is_empty()
                || !s.junction_removals.is_empty()
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(subjects = self.subjects.len()))]
    pub async fn execute<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        graph: &mut EntityGraph,
    ) -> Outcome<PersistSummary, Error> {
        if self.listeners {
            try_result!(self.broadcast(runner.subscribers(), graph, Phase::Before));
            self.refresh_diffs(graph);
            self.plan = try_result!(ExecutionPlan::build(self.registry, &self.subjects));
        }
        self.generate_uuids(graph);

        for group in self.plan.inserts.clone() {
            for index in group.subjects {
                try_outcome!(self.insert(cx, runner, graph, index).await);
            }
        }
        try_outcome!(self.patch_deferred(cx, runner, graph).await);
        try_outcome!(self.write_junctions(cx, runner, graph).await);
        for group in self.plan.updates.clone() {
            for index in group.subjects {
                try_outcome!(self.update(cx, runner, graph, index, group.kind).await);
            }
        }
        for group in self.plan.removes.clone() {
            for index in group.subjects {
                try_outcome!(self.remove(cx, runner, graph, index).await);
            }
        }

        if self.listeners {
            try_result!(self.broadcast(runner.subscribers(), graph, Phase::After));
        }
        let summary = self.finish();
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            removed = summary.removed,
            soft_removed = summary.soft_removed,
            recovered = summary.recovered,
            "change set persisted"
        );
        Outcome::Ok(summary)
    }

    fn finish(&mut self) -> PersistSummary {
        let mut summary = PersistSummary::default();
        for subject in &mut self.subjects {
            match subject.state {
                SubjectState::Inserted => summary.inserted += 1,
                SubjectState::Updated => summary.updated += 1,
                SubjectState::Removed => summary.removed += 1,
                SubjectState::SoftRemoved => summary.soft_removed += 1,
                SubjectState::Recovered => summary.recovered += 1,
                SubjectState::Pending | SubjectState::Done => continue,
            }
            subject.state = SubjectState::Done;
        }
        summary
    }

    fn announced(subject: &Subject, phase: Phase) -> bool {
        if subject.entity.is_none() {
            return false;
        }
        let wanted = match subject.kind {
            Some(SubjectKind::Update) => subject.must_be_updated(),
            Some(_) => true,
            None => false,
        };
        wanted && (phase == Phase::Before || subject.state != SubjectState::Pending)
    }

    fn broadcast(&self, subscribers: &SubscriberSet, graph: &mut EntityGraph, phase: Phase) -> Result<()> {
        for subject in &self.subjects {
            let (Some(kind), Some(entity)) = (subject.kind, subject.entity) else {
                continue;
            };
            if !Self::announced(subject, phase) {
                continue;
            }
            let listener = listener_kind(kind, phase);
            let metadata = self.registry.get(subject.metadata);
            let record = graph
                .get_mut(entity)
                .ok_or_else(|| Error::Custom(format!("entity slot {} is not in the graph", entity.0)))?;
            let mut event = EntityEvent {
                metadata,
                entity,
                record,
                identifier: subject.identifier.clone(),
                updated_columns: &subject.diff_columns,
            };
            subscribers.broadcast(listener, &mut event)?;
        }
        Ok(())
    }

    /// Listeners may have changed records; diff updated rows again.
    fn refresh_diffs(&mut self, graph: &EntityGraph) {
        for subject in &mut self.subjects {
            if !subject.is(SubjectKind::Update) {
                continue;
            }
            let Some(record) = subject.entity.and_then(|e| graph.get(e)) else {
                continue;
            };
            let metadata = self.registry.get(subject.metadata);
            subject.diff_columns = diff_columns(&self.driver, metadata, record, subject.database_entity.as_ref());
        }
    }

    fn generate_uuids(&mut self, graph: &mut EntityGraph) {
        if self.driver.generates_uuid() {
            return;
        }
        for subject in &mut self.subjects {
            if !subject.is(SubjectKind::Insert) {
                continue;
            }
            let Some(record) = subject.entity.and_then(|e| graph.get_mut(e)) else {
                continue;
            };
            let metadata = self.registry.get(subject.metadata);
            for column in metadata
                .columns
                .iter()
                .filter(|c| c.generation == Generation::Uuid)
            {
                if record.get(&column.property_path).is_none_or(Value::is_null) {
                    let value = Value::new_uuid_v4();
                    record.set(column.property_path.clone(), value.clone());
                    subject.generated_map.insert(column.property_path.clone(), value);
                }
            }
        }
    }

    /// Join column values `change` resolves to, or `None` while the row it
    /// points at has no key yet.
    fn resolve_join_values(
        &self,
        graph: &EntityGraph,
        metadata: &EntityMetadata,
        relation: &RelationMetadata,
        change: &ChangeValue,
    ) -> Option<Vec<(String, Value)>> {
        let mut values = Vec::new();
        for column in metadata.join_columns_of(relation) {
            let value = match change {
                ChangeValue::Null => Value::Null,
                ChangeValue::Identifier(id) => id.get(column.referenced_column.as_deref()?)?.clone(),
                ChangeValue::Subject(index) => {
                    let target = &self.subjects[*index];
                    let path = column.referenced_column.as_deref()?;
                    let value = match target.entity.and_then(|e| graph.get(e)) {
                        Some(record) => {
                            let target_metadata = self.registry.get(target.metadata);
                            let referenced = target_metadata.find_column(path)?;
                            target_metadata.column_value(referenced, record, graph, self.registry)?
                        }
                        None => target.identifier.as_ref()?.get(path)?.clone(),
                    };
                    if value.is_null() {
                        return None;
                    }
                    value
                }
            };
            values.push((
                column.property_path.clone(),
                self.driver.prepare_persistent_value(column, &value),
            ));
        }
        Some(values)
    }

    fn insert_row(&self, graph: &EntityGraph, index: usize) -> Result<InsertRow> {
        let subject = &self.subjects[index];
        let metadata = self.registry.get(subject.metadata);
        let record = subject
            .entity
            .and_then(|e| graph.get(e))
            .ok_or_else(|| Error::Custom(format!("insert of {} has no record", metadata.name)))?;
        let mut row = InsertRow {
            values: Vec::new(),
            written: Vec::new(),
            deferred: Vec::new(),
        };

        for column in metadata.columns.iter().filter(|c| !c.is_join_column()) {
            match record.get(&column.property_path) {
                Some(Value::Null) if column.is_database_generated() => {}
                Some(value) if !matches!(value, Value::Default) => row
                    .values
                    .push((column.property_path.clone(), self.driver.prepare_persistent_value(column, value))),
                _ => {
                    let filled = if column.is_discriminator() {
                        metadata.inheritance.discriminator_value.clone().map(Value::Text)
                    } else if column.is_version() {
                        Some(Value::Int(1))
                    } else {
                        None
                    };
                    if let Some(value) = filled {
                        row.values.push((column.property_path.clone(), value.clone()));
                        row.written.push((column.property_path.clone(), value));
                    }
                }
            }
        }

        for (relation_index, relation) in metadata.relations.iter().enumerate() {
            if !relation.is_join_column_owner() {
                continue;
            }
            let Some(change) = subject.change_map(&relation.property_name) else {
                for column in metadata.join_columns_of(relation) {
                    if let Some(value) = metadata.column_value(column, record, graph, self.registry) {
                        row.values
                            .push((column.property_path.clone(), self.driver.prepare_persistent_value(column, &value)));
                    }
                }
                continue;
            };
            let pending = matches!(change, ChangeValue::Subject(j) if !self.subjects[*j].is_inserted());
            let resolved = if pending && relation.deferrable.is_none() {
                None
            } else {
                self.resolve_join_values(graph, metadata, relation, change)
            };
            match resolved {
                Some(values) => {
                    row.written.extend(values.iter().cloned());
                    row.values.extend(values);
                }
                None if relation.allows_deferred_patch() => {
                    trace!(entity = %metadata.name, relation = %relation.property_name, "foreign key deferred");
                    for column in metadata.join_columns_of(relation) {
                        row.values.push((column.property_path.clone(), Value::Null));
                    }
                    row.deferred.push(relation_index);
                }
                None => {
                    return Err(Error::config(
                        ConfigErrorKind::CycleDetected,
                        format!(
                            "{}.{} references a row that is not written yet and cannot be NULL",
                            metadata.name, relation.property_name
                        ),
                    ));
                }
            }
        }
        Ok(row)
    }

    async fn insert<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        graph: &mut EntityGraph,
        index: usize,
    ) -> Outcome<(), Error> {
        let registry = self.registry;
        let Some(entity) = self.subjects[index].entity else {
            return Outcome::Ok(());
        };
        let metadata = registry.get(self.subjects[index].metadata);
        let row = try_result!(self.insert_row(graph, index));

        let generated_paths: Vec<&str> = metadata
            .columns
            .iter()
            .filter(|c| c.is_database_generated() || c.is_version() || c.default.is_some())
            .filter(|c| !row.values.iter().any(|(path, _)| path == &c.property_path))
            .map(|c| c.property_path.as_str())
            .collect();
        let returning = !matches!(self.driver.capabilities.returning, ReturningStyle::None);
        let mut builder = InsertQueryBuilder::new(&self.driver, metadata).values(row.values);
        if returning && !generated_paths.is_empty() {
            builder = builder.returning(&generated_paths);
        }
        let result = try_outcome!(builder.execute(cx, runner).await);
        let generated = self.driver.create_generated_map(metadata, &result);

        let record = &mut graph[entity];
        for (path, value) in row.written.into_iter().chain(generated.clone()) {
            record.values.insert(path, value);
        }
        let graph_view: &EntityGraph = graph;
        let identifier = metadata.identifier(&graph_view[entity], graph_view, registry);
        let subject = &mut self.subjects[index];
        subject.generated_map.extend(generated);
        subject.state = SubjectState::Inserted;
        subject.identifier = identifier.clone();
        for relation in row.deferred {
            self.patches.push((index, relation));
        }
        debug!(entity = %metadata.name, id = ?identifier.as_ref().map(EntityIdentifier::key), "inserted");

        let missing: Vec<String> = generated_paths
            .iter()
            .filter(|path| !self.subjects[index].generated_map.contains_key(**path))
            .map(|path| (*path).to_string())
            .collect();
        if self.reload && !returning && !missing.is_empty() {
            let Some(identifier) = identifier else {
                warn!(entity = %metadata.name, "inserted row has no identifier; generated values not reloaded");
                return Outcome::Ok(());
            };
            let loaded = try_outcome!(
                SelectQueryBuilder::for_metadata(registry, &self.driver, metadata, &metadata.table_name)
                    .with_deleted()
                    .call_listeners(false)
                    .where_in_ids(std::slice::from_ref(&identifier))
                    .get_many(cx, runner)
                    .await
            );
            let stored = loaded.records().next().map(|r| r.values.clone()).unwrap_or_default();
            for path in missing {
                if let Some(value) = stored.get(&path) {
                    graph[entity].values.insert(path.clone(), value.clone());
                    self.subjects[index].generated_map.insert(path, value.clone());
                }
            }
        }
        Outcome::Ok(())
    }

    /// Write foreign keys that were inserted as NULL because their target
    /// row came later in the same operation.
    async fn patch_deferred<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        graph: &mut EntityGraph,
    ) -> Outcome<(), Error> {
        for (index, relation_index) in std::mem::take(&mut self.patches) {
            let subject = &self.subjects[index];
            let metadata = self.registry.get(subject.metadata);
            let relation = &metadata.relations[relation_index];
            let (Some(change), Some(identifier)) = (subject.change_map(&relation.property_name), &subject.identifier)
            else {
                continue;
            };
            let Some(values) = self.resolve_join_values(graph, metadata, relation, change) else {
                return Outcome::Err(Error::config(
                    ConfigErrorKind::CycleDetected,
                    format!("{}.{} still has no target key", metadata.name, relation.property_name),
                ));
            };
            let mut builder = UpdateQueryBuilder::new(&self.driver, metadata);
            for (path, value) in &values {
                builder = builder.set(path.clone(), value.clone());
            }
            try_outcome!(
                builder
                    .where_in_ids(std::slice::from_ref(identifier))
                    .execute(cx, runner)
                    .await
            );
            trace!(entity = %metadata.name, relation = %relation.property_name, "deferred foreign key patched");
            if let Some(record) = subject.entity.and_then(|e| graph.get_mut(e)) {
                record.values.extend(values);
            }
        }
        Outcome::Ok(())
    }

    fn related_identifier(&self, graph: &EntityGraph, change: &ChangeValue) -> Option<EntityIdentifier> {
        match change {
            ChangeValue::Identifier(id) => Some(id.clone()),
            ChangeValue::Subject(index) => {
                let subject = &self.subjects[*index];
                subject.identifier.clone().or_else(|| {
                    let record = graph.get(subject.entity?)?;
                    self.registry
                        .get(subject.metadata)
                        .identifier(record, graph, self.registry)
                })
            }
            ChangeValue::Null => None,
        }
    }

    /// Junction row cells for `owner` and `related`, in column order.
    fn junction_cells(
        &self,
        owner_metadata: &EntityMetadata,
        relation: &RelationMetadata,
        owner: &EntityIdentifier,
        related: &EntityIdentifier,
    ) -> Option<(String, Vec<(String, Value)>)> {
        let junction = relation.junction.as_ref()?;
        let target = self.registry.target_of(relation);
        let mut cells = Vec::new();
        for (metadata, columns, id) in [
            (owner_metadata, &junction.owner_columns, owner),
            (target, &junction.inverse_columns, related),
        ] {
            for column in columns {
                let value = id.get(&column.referenced_column)?;
                let value = match metadata.find_column(&column.referenced_column) {
                    Some(referenced) => self.driver.prepare_persistent_value(referenced, value),
                    None => value.clone(),
                };
                cells.push((column.database_name.clone(), value));
            }
        }
        let table = self.driver.escape_table(
            &junction.table_name,
            owner_metadata.schema.as_deref(),
            owner_metadata.database.as_deref(),
        );
        Some((table, cells))
    }

    async fn write_junctions<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        graph: &EntityGraph,
    ) -> Outcome<(), Error> {
        let mut removed = HashSet::new();
        let mut inserted = HashSet::new();
        for subject in &self.subjects {
            if subject.junction_removals.is_empty() && subject.junction_inserts.is_empty() {
                continue;
            }
            let metadata = self.registry.get(subject.metadata);
            let Some(owner) = subject.identifier.as_ref() else {
                warn!(entity = %metadata.name, "junction rows skipped; owner has no identifier");
                continue;
            };
            for (changes, is_insert) in [(&subject.junction_removals, false), (&subject.junction_inserts, true)] {
                for change in changes {
                    let Some(relation) = metadata.find_relation(&change.relation) else {
                        continue;
                    };
                    let cells = self
                        .related_identifier(graph, &change.related)
                        .and_then(|related| self.junction_cells(metadata, relation, owner, &related));
                    let Some((table, cells)) = cells else {
                        warn!(entity = %metadata.name, relation = %change.relation, "junction row has no key");
                        continue;
                    };
                    let seen = if is_insert { &mut inserted } else { &mut removed };
                    if !seen.insert(junction_key(&table, &cells)) {
                        continue;
                    }
                    let (sql, params) = if is_insert {
                        junction_insert_sql(&self.driver, &table, cells)
                    } else {
                        junction_delete_sql(&self.driver, &table, cells)
                    };
                    try_outcome!(runner.query(cx, &sql, &params).await);
                }
            }
        }
        Outcome::Ok(())
    }

    async fn update<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        graph: &mut EntityGraph,
        index: usize,
        kind: SubjectKind,
    ) -> Outcome<(), Error> {
        let registry = self.registry;
        let subject = &self.subjects[index];
        let metadata = registry.get(subject.metadata);
        let Some(identifier) = subject.identifier.clone() else {
            return Outcome::Err(Error::Custom(format!("update of {} has no identifier", metadata.name)));
        };
        let record = subject.entity.and_then(|e| graph.get(e));
        let mut builder = UpdateQueryBuilder::new(&self.driver, metadata);

        if let Some(record) = record {
            for path in &subject.diff_columns {
                let (Some(column), Some(value)) = (metadata.find_column(path), record.get(path)) else {
                    continue;
                };
                builder = builder.set(path.clone(), self.driver.prepare_persistent_value(column, value));
            }
        }
        for change in &subject.change_maps {
            let Some(relation) = metadata.find_relation(&change.relation) else {
                continue;
            };
            let Some(values) = self.resolve_join_values(graph, metadata, relation, &change.value) else {
                return Outcome::Err(Error::config(
                    ConfigErrorKind::CycleDetected,
                    format!("{}.{} has no target key", metadata.name, relation.property_name),
                ));
            };
            for (path, value) in values {
                builder = builder.set(path, value);
            }
        }

        let mut returned = Vec::new();
        match kind {
            SubjectKind::SoftRemove => {
                if let Some(column) = metadata.delete_date_column() {
                    builder = builder.set_raw(column.property_path.clone(), self.driver.current_timestamp());
                    returned.push(column.property_path.as_str());
                }
            }
            SubjectKind::Recover => {
                if let Some(column) = metadata.delete_date_column() {
                    builder = builder.set(column.property_path.clone(), Value::Null);
                }
            }
            _ => {}
        }
        if !builder.has_sets() {
            return Outcome::Ok(());
        }
        if let Some(column) = metadata.update_date_column() {
            builder = builder.set_raw(column.property_path.clone(), self.driver.current_timestamp());
            returned.push(column.property_path.as_str());
        }
        let mut expected_version = None;
        if let Some(column) = metadata.version_column() {
            let current = record
                .and_then(|r| r.get(&column.property_path))
                .or_else(|| subject.database_entity.as_ref()?.get(&column.property_path))
                .filter(|v| !v.is_null())
                .cloned();
            builder = builder.set_raw(
                column.property_path.clone(),
                format!("{} + 1", self.driver.escape(&column.database_name)),
            );
            if let Some(current) = current {
                builder = builder.and_where(Expr::col(column.property_path.clone()).eq(Expr::lit(current.clone())));
                expected_version = Some((column.property_path.clone(), current));
            }
        }
        builder = builder.where_in_ids(std::slice::from_ref(&identifier));
        let returning = self.reload && !matches!(self.driver.capabilities.returning, ReturningStyle::None);
        if returning && !returned.is_empty() {
            builder = builder.returning(&returned);
        }

        let result = try_outcome!(builder.execute(cx, runner).await);
        if let (Some((_, expected)), Some(0)) = (&expected_version, result.affected) {
            return Outcome::Err(
                OptimisticLockError {
                    entity: metadata.name.clone(),
                    expected_version: expected.clone(),
                    message: format!("{} {} was changed by another writer", metadata.name, identifier.key()),
                }
                .into(),
            );
        }
        let generated = if returning {
            self.driver.create_generated_map(metadata, &result)
        } else {
            BTreeMap::new()
        };

        let entity = subject.entity;
        if let Some(record) = entity.and_then(|e| graph.get_mut(e)) {
            if let Some((path, expected)) = expected_version {
                record.set(path, bump_version(&expected));
            }
            if kind == SubjectKind::Recover {
                if let Some(column) = metadata.delete_date_column() {
                    record.set(column.property_path.clone(), Value::Null);
                }
            }
            for (path, value) in &generated {
                record.set(path.clone(), value.clone());
            }
        }
        let subject = &mut self.subjects[index];
        subject.generated_map.extend(generated);
        subject.state = match kind {
            SubjectKind::SoftRemove => SubjectState::SoftRemoved,
            SubjectKind::Recover => SubjectState::Recovered,
            _ => SubjectState::Updated,
        };
        debug!(entity = %metadata.name, id = %identifier.key(), kind = kind.as_str(), "updated");
        Outcome::Ok(())
    }

    async fn remove<C: Connection>(
        &mut self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        graph: &mut EntityGraph,
        index: usize,
    ) -> Outcome<(), Error> {
        let subject = &self.subjects[index];
        let metadata = self.registry.get(subject.metadata);
        let Some(identifier) = subject.identifier.clone() else {
            return Outcome::Ok(());
        };

        for relation in metadata.relations.iter().filter(|r| r.is_many_to_many()) {
            let Some(junction) = &relation.junction else {
                continue;
            };
            if junction.on_delete == ReferentialAction::Cascade {
                continue;
            }
            let cells: Option<Vec<(String, Value)>> = junction
                .owner_columns
                .iter()
                .map(|c| Some((c.database_name.clone(), identifier.get(&c.referenced_column)?.clone())))
                .collect();
            let Some(cells) = cells else {
                continue;
            };
            let table = self.driver.escape_table(
                &junction.table_name,
                metadata.schema.as_deref(),
                metadata.database.as_deref(),
            );
            let (sql, params) = junction_delete_sql(&self.driver, &table, cells);
            try_outcome!(runner.query(cx, &sql, &params).await);
        }

        if subject.database_cascaded && !subject.explicit {
            trace!(entity = %metadata.name, id = %identifier.key(), "removed by the database cascade");
        } else {
            try_outcome!(
                DeleteQueryBuilder::new(&self.driver, metadata)
                    .where_in_ids(std::slice::from_ref(&identifier))
                    .execute(cx, runner)
                    .await
            );
            debug!(entity = %metadata.name, id = %identifier.key(), "removed");
        }

        if let Some(record) = subject.entity.and_then(|e| graph.get_mut(e)) {
            for column in metadata.primary_columns().filter(|c| c.is_database_generated()) {
                record.unset(&column.property_path);
            }
        }
        self.subjects[index].state = SubjectState::Removed;
        Outcome::Ok(())
    }
}

fn listener_kind(kind: SubjectKind, phase: Phase) -> ListenerKind {
    match (kind, phase) {
        (SubjectKind::Insert, Phase::Before) => ListenerKind::BeforeInsert,
        (SubjectKind::Insert, Phase::After) => ListenerKind::AfterInsert,
        (SubjectKind::Update, Phase::Before) => ListenerKind::BeforeUpdate,
        (SubjectKind::Update, Phase::After) => ListenerKind::AfterUpdate,
        (SubjectKind::Remove, Phase::Before) => ListenerKind::BeforeRemove,
        (SubjectKind::Remove, Phase::After) => ListenerKind::AfterRemove,
        (SubjectKind::SoftRemove, Phase::Before) => ListenerKind::BeforeSoftRemove,
        (SubjectKind::SoftRemove, Phase::After) => ListenerKind::AfterSoftRemove,
        (SubjectKind::Recover, Phase::Before) => ListenerKind::BeforeRecover,
        (SubjectKind::Recover, Phase::After) => ListenerKind::AfterRecover,
    }
}

fn bump_version(current: &Value) -> Value {
    match current {
        Value::Int(v) => Value::Int(v.saturating_add(1)),
        other => Value::BigInt(other.as_i64().unwrap_or_default().saturating_add(1)),
    }
}

/// Order-independent identity of a junction row.
fn junction_key(table: &str, cells: &[(String, Value)]) -> String {
    let mut parts: Vec<String> = cells
        .iter()
        .map(|(column, value)| format!("{column}={}", value.identity_fragment()))
        .collect();
    parts.sort();
    format!("{table}|{}", parts.join("&"))
}

fn junction_insert_sql(driver: &Driver, table: &str, cells: Vec<(String, Value)>) -> (String, Vec<Value>) {
    let mut sink = ParameterSink::new();
    let mut columns = Vec::with_capacity(cells.len());
    let mut placeholders = Vec::with_capacity(cells.len());
    for (column, value) in cells {
        columns.push(driver.escape(&column));
        placeholders.push(sink.push(driver, value));
    }
    (
        format!("INSERT INTO {table}({}) VALUES ({})", columns.join(", "), placeholders.join(", ")),
        sink.into_values(),
    )
}

fn junction_delete_sql(driver: &Driver, table: &str, cells: Vec<(String, Value)>) -> (String, Vec<Value>) {
    let mut sink = ParameterSink::new();
    let conditions: Vec<String> = cells
        .into_iter()
        .map(|(column, value)| format!("{} = {}", driver.escape(&column), sink.push(driver, value)))
        .collect();
    (
        format!("DELETE FROM {table} WHERE {}", conditions.join(" AND ")),
        sink.into_values(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use persisto_core::metadata::{Cascade, ColumnOptions, ColumnType, RelationOptions};
    use persisto_core::testing::MockConnection;
    use persisto_core::{EntityRecord, EntityRef, EntitySchema, MetadataArgs, QueryResult, Row, build_metadata};

    use crate::subject_builder::SubjectBuilder;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn save(
        registry: &MetadataRegistry,
        conn: &MockConnection,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
    ) -> Outcome<PersistSummary, Error> {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let runner = QueryRunner::new(conn.clone(), SubscriberSet::new());
        let driver = Driver::postgres();
        rt.block_on(async {
            let subjects = {
                let mut builder = SubjectBuilder::new(registry, &driver, graph);
                try_outcome!(builder.build_for_insert_or_update(&cx, &runner, roots).await);
                builder.into_subjects()
            };
            let mut executor = try_result!(SubjectExecutor::new(registry, &driver, subjects));
            executor.execute(&cx, &runner, graph).await
        })
    }

    fn blog() -> MetadataRegistry {
        build_metadata(
            &MetadataArgs::new()
                .entity(
                    EntitySchema::new("User")
                        .column(ColumnOptions::primary_generated("id"))
                        .column(ColumnOptions::new("name", ColumnType::Text)),
                )
                .entity(
                    EntitySchema::new("Post")
                        .column(ColumnOptions::primary_generated("id"))
                        .column(ColumnOptions::new("title", ColumnType::Text))
                        .column(ColumnOptions::version("version"))
                        .relation(RelationOptions::many_to_one("author", "User").cascade(Cascade::SAVE))
                        .relation(RelationOptions::many_to_many("tags", "Tag")),
                )
                .entity(EntitySchema::new("Tag").column(ColumnOptions::primary_generated("id"))),
        )
        .unwrap()
    }

    #[test]
    fn test_inserts_parent_first_and_writes_keys_back() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        let mut graph = EntityGraph::new();
        let author = graph.insert(EntityRecord::new("User").with("name", "ann"));
        let post = graph.insert(EntityRecord::new("Post").with("title", "hello"));
        graph.link(post, "author", author);

        let summary = unwrap_outcome(save(&registry, &conn, &mut graph, &[post]));
        assert_eq!(summary.inserted, 2);

        let inserts = conn.statements_starting_with("INSERT");
        assert_eq!(inserts.len(), 2);
        assert!(inserts[0].0.starts_with("INSERT INTO \"user\""), "{}", inserts[0].0);
        assert!(inserts[1].0.starts_with("INSERT INTO \"post\""), "{}", inserts[1].0);
        assert!(inserts[1].1.contains(&Value::BigInt(1)));
        assert!(inserts[1].1.contains(&Value::Int(1)));
        assert_eq!(graph[author].get("id"), Some(&Value::BigInt(1)));
        assert_eq!(graph[post].get("id"), Some(&Value::BigInt(2)));
        assert_eq!(graph[post].get("version"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_stale_version_is_an_optimistic_lock_error() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        conn.on(
            "FROM \"post\"",
            QueryResult::with_rows(vec![Row::new(
                vec!["post_id".to_string(), "post_title".to_string(), "post_version".to_string()],
                vec![Value::BigInt(1), Value::Text("old".into()), Value::Int(4)],
            )]),
        );
        conn.on("UPDATE \"post\"", QueryResult::with_affected(0));
        let mut graph = EntityGraph::new();
        let post = graph.insert(
            EntityRecord::new("Post")
                .with("id", 1_i64)
                .with("title", "new")
                .with("version", Value::Int(3)),
        );

        match save(&registry, &conn, &mut graph, &[post]) {
            Outcome::Err(e) => assert!(e.is_version_mismatch(), "{e}"),
            other => std::panic::panic_any(format!("expected optimistic lock error, got {other:?}")),
        }
        let updates = conn.statements_starting_with("UPDATE");
        assert_eq!(updates.len(), 1);
        assert!(updates[0].0.contains("\"version\" = \"version\" + 1"), "{}", updates[0].0);
        assert!(updates[0].1.contains(&Value::Int(3)));
    }

    #[test]
    fn test_version_is_bumped_after_update() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        conn.on(
            "FROM \"post\"",
            QueryResult::with_rows(vec![Row::new(
                vec!["post_id".to_string(), "post_title".to_string(), "post_version".to_string()],
                vec![Value::BigInt(1), Value::Text("old".into()), Value::Int(3)],
            )]),
        );
        let mut graph = EntityGraph::new();
        let post = graph.insert(
            EntityRecord::new("Post")
                .with("id", 1_i64)
                .with("title", "new")
                .with("version", Value::Int(3)),
        );

        let summary = unwrap_outcome(save(&registry, &conn, &mut graph, &[post]));
        assert_eq!(summary.updated, 1);
        assert_eq!(graph[post].get("version"), Some(&Value::Int(4)));
    }

    #[test]
    fn test_junction_rows_written_once_for_new_owner() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        let mut graph = EntityGraph::new();
        let post = graph.insert(EntityRecord::new("Post").with("title", "hello"));
        let tag = graph.insert(EntityRecord::new("Tag").with("id", 7_i64));
        graph.push_related(post, "tags", tag);

        unwrap_outcome(save(&registry, &conn, &mut graph, &[post]));
        let junction = conn.statements_starting_with("INSERT INTO \"post_tags_tag\"");
        assert_eq!(junction.len(), 1);
        assert_eq!(
            junction[0].0,
            "INSERT INTO \"post_tags_tag\"(\"post_id\", \"tag_id\") VALUES ($1, $2)"
        );
        assert_eq!(junction[0].1, vec![Value::BigInt(1), Value::BigInt(7)]);
    }

    #[test]
    fn test_nothing_changed_sends_no_writes() {
        let registry = blog();
        let conn = MockConnection::new(Driver::postgres());
        conn.on(
            "FROM \"user\"",
            QueryResult::with_rows(vec![Row::new(
                vec!["user_id".to_string(), "user_name".to_string()],
                vec![Value::BigInt(1), Value::Text("ann".into())],
            )]),
        );
        let mut graph = EntityGraph::new();
        let user = graph.insert(EntityRecord::new("User").with("id", 1_i64).with("name", "ann"));

        let summary = unwrap_outcome(save(&registry, &conn, &mut graph, &[user]));
        assert!(summary.is_empty());
        assert!(conn.statements_starting_with("UPDATE").is_empty());
        assert!(conn.statements_starting_with("INSERT").is_empty());
    }

    #[test]
    fn test_junction_key_ignores_column_order() {
        let a = vec![
            ("post_id".to_string(), Value::BigInt(1)),
            ("tag_id".to_string(), Value::Int(2)),
        ];
        let b = vec![
            ("tag_id".to_string(), Value::BigInt(2)),
            ("post_id".to_string(), Value::Int(1)),
        ];
        assert_eq!(junction_key("\"t\"", &a), junction_key("\"t\"", &b));
    }
}
