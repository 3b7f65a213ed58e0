//! Statement ordering.
//!
//! Tables are sorted so that a row is written after every row its foreign
//! keys point at. Edges come from join-column relations between the tables
//! of the operation. An edge whose foreign key is nullable or deferrable is
//! advisory: when the tables form a cycle one such edge on the cycle is
//! dropped, and the executor inserts the row with a NULL key and patches it
//! once the referenced row exists. A cycle made only of required keys cannot
//! be written and is reported as [`ConfigErrorKind::CycleDetected`].
//!
//! Rows of one table that reference each other (trees, self-references) are
//! ordered inside their group.

use std::collections::HashSet;

use persisto_core::{ConfigErrorKind, Error, MetadataId, MetadataRegistry, Result};
use tracing::{debug, trace};

use crate::subject::{ChangeValue, Subject, SubjectKind};

/// Same-kind statements for one entity, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationGroup {
    pub metadata: MetadataId,
    pub kind: SubjectKind,
    /// Indices into the subject list
    pub subjects: Vec<usize>,
}

/// The ordered statement groups of one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub inserts: Vec<OperationGroup>,
    /// Updates, soft removals, recoveries and foreign-key-only updates
    pub updates: Vec<OperationGroup>,
    pub removes: Vec<OperationGroup>,
    /// Tables in dependency order, referenced tables first
    pub table_order: Vec<String>,
}

#[derive(Debug, Clone)]
struct Edge {
    /// Table that must be written first
    dependency: String,
    dependent: String,
    advisory: bool,
}

impl ExecutionPlan {
    /// Order `subjects` into statement groups.
    #[tracing::instrument(level = "debug", skip_all, fields(subjects = subjects.len()))]
    pub fn build(registry: &MetadataRegistry, subjects: &[Subject]) -> Result<Self> {
        let table_order = table_order(registry, subjects)?;
        let mut plan = ExecutionPlan {
            table_order,
            ..ExecutionPlan::default()
        };

        for table in &plan.table_order {
            let metadatas = metadatas_of_table(registry, subjects, table);
            for metadata in &metadatas {
                let inserts = indices(subjects, *metadata, |s| s.is(SubjectKind::Insert));
                if !inserts.is_empty() {
                    let ordered = order_rows(&inserts, |i| insert_dependencies(&subjects[i]));
                    plan.inserts.push(OperationGroup {
                        metadata: *metadata,
                        kind: SubjectKind::Insert,
                        subjects: ordered,
                    });
                }
                for kind in [SubjectKind::Update, SubjectKind::SoftRemove, SubjectKind::Recover] {
                    let updates = indices(subjects, *metadata, |s| {
                        (s.kind == Some(kind) || (kind == SubjectKind::Update && s.kind.is_none()))
                            && s.must_be_updated()
                    });
                    if !updates.is_empty() {
                        plan.updates.push(OperationGroup {
                            metadata: *metadata,
                            kind,
                            subjects: updates,
                        });
                    }
                }
            }
        }

        for table in plan.table_order.iter().rev() {
            for metadata in metadatas_of_table(registry, subjects, table) {
                let removes = indices(subjects, metadata, |s| s.is(SubjectKind::Remove));
                if removes.is_empty() {
                    continue;
                }
                let mut ordered = order_rows(&removes, |i| subjects[i].references.clone());
                ordered.reverse();
                plan.removes.push(OperationGroup {
                    metadata,
                    kind: SubjectKind::Remove,
                    subjects: ordered,
                });
            }
        }

        debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            removes = plan.removes.len(),
            "execution plan built"
        );
        Ok(plan)
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.removes.is_empty()
    }
}

fn indices(subjects: &[Subject], metadata: MetadataId, filter: impl Fn(&Subject) -> bool) -> Vec<usize> {
    subjects
        .iter()
        .enumerate()
        .filter(|(_, s)| s.metadata == metadata && filter(s))
        .map(|(i, _)| i)
        .collect()
}

fn metadatas_of_table(registry: &MetadataRegistry, subjects: &[Subject], table: &str) -> Vec<MetadataId> {
    let mut found = Vec::new();
    for subject in subjects {
        if registry.get(subject.metadata).table_name == table && !found.contains(&subject.metadata) {
            found.push(subject.metadata);
        }
    }
    found
}

fn insert_dependencies(subject: &Subject) -> Vec<usize> {
    subject
        .change_maps
        .iter()
        .filter_map(|m| match m.value {
            ChangeValue::Subject(index) => Some(index),
            _ => None,
        })
        .collect()
}

/// Depth-first order of `group` so that dependencies inside the group come
/// first. Cycles keep their input order; the executor patches them.
fn order_rows(group: &[usize], dependencies: impl Fn(usize) -> Vec<usize>) -> Vec<usize> {
    fn visit(
        index: usize,
        group: &[usize],
        dependencies: &dyn Fn(usize) -> Vec<usize>,
        visiting: &mut HashSet<usize>,
        done: &mut HashSet<usize>,
        ordered: &mut Vec<usize>,
    ) {
        if done.contains(&index) || !visiting.insert(index) {
            return;
        }
        for dependency in dependencies(index) {
            if dependency != index && group.contains(&dependency) {
                visit(dependency, group, dependencies, visiting, done, ordered);
            }
        }
        visiting.remove(&index);
        done.insert(index);
        ordered.push(index);
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    let mut ordered = Vec::with_capacity(group.len());
    for &index in group {
        visit(index, group, &dependencies, &mut visiting, &mut done, &mut ordered);
    }
    ordered
}

fn table_order(registry: &MetadataRegistry, subjects: &[Subject]) -> Result<Vec<String>> {
    let mut tables: Vec<String> = Vec::new();
    for subject in subjects {
        let table = &registry.get(subject.metadata).table_name;
        if !tables.contains(table) {
            tables.push(table.clone());
        }
    }

    let mut edges: Vec<Edge> = Vec::new();
    for metadata in registry.iter().filter(|m| tables.contains(&m.table_name)) {
        for relation in metadata.relations.iter().filter(|r| r.is_join_column_owner()) {
            let target = &registry.target_of(relation).table_name;
            if *target == metadata.table_name || !tables.contains(target) {
                continue;
            }
            let advisory = relation.nullable || relation.deferrable.is_some();
            match edges
                .iter_mut()
                .find(|e| e.dependency == *target && e.dependent == metadata.table_name)
            {
                Some(edge) => edge.advisory &= advisory,
                None => edges.push(Edge {
                    dependency: target.clone(),
                    dependent: metadata.table_name.clone(),
                    advisory,
                }),
            }
        }
    }

    let mut remaining = tables;
    let mut order = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining.iter().position(|table| {
            !edges
                .iter()
                .any(|e| e.dependent == *table && remaining.contains(&e.dependency))
        });
        if let Some(position) = ready {
            order.push(remaining.remove(position));
            continue;
        }

        let breakable = edges.iter().position(|e| {
            e.advisory
                && remaining.contains(&e.dependency)
                && remaining.contains(&e.dependent)
                && reaches(&edges, &remaining, &e.dependent, &e.dependency)
        });
        match breakable {
            Some(position) => {
                let edge = edges.remove(position);
                trace!(
                    dependency = %edge.dependency,
                    dependent = %edge.dependent,
                    "dropped nullable foreign key edge to break a cycle"
                );
            }
            None => {
                return Err(Error::config(
                    ConfigErrorKind::CycleDetected,
                    format!(
                        "tables {} reference each other through required foreign keys",
                        remaining.join(", ")
                    ),
                ));
            }
        }
    }
    Ok(order)
}

/// Whether `from` reaches `to` following dependency-to-dependent edges.
fn reaches(edges: &[Edge], remaining: &[String], from: &str, to: &str) -> bool {
    let mut stack = vec![from.to_string()];
    let mut seen = HashSet::new();
    while let Some(table) = stack.pop() {
        if table == to {
            return true;
        }
        if !seen.insert(table.clone()) {
            continue;
        }
        for edge in edges.iter().filter(|e| e.dependency == table && remaining.contains(&e.dependent)) {
            stack.push(edge.dependent.clone());
        }
    }
    false
}
