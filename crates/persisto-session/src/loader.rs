//! Loading what the database currently holds for a set of subjects.

use asupersync::{Cx, Outcome};
use persisto_core::{
    Connection, Driver, EntityGraph, EntityIdentifier, Error, MetadataId, MetadataRegistry, QueryRunner,
    try_outcome,
};
use persisto_query::{RelationIdLoader, SelectQueryBuilder};
use tracing::debug;

use crate::subject::{Subject, SubjectKind};

/// Reads the stored rows and relation ids behind subjects.
///
/// Rows are loaded with one query per entity, soft-deleted rows included,
/// and without after-load listeners. Relation ids are loaded with one query
/// per entity and relation.
#[derive(Debug, Clone)]
pub struct DatabaseEntityLoader<'r> {
    registry: &'r MetadataRegistry,
    driver: Driver,
}

impl<'r> DatabaseEntityLoader<'r> {
    pub fn new(registry: &'r MetadataRegistry, driver: &Driver) -> Self {
        Self {
            registry,
            driver: driver.clone(),
        }
    }

    /// Fill `database_entity` of every classified subject with an identifier.
    #[tracing::instrument(level = "debug", skip_all, fields(subjects = subjects.len()))]
    pub async fn load_entities<C: Connection>(
        &self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        subjects: &mut [Subject],
    ) -> Outcome<(), Error> {
        let groups = group_by_metadata(subjects, |s| s.kind.is_some() && s.identifier.is_some());
        for (metadata_id, indices) in groups {
            let metadata = self.registry.get(metadata_id);
            let ids: Vec<EntityIdentifier> = indices
                .iter()
                .filter_map(|&i| subjects[i].identifier.clone())
                .collect();
            let loaded = try_outcome!(
                SelectQueryBuilder::for_metadata(self.registry, &self.driver, metadata, &metadata.table_name)
                    .with_deleted()
                    .call_listeners(false)
                    .where_in_ids(&ids)
                    .get_many(cx, runner)
                    .await
            );

            let mut found = 0;
            for record in loaded.records() {
                let Some(stored_id) = metadata.identifier_from_values(record) else {
                    continue;
                };
                for &index in &indices {
                    let subject = &mut subjects[index];
                    if subject.database_entity.is_none()
                        && subject.identifier.as_ref().is_some_and(|id| id.matches(&stored_id))
                    {
                        subject.database_entity = Some(record.clone());
                        found += 1;
                    }
                }
            }
            debug!(entity = %metadata.name, requested = ids.len(), found, "loaded database entities");
        }
        Outcome::Ok(())
    }

    /// Fill `database_relation_ids` of updated subjects for every to-many and
    /// inverse one-to-one relation present on their records.
    #[tracing::instrument(level = "debug", skip_all, fields(subjects = subjects.len()))]
    pub async fn load_relation_ids<C: Connection>(
        &self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        graph: &EntityGraph,
        subjects: &mut [Subject],
    ) -> Outcome<(), Error> {
        let relation_ids = RelationIdLoader::new(self.registry, &self.driver);
        let groups = group_by_metadata(subjects, |s| {
            s.is(SubjectKind::Update) && s.identifier.is_some() && s.entity.is_some()
        });
        for (metadata_id, indices) in groups {
            let metadata = self.registry.get(metadata_id);
            for relation in metadata.relations.iter().filter(|r| {
                r.persistence
                    && !r.is_join_column_owner()
                    && (r.is_many_to_many() || self.registry.inverse_of(r).is_some_and(|inverse| inverse.is_owning()))
            }) {
                let owners: Vec<usize> = indices
                    .iter()
                    .copied()
                    .filter(|&i| {
                        subjects[i]
                            .entity
                            .and_then(|e| graph.get(e))
                            .is_some_and(|record| record.relation(&relation.property_name).is_some())
                    })
                    .collect();
                let ids: Vec<EntityIdentifier> = owners
                    .iter()
                    .filter_map(|&i| subjects[i].identifier.clone())
                    .collect();
                if ids.is_empty() {
                    continue;
                }
                let pairs = try_outcome!(relation_ids.load(cx, runner, metadata, relation, &ids).await);
                for &index in &owners {
                    let subject = &mut subjects[index];
                    let Some(owner) = subject.identifier.as_ref() else {
                        continue;
                    };
                    let related = pairs
                        .iter()
                        .filter(|pair| pair.owner.matches(owner))
                        .map(|pair| pair.related.clone())
                        .collect();
                    subject
                        .database_relation_ids
                        .insert(relation.property_name.clone(), related);
                }
            }
        }
        Outcome::Ok(())
    }
}

fn group_by_metadata(subjects: &[Subject], filter: impl Fn(&Subject) -> bool) -> Vec<(MetadataId, Vec<usize>)> {
    let mut groups: Vec<(MetadataId, Vec<usize>)> = Vec::new();
    for (index, subject) in subjects.iter().enumerate().filter(|(_, s)| filter(s)) {
        match groups.iter_mut().find(|(metadata, _)| *metadata == subject.metadata) {
            Some((_, indices)) => indices.push(index),
            None => groups.push((subject.metadata, vec![index])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use persisto_core::metadata::{ColumnOptions, ColumnType, RelationOptions};
    use persisto_core::testing::MockConnection;
    use persisto_core::{
        EntityRecord, EntityRef, EntitySchema, MetadataArgs, QueryResult, RelationValue, Row, SubscriberSet, Value,
        build_metadata,
    };

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn registry() -> MetadataRegistry {
        build_metadata(
            &MetadataArgs::new()
                .entity(
                    EntitySchema::new("Post")
                        .column(ColumnOptions::primary_generated("id"))
                        .column(ColumnOptions::new("title", ColumnType::Text))
                        .relation(RelationOptions::many_to_many("tags", "Tag")),
                )
                .entity(EntitySchema::new("Tag").column(ColumnOptions::primary_generated("id"))),
        )
        .unwrap()
    }

    fn post_subject(registry: &MetadataRegistry, slot: usize, id: i64) -> Subject {
        Subject::new(
            registry.find("Post").unwrap().id,
            Some(EntityRef(slot)),
            Some(EntityIdentifier::single("id", id)),
        )
        .with_kind(SubjectKind::Update)
    }

    #[test]
    fn test_loads_rows_in_one_query_per_entity() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let registry = registry();
        let conn = MockConnection::new(Driver::postgres());
        let names = vec!["post_id".to_string(), "post_title".to_string()];
        conn.on(
            "FROM \"post\"",
            QueryResult::with_rows(vec![Row::new(names, vec![Value::BigInt(2), Value::Text("stored".into())])]),
        );
        let runner = QueryRunner::new(conn.clone(), SubscriberSet::new());
        let mut subjects = vec![post_subject(&registry, 0, 1), post_subject(&registry, 1, 2)];

        let loader = DatabaseEntityLoader::new(&registry, &Driver::postgres());
        rt.block_on(async { unwrap_outcome(loader.load_entities(&cx, &runner, &mut subjects).await) });

        assert_eq!(conn.executed_sql().len(), 1);
        assert!(conn.executed_sql()[0].contains("WHERE \"post\".\"id\" IN ($1, $2)"), "{}", conn.executed_sql()[0]);
        assert!(subjects[0].database_entity.is_none());
        let stored = subjects[1].database_entity.as_ref().unwrap();
        assert_eq!(stored.get("title"), Some(&Value::Text("stored".into())));
    }

    #[test]
    fn test_loads_relation_ids_for_present_relations_only() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let registry = registry();
        let conn = MockConnection::new(Driver::postgres());
        let names = vec!["post_id".to_string(), "tag_id".to_string()];
        conn.on(
            "FROM \"post_tags_tag\"",
            QueryResult::with_rows(vec![Row::new(names, vec![Value::BigInt(1), Value::BigInt(9)])]),
        );
        let runner = QueryRunner::new(conn.clone(), SubscriberSet::new());

        let mut graph = EntityGraph::new();
        let with_tags = graph.insert(EntityRecord::new("Post").with("id", 1_i64));
        graph[with_tags].set_relation("tags", RelationValue::Many(Vec::new()));
        let without_tags = graph.insert(EntityRecord::new("Post").with("id", 2_i64));
        let mut subjects = vec![
            post_subject(&registry, with_tags.0, 1),
            post_subject(&registry, without_tags.0, 2),
        ];

        let loader = DatabaseEntityLoader::new(&registry, &Driver::postgres());
        rt.block_on(async {
            unwrap_outcome(loader.load_relation_ids(&cx, &runner, &graph, &mut subjects).await);
        });

        assert_eq!(
            conn.executed_sql(),
            vec!["SELECT \"post_id\", \"tag_id\" FROM \"post_tags_tag\" WHERE \"post_id\" IN ($1)".to_string()]
        );
        let tags = &subjects[0].database_relation_ids["tags"];
        assert!(tags[0].matches(&EntityIdentifier::single("id", 9_i64)));
        assert!(!subjects[1].database_relation_ids.contains_key("tags"));
    }
}
