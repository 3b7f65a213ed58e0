//! Loading related identifiers without hydrating the related entities.
//!
//! The change-set builder compares a graph's relations against what the
//! database holds. For that it only needs, per owner, the identifiers of the
//! rows on the other side: from the junction table for many-to-many, from the
//! target's join columns for one-to-many and inverse one-to-one, and from the
//! owner's own join columns otherwise.

use asupersync::{Cx, Outcome};
use persisto_core::metadata::{ColumnMetadata, RelationMetadata};
use persisto_core::{
    BuilderErrorKind, Connection, Driver, EntityIdentifier, EntityMetadata, Error, MetadataRegistry,
    QueryRunner, Result, Row, Value, try_outcome, try_result,
};
use tracing::debug;

use crate::builder::ids_expr;
use crate::expr::{Expr, PlainResolver, RenderContext};
use crate::join::inverse_owner;
use crate::params::{ParameterSink, Parameters};

/// One owner/related identifier pair of a relation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationIdPair {
    pub owner: EntityIdentifier,
    pub related: EntityIdentifier,
}

/// How a result column maps back onto an identifier property.
#[derive(Debug, Clone)]
struct IdColumn<'m> {
    database_name: String,
    /// Column of the entity the identifier belongs to
    column: &'m ColumnMetadata,
}

/// A rendered relation-id query and how to read its rows.
#[derive(Debug)]
struct RelationIdQuery<'m> {
    sql: String,
    params: Vec<Value>,
    owner: Vec<IdColumn<'m>>,
    related: Vec<IdColumn<'m>>,
}

#[derive(Debug, Clone)]
pub struct RelationIdLoader<'r> {
    registry: &'r MetadataRegistry,
    driver: Driver,
}

impl<'r> RelationIdLoader<'r> {
    pub fn new(registry: &'r MetadataRegistry, driver: &Driver) -> Self {
        Self {
            registry,
            driver: driver.clone(),
        }
    }

    /// Related identifiers of `relation` for every owner in `owners`.
    #[tracing::instrument(level = "debug", skip(self, cx, runner, metadata, owners), fields(entity = %metadata.name, relation = %relation.property_name))]
    pub async fn load<C: Connection>(
        &self,
        cx: &Cx,
        runner: &QueryRunner<C>,
        metadata: &EntityMetadata,
        relation: &RelationMetadata,
        owners: &[EntityIdentifier],
    ) -> Outcome<Vec<RelationIdPair>, Error> {
        if owners.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        let query = try_result!(self.query(metadata, relation, owners));
        let result = try_outcome!(runner.query(cx, &query.sql, &query.params).await);
        let pairs: Vec<RelationIdPair> = result
            .rows
            .iter()
            .filter_map(|row| {
                Some(RelationIdPair {
                    owner: self.read_identifier(row, &query.owner)?,
                    related: self.read_identifier(row, &query.related)?,
                })
            })
            .collect();
        debug!(owners = owners.len(), pairs = pairs.len(), "loaded relation ids");
        Outcome::Ok(pairs)
    }

    fn read_identifier(&self, row: &Row, columns: &[IdColumn<'_>]) -> Option<EntityIdentifier> {
        let mut values = Vec::with_capacity(columns.len());
        for id in columns {
            let value = row.get_by_name(&id.database_name)?;
            if value.is_null() {
                return None;
            }
            values.push((
                id.column.property_path.clone(),
                self.driver.prepare_hydrated_value(id.column, value),
            ));
        }
        Some(EntityIdentifier::new(values))
    }

    fn query<'m>(
        &self,
        metadata: &'m EntityMetadata,
        relation: &'m RelationMetadata,
        owners: &[EntityIdentifier],
    ) -> Result<RelationIdQuery<'m>>
    where
        'r: 'm,
    {
        let target: &'m EntityMetadata = self.registry.target_of(relation);

        let (table, owner, related) = if relation.is_many_to_many() {
            let junction = relation.junction.as_ref().ok_or_else(|| {
                Error::builder(
                    BuilderErrorKind::UnknownRelation,
                    format!("{}.{} has no junction table", metadata.name, relation.property_name),
                )
            })?;
            let owner = junction
                .owner_columns
                .iter()
                .map(|c| id_column(metadata, &c.database_name, &c.referenced_column))
                .collect::<Result<Vec<_>>>()?;
            let related = junction
                .inverse_columns
                .iter()
                .map(|c| id_column(target, &c.database_name, &c.referenced_column))
                .collect::<Result<Vec<_>>>()?;
            let table = self
                .driver
                .escape_table(&junction.table_name, metadata.schema.as_deref(), metadata.database.as_deref());
            (table, owner, related)
        } else if relation.is_join_column_owner() {
            let owner = metadata
                .primary_columns()
                .map(|c| IdColumn {
                    database_name: c.database_name.clone(),
                    column: c,
                })
                .collect();
            let related = metadata
                .join_columns_of(relation)
                .map(|jc| id_column(target, &jc.database_name, referenced_path(jc)?))
                .collect::<Result<Vec<_>>>()?;
            (self.driver.escape_table_path(metadata), owner, related)
        } else {
            let inverse = inverse_owner(self.registry, metadata, relation)?;
            let owner = target
                .join_columns_of(inverse)
                .map(|jc| id_column(metadata, &jc.database_name, referenced_path(jc)?))
                .collect::<Result<Vec<_>>>()?;
            let related = target
                .primary_columns()
                .map(|c| IdColumn {
                    database_name: c.database_name.clone(),
                    column: c,
                })
                .collect();
            (self.driver.escape_table_path(target), owner, related)
        };

        let mut selected: Vec<String> = Vec::new();
        for id in owner.iter().chain(&related) {
            let escaped = self.driver.escape(&id.database_name);
            if !selected.contains(&escaped) {
                selected.push(escaped);
            }
        }

        let filter = ids_expr(
            owner.iter().map(|id| Expr::col(id.database_name.clone())).collect(),
            owners
                .iter()
                .map(|owner_id| {
                    owner
                        .iter()
                        .map(|id| {
                            let value = owner_id.get(&id.column.property_path).cloned().unwrap_or(Value::Null);
                            self.driver.prepare_persistent_value(id.column, &value)
                        })
                        .collect()
                })
                .collect(),
            self.driver.capabilities.supports_row_value_in,
        );
        let parameters = Parameters::new();
        let resolver = PlainResolver { driver: &self.driver };
        let mut sink = ParameterSink::new();
        let condition = {
            let mut ctx = RenderContext {
                driver: &self.driver,
                parameters: &parameters,
                resolver: &resolver,
                sink: &mut sink,
            };
            filter.build(&mut ctx)?
        };
        Ok(RelationIdQuery {
            sql: format!("SELECT {} FROM {table} WHERE {condition}", selected.join(", ")),
            params: sink.into_values(),
            owner,
            related,
        })
    }
}

fn referenced_path(join_column: &ColumnMetadata) -> Result<&str> {
    join_column.referenced_column.as_deref().ok_or_else(|| {
        Error::builder(
            BuilderErrorKind::UnknownProperty,
            format!("join column \"{}\" references nothing", join_column.database_name),
        )
    })
}

fn id_column<'m>(metadata: &'m EntityMetadata, database_name: &str, property_path: &str) -> Result<IdColumn<'m>> {
    let column = metadata.find_column(property_path).ok_or_else(|| {
        Error::builder(
            BuilderErrorKind::UnknownProperty,
            format!("{} has no column \"{property_path}\"", metadata.name),
        )
    })?;
    Ok(IdColumn {
        database_name: database_name.to_string(),
        column,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use persisto_core::metadata::{ColumnOptions, ColumnType, RelationOptions};
    use persisto_core::testing::MockConnection;
    use persisto_core::{EntitySchema, MetadataArgs, QueryResult, SubscriberSet, build_metadata};

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
                    EntitySchema::new("User")
                        .column(ColumnOptions::primary_generated("id"))
                        .relation(RelationOptions::one_to_many("posts", "Post", "author")),
                )
                .entity(
                    EntitySchema::new("Post")
                        .column(ColumnOptions::primary_generated("id"))
                        .column(ColumnOptions::new("title", ColumnType::Text))
                        .relation(RelationOptions::many_to_one("author", "User").inverse_side("posts"))
                        .relation(RelationOptions::many_to_many("tags", "Tag")),
                )
                .entity(EntitySchema::new("Tag").column(ColumnOptions::primary_generated("id"))),
        )
        .unwrap()
    }

    fn load(
        registry: &MetadataRegistry,
        conn: MockConnection,
        entity: &str,
        relation: &str,
        owners: &[EntityIdentifier],
    ) -> Vec<RelationIdPair> {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let runner = QueryRunner::new(conn, SubscriberSet::new());
        let metadata = registry.by_name(entity).unwrap();
        let relation = metadata.find_relation(relation).unwrap();
        let loader = RelationIdLoader::new(registry, &Driver::postgres());
        rt.block_on(async { unwrap_outcome(loader.load(&cx, &runner, metadata, relation, owners).await) })
    }

    #[test]
    fn test_many_to_many_reads_junction() {
        let registry = registry();
        let conn = MockConnection::new(Driver::postgres());
        let names = vec!["post_id".to_string(), "tag_id".to_string()];
        conn.on(
            "FROM \"post_tags_tag\"",
            QueryResult::with_rows(vec![
                Row::new(names.clone(), vec![Value::BigInt(1), Value::BigInt(7)]),
                Row::new(names, vec![Value::BigInt(1), Value::BigInt(8)]),
            ]),
        );
        let pairs = load(&registry, conn.clone(), "Post", "tags", &[EntityIdentifier::single("id", 1_i64)]);
        assert_eq!(
            conn.executed_sql(),
            vec!["SELECT \"post_id\", \"tag_id\" FROM \"post_tags_tag\" WHERE \"post_id\" IN ($1)".to_string()]
        );
        assert_eq!(pairs.len(), 2);
        assert!(pairs[1].owner.matches(&EntityIdentifier::single("id", 1_i64)));
        assert!(pairs[1].related.matches(&EntityIdentifier::single("id", 8_i64)));
    }

    #[test]
    fn test_one_to_many_reads_target_join_columns() {
        let registry = registry();
        let conn = MockConnection::new(Driver::postgres());
        let names = vec!["author_id".to_string(), "id".to_string()];
        conn.on(
            "FROM \"post\"",
            QueryResult::with_rows(vec![
                Row::new(names.clone(), vec![Value::BigInt(2), Value::BigInt(20)]),
                Row::new(names, vec![Value::BigInt(3), Value::BigInt(30)]),
            ]),
        );
        let owners = [EntityIdentifier::single("id", 2_i64), EntityIdentifier::single("id", 3_i64)];
        let pairs = load(&registry, conn.clone(), "User", "posts", &owners);
        assert_eq!(
            conn.executed_sql()[0],
            "SELECT \"author_id\", \"id\" FROM \"post\" WHERE \"author_id\" IN ($1, $2)"
        );
        assert!(pairs[0].owner.matches(&owners[0]));
        assert!(pairs[1].related.matches(&EntityIdentifier::single("id", 30_i64)));
    }

    #[test]
    fn test_many_to_one_skips_null_foreign_keys() {
        let registry = registry();
        let conn = MockConnection::new(Driver::postgres());
        let names = vec!["id".to_string(), "author_id".to_string()];
        conn.on(
            "FROM \"post\"",
            QueryResult::with_rows(vec![
                Row::new(names.clone(), vec![Value::BigInt(5), Value::BigInt(2)]),
                Row::new(names, vec![Value::BigInt(6), Value::Null]),
            ]),
        );
        let owners = [EntityIdentifier::single("id", 5_i64), EntityIdentifier::single("id", 6_i64)];
        let pairs = load(&registry, conn, "Post", "author", &owners);
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].related.matches(&EntityIdentifier::single("id", 2_i64)));
    }

    #[test]
    fn test_no_owners_issues_no_query() {
        let registry = registry();
        let conn = MockConnection::new(Driver::postgres());
        let pairs = load(&registry, conn.clone(), "Post", "tags", &[]);
        assert!(pairs.is_empty());
        assert!(conn.executed_sql().is_empty());
    }
}
