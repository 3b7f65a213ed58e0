//! Typed repositories over the entity manager.
//!
//! A Rust type becomes persistable by implementing [`Entity`]: it names its
//! metadata and converts itself to and from an [`EntityGraph`]. A
//! [`Repository`] then offers save/remove/find operations on plain values
//! of that type. Repositories are registered per type in a
//! [`RepositoryRegistry`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use asupersync::{Cx, Outcome};
use persisto_core::{
    BuilderErrorKind, ConnectionProvider, EntityGraph, EntityIdentifier, EntityMetadata, EntityRef, Error,
    ReplicationMode, Result, Value, try_outcome, try_result,
};
use persisto_query::{Expr, LoadedEntities, SelectQueryBuilder, UpdateQueryBuilder};
use tracing::debug;

use crate::executor::PersistSummary;
use crate::manager::{EntityManager, RemoveOptions, SaveOptions};
use crate::relation_loader::RelationLoader;

/// A Rust type mapped to registered entity metadata.
pub trait Entity: Sized + Send + Sync + 'static {
    /// Name of the entity in the metadata registry.
    const ENTITY: &'static str;

    /// Write `self` (and any related values it carries) into `graph`,
    /// returning the slot of `self`.
    fn to_graph(&self, graph: &mut EntityGraph) -> EntityRef;

    /// Read a value back from the slot `entity` of `graph`.
    fn from_graph(graph: &EntityGraph, entity: EntityRef) -> Result<Self>;
}

/// Persistence and lookup for one entity type.
pub struct Repository<E: Entity, P: ConnectionProvider> {
    manager: EntityManager<P>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity, P: ConnectionProvider> Clone for Repository<E, P> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity, P: ConnectionProvider> fmt::Debug for Repository<E, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository").field("entity", &E::ENTITY).finish()
    }
}

impl<E: Entity, P: ConnectionProvider> Repository<E, P> {
    pub fn new(manager: EntityManager<P>) -> Self {
        Self {
            manager,
            _entity: PhantomData,
        }
    }

    pub fn manager(&self) -> &EntityManager<P> {
        &self.manager
    }

    pub fn metadata(&self) -> Result<&EntityMetadata> {
        self.manager.registry().by_name(E::ENTITY)
    }

    /// Select builder with the entity's table name as main alias.
    pub fn query_builder(&self) -> Result<SelectQueryBuilder<'_>> {
        let metadata = self.metadata()?;
        Ok(SelectQueryBuilder::for_metadata(
            self.manager.registry(),
            self.manager.driver(),
            metadata,
            &metadata.table_name,
        ))
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Save `entity`; generated values are read back into it.
    pub async fn save(&self, cx: &Cx, entity: &mut E, options: SaveOptions) -> Outcome<PersistSummary, Error> {
        let mut graph = EntityGraph::new();
        let root = entity.to_graph(&mut graph);
        let summary = try_outcome!(self.manager.save(cx, &mut graph, &[root], options).await);
        *entity = try_result!(E::from_graph(&graph, root));
        Outcome::Ok(summary)
    }

    pub async fn remove(&self, cx: &Cx, entity: &mut E, options: RemoveOptions) -> Outcome<PersistSummary, Error> {
        let mut graph = EntityGraph::new();
        let root = entity.to_graph(&mut graph);
        let summary = try_outcome!(self.manager.remove(cx, &mut graph, &[root], options).await);
        *entity = try_result!(E::from_graph(&graph, root));
        Outcome::Ok(summary)
    }

    pub async fn soft_remove(&self, cx: &Cx, entity: &mut E, options: RemoveOptions) -> Outcome<PersistSummary, Error> {
        let mut graph = EntityGraph::new();
        let root = entity.to_graph(&mut graph);
        let summary = try_outcome!(self.manager.soft_remove(cx, &mut graph, &[root], options).await);
        *entity = try_result!(E::from_graph(&graph, root));
        Outcome::Ok(summary)
    }

    pub async fn recover(&self, cx: &Cx, entity: &mut E, options: RemoveOptions) -> Outcome<PersistSummary, Error> {
        let mut graph = EntityGraph::new();
        let root = entity.to_graph(&mut graph);
        let summary = try_outcome!(self.manager.recover(cx, &mut graph, &[root], options).await);
        *entity = try_result!(E::from_graph(&graph, root));
        Outcome::Ok(summary)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Entities matching the query `build` shapes; eager relations are
    /// joined first.
    pub async fn find<F>(&self, cx: &Cx, build: F) -> Outcome<Vec<E>, Error>
    where
        F: FnOnce(SelectQueryBuilder<'_>) -> SelectQueryBuilder<'_>,
    {
        let query = build(try_result!(self.query_builder()).join_eager_relations());
        let loaded = try_outcome!(self.load(cx, &query).await);
        Outcome::Ok(try_result!(into_entities(&loaded)))
    }

    pub async fn find_by_ids(&self, cx: &Cx, ids: &[EntityIdentifier]) -> Outcome<Vec<E>, Error> {
        self.find(cx, |query| query.where_in_ids(ids)).await
    }

    /// First entity whose properties equal `conditions`.
    pub async fn find_one_by(&self, cx: &Cx, conditions: &[(&str, Value)]) -> Outcome<Option<E>, Error> {
        let query = conditions.iter().fold(
            try_result!(self.query_builder()).join_eager_relations().take(1),
            |query, (property, value)| query.and_where(Expr::col(*property).eq(Expr::lit(value.clone()))),
        );
        let loaded = try_outcome!(self.load(cx, &query).await);
        let Some(root) = loaded.first() else {
            return Outcome::Ok(None);
        };
        Outcome::Ok(Some(try_result!(E::from_graph(&loaded.graph, root))))
    }

    pub async fn count<F>(&self, cx: &Cx, build: F) -> Outcome<u64, Error>
    where
        F: FnOnce(SelectQueryBuilder<'_>) -> SelectQueryBuilder<'_>,
    {
        let query = build(try_result!(self.query_builder()));
        self.manager
            .run(cx, ReplicationMode::Slave, async |runner| query.get_count(cx, runner).await)
            .await
    }

    pub async fn exists<F>(&self, cx: &Cx, build: F) -> Outcome<bool, Error>
    where
        F: FnOnce(SelectQueryBuilder<'_>) -> SelectQueryBuilder<'_>,
    {
        let query = build(try_result!(self.query_builder()));
        self.manager
            .run(cx, ReplicationMode::Slave, async |runner| query.get_exists(cx, runner).await)
            .await
    }

    async fn load(&self, cx: &Cx, query: &SelectQueryBuilder<'_>) -> Outcome<LoadedEntities, Error> {
        self.manager
            .run(cx, ReplicationMode::Slave, async |runner| query.get_many(cx, runner).await)
            .await
    }

    // ========================================================================
    // Bulk updates
    // ========================================================================

    /// Add `by` to a numeric property of every row matching `conditions`,
    /// returning the affected row count.
    pub async fn increment(
        &self,
        cx: &Cx,
        conditions: &[(&str, Value)],
        property: &str,
        by: i64,
    ) -> Outcome<u64, Error> {
        let metadata = try_result!(self.metadata());
        let Some(column) = metadata.find_column(property) else {
            return Outcome::Err(Error::builder(
                BuilderErrorKind::UnknownProperty,
                format!("{} has no column \"{property}\"", metadata.name),
            ));
        };
        let driver = self.manager.driver();
        let escaped = driver.escape(&column.database_name);
        let operation = if by < 0 {
            format!("{escaped} - {}", by.unsigned_abs())
        } else {
            format!("{escaped} + {by}")
        };
        let update = conditions.iter().fold(
            UpdateQueryBuilder::new(driver, metadata).set_raw(property, operation),
            |update, (name, value)| update.and_where(Expr::col(*name).eq(Expr::lit(value.clone()))),
        );
        let result = try_outcome!(
            self.manager
                .run(cx, ReplicationMode::Master, async |runner| update.execute(cx, runner).await)
                .await
        );
        let affected = result.affected.unwrap_or(0);
        debug!(entity = %metadata.name, property, by, affected, "Incremented column");
        Outcome::Ok(affected)
    }

    /// Detach every row from `relation` of the entity identified by `owner`.
    ///
    /// Many-to-many relations lose their junction rows; one-to-many
    /// relations get the children's foreign keys set to NULL.
    pub async fn clear_relation(&self, cx: &Cx, owner: &EntityIdentifier, relation: &str) -> Outcome<u64, Error> {
        let metadata = try_result!(self.metadata());
        let registry = self.manager.registry();
        let driver = self.manager.driver();
        let Some(relation_meta) = metadata.find_relation(relation) else {
            return Outcome::Err(Error::builder(
                BuilderErrorKind::UnknownRelation,
                format!("{} has no relation \"{relation}\"", metadata.name),
            ));
        };

        if let Some(junction) = &relation_meta.junction {
            let table = driver.escape_table(
                &junction.table_name,
                metadata.schema.as_deref(),
                metadata.database.as_deref(),
            );
            let mut params = Vec::with_capacity(junction.owner_columns.len());
            let mut conditions = Vec::with_capacity(junction.owner_columns.len());
            for column in &junction.owner_columns {
                let Some(value) = owner.get(&column.referenced_column) else {
                    return Outcome::Err(missing_key(&metadata.name, &column.referenced_column));
                };
                params.push(value.clone());
                conditions.push(format!("{} = {}", driver.escape(&column.database_name), driver.placeholder(params.len())));
            }
            let sql = format!("DELETE FROM {table} WHERE {}", conditions.join(" AND "));
            let result = try_outcome!(
                self.manager
                    .run(cx, ReplicationMode::Master, async |runner| runner.query(cx, &sql, &params).await)
                    .await
            );
            return Outcome::Ok(result.affected.unwrap_or(0));
        }

        let Some(inverse) = registry.inverse_of(relation_meta).filter(|r| r.is_join_column_owner()) else {
            return Outcome::Err(Error::builder(
                BuilderErrorKind::UnknownRelation,
                format!("{}.{relation} does not reference rows it can detach", metadata.name),
            ));
        };
        let target = registry.target_of(relation_meta);
        let mut update = UpdateQueryBuilder::new(driver, target);
        for column in target.join_columns_of(inverse) {
            let Some(referenced) = column.referenced_column.as_deref() else {
                continue;
            };
            let Some(value) = owner.get(referenced) else {
                return Outcome::Err(missing_key(&metadata.name, referenced));
            };
            update = update
                .set(column.property_path.clone(), Value::Null)
                .and_where(Expr::col(column.property_path.clone()).eq(Expr::lit(value.clone())));
        }
        let result = try_outcome!(
            self.manager
                .run(cx, ReplicationMode::Master, async |runner| update.execute(cx, runner).await)
                .await
        );
        Outcome::Ok(result.affected.unwrap_or(0))
    }

    pub fn relation_loader(&self) -> RelationLoader<P> {
        self.manager.relation_loader()
    }
}

fn into_entities<E: Entity>(loaded: &LoadedEntities) -> Result<Vec<E>> {
    loaded
        .roots
        .iter()
        .map(|&root| E::from_graph(&loaded.graph, root))
        .collect()
}

fn missing_key(entity: &str, property: &str) -> Error {
    Error::builder(
        BuilderErrorKind::Incomplete,
        format!("identifier of {entity} has no value for \"{property}\""),
    )
}

/// Repositories keyed by entity type.
#[derive(Default)]
pub struct RepositoryRegistry {
    repositories: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryRegistry")
            .field("len", &self.repositories.len())
            .finish()
    }
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `repository`, replacing an earlier one for the same type.
    pub fn register<E: Entity, P: ConnectionProvider + 'static>(&mut self, repository: Repository<E, P>) {
        self.repositories.insert(TypeId::of::<E>(), Box::new(repository));
    }

    /// The repository for `E`, if one was registered with provider `P`.
    pub fn get<E: Entity, P: ConnectionProvider + 'static>(&self) -> Option<&Repository<E, P>> {
        self.repositories
            .get(&TypeId::of::<E>())
            .and_then(|repository| repository.downcast_ref::<Repository<E, P>>())
    }

    pub fn contains<E: Entity>(&self) -> bool {
        self.repositories.contains_key(&TypeId::of::<E>())
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use asupersync::runtime::RuntimeBuilder;
    use persisto_core::metadata::{ColumnOptions, ColumnType, RelationOptions};
    use persisto_core::testing::{MockConnection, MockProvider};
    use persisto_core::{
        Driver, EntityRecord, EntitySchema, MetadataArgs, QueryResult, Row, build_metadata,
    };

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct User {
        id: Option<i64>,
        name: String,
        visits: i64,
    }

    impl Entity for User {
        const ENTITY: &'static str = "User";

        fn to_graph(&self, graph: &mut EntityGraph) -> EntityRef {
            let mut record = EntityRecord::new("User")
                .with("name", self.name.clone())
                .with("visits", self.visits);
            if let Some(id) = self.id {
                record.set("id", id);
            }
            graph.insert(record)
        }

        fn from_graph(graph: &EntityGraph, entity: EntityRef) -> Result<Self> {
            let record = &graph[entity];
            let name = match record.get("name") {
                Some(Value::Text(name)) => name.clone(),
                _ => return Err(Error::Hydration("User.name is missing".into())),
            };
            Ok(Self {
                id: record.get("id").and_then(Value::as_i64),
                name,
                visits: record.get("visits").and_then(Value::as_i64).unwrap_or(0),
            })
        }
    }

    fn manager(conn: &MockConnection) -> EntityManager<MockProvider> {
        let registry = build_metadata(
            &MetadataArgs::new()
                .entity(
                    EntitySchema::new("User")
                        .column(ColumnOptions::primary_generated("id"))
                        .column(ColumnOptions::new("name", ColumnType::Text))
                        .column(ColumnOptions::new("visits", ColumnType::BigInt))
                        .relation(RelationOptions::one_to_many("posts", "Post", "author"))
                        .relation(RelationOptions::many_to_many("groups", "Group")),
                )
                .entity(
                    EntitySchema::new("Post")
                        .column(ColumnOptions::primary_generated("id"))
                        .relation(RelationOptions::many_to_one("author", "User").inverse_side("posts")),
                )
                .entity(EntitySchema::new("Group").column(ColumnOptions::primary_generated("id"))),
        )
        .unwrap();
        EntityManager::new(
            Arc::new(registry),
            Arc::new(MockProvider::new(conn.clone())),
            Driver::postgres(),
        )
    }

    fn user_row(id: i64, name: &str) -> Row {
        Row::new(
            vec!["user_id".into(), "user_name".into(), "user_visits".into()],
            vec![Value::BigInt(id), Value::Text(name.into()), Value::BigInt(0)],
        )
    }

    #[test]
    fn test_save_writes_generated_id_back() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new(Driver::postgres());
        conn.set_next_insert_id(42);
        let users: Repository<User, MockProvider> = Repository::new(manager(&conn));

        let mut user = User {
            id: None,
            name: "ada".into(),
            visits: 0,
        };
        let summary = rt.block_on(async { unwrap_outcome(users.save(&cx, &mut user, SaveOptions::default()).await) });

        assert_eq!(summary.inserted, 1);
        assert_eq!(user.id, Some(42));
    }

    #[test]
    fn test_find_one_by_filters_on_properties() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new(Driver::postgres());
        conn.on("FROM \"user\"", QueryResult::with_rows(vec![user_row(3, "ada")]));
        let users: Repository<User, MockProvider> = Repository::new(manager(&conn));

        let found = rt.block_on(async {
            unwrap_outcome(users.find_one_by(&cx, &[("name", Value::Text("ada".into()))]).await)
        });

        assert_eq!(found.map(|u| u.id), Some(Some(3)));
        let (sql, params) = conn.executed().remove(0);
        assert!(sql.contains("WHERE \"user\".\"name\" = $1"), "{sql}");
        assert_eq!(params, vec![Value::Text("ada".into())]);
    }

    #[test]
    fn test_increment_updates_in_place() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new(Driver::postgres());
        let users: Repository<User, MockProvider> = Repository::new(manager(&conn));

        let affected = rt.block_on(async {
            unwrap_outcome(users.increment(&cx, &[("id", Value::BigInt(3))], "visits", 2).await)
        });

        assert_eq!(affected, 1);
        assert_eq!(
            conn.executed_sql(),
            vec!["UPDATE \"user\" SET \"visits\" = \"visits\" + 2 WHERE \"id\" = $1".to_string()]
        );
    }

    #[test]
    fn test_clear_relation() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new(Driver::postgres());
        let users: Repository<User, MockProvider> = Repository::new(manager(&conn));
        let owner = EntityIdentifier::single("id", 3_i64);

        rt.block_on(async {
            unwrap_outcome(users.clear_relation(&cx, &owner, "posts").await);
            unwrap_outcome(users.clear_relation(&cx, &owner, "groups").await);
        });

        let sql = conn.executed_sql();
        assert_eq!(sql[0], "UPDATE \"post\" SET \"author_id\" = $1 WHERE \"author_id\" = $2");
        assert_eq!(sql[1], "DELETE FROM \"user_groups_group\" WHERE \"user_id\" = $1");
        assert!(matches!(
            rt.block_on(async { users.clear_relation(&cx, &owner, "friends").await }),
            Outcome::Err(Error::Builder(_))
        ));
    }

    #[test]
    fn test_registry_is_keyed_by_type() {
        let conn = MockConnection::new(Driver::postgres());
        let mut registry = RepositoryRegistry::new();
        assert!(registry.get::<User, MockProvider>().is_none());

        registry.register(Repository::<User, MockProvider>::new(manager(&conn)));
        assert!(registry.contains::<User>());
        assert_eq!(registry.len(), 1);
        let users = registry.get::<User, MockProvider>().unwrap();
        assert_eq!(users.metadata().unwrap().name, "User");
    }
}
