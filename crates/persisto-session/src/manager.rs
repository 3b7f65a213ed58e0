//! Entity manager: the entry point for persisting entity graphs.
//!
//! An [`EntityManager`] owns nothing but shared handles (metadata, the
//! connection provider, subscribers, the driver), so clones are cheap and
//! every clone talks to the same data source.
//!
//! Each persistence call runs the same pipeline:
//!
//! 1. Acquire a [`QueryRunner`] (or use the caller's).
//! 2. Build the subjects with [`SubjectBuilder`].
//! 3. Order them into an [`ExecutionPlan`](crate::ExecutionPlan); an
//!    unresolvable cycle fails here, before any statement.
//! 4. Execute the plan inside a transaction unless the caller opted out or
//!    already holds one.
//! 5. Release the runner.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use asupersync::{Cx, Outcome};
use persisto_core::{
    Connection, ConnectionProvider, Driver, EntityGraph, EntityRef, Error, Lazy, LazyKey, MetadataErrorKind,
    MetadataRegistry, QueryRunner, ReplicationMode, Result, SubscriberSet, try_outcome, try_result,
};
use persisto_query::{LoadedEntities, SelectQueryBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::executor::{PersistSummary, SubjectExecutor};
use crate::relation_loader::RelationLoader;
use crate::subject::SubjectKind;
use crate::subject_builder::SubjectBuilder;

/// Options for [`EntityManager::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveOptions {
    /// Wrap the statements in a transaction
    pub transaction: bool,
    /// Run entity listeners and subscribers
    pub listeners: bool,
    /// Read database-generated values back into the graph
    pub reload: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            transaction: true,
            listeners: true,
            reload: true,
        }
    }
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction(mut self, enabled: bool) -> Self {
        self.transaction = enabled;
        self
    }

    pub fn listeners(mut self, enabled: bool) -> Self {
        self.listeners = enabled;
        self
    }

    pub fn reload(mut self, enabled: bool) -> Self {
        self.reload = enabled;
        self
    }
}

/// Options for [`EntityManager::remove`], `soft_remove` and `recover`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveOptions {
    pub transaction: bool,
    pub listeners: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            transaction: true,
            listeners: true,
        }
    }
}

impl RemoveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction(mut self, enabled: bool) -> Self {
        self.transaction = enabled;
        self
    }

    pub fn listeners(mut self, enabled: bool) -> Self {
        self.listeners = enabled;
        self
    }
}

/// Flags shared by every persistence operation.
#[derive(Debug, Clone, Copy)]
struct PersistFlags {
    transaction: bool,
    listeners: bool,
    reload: bool,
}

impl From<SaveOptions> for PersistFlags {
    fn from(options: SaveOptions) -> Self {
        Self {
            transaction: options.transaction,
            listeners: options.listeners,
            reload: options.reload,
        }
    }
}

impl From<RemoveOptions> for PersistFlags {
    fn from(options: RemoveOptions) -> Self {
        Self {
            transaction: options.transaction,
            listeners: options.listeners,
            reload: true,
        }
    }
}

/// Saves, removes and queries entities of one data source.
pub struct EntityManager<P: ConnectionProvider> {
    registry: Arc<MetadataRegistry>,
    provider: Arc<P>,
    subscribers: SubscriberSet,
    driver: Driver,
    max_query_execution_time: Option<Duration>,
}

impl<P: ConnectionProvider> Clone for EntityManager<P> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            provider: Arc::clone(&self.provider),
            subscribers: self.subscribers.clone(),
            driver: self.driver.clone(),
            max_query_execution_time: self.max_query_execution_time,
        }
    }
}

impl<P: ConnectionProvider> fmt::Debug for EntityManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("entities", &self.registry.len())
            .field("driver", &self.driver.kind)
            .field("subscribers", &self.subscribers.len())
            .field("max_query_execution_time", &self.max_query_execution_time)
            .finish_non_exhaustive()
    }
}

impl<P: ConnectionProvider> EntityManager<P> {
    pub fn new(registry: Arc<MetadataRegistry>, provider: Arc<P>, driver: Driver) -> Self {
        Self {
            registry,
            provider,
            subscribers: SubscriberSet::new(),
            driver,
            max_query_execution_time: None,
        }
    }

    pub fn with_subscribers(mut self, subscribers: SubscriberSet) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Warn about statements slower than `limit`.
    pub fn with_max_query_execution_time(mut self, limit: Option<Duration>) -> Self {
        self.max_query_execution_time = limit;
        self
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn subscribers(&self) -> &SubscriberSet {
        &self.subscribers
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    // ========================================================================
    // Query runners
    // ========================================================================

    /// Check out a connection wrapped in a runner.
    pub async fn create_query_runner(&self, cx: &Cx, mode: ReplicationMode) -> Outcome<QueryRunner<P::Conn>, Error> {
        let connection = try_outcome!(self.provider.acquire(cx, mode).await);
        Outcome::Ok(
            QueryRunner::new(connection, self.subscribers.clone())
                .with_mode(mode)
                .with_max_query_execution_time(self.max_query_execution_time),
        )
    }

    /// Hand the runner's connection back to the provider.
    pub fn release_query_runner(&self, runner: &mut QueryRunner<P::Conn>) {
        match runner.release() {
            Ok(connection) => self.provider.release(connection),
            Err(e) => warn!(error = %e, "Query runner was already released"),
        }
    }

    /// Run `work` on a fresh runner and release it afterwards, whatever the
    /// outcome.
    pub async fn run<T, F>(&self, cx: &Cx, mode: ReplicationMode, work: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut QueryRunner<P::Conn>) -> Outcome<T, Error>,
    {
        let mut runner = try_outcome!(self.create_query_runner(cx, mode).await);
        let outcome = work(&mut runner).await;
        self.release_query_runner(&mut runner);
        outcome
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Insert or update `roots` and everything their cascades reach.
    ///
    /// Generated keys, versions and defaults are written back into `graph`.
    pub async fn save(
        &self,
        cx: &Cx,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
        options: SaveOptions,
    ) -> Outcome<PersistSummary, Error> {
        self.run(cx, ReplicationMode::Master, async |runner| {
            self.persist(cx, runner, graph, roots, SubjectKind::Update, options.into())
                .await
        })
        .await
    }

    /// Delete `roots` and everything their remove cascades reach.
    pub async fn remove(
        &self,
        cx: &Cx,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
        options: RemoveOptions,
    ) -> Outcome<PersistSummary, Error> {
        self.run(cx, ReplicationMode::Master, async |runner| {
            self.persist(cx, runner, graph, roots, SubjectKind::Remove, options.into())
                .await
        })
        .await
    }

    /// Set the delete date of `roots` and their soft-remove cascades.
    pub async fn soft_remove(
        &self,
        cx: &Cx,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
        options: RemoveOptions,
    ) -> Outcome<PersistSummary, Error> {
        self.run(cx, ReplicationMode::Master, async |runner| {
            self.persist(cx, runner, graph, roots, SubjectKind::SoftRemove, options.into())
                .await
        })
        .await
    }

    /// Clear the delete date of soft-removed `roots`.
    pub async fn recover(
        &self,
        cx: &Cx,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
        options: RemoveOptions,
    ) -> Outcome<PersistSummary, Error> {
        self.run(cx, ReplicationMode::Master, async |runner| {
            self.persist(cx, runner, graph, roots, SubjectKind::Recover, options.into())
                .await
        })
        .await
    }

    /// [`save`](Self::save) on the caller's runner. An active transaction
    /// on `runner` is joined rather than nested.
    pub async fn save_with_runner<C: Connection>(
        &self,
        cx: &Cx,
        runner: &mut QueryRunner<C>,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
        options: SaveOptions,
    ) -> Outcome<PersistSummary, Error> {
        self.persist(cx, runner, graph, roots, SubjectKind::Update, options.into())
            .await
    }

    pub async fn remove_with_runner<C: Connection>(
        &self,
        cx: &Cx,
        runner: &mut QueryRunner<C>,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
        options: RemoveOptions,
    ) -> Outcome<PersistSummary, Error> {
        self.persist(cx, runner, graph, roots, SubjectKind::Remove, options.into())
            .await
    }

    pub async fn soft_remove_with_runner<C: Connection>(
        &self,
        cx: &Cx,
        runner: &mut QueryRunner<C>,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
        options: RemoveOptions,
    ) -> Outcome<PersistSummary, Error> {
        self.persist(cx, runner, graph, roots, SubjectKind::SoftRemove, options.into())
            .await
    }

    pub async fn recover_with_runner<C: Connection>(
        &self,
        cx: &Cx,
        runner: &mut QueryRunner<C>,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
        options: RemoveOptions,
    ) -> Outcome<PersistSummary, Error> {
        self.persist(cx, runner, graph, roots, SubjectKind::Recover, options.into())
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, cx, runner, graph, roots, flags), fields(roots = roots.len()))]
    async fn persist<C: Connection>(
        &self,
        cx: &Cx,
        runner: &mut QueryRunner<C>,
        graph: &mut EntityGraph,
        roots: &[EntityRef],
        operation: SubjectKind,
        flags: PersistFlags,
    ) -> Outcome<PersistSummary, Error> {
        if roots.is_empty() {
            return Outcome::Ok(PersistSummary::default());
        }

        let subjects = {
            let mut builder = SubjectBuilder::new(&self.registry, &self.driver, graph);
            let built = match operation {
                SubjectKind::Remove => builder.build_for_removal(cx, runner, roots).await,
                SubjectKind::SoftRemove => builder.build_for_soft_removal(cx, runner, roots).await,
                SubjectKind::Recover => builder.build_for_recovery(cx, runner, roots).await,
                SubjectKind::Insert | SubjectKind::Update => builder.build_for_insert_or_update(cx, runner, roots).await,
            };
            try_outcome!(built);
            builder.into_subjects()
        };

        let mut executor = try_result!(SubjectExecutor::new(&self.registry, &self.driver, subjects))
            .with_listeners(flags.listeners)
            .with_reload(flags.reload);
        if !executor.has_work() {
            debug!(operation = operation.as_str(), "Nothing to persist");
            return Outcome::Ok(PersistSummary::default());
        }

        if !flags.transaction || runner.is_transaction_active() {
            return executor.execute(cx, runner, graph).await;
        }

        let outcome = runner
            .transaction(cx, None, async |runner| executor.execute(cx, runner, graph).await)
            .await;
        match &outcome {
            Outcome::Ok(summary) => info!(operation = operation.as_str(), ?summary, "Transaction committed"),
            Outcome::Err(e) => warn!(operation = operation.as_str(), error = %e, "Persist failed; transaction rolled back"),
            Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                warn!(operation = operation.as_str(), "Persist interrupted; transaction rolled back");
            }
        }
        outcome
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Select builder over `entity` with `alias` as the main alias.
    pub fn create_query_builder(&self, entity: &str, alias: &str) -> Result<SelectQueryBuilder<'_>> {
        SelectQueryBuilder::new(&self.registry, &self.driver, entity, alias)
    }

    /// Loader for [`Lazy`] relation values of this data source.
    pub fn relation_loader(&self) -> RelationLoader<P> {
        RelationLoader::new(self.clone())
    }

    /// A lazy handle for `relation` of the entity at `entity`.
    ///
    /// The handle is empty while the owner has no identifier.
    pub fn lazy_relation(&self, graph: &EntityGraph, entity: EntityRef, relation: &str) -> Result<Lazy<LoadedEntities>> {
        let record = graph.get(entity).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnknownEntity,
                "",
                format!("entity slot {} is not part of the graph", entity.0),
            )
        })?;
        let metadata = self.registry.by_name(&record.entity)?;
        if metadata.find_relation(relation).is_none() {
            return Err(Error::metadata(
                MetadataErrorKind::UnknownProperty,
                &metadata.name,
                format!("no relation named '{relation}'"),
            ));
        }
        Ok(match metadata.identifier(record, graph, &self.registry) {
            Some(owner) => Lazy::from_key(LazyKey {
                entity: metadata.name.clone(),
                relation: relation.to_string(),
                owner,
            }),
            None => Lazy::empty(),
        })
    }

    /// Entities `key.relation` of `key.owner` points at.
    pub async fn load_relation(&self, cx: &Cx, key: &LazyKey) -> Outcome<LoadedEntities, Error> {
        let owner = try_result!(self.registry.by_name(&key.entity));
        if owner.find_relation(&key.relation).is_none() {
            return Outcome::Err(Error::metadata(
                MetadataErrorKind::UnknownProperty,
                &owner.name,
                format!("no relation named '{}'", key.relation),
            ));
        }
        let query = SelectQueryBuilder::for_metadata(&self.registry, &self.driver, owner, &owner.table_name)
            .inner_join_and_select(&format!("{}.{}", owner.table_name, key.relation), "related")
            .where_in_ids(std::slice::from_ref(&key.owner));

        let mut runner = try_outcome!(self.create_query_runner(cx, ReplicationMode::Slave).await);
        let outcome = query.get_many(cx, &runner).await;
        self.release_query_runner(&mut runner);
        let loaded = try_outcome!(outcome);

        let related = loaded
            .first()
            .map(|root| loaded.graph.related(root, &key.relation))
            .unwrap_or_default();
        debug!(entity = %key.entity, relation = %key.relation, found = related.len(), "Loaded lazy relation");
        Outcome::Ok(LoadedEntities {
            graph: loaded.graph,
            roots: related,
        })
    }
}
