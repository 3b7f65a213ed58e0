//! persisto - entity persistence planning and dialect-aware query building.
//!
//! persisto maps Rust values onto relational tables and keeps the database
//! consistent with in-memory entity graphs:
//!
//! - Explicit metadata: entities are described with `EntitySchema` values,
//!   no derive macros or global registries
//! - Change-set planning: `save` diffs a graph against the stored rows and
//!   emits only the statements that are needed, parents first
//! - Cascades, orphan handling, soft deletes and optimistic versioning
//! - A fluent, dialect-aware select builder with relation joins and brackets
//!
//! # Quick Start
//!
//! ```ignore
//! use persisto::prelude::*;
//!
//! let options = DataSourceOptions::new(DriverKind::Postgres).entities(
//!     MetadataArgs::new()
//!         .entity(
//!             EntitySchema::new("User")
//!                 .column(ColumnOptions::primary_generated("id"))
//!                 .column(ColumnOptions::new("name", ColumnType::Text)),
//!         )
//!         .entity(
//!             EntitySchema::new("Post")
//!                 .column(ColumnOptions::primary_generated("id"))
//!                 .relation(RelationOptions::many_to_one("author", "User").cascade(Cascade::SAVE)),
//!         ),
//! );
//! let mut source = DataSource::new(options, provider);
//! source.initialize()?;
//!
//! let mut graph = EntityGraph::new();
//! let user = graph.insert(EntityRecord::new("User").with("name", "ada"));
//! let post = graph.insert(EntityRecord::new("Post"));
//! graph.link(post, "author", user);
//! source.manager()?.save(&cx, &mut graph, &[post], SaveOptions::default()).await;
//! ```
//!
//! Database drivers plug in through `Connection` and `ConnectionProvider`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

pub use persisto_core::{
    // asupersync re-exports
    Budget,
    Cx,
    Outcome,
    RegionId,
    TaskId,
    // Core types
    Connection,
    ConnectionProvider,
    Driver,
    DriverCapabilities,
    DriverKind,
    EntityGraph,
    EntityIdentifier,
    EntityMetadata,
    EntityRecord,
    EntityRef,
    EntitySchema,
    EntitySubscriber,
    Error,
    IsolationLevel,
    Lazy,
    LazyKey,
    LazyLoader,
    MetadataArgs,
    MetadataRegistry,
    QueryResult,
    QueryRunner,
    RelationValue,
    ReplicationMode,
    Result,
    Row,
    SubscriberSet,
    TransactionPhase,
    Value,
    build_metadata,
    try_outcome,
    try_result,
};
pub use persisto_core::metadata;
#[cfg(feature = "testing")]
pub use persisto_core::testing;

pub use persisto_query::{
    Brackets, Condition, DeleteQueryBuilder, Expr, InsertQueryBuilder, JoinType, LoadedEntities, OrderDirection,
    SelectQueryBuilder, UpdateQueryBuilder,
};

pub use persisto_session::{
    Entity, EntityManager, PersistSummary, RelationLoader, RemoveOptions, Repository, RepositoryRegistry,
    SaveOptions,
};

pub use persisto_core::{BuilderErrorKind, ConfigErrorKind, MetadataErrorKind, OptimisticLockError, TransactionErrorKind};

/// Settings of a [`DataSource`].
///
/// Plain settings (de)serialize with serde; entity schemas and subscribers
/// are code and must be set programmatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceOptions {
    pub driver: DriverKind,
    /// Database name or file; required for SQLite
    #[serde(default)]
    pub database: Option<String>,
    /// Schema applied to entities that do not name one
    #[serde(default)]
    pub schema: Option<String>,
    /// Statements slower than this are logged as warnings
    #[serde(default)]
    pub max_query_execution_time_ms: Option<u64>,
    /// Overrides the dialect's alias length limit
    #[serde(default)]
    pub max_alias_length: Option<usize>,
    #[serde(skip)]
    pub entities: MetadataArgs,
    #[serde(skip)]
    pub subscribers: SubscriberSet,
}

impl DataSourceOptions {
    pub fn new(driver: DriverKind) -> Self {
        Self {
            driver,
            database: None,
            schema: None,
            max_query_execution_time_ms: None,
            max_alias_length: None,
            entities: MetadataArgs::new(),
            subscribers: SubscriberSet::new(),
        }
    }

    /// Parse the plain settings from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn max_query_execution_time(mut self, limit: Duration) -> Self {
        self.max_query_execution_time_ms = Some(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn max_alias_length(mut self, max: usize) -> Self {
        self.max_alias_length = Some(max);
        self
    }

    pub fn entities(mut self, entities: MetadataArgs) -> Self {
        self.entities = entities;
        self
    }

    pub fn subscriber(mut self, subscriber: Arc<dyn EntitySubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Check for missing or contradictory settings.
    pub fn validate(&self) -> Result<()> {
        if self.driver == DriverKind::Sqlite && self.database.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config(
                ConfigErrorKind::MissingOption,
                "sqlite data sources require a database path",
            ));
        }
        if self.max_alias_length == Some(0) {
            return Err(Error::config(
                ConfigErrorKind::InvalidOption,
                "max_alias_length must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Driver for the configured dialect with overrides applied.
    pub fn build_driver(&self) -> Driver {
        let driver = Driver::new(self.driver);
        match self.max_alias_length {
            Some(max) => driver.with_max_alias_length(Some(max)),
            None => driver,
        }
    }

    fn metadata_args(&self) -> MetadataArgs {
        let mut args = self.entities.clone();
        if let Some(schema) = &self.schema {
            for entity in args.entities.iter_mut().filter(|e| e.schema.is_none()) {
                entity.schema = Some(schema.clone());
            }
        }
        args
    }
}

/// One configured database: metadata, connections and repositories.
///
/// # Lifecycle
///
/// 1. [`new`](Self::new) stores the options and provider.
/// 2. [`initialize`](Self::initialize) validates the options and builds the
///    metadata; configuration errors surface here.
/// 3. [`manager`](Self::manager) and [`repository`](Self::repository) are
///    usable until [`destroy`](Self::destroy).
pub struct DataSource<P: ConnectionProvider> {
    options: DataSourceOptions,
    provider: Arc<P>,
    manager: Option<EntityManager<P>>,
    repositories: RepositoryRegistry,
}

impl<P: ConnectionProvider> std::fmt::Debug for DataSource<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("driver", &self.options.driver)
            .field("initialized", &self.manager.is_some())
            .field("repositories", &self.repositories.len())
            .finish_non_exhaustive()
    }
}

impl<P: ConnectionProvider + 'static> DataSource<P> {
    pub fn new(options: DataSourceOptions, provider: P) -> Self {
        Self {
            options,
            provider: Arc::new(provider),
            manager: None,
            repositories: RepositoryRegistry::new(),
        }
    }

    pub fn options(&self) -> &DataSourceOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.manager.is_some()
    }

    /// Validate the options and build the entity metadata.
    ///
    /// Calling it again rebuilds the metadata and drops cached repositories.
    pub fn initialize(&mut self) -> Result<()> {
        self.options.validate()?;
        let registry = build_metadata(&self.options.metadata_args())?;
        let driver = self.options.build_driver();
        info!(
            driver = driver.kind.as_str(),
            entities = registry.len(),
            subscribers = self.options.subscribers.len(),
            "Data source initialized"
        );
        let manager = EntityManager::new(Arc::new(registry), Arc::clone(&self.provider), driver)
            .with_subscribers(self.options.subscribers.clone())
            .with_max_query_execution_time(self.options.max_query_execution_time_ms.map(Duration::from_millis));
        self.manager = Some(manager);
        self.repositories = RepositoryRegistry::new();
        Ok(())
    }

    /// Forget the metadata and repositories.
    pub fn destroy(&mut self) {
        self.manager = None;
        self.repositories = RepositoryRegistry::new();
        info!(driver = self.options.driver.as_str(), "Data source destroyed");
    }

    pub fn manager(&self) -> Result<&EntityManager<P>> {
        self.manager.as_ref().ok_or_else(|| {
            Error::config(
                ConfigErrorKind::NotInitialized,
                "data source is not initialized",
            )
        })
    }

    pub fn registry(&self) -> Result<&MetadataRegistry> {
        Ok(self.manager()?.registry())
    }

    pub fn driver(&self) -> Result<&Driver> {
        Ok(self.manager()?.driver())
    }

    /// The repository for `E`, created on first use.
    pub fn repository<E: Entity>(&mut self) -> Result<&Repository<E, P>> {
        let manager = self.manager()?.clone();
        manager.registry().by_name(E::ENTITY)?;
        if !self.repositories.contains::<E>() {
            self.repositories.register(Repository::<E, P>::new(manager));
        }
        self.repositories.get::<E, P>().ok_or_else(|| {
            Error::config(
                ConfigErrorKind::InvalidOption,
                format!("repository for {} has a different provider type", E::ENTITY),
            )
        })
    }

    /// Select builder over `entity`.
    pub fn create_query_builder(&self, entity: &str, alias: &str) -> Result<SelectQueryBuilder<'_>> {
        self.manager()?.create_query_builder(entity, alias)
    }

    /// Run `work` in a transaction on a fresh runner.
    pub async fn transaction<T, F>(&self, cx: &Cx, isolation: Option<IsolationLevel>, work: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut QueryRunner<P::Conn>) -> Outcome<T, Error>,
    {
        let manager = try_result!(self.manager());
        manager
            .run(cx, ReplicationMode::Master, async move |runner| {
                runner.transaction(cx, isolation, work).await
            })
            .await
    }
}

/// Glob import for everyday use.
pub mod prelude {
    pub use crate::metadata::{
        Cascade, ColumnOptions, ColumnType, Deferrable, JoinTableOptions, ListenerKind, OrphanedRowAction,
        ReferentialAction, RelationOptions,
    };
    pub use crate::{
        Brackets, Condition, Connection, ConnectionProvider, Cx, DataSource, DataSourceOptions, Driver, DriverKind,
        Entity, EntityGraph, EntityIdentifier, EntityManager, EntityRecord, EntityRef, EntitySchema, Error, Expr,
        IsolationLevel, Lazy, LoadedEntities, MetadataArgs, OrderDirection, Outcome, PersistSummary, RelationValue,
        RemoveOptions, Repository, ReplicationMode, Result, SaveOptions, SelectQueryBuilder, Value,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnOptions, ColumnType};
    use persisto_core::testing::{MockConnection, MockProvider};

    fn entities() -> MetadataArgs {
        MetadataArgs::new().entity(
            EntitySchema::new("User")
                .column(ColumnOptions::primary_generated("id"))
                .column(ColumnOptions::new("name", ColumnType::Text)),
        )
    }

    #[test]
    fn test_sqlite_requires_database() {
        let err = DataSourceOptions::new(DriverKind::Sqlite).validate().unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::MissingOption));
        assert!(
            DataSourceOptions::new(DriverKind::Sqlite)
                .database("app.db")
                .validate()
                .is_ok()
        );
        assert!(DataSourceOptions::new(DriverKind::Postgres).validate().is_ok());
    }

    #[test]
    fn test_options_from_json() {
        let options = DataSourceOptions::from_json(
            r#"{"driver": "Postgres", "schema": "app", "max_query_execution_time_ms": 250, "max_alias_length": 30}"#,
        )
        .unwrap();
        assert_eq!(options.driver, DriverKind::Postgres);
        assert_eq!(options.schema.as_deref(), Some("app"));
        assert_eq!(options.max_query_execution_time_ms, Some(250));
        assert_eq!(options.build_driver().capabilities.max_alias_length, Some(30));
        assert!(options.entities.entities.is_empty());

        assert!(matches!(DataSourceOptions::from_json("{}"), Err(Error::Serde(_))));
    }

    #[test]
    fn test_manager_requires_initialize() {
        let conn = MockConnection::new(Driver::postgres());
        let mut source = DataSource::new(
            DataSourceOptions::new(DriverKind::Postgres).entities(entities()),
            MockProvider::new(conn),
        );
        let err = source.manager().unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::NotInitialized));

        source.initialize().unwrap();
        assert!(source.is_initialized());
        assert_eq!(source.registry().unwrap().len(), 1);

        source.destroy();
        assert!(source.manager().is_err());
    }

    #[test]
    fn test_default_schema_applies_to_entities() {
        let conn = MockConnection::new(Driver::postgres());
        let mut source = DataSource::new(
            DataSourceOptions::new(DriverKind::Postgres)
                .schema("app")
                .entities(entities()),
            MockProvider::new(conn),
        );
        source.initialize().unwrap();
        let sql = source
            .create_query_builder("User", "user")
            .unwrap()
            .get_query()
            .unwrap();
        assert!(sql.contains("FROM \"app\".\"user\" \"user\""), "{sql}");
    }

    #[test]
    fn test_metadata_errors_surface_on_initialize() {
        let conn = MockConnection::new(Driver::postgres());
        let mut source = DataSource::new(
            DataSourceOptions::new(DriverKind::Postgres)
                .entities(MetadataArgs::new().entity(EntitySchema::new("Orphan"))),
            MockProvider::new(conn),
        );
        let err = source.initialize().unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::MissingPrimaryColumn));
        assert!(!source.is_initialized());
    }
}
