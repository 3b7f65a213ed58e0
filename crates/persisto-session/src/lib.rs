//! Persistence planning and execution for persisto.
//!
//! `persisto-session` is the **unit-of-work layer**. It turns a graph of
//! in-memory entities into the smallest correctly ordered set of INSERT,
//! UPDATE and DELETE statements that makes the database match the graph.
//!
//! # Role In The Architecture
//!
//! - **Change sets**: `SubjectBuilder` walks the graph along cascades, loads
//!   the stored rows and diffs them into one `Subject` per entity.
//! - **Ordering**: `ExecutionPlan` sorts inserts parents-first and removals
//!   children-first, breaking nullable foreign key cycles with a patch-back
//!   UPDATE.
//! - **Execution**: `SubjectExecutor` sends the statements, fires listeners
//!   and writes generated keys, versions and dates back into the graph.
//! - **Entry points**: `EntityManager` wraps it all in a transaction;
//!   `Repository<E>` offers the same on typed values.
//!
//! # Design Philosophy
//!
//! - **Arena graphs**: relations are `EntityRef` indices, so cyclic graphs
//!   need no shared ownership.
//! - **Validate first**: change-set and ordering errors surface before the
//!   first statement is sent.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome` via
//!   `persisto-core`.
//!
//! # Example
//!
//! ```ignore
//! let manager = EntityManager::new(registry, provider, Driver::postgres());
//!
//! let mut graph = EntityGraph::new();
//! let user = graph.insert(EntityRecord::new("User").with("name", "ada"));
//! let post = graph.insert(EntityRecord::new("Post").with("title", "hello"));
//! graph.link(post, "author", user);
//!
//! // Inserts the user first, then the post with its author_id.
//! manager.save(&cx, &mut graph, &[post], SaveOptions::default()).await;
//! ```

pub mod executor;
pub mod loader;
pub mod manager;
pub mod orderer;
pub mod relation_loader;
pub mod repository;
pub mod subject;
pub mod subject_builder;

pub use executor::{PersistSummary, SubjectExecutor};
pub use loader::DatabaseEntityLoader;
pub use manager::{EntityManager, RemoveOptions, SaveOptions};
pub use orderer::{ExecutionPlan, OperationGroup};
pub use relation_loader::RelationLoader;
pub use repository::{Entity, Repository, RepositoryRegistry};
pub use subject::{ChangeMap, ChangeValue, JunctionChange, Subject, SubjectKind, SubjectState};
pub use subject_builder::{SubjectBuilder, diff_columns};
