//! Dialect-aware query building for persisto.
//!
//! `persisto-query` is the **query construction layer**. It turns entity
//! metadata into parameterized SQL and result rows back into entity graphs.
//!
//! # Role In The Architecture
//!
//! - **Select builder**: `SelectQueryBuilder` with relation joins, brackets,
//!   entity-level pagination and composite-key aware counting.
//! - **Write builders**: `InsertQueryBuilder`, `UpdateQueryBuilder` and
//!   `DeleteQueryBuilder` used directly and by the persistence executor.
//! - **Parameters**: `:name` and `:...name` references are rewritten to the
//!   dialect's placeholders; values are never inlined.
//! - **Relation ids**: `RelationIdLoader` reads which rows a relation points
//!   at without hydrating them.
//!
//! Statements execute through a `QueryRunner` from `persisto-core`. Most users
//! reach these builders through the `persisto` facade crate.

pub mod builder;
pub mod clause;
pub mod expr;
pub mod hydrate;
pub mod join;
pub mod params;
pub mod relation_id;
pub mod select;

pub use builder::{
    DeleteQueryBuilder, InsertQueryBuilder, MetadataResolver, UpdateQueryBuilder, identifier_values,
    ids_expr,
};
pub use clause::{Brackets, Condition, Conjunction, NullsOrder, OrderBy, OrderDirection, WhereClauses};
pub use expr::{BinaryOp, ColumnResolver, Expr, PlainResolver, RenderContext};
pub use hydrate::LoadedEntities;
pub use join::{JoinAttribute, JoinTarget, JoinType};
pub use params::{ParameterSink, Parameters, expand_parameters};
pub use relation_id::{RelationIdLoader, RelationIdPair};
pub use select::SelectQueryBuilder;
