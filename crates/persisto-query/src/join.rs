//! JOIN clauses over relations and plain entities.

use persisto_core::metadata::{ColumnMetadata, RelationMetadata};
use persisto_core::{BuilderErrorKind, Driver, EntityMetadata, Error, MetadataId, MetadataRegistry, Result, build_alias};
use serde::{Deserialize, Serialize};

use crate::clause::Condition;
use crate::expr::{Expr, RenderContext};

/// Types of SQL joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

/// What a join reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    /// `parent_alias.relation`
    Relation {
        parent_alias: String,
        relation: String,
    },
    /// Any entity, joined on an explicit condition
    Entity,
}

/// A join registered on a select builder.
#[derive(Debug, Clone)]
pub struct JoinAttribute {
    pub join_type: JoinType,
    pub alias: String,
    pub target: JoinTarget,
    pub metadata: MetadataId,
    /// Extra ON condition, AND-ed to the relation condition
    pub condition: Option<Condition>,
    /// Whether the joined entity is hydrated
    pub select: bool,
}

impl JoinAttribute {
    /// Alias of the junction table of a many-to-many join.
    pub fn junction_alias(&self, driver: &Driver) -> String {
        build_alias(driver.alias_options(), &[&self.alias, "junction"])
    }

    pub fn parent_alias(&self) -> Option<&str> {
        match &self.target {
            JoinTarget::Relation { parent_alias, .. } => Some(parent_alias),
            JoinTarget::Entity => None,
        }
    }

    pub fn relation_name(&self) -> Option<&str> {
        match &self.target {
            JoinTarget::Relation { relation, .. } => Some(relation),
            JoinTarget::Entity => None,
        }
    }

    /// Render this join. `parent` is the metadata behind the parent alias;
    /// `extra` holds conditions the builder adds (soft delete, discriminator).
    pub fn render(
        &self,
        ctx: &mut RenderContext<'_>,
        registry: &MetadataRegistry,
        parent: Option<&EntityMetadata>,
        extra: &[Expr],
    ) -> Result<String> {
        let driver = ctx.driver;
        let target = registry.get(self.metadata);
        let alias = driver.escape(&self.alias);
        let table = driver.escape_table_path(target);
        let keyword = self.join_type.as_str();

        let mut conditions = Vec::new();
        let mut prefix = String::new();

        match (&self.target, parent) {
            (JoinTarget::Relation { parent_alias, relation }, Some(parent)) => {
                let rel = parent.find_relation(relation).ok_or_else(|| {
                    Error::builder(
                        BuilderErrorKind::UnknownRelation,
                        format!("{} has no relation \"{relation}\"", parent.name),
                    )
                })?;
                let parent_q = driver.escape(parent_alias);
                if rel.is_many_to_many() {
                    let Some(junction) = &rel.junction else {
                        return Err(Error::builder(
                            BuilderErrorKind::UnknownRelation,
                            format!("{}.{relation} has no junction table", parent.name),
                        ));
                    };
                    let junction_alias = driver.escape(&self.junction_alias(driver));
                    let mut junction_on = Vec::new();
                    for column in &junction.owner_columns {
                        let referenced = column_for(parent, &column.referenced_column)?;
                        junction_on.push(format!(
                            "{junction_alias}.{} = {parent_q}.{}",
                            driver.escape(&column.database_name),
                            driver.escape(&referenced.database_name)
                        ));
                    }
                    prefix = format!(
                        " {keyword} {} {junction_alias} ON {}",
                        driver.escape_table(&junction.table_name, parent.schema.as_deref(), parent.database.as_deref()),
                        junction_on.join(" AND ")
                    );
                    for column in &junction.inverse_columns {
                        let referenced = column_for(target, &column.referenced_column)?;
                        conditions.push(format!(
                            "{alias}.{} = {junction_alias}.{}",
                            driver.escape(&referenced.database_name),
                            driver.escape(&column.database_name)
                        ));
                    }
                } else if rel.is_join_column_owner() {
                    for column in parent.join_columns_of(rel) {
                        let referenced = referenced_column(target, column)?;
                        conditions.push(format!(
                            "{alias}.{} = {parent_q}.{}",
                            driver.escape(&referenced.database_name),
                            driver.escape(&column.database_name)
                        ));
                    }
                } else {
                    let inverse = inverse_owner(registry, parent, rel)?;
                    for column in target.join_columns_of(inverse) {
                        let referenced = referenced_column(parent, column)?;
                        conditions.push(format!(
                            "{alias}.{} = {parent_q}.{}",
                            driver.escape(&column.database_name),
                            driver.escape(&referenced.database_name)
                        ));
                    }
                }
            }
            (JoinTarget::Relation { parent_alias, .. }, None) => {
                return Err(Error::builder(
                    BuilderErrorKind::UnknownAlias,
                    format!("join parent \"{parent_alias}\" is not an entity alias"),
                ));
            }
            (JoinTarget::Entity, _) => {}
        }

        if let Some(condition) = &self.condition {
            let rendered = condition.render(ctx)?;
            if !rendered.is_empty() {
                if conditions.is_empty() {
                    conditions.push(rendered);
                } else {
                    conditions.push(format!("({rendered})"));
                }
            }
        }
        for filter in extra {
            conditions.push(filter.build(ctx)?);
        }

        let on = if conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            conditions.join(" AND ")
        };
        Ok(format!("{prefix} {keyword} {table} {alias} ON {on}"))
    }
}

fn column_for<'m>(metadata: &'m EntityMetadata, path: &str) -> Result<&'m ColumnMetadata> {
    metadata
        .find_column(path)
        .or_else(|| metadata.find_column_by_database_name(path))
        .ok_or_else(|| {
            Error::builder(
                BuilderErrorKind::UnknownProperty,
                format!("{} has no column \"{path}\"", metadata.name),
            )
        })
}

fn referenced_column<'m>(metadata: &'m EntityMetadata, join_column: &ColumnMetadata) -> Result<&'m ColumnMetadata> {
    let path = join_column.referenced_column.as_deref().ok_or_else(|| {
        Error::builder(
            BuilderErrorKind::UnknownProperty,
            format!("join column \"{}\" references nothing", join_column.database_name),
        )
    })?;
    column_for(metadata, path)
}

/// The owning side of an inverse relation.
pub(crate) fn inverse_owner<'m>(
    registry: &'m MetadataRegistry,
    owner: &EntityMetadata,
    relation: &RelationMetadata,
) -> Result<&'m RelationMetadata> {
    registry
        .inverse_of(relation)
        .filter(|inverse| inverse.is_owning())
        .ok_or_else(|| {
            Error::builder(
                BuilderErrorKind::UnknownRelation,
                format!(
                    "{}.{} has no owning inverse side",
                    owner.name, relation.property_name
                ),
            )
        })
}
