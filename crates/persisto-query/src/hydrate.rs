//! Turning joined result rows into entity graphs.
//!
//! Every selected alias contributes the columns it selected. Rows are grouped
//! per alias by primary key, so a parent repeated across rows of a to-many
//! join becomes one record whose relation lists every distinct child.

use std::collections::HashMap;

use persisto_core::metadata::RelationMetadata;
use persisto_core::{
    Driver, EntityGraph, EntityIdentifier, EntityMetadata, EntityRecord, EntityRef, Error,
    MetadataId, MetadataRegistry, RelationValue, Result, Row,
};

/// Entities produced by a select query.
#[derive(Debug, Clone, Default)]
pub struct LoadedEntities {
    pub graph: EntityGraph,
    /// Main-alias entities in result order
    pub roots: Vec<EntityRef>,
}

impl LoadedEntities {
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn first(&self) -> Option<EntityRef> {
        self.roots.first().copied()
    }

    /// Root records in result order.
    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.roots.iter().map(|r| &self.graph[*r])
    }
}

/// Columns one alias selected, as `(database name, result alias)`.
#[derive(Debug, Clone)]
pub(crate) struct AliasPlan {
    pub alias: String,
    pub metadata: MetadataId,
    pub columns: Vec<(String, String)>,
    /// Index of the parent plan and the relation that reached this alias
    pub parent: Option<(usize, String)>,
}

impl AliasPlan {
    fn result_alias(&self, database_name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(db, _)| db == database_name)
            .map(|(_, alias)| alias.as_str())
    }

    fn identifier_columns_missing(&self, registry: &MetadataRegistry) -> bool {
        registry
            .get(self.metadata)
            .primary_columns()
            .any(|c| self.result_alias(&c.database_name).is_none())
    }

    /// Primary key of this alias in `row`, or `None` when the row has none.
    pub fn identifier(&self, registry: &MetadataRegistry, driver: &Driver, row: &Row) -> Option<EntityIdentifier> {
        let metadata = registry.get(self.metadata);
        let mut values = Vec::new();
        for column in metadata.primary_columns() {
            let result = self.result_alias(&column.database_name)?;
            let value = row.get_by_name(result)?;
            if value.is_null() {
                return None;
            }
            values.push((column.property_path.clone(), driver.prepare_hydrated_value(column, value)));
        }
        if values.is_empty() {
            None
        } else {
            Some(EntityIdentifier::new(values))
        }
    }
}

/// The concrete entity of a row in a single-table hierarchy.
fn concrete_metadata<'r>(
    registry: &'r MetadataRegistry,
    plan: &AliasPlan,
    row: &Row,
) -> &'r EntityMetadata {
    let declared = registry.get(plan.metadata);
    let Some(discriminator) = declared.discriminator_column() else {
        return declared;
    };
    let Some(value) = plan
        .result_alias(&discriminator.database_name)
        .and_then(|alias| row.get_by_name(alias))
        .and_then(|v| v.as_str())
    else {
        return declared;
    };
    registry
        .iter()
        .find(|candidate| {
            candidate.inheritance.discriminator_value.as_deref() == Some(value)
                && (candidate.id == declared.id
                    || candidate.inheritance.ancestors.iter().any(|a| *a == declared.name))
        })
        .unwrap_or(declared)
}

fn relation_of<'r>(registry: &'r MetadataRegistry, plan: &AliasPlan, name: &str) -> Result<&'r RelationMetadata> {
    let metadata = registry.get(plan.metadata);
    metadata.find_relation(name).ok_or_else(|| {
        Error::Hydration(format!("{} has no relation \"{name}\"", metadata.name))
    })
}

/// Build records for every plan from `rows`.
///
/// Returns the loaded entities and every created record in creation order,
/// paired with its metadata, for after-load notification.
pub(crate) fn hydrate(
    registry: &MetadataRegistry,
    driver: &Driver,
    plans: &[AliasPlan],
    rows: &[Row],
) -> Result<(LoadedEntities, Vec<(EntityRef, MetadataId)>)> {
    let mut loaded = LoadedEntities::default();
    let mut created = Vec::new();
    let mut seen: HashMap<(usize, String), EntityRef> = HashMap::new();

    let Some(main) = plans.first() else {
        return Ok((loaded, created));
    };
    if main.identifier_columns_missing(registry) {
        return Err(Error::Hydration(format!(
            "primary columns of \"{}\" are not selected",
            main.alias
        )));
    }

    for row in rows {
        let mut row_refs: Vec<Option<EntityRef>> = vec![None; plans.len()];
        for (index, plan) in plans.iter().enumerate() {
            let parent = match &plan.parent {
                Some((parent_index, relation)) => match row_refs[*parent_index] {
                    Some(parent_ref) => Some((parent_ref, *parent_index, relation.as_str())),
                    None => continue,
                },
                None => None,
            };

            let Some(identifier) = plan.identifier(registry, driver, row) else {
                if let Some((parent_ref, parent_index, relation)) = parent {
                    let rel = relation_of(registry, &plans[parent_index], relation)?;
                    let record = &mut loaded.graph[parent_ref];
                    if !record.relations.contains_key(relation) {
                        let empty = if rel.relation_type.is_to_many() {
                            RelationValue::Many(Vec::new())
                        } else {
                            RelationValue::Null
                        };
                        record.set_relation(relation, empty);
                    }
                }
                continue;
            };

            let key = (index, identifier.key());
            let entity = match seen.get(&key) {
                Some(existing) => *existing,
                None => {
                    let metadata = concrete_metadata(registry, plan, row);
                    let mut record = EntityRecord::new(metadata.name.clone());
                    for (database_name, result_alias) in &plan.columns {
                        let Some(column) = metadata.find_column_by_database_name(database_name) else {
                            continue;
                        };
                        if let Some(value) = row.get_by_name(result_alias) {
                            record
                                .values
                                .insert(column.property_path.clone(), driver.prepare_hydrated_value(column, value));
                        }
                    }
                    let entity = loaded.graph.insert(record);
                    seen.insert(key, entity);
                    created.push((entity, metadata.id));
                    if index == 0 {
                        loaded.roots.push(entity);
                    }
                    entity
                }
            };
            row_refs[index] = Some(entity);

            if let Some((parent_ref, parent_index, relation)) = parent {
                let rel = relation_of(registry, &plans[parent_index], relation)?;
                if rel.relation_type.is_to_many() {
                    loaded.graph.push_related(parent_ref, relation, entity);
                } else {
                    loaded.graph.link(parent_ref, relation, entity);
                }
            }
        }
    }

    Ok((loaded, created))
}
