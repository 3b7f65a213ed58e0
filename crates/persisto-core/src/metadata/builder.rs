//! Two-phase metadata construction.
//!
//! The collect phase flattens embeds and single-table inheritance into one
//! column list per entity. The link phase resolves relation targets, join
//! columns, inverse sides and junction tables, then names indices and
//! constraints. Both phases fail with a precise error instead of leaving
//! half-resolved metadata behind.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::column::{ColumnMetadata, ColumnMode, ColumnType, Generation};
use super::entity::{
    ConstraintMetadata, EmbeddedMetadata, EntityMetadata, IndexMetadata, InheritanceMetadata,
};
use super::relation::{
    JunctionColumn, JunctionMetadata, ReferentialAction, RelationMetadata, RelationOptions,
    RelationType,
};
use super::schema::{ConstraintOptions, EmbeddableSchema, EmbeddedOptions, IndexOptions, MetadataArgs};
use super::{MetadataId, MetadataRegistry};
use crate::error::{ConfigErrorKind, Error, MetadataErrorKind, Result};
use crate::identifiers::hash_alias;

const DEFAULT_DISCRIMINATOR_COLUMN: &str = "type";
const CONSTRAINT_HASH_LENGTH: usize = 26;

/// Convert an entity name to its default table name.
///
/// ```
/// use persisto_core::metadata::snake_case;
///
/// assert_eq!(snake_case("UserProfile"), "user_profile");
/// assert_eq!(snake_case("HTMLPage"), "html_page");
/// ```
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|c| c.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.extend(ch.to_lowercase());
    }
    out
}

/// Entity under construction plus the options the link phase still needs.
struct Draft {
    metadata: EntityMetadata,
    chain: Vec<usize>,
    relation_options: Vec<RelationOptions>,
    index_options: Vec<IndexOptions>,
    check_options: Vec<ConstraintOptions>,
    exclusion_options: Vec<ConstraintOptions>,
}

/// Build and validate the metadata registry.
#[tracing::instrument(level = "debug", skip(args), fields(entities = args.entities.len()))]
pub fn build_metadata(args: &MetadataArgs) -> Result<MetadataRegistry> {
    let mut names: HashMap<&str, usize> = HashMap::new();
    for (i, schema) in args.entities.iter().enumerate() {
        if names.insert(schema.name.as_str(), i).is_some() {
            return Err(Error::config(
                ConfigErrorKind::DuplicateEntity,
                format!("entity \"{}\" is registered more than once", schema.name),
            ));
        }
    }
    let embeddables: HashMap<&str, &EmbeddableSchema> = args
        .embeddables
        .iter()
        .map(|e| (e.name.as_str(), e))
        .collect();

    let mut drafts = Vec::with_capacity(args.entities.len());
    for i in 0..args.entities.len() {
        let chain = inheritance_chain(args, &names, i)?;
        drafts.push(collect(args, &embeddables, i, chain)?);
    }
    assign_discriminators(args, &mut drafts)?;
    for draft in &drafts {
        validate_columns(&draft.metadata)?;
    }

    link_relations(&names, &mut drafts)?;
    resolve_inverse_sides(&mut drafts)?;
    link_junctions(&mut drafts);
    for draft in &mut drafts {
        resolve_constraints(draft)?;
    }

    let entities: Vec<EntityMetadata> = drafts.into_iter().map(|d| d.metadata).collect();
    debug!(count = entities.len(), "Entity metadata built");
    Ok(MetadataRegistry::from_entities(entities))
}

/// Indices of the inheritance chain of `index`, root first.
fn inheritance_chain(args: &MetadataArgs, names: &HashMap<&str, usize>, index: usize) -> Result<Vec<usize>> {
    let mut chain = vec![index];
    let mut current = index;
    while let Some(parent) = &args.entities[current].parent {
        let parent_index = *names.get(parent.as_str()).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnresolvedParent,
                &args.entities[index].name,
                format!("parent entity \"{parent}\" is not registered"),
            )
        })?;
        if chain.contains(&parent_index) {
            return Err(Error::config(
                ConfigErrorKind::InvalidOption,
                format!("inheritance of \"{}\" is cyclic", args.entities[index].name),
            ));
        }
        chain.push(parent_index);
        current = parent_index;
    }
    chain.reverse();
    Ok(chain)
}

fn collect(
    args: &MetadataArgs,
    embeddables: &HashMap<&str, &EmbeddableSchema>,
    index: usize,
    chain: Vec<usize>,
) -> Result<Draft> {
    let schema = &args.entities[index];
    let root = &args.entities[chain[0]];

    let mut columns = Vec::new();
    let mut embeddeds = Vec::new();
    let mut relation_options = Vec::new();
    let mut index_options = Vec::new();
    let mut check_options = Vec::new();
    let mut exclusion_options = Vec::new();
    let mut listeners = Vec::new();

    for &link in &chain {
        let member = &args.entities[link];
        columns.extend(
            member
                .columns
                .iter()
                .map(|c| ColumnMetadata::from_options(c, "", "")),
        );
        for embedded in &member.embeddeds {
            let mut visiting = Vec::new();
            expand_embedded(
                &schema.name,
                embeddables,
                embedded,
                "",
                "",
                &mut visiting,
                &mut columns,
                &mut embeddeds,
            )?;
        }
        relation_options.extend(member.relations.iter().cloned());
        index_options.extend(member.indices.iter().cloned());
        check_options.extend(member.checks.iter().cloned());
        exclusion_options.extend(member.exclusions.iter().cloned());
        listeners.extend(member.listeners.iter().cloned());
    }

    let mut seen = HashSet::new();
    for column in &columns {
        if !seen.insert(column.property_path.as_str()) {
            return Err(Error::config(
                ConfigErrorKind::InvalidOption,
                format!(
                    "entity \"{}\" declares property \"{}\" twice",
                    schema.name, column.property_path
                ),
            ));
        }
    }

    let metadata = EntityMetadata {
        id: MetadataId(index),
        name: schema.name.clone(),
        table_name: root
            .table_name
            .clone()
            .unwrap_or_else(|| snake_case(&root.name)),
        schema: root.schema.clone(),
        database: root.database.clone(),
        columns,
        relations: Vec::new(),
        embeddeds,
        indices: Vec::new(),
        checks: Vec::new(),
        exclusions: Vec::new(),
        inheritance: InheritanceMetadata::default(),
        listeners,
    };

    Ok(Draft {
        metadata,
        chain,
        relation_options,
        index_options,
        check_options,
        exclusion_options,
    })
}

#[allow(clippy::too_many_arguments)]
fn expand_embedded(
    entity: &str,
    embeddables: &HashMap<&str, &EmbeddableSchema>,
    options: &EmbeddedOptions,
    path_prefix: &str,
    name_prefix: &str,
    visiting: &mut Vec<String>,
    columns: &mut Vec<ColumnMetadata>,
    embeddeds: &mut Vec<EmbeddedMetadata>,
) -> Result<()> {
    let embeddable = embeddables
        .get(options.embeddable.as_str())
        .ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnresolvedEmbedded,
                entity,
                format!("embeddable \"{}\" is not registered", options.embeddable),
            )
        })?;
    if visiting.contains(&embeddable.name) {
        return Err(Error::config(
            ConfigErrorKind::InvalidOption,
            format!("embeddable \"{}\" embeds itself", embeddable.name),
        ));
    }
    visiting.push(embeddable.name.clone());

    let own_prefix = options
        .prefix
        .clone()
        .unwrap_or_else(|| format!("{}_", options.property_name));
    let name_prefix = format!("{name_prefix}{own_prefix}");
    let property_path = format!("{path_prefix}{}", options.property_name);
    let path_prefix = format!("{property_path}.");

    embeddeds.push(EmbeddedMetadata {
        property_name: options.property_name.clone(),
        property_path,
        embeddable: embeddable.name.clone(),
        prefix: name_prefix.clone(),
    });
    columns.extend(
        embeddable
            .columns
            .iter()
            .map(|c| ColumnMetadata::from_options(c, &path_prefix, &name_prefix)),
    );
    for nested in &embeddable.embeddeds {
        expand_embedded(
            entity,
            embeddables,
            nested,
            &path_prefix,
            &name_prefix,
            visiting,
            columns,
            embeddeds,
        )?;
    }
    visiting.pop();
    Ok(())
}

fn assign_discriminators(args: &MetadataArgs, drafts: &mut [Draft]) -> Result<()> {
    let has_children: HashSet<usize> = drafts
        .iter()
        .filter(|d| d.chain.len() > 1)
        .flat_map(|d| d.chain[..d.chain.len() - 1].iter().copied())
        .collect();

    for i in 0..drafts.len() {
        let root = drafts[i].chain[0];
        let in_tree = drafts[i].chain.len() > 1
            || has_children.contains(&i)
            || args.entities[i].discriminator_column.is_some();
        if !in_tree {
            continue;
        }
        let column_name = args.entities[root]
            .discriminator_column
            .clone()
            .unwrap_or_else(|| DEFAULT_DISCRIMINATOR_COLUMN.to_string());
        let draft = &mut drafts[i];
        match draft
            .metadata
            .columns
            .iter_mut()
            .find(|c| c.database_name == column_name)
        {
            Some(existing) => existing.mode = ColumnMode::Discriminator,
            None => draft.metadata.columns.push(ColumnMetadata {
                property_name: column_name.clone(),
                property_path: column_name.clone(),
                database_name: column_name,
                column_type: ColumnType::Varchar(255),
                nullable: false,
                is_primary: false,
                generation: Generation::None,
                default: None,
                mode: ColumnMode::Discriminator,
                transformer: None,
                relation: None,
                referenced_column: None,
            }),
        }
        let chain = &draft.chain;
        draft.metadata.inheritance = InheritanceMetadata {
            parent: (chain.len() > 1).then(|| MetadataId(chain[chain.len() - 2])),
            root: Some(MetadataId(root)),
            ancestors: chain[..chain.len() - 1]
                .iter()
                .map(|&a| args.entities[a].name.clone())
                .collect(),
            discriminator_value: Some(
                args.entities[i]
                    .discriminator_value
                    .clone()
                    .unwrap_or_else(|| args.entities[i].name.clone()),
            ),
            tree_discriminator_values: Vec::new(),
        };
    }

    let mut by_root: HashMap<usize, HashMap<String, String>> = HashMap::new();
    for draft in drafts.iter() {
        let Some(value) = &draft.metadata.inheritance.discriminator_value else {
            continue;
        };
        let seen = by_root.entry(draft.chain[0]).or_default();
        if let Some(other) = seen.insert(value.clone(), draft.metadata.name.clone()) {
            return Err(Error::config(
                ConfigErrorKind::AmbiguousDiscriminator,
                format!(
                    "entities \"{other}\" and \"{}\" share discriminator value \"{value}\"",
                    draft.metadata.name
                ),
            ));
        }
    }

    for i in 0..drafts.len() {
        if drafts[i].metadata.inheritance.root.is_none() {
            continue;
        }
        let values: Vec<String> = drafts
            .iter()
            .filter(|d| d.chain.contains(&i))
            .filter_map(|d| d.metadata.inheritance.discriminator_value.clone())
            .collect();
        drafts[i].metadata.inheritance.tree_discriminator_values = values;
    }
    Ok(())
}

fn validate_columns(metadata: &EntityMetadata) -> Result<()> {
    let mut primary = 0;
    for column in metadata.primary_columns() {
        primary += 1;
        if column.nullable {
            return Err(Error::config(
                ConfigErrorKind::NullablePrimaryColumn,
                format!(
                    "primary column \"{}\" of \"{}\" cannot be nullable",
                    column.property_path, metadata.name
                ),
            ));
        }
    }
    if primary == 0 {
        return Err(Error::config(
            ConfigErrorKind::MissingPrimaryColumn,
            format!("entity \"{}\" has no primary column", metadata.name),
        ));
    }
    for mode in [ColumnMode::Version, ColumnMode::DeleteDate] {
        if metadata.columns.iter().filter(|c| c.mode == mode).count() > 1 {
            return Err(Error::config(
                ConfigErrorKind::InvalidOption,
                format!("entity \"{}\" declares more than one {mode:?} column", metadata.name),
            ));
        }
    }
    Ok(())
}

fn target_index(names: &HashMap<&str, usize>, entity: &str, options: &RelationOptions) -> Result<usize> {
    names.get(options.target.as_str()).copied().ok_or_else(|| {
        Error::metadata(
            MetadataErrorKind::UnresolvedTarget,
            entity,
            format!(
                "relation \"{}\" targets unregistered entity \"{}\"",
                options.property_name, options.target
            ),
        )
    })
}

/// Whether a relation stores join columns on its own side.
fn owns_join_columns(options: &RelationOptions, target_options: &[RelationOptions]) -> bool {
    match options.relation_type {
        RelationType::ManyToOne => true,
        RelationType::OneToOne => {
            if !options.join_columns.is_empty() {
                return true;
            }
            let inverse_owns = options.inverse_side.as_deref().is_some_and(|inverse| {
                target_options
                    .iter()
                    .any(|o| o.property_name == inverse && !o.join_columns.is_empty())
            });
            !inverse_owns
        }
        RelationType::OneToMany | RelationType::ManyToMany => false,
    }
}

/// Whether a many-to-many relation owns its junction table.
fn owns_junction(entity: &str, options: &RelationOptions, target: &str, target_options: &[RelationOptions]) -> bool {
    if options.join_table.is_some() {
        return true;
    }
    let Some(inverse) = options.inverse_side.as_deref() else {
        return true;
    };
    match target_options.iter().find(|o| o.property_name == inverse) {
        Some(other) if other.join_table.is_some() => false,
        Some(other) => (entity, options.property_name.as_str()) < (target, other.property_name.as_str()),
        None => true,
    }
}

fn link_relations(names: &HashMap<&str, usize>, drafts: &mut [Draft]) -> Result<()> {
    for i in 0..drafts.len() {
        let options = drafts[i].relation_options.clone();
        for opt in &options {
            let entity_name = drafts[i].metadata.name.clone();
            let target = target_index(names, &entity_name, opt)?;
            if opt.eager && opt.lazy {
                return Err(Error::config(
                    ConfigErrorKind::InvalidOption,
                    format!(
                        "relation \"{entity_name}.{}\" cannot be both eager and lazy",
                        opt.property_name
                    ),
                ));
            }
            let relation_index = drafts[i].metadata.relations.len();
            let mut relation = RelationMetadata {
                property_name: opt.property_name.clone(),
                relation_type: opt.relation_type,
                target: opt.target.clone(),
                target_id: MetadataId(target),
                inverse_side: opt.inverse_side.clone(),
                inverse_relation: None,
                cascade: opt.cascade,
                on_delete: opt.on_delete.unwrap_or_default(),
                on_update: opt.on_update,
                nullable: opt.nullable,
                eager: opt.eager,
                lazy: opt.lazy,
                orphaned_row_action: opt.orphaned_row_action,
                persistence: opt.persistence,
                deferrable: opt.deferrable,
                join_columns: Vec::new(),
                junction: None,
            };

            if owns_join_columns(opt, &drafts[target].relation_options) {
                let referenced: Vec<(String, String, ColumnType)> = drafts[target]
                    .metadata
                    .primary_columns()
                    .map(|c| (c.property_path.clone(), c.database_name.clone(), c.column_type))
                    .collect();
                if !opt.join_columns.is_empty() && opt.join_columns.len() != referenced.len() {
                    return Err(Error::config(
                        ConfigErrorKind::InvalidOption,
                        format!(
                            "relation \"{entity_name}.{}\" declares {} join column(s) but \"{}\" has {} primary column(s)",
                            opt.property_name,
                            opt.join_columns.len(),
                            opt.target,
                            referenced.len()
                        ),
                    ));
                }
                for (k, (path, db_name, column_type)) in referenced.into_iter().enumerate() {
                    let name = opt
                        .join_columns
                        .get(k)
                        .cloned()
                        .unwrap_or_else(|| format!("{}_{db_name}", opt.property_name));
                    let columns = &mut drafts[i].metadata.columns;
                    let column_index = match columns.iter().position(|c| c.database_name == name) {
                        Some(existing) => {
                            columns[existing].relation = Some(relation_index);
                            columns[existing].referenced_column = Some(path);
                            existing
                        }
                        None => {
                            columns.push(ColumnMetadata {
                                property_name: name.clone(),
                                property_path: name.clone(),
                                database_name: name,
                                column_type,
                                nullable: opt.nullable,
                                is_primary: false,
                                generation: Generation::None,
                                default: None,
                                mode: ColumnMode::Regular,
                                transformer: None,
                                relation: Some(relation_index),
                                referenced_column: Some(path),
                            });
                            columns.len() - 1
                        }
                    };
                    relation.join_columns.push(column_index);
                }
            }
            drafts[i].metadata.relations.push(relation);
        }
    }
    Ok(())
}

fn resolve_inverse_sides(drafts: &mut [Draft]) -> Result<()> {
    for i in 0..drafts.len() {
        for r in 0..drafts[i].metadata.relations.len() {
            let relation = &drafts[i].metadata.relations[r];
            let Some(inverse) = relation.inverse_side.clone() else {
                continue;
            };
            let target = relation.target_id.0;
            let relation_type = relation.relation_type;
            let chain = &drafts[i].chain;
            let found = drafts[target]
                .metadata
                .relations
                .iter()
                .position(|o| o.property_name == inverse && chain.contains(&o.target_id.0));
            let compatible = found.is_some_and(|j| {
                let other = drafts[target].metadata.relations[j].relation_type;
                matches!(
                    (relation_type, other),
                    (RelationType::OneToMany, RelationType::ManyToOne)
                        | (RelationType::ManyToOne, RelationType::OneToMany)
                        | (RelationType::OneToOne, RelationType::OneToOne)
                        | (RelationType::ManyToMany, RelationType::ManyToMany)
                )
            });
            if !compatible {
                return Err(Error::metadata(
                    MetadataErrorKind::UnresolvedInverseSide,
                    &drafts[i].metadata.name,
                    format!(
                        "relation \"{}\" names inverse side \"{inverse}\" which is not a matching relation on \"{}\"",
                        drafts[i].metadata.relations[r].property_name, drafts[target].metadata.name
                    ),
                ));
            }
            drafts[i].metadata.relations[r].inverse_relation = found;
        }
    }

    // Back-link sides that did not name their inverse.
    for i in 0..drafts.len() {
        for r in 0..drafts[i].metadata.relations.len() {
            let relation = &drafts[i].metadata.relations[r];
            let (Some(j), target) = (relation.inverse_relation, relation.target_id.0) else {
                continue;
            };
            let other = &drafts[target].metadata.relations[j];
            if other.inverse_relation.is_none() && other.target_id.0 == i {
                drafts[target].metadata.relations[j].inverse_relation = Some(r);
            }
        }
    }
    Ok(())
}

fn junction_columns(table: &str, metadata: &EntityMetadata, explicit: Option<&String>) -> Vec<JunctionColumn> {
    let primary: Vec<&ColumnMetadata> = metadata.primary_columns().collect();
    primary
        .iter()
        .map(|c| JunctionColumn {
            database_name: match explicit {
                Some(name) if primary.len() == 1 => name.clone(),
                _ => format!("{table}_{}", c.database_name),
            },
            referenced_column: c.property_path.clone(),
        })
        .collect()
}

fn link_junctions(drafts: &mut [Draft]) {
    // Owners first, so inverse sides can mirror them.
    for i in 0..drafts.len() {
        for r in 0..drafts[i].metadata.relations.len() {
            let relation = &drafts[i].metadata.relations[r];
            if !relation.is_many_to_many() {
                continue;
            }
            let target = relation.target_id.0;
            let Some(opt) = drafts[i]
                .relation_options
                .iter()
                .find(|o| o.property_name == relation.property_name)
            else {
                continue;
            };
            if !owns_junction(
                &drafts[i].metadata.name,
                opt,
                &drafts[target].metadata.name,
                &drafts[target].relation_options,
            ) {
                continue;
            }
            let owner = &drafts[i].metadata;
            let target_meta = &drafts[target].metadata;
            let join_table = opt.join_table.clone().unwrap_or_default();
            let table_name = join_table.name.clone().unwrap_or_else(|| {
                format!(
                    "{}_{}_{}",
                    owner.table_name, relation.property_name, target_meta.table_name
                )
            });
            let mut owner_columns =
                junction_columns(&owner.table_name, owner, join_table.join_column.as_ref());
            let mut inverse_columns = junction_columns(
                &target_meta.table_name,
                target_meta,
                join_table.inverse_join_column.as_ref(),
            );
            let collides = owner_columns
                .iter()
                .any(|o| inverse_columns.iter().any(|c| c.database_name == o.database_name));
            if collides {
                for c in &mut owner_columns {
                    c.database_name.push_str("_1");
                }
                for c in &mut inverse_columns {
                    c.database_name.push_str("_2");
                }
            }
            let junction = JunctionMetadata {
                table_name,
                owner_columns,
                inverse_columns,
                on_delete: opt.on_delete.unwrap_or(ReferentialAction::Cascade),
            };
            drafts[i].metadata.relations[r].junction = Some(junction);
        }
    }

    for i in 0..drafts.len() {
        for r in 0..drafts[i].metadata.relations.len() {
            let relation = &drafts[i].metadata.relations[r];
            if !relation.is_many_to_many() || relation.junction.is_some() {
                continue;
            }
            let Some(j) = relation.inverse_relation else {
                continue;
            };
            let target = relation.target_id.0;
            let Some(owner_junction) = drafts[target].metadata.relations[j].junction.clone() else {
                continue;
            };
            drafts[i].metadata.relations[r].junction = Some(JunctionMetadata {
                table_name: owner_junction.table_name,
                owner_columns: owner_junction.inverse_columns,
                inverse_columns: owner_junction.owner_columns,
                on_delete: owner_junction.on_delete,
            });
        }
    }
}

fn resolve_constraints(draft: &mut Draft) -> Result<()> {
    let metadata = &mut draft.metadata;
    for options in &draft.index_options {
        let mut column_names = Vec::with_capacity(options.columns.len());
        for path in &options.columns {
            let column = metadata
                .find_column(path)
                .or_else(|| metadata.find_column_by_database_name(path))
                .ok_or_else(|| {
                    Error::metadata(
                        MetadataErrorKind::UnknownProperty,
                        &metadata.name,
                        format!("index references unknown property \"{path}\""),
                    )
                })?;
            column_names.push(column.database_name.clone());
        }
        let prefix = if options.unique { "UQ_" } else { "IDX_" };
        let name = options.name.clone().unwrap_or_else(|| {
            let mut key = format!("{}_{}", metadata.table_name, column_names.join("_"));
            if let Some(clause) = &options.where_clause {
                key.push('_');
                key.push_str(clause);
            }
            format!("{prefix}{}", hash_alias(&key, CONSTRAINT_HASH_LENGTH))
        });
        metadata.indices.push(IndexMetadata {
            name,
            column_names,
            unique: options.unique,
            where_clause: options.where_clause.clone(),
        });
    }
    metadata.checks = constraint_metadata(&metadata.table_name, "CHK_", &draft.check_options);
    metadata.exclusions = constraint_metadata(&metadata.table_name, "XCL_", &draft.exclusion_options);
    Ok(())
}

fn constraint_metadata(table: &str, prefix: &str, options: &[ConstraintOptions]) -> Vec<ConstraintMetadata> {
    options
        .iter()
        .map(|o| ConstraintMetadata {
            name: o.name.clone().unwrap_or_else(|| {
                format!(
                    "{prefix}{}",
                    hash_alias(&format!("{table}_{}", o.expression), CONSTRAINT_HASH_LENGTH)
                )
            }),
            expression: o.expression.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        Cascade, ColumnOptions, EmbeddableSchema, EntitySchema, JoinTableOptions, RelationOptions,
    };

    fn user() -> EntitySchema {
        EntitySchema::new("User")
            .column(ColumnOptions::primary_generated("id"))
            .column(ColumnOptions::new("name", ColumnType::Text))
            .relation(RelationOptions::one_to_many("posts", "Post", "author"))
    }

    fn post() -> EntitySchema {
        EntitySchema::new("Post")
            .column(ColumnOptions::primary_generated("id"))
            .column(ColumnOptions::new("title", ColumnType::Text))
            .relation(RelationOptions::many_to_one("author", "User"))
            .relation(
                RelationOptions::many_to_many("categories", "Category")
                    .join_table(JoinTableOptions::default())
                    .cascade(Cascade::SAVE),
            )
    }

    fn category() -> EntitySchema {
        EntitySchema::new("Category")
            .column(ColumnOptions::primary_generated("id"))
            .relation(RelationOptions::many_to_many("posts", "Post").inverse_side("categories"))
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("Post"), "post");
        assert_eq!(snake_case("OrderItem"), "order_item");
        assert_eq!(snake_case("item2Value"), "item2_value");
    }

    #[test]
    fn test_default_join_column_and_inverse_link() {
        let args = MetadataArgs::new().entity(user()).entity(post()).entity(category());
        let registry = build_metadata(&args).unwrap();

        let post = registry.by_name("Post").unwrap();
        let author = post.find_relation("author").unwrap();
        assert!(author.is_join_column_owner());
        let fk = &post.columns[author.join_columns[0]];
        assert_eq!(fk.database_name, "author_id");
        assert_eq!(fk.referenced_column.as_deref(), Some("id"));
        assert!(fk.nullable);

        let user = registry.by_name("User").unwrap();
        let posts = user.find_relation("posts").unwrap();
        assert_eq!(registry.inverse_of(posts).unwrap().property_name, "author");
        assert_eq!(registry.inverse_of(author).unwrap().property_name, "posts");
    }

    #[test]
    fn test_junction_defaults_and_mirror() {
        let args = MetadataArgs::new().entity(user()).entity(post()).entity(category());
        let registry = build_metadata(&args).unwrap();

        let post = registry.by_name("Post").unwrap();
        let junction = post.find_relation("categories").unwrap().junction.clone().unwrap();
        assert_eq!(junction.table_name, "post_categories_category");
        assert_eq!(junction.owner_columns[0].database_name, "post_id");
        assert_eq!(junction.inverse_columns[0].database_name, "category_id");
        assert_eq!(junction.on_delete, ReferentialAction::Cascade);

        let category = registry.by_name("Category").unwrap();
        let mirrored = category.find_relation("posts").unwrap().junction.clone().unwrap();
        assert_eq!(mirrored.table_name, "post_categories_category");
        assert_eq!(mirrored.owner_columns[0].database_name, "category_id");
        assert_eq!(mirrored.inverse_columns[0].database_name, "post_id");
    }

    #[test]
    fn test_self_referencing_junction_columns_are_distinct() {
        let args = MetadataArgs::new().entity(
            EntitySchema::new("Person")
                .column(ColumnOptions::primary_generated("id"))
                .relation(RelationOptions::many_to_many("friends", "Person").join_table(JoinTableOptions::default())),
        );
        let registry = build_metadata(&args).unwrap();
        let junction = registry
            .by_name("Person")
            .unwrap()
            .find_relation("friends")
            .unwrap()
            .junction
            .clone()
            .unwrap();
        assert_eq!(junction.owner_columns[0].database_name, "person_id_1");
        assert_eq!(junction.inverse_columns[0].database_name, "person_id_2");
    }

    #[test]
    fn test_embedded_columns_are_prefixed() {
        let args = MetadataArgs::new()
            .embeddable(
                EmbeddableSchema::new("Address")
                    .column(ColumnOptions::new("city", ColumnType::Text))
                    .column(ColumnOptions::new("zip", ColumnType::Text)),
            )
            .entity(
                EntitySchema::new("Customer")
                    .column(ColumnOptions::primary_generated("id"))
                    .embedded("address", "Address")
                    .embedded_with_prefix("billing", "Address", "bill_"),
            );
        let registry = build_metadata(&args).unwrap();
        let customer = registry.by_name("Customer").unwrap();
        assert_eq!(customer.find_column("address.city").unwrap().database_name, "address_city");
        assert_eq!(customer.find_column("billing.zip").unwrap().database_name, "bill_zip");
        assert_eq!(customer.embeddeds.len(), 2);
    }

    #[test]
    fn test_single_table_inheritance() {
        let args = MetadataArgs::new()
            .entity(
                EntitySchema::new("Content")
                    .column(ColumnOptions::primary_generated("id"))
                    .column(ColumnOptions::new("title", ColumnType::Text)),
            )
            .entity(
                EntitySchema::new("Photo")
                    .extends("Content")
                    .column(ColumnOptions::new("size", ColumnType::Int).nullable()),
            )
            .entity(EntitySchema::new("Video").extends("Content").discriminator_value("vid"));
        let registry = build_metadata(&args).unwrap();

        let photo = registry.by_name("Photo").unwrap();
        assert_eq!(photo.table_name, "content");
        assert!(photo.find_column("title").is_some());
        assert_eq!(photo.discriminator_column().unwrap().database_name, "type");
        assert_eq!(photo.inheritance.discriminator_value.as_deref(), Some("Photo"));

        let content = registry.by_name("Content").unwrap();
        assert_eq!(
            content.inheritance.tree_discriminator_values,
            vec!["Content".to_string(), "Photo".to_string(), "vid".to_string()]
        );
    }

    #[test]
    fn test_validation_errors() {
        let args = MetadataArgs::new().entity(EntitySchema::new("NoKey").column(ColumnOptions::new("x", ColumnType::Int)));
        assert_eq!(
            build_metadata(&args).unwrap_err().config_kind(),
            Some(ConfigErrorKind::MissingPrimaryColumn)
        );

        let args = MetadataArgs::new().entity(
            EntitySchema::new("Bad").column(ColumnOptions::new("id", ColumnType::Int).primary().nullable()),
        );
        assert_eq!(
            build_metadata(&args).unwrap_err().config_kind(),
            Some(ConfigErrorKind::NullablePrimaryColumn)
        );

        let args = MetadataArgs::new()
            .entity(EntitySchema::new("A").column(ColumnOptions::primary_generated("id")))
            .entity(EntitySchema::new("A").column(ColumnOptions::primary_generated("id")));
        assert_eq!(
            build_metadata(&args).unwrap_err().config_kind(),
            Some(ConfigErrorKind::DuplicateEntity)
        );

        let args = MetadataArgs::new()
            .entity(EntitySchema::new("Base").column(ColumnOptions::primary_generated("id")))
            .entity(EntitySchema::new("X").extends("Base").discriminator_value("same"))
            .entity(EntitySchema::new("Y").extends("Base").discriminator_value("same"));
        assert_eq!(
            build_metadata(&args).unwrap_err().config_kind(),
            Some(ConfigErrorKind::AmbiguousDiscriminator)
        );
    }

    #[test]
    fn test_unresolved_references() {
        let args = MetadataArgs::new().entity(
            EntitySchema::new("Post")
                .column(ColumnOptions::primary_generated("id"))
                .relation(RelationOptions::many_to_one("author", "Ghost")),
        );
        assert!(matches!(
            build_metadata(&args),
            Err(Error::Metadata(e)) if e.kind == MetadataErrorKind::UnresolvedTarget
        ));

        let args = MetadataArgs::new().entity(user()).entity(
            EntitySchema::new("Post")
                .column(ColumnOptions::primary_generated("id"))
                .relation(RelationOptions::many_to_one("writer", "User")),
        );
        assert!(matches!(
            build_metadata(&args),
            Err(Error::Metadata(e)) if e.kind == MetadataErrorKind::UnresolvedInverseSide
        ));
    }

    #[test]
    fn test_index_names_are_stable() {
        let schema = || {
            EntitySchema::new("Account")
                .column(ColumnOptions::primary_generated("id"))
                .column(ColumnOptions::new("email", ColumnType::Text))
                .unique(["email"])
                .check("\"id\" > 0")
        };
        let a = build_metadata(&MetadataArgs::new().entity(schema())).unwrap();
        let b = build_metadata(&MetadataArgs::new().entity(schema())).unwrap();
        let ia = &a.by_name("Account").unwrap().indices[0];
        assert!(ia.name.starts_with("UQ_"));
        assert_eq!(ia.name.len(), 3 + CONSTRAINT_HASH_LENGTH);
        assert_eq!(ia.name, b.by_name("Account").unwrap().indices[0].name);
        assert!(a.by_name("Account").unwrap().checks[0].name.starts_with("CHK_"));
    }
}
