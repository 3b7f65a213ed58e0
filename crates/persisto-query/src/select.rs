//! SELECT query builder over entity metadata.
//!
//! Conditions and sort expressions may reference `alias.property`; these are
//! rewritten to escaped `"alias"."column"` pairs when the statement is
//! rendered. Selected entity columns are aliased `alias_column`, and join
//! aliases built for relation paths are `parentAlias_relation`. Both go
//! through the driver's identifier length limit.
//!
//! Rows whose delete-date column is set are excluded unless
//! [`SelectQueryBuilder::with_deleted`] is called, and an entity that is a
//! child in a single-table hierarchy only sees rows of its own discriminator
//! values.

use std::collections::HashSet;

use asupersync::{Cx, Outcome};
use persisto_core::metadata::{ColumnMetadata, ListenerKind};
use persisto_core::{
    BuilderErrorKind, Connection, Driver, EntityEvent, EntityIdentifier, EntityMetadata, Error,
    MetadataId, MetadataRegistry, QueryRunner, Result, Row, Value, build_alias, build_path_alias, try_outcome,
    try_result,
};
use tracing::debug;

use crate::builder::entity_ids_expr;
use crate::clause::{Condition, OrderBy, OrderDirection, WhereClauses};
use crate::expr::{ColumnResolver, Expr, RenderContext};
use crate::hydrate::{AliasPlan, LoadedEntities, hydrate};
use crate::join::{JoinAttribute, JoinTarget, JoinType};
use crate::params::{ParameterSink, Parameters};

const COUNT_ALIAS: &str = "cnt";
const DISTINCT_ALIAS: &str = "distinctAlias";

/// Fluent SELECT builder.
#[derive(Debug, Clone)]
pub struct SelectQueryBuilder<'r> {
    registry: &'r MetadataRegistry,
    driver: Driver,
    main_alias: String,
    main: MetadataId,
    joins: Vec<JoinAttribute>,
    selects: Vec<String>,
    distinct: bool,
    wheres: WhereClauses,
    havings: WhereClauses,
    group_bys: Vec<String>,
    order_bys: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    take: Option<u64>,
    skip: Option<u64>,
    parameters: Parameters,
    with_deleted: bool,
    call_listeners: bool,
    pending_error: Option<(BuilderErrorKind, String)>,
}

/// Parts of a statement that differ between data, id and count queries.
struct Shape {
    select: Option<String>,
    ids: Option<Expr>,
    ordered: bool,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl<'r> SelectQueryBuilder<'r> {
    /// Start a query over `entity`, selecting it under `alias`.
    pub fn new(registry: &'r MetadataRegistry, driver: &Driver, entity: &str, alias: &str) -> Result<Self> {
        let metadata = registry.by_name(entity)?;
        Ok(Self::for_metadata(registry, driver, metadata, alias))
    }

    pub fn for_metadata(
        registry: &'r MetadataRegistry,
        driver: &Driver,
        metadata: &EntityMetadata,
        alias: &str,
    ) -> Self {
        Self {
            registry,
            driver: driver.clone(),
            main_alias: alias.to_string(),
            main: metadata.id,
            joins: Vec::new(),
            selects: vec![alias.to_string()],
            distinct: false,
            wheres: WhereClauses::new(),
            havings: WhereClauses::new(),
            group_bys: Vec::new(),
            order_bys: Vec::new(),
            limit: None,
            offset: None,
            take: None,
            skip: None,
            parameters: Parameters::new(),
            with_deleted: false,
            call_listeners: true,
            pending_error: None,
        }
    }

    pub fn alias(&self) -> &str {
        &self.main_alias
    }

    pub fn metadata(&self) -> &'r EntityMetadata {
        self.registry.get(self.main)
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn fail(&mut self, kind: BuilderErrorKind, message: String) {
        if self.pending_error.is_none() {
            self.pending_error = Some((kind, message));
        }
    }

    /// Replace the selection. Items are aliases, `alias.property` or raw SQL.
    pub fn select(mut self, items: &[&str]) -> Self {
        self.selects = items.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn add_select(mut self, item: impl Into<String>) -> Self {
        self.selects.push(item.into());
        self
    }

    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Replace every WHERE condition.
    pub fn where_(mut self, condition: impl Into<Condition>) -> Self {
        self.wheres.where_(condition);
        self
    }

    pub fn and_where(mut self, condition: impl Into<Condition>) -> Self {
        self.wheres.and_where(condition);
        self
    }

    pub fn or_where(mut self, condition: impl Into<Condition>) -> Self {
        self.wheres.or_where(condition);
        self
    }

    fn ids_condition(&self, ids: &[EntityIdentifier]) -> Expr {
        entity_ids_expr(&self.driver, self.metadata(), Some(&self.main_alias), ids)
    }

    /// Replace every WHERE condition with an identifier match.
    pub fn where_in_ids(self, ids: &[EntityIdentifier]) -> Self {
        let condition = self.ids_condition(ids);
        self.where_(condition)
    }

    pub fn and_where_in_ids(self, ids: &[EntityIdentifier]) -> Self {
        let condition = self.ids_condition(ids);
        self.and_where(condition)
    }

    pub fn or_where_in_ids(self, ids: &[EntityIdentifier]) -> Self {
        let condition = self.ids_condition(ids);
        self.or_where(condition)
    }

    /// Join `parent.relation` (or an entity name) under `alias`.
    pub fn join(
        mut self,
        join_type: JoinType,
        path: &str,
        alias: &str,
        condition: Option<Condition>,
        select: bool,
    ) -> Self {
        if self.alias_metadata(alias).is_some() {
            self.fail(
                BuilderErrorKind::DuplicateAlias,
                format!("alias \"{alias}\" is already used"),
            );
            return self;
        }
        let (target, metadata) = match path.split_once('.') {
            Some((parent_alias, relation)) => {
                let Some(parent) = self.alias_metadata(parent_alias) else {
                    self.fail(
                        BuilderErrorKind::UnknownAlias,
                        format!("unknown alias \"{parent_alias}\" in join path \"{path}\""),
                    );
                    return self;
                };
                let Some(rel) = parent.find_relation(relation) else {
                    let message = format!("{} has no relation \"{relation}\"", parent.name);
                    self.fail(BuilderErrorKind::UnknownRelation, message);
                    return self;
                };
                (
                    JoinTarget::Relation {
                        parent_alias: parent_alias.to_string(),
                        relation: relation.to_string(),
                    },
                    rel.target_id,
                )
            }
            None => match self.registry.find(path) {
                Some(entity) => (JoinTarget::Entity, entity.id),
                None => {
                    self.fail(
                        BuilderErrorKind::UnknownAlias,
                        format!("\"{path}\" is neither a relation path nor an entity"),
                    );
                    return self;
                }
            },
        };
        self.joins.push(JoinAttribute {
            join_type,
            alias: alias.to_string(),
            target,
            metadata,
            condition,
            select,
        });
        if select {
            self.selects.push(alias.to_string());
        }
        self
    }

    pub fn left_join(self, path: &str, alias: &str) -> Self {
        self.join(JoinType::Left, path, alias, None, false)
    }

    pub fn left_join_and_select(self, path: &str, alias: &str) -> Self {
        self.join(JoinType::Left, path, alias, None, true)
    }

    pub fn inner_join(self, path: &str, alias: &str) -> Self {
        self.join(JoinType::Inner, path, alias, None, false)
    }

    pub fn inner_join_and_select(self, path: &str, alias: &str) -> Self {
        self.join(JoinType::Inner, path, alias, None, true)
    }

    /// Alias used for joins created from relation paths (`user__profile`).
    pub fn relation_alias(&self, parent_alias: &str, relation: &str) -> String {
        build_path_alias(self.driver.alias_options(), &[parent_alias, relation])
    }

    /// Left-join-and-select a dotted relation path (`author.profile`) from
    /// the main alias, reusing joins that already exist. Returns the alias
    /// of the last segment.
    pub fn join_relation_path(mut self, path: &str) -> (Self, String) {
        let mut parent = self.main_alias.clone();
        for relation in path.split('.') {
            let existing = self.joins.iter().find(|j| {
                j.parent_alias() == Some(parent.as_str()) && j.relation_name() == Some(relation)
            });
            let alias = match existing {
                Some(join) => join.alias.clone(),
                None => {
                    let alias = self.relation_alias(&parent, relation);
                    self = self.left_join_and_select(&format!("{parent}.{relation}"), &alias);
                    alias
                }
            };
            parent = alias;
        }
        (self, parent)
    }

    /// Left-join-and-select every eager relation, recursively.
    pub fn join_eager_relations(self) -> Self {
        let main_alias = self.main_alias.clone();
        let main = self.main;
        let mut visited = HashSet::new();
        visited.insert(main);
        self.join_eager_from(&main_alias, main, &mut visited)
    }

    fn join_eager_from(mut self, parent_alias: &str, metadata: MetadataId, visited: &mut HashSet<MetadataId>) -> Self {
        let registry = self.registry;
        for relation in registry.get(metadata).relations.iter().filter(|r| r.eager) {
            if visited.contains(&relation.target_id) {
                continue;
            }
            let already = self.joins.iter().any(|j| {
                j.parent_alias() == Some(parent_alias) && j.relation_name() == Some(relation.property_name.as_str())
            });
            if already {
                continue;
            }
            let alias = self.relation_alias(parent_alias, &relation.property_name);
            self = self.left_join_and_select(&format!("{parent_alias}.{}", relation.property_name), &alias);
            visited.insert(relation.target_id);
            self = self.join_eager_from(&alias, relation.target_id, visited);
            visited.remove(&relation.target_id);
        }
        self
    }

    pub fn group_by(mut self, expression: impl Into<String>) -> Self {
        self.group_bys = vec![expression.into()];
        self
    }

    pub fn add_group_by(mut self, expression: impl Into<String>) -> Self {
        self.group_bys.push(expression.into());
        self
    }

    pub fn having(mut self, condition: impl Into<Condition>) -> Self {
        self.havings.where_(condition);
        self
    }

    pub fn and_having(mut self, condition: impl Into<Condition>) -> Self {
        self.havings.and_where(condition);
        self
    }

    pub fn or_having(mut self, condition: impl Into<Condition>) -> Self {
        self.havings.or_where(condition);
        self
    }

    /// Replace the ordering.
    pub fn order_by(mut self, sort: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_bys = vec![OrderBy::new(sort, direction)];
        self
    }

    pub fn add_order_by(mut self, sort: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_bys.push(OrderBy::new(sort, direction));
        self
    }

    /// Append a fully configured ORDER BY item (for NULLS FIRST/LAST).
    pub fn add_order(mut self, order: OrderBy) -> Self {
        self.order_bys.push(order);
        self
    }

    /// Raw LIMIT; with to-many joins this limits rows, not entities.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Entity-level limit, safe with to-many joins.
    pub fn take(mut self, take: u64) -> Self {
        self.take = Some(take);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn set_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn set_parameters<I, K, V>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (name, value) in parameters {
            self.parameters.insert(name.into(), value.into());
        }
        self
    }

    /// Include soft-deleted rows.
    pub fn with_deleted(mut self) -> Self {
        self.with_deleted = true;
        self
    }

    /// Whether hydrated entities are announced to after-load listeners.
    pub fn call_listeners(mut self, enabled: bool) -> Self {
        self.call_listeners = enabled;
        self
    }

    fn alias_metadata(&self, alias: &str) -> Option<&'r EntityMetadata> {
        if alias == self.main_alias {
            return Some(self.registry.get(self.main));
        }
        self.joins
            .iter()
            .find(|j| j.alias == alias)
            .map(|j| self.registry.get(j.metadata))
    }

    /// Columns of an entity plus those of its single-table descendants.
    fn alias_columns(&self, metadata: &'r EntityMetadata) -> Vec<&'r ColumnMetadata> {
        let mut columns: Vec<&ColumnMetadata> = metadata.columns.iter().collect();
        for descendant in self
            .registry
            .iter()
            .filter(|e| e.inheritance.ancestors.iter().any(|a| *a == metadata.name))
        {
            for column in &descendant.columns {
                if !columns.iter().any(|c| c.database_name == column.database_name) {
                    columns.push(column);
                }
            }
        }
        columns
    }

    /// Column behind `property` on an aliased entity: a column path, a
    /// descendant column, or a relation with a single join column.
    fn property_column(&self, metadata: &'r EntityMetadata, property: &str) -> Option<&'r ColumnMetadata> {
        if let Some(column) = self
            .alias_columns(metadata)
            .into_iter()
            .find(|c| c.property_path == property)
        {
            return Some(column);
        }
        let relation = metadata.find_relation(property)?;
        if relation.is_join_column_owner() && relation.join_columns.len() == 1 {
            return metadata.join_columns_of(relation).next();
        }
        None
    }

    fn result_alias(&self, alias: &str, column: &ColumnMetadata) -> String {
        build_alias(self.driver.alias_options(), &[alias, &column.database_name])
    }

    fn has_to_many_join(&self) -> bool {
        self.joins.iter().any(|join| {
            join.select
                && match &join.target {
                    JoinTarget::Relation { parent_alias, relation } => self
                        .alias_metadata(parent_alias)
                        .and_then(|m| m.find_relation(relation))
                        .is_some_and(|r| r.relation_type.is_to_many()),
                    JoinTarget::Entity => false,
                }
        })
    }

    fn paginates_by_ids(&self) -> bool {
        (self.take.is_some() || self.skip.is_some()) && self.has_to_many_join()
    }

    fn effective_limit(&self) -> (Option<u64>, Option<u64>) {
        if self.paginates_by_ids() {
            (self.limit, self.offset)
        } else {
            (self.take.or(self.limit), self.skip.or(self.offset))
        }
    }

    /// Per-alias column plans plus raw select expressions.
    fn plans(&self) -> (Vec<AliasPlan>, Vec<String>) {
        let mut plans = vec![AliasPlan {
            alias: self.main_alias.clone(),
            metadata: self.main,
            columns: Vec::new(),
            parent: None,
        }];
        for join in &self.joins {
            let parent = match &join.target {
                JoinTarget::Relation { parent_alias, relation } => plans
                    .iter()
                    .position(|p| p.alias == *parent_alias)
                    .map(|index| (index, relation.clone())),
                JoinTarget::Entity => None,
            };
            if join.target != JoinTarget::Entity && parent.is_none() {
                continue;
            }
            plans.push(AliasPlan {
                alias: join.alias.clone(),
                metadata: join.metadata,
                columns: Vec::new(),
                parent,
            });
        }

        let mut raws = Vec::new();
        for item in &self.selects {
            if let Some(plan) = plans.iter_mut().find(|p| p.alias == *item) {
                let metadata = self.registry.get(plan.metadata);
                for column in self.alias_columns(metadata) {
                    push_column(plan, column, self.result_alias(item, column));
                }
                continue;
            }
            let qualified = item.split_once('.').and_then(|(alias, property)| {
                let metadata = self.alias_metadata(alias)?;
                let column = self.property_column(metadata, property)?;
                Some((alias, column))
            });
            match qualified {
                Some((alias, column)) => {
                    let result = self.result_alias(alias, column);
                    if let Some(plan) = plans.iter_mut().find(|p| p.alias == alias) {
                        push_column(plan, column, result);
                    }
                }
                None => raws.push(item.clone()),
            }
        }

        // Entities cannot be hydrated without their keys.
        for plan in &mut plans {
            if plan.columns.is_empty() {
                continue;
            }
            let metadata = self.registry.get(plan.metadata);
            for column in metadata.primary_columns() {
                let result = self.result_alias(&plan.alias, column);
                push_column(plan, column, result);
            }
        }
        // Joined aliases without selected columns are not hydrated.
        let mut kept = Vec::with_capacity(plans.len());
        let mut remap = vec![None; plans.len()];
        for (index, mut plan) in plans.into_iter().enumerate() {
            if index > 0 && plan.columns.is_empty() {
                continue;
            }
            if let Some((parent, relation)) = plan.parent.take() {
                match remap[parent] {
                    Some(new_parent) => plan.parent = Some((new_parent, relation)),
                    None => continue,
                }
            }
            remap[index] = Some(kept.len());
            kept.push(plan);
        }
        (kept, raws)
    }

    /// System conditions on an aliased entity: soft delete and discriminator.
    fn alias_filters(&self, alias: &str, metadata: &EntityMetadata) -> Vec<Expr> {
        let mut filters = Vec::new();
        if !self.with_deleted {
            if let Some(column) = metadata.delete_date_column() {
                filters.push(Expr::qualified(alias, column.property_path.clone()).is_null());
            }
        }
        if metadata.inheritance.parent.is_some() {
            if let Some(column) = metadata.discriminator_column() {
                let values = metadata
                    .inheritance
                    .tree_discriminator_values
                    .iter()
                    .map(|v| Expr::Literal(Value::Text(v.clone())));
                filters.push(Expr::qualified(alias, column.property_path.clone()).in_list(values));
            }
        }
        filters
    }

    fn check(&self) -> Result<()> {
        match &self.pending_error {
            Some((kind, message)) => Err(Error::builder(*kind, message.clone())),
            None => Ok(()),
        }
    }

    fn render(&self, sink: &mut ParameterSink, shape: Shape) -> Result<String> {
        self.check()?;
        let mut ctx = RenderContext {
            driver: &self.driver,
            parameters: &self.parameters,
            resolver: self,
            sink,
        };
        let driver = &self.driver;
        let main = self.metadata();

        let select = match shape.select {
            Some(select) => select,
            None => {
                let (plans, raws) = self.plans();
                check_result_aliases(&plans)?;
                let mut items = Vec::new();
                for plan in &plans {
                    for (database_name, result) in &plan.columns {
                        items.push(format!(
                            "{}.{} AS {}",
                            driver.escape(&plan.alias),
                            driver.escape(database_name),
                            driver.escape(result)
                        ));
                    }
                }
                for raw in &raws {
                    items.push(ctx.render_raw(raw)?);
                }
                if items.is_empty() {
                    "*".to_string()
                } else {
                    items.join(", ")
                }
            }
        };

        let mut sql = format!(
            "SELECT {}{select} FROM {} {}",
            if self.distinct { "DISTINCT " } else { "" },
            driver.escape_table_path(main),
            driver.escape(&self.main_alias)
        );

        for join in &self.joins {
            let parent = join.parent_alias().and_then(|a| self.alias_metadata(a));
            let target = self.registry.get(join.metadata);
            let filters = self.alias_filters(&join.alias, target);
            sql.push_str(&join.render(&mut ctx, self.registry, parent, &filters)?);
        }

        let user = self.wheres.render(&mut ctx)?;
        let mut system = Vec::new();
        for filter in self.alias_filters(&self.main_alias, main) {
            system.push(filter.build(&mut ctx)?);
        }
        if let Some(ids) = &shape.ids {
            system.push(ids.build(&mut ctx)?);
        }
        match (user.is_empty(), system.is_empty()) {
            (true, true) => {}
            (false, true) => sql.push_str(&format!(" WHERE {user}")),
            (true, false) => sql.push_str(&format!(" WHERE {}", system.join(" AND "))),
            (false, false) => sql.push_str(&format!(" WHERE ({user}) AND {}", system.join(" AND "))),
        }

        if !self.group_bys.is_empty() {
            let groups = self
                .group_bys
                .iter()
                .map(|g| ctx.render_raw(g))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }
        let having = self.havings.render(&mut ctx)?;
        if !having.is_empty() {
            sql.push_str(&format!(" HAVING {having}"));
        }

        if shape.ordered {
            let mut orders = Vec::with_capacity(self.order_bys.len());
            for order in &self.order_bys {
                let column = ctx.render_raw(order.column())?;
                orders.push(order.to_sql_with(&column));
            }
            let paginated = shape.limit.is_some() || shape.offset.is_some();
            if orders.is_empty() && paginated && driver.pagination_requires_order() {
                for column in main.primary_columns() {
                    orders.push(format!(
                        "{}.{} ASC",
                        driver.escape(&self.main_alias),
                        driver.escape(&column.database_name)
                    ));
                }
            }
            if !orders.is_empty() {
                sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
            }
            sql.push_str(&driver.limit_offset_sql(shape.limit, shape.offset));
        }
        Ok(sql)
    }

    fn data_shape(&self, ids: Option<Expr>) -> Shape {
        let (limit, offset) = self.effective_limit();
        Shape {
            select: None,
            ids,
            ordered: true,
            limit,
            offset,
        }
    }

    /// Rendered SQL without parameters.
    pub fn get_query(&self) -> Result<String> {
        self.get_query_and_parameters().map(|(sql, _)| sql)
    }

    pub fn get_query_and_parameters(&self) -> Result<(String, Vec<Value>)> {
        let mut sink = ParameterSink::new();
        let sql = self.render(&mut sink, self.data_shape(None))?;
        Ok((sql, sink.into_values()))
    }

    /// `SELECT COUNT(DISTINCT <primary key>)` over the same joins and conditions.
    pub fn get_count_query_and_parameters(&self) -> Result<(String, Vec<Value>)> {
        let columns: Vec<String> = self
            .metadata()
            .primary_columns()
            .map(|c| {
                format!(
                    "{}.{}",
                    self.driver.escape(&self.main_alias),
                    self.driver.escape(&c.database_name)
                )
            })
            .collect();
        let select = format!(
            "{} AS {}",
            self.driver.count_distinct_sql(&columns),
            self.driver.escape(COUNT_ALIAS)
        );
        let mut sink = ParameterSink::new();
        let sql = self.render(
            &mut sink,
            Shape {
                select: Some(select),
                ids: None,
                ordered: false,
                limit: None,
                offset: None,
            },
        )?;
        Ok((sql, sink.into_values()))
    }

    // Distinct main-alias keys of one page, selected from the full query.
    fn page_ids_query(&self) -> Result<(String, Vec<Value>)> {
        let driver = &self.driver;
        let outer = driver.escape(DISTINCT_ALIAS);

        let mut selected = Vec::new();
        let mut orders = Vec::new();
        for order in &self.order_bys {
            let column = order.column().split_once('.').and_then(|(alias, property)| {
                let metadata = self.alias_metadata(alias)?;
                let column = self.property_column(metadata, property)?;
                Some(self.result_alias(alias, column))
            });
            if let Some(result) = column {
                let quoted = format!("{outer}.{}", driver.escape(&result));
                orders.push(order.to_sql_with(&quoted));
                selected.push(format!("{quoted} AS {}", driver.escape(&result)));
            }
        }
        for column in self.metadata().primary_columns() {
            let result = self.result_alias(&self.main_alias, column);
            let quoted = format!("{outer}.{}", driver.escape(&result));
            if !selected.iter().any(|s| s.starts_with(&quoted)) {
                selected.push(format!("{quoted} AS {}", driver.escape(&result)));
            }
            orders.push(format!("{quoted} ASC"));
        }

        let mut sink = ParameterSink::new();
        let inner = self.render(
            &mut sink,
            Shape {
                select: None,
                ids: None,
                ordered: false,
                limit: None,
                offset: None,
            },
        )?;
        let sql = format!(
            "SELECT DISTINCT {} FROM ({inner}) {outer} ORDER BY {}{}",
            selected.join(", "),
            orders.join(", "),
            driver.limit_offset_sql(self.take, self.skip)
        );
        Ok((sql, sink.into_values()))
    }

    pub async fn get_raw_many<C: Connection>(&self, cx: &Cx, runner: &QueryRunner<C>) -> Outcome<Vec<Row>, Error> {
        let (sql, params) = try_result!(self.get_query_and_parameters());
        let result = try_outcome!(runner.query(cx, &sql, &params).await);
        Outcome::Ok(result.rows)
    }

    pub async fn get_raw_one<C: Connection>(&self, cx: &Cx, runner: &QueryRunner<C>) -> Outcome<Option<Row>, Error> {
        let rows = try_outcome!(self.get_raw_many(cx, runner).await);
        Outcome::Ok(rows.into_iter().next())
    }

    /// Execute and hydrate entities, firing after-load listeners.
    #[tracing::instrument(level = "debug", skip(self, cx, runner), fields(entity = %self.metadata().name))]
    pub async fn get_many<C: Connection>(&self, cx: &Cx, runner: &QueryRunner<C>) -> Outcome<LoadedEntities, Error> {
        let ids = if self.paginates_by_ids() {
            let (sql, params) = try_result!(self.page_ids_query());
            let result = try_outcome!(runner.query(cx, &sql, &params).await);
            let (plans, _) = self.plans();
            let Some(main_plan) = plans.first() else {
                return Outcome::Ok(LoadedEntities::default());
            };
            let ids: Vec<EntityIdentifier> = result
                .rows
                .iter()
                .filter_map(|row| main_plan.identifier(self.registry, &self.driver, row))
                .collect();
            if ids.is_empty() {
                return Outcome::Ok(LoadedEntities::default());
            }
            Some(self.ids_condition(&ids))
        } else {
            None
        };

        let mut sink = ParameterSink::new();
        let sql = try_result!(self.render(&mut sink, self.data_shape(ids)));
        let params = sink.into_values();
        let result = try_outcome!(runner.query(cx, &sql, &params).await);

        let (plans, _) = self.plans();
        let (mut loaded, created) = try_result!(hydrate(self.registry, &self.driver, &plans, &result.rows));
        debug!(rows = result.rows.len(), entities = loaded.len(), "hydrated select result");

        if !self.call_listeners {
            return Outcome::Ok(loaded);
        }
        for (entity, metadata_id) in created {
            let metadata = self.registry.get(metadata_id);
            let record = &mut loaded.graph[entity];
            let identifier = metadata.identifier_from_values(record);
            let mut event = EntityEvent {
                metadata,
                entity,
                record,
                identifier,
                updated_columns: &[],
            };
            try_result!(runner.subscribers().broadcast(ListenerKind::AfterLoad, &mut event));
        }
        Outcome::Ok(loaded)
    }

    /// Like [`get_many`](Self::get_many), keeping only the first root.
    pub async fn get_one<C: Connection>(&self, cx: &Cx, runner: &QueryRunner<C>) -> Outcome<LoadedEntities, Error> {
        let mut loaded = try_outcome!(self.get_many(cx, runner).await);
        loaded.roots.truncate(1);
        Outcome::Ok(loaded)
    }

    /// Number of distinct main-alias entities matching the query.
    pub async fn get_count<C: Connection>(&self, cx: &Cx, runner: &QueryRunner<C>) -> Outcome<u64, Error> {
        let (sql, params) = try_result!(self.get_count_query_and_parameters());
        let result = try_outcome!(runner.query(cx, &sql, &params).await);
        let count = result
            .first_row()
            .and_then(|row| row.get_by_name(COUNT_ALIAS).or_else(|| row.get(0)))
            .and_then(Value::as_i64)
            .and_then(|n| u64::try_from(n).ok());
        match count {
            Some(count) => Outcome::Ok(count),
            None => Outcome::Err(
                Error::Hydration(format!("count query returned no usable \"{COUNT_ALIAS}\" value"))
                    .query_failed(&sql, &params),
            ),
        }
    }

    pub async fn get_many_and_count<C: Connection>(
        &self,
        cx: &Cx,
        runner: &QueryRunner<C>,
    ) -> Outcome<(LoadedEntities, u64), Error> {
        let loaded = try_outcome!(self.get_many(cx, runner).await);
        let count = try_outcome!(self.get_count(cx, runner).await);
        Outcome::Ok((loaded, count))
    }

    pub async fn get_exists<C: Connection>(&self, cx: &Cx, runner: &QueryRunner<C>) -> Outcome<bool, Error> {
        let count = try_outcome!(self.get_count(cx, runner).await);
        Outcome::Ok(count > 0)
    }
}

/// Result aliases must be unique; hydration looks columns up by name.
fn check_result_aliases(plans: &[AliasPlan]) -> Result<()> {
    let mut seen = HashSet::new();
    for plan in plans {
        for (database_name, result) in &plan.columns {
            if !seen.insert(result.as_str()) {
                return Err(Error::builder(
                    BuilderErrorKind::DuplicateAlias,
                    format!("{}.{database_name} selects as \"{result}\", which is already taken", plan.alias),
                ));
            }
        }
    }
    Ok(())
}

fn push_column(plan: &mut AliasPlan, column: &ColumnMetadata, result: String) {
    if !plan.columns.iter().any(|(db, _)| *db == column.database_name) {
        plan.columns.push((column.database_name.clone(), result));
    }
}

impl ColumnResolver for SelectQueryBuilder<'_> {
    fn resolve_column(&self, alias: Option<&str>, property: &str) -> Result<String> {
        let alias = alias.unwrap_or(&self.main_alias);
        let metadata = self.alias_metadata(alias).ok_or_else(|| {
            Error::builder(BuilderErrorKind::UnknownAlias, format!("unknown alias \"{alias}\""))
        })?;
        let column = self.property_column(metadata, property).ok_or_else(|| {
            Error::builder(
                BuilderErrorKind::UnknownProperty,
                format!("{} has no property \"{property}\"", metadata.name),
            )
        })?;
        Ok(format!(
            "{}.{}",
            self.driver.escape(alias),
            self.driver.escape(&column.database_name)
        ))
    }

    fn rewrite_properties(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut chars = sql.char_indices().peekable();
        let mut in_literal = false;
        let mut prev: Option<char> = None;
        while let Some((start, c)) = chars.next() {
            if c == '\'' {
                in_literal = !in_literal;
            }
            let boundary = prev.is_none_or(|p| {
                !(p.is_alphanumeric() || matches!(p, '_' | '.' | ':' | '"' | '`' | '[' | '@' | '$'))
            });
            if in_literal || !boundary || !(c.is_alphabetic() || c == '_') {
                out.push(c);
                prev = Some(c);
                continue;
            }
            let mut end = start + c.len_utf8();
            while let Some(&(i, next)) = chars.peek() {
                if next.is_alphanumeric() || next == '_' || next == '.' {
                    end = i + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let token = &sql[start..end];
            match self.rewrite_token(token) {
                Some(column) => out.push_str(&column),
                None => out.push_str(token),
            }
            prev = token.chars().last();
        }
        out
    }
}

impl SelectQueryBuilder<'_> {
    fn rewrite_token(&self, token: &str) -> Option<String> {
        if token.ends_with('.') {
            return None;
        }
        let (alias, property) = token.split_once('.')?;
        let metadata = self.alias_metadata(alias)?;
        let column = self.property_column(metadata, property)?;
        Some(format!(
            "{}.{}",
            self.driver.escape(alias),
            self.driver.escape(&column.database_name)
        ))
    }
}
