//! WHERE / HAVING conditions, brackets and ORDER BY.

use persisto_core::Result;
use serde::{Deserialize, Serialize};

use crate::expr::{Expr, RenderContext};

/// How a condition joins the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conjunction {
    And,
    Or,
}

impl Conjunction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Conjunction::And => "AND",
            Conjunction::Or => "OR",
        }
    }
}

/// One condition of a WHERE or HAVING clause.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Raw SQL with `alias.property` references and `:name` parameters
    Raw(String),
    Expr(Expr),
    Brackets(Brackets),
}

impl Condition {
    pub(crate) fn render(&self, ctx: &mut RenderContext<'_>) -> Result<String> {
        match self {
            Condition::Raw(sql) => ctx.render_raw(sql),
            Condition::Expr(expr) => expr.build(ctx),
            Condition::Brackets(brackets) => brackets.render(ctx),
        }
    }
}

impl From<&str> for Condition {
    fn from(sql: &str) -> Self {
        Condition::Raw(sql.to_string())
    }
}

impl From<String> for Condition {
    fn from(sql: String) -> Self {
        Condition::Raw(sql)
    }
}

impl From<Expr> for Condition {
    fn from(expr: Expr) -> Self {
        Condition::Expr(expr)
    }
}

impl From<Brackets> for Condition {
    fn from(brackets: Brackets) -> Self {
        Condition::Brackets(brackets)
    }
}

/// An ordered list of conditions with their connectors.
#[derive(Debug, Clone, Default)]
pub struct WhereClauses {
    items: Vec<(Conjunction, Condition)>,
}

impl WhereClauses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every condition with `condition`.
    pub fn where_(&mut self, condition: impl Into<Condition>) -> &mut Self {
        self.items.clear();
        self.items.push((Conjunction::And, condition.into()));
        self
    }

    pub fn and_where(&mut self, condition: impl Into<Condition>) -> &mut Self {
        self.items.push((Conjunction::And, condition.into()));
        self
    }

    pub fn or_where(&mut self, condition: impl Into<Condition>) -> &mut Self {
        self.items.push((Conjunction::Or, condition.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Render the conditions; empty brackets are dropped with their connector.
    pub fn render(&self, ctx: &mut RenderContext<'_>) -> Result<String> {
        let mut sql = String::new();
        for (conjunction, condition) in &self.items {
            let part = condition.render(ctx)?;
            if part.is_empty() {
                continue;
            }
            if !sql.is_empty() {
                sql.push(' ');
                sql.push_str(conjunction.as_str());
                sql.push(' ');
            }
            sql.push_str(&part);
        }
        Ok(sql)
    }
}

/// A group of conditions rendered inside parentheses.
///
/// ```ignore
/// qb.where_("x = :a")
///     .or_where(Brackets::new(|qb| {
///         qb.where_("y = :b").and_where("z = :c");
///     }));
/// // WHERE x = ? OR (y = ? AND z = ?)
/// ```
#[derive(Debug, Clone)]
pub struct Brackets {
    clauses: WhereClauses,
    negated: bool,
}

impl Brackets {
    pub fn new(build: impl FnOnce(&mut WhereClauses)) -> Self {
        let mut clauses = WhereClauses::new();
        build(&mut clauses);
        Self {
            clauses,
            negated: false,
        }
    }

    /// `NOT (...)` group.
    pub fn not(build: impl FnOnce(&mut WhereClauses)) -> Self {
        Self {
            negated: true,
            ..Self::new(build)
        }
    }

    fn render(&self, ctx: &mut RenderContext<'_>) -> Result<String> {
        let inner = self.clauses.render(ctx)?;
        if inner.is_empty() {
            return Ok(inner);
        }
        Ok(if self.negated {
            format!("NOT ({inner})")
        } else {
            format!("({inner})")
        })
    }
}

/// ORDER BY clause.
#[derive(Debug, Clone)]
pub struct OrderBy {
    column: String,
    direction: OrderDirection,
    nulls: Option<NullsOrder>,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// NULLS FIRST/LAST ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullsOrder {
    First,
    Last,
}

impl OrderBy {
    pub fn new(column: impl Into<String>, direction: OrderDirection) -> Self {
        Self {
            column: column.into(),
            direction,
            nulls: None,
        }
    }

    /// Create an ascending order by clause.
    pub fn asc(column: impl Into<String>) -> Self {
        Self::new(column, OrderDirection::Asc)
    }

    /// Create a descending order by clause.
    pub fn desc(column: impl Into<String>) -> Self {
        Self::new(column, OrderDirection::Desc)
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls = Some(NullsOrder::First);
        self
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = Some(NullsOrder::Last);
        self
    }

    /// The sort expression as written (`alias.property` or raw SQL).
    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    /// Render with an already-resolved sort expression.
    pub fn to_sql_with(&self, column: &str) -> String {
        let mut sql = column.to_string();
        sql.push_str(match self.direction {
            OrderDirection::Asc => " ASC",
            OrderDirection::Desc => " DESC",
        });
        if let Some(nulls) = self.nulls {
            sql.push_str(match nulls {
                NullsOrder::First => " NULLS FIRST",
                NullsOrder::Last => " NULLS LAST",
            });
        }
        sql
    }
}
