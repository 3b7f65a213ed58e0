//! Expression DSL for conditions built in code.
//!
//! [`Expr`] is the programmatic counterpart of a raw condition string. Column
//! references name a property, optionally qualified by a query alias, and are
//! resolved against entity metadata when the statement is rendered. Literals
//! are always bound as parameters.

use persisto_core::{Driver, Result, Value};

use crate::params::{ParameterSink, Parameters, expand_parameters};

/// Resolves property references for one statement.
pub trait ColumnResolver {
    /// Escaped column for `alias.property` (or just `property`).
    fn resolve_column(&self, alias: Option<&str>, property: &str) -> Result<String>;

    /// Replace `alias.property` tokens of a raw fragment with escaped columns.
    fn rewrite_properties(&self, sql: &str) -> String;
}

/// Everything needed to render a fragment into SQL.
pub struct RenderContext<'a> {
    pub driver: &'a Driver,
    pub parameters: &'a Parameters,
    pub resolver: &'a dyn ColumnResolver,
    pub sink: &'a mut ParameterSink,
}

impl RenderContext<'_> {
    /// Render a raw fragment: property rewrite, then named parameters.
    pub fn render_raw(&mut self, sql: &str) -> Result<String> {
        let rewritten = self.resolver.rewrite_properties(sql);
        expand_parameters(&rewritten, self.parameters, self.driver, self.sink)
    }

    /// Bind a value and return its placeholder.
    pub fn bind(&mut self, value: Value) -> String {
        self.sink.push(self.driver, value)
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Like,
    NotLike,
}

impl BinaryOp {
    pub const fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Like => "LIKE",
            BinaryOp::NotLike => "NOT LIKE",
        }
    }
}

/// A SQL expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Property reference, optionally qualified by a query alias
    Column {
        alias: Option<String>,
        property: String,
    },
    /// Value bound as a parameter
    Literal(Value),
    /// Named parameter looked up in the query's parameters
    Param(String),
    /// Raw SQL, rewritten like a string condition
    Raw(String),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },
    /// Row value `(a, b)`
    Tuple(Vec<Expr>),
    Paren(Box<Expr>),
}

impl Expr {
    /// Unqualified property reference (resolved against the main alias).
    pub fn col(property: impl Into<String>) -> Self {
        Expr::Column {
            alias: None,
            property: property.into(),
        }
    }

    pub fn qualified(alias: impl Into<String>, property: impl Into<String>) -> Self {
        Expr::Column {
            alias: Some(alias.into()),
            property: property.into(),
        }
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        Expr::Param(name.into())
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Expr::Raw(sql.into())
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    pub fn like(self, pattern: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Like, pattern)
    }

    pub fn not_like(self, pattern: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::NotLike, pattern)
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn in_list<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Expr>,
    {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Expr>,
    {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn paren(self) -> Self {
        Expr::Paren(Box::new(self))
    }

    /// AND-join a list of expressions; `None` when empty.
    pub fn all(exprs: impl IntoIterator<Item = Expr>) -> Option<Self> {
        exprs.into_iter().reduce(Expr::and)
    }

    /// OR-join a list of expressions; `None` when empty.
    pub fn any(exprs: impl IntoIterator<Item = Expr>) -> Option<Self> {
        exprs.into_iter().reduce(Expr::or)
    }

    /// Render to SQL, binding literals into the context's sink.
    pub fn build(&self, ctx: &mut RenderContext<'_>) -> Result<String> {
        match self {
            Expr::Column { alias, property } => ctx.resolver.resolve_column(alias.as_deref(), property),
            Expr::Literal(value) => Ok(ctx.bind(value.clone())),
            Expr::Param(name) => ctx.render_raw(&format!(":{name}")),
            Expr::Raw(sql) => ctx.render_raw(sql),
            Expr::Binary { left, op, right } => {
                let left = left.build(ctx)?;
                let right = right.build(ctx)?;
                Ok(format!("{left} {} {right}", op.as_str()))
            }
            Expr::Not(inner) => Ok(format!("NOT ({})", inner.build(ctx)?)),
            Expr::IsNull { expr, negated } => {
                let inner = expr.build(ctx)?;
                Ok(if *negated {
                    format!("{inner} IS NOT NULL")
                } else {
                    format!("{inner} IS NULL")
                })
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                if values.is_empty() {
                    return Ok(if *negated { "1 = 1" } else { "1 = 0" }.to_string());
                }
                let target = expr.build(ctx)?;
                let items = values
                    .iter()
                    .map(|v| v.build(ctx))
                    .collect::<Result<Vec<_>>>()?;
                let keyword = if *negated { "NOT IN" } else { "IN" };
                Ok(format!("{target} {keyword} ({})", items.join(", ")))
            }
            Expr::Tuple(items) => {
                let items = items.iter().map(|v| v.build(ctx)).collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", items.join(", ")))
            }
            Expr::Paren(inner) => Ok(format!("({})", inner.build(ctx)?)),
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Literal(value)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Literal(Value::Text(s.to_string()))
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Literal(Value::Text(s))
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Literal(Value::Int(n))
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Literal(Value::BigInt(n))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Literal(Value::Bool(b))
    }
}

impl From<f64> for Expr {
    fn from(n: f64) -> Self {
        Expr::Literal(Value::Double(n))
    }
}

/// Resolver for statements without aliases: properties map to bare columns.
#[derive(Debug, Clone, Copy)]
pub struct PlainResolver<'a> {
    pub driver: &'a Driver,
}

impl ColumnResolver for PlainResolver<'_> {
    fn resolve_column(&self, alias: Option<&str>, property: &str) -> Result<String> {
        Ok(match alias {
            Some(alias) => format!("{}.{}", self.driver.escape(alias), self.driver.escape(property)),
            None => self.driver.escape(property),
        })
    }

    fn rewrite_properties(&self, sql: &str) -> String {
        sql.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(expr: &Expr, driver: &Driver) -> (String, Vec<Value>) {
        let parameters = Parameters::new();
        let mut sink = ParameterSink::new();
        let resolver = PlainResolver { driver };
        let sql = {
            let mut ctx = RenderContext {
                driver,
                parameters: &parameters,
                resolver: &resolver,
                sink: &mut sink,
            };
            expr.build(&mut ctx).unwrap()
        };
        (sql, sink.into_values())
    }

    #[test]
    fn test_binary_and_literals() {
        let expr = Expr::col("age").gt(18).and(Expr::col("name").like("a%"));
        let (sql, params) = render(&expr, &Driver::postgres());
        assert_eq!(sql, "\"age\" > $1 AND \"name\" LIKE $2");
        assert_eq!(params, vec![Value::Int(18), Value::from("a%")]);
    }

    #[test]
    fn test_in_list_and_empty_in() {
        let expr = Expr::qualified("u", "id").in_list([1, 2, 3]);
        let (sql, params) = render(&expr, &Driver::mysql());
        assert_eq!(sql, "`u`.`id` IN (?, ?, ?)");
        assert_eq!(params.len(), 3);

        let empty = Expr::col("id").in_list(Vec::<Expr>::new());
        assert_eq!(render(&empty, &Driver::mysql()).0, "1 = 0");
    }

    #[test]
    fn test_tuple_in_and_null_checks() {
        let expr = Expr::Tuple(vec![Expr::col("a"), Expr::col("b")])
            .in_list([Expr::Tuple(vec![Expr::lit(1), Expr::lit(2)])]);
        let (sql, _) = render(&expr, &Driver::postgres());
        assert_eq!(sql, "(\"a\", \"b\") IN (($1, $2))");

        let (sql, params) = render(&Expr::col("deleted").is_null().not(), &Driver::sqlite());
        assert_eq!(sql, "NOT (\"deleted\" IS NULL)");
        assert!(params.is_empty());
    }

    #[test]
    fn test_all_and_any_fold() {
        assert!(Expr::all(Vec::new()).is_none());
        let any = Expr::any([Expr::col("a").eq(1), Expr::col("b").eq(2)]).unwrap().paren();
        let (sql, _) = render(&any, &Driver::sqlite());
        assert_eq!(sql, "(\"a\" = ? OR \"b\" = ?)");
    }
}
