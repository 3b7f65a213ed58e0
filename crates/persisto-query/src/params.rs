//! Named parameters.
//!
//! Query fragments refer to values as `:name`, or `:...name` for a list that
//! expands to one placeholder per element. Both are rewritten to the
//! dialect's positional placeholders while the values are appended, in
//! order, to the statement's parameter list. `::` (a Postgres cast) is left
//! alone.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use persisto_core::{BuilderErrorKind, Driver, Error, Result, Value};
use regex::Regex;

/// Named parameter values of a query.
pub type Parameters = BTreeMap<String, Value>;

static NAMED_PARAMETER: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();

fn named_parameter_pattern() -> Result<&'static Regex> {
    NAMED_PARAMETER
        .get_or_init(|| Regex::new(r"(:{1,2})(\.\.\.)?([A-Za-z_][A-Za-z0-9_]*)"))
        .as_ref()
        .map_err(|e| Error::Custom(format!("invalid parameter pattern: {e}")))
}

/// Positional parameters collected while rendering one statement.
#[derive(Debug, Clone, Default)]
pub struct ParameterSink {
    values: Vec<Value>,
}

impl ParameterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value and return the placeholder that binds it.
    pub fn push(&mut self, driver: &Driver, value: Value) -> String {
        self.values.push(value);
        driver.placeholder(self.values.len())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Rewrite every `:name` in `sql` to a placeholder bound to `parameters[name]`.
///
/// A name with no value is a [`BuilderErrorKind::MissingParameter`] error. An
/// array bound through `:...name` with no elements renders `NULL`, which
/// keeps `IN (NULL)` valid and matching nothing.
pub fn expand_parameters(
    sql: &str,
    parameters: &Parameters,
    driver: &Driver,
    sink: &mut ParameterSink,
) -> Result<String> {
    let pattern = named_parameter_pattern()?;
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for caps in pattern.captures_iter(sql) {
        let Some(whole) = caps.get(0) else { continue };
        if caps.get(1).is_some_and(|colons| colons.as_str().len() == 2) {
            continue;
        }
        if in_string_literal(&sql[..whole.start()]) {
            continue;
        }
        let name = caps.get(3).map_or("", |m| m.as_str());
        let value = parameters.get(name).ok_or_else(|| {
            Error::builder(
                BuilderErrorKind::MissingParameter,
                format!("no value bound for parameter \"{name}\""),
            )
        })?;
        out.push_str(&sql[last..whole.start()]);
        if caps.get(2).is_some() {
            out.push_str(&expand_list(value, driver, sink));
        } else {
            out.push_str(&sink.push(driver, value.clone()));
        }
        last = whole.end();
    }
    out.push_str(&sql[last..]);
    Ok(out)
}

fn expand_list(value: &Value, driver: &Driver, sink: &mut ParameterSink) -> String {
    match value {
        Value::Array(items) if items.is_empty() => "NULL".to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| sink.push(driver, item.clone()))
            .collect::<Vec<_>>()
            .join(", "),
        other => sink.push(driver, other.clone()),
    }
}

// An odd number of single quotes before a match means we are inside '...'.
fn in_string_literal(prefix: &str) -> bool {
    prefix.bytes().filter(|b| *b == b'\'').count() % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_named_parameters_become_positional() {
        let mut sink = ParameterSink::new();
        let sql = expand_parameters(
            "a = :a AND b = :b AND c = :a",
            &params(&[("a", Value::Int(1)), ("b", Value::from("x"))]),
            &Driver::postgres(),
            &mut sink,
        )
        .unwrap();
        assert_eq!(sql, "a = $1 AND b = $2 AND c = $3");
        assert_eq!(
            sink.into_values(),
            vec![Value::Int(1), Value::from("x"), Value::Int(1)]
        );
    }

    #[test]
    fn test_list_parameter_expands() {
        let mut sink = ParameterSink::new();
        let sql = expand_parameters(
            "id IN (:...ids)",
            &params(&[("ids", Value::Array(vec![Value::Int(1), Value::Int(2)]))]),
            &Driver::mysql(),
            &mut sink,
        )
        .unwrap();
        assert_eq!(sql, "id IN (?, ?)");
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_empty_list_renders_null() {
        let mut sink = ParameterSink::new();
        let sql = expand_parameters(
            "id IN (:...ids)",
            &params(&[("ids", Value::Array(Vec::new()))]),
            &Driver::postgres(),
            &mut sink,
        )
        .unwrap();
        assert_eq!(sql, "id IN (NULL)");
        assert!(sink.is_empty());
    }

    #[test]
    fn test_casts_and_literals_untouched() {
        let mut sink = ParameterSink::new();
        let sql = expand_parameters(
            "created::date = :day AND note = 'at :noon'",
            &params(&[("day", Value::from("2024-01-01"))]),
            &Driver::postgres(),
            &mut sink,
        )
        .unwrap();
        assert_eq!(sql, "created::date = $1 AND note = 'at :noon'");
    }

    #[test]
    fn test_missing_parameter_is_builder_error() {
        let mut sink = ParameterSink::new();
        let err = expand_parameters("a = :nope", &Parameters::new(), &Driver::sqlite(), &mut sink)
            .unwrap_err();
        match err {
            Error::Builder(e) => assert_eq!(e.kind, BuilderErrorKind::MissingParameter),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
