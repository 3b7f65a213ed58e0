//! Raw result rows returned by a driver.
//!
//! Column names are the result aliases chosen by the query builder
//! (`alias_column`), so lookups are by exact name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::Value;

#[derive(Debug)]
struct Columns {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

/// One result row. Rows built from the same column list share it.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Columns>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(names: Vec<String>, values: Vec<Value>) -> Self {
        let index = names.iter().enumerate().map(|(i, name)| (name.clone(), i)).collect();
        Self {
            columns: Arc::new(Columns { names, index }),
            values,
        }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (names, values) = pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self::new(names, values)
    }

    /// Another row over the same columns.
    pub fn sibling(&self, values: Vec<Value>) -> Self {
        Self {
            columns: Arc::clone(&self.columns),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index.get(name).and_then(|&i| self.values.get(i))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names.iter().map(String::as_str)
    }

    /// `(column, value)` pairs in result order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(&self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_result_alias() {
        let row = Row::from_pairs([("user_id", Value::BigInt(1)), ("user_name", Value::from("ann"))]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get_by_name("user_name"), Some(&Value::from("ann")));
        assert_eq!(row.get(0), Some(&Value::BigInt(1)));
        assert!(row.get_by_name("name").is_none());
    }

    #[test]
    fn test_sibling_shares_columns() {
        let row = Row::from_pairs([("cnt", Value::BigInt(3))]);
        let other = row.sibling(vec![Value::BigInt(4)]);
        assert_eq!(other.get_by_name("cnt"), Some(&Value::BigInt(4)));
        assert_eq!(other.iter().collect::<Vec<_>>(), vec![("cnt", &Value::BigInt(4))]);
    }
}
