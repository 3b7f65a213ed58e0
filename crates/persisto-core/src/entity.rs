//! In-memory entity graphs.
//!
//! Entities are stored in an arena ([`EntityGraph`]) and refer to each other
//! through [`EntityRef`] handles. Graphs may contain cycles (a post points at
//! its author, the author lists the post) without any shared ownership.
//!
//! A record stores plain column values by property path and relations by
//! property name. A relation key that is absent means "not loaded"; the
//! persistence engine never touches such a relation.

use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Handle of a record inside an [`EntityGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef(pub usize);

/// Value of a relation property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationValue {
    /// Explicitly set to null
    Null,
    /// A single related entity
    One(EntityRef),
    /// A collection of related entities
    Many(Vec<EntityRef>),
}

impl RelationValue {
    /// All referenced records, in order.
    pub fn refs(&self) -> Vec<EntityRef> {
        match self {
            RelationValue::Null => Vec::new(),
            RelationValue::One(r) => vec![*r],
            RelationValue::Many(rs) => rs.clone(),
        }
    }

    pub fn contains(&self, target: EntityRef) -> bool {
        match self {
            RelationValue::Null => false,
            RelationValue::One(r) => *r == target,
            RelationValue::Many(rs) => rs.contains(&target),
        }
    }
}

/// One entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity name in the metadata registry
    pub entity: String,
    /// Column values by property path
    pub values: BTreeMap<String, Value>,
    /// Relation values by property name
    pub relations: BTreeMap<String, RelationValue>,
}

impl EntityRecord {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            values: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Builder-style value setter.
    pub fn with(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(path.into(), value.into());
        self
    }

    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(path.into(), value.into());
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }

    /// Remove a value, making the property undefined again.
    pub fn unset(&mut self, path: &str) -> Option<Value> {
        self.values.remove(path)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    pub fn set_relation(&mut self, name: impl Into<String>, value: RelationValue) {
        self.relations.insert(name.into(), value);
    }

    /// Forget a relation value, making it "not loaded".
    pub fn unset_relation(&mut self, name: &str) -> Option<RelationValue> {
        self.relations.remove(name)
    }
}

/// Arena of entity records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityGraph {
    records: Vec<EntityRecord>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record and return its handle.
    pub fn insert(&mut self, record: EntityRecord) -> EntityRef {
        self.records.push(record);
        EntityRef(self.records.len() - 1)
    }

    pub fn get(&self, r: EntityRef) -> Option<&EntityRecord> {
        self.records.get(r.0)
    }

    pub fn get_mut(&mut self, r: EntityRef) -> Option<&mut EntityRecord> {
        self.records.get_mut(r.0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityRef, &EntityRecord)> {
        self.records.iter().enumerate().map(|(i, r)| (EntityRef(i), r))
    }

    /// Set a to-one relation.
    pub fn link(&mut self, from: EntityRef, relation: &str, to: EntityRef) {
        self[from].set_relation(relation, RelationValue::One(to));
    }

    /// Append to a to-many relation, creating it when absent.
    pub fn push_related(&mut self, from: EntityRef, relation: &str, to: EntityRef) {
        let record = &mut self[from];
        match record.relations.get_mut(relation) {
            Some(RelationValue::Many(items)) => {
                if !items.contains(&to) {
                    items.push(to);
                }
            }
            _ => record.set_relation(relation, RelationValue::Many(vec![to])),
        }
    }

    /// Set a relation to an explicit null.
    pub fn set_null(&mut self, from: EntityRef, relation: &str) {
        self[from].set_relation(relation, RelationValue::Null);
    }

    /// Records related to `from` through `relation`.
    pub fn related(&self, from: EntityRef, relation: &str) -> Vec<EntityRef> {
        self.get(from)
            .and_then(|r| r.relation(relation))
            .map(RelationValue::refs)
            .unwrap_or_default()
    }

    /// Records whose relation values mention `target`.
    pub fn referrers(&self, target: EntityRef) -> Vec<(EntityRef, String)> {
        let mut out = Vec::new();
        for (r, record) in self.iter() {
            for (name, value) in &record.relations {
                if value.contains(target) {
                    out.push((r, name.clone()));
                }
            }
        }
        out
    }
}

impl Index<EntityRef> for EntityGraph {
    type Output = EntityRecord;

    fn index(&self, r: EntityRef) -> &EntityRecord {
        &self.records[r.0]
    }
}

impl IndexMut<EntityRef> for EntityGraph {
    fn index_mut(&mut self, r: EntityRef) -> &mut EntityRecord {
        &mut self.records[r.0]
    }
}

/// Primary key of an entity as `(property path, value)` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityIdentifier {
    pub values: Vec<(String, Value)>,
}

impl EntityIdentifier {
    pub fn new(values: Vec<(String, Value)>) -> Self {
        Self { values }
    }

    /// Single-column identifier.
    pub fn single(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            values: vec![(path.into(), value.into())],
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.iter().find(|(p, _)| p == path).map(|(_, v)| v)
    }

    /// Stable key; equal for loosely-equal integer widths.
    pub fn key(&self) -> String {
        self.values
            .iter()
            .map(|(p, v)| format!("{p}={}", v.identity_fragment()))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Compare ignoring integer widths and uuid text forms.
    pub fn matches(&self, other: &EntityIdentifier) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .all(|(p, v)| other.get(p).is_some_and(|o| v.loosely_equals(o)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_links_and_cycles() {
        let mut graph = EntityGraph::new();
        let user = graph.insert(EntityRecord::new("User").with("name", "ann"));
        let post = graph.insert(EntityRecord::new("Post").with("title", "hello"));
        graph.link(post, "author", user);
        graph.push_related(user, "posts", post);
        graph.push_related(user, "posts", post);

        assert_eq!(graph.related(user, "posts"), vec![post]);
        assert_eq!(graph.related(post, "author"), vec![user]);
        assert_eq!(graph.referrers(user), vec![(post, "author".to_string())]);
        assert_eq!(graph[post].get("title"), Some(&Value::from("hello")));
    }

    #[test]
    fn test_absent_relation_is_not_loaded() {
        let mut graph = EntityGraph::new();
        let post = graph.insert(EntityRecord::new("Post"));
        assert!(graph[post].relation("author").is_none());
        graph.set_null(post, "author");
        assert_eq!(graph[post].relation("author"), Some(&RelationValue::Null));
        assert!(graph.related(post, "author").is_empty());
    }

    #[test]
    fn test_identifier_key_ignores_int_width() {
        let a = EntityIdentifier::single("id", Value::Int(7));
        let b = EntityIdentifier::single("id", Value::BigInt(7));
        assert_eq!(a.key(), b.key());
        assert!(a.matches(&b));
        assert!(!a.matches(&EntityIdentifier::single("id", Value::BigInt(8))));
    }
}
