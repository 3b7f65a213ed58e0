//! Entity subscribers and event broadcasting.
//!
//! A subscriber observes persistence events for every entity (or for the one
//! entity named by [`EntitySubscriber::listen_to`]) plus transaction
//! boundaries. Entity listeners registered on the schema run first, then
//! subscribers in registration order. The first error aborts the operation.

use std::fmt;
use std::sync::Arc;

use crate::connection::IsolationLevel;
use crate::entity::{EntityIdentifier, EntityRecord, EntityRef};
use crate::error::Result;
use crate::metadata::{EntityMetadata, ListenerKind};

/// A persistence or load event for one entity.
pub struct EntityEvent<'a> {
    pub metadata: &'a EntityMetadata,
    pub entity: EntityRef,
    pub record: &'a mut EntityRecord,
    /// Identifier of the affected row, when known
    pub identifier: Option<EntityIdentifier>,
    /// Property paths written by an update
    pub updated_columns: &'a [String],
}

/// A transaction boundary event.
#[derive(Debug, Clone, Copy)]
pub struct TransactionEvent {
    pub isolation: Option<IsolationLevel>,
}

/// Transaction boundaries a subscriber can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    BeforeStart,
    AfterStart,
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
}

/// Observer of persistence events.
#[allow(unused_variables)]
pub trait EntitySubscriber: Send + Sync {
    /// Restrict to one entity name; `None` listens to all entities.
    fn listen_to(&self) -> Option<&str> {
        None
    }

    fn before_transaction_start(&self, event: &TransactionEvent) -> Result<()> {
        Ok(())
    }

    fn after_transaction_start(&self, event: &TransactionEvent) -> Result<()> {
        Ok(())
    }

    fn before_transaction_commit(&self, event: &TransactionEvent) -> Result<()> {
        Ok(())
    }

    fn after_transaction_commit(&self, event: &TransactionEvent) -> Result<()> {
        Ok(())
    }

    fn before_transaction_rollback(&self, event: &TransactionEvent) -> Result<()> {
        Ok(())
    }

    fn after_transaction_rollback(&self, event: &TransactionEvent) -> Result<()> {
        Ok(())
    }

    fn before_insert(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn after_insert(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn before_update(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn after_update(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn before_remove(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn after_remove(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn before_soft_remove(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn after_soft_remove(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn before_recover(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn after_recover(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn after_load(&self, event: &mut EntityEvent<'_>) -> Result<()> {
        Ok(())
    }
}

/// Registered subscribers of a data source.
#[derive(Clone, Default)]
pub struct SubscriberSet {
    subscribers: Vec<Arc<dyn EntitySubscriber>>,
}

impl fmt::Debug for SubscriberSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("len", &self.subscribers.len())
            .finish()
    }
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscriber: Arc<dyn EntitySubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Run entity listeners of `kind`, then matching subscribers.
    pub fn broadcast(&self, kind: ListenerKind, event: &mut EntityEvent<'_>) -> Result<()> {
        event.metadata.run_listeners(kind, event.record)?;
        for subscriber in &self.subscribers {
            if subscriber
                .listen_to()
                .is_some_and(|name| !listens_to(event.metadata, name))
            {
                continue;
            }
            match kind {
                ListenerKind::BeforeInsert => subscriber.before_insert(event)?,
                ListenerKind::AfterInsert => subscriber.after_insert(event)?,
                ListenerKind::BeforeUpdate => subscriber.before_update(event)?,
                ListenerKind::AfterUpdate => subscriber.after_update(event)?,
                ListenerKind::BeforeRemove => subscriber.before_remove(event)?,
                ListenerKind::AfterRemove => subscriber.after_remove(event)?,
                ListenerKind::BeforeSoftRemove => subscriber.before_soft_remove(event)?,
                ListenerKind::AfterSoftRemove => subscriber.after_soft_remove(event)?,
                ListenerKind::BeforeRecover => subscriber.before_recover(event)?,
                ListenerKind::AfterRecover => subscriber.after_recover(event)?,
                ListenerKind::AfterLoad => subscriber.after_load(event)?,
            }
        }
        Ok(())
    }

    /// Notify every subscriber of a transaction boundary.
    pub fn broadcast_transaction(&self, phase: TransactionPhase, event: &TransactionEvent) -> Result<()> {
        for subscriber in &self.subscribers {
            match phase {
                TransactionPhase::BeforeStart => subscriber.before_transaction_start(event)?,
                TransactionPhase::AfterStart => subscriber.after_transaction_start(event)?,
                TransactionPhase::BeforeCommit => subscriber.before_transaction_commit(event)?,
                TransactionPhase::AfterCommit => subscriber.after_transaction_commit(event)?,
                TransactionPhase::BeforeRollback => subscriber.before_transaction_rollback(event)?,
                TransactionPhase::AfterRollback => subscriber.after_transaction_rollback(event)?,
            }
        }
        Ok(())
    }
}

// A subscriber for a parent entity also sees its single-table children.
fn listens_to(metadata: &EntityMetadata, name: &str) -> bool {
    metadata.name == name || metadata.inheritance.ancestors.iter().any(|n| n == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnOptions, ColumnType, EntitySchema, MetadataArgs, build_metadata};
    use crate::value::Value;
    use std::sync::Mutex;

    struct Recorder {
        only: Option<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl EntitySubscriber for Recorder {
        fn listen_to(&self) -> Option<&str> {
            self.only
        }

        fn before_insert(&self, event: &mut EntityEvent<'_>) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("before_insert:{}", event.metadata.name));
            event.record.set("touched", true);
            Ok(())
        }

        fn after_transaction_commit(&self, _event: &TransactionEvent) -> Result<()> {
            self.seen.lock().unwrap().push("commit".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_broadcast_runs_listeners_then_filtered_subscribers() {
        let registry = build_metadata(
            &MetadataArgs::new()
                .entity(
                    EntitySchema::new("Post")
                        .column(ColumnOptions::primary_generated("id"))
                        .column(ColumnOptions::new("title", ColumnType::Text))
                        .listener(ListenerKind::BeforeInsert, |record| {
                            record.set("title", "from listener");
                            Ok(())
                        }),
                )
                .entity(EntitySchema::new("User").column(ColumnOptions::primary_generated("id"))),
        )
        .unwrap();
        let post = registry.by_name("Post").unwrap();

        let all = Arc::new(Recorder {
            only: None,
            seen: Mutex::new(Vec::new()),
        });
        let users_only = Arc::new(Recorder {
            only: Some("User"),
            seen: Mutex::new(Vec::new()),
        });
        let mut set = SubscriberSet::new();
        set.push(all.clone());
        set.push(users_only.clone());

        let mut record = EntityRecord::new("Post");
        let mut event = EntityEvent {
            metadata: post,
            entity: EntityRef(0),
            record: &mut record,
            identifier: None,
            updated_columns: &[],
        };
        set.broadcast(ListenerKind::BeforeInsert, &mut event).unwrap();

        assert_eq!(record.get("title"), Some(&Value::from("from listener")));
        assert_eq!(record.get("touched"), Some(&Value::Bool(true)));
        assert_eq!(all.seen.lock().unwrap().as_slice(), ["before_insert:Post"]);
        assert!(users_only.seen.lock().unwrap().is_empty());

        set.broadcast_transaction(TransactionPhase::AfterCommit, &TransactionEvent { isolation: None })
            .unwrap();
        assert_eq!(users_only.seen.lock().unwrap().as_slice(), ["commit"]);
    }
}
