//! Loader behind [`Lazy`](persisto_core::Lazy) relation values.

use std::future::Future;

use asupersync::{Cx, Outcome};
use persisto_core::{ConnectionProvider, Error, LazyKey, LazyLoader};
use persisto_query::LoadedEntities;

use crate::manager::EntityManager;

/// Fetches lazy relations through an [`EntityManager`].
///
/// Each load checks out its own runner on the read replica, selects the
/// owner joined to the relation and returns the related entities as roots.
#[derive(Debug)]
pub struct RelationLoader<P: ConnectionProvider> {
    manager: EntityManager<P>,
}

impl<P: ConnectionProvider> Clone for RelationLoader<P> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<P: ConnectionProvider> RelationLoader<P> {
    pub fn new(manager: EntityManager<P>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &EntityManager<P> {
        &self.manager
    }
}

impl<P: ConnectionProvider> LazyLoader<LoadedEntities> for RelationLoader<P> {
    fn load(&mut self, cx: &Cx, key: &LazyKey) -> impl Future<Output = Outcome<LoadedEntities, Error>> + Send {
        let manager = self.manager.clone();
        let key = key.clone();
        async move { manager.load_relation(cx, &key).await }
    }
}
