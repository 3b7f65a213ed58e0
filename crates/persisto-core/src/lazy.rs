//! Deferred loading of lazy relations.

use std::fmt;
use std::future::Future;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use asupersync::{Cx, Outcome};

use crate::entity::EntityIdentifier;
use crate::error::Error;

/// Which relation of which row a [`Lazy`] value stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct LazyKey {
    pub entity: String,
    pub relation: String,
    pub owner: EntityIdentifier,
}

/// Fetches the value behind a [`LazyKey`].
pub trait LazyLoader<T> {
    fn load(&mut self, cx: &Cx, key: &LazyKey) -> impl Future<Output = Outcome<T, Error>> + Send;
}

/// A relation value that is fetched on first access.
///
/// # States
///
/// - **Empty**: the owner has no identifier yet, so there is nothing to load
/// - **Unloaded**: a key is known but the loader has not run
/// - **Loaded**: the value was fetched and cached
pub struct Lazy<T> {
    key: Option<LazyKey>,
    loaded: OnceLock<T>,
    load_attempted: AtomicBool,
}

impl<T> Lazy<T> {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            key: None,
            loaded: OnceLock::new(),
            load_attempted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn from_key(key: LazyKey) -> Self {
        Self {
            key: Some(key),
            loaded: OnceLock::new(),
            load_attempted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn loaded(value: T) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(value);
        Self {
            key: None,
            loaded: cell,
            load_attempted: AtomicBool::new(true),
        }
    }

    /// Load through `loader` unless already cached.
    ///
    /// Returns `None` for an empty value. A failed load leaves the value
    /// unloaded so it can be retried.
    pub async fn load<L>(&mut self, cx: &Cx, loader: &mut L) -> Outcome<Option<&T>, Error>
    where
        L: LazyLoader<T> + ?Sized,
    {
        if self.is_loaded() {
            return Outcome::Ok(self.get());
        }
        let Some(key) = self.key.clone() else {
            return Outcome::Ok(None);
        };
        match loader.load(cx, &key).await {
            Outcome::Ok(value) => {
                let _ = self.set_loaded(value);
                Outcome::Ok(self.get())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.loaded.get()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.load_attempted.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && !self.is_loaded()
    }

    #[must_use]
    pub fn key(&self) -> Option<&LazyKey> {
        self.key.as_ref()
    }

    /// Cache a value fetched elsewhere; fails if one is already cached.
    pub fn set_loaded(&self, value: T) -> Result<(), T> {
        self.loaded.set(value)?;
        self.load_attempted.store(true, Ordering::Release);
        Ok(())
    }

    /// Drop the cached value so the next `load` refetches.
    pub fn reset(&mut self) {
        self.loaded = OnceLock::new();
        self.load_attempted = AtomicBool::new(false);
    }
}

impl<T> Default for Lazy<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: fmt::Debug> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_loaded() {
            "loaded"
        } else if self.key.is_none() {
            "empty"
        } else {
            "unloaded"
        };
        f.debug_struct("Lazy")
            .field("state", &state)
            .field("key", &self.key)
            .field("loaded", &self.get())
            .finish()
    }
}
