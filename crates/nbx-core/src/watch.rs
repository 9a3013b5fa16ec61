//! Watchers and the per-scope watch registry
//!
//! A [`Watcher`] is an opaque async callback fired with
//! `(previous, next, context)` whenever the watched key changes. The
//! [`WatchRegistry`] keeps the watchers of one scope in registration order;
//! registering the same callback twice yields two independent watchers.

use crate::context::ExecutionContext;
use async_trait::async_trait;
use indexmap::IndexMap;
use nbx_object::{AngularValue, Scope};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use ulid::Ulid;

/// Unique watcher identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatcherId(pub Ulid);

impl WatcherId {
    /// Generate new watcher ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WatcherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Change callback
///
/// Implement this trait to react to value changes. `previous` is `None` when
/// the change created the object.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Handle one change
    async fn on_change(
        &self,
        previous: Option<AngularValue>,
        next: AngularValue,
        context: ExecutionContext,
    ) -> anyhow::Result<()>;
}

/// Watcher backed by an async closure
pub struct FnWatcher<F>(F);

impl<F> FnWatcher<F> {
    /// Wrap a closure
    #[inline]
    #[must_use]
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> fmt::Debug for FnWatcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWatcher").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Watcher for FnWatcher<F>
where
    F: Fn(Option<AngularValue>, AngularValue, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_change(
        &self,
        previous: Option<AngularValue>,
        next: AngularValue,
        context: ExecutionContext,
    ) -> anyhow::Result<()> {
        (self.0)(previous, next, context).await
    }
}

/// Build a shareable watcher from an async closure
pub fn watch_fn<F, Fut>(f: F) -> Arc<dyn Watcher>
where
    F: Fn(Option<AngularValue>, AngularValue, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnWatcher::new(f))
}

/// Registration returned by `Binder::watch`, used to unwatch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchHandle {
    scope: Scope,
    key: String,
    id: WatcherId,
}

impl WatchHandle {
    pub(crate) fn new(scope: Scope, key: String, id: WatcherId) -> Self {
        Self { scope, key, id }
    }

    /// Watched scope
    #[inline]
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Watched key
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Watcher ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> WatcherId {
        self.id
    }
}

/// Watchers of one scope, by key, in registration order
#[derive(Default)]
pub struct WatchRegistry {
    by_key: HashMap<String, IndexMap<WatcherId, Arc<dyn Watcher>>>,
}

impl WatchRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watcher; the key need not be bound yet
    pub fn add(&mut self, key: &str, watcher: Arc<dyn Watcher>) -> WatcherId {
        let id = WatcherId::new();
        self.by_key
            .entry(key.to_owned())
            .or_default()
            .insert(id, watcher);
        id
    }

    /// Remove one watcher
    pub fn remove(&mut self, key: &str, id: WatcherId) -> bool {
        let Some(watchers) = self.by_key.get_mut(key) else {
            return false;
        };
        let removed = watchers.shift_remove(&id).is_some();
        if watchers.is_empty() {
            self.by_key.remove(key);
        }
        removed
    }

    /// Remove every watcher of a key
    pub fn remove_all_for_key(&mut self, key: &str) -> usize {
        self.by_key.remove(key).map_or(0, |watchers| watchers.len())
    }

    /// Watchers of a key in registration order
    #[must_use]
    pub fn watchers_for(&self, key: &str) -> Vec<(WatcherId, Arc<dyn Watcher>)> {
        self.by_key
            .get(key)
            .map(|watchers| {
                watchers
                    .iter()
                    .map(|(id, watcher)| (*id, Arc::clone(watcher)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check if a watcher is still registered
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &str, id: WatcherId) -> bool {
        self.by_key
            .get(key)
            .is_some_and(|watchers| watchers.contains_key(&id))
    }

    /// Number of watchers on a key
    #[inline]
    #[must_use]
    pub fn count_for(&self, key: &str) -> usize {
        self.by_key.get(key).map_or(0, IndexMap::len)
    }

    /// Total number of watchers
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.values().map(IndexMap::len).sum()
    }

    /// Check if no watcher is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Drop every watcher
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        self.by_key.clear();
        count
    }
}

impl fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("keys", &self.by_key.len())
            .field("watchers", &self.len())
            .finish()
    }
}
