//! Binder: public bind / unbind / get / watch entry points
//!
//! # State machine per (scope, key)
//!
//! ```text
//!            bind (Created)          bind (Updated)
//! UNBOUND ─────────────────► BOUND ◄──────────────┐
//!    ▲                         │  └────────────────┘
//!    └──────── unbind ─────────┘   (watchers dropped, Removed)
//! ```
//!
//! # Critical Invariant
//!
//! Only the store mutation, the watcher snapshot and the broadcast happen
//! under the scope lock. Watchers run after the lock is released, one after
//! another in registration order, and `bind` resolves only when all of them
//! (and any paragraph runs they wait on) are done. A watcher may therefore
//! call back into the binder on any key.

use crate::broadcast::{ChangeBroadcaster, ChangeEvent, ChangeKind, ChangeStream};
use crate::config::BinderConfig;
use crate::context::ExecutionContext;
use crate::error::{AngularError, CallbackError};
use crate::trigger::{TriggerBridge, UnitId, UnitScheduler, UnitStatus};
use crate::watch::{WatchHandle, WatchRegistry, Watcher, WatcherId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use nbx_object::{AngularValue, BoundObject, NoteId, ObjectStore, Scope};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Everything the scope lock protects
#[derive(Debug)]
struct ScopeState {
    store: ObjectStore,
    watchers: WatchRegistry,
    /// Set by teardown; a closed state is never written again
    closed: bool,
}

impl ScopeState {
    fn new(scope: Scope) -> Self {
        Self {
            store: ObjectStore::new(scope),
            watchers: WatchRegistry::new(),
            closed: false,
        }
    }
}

type ScopeSlot = Arc<Mutex<ScopeState>>;

/// Result of a successful bind
#[derive(Debug, Clone, PartialEq)]
pub struct BindOutcome {
    /// Version assigned to the value
    pub version: u64,
    /// `Created` or `Updated`
    pub kind: ChangeKind,
    /// Value replaced by this bind
    pub previous: Option<AngularValue>,
    /// Watchers that completed without error
    pub delivered: usize,
    /// Watchers that failed, panicked or were refused
    pub failures: Vec<CallbackError>,
}

impl BindOutcome {
    /// Check if every watcher completed
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Angular object registry for all open notes
pub struct Binder {
    config: BinderConfig,
    scopes: DashMap<Scope, ScopeSlot>,
    broadcaster: ChangeBroadcaster,
    trigger: Arc<TriggerBridge>,
}

impl Binder {
    /// Create binder around an existing trigger bridge
    #[must_use]
    pub fn new(config: BinderConfig, trigger: Arc<TriggerBridge>) -> Self {
        Self {
            broadcaster: ChangeBroadcaster::new(config.broadcast_capacity),
            scopes: DashMap::new(),
            trigger,
            config,
        }
    }

    /// Create binder whose bridge sends every note to `scheduler`
    #[must_use]
    pub fn with_scheduler(config: BinderConfig, scheduler: Arc<dyn UnitScheduler>) -> Self {
        let trigger = Arc::new(TriggerBridge::new(&config).with_default_scheduler(scheduler));
        Self::new(config, trigger)
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BinderConfig {
        &self.config
    }

    /// Trigger bridge, for watchers that run other paragraphs
    #[inline]
    #[must_use]
    pub fn trigger(&self) -> &Arc<TriggerBridge> {
        &self.trigger
    }

    /// Bind a serializable value
    ///
    /// # Arguments
    /// * `scope` - Note or paragraph scope
    /// * `key` - Object name
    /// * `value` - Anything with a JSON representation
    /// * `context` - Who is binding; handed to watchers
    ///
    /// # Returns
    /// Assigned version and the result of every watcher invocation
    ///
    /// # Errors
    /// - `AngularError::Serialization` if the value has no JSON form
    /// - `AngularError::ValueTooLarge` if the encoding exceeds the limit
    ///
    /// The store is unchanged on error. Watcher failures are not errors;
    /// they are collected in [`BindOutcome::failures`].
    pub async fn bind<T: Serialize + ?Sized>(
        &self,
        scope: &Scope,
        key: &str,
        value: &T,
        context: &ExecutionContext,
    ) -> Result<BindOutcome, AngularError> {
        let value = AngularValue::encode(value).map_err(|source| AngularError::Serialization {
            key: key.to_owned(),
            source,
        })?;
        self.bind_value(scope, key, value, context).await
    }

    /// Bind an already encoded value
    ///
    /// # Errors
    /// Same as [`Binder::bind`].
    pub async fn bind_value(
        &self,
        scope: &Scope,
        key: &str,
        value: AngularValue,
        context: &ExecutionContext,
    ) -> Result<BindOutcome, AngularError> {
        self.check_size(key, &value)?;

        let (slot, previous, version, kind, watchers) = loop {
            let slot = self.slot(scope);
            let mut state = slot.lock();
            if state.closed {
                // Lost a race with teardown; the next slot is fresh
                continue;
            }

            let put = state.store.put(key, value.clone());
            let kind = if put.created() {
                ChangeKind::Created
            } else {
                ChangeKind::Updated
            };
            self.broadcaster.publish(
                scope,
                ChangeEvent {
                    scope: scope.clone(),
                    key: key.to_owned(),
                    kind,
                    value: Some(value.clone()),
                    version: put.version,
                },
            );
            let watchers = state.watchers.watchers_for(key);
            drop(state);
            break (slot, put.previous, put.version, kind, watchers);
        };

        debug!(
            scope = %scope,
            key,
            version,
            ?kind,
            watchers = watchers.len(),
            "angular object bound"
        );

        let mut outcome = BindOutcome {
            version,
            kind,
            previous,
            delivered: 0,
            failures: Vec::new(),
        };

        if watchers.is_empty() {
            return Ok(outcome);
        }

        if context.depth() >= self.config.max_cascade_depth {
            warn!(scope = %scope, key, depth = context.depth(), "cascade depth reached, watchers skipped");
            outcome.failures.push(CallbackError::CascadeDepthExceeded {
                key: key.to_owned(),
                depth: context.depth(),
            });
            return Ok(outcome);
        }

        let nested = context.descend();
        for (id, watcher) in watchers {
            if !Self::still_watching(&slot, key, id) {
                trace!(scope = %scope, key, watcher = %id, "watcher removed before dispatch");
                continue;
            }
            match Self::invoke(watcher, outcome.previous.clone(), value.clone(), nested.clone()).await {
                Ok(()) => outcome.delivered += 1,
                Err(failure) => {
                    let failure = failure.into_callback_error(id, key);
                    warn!(scope = %scope, key, watcher = %id, error = %failure, "watcher failed");
                    outcome.failures.push(failure);
                }
            }
        }

        Ok(outcome)
    }

    /// Current value of a key
    ///
    /// # Errors
    /// - `AngularError::NotFound` if the key is not bound
    pub fn get(&self, scope: &Scope, key: &str) -> Result<AngularValue, AngularError> {
        self.get_object(scope, key).map(|object| object.value)
    }

    /// Current value and version of a key
    ///
    /// # Errors
    /// - `AngularError::NotFound` if the key is not bound
    pub fn get_object(&self, scope: &Scope, key: &str) -> Result<BoundObject, AngularError> {
        let Some(slot) = self.existing_slot(scope) else {
            return Err(AngularError::NotFound {
                scope: scope.clone(),
                key: key.to_owned(),
            });
        };
        let state = slot.lock();
        Ok(state.store.get(key)?.clone())
    }

    /// Current value of a key decoded into `T`
    ///
    /// # Errors
    /// - `AngularError::NotFound` if the key is not bound
    /// - `AngularError::Serialization` if the value does not fit `T`
    pub fn get_as<T: DeserializeOwned>(&self, scope: &Scope, key: &str) -> Result<T, AngularError> {
        self.get(scope, key)?
            .decode()
            .map_err(|source| AngularError::Serialization {
                key: key.to_owned(),
                source,
            })
    }

    /// All objects of a scope, ordered by key
    ///
    /// Renderers call this on (re)connect to reconcile with the stream.
    #[must_use]
    pub fn snapshot(&self, scope: &Scope) -> Vec<BoundObject> {
        self.existing_slot(scope)
            .map(|slot| slot.lock().store.snapshot())
            .unwrap_or_default()
    }

    /// Remove a key and all its watchers
    ///
    /// Idempotent: unbinding a missing key returns `None` and leaves any
    /// pre-registered watchers in place.
    pub fn unbind(&self, scope: &Scope, key: &str) -> Option<BoundObject> {
        let slot = self.existing_slot(scope)?;
        let mut state = slot.lock();
        if state.closed {
            return None;
        }

        let removed = state.store.remove(key).ok()?;
        let dropped = state.watchers.remove_all_for_key(key);
        self.broadcaster.publish(
            scope,
            ChangeEvent {
                scope: scope.clone(),
                key: key.to_owned(),
                kind: ChangeKind::Removed,
                value: None,
                version: removed.version,
            },
        );
        drop(state);

        debug!(scope = %scope, key, version = removed.version, watchers = dropped, "angular object unbound");
        Some(removed)
    }

    /// Register a watcher; the key may be unbound
    pub fn watch(&self, scope: &Scope, key: &str, watcher: Arc<dyn Watcher>) -> WatchHandle {
        loop {
            let slot = self.slot(scope);
            let mut state = slot.lock();
            if state.closed {
                continue;
            }
            let id = state.watchers.add(key, watcher);
            debug!(scope = %scope, key, watcher = %id, "watcher registered");
            return WatchHandle::new(scope.clone(), key.to_owned(), id);
        }
    }

    /// Remove one watcher
    pub fn unwatch(&self, handle: &WatchHandle) -> bool {
        self.existing_slot(handle.scope())
            .is_some_and(|slot| slot.lock().watchers.remove(handle.key(), handle.id()))
    }

    /// Number of watchers on a key
    #[must_use]
    pub fn watcher_count(&self, scope: &Scope, key: &str) -> usize {
        self.existing_slot(scope)
            .map_or(0, |slot| slot.lock().watchers.count_for(key))
    }

    /// Subscribe to a scope's change stream
    #[must_use]
    pub fn subscribe(&self, scope: &Scope) -> ChangeStream {
        self.broadcaster.subscribe(scope)
    }

    /// Run another paragraph and wait for it
    pub async fn run_unit(
        &self,
        target: impl Into<UnitId>,
        context: &ExecutionContext,
    ) -> UnitStatus {
        self.trigger.run_unit(target, context).await
    }

    /// Destroy a scope
    ///
    /// Unbinds every key, drops every watcher and closes the change stream
    /// before returning. Tearing down a note scope is document deletion: it
    /// also destroys the note's paragraph scopes and aborts outstanding
    /// `run_unit` waits of the note.
    ///
    /// # Returns
    /// Number of objects removed
    pub fn teardown(&self, scope: &Scope) -> usize {
        if scope.is_note_scope() {
            return self.teardown_note(scope.note_id());
        }
        self.close_scope(scope)
    }

    /// Destroy every scope of a note and abort its outstanding runs
    pub fn teardown_note(&self, note: &NoteId) -> usize {
        let scopes: Vec<Scope> = self
            .scopes
            .iter()
            .filter(|entry| entry.key().belongs_to(note))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = scopes.iter().map(|scope| self.close_scope(scope)).sum();
        // Streams may exist for scopes that never held an object
        self.broadcaster.close_note(note);
        self.trigger.cancel_note(note);

        info!(note = %note, scopes = scopes.len(), objects = removed, "note torn down");
        removed
    }

    /// Number of live scopes
    #[inline]
    #[must_use]
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    fn close_scope(&self, scope: &Scope) -> usize {
        let Some((_, slot)) = self.scopes.remove(scope) else {
            self.broadcaster.close(scope);
            return 0;
        };

        let mut state = slot.lock();
        state.closed = true;
        let drained = state.store.drain();
        let watchers = state.watchers.clear();
        for object in &drained {
            self.broadcaster.publish(
                scope,
                ChangeEvent {
                    scope: scope.clone(),
                    key: object.key.clone(),
                    kind: ChangeKind::Removed,
                    value: None,
                    version: object.version,
                },
            );
        }
        drop(state);
        self.broadcaster.close(scope);

        debug!(scope = %scope, objects = drained.len(), watchers, "scope torn down");
        drained.len()
    }

    fn slot(&self, scope: &Scope) -> ScopeSlot {
        match self.scopes.entry(scope.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                // A recreated scope starts a new lifetime for its note
                self.trigger.reopen_note(scope.note_id());
                let slot = Arc::new(Mutex::new(ScopeState::new(scope.clone())));
                entry.insert(Arc::clone(&slot));
                slot
            }
        }
    }

    fn existing_slot(&self, scope: &Scope) -> Option<ScopeSlot> {
        self.scopes.get(scope).map(|entry| Arc::clone(entry.value()))
    }

    fn still_watching(slot: &ScopeSlot, key: &str, id: WatcherId) -> bool {
        let state = slot.lock();
        !state.closed && state.watchers.contains(key, id)
    }

    fn check_size(&self, key: &str, value: &AngularValue) -> Result<(), AngularError> {
        let size = value
            .encoded_len()
            .map_err(|source| AngularError::Serialization {
                key: key.to_owned(),
                source,
            })?;
        if size > self.config.max_value_bytes {
            return Err(AngularError::ValueTooLarge {
                key: key.to_owned(),
                size,
                limit: self.config.max_value_bytes,
            });
        }
        Ok(())
    }

    async fn invoke(
        watcher: Arc<dyn Watcher>,
        previous: Option<AngularValue>,
        next: AngularValue,
        context: ExecutionContext,
    ) -> Result<(), InvokeFailure> {
        match AssertUnwindSafe(watcher.on_change(previous, next, context))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(InvokeFailure::Failed(format!("{err:#}"))),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(message = %message, "watcher panicked");
                Err(InvokeFailure::Panicked(message))
            }
        }
    }
}

impl fmt::Debug for Binder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binder")
            .field("config", &self.config)
            .field("scopes", &self.scopes.len())
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

enum InvokeFailure {
    Failed(String),
    Panicked(String),
}

impl InvokeFailure {
    fn into_callback_error(self, watcher: WatcherId, key: &str) -> CallbackError {
        match self {
            Self::Failed(message) => CallbackError::Failed {
                watcher,
                key: key.to_owned(),
                message,
            },
            Self::Panicked(message) => CallbackError::Panicked {
                watcher,
                key: key.to_owned(),
                message,
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
