//! Change fan-out to renderer sessions
//!
//! One `tokio::sync::broadcast` channel per scope. Delivery is at-least-once
//! for live subscribers; a subscriber that falls behind gets
//! [`StreamError::Lagged`] and must reconcile against the binder's snapshot.

use dashmap::DashMap;
use nbx_object::{AngularValue, BoundObject, NoteId, Scope};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// What happened to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// First bind, or bind after unbind
    Created,
    /// Rebind of a bound key
    Updated,
    /// Unbind or scope teardown
    Removed,
}

/// A committed change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Scope of the object
    pub scope: Scope,
    /// Object name
    pub key: String,
    /// Kind of change
    pub kind: ChangeKind,
    /// New value, `None` for removals
    pub value: Option<AngularValue>,
    /// Object version after the change (last version for removals)
    pub version: u64,
}

impl ChangeEvent {
    /// Ordering position of this event for its key
    ///
    /// A removal carries the version of the object it removed, so it sorts
    /// after the create or update that produced that version.
    fn position(&self) -> (u64, u8) {
        let rank = match self.kind {
            ChangeKind::Created | ChangeKind::Updated => 0,
            ChangeKind::Removed => 1,
        };
        (self.version, rank)
    }
}

/// Errors from a change stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Subscriber fell behind and missed events
    #[error("subscriber lagged, {0} events skipped")]
    Lagged(u64),

    /// Scope was torn down
    #[error("change stream closed")]
    Closed,
}

/// Per-scope change fan-out
#[derive(Debug)]
pub struct ChangeBroadcaster {
    channels: DashMap<Scope, broadcast::Sender<ChangeEvent>>,
    capacity: usize,
}

impl ChangeBroadcaster {
    /// Create broadcaster buffering `capacity` events per scope
    #[inline]
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a scope's changes
    #[must_use]
    pub fn subscribe(&self, scope: &Scope) -> ChangeStream {
        let receiver = self
            .channels
            .entry(scope.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(scope = %scope, "renderer subscribed");
        ChangeStream::new(scope.clone(), receiver)
    }

    /// Publish a change, returning the number of subscribers reached
    pub fn publish(&self, scope: &Scope, event: ChangeEvent) -> usize {
        self.channels
            .get(scope)
            .map_or(0, |sender| sender.send(event).unwrap_or(0))
    }

    /// Live subscribers of a scope
    #[must_use]
    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        self.channels
            .get(scope)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Close a scope's channel; subscribers drain buffered events then see `Closed`
    pub fn close(&self, scope: &Scope) -> bool {
        self.channels.remove(scope).is_some()
    }

    /// Close every channel of a note, including scopes that never held an object
    ///
    /// # Returns
    /// Number of channels closed
    pub fn close_note(&self, note: &NoteId) -> usize {
        let before = self.channels.len();
        self.channels.retain(|scope, _| !scope.belongs_to(note));
        before.saturating_sub(self.channels.len())
    }
}

/// Receiving end of a scope's change stream
///
/// Drops events it has already seen for a key, so at-least-once delivery
/// reaches the renderer at most once per version.
#[derive(Debug)]
pub struct ChangeStream {
    scope: Scope,
    receiver: broadcast::Receiver<ChangeEvent>,
    seen: HashMap<String, (u64, u8)>,
}

impl ChangeStream {
    fn new(scope: Scope, receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            scope,
            receiver,
            seen: HashMap::new(),
        }
    }

    /// Subscribed scope
    #[inline]
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Wait for the next unseen event
    ///
    /// # Errors
    /// - `StreamError::Lagged` if events were dropped; reconcile and keep reading
    /// - `StreamError::Closed` once the scope is torn down
    pub async fn recv(&mut self) -> Result<ChangeEvent, StreamError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.accept(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(scope = %self.scope, skipped, "change stream lagged");
                    return Err(StreamError::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(StreamError::Closed),
            }
        }
    }

    /// Next unseen event if one is buffered
    ///
    /// # Errors
    /// Same as [`ChangeStream::recv`].
    pub fn try_recv(&mut self) -> Result<Option<ChangeEvent>, StreamError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accept(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(scope = %self.scope, skipped, "change stream lagged");
                    return Err(StreamError::Lagged(skipped));
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(StreamError::Closed),
            }
        }
    }

    /// Record an object read during reconciliation as seen
    pub fn observe(&mut self, object: &BoundObject) {
        let position = (object.version, 0);
        let entry = self.seen.entry(object.key.clone()).or_insert(position);
        if position > *entry {
            *entry = position;
        }
    }

    /// Last version delivered or observed for a key
    #[must_use]
    pub fn last_seen(&self, key: &str) -> Option<u64> {
        self.seen.get(key).map(|(version, _)| *version)
    }

    fn accept(&mut self, event: &ChangeEvent) -> bool {
        let position = event.position();
        match self.seen.get(&event.key) {
            Some(last) if position <= *last => false,
            _ => {
                self.seen.insert(event.key.clone(), position);
                true
            }
        }
    }
}
