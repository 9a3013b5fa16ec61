//! Error types for NBX Core
//!
//! Provides error handling for:
//! - Missing objects on lookup
//! - Values rejected at bind time (too large, not serializable)
//! - Watcher callbacks that fail, panic or recurse too deeply
//! - Scheduler failures while running another paragraph
//!
//! Nothing here is fatal: every error is scoped to the call or callback that
//! produced it.

use crate::trigger::UnitId;
use crate::watch::WatcherId;
use nbx_object::{ObjectError, Scope};

/// Main binder error type
#[derive(Debug, thiserror::Error)]
pub enum AngularError {
    /// No object bound under the key
    #[error("angular object '{key}' not found in {scope}")]
    NotFound {
        /// Scope that was searched
        scope: Scope,
        /// Missing key
        key: String,
    },

    /// Value exceeds the configured size limit
    #[error("value for '{key}' is {size} bytes, limit is {limit}")]
    ValueTooLarge {
        /// Key being bound
        key: String,
        /// Encoded size in bytes
        size: usize,
        /// Configured limit in bytes
        limit: usize,
    },

    /// Value has no JSON representation
    #[error("value for '{key}' cannot be serialized: {source}")]
    Serialization {
        /// Key being bound or read
        key: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl AngularError {
    /// Check if error is a missing key
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if the store was left untouched because the value was rejected
    #[inline]
    #[must_use]
    pub fn is_rejected_value(&self) -> bool {
        matches!(self, Self::ValueTooLarge { .. } | Self::Serialization { .. })
    }
}

impl From<ObjectError> for AngularError {
    fn from(err: ObjectError) -> Self {
        match err {
            ObjectError::NotFound { scope, key } => Self::NotFound { scope, key },
        }
    }
}

/// Failure of a single watcher invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    /// Watcher returned an error
    #[error("watcher {watcher} on '{key}' failed: {message}")]
    Failed {
        /// Failing watcher
        watcher: WatcherId,
        /// Watched key
        key: String,
        /// Error chain rendered as text
        message: String,
    },

    /// Watcher panicked
    #[error("watcher {watcher} on '{key}' panicked: {message}")]
    Panicked {
        /// Panicking watcher
        watcher: WatcherId,
        /// Watched key
        key: String,
        /// Panic payload, if it was a string
        message: String,
    },

    /// Dispatch refused because the cascade is too deep
    #[error("cascade depth {depth} reached while dispatching '{key}'")]
    CascadeDepthExceeded {
        /// Key whose watchers were skipped
        key: String,
        /// Depth of the refused dispatch
        depth: u32,
    },
}

/// Errors reported by a unit scheduler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// No such paragraph in the note
    #[error("unknown execution unit: {0}")]
    UnknownUnit(UnitId),

    /// Scheduler refused the submission
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// Scheduler could not be reached
    #[error("scheduler communication failed: {0}")]
    Communication(String),
}
