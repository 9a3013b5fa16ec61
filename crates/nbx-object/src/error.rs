//! Error types for the object store

use crate::scope::Scope;

/// Object store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    /// No object is bound under this key
    #[error("angular object '{key}' not found in {scope}")]
    NotFound {
        /// Scope that was searched
        scope: Scope,
        /// Missing key
        key: String,
    },
}

impl ObjectError {
    /// Create a not-found error
    #[inline]
    #[must_use]
    pub fn not_found(scope: &Scope, key: &str) -> Self {
        Self::NotFound {
            scope: scope.clone(),
            key: key.to_owned(),
        }
    }
}
