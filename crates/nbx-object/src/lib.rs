//! NBX Object Store
//!
//! Scoped storage for angular objects: named values that a notebook exposes
//! to rendered templates and to watchers.
//!
//! # Overview
//!
//! - **Scope**: isolation boundary, one per note or per paragraph
//! - **AngularValue**: opaque JSON-serializable value
//! - **BoundObject**: key, value, scope and a monotonic version
//! - **ObjectStore**: the key/value table of a single scope
//!
//! # Example
//!
//! ```rust
//! use nbx_object::{AngularValue, ObjectStore, Scope};
//!
//! let mut store = ObjectStore::new(Scope::note("2A94M5J1Z"));
//!
//! let first = store.put("myVar", AngularValue::from(1));
//! assert_eq!(first.version, 1);
//!
//! let second = store.put("myVar", AngularValue::from(2));
//! assert_eq!(second.version, 2);
//! assert_eq!(second.previous, Some(AngularValue::from(1)));
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod scope;
pub mod store;
pub mod value;

// Re-exports
pub use error::ObjectError;
pub use scope::{NoteId, ParagraphId, Scope};
pub use store::{BoundObject, ObjectStore, PutOutcome};
pub use value::AngularValue;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for object store operations
    pub use crate::{
        AngularValue, BoundObject, NoteId, ObjectError, ObjectStore, ParagraphId, PutOutcome,
        Scope,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
