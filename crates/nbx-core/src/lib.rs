//! NBX Core - angular object binding for notebooks
//!
//! The reactive layer between running paragraphs and rendered templates:
//! - Binds named values into note or paragraph scopes
//! - Broadcasts every committed change to renderer sessions
//! - Dispatches watchers in registration order when a value changes
//! - Lets a watcher run another paragraph and wait for it to finish
//!
//! # Example
//!
//! ```rust,ignore
//! use nbx_core::prelude::*;
//!
//! # async fn example(scheduler: std::sync::Arc<dyn UnitScheduler>) -> Result<(), AngularError> {
//! let binder = std::sync::Arc::new(Binder::with_scheduler(BinderConfig::new(), scheduler));
//! let scope = Scope::note("2A94M5J1Z");
//! let ctx = ExecutionContext::for_paragraph("2A94M5J1Z", "p4");
//!
//! binder.bind(&scope, "myVar", &0, &ctx).await?;
//!
//! let trigger = std::sync::Arc::clone(binder.trigger());
//! binder.watch(&scope, "myVar", watch_fn(move |_before, _after, ctx| {
//!     let trigger = std::sync::Arc::clone(&trigger);
//!     async move {
//!         trigger.run_unit("p3", &ctx).await;
//!         anyhow::Ok(())
//!     }
//! }));
//!
//! // Resolves only after p3 has finished running
//! binder.bind(&scope, "myVar", &1, &ctx).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod binder;
pub mod broadcast;
pub mod config;
pub mod context;
pub mod error;
pub mod trigger;
pub mod watch;

// Re-exports for convenience
pub use binder::{BindOutcome, Binder};
pub use broadcast::{ChangeBroadcaster, ChangeEvent, ChangeKind, ChangeStream, StreamError};
pub use config::BinderConfig;
pub use context::{ExecutionContext, SessionId};
pub use error::{AngularError, CallbackError, SchedulerError};
pub use nbx_object::{AngularValue, BoundObject, NoteId, ParagraphId, Scope};
pub use trigger::{
    AbortReason, RunId, RunReport, TriggerBridge, TriggerRequest, UnitHandle, UnitId,
    UnitScheduler, UnitStatus,
};
pub use watch::{watch_fn, FnWatcher, WatchHandle, WatchRegistry, Watcher, WatcherId};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the binder
    pub use crate::{
        watch_fn, AngularError, AngularValue, BindOutcome, Binder, BinderConfig, ChangeEvent,
        ChangeKind, ExecutionContext, Scope, TriggerBridge, UnitId, UnitScheduler, UnitStatus,
        WatchHandle, Watcher,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
