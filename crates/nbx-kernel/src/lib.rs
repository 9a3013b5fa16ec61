//! NBX Kernel - notebook simulator around the angular binder
//!
//! Provides the pieces a notebook server wires around [`nbx_core::Binder`]:
//! - [`runtime`]: paragraphs, the `z` context they run with, and a
//!   [`nbx_core::UnitScheduler`] that executes them
//! - [`render`]: `{{key}}` templates kept current from a change stream
//! - [`scenario`]: end-to-end replays used by the `nbx-kernel` binary
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use nbx_kernel::prelude::*;
//!
//! let notebook = Notebook::standalone(BinderConfig::new(), "2A94M5J1Z");
//! notebook.add_paragraph("bind", paragraph_fn(|z| async move {
//!     z.angular_bind("myVar", &1).await?;
//!     anyhow::Ok(())
//! }));
//!
//! let mut renderer = TemplateRenderer::connect(notebook.binder(), notebook.scope(), "v={{myVar}}");
//! notebook.run("bind").await;
//! renderer.pump(notebook.binder())?;
//! assert_eq!(renderer.render(), "v=1");
//! ```

pub mod logging;
pub mod render;
pub mod runtime;
pub mod scenario;

pub use logging::{init_tracing, LogFormat};
pub use render::{RenderedView, Template, TemplateRenderer};
pub use runtime::{
    paragraph_fn, AngularContext, FnParagraph, Notebook, Paragraph, ParagraphResult,
    ParagraphScheduler,
};
pub use scenario::{ScenarioReport, ScenarioStep, StressReport};

/// Common imports for kernel users
pub mod prelude {
    pub use crate::render::TemplateRenderer;
    pub use crate::runtime::{paragraph_fn, AngularContext, Notebook, Paragraph};
    pub use nbx_core::prelude::*;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
