//! Template rendering against a live change stream
//!
//! A [`TemplateRenderer`] is one browser session showing an angular
//! paragraph. It keeps a local view of its scope, built from a snapshot and
//! kept current from the scope's change stream, and renders `{{key}}`
//! interpolations from that view. Lag and reconnect both fall back to a full
//! reconcile against the binder.

use nbx_core::{
    AngularError, AngularValue, BindOutcome, Binder, ChangeEvent, ChangeKind, ChangeStream,
    ExecutionContext, Scope, SessionId, StreamError, UnitStatus,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Binding(String),
}

/// Parsed `{{key}}` template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    /// Parse a template; an unterminated `{{` is kept as text
    #[must_use]
    pub fn parse(source: &str) -> Self {
        let mut parts = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            let Some(close) = rest[open + 2..].find("}}") else {
                break;
            };
            if open > 0 {
                parts.push(Part::Text(rest[..open].to_string()));
            }
            let key = rest[open + 2..open + 2 + close].trim();
            parts.push(Part::Binding(key.to_string()));
            rest = &rest[open + 2 + close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }

        Self { parts }
    }

    /// Keys interpolated by the template, in order of appearance
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            Part::Binding(key) => Some(key.as_str()),
            Part::Text(_) => None,
        })
    }

    /// Render with `lookup`; unbound keys render empty
    pub fn render<'a>(&self, lookup: impl Fn(&str) -> Option<&'a AngularValue>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Binding(key) => {
                    if let Some(value) = lookup(key) {
                        out.push_str(&value.render());
                    }
                }
            }
        }
        out
    }
}

/// Renderer session for one scope
#[derive(Debug)]
pub struct TemplateRenderer {
    scope: Scope,
    template: Template,
    session: SessionId,
    stream: ChangeStream,
    view: BTreeMap<String, AngularValue>,
    closed: bool,
}

/// Renderer state as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedView {
    /// Interpolated template
    pub html: String,
    /// Whether the scope was torn down
    pub closed: bool,
}

impl TemplateRenderer {
    /// Subscribe to `scope` and reconcile with its current objects
    #[must_use]
    pub fn connect(binder: &Binder, scope: Scope, template: &str) -> Self {
        let stream = binder.subscribe(&scope);
        let mut renderer = Self {
            template: Template::parse(template),
            session: SessionId::new(),
            view: BTreeMap::new(),
            closed: false,
            stream,
            scope,
        };
        renderer.reconcile(binder);
        info!(scope = %renderer.scope, session = %renderer.session, "renderer connected");
        renderer
    }

    /// Session ID of this renderer
    #[inline]
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Rendered scope
    #[inline]
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Replace the local view with the binder's current snapshot
    pub fn reconcile(&mut self, binder: &Binder) {
        self.view.clear();
        for object in binder.snapshot(&self.scope) {
            self.stream.observe(&object);
            self.view.insert(object.key, object.value);
        }
        debug!(scope = %self.scope, objects = self.view.len(), "renderer reconciled");
    }

    /// Resubscribe after a dropped connection
    pub fn reconnect(&mut self, binder: &Binder) {
        self.stream = binder.subscribe(&self.scope);
        self.closed = false;
        self.reconcile(binder);
    }

    /// Apply every buffered change
    ///
    /// # Returns
    /// Number of changes applied
    ///
    /// # Errors
    /// - `StreamError::Closed` once the scope is torn down; the view is cleared
    pub fn pump(&mut self, binder: &Binder) -> Result<usize, StreamError> {
        let mut applied = 0;
        loop {
            match self.stream.try_recv() {
                Ok(Some(event)) => {
                    self.apply(&event);
                    applied += 1;
                }
                Ok(None) => return Ok(applied),
                Err(StreamError::Lagged(_)) => self.reconcile(binder),
                Err(StreamError::Closed) => {
                    self.close();
                    return Err(StreamError::Closed);
                }
            }
        }
    }

    /// Wait for and apply the next change
    ///
    /// # Errors
    /// - `StreamError::Closed` once the scope is torn down
    pub async fn next_change(&mut self, binder: &Binder) -> Result<ChangeEvent, StreamError> {
        loop {
            match self.stream.recv().await {
                Ok(event) => {
                    self.apply(&event);
                    return Ok(event);
                }
                Err(StreamError::Lagged(_)) => self.reconcile(binder),
                Err(StreamError::Closed) => {
                    self.close();
                    return Err(StreamError::Closed);
                }
            }
        }
    }

    /// Locally known value of a key
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&AngularValue> {
        self.view.get(key)
    }

    /// Interpolate the template from the local view
    #[must_use]
    pub fn render(&self) -> String {
        self.template.render(|key| self.view.get(key))
    }

    /// Render together with connection state
    #[must_use]
    pub fn view(&self) -> RenderedView {
        RenderedView {
            html: self.render(),
            closed: self.closed,
        }
    }

    /// Check if the scope was torn down
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Push a UI edit (model change or click handler) into the binder
    ///
    /// # Errors
    /// Whatever the binder rejects.
    pub async fn update<T: serde::Serialize + Sync + ?Sized>(
        &self,
        binder: &Binder,
        key: &str,
        value: &T,
    ) -> Result<BindOutcome, AngularError> {
        binder.bind(&self.scope, key, value, &self.ui_context()).await
    }

    /// Run a paragraph from a UI element and wait for it
    pub async fn click_run(&self, binder: &Binder, paragraph: &str) -> UnitStatus {
        binder.run_unit(paragraph, &self.ui_context()).await
    }

    fn ui_context(&self) -> ExecutionContext {
        let context = match self.scope.paragraph_id() {
            Some(paragraph) => {
                ExecutionContext::for_paragraph(self.scope.note_id().clone(), paragraph.clone())
            }
            None => ExecutionContext::new(self.scope.note_id().clone()),
        };
        context.with_session(self.session)
    }

    fn apply(&mut self, event: &ChangeEvent) {
        match (event.kind, &event.value) {
            (ChangeKind::Created | ChangeKind::Updated, Some(value)) => {
                self.view.insert(event.key.clone(), value.clone());
            }
            _ => {
                self.view.remove(&event.key);
            }
        }
    }

    fn close(&mut self) {
        self.view.clear();
        self.closed = true;
        debug!(scope = %self.scope, "renderer stream closed");
    }
}
