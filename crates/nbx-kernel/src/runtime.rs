//! Simulated paragraph runtime
//!
//! Stands in for the interpreter processes of a notebook. A paragraph is an
//! async body receiving an [`AngularContext`], the handle user code uses to
//! bind, read, watch and unbind angular objects, print output and run other
//! paragraphs. [`ParagraphScheduler`] runs those bodies on the tokio runtime
//! and implements [`UnitScheduler`] so the binder's trigger bridge can drive it.

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use nbx_core::{
    AngularValue, BindOutcome, Binder, BinderConfig, ExecutionContext, NoteId, ParagraphId, RunId,
    SchedulerError, Scope, TriggerBridge, UnitHandle, UnitId, UnitScheduler, UnitStatus,
    WatchHandle, Watcher,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Paragraph body
#[async_trait]
pub trait Paragraph: Send + Sync {
    /// Execute once
    async fn run(&self, z: AngularContext) -> anyhow::Result<()>;
}

/// Paragraph backed by an async closure
pub struct FnParagraph<F>(F);

#[async_trait]
impl<F, Fut> Paragraph for FnParagraph<F>
where
    F: Fn(AngularContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, z: AngularContext) -> anyhow::Result<()> {
        (self.0)(z).await
    }
}

/// Build a paragraph from an async closure
pub fn paragraph_fn<F, Fut>(f: F) -> Arc<dyn Paragraph>
where
    F: Fn(AngularContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnParagraph(f))
}

/// Interpreter-side handle onto the binder for one paragraph run
///
/// Cheap to clone; watchers registered from a paragraph usually capture a
/// clone to run other paragraphs later. Holds the binder weakly, so a
/// captured handle never keeps a closed notebook alive.
#[derive(Clone)]
pub struct AngularContext {
    binder: Weak<Binder>,
    context: ExecutionContext,
    output: Arc<Mutex<String>>,
}

impl AngularContext {
    /// Create handle for a run
    #[must_use]
    pub fn new(binder: Weak<Binder>, context: ExecutionContext) -> Self {
        Self {
            binder,
            context,
            output: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Context of the running paragraph
    #[inline]
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Bind into the note scope
    ///
    /// # Errors
    /// Fails if the notebook is closed or the binder rejects the value.
    pub async fn angular_bind<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> anyhow::Result<BindOutcome> {
        let binder = self.binder()?;
        Ok(binder
            .bind(&self.note_scope(), key, value, &self.context)
            .await?)
    }

    /// Bind into the running paragraph's own scope
    ///
    /// # Errors
    /// Fails outside a paragraph run, if the notebook is closed, or if the
    /// binder rejects the value.
    pub async fn angular_bind_local<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> anyhow::Result<BindOutcome> {
        let binder = self.binder()?;
        let scope = self.paragraph_scope()?;
        Ok(binder.bind(&scope, key, value, &self.context).await?)
    }

    /// Read from the note scope; `None` when unbound
    #[must_use]
    pub fn angular(&self, key: &str) -> Option<AngularValue> {
        let binder = self.binder.upgrade()?;
        binder.get(&self.note_scope(), key).ok()
    }

    /// Read from the running paragraph's scope
    #[must_use]
    pub fn angular_local(&self, key: &str) -> Option<AngularValue> {
        let binder = self.binder.upgrade()?;
        let scope = self.paragraph_scope().ok()?;
        binder.get(&scope, key).ok()
    }

    /// Unbind from the note scope
    ///
    /// # Errors
    /// Fails if the notebook is closed.
    pub fn angular_unbind(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.binder()?.unbind(&self.note_scope(), key).is_some())
    }

    /// Unbind from the running paragraph's scope
    ///
    /// # Errors
    /// Fails outside a paragraph run or if the notebook is closed.
    pub fn angular_unbind_local(&self, key: &str) -> anyhow::Result<bool> {
        let scope = self.paragraph_scope()?;
        Ok(self.binder()?.unbind(&scope, key).is_some())
    }

    /// Watch a note-scope key
    ///
    /// # Errors
    /// Fails if the notebook is closed.
    pub fn angular_watch(&self, key: &str, watcher: Arc<dyn Watcher>) -> anyhow::Result<WatchHandle> {
        Ok(self.binder()?.watch(&self.note_scope(), key, watcher))
    }

    /// Stop a watcher registered with [`AngularContext::angular_watch`]
    ///
    /// # Errors
    /// Fails if the notebook is closed.
    pub fn angular_unwatch(&self, handle: &WatchHandle) -> anyhow::Result<bool> {
        Ok(self.binder()?.unwatch(handle))
    }

    /// Run another paragraph of this note and wait for it
    ///
    /// # Errors
    /// Fails if the notebook is closed.
    pub async fn run(&self, paragraph: &str) -> anyhow::Result<UnitStatus> {
        self.run_with(paragraph, &self.context).await
    }

    /// Run another paragraph on behalf of `context`
    ///
    /// Watchers pass the context they were handed so cascade depth carries
    /// through the triggered run.
    ///
    /// # Errors
    /// Fails if the notebook is closed.
    pub async fn run_with(
        &self,
        paragraph: &str,
        context: &ExecutionContext,
    ) -> anyhow::Result<UnitStatus> {
        let binder = self.binder()?;
        Ok(binder.run_unit(paragraph, context).await)
    }

    /// Append to the paragraph output
    pub fn print(&self, text: impl AsRef<str>) {
        self.output.lock().push_str(text.as_ref());
    }

    /// Append a line to the paragraph output
    pub fn println(&self, text: impl AsRef<str>) {
        let mut output = self.output.lock();
        output.push_str(text.as_ref());
        output.push('\n');
    }

    /// Output written so far
    #[must_use]
    pub fn output(&self) -> String {
        self.output.lock().clone()
    }

    fn binder(&self) -> anyhow::Result<Arc<Binder>> {
        self.binder.upgrade().context("notebook is closed")
    }

    fn note_scope(&self) -> Scope {
        Scope::note(self.context.note().clone())
    }

    fn paragraph_scope(&self) -> anyhow::Result<Scope> {
        let paragraph = self
            .context
            .paragraph()
            .context("paragraph scope used outside a paragraph run")?;
        Ok(Scope::paragraph(
            self.context.note().clone(),
            paragraph.clone(),
        ))
    }
}

impl fmt::Debug for AngularContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AngularContext")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Latest run of a paragraph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParagraphResult {
    /// Terminal status, `None` while running
    pub status: Option<UnitStatus>,
    /// Output of the latest run
    pub output: String,
    /// Number of runs started
    pub runs: usize,
    /// Run that owns `status` and `output`; older overlapping runs never overwrite it
    pub latest: Option<RunId>,
}

struct RunSlot {
    status: Arc<watch::Sender<Option<UnitStatus>>>,
    task: AbortHandle,
}

/// Runs the paragraphs of one note
pub struct ParagraphScheduler {
    note: NoteId,
    binder: Weak<Binder>,
    paragraphs: DashMap<ParagraphId, Arc<dyn Paragraph>>,
    runs: DashMap<RunId, RunSlot>,
    results: Arc<DashMap<ParagraphId, ParagraphResult>>,
}

impl ParagraphScheduler {
    /// Create scheduler for a note
    #[must_use]
    pub fn new(note: NoteId, binder: Weak<Binder>) -> Self {
        Self {
            note,
            binder,
            paragraphs: DashMap::new(),
            runs: DashMap::new(),
            results: Arc::new(DashMap::new()),
        }
    }

    /// Add or replace a paragraph
    pub fn insert(&self, paragraph: impl Into<ParagraphId>, body: Arc<dyn Paragraph>) {
        self.paragraphs.insert(paragraph.into(), body);
    }

    /// Latest result of a paragraph
    #[must_use]
    pub fn result(&self, paragraph: &ParagraphId) -> Option<ParagraphResult> {
        self.results.get(paragraph).map(|entry| entry.value().clone())
    }

    /// Runs submitted but not yet awaited or cancelled
    #[must_use]
    pub fn tracked_runs(&self) -> usize {
        self.runs.len()
    }
}

#[async_trait]
impl UnitScheduler for ParagraphScheduler {
    async fn submit(
        &self,
        unit: &UnitId,
        context: &ExecutionContext,
    ) -> Result<UnitHandle, SchedulerError> {
        if context.note() != &self.note {
            return Err(SchedulerError::Rejected(format!(
                "{unit} submitted for note {} to scheduler of {}",
                context.note(),
                self.note
            )));
        }
        let paragraph = ParagraphId::new(unit.as_str());
        let body = self
            .paragraphs
            .get(&paragraph)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SchedulerError::UnknownUnit(unit.clone()))?;

        let handle = UnitHandle::new(unit.clone());
        {
            let mut result = self.results.entry(paragraph.clone()).or_default();
            result.status = None;
            result.output.clear();
            result.runs += 1;
            result.latest = Some(handle.run);
        }

        let status = Arc::new(watch::channel(None).0);
        let z = AngularContext::new(self.binder.clone(), context.for_unit(paragraph.clone()));

        let task = tokio::spawn({
            let status = Arc::clone(&status);
            let results = Arc::clone(&self.results);
            let run = handle.run;
            async move {
                let outcome = AssertUnwindSafe(body.run(z.clone())).catch_unwind().await;
                let terminal = match outcome {
                    Ok(Ok(())) => UnitStatus::Finished,
                    Ok(Err(err)) => {
                        z.println(format!("{err:#}"));
                        UnitStatus::Error
                    }
                    Err(_) => {
                        z.println("paragraph panicked");
                        UnitStatus::Error
                    }
                };
                if let Some(mut result) = results.get_mut(&paragraph) {
                    if result.latest == Some(run) {
                        result.status = Some(terminal);
                        result.output = z.output();
                    }
                }
                debug!(paragraph = %paragraph, run = %run, status = ?terminal, "paragraph finished");
                status.send_if_modified(|current| {
                    if current.is_some() {
                        return false;
                    }
                    *current = Some(terminal);
                    true
                });
            }
        });

        self.runs.insert(
            handle.run,
            RunSlot {
                status,
                task: task.abort_handle(),
            },
        );
        Ok(handle)
    }

    async fn await_terminal(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<UnitStatus, SchedulerError> {
        let mut receiver = self
            .runs
            .get(&handle.run)
            .map(|slot| slot.status.subscribe())
            .ok_or_else(|| SchedulerError::Communication(format!("run {} is not tracked", handle.run)))?;

        // No read guard may live across the cancel await
        let waited = tokio::time::timeout(timeout, receiver.wait_for(Option::is_some))
            .await
            .map(|received| received.map(|status| *status));
        let status = match waited {
            Err(_elapsed) => {
                self.cancel(handle).await;
                return Ok(UnitStatus::Aborted);
            }
            Ok(Err(_closed)) => {
                return Err(SchedulerError::Communication(format!(
                    "run {} dropped without status",
                    handle.run
                )))
            }
            Ok(Ok(status)) => status.unwrap_or(UnitStatus::Error),
        };

        self.runs.remove(&handle.run);
        Ok(status)
    }

    async fn cancel(&self, handle: &UnitHandle) {
        let Some((_, slot)) = self.runs.remove(&handle.run) else {
            return;
        };
        slot.task.abort();
        let aborted = slot.status.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(UnitStatus::Aborted);
            true
        });
        if aborted {
            if let Some(mut result) = self.results.get_mut(&ParagraphId::new(handle.unit.as_str())) {
                if result.latest == Some(handle.run) {
                    result.status = Some(UnitStatus::Aborted);
                }
            }
            warn!(unit = %handle.unit, run = %handle.run, "paragraph run aborted");
        }
    }
}

impl fmt::Debug for ParagraphScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParagraphScheduler")
            .field("note", &self.note)
            .field("paragraphs", &self.paragraphs.len())
            .field("runs", &self.runs.len())
            .finish_non_exhaustive()
    }
}

/// An open note: its paragraphs wired to a shared binder
#[derive(Debug)]
pub struct Notebook {
    note: NoteId,
    binder: Arc<Binder>,
    scheduler: Arc<ParagraphScheduler>,
}

impl Notebook {
    /// Open a note on a shared binder and route its runs to a new scheduler
    #[must_use]
    pub fn open(binder: &Arc<Binder>, note: impl Into<NoteId>) -> Self {
        let note = note.into();
        let scheduler = Arc::new(ParagraphScheduler::new(note.clone(), Arc::downgrade(binder)));
        binder
            .trigger()
            .register_scheduler(note.clone(), Arc::clone(&scheduler) as Arc<dyn UnitScheduler>);
        info!(note = %note, "notebook opened");
        Self {
            note,
            binder: Arc::clone(binder),
            scheduler,
        }
    }

    /// Open a note on a binder of its own
    #[must_use]
    pub fn standalone(config: BinderConfig, note: impl Into<NoteId>) -> Self {
        let trigger = Arc::new(TriggerBridge::new(&config));
        let binder = Arc::new(Binder::new(config, trigger));
        Self::open(&binder, note)
    }

    /// Note ID
    #[inline]
    #[must_use]
    pub fn note(&self) -> &NoteId {
        &self.note
    }

    /// Shared binder
    #[inline]
    #[must_use]
    pub fn binder(&self) -> &Arc<Binder> {
        &self.binder
    }

    /// Paragraph scheduler of this note
    #[inline]
    #[must_use]
    pub fn scheduler(&self) -> &Arc<ParagraphScheduler> {
        &self.scheduler
    }

    /// Note-level scope
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::note(self.note.clone())
    }

    /// Scope of one paragraph
    #[must_use]
    pub fn paragraph_scope(&self, paragraph: impl Into<ParagraphId>) -> Scope {
        Scope::paragraph(self.note.clone(), paragraph)
    }

    /// Add or replace a paragraph
    pub fn add_paragraph(&self, paragraph: impl Into<ParagraphId>, body: Arc<dyn Paragraph>) {
        self.scheduler.insert(paragraph, body);
    }

    /// Run a paragraph as the "run" button does, and wait for it
    pub async fn run(&self, paragraph: &str) -> UnitStatus {
        self.binder
            .run_unit(paragraph, &ExecutionContext::new(self.note.clone()))
            .await
    }

    /// Latest result of a paragraph
    #[must_use]
    pub fn result(&self, paragraph: &str) -> Option<ParagraphResult> {
        self.scheduler.result(&ParagraphId::new(paragraph))
    }

    /// Output of the latest run of a paragraph
    #[must_use]
    pub fn output(&self, paragraph: &str) -> Option<String> {
        self.result(paragraph).map(|result| result.output)
    }

    /// Delete the note: tear down its scopes, abort its runs, drop its scheduler
    pub fn close(self) -> usize {
        let removed = self.binder.teardown_note(&self.note);
        self.binder.trigger().unregister_scheduler(&self.note);
        info!(note = %self.note, objects = removed, "notebook closed");
        removed
    }
}
