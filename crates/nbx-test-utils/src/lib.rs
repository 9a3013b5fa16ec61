//! Testing utilities for NBX workspace
//!
//! Shared test helpers, fixtures, and scripted collaborators.

#![allow(missing_docs)]

use async_trait::async_trait;
use nbx_core::{
    AngularValue, Binder, BinderConfig, ExecutionContext, SchedulerError, Scope, UnitHandle,
    UnitId, UnitScheduler, UnitStatus, Watcher,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const TEST_NOTE: &str = "2A94M5J1Z";

pub fn note_scope() -> Scope {
    Scope::note(TEST_NOTE)
}

pub fn note_context() -> ExecutionContext {
    ExecutionContext::new(TEST_NOTE)
}

pub fn paragraph_context(paragraph: &str) -> ExecutionContext {
    ExecutionContext::for_paragraph(TEST_NOTE, paragraph)
}

pub fn setup_binder(scheduler: Arc<dyn UnitScheduler>) -> Arc<Binder> {
    setup_binder_with(BinderConfig::new(), scheduler)
}

pub fn setup_binder_with(config: BinderConfig, scheduler: Arc<dyn UnitScheduler>) -> Arc<Binder> {
    Arc::new(Binder::with_scheduler(config, scheduler))
}

/// Poll `check` until it holds, yielding to the runtime in between
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// One recorded watcher invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub label: String,
    pub previous: Option<AngularValue>,
    pub next: AngularValue,
    pub depth: u32,
}

/// Shared log written by recording watchers
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watcher appending to this log under `label`
    pub fn watcher(&self, label: &str) -> Arc<dyn Watcher> {
        Arc::new(RecordingWatcher {
            label: label.to_string(),
            log: self.clone(),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.0.lock().iter().map(|call| call.label.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

struct RecordingWatcher {
    label: String,
    log: CallLog,
}

#[async_trait]
impl Watcher for RecordingWatcher {
    async fn on_change(
        &self,
        previous: Option<AngularValue>,
        next: AngularValue,
        context: ExecutionContext,
    ) -> anyhow::Result<()> {
        self.log.0.lock().push(Call {
            label: self.label.clone(),
            previous,
            next,
            depth: context.depth(),
        });
        Ok(())
    }
}

struct FailingWatcher(String);

#[async_trait]
impl Watcher for FailingWatcher {
    async fn on_change(
        &self,
        _previous: Option<AngularValue>,
        _next: AngularValue,
        _context: ExecutionContext,
    ) -> anyhow::Result<()> {
        anyhow::bail!("{}", self.0)
    }
}

struct PanickingWatcher(String);

#[async_trait]
impl Watcher for PanickingWatcher {
    async fn on_change(
        &self,
        _previous: Option<AngularValue>,
        _next: AngularValue,
        _context: ExecutionContext,
    ) -> anyhow::Result<()> {
        panic!("{}", self.0)
    }
}

pub fn failing_watcher(message: &str) -> Arc<dyn Watcher> {
    Arc::new(FailingWatcher(message.to_string()))
}

pub fn panicking_watcher(message: &str) -> Arc<dyn Watcher> {
    Arc::new(PanickingWatcher(message.to_string()))
}

/// How a scripted run ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Finish,
    FinishAfter(Duration),
    Fail,
    Reject,
    Never,
}

/// Scheduler whose runs end as scripted per unit
#[derive(Debug)]
pub struct ScriptedScheduler {
    fallback: Script,
    scripts: Mutex<HashMap<UnitId, Script>>,
    submitted: Mutex<Vec<UnitId>>,
    cancelled: Mutex<Vec<UnitId>>,
}

impl ScriptedScheduler {
    /// Every run finishes immediately unless scripted otherwise
    pub fn new() -> Self {
        Self::with_fallback(Script::Finish)
    }

    /// Every run hangs unless scripted otherwise
    pub fn stalling() -> Self {
        Self::with_fallback(Script::Never)
    }

    pub fn with_fallback(fallback: Script) -> Self {
        Self {
            fallback,
            scripts: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, unit: &str, script: Script) {
        self.scripts.lock().insert(UnitId::from(unit), script);
    }

    pub fn submitted(&self) -> Vec<UnitId> {
        self.submitted.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<UnitId> {
        self.cancelled.lock().clone()
    }

    fn script_for(&self, unit: &UnitId) -> Script {
        self.scripts.lock().get(unit).copied().unwrap_or(self.fallback)
    }
}

impl Default for ScriptedScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitScheduler for ScriptedScheduler {
    async fn submit(
        &self,
        unit: &UnitId,
        _context: &ExecutionContext,
    ) -> Result<UnitHandle, SchedulerError> {
        if self.script_for(unit) == Script::Reject {
            return Err(SchedulerError::Rejected(format!("{unit} is scripted to reject")));
        }
        self.submitted.lock().push(unit.clone());
        Ok(UnitHandle::new(unit.clone()))
    }

    async fn await_terminal(
        &self,
        handle: &UnitHandle,
        _timeout: Duration,
    ) -> Result<UnitStatus, SchedulerError> {
        match self.script_for(&handle.unit) {
            Script::Finish => Ok(UnitStatus::Finished),
            Script::FinishAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(UnitStatus::Finished)
            }
            Script::Fail => Ok(UnitStatus::Error),
            Script::Reject => Err(SchedulerError::UnknownUnit(handle.unit.clone())),
            Script::Never => std::future::pending().await,
        }
    }

    async fn cancel(&self, handle: &UnitHandle) {
        self.cancelled.lock().push(handle.unit.clone());
    }
}
