//! Trigger bridge: run another paragraph and wait for it
//!
//! # Run-and-wait
//!
//! [`TriggerBridge::run_unit`] submits a paragraph to the scheduler of the
//! calling note, then joins a spawned waiter task under a timeout and the
//! note's cancellation token. The caller (usually a watcher, and through it
//! the `bind` that fired the watcher) resumes only once the paragraph is in a
//! terminal state, the timeout elapses or the note is torn down.
//!
//! Timeouts and teardown both surface as [`UnitStatus::Aborted`]; they never
//! fail the bind that triggered the run.

use crate::config::BinderConfig;
use crate::context::ExecutionContext;
use crate::error::SchedulerError;
use async_trait::async_trait;
use dashmap::DashMap;
use nbx_object::{NoteId, ParagraphId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Execution unit (paragraph) identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(String);

impl UnitId {
    /// Create a unit ID
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UnitId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UnitId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<ParagraphId> for UnitId {
    fn from(id: ParagraphId) -> Self {
        Self(id.as_str().to_owned())
    }
}

impl From<&ParagraphId> for UnitId {
    fn from(id: &ParagraphId) -> Self {
        Self(id.as_str().to_owned())
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique run identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a submitted run
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitHandle {
    /// Submitted unit
    pub unit: UnitId,
    /// This particular run
    pub run: RunId,
}

impl UnitHandle {
    /// Create handle for a new run of `unit`
    #[inline]
    #[must_use]
    pub fn new(unit: UnitId) -> Self {
        Self {
            unit,
            run: RunId::new(),
        }
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Paragraph ran to completion
    Finished,
    /// Paragraph failed, or could not be submitted
    Error,
    /// Run was abandoned (timeout, teardown or scheduler abort)
    Aborted,
}

/// Why a wait was abandoned by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Timeout elapsed
    Timeout,
    /// Note was torn down
    Cancelled,
}

/// Outcome of one `run_unit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Target unit
    pub unit: UnitId,
    /// Terminal status
    pub status: UnitStatus,
    /// Set when the bridge abandoned the wait
    pub abort_reason: Option<AbortReason>,
    /// Time spent waiting
    pub elapsed: Duration,
}

/// Request to run another unit on behalf of a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    /// Unit to run
    pub target: UnitId,
    /// Context of the requester
    pub context: ExecutionContext,
}

impl TriggerRequest {
    /// Create request
    #[inline]
    #[must_use]
    pub fn new(target: impl Into<UnitId>, context: ExecutionContext) -> Self {
        Self {
            target: target.into(),
            context,
        }
    }
}

/// External paragraph scheduler
///
/// Implement this trait to connect the bridge to an interpreter runtime.
#[async_trait]
pub trait UnitScheduler: Send + Sync {
    /// Queue a unit for execution
    async fn submit(
        &self,
        unit: &UnitId,
        context: &ExecutionContext,
    ) -> Result<UnitHandle, SchedulerError>;

    /// Wait until the run reaches a terminal status or `timeout` elapses
    async fn await_terminal(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<UnitStatus, SchedulerError>;

    /// Abandon a run; the default does nothing
    async fn cancel(&self, _handle: &UnitHandle) {}
}

/// Decrements the in-flight counter when a wait ends, however it ends
struct Outstanding<'a>(&'a AtomicUsize);

impl<'a> Outstanding<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Submits units to the scheduler of a note and waits for them
pub struct TriggerBridge {
    default_scheduler: Option<Arc<dyn UnitScheduler>>,
    schedulers: DashMap<NoteId, Arc<dyn UnitScheduler>>,
    cancellations: DashMap<NoteId, CancellationToken>,
    timeout: Duration,
    outstanding: AtomicUsize,
}

impl TriggerBridge {
    /// Create bridge with no scheduler
    #[must_use]
    pub fn new(config: &BinderConfig) -> Self {
        Self {
            default_scheduler: None,
            schedulers: DashMap::new(),
            cancellations: DashMap::new(),
            timeout: config.run_unit_timeout(),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// With scheduler used for notes that have none registered
    #[inline]
    #[must_use]
    pub fn with_default_scheduler(mut self, scheduler: Arc<dyn UnitScheduler>) -> Self {
        self.default_scheduler = Some(scheduler);
        self
    }

    /// Route a note's runs to a specific scheduler
    ///
    /// Registering reopens a note that was torn down.
    pub fn register_scheduler(&self, note: impl Into<NoteId>, scheduler: Arc<dyn UnitScheduler>) {
        let note = note.into();
        self.reopen_note(&note);
        self.schedulers.insert(note, scheduler);
    }

    /// Drop a note's scheduler; later runs fall back to the default
    pub fn unregister_scheduler(&self, note: &NoteId) -> bool {
        self.schedulers.remove(note).is_some()
    }

    /// Configured wait timeout
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of waits currently in progress
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Run a unit and wait for its terminal status
    pub async fn run_unit(
        &self,
        target: impl Into<UnitId>,
        context: &ExecutionContext,
    ) -> UnitStatus {
        self.run_unit_with_timeout(target, context, self.timeout)
            .await
            .status
    }

    /// Run a trigger request with the configured timeout
    pub async fn dispatch(&self, request: TriggerRequest) -> RunReport {
        self.run_unit_with_timeout(request.target, &request.context, self.timeout)
            .await
    }

    /// Run a unit with an explicit timeout
    ///
    /// # Workflow
    /// 1. Resolve the note's scheduler
    /// 2. Submit the unit (cancellable)
    /// 3. Spawn a waiter task and join it under timeout and cancellation
    /// 4. On abandon, abort the waiter and ask the scheduler to cancel the run
    pub async fn run_unit_with_timeout(
        &self,
        target: impl Into<UnitId>,
        context: &ExecutionContext,
        timeout: Duration,
    ) -> RunReport {
        let unit = target.into();
        let started = Instant::now();
        let report = |unit: UnitId, status, abort_reason| RunReport {
            unit,
            status,
            abort_reason,
            elapsed: started.elapsed(),
        };

        let Some(scheduler) = self.scheduler_for(context.note()) else {
            warn!(unit = %unit, note = %context.note(), "no scheduler for note");
            return report(unit, UnitStatus::Error, None);
        };

        let token = self.cancellation_for(context.note());
        let _outstanding = Outstanding::enter(&self.outstanding);

        let handle = tokio::select! {
            biased;
            () = token.cancelled() => {
                info!(unit = %unit, note = %context.note(), "run cancelled before submission");
                return report(unit, UnitStatus::Aborted, Some(AbortReason::Cancelled));
            }
            submitted = scheduler.submit(&unit, context) => match submitted {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(unit = %unit, error = %e, "submission failed");
                    return report(unit, UnitStatus::Error, None);
                }
            },
        };
        debug!(unit = %unit, run = %handle.run, depth = context.depth(), "unit submitted");

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            let handle = handle.clone();
            tokio::spawn(async move { scheduler.await_terminal(&handle, timeout).await })
        };
        let waiter_abort = waiter.abort_handle();

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => Err(AbortReason::Cancelled),
            joined = tokio::time::timeout(timeout, waiter) => match joined {
                Err(_elapsed) => Err(AbortReason::Timeout),
                Ok(Ok(Ok(status))) => Ok(status),
                Ok(Ok(Err(e))) => {
                    warn!(unit = %unit, run = %handle.run, error = %e, "waiting for unit failed");
                    Ok(UnitStatus::Error)
                }
                Ok(Err(join_error)) => {
                    error!(unit = %unit, run = %handle.run, error = %join_error, "waiter task failed");
                    Ok(UnitStatus::Error)
                }
            },
        };

        match outcome {
            // The scheduler gave up on its own copy of the same deadline
            Ok(UnitStatus::Aborted) if started.elapsed() >= timeout => {
                warn!(unit = %unit, run = %handle.run, "unit aborted by scheduler at timeout");
                report(unit, UnitStatus::Aborted, Some(AbortReason::Timeout))
            }
            Ok(status) => {
                debug!(unit = %unit, run = %handle.run, ?status, "unit reached terminal status");
                report(unit, status, None)
            }
            Err(reason) => {
                waiter_abort.abort();
                scheduler.cancel(&handle).await;
                warn!(unit = %unit, run = %handle.run, ?reason, "abandoned wait for unit");
                report(unit, UnitStatus::Aborted, Some(reason))
            }
        }
    }

    /// Cancel every outstanding wait of a note
    ///
    /// The cancelled token stays in place, so runs requested later for the
    /// same note are aborted at once until [`TriggerBridge::reopen_note`].
    ///
    /// # Returns
    /// `false` if the note was already closed
    pub fn cancel_note(&self, note: &NoteId) -> bool {
        let token = self.cancellation_for(note);
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        info!(note = %note, "cancelled outstanding runs");
        true
    }

    /// Start a new lifetime for a torn-down note
    ///
    /// # Returns
    /// `true` if the note was closed
    pub fn reopen_note(&self, note: &NoteId) -> bool {
        let reopened = self
            .cancellations
            .remove_if(note, |_, token| token.is_cancelled())
            .is_some();
        if reopened {
            debug!(note = %note, "note reopened");
        }
        reopened
    }

    /// Check if a note was torn down and not reopened
    #[must_use]
    pub fn is_note_closed(&self, note: &NoteId) -> bool {
        self.cancellations
            .get(note)
            .is_some_and(|token| token.is_cancelled())
    }

    fn scheduler_for(&self, note: &NoteId) -> Option<Arc<dyn UnitScheduler>> {
        self.schedulers
            .get(note)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.default_scheduler.clone())
    }

    fn cancellation_for(&self, note: &NoteId) -> CancellationToken {
        self.cancellations.entry(note.clone()).or_default().clone()
    }
}

impl fmt::Debug for TriggerBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerBridge")
            .field("has_default_scheduler", &self.default_scheduler.is_some())
            .field("schedulers", &self.schedulers.len())
            .field("timeout", &self.timeout)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    /// Finishes each run as soon as it is released
    #[derive(Default)]
    struct GateScheduler {
        release: Notify,
        submitted: Mutex<Vec<UnitId>>,
        cancelled: Mutex<Vec<UnitId>>,
        status: Mutex<Option<UnitStatus>>,
    }

    #[async_trait]
    impl UnitScheduler for GateScheduler {
        async fn submit(
            &self,
            unit: &UnitId,
            _context: &ExecutionContext,
        ) -> Result<UnitHandle, SchedulerError> {
            if unit.as_str() == "missing" {
                return Err(SchedulerError::UnknownUnit(unit.clone()));
            }
            self.submitted.lock().push(unit.clone());
            Ok(UnitHandle::new(unit.clone()))
        }

        async fn await_terminal(
            &self,
            _handle: &UnitHandle,
            _timeout: Duration,
        ) -> Result<UnitStatus, SchedulerError> {
            self.release.notified().await;
            let status = *self.status.lock();
            Ok(status.unwrap_or(UnitStatus::Finished))
        }

        async fn cancel(&self, handle: &UnitHandle) {
            self.cancelled.lock().push(handle.unit.clone());
        }
    }

    fn bridge(scheduler: Arc<GateScheduler>, timeout: Duration) -> Arc<TriggerBridge> {
        let config = BinderConfig::new().with_run_unit_timeout(timeout);
        Arc::new(TriggerBridge::new(&config).with_default_scheduler(scheduler))
    }

    #[tokio::test]
    async fn run_unit_waits_for_terminal_status() {
        let scheduler = Arc::new(GateScheduler::default());
        let bridge = bridge(Arc::clone(&scheduler), Duration::from_secs(5));
        let ctx = ExecutionContext::for_paragraph("n1", "p4");

        let run = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.run_unit("p2", &ctx).await })
        };

        tokio::task::yield_now().await;
        while scheduler.submitted.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(!run.is_finished());

        scheduler.release.notify_one();
        assert_eq!(run.await.unwrap(), UnitStatus::Finished);
        assert_eq!(bridge.outstanding(), 0);
    }

    #[tokio::test]
    async fn timeout_is_aborted() {
        let scheduler = Arc::new(GateScheduler::default());
        let bridge = bridge(Arc::clone(&scheduler), Duration::from_millis(20));
        let ctx = ExecutionContext::new("n1");

        let report = bridge.dispatch(TriggerRequest::new("p2", ctx)).await;

        assert_eq!(report.status, UnitStatus::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::Timeout));
        assert_eq!(scheduler.cancelled.lock().as_slice(), &[UnitId::from("p2")]);
    }

    #[tokio::test]
    async fn cancel_note_aborts_outstanding_wait() {
        let scheduler = Arc::new(GateScheduler::default());
        let bridge = bridge(Arc::clone(&scheduler), Duration::from_secs(30));
        let ctx = ExecutionContext::new("n1");

        let run = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .run_unit_with_timeout("p2", &ctx, Duration::from_secs(30))
                    .await
            })
        };

        while bridge.outstanding() == 0 || scheduler.submitted.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(bridge.cancel_note(&NoteId::new("n1")));

        let report = run.await.unwrap();
        assert_eq!(report.status, UnitStatus::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::Cancelled));
        assert_eq!(bridge.outstanding(), 0);
    }

    #[tokio::test]
    async fn closed_note_aborts_new_runs_until_reopened() {
        let scheduler = Arc::new(GateScheduler::default());
        let bridge = bridge(Arc::clone(&scheduler), Duration::from_secs(30));
        let note = NoteId::new("n1");

        assert!(bridge.cancel_note(&note));
        assert!(!bridge.cancel_note(&note));
        assert!(bridge.is_note_closed(&note));

        let report = bridge
            .run_unit_with_timeout("p2", &ExecutionContext::new("n1"), Duration::from_secs(30))
            .await;
        assert_eq!(report.status, UnitStatus::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::Cancelled));
        assert!(report.elapsed < Duration::from_secs(1));
        assert!(scheduler.submitted.lock().is_empty());

        assert!(bridge.reopen_note(&note));
        assert!(!bridge.is_note_closed(&note));
        scheduler.release.notify_one();
        assert_eq!(
            bridge.run_unit("p2", &ExecutionContext::new("n1")).await,
            UnitStatus::Finished
        );
    }

    #[tokio::test]
    async fn scheduler_abort_at_deadline_is_timeout() {
        let scheduler = Arc::new(GateScheduler::default());
        *scheduler.status.lock() = Some(UnitStatus::Aborted);
        scheduler.release.notify_one();
        let bridge = bridge(Arc::clone(&scheduler), Duration::ZERO);

        let report = bridge
            .run_unit_with_timeout("p2", &ExecutionContext::new("n1"), Duration::ZERO)
            .await;
        assert_eq!(report.status, UnitStatus::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::Timeout));
    }

    #[tokio::test]
    async fn submission_failure_is_error() {
        let scheduler = Arc::new(GateScheduler::default());
        let bridge = bridge(scheduler, Duration::from_secs(1));

        let status = bridge.run_unit("missing", &ExecutionContext::new("n1")).await;
        assert_eq!(status, UnitStatus::Error);
    }

    #[tokio::test]
    async fn no_scheduler_is_error() {
        let bridge = TriggerBridge::new(&BinderConfig::new());
        let status = bridge.run_unit("p2", &ExecutionContext::new("n1")).await;
        assert_eq!(status, UnitStatus::Error);
    }

    #[tokio::test]
    async fn per_note_scheduler_takes_precedence() {
        let fallback = Arc::new(GateScheduler::default());
        let dedicated = Arc::new(GateScheduler::default());
        *dedicated.status.lock() = Some(UnitStatus::Error);
        dedicated.release.notify_one();

        let bridge = bridge(Arc::clone(&fallback), Duration::from_secs(5));
        bridge.register_scheduler("n2", Arc::clone(&dedicated) as Arc<dyn UnitScheduler>);

        let status = bridge.run_unit("p1", &ExecutionContext::new("n2")).await;
        assert_eq!(status, UnitStatus::Error);
        assert!(fallback.submitted.lock().is_empty());
        assert_eq!(dedicated.submitted.lock().len(), 1);
    }
}
