use nbx_core::prelude::*;
use nbx_core::{AbortReason, NoteId, TriggerRequest};
use nbx_test_utils::{
    eventually, note_context, note_scope, setup_binder, setup_binder_with, Script,
    ScriptedScheduler, TEST_NOTE,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Watcher that runs `unit` and records the status it got
fn run_on_change(
    binder: &Arc<Binder>,
    unit: &'static str,
    statuses: &Arc<Mutex<Vec<UnitStatus>>>,
) -> Arc<dyn Watcher> {
    let trigger = Arc::clone(binder.trigger());
    let statuses = Arc::clone(statuses);
    watch_fn(move |_, _, ctx| {
        let trigger = Arc::clone(&trigger);
        let statuses = Arc::clone(&statuses);
        async move {
            let status = trigger.run_unit(unit, &ctx).await;
            statuses.lock().push(status);
            anyhow::Ok(())
        }
    })
}

#[tokio::test]
async fn test_bind_resolves_after_triggered_unit_finishes() {
    let scheduler = Arc::new(ScriptedScheduler::new());
    scheduler.script("p2", Script::FinishAfter(Duration::from_millis(30)));
    let binder = setup_binder(scheduler.clone());
    let scope = note_scope();
    let statuses = Arc::new(Mutex::new(Vec::new()));

    binder.watch(&scope, "myVar", run_on_change(&binder, "p2", &statuses));
    binder.bind(&scope, "myVar", &1, &note_context()).await.unwrap();

    assert_eq!(statuses.lock().as_slice(), &[UnitStatus::Finished]);
    assert_eq!(scheduler.submitted(), vec![UnitId::from("p2")]);
    assert_eq!(binder.trigger().outstanding(), 0);
}

#[tokio::test]
async fn test_timeout_is_aborted_and_bind_succeeds() {
    let scheduler = Arc::new(ScriptedScheduler::stalling());
    let binder = setup_binder_with(
        BinderConfig::new().with_run_unit_timeout(Duration::from_millis(25)),
        scheduler.clone(),
    );
    let scope = note_scope();
    let statuses = Arc::new(Mutex::new(Vec::new()));

    binder.watch(&scope, "myVar", run_on_change(&binder, "p2", &statuses));
    let outcome = binder.bind(&scope, "myVar", &1, &note_context()).await.unwrap();

    assert!(outcome.is_clean());
    assert_eq!(statuses.lock().as_slice(), &[UnitStatus::Aborted]);
    assert_eq!(scheduler.cancelled(), vec![UnitId::from("p2")]);
    assert_eq!(binder.get(&scope, "myVar").unwrap(), AngularValue::from(1));
}

#[tokio::test]
async fn test_scheduler_failures_map_to_error() {
    let scheduler = Arc::new(ScriptedScheduler::new());
    scheduler.script("rejected", Script::Reject);
    scheduler.script("broken", Script::Fail);
    let binder = setup_binder(scheduler);

    assert_eq!(binder.run_unit("rejected", &note_context()).await, UnitStatus::Error);
    assert_eq!(binder.run_unit("broken", &note_context()).await, UnitStatus::Error);
    assert_eq!(binder.run_unit("ok", &note_context()).await, UnitStatus::Finished);
}

#[tokio::test]
async fn test_teardown_aborts_outstanding_waits() {
    let scheduler = Arc::new(ScriptedScheduler::stalling());
    let binder = setup_binder(scheduler.clone());
    let scope = note_scope();
    let statuses = Arc::new(Mutex::new(Vec::new()));

    binder.watch(&scope, "myVar", run_on_change(&binder, "p2", &statuses));

    let pending = {
        let binder = Arc::clone(&binder);
        let scope = scope.clone();
        tokio::spawn(async move { binder.bind(&scope, "myVar", &1, &note_context()).await })
    };

    let trigger = Arc::clone(binder.trigger());
    eventually(|| trigger.outstanding() == 1 && !scheduler.submitted().is_empty()).await;

    assert_eq!(binder.teardown_note(&NoteId::new(TEST_NOTE)), 1);

    let outcome = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("bind should resolve after teardown")
        .unwrap()
        .unwrap();
    assert!(outcome.is_clean());
    assert_eq!(statuses.lock().as_slice(), &[UnitStatus::Aborted]);
    assert_eq!(scheduler.cancelled(), vec![UnitId::from("p2")]);
    assert!(binder.get(&scope, "myVar").unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_run_requested_after_teardown_is_cancelled_at_once() {
    let scheduler = Arc::new(ScriptedScheduler::stalling());
    let binder = setup_binder(scheduler.clone());
    let scope = note_scope();
    let entered = Arc::new(AtomicBool::new(false));
    let gate = Arc::new(Notify::new());
    let reports = Arc::new(Mutex::new(Vec::new()));

    binder.watch(&scope, "myVar", {
        let trigger = Arc::clone(binder.trigger());
        let entered = Arc::clone(&entered);
        let gate = Arc::clone(&gate);
        let reports = Arc::clone(&reports);
        watch_fn(move |_, _, ctx| {
            let trigger = Arc::clone(&trigger);
            let entered = Arc::clone(&entered);
            let gate = Arc::clone(&gate);
            let reports = Arc::clone(&reports);
            async move {
                entered.store(true, Ordering::SeqCst);
                gate.notified().await;
                let report = trigger
                    .run_unit_with_timeout("p2", &ctx, Duration::from_secs(2))
                    .await;
                reports.lock().push((report.status, report.abort_reason));
                anyhow::Ok(())
            }
        })
    });

    let pending = {
        let binder = Arc::clone(&binder);
        let scope = scope.clone();
        tokio::spawn(async move { binder.bind(&scope, "myVar", &1, &note_context()).await })
    };
    eventually(|| entered.load(Ordering::SeqCst)).await;

    binder.teardown_note(&NoteId::new(TEST_NOTE));
    assert!(binder.trigger().is_note_closed(&NoteId::new(TEST_NOTE)));
    gate.notify_one();

    let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("bind should not wait out the run timeout")
        .unwrap()
        .unwrap();
    assert!(outcome.is_clean());
    assert_eq!(
        reports.lock().as_slice(),
        &[(UnitStatus::Aborted, Some(AbortReason::Cancelled))]
    );
    assert!(scheduler.submitted().is_empty());
}

#[tokio::test]
async fn test_rebinding_after_teardown_reopens_the_note() {
    let scheduler = Arc::new(ScriptedScheduler::new());
    let binder = setup_binder(scheduler.clone());
    let scope = note_scope();
    let statuses = Arc::new(Mutex::new(Vec::new()));

    binder.bind(&scope, "myVar", &1, &note_context()).await.unwrap();
    binder.teardown_note(&NoteId::new(TEST_NOTE));
    assert_eq!(binder.run_unit("p2", &note_context()).await, UnitStatus::Aborted);

    binder.bind(&scope, "myVar", &1, &note_context()).await.unwrap();
    binder.watch(&scope, "myVar", run_on_change(&binder, "p2", &statuses));
    binder.bind(&scope, "myVar", &2, &note_context()).await.unwrap();

    assert_eq!(statuses.lock().as_slice(), &[UnitStatus::Finished]);
    assert_eq!(scheduler.submitted(), vec![UnitId::from("p2")]);
}

#[tokio::test]
async fn test_teardown_of_other_note_leaves_waits_alone() {
    let scheduler = Arc::new(ScriptedScheduler::new());
    scheduler.script("p2", Script::FinishAfter(Duration::from_millis(30)));
    let binder = setup_binder(scheduler);

    let run = {
        let binder = Arc::clone(&binder);
        tokio::spawn(async move { binder.run_unit("p2", &note_context()).await })
    };

    let trigger = Arc::clone(binder.trigger());
    eventually(|| trigger.outstanding() == 1).await;
    binder.teardown_note(&NoteId::new("other-note"));

    assert_eq!(run.await.unwrap(), UnitStatus::Finished);
}

#[tokio::test]
async fn test_dispatch_reports_abort_reason() {
    let scheduler = Arc::new(ScriptedScheduler::stalling());
    let binder = setup_binder_with(
        BinderConfig::new().with_run_unit_timeout(Duration::from_millis(10)),
        scheduler,
    );

    let report = binder
        .trigger()
        .dispatch(TriggerRequest::new("p2", note_context()))
        .await;

    assert_eq!(report.status, UnitStatus::Aborted);
    assert_eq!(report.abort_reason, Some(AbortReason::Timeout));
    assert!(report.elapsed >= Duration::from_millis(10));
}
