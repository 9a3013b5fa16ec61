use nbx_core::prelude::*;
use nbx_core::{CallbackError, ChangeStream, StreamError};
use nbx_test_utils::{
    failing_watcher, note_context, note_scope, panicking_watcher, setup_binder, setup_binder_with,
    CallLog, ScriptedScheduler, TEST_NOTE,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;

fn binder() -> Arc<Binder> {
    setup_binder(Arc::new(ScriptedScheduler::new()))
}

fn drain(stream: &mut ChangeStream) -> Vec<(ChangeKind, u64)> {
    std::iter::from_fn(|| stream.try_recv().ok().flatten())
        .map(|event| (event.kind, event.version))
        .collect()
}

#[tokio::test]
async fn test_version_increments_per_bind() {
    let binder = binder();
    let scope = note_scope();
    let ctx = note_context();

    for expected in 1..=5 {
        let outcome = binder.bind(&scope, "myVar", &expected, &ctx).await.unwrap();
        assert_eq!(outcome.version, expected as u64);
    }
}

#[tokio::test]
async fn test_version_never_reused_after_unbind() {
    let binder = binder();
    let scope = note_scope();
    let ctx = note_context();

    binder.bind(&scope, "myVar", &1, &ctx).await.unwrap();
    binder.bind(&scope, "myVar", &2, &ctx).await.unwrap();
    binder.unbind(&scope, "myVar");

    let outcome = binder.bind(&scope, "myVar", &1, &ctx).await.unwrap();
    assert_eq!(outcome.kind, ChangeKind::Created);
    assert_eq!(outcome.previous, None);
    assert_eq!(outcome.version, 3);
}

#[tokio::test]
async fn test_watchers_fire_in_registration_order() {
    let binder = binder();
    let scope = note_scope();
    let log = CallLog::new();

    binder.bind(&scope, "myVar", &0, &note_context()).await.unwrap();
    for label in ["W1", "W2", "W3"] {
        binder.watch(&scope, "myVar", log.watcher(label));
    }

    let outcome = binder.bind(&scope, "myVar", &1, &note_context()).await.unwrap();

    assert_eq!(outcome.delivered, 3);
    assert_eq!(log.labels(), vec!["W1", "W2", "W3"]);
    for call in log.calls() {
        assert_eq!(call.previous, Some(AngularValue::from(0)));
        assert_eq!(call.next, AngularValue::from(1));
        assert_eq!(call.depth, 1);
    }
}

#[tokio::test]
async fn test_silence_after_unbind_and_new_watcher_fires() {
    let binder = binder();
    let scope = note_scope();
    let ctx = note_context();
    let log = CallLog::new();

    binder.bind(&scope, "myVar", &0, &ctx).await.unwrap();
    binder.watch(&scope, "myVar", log.watcher("W1"));
    assert!(binder.unbind(&scope, "myVar").is_some());

    binder.bind(&scope, "myVar", &1, &ctx).await.unwrap();
    assert!(log.is_empty());

    binder.watch(&scope, "myVar", log.watcher("W4"));
    binder.bind(&scope, "myVar", &2, &ctx).await.unwrap();
    assert_eq!(log.labels(), vec!["W4"]);
}

#[tokio::test]
async fn test_unbind_during_dispatch_silences_later_watchers() {
    let binder = binder();
    let scope = note_scope();
    let log = CallLog::new();

    let weak = Arc::downgrade(&binder);
    let unbinding_scope = scope.clone();
    binder.watch(
        &scope,
        "myVar",
        watch_fn(move |_, _, _| {
            let weak = weak.clone();
            let scope = unbinding_scope.clone();
            async move {
                if let Some(binder) = weak.upgrade() {
                    binder.unbind(&scope, "myVar");
                }
                anyhow::Ok(())
            }
        }),
    );
    binder.watch(&scope, "myVar", log.watcher("W2"));

    let outcome = binder.bind(&scope, "myVar", &1, &note_context()).await.unwrap();

    assert_eq!(outcome.delivered, 1);
    assert!(log.is_empty());
    assert!(binder.get(&scope, "myVar").unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_unbind_is_silent_and_idempotent() {
    let binder = binder();
    let scope = note_scope();
    let log = CallLog::new();
    let mut stream = binder.subscribe(&scope);

    binder.bind(&scope, "myVar", &1, &note_context()).await.unwrap();
    binder.watch(&scope, "myVar", log.watcher("W1"));

    assert!(binder.unbind(&scope, "myVar").is_some());
    assert!(binder.unbind(&scope, "myVar").is_none());
    assert!(binder.unbind(&scope, "never-bound").is_none());

    assert!(log.is_empty());
    assert_eq!(
        drain(&mut stream),
        vec![(ChangeKind::Created, 1), (ChangeKind::Removed, 1)]
    );
}

#[tokio::test]
async fn test_failures_are_isolated() {
    let binder = binder();
    let scope = note_scope();
    let log = CallLog::new();

    binder.watch(&scope, "myVar", log.watcher("W1"));
    binder.watch(&scope, "myVar", failing_watcher("interpreter unavailable"));
    binder.watch(&scope, "myVar", panicking_watcher("index out of bounds"));
    binder.watch(&scope, "myVar", log.watcher("W4"));

    let outcome = binder.bind(&scope, "myVar", &1, &note_context()).await.unwrap();

    assert!(!outcome.is_clean());
    assert_eq!(outcome.delivered, 2);
    assert_eq!(log.labels(), vec!["W1", "W4"]);
    assert!(matches!(
        &outcome.failures[0],
        CallbackError::Failed { message, .. } if message == "interpreter unavailable"
    ));
    assert!(matches!(
        &outcome.failures[1],
        CallbackError::Panicked { message, .. } if message == "index out of bounds"
    ));
    assert_eq!(binder.get(&scope, "myVar").unwrap(), AngularValue::from(1));
}

#[tokio::test]
async fn test_cascade_depth_guard_stops_self_retrigger() {
    let binder = setup_binder_with(
        BinderConfig::new().with_max_cascade_depth(4),
        Arc::new(ScriptedScheduler::new()),
    );
    let scope = note_scope();
    let refused = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&binder);
    let watched = scope.clone();
    let sink = Arc::clone(&refused);
    binder.watch(
        &scope,
        "counter",
        watch_fn(move |_, next, ctx| {
            let weak = weak.clone();
            let scope = watched.clone();
            let sink = Arc::clone(&sink);
            async move {
                let binder = weak.upgrade().ok_or_else(|| anyhow::anyhow!("binder dropped"))?;
                let next: i64 = next.decode()?;
                let outcome = binder.bind(&scope, "counter", &(next + 1), &ctx).await?;
                sink.lock().extend(outcome.failures);
                anyhow::Ok(())
            }
        }),
    );

    let outcome = binder.bind(&scope, "counter", &0, &note_context()).await.unwrap();

    assert!(outcome.is_clean());
    assert_eq!(binder.get_as::<i64>(&scope, "counter").unwrap(), 4);
    assert_eq!(binder.get_object(&scope, "counter").unwrap().version, 5);
    assert_eq!(
        refused.lock().as_slice(),
        &[CallbackError::CascadeDepthExceeded {
            key: "counter".to_string(),
            depth: 4,
        }]
    );
}

#[tokio::test]
async fn test_reconnecting_renderer_sees_current_value() {
    let binder = binder();
    let scope = note_scope();
    let ctx = note_context();

    let mut first = binder.subscribe(&scope);
    binder.bind(&scope, "myVar", &1, &ctx).await.unwrap();
    drop(first.try_recv());
    drop(first);

    for value in 2..=5 {
        binder.bind(&scope, "myVar", &value, &ctx).await.unwrap();
    }

    let mut reconnected = binder.subscribe(&scope);
    let current = binder.get_object(&scope, "myVar").unwrap();
    reconnected.observe(&current);

    assert_eq!(current.version, 5);
    assert_eq!(current.value, AngularValue::from(5));
    assert_eq!(reconnected.try_recv(), Ok(None));
    assert_eq!(reconnected.last_seen("myVar"), Some(5));
}

#[tokio::test]
async fn test_teardown_closes_stream_and_drops_watchers() {
    let binder = binder();
    let scope = note_scope();
    let ctx = note_context();
    let log = CallLog::new();
    let mut stream = binder.subscribe(&scope);

    binder.bind(&scope, "a", &1, &ctx).await.unwrap();
    binder.bind(&scope, "b", &2, &ctx).await.unwrap();
    binder.watch(&scope, "a", log.watcher("W1"));

    assert_eq!(binder.teardown(&scope), 2);

    let mut kinds = Vec::new();
    loop {
        match stream.try_recv() {
            Ok(Some(event)) => kinds.push((event.key, event.kind)),
            Ok(None) => panic!("stream should be closed"),
            Err(StreamError::Closed) => break,
            Err(err) => panic!("unexpected {err}"),
        }
    }
    assert_eq!(
        kinds,
        vec![
            ("a".to_string(), ChangeKind::Created),
            ("b".to_string(), ChangeKind::Created),
            ("a".to_string(), ChangeKind::Removed),
            ("b".to_string(), ChangeKind::Removed),
        ]
    );

    binder.bind(&scope, "a", &3, &ctx).await.unwrap();
    assert!(log.is_empty());
    assert_eq!(binder.get_object(&scope, "a").unwrap().version, 1);
}

#[tokio::test]
async fn test_note_teardown_closes_streams_of_empty_paragraph_scopes() {
    let binder = binder();
    let button = Scope::paragraph(TEST_NOTE, "button");
    let mut stream = binder.subscribe(&button);

    binder.bind(&note_scope(), "a", &1, &note_context()).await.unwrap();
    assert_eq!(binder.teardown(&note_scope()), 1);

    assert_eq!(stream.try_recv(), Err(StreamError::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_binds_get_distinct_versions() {
    let binder = binder();
    let scope = note_scope();

    let tasks: Vec<_> = (0..64)
        .map(|i| {
            let binder = Arc::clone(&binder);
            let scope = scope.clone();
            tokio::spawn(async move {
                binder
                    .bind(&scope, "shared", &i, &note_context())
                    .await
                    .map(|outcome| outcome.version)
            })
        })
        .collect();

    let mut versions = Vec::new();
    for task in tasks {
        versions.push(task.await.unwrap().unwrap());
    }
    versions.sort_unstable();

    assert_eq!(versions, (1..=64).collect::<Vec<u64>>());
    assert_eq!(binder.get_object(&scope, "shared").unwrap().version, 64);
}

#[derive(Debug, Clone)]
enum Op {
    Bind(i64),
    Unbind,
}

proptest! {
    #[test]
    fn prop_stream_versions_strictly_increase(
        ops in prop::collection::vec(
            prop_oneof![any::<i64>().prop_map(Op::Bind), Just(Op::Unbind)],
            1..40,
        )
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let binder = binder();
            let scope = note_scope();
            let mut stream = binder.subscribe(&scope);

            for op in &ops {
                match op {
                    Op::Bind(value) => {
                        binder.bind(&scope, "myVar", value, &note_context()).await.unwrap();
                    }
                    Op::Unbind => {
                        binder.unbind(&scope, "myVar");
                    }
                }
            }

            let mut last_bound = 0;
            for (kind, version) in drain(&mut stream) {
                match kind {
                    ChangeKind::Removed => assert_eq!(version, last_bound),
                    _ => {
                        assert!(version > last_bound);
                        last_bound = version;
                    }
                }
            }
        });
    }
}
