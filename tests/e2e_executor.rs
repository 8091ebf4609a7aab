//! End-to-end tests for the single-writer executor.
//!
//! Tests ordering, backpressure, failure containment, unknown kinds,
//! dependency enforcement, and shutdown. Each test drives real writer
//! threads through the async submit path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use horizon::{
    props, Error, Executor, ExecutorConfig, GeometricHost, HandlerRegistry, HostConfig, MemoryHost,
    OpId, OpKind, PropertyMap, Value, WriterMark, WriterToken,
};

// ============================================================================
// Helpers
// ============================================================================

fn host() -> Arc<MemoryHost> {
    Arc::new(MemoryHost::new(HostConfig::new(3)).unwrap())
}

/// Registry whose `GATE` handler blocks until the returned sender fires.
fn gated_registry() -> (HandlerRegistry, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    let rx = Mutex::new(rx);
    let mut reg = HandlerRegistry::builtin();
    reg.register("GATE", move |_: &dyn GeometricHost, _: &WriterToken, _: &PropertyMap| {
        let _ = rx.lock().recv_timeout(Duration::from_secs(10));
        Ok(Value::Bool(true))
    });
    (reg, tx)
}

async fn wait_until_running(exec: &Executor) {
    while exec.stats().in_flight == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// ============================================================================
// 1. One worker completes in submission order
// ============================================================================

#[tokio::test]
async fn test_single_worker_preserves_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut reg = HandlerRegistry::new();
    {
        let log = Arc::clone(&log);
        reg.register("RECORD", move |_: &dyn GeometricHost, _: &WriterToken, p: &PropertyMap| {
            let n = p.get("n").and_then(Value::as_int).unwrap_or(-1);
            log.lock().push(n);
            Ok(Value::Int(n))
        });
    }
    let exec = Executor::start_with_registry(host(), reg, ExecutorConfig::default().with_workers(1)).unwrap();

    let mut pending = Vec::new();
    for n in 0..50 {
        pending.push(exec.schedule("RECORD", props! { "n" => n }, []).await.unwrap());
    }
    for (n, p) in pending.into_iter().enumerate() {
        assert_eq!(p.wait().await.unwrap(), Value::Int(n as i64));
    }
    assert_eq!(*log.lock(), (0..50).collect::<Vec<i64>>());
}

// ============================================================================
// 2. Backpressure: exactly one QueueSaturated per excess submission
// ============================================================================

#[tokio::test]
async fn test_saturation_after_single_retry() {
    let (reg, release) = gated_registry();
    let config = ExecutorConfig::default()
        .with_workers(1)
        .with_queue_capacity(2)
        .with_backpressure_delay(Duration::from_millis(10));
    let exec = Executor::start_with_registry(host(), reg, config).unwrap();

    let gate = exec.schedule("GATE", props! {}, []).await.unwrap();
    wait_until_running(&exec).await;

    let queued_a = exec.schedule("NOOP", props! {}, []).await.unwrap();
    let queued_b = exec.schedule("NOOP", props! {}, []).await.unwrap();

    for _ in 0..3 {
        let started = Instant::now();
        let err = exec.schedule("NOOP", props! {}, []).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(10), "refused before the backoff window");
        assert_eq!(err, Error::QueueSaturated { capacity: 2 });
        assert!(err.is_retryable());
    }
    assert_eq!(exec.stats().saturated, 3);
    assert_eq!(exec.stats().queue_depth, 2);

    release.send(()).unwrap();
    assert_eq!(gate.wait().await.unwrap(), Value::Bool(true));
    assert_eq!(queued_a.wait().await.unwrap(), Value::Null);
    assert_eq!(queued_b.wait().await.unwrap(), Value::Null);

    // Room again.
    assert_eq!(exec.submit("NOOP", props! {}).await.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_retry_succeeds_when_queue_drains_in_time() {
    let (reg, release) = gated_registry();
    let config = ExecutorConfig::default()
        .with_workers(1)
        .with_queue_capacity(1)
        .with_backpressure_delay(Duration::from_millis(200));
    let exec = Arc::new(Executor::start_with_registry(host(), reg, config).unwrap());

    let gate = exec.schedule("GATE", props! {}, []).await.unwrap();
    wait_until_running(&exec).await;
    let _filler = exec.schedule("NOOP", props! {}, []).await.unwrap();

    let late = {
        let exec = Arc::clone(&exec);
        tokio::spawn(async move { exec.submit("NOOP", props! {}).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.send(()).unwrap();

    assert_eq!(late.await.unwrap().unwrap(), Value::Null);
    assert_eq!(gate.wait().await.unwrap(), Value::Bool(true));
    assert_eq!(exec.stats().saturated, 0);
}

#[tokio::test]
async fn test_cancelled_schedule_releases_dependents() {
    let (reg, release) = gated_registry();
    let config = ExecutorConfig::default()
        .with_workers(1)
        .with_queue_capacity(1)
        .with_backpressure_delay(Duration::from_millis(200));
    let exec = Arc::new(Executor::start_with_registry(host(), reg, config).unwrap());

    let gate = exec.schedule("GATE", props! {}, []).await.unwrap();
    wait_until_running(&exec).await;
    let filler = exec.schedule("NOOP", props! {}, []).await.unwrap();

    // Dropped mid-backoff, so its id never reaches the queue.
    let abandoned = tokio::time::timeout(Duration::from_millis(20), exec.schedule("NOOP", props! {}, [])).await;
    assert!(abandoned.is_err());
    let abandoned_id = OpId(filler.id().0 + 1);

    release.send(()).unwrap();
    assert_eq!(gate.wait().await.unwrap(), Value::Bool(true));
    assert_eq!(filler.wait().await.unwrap(), Value::Null);

    let dependent = tokio::time::timeout(
        Duration::from_secs(5),
        exec.submit_after("NOOP", props! {}, [abandoned_id]),
    )
    .await
    .expect("dependent of an abandoned id never ran");
    assert_eq!(dependent.unwrap(), Value::Null);

    let closing = {
        let exec = Arc::clone(&exec);
        tokio::task::spawn_blocking(move || exec.shutdown())
    };
    tokio::time::timeout(Duration::from_secs(5), closing)
        .await
        .expect("shutdown did not return")
        .unwrap();
    assert!(!exec.is_running());
}

// ============================================================================
// 3. Failures surface and the worker survives
// ============================================================================

#[tokio::test]
async fn test_handler_failure_then_noop_succeeds() {
    let mut reg = HandlerRegistry::builtin();
    reg.register("FAIL", |_: &dyn GeometricHost, _: &WriterToken, _: &PropertyMap| {
        Err(Error::InvalidArgument("shell collapsed".into()))
    });
    let exec = Executor::start_with_registry(host(), reg, ExecutorConfig::default().with_workers(1)).unwrap();

    let err = exec.submit("FAIL", props! {}).await.unwrap_err();
    match err {
        Error::HandlerFailure { kind, message } => {
            assert_eq!(kind, "FAIL");
            assert!(message.contains("shell collapsed"), "message was {message}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    assert_eq!(exec.submit("NOOP", props! {}).await.unwrap(), Value::Null);
    let stats = exec.stats();
    assert_eq!((stats.completed, stats.failed), (1, 1));
}

#[tokio::test]
async fn test_panicking_handler_does_not_kill_worker() {
    let mut reg = HandlerRegistry::builtin();
    reg.register("PANIC", |_: &dyn GeometricHost, _: &WriterToken, _: &PropertyMap| -> horizon::Result<Value> {
        panic!("index corrupted")
    });
    let exec = Executor::start_with_registry(host(), reg, ExecutorConfig::default().with_workers(1)).unwrap();

    for _ in 0..3 {
        let err = exec.submit("PANIC", props! {}).await.unwrap_err();
        assert_eq!(
            err,
            Error::HandlerFailure { kind: "PANIC".into(), message: "index corrupted".into() }
        );
    }
    assert_eq!(exec.submit("NOOP", props! {}).await.unwrap(), Value::Null);
}

// ============================================================================
// 4. Unknown kinds are no-ops
// ============================================================================

#[tokio::test]
async fn test_unknown_kind_resolves_null() {
    let exec = Executor::start(host(), ExecutorConfig::default()).unwrap();
    assert_eq!(exec.submit("FOLD_SPACETIME", props! { "x" => 1 }).await.unwrap(), Value::Null);
    assert_eq!(exec.submit(OpKind::Custom("".into()), props! {}).await.unwrap(), Value::Null);
}

// ============================================================================
// 5. Dependencies across workers
// ============================================================================

#[tokio::test]
async fn test_dependency_observes_slow_effects() {
    let flag = Arc::new(AtomicBool::new(false));
    let mut reg = HandlerRegistry::new();
    {
        let flag = Arc::clone(&flag);
        reg.register("SLOW_WRITE", move |_: &dyn GeometricHost, _: &WriterToken, _: &PropertyMap| {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        });
    }
    {
        let flag = Arc::clone(&flag);
        reg.register("READ", move |_: &dyn GeometricHost, _: &WriterToken, _: &PropertyMap| {
            Ok(Value::Bool(flag.load(Ordering::SeqCst)))
        });
    }
    let config = ExecutorConfig::default().with_workers(2).with_serialized_handlers(false);
    let exec = Executor::start_with_registry(host(), reg, config).unwrap();

    let slow = exec.schedule("SLOW_WRITE", props! {}, []).await.unwrap();
    let read = exec.submit_after("READ", props! {}, [slow.id()]).await.unwrap();
    assert_eq!(read, Value::Bool(true));
    slow.wait().await.unwrap();
}

#[tokio::test]
async fn test_dependency_on_failed_op_still_runs() {
    let mut reg = HandlerRegistry::builtin();
    reg.register("FAIL", |_: &dyn GeometricHost, _: &WriterToken, _: &PropertyMap| {
        Err(Error::NotFound("nothing".into()))
    });
    let exec = Executor::start_with_registry(host(), reg, ExecutorConfig::default()).unwrap();

    let failing = exec.schedule("FAIL", props! {}, []).await.unwrap();
    let id = failing.id();
    assert!(failing.wait().await.is_err());
    assert_eq!(exec.submit_after("NOOP", props! {}, [id]).await.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_future_dependency_rejected() {
    let exec = Executor::start(host(), ExecutorConfig::default()).unwrap();
    let p = exec.schedule("NOOP", props! {}, []).await.unwrap();
    let ahead = horizon::OpId(p.id().0 + 10);
    let err = exec.schedule("NOOP", props! {}, [ahead]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidDependency { dep, .. } if dep == ahead.0));
}

// ============================================================================
// 6. Mutual exclusion and writer identity
// ============================================================================

#[tokio::test]
async fn test_serialized_handlers_never_overlap() {
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let mut reg = HandlerRegistry::new();
    {
        let (active, overlaps) = (Arc::clone(&active), Arc::clone(&overlaps));
        reg.register("TOUCH", move |_: &dyn GeometricHost, _: &WriterToken, _: &PropertyMap| {
            if active.fetch_add(1, Ordering::SeqCst) > 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Bool(WriterMark::is_set()))
        });
    }
    let exec = Executor::start_with_registry(host(), reg, ExecutorConfig::default().with_workers(4)).unwrap();

    let mut pending = Vec::new();
    for _ in 0..40 {
        pending.push(exec.schedule("TOUCH", props! {}, []).await.unwrap());
    }
    for p in pending {
        assert_eq!(p.wait().await.unwrap(), Value::Bool(true));
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(!WriterMark::is_set());
}

// ============================================================================
// 7. Abandoned awaits and shutdown
// ============================================================================

#[tokio::test]
async fn test_abandoned_await_still_runs() {
    let host = host();
    let exec = Executor::start(host.clone(), ExecutorConfig::default().with_workers(1)).unwrap();

    let pending = exec
        .schedule(OpKind::AddNode, props! { "id" => "ghost", "vector" => vec![0.0, 1.0, 0.0] }, [])
        .await
        .unwrap();
    drop(pending);

    exec.submit(OpKind::AnnealMainIndex, props! {}).await.unwrap();
    assert_eq!(host.main_index().len(), 1);
}

#[tokio::test]
async fn test_shutdown_drains_queue_then_rejects() {
    let (reg, release) = gated_registry();
    let exec = Executor::start_with_registry(host(), reg, ExecutorConfig::default().with_workers(1)).unwrap();

    let gate = exec.schedule("GATE", props! {}, []).await.unwrap();
    let tail: Vec<_> = {
        let mut v = Vec::new();
        for _ in 0..5 {
            v.push(exec.schedule("NOOP", props! {}, []).await.unwrap());
        }
        v
    };

    release.send(()).unwrap();
    exec.shutdown();
    assert_eq!(exec.stats().queue_depth, 0);

    assert_eq!(gate.wait().await.unwrap(), Value::Bool(true));
    for p in tail {
        assert_eq!(p.wait().await.unwrap(), Value::Null);
    }
    assert_eq!(exec.submit("NOOP", props! {}).await, Err(Error::ExecutorShutdown));
    exec.shutdown();
}
