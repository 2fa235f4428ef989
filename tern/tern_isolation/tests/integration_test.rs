//! Integration tests for tern_isolation.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tern_core::error::ErrorClass;
use tern_core::types::{
    HandlerError, HandlerErrorKind, InvocationContext, InvocationRequest, IsolationKind,
    MemoryBudget, StoreEndpoint, WorkerResponse,
};
use tern_core::utils::deadline::{CancellationToken, Deadline};
use tern_core::{HandlerRegistry, InvocationId};
use tern_isolation::*;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

// Initialize tracing for tests
fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn registry() -> Arc<HandlerRegistry> {
    Arc::new(
        HandlerRegistry::builder()
            .register_fn("stamp", |_, _| Ok(json!([1.0, 2.0])))
            .register_fn("budget", |_, ctx| {
                let scope = ctx
                    .scope
                    .as_ref()
                    .ok_or_else(|| HandlerError::failed("no scope"))?;
                let raw = fs::read_to_string(&scope.size_control)
                    .map_err(|e| HandlerError::failed(e.to_string()))?;
                Ok(json!({ "scope": scope.name, "size": raw }))
            })
            .register_fn("fail", |args, _| {
                Err(HandlerError::failed(
                    args["message"].as_str().unwrap_or("failed"),
                ))
            })
            .register_fn("hang", |_, _| {
                thread::sleep(Duration::from_secs(60));
                Ok(Value::Null)
            })
            .register_fn("crash", |_, _| std::process::abort())
            .build(),
    )
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        handoff_timeout: Duration::from_secs(5),
        invocation_timeout: Duration::from_secs(5),
        reply_timeout: Duration::from_secs(5),
        child_linger: Duration::from_secs(10),
        reap_timeout: Duration::from_secs(2),
        teardown: RetryPolicy {
            max_attempts: 20,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(100),
        },
    }
}

fn request(function: &str, mib: u64, kind: IsolationKind, arguments: Value) -> InvocationRequest {
    InvocationRequest {
        id: InvocationId::new(),
        function: function.to_string(),
        arguments,
        memory_budget: MemoryBudget::from_mib(mib).unwrap(),
        kind,
        context: InvocationContext::new(StoreEndpoint::new("127.0.0.1", "secret")),
    }
}

/// Run one invocation through `worker` and return the caller's view.
fn roundtrip(
    worker: Arc<dyn IsolationWorker>,
    channel_dir: &Path,
    request: InvocationRequest,
) -> (WorkerResponse, WorkerReport) {
    let channel = SyncChannel::create(channel_dir).unwrap();
    let path = channel.path().to_path_buf();
    let id = request.id;

    let handle = thread::spawn(move || worker.run(id, &path, &CancellationToken::new()));

    let cancel = CancellationToken::new();
    let reader = channel
        .send(&request, Deadline::after(Duration::from_secs(5)), &cancel)
        .unwrap();
    let response: WorkerResponse = reader
        .receive(Deadline::after(Duration::from_secs(20)), &cancel)
        .unwrap();
    drop(channel);

    (response, handle.join().unwrap())
}

fn scale_worker(root: &Path, settings: WorkerSettings) -> Arc<dyn IsolationWorker> {
    let controller = DirectoryController::new(root, ControlFiles::default()).unwrap();
    Arc::new(ScaleWorker::new(registry(), Arc::new(controller), settings))
}

fn scope_count(root: &Path) -> usize {
    fs::read_dir(root).unwrap().count()
}

#[test]
fn test_scale_invocation_reclaims_scope() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("faascale");
    let worker = scale_worker(&root, settings());

    let (response, report) = roundtrip(
        worker,
        dir.path(),
        request("stamp", 128, IsolationKind::Scale, Value::Null),
    );

    let outcome = response.into_outcome().unwrap();
    let stamps = outcome.result().unwrap().as_array().unwrap().clone();
    assert!(stamps[0].as_f64().unwrap() <= stamps[1].as_f64().unwrap());
    assert_eq!(report.status, WorkerStatus::Succeeded);
    assert!(!report.scope_leaked);
    assert_eq!(scope_count(&root), 0);
    info!("scale invocation reclaimed its scope");
}

#[test]
fn test_concurrent_budgets_do_not_mix() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("faascale");
    let worker = scale_worker(&root, settings());

    let handles: Vec<_> = [64u64, 256]
        .into_iter()
        .map(|mib| {
            let worker = Arc::clone(&worker);
            let channel_dir = dir.path().to_path_buf();
            thread::spawn(move || {
                let (response, _) = roundtrip(
                    worker,
                    &channel_dir,
                    request("budget", mib, IsolationKind::Scale, Value::Null),
                );
                (mib, response.into_outcome().unwrap().into_result().unwrap())
            })
        })
        .collect();

    let mut names = Vec::new();
    for handle in handles {
        let (mib, result) = handle.join().unwrap();
        assert_eq!(result["size"], format!("{}M", mib));
        names.push(result["scope"].as_str().unwrap().to_string());
    }
    assert_ne!(names[0], names[1]);
    assert_eq!(scope_count(&root), 0);
}

#[test]
fn test_handler_failure_is_delivered() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("faascale");
    let worker = scale_worker(&root, settings());

    let (response, report) = roundtrip(
        worker,
        dir.path(),
        request("fail", 32, IsolationKind::Scale, json!({"message": "bad input"})),
    );

    let outcome = response.into_outcome().unwrap();
    let error = outcome.error().unwrap();
    assert_eq!(error.kind, HandlerErrorKind::Failed);
    assert_eq!(error.message, "bad input");
    assert_eq!(report.status, WorkerStatus::HandlerFailed);
    assert_eq!(scope_count(&root), 0);
}

#[test]
fn test_hanging_handler_times_out_after_reclaim() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("faascale");
    let worker = scale_worker(
        &root,
        WorkerSettings {
            invocation_timeout: Duration::from_millis(300),
            ..settings()
        },
    );

    let started = Instant::now();
    let (response, report) = roundtrip(
        worker,
        dir.path(),
        request("hang", 32, IsolationKind::Scale, Value::Null),
    );

    let err = response.into_outcome().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.status, WorkerStatus::TimedOut);
    assert!(!report.scope_leaked);
    assert_eq!(scope_count(&root), 0);
}

#[test]
fn test_crashed_child_is_reported() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("faascale");
    let worker = scale_worker(&root, settings());

    let (response, report) = roundtrip(
        worker,
        dir.path(),
        request("crash", 32, IsolationKind::Scale, Value::Null),
    );

    let err = response.into_outcome().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Internal);
    assert!(err.to_string().contains("without a result"));
    assert_eq!(report.status, WorkerStatus::Failed(ErrorClass::Internal));
    assert_eq!(scope_count(&root), 0);
}

#[test]
fn test_balloon_invocation() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let worker: Arc<dyn IsolationWorker> = Arc::new(BalloonWorker::new(registry(), settings()));
    assert_eq!(worker.kind(), IsolationKind::Balloon);

    let (response, report) = roundtrip(
        worker,
        dir.path(),
        request("stamp", 128, IsolationKind::Balloon, Value::Null),
    );

    assert_eq!(
        response.into_outcome().unwrap().into_result().unwrap(),
        json!([1.0, 2.0])
    );
    assert_eq!(report.status, WorkerStatus::Succeeded);
}

#[test]
fn test_balloon_timeout() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let worker: Arc<dyn IsolationWorker> = Arc::new(BalloonWorker::new(
        registry(),
        WorkerSettings {
            handoff_timeout: Duration::from_millis(200),
            invocation_timeout: Duration::from_millis(200),
            reply_timeout: Duration::from_millis(500),
            ..settings()
        },
    ));

    let (response, report) = roundtrip(
        worker,
        dir.path(),
        request("hang", 32, IsolationKind::Balloon, Value::Null),
    );

    assert_eq!(response.into_outcome().unwrap_err().class(), ErrorClass::Timeout);
    assert_eq!(report.status, WorkerStatus::TimedOut);
}

#[test]
fn test_scope_budget_readback_with_member() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let controller: Arc<dyn ScopeController> =
        Arc::new(DirectoryController::new(dir.path(), ControlFiles::default()).unwrap());
    let mut scope = ResourceScope::create(
        Arc::clone(&controller),
        MemoryBudget::from_mib(256).unwrap(),
        settings().teardown,
    )
    .unwrap();

    let name = scope.name().clone();
    let child_controller = Arc::clone(&controller);
    let mut child = fork_with_output(move |mut pipe| {
        let joined = child_controller.join(&name, std::process::id() as i32).is_ok();
        let _ = pipe.send(&joined);
        thread::sleep(Duration::from_secs(30));
        0
    })
    .unwrap();

    let joined: bool = child
        .read(Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
        .unwrap();
    assert!(joined);
    assert_eq!(scope.members().unwrap(), vec![child.pid()]);
    assert_eq!(scope.budget().unwrap().mib(), 256);

    child.terminate_and_reap(Duration::from_secs(2)).unwrap();
    assert!(scope.members().unwrap().is_empty());
    scope.teardown().unwrap();
    assert!(!scope.path().exists());
}
