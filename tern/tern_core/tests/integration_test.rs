//! Integration tests for the tern core library.
//!
//! These exercise the pieces that travel together across a worker
//! boundary: the registry resolving a split function name, the request
//! frame and the response that comes back.

use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tern_core::error::{Error, ErrorClass};
use tern_core::{
    CancellationToken, Deadline, HandlerContext, HandlerError, HandlerErrorKind, HandlerRegistry,
    InvocationContext, InvocationId, InvocationRequest, IsolationKind, MemoryBudget,
    StoreEndpoint, WorkerFailure, WorkerResponse,
};

fn registry() -> HandlerRegistry {
    HandlerRegistry::builder()
        .register_fn("echo", |args: &Value, _: &HandlerContext| Ok(args.clone()))
        .register_fn("store", |_: &Value, ctx: &HandlerContext| {
            Ok(json!({ "host": ctx.store.host, "isolated": ctx.invocation_id.is_some() }))
        })
        .register_fn("reject", |_: &Value, _: &HandlerContext| {
            Err(HandlerError::invalid_arguments("size is required"))
        })
        .register_fn("explode", |_: &Value, _: &HandlerContext| -> Result<Value, HandlerError> {
            panic!("boom")
        })
        .build()
}

#[test]
fn test_request_crosses_the_boundary() {
    let (kind, bare) = IsolationKind::split("echo-faascale");
    assert_eq!(kind, IsolationKind::Scale);

    let request = InvocationRequest {
        id: InvocationId::new(),
        function: bare.to_string(),
        arguments: json!({"size": 4}),
        memory_budget: MemoryBudget::from_mib(256).unwrap(),
        kind,
        context: InvocationContext::new(StoreEndpoint::new("10.0.0.7", "hunter2")),
    };

    let wire = serde_json::to_vec(&request).unwrap();
    let received: InvocationRequest = serde_json::from_slice(&wire).unwrap();
    assert_eq!(received.id, request.id);
    assert_eq!(received.memory_budget.to_control_string(), "256M");

    let ctx = HandlerContext::isolated(received.id, &received.context);
    let outcome = registry().invoke(&received.function, &received.arguments, &ctx);
    assert_eq!(outcome.into_result().unwrap(), json!({"size": 4}));

    let outcome = registry().invoke("store", &Value::Null, &ctx);
    assert_eq!(outcome.result().unwrap()["host"], "10.0.0.7");
    assert_eq!(outcome.result().unwrap()["isolated"], true);
}

#[test]
fn test_handler_failures_are_data() {
    let registry = registry();
    let ctx = HandlerContext::default();

    let rejected = registry.invoke("reject", &Value::Null, &ctx);
    assert_eq!(rejected.error().unwrap().kind, HandlerErrorKind::InvalidArguments);

    let panicked = registry.invoke("explode", &Value::Null, &ctx);
    let error = panicked.error().unwrap();
    assert_eq!(error.kind, HandlerErrorKind::Panicked);
    assert_eq!(error.message, "boom");

    let unknown = registry.invoke("missing", &Value::Null, &ctx);
    assert_eq!(unknown.error().unwrap().kind, HandlerErrorKind::UnknownFunction);

    // A failed outcome still arrives as a completed response
    let response = WorkerResponse::Completed { outcome: rejected };
    let wire = serde_json::to_string(&response).unwrap();
    let response: WorkerResponse = serde_json::from_str(&wire).unwrap();
    assert!(!response.into_outcome().unwrap().is_ok());
}

#[test]
fn test_worker_failures_become_errors() {
    let response = WorkerResponse::Failed {
        failure: WorkerFailure::new(ErrorClass::Timeout, "handler exceeded 500 ms"),
    };
    let err = response.into_outcome().unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let response = WorkerResponse::Failed {
        failure: WorkerFailure::new(ErrorClass::Teardown, "scope busy"),
    };
    assert_eq!(response.into_outcome().unwrap_err().class(), ErrorClass::Teardown);
}

#[test]
fn test_cancellation_reaches_child_tokens() {
    let parent = CancellationToken::new();
    let child = parent.child();
    let deadline = Deadline::after(Duration::from_secs(5));

    let waiter = thread::spawn(move || loop {
        if let Err(e) = deadline.check(&child, "waiting for cancel") {
            return e;
        }
        thread::sleep(Duration::from_millis(5));
    });

    parent.cancel();
    let err = waiter.join().unwrap();
    assert_eq!(err.class(), ErrorClass::Cancelled);
}
