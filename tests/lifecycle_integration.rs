//! Full lifecycle integration tests.
//!
//! These tests drive the system the way a transport and a worker pool would:
//! submit through the controller, deliver through the queue, run through the
//! execution runner, and poll with `get_status`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_tasks::queue::InMemoryWorkQueue;
use async_tasks::{
    handler_fn, Dispatcher, ExecutionRunner, ProcessOutcome, SubmitRequest, TaskHandler,
    TaskRuntime, TaskStatus, TaskStore, TasksConfig, WorkQueue,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Upper-cases `text`, rejecting languages it does not know.
fn text_handler() -> impl TaskHandler {
    handler_fn(|payload: Value| async move {
        let text = payload["text"]
            .as_str()
            .ok_or_else(|| "missing text".to_string())?;
        match payload["language"].as_str() {
            Some("en") | Some("es") => Ok(json!({ "processed": text.to_uppercase() })),
            other => Err(format!("language not supported: {}", other.unwrap_or("none"))),
        }
    })
}

async fn runtime_with(handler: impl TaskHandler + 'static) -> TaskRuntime {
    let mut config = TasksConfig::default();
    config.worker.idle_backoff_ms = 10;
    TaskRuntime::from_config(&config, handler).await.unwrap()
}

async fn drain(runtime: &TaskRuntime) -> Vec<ProcessOutcome> {
    let mut outcomes = Vec::new();
    while let Some(entry) = runtime.queue().dequeue(Duration::ZERO).await.unwrap() {
        outcomes.push(runtime.runner().process(&entry.task_id).await.unwrap());
    }
    outcomes
}

async fn wait_for_status(runtime: &TaskRuntime, task_id: &str, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let view = runtime.controller().get_status(task_id).await.unwrap();
        if view.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} stuck in {}",
            view.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_submission_then_success() {
    let runtime = runtime_with(text_handler()).await;
    let controller = runtime.controller();

    let first = controller
        .submit_request(Some("K1"), SubmitRequest::new("hello"))
        .await
        .unwrap();
    assert!(first.created);
    assert_eq!(first.status, TaskStatus::Pending);

    let second = controller
        .submit_request(Some("K1"), SubmitRequest::new("hello"))
        .await
        .unwrap();
    assert_eq!(second.task_id, first.task_id);
    assert!(!second.created);

    assert_eq!(drain(&runtime).await, vec![ProcessOutcome::Completed]);

    let view = controller.get_status(&first.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.result, Some(json!({ "processed": "HELLO" })));
    let started = view.started_at.unwrap();
    let finished = view.finished_at.unwrap();
    assert!(view.queued_at <= started);
    assert!(started <= finished);

    // A replay after completion still answers with the same task, and its
    // different payload is neither stored nor run.
    let third = controller
        .submit_request(Some("K1"), SubmitRequest::new("world"))
        .await
        .unwrap();
    assert_eq!(third.task_id, first.task_id);
    assert_eq!(third.status, TaskStatus::Completed);
    assert!(drain(&runtime).await.is_empty());

    let record = runtime.store().get(&first.task_id).await.unwrap();
    assert_eq!(record.payload["text"], "hello");
    assert_eq!(record.result, Some(json!({ "processed": "HELLO" })));
}

#[tokio::test]
async fn test_handler_failure_is_recorded() {
    let runtime = runtime_with(text_handler()).await;
    let resp = runtime
        .controller()
        .submit(Some("K2"), json!({ "text": "hallo", "language": "de" }))
        .await
        .unwrap();

    assert_eq!(drain(&runtime).await, vec![ProcessOutcome::Failed]);

    let view = runtime.controller().get_status(&resp.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.error.as_deref(), Some("language not supported: de"));
    assert!(view.result.is_none());
    assert!(view.finished_at.is_some());
}

// ─── Idempotency Under Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_key_submissions_create_one_task() {
    let runtime = Arc::new(runtime_with(text_handler()).await);

    let mut handles = Vec::new();
    for _ in 0..24 {
        let runtime = Arc::clone(&runtime);
        handles.push(tokio::spawn(async move {
            runtime
                .controller()
                .submit(Some("same-key"), json!({ "text": "x", "language": "en" }))
                .await
                .unwrap()
        }));
    }

    let mut ids = HashSet::new();
    let mut created = 0;
    for handle in handles {
        let resp = handle.await.unwrap();
        ids.insert(resp.task_id);
        if resp.created {
            created += 1;
        }
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(created, 1);
    let pending = runtime.store().list_by_status(TaskStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(runtime.queue().len().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_deliveries_execute_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        handler_fn(move |payload: Value| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(payload)
            }
        })
    };
    let runtime = runtime_with(handler).await;
    let resp = runtime.controller().submit(None, json!(1)).await.unwrap();
    for _ in 0..7 {
        runtime.dispatcher().enqueue(&resp.task_id).await.unwrap();
    }

    let shutdown = CancellationToken::new();
    let workers = runtime.spawn_workers(shutdown.clone());
    wait_for_status(&runtime, &resp.task_id, TaskStatus::Completed).await;
    while !runtime.queue().is_empty().await.unwrap() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ─── Failure Recovery ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_enqueue_failure_is_recovered_by_requeue_sweep() {
    // The broker is down when the task is submitted.
    let runtime = runtime_with(text_handler()).await;
    runtime.queue().close().await;

    let resp = runtime
        .controller()
        .submit(Some("K3"), json!({ "text": "late", "language": "en" }))
        .await
        .unwrap();
    assert!(resp.created);
    assert_eq!(
        runtime.controller().get_status(&resp.task_id).await.unwrap().status,
        TaskStatus::Pending
    );

    let queue = Arc::new(InMemoryWorkQueue::new());
    let dispatcher = Dispatcher::new(
        Arc::clone(runtime.store()),
        Arc::clone(runtime.index()),
        queue.clone(),
    );

    assert_eq!(dispatcher.requeue_stale(Duration::ZERO).await.unwrap(), 1);

    let runner = ExecutionRunner::new(
        Arc::clone(runtime.store()),
        queue.clone(),
        Arc::new(text_handler()),
    );
    let entry = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(entry.task_id, resp.task_id);
    assert_eq!(runner.process(&entry.task_id).await.unwrap(), ProcessOutcome::Completed);
}

#[tokio::test]
async fn test_stuck_task_is_recovered_and_completed() {
    let runtime = runtime_with(text_handler()).await;
    let resp = runtime
        .controller()
        .submit(None, json!({ "text": "again", "language": "en" }))
        .await
        .unwrap();

    // A worker claims the task and then disappears.
    let entry = runtime.queue().dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert!(runtime.runner().claim(&entry.task_id).await.unwrap());

    assert_eq!(
        runtime.controller().recover_stale(Duration::ZERO).await.unwrap(),
        1
    );
    assert_eq!(drain(&runtime).await, vec![ProcessOutcome::Completed]);

    let record = runtime.store().get(&resp.task_id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn test_handler_panic_marks_task_failed() {
    let runtime = runtime_with(handler_fn(|payload: Value| async move {
        if payload["explode"] == true {
            panic!("handler exploded");
        }
        Ok(payload)
    }))
    .await;

    let bad = runtime
        .controller()
        .submit(None, json!({ "explode": true }))
        .await
        .unwrap();
    let good = runtime
        .controller()
        .submit(None, json!({ "explode": false }))
        .await
        .unwrap();

    let outcomes = drain(&runtime).await;
    assert_eq!(outcomes, vec![ProcessOutcome::Failed, ProcessOutcome::Completed]);

    let view = runtime.controller().get_status(&bad.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert!(view.error.unwrap().contains("handler exploded"));
    assert_eq!(
        runtime.controller().get_status(&good.task_id).await.unwrap().status,
        TaskStatus::Completed
    );
}

// ─── Worker Pool ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_processes_all_submissions() {
    let runtime = runtime_with(text_handler()).await;
    let shutdown = CancellationToken::new();
    let workers = runtime.spawn_workers(shutdown.clone());

    let mut ids = Vec::new();
    for i in 0..25 {
        let language = if i % 5 == 0 { "fr" } else { "en" };
        let key = format!("batch-{i}");
        let resp = runtime
            .controller()
            .submit(
                Some(key.as_str()),
                json!({ "text": format!("item {i}"), "language": language }),
            )
            .await
            .unwrap();
        ids.push((resp.task_id, language));
    }

    for (task_id, language) in &ids {
        let expected = if *language == "fr" {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        wait_for_status(&runtime, task_id, expected).await;
    }

    shutdown.cancel();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(
        runtime.store().list_by_status(TaskStatus::Failed).await.unwrap().len(),
        5
    );
    assert_eq!(
        runtime.store().list_by_status(TaskStatus::Completed).await.unwrap().len(),
        20
    );
}
