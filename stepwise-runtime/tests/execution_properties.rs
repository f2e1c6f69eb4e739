//! End-to-end behavior of executions driven through the workflow engine.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepwise_core::{FailureEvent, HistoryEvent, HistoryEventType, ResourceRegistry};
use stepwise_runtime::{builtin_registry, Config, ExecutionDescription, ExecutionStatus, WorkflowEngine};

const ROLE: &str = "arn:aws:iam::123456789012:role/integration";

fn engine_with(registry: ResourceRegistry) -> WorkflowEngine {
    WorkflowEngine::new(&Config::default(), Arc::new(registry))
}

fn start(engine: &WorkflowEngine, definition: Value, input: Value) -> String {
    let machine = engine
        .create_state_machine("machine", &definition, ROLE)
        .unwrap();
    engine
        .start_execution(&machine, None, Some(input))
        .unwrap()
        .execution_arn
}

async fn finish(engine: &WorkflowEngine, execution_arn: &str) -> (ExecutionDescription, Vec<HistoryEvent>) {
    let execution = engine.execution(execution_arn).unwrap();
    let description = tokio::time::timeout(Duration::from_secs(10), execution.wait())
        .await
        .expect("execution did not finish in time");
    let history = engine.get_execution_history(execution_arn).unwrap();
    (description, history)
}

fn count(history: &[HistoryEvent], event_type: HistoryEventType) -> usize {
    history.iter().filter(|e| e.event_type == event_type).count()
}

fn position(history: &[HistoryEvent], event_type: HistoryEventType) -> Option<usize> {
    history.iter().position(|e| e.event_type == event_type)
}

#[tokio::test]
async fn pass_then_succeed_returns_input() {
    let engine = engine_with(builtin_registry());
    let arn = start(
        &engine,
        json!({
            "StartAt": "P",
            "States": {
                "P": {"Type": "Pass", "Next": "Done"},
                "Done": {"Type": "Succeed"}
            }
        }),
        json!({"a": 1}),
    );

    let (description, history) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::Succeeded);
    assert_eq!(description.output, Some(json!({"a": 1})));
    assert_eq!(history.first().map(|e| e.event_type), Some(HistoryEventType::ExecutionStarted));
    assert_eq!(history.last().map(|e| e.event_type), Some(HistoryEventType::ExecutionSucceeded));
    assert_eq!(count(&history, HistoryEventType::PassStateEntered), 1);
    assert_eq!(count(&history, HistoryEventType::SucceedStateExited), 1);
}

#[tokio::test]
async fn task_retries_then_succeeds() {
    let registry = builtin_registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    registry.register_fn("flaky", move |_params, _ctx| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 2 {
                Err(FailureEvent::task_failed("not yet"))
            } else {
                Ok(json!({"attempt": attempt}))
            }
        }
    });
    let engine = engine_with(registry);

    let arn = start(
        &engine,
        json!({
            "StartAt": "T",
            "States": {
                "T": {
                    "Type": "Task",
                    "Resource": "flaky",
                    "Retry": [{
                        "ErrorEquals": ["States.TaskFailed"],
                        "MaxAttempts": 3,
                        "IntervalSeconds": 0
                    }],
                    "End": true
                }
            }
        }),
        json!({}),
    );

    let (description, history) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::Succeeded);
    assert_eq!(description.output, Some(json!({"attempt": 2})));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(count(&history, HistoryEventType::RetryScheduled), 2);
}

#[tokio::test]
async fn catch_routes_error_document_to_fallback() {
    let engine = engine_with(builtin_registry());
    let arn = start(
        &engine,
        json!({
            "StartAt": "T",
            "States": {
                "T": {
                    "Type": "Task",
                    "Resource": "builtin:fail",
                    "Parameters": {"Error": "Broken", "Cause": "always fails"},
                    "Catch": [{
                        "ErrorEquals": ["States.ALL"],
                        "Next": "Fallback",
                        "ResultPath": "$.error"
                    }],
                    "End": true
                },
                "Fallback": {"Type": "Pass", "End": true}
            }
        }),
        json!({"order": 7}),
    );

    let (description, history) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::Succeeded);
    assert_eq!(
        description.output,
        Some(json!({"order": 7, "error": {"Error": "Broken", "Cause": "always fails"}}))
    );
    assert_eq!(count(&history, HistoryEventType::TaskStateExited), 1);
    assert_eq!(count(&history, HistoryEventType::PassStateEntered), 1);
}

#[tokio::test]
async fn parallel_failure_aborts_sibling_before_failing() {
    let engine = engine_with(builtin_registry());
    let arn = start(
        &engine,
        json!({
            "StartAt": "Fork",
            "States": {
                "Fork": {
                    "Type": "Parallel",
                    "Branches": [
                        {"StartAt": "B1", "States": {"B1": {"Type": "Wait", "Seconds": 60, "End": true}}},
                        {"StartAt": "B2", "States": {"B2": {"Type": "Fail", "Error": "BranchBroke"}}}
                    ],
                    "End": true
                }
            }
        }),
        json!({}),
    );

    let started = Instant::now();
    let (description, history) = finish(&engine, &arn).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(description.status, ExecutionStatus::Failed);
    assert_eq!(description.error.as_deref(), Some("BranchBroke"));

    let aborted = position(&history, HistoryEventType::WaitStateAborted).unwrap();
    let failed = position(&history, HistoryEventType::ExecutionFailed).unwrap();
    assert!(aborted < failed);
    assert_eq!(count(&history, HistoryEventType::ParallelStateSucceeded), 0);
    assert_eq!(count(&history, HistoryEventType::ParallelStateFailed), 1);
}

#[tokio::test]
async fn stop_during_wait_aborts_promptly() {
    let engine = engine_with(builtin_registry());
    let arn = start(
        &engine,
        json!({"StartAt": "W", "States": {"W": {"Type": "Wait", "Seconds": 300, "End": true}}}),
        json!({}),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    engine
        .stop_execution(&arn, Some("Cancelled"), Some("integration test"))
        .unwrap();
    let (description, history) = finish(&engine, &arn).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(description.status, ExecutionStatus::Aborted);
    assert_eq!(description.error.as_deref(), Some("Cancelled"));
    assert_eq!(history.last().map(|e| e.event_type), Some(HistoryEventType::ExecutionAborted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loop_without_terminal_runs_until_stopped() {
    let engine = engine_with(builtin_registry());
    let arn = start(
        &engine,
        json!({
            "StartAt": "Spin",
            "States": {
                "Spin": {"Type": "Pass", "Next": "Pause"},
                "Pause": {"Type": "Wait", "Seconds": 0, "Next": "Spin"}
            }
        }),
        json!({}),
    );
    let execution = engine.execution(&arn).unwrap();

    let waited = tokio::time::timeout(Duration::from_millis(300), execution.wait()).await;
    assert!(waited.is_err(), "loop should not complete on its own");
    assert_eq!(execution.status(), ExecutionStatus::Running);

    engine.stop_execution(&arn, None, None).unwrap();
    let (description, _) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::Aborted);
}

#[tokio::test]
async fn event_ids_strictly_increase_across_branches() {
    let engine = engine_with(builtin_registry());
    let branch = |seconds: f64| {
        json!({
            "StartAt": "Work",
            "States": {
                "Work": {
                    "Type": "Task",
                    "Resource": "builtin:sleep",
                    "Parameters": {"Seconds": seconds},
                    "Next": "Tail"
                },
                "Tail": {"Type": "Pass", "End": true}
            }
        })
    };
    let arn = start(
        &engine,
        json!({
            "StartAt": "Fork",
            "States": {
                "Fork": {
                    "Type": "Parallel",
                    "Branches": [branch(0.01), branch(0.02), branch(0.0)],
                    "End": true
                }
            }
        }),
        json!({}),
    );

    let (description, history) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::Succeeded);
    assert!(history.windows(2).all(|w| w[0].id < w[1].id));
    assert!(history.iter().all(|e| e.previous_event_id < e.id));
    assert_eq!(count(&history, HistoryEventType::TaskSucceeded), 3);
}

#[tokio::test]
async fn map_respects_max_concurrency() {
    let registry = builtin_registry();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    registry.register_fn("track", move |params, _ctx| {
        let (running, peak) = (r.clone(), p.clone());
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, FailureEvent>(params)
        }
    });
    let engine = engine_with(registry);

    let arn = start(
        &engine,
        json!({
            "StartAt": "Each",
            "States": {
                "Each": {
                    "Type": "Map",
                    "ItemsPath": "$.items",
                    "MaxConcurrency": 2,
                    "ItemProcessor": {
                        "StartAt": "Track",
                        "States": {"Track": {"Type": "Task", "Resource": "track", "End": true}}
                    },
                    "End": true
                }
            }
        }),
        json!({"items": [1, 2, 3, 4, 5, 6, 7]}),
    );

    let (description, history) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::Succeeded);
    assert_eq!(description.output, Some(json!([1, 2, 3, 4, 5, 6, 7])));
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(count(&history, HistoryEventType::MapIterationSucceeded), 7);
}

#[tokio::test]
async fn machine_timeout_ends_timed_out() {
    let engine = engine_with(builtin_registry());
    let arn = start(
        &engine,
        json!({
            "StartAt": "W",
            "TimeoutSeconds": 1,
            "States": {"W": {"Type": "Wait", "Seconds": 60, "End": true}}
        }),
        json!({}),
    );

    let (description, history) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::TimedOut);
    assert_eq!(description.error.as_deref(), Some("States.Timeout"));
    assert_eq!(history.last().map(|e| e.event_type), Some(HistoryEventType::ExecutionTimedOut));
}

#[tokio::test]
async fn runaway_backoff_exhausts_retries_without_waiting() {
    let engine = engine_with(builtin_registry());
    let arn = start(
        &engine,
        json!({
            "StartAt": "T",
            "States": {
                "T": {
                    "Type": "Task",
                    "Resource": "builtin:fail",
                    "Parameters": {"Error": "Broken"},
                    "Retry": [{
                        "ErrorEquals": ["States.ALL"],
                        "IntervalSeconds": 0,
                        "BackoffRate": 1e300,
                        "MaxAttempts": 5
                    }],
                    "End": true
                }
            }
        }),
        json!({}),
    );

    let (description, history) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::Failed);
    assert_eq!(description.error.as_deref(), Some("Broken"));
    assert_eq!(count(&history, HistoryEventType::RetryScheduled), 5);
    assert_eq!(count(&history, HistoryEventType::TaskFailed), 6);
    assert_eq!(history.last().map(|e| e.event_type), Some(HistoryEventType::ExecutionFailed));
}

#[tokio::test]
async fn out_of_range_sleep_is_caught() {
    let engine = engine_with(builtin_registry());
    let arn = start(
        &engine,
        json!({
            "StartAt": "T",
            "States": {
                "T": {
                    "Type": "Task",
                    "Resource": "builtin:sleep",
                    "Parameters": {"Seconds": 1e20},
                    "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "Caught", "ResultPath": "$.error"}],
                    "End": true
                },
                "Caught": {"Type": "Pass", "End": true}
            }
        }),
        json!({}),
    );

    let (description, _) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::Succeeded);
    let output = description.output.unwrap();
    assert_eq!(output["error"]["Error"], "States.TaskFailed");
}

#[tokio::test]
async fn panicking_handler_fails_execution_with_terminal_event() {
    let registry = builtin_registry();
    registry.register_fn("explode", |_params, _ctx| async move {
        if true {
            panic!("handler exploded");
        }
        Ok::<Value, FailureEvent>(Value::Null)
    });
    let engine = engine_with(registry);
    let arn = start(
        &engine,
        json!({"StartAt": "T", "States": {"T": {"Type": "Task", "Resource": "explode", "End": true}}}),
        json!({}),
    );

    let (description, history) = finish(&engine, &arn).await;
    assert_eq!(description.status, ExecutionStatus::Failed);
    assert_eq!(description.error.as_deref(), Some("States.Runtime"));
    assert_eq!(history.last().map(|e| e.event_type), Some(HistoryEventType::ExecutionFailed));
    assert_eq!(
        engine.stop_execution(&arn, None, None).unwrap_err().error_code(),
        "ExecutionNotRunning"
    );
}
