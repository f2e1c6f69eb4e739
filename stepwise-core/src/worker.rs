//! Execution worker: owns the task that runs one execution's program.

use crate::context::ContextObject;
use crate::definition::Definition;
use crate::environment::{Environment, ProgramState, Services};
use crate::error::CoreError;
use crate::eval::run_program;
use crate::failure::{names, FailureEvent};
use crate::history::{EventHistory, HistoryEventType};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Resolves once the worker reaches a terminal program state.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<ProgramState>,
}

impl CompletionHandle {
    pub async fn wait(self) -> ProgramState {
        self.rx.await.unwrap_or_else(|_| {
            ProgramState::Errored(FailureEvent::runtime(
                "execution worker terminated before reporting an outcome",
            ))
        })
    }
}

#[derive(Debug, Default)]
struct StopRequest {
    error: Option<String>,
    cause: Option<String>,
}

struct WorkerShared {
    started: AtomicBool,
    finished: AtomicBool,
    timed_out: AtomicBool,
    stop_request: Mutex<Option<StopRequest>>,
    state: Mutex<ProgramState>,
}

/// Runs one execution's program on a spawned task.
pub struct ExecutionWorker {
    definition: Arc<Definition>,
    input: Value,
    context: ContextObject,
    history: EventHistory,
    services: Arc<Services>,
    cancel: CancellationToken,
    shared: Arc<WorkerShared>,
}

impl ExecutionWorker {
    pub fn new(
        definition: Arc<Definition>,
        input: Value,
        context: ContextObject,
        history: EventHistory,
        services: Arc<Services>,
    ) -> Self {
        Self {
            definition,
            input,
            context,
            history,
            services,
            cancel: CancellationToken::new(),
            shared: Arc::new(WorkerShared {
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                stop_request: Mutex::new(None),
                state: Mutex::new(ProgramState::Running),
            }),
        }
    }

    /// Starts the program. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<CompletionHandle, CoreError> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::WorkerAlreadyStarted);
        }

        let mut env = Environment::new(
            self.input.clone(),
            self.context.clone(),
            self.history.clone(),
            self.cancel.clone(),
            Arc::clone(&self.services),
        );
        env.record(
            HistoryEventType::ExecutionStarted,
            json!({
                "input": self.input,
                "roleArn": self.context.execution.role_arn,
            }),
        );

        let timer = self.definition.timeout_seconds.map(|secs| {
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        shared.timed_out.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        });

        let (tx, rx) = oneshot::channel();
        let definition = Arc::clone(&self.definition);
        let shared = Arc::clone(&self.shared);
        let history = self.history.clone();
        let execution = self.context.execution.id.clone();
        info!(execution = %execution, "execution started");

        tokio::spawn(async move {
            let program = tokio::spawn(run_program(definition, env));
            let (previous_event_id, state) = match program.await {
                Ok((env, state)) => (env.last_event_id(), state),
                Err(err) => {
                    error!(execution = %execution, error = %err, "execution program panicked");
                    let failure = FailureEvent::runtime(format!("execution program panicked: {err}"));
                    (history.last_id(), ProgramState::Errored(failure))
                }
            };
            if let Some(timer) = timer {
                timer.abort();
            }

            let state = match state {
                ProgramState::Stopped { .. } if shared.timed_out.load(Ordering::SeqCst) => {
                    ProgramState::TimedOut
                }
                ProgramState::Stopped { .. } => {
                    let request = shared.stop_request.lock().take().unwrap_or_default();
                    ProgramState::Stopped {
                        error: request.error,
                        cause: request.cause,
                    }
                }
                other => other,
            };

            record_outcome(&history, previous_event_id, &state);
            info!(execution = %execution, outcome = outcome_name(&state), "execution finished");

            *shared.state.lock() = state.clone();
            shared.finished.store(true, Ordering::SeqCst);
            if tx.send(state).is_err() {
                debug!(execution = %execution, "completion handle dropped");
            }
        });

        Ok(CompletionHandle { rx })
    }

    /// Requests the program to stop. The first request's error and cause win.
    pub fn stop(&self, error: Option<String>, cause: Option<String>) -> Result<(), CoreError> {
        if !self.is_running() {
            return Err(CoreError::NoActiveWorker);
        }
        {
            let mut request = self.shared.stop_request.lock();
            if request.is_none() {
                *request = Some(StopRequest { error, cause });
            }
        }
        self.cancel.cancel();
        Ok(())
    }

    /// Returns true between `start()` and the terminal outcome.
    pub fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst) && !self.shared.finished.load(Ordering::SeqCst)
    }

    /// Current program state; `Running` until the worker finishes.
    pub fn state(&self) -> ProgramState {
        self.shared.state.lock().clone()
    }

    pub fn history(&self) -> &EventHistory {
        &self.history
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.definition
    }
}

fn record_outcome(history: &EventHistory, previous_event_id: u64, state: &ProgramState) {
    let (event_type, details) = match state {
        ProgramState::Ended(output) => (HistoryEventType::ExecutionSucceeded, json!({"output": output})),
        ProgramState::Errored(failure) => (
            HistoryEventType::ExecutionFailed,
            json!({"error": failure.error, "cause": failure.cause}),
        ),
        ProgramState::Stopped { error, cause } => (
            HistoryEventType::ExecutionAborted,
            json!({"error": error, "cause": cause}),
        ),
        ProgramState::TimedOut => (
            HistoryEventType::ExecutionTimedOut,
            json!({"error": names::TIMEOUT, "cause": "execution exceeded its TimeoutSeconds"}),
        ),
        ProgramState::Running => return,
    };
    history.append(previous_event_id, event_type, details);
}

fn outcome_name(state: &ProgramState) -> &'static str {
    match state {
        ProgramState::Running => "running",
        ProgramState::Ended(_) => "succeeded",
        ProgramState::Stopped { .. } => "aborted",
        ProgramState::Errored(_) => "failed",
        ProgramState::TimedOut => "timed_out",
    }
}
