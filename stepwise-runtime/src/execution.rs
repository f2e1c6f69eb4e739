//! Executions: one run of a state machine against an input.

use crate::error::RuntimeError;
use crate::notify::{StatusChangeRecord, StatusSink};
use crate::state_machine::StateMachine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use stepwise_core::context::{format_timestamp, ExecutionContext, StateMachineContext};
use stepwise_core::failure::names;
use stepwise_core::{
    ContextObject, CoreError, Definition, EventHistory, ExecutionWorker, HistoryEvent,
    ProgramState, Services,
};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCEEDED" => Ok(ExecutionStatus::Succeeded),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "TIMED_OUT" => Ok(ExecutionStatus::TimedOut),
            "ABORTED" => Ok(ExecutionStatus::Aborted),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Full description of an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDescription {
    pub execution_arn: String,
    pub state_machine_arn: String,
    pub name: String,
    pub status: ExecutionStatus,
    pub start_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_date: Option<DateTime<Utc>>,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Listing entry for an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_arn: String,
    pub state_machine_arn: String,
    pub name: String,
    pub status: ExecutionStatus,
    pub start_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Outcome {
    status: ExecutionStatus,
    stop_date: Option<DateTime<Utc>>,
    output: Option<Value>,
    error: Option<String>,
    cause: Option<String>,
}

impl Outcome {
    fn from_state(state: ProgramState) -> Self {
        let (status, output, error, cause) = match state {
            ProgramState::Ended(output) => (ExecutionStatus::Succeeded, Some(output), None, None),
            ProgramState::Errored(failure) => {
                (ExecutionStatus::Failed, None, Some(failure.error), failure.cause)
            }
            ProgramState::Stopped { error, cause } => (ExecutionStatus::Aborted, None, error, cause),
            ProgramState::TimedOut => (
                ExecutionStatus::TimedOut,
                None,
                Some(names::TIMEOUT.to_string()),
                Some("execution exceeded its TimeoutSeconds".to_string()),
            ),
            ProgramState::Running => (
                ExecutionStatus::Failed,
                None,
                Some(names::RUNTIME.to_string()),
                Some("execution finished without an outcome".to_string()),
            ),
        };
        Outcome {
            status,
            stop_date: Some(Utc::now()),
            output,
            error,
            cause,
        }
    }
}

/// One run of a state machine. Its history outlives the worker.
pub struct Execution {
    name: String,
    arn: String,
    state_machine_arn: String,
    start_date: DateTime<Utc>,
    input: Value,
    worker: ExecutionWorker,
    outcome: RwLock<Outcome>,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl Execution {
    /// Creates an execution bound to the machine's current definition.
    pub fn new(
        machine: &StateMachine,
        name: impl Into<String>,
        arn: impl Into<String>,
        input: Value,
        services: Arc<Services>,
    ) -> Arc<Self> {
        let name = name.into();
        let arn = arn.into();
        let start_date = Utc::now();

        let context = ContextObject::new(
            ExecutionContext {
                id: arn.clone(),
                input: input.clone(),
                name: name.clone(),
                role_arn: machine.role_arn(),
                start_time: format_timestamp(start_date),
            },
            StateMachineContext {
                id: machine.arn().to_string(),
                name: machine.name().to_string(),
            },
        );
        let worker = ExecutionWorker::new(
            machine.definition(),
            input.clone(),
            context,
            EventHistory::new(),
            services,
        );
        let (status_tx, _) = watch::channel(ExecutionStatus::Running);

        Arc::new(Self {
            name,
            arn,
            state_machine_arn: machine.arn().to_string(),
            start_date,
            input,
            worker,
            outcome: RwLock::new(Outcome {
                status: ExecutionStatus::Running,
                stop_date: None,
                output: None,
                error: None,
                cause: None,
            }),
            status_tx,
        })
    }

    /// Starts the worker and publishes status changes to `sink`.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn StatusSink>) -> Result<(), RuntimeError> {
        let handle = self.worker.start()?;
        info!(execution = %self.arn, "execution running");
        self.publish(sink.as_ref());

        let execution = Arc::clone(self);
        tokio::spawn(async move {
            let state = handle.wait().await;
            execution.finish(state, sink.as_ref());
        });
        Ok(())
    }

    fn finish(&self, state: ProgramState, sink: &dyn StatusSink) {
        let outcome = Outcome::from_state(state);
        let status = outcome.status;
        *self.outcome.write() = outcome;
        self.status_tx.send_replace(status);
        info!(execution = %self.arn, status = %status, "execution completed");
        self.publish(sink);
    }

    fn publish(&self, sink: &dyn StatusSink) {
        let record = {
            let outcome = self.outcome.read();
            StatusChangeRecord {
                execution_arn: self.arn.clone(),
                state_machine_arn: self.state_machine_arn.clone(),
                name: self.name.clone(),
                status: outcome.status,
                start_date: self.start_date,
                stop_date: outcome.stop_date,
                input: self.input.clone(),
                output: outcome.output.clone(),
                error: outcome.error.clone(),
                cause: outcome.cause.clone(),
            }
        };
        if let Err(e) = sink.publish(record) {
            error!(execution = %self.arn, error = %e, "failed to publish status change");
        }
    }

    /// Requests the execution to stop; returns the request date.
    pub fn stop(
        &self,
        error: Option<String>,
        cause: Option<String>,
    ) -> Result<DateTime<Utc>, RuntimeError> {
        self.worker.stop(error, cause).map_err(|e| match e {
            CoreError::NoActiveWorker => RuntimeError::ExecutionNotRunning {
                arn: self.arn.clone(),
            },
            other => other.into(),
        })?;
        Ok(Utc::now())
    }

    /// Waits until the execution reaches a terminal status.
    pub async fn wait(&self) -> ExecutionDescription {
        let mut rx = self.status_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once terminal.
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.describe()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn state_machine_arn(&self) -> &str {
        &self.state_machine_arn
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn status(&self) -> ExecutionStatus {
        self.outcome.read().status
    }

    /// The definition this execution runs, fixed at creation.
    pub fn definition(&self) -> &Arc<Definition> {
        self.worker.definition()
    }

    pub fn history(&self) -> Vec<HistoryEvent> {
        self.worker.history().events()
    }

    pub fn describe(&self) -> ExecutionDescription {
        let outcome = self.outcome.read();
        ExecutionDescription {
            execution_arn: self.arn.clone(),
            state_machine_arn: self.state_machine_arn.clone(),
            name: self.name.clone(),
            status: outcome.status,
            start_date: self.start_date,
            stop_date: outcome.stop_date,
            input: self.input.clone(),
            output: outcome.output.clone(),
            error: outcome.error.clone(),
            cause: outcome.cause.clone(),
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        let outcome = self.outcome.read();
        ExecutionSummary {
            execution_arn: self.arn.clone(),
            state_machine_arn: self.state_machine_arn.clone(),
            name: self.name.clone(),
            status: outcome.status,
            start_date: self.start_date,
            stop_date: outcome.stop_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{BroadcastSink, NullSink, PublishError, StatusFilter};
    use serde_json::json;
    use std::time::Duration;
    use stepwise_core::{EngineSettings, HistoryEventType, ResourceRegistry};

    struct RejectingSink;

    impl StatusSink for RejectingSink {
        fn publish(&self, _record: StatusChangeRecord) -> Result<(), PublishError> {
            Err(PublishError::Closed)
        }
    }

    fn execution(definition: Value, input: Value) -> Arc<Execution> {
        let machine = StateMachine::new(
            "m",
            "arn:aws:states:us-east-1:123456789012:stateMachine:m",
            Definition::compile(&definition).unwrap(),
            "arn:aws:iam::123456789012:role/r",
        );
        let services = Arc::new(Services::new(
            Arc::new(ResourceRegistry::new()),
            EngineSettings::default(),
        ));
        Execution::new(
            &machine,
            "run",
            "arn:aws:states:us-east-1:123456789012:execution:m:run",
            input,
            services,
        )
    }

    fn pass_machine() -> Value {
        json!({"StartAt": "P", "States": {"P": {"Type": "Pass", "End": true}}})
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ExecutionStatus::TimedOut.to_string(), "TIMED_OUT");
        assert_eq!("aborted".parse::<ExecutionStatus>(), Ok(ExecutionStatus::Aborted));
        assert!("done".parse::<ExecutionStatus>().is_err());
        assert_eq!(
            serde_json::to_value(ExecutionStatus::Succeeded).unwrap(),
            json!("SUCCEEDED")
        );
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[tokio::test]
    async fn test_succeeds_and_describes() {
        let execution = execution(pass_machine(), json!({"a": 1}));
        assert_eq!(execution.status(), ExecutionStatus::Running);
        execution.start(Arc::new(NullSink)).unwrap();

        let description = execution.wait().await;
        assert_eq!(description.status, ExecutionStatus::Succeeded);
        assert_eq!(description.output, Some(json!({"a": 1})));
        assert!(description.stop_date.is_some());
        assert!(description.error.is_none());

        let value = serde_json::to_value(&description).unwrap();
        assert_eq!(value["executionArn"], execution.arn());
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_context_object_carries_execution_metadata() {
        let execution = execution(
            json!({
                "StartAt": "P",
                "States": {"P": {"Type": "Pass", "Parameters": {
                    "name.$": "$$.Execution.Name",
                    "machine.$": "$$.StateMachine.Name",
                    "role.$": "$$.Execution.RoleArn"
                }, "End": true}}
            }),
            json!({}),
        );
        execution.start(Arc::new(NullSink)).unwrap();
        let description = execution.wait().await;
        assert_eq!(
            description.output,
            Some(json!({"name": "run", "machine": "m", "role": "arn:aws:iam::123456789012:role/r"}))
        );
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let execution = execution(pass_machine(), json!({}));
        execution.start(Arc::new(NullSink)).unwrap();
        let err = execution.start(Arc::new(NullSink)).unwrap_err();
        assert_eq!(err.error_code(), "ExecutionAlreadyExists");
        execution.wait().await;
    }

    #[tokio::test]
    async fn test_stop_after_completion() {
        let execution = execution(pass_machine(), json!({}));
        execution.start(Arc::new(NullSink)).unwrap();
        execution.wait().await;
        assert!(matches!(
            execution.stop(None, None),
            Err(RuntimeError::ExecutionNotRunning { .. })
        ));
        // History persists after completion.
        let history = execution.history();
        assert_eq!(history.first().map(|e| e.event_type), Some(HistoryEventType::ExecutionStarted));
        assert_eq!(history.last().map(|e| e.event_type), Some(HistoryEventType::ExecutionSucceeded));
    }

    #[tokio::test]
    async fn test_stop_aborts() {
        let execution = execution(
            json!({"StartAt": "W", "States": {"W": {"Type": "Wait", "Seconds": 120, "End": true}}}),
            json!({}),
        );
        execution.start(Arc::new(NullSink)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        execution
            .stop(Some("Manual".to_string()), Some("operator request".to_string()))
            .unwrap();

        let description = tokio::time::timeout(Duration::from_secs(5), execution.wait())
            .await
            .unwrap();
        assert_eq!(description.status, ExecutionStatus::Aborted);
        assert_eq!(description.error.as_deref(), Some("Manual"));
        assert_eq!(description.cause.as_deref(), Some("operator request"));
    }

    #[tokio::test]
    async fn test_publishes_running_and_terminal() {
        let sink = Arc::new(BroadcastSink::new(8));
        let mut rx = sink.subscribe_all(StatusFilter::default());

        let execution = execution(
            json!({"StartAt": "F", "States": {"F": {"Type": "Fail", "Error": "Boom"}}}),
            json!({}),
        );
        execution.start(sink.clone()).unwrap();
        execution.wait().await;

        let running = rx.recv().await.unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("Boom"));
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_change_outcome() {
        let execution = execution(pass_machine(), json!({"ok": true}));
        execution.start(Arc::new(RejectingSink)).unwrap();
        let description = execution.wait().await;
        assert_eq!(description.status, ExecutionStatus::Succeeded);
    }
}
