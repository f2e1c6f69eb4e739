//! The workflow engine: state machine registry and execution lifecycle.

use crate::arn::{self, ResourceArn};
use crate::config::Config;
use crate::error::RuntimeError;
use crate::execution::{Execution, ExecutionDescription, ExecutionStatus, ExecutionSummary};
use crate::notify::{BroadcastSink, NullSink, StatusSink};
use crate::state_machine::{StateMachine, StateMachineDescription, StateMachineSummary};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use stepwise_core::{Definition, HistoryEvent, ResourceInvoker, Services};
use tracing::{debug, info};

/// Result of `start_execution`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionOutput {
    pub execution_arn: String,
    pub start_date: DateTime<Utc>,
}

/// Registry of state machines and their executions.
pub struct WorkflowEngine {
    region: String,
    account_id: String,
    services: Arc<Services>,
    sink: Arc<dyn StatusSink>,
    broadcaster: Option<Arc<BroadcastSink>>,
    state_machines: DashMap<String, Arc<StateMachine>>,
    executions: DashMap<String, Arc<Execution>>,
}

impl WorkflowEngine {
    /// Creates an engine; status changes go to a [`BroadcastSink`] when
    /// notifications are enabled.
    pub fn new(config: &Config, invoker: Arc<dyn ResourceInvoker>) -> Self {
        let broadcaster = config
            .notifications
            .enabled
            .then(|| Arc::new(BroadcastSink::new(config.notifications.capacity)));
        let sink: Arc<dyn StatusSink> = match &broadcaster {
            Some(broadcaster) => broadcaster.clone(),
            None => Arc::new(NullSink),
        };
        let mut engine = Self::with_sink(config, invoker, sink);
        engine.broadcaster = broadcaster;
        engine
    }

    /// Creates an engine publishing status changes to a custom sink.
    pub fn with_sink(
        config: &Config,
        invoker: Arc<dyn ResourceInvoker>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self::with_services(
            config,
            Arc::new(Services::new(invoker, config.engine.settings())),
            sink,
        )
    }

    /// Creates an engine from prepared services (e.g. custom intrinsics).
    pub fn with_services(config: &Config, services: Arc<Services>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            region: config.engine.region.clone(),
            account_id: config.engine.account_id.clone(),
            services,
            sink,
            broadcaster: None,
            state_machines: DashMap::new(),
            executions: DashMap::new(),
        }
    }

    /// The broadcast sink, when the engine owns one.
    pub fn notifications(&self) -> Option<&Arc<BroadcastSink>> {
        self.broadcaster.as_ref()
    }

    // =========================================================================
    // State machines
    // =========================================================================

    /// Registers a state machine and returns its ARN.
    ///
    /// Creating the same name again with an identical definition and role
    /// returns the existing ARN; anything else is a conflict.
    pub fn create_state_machine(
        &self,
        name: &str,
        definition: &Value,
        role_arn: &str,
    ) -> Result<String, RuntimeError> {
        arn::validate_name(name)?;
        let definition = Definition::compile(definition)?;
        let arn = arn::state_machine_arn(&self.region, &self.account_id, name);

        match self.state_machines.entry(arn.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().is_identical(&definition, role_arn) {
                    debug!(state_machine = %arn, "identical state machine already exists");
                    Ok(arn)
                } else {
                    Err(RuntimeError::StateMachineExists { arn })
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(StateMachine::new(name, arn.clone(), definition, role_arn)));
                info!(state_machine = %arn, "state machine created");
                Ok(arn)
            }
        }
    }

    /// Replaces a state machine's definition and/or role; returns the update date.
    ///
    /// Running executions keep the definition they started with.
    pub fn update_state_machine(
        &self,
        arn: &str,
        definition: Option<&Value>,
        role_arn: Option<&str>,
    ) -> Result<DateTime<Utc>, RuntimeError> {
        let machine = self.state_machine(arn)?;
        let definition = definition.map(Definition::compile).transpose()?;
        let updated = machine.update(definition, role_arn.map(str::to_string));
        info!(state_machine = %arn, "state machine updated");
        Ok(updated)
    }

    pub fn describe_state_machine(&self, arn: &str) -> Result<StateMachineDescription, RuntimeError> {
        Ok(self.state_machine(arn)?.describe())
    }

    /// All state machines, ordered by name.
    pub fn list_state_machines(&self) -> Vec<StateMachineSummary> {
        let mut machines: Vec<StateMachineSummary> =
            self.state_machines.iter().map(|m| m.summary()).collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        machines
    }

    /// Removes a state machine. Its executions keep running and stay visible.
    pub fn delete_state_machine(&self, arn: &str) -> Result<(), RuntimeError> {
        ResourceArn::state_machine(arn)?;
        match self.state_machines.remove(arn) {
            Some(_) => {
                info!(state_machine = %arn, "state machine deleted");
                Ok(())
            }
            None => Err(RuntimeError::StateMachineNotFound {
                arn: arn.to_string(),
            }),
        }
    }

    fn state_machine(&self, arn: &str) -> Result<Arc<StateMachine>, RuntimeError> {
        ResourceArn::state_machine(arn)?;
        self.state_machines
            .get(arn)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| RuntimeError::StateMachineNotFound {
                arn: arn.to_string(),
            })
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Starts an execution. `name` defaults to a fresh UUID and `input` to `{}`.
    ///
    /// Reusing the name of a running execution with the same input returns
    /// that execution; any other reuse is a conflict.
    pub fn start_execution(
        &self,
        state_machine_arn: &str,
        name: Option<&str>,
        input: Option<Value>,
    ) -> Result<StartExecutionOutput, RuntimeError> {
        let machine = self.state_machine(state_machine_arn)?;
        let name = match name {
            Some(name) => name.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        arn::validate_name(&name)?;
        let input = input.unwrap_or_else(|| json!({}));

        let execution_arn = arn::execution_arn(&self.region, &self.account_id, machine.name(), &name);
        let execution = match self.executions.entry(execution_arn.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.status() == ExecutionStatus::Running && existing.input() == &input {
                    return Ok(StartExecutionOutput {
                        execution_arn,
                        start_date: existing.start_date(),
                    });
                }
                return Err(RuntimeError::ExecutionAlreadyExists { arn: execution_arn });
            }
            Entry::Vacant(slot) => {
                let execution = Execution::new(
                    &machine,
                    name,
                    execution_arn.clone(),
                    input,
                    Arc::clone(&self.services),
                );
                slot.insert(Arc::clone(&execution));
                execution
            }
        };

        execution.start(Arc::clone(&self.sink))?;
        Ok(StartExecutionOutput {
            execution_arn,
            start_date: execution.start_date(),
        })
    }

    pub fn describe_execution(&self, arn: &str) -> Result<ExecutionDescription, RuntimeError> {
        Ok(self.execution(arn)?.describe())
    }

    /// Requests an execution to stop; returns the request date.
    pub fn stop_execution(
        &self,
        arn: &str,
        error: Option<&str>,
        cause: Option<&str>,
    ) -> Result<DateTime<Utc>, RuntimeError> {
        let execution = self.execution(arn)?;
        let stopped = execution.stop(error.map(str::to_string), cause.map(str::to_string))?;
        info!(execution = %arn, "execution stop requested");
        Ok(stopped)
    }

    pub fn get_execution_history(&self, arn: &str) -> Result<Vec<HistoryEvent>, RuntimeError> {
        Ok(self.execution(arn)?.history())
    }

    /// Executions of a state machine, newest first, optionally filtered by status.
    pub fn list_executions(
        &self,
        state_machine_arn: &str,
        status_filter: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionSummary>, RuntimeError> {
        self.state_machine(state_machine_arn)?;
        let mut executions: Vec<ExecutionSummary> = self
            .executions
            .iter()
            .filter(|e| e.state_machine_arn() == state_machine_arn)
            .map(|e| e.summary())
            .filter(|s| status_filter.map_or(true, |status| s.status == status))
            .collect();
        executions.sort_by(|a, b| b.start_date.cmp(&a.start_date).then_with(|| a.name.cmp(&b.name)));
        Ok(executions)
    }

    /// The execution entity, for waiting on its outcome.
    pub fn execution(&self, arn: &str) -> Result<Arc<Execution>, RuntimeError> {
        ResourceArn::execution(arn)?;
        self.executions
            .get(arn)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RuntimeError::ExecutionNotFound {
                arn: arn.to_string(),
            })
    }
}
