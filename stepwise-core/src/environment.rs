//! Per-program evaluation environment.

use crate::context::ContextObject;
use crate::failure::FailureEvent;
use crate::history::{EventHistory, HistoryEventType};
use crate::intrinsic::{BuiltinIntrinsics, IntrinsicEvaluator};
use crate::invoke::ResourceInvoker;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Engine-wide knobs handed to the core by the embedding runtime.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    /// Upper bound on concurrent Map iterations; `None` is unbounded.
    pub max_concurrency: Option<usize>,
    /// Timeout for Tasks that declare none.
    pub default_task_timeout: Option<Duration>,
}

/// Collaborators shared by every environment of an engine.
pub struct Services {
    pub invoker: Arc<dyn ResourceInvoker>,
    pub intrinsics: Arc<dyn IntrinsicEvaluator>,
    pub settings: EngineSettings,
}

impl Services {
    /// Services with the built-in intrinsic functions.
    pub fn new(invoker: Arc<dyn ResourceInvoker>, settings: EngineSettings) -> Self {
        Self {
            invoker,
            intrinsics: Arc::new(BuiltinIntrinsics),
            settings,
        }
    }

    pub fn with_intrinsics(mut self, intrinsics: Arc<dyn IntrinsicEvaluator>) -> Self {
        self.intrinsics = intrinsics;
        self
    }
}

/// Lifecycle of one program (root execution, branch or Map iteration).
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramState {
    Running,
    Ended(Value),
    Stopped {
        error: Option<String>,
        cause: Option<String>,
    },
    Errored(FailureEvent),
    TimedOut,
}

impl ProgramState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProgramState::Running)
    }
}

/// State of a running program.
///
/// Child environments (Parallel branches, Map iterations) share the history
/// and services, copy the context object and hold a child cancellation token.
pub struct Environment {
    stack: Vec<Value>,
    pub context: ContextObject,
    pub history: EventHistory,
    pub cancel: CancellationToken,
    last_event_id: u64,
    pub services: Arc<Services>,
}

impl Environment {
    pub fn new(
        input: Value,
        context: ContextObject,
        history: EventHistory,
        cancel: CancellationToken,
        services: Arc<Services>,
    ) -> Self {
        Self {
            stack: vec![input],
            context,
            history,
            cancel,
            last_event_id: 0,
            services,
        }
    }

    /// Creates a child environment whose token is derived from `scope`.
    pub fn child(&self, input: Value, scope: &CancellationToken) -> Self {
        Self {
            stack: vec![input],
            context: self.context.clone(),
            history: self.history.clone(),
            cancel: scope.child_token(),
            last_event_id: self.last_event_id,
            services: Arc::clone(&self.services),
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pops the top value; an empty stack yields `null`.
    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    pub fn top(&self) -> Option<&Value> {
        self.stack.last()
    }

    /// Appends a history event caused by this environment's previous one.
    pub fn record(&mut self, event_type: HistoryEventType, details: Value) -> u64 {
        let id = self.history.append(self.last_event_id, event_type, details);
        self.last_event_id = id;
        id
    }

    pub fn last_event_id(&self) -> u64 {
        self.last_event_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The context object as a `$$` document.
    pub fn context_value(&self) -> Value {
        self.context.to_value()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::context::{ExecutionContext, StateMachineContext};
    use crate::invoke::ResourceRegistry;

    pub fn context(input: &Value) -> ContextObject {
        ContextObject::new(
            ExecutionContext {
                id: "arn:aws:states:us-east-1:000000000000:execution:test:run".to_string(),
                input: input.clone(),
                name: "run".to_string(),
                role_arn: "arn:aws:iam::000000000000:role/test".to_string(),
                start_time: "2024-01-01T00:00:00.000Z".to_string(),
            },
            StateMachineContext {
                id: "arn:aws:states:us-east-1:000000000000:stateMachine:test".to_string(),
                name: "test".to_string(),
            },
        )
    }

    pub fn services(registry: ResourceRegistry) -> Arc<Services> {
        Arc::new(Services::new(Arc::new(registry), EngineSettings::default()))
    }

    pub fn environment(input: Value, registry: ResourceRegistry) -> Environment {
        Environment::new(
            input.clone(),
            context(&input),
            EventHistory::new(),
            CancellationToken::new(),
            services(registry),
        )
    }
}
