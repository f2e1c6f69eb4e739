//! Task invocation with timeout, heartbeat and cancellation envelope.

use super::{io, Halt};
use crate::definition::{SecondsSource, StateNode, TaskSpec};
use crate::environment::Environment;
use crate::failure::FailureEvent;
use crate::history::HistoryEventType;
use crate::invoke::InvocationContext;
use crate::path::type_name;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

pub(super) async fn invoke(
    node: &StateNode,
    spec: &TaskSpec,
    effective: &Value,
    parameters: Value,
    env: &mut Environment,
) -> Result<Value, Halt> {
    let timeout = match &spec.timeout {
        Some(source) => Some(resolve_seconds("TimeoutSecondsPath", source, effective, env)?),
        None => env.services.settings.default_task_timeout,
    };
    let heartbeat = match &spec.heartbeat {
        Some(source) => Some(resolve_seconds("HeartbeatSecondsPath", source, effective, env)?),
        None => None,
    };

    env.record(
        HistoryEventType::TaskScheduled,
        json!({
            "resource": spec.resource,
            "parameters": parameters,
            "timeoutInSeconds": timeout.map(|d| d.as_secs()),
            "heartbeatInSeconds": heartbeat.map(|d| d.as_secs()),
        }),
    );
    env.record(
        HistoryEventType::TaskStarted,
        json!({"resource": spec.resource}),
    );
    debug!(state = %node.name, resource = %spec.resource, "invoking resource");

    let beats = Arc::new(Notify::new());
    let invocation = env.cancel.child_token();
    let ctx = InvocationContext::new(node.name.clone(), Arc::clone(&beats), invocation.clone());
    let services = Arc::clone(&env.services);

    let outcome = tokio::select! {
        biased;
        _ = env.cancel.cancelled() => Err(Halt::Stopped),
        result = services.invoker.invoke(&spec.resource, parameters, ctx) => {
            result.map_err(Halt::Failed)
        }
        _ = sleep_for(timeout) => Err(Halt::Failed(FailureEvent::timeout())),
        _ = watchdog(beats, heartbeat) => Err(Halt::Failed(FailureEvent::heartbeat_timeout())),
    };
    invocation.cancel();

    match &outcome {
        Ok(output) => {
            env.record(
                HistoryEventType::TaskSucceeded,
                json!({"resource": spec.resource, "output": output}),
            );
        }
        Err(Halt::Failed(failure)) => {
            let event_type = if failure.is_timeout() {
                HistoryEventType::TaskTimedOut
            } else {
                HistoryEventType::TaskFailed
            };
            env.record(
                event_type,
                json!({"resource": spec.resource, "error": failure.error, "cause": failure.cause}),
            );
        }
        Err(Halt::Stopped) => {
            env.record(
                HistoryEventType::TaskStateAborted,
                json!({"name": node.name, "resource": spec.resource}),
            );
        }
    }
    outcome
}

fn resolve_seconds(
    field: &str,
    source: &SecondsSource,
    effective: &Value,
    env: &Environment,
) -> Result<Duration, FailureEvent> {
    match source {
        SecondsSource::Literal(secs) => Ok(Duration::from_secs(*secs)),
        SecondsSource::Path(path) => {
            let value = io::select(path, effective, env)?;
            match value.as_u64() {
                Some(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
                _ => Err(FailureEvent::runtime(format!(
                    "{field} '{path}' must select a positive integer, got {}",
                    type_name(&value)
                ))),
            }
        }
    }
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Completes once no heartbeat arrived within `interval`.
async fn watchdog(beats: Arc<Notify>, interval: Option<Duration>) {
    let Some(interval) = interval else {
        return std::future::pending().await;
    };
    while tokio::time::timeout(interval, beats.notified()).await.is_ok() {}
}
