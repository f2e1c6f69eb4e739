//! Emulated resources available to local runs.
//!
//! | Resource        | Behavior |
//! |-----------------|----------|
//! | `builtin:echo`  | Returns its parameters |
//! | `builtin:fail`  | Fails with `Error`/`Cause` from its parameters |
//! | `builtin:sleep` | Sleeps `Seconds`, heartbeating once a second, then returns `Result` (or its parameters) |

use serde_json::Value;
use std::time::Duration;
use stepwise_core::failure::names;
use stepwise_core::{FailureEvent, InvocationContext, ResourceRegistry};

pub const ECHO: &str = "builtin:echo";
pub const FAIL: &str = "builtin:fail";
pub const SLEEP: &str = "builtin:sleep";

const HEARTBEAT_EVERY: Duration = Duration::from_secs(1);

/// Registers every built-in resource on `registry`.
pub fn register_builtins(registry: &ResourceRegistry) {
    registry.register_fn(ECHO, |parameters, _ctx| async move {
        Ok::<_, FailureEvent>(parameters)
    });
    registry.register_fn(FAIL, |parameters, _ctx| async move {
        Err::<Value, _>(fail(&parameters))
    });
    registry.register_fn(SLEEP, sleep);
}

/// A registry holding only the built-in resources.
pub fn builtin_registry() -> ResourceRegistry {
    let registry = ResourceRegistry::new();
    register_builtins(&registry);
    registry
}

fn fail(parameters: &Value) -> FailureEvent {
    let error = parameters
        .get("Error")
        .and_then(Value::as_str)
        .unwrap_or(names::TASK_FAILED);
    let cause = parameters
        .get("Cause")
        .and_then(Value::as_str)
        .map(str::to_string);
    FailureEvent::new(error, cause)
}

async fn sleep(parameters: Value, ctx: InvocationContext) -> Result<Value, FailureEvent> {
    let seconds = match parameters.get("Seconds") {
        None => 0.0,
        Some(value) => value
            .as_f64()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .ok_or_else(|| {
                FailureEvent::task_failed(format!(
                    "builtin:sleep Seconds must be a non-negative number, got {value}"
                ))
            })?,
    };

    let deadline = Duration::try_from_secs_f64(seconds)
        .ok()
        .and_then(|duration| tokio::time::Instant::now().checked_add(duration))
        .ok_or_else(|| {
            FailureEvent::task_failed(format!("builtin:sleep Seconds {seconds} is out of range"))
        })?;
    loop {
        ctx.heartbeat();
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let step = (deadline - now).min(HEARTBEAT_EVERY);
        tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                return Err(FailureEvent::task_failed("builtin:sleep cancelled"));
            }
            _ = tokio::time::sleep(step) => {}
        }
    }

    Ok(parameters.get("Result").cloned().unwrap_or(parameters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_core::ResourceInvoker;

    #[tokio::test]
    async fn test_echo() {
        let registry = builtin_registry();
        let output = registry
            .invoke(ECHO, json!({"a": [1, 2]}), InvocationContext::detached("T"))
            .await
            .unwrap();
        assert_eq!(output, json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn test_fail() {
        let registry = builtin_registry();
        let err = registry
            .invoke(FAIL, json!({"Error": "Custom", "Cause": "because"}), InvocationContext::detached("T"))
            .await
            .unwrap_err();
        assert_eq!(err, FailureEvent::with_cause("Custom", "because"));

        let err = registry
            .invoke(FAIL, json!({}), InvocationContext::detached("T"))
            .await
            .unwrap_err();
        assert_eq!(err.error, names::TASK_FAILED);
        assert!(err.cause.is_none());
    }

    #[tokio::test]
    async fn test_sleep_returns_result() {
        let registry = builtin_registry();
        let output = registry
            .invoke(SLEEP, json!({"Seconds": 0.01, "Result": "done"}), InvocationContext::detached("T"))
            .await
            .unwrap();
        assert_eq!(output, json!("done"));
    }

    #[tokio::test]
    async fn test_sleep_rejects_bad_seconds() {
        let err = sleep(json!({"Seconds": "soon"}), InvocationContext::detached("T"))
            .await
            .unwrap_err();
        assert_eq!(err.error, names::TASK_FAILED);
    }

    #[tokio::test]
    async fn test_sleep_rejects_out_of_range_seconds() {
        let err = sleep(json!({"Seconds": 1e20}), InvocationContext::detached("T"))
            .await
            .unwrap_err();
        assert_eq!(err.error, names::TASK_FAILED);
        assert!(err.cause.unwrap().contains("out of range"));
    }

    #[tokio::test]
    async fn test_sleep_observes_cancellation() {
        let ctx = InvocationContext::detached("T");
        let token = ctx.cancellation().clone();
        let handle = tokio::spawn(sleep(json!({"Seconds": 60}), ctx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_contents() {
        assert_eq!(builtin_registry().resources(), vec![ECHO, FAIL, SLEEP]);
    }
}
