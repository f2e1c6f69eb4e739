//! Resource invocation: how Task states reach the outside world.

use crate::failure::FailureEvent;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Handle given to a resource for the duration of one invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    state_name: String,
    heartbeat: Arc<Notify>,
    cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(state_name: impl Into<String>, heartbeat: Arc<Notify>, cancel: CancellationToken) -> Self {
        Self {
            state_name: state_name.into(),
            heartbeat,
            cancel,
        }
    }

    /// Creates a context nobody listens to; useful outside an execution.
    pub fn detached(state_name: impl Into<String>) -> Self {
        Self::new(state_name, Arc::new(Notify::new()), CancellationToken::new())
    }

    /// Name of the Task state being executed.
    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    /// Signals liveness to the heartbeat watchdog.
    pub fn heartbeat(&self) {
        self.heartbeat.notify_one();
    }

    /// Token cancelled when the invocation is no longer wanted.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Executes the action behind a Task's `Resource`.
#[async_trait]
pub trait ResourceInvoker: Send + Sync {
    async fn invoke(
        &self,
        resource: &str,
        parameters: Value,
        ctx: InvocationContext,
    ) -> Result<Value, FailureEvent>;
}

/// A single registered resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn handle(&self, parameters: Value, ctx: InvocationContext) -> Result<Value, FailureEvent>;
}

type HandlerFn =
    dyn Fn(Value, InvocationContext) -> BoxFuture<'static, Result<Value, FailureEvent>> + Send + Sync;

struct FnHandler {
    f: Box<HandlerFn>,
}

#[async_trait]
impl ResourceHandler for FnHandler {
    async fn handle(&self, parameters: Value, ctx: InvocationContext) -> Result<Value, FailureEvent> {
        (self.f)(parameters, ctx).await
    }
}

/// Wraps an async closure as a [`ResourceHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ResourceHandler>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FailureEvent>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |params, ctx| Box::pin(f(params, ctx))),
    })
}

/// Dispatches invocations to handlers registered by resource string.
#[derive(Default)]
pub struct ResourceRegistry {
    handlers: DashMap<String, Arc<dyn ResourceHandler>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for `resource`.
    pub fn register(&self, resource: impl Into<String>, handler: Arc<dyn ResourceHandler>) {
        self.handlers.insert(resource.into(), handler);
    }

    /// Registers an async closure.
    pub fn register_fn<F, Fut>(&self, resource: impl Into<String>, f: F)
    where
        F: Fn(Value, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FailureEvent>> + Send + 'static,
    {
        self.register(resource, handler_fn(f));
    }

    pub fn unregister(&self, resource: &str) -> bool {
        self.handlers.remove(resource).is_some()
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.handlers.contains_key(resource)
    }

    /// Registered resource strings, sorted.
    pub fn resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        resources.sort();
        resources
    }
}

#[async_trait]
impl ResourceInvoker for ResourceRegistry {
    async fn invoke(
        &self,
        resource: &str,
        parameters: Value,
        ctx: InvocationContext,
    ) -> Result<Value, FailureEvent> {
        // Clone out of the map so no shard lock is held across the await.
        let handler = self
            .handlers
            .get(resource)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| FailureEvent::task_failed(format!("unknown resource '{resource}'")))?;
        handler.handle(parameters, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::names;
    use serde_json::json;

    #[tokio::test]
    async fn test_dispatch_by_resource() {
        let registry = ResourceRegistry::new();
        registry.register_fn("math:double", |params, _ctx| async move {
            let n = params["n"].as_i64().unwrap_or(0);
            Ok(json!({"n": n * 2}))
        });

        let out = registry
            .invoke("math:double", json!({"n": 21}), InvocationContext::detached("T"))
            .await
            .unwrap();
        assert_eq!(out, json!({"n": 42}));
        assert_eq!(registry.resources(), vec!["math:double".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_resource_is_task_failure() {
        let registry = ResourceRegistry::new();
        let err = registry
            .invoke("nope", json!({}), InvocationContext::detached("T"))
            .await
            .unwrap_err();
        assert_eq!(err.error, names::TASK_FAILED);
        assert!(err.cause.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_handler_failure_passes_through() {
        let registry = ResourceRegistry::new();
        registry.register_fn("boom", |_params, _ctx| async move {
            Err(FailureEvent::with_cause("Custom.Error", "exploded"))
        });

        let err = registry
            .invoke("boom", Value::Null, InvocationContext::detached("T"))
            .await
            .unwrap_err();
        assert_eq!(err.error, "Custom.Error");

        assert!(registry.unregister("boom"));
        assert!(!registry.contains("boom"));
    }

    #[tokio::test]
    async fn test_context_accessors() {
        let ctx = InvocationContext::detached("Charge");
        assert_eq!(ctx.state_name(), "Charge");
        ctx.heartbeat();
        assert!(!ctx.is_cancelled());
        ctx.cancellation().cancel();
        assert!(ctx.is_cancelled());
    }
}
