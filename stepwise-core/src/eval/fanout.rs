//! Parallel branches and Map iterations.

use super::{io, run_program, Halt};
use crate::definition::{Definition, MapSpec, StateNode};
use crate::environment::{Environment, ProgramState};
use crate::failure::{names, FailureEvent};
use crate::history::HistoryEventType;
use crate::path::type_name;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

enum ChildOutcome {
    Ended(Value),
    Failed(FailureEvent),
    Stopped,
}

impl From<ProgramState> for ChildOutcome {
    fn from(state: ProgramState) -> Self {
        match state {
            ProgramState::Ended(output) => ChildOutcome::Ended(output),
            ProgramState::Errored(failure) => ChildOutcome::Failed(failure),
            _ => ChildOutcome::Stopped,
        }
    }
}

/// Joins every child. The first failure cancels the siblings through `scope`.
async fn join_children(
    set: &mut JoinSet<(usize, ChildOutcome)>,
    scope: &CancellationToken,
    count: usize,
) -> Result<Vec<Value>, Halt> {
    let mut outputs = vec![Value::Null; count];
    let mut failure: Option<FailureEvent> = None;
    let mut stopped = false;

    while let Some(joined) = set.join_next().await {
        let outcome = match joined {
            Ok((index, ChildOutcome::Ended(output))) => {
                outputs[index] = output;
                continue;
            }
            Ok((_, ChildOutcome::Failed(err))) => err,
            Ok((_, ChildOutcome::Stopped)) => {
                stopped = true;
                continue;
            }
            Err(err) => FailureEvent::with_cause(names::BRANCH_FAILED, err.to_string()),
        };
        if failure.is_none() {
            scope.cancel();
            failure = Some(outcome);
        }
    }

    match failure {
        Some(failure) => Err(Halt::Failed(failure)),
        None if stopped => Err(Halt::Stopped),
        None => Ok(outputs),
    }
}

pub(super) async fn parallel(
    node: &StateNode,
    branches: &[Arc<Definition>],
    input: &Value,
    env: &mut Environment,
) -> Result<Value, Halt> {
    env.record(
        HistoryEventType::ParallelStateStarted,
        json!({"name": node.name, "branches": branches.len()}),
    );

    let scope = env.cancel.child_token();
    let mut set = JoinSet::new();
    for (index, branch) in branches.iter().enumerate() {
        let child = env.child(input.clone(), &scope);
        let branch = Arc::clone(branch);
        set.spawn(async move {
            let (_, state) = run_program(branch, child).await;
            (index, ChildOutcome::from(state))
        });
    }

    let result = join_children(&mut set, &scope, branches.len()).await;
    match &result {
        Ok(_) => {
            env.record(
                HistoryEventType::ParallelStateSucceeded,
                json!({"name": node.name}),
            );
        }
        Err(Halt::Failed(failure)) => {
            env.record(
                HistoryEventType::ParallelStateFailed,
                json!({"name": node.name, "error": failure.error, "cause": failure.cause}),
            );
        }
        Err(Halt::Stopped) => {
            env.record(
                HistoryEventType::ParallelStateAborted,
                json!({"name": node.name}),
            );
        }
    }
    result.map(Value::Array)
}

pub(super) async fn map(
    node: &StateNode,
    spec: &MapSpec,
    input: &Value,
    env: &mut Environment,
) -> Result<Value, Halt> {
    let items = match io::select(&spec.items_path, input, env)? {
        Value::Array(items) => items,
        other => {
            return Err(FailureEvent::runtime(format!(
                "ItemsPath '{}' must select an array, got {}",
                spec.items_path,
                type_name(&other)
            ))
            .into())
        }
    };

    let mut item_inputs = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let item_input = match &spec.item_selector {
            Some(selector) => {
                let mut context = env.context.clone();
                context.set_map_item(index, item.clone());
                selector.evaluate(input, &context.to_value(), env.services.intrinsics.as_ref())?
            }
            None => item.clone(),
        };
        item_inputs.push(item_input);
    }

    env.record(
        HistoryEventType::MapStateStarted,
        json!({"name": node.name, "length": items.len()}),
    );

    let limit = concurrency_limit(spec.max_concurrency, env.services.settings.max_concurrency);
    debug!(state = %node.name, items = items.len(), limit = ?limit, "starting map");
    let semaphore = limit.map(|n| Arc::new(Semaphore::new(n)));
    let scope = env.cancel.child_token();
    let count = items.len();

    let mut set = JoinSet::new();
    for (index, (item, item_input)) in items.into_iter().zip(item_inputs).enumerate() {
        let mut child = env.child(item_input, &scope);
        child.context.set_map_item(index, item);
        set.spawn(run_iteration(
            index,
            node.name.clone(),
            Arc::clone(&spec.processor),
            child,
            semaphore.clone(),
        ));
    }

    let result = join_children(&mut set, &scope, count).await;
    match &result {
        Ok(_) => {
            env.record(HistoryEventType::MapStateSucceeded, json!({"name": node.name}));
        }
        Err(Halt::Failed(failure)) => {
            env.record(
                HistoryEventType::MapStateFailed,
                json!({"name": node.name, "error": failure.error, "cause": failure.cause}),
            );
        }
        Err(Halt::Stopped) => {
            env.record(HistoryEventType::MapStateAborted, json!({"name": node.name}));
        }
    }
    result.map(Value::Array)
}

async fn run_iteration(
    index: usize,
    name: String,
    processor: Arc<Definition>,
    mut child: Environment,
    semaphore: Option<Arc<Semaphore>>,
) -> (usize, ChildOutcome) {
    let _permit = match semaphore {
        Some(semaphore) => {
            let cancel = child.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return (index, ChildOutcome::Stopped),
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return (index, ChildOutcome::Stopped),
                },
            }
        }
        None => None,
    };

    child.record(
        HistoryEventType::MapIterationStarted,
        json!({"name": name, "index": index}),
    );
    let (mut child, state) = run_program(processor, child).await;
    let outcome = ChildOutcome::from(state);
    match &outcome {
        ChildOutcome::Ended(output) => {
            child.record(
                HistoryEventType::MapIterationSucceeded,
                json!({"name": name, "index": index, "output": output}),
            );
        }
        ChildOutcome::Failed(failure) => {
            child.record(
                HistoryEventType::MapIterationFailed,
                json!({"name": name, "index": index, "error": failure.error, "cause": failure.cause}),
            );
        }
        ChildOutcome::Stopped => {
            child.record(
                HistoryEventType::MapIterationAborted,
                json!({"name": name, "index": index}),
            );
        }
    }
    (index, outcome)
}

/// Effective Map concurrency: `0` in the definition means unbounded, and the
/// engine-wide cap applies on top.
fn concurrency_limit(declared: u32, engine_cap: Option<usize>) -> Option<usize> {
    let declared = (declared > 0).then_some(declared as usize);
    match (declared, engine_cap) {
        (Some(d), Some(cap)) => Some(d.min(cap)),
        (Some(d), None) => Some(d),
        (None, cap) => cap,
    }
    .map(|n| n.max(1))
}

#[cfg(test)]
mod tests {
    use super::concurrency_limit;

    #[test]
    fn test_concurrency_limit() {
        assert_eq!(concurrency_limit(0, None), None);
        assert_eq!(concurrency_limit(0, Some(8)), Some(8));
        assert_eq!(concurrency_limit(2, None), Some(2));
        assert_eq!(concurrency_limit(16, Some(4)), Some(4));
        assert_eq!(concurrency_limit(3, Some(0)), Some(1));
    }
}
