//! State evaluation: drives a program from `StartAt` to a terminal outcome.

mod fanout;
mod io;
mod task;
mod wait;

use crate::choice::ChoiceBranch;
use crate::definition::{Definition, FailSpec, StateKind, StateNode, TextSource, Transition};
use crate::environment::{Environment, ProgramState};
use crate::failure::FailureEvent;
use crate::history::HistoryEventType;
use crate::path::type_name;
use crate::retry::{find_catcher, RetryTracker};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where control goes after a state evaluated successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flow {
    Next(String),
    End,
}

/// Why a state did not complete.
#[derive(Debug)]
pub(crate) enum Halt {
    Failed(FailureEvent),
    Stopped,
}

impl From<FailureEvent> for Halt {
    fn from(failure: FailureEvent) -> Self {
        Halt::Failed(failure)
    }
}

/// Runs `definition` to completion in `env`.
///
/// Returns the environment (for its final history position) together with the
/// program outcome. A cancelled program reports `Stopped` without error or
/// cause; the owner fills those in.
pub fn run_program(
    definition: Arc<Definition>,
    mut env: Environment,
) -> BoxFuture<'static, (Environment, ProgramState)> {
    Box::pin(async move {
        let state = drive(&definition, &mut env).await;
        (env, state)
    })
}

async fn drive(definition: &Definition, env: &mut Environment) -> ProgramState {
    let stopped = || ProgramState::Stopped {
        error: None,
        cause: None,
    };

    let mut current = definition.start_at.clone();
    loop {
        if env.is_cancelled() {
            return stopped();
        }
        let Some(node) = definition.state(&current) else {
            return ProgramState::Errored(FailureEvent::runtime(format!(
                "state '{current}' does not exist"
            )));
        };
        match eval_state(node, env).await {
            Ok(Flow::Next(next)) => current = next,
            Ok(Flow::End) => return ProgramState::Ended(env.pop()),
            Err(Halt::Failed(failure)) => return ProgramState::Errored(failure),
            Err(Halt::Stopped) => return stopped(),
        }
    }
}

/// Evaluates one state: consumes the stack top, pushes exactly one value on
/// success.
async fn eval_state(node: &StateNode, env: &mut Environment) -> Result<Flow, Halt> {
    let input = env.pop();
    let state_type = node.state_type();

    env.context.enter_state(&node.name);
    env.record(
        HistoryEventType::state_entered(state_type),
        json!({"name": node.name, "input": input}),
    );
    debug!(state = %node.name, kind = %state_type, "entered state");

    let (output, flow) = match &node.kind {
        StateKind::Pass { result } => (eval_pass(node, result.as_ref(), &input, env)?, follow(node)),
        StateKind::Choice { choices, default } => {
            eval_choice(node, choices, default.as_deref(), &input, env)?
        }
        StateKind::Wait(spec) => (wait::eval_wait(node, spec, input, env).await?, follow(node)),
        StateKind::Succeed => {
            let effective = io::effective_input(node, &input, env)?;
            (io::output(node, effective, env)?, Flow::End)
        }
        StateKind::Fail(spec) => return Err(Halt::Failed(eval_fail(spec, &input, env))),
        StateKind::Task(_) | StateKind::Parallel { .. } | StateKind::Map(_) => {
            eval_with_policies(node, input, env).await?
        }
    };

    if let Some(exited) = HistoryEventType::state_exited(state_type) {
        env.record(exited, json!({"name": node.name, "output": output}));
    }
    env.push(output);
    Ok(flow)
}

fn follow(node: &StateNode) -> Flow {
    match &node.transition {
        Some(Transition::Next(next)) => Flow::Next(next.clone()),
        Some(Transition::End) | None => Flow::End,
    }
}

fn eval_pass(
    node: &StateNode,
    result: Option<&Value>,
    input: &Value,
    env: &Environment,
) -> Result<Value, FailureEvent> {
    let effective = io::effective_input(node, input, env)?;
    let result = match result {
        Some(result) => result.clone(),
        None => io::parameters(node, effective, env)?,
    };
    let merged = io::merge_result(node.result_path.as_ref(), input.clone(), result)?;
    io::output(node, merged, env)
}

fn eval_choice(
    node: &StateNode,
    choices: &[ChoiceBranch],
    default: Option<&str>,
    input: &Value,
    env: &Environment,
) -> Result<(Value, Flow), FailureEvent> {
    let effective = io::effective_input(node, input, env)?;
    let context = env.context_value();

    let next = choices
        .iter()
        .find(|choice| choice.rule.evaluate(&effective, &context))
        .map(|choice| choice.next.as_str())
        .or(default)
        .ok_or_else(|| FailureEvent::no_choice_matched(&node.name))?;

    debug!(state = %node.name, next = %next, "choice resolved");
    Ok((io::output(node, effective, env)?, Flow::Next(next.to_string())))
}

fn eval_fail(spec: &FailSpec, input: &Value, env: &Environment) -> FailureEvent {
    let render = |source: &Option<TextSource>, field: &str| -> Result<Option<String>, FailureEvent> {
        match source {
            None => Ok(None),
            Some(TextSource::Literal(text)) => Ok(Some(text.clone())),
            Some(TextSource::Path(path)) => match io::select(path, input, env)? {
                Value::String(text) => Ok(Some(text)),
                other => Err(FailureEvent::runtime(format!(
                    "{field} '{path}' must select a string, got {}",
                    type_name(&other)
                ))),
            },
        }
    };

    let error = match render(&spec.error, "ErrorPath") {
        Ok(error) => error,
        Err(failure) => return failure,
    };
    let cause = match render(&spec.cause, "CausePath") {
        Ok(cause) => cause,
        Err(failure) => return failure,
    };
    // An unnamed Fail state still needs an error name to match against.
    FailureEvent::new(error.unwrap_or_else(|| "States.Failed".to_string()), cause)
}

/// Runs a Task, Parallel or Map state under its Retry and Catch policies.
async fn eval_with_policies(
    node: &StateNode,
    input: Value,
    env: &mut Environment,
) -> Result<(Value, Flow), Halt> {
    let prepared = io::effective_input(node, &input, env)
        .and_then(|effective| Ok((effective.clone(), io::parameters(node, effective, env)?)));

    let failure = match prepared {
        Err(failure) => failure,
        Ok((effective, parameters)) => {
            let mut tracker = RetryTracker::new(&node.retriers);
            loop {
                let attempt = match run_effect(node, &effective, &parameters, env).await {
                    Ok(raw) => io::finish(node, &input, raw, env).map_err(Halt::Failed),
                    Err(halt) => Err(halt),
                };
                let failure = match attempt {
                    Ok(output) => return Ok((output, follow(node))),
                    Err(Halt::Stopped) => return Err(Halt::Stopped),
                    Err(Halt::Failed(failure)) => failure,
                };

                let Some(retry) = tracker.next_retry(&failure) else {
                    break failure;
                };
                env.record(
                    HistoryEventType::RetryScheduled,
                    json!({
                        "name": node.name,
                        "error": failure.error,
                        "cause": failure.cause,
                        "attempt": retry.attempt,
                        "delaySeconds": retry.delay.as_secs_f64(),
                    }),
                );
                debug!(
                    state = %node.name,
                    error = %failure.error,
                    attempt = retry.attempt,
                    delay_ms = retry.delay.as_millis() as u64,
                    "retrying state"
                );
                if !sleep_or_cancel(retry.delay, &env.cancel).await {
                    return Err(Halt::Stopped);
                }
                env.context.set_retry_count(tracker.retry_count());
            }
        }
    };

    match find_catcher(&node.catchers, &failure) {
        Some(catcher) => {
            debug!(state = %node.name, error = %failure.error, next = %catcher.next, "caught failure");
            let output =
                io::merge_result(catcher.result_path.as_ref(), input, failure.to_document())?;
            Ok((output, Flow::Next(catcher.next.clone())))
        }
        None => Err(Halt::Failed(failure)),
    }
}

async fn run_effect(
    node: &StateNode,
    effective: &Value,
    parameters: &Value,
    env: &mut Environment,
) -> Result<Value, Halt> {
    match &node.kind {
        StateKind::Task(spec) => task::invoke(node, spec, effective, parameters.clone(), env).await,
        StateKind::Parallel { branches } => fanout::parallel(node, branches, parameters, env).await,
        StateKind::Map(spec) => fanout::map(node, spec, parameters, env).await,
        _ => Ok(parameters.clone()),
    }
}

/// Sleeps for `duration`; returns false if `cancel` fired first.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
