//! Input/output processing shared by all state kinds.
//!
//! Order: `InputPath` -> `Parameters` -> effect -> `ResultSelector` ->
//! `ResultPath` -> `OutputPath`.

use crate::definition::StateNode;
use crate::environment::Environment;
use crate::failure::FailureEvent;
use crate::path::JsonPath;
use serde_json::{json, Value};

/// Selects `path` from `input`, or from the context object for `$$` paths.
pub(crate) fn select(path: &JsonPath, input: &Value, env: &Environment) -> Result<Value, FailureEvent> {
    let selected = if path.is_context() {
        path.select(&env.context_value())
    } else {
        path.select(input)
    };
    selected.map_err(FailureEvent::runtime)
}

/// Applies `InputPath` to the raw state input.
pub(crate) fn effective_input(
    node: &StateNode,
    input: &Value,
    env: &Environment,
) -> Result<Value, FailureEvent> {
    match &node.input_path {
        None => Ok(json!({})),
        Some(path) if path.is_root() => Ok(input.clone()),
        Some(path) => select(path, input, env),
    }
}

/// Applies `Parameters` to the effective input.
pub(crate) fn parameters(
    node: &StateNode,
    effective: Value,
    env: &Environment,
) -> Result<Value, FailureEvent> {
    match &node.parameters {
        None => Ok(effective),
        Some(template) => template.evaluate(
            &effective,
            &env.context_value(),
            env.services.intrinsics.as_ref(),
        ),
    }
}

/// Merges `result` into the original input at `result_path`.
pub(crate) fn merge_result(
    result_path: Option<&JsonPath>,
    input: Value,
    result: Value,
) -> Result<Value, FailureEvent> {
    match result_path {
        None => Ok(input),
        Some(path) => path.assign(input, result).map_err(FailureEvent::runtime),
    }
}

/// Applies `OutputPath`.
pub(crate) fn output(node: &StateNode, value: Value, env: &Environment) -> Result<Value, FailureEvent> {
    match &node.output_path {
        None => Ok(json!({})),
        Some(path) if path.is_root() => Ok(value),
        Some(path) => select(path, &value, env),
    }
}

/// Runs `ResultSelector`, `ResultPath` and `OutputPath` over a raw result.
pub(crate) fn finish(
    node: &StateNode,
    input: &Value,
    raw: Value,
    env: &Environment,
) -> Result<Value, FailureEvent> {
    let selected = match &node.result_selector {
        None => raw,
        Some(template) => {
            template.evaluate(&raw, &env.context_value(), env.services.intrinsics.as_ref())?
        }
    };
    let merged = merge_result(node.result_path.as_ref(), input.clone(), selected)?;
    output(node, merged, env)
}
