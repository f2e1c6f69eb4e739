//! Workflow definition types and compiler.
//!
//! Definitions use the states-language JSON document:
//!
//! ```json
//! {
//!   "StartAt": "Charge",
//!   "States": {
//!     "Charge": {
//!       "Type": "Task",
//!       "Resource": "billing:charge",
//!       "Retry": [{"ErrorEquals": ["States.TaskFailed"], "MaxAttempts": 2}],
//!       "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "Refund"}],
//!       "Next": "Done"
//!     },
//!     "Refund": {"Type": "Fail", "Error": "PaymentFailed"},
//!     "Done": {"Type": "Succeed"}
//!   }
//! }
//! ```
//!
//! [`Definition::compile`] validates the whole document up front; a compiled
//! definition is immutable and shared between executions.

use crate::choice::ChoiceBranch;
use crate::error::CoreError;
use crate::path::JsonPath;
use crate::payload::PayloadTemplate;
use crate::retry::{compile_catchers, compile_retriers, Catcher, CatcherRaw, Retrier, RetrierRaw};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Deserializes a field that distinguishes an explicit `null` from absence.
///
/// Use together with `#[serde(default)]`: absent is `None`, `null` is
/// `Some(None)`.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// The kind of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    Pass,
    Task,
    Choice,
    Wait,
    Succeed,
    Fail,
    Parallel,
    Map,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Pass => "Pass",
            StateType::Task => "Task",
            StateType::Choice => "Choice",
            StateType::Wait => "Wait",
            StateType::Succeed => "Succeed",
            StateType::Fail => "Fail",
            StateType::Parallel => "Parallel",
            StateType::Map => "Map",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Pass" => StateType::Pass,
            "Task" => StateType::Task,
            "Choice" => StateType::Choice,
            "Wait" => StateType::Wait,
            "Succeed" => StateType::Succeed,
            "Fail" => StateType::Fail,
            "Parallel" => StateType::Parallel,
            "Map" => StateType::Map,
            _ => return None,
        })
    }

    /// Fields a state of this kind may carry besides `Type` and `Comment`.
    fn allowed_fields(&self) -> &'static [&'static str] {
        match self {
            StateType::Pass => &[
                "Next", "End", "InputPath", "Parameters", "Result", "ResultPath", "OutputPath",
            ],
            StateType::Task => &[
                "Next",
                "End",
                "InputPath",
                "Parameters",
                "ResultSelector",
                "ResultPath",
                "OutputPath",
                "Resource",
                "TimeoutSeconds",
                "TimeoutSecondsPath",
                "HeartbeatSeconds",
                "HeartbeatSecondsPath",
                "Retry",
                "Catch",
            ],
            StateType::Choice => &["InputPath", "OutputPath", "Choices", "Default"],
            StateType::Wait => &[
                "Next",
                "End",
                "InputPath",
                "OutputPath",
                "Seconds",
                "SecondsPath",
                "Timestamp",
                "TimestampPath",
            ],
            StateType::Succeed => &["InputPath", "OutputPath"],
            StateType::Fail => &["Error", "ErrorPath", "Cause", "CausePath"],
            StateType::Parallel => &[
                "Next",
                "End",
                "InputPath",
                "Parameters",
                "ResultSelector",
                "ResultPath",
                "OutputPath",
                "Branches",
                "Retry",
                "Catch",
            ],
            StateType::Map => &[
                "Next",
                "End",
                "InputPath",
                "Parameters",
                "ResultSelector",
                "ResultPath",
                "OutputPath",
                "ItemProcessor",
                "Iterator",
                "ItemsPath",
                "ItemSelector",
                "MaxConcurrency",
                "Retry",
                "Catch",
            ],
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw top-level definition document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DefinitionRaw {
    pub start_at: String,
    pub states: Map<String, Value>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Raw state as written in the document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateRaw {
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    end: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    input_path: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    output_path: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    result_path: Option<Option<String>>,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    result_selector: Option<Value>,
    #[serde(default, deserialize_with = "nullable")]
    result: Option<Option<Value>>,
    #[serde(default)]
    retry: Vec<RetrierRaw>,
    #[serde(default)]
    catch: Vec<CatcherRaw>,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    timeout_seconds_path: Option<String>,
    #[serde(default)]
    heartbeat_seconds: Option<u64>,
    #[serde(default)]
    heartbeat_seconds_path: Option<String>,
    #[serde(default)]
    choices: Option<Vec<Value>>,
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    seconds: Option<u64>,
    #[serde(default)]
    seconds_path: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    timestamp_path: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_path: Option<String>,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    cause_path: Option<String>,
    #[serde(default)]
    branches: Option<Vec<Value>>,
    #[serde(default)]
    item_processor: Option<Value>,
    #[serde(default)]
    iterator: Option<Value>,
    #[serde(default)]
    items_path: Option<String>,
    #[serde(default)]
    item_selector: Option<Value>,
    #[serde(default)]
    max_concurrency: Option<u32>,
}

/// Where control goes after a state completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(String),
    End,
}

/// A duration given literally or through a reference path.
#[derive(Debug, Clone)]
pub enum SecondsSource {
    Literal(u64),
    Path(JsonPath),
}

/// A string given literally or through a reference path.
#[derive(Debug, Clone)]
pub enum TextSource {
    Literal(String),
    Path(JsonPath),
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub resource: String,
    pub timeout: Option<SecondsSource>,
    pub heartbeat: Option<SecondsSource>,
}

#[derive(Debug, Clone)]
pub enum WaitSpec {
    Seconds(u64),
    SecondsPath(JsonPath),
    Timestamp(DateTime<FixedOffset>),
    TimestampPath(JsonPath),
}

#[derive(Debug, Clone)]
pub struct FailSpec {
    pub error: Option<TextSource>,
    pub cause: Option<TextSource>,
}

#[derive(Debug, Clone)]
pub struct MapSpec {
    pub processor: Arc<Definition>,
    pub items_path: JsonPath,
    pub item_selector: Option<PayloadTemplate>,
    /// `0` means unbounded.
    pub max_concurrency: u32,
}

/// Kind-specific part of a state.
#[derive(Debug, Clone)]
pub enum StateKind {
    Pass { result: Option<Value> },
    Task(TaskSpec),
    Choice {
        choices: Vec<ChoiceBranch>,
        default: Option<String>,
    },
    Wait(WaitSpec),
    Succeed,
    Fail(FailSpec),
    Parallel { branches: Vec<Arc<Definition>> },
    Map(MapSpec),
}

impl StateKind {
    pub fn state_type(&self) -> StateType {
        match self {
            StateKind::Pass { .. } => StateType::Pass,
            StateKind::Task(_) => StateType::Task,
            StateKind::Choice { .. } => StateType::Choice,
            StateKind::Wait(_) => StateType::Wait,
            StateKind::Succeed => StateType::Succeed,
            StateKind::Fail(_) => StateType::Fail,
            StateKind::Parallel { .. } => StateType::Parallel,
            StateKind::Map(_) => StateType::Map,
        }
    }
}

/// A compiled state.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub name: String,
    pub comment: Option<String>,
    pub kind: StateKind,
    /// `None` for an explicit `null`: the effective input is `{}`.
    pub input_path: Option<JsonPath>,
    /// `None` for an explicit `null`: the output is `{}`.
    pub output_path: Option<JsonPath>,
    /// `None` for an explicit `null`: the result is discarded.
    pub result_path: Option<JsonPath>,
    pub parameters: Option<PayloadTemplate>,
    pub result_selector: Option<PayloadTemplate>,
    /// `None` for Choice, Succeed and Fail.
    pub transition: Option<Transition>,
    pub retriers: Vec<Retrier>,
    pub catchers: Vec<Catcher>,
}

impl StateNode {
    pub fn state_type(&self) -> StateType {
        self.kind.state_type()
    }

    /// All state names this node can transition to.
    fn targets(&self) -> Vec<&str> {
        let mut targets = Vec::new();
        if let Some(Transition::Next(next)) = &self.transition {
            targets.push(next.as_str());
        }
        if let StateKind::Choice { choices, default } = &self.kind {
            targets.extend(choices.iter().map(|c| c.next.as_str()));
            targets.extend(default.as_deref());
        }
        targets.extend(self.catchers.iter().map(|c| c.next.as_str()));
        targets
    }
}

/// Validated and indexed workflow definition.
#[derive(Debug, Clone)]
pub struct Definition {
    pub start_at: String,
    pub states: HashMap<String, StateNode>,
    /// Machine-level timeout.
    pub timeout_seconds: Option<u64>,
    pub comment: Option<String>,
    /// CRC32C of the canonical JSON document.
    pub checksum: String,
    /// Original document.
    pub raw: Value,
}

impl Definition {
    /// Parses and validates a definition from JSON text.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_str(text)?;
        Self::compile(&value)
    }

    /// Validates and compiles a definition document.
    pub fn compile(value: &Value) -> Result<Self, CoreError> {
        let raw: DefinitionRaw = serde_json::from_value(value.clone())?;

        if raw.states.is_empty() {
            return Err(CoreError::definition(&raw.start_at, "States must not be empty"));
        }
        if raw.timeout_seconds == Some(0) {
            return Err(CoreError::definition(
                &raw.start_at,
                "TimeoutSeconds must be positive",
            ));
        }

        let mut states = HashMap::with_capacity(raw.states.len());
        for (name, state) in &raw.states {
            let node = compile_state(name, state)?;
            states.insert(name.clone(), node);
        }

        if !states.contains_key(&raw.start_at) {
            return Err(CoreError::definition(
                &raw.start_at,
                format!("StartAt '{}' is not a state", raw.start_at),
            ));
        }

        for node in states.values() {
            for target in node.targets() {
                if !states.contains_key(target) {
                    return Err(CoreError::definition(
                        &node.name,
                        format!("transition target '{target}' is not a state"),
                    ));
                }
            }
        }

        let bytes = serde_json::to_vec(value)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&bytes));

        Ok(Self {
            start_at: raw.start_at,
            states,
            timeout_seconds: raw.timeout_seconds,
            comment: raw.comment,
            checksum,
            raw: value.clone(),
        })
    }

    /// Gets a state by name.
    pub fn state(&self, name: &str) -> Option<&StateNode> {
        self.states.get(name)
    }

    /// Returns state names, sorted.
    pub fn state_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.states.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn compile_nested(owner: &str, value: &Value) -> Result<Arc<Definition>, CoreError> {
    Definition::compile(value)
        .map(Arc::new)
        .map_err(|err| match err {
            CoreError::InvalidDefinition { state, reason } => {
                CoreError::definition(format!("{owner} > {state}"), reason)
            }
            other => other.at_state(owner),
        })
}

fn compile_state(name: &str, value: &Value) -> Result<StateNode, CoreError> {
    let fields = value
        .as_object()
        .ok_or_else(|| CoreError::definition(name, "state must be an object"))?;

    let type_name = fields
        .get("Type")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::definition(name, "missing string field 'Type'"))?;
    let state_type = StateType::parse(type_name)
        .ok_or_else(|| CoreError::definition(name, format!("unknown state type '{type_name}'")))?;

    let allowed = state_type.allowed_fields();
    for key in fields.keys() {
        if key != "Type" && key != "Comment" && !allowed.contains(&key.as_str()) {
            return Err(CoreError::definition(
                name,
                format!("field '{key}' is not allowed in a {state_type} state"),
            ));
        }
    }

    let raw: StateRaw =
        serde_json::from_value(value.clone()).map_err(|e| CoreError::from(e).at_state(name))?;
    let fail = |reason: String| CoreError::definition(name, reason);

    let input_path = compile_selection(raw.input_path.clone()).map_err(|e| e.at_state(name))?;
    let output_path = compile_selection(raw.output_path.clone()).map_err(|e| e.at_state(name))?;
    let result_path = match &raw.result_path {
        None => Some(JsonPath::root()),
        Some(None) => None,
        Some(Some(path)) => Some(JsonPath::parse_reference(path).map_err(|e| e.at_state(name))?),
    };

    let transition = match state_type {
        StateType::Choice | StateType::Succeed | StateType::Fail => None,
        _ => Some(match (&raw.next, raw.end) {
            (Some(_), Some(true)) => {
                return Err(fail("cannot have both 'Next' and 'End'".to_string()))
            }
            (Some(next), _) => Transition::Next(next.clone()),
            (None, Some(true)) => Transition::End,
            (None, _) => return Err(fail("must have 'Next' or 'End: true'".to_string())),
        }),
    };

    let retriers = compile_retriers(raw.retry.clone()).map_err(|r| fail(format!("Retry: {r}")))?;
    let catchers = compile_catchers(raw.catch.clone()).map_err(|r| fail(format!("Catch: {r}")))?;

    let mut parameters = compile_template(raw.parameters.as_ref()).map_err(|e| e.at_state(name))?;
    let result_selector =
        compile_template(raw.result_selector.as_ref()).map_err(|e| e.at_state(name))?;

    let kind = match state_type {
        StateType::Pass => StateKind::Pass {
            result: raw.result.clone().map(|r| r.unwrap_or(Value::Null)),
        },
        StateType::Task => StateKind::Task(compile_task(&raw).map_err(fail)?),
        StateType::Choice => {
            let rules = raw
                .choices
                .as_ref()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| fail("Choices must be a non-empty array".to_string()))?;
            let choices = rules
                .iter()
                .map(ChoiceBranch::parse)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.at_state(name))?;
            StateKind::Choice {
                choices,
                default: raw.default.clone(),
            }
        }
        StateType::Wait => StateKind::Wait(compile_wait(&raw).map_err(|e| e.at_state(name))?),
        StateType::Succeed => StateKind::Succeed,
        StateType::Fail => StateKind::Fail(compile_fail(&raw).map_err(|e| e.at_state(name))?),
        StateType::Parallel => {
            let branches = raw
                .branches
                .as_ref()
                .filter(|b| !b.is_empty())
                .ok_or_else(|| fail("Branches must be a non-empty array".to_string()))?;
            let branches = branches
                .iter()
                .map(|b| compile_nested(name, b))
                .collect::<Result<Vec<_>, _>>()?;
            StateKind::Parallel { branches }
        }
        StateType::Map => {
            // Legacy maps use Parameters where newer ones use ItemSelector.
            let item_selector = match (&raw.item_selector, parameters.take()) {
                (Some(_), Some(_)) => {
                    return Err(fail(
                        "cannot have both 'ItemSelector' and 'Parameters'".to_string(),
                    ))
                }
                (Some(selector), None) => {
                    compile_template(Some(selector)).map_err(|e| e.at_state(name))?
                }
                (None, legacy) => legacy,
            };
            let processor = match (&raw.item_processor, &raw.iterator) {
                (Some(_), Some(_)) => {
                    return Err(fail(
                        "cannot have both 'ItemProcessor' and 'Iterator'".to_string(),
                    ))
                }
                (Some(p), None) | (None, Some(p)) => compile_nested(name, p)?,
                (None, None) => return Err(fail("missing 'ItemProcessor'".to_string())),
            };
            let items_path = match &raw.items_path {
                Some(path) => JsonPath::parse(path).map_err(|e| e.at_state(name))?,
                None => JsonPath::root(),
            };
            StateKind::Map(MapSpec {
                processor,
                items_path,
                item_selector,
                max_concurrency: raw.max_concurrency.unwrap_or(0),
            })
        }
    };

    Ok(StateNode {
        name: name.to_string(),
        comment: raw.comment,
        kind,
        input_path,
        output_path,
        result_path,
        parameters,
        result_selector,
        transition,
        retriers,
        catchers,
    })
}

fn compile_selection(path: Option<Option<String>>) -> Result<Option<JsonPath>, CoreError> {
    match path {
        None => Ok(Some(JsonPath::root())),
        Some(None) => Ok(None),
        Some(Some(path)) => JsonPath::parse(&path).map(Some),
    }
}

fn compile_template(value: Option<&Value>) -> Result<Option<PayloadTemplate>, CoreError> {
    value.map(PayloadTemplate::compile).transpose()
}

fn compile_seconds(
    field: &str,
    literal: Option<u64>,
    path: &Option<String>,
) -> Result<Option<SecondsSource>, String> {
    match (literal, path) {
        (Some(_), Some(_)) => Err(format!("cannot have both '{field}' and '{field}Path'")),
        (Some(0), None) => Err(format!("{field} must be positive")),
        (Some(secs), None) => Ok(Some(SecondsSource::Literal(secs))),
        (None, Some(path)) => JsonPath::parse_reference(path)
            .map(|p| Some(SecondsSource::Path(p)))
            .map_err(|e| e.to_string()),
        (None, None) => Ok(None),
    }
}

fn compile_task(raw: &StateRaw) -> Result<TaskSpec, String> {
    let resource = raw
        .resource
        .clone()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| "missing 'Resource'".to_string())?;
    let timeout = compile_seconds("TimeoutSeconds", raw.timeout_seconds, &raw.timeout_seconds_path)?;
    let heartbeat = compile_seconds(
        "HeartbeatSeconds",
        raw.heartbeat_seconds,
        &raw.heartbeat_seconds_path,
    )?;
    if let (Some(SecondsSource::Literal(t)), Some(SecondsSource::Literal(h))) = (&timeout, &heartbeat)
    {
        if h >= t {
            return Err(format!(
                "HeartbeatSeconds ({h}) must be lower than TimeoutSeconds ({t})"
            ));
        }
    }
    Ok(TaskSpec {
        resource,
        timeout,
        heartbeat,
    })
}

fn compile_wait(raw: &StateRaw) -> Result<WaitSpec, CoreError> {
    let count = [
        raw.seconds.is_some(),
        raw.seconds_path.is_some(),
        raw.timestamp.is_some(),
        raw.timestamp_path.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if count != 1 {
        return Err(CoreError::definition(
            "",
            "exactly one of Seconds, SecondsPath, Timestamp, TimestampPath is required",
        ));
    }

    if let Some(secs) = raw.seconds {
        return Ok(WaitSpec::Seconds(secs));
    }
    if let Some(path) = &raw.seconds_path {
        return JsonPath::parse_reference(path).map(WaitSpec::SecondsPath);
    }
    if let Some(ts) = &raw.timestamp {
        return DateTime::parse_from_rfc3339(ts)
            .map(WaitSpec::Timestamp)
            .map_err(|e| CoreError::definition("", format!("invalid Timestamp '{ts}': {e}")));
    }
    match &raw.timestamp_path {
        Some(path) => JsonPath::parse_reference(path).map(WaitSpec::TimestampPath),
        None => Err(CoreError::definition("", "missing wait duration")),
    }
}

fn compile_text(
    field: &str,
    literal: &Option<String>,
    path: &Option<String>,
) -> Result<Option<TextSource>, CoreError> {
    match (literal, path) {
        (Some(_), Some(_)) => Err(CoreError::definition(
            "",
            format!("cannot have both '{field}' and '{field}Path'"),
        )),
        (Some(text), None) => Ok(Some(TextSource::Literal(text.clone()))),
        (None, Some(path)) => JsonPath::parse(path).map(|p| Some(TextSource::Path(p))),
        (None, None) => Ok(None),
    }
}

fn compile_fail(raw: &StateRaw) -> Result<FailSpec, CoreError> {
    Ok(FailSpec {
        error: compile_text("Error", &raw.error, &raw.error_path)?,
        cause: compile_text("Cause", &raw.cause, &raw.cause_path)?,
    })
}
