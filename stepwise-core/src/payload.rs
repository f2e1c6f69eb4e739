//! Payload templates: `Parameters`, `ResultSelector` and `ItemSelector`.
//!
//! A template is a JSON document whose object keys ending in `.$` are
//! dynamic. Their value is either a path into the effective input (`$...`),
//! a path into the context object (`$$...`), or an intrinsic function call.
//!
//! ```json
//! {
//!   "orderId.$": "$.order.id",
//!   "execution.$": "$$.Execution.Id",
//!   "greeting.$": "States.Format('Hi {}', $.customer.name)",
//!   "static": {"retries": 3}
//! }
//! ```

use crate::error::CoreError;
use crate::failure::FailureEvent;
use crate::intrinsic::{IntrinsicArg, IntrinsicCall, IntrinsicEvaluator};
use crate::path::JsonPath;
use serde_json::{Map, Value};

/// A compiled payload template.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadTemplate {
    /// A subtree with no dynamic fields.
    Literal(Value),
    Object(Vec<(String, PayloadTemplate)>),
    Array(Vec<PayloadTemplate>),
    Path(JsonPath),
    Intrinsic(IntrinsicCall),
}

impl PayloadTemplate {
    /// Compiles a template document.
    pub fn compile(value: &Value) -> Result<Self, CoreError> {
        match value {
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                let mut dynamic = false;
                for (key, field) in map {
                    if let Some(name) = key.strip_suffix(".$") {
                        if map.contains_key(name) {
                            return Err(CoreError::InvalidTemplate {
                                field: key.clone(),
                                reason: format!("conflicts with static field '{name}'"),
                            });
                        }
                        let expr = field.as_str().ok_or_else(|| CoreError::InvalidTemplate {
                            field: key.clone(),
                            reason: "value of a '.$' field must be a string".to_string(),
                        })?;
                        fields.push((name.to_string(), Self::compile_expression(expr)?));
                        dynamic = true;
                    } else {
                        let compiled = Self::compile(field)?;
                        dynamic |= !matches!(compiled, PayloadTemplate::Literal(_));
                        fields.push((key.clone(), compiled));
                    }
                }
                if dynamic {
                    Ok(PayloadTemplate::Object(fields))
                } else {
                    Ok(PayloadTemplate::Literal(value.clone()))
                }
            }
            Value::Array(items) => {
                let compiled = items
                    .iter()
                    .map(Self::compile)
                    .collect::<Result<Vec<_>, _>>()?;
                if compiled
                    .iter()
                    .all(|c| matches!(c, PayloadTemplate::Literal(_)))
                {
                    Ok(PayloadTemplate::Literal(value.clone()))
                } else {
                    Ok(PayloadTemplate::Array(compiled))
                }
            }
            other => Ok(PayloadTemplate::Literal(other.clone())),
        }
    }

    /// Compiles the right-hand side of a `.$` field.
    pub fn compile_expression(expr: &str) -> Result<Self, CoreError> {
        if IntrinsicCall::looks_like_call(expr) {
            IntrinsicCall::parse(expr).map(PayloadTemplate::Intrinsic)
        } else {
            JsonPath::parse(expr).map(PayloadTemplate::Path)
        }
    }

    /// Evaluates the template against `input` (for `$`) and `context` (for `$$`).
    pub fn evaluate(
        &self,
        input: &Value,
        context: &Value,
        intrinsics: &dyn IntrinsicEvaluator,
    ) -> Result<Value, FailureEvent> {
        match self {
            PayloadTemplate::Literal(value) => Ok(value.clone()),
            PayloadTemplate::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, template) in fields {
                    out.insert(key.clone(), template.evaluate(input, context, intrinsics)?);
                }
                Ok(Value::Object(out))
            }
            PayloadTemplate::Array(items) => items
                .iter()
                .map(|t| t.evaluate(input, context, intrinsics))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            PayloadTemplate::Path(path) => resolve_path(path, input, context),
            PayloadTemplate::Intrinsic(call) => evaluate_call(call, input, context, intrinsics),
        }
    }
}

/// Resolves a path against the input or, for `$$` paths, the context object.
pub fn resolve_path(path: &JsonPath, input: &Value, context: &Value) -> Result<Value, FailureEvent> {
    let doc = if path.is_context() { context } else { input };
    path.select(doc).map_err(FailureEvent::runtime)
}

fn evaluate_call(
    call: &IntrinsicCall,
    input: &Value,
    context: &Value,
    intrinsics: &dyn IntrinsicEvaluator,
) -> Result<Value, FailureEvent> {
    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        let value = match arg {
            IntrinsicArg::Literal(value) => value.clone(),
            IntrinsicArg::Path(path) => resolve_path(path, input, context)?,
            IntrinsicArg::Call(inner) => evaluate_call(inner, input, context, intrinsics)?,
        };
        args.push(value);
    }
    intrinsics.call(&call.name, args)
}
