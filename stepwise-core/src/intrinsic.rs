//! Intrinsic functions (`States.Format(...)` and friends).
//!
//! Calls are parsed at compile time into an [`IntrinsicCall`] tree. Their
//! evaluation is delegated to an [`IntrinsicEvaluator`], so hosts can extend
//! or replace the function set. [`BuiltinIntrinsics`] covers the common ones.

use crate::error::CoreError;
use crate::failure::FailureEvent;
use crate::path::JsonPath;
use serde_json::{Number, Value};

/// One argument of an intrinsic call.
#[derive(Debug, Clone, PartialEq)]
pub enum IntrinsicArg {
    Literal(Value),
    Path(JsonPath),
    Call(IntrinsicCall),
}

/// A parsed intrinsic function call.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicCall {
    pub name: String,
    pub args: Vec<IntrinsicArg>,
}

impl IntrinsicCall {
    /// Returns true if `expr` looks like an intrinsic call rather than a path.
    pub fn looks_like_call(expr: &str) -> bool {
        expr.trim_start().starts_with("States.")
    }

    /// Parses an intrinsic call expression.
    pub fn parse(expr: &str) -> Result<Self, CoreError> {
        let mut parser = CallParser {
            input: expr,
            pos: 0,
        };
        let call = parser.parse_call().map_err(|reason| CoreError::InvalidIntrinsic {
            expr: expr.to_string(),
            reason,
        })?;
        parser.skip_whitespace();
        if parser.pos != expr.len() {
            return Err(CoreError::InvalidIntrinsic {
                expr: expr.to_string(),
                reason: format!("unexpected trailing input at offset {}", parser.pos),
            });
        }
        Ok(call)
    }
}

/// Evaluates intrinsic functions on already-resolved argument values.
pub trait IntrinsicEvaluator: Send + Sync {
    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, FailureEvent>;
}

/// The built-in intrinsic function set.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinIntrinsics;

impl IntrinsicEvaluator for BuiltinIntrinsics {
    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, FailureEvent> {
        match name {
            "States.Format" => format(args),
            "States.StringToJson" => {
                let [arg] = exact_args::<1>(name, args)?;
                let text = expect_str(name, &arg)?;
                serde_json::from_str(text).map_err(|e| {
                    FailureEvent::intrinsic(format!("{name}: argument is not valid JSON: {e}"))
                })
            }
            "States.JsonToString" => {
                let [arg] = exact_args::<1>(name, args)?;
                Ok(Value::String(arg.to_string()))
            }
            "States.Array" => Ok(Value::Array(args)),
            "States.ArrayLength" => {
                let [arg] = exact_args::<1>(name, args)?;
                Ok(Value::from(expect_array(name, &arg)?.len()))
            }
            "States.ArrayGetItem" => {
                let [array, index] = exact_args::<2>(name, args)?;
                let items = expect_array(name, &array)?;
                let index = expect_int(name, &index)?;
                usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| {
                        FailureEvent::intrinsic(format!("{name}: index {index} out of bounds"))
                    })
            }
            "States.ArrayContains" => {
                let [array, needle] = exact_args::<2>(name, args)?;
                Ok(Value::Bool(expect_array(name, &array)?.contains(&needle)))
            }
            "States.MathAdd" => {
                let [a, b] = exact_args::<2>(name, args)?;
                let sum = expect_int(name, &a)?
                    .checked_add(expect_int(name, &b)?)
                    .ok_or_else(|| FailureEvent::intrinsic(format!("{name}: overflow")))?;
                Ok(Value::Number(Number::from(sum)))
            }
            "States.UUID" => {
                exact_args::<0>(name, args)?;
                Ok(Value::String(uuid::Uuid::new_v4().to_string()))
            }
            other => Err(FailureEvent::intrinsic(format!(
                "unsupported intrinsic function '{other}'"
            ))),
        }
    }
}

fn format(args: Vec<Value>) -> Result<Value, FailureEvent> {
    let mut args = args.into_iter();
    let template = match args.next() {
        Some(Value::String(s)) => s,
        _ => {
            return Err(FailureEvent::intrinsic(
                "States.Format: first argument must be a string template",
            ))
        }
    };

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some('{') | Some('}') | Some('\\')) => {
                out.extend(chars.next());
            }
            '{' if chars.peek() == Some(&'}') => {
                chars.next();
                match args.next() {
                    Some(Value::String(s)) => out.push_str(&s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        return Err(FailureEvent::intrinsic(
                            "States.Format: more placeholders than arguments",
                        ))
                    }
                }
            }
            other => out.push(other),
        }
    }

    if args.next().is_some() {
        return Err(FailureEvent::intrinsic(
            "States.Format: more arguments than placeholders",
        ));
    }
    Ok(Value::String(out))
}

fn exact_args<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], FailureEvent> {
    let count = args.len();
    args.try_into().map_err(|_| {
        FailureEvent::intrinsic(format!("{name}: expected {N} argument(s), got {count}"))
    })
}

fn expect_str<'a>(name: &str, value: &'a Value) -> Result<&'a str, FailureEvent> {
    value
        .as_str()
        .ok_or_else(|| FailureEvent::intrinsic(format!("{name}: expected a string argument")))
}

fn expect_array<'a>(name: &str, value: &'a Value) -> Result<&'a Vec<Value>, FailureEvent> {
    value
        .as_array()
        .ok_or_else(|| FailureEvent::intrinsic(format!("{name}: expected an array argument")))
}

fn expect_int(name: &str, value: &Value) -> Result<i64, FailureEvent> {
    value
        .as_i64()
        .ok_or_else(|| FailureEvent::intrinsic(format!("{name}: expected an integer argument")))
}

struct CallParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> CallParser<'a> {
    fn parse_call(&mut self) -> Result<IntrinsicCall, String> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '.' || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        let name = self.input[start..self.pos].to_string();
        if !name.starts_with("States.") || name.len() == "States.".len() {
            return Err(format!("invalid function name '{name}'"));
        }

        self.skip_whitespace();
        self.expect('(')?;
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek_char() == Some(')') {
            self.pos += 1;
            return Ok(IntrinsicCall { name, args });
        }

        loop {
            args.push(self.parse_arg()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(')') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err("expected ',' or ')'".to_string()),
            }
        }

        Ok(IntrinsicCall { name, args })
    }

    fn parse_arg(&mut self) -> Result<IntrinsicArg, String> {
        self.skip_whitespace();
        let rest = &self.input[self.pos..];

        if rest.starts_with('\'') {
            return self.parse_string().map(|s| IntrinsicArg::Literal(Value::String(s)));
        }
        if rest.starts_with('$') {
            let raw = self.take_until_delimiter();
            return JsonPath::parse(raw.trim())
                .map(IntrinsicArg::Path)
                .map_err(|e| e.to_string());
        }
        if rest.starts_with("States.") {
            return self.parse_call().map(IntrinsicArg::Call);
        }

        let raw = self.take_until_delimiter().trim();
        match raw {
            "true" => Ok(IntrinsicArg::Literal(Value::Bool(true))),
            "false" => Ok(IntrinsicArg::Literal(Value::Bool(false))),
            "null" => Ok(IntrinsicArg::Literal(Value::Null)),
            _ => serde_json::from_str::<Number>(raw)
                .map(|n| IntrinsicArg::Literal(Value::Number(n)))
                .map_err(|_| format!("invalid argument '{raw}'")),
        }
    }

    fn parse_string(&mut self) -> Result<String, String> {
        self.expect('\'')?;
        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            match c {
                '\'' => return Ok(out),
                '\\' => match self.peek_char() {
                    Some(escaped @ ('\'' | '\\')) => {
                        self.pos += 1;
                        out.push(escaped);
                    }
                    _ => out.push('\\'),
                },
                other => out.push(other),
            }
        }
        Err("unterminated string literal".to_string())
    }

    fn take_until_delimiter(&mut self) -> &'a str {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(c) = self.peek_char() {
            match c {
                '[' | '(' => depth += 1,
                ']' if depth > 0 => depth -= 1,
                ')' if depth > 0 => depth -= 1,
                ',' | ')' if depth == 0 => break,
                _ => {}
            }
            self.pos += c.len_utf8();
        }
        &self.input[start..self.pos]
    }

    fn expect(&mut self, expected: char) -> Result<(), String> {
        if self.peek_char() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected '{expected}'"))
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }
}
