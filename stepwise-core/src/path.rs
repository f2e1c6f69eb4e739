//! JSONPath subset used by InputPath, OutputPath, ItemsPath, ResultPath and
//! the `.$` fields of payload templates.
//!
//! Supported syntax:
//!
//! - `$` - the whole document
//! - `$$` - the context object (only where context paths are allowed)
//! - `.field` / `['field']` / `["field"]` - object member
//! - `[3]` - array element
//! - `[*]` - every array element (selection paths only)
//!
//! Examples: `$.order.items[0].sku`, `$['weird key'].x`, `$.items[*].id`,
//! `$$.Execution.Input`.

use crate::error::CoreError;
use serde_json::{Map, Value};
use std::fmt;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    context: bool,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parses a selection path (`$...` or `$$...`).
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let (context, rest) = if let Some(rest) = raw.strip_prefix("$$") {
            (true, rest)
        } else if let Some(rest) = raw.strip_prefix('$') {
            (false, rest)
        } else {
            return Err(invalid("must start with '$'"));
        };

        let segments = PathParser::new(rest)
            .parse()
            .map_err(|reason| invalid(&reason))?;

        Ok(Self {
            raw: raw.to_string(),
            context,
            segments,
        })
    }

    /// Parses a reference path: a single-node path on the state data, usable
    /// as a ResultPath target.
    pub fn parse_reference(raw: &str) -> Result<Self, CoreError> {
        let path = Self::parse(raw)?;
        if path.context {
            return Err(CoreError::InvalidPath {
                path: raw.to_string(),
                reason: "reference paths cannot address the context object".to_string(),
            });
        }
        if path.segments.contains(&Segment::Wildcard) {
            return Err(CoreError::InvalidPath {
                path: raw.to_string(),
                reason: "reference paths cannot contain wildcards".to_string(),
            });
        }
        Ok(path)
    }

    /// The identity path `$`.
    pub fn root() -> Self {
        Self {
            raw: "$".to_string(),
            context: false,
            segments: Vec::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if this path addresses the context object (`$$`).
    pub fn is_context(&self) -> bool {
        self.context
    }

    /// True for `$` (and `$$`).
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Selects the addressed value. Missing members or indices are errors.
    pub fn select(&self, doc: &Value) -> Result<Value, String> {
        select_segments(doc, &self.segments, &self.raw)
    }

    /// Selects the addressed value, mapping "not found" to `None`.
    pub fn lookup<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut current = doc;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => map.get(name)?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes `value` at this reference path inside `doc`, creating
    /// intermediate objects. The root path replaces `doc` entirely.
    pub fn assign(&self, doc: Value, value: Value) -> Result<Value, String> {
        if self.segments.is_empty() {
            return Ok(value);
        }
        let mut doc = doc;
        assign_into(&mut doc, &self.segments, value, &self.raw)?;
        Ok(doc)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn select_segments(doc: &Value, segments: &[Segment], raw: &str) -> Result<Value, String> {
    let Some((segment, rest)) = segments.split_first() else {
        return Ok(doc.clone());
    };

    match (segment, doc) {
        (Segment::Field(name), Value::Object(map)) => match map.get(name) {
            Some(next) => select_segments(next, rest, raw),
            None => Err(format!(
                "the JSONPath '{raw}' could not be found in the input: missing field '{name}'"
            )),
        },
        (Segment::Index(i), Value::Array(items)) => match items.get(*i) {
            Some(next) => select_segments(next, rest, raw),
            None => Err(format!(
                "the JSONPath '{raw}' could not be found in the input: index {i} out of bounds"
            )),
        },
        (Segment::Wildcard, Value::Array(items)) => {
            // Elements that do not contain the remaining path are skipped.
            let selected = items
                .iter()
                .filter_map(|item| select_segments(item, rest, raw).ok())
                .collect();
            Ok(Value::Array(selected))
        }
        (Segment::Wildcard, Value::Object(map)) => {
            let selected = map
                .values()
                .filter_map(|item| select_segments(item, rest, raw).ok())
                .collect();
            Ok(Value::Array(selected))
        }
        (segment, other) => Err(format!(
            "the JSONPath '{raw}' could not be found in the input: cannot apply {} to {}",
            describe_segment(segment),
            type_name(other)
        )),
    }
}

fn assign_into(
    target: &mut Value,
    segments: &[Segment],
    value: Value,
    raw: &str,
) -> Result<(), String> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = value;
        return Ok(());
    };

    match segment {
        Segment::Field(name) => {
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
            let found = type_name(target);
            let Value::Object(map) = target else {
                return Err(format!(
                    "unable to apply ResultPath '{raw}': cannot set field '{name}' on {found}"
                ));
            };
            let slot = map.entry(name.clone()).or_insert(Value::Null);
            if !rest.is_empty() && !(slot.is_object() || slot.is_array() || slot.is_null()) {
                *slot = Value::Object(Map::new());
            }
            assign_into(slot, rest, value, raw)
        }
        Segment::Index(i) => {
            let found = type_name(target);
            let Value::Array(items) = target else {
                return Err(format!(
                    "unable to apply ResultPath '{raw}': cannot index {found}"
                ));
            };
            match items.get_mut(*i) {
                Some(slot) => assign_into(slot, rest, value, raw),
                None => Err(format!(
                    "unable to apply ResultPath '{raw}': index {i} out of bounds"
                )),
            }
        }
        Segment::Wildcard => Err(format!(
            "unable to apply ResultPath '{raw}': wildcards are not allowed"
        )),
    }
}

fn describe_segment(segment: &Segment) -> String {
    match segment {
        Segment::Field(name) => format!("field '{name}'"),
        Segment::Index(i) => format!("index [{i}]"),
        Segment::Wildcard => "wildcard [*]".to_string(),
    }
}

/// Short type label used in error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

struct PathParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> PathParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(mut self) -> Result<Vec<Segment>, String> {
        let mut segments = Vec::new();
        while let Some(c) = self.peek_char() {
            match c {
                '.' => {
                    self.pos += 1;
                    if self.peek_char() == Some('*') {
                        self.pos += 1;
                        segments.push(Segment::Wildcard);
                    } else {
                        segments.push(Segment::Field(self.parse_name()?));
                    }
                }
                '[' => {
                    self.pos += 1;
                    segments.push(self.parse_bracket()?);
                }
                other => return Err(format!("unexpected character '{other}'")),
            }
        }
        Ok(segments)
    }

    fn parse_name(&mut self) -> Result<String, String> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '.' || c == '[' {
                break;
            }
            self.pos += c.len_utf8();
        }
        let name = &self.input[start..self.pos];
        if name.is_empty() {
            return Err("empty field name".to_string());
        }
        Ok(name.to_string())
    }

    fn parse_bracket(&mut self) -> Result<Segment, String> {
        let segment = match self.peek_char() {
            Some('*') => {
                self.pos += 1;
                Segment::Wildcard
            }
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let start = self.pos;
                while let Some(c) = self.peek_char() {
                    if c == quote {
                        break;
                    }
                    self.pos += c.len_utf8();
                }
                if self.peek_char() != Some(quote) {
                    return Err("unterminated quoted field".to_string());
                }
                let name = self.input[start..self.pos].to_string();
                self.pos += 1;
                Segment::Field(name)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let index = self.input[start..self.pos]
                    .parse::<usize>()
                    .map_err(|e| format!("invalid index: {e}"))?;
                Segment::Index(index)
            }
            _ => return Err("expected index, quoted field or '*' after '['".to_string()),
        };

        if self.peek_char() != Some(']') {
            return Err("expected ']'".to_string());
        }
        self.pos += 1;
        Ok(segment)
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_segments() {
        let path = JsonPath::parse("$.order.items[0]['sku code']").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Field("order".to_string()),
                Segment::Field("items".to_string()),
                Segment::Index(0),
                Segment::Field("sku code".to_string()),
            ]
        );
        assert!(!path.is_context());
    }

    #[test]
    fn test_parse_context_path() {
        let path = JsonPath::parse("$$.Execution.Id").unwrap();
        assert!(path.is_context());
        assert_eq!(path.segments().len(), 2);
    }

    #[test]
    fn test_parse_errors() {
        assert!(JsonPath::parse("order.id").is_err());
        assert!(JsonPath::parse("$.").is_err());
        assert!(JsonPath::parse("$.a[").is_err());
        assert!(JsonPath::parse("$.a['x").is_err());
        assert!(JsonPath::parse("$x").is_err());
    }

    #[test]
    fn test_reference_path_rules() {
        assert!(JsonPath::parse_reference("$.a.b").is_ok());
        assert!(JsonPath::parse_reference("$.a[*]").is_err());
        assert!(JsonPath::parse_reference("$$.Execution").is_err());
    }

    #[test]
    fn test_select() {
        let doc = json!({"a": {"b": [10, 20, 30]}});
        assert_eq!(JsonPath::parse("$").unwrap().select(&doc).unwrap(), doc);
        assert_eq!(
            JsonPath::parse("$.a.b[1]").unwrap().select(&doc).unwrap(),
            json!(20)
        );
        assert!(JsonPath::parse("$.a.c").unwrap().select(&doc).is_err());
        assert!(JsonPath::parse("$.a.b[9]").unwrap().select(&doc).is_err());
    }

    #[test]
    fn test_select_wildcard() {
        let doc = json!({"items": [{"id": 1}, {"id": 2}, {"other": 3}]});
        let ids = JsonPath::parse("$.items[*].id").unwrap().select(&doc).unwrap();
        assert_eq!(ids, json!([1, 2]));
    }

    #[test]
    fn test_lookup_missing() {
        let doc = json!({"a": 1});
        assert_eq!(JsonPath::parse("$.a").unwrap().lookup(&doc), Some(&json!(1)));
        assert_eq!(JsonPath::parse("$.b").unwrap().lookup(&doc), None);
        assert_eq!(JsonPath::parse("$.a.b").unwrap().lookup(&doc), None);
    }

    #[test]
    fn test_assign_creates_objects() {
        let path = JsonPath::parse_reference("$.result.detail").unwrap();
        let doc = path.assign(json!({"a": 1}), json!("ok")).unwrap();
        assert_eq!(doc, json!({"a": 1, "result": {"detail": "ok"}}));
    }

    #[test]
    fn test_assign_root_replaces() {
        let doc = JsonPath::root().assign(json!({"a": 1}), json!([1])).unwrap();
        assert_eq!(doc, json!([1]));
    }

    #[test]
    fn test_assign_into_scalar_fails() {
        let path = JsonPath::parse_reference("$.x").unwrap();
        assert!(path.assign(json!("text"), json!(1)).is_err());
    }

    #[test]
    fn test_assign_overwrites_scalar_intermediate() {
        let path = JsonPath::parse_reference("$.a.b").unwrap();
        let doc = path.assign(json!({"a": 5}), json!(true)).unwrap();
        assert_eq!(doc, json!({"a": {"b": true}}));
    }

    proptest! {
        #[test]
        fn prop_assign_then_select(key in "[a-z]{1,8}", inner in "[a-z]{1,8}", n in any::<i64>()) {
            let path = JsonPath::parse_reference(&format!("$.{key}.{inner}")).unwrap();
            let doc = path.assign(json!({}), json!(n)).unwrap();
            prop_assert_eq!(path.select(&doc).unwrap(), json!(n));
        }
    }
}
