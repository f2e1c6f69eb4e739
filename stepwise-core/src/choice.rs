//! Choice rule evaluation.
//!
//! Choice rules are boolean expressions over the state input. The rule
//! language supports:
//!
//! - `And` / `Or` - arrays of nested rules
//! - `Not` - a single nested rule
//! - `String*`, `Numeric*`, `Timestamp*` comparisons (`Equals`, `LessThan`,
//!   `GreaterThan`, `LessThanEquals`, `GreaterThanEquals`), each with a
//!   `*Path` variant comparing against another path in the input
//! - `BooleanEquals` / `BooleanEqualsPath`
//! - `StringMatches` - `*` wildcard, `\*` literal asterisk
//! - `IsNull`, `IsPresent`, `IsNumeric`, `IsString`, `IsBoolean`, `IsTimestamp`
//!
//! A comparison on a variable that is absent (or of the wrong type) is
//! false; only `IsPresent` observes absence.
//!
//! Example:
//!
//! ```json
//! {
//!   "And": [
//!     {"Variable": "$.amount", "NumericGreaterThan": 100},
//!     {"Not": {"Variable": "$.status", "StringEquals": "blocked"}}
//!   ],
//!   "Next": "Review"
//! }
//! ```

use crate::error::CoreError;
use crate::path::JsonPath;
use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A top-level choice: a rule plus the state to transition to.
#[derive(Debug, Clone)]
pub struct ChoiceBranch {
    pub rule: ChoiceRule,
    pub next: String,
}

impl ChoiceBranch {
    /// Parses a top-level rule (which must carry `Next`).
    pub fn parse(value: &Value) -> Result<Self, CoreError> {
        let map = as_rule_object(value)?;
        let next = map
            .get("Next")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("top-level choice rule must have a string 'Next'"))?
            .to_string();
        let rule = ChoiceRule::parse_map(map, true)?;
        Ok(Self { rule, next })
    }
}

/// A parsed choice rule.
#[derive(Debug, Clone)]
pub enum ChoiceRule {
    And(Vec<ChoiceRule>),
    Or(Vec<ChoiceRule>),
    Not(Box<ChoiceRule>),
    Test { variable: JsonPath, test: DataTest },
}

/// Comparison operator of a data test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equals,
    LessThan,
    GreaterThan,
    LessThanEquals,
    GreaterThanEquals,
}

impl Comparison {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Equals => ordering == Ordering::Equal,
            Comparison::LessThan => ordering == Ordering::Less,
            Comparison::GreaterThan => ordering == Ordering::Greater,
            Comparison::LessThanEquals => ordering != Ordering::Greater,
            Comparison::GreaterThanEquals => ordering != Ordering::Less,
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone)]
pub enum Operand {
    Literal(Value),
    Path(JsonPath),
}

/// The kind of value a comparison operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Numeric,
    Timestamp,
    Boolean,
}

/// A single test applied to the rule's `Variable`.
#[derive(Debug, Clone)]
pub enum DataTest {
    Compare {
        kind: Kind,
        comparison: Comparison,
        operand: Operand,
    },
    StringMatches(Vec<PatternToken>),
    IsNull(bool),
    IsPresent(bool),
    IsNumeric(bool),
    IsString(bool),
    IsBoolean(bool),
    IsTimestamp(bool),
}

/// Token of a `StringMatches` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternToken {
    Char(char),
    Star,
}

const COMPARISONS: [(&str, Comparison); 5] = [
    ("Equals", Comparison::Equals),
    ("LessThan", Comparison::LessThan),
    ("GreaterThan", Comparison::GreaterThan),
    ("LessThanEquals", Comparison::LessThanEquals),
    ("GreaterThanEquals", Comparison::GreaterThanEquals),
];

const KINDS: [(&str, Kind); 3] = [
    ("String", Kind::String),
    ("Numeric", Kind::Numeric),
    ("Timestamp", Kind::Timestamp),
];

impl ChoiceRule {
    /// Parses a nested rule (must not carry `Next`).
    pub fn parse(value: &Value) -> Result<Self, CoreError> {
        Self::parse_map(as_rule_object(value)?, false)
    }

    fn parse_map(map: &Map<String, Value>, top_level: bool) -> Result<Self, CoreError> {
        if !top_level && map.contains_key("Next") {
            return Err(invalid("nested choice rules cannot have 'Next'"));
        }

        let operators: Vec<&String> = map
            .keys()
            .filter(|k| !matches!(k.as_str(), "Next" | "Variable" | "Comment"))
            .collect();
        if operators.len() != 1 {
            return Err(invalid(format!(
                "a choice rule needs exactly one operator, found {}",
                operators.len()
            )));
        }
        let op = operators[0].as_str();
        let operand = &map[op];

        match op {
            "And" | "Or" => {
                if map.contains_key("Variable") {
                    return Err(invalid(format!("'{op}' rules cannot have 'Variable'")));
                }
                let items = operand
                    .as_array()
                    .filter(|items| !items.is_empty())
                    .ok_or_else(|| invalid(format!("'{op}' must be a non-empty array")))?;
                let rules = items
                    .iter()
                    .map(ChoiceRule::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if op == "And" {
                    ChoiceRule::And(rules)
                } else {
                    ChoiceRule::Or(rules)
                })
            }
            "Not" => {
                if map.contains_key("Variable") {
                    return Err(invalid("'Not' rules cannot have 'Variable'"));
                }
                Ok(ChoiceRule::Not(Box::new(ChoiceRule::parse(operand)?)))
            }
            _ => {
                let variable = map
                    .get("Variable")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(format!("'{op}' requires a string 'Variable'")))?;
                let variable = JsonPath::parse(variable)?;
                let test = parse_data_test(op, operand)?;
                Ok(ChoiceRule::Test { variable, test })
            }
        }
    }

    /// Evaluates the rule against the state input and context object.
    pub fn evaluate(&self, input: &Value, context: &Value) -> bool {
        match self {
            ChoiceRule::And(rules) => rules.iter().all(|r| r.evaluate(input, context)),
            ChoiceRule::Or(rules) => rules.iter().any(|r| r.evaluate(input, context)),
            ChoiceRule::Not(rule) => !rule.evaluate(input, context),
            ChoiceRule::Test { variable, test } => {
                let value = lookup(variable, input, context);
                test.evaluate(value, input, context)
            }
        }
    }
}

impl DataTest {
    fn evaluate(&self, value: Option<&Value>, input: &Value, context: &Value) -> bool {
        match self {
            DataTest::IsPresent(expected) => value.is_some() == *expected,
            DataTest::IsNull(expected) => value.map(Value::is_null) == Some(*expected),
            DataTest::IsNumeric(expected) => value.map(Value::is_number) == Some(*expected),
            DataTest::IsString(expected) => value.map(Value::is_string) == Some(*expected),
            DataTest::IsBoolean(expected) => value.map(Value::is_boolean) == Some(*expected),
            DataTest::IsTimestamp(expected) => {
                value.map(|v| as_timestamp(v).is_some()) == Some(*expected)
            }
            DataTest::StringMatches(pattern) => value
                .and_then(Value::as_str)
                .map(|s| wildcard_match(pattern, &s.chars().collect::<Vec<_>>()))
                .unwrap_or(false),
            DataTest::Compare {
                kind,
                comparison,
                operand,
            } => {
                let Some(left) = value else {
                    return false;
                };
                let right = match operand {
                    Operand::Literal(v) => Some(v),
                    Operand::Path(path) => lookup(path, input, context),
                };
                let Some(right) = right else {
                    return false;
                };
                compare(*kind, left, right)
                    .map(|ordering| comparison.holds(ordering))
                    .unwrap_or(false)
            }
        }
    }
}

fn parse_data_test(op: &str, operand: &Value) -> Result<DataTest, CoreError> {
    let expect_bool = || {
        operand
            .as_bool()
            .ok_or_else(|| invalid(format!("'{op}' expects a boolean")))
    };

    match op {
        "IsNull" => return Ok(DataTest::IsNull(expect_bool()?)),
        "IsPresent" => return Ok(DataTest::IsPresent(expect_bool()?)),
        "IsNumeric" => return Ok(DataTest::IsNumeric(expect_bool()?)),
        "IsString" => return Ok(DataTest::IsString(expect_bool()?)),
        "IsBoolean" => return Ok(DataTest::IsBoolean(expect_bool()?)),
        "IsTimestamp" => return Ok(DataTest::IsTimestamp(expect_bool()?)),
        "StringMatches" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| invalid("'StringMatches' expects a string"))?;
            return Ok(DataTest::StringMatches(parse_pattern(pattern)));
        }
        "BooleanEquals" => {
            expect_bool()?;
            return Ok(DataTest::Compare {
                kind: Kind::Boolean,
                comparison: Comparison::Equals,
                operand: Operand::Literal(operand.clone()),
            });
        }
        "BooleanEqualsPath" => {
            return Ok(DataTest::Compare {
                kind: Kind::Boolean,
                comparison: Comparison::Equals,
                operand: Operand::Path(parse_operand_path(op, operand)?),
            });
        }
        _ => {}
    }

    let (base, is_path) = match op.strip_suffix("Path") {
        Some(base) => (base, true),
        None => (op, false),
    };

    for (kind_name, kind) in KINDS {
        let Some(cmp_name) = base.strip_prefix(kind_name) else {
            continue;
        };
        let Some((_, comparison)) = COMPARISONS.iter().find(|(name, _)| *name == cmp_name) else {
            continue;
        };

        let operand = if is_path {
            Operand::Path(parse_operand_path(op, operand)?)
        } else {
            let valid = match kind {
                Kind::String => operand.is_string(),
                Kind::Numeric => operand.is_number(),
                Kind::Timestamp => as_timestamp(operand).is_some(),
                Kind::Boolean => operand.is_boolean(),
            };
            if !valid {
                return Err(invalid(format!("invalid operand for '{op}': {operand}")));
            }
            Operand::Literal(operand.clone())
        };

        return Ok(DataTest::Compare {
            kind,
            comparison: *comparison,
            operand,
        });
    }

    Err(invalid(format!("unknown choice operator '{op}'")))
}

fn parse_operand_path(op: &str, operand: &Value) -> Result<JsonPath, CoreError> {
    let raw = operand
        .as_str()
        .ok_or_else(|| invalid(format!("'{op}' expects a path string")))?;
    JsonPath::parse(raw)
}

fn parse_pattern(pattern: &str) -> Vec<PatternToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => tokens.push(PatternToken::Char(escaped)),
                None => tokens.push(PatternToken::Char('\\')),
            },
            '*' => tokens.push(PatternToken::Star),
            other => tokens.push(PatternToken::Char(other)),
        }
    }
    tokens
}

fn wildcard_match(pattern: &[PatternToken], text: &[char]) -> bool {
    // Iterative glob matching with single backtrack point.
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(PatternToken::Char(c)) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            Some(PatternToken::Star) => {
                star = Some((p, t));
                p += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|tok| *tok == PatternToken::Star)
}

fn compare(kind: Kind, left: &Value, right: &Value) -> Option<Ordering> {
    match kind {
        Kind::String => Some(left.as_str()?.cmp(right.as_str()?)),
        Kind::Numeric => left.as_f64()?.partial_cmp(&right.as_f64()?),
        Kind::Timestamp => Some(as_timestamp(left)?.cmp(&as_timestamp(right)?)),
        Kind::Boolean => Some(left.as_bool()?.cmp(&right.as_bool()?)),
    }
}

fn as_timestamp(value: &Value) -> Option<DateTime<FixedOffset>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
}

fn lookup<'a>(path: &JsonPath, input: &'a Value, context: &'a Value) -> Option<&'a Value> {
    if path.is_context() {
        path.lookup(context)
    } else {
        path.lookup(input)
    }
}

fn as_rule_object(value: &Value) -> Result<&Map<String, Value>, CoreError> {
    value
        .as_object()
        .ok_or_else(|| invalid("choice rule must be an object"))
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidChoiceRule {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(value: Value) -> ChoiceRule {
        ChoiceRule::parse(&value).unwrap()
    }

    fn eval(rule: &ChoiceRule, input: Value) -> bool {
        rule.evaluate(&input, &json!({}))
    }

    #[test]
    fn test_string_equals() {
        let r = rule(json!({"Variable": "$.status", "StringEquals": "active"}));
        assert!(eval(&r, json!({"status": "active"})));
        assert!(!eval(&r, json!({"status": "inactive"})));
        assert!(!eval(&r, json!({"status": 1})));
        assert!(!eval(&r, json!({})));
    }

    #[test]
    fn test_numeric_comparisons() {
        let gt = rule(json!({"Variable": "$.n", "NumericGreaterThan": 100}));
        assert!(eval(&gt, json!({"n": 150})));
        assert!(!eval(&gt, json!({"n": 100})));

        let ge = rule(json!({"Variable": "$.n", "NumericGreaterThanEquals": 100}));
        assert!(eval(&ge, json!({"n": 100})));

        let lt = rule(json!({"Variable": "$.n", "NumericLessThan": -1.5}));
        assert!(eval(&lt, json!({"n": -2})));
        assert!(!eval(&lt, json!({"n": "-2"})));
    }

    #[test]
    fn test_path_operand() {
        let r = rule(json!({"Variable": "$.spent", "NumericLessThanEqualsPath": "$.budget"}));
        assert!(eval(&r, json!({"spent": 5, "budget": 5})));
        assert!(!eval(&r, json!({"spent": 6, "budget": 5})));
        assert!(!eval(&r, json!({"spent": 6})));
    }

    #[test]
    fn test_boolean_equals() {
        let r = rule(json!({"Variable": "$.ok", "BooleanEquals": true}));
        assert!(eval(&r, json!({"ok": true})));
        assert!(!eval(&r, json!({"ok": false})));
        assert!(!eval(&r, json!({"ok": "true"})));
    }

    #[test]
    fn test_timestamp_comparison() {
        let r = rule(json!({
            "Variable": "$.at",
            "TimestampLessThan": "2024-01-01T00:00:00Z"
        }));
        assert!(eval(&r, json!({"at": "2023-12-31T23:59:59Z"})));
        assert!(!eval(&r, json!({"at": "2024-01-01T01:00:00+00:00"})));
        assert!(!eval(&r, json!({"at": "yesterday"})));
    }

    #[test]
    fn test_string_matches() {
        let r = rule(json!({"Variable": "$.file", "StringMatches": "log-*.txt"}));
        assert!(eval(&r, json!({"file": "log-2024.txt"})));
        assert!(eval(&r, json!({"file": "log-.txt"})));
        assert!(!eval(&r, json!({"file": "log-2024.csv"})));

        let escaped = rule(json!({"Variable": "$.s", "StringMatches": "a\\*b"}));
        assert!(eval(&escaped, json!({"s": "a*b"})));
        assert!(!eval(&escaped, json!({"s": "axxb"})));
    }

    #[test]
    fn test_type_tests() {
        let present = rule(json!({"Variable": "$.x", "IsPresent": true}));
        assert!(eval(&present, json!({"x": null})));
        assert!(!eval(&present, json!({})));

        let absent = rule(json!({"Variable": "$.x", "IsPresent": false}));
        assert!(eval(&absent, json!({})));

        let is_null = rule(json!({"Variable": "$.x", "IsNull": true}));
        assert!(eval(&is_null, json!({"x": null})));
        assert!(!eval(&is_null, json!({})));

        let is_num = rule(json!({"Variable": "$.x", "IsNumeric": true}));
        assert!(eval(&is_num, json!({"x": 1.5})));

        let is_ts = rule(json!({"Variable": "$.x", "IsTimestamp": true}));
        assert!(eval(&is_ts, json!({"x": "2024-05-01T10:00:00Z"})));
        assert!(!eval(&is_ts, json!({"x": "soon"})));
    }

    #[test]
    fn test_logical_combinators() {
        let r = rule(json!({
            "Or": [
                {"And": [
                    {"Variable": "$.a", "BooleanEquals": true},
                    {"Variable": "$.b", "BooleanEquals": true}
                ]},
                {"Not": {"Variable": "$.c", "IsPresent": true}}
            ]
        }));
        assert!(eval(&r, json!({"a": true, "b": true, "c": 1})));
        assert!(eval(&r, json!({"a": false, "b": true})));
        assert!(!eval(&r, json!({"a": true, "b": false, "c": 1})));
    }

    #[test]
    fn test_context_variable() {
        let r = rule(json!({"Variable": "$$.Execution.Name", "StringEquals": "nightly"}));
        assert!(r.evaluate(&json!({}), &json!({"Execution": {"Name": "nightly"}})));
    }

    #[test]
    fn test_branch_requires_next() {
        let ok = ChoiceBranch::parse(&json!({
            "Variable": "$.x", "IsNull": false, "Next": "Done"
        }))
        .unwrap();
        assert_eq!(ok.next, "Done");

        assert!(ChoiceBranch::parse(&json!({"Variable": "$.x", "IsNull": false})).is_err());
    }

    #[test]
    fn test_parse_errors() {
        // Nested Next.
        assert!(ChoiceRule::parse(&json!({"Not": {
            "Variable": "$.x", "IsNull": true, "Next": "A"
        }}))
        .is_err());
        // Two operators.
        assert!(ChoiceRule::parse(&json!({
            "Variable": "$.x", "IsNull": true, "IsPresent": true
        }))
        .is_err());
        // Wrong literal type.
        assert!(ChoiceRule::parse(&json!({"Variable": "$.x", "NumericEquals": "1"})).is_err());
        // Unknown operator.
        assert!(ChoiceRule::parse(&json!({"Variable": "$.x", "StringContains": "a"})).is_err());
        // Missing variable.
        assert!(ChoiceRule::parse(&json!({"StringEquals": "a"})).is_err());
        // Empty And.
        assert!(ChoiceRule::parse(&json!({"And": []})).is_err());
        // Bad timestamp literal.
        assert!(ChoiceRule::parse(&json!({"Variable": "$.t", "TimestampEquals": "x"})).is_err());
    }
}
