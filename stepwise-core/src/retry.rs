//! Retry and catch policies of Task, Parallel and Map states.

use crate::failure::{names, FailureEvent};
use crate::path::JsonPath;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_INTERVAL_SECONDS: u64 = 1;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_RATE: f64 = 2.0;
/// Ceiling for computed backoff delays without `MaxDelaySeconds`.
const MAX_DELAY_SECONDS: f64 = u32::MAX as f64;

/// Raw `Retry` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RetrierRaw {
    pub error_equals: Vec<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_rate: Option<f64>,
    #[serde(default)]
    pub max_delay_seconds: Option<u64>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Raw `Catch` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct CatcherRaw {
    pub error_equals: Vec<String>,
    pub next: String,
    #[serde(default, deserialize_with = "crate::definition::nullable")]
    pub result_path: Option<Option<String>>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A validated retrier.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrier {
    pub error_equals: Vec<String>,
    pub interval_seconds: u64,
    pub max_attempts: u32,
    pub backoff_rate: f64,
    pub max_delay_seconds: Option<u64>,
}

impl Retrier {
    fn from_raw(raw: RetrierRaw, is_last: bool) -> Result<Self, String> {
        validate_error_equals(&raw.error_equals, is_last)?;
        let backoff_rate = raw.backoff_rate.unwrap_or(DEFAULT_BACKOFF_RATE);
        if !backoff_rate.is_finite() || backoff_rate < 1.0 {
            return Err(format!("BackoffRate must be >= 1.0, got {backoff_rate}"));
        }
        if raw.max_delay_seconds == Some(0) {
            return Err("MaxDelaySeconds must be positive".to_string());
        }
        Ok(Self {
            error_equals: raw.error_equals,
            interval_seconds: raw.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECONDS),
            max_attempts: raw.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff_rate,
            max_delay_seconds: raw.max_delay_seconds,
        })
    }

    /// Returns true if this retrier applies to `failure`.
    pub fn matches(&self, failure: &FailureEvent) -> bool {
        !failure.is_terminal() && self.error_equals.iter().any(|p| failure.matches(p))
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut seconds = self.interval_seconds as f64 * self.backoff_rate.powi(exponent);
        // 0 * inf
        if seconds.is_nan() {
            seconds = 0.0;
        }
        let cap = self
            .max_delay_seconds
            .map_or(MAX_DELAY_SECONDS, |cap| cap as f64)
            .min(MAX_DELAY_SECONDS);
        let seconds = seconds.clamp(0.0, cap);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::from_secs_f64(cap))
    }
}

/// A validated catcher.
#[derive(Debug, Clone)]
pub struct Catcher {
    pub error_equals: Vec<String>,
    pub next: String,
    /// `None` discards the error document.
    pub result_path: Option<JsonPath>,
}

impl Catcher {
    fn from_raw(raw: CatcherRaw, is_last: bool) -> Result<Self, String> {
        validate_error_equals(&raw.error_equals, is_last)?;
        let result_path = match raw.result_path {
            None => Some(JsonPath::root()),
            Some(None) => None,
            Some(Some(path)) => {
                Some(JsonPath::parse_reference(&path).map_err(|e| e.to_string())?)
            }
        };
        Ok(Self {
            error_equals: raw.error_equals,
            next: raw.next,
            result_path,
        })
    }

    /// Returns true if this catcher handles `failure`.
    pub fn matches(&self, failure: &FailureEvent) -> bool {
        self.error_equals.iter().any(|p| failure.matches(p))
    }
}

/// Compiles a `Retry` list.
pub fn compile_retriers(raw: Vec<RetrierRaw>) -> Result<Vec<Retrier>, String> {
    let count = raw.len();
    raw.into_iter()
        .enumerate()
        .map(|(i, r)| Retrier::from_raw(r, i + 1 == count))
        .collect()
}

/// Compiles a `Catch` list.
pub fn compile_catchers(raw: Vec<CatcherRaw>) -> Result<Vec<Catcher>, String> {
    let count = raw.len();
    raw.into_iter()
        .enumerate()
        .map(|(i, c)| Catcher::from_raw(c, i + 1 == count))
        .collect()
}

fn validate_error_equals(patterns: &[String], is_last: bool) -> Result<(), String> {
    if patterns.is_empty() {
        return Err("ErrorEquals must not be empty".to_string());
    }
    if patterns.iter().any(|p| p == names::ALL) {
        if patterns.len() != 1 {
            return Err("States.ALL must appear alone in ErrorEquals".to_string());
        }
        if !is_last {
            return Err("States.ALL must appear in the last retrier or catcher".to_string());
        }
    }
    Ok(())
}

/// A retry that has been granted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    /// 1-based attempt number of the upcoming retry.
    pub attempt: u32,
    pub delay: Duration,
}

/// Attempt counters for one entry into a state.
///
/// Created fresh on every state entry; never stored on the definition.
#[derive(Debug)]
pub struct RetryTracker<'a> {
    retriers: &'a [Retrier],
    attempts: Vec<u32>,
}

impl<'a> RetryTracker<'a> {
    pub fn new(retriers: &'a [Retrier]) -> Self {
        Self {
            retriers,
            attempts: vec![0; retriers.len()],
        }
    }

    /// Consults the first retrier matching `failure`.
    ///
    /// Returns `None` when no retrier matches or the matching one is exhausted.
    pub fn next_retry(&mut self, failure: &FailureEvent) -> Option<RetryDecision> {
        let index = self.retriers.iter().position(|r| r.matches(failure))?;
        let retrier = &self.retriers[index];
        if self.attempts[index] >= retrier.max_attempts {
            return None;
        }
        self.attempts[index] += 1;
        let attempt = self.attempts[index];
        Some(RetryDecision {
            attempt,
            delay: retrier.delay(attempt),
        })
    }

    /// Total retries granted so far.
    pub fn retry_count(&self) -> u32 {
        self.attempts.iter().sum()
    }
}

/// Returns the first catcher handling `failure`.
pub fn find_catcher<'a>(catchers: &'a [Catcher], failure: &FailureEvent) -> Option<&'a Catcher> {
    catchers.iter().find(|c| c.matches(failure))
}
