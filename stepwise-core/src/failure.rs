//! Runtime failures and the predefined `States.*` error names.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Predefined error names of the states language.
pub mod names {
    /// Wildcard matching any error name in `ErrorEquals`.
    pub const ALL: &str = "States.ALL";
    /// A Task ran longer than `TimeoutSeconds`, or the execution timed out.
    pub const TIMEOUT: &str = "States.Timeout";
    /// A Task failed to heartbeat within `HeartbeatSeconds`.
    pub const HEARTBEAT_TIMEOUT: &str = "States.HeartbeatTimeout";
    /// Generic Task failure; also a wildcard for non-timeout task errors.
    pub const TASK_FAILED: &str = "States.TaskFailed";
    /// Data-flow failure: path resolution, template evaluation, bad types.
    pub const RUNTIME: &str = "States.Runtime";
    /// No Choice rule matched and no `Default` was set.
    pub const NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";
    /// An intrinsic function failed at evaluation time.
    pub const INTRINSIC_FAILURE: &str = "States.IntrinsicFailure";
    /// A Parallel or Map branch failed without surfacing its own error.
    pub const BRANCH_FAILED: &str = "States.BranchFailed";
}

/// A failure raised by a state evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvent {
    /// Error name matched against `ErrorEquals`.
    pub error: String,
    /// Human readable cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl FailureEvent {
    pub fn new(error: impl Into<String>, cause: Option<String>) -> Self {
        Self {
            error: error.into(),
            cause,
        }
    }

    pub fn with_cause(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(error, Some(cause.into()))
    }

    pub fn timeout() -> Self {
        Self::new(names::TIMEOUT, None)
    }

    pub fn heartbeat_timeout() -> Self {
        Self::new(names::HEARTBEAT_TIMEOUT, None)
    }

    pub fn task_failed(cause: impl Into<String>) -> Self {
        Self::with_cause(names::TASK_FAILED, cause)
    }

    pub fn runtime(cause: impl Into<String>) -> Self {
        Self::with_cause(names::RUNTIME, cause)
    }

    pub fn intrinsic(cause: impl Into<String>) -> Self {
        Self::with_cause(names::INTRINSIC_FAILURE, cause)
    }

    pub fn no_choice_matched(state: &str) -> Self {
        Self::with_cause(
            names::NO_CHOICE_MATCHED,
            format!("no Choice rule matched and no Default is set in state '{state}'"),
        )
    }

    /// Returns true for failures that a retrier must never retry.
    pub fn is_terminal(&self) -> bool {
        self.error == names::RUNTIME || self.error == names::NO_CHOICE_MATCHED
    }

    /// Returns true if this failure is one of the timeout errors.
    pub fn is_timeout(&self) -> bool {
        self.error == names::TIMEOUT || self.error == names::HEARTBEAT_TIMEOUT
    }

    /// Returns true if `pattern` (an `ErrorEquals` entry) matches this failure.
    pub fn matches(&self, pattern: &str) -> bool {
        match pattern {
            names::ALL => true,
            names::TASK_FAILED => {
                self.error == names::TASK_FAILED
                    || !(self.is_timeout()
                        || self.is_terminal()
                        || self.error.starts_with("States."))
            }
            names::TIMEOUT => self.is_timeout(),
            // States.Runtime is only ever absorbed by States.ALL.
            names::RUNTIME => false,
            other => self.error == other,
        }
    }

    /// The document merged into state data when a catcher handles this failure.
    pub fn to_document(&self) -> Value {
        match &self.cause {
            Some(cause) => json!({ "Error": self.error, "Cause": cause }),
            None => json!({ "Error": self.error }),
        }
    }
}

impl fmt::Display for FailureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.error, cause),
            None => write!(f, "{}", self.error),
        }
    }
}
