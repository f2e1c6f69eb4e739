//! Runtime error types.

use stepwise_core::CoreError;
use thiserror::Error;

/// Errors from the workflow engine's management operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("state machine does not exist: {arn}")]
    StateMachineNotFound { arn: String },

    #[error("state machine already exists with a different definition: {arn}")]
    StateMachineExists { arn: String },

    #[error("execution does not exist: {arn}")]
    ExecutionNotFound { arn: String },

    #[error("execution already exists: {arn}")]
    ExecutionAlreadyExists { arn: String },

    #[error("execution is not running: {arn}")]
    ExecutionNotRunning { arn: String },

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid ARN '{arn}': {reason}")]
    InvalidArn { arn: String, reason: String },

    #[error("invalid execution input: {reason}")]
    InvalidInput { reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Returns the AWS-style error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::StateMachineNotFound { .. } => "StateMachineDoesNotExist",
            RuntimeError::StateMachineExists { .. } => "StateMachineAlreadyExists",
            RuntimeError::ExecutionNotFound { .. } => "ExecutionDoesNotExist",
            RuntimeError::ExecutionAlreadyExists { .. } => "ExecutionAlreadyExists",
            RuntimeError::ExecutionNotRunning { .. } => "ExecutionNotRunning",
            RuntimeError::InvalidName { .. } => "InvalidName",
            RuntimeError::InvalidArn { .. } => "InvalidArn",
            RuntimeError::InvalidInput { .. } => "InvalidExecutionInput",
            RuntimeError::Core(CoreError::WorkerAlreadyStarted) => "ExecutionAlreadyExists",
            RuntimeError::Core(CoreError::NoActiveWorker) => "ExecutionNotRunning",
            RuntimeError::Core(_) => "InvalidDefinition",
            RuntimeError::Json(_) => "InvalidDefinition",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = RuntimeError::StateMachineNotFound {
            arn: "arn:aws:states:us-east-1:123456789012:stateMachine:m".to_string(),
        };
        assert_eq!(err.error_code(), "StateMachineDoesNotExist");

        let err = RuntimeError::from(CoreError::definition("A", "bad"));
        assert_eq!(err.error_code(), "InvalidDefinition");
        assert_eq!(err.to_string(), "invalid definition at state 'A': bad");

        let err = RuntimeError::from(CoreError::NoActiveWorker);
        assert_eq!(err.error_code(), "ExecutionNotRunning");
    }
}
