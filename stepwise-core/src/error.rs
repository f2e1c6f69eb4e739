//! Core error types.

use thiserror::Error;

/// Errors from the definition compiler and the execution worker.
///
/// Runtime failures of a running program are not represented here; they
/// travel as [`FailureEvent`](crate::failure::FailureEvent) values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid definition at state '{state}': {reason}")]
    InvalidDefinition { state: String, reason: String },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid payload template field '{field}': {reason}")]
    InvalidTemplate { field: String, reason: String },

    #[error("invalid intrinsic function '{expr}': {reason}")]
    InvalidIntrinsic { expr: String, reason: String },

    #[error("invalid choice rule: {reason}")]
    InvalidChoiceRule { reason: String },

    #[error("execution worker already started")]
    WorkerAlreadyStarted,

    #[error("no active execution worker")]
    NoActiveWorker,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Builds an [`CoreError::InvalidDefinition`] for the given state.
    pub fn definition(state: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidDefinition {
            state: state.into(),
            reason: reason.into(),
        }
    }

    /// Attaches a state name to errors raised while compiling that state's fields.
    pub(crate) fn at_state(self, state: &str) -> Self {
        match self {
            CoreError::InvalidDefinition { state: owner, reason } if owner.is_empty() => {
                CoreError::definition(state, reason)
            }
            CoreError::InvalidDefinition { .. } => self,
            CoreError::WorkerAlreadyStarted | CoreError::NoActiveWorker => self,
            other => CoreError::definition(state, other.to_string()),
        }
    }

    /// Returns an error code suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::InvalidPath { .. } => "INVALID_DEFINITION",
            CoreError::InvalidTemplate { .. } => "INVALID_DEFINITION",
            CoreError::InvalidIntrinsic { .. } => "INVALID_DEFINITION",
            CoreError::InvalidChoiceRule { .. } => "INVALID_DEFINITION",
            CoreError::WorkerAlreadyStarted => "CONFLICT",
            CoreError::NoActiveWorker => "INVALID_STATE",
            CoreError::Json(_) => "INVALID_DEFINITION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_state_wraps_field_errors() {
        let err = CoreError::InvalidPath {
            path: "a.b".to_string(),
            reason: "must start with '$'".to_string(),
        }
        .at_state("Lookup");

        match err {
            CoreError::InvalidDefinition { state, reason } => {
                assert_eq!(state, "Lookup");
                assert!(reason.contains("a.b"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            CoreError::definition("X", "bad").error_code(),
            "INVALID_DEFINITION"
        );
        assert_eq!(CoreError::WorkerAlreadyStarted.error_code(), "CONFLICT");
        assert_eq!(CoreError::NoActiveWorker.error_code(), "INVALID_STATE");
    }
}
