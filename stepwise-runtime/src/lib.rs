//! # stepwise-runtime
//!
//! Runtime layer for stepwise.
//!
//! This crate provides:
//! - State machine registry and execution lifecycle ([`WorkflowEngine`])
//! - Status-change notifications ([`BroadcastSink`])
//! - Configuration loading (YAML file + environment overrides)
//! - Emulated built-in resources for local runs

pub mod arn;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod notify;
pub mod resources;
pub mod state_machine;

pub use config::{Config, ConfigError};
pub use engine::{StartExecutionOutput, WorkflowEngine};
pub use error::RuntimeError;
pub use execution::{Execution, ExecutionDescription, ExecutionStatus, ExecutionSummary};
pub use notify::{
    BroadcastSink, NullSink, PublishError, StatusChangeRecord, StatusFilter, StatusReceiver,
    StatusSink,
};
pub use resources::{builtin_registry, register_builtins};
pub use state_machine::{StateMachine, StateMachineDescription, StateMachineSummary};
