//! # stepwise-core
//!
//! Workflow execution core for stepwise.
//!
//! This crate provides:
//! - Definition parsing and validation
//! - Data flow (paths, payload templates, intrinsic functions)
//! - Choice rule evaluation
//! - State behaviors with retry, catch, timeouts and cancellation
//! - Execution history and the execution worker

pub mod choice;
pub mod context;
pub mod definition;
pub mod environment;
pub mod error;
pub mod eval;
pub mod failure;
pub mod history;
pub mod intrinsic;
pub mod invoke;
pub mod path;
pub mod payload;
pub mod retry;
pub mod worker;

pub use choice::{ChoiceBranch, ChoiceRule};
pub use context::{ContextObject, ExecutionContext, StateMachineContext};
pub use definition::{Definition, StateKind, StateNode, StateType, Transition};
pub use environment::{EngineSettings, Environment, ProgramState, Services};
pub use error::CoreError;
pub use eval::run_program;
pub use failure::FailureEvent;
pub use history::{EventHistory, HistoryEvent, HistoryEventType};
pub use intrinsic::{BuiltinIntrinsics, IntrinsicEvaluator};
pub use invoke::{handler_fn, InvocationContext, ResourceHandler, ResourceInvoker, ResourceRegistry};
pub use path::JsonPath;
pub use payload::PayloadTemplate;
pub use retry::{Catcher, Retrier, RetryTracker};
pub use worker::{CompletionHandle, ExecutionWorker};
