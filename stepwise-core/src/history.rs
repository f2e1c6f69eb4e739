//! Execution history: the ordered, append-only event log of an execution.

use crate::context::format_timestamp;
use crate::definition::StateType;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Type of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistoryEventType {
    // ===== Execution =====
    ExecutionStarted,
    ExecutionSucceeded,
    ExecutionFailed,
    ExecutionAborted,
    ExecutionTimedOut,

    // ===== State transitions =====
    PassStateEntered,
    PassStateExited,
    TaskStateEntered,
    TaskStateExited,
    TaskStateAborted,
    ChoiceStateEntered,
    ChoiceStateExited,
    WaitStateEntered,
    WaitStateExited,
    WaitStateAborted,
    SucceedStateEntered,
    SucceedStateExited,
    FailStateEntered,
    ParallelStateEntered,
    ParallelStateExited,
    MapStateEntered,
    MapStateExited,

    // ===== Tasks =====
    TaskScheduled,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    TaskTimedOut,
    RetryScheduled,

    // ===== Parallel =====
    ParallelStateStarted,
    ParallelStateSucceeded,
    ParallelStateFailed,
    ParallelStateAborted,

    // ===== Map =====
    MapStateStarted,
    MapStateSucceeded,
    MapStateFailed,
    MapStateAborted,
    MapIterationStarted,
    MapIterationSucceeded,
    MapIterationFailed,
    MapIterationAborted,
}

impl HistoryEventType {
    pub fn state_entered(state_type: StateType) -> Self {
        match state_type {
            StateType::Pass => HistoryEventType::PassStateEntered,
            StateType::Task => HistoryEventType::TaskStateEntered,
            StateType::Choice => HistoryEventType::ChoiceStateEntered,
            StateType::Wait => HistoryEventType::WaitStateEntered,
            StateType::Succeed => HistoryEventType::SucceedStateEntered,
            StateType::Fail => HistoryEventType::FailStateEntered,
            StateType::Parallel => HistoryEventType::ParallelStateEntered,
            StateType::Map => HistoryEventType::MapStateEntered,
        }
    }

    /// Returns `None` for Fail states, which never exit.
    pub fn state_exited(state_type: StateType) -> Option<Self> {
        Some(match state_type {
            StateType::Pass => HistoryEventType::PassStateExited,
            StateType::Task => HistoryEventType::TaskStateExited,
            StateType::Choice => HistoryEventType::ChoiceStateExited,
            StateType::Wait => HistoryEventType::WaitStateExited,
            StateType::Succeed => HistoryEventType::SucceedStateExited,
            StateType::Fail => return None,
            StateType::Parallel => HistoryEventType::ParallelStateExited,
            StateType::Map => HistoryEventType::MapStateExited,
        })
    }

    /// Returns true for the events that close an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HistoryEventType::ExecutionSucceeded
                | HistoryEventType::ExecutionFailed
                | HistoryEventType::ExecutionAborted
                | HistoryEventType::ExecutionTimedOut
        )
    }
}

impl fmt::Display for HistoryEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub id: u64,
    /// Id of the event that caused this one; `0` for the first event.
    pub previous_event_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: HistoryEventType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl HistoryEvent {
    /// Timestamp rendered with millisecond precision.
    pub fn timestamp_string(&self) -> String {
        format_timestamp(self.timestamp)
    }
}

#[derive(Debug, Default)]
struct HistoryLog {
    events: Vec<HistoryEvent>,
    last_id: u64,
}

/// Shared handle to an execution's event log.
///
/// Clones share the same log; ids strictly increase across all writers.
#[derive(Debug, Clone, Default)]
pub struct EventHistory {
    inner: Arc<Mutex<HistoryLog>>,
}

impl EventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event and returns its id.
    pub fn append(
        &self,
        previous_event_id: u64,
        event_type: HistoryEventType,
        details: Value,
    ) -> u64 {
        let mut log = self.inner.lock();
        log.last_id += 1;
        let id = log.last_id;
        log.events.push(HistoryEvent {
            id,
            previous_event_id,
            timestamp: Utc::now(),
            event_type,
            details,
        });
        id
    }

    /// Returns a snapshot of all events, in id order.
    pub fn events(&self) -> Vec<HistoryEvent> {
        self.inner.lock().events.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the most recent event, `0` when empty.
    pub fn last_id(&self) -> u64 {
        self.inner.lock().last_id
    }
}
