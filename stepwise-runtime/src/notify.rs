//! Execution status-change notifications.

use crate::execution::ExecutionStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

/// Published whenever an execution changes status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeRecord {
    pub execution_arn: String,
    pub state_machine_arn: String,
    pub name: String,
    pub status: ExecutionStatus,
    pub start_date: DateTime<Utc>,
    pub stop_date: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub cause: Option<String>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("status sink is closed")]
    Closed,

    #[error("failed to publish status change: {0}")]
    Failed(String),
}

/// Destination for status-change records.
///
/// Publishing failures are reported to the caller but never change an
/// execution's outcome.
pub trait StatusSink: Send + Sync {
    fn publish(&self, record: StatusChangeRecord) -> Result<(), PublishError>;
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn publish(&self, _record: StatusChangeRecord) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Filter for global subscriptions.
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    /// Only records for these state machine ARNs (empty = all).
    pub state_machines: Vec<String>,
    /// Only these statuses (empty = all).
    pub statuses: Vec<ExecutionStatus>,
}

impl StatusFilter {
    /// Returns true if the record matches this filter.
    pub fn matches(&self, record: &StatusChangeRecord) -> bool {
        (self.state_machines.is_empty() || self.state_machines.contains(&record.state_machine_arn))
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
    }
}

#[derive(Debug, Clone)]
pub enum SubscriptionType {
    /// Watch one execution.
    Execution { execution_arn: String },
    /// Watch every execution, optionally filtered.
    All { filter: StatusFilter },
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscription_id: String,
    pub subscription_type: SubscriptionType,
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct StatusReceiver {
    subscription_id: String,
    rx: broadcast::Receiver<StatusChangeRecord>,
    filter: Option<StatusFilter>,
    subscriptions: Arc<DashMap<String, Subscription>>,
}

impl StatusReceiver {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    fn accepts(&self, record: &StatusChangeRecord) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(record))
    }

    fn is_active(&self) -> bool {
        self.subscriptions.contains_key(&self.subscription_id)
    }

    /// Waits for the next matching record.
    ///
    /// Returns `None` once the channel closes or the subscription is removed.
    pub async fn recv(&mut self) -> Option<StatusChangeRecord> {
        loop {
            if !self.is_active() {
                return None;
            }
            match self.rx.recv().await {
                Ok(record) if self.accepts(&record) => return Some(record),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.subscription_id, skipped, "status subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered matching record without waiting.
    pub fn try_recv(&mut self) -> Option<StatusChangeRecord> {
        loop {
            if !self.is_active() {
                return None;
            }
            match self.rx.try_recv() {
                Ok(record) if self.accepts(&record) => return Some(record),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.subscription_id, skipped, "status subscriber lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for StatusReceiver {
    fn drop(&mut self) {
        self.subscriptions.remove(&self.subscription_id);
    }
}

/// Fans status changes out over broadcast channels.
pub struct BroadcastSink {
    /// Per-execution broadcast channels.
    channels: DashMap<String, broadcast::Sender<StatusChangeRecord>>,

    /// Global broadcast channel.
    global_sender: broadcast::Sender<StatusChangeRecord>,

    /// Subscription metadata.
    subscriptions: Arc<DashMap<String, Subscription>>,

    /// Channel capacity.
    channel_capacity: usize,
}

impl BroadcastSink {
    /// Creates a sink with the specified per-channel capacity.
    pub fn new(channel_capacity: usize) -> Self {
        let channel_capacity = channel_capacity.max(1);
        let (global_sender, _) = broadcast::channel(channel_capacity);
        Self {
            channels: DashMap::new(),
            global_sender,
            subscriptions: Arc::new(DashMap::new()),
            channel_capacity,
        }
    }

    fn register(&self, subscription_type: SubscriptionType) -> String {
        let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
        self.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                subscription_id: subscription_id.clone(),
                subscription_type,
            },
        );
        subscription_id
    }

    /// Subscribes to one execution's status changes.
    pub fn subscribe_execution(&self, execution_arn: &str) -> StatusReceiver {
        let rx = self
            .channels
            .entry(execution_arn.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe();

        let subscription_id = self.register(SubscriptionType::Execution {
            execution_arn: execution_arn.to_string(),
        });

        StatusReceiver {
            subscription_id,
            rx,
            filter: None,
            subscriptions: Arc::clone(&self.subscriptions),
        }
    }

    /// Subscribes to every execution's status changes that match `filter`.
    pub fn subscribe_all(&self, filter: StatusFilter) -> StatusReceiver {
        let rx = self.global_sender.subscribe();
        let subscription_id = self.register(SubscriptionType::All {
            filter: filter.clone(),
        });

        StatusReceiver {
            subscription_id,
            rx,
            filter: Some(filter),
            subscriptions: Arc::clone(&self.subscriptions),
        }
    }

    /// Removes a subscription; its receiver yields `None` afterwards.
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    pub fn get_subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.subscriptions.get(subscription_id).map(|r| r.clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl StatusSink for BroadcastSink {
    fn publish(&self, record: StatusChangeRecord) -> Result<(), PublishError> {
        // Send errors only mean nobody is listening.
        if record.status.is_terminal() {
            if let Some((_, sender)) = self.channels.remove(&record.execution_arn) {
                let _ = sender.send(record.clone());
            }
        } else if let Some(sender) = self.channels.get(&record.execution_arn) {
            let _ = sender.send(record.clone());
        }

        let _ = self.global_sender.send(record);
        Ok(())
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}
