//! Registered state machines.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use stepwise_core::Definition;

/// Full description of a state machine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineDescription {
    pub state_machine_arn: String,
    pub name: String,
    pub status: &'static str,
    /// The definition document as JSON text.
    pub definition: String,
    pub role_arn: String,
    pub creation_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_date: Option<DateTime<Utc>>,
    pub checksum: String,
}

/// Listing entry for a state machine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineSummary {
    pub state_machine_arn: String,
    pub name: String,
    pub creation_date: DateTime<Utc>,
}

struct Revision {
    definition: Arc<Definition>,
    role_arn: String,
    update_date: Option<DateTime<Utc>>,
}

/// A named, compiled definition that executions are started from.
pub struct StateMachine {
    name: String,
    arn: String,
    creation_date: DateTime<Utc>,
    revision: RwLock<Revision>,
}

impl StateMachine {
    pub fn new(
        name: impl Into<String>,
        arn: impl Into<String>,
        definition: Definition,
        role_arn: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            arn: arn.into(),
            creation_date: Utc::now(),
            revision: RwLock::new(Revision {
                definition: Arc::new(definition),
                role_arn: role_arn.into(),
                update_date: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    /// The current definition. Executions hold on to the one they started with.
    pub fn definition(&self) -> Arc<Definition> {
        Arc::clone(&self.revision.read().definition)
    }

    pub fn role_arn(&self) -> String {
        self.revision.read().role_arn.clone()
    }

    /// Returns true if this machine was created from the same definition and role.
    pub fn is_identical(&self, definition: &Definition, role_arn: &str) -> bool {
        let revision = self.revision.read();
        revision.definition.checksum == definition.checksum && revision.role_arn == role_arn
    }

    /// Replaces the definition and/or role; returns the update date.
    pub fn update(&self, definition: Option<Definition>, role_arn: Option<String>) -> DateTime<Utc> {
        let now = Utc::now();
        let mut revision = self.revision.write();
        if let Some(definition) = definition {
            revision.definition = Arc::new(definition);
        }
        if let Some(role_arn) = role_arn {
            revision.role_arn = role_arn;
        }
        revision.update_date = Some(now);
        now
    }

    pub fn describe(&self) -> StateMachineDescription {
        let revision = self.revision.read();
        StateMachineDescription {
            state_machine_arn: self.arn.clone(),
            name: self.name.clone(),
            status: "ACTIVE",
            definition: revision.definition.raw.to_string(),
            role_arn: revision.role_arn.clone(),
            creation_date: self.creation_date,
            update_date: revision.update_date,
            checksum: revision.definition.checksum.clone(),
        }
    }

    pub fn summary(&self) -> StateMachineSummary {
        StateMachineSummary {
            state_machine_arn: self.arn.clone(),
            name: self.name.clone(),
            creation_date: self.creation_date,
        }
    }
}
