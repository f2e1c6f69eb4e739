//! The context object exposed to `$$` paths.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionContext {
    pub id: String,
    pub input: Value,
    pub name: String,
    pub role_arn: String,
    pub start_time: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateMachineContext {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateContext {
    pub name: String,
    pub entered_time: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapItemContext {
    pub index: usize,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapContext {
    pub item: MapItemContext,
}

/// Execution metadata visible to `$$` paths.
///
/// Each child environment owns an independent copy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContextObject {
    pub execution: ExecutionContext,
    pub state_machine: StateMachineContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<StateContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<MapContext>,
}

impl ContextObject {
    pub fn new(execution: ExecutionContext, state_machine: StateMachineContext) -> Self {
        Self {
            execution,
            state_machine,
            state: None,
            map: None,
        }
    }

    /// Records entry into a state, resetting the retry count.
    pub fn enter_state(&mut self, name: &str) {
        self.state = Some(StateContext {
            name: name.to_string(),
            entered_time: format_timestamp(Utc::now()),
            retry_count: 0,
        });
    }

    pub fn set_retry_count(&mut self, retry_count: u32) {
        if let Some(state) = &mut self.state {
            state.retry_count = retry_count;
        }
    }

    pub fn set_map_item(&mut self, index: usize, value: Value) {
        self.map = Some(MapContext {
            item: MapItemContext { index, value },
        });
    }

    /// Renders the context object as a JSON document.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Formats a timestamp the way the context object and history expose it.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ContextObject {
        ContextObject::new(
            ExecutionContext {
                id: "arn:exec".to_string(),
                input: json!({"k": 1}),
                name: "run-1".to_string(),
                role_arn: "arn:role".to_string(),
                start_time: "2024-01-01T00:00:00.000Z".to_string(),
            },
            StateMachineContext {
                id: "arn:sm".to_string(),
                name: "orders".to_string(),
            },
        )
    }

    #[test]
    fn test_document_shape() {
        let doc = sample().to_value();
        assert_eq!(doc["Execution"]["Name"], "run-1");
        assert_eq!(doc["Execution"]["Input"], json!({"k": 1}));
        assert_eq!(doc["StateMachine"]["Name"], "orders");
        assert!(doc.get("State").is_none());
        assert!(doc.get("Map").is_none());
    }

    #[test]
    fn test_state_and_map_entries() {
        let mut ctx = sample();
        ctx.enter_state("Charge");
        ctx.set_retry_count(2);
        ctx.set_map_item(3, json!("x"));

        let doc = ctx.to_value();
        assert_eq!(doc["State"]["Name"], "Charge");
        assert_eq!(doc["State"]["RetryCount"], 2);
        assert_eq!(doc["Map"]["Item"], json!({"Index": 3, "Value": "x"}));

        ctx.enter_state("Next");
        assert_eq!(ctx.to_value()["State"]["RetryCount"], 0);
    }

    #[test]
    fn test_copies_are_independent() {
        let parent = sample();
        let mut child = parent.clone();
        child.set_map_item(0, json!(1));
        assert!(parent.map.is_none());
    }
}
