use super::{io, sleep_or_cancel, Halt};
use crate::definition::{StateNode, WaitSpec};
use crate::environment::Environment;
use crate::failure::FailureEvent;
use crate::history::HistoryEventType;
use crate::path::type_name;
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{json, Value};
use std::time::Duration;

pub(super) async fn eval_wait(
    node: &StateNode,
    spec: &WaitSpec,
    input: Value,
    env: &mut Environment,
) -> Result<Value, Halt> {
    let effective = io::effective_input(node, &input, env)?;

    let duration = match spec {
        WaitSpec::Seconds(secs) => Duration::from_secs(*secs),
        WaitSpec::SecondsPath(path) => {
            let value = io::select(path, &effective, env)?;
            let secs = value.as_u64().ok_or_else(|| {
                FailureEvent::runtime(format!(
                    "SecondsPath '{path}' must select a non-negative integer, got {}",
                    type_name(&value)
                ))
            })?;
            Duration::from_secs(secs)
        }
        WaitSpec::Timestamp(ts) => until(ts),
        WaitSpec::TimestampPath(path) => {
            let value = io::select(path, &effective, env)?;
            let ts = value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .ok_or_else(|| {
                    FailureEvent::runtime(format!(
                        "TimestampPath '{path}' must select an RFC 3339 timestamp, got {value}"
                    ))
                })?;
            until(&ts)
        }
    };

    if !sleep_or_cancel(duration, &env.cancel).await {
        env.record(HistoryEventType::WaitStateAborted, json!({"name": node.name}));
        return Err(Halt::Stopped);
    }

    Ok(io::output(node, effective, env)?)
}

fn until(ts: &DateTime<FixedOffset>) -> Duration {
    (ts.with_timezone(&Utc) - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
}
