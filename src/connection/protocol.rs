//! Wire format of the push channel.
//!
//! Inbound messages are JSON objects with a `type` field. The payload is
//! either nested under `payload` or, as the server usually sends it, spread
//! over the remaining top-level fields.

use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::types::Identity;
use serde::Serialize;
use serde_json::{Map, Value};

/// Outbound registration sent on every successful open.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub user_id: u64,
    pub role: &'a str,
}

impl<'a> RegisterMessage<'a> {
    pub fn for_identity(identity: &'a Identity) -> Self {
        Self {
            kind: "register",
            user_id: identity.id.0,
            role: identity.role.as_str(),
        }
    }
}

/// Encode the registration message for `identity`.
pub fn register_message(identity: &Identity) -> Result<String> {
    Ok(serde_json::to_string(&RegisterMessage::for_identity(identity))?)
}

/// Decode one inbound text frame.
pub fn parse_message(text: &str) -> Result<SyncEvent> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| SyncError::MalformedMessage(format!("invalid JSON: {e}")))?;

    let Value::Object(mut fields) = value else {
        return Err(SyncError::MalformedMessage("expected an object".into()));
    };

    let kind = match fields.remove("type") {
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
        Some(_) => return Err(SyncError::MalformedMessage("`type` is not a string".into())),
        None => return Err(SyncError::MalformedMessage("missing `type`".into())),
    };

    let payload = match fields.remove("payload") {
        Some(Value::Object(nested)) => Value::Object(merge_scope(nested, &fields)),
        Some(Value::Null) | None => Value::Object(fields),
        Some(other) => other,
    };

    Ok(SyncEvent::from_push(&kind.to_ascii_uppercase(), payload))
}

/// Keep a top-level `userId` visible when the payload is nested.
fn merge_scope(mut nested: Map<String, Value>, outer: &Map<String, Value>) -> Map<String, Value> {
    for field in ["userId", "user_id"] {
        if let Some(value) = outer.get(field) {
            nested
                .entry(field.to_string())
                .or_insert_with(|| value.clone());
        }
    }
    nested
}
