//! Chat completion request payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An inbound chat completion request.
///
/// The payload is kept as an ordered JSON object rather than a fixed schema so
/// that fields the relay does not know about reach the upstream untouched.
/// The only field the relay ever writes is `stream`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ChatPayload(Map<String, Value>);

impl ChatPayload {
    /// Force `"stream": true`, whatever the caller sent.
    pub fn force_stream(&mut self) {
        self.0.insert("stream".to_string(), Value::Bool(true));
    }

    /// The `model` field, if present as a string. Used for logging only.
    pub fn model(&self) -> Option<&str> {
        self.0.get("model").and_then(Value::as_str)
    }

    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[cfg(test)]
    fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}
