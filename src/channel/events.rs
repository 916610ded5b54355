// ABOUTME: Wire types for the subprocess line protocol — request envelopes and stream events.
// ABOUTME: Events are loosely typed; only the `type` discriminator is required.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event kind that ends the current pending request.
pub const RESULT_EVENT: &str = "result";

/// A single-line JSON request envelope written to the process's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: UserMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub role: String,
    pub content: String,
}

impl UserEnvelope {
    pub fn new(text: &str) -> Self {
        Self {
            kind: "user".to_string(),
            message: UserMessage {
                role: "user".to_string(),
                content: text.to_string(),
            },
        }
    }
}

/// One event read from the process's stdout.
///
/// Only `type` is required; everything else is optional, and fields this
/// crate does not model are kept in `extra`. A line that is not valid JSON
/// or lacks `type` entirely is discardable noise, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StreamEvent {
    /// Whether this event terminates the pending request.
    pub fn is_result(&self) -> bool {
        self.kind == RESULT_EVENT
    }

    /// Concatenated text fragments when this is an assistant turn, in block
    /// order. `None` for non-assistant events or turns without text blocks.
    pub fn assistant_text(&self) -> Option<String> {
        if self.kind != "assistant" {
            return None;
        }
        let content = self.message.as_ref()?.get("content")?.as_array()?;
        let mut text = String::new();
        for block in content {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(fragment) = block.get("text").and_then(Value::as_str) {
                    text.push_str(fragment);
                }
            }
        }
        if text.is_empty() { None } else { Some(text) }
    }
}

/// The resolution of one query: everything observed between issuing the
/// request and its terminal event.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    /// Session identifier latched from the event stream, if any event carried one.
    pub session_id: Option<String>,
    /// Every intermediate event observed while the request was pending, in arrival order.
    pub events: Vec<StreamEvent>,
    /// Concatenation of all assistant text fragments, in arrival order.
    pub text: String,
    /// The terminal event itself.
    pub result: StreamEvent,
}
