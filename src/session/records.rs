// ABOUTME: Typed records for coding-assistant session logs (one JSON object per line).
// ABOUTME: Tolerates schema drift by keeping unrecognized fields in flattened maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded, shape-validated line from a session log.
///
/// The `type` discriminator selects the variant; a line whose `type` is
/// unrecognized, or whose body fails to decode, is noise to be dropped by the
/// caller. Unknown fields survive a decode/encode round trip via the `extra`
/// maps, so rewriting a log does not strip data this crate does not model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LogRecord {
    #[serde(rename = "user")]
    User(UserTurn),
    #[serde(rename = "assistant")]
    Assistant(AssistantTurn),
    #[serde(rename = "file-history-snapshot")]
    Snapshot(SnapshotMarker),
}

/// A user turn: prompt text or tool results sent back to the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTurn {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_sidechain: bool,
    pub message: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// An assistant turn wrapping the API-shaped message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantTurn {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_sidechain: bool,
    pub message: AssistantMessage,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The nested assistant message: model, stop reason, content blocks, usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Why the assistant stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    PauseTurn,
    Refusal,
    #[serde(other)]
    Unknown,
}

/// Token accounting attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A file-history snapshot marker interleaved with the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMarker {
    pub message_id: String,
    pub snapshot: Snapshot,
    #[serde(default)]
    pub is_snapshot_update: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The snapshot body: its own timestamp plus a map of backed-up files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub timestamp: String,
    #[serde(default)]
    pub tracked_file_backups: serde_json::Map<String, Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl LogRecord {
    /// The stable identifier for this record: `uuid` for turns, `messageId`
    /// for snapshot markers.
    pub fn id(&self) -> &str {
        match self {
            LogRecord::User(r) => &r.uuid,
            LogRecord::Assistant(r) => &r.uuid,
            LogRecord::Snapshot(r) => &r.message_id,
        }
    }

    /// The parent-link identifier, when the record has one.
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            LogRecord::User(r) => r.parent_uuid.as_deref(),
            LogRecord::Assistant(r) => r.parent_uuid.as_deref(),
            LogRecord::Snapshot(_) => None,
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            LogRecord::User(r) => &r.timestamp,
            LogRecord::Assistant(r) => &r.timestamp,
            LogRecord::Snapshot(r) => &r.snapshot.timestamp,
        }
    }

    /// The session identifier carried by this record, if any. Snapshot
    /// markers never carry one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            LogRecord::User(r) => r.session_id.as_deref(),
            LogRecord::Assistant(r) => r.session_id.as_deref(),
            LogRecord::Snapshot(_) => None,
        }
    }

    pub fn is_sidechain(&self) -> bool {
        match self {
            LogRecord::User(r) => r.is_sidechain,
            LogRecord::Assistant(r) => r.is_sidechain,
            LogRecord::Snapshot(_) => false,
        }
    }
}
