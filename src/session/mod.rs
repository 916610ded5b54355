// ABOUTME: Session module — typed log records and the incremental JSONL reader.
// ABOUTME: Turns append-only conversation logs into ordered, tailable record sequences.

pub mod reader;
pub mod records;

pub use reader::{LineError, LogFile, LogReader, ReaderEvent};
pub use records::{AssistantTurn, LogRecord, SnapshotMarker, StopReason, TokenUsage, UserTurn};
