// ABOUTME: Channel module — live request/response link to an assistant subprocess.
// ABOUTME: Wire envelopes plus the single-pending-query process channel.

pub mod events;
pub mod process;

pub use events::{QueryResponse, RESULT_EVENT, StreamEvent, UserEnvelope, UserMessage};
pub use process::{ChannelEvent, ChannelOptions, ChannelState, ProcessChannel};
