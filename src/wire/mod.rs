pub mod message;
pub mod sanitize;

pub use message::{
    AttrValue, CheckpointPayload, EventPayload, EventType, MessageKind, Payload, StateDiffPayload,
    TraceMessage,
};
pub use sanitize::{sanitize_attributes, short_hex, truncate_str};
