//! Typed messages consumed from the wire decoder.
//!
//! The decoder that turns raw bytes into these types lives outside this crate;
//! the engine only sees decoded, typed messages. Payload *contents* are still
//! untrusted: byte fields may be oversized, malformed, or refer to checkpoints
//! the client never saw.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One decoded telemetry message from the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceMessage {
    /// Run (thread) identifier. Empty when the producer failed to attribute
    /// the message; such messages go to quarantine.
    pub run_id: String,
    /// Producer-assigned sequence number. The protocol cannot distinguish
    /// "legitimately zero" from "missing": zero means absent.
    pub producer_seq: u64,
    /// Producer wall-clock timestamp (microseconds since the Unix epoch).
    pub timestamp_us: i64,
    pub payload: Payload,
}

/// Message payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Event(EventPayload),
    StateDiff(StateDiffPayload),
    Checkpoint(CheckpointPayload),
    /// Auxiliary telemetry (metrics, producer self-observability). Recorded
    /// in the event log but never mutates state.
    Telemetry { scope: String },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Event(_) => MessageKind::Event,
            Payload::StateDiff(_) => MessageKind::StateDiff,
            Payload::Checkpoint(_) => MessageKind::Checkpoint,
            Payload::Telemetry { .. } => MessageKind::Telemetry,
        }
    }
}

/// Coarse message kind, used in dedup keys and quarantine summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Event,
    StateDiff,
    Checkpoint,
    Telemetry,
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Event => "event",
            MessageKind::StateDiff => "state_diff",
            MessageKind::Checkpoint => "checkpoint",
            MessageKind::Telemetry => "telemetry",
        }
    }
}

/// A graph lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_type: EventType,
    /// Node the event refers to; empty for graph-level events.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Stable message identifier assigned by the producer, if any.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Execution duration reported by the producer, microseconds.
    #[serde(default)]
    pub duration_us: i64,
    /// Free-form attributes. Sanitized (size-capped) before entering the
    /// engine; `graph_name` and `graph_schema_json` ride in here on
    /// `GraphStart`.
    #[serde(default)]
    pub attributes: HashMap<String, AttrValue>,
}

/// Incremental state change, optionally falling back to a full snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDiffPayload {
    #[serde(default)]
    pub message_id: Option<String>,
    /// RFC 6902 patch against the previous document. Empty when
    /// `full_state` carries a snapshot instead.
    #[serde(default)]
    pub patch: Option<json_patch::Patch>,
    /// Serialized full document; the producer sends this when the diff was
    /// too large or could not be computed.
    #[serde(default)]
    pub full_state: Option<Vec<u8>>,
    /// SHA-256 of the serialized post-mutation document, for verification.
    #[serde(default)]
    pub state_hash: Option<Vec<u8>>,
    /// Identifier of the checkpoint this diff chains from.
    #[serde(default)]
    pub base_checkpoint_id: Option<Vec<u8>>,
}

/// Full state snapshot emitted at producer checkpoint intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub checkpoint_id: Vec<u8>,
    /// Serialized document bytes (JSON).
    pub state: Vec<u8>,
    /// SHA-256 of `state` as emitted by the producer.
    #[serde(default)]
    pub checksum: Vec<u8>,
}

/// Graph execution event types, mirroring the producer's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    GraphStart,
    GraphEnd,
    GraphError,
    NodeStart,
    NodeEnd,
    NodeError,
    EdgeTraversal,
    ConditionalBranch,
    ParallelStart,
    ParallelEnd,
    #[serde(other)]
    Unknown,
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            EventType::GraphStart => "graph_start",
            EventType::GraphEnd => "graph_end",
            EventType::GraphError => "graph_error",
            EventType::NodeStart => "node_start",
            EventType::NodeEnd => "node_end",
            EventType::NodeError => "node_error",
            EventType::EdgeTraversal => "edge_traversal",
            EventType::ConditionalBranch => "conditional_branch",
            EventType::ParallelStart => "parallel_start",
            EventType::ParallelEnd => "parallel_end",
            EventType::Unknown => "unknown",
        }
    }
}

/// Attribute values carried by events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Rough in-memory size, used for quarantine byte budgeting.
    pub fn approx_size(&self) -> usize {
        match self {
            AttrValue::String(s) => s.len(),
            AttrValue::Int(_) | AttrValue::Float(_) => 8,
            AttrValue::Bool(_) => 1,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}
