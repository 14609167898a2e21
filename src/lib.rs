//! tracedeck: client-side run-state reconstruction for streaming execution
//! traces.
//!
//! Ingests an unordered, possibly duplicated, possibly malformed stream of
//! telemetry about running computation graphs and maintains a consistent,
//! time-travelable, memory-bounded view of each run's state.

pub mod config;
pub mod engine;
pub mod error;
pub mod wire;

pub use config::EngineConfig;
pub use engine::cursor::{Cursor, ViewModel};
pub use engine::quarantine::QuarantinedMessage;
pub use engine::run::{
    GraphSchema, HashMismatch, NodeState, NodeStatus, RunState, RunStatus, StoredEvent,
};
pub use engine::sequence::Sequence;
pub use engine::{IngestOutcome, TraceEngine};
pub use error::DecodeError;
pub use wire::{
    AttrValue, CheckpointPayload, EventPayload, EventType, MessageKind, Payload, StateDiffPayload,
    TraceMessage,
};
