//! Per-run reconstructed state.
//!
//! One `RunState` exists per run identifier, owned exclusively by the run
//! registry. Everything here is synchronous bookkeeping: the event log, node
//! lifecycle, fault flags, and the current reconstructed document.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::engine::checkpoint::Checkpoints;
use crate::engine::sequence::{DedupKey, Sequence, SyntheticCounter};
use crate::wire::sanitize::{truncate_str, MAX_ERROR_BYTES};
use crate::wire::{AttrValue, EventType, MessageKind};

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Error,
}

/// Per-node execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Error,
}

/// Execution state of a single graph node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub started_at_us: Option<i64>,
    pub ended_at_us: Option<i64>,
    pub duration_us: Option<i64>,
    /// Truncated producer error text.
    pub error: Option<String>,
    pub start_seq: Option<Sequence>,
    pub end_seq: Option<Sequence>,
}

/// Declared graph schema, parsed from the `graph_schema_json` attribute of
/// the `GraphStart` event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSchema {
    pub nodes: Vec<String>,
    pub entry_point: Option<String>,
}

impl GraphSchema {
    /// Parse the UI schema JSON. Node entries may be bare strings or objects
    /// with an `id`/`name` field; anything else is skipped.
    pub fn parse(json: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(json).ok()?;
        let nodes = value
            .get("nodes")?
            .as_array()?
            .iter()
            .filter_map(|n| match n {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj
                    .get("id")
                    .or_else(|| obj.get("name"))
                    .and_then(Value::as_str)
                    .map(String::from),
                _ => None,
            })
            .collect();
        let entry_point = value
            .get("entry_point")
            .and_then(Value::as_str)
            .map(String::from);
        Some(Self { nodes, entry_point })
    }
}

/// First hash-mismatch diagnostics for a run. Subsequent mismatches only
/// bump the counter.
#[derive(Debug, Clone, Serialize)]
pub struct HashMismatch {
    pub seq: u64,
    pub timestamp_us: i64,
    pub expected: String,
    pub actual: String,
}

/// One retained message in a run's ordered event log.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub seq: Sequence,
    pub timestamp_us: i64,
    pub kind: MessageKind,
    pub message_id: Option<String>,
    pub event_type: EventType,
    pub node_id: Option<String>,
    pub attributes: BTreeMap<String, AttrValue>,
    /// Document paths touched by this message's patch, if any.
    pub changed_paths: Option<Vec<String>>,
    /// The patch as applied to the live document. Only populated for patches
    /// that were actually applied, so time-travel replay reproduces the live
    /// history exactly.
    pub patch: Option<json_patch::Patch>,
}

/// Reconstructed state of one tracked run.
#[derive(Debug)]
pub struct RunState {
    pub run_id: String,
    pub graph_name: Option<String>,
    pub schema: Option<GraphSchema>,
    pub status: RunStatus,
    /// Producer clock, first message for the run.
    pub started_at_us: i64,
    /// Monotonic arrival time; eviction key, immune to producer clock skew.
    pub arrival: Instant,
    pub ended_at_us: Option<i64>,

    /// Ordered ascending by sequence; ties keep insertion order.
    pub events: Vec<StoredEvent>,
    /// Always 1:1 with `events`.
    pub dedup_keys: HashSet<DedupKey>,
    pub synthetic: SyntheticCounter,

    /// Current reconstructed document.
    pub latest_state: Value,
    pub checkpoints: Checkpoints,
    /// Applied sequences since the last automatic checkpoint.
    pub applied_since_checkpoint: u64,

    pub needs_resync: bool,
    pub corrupted: bool,
    /// Sequence of the first failing patch; patching is suspended while set.
    pub patch_apply_failed: Option<u64>,
    /// Highest sequence at which state was successfully applied.
    pub last_applied_seq: Option<u64>,

    pub hash_mismatch: Option<HashMismatch>,
    pub hash_mismatch_count: u64,
    /// Verification permanently off for this run after an internal failure.
    pub hash_verify_disabled: bool,
    /// One-time warning latch for precision-limited documents.
    pub precision_warned: bool,

    pub node_states: HashMap<String, NodeState>,
    pub active_node: Option<String>,
    /// Every node identifier ever observed, declared or not.
    pub observed_nodes: HashSet<String>,
}

impl RunState {
    pub fn new(run_id: String, timestamp_us: i64) -> Self {
        Self {
            run_id,
            graph_name: None,
            schema: None,
            status: RunStatus::Running,
            started_at_us: timestamp_us,
            arrival: Instant::now(),
            ended_at_us: None,
            events: Vec::new(),
            dedup_keys: HashSet::new(),
            synthetic: SyntheticCounter::default(),
            latest_state: Value::Object(serde_json::Map::new()),
            checkpoints: Checkpoints::default(),
            applied_since_checkpoint: 0,
            needs_resync: false,
            corrupted: false,
            patch_apply_failed: None,
            last_applied_seq: None,
            hash_mismatch: None,
            hash_mismatch_count: 0,
            hash_verify_disabled: false,
            precision_warned: false,
            node_states: HashMap::new(),
            active_node: None,
            observed_nodes: HashSet::new(),
        }
    }

    /// Whether a dedup key is already present (idempotent re-delivery).
    pub fn is_duplicate(&self, key: &DedupKey) -> bool {
        self.dedup_keys.contains(key)
    }

    /// Insert an event keeping the log sorted, register its dedup key, and
    /// trim the oldest events above `max_events`. Returns the oldest retained
    /// real sequence when trimming happened, so the caller can prune
    /// checkpoints behind it.
    pub fn record_event(
        &mut self,
        event: StoredEvent,
        key: DedupKey,
        max_events: usize,
    ) -> Option<u64> {
        self.dedup_keys.insert(key);

        // Append fast path; otherwise position search so the log stays
        // sorted without re-sorting. Ties land after existing equals.
        let seq = event.seq;
        match self.events.last() {
            Some(last) if last.seq > seq => {
                let pos = self.events.partition_point(|e| e.seq <= seq);
                self.events.insert(pos, event);
            }
            _ => self.events.push(event),
        }

        if self.events.len() <= max_events {
            return None;
        }
        let excess = self.events.len() - max_events;
        for trimmed in self.events.drain(..excess) {
            let trimmed_key = DedupKey::for_message(
                trimmed.message_id.as_deref(),
                trimmed.kind,
                trimmed.seq,
            );
            self.dedup_keys.remove(&trimmed_key);
        }
        self.events.first().and_then(|e| e.seq.real())
    }

    /// Fold a lifecycle event into run/node status.
    pub fn apply_lifecycle(&mut self, event: &StoredEvent) {
        match event.event_type {
            EventType::GraphStart => {
                self.status = RunStatus::Running;
                if let Some(name) = event.attributes.get("graph_name").and_then(AttrValue::as_str)
                {
                    self.graph_name = Some(name.to_string());
                }
            }
            EventType::GraphEnd => {
                self.status = RunStatus::Completed;
                self.ended_at_us = Some(event.timestamp_us);
                self.active_node = None;
            }
            EventType::GraphError => {
                self.status = RunStatus::Error;
                self.ended_at_us = Some(event.timestamp_us);
                self.active_node = None;
            }
            _ => {}
        }
        if let Some(node) = event.node_id.as_deref().filter(|n| !n.is_empty()) {
            self.observed_nodes.insert(node.to_string());
        }
        apply_node_transition(&mut self.node_states, &mut self.active_node, event);
    }

    /// Recompute node states considering only events at or below `seq`.
    ///
    /// Read-path companion to `state_at`; never touches the live maps.
    pub fn node_states_at(&self, seq: Sequence) -> HashMap<String, NodeState> {
        let mut nodes = HashMap::new();
        let mut active = None;
        for event in self.events.iter().filter(|e| e.seq <= seq) {
            apply_node_transition(&mut nodes, &mut active, event);
        }
        nodes
    }

    /// Node names observed on the stream but absent from the declared schema.
    pub fn undeclared_nodes(&self) -> Vec<String> {
        let declared: HashSet<&str> = self
            .schema
            .as_ref()
            .map(|s| s.nodes.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let mut names: Vec<String> = self
            .observed_nodes
            .iter()
            .filter(|n| !declared.contains(n.as_str()))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// A valid snapshot or valid identifier checkpoint is self-certifying:
    /// it re-anchors state and clears every fault flag.
    pub fn clear_fault_flags(&mut self) {
        self.needs_resync = false;
        self.corrupted = false;
        self.patch_apply_failed = None;
    }

    /// Producer start time as a wall-clock timestamp, when representable.
    pub fn started_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_micros(self.started_at_us)
    }

    /// Producer end time, once the run completed or errored.
    pub fn ended_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.ended_at_us
            .and_then(chrono::DateTime::from_timestamp_micros)
    }

    /// Sequence range currently seekable: `[oldest, latest]` over the log.
    pub fn seek_range(&self) -> Option<(Sequence, Sequence)> {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => Some((first.seq, last.seq)),
            _ => None,
        }
    }
}

/// Shared node transition rules, used for both the live maps and read-path
/// reconstruction at a historical sequence.
fn apply_node_transition(
    nodes: &mut HashMap<String, NodeState>,
    active: &mut Option<String>,
    event: &StoredEvent,
) {
    let node_id = match event.node_id.as_deref().filter(|n| !n.is_empty()) {
        Some(id) => id,
        None => return,
    };
    match event.event_type {
        EventType::NodeStart => {
            let node = nodes.entry(node_id.to_string()).or_default();
            node.status = NodeStatus::Active;
            node.started_at_us = Some(event.timestamp_us);
            node.start_seq = Some(event.seq);
            *active = Some(node_id.to_string());
        }
        EventType::NodeEnd => {
            let node = nodes.entry(node_id.to_string()).or_default();
            node.status = NodeStatus::Completed;
            node.ended_at_us = Some(event.timestamp_us);
            node.end_seq = Some(event.seq);
            node.duration_us = node
                .started_at_us
                .map(|start| event.timestamp_us - start)
                .filter(|d| *d >= 0);
            if active.as_deref() == Some(node_id) {
                *active = None;
            }
        }
        EventType::NodeError => {
            let node = nodes.entry(node_id.to_string()).or_default();
            node.status = NodeStatus::Error;
            node.ended_at_us = Some(event.timestamp_us);
            node.end_seq = Some(event.seq);
            node.error = event
                .attributes
                .get("error")
                .and_then(AttrValue::as_str)
                .map(|e| truncate_str(e, MAX_ERROR_BYTES).to_string());
            if active.as_deref() == Some(node_id) {
                *active = None;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: Sequence, event_type: EventType, node: Option<&str>) -> StoredEvent {
        StoredEvent {
            seq,
            timestamp_us: 1_000,
            kind: MessageKind::Event,
            message_id: None,
            event_type,
            node_id: node.map(String::from),
            attributes: BTreeMap::new(),
            changed_paths: None,
            patch: None,
        }
    }

    #[test]
    fn events_stay_sorted_under_reordered_insertion() {
        let mut run = RunState::new("r".into(), 0);
        for seq in [5u64, 1, 3, 2, 4] {
            let e = event(Sequence::Real(seq), EventType::NodeStart, Some("n"));
            let key = DedupKey::KindSeq(MessageKind::Event, e.seq);
            run.record_event(e, key, 100);
        }
        let seqs: Vec<_> = run.events.iter().map(|e| e.seq).collect();
        assert_eq!(
            seqs,
            vec![
                Sequence::Real(1),
                Sequence::Real(2),
                Sequence::Real(3),
                Sequence::Real(4),
                Sequence::Real(5)
            ]
        );
    }

    #[test]
    fn trimming_keeps_dedup_set_in_step() {
        let mut run = RunState::new("r".into(), 0);
        for seq in 1..=5u64 {
            let e = event(Sequence::Real(seq), EventType::NodeStart, Some("n"));
            let key = DedupKey::KindSeq(MessageKind::Event, e.seq);
            run.record_event(e, key, 3);
        }
        assert_eq!(run.events.len(), 3);
        assert_eq!(run.dedup_keys.len(), 3);
        assert_eq!(run.events.first().map(|e| e.seq), Some(Sequence::Real(3)));
        // Trimmed keys can be re-delivered without being flagged duplicate
        assert!(!run.is_duplicate(&DedupKey::KindSeq(
            MessageKind::Event,
            Sequence::Real(1)
        )));
    }

    #[test]
    fn node_lifecycle_transitions() {
        let mut run = RunState::new("r".into(), 0);
        let start = event(Sequence::Real(1), EventType::NodeStart, Some("fetch"));
        run.apply_lifecycle(&start);
        assert_eq!(run.active_node.as_deref(), Some("fetch"));
        assert_eq!(
            run.node_states.get("fetch").map(|n| n.status),
            Some(NodeStatus::Active)
        );

        let mut end = event(Sequence::Real(2), EventType::NodeEnd, Some("fetch"));
        end.timestamp_us = 5_000;
        run.apply_lifecycle(&end);
        assert_eq!(run.active_node, None);
        let node = run.node_states.get("fetch").expect("node");
        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.duration_us, Some(4_000));
    }

    #[test]
    fn node_states_at_sees_only_the_past() {
        let mut run = RunState::new("r".into(), 0);
        for (seq, ty) in [
            (1u64, EventType::NodeStart),
            (2, EventType::NodeEnd),
            (3, EventType::NodeStart),
        ] {
            let e = event(Sequence::Real(seq), ty, Some("fetch"));
            let key = DedupKey::KindSeq(MessageKind::Event, e.seq);
            run.record_event(e.clone(), key, 100);
            run.apply_lifecycle(&e);
        }
        // Live: restarted, active again
        assert_eq!(
            run.node_states.get("fetch").map(|n| n.status),
            Some(NodeStatus::Active)
        );
        // At seq 2 the node had completed
        let past = run.node_states_at(Sequence::Real(2));
        assert_eq!(
            past.get("fetch").map(|n| n.status),
            Some(NodeStatus::Completed)
        );
    }

    #[test]
    fn undeclared_nodes_against_schema() {
        let mut run = RunState::new("r".into(), 0);
        run.schema = GraphSchema::parse(
            r#"{"nodes": [{"id": "fetch"}, {"id": "render"}], "entry_point": "fetch"}"#,
        );
        run.observed_nodes.insert("fetch".to_string());
        run.observed_nodes.insert("mystery".to_string());
        assert_eq!(run.undeclared_nodes(), vec!["mystery".to_string()]);
    }

    #[test]
    fn schema_accepts_bare_string_nodes() {
        let schema = GraphSchema::parse(r#"{"nodes": ["a", "b"]}"#).expect("schema");
        assert_eq!(schema.nodes, vec!["a", "b"]);
        assert_eq!(schema.entry_point, None);
    }
}
