//! Run state reconstruction engine.
//!
//! Orders, deduplicates, and applies an unreliable stream of trace messages
//! into per-run documents with bounded memory, checkpointed history, and
//! corruption detection. All mutation is synchronous and serialized per
//! message; only hash verification runs asynchronously, and its outcomes are
//! folded back in on the next poll.

pub mod checkpoint;
pub mod corruption;
pub mod cursor;
pub mod quarantine;
pub mod registry;
pub mod run;
pub mod scheduler;
pub mod sequence;
pub mod state;

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde_json::Value;

use crate::config::EngineConfig;
use crate::engine::checkpoint::BaseRef;
use crate::engine::corruption::{ordering_guard, HashVerifier, VerifyJob, VerifyOutcome};
use crate::engine::cursor::{view_model, Cursor, CursorState, ViewModel};
use crate::engine::quarantine::{Quarantine, QuarantinedMessage};
use crate::engine::registry::RunRegistry;
use crate::engine::run::{GraphSchema, HashMismatch, NodeState, RunState, StoredEvent};
use crate::engine::scheduler::{IngestQueue, DRAIN_BUDGET};
use crate::engine::sequence::{assign_sequence, DedupKey, Sequence};
use crate::wire::sanitize::sanitize_attributes;
use crate::wire::{
    AttrValue, CheckpointPayload, EventType, Payload, StateDiffPayload, TraceMessage,
};

/// What happened to one ingested message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Attributed to a run and recorded at the given sequence.
    Accepted { run_id: String, seq: Sequence },
    /// Dedup key already present; dropped with no side effects.
    Duplicate,
    /// No resolvable run identifier; summarized into quarantine.
    Quarantined,
}

/// The engine facade. Owns every run, the ingestion queue, the quarantine,
/// the cursor, and the verification pipeline.
pub struct TraceEngine {
    config: EngineConfig,
    registry: RunRegistry,
    quarantine: Quarantine,
    queue: IngestQueue,
    cursor: CursorState,
    verifier: HashVerifier,
}

impl TraceEngine {
    /// Create an engine with default limits. Requires a running tokio
    /// runtime (the verification worker is spawned here).
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            registry: RunRegistry::default(),
            quarantine: Quarantine::default(),
            queue: IngestQueue::default(),
            cursor: CursorState::default(),
            verifier: HashVerifier::spawn(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Queue a message for the next drain slice.
    pub fn enqueue(&mut self, msg: TraceMessage) {
        self.queue.push(msg);
    }

    /// Messages waiting in the ingestion queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drain the ingestion queue in time-boxed chunks, yielding back to the
    /// scheduler whenever the slice budget is exceeded so reads are never
    /// starved for more than one slice. Returns the number processed.
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        let mut slice_start = Instant::now();
        loop {
            let chunk = self.queue.next_chunk();
            if chunk.is_empty() {
                break;
            }
            for msg in chunk {
                self.process_message(msg);
                processed += 1;
            }
            if !self.queue.is_empty() && slice_start.elapsed() >= DRAIN_BUDGET {
                tokio::task::yield_now().await;
                slice_start = Instant::now();
            }
        }
        processed
    }

    /// Process one message synchronously.
    pub fn process_message(&mut self, msg: TraceMessage) -> IngestOutcome {
        self.poll_verifications();

        if msg.run_id.is_empty() {
            self.quarantine.push(&msg, "missing run id");
            return IngestOutcome::Quarantined;
        }

        let run_id = msg.run_id.clone();
        let max_runs = self.config.max_runs;
        let run = self
            .registry
            .get_or_create(&run_id, msg.timestamp_us, max_runs);

        let kind = msg.payload.kind();
        let message_id = stable_message_id(&msg.payload);

        // The stable-id check runs before sequence assignment so a duplicate
        // unsequenced delivery does not consume a synthetic sequence.
        if let Some(id) = message_id.as_deref().filter(|id| !id.is_empty()) {
            if run.is_duplicate(&DedupKey::MessageId(id.to_string())) {
                tracing::debug!(run_id = %run_id, message_id = %id, "dropping duplicate delivery");
                return IngestOutcome::Duplicate;
            }
        }

        let seq = assign_sequence(msg.producer_seq, &mut run.synthetic);
        let key = DedupKey::for_message(message_id.as_deref(), kind, seq);
        if run.is_duplicate(&key) {
            tracing::debug!(run_id = %run_id, seq = %seq, "dropping duplicate delivery");
            return IngestOutcome::Duplicate;
        }

        let mut event = StoredEvent {
            seq,
            timestamp_us: msg.timestamp_us,
            kind,
            message_id,
            event_type: EventType::Unknown,
            node_id: None,
            attributes: BTreeMap::new(),
            changed_paths: None,
            patch: None,
        };

        match msg.payload {
            Payload::Event(payload) => {
                event.event_type = payload.event_type;
                event.node_id = payload.node_id.clone();
                if payload.event_type == EventType::GraphStart {
                    extract_schema(run, &payload.attributes, self.config.max_schema_json_size_bytes);
                }
                event.attributes = sanitize_attributes(payload.attributes);
            }
            Payload::Telemetry { scope } => {
                event
                    .attributes
                    .insert("scope".to_string(), AttrValue::String(scope));
            }
            Payload::StateDiff(diff) => {
                apply_state_diff(run, &mut event, diff, &self.config, &self.verifier);
            }
            Payload::Checkpoint(cp) => {
                apply_checkpoint(run, &mut event, cp, &self.config);
            }
        }

        run.apply_lifecycle(&event);
        if let Some(oldest_real) = run.record_event(event, key, self.config.max_events_per_run) {
            run.checkpoints.prune_below(oldest_real);
        }
        self.cursor.observe(&run_id, seq);
        IngestOutcome::Accepted { run_id, seq }
    }

    /// Fold completed hash verifications into run state. Outcomes for runs
    /// evicted since submission are no-ops.
    pub fn poll_verifications(&mut self) {
        for outcome in self.verifier.poll() {
            match outcome {
                VerifyOutcome::Match { run_id, seq } => {
                    tracing::trace!(run_id = %run_id, seq, "state hash verified");
                }
                VerifyOutcome::Mismatch {
                    run_id,
                    seq,
                    timestamp_us,
                    expected,
                    actual,
                } => {
                    let Some(run) = self.registry.get_mut(&run_id) else {
                        continue;
                    };
                    run.corrupted = true;
                    run.hash_mismatch_count += 1;
                    if run.hash_mismatch.is_none() {
                        tracing::warn!(
                            run_id = %run_id,
                            seq,
                            expected = %hex::encode(&expected),
                            actual = %hex::encode(&actual),
                            "state hash mismatch"
                        );
                        run.hash_mismatch = Some(HashMismatch {
                            seq,
                            timestamp_us,
                            expected: hex::encode(expected),
                            actual: hex::encode(actual),
                        });
                    }
                }
                VerifyOutcome::Failed { run_id, seq, error } => {
                    let Some(run) = self.registry.get_mut(&run_id) else {
                        continue;
                    };
                    if !run.hash_verify_disabled {
                        tracing::warn!(
                            run_id = %run_id,
                            seq,
                            error = %error,
                            "hash verification failed; disabling for this run"
                        );
                        run.hash_verify_disabled = true;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_runs(&self) -> Vec<&RunState> {
        self.registry.iter().collect()
    }

    /// Runs sorted newest producer start time first (display order).
    pub fn get_runs_sorted(&self) -> Vec<&RunState> {
        let mut runs: Vec<&RunState> = self.registry.iter().collect();
        runs.sort_by(|a, b| {
            b.started_at_us
                .cmp(&a.started_at_us)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        runs
    }

    pub fn get_run(&self, run_id: &str) -> Option<&RunState> {
        self.registry.get(run_id)
    }

    pub fn get_quarantined(&self) -> Vec<&QuarantinedMessage> {
        self.quarantine.entries().collect()
    }

    pub fn clear_quarantine(&mut self) {
        self.quarantine.clear();
    }

    /// Reconstruct a run's document at a historical sequence.
    pub fn get_state_at(&self, run_id: &str, seq: Sequence) -> Option<Value> {
        self.registry.get(run_id).map(|run| state::state_at(run, seq))
    }

    /// Node states considering only events at or below `seq`.
    pub fn get_node_states_at(
        &self,
        run_id: &str,
        seq: Sequence,
    ) -> Option<HashMap<String, NodeState>> {
        self.registry.get(run_id).map(|run| run.node_states_at(seq))
    }

    pub fn get_seek_range(&self, run_id: &str) -> Option<(Sequence, Sequence)> {
        self.registry.get(run_id).and_then(RunState::seek_range)
    }

    pub fn is_seek_valid(&self, run_id: &str, seq: Sequence) -> bool {
        match self.get_seek_range(run_id) {
            Some((oldest, latest)) => seq >= oldest && seq <= latest,
            None => false,
        }
    }

    pub fn clamp_seq(&self, run_id: &str, seq: Sequence) -> Option<Sequence> {
        self.registry.get(run_id).map(|run| state::clamp_seq(run, seq))
    }

    // ========================================================================
    // Cursor & view projection
    // ========================================================================

    /// Explicit seek. Out-of-range targets are clamped with a warning, not
    /// rejected; an unknown run is ignored.
    pub fn set_cursor(&mut self, cursor: Cursor) {
        let Some(run) = self.registry.get(&cursor.run_id) else {
            tracing::warn!(run_id = %cursor.run_id, "ignoring cursor for unknown run");
            return;
        };
        let clamped = state::clamp_seq(run, cursor.seq);
        if clamped != cursor.seq {
            tracing::warn!(
                run_id = %cursor.run_id,
                requested = %cursor.seq,
                clamped = %clamped,
                "cursor out of seekable range; clamping"
            );
        }
        self.cursor.set(Cursor {
            run_id: cursor.run_id,
            seq: clamped,
        });
    }

    pub fn set_live_mode(&mut self, live: bool) {
        self.cursor.set_live(live);
    }

    pub fn is_live(&self) -> bool {
        self.cursor.is_live()
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.cursor()
    }

    /// View model of the cursor's run at the cursor position, or `None` when
    /// no message has established a cursor yet.
    pub fn get_view_model(&self) -> Option<ViewModel> {
        let cursor = self.cursor.cursor()?;
        let run = self.registry.get(&cursor.run_id)?;
        Some(view_model(run, Some(cursor.seq), self.cursor.is_live()))
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Flag every run as needing resync (e.g. after a transport reconnect
    /// where messages may have been missed).
    pub fn mark_runs_need_resync(&mut self, reason: &str) {
        tracing::warn!(reason = %reason, "marking all runs for resync");
        for run in self.registry.iter_mut() {
            run.needs_resync = true;
        }
    }

    /// Discard all run state, the ingestion queue, and the cursor. Pending
    /// verification work becomes a no-op on completion.
    pub fn clear_all_runs(&mut self) {
        self.registry.clear();
        self.queue.clear();
        self.cursor.reset();
    }
}

/// Stable message id for deduplication: the producer's id when present; for
/// checkpoints the checkpoint identifier is its stable identity.
fn stable_message_id(payload: &Payload) -> Option<String> {
    match payload {
        Payload::Event(event) => event.message_id.clone(),
        Payload::StateDiff(diff) => diff.message_id.clone(),
        Payload::Checkpoint(cp) => Some(hex::encode(&cp.checkpoint_id)),
        Payload::Telemetry { .. } => None,
    }
}

/// Pull the declared schema out of a GraphStart event's raw attributes,
/// before sanitization truncates the JSON.
fn extract_schema(
    run: &mut RunState,
    attributes: &HashMap<String, AttrValue>,
    max_schema_bytes: usize,
) {
    let Some(json) = attributes.get("graph_schema_json").and_then(AttrValue::as_str) else {
        return;
    };
    if json.len() > max_schema_bytes {
        tracing::warn!(
            run_id = %run.run_id,
            size = json.len(),
            max = max_schema_bytes,
            "ignoring oversized graph schema"
        );
        return;
    }
    match GraphSchema::parse(json) {
        Some(schema) => run.schema = Some(schema),
        None => {
            tracing::warn!(run_id = %run.run_id, "unparseable graph schema attribute");
        }
    }
}

/// Apply a state-diff message: full snapshot replace or patch apply, behind
/// the ordering guard.
fn apply_state_diff(
    run: &mut RunState,
    event: &mut StoredEvent,
    diff: StateDiffPayload,
    config: &EngineConfig,
    verifier: &HashVerifier,
) {
    if let Some(ref patch) = diff.patch {
        event.changed_paths = Some(state::changed_paths(patch));
    }

    // Provenance check is independent of ordering: a patch chained from a
    // checkpoint we never saw (or saw broken) taints time-travel correctness
    // even if the live apply succeeds.
    if let Some(ref base_id) = diff.base_checkpoint_id {
        if !base_id.is_empty() {
            let id = hex::encode(base_id);
            match run.checkpoints.base_ref(&id) {
                BaseRef::Valid => {}
                BaseRef::Invalid => {
                    tracing::warn!(
                        run_id = %run.run_id,
                        base_checkpoint = %id,
                        "patch chains from an invalid checkpoint"
                    );
                    run.needs_resync = true;
                }
                BaseRef::Missing => {
                    tracing::warn!(
                        run_id = %run.run_id,
                        base_checkpoint = %id,
                        "patch chains from an unknown checkpoint"
                    );
                    run.needs_resync = true;
                }
            }
        }
    }

    let real = match ordering_guard(run, event.seq) {
        Ok(real) => real,
        Err(rejection) => {
            tracing::warn!(
                run_id = %run.run_id,
                seq = %event.seq,
                "skipping state mutation: {rejection}"
            );
            run.needs_resync = true;
            run.corrupted = true;
            return;
        }
    };

    if let Some(ref bytes) = diff.full_state {
        // Snapshot replace: complete and self-certifying.
        match state::decode_document(bytes, config.max_full_state_size_bytes) {
            Ok(doc) => {
                run.latest_state = doc;
                run.last_applied_seq = Some(real);
                run.clear_fault_flags();
                run.checkpoints.record_seq(
                    real,
                    run.latest_state.clone(),
                    config.max_checkpoints_per_run,
                );
                run.applied_since_checkpoint = 0;
                schedule_verification(run, event, diff.state_hash, verifier);
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %run.run_id,
                    seq = real,
                    error = %e,
                    "undecodable full state snapshot"
                );
                run.corrupted = true;
                run.needs_resync = true;
            }
        }
        return;
    }

    let Some(patch) = diff.patch else {
        // A diff with neither snapshot nor patch carries nothing to apply.
        tracing::debug!(run_id = %run.run_id, seq = real, "empty state diff");
        return;
    };

    if let Some(failed_at) = run.patch_apply_failed {
        // Never apply an operation on top of known-bad state.
        tracing::debug!(
            run_id = %run.run_id,
            seq = real,
            failed_at,
            "patching suspended until a snapshot or valid checkpoint arrives"
        );
        return;
    }

    match json_patch::patch(&mut run.latest_state, &patch) {
        Ok(()) => {
            run.last_applied_seq = Some(real);
            event.patch = Some(patch);
            maybe_auto_checkpoint(run, real, config);
            schedule_verification(run, event, diff.state_hash, verifier);
        }
        Err(e) => {
            tracing::warn!(
                run_id = %run.run_id,
                seq = real,
                error = %e,
                "patch apply failed; suspending patching for this run"
            );
            run.patch_apply_failed = Some(real);
        }
    }
}

/// Apply a producer checkpoint message: a full snapshot keyed by checkpoint
/// identifier. Valid checkpoints re-anchor the live document; unusable ones
/// are tracked as invalid placeholders.
fn apply_checkpoint(
    run: &mut RunState,
    event: &mut StoredEvent,
    cp: CheckpointPayload,
    config: &EngineConfig,
) {
    let id = hex::encode(&cp.checkpoint_id);
    let real = match ordering_guard(run, event.seq) {
        Ok(real) => real,
        Err(rejection) => {
            tracing::warn!(
                run_id = %run.run_id,
                seq = %event.seq,
                checkpoint = %id,
                "skipping checkpoint: {rejection}"
            );
            run.needs_resync = true;
            run.corrupted = true;
            return;
        }
    };

    // The producer ships a checksum over the exact state bytes; verify it
    // synchronously while we still have them.
    if !cp.checksum.is_empty() {
        let actual = corruption::compute_bytes_hash(&cp.state);
        if actual != cp.checksum {
            tracing::warn!(
                run_id = %run.run_id,
                seq = real,
                checkpoint = %id,
                expected = %hex::encode(&cp.checksum),
                actual = %hex::encode(&actual),
                "checkpoint checksum mismatch"
            );
            run.corrupted = true;
            run.hash_mismatch_count += 1;
            if run.hash_mismatch.is_none() {
                run.hash_mismatch = Some(HashMismatch {
                    seq: real,
                    timestamp_us: event.timestamp_us,
                    expected: hex::encode(&cp.checksum),
                    actual: hex::encode(actual),
                });
            }
            run.checkpoints
                .record_id(id, real, None, config.max_checkpoints_per_run);
            return;
        }
    }

    match state::decode_document(&cp.state, config.max_checkpoint_state_size_bytes) {
        Ok(doc) => {
            run.latest_state = doc.clone();
            run.last_applied_seq = Some(real);
            run.clear_fault_flags();
            run.checkpoints
                .record_id(id, real, Some(doc), config.max_checkpoints_per_run);
            run.applied_since_checkpoint = 0;
        }
        Err(e) => {
            tracing::warn!(
                run_id = %run.run_id,
                seq = real,
                checkpoint = %id,
                error = %e,
                "unusable checkpoint state; tracking as invalid placeholder"
            );
            run.corrupted = true;
            run.needs_resync = true;
            run.checkpoints
                .record_id(id, real, None, config.max_checkpoints_per_run);
        }
    }
}

/// Take an automatic checkpoint every `checkpoint_interval` applied
/// sequences. An over-sized document is skipped with a warning rather than
/// crash the ingestion path.
fn maybe_auto_checkpoint(run: &mut RunState, seq: u64, config: &EngineConfig) {
    run.applied_since_checkpoint += 1;
    if run.applied_since_checkpoint < config.checkpoint_interval {
        return;
    }
    run.applied_since_checkpoint = 0;
    let approx = serde_json::to_vec(&run.latest_state).map(|b| b.len());
    match approx {
        Ok(size) if size > config.max_checkpoint_state_size_bytes => {
            tracing::warn!(
                run_id = %run.run_id,
                seq,
                size,
                max = config.max_checkpoint_state_size_bytes,
                "skipping oversized automatic checkpoint"
            );
        }
        Err(e) => {
            tracing::warn!(
                run_id = %run.run_id,
                seq,
                error = %e,
                "skipping automatic checkpoint: document not serializable"
            );
        }
        Ok(_) => {
            run.checkpoints.record_seq(
                seq,
                run.latest_state.clone(),
                config.max_checkpoints_per_run,
            );
            tracing::debug!(run_id = %run.run_id, seq, "automatic checkpoint");
        }
    }
}

/// Queue async hash verification for the just-applied mutation. The clone is
/// taken synchronously here so a later mutation can never race the check.
fn schedule_verification(
    run: &mut RunState,
    event: &StoredEvent,
    expected: Option<Vec<u8>>,
    verifier: &HashVerifier,
) {
    let Some(expected) = expected.filter(|h| !h.is_empty()) else {
        return;
    };
    if run.hash_verify_disabled {
        return;
    }
    if state::has_unsafe_numbers(&run.latest_state) {
        if !run.precision_warned {
            tracing::warn!(
                run_id = %run.run_id,
                "document holds integers beyond 2^53; skipping hash verification"
            );
            run.precision_warned = true;
        }
        return;
    }
    let Some(seq) = event.seq.real() else {
        return;
    };
    let job = VerifyJob {
        run_id: run.run_id.clone(),
        seq,
        timestamp_us: event.timestamp_us,
        expected,
        document: run.latest_state.clone(),
    };
    if verifier.submit(job).is_err() {
        tracing::warn!(
            run_id = %run.run_id,
            "verification worker unavailable; disabling for this run"
        );
        run.hash_verify_disabled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch_message(seq: u64, ops: serde_json::Value) -> TraceMessage {
        TraceMessage {
            run_id: "run".to_string(),
            producer_seq: seq,
            timestamp_us: seq as i64,
            payload: Payload::StateDiff(StateDiffPayload {
                message_id: None,
                patch: Some(serde_json::from_value(ops).expect("patch ops")),
                full_state: None,
                state_hash: None,
                base_checkpoint_id: None,
            }),
        }
    }

    #[test]
    fn interval_checkpoints_accumulate() {
        tokio_test::block_on(async {
            let mut engine = TraceEngine::with_config(EngineConfig {
                checkpoint_interval: 3,
                ..EngineConfig::default()
            });
            engine.process_message(TraceMessage {
                run_id: "run".to_string(),
                producer_seq: 1,
                timestamp_us: 1,
                payload: Payload::StateDiff(StateDiffPayload {
                    message_id: None,
                    patch: None,
                    full_state: Some(b"{}".to_vec()),
                    state_hash: None,
                    base_checkpoint_id: None,
                }),
            });
            for seq in 2..=8u64 {
                engine.process_message(patch_message(
                    seq,
                    json!([{ "op": "add", "path": format!("/k{seq}"), "value": seq }]),
                ));
            }
            // Snapshot at 1 plus interval checkpoints at the 3rd and 6th
            // applied patches (sequences 4 and 7).
            let run = engine.get_run("run").expect("run");
            assert_eq!(run.checkpoints.len(), 3);
            assert_eq!(run.checkpoints.best_at(6).map(|(s, _)| s), Some(4));
            assert_eq!(run.checkpoints.best_at(8).map(|(s, _)| s), Some(7));
        });
    }

    #[test]
    fn oversized_schema_attribute_is_ignored() {
        let mut run = RunState::new("run".into(), 0);
        let mut attributes = HashMap::new();
        attributes.insert(
            "graph_schema_json".to_string(),
            AttrValue::String(r#"{"nodes": ["a"]}"#.to_string()),
        );
        extract_schema(&mut run, &attributes, 4);
        assert!(run.schema.is_none());
        extract_schema(&mut run, &attributes, 4096);
        assert!(run.schema.is_some());
    }
}
