//! Checkpoint retention for fast time travel.
//!
//! Two coherent indices over historical document snapshots: by sequence (for
//! `state_at` base selection) and by producer checkpoint identifier (for
//! validating the `base_checkpoint_id` provenance carried by patches). The
//! indices are always evicted together so an identifier never points at an
//! evicted sequence.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

/// An identifier-indexed checkpoint entry.
///
/// Invalid entries (snapshot failed to parse or exceeded the size cap) are
/// kept as placeholders with `valid = false` so patches chaining from them
/// can correctly detect an unusable base instead of a missing one.
#[derive(Debug, Clone)]
pub struct IdCheckpoint {
    pub seq: u64,
    pub state: Option<Value>,
    pub valid: bool,
}

/// Outcome of validating a patch's `base_checkpoint_id` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseRef {
    /// Identifier known and its snapshot is usable.
    Valid,
    /// Identifier known but its snapshot was unusable when it arrived.
    Invalid,
    /// Identifier never seen (or already evicted).
    Missing,
}

/// Per-run checkpoint store with bounded retention.
#[derive(Debug, Clone, Default)]
pub struct Checkpoints {
    by_seq: BTreeMap<u64, Value>,
    by_id: HashMap<String, IdCheckpoint>,
}

impl Checkpoints {
    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    pub fn id_len(&self) -> usize {
        self.by_id.len()
    }

    /// Record a sequence-indexed checkpoint (interval checkpoint or snapshot
    /// re-anchor), evicting oldest entries above `max`.
    pub fn record_seq(&mut self, seq: u64, state: Value, max: usize) {
        self.by_seq.insert(seq, state);
        self.enforce_cap(max);
    }

    /// Record a producer checkpoint under its identifier. Valid checkpoints
    /// also land in the sequence index; invalid ones only leave a placeholder.
    pub fn record_id(&mut self, id: String, seq: u64, state: Option<Value>, max: usize) {
        let valid = state.is_some();
        if let Some(ref doc) = state {
            self.by_seq.insert(seq, doc.clone());
        }
        self.by_id.insert(id, IdCheckpoint { seq, state, valid });
        self.enforce_cap(max);
    }

    /// Greatest checkpoint at or below `target`.
    pub fn best_at(&self, target: u64) -> Option<(u64, &Value)> {
        self.by_seq
            .range(..=target)
            .next_back()
            .map(|(seq, state)| (*seq, state))
    }

    /// Validate a `base_checkpoint_id` reference from a patch.
    pub fn base_ref(&self, id: &str) -> BaseRef {
        match self.by_id.get(id) {
            Some(entry) if entry.valid => BaseRef::Valid,
            Some(_) => BaseRef::Invalid,
            None => BaseRef::Missing,
        }
    }

    /// Drop checkpoints strictly older than `oldest_event_seq`, keeping the
    /// single nearest predecessor as the replay base for the oldest retained
    /// events. Identifier entries referencing dropped sequences go with them.
    pub fn prune_below(&mut self, oldest_event_seq: u64) {
        let keep = self
            .by_seq
            .range(..oldest_event_seq)
            .next_back()
            .map(|(seq, _)| *seq);
        let cutoff = match keep {
            Some(keep_seq) => keep_seq,
            None => return,
        };
        let dropped: Vec<u64> = self
            .by_seq
            .range(..cutoff)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &dropped {
            self.by_seq.remove(seq);
        }
        if !dropped.is_empty() {
            self.by_id.retain(|_, entry| !dropped.contains(&entry.seq));
            tracing::debug!(
                dropped = dropped.len(),
                kept_base = cutoff,
                "pruned checkpoints behind trimmed events"
            );
        }
    }

    /// Evict oldest checkpoints until both indices fit the cap.
    ///
    /// Assumes at most one identifier maps to a given sequence; if the
    /// protocol ever allows several, evict-by-sequence-then-match has to
    /// change.
    fn enforce_cap(&mut self, max: usize) {
        while self.by_seq.len() > max {
            if let Some((&seq, _)) = self.by_seq.iter().next() {
                self.by_seq.remove(&seq);
                self.by_id.retain(|_, entry| entry.seq != seq);
            }
        }
        // Invalid placeholders never enter the sequence index, so bound the
        // identifier index on its own as well.
        while self.by_id.len() > max {
            let oldest = self
                .by_id
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.by_id.remove(&id);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn best_at_picks_greatest_at_or_below() {
        let mut cps = Checkpoints::default();
        assert!(cps.is_empty());
        cps.record_seq(10, json!({"v": 10}), 100);
        cps.record_seq(20, json!({"v": 20}), 100);
        cps.record_seq(30, json!({"v": 30}), 100);

        assert_eq!(cps.best_at(25).map(|(s, _)| s), Some(20));
        assert_eq!(cps.best_at(20).map(|(s, _)| s), Some(20));
        assert_eq!(cps.best_at(9), None);
        assert_eq!(cps.best_at(100).map(|(s, _)| s), Some(30));
    }

    #[test]
    fn eviction_keeps_indices_coherent() {
        let mut cps = Checkpoints::default();
        for seq in 1..=5u64 {
            cps.record_id(format!("cp-{seq}"), seq, Some(json!({"v": seq})), 3);
        }
        assert_eq!(cps.len(), 3);
        assert_eq!(cps.id_len(), 3, "id index must shrink with the seq index");
        // Evicted sequences must not be reachable through the id index
        assert_eq!(cps.base_ref("cp-1"), BaseRef::Missing);
        assert_eq!(cps.base_ref("cp-2"), BaseRef::Missing);
        assert_eq!(cps.base_ref("cp-5"), BaseRef::Valid);
    }

    #[test]
    fn invalid_checkpoints_are_tracked_as_placeholders() {
        let mut cps = Checkpoints::default();
        cps.record_id("bad".to_string(), 7, None, 10);
        assert_eq!(cps.base_ref("bad"), BaseRef::Invalid);
        assert_eq!(cps.base_ref("unknown"), BaseRef::Missing);
        // Placeholders do not become replay bases
        assert_eq!(cps.best_at(100), None);
    }

    #[test]
    fn prune_keeps_nearest_predecessor() {
        let mut cps = Checkpoints::default();
        for seq in [5u64, 10, 15, 20] {
            cps.record_seq(seq, json!({"v": seq}), 100);
        }
        // Oldest retained event now at 17: drop 5 and 10, keep 15 as base
        cps.prune_below(17);
        assert_eq!(cps.best_at(16).map(|(s, _)| s), Some(15));
        assert_eq!(cps.best_at(14), None);
        assert_eq!(cps.len(), 2);
    }

    #[test]
    fn prune_with_no_predecessor_is_a_no_op() {
        let mut cps = Checkpoints::default();
        cps.record_seq(50, json!({}), 100);
        cps.prune_below(10);
        assert_eq!(cps.len(), 1);
    }
}
