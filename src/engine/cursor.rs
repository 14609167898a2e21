//! Read position tracking and the render-ready view projection.
//!
//! The cursor is the only piece of state the read path owns. In live mode it
//! follows the stream monotonically; paused, it goes wherever the consumer
//! seeks (clamped into the run's range). Everything else here is a pure
//! projection over a `RunState`.

use std::collections::HashMap;

use serde_json::Value;

use crate::engine::run::{GraphSchema, NodeState, RunState, RunStatus};
use crate::engine::sequence::Sequence;
use crate::engine::state;

/// The read position: one run, one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub run_id: String,
    pub seq: Sequence,
}

/// Live/paused cursor state machine.
#[derive(Debug)]
pub struct CursorState {
    cursor: Option<Cursor>,
    live: bool,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            cursor: None,
            live: true,
        }
    }
}

impl CursorState {
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }

    /// Live-mode advance. Within the current run the cursor never moves
    /// backward; a message from a different run takes the cursor over.
    pub fn observe(&mut self, run_id: &str, seq: Sequence) {
        if !self.live {
            return;
        }
        match &mut self.cursor {
            Some(cursor) if cursor.run_id == run_id => {
                if seq > cursor.seq {
                    cursor.seq = seq;
                }
            }
            _ => {
                self.cursor = Some(Cursor {
                    run_id: run_id.to_string(),
                    seq,
                });
            }
        }
    }

    /// Explicit seek, used in paused mode. The caller clamps first.
    pub fn set(&mut self, cursor: Cursor) {
        self.cursor = Some(cursor);
    }

    pub fn reset(&mut self) {
        self.cursor = None;
        self.live = true;
    }
}

/// Render-ready projection of one run at the cursor.
#[derive(Debug)]
pub struct ViewModel {
    pub run_id: String,
    pub graph_name: Option<String>,
    pub status: RunStatus,
    pub schema: Option<GraphSchema>,
    pub node_states: HashMap<String, NodeState>,
    pub active_node: Option<String>,
    /// Live document, or the reconstruction at the cursor when paused.
    pub document: Value,
    /// Paths changed by the event at the cursor's sequence, if any.
    pub changed_paths: Option<Vec<String>>,
    /// Nodes observed on the stream but missing from the declared schema.
    pub undeclared_nodes: Vec<String>,
    pub cursor_seq: Option<Sequence>,
    pub live: bool,
    pub corrupted: bool,
    pub needs_resync: bool,
    pub patch_apply_failed: Option<u64>,
}

/// Project a run into its view model at the given cursor position.
pub fn view_model(run: &RunState, cursor_seq: Option<Sequence>, live: bool) -> ViewModel {
    let (document, node_states, active_node) = match cursor_seq {
        Some(seq) if !live => {
            let nodes = run.node_states_at(seq);
            let active = nodes
                .iter()
                .find(|(_, n)| n.status == crate::engine::run::NodeStatus::Active)
                .map(|(name, _)| name.clone());
            (state::state_at(run, seq), nodes, active)
        }
        _ => (
            run.latest_state.clone(),
            run.node_states.clone(),
            run.active_node.clone(),
        ),
    };

    let changed_paths = cursor_seq.and_then(|seq| {
        run.events
            .iter()
            .rev()
            .find(|e| e.seq == seq)
            .and_then(|e| e.changed_paths.clone())
    });

    ViewModel {
        run_id: run.run_id.clone(),
        graph_name: run.graph_name.clone(),
        status: run.status,
        schema: run.schema.clone(),
        node_states,
        active_node,
        document,
        changed_paths,
        undeclared_nodes: run.undeclared_nodes(),
        cursor_seq,
        live,
        corrupted: run.corrupted,
        needs_resync: run.needs_resync,
        patch_apply_failed: run.patch_apply_failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_cursor_is_monotonic_within_a_run() {
        let mut cursor = CursorState::default();
        cursor.observe("a", Sequence::Real(5));
        cursor.observe("a", Sequence::Real(3));
        assert_eq!(
            cursor.cursor().map(|c| c.seq),
            Some(Sequence::Real(5)),
            "lower sequence must not move the cursor backward"
        );
        cursor.observe("a", Sequence::Real(5));
        assert_eq!(cursor.cursor().map(|c| c.seq), Some(Sequence::Real(5)));
        cursor.observe("a", Sequence::Real(8));
        assert_eq!(cursor.cursor().map(|c| c.seq), Some(Sequence::Real(8)));
    }

    #[test]
    fn different_run_takes_over_the_cursor() {
        let mut cursor = CursorState::default();
        cursor.observe("a", Sequence::Real(100));
        cursor.observe("b", Sequence::Real(1));
        let c = cursor.cursor().expect("cursor");
        assert_eq!(c.run_id, "b");
        assert_eq!(c.seq, Sequence::Real(1));
    }

    #[test]
    fn paused_cursor_ignores_the_stream() {
        let mut cursor = CursorState::default();
        cursor.observe("a", Sequence::Real(5));
        cursor.set_live(false);
        cursor.observe("a", Sequence::Real(50));
        assert_eq!(cursor.cursor().map(|c| c.seq), Some(Sequence::Real(5)));
    }
}
