//! Quarantine for messages that cannot be attributed to a run.
//!
//! Bounded FIFO of message summaries; the original payload is never
//! retained. Oldest entries are evicted when either the count cap or the
//! byte budget is exceeded.

use std::collections::VecDeque;

use serde::Serialize;

use crate::wire::sanitize::{short_hex, truncate_str, MAX_ATTR_KEY_BYTES};
use crate::wire::{MessageKind, Payload, TraceMessage};

/// Maximum quarantined summaries retained.
pub const MAX_QUARANTINE_ENTRIES: usize = 256;
/// Byte budget across all retained summaries.
pub const MAX_QUARANTINE_BYTES: usize = 64 * 1024;
/// Attribute keys listed per summary.
const MAX_SUMMARY_KEYS: usize = 8;

/// Bounded summary of an unattributable message.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedMessage {
    pub kind: MessageKind,
    pub reason: String,
    /// Rough payload size, for operators sizing the problem.
    pub approx_size: usize,
    /// Truncated stable identifier, when the message carried one.
    pub message_id: Option<String>,
    /// Truncated list of attribute keys present on the message.
    pub attribute_keys: Vec<String>,
}

impl QuarantinedMessage {
    fn approx_bytes(&self) -> usize {
        self.reason.len()
            + self.message_id.as_ref().map_or(0, String::len)
            + self.attribute_keys.iter().map(String::len).sum::<usize>()
            + 32
    }
}

#[derive(Debug, Default)]
pub struct Quarantine {
    entries: VecDeque<QuarantinedMessage>,
    total_bytes: usize,
}

impl Quarantine {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summarize and hold a message, evicting oldest entries to stay within
    /// the count cap and byte budget.
    pub fn push(&mut self, msg: &TraceMessage, reason: &str) {
        let summary = summarize(msg, reason);
        tracing::warn!(
            kind = summary.kind.name(),
            reason = %summary.reason,
            approx_size = summary.approx_size,
            "quarantining unattributable message"
        );
        self.total_bytes += summary.approx_bytes();
        self.entries.push_back(summary);
        while self.entries.len() > MAX_QUARANTINE_ENTRIES
            || (self.total_bytes > MAX_QUARANTINE_BYTES && self.entries.len() > 1)
        {
            if let Some(evicted) = self.entries.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(evicted.approx_bytes());
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &QuarantinedMessage> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}

fn summarize(msg: &TraceMessage, reason: &str) -> QuarantinedMessage {
    let kind = msg.payload.kind();
    let (approx_size, message_id, attribute_keys) = match &msg.payload {
        Payload::Event(event) => {
            let size: usize = event
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.approx_size())
                .sum();
            let mut keys: Vec<String> = event
                .attributes
                .keys()
                .take(MAX_SUMMARY_KEYS)
                .map(|k| truncate_str(k, MAX_ATTR_KEY_BYTES).to_string())
                .collect();
            keys.sort();
            (size, event.message_id.clone(), keys)
        }
        Payload::StateDiff(diff) => {
            let size = diff.full_state.as_ref().map_or(0, Vec::len)
                + diff.state_hash.as_ref().map_or(0, Vec::len);
            (size, diff.message_id.clone(), Vec::new())
        }
        Payload::Checkpoint(cp) => (
            cp.state.len(),
            Some(short_hex(&cp.checkpoint_id)),
            Vec::new(),
        ),
        Payload::Telemetry { scope } => (scope.len(), None, Vec::new()),
    };
    QuarantinedMessage {
        kind,
        reason: reason.to_string(),
        approx_size,
        message_id: message_id.map(|id| truncate_str(&id, MAX_ATTR_KEY_BYTES).to_string()),
        attribute_keys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{EventPayload, EventType};
    use std::collections::HashMap;

    fn unattributed_event() -> TraceMessage {
        TraceMessage {
            run_id: String::new(),
            producer_seq: 0,
            timestamp_us: 0,
            payload: Payload::Event(EventPayload {
                event_type: EventType::Unknown,
                node_id: None,
                message_id: Some("orphan-1".into()),
                duration_us: 0,
                attributes: HashMap::new(),
            }),
        }
    }

    #[test]
    fn count_cap_evicts_oldest() {
        let mut q = Quarantine::default();
        for _ in 0..(MAX_QUARANTINE_ENTRIES + 10) {
            q.push(&unattributed_event(), "missing run id");
        }
        assert_eq!(q.len(), MAX_QUARANTINE_ENTRIES);
    }

    #[test]
    fn byte_budget_evicts_oldest() {
        let mut q = Quarantine::default();
        // Each summary lists up to MAX_SUMMARY_KEYS keys of up to
        // MAX_ATTR_KEY_BYTES each, roughly 1 KiB, so 200 summaries overrun
        // the 64 KiB budget long before the count cap.
        for i in 0..200 {
            let mut msg = unattributed_event();
            if let Payload::Event(ref mut e) = msg.payload {
                for k in 0..MAX_SUMMARY_KEYS {
                    e.attributes
                        .insert(format!("{i}-{k}-{}", "x".repeat(140)), crate::wire::AttrValue::Int(0));
                }
            }
            q.push(&msg, "missing run id");
        }
        let total: usize = q.entries().map(|e| e.approx_bytes()).sum();
        assert!(total <= MAX_QUARANTINE_BYTES);
        assert!(q.len() < 200, "byte budget must evict before the count cap");
    }

    #[test]
    fn summaries_never_retain_payloads() {
        let mut q = Quarantine::default();
        let msg = TraceMessage {
            run_id: String::new(),
            producer_seq: 3,
            timestamp_us: 0,
            payload: Payload::Checkpoint(crate::wire::CheckpointPayload {
                checkpoint_id: vec![0xde, 0xad, 0xbe, 0xef],
                state: vec![b'{'; 5000],
                checksum: vec![],
            }),
        };
        q.push(&msg, "missing run id");
        let entry = q.entries().next().expect("entry");
        assert_eq!(entry.approx_size, 5000);
        assert_eq!(entry.message_id.as_deref(), Some("deadbeef"));
        // The 5000-byte payload itself is not held
        assert!(entry.approx_bytes() < 200);
    }

    #[test]
    fn clear_resets_budget() {
        let mut q = Quarantine::default();
        q.push(&unattributed_event(), "missing run id");
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.total_bytes, 0);
    }
}
