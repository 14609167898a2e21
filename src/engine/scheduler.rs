//! Ingestion queue with time-boxed draining.
//!
//! Incoming messages are queued and drained in fixed-size chunks under a
//! millisecond budget; the engine yields back to the host scheduler whenever
//! the budget is exceeded and resumes from the same position. No burst of
//! input can starve the read path for more than one slice.

use std::collections::VecDeque;
use std::time::Duration;

use crate::wire::TraceMessage;

/// Time budget for one drain slice.
pub const DRAIN_BUDGET: Duration = Duration::from_millis(8);
/// Messages processed between budget checks.
pub const DRAIN_CHUNK: usize = 64;

/// FIFO of messages awaiting ingestion.
#[derive(Debug, Default)]
pub struct IngestQueue {
    queue: VecDeque<TraceMessage>,
}

impl IngestQueue {
    pub fn push(&mut self, msg: TraceMessage) {
        self.queue.push_back(msg);
    }

    /// Take up to [`DRAIN_CHUNK`] messages off the front.
    pub fn next_chunk(&mut self) -> Vec<TraceMessage> {
        let take = self.queue.len().min(DRAIN_CHUNK);
        self.queue.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Payload;

    fn msg(seq: u64) -> TraceMessage {
        TraceMessage {
            run_id: "r".into(),
            producer_seq: seq,
            timestamp_us: 0,
            payload: Payload::Telemetry {
                scope: "test".into(),
            },
        }
    }

    #[test]
    fn chunks_preserve_fifo_order() {
        let mut queue = IngestQueue::default();
        for seq in 1..=(DRAIN_CHUNK as u64 + 10) {
            queue.push(msg(seq));
        }
        let first = queue.next_chunk();
        assert_eq!(first.len(), DRAIN_CHUNK);
        assert_eq!(first[0].producer_seq, 1);
        let second = queue.next_chunk();
        assert_eq!(second.len(), 10);
        assert_eq!(second[0].producer_seq, DRAIN_CHUNK as u64 + 1);
        assert!(queue.is_empty());
    }
}
