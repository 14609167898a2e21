//! Sequence assignment and deduplication keys.
//!
//! Messages carry an optional producer sequence (zero = absent). Unsequenced
//! messages still need a stable position in the per-run total order, so they
//! draw synthetic sequences from a strictly decreasing counter starting below
//! zero: best-effort unsequenced data always sorts *before* all real data.

use serde::{Deserialize, Serialize};

use crate::wire::MessageKind;

/// Per-run total-order key for messages.
///
/// All `Synthetic` values order before all `Real` values. The two spaces are
/// kept as distinct variants rather than overloading the sign bit of a single
/// integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Sequence {
    /// Assigned locally to messages that arrived without a producer sequence.
    Synthetic(i64),
    /// Producer-assigned sequence number.
    Real(u64),
}

impl Sequence {
    /// The producer sequence, if this is a real one.
    pub fn real(&self) -> Option<u64> {
        match self {
            Sequence::Real(seq) => Some(*seq),
            Sequence::Synthetic(_) => None,
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Sequence::Real(_))
    }
}

impl Ord for Sequence {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use Sequence::*;
        match (self, other) {
            (Synthetic(a), Synthetic(b)) => a.cmp(b),
            (Real(a), Real(b)) => a.cmp(b),
            (Synthetic(_), Real(_)) => std::cmp::Ordering::Less,
            (Real(_), Synthetic(_)) => std::cmp::Ordering::Greater,
        }
    }
}

impl PartialOrd for Sequence {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sequence::Synthetic(v) => write!(f, "synthetic:{v}"),
            Sequence::Real(v) => write!(f, "{v}"),
        }
    }
}

/// Source of synthetic sequences for one run. Strictly decreasing from -1.
#[derive(Debug, Clone, Default)]
pub struct SyntheticCounter {
    next: i64,
}

impl SyntheticCounter {
    pub fn next(&mut self) -> Sequence {
        self.next -= 1;
        Sequence::Synthetic(self.next)
    }
}

/// Assign a sequence: the producer's when present and non-zero, otherwise a
/// synthetic one. The protocol treats zero as "absent", so a legitimately
/// zero sequence is indistinguishable from a missing one.
pub fn assign_sequence(producer_seq: u64, counter: &mut SyntheticCounter) -> Sequence {
    if producer_seq == 0 {
        counter.next()
    } else {
        Sequence::Real(producer_seq)
    }
}

/// Stable identity used to drop duplicate deliveries.
///
/// The producer's stable message id wins when present; otherwise the
/// (kind, sequence) pair is the best identity available.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    MessageId(String),
    KindSeq(MessageKind, Sequence),
}

impl DedupKey {
    pub fn for_message(
        message_id: Option<&str>,
        kind: MessageKind,
        seq: Sequence,
    ) -> Self {
        match message_id {
            Some(id) if !id.is_empty() => DedupKey::MessageId(id.to_string()),
            _ => DedupKey::KindSeq(kind, seq),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_orders_before_real() {
        assert!(Sequence::Synthetic(-1) < Sequence::Real(0));
        assert!(Sequence::Synthetic(-1) < Sequence::Real(u64::MAX));
        assert!(Sequence::Synthetic(i64::MIN) < Sequence::Real(1));
    }

    #[test]
    fn later_synthetics_order_earlier() {
        let mut counter = SyntheticCounter::default();
        let first = counter.next();
        let second = counter.next();
        assert!(second < first, "counter must be strictly decreasing");
    }

    #[test]
    fn zero_producer_seq_is_absent() {
        let mut counter = SyntheticCounter::default();
        assert_eq!(assign_sequence(0, &mut counter), Sequence::Synthetic(-1));
        assert_eq!(assign_sequence(7, &mut counter), Sequence::Real(7));
    }

    #[test]
    fn dedup_prefers_message_id() {
        let key = DedupKey::for_message(Some("abc"), MessageKind::Event, Sequence::Real(1));
        assert_eq!(key, DedupKey::MessageId("abc".to_string()));

        // Empty id falls back to (kind, seq)
        let key = DedupKey::for_message(Some(""), MessageKind::Event, Sequence::Real(1));
        assert_eq!(
            key,
            DedupKey::KindSeq(MessageKind::Event, Sequence::Real(1))
        );
    }

    #[test]
    fn full_u64_precision_survives() {
        let big = u64::MAX - 1;
        let seq = assign_sequence(big, &mut SyntheticCounter::default());
        assert_eq!(seq.real(), Some(big));
    }
}
