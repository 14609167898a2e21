//! Error taxonomy for the reconstruction engine.
//!
//! Decode and ordering failures never surface to callers as errors; they are
//! folded into per-run flags (`corrupted`, `needs_resync`, `patch_apply_failed`)
//! so one bad producer cannot take down the read path. These types exist for
//! the internal seams where a failure has to be classified before it is
//! recorded.

use thiserror::Error;

/// A payload that could not be turned into a usable document.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("payload too large: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },
}

/// Why a state mutation was skipped instead of applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRejected {
    /// The message carried no real producer sequence; mutations cannot be
    /// ordered without one.
    NoSequence,
    /// The sequence is below the highest successfully applied sequence.
    Stale { seq: u64, last_applied: u64 },
}

impl std::fmt::Display for MutationRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationRejected::NoSequence => {
                write!(f, "mutation carries no real sequence")
            }
            MutationRejected::Stale { seq, last_applied } => {
                write!(
                    f,
                    "stale mutation: seq {seq} < last applied {last_applied}"
                )
            }
        }
    }
}
