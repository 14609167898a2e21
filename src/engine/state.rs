//! Document decoding, patch application, and time-travel reconstruction.
//!
//! The live mutation path (snapshot replace / patch apply) is orchestrated by
//! the engine; this module holds the pure pieces plus `state_at`, the
//! read-path reconstruction that replays applied patches on top of the best
//! checkpoint.

use serde_json::Value;

use crate::engine::run::RunState;
use crate::engine::sequence::Sequence;
use crate::error::DecodeError;

/// Largest integer a double-precision consumer can hold exactly (2^53 - 1).
/// Documents with integers beyond this have already lost precision somewhere
/// in the pipeline, making hash comparison meaningless.
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Decode a size-capped byte payload as a UTF-8 JSON document.
///
/// Invalid encoding is fatal for the payload: the engine never silently
/// substitutes characters and then treats the result as authoritative state.
pub fn decode_document(bytes: &[u8], max_bytes: usize) -> Result<Value, DecodeError> {
    if bytes.len() > max_bytes {
        return Err(DecodeError::Oversized {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    let text = std::str::from_utf8(bytes)?;
    Ok(serde_json::from_str(text)?)
}

/// Document paths touched by a patch, for the view model's diff hints.
pub fn changed_paths(patch: &json_patch::Patch) -> Vec<String> {
    patch
        .0
        .iter()
        .map(|op| match op {
            json_patch::PatchOperation::Add(add) => add.path.clone(),
            json_patch::PatchOperation::Remove(remove) => remove.path.clone(),
            json_patch::PatchOperation::Replace(replace) => replace.path.clone(),
            json_patch::PatchOperation::Move(mv) => mv.path.clone(),
            json_patch::PatchOperation::Copy(copy) => copy.path.clone(),
            json_patch::PatchOperation::Test(test) => test.path.clone(),
        })
        .collect()
}

/// Clamp a target sequence into the run's seekable range.
pub fn clamp_seq(run: &RunState, target: Sequence) -> Sequence {
    match run.seek_range() {
        Some((oldest, latest)) => target.clamp(oldest, latest),
        None => target,
    }
}

/// Reconstruct the document as of `target_seq`.
///
/// Selects the checkpoint with the greatest sequence at or below the clamped
/// target and replays every applied patch in `(checkpoint, target]`. Replay
/// failures are non-fatal on the read path: the live authoritative state must
/// never be corrupted by a seek, so we log and continue best-effort.
pub fn state_at(run: &RunState, target_seq: Sequence) -> Value {
    let (oldest, latest) = match run.seek_range() {
        Some(range) => range,
        None => return run.latest_state.clone(),
    };
    let target = target_seq.clamp(oldest, latest);

    let (base_seq, mut doc) = match target.real().and_then(|t| run.checkpoints.best_at(t)) {
        Some((seq, state)) => (Some(seq), state.clone()),
        None => (None, Value::Object(serde_json::Map::new())),
    };

    for event in &run.events {
        let after_base = match (event.seq.real(), base_seq) {
            (Some(seq), Some(base)) => seq > base,
            _ => base_seq.is_none(),
        };
        if !after_base || event.seq > target {
            continue;
        }
        if let Some(ref patch) = event.patch {
            if let Err(e) = json_patch::patch(&mut doc, patch) {
                tracing::warn!(
                    run_id = %run.run_id,
                    seq = %event.seq,
                    error = %e,
                    "patch replay failed during reconstruction; continuing best-effort"
                );
            }
        }
    }
    doc
}

/// Whether the document contains integers beyond [`MAX_SAFE_INTEGER`].
pub fn has_unsafe_numbers(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u > MAX_SAFE_INTEGER
            } else if let Some(i) = n.as_i64() {
                i.unsigned_abs() > MAX_SAFE_INTEGER
            } else {
                false
            }
        }
        Value::Array(items) => items.iter().any(has_unsafe_numbers),
        Value::Object(map) => map.values().any(has_unsafe_numbers),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_rejects_oversized_payloads() {
        let bytes = vec![b'x'; 100];
        match decode_document(&bytes, 50) {
            Err(DecodeError::Oversized { size: 100, max: 50 }) => {}
            other => panic!("expected oversized error, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let bytes = vec![0xff, 0xfe, b'{', b'}'];
        assert!(matches!(
            decode_document(&bytes, 1024),
            Err(DecodeError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(matches!(
            decode_document(b"{not json", 1024),
            Err(DecodeError::MalformedJson(_))
        ));
    }

    #[test]
    fn decode_accepts_valid_document() {
        let doc = decode_document(br#"{"x": 1}"#, 1024).expect("decode");
        assert_eq!(doc, json!({"x": 1}));
    }

    #[test]
    fn changed_paths_covers_all_ops() {
        let patch: json_patch::Patch = serde_json::from_value(json!([
            { "op": "add", "path": "/a", "value": 1 },
            { "op": "remove", "path": "/b" },
            { "op": "replace", "path": "/c", "value": 2 }
        ]))
        .expect("patch");
        assert_eq!(changed_paths(&patch), vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn unsafe_numbers_detected_recursively() {
        assert!(!has_unsafe_numbers(&json!({"x": 1, "y": [2.5, "s"]})));
        assert!(has_unsafe_numbers(&json!({"x": {"deep": [u64::MAX]}})));
        assert!(has_unsafe_numbers(&json!([-9_007_199_254_740_993i64])));
        assert!(!has_unsafe_numbers(&json!(MAX_SAFE_INTEGER)));
    }
}
