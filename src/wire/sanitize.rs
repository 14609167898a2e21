//! Bounded attribute/value sanitization.
//!
//! Arbitrary producer payloads are capped before they enter the engine so a
//! single hostile or buggy producer cannot inflate per-event memory. Caps are
//! applied once at the ingestion boundary, not scattered through call sites.

use std::collections::{BTreeMap, HashMap};

use crate::wire::message::AttrValue;

/// Maximum attribute entries retained per event.
pub const MAX_ATTRS_PER_EVENT: usize = 64;
/// Maximum bytes retained for an attribute key.
pub const MAX_ATTR_KEY_BYTES: usize = 128;
/// Maximum bytes retained for a string attribute value.
pub const MAX_ATTR_VALUE_BYTES: usize = 4 * 1024;
/// Maximum hex characters retained when rendering a binary identifier.
pub const MAX_ID_HEX_CHARS: usize = 32;
/// Maximum bytes retained for an error message on a node.
pub const MAX_ERROR_BYTES: usize = 1024;

/// Truncate a string to at most `max` bytes on a char boundary.
///
/// Returns a borrowed slice when no truncation is needed.
pub fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Hex-encode a binary identifier, capped to [`MAX_ID_HEX_CHARS`].
pub fn short_hex(bytes: &[u8]) -> String {
    let mut s = hex::encode(bytes);
    s.truncate(MAX_ID_HEX_CHARS);
    s
}

/// Cap an incoming attribute map: at most [`MAX_ATTRS_PER_EVENT`] entries
/// (smallest keys first, for determinism), keys and string values truncated.
///
/// Oversized inputs are trimmed, not rejected: attributes are advisory
/// metadata and losing the tail is better than dropping the event.
pub fn sanitize_attributes(raw: HashMap<String, AttrValue>) -> BTreeMap<String, AttrValue> {
    let mut sorted: Vec<(String, AttrValue)> = raw.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    if sorted.len() > MAX_ATTRS_PER_EVENT {
        tracing::debug!(
            dropped = sorted.len() - MAX_ATTRS_PER_EVENT,
            "dropping excess event attributes"
        );
        sorted.truncate(MAX_ATTRS_PER_EVENT);
    }

    sorted
        .into_iter()
        .map(|(key, value)| {
            let key = truncate_str(&key, MAX_ATTR_KEY_BYTES).to_string();
            let value = match value {
                AttrValue::String(s) if s.len() > MAX_ATTR_VALUE_BYTES => {
                    AttrValue::String(truncate_str(&s, MAX_ATTR_VALUE_BYTES).to_string())
                }
                other => other,
            };
            (key, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        // "héllo" - the é is two bytes, so cutting at 2 must back off to 1
        let s = "h\u{e9}llo";
        assert_eq!(truncate_str(s, 2), "h");
        assert_eq!(truncate_str(s, 3), "h\u{e9}");
        assert_eq!(truncate_str(s, 100), s);
    }

    #[test]
    fn attribute_count_is_capped() {
        let mut raw = HashMap::new();
        for i in 0..(MAX_ATTRS_PER_EVENT + 10) {
            raw.insert(format!("key_{i:04}"), AttrValue::Int(i as i64));
        }
        let sanitized = sanitize_attributes(raw);
        assert_eq!(sanitized.len(), MAX_ATTRS_PER_EVENT);
        // Smallest keys survive
        assert!(sanitized.contains_key("key_0000"));
    }

    #[test]
    fn long_string_values_are_truncated() {
        let mut raw = HashMap::new();
        raw.insert("big".to_string(), AttrValue::String("x".repeat(100_000)));
        let sanitized = sanitize_attributes(raw);
        match sanitized.get("big") {
            Some(AttrValue::String(s)) => assert_eq!(s.len(), MAX_ATTR_VALUE_BYTES),
            other => panic!("expected string attribute, got {other:?}"),
        }
    }

    #[test]
    fn short_hex_caps_length() {
        let id = vec![0xabu8; 64];
        let rendered = short_hex(&id);
        assert_eq!(rendered.len(), MAX_ID_HEX_CHARS);
        assert!(rendered.chars().all(|c| c == 'a' || c == 'b'));
    }
}
