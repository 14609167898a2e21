//! Engine limits and tuning knobs.
//!
//! A plain struct with defaults; overriding these from an external source
//! (CLI flags, config files) is the embedder's concern.

/// Resource limits for the reconstruction engine.
///
/// Every collection the engine holds is bounded by one of these knobs, so a
/// misbehaving producer can grow memory only up to a fixed ceiling.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum events retained per run. Oldest events are trimmed first.
    pub max_events_per_run: usize,
    /// An automatic checkpoint is taken every this many applied sequences.
    ///
    /// Trade-off: smaller intervals cost memory, larger intervals cost seek
    /// latency (`state_at` replays up to one interval of patches).
    pub checkpoint_interval: u64,
    /// Maximum concurrently tracked runs; oldest arrival is evicted first.
    pub max_runs: usize,
    /// Maximum sequence-indexed checkpoints per run.
    pub max_checkpoints_per_run: usize,
    /// Checkpoint state payloads larger than this are tracked as invalid
    /// placeholders instead of being parsed.
    pub max_checkpoint_state_size_bytes: usize,
    /// Full-snapshot payloads larger than this are rejected as decode errors.
    pub max_full_state_size_bytes: usize,
    /// Declared-schema JSON attributes larger than this are ignored.
    pub max_schema_json_size_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: 10_000,
            checkpoint_interval: 100,
            max_runs: 50,
            max_checkpoints_per_run: 200,
            max_checkpoint_state_size_bytes: 10 * 1024 * 1024,
            max_full_state_size_bytes: 10 * 1024 * 1024,
            max_schema_json_size_bytes: 2 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.max_events_per_run, 10_000);
        assert_eq!(config.checkpoint_interval, 100);
        assert_eq!(config.max_runs, 50);
        assert_eq!(config.max_checkpoints_per_run, 200);
        assert_eq!(config.max_checkpoint_state_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_full_state_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_schema_json_size_bytes, 2 * 1024 * 1024);
    }
}
