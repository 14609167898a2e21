//! Run registry: single owner of all `RunState`s.
//!
//! Other components receive references scoped to one call and never keep
//! their own copies. Eviction is a hard drop, oldest arrival first; runs are
//! reconstructible from the live stream, not from this registry.

use std::collections::HashMap;

use crate::engine::run::RunState;

#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: HashMap<String, RunState>,
}

impl RunRegistry {
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn get(&self, run_id: &str) -> Option<&RunState> {
        self.runs.get(run_id)
    }

    pub fn get_mut(&mut self, run_id: &str) -> Option<&mut RunState> {
        self.runs.get_mut(run_id)
    }

    /// Fetch or create the run, then evict the oldest-arrival run if the
    /// count exceeded `max_runs`. A just-created run can itself be evicted
    /// only if every other run arrived after it, which cannot happen.
    pub fn get_or_create(
        &mut self,
        run_id: &str,
        timestamp_us: i64,
        max_runs: usize,
    ) -> &mut RunState {
        if !self.runs.contains_key(run_id) {
            tracing::debug!(run_id = %run_id, "tracking new run");
            self.runs
                .insert(run_id.to_string(), RunState::new(run_id.to_string(), timestamp_us));
            self.evict_over(max_runs);
        }
        self.runs
            .get_mut(run_id)
            .unwrap_or_else(|| unreachable!("run inserted above"))
    }

    fn evict_over(&mut self, max_runs: usize) {
        while self.runs.len() > max_runs {
            let oldest = self
                .runs
                .values()
                .min_by_key(|run| run.arrival)
                .map(|run| run.run_id.clone());
            match oldest {
                Some(run_id) => {
                    tracing::warn!(run_id = %run_id, max_runs, "evicting oldest run");
                    self.runs.remove(&run_id);
                }
                None => break,
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunState> {
        self.runs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RunState> {
        self.runs.values_mut()
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }
}
