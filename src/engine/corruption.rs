//! Corruption detection: synchronous ordering guard plus the asynchronous
//! hash-verification pipeline.
//!
//! The guard runs before every state mutation and is the only thing standing
//! between a reordered stream and silent state corruption. Verification is
//! the one asynchronous piece of the engine: expected content hashes are
//! checked against a clone of the post-mutation document taken synchronously
//! at schedule time, on a single worker task, so verifications execute in
//! submission order and can never observe a later mutation's state.

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::engine::run::RunState;
use crate::engine::sequence::Sequence;
use crate::error::MutationRejected;

/// Synchronous guard for state mutations.
///
/// A mutation may proceed only with a real sequence at or above the highest
/// successfully applied one. Returns the real sequence on pass.
pub fn ordering_guard(run: &RunState, seq: Sequence) -> Result<u64, MutationRejected> {
    let real = match seq.real() {
        Some(real) => real,
        None => return Err(MutationRejected::NoSequence),
    };
    if let Some(last_applied) = run.last_applied_seq {
        if real < last_applied {
            return Err(MutationRejected::Stale {
                seq: real,
                last_applied,
            });
        }
    }
    Ok(real)
}

/// SHA-256 over raw payload bytes, for producer checkpoint checksums.
pub fn compute_bytes_hash(bytes: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().to_vec()
}

/// SHA-256 over the serialized document, the producer's checksum definition.
pub fn compute_hash(doc: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let bytes = serde_json::to_vec(doc)?;
    Ok(compute_bytes_hash(&bytes))
}

/// A scheduled verification: the document clone was taken synchronously when
/// the mutation was applied.
#[derive(Debug)]
pub struct VerifyJob {
    pub run_id: String,
    pub seq: u64,
    pub timestamp_us: i64,
    pub expected: Vec<u8>,
    pub document: Value,
}

/// Result of one verification, delivered back to the engine to fold into run
/// state. Outcomes for runs evicted in the meantime become no-ops.
#[derive(Debug)]
pub enum VerifyOutcome {
    Match {
        run_id: String,
        seq: u64,
    },
    Mismatch {
        run_id: String,
        seq: u64,
        timestamp_us: i64,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
    /// Hash computation itself failed; verification should be disabled for
    /// the run to avoid repeated failures.
    Failed {
        run_id: String,
        seq: u64,
        error: String,
    },
}

/// Handle to the single-worker verification pipeline.
///
/// One worker consumes jobs in submission order, which serializes
/// verifications per run without any per-run task bookkeeping.
#[derive(Debug)]
pub struct HashVerifier {
    job_tx: mpsc::UnboundedSender<VerifyJob>,
    outcome_rx: mpsc::UnboundedReceiver<VerifyOutcome>,
}

impl HashVerifier {
    /// Spawn the worker on the current tokio runtime. Without a runtime the
    /// verifier comes up dead: submissions fail and callers disable
    /// verification per run, the same degradation used when hash computation
    /// itself is unavailable.
    pub fn spawn() -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel::<VerifyJob>();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel::<VerifyOutcome>();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(verify_worker(job_rx, outcome_tx));
            }
            Err(_) => {
                tracing::warn!("no async runtime available; hash verification disabled");
                drop(job_rx);
            }
        }
        Self { job_tx, outcome_rx }
    }

    /// Queue a verification. Fails when the worker is gone, in which case
    /// the caller disables verification for the run.
    pub fn submit(&self, job: VerifyJob) -> Result<(), VerifierGone> {
        self.job_tx.send(job).map_err(|_| VerifierGone)
    }

    /// Drain completed outcomes without blocking.
    pub fn poll(&mut self) -> Vec<VerifyOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// The verification worker is no longer running.
#[derive(Debug, Clone, Copy)]
pub struct VerifierGone;

/// Worker loop: consume jobs in submission order, hash the captured document,
/// and report one outcome per job. Exits when either channel closes.
async fn verify_worker(
    mut job_rx: mpsc::UnboundedReceiver<VerifyJob>,
    outcome_tx: mpsc::UnboundedSender<VerifyOutcome>,
) {
    while let Some(job) = job_rx.recv().await {
        let outcome = match compute_hash(&job.document) {
            Ok(actual) if actual == job.expected => VerifyOutcome::Match {
                run_id: job.run_id,
                seq: job.seq,
            },
            Ok(actual) => VerifyOutcome::Mismatch {
                run_id: job.run_id,
                seq: job.seq,
                timestamp_us: job.timestamp_us,
                expected: job.expected,
                actual,
            },
            Err(e) => VerifyOutcome::Failed {
                run_id: job.run_id,
                seq: job.seq,
                error: e.to_string(),
            },
        };
        if outcome_tx.send(outcome).is_err() {
            break;
        }
    }
}
