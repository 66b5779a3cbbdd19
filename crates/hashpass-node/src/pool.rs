// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - VERIFICATION WORKER POOL
//
// Argon2 verification costs ~64 MiB and tens of milliseconds per call, so
// it never runs on the async scheduler. A fixed set of OS threads (cores − 1,
// bounding peak memory) consumes jobs from a channel; callers await a
// oneshot reply. The verify path holds the puzzle lock across this await on
// purpose — that serialization IS the single-winner guarantee.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use hashpass_core::verifier::{verify_submission, PowParams, VerifyOutcome};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Everything the worker needs to recompute one submission.
#[derive(Debug, Clone)]
pub struct VerifyJob {
    pub nonce: u64,
    pub seed: String,
    pub fingerprint: String,
    pub trace: String,
    pub expected_hash_hex: String,
    pub difficulty: u32,
    pub params: PowParams,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    /// Worker set is gone; the caller answers 503 and mutates nothing.
    Unavailable,
    /// Malformed submission input (bad hash hex, bad params).
    Invalid(String),
}

struct Job {
    job: VerifyJob,
    reply: oneshot::Sender<Result<VerifyOutcome, String>>,
}

#[derive(Clone)]
pub struct VerifyPool {
    tx: mpsc::Sender<Job>,
    workers: usize,
}

impl VerifyPool {
    /// Spawn `workers` verification threads. Sized by the caller to
    /// cores − 1 so peak memory stays bounded at workers × memory_cost.
    pub fn start(workers: usize) -> Result<Self, String> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));

        for i in 0..workers {
            let rx = Arc::clone(&rx);
            std::thread::Builder::new()
                .name(format!("verify-{}", i))
                .spawn(move || loop {
                    // Workers take turns holding the receiver; dequeue is
                    // quick, hashing happens after the guard drops.
                    let job = {
                        let mut rx = match rx.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        rx.blocking_recv()
                    };
                    let Some(Job { job, reply }) = job else {
                        break; // channel closed — pool shut down
                    };
                    let outcome = verify_submission(
                        job.nonce,
                        &job.seed,
                        &job.fingerprint,
                        &job.trace,
                        &job.expected_hash_hex,
                        job.difficulty,
                        &job.params,
                    );
                    // Receiver may have given up; discarding is fine.
                    let _ = reply.send(outcome);
                })
                .map_err(|e| format!("failed to spawn verify worker {}: {}", i, e))?;
        }

        Ok(VerifyPool { tx, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Dispatch one verification and await the result without blocking the
    /// scheduler.
    pub async fn verify(&self, job: VerifyJob) -> Result<VerifyOutcome, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { job, reply })
            .await
            .map_err(|_| PoolError::Unavailable)?;
        match rx.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(msg)) => Err(PoolError::Invalid(msg)),
            Err(_) => Err(PoolError::Unavailable),
        }
    }
}
