//! Cancellation handles shared by job identity.
//!
//! A worker registers a token when it dequeues a job; `JobQueue::cancel` looks
//! the token up by job ID and trips it. The aggregator polls the token (and the
//! optional deadline) at every batch checkpoint.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use paysettle_core::JobId;

/// Process-wide map from job ID to the token of the execution running it.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch) the token for `job_id`.
    pub fn register(&self, job_id: JobId) -> CancellationToken {
        self.tokens.lock().entry(job_id).or_default().clone()
    }

    /// Trip the token for `job_id`. Returns `false` when nothing is running it.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.tokens.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Trip every registered token (used when a shutdown grace period elapses).
    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    /// Jobs with a registered token, in no particular order.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.tokens.lock().keys().copied().collect()
    }

    pub fn remove(&self, job_id: JobId) {
        self.tokens.lock().remove(&job_id);
    }

    pub fn is_registered(&self, job_id: JobId) -> bool {
        self.tokens.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

/// Why a checkpoint refused to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

/// Per-execution context: cancellation token plus optional deadline.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { token, deadline }
    }

    /// A context that is never cancelled and has no deadline.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cooperative checkpoint. Cancellation wins over an elapsed deadline.
    pub fn checkpoint(&self) -> Result<(), Interrupt> {
        if self.token.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupt::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}
