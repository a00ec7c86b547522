//! Request-scoped cancellation and deadline propagation.
//!
//! # Responsibility
//! - Carry a caller deadline and a shared cancel flag into every store call.
//!
//! # Invariants
//! - Clones share one cancel flag; cancelling any clone cancels all.

use crate::store::StoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller-supplied context for one coordinator call.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

/// Handle that cancels every store call made under the originating context.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl OpContext {
    /// Context with no deadline that is only cancelled through its handle.
    pub fn background() -> Self {
        Self::default()
    }

    /// Context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::default(),
        }
    }

    /// Context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::default(),
        }
    }

    /// Independent context used for compensating actions.
    ///
    /// Detached from this context's cancel flag so a cancelled request can
    /// still undo its partial writes, but bounded by `timeout`.
    pub fn detached(&self, timeout: Duration) -> Self {
        Self::with_timeout(timeout)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancelled))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fails fast when the caller has cancelled or the deadline has passed.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(StoreError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}
