//! Error types for fiber creation, pool claims, and releases.

use thiserror::Error;

/// Errors surfaced by fiber and job creation.
///
/// Every failure is reported at the call site that caused it; nothing is
/// retried internally. The scheduler tick itself never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JobError {
    /// Every slot of the requested pool is claimed.
    #[error("fiber pool exhausted")]
    PoolExhausted,

    /// A pooled spawn was requested on a worker with no pool attached.
    #[error("no fiber pool attached to this worker")]
    PoolUnavailable,

    /// An in-job spawn was attempted outside a scheduler tick.
    #[error("no worker is active on this thread")]
    NoActiveWorker,

    /// The operating system refused the stack mapping.
    #[error("fiber stack allocation failed")]
    StackAlloc,

    /// The requested stack is too small to run any entrypoint safely.
    #[error("stack size {requested} is below the {minimum}-byte minimum")]
    StackTooSmall { requested: usize, minimum: usize },

    /// A released fiber's stack size matches neither pool.
    #[error("released fiber's stack size {stack_size} matches no pool")]
    SizeMismatch { stack_size: usize },
}
