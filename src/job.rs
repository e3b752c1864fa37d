//! Jobs: scheduler-managed fibers with optional completion counters.

use std::sync::Arc;

use crate::counter::Counter;
use crate::fiber::{FiberHandle, OwnedFiber};
use crate::fiber_pool::FiberPool;

/// Where a job's fiber came from, which decides how it is reclaimed once
/// the fiber ends.
#[derive(Clone)]
pub(crate) enum JobOrigin {
    /// Fiber allocated for this job alone; freed on completion.
    AdHoc,
    /// Fiber borrowed from a pool; returned to it on completion.
    Pooled(Arc<FiberPool>),
}

/// A unit of scheduled work: one fiber plus an optional group counter.
///
/// Jobs are small and cloned freely between the scheduler's queues; the
/// fiber itself is never copied.
#[derive(Clone)]
pub(crate) struct Job {
    pub(crate) fiber: FiberHandle,
    pub(crate) counter: Option<Counter>,
    pub(crate) origin: JobOrigin,
}

impl Job {
    /// Wraps a freshly created fiber; the job takes over the allocation.
    pub(crate) fn ad_hoc(fiber: OwnedFiber, counter: Option<Counter>) -> Job {
        Job {
            fiber: FiberHandle(fiber.into_raw()),
            counter,
            origin: JobOrigin::AdHoc,
        }
    }

    /// Wraps a pool-claimed fiber.
    pub(crate) fn pooled(fiber: FiberHandle, pool: Arc<FiberPool>, counter: Option<Counter>) -> Job {
        Job {
            fiber,
            counter,
            origin: JobOrigin::Pooled(pool),
        }
    }

    /// Reclaims the fiber after it has ended. Called exactly once, by the
    /// tick that observed the end; no queue holds the job at that point.
    pub(crate) fn reclaim(self) {
        match self.origin {
            JobOrigin::AdHoc => {
                // SAFETY: the handle was produced by `OwnedFiber::into_raw`
                // and this is the single reclamation site.
                unsafe { drop(Box::from_raw(self.fiber.0)) };
            }
            JobOrigin::Pooled(pool) => {
                // A size mismatch here would mean the pool handed out a
                // fiber it cannot take back; surface it loudly in debug.
                let released = pool.release(self.fiber);
                debug_assert!(released.is_ok(), "pooled fiber refused by its pool");
            }
        }
    }
}
