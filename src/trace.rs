//! Per-worker tick timelines.
//!
//! When enabled, each worker records one [`TickSample`] per tick: the host
//! time it was driven with, how many jobs ran, how many of those ended, and
//! the wall-clock cost of the tick. Samples accumulate in a thread-local
//! buffer and are drained by the owning thread with [`take_local`], so
//! recording never contends across workers. Off by default; the hot path
//! pays one relaxed load.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

lazy_static::lazy_static! {
    /// Wall-clock origin for sample offsets, pinned on first [`enable`].
    static ref TRACE_EPOCH: Instant = Instant::now();
}

static ENABLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static TIMELINE: RefCell<Vec<TickSample>> = const { RefCell::new(Vec::new()) };
}

/// One scheduler tick as observed by the worker that drove it.
#[derive(Debug, Clone, Copy)]
pub struct TickSample {
    /// Worker that drove the tick.
    pub worker: usize,
    /// Host time the tick was driven with.
    pub now: f64,
    /// Jobs resumed during the tick.
    pub ran: u32,
    /// Jobs that ended (or errored) during the tick.
    pub ended: u32,
    /// Wall-clock offset of the tick start from the trace epoch.
    pub at: Duration,
    /// Wall-clock time spent inside the tick.
    pub busy: Duration,
}

/// Starts recording one sample per tick on every worker.
pub fn enable() {
    // Pin the epoch before the first sample references it.
    lazy_static::initialize(&TRACE_EPOCH);
    ENABLED.store(true, Ordering::SeqCst);
}

/// Stops recording; buffered samples remain drainable.
pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Drains the samples recorded by ticks on the calling thread, oldest
/// first.
pub fn take_local() -> Vec<TickSample> {
    TIMELINE.with(|timeline| std::mem::take(&mut *timeline.borrow_mut()))
}

/// Accumulates one tick's sample; the worker creates one per tick while
/// tracing is on and the sample lands in the timeline on drop.
pub(crate) struct TickRecorder {
    worker: usize,
    now: f64,
    ran: u32,
    ended: u32,
    started: Instant,
}

impl TickRecorder {
    pub(crate) fn start(worker: usize, now: f64) -> Option<TickRecorder> {
        is_enabled().then(|| TickRecorder {
            worker,
            now,
            ran: 0,
            ended: 0,
            started: Instant::now(),
        })
    }

    pub(crate) fn job_ran(&mut self, job_ended: bool) {
        self.ran += 1;
        if job_ended {
            self.ended += 1;
        }
    }
}

impl Drop for TickRecorder {
    fn drop(&mut self) {
        let sample = TickSample {
            worker: self.worker,
            now: self.now,
            ran: self.ran,
            ended: self.ended,
            at: self.started.duration_since(*TRACE_EPOCH),
            busy: self.started.elapsed(),
        };
        TIMELINE.with(|timeline| timeline.borrow_mut().push(sample));
    }
}
