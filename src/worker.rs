//! The per-worker cooperative scheduler.
//!
//! A [`Worker`] owns three FIFO queues — ready, yielded, and waiting — plus
//! the notion of "now" its host supplies on every [`Worker::tick`]. Jobs run
//! until they suspend through one of the in-job primitives ([`yield_now`],
//! [`wait`], [`wait_for_counter`], [`wait_on_address`]) or return. A job
//! that yields lands in the yielded queue and will not run again before the
//! next tick, which bounds the work a single tick can do.
//!
//! Workers are strictly thread-local: nothing here is shared except the
//! fiber pool and the counters jobs hand to each other.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::context::Userdata;
use crate::counter::Counter;
use crate::error::JobError;
use crate::fiber::{self, EntryFn, Fiber, FiberStatus, DEFAULT_STACK_SIZE};
use crate::fiber_pool::FiberPool;
use crate::job::Job;
use crate::trace;

/// Slack subtracted from timer deadlines so a deadline riding on an
/// accumulated floating-point clock still fires at the intended tick.
pub const TIMER_SLACK: f64 = 1e-6;

/// What a waiting job is gated on.
enum WaitCondition {
    /// Absolute deadline on the host's time axis.
    Timer { deadline: f64 },
    /// A group counter reaching zero.
    CounterZero(Counter),
    /// A raw word in memory reaching zero, polled like a counter.
    AddressZero { address: *const AtomicU32 },
}

impl WaitCondition {
    fn is_satisfied(&self, now: f64) -> bool {
        match self {
            WaitCondition::Timer { deadline } => now >= deadline - TIMER_SLACK,
            WaitCondition::CounterZero(counter) => counter.is_complete(),
            // SAFETY: the waiter promised the address outlives the wait.
            WaitCondition::AddressZero { address } => unsafe {
                (**address).load(Ordering::Acquire) == 0
            },
        }
    }
}

struct WaitingJob {
    job: Job,
    condition: WaitCondition,
}

thread_local! {
    /// The worker currently inside `tick` on this thread, reachable from
    /// the jobs it resumes.
    static ACTIVE_WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// Restores the previously active worker when a tick ends.
struct ActiveGuard {
    previous: *const Worker,
}

impl ActiveGuard {
    fn enter(worker: &Worker) -> ActiveGuard {
        let previous = ACTIVE_WORKER.with(|cell| cell.replace(worker as *const Worker));
        ActiveGuard { previous }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_WORKER.with(|cell| cell.set(self.previous));
    }
}

fn with_active<R>(f: impl FnOnce(&Worker) -> R) -> Option<R> {
    ACTIVE_WORKER.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            None
        } else {
            // SAFETY: the pointer was installed by the `tick` currently on
            // this thread's call stack and is cleared before it returns.
            Some(f(unsafe { &*ptr }))
        }
    })
}

/// A single-threaded cooperative job scheduler.
pub struct Worker {
    /// Jobs that will run this tick.
    ready: RefCell<VecDeque<Job>>,
    /// Jobs that yielded this tick; promoted to ready when the tick ends.
    yielded: RefCell<VecDeque<Job>>,
    /// Jobs gated on a timer, counter, or address.
    waiting: RefCell<VecDeque<WaitingJob>>,
    /// The job whose fiber is presently executing.
    current: RefCell<Option<Job>>,
    /// The host's notion of "now", as of the last tick.
    latest_time: Cell<f64>,
    pool: Option<Arc<FiberPool>>,
    pub(crate) id: usize,
}

impl Worker {
    /// A worker without a fiber pool; only ad-hoc spawns are available.
    pub fn new() -> Worker {
        Worker::build(None)
    }

    /// A worker drawing pooled fibers from `pool`.
    pub fn with_pool(pool: Arc<FiberPool>) -> Worker {
        Worker::build(Some(pool))
    }

    fn build(pool: Option<Arc<FiberPool>>) -> Worker {
        Worker {
            ready: RefCell::new(VecDeque::new()),
            yielded: RefCell::new(VecDeque::new()),
            waiting: RefCell::new(VecDeque::new()),
            current: RefCell::new(None),
            latest_time: Cell::new(0.0),
            pool,
            id: 0,
        }
    }

    /// Creates an ad-hoc job on a private 64 KiB stack and queues it for
    /// the next tick. `counter`, if given, is incremented now and
    /// decremented when the job ends.
    pub fn spawn<F>(&self, entry: F, counter: Option<&Counter>) -> Result<(), JobError>
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        self.spawn_with_stack_size(entry, DEFAULT_STACK_SIZE, counter)
    }

    /// Ad-hoc spawn with an explicit stack size.
    pub fn spawn_with_stack_size<F>(
        &self,
        entry: F,
        stack_size: usize,
        counter: Option<&Counter>,
    ) -> Result<(), JobError>
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        let counter = counter.cloned();
        if let Some(counter) = &counter {
            counter.increment();
        }
        self.spawn_prepared(Box::new(entry), stack_size, counter)
    }

    /// Queues a job on a pool-claimed small fiber. Fails with
    /// [`JobError::PoolExhausted`] when every slot is taken.
    pub fn spawn_small<F>(
        &self,
        entry: F,
        userdata: Userdata,
        counter: Option<&Counter>,
    ) -> Result<(), JobError>
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        self.spawn_pooled(Box::new(entry), userdata, counter.cloned(), false)
    }

    /// Queues a job on a pool-claimed large fiber.
    pub fn spawn_large<F>(
        &self,
        entry: F,
        userdata: Userdata,
        counter: Option<&Counter>,
    ) -> Result<(), JobError>
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        self.spawn_pooled(Box::new(entry), userdata, counter.cloned(), true)
    }

    fn spawn_pooled(
        &self,
        entry: EntryFn,
        userdata: Userdata,
        counter: Option<Counter>,
        large: bool,
    ) -> Result<(), JobError> {
        let Some(pool) = &self.pool else {
            return Err(JobError::PoolUnavailable);
        };
        if let Some(counter) = &counter {
            counter.increment();
        }
        let claim = if large {
            pool.try_claim_large(entry, userdata)
        } else {
            pool.try_claim_small(entry, userdata)
        };
        match claim {
            Ok(handle) => {
                self.enqueue_job(Job::pooled(handle, Arc::clone(pool), counter));
                Ok(())
            }
            Err(_entry) => {
                if let Some(counter) = &counter {
                    counter.decrement();
                }
                Err(JobError::PoolExhausted)
            }
        }
    }

    /// Spawns with a counter the submitter has already incremented; used by
    /// the cross-thread submission path.
    pub(crate) fn spawn_prepared(
        &self,
        entry: EntryFn,
        stack_size: usize,
        counter: Option<Counter>,
    ) -> Result<(), JobError> {
        match Fiber::new_boxed("job", stack_size, entry, ptr::null_mut()) {
            Ok(fiber) => {
                self.enqueue_job(Job::ad_hoc(fiber, counter));
                Ok(())
            }
            Err(err) => {
                // Keep the group balanced so nobody waits on a job that
                // never existed.
                if let Some(counter) = &counter {
                    counter.decrement();
                }
                Err(err)
            }
        }
    }

    /// Pooled spawn with a pre-incremented counter; falls back to an
    /// ad-hoc fiber of the same stack size when the pool is dry.
    pub(crate) fn spawn_pooled_prepared(
        &self,
        entry: EntryFn,
        userdata: Userdata,
        counter: Option<Counter>,
        large: bool,
    ) -> Result<(), JobError> {
        let Some(pool) = &self.pool else {
            if let Some(counter) = &counter {
                counter.decrement();
            }
            return Err(JobError::PoolUnavailable);
        };
        let claim = if large {
            pool.try_claim_large(entry, userdata)
        } else {
            pool.try_claim_small(entry, userdata)
        };
        match claim {
            Ok(handle) => {
                self.enqueue_job(Job::pooled(handle, Arc::clone(pool), counter));
                Ok(())
            }
            Err(entry) => {
                let stack_size = if large {
                    pool.large_stack_size()
                } else {
                    pool.small_stack_size()
                };
                match Fiber::new_boxed("job", stack_size, entry, userdata) {
                    Ok(fiber) => {
                        self.enqueue_job(Job::ad_hoc(fiber, counter));
                        Ok(())
                    }
                    Err(err) => {
                        if let Some(counter) = &counter {
                            counter.decrement();
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    pub(crate) fn enqueue_job(&self, job: Job) {
        crate::metrics::record_spawn();
        self.ready.borrow_mut().push_back(job);
    }

    /// Drives the scheduler once. `now` is the host's monotonic time in
    /// seconds; only differences of it matter.
    ///
    /// Runs every ready job, promotes every satisfied waiter, and repeats
    /// until no runnable job remains, then moves this tick's yielded jobs
    /// back to the ready queue for the next tick.
    pub fn tick(&self, now: f64) {
        let _active = ActiveGuard::enter(self);
        let mut recorder = trace::TickRecorder::start(self.id, now);
        self.latest_time.set(now);
        crate::metrics::record_tick();

        let mut running: VecDeque<Job> = VecDeque::new();
        loop {
            {
                let mut ready = self.ready.borrow_mut();
                running.append(&mut ready);
            }

            // Snapshot the length so waiters re-enqueued on this pass are
            // not examined twice.
            let pending = self.waiting.borrow().len();
            for _ in 0..pending {
                let waiter = self
                    .waiting
                    .borrow_mut()
                    .pop_front()
                    .expect("length snapshotted above");
                if waiter.condition.is_satisfied(now) {
                    running.push_back(waiter.job);
                } else {
                    self.waiting.borrow_mut().push_back(waiter);
                }
            }

            if running.is_empty() {
                break;
            }
            while let Some(job) = running.pop_front() {
                let job_ended = self.run_job(job);
                if let Some(recorder) = recorder.as_mut() {
                    recorder.job_ran(job_ended);
                }
            }
        }

        // Yielded jobs run next tick, not this one.
        let mut ready = self.ready.borrow_mut();
        let mut yielded = self.yielded.borrow_mut();
        ready.append(&mut yielded);
    }

    /// Resumes one job; returns true when its fiber finished and was
    /// reclaimed.
    fn run_job(&self, job: Job) -> bool {
        // SAFETY: the job owns this fiber and nothing else is running it.
        // A Started fiber gets its own stored userdata so a claim-time
        // payload survives the first switch; later resumes carry null.
        let payload = unsafe {
            let fiber = &*job.fiber.0;
            if fiber.status == FiberStatus::Started {
                fiber.userdata
            } else {
                ptr::null_mut()
            }
        };

        *self.current.borrow_mut() = Some(job.clone());
        fiber::resume(job.fiber, payload);
        *self.current.borrow_mut() = None;

        if !job.fiber.is_active() {
            if let Some(counter) = &job.counter {
                if counter.decrement() {
                    crate::metrics::record_group_complete();
                }
            }
            crate::metrics::record_completion();
            job.reclaim();
            return true;
        }
        false
    }

    /// The time passed to the most recent tick.
    pub fn latest_time(&self) -> f64 {
        self.latest_time.get()
    }

    /// True when no job is queued, yielded, or waiting.
    pub fn is_idle(&self) -> bool {
        self.ready.borrow().is_empty()
            && self.yielded.borrow().is_empty()
            && self.waiting.borrow().is_empty()
    }

    /// Number of jobs this worker is tracking in any state.
    pub fn pending_jobs(&self) -> usize {
        self.ready.borrow().len() + self.yielded.borrow().len() + self.waiting.borrow().len()
    }
}

impl Default for Worker {
    fn default() -> Self {
        Worker::new()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Jobs still queued are abandoned: their fibers are reclaimed
        // without being resumed again. Pooled slots re-derive on the next
        // claim, so a mid-suspension stack is harmless to recycle.
        let abandoned = self
            .ready
            .get_mut()
            .drain(..)
            .chain(self.yielded.get_mut().drain(..))
            .chain(self.waiting.get_mut().drain(..).map(|waiter| waiter.job));
        for job in abandoned {
            job.reclaim();
        }
    }
}

/// Re-queues the running job for the next tick and suspends its fiber.
pub fn yield_now() {
    let queued = with_active(|worker| {
        let Some(job) = worker.current.borrow().clone() else {
            return false;
        };
        worker.yielded.borrow_mut().push_back(job);
        crate::metrics::record_yield();
        true
    })
    .unwrap_or(false);

    debug_assert!(queued, "yield_now called outside a running job");
    if queued {
        fiber::suspend(ptr::null_mut());
    }
}

/// Parks the running job until `seconds` of scheduler time have passed,
/// measured from the current tick's `now`.
pub fn wait(seconds: f64) {
    crate::metrics::record_timer_wait();
    park_on(|worker| WaitCondition::Timer {
        deadline: worker.latest_time.get() + seconds,
    });
}

/// Parks the running job until `counter` reaches zero.
pub fn wait_for_counter(counter: &Counter) {
    crate::metrics::record_counter_wait();
    let counter = counter.clone();
    park_on(move |_| WaitCondition::CounterZero(counter));
}

/// Parks the running job until the word at `address` reads zero.
///
/// # Safety
///
/// `address` must stay valid until the wait is satisfied; it is loaded on
/// every tick's waiting-queue pass.
pub unsafe fn wait_on_address(address: *const AtomicU32) {
    crate::metrics::record_counter_wait();
    park_on(move |_| WaitCondition::AddressZero { address });
}

fn park_on(condition: impl FnOnce(&Worker) -> WaitCondition) {
    let queued = with_active(|worker| {
        let Some(job) = worker.current.borrow().clone() else {
            return false;
        };
        let condition = condition(worker);
        worker
            .waiting
            .borrow_mut()
            .push_back(WaitingJob { job, condition });
        true
    })
    .unwrap_or(false);

    debug_assert!(queued, "wait primitive called outside a running job");
    if queued {
        fiber::suspend(ptr::null_mut());
    }
}

/// Spawns an ad-hoc job on the worker running the current job.
pub fn spawn<F>(entry: F, counter: Option<&Counter>) -> Result<(), JobError>
where
    F: FnOnce(Userdata) -> Userdata + Send + 'static,
{
    with_active(|worker| worker.spawn(entry, counter)).ok_or(JobError::NoActiveWorker)?
}

/// Spawns a pooled small job on the worker running the current job.
pub fn spawn_small<F>(entry: F, userdata: Userdata, counter: Option<&Counter>) -> Result<(), JobError>
where
    F: FnOnce(Userdata) -> Userdata + Send + 'static,
{
    with_active(|worker| worker.spawn_small(entry, userdata, counter))
        .ok_or(JobError::NoActiveWorker)?
}

/// Spawns a pooled large job on the worker running the current job.
pub fn spawn_large<F>(entry: F, userdata: Userdata, counter: Option<&Counter>) -> Result<(), JobError>
where
    F: FnOnce(Userdata) -> Userdata + Send + 'static,
{
    with_active(|worker| worker.spawn_large(entry, userdata, counter))
        .ok_or(JobError::NoActiveWorker)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber_pool::PoolConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    const STEP: f64 = 1.0 / 120.0;

    #[test]
    fn timed_job_resumes_on_schedule() {
        let worker = Worker::new();
        let wakes = Arc::new(Mutex::new(Vec::new()));
        let tick_no = Arc::new(AtomicUsize::new(0));
        let done = Counter::new();

        {
            let wakes = Arc::clone(&wakes);
            let tick_no = Arc::clone(&tick_no);
            worker
                .spawn(
                    move |_| {
                        for _ in 0..4 {
                            wait(0.5);
                            wakes.lock().unwrap().push(tick_no.load(Ordering::SeqCst));
                        }
                        ptr::null_mut()
                    },
                    Some(&done),
                )
                .unwrap();
        }

        let mut now = 0.0;
        for index in 0..=360 {
            tick_no.store(index, Ordering::SeqCst);
            worker.tick(now);
            now += STEP;
        }

        assert!(done.is_complete());
        assert_eq!(*wakes.lock().unwrap(), vec![60, 120, 180, 240]);
        assert!(worker.is_idle());
    }

    #[test]
    fn frame_counter_sees_one_yield_per_tick() {
        let worker = Worker::new();
        let frames = Arc::new(AtomicUsize::new(0));
        let samples = Arc::new(Mutex::new(Vec::new()));

        {
            let frames = Arc::clone(&frames);
            worker
                .spawn(
                    move |_| loop {
                        yield_now();
                        frames.fetch_add(1, Ordering::SeqCst);
                    },
                    None,
                )
                .unwrap();
        }
        {
            let frames = Arc::clone(&frames);
            let samples = Arc::clone(&samples);
            worker
                .spawn(
                    move |_| loop {
                        wait(1.0);
                        samples.lock().unwrap().push(frames.swap(0, Ordering::SeqCst));
                    },
                    None,
                )
                .unwrap();
        }

        let mut now = 0.0;
        for _ in 0..=362 {
            worker.tick(now);
            now += STEP;
        }

        assert_eq!(*samples.lock().unwrap(), vec![120, 120, 120]);
    }

    #[test]
    fn counter_group_releases_parent_after_last_child() {
        let worker = Worker::new();
        let group = Counter::new();
        let tick_no = Arc::new(AtomicUsize::new(0));
        let parent_wake = Arc::new(AtomicUsize::new(usize::MAX));
        let children_ended = Arc::new(AtomicUsize::new(0));

        {
            let group = group.clone();
            let tick_no = Arc::clone(&tick_no);
            let parent_wake = Arc::clone(&parent_wake);
            let children_ended = Arc::clone(&children_ended);
            worker
                .spawn(
                    move |_| {
                        wait_for_counter(&group);
                        assert_eq!(children_ended.load(Ordering::SeqCst), 10);
                        parent_wake.store(tick_no.load(Ordering::SeqCst), Ordering::SeqCst);
                        ptr::null_mut()
                    },
                    None,
                )
                .unwrap();
        }
        for _ in 0..10 {
            let children_ended = Arc::clone(&children_ended);
            worker
                .spawn(
                    move |_| {
                        yield_now();
                        children_ended.fetch_add(1, Ordering::SeqCst);
                        ptr::null_mut()
                    },
                    Some(&group),
                )
                .unwrap();
        }
        assert_eq!(group.value(), 10);

        for index in 0..5 {
            tick_no.store(index, Ordering::SeqCst);
            worker.tick(index as f64 * STEP);
        }

        // Children end on tick 1; the parent is promoted by the same
        // tick's re-examination of the waiting queue.
        assert_eq!(parent_wake.load(Ordering::SeqCst), 1);
        assert!(group.is_complete());
        assert!(worker.is_idle());
    }

    #[test]
    fn yielding_job_runs_at_most_once_per_tick() {
        let worker = Worker::new();
        let runs = Arc::new(AtomicUsize::new(0));

        {
            let runs = Arc::clone(&runs);
            worker
                .spawn(
                    move |_| loop {
                        runs.fetch_add(1, Ordering::SeqCst);
                        yield_now();
                    },
                    None,
                )
                .unwrap();
        }

        for expected in 1..=5 {
            worker.tick(expected as f64);
            assert_eq!(runs.load(Ordering::SeqCst), expected);
        }
    }

    #[test]
    fn timer_fires_within_slack_and_not_before() {
        let worker = Worker::new();
        let woke = Arc::new(AtomicBool::new(false));

        {
            let woke = Arc::clone(&woke);
            worker
                .spawn(
                    move |_| {
                        wait(0.5);
                        woke.store(true, Ordering::SeqCst);
                        ptr::null_mut()
                    },
                    None,
                )
                .unwrap();
        }

        worker.tick(0.0);
        worker.tick(0.4);
        assert!(!woke.load(Ordering::SeqCst));
        worker.tick(0.5 - 2e-6);
        assert!(!woke.load(Ordering::SeqCst));
        worker.tick(0.5 - 5e-7);
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn address_wait_polls_to_zero() {
        let worker = Worker::new();
        let gate: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(1)));
        let woke = Arc::new(AtomicBool::new(false));

        {
            let woke = Arc::clone(&woke);
            worker
                .spawn(
                    move |_| {
                        // SAFETY: `gate` is leaked, so it outlives the wait.
                        unsafe { wait_on_address(gate as *const AtomicU32) };
                        woke.store(true, Ordering::SeqCst);
                        ptr::null_mut()
                    },
                    None,
                )
                .unwrap();
        }

        worker.tick(0.0);
        worker.tick(1.0);
        assert!(!woke.load(Ordering::SeqCst));
        gate.store(0, Ordering::SeqCst);
        worker.tick(2.0);
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn jobs_spawned_mid_tick_run_in_the_same_tick() {
        let worker = Worker::new();
        let child_ran = Arc::new(AtomicBool::new(false));

        {
            let child_ran = Arc::clone(&child_ran);
            worker
                .spawn(
                    move |_| {
                        spawn(
                            move |_| {
                                child_ran.store(true, Ordering::SeqCst);
                                ptr::null_mut()
                            },
                            None,
                        )
                        .unwrap();
                        ptr::null_mut()
                    },
                    None,
                )
                .unwrap();
        }

        worker.tick(0.0);
        assert!(child_ran.load(Ordering::SeqCst));
        assert!(worker.is_idle());
    }

    #[test]
    fn ended_pooled_jobs_return_to_their_pool() {
        let pool = Arc::new(
            FiberPool::new(PoolConfig {
                small_count: 4,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        let worker = Worker::with_pool(Arc::clone(&pool));

        worker
            .spawn_small(|_| ptr::null_mut(), ptr::null_mut(), None)
            .unwrap();
        assert_eq!(pool.available_small(), 3);

        worker.tick(0.0);
        assert_eq!(pool.available_small(), 4);
        assert!(worker.is_idle());
    }

    #[test]
    fn pooled_spawn_surfaces_exhaustion() {
        let pool = Arc::new(
            FiberPool::new(PoolConfig {
                small_count: 1,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        let worker = Worker::with_pool(Arc::clone(&pool));
        let group = Counter::new();

        worker
            .spawn_small(|_| ptr::null_mut(), ptr::null_mut(), Some(&group))
            .unwrap();
        let err = worker
            .spawn_small(|_| ptr::null_mut(), ptr::null_mut(), Some(&group))
            .unwrap_err();
        assert_eq!(err, JobError::PoolExhausted);
        // The failed spawn must not leave the group hanging.
        assert_eq!(group.value(), 1);

        worker.tick(0.0);
        assert!(group.is_complete());
    }

    #[test]
    fn pooled_userdata_reaches_the_entrypoint() {
        let pool = Arc::new(FiberPool::new(PoolConfig::default()).unwrap());
        let worker = Worker::with_pool(pool);
        let seen = Arc::new(AtomicUsize::new(0));

        {
            let seen = Arc::clone(&seen);
            worker
                .spawn_small(
                    move |data| {
                        seen.store(data as usize, Ordering::SeqCst);
                        ptr::null_mut()
                    },
                    41 as Userdata,
                    None,
                )
                .unwrap();
        }

        worker.tick(0.0);
        assert_eq!(seen.load(Ordering::SeqCst), 41);
    }

    #[test]
    fn panicked_job_still_decrements_its_counter() {
        let worker = Worker::new();
        let group = Counter::new();

        worker
            .spawn(
                |_| -> Userdata { panic!("job failure") },
                Some(&group),
            )
            .unwrap();
        assert_eq!(group.value(), 1);

        worker.tick(0.0);
        assert!(group.is_complete());
        assert!(worker.is_idle());
    }
}
