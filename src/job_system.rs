//! Threaded host harness: one cooperative [`Worker`] per OS thread.
//!
//! A [`Worker`] is host-driven and strictly per-thread; this module is the
//! batteries-included host. Each worker thread owns a `Worker`,
//! drains an MPSC submission channel, and ticks on a shared monotonic
//! clock. Submissions are distributed round-robin — there is no work
//! stealing, so a job stays on the worker it was dealt to.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::context::Userdata;
use crate::counter::Counter;
use crate::error::JobError;
use crate::fiber::{EntryFn, DEFAULT_STACK_SIZE};
use crate::fiber_pool::{FiberPool, PoolConfig};
use crate::worker::Worker;

/// Monotonic time source driving every worker's ticks, in seconds.
pub type ClockFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// How worker threads map onto CPU cores.
#[derive(Clone, Copy, Debug, Default)]
pub enum PinningStrategy {
    /// Let the OS place worker threads.
    #[default]
    None,
    /// Pin worker `i` to core `i` (modulo core count).
    Linear,
}

/// Construction-time knobs for a [`JobSystem`].
pub struct JobSystemConfig {
    pub num_threads: usize,
    pub pool: PoolConfig,
    pub pinning: PinningStrategy,
    /// Pause between ticks; the effective frame rate of idle workers.
    pub tick_interval: Duration,
    /// Clock override; defaults to seconds since system construction.
    pub clock: Option<ClockFn>,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        JobSystemConfig {
            num_threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            pool: PoolConfig::default(),
            pinning: PinningStrategy::None,
            tick_interval: Duration::from_micros(8_333),
            clock: None,
        }
    }
}

/// Raw userdata crossing into a worker thread.
struct SendUserdata(Userdata);

// SAFETY: the word is opaque to the scheduler; the submitting entrypoint is
// `Send` and is the only code that interprets it.
unsafe impl Send for SendUserdata {}

enum Submission {
    AdHoc {
        entry: EntryFn,
        counter: Option<Counter>,
    },
    Pooled {
        entry: EntryFn,
        userdata: SendUserdata,
        counter: Option<Counter>,
        large: bool,
    },
}

/// A fixed set of worker threads running cooperative schedulers.
pub struct JobSystem {
    senders: Vec<Sender<Submission>>,
    workers: Vec<JoinHandle<()>>,
    next_worker: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    tick_interval: Duration,
}

impl JobSystem {
    /// Spawns `num_threads` workers with default pool and clock settings.
    pub fn new(num_threads: usize) -> Result<JobSystem, JobError> {
        JobSystem::with_config(JobSystemConfig {
            num_threads,
            ..JobSystemConfig::default()
        })
    }

    pub fn with_config(config: JobSystemConfig) -> Result<JobSystem, JobError> {
        let num_threads = config.num_threads.max(1);
        let pool = Arc::new(FiberPool::new(config.pool)?);
        let shutdown = Arc::new(AtomicBool::new(false));
        let clock: ClockFn = config.clock.unwrap_or_else(|| {
            let start = Instant::now();
            Arc::new(move || start.elapsed().as_secs_f64())
        });

        let core_ids = match config.pinning {
            PinningStrategy::None => Vec::new(),
            PinningStrategy::Linear => core_affinity::get_core_ids().unwrap_or_default(),
        };

        let mut senders = Vec::with_capacity(num_threads);
        let mut workers = Vec::with_capacity(num_threads);
        for id in 0..num_threads {
            let (sender, receiver) = unbounded();
            senders.push(sender);

            let pool = Arc::clone(&pool);
            let shutdown = Arc::clone(&shutdown);
            let clock = Arc::clone(&clock);
            let tick_interval = config.tick_interval;
            let core_id = (!core_ids.is_empty()).then(|| core_ids[id % core_ids.len()]);

            let handle = thread::Builder::new()
                .name(format!("weft-worker-{id}"))
                .spawn(move || {
                    worker_loop(id, receiver, pool, shutdown, clock, tick_interval, core_id)
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Ok(JobSystem {
            senders,
            workers,
            next_worker: AtomicUsize::new(0),
            shutdown,
            tick_interval: config.tick_interval,
        })
    }

    /// Submits an ad-hoc job and returns a counter that reaches zero when
    /// it ends.
    pub fn run<F>(&self, entry: F) -> Counter
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        let counter = Counter::new();
        counter.increment();
        self.submit(Submission::AdHoc {
            entry: Box::new(entry),
            counter: Some(counter.clone()),
        });
        counter
    }

    /// Submits a batch, all tracked by one counter.
    pub fn run_batch<I>(&self, jobs: I) -> Counter
    where
        I: IntoIterator<Item = Box<dyn FnOnce(Userdata) -> Userdata + Send + 'static>>,
    {
        let counter = Counter::new();
        for entry in jobs {
            counter.increment();
            self.submit(Submission::AdHoc {
                entry,
                counter: Some(counter.clone()),
            });
        }
        counter
    }

    /// Submits a job backed by a small pooled fiber. `userdata` is handed
    /// to the entrypoint on its worker; the entrypoint is the only code
    /// that interprets it. Falls back to an ad-hoc fiber if the pool is
    /// momentarily dry.
    pub fn run_small<F>(&self, entry: F, userdata: Userdata) -> Counter
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        self.run_pooled(Box::new(entry), userdata, false)
    }

    /// Submits a job backed by a large pooled fiber.
    pub fn run_large<F>(&self, entry: F, userdata: Userdata) -> Counter
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        self.run_pooled(Box::new(entry), userdata, true)
    }

    fn run_pooled(&self, entry: EntryFn, userdata: Userdata, large: bool) -> Counter {
        let counter = Counter::new();
        counter.increment();
        self.submit(Submission::Pooled {
            entry,
            userdata: SendUserdata(userdata),
            counter: Some(counter.clone()),
            large,
        });
        counter
    }

    fn submit(&self, submission: Submission) {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        // A send only fails once shutdown has dropped the receiver, and
        // shutdown consumes the system.
        let _ = self.senders[index].send(submission);
        self.workers[index].thread().unpark();
    }

    /// Blocks the calling thread until `counter` reaches zero.
    ///
    /// Jobs only end inside a tick, so after a short spin to catch groups
    /// that are already done this polls at half the workers' tick interval
    /// rather than trying to outpace the schedulers.
    pub fn wait_for_counter(&self, counter: &Counter) {
        for _ in 0..128 {
            if counter.is_complete() {
                return;
            }
            std::hint::spin_loop();
        }
        while !counter.is_complete() {
            thread::sleep(self.tick_interval / 2);
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Finishes every accepted submission, then joins the workers. Returns
    /// the number of worker threads that panicked, if any.
    pub fn shutdown(self) -> Result<(), usize> {
        self.shutdown.store(true, Ordering::SeqCst);
        drop(self.senders);

        let mut failed = 0;
        for handle in self.workers {
            handle.thread().unpark();
            if handle.join().is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            Err(failed)
        } else {
            Ok(())
        }
    }
}

fn worker_loop(
    id: usize,
    receiver: Receiver<Submission>,
    pool: Arc<FiberPool>,
    shutdown: Arc<AtomicBool>,
    clock: ClockFn,
    tick_interval: Duration,
    core_id: Option<core_affinity::CoreId>,
) {
    if let Some(core) = core_id {
        core_affinity::set_for_current(core);
    }

    let mut worker = Worker::with_pool(pool);
    worker.id = id;

    loop {
        let mut disconnected = false;
        loop {
            match receiver.try_recv() {
                Ok(submission) => deliver(&worker, submission),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        worker.tick((*clock)());

        // Disconnect means no submission can ever arrive again, so a
        // dropped-without-shutdown system still winds its workers down.
        if (disconnected || shutdown.load(Ordering::SeqCst))
            && worker.is_idle()
            && receiver.is_empty()
        {
            break;
        }
        if worker.is_idle() {
            // Woken early by the next submission.
            thread::park_timeout(tick_interval);
        } else {
            thread::sleep(tick_interval);
        }
    }
}

fn deliver(worker: &Worker, submission: Submission) {
    let result = match submission {
        Submission::AdHoc { entry, counter } => {
            worker.spawn_prepared(entry, DEFAULT_STACK_SIZE, counter)
        }
        Submission::Pooled {
            entry,
            userdata,
            counter,
            large,
        } => worker.spawn_pooled_prepared(entry, userdata.0, counter, large),
    };
    // The failed spawn already rebalanced the counter; all that is left is
    // to say so.
    if let Err(err) = result {
        eprintln!("weft: dropped a job submission: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn creation_and_shutdown() {
        let system = JobSystem::new(4).unwrap();
        assert_eq!(system.num_workers(), 4);
        system.shutdown().expect("shutdown failed");
    }

    #[test]
    fn run_executes_the_job() {
        let system = JobSystem::new(2).unwrap();
        let value = Arc::new(AtomicUsize::new(0));

        let value_clone = Arc::clone(&value);
        let counter = system.run(move |_| {
            value_clone.store(42, Ordering::SeqCst);
            ptr::null_mut()
        });

        system.wait_for_counter(&counter);
        assert_eq!(value.load(Ordering::SeqCst), 42);
        system.shutdown().expect("shutdown failed");
    }

    #[test]
    fn batch_tracks_every_job() {
        let system = JobSystem::new(4).unwrap();
        let sum = Arc::new(AtomicUsize::new(0));

        let num_jobs = 100;
        let mut jobs: Vec<Box<dyn FnOnce(Userdata) -> Userdata + Send>> = Vec::new();
        for i in 0..num_jobs {
            let sum = Arc::clone(&sum);
            jobs.push(Box::new(move |_| {
                sum.fetch_add(i, Ordering::SeqCst);
                ptr::null_mut()
            }));
        }

        let counter = system.run_batch(jobs);
        system.wait_for_counter(&counter);

        let expected: usize = (0..num_jobs).sum();
        assert_eq!(sum.load(Ordering::SeqCst), expected);
        system.shutdown().expect("shutdown failed");
    }

    #[test]
    fn pooled_jobs_receive_their_userdata() {
        let system = JobSystem::new(2).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = Arc::clone(&seen);
        let counter = system.run_small(
            move |data| {
                seen_clone.store(data as usize, Ordering::SeqCst);
                ptr::null_mut()
            },
            77 as Userdata,
        );

        system.wait_for_counter(&counter);
        assert_eq!(seen.load(Ordering::SeqCst), 77);
        system.shutdown().expect("shutdown failed");
    }

    #[test]
    fn waiting_jobs_complete_on_the_real_clock() {
        let system = JobSystem::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let done_clone = Arc::clone(&done);
        let counter = system.run(move |_| {
            crate::worker::wait(0.05);
            done_clone.store(1, Ordering::SeqCst);
            ptr::null_mut()
        });

        system.wait_for_counter(&counter);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        system.shutdown().expect("shutdown failed");
    }

    #[test]
    fn shutdown_finishes_accepted_submissions() {
        let system = JobSystem::new(2).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let completed = Arc::clone(&completed);
            system.run(move |_| {
                thread::sleep(Duration::from_millis(2));
                completed.fetch_add(1, Ordering::SeqCst);
                ptr::null_mut()
            });
        }

        system.shutdown().expect("shutdown failed");
        assert_eq!(completed.load(Ordering::SeqCst), 20);
    }
}
