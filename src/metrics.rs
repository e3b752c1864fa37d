//! Optional scheduler metrics, compiled in with the `metrics` feature.

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Global counters covering every worker in the process.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Ticks driven across all workers.
    pub ticks: AtomicU64,
    /// Jobs accepted into a ready queue.
    pub jobs_spawned: AtomicU64,
    /// Jobs whose fiber ended or errored.
    pub jobs_completed: AtomicU64,
    /// Jobs whose entrypoint panicked.
    pub jobs_panicked: AtomicU64,
    /// Counter groups whose last job ended.
    pub groups_completed: AtomicU64,
    /// Successful pool claims.
    pub pool_claims: AtomicU64,
    /// Claims that scanned the whole free table without success.
    pub pool_claim_failures: AtomicU64,
    /// Timer waits issued by running jobs.
    pub timer_waits: AtomicU64,
    /// Counter and address waits issued by running jobs.
    pub counter_waits: AtomicU64,
    /// Voluntary yields.
    pub yields: AtomicU64,
    /// When collection began.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    fn new() -> Self {
        Metrics {
            ticks: AtomicU64::new(0),
            jobs_spawned: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_panicked: AtomicU64::new(0),
            groups_completed: AtomicU64::new(0),
            pool_claims: AtomicU64::new(0),
            pool_claim_failures: AtomicU64::new(0),
            timer_waits: AtomicU64::new(0),
            counter_waits: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// A point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            jobs_spawned: self.jobs_spawned.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_panicked: self.jobs_panicked.load(Ordering::Relaxed),
            groups_completed: self.groups_completed.load(Ordering::Relaxed),
            pool_claims: self.pool_claims.load(Ordering::Relaxed),
            pool_claim_failures: self.pool_claim_failures.load(Ordering::Relaxed),
            timer_waits: self.timer_waits.load(Ordering::Relaxed),
            counter_waits: self.counter_waits.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Serializable view of [`Metrics`].
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub jobs_spawned: u64,
    pub jobs_completed: u64,
    pub jobs_panicked: u64,
    pub groups_completed: u64,
    pub pool_claims: u64,
    pub pool_claim_failures: u64,
    pub timer_waits: u64,
    pub counter_waits: u64,
    pub yields: u64,
    pub uptime_seconds: f64,
}

#[cfg(feature = "metrics")]
lazy_static::lazy_static! {
    /// Process-wide metrics instance.
    pub static ref METRICS: Metrics = Metrics::new();
}

macro_rules! recorder {
    ($name:ident, $field:ident) => {
        #[cfg(feature = "metrics")]
        #[inline]
        pub(crate) fn $name() {
            METRICS.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(not(feature = "metrics"))]
        #[inline]
        pub(crate) fn $name() {}
    };
}

recorder!(record_tick, ticks);
recorder!(record_spawn, jobs_spawned);
recorder!(record_completion, jobs_completed);
recorder!(record_panic, jobs_panicked);
recorder!(record_group_complete, groups_completed);
recorder!(record_claim, pool_claims);
recorder!(record_claim_failure, pool_claim_failures);
recorder!(record_timer_wait, timer_waits);
recorder!(record_counter_wait, counter_waits);
recorder!(record_yield, yields);
