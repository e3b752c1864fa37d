//! # weft - Cooperative Fiber-Based Job Scheduler
//!
//! A user-space concurrency substrate that multiplexes many lightweight
//! jobs over pre-allocated fiber stacks. Jobs suspend voluntarily at
//! well-defined points — yield, timed wait, counter wait — and the host
//! drives each worker with a monotonic time value once per frame or step.
//!
//! ## Architecture
//!
//! - **Context primitive**: hand-written register save/restore per
//!   (architecture, ABI), behind a two-operation derive/switch interface.
//! - **Fibers**: resumable computations with their own guarded stacks and
//!   an explicit caller chain.
//! - **Stack pools**: fixed counts of small and large fiber stacks,
//!   claimed and released with lock-free tagged compare-and-swap.
//! - **Workers**: per-thread cooperative schedulers with ready, yielded,
//!   and waiting queues; a job that yields runs again no earlier than the
//!   next tick.
//! - **Job system**: an optional threaded host that owns one worker per
//!   OS thread and round-robins submissions across them.
//!
//! ## Example
//!
//! ```no_run
//! use weft::{Counter, Worker};
//!
//! let worker = Worker::new();
//! let counter = Counter::new();
//!
//! worker
//!     .spawn(
//!         |_| {
//!             weft::worker::wait(0.5);
//!             println!("half a second of scheduler time passed");
//!             std::ptr::null_mut()
//!         },
//!         Some(&counter),
//!     )
//!     .unwrap();
//!
//! // The host owns the clock: tick at 120 Hz until the job group ends.
//! let mut now = 0.0;
//! while !counter.is_complete() {
//!     worker.tick(now);
//!     now += 1.0 / 120.0;
//! }
//! ```

mod arch;
mod context;
pub mod counter;
pub mod error;
pub mod fiber;
pub mod fiber_pool;
mod job;
pub mod job_system;
pub mod metrics;
mod stack;
pub mod trace;
pub mod worker;

pub use context::Userdata;
pub use counter::Counter;
pub use error::JobError;
pub use fiber::{Fiber, FiberHandle, FiberStatus, OwnedFiber, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use fiber_pool::{FiberPool, PoolConfig};
pub use job_system::{JobSystem, JobSystemConfig, PinningStrategy};
pub use worker::{Worker, TIMER_SLACK};
