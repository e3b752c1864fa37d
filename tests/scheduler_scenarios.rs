//! Longer scheduler runs through the public API: mixed waits, staggered
//! spawning, pool recycling.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft::{worker, Counter, FiberPool, PoolConfig, Userdata, Worker};

#[test]
fn mixed_workload_settles_and_recycles_the_pool() {
    let pool = Arc::new(
        FiberPool::new(PoolConfig {
            small_count: 16,
            large_count: 4,
            ..PoolConfig::default()
        })
        .unwrap(),
    );
    let worker = Worker::with_pool(Arc::clone(&pool));
    let done = Counter::new();
    let heartbeat = Arc::new(AtomicUsize::new(0));

    // Metronome: counts every tick for the whole run.
    {
        let heartbeat = Arc::clone(&heartbeat);
        worker
            .spawn(
                move |_| loop {
                    worker::yield_now();
                    heartbeat.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .unwrap();
    }

    // Waves of pooled jobs; each waits, then spawns one ad-hoc follow-up.
    for wave in 0..8usize {
        let done_handle = done.clone();
        worker
            .spawn_small(
                move |data| {
                    let wave = data as usize;
                    worker::wait(0.25 * (wave as f64 + 1.0));
                    let follow_up_group = done_handle.clone();
                    worker::spawn(
                        move |_| {
                            worker::wait(0.1);
                            ptr::null_mut()
                        },
                        Some(&follow_up_group),
                    )
                    .unwrap();
                    ptr::null_mut()
                },
                wave as Userdata,
                Some(&done),
            )
            .unwrap();
    }
    assert_eq!(done.value(), 8);

    let step = 1.0 / 120.0;
    let mut now = 0.0;
    let mut ticks = 0usize;
    while !done.is_complete() {
        worker.tick(now);
        now += step;
        ticks += 1;
        assert!(ticks < 1200, "simulation did not settle");
    }

    // Every pooled slot made it back, and the metronome ran once per tick.
    assert_eq!(pool.available_small(), 16);
    assert!(heartbeat.load(Ordering::SeqCst) >= ticks - 1);
}

#[test]
fn host_can_spawn_across_ticks() {
    let worker = Worker::new();
    let group = Counter::new();
    let finished = Arc::new(AtomicUsize::new(0));

    let step = 1.0 / 60.0;
    let mut now = 0.0;
    for frame in 0..30 {
        if frame % 3 == 0 {
            let finished = Arc::clone(&finished);
            worker
                .spawn(
                    move |_| {
                        worker::wait(0.05);
                        finished.fetch_add(1, Ordering::SeqCst);
                        ptr::null_mut()
                    },
                    Some(&group),
                )
                .unwrap();
        }
        worker.tick(now);
        now += step;
    }
    while !group.is_complete() {
        worker.tick(now);
        now += step;
    }

    assert_eq!(finished.load(Ordering::SeqCst), 10);
    assert!(worker.is_idle());
}

#[test]
fn exhausted_pool_recovers_as_jobs_finish() {
    let pool = Arc::new(
        FiberPool::new(PoolConfig {
            small_count: 4,
            ..PoolConfig::default()
        })
        .unwrap(),
    );
    let worker = Worker::with_pool(Arc::clone(&pool));
    let group = Counter::new();

    // Fill the pool with jobs that end on the first tick.
    for _ in 0..4 {
        worker
            .spawn_small(|_| ptr::null_mut(), ptr::null_mut(), Some(&group))
            .unwrap();
    }
    assert!(matches!(
        worker.spawn_small(|_| ptr::null_mut(), ptr::null_mut(), Some(&group)),
        Err(weft::JobError::PoolExhausted)
    ));

    worker.tick(0.0);
    assert!(group.is_complete());

    // The slots came back; the next wave fits again.
    for _ in 0..4 {
        worker
            .spawn_small(|_| ptr::null_mut(), ptr::null_mut(), None)
            .unwrap();
    }
    worker.tick(1.0);
    assert_eq!(pool.available_small(), 4);
}

#[test]
fn counter_wait_chains_across_job_generations() {
    let worker = Worker::new();
    let first_wave = Counter::new();
    let all_done = Counter::new();
    let order = Arc::new(AtomicUsize::new(0));

    // The watcher runs after the first wave fully ends.
    {
        let first_wave = first_wave.clone();
        let order = Arc::clone(&order);
        worker
            .spawn(
                move |_| {
                    worker::wait_for_counter(&first_wave);
                    // Both wave jobs ended before this point.
                    order.fetch_add(100, Ordering::SeqCst);
                    ptr::null_mut()
                },
                Some(&all_done),
            )
            .unwrap();
    }
    for _ in 0..2 {
        let order = Arc::clone(&order);
        worker
            .spawn(
                move |_| {
                    worker::yield_now();
                    order.fetch_add(1, Ordering::SeqCst);
                    ptr::null_mut()
                },
                Some(&first_wave),
            )
            .unwrap();
    }

    let mut now = 0.0;
    while !all_done.is_complete() {
        worker.tick(now);
        now += 1.0 / 120.0;
        assert!(now < 1.0, "watcher never woke");
    }
    assert_eq!(order.load(Ordering::SeqCst), 102);
}
