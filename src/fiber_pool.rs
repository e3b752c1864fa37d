//! Pre-allocated fiber pools with lock-free claim and release.
//!
//! Two fixed-count sub-pools (small and large stacks) are allocated once at
//! construction and never grow. Free slots are published through a table of
//! atomic words; each word packs a slot index with a generation tag that is
//! bumped on every release, so a recycled slot can never be confused with
//! its previous life. Claim and release are single-word compare-and-swap
//! scans bounded by the pool size.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::context::Userdata;
use crate::error::JobError;
use crate::fiber::{EntryFn, Fiber, FiberHandle};

/// Pool sizing; the defaults mirror the tuning this scheduler shipped with.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub small_count: usize,
    pub small_stack_size: usize,
    pub large_count: usize,
    pub large_stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            small_count: 128,
            small_stack_size: 64 * 1024,
            large_count: 32,
            large_stack_size: 512 * 1024,
        }
    }
}

/// A free-table word: zero means "no slot here", otherwise the low half is
/// `slot index + 1` and the high half the slot's generation.
const EMPTY: u64 = 0;
const SLOT_MASK: u64 = 0xFFFF_FFFF;

fn pack(generation: u32, index: usize) -> u64 {
    ((generation as u64) << 32) | (index as u64 + 1)
}

fn unpack_index(word: u64) -> usize {
    ((word & SLOT_MASK) - 1) as usize
}

struct SubPool {
    /// Contiguous fiber arena; slot addresses are stable for the pool's
    /// lifetime.
    slots: Box<[UnsafeCell<Fiber>]>,
    /// One cell per slot; a non-empty cell names a claimable slot.
    free: Box<[AtomicU64]>,
    /// Per-slot generation, bumped on release.
    generations: Box<[AtomicU32]>,
    stack_size: usize,
}

// SAFETY: a slot is mutated only between a successful claim CAS and the
// release CAS that publishes it again; the CAS pair hands exclusive access
// from one thread to the next with acquire/release ordering.
unsafe impl Send for SubPool {}
unsafe impl Sync for SubPool {}

impl SubPool {
    fn new(count: usize, stack_size: usize) -> Result<Self, JobError> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(UnsafeCell::new(Fiber::over_fresh_stack("", stack_size)?));
        }
        let free = (0..count)
            .map(|index| AtomicU64::new(pack(0, index)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let generations = (0..count)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(SubPool {
            slots: slots.into_boxed_slice(),
            free,
            generations,
            stack_size,
        })
    }

    /// On exhaustion the entrypoint is handed back so the caller can fall
    /// back to an ad-hoc fiber without losing the closure.
    fn claim(&self, entry: EntryFn, userdata: Userdata) -> Result<FiberHandle, EntryFn> {
        for cell in self.free.iter() {
            let word = cell.load(Ordering::Acquire);
            if word == EMPTY {
                continue;
            }
            if cell
                .compare_exchange(word, EMPTY, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let index = unpack_index(word);
            // SAFETY: the successful CAS above granted exclusive access to
            // this slot.
            let fiber = unsafe { &mut *self.slots[index].get() };
            fiber.reinitialize(entry, userdata);
            crate::metrics::record_claim();
            return Ok(FiberHandle(fiber as *mut Fiber));
        }
        crate::metrics::record_claim_failure();
        Err(entry)
    }

    /// Index of `ptr` within the arena, if it belongs to this sub-pool.
    fn index_of(&self, ptr: *mut Fiber) -> Option<usize> {
        let base = self.slots.as_ptr() as usize;
        let slot_size = mem::size_of::<UnsafeCell<Fiber>>();
        let addr = ptr as usize;
        if addr < base || addr >= base + self.slots.len() * slot_size {
            return None;
        }
        let offset = addr - base;
        (offset % slot_size == 0).then(|| offset / slot_size)
    }

    fn release(&self, index: usize) {
        // SAFETY: the releaser still holds the claim on this slot.
        let fiber = unsafe { &mut *self.slots[index].get() };
        fiber.entry = None;

        let generation = self.generations[index]
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let word = pack(generation, index);

        debug_assert!(
            !self.free.iter().any(|cell| {
                let word = cell.load(Ordering::Relaxed);
                word != EMPTY && unpack_index(word) == index
            }),
            "fiber slot released twice"
        );

        // One empty cell per outstanding claim always exists, so this
        // terminates; a failed CAS only means another release got the cell
        // first.
        loop {
            for cell in self.free.iter() {
                if cell.load(Ordering::Acquire) != EMPTY {
                    continue;
                }
                if cell
                    .compare_exchange(EMPTY, word, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
            std::hint::spin_loop();
        }
    }

    fn available(&self) -> usize {
        self.free
            .iter()
            .filter(|cell| cell.load(Ordering::Acquire) != EMPTY)
            .count()
    }
}

/// Fixed pools of pre-allocated fibers, shared by every worker.
pub struct FiberPool {
    small: SubPool,
    large: SubPool,
}

impl FiberPool {
    /// Allocates both sub-pools up front; this is the only allocation the
    /// pool ever performs.
    pub fn new(config: PoolConfig) -> Result<Self, JobError> {
        Ok(FiberPool {
            small: SubPool::new(config.small_count, config.small_stack_size)?,
            large: SubPool::new(config.large_count, config.large_stack_size)?,
        })
    }

    /// Claims a small-stack fiber and installs `entry`/`userdata` over a
    /// freshly re-derived context.
    pub fn claim_small<F>(&self, entry: F, userdata: Userdata) -> Result<FiberHandle, JobError>
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        self.small
            .claim(Box::new(entry), userdata)
            .map_err(|_| JobError::PoolExhausted)
    }

    /// Claims a large-stack fiber; the context is re-derived exactly as for
    /// small claims.
    pub fn claim_large<F>(&self, entry: F, userdata: Userdata) -> Result<FiberHandle, JobError>
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        self.large
            .claim(Box::new(entry), userdata)
            .map_err(|_| JobError::PoolExhausted)
    }

    pub(crate) fn try_claim_small(
        &self,
        entry: EntryFn,
        userdata: Userdata,
    ) -> Result<FiberHandle, EntryFn> {
        self.small.claim(entry, userdata)
    }

    pub(crate) fn try_claim_large(
        &self,
        entry: EntryFn,
        userdata: Userdata,
    ) -> Result<FiberHandle, EntryFn> {
        self.large.claim(entry, userdata)
    }

    /// Returns a claimed fiber to its sub-pool. Fibers that belong to
    /// neither pool are refused without touching either free table.
    pub fn release(&self, fiber: FiberHandle) -> Result<(), JobError> {
        // SAFETY: the caller owns the claim; the slot is not executing.
        let stack_size = unsafe { (*fiber.0).stack_size };
        for sub in [&self.small, &self.large] {
            if stack_size != sub.stack_size {
                continue;
            }
            if let Some(index) = sub.index_of(fiber.0) {
                sub.release(index);
                return Ok(());
            }
        }
        Err(JobError::SizeMismatch { stack_size })
    }

    /// Unclaimed small slots; mainly useful to callers deciding between
    /// pool and ad-hoc spawns.
    pub fn available_small(&self) -> usize {
        self.small.available()
    }

    /// Unclaimed large slots.
    pub fn available_large(&self) -> usize {
        self.large.available()
    }

    pub(crate) fn small_stack_size(&self) -> usize {
        self.small.stack_size
    }

    pub(crate) fn large_stack_size(&self) -> usize {
        self.large.stack_size
    }
}
