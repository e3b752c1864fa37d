//! Fibers: resumable computations with their own stacks.
//!
//! A fiber owns a stack, an entrypoint, and a saved [`Context`]. Control
//! moves between fibers only through [`resume`] and [`suspend`]; each switch
//! carries an opaque [`Userdata`] payload in both directions. The thread's
//! original stack is represented by a lazily materialised root fiber, so
//! every running computation — including `main` — is some fiber.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use crate::context::Context;
pub use crate::context::Userdata;
use crate::error::JobError;
use crate::stack::FiberStack;

/// Smallest stack accepted by [`Fiber::new`]. Anything below this overflows
/// on the first nontrivial entrypoint.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Stack size used for ad-hoc jobs when the caller does not choose one.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Boxed fiber entrypoint.
pub(crate) type EntryFn = Box<dyn FnOnce(Userdata) -> Userdata + Send + 'static>;

/// Where a fiber is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberStatus {
    /// Created (or re-claimed from a pool) but never resumed.
    Started,
    /// Currently executing on its worker's CPU.
    Running,
    /// Parked at a suspend point, waiting for a resume.
    Suspended,
    /// The entrypoint returned; the fiber can never run again.
    Ended,
    /// The entrypoint panicked; treated like `Ended` for scheduling.
    Error,
}

/// A resumable computation with its own stack.
pub struct Fiber {
    pub(crate) context: Context,
    /// `None` only for the per-thread root fiber, which runs on the
    /// thread's own stack.
    pub(crate) stack: Option<FiberStack>,
    pub(crate) stack_size: usize,
    pub(crate) entry: Option<EntryFn>,
    pub(crate) userdata: Userdata,
    pub(crate) status: FiberStatus,
    /// The fiber that most recently resumed this one. Non-owning; valid
    /// while both fibers live on this worker.
    pub(crate) caller: *mut Fiber,
    pub(crate) name: &'static str,
}

// SAFETY: a fiber is only ever executed and mutated by the worker thread
// that currently owns it; sending one transfers that ownership wholesale.
unsafe impl Send for Fiber {}

/// A non-owning reference to a fiber.
///
/// Handles stay valid while the fiber they point to is alive (owned by an
/// [`OwnedFiber`], a pool slot, or a scheduled job).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiberHandle(pub(crate) *mut Fiber);

// SAFETY: the handle is an address; all dereferences happen on the worker
// that owns the fiber, which the scheduler guarantees.
unsafe impl Send for FiberHandle {}
unsafe impl Sync for FiberHandle {}

impl FiberHandle {
    pub fn null() -> Self {
        FiberHandle(ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// True until the fiber's entrypoint has returned or panicked.
    pub fn is_active(&self) -> bool {
        if self.0.is_null() {
            return false;
        }
        // SAFETY: handles are only queried while the fiber is alive.
        !matches!(
            unsafe { (*self.0).status },
            FiberStatus::Ended | FiberStatus::Error
        )
    }
}

/// An owned fiber; dropping it releases the stack.
#[derive(Debug)]
pub struct OwnedFiber {
    ptr: *mut Fiber,
}

// SAFETY: same transfer-of-ownership argument as `Fiber`.
unsafe impl Send for OwnedFiber {}

impl OwnedFiber {
    pub fn handle(&self) -> FiberHandle {
        FiberHandle(self.ptr)
    }

    /// Resumes this fiber; see [`resume`].
    pub fn resume(&self, payload: Userdata) -> Userdata {
        resume(self.handle(), payload)
    }

    pub fn is_active(&self) -> bool {
        self.handle().is_active()
    }

    /// Hands the allocation to the caller; used when a job takes over the
    /// fiber's lifetime.
    pub(crate) fn into_raw(self) -> *mut Fiber {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for OwnedFiber {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `Box::into_raw` in `Fiber::new_boxed` and
        // ownership was never given away.
        unsafe { drop(Box::from_raw(self.ptr)) };
    }
}

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: Cell<*mut Fiber> = const { Cell::new(ptr::null_mut()) };
    /// Root fiber for the thread's own stack, created on first use.
    static ROOT: RefCell<Option<Box<Fiber>>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Creates a fiber that will run `entry` on a fresh `stack_size`-byte
    /// stack when first resumed. `userdata` is what the entrypoint receives
    /// if the first resume carries no payload of its own.
    pub fn new<F>(
        name: &'static str,
        stack_size: usize,
        entry: F,
        userdata: Userdata,
    ) -> Result<OwnedFiber, JobError>
    where
        F: FnOnce(Userdata) -> Userdata + Send + 'static,
    {
        Fiber::new_boxed(name, stack_size, Box::new(entry), userdata)
    }

    pub(crate) fn new_boxed(
        name: &'static str,
        stack_size: usize,
        entry: EntryFn,
        userdata: Userdata,
    ) -> Result<OwnedFiber, JobError> {
        let mut fiber = Fiber::over_fresh_stack(name, stack_size)?;
        fiber.entry = Some(entry);
        fiber.userdata = userdata;
        Ok(OwnedFiber {
            ptr: Box::into_raw(Box::new(fiber)),
        })
    }

    /// Allocates the stack and primes the context; no entrypoint installed
    /// yet. Pool slots are pre-created through this.
    pub(crate) fn over_fresh_stack(
        name: &'static str,
        stack_size: usize,
    ) -> Result<Fiber, JobError> {
        if stack_size < MIN_STACK_SIZE {
            return Err(JobError::StackTooSmall {
                requested: stack_size,
                minimum: MIN_STACK_SIZE,
            });
        }
        let stack = FiberStack::new(stack_size).ok_or(JobError::StackAlloc)?;
        let mut fiber = Fiber {
            context: Context::new(),
            stack_size,
            stack: None,
            entry: None,
            userdata: ptr::null_mut(),
            status: FiberStatus::Started,
            caller: ptr::null_mut(),
            name,
        };
        // SAFETY: `stack` is a live mapping owned by this fiber.
        unsafe { fiber.context.derive(stack.top(), entry_trampoline) };
        fiber.stack = Some(stack);
        Ok(fiber)
    }

    /// Re-derives the context over the existing stack and installs a new
    /// entrypoint; the pool calls this on every claim so the slot starts
    /// from a clean top-of-stack frame.
    pub(crate) fn reinitialize(&mut self, entry: EntryFn, userdata: Userdata) {
        let top = self
            .stack
            .as_ref()
            .expect("pooled fiber always owns a stack")
            .top();
        // SAFETY: the stack mapping is live and nothing is executing on it
        // (the slot was free).
        unsafe { self.context.derive(top, entry_trampoline) };
        self.entry = Some(entry);
        self.userdata = userdata;
        self.status = FiberStatus::Started;
        self.caller = ptr::null_mut();
    }

    /// Root fiber wrapping the thread's own stack.
    fn root() -> Fiber {
        Fiber {
            context: Context::new(),
            stack: None,
            stack_size: 0,
            entry: None,
            userdata: ptr::null_mut(),
            status: FiberStatus::Running,
            caller: ptr::null_mut(),
            name: "main",
        }
    }
}

/// The currently executing fiber, materialising the thread's root fiber on
/// first call.
pub fn active() -> FiberHandle {
    let current = CURRENT.with(Cell::get);
    if !current.is_null() {
        return FiberHandle(current);
    }
    ROOT.with(|root| {
        let mut slot = root.borrow_mut();
        let boxed = slot.get_or_insert_with(|| Box::new(Fiber::root()));
        let ptr = &mut **boxed as *mut Fiber;
        CURRENT.with(|c| c.set(ptr));
        FiberHandle(ptr)
    })
}

/// The payload most recently exchanged through the active fiber, or null if
/// it already ended.
pub fn active_data() -> Userdata {
    let handle = active();
    // SAFETY: the active fiber is alive by definition.
    unsafe {
        if matches!((*handle.0).status, FiberStatus::Ended | FiberStatus::Error) {
            ptr::null_mut()
        } else {
            (*handle.0).userdata
        }
    }
}

/// Suspends the active fiber and transfers control to `target`, handing it
/// `payload`. Returns the payload `target` later yields (or its final
/// return value if it ends without yielding again).
///
/// Resuming an ended fiber is a no-op that returns null.
pub fn resume(target: FiberHandle, payload: Userdata) -> Userdata {
    let current = active();
    debug_assert!(target != current, "a fiber cannot resume itself");
    if target.is_null() || target == current {
        return ptr::null_mut();
    }
    // SAFETY: both fibers are alive and owned by this worker; the status
    // checks below keep us off running or dead stacks.
    unsafe {
        let t = &mut *target.0;
        if matches!(t.status, FiberStatus::Ended | FiberStatus::Error) {
            return ptr::null_mut();
        }
        debug_assert!(
            t.status != FiberStatus::Running,
            "fiber '{}' is already running",
            t.name
        );
        if t.status == FiberStatus::Running {
            return ptr::null_mut();
        }

        let cur = &mut *current.0;
        t.caller = current.0;
        cur.status = FiberStatus::Suspended;
        t.userdata = payload;
        t.status = FiberStatus::Running;
        CURRENT.with(|c| c.set(target.0));

        // SAFETY: `cur` is the executing context, `t` is suspended or
        // freshly derived.
        Context::switch(&mut cur.context, &t.context, payload)
    }
}

/// Suspends the active fiber, handing `payload` back to its caller's
/// pending [`resume`]. Returns the payload carried by the next resume.
///
/// Yielding from the root fiber is a no-op that returns null.
pub fn suspend(payload: Userdata) -> Userdata {
    let current = active();
    // SAFETY: the active fiber is alive; its caller pointer is either null
    // (root) or the suspended fiber that resumed us.
    unsafe {
        let cur = &mut *current.0;
        debug_assert!(
            !cur.caller.is_null(),
            "cannot yield from the root fiber '{}'",
            cur.name
        );
        if cur.caller.is_null() {
            return ptr::null_mut();
        }

        let caller = &mut *cur.caller;
        caller.userdata = payload;
        cur.status = FiberStatus::Suspended;
        caller.status = FiberStatus::Running;
        CURRENT.with(|c| c.set(cur.caller));

        // SAFETY: `cur` is the executing context; the caller is suspended
        // inside its resume call.
        Context::switch(&mut cur.context, &caller.context, payload)
    }
}

/// First frame of every non-root fiber. Runs the entrypoint, then walks the
/// caller chain to hand the final payload to the nearest live ancestor.
extern "C" fn entry_trampoline() -> ! {
    let handle = active();
    // SAFETY: `resume` set CURRENT to this fiber before switching in. The
    // borrow ends before the entrypoint runs, since the entrypoint may
    // itself suspend and touch this fiber again.
    let (entry, input, name) = unsafe {
        let fiber = &mut *handle.0;
        (fiber.entry.take(), fiber.userdata, fiber.name)
    };

    let result = match entry {
        Some(entry) => panic::catch_unwind(AssertUnwindSafe(move || entry(input))),
        // A pool slot resumed without a claim; nothing to run.
        None => Ok(ptr::null_mut()),
    };

    let (payload, status) = match result {
        Ok(value) => (value, FiberStatus::Ended),
        Err(err) => {
            let msg = if let Some(s) = err.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = err.downcast_ref::<String>() {
                s.as_str()
            } else {
                "unknown panic payload"
            };
            eprintln!("fiber '{}' panicked: {}", name, msg);
            crate::metrics::record_panic();
            drop(err);
            (ptr::null_mut(), FiberStatus::Error)
        }
    };

    finish(handle, payload, status)
}

/// Marks the fiber finished and switches to the nearest ancestor that has
/// not itself finished. Never returns.
fn finish(handle: FiberHandle, payload: Userdata, status: FiberStatus) -> ! {
    // SAFETY: the caller chain only references fibers owned by this worker;
    // entries may be finished but are still allocated.
    unsafe {
        (*handle.0).status = status;

        let mut caller = (*handle.0).caller;
        while !caller.is_null()
            && matches!((*caller).status, FiberStatus::Ended | FiberStatus::Error)
        {
            caller = (*caller).caller;
        }
        if caller.is_null() {
            // No live ancestor to receive control; continuing would mean
            // running on a dead stack.
            std::process::abort();
        }

        (*caller).userdata = payload;
        (*caller).status = FiberStatus::Running;
        CURRENT.with(|c| c.set(caller));

        // SAFETY: this fiber is the executing context, `caller` is
        // suspended inside a resume call further up the chain.
        Context::switch(&mut (*handle.0).context, &(*caller).context, payload);
    }
    // `resume` refuses ended fibers, so control never comes back.
    unreachable!("finished fiber was resumed");
}
