//! Per-(architecture, ABI) context-switch primitives.
//!
//! Each implementation exposes the same three items:
//!
//! - [`Registers`]: the callee-saved register frame for one suspended
//!   context, including the stack pointer.
//! - [`prime`]: arrange a fresh stack so that the first [`swap`] into it
//!   lands on the entry trampoline with a correctly aligned stack.
//! - [`swap`]: save the live register frame into one [`Registers`] block,
//!   restore another, and transfer control. The third argument rides the
//!   switch in a scratch register and comes out as the return value on the
//!   other side.
//!
//! Everything above this module is architecture-independent.

#[cfg(all(target_arch = "x86_64", not(windows)))]
#[path = "x86_64_sysv.rs"]
mod imp;

#[cfg(all(target_arch = "x86_64", windows))]
#[path = "x86_64_windows.rs"]
mod imp;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod imp;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("weft only supports x86-64 and AArch64 targets");

pub(crate) use imp::{prime, swap, Registers};
