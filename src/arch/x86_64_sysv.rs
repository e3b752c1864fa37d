//! x86-64 System V (Linux, macOS, BSD) context switch.

use std::arch::naked_asm;
use std::ffi::c_void;

/// Callee-saved frame for the System V AMD64 ABI.
///
/// The return address is not stored here: `swap` is entered by `call`, so
/// the saved `rsp` points at it and the closing `ret` consumes it.
///
/// Slots other than `rsp` are only ever read by the assembly in [`swap`].
#[repr(C)]
#[allow(dead_code)]
pub(crate) struct Registers {
    pub(crate) rsp: u64, // 0x00
    rbp: u64,            // 0x08
    rbx: u64,            // 0x10
    r12: u64,            // 0x18
    r13: u64,            // 0x20
    r14: u64,            // 0x28
    r15: u64,            // 0x30
}

impl Registers {
    pub(crate) fn zeroed() -> Self {
        Registers {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Primes a fresh stack so the first `swap` into `regs` enters `entry`.
///
/// A single synthetic return-address slot is planted at a 16-byte boundary;
/// `swap`'s `ret` pops it, leaving `rsp ≡ 8 (mod 16)` exactly as if `entry`
/// had been reached by a `call`.
///
/// # Safety
///
/// `stack_top` must be one past the end of a live, writable stack mapping
/// with at least 16 bytes below it.
pub(crate) unsafe fn prime(regs: &mut Registers, stack_top: *mut u8, entry: extern "C" fn() -> !) {
    let top = (stack_top as usize) & !15;
    let slot = (top - 16) as *mut u64;
    // SAFETY: `slot` is 8-aligned and inside the stack mapping.
    unsafe { slot.write(entry as usize as u64) };

    *regs = Registers::zeroed();
    regs.rsp = slot as u64;
}

/// Saves the current frame into `save`, restores `restore`, and transfers
/// control. `payload` travels through the switch and is the return value
/// observed on the resumed side.
///
/// # Safety
///
/// Both pointers must be valid; `restore` must describe a stack that is
/// mapped and not in use by any running context.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn swap(
    _save: *mut Registers,
    _restore: *const Registers,
    _payload: *mut c_void,
) -> *mut c_void {
    naked_asm!(
        // rdi = save, rsi = restore, rdx = payload
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "mov rax, rdx",
        // Fresh contexts pop the planted entry slot; suspended ones return
        // into their interrupted swap call.
        "ret",
    );
}
