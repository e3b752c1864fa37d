//! x86-64 Windows context switch.
//!
//! The Windows x64 ABI additionally treats `rsi`, `rdi`, and `xmm6`–`xmm15`
//! as callee-saved, so the frame is wider than the System V one.

use std::arch::naked_asm;
use std::ffi::c_void;

/// Callee-saved frame for the Windows x64 ABI.
///
/// 16-byte aligned so the `movaps` stores below hit aligned slots. Slots
/// other than `rsp` are only ever read by the assembly in [`swap`].
#[repr(C, align(16))]
#[allow(dead_code)]
pub(crate) struct Registers {
    pub(crate) rsp: u64,   // 0x00
    rbp: u64,              // 0x08
    rbx: u64,              // 0x10
    rsi: u64,              // 0x18
    rdi: u64,              // 0x20
    r12: u64,              // 0x28
    r13: u64,              // 0x30
    r14: u64,              // 0x38
    r15: u64,              // 0x40
    _pad: u64,             // 0x48
    xmm: [[u64; 2]; 10],   // 0x50..0xF0: xmm6..xmm15
}

impl Registers {
    pub(crate) fn zeroed() -> Self {
        Registers {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            rsi: 0,
            rdi: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            _pad: 0,
            xmm: [[0; 2]; 10],
        }
    }
}

/// Primes a fresh stack so the first `swap` into `regs` enters `entry`.
///
/// The entry slot sits 48 bytes below the top: after `ret` pops it the
/// 32-byte home space a Windows callee may scribble on ([rsp+8, rsp+40))
/// still lies inside the mapping, and `rsp ≡ 8 (mod 16)` as after a `call`.
///
/// # Safety
///
/// `stack_top` must be one past the end of a live, writable stack mapping
/// with at least 48 bytes below it.
pub(crate) unsafe fn prime(regs: &mut Registers, stack_top: *mut u8, entry: extern "C" fn() -> !) {
    let top = (stack_top as usize) & !15;
    let slot = (top - 48) as *mut u64;
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
/// Both pointers must be valid and 16-byte aligned; `restore` must describe
/// a stack that is mapped and not in use by any running context.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn swap(
    _save: *mut Registers,
    _restore: *const Registers,
    _payload: *mut c_void,
) -> *mut c_void {
    naked_asm!(
        // rcx = save, rdx = restore, r8 = payload
        "mov [rcx + 0x00], rsp",
        "mov [rcx + 0x08], rbp",
        "mov [rcx + 0x10], rbx",
        "mov [rcx + 0x18], rsi",
        "mov [rcx + 0x20], rdi",
        "mov [rcx + 0x28], r12",
        "mov [rcx + 0x30], r13",
        "mov [rcx + 0x38], r14",
        "mov [rcx + 0x40], r15",
        "movaps [rcx + 0x50], xmm6",
        "movaps [rcx + 0x60], xmm7",
        "movaps [rcx + 0x70], xmm8",
        "movaps [rcx + 0x80], xmm9",
        "movaps [rcx + 0x90], xmm10",
        "movaps [rcx + 0xa0], xmm11",
        "movaps [rcx + 0xb0], xmm12",
        "movaps [rcx + 0xc0], xmm13",
        "movaps [rcx + 0xd0], xmm14",
        "movaps [rcx + 0xe0], xmm15",
        "mov rsp, [rdx + 0x00]",
        "mov rbp, [rdx + 0x08]",
        "mov rbx, [rdx + 0x10]",
        "mov rsi, [rdx + 0x18]",
        "mov rdi, [rdx + 0x20]",
        "mov r12, [rdx + 0x28]",
        "mov r13, [rdx + 0x30]",
        "mov r14, [rdx + 0x38]",
        "mov r15, [rdx + 0x40]",
        "movaps xmm6, [rdx + 0x50]",
        "movaps xmm7, [rdx + 0x60]",
        "movaps xmm8, [rdx + 0x70]",
        "movaps xmm9, [rdx + 0x80]",
        "movaps xmm10, [rdx + 0x90]",
        "movaps xmm11, [rdx + 0xa0]",
        "movaps xmm12, [rdx + 0xb0]",
        "movaps xmm13, [rdx + 0xc0]",
        "movaps xmm14, [rdx + 0xd0]",
        "movaps xmm15, [rdx + 0xe0]",
        "mov rax, r8",
        "ret",
    );
}
