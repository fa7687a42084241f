//! x86-64 System V context switch.
//!
//! Callee-saved: rsp, rbp, rbx, r12-r15, plus the control bits of MXCSR and
//! the x87 control word.

use super::FiberEntry;
use std::arch::naked_asm;
use std::mem::offset_of;

/// MXCSR at process start: all exceptions masked, round to nearest.
const DEFAULT_MXCSR: u32 = 0x1F80;
/// x87 control word at process start: extended precision, exceptions masked.
const DEFAULT_FPU_CW: u16 = 0x037F;

// Only the assembly reads most of these fields.
#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Registers {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    mxcsr: u32,
    fpu_cw: u16,
    _pad: u16,
}

// The assembly below hard-codes these offsets.
const _: () = {
    assert!(offset_of!(Registers, rsp) == 0x00);
    assert!(offset_of!(Registers, rbp) == 0x08);
    assert!(offset_of!(Registers, rbx) == 0x10);
    assert!(offset_of!(Registers, r12) == 0x18);
    assert!(offset_of!(Registers, r13) == 0x20);
    assert!(offset_of!(Registers, r14) == 0x28);
    assert!(offset_of!(Registers, r15) == 0x30);
    assert!(offset_of!(Registers, mxcsr) == 0x38);
    assert!(offset_of!(Registers, fpu_cw) == 0x3c);
};

impl Registers {
    /// Builds the image of a context that has never run.
    ///
    /// The trampoline address sits on top of the stack so the `ret` at the
    /// end of [`switch_registers`] lands in it with `rsp` 16-byte aligned;
    /// the trampoline then `call`s `entry`, which therefore sees the usual
    /// `rsp % 16 == 8` on entry.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the one-past-the-end address of writable memory
    /// with at least 16 bytes below it.
    pub(crate) unsafe fn prepared(stack_top: *mut u8, entry: FiberEntry) -> Self {
        let top = (stack_top as usize) & !(super::STACK_ALIGN - 1);
        let slot = (top - 8) as *mut u64;
        // SAFETY: `slot` lies inside the caller-provided stack.
        unsafe { slot.write(fiber_trampoline as usize as u64) };

        Registers {
            rsp: slot as u64,
            rbp: 0,
            r12: entry as usize as u64,
            mxcsr: DEFAULT_MXCSR,
            fpu_cw: DEFAULT_FPU_CW,
            ..Registers::default()
        }
    }
}

/// First code a fresh fiber executes. `r12` carries the entry point and
/// `rbp` is zero so frame-pointer walks stop here.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!("call r12", "ud2")
}

/// Saves the current callee-saved state into `from` and resumes `to`.
///
/// # Safety
///
/// `from` must be writable and `to` must hold either a prepared image or
/// one saved by an earlier call that has not been resumed since.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_registers(_from: *mut Registers, _to: *const Registers) {
    naked_asm!(
        // Spill into `from` (rdi). `[rsp]` already holds our return address.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr dword ptr [rdi + 0x38]",
        "fnstcw word ptr [rdi + 0x3c]",
        // Load `to` (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr dword ptr [rsi + 0x38]",
        "fldcw word ptr [rsi + 0x3c]",
        "ret",
    )
}
