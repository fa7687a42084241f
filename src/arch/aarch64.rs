//! AArch64 (AAPCS64) context switch.
//!
//! Callee-saved: x19-x28, the frame pointer x29, the link register x30, sp
//! and the low halves of v8-v15 (d8-d15).

use super::FiberEntry;
use std::arch::naked_asm;
use std::mem::offset_of;

// Only the assembly reads most of these fields.
#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Registers {
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    fp: u64,
    lr: u64,
    sp: u64,
    d8: u64,
    d9: u64,
    d10: u64,
    d11: u64,
    d12: u64,
    d13: u64,
    d14: u64,
    d15: u64,
}

// The assembly below hard-codes these offsets.
const _: () = {
    assert!(offset_of!(Registers, x19) == 0x00);
    assert!(offset_of!(Registers, fp) == 0x50);
    assert!(offset_of!(Registers, lr) == 0x58);
    assert!(offset_of!(Registers, sp) == 0x60);
    assert!(offset_of!(Registers, d8) == 0x68);
    assert!(offset_of!(Registers, d14) == 0x98);
};

impl Registers {
    /// Builds the image of a context that has never run: `ret` jumps to the
    /// trampoline through `lr`, which branches to `entry` held in x19.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the one-past-the-end address of writable memory.
    pub(crate) unsafe fn prepared(stack_top: *mut u8, entry: FiberEntry) -> Self {
        let top = (stack_top as usize) & !(super::STACK_ALIGN - 1);

        Registers {
            x19: entry as usize as u64,
            fp: 0,
            lr: fiber_trampoline as usize as u64,
            sp: top as u64,
            ..Registers::default()
        }
    }
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!("blr x19", "brk #0x1")
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
        // Spill into `from` (x0).
        "mov x9, sp",
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load `to` (x1).
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    )
}
