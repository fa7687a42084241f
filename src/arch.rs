//! Architecture-specific register images and the raw stack switch.
//!
//! Each backend exposes the same three items:
//!
//! - `Registers`: the callee-saved state of a suspended context.
//! - `Registers::prepared(stack_top, entry)`: an image that starts `entry`
//!   on a fresh stack the first time it is switched to.
//! - `switch_registers(from, to)`: spill into `from`, load `to`, return into
//!   whatever `to` was doing.
//!
//! Nothing outside [`crate::fiber`] touches these.

/// Entry point of a fresh fiber. It runs on the fiber's own stack and must
/// never return; the trampoline traps if it does.
pub type FiberEntry = extern "C" fn() -> !;

#[cfg(all(target_arch = "x86_64", not(windows)))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(windows)))]
pub(crate) use self::x86_64::{Registers, switch_registers};

#[cfg(all(target_arch = "aarch64", not(windows)))]
mod aarch64;
#[cfg(all(target_arch = "aarch64", not(windows)))]
pub(crate) use self::aarch64::{Registers, switch_registers};

#[cfg(not(any(
    all(target_arch = "x86_64", not(windows)),
    all(target_arch = "aarch64", not(windows))
)))]
compile_error!("jobfiber supports x86_64 (System V) and aarch64 (AAPCS64) only");

/// Stack alignment required at a call boundary on every supported ABI.
pub const STACK_ALIGN: usize = 16;
