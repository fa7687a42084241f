//! Fiber contexts: a saved register image plus the stack it runs on.
//!
//! A [`FiberContext`] is either *main* (it stands for an OS thread's own
//! stack and is only ever filled in by switching away from it) or a *fiber*
//! built by [`FiberContext::new`] on memory handed in by the caller. The
//! context never owns that memory; the job layer returns it to the arena.
//!
//! Switching is symmetric: [`FiberContext::switch`] saves the running
//! context into `from` and continues wherever `to` left off. The call
//! returns once some other context switches back to `from`.

use crate::arch::{self, Registers};
use crate::sanitizer::{self, TsanFiber};
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{Ordering, compiler_fence};

pub use crate::arch::{FiberEntry, STACK_ALIGN};

/// Smallest stack [`FiberContext::new`] accepts.
pub const MIN_STACK_SIZE: usize = 4 * 1024;

/// Saved CPU state of a suspended execution context.
pub struct FiberContext {
    /// Written by the switch routine through shared references.
    registers: UnsafeCell<Registers>,
    stack: Option<(NonNull<u8>, usize)>,
    tsan: TsanFiber,
}

impl FiberContext {
    /// A context standing for the calling thread's own stack.
    pub fn main() -> Self {
        FiberContext {
            registers: UnsafeCell::new(Registers::default()),
            stack: None,
            tsan: TsanFiber::current(),
        }
    }

    /// Prepares a context that starts running `entry` on the given stack the
    /// first time it is switched to.
    ///
    /// Returns `None` if the stack is smaller than [`MIN_STACK_SIZE`].
    ///
    /// # Safety
    ///
    /// `stack_ptr..stack_ptr + stack_size` must be writable memory that
    /// outlives every switch into this context and is not used by anything
    /// else meanwhile.
    pub unsafe fn new(entry: FiberEntry, stack_ptr: NonNull<u8>, stack_size: usize) -> Option<Self> {
        if stack_size < MIN_STACK_SIZE {
            return None;
        }

        // SAFETY: the caller guarantees the range is valid.
        let top = unsafe { stack_ptr.as_ptr().add(stack_size) };
        let registers = unsafe { Registers::prepared(top, entry) };

        Some(FiberContext {
            registers: UnsafeCell::new(registers),
            stack: Some((stack_ptr, stack_size)),
            tsan: TsanFiber::create(),
        })
    }

    /// Whether this context represents an OS thread's own stack.
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Base address and size of the fiber stack, `None` for main contexts.
    pub fn stack(&self) -> Option<(NonNull<u8>, usize)> {
        self.stack
    }

    /// Whether `addr` lies inside this context's fiber stack.
    pub fn stack_contains(&self, addr: *const u8) -> bool {
        match self.stack {
            Some((base, size)) => {
                let base = base.as_ptr() as usize;
                (base..base + size).contains(&(addr as usize))
            }
            None => false,
        }
    }

    fn stack_bottom(&self) -> (*const u8, usize) {
        match self.stack {
            Some((base, size)) => (base.as_ptr().cast_const(), size),
            None => (ptr::null(), 0),
        }
    }

    /// Suspends the running context into `from` and resumes `to`.
    ///
    /// # Safety
    ///
    /// `from` must describe the context that is executing right now and
    /// `to` must be suspended (never started, or switched away from and not
    /// resumed since). Both must stay alive until control comes back here.
    pub unsafe fn switch(from: &FiberContext, to: &FiberContext) {
        let (bottom, size) = to.stack_bottom();
        let token = sanitizer::start_switch(to.tsan, bottom, size, false);

        compiler_fence(Ordering::Release);
        // SAFETY: upheld by the caller.
        unsafe { arch::switch_registers(from.registers.get(), to.registers.get()) };
        compiler_fence(Ordering::Acquire);

        sanitizer::finish_switch(token);
    }

    /// Final switch out of a fiber that has finished its work.
    ///
    /// # Safety
    ///
    /// As for [`FiberContext::switch`]; additionally nothing may ever switch
    /// back to `from`.
    pub unsafe fn exit_to(from: &FiberContext, to: &FiberContext) -> ! {
        let (bottom, size) = to.stack_bottom();
        let _token = sanitizer::start_switch(to.tsan, bottom, size, true);

        compiler_fence(Ordering::Release);
        // SAFETY: upheld by the caller.
        unsafe { arch::switch_registers(from.registers.get(), to.registers.get()) };

        // A finished fiber was resumed.
        std::process::abort()
    }
}

/// Must be the first call an entry function makes on a fresh fiber stack.
pub fn fiber_started() {
    compiler_fence(Ordering::Acquire);
    sanitizer::finish_first_switch();
}

impl Drop for FiberContext {
    fn drop(&mut self) {
        if !self.is_main() {
            self.tsan.destroy();
        }
    }
}

impl std::fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberContext")
            .field("main", &self.is_main())
            .field("stack", &self.stack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::hint::black_box;

    const TEST_STACK: usize = 64 * 1024;

    thread_local! {
        static PAIR: Cell<(*const FiberContext, *const FiberContext)> =
            const { Cell::new((ptr::null(), ptr::null())) };
        static HITS: Cell<usize> = const { Cell::new(0) };
        static ALIGNED: Cell<bool> = const { Cell::new(false) };
        static FLOAT: Cell<f64> = const { Cell::new(0.0) };
    }

    fn back_to_main() {
        let (main, fiber) = PAIR.get();
        unsafe { FiberContext::switch(&*fiber, &*main) };
    }

    extern "C" fn counting_entry() -> ! {
        fiber_started();
        loop {
            HITS.set(HITS.get() + 1);
            back_to_main();
        }
    }

    #[repr(align(16))]
    struct Aligned([u8; 16]);

    extern "C" fn alignment_entry() -> ! {
        fiber_started();
        let sample = black_box(Aligned([0; 16]));
        ALIGNED.set((&sample as *const Aligned as usize) % 16 == 0);
        let scaled = black_box(1.25f64) * black_box(4.0);
        back_to_main();
        FLOAT.set(scaled);
        loop {
            back_to_main();
        }
    }

    fn stack_buffer() -> Vec<u8> {
        vec![0u8; TEST_STACK]
    }

    #[test]
    fn test_switch_round_trips() {
        let mut stack = stack_buffer();
        let main = FiberContext::main();
        let fiber = unsafe {
            FiberContext::new(counting_entry, NonNull::new(stack.as_mut_ptr()).unwrap(), stack.len())
        }
        .expect("stack is large enough");

        PAIR.set((&main, &fiber));
        HITS.set(0);

        for expected in 1..=5 {
            unsafe { FiberContext::switch(&main, &fiber) };
            assert_eq!(HITS.get(), expected);
        }
    }

    #[test]
    fn test_fresh_stack_is_abi_aligned_and_preserves_floats() {
        let mut stack = stack_buffer();
        let main = FiberContext::main();
        let fiber = unsafe {
            FiberContext::new(alignment_entry, NonNull::new(stack.as_mut_ptr()).unwrap(), stack.len())
        }
        .unwrap();

        PAIR.set((&main, &fiber));
        let local = black_box(2.5f64);

        unsafe { FiberContext::switch(&main, &fiber) };
        assert!(ALIGNED.get(), "16-byte aligned local was misaligned on the fiber stack");
        assert_eq!(local, 2.5);

        unsafe { FiberContext::switch(&main, &fiber) };
        assert_eq!(FLOAT.get(), 5.0);
    }

    #[test]
    fn test_too_small_stack_is_rejected() {
        let mut stack = vec![0u8; MIN_STACK_SIZE - 1];
        let ctx = unsafe {
            FiberContext::new(counting_entry, NonNull::new(stack.as_mut_ptr()).unwrap(), stack.len())
        };
        assert!(ctx.is_none());
    }

    #[test]
    fn test_main_context_has_no_stack() {
        let main = FiberContext::main();
        assert!(main.is_main());
        assert!(main.stack().is_none());
        assert!(!main.stack_contains(&main as *const _ as *const u8));
    }
}
