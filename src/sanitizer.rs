//! Stack hand-off notifications for AddressSanitizer and ThreadSanitizer.
//!
//! Both sanitizers track which stack a thread is running on. A fiber switch
//! moves the stack pointer behind their back, so every switch is bracketed
//! by [`start_switch`] / [`finish_switch`] and every fiber gets its own
//! ThreadSanitizer fiber object. Without the `asan` / `tsan` features all
//! of this compiles to nothing.

use std::ffi::c_void;
use std::ptr;

#[cfg(feature = "asan")]
unsafe extern "C" {
    fn __sanitizer_start_switch_fiber(fake_stack_save: *mut *mut c_void, bottom: *const c_void, size: usize);
    fn __sanitizer_finish_switch_fiber(
        fake_stack_save: *mut c_void,
        bottom_old: *mut *const c_void,
        size_old: *mut usize,
    );
}

#[cfg(feature = "tsan")]
unsafe extern "C" {
    fn __tsan_get_current_fiber() -> *mut c_void;
    fn __tsan_create_fiber(flags: u32) -> *mut c_void;
    fn __tsan_destroy_fiber(fiber: *mut c_void);
    fn __tsan_switch_to_fiber(fiber: *mut c_void, flags: u32);
}

/// ThreadSanitizer's handle for one fiber. Null when the feature is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TsanFiber(*mut c_void);

impl TsanFiber {
    /// The fiber object of the thread's own stack.
    pub(crate) fn current() -> Self {
        #[cfg(feature = "tsan")]
        {
            // SAFETY: plain query of the runtime's thread state.
            TsanFiber(unsafe { __tsan_get_current_fiber() })
        }
        #[cfg(not(feature = "tsan"))]
        {
            TsanFiber(ptr::null_mut())
        }
    }

    pub(crate) fn create() -> Self {
        #[cfg(feature = "tsan")]
        {
            // SAFETY: creates a fresh, unshared fiber object.
            TsanFiber(unsafe { __tsan_create_fiber(0) })
        }
        #[cfg(not(feature = "tsan"))]
        {
            TsanFiber(ptr::null_mut())
        }
    }

    /// Must not be called on the object returned by [`TsanFiber::current`].
    pub(crate) fn destroy(self) {
        #[cfg(feature = "tsan")]
        {
            if !self.0.is_null() {
                // SAFETY: the handle came from `create` and is destroyed once.
                unsafe { __tsan_destroy_fiber(self.0) };
            }
        }
        #[cfg(not(feature = "tsan"))]
        let _ = self;
    }

    fn switch_to(self) {
        #[cfg(feature = "tsan")]
        {
            if !self.0.is_null() {
                // SAFETY: the handle is alive for as long as its context.
                unsafe { __tsan_switch_to_fiber(self.0, 0) };
            }
        }
        #[cfg(not(feature = "tsan"))]
        let _ = self;
    }
}

/// Carries AddressSanitizer's fake-stack pointer across a switch.
#[derive(Debug)]
pub(crate) struct SwitchToken {
    #[cfg_attr(not(feature = "asan"), allow(dead_code))]
    fake_stack: *mut c_void,
}

/// Called on the outgoing stack right before the registers are swapped.
///
/// `bottom`/`size` describe the stack being switched to (null/0 for a
/// thread's own stack). With `leaving_for_good` the outgoing fiber is done
/// and its fake stack may be released.
pub(crate) fn start_switch(
    to_fiber: TsanFiber,
    bottom: *const u8,
    size: usize,
    leaving_for_good: bool,
) -> SwitchToken {
    to_fiber.switch_to();

    let mut token = SwitchToken {
        fake_stack: ptr::null_mut(),
    };

    #[cfg(feature = "asan")]
    {
        let save = if leaving_for_good {
            ptr::null_mut()
        } else {
            &mut token.fake_stack as *mut *mut c_void
        };
        // SAFETY: `save` is either null or points at a live local.
        unsafe { __sanitizer_start_switch_fiber(save, bottom.cast(), size) };
    }
    #[cfg(not(feature = "asan"))]
    let _ = (bottom, size, leaving_for_good, &mut token);

    token
}

/// Called on the incoming stack right after control arrives.
pub(crate) fn finish_switch(token: SwitchToken) {
    #[cfg(feature = "asan")]
    {
        // SAFETY: the token was produced by `start_switch` on this stack.
        unsafe { __sanitizer_finish_switch_fiber(token.fake_stack, ptr::null_mut(), ptr::null_mut()) };
    }
    #[cfg(not(feature = "asan"))]
    let _ = token;
}

/// Called first thing on a brand new fiber stack: there is no saved token
/// yet, so this only tells AddressSanitizer the switch has completed.
pub(crate) fn finish_first_switch() {
    finish_switch(SwitchToken {
        fake_stack: ptr::null_mut(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "tsan"))]
    #[test]
    fn test_tsan_handles_are_null_without_feature() {
        assert!(TsanFiber::current().0.is_null());
        let fiber = TsanFiber::create();
        assert!(fiber.0.is_null());
        fiber.destroy();
    }

    #[cfg(not(feature = "asan"))]
    #[test]
    fn test_switch_token_round_trip_is_inert() {
        let token = start_switch(TsanFiber::current(), ptr::null(), 0, false);
        finish_switch(token);
        finish_first_switch();
    }
}
