// CallInfo - Information about a single function call
// Equivalent to CallInfo structure in Lua C API (lstate.h)
//
// Frames address the stack by index, so a stack reallocation never
// invalidates them.

use crate::lua_vm::lua_limits::LUA_MULTRET;

/// Call status flags
pub mod call_status {
    /// Returning from this frame hands control back to the host
    pub const CALLINFO_RETURN: u32 = 1 << 0;
    /// Frame is an error boundary (protected call)
    pub const CALLINFO_HANDLE: u32 = 1 << 1;
    /// Frame runs native code through the execution callbacks
    pub const CALLINFO_NATIVE: u32 = 1 << 2;
    /// Frame runs a bytecode closure
    pub const CALLINFO_LUA: u32 = 1 << 3;
}

/// Information about a single function call on the call stack
///
/// Stack layout of a frame:
///
/// ```text
/// func | fixed args moved away (nil) | varargs | base: fixed args | registers ... | top
/// ```
///
/// For non-variadic functions `base == func + 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallInfo {
    /// Stack index of the function being called
    pub func: usize,
    /// First register of the frame
    pub base: usize,
    /// Top of stack for this frame (first slot past its registers)
    pub top: usize,
    /// Program counter, for bytecode frames
    pub savedpc: u32,
    /// Number of expected results; LUA_MULTRET means all of them
    pub nresults: i32,
    /// Call status flags (CALLINFO_*)
    pub flags: u32,
}

impl CallInfo {
    pub fn new(func: usize, base: usize, top: usize, nresults: i32, flags: u32) -> Self {
        Self {
            func,
            base,
            top,
            savedpc: 0,
            nresults,
            flags,
        }
    }

    #[inline(always)]
    pub fn is_return(&self) -> bool {
        self.flags & call_status::CALLINFO_RETURN != 0
    }

    #[inline(always)]
    pub fn is_handle(&self) -> bool {
        self.flags & call_status::CALLINFO_HANDLE != 0
    }

    #[inline(always)]
    pub fn is_native(&self) -> bool {
        self.flags & call_status::CALLINFO_NATIVE != 0
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.flags & call_status::CALLINFO_LUA != 0
    }

    #[inline(always)]
    pub fn wants_all_results(&self) -> bool {
        self.nresults == LUA_MULTRET
    }

    /// Number of variadic arguments of a frame whose prototype declares
    /// `num_params` fixed parameters.
    #[inline]
    pub fn nvarargs(&self, num_params: usize) -> usize {
        (self.base - self.func - 1).saturating_sub(num_params)
    }
}
