// Lua execution state (equivalent to lua_State in Lua C API)
// Represents a single thread/coroutine execution context.
// Threads live in the heap; the VM reaches them through a ThreadRef.

use crate::gc::{GcRef, ThreadRef};
use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::call_status::CALLINFO_RETURN;
use crate::lua_vm::lua_limits::{BASIC_CI_SIZE, BASIC_STACK_SIZE, EXTRA_STACK, LUA_MINSTACK, LUA_MULTRET};
use crate::lua_vm::{CallInfo, LuaError, LuaResult, SafeOption};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Ok,
    /// An error escaped every protected call
    Error,
}

/// Stable reference to a stack slot. Indices survive stack reallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackRef {
    pub thread: ThreadRef,
    pub index: usize,
}

/// Execution state for a Lua thread/coroutine
#[derive(Debug)]
pub struct LuaState {
    /// Data stack - registers, temporaries, function arguments
    /// Layout: [frame0_values...][frame1_values...][frame2_values...]
    pub(crate) stack: Vec<LuaValue>,

    /// Logical stack top - index of first free slot
    pub(crate) top: usize,

    /// Call stack - one CallInfo per active function call.
    /// Entry 0 is the base frame; the vector never shrinks, `ci` moves instead
    pub(crate) call_stack: Vec<CallInfo>,

    /// Index of the current frame in `call_stack`
    pub(crate) ci: usize,

    /// Open upvalues as (stack level, upvalue), sorted by level
    pub(crate) open_upvalues: Vec<(usize, GcRef)>,

    /// Native call nesting
    pub(crate) n_ccalls: usize,

    pub(crate) status: ThreadStatus,
    pub(crate) is_active: bool,
    is_main: bool,
    max_stack_size: usize,
}

impl LuaState {
    /// Create a thread with its base frame: function slot 0, base 1.
    pub fn new(safe_option: &SafeOption, is_main: bool) -> Self {
        let mut call_stack = Vec::with_capacity(BASIC_CI_SIZE);
        call_stack.push(CallInfo::new(
            0,
            1,
            1 + LUA_MINSTACK,
            LUA_MULTRET,
            CALLINFO_RETURN,
        ));
        Self {
            stack: vec![LuaValue::Nil; BASIC_STACK_SIZE + EXTRA_STACK],
            top: 1,
            call_stack,
            ci: 0,
            open_upvalues: Vec::new(),
            n_ccalls: 0,
            status: ThreadStatus::Ok,
            is_active: is_main,
            is_main,
            max_stack_size: safe_option.max_stack_size,
        }
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top
    }

    /// Physical stack size in slots.
    #[inline(always)]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Number of frames above the base frame.
    #[inline(always)]
    pub fn call_depth(&self) -> usize {
        self.ci
    }

    #[inline(always)]
    pub fn current_frame(&self) -> &CallInfo {
        &self.call_stack[self.ci]
    }

    #[inline(always)]
    pub(crate) fn current_frame_mut(&mut self) -> &mut CallInfo {
        &mut self.call_stack[self.ci]
    }

    /// Frame at `depth` (0 is the base frame), if active.
    pub fn frame(&self, depth: usize) -> Option<&CallInfo> {
        if depth <= self.ci {
            self.call_stack.get(depth)
        } else {
            None
        }
    }

    #[inline]
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.is_main
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<LuaValue> {
        if index < self.top {
            self.stack.get(index).copied()
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn live_stack(&self) -> &[LuaValue] {
        &self.stack[..self.top.min(self.stack.len())]
    }

    /// Nil out every slot above top so dead values are not kept alive.
    pub(crate) fn clear_unused_stack(&mut self) {
        let top = self.top.min(self.stack.len());
        self.stack[top..].fill(LuaValue::Nil);
    }

    // ===== Stack growth =====

    /// Make the physical stack at least `required` slots long (plus the
    /// EXTRA_STACK reserve). Doubles the size, never beyond the limit.
    /// Returns whether the stack was reallocated.
    pub(crate) fn grow_to(&mut self, required: usize) -> LuaResult<bool> {
        let required = required + EXTRA_STACK;
        if required <= self.stack.len() {
            return Ok(false);
        }
        let limit = self.max_stack_size + EXTRA_STACK;
        if required > limit {
            return Err(LuaError::StackOverflow);
        }
        let new_size = (self.stack.len() * 2).max(required).min(limit);
        self.stack.resize(new_size, LuaValue::Nil);
        Ok(true)
    }

    /// Guarantee `n` free slots above top.
    #[inline]
    pub(crate) fn reserve(&mut self, n: usize) -> LuaResult<bool> {
        self.grow_to(self.top + n)
    }

    // ===== Frames =====

    /// Push a frame, reusing a previously allocated CallInfo when possible.
    /// Returns whether the frame vector grew.
    pub(crate) fn push_call_info(&mut self, ci: CallInfo) -> bool {
        self.ci += 1;
        if self.ci < self.call_stack.len() {
            self.call_stack[self.ci] = ci;
            false
        } else {
            self.call_stack.push(ci);
            true
        }
    }

    // ===== Open upvalues =====

    pub(crate) fn find_open_upvalue(&self, level: usize) -> Option<GcRef> {
        self.open_upvalues
            .binary_search_by_key(&level, |&(l, _)| l)
            .ok()
            .map(|i| self.open_upvalues[i].1)
    }

    pub(crate) fn insert_open_upvalue(&mut self, level: usize, upvalue: GcRef) {
        let pos = self.open_upvalues.partition_point(|&(l, _)| l < level);
        self.open_upvalues.insert(pos, (level, upvalue));
    }

    /// Detach every open upvalue at or above `level`.
    pub(crate) fn take_open_upvalues_from(&mut self, level: usize) -> Vec<(usize, GcRef)> {
        let pos = self.open_upvalues.partition_point(|&(l, _)| l < level);
        self.open_upvalues.split_off(pos)
    }

    /// Bytes accounted to the thread object.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<LuaState>()
            + self.stack.len() * std::mem::size_of::<LuaValue>()
            + self.call_stack.len() * std::mem::size_of::<CallInfo>()
    }
}
