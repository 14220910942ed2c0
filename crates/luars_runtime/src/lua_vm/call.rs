// Call/return machinery (equivalent to ldo.c precall/poscall)
//
// Frame layout on the stack:
//   func | args... | (variadic: fixed args moved above the varargs) | registers
//
// Every position is an index, so growing the stack during a call never
// invalidates a frame.

use crate::gc::ThreadRef;
use crate::lua_value::{LuaClosure, LuaValue};
use crate::lua_vm::call_info::call_status::{CALLINFO_HANDLE, CALLINFO_LUA, CALLINFO_NATIVE};
use crate::lua_vm::lua_limits::LUA_MINSTACK;
use crate::lua_vm::{CallInfo, LuaError, LuaResult, LuaVM, ThreadStatus};

/// What a freshly pushed frame needs to run
enum FrameKind {
    Native(crate::lua_vm::CFunction),
    Lua { with_native: bool },
}

impl LuaVM {
    /// Push a frame for the function at `top - nargs - 1` (precall).
    /// Returns the depth of the new frame.
    pub fn push_frame(&mut self, thread: ThreadRef, nargs: usize, nresults: i32) -> LuaResult<usize> {
        self.push_frame_inner(thread, nargs, nresults).map(|(depth, _)| depth)
    }

    fn push_frame_inner(
        &mut self,
        thread: ThreadRef,
        nargs: usize,
        nresults: i32,
    ) -> LuaResult<(usize, FrameKind)> {
        self.check_aborted()?;
        let func = self.call_slot(thread, nargs)?;
        let (callee, depth) = {
            let l = self.heap.thread(thread)?;
            (l.stack[func], l.call_depth())
        };
        if depth >= self.safe_option.max_call_depth {
            return Err(self.stack_overflow());
        }
        let LuaValue::Function(closure) = callee else {
            return Err(self.error(format!("attempt to call a {} value", callee.type_name())));
        };

        let proto = match self.heap.closure(closure)? {
            LuaClosure::Native { func: f, .. } => {
                let f = *f;
                self.grow_stack(thread, LUA_MINSTACK)?;
                let l = self.heap.thread_mut(thread)?;
                let ci = CallInfo::new(func, func + 1, l.top + LUA_MINSTACK, nresults, 0);
                let grew = l.push_call_info(ci);
                let depth = l.ci;
                if grew {
                    self.refresh_object_size(thread)?;
                }
                return Ok((depth, FrameKind::Native(f)));
            }
            LuaClosure::Lua { proto, .. } => *proto,
        };

        let p = self.heap.proto(proto)?;
        let num_params = p.num_params as usize;
        let max_stack = p.max_stack_size as usize;
        let is_vararg = p.is_vararg;
        let with_native = p.has_native() && self.execution_callbacks().is_some();

        let nfixed = nargs.max(num_params);
        self.grow_stack_to(thread, func + 1 + nfixed + num_params + max_stack)?;

        let l = self.heap.thread_mut(thread)?;
        // missing fixed parameters become nil
        for _ in nargs..num_params {
            let top = l.top;
            l.stack[top] = LuaValue::Nil;
            l.top = top + 1;
        }
        let base = if is_vararg {
            // fixed parameters move above the varargs so registers start at base
            let base = l.top;
            for i in 0..num_params {
                l.stack[base + i] = l.stack[func + 1 + i];
                l.stack[func + 1 + i] = LuaValue::Nil;
            }
            l.top = base + num_params;
            base
        } else {
            func + 1
        };

        let frame_top = base + max_stack;
        if l.top < frame_top {
            let top = l.top;
            l.stack[top..frame_top].fill(LuaValue::Nil);
        }
        l.top = frame_top;

        let mut flags = CALLINFO_LUA;
        if with_native {
            flags |= CALLINFO_NATIVE;
        }
        let grew = l.push_call_info(CallInfo::new(func, base, frame_top, nresults, flags));
        let depth = l.ci;
        if grew {
            self.refresh_object_size(thread)?;
        }
        tracing::trace!(depth, func, base, "frame pushed");
        Ok((depth, FrameKind::Lua { with_native }))
    }

    /// Slot of the function for a call with `nargs` arguments on top of
    /// the current frame.
    fn call_slot(&mut self, thread: ThreadRef, nargs: usize) -> LuaResult<usize> {
        let l = self.heap.thread(thread)?;
        let base = l.current_frame().base;
        match l.top.checked_sub(nargs + 1) {
            Some(func) if func >= base => Ok(func),
            _ => Err(self.error("not enough values on the stack for the call")),
        }
    }

    /// Pop the current frame, moving the results that start at
    /// `first_result` into the function slot (poscall). Upvalues still open
    /// on the frame's slots are closed first. Returns whether the popped
    /// frame hands control back to the host.
    pub fn pop_frame(&mut self, thread: ThreadRef, first_result: usize) -> LuaResult<bool> {
        let (ci, available) = {
            let l = self.heap.thread(thread)?;
            if l.call_depth() == 0 {
                return Err(self.error("cannot pop the base frame"));
            }
            (*l.current_frame(), l.top.saturating_sub(first_result))
        };
        self.close_upvalues(thread, ci.func + 1)?;
        let wanted = if ci.wants_all_results() {
            available
        } else {
            ci.nresults as usize
        };
        let res = ci.func;
        self.grow_stack_to(thread, res + wanted)?;

        let l = self.heap.thread_mut(thread)?;
        for i in 0..wanted {
            l.stack[res + i] = if i < available {
                l.stack[first_result + i]
            } else {
                LuaValue::Nil
            };
        }
        l.ci -= 1;
        l.top = res + wanted;
        let caller = *l.current_frame();
        if !ci.wants_all_results() && caller.is_lua() {
            l.top = caller.top;
        }
        Ok(ci.is_return())
    }

    /// Number of variadic arguments of the current bytecode frame.
    pub fn vararg_count(&self, thread: ThreadRef) -> LuaResult<usize> {
        let l = self.heap.thread(thread)?;
        let ci = l.current_frame();
        if !ci.is_lua() {
            return Ok(0);
        }
        let LuaValue::Function(closure) = l.stack[ci.func] else {
            return Err(self.heap.violation());
        };
        match self.heap.closure(closure)? {
            LuaClosure::Lua { proto, .. } => {
                Ok(ci.nvarargs(self.heap.proto(*proto)?.num_params as usize))
            }
            LuaClosure::Native { .. } => Err(self.heap.violation()),
        }
    }

    /// Call the function at `top - nargs - 1`. Native functions run directly;
    /// bytecode runs only when the execution callbacks finish it natively.
    ///
    /// Fewer than `nargs + 1` values in the current frame is an error that
    /// leaves the stack untouched. Any other error unwinds the frames pushed
    /// by this call and resets `top` to the function slot. An error escaping
    /// the base frame without a handler leaves the thread in
    /// `ThreadStatus::Error` with the error value on top.
    pub fn call(&mut self, thread: ThreadRef, nargs: usize, nresults: i32) -> LuaResult<()> {
        self.check_aborted()?;
        let func = self.call_slot(thread, nargs)?;
        let old_ci = self.heap.thread(thread)?.ci;
        let result = self.do_call(thread, nargs, nresults);
        match result {
            Ok(()) => self.check_gc(),
            Err(LuaError::InvariantViolation) => self.guard(result),
            Err(err) => {
                self.unwind_to(thread, old_ci, func)?;
                let l = self.heap.thread(thread)?;
                if old_ci == 0 && !l.current_frame().is_handle() {
                    let value = self.error_value(err);
                    let l = self.heap.thread_mut(thread)?;
                    l.status = ThreadStatus::Error;
                    l.stack[func] = value;
                    l.top = func + 1;
                    tracing::debug!(?err, "error escaped to the host");
                }
                Err(err)
            }
        }
    }

    fn do_call(&mut self, thread: ThreadRef, nargs: usize, nresults: i32) -> LuaResult<()> {
        let (_, kind) = self.push_frame_inner(thread, nargs, nresults)?;
        match kind {
            FrameKind::Native(f) => {
                let n_ccalls = {
                    let l = self.heap.thread_mut(thread)?;
                    l.n_ccalls += 1;
                    l.n_ccalls
                };
                if n_ccalls > self.safe_option.max_call_depth {
                    self.heap.thread_mut(thread)?.n_ccalls -= 1;
                    return Err(self.stack_overflow());
                }
                let result = f(self, thread);
                self.heap.thread_mut(thread)?.n_ccalls -= 1;
                let n = result?;

                let (base, top) = {
                    let l = self.heap.thread(thread)?;
                    (l.current_frame().base, l.top)
                };
                if n > top.saturating_sub(base) {
                    return Err(self.error("native function returned more results than it pushed"));
                }
                self.pop_frame(thread, top - n)?;
                Ok(())
            }
            FrameKind::Lua { with_native: true } => {
                let (proto, base) = {
                    let l = self.heap.thread(thread)?;
                    let ci = l.current_frame();
                    (l.stack[ci.func], ci.base)
                };
                let proto = match proto {
                    LuaValue::Function(closure) => match self.heap.closure(closure)? {
                        LuaClosure::Lua { proto, .. } => *proto,
                        LuaClosure::Native { .. } => return Err(self.heap.violation()),
                    },
                    _ => return Err(self.heap.violation()),
                };
                let Some(callbacks) = self.execution_callbacks() else {
                    return Err(self.error("no interpreter attached to run bytecode"));
                };
                if callbacks.on_enter(self, thread, proto) {
                    return Err(self.error("no interpreter attached to run bytecode"));
                }
                self.pop_frame(thread, base)?;
                Ok(())
            }
            FrameKind::Lua { with_native: false } => {
                Err(self.error("no interpreter attached to run bytecode"))
            }
        }
    }

    /// Protected call: like `call`, but recoverable errors stop here. On
    /// error the stack is cut back to the function slot and the error value
    /// is pushed in its place. Returns whether the call succeeded.
    ///
    /// A call with fewer than `nargs + 1` values in the current frame is
    /// refused with `RuntimeError` before anything is touched.
    pub fn pcall(&mut self, thread: ThreadRef, nargs: usize, nresults: i32) -> LuaResult<bool> {
        self.check_aborted()?;
        let func = self.call_slot(thread, nargs)?;
        let (old_ci, old_flags) = {
            let l = self.heap.thread_mut(thread)?;
            let old_ci = l.ci;
            let frame = l.current_frame_mut();
            let old_flags = frame.flags;
            frame.flags |= CALLINFO_HANDLE;
            (old_ci, old_flags)
        };

        let result = self.call(thread, nargs, nresults);

        let restore = |vm: &mut LuaVM| -> LuaResult<()> {
            let l = vm.heap.thread_mut(thread)?;
            l.call_stack[old_ci].flags = old_flags;
            Ok(())
        };
        match result {
            Ok(()) => {
                restore(self)?;
                Ok(true)
            }
            Err(LuaError::InvariantViolation) => Err(LuaError::InvariantViolation),
            Err(err) => {
                self.unwind(thread)?;
                restore(self)?;
                let value = self.error_value(err);
                let l = self.heap.thread_mut(thread)?;
                l.stack[func] = value;
                l.top = func + 1;
                tracing::debug!(?err, "error caught by protected call");
                Ok(false)
            }
        }
    }

    /// Pop frames down to the nearest error boundary, closing the upvalues
    /// of the popped frames. Returns the depth reached.
    pub fn unwind(&mut self, thread: ThreadRef) -> LuaResult<usize> {
        let (target, level) = {
            let l = self.heap.thread(thread)?;
            let target = (0..=l.ci)
                .rev()
                .find(|&depth| l.call_stack[depth].is_handle())
                .unwrap_or(0);
            let level = if target < l.ci {
                l.call_stack[target + 1].func
            } else {
                l.top
            };
            (target, level)
        };
        self.unwind_to(thread, target, level)?;
        Ok(target)
    }

    /// Drop frames above `depth`, close upvalues at or above `level` and cut
    /// the stack there.
    fn unwind_to(&mut self, thread: ThreadRef, depth: usize, level: usize) -> LuaResult<()> {
        self.close_upvalues(thread, level)?;
        let l = self.heap.thread_mut(thread)?;
        if l.ci > depth {
            tracing::trace!(from = l.ci, to = depth, "unwinding frames");
            l.ci = depth;
        }
        l.top = l.top.min(level);
        Ok(())
    }
}
