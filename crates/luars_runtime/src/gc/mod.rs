// Incremental garbage collector
//
// Tri-color mark and sweep over a non-moving, paged heap.
//
// GC States:
// - Pause: between cycles
// - Propagate: marking objects from the gray list
// - PropagateAgain: re-walking objects whose contents change without barriers
//   (active threads, open upvalues, weak tables, barrier-grayed tables)
// - Atomic: final marking, weak table clearing and the white flip, run as
//   one indivisible step
// - Sweep: freeing objects of the old white, one page per step
//
// Two whites are used so that objects created during the sweep carry the new
// white and survive it. Objects become dead when they still hold the old white
// after the flip.
//
// Tri-color invariant: while marking, black objects never point to white
// objects. Write barriers restore it whenever the mutator stores a reference.

mod gc_id;
mod gc_kind;
mod gc_metrics;
mod gc_object;
mod heap;
mod pacing;
mod page_allocator;
mod string_interner;

use std::time::Instant;

use crate::lua_value::{LuaTable, LuaUpvalue, LuaValue};
use crate::lua_vm::lua_limits::{
    GC_SWEEP_BLOCK_COST, LUA_MEMORY_CATEGORIES, LUAI_GCGOAL, LUAI_GCSTEPMUL, LUAI_GCSTEPSIZE,
};
use crate::lua_vm::{ExecutionCallbacks, LuaError, LuaResult, UserdataDtor};

pub use gc_id::*;
pub use gc_kind::*;
pub use gc_metrics::*;
pub use gc_object::*;
pub use heap::Heap;
pub use pacing::PacingState;
pub use page_allocator::{PageAllocator, SIZE_CLASSES, SizeClassConfig};
pub use string_interner::StringTable;

/// GC state machine
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GcState {
    Pause = 0,
    Propagate = 1,
    PropagateAgain = 2,
    Atomic = 3,
    Sweep = 4,
}

impl GcState {
    /// Check if must keep invariant (black cannot point to white)
    #[inline(always)]
    pub fn keep_invariant(self) -> bool {
        matches!(
            self,
            GcState::Propagate | GcState::PropagateAgain | GcState::Atomic
        )
    }
}

/// Collector tuning, changed only through the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GcConfig {
    /// Heap goal in percent of the live heap at cycle end
    pub goal: u32,
    /// Collector speed relative to allocation, in percent
    pub step_multiplier: u32,
    /// Bytes of allocation between automatic steps
    pub step_size: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            goal: LUAI_GCGOAL,
            step_multiplier: LUAI_GCSTEPMUL,
            step_size: LUAI_GCSTEPSIZE,
        }
    }
}

/// What the collector needs from the global state for one step.
pub(crate) struct GcContext<'a> {
    pub roots: &'a [LuaValue],
    pub udata_dtors: &'a [Option<UserdataDtor>],
    pub callbacks: Option<&'a dyn ExecutionCallbacks>,
}

/// Garbage Collector
pub struct GC {
    pub(crate) gc_state: GcState,
    /// current white color (0 or 1, flips each cycle)
    pub(crate) current_white: u8,

    // === Gray lists (for marking) ===
    /// Objects waiting to be visited
    pub(crate) gray: Vec<GcRef>,
    /// Objects to be revisited at atomic phase
    pub(crate) grayagain: Vec<GcRef>,
    /// Weak tables traversed this cycle, cleared at atomic phase
    pub(crate) weak: Vec<GcRef>,

    // === Sweep state ===
    sweep_page: u32,

    // === Accounting ===
    pub(crate) config: GcConfig,
    pub(crate) threshold: usize,
    pub(crate) total_bytes: usize,
    memcat_bytes: Vec<usize>,
    kind_bytes: [usize; GC_KIND_COUNT],

    pub(crate) pacing: PacingState,
    pub(crate) metrics: GcMetrics,

    /// Interned "__mode" key
    pub(crate) tm_mode: Option<GcRef>,

    /// Set while a full collection runs; its timing is not fed to pacing
    forced: bool,
    scratch: Vec<GcRef>,
    clock: Instant,
}

impl GC {
    pub fn new(config: GcConfig) -> Self {
        GC {
            gc_state: GcState::Pause,
            current_white: 0,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            sweep_page: 0,
            config,
            threshold: config.step_size as usize,
            total_bytes: 0,
            memcat_bytes: vec![0; LUA_MEMORY_CATEGORIES],
            kind_bytes: [0; GC_KIND_COUNT],
            pacing: PacingState::new(),
            metrics: GcMetrics::default(),
            tm_mode: None,
            forced: false,
            scratch: Vec::new(),
            clock: Instant::now(),
        }
    }

    #[inline]
    fn now(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    #[inline(always)]
    pub fn keep_invariant(&self) -> bool {
        self.gc_state.keep_invariant()
    }

    #[inline(always)]
    pub fn is_dead(&self, header: &GcHeader) -> bool {
        header.is_dead(other_white(self.current_white))
    }

    // ============ Accounting ============

    pub(crate) fn account_alloc(&mut self, header: &GcHeader) {
        let size = header.size as usize;
        self.total_bytes += size;
        self.memcat_bytes[header.memcat as usize] += size;
        self.kind_bytes[header.kind.index()] += size;
    }

    pub(crate) fn account_free(&mut self, header: &GcHeader) {
        let size = header.size as usize;
        self.total_bytes -= size;
        self.memcat_bytes[header.memcat as usize] -= size;
        self.kind_bytes[header.kind.index()] -= size;
    }

    /// Move an object's accounted size to `new_size`.
    pub(crate) fn account_resize(&mut self, header: &mut GcHeader, new_size: usize) {
        self.account_free(header);
        header.size = new_size as u32;
        self.account_alloc(header);
    }

    pub fn memory_category_bytes(&self, memcat: u8) -> usize {
        self.memcat_bytes[memcat as usize]
    }

    pub fn kind_bytes(&self, kind: GcObjectKind) -> usize {
        self.kind_bytes[kind.index()]
    }

    // ============ Marking ============

    fn mark_object(&mut self, heap: &mut Heap, r: GcRef) -> LuaResult<()> {
        let header = heap.header_mut(r)?;
        // Only need to mark if it is white
        if !header.is_white() {
            return Ok(());
        }
        match header.kind {
            GcObjectKind::String | GcObjectKind::Buffer => {
                header.make_black(); // Leaves become black immediately
            }
            _ => {
                header.make_gray();
                self.gray.push(r);
            }
        }
        Ok(())
    }

    #[inline]
    fn mark_value(&mut self, heap: &mut Heap, value: &LuaValue) -> LuaResult<()> {
        match value.as_gc_ref() {
            Some(r) => self.mark_object(heap, r),
            None => Ok(()),
        }
    }

    fn mark_roots(&mut self, heap: &mut Heap, roots: &[LuaValue]) -> LuaResult<()> {
        for root in roots {
            self.mark_value(heap, root)?;
        }
        Ok(())
    }

    fn mark_scratch(&mut self, heap: &mut Heap, refs: Vec<GcRef>) -> LuaResult<()> {
        for &r in &refs {
            self.mark_object(heap, r)?;
        }
        self.scratch = refs;
        Ok(())
    }

    /// Start a new cycle: reset gray lists and mark the root set
    fn mark_root(&mut self, heap: &mut Heap, roots: &[LuaValue]) -> LuaResult<()> {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();

        let now = self.now();
        self.pacing.begin_cycle(now);
        self.metrics
            .begin_cycle(now, self.total_bytes, self.threshold);
        tracing::debug!(
            total_bytes = self.total_bytes,
            threshold = self.threshold,
            "gc cycle start"
        );

        self.mark_roots(heap, roots)?;
        self.gc_state = GcState::Propagate;
        Ok(())
    }

    /// Traverse one gray object. Returns the work done in bytes.
    fn propagate_mark(&mut self, heap: &mut Heap) -> LuaResult<usize> {
        let Some(r) = self.gray.pop() else {
            return Ok(0);
        };
        let header = *heap.header(r)?;
        if header.is_black() {
            // queued twice
            return Ok(0);
        }
        match header.kind {
            GcObjectKind::Table => self.traverse_table(heap, r)?,
            GcObjectKind::Thread => self.traverse_thread(heap, r)?,
            GcObjectKind::Upvalue => self.traverse_upvalue(heap, r)?,
            _ => {
                let mut refs = std::mem::take(&mut self.scratch);
                refs.clear();
                let object = heap.object_mut(r)?;
                object.header.make_black();
                object.object.trace(&mut refs);
                self.mark_scratch(heap, refs)?;
            }
        }
        Ok(header.size as usize)
    }

    fn propagate_all(&mut self, heap: &mut Heap) -> LuaResult<usize> {
        let mut work = 0;
        while !self.gray.is_empty() {
            work += self.propagate_mark(heap)?;
        }
        Ok(work)
    }

    fn traverse_table(&mut self, heap: &mut Heap, r: GcRef) -> LuaResult<()> {
        let mut refs = std::mem::take(&mut self.scratch);
        refs.clear();

        let table = heap.table(r)?;
        let (weak_key, weak_value) = weak_mode(heap, self.tm_mode, table);
        refs.extend(table.metatable);
        if !weak_value {
            refs.extend(table.array_values().iter().filter_map(|v| v.as_gc_ref()));
        }
        if !(weak_key && weak_value) {
            for (k, v) in table.hash_entries() {
                if !weak_key {
                    refs.extend(k.as_gc_ref());
                }
                if !weak_value {
                    refs.extend(v.as_gc_ref());
                }
            }
        }

        if weak_key || weak_value {
            // keep weak tables gray; their entries are cleared at atomic phase
            self.weak.push(r);
        } else {
            heap.header_mut(r)?.make_black();
        }
        self.mark_scratch(heap, refs)
    }

    fn traverse_thread(&mut self, heap: &mut Heap, r: GcRef) -> LuaResult<()> {
        let mut refs = std::mem::take(&mut self.scratch);
        refs.clear();

        let atomic = self.gc_state == GcState::Atomic;
        let thread = heap.thread_mut(r)?;
        if atomic {
            thread.clear_unused_stack();
        }
        refs.extend(thread.live_stack().iter().filter_map(|v| v.as_gc_ref()));
        refs.extend(thread.open_upvalues.iter().map(|&(_, uv)| uv));
        let active = thread.is_active;

        if active && !atomic {
            // stack changes without barriers; revisit at atomic phase
            self.grayagain.push(r);
        } else {
            heap.header_mut(r)?.make_black();
        }
        self.mark_scratch(heap, refs)
    }

    fn traverse_upvalue(&mut self, heap: &mut Heap, r: GcRef) -> LuaResult<()> {
        let upvalue = *heap.upvalue(r)?;
        match upvalue {
            LuaUpvalue::Closed(value) => {
                heap.header_mut(r)?.make_black();
                self.mark_value(heap, &value)
            }
            LuaUpvalue::Open { thread, level } => {
                let value = heap
                    .thread(thread)?
                    .stack
                    .get(level)
                    .copied()
                    .unwrap_or_default();
                if self.gc_state == GcState::Atomic {
                    heap.header_mut(r)?.make_black();
                } else {
                    // the slot may change without barriers
                    self.grayagain.push(r);
                }
                self.mark_value(heap, &value)
            }
        }
    }

    /// Final marking and white flip. Must not interleave with the mutator.
    fn atomic(&mut self, heap: &mut Heap, roots: &[LuaValue]) -> LuaResult<usize> {
        self.gc_state = GcState::Atomic;
        let now = self.now();
        self.pacing.enter_atomic(now, self.total_bytes);
        self.metrics.curr_cycle.atomic_start_timestamp = now;
        self.metrics.curr_cycle.atomic_start_total_bytes = self.total_bytes;
        tracing::debug!(total_bytes = self.total_bytes, "gc atomic");

        let mut work = 0;
        // remark roots and whatever is still gray
        self.mark_roots(heap, roots)?;
        work += self.propagate_all(heap)?;

        // remark weak tables
        let weak = std::mem::take(&mut self.weak);
        self.gray.extend(weak);
        work += self.propagate_all(heap)?;

        // remark gray again
        let again = std::mem::take(&mut self.grayagain);
        self.gray.extend(again);
        work += self.propagate_all(heap)?;

        // remove collected objects from weak tables
        work += self.clear_weak_tables(heap)?;

        // flip current white
        self.current_white = other_white(self.current_white);
        self.sweep_page = 0;
        self.gc_state = GcState::Sweep;

        self.metrics.curr_cycle.atomic_time += self.now() - now;
        Ok(work)
    }

    fn clear_weak_tables(&mut self, heap: &mut Heap) -> LuaResult<usize> {
        let weak = std::mem::take(&mut self.weak);
        let mut work = 0;
        for &t in &weak {
            let mut refs = std::mem::take(&mut self.scratch);
            refs.clear();

            let (weak_key, weak_value) = weak_mode(heap, self.tm_mode, heap.table(t)?);
            // strings are values, never cleared from weak tables
            let table = heap.table(t)?;
            if weak_value {
                refs.extend(table.array_values().iter().filter_map(string_ref));
            }
            for (k, v) in table.hash_entries() {
                if weak_key {
                    refs.extend(string_ref(k));
                }
                if weak_value {
                    refs.extend(string_ref(v));
                }
            }
            for &s in &refs {
                heap.header_mut(s)?.make_black();
            }
            self.scratch = refs;

            let mut table = std::mem::take(heap.table_mut(t)?);
            let removed = table.retain_entries(|k, v| {
                !((weak_key && is_cleared(heap, k)) || (weak_value && is_cleared(heap, v)))
            });
            work += table.entry_count() + removed;
            let new_size = std::mem::size_of::<GcHeader>() + table.memory_size();
            *heap.table_mut(t)? = table;

            if removed > 0 {
                let header = heap.header_mut(t)?;
                self.account_resize(header, new_size);
            }
        }
        Ok(work)
    }

    // ============ Sweeping ============

    /// Sweep the next collectable page. Returns (work, finished).
    fn sweep_step(&mut self, heap: &mut Heap, ctx: &GcContext) -> LuaResult<(usize, bool)> {
        let end = heap.pages.gco_page_end();
        let current_white = self.current_white;
        let dead_white = other_white(current_white);

        while self.sweep_page < end {
            let page = self.sweep_page;
            self.sweep_page += 1;
            let Some(slots) = heap.pages.gco_page_slots(page) else {
                continue;
            };

            for slot in 0..slots {
                let r = GcRef::new(page, slot);
                let dead = match heap.pages.gco_mut(r) {
                    None => continue,
                    Some(object) if object.header.is_dead(dead_white) => true,
                    Some(object) => {
                        object.header.make_white(current_white);
                        object.header.grow_older();
                        false
                    }
                };
                if dead {
                    self.free_object(heap, ctx, r)?;
                }
            }
            return Ok((slots as usize * GC_SWEEP_BLOCK_COST, false));
        }
        Ok((0, true))
    }

    /// Release a dead object and run its finalization.
    pub(crate) fn free_object(
        &mut self,
        heap: &mut Heap,
        ctx: &GcContext,
        r: GcRef,
    ) -> LuaResult<()> {
        let object = heap
            .pages
            .free_gco(r)
            .ok_or_else(|| heap.violation())?;
        self.account_free(&object.header);

        match object.object {
            GcObject::String(s) => {
                heap.strings.remove(r, s.hash());
            }
            GcObject::Userdata(mut u) => {
                if let Some(Some(dtor)) = ctx.udata_dtors.get(u.tag as usize) {
                    dtor(u.tag, &mut u.data);
                }
            }
            GcObject::Proto(p) => {
                if p.has_native() {
                    if let Some(callbacks) = ctx.callbacks {
                        callbacks.on_destroy(&p);
                    }
                }
            }
            GcObject::Buffer(b) => {
                if let Some(block) = b.block {
                    heap.pages.free_block(block);
                }
            }
            GcObject::Thread(l) => {
                // upvalues still in use take over the values they alias
                for &(level, uv) in &l.open_upvalues {
                    let upvalue = heap.pages.gco_mut(uv).map(GcBox::as_upvalue_mut);
                    if let Some(Ok(upvalue)) = upvalue {
                        if matches!(*upvalue, LuaUpvalue::Open { thread, .. } if thread == r) {
                            *upvalue =
                                LuaUpvalue::Closed(l.stack.get(level).copied().unwrap_or_default());
                        }
                    }
                }
                heap.threads.retain(|&t| t != r);
            }
            GcObject::Upvalue(LuaUpvalue::Open { thread, level }) => {
                if let Some(Ok(l)) = heap.pages.gco_mut(thread).map(GcBox::as_thread_mut) {
                    l.open_upvalues.retain(|&e| e != (level, r));
                }
            }
            GcObject::Table(_) | GcObject::Closure(_) | GcObject::Upvalue(_) => {}
        }
        Ok(())
    }

    /// Return to pause after the last page is swept
    fn finish_cycle(&mut self, heap: &mut Heap) {
        heap.strings.shrink_if_sparse();
        self.gc_state = GcState::Pause;

        let now = self.now();
        if self.forced {
            self.pacing
                .end_forced_cycle(now, self.total_bytes, self.config.goal);
        } else {
            self.threshold = self
                .pacing
                .end_cycle(now, self.total_bytes, self.config.goal);
        }
        self.metrics.finish_cycle(now, self.total_bytes);
        tracing::debug!(
            total_bytes = self.total_bytes,
            threshold = self.threshold,
            heap_goal = self.pacing.heap_goal_bytes,
            cycles = self.metrics.completed_cycles,
            "gc cycle end"
        );
    }

    // ============ Core GC Implementation ============

    /// Single GC step. Returns the work done in bytes.
    pub(crate) fn single_step(&mut self, heap: &mut Heap, ctx: &GcContext) -> LuaResult<usize> {
        match self.gc_state {
            GcState::Pause => {
                self.mark_root(heap, ctx.roots)?;
                Ok(0)
            }
            GcState::Propagate => {
                if self.gray.is_empty() {
                    let again = std::mem::take(&mut self.grayagain);
                    self.gray = again;
                    self.gc_state = GcState::PropagateAgain;
                    Ok(0)
                } else {
                    let work = self.propagate_mark(heap)?;
                    self.metrics.curr_cycle.propagate_work += work;
                    Ok(work)
                }
            }
            GcState::PropagateAgain => {
                if self.gray.is_empty() {
                    self.atomic(heap, ctx.roots)
                } else {
                    let work = self.propagate_mark(heap)?;
                    self.metrics.curr_cycle.propagate_again_work += work;
                    Ok(work)
                }
            }
            GcState::Atomic => self.atomic(heap, ctx.roots),
            GcState::Sweep => {
                let (work, finished) = self.sweep_step(heap, ctx)?;
                if finished {
                    self.finish_cycle(heap);
                }
                Ok(work)
            }
        }
    }

    /// Run steps until `limit` bytes of work are done or the cycle ends.
    fn gc_step(&mut self, heap: &mut Heap, ctx: &GcContext, limit: usize) -> LuaResult<usize> {
        let start = self.now();
        let marking = self.keep_invariant();
        let mut cost = 0;
        while cost < limit {
            cost += self.single_step(heap, ctx)?;
            if self.gc_state == GcState::Pause {
                break;
            }
        }

        let elapsed = self.now() - start;
        let cycle = if self.gc_state == GcState::Pause {
            &mut self.metrics.last_cycle
        } else {
            &mut self.metrics.curr_cycle
        };
        if marking {
            cycle.mark_time += elapsed;
            cycle.mark_work += cost;
        } else {
            cycle.sweep_time += elapsed;
            cycle.sweep_work += cost;
        }
        tracing::trace!(work = cost, state = ?self.gc_state, "gc step");
        Ok(cost)
    }

    /// Automatic step, paid for by allocation.
    pub(crate) fn assist_step(&mut self, heap: &mut Heap, ctx: &GcContext) -> LuaResult<usize> {
        let start = self.now();
        let stepmul = self.config.step_multiplier.max(1) as usize;
        let limit = self.config.step_size as usize * stepmul / 100;
        let debt = self.total_bytes.saturating_sub(self.threshold);
        let marking = self.keep_invariant();

        let work = self.gc_step(heap, ctx, limit)?;

        // if the cycle finished, the threshold was set by the pacing controller
        if self.gc_state != GcState::Pause {
            let actual_step_size = work * 100 / stepmul;
            self.threshold = self.total_bytes + actual_step_size;
            if self.threshold >= debt {
                self.threshold -= debt;
            }
        }

        let elapsed = self.now() - start;
        self.metrics.step_assist_time_acc += elapsed;
        let cycle = if self.gc_state == GcState::Pause {
            &mut self.metrics.last_cycle
        } else {
            &mut self.metrics.curr_cycle
        };
        cycle.assist_work += work;
        if marking {
            cycle.mark_assist_time += elapsed;
        } else {
            cycle.sweep_assist_time += elapsed;
        }
        Ok(work)
    }

    /// Explicitly requested step with a byte budget.
    pub(crate) fn explicit_step(
        &mut self,
        heap: &mut Heap,
        ctx: &GcContext,
        budget: usize,
    ) -> LuaResult<usize> {
        let start = self.now();
        let marking = self.keep_invariant();
        let work = self.gc_step(heap, ctx, budget)?;

        let elapsed = self.now() - start;
        self.metrics.step_explicit_time_acc += elapsed;
        let cycle = if self.gc_state == GcState::Pause {
            &mut self.metrics.last_cycle
        } else {
            &mut self.metrics.curr_cycle
        };
        cycle.explicit_work += work;
        if marking {
            cycle.mark_explicit_steps += 1;
            cycle.mark_max_explicit_time = cycle.mark_max_explicit_time.max(elapsed);
        } else {
            cycle.sweep_explicit_steps += 1;
            cycle.sweep_max_explicit_time = cycle.sweep_max_explicit_time.max(elapsed);
        }
        Ok(work)
    }

    /// Run a complete collection cycle from whatever state the collector is in.
    pub(crate) fn full_collect(&mut self, heap: &mut Heap, ctx: &GcContext) -> LuaResult<()> {
        self.forced = true;
        let result = self.run_full_cycle(heap, ctx);
        self.forced = false;
        result?;

        // place the trigger so that the goal is reached at the configured
        // collector speed; goal and step multiplier are percentages
        let goal = self.config.goal as usize;
        let stepmul = self.config.step_multiplier.max(1) as usize;
        let factor = (goal * stepmul / 100).saturating_sub(100);
        self.threshold = (self.total_bytes.saturating_mul(factor) / stepmul).max(self.total_bytes);
        tracing::debug!(
            total_bytes = self.total_bytes,
            threshold = self.threshold,
            "full gc done"
        );
        Ok(())
    }

    fn run_full_cycle(&mut self, heap: &mut Heap, ctx: &GcContext) -> LuaResult<()> {
        if self.keep_invariant() {
            // nothing carries the old white yet, so sweeping without a flip
            // only resets marks
            self.gray.clear();
            self.grayagain.clear();
            self.weak.clear();
            self.sweep_page = 0;
            self.gc_state = GcState::Sweep;
        }
        // finish any pending sweep phase
        while self.gc_state != GcState::Pause {
            self.single_step(heap, ctx)?;
        }

        self.mark_root(heap, ctx.roots)?;
        while self.gc_state != GcState::Pause {
            self.single_step(heap, ctx)?;
        }
        Ok(())
    }

    // ============ GC Write Barriers ============

    /// Forward barrier
    /// Called when a black object 'o' is modified to point to white object 'v'
    pub(crate) fn barrier(&mut self, heap: &mut Heap, o: GcRef, v: &LuaValue) -> LuaResult<()> {
        let Some(vr) = v.as_gc_ref() else {
            return Ok(());
        };
        if !heap.header(o)?.is_black() || !heap.header(vr)?.is_white() {
            return Ok(());
        }
        if self.keep_invariant() {
            // Mark 'v' immediately to restore invariant
            self.mark_object(heap, vr)
        } else {
            // In sweep: make 'o' white to avoid repeated barriers
            heap.header_mut(o)?.make_white(self.current_white);
            Ok(())
        }
    }

    /// Backward barrier
    /// Instead of marking the stored value, the black container goes gray
    /// again and is revisited at atomic phase
    pub(crate) fn barrier_back(&mut self, heap: &mut Heap, o: GcRef) -> LuaResult<()> {
        let current_white = self.current_white;
        let keep = self.keep_invariant();
        let header = heap.header_mut(o)?;
        if !header.is_black() {
            return Ok(());
        }
        if keep {
            header.make_gray();
            self.grayagain.push(o);
        } else {
            header.make_white(current_white);
        }
        Ok(())
    }

    // ============ Verification ============

    /// Check the tri-color invariant and byte accounting over the whole heap.
    pub(crate) fn verify(&self, heap: &Heap) -> LuaResult<()> {
        let mut total = 0usize;
        let mut memcat = vec![0usize; LUA_MEMORY_CATEGORIES];
        let mut kinds = [0usize; GC_KIND_COUNT];
        let mut refs = Vec::new();

        for r in heap.pages.gco_refs() {
            let object = heap.object(r)?;
            let header = &object.header;
            let size = header.size as usize;
            total += size;
            memcat[header.memcat as usize] += size;
            kinds[header.kind.index()] += size;

            if header.kind != object.object.kind() {
                tracing::error!(?r, "object kind does not match its header");
                return Err(LuaError::InvariantViolation);
            }
            if self.gc_state == GcState::Sweep && self.is_dead(header) {
                continue;
            }

            refs.clear();
            object.object.trace(&mut refs);
            for &child in &refs {
                let Ok(child_header) = heap.header(child) else {
                    tracing::error!(?r, ?child, "live object refers to a freed object");
                    return Err(LuaError::InvariantViolation);
                };
                if self.keep_invariant() && header.is_black() && child_header.is_white() {
                    tracing::error!(
                        parent = ?r,
                        parent_kind = header.kind.name(),
                        ?child,
                        child_kind = child_header.kind.name(),
                        "black object refers to a white object"
                    );
                    return Err(LuaError::InvariantViolation);
                }
            }
        }

        if total != self.total_bytes || memcat != self.memcat_bytes || kinds != self.kind_bytes {
            tracing::error!(
                counted = total,
                accounted = self.total_bytes,
                "heap byte accounting mismatch"
            );
            return Err(LuaError::InvariantViolation);
        }
        Ok(())
    }
}

/// Weakness of a table's keys and values, from its metatable's `__mode`.
fn weak_mode(heap: &Heap, tm_mode: Option<GcRef>, table: &LuaTable) -> (bool, bool) {
    let (Some(mt), Some(mode_key)) = (table.metatable, tm_mode) else {
        return (false, false);
    };
    let Ok(mt) = heap.table(mt) else {
        return (false, false);
    };
    match mt.get(&LuaValue::String(mode_key)) {
        LuaValue::String(mode) => heap.string(mode).map_or((false, false), |s| {
            let bytes = s.as_bytes();
            (bytes.contains(&b'k'), bytes.contains(&b'v'))
        }),
        _ => (false, false),
    }
}

#[inline]
fn string_ref(value: &LuaValue) -> Option<GcRef> {
    match *value {
        LuaValue::String(r) => Some(r),
        _ => None,
    }
}

/// A weak entry is cleared when it refers to an unmarked object.
/// Strings count as values and are never cleared.
fn is_cleared(heap: &Heap, value: &LuaValue) -> bool {
    match *value {
        LuaValue::String(_) => false,
        _ => value
            .as_gc_ref()
            .is_some_and(|r| heap.header(r).is_ok_and(|h| h.is_white())),
    }
}
