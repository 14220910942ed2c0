// Lua Virtual Machine global state
// Owns the heap, the collector and every thread. There is no ambient global:
// all operations take `&mut LuaVM` and address threads through a ThreadRef.
mod call;
mod call_info;
mod const_string;
mod execution_callbacks;
mod lua_error;
pub mod lua_limits;
mod lua_state;
mod safe_option;

use std::rc::Rc;

use crate::gc::{
    GC, GcBox, GcConfig, GcContext, GcCycleMetrics, GcHeader, GcMetrics, GcObject, GcObjectKind,
    GcRef, GcState, Heap, ThreadRef,
};
use crate::lua_value::{
    LUA_T_COUNT, LuaBuffer, LuaClosure, LuaProto, LuaString, LuaTable, LuaType, LuaUpvalue,
    LuaUserdata, LuaValue,
};
use crate::lua_vm::lua_limits::{LUA_LUTAG_LIMIT, LUA_UTAG_LIMIT};

pub use call_info::{CallInfo, call_status};
pub use const_string::{ConstString, TM_N, TmKind};
pub use execution_callbacks::ExecutionCallbacks;
pub use lua_error::{LuaError, LuaResult};
pub use lua_state::{LuaState, StackRef, ThreadStatus};
pub use safe_option::SafeOption;

use const_string::{MEMERR_MSG, STACK_OVERFLOW_MSG};

/// Native function: receives its arguments in the current frame of `thread`
/// and returns how many results it pushed.
pub type CFunction = fn(&mut LuaVM, ThreadRef) -> LuaResult<usize>;

/// Destructor run when a userdata with the registered tag is freed.
pub type UserdataDtor = fn(u8, &mut [u8]);

/// Returned by `registry_ref` for nil values
pub const LUA_REFNIL: i32 = 0;
/// Never returned by `registry_ref`; safe as a "no reference" marker
pub const LUA_NOREF: i32 = -1;

pub struct LuaVM {
    pub(crate) heap: Heap,
    pub(crate) gc: GC,

    pub(crate) main_thread: ThreadRef,

    // Registry table (like Lua's LUA_REGISTRYINDEX)
    // Stores objects that must stay alive but are not visible to scripts
    pub(crate) registry: GcRef,
    /// Head of the free-slot chain threaded through the registry, 0 when empty
    registry_free: i32,

    /// Metatables shared by every value of a basic type
    pub(crate) metatables: [Option<GcRef>; LUA_T_COUNT],
    pub(crate) const_strings: ConstString,

    pub(crate) udata_metatables: Vec<Option<GcRef>>,
    pub(crate) udata_dtors: Vec<Option<UserdataDtor>>,
    light_userdata_names: Vec<Option<GcRef>>,

    callbacks: Option<Rc<dyn ExecutionCallbacks>>,
    pub(crate) safe_option: SafeOption,
    active_memcat: u8,

    // ===== Lightweight Error Storage =====
    // Error data lives here instead of in Result<T, LuaError>
    /// Message of the last RuntimeError
    pub(crate) error_msg: String,
    /// Value of the last error when one was raised explicitly
    pub(crate) error_object: LuaValue,

    roots: Vec<LuaValue>,
}

impl LuaVM {
    pub fn new(option: SafeOption) -> LuaResult<Self> {
        Self::with_gc_config(option, GcConfig::default())
    }

    pub fn with_gc_config(option: SafeOption, config: GcConfig) -> LuaResult<Self> {
        let placeholder = GcRef::new(0, 0);
        let mut vm = LuaVM {
            heap: Heap::new(option.max_memory_limit),
            gc: GC::new(config),
            main_thread: placeholder,
            registry: placeholder,
            registry_free: 0,
            metatables: [None; LUA_T_COUNT],
            const_strings: ConstString::default(),
            udata_metatables: vec![None; LUA_UTAG_LIMIT],
            udata_dtors: vec![None; LUA_UTAG_LIMIT],
            light_userdata_names: vec![None; LUA_LUTAG_LIMIT],
            callbacks: None,
            safe_option: option,
            active_memcat: 0,
            error_msg: String::new(),
            error_object: LuaValue::Nil,
            roots: Vec::new(),
        };

        let state = LuaState::new(&vm.safe_option, true);
        vm.main_thread = vm.alloc_object(GcObject::Thread(Box::new(state)))?;
        vm.heap.header_mut(vm.main_thread)?.set_fixed();
        vm.heap.threads.push(vm.main_thread);

        vm.registry = vm.create_table(0, 0)?;
        vm.init_const_strings()?;
        tracing::debug!(
            total_bytes = vm.gc.total_bytes,
            pages = vm.heap.pages.page_count(),
            "vm created"
        );
        Ok(vm)
    }

    fn init_const_strings(&mut self) -> LuaResult<()> {
        for tm in TmKind::ALL {
            let s = self.create_fixed_string(tm.name())?;
            self.const_strings.tm_names[tm as usize] = s;
        }
        for t in LuaType::ALL {
            let s = self.create_fixed_string(t.name())?;
            self.const_strings.type_names[t as usize] = s;
        }
        self.const_strings.memerr_msg = self.create_fixed_string(MEMERR_MSG)?;
        self.const_strings.stack_overflow_msg = self.create_fixed_string(STACK_OVERFLOW_MSG)?;
        self.gc.tm_mode = self.const_strings.tm(TmKind::Mode).as_gc_ref();
        Ok(())
    }

    fn create_fixed_string(&mut self, s: &str) -> LuaResult<LuaValue> {
        let r = self.create_string(s)?;
        self.heap.header_mut(r)?.set_fixed();
        Ok(LuaValue::String(r))
    }

    #[inline]
    pub fn main_thread(&self) -> ThreadRef {
        self.main_thread
    }

    #[inline]
    pub fn registry(&self) -> GcRef {
        self.registry
    }

    #[inline]
    pub fn const_strings(&self) -> &ConstString {
        &self.const_strings
    }

    #[inline]
    pub fn safe_option(&self) -> &SafeOption {
        &self.safe_option
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.heap.is_poisoned()
    }

    // ============ Errors ============

    #[inline]
    pub(crate) fn check_aborted(&self) -> LuaResult<()> {
        if self.heap.is_poisoned() {
            Err(LuaError::InvariantViolation)
        } else {
            Ok(())
        }
    }

    /// Latch InvariantViolation so later entry points refuse to run.
    #[inline]
    pub(crate) fn guard<T>(&self, result: LuaResult<T>) -> LuaResult<T> {
        self.heap.check(result)
    }

    /// Raise a runtime error with a message
    pub fn error(&mut self, message: impl Into<String>) -> LuaError {
        self.error_msg = message.into();
        self.error_object = LuaValue::Nil;
        LuaError::RuntimeError
    }

    /// Raise a runtime error carrying an arbitrary value
    pub fn error_with_value(&mut self, value: LuaValue) -> LuaError {
        self.error_msg = match value {
            LuaValue::String(r) => self
                .heap
                .string(r)
                .map(|s| String::from_utf8_lossy(s.as_bytes()).into_owned())
                .unwrap_or_default(),
            _ => format!("(error object is a {} value)", value.type_name()),
        };
        self.error_object = value;
        LuaError::RuntimeError
    }

    pub fn get_error_message(&self) -> &str {
        &self.error_msg
    }

    pub fn clear_error(&mut self) {
        self.error_msg.clear();
        self.error_object = LuaValue::Nil;
    }

    fn memory_error(&mut self, requested: usize) -> LuaError {
        tracing::warn!(
            requested,
            total_bytes = self.gc.total_bytes,
            limit = self.safe_option.max_memory_limit,
            "out of memory"
        );
        self.error_msg = MEMERR_MSG.to_string();
        self.error_object = LuaValue::Nil;
        LuaError::OutOfMemory
    }

    pub(crate) fn stack_overflow(&mut self) -> LuaError {
        tracing::warn!("stack overflow");
        self.error_msg = STACK_OVERFLOW_MSG.to_string();
        self.error_object = LuaValue::Nil;
        LuaError::StackOverflow
    }

    /// The value a protected call reports for `err`. Never allocates for
    /// memory and stack errors.
    pub(crate) fn error_value(&mut self, err: LuaError) -> LuaValue {
        match err {
            LuaError::OutOfMemory => self.const_strings.memerr_msg,
            LuaError::StackOverflow => self.const_strings.stack_overflow_msg,
            LuaError::RuntimeError => {
                let value = std::mem::take(&mut self.error_object);
                if !value.is_nil() {
                    return value;
                }
                let message = std::mem::take(&mut self.error_msg);
                let value = match self.create_string(&message) {
                    Ok(r) => LuaValue::String(r),
                    Err(_) => self.const_strings.memerr_msg,
                };
                self.error_msg = message;
                value
            }
            LuaError::InvariantViolation => LuaValue::Nil,
        }
    }

    // ============ Allocation ============

    /// Place a new object in the heap with the current white and the active
    /// memory category. Never runs the collector.
    pub(crate) fn alloc_object(&mut self, object: GcObject) -> LuaResult<GcRef> {
        self.check_aborted()?;
        let size = object.compute_size();
        if self.gc.total_bytes.saturating_add(size) > self.safe_option.max_memory_limit {
            return Err(self.memory_error(size));
        }
        let header = GcHeader::with_white(
            object.kind(),
            self.gc.current_white,
            self.active_memcat,
            size,
        );
        match self.heap.pages.alloc_gco(size, GcBox { header, object }) {
            Ok((r, _)) => {
                self.gc.account_alloc(&header);
                Ok(r)
            }
            Err(_) => Err(self.memory_error(size)),
        }
    }

    /// Allocate an object of `kind` with `size` bytes of payload.
    /// Closures need a function and cannot be made this way.
    pub fn allocate(&mut self, kind: GcObjectKind, size: usize) -> LuaResult<GcRef> {
        match kind {
            GcObjectKind::String => self.create_bytes(&vec![0u8; size]),
            GcObjectKind::Table => self.create_table(0, size),
            GcObjectKind::Userdata => self.create_userdata(size, 0),
            GcObjectKind::Buffer => self.create_buffer(size),
            GcObjectKind::Proto => self.create_proto(LuaProto::default()),
            GcObjectKind::Upvalue => self.create_upvalue(LuaValue::Nil),
            GcObjectKind::Thread => self.new_thread(),
            GcObjectKind::Closure => Err(self.error("cannot allocate a closure without a function")),
        }
    }

    pub fn create_string(&mut self, s: &str) -> LuaResult<GcRef> {
        self.create_bytes(s.as_bytes())
    }

    /// Intern a byte string. A dead string that has not been swept yet is
    /// brought back to life instead of being duplicated.
    pub fn create_bytes(&mut self, bytes: &[u8]) -> LuaResult<GcRef> {
        self.check_aborted()?;
        let hash = self.heap.strings.hash_bytes(bytes);
        if let Some(r) = self.heap.strings.find(&self.heap.pages, bytes, hash) {
            let current_white = self.gc.current_white;
            let header = self.heap.header_mut(r)?;
            if self.gc.is_dead(header) {
                header.make_white(current_white);
            }
            return Ok(r);
        }
        let r = self.alloc_object(GcObject::String(LuaString::new(bytes, hash)))?;
        self.heap.strings.insert(r, hash);
        Ok(r)
    }

    pub fn create_table(&mut self, narr: usize, nrec: usize) -> LuaResult<GcRef> {
        self.alloc_object(GcObject::Table(LuaTable::new(narr, nrec)))
    }

    pub fn create_native_closure(
        &mut self,
        func: CFunction,
        upvalues: Vec<LuaValue>,
    ) -> LuaResult<GcRef> {
        self.alloc_object(GcObject::Closure(LuaClosure::Native { func, upvalues }))
    }

    /// Bytecode closure over `proto`. Every upvalue must be an upvalue object.
    pub fn create_closure(&mut self, proto: GcRef, upvalues: Vec<GcRef>) -> LuaResult<GcRef> {
        self.heap.proto(proto)?;
        for &uv in &upvalues {
            self.heap.upvalue(uv)?;
        }
        self.alloc_object(GcObject::Closure(LuaClosure::Lua { proto, upvalues }))
    }

    pub fn create_proto(&mut self, proto: LuaProto) -> LuaResult<GcRef> {
        self.alloc_object(GcObject::Proto(proto))
    }

    /// Closed upvalue holding `value`.
    pub fn create_upvalue(&mut self, value: LuaValue) -> LuaResult<GcRef> {
        self.alloc_object(GcObject::Upvalue(LuaUpvalue::Closed(value)))
    }

    /// Zeroed userdata of `size` bytes. Picks up the metatable registered
    /// for `tag`.
    pub fn create_userdata(&mut self, size: usize, tag: u8) -> LuaResult<GcRef> {
        if tag as usize >= LUA_UTAG_LIMIT {
            return Err(self.error(format!("userdata tag {} out of range", tag)));
        }
        let metatable = self.udata_metatables[tag as usize];
        self.alloc_object(GcObject::Userdata(LuaUserdata::new(tag, size, metatable)))
    }

    /// Zeroed buffer of `size` bytes, stored in an ordinary page block.
    pub fn create_buffer(&mut self, size: usize) -> LuaResult<GcRef> {
        self.check_aborted()?;
        let block = if size > 0 {
            match self.heap.pages.alloc_block(size) {
                Ok(block) => Some(block),
                Err(_) => return Err(self.memory_error(size)),
            }
        } else {
            None
        };
        let result = self.alloc_object(GcObject::Buffer(LuaBuffer { len: size, block }));
        if result.is_err() {
            if let Some(block) = block {
                self.heap.pages.free_block(block);
            }
        }
        result
    }

    /// Create a coroutine thread. It is collected like any other object once
    /// unreachable.
    pub fn new_thread(&mut self) -> LuaResult<ThreadRef> {
        let state = LuaState::new(&self.safe_option, false);
        let r = self.alloc_object(GcObject::Thread(Box::new(state)))?;
        self.heap.threads.push(r);
        Ok(r)
    }

    /// Recompute an object's accounted size after it changed shape. Growth
    /// that takes the heap past the memory limit stays accounted and is
    /// reported as OutOfMemory.
    pub(crate) fn refresh_object_size(&mut self, r: GcRef) -> LuaResult<()> {
        let object = self.heap.object_mut(r)?;
        let old_size = object.header.size as usize;
        let new_size = object.object.compute_size();
        if old_size == new_size {
            return Ok(());
        }
        self.gc.account_resize(&mut object.header, new_size);
        if new_size > old_size && self.gc.total_bytes > self.safe_option.max_memory_limit {
            return Err(self.memory_error(new_size - old_size));
        }
        Ok(())
    }

    // ============ Object access ============

    pub fn string(&self, r: GcRef) -> LuaResult<&LuaString> {
        self.heap.string(r)
    }

    /// UTF-8 view of a string value.
    pub fn to_str(&self, value: &LuaValue) -> Option<&str> {
        match *value {
            LuaValue::String(r) => self.heap.string(r).ok()?.as_str(),
            _ => None,
        }
    }

    pub fn thread(&self, r: ThreadRef) -> LuaResult<&LuaState> {
        self.heap.thread(r)
    }

    pub fn proto(&self, r: GcRef) -> LuaResult<&LuaProto> {
        self.heap.proto(r)
    }

    pub fn closure(&self, r: GcRef) -> LuaResult<&LuaClosure> {
        self.heap.closure(r)
    }

    pub fn upvalue(&self, r: GcRef) -> LuaResult<&LuaUpvalue> {
        self.heap.upvalue(r)
    }

    pub fn userdata(&self, r: GcRef) -> LuaResult<&LuaUserdata> {
        self.heap.userdata(r)
    }

    pub fn userdata_data_mut(&mut self, r: GcRef) -> LuaResult<&mut [u8]> {
        Ok(&mut self.heap.userdata_mut(r)?.data)
    }

    pub fn buffer_data(&self, r: GcRef) -> LuaResult<&[u8]> {
        let buffer = *self.heap.buffer(r)?;
        match buffer.block {
            Some(block) => self.heap.block(block).map(|bytes| &bytes[..buffer.len]),
            None => Ok(Default::default()),
        }
    }

    pub fn buffer_data_mut(&mut self, r: GcRef) -> LuaResult<&mut [u8]> {
        let buffer = *self.heap.buffer(r)?;
        match buffer.block {
            Some(block) => self.heap.block_mut(block).map(|bytes| &mut bytes[..buffer.len]),
            None => Ok(Default::default()),
        }
    }

    // ============ Tables ============

    pub fn table_get(&self, t: GcRef, key: &LuaValue) -> LuaResult<LuaValue> {
        Ok(self.heap.table(t)?.get(key))
    }

    /// Raw set with a backward barrier on the table.
    pub fn table_set(&mut self, t: GcRef, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        self.check_aborted()?;
        match key {
            LuaValue::Nil => return Err(self.error("table index is nil")),
            LuaValue::Number(n) if n.is_nan() => return Err(self.error("table index is NaN")),
            _ => {}
        }
        self.heap.table_mut(t)?.set(key, value);
        if key.is_collectable() || value.is_collectable() {
            let result = self.gc.barrier_back(&mut self.heap, t);
            self.guard(result)?;
        }
        self.refresh_object_size(t)
    }

    pub fn table_len(&self, t: GcRef) -> LuaResult<usize> {
        Ok(self.heap.table(t)?.len())
    }

    /// Metatable of a value: per object for tables and userdata, per type
    /// otherwise.
    pub fn get_metatable(&self, value: &LuaValue) -> LuaResult<Option<GcRef>> {
        match *value {
            LuaValue::Table(t) => Ok(self.heap.table(t)?.metatable),
            LuaValue::Userdata(u) => Ok(self.heap.userdata(u)?.metatable),
            _ => Ok(self.metatables[value.value_type() as usize]),
        }
    }

    pub fn set_metatable(&mut self, value: &LuaValue, mt: Option<GcRef>) -> LuaResult<()> {
        self.check_aborted()?;
        if let Some(m) = mt {
            self.heap.table(m)?;
        }
        let owner = match *value {
            LuaValue::Table(t) => {
                self.heap.table_mut(t)?.metatable = mt;
                t
            }
            LuaValue::Userdata(u) => {
                self.heap.userdata_mut(u)?.metatable = mt;
                u
            }
            _ => {
                // per-type metatables are roots, remarked at atomic phase
                self.metatables[value.value_type() as usize] = mt;
                return Ok(());
            }
        };
        if let Some(m) = mt {
            let result = self.gc.barrier(&mut self.heap, owner, &LuaValue::Table(m));
            self.guard(result)?;
        }
        Ok(())
    }

    // ============ Upvalues ============

    pub fn get_upvalue_value(&self, uv: GcRef) -> LuaResult<LuaValue> {
        match *self.heap.upvalue(uv)? {
            LuaUpvalue::Closed(value) => Ok(value),
            LuaUpvalue::Open { thread, level } => Ok(self
                .heap
                .thread(thread)?
                .stack
                .get(level)
                .copied()
                .unwrap_or_default()),
        }
    }

    /// Write through an upvalue: into its own slot when closed, into the
    /// aliased stack slot when open.
    pub fn set_upvalue_value(&mut self, uv: GcRef, value: LuaValue) -> LuaResult<()> {
        self.check_aborted()?;
        let upvalue = *self.heap.upvalue(uv)?;
        let result = match upvalue {
            LuaUpvalue::Closed(_) => {
                *self.heap.upvalue_mut(uv)? = LuaUpvalue::Closed(value);
                self.gc.barrier(&mut self.heap, uv, &value)
            }
            LuaUpvalue::Open { thread, level } => {
                let l = self.heap.thread_mut(thread)?;
                match l.stack.get_mut(level) {
                    Some(slot) => *slot = value,
                    None => return Err(self.heap.violation()),
                }
                self.gc.barrier_back(&mut self.heap, thread)
            }
        };
        self.guard(result)
    }

    pub fn get_closure_upvalue(&self, closure: GcRef, index: usize) -> LuaResult<LuaValue> {
        match self.heap.closure(closure)? {
            LuaClosure::Native { upvalues, .. } => Ok(upvalues.get(index).copied().unwrap_or_default()),
            LuaClosure::Lua { upvalues, .. } => match upvalues.get(index) {
                Some(&uv) => self.get_upvalue_value(uv),
                None => Ok(LuaValue::Nil),
            },
        }
    }

    pub fn set_closure_upvalue(
        &mut self,
        closure: GcRef,
        index: usize,
        value: LuaValue,
    ) -> LuaResult<()> {
        self.check_aborted()?;
        // Some(None): stored in a native closure, Some(Some(uv)): goes through uv
        let target = match self.heap.closure_mut(closure)? {
            LuaClosure::Native { upvalues, .. } => upvalues.get_mut(index).map(|slot| {
                *slot = value;
                None
            }),
            LuaClosure::Lua { upvalues, .. } => upvalues.get(index).map(|&uv| Some(uv)),
        };
        match target {
            None => Err(self.error("upvalue index out of range")),
            Some(Some(uv)) => self.set_upvalue_value(uv, value),
            Some(None) => {
                let result = self.gc.barrier(&mut self.heap, closure, &value);
                self.guard(result)
            }
        }
    }

    // ============ Registry ============

    /// Anchor `value` in the registry and return its slot. Nil gets
    /// `LUA_REFNIL` and takes no slot.
    pub fn registry_ref(&mut self, value: LuaValue) -> LuaResult<i32> {
        if value.is_nil() {
            return Ok(LUA_REFNIL);
        }
        let registry = self.registry;
        let slot = if self.registry_free != 0 {
            let slot = self.registry_free;
            self.registry_free = match self.table_get(registry, &LuaValue::from(slot))? {
                LuaValue::Number(next) => next as i32,
                _ => 0,
            };
            slot
        } else {
            self.table_len(registry)? as i32 + 1
        };
        self.table_set(registry, LuaValue::from(slot), value)?;
        Ok(slot)
    }

    /// Release a registry slot; it is reused by later refs.
    pub fn registry_unref(&mut self, slot: i32) -> LuaResult<()> {
        if slot <= LUA_REFNIL {
            return Ok(());
        }
        let registry = self.registry;
        let next = LuaValue::from(self.registry_free);
        self.table_set(registry, LuaValue::from(slot), next)?;
        self.registry_free = slot;
        Ok(())
    }

    pub fn registry_get(&self, slot: i32) -> LuaResult<LuaValue> {
        if slot <= LUA_REFNIL {
            return Ok(LuaValue::Nil);
        }
        self.table_get(self.registry, &LuaValue::from(slot))
    }

    // ============ Userdata ============

    pub fn set_userdata_dtor(&mut self, tag: u8, dtor: Option<UserdataDtor>) -> LuaResult<()> {
        match self.udata_dtors.get_mut(tag as usize) {
            Some(slot) => {
                *slot = dtor;
                Ok(())
            }
            None => Err(self.error(format!("userdata tag {} out of range", tag))),
        }
    }

    pub fn set_userdata_metatable(&mut self, tag: u8, mt: Option<GcRef>) -> LuaResult<()> {
        if let Some(m) = mt {
            self.heap.table(m)?;
        }
        match self.udata_metatables.get_mut(tag as usize) {
            Some(slot) => {
                *slot = mt;
                Ok(())
            }
            None => Err(self.error(format!("userdata tag {} out of range", tag))),
        }
    }

    pub fn get_userdata_metatable(&self, tag: u8) -> Option<GcRef> {
        self.udata_metatables.get(tag as usize).copied().flatten()
    }

    pub fn set_light_userdata_name(&mut self, tag: u8, name: &str) -> LuaResult<()> {
        if tag as usize >= LUA_LUTAG_LIMIT {
            return Err(self.error(format!("light userdata tag {} out of range", tag)));
        }
        let r = self.create_string(name)?;
        self.light_userdata_names[tag as usize] = Some(r);
        Ok(())
    }

    pub fn get_light_userdata_name(&self, tag: u8) -> Option<&str> {
        let r = self.light_userdata_names.get(tag as usize).copied().flatten()?;
        self.heap.string(r).ok()?.as_str()
    }

    // ============ Execution callbacks ============

    pub fn set_execution_callbacks(&mut self, callbacks: Option<Rc<dyn ExecutionCallbacks>>) {
        self.callbacks = callbacks;
    }

    pub fn execution_callbacks(&self) -> Option<Rc<dyn ExecutionCallbacks>> {
        self.callbacks.clone()
    }

    /// Mark `proto` as carrying native code and account its size.
    pub fn attach_native(&mut self, proto: GcRef) -> LuaResult<()> {
        let Some(callbacks) = self.callbacks.clone() else {
            return Err(self.error("no execution callbacks installed"));
        };
        let p = self.heap.proto_mut(proto)?;
        let native_size = callbacks.native_memory_size(p);
        p.native_size = native_size;
        p.has_native = true;
        self.refresh_object_size(proto)
    }

    /// Drop the native code of `proto`; later calls run as bytecode.
    pub fn disable_native(&mut self, proto: GcRef) -> LuaResult<()> {
        let callbacks = self.callbacks.clone();
        let p = self.heap.proto_mut(proto)?;
        if !p.has_native {
            return Ok(());
        }
        if let Some(callbacks) = callbacks {
            callbacks.on_disable(p);
        }
        p.has_native = false;
        p.native_size = 0;
        self.refresh_object_size(proto)
    }

    /// Userdata tag for a type name, as mapped by the execution callbacks.
    pub fn userdata_tag_by_name(&self, name: &str) -> Option<u8> {
        self.callbacks
            .as_ref()
            .map(|callbacks| callbacks.userdata_type_tag(name.as_bytes()))
    }

    // ============ Collector ============

    /// Run `f` with the collector, the heap and the current root set.
    fn with_gc<T>(
        &mut self,
        f: impl FnOnce(&mut GC, &mut Heap, &GcContext) -> LuaResult<T>,
    ) -> LuaResult<T> {
        self.check_aborted()?;
        let mut roots = std::mem::take(&mut self.roots);
        roots.clear();
        roots.push(LuaValue::Thread(self.main_thread));
        roots.push(LuaValue::Table(self.registry));
        roots.extend(self.metatables.iter().flatten().map(|&m| LuaValue::Table(m)));
        roots.extend(self.udata_metatables.iter().flatten().map(|&m| LuaValue::Table(m)));
        roots.extend(
            self.light_userdata_names
                .iter()
                .flatten()
                .map(|&s| LuaValue::String(s)),
        );
        roots.extend(self.const_strings.values());
        roots.push(self.error_object);

        let callbacks = self.callbacks.clone();
        let result = {
            let ctx = GcContext {
                roots: &roots,
                udata_dtors: &self.udata_dtors,
                callbacks: callbacks.as_deref(),
            };
            f(&mut self.gc, &mut self.heap, &ctx)
        };
        self.roots = roots;
        self.guard(result)
    }

    /// Automatic step, run at safe points once the threshold is crossed.
    pub fn check_gc(&mut self) -> LuaResult<()> {
        if self.gc.total_bytes >= self.gc.threshold {
            self.with_gc(|gc, heap, ctx| gc.assist_step(heap, ctx))?;
        }
        Ok(())
    }

    /// Perform about `budget` bytes of collector work. Returns the work done.
    pub fn step(&mut self, budget: usize) -> LuaResult<usize> {
        self.with_gc(|gc, heap, ctx| gc.explicit_step(heap, ctx, budget))
    }

    /// Run a complete cycle and return to Pause.
    pub fn full_collect(&mut self) -> LuaResult<()> {
        self.with_gc(|gc, heap, ctx| gc.full_collect(heap, ctx))
    }

    /// Check the tri-color invariant and byte accounting.
    pub fn verify_heap(&mut self) -> LuaResult<()> {
        let result = self.gc.verify(&self.heap);
        self.guard(result)
    }

    /// Returns the previous goal.
    pub fn set_goal(&mut self, percent: u32) -> u32 {
        std::mem::replace(&mut self.gc.config.goal, percent)
    }

    /// Returns the previous multiplier.
    pub fn set_step_multiplier(&mut self, percent: u32) -> u32 {
        std::mem::replace(&mut self.gc.config.step_multiplier, percent)
    }

    /// Returns the previous step size.
    pub fn set_step_size(&mut self, bytes: u32) -> u32 {
        std::mem::replace(&mut self.gc.config.step_size, bytes)
    }

    pub fn gc_config(&self) -> GcConfig {
        self.gc.config
    }

    /// Move the backing store ceiling.
    pub fn set_memory_limit(&mut self, limit: usize) {
        self.safe_option.max_memory_limit = limit;
        self.heap.pages.set_limit(limit);
    }

    // ============ Diagnostics ============

    pub fn memory_category_bytes(&self, memcat: u8) -> usize {
        self.gc.memory_category_bytes(memcat)
    }

    pub fn kind_bytes(&self, kind: GcObjectKind) -> usize {
        self.gc.kind_bytes(kind)
    }

    pub fn total_bytes(&self) -> usize {
        self.gc.total_bytes
    }

    pub fn gc_threshold(&self) -> usize {
        self.gc.threshold
    }

    pub fn gc_state(&self) -> GcState {
        self.gc.gc_state
    }

    pub fn string_count(&self) -> usize {
        self.heap.strings.len()
    }

    pub fn page_count(&self) -> usize {
        self.heap.pages.page_count()
    }

    pub fn thread_count(&self) -> usize {
        self.heap.threads.len()
    }

    pub fn gc_metrics(&self) -> &GcMetrics {
        &self.gc.metrics
    }

    pub fn last_cycle(&self) -> &GcCycleMetrics {
        &self.gc.metrics.last_cycle
    }

    /// Whether `r` still names a live object.
    pub fn is_alive(&self, r: GcRef) -> bool {
        self.heap
            .pages
            .gco(r)
            .is_some_and(|object| !self.gc.is_dead(&object.header))
    }

    // ============ Threads and stacks ============

    /// Select the memory category charged for new objects. Returns the
    /// previous one.
    pub fn set_memory_category(&mut self, memcat: u8) -> u8 {
        std::mem::replace(&mut self.active_memcat, memcat)
    }

    /// Mark a thread as running (or parked). Running threads are rescanned
    /// at the atomic phase instead of using barriers on every stack write.
    pub fn set_thread_active(&mut self, thread: ThreadRef, active: bool) -> LuaResult<()> {
        self.check_aborted()?;
        self.heap.thread_mut(thread)?.is_active = active;
        if active {
            let result = self.gc.barrier_back(&mut self.heap, thread);
            self.guard(result)?;
        }
        Ok(())
    }

    /// Ensure `min_slots` free slots above top, reallocating the stack if
    /// needed. Frames and upvalues hold indices and survive the move.
    pub fn grow_stack(&mut self, thread: ThreadRef, min_slots: usize) -> LuaResult<()> {
        match self.heap.thread_mut(thread)?.reserve(min_slots) {
            Ok(true) => self.refresh_object_size(thread),
            Ok(false) => Ok(()),
            Err(_) => Err(self.stack_overflow()),
        }
    }

    pub(crate) fn grow_stack_to(&mut self, thread: ThreadRef, required: usize) -> LuaResult<()> {
        match self.heap.thread_mut(thread)?.grow_to(required) {
            Ok(true) => self.refresh_object_size(thread),
            Ok(false) => Ok(()),
            Err(_) => Err(self.stack_overflow()),
        }
    }

    /// Push a value on the thread's stack. This is a collector safe point.
    pub fn push_value(&mut self, thread: ThreadRef, value: LuaValue) -> LuaResult<()> {
        self.check_aborted()?;
        self.grow_stack(thread, 1)?;
        let l = self.heap.thread_mut(thread)?;
        let top = l.top;
        l.stack[top] = value;
        l.top = top + 1;
        if value.is_collectable() {
            let result = self.gc.barrier_back(&mut self.heap, thread);
            self.guard(result)?;
        }
        self.check_gc()
    }

    /// Pop `n` values, never below the current frame base.
    pub fn pop(&mut self, thread: ThreadRef, n: usize) -> LuaResult<()> {
        let l = self.heap.thread_mut(thread)?;
        let base = l.current_frame().base;
        if l.top < base + n {
            return Err(self.error("stack underflow"));
        }
        l.top -= n;
        Ok(())
    }

    pub fn top(&self, thread: ThreadRef) -> LuaResult<usize> {
        Ok(self.heap.thread(thread)?.top)
    }

    /// Set the number of values in the current frame, filling new slots
    /// with nil.
    pub fn set_top(&mut self, thread: ThreadRef, count: usize) -> LuaResult<()> {
        let base = self.heap.thread(thread)?.current_frame().base;
        self.grow_stack_to(thread, base + count)?;
        let l = self.heap.thread_mut(thread)?;
        let new_top = base + count;
        if new_top > l.top {
            l.stack[l.top..new_top].fill(LuaValue::Nil);
        }
        l.top = new_top;
        Ok(())
    }

    /// Argument `n` (1-based) of the current frame, nil when absent.
    pub fn arg(&self, thread: ThreadRef, n: usize) -> LuaResult<LuaValue> {
        let l = self.heap.thread(thread)?;
        let index = l.current_frame().base + n - 1;
        Ok(if n >= 1 && index < l.top {
            l.stack[index]
        } else {
            LuaValue::Nil
        })
    }

    /// Number of values in the current frame.
    pub fn arg_count(&self, thread: ThreadRef) -> LuaResult<usize> {
        let l = self.heap.thread(thread)?;
        Ok(l.top.saturating_sub(l.current_frame().base))
    }

    pub fn stack_get(&self, slot: StackRef) -> LuaResult<LuaValue> {
        let l = self.heap.thread(slot.thread)?;
        match l.get(slot.index) {
            Some(value) => Ok(value),
            None => Err(self.heap.violation()),
        }
    }

    pub fn stack_set(&mut self, slot: StackRef, value: LuaValue) -> LuaResult<()> {
        self.check_aborted()?;
        let l = self.heap.thread_mut(slot.thread)?;
        if slot.index >= l.top {
            return Err(self.error("stack index out of range"));
        }
        l.stack[slot.index] = value;
        if value.is_collectable() {
            let result = self.gc.barrier_back(&mut self.heap, slot.thread);
            self.guard(result)?;
        }
        Ok(())
    }

    /// Move the top `n` values of `from` onto `to`.
    pub fn xmove(&mut self, from: ThreadRef, to: ThreadRef, n: usize) -> LuaResult<()> {
        self.check_aborted()?;
        if from == to || n == 0 {
            return Ok(());
        }
        let values = {
            let l = self.heap.thread(from)?;
            if l.top < l.current_frame().base + n {
                return Err(self.error("not enough values to move"));
            }
            l.stack[l.top - n..l.top].to_vec()
        };
        self.grow_stack(to, n)?;
        self.heap.thread_mut(from)?.top -= n;
        let l = self.heap.thread_mut(to)?;
        let top = l.top;
        l.stack[top..top + n].copy_from_slice(&values);
        l.top = top + n;
        let result = self.gc.barrier_back(&mut self.heap, to);
        self.guard(result)
    }

    /// Open upvalue aliasing stack slot `level`, reusing an existing one.
    pub fn find_upvalue(&mut self, thread: ThreadRef, level: usize) -> LuaResult<GcRef> {
        self.check_aborted()?;
        let l = self.heap.thread(thread)?;
        if level >= l.stack.len() {
            return Err(self.error("upvalue level out of range"));
        }
        if let Some(uv) = l.find_open_upvalue(level) {
            return Ok(uv);
        }
        let uv = self.alloc_object(GcObject::Upvalue(LuaUpvalue::Open { thread, level }))?;
        self.heap.thread_mut(thread)?.insert_open_upvalue(level, uv);
        let result = self.gc.barrier_back(&mut self.heap, thread);
        self.guard(result)?;
        Ok(uv)
    }

    /// Close every open upvalue at or above `level`: each takes a copy of
    /// the slot it aliased.
    pub fn close_upvalues(&mut self, thread: ThreadRef, level: usize) -> LuaResult<()> {
        let closing = self.heap.thread_mut(thread)?.take_open_upvalues_from(level);
        for (slot, uv) in closing {
            let value = self
                .heap
                .thread(thread)?
                .stack
                .get(slot)
                .copied()
                .unwrap_or_default();
            *self.heap.upvalue_mut(uv)? = LuaUpvalue::Closed(value);
            let result = self.gc.barrier(&mut self.heap, uv, &value);
            self.guard(result)?;
        }
        Ok(())
    }
}

impl Drop for LuaVM {
    fn drop(&mut self) {
        // free everything, running finalizers, then notify the native layer
        let callbacks = self.callbacks.clone();
        let ctx = GcContext {
            roots: &[],
            udata_dtors: &self.udata_dtors,
            callbacks: callbacks.as_deref(),
        };
        for r in self.heap.pages.gco_refs() {
            if self.gc.free_object(&mut self.heap, &ctx, r).is_err() {
                tracing::error!(?r, "failed to free object on close");
            }
        }
        if let Some(callbacks) = callbacks {
            callbacks.on_close();
        }
        tracing::debug!(total_bytes = self.gc.total_bytes, "vm closed");
    }
}
