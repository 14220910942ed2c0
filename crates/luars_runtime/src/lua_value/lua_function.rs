use crate::gc::{GcRef, ThreadRef};
use crate::lua_value::LuaValue;
use crate::lua_vm::CFunction;

/// Function prototype: constants, nested prototypes and the metadata the
/// stack manager needs to lay out a frame. Bytecode is carried opaquely.
#[derive(Debug, Clone, Default)]
pub struct LuaProto {
    pub code: Vec<u32>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<GcRef>,
    pub source: Option<GcRef>,
    pub debug_name: Option<GcRef>,
    pub num_params: u8,
    pub num_upvalues: u8,
    pub max_stack_size: u8,
    pub is_vararg: bool,
    /// Native code is attached through the execution callbacks
    pub(crate) has_native: bool,
    /// Bytes the execution callbacks report for the native code
    pub(crate) native_size: usize,
}

impl LuaProto {
    pub fn new(num_params: u8, is_vararg: bool, max_stack_size: u8) -> Self {
        Self {
            num_params,
            is_vararg,
            max_stack_size,
            ..Default::default()
        }
    }

    pub fn with_constants(mut self, constants: Vec<LuaValue>) -> Self {
        self.constants = constants;
        self
    }

    pub fn with_protos(mut self, protos: Vec<GcRef>) -> Self {
        self.protos = protos;
        self
    }

    pub fn with_code(mut self, code: Vec<u32>) -> Self {
        self.code = code;
        self
    }

    #[inline]
    pub fn has_native(&self) -> bool {
        self.has_native
    }

    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<LuaProto>()
            + self.code.len() * std::mem::size_of::<u32>()
            + self.constants.len() * std::mem::size_of::<LuaValue>()
            + self.protos.len() * std::mem::size_of::<GcRef>()
            + self.native_size
    }
}

/// Closure over either a bytecode prototype or a native function
#[derive(Debug, Clone)]
pub enum LuaClosure {
    Lua {
        proto: GcRef,
        upvalues: Vec<GcRef>,
    },
    Native {
        func: CFunction,
        upvalues: Vec<LuaValue>,
    },
}

impl LuaClosure {
    pub fn is_native(&self) -> bool {
        matches!(self, LuaClosure::Native { .. })
    }

    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<LuaClosure>()
            + match self {
                LuaClosure::Lua { upvalues, .. } => upvalues.len() * std::mem::size_of::<GcRef>(),
                LuaClosure::Native { upvalues, .. } => {
                    upvalues.len() * std::mem::size_of::<LuaValue>()
                }
            }
    }
}

/// Upvalue: either still aliasing a stack slot of its thread, or holding its
/// own copy after the slot went out of scope
#[derive(Debug, Clone, Copy)]
pub enum LuaUpvalue {
    Open { thread: ThreadRef, level: usize },
    Closed(LuaValue),
}

impl LuaUpvalue {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, LuaUpvalue::Open { .. })
    }
}
