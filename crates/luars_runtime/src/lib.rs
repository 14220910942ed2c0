// Lua Runtime core
// Paged heap, incremental garbage collector and thread stacks

#[cfg(test)]
mod test;

pub mod gc;
pub mod lua_value;
pub mod lua_vm;

pub use gc::{GcConfig, GcMetrics, GcObjectKind, GcRef, GcState, ThreadRef};
pub use lua_value::{LuaProto, LuaTable, LuaType, LuaValue};
pub use lua_vm::{
    CFunction, ExecutionCallbacks, LuaError, LuaResult, LuaState, LuaVM, SafeOption, StackRef,
};
