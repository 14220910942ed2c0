use crate::gc::{GcRef, ThreadRef};
use crate::lua_value::LuaProto;
use crate::lua_vm::LuaVM;

/// Hooks for a native-code layer (AOT/JIT or a sandbox) attached to the VM.
///
/// Every method has a default that behaves as if no native layer existed.
pub trait ExecutionCallbacks {
    /// The VM is being torn down.
    fn on_close(&self) {}

    /// A prototype with native code attached is being freed.
    fn on_destroy(&self, _proto: &LuaProto) {}

    /// A frame for `proto` was pushed on `thread`.
    ///
    /// Return `true` to hand control back to the bytecode interpreter. Return
    /// `false` once the native code has finished the call and left its
    /// results in `[base, top)` of the frame.
    fn on_enter(&self, _vm: &mut LuaVM, _thread: ThreadRef, _proto: GcRef) -> bool {
        true
    }

    /// Native code for `proto` is being dropped; execution falls back to bytecode.
    fn on_disable(&self, _proto: &LuaProto) {}

    /// Bytes of native code attached to `proto`.
    fn native_memory_size(&self, _proto: &LuaProto) -> usize {
        0
    }

    /// Userdata tag registered for a type name.
    fn userdata_type_tag(&self, _name: &[u8]) -> u8 {
        0
    }
}
