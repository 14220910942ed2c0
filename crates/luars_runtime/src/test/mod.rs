// Test module organization
pub mod test_callbacks;
pub mod test_properties;
pub mod test_string_table;

use crate::gc::GcRef;
use crate::lua_value::{LuaProto, LuaValue};
use crate::lua_vm::{LuaVM, SafeOption};

/// Install a subscriber once; `RUST_LOG=luars_runtime=trace` shows collector events.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn new_vm() -> LuaVM {
    init_tracing();
    LuaVM::new(SafeOption::default()).unwrap()
}

/// Bytecode closure over a fresh proto, anchored in the registry.
pub(crate) fn anchored_lua_function(
    vm: &mut LuaVM,
    num_params: u8,
    is_vararg: bool,
    max_stack: u8,
) -> GcRef {
    let proto = vm
        .create_proto(LuaProto::new(num_params, is_vararg, max_stack))
        .unwrap();
    let closure = vm.create_closure(proto, Vec::new()).unwrap();
    vm.registry_ref(LuaValue::Function(closure)).unwrap();
    closure
}
