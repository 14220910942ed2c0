use crate::lua_vm::lua_limits::{LUAI_MAXSTACK, MAX_CALL_DEPTH};

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SafeOption {
    pub max_stack_size: usize,
    pub max_call_depth: usize,
    /// Backing store ceiling in bytes, covering pages and accounted object bytes
    pub max_memory_limit: usize,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_stack_size: LUAI_MAXSTACK,
            max_call_depth: MAX_CALL_DEPTH,
            max_memory_limit: usize::MAX,
        }
    }
}
