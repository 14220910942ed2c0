use thiserror::Error;

/// Lightweight error enum - only 1 byte!
/// The message and error value live in the VM (`LuaVM::error_message`).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Allocation failed because the backing store ceiling was reached
    #[error("not enough memory")]
    OutOfMemory,
    /// Stack or call depth limit exceeded
    #[error("stack overflow")]
    StackOverflow,
    /// Error raised inside a protected call - message stored in the VM
    #[error("runtime error")]
    RuntimeError,
    /// Internal consistency failure; aborts the runtime instance
    #[error("invariant violation")]
    InvariantViolation,
}

impl LuaError {
    /// Whether a protected call boundary may catch this error.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, LuaError::InvariantViolation)
    }
}

pub type LuaResult<T> = Result<T, LuaError>;
