//! Runtime errors.
//!
//! The set is closed and every variant is fieldless, so returning an error
//! never allocates. Conditions the compiler can rule out statically
//! (mismatched specialized operands, bad arity on typed calls) do not appear
//! here; hitting one of those paths anyway is a compiler bug, not a
//! recoverable error.

use thiserror::Error;

use crate::values::StaleHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("frame overflow")]
    FrameOverflow,
    #[error("calling non-function")]
    CallingNonFunction,
    #[error("unsupported operand types")]
    UnsupportedOperands,
    #[error("unsupported comparison")]
    UnsupportedComparison,
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("non-integer index")]
    NonIntegerIndex,
    #[error("type error")]
    TypeError,
    #[error("reference into a trimmed pool region")]
    PoolTrimmedReference,
    #[error("wrong builtin argument")]
    WrongBuiltinArgument,
}

impl From<StaleHandle> for RuntimeError {
    fn from(_: StaleHandle) -> Self {
        RuntimeError::PoolTrimmedReference
    }
}
