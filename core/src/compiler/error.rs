//! Compile-time errors.
//!
//! Compilation stops at the first violated rule and surfaces it directly;
//! there is no error recovery. Internal inconsistencies (a struct offset
//! missing after the type lookup succeeded, for instance) are compiler bugs
//! and panic instead of appearing here.

use ecow::EcoString;
use thiserror::Error;

use crate::String;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: EcoString },

    #[error("cannot assign to constant '{name}'")]
    AssignToConst { name: EcoString },

    #[error("'break' outside of a loop")]
    BreakOutsideLoop,

    #[error("'continue' outside of a loop")]
    ContinueOutsideLoop,

    #[error("wrong argument count calling '{name}': expected {expected}, got {got}")]
    WrongArgumentCount {
        name: EcoString,
        expected: usize,
        got: usize,
    },

    #[error("argument {index} of '{name}' has type {got}, expected {expected}")]
    ArgumentTypeMismatch {
        name: EcoString,
        index: usize,
        expected: String,
        got: String,
    },

    #[error("return type mismatch in '{name}': expected {expected}, got {got}")]
    ReturnTypeMismatch {
        name: EcoString,
        expected: String,
        got: String,
    },

    #[error("function '{name}' is missing a return on some path")]
    MissingReturn { name: EcoString },

    #[error("array element {index} has type {got}, expected {expected}")]
    ArrayElementTypeMismatch {
        index: usize,
        expected: String,
        got: String,
    },

    #[error("map key has type {got}, expected {expected}")]
    MapKeyTypeMismatch { expected: String, got: String },

    #[error("map value has type {got}, expected {expected}")]
    MapValueTypeMismatch { expected: String, got: String },

    #[error("cannot assign {got} to '{target}' of type {expected}")]
    AssignTypeMismatch {
        target: EcoString,
        expected: String,
        got: String,
    },

    #[error("unknown operator: {left} {op} {right}")]
    UnknownOperator {
        op: &'static str,
        left: String,
        right: String,
    },

    #[error("unknown operator: {op}{ty}")]
    UnknownPrefixOperator { op: &'static str, ty: String },

    #[error("'for' requires a condition")]
    ForRequiresCondition,

    #[error("struct literal of '{ty}' is missing field '{field}'")]
    MissingStructField { ty: EcoString, field: EcoString },

    #[error("switch over enum '{name}' is not exhaustive; missing: {missing}")]
    SwitchNotExhaustive { name: EcoString, missing: String },

    #[error("switch over a non-enum subject requires a default arm")]
    SwitchRequiresDefault,

    #[error("switch cases mix variants of '{first}' and '{second}'")]
    MixedEnumsInSwitch { first: EcoString, second: EcoString },

    #[error("unknown type '{name}'")]
    UnknownType { name: EcoString },

    #[error("no field '{field}' on struct '{ty}'")]
    UnknownStructField { ty: EcoString, field: EcoString },

    #[error("field access on non-struct type {ty}")]
    NotAStruct { ty: String },

    #[error("cannot call a value of type {ty}")]
    NotCallable { ty: String },

    #[error("duplicate definition of '{name}' in the same scope")]
    DuplicateDefinition { name: EcoString },

    #[error("closures are not supported by the register backend")]
    ClosureUnsupportedByBackend,

    /// Resource limits; these can legitimately occur with very large
    /// programs.
    #[error("too many constants (limit: 65536)")]
    TooManyConstants,

    #[error("too many locals (limit: 65536)")]
    TooManyLocals,

    #[error("too many registers in one function (limit: 256)")]
    TooManyRegisters,

    #[error("jump distance too large (limit: 65535)")]
    JumpTooFar,
}
