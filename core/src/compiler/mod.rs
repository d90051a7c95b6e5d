//! Bytecode compiler for skiff programs.
//!
//! The compiler lowers an AST into either stack or register bytecode in a
//! single bottom-up walk, enforcing the static type rules as it goes.
//!
//! ## Design
//!
//! - One walk, emitting in source order; failure stops at the first
//!   offending node
//! - Symbol tables with lexical scopes; enclosing non-global locals are
//!   promoted to free variables for closure capture
//! - Type inference derives a coarse tag (specialized opcode selection) and
//!   a precise type (the hard gates) per expression
//! - Peephole rewrites depend only on the last emitted instruction and live
//!   in the stack backend's `CodeBuilder`
//! - The register backend rewrites expression compilation to return the
//!   register holding each result, with LIFO temporary reuse

mod consts;
mod emit;
mod error;
mod register;
mod registers;
mod stack;
mod symbols;
mod typing;

#[cfg(test)]
mod register_test;

pub use error::CompileError;
pub use register::compile_register;
pub use stack::compile_stack;

use crate::ast::Program;
use crate::bytecode::{Backend, Bytecode};
use crate::values::World;

/// Compile a program for the chosen VM backend. String and other heap
/// constants are interned into `world`, which must be the world the
/// resulting bytecode later runs against.
pub fn compile(
    program: &Program,
    backend: Backend,
    world: &mut World,
) -> Result<Bytecode, CompileError> {
    match backend {
        Backend::Stack => compile_stack(program, world),
        Backend::Register => compile_register(program, world),
    }
}
