//! skiff - a small statically-typed scripting language core
//!
//! # Overview
//!
//! skiff is a statically-typed, imperative scripting language with a classic
//! bytecode pipeline: an AST is lowered by a type-checking compiler into
//! either stack or register bytecode, and one of two interchangeable virtual
//! machines runs it to completion. The compiler picks type-specialized
//! opcodes wherever operand types are proven, and rewrites a handful of hot
//! patterns (constant right operands, local right operands, `x * x`,
//! `i = i + k`) into fused instructions at emission time.
//!
//! This crate is the embedding facade: it re-exports the core API. The
//! front end that produces the AST is a separate concern; hosts may build
//! [`ast`] nodes however they like.
//!
//! # Quick Start
//!
//! ```
//! use skiff::ast::{Expr, Program, Stmt};
//! use skiff::{compile, Backend, StackVm, World};
//!
//! // print(6 * 7)
//! let program = Program::new(vec![Stmt::Expr(Expr::call(
//!     Expr::ident("print"),
//!     vec![Expr::infix(
//!         skiff::ast::InfixOp::Mul,
//!         Expr::Int(6),
//!         Expr::Int(7),
//!     )],
//! ))]);
//!
//! // Compile against a world that will also run the result.
//! let mut world = World::new();
//! let bytecode = compile(&program, Backend::Stack, &mut world).unwrap();
//!
//! // Run with a string sink standing in for stdout.
//! let mut out = String::new();
//! let mut vm = StackVm::new(&bytecode, &mut world, &mut out);
//! vm.run().unwrap();
//! assert_eq!(out, "42\n");
//! ```
//!
//! The register backend is a drop-in replacement: compile with
//! [`Backend::Register`] and run through [`RegisterVm`]. The two engines
//! agree on observable behavior for every feature both support; closures
//! are a stack-backend feature.

pub use skiff_core::ast;
pub use skiff_core::bytecode;
pub use skiff_core::compiler;
pub use skiff_core::types;
pub use skiff_core::values;
pub use skiff_core::vm;

pub use skiff_core::{
    compile, Backend, Bytecode, CompileError, RegisterVm, RuntimeError, StackVm, Value, World,
};

#[cfg(test)]
mod tests {
    use super::ast::{Expr, InfixOp, Program, Stmt, TypeExpr};
    use super::*;
    use pretty_assertions::assert_eq;

    fn run_both(program: &Program) -> (String, String) {
        let mut stack_out = String::new();
        {
            let mut world = World::new();
            let bytecode = compile(program, Backend::Stack, &mut world).unwrap();
            StackVm::new(&bytecode, &mut world, &mut stack_out)
                .run()
                .unwrap();
        }
        let mut register_out = String::new();
        {
            let mut world = World::new();
            let bytecode = compile(program, Backend::Register, &mut world).unwrap();
            RegisterVm::new(&bytecode, &mut world, &mut register_out)
                .run()
                .unwrap();
        }
        (stack_out, register_out)
    }

    #[test]
    fn the_facade_reaches_both_backends() {
        let program = Program::new(vec![
            Stmt::var_typed("x", TypeExpr::named("int"), Expr::Int(20)),
            Stmt::Expr(Expr::call(
                Expr::ident("print"),
                vec![Expr::infix(
                    InfixOp::Add,
                    Expr::ident("x"),
                    Expr::Int(22),
                )],
            )),
        ]);
        let (stack_out, register_out) = run_both(&program);
        assert_eq!(stack_out, "42\n");
        assert_eq!(register_out, "42\n");
    }
}
