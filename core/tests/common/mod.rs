//! Shared helpers for the end-to-end tests: build a program, compile it for
//! a backend, run it against a fresh world, capture stdout.

#![allow(dead_code)]

use skiff_core::ast::Program;
use skiff_core::{compile, Backend, CompileError, RegisterVm, RuntimeError, StackVm, Value, World};

pub fn run_backend(
    program: &Program,
    backend: Backend,
) -> (Result<Value, RuntimeError>, String) {
    let mut world = World::new();
    let bytecode = compile(program, backend, &mut world).expect("program should compile");
    let mut out = String::new();
    let result = match backend {
        Backend::Stack => StackVm::new(&bytecode, &mut world, &mut out).run(),
        Backend::Register => RegisterVm::new(&bytecode, &mut world, &mut out).run(),
    };
    (result, out)
}

/// Run on the stack VM and return stdout; the program must succeed.
pub fn stack_output(program: &Program) -> String {
    let (result, out) = run_backend(program, Backend::Stack);
    result.expect("stack vm should succeed");
    out
}

/// Run on the register VM and return stdout; the program must succeed.
pub fn register_output(program: &Program) -> String {
    let (result, out) = run_backend(program, Backend::Register);
    result.expect("register vm should succeed");
    out
}

/// Both engines must produce this exact stdout.
pub fn assert_both_backends(program: &Program, expected: &str) {
    assert_eq!(stack_output(program), expected, "stack vm stdout");
    assert_eq!(register_output(program), expected, "register vm stdout");
}

pub fn stack_error(program: &Program) -> RuntimeError {
    let (result, _) = run_backend(program, Backend::Stack);
    result.expect_err("stack vm should fail")
}

pub fn register_error(program: &Program) -> RuntimeError {
    let (result, _) = run_backend(program, Backend::Register);
    result.expect_err("register vm should fail")
}

pub fn compile_error(program: &Program, backend: Backend) -> CompileError {
    let mut world = World::new();
    compile(program, backend, &mut world).expect_err("program should be rejected")
}
