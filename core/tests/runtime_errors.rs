//! Runtime failure behavior observed through complete programs.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use skiff_core::ast::*;
use skiff_core::RuntimeError;

fn print_call(arg: Expr) -> Stmt {
    Stmt::Expr(Expr::call(Expr::ident("print"), vec![arg]))
}

#[test]
fn integer_division_by_zero() {
    let program = Program::new(vec![
        Stmt::var_typed("a", TypeExpr::named("int"), Expr::Int(1)),
        Stmt::var_typed("b", TypeExpr::named("int"), Expr::Int(0)),
        print_call(Expr::infix(
            InfixOp::Div,
            Expr::ident("a"),
            Expr::ident("b"),
        )),
    ]);
    assert_eq!(stack_error(&program), RuntimeError::DivisionByZero);
    assert_eq!(register_error(&program), RuntimeError::DivisionByZero);
}

#[test]
fn integer_modulo_by_zero() {
    let program = Program::new(vec![
        Stmt::var_typed("a", TypeExpr::named("int"), Expr::Int(1)),
        Stmt::var_typed("b", TypeExpr::named("int"), Expr::Int(0)),
        print_call(Expr::infix(
            InfixOp::Mod,
            Expr::ident("a"),
            Expr::ident("b"),
        )),
    ]);
    assert_eq!(stack_error(&program), RuntimeError::ModuloByZero);
    assert_eq!(register_error(&program), RuntimeError::ModuloByZero);
}

#[test]
fn float_division_by_zero_prints_inf() {
    let program = Program::new(vec![
        Stmt::var_typed("a", TypeExpr::named("float"), Expr::Float(1.0)),
        Stmt::var_typed("b", TypeExpr::named("float"), Expr::Float(0.0)),
        print_call(Expr::infix(
            InfixOp::Div,
            Expr::ident("a"),
            Expr::ident("b"),
        )),
    ]);
    assert_both_backends(&program, "inf\n");
}

#[test]
fn index_one_past_the_end_fails() {
    let array = Expr::Array {
        elem_ty: Some(TypeExpr::named("int")),
        elements: vec![Expr::Int(1), Expr::Int(2)],
    };
    let at = |index: i64| {
        Program::new(vec![
            Stmt::var("a", array.clone()),
            print_call(Expr::index(Expr::ident("a"), Expr::Int(index))),
        ])
    };
    // len - 1 succeeds...
    assert_both_backends(&at(1), "2\n");
    // ...len does not.
    assert_eq!(stack_error(&at(2)), RuntimeError::IndexOutOfRange);
    assert_eq!(register_error(&at(2)), RuntimeError::IndexOutOfRange);
}

#[test]
fn unbounded_recursion_overflows_frames() {
    // func f():int { return f() } f()
    let program = Program::new(vec![
        Stmt::Func(FuncDecl {
            name: "f".into(),
            func: FuncLit {
                params: vec![],
                return_ty: Some(TypeExpr::named("int")),
                body: Block::new(vec![Stmt::Return(Some(Expr::call(
                    Expr::ident("f"),
                    vec![],
                )))]),
            },
        }),
        Stmt::Expr(Expr::call(Expr::ident("f"), vec![])),
    ]);
    assert_eq!(stack_error(&program), RuntimeError::FrameOverflow);
    assert_eq!(register_error(&program), RuntimeError::FrameOverflow);
}

#[test]
fn calling_a_non_function_value() {
    let program = Program::new(vec![
        Stmt::Var {
            name: "f".into(),
            ty: Some(TypeExpr::named("any")),
            init: Some(Expr::Int(3)),
            mutable: true,
        },
        Stmt::Expr(Expr::call(Expr::ident("f"), vec![])),
    ]);
    assert_eq!(stack_error(&program), RuntimeError::CallingNonFunction);
    assert_eq!(register_error(&program), RuntimeError::CallingNonFunction);
}

#[test]
fn any_typed_operands_fail_at_runtime_not_compile_time() {
    let program = Program::new(vec![
        Stmt::Var {
            name: "a".into(),
            ty: Some(TypeExpr::named("any")),
            init: Some(Expr::Bool(true)),
            mutable: true,
        },
        print_call(Expr::infix(InfixOp::Sub, Expr::ident("a"), Expr::Int(1))),
    ]);
    assert_eq!(stack_error(&program), RuntimeError::UnsupportedOperands);
    assert_eq!(register_error(&program), RuntimeError::UnsupportedOperands);
}

#[test]
fn wrong_builtin_argument_kind() {
    let program = Program::new(vec![
        Stmt::Var {
            name: "n".into(),
            ty: Some(TypeExpr::named("any")),
            init: Some(Expr::Int(3)),
            mutable: true,
        },
        print_call(Expr::call(Expr::ident("len"), vec![Expr::ident("n")])),
    ]);
    assert_eq!(stack_error(&program), RuntimeError::WrongBuiltinArgument);
    assert_eq!(register_error(&program), RuntimeError::WrongBuiltinArgument);
}

#[test]
fn partial_output_survives_a_failure() {
    let program = Program::new(vec![
        print_call(Expr::str("before")),
        Stmt::var_typed("z", TypeExpr::named("int"), Expr::Int(0)),
        print_call(Expr::infix(
            InfixOp::Div,
            Expr::Int(1),
            Expr::ident("z"),
        )),
        print_call(Expr::str("after")),
    ]);
    let (result, out) = run_backend(&program, skiff_core::Backend::Stack);
    assert_eq!(result, Err(RuntimeError::DivisionByZero));
    // Effects before the failure stay; nothing after it runs.
    assert_eq!(out, "before\n");
}
