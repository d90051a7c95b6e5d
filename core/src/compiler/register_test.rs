//! Tests for the register backend: allocation discipline, instruction
//! selection, and the consecutive-argument rule.

use pretty_assertions::assert_eq;

use crate::ast::*;
use crate::bytecode::{Bytecode, FuncCode};
use crate::values::World;
use crate::vm::rop::{unpack_builtin, RInstr, ROp};
use crate::{vec, Vec};

use super::error::CompileError;
use super::register::compile_register;

fn compile(statements: Vec<Stmt>) -> Bytecode {
    let mut world = World::new();
    compile_register(&Program::new(statements), &mut world).expect("program should compile")
}

fn compile_err(statements: Vec<Stmt>) -> CompileError {
    let mut world = World::new();
    compile_register(&Program::new(statements), &mut world)
        .expect_err("program should be rejected")
}

fn code(bytecode: &Bytecode, function: usize) -> &[RInstr] {
    match &bytecode.functions[function].code {
        FuncCode::Register(code) => code,
        FuncCode::Stack(_) => panic!("expected register code"),
    }
}

fn count_rop(bytecode: &Bytecode, op: ROp) -> usize {
    bytecode
        .functions
        .iter()
        .flat_map(|f| code_of(f))
        .filter(|i| i.op().unwrap() == op)
        .count()
}

fn code_of(function: &crate::bytecode::Function) -> Vec<RInstr> {
    match &function.code {
        FuncCode::Register(code) => code.clone(),
        FuncCode::Stack(_) => panic!("expected register code"),
    }
}

#[test]
fn float_square_uses_the_variable_register() {
    // var x: float = 3.0; print(x * x)
    let bytecode = compile(vec![
        Stmt::var_typed("x", TypeExpr::named("float"), Expr::Float(3.0)),
        Stmt::Expr(Expr::call(
            Expr::ident("print"),
            vec![Expr::infix(
                InfixOp::Mul,
                Expr::ident("x"),
                Expr::ident("x"),
            )],
        )),
    ]);
    let main = code(&bytecode, bytecode.main);
    let squares: Vec<&RInstr> = main
        .iter()
        .filter(|i| i.op().unwrap() == ROp::SquareFloat)
        .collect();
    assert_eq!(squares.len(), 1, "exactly one SquareFloat expected");
    assert_eq!(count_rop(&bytecode, ROp::MulFloat), 0);

    // x was moved into its named register by the var statement; the square
    // reads that same register.
    let var_move = main
        .iter()
        .find(|i| i.op().unwrap() == ROp::Move)
        .expect("var initialization move");
    assert_eq!(squares[0].b(), var_move.a());
}

#[test]
fn int_specialization_mirrors_the_stack_family() {
    let bytecode = compile(vec![
        Stmt::var_typed("a", TypeExpr::named("int"), Expr::Int(1)),
        Stmt::var_typed("b", TypeExpr::named("int"), Expr::Int(2)),
        Stmt::Expr(Expr::infix(
            InfixOp::Add,
            Expr::ident("a"),
            Expr::ident("b"),
        )),
        Stmt::Expr(Expr::infix(
            InfixOp::Lt,
            Expr::ident("a"),
            Expr::ident("b"),
        )),
    ]);
    assert_eq!(count_rop(&bytecode, ROp::AddInt), 1);
    assert_eq!(count_rop(&bytecode, ROp::LtInt), 1);
    assert_eq!(count_rop(&bytecode, ROp::Add), 0);
    assert_eq!(count_rop(&bytecode, ROp::Lt), 0);
}

#[test]
fn any_typed_operands_use_generic_instructions() {
    let bytecode = compile(vec![
        Stmt::Var {
            name: "a".into(),
            ty: Some(TypeExpr::named("any")),
            init: Some(Expr::Int(1)),
            mutable: true,
        },
        Stmt::Expr(Expr::infix(InfixOp::Add, Expr::ident("a"), Expr::Int(1))),
    ]);
    assert_eq!(count_rop(&bytecode, ROp::Add), 1);
    assert_eq!(count_rop(&bytecode, ROp::AddInt), 0);
}

#[test]
fn call_arguments_are_consecutive() {
    // func add(a:int, b:int):int { return a + b }  add(10, 20)
    let bytecode = compile(vec![
        Stmt::Func(FuncDecl {
            name: "add".into(),
            func: FuncLit {
                params: vec![
                    Param::new("a", TypeExpr::named("int")),
                    Param::new("b", TypeExpr::named("int")),
                ],
                return_ty: Some(TypeExpr::named("int")),
                body: Block::new(vec![Stmt::Return(Some(Expr::infix(
                    InfixOp::Add,
                    Expr::ident("a"),
                    Expr::ident("b"),
                )))]),
            },
        }),
        Stmt::Expr(Expr::call(
            Expr::ident("add"),
            vec![Expr::Int(10), Expr::Int(20)],
        )),
    ]);
    let main = code(&bytecode, bytecode.main);
    let call = main
        .iter()
        .find(|i| i.op().unwrap() == ROp::Call)
        .expect("call instruction");
    let base = call.c();
    // The two argument moves target base and base + 1.
    let moves: Vec<&RInstr> = main
        .iter()
        .filter(|i| i.op().unwrap() == ROp::Move && (i.a() == base || i.a() == base + 1))
        .collect();
    assert_eq!(moves.len(), 2);
}

#[test]
fn builtin_calls_pack_index_and_arity() {
    let bytecode = compile(vec![Stmt::Expr(Expr::call(
        Expr::ident("print"),
        vec![Expr::Int(1), Expr::Int(2)],
    ))]);
    let main = code(&bytecode, bytecode.main);
    let builtin = main
        .iter()
        .find(|i| i.op().unwrap() == ROp::Builtin)
        .expect("builtin instruction");
    let (index, argc) = unpack_builtin(builtin.b());
    assert_eq!(index, 0); // print
    assert_eq!(argc, 2);
}

#[test]
fn params_occupy_the_window_start() {
    let bytecode = compile(vec![Stmt::Func(FuncDecl {
        name: "add".into(),
        func: FuncLit {
            params: vec![
                Param::new("a", TypeExpr::named("int")),
                Param::new("b", TypeExpr::named("int")),
            ],
            return_ty: Some(TypeExpr::named("int")),
            body: Block::new(vec![Stmt::Return(Some(Expr::infix(
                InfixOp::Add,
                Expr::ident("a"),
                Expr::ident("b"),
            )))]),
        },
    })]);
    let add = bytecode
        .functions
        .iter()
        .position(|f| f.name == "add")
        .unwrap();
    let body = code(&bytecode, add);
    let add_instr = body
        .iter()
        .find(|i| i.op().unwrap() == ROp::AddInt)
        .expect("AddInt");
    assert_eq!((add_instr.b(), add_instr.c()), (0, 1));
    assert!(bytecode.functions[add].num_locals >= 2);
}

#[test]
fn register_windows_have_a_high_water_mark() {
    let bytecode = compile(vec![
        Stmt::var_typed("a", TypeExpr::named("int"), Expr::Int(1)),
        Stmt::var_typed("b", TypeExpr::named("int"), Expr::Int(2)),
        Stmt::var_typed("c", TypeExpr::named("int"), Expr::Int(3)),
    ]);
    // Three named registers plus at least one temp for the loads.
    assert!(bytecode.functions[bytecode.main].num_locals >= 4);
}

#[test]
fn closures_are_rejected() {
    let inner = Expr::Func(FuncLit {
        params: vec![],
        return_ty: Some(TypeExpr::named("int")),
        body: Block::new(vec![Stmt::Return(Some(Expr::ident("c")))]),
    });
    let err = compile_err(vec![Stmt::Func(FuncDecl {
        name: "mk".into(),
        func: FuncLit {
            params: vec![],
            return_ty: Some(TypeExpr::func(vec![], TypeExpr::named("int"))),
            body: Block::new(vec![
                Stmt::var_typed("c", TypeExpr::named("int"), Expr::Int(0)),
                Stmt::Return(Some(inner)),
            ]),
        },
    })]);
    assert_eq!(err, CompileError::ClosureUnsupportedByBackend);
}

#[test]
fn set_field_is_paired_with_a_move() {
    let bytecode = compile(vec![
        Stmt::Type(TypeDecl::Struct {
            name: "Point".into(),
            fields: vec![
                ("x".into(), TypeExpr::named("int")),
                ("y".into(), TypeExpr::named("int")),
            ],
        }),
        Stmt::var(
            "p",
            Expr::Struct {
                name: "Point".into(),
                fields: vec![("x".into(), Expr::Int(1)), ("y".into(), Expr::Int(2))],
            },
        ),
        Stmt::Assign {
            target: AssignTarget::Field {
                object: Expr::ident("p"),
                field: "x".into(),
            },
            value: Expr::Int(9),
        },
    ]);
    let main = code(&bytecode, bytecode.main);
    for (i, instr) in main.iter().enumerate() {
        if instr.op().unwrap() == ROp::SetField {
            assert_eq!(
                main[i + 1].op().unwrap(),
                ROp::Move,
                "SetField at {} must be followed by its Move",
                i
            );
        }
    }
    assert!(main.iter().any(|i| i.op().unwrap() == ROp::SetField));
}

#[test]
fn switch_exhaustiveness_applies_here_too() {
    let case = |name: &str| SwitchCase {
        value: Expr::ident(name),
        body: Block::default(),
    };
    let err = compile_err(vec![
        Stmt::Type(TypeDecl::Enum {
            name: "Color".into(),
            variants: vec!["R".into(), "G".into(), "B".into()],
        }),
        Stmt::var("c", Expr::ident("R")),
        Stmt::Switch {
            subject: Expr::ident("c"),
            cases: vec![case("R")],
            default: None,
        },
    ]);
    assert!(matches!(err, CompileError::SwitchNotExhaustive { .. }));
}

#[test]
fn functions_get_register_code_only() {
    let bytecode = compile(vec![Stmt::Expr(Expr::Int(1))]);
    for function in &bytecode.functions {
        assert!(matches!(function.code, FuncCode::Register(_)));
    }
    assert_eq!(bytecode.target, crate::bytecode::Backend::Register);
}

#[test]
fn compiling_twice_is_deterministic() {
    let program = || {
        vec![
            Stmt::var_typed("x", TypeExpr::named("float"), Expr::Float(2.0)),
            Stmt::Expr(Expr::call(
                Expr::ident("print"),
                vec![Expr::infix(
                    InfixOp::Mul,
                    Expr::ident("x"),
                    Expr::ident("x"),
                )],
            )),
        ]
    };
    let a = compile(program());
    let b = compile(program());
    assert_eq!(a.functions, b.functions);
    assert_eq!(
        crate::format!("{:?}", a.constants),
        crate::format!("{:?}", b.constants)
    );
}
