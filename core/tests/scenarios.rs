//! End-to-end scenarios with literal expected output.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use skiff_core::ast::*;
use skiff_core::bytecode::FuncCode;
use skiff_core::vm::op::{InstrIter, Op};
use skiff_core::vm::rop::ROp;
use skiff_core::{compile, Backend, World};

fn print_call(arg: Expr) -> Stmt {
    Stmt::Expr(Expr::call(Expr::ident("print"), vec![arg]))
}

/// `func fact(n:int):int { if n<=1 { return 1 }; return n*fact(n-1) }
/// print(fact(5))`
fn factorial_program() -> Program {
    Program::new(vec![
        Stmt::Func(FuncDecl {
            name: "fact".into(),
            func: FuncLit {
                params: vec![Param::new("n", TypeExpr::named("int"))],
                return_ty: Some(TypeExpr::named("int")),
                body: Block::new(vec![
                    Stmt::If(IfStmt {
                        cond: Expr::infix(InfixOp::Le, Expr::ident("n"), Expr::Int(1)),
                        then: Block::new(vec![Stmt::Return(Some(Expr::Int(1)))]),
                        else_: None,
                    }),
                    Stmt::Return(Some(Expr::infix(
                        InfixOp::Mul,
                        Expr::ident("n"),
                        Expr::call(
                            Expr::ident("fact"),
                            vec![Expr::infix(InfixOp::Sub, Expr::ident("n"), Expr::Int(1))],
                        ),
                    ))),
                ]),
            },
        }),
        print_call(Expr::call(Expr::ident("fact"), vec![Expr::Int(5)])),
    ])
}

#[test]
fn integer_factorial() {
    assert_both_backends(&factorial_program(), "120\n");
}

/// `func mk():func():int { var c:int=0; return func():int { c=c+1; return c } }
/// var f=mk(); print(f()); print(f()); print(f())`
#[test]
fn closure_counter() {
    let counter = Expr::Func(FuncLit {
        params: vec![],
        return_ty: Some(TypeExpr::named("int")),
        body: Block::new(vec![
            Stmt::assign(
                "c",
                Expr::infix(InfixOp::Add, Expr::ident("c"), Expr::Int(1)),
            ),
            Stmt::Return(Some(Expr::ident("c"))),
        ]),
    });
    let program = Program::new(vec![
        Stmt::Func(FuncDecl {
            name: "mk".into(),
            func: FuncLit {
                params: vec![],
                return_ty: Some(TypeExpr::func(vec![], TypeExpr::named("int"))),
                body: Block::new(vec![
                    Stmt::var_typed("c", TypeExpr::named("int"), Expr::Int(0)),
                    Stmt::Return(Some(counter)),
                ]),
            },
        }),
        Stmt::var("f", Expr::call(Expr::ident("mk"), vec![])),
        print_call(Expr::call(Expr::ident("f"), vec![])),
        print_call(Expr::call(Expr::ident("f"), vec![])),
        print_call(Expr::call(Expr::ident("f"), vec![])),
    ]);
    // Closures are a stack-backend feature.
    assert_eq!(stack_output(&program), "1\n2\n3\n");
}

/// `var m:map[int]string = map[int]string{1:"a",2:"b"}; m[3]="c";
/// print(len(m)); print(m[2])`
#[test]
fn map_with_integer_keys() {
    let key_ty = TypeExpr::named("int");
    let value_ty = TypeExpr::named("string");
    let program = Program::new(vec![
        Stmt::var_typed(
            "m",
            TypeExpr::map(key_ty.clone(), value_ty.clone()),
            Expr::Map {
                key_ty,
                value_ty,
                entries: vec![
                    (Expr::Int(1), Expr::str("a")),
                    (Expr::Int(2), Expr::str("b")),
                ],
            },
        ),
        Stmt::Assign {
            target: AssignTarget::Index {
                object: Expr::ident("m"),
                index: Expr::Int(3),
            },
            value: Expr::str("c"),
        },
        print_call(Expr::call(Expr::ident("len"), vec![Expr::ident("m")])),
        print_call(Expr::index(Expr::ident("m"), Expr::Int(2))),
    ]);
    assert_both_backends(&program, "3\nb\n");
}

/// A switch over `Color { R, G, B }` covering only R and G must fail,
/// naming the missing variant.
#[test]
fn switch_exhaustiveness_rejection() {
    let case = |name: &str| SwitchCase {
        value: Expr::ident(name),
        body: Block::new(vec![print_call(Expr::Int(0))]),
    };
    let program = Program::new(vec![
        Stmt::Type(TypeDecl::Enum {
            name: "Color".into(),
            variants: vec!["R".into(), "G".into(), "B".into()],
        }),
        Stmt::var("c", Expr::ident("G")),
        Stmt::Switch {
            subject: Expr::ident("c"),
            cases: vec![case("R"), case("G")],
            default: None,
        },
    ]);
    for backend in [Backend::Stack, Backend::Register] {
        let err = compile_error(&program, backend);
        let message = err.to_string();
        assert!(
            message.contains("B"),
            "error must name the missing variant: {}",
            message
        );
    }
}

/// `var i:int=0; for i<5 { i = i + 1 }` compiles the loop body to exactly
/// one `IncLocal slot, 1`.
#[test]
fn counting_loop_peephole() {
    let program = Program::new(vec![
        Stmt::var_typed("i", TypeExpr::named("int"), Expr::Int(0)),
        Stmt::For {
            init: None,
            cond: Some(Expr::infix(InfixOp::Lt, Expr::ident("i"), Expr::Int(5))),
            post: None,
            body: Block::new(vec![Stmt::assign(
                "i",
                Expr::infix(InfixOp::Add, Expr::ident("i"), Expr::Int(1)),
            )]),
        },
        print_call(Expr::ident("i")),
    ]);
    let mut world = World::new();
    let bytecode = compile(&program, Backend::Stack, &mut world).unwrap();
    let FuncCode::Stack(code) = &bytecode.functions[bytecode.main].code else {
        panic!("expected stack code");
    };
    let incs: Vec<_> = InstrIter::new(code)
        .map(|i| i.unwrap())
        .filter(|i| i.op == Op::IncLocal)
        .collect();
    assert_eq!(incs.len(), 1);
    assert_eq!(incs[0].operands.as_slice(), &[0, 1]);

    // And the loop still runs correctly.
    assert_both_backends(&program, "5\n");
}

/// `var x:float=3.0; print(x*x)` on the register backend: exactly one
/// SquareFloat on the register holding x, and the canonical float output.
#[test]
fn register_square_pattern() {
    let program = Program::new(vec![
        Stmt::var_typed("x", TypeExpr::named("float"), Expr::Float(3.0)),
        print_call(Expr::infix(
            InfixOp::Mul,
            Expr::ident("x"),
            Expr::ident("x"),
        )),
    ]);
    let mut world = World::new();
    let bytecode = compile(&program, Backend::Register, &mut world).unwrap();
    let FuncCode::Register(code) = &bytecode.functions[bytecode.main].code else {
        panic!("expected register code");
    };
    let squares: Vec<_> = code
        .iter()
        .filter(|i| i.op().unwrap() == ROp::SquareFloat)
        .collect();
    assert_eq!(squares.len(), 1);
    let x_register = code
        .iter()
        .find(|i| i.op().unwrap() == ROp::Move)
        .expect("variable initialization move")
        .a();
    assert_eq!(squares[0].b(), x_register);

    assert_eq!(register_output(&program), "9.000000\n");
}
