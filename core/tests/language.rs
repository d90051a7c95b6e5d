//! Feature-level end-to-end tests: both engines must agree on observable
//! behavior for everything the register backend supports; closure tests run
//! on the stack engine alone.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use skiff_core::ast::*;

fn print_call(arg: Expr) -> Stmt {
    Stmt::Expr(Expr::call(Expr::ident("print"), vec![arg]))
}

#[test]
fn arithmetic_and_precedence_shapes() {
    let program = Program::new(vec![
        print_call(Expr::infix(
            InfixOp::Add,
            Expr::Int(2),
            Expr::infix(InfixOp::Mul, Expr::Int(3), Expr::Int(4)),
        )),
        print_call(Expr::infix(InfixOp::Mod, Expr::Int(17), Expr::Int(5))),
        print_call(Expr::infix(InfixOp::Div, Expr::Float(1.0), Expr::Float(4.0))),
        print_call(Expr::prefix(PrefixOp::Neg, Expr::Int(7))),
    ]);
    assert_both_backends(&program, "14\n2\n0.250000\n-7\n");
}

#[test]
fn mixed_numeric_arithmetic_promotes() {
    let program = Program::new(vec![
        Stmt::var_typed("n", TypeExpr::named("int"), Expr::Int(3)),
        Stmt::var_typed("x", TypeExpr::named("float"), Expr::Float(0.5)),
        print_call(Expr::infix(
            InfixOp::Add,
            Expr::ident("n"),
            Expr::ident("x"),
        )),
    ]);
    assert_both_backends(&program, "3.500000\n");
}

#[test]
fn string_concatenation_renders_non_strings() {
    let program = Program::new(vec![print_call(Expr::infix(
        InfixOp::Add,
        Expr::str("n="),
        Expr::Int(42),
    ))]);
    assert_both_backends(&program, "n=42\n");
}

#[test]
fn booleans_and_logic() {
    let program = Program::new(vec![
        print_call(Expr::infix(InfixOp::And, Expr::Bool(true), Expr::Bool(false))),
        print_call(Expr::infix(InfixOp::Or, Expr::Bool(true), Expr::Bool(false))),
        print_call(Expr::prefix(PrefixOp::Not, Expr::Bool(false))),
        print_call(Expr::infix(InfixOp::Eq, Expr::str("a"), Expr::str("a"))),
        print_call(Expr::infix(InfixOp::Ne, Expr::Int(1), Expr::Int(2))),
    ]);
    assert_both_backends(&program, "false\ntrue\ntrue\ntrue\ntrue\n");
}

#[test]
fn if_else_chains() {
    let classify = |n: i64| {
        Stmt::If(IfStmt {
            cond: Expr::infix(InfixOp::Lt, Expr::Int(n), Expr::Int(0)),
            then: Block::new(vec![print_call(Expr::str("neg"))]),
            else_: Some(ElseArm::If(Box::new(IfStmt {
                cond: Expr::infix(InfixOp::Eq, Expr::Int(n), Expr::Int(0)),
                then: Block::new(vec![print_call(Expr::str("zero"))]),
                else_: Some(ElseArm::Block(Block::new(vec![print_call(Expr::str(
                    "pos",
                ))]))),
            }))),
        })
    };
    let program = Program::new(vec![classify(-5), classify(0), classify(3)]);
    assert_both_backends(&program, "neg\nzero\npos\n");
}

#[test]
fn for_loop_with_break_and_continue() {
    // Sum even numbers below 10, stopping at 8.
    let program = Program::new(vec![
        Stmt::var_typed("sum", TypeExpr::named("int"), Expr::Int(0)),
        Stmt::For {
            init: Some(Box::new(Stmt::var_typed(
                "i",
                TypeExpr::named("int"),
                Expr::Int(0),
            ))),
            cond: Some(Expr::infix(InfixOp::Lt, Expr::ident("i"), Expr::Int(100))),
            post: Some(Box::new(Stmt::assign(
                "i",
                Expr::infix(InfixOp::Add, Expr::ident("i"), Expr::Int(1)),
            ))),
            body: Block::new(vec![
                Stmt::If(IfStmt {
                    cond: Expr::infix(InfixOp::Eq, Expr::ident("i"), Expr::Int(8)),
                    then: Block::new(vec![Stmt::Break]),
                    else_: None,
                }),
                Stmt::If(IfStmt {
                    cond: Expr::infix(
                        InfixOp::Ne,
                        Expr::infix(InfixOp::Mod, Expr::ident("i"), Expr::Int(2)),
                        Expr::Int(0),
                    ),
                    then: Block::new(vec![Stmt::Continue]),
                    else_: None,
                }),
                Stmt::assign(
                    "sum",
                    Expr::infix(InfixOp::Add, Expr::ident("sum"), Expr::ident("i")),
                ),
            ]),
        },
        print_call(Expr::ident("sum")),
    ]);
    // 0 + 2 + 4 + 6 = 12
    assert_both_backends(&program, "12\n");
}

#[test]
fn arrays_end_to_end() {
    let program = Program::new(vec![
        Stmt::var_typed(
            "a",
            TypeExpr::array(TypeExpr::named("int")),
            Expr::Array {
                elem_ty: Some(TypeExpr::named("int")),
                elements: vec![Expr::Int(10), Expr::Int(20), Expr::Int(30)],
            },
        ),
        Stmt::Assign {
            target: AssignTarget::Index {
                object: Expr::ident("a"),
                index: Expr::Int(1),
            },
            value: Expr::Int(21),
        },
        print_call(Expr::index(Expr::ident("a"), Expr::Int(1))),
        print_call(Expr::call(Expr::ident("len"), vec![Expr::ident("a")])),
        Stmt::var(
            "b",
            Expr::call(
                Expr::ident("append"),
                vec![Expr::ident("a"), Expr::Int(40)],
            ),
        ),
        print_call(Expr::call(Expr::ident("len"), vec![Expr::ident("b")])),
        // append returned a fresh array.
        print_call(Expr::call(Expr::ident("len"), vec![Expr::ident("a")])),
        print_call(Expr::ident("b")),
    ]);
    assert_both_backends(&program, "21\n3\n4\n3\n[10, 21, 30, 40]\n");
}

#[test]
fn maps_end_to_end() {
    let entry_ty = (TypeExpr::named("string"), TypeExpr::named("int"));
    let program = Program::new(vec![
        Stmt::var(
            "ages",
            Expr::Map {
                key_ty: entry_ty.0.clone(),
                value_ty: entry_ty.1.clone(),
                entries: vec![
                    (Expr::str("ada"), Expr::Int(36)),
                    (Expr::str("alan"), Expr::Int(41)),
                ],
            },
        ),
        Stmt::Expr(Expr::call(
            Expr::ident("delete"),
            vec![Expr::ident("ages"), Expr::str("alan")],
        )),
        print_call(Expr::call(Expr::ident("len"), vec![Expr::ident("ages")])),
        print_call(Expr::call(Expr::ident("keys"), vec![Expr::ident("ages")])),
        print_call(Expr::call(Expr::ident("values"), vec![Expr::ident("ages")])),
        // Missing key reads as nil.
        print_call(Expr::index(Expr::ident("ages"), Expr::str("alan"))),
    ]);
    assert_both_backends(&program, "1\n[\"ada\"]\n[36]\nnil\n");
}

#[test]
fn structs_end_to_end() {
    let program = Program::new(vec![
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
                field: "y".into(),
            },
            value: Expr::Int(9),
        },
        print_call(Expr::field(Expr::ident("p"), "x")),
        print_call(Expr::field(Expr::ident("p"), "y")),
        print_call(Expr::ident("p")),
    ]);
    assert_both_backends(&program, "1\n9\nPoint{x: 1, y: 9}\n");
}

#[test]
fn enums_and_reflection() {
    let program = Program::new(vec![
        Stmt::Type(TypeDecl::Enum {
            name: "Color".into(),
            variants: vec!["R".into(), "G".into(), "B".into()],
        }),
        Stmt::var("c", Expr::ident("G")),
        print_call(Expr::ident("c")),
        print_call(Expr::call(
            Expr::ident("enumName"),
            vec![Expr::str("Color"), Expr::ident("c")],
        )),
        print_call(Expr::call(
            Expr::ident("enumValue"),
            vec![Expr::str("Color"), Expr::str("B")],
        )),
    ]);
    assert_both_backends(&program, "1\nG\n2\n");
}

#[test]
fn switch_dispatches_to_the_matching_case() {
    let case = |name: &str, label: &str| SwitchCase {
        value: Expr::ident(name),
        body: Block::new(vec![print_call(Expr::str(label))]),
    };
    let program = Program::new(vec![
        Stmt::Type(TypeDecl::Enum {
            name: "Color".into(),
            variants: vec!["R".into(), "G".into(), "B".into()],
        }),
        Stmt::var("c", Expr::ident("B")),
        Stmt::Switch {
            subject: Expr::ident("c"),
            cases: vec![
                case("R", "red"),
                case("G", "green"),
                case("B", "blue"),
            ],
            default: None,
        },
    ]);
    assert_both_backends(&program, "blue\n");
}

#[test]
fn switch_falls_through_to_default() {
    let program = Program::new(vec![
        Stmt::var("n", Expr::Int(42)),
        Stmt::Switch {
            subject: Expr::ident("n"),
            cases: vec![
                SwitchCase {
                    value: Expr::Int(1),
                    body: Block::new(vec![print_call(Expr::str("one"))]),
                },
                SwitchCase {
                    value: Expr::Int(2),
                    body: Block::new(vec![print_call(Expr::str("two"))]),
                },
            ],
            default: Some(Block::new(vec![print_call(Expr::str("many"))])),
        },
    ]);
    assert_both_backends(&program, "many\n");
}

#[test]
fn nested_function_calls() {
    // fib(10) = 55 the slow way.
    let program = Program::new(vec![
        Stmt::Func(FuncDecl {
            name: "fib".into(),
            func: FuncLit {
                params: vec![Param::new("n", TypeExpr::named("int"))],
                return_ty: Some(TypeExpr::named("int")),
                body: Block::new(vec![
                    Stmt::If(IfStmt {
                        cond: Expr::infix(InfixOp::Lt, Expr::ident("n"), Expr::Int(2)),
                        then: Block::new(vec![Stmt::Return(Some(Expr::ident("n")))]),
                        else_: None,
                    }),
                    Stmt::Return(Some(Expr::infix(
                        InfixOp::Add,
                        Expr::call(
                            Expr::ident("fib"),
                            vec![Expr::infix(InfixOp::Sub, Expr::ident("n"), Expr::Int(1))],
                        ),
                        Expr::call(
                            Expr::ident("fib"),
                            vec![Expr::infix(InfixOp::Sub, Expr::ident("n"), Expr::Int(2))],
                        ),
                    ))),
                ]),
            },
        }),
        print_call(Expr::call(Expr::ident("fib"), vec![Expr::Int(10)])),
    ]);
    assert_both_backends(&program, "55\n");
}

#[test]
fn functions_returning_nil_need_no_return() {
    let program = Program::new(vec![
        Stmt::Func(FuncDecl {
            name: "greet".into(),
            func: FuncLit {
                params: vec![Param::new("name", TypeExpr::named("string"))],
                return_ty: None,
                body: Block::new(vec![print_call(Expr::infix(
                    InfixOp::Add,
                    Expr::str("hi "),
                    Expr::ident("name"),
                ))]),
            },
        }),
        Stmt::Expr(Expr::call(Expr::ident("greet"), vec![Expr::str("ada")])),
    ]);
    assert_both_backends(&program, "hi ada\n");
}

#[test]
fn copy_detaches_containers() {
    let program = Program::new(vec![
        Stmt::var(
            "a",
            Expr::Array {
                elem_ty: Some(TypeExpr::named("int")),
                elements: vec![Expr::Int(1), Expr::Int(2)],
            },
        ),
        Stmt::var("b", Expr::call(Expr::ident("copy"), vec![Expr::ident("a")])),
        Stmt::Assign {
            target: AssignTarget::Index {
                object: Expr::ident("b"),
                index: Expr::Int(0),
            },
            value: Expr::Int(99),
        },
        print_call(Expr::index(Expr::ident("a"), Expr::Int(0))),
        print_call(Expr::index(Expr::ident("b"), Expr::Int(0))),
    ]);
    assert_both_backends(&program, "1\n99\n");
}

#[test]
fn string_indexing_and_length() {
    let program = Program::new(vec![
        Stmt::var("s", Expr::str("abc")),
        print_call(Expr::index(Expr::ident("s"), Expr::Int(0))),
        print_call(Expr::call(Expr::ident("len"), vec![Expr::ident("s")])),
    ]);
    assert_both_backends(&program, "a\n3\n");
}

#[test]
fn shadowing_in_blocks() {
    let program = Program::new(vec![
        Stmt::var_typed("x", TypeExpr::named("int"), Expr::Int(1)),
        Stmt::Block(Block::new(vec![
            Stmt::var_typed("x", TypeExpr::named("string"), Expr::str("inner")),
            print_call(Expr::ident("x")),
        ])),
        print_call(Expr::ident("x")),
    ]);
    assert_both_backends(&program, "inner\n1\n");
}

#[test]
fn print_with_multiple_values() {
    let program = Program::new(vec![Stmt::Expr(Expr::call(
        Expr::ident("print"),
        vec![Expr::Int(1), Expr::str("two"), Expr::Float(3.0), Expr::Bool(true), Expr::Nil],
    ))]);
    assert_both_backends(&program, "1 two 3.000000 true nil\n");
}

#[test]
fn closures_share_state_per_instance() {
    // Two counters advance independently (stack backend).
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
        Stmt::var("a", Expr::call(Expr::ident("mk"), vec![])),
        Stmt::var("b", Expr::call(Expr::ident("mk"), vec![])),
        print_call(Expr::call(Expr::ident("a"), vec![])),
        print_call(Expr::call(Expr::ident("a"), vec![])),
        print_call(Expr::call(Expr::ident("b"), vec![])),
    ]);
    assert_eq!(stack_output(&program), "1\n2\n1\n");
}
