//! Shared static analysis: declaration collection, type resolution, operator
//! and builtin typing, return-path analysis, switch checking.
//!
//! Both backends lean on this module so the type rules cannot drift between
//! them; only instruction selection differs per backend.

use ecow::EcoString;
use hashbrown::HashMap;

use crate::ast::{Block, ElseArm, Expr, InfixOp, Program, Stmt, TypeDecl, TypeExpr};
use crate::types::{EnumDef, EnumRegistry, FuncSig, StructDef, Type};
use crate::{String, ToString, Vec};

use super::error::CompileError;

/// Everything the declaration pre-pass learns about a program: struct and
/// enum definitions plus the module-level function signature map.
#[derive(Default)]
pub struct Declarations {
    pub structs: HashMap<EcoString, StructDef>,
    /// Declaration order, for the struct list in the artifact.
    pub struct_order: Vec<EcoString>,
    pub enums: EnumRegistry,
    pub sigs: HashMap<EcoString, FuncSig>,
}

impl Declarations {
    /// Collect type and function declarations from the top level. Runs in
    /// two steps so struct fields may reference types declared later.
    pub fn collect(program: &Program) -> Result<Declarations, CompileError> {
        let mut decls = Declarations::default();

        // Step 1: names only, so resolution below can see every type.
        for stmt in &program.statements {
            if let Stmt::Type(decl) = stmt {
                match decl {
                    TypeDecl::Struct { name, .. } => {
                        if decls.structs.contains_key(name) {
                            return Err(CompileError::DuplicateDefinition { name: name.clone() });
                        }
                        decls.struct_order.push(name.clone());
                        decls.structs.insert(
                            name.clone(),
                            StructDef {
                                name: name.clone(),
                                fields: Vec::new(),
                            },
                        );
                    }
                    TypeDecl::Enum { name, variants } => {
                        if decls.enums.def(name).is_some() {
                            return Err(CompileError::DuplicateDefinition { name: name.clone() });
                        }
                        decls.enums.register(EnumDef {
                            name: name.clone(),
                            variants: variants.clone(),
                        });
                    }
                }
            }
        }

        // Step 2: resolve struct field types and function signatures.
        for stmt in &program.statements {
            match stmt {
                Stmt::Type(TypeDecl::Struct { name, fields }) => {
                    let mut resolved = Vec::with_capacity(fields.len());
                    for (field, texpr) in fields {
                        resolved.push((field.clone(), decls.resolve_type(texpr)?));
                    }
                    decls.structs.get_mut(name).expect("registered above").fields = resolved;
                }
                Stmt::Func(decl) => {
                    let mut params = Vec::with_capacity(decl.func.params.len());
                    for param in &decl.func.params {
                        params.push(decls.resolve_type(&param.ty)?);
                    }
                    let ret = match &decl.func.return_ty {
                        Some(texpr) => decls.resolve_type(texpr)?,
                        None => Type::Nil,
                    };
                    decls.sigs.insert(decl.name.clone(), FuncSig { params, ret });
                }
                _ => {}
            }
        }

        tracing::debug!(
            structs = decls.struct_order.len(),
            functions = decls.sigs.len(),
            "declaration pre-pass complete"
        );
        Ok(decls)
    }

    /// Lower a source type annotation to a `Type`.
    pub fn resolve_type(&self, texpr: &TypeExpr) -> Result<Type, CompileError> {
        match texpr {
            TypeExpr::Named(name) => match name.as_str() {
                "int" => Ok(Type::Int),
                "float" => Ok(Type::Float),
                "bool" => Ok(Type::Bool),
                "string" => Ok(Type::Str),
                "nil" => Ok(Type::Nil),
                "any" => Ok(Type::Any),
                _ => {
                    if self.structs.contains_key(name) {
                        Ok(Type::Struct(name.clone()))
                    } else if self.enums.def(name).is_some() {
                        Ok(Type::Enum(name.clone()))
                    } else {
                        Err(CompileError::UnknownType { name: name.clone() })
                    }
                }
            },
            TypeExpr::Array(elem) => Ok(Type::array(self.resolve_type(elem)?)),
            TypeExpr::Map(key, value) => {
                let key = self.resolve_type(key)?;
                if !matches!(key, Type::Int | Type::Str | Type::Any) {
                    return Err(CompileError::MapKeyTypeMismatch {
                        expected: String::from("int or string"),
                        got: key.to_string(),
                    });
                }
                Ok(Type::map(key, self.resolve_type(value)?))
            }
            TypeExpr::Func(params, ret) => {
                let params = params
                    .iter()
                    .map(|p| self.resolve_type(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Type::func(params, self.resolve_type(ret)?))
            }
        }
    }
}

/// Result type of an infix operator, or the compile error rejecting it.
pub fn binary_result(op: InfixOp, left: &Type, right: &Type) -> Result<Type, CompileError> {
    let reject = || {
        Err(CompileError::UnknownOperator {
            op: op.symbol(),
            left: left.to_string(),
            right: right.to_string(),
        })
    };

    match op {
        InfixOp::And | InfixOp::Or => match (left, right) {
            (Type::Bool | Type::Any, Type::Bool | Type::Any) => Ok(Type::Bool),
            _ => reject(),
        },
        InfixOp::Add => match (left, right) {
            // `+` with any string operand is concatenation; the other side
            // is rendered canonically at runtime.
            (Type::Str, _) | (_, Type::Str) => Ok(Type::Str),
            (Type::Any, _) | (_, Type::Any) => Ok(Type::Any),
            (Type::Int, Type::Int) => Ok(Type::Int),
            (Type::Float, Type::Float) | (Type::Int, Type::Float) | (Type::Float, Type::Int) => {
                Ok(Type::Float)
            }
            _ => reject(),
        },
        InfixOp::Sub | InfixOp::Mul | InfixOp::Div => match (left, right) {
            (Type::Any, _) | (_, Type::Any) => Ok(Type::Any),
            (Type::Int, Type::Int) => Ok(Type::Int),
            (Type::Float, Type::Float) | (Type::Int, Type::Float) | (Type::Float, Type::Int) => {
                Ok(Type::Float)
            }
            _ => reject(),
        },
        // Modulo is integer-only.
        InfixOp::Mod => match (left, right) {
            (Type::Int | Type::Any, Type::Int | Type::Any) => Ok(Type::Int),
            _ => reject(),
        },
        InfixOp::Eq | InfixOp::Ne => match (left, right) {
            (Type::Any, _) | (_, Type::Any) => Ok(Type::Bool),
            (Type::Nil, _) | (_, Type::Nil) => Ok(Type::Bool),
            (Type::Int | Type::Float, Type::Int | Type::Float) => Ok(Type::Bool),
            (Type::Bool, Type::Bool) | (Type::Str, Type::Str) => Ok(Type::Bool),
            (Type::Enum(a), Type::Enum(b)) if a == b => Ok(Type::Bool),
            _ => reject(),
        },
        InfixOp::Lt | InfixOp::Le | InfixOp::Gt | InfixOp::Ge => match (left, right) {
            (Type::Any, _) | (_, Type::Any) => Ok(Type::Bool),
            (Type::Int | Type::Float, Type::Int | Type::Float) => Ok(Type::Bool),
            _ => reject(),
        },
    }
}

/// Arity and argument checking for the standard builtins, and the resulting
/// type. Host-defined builtins past the standard table type as `any`.
pub fn builtin_call_type(name: &str, args: &[Type]) -> Result<Type, CompileError> {
    let arity = |expected: usize| -> Result<(), CompileError> {
        if args.len() != expected {
            return Err(CompileError::WrongArgumentCount {
                name: EcoString::from(name),
                expected,
                got: args.len(),
            });
        }
        Ok(())
    };
    let arg_error = |index: usize, expected: &str| CompileError::ArgumentTypeMismatch {
        name: EcoString::from(name),
        index,
        expected: String::from(expected),
        got: args[index].to_string(),
    };

    match name {
        "print" => Ok(Type::Nil),
        "len" => {
            arity(1)?;
            match &args[0] {
                Type::Array(_) | Type::Map(..) | Type::Str | Type::Any => Ok(Type::Int),
                _ => Err(arg_error(0, "array, map, or string")),
            }
        }
        "delete" => {
            arity(2)?;
            match &args[0] {
                Type::Map(..) | Type::Any => Ok(Type::Nil),
                _ => Err(arg_error(0, "map")),
            }
        }
        "append" => {
            if args.is_empty() {
                return Err(CompileError::WrongArgumentCount {
                    name: EcoString::from(name),
                    expected: 1,
                    got: 0,
                });
            }
            match &args[0] {
                Type::Array(elem) => {
                    for (i, arg) in args.iter().enumerate().skip(1) {
                        if !elem.assignable_from(arg) {
                            return Err(arg_error(i, &elem.to_string()));
                        }
                    }
                    Ok(args[0].clone())
                }
                Type::Any => Ok(Type::Any),
                _ => Err(arg_error(0, "array")),
            }
        }
        "keys" => {
            arity(1)?;
            match &args[0] {
                Type::Map(key, _) => Ok(Type::Array(key.clone())),
                Type::Any => Ok(Type::array(Type::Any)),
                _ => Err(arg_error(0, "map")),
            }
        }
        "values" => {
            arity(1)?;
            match &args[0] {
                Type::Map(_, value) => Ok(Type::Array(value.clone())),
                Type::Any => Ok(Type::array(Type::Any)),
                _ => Err(arg_error(0, "map")),
            }
        }
        "copy" => {
            arity(1)?;
            Ok(args[0].clone())
        }
        "enumName" => {
            arity(2)?;
            if !matches!(args[0], Type::Str | Type::Any) {
                return Err(arg_error(0, "string"));
            }
            if !matches!(args[1], Type::Int | Type::Enum(_) | Type::Any) {
                return Err(arg_error(1, "int"));
            }
            Ok(Type::Str)
        }
        "enumValue" => {
            arity(2)?;
            if !matches!(args[0], Type::Str | Type::Any) {
                return Err(arg_error(0, "string"));
            }
            if !matches!(args[1], Type::Str | Type::Any) {
                return Err(arg_error(1, "string"));
            }
            Ok(Type::Int)
        }
        _ => Ok(Type::Any),
    }
}

/// Whether every execution path through the block ends in an explicit
/// `return`. Loops are conservatively treated as non-terminating analysis
/// targets, matching the rule that a non-nil function must return on every
/// path the checker can see.
pub fn block_terminates(block: &Block) -> bool {
    block.statements.iter().any(stmt_terminates)
}

fn stmt_terminates(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Return(_) => true,
        Stmt::Block(block) => block_terminates(block),
        Stmt::If(if_stmt) => if_terminates(if_stmt),
        Stmt::Switch {
            cases, default, ..
        } => {
            default.as_ref().is_some_and(block_terminates)
                && cases.iter().all(|case| block_terminates(&case.body))
        }
        _ => false,
    }
}

fn if_terminates(if_stmt: &crate::ast::IfStmt) -> bool {
    if !block_terminates(&if_stmt.then) {
        return false;
    }
    match &if_stmt.else_ {
        Some(ElseArm::Block(block)) => block_terminates(block),
        Some(ElseArm::If(nested)) => if_terminates(nested),
        None => false,
    }
}

/// Per-case facts the backend hands to [`check_switch`]: the case value's
/// type, and its enum identity when the value is a direct variant reference.
pub struct CaseInfo {
    pub ty: Type,
    pub variant: Option<(EcoString, EcoString)>,
}

/// Validate a switch statement on the normalized case-value set.
///
/// A switch is an enum switch when every case value is a variant reference
/// of one enum; such a switch may omit `default` only if every variant is
/// covered. Everything else requires a `default` arm. Cases from two
/// different enums are rejected outright.
pub fn check_switch(
    subject_ty: &Type,
    cases: &[CaseInfo],
    has_default: bool,
    enums: &EnumRegistry,
) -> Result<(), CompileError> {
    // Reject mixed enums regardless of what else is going on.
    let mut first_enum: Option<&EcoString> = None;
    for case in cases {
        if let Some((enum_name, _)) = &case.variant {
            match first_enum {
                None => first_enum = Some(enum_name),
                Some(first) if first != enum_name => {
                    return Err(CompileError::MixedEnumsInSwitch {
                        first: first.clone(),
                        second: enum_name.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    let all_variants = !cases.is_empty() && cases.iter().all(|case| case.variant.is_some());
    if all_variants {
        let enum_name = first_enum.expect("non-empty variant cases");
        if let Type::Enum(subject_enum) = subject_ty {
            if subject_enum != enum_name {
                return Err(CompileError::MixedEnumsInSwitch {
                    first: subject_enum.clone(),
                    second: enum_name.clone(),
                });
            }
        }
        if !has_default {
            let def = enums.def(enum_name).expect("variant of a known enum");
            let missing: Vec<&EcoString> = def
                .variants
                .iter()
                .filter(|variant| {
                    !cases
                        .iter()
                        .any(|case| case.variant.as_ref().is_some_and(|(_, v)| v == *variant))
                })
                .collect();
            if !missing.is_empty() {
                let mut joined = String::new();
                for (i, variant) in missing.iter().enumerate() {
                    if i > 0 {
                        joined.push_str(", ");
                    }
                    joined.push_str(variant);
                }
                return Err(CompileError::SwitchNotExhaustive {
                    name: enum_name.clone(),
                    missing: joined,
                });
            }
        }
        return Ok(());
    }

    if !has_default {
        return Err(CompileError::SwitchRequiresDefault);
    }
    Ok(())
}

/// Whether a statically known `x * x` should become a square instruction:
/// requires syntactic identity of the operands.
pub fn is_square(op: InfixOp, left: &Expr, right: &Expr) -> bool {
    op == InfixOp::Mul && left == right
}
