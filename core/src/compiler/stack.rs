//! The stack-bytecode backend.
//!
//! A single bottom-up walk over the AST, emitting in source order through a
//! [`CodeBuilder`] per function. Expression compilation leaves exactly one
//! value on the operand stack; statements leave none. Opcode selection runs
//! on the types derived during the walk, and the four peephole rewrites fire
//! at emission time against the builder's last-instruction state.

use core::mem;

use ecow::EcoString;

use crate::ast::{
    AssignTarget, Block, ElseArm, Expr, FuncLit, IfStmt, InfixOp, PrefixOp, Program, Stmt,
    SwitchCase, TypeDecl,
};
use crate::bytecode::{Backend, Bytecode, FuncCode, Function};
use crate::types::{SpecTag, Type};
use crate::values::World;
use crate::vm::builtins;
use crate::vm::op::Op;
use crate::{String, ToString, Vec};

use super::consts::ConstPool;
use super::emit::CodeBuilder;
use super::error::CompileError;
use super::symbols::{ScopeKind, Symbol, SymbolTable};
use super::typing::{
    binary_result, block_terminates, builtin_call_type, check_switch, is_square, CaseInfo,
    Declarations,
};

/// Break/continue positions accumulated inside one `for`.
#[derive(Default)]
struct LoopCtx {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

/// Per-function compilation state.
struct FnCtx {
    builder: CodeBuilder,
    loops: Vec<LoopCtx>,
    name: EcoString,
    ret: Type,
}

pub struct StackCompiler<'w> {
    world: &'w mut World,
    decls: Declarations,
    consts: ConstPool,
    functions: Vec<Function>,
    symbols: SymbolTable,
    fn_stack: Vec<FnCtx>,
}

/// Compile a program to stack bytecode.
pub fn compile_stack(program: &Program, world: &mut World) -> Result<Bytecode, CompileError> {
    let decls = Declarations::collect(program)?;
    let mut compiler = StackCompiler {
        world,
        decls,
        consts: ConstPool::new(),
        functions: Vec::new(),
        symbols: SymbolTable::global(),
        fn_stack: crate::vec![FnCtx {
            builder: CodeBuilder::new(),
            loops: Vec::new(),
            name: "main".into(),
            ret: Type::Any,
        }],
    };
    // Functions and enum variants are the globals; `var` statements, even at
    // the top level, are locals of the entry frame.
    compiler.predefine_globals(program)?;
    compiler.symbols = SymbolTable::enclosed(mem::take(&mut compiler.symbols));

    for stmt in &program.statements {
        compiler.compile_stmt(stmt)?;
    }

    // The entry frame returns its final value; a program's is nil.
    if compiler.last_op() != Some(Op::Return) {
        let nil = compiler.consts.add_nil()?;
        compiler.emit(Op::Constant, &[nil]);
        compiler.emit(Op::Return, &[]);
    }

    let main_ctx = compiler.fn_stack.pop().expect("main context");
    let main_table = mem::take(&mut compiler.symbols);
    let num_locals = main_table.num_definitions;
    let root = main_table.into_outer().expect("root table");
    let num_globals = root.num_definitions as usize;

    let main = compiler.functions.len();
    compiler.functions.push(Function {
        name: main_ctx.name,
        num_params: 0,
        num_locals,
        code: FuncCode::Stack(main_ctx.builder.into_code()),
    });
    tracing::debug!(
        functions = compiler.functions.len(),
        constants = compiler.consts.values().len(),
        globals = num_globals,
        "stack compilation complete"
    );
    let structs = compiler
        .decls
        .struct_order
        .iter()
        .map(|name| compiler.decls.structs[name].clone())
        .collect();
    Ok(Bytecode {
        target: Backend::Stack,
        constants: compiler.consts.into_values(),
        functions: compiler.functions,
        main,
        num_globals,
        enums: compiler.decls.enums,
        structs,
    })
}

impl<'w> StackCompiler<'w> {
    // === Pre-pass =======================================================

    /// Define global symbols for functions and enum variants before the main
    /// walk so forward references and recursion resolve.
    fn predefine_globals(&mut self, program: &Program) -> Result<(), CompileError> {
        for stmt in &program.statements {
            match stmt {
                Stmt::Func(decl) => {
                    let sig = self.decls.sigs[&decl.name].clone();
                    self.define(decl.name.clone(), sig.as_type(), false)?;
                }
                Stmt::Type(TypeDecl::Enum { name, variants }) => {
                    for variant in variants {
                        self.define(variant.clone(), Type::Enum(name.clone()), false)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // === Small helpers ==================================================

    fn ctx(&mut self) -> &mut FnCtx {
        self.fn_stack.last_mut().expect("function context")
    }

    fn emit(&mut self, op: Op, operands: &[u16]) -> usize {
        self.ctx().builder.emit(op, operands)
    }

    fn pos(&mut self) -> usize {
        self.ctx().builder.pos()
    }

    fn last_op(&mut self) -> Option<Op> {
        self.ctx().builder.last_op()
    }

    fn define(&mut self, name: EcoString, ty: Type, mutable: bool) -> Result<Symbol, CompileError> {
        if self.symbols.num_definitions == u16::MAX {
            return Err(CompileError::TooManyLocals);
        }
        self.symbols
            .define(name.clone(), ty, mutable)
            .ok_or(CompileError::DuplicateDefinition { name })
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), CompileError> {
        self.symbols.push_block();
        for stmt in &block.statements {
            self.compile_stmt(stmt)?;
        }
        self.symbols.pop_block();
        Ok(())
    }

    fn push_nil(&mut self) -> Result<(), CompileError> {
        let nil = self.consts.add_nil()?;
        self.emit(Op::Constant, &[nil]);
        Ok(())
    }

    fn check_condition(&self, ty: &Type) -> Result<(), CompileError> {
        if matches!(ty, Type::Bool | Type::Any) {
            Ok(())
        } else {
            Err(CompileError::AssignTypeMismatch {
                target: "condition".into(),
                expected: String::from("bool"),
                got: ty.to_string(),
            })
        }
    }

    // === Statements =====================================================

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Var {
                name,
                ty,
                init,
                mutable,
            } => self.compile_var(name, ty.as_ref(), init.as_ref(), *mutable),
            Stmt::Assign { target, value } => self.compile_assign(target, value),
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop, &[]);
                Ok(())
            }
            Stmt::Block(block) => self.compile_block(block),
            Stmt::If(if_stmt) => self.compile_if(if_stmt),
            Stmt::For {
                init,
                cond,
                post,
                body,
            } => self.compile_for(init.as_deref(), cond.as_ref(), post.as_deref(), body),
            Stmt::Break => {
                let jump = self.ctx().builder.emit_jump(Op::Jump);
                self.ctx()
                    .loops
                    .last_mut()
                    .ok_or(CompileError::BreakOutsideLoop)?
                    .breaks
                    .push(jump);
                Ok(())
            }
            Stmt::Continue => {
                let jump = self.ctx().builder.emit_jump(Op::Jump);
                self.ctx()
                    .loops
                    .last_mut()
                    .ok_or(CompileError::ContinueOutsideLoop)?
                    .continues
                    .push(jump);
                Ok(())
            }
            Stmt::Return(value) => self.compile_return(value.as_ref()),
            Stmt::Func(decl) => {
                if self.fn_stack.len() == 1 {
                    // Symbol and signature were predefined as globals.
                    let symbol = self.symbols.resolve(&decl.name).expect("predefined");
                    self.compile_func_lit(&decl.func, decl.name.clone())?;
                    self.emit(Op::SetGlobal, &[symbol.index]);
                } else {
                    // Nested named function: a local holding the value.
                    let ty = self.func_lit_type(&decl.func)?;
                    let symbol = self.define(decl.name.clone(), ty, false)?;
                    self.compile_func_lit(&decl.func, decl.name.clone())?;
                    self.emit(Op::SetLocal, &[symbol.index]);
                }
                Ok(())
            }
            Stmt::Type(decl) => self.compile_type_decl(decl),
            Stmt::Switch {
                subject,
                cases,
                default,
            } => self.compile_switch(subject, cases, default.as_ref()),
        }
    }

    fn compile_var(
        &mut self,
        name: &EcoString,
        ty: Option<&crate::ast::TypeExpr>,
        init: Option<&Expr>,
        mutable: bool,
    ) -> Result<(), CompileError> {
        let declared = match ty {
            Some(texpr) => Some(self.decls.resolve_type(texpr)?),
            None => None,
        };
        let init_ty = match init {
            Some(expr) => Some(self.compile_expr(expr)?),
            None => {
                self.push_nil()?;
                None
            }
        };
        let var_ty = match (declared, init_ty) {
            (Some(declared), Some(init_ty)) => {
                if !declared.assignable_from(&init_ty) {
                    return Err(CompileError::AssignTypeMismatch {
                        target: name.clone(),
                        expected: declared.to_string(),
                        got: init_ty.to_string(),
                    });
                }
                declared
            }
            (Some(declared), None) => declared,
            (None, Some(init_ty)) => init_ty,
            (None, None) => Type::Any,
        };
        let symbol = self.define(name.clone(), var_ty, mutable)?;
        match symbol.scope {
            ScopeKind::Global => self.emit(Op::SetGlobal, &[symbol.index]),
            ScopeKind::Local => self.emit(Op::SetLocal, &[symbol.index]),
            _ => unreachable!("definitions are global or local"),
        };
        Ok(())
    }

    fn compile_assign(&mut self, target: &AssignTarget, value: &Expr) -> Result<(), CompileError> {
        match target {
            AssignTarget::Ident(name) => {
                let symbol = self
                    .symbols
                    .resolve(name)
                    .ok_or_else(|| CompileError::UndefinedVariable { name: name.clone() })?;
                if !symbol.mutable {
                    return Err(CompileError::AssignToConst { name: name.clone() });
                }
                // Rewrite `i = i ± k` into a single in-place step when the
                // literal fits the 16-bit operand.
                if self.try_inc_dec(&symbol, name, value) {
                    return Ok(());
                }
                let value_ty = self.compile_expr(value)?;
                if !symbol.ty.assignable_from(&value_ty) {
                    return Err(CompileError::AssignTypeMismatch {
                        target: name.clone(),
                        expected: symbol.ty.to_string(),
                        got: value_ty.to_string(),
                    });
                }
                match symbol.scope {
                    ScopeKind::Global => self.emit(Op::SetGlobal, &[symbol.index]),
                    ScopeKind::Local => self.emit(Op::SetLocal, &[symbol.index]),
                    ScopeKind::Free => self.emit(Op::SetFree, &[symbol.index]),
                    ScopeKind::Builtin => {
                        return Err(CompileError::UndefinedVariable { name: name.clone() })
                    }
                };
                Ok(())
            }
            AssignTarget::Index { object, index } => {
                let object_ty = self.compile_expr(object)?;
                match object_ty {
                    Type::Array(elem) => {
                        let index_ty = self.compile_expr(index)?;
                        if !matches!(index_ty, Type::Int | Type::Any) {
                            return Err(CompileError::UnknownOperator {
                                op: "[]",
                                left: Type::Array(elem).to_string(),
                                right: index_ty.to_string(),
                            });
                        }
                        let value_ty = self.compile_expr(value)?;
                        if !elem.assignable_from(&value_ty) {
                            return Err(CompileError::AssignTypeMismatch {
                                target: "array element".into(),
                                expected: elem.to_string(),
                                got: value_ty.to_string(),
                            });
                        }
                        self.emit(Op::ArraySet, &[]);
                        Ok(())
                    }
                    Type::Map(key, val) => {
                        let key_ty = self.compile_expr(index)?;
                        if !key.assignable_from(&key_ty) {
                            return Err(CompileError::MapKeyTypeMismatch {
                                expected: key.to_string(),
                                got: key_ty.to_string(),
                            });
                        }
                        let value_ty = self.compile_expr(value)?;
                        if !val.assignable_from(&value_ty) {
                            return Err(CompileError::MapValueTypeMismatch {
                                expected: val.to_string(),
                                got: value_ty.to_string(),
                            });
                        }
                        self.emit(Op::MapSet, &[]);
                        Ok(())
                    }
                    Type::Any => {
                        self.compile_expr(index)?;
                        self.compile_expr(value)?;
                        self.emit(Op::IndexSet, &[]);
                        Ok(())
                    }
                    other => Err(CompileError::UnknownOperator {
                        op: "[]=",
                        left: other.to_string(),
                        right: String::from("_"),
                    }),
                }
            }
            AssignTarget::Field { object, field } => {
                let object_ty = self.compile_expr(object)?;
                match object_ty {
                    Type::Struct(struct_name) => {
                        let def = self
                            .decls
                            .structs
                            .get(&struct_name)
                            .expect("struct type resolved earlier");
                        let offset =
                            def.offset_of(field)
                                .ok_or_else(|| CompileError::UnknownStructField {
                                    ty: struct_name.clone(),
                                    field: field.clone(),
                                })?;
                        let field_ty = def.field_type(field).expect("offset found").clone();
                        let value_ty = self.compile_expr(value)?;
                        if !field_ty.assignable_from(&value_ty) {
                            return Err(CompileError::AssignTypeMismatch {
                                target: field.clone(),
                                expected: field_ty.to_string(),
                                got: value_ty.to_string(),
                            });
                        }
                        self.emit(Op::SetFieldOffset, &[offset as u16]);
                        Ok(())
                    }
                    Type::Any => {
                        let name_const = self.consts.add_str(self.world, field)?;
                        self.compile_expr(value)?;
                        self.emit(Op::SetField, &[name_const]);
                        Ok(())
                    }
                    other => Err(CompileError::NotAStruct {
                        ty: other.to_string(),
                    }),
                }
            }
        }
    }

    /// Peephole (iv): `i = i ± integer-literal` on a known slot.
    fn try_inc_dec(&mut self, symbol: &Symbol, name: &EcoString, value: &Expr) -> bool {
        if symbol.ty != Type::Int {
            return false;
        }
        let Expr::Infix { op, left, right } = value else {
            return false;
        };
        let step = match (op, right.as_ref()) {
            (InfixOp::Add | InfixOp::Sub, Expr::Int(k)) if (0..=65535).contains(k) => *k as u16,
            _ => return false,
        };
        if !matches!(left.as_ref(), Expr::Ident(n) if n == name) {
            return false;
        }
        let fused = match (op, symbol.scope) {
            (InfixOp::Add, ScopeKind::Local) => Op::IncLocal,
            (InfixOp::Sub, ScopeKind::Local) => Op::DecLocal,
            (InfixOp::Add, ScopeKind::Global) => Op::IncGlobal,
            (InfixOp::Sub, ScopeKind::Global) => Op::DecGlobal,
            _ => return false,
        };
        self.emit(fused, &[symbol.index, step]);
        true
    }

    fn compile_if(&mut self, if_stmt: &IfStmt) -> Result<(), CompileError> {
        let cond_ty = self.compile_expr(&if_stmt.cond)?;
        self.check_condition(&cond_ty)?;
        let jump_else = self.ctx().builder.emit_jump(Op::JumpIfFalse);
        self.compile_block(&if_stmt.then)?;
        match &if_stmt.else_ {
            Some(arm) => {
                let jump_end = self.ctx().builder.emit_jump(Op::Jump);
                let else_pos = self.pos();
                self.ctx().builder.patch_jump(jump_else, else_pos)?;
                match arm {
                    ElseArm::Block(block) => self.compile_block(block)?,
                    ElseArm::If(nested) => self.compile_if(nested)?,
                }
                let end = self.pos();
                self.ctx().builder.patch_jump(jump_end, end)?;
            }
            None => {
                let end = self.pos();
                self.ctx().builder.patch_jump(jump_else, end)?;
            }
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        post: Option<&Stmt>,
        body: &Block,
    ) -> Result<(), CompileError> {
        let cond = cond.ok_or(CompileError::ForRequiresCondition)?;
        self.symbols.push_block();
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }

        let cond_pos = self.pos();
        let cond_ty = self.compile_expr(cond)?;
        self.check_condition(&cond_ty)?;
        let jump_exit = self.ctx().builder.emit_jump(Op::JumpIfFalse);

        self.ctx().loops.push(LoopCtx::default());
        self.compile_block(body)?;

        let post_pos = self.pos();
        if let Some(post) = post {
            self.compile_stmt(post)?;
        }
        self.ctx().builder.emit_jump_to(Op::Jump, cond_pos)?;

        let end = self.pos();
        self.ctx().builder.patch_jump(jump_exit, end)?;
        let loop_ctx = self.ctx().loops.pop().expect("loop context");
        for jump in loop_ctx.breaks {
            self.ctx().builder.patch_jump(jump, end)?;
        }
        for jump in loop_ctx.continues {
            self.ctx().builder.patch_jump(jump, post_pos)?;
        }
        self.symbols.pop_block();
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        let ret = self.ctx().ret.clone();
        let value_ty = match value {
            Some(expr) => self.compile_expr(expr)?,
            None => {
                self.push_nil()?;
                Type::Nil
            }
        };
        if !ret.assignable_from(&value_ty) {
            let name = self.ctx().name.clone();
            return Err(CompileError::ReturnTypeMismatch {
                name,
                expected: ret.to_string(),
                got: value_ty.to_string(),
            });
        }
        self.emit(Op::Return, &[]);
        Ok(())
    }

    fn compile_type_decl(&mut self, decl: &TypeDecl) -> Result<(), CompileError> {
        match decl {
            // Struct shape was collected in the pre-pass; nothing to run.
            TypeDecl::Struct { .. } => Ok(()),
            // Enum lowering: variant values become globals in source order.
            // Variant symbols exist only for top-level declarations, which is
            // the only place the pre-pass (and the AST contract) puts them.
            TypeDecl::Enum { name, variants } => {
                for (value, variant) in variants.iter().enumerate() {
                    let symbol = self
                        .symbols
                        .resolve(variant)
                        .ok_or_else(|| CompileError::UnknownType { name: name.clone() })?;
                    let constant = self.consts.add_int(value as i64)?;
                    self.emit(Op::Constant, &[constant]);
                    self.emit(Op::SetGlobal, &[symbol.index]);
                }
                Ok(())
            }
        }
    }

    fn compile_switch(
        &mut self,
        subject: &Expr,
        cases: &[SwitchCase],
        default: Option<&Block>,
    ) -> Result<(), CompileError> {
        let subject_ty = self.compile_expr(subject)?;

        // Test chain: duplicate the subject, compare, jump to the body.
        let mut case_jumps = Vec::with_capacity(cases.len());
        let mut infos = Vec::with_capacity(cases.len());
        for case in cases {
            self.emit(Op::Dup, &[]);
            let variant = self.variant_identity(&case.value);
            let case_ty = self.compile_expr(&case.value)?;
            binary_result(InfixOp::Eq, &subject_ty, &case_ty)?;
            let eq = specialized_op(InfixOp::Eq, spec_pair(&subject_ty, &case_ty))
                .unwrap_or(Op::Eq);
            self.emit(eq, &[]);
            case_jumps.push(self.ctx().builder.emit_jump(Op::JumpIfTrue));
            infos.push(CaseInfo {
                ty: case_ty,
                variant,
            });
        }
        check_switch(&subject_ty, &infos, default.is_some(), &self.decls.enums)?;

        // No case matched: fall through to the default arm.
        let jump_default = self.ctx().builder.emit_jump(Op::Jump);

        let mut end_jumps = Vec::with_capacity(cases.len() + 1);
        for jump in case_jumps {
            let body_pos = self.pos();
            self.ctx().builder.patch_jump(jump, body_pos)?;
            self.emit(Op::Pop, &[]); // the subject
            let case = &cases[end_jumps.len()];
            self.compile_block(&case.body)?;
            end_jumps.push(self.ctx().builder.emit_jump(Op::Jump));
        }

        let default_pos = self.pos();
        self.ctx().builder.patch_jump(jump_default, default_pos)?;
        self.emit(Op::Pop, &[]);
        if let Some(block) = default {
            self.compile_block(block)?;
        }

        let end = self.pos();
        for jump in end_jumps {
            self.ctx().builder.patch_jump(jump, end)?;
        }
        Ok(())
    }

    /// Identify a case value that is a direct enum-variant reference.
    fn variant_identity(&mut self, value: &Expr) -> Option<(EcoString, EcoString)> {
        let Expr::Ident(name) = value else {
            return None;
        };
        let symbol = self.symbols.resolve(name)?;
        let Type::Enum(enum_name) = symbol.ty else {
            return None;
        };
        self.decls
            .enums
            .variant_value(&enum_name, name)
            .map(|_| (enum_name, name.clone()))
    }

    // === Expressions ====================================================

    /// Compile one expression, leaving its value on the stack, and return
    /// its precise type.
    fn compile_expr(&mut self, expr: &Expr) -> Result<Type, CompileError> {
        match expr {
            Expr::Int(n) => {
                let constant = self.consts.add_int(*n)?;
                self.emit(Op::Constant, &[constant]);
                Ok(Type::Int)
            }
            Expr::Float(x) => {
                let constant = self.consts.add_float(*x)?;
                self.emit(Op::Constant, &[constant]);
                Ok(Type::Float)
            }
            Expr::Bool(b) => {
                let constant = self.consts.add_bool(*b)?;
                self.emit(Op::Constant, &[constant]);
                Ok(Type::Bool)
            }
            Expr::Str(s) => {
                let constant = self.consts.add_str(self.world, s)?;
                self.emit(Op::Constant, &[constant]);
                Ok(Type::Str)
            }
            Expr::Nil => {
                self.push_nil()?;
                Ok(Type::Nil)
            }
            Expr::Ident(name) => self.compile_ident(name),
            Expr::Prefix { op, expr } => self.compile_prefix(*op, expr),
            Expr::Infix { op, left, right } => self.compile_infix(*op, left, right),
            Expr::Call { callee, args } => self.compile_call(callee, args),
            Expr::Index { object, index } => self.compile_index(object, index),
            Expr::Field { object, field } => self.compile_field(object, field),
            Expr::Array { elem_ty, elements } => self.compile_array(elem_ty.as_ref(), elements),
            Expr::Map {
                key_ty,
                value_ty,
                entries,
            } => self.compile_map(key_ty, value_ty, entries),
            Expr::Struct { name, fields } => self.compile_struct(name, fields),
            Expr::Func(lit) => self.compile_func_lit(lit, "<anonymous>".into()),
        }
    }

    fn compile_ident(&mut self, name: &EcoString) -> Result<Type, CompileError> {
        match self.symbols.resolve(name) {
            Some(symbol) => {
                match symbol.scope {
                    ScopeKind::Global => self.emit(Op::GetGlobal, &[symbol.index]),
                    ScopeKind::Local => self.emit(Op::GetLocal, &[symbol.index]),
                    ScopeKind::Free => self.emit(Op::GetFree, &[symbol.index]),
                    ScopeKind::Builtin => self.emit(Op::GetBuiltin, &[symbol.index]),
                };
                Ok(symbol.ty)
            }
            None => match builtins::standard_index(name) {
                Some(index) => {
                    self.emit(Op::GetBuiltin, &[index as u16]);
                    Ok(Type::Any)
                }
                None => Err(CompileError::UndefinedVariable { name: name.clone() }),
            },
        }
    }

    fn compile_prefix(&mut self, op: PrefixOp, operand: &Expr) -> Result<Type, CompileError> {
        let ty = self.compile_expr(operand)?;
        match op {
            PrefixOp::Neg => {
                if !matches!(ty, Type::Int | Type::Float | Type::Any) {
                    return Err(CompileError::UnknownPrefixOperator {
                        op: "-",
                        ty: ty.to_string(),
                    });
                }
                self.emit(Op::Neg, &[]);
                Ok(ty)
            }
            PrefixOp::Not => {
                if !matches!(ty, Type::Bool | Type::Any) {
                    return Err(CompileError::UnknownPrefixOperator {
                        op: "!",
                        ty: ty.to_string(),
                    });
                }
                self.emit(Op::Not, &[]);
                Ok(Type::Bool)
            }
        }
    }

    fn compile_infix(
        &mut self,
        op: InfixOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Type, CompileError> {
        // Peephole (iii): `x * x` by syntactic identity.
        if is_square(op, left, right) {
            let left_ty = self.compile_expr(left)?;
            match left_ty.spec_tag() {
                Some(SpecTag::Int) => {
                    self.emit(Op::SquareInt, &[]);
                    return Ok(Type::Int);
                }
                Some(SpecTag::Float) => {
                    self.emit(Op::SquareFloat, &[]);
                    return Ok(Type::Float);
                }
                _ => {
                    // Not numeric: finish as an ordinary multiplication.
                    let right_start = self.pos();
                    let right_ty = self.compile_expr(right)?;
                    let result = binary_result(op, &left_ty, &right_ty)?;
                    self.emit_infix(op, &left_ty, &right_ty, right_start)?;
                    return Ok(result);
                }
            }
        }

        let left_ty = self.compile_expr(left)?;
        let right_start = self.pos();
        let right_ty = self.compile_expr(right)?;
        let result = binary_result(op, &left_ty, &right_ty)?;
        self.emit_infix(op, &left_ty, &right_ty, right_start)?;
        Ok(result)
    }

    /// Select and emit the operator instruction, applying peephole rewrites
    /// (i) and (ii) against the right operand when it was a single
    /// instruction.
    fn emit_infix(
        &mut self,
        op: InfixOp,
        left_ty: &Type,
        right_ty: &Type,
        right_start: usize,
    ) -> Result<(), CompileError> {
        if matches!(op, InfixOp::And | InfixOp::Or) {
            self.emit(if op == InfixOp::And { Op::And } else { Op::Or }, &[]);
            return Ok(());
        }

        let spec = spec_pair(left_ty, right_ty);
        let right_single = self.ctx().builder.last_pos() == Some(right_start);

        if right_single {
            // Peephole (ii): fold a constant right operand into the op.
            if self.last_op() == Some(Op::Constant) {
                if let Some(fused) = const_fused_op(op, spec) {
                    self.ctx().builder.fuse_last(Op::Constant, fused);
                    return Ok(());
                }
            }
            // Peephole (i): fold a local right operand into the op.
            if self.last_op() == Some(Op::GetLocal) {
                if let Some(fused) = local_fused_op(op) {
                    self.ctx().builder.fuse_last(Op::GetLocal, fused);
                    return Ok(());
                }
            }
        }

        let selected = specialized_op(op, spec).unwrap_or_else(|| generic_op(op));
        self.emit(selected, &[]);
        Ok(())
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Type, CompileError> {
        // A name that is neither variable nor function resolves to the
        // builtin table.
        if let Expr::Ident(name) = callee {
            if self.symbols.resolve(name).is_none() {
                if let Some(index) = builtins::standard_index(name) {
                    self.emit(Op::GetBuiltin, &[index as u16]);
                    let mut arg_types = Vec::with_capacity(args.len());
                    for arg in args {
                        arg_types.push(self.compile_expr(arg)?);
                    }
                    let ret = builtin_call_type(name, &arg_types)?;
                    self.emit(Op::Call, &[args.len() as u16]);
                    return Ok(ret);
                }
            }
        }

        let callee_name = match callee {
            Expr::Ident(name) => name.clone(),
            _ => "function".into(),
        };
        let callee_ty = self.compile_expr(callee)?;
        let mut arg_types = Vec::with_capacity(args.len());
        for arg in args {
            arg_types.push(self.compile_expr(arg)?);
        }
        match &callee_ty {
            Type::Func { params, ret } => {
                if params.len() != args.len() {
                    return Err(CompileError::WrongArgumentCount {
                        name: callee_name,
                        expected: params.len(),
                        got: args.len(),
                    });
                }
                for (i, (param, arg)) in params.iter().zip(&arg_types).enumerate() {
                    if !param.assignable_from(arg) {
                        return Err(CompileError::ArgumentTypeMismatch {
                            name: callee_name.clone(),
                            index: i,
                            expected: param.to_string(),
                            got: arg.to_string(),
                        });
                    }
                }
                self.emit(Op::Call, &[args.len() as u16]);
                Ok(ret.as_ref().clone())
            }
            Type::Any => {
                self.emit(Op::Call, &[args.len() as u16]);
                Ok(Type::Any)
            }
            other => Err(CompileError::NotCallable {
                ty: other.to_string(),
            }),
        }
    }

    fn compile_index(&mut self, object: &Expr, index: &Expr) -> Result<Type, CompileError> {
        let object_ty = self.compile_expr(object)?;
        match object_ty {
            Type::Array(elem) => {
                let index_ty = self.compile_expr(index)?;
                if !matches!(index_ty, Type::Int | Type::Any) {
                    return Err(CompileError::UnknownOperator {
                        op: "[]",
                        left: Type::Array(elem).to_string(),
                        right: index_ty.to_string(),
                    });
                }
                self.emit(Op::ArrayGet, &[]);
                Ok(*elem)
            }
            Type::Str => {
                let index_ty = self.compile_expr(index)?;
                if !matches!(index_ty, Type::Int | Type::Any) {
                    return Err(CompileError::UnknownOperator {
                        op: "[]",
                        left: Type::Str.to_string(),
                        right: index_ty.to_string(),
                    });
                }
                self.emit(Op::ArrayGet, &[]);
                Ok(Type::Str)
            }
            Type::Map(key, value) => {
                let key_ty = self.compile_expr(index)?;
                if !key.assignable_from(&key_ty) {
                    return Err(CompileError::MapKeyTypeMismatch {
                        expected: key.to_string(),
                        got: key_ty.to_string(),
                    });
                }
                self.emit(Op::MapGet, &[]);
                Ok(*value)
            }
            Type::Any => {
                self.compile_expr(index)?;
                self.emit(Op::IndexGet, &[]);
                Ok(Type::Any)
            }
            other => Err(CompileError::UnknownOperator {
                op: "[]",
                left: other.to_string(),
                right: String::from("_"),
            }),
        }
    }

    fn compile_field(&mut self, object: &Expr, field: &EcoString) -> Result<Type, CompileError> {
        let object_ty = self.compile_expr(object)?;
        match object_ty {
            Type::Struct(struct_name) => {
                let def = self
                    .decls
                    .structs
                    .get(&struct_name)
                    .expect("struct type resolved earlier");
                let offset = def
                    .offset_of(field)
                    .ok_or_else(|| CompileError::UnknownStructField {
                        ty: struct_name.clone(),
                        field: field.clone(),
                    })?;
                let field_ty = def.field_type(field).expect("offset found").clone();
                self.emit(Op::GetFieldOffset, &[offset as u16]);
                Ok(field_ty)
            }
            Type::Any => {
                let name_const = self.consts.add_str(self.world, field)?;
                self.emit(Op::GetField, &[name_const]);
                Ok(Type::Any)
            }
            other => Err(CompileError::NotAStruct {
                ty: other.to_string(),
            }),
        }
    }

    fn compile_array(
        &mut self,
        elem_ty: Option<&crate::ast::TypeExpr>,
        elements: &[Expr],
    ) -> Result<Type, CompileError> {
        let declared = match elem_ty {
            Some(texpr) => Some(self.decls.resolve_type(texpr)?),
            None => None,
        };
        let mut elem_type = declared;
        for (i, element) in elements.iter().enumerate() {
            let ty = self.compile_expr(element)?;
            match &elem_type {
                Some(expected) => {
                    if !expected.assignable_from(&ty) {
                        return Err(CompileError::ArrayElementTypeMismatch {
                            index: i,
                            expected: expected.to_string(),
                            got: ty.to_string(),
                        });
                    }
                }
                None => elem_type = Some(ty),
            }
        }
        self.emit(Op::Array, &[elements.len() as u16]);
        Ok(Type::array(elem_type.unwrap_or(Type::Any)))
    }

    fn compile_map(
        &mut self,
        key_ty: &crate::ast::TypeExpr,
        value_ty: &crate::ast::TypeExpr,
        entries: &[(Expr, Expr)],
    ) -> Result<Type, CompileError> {
        let key_type = self.decls.resolve_type(key_ty)?;
        let value_type = self.decls.resolve_type(value_ty)?;
        for (key, value) in entries {
            let kt = self.compile_expr(key)?;
            if !key_type.assignable_from(&kt) {
                return Err(CompileError::MapKeyTypeMismatch {
                    expected: key_type.to_string(),
                    got: kt.to_string(),
                });
            }
            let vt = self.compile_expr(value)?;
            if !value_type.assignable_from(&vt) {
                return Err(CompileError::MapValueTypeMismatch {
                    expected: value_type.to_string(),
                    got: vt.to_string(),
                });
            }
        }
        self.emit(Op::Map, &[entries.len() as u16]);
        Ok(Type::map(key_type, value_type))
    }

    fn compile_struct(
        &mut self,
        name: &EcoString,
        fields: &[(EcoString, Expr)],
    ) -> Result<Type, CompileError> {
        let def = self
            .decls
            .structs
            .get(name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownType { name: name.clone() })?;
        for (field, _) in fields {
            if def.offset_of(field).is_none() {
                return Err(CompileError::UnknownStructField {
                    ty: name.clone(),
                    field: field.clone(),
                });
            }
        }
        // Fields are evaluated and pushed in the type's declared order.
        for (field, field_ty) in &def.fields {
            let expr = fields
                .iter()
                .find(|(n, _)| n == field)
                .map(|(_, e)| e)
                .ok_or_else(|| CompileError::MissingStructField {
                    ty: name.clone(),
                    field: field.clone(),
                })?;
            let ty = self.compile_expr(expr)?;
            if !field_ty.assignable_from(&ty) {
                return Err(CompileError::AssignTypeMismatch {
                    target: field.clone(),
                    expected: field_ty.to_string(),
                    got: ty.to_string(),
                });
            }
        }
        let name_const = self.consts.add_str(self.world, name)?;
        self.emit(Op::Struct, &[name_const, def.fields.len() as u16]);
        Ok(Type::Struct(name.clone()))
    }

    fn func_lit_type(&self, lit: &FuncLit) -> Result<Type, CompileError> {
        let params = lit
            .params
            .iter()
            .map(|p| self.decls.resolve_type(&p.ty))
            .collect::<Result<Vec<_>, _>>()?;
        let ret = match &lit.return_ty {
            Some(texpr) => self.decls.resolve_type(texpr)?,
            None => Type::Nil,
        };
        Ok(Type::func(params, ret))
    }

    /// Compile a function literal; leaves a function or closure value on the
    /// stack.
    fn compile_func_lit(&mut self, lit: &FuncLit, name: EcoString) -> Result<Type, CompileError> {
        let param_types = lit
            .params
            .iter()
            .map(|p| self.decls.resolve_type(&p.ty))
            .collect::<Result<Vec<_>, _>>()?;
        let ret = match &lit.return_ty {
            Some(texpr) => self.decls.resolve_type(texpr)?,
            None => Type::Nil,
        };

        self.symbols = SymbolTable::enclosed(mem::take(&mut self.symbols));
        self.fn_stack.push(FnCtx {
            builder: CodeBuilder::new(),
            loops: Vec::new(),
            name: name.clone(),
            ret: ret.clone(),
        });
        for (param, ty) in lit.params.iter().zip(&param_types) {
            self.define(param.name.clone(), ty.clone(), true)?;
        }
        for stmt in &lit.body.statements {
            self.compile_stmt(stmt)?;
        }

        if ret != Type::Nil && !block_terminates(&lit.body) {
            return Err(CompileError::MissingReturn { name });
        }
        if self.last_op() != Some(Op::Return) {
            self.push_nil()?;
            self.emit(Op::Return, &[]);
        }

        let ctx = self.fn_stack.pop().expect("function context");
        let table = mem::take(&mut self.symbols);
        let num_locals = table.num_definitions;
        let free_symbols = table.free_symbols.clone();
        self.symbols = table.into_outer().expect("enclosed table");

        let function_index = self.functions.len();
        self.functions.push(Function {
            name,
            num_params: lit.params.len() as u16,
            num_locals,
            code: FuncCode::Stack(ctx.builder.into_code()),
        });
        let constant = self.consts.add_function(function_index)?;

        if free_symbols.is_empty() {
            // No captures: the raw function value is interchangeable with a
            // closure over it.
            self.emit(Op::Constant, &[constant]);
        } else {
            for symbol in &free_symbols {
                match symbol.scope {
                    ScopeKind::Local => self.emit(Op::GetLocal, &[symbol.index]),
                    ScopeKind::Free => self.emit(Op::GetFree, &[symbol.index]),
                    _ => unreachable!("only non-global locals are captured"),
                };
            }
            self.emit(Op::Closure, &[constant, free_symbols.len() as u16]);
        }
        Ok(Type::func(param_types, ret))
    }
}

// ============================================================================
// Opcode selection tables
// ============================================================================

/// The common specialization tag of two operand types, if they agree.
fn spec_pair(left: &Type, right: &Type) -> Option<SpecTag> {
    match (left.spec_tag(), right.spec_tag()) {
        (Some(a), Some(b)) if a == b => Some(a),
        _ => None,
    }
}

fn generic_op(op: InfixOp) -> Op {
    match op {
        InfixOp::Add => Op::Add,
        InfixOp::Sub => Op::Sub,
        InfixOp::Mul => Op::Mul,
        InfixOp::Div => Op::Div,
        InfixOp::Mod => Op::Mod,
        InfixOp::Eq => Op::Eq,
        InfixOp::Ne => Op::Ne,
        InfixOp::Lt => Op::Lt,
        InfixOp::Gt => Op::Gt,
        InfixOp::Le => Op::Le,
        InfixOp::Ge => Op::Ge,
        InfixOp::And => Op::And,
        InfixOp::Or => Op::Or,
    }
}

/// The type-specialized opcode for proven operand tags, or `None` when only
/// the generic form applies.
fn specialized_op(op: InfixOp, spec: Option<SpecTag>) -> Option<Op> {
    let spec = spec?;
    match (op, spec) {
        (InfixOp::Add, SpecTag::Int) => Some(Op::AddInt),
        (InfixOp::Add, SpecTag::Float) => Some(Op::AddFloat),
        (InfixOp::Add, SpecTag::Str) => Some(Op::AddString),
        (InfixOp::Sub, SpecTag::Int) => Some(Op::SubInt),
        (InfixOp::Sub, SpecTag::Float) => Some(Op::SubFloat),
        (InfixOp::Mul, SpecTag::Int) => Some(Op::MulInt),
        (InfixOp::Mul, SpecTag::Float) => Some(Op::MulFloat),
        (InfixOp::Div, SpecTag::Int) => Some(Op::DivInt),
        (InfixOp::Div, SpecTag::Float) => Some(Op::DivFloat),
        (InfixOp::Mod, SpecTag::Int) => Some(Op::ModInt),
        (InfixOp::Eq, SpecTag::Int) => Some(Op::EqInt),
        (InfixOp::Eq, SpecTag::Float) => Some(Op::EqFloat),
        (InfixOp::Eq, SpecTag::Str) => Some(Op::EqString),
        (InfixOp::Eq, SpecTag::Bool) => Some(Op::EqBool),
        (InfixOp::Ne, SpecTag::Int) => Some(Op::NeInt),
        (InfixOp::Ne, SpecTag::Float) => Some(Op::NeFloat),
        (InfixOp::Ne, SpecTag::Str) => Some(Op::NeString),
        (InfixOp::Ne, SpecTag::Bool) => Some(Op::NeBool),
        (InfixOp::Lt, SpecTag::Int) => Some(Op::LtInt),
        (InfixOp::Lt, SpecTag::Float) => Some(Op::LtFloat),
        (InfixOp::Gt, SpecTag::Int) => Some(Op::GtInt),
        (InfixOp::Gt, SpecTag::Float) => Some(Op::GtFloat),
        (InfixOp::Le, SpecTag::Int) => Some(Op::LeInt),
        (InfixOp::Le, SpecTag::Float) => Some(Op::LeFloat),
        (InfixOp::Ge, SpecTag::Int) => Some(Op::GeInt),
        (InfixOp::Ge, SpecTag::Float) => Some(Op::GeFloat),
        _ => None,
    }
}

/// Peephole (ii) target: the `<Op>Const<Int|Float>` form.
fn const_fused_op(op: InfixOp, spec: Option<SpecTag>) -> Option<Op> {
    match (op, spec?) {
        (InfixOp::Add, SpecTag::Int) => Some(Op::AddConstInt),
        (InfixOp::Add, SpecTag::Float) => Some(Op::AddConstFloat),
        (InfixOp::Sub, SpecTag::Int) => Some(Op::SubConstInt),
        (InfixOp::Sub, SpecTag::Float) => Some(Op::SubConstFloat),
        (InfixOp::Mul, SpecTag::Int) => Some(Op::MulConstInt),
        (InfixOp::Mul, SpecTag::Float) => Some(Op::MulConstFloat),
        (InfixOp::Div, SpecTag::Int) => Some(Op::DivConstInt),
        (InfixOp::Div, SpecTag::Float) => Some(Op::DivConstFloat),
        (InfixOp::Mod, SpecTag::Int) => Some(Op::ModConstInt),
        (InfixOp::Eq, SpecTag::Int) => Some(Op::EqConstInt),
        (InfixOp::Eq, SpecTag::Float) => Some(Op::EqConstFloat),
        (InfixOp::Ne, SpecTag::Int) => Some(Op::NeConstInt),
        (InfixOp::Ne, SpecTag::Float) => Some(Op::NeConstFloat),
        (InfixOp::Lt, SpecTag::Int) => Some(Op::LtConstInt),
        (InfixOp::Lt, SpecTag::Float) => Some(Op::LtConstFloat),
        (InfixOp::Gt, SpecTag::Int) => Some(Op::GtConstInt),
        (InfixOp::Gt, SpecTag::Float) => Some(Op::GtConstFloat),
        (InfixOp::Le, SpecTag::Int) => Some(Op::LeConstInt),
        (InfixOp::Le, SpecTag::Float) => Some(Op::LeConstFloat),
        (InfixOp::Ge, SpecTag::Int) => Some(Op::GeConstInt),
        (InfixOp::Ge, SpecTag::Float) => Some(Op::GeConstFloat),
        _ => None,
    }
}

/// Peephole (i) target: the `<Op>Local` form, arithmetic only.
fn local_fused_op(op: InfixOp) -> Option<Op> {
    match op {
        InfixOp::Add => Some(Op::AddLocal),
        InfixOp::Sub => Some(Op::SubLocal),
        InfixOp::Mul => Some(Op::MulLocal),
        InfixOp::Div => Some(Op::DivLocal),
        _ => None,
    }
}
