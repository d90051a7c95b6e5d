//! The register-bytecode backend.
//!
//! The same bottom-up walk as the stack backend, rewritten so expression
//! compilation returns the register index holding the result. Named
//! variables get permanent registers per scope; everything else flows
//! through LIFO temporaries. Call arguments are materialized into
//! consecutive registers because the callee's window starts at the argument
//! base.
//!
//! Free-variable capture has no instruction here, so functions that close
//! over enclosing non-global locals are rejected at compile time.

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
use crate::vm::rop::{pack_builtin, RInstr, ROp};
use crate::vm::MAX_REGISTERS;
use crate::{String, ToString, Vec};

use super::consts::ConstPool;
use super::error::CompileError;
use super::registers::RegAlloc;
use super::symbols::{ScopeKind, SymbolTable};
use super::typing::{
    binary_result, block_terminates, builtin_call_type, check_switch, is_square, CaseInfo,
    Declarations,
};

#[derive(Default)]
struct LoopCtx {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

struct FnCtx {
    code: Vec<RInstr>,
    alloc: RegAlloc,
    loops: Vec<LoopCtx>,
    name: EcoString,
    ret: Type,
}

pub struct RegisterCompiler<'w> {
    world: &'w mut World,
    decls: Declarations,
    consts: ConstPool,
    functions: Vec<Function>,
    symbols: SymbolTable,
    fn_stack: Vec<FnCtx>,
}

/// Compile a program to register bytecode.
pub fn compile_register(program: &Program, world: &mut World) -> Result<Bytecode, CompileError> {
    let decls = Declarations::collect(program)?;
    let mut compiler = RegisterCompiler {
        world,
        decls,
        consts: ConstPool::new(),
        functions: Vec::new(),
        symbols: SymbolTable::global(),
        fn_stack: crate::vec![FnCtx {
            code: Vec::new(),
            alloc: RegAlloc::new(),
            loops: Vec::new(),
            name: "main".into(),
            ret: Type::Any,
        }],
    };
    // Functions and enum variants are the globals; `var` statements, even at
    // the top level, live in the entry frame's register window.
    compiler.predefine_globals(program)?;
    compiler.symbols = SymbolTable::enclosed(mem::take(&mut compiler.symbols));

    for stmt in &program.statements {
        compiler.compile_stmt(stmt)?;
    }
    if !matches!(
        compiler.last_rop(),
        Some(ROp::Return) | Some(ROp::ReturnNil)
    ) {
        compiler.emit(RInstr::abc(ROp::ReturnNil, 0, 0, 0));
    }

    let main_ctx = compiler.fn_stack.pop().expect("main context");
    let main_table = mem::take(&mut compiler.symbols);
    let root = main_table.into_outer().expect("root table");
    let num_globals = root.num_definitions as usize;

    let main = compiler.functions.len();
    compiler.functions.push(Function {
        name: main_ctx.name,
        num_params: 0,
        num_locals: main_ctx.alloc.high_water(),
        code: FuncCode::Register(main_ctx.code),
    });
    tracing::debug!(
        functions = compiler.functions.len(),
        constants = compiler.consts.values().len(),
        globals = num_globals,
        "register compilation complete"
    );
    let structs = compiler
        .decls
        .struct_order
        .iter()
        .map(|name| compiler.decls.structs[name].clone())
        .collect();
    Ok(Bytecode {
        target: Backend::Register,
        constants: compiler.consts.into_values(),
        functions: compiler.functions,
        main,
        num_globals,
        enums: compiler.decls.enums,
        structs,
    })
}

impl<'w> RegisterCompiler<'w> {
    fn predefine_globals(&mut self, program: &Program) -> Result<(), CompileError> {
        for stmt in &program.statements {
            match stmt {
                Stmt::Func(decl) => {
                    let sig = self.decls.sigs[&decl.name].clone();
                    self.define_global(decl.name.clone(), sig.as_type(), false)?;
                }
                Stmt::Type(TypeDecl::Enum { name, variants }) => {
                    for variant in variants {
                        self.define_global(variant.clone(), Type::Enum(name.clone()), false)?;
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

    fn emit(&mut self, instr: RInstr) -> usize {
        let ctx = self.ctx();
        ctx.code.push(instr);
        ctx.code.len() - 1
    }

    fn pos(&mut self) -> usize {
        self.ctx().code.len()
    }

    fn last_rop(&mut self) -> Option<ROp> {
        self.ctx().code.last().and_then(|i| i.op().ok())
    }

    fn emit_jump(&mut self, op: ROp, a: u8) -> usize {
        self.emit(RInstr::abx(op, a, 0xFFFF))
    }

    fn patch_jump(&mut self, jump_pos: usize, target: usize) -> Result<(), CompileError> {
        let target: u16 = target.try_into().map_err(|_| CompileError::JumpTooFar)?;
        let ctx = self.ctx();
        let old = ctx.code[jump_pos];
        ctx.code[jump_pos] = RInstr::abx(old.op().expect("patched a jump"), old.a(), target);
        Ok(())
    }

    fn emit_jump_to(&mut self, op: ROp, a: u8, target: usize) -> Result<(), CompileError> {
        let target: u16 = target.try_into().map_err(|_| CompileError::JumpTooFar)?;
        self.emit(RInstr::abx(op, a, target));
        Ok(())
    }

    fn define_global(
        &mut self,
        name: EcoString,
        ty: Type,
        mutable: bool,
    ) -> Result<u16, CompileError> {
        if self.symbols.num_definitions == u16::MAX {
            return Err(CompileError::TooManyLocals);
        }
        self.symbols
            .define(name.clone(), ty, mutable)
            .map(|s| s.index)
            .ok_or(CompileError::DuplicateDefinition { name })
    }

    fn alloc_temp(&mut self) -> Result<u8, CompileError> {
        self.ctx().alloc.alloc_temp()
    }

    fn free(&mut self, reg: u8) {
        self.ctx().alloc.free(reg);
    }

    fn load_const(&mut self, constant: u16) -> Result<u8, CompileError> {
        let reg = self.alloc_temp()?;
        self.emit(RInstr::abx(ROp::LoadK, reg, constant));
        Ok(reg)
    }

    fn load_nil(&mut self) -> Result<u8, CompileError> {
        let constant = self.consts.add_nil()?;
        self.load_const(constant)
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), CompileError> {
        self.symbols.push_block();
        for stmt in &block.statements {
            self.compile_stmt(stmt)?;
        }
        self.symbols.pop_block();
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
                let (reg, _) = self.compile_expr(expr)?;
                self.free(reg);
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
                let jump = self.emit_jump(ROp::Jump, 0);
                self.ctx()
                    .loops
                    .last_mut()
                    .ok_or(CompileError::BreakOutsideLoop)?
                    .breaks
                    .push(jump);
                Ok(())
            }
            Stmt::Continue => {
                let jump = self.emit_jump(ROp::Jump, 0);
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
                    let symbol = self.symbols.resolve(&decl.name).expect("predefined");
                    let (reg, _) = self.compile_func_lit(&decl.func, decl.name.clone())?;
                    self.emit(RInstr::abx(ROp::StoreGlobal, reg, symbol.index));
                    self.free(reg);
                } else {
                    let (reg, ty) = self.compile_func_lit(&decl.func, decl.name.clone())?;
                    let named = self.ctx().alloc.alloc_named()?;
                    if self.symbols.num_definitions == u16::MAX {
                        return Err(CompileError::TooManyLocals);
                    }
                    self.symbols
                        .define_at(decl.name.clone(), named as u16, ty, false)
                        .ok_or(CompileError::DuplicateDefinition {
                            name: decl.name.clone(),
                        })?;
                    self.emit(RInstr::abc(ROp::Move, named, reg, 0));
                    self.free(reg);
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
        let (reg, init_ty) = match init {
            Some(expr) => {
                let (reg, ty) = self.compile_expr(expr)?;
                (reg, Some(ty))
            }
            None => (self.load_nil()?, None),
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

        if self.symbols.is_global() {
            let slot = self.define_global(name.clone(), var_ty, mutable)?;
            self.emit(RInstr::abx(ROp::StoreGlobal, reg, slot));
            self.free(reg);
        } else {
            let named = self.ctx().alloc.alloc_named()?;
            self.symbols
                .define_at(name.clone(), named as u16, var_ty, mutable)
                .ok_or(CompileError::DuplicateDefinition { name: name.clone() })?;
            self.emit(RInstr::abc(ROp::Move, named, reg, 0));
            self.free(reg);
        }
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
                let (reg, value_ty) = self.compile_expr(value)?;
                if !symbol.ty.assignable_from(&value_ty) {
                    return Err(CompileError::AssignTypeMismatch {
                        target: name.clone(),
                        expected: symbol.ty.to_string(),
                        got: value_ty.to_string(),
                    });
                }
                match symbol.scope {
                    ScopeKind::Global => {
                        self.emit(RInstr::abx(ROp::StoreGlobal, reg, symbol.index));
                        self.free(reg);
                    }
                    ScopeKind::Local => {
                        let dest = symbol.index as u8;
                        if dest != reg {
                            self.emit(RInstr::abc(ROp::Move, dest, reg, 0));
                            self.free(reg);
                        }
                    }
                    ScopeKind::Free => return Err(CompileError::ClosureUnsupportedByBackend),
                    ScopeKind::Builtin => {
                        return Err(CompileError::UndefinedVariable { name: name.clone() })
                    }
                }
                Ok(())
            }
            AssignTarget::Index { object, index } => {
                let (ro, object_ty) = self.compile_expr(object)?;
                let (elem_ty, key_check): (Type, Option<Type>) = match &object_ty {
                    Type::Array(elem) => (elem.as_ref().clone(), None),
                    Type::Map(key, value) => {
                        (value.as_ref().clone(), Some(key.as_ref().clone()))
                    }
                    Type::Any => (Type::Any, None),
                    other => {
                        return Err(CompileError::UnknownOperator {
                            op: "[]=",
                            left: other.to_string(),
                            right: String::from("_"),
                        })
                    }
                };
                let (ri, index_ty) = self.compile_expr(index)?;
                match (&object_ty, key_check) {
                    (Type::Array(_), _) => {
                        if !matches!(index_ty, Type::Int | Type::Any) {
                            return Err(CompileError::UnknownOperator {
                                op: "[]",
                                left: object_ty.to_string(),
                                right: index_ty.to_string(),
                            });
                        }
                    }
                    (_, Some(key)) => {
                        if !key.assignable_from(&index_ty) {
                            return Err(CompileError::MapKeyTypeMismatch {
                                expected: key.to_string(),
                                got: index_ty.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
                let (rv, value_ty) = self.compile_expr(value)?;
                if !elem_ty.assignable_from(&value_ty) {
                    return Err(match object_ty {
                        Type::Map(..) => CompileError::MapValueTypeMismatch {
                            expected: elem_ty.to_string(),
                            got: value_ty.to_string(),
                        },
                        _ => CompileError::AssignTypeMismatch {
                            target: "array element".into(),
                            expected: elem_ty.to_string(),
                            got: value_ty.to_string(),
                        },
                    });
                }
                self.emit(RInstr::abc(ROp::SetIdx, ro, ri, rv));
                self.free(rv);
                self.free(ri);
                self.free(ro);
                Ok(())
            }
            AssignTarget::Field { object, field } => {
                let (ro, object_ty) = self.compile_expr(object)?;
                let field_ty = match &object_ty {
                    Type::Struct(struct_name) => {
                        let def = self
                            .decls
                            .structs
                            .get(struct_name)
                            .expect("struct type resolved earlier");
                        def.field_type(field)
                            .cloned()
                            .ok_or_else(|| CompileError::UnknownStructField {
                                ty: struct_name.clone(),
                                field: field.clone(),
                            })?
                    }
                    Type::Any => Type::Any,
                    other => {
                        return Err(CompileError::NotAStruct {
                            ty: other.to_string(),
                        })
                    }
                };
                let (rv, value_ty) = self.compile_expr(value)?;
                if !field_ty.assignable_from(&value_ty) {
                    return Err(CompileError::AssignTypeMismatch {
                        target: field.clone(),
                        expected: field_ty.to_string(),
                        got: value_ty.to_string(),
                    });
                }
                let name_const = self.consts.add_str(self.world, field)?;
                // SetField reads the value register from the paired Move.
                self.emit(RInstr::abx(ROp::SetField, ro, name_const));
                self.emit(RInstr::abc(ROp::Move, 0, rv, 0));
                self.free(rv);
                self.free(ro);
                Ok(())
            }
        }
    }

    fn compile_if(&mut self, if_stmt: &IfStmt) -> Result<(), CompileError> {
        let (rc, cond_ty) = self.compile_expr(&if_stmt.cond)?;
        self.check_condition(&cond_ty)?;
        let jump_else = self.emit_jump(ROp::JumpF, rc);
        self.free(rc);
        self.compile_block(&if_stmt.then)?;
        match &if_stmt.else_ {
            Some(arm) => {
                let jump_end = self.emit_jump(ROp::Jump, 0);
                let else_pos = self.pos();
                self.patch_jump(jump_else, else_pos)?;
                match arm {
                    ElseArm::Block(block) => self.compile_block(block)?,
                    ElseArm::If(nested) => self.compile_if(nested)?,
                }
                let end = self.pos();
                self.patch_jump(jump_end, end)?;
            }
            None => {
                let end = self.pos();
                self.patch_jump(jump_else, end)?;
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
        let (rc, cond_ty) = self.compile_expr(cond)?;
        self.check_condition(&cond_ty)?;
        let jump_exit = self.emit_jump(ROp::JumpF, rc);
        self.free(rc);

        self.ctx().loops.push(LoopCtx::default());
        self.compile_block(body)?;

        let post_pos = self.pos();
        if let Some(post) = post {
            self.compile_stmt(post)?;
        }
        self.emit_jump_to(ROp::Jump, 0, cond_pos)?;

        let end = self.pos();
        self.patch_jump(jump_exit, end)?;
        let loop_ctx = self.ctx().loops.pop().expect("loop context");
        for jump in loop_ctx.breaks {
            self.patch_jump(jump, end)?;
        }
        for jump in loop_ctx.continues {
            self.patch_jump(jump, post_pos)?;
        }
        self.symbols.pop_block();
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        let ret = self.ctx().ret.clone();
        match value {
            Some(expr) => {
                let (reg, value_ty) = self.compile_expr(expr)?;
                if !ret.assignable_from(&value_ty) {
                    let name = self.ctx().name.clone();
                    return Err(CompileError::ReturnTypeMismatch {
                        name,
                        expected: ret.to_string(),
                        got: value_ty.to_string(),
                    });
                }
                self.emit(RInstr::abc(ROp::Return, reg, 0, 0));
                self.free(reg);
            }
            None => {
                if !ret.assignable_from(&Type::Nil) {
                    let name = self.ctx().name.clone();
                    return Err(CompileError::ReturnTypeMismatch {
                        name,
                        expected: ret.to_string(),
                        got: Type::Nil.to_string(),
                    });
                }
                self.emit(RInstr::abc(ROp::ReturnNil, 0, 0, 0));
            }
        }
        Ok(())
    }

    fn compile_type_decl(&mut self, decl: &TypeDecl) -> Result<(), CompileError> {
        match decl {
            TypeDecl::Struct { .. } => Ok(()),
            // Variant symbols exist only for top-level declarations, which is
            // the only place the pre-pass (and the AST contract) puts them.
            TypeDecl::Enum { name, variants } => {
                for (value, variant) in variants.iter().enumerate() {
                    let symbol = self
                        .symbols
                        .resolve(variant)
                        .ok_or_else(|| CompileError::UnknownType { name: name.clone() })?;
                    let constant = self.consts.add_int(value as i64)?;
                    let reg = self.load_const(constant)?;
                    self.emit(RInstr::abx(ROp::StoreGlobal, reg, symbol.index));
                    self.free(reg);
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
        let (rs, subject_ty) = self.compile_expr(subject)?;

        let mut case_jumps = Vec::with_capacity(cases.len());
        let mut infos = Vec::with_capacity(cases.len());
        for case in cases {
            let variant = self.variant_identity(&case.value);
            let (rc, case_ty) = self.compile_expr(&case.value)?;
            binary_result(InfixOp::Eq, &subject_ty, &case_ty)?;
            let eq = r_specialized_op(InfixOp::Eq, spec_pair(&subject_ty, &case_ty))
                .unwrap_or(ROp::Eq);
            self.free(rc);
            let rt = self.alloc_temp()?;
            self.emit(RInstr::abc(eq, rt, rs, rc));
            case_jumps.push(self.emit_jump(ROp::JumpT, rt));
            self.free(rt);
            infos.push(CaseInfo {
                ty: case_ty,
                variant,
            });
        }
        check_switch(&subject_ty, &infos, default.is_some(), &self.decls.enums)?;

        let jump_default = self.emit_jump(ROp::Jump, 0);

        let mut end_jumps = Vec::with_capacity(cases.len() + 1);
        for jump in case_jumps {
            let body_pos = self.pos();
            self.patch_jump(jump, body_pos)?;
            let case = &cases[end_jumps.len()];
            self.compile_block(&case.body)?;
            end_jumps.push(self.emit_jump(ROp::Jump, 0));
        }

        let default_pos = self.pos();
        self.patch_jump(jump_default, default_pos)?;
        if let Some(block) = default {
            self.compile_block(block)?;
        }

        let end = self.pos();
        for jump in end_jumps {
            self.patch_jump(jump, end)?;
        }
        self.free(rs);
        Ok(())
    }

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

    /// Compile one expression and return the register holding the result
    /// together with its type.
    fn compile_expr(&mut self, expr: &Expr) -> Result<(u8, Type), CompileError> {
        match expr {
            Expr::Int(n) => {
                let constant = self.consts.add_int(*n)?;
                Ok((self.load_const(constant)?, Type::Int))
            }
            Expr::Float(x) => {
                let constant = self.consts.add_float(*x)?;
                Ok((self.load_const(constant)?, Type::Float))
            }
            Expr::Bool(b) => {
                let constant = self.consts.add_bool(*b)?;
                Ok((self.load_const(constant)?, Type::Bool))
            }
            Expr::Str(s) => {
                let constant = self.consts.add_str(self.world, s)?;
                Ok((self.load_const(constant)?, Type::Str))
            }
            Expr::Nil => Ok((self.load_nil()?, Type::Nil)),
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

    fn compile_ident(&mut self, name: &EcoString) -> Result<(u8, Type), CompileError> {
        match self.symbols.resolve(name) {
            Some(symbol) => match symbol.scope {
                ScopeKind::Global => {
                    let reg = self.alloc_temp()?;
                    self.emit(RInstr::abx(ROp::LoadGlobal, reg, symbol.index));
                    Ok((reg, symbol.ty))
                }
                // A local lives in its register; no copy.
                ScopeKind::Local => Ok((symbol.index as u8, symbol.ty)),
                ScopeKind::Free => Err(CompileError::ClosureUnsupportedByBackend),
                ScopeKind::Builtin => Err(CompileError::NotCallable {
                    ty: String::from("builtin reference"),
                }),
            },
            None => match builtins::standard_index(name) {
                // Builtins are not first-class in the register family; they
                // are only reachable through call syntax.
                Some(_) => Err(CompileError::NotCallable {
                    ty: String::from("builtin reference"),
                }),
                None => Err(CompileError::UndefinedVariable { name: name.clone() }),
            },
        }
    }

    fn compile_prefix(&mut self, op: PrefixOp, operand: &Expr) -> Result<(u8, Type), CompileError> {
        let (rb, ty) = self.compile_expr(operand)?;
        match op {
            PrefixOp::Neg => {
                if !matches!(ty, Type::Int | Type::Float | Type::Any) {
                    return Err(CompileError::UnknownPrefixOperator {
                        op: "-",
                        ty: ty.to_string(),
                    });
                }
                self.free(rb);
                let ra = self.alloc_temp()?;
                self.emit(RInstr::abc(ROp::Neg, ra, rb, 0));
                Ok((ra, ty))
            }
            PrefixOp::Not => {
                if !matches!(ty, Type::Bool | Type::Any) {
                    return Err(CompileError::UnknownPrefixOperator {
                        op: "!",
                        ty: ty.to_string(),
                    });
                }
                self.free(rb);
                let ra = self.alloc_temp()?;
                self.emit(RInstr::abc(ROp::Not, ra, rb, 0));
                Ok((ra, Type::Bool))
            }
        }
    }

    fn compile_infix(
        &mut self,
        op: InfixOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<(u8, Type), CompileError> {
        // `x * x` on the register holding x.
        if is_square(op, left, right) {
            let (rb, left_ty) = self.compile_expr(left)?;
            match left_ty.spec_tag() {
                Some(SpecTag::Int) => {
                    self.free(rb);
                    let ra = self.alloc_temp()?;
                    self.emit(RInstr::abc(ROp::SquareInt, ra, rb, 0));
                    return Ok((ra, Type::Int));
                }
                Some(SpecTag::Float) => {
                    self.free(rb);
                    let ra = self.alloc_temp()?;
                    self.emit(RInstr::abc(ROp::SquareFloat, ra, rb, 0));
                    return Ok((ra, Type::Float));
                }
                _ => {
                    let (rc, right_ty) = self.compile_expr(right)?;
                    return self.finish_infix(op, rb, left_ty, rc, right_ty);
                }
            }
        }

        let (rb, left_ty) = self.compile_expr(left)?;
        let (rc, right_ty) = self.compile_expr(right)?;
        self.finish_infix(op, rb, left_ty, rc, right_ty)
    }

    fn finish_infix(
        &mut self,
        op: InfixOp,
        rb: u8,
        left_ty: Type,
        rc: u8,
        right_ty: Type,
    ) -> Result<(u8, Type), CompileError> {
        let result = binary_result(op, &left_ty, &right_ty)?;
        let selected = match op {
            InfixOp::And => ROp::And,
            InfixOp::Or => ROp::Or,
            _ => r_specialized_op(op, spec_pair(&left_ty, &right_ty))
                .unwrap_or_else(|| r_generic_op(op)),
        };
        self.free(rc);
        self.free(rb);
        let ra = self.alloc_temp()?;
        self.emit(RInstr::abc(selected, ra, rb, rc));
        Ok((ra, result))
    }

    /// Materialize call arguments into consecutive fresh registers and
    /// return the base. The temp pool is emptied for the duration so
    /// allocation is monotonic; the caller restores it.
    fn compile_args_block(
        &mut self,
        name: &EcoString,
        args: &[Expr],
    ) -> Result<(u8, Vec<Type>, Vec<u8>, Vec<u8>), CompileError> {
        let saved = self.ctx().alloc.save_temps();
        let base = self.ctx().alloc.next_fresh();
        // The base names the callee's window even for zero-argument calls,
        // so it must itself be addressable.
        if base as usize + args.len().max(1) > MAX_REGISTERS {
            return Err(CompileError::TooManyRegisters);
        }
        let mut slots = Vec::with_capacity(args.len());
        for _ in args {
            slots.push(self.alloc_temp()?);
        }
        debug_assert!(slots
            .iter()
            .enumerate()
            .all(|(i, &slot)| slot as usize == base as usize + i));

        let mut types = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let (reg, ty) = self.compile_expr(arg)?;
            let designated = slots[i];
            if reg != designated {
                self.emit(RInstr::abc(ROp::Move, designated, reg, 0));
                self.free(reg);
            }
            types.push(ty);
        }
        let _ = name;
        Ok((base as u8, types, slots, saved))
    }

    fn finish_args_block(&mut self, slots: Vec<u8>, saved: Vec<u8>) {
        self.ctx().alloc.restore_temps(saved);
        for slot in slots.into_iter().rev() {
            self.free(slot);
        }
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<(u8, Type), CompileError> {
        // Builtin call through the packed-operand instruction.
        if let Expr::Ident(name) = callee {
            if self.symbols.resolve(name).is_none() {
                if let Some(index) = builtins::standard_index(name) {
                    if index >= 16 || args.len() >= 16 {
                        return Err(CompileError::WrongArgumentCount {
                            name: name.clone(),
                            expected: 15,
                            got: args.len(),
                        });
                    }
                    let (base, types, slots, saved) = self.compile_args_block(name, args)?;
                    let ret = builtin_call_type(name, &types)?;
                    self.finish_args_block(slots, saved);
                    let dest = self.alloc_temp()?;
                    self.emit(RInstr::abc(
                        ROp::Builtin,
                        dest,
                        pack_builtin(index as u8, args.len() as u8),
                        base,
                    ));
                    return Ok((dest, ret));
                }
            }
        }

        let callee_name = match callee {
            Expr::Ident(name) => name.clone(),
            _ => "function".into(),
        };
        let (rf, callee_ty) = self.compile_expr(callee)?;
        let (base, types, slots, saved) = self.compile_args_block(&callee_name, args)?;
        let ret = match &callee_ty {
            Type::Func { params, ret } => {
                if params.len() != args.len() {
                    return Err(CompileError::WrongArgumentCount {
                        name: callee_name,
                        expected: params.len(),
                        got: args.len(),
                    });
                }
                for (i, (param, arg)) in params.iter().zip(&types).enumerate() {
                    if !param.assignable_from(arg) {
                        return Err(CompileError::ArgumentTypeMismatch {
                            name: callee_name.clone(),
                            index: i,
                            expected: param.to_string(),
                            got: arg.to_string(),
                        });
                    }
                }
                ret.as_ref().clone()
            }
            Type::Any => Type::Any,
            other => {
                return Err(CompileError::NotCallable {
                    ty: other.to_string(),
                })
            }
        };
        self.finish_args_block(slots, saved);
        self.free(rf);
        let dest = self.alloc_temp()?;
        self.emit(RInstr::abc(ROp::Call, dest, rf, base));
        Ok((dest, ret))
    }

    fn compile_index(&mut self, object: &Expr, index: &Expr) -> Result<(u8, Type), CompileError> {
        let (rb, object_ty) = self.compile_expr(object)?;
        let (rc, index_ty) = self.compile_expr(index)?;
        let result = match &object_ty {
            Type::Array(elem) => {
                if !matches!(index_ty, Type::Int | Type::Any) {
                    return Err(CompileError::UnknownOperator {
                        op: "[]",
                        left: object_ty.to_string(),
                        right: index_ty.to_string(),
                    });
                }
                elem.as_ref().clone()
            }
            Type::Str => {
                if !matches!(index_ty, Type::Int | Type::Any) {
                    return Err(CompileError::UnknownOperator {
                        op: "[]",
                        left: object_ty.to_string(),
                        right: index_ty.to_string(),
                    });
                }
                Type::Str
            }
            Type::Map(key, value) => {
                if !key.assignable_from(&index_ty) {
                    return Err(CompileError::MapKeyTypeMismatch {
                        expected: key.to_string(),
                        got: index_ty.to_string(),
                    });
                }
                value.as_ref().clone()
            }
            Type::Any => Type::Any,
            other => {
                return Err(CompileError::UnknownOperator {
                    op: "[]",
                    left: other.to_string(),
                    right: String::from("_"),
                })
            }
        };
        self.free(rc);
        self.free(rb);
        let ra = self.alloc_temp()?;
        self.emit(RInstr::abc(ROp::GetIdx, ra, rb, rc));
        Ok((ra, result))
    }

    fn compile_field(&mut self, object: &Expr, field: &EcoString) -> Result<(u8, Type), CompileError> {
        let (ro, object_ty) = self.compile_expr(object)?;
        let field_ty = match &object_ty {
            Type::Struct(struct_name) => {
                let def = self
                    .decls
                    .structs
                    .get(struct_name)
                    .expect("struct type resolved earlier");
                def.field_type(field)
                    .cloned()
                    .ok_or_else(|| CompileError::UnknownStructField {
                        ty: struct_name.clone(),
                        field: field.clone(),
                    })?
            }
            Type::Any => Type::Any,
            other => {
                return Err(CompileError::NotAStruct {
                    ty: other.to_string(),
                })
            }
        };
        let name_const = self.consts.add_str(self.world, field)?;
        // GetField reads the object from A and overwrites it; copy out of a
        // variable's register first.
        let ra = if self.ctx().alloc.is_permanent(ro) {
            let ra = self.alloc_temp()?;
            self.emit(RInstr::abc(ROp::Move, ra, ro, 0));
            ra
        } else {
            ro
        };
        self.emit(RInstr::abx(ROp::GetField, ra, name_const));
        Ok((ra, field_ty))
    }

    fn compile_array(
        &mut self,
        elem_ty: Option<&crate::ast::TypeExpr>,
        elements: &[Expr],
    ) -> Result<(u8, Type), CompileError> {
        let declared = match elem_ty {
            Some(texpr) => Some(self.decls.resolve_type(texpr)?),
            None => None,
        };
        let ra = self.alloc_temp()?;
        self.emit(RInstr::abx(ROp::NewArray, ra, elements.len() as u16));
        let mut elem_type = declared;
        for (i, element) in elements.iter().enumerate() {
            let index_const = self.consts.add_int(i as i64)?;
            let ri = self.load_const(index_const)?;
            let (rv, ty) = self.compile_expr(element)?;
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
            self.emit(RInstr::abc(ROp::SetIdx, ra, ri, rv));
            self.free(rv);
            self.free(ri);
        }
        Ok((ra, Type::array(elem_type.unwrap_or(Type::Any))))
    }

    fn compile_map(
        &mut self,
        key_ty: &crate::ast::TypeExpr,
        value_ty: &crate::ast::TypeExpr,
        entries: &[(Expr, Expr)],
    ) -> Result<(u8, Type), CompileError> {
        let key_type = self.decls.resolve_type(key_ty)?;
        let value_type = self.decls.resolve_type(value_ty)?;
        let ra = self.alloc_temp()?;
        self.emit(RInstr::abc(ROp::NewMap, ra, 0, 0));
        for (key, value) in entries {
            let (rk, kt) = self.compile_expr(key)?;
            if !key_type.assignable_from(&kt) {
                return Err(CompileError::MapKeyTypeMismatch {
                    expected: key_type.to_string(),
                    got: kt.to_string(),
                });
            }
            let (rv, vt) = self.compile_expr(value)?;
            if !value_type.assignable_from(&vt) {
                return Err(CompileError::MapValueTypeMismatch {
                    expected: value_type.to_string(),
                    got: vt.to_string(),
                });
            }
            self.emit(RInstr::abc(ROp::SetIdx, ra, rk, rv));
            self.free(rv);
            self.free(rk);
        }
        Ok((ra, Type::map(key_type, value_type)))
    }

    fn compile_struct(
        &mut self,
        name: &EcoString,
        fields: &[(EcoString, Expr)],
    ) -> Result<(u8, Type), CompileError> {
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
        let name_const = self.consts.add_str(self.world, name)?;
        let ra = self.alloc_temp()?;
        self.emit(RInstr::abx(ROp::NewStruct, ra, name_const));
        for (field, field_ty) in &def.fields {
            let expr = fields
                .iter()
                .find(|(n, _)| n == field)
                .map(|(_, e)| e)
                .ok_or_else(|| CompileError::MissingStructField {
                    ty: name.clone(),
                    field: field.clone(),
                })?;
            let (rv, ty) = self.compile_expr(expr)?;
            if !field_ty.assignable_from(&ty) {
                return Err(CompileError::AssignTypeMismatch {
                    target: field.clone(),
                    expected: field_ty.to_string(),
                    got: ty.to_string(),
                });
            }
            let field_const = self.consts.add_str(self.world, field)?;
            self.emit(RInstr::abx(ROp::SetField, ra, field_const));
            self.emit(RInstr::abc(ROp::Move, 0, rv, 0));
            self.free(rv);
        }
        Ok((ra, Type::Struct(name.clone())))
    }

    fn compile_func_lit(
        &mut self,
        lit: &FuncLit,
        name: EcoString,
    ) -> Result<(u8, Type), CompileError> {
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
            code: Vec::new(),
            alloc: RegAlloc::new(),
            loops: Vec::new(),
            name: name.clone(),
            ret: ret.clone(),
        });
        // Parameters are the window's first registers, shared in place with
        // the caller's argument block.
        for (param, ty) in lit.params.iter().zip(&param_types) {
            let reg = self.ctx().alloc.alloc_named()?;
            self.symbols
                .define_at(param.name.clone(), reg as u16, ty.clone(), true)
                .ok_or(CompileError::DuplicateDefinition {
                    name: param.name.clone(),
                })?;
        }
        for stmt in &lit.body.statements {
            self.compile_stmt(stmt)?;
        }

        if ret != Type::Nil && !block_terminates(&lit.body) {
            return Err(CompileError::MissingReturn { name });
        }
        if !matches!(
            self.last_rop(),
            Some(ROp::Return) | Some(ROp::ReturnNil)
        ) {
            self.emit(RInstr::abc(ROp::ReturnNil, 0, 0, 0));
        }

        let ctx = self.fn_stack.pop().expect("function context");
        let table = mem::take(&mut self.symbols);
        if !table.free_symbols.is_empty() {
            return Err(CompileError::ClosureUnsupportedByBackend);
        }
        self.symbols = table.into_outer().expect("enclosed table");

        let function_index = self.functions.len();
        self.functions.push(Function {
            name,
            num_params: lit.params.len() as u16,
            num_locals: ctx.alloc.high_water(),
            code: FuncCode::Register(ctx.code),
        });
        let constant = self.consts.add_function(function_index)?;
        let reg = self.load_const(constant)?;
        Ok((reg, Type::func(param_types, ret)))
    }
}

// ============================================================================
// Opcode selection tables
// ============================================================================

fn spec_pair(left: &Type, right: &Type) -> Option<SpecTag> {
    match (left.spec_tag(), right.spec_tag()) {
        (Some(a), Some(b)) if a == b => Some(a),
        _ => None,
    }
}

fn r_generic_op(op: InfixOp) -> ROp {
    match op {
        InfixOp::Add => ROp::Add,
        InfixOp::Sub => ROp::Sub,
        InfixOp::Mul => ROp::Mul,
        InfixOp::Div => ROp::Div,
        InfixOp::Mod => ROp::Mod,
        InfixOp::Eq => ROp::Eq,
        InfixOp::Ne => ROp::Ne,
        InfixOp::Lt => ROp::Lt,
        InfixOp::Gt => ROp::Gt,
        InfixOp::Le => ROp::Le,
        InfixOp::Ge => ROp::Ge,
        InfixOp::And => ROp::And,
        InfixOp::Or => ROp::Or,
    }
}

fn r_specialized_op(op: InfixOp, spec: Option<SpecTag>) -> Option<ROp> {
    let spec = spec?;
    match (op, spec) {
        (InfixOp::Add, SpecTag::Int) => Some(ROp::AddInt),
        (InfixOp::Add, SpecTag::Float) => Some(ROp::AddFloat),
        (InfixOp::Add, SpecTag::Str) => Some(ROp::AddString),
        (InfixOp::Sub, SpecTag::Int) => Some(ROp::SubInt),
        (InfixOp::Sub, SpecTag::Float) => Some(ROp::SubFloat),
        (InfixOp::Mul, SpecTag::Int) => Some(ROp::MulInt),
        (InfixOp::Mul, SpecTag::Float) => Some(ROp::MulFloat),
        (InfixOp::Div, SpecTag::Int) => Some(ROp::DivInt),
        (InfixOp::Div, SpecTag::Float) => Some(ROp::DivFloat),
        (InfixOp::Mod, SpecTag::Int) => Some(ROp::ModInt),
        (InfixOp::Eq, SpecTag::Int) => Some(ROp::EqInt),
        (InfixOp::Eq, SpecTag::Float) => Some(ROp::EqFloat),
        (InfixOp::Eq, SpecTag::Str) => Some(ROp::EqString),
        (InfixOp::Eq, SpecTag::Bool) => Some(ROp::EqBool),
        (InfixOp::Ne, SpecTag::Int) => Some(ROp::NeInt),
        (InfixOp::Ne, SpecTag::Float) => Some(ROp::NeFloat),
        (InfixOp::Ne, SpecTag::Str) => Some(ROp::NeString),
        (InfixOp::Ne, SpecTag::Bool) => Some(ROp::NeBool),
        (InfixOp::Lt, SpecTag::Int) => Some(ROp::LtInt),
        (InfixOp::Lt, SpecTag::Float) => Some(ROp::LtFloat),
        (InfixOp::Gt, SpecTag::Int) => Some(ROp::GtInt),
        (InfixOp::Gt, SpecTag::Float) => Some(ROp::GtFloat),
        (InfixOp::Le, SpecTag::Int) => Some(ROp::LeInt),
        (InfixOp::Le, SpecTag::Float) => Some(ROp::LeFloat),
        (InfixOp::Ge, SpecTag::Int) => Some(ROp::GeInt),
        (InfixOp::Ge, SpecTag::Float) => Some(ROp::GeFloat),
        _ => None,
    }
}
