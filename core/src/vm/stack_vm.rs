//! The stack-based execution engine.
//!
//! A tight dispatch loop over the opcode byte. The current frame's
//! instruction vector and instruction pointer are cached in locals and only
//! written back at call boundaries. The value stack, frame array, and
//! globals are pre-allocated once; frames are reset in place on reuse.

use core::fmt;

use smallvec::SmallVec;

use crate::bytecode::{Backend, Bytecode};
use crate::values::{StructObj, Tag, Value, World};
use crate::{ToString, Vec};

use super::arith::{self, BinArith, BinOrder};
use super::builtins::{BuiltinCtx, Builtins};
use super::error::RuntimeError;
use super::frame::{Callee, Frame};
use super::op::{read_u16, Op};
use super::{GLOBALS_SIZE, MAX_FRAMES, STACK_SIZE};

pub struct StackVm<'b, 'w, 'out> {
    bytecode: &'b Bytecode,
    world: &'w mut World,
    builtins: Builtins,
    out: &'out mut dyn fmt::Write,
    stack: Vec<Value>,
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
    frame_count: usize,
}

impl<'b, 'w, 'out> StackVm<'b, 'w, 'out> {
    pub fn new(
        bytecode: &'b Bytecode,
        world: &'w mut World,
        out: &'out mut dyn fmt::Write,
    ) -> Self {
        Self::with_builtins(bytecode, world, out, Builtins::standard())
    }

    pub fn with_builtins(
        bytecode: &'b Bytecode,
        world: &'w mut World,
        out: &'out mut dyn fmt::Write,
        builtins: Builtins,
    ) -> Self {
        debug_assert_eq!(bytecode.target, Backend::Stack);
        StackVm {
            bytecode,
            world,
            builtins,
            out,
            stack: crate::vec![Value::NIL; STACK_SIZE],
            sp: 0,
            globals: crate::vec![Value::NIL; GLOBALS_SIZE],
            frames: crate::vec![Frame::UNUSED; MAX_FRAMES],
            frame_count: 0,
        }
    }

    // === Stack primitives ===============================================

    #[inline]
    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.sp >= STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> Value {
        // Underflow is a compiler or VM bug, not a program error.
        assert!(self.sp > 0, "stack underflow");
        self.sp -= 1;
        self.stack[self.sp]
    }

    #[inline]
    fn frame(&self) -> &Frame {
        &self.frames[self.frame_count - 1]
    }

    /// Run the entry function to completion and return its final value.
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        let main = self.bytecode.main;
        tracing::debug!(function = main, "stack vm run");
        self.frames[0].reset(Callee::Function(main), main, 0);
        self.frame_count = 1;
        self.sp = self.bytecode.functions[main].num_locals as usize;

        let mut code: &'b [u8] = self.bytecode.functions[main].code.as_stack();
        let mut ip = 0usize;

        loop {
            assert!(ip < code.len(), "instruction pointer ran off the bytecode");
            let op = match Op::from_byte(code[ip]) {
                Ok(op) => op,
                Err(e) => panic!("corrupt bytecode: {}", e),
            };
            ip += 1;

            use Op::*;
            match op {
                Halt => return Ok(Value::NIL),

                Constant => {
                    let index = read_u16(code, ip) as usize;
                    ip += 2;
                    self.push(self.bytecode.constants[index])?;
                }
                Pop => {
                    self.pop();
                }
                Dup => {
                    let top = self.stack[self.sp - 1];
                    self.push(top)?;
                }

                // === Variables & builtins ===
                GetGlobal => {
                    let slot = read_u16(code, ip) as usize;
                    ip += 2;
                    self.push(self.globals[slot])?;
                }
                SetGlobal => {
                    let slot = read_u16(code, ip) as usize;
                    ip += 2;
                    self.globals[slot] = self.pop();
                }
                GetLocal => {
                    let slot = read_u16(code, ip) as usize;
                    ip += 2;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot])?;
                }
                SetLocal => {
                    let slot = read_u16(code, ip) as usize;
                    ip += 2;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.pop();
                }
                GetFree => {
                    let index = read_u16(code, ip) as usize;
                    ip += 2;
                    match self.frame().callee {
                        Callee::Closure(handle) => {
                            let value = self.world.closures.get(handle)?.captured[index];
                            self.push(value)?;
                        }
                        Callee::Function(_) => return Err(RuntimeError::TypeError),
                    }
                }
                SetFree => {
                    let index = read_u16(code, ip) as usize;
                    ip += 2;
                    let value = self.pop();
                    match self.frame().callee {
                        Callee::Closure(handle) => {
                            // The write lands in the closure record, so it is
                            // visible to every later call of the closure.
                            self.world.closures.get_mut(handle)?.captured[index] = value;
                        }
                        Callee::Function(_) => return Err(RuntimeError::TypeError),
                    }
                }
                GetBuiltin => {
                    let index = read_u16(code, ip) as usize;
                    ip += 2;
                    self.push(Value::builtin(index))?;
                }

                // === Generic arithmetic & comparison ===
                Add | Sub | Mul | Div | Mod => {
                    let b = self.pop();
                    let a = self.pop();
                    let arith = match op {
                        Add => BinArith::Add,
                        Sub => BinArith::Sub,
                        Mul => BinArith::Mul,
                        Div => BinArith::Div,
                        _ => BinArith::Mod,
                    };
                    let result = arith::generic_arith(self.world, arith, a, b)?;
                    self.push(result)?;
                }
                Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = arith::generic_eq(self.world, a, b)?;
                    self.push(Value::bool(eq))?;
                }
                Ne => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = arith::generic_eq(self.world, a, b)?;
                    self.push(Value::bool(!eq))?;
                }
                Lt | Gt | Le | Ge => {
                    let b = self.pop();
                    let a = self.pop();
                    let order = match op {
                        Lt => BinOrder::Lt,
                        Gt => BinOrder::Gt,
                        Le => BinOrder::Le,
                        _ => BinOrder::Ge,
                    };
                    let result = arith::generic_order(order, a, b)?;
                    self.push(Value::bool(result))?;
                }

                // === Logical & unary ===
                And => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.is_truthy() && b.is_truthy()))?;
                }
                Or => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.is_truthy() || b.is_truthy()))?;
                }
                Not => {
                    let a = self.pop();
                    self.push(Value::bool(!a.is_truthy()))?;
                }
                Neg => {
                    let a = self.pop();
                    let result = match a.tag {
                        Tag::Int | Tag::Enum => Value::int(a.as_int().wrapping_neg()),
                        Tag::Float => Value::float(-a.as_float()),
                        _ => return Err(RuntimeError::UnsupportedOperands),
                    };
                    self.push(result)?;
                }

                // === Control flow ===
                Jump => {
                    ip = read_u16(code, ip) as usize;
                }
                JumpIfTrue => {
                    let target = read_u16(code, ip) as usize;
                    ip += 2;
                    if self.pop().is_truthy() {
                        ip = target;
                    }
                }
                JumpIfFalse => {
                    let target = read_u16(code, ip) as usize;
                    ip += 2;
                    if !self.pop().is_truthy() {
                        ip = target;
                    }
                }

                Call => {
                    let argc = read_u16(code, ip) as usize;
                    ip += 2;
                    let callee = self.stack[self.sp - 1 - argc];
                    match callee.tag {
                        Tag::Builtin => self.call_builtin(callee.as_index(), argc)?,
                        Tag::Function => {
                            let function = callee.as_index();
                            self.push_frame(
                                Callee::Function(function),
                                function,
                                argc,
                                &mut code,
                                &mut ip,
                            )?;
                        }
                        Tag::Closure => {
                            let handle = callee.as_handle();
                            let function = self.world.closures.get(handle)?.function;
                            self.push_frame(
                                Callee::Closure(handle),
                                function,
                                argc,
                                &mut code,
                                &mut ip,
                            )?;
                        }
                        _ => return Err(RuntimeError::CallingNonFunction),
                    }
                }
                Return => {
                    let value = self.pop();
                    self.frame_count -= 1;
                    if self.frame_count == 0 {
                        tracing::debug!("stack vm finished");
                        return Ok(value);
                    }
                    let base = self.frames[self.frame_count].base;
                    // Drop arguments plus the callable slot beneath them,
                    // then leave the return value where the callable stood.
                    self.sp = base - 1;
                    self.push(value)?;
                    let caller = self.frames[self.frame_count - 1];
                    code = self.bytecode.functions[caller.function].code.as_stack();
                    ip = caller.ip;
                }
                Closure => {
                    let constant = read_u16(code, ip) as usize;
                    ip += 2;
                    let count = read_u16(code, ip) as usize;
                    ip += 2;
                    let function = self.bytecode.constants[constant].as_index();
                    let mut captured = SmallVec::with_capacity(count);
                    for slot in self.sp - count..self.sp {
                        captured.push(self.stack[slot]);
                    }
                    self.sp -= count;
                    let closure = self.world.new_closure(function, captured);
                    self.push(closure)?;
                }

                // === Construction ===
                Array => {
                    let count = read_u16(code, ip) as usize;
                    ip += 2;
                    let elements = self.stack[self.sp - count..self.sp].to_vec();
                    self.sp -= count;
                    let array = self.world.new_array(elements);
                    self.push(array)?;
                }
                Map => {
                    let pairs = read_u16(code, ip) as usize;
                    ip += 2;
                    let mut map = crate::values::MapObj::new();
                    let start = self.sp - pairs * 2;
                    for i in 0..pairs {
                        let key = self.stack[start + i * 2];
                        let value = self.stack[start + i * 2 + 1];
                        let key = self
                            .world
                            .map_key(key)?
                            .ok_or(RuntimeError::TypeError)?;
                        map.insert(key, value);
                    }
                    self.sp = start;
                    let map = self.world.new_map(map);
                    self.push(map)?;
                }
                Struct => {
                    let name_const = read_u16(code, ip) as usize;
                    ip += 2;
                    let count = read_u16(code, ip) as usize;
                    ip += 2;
                    let name = {
                        let value = self.bytecode.constants[name_const];
                        self.world.str_value(value)?.clone()
                    };
                    let def = self
                        .bytecode
                        .struct_def(&name)
                        .ok_or(RuntimeError::TypeError)?;
                    let field_names: Vec<_> =
                        def.fields.iter().map(|(n, _)| n.clone()).collect();
                    let fields = self.stack[self.sp - count..self.sp].to_vec();
                    self.sp -= count;
                    let obj = StructObj::new(name, field_names, fields);
                    let value = self.world.new_struct(obj);
                    self.push(value)?;
                }
                StructNamed => {
                    let name_const = read_u16(code, ip) as usize;
                    ip += 2;
                    let count = read_u16(code, ip) as usize;
                    ip += 2;
                    let name = {
                        let value = self.bytecode.constants[name_const];
                        self.world.str_value(value)?.clone()
                    };
                    let start = self.sp - count * 2;
                    let mut field_names = Vec::with_capacity(count);
                    let mut fields = Vec::with_capacity(count);
                    for i in 0..count {
                        let field_name = self.stack[start + i * 2];
                        if field_name.tag != Tag::Str {
                            return Err(RuntimeError::TypeError);
                        }
                        field_names.push(self.world.str_value(field_name)?.clone());
                        fields.push(self.stack[start + i * 2 + 1]);
                    }
                    self.sp = start;
                    let obj = StructObj::new(name, field_names, fields);
                    let value = self.world.new_struct(obj);
                    self.push(value)?;
                }

                // === Index & field access ===
                ArrayGet => {
                    let index = self.pop();
                    let container = self.pop();
                    let value = self.index_array_like(container, index)?;
                    self.push(value)?;
                }
                ArraySet => {
                    let value = self.pop();
                    let index = self.pop();
                    let array = self.pop();
                    self.set_array(array, index, value)?;
                }
                MapGet => {
                    let key = self.pop();
                    let map = self.pop();
                    let value = self.get_map(map, key)?;
                    self.push(value)?;
                }
                MapSet => {
                    let value = self.pop();
                    let key = self.pop();
                    let map = self.pop();
                    self.set_map(map, key, value)?;
                }
                IndexGet => {
                    let index = self.pop();
                    let container = self.pop();
                    let value = match container.tag {
                        Tag::Array | Tag::Str => self.index_array_like(container, index)?,
                        Tag::Map => self.get_map(container, index)?,
                        _ => return Err(RuntimeError::TypeError),
                    };
                    self.push(value)?;
                }
                IndexSet => {
                    let value = self.pop();
                    let index = self.pop();
                    let container = self.pop();
                    match container.tag {
                        Tag::Array => self.set_array(container, index, value)?,
                        Tag::Map => self.set_map(container, index, value)?,
                        _ => return Err(RuntimeError::TypeError),
                    }
                }
                GetField => {
                    let name_const = read_u16(code, ip) as usize;
                    ip += 2;
                    let object = self.pop();
                    if object.tag != Tag::Struct {
                        return Err(RuntimeError::TypeError);
                    }
                    let name = {
                        let value = self.bytecode.constants[name_const];
                        self.world.str_value(value)?.clone()
                    };
                    let value = self
                        .world
                        .structs
                        .get(object.as_handle())?
                        .get_by_name(&name)
                        .ok_or(RuntimeError::TypeError)?;
                    self.push(value)?;
                }
                SetField => {
                    let name_const = read_u16(code, ip) as usize;
                    ip += 2;
                    let value = self.pop();
                    let object = self.pop();
                    if object.tag != Tag::Struct {
                        return Err(RuntimeError::TypeError);
                    }
                    let name = {
                        let constant = self.bytecode.constants[name_const];
                        self.world.str_value(constant)?.clone()
                    };
                    let updated = self
                        .world
                        .structs
                        .get_mut(object.as_handle())?
                        .set_by_name(&name, value);
                    if !updated {
                        return Err(RuntimeError::TypeError);
                    }
                }
                GetFieldOffset => {
                    let offset = read_u16(code, ip) as usize;
                    ip += 2;
                    let object = self.pop();
                    if object.tag != Tag::Struct {
                        return Err(RuntimeError::TypeError);
                    }
                    let value = self
                        .world
                        .structs
                        .get(object.as_handle())?
                        .get_by_offset(offset)
                        .ok_or(RuntimeError::TypeError)?;
                    self.push(value)?;
                }
                SetFieldOffset => {
                    let offset = read_u16(code, ip) as usize;
                    ip += 2;
                    let value = self.pop();
                    let object = self.pop();
                    if object.tag != Tag::Struct {
                        return Err(RuntimeError::TypeError);
                    }
                    let updated = self
                        .world
                        .structs
                        .get_mut(object.as_handle())?
                        .set_by_offset(offset, value);
                    if !updated {
                        return Err(RuntimeError::TypeError);
                    }
                }

                // === Specialized arithmetic: tags proven at compile time ===
                AddInt => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::int(a.as_int().wrapping_add(b.as_int())))?;
                }
                AddFloat => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::float(a.as_float() + b.as_float()))?;
                }
                AddString => {
                    let b = self.pop();
                    let a = self.pop();
                    let mut joined = self.world.str_value(a)?.to_string();
                    joined.push_str(self.world.str_value(b)?);
                    let value = self.world.intern_str(&joined);
                    self.push(value)?;
                }
                SubInt => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::int(a.as_int().wrapping_sub(b.as_int())))?;
                }
                SubFloat => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::float(a.as_float() - b.as_float()))?;
                }
                MulInt => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::int(a.as_int().wrapping_mul(b.as_int())))?;
                }
                MulFloat => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::float(a.as_float() * b.as_float()))?;
                }
                DivInt => {
                    let b = self.pop();
                    let a = self.pop();
                    if b.as_int() == 0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    self.push(Value::int(a.as_int().wrapping_div(b.as_int())))?;
                }
                DivFloat => {
                    // IEEE semantics: division by zero produces inf/nan.
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::float(a.as_float() / b.as_float()))?;
                }
                ModInt => {
                    let b = self.pop();
                    let a = self.pop();
                    if b.as_int() == 0 {
                        return Err(RuntimeError::ModuloByZero);
                    }
                    self.push(Value::int(a.as_int().wrapping_rem(b.as_int())))?;
                }

                // === Specialized comparison ===
                EqInt => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() == b.as_int()))?;
                }
                EqFloat => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() == b.as_float()))?;
                }
                EqString => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = self.world.str_value(a)? == self.world.str_value(b)?;
                    self.push(Value::bool(eq))?;
                }
                EqBool => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_bool() == b.as_bool()))?;
                }
                NeInt => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() != b.as_int()))?;
                }
                NeFloat => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() != b.as_float()))?;
                }
                NeString => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = self.world.str_value(a)? == self.world.str_value(b)?;
                    self.push(Value::bool(!eq))?;
                }
                NeBool => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_bool() != b.as_bool()))?;
                }
                LtInt => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() < b.as_int()))?;
                }
                LtFloat => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() < b.as_float()))?;
                }
                GtInt => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() > b.as_int()))?;
                }
                GtFloat => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() > b.as_float()))?;
                }
                LeInt => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() <= b.as_int()))?;
                }
                LeFloat => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() <= b.as_float()))?;
                }
                GeInt => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() >= b.as_int()))?;
                }
                GeFloat => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() >= b.as_float()))?;
                }

                // === Fused: right operand from a local slot ===
                AddLocal | SubLocal | MulLocal | DivLocal => {
                    let slot = read_u16(code, ip) as usize;
                    ip += 2;
                    let base = self.frame().base;
                    let b = self.stack[base + slot];
                    let a = self.pop();
                    let arith = match op {
                        AddLocal => BinArith::Add,
                        SubLocal => BinArith::Sub,
                        MulLocal => BinArith::Mul,
                        _ => BinArith::Div,
                    };
                    let result = arith::generic_arith(self.world, arith, a, b)?;
                    self.push(result)?;
                }

                // === Fused: right operand from the constant pool ===
                AddConstInt => {
                    let k = self.const_int(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::int(a.as_int().wrapping_add(k)))?;
                }
                AddConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::float(a.as_float() + k))?;
                }
                SubConstInt => {
                    let k = self.const_int(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::int(a.as_int().wrapping_sub(k)))?;
                }
                SubConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::float(a.as_float() - k))?;
                }
                MulConstInt => {
                    let k = self.const_int(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::int(a.as_int().wrapping_mul(k)))?;
                }
                MulConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::float(a.as_float() * k))?;
                }
                DivConstInt => {
                    let k = self.const_int(code, &mut ip);
                    if k == 0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    let a = self.pop();
                    self.push(Value::int(a.as_int().wrapping_div(k)))?;
                }
                DivConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::float(a.as_float() / k))?;
                }
                ModConstInt => {
                    let k = self.const_int(code, &mut ip);
                    if k == 0 {
                        return Err(RuntimeError::ModuloByZero);
                    }
                    let a = self.pop();
                    self.push(Value::int(a.as_int().wrapping_rem(k)))?;
                }
                EqConstInt => {
                    let k = self.const_int(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() == k))?;
                }
                EqConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() == k))?;
                }
                NeConstInt => {
                    let k = self.const_int(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() != k))?;
                }
                NeConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() != k))?;
                }
                LtConstInt => {
                    let k = self.const_int(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() < k))?;
                }
                LtConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() < k))?;
                }
                GtConstInt => {
                    let k = self.const_int(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() > k))?;
                }
                GtConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() > k))?;
                }
                LeConstInt => {
                    let k = self.const_int(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() <= k))?;
                }
                LeConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() <= k))?;
                }
                GeConstInt => {
                    let k = self.const_int(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_int() >= k))?;
                }
                GeConstFloat => {
                    let k = self.const_float(code, &mut ip);
                    let a = self.pop();
                    self.push(Value::bool(a.as_float() >= k))?;
                }

                // === Fused: in-place increment/decrement ===
                IncLocal | DecLocal => {
                    let slot = read_u16(code, ip) as usize;
                    ip += 2;
                    let step = read_u16(code, ip) as i64;
                    ip += 2;
                    let base = self.frame().base;
                    let old = self.stack[base + slot].as_int();
                    let new = if op == IncLocal {
                        old.wrapping_add(step)
                    } else {
                        old.wrapping_sub(step)
                    };
                    self.stack[base + slot] = Value::int(new);
                }
                IncGlobal | DecGlobal => {
                    let slot = read_u16(code, ip) as usize;
                    ip += 2;
                    let step = read_u16(code, ip) as i64;
                    ip += 2;
                    let old = self.globals[slot].as_int();
                    let new = if op == IncGlobal {
                        old.wrapping_add(step)
                    } else {
                        old.wrapping_sub(step)
                    };
                    self.globals[slot] = Value::int(new);
                }

                SquareInt => {
                    let a = self.pop();
                    let n = a.as_int();
                    self.push(Value::int(n.wrapping_mul(n)))?;
                }
                SquareFloat => {
                    let a = self.pop();
                    let x = a.as_float();
                    self.push(Value::float(x * x))?;
                }
            }
        }
    }

    // === Call machinery =================================================

    fn call_builtin(&mut self, index: usize, argc: usize) -> Result<(), RuntimeError> {
        let function = self
            .builtins
            .get(index)
            .ok_or(RuntimeError::CallingNonFunction)?;
        let args_start = self.sp - argc;
        let args: SmallVec<[Value; 8]> =
            self.stack[args_start..self.sp].iter().copied().collect();
        let mut ctx = BuiltinCtx {
            world: &mut *self.world,
            enums: &self.bytecode.enums,
            out: &mut *self.out,
        };
        let result = function(&mut ctx, &args)?;
        // Drop arguments plus the builtin reference.
        self.sp = args_start - 1;
        self.push(result)
    }

    fn push_frame(
        &mut self,
        callee: Callee,
        function: usize,
        argc: usize,
        code: &mut &'b [u8],
        ip: &mut usize,
    ) -> Result<(), RuntimeError> {
        if self.frame_count >= MAX_FRAMES {
            return Err(RuntimeError::FrameOverflow);
        }
        let func = &self.bytecode.functions[function];
        if argc != func.num_params as usize {
            // Only reachable through `any`-typed callees.
            return Err(RuntimeError::TypeError);
        }
        let base = self.sp - argc;
        let new_sp = base + func.num_locals as usize;
        if new_sp > STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }
        // Arguments already sit in the first local slots; zero the rest.
        for slot in self.sp..new_sp {
            self.stack[slot] = Value::NIL;
        }
        self.sp = new_sp;

        self.frames[self.frame_count - 1].ip = *ip;
        // Frame slots are lazily initialized and reused; reset is cheap.
        self.frames[self.frame_count].reset(callee, function, base);
        self.frame_count += 1;

        *code = func.code.as_stack();
        *ip = 0;
        Ok(())
    }

    // === Container access ===============================================

    fn index_array_like(&mut self, container: Value, index: Value) -> Result<Value, RuntimeError> {
        if !matches!(index.tag, Tag::Int | Tag::Enum) {
            return Err(RuntimeError::NonIntegerIndex);
        }
        let i = index.as_int();
        match container.tag {
            Tag::Array => {
                let elements = &self.world.arrays.get(container.as_handle())?.elements;
                if i < 0 || i as usize >= elements.len() {
                    return Err(RuntimeError::IndexOutOfRange);
                }
                Ok(elements[i as usize])
            }
            Tag::Str => {
                let ch = {
                    let s = self.world.str_value(container)?;
                    if i < 0 {
                        return Err(RuntimeError::IndexOutOfRange);
                    }
                    s.chars().nth(i as usize)
                };
                match ch {
                    Some(ch) => {
                        let mut buffer = [0u8; 4];
                        Ok(self.world.intern_str(ch.encode_utf8(&mut buffer)))
                    }
                    None => Err(RuntimeError::IndexOutOfRange),
                }
            }
            _ => Err(RuntimeError::TypeError),
        }
    }

    fn set_array(&mut self, array: Value, index: Value, value: Value) -> Result<(), RuntimeError> {
        if array.tag != Tag::Array {
            return Err(RuntimeError::TypeError);
        }
        if !matches!(index.tag, Tag::Int | Tag::Enum) {
            return Err(RuntimeError::NonIntegerIndex);
        }
        let i = index.as_int();
        let elements = &mut self.world.arrays.get_mut(array.as_handle())?.elements;
        if i < 0 || i as usize >= elements.len() {
            return Err(RuntimeError::IndexOutOfRange);
        }
        elements[i as usize] = value;
        Ok(())
    }

    fn get_map(&mut self, map: Value, key: Value) -> Result<Value, RuntimeError> {
        if map.tag != Tag::Map {
            return Err(RuntimeError::TypeError);
        }
        let key = self.world.map_key(key)?.ok_or(RuntimeError::TypeError)?;
        // Missing keys read as nil.
        Ok(self
            .world
            .maps
            .get(map.as_handle())?
            .get(&key)
            .unwrap_or(Value::NIL))
    }

    fn set_map(&mut self, map: Value, key: Value, value: Value) -> Result<(), RuntimeError> {
        if map.tag != Tag::Map {
            return Err(RuntimeError::TypeError);
        }
        let key = self.world.map_key(key)?.ok_or(RuntimeError::TypeError)?;
        self.world.maps.get_mut(map.as_handle())?.insert(key, value);
        Ok(())
    }

    // === Fused-constant operand decoding ================================

    #[inline]
    fn const_int(&self, code: &[u8], ip: &mut usize) -> i64 {
        let index = read_u16(code, *ip) as usize;
        *ip += 2;
        self.bytecode.constants[index].as_int()
    }

    #[inline]
    fn const_float(&self, code: &[u8], ip: &mut usize) -> f64 {
        let index = read_u16(code, *ip) as usize;
        *ip += 2;
        self.bytecode.constants[index].as_float()
    }
}
