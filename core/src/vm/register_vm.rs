//! The register-based execution engine.
//!
//! The same tight-dispatch structure as the stack VM, but each step decodes
//! one 32-bit word and values flow directly between register slots. The
//! register file is one contiguous allocation partitioned into per-frame
//! windows; a callee's window starts at the caller's argument base, so
//! argument registers are shared in place rather than copied.
//!
//! Because windows overlap instead of being isolated per call, the file is
//! consumed roughly in proportion to call depth times window width; the
//! engine is not suitable for deeply recursive programs and reports
//! `FrameOverflow` when the file runs out.

use core::fmt;

use smallvec::SmallVec;

use crate::bytecode::{Backend, Bytecode};
use crate::values::{StructObj, Tag, Value, World};
use crate::{ToString, Vec};

use super::arith::{self, BinArith, BinOrder};
use super::builtins::{BuiltinCtx, Builtins};
use super::error::RuntimeError;
use super::frame::RFrame;
use super::rop::{unpack_builtin, RInstr, ROp};
use super::{GLOBALS_SIZE, MAX_FRAMES_REG, REGISTER_FILE_SIZE};

pub struct RegisterVm<'b, 'w, 'out> {
    bytecode: &'b Bytecode,
    world: &'w mut World,
    builtins: Builtins,
    out: &'out mut dyn fmt::Write,
    registers: Vec<Value>,
    globals: Vec<Value>,
    frames: Vec<RFrame>,
    frame_count: usize,
}

impl<'b, 'w, 'out> RegisterVm<'b, 'w, 'out> {
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
        debug_assert_eq!(bytecode.target, Backend::Register);
        RegisterVm {
            bytecode,
            world,
            builtins,
            out,
            registers: crate::vec![Value::NIL; REGISTER_FILE_SIZE],
            globals: crate::vec![Value::NIL; GLOBALS_SIZE],
            frames: crate::vec![RFrame::UNUSED; MAX_FRAMES_REG],
            frame_count: 0,
        }
    }

    /// Run the entry function to completion and return its final value.
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        let main = self.bytecode.main;
        tracing::debug!(function = main, "register vm run");
        self.frames[0] = RFrame {
            function: main,
            ip: 0,
            window: 0,
            dest: 0,
        };
        self.frame_count = 1;

        let mut code: &'b [RInstr] = self.bytecode.functions[main].code.as_register();
        let mut ip = 0usize;
        let mut window = 0usize;

        loop {
            assert!(ip < code.len(), "instruction pointer ran off the bytecode");
            // Decode the full word once; Bx reinterprets the low 16 bits.
            let instr = code[ip];
            ip += 1;
            let op = match instr.op() {
                Ok(op) => op,
                Err(e) => panic!("corrupt bytecode: {}", e),
            };
            let a = instr.a() as usize;

            use ROp::*;
            match op {
                Halt => return Ok(Value::NIL),

                LoadK => {
                    self.registers[window + a] = self.bytecode.constants[instr.bx() as usize];
                }
                Move => {
                    self.registers[window + a] = self.registers[window + instr.b() as usize];
                }
                LoadGlobal => {
                    self.registers[window + a] = self.globals[instr.bx() as usize];
                }
                StoreGlobal => {
                    self.globals[instr.bx() as usize] = self.registers[window + a];
                }

                // === Construction ===
                NewArray => {
                    let len = instr.bx() as usize;
                    let value = self.world.new_array(crate::vec![Value::NIL; len]);
                    self.registers[window + a] = value;
                }
                NewMap => {
                    let value = self.world.new_map(crate::values::MapObj::new());
                    self.registers[window + a] = value;
                }
                NewStruct => {
                    let name = {
                        let constant = self.bytecode.constants[instr.bx() as usize];
                        self.world.str_value(constant)?.clone()
                    };
                    let def = self
                        .bytecode
                        .struct_def(&name)
                        .ok_or(RuntimeError::TypeError)?;
                    let field_names: Vec<_> =
                        def.fields.iter().map(|(n, _)| n.clone()).collect();
                    let fields = crate::vec![Value::NIL; field_names.len()];
                    let value = self.world.new_struct(StructObj::new(name, field_names, fields));
                    self.registers[window + a] = value;
                }

                // === Index & field access ===
                GetIdx => {
                    let container = self.registers[window + instr.b() as usize];
                    let index = self.registers[window + instr.c() as usize];
                    let value = match container.tag {
                        Tag::Array | Tag::Str => self.index_array_like(container, index)?,
                        Tag::Map => self.get_map(container, index)?,
                        _ => return Err(RuntimeError::TypeError),
                    };
                    self.registers[window + a] = value;
                }
                SetIdx => {
                    let container = self.registers[window + a];
                    let index = self.registers[window + instr.b() as usize];
                    let value = self.registers[window + instr.c() as usize];
                    match container.tag {
                        Tag::Array => self.set_array(container, index, value)?,
                        Tag::Map => self.set_map(container, index, value)?,
                        _ => return Err(RuntimeError::TypeError),
                    }
                }
                GetField => {
                    // A is the object before execution and the destination
                    // after.
                    let object = self.registers[window + a];
                    if object.tag != Tag::Struct {
                        return Err(RuntimeError::TypeError);
                    }
                    let name = {
                        let constant = self.bytecode.constants[instr.bx() as usize];
                        self.world.str_value(constant)?.clone()
                    };
                    let value = self
                        .world
                        .structs
                        .get(object.as_handle())?
                        .get_by_name(&name)
                        .ok_or(RuntimeError::TypeError)?;
                    self.registers[window + a] = value;
                }
                SetField => {
                    // The paired Move that follows names the value register.
                    assert!(ip < code.len(), "SetField without its paired Move");
                    let pair = code[ip];
                    ip += 1;
                    debug_assert_eq!(pair.op().ok(), Some(ROp::Move));
                    let value = self.registers[window + pair.b() as usize];
                    let object = self.registers[window + a];
                    if object.tag != Tag::Struct {
                        return Err(RuntimeError::TypeError);
                    }
                    let name = {
                        let constant = self.bytecode.constants[instr.bx() as usize];
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

                // === Calls & returns ===
                Call => {
                    let callee = self.registers[window + instr.b() as usize];
                    let function = match callee.tag {
                        Tag::Function => callee.as_index(),
                        Tag::Closure => {
                            self.world.closures.get(callee.as_handle())?.function
                        }
                        _ => return Err(RuntimeError::CallingNonFunction),
                    };
                    if self.frame_count >= MAX_FRAMES_REG {
                        return Err(RuntimeError::FrameOverflow);
                    }
                    let func = &self.bytecode.functions[function];
                    // The callee's window starts at the caller's argument
                    // base; arguments are shared in place.
                    let new_window = window + instr.c() as usize;
                    let window_end = new_window + func.num_locals as usize;
                    if window_end > REGISTER_FILE_SIZE {
                        return Err(RuntimeError::FrameOverflow);
                    }
                    for slot in new_window + func.num_params as usize..window_end {
                        self.registers[slot] = Value::NIL;
                    }

                    self.frames[self.frame_count - 1].ip = ip;
                    self.frames[self.frame_count] = RFrame {
                        function,
                        ip: 0,
                        window: new_window,
                        dest: window + a,
                    };
                    self.frame_count += 1;

                    code = func.code.as_register();
                    ip = 0;
                    window = new_window;
                }
                Builtin => {
                    let (index, argc) = unpack_builtin(instr.b());
                    let function = self
                        .builtins
                        .get(index as usize)
                        .ok_or(RuntimeError::CallingNonFunction)?;
                    let base = window + instr.c() as usize;
                    let args: SmallVec<[Value; 8]> =
                        self.registers[base..base + argc as usize].iter().copied().collect();
                    let mut ctx = BuiltinCtx {
                        world: &mut *self.world,
                        enums: &self.bytecode.enums,
                        out: &mut *self.out,
                    };
                    self.registers[window + a] = function(&mut ctx, &args)?;
                }
                Return | ReturnNil => {
                    let value = if op == Return {
                        self.registers[window + a]
                    } else {
                        Value::NIL
                    };
                    self.frame_count -= 1;
                    let finished = self.frames[self.frame_count];
                    if self.frame_count == 0 {
                        tracing::debug!("register vm finished");
                        return Ok(value);
                    }
                    self.registers[finished.dest] = value;
                    let caller = self.frames[self.frame_count - 1];
                    code = self.bytecode.functions[caller.function].code.as_register();
                    ip = caller.ip;
                    window = caller.window;
                }

                // === Control flow ===
                Jump => {
                    ip = instr.bx() as usize;
                }
                JumpT => {
                    if self.registers[window + a].is_truthy() {
                        ip = instr.bx() as usize;
                    }
                }
                JumpF => {
                    if !self.registers[window + a].is_truthy() {
                        ip = instr.bx() as usize;
                    }
                }

                // === Generic arithmetic & comparison ===
                Add | Sub | Mul | Div | Mod => {
                    let x = self.registers[window + instr.b() as usize];
                    let y = self.registers[window + instr.c() as usize];
                    let op = match op {
                        Add => BinArith::Add,
                        Sub => BinArith::Sub,
                        Mul => BinArith::Mul,
                        Div => BinArith::Div,
                        _ => BinArith::Mod,
                    };
                    self.registers[window + a] = arith::generic_arith(self.world, op, x, y)?;
                }
                Eq | Ne => {
                    let x = self.registers[window + instr.b() as usize];
                    let y = self.registers[window + instr.c() as usize];
                    let eq = arith::generic_eq(self.world, x, y)?;
                    self.registers[window + a] = Value::bool(if op == Eq { eq } else { !eq });
                }
                Lt | Gt | Le | Ge => {
                    let x = self.registers[window + instr.b() as usize];
                    let y = self.registers[window + instr.c() as usize];
                    let order = match op {
                        Lt => BinOrder::Lt,
                        Gt => BinOrder::Gt,
                        Le => BinOrder::Le,
                        _ => BinOrder::Ge,
                    };
                    self.registers[window + a] = Value::bool(arith::generic_order(order, x, y)?);
                }

                // === Logical & unary ===
                And => {
                    let x = self.registers[window + instr.b() as usize];
                    let y = self.registers[window + instr.c() as usize];
                    self.registers[window + a] = Value::bool(x.is_truthy() && y.is_truthy());
                }
                Or => {
                    let x = self.registers[window + instr.b() as usize];
                    let y = self.registers[window + instr.c() as usize];
                    self.registers[window + a] = Value::bool(x.is_truthy() || y.is_truthy());
                }
                Not => {
                    let x = self.registers[window + instr.b() as usize];
                    self.registers[window + a] = Value::bool(!x.is_truthy());
                }
                Neg => {
                    let x = self.registers[window + instr.b() as usize];
                    self.registers[window + a] = match x.tag {
                        Tag::Int | Tag::Enum => Value::int(x.as_int().wrapping_neg()),
                        Tag::Float => Value::float(-x.as_float()),
                        _ => return Err(RuntimeError::UnsupportedOperands),
                    };
                }

                // === Specialized arithmetic: tags proven at compile time ===
                AddInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    self.registers[window + a] = Value::int(x.wrapping_add(y));
                }
                AddFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::float(x + y);
                }
                AddString => {
                    let x = self.registers[window + instr.b() as usize];
                    let y = self.registers[window + instr.c() as usize];
                    let mut joined = self.world.str_value(x)?.to_string();
                    joined.push_str(self.world.str_value(y)?);
                    self.registers[window + a] = self.world.intern_str(&joined);
                }
                SubInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    self.registers[window + a] = Value::int(x.wrapping_sub(y));
                }
                SubFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::float(x - y);
                }
                MulInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    self.registers[window + a] = Value::int(x.wrapping_mul(y));
                }
                MulFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::float(x * y);
                }
                DivInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    if y == 0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    self.registers[window + a] = Value::int(x.wrapping_div(y));
                }
                DivFloat => {
                    // IEEE semantics: division by zero produces inf/nan.
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::float(x / y);
                }
                ModInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    if y == 0 {
                        return Err(RuntimeError::ModuloByZero);
                    }
                    self.registers[window + a] = Value::int(x.wrapping_rem(y));
                }

                // === Specialized comparison ===
                EqInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    self.registers[window + a] = Value::bool(x == y);
                }
                EqFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::bool(x == y);
                }
                EqString => {
                    let x = self.registers[window + instr.b() as usize];
                    let y = self.registers[window + instr.c() as usize];
                    let eq = self.world.str_value(x)? == self.world.str_value(y)?;
                    self.registers[window + a] = Value::bool(eq);
                }
                EqBool => {
                    let x = self.registers[window + instr.b() as usize].as_bool();
                    let y = self.registers[window + instr.c() as usize].as_bool();
                    self.registers[window + a] = Value::bool(x == y);
                }
                NeInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    self.registers[window + a] = Value::bool(x != y);
                }
                NeFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::bool(x != y);
                }
                NeString => {
                    let x = self.registers[window + instr.b() as usize];
                    let y = self.registers[window + instr.c() as usize];
                    let eq = self.world.str_value(x)? == self.world.str_value(y)?;
                    self.registers[window + a] = Value::bool(!eq);
                }
                NeBool => {
                    let x = self.registers[window + instr.b() as usize].as_bool();
                    let y = self.registers[window + instr.c() as usize].as_bool();
                    self.registers[window + a] = Value::bool(x != y);
                }
                LtInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    self.registers[window + a] = Value::bool(x < y);
                }
                LtFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::bool(x < y);
                }
                GtInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    self.registers[window + a] = Value::bool(x > y);
                }
                GtFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::bool(x > y);
                }
                LeInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    self.registers[window + a] = Value::bool(x <= y);
                }
                LeFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::bool(x <= y);
                }
                GeInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    let y = self.registers[window + instr.c() as usize].as_int();
                    self.registers[window + a] = Value::bool(x >= y);
                }
                GeFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    let y = self.registers[window + instr.c() as usize].as_float();
                    self.registers[window + a] = Value::bool(x >= y);
                }

                // === Fused self-multiplication ===
                SquareInt => {
                    let x = self.registers[window + instr.b() as usize].as_int();
                    self.registers[window + a] = Value::int(x.wrapping_mul(x));
                }
                SquareFloat => {
                    let x = self.registers[window + instr.b() as usize].as_float();
                    self.registers[window + a] = Value::float(x * x);
                }
            }
        }
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
        let key = self.world.map_key(key)?.ok_or(RuntimeError::TypeError)?;
        self.world.maps.get_mut(map.as_handle())?.insert(key, value);
        Ok(())
    }
}
