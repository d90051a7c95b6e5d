//! The compiled artifact shared by the compiler and both VMs.
//!
//! A [`Bytecode`] is an in-memory object only; nothing here is serialized.
//! It owns the constant pool, every reachable function record, the enum
//! registry and struct definitions the program declared, and an identifier
//! for which VM family the instructions target.

use ecow::EcoString;

use crate::types::{EnumRegistry, StructDef};
use crate::values::Value;
use crate::vm::{op, rop, RInstr};
use crate::Vec;

/// Which execution engine the compiler emitted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Stack,
    Register,
}

/// Instruction storage for one function: exactly one family is populated.
#[derive(Debug, Clone, PartialEq)]
pub enum FuncCode {
    Stack(Vec<u8>),
    Register(Vec<RInstr>),
}

impl FuncCode {
    pub fn as_stack(&self) -> &[u8] {
        match self {
            FuncCode::Stack(code) => code,
            FuncCode::Register(_) => panic!("register function executed by the stack VM"),
        }
    }

    pub fn as_register(&self) -> &[RInstr] {
        match self {
            FuncCode::Register(code) => code,
            FuncCode::Stack(_) => panic!("stack function executed by the register VM"),
        }
    }
}

/// A compiled function. Executed only against the [`Bytecode`] that owns it,
/// which is where its constants live.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: EcoString,
    pub num_params: u16,
    /// Stack family: local slot count including parameters. Register
    /// family: register window size (high-water mark + 1).
    pub num_locals: u16,
    pub code: FuncCode,
}

/// A complete compiled program.
pub struct Bytecode {
    pub target: Backend,
    /// Flat sequence of values referenced by pool-index operands.
    pub constants: Vec<Value>,
    /// Every function reachable from the entry point. Append-only and
    /// handle-addressed; function values index into this table.
    pub functions: Vec<Function>,
    /// Index of the entry function in `functions`.
    pub main: usize,
    /// Number of global slots the program uses.
    pub num_globals: usize,
    pub enums: EnumRegistry,
    pub structs: Vec<StructDef>,
}

impl Bytecode {
    pub fn main_function(&self) -> &Function {
        &self.functions[self.main]
    }

    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|def| def.name == name)
    }
}

impl core::fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Bytecode {{")?;
        writeln!(f, "  target: {:?}", self.target)?;
        writeln!(f, "  num_globals: {}", self.num_globals)?;

        if self.constants.is_empty() {
            writeln!(f, "  constants: []")?;
        } else {
            writeln!(f, "  constants: [")?;
            for (i, constant) in self.constants.iter().enumerate() {
                writeln!(f, "    [{}] = {:?}", i, constant)?;
            }
            writeln!(f, "  ]")?;
        }

        for (i, function) in self.functions.iter().enumerate() {
            let marker = if i == self.main { " (main)" } else { "" };
            writeln!(
                f,
                "  function [{}] {:?}{} params={} locals={}",
                i, function.name, marker, function.num_params, function.num_locals
            )?;
            let listing = match &function.code {
                FuncCode::Stack(code) => op::disassemble(code),
                FuncCode::Register(code) => rop::disassemble(code),
            };
            for line in listing.lines() {
                writeln!(f, "    {}", line)?;
            }
        }
        write!(f, "}}")
    }
}
