//! The two execution engines and their shared machinery.
//!
//! Both VMs consume a [`Bytecode`](crate::bytecode::Bytecode) and a mutable
//! [`World`](crate::values::World) and run the entry function to completion
//! on the calling thread. The stack VM dispatches over a variable-length
//! byte stream; the register VM dispatches over fixed 32-bit words and a
//! contiguous register file with overlapping per-frame windows.

mod arith;
pub mod builtins;
mod error;
mod frame;
pub mod op;
mod register_vm;
pub mod rop;
mod stack_vm;


pub use builtins::{BuiltinCtx, BuiltinFn, Builtins};
pub use error::RuntimeError;
pub use frame::{Callee, Frame, RFrame};
pub use op::Op;
pub use register_vm::RegisterVm;
pub use rop::{RInstr, ROp};
pub use stack_vm::StackVm;

/// Value stack depth of the stack VM.
pub const STACK_SIZE: usize = 2048;

/// Frame slots of the stack VM.
pub const MAX_FRAMES: usize = 1024;

/// Frame slots of the register VM.
pub const MAX_FRAMES_REG: usize = 8192;

/// Global variable slots, shared by both VM families.
pub const GLOBALS_SIZE: usize = 65536;

/// Registers addressable by one function (A/B/C are byte-sized).
pub const MAX_REGISTERS: usize = 256;

/// Size of the register VM's contiguous register file. Windows overlap at
/// call boundaries, so in practice only deep call chains approach this.
pub const REGISTER_FILE_SIZE: usize = MAX_FRAMES_REG * MAX_REGISTERS;
