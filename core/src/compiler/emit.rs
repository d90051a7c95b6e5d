//! Instruction emission for the stack backend.
//!
//! [`CodeBuilder`] is the only way stack instructions are produced, so every
//! invariant about instruction length and operand width lives here. It
//! tracks the last emitted instruction, which is all the state the peephole
//! rewrites need: a fusion rewrites the last instruction's opcode byte in
//! place and suppresses the emit that triggered it.

use crate::vm::op::{self, Op};
use crate::Vec;

use super::error::CompileError;

#[derive(Debug, Clone, Copy)]
struct Emitted {
    op: Op,
    pos: usize,
}

#[derive(Default)]
pub struct CodeBuilder {
    code: Vec<u8>,
    last: Option<Emitted>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current end of the stream; the next instruction's offset.
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    pub fn last_op(&self) -> Option<Op> {
        self.last.map(|e| e.op)
    }

    pub fn last_pos(&self) -> Option<usize> {
        self.last.map(|e| e.pos)
    }

    /// Emit one instruction, returning its offset.
    pub fn emit(&mut self, op: Op, operands: &[u16]) -> usize {
        let pos = self.code.len();
        op::encode_into(&mut self.code, op, operands);
        self.last = Some(Emitted { op, pos });
        pos
    }

    /// Rewrite the last instruction's opcode in place, keeping its operand.
    /// Both opcodes must take exactly one operand; the caller guarantees the
    /// last instruction is `expected`.
    ///
    /// This is the whole peephole mechanism: `GetLocal` becomes `AddLocal`,
    /// `Constant` becomes `AddConstInt`, and the triggering arithmetic emit
    /// is suppressed by the caller.
    pub fn fuse_last(&mut self, expected: Op, fused: Op) {
        let last = self.last.expect("fuse_last with no emitted instruction");
        debug_assert_eq!(last.op, expected);
        debug_assert_eq!(expected.operand_count(), 1);
        debug_assert_eq!(fused.operand_count(), 1);
        self.code[last.pos] = fused as u8;
        self.last = Some(Emitted {
            op: fused,
            pos: last.pos,
        });
    }

    /// Emit a jump with a placeholder target, to be patched later.
    pub fn emit_jump(&mut self, op: Op) -> usize {
        debug_assert!(matches!(op, Op::Jump | Op::JumpIfTrue | Op::JumpIfFalse));
        self.emit(op, &[0xFFFF])
    }

    /// Backfill a jump emitted by [`emit_jump`] with its target offset.
    pub fn patch_jump(&mut self, jump_pos: usize, target: usize) -> Result<(), CompileError> {
        let target: u16 = target.try_into().map_err(|_| CompileError::JumpTooFar)?;
        op::write_u16(&mut self.code, jump_pos + 1, target);
        Ok(())
    }

    /// Emit a backward jump to an already-known target.
    pub fn emit_jump_to(&mut self, op: Op, target: usize) -> Result<(), CompileError> {
        let target: u16 = target.try_into().map_err(|_| CompileError::JumpTooFar)?;
        self.emit(op, &[target]);
        Ok(())
    }

    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}
