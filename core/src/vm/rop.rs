//! Register VM instructions - fixed 32-bit words.
//!
//! # Instruction Format
//!
//! Every instruction is one 32-bit word in one of two layouts:
//!
//! ```text
//! ABC:  ┌────────┬────────┬────────┬────────┐
//!       │  op:8  │  A:8   │  B:8   │  C:8   │
//!       └────────┴────────┴────────┴────────┘
//! ABx:  ┌────────┬────────┬─────────────────┐
//!       │  op:8  │  A:8   │      Bx:16      │
//!       └────────┴────────┴─────────────────┘
//! ```
//!
//! A, B, C are register indices in `[0, 256)`. Bx carries constant-pool
//! indices, global slots, or jump targets. The opcode's format decides how
//! the low 16 bits are read; the word itself is format-free.
//!
//! Values flow directly between register slots; there is no operand stack.

use core::fmt;

use crate::String;

/// Register-VM opcode. Discriminants are dense for the bounds-check +
/// transmute decode in the dispatch loop.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ROp {
    // ========================================================================
    // Special (0x00)
    // ========================================================================
    /// Halt at 0x00: a zeroed word stops the machine instead of running
    /// garbage.
    Halt = 0x00,

    // ========================================================================
    // Data movement (0x01 - 0x04)
    // ========================================================================
    /// ABx: R[A] = K[Bx]
    LoadK = 0x01,
    /// ABC: R[A] = R[B]
    Move = 0x02,
    /// ABx: R[A] = globals[Bx]
    LoadGlobal = 0x03,
    /// ABx: globals[Bx] = R[A] (A is the source)
    StoreGlobal = 0x04,

    // ========================================================================
    // Construction (0x05 - 0x07)
    // ========================================================================
    /// ABx: R[A] = new array, Bx is a capacity hint
    NewArray = 0x05,
    /// ABC: R[A] = new map
    NewMap = 0x06,
    /// ABx: R[A] = new struct of type K[Bx]
    NewStruct = 0x07,

    // ========================================================================
    // Index & field access (0x08 - 0x0B)
    // ========================================================================
    /// ABC: R[A] = R[B][R[C]]
    GetIdx = 0x08,
    /// ABC: R[A][R[B]] = R[C]
    SetIdx = 0x09,
    /// ABx: R[A] = R[A].field(K[Bx]) — A is object before, destination after
    GetField = 0x0A,
    /// ABx + following Move: R[A].field(K[Bx]) = R[move.B]
    SetField = 0x0B,

    // ========================================================================
    // Calls & returns (0x0C - 0x0F)
    // ========================================================================
    /// ABC: R[A] = call R[B] with arity arguments starting at R[C].
    /// The callee's register window begins at the caller's C; argument
    /// registers are shared in place, not copied.
    Call = 0x0C,
    /// ABC: R[A] = builtin(args). Low nibble of B is the builtin index,
    /// high nibble is the argument count, C is the argument base register.
    Builtin = 0x0D,
    /// ABC: propagate R[A] to the caller's destination register
    Return = 0x0E,
    /// ABC: propagate nil to the caller's destination register
    ReturnNil = 0x0F,

    // ========================================================================
    // Control flow (0x10 - 0x12)
    // ========================================================================
    /// ABx: pc = Bx
    Jump = 0x10,
    /// ABx: pc = Bx if R[A] is truthy
    JumpT = 0x11,
    /// ABx: pc = Bx if R[A] is not truthy
    JumpF = 0x12,

    // ========================================================================
    // Generic arithmetic & comparison (0x13 - 0x1D)
    //
    // Runtime-checked fallbacks for `any`-typed operands; the specialized
    // family below is what typed code compiles to.
    // ========================================================================
    /// ABC: R[A] = R[B] + R[C]
    Add = 0x13,
    Sub = 0x14,
    Mul = 0x15,
    Div = 0x16,
    Mod = 0x17,
    Eq = 0x18,
    Ne = 0x19,
    Lt = 0x1A,
    Gt = 0x1B,
    Le = 0x1C,
    Ge = 0x1D,

    // ========================================================================
    // Logical & unary (0x1E - 0x21)
    // ========================================================================
    /// ABC: R[A] = R[B] && R[C]
    And = 0x1E,
    /// ABC: R[A] = R[B] || R[C]
    Or = 0x1F,
    /// ABC: R[A] = !R[B]
    Not = 0x20,
    /// ABC: R[A] = -R[B], int or float by tag
    Neg = 0x21,

    // ========================================================================
    // Specialized arithmetic (0x22 - 0x2B): R[A] = R[B] op R[C], no tag
    // checks
    // ========================================================================
    AddInt = 0x22,
    AddFloat = 0x23,
    AddString = 0x24,
    SubInt = 0x25,
    SubFloat = 0x26,
    MulInt = 0x27,
    MulFloat = 0x28,
    DivInt = 0x29,
    DivFloat = 0x2A,
    ModInt = 0x2B,

    // ========================================================================
    // Specialized comparison (0x2C - 0x3B)
    // ========================================================================
    EqInt = 0x2C,
    EqFloat = 0x2D,
    EqString = 0x2E,
    EqBool = 0x2F,
    NeInt = 0x30,
    NeFloat = 0x31,
    NeString = 0x32,
    NeBool = 0x33,
    LtInt = 0x34,
    LtFloat = 0x35,
    GtInt = 0x36,
    GtFloat = 0x37,
    LeInt = 0x38,
    LeFloat = 0x39,
    GeInt = 0x3A,
    GeFloat = 0x3B,

    // ========================================================================
    // Fused self-multiplication (0x3C - 0x3D)
    // ========================================================================
    /// ABC: R[A] = R[B] * R[B]
    SquareInt = 0x3C,
    /// ABC: R[A] = R[B] * R[B]
    SquareFloat = 0x3D,
}

impl ROp {
    /// Number of defined opcodes; discriminants are dense in `[0, COUNT)`.
    pub const COUNT: u8 = 0x3E;

    #[inline]
    pub fn from_byte(byte: u8) -> Result<ROp, InvalidROpcode> {
        if byte < Self::COUNT {
            // Dense discriminants, see above.
            Ok(unsafe { core::mem::transmute::<u8, ROp>(byte) })
        } else {
            Err(InvalidROpcode(byte))
        }
    }

    /// Whether the low 16 bits are read as one Bx operand.
    pub fn uses_bx(self) -> bool {
        matches!(
            self,
            ROp::LoadK
                | ROp::LoadGlobal
                | ROp::StoreGlobal
                | ROp::NewArray
                | ROp::NewStruct
                | ROp::GetField
                | ROp::SetField
                | ROp::Jump
                | ROp::JumpT
                | ROp::JumpF
        )
    }
}

/// An opcode byte outside the defined range.
#[derive(Debug, Clone, Copy)]
pub struct InvalidROpcode(pub u8);

impl fmt::Display for InvalidROpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid register opcode byte: 0x{:02X}", self.0)
    }
}

/// One 32-bit register instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RInstr(pub u32);

static_assertions::assert_eq_size!(RInstr, u32);

impl RInstr {
    #[inline]
    pub fn abc(op: ROp, a: u8, b: u8, c: u8) -> RInstr {
        RInstr(((op as u32) << 24) | ((a as u32) << 16) | ((b as u32) << 8) | c as u32)
    }

    #[inline]
    pub fn abx(op: ROp, a: u8, bx: u16) -> RInstr {
        RInstr(((op as u32) << 24) | ((a as u32) << 16) | bx as u32)
    }

    #[inline]
    pub fn op_byte(self) -> u8 {
        (self.0 >> 24) as u8
    }

    #[inline]
    pub fn op(self) -> Result<ROp, InvalidROpcode> {
        ROp::from_byte(self.op_byte())
    }

    #[inline]
    pub fn a(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline]
    pub fn b(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub fn c(self) -> u8 {
        self.0 as u8
    }

    /// The low 16 bits reinterpreted as one operand.
    #[inline]
    pub fn bx(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Debug for RInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op() {
            Ok(op) if op.uses_bx() => {
                write!(f, "{:?} {}, {}", op, self.a(), self.bx())
            }
            Ok(op) => write!(f, "{:?} {}, {}, {}", op, self.a(), self.b(), self.c()),
            Err(e) => write!(f, "{}", e),
        }
    }
}

/// Pack a builtin index (low nibble) and argument count (high nibble) into
/// the B field of a `Builtin` instruction.
#[inline]
pub fn pack_builtin(index: u8, argc: u8) -> u8 {
    debug_assert!(index < 16, "builtin index must fit a nibble");
    debug_assert!(argc < 16, "builtin arity must fit a nibble");
    (argc << 4) | index
}

/// Inverse of [`pack_builtin`]: `(index, argc)`.
#[inline]
pub fn unpack_builtin(packed: u8) -> (u8, u8) {
    (packed & 0x0F, packed >> 4)
}

/// Assembly-style rendering of an instruction vector.
pub fn disassemble(code: &[RInstr]) -> String {
    use core::fmt::Write;

    let mut out = String::new();
    for (addr, instr) in code.iter().enumerate() {
        let _ = writeln!(out, "{:04} {:?}", addr, instr);
    }
    out
}
