//! Generic operator semantics shared by both dispatch loops.
//!
//! These are the runtime-checked fallbacks for `any`-typed operands: tags
//! are inspected, ints promote to floats when mixed, `+` with a string
//! operand concatenates through the pool. The specialized opcode families
//! never come through here.

use crate::values::{stringify, Tag, Value, World};

use super::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BinArith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BinOrder {
    Lt,
    Gt,
    Le,
    Ge,
}

pub(super) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub(super) fn as_f64(&self) -> f64 {
        match *self {
            Num::Int(n) => n as f64,
            Num::Float(x) => x,
        }
    }
}

pub(super) fn numeric(v: Value) -> Option<Num> {
    match v.tag {
        Tag::Int | Tag::Enum => Some(Num::Int(v.as_int())),
        Tag::Float => Some(Num::Float(v.as_float())),
        _ => None,
    }
}

pub(super) fn generic_arith(
    world: &mut World,
    op: BinArith,
    a: Value,
    b: Value,
) -> Result<Value, RuntimeError> {
    // `+` with any string operand is concatenation; the other side is
    // rendered canonically.
    if op == BinArith::Add && (a.tag == Tag::Str || b.tag == Tag::Str) {
        let mut joined = stringify(world, a)?;
        joined.push_str(&stringify(world, b)?);
        return Ok(world.intern_str(&joined));
    }
    match (numeric(a), numeric(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => match op {
            BinArith::Add => Ok(Value::int(x.wrapping_add(y))),
            BinArith::Sub => Ok(Value::int(x.wrapping_sub(y))),
            BinArith::Mul => Ok(Value::int(x.wrapping_mul(y))),
            BinArith::Div => {
                if y == 0 {
                    Err(RuntimeError::DivisionByZero)
                } else {
                    Ok(Value::int(x.wrapping_div(y)))
                }
            }
            BinArith::Mod => {
                if y == 0 {
                    Err(RuntimeError::ModuloByZero)
                } else {
                    Ok(Value::int(x.wrapping_rem(y)))
                }
            }
        },
        (Some(x), Some(y)) => {
            // At least one float: promote both.
            let (x, y) = (x.as_f64(), y.as_f64());
            match op {
                BinArith::Add => Ok(Value::float(x + y)),
                BinArith::Sub => Ok(Value::float(x - y)),
                BinArith::Mul => Ok(Value::float(x * y)),
                BinArith::Div => Ok(Value::float(x / y)),
                // Modulo is integer-only.
                BinArith::Mod => Err(RuntimeError::UnsupportedOperands),
            }
        }
        _ => Err(RuntimeError::UnsupportedOperands),
    }
}

pub(super) fn generic_eq(world: &World, a: Value, b: Value) -> Result<bool, RuntimeError> {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return Ok(x.as_f64() == y.as_f64());
    }
    Ok(world.values_equal(a, b)?)
}

pub(super) fn generic_order(op: BinOrder, a: Value, b: Value) -> Result<bool, RuntimeError> {
    let (Some(x), Some(y)) = (numeric(a), numeric(b)) else {
        return Err(RuntimeError::UnsupportedComparison);
    };
    let (x, y) = (x.as_f64(), y.as_f64());
    Ok(match op {
        BinOrder::Lt => x < y,
        BinOrder::Gt => x > y,
        BinOrder::Le => x <= y,
        BinOrder::Ge => x >= y,
    })
}
