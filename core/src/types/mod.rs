//! Compile-time types and the declaration registries.
//!
//! The compiler derives two things for every expression: a precise [`Type`]
//! used to reject invalid programs, and a coarse [`SpecTag`] used to pick
//! type-specialized opcodes. `any` is the absorbing element: it always
//! type-checks and always suppresses specialization.

use core::fmt;

use ecow::EcoString;
use hashbrown::HashMap;

use crate::{Box, Vec};

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Int,
    Float,
    Bool,
    Str,
    Nil,
    Any,
    Array(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Func {
        params: Vec<Type>,
        ret: Box<Type>,
    },
    Struct(EcoString),
    Enum(EcoString),
}

/// Coarse tag driving opcode specialization. Anything not listed here
/// compiles to the generic opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecTag {
    Int,
    Float,
    Bool,
    Str,
}

impl Type {
    pub fn array(elem: Type) -> Type {
        Type::Array(Box::new(elem))
    }

    pub fn map(key: Type, value: Type) -> Type {
        Type::Map(Box::new(key), Box::new(value))
    }

    pub fn func(params: Vec<Type>, ret: Type) -> Type {
        Type::Func {
            params,
            ret: Box::new(ret),
        }
    }

    /// Coarse tag for specialization; enums behave as ints at runtime.
    pub fn spec_tag(&self) -> Option<SpecTag> {
        match self {
            Type::Int | Type::Enum(_) => Some(SpecTag::Int),
            Type::Float => Some(SpecTag::Float),
            Type::Bool => Some(SpecTag::Bool),
            Type::Str => Some(SpecTag::Str),
            _ => None,
        }
    }

    /// Whether a value of type `from` may be stored into a slot of this
    /// type. `any` absorbs in both directions; everything else is exact,
    /// recursively for containers.
    pub fn assignable_from(&self, from: &Type) -> bool {
        match (self, from) {
            (Type::Any, _) | (_, Type::Any) => true,
            (Type::Array(a), Type::Array(b)) => a.assignable_from(b),
            (Type::Map(ka, va), Type::Map(kb, vb)) => {
                ka.assignable_from(kb) && va.assignable_from(vb)
            }
            (
                Type::Func { params: pa, ret: ra },
                Type::Func { params: pb, ret: rb },
            ) => {
                pa.len() == pb.len()
                    && pa.iter().zip(pb).all(|(a, b)| a.assignable_from(b))
                    && ra.assignable_from(rb)
            }
            // Enums are distinct from plain ints at compile time.
            (a, b) => a == b,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Bool => write!(f, "bool"),
            Type::Str => write!(f, "string"),
            Type::Nil => write!(f, "nil"),
            Type::Any => write!(f, "any"),
            Type::Array(elem) => write!(f, "[]{}", elem),
            Type::Map(k, v) => write!(f, "map[{}]{}", k, v),
            Type::Func { params, ret } => {
                write!(f, "func(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, "):{}", ret)
            }
            Type::Struct(name) => write!(f, "{}", name),
            Type::Enum(name) => write!(f, "{}", name),
        }
    }
}

/// A struct declaration: ordered fields with stable offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: EcoString,
    pub fields: Vec<(EcoString, Type)>,
}

impl StructDef {
    pub fn offset_of(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|(name, _)| name == field)
    }

    pub fn field_type(&self, field: &str) -> Option<&Type> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, ty)| ty)
    }
}

/// An enum declaration: variants numbered 0, 1, 2, … in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub name: EcoString,
    pub variants: Vec<EcoString>,
}

impl EnumDef {
    pub fn value_of(&self, variant: &str) -> Option<i64> {
        self.variants
            .iter()
            .position(|v| v == variant)
            .map(|i| i as i64)
    }
}

/// Side registry for reflective builtins: `(enum name, value) → variant`.
#[derive(Debug, Clone, Default)]
pub struct EnumRegistry {
    defs: HashMap<EcoString, EnumDef>,
}

impl EnumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: EnumDef) {
        self.defs.insert(def.name.clone(), def);
    }

    pub fn def(&self, name: &str) -> Option<&EnumDef> {
        self.defs.get(name)
    }

    pub fn variant_name(&self, enum_name: &str, value: i64) -> Option<&EcoString> {
        let def = self.defs.get(enum_name)?;
        usize::try_from(value).ok().and_then(|i| def.variants.get(i))
    }

    pub fn variant_value(&self, enum_name: &str, variant: &str) -> Option<i64> {
        self.defs.get(enum_name)?.value_of(variant)
    }
}

/// A function's compile-time signature, kept in a module-level map so call
/// checking is a table lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSig {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl FuncSig {
    pub fn as_type(&self) -> Type {
        Type::func(self.params.clone(), self.ret.clone())
    }
}
