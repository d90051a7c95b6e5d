//! The builtin function table.
//!
//! Builtins are referenced by integer index, stable over the lifetime of a
//! `Bytecode`. Indices 0 through 8 are the standard set below; a host may
//! register more past that. A builtin receives the world, the enum registry
//! of the running program, and the standard-output sink; it must not
//! re-enter the VM.

use core::fmt;

use crate::types::EnumRegistry;
use crate::values::{stringify, Tag, Value, World};
use crate::{String, Vec};

use super::error::RuntimeError;

/// Host context handed to every builtin call.
pub struct BuiltinCtx<'a> {
    pub world: &'a mut World,
    pub enums: &'a EnumRegistry,
    /// The only mandated external side channel.
    pub out: &'a mut dyn fmt::Write,
}

pub type BuiltinFn = fn(&mut BuiltinCtx<'_>, &[Value]) -> Result<Value, RuntimeError>;

/// Names of the standard builtins, in index order.
pub const STANDARD_NAMES: [&str; 9] = [
    "print",
    "len",
    "delete",
    "append",
    "keys",
    "values",
    "copy",
    "enumName",
    "enumValue",
];

/// Index of a standard builtin by name, used by the compiler's symbol
/// resolution.
pub fn standard_index(name: &str) -> Option<usize> {
    STANDARD_NAMES.iter().position(|&n| n == name)
}

/// The builtin dispatch table.
pub struct Builtins {
    table: Vec<(&'static str, BuiltinFn)>,
}

impl Builtins {
    /// The standard set, bound to indices 0 - 8.
    pub fn standard() -> Self {
        Builtins {
            table: crate::vec![
                ("print", builtin_print as BuiltinFn),
                ("len", builtin_len),
                ("delete", builtin_delete),
                ("append", builtin_append),
                ("keys", builtin_keys),
                ("values", builtin_values),
                ("copy", builtin_copy),
                ("enumName", builtin_enum_name),
                ("enumValue", builtin_enum_value),
            ],
        }
    }

    /// Register a host builtin past the standard indices; returns its index.
    pub fn register(&mut self, name: &'static str, function: BuiltinFn) -> usize {
        self.table.push((name, function));
        self.table.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<BuiltinFn> {
        self.table.get(index).map(|&(_, f)| f)
    }

    pub fn name(&self, index: usize) -> Option<&'static str> {
        self.table.get(index).map(|&(name, _)| name)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for Builtins {
    fn default() -> Self {
        Self::standard()
    }
}

// ============================================================================
// Standard builtins
// ============================================================================

/// `print(values…)`: canonical strings, single-space separated, newline.
fn builtin_print(ctx: &mut BuiltinCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut line = String::new();
    for (i, &arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&stringify(ctx.world, arg)?);
    }
    line.push('\n');
    ctx.out
        .write_str(&line)
        .map_err(|_| RuntimeError::WrongBuiltinArgument)?;
    Ok(Value::NIL)
}

/// `len(v)`: array, map, or string length.
fn builtin_len(ctx: &mut BuiltinCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let [v] = args else {
        return Err(RuntimeError::WrongBuiltinArgument);
    };
    let n = match v.tag {
        Tag::Array => ctx.world.arrays.get(v.as_handle())?.elements.len(),
        Tag::Map => ctx.world.maps.get(v.as_handle())?.len(),
        Tag::Str => ctx.world.str_value(*v)?.chars().count(),
        _ => return Err(RuntimeError::WrongBuiltinArgument),
    };
    Ok(Value::int(n as i64))
}

/// `delete(map, key)`.
fn builtin_delete(ctx: &mut BuiltinCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let [m, key] = args else {
        return Err(RuntimeError::WrongBuiltinArgument);
    };
    if m.tag != Tag::Map {
        return Err(RuntimeError::WrongBuiltinArgument);
    }
    let key = ctx
        .world
        .map_key(*key)?
        .ok_or(RuntimeError::WrongBuiltinArgument)?;
    ctx.world.maps.get_mut(m.as_handle())?.remove(&key);
    Ok(Value::NIL)
}

/// `append(array, values…)`: a fresh array, the original is untouched.
fn builtin_append(ctx: &mut BuiltinCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let Some((arr, rest)) = args.split_first() else {
        return Err(RuntimeError::WrongBuiltinArgument);
    };
    if arr.tag != Tag::Array {
        return Err(RuntimeError::WrongBuiltinArgument);
    }
    let mut elements = ctx.world.arrays.get(arr.as_handle())?.elements.clone();
    elements.extend_from_slice(rest);
    Ok(ctx.world.new_array(elements))
}

/// `keys(map)`: keys as an array, in insertion order.
fn builtin_keys(ctx: &mut BuiltinCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let [m] = args else {
        return Err(RuntimeError::WrongBuiltinArgument);
    };
    if m.tag != Tag::Map {
        return Err(RuntimeError::WrongBuiltinArgument);
    }
    let keys: Vec<_> = ctx
        .world
        .maps
        .get(m.as_handle())?
        .keys()
        .cloned()
        .collect();
    let values = keys
        .into_iter()
        .map(|k| match k {
            crate::values::MapKey::Int(n) => Value::int(n),
            crate::values::MapKey::Str(s) => ctx.world.intern_str(&s),
        })
        .collect();
    Ok(ctx.world.new_array(values))
}

/// `values(map)`: values as an array, in insertion order.
fn builtin_values(ctx: &mut BuiltinCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let [m] = args else {
        return Err(RuntimeError::WrongBuiltinArgument);
    };
    if m.tag != Tag::Map {
        return Err(RuntimeError::WrongBuiltinArgument);
    }
    let values: Vec<_> = ctx.world.maps.get(m.as_handle())?.values().collect();
    Ok(ctx.world.new_array(values))
}

/// `copy(v)`: deep copy of containers, identity for primitives.
fn builtin_copy(ctx: &mut BuiltinCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let [v] = args else {
        return Err(RuntimeError::WrongBuiltinArgument);
    };
    Ok(ctx.world.deep_copy(*v)?)
}

/// `enumName(enum-name, value)`.
fn builtin_enum_name(ctx: &mut BuiltinCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let [name, value] = args else {
        return Err(RuntimeError::WrongBuiltinArgument);
    };
    if name.tag != Tag::Str || !matches!(value.tag, Tag::Int | Tag::Enum) {
        return Err(RuntimeError::WrongBuiltinArgument);
    }
    let enum_name = ctx.world.str_value(*name)?.clone();
    let variant = ctx
        .enums
        .variant_name(&enum_name, value.as_int())
        .ok_or(RuntimeError::WrongBuiltinArgument)?
        .clone();
    Ok(ctx.world.intern_str(&variant))
}

/// `enumValue(enum-name, variant-name)`.
fn builtin_enum_value(ctx: &mut BuiltinCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let [name, variant] = args else {
        return Err(RuntimeError::WrongBuiltinArgument);
    };
    if name.tag != Tag::Str || variant.tag != Tag::Str {
        return Err(RuntimeError::WrongBuiltinArgument);
    }
    let enum_name = ctx.world.str_value(*name)?.clone();
    let variant = ctx.world.str_value(*variant)?.clone();
    let value = ctx
        .enums
        .variant_value(&enum_name, &variant)
        .ok_or(RuntimeError::WrongBuiltinArgument)?;
    Ok(Value::int(value))
}
