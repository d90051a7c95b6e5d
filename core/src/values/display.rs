//! Canonical stringification of values.
//!
//! `print` and the error paths share one rendering: decimal integers, floats
//! with six fractional digits, `true`/`false`, `nil`, raw strings at top
//! level but quoted inside containers, `[a, b]` arrays, `{k: v}` maps in
//! insertion order, `Name{field: value}` structs.

use core::fmt::Write;

use crate::String;

use super::pool::{MapKey, StaleHandle, World};
use super::value::{Tag, Value};

/// Render a value to its canonical string. Fails only when a handle points
/// into a trimmed pool region.
pub fn stringify(world: &World, v: Value) -> Result<String, StaleHandle> {
    let mut out = String::new();
    write_value(&mut out, world, v, false)?;
    Ok(out)
}

fn write_value(
    out: &mut String,
    world: &World,
    v: Value,
    quote_strings: bool,
) -> Result<(), StaleHandle> {
    match v.tag {
        Tag::Int | Tag::Enum => {
            let _ = write!(out, "{}", v.as_int());
        }
        Tag::Float => {
            let _ = write!(out, "{:.6}", v.as_float());
        }
        Tag::Bool => {
            let _ = write!(out, "{}", v.as_bool());
        }
        Tag::Nil => out.push_str("nil"),
        Tag::Str => {
            let s = world.str_value(v)?;
            if quote_strings {
                let _ = write!(out, "\"{}\"", s);
            } else {
                out.push_str(s);
            }
        }
        Tag::Array => {
            let arr = world.arrays.get(v.as_handle())?;
            out.push('[');
            for (i, &elem) in arr.elements.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, world, elem, true)?;
            }
            out.push(']');
        }
        Tag::Map => {
            let map = world.maps.get(v.as_handle())?;
            out.push('{');
            for (i, (key, value)) in map.entries().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                match key {
                    MapKey::Int(n) => {
                        let _ = write!(out, "{}", n);
                    }
                    MapKey::Str(s) => {
                        let _ = write!(out, "\"{}\"", s);
                    }
                }
                out.push_str(": ");
                write_value(out, world, *value, true)?;
            }
            out.push('}');
        }
        Tag::Struct => {
            let obj = world.structs.get(v.as_handle())?;
            let _ = write!(out, "{}{{", obj.type_name);
            for (i, (name, &value)) in obj.field_names.iter().zip(obj.fields.iter()).enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: ", name);
                write_value(out, world, value, true)?;
            }
            out.push('}');
        }
        Tag::Function => {
            let _ = write!(out, "<function {}>", v.as_index());
        }
        Tag::Closure => {
            let closure = world.closures.get(v.as_handle())?;
            let _ = write!(out, "<closure of function {}>", closure.function);
        }
        Tag::Builtin => {
            let _ = write!(out, "<builtin {}>", v.as_index());
        }
    }
    Ok(())
}
