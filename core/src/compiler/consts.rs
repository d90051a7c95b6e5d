//! The constant pool under construction.
//!
//! Constants are deduplicated by value so compiling the same AST twice
//! yields identical pools. String constants are interned into the world's
//! string pool once and reuse the same handle on every occurrence.

use ecow::EcoString;
use hashbrown::HashMap;

use crate::values::{Value, World};
use crate::Vec;

use super::error::CompileError;

/// Pool-index operands are u16.
const MAX_CONSTANTS: usize = 65536;

#[derive(Default)]
pub struct ConstPool {
    values: Vec<Value>,
    ints: HashMap<i64, u16>,
    floats: HashMap<u64, u16>,
    strings: HashMap<EcoString, u16>,
    bools: [Option<u16>; 2],
    nil: Option<u16>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, value: Value) -> Result<u16, CompileError> {
        if self.values.len() >= MAX_CONSTANTS {
            return Err(CompileError::TooManyConstants);
        }
        let index = self.values.len() as u16;
        self.values.push(value);
        Ok(index)
    }

    pub fn add_int(&mut self, n: i64) -> Result<u16, CompileError> {
        if let Some(&index) = self.ints.get(&n) {
            return Ok(index);
        }
        let index = self.push(Value::int(n))?;
        self.ints.insert(n, index);
        Ok(index)
    }

    pub fn add_float(&mut self, x: f64) -> Result<u16, CompileError> {
        // Dedup by bit pattern so -0.0 and 0.0 stay distinct constants.
        if let Some(&index) = self.floats.get(&x.to_bits()) {
            return Ok(index);
        }
        let index = self.push(Value::float(x))?;
        self.floats.insert(x.to_bits(), index);
        Ok(index)
    }

    pub fn add_bool(&mut self, b: bool) -> Result<u16, CompileError> {
        if let Some(index) = self.bools[b as usize] {
            return Ok(index);
        }
        let index = self.push(Value::bool(b))?;
        self.bools[b as usize] = Some(index);
        Ok(index)
    }

    pub fn add_nil(&mut self) -> Result<u16, CompileError> {
        if let Some(index) = self.nil {
            return Ok(index);
        }
        let index = self.push(Value::NIL)?;
        self.nil = Some(index);
        Ok(index)
    }

    pub fn add_str(&mut self, world: &mut World, s: &str) -> Result<u16, CompileError> {
        if let Some(&index) = self.strings.get(s) {
            return Ok(index);
        }
        let value = world.intern_str(s);
        let index = self.push(value)?;
        self.strings.insert(EcoString::from(s), index);
        Ok(index)
    }

    /// Function values are unique per definition; no dedup.
    pub fn add_function(&mut self, index: usize) -> Result<u16, CompileError> {
        self.push(Value::function(index))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn primitives_are_deduplicated() {
        let mut pool = ConstPool::new();
        assert_eq!(pool.add_int(5).unwrap(), 0);
        assert_eq!(pool.add_int(7).unwrap(), 1);
        assert_eq!(pool.add_int(5).unwrap(), 0);
        assert_eq!(pool.add_float(1.5).unwrap(), 2);
        assert_eq!(pool.add_float(1.5).unwrap(), 2);
        assert_eq!(pool.add_bool(true).unwrap(), 3);
        assert_eq!(pool.add_bool(true).unwrap(), 3);
        assert_eq!(pool.add_nil().unwrap(), 4);
        assert_eq!(pool.add_nil().unwrap(), 4);
        assert_eq!(pool.values().len(), 5);
    }

    #[test]
    fn strings_reuse_one_interned_handle() {
        let mut world = World::new();
        let mut pool = ConstPool::new();
        let a = pool.add_str(&mut world, "hi").unwrap();
        let b = pool.add_str(&mut world, "hi").unwrap();
        assert_eq!(a, b);
        assert_eq!(world.strings.len(), 1);
    }

    #[test]
    fn functions_are_not_deduplicated() {
        let mut pool = ConstPool::new();
        let a = pool.add_function(0).unwrap();
        let b = pool.add_function(0).unwrap();
        assert_ne!(a, b);
    }
}
