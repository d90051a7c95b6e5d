//! Interning pools and the [`World`] that owns them.
//!
//! Each pool is an append-only sequence with a cap of [`MAX_POOL_SIZE`]
//! entries. Handles are monotone sequence numbers, never reused: when a full
//! pool trims its oldest half, every handle into the discarded region falls
//! below the pool's `start` offset and dereferencing it reports
//! [`StaleHandle`] instead of aliasing fresh storage.
//!
//! A single-threaded discipline applies throughout: neither a pool nor a VM
//! may be driven concurrently from multiple threads. Running two programs at
//! once requires two independent `World`s.

use ecow::EcoString;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::{String, ToString, Vec};

use super::value::{Tag, Value};

/// Default cap on the number of entries in a single pool.
pub const MAX_POOL_SIZE: usize = 100_000;

/// A stable reference into a pool. Monotone per pool; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

/// Dereference of a handle whose entry was discarded by a pool trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleHandle;

/// Append-only storage for one heap kind.
pub struct Pool<T> {
    entries: Vec<T>,
    /// Sequence number of `entries[0]`. Bumped by trims.
    start: u64,
    cap: usize,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self::with_cap(MAX_POOL_SIZE)
    }

    pub fn with_cap(cap: usize) -> Self {
        debug_assert!(cap >= 2);
        Pool {
            entries: Vec::new(),
            start: 0,
            cap,
        }
    }

    /// Insert a value, trimming the oldest half first if the pool is full.
    /// The inserted value is always present afterwards.
    pub fn insert(&mut self, value: T) -> Handle {
        if self.entries.len() >= self.cap {
            self.trim();
        }
        let handle = Handle(self.start + self.entries.len() as u64);
        self.entries.push(value);
        handle
    }

    fn trim(&mut self) {
        let drop = self.cap / 2;
        self.entries.drain(..drop);
        self.start += drop as u64;
        tracing::debug!(dropped = drop, start = self.start, "pool trimmed");
    }

    pub fn get(&self, handle: Handle) -> Result<&T, StaleHandle> {
        let index = handle.0.checked_sub(self.start).ok_or(StaleHandle)?;
        self.entries.get(index as usize).ok_or(StaleHandle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, StaleHandle> {
        let index = handle.0.checked_sub(self.start).ok_or(StaleHandle)?;
        self.entries.get_mut(index as usize).ok_or(StaleHandle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured map key: integer keys are kept as integers instead of being
/// stringified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Int(i64),
    Str(EcoString),
}

/// An ordered sequence of values.
#[derive(Debug, Clone, Default)]
pub struct ArrayObj {
    pub elements: Vec<Value>,
}

impl ArrayObj {
    pub fn new(elements: Vec<Value>) -> Self {
        ArrayObj { elements }
    }
}

/// Insertion-ordered map with a redundant key index for O(1) lookup.
#[derive(Debug, Clone, Default)]
pub struct MapObj {
    entries: Vec<(MapKey, Value)>,
    index: HashMap<MapKey, usize>,
}

impl MapObj {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &MapKey) -> Option<Value> {
        self.index.get(key).map(|&i| self.entries[i].1)
    }

    /// Insert or update; insertion order is preserved for existing keys.
    pub fn insert(&mut self, key: MapKey, value: Value) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn remove(&mut self, key: &MapKey) -> Option<Value> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        // Reindex everything that shifted down.
        for (j, (k, _)) in self.entries.iter().enumerate().skip(i) {
            self.index.insert(k.clone(), j);
        }
        Some(value)
    }

    pub fn entries(&self) -> &[(MapKey, Value)] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &MapKey> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries.iter().map(|(_, v)| *v)
    }
}

/// A struct instance: ordered fields for offset access plus the redundant
/// name→value mapping for dynamic access.
#[derive(Debug, Clone)]
pub struct StructObj {
    pub type_name: EcoString,
    pub field_names: Vec<EcoString>,
    pub fields: Vec<Value>,
    by_name: HashMap<EcoString, Value>,
}

impl StructObj {
    pub fn new(type_name: EcoString, field_names: Vec<EcoString>, fields: Vec<Value>) -> Self {
        debug_assert_eq!(field_names.len(), fields.len());
        let by_name = field_names
            .iter()
            .cloned()
            .zip(fields.iter().copied())
            .collect();
        StructObj {
            type_name,
            field_names,
            fields,
            by_name,
        }
    }

    pub fn get_by_offset(&self, offset: usize) -> Option<Value> {
        self.fields.get(offset).copied()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Value> {
        self.by_name.get(name).copied()
    }

    pub fn set_by_offset(&mut self, offset: usize, value: Value) -> bool {
        match self.fields.get_mut(offset) {
            Some(slot) => {
                *slot = value;
                let name = self.field_names[offset].clone();
                self.by_name.insert(name, value);
                true
            }
            None => false,
        }
    }

    pub fn set_by_name(&mut self, name: &str, value: Value) -> bool {
        match self.field_names.iter().position(|n| n == name) {
            Some(offset) => {
                self.fields[offset] = value;
                self.by_name.insert(self.field_names[offset].clone(), value);
                true
            }
            None => false,
        }
    }
}

/// A function paired with its captured values. An empty capture list makes
/// the closure interchangeable with the raw function.
#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub function: usize,
    pub captured: SmallVec<[Value; 4]>,
}

/// The single-threaded universe of pools a compiler and VM share.
///
/// Pools are process-wide in spirit; materializing them as an owned struct
/// makes the "two programs need two worlds" rule explicit.
#[derive(Default)]
pub struct World {
    pub strings: Pool<EcoString>,
    pub arrays: Pool<ArrayObj>,
    pub maps: Pool<MapObj>,
    pub structs: Pool<StructObj>,
    pub closures: Pool<ClosureObj>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string and return its value. All string construction,
    /// including concatenation, goes through here.
    pub fn intern_str(&mut self, s: &str) -> Value {
        Value::string(self.strings.insert(EcoString::from(s)))
    }

    pub fn new_array(&mut self, elements: Vec<Value>) -> Value {
        Value::array(self.arrays.insert(ArrayObj::new(elements)))
    }

    pub fn new_map(&mut self, map: MapObj) -> Value {
        Value::map(self.maps.insert(map))
    }

    pub fn new_struct(&mut self, obj: StructObj) -> Value {
        Value::struct_(self.structs.insert(obj))
    }

    pub fn new_closure(&mut self, function: usize, captured: SmallVec<[Value; 4]>) -> Value {
        Value::closure(self.closures.insert(ClosureObj { function, captured }))
    }

    pub fn str_value(&self, v: Value) -> Result<&EcoString, StaleHandle> {
        debug_assert_eq!(v.tag, Tag::Str);
        self.strings.get(v.as_handle())
    }

    /// Build a structured map key from a value. Only int and string keys are
    /// representable; the compiler rejects other key types.
    pub fn map_key(&self, v: Value) -> Result<Option<MapKey>, StaleHandle> {
        match v.tag {
            Tag::Int | Tag::Enum => Ok(Some(MapKey::Int(v.as_int()))),
            Tag::Str => Ok(Some(MapKey::Str(self.str_value(v)?.clone()))),
            _ => Ok(None),
        }
    }

    /// Language equality: primitives by payload, strings by content,
    /// other reference kinds by handle identity.
    pub fn values_equal(&self, a: Value, b: Value) -> Result<bool, StaleHandle> {
        if a.tag == Tag::Str && b.tag == Tag::Str {
            return Ok(self.str_value(a)? == self.str_value(b)?);
        }
        Ok(a.bits_equal(&b))
    }

    /// `copy` builtin: fresh pool entries for container kinds, identity for
    /// primitives and callables.
    pub fn deep_copy(&mut self, v: Value) -> Result<Value, StaleHandle> {
        match v.tag {
            Tag::Array => {
                let elements = self.arrays.get(v.as_handle())?.elements.clone();
                let copied: Result<Vec<Value>, StaleHandle> =
                    elements.into_iter().map(|e| self.deep_copy(e)).collect();
                Ok(self.new_array(copied?))
            }
            Tag::Map => {
                let entries: Vec<(MapKey, Value)> =
                    self.maps.get(v.as_handle())?.entries().to_vec();
                let mut out = MapObj::new();
                for (k, e) in entries {
                    let e = self.deep_copy(e)?;
                    out.insert(k, e);
                }
                Ok(self.new_map(out))
            }
            Tag::Struct => {
                let src = self.structs.get(v.as_handle())?.clone();
                let copied: Result<Vec<Value>, StaleHandle> =
                    src.fields.iter().map(|&e| self.deep_copy(e)).collect();
                Ok(self.new_struct(StructObj::new(src.type_name, src.field_names, copied?)))
            }
            Tag::Str => {
                let s: String = self.str_value(v)?.to_string();
                Ok(self.intern_str(&s))
            }
            _ => Ok(v),
        }
    }
}
