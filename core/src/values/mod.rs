//! Runtime value representation and the pools that own heap storage.
//!
//! A [`Value`] is a fixed 16-byte tagged union that is trivially copyable;
//! every heap-kind value carries a [`Handle`] into the matching pool inside a
//! [`World`]. Pools are append-only within a run and trim their oldest half
//! when full, so a handle is either live or detectably stale.

mod display;
mod pool;
mod value;

#[cfg(test)]
mod pool_test;
#[cfg(test)]
mod value_test;

pub use display::stringify;
pub use pool::{
    ArrayObj, ClosureObj, Handle, MapKey, MapObj, Pool, StaleHandle, StructObj, World,
    MAX_POOL_SIZE,
};
pub use value::{Payload, Tag, Value};
