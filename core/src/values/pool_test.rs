//! Tests for pools, trimming, and the container objects.

use ecow::EcoString;
use pretty_assertions::assert_eq;
use smallvec::smallvec;

use crate::vec;
use crate::Vec;

use super::display::stringify;
use super::pool::{MapKey, MapObj, Pool, StructObj, World};
use super::value::Value;

#[test]
fn insert_and_get() {
    let mut pool: Pool<EcoString> = Pool::new();
    let a = pool.insert("a".into());
    let b = pool.insert("b".into());
    assert_eq!(pool.get(a).unwrap(), "a");
    assert_eq!(pool.get(b).unwrap(), "b");
    assert_eq!(pool.len(), 2);
}

#[test]
fn trim_drops_oldest_half_and_keeps_the_insert() {
    let mut pool: Pool<i64> = Pool::with_cap(8);
    let handles: Vec<_> = (0..8).map(|n| pool.insert(n)).collect();
    assert_eq!(pool.len(), 8);

    // The pool is exactly at its cap; the next insert trims first and the
    // inserted value must be present afterwards.
    let fresh = pool.insert(99);
    assert_eq!(pool.len(), 5);
    assert_eq!(*pool.get(fresh).unwrap(), 99);

    // Oldest half became stale, the rest survived.
    for (n, &h) in handles.iter().enumerate() {
        if n < 4 {
            assert!(pool.get(h).is_err(), "handle {} should be stale", n);
        } else {
            assert_eq!(*pool.get(h).unwrap(), n as i64);
        }
    }
}

#[test]
fn handles_stay_stale_across_further_trims() {
    let mut pool: Pool<i64> = Pool::with_cap(4);
    let first = pool.insert(0);
    for n in 1..20 {
        pool.insert(n);
    }
    assert!(pool.get(first).is_err());
}

#[test]
fn map_insertion_order_and_lookup() {
    let mut map = MapObj::new();
    map.insert(MapKey::Int(2), Value::int(20));
    map.insert(MapKey::Int(1), Value::int(10));
    map.insert(MapKey::Str("x".into()), Value::int(30));
    assert_eq!(map.len(), 3);
    assert_eq!(map.get(&MapKey::Int(1)).unwrap().as_int(), 10);

    let keys: Vec<_> = map.keys().cloned().collect();
    assert_eq!(
        keys,
        vec![MapKey::Int(2), MapKey::Int(1), MapKey::Str("x".into())]
    );

    // Updating an existing key keeps its position.
    map.insert(MapKey::Int(2), Value::int(21));
    assert_eq!(map.len(), 3);
    assert_eq!(map.entries()[0].1.as_int(), 21);
}

#[test]
fn map_remove_reindexes() {
    let mut map = MapObj::new();
    map.insert(MapKey::Int(1), Value::int(1));
    map.insert(MapKey::Int(2), Value::int(2));
    map.insert(MapKey::Int(3), Value::int(3));
    assert_eq!(map.remove(&MapKey::Int(2)).unwrap().as_int(), 2);
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&MapKey::Int(3)).unwrap().as_int(), 3);
    assert!(map.get(&MapKey::Int(2)).is_none());
}

#[test]
fn struct_offset_and_name_access_agree() {
    let obj = StructObj::new(
        "Point".into(),
        vec!["x".into(), "y".into()],
        vec![Value::int(1), Value::int(2)],
    );
    for (i, name) in ["x", "y"].iter().enumerate() {
        assert!(obj
            .get_by_offset(i)
            .unwrap()
            .bits_equal(&obj.get_by_name(name).unwrap()));
    }
}

#[test]
fn struct_set_updates_both_views() {
    let mut obj = StructObj::new(
        "Point".into(),
        vec!["x".into(), "y".into()],
        vec![Value::int(1), Value::int(2)],
    );
    assert!(obj.set_by_offset(1, Value::int(9)));
    assert_eq!(obj.get_by_name("y").unwrap().as_int(), 9);
    assert!(obj.set_by_name("x", Value::int(7)));
    assert_eq!(obj.get_by_offset(0).unwrap().as_int(), 7);
    assert!(!obj.set_by_name("z", Value::int(0)));
}

#[test]
fn deep_copy_detaches_containers() {
    let mut world = World::new();
    let inner = world.new_array(vec![Value::int(1)]);
    let outer = world.new_array(vec![inner, Value::int(2)]);

    let copy = world.deep_copy(outer).unwrap();
    assert_ne!(copy.as_handle(), outer.as_handle());

    // Mutating the copy's inner array leaves the original alone.
    let copied_inner = world.arrays.get(copy.as_handle()).unwrap().elements[0];
    world
        .arrays
        .get_mut(copied_inner.as_handle())
        .unwrap()
        .elements[0] = Value::int(42);
    let original_inner = world.arrays.get(outer.as_handle()).unwrap().elements[0];
    assert_eq!(
        world.arrays.get(original_inner.as_handle()).unwrap().elements[0].as_int(),
        1
    );
}

#[test]
fn closure_with_empty_captures() {
    let mut world = World::new();
    let v = world.new_closure(3, smallvec![]);
    let closure = world.closures.get(v.as_handle()).unwrap();
    assert_eq!(closure.function, 3);
    assert!(closure.captured.is_empty());
}

#[test]
fn stringify_canonical_forms() {
    let mut world = World::new();
    assert_eq!(stringify(&world, Value::int(42)).unwrap(), "42");
    assert_eq!(stringify(&world, Value::float(9.0)).unwrap(), "9.000000");
    assert_eq!(stringify(&world, Value::bool(true)).unwrap(), "true");
    assert_eq!(stringify(&world, Value::NIL).unwrap(), "nil");

    let s = world.intern_str("plain");
    assert_eq!(stringify(&world, s).unwrap(), "plain");

    let arr = world.new_array(vec![Value::int(1), s]);
    assert_eq!(stringify(&world, arr).unwrap(), "[1, \"plain\"]");

    let mut map = MapObj::new();
    map.insert(MapKey::Int(1), Value::int(10));
    let m = world.new_map(map);
    assert_eq!(stringify(&world, m).unwrap(), "{1: 10}");
}

#[test]
fn stringify_rejects_stale_handles() {
    let mut world = World::new();
    world.strings = Pool::with_cap(2);
    let first = world.intern_str("gone");
    world.intern_str("b");
    world.intern_str("c");
    assert!(stringify(&world, first).is_err());
}
