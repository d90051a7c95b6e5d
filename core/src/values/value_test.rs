//! Tests for the tagged value representation.

use pretty_assertions::assert_eq;

use super::pool::{Handle, World};
use super::value::{Tag, Value};

#[test]
fn value_is_16_bytes() {
    // Critical: the value must stay trivially copyable at a fixed size.
    assert_eq!(core::mem::size_of::<Value>(), 16);
}

#[test]
fn int_round_trip() {
    for n in [0i64, 1, -1, 42, i64::MIN, i64::MAX] {
        assert_eq!(Value::int(n).as_int(), n);
    }
}

#[test]
fn float_round_trip() {
    for x in [0.0f64, -0.0, 1.5, -2.25, f64::MAX, f64::MIN_POSITIVE, f64::INFINITY] {
        assert_eq!(Value::float(x).as_float().to_bits(), x.to_bits());
    }
}

#[test]
fn bool_round_trip() {
    assert!(Value::bool(true).as_bool());
    assert!(!Value::bool(false).as_bool());
}

#[test]
fn handle_round_trip() {
    let v = Value::array(Handle(7));
    assert_eq!(v.tag, Tag::Array);
    assert_eq!(v.as_handle(), Handle(7));
}

#[test]
fn truthiness() {
    assert!(Value::bool(true).is_truthy());
    assert!(!Value::bool(false).is_truthy());
    assert!(!Value::NIL.is_truthy());
    assert!(Value::int(0).is_truthy());
    assert!(Value::string(Handle(0)).is_truthy());
}

#[test]
fn bits_equality() {
    assert!(Value::int(3).bits_equal(&Value::int(3)));
    assert!(!Value::int(3).bits_equal(&Value::int(4)));
    assert!(!Value::int(3).bits_equal(&Value::float(3.0)));
    assert!(Value::NIL.bits_equal(&Value::NIL));
    // -0.0 == 0.0 under IEEE comparison even though the bits differ.
    assert!(Value::float(-0.0).bits_equal(&Value::float(0.0)));
}

#[test]
fn string_equality_is_by_content() {
    let mut world = World::new();
    let a = world.intern_str("hello");
    let b = world.intern_str("hello");
    assert_ne!(a.as_handle(), b.as_handle());
    assert!(world.values_equal(a, b).unwrap());
    let c = world.intern_str("other");
    assert!(!world.values_equal(a, c).unwrap());
}

#[test]
fn copies_are_independent_of_the_stack_slot() {
    let v = Value::int(9);
    let w = v;
    assert_eq!(v.as_int(), w.as_int());
}
