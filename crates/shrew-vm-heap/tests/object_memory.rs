//! Object-memory contract tests
//!
//! The invariants the interpreter leans on: identity semantics of tagged
//! values, stable lazy hashes across `become:`, indexed round trips, and
//! the compiled-method header staying in step with its literal frame.

use shrew_vm_heap::{
    Body, CompiledMethodBuilder, HeapObject, InstanceSpec, ObjectSpace, TailKind, Value,
};

#[test]
fn indexed_store_then_fetch_round_trips() {
    let mut space = ObjectSpace::new();
    let array = space.new_instance_sized(space.classes.array, 5).unwrap();
    for i in 0..5 {
        space
            .indexed_at_put(array, i, Value::SmallInt(i as i64 * 3))
            .unwrap();
    }
    for i in 0..5 {
        assert_eq!(
            space.indexed_at(array, i).unwrap(),
            Value::SmallInt(i as i64 * 3)
        );
    }
}

#[test]
fn become_twice_is_identity() {
    let mut space = ObjectSpace::new();
    let a = Value::Object(space.wrap_string("a"));
    let b = Value::Object(space.wrap_string("b"));
    space.heap.r#become(a, b).unwrap();
    space.heap.r#become(a, b).unwrap();
    assert_eq!(space.unwrap_string(a).unwrap(), "a");
    assert_eq!(space.unwrap_string(b).unwrap(), "b");
}

#[test]
fn hashes_travel_with_identity_across_become() {
    let mut space = ObjectSpace::new();
    let a = space.wrap_string("a");
    let b = space.wrap_string("b");
    let hash_a = space.heap.identity_hash(a);
    let hash_b = space.heap.identity_hash(b);
    space
        .heap
        .r#become(Value::Object(a), Value::Object(b))
        .unwrap();
    assert_eq!(space.heap.identity_hash(a), hash_b);
    assert_eq!(space.heap.identity_hash(b), hash_a);
}

#[test]
fn weak_slots_clear_lazily_after_collection() {
    let mut space = ObjectSpace::new();
    let weak_class = space.create_class(
        "WeakHolder",
        Value::Object(space.classes.object),
        InstanceSpec::variable(0, TailKind::Weak),
    );
    let holder = space.new_instance_sized(weak_class, 2).unwrap();
    let survivor = space.wrap_string("kept");
    let doomed = space.wrap_string("dropped");
    space
        .indexed_at_put(holder, 0, Value::Object(survivor))
        .unwrap();
    space
        .indexed_at_put(holder, 1, Value::Object(doomed))
        .unwrap();

    // The holder and the survivor are rooted; the other referent is not.
    let stats = space.collect_garbage(&[
        Value::Object(holder),
        Value::Object(weak_class),
        Value::Object(survivor),
    ]);
    assert!(stats.weak_cleared >= 1);
    assert_eq!(space.indexed_at(holder, 0).unwrap(), Value::Object(survivor));
    assert_eq!(space.indexed_at(holder, 1).unwrap(), space.nil());
}

#[test]
fn byte_and_word_objects_carry_no_pointers() {
    let mut space = ObjectSpace::new();
    let bytes = space.new_instance_sized(space.classes.byte_array, 3).unwrap();
    let words = space.new_instance_sized(space.classes.word_array, 3).unwrap();
    assert!(space.heap.object(bytes).slots().is_none());
    assert!(space.heap.object(words).slots().is_none());
    // Word slots take non-negative 32-bit values.
    space
        .indexed_at_put(words, 0, Value::SmallInt(0xFFFF_FFFF))
        .unwrap();
    assert_eq!(
        space.indexed_at(words, 0).unwrap(),
        Value::SmallInt(0xFFFF_FFFF)
    );
    assert!(space.indexed_at_put(words, 1, Value::SmallInt(-1)).is_err());
}

#[test]
fn method_header_tracks_literal_frame() {
    let mut space = ObjectSpace::new();
    let mut builder = CompiledMethodBuilder::new().args(2).temps(4);
    let lit = builder.literal(Value::SmallInt(99));
    let method = builder.bytes(&[112, 124]).build();
    assert_eq!(lit, 0);
    assert_eq!(usize::from(method.header().literal_count), method.literals.len());

    let r = space.heap.allocate(HeapObject::new(
        space.classes.compiled_method,
        Body::Method(method),
    ));
    // The indexed view places the body after the header and literals.
    let method = space.method(r).unwrap();
    assert_eq!(method.initial_byte_offset(), 8);
    assert_eq!(space.indexed_size(r).unwrap(), 10);
    assert_eq!(space.indexed_at(r, 8).unwrap(), Value::SmallInt(112));
}

#[test]
fn instances_enumerate_after_collection() {
    let mut space = ObjectSpace::new();
    let class = space.create_class(
        "Counted",
        Value::Object(space.classes.object),
        InstanceSpec::fixed(0),
    );
    let kept = space.new_instance(class).unwrap();
    let lost = space.new_instance(class).unwrap();
    assert_eq!(space.heap.instances_of(class).count(), 2);
    let _ = lost;
    space.collect_garbage(&[Value::Object(class), Value::Object(kept)]);
    let remaining: Vec<_> = space.heap.instances_of(class).collect();
    assert_eq!(remaining, vec![kept]);
}
