//! End-to-end interpreter scenarios
//!
//! These tests drive hand-assembled methods through the public `Vm`
//! surface, the way an image would: full sends, closures, non-local
//! returns, unwind protection, the scheduler and the method cache.

use shrew_vm_core::{HostServices, Vm, VmConfig, VmError};
use shrew_vm_heap::space::message_slot;
use shrew_vm_heap::{CompiledMethod, CompiledMethodBuilder, InstanceSpec, ObjRef, Value};

fn test_class(vm: &mut Vm, name: &str, fixed_fields: u16) -> ObjRef {
    let object = Value::Object(vm.space.classes.object);
    vm.space
        .create_class(name, object, InstanceSpec::fixed(fixed_fields))
}

fn install(vm: &mut Vm, class: ObjRef, selector: &str, method: CompiledMethod) {
    vm.space.install_method(class, selector, method).unwrap();
    vm.cache.flush_all();
}

fn instance(vm: &mut Vm, class: ObjRef) -> Value {
    Value::Object(vm.space.new_instance(class).unwrap())
}

#[test]
fn arithmetic_send_runs_the_primitive() {
    let mut vm = Vm::headless();
    let result = vm.perform(Value::SmallInt(3), "+", &[Value::SmallInt(4)]).unwrap();
    assert_eq!(result, Value::SmallInt(7));
}

#[test]
fn arithmetic_overflow_runs_the_fallback_body() {
    let mut vm = Vm::headless();
    let max = Value::SmallInt(shrew_vm_heap::SMALL_INT_MAX);
    // The kernel fallback answers nil where an image would promote to a
    // large integer.
    let result = vm.perform(max, "+", &[Value::SmallInt(1)]).unwrap();
    assert_eq!(result, vm.space.nil());
}

#[test]
fn comparison_sends_answer_booleans() {
    let mut vm = Vm::headless();
    let result = vm.perform(Value::SmallInt(3), "<", &[Value::SmallInt(4)]).unwrap();
    assert_eq!(result, vm.space.specials.bool_true);
    let result = vm.perform(Value::SmallInt(3), ">", &[Value::SmallInt(4)]).unwrap();
    assert_eq!(result, vm.space.specials.bool_false);
}

#[test]
fn to_do_loop_activates_the_block_eleven_times() {
    let mut vm = Vm::headless();
    let counter = test_class(&mut vm, "LoopCounter", 1);

    // count := 0.
    // 0 to: 10 do: [:i | count := count + 1].
    // ^ count
    let mut builder = CompiledMethodBuilder::new();
    builder.literal(Value::SmallInt(10));
    let to_do = vm.space.symbol("to:do:");
    builder.literal(Value::Object(to_do));
    let method = builder
        .bytes(&[
            117, 96, // count := 0
            117, 32, // receiver 0, limit 10
            143, 0x01, 0, 6, // one-argument closure, six-byte body
            0, 118, 176, 96, 115, 125, // count := count + 1
            241, 135, // to:do:, discard
            0, 124, // ^ count
        ])
        .build();
    install(&mut vm, counter, "runLoop", method);

    let receiver = instance(&mut vm, counter);
    let result = vm.perform(receiver, "runLoop", &[]).unwrap();
    assert_eq!(result, Value::SmallInt(11));
}

#[test]
fn missing_selector_without_dnu_aborts_with_a_dump() {
    let mut vm = Vm::headless();
    let bare = test_class(&mut vm, "BareObject", 0);
    let receiver = instance(&mut vm, bare);
    match vm.perform(receiver, "zork", &[]) {
        Err(VmError::MissingDoesNotUnderstand { class_name }) => {
            assert_eq!(class_name, "BareObject");
        }
        other => panic!("expected a missing-dNU abort, got {other:?}"),
    }
}

#[test]
fn dnu_handler_receives_the_message() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "EchoingObject", 0);
    // doesNotUnderstand: aMessage  ^ aMessage
    let method = CompiledMethodBuilder::new().args(1).bytes(&[16, 124]).build();
    install(&mut vm, class, "doesNotUnderstand:", method);

    let receiver = instance(&mut vm, class);
    let result = vm
        .perform(receiver, "frobnicate:", &[Value::SmallInt(9)])
        .unwrap();
    let message = result.as_object().expect("a Message object");
    assert_eq!(vm.space.heap.class_of(message), vm.space.classes.message);
    let selector = vm.space.heap.fetch(message, message_slot::SELECTOR).unwrap();
    assert_eq!(selector, Value::Object(vm.space.symbol("frobnicate:")));
    let arguments = vm
        .space
        .unwrap_array(vm.space.heap.fetch(message, message_slot::ARGUMENTS).unwrap())
        .unwrap();
    assert_eq!(arguments, vec![Value::SmallInt(9)]);
}

#[test]
fn non_local_return_runs_ensure_blocks_innermost_first() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "UnwindProbe", 1);

    // x := 0.
    // [[^ 1] ensure: [x := x + 10]] ensure: [x := x + 100].
    // x
    let mut builder = CompiledMethodBuilder::new();
    builder.literal(Value::SmallInt(10));
    let ensure = vm.space.symbol("ensure:");
    builder.literal(Value::Object(ensure));
    builder.literal(Value::SmallInt(100));
    let method = builder
        .bytes(&[
            117, 96, // x := 0
            143, 0x00, 0, 18, // outer block, 18-byte body
            /* 6*/ 143, 0, 0, 2, // [^ 1]
            /*10*/ 118, 124, //
            /*12*/ 143, 0, 0, 6, // [x := x + 10]
            /*16*/ 0, 32, 176, 96, 115, 125, //
            /*22*/ 225, // ensure:
            /*23*/ 125, // block return
            /*24*/ 143, 0, 0, 6, // [x := x + 100]
            /*28*/ 0, 34, 176, 96, 115, 125, //
            /*34*/ 225, // ensure:
            /*35*/ 135, 0, 124, // pop. ^ x (unreached)
        ])
        .build();
    install(&mut vm, class, "runUnwind", method);

    let receiver = instance(&mut vm, class);
    let result = vm.perform(receiver, "runUnwind", &[]).unwrap();
    // The non-local return reaches the caller with its value...
    assert_eq!(result, Value::SmallInt(1));
    // ...and both cleanups ran, innermost first: 0 + 10 + 100.
    let probe = receiver.as_object().unwrap();
    assert_eq!(vm.space.heap.fetch(probe, 0).unwrap(), Value::SmallInt(110));
}

#[test]
fn if_curtailed_skips_cleanup_on_normal_completion() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "CurtailProbe", 1);

    // x := 0. [7] ifCurtailed: [x := 99]. ^ x
    let mut builder = CompiledMethodBuilder::new();
    let if_curtailed = vm.space.symbol("ifCurtailed:");
    builder.literal(Value::Object(if_curtailed));
    builder.literal(Value::SmallInt(7));
    builder.literal(Value::SmallInt(99));
    let method = builder
        .bytes(&[
            117, 96, // x := 0
            143, 0, 0, 2, // [7]
            33, 125, //
            143, 0, 0, 4, // [x := 99]
            34, 96, 115, 125, //
            224, 135, // ifCurtailed:, discard
            0, 124, // ^ x
        ])
        .build();
    install(&mut vm, class, "runNormal", method);

    let receiver = instance(&mut vm, class);
    let result = vm.perform(receiver, "runNormal", &[]).unwrap();
    assert_eq!(result, Value::SmallInt(0));
}

#[test]
fn block_cannot_return_into_a_dead_home() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "Escapee", 0);

    // ^ [^ 42]  — the closure escapes its home.
    let mut builder = CompiledMethodBuilder::new();
    builder.literal(Value::SmallInt(42));
    let method = builder.bytes(&[143, 0, 0, 2, 32, 124, 125]).build();
    install(&mut vm, class, "escapedBlock", method);

    let receiver = instance(&mut vm, class);
    let block = vm.perform(receiver, "escapedBlock", &[]).unwrap();
    assert_eq!(
        vm.space.class_of(block),
        vm.space.classes.block_closure
    );

    // Valuing it now fails the non-local return via the special selector.
    match vm.perform(block, "value", &[]) {
        Err(VmError::MissingSpecialMethod { selector, .. }) => {
            assert_eq!(selector, "cannotReturn:");
        }
        other => panic!("expected the cannotReturn: send to abort, got {other:?}"),
    }
}

#[test]
fn cannot_return_handler_sees_the_block_and_value() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "Escapee", 0);
    let mut builder = CompiledMethodBuilder::new();
    builder.literal(Value::SmallInt(42));
    let method = builder.bytes(&[143, 0, 0, 2, 32, 124, 125]).build();
    install(&mut vm, class, "escapedBlock", method);

    // cannotReturn: value  — record the value in an association, then
    // answer self (the offending block).
    let probe = vm.space.new_association(Value::SmallInt(0), Value::SmallInt(0));
    let mut builder = CompiledMethodBuilder::new().args(1);
    builder.literal(Value::Object(probe));
    let handler = builder.bytes(&[16, 129, 0xC0, 112, 124]).build();
    let object_class = vm.space.classes.object;
    install(&mut vm, object_class, "cannotReturn:", handler);

    let receiver = instance(&mut vm, class);
    let block = vm.perform(receiver, "escapedBlock", &[]).unwrap();
    // The handler answers self, so the resumed activation ends up
    // returning the offending block itself.
    let result = vm.perform(block, "value", &[]).unwrap();
    assert_eq!(result, block);
    let recorded = vm.space.heap.fetch(probe, 1).unwrap();
    assert_eq!(recorded, Value::SmallInt(42));
}

#[test]
fn deep_recursion_survives_by_spilling_to_the_heap() {
    let config = VmConfig {
        max_stack_depth: 40,
        ..VmConfig::default()
    };
    let mut vm = Vm::new(config, Box::new(shrew_vm_core::NullHost));
    let class = test_class(&mut vm, "Recursor", 0);

    // countDown: n  n = 0 ifTrue: [^ 0]. ^ self countDown: n - 1
    let mut builder = CompiledMethodBuilder::new().args(1);
    let count_down = vm.space.symbol("countDown:");
    builder.literal(Value::Object(count_down));
    let method = builder
        .bytes(&[16, 117, 182, 153, 117, 124, 112, 16, 118, 177, 224, 124])
        .build();
    install(&mut vm, class, "countDown:", method);

    let receiver = instance(&mut vm, class);
    let result = vm
        .perform(receiver, "countDown:", &[Value::SmallInt(1000)])
        .unwrap();
    assert_eq!(result, Value::SmallInt(0));
}

#[test]
fn this_context_answers_the_activation() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "Reflector", 0);
    let method = CompiledMethodBuilder::new().bytes(&[137, 124]).build();
    install(&mut vm, class, "grabContext", method);

    let receiver = instance(&mut vm, class);
    let context = vm.perform(receiver, "grabContext", &[]).unwrap();
    let context = context.as_object().expect("a context object");
    assert_eq!(vm.space.heap.class_of(context), vm.space.classes.method_context);
    // The frame has returned: sentinel pc, broken sender.
    let ctx = shrew_vm_core::Context::from_ref(context);
    assert!(ctx.is_returned(&vm.space));
    assert_eq!(ctx.sender(&vm.space), None);
}

#[test]
fn super_sends_start_above_the_compiled_in_class() {
    let mut vm = Vm::headless();
    let parent = test_class(&mut vm, "Parent", 0);
    let child = vm
        .space
        .create_class("Child", Value::Object(parent), InstanceSpec::fixed(0));

    let parent_tag = CompiledMethodBuilder::new().bytes(&[118, 124]).build();
    install(&mut vm, parent, "tag", parent_tag);
    let child_tag = CompiledMethodBuilder::new().bytes(&[119, 124]).build();
    install(&mut vm, child, "tag", child_tag);

    // superTag  ^ super tag
    let mut builder = CompiledMethodBuilder::new();
    let tag = vm.space.symbol("tag");
    builder.literal(Value::Object(tag));
    let super_tag = builder.bytes(&[112, 133, 0, 124]).build();
    install(&mut vm, child, "superTag", super_tag);

    let receiver = instance(&mut vm, child);
    assert_eq!(vm.perform(receiver, "tag", &[]).unwrap(), Value::SmallInt(2));
    assert_eq!(
        vm.perform(receiver, "superTag", &[]).unwrap(),
        Value::SmallInt(1)
    );
}

#[test]
fn escaped_closure_without_return_still_evaluates() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "BlockMaker", 0);
    // ^ [7]
    let mut builder = CompiledMethodBuilder::new();
    builder.literal(Value::SmallInt(7));
    let method = builder.bytes(&[143, 0, 0, 2, 32, 125, 124]).build();
    install(&mut vm, class, "makeBlock", method);

    let receiver = instance(&mut vm, class);
    let block = vm.perform(receiver, "makeBlock", &[]).unwrap();
    assert_eq!(vm.perform(block, "value", &[]).unwrap(), Value::SmallInt(7));
    // Wrong argument count fails the primitive and lands in the nil body.
    let result = vm.perform(block, "value:", &[Value::SmallInt(1)]).unwrap();
    assert_eq!(result, vm.space.nil());
}

#[test]
fn closure_arguments_precede_copied_values() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "Adder", 1);
    // x := 30. ^ [:a | x + a] value: 12
    let mut builder = CompiledMethodBuilder::new();
    builder.literal(Value::SmallInt(30));
    builder.literal(Value::SmallInt(12));
    let method = builder
        .bytes(&[
            32, 96, // x := 30
            143, 0x01, 0, 4, // [:a | x + a]
            0, 16, 176, 125, //
            33, 202, // value: 12
            124, // return the sum
        ])
        .build();
    install(&mut vm, class, "addThrough", method);
    let receiver = instance(&mut vm, class);
    let result = vm.perform(receiver, "addThrough", &[]).unwrap();
    assert_eq!(result, Value::SmallInt(42));
}

#[test]
fn must_be_boolean_send_on_non_boolean_condition() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "Confused", 0);
    // A conditional jump over a small integer.
    let method = CompiledMethodBuilder::new().bytes(&[118, 152, 115, 124]).build();
    install(&mut vm, class, "badJump", method);

    let receiver = instance(&mut vm, class);
    match vm.perform(receiver, "badJump", &[]) {
        Err(VmError::MissingSpecialMethod { selector, .. }) => {
            assert_eq!(selector, "mustBeBoolean");
        }
        other => panic!("expected the mustBeBoolean send to abort, got {other:?}"),
    }
}

#[test]
fn semaphore_signal_then_wait_completes_without_switching() {
    let mut vm = Vm::headless();
    let semaphore_class = Value::Object(vm.space.classes.semaphore);
    let semaphore = vm.perform(semaphore_class, "new", &[]).unwrap();
    assert_eq!(vm.perform(semaphore, "signal", &[]).unwrap(), semaphore);
    assert_eq!(vm.perform(semaphore, "wait", &[]).unwrap(), semaphore);
    // The excess signal was consumed.
    let excess = vm
        .space
        .heap
        .fetch(semaphore.as_object().unwrap(), 2)
        .unwrap();
    assert_eq!(excess, Value::SmallInt(0));
}

#[test]
fn array_scenario_stores_and_retrieves_strings() {
    let mut vm = Vm::headless();
    let array_class = Value::Object(vm.space.classes.array);
    let array = vm.perform(array_class, "new:", &[Value::SmallInt(3)]).unwrap();

    let names = ["a", "b", "c"];
    let mut stored = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let s = Value::Object(vm.space.wrap_string(name));
        stored.push(s);
        let result = vm
            .perform(array, "at:put:", &[Value::SmallInt(i as i64 + 1), s])
            .unwrap();
        assert_eq!(result, s);
    }
    for (i, &expected) in stored.iter().enumerate() {
        let result = vm.perform(array, "at:", &[Value::SmallInt(i as i64 + 1)]).unwrap();
        assert_eq!(result, expected);
    }
    // Out-of-range subscripts fail the primitive; the kernel fallback
    // answers nil.
    for index in [0, 4] {
        let result = vm.perform(array, "at:", &[Value::SmallInt(index)]).unwrap();
        assert_eq!(result, vm.space.nil());
    }
}

#[test]
fn become_send_swaps_identities_both_ways() {
    let mut vm = Vm::headless();
    let left = Value::Object(vm.space.wrap_string("left"));
    let right = Value::Object(vm.space.wrap_string("right"));
    let result = vm.perform(left, "become:", &[right]).unwrap();
    assert_eq!(result, left);
    // Every existing reference now denotes the other object.
    assert_eq!(vm.space.unwrap_string(left).unwrap(), "right");
    assert_eq!(vm.space.unwrap_string(right).unwrap(), "left");
    // Swapping again restores the original identities.
    vm.perform(left, "become:", &[right]).unwrap();
    assert_eq!(vm.space.unwrap_string(left).unwrap(), "left");
    // An immediate cannot take part; the kernel fallback answers nil.
    let result = vm.perform(left, "become:", &[Value::SmallInt(3)]).unwrap();
    assert_eq!(result, vm.space.nil());
}

#[test]
fn batch_become_sends_swap_and_forward_elements() {
    let mut vm = Vm::headless();
    let a = vm.space.wrap_string("a");
    let b = vm.space.wrap_string("b");
    let exchange = Value::Object(vm.space.wrap_list(vec![Value::Object(a)]));
    let with = Value::Object(vm.space.wrap_list(vec![Value::Object(b)]));
    vm.perform(exchange, "elementsExchangeIdentityWith:", &[with])
        .unwrap();
    assert_eq!(vm.space.unwrap_string(Value::Object(a)).unwrap(), "b");
    assert_eq!(vm.space.unwrap_string(Value::Object(b)).unwrap(), "a");

    let from = vm.space.wrap_string("from");
    let to = vm.space.wrap_string("to");
    let holder = vm.space.wrap_list(vec![Value::Object(from)]);
    let lefts = Value::Object(vm.space.wrap_list(vec![Value::Object(from)]));
    let rights = Value::Object(vm.space.wrap_list(vec![Value::Object(to)]));
    vm.perform(lefts, "elementsForwardIdentityTo:", &[rights])
        .unwrap();
    assert_eq!(vm.space.heap.fetch(holder, 0).unwrap(), Value::Object(to));
}

#[test]
fn perform_with_arguments_dispatches_dynamically() {
    let mut vm = Vm::headless();
    let plus = Value::Object(vm.space.symbol("+"));
    let args = Value::Object(vm.space.wrap_list(vec![Value::SmallInt(4)]));
    let result = vm
        .perform(Value::SmallInt(3), "perform:withArguments:", &[plus, args])
        .unwrap();
    assert_eq!(result, Value::SmallInt(7));
}

#[test]
fn method_dictionary_mutation_invalidates_lookup() {
    let mut vm = Vm::headless();
    let class = test_class(&mut vm, "Mutable", 0);
    let one = CompiledMethodBuilder::new().bytes(&[118, 124]).build();
    install(&mut vm, class, "answer", one);

    let receiver = instance(&mut vm, class);
    assert_eq!(vm.perform(receiver, "answer", &[]).unwrap(), Value::SmallInt(1));

    // Replace the method through the dictionary protocol; the next send
    // must see the new method even though the cache was warm.
    let two = CompiledMethodBuilder::new().bytes(&[119, 124]).build();
    let two = vm.space.heap.allocate(shrew_vm_heap::HeapObject::new(
        vm.space.classes.compiled_method,
        shrew_vm_heap::Body::Method(two),
    ));
    let dict = Value::Object(vm.space.method_dict_of(class).unwrap());
    let selector = Value::Object(vm.space.symbol("answer"));
    vm.perform(dict, "at:put:", &[selector, Value::Object(two)])
        .unwrap();
    assert_eq!(vm.perform(receiver, "answer", &[]).unwrap(), Value::SmallInt(2));
}

#[test]
fn float_sends_run_float_primitives() {
    let mut vm = Vm::headless();
    let a = vm.space.wrap_float(1.5);
    let b = vm.space.wrap_float(2.25);
    let sum = vm.perform(a, "+", &[b]).unwrap();
    assert_eq!(vm.space.unwrap_float(sum).unwrap(), 3.75);
    let less = vm.perform(a, "<", &[b]).unwrap();
    assert_eq!(less, vm.space.specials.bool_true);
    let truncated = vm.perform(b, "truncated", &[]).unwrap();
    assert_eq!(truncated, Value::SmallInt(2));
}

#[test]
fn host_hints_reach_the_host_services() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct BeepCounter {
        beeped: Arc<AtomicBool>,
    }
    impl HostServices for BeepCounter {
        fn beep(&mut self) {
            self.beeped.store(true, Ordering::Relaxed);
        }
    }

    let beeped = Arc::new(AtomicBool::new(false));
    let host = BeepCounter {
        beeped: Arc::clone(&beeped),
    };
    let mut vm = Vm::new(VmConfig::default(), Box::new(host));
    let method = CompiledMethodBuilder::new()
        .primitive(shrew_vm_core::primitives::BEEP)
        .bytes(&[115, 124])
        .build();
    vm.space
        .install_method(vm.space.classes.object, "beep", method)
        .unwrap();
    let receiver = Value::SmallInt(5);
    assert_eq!(vm.perform(receiver, "beep", &[]).unwrap(), receiver);
    assert!(beeped.load(Ordering::Relaxed));
}
