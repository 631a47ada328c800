//! The minimal method kernel
//!
//! Image loading is out of scope, so this module installs the handful of
//! methods the interpreter's fallback paths and the tests rely on: the
//! primitive-bound operators on integers, floats and collections, the
//! closure evaluation protocol, the unwind markers, and a hand-assembled
//! `to:do:`. Fallback bodies answer nil; a real image supplies richer
//! ones.

use shrew_vm_heap::{CompiledMethod, CompiledMethodBuilder, ObjRef, ObjectSpace};

use crate::method_cache::MethodCache;
use crate::primitives;

/// `<primitive fails> ^ nil`
const NIL_BODY: &[u8] = &[115, 124];
/// `^ self`
const SELF_BODY: &[u8] = &[112, 124];

fn primitive_method(primitive: u16, args: u8, body: &[u8]) -> CompiledMethod {
    CompiledMethodBuilder::new()
        .args(args)
        .primitive(primitive)
        .bytes(body)
        .build()
}

fn install_primitive(
    space: &mut ObjectSpace,
    class: ObjRef,
    selector: &str,
    primitive: u16,
    args: u8,
) {
    let method = primitive_method(primitive, args, NIL_BODY);
    space
        .install_method(class, selector, method)
        .expect("kernel class has a method dictionary");
}

fn install_body(space: &mut ObjectSpace, class: ObjRef, selector: &str, method: CompiledMethod) {
    space
        .install_method(class, selector, method)
        .expect("kernel class has a method dictionary");
}

/// `ensure: aBlock` — the marker primitive never runs; the body
/// evaluates the receiver, then the cleanup unless the unwind already
/// ran it.
///
/// ```text
/// temps: aBlock, complete, returnValue
/// pushReceiver; value; storePopTemp 2
/// pushTemp 1; pushNil; ==; jumpIfFalse +5
///   pushTrue; storePopTemp 1; pushTemp 0; value; pop
/// pushTemp 2; returnTop
/// ```
fn ensure_method() -> CompiledMethod {
    CompiledMethodBuilder::new()
        .args(1)
        .temps(3)
        .primitive(primitives::ENSURE_MARKER)
        .bytes(&[112, 201, 106, 17, 115, 198, 156, 113, 105, 16, 201, 135, 18, 124])
        .build()
}

/// `ifCurtailed: aBlock` — same marker; the body only notes completion,
/// so the cleanup runs exactly when the unwind does it.
fn if_curtailed_method() -> CompiledMethod {
    CompiledMethodBuilder::new()
        .args(1)
        .temps(3)
        .primitive(primitives::ENSURE_MARKER)
        .bytes(&[112, 201, 106, 113, 105, 18, 124])
        .build()
}

/// `to: stop do: aBlock` — the counting loop, with explicit jumps.
///
/// ```text
/// temps: stop, aBlock, i
/// pushReceiver; storePopTemp 2
/// loop: pushTemp 2; pushTemp 0; <=; longJumpIfFalse exit
///   pushTemp 1; pushTemp 2; value:; pop
///   pushTemp 2; push 1; +; storePopTemp 2; longJump loop
/// exit: returnReceiver
/// ```
fn to_do_method() -> CompiledMethod {
    CompiledMethodBuilder::new()
        .args(2)
        .temps(3)
        .bytes(&[
            112, 106, // i := self
            18, 16, 180, 172, 10, // [i <= stop] or exit
            17, 18, 202, 135, // aBlock value: i
            18, 118, 176, 106, // i := i + 1
            163, 241, // back to the test
            120, // ^ self
        ])
        .build()
}

/// `new` on classes: try the primitive, else `^ self new: 0`.
fn class_new_method() -> CompiledMethod {
    CompiledMethodBuilder::new()
        .primitive(primitives::NEW)
        .bytes(&[112, 117, 205, 124])
        .build()
}

/// Install the kernel methods and leave the cache cold.
pub fn install(space: &mut ObjectSpace, cache: &mut MethodCache) {
    let c = space.classes;

    // Object protocol
    install_primitive(space, c.object, "at:", primitives::AT, 1);
    install_primitive(space, c.object, "at:put:", primitives::AT_PUT, 2);
    install_primitive(space, c.object, "size", primitives::SIZE, 0);
    install_primitive(space, c.object, "==", primitives::EQUIVALENT, 1);
    install_primitive(space, c.object, "class", primitives::CLASS, 0);
    install_primitive(space, c.object, "identityHash", primitives::AS_OOP, 0);
    install_primitive(space, c.object, "hash", primitives::AS_OOP, 0);
    install_primitive(space, c.object, "instVarAt:", primitives::INST_VAR_AT, 1);
    install_primitive(space, c.object, "instVarAt:put:", primitives::INST_VAR_AT_PUT, 2);
    install_primitive(space, c.object, "shallowCopy", primitives::CLONE, 0);
    install_primitive(space, c.object, "become:", primitives::BECOME, 1);
    install_primitive(
        space,
        c.object,
        "elementsExchangeIdentityWith:",
        primitives::ARRAY_BECOME,
        1,
    );
    install_primitive(
        space,
        c.object,
        "elementsForwardIdentityTo:",
        primitives::ARRAY_BECOME_ONE_WAY,
        1,
    );
    install_primitive(
        space,
        c.object,
        "perform:withArguments:",
        primitives::PERFORM_WITH_ARGS,
        2,
    );
    install_body(
        space,
        c.object,
        "yourself",
        CompiledMethodBuilder::new().bytes(&[120]).build(),
    );
    install_body(
        space,
        c.object,
        "isNil",
        CompiledMethodBuilder::new().bytes(&[122]).build(),
    );
    install_body(
        space,
        c.object,
        "notNil",
        CompiledMethodBuilder::new().bytes(&[121]).build(),
    );
    install_body(
        space,
        c.undefined_object,
        "isNil",
        CompiledMethodBuilder::new().bytes(&[121]).build(),
    );
    install_body(
        space,
        c.undefined_object,
        "notNil",
        CompiledMethodBuilder::new().bytes(&[122]).build(),
    );
    install_body(
        space,
        c.true_class,
        "not",
        CompiledMethodBuilder::new().bytes(&[122]).build(),
    );
    install_body(
        space,
        c.false_class,
        "not",
        CompiledMethodBuilder::new().bytes(&[121]).build(),
    );

    // Class protocol
    install_body(space, c.class, "new", class_new_method());
    install_primitive(space, c.class, "new:", primitives::NEW_WITH_ARG, 1);
    install_primitive(space, c.class, "superclass", primitives::FIRST_INST_VAR, 0);
    install_primitive(space, c.class, "name", primitives::FIRST_INST_VAR + 3, 0);
    install_primitive(space, c.class, "someInstance", primitives::SOME_INSTANCE, 0);

    // SmallInteger protocol
    let int_ops: [(&str, u16); 17] = [
        ("+", primitives::ADD),
        ("-", primitives::SUBTRACT),
        ("*", primitives::MULTIPLY),
        ("/", primitives::DIVIDE),
        ("//", primitives::DIV),
        ("\\\\", primitives::MOD),
        ("quo:", primitives::QUO),
        ("<", primitives::LESS_THAN),
        (">", primitives::GREATER_THAN),
        ("<=", primitives::LESS_OR_EQUAL),
        (">=", primitives::GREATER_OR_EQUAL),
        ("=", primitives::EQUAL),
        ("~=", primitives::NOT_EQUAL),
        ("bitAnd:", primitives::BIT_AND),
        ("bitOr:", primitives::BIT_OR),
        ("bitXor:", primitives::BIT_XOR),
        ("bitShift:", primitives::BIT_SHIFT),
    ];
    for (selector, primitive) in int_ops {
        install_primitive(space, c.small_integer, selector, primitive, 1);
    }
    install_primitive(space, c.small_integer, "@", primitives::MAKE_POINT, 1);
    install_primitive(space, c.small_integer, "asFloat", primitives::SMALLINT_AS_FLOAT, 0);
    install_body(
        space,
        c.small_integer,
        "hash",
        CompiledMethodBuilder::new().bytes(SELF_BODY).build(),
    );
    install_body(space, c.small_integer, "to:do:", to_do_method());

    // Float protocol
    let float_ops: [(&str, u16); 10] = [
        ("+", primitives::FLOAT_ADD),
        ("-", primitives::FLOAT_SUBTRACT),
        ("*", primitives::FLOAT_MULTIPLY),
        ("/", primitives::FLOAT_DIVIDE),
        ("<", primitives::FLOAT_LESS_THAN),
        (">", primitives::FLOAT_GREATER_THAN),
        ("<=", primitives::FLOAT_LESS_OR_EQUAL),
        (">=", primitives::FLOAT_GREATER_OR_EQUAL),
        ("=", primitives::FLOAT_EQUAL),
        ("~=", primitives::FLOAT_NOT_EQUAL),
    ];
    for (selector, primitive) in float_ops {
        install_primitive(space, c.float, selector, primitive, 1);
    }
    install_primitive(space, c.float, "truncated", primitives::FLOAT_TRUNCATED, 0);
    install_primitive(space, c.float, "sqrt", primitives::FLOAT_SQUARE_ROOT, 0);
    install_primitive(space, c.float, "sin", primitives::FLOAT_SIN, 0);
    install_primitive(space, c.float, "arcTan", primitives::FLOAT_ARCTAN, 0);
    install_primitive(space, c.float, "ln", primitives::FLOAT_LOG_N, 0);
    install_primitive(space, c.float, "exp", primitives::FLOAT_EXP, 0);
    install_primitive(
        space,
        c.float,
        "timesTwoPower:",
        primitives::FLOAT_TIMES_TWO_POWER,
        1,
    );

    // ByteString protocol
    install_primitive(space, c.byte_string, "at:", primitives::STRING_AT, 1);
    install_primitive(space, c.byte_string, "at:put:", primitives::STRING_AT_PUT, 2);
    install_primitive(
        space,
        c.byte_string,
        "replaceFrom:to:with:startingAt:",
        primitives::STRING_REPLACE,
        4,
    );

    // BlockClosure protocol
    install_primitive(space, c.block_closure, "value", primitives::CLOSURE_VALUE, 0);
    install_primitive(space, c.block_closure, "value:", primitives::CLOSURE_VALUE_ARG, 1);
    install_primitive(space, c.block_closure, "value:value:", primitives::CLOSURE_VALUE_2, 2);
    install_primitive(
        space,
        c.block_closure,
        "value:value:value:",
        primitives::CLOSURE_VALUE_3,
        3,
    );
    install_primitive(
        space,
        c.block_closure,
        "value:value:value:value:",
        primitives::CLOSURE_VALUE_4,
        4,
    );
    install_primitive(
        space,
        c.block_closure,
        "valueWithArguments:",
        primitives::CLOSURE_VALUE_WITH_ARGS,
        1,
    );
    install_primitive(
        space,
        c.block_closure,
        "valueNoContextSwitch",
        primitives::CLOSURE_VALUE_NO_SWITCH,
        0,
    );
    install_primitive(
        space,
        c.block_closure,
        "valueNoContextSwitch:",
        primitives::CLOSURE_VALUE_NO_SWITCH_ARG,
        1,
    );
    install_primitive(space, c.block_closure, "numArgs", primitives::FIRST_INST_VAR + 2, 0);
    install_body(space, c.block_closure, "ensure:", ensure_method());
    install_body(space, c.block_closure, "ifCurtailed:", if_curtailed_method());

    // Old-style block contexts
    install_primitive(space, c.block_context, "value", primitives::VALUE, 0);
    install_primitive(space, c.block_context, "value:", primitives::VALUE, 1);
    install_primitive(
        space,
        c.block_context,
        "valueWithArguments:",
        primitives::VALUE_WITH_ARGS,
        1,
    );
    install_primitive(space, c.method_context, "blockCopy:", primitives::BLOCK_COPY, 1);
    install_primitive(space, c.block_context, "blockCopy:", primitives::BLOCK_COPY, 1);

    // Scheduling protocol
    install_primitive(space, c.semaphore, "signal", primitives::SIGNAL, 0);
    install_primitive(space, c.semaphore, "wait", primitives::WAIT, 0);
    install_primitive(space, c.process, "resume", primitives::RESUME, 0);
    install_primitive(space, c.process, "suspend", primitives::SUSPEND, 0);
    install_primitive(space, c.process, "priority", primitives::FIRST_INST_VAR + 2, 0);

    // CompiledMethod protocol
    install_primitive(space, c.compiled_method, "objectAt:", primitives::OBJECT_AT, 1);
    install_primitive(space, c.compiled_method, "objectAt:put:", primitives::OBJECT_AT_PUT, 2);
    install_primitive(
        space,
        c.compiled_method,
        "flushCache",
        primitives::COMPILED_METHOD_FLUSH_CACHE,
        0,
    );

    // Anything the installs above could have cached is gone.
    cache.flush_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method_cache::walk_hierarchy;

    #[test]
    fn kernel_installs_core_protocol() {
        let mut space = ObjectSpace::new();
        let mut cache = MethodCache::new();
        install(&mut space, &mut cache);

        for (class, selector) in [
            (space.classes.object, "at:"),
            (space.classes.object, "become:"),
            (space.classes.object, "elementsExchangeIdentityWith:"),
            (space.classes.object, "elementsForwardIdentityTo:"),
            (space.classes.small_integer, "+"),
            (space.classes.small_integer, "to:do:"),
            (space.classes.float, "sqrt"),
            (space.classes.block_closure, "ensure:"),
            (space.classes.semaphore, "wait"),
        ] {
            let selector = space.symbol(selector);
            assert!(
                walk_hierarchy(&space, class, selector).is_ok(),
                "missing kernel method"
            );
        }
    }

    #[test]
    fn inherited_lookup_through_kernel() {
        let mut space = ObjectSpace::new();
        let mut cache = MethodCache::new();
        install(&mut space, &mut cache);
        // Array inherits at: from Object.
        let selector = space.symbol("at:");
        assert!(walk_hierarchy(&space, space.classes.array, selector).is_ok());
    }

    #[test]
    fn ensure_marker_is_declared() {
        let method = ensure_method();
        assert_eq!(method.primitive, primitives::ENSURE_MARKER);
        assert_eq!(method.arg_count, 1);
        assert_eq!(method.temp_count, 3);
    }
}
