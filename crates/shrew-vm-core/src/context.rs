//! Activation records
//!
//! Contexts are first-class heap objects of class `MethodContext` or
//! `BlockContext`. Both share the first three slots (sender, pc, stackp);
//! method contexts add method, closure-or-nil and receiver, block contexts
//! add argument count, initial pc and home. The variable tail holds the
//! temporaries followed by the evaluation stack; `stackp` counts the used
//! tail slots.
//!
//! A terminated context has its pc set to the nil sentinel and its sender
//! broken to nil, which also keeps the context graph acyclic once frames
//! are dead.

use shrew_vm_heap::space::closure_slot;
use shrew_vm_heap::{HeapResult, ObjRef, ObjectSpace, Value};

/// Slot indices shared by both context classes, and the per-class extras.
pub mod ctx_slot {
    /// Sender context, or nil.
    pub const SENDER: usize = 0;
    /// Program counter into the method's byte body; nil once returned.
    pub const PC: usize = 1;
    /// Count of used variable-tail slots (temporaries plus stack).
    pub const STACKP: usize = 2;
    /// Method context: the compiled method.
    pub const METHOD: usize = 3;
    /// Method context: the activated closure, or nil.
    pub const CLOSURE: usize = 4;
    /// Method context: the receiver.
    pub const RECEIVER: usize = 5;
    /// Block context: expected argument count.
    pub const BLOCK_ARG_COUNT: usize = 3;
    /// Block context: pc of the block body.
    pub const BLOCK_INITIAL_PC: usize = 4;
    /// Block context: the enclosing method context.
    pub const BLOCK_HOME: usize = 5;
    /// Fixed slots before the temporaries in either class.
    pub const TEMP_BASE: usize = 6;
}

/// Bound on home-context chains, against cyclic closure graphs.
const MAX_HOME_DEPTH: usize = 1024;

/// Handle to a context object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context(ObjRef);

impl Context {
    /// Wrap an existing context object.
    pub fn from_ref(r: ObjRef) -> Context {
        Context(r)
    }

    /// The underlying heap handle.
    #[inline]
    pub fn handle(self) -> ObjRef {
        self.0
    }

    /// The context as a pushable value.
    #[inline]
    pub fn value(self) -> Value {
        Value::Object(self.0)
    }

    /// Whether this is an old-style block context.
    pub fn is_block_context(self, space: &ObjectSpace) -> bool {
        space.heap.class_of(self.0) == space.classes.block_context
    }

    // ==================== Linkage ====================

    /// The sender, or `None` for nil or a broken link.
    pub fn sender(self, space: &ObjectSpace) -> Option<Context> {
        let v = space.heap.fetch(self.0, ctx_slot::SENDER).ok()?;
        if space.is_nil(v) {
            return None;
        }
        v.as_object().map(Context)
    }

    /// Re-link the sender.
    pub fn set_sender(self, space: &mut ObjectSpace, sender: Value) {
        let _ = space.heap.store(self.0, ctx_slot::SENDER, sender);
    }

    /// Current pc, or `None` once the context has returned.
    pub fn pc(self, space: &ObjectSpace) -> Option<usize> {
        let v = space.heap.fetch(self.0, ctx_slot::PC).ok()?;
        usize::try_from(v.as_small_int()?).ok()
    }

    /// Write the pc back to the heap slot.
    pub fn store_pc(self, space: &mut ObjectSpace, pc: usize) {
        let _ = space
            .heap
            .store(self.0, ctx_slot::PC, Value::SmallInt(pc as i64));
    }

    /// Whether the pc carries the returned sentinel.
    pub fn is_returned(self, space: &ObjectSpace) -> bool {
        self.pc(space).is_none()
    }

    /// Terminate: sentinel pc, broken sender.
    pub fn mark_returned(self, space: &mut ObjectSpace) {
        let nil = space.nil();
        let _ = space.heap.store(self.0, ctx_slot::PC, nil);
        let _ = space.heap.store(self.0, ctx_slot::SENDER, nil);
    }

    // ==================== Stack ====================

    /// Count of used variable-tail slots.
    pub fn stackp(self, space: &ObjectSpace) -> usize {
        space
            .heap
            .fetch(self.0, ctx_slot::STACKP)
            .ok()
            .and_then(|v| v.as_small_int())
            .and_then(|i| usize::try_from(i).ok())
            .unwrap_or(0)
    }

    /// Set the used-slot count.
    pub fn set_stackp(self, space: &mut ObjectSpace, stackp: usize) {
        let _ = space
            .heap
            .store(self.0, ctx_slot::STACKP, Value::SmallInt(stackp as i64));
    }

    /// Push onto the evaluation stack.
    pub fn push(self, space: &mut ObjectSpace, value: Value) {
        let sp = self.stackp(space);
        let _ = space.heap.store(self.0, ctx_slot::TEMP_BASE + sp, value);
        self.set_stackp(space, sp + 1);
    }

    /// Push several values, first first.
    pub fn push_all(self, space: &mut ObjectSpace, values: &[Value]) {
        for &v in values {
            self.push(space, v);
        }
    }

    /// Pop the top of stack.
    pub fn pop(self, space: &mut ObjectSpace) -> Value {
        let sp = self.stackp(space);
        if sp == 0 {
            return space.nil();
        }
        let v = space
            .heap
            .fetch(self.0, ctx_slot::TEMP_BASE + sp - 1)
            .unwrap_or_else(|_| space.nil());
        self.set_stackp(space, sp - 1);
        v
    }

    /// The top of stack, undisturbed.
    pub fn top(self, space: &ObjectSpace) -> Value {
        self.peek(space, 0)
    }

    /// The value `depth` slots below the top.
    pub fn peek(self, space: &ObjectSpace, depth: usize) -> Value {
        let sp = self.stackp(space);
        if depth + 1 > sp {
            return space.nil();
        }
        space
            .heap
            .fetch(self.0, ctx_slot::TEMP_BASE + sp - 1 - depth)
            .unwrap_or_else(|_| space.nil())
    }

    /// Drop `n` values.
    pub fn pop_n(self, space: &mut ObjectSpace, n: usize) {
        let sp = self.stackp(space);
        self.set_stackp(space, sp.saturating_sub(n));
    }

    /// Pop `n` values, returned in push order.
    pub fn pop_and_return_n(self, space: &mut ObjectSpace, n: usize) -> Vec<Value> {
        let mut values = Vec::with_capacity(n);
        for depth in (0..n).rev() {
            values.push(self.peek(space, depth));
        }
        self.pop_n(space, n);
        values
    }

    /// Reset the stack of a block context to empty.
    pub fn reset_stack(self, space: &mut ObjectSpace) {
        self.set_stackp(space, 0);
    }

    // ==================== Temporaries ====================

    /// Read temporary `index`; block contexts delegate to their home.
    pub fn temp(self, space: &ObjectSpace, index: usize) -> Value {
        if self.is_block_context(space) {
            match self.home(space) {
                Some(home) => home.temp(space, index),
                None => space.nil(),
            }
        } else {
            space
                .heap
                .fetch(self.0, ctx_slot::TEMP_BASE + index)
                .unwrap_or_else(|_| space.nil())
        }
    }

    /// Write temporary `index`; block contexts delegate to their home.
    pub fn set_temp(self, space: &mut ObjectSpace, index: usize, value: Value) {
        if self.is_block_context(space) {
            if let Some(home) = self.home(space) {
                home.set_temp(space, index, value);
            }
        } else {
            let _ = space
                .heap
                .store(self.0, ctx_slot::TEMP_BASE + index, value);
        }
    }

    // ==================== Method, receiver, home ====================

    /// The compiled method this context executes (the home method for
    /// blocks and closure activations).
    pub fn method(self, space: &ObjectSpace) -> Option<ObjRef> {
        if self.is_block_context(space) {
            return self.home(space)?.method(space);
        }
        space
            .heap
            .fetch(self.0, ctx_slot::METHOD)
            .ok()?
            .as_object()
    }

    /// The receiver (the home receiver for blocks).
    pub fn receiver(self, space: &ObjectSpace) -> Value {
        if self.is_block_context(space) {
            return match self.home(space) {
                Some(home) => home.receiver(space),
                None => space.nil(),
            };
        }
        space
            .heap
            .fetch(self.0, ctx_slot::RECEIVER)
            .unwrap_or_else(|_| space.nil())
    }

    /// The closure being run, or nil for plain method activations.
    pub fn closure(self, space: &ObjectSpace) -> Value {
        if self.is_block_context(space) {
            return space.nil();
        }
        space
            .heap
            .fetch(self.0, ctx_slot::CLOSURE)
            .unwrap_or_else(|_| space.nil())
    }

    /// The home method context: the target of `^` from here.
    ///
    /// Follows block-home links and closure outer chains; answers `None`
    /// on a malformed or cyclic graph.
    pub fn home(self, space: &ObjectSpace) -> Option<Context> {
        let mut current = self;
        for _ in 0..MAX_HOME_DEPTH {
            if current.is_block_context(space) {
                let home = space.heap.fetch(current.0, ctx_slot::BLOCK_HOME).ok()?;
                current = Context(home.as_object()?);
                continue;
            }
            let closure = space.heap.fetch(current.0, ctx_slot::CLOSURE).ok()?;
            if space.is_nil(closure) {
                return Some(current);
            }
            let outer = space
                .heap
                .fetch(closure.as_object()?, closure_slot::OUTER_CONTEXT)
                .ok()?;
            current = Context(outer.as_object()?);
        }
        None
    }

    // ==================== Frame creation ====================

    /// Activate `method` on `receiver` with `args`, linked to `sender`.
    pub fn new_method_frame(
        space: &mut ObjectSpace,
        method: ObjRef,
        receiver: Value,
        args: &[Value],
        sender: Value,
    ) -> HeapResult<Context> {
        let (temp_count, frame_size) = {
            let m = space.method(method)?;
            (usize::from(m.temp_count), m.frame_size())
        };
        let temp_count = temp_count.max(args.len());
        let nil = space.nil();
        let mut slots = vec![nil; ctx_slot::TEMP_BASE + temp_count + frame_size];
        slots[ctx_slot::SENDER] = sender;
        slots[ctx_slot::PC] = Value::SmallInt(0);
        slots[ctx_slot::STACKP] = Value::SmallInt(temp_count as i64);
        slots[ctx_slot::METHOD] = Value::Object(method);
        slots[ctx_slot::RECEIVER] = receiver;
        slots[ctx_slot::TEMP_BASE..ctx_slot::TEMP_BASE + args.len()].copy_from_slice(args);
        let class = space.classes.method_context;
        let r = space.heap.allocate(shrew_vm_heap::HeapObject::new(
            class,
            shrew_vm_heap::Body::Pointers(slots),
        ));
        Ok(Context(r))
    }

    /// Activate `closure` with `args`, linked to `sender`.
    ///
    /// The frame runs the enclosing method from the closure's start pc;
    /// its initial stack is the arguments followed by the copied values.
    pub fn new_closure_frame(
        space: &mut ObjectSpace,
        closure: ObjRef,
        args: &[Value],
        sender: Value,
    ) -> HeapResult<Context> {
        let outer = Context(
            space
                .heap
                .fetch(closure, closure_slot::OUTER_CONTEXT)?
                .require_object()?,
        );
        let start_pc = space
            .heap
            .fetch(closure, closure_slot::START_PC)?
            .as_small_int()
            .and_then(|i| usize::try_from(i).ok())
            .ok_or(shrew_vm_heap::HeapError::UnexpectedType)?;
        let method = outer
            .method(space)
            .ok_or(shrew_vm_heap::HeapError::UnexpectedType)?;
        let receiver = outer.receiver(space);
        let copied_count = space.indexed_size(closure)?;
        let frame_size = space.method(method)?.frame_size();

        let nil = space.nil();
        let initial = args.len() + copied_count;
        let mut slots = vec![nil; ctx_slot::TEMP_BASE + initial + frame_size];
        slots[ctx_slot::SENDER] = sender;
        slots[ctx_slot::PC] = Value::SmallInt(start_pc as i64);
        slots[ctx_slot::STACKP] = Value::SmallInt(initial as i64);
        slots[ctx_slot::METHOD] = Value::Object(method);
        slots[ctx_slot::CLOSURE] = Value::Object(closure);
        slots[ctx_slot::RECEIVER] = receiver;
        slots[ctx_slot::TEMP_BASE..ctx_slot::TEMP_BASE + args.len()].copy_from_slice(args);
        for i in 0..copied_count {
            slots[ctx_slot::TEMP_BASE + args.len() + i] = space.indexed_at(closure, i)?;
        }
        let class = space.classes.method_context;
        let r = space.heap.allocate(shrew_vm_heap::HeapObject::new(
            class,
            shrew_vm_heap::Body::Pointers(slots),
        ));
        Ok(Context(r))
    }

    /// Create an old-style block context over `home` (the `blockCopy:`
    /// protocol). The stack starts empty; `value` fills in arguments and
    /// the sender at activation time.
    pub fn new_block_context(
        space: &mut ObjectSpace,
        home: Context,
        arg_count: usize,
        initial_pc: usize,
    ) -> HeapResult<Context> {
        let frame_size = match home.method(space) {
            Some(method) => space.method(method)?.frame_size(),
            None => shrew_vm_bytecode::header::SMALL_FRAME_SIZE,
        };
        let nil = space.nil();
        let mut slots = vec![nil; ctx_slot::TEMP_BASE + frame_size];
        slots[ctx_slot::PC] = Value::SmallInt(initial_pc as i64);
        slots[ctx_slot::STACKP] = Value::SmallInt(0);
        slots[ctx_slot::BLOCK_ARG_COUNT] = Value::SmallInt(arg_count as i64);
        slots[ctx_slot::BLOCK_INITIAL_PC] = Value::SmallInt(initial_pc as i64);
        slots[ctx_slot::BLOCK_HOME] = home.value();
        let class = space.classes.block_context;
        let r = space.heap.allocate(shrew_vm_heap::HeapObject::new(
            class,
            shrew_vm_heap::Body::Pointers(slots),
        ));
        Ok(Context(r))
    }

    /// Expected argument count of an old-style block context.
    pub fn block_arg_count(self, space: &ObjectSpace) -> usize {
        space
            .heap
            .fetch(self.0, ctx_slot::BLOCK_ARG_COUNT)
            .ok()
            .and_then(|v| v.as_small_int())
            .and_then(|i| usize::try_from(i).ok())
            .unwrap_or(0)
    }

    /// Initial pc of an old-style block context.
    pub fn block_initial_pc(self, space: &ObjectSpace) -> usize {
        space
            .heap
            .fetch(self.0, ctx_slot::BLOCK_INITIAL_PC)
            .ok()
            .and_then(|v| v.as_small_int())
            .and_then(|i| usize::try_from(i).ok())
            .unwrap_or(0)
    }

    // ==================== Diagnostics ====================

    /// One line per frame, newest first.
    pub fn print_stack(self, space: &ObjectSpace) -> String {
        let mut out = String::new();
        let mut current = Some(self);
        let mut depth = 0;
        while let Some(c) = current {
            if depth > 64 {
                out.push_str("  ...\n");
                break;
            }
            let class = space.class_of(c.receiver(space));
            let kind = if c.is_block_context(space) {
                "[] in "
            } else if !space.is_nil(c.closure(space)) {
                "[closure] in "
            } else {
                ""
            };
            out.push_str(&format!(
                "  {}{} (pc {:?})\n",
                kind,
                space.class_name(class),
                c.pc(space)
            ));
            current = c.sender(space);
            depth += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrew_vm_heap::CompiledMethodBuilder;

    fn frame(space: &mut ObjectSpace) -> Context {
        let method = CompiledMethodBuilder::new().temps(2).bytes(&[112, 124]).build();
        let method = space.heap.allocate(shrew_vm_heap::HeapObject::new(
            space.classes.compiled_method,
            shrew_vm_heap::Body::Method(method),
        ));
        let nil = space.nil();
        Context::new_method_frame(space, method, Value::SmallInt(5), &[], nil).unwrap()
    }

    #[test]
    fn push_pop_discipline() {
        let mut space = ObjectSpace::new();
        let ctx = frame(&mut space);
        // stackp starts at the temp count
        assert_eq!(ctx.stackp(&space), 2);
        ctx.push(&mut space, Value::SmallInt(1));
        ctx.push(&mut space, Value::SmallInt(2));
        assert_eq!(ctx.top(&space), Value::SmallInt(2));
        assert_eq!(ctx.peek(&space, 1), Value::SmallInt(1));
        assert_eq!(ctx.pop(&mut space), Value::SmallInt(2));
        assert_eq!(ctx.stackp(&space), 3);
    }

    #[test]
    fn pop_and_return_preserves_push_order() {
        let mut space = ObjectSpace::new();
        let ctx = frame(&mut space);
        ctx.push_all(
            &mut space,
            &[Value::SmallInt(1), Value::SmallInt(2), Value::SmallInt(3)],
        );
        let popped = ctx.pop_and_return_n(&mut space, 3);
        assert_eq!(
            popped,
            vec![Value::SmallInt(1), Value::SmallInt(2), Value::SmallInt(3)]
        );
    }

    #[test]
    fn mark_returned_breaks_links() {
        let mut space = ObjectSpace::new();
        let a = frame(&mut space);
        let b = frame(&mut space);
        b.set_sender(&mut space, a.value());
        assert_eq!(b.sender(&space), Some(a));
        b.mark_returned(&mut space);
        assert!(b.is_returned(&space));
        assert_eq!(b.sender(&space), None);
    }

    #[test]
    fn home_of_plain_method_is_itself() {
        let mut space = ObjectSpace::new();
        let ctx = frame(&mut space);
        assert_eq!(ctx.home(&space), Some(ctx));
    }

    #[test]
    fn closure_frame_stacks_args_then_copied() {
        let mut space = ObjectSpace::new();
        let outer = frame(&mut space);
        let closure = space.new_closure(
            outer.value(),
            7,
            1,
            vec![Value::SmallInt(40), Value::SmallInt(41)],
        );
        let nil = space.nil();
        let activation =
            Context::new_closure_frame(&mut space, closure, &[Value::SmallInt(9)], nil).unwrap();
        assert_eq!(activation.pc(&space), Some(7));
        assert_eq!(activation.stackp(&space), 3);
        assert_eq!(activation.temp(&space, 0), Value::SmallInt(9));
        assert_eq!(activation.temp(&space, 1), Value::SmallInt(40));
        assert_eq!(activation.temp(&space, 2), Value::SmallInt(41));
        assert_eq!(activation.receiver(&space), Value::SmallInt(5));
        assert_eq!(activation.home(&space), Some(outer));
    }
}
