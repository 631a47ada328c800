//! The bytecode interpreter
//!
//! One `step` fetches, decodes and executes a single bytecode of the
//! active context. The pc lives in a host local while a context runs and
//! is written back whenever a control-flow event leaves the loop, before
//! a primitive that reads it, and at every send (which exposes the frame
//! through its sender link).
//!
//! Sends recurse through [`Vm::stack_frame`]; the configured depth bound
//! turns runaway recursion into the stack-overflow event, which re-enters
//! the offending frame from the top loop with a fresh host stack.

use tracing::trace;

use shrew_vm_bytecode::{ArithmeticSend, Opcode, PushedConstant, SpecialSend, opcode_info};
use shrew_vm_heap::space::{association_slot, message_slot};
use shrew_vm_heap::{HeapError, ObjRef, Value};

use crate::context::Context;
use crate::error::{StepResult, VmError, VmEvent};
use crate::method_cache::MethodNotFound;
use crate::primitives::{self, PrimOutcome, PrimitiveCode};
use crate::vm::Vm;

/// How a primitive attempt ended, as seen by the send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrimCall {
    /// The send is complete (result pushed or frame run)
    Done,
    /// The stack is untouched; run the fallback body
    Failed,
}

fn corrupt(error: HeapError) -> VmEvent {
    VmEvent::Abort(VmError::CorruptObject(error))
}

const fn arithmetic_primitive(op: ArithmeticSend) -> u16 {
    match op {
        ArithmeticSend::Add => primitives::ADD,
        ArithmeticSend::Subtract => primitives::SUBTRACT,
        ArithmeticSend::LessThan => primitives::LESS_THAN,
        ArithmeticSend::GreaterThan => primitives::GREATER_THAN,
        ArithmeticSend::LessOrEqual => primitives::LESS_OR_EQUAL,
        ArithmeticSend::GreaterOrEqual => primitives::GREATER_OR_EQUAL,
        ArithmeticSend::Equal => primitives::EQUAL,
        ArithmeticSend::NotEqual => primitives::NOT_EQUAL,
        ArithmeticSend::Multiply => primitives::MULTIPLY,
        ArithmeticSend::Divide => primitives::DIVIDE,
        ArithmeticSend::Mod => primitives::MOD,
        ArithmeticSend::MakePoint => primitives::MAKE_POINT,
        ArithmeticSend::BitShift => primitives::BIT_SHIFT,
        ArithmeticSend::Div => primitives::DIV,
        ArithmeticSend::BitAnd => primitives::BIT_AND,
        ArithmeticSend::BitOr => primitives::BIT_OR,
    }
}

impl Vm {
    // ==================== Nested frame execution ====================

    /// Run `frame` to an event, guarding the activation depth.
    pub(crate) fn stack_frame(&mut self, frame: Context, may_context_switch: bool) -> VmEvent {
        if self.current_depth >= self.config.max_stack_depth {
            return VmEvent::StackOverflow {
                context: frame.handle(),
            };
        }
        self.current_depth += 1;
        let event = self.loop_bytecodes(frame, may_context_switch);
        self.current_depth -= 1;
        event
    }

    /// Execute `ctx` until a control-flow event leaves it.
    pub(crate) fn loop_bytecodes(&mut self, ctx: Context, may_context_switch: bool) -> VmEvent {
        if may_context_switch
            && let Err(event) = self.quick_check_for_interrupt(ctx, 1)
        {
            return event;
        }
        let Some(mut pc) = ctx.pc(&self.space) else {
            return corrupt(HeapError::UnexpectedType);
        };
        loop {
            let old_pc = pc;
            match self.step(ctx, &mut pc) {
                Ok(()) => {
                    // A back-branch implies an interrupt check.
                    if pc < old_pc
                        && let Err(event) = self.quick_check_for_interrupt(ctx, 1)
                    {
                        ctx.store_pc(&mut self.space, pc);
                        return event;
                    }
                }
                Err(VmEvent::Return { target, value }) if target == ctx.handle() => {
                    ctx.push(&mut self.space, value);
                }
                Err(event) => {
                    // Write the virtual pc back before the frame becomes
                    // visible to whoever handles the event.
                    ctx.store_pc(&mut self.space, pc);
                    if matches!(event, VmEvent::Return { .. })
                        && let Err(replacement) = self.activate_unwind_context(ctx)
                    {
                        return replacement;
                    }
                    return event;
                }
            }
        }
    }

    /// Run the cleanup of an `ensure:`/`ifCurtailed:` marker frame being
    /// unwound, then terminate the frame.
    pub(crate) fn activate_unwind_context(&mut self, ctx: Context) -> Result<(), VmEvent> {
        let is_marker = !ctx.is_block_context(&self.space)
            && self.space.is_nil(ctx.closure(&self.space))
            && ctx
                .method(&self.space)
                .and_then(|m| self.space.method(m).ok())
                .is_some_and(|m| m.primitive == primitives::ENSURE_MARKER);
        if !is_marker {
            ctx.mark_returned(&mut self.space);
            return Ok(());
        }
        // The temp after the argument is the has-run flag, shared by
        // ensure: and ifCurtailed:.
        if !self.space.is_nil(ctx.temp(&self.space, 1)) {
            ctx.mark_returned(&mut self.space);
            return Ok(());
        }
        let marker = self.space.specials.bool_true;
        ctx.set_temp(&mut self.space, 1, marker);
        let cleanup = ctx.temp(&self.space, 0);
        let result = self.call_block_for_unwind(ctx, cleanup);
        ctx.mark_returned(&mut self.space);
        result
    }

    /// Run a zero-argument block on behalf of an unwinding frame.
    fn call_block_for_unwind(&mut self, ctx: Context, block: Value) -> Result<(), VmEvent> {
        let Some(block_ref) = block.as_object() else {
            return Ok(());
        };
        let class = self.space.heap.class_of(block_ref);
        let frame = if class == self.space.classes.block_closure {
            Context::new_closure_frame(&mut self.space, block_ref, &[], ctx.value())
                .map_err(corrupt)?
        } else if class == self.space.classes.block_context {
            let block_ctx = Context::from_ref(block_ref);
            let initial = block_ctx.block_initial_pc(&self.space);
            block_ctx.reset_stack(&mut self.space);
            block_ctx.store_pc(&mut self.space, initial);
            block_ctx.set_sender(&mut self.space, ctx.value());
            block_ctx
        } else {
            return Ok(());
        };
        match self.stack_frame(frame, true) {
            VmEvent::Return { target, value } if target == ctx.handle() => {
                ctx.push(&mut self.space, value);
                Ok(())
            }
            event => Err(event),
        }
    }

    // ==================== Fetch and decode ====================

    fn method_byte(&self, ctx: Context, pc: usize) -> Result<u8, VmEvent> {
        let method = ctx
            .method(&self.space)
            .ok_or_else(|| corrupt(HeapError::UnexpectedType))?;
        self.space
            .method(method)
            .map_err(corrupt)?
            .bytes
            .get(pc)
            .copied()
            .ok_or_else(|| corrupt(HeapError::OutOfBounds))
    }

    fn method_literal(&self, ctx: Context, index: usize) -> Result<Value, VmEvent> {
        let method = ctx
            .method(&self.space)
            .ok_or_else(|| corrupt(HeapError::UnexpectedType))?;
        self.space
            .method(method)
            .and_then(|m| m.literal(index))
            .map_err(corrupt)
    }

    /// Execute one bytecode. `pc` enters pointing at the opcode and
    /// leaves pointing at the next instruction.
    pub(crate) fn step(&mut self, ctx: Context, pc: &mut usize) -> StepResult {
        let opcode_pc = *pc;
        let byte = self.method_byte(ctx, *pc)?;
        *pc += 1;
        let info = opcode_info(byte);
        let mut params = [0u8; 3];
        for slot in params.iter_mut().take(usize::from(info.parameter_bytes)) {
            *slot = self.method_byte(ctx, *pc)?;
            *pc += 1;
        }
        trace!(pc = opcode_pc, opcode = info.name, "step");

        match Opcode::decode(byte) {
            // ==================== Pushes and stores ====================
            Opcode::PushReceiverVariable(index) => {
                let value = self.receiver_variable(ctx, usize::from(index))?;
                ctx.push(&mut self.space, value);
                Ok(())
            }
            Opcode::PushTemporaryVariable(index) => {
                let value = ctx.temp(&self.space, usize::from(index));
                ctx.push(&mut self.space, value);
                Ok(())
            }
            Opcode::PushLiteralConstant(index) => {
                let value = self.method_literal(ctx, usize::from(index))?;
                ctx.push(&mut self.space, value);
                Ok(())
            }
            Opcode::PushLiteralVariable(index) => {
                let value = self.literal_variable_value(ctx, usize::from(index))?;
                ctx.push(&mut self.space, value);
                Ok(())
            }
            Opcode::StorePopReceiverVariable(index) => {
                let value = ctx.pop(&mut self.space);
                self.store_receiver_variable(ctx, usize::from(index), value)
            }
            Opcode::StorePopTemporaryVariable(index) => {
                let value = ctx.pop(&mut self.space);
                ctx.set_temp(&mut self.space, usize::from(index), value);
                Ok(())
            }
            Opcode::PushReceiver => {
                let value = ctx.receiver(&self.space);
                ctx.push(&mut self.space, value);
                Ok(())
            }
            Opcode::PushConstant(constant) => {
                let value = self.pushed_constant(constant);
                ctx.push(&mut self.space, value);
                Ok(())
            }

            // ==================== Returns ====================
            Opcode::ReturnReceiver => {
                let value = ctx.receiver(&self.space);
                self.method_return(ctx, value)
            }
            Opcode::ReturnTrue => self.method_return(ctx, self.space.specials.bool_true),
            Opcode::ReturnFalse => self.method_return(ctx, self.space.specials.bool_false),
            Opcode::ReturnNil => {
                let nil = self.space.nil();
                self.method_return(ctx, nil)
            }
            Opcode::ReturnTopFromMethod => {
                let value = ctx.pop(&mut self.space);
                self.method_return(ctx, value)
            }
            Opcode::ReturnTopFromBlock => {
                let value = ctx.pop(&mut self.space);
                match ctx.sender(&self.space) {
                    None => Err(VmEvent::TopLevelReturn { value }),
                    Some(target) => Err(VmEvent::Return {
                        target: target.handle(),
                        value,
                    }),
                }
            }

            // ==================== Extended access ====================
            Opcode::ExtendedPush => self.extended_push(ctx, params[0]),
            Opcode::ExtendedStore => self.extended_store(ctx, params[0], false),
            Opcode::ExtendedStorePop => self.extended_store(ctx, params[0], true),
            Opcode::DoubleExtendedDoAnything => {
                self.double_extended_do_anything(ctx, *pc, params[0], params[1])
            }

            // ==================== Sends ====================
            Opcode::SingleExtendedSend => {
                let selector = self.selector_literal(ctx, usize::from(params[0] & 31))?;
                self.send_to_self(ctx, *pc, selector, usize::from(params[0] >> 5))
            }
            Opcode::SingleExtendedSuper => {
                let selector = self.selector_literal(ctx, usize::from(params[0] & 31))?;
                self.send_to_super(ctx, *pc, selector, usize::from(params[0] >> 5))
            }
            Opcode::SecondExtendedSend => {
                let selector = self.selector_literal(ctx, usize::from(params[0] & 63))?;
                self.send_to_self(ctx, *pc, selector, usize::from(params[0] >> 6))
            }
            Opcode::SendLiteralSelector {
                selector,
                arguments,
            } => {
                let selector = self.selector_literal(ctx, usize::from(selector))?;
                self.send_to_self(ctx, *pc, selector, usize::from(arguments))
            }

            // ==================== Stack shuffling ====================
            Opcode::Pop => {
                ctx.pop(&mut self.space);
                Ok(())
            }
            Opcode::Dup => {
                let top = ctx.top(&self.space);
                ctx.push(&mut self.space, top);
                Ok(())
            }
            Opcode::PushActiveContext => {
                // thisContext reads the frame from outside.
                ctx.store_pc(&mut self.space, *pc);
                ctx.push(&mut self.space, ctx.value());
                Ok(())
            }
            Opcode::PushNewArray => {
                let size = usize::from(params[0] & 0x7F);
                let array = if params[0] & 0x80 != 0 {
                    let values = ctx.pop_and_return_n(&mut self.space, size);
                    self.space.wrap_list(values)
                } else {
                    self.space
                        .new_instance_sized(self.space.classes.array, size)
                        .map_err(corrupt)?
                };
                ctx.push(&mut self.space, Value::Object(array));
                Ok(())
            }

            // ==================== Remote temps ====================
            Opcode::PushRemoteTemp => {
                let value = self.remote_temp(ctx, params[0], params[1])?;
                ctx.push(&mut self.space, value);
                Ok(())
            }
            Opcode::StoreRemoteTemp => {
                let value = ctx.top(&self.space);
                self.set_remote_temp(ctx, params[0], params[1], value)
            }
            Opcode::StorePopRemoteTemp => {
                let value = ctx.pop(&mut self.space);
                self.set_remote_temp(ctx, params[0], params[1], value)
            }

            // ==================== Closures ====================
            Opcode::PushClosure => {
                let num_args = usize::from(params[0] & 0xF);
                let num_copied = usize::from(params[0] >> 4);
                let block_size = (usize::from(params[1]) << 8) | usize::from(params[2]);
                let copied = ctx.pop_and_return_n(&mut self.space, num_copied);
                let closure = self.space.new_closure(ctx.value(), *pc, num_args, copied);
                ctx.push(&mut self.space, Value::Object(closure));
                *pc += block_size;
                Ok(())
            }

            // ==================== Jumps ====================
            Opcode::ShortUnconditionalJump(bits) => {
                *pc += usize::from(bits) + 1;
                Ok(())
            }
            Opcode::ShortJumpIfFalse(bits) => {
                self.jump_conditional(ctx, pc, false, usize::from(bits) + 1)
            }
            Opcode::LongUnconditionalJump(bits) => {
                let offset = ((i64::from(bits) - 4) << 8) + i64::from(params[0]);
                let target = *pc as i64 + offset;
                if target < 0 {
                    return Err(corrupt(HeapError::OutOfBounds));
                }
                *pc = target as usize;
                Ok(())
            }
            Opcode::LongJumpIfTrue(bits) => {
                let offset = (usize::from(bits) << 8) + usize::from(params[0]);
                self.jump_conditional(ctx, pc, true, offset)
            }
            Opcode::LongJumpIfFalse(bits) => {
                let offset = (usize::from(bits) << 8) + usize::from(params[0]);
                self.jump_conditional(ctx, pc, false, offset)
            }

            // ==================== Shortcut and specialized sends ====================
            Opcode::SendArithmetic(op) => {
                match self.try_primitive(ctx, arithmetic_primitive(op), 1, None, Some(*pc))? {
                    PrimCall::Done => Ok(()),
                    PrimCall::Failed => {
                        let selector = self.space.symbol(op.selector());
                        self.send_to_self(ctx, *pc, selector, 1)
                    }
                }
            }
            Opcode::SendSpecial(special) => self.send_special(ctx, *pc, special),

            Opcode::Reserved(byte) => Err(VmEvent::Abort(VmError::ReservedBytecode {
                byte,
                pc: opcode_pc,
            })),
        }
    }

    // ==================== Variable access helpers ====================

    fn receiver_variable(&mut self, ctx: Context, index: usize) -> Result<Value, VmEvent> {
        let receiver = ctx.receiver(&self.space).require_object().map_err(corrupt)?;
        self.space.heap.fetch(receiver, index).map_err(corrupt)
    }

    fn store_receiver_variable(
        &mut self,
        ctx: Context,
        index: usize,
        value: Value,
    ) -> StepResult {
        let receiver = ctx.receiver(&self.space).require_object().map_err(corrupt)?;
        self.space
            .heap
            .store(receiver, index, value)
            .map_err(corrupt)
    }

    fn literal_variable_value(&self, ctx: Context, index: usize) -> Result<Value, VmEvent> {
        let association = self
            .method_literal(ctx, index)?
            .require_object()
            .map_err(corrupt)?;
        self.space
            .heap
            .fetch(association, association_slot::VALUE)
            .map_err(corrupt)
    }

    fn selector_literal(&self, ctx: Context, index: usize) -> Result<ObjRef, VmEvent> {
        self.method_literal(ctx, index)?
            .require_object()
            .map_err(corrupt)
    }

    fn pushed_constant(&self, constant: PushedConstant) -> Value {
        match constant {
            PushedConstant::True => self.space.specials.bool_true,
            PushedConstant::False => self.space.specials.bool_false,
            PushedConstant::Nil => self.space.nil(),
            PushedConstant::MinusOne => Value::SmallInt(-1),
            PushedConstant::Zero => Value::SmallInt(0),
            PushedConstant::One => Value::SmallInt(1),
            PushedConstant::Two => Value::SmallInt(2),
        }
    }

    fn extended_push(&mut self, ctx: Context, descriptor: u8) -> StepResult {
        let index = usize::from(descriptor & 63);
        let value = match (descriptor >> 6) & 3 {
            0 => self.receiver_variable(ctx, index)?,
            1 => ctx.temp(&self.space, index),
            2 => self.method_literal(ctx, index)?,
            _ => self.literal_variable_value(ctx, index)?,
        };
        ctx.push(&mut self.space, value);
        Ok(())
    }

    fn extended_store(&mut self, ctx: Context, descriptor: u8, pop: bool) -> StepResult {
        let index = usize::from(descriptor & 63);
        let value = if pop {
            ctx.pop(&mut self.space)
        } else {
            ctx.top(&self.space)
        };
        match (descriptor >> 6) & 3 {
            0 => self.store_receiver_variable(ctx, index, value),
            1 => {
                ctx.set_temp(&mut self.space, index, value);
                Ok(())
            }
            2 => Err(VmEvent::Abort(VmError::IllegalStore)),
            _ => {
                let association = self
                    .method_literal(ctx, index)?
                    .require_object()
                    .map_err(corrupt)?;
                self.space
                    .heap
                    .store(association, association_slot::VALUE, value)
                    .map_err(corrupt)
            }
        }
    }

    fn double_extended_do_anything(
        &mut self,
        ctx: Context,
        pc: usize,
        second: u8,
        third: u8,
    ) -> StepResult {
        let index = usize::from(third);
        match second >> 5 {
            0 => {
                let selector = self.selector_literal(ctx, index)?;
                self.send_to_self(ctx, pc, selector, usize::from(second & 31))
            }
            1 => {
                let selector = self.selector_literal(ctx, index)?;
                self.send_to_super(ctx, pc, selector, usize::from(second & 31))
            }
            2 => {
                let value = self.receiver_variable(ctx, index)?;
                ctx.push(&mut self.space, value);
                Ok(())
            }
            3 => {
                let value = self.method_literal(ctx, index)?;
                ctx.push(&mut self.space, value);
                Ok(())
            }
            4 => {
                let value = self.literal_variable_value(ctx, index)?;
                ctx.push(&mut self.space, value);
                Ok(())
            }
            5 => {
                let value = ctx.top(&self.space);
                self.store_receiver_variable(ctx, index, value)
            }
            6 => {
                let value = ctx.pop(&mut self.space);
                self.store_receiver_variable(ctx, index, value)
            }
            _ => {
                let association = self
                    .method_literal(ctx, index)?
                    .require_object()
                    .map_err(corrupt)?;
                let value = ctx.top(&self.space);
                self.space
                    .heap
                    .store(association, association_slot::VALUE, value)
                    .map_err(corrupt)
            }
        }
    }

    fn remote_temp(&mut self, ctx: Context, in_array: u8, of_array: u8) -> Result<Value, VmEvent> {
        let vector = ctx
            .temp(&self.space, usize::from(of_array))
            .require_object()
            .map_err(corrupt)?;
        self.space
            .indexed_at(vector, usize::from(in_array))
            .map_err(corrupt)
    }

    fn set_remote_temp(
        &mut self,
        ctx: Context,
        in_array: u8,
        of_array: u8,
        value: Value,
    ) -> StepResult {
        let vector = ctx
            .temp(&self.space, usize::from(of_array))
            .require_object()
            .map_err(corrupt)?;
        self.space
            .indexed_at_put(vector, usize::from(in_array), value)
            .map_err(corrupt)
    }

    // ==================== Jumps ====================

    fn jump_conditional(
        &mut self,
        ctx: Context,
        pc: &mut usize,
        expecting_true: bool,
        offset: usize,
    ) -> StepResult {
        let (expected, alternative) = if expecting_true {
            (self.space.specials.bool_true, self.space.specials.bool_false)
        } else {
            (self.space.specials.bool_false, self.space.specials.bool_true)
        };
        let condition = ctx.pop(&mut self.space);
        if condition == expected {
            *pc += offset;
            Ok(())
        } else if condition != alternative {
            self.send_special_selector(ctx, *pc, condition, "mustBeBoolean", &[])
        } else {
            Ok(())
        }
    }

    // ==================== Returns ====================

    /// `^ value`: return to the sender of the home context.
    fn method_return(&mut self, ctx: Context, value: Value) -> StepResult {
        let Some(home) = ctx.home(&self.space) else {
            return Err(VmEvent::Abort(VmError::BrokenSenderChain));
        };
        if home.handle() != ctx.handle() && home.is_returned(&self.space) {
            // Non-local return into a dead home.
            let closure = ctx.closure(&self.space);
            let receiver = if self.space.is_nil(closure) {
                ctx.value()
            } else {
                closure
            };
            return self.send_special_selector(ctx, usize::MAX, receiver, "cannotReturn:", &[value]);
        }
        match home.sender(&self.space) {
            None => Err(VmEvent::TopLevelReturn { value }),
            Some(target) => Err(VmEvent::Return {
                target: target.handle(),
                value,
            }),
        }
    }

    // ==================== Sends ====================

    fn send_to_self(
        &mut self,
        ctx: Context,
        pc: usize,
        selector: ObjRef,
        argument_count: usize,
    ) -> StepResult {
        let receiver = ctx.peek(&self.space, argument_count);
        let class = self.space.class_of(receiver);
        self.send_selector(ctx, pc, selector, argument_count, receiver, class)
    }

    fn send_to_super(
        &mut self,
        ctx: Context,
        pc: usize,
        selector: ObjRef,
        argument_count: usize,
    ) -> StepResult {
        let method = ctx
            .method(&self.space)
            .ok_or_else(|| corrupt(HeapError::UnexpectedType))?;
        let compiled_in = self
            .space
            .method(method)
            .map_err(corrupt)?
            .compiled_in
            .ok_or_else(|| corrupt(HeapError::UnexpectedType))?;
        let start = self
            .space
            .superclass(compiled_in)
            .ok_or_else(|| corrupt(HeapError::UnexpectedType))?;
        let receiver = ctx.receiver(&self.space);
        self.send_selector(ctx, pc, selector, argument_count, receiver, start)
    }

    fn send_selector(
        &mut self,
        ctx: Context,
        pc: usize,
        selector: ObjRef,
        argument_count: usize,
        receiver: Value,
        lookup_class: ObjRef,
    ) -> StepResult {
        // The frame becomes visible through the callee's sender link.
        if pc != usize::MAX {
            ctx.store_pc(&mut self.space, pc);
        }
        let method = match self.cache.lookup(&self.space, lookup_class, selector) {
            Ok(method) => method,
            Err(MethodNotFound) => {
                return self.does_not_understand(ctx, selector, argument_count, receiver);
            }
        };
        let primitive = self.space.method(method).map_err(corrupt)?.primitive;
        if primitive != 0 {
            match self.try_primitive(ctx, primitive, argument_count, Some(method), None)? {
                PrimCall::Done => return Ok(()),
                PrimCall::Failed => {
                    trace!(primitive, "primitive failed, running fallback body");
                }
            }
        }
        let args = ctx.pop_and_return_n(&mut self.space, argument_count);
        let frame =
            Context::new_method_frame(&mut self.space, method, receiver, &args, ctx.value())
                .map_err(corrupt)?;
        ctx.pop(&mut self.space); // receiver
        trace!(
            selector = %self.space.symbol_text(selector).unwrap_or_default(),
            class = %self.space.class_name(lookup_class),
            "send"
        );
        Err(self.stack_frame(frame, true))
    }

    /// A VM-initiated send of a well-known selector.
    pub(crate) fn send_special_selector(
        &mut self,
        ctx: Context,
        pc: usize,
        receiver: Value,
        selector: &str,
        args: &[Value],
    ) -> StepResult {
        if pc != usize::MAX {
            ctx.store_pc(&mut self.space, pc);
        }
        let selector_ref = self.space.symbol(selector);
        let class = self.space.class_of(receiver);
        let method = match self.cache.lookup(&self.space, class, selector_ref) {
            Ok(method) => method,
            Err(MethodNotFound) => {
                return Err(VmEvent::Abort(VmError::MissingSpecialMethod {
                    selector: selector.to_string(),
                    class_name: self.space.class_name(class),
                }));
            }
        };
        let frame = Context::new_method_frame(&mut self.space, method, receiver, args, ctx.value())
            .map_err(corrupt)?;
        Err(self.stack_frame(frame, true))
    }

    fn does_not_understand(
        &mut self,
        ctx: Context,
        selector: ObjRef,
        argument_count: usize,
        receiver: Value,
    ) -> StepResult {
        let args = ctx.pop_and_return_n(&mut self.space, argument_count);
        let arguments = self.space.wrap_list(args);
        let message = self
            .space
            .new_instance(self.space.classes.message)
            .map_err(corrupt)?;
        self.space
            .heap
            .store(message, message_slot::SELECTOR, Value::Object(selector))
            .map_err(corrupt)?;
        self.space
            .heap
            .store(message, message_slot::ARGUMENTS, Value::Object(arguments))
            .map_err(corrupt)?;
        ctx.pop(&mut self.space); // receiver, already known

        let class = self.space.class_of(receiver);
        let dnu = self.space.symbol("doesNotUnderstand:");
        match self.cache.lookup(&self.space, class, dnu) {
            Ok(method) => {
                let frame = Context::new_method_frame(
                    &mut self.space,
                    method,
                    receiver,
                    &[Value::Object(message)],
                    ctx.value(),
                )
                .map_err(corrupt)?;
                Err(self.stack_frame(frame, true))
            }
            Err(MethodNotFound) => {
                let class_name = self.space.class_name(class);
                tracing::error!(
                    selector = %self.space.symbol_text(selector).unwrap_or_default(),
                    class = %class_name,
                    stack = %ctx.print_stack(&self.space),
                    "missing doesNotUnderstand"
                );
                Err(VmEvent::Abort(VmError::MissingDoesNotUnderstand {
                    class_name,
                }))
            }
        }
    }

    // ==================== Specialized sends ====================

    fn send_special(&mut self, ctx: Context, pc: usize, special: SpecialSend) -> StepResult {
        match special {
            SpecialSend::Equivalent => self.quick_primitive(ctx, primitives::EQUIVALENT, 1),
            SpecialSend::Class => self.quick_primitive(ctx, primitives::CLASS, 0),
            SpecialSend::BlockCopy => {
                match self.try_primitive(ctx, primitives::BLOCK_COPY, 1, None, Some(pc))? {
                    PrimCall::Done => Ok(()),
                    PrimCall::Failed => self.send_named(ctx, pc, special),
                }
            }
            SpecialSend::Value => {
                let receiver = ctx.peek(&self.space, 0);
                self.class_based_value(ctx, pc, special, receiver, 0)
            }
            SpecialSend::ValueWithArg => {
                let receiver = ctx.peek(&self.space, 1);
                self.class_based_value(ctx, pc, special, receiver, 1)
            }
            _ => self.send_named(ctx, pc, special),
        }
    }

    fn send_named(&mut self, ctx: Context, pc: usize, special: SpecialSend) -> StepResult {
        let selector = self.space.symbol(special.selector());
        self.send_to_self(ctx, pc, selector, special.argument_count())
    }

    /// `value`/`value:` dispatch directly on block contexts and closures.
    fn class_based_value(
        &mut self,
        ctx: Context,
        pc: usize,
        special: SpecialSend,
        receiver: Value,
        argument_count: usize,
    ) -> StepResult {
        let class = self.space.class_of(receiver);
        let index = if class == self.space.classes.block_context {
            primitives::VALUE
        } else if class == self.space.classes.block_closure {
            if argument_count == 0 {
                primitives::CLOSURE_VALUE
            } else {
                primitives::CLOSURE_VALUE_ARG
            }
        } else {
            return self.send_named(ctx, pc, special);
        };
        match self.try_primitive(ctx, index, argument_count, None, Some(pc))? {
            PrimCall::Done => Ok(()),
            PrimCall::Failed => self.send_named(ctx, pc, special),
        }
    }

    /// `==` and `class` cannot be overridden and have no fallback.
    fn quick_primitive(&mut self, ctx: Context, index: u16, argument_count: usize) -> StepResult {
        match self.try_primitive(ctx, index, argument_count, None, None)? {
            PrimCall::Done => Ok(()),
            PrimCall::Failed => Err(VmEvent::Abort(VmError::Exit {
                reason: format!("quick primitive {index} failed"),
            })),
        }
    }

    // ==================== Primitive dispatch ====================

    /// Try primitive `index` against the current stack.
    ///
    /// `pc` is supplied on direct bytecode dispatch so primitives marked
    /// `store_pc` see a current frame pc; send-path callers have already
    /// flushed it.
    pub(crate) fn try_primitive(
        &mut self,
        ctx: Context,
        index: u16,
        argument_count: usize,
        method: Option<ObjRef>,
        pc: Option<usize>,
    ) -> Result<PrimCall, VmEvent> {
        // The inst-var-at range is dispatched positionally.
        if (primitives::FIRST_INST_VAR..=primitives::LAST_INST_VAR).contains(&index) {
            let slot = usize::from(index - primitives::FIRST_INST_VAR);
            let Some(receiver) = ctx.peek(&self.space, 0).as_object() else {
                return Ok(PrimCall::Failed);
            };
            return match self.space.heap.fetch(receiver, slot) {
                Ok(value) => {
                    ctx.pop_n(&mut self.space, 1);
                    ctx.push(&mut self.space, value);
                    Ok(PrimCall::Done)
                }
                Err(_) => Ok(PrimCall::Failed),
            };
        }

        let Some(def) = self.primitives.get(index) else {
            return Ok(PrimCall::Failed);
        };
        if def.store_pc && let Some(pc) = pc {
            ctx.store_pc(&mut self.space, pc);
        }
        match def.code {
            PrimitiveCode::Spec {
                unwrap,
                result,
                may_context_switch,
                f,
            } => {
                if argument_count + 1 != unwrap.len() {
                    return Ok(PrimCall::Failed);
                }
                let Some(args) = primitives::unwrap_stack(&self.space, ctx, unwrap) else {
                    return Ok(PrimCall::Failed);
                };
                match f(self, ctx, &args) {
                    Err(_) => Ok(PrimCall::Failed),
                    Ok(value) => {
                        ctx.pop_n(&mut self.space, unwrap.len());
                        match result {
                            primitives::ResultKind::Push => {
                                ctx.push(&mut self.space, value);
                                Ok(PrimCall::Done)
                            }
                            primitives::ResultKind::NoResult => Ok(PrimCall::Done),
                            primitives::ResultKind::NewFrame => {
                                let frame = value.require_object().map_err(corrupt)?;
                                Err(self
                                    .stack_frame(Context::from_ref(frame), may_context_switch))
                            }
                        }
                    }
                }
            }
            PrimitiveCode::Raw(f) => match f(self, ctx, argument_count, method) {
                Err(_) => Ok(PrimCall::Failed),
                Ok(PrimOutcome::Value(value)) => {
                    ctx.pop_n(&mut self.space, argument_count + 1);
                    ctx.push(&mut self.space, value);
                    Ok(PrimCall::Done)
                }
                Ok(PrimOutcome::Stay) => Ok(PrimCall::Done),
                Ok(PrimOutcome::Activate {
                    context,
                    may_context_switch,
                }) => Err(self.stack_frame(Context::from_ref(context), may_context_switch)),
                Ok(PrimOutcome::Switch { context }) => Err(VmEvent::ProcessSwitch { context }),
                Ok(PrimOutcome::Event(event)) => Err(event),
            },
        }
    }
}
