//! The VM record
//!
//! All global mutable state lives here: the object space, the method
//! cache, the primitive table, the host services, and the interrupt
//! machinery. The top-level loop also lives here; it is the only place
//! control-flow events come to rest.

use std::time::Instant;

use tracing::debug;

use shrew_vm_heap::{CompiledMethodBuilder, ObjectSpace, SMALL_INT_MAX, Value};

use crate::context::Context;
use crate::error::{VmError, VmEvent};
use crate::host::{HostServices, NullHost};
use crate::kernel;
use crate::method_cache::MethodCache;
use crate::primitives::PrimitiveTable;
use crate::scheduler;

/// Tunables fixed at VM construction.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum nested activation depth before the overflow event fires
    pub max_stack_depth: usize,
    /// Bytecode-boundary checks between interrupt scans
    pub interrupt_counter_size: i64,
    /// Whether the interrupt check runs at all
    pub interrupts: bool,
    /// Name reported by the `imageName` primitive
    pub image_name: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_stack_depth: 512,
            interrupt_counter_size: 10_000,
            interrupts: true,
            image_name: String::new(),
        }
    }
}

/// The virtual machine.
pub struct Vm {
    /// Object memory and well-known objects
    pub space: ObjectSpace,
    /// Global method cache
    pub cache: MethodCache,
    /// Numbered primitive table
    pub primitives: PrimitiveTable,
    /// Host services seam
    pub host: Box<dyn HostServices>,
    /// Construction-time tunables
    pub config: VmConfig,
    pub(crate) interrupt_check_counter: i64,
    pub(crate) current_depth: usize,
    pub(crate) next_wakeup_tick: i64,
    startup: Instant,
}

impl Vm {
    /// Build a VM with the minimal kernel installed.
    pub fn new(config: VmConfig, host: Box<dyn HostServices>) -> Vm {
        let mut space = ObjectSpace::new();
        let mut cache = MethodCache::new();
        kernel::install(&mut space, &mut cache);
        let interrupt_check_counter = config.interrupt_counter_size;
        Vm {
            space,
            cache,
            primitives: PrimitiveTable::new(),
            host,
            config,
            interrupt_check_counter,
            current_depth: 0,
            next_wakeup_tick: 0,
            startup: Instant::now(),
        }
    }

    /// A headless VM: default configuration, failing host.
    pub fn headless() -> Vm {
        Vm::new(VmConfig::default(), Box::new(NullHost))
    }

    /// Milliseconds since startup, wrapped to the tagged range.
    pub fn milliseconds_now(&self) -> i64 {
        (self.startup.elapsed().as_millis() as i64) & SMALL_INT_MAX
    }

    // ==================== Top-level loop ====================

    /// Run `entry` until a return reaches the top of the sender chain.
    ///
    /// The only loop that is not entered recursively: stack overflows,
    /// process switches and returns into heap-only frames all come back
    /// here to pick the next active context.
    pub fn run(&mut self, entry: Context) -> Result<Value, VmError> {
        let mut active = entry;
        loop {
            debug_assert_eq!(self.current_depth, 0);
            // The loop nils this frame's sender on return, so save it.
            let saved_sender = active.sender(&self.space);
            let mut event = self.loop_bytecodes(active, true);
            let next = loop {
                match event {
                    VmEvent::StackOverflow { context } => {
                        debug!(context = context.index(), "contexts forced to heap");
                        break Context::from_ref(context);
                    }
                    VmEvent::ProcessSwitch { context } => {
                        debug!(context = context.index(), "switched process");
                        break Context::from_ref(context);
                    }
                    VmEvent::TopLevelReturn { value } => return Ok(value),
                    VmEvent::Abort(error) => return Err(error),
                    VmEvent::Return { target, value } => {
                        // Walk the saved chain to the target, unwinding
                        // heap-only frames on the way.
                        let mut current = saved_sender;
                        let mut replacement = None;
                        let resolved = loop {
                            let Some(c) = current else {
                                break None;
                            };
                            if c.handle() == target {
                                c.push(&mut self.space, value);
                                break Some(c);
                            }
                            current = c.sender(&self.space);
                            if let Err(e) = self.activate_unwind_context(c) {
                                replacement = Some(e);
                                break None;
                            }
                        };
                        if let Some(e) = replacement {
                            event = e;
                            continue;
                        }
                        match resolved {
                            Some(c) => break c,
                            None => return Err(VmError::BrokenSenderChain),
                        }
                    }
                }
            };
            active = next;
        }
    }

    // ==================== Convenience entry points ====================

    /// Send `selector` to `receiver` from a synthesized top-level frame
    /// and run to completion.
    pub fn perform(
        &mut self,
        receiver: Value,
        selector: &str,
        args: &[Value],
    ) -> Result<Value, VmError> {
        if args.len() > 7 {
            return Err(VmError::Exit {
                reason: format!("perform: too many arguments ({})", args.len()),
            });
        }
        let selector = self.space.symbol(selector);
        let mut builder = CompiledMethodBuilder::new();
        let index = builder.literal(Value::Object(selector));
        let descriptor = ((args.len() as u8) << 5) | index;
        let method = builder.bytes(&[131, descriptor, 124]).build();

        let method = self.space.heap.allocate(shrew_vm_heap::HeapObject::new(
            self.space.classes.compiled_method,
            shrew_vm_heap::Body::Method(method),
        ));
        let nil = self.space.nil();
        let frame = Context::new_method_frame(&mut self.space, method, receiver, &[], nil)?;
        frame.push(&mut self.space, receiver);
        frame.push_all(&mut self.space, args);

        self.interrupt_check_counter = self.config.interrupt_counter_size;
        self.run(frame)
    }

    // ==================== Interrupt machinery ====================

    /// Counter-gated interrupt check at a bytecode boundary.
    pub(crate) fn quick_check_for_interrupt(
        &mut self,
        frame: Context,
        decrement: i64,
    ) -> Result<(), VmEvent> {
        if !self.config.interrupts {
            return Ok(());
        }
        self.interrupt_check_counter -= decrement;
        if self.interrupt_check_counter <= 0 {
            self.interrupt_check_counter = self.config.interrupt_counter_size;
            return self.check_for_interrupts(frame);
        }
        Ok(())
    }

    /// Reset the counter and check right now.
    pub(crate) fn force_interrupt_check(&mut self, frame: Context) -> Result<(), VmEvent> {
        if !self.config.interrupts {
            return Ok(());
        }
        self.interrupt_check_counter = self.config.interrupt_counter_size;
        self.check_for_interrupts(frame)
    }

    /// Signal the timer and user-interrupt semaphores when due.
    fn check_for_interrupts(&mut self, frame: Context) -> Result<(), VmEvent> {
        let now = self.milliseconds_now();
        if self.next_wakeup_tick != 0 && now >= self.next_wakeup_tick {
            self.next_wakeup_tick = 0;
            if let Some(semaphore) = self.space.specials.timer_semaphore.as_object() {
                let switched = scheduler::semaphore_signal(&mut self.space, semaphore, frame)
                    .map_err(VmEvent::Abort)?;
                if let Some(context) = switched {
                    return Err(VmEvent::ProcessSwitch { context });
                }
            }
        }
        if self.host.user_interrupt_pending()
            && let Some(semaphore) = self.space.specials.interrupt_semaphore.as_object()
        {
            let switched = scheduler::semaphore_signal(&mut self.space, semaphore, frame)
                .map_err(VmEvent::Abort)?;
            if let Some(context) = switched {
                return Err(VmEvent::ProcessSwitch { context });
            }
        }
        Ok(())
    }

    /// Milliseconds timestamp at which the timer semaphore should fire.
    pub(crate) fn set_wakeup_tick(&mut self, tick: i64) {
        self.next_wakeup_tick = tick;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic_and_tagged() {
        let vm = Vm::headless();
        let a = vm.milliseconds_now();
        let b = vm.milliseconds_now();
        assert!(b >= a);
        assert!(a >= 0);
    }

    #[test]
    fn perform_rejects_too_many_arguments() {
        let mut vm = Vm::headless();
        let nil = vm.space.nil();
        let args = vec![nil; 8];
        assert!(vm.perform(nil, "with:lots:", &args).is_err());
    }
}
