//! Cooperative process scheduling
//!
//! Processes, semaphores and the processor scheduler are ordinary heap
//! objects; this module is the set of operations the semaphore and process
//! primitives perform on them. A switch is never taken here — operations
//! answer the context to make active, and the interpreter raises the
//! process-switch event at the current bytecode boundary, so bytecodes
//! stay atomic with respect to switches.

use shrew_vm_heap::{ObjRef, ObjectSpace, Value};

use crate::context::Context;
use crate::error::VmError;

/// Fixed-slot indices of `Process`.
pub mod process_slot {
    /// Next process on the same list.
    pub const NEXT_LINK: usize = 0;
    /// Saved context while not running.
    pub const SUSPENDED_CONTEXT: usize = 1;
    /// Priority, 1-based.
    pub const PRIORITY: usize = 2;
    /// The list or semaphore the process is queued on, or nil.
    pub const MY_LIST: usize = 3;
}

/// Fixed-slot indices of `LinkedList` (and the prefix of `Semaphore`).
pub mod list_slot {
    /// Head of the queue.
    pub const FIRST_LINK: usize = 0;
    /// Tail of the queue.
    pub const LAST_LINK: usize = 1;
}

/// Fixed-slot indices of `Semaphore` beyond the list prefix.
pub mod semaphore_slot {
    /// Signals with no waiter to consume them.
    pub const EXCESS_SIGNALS: usize = 2;
}

/// Fixed-slot indices of `ProcessorScheduler`.
pub mod scheduler_slot {
    /// Array of ready lists, one per priority.
    pub const PROCESS_LISTS: usize = 0;
    /// The running process.
    pub const ACTIVE_PROCESS: usize = 1;
}

fn fetch(space: &ObjectSpace, r: ObjRef, slot: usize) -> Value {
    space.heap.fetch(r, slot).unwrap_or_else(|_| space.nil())
}

fn store(space: &mut ObjectSpace, r: ObjRef, slot: usize, v: Value) {
    let _ = space.heap.store(r, slot, v);
}

fn small(space: &ObjectSpace, r: ObjRef, slot: usize) -> i64 {
    fetch(space, r, slot).as_small_int().unwrap_or(0)
}

/// The scheduler object.
pub fn scheduler(space: &ObjectSpace) -> Option<ObjRef> {
    space.specials.scheduler.as_object()
}

/// The running process.
pub fn active_process(space: &ObjectSpace) -> Option<ObjRef> {
    scheduler(space).and_then(|s| fetch(space, s, scheduler_slot::ACTIVE_PROCESS).as_object())
}

/// Priority of a process, 1-based.
pub fn priority(space: &ObjectSpace, process: ObjRef) -> i64 {
    small(space, process, process_slot::PRIORITY)
}

fn ready_list(space: &ObjectSpace, priority: i64) -> Option<ObjRef> {
    let lists = fetch(space, scheduler(space)?, scheduler_slot::PROCESS_LISTS).as_object()?;
    let count = space.heap.raw_len(lists) as i64;
    let index = priority.clamp(1, count) - 1;
    space.heap.fetch(lists, index as usize).ok()?.as_object()
}

// ==================== Linked lists ====================

/// Whether a process list is empty.
pub fn list_is_empty(space: &ObjectSpace, list: ObjRef) -> bool {
    space.is_nil(fetch(space, list, list_slot::FIRST_LINK))
}

/// Append a process; records the list as the process's `myList`.
pub fn add_last(space: &mut ObjectSpace, list: ObjRef, process: ObjRef) {
    let nil = space.nil();
    store(space, process, process_slot::NEXT_LINK, nil);
    store(space, process, process_slot::MY_LIST, Value::Object(list));
    match fetch(space, list, list_slot::LAST_LINK).as_object() {
        Some(last) => store(space, last, process_slot::NEXT_LINK, Value::Object(process)),
        None => store(space, list, list_slot::FIRST_LINK, Value::Object(process)),
    }
    store(space, list, list_slot::LAST_LINK, Value::Object(process));
}

/// Detach and answer the head of the list.
pub fn remove_first(space: &mut ObjectSpace, list: ObjRef) -> Option<ObjRef> {
    let first = fetch(space, list, list_slot::FIRST_LINK).as_object()?;
    let next = fetch(space, first, process_slot::NEXT_LINK);
    let nil = space.nil();
    store(space, list, list_slot::FIRST_LINK, next);
    if space.is_nil(next) {
        store(space, list, list_slot::LAST_LINK, nil);
    }
    store(space, first, process_slot::NEXT_LINK, nil);
    store(space, first, process_slot::MY_LIST, nil);
    Some(first)
}

/// Unlink `process` from whatever list it is queued on.
pub fn remove_from_list(space: &mut ObjectSpace, process: ObjRef) {
    let Some(list) = fetch(space, process, process_slot::MY_LIST).as_object() else {
        return;
    };
    let nil = space.nil();
    let mut prev: Option<ObjRef> = None;
    let mut current = fetch(space, list, list_slot::FIRST_LINK).as_object();
    while let Some(c) = current {
        let next = fetch(space, c, process_slot::NEXT_LINK);
        if c == process {
            match prev {
                Some(p) => store(space, p, process_slot::NEXT_LINK, next),
                None => store(space, list, list_slot::FIRST_LINK, next),
            }
            if space.is_nil(next) {
                let tail = prev.map(Value::Object).unwrap_or(nil);
                store(space, list, list_slot::LAST_LINK, tail);
            }
            store(space, process, process_slot::NEXT_LINK, nil);
            store(space, process, process_slot::MY_LIST, nil);
            return;
        }
        prev = Some(c);
        current = next.as_object();
    }
}

// ==================== Switching ====================

/// Park the process on its priority's ready list.
pub fn put_to_sleep(space: &mut ObjectSpace, process: ObjRef) {
    if let Some(list) = ready_list(space, priority(space, process)) {
        add_last(space, list, process);
    }
}

/// Hand the processor to `process`. The current context goes into the old
/// active process; the answer is the context to resume.
pub fn transfer_to(
    space: &mut ObjectSpace,
    process: ObjRef,
    current: Context,
) -> Result<ObjRef, VmError> {
    let sched = scheduler(space).ok_or(VmError::Deadlock)?;
    if let Some(old) = active_process(space) {
        store(space, old, process_slot::SUSPENDED_CONTEXT, current.value());
    }
    store(space, sched, scheduler_slot::ACTIVE_PROCESS, Value::Object(process));
    let context = fetch(space, process, process_slot::SUSPENDED_CONTEXT)
        .as_object()
        .ok_or(VmError::Deadlock)?;
    let nil = space.nil();
    store(space, process, process_slot::SUSPENDED_CONTEXT, nil);
    Ok(context)
}

/// Take the highest-priority ready process and transfer to it.
pub fn wake_highest_priority(
    space: &mut ObjectSpace,
    current: Context,
) -> Result<ObjRef, VmError> {
    let sched = scheduler(space).ok_or(VmError::Deadlock)?;
    let lists = fetch(space, sched, scheduler_slot::PROCESS_LISTS)
        .as_object()
        .ok_or(VmError::Deadlock)?;
    let count = space.heap.raw_len(lists);
    for index in (0..count).rev() {
        let Some(list) = space.heap.fetch(lists, index).ok().and_then(|v| v.as_object()) else {
            continue;
        };
        if list_is_empty(space, list) {
            continue;
        }
        let process = remove_first(space, list).ok_or(VmError::Deadlock)?;
        return transfer_to(space, process, current);
    }
    Err(VmError::Deadlock)
}

/// Make `process` runnable. Preempts when it outranks the active process;
/// the answer is the context to switch to, if any.
pub fn resume(
    space: &mut ObjectSpace,
    process: ObjRef,
    current: Context,
) -> Result<Option<ObjRef>, VmError> {
    let active = active_process(space);
    let outranks = match active {
        Some(active) => priority(space, process) > priority(space, active),
        None => true,
    };
    if outranks {
        if let Some(active) = active {
            put_to_sleep(space, active);
        }
        transfer_to(space, process, current).map(Some)
    } else {
        put_to_sleep(space, process);
        Ok(None)
    }
}

/// Suspend a process. Suspending the active process picks the next
/// runnable one; suspending a queued process just unlinks it.
pub fn suspend(
    space: &mut ObjectSpace,
    process: ObjRef,
    current: Context,
) -> Result<Option<ObjRef>, VmError> {
    if active_process(space) == Some(process) {
        wake_highest_priority(space, current).map(Some)
    } else {
        remove_from_list(space, process);
        Ok(None)
    }
}

// ==================== Semaphores ====================

/// Signal a semaphore: wake the head waiter, or bank an excess signal.
pub fn semaphore_signal(
    space: &mut ObjectSpace,
    semaphore: ObjRef,
    current: Context,
) -> Result<Option<ObjRef>, VmError> {
    if list_is_empty(space, semaphore) {
        let excess = small(space, semaphore, semaphore_slot::EXCESS_SIGNALS);
        store(
            space,
            semaphore,
            semaphore_slot::EXCESS_SIGNALS,
            Value::SmallInt(excess + 1),
        );
        return Ok(None);
    }
    let process = remove_first(space, semaphore).ok_or(VmError::Deadlock)?;
    resume(space, process, current)
}

/// Wait on a semaphore: consume an excess signal, or park the active
/// process and pick the next runnable one.
pub fn semaphore_wait(
    space: &mut ObjectSpace,
    semaphore: ObjRef,
    current: Context,
) -> Result<Option<ObjRef>, VmError> {
    let excess = small(space, semaphore, semaphore_slot::EXCESS_SIGNALS);
    if excess > 0 {
        store(
            space,
            semaphore,
            semaphore_slot::EXCESS_SIGNALS,
            Value::SmallInt(excess - 1),
        );
        return Ok(None);
    }
    let active = active_process(space).ok_or(VmError::Deadlock)?;
    add_last(space, semaphore, active);
    wake_highest_priority(space, current).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_process(space: &mut ObjectSpace, prio: i64, context: Value) -> ObjRef {
        let nil = space.nil();
        space.heap.allocate(shrew_vm_heap::HeapObject::new(
            space.classes.process,
            shrew_vm_heap::Body::Pointers(vec![nil, context, Value::SmallInt(prio), nil]),
        ))
    }

    fn new_semaphore(space: &mut ObjectSpace) -> ObjRef {
        let nil = space.nil();
        space.heap.allocate(shrew_vm_heap::HeapObject::new(
            space.classes.semaphore,
            shrew_vm_heap::Body::Pointers(vec![nil, nil, Value::SmallInt(0)]),
        ))
    }

    fn dummy_context(space: &mut ObjectSpace) -> Context {
        let nil = space.nil();
        let r = space
            .new_instance_sized(space.classes.method_context, 8)
            .unwrap();
        let ctx = Context::from_ref(r);
        ctx.set_sender(space, nil);
        ctx.store_pc(space, 0);
        ctx.set_stackp(space, 0);
        ctx
    }

    #[test]
    fn signal_without_waiter_banks_excess() {
        let mut space = ObjectSpace::new();
        let sem = new_semaphore(&mut space);
        let here = dummy_context(&mut space);
        assert_eq!(semaphore_signal(&mut space, sem, here).unwrap(), None);
        assert_eq!(small(&space, sem, semaphore_slot::EXCESS_SIGNALS), 1);
        // A wait then consumes it without switching.
        assert_eq!(semaphore_wait(&mut space, sem, here).unwrap(), None);
        assert_eq!(small(&space, sem, semaphore_slot::EXCESS_SIGNALS), 0);
    }

    #[test]
    fn wait_parks_active_and_wakes_ready() {
        let mut space = ObjectSpace::new();
        let sem = new_semaphore(&mut space);
        let here = dummy_context(&mut space);
        let other_ctx = dummy_context(&mut space);
        let other = new_process(&mut space, 4, other_ctx.value());
        put_to_sleep(&mut space, other);

        let active = active_process(&space).unwrap();
        let resumed = semaphore_wait(&mut space, sem, here).unwrap();
        assert_eq!(resumed, Some(other_ctx.handle()));
        // The old active process is now queued on the semaphore with the
        // current context saved.
        assert_eq!(
            fetch(&space, active, process_slot::MY_LIST),
            Value::Object(sem)
        );
        assert_eq!(
            fetch(&space, active, process_slot::SUSPENDED_CONTEXT),
            here.value()
        );
        assert_eq!(active_process(&space), Some(other));
    }

    #[test]
    fn signal_resumes_waiter_at_equal_priority_without_preemption() {
        let mut space = ObjectSpace::new();
        let sem = new_semaphore(&mut space);
        let here = dummy_context(&mut space);
        let waiter_ctx = dummy_context(&mut space);
        let waiter = new_process(&mut space, 4, waiter_ctx.value());
        add_last(&mut space, sem, waiter);

        // Equal priority: the waiter becomes ready but does not preempt.
        assert_eq!(semaphore_signal(&mut space, sem, here).unwrap(), None);
        assert!(list_is_empty(&space, sem));
        let list = ready_list(&space, 4).unwrap();
        assert!(!list_is_empty(&space, list));
    }

    #[test]
    fn signal_preempts_for_higher_priority_waiter() {
        let mut space = ObjectSpace::new();
        let sem = new_semaphore(&mut space);
        let here = dummy_context(&mut space);
        let waiter_ctx = dummy_context(&mut space);
        let waiter = new_process(&mut space, 6, waiter_ctx.value());
        add_last(&mut space, sem, waiter);

        let switched = semaphore_signal(&mut space, sem, here).unwrap();
        assert_eq!(switched, Some(waiter_ctx.handle()));
        assert_eq!(active_process(&space), Some(waiter));
    }

    #[test]
    fn two_processes_two_semaphores_terminate() {
        // P1 waits on S1; P2 signals S1 then waits on S2; an outside
        // signal on S2 lets both run to completion — nothing livelocks.
        let mut space = ObjectSpace::new();
        let s1 = new_semaphore(&mut space);
        let s2 = new_semaphore(&mut space);
        let here = dummy_context(&mut space);

        let p1_ctx = dummy_context(&mut space);
        let p1 = new_process(&mut space, 5, p1_ctx.value());
        // P1 is waiting on S1.
        add_last(&mut space, s1, p1);

        // P2 (the active process) signals S1: P1 outranks and preempts.
        let to_p1 = semaphore_signal(&mut space, s1, here).unwrap();
        assert_eq!(to_p1, Some(p1_ctx.handle()));
        let p2 = {
            // The previous active process went to its ready list.
            let list = ready_list(&space, 4).unwrap();
            fetch(&space, list, list_slot::FIRST_LINK).as_object().unwrap()
        };

        // P1 now waits on S2: P2 runs again.
        let resumed = semaphore_wait(&mut space, s2, p1_ctx).unwrap();
        assert!(resumed.is_some());
        assert_eq!(active_process(&space), Some(p2));

        // The outside signal on S2 hands the processor back to P1.
        let back = semaphore_signal(&mut space, s2, here).unwrap();
        assert_eq!(back, Some(p1_ctx.handle()));
        assert!(list_is_empty(&space, s1));
        assert!(list_is_empty(&space, s2));
    }

    #[test]
    fn suspend_of_queued_process_unlinks_it() {
        let mut space = ObjectSpace::new();
        let sem = new_semaphore(&mut space);
        let here = dummy_context(&mut space);
        let ctx = dummy_context(&mut space);
        let a = new_process(&mut space, 4, ctx.value());
        let b = new_process(&mut space, 4, ctx.value());
        add_last(&mut space, sem, a);
        add_last(&mut space, sem, b);
        assert_eq!(suspend(&mut space, a, here).unwrap(), None);
        assert_eq!(fetch(&space, sem, list_slot::FIRST_LINK), Value::Object(b));
        assert_eq!(fetch(&space, sem, list_slot::LAST_LINK), Value::Object(b));
        assert!(space.is_nil(fetch(&space, a, process_slot::MY_LIST)));
    }
}
