//! The numbered primitive table
//!
//! Each entry declares its index, an unwrap spec for the on-stack
//! arguments (receiver first), a result disposition, and the handler.
//! The dispatcher validates and unwraps the stack, calls the handler, and
//! on success cleans the stack and pushes the result or activates the
//! returned frame. On failure the stack is exactly as the send left it,
//! so the Smalltalk fallback body can run.
//!
//! Handlers that need full control of the stack (variable argument
//! counts, scheduler transfers) register as raw handlers instead.

use std::time::{SystemTime, UNIX_EPOCH};

use smallvec::SmallVec;
use tracing::debug;

use shrew_vm_heap::space::{closure_slot, point_slot};
use shrew_vm_heap::{Body, CompiledMethod, HeapObject, ObjRef, ObjectSpace, Value};

use crate::context::{Context, ctx_slot};
use crate::error::{PrimitiveFailure, VmError, VmEvent};
use crate::interpreter::PrimCall;
use crate::scheduler;
use crate::vm::Vm;

// ==================== Numbering ====================

/// `+` on small integers.
pub const ADD: u16 = 1;
/// `-` on small integers.
pub const SUBTRACT: u16 = 2;
/// `<` on small integers.
pub const LESS_THAN: u16 = 3;
/// `>` on small integers.
pub const GREATER_THAN: u16 = 4;
/// `<=` on small integers.
pub const LESS_OR_EQUAL: u16 = 5;
/// `>=` on small integers.
pub const GREATER_OR_EQUAL: u16 = 6;
/// `=` on small integers.
pub const EQUAL: u16 = 7;
/// `~=` on small integers.
pub const NOT_EQUAL: u16 = 8;
/// `*` on small integers.
pub const MULTIPLY: u16 = 9;
/// Exact `/` on small integers.
pub const DIVIDE: u16 = 10;
/// `\\` (floored remainder).
pub const MOD: u16 = 11;
/// `//` (floored quotient).
pub const DIV: u16 = 12;
/// `quo:` (truncated quotient).
pub const QUO: u16 = 13;
/// `bitAnd:`.
pub const BIT_AND: u16 = 14;
/// `bitOr:`.
pub const BIT_OR: u16 = 15;
/// `bitXor:`.
pub const BIT_XOR: u16 = 16;
/// `bitShift:`.
pub const BIT_SHIFT: u16 = 17;
/// `@`.
pub const MAKE_POINT: u16 = 18;
/// The always-failing primitive.
pub const FAIL: u16 = 19;

/// `asFloat` on small integers.
pub const SMALLINT_AS_FLOAT: u16 = 40;
/// Float `+`.
pub const FLOAT_ADD: u16 = 41;
/// Float `-`.
pub const FLOAT_SUBTRACT: u16 = 42;
/// Float `<`.
pub const FLOAT_LESS_THAN: u16 = 43;
/// Float `>`.
pub const FLOAT_GREATER_THAN: u16 = 44;
/// Float `<=`.
pub const FLOAT_LESS_OR_EQUAL: u16 = 45;
/// Float `>=`.
pub const FLOAT_GREATER_OR_EQUAL: u16 = 46;
/// Float `=`.
pub const FLOAT_EQUAL: u16 = 47;
/// Float `~=`.
pub const FLOAT_NOT_EQUAL: u16 = 48;
/// Float `*`.
pub const FLOAT_MULTIPLY: u16 = 49;
/// Float `/`.
pub const FLOAT_DIVIDE: u16 = 50;
/// `truncated`.
pub const FLOAT_TRUNCATED: u16 = 51;
/// `timesTwoPower:`.
pub const FLOAT_TIMES_TWO_POWER: u16 = 54;
/// `sqrt`.
pub const FLOAT_SQUARE_ROOT: u16 = 55;
/// `sin`.
pub const FLOAT_SIN: u16 = 56;
/// `arcTan`.
pub const FLOAT_ARCTAN: u16 = 57;
/// `ln`.
pub const FLOAT_LOG_N: u16 = 58;
/// `exp`.
pub const FLOAT_EXP: u16 = 59;

/// `at:`.
pub const AT: u16 = 60;
/// `at:put:`.
pub const AT_PUT: u16 = 61;
/// `size`.
pub const SIZE: u16 = 62;
/// `at:` on byte objects, answering Characters.
pub const STRING_AT: u16 = 63;
/// `at:put:` on byte objects.
pub const STRING_AT_PUT: u16 = 64;

/// Literal access on compiled methods.
pub const OBJECT_AT: u16 = 68;
/// Literal store on compiled methods.
pub const OBJECT_AT_PUT: u16 = 69;
/// `new`.
pub const NEW: u16 = 70;
/// `new:`.
pub const NEW_WITH_ARG: u16 = 71;
/// Pairwise one-way become over two element arrays.
pub const ARRAY_BECOME_ONE_WAY: u16 = 72;
/// `instVarAt:`.
pub const INST_VAR_AT: u16 = 73;
/// `instVarAt:put:`.
pub const INST_VAR_AT_PUT: u16 = 74;
/// Identity hash.
pub const AS_OOP: u16 = 75;
/// Store a context's stack pointer.
pub const STORE_STACKP: u16 = 76;
/// First live instance of a class.
pub const SOME_INSTANCE: u16 = 77;
/// Next live instance after the receiver.
pub const NEXT_INSTANCE: u16 = 78;
/// Allocate a compiled method from a header word.
pub const NEW_METHOD: u16 = 79;

/// Old-style block creation.
pub const BLOCK_COPY: u16 = 80;
/// Old-style block activation.
pub const VALUE: u16 = 81;
/// Old-style block activation with an argument array.
pub const VALUE_WITH_ARGS: u16 = 82;
/// `perform:` (always falls back).
pub const PERFORM: u16 = 83;
/// `perform:withArguments:`.
pub const PERFORM_WITH_ARGS: u16 = 84;
/// Semaphore signal.
pub const SIGNAL: u16 = 85;
/// Semaphore wait.
pub const WAIT: u16 = 86;
/// Process resume.
pub const RESUME: u16 = 87;
/// Process suspend.
pub const SUSPEND: u16 = 88;
/// Selective cache flush (coarse here).
pub const FLUSH_CACHE: u16 = 89;

/// Mouse position.
pub const MOUSE_POINT: u16 = 90;
/// Poll one input event into an eight-slot record.
pub const GET_NEXT_EVENT: u16 = 94;
/// BitBlt copyBits, routed to the host plugin.
pub const BITBLT_COPY_BITS: u16 = 96;
/// Adopt the receiver as the cursor form.
pub const BE_CURSOR: u16 = 101;
/// Adopt the receiver as the display form.
pub const BE_DISPLAY: u16 = 102;
/// `replaceFrom:to:with:startingAt:`.
pub const STRING_REPLACE: u16 = 105;
/// Display extent.
pub const SCREEN_SIZE: u16 = 106;
/// Mouse button bits.
pub const MOUSE_BUTTONS: u16 = 107;
/// Consume a key code.
pub const KBD_NEXT: u16 = 108;
/// Peek a key code.
pub const KBD_PEEK: u16 = 109;

/// Identity `==`.
pub const EQUIVALENT: u16 = 110;
/// `class`.
pub const CLASS: u16 = 111;
/// Free-space query (not carried).
pub const BYTES_LEFT: u16 = 112;
/// Terminate the VM.
pub const QUIT: u16 = 113;
/// Drop to the debugger (not carried).
pub const EXIT_TO_DEBUGGER: u16 = 114;
/// Adopt another object's class (not carried).
pub const CHANGE_CLASS: u16 = 115;
/// Flush cache entries for one method's class.
pub const COMPILED_METHOD_FLUSH_CACHE: u16 = 116;
/// Named external call via the host plugin registry.
pub const EXTERNAL_CALL: u16 = 117;
/// Flush lookup state for a symbol.
pub const SYMBOL_FLUSH_CACHE: u16 = 119;

/// Image name query.
pub const IMAGE_NAME: u16 = 121;
/// Low-space semaphore registration (accepted, unused).
pub const LOW_SPACE_SEMAPHORE: u16 = 124;
/// Low-space threshold (accepted, unused).
pub const SIGNAL_AT_BYTES_LEFT: u16 = 125;
/// Batch display updates.
pub const DEFER_UPDATES: u16 = 126;
/// Direct rectangle fill (not carried).
pub const DRAW_RECTANGLE: u16 = 127;

/// Two-way identity swap of receiver and argument.
pub const BECOME: u16 = 128;
/// The special-objects array.
pub const SPECIAL_OBJECTS_ARRAY: u16 = 129;
/// Full collection.
pub const FULL_GC: u16 = 130;
/// Incremental collection (same collector here).
pub const INC_GC: u16 = 131;
/// Pairwise two-way become over two element arrays, with rollback.
pub const ARRAY_BECOME: u16 = 132;
/// Interrupt key registration.
pub const SET_INTERRUPT_KEY: u16 = 133;
/// User-interrupt semaphore registration.
pub const INTERRUPT_SEMAPHORE: u16 = 134;

/// Millisecond clock.
pub const MILLISECOND_CLOCK: u16 = 135;
/// Timer-semaphore wake tick.
pub const SIGNAL_AT_MILLISECONDS: u16 = 136;
/// Seconds since the 1901 epoch.
pub const SECONDS_CLOCK: u16 = 137;

/// Audible beep.
pub const BEEP: u16 = 140;
/// VM executable directory.
pub const VM_PATH: u16 = 142;
/// 16-bit indexed read.
pub const SHORT_AT: u16 = 143;
/// 16-bit indexed write.
pub const SHORT_AT_PUT: u16 = 144;
/// Bulk fill of byte or word objects.
pub const FILL: u16 = 145;
/// Shallow copy.
pub const CLONE: u16 = 148;

/// Close a file descriptor.
pub const FILE_CLOSE: u16 = 151;
/// Open a file.
pub const FILE_OPEN: u16 = 153;
/// Write a span of a string to a descriptor.
pub const FILE_WRITE: u16 = 158;
/// Host path separator.
pub const DIRECTORY_DELIMITER: u16 = 161;

/// `withArgs:executeMethod:`.
pub const WITH_ARGS_EXECUTE_METHOD: u16 = 188;

/// Marker carried by `ensure:`/`ifCurtailed:` methods; never runs.
pub const ENSURE_MARKER: u16 = 198;

/// Closure creation with copied values.
pub const CLOSURE_COPY_WITH_COPIED_VALUES: u16 = 200;
/// `value`.
pub const CLOSURE_VALUE: u16 = 201;
/// `value:`.
pub const CLOSURE_VALUE_ARG: u16 = 202;
/// `value:value:`.
pub const CLOSURE_VALUE_2: u16 = 203;
/// `value:value:value:`.
pub const CLOSURE_VALUE_3: u16 = 204;
/// `value:value:value:value:`.
pub const CLOSURE_VALUE_4: u16 = 205;
/// `valueWithArguments:`.
pub const CLOSURE_VALUE_WITH_ARGS: u16 = 206;

/// `at:` on contexts.
pub const CONTEXT_AT: u16 = 210;
/// `at:put:` on contexts.
pub const CONTEXT_AT_PUT: u16 = 211;
/// `size` on contexts.
pub const CONTEXT_SIZE: u16 = 212;

/// `valueNoContextSwitch`.
pub const CLOSURE_VALUE_NO_SWITCH: u16 = 221;
/// `valueNoContextSwitch:`.
pub const CLOSURE_VALUE_NO_SWITCH_ARG: u16 = 222;

/// Relinquish the processor for about N microseconds.
pub const IDLE_FOR_MICROSECONDS: u16 = 230;
/// Flush pending display updates.
pub const FORCE_DISPLAY_UPDATE: u16 = 231;

/// VM parameter inspection.
pub const VM_PARAMETERS: u16 = 254;

/// Quick method: return the receiver.
pub const PUSH_SELF: u16 = 256;
/// Quick method: return `true`.
pub const PUSH_TRUE: u16 = 257;
/// Quick method: return `false`.
pub const PUSH_FALSE: u16 = 258;
/// Quick method: return `nil`.
pub const PUSH_NIL: u16 = 259;
/// Quick method: return `-1`.
pub const PUSH_MINUS_ONE: u16 = 260;
/// Quick method: return `0`.
pub const PUSH_ZERO: u16 = 261;
/// Quick method: return `1`.
pub const PUSH_ONE: u16 = 262;
/// Quick method: return `2`.
pub const PUSH_TWO: u16 = 263;

/// First quick inst-var-at index.
pub const FIRST_INST_VAR: u16 = 264;
/// Last quick inst-var-at index.
pub const LAST_INST_VAR: u16 = 519;

/// Size of the dense table; the inst-var range sits beyond it.
pub const TABLE_SIZE: usize = 576;

// ==================== Table machinery ====================

/// Expected type of one on-stack argument, receiver included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSpec {
    /// Tagged integer
    Int,
    /// Non-negative integer fitting 32 bits
    Uint32,
    /// 1-based index, auto-decremented
    Index1,
    /// Boxed float
    Float,
    /// Any value
    Object,
    /// Character
    Char,
    /// `true` or anything else (anything else reads as false)
    Bool,
    /// Byte object, as text
    Str,
    /// Pointers object, as its indexable elements
    List,
}

/// An unwrapped argument.
#[derive(Debug, Clone)]
pub enum PrimArg {
    /// Tagged integer
    Int(i64),
    /// 32-bit unsigned
    Uint(u32),
    /// 0-based index (may be negative before validation)
    Index(i64),
    /// Unboxed float
    Float(f64),
    /// Any value
    Obj(Value),
    /// Character code
    Char(u8),
    /// Native bool
    Bool(bool),
    /// Text of a byte object
    Str(String),
    /// Elements of a pointers object
    List(Vec<Value>),
}

impl PrimArg {
    fn int(&self) -> i64 {
        match self {
            PrimArg::Int(i) | PrimArg::Index(i) => *i,
            _ => unreachable!("unwrap spec mismatch"),
        }
    }

    fn uint(&self) -> u32 {
        match self {
            PrimArg::Uint(u) => *u,
            _ => unreachable!("unwrap spec mismatch"),
        }
    }

    fn float(&self) -> f64 {
        match self {
            PrimArg::Float(f) => *f,
            _ => unreachable!("unwrap spec mismatch"),
        }
    }

    fn value(&self) -> Value {
        match self {
            PrimArg::Obj(v) => *v,
            _ => unreachable!("unwrap spec mismatch"),
        }
    }

    fn object(&self) -> Result<ObjRef, PrimitiveFailure> {
        self.value().as_object().ok_or(PrimitiveFailure::Failed)
    }

    fn char_code(&self) -> u8 {
        match self {
            PrimArg::Char(c) => *c,
            _ => unreachable!("unwrap spec mismatch"),
        }
    }

    fn boolean(&self) -> bool {
        match self {
            PrimArg::Bool(b) => *b,
            _ => unreachable!("unwrap spec mismatch"),
        }
    }

    fn text(&self) -> &str {
        match self {
            PrimArg::Str(s) => s,
            _ => unreachable!("unwrap spec mismatch"),
        }
    }

    fn list(&self) -> &[Value] {
        match self {
            PrimArg::List(values) => values,
            _ => unreachable!("unwrap spec mismatch"),
        }
    }
}

/// What the dispatcher does with a spec handler's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Pop the unwrapped values, push the answer
    Push,
    /// Pop the unwrapped values, push nothing
    NoResult,
    /// Pop the unwrapped values, activate the answered context
    NewFrame,
}

/// Outcome of a raw handler, which owns its stack discipline.
#[derive(Debug)]
pub enum PrimOutcome {
    /// Pop arguments and receiver, push this
    Value(Value),
    /// Stack already arranged
    Stay,
    /// Run this frame as the send's activation
    Activate {
        /// Frame to run
        context: ObjRef,
        /// Whether entry may take the cooperative-switch check
        may_context_switch: bool,
    },
    /// Cooperative switch to another process's context
    Switch {
        /// Context to make active
        context: ObjRef,
    },
    /// Forward a control-flow event produced while the handler ran
    Event(VmEvent),
}

/// Result of a spec handler.
pub type SpecResult = Result<Value, PrimitiveFailure>;
/// A spec handler: unwrapped arguments in, one value out.
pub type SpecFn = fn(&mut Vm, Context, &[PrimArg]) -> SpecResult;
/// Result of a raw handler.
pub type RawResult = Result<PrimOutcome, PrimitiveFailure>;
/// A raw handler: manages the stack itself.
pub type RawFn = fn(&mut Vm, Context, usize, Option<ObjRef>) -> RawResult;

/// A handler plus its calling convention.
#[derive(Clone, Copy)]
pub enum PrimitiveCode {
    /// Declarative unwrap/pack convention
    Spec {
        /// Expected stack, receiver first
        unwrap: &'static [ArgSpec],
        /// Result disposition
        result: ResultKind,
        /// Whether an activated frame may take the switch check
        may_context_switch: bool,
        /// The handler
        f: SpecFn,
    },
    /// Full-control convention
    Raw(RawFn),
}

/// One numbered table entry.
pub struct PrimitiveDef {
    /// Table index
    pub index: u16,
    /// Name for traces
    pub name: &'static str,
    /// Whether the caller must flush its virtual pc first
    pub store_pc: bool,
    /// The handler
    pub code: PrimitiveCode,
}

/// The built table: contiguous, with failing defaults for empty slots.
pub struct PrimitiveTable {
    slots: Vec<Option<&'static PrimitiveDef>>,
}

impl PrimitiveTable {
    /// Build the table from the static definitions.
    pub fn new() -> PrimitiveTable {
        let mut slots: Vec<Option<&'static PrimitiveDef>> = vec![None; TABLE_SIZE];
        for def in DEFS {
            let slot = &mut slots[usize::from(def.index)];
            debug_assert!(slot.is_none(), "duplicate primitive {}", def.index);
            *slot = Some(def);
        }
        PrimitiveTable { slots }
    }

    /// The entry at `index`, if any is registered.
    pub fn get(&self, index: u16) -> Option<&'static PrimitiveDef> {
        self.slots.get(usize::from(index)).copied().flatten()
    }
}

impl Default for PrimitiveTable {
    fn default() -> Self {
        PrimitiveTable::new()
    }
}

/// Unwrap the stack against `specs`; `None` means the primitive fails.
pub(crate) fn unwrap_stack(
    space: &ObjectSpace,
    ctx: Context,
    specs: &[ArgSpec],
) -> Option<SmallVec<[PrimArg; 4]>> {
    let n = specs.len();
    if ctx.stackp(space) < n {
        return None;
    }
    let mut args = SmallVec::with_capacity(n);
    for (i, spec) in specs.iter().enumerate() {
        let w = ctx.peek(space, n - 1 - i);
        let arg = match spec {
            ArgSpec::Int => PrimArg::Int(w.as_small_int()?),
            ArgSpec::Uint32 => PrimArg::Uint(space.unwrap_uint32(w).ok()?),
            ArgSpec::Index1 => PrimArg::Index(w.as_small_int()? - 1),
            ArgSpec::Float => PrimArg::Float(space.unwrap_float(w).ok()?),
            ArgSpec::Object => PrimArg::Obj(w),
            ArgSpec::Char => PrimArg::Char(space.unwrap_char(w).ok()?),
            ArgSpec::Bool => PrimArg::Bool(w == space.specials.bool_true),
            ArgSpec::Str => PrimArg::Str(space.unwrap_string(w).ok()?),
            ArgSpec::List => PrimArg::List(space.unwrap_array(w).ok()?),
        };
        args.push(arg);
    }
    Some(args)
}

// ==================== Shared helpers ====================

const FAILED: PrimitiveFailure = PrimitiveFailure::Failed;

fn wrap_int(space: &ObjectSpace, i: i64) -> SpecResult {
    space.wrap_int(i).map_err(|_| FAILED)
}

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    a - b * floor_div(a, b)
}

fn valid_index(space: &ObjectSpace, r: ObjRef, index: i64) -> Result<usize, PrimitiveFailure> {
    let size = space.indexed_size(r).map_err(|_| FAILED)?;
    usize::try_from(index)
        .ok()
        .filter(|&i| i < size)
        .ok_or(FAILED)
}

fn new_point(vm: &mut Vm, x: i64, y: i64) -> SpecResult {
    let class = vm.space.classes.point;
    let point = vm.space.new_instance(class).map_err(|_| FAILED)?;
    let _ = vm.space.heap.store(point, point_slot::X, Value::SmallInt(x));
    let _ = vm.space.heap.store(point, point_slot::Y, Value::SmallInt(y));
    Ok(Value::Object(point))
}

/// Activate a `BlockClosure` with the given arguments.
fn activate_closure(vm: &mut Vm, ctx: Context, block: Value, args: &[Value]) -> SpecResult {
    let block = block.as_object().ok_or(FAILED)?;
    if vm.space.heap.class_of(block) != vm.space.classes.block_closure {
        return Err(FAILED);
    }
    let expected = vm
        .space
        .heap
        .fetch(block, closure_slot::NUM_ARGS)
        .ok()
        .and_then(|v| v.as_small_int())
        .ok_or(FAILED)?;
    if expected != args.len() as i64 {
        return Err(FAILED);
    }
    let outer = vm
        .space
        .heap
        .fetch(block, closure_slot::OUTER_CONTEXT)
        .ok()
        .and_then(|v| v.as_object())
        .ok_or(FAILED)?;
    let outer_class = vm.space.heap.class_of(outer);
    if outer_class != vm.space.classes.method_context
        && outer_class != vm.space.classes.block_context
    {
        return Err(FAILED);
    }
    let frame = Context::new_closure_frame(&mut vm.space, block, args, ctx.value())
        .map_err(|_| FAILED)?;
    Ok(frame.value())
}

fn event_outcome(result: Result<(), VmEvent>) -> RawResult {
    match result {
        Ok(()) => Ok(PrimOutcome::Stay),
        Err(VmEvent::ProcessSwitch { context }) => Ok(PrimOutcome::Switch { context }),
        Err(event) => Ok(PrimOutcome::Event(event)),
    }
}

// ==================== Small integer arithmetic ====================

fn prim_add(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let sum = args[0].int().checked_add(args[1].int()).ok_or(FAILED)?;
    wrap_int(&vm.space, sum)
}

fn prim_subtract(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let difference = args[0].int().checked_sub(args[1].int()).ok_or(FAILED)?;
    wrap_int(&vm.space, difference)
}

fn prim_multiply(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let product = args[0].int().checked_mul(args[1].int()).ok_or(FAILED)?;
    wrap_int(&vm.space, product)
}

fn prim_less_than(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].int() < args[1].int()))
}

fn prim_greater_than(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].int() > args[1].int()))
}

fn prim_less_or_equal(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].int() <= args[1].int()))
}

fn prim_greater_or_equal(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].int() >= args[1].int()))
}

fn prim_equal(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].int() == args[1].int()))
}

fn prim_not_equal(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].int() != args[1].int()))
}

// Exact division only; inexact or zero divisors fall back.
fn prim_divide(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let (a, b) = (args[0].int(), args[1].int());
    if b == 0 || a % b != 0 {
        return Err(FAILED);
    }
    wrap_int(&vm.space, a / b)
}

fn prim_mod(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let (a, b) = (args[0].int(), args[1].int());
    if b == 0 {
        return Err(FAILED);
    }
    wrap_int(&vm.space, floor_mod(a, b))
}

fn prim_div(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let (a, b) = (args[0].int(), args[1].int());
    if b == 0 {
        return Err(FAILED);
    }
    wrap_int(&vm.space, floor_div(a, b))
}

fn prim_quo(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let (a, b) = (args[0].int(), args[1].int());
    if b == 0 {
        return Err(FAILED);
    }
    wrap_int(&vm.space, a / b)
}

fn prim_bit_and(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    wrap_int(&vm.space, i64::from(args[0].uint() & args[1].uint()))
}

fn prim_bit_or(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    wrap_int(&vm.space, i64::from(args[0].uint() | args[1].uint()))
}

fn prim_bit_xor(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    wrap_int(&vm.space, i64::from(args[0].uint() ^ args[1].uint()))
}

fn prim_bit_shift(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].value().as_small_int().ok_or(FAILED)?;
    let shift = args[1].int();
    if shift.abs() >= 64 {
        return Err(FAILED);
    }
    if shift > 0 {
        let shifted = receiver.checked_shl(shift as u32).ok_or(FAILED)?;
        // Reject shifts that lose bits.
        if shifted >> shift != receiver {
            return Err(FAILED);
        }
        wrap_int(&vm.space, shifted)
    } else {
        wrap_int(&vm.space, receiver >> (-shift))
    }
}

fn prim_make_point(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    new_point(vm, args[0].int(), args[1].int())
}

fn prim_fail(vm: &mut Vm, ctx: Context, _argc: usize, _method: Option<ObjRef>) -> RawResult {
    debug!(stack = %ctx.print_stack(&vm.space), "explicit primitive failure");
    Err(FAILED)
}

// ==================== Floats ====================

fn prim_smallint_as_float(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_float(args[0].int() as f64))
}

fn prim_float_add(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_float(args[0].float() + args[1].float()))
}

fn prim_float_subtract(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_float(args[0].float() - args[1].float()))
}

fn prim_float_multiply(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_float(args[0].float() * args[1].float()))
}

fn prim_float_divide(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let divisor = args[1].float();
    if divisor == 0.0 {
        return Err(FAILED);
    }
    Ok(vm.space.wrap_float(args[0].float() / divisor))
}

fn prim_float_less_than(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].float() < args[1].float()))
}

fn prim_float_greater_than(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].float() > args[1].float()))
}

fn prim_float_less_or_equal(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].float() <= args[1].float()))
}

fn prim_float_greater_or_equal(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].float() >= args[1].float()))
}

fn prim_float_equal(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].float() == args[1].float()))
}

fn prim_float_not_equal(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].float() != args[1].float()))
}

fn prim_float_truncated(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let f = args[0].float().trunc();
    if !f.is_finite() || f.abs() >= (1u64 << 62) as f64 {
        return Err(FAILED);
    }
    wrap_int(&vm.space, f as i64)
}

fn prim_float_times_two_power(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let exponent = args[1].int().clamp(-2100, 2100) as i32;
    Ok(vm.space.wrap_float(args[0].float() * 2f64.powi(exponent)))
}

fn prim_float_square_root(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let f = args[0].float();
    if f < 0.0 {
        return Err(FAILED);
    }
    Ok(vm.space.wrap_float(f.sqrt()))
}

fn prim_float_sin(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_float(args[0].float().sin()))
}

fn prim_float_arctan(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_float(args[0].float().atan()))
}

fn prim_float_log_n(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let f = args[0].float();
    let result = if f == 0.0 {
        f64::NEG_INFINITY
    } else if f < 0.0 {
        f64::NAN
    } else {
        f.ln()
    };
    Ok(vm.space.wrap_float(result))
}

fn prim_float_exp(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_float(args[0].float().exp()))
}

// ==================== Subscripting ====================

fn prim_at(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    if argc != 1 {
        return Err(FAILED);
    }
    let receiver = ctx.peek(&vm.space, 1).as_object().ok_or(FAILED)?;
    let key = ctx.peek(&vm.space, 0);
    // Method dictionaries subscript by selector.
    if matches!(vm.space.heap.object(receiver).body, Body::MethodDict(_)) {
        let selector = key.as_object().ok_or(FAILED)?;
        let method = vm.space.dict_at(receiver, selector).ok_or(FAILED)?;
        return Ok(PrimOutcome::Value(Value::Object(method)));
    }
    let index = key.as_small_int().ok_or(FAILED)? - 1;
    let index = valid_index(&vm.space, receiver, index)?;
    let value = vm.space.indexed_at(receiver, index).map_err(|_| FAILED)?;
    Ok(PrimOutcome::Value(value))
}

fn prim_at_put(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    if argc != 2 {
        return Err(FAILED);
    }
    let receiver = ctx.peek(&vm.space, 2).as_object().ok_or(FAILED)?;
    let key = ctx.peek(&vm.space, 1);
    let value = ctx.peek(&vm.space, 0);
    if matches!(vm.space.heap.object(receiver).body, Body::MethodDict(_)) {
        let selector = key.as_object().ok_or(FAILED)?;
        let method = value.as_object().ok_or(FAILED)?;
        vm.space
            .dict_at_put(receiver, selector, method)
            .map_err(|_| FAILED)?;
        // A method dictionary changed somewhere: every cached pair that
        // could inherit through it is now suspect.
        vm.cache.flush_all();
        return Ok(PrimOutcome::Value(value));
    }
    let index = key.as_small_int().ok_or(FAILED)? - 1;
    let index = valid_index(&vm.space, receiver, index)?;
    vm.space
        .indexed_at_put(receiver, index, value)
        .map_err(|_| FAILED)?;
    Ok(PrimOutcome::Value(value))
}

fn prim_size(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    if matches!(vm.space.heap.object(receiver).body, Body::MethodDict(_)) {
        return wrap_int(&vm.space, vm.space.heap.raw_len(receiver) as i64);
    }
    let class = vm.space.heap.class_of(receiver);
    if !vm.space.instance_spec(class).map_err(|_| FAILED)?.is_variable() {
        return Err(FAILED);
    }
    let size = vm.space.indexed_size(receiver).map_err(|_| FAILED)?;
    wrap_int(&vm.space, size as i64)
}

fn prim_string_at(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let index = valid_index(&vm.space, receiver, args[1].int())?;
    let byte = match &vm.space.heap.object(receiver).body {
        Body::Bytes(bytes) => bytes[index],
        _ => return Err(FAILED),
    };
    Ok(vm.space.wrap_char(byte))
}

fn prim_string_at_put(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let byte = args[2].char_code();
    let index = usize::try_from(args[1].int()).map_err(|_| FAILED)?;
    match &mut vm.space.heap.object_mut(receiver).body {
        Body::Bytes(bytes) => {
            let slot = bytes.get_mut(index).ok_or(FAILED)?;
            *slot = byte;
        }
        Body::Method(method) => {
            let slot = method.bytes.get_mut(index).ok_or(FAILED)?;
            *slot = byte;
        }
        _ => return Err(FAILED),
    }
    Ok(vm.space.wrap_char(byte))
}

// ==================== Storage management ====================

fn prim_object_at(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let index = args[1].int();
    let method = vm.space.method(receiver).map_err(|_| FAILED)?;
    if index == 0 {
        return wrap_int(&vm.space, i64::from(method.header().encode()));
    }
    let index = usize::try_from(index - 1).map_err(|_| FAILED)?;
    method.literal(index).map_err(|_| FAILED)
}

fn prim_object_at_put(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let index = args[1].int();
    let value = args[2].value();
    if index == 0 {
        // Header stores may retune everything except the literal count,
        // which is pinned to the allocated literal frame.
        let word = value
            .as_small_int()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or(FAILED)?;
        let header = shrew_vm_bytecode::MethodHeader::decode(word).map_err(|_| FAILED)?;
        let method = vm.space.method_mut(receiver).map_err(|_| FAILED)?;
        if usize::from(header.literal_count) != method.literals.len() {
            return Err(FAILED);
        }
        method.primitive = header.primitive_index;
        method.arg_count = header.arg_count;
        method.temp_count = header.temp_count.max(header.arg_count);
        method.large_frame = header.large_frame;
        return Ok(value);
    }
    let index = usize::try_from(index - 1).map_err(|_| FAILED)?;
    let method = vm.space.method_mut(receiver).map_err(|_| FAILED)?;
    method.set_literal(index, value).map_err(|_| FAILED)?;
    Ok(value)
}

fn prim_new(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let class = args[0].object()?;
    let spec = vm.space.instance_spec(class).map_err(|_| FAILED)?;
    if spec.is_variable() {
        return Err(FAILED);
    }
    let instance = vm.space.new_instance(class).map_err(|_| FAILED)?;
    Ok(Value::Object(instance))
}

fn prim_new_with_arg(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let class = args[0].object()?;
    let size = usize::try_from(args[1].int()).map_err(|_| FAILED)?;
    let spec = vm.space.instance_spec(class).map_err(|_| FAILED)?;
    if !spec.is_variable() && size != 0 {
        return Err(FAILED);
    }
    let instance = vm.space.new_instance_sized(class, size).map_err(|_| FAILED)?;
    Ok(Value::Object(instance))
}

fn prim_inst_var_at(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let class = vm.space.heap.class_of(receiver);
    let fixed = i64::from(vm.space.instance_spec(class).map_err(|_| FAILED)?.fixed_fields);
    let index = args[1].int();
    if !(0..fixed).contains(&index) {
        return Err(FAILED);
    }
    vm.space.heap.fetch(receiver, index as usize).map_err(|_| FAILED)
}

fn prim_inst_var_at_put(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let class = vm.space.heap.class_of(receiver);
    let fixed = i64::from(vm.space.instance_spec(class).map_err(|_| FAILED)?.fixed_fields);
    let index = args[1].int();
    if !(0..fixed).contains(&index) {
        return Err(FAILED);
    }
    let value = args[2].value();
    vm.space
        .heap
        .store(receiver, index as usize, value)
        .map_err(|_| FAILED)?;
    Ok(value)
}

fn prim_as_oop(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let hash = vm.space.heap.identity_hash(receiver);
    wrap_int(&vm.space, i64::from(hash))
}

fn prim_store_stackp(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let frame = args[0].object()?;
    let stackp = args[1].int();
    if stackp < 0 {
        return Err(FAILED);
    }
    vm.space
        .heap
        .store(frame, ctx_slot::STACKP, Value::SmallInt(stackp))
        .map_err(|_| FAILED)?;
    Ok(args[0].value())
}

fn prim_some_instance(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let class = args[0].object()?;
    let first = vm.space.heap.instances_of(class).next().ok_or(FAILED)?;
    Ok(Value::Object(first))
}

fn prim_next_instance(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let class = vm.space.heap.class_of(receiver);
    let mut seen = false;
    for instance in vm.space.heap.instances_of(class) {
        if seen {
            return Ok(Value::Object(instance));
        }
        if instance == receiver {
            seen = true;
        }
    }
    Err(FAILED)
}

fn prim_new_method(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let byte_count = usize::try_from(args[1].int()).map_err(|_| FAILED)?;
    let word = u32::try_from(args[2].int()).map_err(|_| FAILED)?;
    let nil = vm.space.nil();
    let method = CompiledMethod::from_header(word, byte_count, nil).map_err(|_| FAILED)?;
    let class = vm.space.classes.compiled_method;
    let r = vm
        .space
        .heap
        .allocate(HeapObject::new(class, Body::Method(method)));
    Ok(Value::Object(r))
}

// ==================== Blocks and control ====================

fn prim_block_copy(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = Context::from_ref(args[0].object()?);
    let arg_count = usize::try_from(args[1].int()).map_err(|_| FAILED)?;
    let home = receiver.home(&vm.space).ok_or(FAILED)?;
    // The caller's pc was flushed for us; the block body starts past the
    // jump that follows this primitive's bytecode.
    let initial_pc = ctx.pc(&vm.space).ok_or(FAILED)? + 2;
    let block = Context::new_block_context(&mut vm.space, home, arg_count, initial_pc)
        .map_err(|_| FAILED)?;
    Ok(block.value())
}

fn prim_value(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    let receiver = ctx.peek(&vm.space, argc).as_object().ok_or(FAILED)?;
    if vm.space.heap.class_of(receiver) != vm.space.classes.block_context {
        return Err(FAILED);
    }
    let block = Context::from_ref(receiver);
    let expected = block.block_arg_count(&vm.space);
    if argc != expected {
        return Err(FAILED);
    }
    let args = ctx.pop_and_return_n(&mut vm.space, expected);
    block.reset_stack(&mut vm.space);
    block.push_all(&mut vm.space, &args);
    ctx.pop(&mut vm.space); // receiver
    let initial = block.block_initial_pc(&vm.space);
    block.store_pc(&mut vm.space, initial);
    block.set_sender(&mut vm.space, ctx.value());
    Ok(PrimOutcome::Activate {
        context: receiver,
        may_context_switch: true,
    })
}

fn prim_value_with_args(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    if vm.space.heap.class_of(receiver) != vm.space.classes.block_context {
        return Err(FAILED);
    }
    let block = Context::from_ref(receiver);
    let block_args = args[1].list();
    if block.block_arg_count(&vm.space) != block_args.len() {
        return Err(FAILED);
    }
    block.reset_stack(&mut vm.space);
    let block_args = block_args.to_vec();
    block.push_all(&mut vm.space, &block_args);
    let initial = block.block_initial_pc(&vm.space);
    block.store_pc(&mut vm.space, initial);
    block.set_sender(&mut vm.space, ctx.value());
    Ok(block.value())
}

fn prim_perform(
    _vm: &mut Vm,
    _ctx: Context,
    _argc: usize,
    _method: Option<ObjRef>,
) -> RawResult {
    Err(FAILED)
}

fn prim_perform_with_args(
    vm: &mut Vm,
    ctx: Context,
    argc: usize,
    _method: Option<ObjRef>,
) -> RawResult {
    if argc != 2 {
        return Err(FAILED);
    }
    let receiver = ctx.peek(&vm.space, 2);
    let selector = ctx.peek(&vm.space, 1).as_object().ok_or(FAILED)?;
    let args = vm
        .space
        .unwrap_array(ctx.peek(&vm.space, 0))
        .map_err(|_| FAILED)?;
    ctx.pop_n(&mut vm.space, 2);

    let class = vm.space.class_of(receiver);
    let Ok(method) = vm.cache.lookup(&vm.space, class, selector) else {
        // Build the doesNotUnderstand: activation ourselves; the argument
        // array is already off the stack.
        ctx.pop(&mut vm.space); // receiver
        let arguments = vm.space.wrap_list(args);
        let message_class = vm.space.classes.message;
        let message = vm.space.new_instance(message_class).map_err(|_| FAILED)?;
        let _ = vm.space.heap.store(
            message,
            shrew_vm_heap::space::message_slot::SELECTOR,
            Value::Object(selector),
        );
        let _ = vm.space.heap.store(
            message,
            shrew_vm_heap::space::message_slot::ARGUMENTS,
            Value::Object(arguments),
        );
        let dnu = vm.space.symbol("doesNotUnderstand:");
        return match vm.cache.lookup(&vm.space, class, dnu) {
            Ok(dnu_method) => {
                let frame = Context::new_method_frame(
                    &mut vm.space,
                    dnu_method,
                    receiver,
                    &[Value::Object(message)],
                    ctx.value(),
                )
                .map_err(|_| FAILED)?;
                Ok(PrimOutcome::Activate {
                    context: frame.handle(),
                    may_context_switch: true,
                })
            }
            Err(_) => Ok(PrimOutcome::Event(VmEvent::Abort(
                VmError::MissingDoesNotUnderstand {
                    class_name: vm.space.class_name(class),
                },
            ))),
        };
    };

    let primitive = vm.space.method(method).map_err(|_| FAILED)?.primitive;
    if primitive != 0 {
        ctx.push_all(&mut vm.space, &args);
        match vm.try_primitive(ctx, primitive, args.len(), Some(method), None) {
            Ok(PrimCall::Done) => return Ok(PrimOutcome::Stay),
            Ok(PrimCall::Failed) => ctx.pop_n(&mut vm.space, args.len()),
            Err(event) => return Ok(PrimOutcome::Event(event)),
        }
    }
    let frame = Context::new_method_frame(&mut vm.space, method, receiver, &args, ctx.value())
        .map_err(|_| FAILED)?;
    ctx.pop(&mut vm.space); // receiver
    Ok(PrimOutcome::Activate {
        context: frame.handle(),
        may_context_switch: true,
    })
}

fn prim_with_args_execute_method(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    let method = args[2].object()?;
    let compiled = vm.space.method(method).map_err(|_| FAILED)?;
    if compiled.primitive != 0 {
        return Err(FAILED);
    }
    if usize::from(compiled.arg_count) != args[1].list().len() {
        return Err(FAILED);
    }
    let call_args = args[1].list().to_vec();
    let frame = Context::new_method_frame(
        &mut vm.space,
        method,
        args[0].value(),
        &call_args,
        ctx.value(),
    )
    .map_err(|_| FAILED)?;
    Ok(frame.value())
}

// ==================== Scheduling ====================

fn require_class(vm: &Vm, v: Value, class: ObjRef) -> Result<ObjRef, PrimitiveFailure> {
    let r = v.as_object().ok_or(FAILED)?;
    if vm.space.heap.class_of(r) != class {
        return Err(FAILED);
    }
    Ok(r)
}

fn prim_signal(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    let semaphore = require_class(vm, ctx.peek(&vm.space, argc), vm.space.classes.semaphore)?;
    match scheduler::semaphore_signal(&mut vm.space, semaphore, ctx) {
        Ok(Some(context)) => Ok(PrimOutcome::Switch { context }),
        Ok(None) => Ok(PrimOutcome::Stay),
        Err(error) => Ok(PrimOutcome::Event(VmEvent::Abort(error))),
    }
}

fn prim_wait(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    let semaphore = require_class(vm, ctx.peek(&vm.space, argc), vm.space.classes.semaphore)?;
    match scheduler::semaphore_wait(&mut vm.space, semaphore, ctx) {
        Ok(Some(context)) => Ok(PrimOutcome::Switch { context }),
        Ok(None) => Ok(PrimOutcome::Stay),
        Err(error) => Ok(PrimOutcome::Event(VmEvent::Abort(error))),
    }
}

fn prim_resume(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    let process = require_class(vm, ctx.peek(&vm.space, argc), vm.space.classes.process)?;
    match scheduler::resume(&mut vm.space, process, ctx) {
        Ok(Some(context)) => Ok(PrimOutcome::Switch { context }),
        Ok(None) => Ok(PrimOutcome::Stay),
        Err(error) => Ok(PrimOutcome::Event(VmEvent::Abort(error))),
    }
}

fn prim_suspend(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    let process = require_class(vm, ctx.peek(&vm.space, argc), vm.space.classes.process)?;
    match scheduler::suspend(&mut vm.space, process, ctx) {
        Ok(Some(context)) => Ok(PrimOutcome::Switch { context }),
        Ok(None) => Ok(PrimOutcome::Stay),
        Err(error) => Ok(PrimOutcome::Event(VmEvent::Abort(error))),
    }
}

fn prim_flush_cache(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    vm.cache.flush_all();
    Ok(args[0].value())
}

// ==================== Input and display ====================

fn prim_mouse_point(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    let (x, y) = vm.host.mouse_point().map_err(|_| FAILED)?;
    new_point(vm, x, y)
}

fn prim_get_next_event(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let into = args[1].object()?;
    let now = vm.milliseconds_now();
    let event = vm.host.next_event(now).map_err(|_| FAILED)?;
    for (slot, &field) in event.iter().enumerate() {
        vm.space
            .heap
            .store(into, slot, Value::SmallInt(field))
            .map_err(|_| FAILED)?;
    }
    Ok(args[0].value())
}

fn prim_copy_bits(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    let Vm { host, space, .. } = vm;
    host.named_call("BitBltPlugin", "primitiveCopyBits", space, ctx, argc)
        .map_err(|_| FAILED)?;
    Ok(PrimOutcome::Stay)
}

fn prim_be_cursor(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    if argc > 1 {
        return Err(FAILED);
    }
    let receiver = ctx.peek(&vm.space, argc);
    vm.space.specials.cursor = receiver;
    Ok(PrimOutcome::Value(receiver))
}

fn prim_be_display(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    if vm.space.heap.object(receiver).slots().map_or(0, |s| s.len()) < 4 {
        return Err(FAILED);
    }
    let field = |i: usize| {
        vm.space
            .heap
            .fetch(receiver, i)
            .ok()
            .and_then(|v| v.as_small_int())
            .unwrap_or(0)
    };
    let (width, height, depth) = (field(1), field(2), field(3));
    vm.host.be_display(width, height, depth).map_err(|_| FAILED)?;
    vm.space.specials.display = args[0].value();
    Ok(args[0].value())
}

fn prim_string_replace(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let start = args[1].int();
    let stop = args[2].int();
    let replacement = args[3].object()?;
    let rep_start = args[4].int();
    if start < 0 || start - 1 > stop || rep_start < 0 {
        return Err(FAILED);
    }
    // Same storage format on both sides, destination excluded from
    // growing: range checks happen here, not per element.
    let same_layout = std::mem::discriminant(&vm.space.heap.object(receiver).body)
        == std::mem::discriminant(&vm.space.heap.object(replacement).body);
    if !same_layout {
        return Err(FAILED);
    }
    let receiver_size = vm.space.indexed_size(receiver).map_err(|_| FAILED)? as i64;
    let replacement_size = vm.space.indexed_size(replacement).map_err(|_| FAILED)? as i64;
    if stop >= receiver_size || rep_start + (stop - start) >= replacement_size {
        return Err(FAILED);
    }
    let offset = rep_start - start;
    for index in start..=stop {
        let value = vm
            .space
            .indexed_at(replacement, (offset + index) as usize)
            .map_err(|_| FAILED)?;
        vm.space
            .indexed_at_put(receiver, index as usize, value)
            .map_err(|_| FAILED)?;
    }
    Ok(args[0].value())
}

fn prim_screen_size(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    let (width, height) = vm.host.screen_size().map_err(|_| FAILED)?;
    new_point(vm, width, height)
}

fn prim_mouse_buttons(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    let buttons = vm.host.mouse_buttons().map_err(|_| FAILED)?;
    wrap_int(&vm.space, buttons)
}

fn prim_kbd_next(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    match vm.host.next_keycode().map_err(|_| FAILED)? {
        Some(code) => wrap_int(&vm.space, code),
        None => Ok(vm.space.nil()),
    }
}

fn prim_kbd_peek(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    match vm.host.peek_keycode().map_err(|_| FAILED)? {
        Some(code) => wrap_int(&vm.space, code),
        None => Ok(vm.space.nil()),
    }
}

// ==================== Identity and classes ====================

fn prim_equivalent(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.wrap_bool(args[0].value() == args[1].value()))
}

fn prim_class(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(Value::Object(vm.space.class_of(args[0].value())))
}

fn prim_quit(_vm: &mut Vm, _ctx: Context, _argc: usize, _method: Option<ObjRef>) -> RawResult {
    Ok(PrimOutcome::Event(VmEvent::Abort(VmError::Exit {
        reason: "quit primitive called".to_string(),
    })))
}

fn prim_flush_cache_by_method(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    vm.space.method(receiver).map_err(|_| FAILED)?;
    vm.cache.flush_all();
    Ok(args[0].value())
}

fn prim_external_call(
    vm: &mut Vm,
    ctx: Context,
    argc: usize,
    method: Option<ObjRef>,
) -> RawResult {
    let method = method.ok_or(FAILED)?;
    let descriptor = vm
        .space
        .method(method)
        .map_err(|_| FAILED)?
        .literal(0)
        .map_err(|_| FAILED)?
        .as_object()
        .ok_or(FAILED)?;
    if vm.space.heap.raw_len(descriptor) < 2 {
        return Err(FAILED);
    }
    let module = vm
        .space
        .unwrap_string(vm.space.heap.fetch(descriptor, 0).map_err(|_| FAILED)?)
        .map_err(|_| FAILED)?;
    let function = vm
        .space
        .unwrap_string(vm.space.heap.fetch(descriptor, 1).map_err(|_| FAILED)?)
        .map_err(|_| FAILED)?;
    let Vm { host, space, .. } = vm;
    match host
        .named_call(&module, &function, space, ctx, argc)
        .map_err(|_| FAILED)?
    {
        Some(value) => {
            ctx.pop_n(&mut vm.space, argc + 1);
            ctx.push(&mut vm.space, value);
            Ok(PrimOutcome::Stay)
        }
        None => Ok(PrimOutcome::Stay),
    }
}

fn prim_symbol_flush_cache(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    vm.cache.flush_all();
    Ok(args[0].value())
}

fn prim_image_name(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    if argc != 0 {
        return Err(FAILED);
    }
    ctx.pop(&mut vm.space); // receiver
    let name = vm.config.image_name.clone();
    let name = vm.space.wrap_string(&name);
    ctx.push(&mut vm.space, Value::Object(name));
    Ok(PrimOutcome::Stay)
}

fn prim_return_receiver_arg(_vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(args[0].value())
}

fn prim_defer_updates(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let defer = args[1].boolean();
    vm.host.defer_updates(defer);
    Ok(args[0].value())
}

// ==================== Become and memory ====================

// Receiver and argument exchange identities; every existing reference to
// one now denotes the other.
fn prim_become(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    vm.space
        .heap
        .r#become(args[0].value(), args[1].value())
        .map_err(|_| FAILED)?;
    // Identities moved wholesale; cached lookups may now be lies.
    vm.cache.flush_all();
    Ok(args[0].value())
}

// The batch form: elements of the receiver array swap with the matching
// elements of the argument array, all-or-nothing.
fn prim_array_become(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let left = args[0].object()?;
    let right = args[1].object()?;
    let size = vm.space.indexed_size(left).map_err(|_| FAILED)?;
    if size != vm.space.indexed_size(right).map_err(|_| FAILED)? {
        return Err(FAILED);
    }
    let mut swapped: Vec<(Value, Value)> = Vec::new();
    for index in 0..size {
        let a = vm.space.indexed_at(left, index).map_err(|_| FAILED)?;
        let b = vm.space.indexed_at(right, index).map_err(|_| FAILED)?;
        if vm.space.heap.r#become(a, b).is_ok() {
            swapped.push((a, b));
        } else {
            // Roll back the pairs already swapped.
            for (a, b) in swapped.into_iter().rev() {
                let _ = vm.space.heap.r#become(a, b);
            }
            return Err(FAILED);
        }
    }
    vm.cache.flush_all();
    Ok(args[0].value())
}

// One-way batch become: references to each receiver element are forwarded
// to the matching argument element. All pairs validate before anything
// moves, so there is nothing to roll back.
fn prim_array_become_one_way(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let left = args[0].object()?;
    let right = args[1].object()?;
    let size = vm.space.indexed_size(left).map_err(|_| FAILED)?;
    if size != vm.space.indexed_size(right).map_err(|_| FAILED)? {
        return Err(FAILED);
    }
    let mut pairs = Vec::with_capacity(size);
    for index in 0..size {
        let from = vm
            .space
            .indexed_at(left, index)
            .map_err(|_| FAILED)?
            .as_object()
            .ok_or(FAILED)?;
        let to = vm
            .space
            .indexed_at(right, index)
            .map_err(|_| FAILED)?
            .as_object()
            .ok_or(FAILED)?;
        pairs.push((from, to));
    }
    vm.space.heap.become_forward(&pairs);
    vm.cache.flush_all();
    Ok(args[0].value())
}

fn prim_special_objects_array(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    let specials = vm.space.specials;
    let list = vm.space.wrap_list(vec![
        specials.nil,
        specials.bool_false,
        specials.bool_true,
        specials.scheduler,
        specials.display,
        specials.timer_semaphore,
        specials.interrupt_semaphore,
    ]);
    Ok(Value::Object(list))
}

fn prim_collect_garbage(
    vm: &mut Vm,
    ctx: Context,
    _argc: usize,
    _method: Option<ObjRef>,
) -> RawResult {
    let stats = vm.space.collect_garbage(&[ctx.value()]);
    debug!(freed = stats.freed, live = stats.live, "collected");
    ctx.pop(&mut vm.space); // receiver
    let bytes_left = Value::SmallInt(1 << 29);
    ctx.push(&mut vm.space, bytes_left);
    Ok(PrimOutcome::Stay)
}

fn prim_set_interrupt_key(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    vm.host.set_interrupt_key(args[1].int());
    Ok(args[0].value())
}

fn prim_interrupt_semaphore(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let candidate = args[1].value();
    let nil = vm.space.nil();
    vm.space.specials.interrupt_semaphore =
        match require_class(vm, candidate, vm.space.classes.semaphore) {
            Ok(_) => candidate,
            Err(_) => nil,
        };
    Ok(args[0].value())
}

// ==================== Time ====================

fn prim_millisecond_clock(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    wrap_int(&vm.space, vm.milliseconds_now())
}

fn prim_signal_at_milliseconds(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let candidate = args[1].value();
    let nil = vm.space.nil();
    vm.space.specials.timer_semaphore =
        match require_class(vm, candidate, vm.space.classes.semaphore) {
            Ok(_) => candidate,
            Err(_) => nil,
        };
    vm.set_wakeup_tick(args[2].int());
    Ok(args[0].value())
}

const SECONDS_BETWEEN_1901_AND_1970: i64 = (69 * 365 + 17) * 24 * 3600;

fn prim_seconds_clock(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| FAILED)?
        .as_secs() as i64;
    wrap_int(&vm.space, since_epoch + SECONDS_BETWEEN_1901_AND_1970)
}

// ==================== Miscellaneous ====================

fn prim_beep(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    vm.host.beep();
    Ok(args[0].value())
}

fn prim_vm_path(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    let path = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| format!("{}/", d.display())))
        .unwrap_or_else(|| "./".to_string());
    let path = vm.space.wrap_string(&path);
    Ok(Value::Object(path))
}

fn short_from_word(word: u32, half: usize) -> i64 {
    let bits = if half == 0 { word & 0xFFFF } else { word >> 16 };
    i64::from(bits as u16 as i16)
}

fn prim_short_at(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let index = usize::try_from(args[1].int()).map_err(|_| FAILED)?;
    let value = match &vm.space.heap.object(receiver).body {
        Body::Bytes(bytes) => {
            let pair = bytes.get(index * 2..index * 2 + 2).ok_or(FAILED)?;
            i64::from(i16::from_le_bytes([pair[0], pair[1]]))
        }
        Body::Words(words) => {
            let word = *words.get(index / 2).ok_or(FAILED)?;
            short_from_word(word, index % 2)
        }
        _ => return Err(FAILED),
    };
    wrap_int(&vm.space, value)
}

fn prim_short_at_put(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let index = usize::try_from(args[1].int()).map_err(|_| FAILED)?;
    let value = args[2].int();
    let short = i16::try_from(value).map_err(|_| FAILED)?;
    match &mut vm.space.heap.object_mut(receiver).body {
        Body::Bytes(bytes) => {
            let pair = bytes.get_mut(index * 2..index * 2 + 2).ok_or(FAILED)?;
            pair.copy_from_slice(&short.to_le_bytes());
        }
        Body::Words(words) => {
            let word = words.get_mut(index / 2).ok_or(FAILED)?;
            let bits = u32::from(short as u16);
            *word = if index % 2 == 0 {
                (*word & 0xFFFF_0000) | bits
            } else {
                (*word & 0x0000_FFFF) | (bits << 16)
            };
        }
        _ => return Err(FAILED),
    }
    wrap_int(&vm.space, value)
}

fn prim_fill(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].object()?;
    let value = args[1].uint();
    match &mut vm.space.heap.object_mut(receiver).body {
        Body::Bytes(bytes) => {
            let byte = u8::try_from(value).map_err(|_| FAILED)?;
            bytes.fill(byte);
        }
        Body::Words(words) => words.fill(value),
        _ => return Err(FAILED),
    }
    Ok(args[0].value())
}

fn prim_clone(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let receiver = args[0].value();
    let Some(r) = receiver.as_object() else {
        // Immediates are their own copy.
        return Ok(receiver);
    };
    let object = vm.space.heap.object(r);
    let copy = HeapObject::new(object.class, object.body.clone());
    Ok(Value::Object(vm.space.heap.allocate(copy)))
}

// ==================== Files ====================

fn prim_file_close(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    vm.host.file_close(args[1].int()).map_err(|_| FAILED)?;
    Ok(args[0].value())
}

fn prim_file_open(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let writable = args[2].value() == vm.space.specials.bool_true;
    let fd = vm.host.file_open(args[1].text(), writable).map_err(|_| FAILED)?;
    wrap_int(&vm.space, fd)
}

fn prim_file_write(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    let fd = args[1].int();
    let source = args[2].text().as_bytes();
    let start = args[3].int() - 1;
    let count = args[4].int();
    if start < 0 || count < 0 {
        return Err(FAILED);
    }
    let (start, count) = (start as usize, count as usize);
    let span = source.get(start..start + count).ok_or(FAILED)?;
    vm.host.file_write(fd, span).map_err(|_| FAILED)?;
    Ok(args[0].value())
}

fn prim_directory_delimiter(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    let delimiter = vm.host.file_delimiter();
    Ok(vm.space.wrap_char(delimiter))
}

// ==================== Closures ====================

fn prim_closure_copy(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    let outer = args[0].value();
    let num_args = usize::try_from(args[1].int()).map_err(|_| FAILED)?;
    let copied = args[2].list().to_vec();
    let start_pc = ctx.pc(&vm.space).ok_or(FAILED)?;
    let closure = vm.space.new_closure(outer, start_pc, num_args, copied);
    Ok(Value::Object(closure))
}

fn prim_closure_value(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    activate_closure(vm, ctx, args[0].value(), &[])
}

fn prim_closure_value_arg(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    activate_closure(vm, ctx, args[0].value(), &[args[1].value()])
}

fn prim_closure_value_2(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    activate_closure(vm, ctx, args[0].value(), &[args[1].value(), args[2].value()])
}

fn prim_closure_value_3(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    activate_closure(
        vm,
        ctx,
        args[0].value(),
        &[args[1].value(), args[2].value(), args[3].value()],
    )
}

fn prim_closure_value_4(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    activate_closure(
        vm,
        ctx,
        args[0].value(),
        &[
            args[1].value(),
            args[2].value(),
            args[3].value(),
            args[4].value(),
        ],
    )
}

fn prim_closure_value_with_args(vm: &mut Vm, ctx: Context, args: &[PrimArg]) -> SpecResult {
    let call_args = args[1].list().to_vec();
    activate_closure(vm, ctx, args[0].value(), &call_args)
}

// ==================== Idle and display flushing ====================

fn prim_idle(vm: &mut Vm, ctx: Context, argc: usize, _method: Option<ObjRef>) -> RawResult {
    if argc != 1 {
        return Err(FAILED);
    }
    let micros = ctx.peek(&vm.space, 0).as_small_int().ok_or(FAILED)?;
    ctx.pop(&mut vm.space);
    // Interrupts are rechecked on both sides of the sleep.
    if let Err(event) = vm.force_interrupt_check(ctx) {
        return event_outcome(Err(event));
    }
    vm.host.sleep(micros);
    event_outcome(vm.force_interrupt_check(ctx))
}

fn prim_force_display_update(vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    vm.host.force_display_update();
    Ok(args[0].value())
}

fn prim_vm_parameters(
    vm: &mut Vm,
    ctx: Context,
    argc: usize,
    _method: Option<ObjRef>,
) -> RawResult {
    // 0 args: all parameters; 1: one parameter; 2: set, answering the old
    // value. Everything reads as zero here.
    match argc {
        0 => {
            ctx.pop(&mut vm.space);
            let zeros = vec![Value::SmallInt(0); 59];
            let list = vm.space.wrap_list(zeros);
            ctx.push(&mut vm.space, Value::Object(list));
            Ok(PrimOutcome::Stay)
        }
        1 | 2 => {
            ctx.pop_n(&mut vm.space, argc + 1);
            ctx.push(&mut vm.space, Value::SmallInt(0));
            Ok(PrimOutcome::Stay)
        }
        _ => Err(FAILED),
    }
}

// ==================== Quick methods ====================

fn prim_push_self(_vm: &mut Vm, _ctx: Context, args: &[PrimArg]) -> SpecResult {
    Ok(args[0].value())
}

fn prim_push_true(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.specials.bool_true)
}

fn prim_push_false(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.specials.bool_false)
}

fn prim_push_nil(vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    Ok(vm.space.nil())
}

fn prim_push_minus_one(_vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    Ok(Value::SmallInt(-1))
}

fn prim_push_zero(_vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    Ok(Value::SmallInt(0))
}

fn prim_push_one(_vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    Ok(Value::SmallInt(1))
}

fn prim_push_two(_vm: &mut Vm, _ctx: Context, _args: &[PrimArg]) -> SpecResult {
    Ok(Value::SmallInt(2))
}

fn prim_not_yet_implemented(
    _vm: &mut Vm,
    _ctx: Context,
    _argc: usize,
    _method: Option<ObjRef>,
) -> RawResult {
    Err(PrimitiveFailure::NotYetImplemented)
}

// ==================== The table ====================

const OBJ: ArgSpec = ArgSpec::Object;

macro_rules! spec {
    ($index:expr, $name:expr, [$($spec:expr),*], $result:expr, $f:expr) => {
        spec!($index, $name, [$($spec),*], $result, $f, store_pc: false, may_switch: true)
    };
    ($index:expr, $name:expr, [$($spec:expr),*], $result:expr, $f:expr,
     store_pc: $store_pc:expr, may_switch: $may_switch:expr) => {
        PrimitiveDef {
            index: $index,
            name: $name,
            store_pc: $store_pc,
            code: PrimitiveCode::Spec {
                unwrap: &[$($spec),*],
                result: $result,
                may_context_switch: $may_switch,
                f: $f,
            },
        }
    };
}

macro_rules! raw {
    ($index:expr, $name:expr, $f:expr) => {
        raw!($index, $name, $f, store_pc: false)
    };
    ($index:expr, $name:expr, $f:expr, store_pc: $store_pc:expr) => {
        PrimitiveDef {
            index: $index,
            name: $name,
            store_pc: $store_pc,
            code: PrimitiveCode::Raw($f),
        }
    };
}

use ResultKind::{NewFrame, Push};

static DEFS: &[PrimitiveDef] = &[
    // Small integers
    spec!(ADD, "add", [ArgSpec::Int, ArgSpec::Int], Push, prim_add),
    spec!(SUBTRACT, "subtract", [ArgSpec::Int, ArgSpec::Int], Push, prim_subtract),
    spec!(LESS_THAN, "lessThan", [ArgSpec::Int, ArgSpec::Int], Push, prim_less_than),
    spec!(GREATER_THAN, "greaterThan", [ArgSpec::Int, ArgSpec::Int], Push, prim_greater_than),
    spec!(LESS_OR_EQUAL, "lessOrEqual", [ArgSpec::Int, ArgSpec::Int], Push, prim_less_or_equal),
    spec!(GREATER_OR_EQUAL, "greaterOrEqual", [ArgSpec::Int, ArgSpec::Int], Push, prim_greater_or_equal),
    spec!(EQUAL, "equal", [ArgSpec::Int, ArgSpec::Int], Push, prim_equal),
    spec!(NOT_EQUAL, "notEqual", [ArgSpec::Int, ArgSpec::Int], Push, prim_not_equal),
    spec!(MULTIPLY, "multiply", [ArgSpec::Int, ArgSpec::Int], Push, prim_multiply),
    spec!(DIVIDE, "divide", [ArgSpec::Int, ArgSpec::Int], Push, prim_divide),
    spec!(MOD, "mod", [ArgSpec::Int, ArgSpec::Int], Push, prim_mod),
    spec!(DIV, "div", [ArgSpec::Int, ArgSpec::Int], Push, prim_div),
    spec!(QUO, "quo", [ArgSpec::Int, ArgSpec::Int], Push, prim_quo),
    spec!(BIT_AND, "bitAnd", [ArgSpec::Uint32, ArgSpec::Uint32], Push, prim_bit_and),
    spec!(BIT_OR, "bitOr", [ArgSpec::Uint32, ArgSpec::Uint32], Push, prim_bit_or),
    spec!(BIT_XOR, "bitXor", [ArgSpec::Uint32, ArgSpec::Uint32], Push, prim_bit_xor),
    spec!(BIT_SHIFT, "bitShift", [OBJ, ArgSpec::Int], Push, prim_bit_shift),
    spec!(MAKE_POINT, "makePoint", [ArgSpec::Int, ArgSpec::Int], Push, prim_make_point),
    raw!(FAIL, "fail", prim_fail),
    // Floats
    spec!(SMALLINT_AS_FLOAT, "asFloat", [ArgSpec::Int], Push, prim_smallint_as_float),
    spec!(FLOAT_ADD, "floatAdd", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_add),
    spec!(FLOAT_SUBTRACT, "floatSubtract", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_subtract),
    spec!(FLOAT_LESS_THAN, "floatLessThan", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_less_than),
    spec!(FLOAT_GREATER_THAN, "floatGreaterThan", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_greater_than),
    spec!(FLOAT_LESS_OR_EQUAL, "floatLessOrEqual", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_less_or_equal),
    spec!(FLOAT_GREATER_OR_EQUAL, "floatGreaterOrEqual", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_greater_or_equal),
    spec!(FLOAT_EQUAL, "floatEqual", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_equal),
    spec!(FLOAT_NOT_EQUAL, "floatNotEqual", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_not_equal),
    spec!(FLOAT_MULTIPLY, "floatMultiply", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_multiply),
    spec!(FLOAT_DIVIDE, "floatDivide", [ArgSpec::Float, ArgSpec::Float], Push, prim_float_divide),
    spec!(FLOAT_TRUNCATED, "truncated", [ArgSpec::Float], Push, prim_float_truncated),
    spec!(FLOAT_TIMES_TWO_POWER, "timesTwoPower", [ArgSpec::Float, ArgSpec::Int], Push, prim_float_times_two_power),
    spec!(FLOAT_SQUARE_ROOT, "sqrt", [ArgSpec::Float], Push, prim_float_square_root),
    spec!(FLOAT_SIN, "sin", [ArgSpec::Float], Push, prim_float_sin),
    spec!(FLOAT_ARCTAN, "arcTan", [ArgSpec::Float], Push, prim_float_arctan),
    spec!(FLOAT_LOG_N, "ln", [ArgSpec::Float], Push, prim_float_log_n),
    spec!(FLOAT_EXP, "exp", [ArgSpec::Float], Push, prim_float_exp),
    // Subscripting
    raw!(AT, "at", prim_at),
    raw!(AT_PUT, "atPut", prim_at_put),
    spec!(SIZE, "size", [OBJ], Push, prim_size),
    spec!(STRING_AT, "stringAt", [OBJ, ArgSpec::Index1], Push, prim_string_at),
    spec!(STRING_AT_PUT, "stringAtPut", [OBJ, ArgSpec::Index1, ArgSpec::Char], Push, prim_string_at_put),
    // Storage management
    spec!(OBJECT_AT, "objectAt", [OBJ, ArgSpec::Index1], Push, prim_object_at),
    spec!(OBJECT_AT_PUT, "objectAtPut", [OBJ, ArgSpec::Index1, OBJ], Push, prim_object_at_put),
    spec!(NEW, "new", [OBJ], Push, prim_new),
    spec!(NEW_WITH_ARG, "newWithArg", [OBJ, ArgSpec::Int], Push, prim_new_with_arg),
    spec!(ARRAY_BECOME_ONE_WAY, "arrayBecomeOneWay", [OBJ, OBJ], Push, prim_array_become_one_way),
    spec!(INST_VAR_AT, "instVarAt", [OBJ, ArgSpec::Index1], Push, prim_inst_var_at),
    spec!(INST_VAR_AT_PUT, "instVarAtPut", [OBJ, ArgSpec::Index1, OBJ], Push, prim_inst_var_at_put),
    spec!(AS_OOP, "asOop", [OBJ], Push, prim_as_oop),
    spec!(STORE_STACKP, "storeStackp", [OBJ, ArgSpec::Int], Push, prim_store_stackp),
    spec!(SOME_INSTANCE, "someInstance", [OBJ], Push, prim_some_instance),
    spec!(NEXT_INSTANCE, "nextInstance", [OBJ], Push, prim_next_instance),
    spec!(NEW_METHOD, "newMethod", [OBJ, ArgSpec::Int, ArgSpec::Int], Push, prim_new_method),
    // Blocks and control
    spec!(BLOCK_COPY, "blockCopy", [OBJ, ArgSpec::Int], Push, prim_block_copy,
          store_pc: true, may_switch: true),
    raw!(VALUE, "value", prim_value),
    spec!(VALUE_WITH_ARGS, "valueWithArgs", [OBJ, ArgSpec::List], NewFrame, prim_value_with_args),
    raw!(PERFORM, "perform", prim_perform),
    raw!(PERFORM_WITH_ARGS, "performWithArgs", prim_perform_with_args),
    raw!(SIGNAL, "signal", prim_signal),
    raw!(WAIT, "wait", prim_wait),
    raw!(RESUME, "resume", prim_resume),
    raw!(SUSPEND, "suspend", prim_suspend),
    spec!(FLUSH_CACHE, "flushCache", [OBJ], Push, prim_flush_cache),
    // Input and display
    spec!(MOUSE_POINT, "mousePoint", [OBJ], Push, prim_mouse_point),
    spec!(GET_NEXT_EVENT, "getNextEvent", [OBJ, OBJ], Push, prim_get_next_event),
    raw!(BITBLT_COPY_BITS, "copyBits", prim_copy_bits),
    raw!(BE_CURSOR, "beCursor", prim_be_cursor),
    spec!(BE_DISPLAY, "beDisplay", [OBJ], Push, prim_be_display),
    spec!(STRING_REPLACE, "stringReplace",
          [OBJ, ArgSpec::Index1, ArgSpec::Index1, OBJ, ArgSpec::Index1], Push, prim_string_replace),
    spec!(SCREEN_SIZE, "screenSize", [OBJ], Push, prim_screen_size),
    spec!(MOUSE_BUTTONS, "mouseButtons", [OBJ], Push, prim_mouse_buttons),
    spec!(KBD_NEXT, "kbdNext", [OBJ], Push, prim_kbd_next),
    spec!(KBD_PEEK, "kbdPeek", [OBJ], Push, prim_kbd_peek),
    // Identity and control
    spec!(EQUIVALENT, "equivalent", [OBJ, OBJ], Push, prim_equivalent),
    spec!(CLASS, "class", [OBJ], Push, prim_class),
    raw!(BYTES_LEFT, "bytesLeft", prim_not_yet_implemented),
    raw!(QUIT, "quit", prim_quit),
    raw!(EXIT_TO_DEBUGGER, "exitToDebugger", prim_not_yet_implemented),
    raw!(CHANGE_CLASS, "changeClass", prim_not_yet_implemented),
    spec!(COMPILED_METHOD_FLUSH_CACHE, "flushCacheByMethod", [OBJ], Push, prim_flush_cache_by_method),
    raw!(EXTERNAL_CALL, "externalCall", prim_external_call),
    spec!(SYMBOL_FLUSH_CACHE, "symbolFlushCache", [OBJ], Push, prim_symbol_flush_cache),
    // Miscellaneous
    raw!(IMAGE_NAME, "imageName", prim_image_name),
    spec!(LOW_SPACE_SEMAPHORE, "lowSpaceSemaphore", [OBJ, OBJ], Push, prim_return_receiver_arg),
    spec!(SIGNAL_AT_BYTES_LEFT, "signalAtBytesLeft", [OBJ, ArgSpec::Int], Push, prim_return_receiver_arg),
    spec!(DEFER_UPDATES, "deferUpdates", [OBJ, ArgSpec::Bool], Push, prim_defer_updates),
    raw!(DRAW_RECTANGLE, "drawRectangle", prim_not_yet_implemented),
    spec!(BECOME, "become", [OBJ, OBJ], Push, prim_become),
    spec!(SPECIAL_OBJECTS_ARRAY, "specialObjectsArray", [OBJ], Push, prim_special_objects_array),
    raw!(FULL_GC, "fullGC", prim_collect_garbage),
    raw!(INC_GC, "incrementalGC", prim_collect_garbage),
    spec!(ARRAY_BECOME, "arrayBecome", [OBJ, OBJ], Push, prim_array_become),
    spec!(SET_INTERRUPT_KEY, "setInterruptKey", [OBJ, ArgSpec::Int], Push, prim_set_interrupt_key),
    spec!(INTERRUPT_SEMAPHORE, "interruptSemaphore", [OBJ, OBJ], Push, prim_interrupt_semaphore),
    // Time
    spec!(MILLISECOND_CLOCK, "millisecondClock", [OBJ], Push, prim_millisecond_clock),
    spec!(SIGNAL_AT_MILLISECONDS, "signalAtMilliseconds", [OBJ, OBJ, ArgSpec::Int], Push, prim_signal_at_milliseconds),
    spec!(SECONDS_CLOCK, "secondsClock", [OBJ], Push, prim_seconds_clock),
    spec!(BEEP, "beep", [OBJ], Push, prim_beep),
    spec!(VM_PATH, "vmPath", [OBJ], Push, prim_vm_path),
    spec!(SHORT_AT, "shortAt", [OBJ, ArgSpec::Index1], Push, prim_short_at),
    spec!(SHORT_AT_PUT, "shortAtPut", [OBJ, ArgSpec::Index1, ArgSpec::Int], Push, prim_short_at_put),
    spec!(FILL, "fill", [OBJ, ArgSpec::Uint32], Push, prim_fill),
    spec!(CLONE, "clone", [OBJ], Push, prim_clone),
    // Files
    spec!(FILE_CLOSE, "fileClose", [OBJ, ArgSpec::Int], Push, prim_file_close),
    spec!(FILE_OPEN, "fileOpen", [OBJ, ArgSpec::Str, OBJ], Push, prim_file_open),
    spec!(FILE_WRITE, "fileWrite", [OBJ, ArgSpec::Int, ArgSpec::Str, ArgSpec::Int, ArgSpec::Int], Push, prim_file_write),
    spec!(DIRECTORY_DELIMITER, "directoryDelimiter", [OBJ], Push, prim_directory_delimiter),
    // Method execution
    spec!(WITH_ARGS_EXECUTE_METHOD, "withArgsExecuteMethod", [OBJ, ArgSpec::List, OBJ], NewFrame, prim_with_args_execute_method),
    // Closures
    spec!(CLOSURE_COPY_WITH_COPIED_VALUES, "closureCopy", [OBJ, ArgSpec::Int, ArgSpec::List], Push, prim_closure_copy,
          store_pc: true, may_switch: true),
    spec!(CLOSURE_VALUE, "closureValue", [OBJ], NewFrame, prim_closure_value),
    spec!(CLOSURE_VALUE_ARG, "closureValue1", [OBJ, OBJ], NewFrame, prim_closure_value_arg),
    spec!(CLOSURE_VALUE_2, "closureValue2", [OBJ, OBJ, OBJ], NewFrame, prim_closure_value_2),
    spec!(CLOSURE_VALUE_3, "closureValue3", [OBJ, OBJ, OBJ, OBJ], NewFrame, prim_closure_value_3),
    spec!(CLOSURE_VALUE_4, "closureValue4", [OBJ, OBJ, OBJ, OBJ, OBJ], NewFrame, prim_closure_value_4),
    spec!(CLOSURE_VALUE_WITH_ARGS, "closureValueWithArgs", [OBJ, ArgSpec::List], NewFrame, prim_closure_value_with_args),
    // Context aliases: the VM keeps latitude in context management.
    raw!(CONTEXT_AT, "contextAt", prim_at),
    raw!(CONTEXT_AT_PUT, "contextAtPut", prim_at_put),
    spec!(CONTEXT_SIZE, "contextSize", [OBJ], Push, prim_size),
    spec!(CLOSURE_VALUE_NO_SWITCH, "closureValueNoSwitch", [OBJ], NewFrame, prim_closure_value,
          store_pc: false, may_switch: false),
    spec!(CLOSURE_VALUE_NO_SWITCH_ARG, "closureValueNoSwitch1", [OBJ, OBJ], NewFrame, prim_closure_value_arg,
          store_pc: false, may_switch: false),
    // Idle and display
    raw!(IDLE_FOR_MICROSECONDS, "idleForMicroseconds", prim_idle),
    spec!(FORCE_DISPLAY_UPDATE, "forceDisplayUpdate", [OBJ], Push, prim_force_display_update),
    raw!(VM_PARAMETERS, "vmParameters", prim_vm_parameters),
    // Quick methods
    spec!(PUSH_SELF, "pushSelf", [OBJ], Push, prim_push_self),
    spec!(PUSH_TRUE, "pushTrue", [OBJ], Push, prim_push_true),
    spec!(PUSH_FALSE, "pushFalse", [OBJ], Push, prim_push_false),
    spec!(PUSH_NIL, "pushNil", [OBJ], Push, prim_push_nil),
    spec!(PUSH_MINUS_ONE, "pushMinusOne", [OBJ], Push, prim_push_minus_one),
    spec!(PUSH_ZERO, "pushZero", [OBJ], Push, prim_push_zero),
    spec!(PUSH_ONE, "pushOne", [OBJ], Push, prim_push_one),
    spec!(PUSH_TWO, "pushTwo", [OBJ], Push, prim_push_two),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::PrimCall;
    use shrew_vm_heap::{CompiledMethodBuilder, SMALL_INT_MAX, SMALL_INT_MIN};

    fn frame_with(vm: &mut Vm, values: &[Value]) -> Context {
        let method = CompiledMethodBuilder::new().bytes(&[120]).build();
        let method = vm.space.heap.allocate(HeapObject::new(
            vm.space.classes.compiled_method,
            Body::Method(method),
        ));
        let nil = vm.space.nil();
        let frame = Context::new_method_frame(&mut vm.space, method, nil, &[], nil).unwrap();
        frame.push_all(&mut vm.space, values);
        frame
    }

    fn call(vm: &mut Vm, ctx: Context, index: u16, argc: usize) -> PrimCall {
        vm.try_primitive(ctx, index, argc, None, None)
            .expect("no control-flow event expected")
    }

    #[test]
    fn addition_overflow_fails_and_leaves_stack() {
        let mut vm = Vm::headless();
        let ctx = frame_with(
            &mut vm,
            &[Value::SmallInt(SMALL_INT_MAX), Value::SmallInt(1)],
        );
        let before = ctx.stackp(&vm.space);
        assert_eq!(call(&mut vm, ctx, ADD, 1), PrimCall::Failed);
        assert_eq!(ctx.stackp(&vm.space), before);
        assert_eq!(ctx.top(&vm.space), Value::SmallInt(1));

        let ctx = frame_with(
            &mut vm,
            &[Value::SmallInt(SMALL_INT_MIN), Value::SmallInt(1)],
        );
        assert_eq!(call(&mut vm, ctx, SUBTRACT, 1), PrimCall::Failed);
    }

    #[test]
    fn addition_in_range_pushes_sum() {
        let mut vm = Vm::headless();
        let ctx = frame_with(&mut vm, &[Value::SmallInt(3), Value::SmallInt(4)]);
        assert_eq!(call(&mut vm, ctx, ADD, 1), PrimCall::Done);
        assert_eq!(ctx.top(&vm.space), Value::SmallInt(7));
    }

    #[test]
    fn division_by_zero_fails() {
        let mut vm = Vm::headless();
        for index in [DIVIDE, MOD, DIV, QUO] {
            let ctx = frame_with(&mut vm, &[Value::SmallInt(5), Value::SmallInt(0)]);
            assert_eq!(call(&mut vm, ctx, index, 1), PrimCall::Failed, "{index}");
        }
    }

    #[test]
    fn inexact_division_fails() {
        let mut vm = Vm::headless();
        let ctx = frame_with(&mut vm, &[Value::SmallInt(7), Value::SmallInt(2)]);
        assert_eq!(call(&mut vm, ctx, DIVIDE, 1), PrimCall::Failed);
    }

    #[test]
    fn floored_division_and_modulo() {
        let mut vm = Vm::headless();
        let cases = [
            (-7, 2, DIV, -4),
            (-7, 2, MOD, 1),
            (7, -2, MOD, -1),
            (-7, 2, QUO, -3),
        ];
        for (a, b, index, expected) in cases {
            let ctx = frame_with(&mut vm, &[Value::SmallInt(a), Value::SmallInt(b)]);
            assert_eq!(call(&mut vm, ctx, index, 1), PrimCall::Done);
            assert_eq!(ctx.top(&vm.space), Value::SmallInt(expected), "{a} {index} {b}");
        }
    }

    #[test]
    fn bit_shift_range() {
        let mut vm = Vm::headless();
        let ctx = frame_with(&mut vm, &[Value::SmallInt(1), Value::SmallInt(64)]);
        assert_eq!(call(&mut vm, ctx, BIT_SHIFT, 1), PrimCall::Failed);
        let ctx = frame_with(&mut vm, &[Value::SmallInt(1), Value::SmallInt(10)]);
        assert_eq!(call(&mut vm, ctx, BIT_SHIFT, 1), PrimCall::Done);
        assert_eq!(ctx.top(&vm.space), Value::SmallInt(1024));
        let ctx = frame_with(&mut vm, &[Value::SmallInt(-1024), Value::SmallInt(-4)]);
        assert_eq!(call(&mut vm, ctx, BIT_SHIFT, 1), PrimCall::Done);
        assert_eq!(ctx.top(&vm.space), Value::SmallInt(-64));
        // Shifting bits off the top fails instead of truncating.
        let ctx = frame_with(&mut vm, &[Value::SmallInt(SMALL_INT_MAX), Value::SmallInt(4)]);
        assert_eq!(call(&mut vm, ctx, BIT_SHIFT, 1), PrimCall::Failed);
    }

    #[test]
    fn at_bounds_follow_one_based_indexing() {
        let mut vm = Vm::headless();
        let array = vm
            .space
            .new_instance_sized(vm.space.classes.array, 3)
            .unwrap();
        vm.space
            .indexed_at_put(array, 1, Value::SmallInt(42))
            .unwrap();
        for (index, expectation) in [
            (0i64, PrimCall::Failed),
            (1, PrimCall::Done),
            (3, PrimCall::Done),
            (4, PrimCall::Failed),
        ] {
            let ctx = frame_with(&mut vm, &[Value::Object(array), Value::SmallInt(index)]);
            assert_eq!(call(&mut vm, ctx, AT, 1), expectation, "at: {index}");
        }
        let ctx = frame_with(&mut vm, &[Value::Object(array), Value::SmallInt(2)]);
        call(&mut vm, ctx, AT, 1);
        assert_eq!(ctx.top(&vm.space), Value::SmallInt(42));
    }

    #[test]
    fn at_put_then_at_round_trips() {
        let mut vm = Vm::headless();
        let array = vm
            .space
            .new_instance_sized(vm.space.classes.array, 3)
            .unwrap();
        let ctx = frame_with(
            &mut vm,
            &[Value::Object(array), Value::SmallInt(2), Value::SmallInt(9)],
        );
        assert_eq!(call(&mut vm, ctx, AT_PUT, 2), PrimCall::Done);
        assert_eq!(ctx.top(&vm.space), Value::SmallInt(9));
        assert_eq!(
            vm.space.indexed_at(array, 1).unwrap(),
            Value::SmallInt(9)
        );
    }

    #[test]
    fn string_at_answers_characters() {
        let mut vm = Vm::headless();
        let s = vm.space.wrap_string("ok");
        let ctx = frame_with(&mut vm, &[Value::Object(s), Value::SmallInt(1)]);
        assert_eq!(call(&mut vm, ctx, STRING_AT, 1), PrimCall::Done);
        let expected = vm.space.wrap_char(b'o');
        assert_eq!(ctx.top(&vm.space), expected);
    }

    #[test]
    fn size_fails_on_fixed_classes() {
        let mut vm = Vm::headless();
        let point = vm.space.new_instance(vm.space.classes.point).unwrap();
        let ctx = frame_with(&mut vm, &[Value::Object(point)]);
        assert_eq!(call(&mut vm, ctx, SIZE, 0), PrimCall::Failed);
        let ctx = frame_with(&mut vm, &[Value::SmallInt(7)]);
        assert_eq!(call(&mut vm, ctx, SIZE, 0), PrimCall::Failed);
    }

    #[test]
    fn new_refuses_wrong_shapes() {
        let mut vm = Vm::headless();
        let array_class = Value::Object(vm.space.classes.array);
        let point_class = Value::Object(vm.space.classes.point);
        // new on a variable class fails; new: works.
        let ctx = frame_with(&mut vm, &[array_class]);
        assert_eq!(call(&mut vm, ctx, NEW, 0), PrimCall::Failed);
        let ctx = frame_with(&mut vm, &[array_class, Value::SmallInt(0)]);
        assert_eq!(call(&mut vm, ctx, NEW_WITH_ARG, 1), PrimCall::Done);
        // new: with a nonzero size on a fixed class fails.
        let ctx = frame_with(&mut vm, &[point_class, Value::SmallInt(2)]);
        assert_eq!(call(&mut vm, ctx, NEW_WITH_ARG, 1), PrimCall::Failed);
    }

    #[test]
    fn inst_var_range_reads_fixed_slots() {
        let mut vm = Vm::headless();
        let point = vm.space.new_instance(vm.space.classes.point).unwrap();
        vm.space
            .heap
            .store(point, 1, Value::SmallInt(17))
            .unwrap();
        let ctx = frame_with(&mut vm, &[Value::Object(point)]);
        assert_eq!(call(&mut vm, ctx, FIRST_INST_VAR + 1, 0), PrimCall::Done);
        assert_eq!(ctx.top(&vm.space), Value::SmallInt(17));
        // Beyond the fixed part the primitive fails.
        let ctx = frame_with(&mut vm, &[Value::Object(point)]);
        assert_eq!(call(&mut vm, ctx, FIRST_INST_VAR + 2, 0), PrimCall::Failed);
    }

    #[test]
    fn become_swaps_the_receiver_and_argument() {
        let mut vm = Vm::headless();
        let x = vm.space.wrap_string("x");
        let z = vm.space.wrap_string("z");
        let ctx = frame_with(&mut vm, &[Value::Object(x), Value::Object(z)]);
        assert_eq!(call(&mut vm, ctx, BECOME, 1), PrimCall::Done);
        // The receiver handle is the answer, now denoting the old argument.
        assert_eq!(ctx.top(&vm.space), Value::Object(x));
        assert_eq!(vm.space.unwrap_string(Value::Object(x)).unwrap(), "z");
        assert_eq!(vm.space.unwrap_string(Value::Object(z)).unwrap(), "x");
        // A second swap is the identity.
        let ctx = frame_with(&mut vm, &[Value::Object(x), Value::Object(z)]);
        assert_eq!(call(&mut vm, ctx, BECOME, 1), PrimCall::Done);
        assert_eq!(vm.space.unwrap_string(Value::Object(x)).unwrap(), "x");
    }

    #[test]
    fn become_swaps_fixed_slot_objects() {
        let mut vm = Vm::headless();
        let point_class = vm.space.classes.point;
        let a = vm.space.new_instance(point_class).unwrap();
        let b = vm.space.new_instance(point_class).unwrap();
        vm.space.heap.store(a, 0, Value::SmallInt(1)).unwrap();
        vm.space.heap.store(b, 0, Value::SmallInt(2)).unwrap();
        let ctx = frame_with(&mut vm, &[Value::Object(a), Value::Object(b)]);
        assert_eq!(call(&mut vm, ctx, BECOME, 1), PrimCall::Done);
        assert_eq!(vm.space.heap.fetch(a, 0).unwrap(), Value::SmallInt(2));
        assert_eq!(vm.space.heap.fetch(b, 0).unwrap(), Value::SmallInt(1));
    }

    #[test]
    fn become_rejects_immediates() {
        let mut vm = Vm::headless();
        let x = vm.space.wrap_string("x");
        let ctx = frame_with(&mut vm, &[Value::SmallInt(1), Value::Object(x)]);
        assert_eq!(call(&mut vm, ctx, BECOME, 1), PrimCall::Failed);
        let ctx = frame_with(&mut vm, &[Value::Object(x), Value::SmallInt(1)]);
        assert_eq!(call(&mut vm, ctx, BECOME, 1), PrimCall::Failed);
    }

    #[test]
    fn pairwise_array_become_rolls_back_on_failure() {
        let mut vm = Vm::headless();
        let x = vm.space.wrap_string("x");
        let y = vm.space.wrap_string("y");
        let z = vm.space.wrap_string("z");
        let left = vm.space.wrap_list(vec![Value::Object(x), Value::Object(y)]);
        // The second pair holds an immediate, which cannot swap.
        let right = vm
            .space
            .wrap_list(vec![Value::Object(z), Value::SmallInt(5)]);
        let ctx = frame_with(&mut vm, &[Value::Object(left), Value::Object(right)]);
        assert_eq!(call(&mut vm, ctx, ARRAY_BECOME, 1), PrimCall::Failed);
        // The first pair was swapped and rolled back.
        assert_eq!(vm.space.unwrap_string(Value::Object(x)).unwrap(), "x");
        assert_eq!(vm.space.unwrap_string(Value::Object(z)).unwrap(), "z");
    }

    #[test]
    fn array_become_swaps_element_identities_both_ways() {
        let mut vm = Vm::headless();
        let x = vm.space.wrap_string("x");
        let z = vm.space.wrap_string("z");
        let left = vm.space.wrap_list(vec![Value::Object(x)]);
        let right = vm.space.wrap_list(vec![Value::Object(z)]);
        let ctx = frame_with(&mut vm, &[Value::Object(left), Value::Object(right)]);
        assert_eq!(call(&mut vm, ctx, ARRAY_BECOME, 1), PrimCall::Done);
        assert_eq!(vm.space.unwrap_string(Value::Object(x)).unwrap(), "z");
        assert_eq!(vm.space.unwrap_string(Value::Object(z)).unwrap(), "x");
    }

    #[test]
    fn one_way_array_become_forwards_references() {
        let mut vm = Vm::headless();
        let from = vm.space.wrap_string("from");
        let to = vm.space.wrap_string("to");
        let holder = vm.space.wrap_list(vec![Value::Object(from)]);
        let left = vm.space.wrap_list(vec![Value::Object(from)]);
        let right = vm.space.wrap_list(vec![Value::Object(to)]);
        let ctx = frame_with(&mut vm, &[Value::Object(left), Value::Object(right)]);
        assert_eq!(call(&mut vm, ctx, ARRAY_BECOME_ONE_WAY, 1), PrimCall::Done);
        // Third-party references now denote the target...
        assert_eq!(vm.space.heap.fetch(holder, 0).unwrap(), Value::Object(to));
        // ...while the target itself is untouched.
        assert_eq!(vm.space.unwrap_string(Value::Object(to)).unwrap(), "to");
    }

    #[test]
    fn one_way_array_become_rejects_immediate_elements() {
        let mut vm = Vm::headless();
        let to = vm.space.wrap_string("to");
        let left = vm.space.wrap_list(vec![Value::SmallInt(3)]);
        let right = vm.space.wrap_list(vec![Value::Object(to)]);
        let ctx = frame_with(&mut vm, &[Value::Object(left), Value::Object(right)]);
        assert_eq!(
            call(&mut vm, ctx, ARRAY_BECOME_ONE_WAY, 1),
            PrimCall::Failed
        );
    }

    #[test]
    fn method_dictionary_store_flushes_the_cache() {
        let mut vm = Vm::headless();
        // Warm the cache.
        let selector = vm.space.symbol("at:");
        let _ = vm
            .cache
            .lookup(&vm.space, vm.space.classes.array, selector)
            .unwrap();
        assert!(!vm.cache.is_empty());
        let dict = vm.space.method_dict_of(vm.space.classes.object).unwrap();
        let probe = vm.space.symbol("probe");
        let method = CompiledMethodBuilder::new().bytes(&[120]).build();
        let method = vm.space.heap.allocate(HeapObject::new(
            vm.space.classes.compiled_method,
            Body::Method(method),
        ));
        let ctx = frame_with(
            &mut vm,
            &[
                Value::Object(dict),
                Value::Object(probe),
                Value::Object(method),
            ],
        );
        assert_eq!(call(&mut vm, ctx, AT_PUT, 2), PrimCall::Done);
        assert!(vm.cache.is_empty());
    }

    #[test]
    fn collect_garbage_answers_bytes_left() {
        let mut vm = Vm::headless();
        let doomed = vm.space.wrap_string("doomed");
        let _ = doomed;
        let receiver = vm.space.nil();
        let ctx = frame_with(&mut vm, &[receiver]);
        assert_eq!(call(&mut vm, ctx, FULL_GC, 0), PrimCall::Done);
        assert_eq!(ctx.top(&vm.space), Value::SmallInt(1 << 29));
    }

    #[test]
    fn quick_methods_answer_constants() {
        let mut vm = Vm::headless();
        let receiver = Value::SmallInt(5);
        let expectations = [
            (PUSH_SELF, receiver),
            (PUSH_TRUE, vm.space.specials.bool_true),
            (PUSH_NIL, vm.space.nil()),
            (PUSH_TWO, Value::SmallInt(2)),
        ];
        for (index, expected) in expectations {
            let ctx = frame_with(&mut vm, &[receiver]);
            assert_eq!(call(&mut vm, ctx, index, 0), PrimCall::Done, "{index}");
            assert_eq!(ctx.top(&vm.space), expected, "{index}");
        }
    }

    #[test]
    fn unimplemented_slots_fail() {
        let mut vm = Vm::headless();
        let ctx = frame_with(&mut vm, &[Value::SmallInt(1)]);
        assert_eq!(call(&mut vm, ctx, 65, 0), PrimCall::Failed);
        assert_eq!(call(&mut vm, ctx, CHANGE_CLASS, 0), PrimCall::Failed);
    }

    #[test]
    fn milliseconds_wrap_to_tagged_range() {
        let mut vm = Vm::headless();
        let ctx = frame_with(&mut vm, &[Value::SmallInt(0)]);
        assert_eq!(call(&mut vm, ctx, MILLISECOND_CLOCK, 0), PrimCall::Done);
        assert!(ctx.top(&vm.space).as_small_int().unwrap() >= 0);
    }
}
