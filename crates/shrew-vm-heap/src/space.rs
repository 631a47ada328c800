//! The object space
//!
//! Owns the heap arena plus everything the interpreter treats as
//! well-known: the core class table, `nil`/`true`/`false`, the interned
//! symbol table, the character table, and the registry slots host code
//! fills in at run time (display, timer semaphore, scheduler).
//!
//! Image loading is out of scope; [`ObjectSpace::new`] bootstraps the
//! minimal class kernel the interpreter and its tests require.

use rustc_hash::FxHashMap;

use crate::class::{InstanceSpec, TailKind, class_slot};
use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::method::CompiledMethod;
use crate::object::{Body, HeapObject, MethodDict};
use crate::value::{ObjRef, Value};

/// Fixed-slot indices of `BlockClosure`.
pub mod closure_slot {
    /// The context the closure was created in.
    pub const OUTER_CONTEXT: usize = 0;
    /// Start of the block body inside the home method's bytecodes.
    pub const START_PC: usize = 1;
    /// Number of block arguments.
    pub const NUM_ARGS: usize = 2;
    /// Number of fixed slots; copied values follow as the variable tail.
    pub const FIXED: usize = 3;
}

/// Fixed-slot indices of `Association`.
pub mod association_slot {
    /// Key (usually a symbol).
    pub const KEY: usize = 0;
    /// Value.
    pub const VALUE: usize = 1;
}

/// Fixed-slot indices of `Point`.
pub mod point_slot {
    /// X coordinate.
    pub const X: usize = 0;
    /// Y coordinate.
    pub const Y: usize = 1;
}

/// Fixed-slot indices of `Message`.
pub mod message_slot {
    /// The selector that failed to dispatch.
    pub const SELECTOR: usize = 0;
    /// The argument array.
    pub const ARGUMENTS: usize = 1;
}

/// Handles to the bootstrapped core classes.
#[derive(Debug, Clone, Copy)]
pub struct KnownClasses {
    /// `Object`, the hierarchy root
    pub object: ObjRef,
    /// `Class` (standing in for the metaclass tower)
    pub class: ObjRef,
    /// `UndefinedObject`
    pub undefined_object: ObjRef,
    /// `Boolean`
    pub boolean: ObjRef,
    /// `True`
    pub true_class: ObjRef,
    /// `False`
    pub false_class: ObjRef,
    /// `SmallInteger`
    pub small_integer: ObjRef,
    /// `Float`
    pub float: ObjRef,
    /// `ByteString`
    pub byte_string: ObjRef,
    /// `Symbol`
    pub symbol: ObjRef,
    /// `Array`
    pub array: ObjRef,
    /// `ByteArray`
    pub byte_array: ObjRef,
    /// `WordArray`
    pub word_array: ObjRef,
    /// `Association`
    pub association: ObjRef,
    /// `Character`
    pub character: ObjRef,
    /// `Point`
    pub point: ObjRef,
    /// `BlockClosure`
    pub block_closure: ObjRef,
    /// `MethodContext`
    pub method_context: ObjRef,
    /// `BlockContext`
    pub block_context: ObjRef,
    /// `CompiledMethod`
    pub compiled_method: ObjRef,
    /// `MethodDictionary`
    pub method_dictionary: ObjRef,
    /// `Message`
    pub message: ObjRef,
    /// `LinkedList`
    pub linked_list: ObjRef,
    /// `Semaphore`
    pub semaphore: ObjRef,
    /// `Process`
    pub process: ObjRef,
    /// `ProcessorScheduler`
    pub processor_scheduler: ObjRef,
}

/// Well-known objects and run-time registry slots.
#[derive(Debug, Clone, Copy)]
pub struct SpecialObjects {
    /// The unique `nil`
    pub nil: Value,
    /// The unique `true`
    pub bool_true: Value,
    /// The unique `false`
    pub bool_false: Value,
    /// The `ProcessorScheduler` instance
    pub scheduler: Value,
    /// Current display form, set by `beDisplay`
    pub display: Value,
    /// Current cursor form, set by `beCursor`
    pub cursor: Value,
    /// Semaphore signalled when the wake tick passes
    pub timer_semaphore: Value,
    /// Semaphore signalled on a host-posted user interrupt
    pub interrupt_semaphore: Value,
}

/// Number of scheduler priority levels.
pub const PRIORITY_LEVELS: usize = 8;

/// The object space: heap, classes, well-known objects, interning.
pub struct ObjectSpace {
    /// The object arena
    pub heap: Heap,
    /// Core class handles
    pub classes: KnownClasses,
    /// Well-known objects
    pub specials: SpecialObjects,
    symbols: FxHashMap<String, ObjRef>,
    characters: FxHashMap<u8, ObjRef>,
}

impl ObjectSpace {
    /// Bootstrap the minimal kernel.
    pub fn new() -> ObjectSpace {
        let mut heap = Heap::new();

        // The Class class describes itself; patch its class field after
        // allocation.
        let class = heap.allocate(HeapObject::new(
            ObjRef(0),
            Body::Pointers(Vec::new()),
        ));
        heap.object_mut(class).class = class;

        let raw_class = |heap: &mut Heap| {
            heap.allocate(HeapObject::new(class, Body::Pointers(Vec::new())))
        };

        let object = raw_class(&mut heap);
        let undefined_object = raw_class(&mut heap);
        let nil = Value::Object(heap.allocate(HeapObject::new(
            undefined_object,
            Body::Pointers(Vec::new()),
        )));

        let boolean = raw_class(&mut heap);
        let true_class = raw_class(&mut heap);
        let false_class = raw_class(&mut heap);
        let small_integer = raw_class(&mut heap);
        let float = raw_class(&mut heap);
        let byte_string = raw_class(&mut heap);
        let symbol = raw_class(&mut heap);
        let array = raw_class(&mut heap);
        let byte_array = raw_class(&mut heap);
        let word_array = raw_class(&mut heap);
        let association = raw_class(&mut heap);
        let character = raw_class(&mut heap);
        let point = raw_class(&mut heap);
        let block_closure = raw_class(&mut heap);
        let method_context = raw_class(&mut heap);
        let block_context = raw_class(&mut heap);
        let compiled_method = raw_class(&mut heap);
        let method_dictionary = raw_class(&mut heap);
        let message = raw_class(&mut heap);
        let linked_list = raw_class(&mut heap);
        let semaphore = raw_class(&mut heap);
        let process = raw_class(&mut heap);
        let processor_scheduler = raw_class(&mut heap);

        let bool_true = Value::Object(heap.allocate(HeapObject::new(
            true_class,
            Body::Pointers(Vec::new()),
        )));
        let bool_false = Value::Object(heap.allocate(HeapObject::new(
            false_class,
            Body::Pointers(Vec::new()),
        )));

        let classes = KnownClasses {
            object,
            class,
            undefined_object,
            boolean,
            true_class,
            false_class,
            small_integer,
            float,
            byte_string,
            symbol,
            array,
            byte_array,
            word_array,
            association,
            character,
            point,
            block_closure,
            method_context,
            block_context,
            compiled_method,
            method_dictionary,
            message,
            linked_list,
            semaphore,
            process,
            processor_scheduler,
        };

        let mut space = ObjectSpace {
            heap,
            classes,
            specials: SpecialObjects {
                nil,
                bool_true,
                bool_false,
                scheduler: nil,
                display: nil,
                cursor: nil,
                timer_semaphore: nil,
                interrupt_semaphore: nil,
            },
            symbols: FxHashMap::default(),
            characters: FxHashMap::default(),
        };

        space.describe_kernel_classes();
        space.bootstrap_scheduler();
        space
    }

    /// Fill in the slots of the bootstrapped class records.
    fn describe_kernel_classes(&mut self) {
        let nil = self.specials.nil;
        let c = self.classes;
        let table: [(ObjRef, &str, Value, InstanceSpec); 26] = [
            (c.object, "Object", nil, InstanceSpec::fixed(0)),
            (c.class, "Class", Value::Object(c.object), InstanceSpec::fixed(class_slot::CLASS_SIZE as u16)),
            (c.undefined_object, "UndefinedObject", Value::Object(c.object), InstanceSpec::fixed(0)),
            (c.boolean, "Boolean", Value::Object(c.object), InstanceSpec::fixed(0)),
            (c.true_class, "True", Value::Object(c.boolean), InstanceSpec::fixed(0)),
            (c.false_class, "False", Value::Object(c.boolean), InstanceSpec::fixed(0)),
            (c.small_integer, "SmallInteger", Value::Object(c.object), InstanceSpec::fixed(0)),
            (c.float, "Float", Value::Object(c.object), InstanceSpec::variable(0, TailKind::Float)),
            (c.byte_string, "ByteString", Value::Object(c.object), InstanceSpec::variable(0, TailKind::Bytes)),
            (c.symbol, "Symbol", Value::Object(c.byte_string), InstanceSpec::variable(0, TailKind::Bytes)),
            (c.array, "Array", Value::Object(c.object), InstanceSpec::variable(0, TailKind::Pointers)),
            (c.byte_array, "ByteArray", Value::Object(c.object), InstanceSpec::variable(0, TailKind::Bytes)),
            (c.word_array, "WordArray", Value::Object(c.object), InstanceSpec::variable(0, TailKind::Words)),
            (c.association, "Association", Value::Object(c.object), InstanceSpec::fixed(2)),
            (c.character, "Character", Value::Object(c.object), InstanceSpec::fixed(1)),
            (c.point, "Point", Value::Object(c.object), InstanceSpec::fixed(2)),
            (c.block_closure, "BlockClosure", Value::Object(c.object), InstanceSpec::variable(closure_slot::FIXED as u16, TailKind::Pointers)),
            (c.method_context, "MethodContext", Value::Object(c.object), InstanceSpec::variable(6, TailKind::Pointers)),
            (c.block_context, "BlockContext", Value::Object(c.object), InstanceSpec::variable(6, TailKind::Pointers)),
            (c.compiled_method, "CompiledMethod", Value::Object(c.object), InstanceSpec::variable(0, TailKind::CompiledMethod)),
            (c.method_dictionary, "MethodDictionary", Value::Object(c.object), InstanceSpec::fixed(0)),
            (c.message, "Message", Value::Object(c.object), InstanceSpec::fixed(2)),
            (c.linked_list, "LinkedList", Value::Object(c.object), InstanceSpec::fixed(2)),
            (c.semaphore, "Semaphore", Value::Object(c.linked_list), InstanceSpec::fixed(3)),
            (c.process, "Process", Value::Object(c.object), InstanceSpec::fixed(4)),
            (c.processor_scheduler, "ProcessorScheduler", Value::Object(c.object), InstanceSpec::fixed(2)),
        ];
        for (class, name, superclass, spec) in table {
            let dict = self
                .heap
                .allocate(HeapObject::new(c.method_dictionary, Body::MethodDict(MethodDict::default())));
            let name = self.symbol(name);
            let slots = vec![
                superclass,
                Value::Object(dict),
                spec.encode(),
                Value::Object(name),
            ];
            self.heap.object_mut(class).body = Body::Pointers(slots);
        }
    }

    /// Create the scheduler with empty priority lists and an initial
    /// process at the middle priority.
    fn bootstrap_scheduler(&mut self) {
        let nil = self.specials.nil;
        let mut lists = Vec::with_capacity(PRIORITY_LEVELS);
        for _ in 0..PRIORITY_LEVELS {
            let list = self.heap.allocate(HeapObject::new(
                self.classes.linked_list,
                Body::Pointers(vec![nil, nil]),
            ));
            lists.push(Value::Object(list));
        }
        let lists = Value::Object(self.wrap_list(lists));
        let initial = Value::Object(self.heap.allocate(HeapObject::new(
            self.classes.process,
            Body::Pointers(vec![nil, nil, Value::SmallInt(4), nil]),
        )));
        let scheduler = self.heap.allocate(HeapObject::new(
            self.classes.processor_scheduler,
            Body::Pointers(vec![lists, initial]),
        ));
        self.specials.scheduler = Value::Object(scheduler);
    }

    // ==================== Well-known values ====================

    /// `nil`.
    #[inline]
    pub fn nil(&self) -> Value {
        self.specials.nil
    }

    /// Identity test against `nil`.
    #[inline]
    pub fn is_nil(&self, v: Value) -> bool {
        v == self.specials.nil
    }

    /// The class of any value, immediates included.
    pub fn class_of(&self, v: Value) -> ObjRef {
        match v {
            Value::SmallInt(_) => self.classes.small_integer,
            Value::Object(r) => self.heap.class_of(r),
        }
    }

    /// The name of a class, for diagnostics.
    pub fn class_name(&self, class: ObjRef) -> String {
        let name = self.heap.fetch(class, class_slot::NAME).ok();
        match name.and_then(|v| v.as_object()) {
            Some(sym) => self
                .symbol_text(sym)
                .unwrap_or_else(|| format!("<class {}>", class.index())),
            None => format!("<class {}>", class.index()),
        }
    }

    // ==================== Interning ====================

    /// Intern a selector symbol.
    pub fn symbol(&mut self, text: &str) -> ObjRef {
        if let Some(&existing) = self.symbols.get(text) {
            return existing;
        }
        let symbol = self.heap.allocate(HeapObject::new(
            self.classes.symbol,
            Body::Bytes(text.as_bytes().to_vec()),
        ));
        self.symbols.insert(text.to_string(), symbol);
        symbol
    }

    /// Text of a symbol or byte string.
    pub fn symbol_text(&self, r: ObjRef) -> Option<String> {
        match &self.heap.object(r).body {
            Body::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// Interned symbols, as collector roots.
    pub fn symbol_roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.symbols.values().map(|&r| Value::Object(r))
    }

    /// The unique `Character` for a byte code.
    pub fn wrap_char(&mut self, code: u8) -> Value {
        if let Some(&existing) = self.characters.get(&code) {
            return Value::Object(existing);
        }
        let ch = self.heap.allocate(HeapObject::new(
            self.classes.character,
            Body::Pointers(vec![Value::SmallInt(i64::from(code))]),
        ));
        self.characters.insert(code, ch);
        Value::Object(ch)
    }

    /// The code of a `Character`.
    pub fn unwrap_char(&self, v: Value) -> HeapResult<u8> {
        let r = v.require_object()?;
        if self.heap.class_of(r) != self.classes.character {
            return Err(HeapError::UnexpectedType);
        }
        let code = self.heap.fetch(r, 0)?.as_small_int().ok_or(HeapError::UnexpectedType)?;
        u8::try_from(code).map_err(|_| HeapError::UnexpectedType)
    }

    // ==================== Wrapping and unwrapping ====================

    /// Tagged integer, failing outside the immediate range.
    pub fn wrap_int(&self, i: i64) -> HeapResult<Value> {
        Value::small_int(i)
    }

    /// Unwrap a tagged integer.
    pub fn unwrap_int(&self, v: Value) -> HeapResult<i64> {
        v.as_small_int().ok_or(HeapError::UnexpectedType)
    }

    /// Unwrap a non-negative integer that fits 32 bits.
    pub fn unwrap_uint32(&self, v: Value) -> HeapResult<u32> {
        let i = self.unwrap_int(v)?;
        u32::try_from(i).map_err(|_| HeapError::UnexpectedType)
    }

    /// Boxed float.
    pub fn wrap_float(&mut self, f: f64) -> Value {
        Value::Object(
            self.heap
                .allocate(HeapObject::new(self.classes.float, Body::Float(f))),
        )
    }

    /// Unwrap a boxed float.
    pub fn unwrap_float(&self, v: Value) -> HeapResult<f64> {
        match &self.heap.object(v.require_object()?).body {
            Body::Float(f) => Ok(*f),
            _ => Err(HeapError::UnexpectedType),
        }
    }

    /// The `true`/`false` object for a native bool.
    #[inline]
    pub fn wrap_bool(&self, b: bool) -> Value {
        if b {
            self.specials.bool_true
        } else {
            self.specials.bool_false
        }
    }

    /// A new byte string.
    pub fn wrap_string(&mut self, text: &str) -> ObjRef {
        self.heap.allocate(HeapObject::new(
            self.classes.byte_string,
            Body::Bytes(text.as_bytes().to_vec()),
        ))
    }

    /// Text of a byte object.
    pub fn unwrap_string(&self, v: Value) -> HeapResult<String> {
        match &self.heap.object(v.require_object()?).body {
            Body::Bytes(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            _ => Err(HeapError::UnexpectedType),
        }
    }

    /// A new `Array` holding `values`.
    pub fn wrap_list(&mut self, values: Vec<Value>) -> ObjRef {
        self.heap
            .allocate(HeapObject::new(self.classes.array, Body::Pointers(values)))
    }

    /// The indexable elements of a pointers object.
    pub fn unwrap_array(&self, v: Value) -> HeapResult<Vec<Value>> {
        let r = v.require_object()?;
        let fixed = usize::from(self.instance_spec(self.heap.class_of(r))?.fixed_fields);
        let slots = self.heap.object(r).slots().ok_or(HeapError::WrongFormat)?;
        if slots.len() < fixed {
            return Err(HeapError::WrongFormat);
        }
        Ok(slots[fixed..].to_vec())
    }

    // ==================== Instantiation ====================

    /// Decoded shape of a class.
    pub fn instance_spec(&self, class: ObjRef) -> HeapResult<InstanceSpec> {
        InstanceSpec::decode(self.heap.fetch(class, class_slot::FORMAT)?)
    }

    /// Superclass of a class, or `None` at the root.
    pub fn superclass(&self, class: ObjRef) -> Option<ObjRef> {
        self.heap
            .fetch(class, class_slot::SUPERCLASS)
            .ok()
            .and_then(|v| v.as_object())
    }

    /// New fixed-size instance; variable classes get an empty tail.
    pub fn new_instance(&mut self, class: ObjRef) -> HeapResult<ObjRef> {
        self.new_instance_sized(class, 0)
    }

    /// New instance with `size` indexable slots.
    pub fn new_instance_sized(&mut self, class: ObjRef, size: usize) -> HeapResult<ObjRef> {
        let spec = self.instance_spec(class)?;
        let nil = self.specials.nil;
        let fixed = usize::from(spec.fixed_fields);
        let body = match spec.tail {
            TailKind::None => {
                if size != 0 {
                    return Err(HeapError::WrongFormat);
                }
                Body::Pointers(vec![nil; fixed])
            }
            TailKind::Pointers => Body::Pointers(vec![nil; fixed + size]),
            TailKind::Weak => Body::WeakPointers(vec![nil; fixed + size]),
            TailKind::Bytes => Body::Bytes(vec![0; size]),
            TailKind::Words => Body::Words(vec![0; size]),
            TailKind::Float => Body::Float(0.0),
            TailKind::CompiledMethod => {
                Body::Method(CompiledMethod::from_header(0, size, nil)?)
            }
        };
        Ok(self.heap.allocate(HeapObject::new(class, body)))
    }

    /// A new `Association` (`key -> value`).
    pub fn new_association(&mut self, key: Value, value: Value) -> ObjRef {
        self.heap.allocate(HeapObject::new(
            self.classes.association,
            Body::Pointers(vec![key, value]),
        ))
    }

    /// A new `BlockClosure` over `outer_context`.
    pub fn new_closure(
        &mut self,
        outer_context: Value,
        start_pc: usize,
        num_args: usize,
        copied: Vec<Value>,
    ) -> ObjRef {
        let mut slots = vec![
            outer_context,
            Value::SmallInt(start_pc as i64),
            Value::SmallInt(num_args as i64),
        ];
        slots.extend(copied);
        self.heap
            .allocate(HeapObject::new(self.classes.block_closure, Body::Pointers(slots)))
    }

    // ==================== Indexed access ====================

    /// Size of the indexable part.
    pub fn indexed_size(&self, r: ObjRef) -> HeapResult<usize> {
        let object = self.heap.object(r);
        Ok(match &object.body {
            Body::Pointers(slots) | Body::WeakPointers(slots) => {
                let fixed = usize::from(self.instance_spec(object.class)?.fixed_fields);
                slots.len().saturating_sub(fixed)
            }
            Body::Bytes(bytes) => bytes.len(),
            Body::Words(words) => words.len(),
            Body::Float(_) => 2,
            Body::Method(method) => method.byte_size(),
            Body::MethodDict(dict) => dict.len(),
        })
    }

    /// Read the indexable part at 0-based `index`.
    ///
    /// Byte objects answer `Character`s; word objects and float halves
    /// answer integers.
    pub fn indexed_at(&mut self, r: ObjRef, index: usize) -> HeapResult<Value> {
        let class = self.heap.class_of(r);
        // Byte reads wrap into the character table, which needs `&mut`
        // after the body borrow ends.
        let mut char_code = None;
        let value = match &self.heap.object(r).body {
            Body::Pointers(slots) | Body::WeakPointers(slots) => {
                let fixed = usize::from(self.instance_spec(class)?.fixed_fields);
                slots.get(fixed + index).copied().ok_or(HeapError::OutOfBounds)?
            }
            Body::Bytes(bytes) => {
                char_code = Some(*bytes.get(index).ok_or(HeapError::OutOfBounds)?);
                Value::SmallInt(0)
            }
            Body::Words(words) => {
                let word = *words.get(index).ok_or(HeapError::OutOfBounds)?;
                Value::SmallInt(i64::from(word))
            }
            Body::Float(f) => {
                let bits = f.to_bits();
                match index {
                    0 => Value::SmallInt(i64::from((bits >> 32) as u32)),
                    1 => Value::SmallInt(i64::from(bits as u32)),
                    _ => return Err(HeapError::OutOfBounds),
                }
            }
            Body::Method(method) => Value::SmallInt(i64::from(method.byte_at(index)?)),
            Body::MethodDict(_) => return Err(HeapError::WrongFormat),
        };
        match char_code {
            Some(code) => Ok(self.wrap_char(code)),
            None => Ok(value),
        }
    }

    /// Write the indexable part at 0-based `index`.
    pub fn indexed_at_put(&mut self, r: ObjRef, index: usize, value: Value) -> HeapResult<()> {
        let class = self.heap.class_of(r);
        let fixed = usize::from(self.instance_spec(class)?.fixed_fields);
        let byte_value = match &self.heap.object(r).body {
            Body::Bytes(_) => Some(self.unwrap_char(value)?),
            _ => None,
        };
        match &mut self.heap.object_mut(r).body {
            Body::Pointers(slots) | Body::WeakPointers(slots) => {
                let slot = slots.get_mut(fixed + index).ok_or(HeapError::OutOfBounds)?;
                *slot = value;
                Ok(())
            }
            Body::Bytes(bytes) => {
                let slot = bytes.get_mut(index).ok_or(HeapError::OutOfBounds)?;
                *slot = byte_value.expect("byte value unwrapped above");
                Ok(())
            }
            Body::Words(words) => {
                let word = value
                    .as_small_int()
                    .and_then(|i| u32::try_from(i).ok())
                    .ok_or(HeapError::UnexpectedType)?;
                let slot = words.get_mut(index).ok_or(HeapError::OutOfBounds)?;
                *slot = word;
                Ok(())
            }
            Body::Float(f) => {
                let word = value
                    .as_small_int()
                    .and_then(|i| u32::try_from(i).ok())
                    .ok_or(HeapError::UnexpectedType)?;
                let bits = f.to_bits();
                let bits = match index {
                    0 => (bits & 0x0000_0000_FFFF_FFFF) | (u64::from(word) << 32),
                    1 => (bits & 0xFFFF_FFFF_0000_0000) | u64::from(word),
                    _ => return Err(HeapError::OutOfBounds),
                };
                *f = f64::from_bits(bits);
                Ok(())
            }
            Body::Method(method) => {
                let byte = value
                    .as_small_int()
                    .and_then(|i| u8::try_from(i).ok())
                    .ok_or(HeapError::UnexpectedType)?;
                method.byte_at_put(index, byte)
            }
            Body::MethodDict(_) => Err(HeapError::WrongFormat),
        }
    }

    // ==================== Classes and methods ====================

    /// Create a class with an empty method dictionary.
    pub fn create_class(
        &mut self,
        name: &str,
        superclass: Value,
        spec: InstanceSpec,
    ) -> ObjRef {
        let dict = self.heap.allocate(HeapObject::new(
            self.classes.method_dictionary,
            Body::MethodDict(MethodDict::default()),
        ));
        let name = self.symbol(name);
        let slots = vec![
            superclass,
            Value::Object(dict),
            spec.encode(),
            Value::Object(name),
        ];
        self.heap
            .allocate(HeapObject::new(self.classes.class, Body::Pointers(slots)))
    }

    /// The method dictionary object of a class, if it has one.
    pub fn method_dict_of(&self, class: ObjRef) -> Option<ObjRef> {
        self.heap
            .fetch(class, class_slot::METHOD_DICT)
            .ok()
            .and_then(|v| v.as_object())
            .filter(|&dict| matches!(self.heap.object(dict).body, Body::MethodDict(_)))
    }

    /// Look up `selector` in a single method dictionary.
    pub fn dict_at(&self, dict: ObjRef, selector: ObjRef) -> Option<ObjRef> {
        match &self.heap.object(dict).body {
            Body::MethodDict(entries) => entries.get(&selector).copied(),
            _ => None,
        }
    }

    /// Insert into a method dictionary. The caller owns cache invalidation.
    pub fn dict_at_put(&mut self, dict: ObjRef, selector: ObjRef, method: ObjRef) -> HeapResult<()> {
        match &mut self.heap.object_mut(dict).body {
            Body::MethodDict(entries) => {
                entries.insert(selector, method);
                Ok(())
            }
            _ => Err(HeapError::WrongFormat),
        }
    }

    /// Allocate `method` as a heap object and install it under
    /// `selector` in `class`'s dictionary. The caller owns cache
    /// invalidation.
    pub fn install_method(
        &mut self,
        class: ObjRef,
        selector: &str,
        method: CompiledMethod,
    ) -> HeapResult<ObjRef> {
        let selector = self.symbol(selector);
        let mut method = method;
        method.compiled_in = Some(class);
        let method = self.heap.allocate(HeapObject::new(
            self.classes.compiled_method,
            Body::Method(method),
        ));
        let dict = self.method_dict_of(class).ok_or(HeapError::WrongFormat)?;
        self.dict_at_put(dict, selector, method)?;
        Ok(method)
    }

    /// Borrow the compiled method behind a handle.
    pub fn method(&self, r: ObjRef) -> HeapResult<&CompiledMethod> {
        match &self.heap.object(r).body {
            Body::Method(method) => Ok(method),
            _ => Err(HeapError::WrongFormat),
        }
    }

    /// Mutably borrow the compiled method behind a handle.
    pub fn method_mut(&mut self, r: ObjRef) -> HeapResult<&mut CompiledMethod> {
        match &mut self.heap.object_mut(r).body {
            Body::Method(method) => Ok(method),
            _ => Err(HeapError::WrongFormat),
        }
    }

    // ==================== Collection ====================

    /// Run a full mark/sweep with the space's own roots plus `extra_roots`
    /// (typically the active context chain).
    pub fn collect_garbage(&mut self, extra_roots: &[Value]) -> crate::heap::GcStats {
        let mut roots: Vec<Value> = vec![
            self.specials.nil,
            self.specials.bool_true,
            self.specials.bool_false,
            self.specials.scheduler,
            self.specials.display,
            self.specials.cursor,
            self.specials.timer_semaphore,
            self.specials.interrupt_semaphore,
        ];
        let c = self.classes;
        roots.extend(
            [
                c.object,
                c.class,
                c.undefined_object,
                c.boolean,
                c.true_class,
                c.false_class,
                c.small_integer,
                c.float,
                c.byte_string,
                c.symbol,
                c.array,
                c.byte_array,
                c.word_array,
                c.association,
                c.character,
                c.point,
                c.block_closure,
                c.method_context,
                c.block_context,
                c.compiled_method,
                c.method_dictionary,
                c.message,
                c.linked_list,
                c.semaphore,
                c.process,
                c.processor_scheduler,
            ]
            .into_iter()
            .map(Value::Object),
        );
        roots.extend(self.symbols.values().map(|&r| Value::Object(r)));
        roots.extend(self.characters.values().map(|&r| Value::Object(r)));
        roots.extend_from_slice(extra_roots);
        let nil = self.specials.nil;
        self.heap.collect(&roots, nil)
    }
}

impl Default for ObjectSpace {
    fn default() -> Self {
        ObjectSpace::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_consistent() {
        let space = ObjectSpace::new();
        assert_eq!(space.class_of(space.specials.nil), space.classes.undefined_object);
        assert_eq!(space.class_of(space.specials.bool_true), space.classes.true_class);
        assert_eq!(space.class_of(Value::SmallInt(3)), space.classes.small_integer);
        assert_eq!(space.class_name(space.classes.array), "Array");
        assert_eq!(
            space.superclass(space.classes.symbol),
            Some(space.classes.byte_string)
        );
    }

    #[test]
    fn symbols_are_interned() {
        let mut space = ObjectSpace::new();
        assert_eq!(space.symbol("at:"), space.symbol("at:"));
        assert_ne!(space.symbol("at:"), space.symbol("at:put:"));
    }

    #[test]
    fn characters_are_unique_per_code() {
        let mut space = ObjectSpace::new();
        assert_eq!(space.wrap_char(65), space.wrap_char(65));
        let wrapped = space.wrap_char(65);
        assert_eq!(space.unwrap_char(wrapped).unwrap(), 65);
    }

    #[test]
    fn indexed_access_on_strings_answers_characters() {
        let mut space = ObjectSpace::new();
        let s = space.wrap_string("ab");
        let a = space.indexed_at(s, 0).unwrap();
        assert_eq!(space.unwrap_char(a).unwrap(), b'a');
        assert_eq!(space.indexed_at(s, 2), Err(HeapError::OutOfBounds));
        let b = space.wrap_char(b'z');
        space.indexed_at_put(s, 1, b).unwrap();
        assert_eq!(space.unwrap_string(Value::Object(s)).unwrap(), "az");
    }

    #[test]
    fn float_halves_round_trip() {
        let mut space = ObjectSpace::new();
        let f = space.wrap_float(1.5).require_object().unwrap();
        let high = space.indexed_at(f, 0).unwrap();
        let low = space.indexed_at(f, 1).unwrap();
        let copy = space.wrap_float(0.0).require_object().unwrap();
        space.indexed_at_put(copy, 0, high).unwrap();
        space.indexed_at_put(copy, 1, low).unwrap();
        assert_eq!(space.unwrap_float(Value::Object(copy)).unwrap(), 1.5);
    }

    #[test]
    fn new_instance_respects_shape() {
        let mut space = ObjectSpace::new();
        let array = space.classes.array;
        let point = space.classes.point;
        let a = space.new_instance_sized(array, 3).unwrap();
        assert_eq!(space.indexed_size(a).unwrap(), 3);
        // Fixed classes refuse a nonzero size.
        assert!(space.new_instance_sized(point, 2).is_err());
        let p = space.new_instance(point).unwrap();
        assert_eq!(space.heap.raw_len(p), 2);
    }

    #[test]
    fn collect_preserves_kernel() {
        let mut space = ObjectSpace::new();
        let doomed = space.wrap_string("doomed");
        let stats = space.collect_garbage(&[]);
        assert!(stats.freed >= 1);
        let _ = doomed;
        assert_eq!(space.class_name(space.classes.object), "Object");
    }
}
