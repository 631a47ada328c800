//! The heap arena
//!
//! Objects live in an index-addressed arena. Handles stay valid for the
//! life of the object; a slot is reused only after its object has been
//! proven unreachable by [`Heap::collect`], so no live handle can dangle.
//!
//! `become:` is a record swap: after swapping, every existing handle to one
//! object denotes the other, identity hash included.

use rustc_hash::FxHashMap;

use crate::error::{HeapError, HeapResult};
use crate::object::{Body, HeapObject};
use crate::value::{ObjRef, Value};

/// Statistics from one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Objects freed by the sweep
    pub freed: usize,
    /// Objects still live afterwards
    pub live: usize,
    /// Weak slots cleared to nil
    pub weak_cleared: usize,
}

/// The object arena.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    next_hash: u32,
}

impl Heap {
    /// An empty heap.
    pub fn new() -> Heap {
        Heap::default()
    }

    /// Allocate a record and return its handle.
    pub fn allocate(&mut self, object: HeapObject) -> ObjRef {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(object);
                ObjRef(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(object));
                ObjRef(index)
            }
        }
    }

    /// Borrow an object record.
    pub fn object(&self, r: ObjRef) -> &HeapObject {
        self.slots[r.0 as usize]
            .as_ref()
            .expect("dead object reference")
    }

    /// Mutably borrow an object record.
    pub fn object_mut(&mut self, r: ObjRef) -> &mut HeapObject {
        self.slots[r.0 as usize]
            .as_mut()
            .expect("dead object reference")
    }

    /// The object's class.
    #[inline]
    pub fn class_of(&self, r: ObjRef) -> ObjRef {
        self.object(r).class
    }

    /// Identity hash, assigned on first request and stable afterwards.
    pub fn identity_hash(&mut self, r: ObjRef) -> u32 {
        let next = self.next_hash.wrapping_add(1).max(1);
        let object = self.object_mut(r);
        if object.hash == 0 {
            object.hash = next;
            self.next_hash = next;
        }
        self.object(r).hash
    }

    /// Fixed or variable pointer slot read.
    pub fn fetch(&self, r: ObjRef, index: usize) -> HeapResult<Value> {
        let slots = self.object(r).slots().ok_or(HeapError::WrongFormat)?;
        slots.get(index).copied().ok_or(HeapError::OutOfBounds)
    }

    /// Fixed or variable pointer slot write.
    pub fn store(&mut self, r: ObjRef, index: usize, value: Value) -> HeapResult<()> {
        let slots = self.object_mut(r).slots_mut().ok_or(HeapError::WrongFormat)?;
        let slot = slots.get_mut(index).ok_or(HeapError::OutOfBounds)?;
        *slot = value;
        Ok(())
    }

    /// Total pointer-slot count, or the raw element count of other formats.
    pub fn raw_len(&self, r: ObjRef) -> usize {
        self.object(r).raw_len()
    }

    /// Two-way identity swap.
    ///
    /// Fails for immediates; any two heap records can swap.
    pub fn r#become(&mut self, a: Value, b: Value) -> HeapResult<()> {
        let a = a.require_object()?;
        let b = b.require_object()?;
        if a != b {
            self.slots.swap(a.0 as usize, b.0 as usize);
        }
        Ok(())
    }

    /// One-way become: forward every reference so that each `from` handle
    /// in `pairs` denotes its `to` object.
    ///
    /// Rewrites class fields, pointer slots (weak included), method
    /// literals and compiled-in classes, and method-dictionary keys and
    /// values across the whole arena. The `from` records keep their
    /// storage and become unreachable garbage unless re-referenced.
    pub fn become_forward(&mut self, pairs: &[(ObjRef, ObjRef)]) {
        if pairs.is_empty() {
            return;
        }
        let forward: FxHashMap<ObjRef, ObjRef> = pairs.iter().copied().collect();
        let redirect_ref = |r: ObjRef| forward.get(&r).copied().unwrap_or(r);
        let redirect = |v: Value| match v {
            Value::Object(r) => Value::Object(redirect_ref(r)),
            immediate => immediate,
        };
        for object in self.slots.iter_mut().flatten() {
            object.class = redirect_ref(object.class);
            match &mut object.body {
                Body::Pointers(values) | Body::WeakPointers(values) => {
                    for value in values {
                        *value = redirect(*value);
                    }
                }
                Body::Method(method) => {
                    for literal in &mut method.literals {
                        *literal = redirect(*literal);
                    }
                    method.compiled_in = method.compiled_in.map(redirect_ref);
                }
                Body::MethodDict(dict) => {
                    if dict.keys().any(|k| forward.contains_key(k)) {
                        let entries: Vec<(ObjRef, ObjRef)> = dict
                            .drain(..)
                            .map(|(k, v)| (redirect_ref(k), redirect_ref(v)))
                            .collect();
                        dict.extend(entries);
                    } else {
                        for value in dict.values_mut() {
                            *value = redirect_ref(*value);
                        }
                    }
                }
                Body::Bytes(_) | Body::Words(_) | Body::Float(_) => {}
            }
        }
    }

    /// All live objects, in allocation-index order.
    pub fn iter_live(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| ObjRef(index as u32))
    }

    /// Live instances of a class, each visited once, in index order.
    pub fn instances_of(&self, class: ObjRef) -> impl Iterator<Item = ObjRef> + '_ {
        self.iter_live().filter(move |&r| self.class_of(r) == class)
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Mark from `roots`, sweep everything unmarked, and clear weak slots
    /// whose referents died. `nil` is the value dead weak slots take.
    pub fn collect(&mut self, roots: &[Value], nil: Value) -> GcStats {
        for slot in self.slots.iter_mut().flatten() {
            slot.marked = false;
        }

        let mut worklist: Vec<ObjRef> = roots.iter().filter_map(|v| v.as_object()).collect();
        while let Some(r) = worklist.pop() {
            let Some(object) = self.slots[r.0 as usize].as_mut() else {
                continue;
            };
            if object.marked {
                continue;
            }
            object.marked = true;
            let object = self.slots[r.0 as usize].as_ref().expect("marked object");
            worklist.push(object.class);
            match &object.body {
                Body::Pointers(slots) => {
                    worklist.extend(slots.iter().filter_map(|v| v.as_object()));
                }
                // Weak referents are not traced; the class already was.
                Body::WeakPointers(_) => {}
                Body::Method(method) => {
                    worklist.extend(method.literals.iter().filter_map(|v| v.as_object()));
                }
                Body::MethodDict(dict) => {
                    worklist.extend(dict.keys().copied());
                    worklist.extend(dict.values().copied());
                }
                Body::Bytes(_) | Body::Words(_) | Body::Float(_) => {}
            }
        }

        let mut stats = GcStats::default();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(object) if !object.marked => {
                    *slot = None;
                    self.free.push(index as u32);
                    stats.freed += 1;
                }
                Some(_) => stats.live += 1,
                None => {}
            }
        }

        // Lazy weak clearing: now that dead slots are gone, nil out weak
        // references into them.
        for index in 0..self.slots.len() {
            let is_weak = matches!(
                self.slots[index].as_ref().map(|o| &o.body),
                Some(Body::WeakPointers(_))
            );
            if !is_weak {
                continue;
            }
            let mut cleared = 0usize;
            let dead_slots: Vec<usize> = {
                let Some(object) = self.slots[index].as_ref() else {
                    continue;
                };
                let Body::WeakPointers(values) = &object.body else {
                    continue;
                };
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| {
                        v.as_object()
                            .is_some_and(|r| self.slots[r.0 as usize].is_none())
                    })
                    .map(|(i, _)| i)
                    .collect()
            };
            if let Some(object) = self.slots[index].as_mut()
                && let Body::WeakPointers(values) = &mut object.body
            {
                for i in dead_slots {
                    values[i] = nil;
                    cleared += 1;
                }
            }
            stats.weak_cleared += cleared;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointers(heap: &mut Heap, class: ObjRef, slots: Vec<Value>) -> ObjRef {
        heap.allocate(HeapObject::new(class, Body::Pointers(slots)))
    }

    fn setup() -> (Heap, ObjRef, Value) {
        let mut heap = Heap::new();
        // A self-describing class record doubling as nil for tests.
        let class = heap.allocate(HeapObject::new(ObjRef(0), Body::Pointers(vec![])));
        (heap, class, Value::Object(class))
    }

    #[test]
    fn hash_is_lazy_and_stable() {
        let (mut heap, class, _) = setup();
        let a = pointers(&mut heap, class, vec![]);
        let b = pointers(&mut heap, class, vec![]);
        let hb = heap.identity_hash(b);
        let ha = heap.identity_hash(a);
        assert_ne!(ha, hb);
        assert_eq!(heap.identity_hash(a), ha);
    }

    #[test]
    fn become_swaps_contents_and_hash() {
        let (mut heap, class, _) = setup();
        let a = pointers(&mut heap, class, vec![Value::SmallInt(1)]);
        let b = pointers(&mut heap, class, vec![Value::SmallInt(2)]);
        let ha = heap.identity_hash(a);
        let hb = heap.identity_hash(b);
        heap.r#become(Value::Object(a), Value::Object(b)).unwrap();
        assert_eq!(heap.fetch(a, 0).unwrap(), Value::SmallInt(2));
        assert_eq!(heap.fetch(b, 0).unwrap(), Value::SmallInt(1));
        assert_eq!(heap.identity_hash(a), hb);
        assert_eq!(heap.identity_hash(b), ha);
        // A second swap is the identity.
        heap.r#become(Value::Object(a), Value::Object(b)).unwrap();
        assert_eq!(heap.fetch(a, 0).unwrap(), Value::SmallInt(1));
        assert_eq!(heap.identity_hash(a), ha);
    }

    #[test]
    fn become_rejects_immediates() {
        let (mut heap, class, _) = setup();
        let a = pointers(&mut heap, class, vec![]);
        assert!(heap.r#become(Value::SmallInt(1), Value::Object(a)).is_err());
    }

    #[test]
    fn become_forward_redirects_every_reference() {
        let (mut heap, class, _) = setup();
        let from = pointers(&mut heap, class, vec![]);
        let to = pointers(&mut heap, class, vec![]);
        let holder = pointers(
            &mut heap,
            class,
            vec![Value::Object(from), Value::SmallInt(3)],
        );
        // An object whose class is the forwarded one follows too.
        let instance = pointers(&mut heap, from, vec![]);
        heap.become_forward(&[(from, to)]);
        assert_eq!(heap.fetch(holder, 0).unwrap(), Value::Object(to));
        assert_eq!(heap.fetch(holder, 1).unwrap(), Value::SmallInt(3));
        assert_eq!(heap.class_of(instance), to);
        // The forwarded record itself is untouched, just unreferenced.
        assert_eq!(heap.class_of(from), class);
    }

    #[test]
    fn collect_frees_unreachable_and_clears_weak() {
        let (mut heap, class, nil) = setup();
        let live = pointers(&mut heap, class, vec![]);
        let doomed = pointers(&mut heap, class, vec![]);
        let weak = heap.allocate(HeapObject::new(
            class,
            Body::WeakPointers(vec![Value::Object(live), Value::Object(doomed)]),
        ));
        let stats = heap.collect(&[Value::Object(live), Value::Object(weak)], nil);
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.weak_cleared, 1);
        assert_eq!(heap.fetch(weak, 0).unwrap(), Value::Object(live));
        assert_eq!(heap.fetch(weak, 1).unwrap(), nil);
    }

    #[test]
    fn instance_enumeration_visits_each_once() {
        let (mut heap, class, _) = setup();
        let a = pointers(&mut heap, class, vec![]);
        let b = pointers(&mut heap, class, vec![]);
        let found: Vec<ObjRef> = heap.instances_of(class).collect();
        assert_eq!(found, vec![class, a, b]);
    }
}
