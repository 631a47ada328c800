//! Method lookup and the global method cache
//!
//! Lookup walks the receiver's class and its superclasses, consulting each
//! method dictionary. The cache maps `(class, selector)` identity pairs to
//! the found method; it is purely advisory — a cold cache recomputes, it
//! never changes the answer. Any method-dictionary mutation anywhere
//! flushes the whole cache, which conservatively covers every subclass
//! that inherits through the mutated dictionary.

use rustc_hash::FxHashMap;
use shrew_vm_heap::{ObjRef, ObjectSpace};

/// Bound on superclass chains, against cyclic class graphs.
const MAX_HIERARCHY_DEPTH: usize = 256;

/// Lookup failure: the chain root was reached without a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodNotFound;

/// The global class×selector → method mapping.
#[derive(Debug, Default)]
pub struct MethodCache {
    entries: FxHashMap<(ObjRef, ObjRef), ObjRef>,
}

impl MethodCache {
    /// An empty cache.
    pub fn new() -> MethodCache {
        MethodCache::default()
    }

    /// Find the method `selector` would run for an instance of `class`.
    pub fn lookup(
        &mut self,
        space: &ObjectSpace,
        class: ObjRef,
        selector: ObjRef,
    ) -> Result<ObjRef, MethodNotFound> {
        if let Some(&method) = self.entries.get(&(class, selector)) {
            return Ok(method);
        }
        let method = walk_hierarchy(space, class, selector)?;
        self.entries.insert((class, selector), method);
        Ok(method)
    }

    /// Drop every entry.
    pub fn flush_all(&mut self) {
        self.entries.clear();
    }

    /// Number of cached pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is cold.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Uncached hierarchy walk.
pub fn walk_hierarchy(
    space: &ObjectSpace,
    class: ObjRef,
    selector: ObjRef,
) -> Result<ObjRef, MethodNotFound> {
    let mut current = Some(class);
    for _ in 0..MAX_HIERARCHY_DEPTH {
        let Some(c) = current else {
            return Err(MethodNotFound);
        };
        if let Some(dict) = space.method_dict_of(c)
            && let Some(method) = space.dict_at(dict, selector)
        {
            return Ok(method);
        }
        current = space.superclass(c);
    }
    Err(MethodNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrew_vm_heap::CompiledMethodBuilder;

    #[test]
    fn lookup_walks_superclasses() {
        let mut space = ObjectSpace::new();
        let mut cache = MethodCache::new();
        let method = CompiledMethodBuilder::new().bytes(&[120]).build();
        let installed = space
            .install_method(space.classes.object, "yourself", method)
            .unwrap();
        let selector = space.symbol("yourself");
        // Symbol inherits from ByteString inherits from Object.
        let found = cache.lookup(&space, space.classes.symbol, selector).unwrap();
        assert_eq!(found, installed);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_hit_equals_cold_walk() {
        let mut space = ObjectSpace::new();
        let mut cache = MethodCache::new();
        let method = CompiledMethodBuilder::new().bytes(&[120]).build();
        space
            .install_method(space.classes.array, "yourself", method)
            .unwrap();
        let selector = space.symbol("yourself");
        let hot = cache.lookup(&space, space.classes.array, selector).unwrap();
        let cold = walk_hierarchy(&space, space.classes.array, selector).unwrap();
        assert_eq!(hot, cold);
    }

    #[test]
    fn flush_forces_recomputation() {
        let mut space = ObjectSpace::new();
        let mut cache = MethodCache::new();
        let old = CompiledMethodBuilder::new().bytes(&[120]).build();
        space.install_method(space.classes.object, "probe", old).unwrap();
        let selector = space.symbol("probe");
        let first = cache.lookup(&space, space.classes.object, selector).unwrap();

        // Override in place, flush, and observe the new method.
        let new = CompiledMethodBuilder::new().bytes(&[123]).build();
        let new = space.install_method(space.classes.object, "probe", new).unwrap();
        assert_ne!(first, new);
        cache.flush_all();
        let second = cache.lookup(&space, space.classes.object, selector).unwrap();
        assert_eq!(second, new);
    }

    #[test]
    fn missing_selector_reaches_root() {
        let mut space = ObjectSpace::new();
        let mut cache = MethodCache::new();
        let selector = space.symbol("definitelyNotThere:");
        assert_eq!(
            cache.lookup(&space, space.classes.array, selector),
            Err(MethodNotFound)
        );
    }
}
