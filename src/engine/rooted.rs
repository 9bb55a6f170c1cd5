//! Custom-root-list backend (the Hermes memory model)
//!
//! Retained values go into a root list the tracing pass walks, the way a
//! Hermes embedder registers custom roots with the GC. Weak references are
//! native: heap-owned weak slots cleared during the sweep, no wrapper-object
//! emulation anywhere. Handle scopes do not retain per handle; the scope's
//! handle list is registered with the adapter and is itself a root.

use crate::engine::heap::Heap;
use crate::engine::{AdapterError, EngineAdapter, RetainToken, RootSlab, ScopeRooting, WeakToken};
use crate::value::Value;

pub struct RootListAdapter {
    heap: Heap,
    roots: RootSlab,
    // (scope id, value) pairs; strictly LIFO per scope
    scope_roots: Vec<(u64, Value)>,
}

impl RootListAdapter {
    pub fn new(capacity: usize) -> Self {
        RootListAdapter {
            heap: Heap::new(capacity),
            roots: RootSlab::new(),
            scope_roots: Vec::new(),
        }
    }
}

impl EngineAdapter for RootListAdapter {
    fn name(&self) -> &'static str {
        "rooted"
    }

    fn retain(&mut self, value: Value) -> Result<RetainToken, AdapterError> {
        if let Some(cell) = value.cell() {
            if !self.heap.is_live(cell) {
                return Err(AdapterError::StaleValue);
            }
        }
        Ok(RetainToken(self.roots.insert(value)))
    }

    fn release(&mut self, token: RetainToken) {
        self.roots.remove(token.0);
    }

    fn watch_weak(&mut self, value: Value) -> Result<WeakToken, AdapterError> {
        if !value.is_object() {
            return Err(AdapterError::NotAnObject);
        }
        self.heap.weak_watch(value).map(WeakToken)
    }

    fn resolve_weak(&mut self, token: WeakToken) -> Option<Value> {
        self.heap.weak_resolve(token.0)
    }

    fn unwatch_weak(&mut self, token: WeakToken) {
        self.heap.weak_release(token.0);
    }

    fn scope_rooting(&self) -> ScopeRooting {
        ScopeRooting::RootList
    }

    fn add_scope_root(&mut self, scope: u64, value: Value) {
        self.scope_roots.push((scope, value));
    }

    fn drop_scope_roots(&mut self, scope: u64) {
        self.scope_roots.retain(|(owner, _)| *owner != scope);
    }

    fn create_object(&mut self) -> Result<Value, AdapterError> {
        self.heap.alloc_object().map(Value::Object)
    }

    fn create_string(&mut self, s: &str) -> Result<Value, AdapterError> {
        self.heap.alloc_string(s).map(Value::Str)
    }

    fn string_value(&self, value: Value) -> Option<String> {
        self.heap.string_value(value.cell()?).map(str::to_string)
    }

    fn set_property(
        &mut self,
        object: Value,
        key: &str,
        value: Value,
    ) -> Result<(), AdapterError> {
        let cell = object.cell().ok_or(AdapterError::NotAnObject)?;
        self.heap.set_prop(cell, key, value)
    }

    fn get_property(&mut self, object: Value, key: &str) -> Result<Value, AdapterError> {
        let cell = object.cell().ok_or(AdapterError::NotAnObject)?;
        self.heap.get_prop(cell, key)
    }

    fn is_live(&self, value: Value) -> bool {
        match value.cell() {
            Some(cell) => self.heap.is_live(cell),
            None => true,
        }
    }

    fn collect_garbage(&mut self) {
        let roots: Vec<Value> = self
            .roots
            .iter()
            .chain(self.scope_roots.iter().map(|(_, value)| *value))
            .collect();
        self.heap.collect(roots);
    }

    fn outstanding_retains(&self) -> usize {
        self.roots.len() + self.scope_roots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_list_keeps_value_alive() {
        let mut adapter = RootListAdapter::new(16);
        let obj = adapter.create_object().unwrap();
        let token = adapter.retain(obj).unwrap();
        adapter.collect_garbage();
        assert!(adapter.is_live(obj));

        adapter.release(token);
        adapter.collect_garbage();
        assert!(!adapter.is_live(obj));
    }

    #[test]
    fn test_native_weak_cleared_at_sweep() {
        let mut adapter = RootListAdapter::new(16);
        let obj = adapter.create_object().unwrap();
        let weak = adapter.watch_weak(obj).unwrap();
        assert_eq!(adapter.resolve_weak(weak), Some(obj));

        adapter.collect_garbage();
        assert_eq!(adapter.resolve_weak(weak), None);
        adapter.unwatch_weak(weak);
    }

    #[test]
    fn test_scope_roots_are_gc_roots() {
        let mut adapter = RootListAdapter::new(16);
        let obj = adapter.create_object().unwrap();
        adapter.add_scope_root(1, obj);
        adapter.collect_garbage();
        assert!(adapter.is_live(obj));

        adapter.drop_scope_roots(1);
        adapter.collect_garbage();
        assert!(!adapter.is_live(obj));
        assert_eq!(adapter.outstanding_retains(), 0);
    }

    #[test]
    fn test_dropping_one_scope_keeps_the_other() {
        let mut adapter = RootListAdapter::new(16);
        let kept = adapter.create_object().unwrap();
        let dropped = adapter.create_object().unwrap();
        adapter.add_scope_root(1, kept);
        adapter.add_scope_root(2, dropped);
        adapter.drop_scope_roots(2);
        adapter.collect_garbage();
        assert!(adapter.is_live(kept));
        assert!(!adapter.is_live(dropped));
    }
}
