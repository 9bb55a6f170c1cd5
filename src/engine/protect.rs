//! Protect-counter backend (the JSC memory model)
//!
//! Rooting works like `JSValueProtect`: every retain drops the value into a
//! protect slab that the tracing pass treats as a root set. The engine has no
//! native weak references, so weak watching is emulated with a synthetic
//! wrapper object attached to the target under a hidden property; the
//! wrapper's finalizer is the collection signal.

use crate::engine::heap::Heap;
use crate::engine::watch::WatchTable;
use crate::engine::{AdapterError, EngineAdapter, RetainToken, RootSlab, WeakToken};
use crate::value::Value;

/// Hidden property carrying the weak wrapper, reachable only via the target
const WATCH_PROP: &str = "__reference__";

pub struct ProtectAdapter {
    heap: Heap,
    protects: RootSlab,
    watches: WatchTable,
}

impl ProtectAdapter {
    pub fn new(capacity: usize) -> Self {
        ProtectAdapter {
            heap: Heap::new(capacity),
            protects: RootSlab::new(),
            watches: WatchTable::new(),
        }
    }

    /// Existing watch group on `target`, if a wrapper is already attached
    fn wrapper_group(&self, target: Value) -> Result<Option<u64>, AdapterError> {
        let cell = target.cell().ok_or(AdapterError::NotAnObject)?;
        match self.heap.get_prop(cell, WATCH_PROP)? {
            Value::Undefined => Ok(None),
            Value::Object(wrapper) => self
                .heap
                .external_data(wrapper)
                .map(Some)
                .ok_or(AdapterError::StaleValue),
            _ => Err(AdapterError::StaleValue),
        }
    }
}

impl EngineAdapter for ProtectAdapter {
    fn name(&self) -> &'static str {
        "protect"
    }

    fn retain(&mut self, value: Value) -> Result<RetainToken, AdapterError> {
        if let Some(cell) = value.cell() {
            if !self.heap.is_live(cell) {
                return Err(AdapterError::StaleValue);
            }
        }
        Ok(RetainToken(self.protects.insert(value)))
    }

    fn release(&mut self, token: RetainToken) {
        self.protects.remove(token.0);
    }

    fn watch_weak(&mut self, value: Value) -> Result<WeakToken, AdapterError> {
        let Value::Object(target) = value else {
            return Err(AdapterError::NotAnObject);
        };
        let group = match self.wrapper_group(value)? {
            Some(group) => group,
            None => {
                let group = self.watches.new_group();
                let finalizer = self.watches.collapse_finalizer(group);
                let wrapper = match self.heap.alloc_external(group, finalizer) {
                    Ok(wrapper) => wrapper,
                    Err(err) => {
                        self.watches.discard_group(group);
                        return Err(err);
                    }
                };
                if let Err(err) = self.heap.set_prop(target, WATCH_PROP, Value::Object(wrapper)) {
                    // Wrapper stays floating and dies at the next cycle;
                    // its finalizer is generation-safe against the discard
                    self.watches.discard_group(group);
                    return Err(err);
                }
                group
            }
        };
        Ok(self.watches.add(group, value))
    }

    fn resolve_weak(&mut self, token: WeakToken) -> Option<Value> {
        self.watches.resolve(token)
    }

    fn unwatch_weak(&mut self, token: WeakToken) {
        let Some(removed) = self.watches.remove(token) else {
            return;
        };
        // Last watcher of a live target: detach the wrapper so it stops
        // shadowing the target's lifetime
        if removed.group_emptied && !removed.collected {
            if let Some(cell) = removed.target.cell() {
                let _ = self.heap.delete_prop(cell, WATCH_PROP);
            }
        }
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
        let roots: Vec<Value> = self.protects.iter().collect();
        self.heap.collect(roots);
    }

    fn outstanding_retains(&self) -> usize {
        self.protects.len()
    }
}
