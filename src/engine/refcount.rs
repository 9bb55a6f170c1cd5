//! Refcount backend (the QuickJS memory model)
//!
//! Values carry a duplication count: retain is `dup`, release is `free`, and
//! a cell is reclaimed the moment its count returns to zero, cascading
//! through property children. Freshly created cells start floating at zero
//! and are reclaimed by the next `collect_garbage` sweep unless something
//! duped them first — the same "root it or lose it" contract the tracing
//! backends give.
//!
//! Weak watching is emulated exactly like the protect backend: a wrapper
//! external under a hidden property whose finalizer signals collection. Here
//! the signal fires eagerly, during the reclaim cascade, with no collection
//! cycle needed.

use crate::engine::heap::CellKind;
use crate::engine::watch::WatchTable;
use crate::engine::{AdapterError, EngineAdapter, RetainToken, RootSlab, WeakToken};
use crate::value::{CellId, Value};

const WATCH_PROP: &str = "__reference__";

struct RcSlot {
    generation: u32,
    rc: u32,
    cell: Option<CellKind>,
}

/// Refcounted cell arena; no tracing pass, reclaim happens inline
struct RcHeap {
    slots: Vec<RcSlot>,
    free: Vec<u32>,
    live: usize,
    capacity: usize,
}

impl RcHeap {
    fn new(capacity: usize) -> Self {
        RcHeap {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            capacity,
        }
    }

    fn alloc(&mut self, kind: CellKind) -> Result<CellId, AdapterError> {
        if self.live >= self.capacity {
            return Err(AdapterError::OutOfMemory);
        }
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.rc = 0;
            slot.cell = Some(kind);
            Ok(CellId::new(index, slot.generation))
        } else {
            self.slots.push(RcSlot {
                generation: 0,
                rc: 0,
                cell: Some(kind),
            });
            Ok(CellId::new(self.slots.len() as u32 - 1, 0))
        }
    }

    fn slot(&self, id: CellId) -> Option<&RcSlot> {
        let slot = self.slots.get(id.index as usize)?;
        (slot.generation == id.generation && slot.cell.is_some()).then_some(slot)
    }

    fn is_live(&self, id: CellId) -> bool {
        self.slot(id).is_some()
    }

    fn dup(&mut self, id: CellId) -> Result<(), AdapterError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.cell.is_some())
            .ok_or(AdapterError::StaleValue)?;
        slot.rc += 1;
        Ok(())
    }

    /// Drop one count; reclaims the cell (and cascades through property
    /// children) when the count reaches zero
    fn release(&mut self, id: CellId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(slot) = self
                .slots
                .get_mut(id.index as usize)
                .filter(|slot| slot.generation == id.generation && slot.cell.is_some())
            else {
                continue;
            };
            if slot.rc > 0 {
                slot.rc -= 1;
            }
            if slot.rc > 0 {
                continue;
            }
            let kind = slot.cell.take();
            slot.generation = slot.generation.wrapping_add(1);
            self.live -= 1;
            match kind {
                Some(CellKind::Object { props }) => {
                    pending.extend(props.into_iter().filter_map(|(_, v)| v.cell()));
                }
                Some(CellKind::External { finalizer, .. }) => {
                    if let Some(mut finalizer) = finalizer {
                        finalizer();
                    }
                }
                _ => {}
            }
        }
    }

    /// Reclaim every floating cell (count still at zero)
    fn sweep_floating(&mut self) {
        let floating: Vec<CellId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.cell.is_some() && slot.rc == 0)
            .map(|(index, slot)| CellId::new(index as u32, slot.generation))
            .collect();
        for id in floating {
            self.release(id);
        }
    }

    fn set_prop(&mut self, id: CellId, key: &str, value: Value) -> Result<(), AdapterError> {
        // The object owns its children: dup the incoming value first so a
        // failed lookup cannot leave counts skewed
        if let Some(child) = value.cell() {
            self.dup(child)?;
        }
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.cell.is_some());
        let replaced = match slot.map(|slot| slot.cell.as_mut()) {
            Some(Some(CellKind::Object { props })) => {
                if let Some(entry) = props.iter_mut().find(|(k, _)| k == key) {
                    let old = entry.1;
                    entry.1 = value;
                    Some(old)
                } else {
                    props.push((key.to_string(), value));
                    None
                }
            }
            Some(Some(_)) => {
                if let Some(child) = value.cell() {
                    self.release(child);
                }
                return Err(AdapterError::NotAnObject);
            }
            _ => {
                if let Some(child) = value.cell() {
                    self.release(child);
                }
                return Err(AdapterError::StaleValue);
            }
        };
        if let Some(old) = replaced.and_then(Value::cell) {
            self.release(old);
        }
        Ok(())
    }

    fn get_prop(&self, id: CellId, key: &str) -> Result<Value, AdapterError> {
        match self.slot(id).and_then(|slot| slot.cell.as_ref()) {
            Some(CellKind::Object { props }) => Ok(props
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
                .unwrap_or(Value::Undefined)),
            Some(_) => Err(AdapterError::NotAnObject),
            None => Err(AdapterError::StaleValue),
        }
    }

    fn delete_prop(&mut self, id: CellId, key: &str) -> Result<bool, AdapterError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.cell.is_some());
        let removed = match slot.map(|slot| slot.cell.as_mut()) {
            Some(Some(CellKind::Object { props })) => {
                match props.iter().position(|(k, _)| k == key) {
                    Some(position) => Some(props.remove(position).1),
                    None => None,
                }
            }
            Some(Some(_)) => return Err(AdapterError::NotAnObject),
            _ => return Err(AdapterError::StaleValue),
        };
        match removed {
            Some(value) => {
                if let Some(child) = value.cell() {
                    self.release(child);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn string_value(&self, id: CellId) -> Option<&str> {
        match self.slot(id)?.cell.as_ref()? {
            CellKind::Str(s) => Some(s),
            _ => None,
        }
    }

    fn external_data(&self, id: CellId) -> Option<u64> {
        match self.slot(id)?.cell.as_ref()? {
            CellKind::External { data, .. } => Some(*data),
            _ => None,
        }
    }
}

pub struct RefCountAdapter {
    heap: RcHeap,
    retained: RootSlab,
    watches: WatchTable,
}

impl RefCountAdapter {
    pub fn new(capacity: usize) -> Self {
        RefCountAdapter {
            heap: RcHeap::new(capacity),
            retained: RootSlab::new(),
            watches: WatchTable::new(),
        }
    }

    fn wrapper_group(&self, target: CellId) -> Result<Option<u64>, AdapterError> {
        match self.heap.get_prop(target, WATCH_PROP)? {
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

impl EngineAdapter for RefCountAdapter {
    fn name(&self) -> &'static str {
        "refcount"
    }

    fn retain(&mut self, value: Value) -> Result<RetainToken, AdapterError> {
        if let Some(cell) = value.cell() {
            self.heap.dup(cell)?;
        }
        Ok(RetainToken(self.retained.insert(value)))
    }

    fn release(&mut self, token: RetainToken) {
        if let Some(value) = self.retained.remove(token.0) {
            if let Some(cell) = value.cell() {
                self.heap.release(cell);
            }
        }
    }

    fn watch_weak(&mut self, value: Value) -> Result<WeakToken, AdapterError> {
        let Value::Object(target) = value else {
            return Err(AdapterError::NotAnObject);
        };
        let group = match self.wrapper_group(target)? {
            Some(group) => group,
            None => {
                let group = self.watches.new_group();
                let finalizer = self.watches.collapse_finalizer(group);
                let wrapper = match self.heap.alloc(CellKind::External {
                    data: group,
                    finalizer: Some(finalizer),
                }) {
                    Ok(wrapper) => wrapper,
                    Err(err) => {
                        self.watches.discard_group(group);
                        return Err(err);
                    }
                };
                if let Err(err) = self.heap.set_prop(target, WATCH_PROP, Value::Object(wrapper)) {
                    self.watches.discard_group(group);
                    self.heap.release(wrapper);
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
        if removed.group_emptied && !removed.collected {
            if let Some(cell) = removed.target.cell() {
                let _ = self.heap.delete_prop(cell, WATCH_PROP);
            }
        }
    }

    fn create_object(&mut self) -> Result<Value, AdapterError> {
        self.heap
            .alloc(CellKind::Object { props: Vec::new() })
            .map(Value::Object)
    }

    fn create_string(&mut self, s: &str) -> Result<Value, AdapterError> {
        self.heap.alloc(CellKind::Str(s.to_string())).map(Value::Str)
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
        self.heap.sweep_floating();
    }

    fn outstanding_retains(&self) -> usize {
        self.retained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floating_cell_swept() {
        let mut adapter = RefCountAdapter::new(16);
        let obj = adapter.create_object().unwrap();
        assert!(adapter.is_live(obj));
        adapter.collect_garbage();
        assert!(!adapter.is_live(obj));
    }

    #[test]
    fn test_retain_release_reclaims_eagerly() {
        let mut adapter = RefCountAdapter::new(16);
        let obj = adapter.create_object().unwrap();
        let token = adapter.retain(obj).unwrap();
        adapter.collect_garbage();
        assert!(adapter.is_live(obj));

        // No sweep needed: release alone reclaims
        adapter.release(token);
        assert!(!adapter.is_live(obj));
        assert_eq!(adapter.outstanding_retains(), 0);
    }

    #[test]
    fn test_property_children_cascade() {
        let mut adapter = RefCountAdapter::new(16);
        let parent = adapter.create_object().unwrap();
        let child = adapter.create_string("payload").unwrap();
        let token = adapter.retain(parent).unwrap();
        adapter.set_property(parent, "s", child).unwrap();

        adapter.collect_garbage();
        assert!(adapter.is_live(child));

        adapter.release(token);
        assert!(!adapter.is_live(parent));
        assert!(!adapter.is_live(child));
    }

    #[test]
    fn test_weak_signal_fires_without_a_cycle() {
        let mut adapter = RefCountAdapter::new(16);
        let obj = adapter.create_object().unwrap();
        let token = adapter.retain(obj).unwrap();
        let weak = adapter.watch_weak(obj).unwrap();
        assert_eq!(adapter.resolve_weak(weak), Some(obj));

        adapter.release(token);
        // Reclaim already happened; no collect_garbage in between
        assert_eq!(adapter.resolve_weak(weak), None);
        adapter.unwatch_weak(weak);
    }

    #[test]
    fn test_unwatch_detaches_wrapper() {
        let mut adapter = RefCountAdapter::new(16);
        let obj = adapter.create_object().unwrap();
        let token = adapter.retain(obj).unwrap();
        let weak = adapter.watch_weak(obj).unwrap();
        adapter.unwatch_weak(weak);
        assert_eq!(
            adapter.get_property(obj, WATCH_PROP).unwrap(),
            Value::Undefined
        );
        adapter.release(token);
    }

    #[test]
    fn test_replacing_property_releases_old_child() {
        let mut adapter = RefCountAdapter::new(16);
        let parent = adapter.create_object().unwrap();
        let first = adapter.create_string("first").unwrap();
        let second = adapter.create_string("second").unwrap();
        let token = adapter.retain(parent).unwrap();
        adapter.set_property(parent, "s", first).unwrap();
        adapter.set_property(parent, "s", second).unwrap();

        adapter.collect_garbage();
        assert!(!adapter.is_live(first));
        assert!(adapter.is_live(second));
        adapter.release(token);
    }
}
