//! Tracing cell heap shared by the mark-sweep backends
//!
//! A generational slot arena instead of a raw byte heap: each cell is an
//! object (ordered property list), a string, or an external carrying a
//! finalizer. Collection is two-phase — mark from the roots the adapter
//! supplies, then sweep unmarked cells, firing external finalizers and
//! clearing native weak slots whose target died.
//!
//! Finalizers run after the sweep loop finishes and must not touch the heap;
//! they exist to flip bookkeeping bits in adapter-side tables.

use crate::engine::AdapterError;
use crate::value::{CellId, Value};

/// Callback fired once when an external cell is reclaimed
pub type Finalizer = Box<dyn FnMut()>;

/// One heap cell
pub enum CellKind {
    /// Plain object with insertion-ordered properties
    Object { props: Vec<(String, Value)> },
    /// Immutable string payload
    Str(String),
    /// Synthetic host object: opaque data word plus a destruction signal
    External { data: u64, finalizer: Option<Finalizer> },
}

pub struct Cell {
    marked: bool,
    pub kind: CellKind,
}

struct Slot {
    generation: u32,
    cell: Option<Cell>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WeakState {
    Free,
    Watching(CellId),
    Cleared,
}

struct WeakSlot {
    generation: u32,
    state: WeakState,
    value: Value,
}

/// Mark-sweep cell heap with a fixed live-cell capacity
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    capacity: usize,
    weak: Vec<WeakSlot>,
    weak_free: Vec<u32>,
}

impl Heap {
    /// `capacity` bounds the number of simultaneously live cells; an
    /// allocation past it reports `OutOfMemory` instead of growing
    pub fn new(capacity: usize) -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            capacity,
            weak: Vec::new(),
            weak_free: Vec::new(),
        }
    }

    pub fn live_cells(&self) -> usize {
        self.live
    }

    fn alloc(&mut self, kind: CellKind) -> Result<CellId, AdapterError> {
        if self.live >= self.capacity {
            return Err(AdapterError::OutOfMemory);
        }
        let cell = Cell {
            marked: false,
            kind,
        };
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.cell = Some(cell);
            Ok(CellId::new(index, slot.generation))
        } else {
            self.slots.push(Slot {
                generation: 0,
                cell: Some(cell),
            });
            Ok(CellId::new(self.slots.len() as u32 - 1, 0))
        }
    }

    pub fn alloc_object(&mut self) -> Result<CellId, AdapterError> {
        self.alloc(CellKind::Object { props: Vec::new() })
    }

    pub fn alloc_string(&mut self, s: &str) -> Result<CellId, AdapterError> {
        self.alloc(CellKind::Str(s.to_string()))
    }

    pub fn alloc_external(
        &mut self,
        data: u64,
        finalizer: Finalizer,
    ) -> Result<CellId, AdapterError> {
        self.alloc(CellKind::External {
            data,
            finalizer: Some(finalizer),
        })
    }

    fn slot(&self, id: CellId) -> Option<&Slot> {
        let slot = self.slots.get(id.index as usize)?;
        (slot.generation == id.generation && slot.cell.is_some()).then_some(slot)
    }

    pub fn is_live(&self, id: CellId) -> bool {
        self.slot(id).is_some()
    }

    pub fn get(&self, id: CellId) -> Option<&Cell> {
        self.slot(id)?.cell.as_ref()
    }

    fn get_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.cell.as_mut()
    }

    pub fn string_value(&self, id: CellId) -> Option<&str> {
        match &self.get(id)?.kind {
            CellKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn external_data(&self, id: CellId) -> Option<u64> {
        match &self.get(id)?.kind {
            CellKind::External { data, .. } => Some(*data),
            _ => None,
        }
    }

    pub fn set_prop(&mut self, id: CellId, key: &str, value: Value) -> Result<(), AdapterError> {
        match &mut self.get_mut(id).ok_or(AdapterError::StaleValue)?.kind {
            CellKind::Object { props } => {
                if let Some(entry) = props.iter_mut().find(|(k, _)| k == key) {
                    entry.1 = value;
                } else {
                    props.push((key.to_string(), value));
                }
                Ok(())
            }
            _ => Err(AdapterError::NotAnObject),
        }
    }

    pub fn get_prop(&self, id: CellId, key: &str) -> Result<Value, AdapterError> {
        match &self.get(id).ok_or(AdapterError::StaleValue)?.kind {
            CellKind::Object { props } => Ok(props
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
                .unwrap_or(Value::Undefined)),
            _ => Err(AdapterError::NotAnObject),
        }
    }

    pub fn delete_prop(&mut self, id: CellId, key: &str) -> Result<bool, AdapterError> {
        match &mut self.get_mut(id).ok_or(AdapterError::StaleValue)?.kind {
            CellKind::Object { props } => {
                let before = props.len();
                props.retain(|(k, _)| k != key);
                Ok(props.len() != before)
            }
            _ => Err(AdapterError::NotAnObject),
        }
    }

    // Native weak slots (the Hermes-model backend's weak support)

    pub fn weak_watch(&mut self, value: Value) -> Result<u64, AdapterError> {
        let id = value.cell().ok_or(AdapterError::NotAnObject)?;
        if !self.is_live(id) {
            return Err(AdapterError::StaleValue);
        }
        let index = if let Some(index) = self.weak_free.pop() {
            let slot = &mut self.weak[index as usize];
            slot.state = WeakState::Watching(id);
            slot.value = value;
            index
        } else {
            self.weak.push(WeakSlot {
                generation: 0,
                state: WeakState::Watching(id),
                value,
            });
            self.weak.len() as u32 - 1
        };
        Ok(pack(index, self.weak[index as usize].generation))
    }

    pub fn weak_resolve(&self, token: u64) -> Option<Value> {
        let (index, generation) = unpack(token);
        let slot = self.weak.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        match slot.state {
            WeakState::Watching(_) => Some(slot.value),
            _ => None,
        }
    }

    pub fn weak_release(&mut self, token: u64) {
        let (index, generation) = unpack(token);
        if let Some(slot) = self.weak.get_mut(index as usize) {
            if slot.generation == generation && slot.state != WeakState::Free {
                slot.state = WeakState::Free;
                slot.generation = slot.generation.wrapping_add(1);
                self.weak_free.push(index);
            }
        }
    }

    /// Full mark-sweep cycle over the supplied roots
    pub fn collect<I>(&mut self, roots: I)
    where
        I: IntoIterator<Item = Value>,
    {
        // Mark phase
        for slot in &mut self.slots {
            if let Some(cell) = &mut slot.cell {
                cell.marked = false;
            }
        }
        let mut worklist: Vec<CellId> = roots.into_iter().filter_map(Value::cell).collect();
        while let Some(id) = worklist.pop() {
            let Some(cell) = self.get_mut(id) else {
                continue;
            };
            if cell.marked {
                continue;
            }
            cell.marked = true;
            if let CellKind::Object { props } = &cell.kind {
                worklist.extend(props.iter().filter_map(|(_, v)| v.cell()));
            }
        }

        // Sweep phase; finalizers are deferred until the heap is consistent
        let mut finalizers: Vec<Finalizer> = Vec::new();
        for slot in &mut self.slots {
            let dead = matches!(&slot.cell, Some(cell) if !cell.marked);
            if dead {
                if let Some(Cell {
                    kind: CellKind::External { finalizer, .. },
                    ..
                }) = slot.cell.take()
                {
                    finalizers.extend(finalizer);
                }
                slot.generation = slot.generation.wrapping_add(1);
                self.live -= 1;
            }
        }
        self.free.clear();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.cell.is_none() {
                self.free.push(index as u32);
            }
        }

        // Clear weak slots whose target died
        for slot in &mut self.weak {
            if let WeakState::Watching(id) = slot.state {
                let alive = self
                    .slots
                    .get(id.index as usize)
                    .is_some_and(|s| s.generation == id.generation && s.cell.is_some());
                if !alive {
                    slot.state = WeakState::Cleared;
                }
            }
        }

        for mut finalizer in finalizers {
            finalizer();
        }
    }
}

#[inline]
fn pack(index: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
fn unpack(token: u64) -> (u32, u32) {
    (token as u32, (token >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;
    use std::rc::Rc;

    #[test]
    fn test_alloc_and_props() {
        let mut heap = Heap::new(16);
        let obj = heap.alloc_object().unwrap();
        heap.set_prop(obj, "x", Value::Int(1)).unwrap();
        assert_eq!(heap.get_prop(obj, "x").unwrap(), Value::Int(1));
        assert_eq!(heap.get_prop(obj, "missing").unwrap(), Value::Undefined);
        assert!(heap.delete_prop(obj, "x").unwrap());
        assert!(!heap.delete_prop(obj, "x").unwrap());
    }

    #[test]
    fn test_capacity_limit() {
        let mut heap = Heap::new(1);
        heap.alloc_object().unwrap();
        assert_eq!(heap.alloc_object(), Err(AdapterError::OutOfMemory));
    }

    #[test]
    fn test_collect_unrooted_dies_rooted_survives() {
        let mut heap = Heap::new(16);
        let kept = heap.alloc_object().unwrap();
        let dropped = heap.alloc_object().unwrap();
        heap.collect([Value::Object(kept)]);
        assert!(heap.is_live(kept));
        assert!(!heap.is_live(dropped));
        assert_eq!(heap.live_cells(), 1);
    }

    #[test]
    fn test_collect_traces_properties() {
        let mut heap = Heap::new(16);
        let parent = heap.alloc_object().unwrap();
        let child = heap.alloc_string("payload").unwrap();
        heap.set_prop(parent, "s", Value::Str(child)).unwrap();
        heap.collect([Value::Object(parent)]);
        assert!(heap.is_live(child));
        assert_eq!(heap.string_value(child), Some("payload"));
    }

    #[test]
    fn test_stale_id_after_reuse() {
        let mut heap = Heap::new(16);
        let old = heap.alloc_object().unwrap();
        heap.collect([]);
        let new = heap.alloc_object().unwrap();
        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);
        assert!(!heap.is_live(old));
        assert!(heap.is_live(new));
    }

    #[test]
    fn test_external_finalizer_fires_once() {
        let fired = Rc::new(StdCell::new(0u32));
        let observed = fired.clone();
        let mut heap = Heap::new(16);
        heap.alloc_external(7, Box::new(move || observed.set(observed.get() + 1)))
            .unwrap();
        heap.collect([]);
        heap.collect([]);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_weak_slot_cleared_on_death() {
        let mut heap = Heap::new(16);
        let obj = heap.alloc_object().unwrap();
        let token = heap.weak_watch(Value::Object(obj)).unwrap();
        assert_eq!(heap.weak_resolve(token), Some(Value::Object(obj)));

        heap.collect([Value::Object(obj)]);
        assert_eq!(heap.weak_resolve(token), Some(Value::Object(obj)));

        heap.collect([]);
        assert_eq!(heap.weak_resolve(token), None);

        heap.weak_release(token);
        assert_eq!(heap.weak_resolve(token), None);
    }
}
