//! Reference registry: long-lived, explicitly ref-counted value handles
//!
//! Each entry runs the state machine STRONG(count>0) ⇄ WEAK(count==0) →
//! INVALID(collected). Strong entries hold exactly one adapter retain token;
//! weak entries hold a weak watch; entries whose target cannot be watched
//! (primitives, or a weak target that was already collected) sit in a hollow
//! state observing the undefined sentinel.
//!
//! Entries live in a generational arena, so a destroyed reference id turns
//! into a reportable error instead of touching freed state.

use log::debug;
use thiserror::Error;

use crate::engine::{AdapterError, EngineAdapter, RetainToken, WeakToken};
use crate::value::Value;

/// Handle to one registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefId {
    index: u32,
    generation: u32,
}

/// Registry-level failures; the environment maps these onto ABI statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RefError {
    #[error("reference was destroyed or never existed")]
    Stale,
    #[error("reference count is already zero")]
    ZeroCount,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

enum Anchor {
    /// Rooted in the adapter; exactly one token per entry
    Strong(RetainToken),
    /// Watched without rooting
    Weak(WeakToken),
    /// Nothing to watch: primitive target, or a weak target that was
    /// collected before a later promotion
    Hollow,
}

struct ReferenceEntry {
    value: Value,
    count: u32,
    anchor: Anchor,
}

struct RefSlot {
    generation: u32,
    entry: Option<ReferenceEntry>,
}

/// Arena of references owned by one environment
pub struct ReferenceRegistry {
    slots: Vec<RefSlot>,
    free: Vec<u32>,
    live: usize,
}

impl ReferenceRegistry {
    pub fn new() -> Self {
        ReferenceRegistry {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn insert(&mut self, entry: ReferenceEntry) -> RefId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            RefId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(RefSlot {
                generation: 0,
                entry: Some(entry),
            });
            RefId {
                index: self.slots.len() as u32 - 1,
                generation: 0,
            }
        }
    }

    fn entry_mut(&mut self, id: RefId) -> Result<&mut ReferenceEntry, RefError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(RefError::Stale)
    }

    /// Create a reference with an initial count; 0 means weak
    pub fn create(
        &mut self,
        adapter: &mut dyn EngineAdapter,
        value: Value,
        initial_count: u32,
    ) -> Result<RefId, RefError> {
        let entry = if initial_count > 0 {
            let token = adapter.retain(value)?;
            ReferenceEntry {
                value,
                count: initial_count,
                anchor: Anchor::Strong(token),
            }
        } else if value.is_object() {
            let token = adapter.watch_weak(value)?;
            ReferenceEntry {
                value,
                count: 0,
                anchor: Anchor::Weak(token),
            }
        } else {
            // Primitives cannot be watched; the entry observes undefined
            // from the start, matching the engines this models
            ReferenceEntry {
                value: Value::Undefined,
                count: 0,
                anchor: Anchor::Hollow,
            }
        };
        Ok(self.insert(entry))
    }

    /// count += 1, promoting WEAK → STRONG on the 0 → 1 edge.
    ///
    /// Promoting an already-collected target is not an error: the promoted
    /// value becomes the undefined sentinel.
    pub fn ref_(
        &mut self,
        adapter: &mut dyn EngineAdapter,
        id: RefId,
    ) -> Result<u32, RefError> {
        let entry = self.entry_mut(id)?;
        if entry.count == 0 {
            let value = match entry.anchor {
                Anchor::Weak(token) => {
                    let resolved = adapter.resolve_weak(token).unwrap_or(Value::Undefined);
                    adapter.unwatch_weak(token);
                    resolved
                }
                Anchor::Hollow => entry.value,
                // count == 0 excludes Strong
                Anchor::Strong(_) => entry.value,
            };
            let token = adapter.retain(value)?;
            let entry = self.entry_mut(id)?;
            entry.value = value;
            entry.anchor = Anchor::Strong(token);
            entry.count = 1;
            debug!("reference {:?} promoted to strong ({})", id, value);
        } else {
            entry.count += 1;
        }
        Ok(self.entry_mut(id)?.count)
    }

    /// count -= 1, demoting STRONG → WEAK on the 1 → 0 edge.
    /// Fails (reported, non-fatal) when the count is already zero.
    pub fn unref(
        &mut self,
        adapter: &mut dyn EngineAdapter,
        id: RefId,
    ) -> Result<u32, RefError> {
        let entry = self.entry_mut(id)?;
        if entry.count == 0 {
            return Err(RefError::ZeroCount);
        }
        if entry.count == 1 {
            let value = entry.value;
            // Watch before releasing so a failed watch leaves the strong
            // root untouched
            let anchor = if value.is_object() {
                Anchor::Weak(adapter.watch_weak(value)?)
            } else {
                Anchor::Hollow
            };
            let entry = self.entry_mut(id)?;
            let old = std::mem::replace(&mut entry.anchor, anchor);
            if !value.is_object() {
                entry.value = Value::Undefined;
            }
            entry.count = 0;
            if let Anchor::Strong(token) = old {
                adapter.release(token);
            }
            debug!("reference {:?} demoted to weak", id);
            Ok(0)
        } else {
            entry.count -= 1;
            Ok(entry.count)
        }
    }

    /// Current target: the stored value for strong entries, the resolved
    /// value for weak ones. A collected target and a legitimately-undefined
    /// target are both observed as undefined; callers cannot tell them
    /// apart.
    pub fn get_value(
        &mut self,
        adapter: &mut dyn EngineAdapter,
        id: RefId,
    ) -> Result<Value, RefError> {
        let entry = self.entry_mut(id)?;
        match entry.anchor {
            Anchor::Strong(_) => Ok(entry.value),
            Anchor::Weak(token) => Ok(adapter.resolve_weak(token).unwrap_or(Value::Undefined)),
            Anchor::Hollow => Ok(Value::Undefined),
        }
    }

    /// Release or unwatch depending on mode, then free the slot
    pub fn destroy(
        &mut self,
        adapter: &mut dyn EngineAdapter,
        id: RefId,
    ) -> Result<(), RefError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(RefError::Stale)?;
        let entry = slot.entry.take().ok_or(RefError::Stale)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        match entry.anchor {
            Anchor::Strong(token) => adapter.release(token),
            Anchor::Weak(token) => adapter.unwatch_weak(token),
            Anchor::Hollow => {}
        }
        Ok(())
    }

    /// Teardown walk: destroy every remaining entry. Runs before the engine
    /// context goes away so no weak-collection callback outlives it.
    pub fn drain(&mut self, adapter: &mut dyn EngineAdapter) {
        let mut drained = 0usize;
        for slot in &mut self.slots {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                match entry.anchor {
                    Anchor::Strong(token) => adapter.release(token),
                    Anchor::Weak(token) => adapter.unwatch_weak(token),
                    Anchor::Hollow => {}
                }
                drained += 1;
            }
        }
        self.free.clear();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.entry.is_none() {
                self.free.push(index as u32);
            }
        }
        self.live = 0;
        if drained > 0 {
            debug!("registry drained {} outstanding reference(s)", drained);
        }
    }
}

impl Default for ReferenceRegistry {
    fn default() -> Self {
        ReferenceRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::protect::ProtectAdapter;
    use crate::engine::refcount::RefCountAdapter;
    use crate::engine::rooted::RootListAdapter;

    fn backends() -> Vec<Box<dyn EngineAdapter>> {
        vec![
            Box::new(ProtectAdapter::new(64)),
            Box::new(RefCountAdapter::new(64)),
            Box::new(RootListAdapter::new(64)),
        ]
    }

    #[test]
    fn test_strong_survives_collection() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut registry = ReferenceRegistry::new();
            let obj = adapter.create_object().unwrap();
            adapter.set_property(obj, "x", Value::Int(1)).unwrap();

            let id = registry.create(adapter, obj, 1).unwrap();
            adapter.collect_garbage();

            let value = registry.get_value(adapter, id).unwrap();
            assert_eq!(value, obj, "backend {}", adapter.name());
            assert_eq!(adapter.get_property(value, "x").unwrap(), Value::Int(1));

            registry.destroy(adapter, id).unwrap();
            assert_eq!(adapter.outstanding_retains(), 0);
        }
    }

    #[test]
    fn test_weak_sees_collection_as_undefined() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut registry = ReferenceRegistry::new();
            let obj = adapter.create_object().unwrap();

            let id = registry.create(adapter, obj, 0).unwrap();
            adapter.collect_garbage();

            let value = registry.get_value(adapter, id).unwrap();
            assert!(value.is_undefined(), "backend {}", adapter.name());
            registry.destroy(adapter, id).unwrap();
        }
    }

    #[test]
    fn test_unref_underflow_reported() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut registry = ReferenceRegistry::new();
            let obj = adapter.create_object().unwrap();
            let keep = adapter.retain(obj).unwrap();

            let id = registry.create(adapter, obj, 0).unwrap();
            assert_eq!(registry.unref(adapter, id), Err(RefError::ZeroCount));
            // Still usable afterwards
            assert_eq!(registry.ref_(adapter, id).unwrap(), 1);

            registry.destroy(adapter, id).unwrap();
            adapter.release(keep);
        }
    }

    #[test]
    fn test_promote_weak_to_strong_roots_target() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut registry = ReferenceRegistry::new();
            let obj = adapter.create_object().unwrap();
            let keep = adapter.retain(obj).unwrap();

            let id = registry.create(adapter, obj, 0).unwrap();
            assert_eq!(registry.ref_(adapter, id).unwrap(), 1);
            adapter.release(keep);
            adapter.collect_garbage();

            assert_eq!(registry.get_value(adapter, id).unwrap(), obj);
            registry.destroy(adapter, id).unwrap();
            assert_eq!(adapter.outstanding_retains(), 0);
        }
    }

    #[test]
    fn test_promote_collected_weak_yields_undefined() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut registry = ReferenceRegistry::new();
            let obj = adapter.create_object().unwrap();

            let id = registry.create(adapter, obj, 0).unwrap();
            adapter.collect_garbage();

            assert_eq!(registry.ref_(adapter, id).unwrap(), 1);
            assert!(registry.get_value(adapter, id).unwrap().is_undefined());
            registry.destroy(adapter, id).unwrap();
        }
    }

    #[test]
    fn test_n_unrefs_demote_to_weak() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut registry = ReferenceRegistry::new();
            let obj = adapter.create_object().unwrap();

            let id = registry.create(adapter, obj, 3).unwrap();
            assert_eq!(registry.unref(adapter, id).unwrap(), 2);
            assert_eq!(registry.unref(adapter, id).unwrap(), 1);
            assert_eq!(registry.unref(adapter, id).unwrap(), 0);

            adapter.collect_garbage();
            assert!(registry.get_value(adapter, id).unwrap().is_undefined());
            registry.destroy(adapter, id).unwrap();
            assert_eq!(adapter.outstanding_retains(), 0);
        }
    }

    #[test]
    fn test_weak_primitive_is_hollow() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut registry = ReferenceRegistry::new();
            let id = registry.create(adapter, Value::Int(42), 0).unwrap();
            assert!(registry.get_value(adapter, id).unwrap().is_undefined());
            assert_eq!(registry.unref(adapter, id), Err(RefError::ZeroCount));
            registry.destroy(adapter, id).unwrap();
        }
    }

    #[test]
    fn test_destroyed_id_reports_stale() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut registry = ReferenceRegistry::new();
            let obj = adapter.create_object().unwrap();
            let id = registry.create(adapter, obj, 1).unwrap();
            registry.destroy(adapter, id).unwrap();

            assert_eq!(registry.ref_(adapter, id), Err(RefError::Stale));
            assert_eq!(registry.unref(adapter, id), Err(RefError::Stale));
            assert_eq!(registry.get_value(adapter, id), Err(RefError::Stale));
            assert_eq!(registry.destroy(adapter, id), Err(RefError::Stale));
        }
    }

    #[test]
    fn test_drain_releases_everything() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut registry = ReferenceRegistry::new();
            let a = adapter.create_object().unwrap();
            let b = adapter.create_object().unwrap();
            registry.create(adapter, a, 2).unwrap();
            registry.create(adapter, b, 0).unwrap();

            registry.drain(adapter);
            assert!(registry.is_empty());
            assert_eq!(adapter.outstanding_retains(), 0);
        }
    }
}
