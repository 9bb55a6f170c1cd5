//! Engine adapters
//!
//! One JS engine's memory model differs sharply from the next: JSC-style
//! engines root values through a protect counter, QuickJS-style engines
//! duplicate refcounts, and Hermes-style engines trace custom root lists and
//! offer native weak references. The `EngineAdapter` trait folds all of that
//! into one retain/release + weak-watch contract so the reference registry
//! and handle-scope stack never see backend specifics.
//!
//! Backends:
//! - [`protect::ProtectAdapter`] — protect-counter rooting, emulated weak
//! - [`refcount::RefCountAdapter`] — refcount dup/free, emulated weak
//! - [`rooted::RootListAdapter`] — custom GC-root list, native weak
//!
//! Native and emulated weak support are interchangeable behind this trait;
//! callers must not be able to tell which one they got.

pub mod heap;
pub mod protect;
pub mod refcount;
pub mod rooted;
pub mod watch;

use thiserror::Error;

use crate::value::Value;

/// Ticket for one retain; redeemed exactly once by `release`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetainToken(pub(crate) u64);

/// Ticket for one weak watch; redeemed by `unwatch_weak`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakToken(pub(crate) u64);

/// Adapter-level failures, mapped to ABI statuses by the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("engine heap is out of memory")]
    OutOfMemory,
    #[error("value is not an object")]
    NotAnObject,
    #[error("value refers to a dead or foreign cell")]
    StaleValue,
}

/// How a backend wants handle scopes rooted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRooting {
    /// No GC-walkable root list: every handle retains on creation and
    /// releases on scope close (JSC, QuickJS)
    PerHandle,
    /// The scope's handle list is itself a root the tracing pass visits;
    /// per-handle retain is unnecessary (Hermes custom roots)
    RootList,
}

/// Per-backend primitives hiding engine-specific GC mechanics.
///
/// All methods are synchronous and single-threaded by contract. Failures
/// surface through the specific call's result and are never swallowed; a
/// failed `retain`/`watch_weak` leaves no partially-added root behind.
pub trait EngineAdapter {
    /// Backend name for logs and diagnostics
    fn name(&self) -> &'static str;

    /// Make `value` immune to collection until the token is released.
    /// Primitives are accepted and cost nothing.
    fn retain(&mut self, value: Value) -> Result<RetainToken, AdapterError>;

    /// Inverse of `retain`. A stale token is ignored.
    fn release(&mut self, token: RetainToken);

    /// Track `value` without preventing its collection. Only heap objects
    /// can be watched; the registry filters primitives before calling.
    fn watch_weak(&mut self, value: Value) -> Result<WeakToken, AdapterError>;

    /// The watched value, or `None` once it has been collected
    fn resolve_weak(&mut self, token: WeakToken) -> Option<Value>;

    /// Stop tracking. A stale token is ignored.
    fn unwatch_weak(&mut self, token: WeakToken);

    /// Rooting discipline handle scopes must use with this backend
    fn scope_rooting(&self) -> ScopeRooting {
        ScopeRooting::PerHandle
    }

    /// Root a scope-owned handle (RootList backends only)
    fn add_scope_root(&mut self, _scope: u64, _value: Value) {}

    /// Drop every root owned by `scope` (RootList backends only)
    fn drop_scope_roots(&mut self, _scope: u64) {}

    // Collaborator primitives. Value creation itself is not lifetime
    // management, but the environment and the test scenarios need a way to
    // make heap values appear and to poke the collector.

    fn create_object(&mut self) -> Result<Value, AdapterError>;

    fn create_string(&mut self, s: &str) -> Result<Value, AdapterError>;

    /// Contents of a live string value
    fn string_value(&self, value: Value) -> Option<String>;

    fn set_property(&mut self, object: Value, key: &str, value: Value)
    -> Result<(), AdapterError>;

    fn get_property(&mut self, object: Value, key: &str) -> Result<Value, AdapterError>;

    /// Whether the heap cell behind `value` is still alive
    fn is_live(&self, value: Value) -> bool;

    /// Force a full collection cycle (a no-op for backends that reclaim
    /// eagerly)
    fn collect_garbage(&mut self);

    /// Live adapter-level roots (retain tokens plus scope roots), the leak
    /// metric the teardown contract is audited against
    fn outstanding_retains(&self) -> usize;
}

/// Generational slab of rooted values, the backbone of every backend's
/// retain table
pub(crate) struct RootSlab {
    slots: Vec<RootSlot>,
    free: Vec<u32>,
    live: usize,
}

struct RootSlot {
    generation: u32,
    value: Option<Value>,
}

impl RootSlab {
    pub(crate) fn new() -> Self {
        RootSlab {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: Value) -> u64 {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            pack_token(index, slot.generation)
        } else {
            self.slots.push(RootSlot {
                generation: 0,
                value: Some(value),
            });
            pack_token(self.slots.len() as u32 - 1, 0)
        }
    }

    pub(crate) fn remove(&mut self, token: u64) -> Option<Value> {
        let (index, generation) = unpack_token(token);
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().filter_map(|slot| slot.value)
    }
}

#[inline]
pub(crate) fn pack_token(index: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
pub(crate) fn unpack_token(token: u64) -> (u32, u32) {
    (token as u32, (token >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CellId;

    #[test]
    fn test_root_slab_insert_remove() {
        let mut slab = RootSlab::new();
        let a = slab.insert(Value::Int(1));
        let b = slab.insert(Value::Object(CellId::new(0, 0)));
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.iter().count(), 2);

        assert_eq!(slab.remove(a), Some(Value::Int(1)));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.len(), 1);

        // Reused slot gets a new generation; the old token stays dead
        let c = slab.insert(Value::Bool(true));
        assert_ne!(a, c);
        assert_eq!(slab.remove(b), Some(Value::Object(CellId::new(0, 0))));
        assert_eq!(slab.remove(c), Some(Value::Bool(true)));
        assert_eq!(slab.len(), 0);
    }
}
