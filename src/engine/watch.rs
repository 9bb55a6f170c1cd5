//! Weak-watch emulation for backends with no native weak references
//!
//! The technique JSC and QuickJS embedders use in the absence of engine
//! support: a synthetic external object is attached to the target under a
//! hidden property, so it is reachable only through the target. When the
//! target is collected the wrapper goes with it, and the wrapper's finalizer
//! collapses the watch group, flipping every member entry to "collected".
//!
//! The table is shared with the finalizer through `Rc<RefCell>` because the
//! finalizer fires from inside the backend's reclaim path. Group ids are
//! generational: a wrapper can outlive its group (detached but not yet
//! collected), and its late finalizer must not collapse a reused slot.

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::WeakToken;
use crate::engine::heap::Finalizer;
use crate::value::Value;

const NO_GROUP: u64 = u64::MAX;

struct WatchEntry {
    target: Value,
    group: u64,
    collected: bool,
}

struct EntrySlot {
    generation: u32,
    entry: Option<WatchEntry>,
}

struct GroupSlot {
    generation: u32,
    members: Option<Vec<u32>>,
}

struct Inner {
    entries: Vec<EntrySlot>,
    entry_free: Vec<u32>,
    // One group per watched target; members are entry indices
    groups: Vec<GroupSlot>,
    group_free: Vec<u32>,
}

impl Inner {
    fn retire_group(&mut self, group: u64) {
        let (index, _) = unpack(group);
        let slot = &mut self.groups[index as usize];
        slot.members = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.group_free.push(index);
    }
}

/// Outcome of removing a watcher, used to decide whether the hidden wrapper
/// property can be detached from the target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Removed {
    pub target: Value,
    pub collected: bool,
    /// Set when this was the last live watcher of a still-alive group
    pub group_emptied: bool,
}

/// Shared watch bookkeeping for emulated weak references
#[derive(Clone)]
pub struct WatchTable {
    inner: Rc<RefCell<Inner>>,
}

impl WatchTable {
    pub fn new() -> Self {
        WatchTable {
            inner: Rc::new(RefCell::new(Inner {
                entries: Vec::new(),
                entry_free: Vec::new(),
                groups: Vec::new(),
                group_free: Vec::new(),
            })),
        }
    }

    /// Open a group for a freshly wrapped target; returns a generational id
    pub fn new_group(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let index = if let Some(index) = inner.group_free.pop() {
            inner.groups[index as usize].members = Some(Vec::new());
            index
        } else {
            inner.groups.push(GroupSlot {
                generation: 0,
                members: Some(Vec::new()),
            });
            inner.groups.len() as u32 - 1
        };
        pack(index, inner.groups[index as usize].generation)
    }

    /// Register one watcher of `target` under `group`
    pub fn add(&self, group: u64, target: Value) -> WeakToken {
        let mut inner = self.inner.borrow_mut();
        let entry = WatchEntry {
            target,
            group,
            collected: false,
        };
        let index = if let Some(index) = inner.entry_free.pop() {
            inner.entries[index as usize].entry = Some(entry);
            index
        } else {
            inner.entries.push(EntrySlot {
                generation: 0,
                entry: Some(entry),
            });
            inner.entries.len() as u32 - 1
        };
        let (group_index, group_generation) = unpack(group);
        if let Some(slot) = inner.groups.get_mut(group_index as usize) {
            if slot.generation == group_generation {
                if let Some(members) = &mut slot.members {
                    members.push(index);
                }
            }
        }
        let generation = inner.entries[index as usize].generation;
        WeakToken(pack(index, generation))
    }

    /// The watched value, unless it has been collected
    pub fn resolve(&self, token: WeakToken) -> Option<Value> {
        let inner = self.inner.borrow();
        let (index, generation) = unpack(token.0);
        let slot = inner.entries.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let entry = slot.entry.as_ref()?;
        (!entry.collected).then_some(entry.target)
    }

    /// Drop one watcher; reports whether its group is now empty so the
    /// caller can detach the wrapper from the target
    pub fn remove(&self, token: WeakToken) -> Option<Removed> {
        let mut inner = self.inner.borrow_mut();
        let (index, generation) = unpack(token.0);
        let slot = inner.entries.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.entry_free.push(index);

        let mut group_emptied = false;
        if entry.group != NO_GROUP {
            let (group_index, group_generation) = unpack(entry.group);
            let now_empty = match inner.groups.get_mut(group_index as usize) {
                Some(slot) if slot.generation == group_generation => match &mut slot.members {
                    Some(members) => {
                        members.retain(|&member| member != index);
                        members.is_empty()
                    }
                    None => false,
                },
                _ => false,
            };
            if now_empty {
                inner.retire_group(entry.group);
                group_emptied = true;
            }
        }
        Some(Removed {
            target: entry.target,
            collected: entry.collected,
            group_emptied,
        })
    }

    /// Roll back a group that never got its wrapper attached
    pub fn discard_group(&self, group: u64) {
        let mut inner = self.inner.borrow_mut();
        let (index, generation) = unpack(group);
        let empty = matches!(
            inner.groups.get(index as usize),
            Some(slot) if slot.generation == generation
                && slot.members.as_ref().is_some_and(Vec::is_empty)
        );
        if empty {
            inner.retire_group(group);
        }
    }

    /// Finalizer for the wrapper object guarding `group`: marks every member
    /// entry collected and retires the group
    pub fn collapse_finalizer(&self, group: u64) -> Finalizer {
        let table = self.inner.clone();
        Box::new(move || {
            let mut inner = table.borrow_mut();
            let (index, generation) = unpack(group);
            let members = match inner.groups.get_mut(index as usize) {
                Some(slot) if slot.generation == generation => match slot.members.take() {
                    Some(members) => members,
                    None => return,
                },
                _ => return,
            };
            for member in members {
                if let Some(entry) = inner.entries[member as usize].entry.as_mut() {
                    entry.collected = true;
                    entry.group = NO_GROUP;
                }
            }
            inner.retire_group(group);
        })
    }
}

impl Default for WatchTable {
    fn default() -> Self {
        WatchTable::new()
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
    use crate::value::CellId;

    fn obj(index: u32) -> Value {
        Value::Object(CellId::new(index, 0))
    }

    #[test]
    fn test_resolve_until_collapsed() {
        let table = WatchTable::new();
        let group = table.new_group();
        let token = table.add(group, obj(1));
        assert_eq!(table.resolve(token), Some(obj(1)));

        let mut finalizer = table.collapse_finalizer(group);
        finalizer();
        assert_eq!(table.resolve(token), None);

        let removed = table.remove(token).unwrap();
        assert!(removed.collected);
        assert!(!removed.group_emptied);
    }

    #[test]
    fn test_two_watchers_share_group() {
        let table = WatchTable::new();
        let group = table.new_group();
        let first = table.add(group, obj(2));
        let second = table.add(group, obj(2));

        let removed = table.remove(first).unwrap();
        assert!(!removed.collected);
        assert!(!removed.group_emptied);
        assert_eq!(table.resolve(second), Some(obj(2)));

        let removed = table.remove(second).unwrap();
        assert!(removed.group_emptied);
    }

    #[test]
    fn test_stale_token_ignored() {
        let table = WatchTable::new();
        let group = table.new_group();
        let token = table.add(group, obj(3));
        assert!(table.remove(token).is_some());
        assert!(table.remove(token).is_none());
        assert_eq!(table.resolve(token), None);
    }

    #[test]
    fn test_late_finalizer_cannot_collapse_reused_group() {
        let table = WatchTable::new();
        let group = table.new_group();
        let token = table.add(group, obj(4));
        assert!(table.remove(token).unwrap().group_emptied);

        // Slot gets reused for a different target's group
        let reused = table.new_group();
        let survivor = table.add(reused, obj(5));

        let mut stale = table.collapse_finalizer(group);
        stale();
        assert_eq!(table.resolve(survivor), Some(obj(5)));
    }
}
