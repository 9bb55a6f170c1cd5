//! Handle scope stack: short-lived handles owned by LIFO scopes
//!
//! Scopes close in exact reverse order of opening; closing anything but the
//! top frame is a mismatch with no effect. How a handle is rooted depends on
//! the backend: per-handle retain/release for engines without a walkable
//! root list, or registration of the scope's handle list as a GC root for
//! engines with one. Escapable scopes additionally allow exactly one value
//! to be re-parented into the scope below before closing.

use thiserror::Error;

use crate::engine::{AdapterError, EngineAdapter, RetainToken, ScopeRooting};
use crate::value::Value;

/// Handle to one open scope. Ids are a monotone sequence, never reused, so
/// a closed scope's id can only ever mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Normal,
    Escapable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("scope is not the innermost open scope")]
    Mismatch,
    #[error("escape was already called on this scope")]
    EscapeCalledTwice,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

struct ScopeFrame {
    id: u64,
    kind: ScopeKind,
    escape_called: bool,
    // Per-handle retain tokens; empty under root-list rooting
    handles: Vec<RetainToken>,
}

/// LIFO stack of handle scopes for one environment
pub struct HandleScopeStack {
    frames: Vec<ScopeFrame>,
    next_id: u64,
}

impl HandleScopeStack {
    pub fn new() -> Self {
        HandleScopeStack {
            frames: Vec::new(),
            next_id: 1,
        }
    }

    pub fn open_count(&self) -> usize {
        self.frames.len()
    }

    /// Push an empty scope
    pub fn open(&mut self, kind: ScopeKind) -> ScopeId {
        let id = self.next_id;
        self.next_id += 1;
        self.frames.push(ScopeFrame {
            id,
            kind,
            escape_called: false,
            handles: Vec::new(),
        });
        ScopeId(id)
    }

    /// Attach `value` to the innermost open scope
    pub fn new_handle(
        &mut self,
        adapter: &mut dyn EngineAdapter,
        value: Value,
    ) -> Result<Value, ScopeError> {
        let Some(top) = self.frames.last_mut() else {
            return Err(ScopeError::Mismatch);
        };
        match adapter.scope_rooting() {
            ScopeRooting::PerHandle => {
                let token = adapter.retain(value)?;
                top.handles.push(token);
            }
            ScopeRooting::RootList => {
                adapter.add_scope_root(top.id, value);
            }
        }
        Ok(value)
    }

    /// Close the innermost scope; `scope` must name it and the kinds must
    /// match, otherwise the call aborts with no effect
    pub fn close(
        &mut self,
        adapter: &mut dyn EngineAdapter,
        scope: ScopeId,
        kind: ScopeKind,
    ) -> Result<(), ScopeError> {
        match self.frames.last() {
            Some(top) if top.id == scope.0 && top.kind == kind => {}
            _ => return Err(ScopeError::Mismatch),
        }
        if let Some(frame) = self.frames.pop() {
            Self::release_frame(adapter, frame);
        }
        Ok(())
    }

    /// One-shot promotion of `value` into the scope below `scope`
    pub fn escape(
        &mut self,
        adapter: &mut dyn EngineAdapter,
        scope: ScopeId,
        value: Value,
    ) -> Result<Value, ScopeError> {
        let position = self
            .frames
            .iter()
            .rposition(|frame| frame.id == scope.0)
            .ok_or(ScopeError::Mismatch)?;
        if self.frames[position].kind != ScopeKind::Escapable {
            return Err(ScopeError::Mismatch);
        }
        if self.frames[position].escape_called {
            return Err(ScopeError::EscapeCalledTwice);
        }
        if position == 0 {
            // Bottommost scope: nowhere to escape to
            return Err(ScopeError::Mismatch);
        }
        let parent_id = self.frames[position - 1].id;
        match adapter.scope_rooting() {
            ScopeRooting::PerHandle => {
                let token = adapter.retain(value)?;
                self.frames[position - 1].handles.push(token);
            }
            ScopeRooting::RootList => {
                adapter.add_scope_root(parent_id, value);
            }
        }
        self.frames[position].escape_called = true;
        Ok(value)
    }

    /// Teardown sweep over any still-open scopes
    pub fn close_all(&mut self, adapter: &mut dyn EngineAdapter) -> usize {
        let mut closed = 0;
        while let Some(frame) = self.frames.pop() {
            Self::release_frame(adapter, frame);
            closed += 1;
        }
        closed
    }

    fn release_frame(adapter: &mut dyn EngineAdapter, frame: ScopeFrame) {
        match adapter.scope_rooting() {
            ScopeRooting::PerHandle => {
                for token in frame.handles {
                    adapter.release(token);
                }
            }
            ScopeRooting::RootList => {
                adapter.drop_scope_roots(frame.id);
            }
        }
    }
}

impl Default for HandleScopeStack {
    fn default() -> Self {
        HandleScopeStack::new()
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
    fn test_handles_die_with_their_scope() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut stack = HandleScopeStack::new();
            let baseline = adapter.outstanding_retains();

            let scope = stack.open(ScopeKind::Normal);
            let int = stack.new_handle(adapter, Value::Int(1)).unwrap();
            let s = adapter.create_string("a").unwrap();
            stack.new_handle(adapter, s).unwrap();
            let b = stack.new_handle(adapter, Value::Bool(true)).unwrap();
            assert_eq!(int, Value::Int(1));
            assert_eq!(b, Value::Bool(true));

            adapter.collect_garbage();
            assert!(adapter.is_live(s), "backend {}", adapter.name());

            stack.close(adapter, scope, ScopeKind::Normal).unwrap();
            assert_eq!(adapter.outstanding_retains(), baseline);
            adapter.collect_garbage();
            assert!(!adapter.is_live(s));
        }
    }

    #[test]
    fn test_closing_outer_scope_first_is_mismatch() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut stack = HandleScopeStack::new();
            let a = stack.open(ScopeKind::Normal);
            let b = stack.open(ScopeKind::Normal);

            assert_eq!(
                stack.close(adapter, a, ScopeKind::Normal),
                Err(ScopeError::Mismatch)
            );
            // B stays open and usable
            assert_eq!(stack.open_count(), 2);
            stack.new_handle(adapter, Value::Int(5)).unwrap();

            stack.close(adapter, b, ScopeKind::Normal).unwrap();
            stack.close(adapter, a, ScopeKind::Normal).unwrap();
        }
    }

    #[test]
    fn test_handle_without_scope_is_mismatch() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut stack = HandleScopeStack::new();
            assert_eq!(
                stack.new_handle(adapter, Value::Int(1)),
                Err(ScopeError::Mismatch)
            );
        }
    }

    #[test]
    fn test_escape_once_then_twice() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut stack = HandleScopeStack::new();
            let outer = stack.open(ScopeKind::Normal);
            let inner = stack.open(ScopeKind::Escapable);

            let obj = adapter.create_object().unwrap();
            stack.new_handle(adapter, obj).unwrap();

            let escaped = stack.escape(adapter, inner, obj).unwrap();
            assert_eq!(escaped, obj);
            assert_eq!(
                stack.escape(adapter, inner, obj),
                Err(ScopeError::EscapeCalledTwice)
            );

            stack.close(adapter, inner, ScopeKind::Escapable).unwrap();
            adapter.collect_garbage();
            assert!(adapter.is_live(obj), "backend {}", adapter.name());

            stack.close(adapter, outer, ScopeKind::Normal).unwrap();
            adapter.collect_garbage();
            assert!(!adapter.is_live(obj));
        }
    }

    #[test]
    fn test_escape_from_bottom_scope_is_mismatch() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut stack = HandleScopeStack::new();
            let only = stack.open(ScopeKind::Escapable);
            let obj = adapter.create_object().unwrap();
            assert_eq!(stack.escape(adapter, only, obj), Err(ScopeError::Mismatch));
            // The failed escape consumed nothing
            assert_eq!(stack.escape(adapter, only, obj), Err(ScopeError::Mismatch));
            stack.close(adapter, only, ScopeKind::Escapable).unwrap();
        }
    }

    #[test]
    fn test_kind_mismatch_on_close() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut stack = HandleScopeStack::new();
            let scope = stack.open(ScopeKind::Escapable);
            assert_eq!(
                stack.close(adapter, scope, ScopeKind::Normal),
                Err(ScopeError::Mismatch)
            );
            stack.close(adapter, scope, ScopeKind::Escapable).unwrap();
        }
    }

    #[test]
    fn test_escape_on_normal_scope_is_mismatch() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut stack = HandleScopeStack::new();
            let outer = stack.open(ScopeKind::Normal);
            let inner = stack.open(ScopeKind::Normal);
            assert_eq!(
                stack.escape(adapter, inner, Value::Int(1)),
                Err(ScopeError::Mismatch)
            );
            stack.close(adapter, inner, ScopeKind::Normal).unwrap();
            stack.close(adapter, outer, ScopeKind::Normal).unwrap();
        }
    }

    #[test]
    fn test_close_all_releases_every_frame() {
        for mut adapter in backends() {
            let adapter = adapter.as_mut();
            let mut stack = HandleScopeStack::new();
            stack.open(ScopeKind::Normal);
            let obj = adapter.create_object().unwrap();
            stack.new_handle(adapter, obj).unwrap();
            stack.open(ScopeKind::Escapable);
            stack.new_handle(adapter, Value::Int(2)).unwrap();

            assert_eq!(stack.close_all(adapter), 2);
            assert_eq!(stack.open_count(), 0);
            assert_eq!(adapter.outstanding_retains(), 0);
        }
    }
}
