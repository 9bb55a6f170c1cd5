//! Shared VM instance
//!
//! Engines hang several execution contexts off one runtime. Instead of a
//! global singleton with a manual context count, the runtime is a
//! shared-ownership object: every environment holds a clone, and the
//! instance lives exactly as long as its longest-held environment (or the
//! embedder's own handle).

use std::cell::Cell;
use std::rc::Rc;

use log::debug;

use crate::engine::EngineAdapter;
use crate::engine::protect::ProtectAdapter;
use crate::engine::refcount::RefCountAdapter;
use crate::engine::rooted::RootListAdapter;

/// Engine memory model backing every environment of this VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Protect-counter rooting, emulated weak (the JSC model)
    Protect,
    /// Refcount dup/free, emulated weak (the QuickJS model)
    RefCount,
    /// Custom root list, native weak (the Hermes model)
    RootList,
}

/// Default per-environment live-cell limit
pub const DEFAULT_HEAP_CAPACITY: usize = 4096;

struct VmInner {
    backend: Backend,
    heap_capacity: usize,
    live_envs: Cell<u32>,
}

/// Shared-ownership VM instance; cloning shares the same instance
#[derive(Clone)]
pub struct Vm {
    inner: Rc<VmInner>,
}

impl Vm {
    pub fn new(backend: Backend) -> Self {
        Vm::with_capacity(backend, DEFAULT_HEAP_CAPACITY)
    }

    /// `heap_capacity` bounds live cells per environment context
    pub fn with_capacity(backend: Backend, heap_capacity: usize) -> Self {
        Vm {
            inner: Rc::new(VmInner {
                backend,
                heap_capacity,
                live_envs: Cell::new(0),
            }),
        }
    }

    pub fn backend(&self) -> Backend {
        self.inner.backend
    }

    /// Environments currently attached to this instance
    pub fn live_environments(&self) -> u32 {
        self.inner.live_envs.get()
    }

    pub(crate) fn make_adapter(&self) -> Box<dyn EngineAdapter> {
        match self.inner.backend {
            Backend::Protect => Box::new(ProtectAdapter::new(self.inner.heap_capacity)),
            Backend::RefCount => Box::new(RefCountAdapter::new(self.inner.heap_capacity)),
            Backend::RootList => Box::new(RootListAdapter::new(self.inner.heap_capacity)),
        }
    }

    pub(crate) fn register_env(&self) {
        let count = self.inner.live_envs.get() + 1;
        self.inner.live_envs.set(count);
        debug!("vm now holds {} environment(s)", count);
    }

    pub(crate) fn unregister_env(&self) {
        let count = self.inner.live_envs.get().saturating_sub(1);
        self.inner.live_envs.set(count);
        debug!("vm now holds {} environment(s)", count);
    }
}
