//! Environment: the unit embedders create and destroy
//!
//! One environment owns one engine context (behind the adapter), one
//! reference registry, one handle-scope stack, and the pending-exception /
//! last-error state machine. Single-threaded by contract; callers serialize
//! externally or bind one environment per thread.
//!
//! Most operations that invoke engine semantics fail fast with
//! `PendingException` while an exception is stored, forcing callers through
//! `get_and_clear_last_exception`. Scope open/close, reference deletion and
//! the error family stay usable so recovery and teardown can make progress.

use log::warn;

use crate::engine::{AdapterError, EngineAdapter};
use crate::reference::{RefError, RefId, ReferenceRegistry};
use crate::scope::{HandleScopeStack, ScopeError, ScopeId, ScopeKind};
use crate::status::{ErrorState, ExtendedErrorInfo, PendingException, Status};
use crate::value::Value;
use crate::vm::Vm;

/// What teardown found and released, for leak auditing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvStats {
    /// Scopes the caller left open (caller error, handled)
    pub scopes_force_closed: usize,
    /// References the caller never deleted
    pub references_drained: usize,
    /// Adapter-level roots still alive after the full teardown walk;
    /// anything nonzero is a bug in this crate
    pub leaked_retains: usize,
}

pub struct Env {
    vm: Vm,
    adapter: Box<dyn EngineAdapter>,
    references: ReferenceRegistry,
    scopes: HandleScopeStack,
    error: ErrorState,
    torn_down: bool,
}

impl Vm {
    /// Create an environment bound to this VM instance
    pub fn create_env(&self) -> Env {
        self.register_env();
        Env {
            vm: self.clone(),
            adapter: self.make_adapter(),
            references: ReferenceRegistry::new(),
            scopes: HandleScopeStack::new(),
            error: ErrorState::new(),
            torn_down: false,
        }
    }
}

fn adapter_status(err: AdapterError) -> Status {
    match err {
        AdapterError::OutOfMemory => Status::MemoryError,
        AdapterError::NotAnObject => Status::ObjectExpected,
        AdapterError::StaleValue => Status::InvalidArg,
    }
}

impl Env {
    /// Fail fast while an exception is pending; otherwise reset last-error
    fn preamble(&mut self) -> Result<(), Status> {
        if self.error.is_exception_pending() {
            return Err(self.error.set(Status::PendingException));
        }
        self.error.clear_last();
        Ok(())
    }

    fn fail(&mut self, code: Status) -> Status {
        self.error.set(code)
    }

    fn fail_ref(&mut self, err: RefError) -> Status {
        let code = match err {
            RefError::Stale => Status::InvalidArg,
            RefError::ZeroCount => Status::GenericFailure,
            RefError::Adapter(err) => adapter_status(err),
        };
        self.error.set(code)
    }

    fn fail_scope(&mut self, err: ScopeError) -> Status {
        let code = match err {
            ScopeError::Mismatch => Status::HandleScopeMismatch,
            ScopeError::EscapeCalledTwice => Status::EscapeCalledTwice,
            ScopeError::Adapter(err) => adapter_status(err),
        };
        self.error.set(code)
    }

    // Reference family

    /// `initial_count` of zero creates a weak reference
    pub fn create_reference(
        &mut self,
        value: Value,
        initial_count: u32,
    ) -> Result<RefId, Status> {
        self.preamble()?;
        match self.references.create(&mut *self.adapter, value, initial_count) {
            Ok(id) => Ok(id),
            Err(err) => Err(self.fail_ref(err)),
        }
    }

    /// Usable while an exception is pending so cleanup can proceed
    pub fn delete_reference(&mut self, id: RefId) -> Result<(), Status> {
        self.error.clear_last();
        match self.references.destroy(&mut *self.adapter, id) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_ref(err)),
        }
    }

    /// Returns the new count
    pub fn reference_ref(&mut self, id: RefId) -> Result<u32, Status> {
        self.preamble()?;
        match self.references.ref_(&mut *self.adapter, id) {
            Ok(count) => Ok(count),
            Err(err) => Err(self.fail_ref(err)),
        }
    }

    /// Returns the new count; fails on a count already at zero
    pub fn reference_unref(&mut self, id: RefId) -> Result<u32, Status> {
        self.preamble()?;
        match self.references.unref(&mut *self.adapter, id) {
            Ok(count) => Ok(count),
            Err(err) => Err(self.fail_ref(err)),
        }
    }

    /// The referenced value, or undefined once a weak target is gone.
    /// A collected target and a target that is legitimately the undefined
    /// value are indistinguishable here.
    pub fn reference_value(&mut self, id: RefId) -> Result<Value, Status> {
        self.preamble()?;
        match self.references.get_value(&mut *self.adapter, id) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.fail_ref(err)),
        }
    }

    // Scope family

    pub fn open_handle_scope(&mut self) -> Result<ScopeId, Status> {
        self.error.clear_last();
        Ok(self.scopes.open(ScopeKind::Normal))
    }

    pub fn close_handle_scope(&mut self, scope: ScopeId) -> Result<(), Status> {
        self.error.clear_last();
        match self.scopes.close(&mut *self.adapter, scope, ScopeKind::Normal) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_scope(err)),
        }
    }

    pub fn open_escapable_handle_scope(&mut self) -> Result<ScopeId, Status> {
        self.error.clear_last();
        Ok(self.scopes.open(ScopeKind::Escapable))
    }

    pub fn close_escapable_handle_scope(&mut self, scope: ScopeId) -> Result<(), Status> {
        self.error.clear_last();
        match self
            .scopes
            .close(&mut *self.adapter, scope, ScopeKind::Escapable)
        {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_scope(err)),
        }
    }

    /// Promote one value into the parent scope so it survives this scope's
    /// close; allowed once per escapable scope
    pub fn escape_handle(&mut self, scope: ScopeId, value: Value) -> Result<Value, Status> {
        self.preamble()?;
        match self.scopes.escape(&mut *self.adapter, scope, value) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.fail_scope(err)),
        }
    }

    /// Open scopes right now, mostly for diagnostics
    pub fn open_scope_count(&self) -> usize {
        self.scopes.open_count()
    }

    // Error family

    pub fn is_exception_pending(&self) -> bool {
        self.error.is_exception_pending()
    }

    /// ExceptionPending → Idle. Returns undefined when nothing is pending.
    pub fn get_and_clear_last_exception(&mut self) -> Value {
        self.error.clear_last();
        let Some(pending) = self.error.take_pending() else {
            return Value::Undefined;
        };
        // Re-home the value into the current scope before dropping its
        // root, so it stays alive for the caller
        let _ = self.scopes.new_handle(&mut *self.adapter, pending.value);
        if let Some(root) = pending.root {
            self.adapter.release(root);
        }
        pending.value
    }

    /// Idle → ExceptionPending
    pub fn throw(&mut self, error: Value) -> Result<(), Status> {
        self.preamble()?;
        let root = match self.adapter.retain(error) {
            Ok(token) => Some(token),
            Err(err) => return Err(self.fail(adapter_status(err))),
        };
        self.error.set_pending(PendingException { value: error, root });
        Ok(())
    }

    pub fn last_error_info(&self) -> ExtendedErrorInfo {
        self.error.last_error_info()
    }

    // Collaborator primitives: value creation participates in scope
    // lifetime even though coercion and the wider value API live elsewhere

    pub fn create_object(&mut self) -> Result<Value, Status> {
        self.preamble()?;
        if self.scopes.open_count() == 0 {
            return Err(self.fail(Status::HandleScopeMismatch));
        }
        let value = match self.adapter.create_object() {
            Ok(value) => value,
            Err(err) => return Err(self.fail(adapter_status(err))),
        };
        match self.scopes.new_handle(&mut *self.adapter, value) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.fail_scope(err)),
        }
    }

    pub fn create_string(&mut self, s: &str) -> Result<Value, Status> {
        self.preamble()?;
        if self.scopes.open_count() == 0 {
            return Err(self.fail(Status::HandleScopeMismatch));
        }
        let value = match self.adapter.create_string(s) {
            Ok(value) => value,
            Err(err) => return Err(self.fail(adapter_status(err))),
        };
        match self.scopes.new_handle(&mut *self.adapter, value) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.fail_scope(err)),
        }
    }

    pub fn set_named_property(
        &mut self,
        object: Value,
        key: &str,
        value: Value,
    ) -> Result<(), Status> {
        self.preamble()?;
        if !object.is_object() {
            return Err(self.fail(Status::ObjectExpected));
        }
        match self.adapter.set_property(object, key, value) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(adapter_status(err))),
        }
    }

    /// Reads a property; the result is attached to the current scope
    pub fn get_named_property(&mut self, object: Value, key: &str) -> Result<Value, Status> {
        self.preamble()?;
        if !object.is_object() {
            return Err(self.fail(Status::ObjectExpected));
        }
        let value = match self.adapter.get_property(object, key) {
            Ok(value) => value,
            Err(err) => return Err(self.fail(adapter_status(err))),
        };
        match self.scopes.new_handle(&mut *self.adapter, value) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.fail_scope(err)),
        }
    }

    /// Contents of a live string value
    pub fn string_value(&self, value: Value) -> Option<String> {
        self.adapter.string_value(value)
    }

    /// Force a collection cycle on the backing engine
    pub fn run_gc(&mut self) {
        self.error.clear_last();
        self.adapter.collect_garbage();
    }

    /// Live adapter-level roots; the leak metric tests audit
    pub fn outstanding_retains(&self) -> usize {
        self.adapter.outstanding_retains()
    }

    pub fn backend_name(&self) -> &'static str {
        self.adapter.name()
    }

    /// Tear the environment down, releasing every outstanding scope and
    /// reference before the engine context goes away
    pub fn free(mut self) -> EnvStats {
        self.teardown()
    }

    fn teardown(&mut self) -> EnvStats {
        if self.torn_down {
            return EnvStats::default();
        }
        self.torn_down = true;

        if let Some(pending) = self.error.take_pending() {
            if let Some(root) = pending.root {
                self.adapter.release(root);
            }
        }

        let scopes_force_closed = self.scopes.close_all(&mut *self.adapter);
        if scopes_force_closed > 0 {
            warn!(
                "environment freed with {} scope(s) still open",
                scopes_force_closed
            );
        }

        let references_drained = self.references.len();
        self.references.drain(&mut *self.adapter);

        let leaked_retains = self.adapter.outstanding_retains();
        debug_assert_eq!(leaked_retains, 0);

        self.vm.unregister_env();
        EnvStats {
            scopes_force_closed,
            references_drained,
            leaked_retains,
        }
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        self.teardown();
    }
}
