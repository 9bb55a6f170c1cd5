//! ABI status codes and per-environment error state
//!
//! Every operation reports through this one status set, regardless of which
//! backend raised the problem. `ExtendedErrorInfo` is what
//! `Env::last_error_info` hands back to the embedder.

use thiserror::Error;

use crate::engine::RetainToken;
use crate::value::Value;

/// Status codes of the embedding ABI
///
/// `Ok` exists so `ExtendedErrorInfo` can report "no error"; fallible
/// operations return `Result<T, Status>` and never construct `Err(Ok)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Status {
    #[error("No error")]
    Ok,
    #[error("Invalid argument")]
    InvalidArg,
    #[error("An object was expected")]
    ObjectExpected,
    #[error("An exception is pending")]
    PendingException,
    #[error("Handle scope mismatch")]
    HandleScopeMismatch,
    #[error("Escape called twice on the same scope")]
    EscapeCalledTwice,
    #[error("Unknown failure")]
    GenericFailure,
    #[error("Memory allocation failure")]
    MemoryError,
}

impl Status {
    /// The constant message table exposed through `last_error_info`
    pub fn message(self) -> &'static str {
        match self {
            Status::Ok => "No error",
            Status::InvalidArg => "Invalid argument",
            Status::ObjectExpected => "An object was expected",
            Status::PendingException => "An exception is pending",
            Status::HandleScopeMismatch => "Handle scope mismatch",
            Status::EscapeCalledTwice => "Escape called twice on the same scope",
            Status::GenericFailure => "Unknown failure",
            Status::MemoryError => "Memory allocation failure",
        }
    }
}

/// Last-error record returned to the embedder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedErrorInfo {
    pub code: Status,
    pub message: &'static str,
}

impl ExtendedErrorInfo {
    pub const fn ok() -> Self {
        ExtendedErrorInfo {
            code: Status::Ok,
            message: "No error",
        }
    }
}

/// A thrown value waiting for the embedder to retrieve it.
///
/// The value is rooted in the adapter while stored so a collection cycle
/// cannot reclaim it out from under the recovery protocol.
#[derive(Debug)]
pub struct PendingException {
    pub value: Value,
    pub root: Option<RetainToken>,
}

/// Idle / ExceptionPending state machine plus the last-error slot
///
/// Mutated by nearly every operation; single-threaded by contract.
#[derive(Debug, Default)]
pub struct ErrorState {
    last: Option<ExtendedErrorInfo>,
    pending: Option<PendingException>,
}

impl ErrorState {
    pub fn new() -> Self {
        ErrorState::default()
    }

    /// Record a failure and hand the status back, so call sites can write
    /// `return Err(self.error.set(status))`
    pub fn set(&mut self, code: Status) -> Status {
        self.last = Some(ExtendedErrorInfo {
            code,
            message: code.message(),
        });
        code
    }

    pub fn clear_last(&mut self) {
        self.last = Some(ExtendedErrorInfo::ok());
    }

    pub fn last_error_info(&self) -> ExtendedErrorInfo {
        self.last.unwrap_or(ExtendedErrorInfo::ok())
    }

    pub fn is_exception_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_pending(&mut self, pending: PendingException) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(pending);
    }

    /// ExceptionPending → Idle
    pub fn take_pending(&mut self) -> Option<PendingException> {
        self.pending.take()
    }
}
