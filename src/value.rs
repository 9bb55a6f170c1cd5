//! Engine-agnostic JavaScript value handles
//!
//! A `Value` is the opaque unit the embedding ABI passes around. Primitives
//! are carried inline; heap-backed values (objects, strings) carry a
//! generational `CellId` into the owning backend's cell arena. A stale
//! `CellId` can be detected and rejected, never dereferenced.

use std::fmt;

/// Index + generation pair identifying one heap cell.
///
/// The generation is bumped every time an arena slot is reused, so a handle
/// that outlives its cell stops matching instead of aliasing the new tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId {
    pub index: u32,
    pub generation: u32,
}

impl CellId {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        CellId { index, generation }
    }
}

/// Opaque handle to an engine value
///
/// Ownership semantics vary per backend and are normalized by the engine
/// adapter; `Value` itself is plain `Copy` data with no lifetime of its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Double(f64),
    Str(CellId),
    Object(CellId),
}

impl Value {
    /// The well-defined sentinel used for collected weak targets
    #[inline]
    pub const fn undefined() -> Self {
        Value::Undefined
    }

    #[inline]
    pub const fn is_undefined(self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Whether this value lives in a backend heap and therefore needs
    /// rooting to survive collection
    #[inline]
    pub const fn is_heap(self) -> bool {
        matches!(self, Value::Str(_) | Value::Object(_))
    }

    #[inline]
    pub const fn is_object(self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// The backing cell for heap values
    #[inline]
    pub const fn cell(self) -> Option<CellId> {
        match self {
            Value::Str(id) | Value::Object(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Str(id) => write!(f, "string@{}:{}", id.index, id.generation),
            Value::Object(id) => write!(f, "object@{}:{}", id.index, id.generation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_predicate() {
        assert!(!Value::Undefined.is_heap());
        assert!(!Value::Int(3).is_heap());
        assert!(!Value::Bool(true).is_heap());
        assert!(Value::Object(CellId::new(0, 1)).is_heap());
        assert!(Value::Str(CellId::new(2, 7)).is_heap());
    }

    #[test]
    fn test_stale_cell_ids_differ() {
        let live = CellId::new(4, 2);
        let stale = CellId::new(4, 1);
        assert_ne!(live, stale);
        assert_ne!(Value::Object(live), Value::Object(stale));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Undefined.to_string(), "undefined");
        assert_eq!(Value::Int(-3).to_string(), "-3");
        assert_eq!(Value::Bool(false).to_string(), "false");
    }
}
