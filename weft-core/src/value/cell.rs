//! Cell: Single-Value Reference Wrapper
//!
//! A [`Cell`] observes one value independently of any container. It is
//! the reference-cell wrapper the accessor layer unwraps on field reads,
//! and the type the template layer uses for standalone reactive bindings.
//!
//! Cells are themselves reactivity machinery: `observe` refuses to wrap
//! them, and writing a plain value over a field that holds a cell writes
//! through the cell rather than replacing it.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::observe::{self, Dep};
use crate::value::{has_changed, Value};

struct CellInner {
    value: RwLock<Value>,
    dep: Arc<Dep>,
}

/// A shared handle to one observable value.
#[derive(Clone)]
pub struct Cell {
    inner: Arc<CellInner>,
}

impl Cell {
    /// Wrap a value. Composite contents become observable immediately.
    pub fn new(value: Value) -> Self {
        observe::observe(&value);
        Self {
            inner: Arc::new(CellInner {
                value: RwLock::new(value),
                dep: Dep::new(),
            }),
        }
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &Cell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Tracked read: registers the active computation with this cell.
    pub fn get(&self) -> Value {
        self.inner.dep.depend();
        self.inner.value.read().clone()
    }

    pub fn get_untracked(&self) -> Value {
        self.inner.value.read().clone()
    }

    /// Write with change detection; notifies subscribers on change.
    pub fn set(&self, value: Value) {
        {
            let mut slot = self.inner.value.write();
            if !has_changed(&value, &slot) {
                return;
            }
            *slot = value.clone();
        }
        observe::observe(&value);
        self.inner.dep.notify();
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("value", &*self.inner.value.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_set() {
        let cell = Cell::new(Value::Int(1));
        assert_eq!(cell.get(), Value::Int(1));
        cell.set(Value::Int(2));
        assert_eq!(cell.get_untracked(), Value::Int(2));
    }

    #[test]
    fn unchanged_set_keeps_value_identity() {
        let rec = crate::value::Record::new();
        let cell = Cell::new(Value::Record(rec.clone()));
        cell.set(Value::Record(rec.clone()));
        // Identity-equal write is a no-op.
        assert_eq!(cell.get_untracked(), Value::Record(rec));
    }

    #[test]
    fn clone_aliases_storage() {
        let a = Cell::new(Value::Int(0));
        let b = a.clone();
        a.set(Value::Int(5));
        assert_eq!(b.get_untracked(), Value::Int(5));
        assert!(a.ptr_eq(&b));
    }
}
