//! Sequence: Ordered Composite Storage
//!
//! Raw indexed mutation of an observed array cannot be trapped, so a
//! [`Sequence`] exposes only intercepted operations: every structural
//! change routes through the shape-dep notify path by construction.
//!
//! Each mutator performs the real mutation, observes any newly inserted
//! elements (so they become independently trackable), and notifies the
//! container's shape-dep exactly once per call. Reads register the
//! shape-dep when a computation is active, which is what lets watchers
//! that enumerate a sequence re-run on length changes.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::observe::{self, Observer};
use crate::value::{Flags, Value};

pub(crate) struct SequenceInner {
    elems: RwLock<Vec<Value>>,
    observer: RwLock<Option<Arc<Observer>>>,
    flags: Flags,
}

/// A shared handle to ordered composite storage.
///
/// Cloning is cheap and aliases the same storage.
#[derive(Clone)]
pub struct Sequence {
    inner: Arc<SequenceInner>,
}

impl Sequence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SequenceInner {
                elems: RwLock::new(Vec::new()),
                observer: RwLock::new(None),
                flags: Flags::default(),
            }),
        }
    }

    /// Identity comparison: do both handles alias the same storage?
    pub fn ptr_eq(&self, other: &Sequence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Tracked element read. Registers the shape-dep; per-element deps do
    /// not exist (index access is compensated for at the accessor layer).
    pub fn get(&self, index: usize) -> Option<Value> {
        self.track_shape();
        self.inner.elems.read().get(index).cloned()
    }

    pub fn get_untracked(&self, index: usize) -> Option<Value> {
        self.inner.elems.read().get(index).cloned()
    }

    /// Tracked length read.
    pub fn len(&self) -> usize {
        self.track_shape();
        self.inner.elems.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_untracked(&self) -> usize {
        self.inner.elems.read().len()
    }

    /// Tracked snapshot of all elements.
    pub fn to_vec(&self) -> Vec<Value> {
        self.track_shape();
        self.snapshot_untracked()
    }

    pub fn snapshot_untracked(&self) -> Vec<Value> {
        self.inner.elems.read().clone()
    }

    fn track_shape(&self) {
        if let Some(ob) = self.observer() {
            ob.dep().depend();
        }
    }

    // ------------------------------------------------------------------
    // Intercepted mutators
    // ------------------------------------------------------------------

    /// Append to the back.
    pub fn push(&self, value: Value) {
        if self.refuse_mutation("push") {
            return;
        }
        self.inner.elems.write().push(value.clone());
        self.after_mutation(&[value]);
    }

    /// Remove from the back.
    pub fn pop(&self) -> Option<Value> {
        if self.refuse_mutation("pop") {
            return None;
        }
        let removed = self.inner.elems.write().pop();
        if removed.is_some() {
            self.after_mutation(&[]);
        }
        removed
    }

    /// Remove from the front.
    pub fn shift(&self) -> Option<Value> {
        if self.refuse_mutation("shift") {
            return None;
        }
        let removed = {
            let mut elems = self.inner.elems.write();
            if elems.is_empty() {
                None
            } else {
                Some(elems.remove(0))
            }
        };
        if removed.is_some() {
            self.after_mutation(&[]);
        }
        removed
    }

    /// Insert at the front.
    pub fn unshift(&self, value: Value) {
        if self.refuse_mutation("unshift") {
            return;
        }
        self.inner.elems.write().insert(0, value.clone());
        self.after_mutation(&[value]);
    }

    /// Insert at an arbitrary position (clamped to the current length).
    pub fn insert(&self, index: usize, value: Value) {
        if self.refuse_mutation("insert") {
            return;
        }
        {
            let mut elems = self.inner.elems.write();
            let index = index.min(elems.len());
            elems.insert(index, value.clone());
        }
        self.after_mutation(&[value]);
    }

    /// Remove `delete_count` elements starting at `start`, inserting
    /// `items` in their place. Returns the removed elements.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<Value>) -> Vec<Value> {
        if self.refuse_mutation("splice") {
            return Vec::new();
        }
        let removed = {
            let mut elems = self.inner.elems.write();
            let start = start.min(elems.len());
            let end = (start + delete_count).min(elems.len());
            elems.splice(start..end, items.iter().cloned()).collect()
        };
        self.after_mutation(&items);
        removed
    }

    /// In-place set through the intercepted path, extending the sequence
    /// with `Null` when `index` is past the end (length-extend + replace).
    pub fn set(&self, index: usize, value: Value) {
        if self.refuse_mutation("set") {
            return;
        }
        {
            let mut elems = self.inner.elems.write();
            if index >= elems.len() {
                elems.resize(index + 1, Value::Null);
            }
            elems[index] = value.clone();
        }
        self.after_mutation(&[value]);
    }

    /// In-place sort with a caller-supplied comparator.
    ///
    /// The comparator runs against a snapshot, so it may freely read the
    /// sequence's elements.
    pub fn sort_by<F>(&self, mut compare: F)
    where
        F: FnMut(&Value, &Value) -> CmpOrdering,
    {
        if self.refuse_mutation("sort_by") {
            return;
        }
        let mut snapshot = self.snapshot_untracked();
        snapshot.sort_by(&mut compare);
        *self.inner.elems.write() = snapshot;
        self.after_mutation(&[]);
    }

    /// In-place reversal.
    pub fn reverse(&self) {
        if self.refuse_mutation("reverse") {
            return;
        }
        self.inner.elems.write().reverse();
        self.after_mutation(&[]);
    }

    /// Wrap any freshly inserted elements and fire the shape-dep. Runs
    /// after the storage lock is released.
    fn after_mutation(&self, inserted: &[Value]) {
        if let Some(ob) = self.observer() {
            if !ob.is_shallow() {
                for value in inserted {
                    observe::observe(value);
                }
            }
            ob.dep().notify();
        }
    }

    fn refuse_mutation(&self, op: &str) -> bool {
        if self.is_readonly() {
            tracing::warn!(op, "mutation of readonly sequence ignored");
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // Observation plumbing and flags
    // ------------------------------------------------------------------

    pub fn observer(&self) -> Option<Arc<Observer>> {
        self.inner.observer.read().clone()
    }

    pub(crate) fn set_observer(&self, ob: Arc<Observer>) {
        *self.inner.observer.write() = Some(ob);
    }

    /// Opt this sequence out of observation.
    pub fn mark_raw(&self) {
        self.inner.flags.mark_skip();
    }

    pub fn is_raw(&self) -> bool {
        self.inner.flags.is_skip()
    }

    pub fn mark_readonly(&self) {
        self.inner.flags.mark_readonly();
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.flags.is_readonly()
    }

    /// Non-extensible: refuses observation.
    pub fn seal(&self) {
        self.inner.flags.seal();
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.flags.is_sealed()
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<Value> for Sequence {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let seq = Sequence::new();
        {
            let mut elems = seq.inner.elems.write();
            elems.extend(iter);
        }
        seq
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("len", &self.len_untracked())
            .field("observed", &self.observer().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_of(items: &[i64]) -> Sequence {
        items.iter().map(|i| Value::Int(*i)).collect()
    }

    #[test]
    fn push_pop_shift_unshift() {
        let seq = seq_of(&[2, 3]);
        seq.push(Value::Int(4));
        seq.unshift(Value::Int(1));
        assert_eq!(seq.snapshot_untracked().len(), 4);
        assert_eq!(seq.get_untracked(0), Some(Value::Int(1)));
        assert_eq!(seq.get_untracked(3), Some(Value::Int(4)));

        assert_eq!(seq.pop(), Some(Value::Int(4)));
        assert_eq!(seq.shift(), Some(Value::Int(1)));
        assert_eq!(seq.snapshot_untracked(), vec![Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn splice_replaces_and_returns_removed() {
        let seq = seq_of(&[1, 2, 3, 4]);
        let removed = seq.splice(1, 2, vec![Value::Int(9)]);
        assert_eq!(removed, vec![Value::Int(2), Value::Int(3)]);
        assert_eq!(
            seq.snapshot_untracked(),
            vec![Value::Int(1), Value::Int(9), Value::Int(4)]
        );
    }

    #[test]
    fn set_extends_with_null() {
        let seq = seq_of(&[1]);
        seq.set(3, Value::Int(7));
        assert_eq!(
            seq.snapshot_untracked(),
            vec![Value::Int(1), Value::Null, Value::Null, Value::Int(7)]
        );
    }

    #[test]
    fn sort_and_reverse() {
        let seq = seq_of(&[3, 1, 2]);
        seq.sort_by(|a, b| a.as_int().cmp(&b.as_int()));
        assert_eq!(
            seq.snapshot_untracked(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
        seq.reverse();
        assert_eq!(
            seq.snapshot_untracked(),
            vec![Value::Int(3), Value::Int(2), Value::Int(1)]
        );
    }

    #[test]
    fn readonly_sequence_refuses_mutation() {
        let seq = seq_of(&[1]);
        seq.mark_readonly();
        seq.push(Value::Int(2));
        assert_eq!(seq.pop(), None);
        assert_eq!(seq.snapshot_untracked(), vec![Value::Int(1)]);
    }

    #[test]
    fn empty_pop_and_shift_are_noops() {
        let seq = Sequence::new();
        assert_eq!(seq.pop(), None);
        assert_eq!(seq.shift(), None);
    }
}
