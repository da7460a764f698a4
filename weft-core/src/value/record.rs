//! Record: Keyed Composite Storage
//!
//! A [`Record`] is the tracked-field counterpart of a plain keyed object.
//! Transparent property interception is not portable to Rust, so the
//! reactive accessor layer lives on explicit `get`/`set` methods instead:
//!
//! 1. `get` registers the reading computation with the field's dependency
//!    node, and with the child composite's shape-dep so deep subscriptions
//!    work without the consumer declaring them.
//!
//! 2. `set` performs change detection (including the `NaN` special case),
//!    re-observes composite values, and notifies the field's subscribers.
//!
//! A field only carries a dependency node once the record has been walked
//! by [`observe`](crate::observe::observe); reads and writes of untracked
//! fields are plain map operations.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::observe::{self, dep, Dep, Observer};
use crate::value::{has_changed, Flags, Value};

/// One tracked (or not-yet-tracked) field.
pub(crate) struct FieldSlot {
    pub(crate) value: Value,
    /// Installed by `observe` / `set_property`; `None` means plain storage.
    pub(crate) dep: Option<Arc<Dep>>,
}

pub(crate) struct RecordInner {
    fields: RwLock<IndexMap<String, FieldSlot>>,
    observer: RwLock<Option<Arc<Observer>>>,
    flags: Flags,
}

/// A shared handle to keyed composite storage.
///
/// Cloning is cheap and aliases the same storage.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl Record {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RecordInner {
                fields: RwLock::new(IndexMap::new()),
                observer: RwLock::new(None),
                flags: Flags::default(),
            }),
        }
    }

    /// Identity comparison: do both handles alias the same storage?
    pub fn ptr_eq(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Reactive read.
    ///
    /// Registers the active computation with the field's dependency node,
    /// and with the child value's shape-dep when the child owns an
    /// observer (recursing into nested sequences, since element access
    /// cannot be trapped). A missing key yields `Null`. Cell values are
    /// auto-unwrapped unless the record is shallow-observed.
    pub fn get(&self, key: &str) -> Value {
        let (value, field_dep) = {
            let fields = self.inner.fields.read();
            match fields.get(key) {
                Some(slot) => (slot.value.clone(), slot.dep.clone()),
                None => return Value::Null,
            }
        };

        if let Some(field_dep) = field_dep {
            if dep::has_active_target() {
                field_dep.depend();
                if let Some(child_ob) = value.observer() {
                    child_ob.dep().depend();
                    if let Value::Sequence(seq) = &value {
                        observe::depend_array(seq);
                    }
                }
            }
        }

        if let Value::Cell(cell) = &value {
            if !self.is_shallow_observed() {
                return cell.get();
            }
        }
        value
    }

    /// Read without registering any dependency.
    pub fn get_untracked(&self, key: &str) -> Value {
        self.inner
            .fields
            .read()
            .get(key)
            .map(|slot| slot.value.clone())
            .unwrap_or(Value::Null)
    }

    /// Reactive write.
    ///
    /// No-ops when the value is unchanged by change-detection equality.
    /// When the stored value is a cell and the new value is plain, the
    /// write goes through the cell, preserving external references to it.
    /// Writing a key that was never made reactive stores plainly; writing
    /// an absent key inserts plainly (use
    /// [`set_property`](crate::observe::set_property) for an observable
    /// structural add).
    pub fn set(&self, key: &str, value: Value) {
        if self.is_readonly() {
            tracing::warn!(key, "set on readonly record ignored");
            return;
        }

        let shallow = self.is_shallow_observed();
        let (field_dep, write_through) = {
            let mut fields = self.inner.fields.write();
            match fields.get_mut(key) {
                Some(slot) => {
                    if !has_changed(&value, &slot.value) {
                        return;
                    }
                    if !shallow && !matches!(value, Value::Cell(_)) {
                        if let Value::Cell(cell) = &slot.value {
                            (None, Some(cell.clone()))
                        } else {
                            slot.value = value.clone();
                            (slot.dep.clone(), None)
                        }
                    } else {
                        slot.value = value.clone();
                        (slot.dep.clone(), None)
                    }
                }
                None => {
                    fields.insert(key.to_string(), FieldSlot { value, dep: None });
                    return;
                }
            }
        };

        if let Some(cell) = write_through {
            cell.set(value);
            return;
        }

        if let Some(field_dep) = field_dep {
            if !shallow {
                observe::observe(&value);
            }
            field_dep.notify();
        }
    }

    /// Key snapshot. Registers the shape-dep when a computation is active,
    /// so key-set changes re-trigger consumers that enumerated the record.
    pub fn keys(&self) -> Vec<String> {
        if let Some(ob) = self.observer() {
            ob.dep().depend();
        }
        self.keys_untracked()
    }

    pub fn keys_untracked(&self) -> Vec<String> {
        self.inner.fields.read().keys().cloned().collect()
    }

    /// Untracked snapshot of all entries, in insertion order.
    pub fn entries_untracked(&self) -> Vec<(String, Value)> {
        self.inner
            .fields
            .read()
            .iter()
            .map(|(k, slot)| (k.clone(), slot.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.fields.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.fields.read().is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.fields.read().contains_key(key)
    }

    /// Plain insert, bypassing reactivity. Used for initial population and
    /// by the structural mutation helpers.
    pub fn insert_plain(&self, key: impl Into<String>, value: Value) {
        self.inner
            .fields
            .write()
            .insert(key.into(), FieldSlot { value, dep: None });
    }

    /// Remove a field, preserving the order of the remaining keys.
    /// Returns whether the key existed.
    pub(crate) fn remove_field(&self, key: &str) -> bool {
        self.inner.fields.write().shift_remove(key).is_some()
    }

    /// Install a dependency node for an existing key, returning it along
    /// with the current value. Idempotent. `None` when the key is absent.
    pub(crate) fn install_dep(&self, key: &str) -> Option<(Arc<Dep>, Value)> {
        let mut fields = self.inner.fields.write();
        let slot = fields.get_mut(key)?;
        let field_dep = match &slot.dep {
            Some(existing) => existing.clone(),
            None => {
                let created = Dep::new();
                slot.dep = Some(created.clone());
                created
            }
        };
        Some((field_dep, slot.value.clone()))
    }

    pub(crate) fn field_dep(&self, key: &str) -> Option<Arc<Dep>> {
        self.inner.fields.read().get(key).and_then(|s| s.dep.clone())
    }

    pub fn observer(&self) -> Option<Arc<Observer>> {
        self.inner.observer.read().clone()
    }

    pub(crate) fn set_observer(&self, ob: Arc<Observer>) {
        *self.inner.observer.write() = Some(ob);
    }

    fn is_shallow_observed(&self) -> bool {
        self.observer().map(|ob| ob.is_shallow()).unwrap_or(false)
    }

    /// Opt this record out of observation.
    pub fn mark_raw(&self) {
        self.inner.flags.mark_skip();
    }

    pub fn is_raw(&self) -> bool {
        self.inner.flags.is_skip()
    }

    /// Refuse structural mutation helpers on this record.
    pub fn mark_readonly(&self) {
        self.inner.flags.mark_readonly();
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.flags.is_readonly()
    }

    /// Make the record non-extensible. Sealed records refuse observation
    /// and new keys.
    pub fn seal(&self) {
        self.inner.flags.seal();
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.flags.is_sealed()
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let record = Record::new();
        for (k, v) in iter {
            record.insert_plain(k, v);
        }
        record
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("len", &self.len())
            .field("observed", &self.observer().is_some())
            .finish()
    }
}
