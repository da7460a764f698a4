//! Observer
//!
//! An [`Observer`] is attached to composite storage to make its contents
//! individually trackable. For a record it installs a dependency node on
//! every existing field; for a sequence it recursively observes the
//! elements (the sequence's mutators are already intercepted by
//! construction). The observer also owns the composite's shape-dep — the
//! dep that fires on key-set and length changes — and a count of how many
//! root-level bindings use the value, which guards against structural
//! mutation of roots whose identity external consumers rely on.
//!
//! Observation is lazy and identity-keyed: the observer lives inside the
//! composite's shared inner, so re-observing an already-wrapped value
//! returns the existing observer, and the observer is reclaimed together
//! with the value.

use std::cell::Cell as StdCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::observe::Dep;
use crate::value::{Record, Sequence, Value};

/// Per-composite observation state.
pub struct Observer {
    /// The container's shape-dep: fires on key-set / length changes.
    dep: Arc<Dep>,
    /// How many root-level bindings use this composite.
    vm_count: AtomicU32,
    /// Shallow observers do not recurse into children.
    shallow: bool,
}

impl Observer {
    fn new(shallow: bool) -> Arc<Self> {
        Arc::new(Self {
            dep: Dep::new(),
            vm_count: AtomicU32::new(0),
            shallow,
        })
    }

    pub fn dep(&self) -> &Arc<Dep> {
        &self.dep
    }

    pub fn is_shallow(&self) -> bool {
        self.shallow
    }

    pub fn vm_count(&self) -> u32 {
        self.vm_count.load(Ordering::Relaxed)
    }

    fn bump_vm_count(&self) {
        self.vm_count.fetch_add(1, Ordering::Relaxed);
    }
}

thread_local! {
    static SHOULD_OBSERVE: StdCell<bool> = const { StdCell::new(true) };
}

/// Disable or re-enable observation on the current thread.
///
/// Used by configuration-resolution layers that need to install values
/// without making them reactive.
pub fn toggle_observing(enabled: bool) {
    SHOULD_OBSERVE.with(|flag| flag.set(enabled));
}

/// Attempt to observe a value.
///
/// Returns the existing observer if the value is already wrapped. Refuses
/// scalars, cells, values opted out via `mark_raw`, sealed
/// (non-extensible) composites, and everything while observation is
/// toggled off.
pub fn observe(value: &Value) -> Option<Arc<Observer>> {
    observe_inner(value, false)
}

/// Observe without recursing into children.
pub fn observe_shallow(value: &Value) -> Option<Arc<Observer>> {
    observe_inner(value, true)
}

/// Observe a root-level binding: observes the value and records the root
/// reference, which makes `set_property`/`delete_property` refuse
/// structural changes to it.
pub fn observe_root(value: &Value) -> Option<Arc<Observer>> {
    let ob = observe(value)?;
    ob.bump_vm_count();
    Some(ob)
}

fn observe_inner(value: &Value, shallow: bool) -> Option<Arc<Observer>> {
    match value {
        Value::Record(record) => {
            if let Some(existing) = record.observer() {
                return Some(existing);
            }
            if !should_observe() || record.is_raw() || record.is_sealed() {
                return None;
            }
            let ob = Observer::new(shallow);
            record.set_observer(ob.clone());
            walk(record, shallow);
            Some(ob)
        }
        Value::Sequence(seq) => {
            if let Some(existing) = seq.observer() {
                return Some(existing);
            }
            if !should_observe() || seq.is_raw() || seq.is_sealed() {
                return None;
            }
            let ob = Observer::new(shallow);
            seq.set_observer(ob.clone());
            if !shallow {
                observe_array(seq);
            }
            Some(ob)
        }
        // Scalars and cells refuse: a cell is reactivity machinery itself.
        _ => None,
    }
}

/// Install a dependency node on every existing key, then observe the
/// children unless shallow.
fn walk(record: &Record, shallow: bool) {
    for key in record.keys_untracked() {
        if let Some((_dep, child)) = record.install_dep(&key) {
            if !shallow {
                observe_inner(&child, false);
            }
        }
    }
}

/// Observe every element of a sequence.
pub fn observe_array(seq: &Sequence) {
    for elem in seq.snapshot_untracked() {
        observe_inner(&elem, false);
    }
}

fn should_observe() -> bool {
    SHOULD_OBSERVE.with(|flag| flag.get())
}

/// Register the active computation with the shape-dep of every observed
/// element, recursively for nested sequences.
///
/// Element access cannot be trapped per-index, so a sequence read through
/// the accessor layer touches each element's shape-dep explicitly.
pub(crate) fn depend_array(seq: &Sequence) {
    for elem in seq.snapshot_untracked() {
        if let Some(ob) = elem.observer() {
            ob.dep().depend();
        }
        if let Value::Sequence(nested) = &elem {
            depend_array(nested);
        }
    }
}

/// Key addressing a structural mutation target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropKey {
    Key(String),
    Index(usize),
}

impl From<&str> for PropKey {
    fn from(k: &str) -> Self {
        PropKey::Key(k.to_string())
    }
}

impl From<String> for PropKey {
    fn from(k: String) -> Self {
        PropKey::Key(k)
    }
}

impl From<usize> for PropKey {
    fn from(i: usize) -> Self {
        PropKey::Index(i)
    }
}

/// Observable structural add/update.
///
/// Per-field accessors cannot trap brand-new keys, so adding one must go
/// through here: the new key gets a reactive accessor installed and the
/// container's shape-dep fires. Refusals (diagnostic, never fatal):
/// scalar targets, readonly targets, root bindings with external
/// references, and sealed records.
pub fn set_property(target: &Value, key: impl Into<PropKey>, value: Value) {
    let key = key.into();
    match target {
        Value::Sequence(seq) => {
            let index = match sequence_index(&key) {
                Some(index) => index,
                None => {
                    tracing::warn!(?key, "set_property on sequence requires an index");
                    return;
                }
            };
            // Length-extend + in-place set via the intercepted path, so
            // the shape-dep fires.
            seq.set(index, value);
        }
        Value::Record(record) => {
            let key = match key {
                PropKey::Key(k) => k,
                PropKey::Index(i) => i.to_string(),
            };
            if record.is_readonly() {
                tracing::warn!(key, "set_property on readonly record ignored");
                return;
            }
            if record.contains_key(&key) {
                // Already present: the reactive setter handles it.
                record.set(&key, value);
                return;
            }
            let ob = match record.observer() {
                Some(ob) => ob,
                None => {
                    // Not observed: plain assignment is all there is to do.
                    record.insert_plain(key, value);
                    return;
                }
            };
            if ob.vm_count() > 0 {
                tracing::warn!(
                    key,
                    "refusing to add reactive key to a root binding; declare it upfront"
                );
                return;
            }
            if record.is_sealed() {
                tracing::warn!(key, "set_property on sealed record ignored");
                return;
            }
            record.insert_plain(key.clone(), value.clone());
            record.install_dep(&key);
            if !ob.is_shallow() {
                observe(&value);
            }
            ob.dep().notify();
        }
        _ => {
            tracing::warn!(?key, "cannot set reactive property on a non-composite value");
        }
    }
}

/// Observable structural removal. Absent keys are a no-op; root-binding
/// and readonly guards match [`set_property`].
pub fn delete_property(target: &Value, key: impl Into<PropKey>) {
    let key = key.into();
    match target {
        Value::Sequence(seq) => {
            let index = match sequence_index(&key) {
                Some(index) => index,
                None => {
                    tracing::warn!(?key, "delete_property on sequence requires an index");
                    return;
                }
            };
            seq.splice(index, 1, Vec::new());
        }
        Value::Record(record) => {
            let key = match key {
                PropKey::Key(k) => k,
                PropKey::Index(i) => i.to_string(),
            };
            let ob = record.observer();
            if let Some(ob) = &ob {
                if ob.vm_count() > 0 {
                    tracing::warn!(
                        key,
                        "refusing to delete key from a root binding; set it to null instead"
                    );
                    return;
                }
            }
            if record.is_readonly() {
                tracing::warn!(key, "delete_property on readonly record ignored");
                return;
            }
            if !record.remove_field(&key) {
                return;
            }
            if let Some(ob) = ob {
                ob.dep().notify();
            }
        }
        _ => {
            tracing::warn!(?key, "cannot delete reactive property on a non-composite value");
        }
    }
}

fn sequence_index(key: &PropKey) -> Option<usize> {
    match key {
        PropKey::Index(i) => Some(*i),
        PropKey::Key(k) => k.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn observe_is_identity_keyed() {
        let value = Value::from(json!({ "a": 1 }));
        let first = observe(&value).expect("observed");
        let second = observe(&value).expect("existing");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn observe_refuses_scalars_and_cells() {
        assert!(observe(&Value::Int(1)).is_none());
        assert!(observe(&Value::Null).is_none());
        let cell = crate::value::Cell::new(Value::Int(1));
        assert!(observe(&Value::Cell(cell)).is_none());
    }

    #[test]
    fn observe_refuses_raw_and_sealed() {
        let raw = Record::new();
        raw.mark_raw();
        assert!(observe(&Value::Record(raw)).is_none());

        let sealed = Sequence::new();
        sealed.seal();
        assert!(observe(&Value::Sequence(sealed)).is_none());
    }

    #[test]
    fn toggle_observing_disables_wrapping() {
        let value = Value::from(json!({ "a": 1 }));
        toggle_observing(false);
        assert!(observe(&value).is_none());
        toggle_observing(true);
        assert!(observe(&value).is_some());
    }

    #[test]
    fn walk_installs_field_deps_recursively() {
        let value = Value::from(json!({ "outer": { "inner": 1 } }));
        observe(&value).expect("observed");

        let rec = value.as_record().expect("record");
        assert!(rec.field_dep("outer").is_some());
        let nested = rec.get_untracked("outer");
        assert!(nested.observer().is_some());
        assert!(nested.as_record().expect("record").field_dep("inner").is_some());
    }

    #[test]
    fn shallow_observe_does_not_recurse() {
        let value = Value::from(json!({ "outer": { "inner": 1 } }));
        let ob = observe_shallow(&value).expect("observed");
        assert!(ob.is_shallow());

        let nested = value.as_record().expect("record").get_untracked("outer");
        assert!(nested.observer().is_none());
    }

    #[test]
    fn set_property_on_unobserved_record_assigns_plainly() {
        let value = Value::from(json!({}));
        set_property(&value, "k", Value::Int(5));
        let rec = value.as_record().expect("record");
        assert_eq!(rec.get_untracked("k"), Value::Int(5));
        assert!(rec.field_dep("k").is_none());
    }

    #[test]
    fn set_property_on_root_binding_is_refused() {
        let value = Value::from(json!({ "a": 1 }));
        observe_root(&value).expect("observed");
        set_property(&value, "b", Value::Int(2));
        assert!(!value.as_record().expect("record").contains_key("b"));
    }

    #[test]
    fn set_property_installs_accessor_for_new_key() {
        let value = Value::from(json!({ "a": 1 }));
        observe(&value).expect("observed");
        set_property(&value, "b", Value::Int(2));

        let rec = value.as_record().expect("record");
        assert_eq!(rec.get_untracked("b"), Value::Int(2));
        assert!(rec.field_dep("b").is_some());
    }

    #[test]
    fn delete_property_removes_and_tolerates_absent_keys() {
        let value = Value::from(json!({ "a": 1 }));
        observe(&value).expect("observed");

        delete_property(&value, "missing");
        delete_property(&value, "a");
        assert!(!value.as_record().expect("record").contains_key("a"));
    }

    #[test]
    fn sequence_property_helpers_use_the_intercepted_path() {
        let value = Value::from(json!([1, 2, 3]));
        observe(&value).expect("observed");

        set_property(&value, 4usize, Value::Int(9));
        let seq = value.as_sequence().expect("sequence");
        assert_eq!(seq.len_untracked(), 5);
        assert_eq!(seq.get_untracked(4), Some(Value::Int(9)));
        assert_eq!(seq.get_untracked(3), Some(Value::Null));

        delete_property(&value, 0usize);
        assert_eq!(seq.len_untracked(), 4);
        assert_eq!(seq.get_untracked(0), Some(Value::Int(2)));
    }
}
