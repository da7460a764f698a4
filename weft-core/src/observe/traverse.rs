//! Deep Dependency Traversal
//!
//! A deep watcher must re-run when anything reachable from its value
//! mutates, not only the top-level reference. After evaluation, the
//! watcher "touches" every reachable field through the tracked accessor
//! layer, forcing registration of the nested deps a shallow read would
//! miss. Already-visited composites are skipped by shape-dep id, which
//! also terminates on cyclic values.

use std::collections::HashSet;

use crate::value::Value;

/// Recursively touch every reachable field of `value`, registering the
/// active computation with each dep along the way.
pub fn traverse(value: &Value) {
    let mut seen = HashSet::new();
    traverse_inner(value, &mut seen);
}

fn traverse_inner(value: &Value, seen: &mut HashSet<u64>) {
    match value {
        Value::Record(record) => {
            if record.is_raw() || !mark_seen(value, seen) {
                return;
            }
            for key in record.keys_untracked() {
                traverse_inner(&record.get(&key), seen);
            }
        }
        Value::Sequence(seq) => {
            if seq.is_raw() || !mark_seen(value, seen) {
                return;
            }
            for index in 0..seq.len_untracked() {
                if let Some(elem) = seq.get(index) {
                    traverse_inner(&elem, seen);
                }
            }
        }
        Value::Cell(cell) => {
            traverse_inner(&cell.get(), seen);
        }
        _ => {}
    }
}

/// Returns `false` when the composite's shape-dep was already visited.
/// Unobserved composites are always traversed; they carry no deps of
/// their own but may hold observed children.
fn mark_seen(value: &Value, seen: &mut HashSet<u64>) -> bool {
    match value.observer() {
        Some(ob) => seen.insert(ob.dep().id()),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::observe;
    use serde_json::json;

    #[test]
    fn traverse_terminates_on_cycles() {
        let value = Value::from(json!({ "name": "root" }));
        observe(&value).expect("observed");
        let rec = value.as_record().expect("record").clone();
        // Create a cycle: root.self -> root.
        rec.insert_plain("self", Value::Record(rec.clone()));

        // Must not loop forever.
        traverse(&value);
    }

    #[test]
    fn traverse_skips_raw_composites() {
        let raw = Value::from(json!({ "a": 1 }));
        raw.as_record().expect("record").mark_raw();
        // No observer, no deps: still must not panic.
        traverse(&raw);
    }
}
