//! Tagged Dynamic Value Model
//!
//! Observable state is modeled as a closed tagged variant rather than
//! duck-typed dispatch: a [`Value`] is either a scalar, a keyed [`Record`],
//! an ordered [`Sequence`], or a single-value reference [`Cell`].
//!
//! Composites are cheap-clone shared handles (`Arc` inners). Cloning a
//! handle aliases the same storage, so identity is pointer identity — the
//! same semantics a garbage-collected host gives object references. The
//! observer machinery hangs off the composite inner, which guarantees at
//! most one observer per distinct composite and reclaims it together with
//! the value.
//!
//! # Change Detection
//!
//! [`has_changed`] implements the equality used by reactive writes:
//! scalars compare by value, composites and cells by identity, and writing
//! `NaN` over `NaN` is deliberately treated as unchanged (naive float
//! equality would report a change on every write).

mod cell;
mod record;
mod sequence;

pub use cell::Cell;
pub use record::Record;
pub use sequence::Sequence;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::observe::Observer;

/// A dynamically typed observable value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// A keyed composite with individually trackable fields.
    Record(Record),
    /// An ordered composite whose structural mutations are intercepted.
    Sequence(Sequence),
    /// A reference cell wrapping a single observable value.
    Cell(Cell),
}

impl Value {
    /// Convenience constructor for string values.
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Whether this value is a composite (record or sequence).
    pub fn is_composite(&self) -> bool {
        matches!(self, Value::Record(_) | Value::Sequence(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The observer attached to this value's composite storage, if any.
    pub fn observer(&self) -> Option<Arc<Observer>> {
        match self {
            Value::Record(r) => r.observer(),
            Value::Sequence(s) => s.observer(),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Sequence> {
        match self {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_cell(&self) -> Option<&Cell> {
        match self {
            Value::Cell(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert to a plain JSON value. Composites are snapshotted without
    /// registering dependencies; cells serialize their inner value.
    ///
    /// Cyclic composites are the caller's responsibility.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Record(r) => serde_json::Value::Object(
                r.entries_untracked()
                    .into_iter()
                    .map(|(k, v)| (k, v.to_json()))
                    .collect(),
            ),
            Value::Sequence(s) => serde_json::Value::Array(
                s.snapshot_untracked().iter().map(Value::to_json).collect(),
            ),
            Value::Cell(c) => c.get_untracked().to_json(),
        }
    }
}

/// Identity-aware equality.
///
/// Scalars compare by value (standard float semantics, so `NaN != NaN`),
/// composites and cells by pointer identity. Use [`has_changed`] for
/// change detection, which adds the `NaN` special case.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a.ptr_eq(b),
            (Value::Sequence(a), Value::Sequence(b)) => a.ptr_eq(b),
            (Value::Cell(a), Value::Cell(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Change-detection comparison for reactive writes.
///
/// Returns `false` (unchanged) when both values are `NaN`, even though
/// float equality says otherwise.
pub fn has_changed(new: &Value, old: &Value) -> bool {
    match (new, old) {
        (Value::Float(a), Value::Float(b)) => {
            if a == b {
                false
            } else {
                !(a.is_nan() && b.is_nan())
            }
        }
        _ => new != old,
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Record(r) => r.fmt(f),
            Value::Sequence(s) => s.fmt(f),
            Value::Cell(c) => c.fmt(f),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v.as_str()))
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Record(v)
    }
}

impl From<Sequence> for Value {
    fn from(v: Sequence) -> Self {
        Value::Sequence(v)
    }
}

impl From<Cell> for Value {
    fn from(v: Cell) -> Self {
        Value::Cell(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::from(s),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Record(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Record(r) => {
                let entries = r.entries_untracked();
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(&k, &v)?;
                }
                map.end()
            }
            Value::Sequence(s) => {
                let items = s.snapshot_untracked();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Cell(c) => c.get_untracked().serialize(serializer),
        }
    }
}

/// Mutation flags shared by composite storage.
#[derive(Default)]
pub(crate) struct Flags {
    /// Opted out of observation entirely.
    skip: AtomicBool,
    /// Mutation helpers refuse to touch this value.
    readonly: AtomicBool,
    /// Non-extensible: no new keys / no structural growth, and the value
    /// refuses observation.
    sealed: AtomicBool,
}

impl Flags {
    pub(crate) fn is_skip(&self) -> bool {
        self.skip.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_skip(&self) {
        self.skip.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_readonly(&self) {
        self.readonly.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Relaxed)
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_equality_is_by_value() {
        assert_eq!(Value::Int(1), Value::Int(1));
        assert_ne!(Value::Int(1), Value::Int(2));
        assert_eq!(Value::str("a"), Value::str("a"));
        // Cross-variant comparisons never match.
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn composite_equality_is_by_identity() {
        let a = Record::new();
        let alias = a.clone();
        let b = Record::new();

        assert_eq!(Value::Record(a.clone()), Value::Record(alias));
        assert_ne!(Value::Record(a), Value::Record(b));
    }

    #[test]
    fn nan_over_nan_is_unchanged() {
        let nan = Value::Float(f64::NAN);
        assert!(!has_changed(&nan, &Value::Float(f64::NAN)));
        assert!(has_changed(&Value::Float(1.0), &nan));
        assert!(has_changed(&nan, &Value::Float(1.0)));
        assert!(!has_changed(&Value::Float(2.5), &Value::Float(2.5)));
    }

    #[test]
    fn json_round_trip() {
        let v = Value::from(json!({
            "name": "weft",
            "count": 3,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "nested": { "ok": true, "none": null }
        }));

        let rec = v.as_record().expect("record");
        assert_eq!(rec.get_untracked("name"), Value::str("weft"));
        assert_eq!(rec.get_untracked("count"), Value::Int(3));

        let back = v.to_json();
        assert_eq!(back["tags"][1], json!("b"));
        assert_eq!(back["nested"]["ok"], json!(true));
    }

    #[test]
    fn serialize_matches_to_json() {
        let v = Value::from(json!({ "xs": [1, 2], "s": "hi" }));
        let ser = serde_json::to_value(&v).expect("serialize");
        assert_eq!(ser, v.to_json());
    }
}
