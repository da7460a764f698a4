//! Dotted-Path Watch Expressions
//!
//! A watcher may be bound to a dotted path like `"user.address.city"`
//! instead of a getter function. Paths only accept simple segments; a
//! lookup that hits a missing segment yields `Null` rather than erroring,
//! and an unparsable path degrades the watcher's getter to a no-op with a
//! construction-time diagnostic.

use crate::value::Value;

/// Parse a dotted path into segments.
///
/// Accepts word characters, `$`, and `.`; anything else means the path
/// needs a getter function instead.
pub(crate) fn parse_path(path: &str) -> Option<Vec<String>> {
    if path.is_empty() {
        return None;
    }
    let valid = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.');
    if !valid {
        return None;
    }
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return None;
    }
    Some(segments)
}

/// Resolve a parsed path against a bound context.
///
/// Each step goes through the tracked accessor layer, so resolution
/// registers the same dependencies a hand-written getter would. Numeric
/// segments index into sequences; cells are read through.
pub(crate) fn resolve_path(ctx: &Value, segments: &[String]) -> Value {
    let mut current = ctx.clone();
    for segment in segments {
        current = match &current {
            Value::Record(record) => record.get(segment),
            Value::Sequence(seq) => match segment.parse::<usize>() {
                Ok(index) => seq.get(index).unwrap_or(Value::Null),
                Err(_) => return Value::Null,
            },
            Value::Cell(cell) => {
                let inner = cell.get();
                match &inner {
                    Value::Record(record) => record.get(segment),
                    _ => return Value::Null,
                }
            }
            _ => return Value::Null,
        };
    }
    current
}
