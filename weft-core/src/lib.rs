//! Weft Core
//!
//! A fine-grained change-tracking runtime for dynamic data graphs. It
//! implements:
//!
//! - A tagged dynamic [`Value`] tree (records, sequences, cells, scalars)
//! - Automatic dependency tracking through the tracked accessor layer
//! - Computation nodes ([`Watcher`]) that re-run when their inputs change
//! - A batching scheduler with deterministic flush ordering
//!
//! Dependencies are collected by observation, not declaration: while a
//! watcher evaluates, every field it reads registers it as a subscriber,
//! and the set is re-diffed on each run so conditional reads track
//! exactly what the last evaluation touched.
//!
//! # Example
//!
//! ```rust
//! use weft_core::{observe, Value, Watcher, WatcherOptions};
//! use serde_json::json;
//!
//! let state = Value::from(json!({ "count": 0 }));
//! observe::observe(&state);
//!
//! let watcher = Watcher::with_path(
//!     state.clone(),
//!     "count",
//!     |new, old| println!("count: {old:?} -> {new:?}"),
//!     WatcherOptions::default(),
//! )
//! .unwrap();
//!
//! // Writing through the tracked accessor re-runs the watcher.
//! state.as_record().unwrap().set("count", Value::Int(5));
//! assert_eq!(watcher.value(), Value::Int(5));
//! ```

pub mod error;
pub mod observe;
pub mod value;

pub use error::{clear_error_hook, set_error_hook, Error};
pub use observe::{
    batch, delete_property, next_tick, set_property, untracked, Watcher, WatcherOptions,
};
pub use value::{Cell, Record, Sequence, Value};
