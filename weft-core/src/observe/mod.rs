//! Observation Layer
//!
//! Everything that makes a [`Value`](crate::value::Value) graph live: the
//! dependency nodes reads register with ([`dep`]), the per-composite
//! observers that wire a graph for tracking ([`observer`]), the
//! computation nodes that subscribe and re-run ([`watcher`]), and the
//! scheduler that batches those re-runs ([`scheduler`]).
//!
//! The typical flow: [`observe`] a root value, create [`Watcher`]s over
//! it, then mutate through the tracked accessors. Reads made while a
//! watcher evaluates are attributed to it automatically; writes notify
//! exactly the watchers whose last evaluation touched the written
//! location.

pub mod dep;
pub mod scheduler;

mod observer;
mod path;
mod traverse;
mod watcher;

pub use dep::{
    compact_pending_deps, current_target, has_active_target, untracked, Dep, DepTarget,
    TargetGuard,
};
pub use observer::{
    delete_property, observe, observe_array, observe_root, observe_shallow, set_property,
    toggle_observing, Observer, PropKey,
};
pub use scheduler::{
    batch, clear_tick_hook, is_async_mode, next_tick, set_async_mode, set_tick_hook,
    MAX_UPDATE_COUNT,
};
pub use traverse::traverse;
pub use watcher::{Watcher, WatcherOptions};

pub(crate) use observer::depend_array;
