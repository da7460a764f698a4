//! Watcher: Computation Node
//!
//! A [`Watcher`] re-runs an expression against a bound context, collects
//! the dependency nodes it touched during that run, and subscribes to
//! exactly those. When any of them notifies, the watcher either re-runs
//! immediately (sync), marks itself dirty (lazy, for memoized derived
//! values), or is handed to the scheduler for batched execution.
//!
//! # Dependency Diffing
//!
//! The dependency set is kept as two rotating collections — previous deps
//! and newly collected deps. After each evaluation, any dep present in
//! the previous set but absent from the new one is unsubscribed, then the
//! sets swap. The diff is O(previous + new); nothing is rebuilt from
//! scratch.
//!
//! # Exit Discipline
//!
//! `get` restores the active-target slot and runs dependency cleanup on
//! every exit path, success or failure. Skipping either would silently
//! attribute subsequent reads to the wrong computation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::error::{self, Error};
use crate::observe::dep::{Dep, DepTarget, TargetGuard};
use crate::observe::path::{parse_path, resolve_path};
use crate::observe::scheduler;
use crate::observe::traverse::traverse;
use crate::value::{has_changed, Value};

/// Watcher ids start at 1 and grow monotonically; creation order is
/// flush order, so parents (created first) flush before children.
static WATCHER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_watcher_id() -> u64 {
    WATCHER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Side-effect hook type (pre-flush and disposal hooks).
pub type HookFn = dyn Fn() + Send + Sync;

/// Reaction callback, invoked with `(new_value, old_value)`.
pub type CallbackFn = dyn Fn(&Value, &Value) + Send + Sync;

/// Behavior flags and hooks for a watcher.
#[derive(Default)]
pub struct WatcherOptions {
    /// Recursively touch everything reachable from the result, so nested
    /// mutations re-trigger the watcher.
    pub deep: bool,
    /// User-defined watcher: evaluation failures are routed to the error
    /// hook instead of propagating.
    pub user: bool,
    /// Defer evaluation until demanded; dependency changes only mark the
    /// watcher dirty.
    pub lazy: bool,
    /// Re-run synchronously inside `notify` instead of via the scheduler.
    pub sync: bool,
    /// Invoked by the scheduler right before this watcher's flush run.
    pub before: Option<Box<HookFn>>,
    /// Invoked once on teardown.
    pub on_stop: Option<Box<HookFn>>,
}

enum Getter {
    Func(Box<dyn Fn(&Value) -> Result<Value, Error> + Send + Sync>),
    Path(Vec<String>),
    /// Degraded getter for an unparsable path.
    Noop,
}

struct DepState {
    deps: SmallVec<[Arc<Dep>; 4]>,
    dep_ids: HashSet<u64>,
    new_deps: SmallVec<[Arc<Dep>; 4]>,
    new_dep_ids: HashSet<u64>,
}

/// A computation node: subscribes to the deps its expression reads and
/// re-runs when they change.
pub struct Watcher {
    id: u64,
    ctx: Value,
    getter: Getter,
    cb: Box<CallbackFn>,
    /// Human-readable expression for diagnostics.
    expression: String,
    deep: bool,
    user: bool,
    lazy: bool,
    sync: bool,
    before: Option<Box<HookFn>>,
    on_stop: Option<Box<HookFn>>,
    active: AtomicBool,
    /// Lazy watchers only: value needs recomputation.
    dirty: AtomicBool,
    value: RwLock<Value>,
    deps: Mutex<DepState>,
    weak_self: Weak<Watcher>,
}

impl Watcher {
    /// Create a watcher over a getter function.
    ///
    /// Unless `lazy`, the expression is evaluated immediately to collect
    /// initial dependencies. An internal (non-user) getter failure during
    /// that first evaluation is returned as an error; user failures are
    /// routed to the error hook and the watcher starts with `Null`.
    pub fn new<G, C>(
        ctx: Value,
        getter: G,
        cb: C,
        options: WatcherOptions,
    ) -> Result<Arc<Watcher>, Error>
    where
        G: Fn(&Value) -> Result<Value, Error> + Send + Sync + 'static,
        C: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        Self::build(
            ctx,
            Getter::Func(Box::new(getter)),
            "<function>".to_string(),
            Box::new(cb),
            options,
        )
    }

    /// Create a watcher over a dotted-path expression resolved against
    /// the bound context.
    ///
    /// An unparsable path degrades to a no-op getter returning `Null`,
    /// with a diagnostic here rather than an error on every access.
    pub fn with_path<C>(
        ctx: Value,
        path: &str,
        cb: C,
        options: WatcherOptions,
    ) -> Result<Arc<Watcher>, Error>
    where
        C: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let getter = match parse_path(path) {
            Some(segments) => Getter::Path(segments),
            None => {
                tracing::warn!(
                    path,
                    "failed watching path: only simple dot-delimited paths are \
                     accepted; use a getter function for full control"
                );
                Getter::Noop
            }
        };
        Self::build(ctx, getter, path.to_string(), Box::new(cb), options)
    }

    fn build(
        ctx: Value,
        getter: Getter,
        expression: String,
        cb: Box<CallbackFn>,
        options: WatcherOptions,
    ) -> Result<Arc<Watcher>, Error> {
        let lazy = options.lazy;
        let watcher = Arc::new_cyclic(|weak| Watcher {
            id: next_watcher_id(),
            ctx,
            getter,
            cb,
            expression,
            deep: options.deep,
            user: options.user,
            lazy,
            sync: options.sync,
            before: options.before,
            on_stop: options.on_stop,
            active: AtomicBool::new(true),
            dirty: AtomicBool::new(lazy),
            value: RwLock::new(Value::Null),
            deps: Mutex::new(DepState {
                deps: SmallVec::new(),
                dep_ids: HashSet::new(),
                new_deps: SmallVec::new(),
                new_dep_ids: HashSet::new(),
            }),
            weak_self: weak.clone(),
        });

        if !lazy {
            let initial = watcher.get()?;
            *watcher.value.write() = initial;
        }
        Ok(watcher)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Lazy watchers only: whether the cached value is stale.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// The last computed value.
    pub fn value(&self) -> Value {
        self.value.read().clone()
    }

    /// Current dependency count. Mostly useful in tests.
    pub fn dep_count(&self) -> usize {
        self.deps.lock().deps.len()
    }

    /// Evaluate the expression and re-collect dependencies.
    ///
    /// The active-target slot is restored and dependency cleanup runs on
    /// every exit path.
    pub(crate) fn get(&self) -> Result<Value, Error> {
        let this = match self.weak_self.upgrade() {
            Some(this) => this,
            // Only reachable mid-drop; nothing to collect for.
            None => return Ok(Value::Null),
        };
        let guard = TargetGuard::push(this as Arc<dyn DepTarget>);

        let result = match &self.getter {
            Getter::Func(getter) => getter(&self.ctx),
            Getter::Path(segments) => Ok(resolve_path(&self.ctx, segments)),
            Getter::Noop => Ok(Value::Null),
        };

        let out = match result {
            Ok(value) => {
                if self.deep {
                    traverse(&value);
                }
                Ok(value)
            }
            Err(err) => {
                if self.user {
                    error::handle_error(
                        &err,
                        &format!("getter for watcher \"{}\"", self.expression),
                    );
                    Ok(Value::Null)
                } else {
                    Err(err)
                }
            }
        };

        drop(guard);
        self.cleanup_deps();
        out
    }

    /// Swap the rotating dependency sets, unsubscribing from deps the
    /// last evaluation no longer touched.
    fn cleanup_deps(&self) {
        let mut state = self.deps.lock();
        let DepState {
            deps,
            dep_ids,
            new_deps,
            new_dep_ids,
        } = &mut *state;

        for dep in deps.iter() {
            if !new_dep_ids.contains(&dep.id()) {
                dep.remove_sub(self.id);
            }
        }
        std::mem::swap(deps, new_deps);
        std::mem::swap(dep_ids, new_dep_ids);
        new_deps.clear();
        new_dep_ids.clear();
    }

    /// Scheduler job: re-evaluate and fire the reaction callback.
    ///
    /// The callback fires when the value changed, and also when the value
    /// is a composite or the watcher is deep — identity-equal values may
    /// have mutated in place.
    pub(crate) fn run(&self) {
        if !self.is_active() {
            return;
        }
        let value = match self.get() {
            Ok(value) => value,
            Err(err) => {
                // Errors inside a flush cannot unwind through the
                // scheduler; report and keep sibling watchers flushing.
                error::handle_error(
                    &err,
                    &format!("evaluation of watcher \"{}\"", self.expression),
                );
                return;
            }
        };

        let old = {
            let current = self.value.read();
            if !has_changed(&value, &current) && !value.is_composite() && !self.deep {
                return;
            }
            current.clone()
        };
        *self.value.write() = value.clone();
        (self.cb)(&value, &old);
    }

    /// Scheduler hook: invoked right before this watcher's flush run.
    pub(crate) fn call_before(&self) {
        if let Some(before) = &self.before {
            before();
        }
    }

    /// Force recomputation and clear the dirty flag. Lazy watchers only;
    /// the caller decides when the cached value is demanded.
    pub fn evaluate(&self) -> Result<Value, Error> {
        let value = self.get()?;
        *self.value.write() = value.clone();
        self.dirty.store(false, Ordering::SeqCst);
        Ok(value)
    }

    /// Make the currently active computation depend on every dep this
    /// watcher depends on. This is what lets a memoized derived value
    /// forward its dependencies to the consumer reading it.
    pub fn depend(&self) {
        let deps: Vec<Arc<Dep>> = self.deps.lock().deps.iter().cloned().collect();
        for dep in deps {
            dep.depend();
        }
    }

    /// Unsubscribe from everything and deactivate. Idempotent; safe to
    /// call from within the watcher's own reaction callback.
    pub fn teardown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let deps: Vec<Arc<Dep>> = {
            let mut state = self.deps.lock();
            state.dep_ids.clear();
            state.deps.drain(..).collect()
        };
        for dep in deps {
            dep.remove_sub(self.id);
        }
        if let Some(on_stop) = &self.on_stop {
            on_stop();
        }
    }
}

impl DepTarget for Watcher {
    fn id(&self) -> u64 {
        self.id
    }

    /// Collection hook: dedupe within the current run by dep id, and
    /// subscribe only the first time this watcher has ever depended on
    /// the dep.
    fn add_dep(&self, dep: &Arc<Dep>) {
        let subscribe = {
            let mut state = self.deps.lock();
            let dep_id = dep.id();
            if !state.new_dep_ids.insert(dep_id) {
                return;
            }
            state.new_deps.push(dep.clone());
            !state.dep_ids.contains(&dep_id)
        };
        if subscribe {
            if let Some(this) = self.weak_self.upgrade() {
                dep.add_sub(&(this as Arc<dyn DepTarget>));
            }
        }
    }

    fn update(&self) {
        if self.lazy {
            self.dirty.store(true, Ordering::SeqCst);
        } else if self.sync {
            self.run();
        } else if let Some(this) = self.weak_self.upgrade() {
            scheduler::queue_watcher(this);
        }
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("expression", &self.expression)
            .field("active", &self.is_active())
            .field("dep_count", &self.dep_count())
            .finish()
    }
}
