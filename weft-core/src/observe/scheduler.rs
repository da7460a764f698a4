//! Batched Flush Scheduler
//!
//! Non-sync watchers are not re-run inside `notify`; they are queued
//! here, deduplicated by id, and flushed in ascending id order. Because
//! ids are handed out at creation time, ascending order means computation
//! nodes created earlier (parents) run before ones created later
//! (children), and a parent tearing a child down mid-flush makes the
//! child's run a cheap no-op instead of wasted work.
//!
//! # Flush Timing
//!
//! By default a queued watcher flushes immediately, which keeps
//! single-threaded usage simple and deterministic. [`batch`] defers the
//! flush to the end of the outermost batch scope, coalescing any number
//! of writes into one run per affected watcher. Installing a tick hook
//! via [`set_tick_hook`] switches the scheduler to asynchronous mode:
//! flushes are handed to the host's deferral primitive (an event-loop
//! task, a channel, a test harness) instead of running inline.
//!
//! # Mid-Flush Queueing
//!
//! A watcher queued during a flush that has not yet run this flush is
//! spliced into the live queue at its sorted position. A watcher that
//! already ran goes to a separate re-queue tail, drained (in id order)
//! only after the main queue empties, so every first run of this flush
//! completes before any second run starts. Each re-queue bumps a
//! per-watcher counter; past [`MAX_UPDATE_COUNT`] the update is dropped
//! with a diagnostic naming the offending expression, and the flush
//! moves on.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use crate::observe::dep;
use crate::observe::watcher::Watcher;

/// Re-queue ceiling per watcher per flush before the update loop is
/// declared circular and broken.
pub const MAX_UPDATE_COUNT: u32 = 100;

type TickHook = Rc<dyn Fn(Box<dyn FnOnce()>)>;

#[derive(Default)]
struct SchedulerState {
    queue: Vec<Arc<Watcher>>,
    /// Watchers re-queued after already running this flush; kept sorted,
    /// drained after `queue` empties.
    requeue: Vec<Arc<Watcher>>,
    /// Ids currently queued (either list).
    has: HashSet<u64>,
    /// Ids that have run at least once this flush.
    ran: HashSet<u64>,
    /// Per-watcher re-queue counts this flush.
    circular: HashMap<u64, u32>,
    waiting: bool,
    flushing: bool,
    index: usize,
    batch_depth: usize,
    after_flush: Vec<Box<dyn FnOnce()>>,
    async_mode: bool,
    tick_hook: Option<TickHook>,
}

thread_local! {
    static STATE: RefCell<SchedulerState> = RefCell::new(SchedulerState::default());
}

fn with_state<R>(f: impl FnOnce(&mut SchedulerState) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

/// Whether flushes are deferred through a tick hook rather than run
/// inline. `Dep::notify` skips its subscriber sort in this mode; the
/// queue sorts instead.
pub fn is_async_mode() -> bool {
    with_state(|s| s.async_mode)
}

/// Toggle asynchronous flushing without changing the installed hook.
pub fn set_async_mode(enabled: bool) {
    with_state(|s| s.async_mode = enabled);
}

/// Install the host's deferral primitive and switch to asynchronous
/// mode. The hook receives the flush job and decides when to run it.
pub fn set_tick_hook(hook: impl Fn(Box<dyn FnOnce()>) + 'static) {
    with_state(|s| {
        s.tick_hook = Some(Rc::new(hook));
        s.async_mode = true;
    });
}

/// Remove the tick hook and return to inline flushing.
pub fn clear_tick_hook() {
    with_state(|s| {
        s.tick_hook = None;
        s.async_mode = false;
    });
}

/// Queue a watcher for the next flush, deduplicating by id.
pub(crate) fn queue_watcher(watcher: Arc<Watcher>) {
    let should_flush = with_state(|s| {
        let id = watcher.id();
        if s.has.contains(&id) {
            return false;
        }

        if s.flushing && s.ran.contains(&id) {
            // Second (or later) run this flush: circular-update suspect.
            let count = s.circular.entry(id).or_insert(0);
            *count += 1;
            if *count > MAX_UPDATE_COUNT {
                tracing::error!(
                    watcher_id = id,
                    expression = watcher.expression(),
                    "possible infinite update loop; dropping update"
                );
                return false;
            }
            s.has.insert(id);
            let mut i = s.requeue.len();
            while i > 0 && s.requeue[i - 1].id() > id {
                i -= 1;
            }
            s.requeue.insert(i, watcher);
        } else if s.flushing {
            // First run this flush: splice into the unprocessed part of
            // the live queue at its sorted position.
            s.has.insert(id);
            let mut i = s.queue.len();
            while i > s.index && s.queue[i - 1].id() > id {
                i -= 1;
            }
            s.queue.insert(i, watcher);
        } else {
            s.has.insert(id);
            s.queue.push(watcher);
        }

        if s.waiting {
            return false;
        }
        s.waiting = true;
        true
    });

    if should_flush {
        schedule_flush();
    }
}

enum FlushMode {
    /// Inside a batch; the outermost exit flushes.
    Deferred,
    Hook(TickHook),
    Inline,
}

/// Hand the flush to the tick hook in async mode, or run it inline.
fn schedule_flush() {
    let mode = with_state(|s| {
        if s.batch_depth > 0 {
            FlushMode::Deferred
        } else {
            match (&s.tick_hook, s.async_mode) {
                (Some(hook), true) => FlushMode::Hook(hook.clone()),
                _ => FlushMode::Inline,
            }
        }
    });
    match mode {
        FlushMode::Deferred => {}
        FlushMode::Hook(hook) => hook(Box::new(flush_queue)),
        FlushMode::Inline => flush_queue(),
    }
}

fn flush_queue() {
    with_state(|s| {
        s.flushing = true;
        // Pre-flush queueing appends unsorted.
        s.queue.sort_by_key(|w| w.id());
    });

    loop {
        // The borrow is released before running the watcher; its getter
        // and callback may queue further watchers.
        let next = with_state(|s| {
            if s.index >= s.queue.len() && !s.requeue.is_empty() {
                let mut tail = std::mem::take(&mut s.requeue);
                s.queue.append(&mut tail);
            }
            if s.index < s.queue.len() {
                let watcher = s.queue[s.index].clone();
                s.index += 1;
                s.has.remove(&watcher.id());
                s.ran.insert(watcher.id());
                Some(watcher)
            } else {
                None
            }
        });

        match next {
            Some(watcher) => {
                watcher.call_before();
                watcher.run();
            }
            None => break,
        }
    }

    let after = with_state(|s| {
        s.flushing = false;
        s.waiting = false;
        s.queue.clear();
        s.index = 0;
        s.has.clear();
        s.ran.clear();
        s.circular.clear();
        std::mem::take(&mut s.after_flush)
    });

    if !after.is_empty() {
        // Post-flush callbacks run batched, so their writes coalesce
        // into one follow-up flush.
        batch(|| {
            for cb in after {
                cb();
            }
        });
    }

    dep::compact_pending_deps();
}

/// Run `f` with flushes deferred; the outermost batch scope flushes once
/// on exit. Nesting is allowed and re-entrant.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    struct BatchGuard;
    impl Drop for BatchGuard {
        fn drop(&mut self) {
            let flush = with_state(|s| {
                s.batch_depth -= 1;
                s.batch_depth == 0 && s.waiting && !s.flushing
            });
            if flush {
                let hook = with_state(|s| if s.async_mode { s.tick_hook.clone() } else { None });
                match hook {
                    Some(hook) => hook(Box::new(flush_queue)),
                    None => flush_queue(),
                }
            }
        }
    }

    with_state(|s| s.batch_depth += 1);
    let _guard = BatchGuard;
    f()
}

/// Run `cb` after the in-progress (or pending) flush completes. Outside
/// any flush or batch, `cb` runs via the tick hook in async mode, or
/// immediately otherwise.
pub fn next_tick(cb: impl FnOnce() + 'static) {
    let deferred = with_state(|s| {
        if s.waiting || s.flushing || s.batch_depth > 0 {
            s.after_flush.push(Box::new(cb));
            None
        } else {
            Some(Box::new(cb) as Box<dyn FnOnce()>)
        }
    });

    if let Some(cb) = deferred {
        let hook = with_state(|s| if s.async_mode { s.tick_hook.clone() } else { None });
        match hook {
            Some(hook) => hook(cb),
            None => cb(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::watcher::WatcherOptions;
    use crate::observe::Watcher;
    use crate::value::Value;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn tracer(
        marker: i32,
        log: &Arc<Mutex<Vec<i32>>>,
    ) -> impl Fn(&Value) -> Result<Value, crate::error::Error> + Send + Sync {
        let log = log.clone();
        move |_ctx| {
            log.lock().push(marker);
            Ok(Value::Null)
        }
    }

    fn noop_cb(_new: &Value, _old: &Value) {}

    #[test]
    fn queue_flushes_immediately_outside_batch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let w = Watcher::new(Value::Null, tracer(1, &log), noop_cb, WatcherOptions::default())
            .expect("watcher");
        log.lock().clear();

        queue_watcher(w);
        assert_eq!(&*log.lock(), &[1]);
    }

    #[test]
    fn batch_dedupes_and_flushes_in_id_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = Watcher::new(Value::Null, tracer(1, &log), noop_cb, WatcherOptions::default())
            .expect("watcher");
        let b = Watcher::new(Value::Null, tracer(2, &log), noop_cb, WatcherOptions::default())
            .expect("watcher");
        log.lock().clear();

        batch(|| {
            queue_watcher(b.clone());
            queue_watcher(a.clone());
            queue_watcher(b.clone());
            assert!(log.lock().is_empty(), "deferred until batch exit");
        });
        assert_eq!(&*log.lock(), &[1, 2]);
    }

    #[test]
    fn nested_batches_flush_once_at_outermost_exit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let w = Watcher::new(Value::Null, tracer(1, &log), noop_cb, WatcherOptions::default())
            .expect("watcher");
        log.lock().clear();

        batch(|| {
            batch(|| queue_watcher(w.clone()));
            assert!(log.lock().is_empty(), "inner exit must not flush");
        });
        assert_eq!(&*log.lock(), &[1]);
    }

    #[test]
    fn next_tick_runs_after_batched_flush() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let w = Watcher::new(Value::Null, tracer(1, &log), noop_cb, WatcherOptions::default())
            .expect("watcher");
        log.lock().clear();

        let tick_log = log.clone();
        batch(|| {
            queue_watcher(w.clone());
            next_tick(move || tick_log.lock().push(99));
        });
        assert_eq!(&*log.lock(), &[1, 99]);
    }

    #[test]
    fn next_tick_runs_immediately_when_idle() {
        let hit = Arc::new(AtomicI32::new(0));
        let hit_clone = hit.clone();
        next_tick(move || {
            hit_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tick_hook_receives_deferred_flush() {
        let pending: Arc<Mutex<Vec<Box<dyn FnOnce()>>>> = Arc::new(Mutex::new(Vec::new()));
        let pending_clone = pending.clone();
        set_tick_hook(move |job| pending_clone.lock().push(job));

        let log = Arc::new(Mutex::new(Vec::new()));
        let w = Watcher::new(Value::Null, tracer(1, &log), noop_cb, WatcherOptions::default())
            .expect("watcher");
        log.lock().clear();

        queue_watcher(w);
        assert!(log.lock().is_empty(), "flush held by the hook");

        let jobs: Vec<_> = pending.lock().drain(..).collect();
        for job in jobs {
            job();
        }
        assert_eq!(&*log.lock(), &[1]);

        clear_tick_hook();
    }

    #[test]
    fn circular_update_is_broken_with_a_diagnostic() {
        let ctx = Value::from(json!({ "n": 0 }));
        crate::observe::observe(&ctx).expect("observed");
        let record = ctx.as_record().expect("record").clone();

        let writer = record.clone();
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let w = Watcher::with_path(
            ctx.clone(),
            "n",
            move |new, _old| {
                runs_clone.fetch_add(1, Ordering::SeqCst);
                let n = new.as_int().unwrap_or(0);
                writer.set("n", Value::Int(n + 1));
            },
            WatcherOptions::default(),
        )
        .expect("watcher");

        // Kick the loop; must terminate via the update-count ceiling.
        record.set("n", Value::Int(1));
        let total = runs.load(Ordering::SeqCst);
        assert!(total >= 1, "callback ran");
        assert!(
            total <= MAX_UPDATE_COUNT as i32 + 2,
            "loop broken, ran {total} times"
        );
        drop(w);
    }
}
