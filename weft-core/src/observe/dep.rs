//! Dependency Node
//!
//! A [`Dep`] is the publish point for one observable storage location: a
//! tracked field, a composite's shape, or a cell. It holds a list of
//! subscriber references and fans change notifications out to them.
//!
//! # Deferred Compaction
//!
//! Unsubscribing from a dep with a large subscriber list is costly when
//! done eagerly, so removal only nulls the slot out and registers the dep
//! for end-of-flush compaction. [`compact_pending_deps`] filters the
//! holes (and any subscribers that were dropped outright) once per flush.
//!
//! # The Active-Target Stack
//!
//! Dependency collection attributes reads to whichever computation is
//! currently evaluating. That identity lives in a thread-local stack with
//! scoped [`TargetGuard`]s: the previous target is restored on drop, on
//! every exit path including panics. Nested evaluations therefore cannot
//! corrupt the enclosing computation's identity — the single most
//! safety-critical invariant in the system.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::observe::scheduler;

static DEP_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_dep_id() -> u64 {
    DEP_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A consumer that can be registered with a [`Dep`].
///
/// This is the seam between dependency nodes and computation nodes: a dep
/// never knows what re-evaluation means, only that its subscribers want
/// an `update` when the location changes.
pub trait DepTarget: Send + Sync {
    /// Unique id; also the flush-order sort key.
    fn id(&self) -> u64;

    /// Called during collection when this target reads the dep's location.
    fn add_dep(&self, dep: &Arc<Dep>);

    /// Called when the dep's location changed.
    fn update(&self);
}

/// A dependency node: one per observable storage location.
pub struct Dep {
    id: u64,
    /// Subscriber slots. `None` marks a hole left by deferred removal.
    subs: Mutex<Vec<Option<(u64, Weak<dyn DepTarget>)>>>,
    /// Whether this dep is already registered for compaction.
    pending: AtomicBool,
}

impl Dep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_dep_id(),
            subs: Mutex::new(Vec::new()),
            pending: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append a subscriber. The caller (the computation node's dep-id
    /// set) guarantees a target appears at most once per dep.
    pub fn add_sub(&self, target: &Arc<dyn DepTarget>) {
        self.subs
            .lock()
            .push(Some((target.id(), Arc::downgrade(target))));
    }

    /// Mark the subscriber's slot invalid without compacting. If no
    /// compaction is pending for this dep, register it for the next
    /// end-of-flush sweep.
    pub fn remove_sub(self: &Arc<Self>, target_id: u64) {
        {
            let mut subs = self.subs.lock();
            for slot in subs.iter_mut() {
                if matches!(slot, Some((id, _)) if *id == target_id) {
                    *slot = None;
                    break;
                }
            }
        }
        if !self.pending.swap(true, Ordering::AcqRel) {
            PENDING_CLEANUP.with(|pending| pending.borrow_mut().push(self.clone()));
        }
    }

    /// Register the active computation (if any) as depending on this dep.
    pub fn depend(self: &Arc<Self>) {
        if let Some(target) = current_target() {
            target.add_dep(self);
        }
    }

    /// Notify subscribers that the location changed.
    ///
    /// Snapshots the live subscribers first; when the scheduler is not
    /// batching asynchronously the snapshot is sorted ascending by target
    /// id, so evaluation order stays deterministic (parents before
    /// children) even in synchronous mode.
    pub fn notify(&self) {
        let mut snapshot: Vec<Arc<dyn DepTarget>> = {
            let subs = self.subs.lock();
            subs.iter()
                .filter_map(|slot| slot.as_ref().and_then(|(_, weak)| weak.upgrade()))
                .collect()
        };
        if !scheduler::is_async_mode() {
            snapshot.sort_by_key(|target| target.id());
        }
        for target in snapshot {
            target.update();
        }
    }

    /// Live subscriber count (holes and dead references excluded).
    pub fn sub_count(&self) -> usize {
        self.subs
            .lock()
            .iter()
            .filter(|slot| {
                slot.as_ref()
                    .map(|(_, weak)| weak.strong_count() > 0)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Raw slot count, including holes. Exposed for compaction tests.
    pub fn slot_count(&self) -> usize {
        self.subs.lock().len()
    }

    fn compact(&self) {
        self.subs
            .lock()
            .retain(|slot| matches!(slot, Some((_, weak)) if weak.strong_count() > 0));
        self.pending.store(false, Ordering::Release);
    }
}

thread_local! {
    static PENDING_CLEANUP: RefCell<Vec<Arc<Dep>>> = const { RefCell::new(Vec::new()) };
    static TARGET_STACK: RefCell<Vec<Option<Arc<dyn DepTarget>>>> = const { RefCell::new(Vec::new()) };
}

/// Compact every dep that accumulated holes since the last sweep. Called
/// by the scheduler at the end of each flush; safe to call directly.
pub fn compact_pending_deps() {
    let pending = PENDING_CLEANUP.with(|pending| std::mem::take(&mut *pending.borrow_mut()));
    for dep in pending {
        dep.compact();
    }
}

/// The computation currently collecting dependencies, if any.
pub fn current_target() -> Option<Arc<dyn DepTarget>> {
    TARGET_STACK.with(|stack| stack.borrow().last().cloned().flatten())
}

pub fn has_active_target() -> bool {
    TARGET_STACK.with(|stack| matches!(stack.borrow().last(), Some(Some(_))))
}

/// Scope guard designating the active dependency-collecting computation.
///
/// Restores the previous target when dropped.
pub struct TargetGuard {
    _private: (),
}

impl TargetGuard {
    /// Make `target` the active computation for the guard's lifetime.
    pub fn push(target: Arc<dyn DepTarget>) -> Self {
        TARGET_STACK.with(|stack| stack.borrow_mut().push(Some(target)));
        Self { _private: () }
    }

    /// Suppress dependency collection for the guard's lifetime.
    pub fn none() -> Self {
        TARGET_STACK.with(|stack| stack.borrow_mut().push(None));
        Self { _private: () }
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        TARGET_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run `f` with dependency collection suppressed.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = TargetGuard::none();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct MockTarget {
        id: u64,
        updates: AtomicUsize,
        collected: Mutex<Vec<u64>>,
    }

    impl MockTarget {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                updates: AtomicUsize::new(0),
                collected: Mutex::new(Vec::new()),
            })
        }
    }

    impl DepTarget for MockTarget {
        fn id(&self) -> u64 {
            self.id
        }

        fn add_dep(&self, dep: &Arc<Dep>) {
            self.collected.lock().push(dep.id());
        }

        fn update(&self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dep_ids_are_unique() {
        assert_ne!(Dep::new().id(), Dep::new().id());
    }

    #[test]
    fn notify_reaches_subscribers() {
        let dep = Dep::new();
        let target = MockTarget::new(1);
        dep.add_sub(&(target.clone() as Arc<dyn DepTarget>));

        dep.notify();
        dep.notify();
        assert_eq!(target.updates.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn depend_registers_with_active_target() {
        let dep = Dep::new();
        let target = MockTarget::new(7);

        // No active target: depend is a no-op.
        dep.depend();
        assert!(target.collected.lock().is_empty());

        {
            let _guard = TargetGuard::push(target.clone() as Arc<dyn DepTarget>);
            dep.depend();
        }
        assert_eq!(&*target.collected.lock(), &[dep.id()]);
        assert!(!has_active_target());
    }

    #[test]
    fn untracked_suppresses_collection() {
        let dep = Dep::new();
        let target = MockTarget::new(9);

        let _guard = TargetGuard::push(target.clone() as Arc<dyn DepTarget>);
        untracked(|| dep.depend());
        assert!(target.collected.lock().is_empty());
        // Outer target restored after the untracked scope.
        dep.depend();
        assert_eq!(target.collected.lock().len(), 1);
    }

    #[test]
    fn removal_leaves_hole_until_compaction() {
        let dep = Dep::new();
        let a = MockTarget::new(1);
        let b = MockTarget::new(2);
        dep.add_sub(&(a.clone() as Arc<dyn DepTarget>));
        dep.add_sub(&(b.clone() as Arc<dyn DepTarget>));

        dep.remove_sub(1);
        assert_eq!(dep.slot_count(), 2, "hole retained before compaction");
        assert_eq!(dep.sub_count(), 1);

        // Removed subscriber no longer gets notified.
        dep.notify();
        assert_eq!(a.updates.load(Ordering::SeqCst), 0);
        assert_eq!(b.updates.load(Ordering::SeqCst), 1);

        compact_pending_deps();
        assert_eq!(dep.slot_count(), 1);
    }

    #[test]
    fn notify_sorts_by_id_in_sync_mode() {
        let dep = Dep::new();
        let order: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

        struct Recording {
            id: u64,
            order: Arc<Mutex<Vec<u64>>>,
        }
        impl DepTarget for Recording {
            fn id(&self) -> u64 {
                self.id
            }
            fn add_dep(&self, _dep: &Arc<Dep>) {}
            fn update(&self) {
                self.order.lock().push(self.id);
            }
        }

        // Subscribe in reverse id order; keep the targets alive.
        let mut keep = Vec::new();
        for id in [3u64, 1, 2] {
            let target: Arc<dyn DepTarget> = Arc::new(Recording {
                id,
                order: order.clone(),
            });
            dep.add_sub(&target);
            keep.push(target);
        }

        dep.notify();
        assert_eq!(&*order.lock(), &[1, 2, 3]);
    }
}
