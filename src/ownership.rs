// Ownership tracking for GPU resources
//
// GPU handles are not garbage collected: destroying a parent object while a
// child handle still references it is undefined behavior. Every owner keeps a
// registry of its live children; tearing the owner down cascades through the
// registry (children first) so call sites never have to remember the order.

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Teardown = Box<dyn FnOnce() + Send>;

/// Shared state for one registered child. The teardown hook runs at most
/// once, from whichever side gets there first (child drop or parent cascade).
struct ChildSlot {
    teardown: Mutex<Option<Teardown>>,
}

impl ChildSlot {
    fn run_teardown(&self) {
        if let Some(teardown) = self.teardown.lock().take() {
            teardown();
        }
    }
}

struct RegistryInner {
    entries: Vec<(u64, Weak<ChildSlot>)>,
    next_id: u64,
}

/// Registry of live children for one owner kind `P`.
///
/// The owner embeds this and calls [`free_children`](Self::free_children)
/// before releasing its own native handle. Dropping the registry with live
/// children also cascades, so partial-construction failures tear down cleanly.
pub struct ParentResource<P> {
    inner: Arc<Mutex<RegistryInner>>,
    _owner: PhantomData<fn(P)>,
}

impl<P> ParentResource<P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                entries: Vec::new(),
                next_id: 0,
            })),
            _owner: PhantomData,
        }
    }

    /// Registers a child and returns the guard that owns its teardown hook.
    ///
    /// The hook must release the child's native handle and nothing else; it
    /// runs exactly once, either when the guard drops or when the parent
    /// cascades, whichever happens first.
    pub fn register(&self, teardown: impl FnOnce() + Send + 'static) -> ChildResource<P> {
        let slot = Arc::new(ChildSlot {
            teardown: Mutex::new(Some(Box::new(teardown))),
        });
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push((id, Arc::downgrade(&slot)));
            id
        };
        ChildResource {
            registry: Arc::downgrade(&self.inner),
            id,
            slot,
            _owner: PhantomData,
        }
    }

    /// Number of currently registered children.
    pub fn child_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, slot)| slot.strong_count() > 0)
            .count()
    }

    /// Tears down every registered child and clears the registry.
    ///
    /// Children are freed in reverse registration order, mirroring
    /// destructor order for resources created on top of each other (a buffer
    /// registered after its memory is destroyed before it).
    pub fn free_children(&self) {
        let entries = std::mem::take(&mut self.inner.lock().entries);
        for (_, slot) in entries.into_iter().rev() {
            if let Some(slot) = slot.upgrade() {
                slot.run_teardown();
            }
        }
    }
}

impl<P> Default for ParentResource<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Drop for ParentResource<P> {
    fn drop(&mut self) {
        let live = self.child_count();
        if live > 0 {
            // Contract violation at the call site; cascade anyway so the
            // children are not leaked with a dangling parent handle.
            log::error!(
                "parent registry dropped with {} live child resource(s); cascading teardown",
                live
            );
        }
        self.free_children();
    }
}

/// Registration guard held by a child GPU resource.
///
/// Move-only: there is no sensible "two owners of one GPU handle", so the
/// type does not implement `Clone`. Moving the guard moves the registration
/// with it; the moved-from binding triggers no deregistration.
pub struct ChildResource<P> {
    registry: Weak<Mutex<RegistryInner>>,
    id: u64,
    slot: Arc<ChildSlot>,
    _owner: PhantomData<fn(P)>,
}

impl<P> ChildResource<P> {
    /// Whether this child's teardown hook has already run (via parent
    /// cascade or an explicit [`free`](Self::free)).
    pub fn is_freed(&self) -> bool {
        self.slot.teardown.lock().is_none()
    }

    /// Runs the teardown hook now and deregisters. Idempotent: freeing an
    /// already-freed child is a no-op, so partial-construction failure paths
    /// may call this unconditionally.
    pub fn free(&mut self) {
        self.slot.run_teardown();
        self.deregister();
    }

    fn deregister(&self) {
        // The parent may already be gone (its cascade removed the entry);
        // deregistering an absent child is defined as a no-op.
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl<P> Drop for ChildResource<P> {
    fn drop(&mut self) {
        self.slot.run_teardown();
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestOwner;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registry_returns_to_zero_when_children_drop() {
        let parent: ParentResource<TestOwner> = ParentResource::new();
        let freed = Arc::new(AtomicUsize::new(0));

        let a = parent.register(counting_hook(&freed));
        let b = parent.register(counting_hook(&freed));
        let c = parent.register(counting_hook(&freed));
        assert_eq!(parent.child_count(), 3);

        drop(b);
        assert_eq!(parent.child_count(), 2);
        drop(a);
        drop(c);
        assert_eq!(parent.child_count(), 0);
        assert_eq!(freed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn moved_child_stays_registered_exactly_once() {
        let parent: ParentResource<TestOwner> = ParentResource::new();
        let freed = Arc::new(AtomicUsize::new(0));

        let child = parent.register(counting_hook(&freed));
        assert_eq!(parent.child_count(), 1);

        // A move transfers the registration; nothing runs for the source.
        let moved = child;
        let mut holder = Vec::new();
        holder.push(moved);
        assert_eq!(parent.child_count(), 1);
        assert_eq!(freed.load(Ordering::SeqCst), 0);

        holder.clear();
        assert_eq!(parent.child_count(), 0);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parent_cascade_frees_children_before_registry_clears() {
        let parent: ParentResource<TestOwner> = ParentResource::new();
        let freed = Arc::new(AtomicUsize::new(0));

        let a = parent.register(counting_hook(&freed));
        let b = parent.register(counting_hook(&freed));

        parent.free_children();
        assert_eq!(parent.child_count(), 0);
        assert_eq!(freed.load(Ordering::SeqCst), 2);
        assert!(a.is_freed());
        assert!(b.is_freed());

        // Guards dropping after the cascade must not re-run the hooks.
        drop(a);
        drop(b);
        assert_eq!(freed.load(Ordering::SeqCst), 2);
        assert_eq!(parent.child_count(), 0);
    }

    #[test]
    fn cascade_runs_in_reverse_registration_order() {
        let parent: ParentResource<TestOwner> = ParentResource::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut guards = Vec::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            guards.push(parent.register(move || order.lock().push(i)));
        }

        parent.free_children();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn explicit_free_is_idempotent() {
        let parent: ParentResource<TestOwner> = ParentResource::new();
        let freed = Arc::new(AtomicUsize::new(0));

        let mut child = parent.register(counting_hook(&freed));
        child.free();
        child.free();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert_eq!(parent.child_count(), 0);

        drop(child);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_construction_releases_handles_registered_so_far() {
        // A constructor that registers a guard for each handle right after
        // creating it, then fails partway. `?` unwinds through the guards
        // already registered, so nothing created before the failure leaks.
        fn build(
            parent: &ParentResource<TestOwner>,
            freed: &Arc<AtomicUsize>,
        ) -> anyhow::Result<(ChildResource<TestOwner>, ChildResource<TestOwner>)> {
            let first = parent.register(counting_hook(freed));
            let second = parent.register(counting_hook(freed));
            anyhow::bail!("third handle failed to create");
            #[allow(unreachable_code)]
            Ok((first, second))
        }

        let parent: ParentResource<TestOwner> = ParentResource::new();
        let freed = Arc::new(AtomicUsize::new(0));

        assert!(build(&parent, &freed).is_err());
        assert_eq!(freed.load(Ordering::SeqCst), 2);
        assert_eq!(parent.child_count(), 0);
    }

    #[test]
    fn child_outliving_parent_is_safe() {
        let freed = Arc::new(AtomicUsize::new(0));
        let child = {
            let parent: ParentResource<TestOwner> = ParentResource::new();
            parent.register(counting_hook(&freed))
        };
        // Parent drop cascaded already; the straggler guard is inert.
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert!(child.is_freed());
        drop(child);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }
}
