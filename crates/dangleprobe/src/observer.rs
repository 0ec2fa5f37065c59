//! Counting observer for dangling checked-pointer events.
//!
//! At most one observer is active per process. The active one publishes a
//! pointer to its counters in `ACTIVE`, and the two hook slots of its
//! registry point at fixed trampolines that bump whatever is published
//! there. The observer's identity is its counter block rather than its own
//! address, so moving an observer value around never invalidates the
//! registration.
//!
//! The trampolines run inside the allocator's free path. They take only an
//! allocation-free lock and touch no reference counts; the observer owns
//! the counters and unpublishes them before they can be freed.

use crate::config::BuildConfig;
use crate::error::Result;
use crate::fatal::{abort_with_message, DOUBLE_REGISTRATION, NO_ACTIVE_OBSERVER};
use crate::hooks::{GlobalHooks, HookRegistry, HookSnapshot};
use crate::sync::RawMutex;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    detected: AtomicUsize,
    released: AtomicUsize,
}

impl Counters {
    /// A detached copy of the current values.
    fn frozen(&self) -> Self {
        Counters {
            detected: AtomicUsize::new(self.detected.load(Ordering::Relaxed)),
            released: AtomicUsize::new(self.released.load(Ordering::Relaxed)),
        }
    }

    fn detected(&self) -> &AtomicUsize {
        &self.detected
    }

    fn released(&self) -> &AtomicUsize {
        &self.released
    }
}

/// The counters of the active observer, or null.
///
/// The pointer is only dereferenced with `lock` held, and the owning
/// observer clears it under the same lock before its `Arc` can go away.
struct ActiveSlot {
    lock: RawMutex,
    counters: UnsafeCell<*const Counters>,
}

unsafe impl Sync for ActiveSlot {}

impl ActiveSlot {
    const fn new() -> Self {
        ActiveSlot {
            lock: RawMutex::new(),
            counters: UnsafeCell::new(ptr::null()),
        }
    }

    /// Publish `counters` if the slot is empty. Returns false if it is taken.
    fn publish(&self, counters: *const Counters) -> bool {
        let _guard = self.lock.lock();
        let slot = unsafe { &mut *self.counters.get() };
        if !slot.is_null() {
            return false;
        }
        *slot = counters;
        true
    }

    /// Empty the slot if it holds `counters`.
    fn retract(&self, counters: *const Counters) -> bool {
        let _guard = self.lock.lock();
        let slot = unsafe { &mut *self.counters.get() };
        if *slot != counters {
            return false;
        }
        *slot = ptr::null();
        true
    }

    fn holds(&self, counters: *const Counters) -> bool {
        let _guard = self.lock.lock();
        unsafe { *self.counters.get() == counters }
    }

    fn is_occupied(&self) -> bool {
        let _guard = self.lock.lock();
        unsafe { !(*self.counters.get()).is_null() }
    }

    /// Increment one counter of the published block. Returns false if the
    /// slot is empty.
    #[inline]
    fn bump(&self, pick: fn(&Counters) -> &AtomicUsize) -> bool {
        let _guard = self.lock.lock();
        let counters = unsafe { *self.counters.get() };
        if counters.is_null() {
            return false;
        }
        // SAFETY: non-null while published, and the owner retracts it under
        // this lock before releasing the block.
        pick(unsafe { &*counters }).fetch_add(1, Ordering::Relaxed);
        true
    }
}

static ACTIVE: ActiveSlot = ActiveSlot::new();

fn count_detected(_addr: usize) {
    if !ACTIVE.bump(Counters::detected) {
        abort_with_message(NO_ACTIVE_OBSERVER);
    }
}

fn count_released(_addr: usize) {
    if !ACTIVE.bump(Counters::released) {
        abort_with_message(NO_ACTIVE_OBSERVER);
    }
}

/// Counts the dangling-pointer events the allocator reports while it is
/// alive.
///
/// Creating one installs it as the only receiver of both allocator hooks;
/// dropping it puts back whatever was installed before.
///
/// ```no_run
/// use dangleprobe::DanglingPtrObserver;
///
/// let observer = match DanglingPtrObserver::create() {
///     Ok(observer) => observer,
///     Err(err) => {
///         eprintln!("skipping: {}", err);
///         return;
///     }
/// };
/// // ... free an object while a checked pointer still refers to it ...
/// assert_eq!(observer.detected_count(), 1);
/// ```
pub struct DanglingPtrObserver<R: HookRegistry = GlobalHooks> {
    registry: R,
    counters: Arc<Counters>,
    /// Hooks that were installed when this observer registered.
    previous: HookSnapshot,
}

impl DanglingPtrObserver<GlobalHooks> {
    /// Create an observer on the process-wide hooks, if this build and
    /// runtime support it.
    pub fn create() -> Result<Self> {
        Self::create_with(&BuildConfig::current(), GlobalHooks)
    }
}

impl<R: HookRegistry> DanglingPtrObserver<R> {
    /// Create an observer on `registry`, judging feasibility from `config`.
    ///
    /// Nothing is touched unless every prerequisite holds. Aborts the
    /// process if another observer is already active.
    pub fn create_with(config: &BuildConfig, registry: R) -> Result<Self> {
        if let Err(err) = config.check() {
            tracing::warn!(reason = err.reason(), "dangling pointer observer unavailable");
            return Err(err);
        }
        let mut observer = Self::inert(registry, Arc::default());
        observer.register();
        Ok(observer)
    }

    fn inert(registry: R, counters: Arc<Counters>) -> Self {
        DanglingPtrObserver {
            registry,
            counters,
            previous: HookSnapshot::default(),
        }
    }

    pub fn detected_count(&self) -> usize {
        self.counters.detected.load(Ordering::Relaxed)
    }

    pub fn released_count(&self) -> usize {
        self.counters.released.load(Ordering::Relaxed)
    }

    /// Whether this observer is the one currently receiving events.
    pub fn is_active(&self) -> bool {
        ACTIVE.holds(Arc::as_ptr(&self.counters))
    }

    /// Move the active role into a new observer.
    ///
    /// `self` restores the hooks it saved and becomes inert, keeping the
    /// counts it had reached. The returned observer registers fresh, saving
    /// the hooks installed at this point, and keeps counting from where
    /// `self` left off. Transferring from an inert observer returns another
    /// inert observer.
    pub fn transfer(&mut self) -> Self
    where
        R: Clone,
    {
        let was_active = self.is_active();
        self.unregister();

        let frozen = Arc::new(self.counters.frozen());
        let carried = core::mem::replace(&mut self.counters, frozen);
        let mut dest = Self::inert(self.registry.clone(), carried);
        if was_active {
            tracing::debug!(
                detected = dest.detected_count(),
                released = dest.released_count(),
                "transferring dangling pointer observer"
            );
            dest.register();
        }
        dest
    }

    /// Move-assign: give up whatever role `self` holds, then take over
    /// `source`'s as [`transfer`](Self::transfer) does.
    pub fn assign_from(&mut self, source: &mut Self)
    where
        R: Clone,
    {
        self.unregister();
        *self = source.transfer();
    }

    fn register(&mut self) {
        if !ACTIVE.publish(Arc::as_ptr(&self.counters)) {
            abort_with_message(DOUBLE_REGISTRATION);
        }

        // Published before the trampolines go in, so they never see an
        // empty slot.
        self.previous = self.registry.snapshot();
        self.registry.set_detected_fn(Some(count_detected));
        self.registry.set_released_fn(Some(count_released));
        tracing::debug!(
            had_previous_hooks = !self.previous.is_empty(),
            "dangling pointer observer registered"
        );
    }

    /// Stop receiving events and reinstall the saved hooks. Does nothing if
    /// this observer is not the active one.
    pub fn unregister(&mut self) {
        let counters = Arc::as_ptr(&self.counters);
        if !ACTIVE.holds(counters) {
            return;
        }

        // Hooks first: a trampoline already read from a slot still finds
        // the counters published and counts normally.
        self.registry.restore(self.previous);
        ACTIVE.retract(counters);
        tracing::debug!(
            detected = self.detected_count(),
            released = self.released_count(),
            "dangling pointer observer unregistered"
        );
    }
}

impl<R: HookRegistry> Drop for DanglingPtrObserver<R> {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl<R: HookRegistry> core::fmt::Debug for DanglingPtrObserver<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DanglingPtrObserver")
            .field("detected", &self.detected_count())
            .field("released", &self.released_count())
            .field("active", &self.is_active())
            .finish()
    }
}

pub(crate) fn detected_trampoline() -> fn(usize) {
    count_detected
}

pub(crate) fn released_trampoline() -> fn(usize) {
    count_released
}

pub(crate) fn has_active_observer() -> bool {
    ACTIVE.is_occupied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::LocalHooks;
    use serial_test::serial;

    fn observe(hooks: &LocalHooks) -> DanglingPtrObserver<&LocalHooks> {
        DanglingPtrObserver::create_with(&BuildConfig::supported(), hooks)
            .expect("supported config must create an observer")
    }

    fn noop(_: usize) {}

    #[test]
    #[serial]
    fn counts_each_event_kind_separately() {
        let hooks = LocalHooks::new();
        let observer = observe(&hooks);
        hooks.notify_detected(0x10);
        hooks.notify_detected(0x20);
        hooks.notify_released(0x10);
        assert_eq!(observer.detected_count(), 2);
        assert_eq!(observer.released_count(), 1);
    }

    #[test]
    #[serial]
    fn installs_trampolines_and_restores_on_drop() {
        let hooks = LocalHooks::new();
        hooks.set_released_fn(Some(noop));
        let before = hooks.snapshot();
        {
            let observer = observe(&hooks);
            assert!(observer.is_active());
            assert_eq!(
                hooks.snapshot(),
                HookSnapshot {
                    detected: Some(detected_trampoline()),
                    released: Some(released_trampoline()),
                }
            );
        }
        assert_eq!(hooks.snapshot(), before);
        assert!(!has_active_observer());
    }

    #[test]
    #[serial]
    fn unregister_is_idempotent() {
        let hooks = LocalHooks::new();
        let mut observer = observe(&hooks);
        observer.unregister();
        assert!(!observer.is_active());
        assert!(hooks.snapshot().is_empty());

        // Something else owns the slots now; a second unregister must not
        // clobber them.
        hooks.set_detected_fn(Some(noop));
        observer.unregister();
        drop(observer);
        assert_eq!(hooks.detected_fn().map(|f| f as usize), Some(noop as usize));
    }

    #[test]
    #[serial]
    fn plain_move_keeps_registration() {
        let hooks = LocalHooks::new();
        let observer = observe(&hooks);
        hooks.notify_detected(0x1);
        let boxed = Box::new(observer);
        hooks.notify_detected(0x2);
        assert!(boxed.is_active());
        assert_eq!(boxed.detected_count(), 2);
    }

    /// Hook pair that reports an event and queries the active observer from
    /// inside its own setters, the way an allocator-backed registry might.
    #[derive(Default)]
    struct EchoingHooks {
        inner: LocalHooks,
        active_seen_on_install: AtomicUsize,
    }

    impl HookRegistry for EchoingHooks {
        fn detected_fn(&self) -> Option<crate::hooks::DetectedFn> {
            self.inner.detected_fn()
        }

        fn set_detected_fn(&self, f: Option<crate::hooks::DetectedFn>) {
            self.inner.set_detected_fn(f);
            if has_active_observer() {
                self.active_seen_on_install.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn released_fn(&self) -> Option<crate::hooks::ReleasedFn> {
            self.inner.released_fn()
        }

        fn set_released_fn(&self, f: Option<crate::hooks::ReleasedFn>) {
            self.inner.set_released_fn(f);
            self.inner.notify_released(0x7000);
        }
    }

    #[test]
    #[serial]
    fn registry_callouts_may_reenter_the_observer() {
        let hooks = EchoingHooks::default();
        let mut observer = DanglingPtrObserver::create_with(&BuildConfig::supported(), &hooks)
            .expect("supported config must create an observer");

        // Installing the released trampoline immediately delivered one event.
        assert_eq!(observer.released_count(), 1);
        assert_eq!(hooks.active_seen_on_install.load(Ordering::SeqCst), 1);

        // Restoring runs with the observer still published, so the same
        // callouts neither block nor abort.
        observer.unregister();
        assert!(!observer.is_active());
        assert!(hooks.inner.snapshot().is_empty());
        assert_eq!(hooks.active_seen_on_install.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[serial]
    fn refused_config_touches_nothing() {
        let hooks = LocalHooks::new();
        hooks.set_detected_fn(Some(noop));
        let before = hooks.snapshot();
        let config = BuildConfig {
            dangling_checks: false,
            ..BuildConfig::supported()
        };
        let err = DanglingPtrObserver::create_with(&config, &hooks).unwrap_err();
        assert_eq!(err, crate::ObserverError::DanglingChecksDisabled);
        assert_eq!(hooks.snapshot(), before);
        assert!(!has_active_observer());
    }
}
