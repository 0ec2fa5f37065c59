//! Allocator hook slots for dangling checked-pointer events.
//!
//! The allocator reports two events through function-pointer slots: a
//! checked pointer was still alive when its pointee was freed ("detected"),
//! and such a pointer was later released ("released"). Each slot holds at
//! most one function, stored as a raw address so it can be swapped
//! atomically from any thread (0 = no hook).
//!
//! [`HookRegistry`] abstracts over where the slots live. [`GlobalHooks`]
//! binds to the process-wide slots the allocator calls; [`LocalHooks`] owns
//! its own pair and is what unit tests use.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Called with the address of an object freed while a checked pointer to it
/// was still alive.
pub type DetectedFn = fn(usize);

/// Called with the address of an object whose dangling checked pointer was
/// released.
pub type ReleasedFn = fn(usize);

/// One atomically swappable function-pointer slot.
pub struct HookSlot {
    func: AtomicUsize,
}

impl HookSlot {
    pub const fn new() -> Self {
        Self {
            func: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn load(&self) -> Option<fn(usize)> {
        let f = self.func.load(Ordering::Acquire);
        if f == 0 {
            return None;
        }
        // SAFETY: non-zero values are only ever written by `store` from a
        // valid `fn(usize)`.
        Some(unsafe { core::mem::transmute::<usize, fn(usize)>(f) })
    }

    #[inline]
    pub fn store(&self, f: Option<fn(usize)>) {
        self.func
            .store(f.map_or(0, |f| f as usize), Ordering::Release);
    }
}

impl Default for HookSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for HookSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HookSlot({:#x})", self.func.load(Ordering::Relaxed))
    }
}

/// The contents of both slots at one instant.
///
/// Two snapshots are equal when they name the same functions.
#[derive(Clone, Copy, Debug, Default)]
pub struct HookSnapshot {
    pub detected: Option<DetectedFn>,
    pub released: Option<ReleasedFn>,
}

impl HookSnapshot {
    pub fn is_empty(&self) -> bool {
        self.detected.is_none() && self.released.is_none()
    }

    fn addrs(&self) -> (usize, usize) {
        (
            self.detected.map_or(0, |f| f as usize),
            self.released.map_or(0, |f| f as usize),
        )
    }
}

impl PartialEq for HookSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.addrs() == other.addrs()
    }
}

impl Eq for HookSnapshot {}

/// Read/write access to a detected/released hook pair.
pub trait HookRegistry {
    fn detected_fn(&self) -> Option<DetectedFn>;
    fn set_detected_fn(&self, f: Option<DetectedFn>);
    fn released_fn(&self) -> Option<ReleasedFn>;
    fn set_released_fn(&self, f: Option<ReleasedFn>);

    fn snapshot(&self) -> HookSnapshot {
        HookSnapshot {
            detected: self.detected_fn(),
            released: self.released_fn(),
        }
    }

    fn restore(&self, snapshot: HookSnapshot) {
        self.set_detected_fn(snapshot.detected);
        self.set_released_fn(snapshot.released);
    }

    /// Allocator side: report a detected dangling pointer to the installed hook.
    fn notify_detected(&self, addr: usize) {
        if let Some(f) = self.detected_fn() {
            f(addr);
        }
    }

    /// Allocator side: report a released dangling pointer to the installed hook.
    fn notify_released(&self, addr: usize) {
        if let Some(f) = self.released_fn() {
            f(addr);
        }
    }
}

impl<T: HookRegistry + ?Sized> HookRegistry for &T {
    fn detected_fn(&self) -> Option<DetectedFn> {
        (**self).detected_fn()
    }

    fn set_detected_fn(&self, f: Option<DetectedFn>) {
        (**self).set_detected_fn(f)
    }

    fn released_fn(&self) -> Option<ReleasedFn> {
        (**self).released_fn()
    }

    fn set_released_fn(&self, f: Option<ReleasedFn>) {
        (**self).set_released_fn(f)
    }
}

impl<T: HookRegistry + ?Sized> HookRegistry for Arc<T> {
    fn detected_fn(&self) -> Option<DetectedFn> {
        (**self).detected_fn()
    }

    fn set_detected_fn(&self, f: Option<DetectedFn>) {
        (**self).set_detected_fn(f)
    }

    fn released_fn(&self) -> Option<ReleasedFn> {
        (**self).released_fn()
    }

    fn set_released_fn(&self, f: Option<ReleasedFn>) {
        (**self).set_released_fn(f)
    }
}

// ============================================================================
// Process-wide slots
// ============================================================================

static DETECTED_FN: HookSlot = HookSlot::new();
static RELEASED_FN: HookSlot = HookSlot::new();

pub fn dangling_raw_ptr_detected_fn() -> Option<DetectedFn> {
    DETECTED_FN.load()
}

pub fn set_dangling_raw_ptr_detected_fn(f: Option<DetectedFn>) {
    DETECTED_FN.store(f);
}

pub fn dangling_raw_ptr_released_fn() -> Option<ReleasedFn> {
    RELEASED_FN.load()
}

pub fn set_dangling_raw_ptr_released_fn(f: Option<ReleasedFn>) {
    RELEASED_FN.store(f);
}

/// Invoked by the allocator when it frees an object that a checked pointer
/// still refers to.
#[inline]
pub fn notify_dangling_raw_ptr_detected(addr: usize) {
    if let Some(f) = DETECTED_FN.load() {
        f(addr);
    }
}

/// Invoked by the allocator when a checked pointer flagged as dangling is
/// released.
#[inline]
pub fn notify_dangling_raw_ptr_released(addr: usize) {
    if let Some(f) = RELEASED_FN.load() {
        f(addr);
    }
}

/// The process-wide hook slots.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalHooks;

impl HookRegistry for GlobalHooks {
    fn detected_fn(&self) -> Option<DetectedFn> {
        dangling_raw_ptr_detected_fn()
    }

    fn set_detected_fn(&self, f: Option<DetectedFn>) {
        set_dangling_raw_ptr_detected_fn(f)
    }

    fn released_fn(&self) -> Option<ReleasedFn> {
        dangling_raw_ptr_released_fn()
    }

    fn set_released_fn(&self, f: Option<ReleasedFn>) {
        set_dangling_raw_ptr_released_fn(f)
    }
}

/// A hook pair owned by the caller instead of the process.
#[derive(Debug, Default)]
pub struct LocalHooks {
    detected: HookSlot,
    released: HookSlot,
}

impl LocalHooks {
    pub const fn new() -> Self {
        Self {
            detected: HookSlot::new(),
            released: HookSlot::new(),
        }
    }
}

impl HookRegistry for LocalHooks {
    fn detected_fn(&self) -> Option<DetectedFn> {
        self.detected.load()
    }

    fn set_detected_fn(&self, f: Option<DetectedFn>) {
        self.detected.store(f)
    }

    fn released_fn(&self) -> Option<ReleasedFn> {
        self.released.load()
    }

    fn set_released_fn(&self, f: Option<ReleasedFn>) {
        self.released.store(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    static LAST_ADDR: AtomicUsize = AtomicUsize::new(0);

    fn record(addr: usize) {
        LAST_ADDR.store(addr, Ordering::SeqCst);
    }

    fn other(_: usize) {}

    #[test]
    fn empty_slot_loads_none() {
        let hooks = LocalHooks::new();
        assert!(hooks.detected_fn().is_none());
        assert!(hooks.released_fn().is_none());
        assert!(hooks.snapshot().is_empty());
    }

    #[test]
    fn notify_without_hook_is_a_no_op() {
        let hooks = LocalHooks::new();
        hooks.notify_detected(0x1000);
        hooks.notify_released(0x1000);
    }

    #[test]
    #[serial(hook_record)]
    fn notify_calls_installed_hook() {
        let hooks = LocalHooks::new();
        hooks.set_released_fn(Some(record));
        hooks.notify_released(0xbeef);
        assert_eq!(LAST_ADDR.load(Ordering::SeqCst), 0xbeef);
        // The other slot is independent.
        hooks.notify_detected(0x1);
        assert_eq!(LAST_ADDR.load(Ordering::SeqCst), 0xbeef);
    }

    #[test]
    fn snapshot_restore() {
        let hooks = LocalHooks::new();
        hooks.set_detected_fn(Some(record));
        let before = hooks.snapshot();

        hooks.set_detected_fn(Some(other));
        hooks.set_released_fn(Some(other));
        assert_ne!(hooks.snapshot(), before);

        hooks.restore(before);
        assert_eq!(hooks.snapshot(), before);
        assert!(hooks.released_fn().is_none());
    }

    #[test]
    fn registry_forwards_through_references() {
        let hooks = Arc::new(LocalHooks::new());
        let by_ref: &LocalHooks = &hooks;
        by_ref.set_detected_fn(Some(other));
        assert_eq!(hooks.snapshot(), by_ref.snapshot());
        hooks.set_detected_fn(None);
        assert!(by_ref.detected_fn().is_none());
    }

    #[test]
    #[serial]
    fn global_slots_round_trip() {
        let saved = GlobalHooks.snapshot();
        set_dangling_raw_ptr_detected_fn(Some(other));
        assert_eq!(GlobalHooks.detected_fn().map(|f| f as usize), Some(other as usize));
        GlobalHooks.restore(saved);
        assert_eq!(GlobalHooks.snapshot(), saved);
    }
}
