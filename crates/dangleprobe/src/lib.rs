//! Test instrumentation for the allocator's dangling checked-pointer checks.
//!
//! The allocator reports two events through process-wide hooks: an object
//! was freed while a checked pointer still referred to it, and such a
//! dangling pointer was later released. [`DanglingPtrObserver`] takes over
//! both hooks for its lifetime and counts what arrives, so a test can assert
//! on exactly how many dangling pointers a scenario produced.
//!
//! ```no_run
//! use dangleprobe::DanglingPtrObserver;
//!
//! let Ok(observer) = DanglingPtrObserver::create() else {
//!     return; // checks are not available in this build
//! };
//! // ... exercise the code under test ...
//! assert_eq!(observer.detected_count(), 0);
//! assert_eq!(observer.released_count(), 0);
//! ```

pub mod config;
pub mod error;
pub mod fatal;
pub mod hooks;
pub mod observer;
mod sync;

pub use config::BuildConfig;
pub use error::{ObserverError, Result};
pub use hooks::{GlobalHooks, HookRegistry, HookSnapshot, LocalHooks};
pub use observer::DanglingPtrObserver;

/// Internals exposed for this crate's integration tests.
#[doc(hidden)]
pub mod __test_support {
    /// The function the observer installs in the detected slot.
    pub fn detected_trampoline() -> fn(usize) {
        crate::observer::detected_trampoline()
    }

    /// The function the observer installs in the released slot.
    pub fn released_trampoline() -> fn(usize) {
        crate::observer::released_trampoline()
    }

    pub fn has_active_observer() -> bool {
        crate::observer::has_active_observer()
    }
}
