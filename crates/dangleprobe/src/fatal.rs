//! Fail-fast path for broken observer invariants.
//!
//! A second registration or an event with nobody listening means the counts
//! a test is about to assert on are already wrong. Unwinding could let the
//! test carry on, so these paths abort the process instead.

/// Print `msg` on stderr and abort.
///
/// Reachable from the hook trampolines, which run while the allocator is
/// partway through a free. Only a raw `write(2)` is safe there: `eprintln!`
/// takes the stderr lock and may format into a heap buffer.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    let bytes = msg.as_bytes();
    // SAFETY: `bytes` stays borrowed for the length passed. A short or failed
    // write is ignored; the process ends on the next line either way.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
        libc::abort()
    }
}

pub(crate) const DOUBLE_REGISTRATION: &str =
    "dangleprobe: a DanglingPtrObserver is already registered\n";

pub(crate) const NO_ACTIVE_OBSERVER: &str =
    "dangleprobe: dangling pointer event delivered with no active observer\n";
