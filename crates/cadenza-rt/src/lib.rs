#![cfg_attr(not(test), warn(clippy::pedantic))]
//! Thread hygiene for Cadenza's realtime paths.
//!
//! Nothing in here allocates. Backends call [`prepare_process_thread`] once on
//! every thread that will invoke the engine's process callback; the engine
//! wraps each cycle in a [`CycleScope`] so that cycle-only operations can tell
//! whether they are running inside one.

use std::cell::Cell;
use std::io;

thread_local! {
    static PROCESS_THREAD: Cell<bool> = const { Cell::new(false) };
    static IN_CYCLE: Cell<bool> = const { Cell::new(false) };
}

/// Enables flush-to-zero and denormals-are-zero on supported CPUs.
#[inline]
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn enable_ftz_daz() {
    unsafe {
        #[cfg(target_arch = "x86")]
        use std::arch::x86::{_mm_getcsr, _mm_setcsr};
        #[cfg(target_arch = "x86_64")]
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};

        const FTZ: u32 = 1 << 15;
        const DAZ: u32 = 1 << 6;
        let csr = _mm_getcsr();
        _mm_setcsr(csr | FTZ | DAZ);
    }
}

/// No-op implementation for non x86/x86_64 targets.
#[inline]
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn enable_ftz_daz() {}

/// Pins the current process's address space into RAM to avoid major page faults
/// during realtime processing. On platforms where this is not supported the
/// call becomes a no-op.
#[cfg(target_os = "linux")]
pub fn mlock_process() -> io::Result<()> {
    unsafe {
        let flags = libc::MCL_CURRENT | libc::MCL_FUTURE;
        if libc::mlockall(flags) != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                // Insufficient permissions. Running without locked memory is
                // still acceptable so treat this as success.
                return Ok(());
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mlock_process() -> io::Result<()> {
    Ok(())
}

/// Moves the calling thread into the `SCHED_FIFO` class with the given
/// priority, clamped to the range the scheduler accepts.
#[cfg(target_os = "linux")]
pub fn promote_current_thread(priority: i32) -> io::Result<()> {
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let param = libc::sched_param {
            sched_priority: priority.clamp(min, max),
        };
        let rc = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn promote_current_thread(_priority: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "realtime scheduling is only implemented for linux",
    ))
}

/// Marks the calling thread as one that runs engine cycles and flushes
/// denormals. When `priority` is given the thread is also promoted to
/// `SCHED_FIFO`; a failed promotion is returned but the thread stays marked.
pub fn prepare_process_thread(priority: Option<i32>) -> io::Result<()> {
    enable_ftz_daz();
    mark_process_thread();
    match priority {
        Some(priority) => promote_current_thread(priority),
        None => Ok(()),
    }
}

#[inline]
pub fn mark_process_thread() {
    PROCESS_THREAD.with(|flag| flag.set(true));
}

#[inline]
pub fn unmark_process_thread() {
    PROCESS_THREAD.with(|flag| flag.set(false));
}

/// Whether [`mark_process_thread`] ran on the calling thread.
#[inline]
#[must_use]
pub fn is_process_thread() -> bool {
    PROCESS_THREAD.with(Cell::get)
}

/// Whether the calling thread is currently inside a [`CycleScope`].
#[inline]
#[must_use]
pub fn in_cycle() -> bool {
    IN_CYCLE.with(Cell::get)
}

/// Marks the calling thread as executing a process cycle until dropped.
///
/// Scopes nest: an inner scope leaves the flag as the outer scope found it.
pub struct CycleScope {
    previous: bool,
}

impl CycleScope {
    #[inline]
    #[must_use]
    pub fn enter() -> Self {
        let previous = IN_CYCLE.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for CycleScope {
    #[inline]
    fn drop(&mut self) {
        let previous = self.previous;
        IN_CYCLE.with(|flag| flag.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_thread_marker_is_thread_local() {
        mark_process_thread();
        assert!(is_process_thread());

        let other = std::thread::spawn(is_process_thread).join().unwrap();
        assert!(!other);

        unmark_process_thread();
        assert!(!is_process_thread());
    }

    #[test]
    fn cycle_scope_restores_previous_state() {
        assert!(!in_cycle());
        {
            let _outer = CycleScope::enter();
            assert!(in_cycle());
            {
                let _inner = CycleScope::enter();
                assert!(in_cycle());
            }
            assert!(in_cycle());
        }
        assert!(!in_cycle());
    }

    #[test]
    fn prepare_without_priority_marks_thread() {
        let marked = std::thread::spawn(|| {
            prepare_process_thread(None).unwrap();
            is_process_thread()
        })
        .join()
        .unwrap();
        assert!(marked);
    }
}
