//! Coalescing workers for hardware notifications.
//!
//! Requests only bump a counter and wake the worker, so they are cheap enough
//! for a driver's notification thread. The worker swaps the counter to zero
//! before each pass: any number of requests that arrive before a pass starts
//! are served by that one pass, and a request that arrives during a pass
//! triggers exactly one more.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{EngineError, EngineResult};

#[derive(Default)]
pub struct CoalescingSignal {
    pending: AtomicU32,
    passes: AtomicU64,
    stop: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl CoalescingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _guard = self.lock.lock();
        self.wake.notify_one();
    }

    /// Requests not yet picked up by a pass.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Passes completed since the signal was created.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.wake.notify_all();
    }
}

/// A named thread serving one [`CoalescingSignal`].
pub struct CoalescingWorker {
    signal: Arc<CoalescingSignal>,
    handle: Option<JoinHandle<()>>,
}

impl CoalescingWorker {
    /// Spawns the worker. `action` receives the number of requests the pass
    /// covers; returning `false` ends the worker.
    pub fn spawn<F>(name: &str, signal: Arc<CoalescingSignal>, mut action: F) -> EngineResult<Self>
    where
        F: FnMut(u32) -> bool + Send + 'static,
    {
        signal.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut guard = shared.lock.lock();
                loop {
                    if shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                    let observed = shared.pending.swap(0, Ordering::AcqRel);
                    if observed > 0 {
                        let keep_going = MutexGuard::unlocked(&mut guard, || action(observed));
                        shared.passes.fetch_add(1, Ordering::AcqRel);
                        if !keep_going {
                            break;
                        }
                        continue;
                    }
                    shared.wake.wait(&mut guard);
                }
            })
            .map_err(|err| EngineError::ThreadSpawn(err.to_string()))?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub fn signal(&self) -> &Arc<CoalescingSignal> {
        &self.signal
    }

    /// Stops the worker and waits for it unless called from the worker
    /// itself.
    pub fn stop(&mut self) {
        self.signal.shutdown();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        let name = handle.thread().name().unwrap_or("worker").to_owned();
        if let Err(err) = handle.join() {
            tracing::error!(?err, worker = %name, "hardware event worker panicked");
        }
    }
}

impl Drop for CoalescingWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[test]
    fn burst_before_wake_is_served_once() {
        let signal = Arc::new(CoalescingSignal::new());
        for _ in 0..5 {
            signal.request();
        }
        let (tx, rx) = unbounded();
        let worker = CoalescingWorker::spawn("coalesce-test", Arc::clone(&signal), move |n| {
            tx.send(n).is_ok()
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(5));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(signal.pending(), 0);
        drop(worker);
        assert_eq!(signal.passes(), 1);
    }

    #[test]
    fn request_during_pass_triggers_one_more() {
        let signal = Arc::new(CoalescingSignal::new());
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let (done_tx, done_rx) = unbounded();
        let _worker = CoalescingWorker::spawn("coalesce-busy", Arc::clone(&signal), move |n| {
            let _ = entered_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(2));
            done_tx.send(n).is_ok()
        })
        .unwrap();

        signal.request();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        signal.request();
        signal.request();
        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(1));
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(2));
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn stop_ends_an_idle_worker() {
        let signal = Arc::new(CoalescingSignal::new());
        let mut worker = CoalescingWorker::spawn("coalesce-idle", signal, |_| true).unwrap();
        worker.stop();
        assert!(worker.handle.is_none());
    }
}
