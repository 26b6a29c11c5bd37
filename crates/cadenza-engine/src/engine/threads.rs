use std::thread;

use super::AudioEngine;
use crate::error::{EngineError, EngineResult};

impl AudioEngine {
    /// Spawns a helper thread with process-thread scheduling. The thread is
    /// joined by `join_process_threads` or when the engine is dropped.
    pub fn create_process_thread<F>(&self, name: &str, f: F) -> EngineResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let priority = self.config.process_thread_priority;
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                if let Err(err) = cadenza_rt::prepare_process_thread(priority) {
                    tracing::warn!(%err, ?priority, "process thread runs without realtime scheduling");
                }
                f();
            })
            .map_err(|err| EngineError::ThreadSpawn(err.to_string()))?;
        self.process_threads.lock().push(handle);
        Ok(())
    }

    /// Joins every thread created with `create_process_thread`.
    pub fn join_process_threads(&self) -> EngineResult<()> {
        let handles: Vec<_> = self.process_threads.lock().drain(..).collect();
        let current = thread::current().id();
        let mut panicked = 0;
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            tracing::error!(panicked, "process threads panicked");
            return Err(EngineError::ThreadPanicked(panicked));
        }
        Ok(())
    }

    pub fn process_thread_count(&self) -> usize {
        self.process_threads.lock().len()
    }

    /// Whether the caller runs on a thread the engine processes audio on.
    pub fn in_process_thread(&self) -> bool {
        cadenza_rt::is_process_thread()
    }
}
