//! Process-wide engine slot for hosts that want a single shared engine.
//! `AudioEngine::new` remains available for everything else.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::AudioEngine;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

static INSTANCE: Lazy<Mutex<Option<Arc<AudioEngine>>>> = Lazy::new(|| Mutex::new(None));

/// Creates the shared engine. Fails if one already exists.
pub fn create(config: EngineConfig) -> EngineResult<Arc<AudioEngine>> {
    let mut slot = INSTANCE.lock();
    if slot.is_some() {
        return Err(EngineError::AlreadyCreated);
    }
    let engine = AudioEngine::new(config)?;
    *slot = Some(Arc::clone(&engine));
    Ok(engine)
}

pub fn get() -> Option<Arc<AudioEngine>> {
    INSTANCE.lock().clone()
}

/// Stops and releases the shared engine. Returns `false` if none existed.
pub fn destroy() -> bool {
    let Some(engine) = INSTANCE.lock().take() else {
        return false;
    };
    if let Err(err) = engine.drop_backend() {
        tracing::error!(%err, "failed to stop the shared engine");
    }
    engine.stop_hw_event_processing();
    if let Err(err) = engine.join_process_threads() {
        tracing::error!(%err, "shared engine threads did not exit cleanly");
    }
    tracing::debug!("shared engine destroyed");
    true
}
