use thiserror::Error;

/// Errors reported by the engine's control surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("could not connect to engine backend")]
    NoBackendAvailable,
    #[error("backend '{0}' is not registered")]
    BackendNotFound(String),
    #[error("failed to instantiate backend '{name}': {reason}")]
    BackendInstantiationFailed { name: String, reason: String },
    #[error("backend rejected {setting}: {reason}")]
    BackendRejected {
        setting: &'static str,
        reason: String,
    },
    #[error("operation requires the engine to be stopped")]
    EngineRunning,
    #[error("a latency measurement is already in progress")]
    LatencyMeasurementInProgress,
    #[error("latency measurement ports have not been configured")]
    LatencyPortsNotConfigured,
    #[error("port operation failed: {0}")]
    Port(String),
    #[error("an engine instance already exists")]
    AlreadyCreated,
    #[error("backend discovery unavailable: {0}")]
    DiscoveryUnavailable(String),
    #[error("operation is only valid inside a process cycle")]
    NotInProcessThread,
    #[error("split offset {offset} exceeds the {remaining} frames left in this cycle")]
    InvalidSplitOffset { offset: u32, remaining: u32 },
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(String),
    #[error("{0} thread(s) panicked")]
    ThreadPanicked(usize),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn rejected(setting: &'static str, err: &anyhow::Error) -> Self {
        EngineError::BackendRejected {
            setting,
            reason: format!("{err:#}"),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Returned from the process callback when a cycle could not be completed.
///
/// Carries no heap data so it can be produced on the realtime thread.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CycleFailure {
    #[error("session processing failed")]
    Session,
    #[error("latency detector could not access its ports")]
    DetectorPorts,
}
