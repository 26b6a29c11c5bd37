//! Cadenza Engine
//! ==============
//! Engine core of the Cadenza workstation: selects an audio backend, owns its
//! lifecycle, dispatches every process cycle to the attached session, reacts
//! to hardware notifications, and measures round-trip loopback latency.

#![cfg_attr(not(test), warn(clippy::pedantic))]
#![allow(clippy::module_name_repetitions, clippy::cast_possible_truncation, clippy::cast_precision_loss)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hw_events;
pub mod latency;
pub mod metrics;
pub mod ports;
pub mod session;

pub use backend::registry::BackendRegistry;
pub use backend::{
    AudioBackend, BackendCapabilities, BackendDescriptor, BackendDiscovery, BackendFactory,
    BackendHost, BuiltinBackends, DeviceStatus, DiscoveryFailure, StreamConfig, TransportState,
};
pub use config::{EngineConfig, LatencyConfig};
pub use engine::{instance, ActiveBackend, AudioEngine};
pub use error::{CycleFailure, EngineError, EngineResult};
pub use events::{EngineEvent, EventFilter, EventKind};
pub use latency::{LatencyMode, LatencyStatus, MeasurementKind};
pub use metrics::CycleMetrics;
pub use ports::{
    DataType, LatencyRange, MidiBuffer, MidiEvent, NoopPortManager, PortDirection, PortEngine,
    PortHandle, PortManager,
};
pub use session::Session;
